use frankenengine_serializer::{
    EngineConfig, JsValue, Realm, SerializeOptions, SerializedValue,
};

fn realm() -> Realm {
    Realm::new(EngineConfig::default()).expect("realm")
}

#[test]
fn builtins_travel_as_paths_and_land_on_the_local_builtin() {
    let mut origin = realm();
    let math = origin.get_global("Math").expect("Math");
    let envelope = origin.serialize(&math, SerializeOptions::default()).expect("serialize");
    assert!(envelope.heap.is_empty());
    assert_eq!(
        envelope.serialized,
        SerializedValue::HostObject {
            path: r#"globalThis["Math"]"#.into()
        }
    );

    let mut target = realm();
    let copy = target.deserialize(&envelope).expect("deserialize");
    target.set_global("copy", copy).expect("bind");
    assert_eq!(target.eval_script("copy === Math").expect("check"), JsValue::Bool(true));
}

#[test]
fn registered_roots_keep_identity_in_the_same_realm() {
    let mut realm = realm();
    let app = realm
        .eval_script("globalThis.app = { settings: { theme: 'dark' } }; app")
        .expect("eval");
    let recorded = realm
        .register_host_root(&app, r#"globalThis["app"]"#)
        .expect("register");
    assert_eq!(recorded, 2);

    let holder = realm.eval_script("({ s: app.settings })").expect("eval");
    let envelope = realm.serialize(&holder, SerializeOptions::default()).expect("serialize");
    assert_eq!(envelope.heap.len(), 1);
    let copy = realm.deserialize(&envelope).expect("deserialize");
    realm.set_global("copy", copy).expect("bind");
    assert_eq!(
        realm.eval_script("copy.s === app.settings").expect("check"),
        JsValue::Bool(true)
    );
}

#[test]
fn stop_mode_drops_script_functions_under_a_host_path() {
    let mut realm = realm();
    let root = realm
        .eval_instrumented("({ data: [1, 2], run: () => 1, label: 'kept' })")
        .expect("eval");
    let options = SerializeOptions {
        host_object_path: Some(r#"globalThis["state"]"#.into()),
        stop_if_unreachable_from_host: true,
        ..SerializeOptions::default()
    };
    let envelope = realm.serialize(&root, options).expect("serialize");
    let entry = &envelope.heap[envelope.serialized.reference().expect("root")];
    let run = entry
        .own_properties
        .iter()
        .find(|(key, _)| *key == SerializedValue::simple("run"))
        .and_then(|(_, desc)| desc.value.clone())
        .expect("run");
    assert_eq!(run, SerializedValue::ManualStop);

    let copy = realm.deserialize(&envelope).expect("deserialize");
    realm.set_global("copy", copy).expect("bind");
    assert_eq!(
        realm
            .eval_script("copy.run === undefined && copy.data[1] === 2 && copy.label === 'kept'")
            .expect("check"),
        JsValue::Bool(true)
    );
}

#[test]
fn every_operation_leaves_an_event() {
    let config = EngineConfig {
        trace_id: "trace-events".into(),
        ..EngineConfig::default()
    };
    let mut realm = Realm::new(config).expect("realm");
    realm.drain_events();

    let value = realm.eval_instrumented("const k = 3; () => k").expect("eval");
    let envelope = realm.serialize(&value, SerializeOptions::default()).expect("serialize");
    realm.deserialize(&envelope).expect("deserialize");

    let events = realm.drain_events();
    let names: Vec<(&str, &str)> = events
        .iter()
        .map(|event| (event.component.as_str(), event.event.as_str()))
        .collect();
    assert_eq!(
        names,
        vec![
            ("transpiler", "instrument"),
            ("serializer", "serialize"),
            ("deserializer", "deserialize"),
        ]
    );
    assert!(events.iter().all(|event| event.trace_id == "trace-events"));
    assert!(events.iter().all(|event| event.outcome == "allow"));
    assert!(events.windows(2).all(|pair| pair[0].seq < pair[1].seq));
    assert!(realm.events().is_empty());
}

#[test]
fn failures_are_logged_with_their_code() {
    let mut realm = realm();
    let err = realm.eval_instrumented("const = 1").expect_err("syntax error");
    assert_eq!(err.stable_code(), "FE-SER-4001");
    let last = realm.events().last().expect("event");
    assert_eq!(last.component, "transpiler");
    assert_eq!(last.outcome, "deny");
    assert_eq!(last.error_code, "FE-SER-4001");
}

#[test]
fn wrapping_mode_checks_values_as_they_are_built() {
    let config = EngineConfig {
        wrap_expressions: true,
        ..EngineConfig::default()
    };
    let mut realm = Realm::new(config).expect("realm");
    let value = realm
        .eval_instrumented("const base = { n: 2 };\nconst twice = (x) => x * base.n;\ntwice(21)")
        .expect("eval");
    assert_eq!(value, JsValue::Number(42.0));
    let checks = realm
        .events()
        .iter()
        .filter(|event| event.component == "verify" && event.event == "ensure_serializable")
        .count();
    assert!(checks > 0);
    assert!(
        realm
            .events()
            .iter()
            .filter(|event| event.component == "verify")
            .all(|event| event.outcome == "allow")
    );
}

#[test]
fn set_elements_under_a_root_travel_by_path() {
    let mut realm = realm();
    let app = realm
        .eval_script("globalThis.app = { tags: new Set(['x', { id: 7 }]) }; app")
        .expect("eval");
    realm
        .register_host_root(&app, r#"globalThis["app"]"#)
        .expect("register");

    let element = realm.eval_script("[...app.tags][1]").expect("element");
    let envelope = realm.serialize(&element, SerializeOptions::default()).expect("serialize");
    assert!(envelope.heap.is_empty());
    assert_eq!(
        envelope.serialized,
        SerializedValue::HostObject {
            path: r#"[...globalThis["app"]["tags"].values()][1]"#.into()
        }
    );
    let copy = realm.deserialize(&envelope).expect("deserialize");
    assert_eq!(copy, element);
}
