use frankenengine_serializer::{EngineConfig, Envelope, JsValue, Realm, SerializeOptions};

fn realm() -> Realm {
    Realm::new(EngineConfig::default()).expect("realm")
}

/// Run `source` instrumented, serialize its completion value to JSON text
/// and rebuild it in a fresh realm bound to the global `copy`.
fn resume_elsewhere(source: &str) -> Realm {
    let mut origin = realm();
    let value = origin.eval_instrumented(source).expect("eval");
    let text = origin
        .serialize(&value, SerializeOptions::default())
        .expect("serialize")
        .to_json_string()
        .expect("json");
    let mut target = realm();
    let envelope = Envelope::from_json_str(&text).expect("parse");
    let copy = target.deserialize(&envelope).expect("deserialize");
    target.set_global("copy", copy).expect("bind");
    target
}

fn check(realm: &mut Realm, expression: &str) -> JsValue {
    realm.eval_script(expression).expect("check")
}

#[test]
fn counter_resumes_from_its_captured_state() {
    let mut target = resume_elsewhere("let count = 0; const inc = () => ++count; inc(); inc");
    assert_eq!(check(&mut target, "copy()"), JsValue::Number(2.0));
    assert_eq!(check(&mut target, "copy()"), JsValue::Number(3.0));
}

#[test]
fn captured_objects_come_along() {
    let mut target = resume_elsewhere(
        "const config = { greeting: 'hi', names: ['a', 'b'] };\n\
         const greet = (i) => config.greeting + ' ' + config.names[i];\n\
         greet",
    );
    assert_eq!(check(&mut target, "copy(1)"), JsValue::str("hi b"));
}

#[test]
fn recursive_declarations_call_themselves() {
    let mut target = resume_elsewhere("function fact(n) { return n <= 1 ? 1 : n * fact(n - 1); } fact");
    assert_eq!(check(&mut target, "copy(5)"), JsValue::Number(120.0));
}

#[test]
fn mutually_recursive_declarations_resolve_each_other() {
    let mut target = resume_elsewhere(
        "function isEven(n) { return n === 0 ? true : isOdd(n - 1); }\n\
         function isOdd(n) { return n === 0 ? false : isEven(n - 1); }\n\
         isEven",
    );
    assert_eq!(check(&mut target, "copy(10)"), JsValue::Bool(true));
    assert_eq!(check(&mut target, "copy(7)"), JsValue::Bool(false));
}

#[test]
fn functions_returned_from_functions_keep_both_scopes() {
    let mut target = resume_elsewhere(
        "const base = 100;\n\
         const adder = (x) => (y) => base + x + y;\n\
         adder(20)",
    );
    assert_eq!(check(&mut target, "copy(3)"), JsValue::Number(123.0));
}

#[test]
fn closures_created_after_resume_are_serializable_again() {
    let mut target = resume_elsewhere("let step = 2; const makeStepper = () => (v) => v + step; makeStepper");
    let stepper = check(&mut target, "copy()");
    let envelope = target
        .serialize(&stepper, SerializeOptions::default())
        .expect("nested closures were registered by the rebuilt source");
    let again = target.deserialize(&envelope).expect("deserialize");
    target.set_global("again", again).expect("bind");
    assert_eq!(check(&mut target, "again(40)"), JsValue::Number(42.0));
}

#[test]
fn object_methods_and_accessors_survive() {
    let mut target = resume_elsewhere(
        "let unit = 'px';\n\
         const box = { w: 3, area(h) { return this.w * h; }, get label() { return this.w + unit; } };\n\
         box",
    );
    assert_eq!(check(&mut target, "copy.area(2)"), JsValue::Number(6.0));
    assert_eq!(check(&mut target, "copy.label"), JsValue::str("3px"));
}

#[test]
fn arrows_keep_their_lexical_this() {
    let mut target = resume_elsewhere(
        "const owner = { name: 'owner', make() { return () => this.name; } };\n\
         owner.make()",
    );
    assert_eq!(check(&mut target, "copy()"), JsValue::str("owner"));
}

#[test]
fn uninstrumented_closures_are_refused() {
    let mut realm = realm();
    let value = realm.eval_script("let hidden = 1; () => hidden").expect("eval");
    let err = realm
        .serialize(&value, SerializeOptions::default())
        .expect_err("not instrumented");
    assert_eq!(err.stable_code(), "FE-SER-1001");
}

#[test]
fn scripts_can_drive_the_runtime_api() {
    let mut realm = realm();
    let value = realm
        .eval_instrumented(
            "let total = 10;\n\
             const add = (n) => total + n;\n\
             const snapshot = __SerializableJs.serialize(add);\n\
             const restored = __SerializableJs.deserialize(JSON.stringify(snapshot));\n\
             restored(5)",
        )
        .expect("eval");
    assert_eq!(value, JsValue::Number(15.0));
}

#[test]
fn declarations_serialize_before_their_line_runs() {
    let mut realm = realm();
    let value = realm
        .eval_instrumented(
            "const early = __SerializableJs.serialize(twice);\n\
             const restored = __SerializableJs.deserialize(JSON.stringify(early));\n\
             function twice(n) { return n * 2; }\n\
             restored(21)",
        )
        .expect("eval");
    assert_eq!(value, JsValue::Number(42.0));
}
