use frankenengine_serializer::{
    EngineConfig, Envelope, JsValue, PropertyDescriptor, PropertyKey, Realm, SerializeOptions,
    SerializedValue,
};

fn realm() -> Realm {
    Realm::new(EngineConfig::default()).expect("realm")
}

fn round_trip_into(realm: &mut Realm, source: &str) {
    let value = realm.eval_instrumented(source).expect("eval");
    let envelope = realm.serialize(&value, SerializeOptions::default()).expect("serialize");
    let copy = realm.deserialize(&envelope).expect("deserialize");
    realm.set_global("copy", copy).expect("bind");
}

fn truthy(realm: &mut Realm, expression: &str) {
    let value = realm.eval_script(expression).expect("check");
    assert_eq!(value, JsValue::Bool(true), "{expression}");
}

#[test]
fn hidden_and_readonly_properties_keep_their_flags() {
    let mut realm = realm();
    round_trip_into(
        &mut realm,
        "const o = { visible: 1 };\n\
         Object.defineProperty(o, 'secret', { value: 2, enumerable: false, writable: false, configurable: true });\n\
         o",
    );
    let copy = realm.get_global("copy").expect("copy");
    let handle = copy.as_object().expect("object");
    let desc = realm
        .heap()
        .get_own_property_descriptor(handle, &PropertyKey::from("secret"))
        .expect("lookup")
        .expect("present");
    assert!(matches!(
        desc,
        PropertyDescriptor::Data {
            value: JsValue::Number(n),
            writable: false,
            enumerable: false,
            configurable: true,
        } if n == 2.0
    ));
    truthy(&mut realm, "Object.keys(copy).join() === 'visible'");
}

#[test]
fn sealed_and_frozen_objects_stay_that_way() {
    let mut realm = realm();
    round_trip_into(&mut realm, "({ sealed: Object.seal({ a: 1 }), frozen: Object.freeze([1, 2]) })");
    truthy(&mut realm, "Object.isSealed(copy.sealed) && !Object.isFrozen(copy.sealed)");
    truthy(&mut realm, "Object.isFrozen(copy.frozen) && copy.frozen.length === 2");
}

#[test]
fn custom_prototypes_are_followed() {
    let mut realm = realm();
    round_trip_into(
        &mut realm,
        "const proto = { kind: 'base' };\n\
         const child = Object.create(proto);\n\
         child.own = true;\n\
         ({ proto, child, bare: Object.create(null) })",
    );
    truthy(&mut realm, "Object.getPrototypeOf(copy.child) === copy.proto && copy.child.kind === 'base'");
    truthy(&mut realm, "Object.getPrototypeOf(copy.bare) === null");
}

#[test]
fn collections_keep_order_and_identity() {
    let mut realm = realm();
    round_trip_into(
        &mut realm,
        "const shared = { n: 1 };\n\
         const m = new Map([['b', 1], ['a', shared]]);\n\
         const s = new Set([3, shared, 1]);\n\
         ({ m, s, shared })",
    );
    truthy(&mut realm, "copy.m.size === 2 && copy.m.get('a') === copy.shared");
    truthy(&mut realm, "copy.s.has(copy.shared) && copy.s.size === 3");
    let order = realm
        .eval_script("const keys = []; copy.m.forEach((v, k) => keys.push(k)); keys.join()")
        .expect("order");
    assert_eq!(order, JsValue::str("b,a"));
}

#[test]
fn dates_regexps_errors_and_wrappers() {
    let mut realm = realm();
    round_trip_into(
        &mut realm,
        "({ d: new Date(86400000), r: new RegExp('a+b', 'gi'), e: new RangeError('too far'),\n\
           n: new Number(4), s: new String('hi'), b: new Boolean(false) })",
    );
    truthy(&mut realm, "copy.d.getTime() === 86400000");
    truthy(&mut realm, "copy.r.source === 'a+b' && copy.r.flags === 'gi'");
    truthy(&mut realm, "copy.e instanceof RangeError && copy.e.message === 'too far'");
    truthy(&mut realm, "copy.n.valueOf() === 4 && copy.s.valueOf() === 'hi' && copy.b.valueOf() === false");
}

#[test]
fn binary_buffers_and_views_share_memory() {
    let mut realm = realm();
    round_trip_into(
        &mut realm,
        "const buf = new ArrayBuffer(4, { maxByteLength: 16 });\n\
         const view = new Uint8Array(buf, 1, 2);\n\
         view[0] = 7; view[1] = 255;\n\
         ({ buf, view })",
    );
    truthy(&mut realm, "copy.view.buffer === copy.buf && copy.view.byteOffset === 1 && copy.view.length === 2");
    truthy(&mut realm, "copy.view[0] === 7 && copy.view[1] === 255 && copy.buf.maxByteLength === 16");
    truthy(&mut realm, "copy.view[1] = 3, new Uint8Array(copy.buf)[2] === 3");
}

#[test]
fn settled_promises_keep_their_result() {
    let mut realm = realm();
    round_trip_into(&mut realm, "({ ok: Promise.resolve(1), bad: Promise.reject('no') })");
    let copy = realm.get_global("copy").expect("copy");
    let ok = realm.get(&copy, "ok").expect("ok");
    let bad = realm.get(&copy, "bad").expect("bad");
    assert_eq!(realm.display_value(&ok), "Promise { 1 }");
    assert!(realm.display_value(&bad).contains("no"));
}

#[test]
fn array_holes_and_extra_properties_survive() {
    let mut realm = realm();
    round_trip_into(&mut realm, "const a = [1, , 3]; a.label = 'x'; a");
    truthy(&mut realm, "copy.length === 3 && !(1 in copy) && copy[2] === 3 && copy.label === 'x'");
}

#[test]
fn the_wire_format_is_plain_json() {
    let mut realm = realm();
    let value = realm.eval_script("({ big: 2n ** 70n, neg: -0, list: [NaN] })").expect("eval");
    let envelope = realm.serialize(&value, SerializeOptions::default()).expect("serialize");
    envelope.check_json_safe().expect("json safe");
    let text = envelope.to_json_string().expect("json");
    let parsed: serde_json::Value = serde_json::from_str(&text).expect("valid json");
    assert!(parsed["heap"].is_object());
    let reparsed = Envelope::from_json_str(&text).expect("parse");
    assert_eq!(reparsed, envelope);
    assert_eq!(reparsed.content_hash().expect("hash"), envelope.content_hash().expect("hash"));

    let root = &envelope.heap[envelope.serialized.reference().expect("root")];
    let big = root.own_properties[0].1.value.clone().expect("value");
    assert_eq!(
        big,
        SerializedValue::Bigint {
            value_string: "1180591620717411303424".to_string()
        }
    );
}
