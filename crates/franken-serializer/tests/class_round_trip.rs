use frankenengine_serializer::{EngineConfig, Envelope, JsValue, Realm, SerializeOptions};

fn resume_elsewhere(source: &str) -> Realm {
    let mut origin = Realm::new(EngineConfig::default()).expect("realm");
    let value = origin.eval_instrumented(source).expect("eval");
    let envelope = origin
        .serialize(&value, SerializeOptions::default())
        .expect("serialize");
    let text = envelope.to_json_pretty().expect("json");
    let mut target = Realm::new(EngineConfig::default()).expect("realm");
    let copy = target
        .deserialize(&Envelope::from_json_str(&text).expect("parse"))
        .expect("deserialize");
    target.set_global("copy", copy).expect("bind");
    target
}

fn check(realm: &mut Realm, expression: &str) -> JsValue {
    realm.eval_script(expression).expect("check")
}

#[test]
fn instances_keep_their_class() {
    let mut target = resume_elsewhere(
        "class Point {\n\
           constructor(x, y) { this.x = x; this.y = y; }\n\
           norm() { return Math.abs(this.x) + Math.abs(this.y); }\n\
         }\n\
         new Point(3, -4)",
    );
    assert_eq!(check(&mut target, "copy.norm()"), JsValue::Number(7.0));
    assert_eq!(
        check(&mut target, "copy instanceof Object.getPrototypeOf(copy).constructor"),
        JsValue::Bool(true)
    );
    assert_eq!(
        check(&mut target, "new (Object.getPrototypeOf(copy).constructor)(1, 1).norm()"),
        JsValue::Number(2.0)
    );
}

#[test]
fn classes_capture_outer_bindings() {
    let mut target = resume_elsewhere(
        "const scale = 10;\n\
         class Meter { read(v) { return v * scale; } static unit() { return 'm' + scale; } }\n\
         Meter",
    );
    assert_eq!(check(&mut target, "new copy().read(2)"), JsValue::Number(20.0));
    assert_eq!(check(&mut target, "copy.unit()"), JsValue::str("m10"));
}

#[test]
fn subclasses_reach_their_parent() {
    let mut target = resume_elsewhere(
        "class Base { hi() { return 'b'; } }\n\
         class Derived extends Base { hi() { return 'd' + super.hi(); } }\n\
         new Derived()",
    );
    assert_eq!(check(&mut target, "copy.hi()"), JsValue::str("db"));
}

#[test]
fn detached_methods_still_work() {
    let mut target = resume_elsewhere(
        "class Reader { constructor() { this.v = 2; } read() { return this.v; } }\n\
         new Reader().read",
    );
    assert_eq!(check(&mut target, "copy.call({ v: 5 })"), JsValue::Number(5.0));
}

#[test]
fn fields_and_accessors_come_back() {
    let mut target = resume_elsewhere(
        "class Temp {\n\
           celsius = 20;\n\
           get fahrenheit() { return this.celsius * 9 / 5 + 32; }\n\
           set fahrenheit(f) { this.celsius = (f - 32) * 5 / 9; }\n\
         }\n\
         new Temp()",
    );
    assert_eq!(check(&mut target, "copy.fahrenheit"), JsValue::Number(68.0));
    check(&mut target, "copy.fahrenheit = 212");
    assert_eq!(check(&mut target, "copy.celsius"), JsValue::Number(100.0));
}

#[test]
fn class_values_pass_the_round_trip_check() {
    let mut realm = Realm::new(EngineConfig::default()).expect("realm");
    let value = realm
        .eval_instrumented("class Box { constructor(v) { this.v = v; } get() { return this.v; } } [new Box(1), Box]")
        .expect("eval");
    let out = realm.ensure_serializable(&value).expect("round trip");
    assert_eq!(out, value);
}

#[test]
fn extracted_members_keep_their_body_after_the_slot_is_replaced() {
    let mut target = resume_elsewhere(
        "class A {\n\
           greet() { return 'orig'; }\n\
           static make() { return 'old'; }\n\
         }\n\
         const old = A.prototype.greet;\n\
         const oldMake = A.make;\n\
         A.prototype.greet = function () { return 'repl'; };\n\
         A.make = () => 'new';\n\
         ({ old, oldMake, A })",
    );
    assert_eq!(
        check(&mut target, "copy.old() + '|' + new copy.A().greet()"),
        JsValue::str("orig|repl")
    );
    assert_eq!(
        check(&mut target, "copy.oldMake() + '|' + copy.A.make()"),
        JsValue::str("old|new")
    );
    assert_eq!(
        check(&mut target, "copy.old !== copy.A.prototype.greet"),
        JsValue::Bool(true)
    );
}

#[test]
fn a_base_class_may_name_a_subclass_declared_after_it() {
    let mut target = resume_elsewhere(
        "class Base { make() { return new Sub(); } }\n\
         class Sub extends Base { id() { return 'sub'; } }\n\
         new Base()",
    );
    assert_eq!(check(&mut target, "copy.make().id()"), JsValue::str("sub"));
    assert_eq!(
        check(&mut target, "copy.make() instanceof Object.getPrototypeOf(copy).constructor"),
        JsValue::Bool(true)
    );
}
