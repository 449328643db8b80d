//! Black-box tests for schema type registration and instance
//! materialization (spec.md §4.5), driving `build_schema` against a
//! `Vm` as its `SchemaHost` the way `BUILD_SCHEMA` does at runtime.

use std::rc::Rc;

use kcl_engine::bytecode::op::Opcode;
use kcl_engine::program::{Bytecode, Code, Instruction, Program};
use kcl_engine::schema::{AttrMeta, SchemaType, SchemaTypeRegistry, runtime_type_id};
use kcl_engine::types::Type;
use kcl_engine::value::{DictKey, SchemaSettings, Value};
use kcl_engine::{Vm, build_schema};
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;

fn noarg(op: Opcode) -> Instruction {
    Instruction::NoArg(op, Default::default())
}

fn witharg(op: Opcode, arg: u32) -> Instruction {
    Instruction::Arg(op, arg, Default::default())
}

fn empty_vm() -> Vm {
    let mut pkgs = BTreeMap::new();
    pkgs.insert("__main__".to_string(), Bytecode::default());
    Vm::new(Program { root_dir: String::new(), main_pkgpath: "__main__".into(), pkgs })
}

fn attr(name: &str, ty: Type, is_optional: bool, has_default: bool) -> AttrMeta {
    AttrMeta { name: name.into(), ty: Rc::new(ty), is_optional, is_final: false, has_default, decorators: Vec::new() }
}

fn blank_schema(name: &str, filename: &str) -> SchemaType {
    SchemaType {
        name: name.into(),
        pkgpath: "__main__".into(),
        filename: filename.into(),
        doc: String::new(),
        attr_list: Vec::new(),
        base: None,
        mixins: Vec::new(),
        protocol: None,
        index_signature: None,
        decorators: Vec::new(),
        func: Rc::new(Code::default()),
        check_fn: None,
        settings: SchemaSettings::Standalone,
        runtime_type: runtime_type_id(filename, name),
        is_relaxed: false,
        instances: Vec::new(),
    }
}

#[test]
fn a_body_that_sets_every_required_attribute_builds_cleanly() {
    let mut vm = empty_vm();
    let name_id = vm.state.interner.intern("name");

    let body = Code {
        instructions: vec![
            witharg(Opcode::LoadConst, 0),
            witharg(Opcode::SchemaAttr, 0),
            witharg(Opcode::LoadConst, 1),
            noarg(Opcode::ReturnValue),
        ],
        constants: vec![Value::str("Alice"), Value::None],
        names: vec![name_id],
        filename: "t.k".into(),
        pkgpath: "__main__".into(),
    };

    let mut ty = blank_schema("Person", "t.k");
    ty.func = Rc::new(body);
    ty.attr_list = vec![attr("name", Type::Str, false, false), attr("age", Type::Int, true, false)];

    let mut registry = SchemaTypeRegistry::new();
    registry.register(ty.clone()).unwrap();

    let instance = build_schema(&registry, &ty.runtime_type, Value::None, Value::None, vec![], false, "__main__", &mut vm.state.heap, &mut vm).unwrap();

    let Value::SchemaInstance(id) = instance else { panic!("expected a schema instance") };
    let guard = vm.state.heap.get(id);
    let kcl_engine::value::HeapValue::SchemaInstance(data) = &*guard else { panic!() };
    assert_eq!(data.name, "Person");
    assert!(matches!(data.attrs.get(&DictKey::from("name")), Some(Value::Str(s)) if &**s == "Alice"));
    assert!(matches!(data.attrs.get(&DictKey::from("age")), Some(Value::Undefined)));
}

#[test]
fn leaving_a_required_attribute_unset_fails_construction() {
    let mut vm = empty_vm();
    let body = Code {
        instructions: vec![witharg(Opcode::LoadConst, 0), noarg(Opcode::ReturnValue)],
        constants: vec![Value::None],
        names: vec![],
        filename: "t.k".into(),
        pkgpath: "__main__".into(),
    };

    let mut ty = blank_schema("Person", "t.k");
    ty.func = Rc::new(body);
    ty.attr_list = vec![attr("name", Type::Str, false, false)];

    let mut registry = SchemaTypeRegistry::new();
    registry.register(ty.clone()).unwrap();

    let err = build_schema(&registry, &ty.runtime_type, Value::None, Value::None, vec![], false, "__main__", &mut vm.state.heap, &mut vm).unwrap_err();
    assert!(err.kind().is_some());
}

#[test]
fn instance_pkgpath_comes_from_the_caller_not_the_defining_type() {
    let mut vm = empty_vm();
    let empty_body = Rc::new(Code::default());
    let mut ty = blank_schema("Shared", "lib.k");
    ty.pkgpath = "some.lib".into();
    ty.func = empty_body;

    let mut registry = SchemaTypeRegistry::new();
    registry.register(ty.clone()).unwrap();

    let instance = build_schema(&registry, &ty.runtime_type, Value::None, Value::None, vec![], false, "__main__", &mut vm.state.heap, &mut vm).unwrap();
    let Value::SchemaInstance(id) = instance else { panic!("expected a schema instance") };
    let guard = vm.state.heap.get(id);
    let kcl_engine::value::HeapValue::SchemaInstance(data) = &*guard else { panic!() };
    assert_eq!(data.pkgpath, "__main__");
}

#[test]
fn a_subclass_instance_carries_the_base_classs_default_attributes() {
    let mut vm = empty_vm();
    let empty_body = Rc::new(Code::default());

    let mut base = blank_schema("Base", "t.k");
    base.func = empty_body.clone();
    base.attr_list = vec![attr("kind", Type::Str, true, true)];
    let base_ref = base.schema_ref();

    let mut sub = blank_schema("Sub", "t.k");
    sub.func = empty_body;
    sub.base = Some(base_ref);
    sub.attr_list = vec![attr("extra", Type::Int, true, true)];

    let mut registry = SchemaTypeRegistry::new();
    registry.register(base).unwrap();
    registry.register(sub.clone()).unwrap();

    let instance = build_schema(&registry, &sub.runtime_type, Value::None, Value::None, vec![], false, "__main__", &mut vm.state.heap, &mut vm).unwrap();

    let Value::SchemaInstance(id) = instance else { panic!("expected a schema instance") };
    let guard = vm.state.heap.get(id);
    let kcl_engine::value::HeapValue::SchemaInstance(data) = &*guard else { panic!() };
    assert!(data.attrs.contains_key(&DictKey::from("kind")));
    assert!(data.attrs.contains_key(&DictKey::from("extra")));
}
