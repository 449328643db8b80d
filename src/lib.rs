#![doc = include_str!("../README.md")]
#![expect(clippy::too_many_arguments, reason = "schema-runtime call sites carry the full construction protocol")]
#![expect(clippy::cast_possible_truncation, reason = "bytecode operand widths are checked at decode time")]
#![expect(clippy::cast_sign_loss, reason = "sign-changing casts are intentional at the value/index boundary")]
#![expect(clippy::cast_possible_wrap, reason = "wrap behaviour mirrors the source language's integer semantics")]

//! A stack-based bytecode interpreter for the KCL configuration
//! language's evaluation core: a ~90-opcode VM, a schema construction
//! runtime (inheritance, mixins, decorators, lazy attribute
//! back-tracking), and the union/override/insert unification engine
//! that backs KCL's configuration merging.
//!
//! This crate implements the runtime only. The parser, resolver, and
//! bytecode compiler that produce the [`program::Program`] this VM
//! executes are external collaborators; [`ast`] exists to describe
//! that boundary, not to be walked by anything in this crate.

mod args;
pub mod ast;
pub mod bytecode;
mod decorators;
pub mod diagnostics;
mod heap;
mod intern;
mod lazy;
mod namespace;
pub mod object;
pub mod program;
pub mod resource;
pub mod schema;
mod state;
pub mod types;
pub mod unify;
pub mod value;
pub mod vm;

pub use crate::{
    bytecode::op::Opcode,
    diagnostics::{CodeRange, Diagnostic, ErrorKind, RunError},
    heap::{Heap, HeapId, HeapStats},
    intern::{Interner, StringId},
    object::{Object, object_to_value, value_to_object},
    program::{Bytecode, Code, Instruction, Program, decode},
    resource::{LimitedTracker, NoLimitTracker, ResourceLimits, ResourceTracker},
    schema::{SchemaHost, SchemaType, SchemaTypeRegistry, build_schema},
    state::VmState,
    types::{SchemaRef, Type, TypeRef},
    unify::{UnionOptions, union},
    value::Value,
    vm::Vm,
};
