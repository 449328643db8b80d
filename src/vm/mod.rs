//! The bytecode dispatch loop (spec.md §4.4, §6.2).
//!
//! [`Vm`] owns the operand stack and call-frame stack; [`VmState`]
//! (module-level, package-shared state) lives alongside it but is
//! logically separate, matching the teacher's split between a
//! per-execution interpreter struct and a longer-lived environment.
//! The opcode groups that are pure value transforms (arithmetic,
//! collection building, calling convention, imports, formatting) are
//! implemented as free functions in sibling modules; this file is the
//! fetch-decode-execute shell plus the stateful opcode groups (names
//! & scoping, control flow, schema construction) that need direct
//! access to the frame/stack/heap triple.

pub mod binary;
pub mod calls;
pub mod collections;
pub mod format;
pub mod import;

use std::rc::Rc;

use ahash::AHashMap;

use crate::bytecode::op::Opcode;
use crate::diagnostics::{ErrorKind, RunError};
use crate::heap::{Heap, HeapId, HeapValue};
use crate::intern::StringId;
use crate::lazy::{BodyRange, PlaceHolderPriority, SchemaEvalContext};
use crate::namespace::{LocalSlot, Namespace};
use crate::program::{Code, Instruction, Program};
use crate::resource::{NoLimitTracker, ResourceTracker};
use crate::schema::{self, AttrMeta, IndexSignature, SchemaHost, SchemaType, SchemaTypeRegistry};
use crate::state::VmState;
use crate::types::{SchemaRef, Type, TypeRef};
use crate::unify::{self, UnionOptions};
use crate::value::{
    ConfigOperation, DecoratorTarget, DecoratorValue, DictKey, FunctionValue, SchemaSettings, Value,
};

/// One call frame: a code object, its instruction pointer, its local
/// slots, and (for schema bodies/check-blocks) the instance it is
/// writing into.
#[derive(Debug)]
pub struct Frame {
    pub code: Rc<Code>,
    pub ip: usize,
    pub locals: Namespace,
    pub pkgpath: String,
    pub closure: Vec<HeapId>,
    /// The instance `self` refers to inside a schema body or
    /// check-block; `None` for ordinary function frames.
    pub instance: Option<HeapId>,
    /// The attribute currently being computed, and the instruction
    /// index its place-holder range started at (spec.md §4.6),
    /// opened by the last `SCHEMA_NOP` and closed by the next one.
    pending_attr: Option<(StringId, usize)>,
}

impl Frame {
    fn new(code: Rc<Code>, locals: Namespace, pkgpath: String, closure: Vec<HeapId>) -> Self {
        Self { code, ip: 0, locals, pkgpath, closure, instance: None, pending_attr: None }
    }
}

enum StepResult {
    Continue,
    Returned(Value),
}

/// The interpreter: operand stack, frame stack, shared state, and a
/// pluggable recursion/back-tracking policy (spec.md §9).
pub struct Vm<T: ResourceTracker = NoLimitTracker> {
    pub state: VmState,
    pub tracker: T,
    pub stack: Vec<Value>,
    pub frames: Vec<Frame>,
    pub program: Program,
}

impl Vm<NoLimitTracker> {
    pub fn new(program: Program) -> Self {
        Self::with_tracker(program, NoLimitTracker)
    }
}

impl<T: ResourceTracker> Vm<T> {
    pub fn with_tracker(program: Program, tracker: T) -> Self {
        Self { state: VmState::new(), tracker, stack: Vec::new(), frames: Vec::new(), program: program }
    }

    /// Decode and run the program's `main_pkgpath` package to completion,
    /// returning its last expression-statement value (spec.md §4.1).
    pub fn run_main(&mut self) -> Result<Value, RunError> {
        let pkgpath = self.program.main_pkgpath.clone();
        let code = self.decode_package(&pkgpath)?;
        self.frames.push(Frame::new(Rc::new(code), Namespace::default(), pkgpath, Vec::new()));
        self.run()
    }

    fn decode_package(&mut self, pkgpath: &str) -> Result<Code, RunError> {
        let bytecode = self
            .program
            .pkgs
            .get(pkgpath)
            .ok_or_else(|| import::unknown_package_error(pkgpath))?
            .clone();
        crate::program::decode(&bytecode, pkgpath, &mut self.state.interner)
    }

    /// Drive frames to completion. Returns the value the outermost
    /// frame returned.
    pub fn run(&mut self) -> Result<Value, RunError> {
        loop {
            match self.step()? {
                StepResult::Continue => {}
                StepResult::Returned(v) => {
                    if self.frames.is_empty() {
                        return Ok(v);
                    }
                    self.stack.push(v);
                }
            }
        }
    }

    /// Execute the current frame's next instruction, advancing or
    /// jumping its `ip`. On `RETURN_*` this pops the frame and reports
    /// the returned value via `StepResult::Returned`; the caller
    /// decides whether that ends the whole run or resumes the caller
    /// frame.
    fn step(&mut self) -> Result<StepResult, RunError> {
        let frame_idx = self.frames.len() - 1;
        let ip = self.frames[frame_idx].ip;
        let Some(instr) = self.frames[frame_idx].code.instructions.get(ip).cloned() else {
            return Ok(self.pop_frame(Value::None));
        };
        let mut next_ip = ip + 1;
        let pos = instr.position().clone();
        let result = self.execute(&instr, frame_idx, &mut next_ip);
        let result = result.map_err(|e| e.with_position(pos));
        match result? {
            Some(v) => Ok(self.pop_frame(v)),
            None => {
                self.frames[frame_idx].ip = next_ip;
                Ok(StepResult::Continue)
            }
        }
    }

    fn pop_frame(&mut self, value: Value) -> StepResult {
        let frame = self.frames.pop().expect("pop_frame called with no frames");
        let end_ip = frame.code.instructions.len().saturating_sub(1);
        self.close_pending_attr(frame.instance, frame.pending_attr, &frame.pkgpath, end_ip);
        StepResult::Returned(value)
    }

    /// Turns a still-open `SCHEMA_NOP` range into a registered
    /// place-holder once the attribute's computation finishes — either
    /// because another `SCHEMA_NOP` opened the next one, or because the
    /// frame that was computing it returned (spec.md §4.6).
    fn close_pending_attr(&mut self, instance: Option<HeapId>, pending_attr: Option<(StringId, usize)>, pkgpath: &str, end_ip: usize) {
        let Some(instance_id) = instance else { return };
        let Some((name, start)) = pending_attr else { return };
        let pkgpath_hash = hash_str(pkgpath);
        let schema_name = self.schema_name_of(instance_id);
        let range = BodyRange { pkgpath_hash, schema_name, start, end: end_ip };
        self.state.schema_eval.entry(instance_id).or_default().add_place_holder(name, PlaceHolderPriority::SubDefault, range);
    }

    fn schema_name_of(&mut self, instance_id: HeapId) -> StringId {
        let name = {
            let guard = self.state.heap.get(instance_id);
            let HeapValue::SchemaInstance(data) = &*guard else { return self.state.interner.intern("") };
            data.name.clone()
        };
        self.state.interner.intern(&name)
    }

    /// Execute one instruction. Returns `Ok(Some(value))` on a
    /// `RETURN_*`, else `Ok(None)` having possibly overwritten
    /// `next_ip` for a jump.
    fn execute(&mut self, instr: &Instruction, frame_idx: usize, next_ip: &mut usize) -> Result<Option<Value>, RunError> {
        let op = instr.opcode();
        let arg = instr.arg().unwrap_or(0);
        match op {
            // --- Stack ---
            Opcode::PopTop => {
                self.pop()?;
            }
            Opcode::RotTwo => {
                let len = self.stack.len();
                if len < 2 {
                    return Err(RunError::Internal("ROT_TWO: stack underflow".into()));
                }
                self.stack.swap(len - 1, len - 2);
            }
            Opcode::RotThree => {
                let len = self.stack.len();
                if len < 3 {
                    return Err(RunError::Internal("ROT_THREE: stack underflow".into()));
                }
                self.stack[len - 3..].rotate_right(1);
            }
            Opcode::DupTop => {
                let top = self.peek(0)?.clone();
                self.stack.push(top);
            }
            Opcode::DupTopTwo => {
                let a = self.peek(1)?.clone();
                let b = self.peek(0)?.clone();
                self.stack.push(a);
                self.stack.push(b);
            }
            Opcode::CopyTop => {
                let top = self.peek(0)?.clone();
                self.stack.push(top);
            }
            Opcode::Nop => {}

            // --- Unary ---
            Opcode::UnaryPositive => {
                let v = self.pop()?;
                let r = binary::unary_positive(&v, &self.state.heap)?;
                self.stack.push(r);
            }
            Opcode::UnaryNegative => {
                let v = self.pop()?;
                let r = binary::unary_negative(&v, &self.state.heap)?;
                self.stack.push(r);
            }
            Opcode::UnaryInvert => {
                let v = self.pop()?;
                let r = binary::unary_invert(&v, &self.state.heap)?;
                self.stack.push(r);
            }
            Opcode::UnaryNot => {
                let v = self.pop()?;
                let r = binary::unary_not(&v, &self.state.heap);
                self.stack.push(r);
            }

            // --- Binary ---
            Opcode::BinaryAdd => self.binop(|l, r, h| binary::binary_add(l, r, h))?,
            Opcode::BinarySubtract => self.binop_ro(|l, r, h| binary::binary_subtract(l, r, h))?,
            Opcode::BinaryMultiply => self.binop_ro(|l, r, h| binary::binary_multiply(l, r, h))?,
            Opcode::BinaryDivide => self.binop_ro(|l, r, h| binary::binary_divide(l, r, h))?,
            Opcode::BinaryFloorDivide => self.binop_ro(|l, r, h| binary::binary_floor_divide(l, r, h))?,
            Opcode::BinaryModulo => self.binop_ro(|l, r, h| binary::binary_modulo(l, r, h))?,
            Opcode::BinaryPower => self.binop_ro(|l, r, h| binary::binary_power(l, r, h))?,
            Opcode::BinaryLShift => self.binop_ro(|l, r, h| binary::binary_lshift(l, r, h))?,
            Opcode::BinaryRShift => self.binop_ro(|l, r, h| binary::binary_rshift(l, r, h))?,
            Opcode::BinaryAnd => self.binop_ro(|l, r, h| binary::binary_and(l, r, h))?,
            Opcode::BinaryOr => self.binop_ro(|l, r, h| binary::binary_or(l, r, h))?,
            Opcode::BinaryXor => self.binop_ro(|l, r, h| binary::binary_xor(l, r, h))?,
            Opcode::CompareEqual => {
                let (l, r) = self.pop2()?;
                self.stack.push(binary::compare_equal(&l, &r, &self.state.heap));
            }
            Opcode::CompareNotEqual => {
                let (l, r) = self.pop2()?;
                self.stack.push(binary::compare_not_equal(&l, &r, &self.state.heap));
            }
            Opcode::CompareLess => self.binop_ro(|l, r, h| binary::compare_less(l, r, h))?,
            Opcode::CompareLessEqual => self.binop_ro(|l, r, h| binary::compare_less_equal(l, r, h))?,
            Opcode::CompareGreater => self.binop_ro(|l, r, h| binary::compare_greater(l, r, h))?,
            Opcode::CompareGreaterEqual => self.binop_ro(|l, r, h| binary::compare_greater_equal(l, r, h))?,

            // --- Membership / identity ---
            Opcode::CompareIn => self.binop_ro(|l, r, h| binary::compare_in(l, r, h))?,
            Opcode::CompareNotIn => self.binop_ro(|l, r, h| binary::compare_not_in(l, r, h))?,
            Opcode::CompareIs => {
                let (l, r) = self.pop2()?;
                self.stack.push(binary::compare_is(&l, &r, &self.state.heap));
            }
            Opcode::CompareIsNot => {
                let (l, r) = self.pop2()?;
                self.stack.push(binary::compare_is_not(&l, &r, &self.state.heap));
            }

            // --- Type cast ---
            Opcode::MemberShipAs => {
                let ty_val = self.pop()?;
                let v = self.pop()?;
                let Value::Type(ty) = ty_val else { return Err(RunError::new(ErrorKind::Type, "MEMBER_SHIP_AS target is not a type")) };
                let r = binary::type_convert(v, &ty, &mut self.state.heap)?;
                self.stack.push(r);
            }

            // --- Assertions & raise ---
            Opcode::RaiseVarargs => {
                let msg = self.pop()?;
                let text = format::format_value(&msg, format::FormatSpec::Plain, &self.state.heap)?;
                let Value::Str(s) = text else { unreachable!() };
                return Err(RunError::new(ErrorKind::Evaluation, s.to_string()));
            }
            Opcode::RaiseCheck => {
                let msg = self.pop()?;
                let cond = self.pop()?;
                if !cond.is_truthy(&self.state.heap) {
                    let text = format::format_value(&msg, format::FormatSpec::Plain, &self.state.heap)?;
                    let Value::Str(s) = text else { unreachable!() };
                    return Err(RunError::new(ErrorKind::SchemaCheck, s.to_string()));
                }
            }

            // --- Collection build ---
            Opcode::BuildList => {
                let v = collections::build_list(&mut self.stack, arg as usize, &mut self.state.heap)?;
                self.stack.push(v);
            }
            Opcode::BuildMap => {
                self.stack.push(collections::build_map(&mut self.state.heap));
            }
            Opcode::BuildSlice2 => {
                let v = collections::build_slice(&mut self.stack, false)?;
                self.stack.push(v);
            }
            Opcode::BuildSlice3 => {
                let v = collections::build_slice(&mut self.stack, true)?;
                self.stack.push(v);
            }
            Opcode::BuildSchemaConfig => {
                self.stack.push(collections::build_schema_config(&mut self.state.heap));
            }
            Opcode::StoreMap => {
                collections::store_map(&mut self.stack, &mut self.state.heap)?;
            }
            Opcode::StoreSchemaConfig => {
                collections::store_schema_config(&mut self.stack, &mut self.state.heap)?;
            }

            // --- Names & scoping ---
            Opcode::LoadConst => {
                let v = self.const_at(frame_idx, arg)?;
                self.stack.push(v);
            }
            Opcode::LoadName => {
                let name = self.name_str(frame_idx, arg)?;
                let id = self.name_id(frame_idx, arg)?;
                let pkgpath = self.frames[frame_idx].pkgpath.clone();
                let v = match self.state.globals.package_ref(&pkgpath) {
                    Some(pkg) => crate::namespace::load_name(pkg, id, &name)?,
                    None => return Err(RunError::new(ErrorKind::Name, format!("name '{name}' is not defined"))),
                };
                self.stack.push(v);
            }
            Opcode::StoreName | Opcode::StoreGlobal => {
                let id = self.name_id(frame_idx, arg)?;
                let v = self.pop()?;
                let pkgpath = self.frames[frame_idx].pkgpath.clone();
                self.state.globals.package(&pkgpath).set(id, v);
            }
            Opcode::LoadLocal => {
                let slot = LocalSlot::new(arg as usize);
                let v = self.frames[frame_idx].locals.get(slot).clone();
                self.stack.push(v);
            }
            Opcode::StoreLocal => {
                let slot = LocalSlot::new(arg as usize);
                let v = self.pop()?;
                let frame = &mut self.frames[frame_idx];
                frame.locals.ensure_len(slot);
                frame.locals.set(slot, v);
            }
            Opcode::LoadFree => {
                let idx = arg as usize;
                let cell_id = *self.frames[frame_idx]
                    .closure
                    .get(idx)
                    .ok_or_else(|| RunError::Internal("LOAD_FREE: index out of range".into()))?;
                let v = {
                    let guard = self.state.heap.get(cell_id);
                    let HeapValue::Cell(v) = &*guard else { return Err(RunError::Internal("LOAD_FREE: not a cell".into())) };
                    v.clone()
                };
                self.stack.push(v);
            }
            Opcode::LoadClosure => {
                let idx = arg as usize;
                let cell_id = *self.frames[frame_idx]
                    .closure
                    .get(idx)
                    .ok_or_else(|| RunError::Internal("LOAD_CLOSURE: index out of range".into()))?;
                // Push the boxed value itself, for MAKE_CLOSURE's capture
                // step to pick up via a following STORE_LOCAL/pop; here we
                // just hand back the unboxed current value.
                let guard = self.state.heap.get(cell_id);
                let HeapValue::Cell(v) = &*guard else { return Err(RunError::Internal("LOAD_CLOSURE: not a cell".into())) };
                self.stack.push(v.clone());
            }
            Opcode::LoadBuiltIn => {
                let name = self.name_str(frame_idx, arg)?;
                let v = self
                    .state
                    .builtins
                    .get(&name)
                    .cloned()
                    .ok_or_else(|| RunError::new(ErrorKind::Name, format!("no builtin named '{name}'")))?;
                self.stack.push(v);
            }
            Opcode::LoadAttr => {
                let name = self.name_str(frame_idx, arg)?;
                let receiver = self.pop()?;
                let v = self.load_attr(&receiver, &name)?;
                self.stack.push(v);
            }
            Opcode::StoreAttr => {
                let name = self.name_str(frame_idx, arg)?;
                let receiver = self.pop()?;
                let v = self.pop()?;
                self.store_attr(&receiver, &name, v)?;
            }

            // --- Control flow ---
            Opcode::JumpForward => {
                *next_ip = *next_ip + arg as usize;
            }
            Opcode::JumpAbsolute => {
                *next_ip = arg as usize;
            }
            Opcode::PopJumpIfTrue => {
                let cond = self.pop()?;
                if cond.is_truthy(&self.state.heap) {
                    *next_ip = arg as usize;
                }
            }
            Opcode::PopJumpIfFalse => {
                let cond = self.pop()?;
                if !cond.is_truthy(&self.state.heap) {
                    *next_ip = arg as usize;
                }
            }
            Opcode::JumpIfTrueOrPop => {
                let truthy = self.peek(0)?.is_truthy(&self.state.heap);
                if truthy {
                    *next_ip = arg as usize;
                } else {
                    self.pop()?;
                }
            }
            Opcode::JumpIfFalseOrPop => {
                let truthy = self.peek(0)?.is_truthy(&self.state.heap);
                if !truthy {
                    *next_ip = arg as usize;
                } else {
                    self.pop()?;
                }
            }

            // --- Iteration ---
            Opcode::GetIter => {
                let v = self.pop()?;
                let arity = arg;
                let it = collections::get_iter(v, arity, &mut self.state.heap)?;
                self.stack.push(it);
            }
            Opcode::ForIter => {
                let iter_val = self.peek(0)?.clone();
                let Value::Iterator(id) = iter_val else { return Err(RunError::Internal("FOR_ITER: not an iterator".into())) };
                match collections::for_iter_step(id, &mut self.state.heap)? {
                    Some((a, b)) => {
                        self.stack.push(a);
                        if let Some(b) = b {
                            self.stack.push(b);
                        }
                    }
                    None => {
                        self.pop()?;
                        *next_ip = arg as usize;
                    }
                }
            }

            // --- Comprehensions ---
            Opcode::ListAppend => {
                let value = self.pop()?;
                collections::list_append(&self.stack, arg as usize, value, &mut self.state.heap)?;
            }
            Opcode::MapAdd => {
                let value = self.pop()?;
                let key = self.pop()?;
                let operation = match self.pop()? {
                    Value::Int(code) => collections::config_operation_from_code(code)?,
                    _ => ConfigOperation::Union,
                };
                collections::map_add(&self.stack, arg as usize, key, value, operation, &mut self.state.heap)?;
            }
            Opcode::DeleteItem => {
                collections::delete_item(&mut self.stack, arg as usize, &mut self.state.heap)?;
            }

            // --- Calls & functions ---
            Opcode::CallFunction => {
                let nargs = (arg & 0xFF) as usize;
                let nkwargs = ((arg >> 8) & 0xFF) as usize;
                let outcome = calls::call_function(&mut self.stack, nargs, nkwargs, &self.state.heap, &mut self.state.interner)?;
                match outcome {
                    calls::CallOutcome::Value(v) => self.stack.push(v),
                    calls::CallOutcome::PushFrame { code, locals, pkgpath, closure } => {
                        self.tracker.check_call_depth(self.frames.len() + 1)?;
                        self.frames.push(Frame::new(code, Namespace::from_vec(locals), pkgpath, closure));
                    }
                    calls::CallOutcome::BuildSchema { runtime_type, args } => {
                        let caller_pkgpath = self.frames[frame_idx].pkgpath.clone();
                        let registry_snapshot = std::mem::take(&mut self.state.schema_types);
                        let result = schema::build_schema(
                            &registry_snapshot,
                            &runtime_type,
                            Value::None,
                            Value::None,
                            args,
                            false,
                            &caller_pkgpath,
                            &mut self.state.heap,
                            self,
                        );
                        self.state.schema_types = registry_snapshot;
                        self.stack.push(result?);
                    }
                    calls::CallOutcome::NoOp(v) => self.stack.push(v),
                }
            }
            Opcode::MakeFunction => {
                let template = self.function_template(frame_idx, arg)?;
                let v = calls::make_function(&mut self.stack, &template, &mut self.state.interner)?;
                self.stack.push(v);
            }
            Opcode::MakeClosure => {
                let const_idx = arg >> 8;
                let n_free = (arg & 0xFF) as usize;
                let template = self.function_template(frame_idx, const_idx)?;
                let v = calls::make_closure(&mut self.stack, &template, n_free, &mut self.state.interner, &mut self.state.heap)?;
                self.stack.push(v);
            }
            Opcode::ReturnValue | Opcode::ReturnLastValue => {
                let v = self.stack.pop().unwrap_or(Value::None);
                return Ok(Some(v));
            }

            // --- Schema ---
            Opcode::MakeSchema => {
                let template = self.pop()?;
                let ty = self.parse_schema_template(template)?;
                let schema_ref = ty.schema_ref();
                self.state.schema_types.register(ty)?;
                self.stack.push(Value::Type(Rc::new(Type::SchemaDef(schema_ref))));
            }
            Opcode::BuildSchema => {
                let is_sub_schema = self.pop()?.is_truthy(&self.state.heap);
                let args_val = self.pop()?;
                let config_meta = self.pop()?;
                let config = self.pop()?;
                let schema_val = self.pop()?;
                let Value::Type(ty) = schema_val else { return Err(RunError::new(ErrorKind::Type, "BUILD_SCHEMA target is not a schema type")) };
                let Type::SchemaDef(schema_ref) = &*ty else { return Err(RunError::new(ErrorKind::Type, "BUILD_SCHEMA target is not a schema type")) };
                let runtime_type = schema_ref.runtime_type.clone();
                let args = self.list_items(&args_val)?;
                let caller_pkgpath = self.frames[frame_idx].pkgpath.clone();
                let registry_snapshot = std::mem::take(&mut self.state.schema_types);
                let result = schema::build_schema(
                    &registry_snapshot,
                    &runtime_type,
                    config,
                    config_meta,
                    args,
                    is_sub_schema,
                    &caller_pkgpath,
                    &mut self.state.heap,
                    self,
                );
                self.state.schema_types = registry_snapshot;
                self.stack.push(result?);
            }
            Opcode::SchemaAttr => {
                let name = self.name_id(frame_idx, arg)?;
                let value = self.pop()?;
                self.schema_attr_write(frame_idx, name, value, ConfigOperation::Union)?;
            }
            Opcode::SchemaUpdateAttr => {
                let name = self.name_id(frame_idx, arg)?;
                let operation = match self.pop()? {
                    Value::Int(code) => collections::config_operation_from_code(code)?,
                    _ => ConfigOperation::Override,
                };
                let value = self.pop()?;
                self.schema_attr_write(frame_idx, name, value, operation)?;
            }
            Opcode::SchemaLoadAttr => {
                let name = self.name_id(frame_idx, arg)?;
                let v = self.schema_load_attr(frame_idx, name)?;
                self.stack.push(v);
            }
            Opcode::SchemaNop => {
                let name = self.name_id(frame_idx, arg)?;
                let ip = self.frames[frame_idx].ip;
                let instance = self.frames[frame_idx].instance;
                if instance.is_some() {
                    let pending_attr = self.frames[frame_idx].pending_attr;
                    let pkgpath = self.frames[frame_idx].pkgpath.clone();
                    self.close_pending_attr(instance, pending_attr, &pkgpath, ip.saturating_sub(1));
                    self.frames[frame_idx].pending_attr = Some((name, ip + 1));
                }
            }

            // --- Import ---
            Opcode::ImportName => {
                let path = self.name_str(frame_idx, arg)?;
                let v = self.import_package(&path)?;
                self.stack.push(v);
            }

            // --- String formatting ---
            Opcode::FormatValues => {
                let spec = format::FormatSpec::from_code(arg)?;
                let v = self.pop()?;
                let formatted = format::format_value(&v, spec, &self.state.heap)?;
                self.stack.push(formatted);
            }

            Opcode::HaveArgument => unreachable!("HaveArgument is a sentinel, never a decoded opcode"),
        }
        Ok(None)
    }

    // --- stack helpers ---

    fn pop(&mut self) -> Result<Value, RunError> {
        self.stack.pop().ok_or_else(|| RunError::Internal("operand stack underflow".into()))
    }

    fn pop2(&mut self) -> Result<(Value, Value), RunError> {
        let r = self.pop()?;
        let l = self.pop()?;
        Ok((l, r))
    }

    fn peek(&self, depth_from_top: usize) -> Result<&Value, RunError> {
        let len = self.stack.len();
        if depth_from_top >= len {
            return Err(RunError::Internal("operand stack underflow on peek".into()));
        }
        Ok(&self.stack[len - 1 - depth_from_top])
    }

    fn binop(&mut self, f: impl Fn(&Value, &Value, &mut Heap) -> Result<Value, RunError>) -> Result<(), RunError> {
        let (l, r) = self.pop2()?;
        let v = f(&l, &r, &mut self.state.heap)?;
        self.stack.push(v);
        Ok(())
    }

    fn binop_ro(&mut self, f: impl Fn(&Value, &Value, &Heap) -> Result<Value, RunError>) -> Result<(), RunError> {
        let (l, r) = self.pop2()?;
        let v = f(&l, &r, &self.state.heap)?;
        self.stack.push(v);
        Ok(())
    }

    fn const_at(&self, frame_idx: usize, idx: u32) -> Result<Value, RunError> {
        self.frames[frame_idx]
            .code
            .constants
            .get(idx as usize)
            .cloned()
            .ok_or_else(|| RunError::Internal("LOAD_CONST: constant index out of range".into()))
    }

    fn name_id(&self, frame_idx: usize, idx: u32) -> Result<StringId, RunError> {
        self.frames[frame_idx]
            .code
            .names
            .get(idx as usize)
            .copied()
            .ok_or_else(|| RunError::Internal("name index out of range".into()))
    }

    fn name_str(&self, frame_idx: usize, idx: u32) -> Result<String, RunError> {
        let id = self.name_id(frame_idx, idx)?;
        Ok(self.state.interner.resolve(id).to_string())
    }

    fn function_template(&self, frame_idx: usize, const_idx: u32) -> Result<crate::value::CompiledFunction, RunError> {
        match self.const_at(frame_idx, const_idx)? {
            Value::Function(FunctionValue::Compiled(cf)) => Ok((*cf).clone()),
            _ => Err(RunError::new(ErrorKind::Compile, "MAKE_FUNCTION/MAKE_CLOSURE constant is not a function template")),
        }
    }

    fn list_items(&self, v: &Value) -> Result<Vec<Value>, RunError> {
        match v {
            Value::List(id) => {
                let guard = self.state.heap.get(*id);
                let HeapValue::List(items) = &*guard else { return Err(RunError::Internal("expected a list".into())) };
                Ok(items.clone())
            }
            Value::None | Value::Undefined => Ok(Vec::new()),
            _ => Err(RunError::new(ErrorKind::Type, "expected a list of arguments")),
        }
    }

    fn load_attr(&self, receiver: &Value, name: &str) -> Result<Value, RunError> {
        match receiver {
            Value::SchemaInstance(id) => {
                let guard = self.state.heap.get(*id);
                let HeapValue::SchemaInstance(data) = &*guard else { unreachable!() };
                data.attrs
                    .get(&DictKey::from(name))
                    .cloned()
                    .ok_or_else(|| RunError::new(ErrorKind::Attribute, format!("schema '{}' has no attribute '{name}'", data.name)))
            }
            Value::Dict(id) => {
                let guard = self.state.heap.get(*id);
                let HeapValue::Dict(map) = &*guard else { unreachable!() };
                map.get(&DictKey::from(name)).cloned().ok_or_else(|| RunError::new(ErrorKind::Key, format!("key '{name}' not found")))
            }
            Value::Module(id) => {
                let guard = self.state.heap.get(*id);
                let HeapValue::Module(map) = &*guard else { unreachable!() };
                let sid = self.state.interner.lookup(name);
                sid.and_then(|s| map.get(&s).cloned())
                    .ok_or_else(|| RunError::new(ErrorKind::Name, format!("module has no member '{name}'")))
            }
            other => Err(RunError::new(ErrorKind::Attribute, format!("'{}' object has no attribute '{name}'", other.kind_name(&self.state.heap)))),
        }
    }

    fn store_attr(&mut self, receiver: &Value, name: &str, value: Value) -> Result<(), RunError> {
        match receiver {
            Value::SchemaInstance(id) => {
                let mut guard = self.state.heap.get_mut(*id);
                let HeapValue::SchemaInstance(data) = &mut *guard else { unreachable!() };
                data.attrs.insert(DictKey::from(name), value);
                Ok(())
            }
            Value::Dict(id) => {
                let mut guard = self.state.heap.get_mut(*id);
                let HeapValue::Dict(map) = &mut *guard else { unreachable!() };
                map.insert(DictKey::from(name), value);
                Ok(())
            }
            other => Err(RunError::new(ErrorKind::Attribute, format!("'{}' object does not support attribute assignment", other.kind_name(&self.state.heap)))),
        }
    }

    fn import_package(&mut self, path: &str) -> Result<Value, RunError> {
        if self.state.pkgpath_stack.iter().any(|p| p == path) {
            return Err(import::recursive_import_error(path));
        }
        if !self.state.imported_packages.contains_key(path) {
            if !self.program.pkgs.contains_key(path) {
                return Err(import::unknown_package_error(path));
            }
            self.state.pkgpath_stack.push(path.to_string());
            let code = self.decode_package(path)?;
            self.tracker.check_call_depth(self.frames.len() + 1)?;
            self.frames.push(Frame::new(Rc::new(code), Namespace::default(), path.to_string(), Vec::new()));
            self.run_nested_to_completion()?;
            self.state.pkgpath_stack.pop();
            self.state.imported_packages.insert(path.to_string(), ());
        }
        Ok(import::module_value(path, &self.state.globals, &mut self.state.heap))
    }

    /// Run frames down to (and including) the one most recently
    /// pushed by the caller, used by `IMPORT_NAME` to execute a
    /// package's top-level code without disturbing the importer's own
    /// frame.
    fn run_nested_to_completion(&mut self) -> Result<(), RunError> {
        let target_depth = self.frames.len() - 1;
        loop {
            match self.step()? {
                StepResult::Continue => {}
                StepResult::Returned(v) => {
                    if self.frames.len() <= target_depth {
                        return Ok(());
                    }
                    self.stack.push(v);
                }
            }
            if self.frames.len() <= target_depth {
                return Ok(());
            }
        }
    }

    fn schema_attr_write(&mut self, frame_idx: usize, name: StringId, value: Value, operation: ConfigOperation) -> Result<(), RunError> {
        let instance_id = self.frames[frame_idx]
            .instance
            .ok_or_else(|| RunError::Internal("SCHEMA_ATTR outside a schema body".into()))?;
        let name_str = self.state.interner.resolve(name).to_string();
        let key = DictKey::from(name_str.as_str());
        let existing = {
            let guard = self.state.heap.get(instance_id);
            let HeapValue::SchemaInstance(data) = &*guard else { unreachable!() };
            data.attrs.get(&key).cloned()
        };
        let merged = apply_attr_operation(existing, value, operation, &mut self.state.heap)?;
        let mut guard = self.state.heap.get_mut(instance_id);
        let HeapValue::SchemaInstance(data) = &mut *guard else { unreachable!() };
        data.attrs.insert(key, merged);
        Ok(())
    }

    fn schema_load_attr(&mut self, frame_idx: usize, name: StringId) -> Result<Value, RunError> {
        let instance_id = self.frames[frame_idx]
            .instance
            .ok_or_else(|| RunError::Internal("SCHEMA_LOAD_ATTR outside a schema body".into()))?;
        let ip = self.frames[frame_idx].ip;
        let within_own_range = self.frames[frame_idx].pending_attr.map(|(n, start)| n == name && ip >= start).unwrap_or(false);
        let key = DictKey::from(self.state.interner.resolve(name));
        let display_name = self.state.interner.resolve(name).to_string();
        // `run_fragment` below needs a live `&mut self` (it calls
        // `self.step()`); `instance_has_attr` and the backtrack-depth
        // check only need read access to the heap and the tracker, so
        // they go through raw pointers instead of a second borrow of
        // `self` to avoid the closures aliasing `self`.
        let heap_ptr: *mut Heap = &mut self.state.heap;
        let tracker_ptr: *const T = &self.tracker;
        let mut ctx = self.state.schema_eval.remove(&instance_id).unwrap_or_default();
        let resolved = {
            let instance_has_attr = || -> Option<Value> {
                // SAFETY: `heap_ptr` is read here only between `run_fragment`
                // calls, never while `run_fragment`'s `&mut self` borrow (and
                // therefore `&mut self.state.heap`) is concurrently live.
                let heap = unsafe { &*heap_ptr };
                let guard = heap.get(instance_id);
                let HeapValue::SchemaInstance(data) = &*guard else { return None };
                match data.attrs.get(&key) {
                    Some(Value::Undefined) | None => None,
                    Some(v) => Some(v.clone()),
                }
            };
            let run_fragment = |range: &BodyRange| -> Result<(), RunError> {
                let saved_ip = self.frames[frame_idx].ip;
                self.frames[frame_idx].ip = range.start;
                loop {
                    if self.frames[frame_idx].ip > range.end || self.frames.len() <= frame_idx {
                        break;
                    }
                    match self.step()? {
                        StepResult::Continue => {}
                        StepResult::Returned(_) => break,
                    }
                }
                if frame_idx < self.frames.len() {
                    self.frames[frame_idx].ip = saved_ip;
                }
                Ok(())
            };
            // SAFETY: `tracker_ptr` is only dereferenced by `ctx.resolve`
            // to decide whether to invoke `run_fragment`, never while
            // `run_fragment`'s `&mut self` borrow is concurrently live.
            let tracker = unsafe { &*tracker_ptr };
            ctx.resolve(name, &display_name, within_own_range, instance_has_attr, run_fragment, None, tracker)
        };
        self.state.schema_eval.insert(instance_id, ctx);
        if let Some(v) = resolved? {
            return Ok(v);
        }
        // Neither an instance attribute nor a place-holder produced a
        // value: fall back to the same names LOAD_NAME would reach for
        // ordinary code (spec.md §4.6) before giving up. Frame locals are
        // not part of this chain: the compiler resolves every local/free
        // reference to LOAD_LOCAL/LOAD_FREE ahead of time, so a name that
        // reaches SCHEMA_LOAD_ATTR is never an in-scope local.
        let pkgpath = self.frames[frame_idx].pkgpath.clone();
        if let Some(pkg) = self.state.globals.package_ref(&pkgpath) {
            if pkg.contains(name) {
                return Ok(crate::namespace::load_name(pkg, name, &display_name)?);
            }
        }
        if let Some(v) = self.state.builtins.get(&display_name) {
            return Ok(v.clone());
        }
        Err(RunError::new(ErrorKind::Name, format!("name '{display_name}' is not defined")))
    }

    fn parse_schema_template(&mut self, template: Value) -> Result<SchemaType, RunError> {
        let Value::List(id) = template else { return Err(RunError::new(ErrorKind::Compile, "MAKE_SCHEMA argument is not a template list")) };
        let items = {
            let guard = self.state.heap.get(id);
            let HeapValue::List(items) = &*guard else { return Err(RunError::Internal("MAKE_SCHEMA: not a list".into())) };
            items.clone()
        };
        if items.len() != 13 {
            return Err(RunError::new(ErrorKind::Compile, format!("MAKE_SCHEMA template expects 13 fields, got {}", items.len())));
        }
        let name = expect_str(&items[0], "name")?;
        let filename = expect_str(&items[1], "filename")?;
        let doc = expect_str(&items[2], "doc")?;
        let attr_list = self.parse_attr_list(&items[3])?;
        let base = self.parse_schema_ref_opt(&items[4])?;
        let mixins = self.parse_schema_ref_list(&items[5])?;
        let protocol = self.parse_schema_ref_opt(&items[6])?;
        let decorators = self.parse_decorator_list(&items[7])?;
        let index_signature = self.parse_index_signature(&items[8])?;
        let settings = match &items[9] {
            Value::Int(0) => SchemaSettings::Standalone,
            Value::Int(1) => SchemaSettings::Inline,
            Value::Int(2) => SchemaSettings::Ignore,
            _ => SchemaSettings::Standalone,
        };
        let is_relaxed = items[10].is_truthy(&self.state.heap);
        let func = self.function_code(&items[11])?;
        let check_fn = match &items[12] {
            Value::None | Value::Undefined => None,
            other => Some(self.function_code(other)?),
        };
        let runtime_type = schema::runtime_type_id(&filename, &name);
        Ok(SchemaType {
            name,
            pkgpath: self.frames.last().map(|f| f.pkgpath.clone()).unwrap_or_default(),
            filename,
            doc,
            attr_list,
            base,
            mixins,
            protocol,
            index_signature,
            decorators,
            func,
            check_fn,
            settings,
            runtime_type,
            is_relaxed,
            instances: Vec::new(),
        })
    }

    fn function_code(&self, v: &Value) -> Result<Rc<Code>, RunError> {
        match v {
            Value::Function(FunctionValue::Compiled(cf)) => Ok(cf.code.clone()),
            _ => Err(RunError::new(ErrorKind::Compile, "expected a compiled function template")),
        }
    }

    fn parse_attr_list(&self, v: &Value) -> Result<Vec<AttrMeta>, RunError> {
        let items = self.list_items(v)?;
        items.iter().map(|item| self.parse_attr_meta(item)).collect()
    }

    fn parse_attr_meta(&self, v: &Value) -> Result<AttrMeta, RunError> {
        let fields = self.list_items(v)?;
        if fields.len() < 5 {
            return Err(RunError::new(ErrorKind::Compile, "attr template expects at least 5 fields"));
        }
        let name = expect_str(&fields[0], "attr name")?;
        let ty = expect_type(&fields[1])?;
        let is_optional = fields[2].is_truthy(&self.state.heap);
        let is_final = fields[3].is_truthy(&self.state.heap);
        let has_default = fields[4].is_truthy(&self.state.heap);
        let decorators = if fields.len() > 5 { self.parse_decorator_list(&fields[5])? } else { Vec::new() };
        Ok(AttrMeta { name, ty, is_optional, is_final, has_default, decorators })
    }

    fn parse_decorator_list(&self, v: &Value) -> Result<Vec<DecoratorValue>, RunError> {
        let items = self.list_items(v)?;
        items.iter().map(|item| self.parse_decorator(item)).collect()
    }

    fn parse_decorator(&self, v: &Value) -> Result<DecoratorValue, RunError> {
        let fields = self.list_items(v)?;
        if fields.len() != 4 {
            return Err(RunError::new(ErrorKind::Compile, "decorator template expects 4 fields"));
        }
        let name = expect_str(&fields[0], "decorator name")?;
        let target = match expect_str(&fields[1], "decorator target")?.as_str() {
            "schema" => DecoratorTarget::Schema,
            _ => DecoratorTarget::Attribute,
        };
        let args = self.list_items(&fields[2])?;
        let kwargs_items = self.list_items(&fields[3])?;
        let mut kwargs = Vec::with_capacity(kwargs_items.len());
        for kv in kwargs_items {
            let pair = self.list_items(&kv)?;
            if pair.len() != 2 {
                return Err(RunError::new(ErrorKind::Compile, "decorator kwarg template expects 2 fields"));
            }
            kwargs.push((expect_str(&pair[0], "decorator kwarg name")?, pair[1].clone()));
        }
        Ok(DecoratorValue { name, args, kwargs, target })
    }

    fn parse_index_signature(&self, v: &Value) -> Result<Option<IndexSignature>, RunError> {
        match v {
            Value::None | Value::Undefined => Ok(None),
            other => {
                let fields = self.list_items(other)?;
                if fields.len() != 5 {
                    return Err(RunError::new(ErrorKind::Compile, "index signature template expects 5 fields"));
                }
                let key_name = match &fields[0] {
                    Value::Str(s) => Some(s.to_string()),
                    _ => None,
                };
                let key_type = expect_type(&fields[1])?;
                let value_type = expect_type(&fields[2])?;
                let any_other = fields[3].is_truthy(&self.state.heap);
                let default_value = match &fields[4] {
                    Value::None | Value::Undefined => None,
                    other => Some(other.clone()),
                };
                Ok(Some(IndexSignature { key_name, key_type, value_type, any_other, default_value }))
            }
        }
    }

    fn parse_schema_ref_opt(&self, v: &Value) -> Result<Option<SchemaRef>, RunError> {
        match v {
            Value::None | Value::Undefined => Ok(None),
            Value::Type(t) => match &**t {
                Type::SchemaDef(r) | Type::Schema(r) => Ok(Some(r.clone())),
                _ => Err(RunError::new(ErrorKind::Compile, "expected a schema type reference")),
            },
            _ => Err(RunError::new(ErrorKind::Compile, "expected a schema type reference or None")),
        }
    }

    fn parse_schema_ref_list(&self, v: &Value) -> Result<Vec<SchemaRef>, RunError> {
        let items = self.list_items(v)?;
        items
            .iter()
            .map(|item| match self.parse_schema_ref_opt(item)? {
                Some(r) => Ok(r),
                None => Err(RunError::new(ErrorKind::Compile, "mixin/protocol list entry must be a schema type")),
            })
            .collect()
    }
}

fn expect_str(v: &Value, what: &str) -> Result<String, RunError> {
    match v {
        Value::Str(s) => Ok(s.to_string()),
        _ => Err(RunError::new(ErrorKind::Compile, format!("expected a string for {what}"))),
    }
}

fn expect_type(v: &Value) -> Result<TypeRef, RunError> {
    match v {
        Value::Type(t) => Ok(t.clone()),
        _ => Err(RunError::new(ErrorKind::Compile, "expected a type value")),
    }
}

fn apply_attr_operation(existing: Option<Value>, value: Value, operation: ConfigOperation, heap: &mut Heap) -> Result<Value, RunError> {
    match operation {
        ConfigOperation::Override => Ok(value),
        ConfigOperation::Insert => match existing {
            Some(e) => unify::insert_attr(Some(e), None, value, heap),
            None => Ok(value),
        },
        ConfigOperation::Unique => match existing {
            Some(e) if !e.value_eq(&value, heap) => {
                Err(RunError::new(ErrorKind::UniqueKey, "conflicting values for a unique attribute"))
            }
            _ => Ok(value),
        },
        ConfigOperation::Unification => unify::union(existing.unwrap_or(Value::Undefined), value, UnionOptions::idempotent(), heap),
        ConfigOperation::Union => unify::union(existing.unwrap_or(Value::Undefined), value, UnionOptions::default(), heap),
    }
}

fn hash_str(s: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = ahash::AHasher::default();
    s.hash(&mut hasher);
    hasher.finish()
}

impl<T: ResourceTracker> SchemaHost for Vm<T> {
    fn run_body(
        &mut self,
        code: &Code,
        args: &[Value],
        config: Value,
        config_meta: Value,
        instance: Value,
        heap: &mut Heap,
    ) -> Result<(), RunError> {
        let _ = heap; // same heap as `self.state.heap`; kept on the trait for other hosts.
        let Value::SchemaInstance(instance_id) = instance else {
            return Err(RunError::Internal("run_body: instance is not a SchemaInstance".into()));
        };
        let mut locals = Vec::with_capacity(args.len() + 2);
        locals.extend(args.iter().cloned());
        locals.push(config);
        locals.push(config_meta);
        let pkgpath = code.pkgpath.clone();
        self.tracker.check_call_depth(self.frames.len() + 1)?;
        let mut frame = Frame::new(Rc::new(code.clone()), Namespace::from_vec(locals), pkgpath, Vec::new());
        frame.instance = Some(instance_id);
        self.frames.push(frame);
        self.run_nested_to_completion()
    }

    fn run_check(&mut self, code: &Code, instance: Value, key_binding: Option<(String, Value)>, heap: &mut Heap) -> Result<(), RunError> {
        let _ = heap;
        let Value::SchemaInstance(instance_id) = instance else {
            return Err(RunError::Internal("run_check: instance is not a SchemaInstance".into()));
        };
        let mut locals = Vec::new();
        if let Some((_, v)) = key_binding {
            locals.push(v);
        }
        let pkgpath = code.pkgpath.clone();
        self.tracker.check_call_depth(self.frames.len() + 1)?;
        let mut frame = Frame::new(Rc::new(code.clone()), Namespace::from_vec(locals), pkgpath, Vec::new());
        frame.instance = Some(instance_id);
        self.frames.push(frame);
        self.run_nested_to_completion()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::op::Opcode;
    use crate::diagnostics::CodeRange;
    use crate::program::{Bytecode, Code, Instruction};
    use std::collections::BTreeMap;

    fn noarg(op: Opcode) -> Instruction {
        Instruction::NoArg(op, CodeRange::default())
    }

    fn witharg(op: Opcode, arg: u32) -> Instruction {
        Instruction::Arg(op, arg, CodeRange::default())
    }

    fn program_with_main(code: Code) -> Program {
        let mut pkgs = BTreeMap::new();
        pkgs.insert("__main__".to_string(), Bytecode::default());
        let mut program = Program { root_dir: String::new(), main_pkgpath: "__main__".into(), pkgs };
        let _ = code;
        program
    }

    #[test]
    fn arithmetic_and_return_drive_a_minimal_program() {
        let mut vm = Vm::new(program_with_main(Code::default()));
        let code = Code {
            instructions: vec![
                witharg(Opcode::LoadConst, 0),
                witharg(Opcode::LoadConst, 1),
                noarg(Opcode::BinaryAdd),
                noarg(Opcode::ReturnValue),
            ],
            constants: vec![Value::Int(2), Value::Int(3)],
            names: vec![],
            filename: "t.k".into(),
            pkgpath: "__main__".into(),
        };
        vm.frames.push(Frame::new(Rc::new(code), Namespace::default(), "__main__".into(), Vec::new()));
        let result = vm.run().unwrap();
        assert!(matches!(result, Value::Int(5)));
    }

    #[test]
    fn conditional_jump_skips_the_else_branch() {
        let mut vm = Vm::new(program_with_main(Code::default()));
        let code = Code {
            instructions: vec![
                witharg(Opcode::LoadConst, 0),      // 0: push True
                witharg(Opcode::PopJumpIfFalse, 4), // 1: -> else at 4
                witharg(Opcode::LoadConst, 1),      // 2: push "then"
                noarg(Opcode::ReturnValue),         // 3
                witharg(Opcode::LoadConst, 2),      // 4: push "else"
                noarg(Opcode::ReturnValue),          // 5
            ],
            constants: vec![Value::Bool(true), Value::str("then"), Value::str("else")],
            names: vec![],
            filename: "t.k".into(),
            pkgpath: "__main__".into(),
        };
        vm.frames.push(Frame::new(Rc::new(code), Namespace::default(), "__main__".into(), Vec::new()));
        let result = vm.run().unwrap();
        assert!(matches!(result, Value::Str(s) if &*s == "then"));
    }

    #[test]
    fn building_a_list_and_appending_collects_all_items() {
        let mut vm = Vm::new(program_with_main(Code::default()));
        let code = Code {
            instructions: vec![
                witharg(Opcode::BuildList, 0),
                witharg(Opcode::LoadConst, 0),
                witharg(Opcode::ListAppend, 1),
                witharg(Opcode::LoadConst, 1),
                witharg(Opcode::ListAppend, 1),
                noarg(Opcode::ReturnValue),
            ],
            constants: vec![Value::Int(1), Value::Int(2)],
            names: vec![],
            filename: "t.k".into(),
            pkgpath: "__main__".into(),
        };
        vm.frames.push(Frame::new(Rc::new(code), Namespace::default(), "__main__".into(), Vec::new()));
        let result = vm.run().unwrap();
        let Value::List(id) = result else { panic!() };
        let guard = vm.state.heap.get(id);
        let HeapValue::List(items) = &*guard else { panic!() };
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn schema_load_attr_falls_back_to_package_globals() {
        let mut vm = Vm::new(program_with_main(Code::default()));
        let instance_id = vm.state.heap.alloc(HeapValue::SchemaInstance(Default::default()));
        vm.frames.push(Frame::new(Rc::new(Code::default()), Namespace::default(), "__main__".into(), Vec::new()));
        vm.frames[0].instance = Some(instance_id);
        let name = vm.state.interner.intern("port");
        vm.state.globals.package("__main__").set(name, Value::Int(8080));
        let v = vm.schema_load_attr(0, name).unwrap();
        assert!(matches!(v, Value::Int(8080)));
    }

    #[test]
    fn schema_load_attr_falls_back_to_builtins() {
        let mut vm = Vm::new(program_with_main(Code::default()));
        let instance_id = vm.state.heap.alloc(HeapValue::SchemaInstance(Default::default()));
        vm.frames.push(Frame::new(Rc::new(Code::default()), Namespace::default(), "__main__".into(), Vec::new()));
        vm.frames[0].instance = Some(instance_id);
        let name = vm.state.interner.intern("len");
        vm.state.builtins.insert("len".into(), Value::Int(0));
        let v = vm.schema_load_attr(0, name).unwrap();
        assert!(matches!(v, Value::Int(0)));
    }

    #[test]
    fn schema_load_attr_errors_when_name_is_undefined_anywhere() {
        let mut vm = Vm::new(program_with_main(Code::default()));
        let instance_id = vm.state.heap.alloc(HeapValue::SchemaInstance(Default::default()));
        vm.frames.push(Frame::new(Rc::new(Code::default()), Namespace::default(), "__main__".into(), Vec::new()));
        vm.frames[0].instance = Some(instance_id);
        let name = vm.state.interner.intern("nope");
        let err = vm.schema_load_attr(0, name).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Name));
    }

    #[test]
    fn schema_attr_union_merges_dicts_across_writes() {
        let mut vm = Vm::new(program_with_main(Code::default()));
        let instance_id = vm.state.heap.alloc(HeapValue::SchemaInstance(Default::default()));
        vm.frames.push(Frame::new(Rc::new(Code::default()), Namespace::default(), "__main__".into(), Vec::new()));
        vm.frames[0].instance = Some(instance_id);
        let name = vm.state.interner.intern("x");
        vm.stack.push(Value::Int(7));
        vm.schema_attr_write(0, name, Value::Int(7), ConfigOperation::Override).unwrap();
        let guard = vm.state.heap.get(instance_id);
        let HeapValue::SchemaInstance(data) = &*guard else { panic!() };
        assert!(matches!(data.attrs.get(&DictKey::from("x")), Some(Value::Int(7))));
    }
}
