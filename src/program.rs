//! The compiled program format the VM consumes (spec.md §6.2).
//!
//! `Bytecode` is the wire format emitted by the (out-of-scope)
//! compiler: a flat word stream plus constant/name tables. `Code` is
//! the VM's decoded, ready-to-execute form — position metadata
//! resolved into [`CodeRange`]s and names resolved into [`StringId`]s.
//! Decoding happens once per `Bytecode`, not per frame push.

use crate::bytecode::op::Opcode;
use crate::diagnostics::{CodeRange, ErrorKind, RunError};
use crate::intern::{Interner, StringId};
use crate::value::Value;

/// One machine word in the raw instruction stream (spec.md §6.2).
pub type Word = i64;

/// A program: one `Bytecode` unit per package, as produced by the
/// compiler.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Program {
    pub root_dir: String,
    pub main_pkgpath: String,
    pub pkgs: std::collections::BTreeMap<String, Bytecode>,
}

/// Wire-format bytecode for a single package (spec.md §6.2).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Bytecode {
    pub names: Vec<String>,
    pub constants: Vec<Value>,
    pub instructions: Vec<Word>,
}

/// A decoded instruction. No-argument opcodes still carry their
/// source position (every diagnostic traces back to an instruction,
/// spec.md §7).
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    NoArg(Opcode, CodeRange),
    Arg(Opcode, u32, CodeRange),
}

impl Instruction {
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::NoArg(op, _) | Self::Arg(op, _, _) => *op,
        }
    }

    pub fn position(&self) -> &CodeRange {
        match self {
            Self::NoArg(_, pos) | Self::Arg(_, _, pos) => pos,
        }
    }

    pub fn arg(&self) -> Option<u32> {
        match self {
            Self::NoArg(..) => None,
            Self::Arg(_, arg, _) => Some(*arg),
        }
    }
}

/// The VM's decoded, directly executable unit — what a [`crate::vm::Frame`]
/// actually iterates over.
#[derive(Debug, Clone, Default)]
pub struct Code {
    pub instructions: Vec<Instruction>,
    pub constants: Vec<Value>,
    pub names: Vec<StringId>,
    pub filename: String,
    pub pkgpath: String,
}

/// Decode a wire-format [`Bytecode`] into executable [`Code`].
///
/// Word layout (spec.md §6.2): `[opcode, position_meta]` for no-arg
/// opcodes, or `[opcode, arg_lo, arg_mid, arg_hi, position_meta]` for
/// argument opcodes — the 24-bit argument is packed little-endian
/// across three words here for simplicity (one nibble-sized word per
/// byte), and `position_meta` is itself three words:
/// `(filename_name_idx, line, column)`.
pub fn decode(bytecode: &Bytecode, pkgpath: &str, interner: &mut Interner) -> Result<Code, RunError> {
    let names = bytecode.names.iter().map(|n| interner.intern(n)).collect();
    let mut instructions = Vec::new();
    let mut words = bytecode.instructions.iter().copied();
    let filename_default = bytecode.names.first().cloned().unwrap_or_default();

    while let Some(raw_op) = words.next() {
        let opcode = Opcode::from_repr(raw_op as u8).ok_or_else(|| {
            RunError::new(ErrorKind::Compile, format!("unknown opcode word {raw_op}"))
        })?;
        if opcode.has_argument() {
            let lo = words.next().ok_or_else(truncated)?;
            let mid = words.next().ok_or_else(truncated)?;
            let hi = words.next().ok_or_else(truncated)?;
            let arg = (lo as u32) | ((mid as u32) << 8) | ((hi as u32) << 16);
            let pos = decode_position(&mut words, &bytecode.names, &filename_default)?;
            instructions.push(Instruction::Arg(opcode, arg, pos));
        } else {
            let pos = decode_position(&mut words, &bytecode.names, &filename_default)?;
            instructions.push(Instruction::NoArg(opcode, pos));
        }
    }

    Ok(Code { instructions, constants: bytecode.constants.clone(), names, filename: filename_default, pkgpath: pkgpath.to_string() })
}

fn truncated() -> RunError {
    RunError::new(ErrorKind::Compile, "truncated instruction stream")
}

fn decode_position(
    words: &mut impl Iterator<Item = Word>,
    names: &[String],
    default_filename: &str,
) -> Result<CodeRange, RunError> {
    let filename_idx = words.next().ok_or_else(truncated)?;
    let line = words.next().ok_or_else(truncated)?;
    let column = words.next().ok_or_else(truncated)?;
    let filename = if filename_idx >= 0 {
        names.get(filename_idx as usize).cloned().unwrap_or_else(|| default_filename.to_string())
    } else {
        default_filename.to_string()
    };
    Ok(CodeRange { filename, line: line as u32, column: column as u32, end_line: line as u32, end_column: column as u32 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_no_arg_instruction() {
        let bytecode = Bytecode { names: vec!["mod.k".into()], constants: vec![], instructions: vec![Opcode::Nop as i64, -1, 1, 0] };
        let mut interner = Interner::new();
        let code = decode(&bytecode, "pkg", &mut interner).unwrap();
        assert_eq!(code.instructions.len(), 1);
        assert_eq!(code.instructions[0].opcode(), Opcode::Nop);
        assert_eq!(code.instructions[0].position().line, 1);
    }

    #[test]
    fn decodes_arg_instruction_as_24bit_little_endian() {
        let bytecode = Bytecode {
            names: vec!["mod.k".into()],
            constants: vec![],
            instructions: vec![Opcode::BuildList as i64, 5, 0, 0, -1, 2, 3],
        };
        let mut interner = Interner::new();
        let code = decode(&bytecode, "pkg", &mut interner).unwrap();
        assert_eq!(code.instructions[0].arg(), Some(5));
        assert_eq!(code.instructions[0].position().column, 3);
    }

    #[test]
    fn unknown_opcode_is_a_compile_error() {
        let bytecode = Bytecode { names: vec![], constants: vec![], instructions: vec![250] };
        let mut interner = Interner::new();
        assert!(decode(&bytecode, "pkg", &mut interner).is_err());
    }
}
