pub mod op;

pub use op::Opcode;
