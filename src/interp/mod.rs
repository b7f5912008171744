//! The bytecode interpreter: instruction encoding and the dispatch loop
//! with its invocation protocol.

pub mod instr;
pub mod invoke;
