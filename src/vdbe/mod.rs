//! The Virtual Database Engine
//!
//! Compiled statements are programs for a stack machine. `ops` defines
//! the instruction set, `aux` the program builder and run state, `mem`
//! the polymorphic cell, `record` the row/key encodings, and `engine`
//! the interpreter; `sorter` and `agg` are its ORDER BY and GROUP BY
//! runtimes.

pub mod agg;
pub mod aux;
pub mod engine;
pub mod mem;
pub mod ops;
pub mod record;
pub mod sorter;

pub use aux::{Magic, Vdbe};
pub use engine::{vdbe_exec, Exec};
pub use ops::{Instr, Opcode, P3};
