//! Quill is the runtime core of an embeddable dynamically-typed scripting
//! language.  The crate bundles the three subsystems whose correctness jointly
//! determines correctness of the whole system:
//!
//! * **Object memory** ([`mem`]): a generational, moving garbage collector
//!   with three spaces (a two-semispace copying young generation, a chunked
//!   mark-compact old generation, and a mark-sweep space for large objects),
//!   precise root tracking, remembered sets maintained by a write barrier,
//!   and weak-reference finalisation.
//! * **Object model** ([`object`]): a tagged-pointer value representation
//!   with unboxed small integers, a uniform object layout (two-word metadata
//!   header, slot vector, raw bytes region), and dynamic type descriptors
//!   carrying fields, methods and statics.
//! * **Bytecode interpreter** ([`interp`]): a register-based virtual machine
//!   executing 32-bit fixed-width instruction words over a call stack of
//!   value slots, with an integrated invocation protocol for native and
//!   bytecode functions.
//!
//! A hosting process drives the core through a [`Context`] and the
//! register-indexed embedder surface in [`api`].  Everything is
//! single-threaded and cooperative: the only suspension points are garbage
//! collection, native function calls, and returns to the embedder.

#[macro_use]
extern crate log;
#[macro_use]
extern crate static_assertions;

pub mod api;
pub mod context;
pub mod interp;
pub mod loader;
pub mod mem;
pub mod object;
pub mod stack;
pub mod symbols;
pub mod util;

mod globals;

pub use crate::api::{ApiError, ApiResult, ApiValue};
pub use crate::context::{Context, MemOptions, PanicCode, RuntimePanic};
pub use crate::object::value::Value;
