//! The module registry.
//!
//! The `IMP` instruction and the embedder resolve top-level modules here.
//! Compiling modules from source is a front-end concern and out of scope;
//! the registry only hands out modules the embedder (or the runtime itself)
//! registered.  Registered module references are GC roots.

use crate::context::{Context, Thrown};
use crate::mem::objmem::{self, VisitOp};
use crate::object::{exception_obj, symbol_obj, value::Value};

pub struct Loader {
    modules: Vec<(String, Value)>,
}

impl Loader {
    pub fn new() -> Box<Loader> {
        Box::new(Loader {
            modules: Vec::new(),
        })
    }

    /// Register (or replace) a module under a top-level name.
    pub fn register(&mut self, name: &str, module: Value) {
        for entry in &mut self.modules {
            if entry.0 == name {
                entry.1 = module;
                return;
            }
        }
        debug!("module `{}' registered", name);
        self.modules.push((name.to_string(), module));
    }

    pub fn find(&self, name: &str) -> Option<Value> {
        self.modules
            .iter()
            .find(|(n, _)| n == name)
            .map(|&(_, m)| m)
    }

    /// GC-root visitor over the registered module references.
    ///
    /// # Safety
    /// `ptr` must be the address of a live `Loader` registered as a root.
    pub unsafe fn gc_visitor(ptr: *mut u8, op: VisitOp) {
        let loader = &mut *(ptr as *mut Loader);
        for (_, module) in loader.modules.iter_mut() {
            objmem::visit_slot(module, op);
        }
    }
}

/// Resolve a top-level module by name for the `IMP` instruction.
pub fn import(ctx: &mut Context, name_sym: Value) -> Result<Value, Thrown> {
    let name = symbol_obj::as_str(name_sym);
    match ctx.loader.find(name) {
        Some(module) => Ok(module),
        None => {
            let name = name.to_string();
            Err(exception_obj::throw_format(
                ctx,
                "key",
                name_sym,
                format!("module `{}' is not available", name),
            ))
        }
    }
}
