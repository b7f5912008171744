//! The runtime context: owner of the heap, the call stack, the globals, the
//! symbol registry and the module loader.
//!
//! Everything mutable lives behind the context; there is no process-global
//! state.  A context is strictly single-threaded (the heap is full of raw
//! pointers) and multiple contexts may coexist as long as they share no
//! objects.

use crate::globals::Globals;
use crate::loader::Loader;
use crate::mem::objmem::ObjMem;
use crate::mem::MemConfig;
use crate::stack::CallStack;
use crate::symbols::SymbolRegistry;

/// Registers in the base frame entered at context creation; the embedder
/// API works within this frame until it enters its own native blocks.
const BASE_FRAME_REGS: usize = 16;

/// Marker type: an exception object has been stored in REG-0 of the current
/// frame.  Fallible runtime operations return `Result<T, Thrown>` and
/// propagate with `?`.
#[derive(Copy, Clone, Debug)]
pub struct Thrown;

/// Result of a native function or other throwing operation.
pub type ExecResult<T = ()> = Result<T, Thrown>;

/// Unrecoverable-failure codes, delivered by unwinding with a
/// [`RuntimePanic`] payload.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PanicCode {
    /// Out of object memory after collection retries.
    Oom,
    /// Call-stack overflow on frame entry.
    StackOverflow,
    /// Explicit abort.
    Abort,
    /// Illegal opcode or out-of-range operand.
    IllegalBytecode,
}

/// Payload of a runtime panic.  The embedder may `catch_unwind` at the
/// boundary (see [`crate::api::catch_panic`]); bytecode cannot catch these.
#[derive(Copy, Clone, Debug)]
pub struct RuntimePanic {
    pub code: PanicCode,
}

/// Raise an unrecoverable runtime panic.
pub fn raise_panic(code: PanicCode) -> ! {
    error!("runtime panic: {:?}", code);
    std::panic::panic_any(RuntimePanic { code })
}

/// Object-memory and stack sizing options.  Zero means default.
#[derive(Copy, Clone, Debug, Default)]
pub struct MemOptions {
    /// Total new-space size (both semispaces together), in bytes.
    pub new_space_size: usize,
    /// Old-space chunk size, in bytes.
    pub old_space_chunk_size: usize,
    /// Old-space total size limit, in bytes.
    pub old_space_size_max: usize,
    /// Initial big-space collection threshold, in bytes.
    pub big_space_size: usize,
    /// Big-space total size limit, in bytes.
    pub big_space_size_max: usize,
    /// Call-stack size, in value slots.
    pub callstack_slots: usize,
}

pub struct Context {
    pub(crate) mem: ObjMem,
    pub(crate) stack: Box<CallStack>,
    pub(crate) globals: Box<Globals>,
    pub(crate) symbols: Box<SymbolRegistry>,
    pub(crate) loader: Box<Loader>,
}

impl Context {
    /// Create a context with default options.
    pub fn new() -> Box<Context> {
        Self::with_options(&MemOptions::default())
    }

    /// Create a context.  Finalisation of all objects happens on drop.
    pub fn with_options(opts: &MemOptions) -> Box<Context> {
        crate::util::logger::try_init();
        let conf = MemConfig::from_options(opts);
        let mut ctx = Box::new(Context {
            mem: ObjMem::new(&conf),
            stack: CallStack::new(opts.callstack_slots),
            globals: Globals::zeroed(),
            symbols: SymbolRegistry::new(),
            loader: Loader::new(),
        });

        // Root registration must happen after boxing: the registered
        // pointers have to survive for the context's lifetime.
        let stack_ptr = &mut *ctx.stack as *mut CallStack as *mut u8;
        ctx.mem.add_gc_root(stack_ptr, CallStack::gc_visitor);
        let globals_ptr = &mut *ctx.globals as *mut Globals as *mut u8;
        ctx.mem.add_gc_root(globals_ptr, Globals::gc_visitor);
        let loader_ptr = &mut *ctx.loader as *mut Loader as *mut u8;
        ctx.mem.add_gc_root(loader_ptr, Loader::gc_visitor);
        let symbols_ptr = &mut *ctx.symbols as *mut SymbolRegistry as *mut u8;
        ctx.mem
            .register_weak_ref_container(symbols_ptr, SymbolRegistry::weak_visitor);

        ctx.stack.enter(BASE_FRAME_REGS, None, 0);
        crate::globals::boot(&mut ctx);
        info!("context created");
        ctx
    }

    /// Run a collection explicitly.
    pub fn collect_garbage(&mut self, kind: crate::mem::objmem::GcKind) {
        self.mem.collect(kind);
    }

    /// Log a per-space memory usage summary.
    pub fn dump_mem_usage(&self) {
        self.mem.dump_usage();
    }

    /// Number of live interned symbols.
    pub fn symbol_count(&self) -> usize {
        self.symbols.len()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // Objects carry no finalizers; dropping the spaces releases all
        // storage wholesale.
        info!("context destroyed");
    }
}
