//! Invocation protocol and the bytecode dispatch loop.
//!
//! ## Invocation
//!
//! A callable is a `Function`, or any object whose type defines a `call`
//! method (resolved recursively, at most 8 levels).  The caller places the
//! callable in REG-0 of its frame; entry resolves it to a `Function`
//! (leaving that in REG-0 — callers wanting the original must save it),
//! pushes a frame of `nr` registers, threads any intermediate callables into
//! the leading argument slots, and passes arguments from one of three
//! sources — a contiguous slot vector, a packed tuple/array, or discrete
//! register indices — all producing the same callee-frame layout:
//!
//! | arity          | layout                                              |
//! |----------------|-----------------------------------------------------|
//! | `na` only      | slots `[1..na]` = args                              |
//! | `na + k` fixed | required, then given optionals, then nil fill       |
//! | variadic       | required, optional fill, then a tuple of the rest   |
//!
//! ## Dispatch
//!
//! The loop fetches the current instruction by offset from the executing
//! function (re-read from the stack every iteration, since a collection may
//! move the function object), bounds-checks every register, symbol,
//! constant, field and global operand (violations are illegal bytecode and
//! panic), and executes.  Arithmetic and comparison opcodes take small-int
//! fast paths and otherwise dispatch the operator method on the left-hand
//! operand's type.

use crate::context::{Context, PanicCode, Thrown};
use crate::object::value::{ObjRef, Value, SMALLINT_MIN};
use crate::object::{
    array_obj, exception_obj, float_obj, func_obj, int_obj, map_obj, module_obj, protocol,
    range_obj, tuple_obj, type_obj::TypeObj,
};

use super::instr::{self, Opcode};

/// Most levels of `call`-method indirection a callable may hide behind.
const CALLABLE_RESOLVE_DEPTH_MAX: usize = 8;

/// State describing an entered (but not yet running) invocation.
pub(crate) struct InvocationInfo {
    /// Frame base of the caller.
    pub caller_frame: usize,
    /// First callee slot (relative) that receives passed arguments; slots
    /// `[1 .. arg_shift)` hold threaded intermediate callables.
    pub arg_shift: usize,
    /// Required argument count, minus the threaded callables.
    pub na: usize,
    /// Optional-argument encoding (see [`FuncMeta`]).
    pub no: i8,
}

fn decode_no(no: i8) -> (usize, bool) {
    match no {
        0 => (0, false),
        n if n > 0 => (n as usize, false),
        -1 => (0, true),
        n => ((-n) as usize - 1, true),
    }
}

fn throw_not_callable(ctx: &mut Context, v: Value) -> Thrown {
    exception_obj::throw_format(ctx, "type", v, "not callable".to_string())
}

fn throw_argc_error(ctx: &mut Context, func: Value, na: usize, no: i8, argc: usize) -> Thrown {
    let (k, variadic) = decode_no(no);
    let (prefix, expected) = if no == 0 {
        ("", na)
    } else if variadic || argc < na {
        ("at least ", na)
    } else {
        ("at most ", na + k)
    };
    exception_obj::throw_format(
        ctx,
        "type",
        func,
        format!(
            "wrong number of arguments (given {}, expected {}{})",
            argc, prefix, expected
        ),
    )
}

/// Enter a new frame for an invocation.  REG-0 of the caller frame holds the
/// callable and is replaced by the resolved `Function`.  On error, the
/// exception is made (in REG-0 of whichever frame is then current) and
/// `Err` returned.  Nothing in here allocates on the success path.
pub(crate) fn invocation_enter(
    ctx: &mut Context,
    return_ip: Option<u32>,
    ret_slot: usize,
) -> Result<InvocationInfo, Thrown> {
    let caller_frame = ctx.stack.frame();
    let mut callable = ctx.stack.get(caller_frame);
    let mut chain = [Value::SMALLINT_ZERO; CALLABLE_RESOLVE_DEPTH_MAX];
    let mut depth = 0usize;

    // Resolve the function object.
    let func: ObjRef = loop {
        if callable.is_smallint() {
            return Err(throw_not_callable(ctx, callable));
        }
        let obj = callable.as_obj();
        if obj.type_is(ctx.globals.type_function) {
            break obj;
        }
        if depth >= CALLABLE_RESOLVE_DEPTH_MAX {
            return Err(throw_not_callable(ctx, callable));
        }
        let ty = unsafe { TypeObj::deref(obj.type_of()) };
        let Some(method) = ty.get_method(ctx.globals.sym_call) else {
            return Err(throw_not_callable(ctx, callable));
        };
        chain[depth] = callable;
        depth += 1;
        callable = method;
    };
    ctx.stack.set(caller_frame, callable);

    let meta = func_obj::meta(func);
    let callee_frame_size = meta.nr as usize;
    ctx.stack.enter(callee_frame_size, return_ip, ret_slot);

    // Thread the intermediate callables as leading self-like arguments.
    if (meta.na as usize) < depth {
        return Err(throw_argc_error(ctx, callable, meta.na as usize, meta.no, depth));
    }
    for (i, &c) in chain[..depth].iter().enumerate() {
        ctx.stack.set_reg(1 + i, c);
    }

    Ok(InvocationInfo {
        caller_frame,
        arg_shift: depth + 1,
        na: meta.na as usize - depth,
        no: meta.no,
    })
}

/// Where the arguments come from.
pub(crate) enum ArgSource<'a> {
    /// `argc` contiguous absolute stack slots starting at `base`.
    StackVec { base: usize },
    /// A packed `Tuple` or `ArraySlots` held in the absolute stack slot
    /// `holder` (elements start at object slot 1).
    Packed { holder: usize },
    /// Register indices of the caller frame.
    Discrete { regs: &'a [u32] },
}

impl ArgSource<'_> {
    fn get(&self, ctx: &Context, caller_frame: usize, i: usize) -> Value {
        match self {
            ArgSource::StackVec { base } => ctx.stack.get(base + i),
            ArgSource::Packed { holder } => ctx.stack.get(*holder).as_obj().slot(1 + i),
            ArgSource::Discrete { regs } => ctx.stack.get(caller_frame + regs[i] as usize),
        }
    }
}

/// Pass `argc` arguments into the entered callee frame, producing the
/// canonical layout.  All three sources read from rooted storage, so the
/// variadic tuple allocation cannot invalidate them.
pub(crate) fn pass_args(
    ctx: &mut Context,
    src: ArgSource,
    argc: usize,
    info: &InvocationInfo,
) -> Result<(), Thrown> {
    let (n_opt, variadic) = decode_no(info.no);
    if argc < info.na || (!variadic && argc > info.na + n_opt) {
        let func = ctx.stack.get(info.caller_frame);
        return Err(throw_argc_error(ctx, func, info.na, info.no, argc));
    }

    let arg_base = ctx.stack.frame() + info.arg_shift;
    let n_direct = argc.min(info.na + n_opt);
    for i in 0..n_direct {
        let v = src.get(ctx, info.caller_frame, i);
        ctx.stack.set(arg_base + i, v);
    }
    let nil = ctx.globals.val_nil;
    for i in argc..info.na + n_opt {
        ctx.stack.set(arg_base + i, nil);
    }

    if variadic {
        let rest_slot = arg_base + info.na + n_opt;
        let rest_n = argc - n_direct;
        if rest_n == 0 {
            let empty = ctx.globals.val_empty_tuple;
            ctx.stack.set(rest_slot, empty);
        } else {
            let tup = match &src {
                ArgSource::StackVec { base } => {
                    tuple_obj::new_from_stack(ctx, base + n_direct, rest_n)
                }
                ArgSource::Packed { holder } => {
                    tuple_obj::new_from_packed_tail(ctx, *holder, n_direct, rest_n)
                }
                ArgSource::Discrete { regs } => {
                    let tup = tuple_obj::new_uninit(ctx, rest_n);
                    for j in 0..rest_n {
                        let v = ctx
                            .stack
                            .get(info.caller_frame + regs[n_direct + j] as usize);
                        tuple_obj::set_uninit(tup, j, v);
                    }
                    tup
                }
            };
            ctx.stack.set(rest_slot, tup);
        }
    }
    Ok(())
}

/// Does passing `argc` arguments allocate (variadic remainder tuple)?
fn pass_args_allocates(info: &InvocationInfo, argc: usize) -> bool {
    let (n_opt, variadic) = decode_no(info.no);
    variadic && argc > info.na + n_opt
}

/// Unwind after an exception landed in register `val_reg` of the current
/// frame.  Appends one stack-trace entry per unwound frame (when the value
/// is an `Exception`) and propagates the value through the saved return
/// destinations.  With no handler support, this always runs out to a native
/// boundary.
pub(crate) fn unwind(ctx: &mut Context, mut ip: u32, val_reg: u32) -> Thrown {
    let mut val_slot = ctx.stack.frame() + val_reg as usize;
    let val_is_exc = ctx
        .stack
        .get(val_slot)
        .type_is(ctx.globals.type_exception);
    loop {
        if val_is_exc {
            exception_obj::stack_trace_append(ctx, val_slot, ip);
        }
        let ret_slot = ctx.stack.frame_info().ret_slot;
        let thrown = ctx.stack.get(val_slot);
        match ctx.stack.leave(thrown) {
            None => return Thrown,
            Some(caller_ip) => {
                ip = caller_ip;
                val_slot = ret_slot;
            }
        }
    }
}

/// Finish an entered invocation: run a native callee to completion (popping
/// its frame), or hand back offset 0 to continue interpreting the callee's
/// bytecode.  Returns the next offset for the dispatch loop.
fn finish_call(ctx: &mut Context, caller_ip: u32) -> Result<u32, Thrown> {
    let func = ctx.stack.current_function().as_obj();
    match func_obj::native(func) {
        Some(native) => {
            native(ctx)?;
            let result = ctx.stack.reg(0);
            let ip0 = ctx.stack.leave(result);
            debug_assert_eq!(ip0, Some(caller_ip));
            Ok(caller_ip + 1)
        }
        None => {
            debug_assert!(func_obj::bytecode_len(func) > 0);
            Ok(0)
        }
    }
}

/// Invoke the method `name_sym` of `args[0]` with the given argument
/// values.  Used by the object protocol and the embedder API; the
/// interpreter's own operator fallbacks use [`enter_method_call`].  Returns
/// the result value; on `Err`, the exception is in REG-0.
pub(crate) fn invoke_method_vals(
    ctx: &mut Context,
    name_sym: Value,
    args: &[Value],
) -> Result<Value, Thrown> {
    debug_assert!(!args.is_empty() && args.len() <= 3);
    let recv = args[0];
    let ty_ref = if recv.is_smallint() {
        ctx.globals.type_int.as_obj()
    } else {
        recv.as_obj().type_of()
    };
    let ty = unsafe { TypeObj::deref(ty_ref) };
    let Some(method) = ty.get_method(name_sym) else {
        let name = crate::object::symbol_obj::as_str(name_sym).to_string();
        return Err(exception_obj::throw_format(
            ctx,
            "key",
            recv,
            format!("method `{}' does not exist", name),
        ));
    };

    let frame = ctx.stack.frame();
    let t = ctx.stack.alloc_temp(args.len());
    for (i, &a) in args.iter().enumerate() {
        ctx.stack.set(t + i, a);
    }
    ctx.stack.set(frame, method);

    let entered = ctx.stack.frames_depth();
    let result = invocation_enter(ctx, None, frame)
        .and_then(|ii| pass_args(ctx, ArgSource::StackVec { base: t }, args.len(), &ii))
        .and_then(|()| run_entered(ctx));
    match result {
        Ok(()) => {
            let v = ctx.stack.get(frame);
            ctx.stack.free_temp(args.len());
            Ok(v)
        }
        Err(Thrown) => {
            // A failure between enter and run leaves the callee frame up;
            // unwind it so the temps can be released.
            if ctx.stack.frames_depth() > entered {
                unwind(ctx, 0, 0);
            }
            ctx.stack.free_temp(args.len());
            Err(Thrown)
        }
    }
}

/// Run the frame just entered (with arguments already passed) to
/// completion.
pub(crate) fn run_entered(ctx: &mut Context) -> Result<(), Thrown> {
    let func = ctx.stack.current_function().as_obj();
    match func_obj::native(func) {
        Some(native) => match native(ctx) {
            Ok(()) => {
                let result = ctx.stack.reg(0);
                let ip0 = ctx.stack.leave(result);
                debug_assert_eq!(ip0, None);
                Ok(())
            }
            Err(Thrown) => Err(unwind(ctx, 0, 0)),
        },
        None => execute(ctx),
    }
}

/// Set up the interpreter's internal operator-method call: look the method
/// up on `args[0]`'s type, place it in caller REG-0, enter, and pass the
/// argument registers.  `ret_reg` and `arg_regs` are caller-frame register
/// indices.
fn enter_method_call(
    ctx: &mut Context,
    ip: u32,
    name_sym: Value,
    ret_reg: u32,
    arg_regs: &[u32],
) -> Result<(), Thrown> {
    let caller_frame = ctx.stack.frame();
    let recv = ctx.stack.get(caller_frame + arg_regs[0] as usize);
    let ty_ref = if recv.is_smallint() {
        ctx.globals.type_int.as_obj()
    } else {
        recv.as_obj().type_of()
    };
    let ty = unsafe { TypeObj::deref(ty_ref) };
    let Some(method) = ty.get_method(name_sym) else {
        let name = crate::object::symbol_obj::as_str(name_sym).to_string();
        return Err(exception_obj::throw_format(
            ctx,
            "key",
            recv,
            format!("method `{}' does not exist", name),
        ));
    };

    // REG-0 doubles as the callable slot; its previous value was captured
    // above if it is also an argument.
    let reg0_arg = arg_regs.iter().position(|&r| r == 0);
    let orig_reg0 = ctx.stack.get(caller_frame);
    ctx.stack.set(caller_frame, method);

    let ii = invocation_enter(ctx, Some(ip), caller_frame + ret_reg as usize)?;

    if reg0_arg.is_some() && pass_args_allocates(&ii, arg_regs.len()) {
        // The variadic tuple gathers from caller registers, and one of them
        // is REG-0, now holding the resolved function.  Park the function in
        // the (still unused) callee REG-0, restore the original argument,
        // pass, then put the function back.
        let resolved = ctx.stack.get(ii.caller_frame);
        ctx.stack.set_reg(0, resolved);
        ctx.stack.set(ii.caller_frame, orig_reg0);
        match pass_args(ctx, ArgSource::Discrete { regs: arg_regs }, arg_regs.len(), &ii) {
            Ok(()) => {
                let resolved = ctx.stack.reg(0);
                ctx.stack.set(ii.caller_frame, resolved);
                ctx.stack.set_reg(0, Value::SMALLINT_ZERO);
                Ok(())
            }
            Err(Thrown) => {
                // The exception has replaced the parked function in callee
                // REG-0; leave it there for the unwind.
                Err(Thrown)
            }
        }
    } else if reg0_arg.is_some() {
        // No allocation: capture the argument values directly.
        let mut vals = [Value::SMALLINT_ZERO; 3];
        for (i, &r) in arg_regs.iter().enumerate() {
            vals[i] = if r == 0 {
                orig_reg0
            } else {
                ctx.stack.get(ii.caller_frame + r as usize)
            };
        }
        let t = ctx.stack.alloc_temp(arg_regs.len());
        for (i, v) in vals[..arg_regs.len()].iter().enumerate() {
            ctx.stack.set(t + i, *v);
        }
        let passed = pass_args(ctx, ArgSource::StackVec { base: t }, arg_regs.len(), &ii);
        ctx.stack.free_temp(arg_regs.len());
        passed
    } else {
        pass_args(ctx, ArgSource::Discrete { regs: arg_regs }, arg_regs.len(), &ii)
    }
}

fn panic_ill(ctx: &Context, func: ObjRef, ip: u32, what: &str) -> ! {
    let word = func_obj::bytecode_word(func, ip as usize).unwrap_or(0);
    error!(
        "illegal bytecode ({}) at offset {}: {}",
        what,
        ip,
        instr::format_instr(word)
    );
    let _ = ctx;
    crate::context::raise_panic(PanicCode::IllegalBytecode)
}

/// Execute bytecode starting at offset 0 of the current frame's function,
/// until the invocation that entered the current frame (and everything
/// below it) returns to a native boundary.  On `Err`, all frames down to
/// that boundary have been unwound and the exception sits in the boundary
/// frame's return destination and REG-0.
pub(crate) fn execute(ctx: &mut Context) -> Result<(), Thrown> {
    let mut ip: u32 = 0;

    macro_rules! throw {
        () => {{
            return Err(unwind(ctx, ip, 0));
        }};
    }

    loop {
        // The function object may move in any collection: re-derive it from
        // the (root-updated) stack every iteration.
        let func_v = ctx.stack.current_function();
        debug_assert!(func_v.type_is(ctx.globals.type_function));
        let func = func_v.as_obj();
        let Some(word) = func_obj::bytecode_word(func, ip as usize) else {
            panic_ill(ctx, func, ip, "instruction offset out of range");
        };
        let Some(op) = Opcode::of(word) else {
            panic_ill(ctx, func, ip, "unknown opcode");
        };

        let frame = ctx.stack.frame();
        let top = ctx.stack.top();

        macro_rules! reg {
            ($r:expr) => {{
                let slot = frame + $r as usize;
                if slot > top {
                    panic_ill(ctx, func, ip, "register index out of range");
                }
                slot
            }};
        }
        macro_rules! reg_vec {
            ($base:expr, $n:expr) => {{
                let first = frame + $base as usize;
                if $n as usize > 0 && first + $n as usize - 1 > top {
                    panic_ill(ctx, func, ip, "register index out of range");
                }
                first
            }};
        }
        macro_rules! sym_idx {
            ($i:expr) => {{
                if $i as usize >= func_obj::symbol_count(func) {
                    panic_ill(ctx, func, ip, "symbol index out of range");
                }
                $i as usize
            }};
        }
        macro_rules! con_idx {
            ($i:expr) => {{
                if $i as usize >= func_obj::constant_count(func) {
                    panic_ill(ctx, func, ip, "constant index out of range");
                }
                $i as usize
            }};
        }
        macro_rules! jump_to {
            ($offset:expr) => {{
                let target = ip as i64 + $offset as i64;
                if target < 0 || target as usize >= func_obj::bytecode_len(func) {
                    panic_ill(ctx, func, ip, "jump target out of range");
                }
                ip = target as u32;
                continue;
            }};
        }
        macro_rules! method_call {
            ($name:expr, $ret:expr, $args:expr) => {{
                let name = $name;
                match enter_method_call(ctx, ip, name, $ret, $args) {
                    Ok(()) => match finish_call(ctx, ip) {
                        Ok(next) => {
                            ip = next;
                            continue;
                        }
                        Err(Thrown) => throw!(),
                    },
                    Err(Thrown) => throw!(),
                }
            }};
        }

        match op {
            Opcode::Nop => {
                ip += 1;
            }

            Opcode::Arg => {
                // Pseudo opcode: never executed.
                panic_ill(ctx, func, ip, "ARG executed");
            }

            Opcode::Brk => {
                let id = instr::operands_aw(word);
                error!("breakpoint {} hit at offset {}", id, ip);
                panic_ill(ctx, func, ip, "breakpoint");
            }

            Opcode::LdNil => {
                let (tgt, count) = instr::operands_abw(word);
                if count > 0 {
                    let first = reg_vec!(tgt, count);
                    let nil = ctx.globals.val_nil;
                    for i in 0..count as usize {
                        ctx.stack.set(first + i, nil);
                    }
                }
                ip += 1;
            }

            Opcode::LdBln => {
                let (tgt, val) = instr::operands_abw(word);
                let slot = reg!(tgt);
                let b = crate::object::bool_obj::make(ctx, val != 0);
                ctx.stack.set(slot, b);
                ip += 1;
            }

            Opcode::LdCon => {
                let (tgt, id) = instr::operands_abw(word);
                let slot = reg!(tgt);
                let id = con_idx!(id);
                ctx.stack.set(slot, func_obj::constant(func, id));
                ip += 1;
            }

            Opcode::LdSym => {
                let (tgt, id) = instr::operands_abw(word);
                let slot = reg!(tgt);
                let id = sym_idx!(id);
                ctx.stack.set(slot, func_obj::symbol(func, id));
                ip += 1;
            }

            Opcode::MkInt => {
                let (tgt, val) = instr::operands_absw(word);
                let slot = reg!(tgt);
                ctx.stack.set(slot, Value::smallint(val as isize));
                ip += 1;
            }

            Opcode::MkFlt => {
                let (tgt, frac, exp) = instr::operands_abscs(word);
                let slot = reg!(tgt);
                let value = (frac as f64) * (exp as f64).exp2();
                let v = float_obj::new(ctx, value);
                ctx.stack.set(slot, v);
                ip += 1;
            }

            Opcode::MkTup => {
                let (tgt, val_start, count) = instr::operands_abc(word);
                let slot = reg!(tgt);
                let first = reg_vec!(val_start, count);
                let v = tuple_obj::new_from_stack(ctx, first, count as usize);
                ctx.stack.set(slot, v);
                ip += 1;
            }

            Opcode::MkArr => {
                let (tgt, val_start, count) = instr::operands_abc(word);
                let slot = reg!(tgt);
                let first = reg_vec!(val_start, count);
                let v = array_obj::new_from_stack(ctx, first, count as usize);
                ctx.stack.set(slot, v);
                ip += 1;
            }

            Opcode::MkMap => {
                let (tgt, val_start, count) = instr::operands_abc(word);
                let slot = reg!(tgt);
                let first = reg_vec!(val_start, count * 2);
                let t = ctx.stack.alloc_temp(1);
                let m = map_obj::new(ctx, 0.0, count as usize);
                ctx.stack.set(t, m);
                for i in 0..count as usize {
                    if map_obj::set(ctx, t, first + i * 2, first + i * 2 + 1).is_err() {
                        ctx.stack.free_temp(1);
                        throw!();
                    }
                }
                let m = ctx.stack.get(t);
                ctx.stack.free_temp(1);
                ctx.stack.set(slot, m);
                ip += 1;
            }

            Opcode::MkRng | Opcode::MkRngX => {
                let (tgt, begin, end) = instr::operands_abc(word);
                let slot = reg!(tgt);
                let begin_slot = reg!(begin);
                let end_slot = reg!(end);
                let exclusive = op == Opcode::MkRngX;
                let v = range_obj::new_from_stack(ctx, begin_slot, end_slot, exclusive);
                ctx.stack.set(slot, v);
                ip += 1;
            }

            Opcode::Thr => {
                let val = instr::operands_aw(word);
                let _ = reg!(val);
                return Err(unwind(ctx, ip, val));
            }

            Opcode::RetNil => {
                let nil = ctx.globals.val_nil;
                match ctx.stack.leave(nil) {
                    None => return Ok(()),
                    Some(caller_ip) => ip = caller_ip + 1,
                }
            }

            Opcode::Ret => {
                let ret = instr::operands_aw(word);
                let slot = reg!(ret);
                let v = ctx.stack.get(slot);
                match ctx.stack.leave(v) {
                    None => return Ok(()),
                    Some(caller_ip) => ip = caller_ip + 1,
                }
            }

            Opcode::Call => {
                let (ret, argc, arg_regs) = instr::operands_call(word);
                let ret_slot = reg!(ret);
                let ii = match invocation_enter(ctx, Some(ip), ret_slot) {
                    Ok(ii) => ii,
                    Err(Thrown) => throw!(),
                };
                // The 6-bit fields must name caller registers below the new
                // frame.
                for &r in &arg_regs[..argc as usize] {
                    if ii.caller_frame + r as usize >= ctx.stack.frame() {
                        panic_ill(ctx, func, ip, "register index out of range");
                    }
                }
                if pass_args(
                    ctx,
                    ArgSource::Discrete {
                        regs: &arg_regs[..argc as usize],
                    },
                    argc as usize,
                    &ii,
                )
                .is_err()
                {
                    throw!();
                }
                match finish_call(ctx, ip) {
                    Ok(next) => ip = next,
                    Err(Thrown) => throw!(),
                }
            }

            Opcode::CallV => {
                let (ret, arg_start, argc) = instr::operands_abc(word);
                let ret_slot = reg!(ret);
                let arg_base = reg_vec!(arg_start, argc);
                let ii = match invocation_enter(ctx, Some(ip), ret_slot) {
                    Ok(ii) => ii,
                    Err(Thrown) => throw!(),
                };
                if pass_args(ctx, ArgSource::StackVec { base: arg_base }, argc as usize, &ii)
                    .is_err()
                {
                    throw!();
                }
                match finish_call(ctx, ip) {
                    Ok(next) => ip = next,
                    Err(Thrown) => throw!(),
                }
            }

            Opcode::CallP => {
                let (ret, args) = instr::operands_abw(word);
                let ret_slot = reg!(ret);
                let pack_slot = reg!(args);
                let pack = ctx.stack.get(pack_slot);
                let argc = if pack.type_is(ctx.globals.type_tuple) {
                    tuple_obj::length(pack)
                } else if pack.type_is(ctx.globals.type_array) {
                    // Pass the backing storage; same layout as a tuple.
                    let backing = array_obj::backing(pack);
                    let n = array_obj::length(pack);
                    ctx.stack.set(pack_slot, backing);
                    n
                } else {
                    panic_ill(ctx, func, ip, "CALLP operand is not a tuple or array");
                };
                let ii = match invocation_enter(ctx, Some(ip), ret_slot) {
                    Ok(ii) => ii,
                    Err(Thrown) => throw!(),
                };
                if pass_args(ctx, ArgSource::Packed { holder: pack_slot }, argc, &ii).is_err() {
                    throw!();
                }
                match finish_call(ctx, ip) {
                    Ok(next) => ip = next,
                    Err(Thrown) => throw!(),
                }
            }

            Opcode::LdMth => {
                let (obj_reg, name) = instr::operands_abw(word);
                let obj_slot = reg!(obj_reg);
                let name_sym = func_obj::symbol(func, sym_idx!(name));
                let obj = ctx.stack.get(obj_slot);
                let ty_ref = if obj.is_smallint() {
                    ctx.globals.type_int.as_obj()
                } else {
                    obj.as_obj().type_of()
                };
                let ty = unsafe { TypeObj::deref(ty_ref) };
                match ty.get_method(name_sym) {
                    Some(m) => {
                        ctx.stack.set(frame, m);
                        ip += 1;
                    }
                    None => {
                        let name = crate::object::symbol_obj::as_str(name_sym).to_string();
                        exception_obj::throw_format(
                            ctx,
                            "key",
                            obj,
                            format!("method `{}' does not exist", name),
                        );
                        throw!();
                    }
                }
            }

            Opcode::Imp => {
                let (tgt, name) = instr::operands_abw(word);
                let slot = reg!(tgt);
                let name_sym = func_obj::symbol(func, sym_idx!(name));
                match crate::loader::import(ctx, name_sym) {
                    Ok(module) => {
                        ctx.stack.set(slot, module);
                        ip += 1;
                    }
                    Err(Thrown) => throw!(),
                }
            }

            Opcode::ImpSub => {
                // Reserved, not implemented.
                panic_ill(ctx, func, ip, "IMPSUB is not implemented");
            }

            Opcode::LdLoc => {
                let (val, loc) = instr::operands_abw(word);
                let val_slot = reg!(val);
                let loc_slot = reg!(loc);
                let v = ctx.stack.get(loc_slot);
                ctx.stack.set(val_slot, v);
                ip += 1;
            }

            Opcode::StLoc => {
                let (val, loc) = instr::operands_abw(word);
                let val_slot = reg!(val);
                let loc_slot = reg!(loc);
                let v = ctx.stack.get(val_slot);
                ctx.stack.set(loc_slot, v);
                ip += 1;
            }

            Opcode::LdGlb => {
                let (val, name) = instr::operands_abw(word);
                let slot = reg!(val);
                let name_sym = func_obj::symbol(func, sym_idx!(name));
                let module_v = func_obj::module(func);
                if module_v.is_smallint() {
                    panic_ill(ctx, func, ip, "function has no module");
                }
                let module = module_v.as_obj();
                let id = match module_obj::find(module, name_sym) {
                    Some(id) => id,
                    None => {
                        // Fall back to the parents, caching the binding here.
                        let Some(v) = module_obj::parent_get(ctx, module, name_sym) else {
                            let name = crate::object::symbol_obj::as_str(name_sym).to_string();
                            exception_obj::throw_format(
                                ctx,
                                "key",
                                name_sym,
                                format!("variable `{}' is not defined", name),
                            );
                            throw!();
                        };
                        let t = ctx.stack.alloc_temp(3);
                        ctx.stack.set(t, module_v);
                        ctx.stack.set(t + 1, name_sym);
                        ctx.stack.set(t + 2, v);
                        let set = module_obj::set(ctx, t, t + 1, t + 2);
                        ctx.stack.free_temp(3);
                        match set {
                            Ok(id) => id,
                            Err(Thrown) => throw!(),
                        }
                    }
                };
                // Self-modifying cache: rewrite to the direct-indexed form.
                if id as u32 <= instr::GLOBAL_INDEX_MAX {
                    let func = ctx.stack.current_function().as_obj();
                    func_obj::rewrite_bytecode_word(
                        func,
                        ip as usize,
                        instr::make_abw(Opcode::LdGlbX, val, id as u32),
                    );
                }
                let func = ctx.stack.current_function().as_obj();
                let module = func_obj::module(func).as_obj();
                ctx.stack.set(slot, module_obj::get_i(module, id));
                ip += 1;
            }

            Opcode::StGlb => {
                let (val, name) = instr::operands_abw(word);
                let slot = reg!(val);
                let name_sym = func_obj::symbol(func, sym_idx!(name));
                let module_v = func_obj::module(func);
                if module_v.is_smallint() {
                    panic_ill(ctx, func, ip, "function has no module");
                }
                let t = ctx.stack.alloc_temp(2);
                ctx.stack.set(t, module_v);
                ctx.stack.set(t + 1, name_sym);
                let set = module_obj::set(ctx, t, t + 1, slot);
                ctx.stack.free_temp(2);
                let id = match set {
                    Ok(id) => id,
                    Err(Thrown) => throw!(),
                };
                if id as u32 <= instr::GLOBAL_INDEX_MAX {
                    let func = ctx.stack.current_function().as_obj();
                    func_obj::rewrite_bytecode_word(
                        func,
                        ip as usize,
                        instr::make_abw(Opcode::StGlbX, val, id as u32),
                    );
                }
                ip += 1;
            }

            Opcode::LdGlbX => {
                let (val, id) = instr::operands_abw(word);
                let slot = reg!(val);
                let module_v = func_obj::module(func);
                if module_v.is_smallint() {
                    panic_ill(ctx, func, ip, "function has no module");
                }
                let module = module_v.as_obj();
                if id as usize >= module_obj::var_count(module) {
                    panic_ill(ctx, func, ip, "global index out of range");
                }
                ctx.stack.set(slot, module_obj::get_i(module, id as usize));
                ip += 1;
            }

            Opcode::StGlbX => {
                let (val, id) = instr::operands_abw(word);
                let slot = reg!(val);
                let module_v = func_obj::module(func);
                if module_v.is_smallint() {
                    panic_ill(ctx, func, ip, "function has no module");
                }
                let module = module_v.as_obj();
                if id as usize >= module_obj::var_count(module) {
                    panic_ill(ctx, func, ip, "global index out of range");
                }
                module_obj::set_i(module, id as usize, ctx.stack.get(slot));
                ip += 1;
            }

            Opcode::LdFldY => {
                let (name, fld, obj_reg) = instr::operands_abc(word);
                let fld_slot = reg!(fld);
                let obj_slot = reg!(obj_reg);
                let name_sym = func_obj::symbol(func, sym_idx!(name));
                let obj = ctx.stack.get(obj_slot);
                if obj.type_is(ctx.globals.type_module) {
                    match module_obj::get(obj.as_obj(), name_sym) {
                        Some(v) => ctx.stack.set(fld_slot, v),
                        None => {
                            let name = crate::object::symbol_obj::as_str(name_sym).to_string();
                            exception_obj::throw_format(
                                ctx,
                                "key",
                                name_sym,
                                format!("variable `{}' is not defined", name),
                            );
                            throw!();
                        }
                    }
                } else if obj.type_is(ctx.globals.type_type) {
                    let ty = unsafe { TypeObj::deref(obj.as_obj()) };
                    match ty.get_static(name_sym) {
                        Some(v) => ctx.stack.set(fld_slot, v),
                        None => {
                            exception_obj::throw_format(
                                ctx,
                                "key",
                                name_sym,
                                "field does not exist".to_string(),
                            );
                            throw!();
                        }
                    }
                } else if !obj.is_smallint() {
                    let ty = unsafe { TypeObj::deref(obj.as_obj().type_of()) };
                    match ty.find_field(name_sym) {
                        Some(index) => {
                            debug_assert!(index < obj.as_obj().slot_count());
                            ctx.stack.set(fld_slot, obj.as_obj().slot(index));
                        }
                        None => {
                            exception_obj::throw_format(
                                ctx,
                                "key",
                                name_sym,
                                "field does not exist".to_string(),
                            );
                            throw!();
                        }
                    }
                } else {
                    exception_obj::throw_format(
                        ctx,
                        "key",
                        name_sym,
                        "field does not exist".to_string(),
                    );
                    throw!();
                }
                ip += 1;
            }

            Opcode::StFldY => {
                let (name, fld, obj_reg) = instr::operands_abc(word);
                let fld_slot = reg!(fld);
                let obj_slot = reg!(obj_reg);
                let name_sym = func_obj::symbol(func, sym_idx!(name));
                let obj = ctx.stack.get(obj_slot);
                if obj.type_is(ctx.globals.type_module) {
                    let t = ctx.stack.alloc_temp(2);
                    ctx.stack.set(t, obj);
                    ctx.stack.set(t + 1, name_sym);
                    let set = module_obj::set(ctx, t, t + 1, fld_slot);
                    ctx.stack.free_temp(2);
                    if set.is_err() {
                        throw!();
                    }
                } else if !obj.is_smallint() {
                    let ty = unsafe { TypeObj::deref(obj.as_obj().type_of()) };
                    match ty.find_field(name_sym) {
                        Some(index) => {
                            debug_assert!(index < obj.as_obj().slot_count());
                            obj.as_obj().set_slot(index, ctx.stack.get(fld_slot));
                        }
                        None => {
                            exception_obj::throw_format(
                                ctx,
                                "key",
                                name_sym,
                                "field does not exist".to_string(),
                            );
                            throw!();
                        }
                    }
                } else {
                    exception_obj::throw_format(
                        ctx,
                        "key",
                        name_sym,
                        "field does not exist".to_string(),
                    );
                    throw!();
                }
                ip += 1;
            }

            Opcode::LdFldX => {
                let (index, fld, obj_reg) = instr::operands_abc(word);
                let fld_slot = reg!(fld);
                let obj_slot = reg!(obj_reg);
                let obj = ctx.stack.get(obj_slot);
                if obj.is_smallint() || index as usize >= obj.as_obj().slot_count() {
                    panic_ill(ctx, func, ip, "field index out of range");
                }
                ctx.stack.set(fld_slot, obj.as_obj().slot(index as usize));
                ip += 1;
            }

            Opcode::StFldX => {
                let (index, fld, obj_reg) = instr::operands_abc(word);
                let fld_slot = reg!(fld);
                let obj_slot = reg!(obj_reg);
                let obj = ctx.stack.get(obj_slot);
                if obj.is_smallint() || index as usize >= obj.as_obj().slot_count() {
                    panic_ill(ctx, func, ip, "field index out of range");
                }
                obj.as_obj().set_slot(index as usize, ctx.stack.get(fld_slot));
                ip += 1;
            }

            Opcode::LdElm => {
                let (key, elm, obj_reg) = instr::operands_abc(word);
                let _ = reg!(key);
                let _ = reg!(elm);
                let _ = reg!(obj_reg);
                let name = ctx.globals.sym_get_element;
                method_call!(name, elm, &[obj_reg, key]);
            }

            Opcode::StElm => {
                let (key, elm, obj_reg) = instr::operands_abc(word);
                let _ = reg!(key);
                let _ = reg!(elm);
                let _ = reg!(obj_reg);
                let name = ctx.globals.sym_set_element;
                method_call!(name, 0, &[obj_reg, key, elm]);
            }

            Opcode::LdElmI => {
                let (key, elm, obj_reg) = instr::operands_asbc(word);
                let _ = reg!(elm);
                let _ = reg!(obj_reg);
                if elm == 0 || obj_reg == 0 {
                    warn!("LDELMI {} {} {}: REG-0 is occupied by operands", key, elm, obj_reg);
                }
                ctx.stack.set(frame, Value::smallint(key as isize));
                let name = ctx.globals.sym_get_element;
                method_call!(name, elm, &[obj_reg, 0]);
            }

            Opcode::StElmI => {
                let (key, elm, obj_reg) = instr::operands_asbc(word);
                let _ = reg!(elm);
                let _ = reg!(obj_reg);
                if elm == 0 || obj_reg == 0 {
                    warn!("STELMI {} {} {}: REG-0 is occupied by operands", key, elm, obj_reg);
                }
                ctx.stack.set(frame, Value::smallint(key as isize));
                let name = ctx.globals.sym_set_element;
                method_call!(name, 0, &[obj_reg, 0, elm]);
            }

            Opcode::Jmp => {
                let offset = instr::operands_asw(word);
                jump_to!(offset);
            }

            Opcode::JmpT | Opcode::JmpF => {
                let (offset, cond) = instr::operands_asbw(word);
                let cond_slot = reg!(cond);
                let cond_v = ctx.stack.get(cond_slot);
                let want_true = op == Opcode::JmpT;
                if cond_v == ctx.globals.val_true {
                    if want_true {
                        jump_to!(offset);
                    }
                    ip += 1;
                } else if cond_v == ctx.globals.val_false {
                    if !want_true {
                        jump_to!(offset);
                    }
                    ip += 1;
                } else {
                    exception_obj::throw_format(
                        ctx,
                        "type",
                        cond_v,
                        "condition expression is not boolean".to_string(),
                    );
                    throw!();
                }
            }

            Opcode::JmpLe | Opcode::JmpLt | Opcode::JmpGt | Opcode::JmpGe => {
                let (offset, lhs, rhs) = instr::operands_asbc(word);
                let lhs_v = ctx.stack.get(reg!(lhs));
                let rhs_v = ctx.stack.get(reg!(rhs));
                let ord = match protocol::compare(ctx, lhs_v, rhs_v) {
                    Ok(ord) => ord,
                    Err(Thrown) => throw!(),
                };
                use std::cmp::Ordering::*;
                let taken = match op {
                    Opcode::JmpLe => ord != Greater,
                    Opcode::JmpLt => ord == Less,
                    Opcode::JmpGt => ord == Greater,
                    _ => ord != Less,
                };
                if taken {
                    jump_to!(offset);
                }
                ip += 1;
            }

            Opcode::JmpEq | Opcode::JmpNe => {
                let (offset, lhs, rhs) = instr::operands_asbc(word);
                let lhs_v = ctx.stack.get(reg!(lhs));
                let rhs_v = ctx.stack.get(reg!(rhs));
                let eq = protocol::equals(ctx, lhs_v, rhs_v);
                if eq == (op == Opcode::JmpEq) {
                    jump_to!(offset);
                }
                ip += 1;
            }

            Opcode::Cmp => {
                let (tgt, lhs, rhs) = instr::operands_abc(word);
                let tgt_slot = reg!(tgt);
                let lhs_v = ctx.stack.get(reg!(lhs));
                let rhs_v = ctx.stack.get(reg!(rhs));
                if lhs_v == rhs_v {
                    ctx.stack.set(tgt_slot, Value::smallint(0));
                    ip += 1;
                } else if lhs_v.is_smallint() && rhs_v.is_smallint() {
                    let ord = if lhs_v.as_smallint() < rhs_v.as_smallint() { -1 } else { 1 };
                    ctx.stack.set(tgt_slot, Value::smallint(ord));
                    ip += 1;
                } else {
                    let name = ctx.globals.sym_cmp;
                    method_call!(name, tgt, &[lhs, rhs]);
                }
            }

            Opcode::CmpLe | Opcode::CmpLt | Opcode::CmpGt | Opcode::CmpGe => {
                let (tgt, lhs, rhs) = instr::operands_abc(word);
                let tgt_slot = reg!(tgt);
                let lhs_v = ctx.stack.get(reg!(lhs));
                let rhs_v = ctx.stack.get(reg!(rhs));
                let ord = match protocol::compare(ctx, lhs_v, rhs_v) {
                    Ok(ord) => ord,
                    Err(Thrown) => throw!(),
                };
                use std::cmp::Ordering::*;
                let result = match op {
                    Opcode::CmpLe => ord != Greater,
                    Opcode::CmpLt => ord == Less,
                    Opcode::CmpGt => ord == Greater,
                    _ => ord != Less,
                };
                let b = crate::object::bool_obj::make(ctx, result);
                ctx.stack.set(tgt_slot, b);
                ip += 1;
            }

            Opcode::CmpEq => {
                let (tgt, lhs, rhs) = instr::operands_abc(word);
                let tgt_slot = reg!(tgt);
                let lhs_v = ctx.stack.get(reg!(lhs));
                let rhs_v = ctx.stack.get(reg!(rhs));
                if lhs_v == rhs_v {
                    let b = crate::object::bool_obj::make(ctx, true);
                    ctx.stack.set(tgt_slot, b);
                    ip += 1;
                } else if lhs_v.is_smallint() && rhs_v.is_smallint() {
                    let b = crate::object::bool_obj::make(ctx, false);
                    ctx.stack.set(tgt_slot, b);
                    ip += 1;
                } else {
                    let name = ctx.globals.sym_equ;
                    method_call!(name, tgt, &[lhs, rhs]);
                }
            }

            Opcode::CmpNe => {
                let (tgt, lhs, rhs) = instr::operands_abc(word);
                let tgt_slot = reg!(tgt);
                let lhs_v = ctx.stack.get(reg!(lhs));
                let rhs_v = ctx.stack.get(reg!(rhs));
                let eq = protocol::equals(ctx, lhs_v, rhs_v);
                let b = crate::object::bool_obj::make(ctx, !eq);
                ctx.stack.set(tgt_slot, b);
                ip += 1;
            }

            Opcode::Add | Opcode::Sub | Opcode::Mul => {
                let (tgt, lhs, rhs) = instr::operands_abc(word);
                let tgt_slot = reg!(tgt);
                let lhs_v = ctx.stack.get(reg!(lhs));
                let rhs_v = ctx.stack.get(reg!(rhs));
                if lhs_v.is_smallint() && rhs_v.is_smallint() {
                    let a = lhs_v.as_smallint() as i128;
                    let b = rhs_v.as_smallint() as i128;
                    let result = match op {
                        Opcode::Add => a + b,
                        Opcode::Sub => a - b,
                        _ => a * b,
                    };
                    // Overflow promotes to a boxed Int.
                    let v = int_obj::make(ctx, result);
                    ctx.stack.set(tgt_slot, v);
                    ip += 1;
                } else {
                    let name = match op {
                        Opcode::Add => ctx.globals.sym_add,
                        Opcode::Sub => ctx.globals.sym_sub,
                        _ => ctx.globals.sym_mul,
                    };
                    method_call!(name, tgt, &[lhs, rhs]);
                }
            }

            Opcode::Div => {
                let (tgt, lhs, rhs) = instr::operands_abc(word);
                let tgt_slot = reg!(tgt);
                let lhs_v = ctx.stack.get(reg!(lhs));
                let rhs_v = ctx.stack.get(reg!(rhs));
                if lhs_v.is_smallint() && rhs_v.is_smallint() {
                    // Integer division yields a Float.
                    let value = lhs_v.as_smallint() as f64 / rhs_v.as_smallint() as f64;
                    let v = float_obj::new(ctx, value);
                    ctx.stack.set(tgt_slot, v);
                    ip += 1;
                } else {
                    let name = ctx.globals.sym_div;
                    method_call!(name, tgt, &[lhs, rhs]);
                }
            }

            Opcode::Rem => {
                let (tgt, lhs, rhs) = instr::operands_abc(word);
                let tgt_slot = reg!(tgt);
                let lhs_v = ctx.stack.get(reg!(lhs));
                let rhs_v = ctx.stack.get(reg!(rhs));
                if lhs_v.is_smallint() && rhs_v.is_smallint() && rhs_v.as_smallint() != 0 {
                    let v = Value::smallint(lhs_v.as_smallint() % rhs_v.as_smallint());
                    ctx.stack.set(tgt_slot, v);
                    ip += 1;
                } else {
                    let name = ctx.globals.sym_rem;
                    method_call!(name, tgt, &[lhs, rhs]);
                }
            }

            Opcode::Pow => {
                let (tgt, lhs, rhs) = instr::operands_abc(word);
                let _ = reg!(tgt);
                let _ = reg!(lhs);
                let _ = reg!(rhs);
                let name = ctx.globals.sym_pow;
                method_call!(name, tgt, &[lhs, rhs]);
            }

            Opcode::Shl | Opcode::Shr => {
                let (tgt, lhs, rhs) = instr::operands_abc(word);
                let tgt_slot = reg!(tgt);
                let lhs_v = ctx.stack.get(reg!(lhs));
                let rhs_v = ctx.stack.get(reg!(rhs));
                let fast = if lhs_v.is_smallint() && rhs_v.is_smallint() {
                    let a = lhs_v.as_smallint();
                    let sh = rhs_v.as_smallint();
                    let sh_limit = crate::util::constants::BITS_IN_WORD as isize - 1;
                    if a >= 0 && sh >= 0 && sh < sh_limit {
                        if op == Opcode::Shr {
                            Some(Value::smallint(a >> sh))
                        } else {
                            let shifted = a << sh;
                            if shifted >> sh == a {
                                Value::try_smallint(shifted)
                            } else {
                                None
                            }
                        }
                    } else {
                        None
                    }
                } else {
                    None
                };
                match fast {
                    Some(v) => {
                        ctx.stack.set(tgt_slot, v);
                        ip += 1;
                    }
                    None => {
                        let name = if op == Opcode::Shl {
                            ctx.globals.sym_shl
                        } else {
                            ctx.globals.sym_shr
                        };
                        method_call!(name, tgt, &[lhs, rhs]);
                    }
                }
            }

            Opcode::BitAnd | Opcode::BitOr | Opcode::BitXor => {
                let (tgt, lhs, rhs) = instr::operands_abc(word);
                let tgt_slot = reg!(tgt);
                let lhs_v = ctx.stack.get(reg!(lhs));
                let rhs_v = ctx.stack.get(reg!(rhs));
                if lhs_v.is_smallint()
                    && rhs_v.is_smallint()
                    && lhs_v.as_smallint() >= 0
                    && rhs_v.as_smallint() >= 0
                {
                    let a = lhs_v.as_smallint();
                    let b = rhs_v.as_smallint();
                    let result = match op {
                        Opcode::BitAnd => a & b,
                        Opcode::BitOr => a | b,
                        _ => a ^ b,
                    };
                    ctx.stack.set(tgt_slot, Value::smallint(result));
                    ip += 1;
                } else {
                    let name = match op {
                        Opcode::BitAnd => ctx.globals.sym_bitand,
                        Opcode::BitOr => ctx.globals.sym_bitor,
                        _ => ctx.globals.sym_bitxor,
                    };
                    method_call!(name, tgt, &[lhs, rhs]);
                }
            }

            Opcode::Not => {
                let (tgt, val) = instr::operands_abw(word);
                let tgt_slot = reg!(tgt);
                let val_v = ctx.stack.get(reg!(val));
                if val_v == ctx.globals.val_true {
                    let b = ctx.globals.val_false;
                    ctx.stack.set(tgt_slot, b);
                } else if val_v == ctx.globals.val_false {
                    let b = ctx.globals.val_true;
                    ctx.stack.set(tgt_slot, b);
                } else {
                    exception_obj::throw_format(
                        ctx,
                        "type",
                        val_v,
                        "condition expression is not boolean".to_string(),
                    );
                    throw!();
                }
                ip += 1;
            }

            Opcode::Neg => {
                let (tgt, val) = instr::operands_abw(word);
                let tgt_slot = reg!(tgt);
                let val_v = ctx.stack.get(reg!(val));
                if val_v.is_smallint() && val_v.as_smallint() != SMALLINT_MIN {
                    ctx.stack.set(tgt_slot, Value::smallint(-val_v.as_smallint()));
                    ip += 1;
                } else {
                    let name = ctx.globals.sym_neg;
                    method_call!(name, tgt, &[val]);
                }
            }

            Opcode::BitNot => {
                let (tgt, val) = instr::operands_abw(word);
                let tgt_slot = reg!(tgt);
                let val_v = ctx.stack.get(reg!(val));
                if val_v.is_smallint() && val_v.as_smallint() >= 0 {
                    ctx.stack.set(tgt_slot, Value::smallint(!val_v.as_smallint()));
                    ip += 1;
                } else {
                    let name = ctx.globals.sym_bitnot;
                    method_call!(name, tgt, &[val]);
                }
            }
        }
    }
}
