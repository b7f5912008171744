//! Garbage-collection tests: promotion, write barriers, weak symbols,
//! hash stability across moves, allocation stress, and the unrecoverable
//! panic paths.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use quill::api::catch_panic;
use quill::mem::objmem::GcKind;
use quill::object::GcState;
use quill::{ApiError, ApiValue, Context, MemOptions, PanicCode};

#[test]
fn objects_promote_after_two_fast_collections() {
    let mut ctx = Context::new();
    ctx.make_string(0, "stayin' alive").unwrap();
    assert_eq!(ctx.reg_gc_state(0).unwrap(), Some(GcState::New));
    ctx.collect_garbage(GcKind::Fast);
    assert_eq!(ctx.reg_gc_state(0).unwrap(), Some(GcState::Mid));
    ctx.collect_garbage(GcKind::Fast);
    assert_eq!(ctx.reg_gc_state(0).unwrap(), Some(GcState::Old));
    assert_eq!(ctx.read_string(0).unwrap(), "stayin' alive");
}

#[test]
fn small_ints_have_no_heap_presence() {
    let mut ctx = Context::new();
    ctx.make_int(0, 17).unwrap();
    assert_eq!(ctx.reg_gc_state(0).unwrap(), None);
    ctx.collect_garbage(GcKind::Full);
    assert_eq!(ctx.read_int(0).unwrap(), 17);
}

#[test]
fn write_barrier_keeps_cross_generation_edges() {
    let mut ctx = Context::new();
    ctx.make_values(0, "[i]", &[ApiValue::Int(0)]).unwrap();
    // Promote the array (and its backing) into the old generation.
    ctx.collect_garbage(GcKind::Fast);
    ctx.collect_garbage(GcKind::Fast);
    assert_eq!(ctx.reg_gc_state(0).unwrap(), Some(GcState::Old));

    // Store a freshly allocated (young) string into the old array; only
    // the write barrier keeps it alive through the next fast collection.
    ctx.make_string(2, "young and restless").unwrap();
    ctx.make_int(1, 0).unwrap();
    ctx.set_element(0, 1, 2).unwrap();
    ctx.make_nil(2).unwrap();

    ctx.collect_garbage(GcKind::Fast);
    ctx.get_element(0, 1, 3).unwrap();
    assert_eq!(ctx.read_string(3).unwrap(), "young and restless");
}

#[test]
fn unreferenced_symbols_are_reclaimed() {
    let mut ctx = Context::new();
    let count0 = ctx.symbol_count();
    ctx.native_block(2, |ctx| {
        ctx.make_symbol(1, "an_ephemeral_symbol").unwrap();
        Ok(())
    })
    .unwrap();
    assert_eq!(ctx.symbol_count(), count0 + 1);
    ctx.collect_garbage(GcKind::Full);
    assert_eq!(ctx.symbol_count(), count0);

    // Interning works again after reclamation.
    ctx.make_symbol(0, "an_ephemeral_symbol").unwrap();
    assert_eq!(ctx.symbol_count(), count0 + 1);
}

#[test]
fn interned_symbols_stay_identical_across_collections() {
    let mut ctx = Context::new();
    ctx.make_symbol(0, "durable").unwrap();
    ctx.collect_garbage(GcKind::Full);
    ctx.collect_garbage(GcKind::Fast);
    ctx.make_symbol(1, "durable").unwrap();
    assert!(ctx.values_identical(0, 1).unwrap());
}

#[test]
fn hashes_survive_object_moves() {
    let mut ctx = Context::new();
    ctx.make_values(0, "{}", &[]).unwrap();
    ctx.make_string(1, "key of the kingdom").unwrap();
    ctx.make_int(2, 7).unwrap();
    ctx.set_element(0, 1, 2).unwrap();

    // Move everything around.
    ctx.collect_garbage(GcKind::Full);
    ctx.collect_garbage(GcKind::Fast);
    ctx.collect_garbage(GcKind::Full);

    // A different (but equal) key object still finds the entry.
    ctx.make_string(1, "key of the kingdom").unwrap();
    ctx.get_element(0, 1, 3).unwrap();
    assert_eq!(ctx.read_int(3).unwrap(), 7);
}

#[test]
fn allocation_stress_with_rooted_graph() {
    const MAPS: i64 = 120;
    const ENTRIES: i64 = 40;
    const SEED: i64 = 1000;

    let mut ctx = Context::new();
    let mut rng = StdRng::seed_from_u64(42);

    ctx.make_values(0, "[]", &[]).unwrap();
    for m in 0..MAPS {
        ctx.make_values(1, "{}", &[]).unwrap();
        for i in 0..ENTRIES {
            ctx.make_int(2, SEED + m * ENTRIES + i).unwrap();
            ctx.make_float(3, (SEED + m * ENTRIES + i) as f64).unwrap();
            ctx.set_element(1, 2, 3).unwrap();
        }
        ctx.make_int(2, m).unwrap();
        ctx.insert_element(0, 2, 1).unwrap();

        // Transient garbage between survivors.
        for _ in 0..250 {
            ctx.make_float(4, rng.random::<f64>()).unwrap();
        }
    }

    ctx.collect_garbage(GcKind::Fast);
    ctx.collect_garbage(GcKind::Full);
    ctx.collect_garbage(GcKind::Fast);

    // The maps still hold every entry...
    for m in [0, 1, MAPS / 2, MAPS - 1] {
        ctx.make_int(1, m).unwrap();
        ctx.get_element(0, 1, 2).unwrap();
        for i in [0, 1, ENTRIES / 2, ENTRIES - 1] {
            let k = SEED + m * ENTRIES + i;
            ctx.make_int(3, k).unwrap();
            ctx.get_element(2, 3, 4).unwrap();
            assert_eq!(ctx.read_float(4).unwrap(), k as f64);
        }
    }

    // ...and the array has exactly MAPS elements.  (The failing probe
    // clobbers REG-0 with the exception, so it comes last.)
    ctx.make_int(1, MAPS - 1).unwrap();
    ctx.get_element(0, 1, 2).unwrap();
    ctx.make_int(1, MAPS).unwrap();
    assert_eq!(ctx.get_element(0, 1, 2), Err(ApiError::Exc));
}

#[test]
fn big_space_handles_large_objects() {
    let mut ctx = Context::new();
    // A string well past the non-big allocation bound lands in big space.
    let large = "x".repeat(64 * 1024);
    ctx.make_string(0, &large).unwrap();
    assert_eq!(ctx.reg_gc_state(0).unwrap(), Some(GcState::Big));
    ctx.collect_garbage(GcKind::Full);
    assert_eq!(ctx.read_string_len(0).unwrap(), large.len());

    // Unreferenced big objects are swept by a full collection.
    ctx.make_nil(0).unwrap();
    ctx.collect_garbage(GcKind::Full);
}

#[test]
fn stack_overflow_panics() {
    let mut ctx = Context::new();
    use quill::api::{FuncCode, FunctionDef};
    use quill::interp::instr::{make_abw, make_aw, make_call, Opcode};
    use quill::object::func_obj::FuncMeta;

    // f() = f(), through a global binding.
    let code = [
        make_abw(Opcode::LdGlb, 1, 0),
        make_abw(Opcode::LdLoc, 0, 1),
        make_call(1, 0, [0, 0, 0]),
        make_aw(Opcode::Ret, 1),
    ];
    ctx.make_function(
        0,
        &FunctionDef {
            meta: FuncMeta { na: 0, no: 0, nr: 2 },
            code: FuncCode::Bytecode(&code),
        },
        &["f"],
        None,
        None,
    )
    .unwrap();
    ctx.set_global("f", 0).unwrap();

    let result = catch_panic(std::panic::AssertUnwindSafe(|| ctx.invoke(&[2, 0])));
    assert_eq!(result.unwrap_err(), PanicCode::StackOverflow);
}

#[test]
fn illegal_bytecode_panics() {
    use quill::api::{FuncCode, FunctionDef};
    use quill::interp::instr::{make_abc, Opcode};
    use quill::object::func_obj::FuncMeta;

    // Register operand far outside the frame.
    let mut ctx = Context::new();
    let code = [make_abc(Opcode::Add, 100, 1, 2)];
    ctx.make_function(
        0,
        &FunctionDef {
            meta: FuncMeta { na: 0, no: 0, nr: 3 },
            code: FuncCode::Bytecode(&code),
        },
        &[],
        None,
        None,
    )
    .unwrap();
    let result = catch_panic(std::panic::AssertUnwindSafe(|| ctx.invoke(&[1, 0])));
    assert_eq!(result.unwrap_err(), PanicCode::IllegalBytecode);
}

#[test]
fn running_off_the_bytecode_end_panics() {
    use quill::api::{FuncCode, FunctionDef};
    use quill::interp::instr::{make_aw, Opcode};
    use quill::object::func_obj::FuncMeta;

    let mut ctx = Context::new();
    let code = [make_aw(Opcode::Nop, 0)];
    ctx.make_function(
        0,
        &FunctionDef {
            meta: FuncMeta { na: 0, no: 0, nr: 1 },
            code: FuncCode::Bytecode(&code),
        },
        &[],
        None,
        None,
    )
    .unwrap();
    let result = catch_panic(std::panic::AssertUnwindSafe(|| ctx.invoke(&[0, 0])));
    assert_eq!(result.unwrap_err(), PanicCode::IllegalBytecode);
}

#[test]
fn heap_exhaustion_panics_with_oom() {
    let mut ctx = Context::with_options(&MemOptions {
        new_space_size: 64 * 1024,
        old_space_chunk_size: 256 * 1024,
        old_space_size_max: 256 * 1024,
        ..MemOptions::default()
    });

    let result = catch_panic(std::panic::AssertUnwindSafe(|| {
        // Keep everything alive from a rooted array until nothing fits.
        ctx.make_values(0, "[]", &[]).unwrap();
        let payload = "m".repeat(128);
        for i in 0.. {
            ctx.make_string(2, &payload).unwrap();
            ctx.make_int(1, i).unwrap();
            ctx.insert_element(0, 1, 2).unwrap();
        }
    }));
    assert_eq!(result.unwrap_err(), PanicCode::Oom);
}
