//! End-to-end scenarios against the recording assembler.
//!
//! These drive the front-end API the way a bytecode translator would and
//! assert on the recorded operation stream: operand placement, spill and
//! reload shapes, constant folding, junction agreement.

use evra::assembler::{
    AsmOperand, BinaryOperation, Operation, TernaryOperation, TraceHandler, UnaryOperation,
};
use evra::core::test_utils::{
    test_compiler, test_compiler_with, RecordedOp, TestArchitecture, TestTraceHandler,
};
use evra::{pad, Argument, BYTES_PER_WORD};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn is_move_to_register(op: &RecordedOp, register: u8) -> bool {
    matches!(
        op,
        RecordedOp::Binary {
            op: BinaryOperation::Move,
            b: AsmOperand::Register { low, .. },
            ..
        } if *low == register
    )
}

fn is_move_to_frame_offset(op: &RecordedOp, offset: i32) -> bool {
    matches!(
        op,
        RecordedOp::Binary {
            op: BinaryOperation::Move,
            b: AsmOperand::Memory { base: 7, offset: o, .. },
            ..
        } if *o == offset
    )
}

fn is_move_from_frame_offset(op: &RecordedOp, offset: i32) -> bool {
    matches!(
        op,
        RecordedOp::Binary {
            op: BinaryOperation::Move,
            a: AsmOperand::Memory { base: 7, offset: o, .. },
            ..
        } if *o == offset
    )
}

/// return (a + b) * c with a, b, c in locals 0..2: three-address
/// arithmetic lands in the return register and the frame is popped.
#[test]
fn test_arithmetic_lands_in_return_register() {
    init_logging();
    let arena = bumpalo::Bump::new();
    let mut c = test_compiler(&arena);
    c.init(1, 0, 3, 8);

    c.start_logical_ip(0);
    c.init_local(4, 0);
    c.init_local(4, 1);
    c.init_local(4, 2);

    let a = c.load_local(4, 0);
    let b = c.load_local(4, 1);
    let sum = c.add(4, a, b);
    let cc = c.load_local(4, 2);
    let product = c.mul(4, sum, cc);
    c.ret(4, Some(product));

    let size = c.compile().unwrap();
    assert!(size > 0);

    let asm = c.assembler();
    assert_eq!(
        asm.count(|op| matches!(op, RecordedOp::Ternary { op: TernaryOperation::Add, .. })),
        1
    );
    assert_eq!(
        asm.count(|op| matches!(
            op,
            RecordedOp::Ternary {
                op: TernaryOperation::Multiply,
                ..
            }
        )),
        1
    );

    // Condensed addressing: the multiply's result operand is its second
    // operand's site.
    let mul = asm
        .ops
        .iter()
        .find_map(|op| match op {
            RecordedOp::Ternary {
                op: TernaryOperation::Multiply,
                b,
                c,
                ..
            } => Some((*b, *c)),
            _ => None,
        })
        .unwrap();
    assert_eq!(mul.0, mul.1);

    // The result is moved into the return register before returning.
    assert!(asm.count(|op| is_move_to_register(op, 0)) >= 1);
    let last_two = &asm.ops[asm.ops.len() - 2..];
    assert_eq!(last_two[0], RecordedOp::PopFrame);
    assert_eq!(last_two[1], RecordedOp::Op(Operation::Return));
}

/// Comparing two equal constants emits no compare; the unsatisfied
/// conditional branch disappears and only the unconditional jump remains.
#[test]
fn test_constant_compare_folds_into_branch() {
    init_logging();
    let arena = bumpalo::Bump::new();
    let mut c = test_compiler(&arena);
    c.init(3, 0, 0, 2);

    c.start_logical_ip(0);
    let a = c.constant(3);
    let b = c.constant(3);
    c.cmp(4, a, b);

    let then_ip = c.machine_ip(1);
    let then_target = c.address(then_ip);
    c.jl(then_target);

    let else_ip = c.machine_ip(2);
    let else_target = c.address(else_ip);
    c.jmp(else_target);

    c.start_logical_ip(1);
    let one = c.constant(1);
    c.ret(4, Some(one));

    c.start_logical_ip(2);
    let two = c.constant(2);
    c.ret(4, Some(two));

    c.compile().unwrap();

    let asm = c.assembler();
    assert_eq!(
        asm.count(|op| matches!(
            op,
            RecordedOp::Binary {
                op: BinaryOperation::Compare,
                ..
            }
        )),
        0
    );
    assert_eq!(
        asm.count(|op| matches!(
            op,
            RecordedOp::Unary {
                op: UnaryOperation::JumpIfLess,
                ..
            }
        )),
        0
    );
    assert_eq!(
        asm.count(|op| matches!(op, RecordedOp::Unary { op: UnaryOperation::Jump, .. })),
        1
    );
}

/// Five word arguments: the first three go to the argument registers,
/// the rest to frame slots beyond the consumed footprint; a live local
/// survives the call in its canonical frame slot and reloads from there.
#[test]
fn test_call_argument_placement_and_reload() {
    init_logging();
    let arena = bumpalo::Bump::new();
    let mut c = test_compiler(&arena);
    c.init(1, 0, 1, 12);

    c.start_logical_ip(0);
    c.init_local(4, 0);
    let live = c.load_local(4, 0);

    let args: Vec<Argument> = (0..5)
        .map(|i| {
            let value = c.constant(10 + i);
            Argument { value, size: 4 }
        })
        .collect();
    let helper = c.constant(0x1234);
    let result = c.call(helper, 0, None, 4, &args);

    let total = c.add(4, result, live);
    c.ret(4, Some(total));

    c.compile().unwrap();

    let asm = c.assembler();
    for register in [0u8, 1, 2] {
        assert_eq!(
            asm.count(|op| matches!(
                op,
                RecordedOp::Binary {
                    op: BinaryOperation::Move,
                    a: AsmOperand::Constant(_),
                    b: AsmOperand::Register { low, .. },
                    ..
                } if *low == register
            )),
            1,
            "argument register {register}"
        );
    }
    // Stack arguments land at frame indices 0 and 1.
    let word = BYTES_PER_WORD as i32;
    assert_eq!(asm.count(|op| is_move_to_frame_offset(op, word)), 1);
    assert_eq!(asm.count(|op| is_move_to_frame_offset(op, 2 * word)), 1);

    let call_index = asm
        .ops
        .iter()
        .position(|op| matches!(op, RecordedOp::Unary { op: UnaryOperation::Call, .. }))
        .unwrap();

    // Local 0 lives at frame index 11 and reloads from there after the
    // call.
    let local_offset = 12 * word;
    let reload_index = asm
        .ops
        .iter()
        .position(|op| is_move_from_frame_offset(op, local_offset))
        .unwrap();
    assert!(reload_index > call_index);
}

/// Saving state, compiling one future, rewinding and compiling another:
/// both paths get their own multi-read continuations and neither
/// corrupts the other's constraints.
#[test]
fn test_fork_and_restore_keeps_paths_separate() {
    init_logging();
    let arena = bumpalo::Bump::new();
    let mut c = test_compiler(&arena);
    c.init(1, 0, 2, 8);

    c.start_logical_ip(0);
    c.init_local(4, 0);
    c.init_local(4, 1);

    let state = c.save_state();

    let x = c.load_local(4, 0);
    let y = c.load_local(4, 1);
    let _sum = c.add(4, x, y);

    c.restore_state(state);

    let x = c.load_local(4, 0);
    let y = c.load_local(4, 1);
    let product = c.mul(4, x, y);
    c.ret(4, Some(product));

    c.compile().unwrap();

    let asm = c.assembler();
    assert_eq!(
        asm.count(|op| matches!(op, RecordedOp::Ternary { op: TernaryOperation::Add, .. })),
        1
    );
    assert_eq!(
        asm.count(|op| matches!(
            op,
            RecordedOp::Ternary {
                op: TernaryOperation::Multiply,
                ..
            }
        )),
        1
    );
}

/// A loop back-edge forms a junction at the loop head: the predecessor
/// that does not already hold the value at the agreed frame slot gets
/// the missing move.
#[test]
fn test_junction_agreement_inserts_missing_move() {
    init_logging();
    let arena = bumpalo::Bump::new();
    let mut c = test_compiler(&arena);
    c.init(4, 0, 1, 8);

    c.start_logical_ip(0);
    c.init_local(4, 0);

    // Loop head: local 0 += 1.
    c.start_logical_ip(1);
    let x = c.load_local(4, 0);
    let one = c.constant(1);
    let next = c.add(4, one, x);
    c.store_local(4, next, 0);

    // Loop test: branch back while local 0 < 10.
    c.start_logical_ip(2);
    let current = c.load_local(4, 0);
    let limit = c.constant(10);
    c.cmp(4, current, limit);
    let head_ip = c.machine_ip(1);
    let head = c.address(head_ip);
    c.jl(head);
    c.visit_logical_ip(1);

    c.start_logical_ip(3);
    c.ret(4, None);

    c.compile().unwrap();

    let asm = c.assembler();
    assert_eq!(
        asm.count(|op| matches!(
            op,
            RecordedOp::Binary {
                op: BinaryOperation::Compare,
                ..
            }
        )),
        1
    );
    assert_eq!(
        asm.count(|op| matches!(
            op,
            RecordedOp::Unary {
                op: UnaryOperation::JumpIfLess,
                ..
            }
        )),
        1
    );

    // Local 0's junction site is its canonical frame slot; the loop
    // keeps the updated counter in a register, so the back edge stores
    // it home.
    let word = BYTES_PER_WORD as i32;
    let local_offset = 8 * word;
    assert!(asm.count(|op| is_move_to_frame_offset(op, local_offset)) >= 1);
}

/// Under register exhaustion a named temporary is evicted to its
/// canonical frame slot once and reloaded once.
#[test]
fn test_spill_emits_one_store_and_one_reload() {
    init_logging();
    let arena = bumpalo::Bump::new();
    // Registers 0 and 1 are the only allocatable ones.
    let arch = TestArchitecture {
        reserved_mask: !0b11 & 0xff,
        ..TestArchitecture::default()
    };
    let mut c = test_compiler_with(&arena, arch);
    c.init(1, 0, 4, 8);

    c.start_logical_ip(0);
    for i in 0..4 {
        c.init_local(4, i);
    }

    let a = c.load_local(4, 0);
    let b = c.load_local(4, 1);
    let t1 = c.add(4, a, b);
    c.store_local(4, t1, 0);

    let cc = c.load_local(4, 2);
    let d = c.load_local(4, 3);
    let t2 = c.add(4, cc, d);

    let t1 = c.load_local(4, 0);
    let t3 = c.add(4, t1, t2);
    c.ret(4, Some(t3));

    c.compile().unwrap();

    let asm = c.assembler();
    let word = BYTES_PER_WORD as i32;
    let slot = 8 * word;

    let store_indices: Vec<_> = (0..asm.ops.len())
        .filter(|&i| is_move_to_frame_offset(&asm.ops[i], slot))
        .collect();
    assert_eq!(store_indices.len(), 1, "exactly one spill store");

    let reloads_after_store = (store_indices[0]..asm.ops.len())
        .filter(|&i| is_move_from_frame_offset(&asm.ops[i], slot))
        .count();
    assert_eq!(reloads_after_store, 1, "exactly one reload");
}

/// Unencodable operations lower to a call of a runtime helper with both
/// operands passed as arguments.
#[test]
fn test_thunk_lowering_calls_runtime_helper() {
    init_logging();
    let arena = bumpalo::Bump::new();
    let mut arch = TestArchitecture::default();
    arch.thunk_ops.insert(TernaryOperation::Divide);
    let mut c = test_compiler_with(&arena, arch);
    c.init(1, 0, 2, 8);

    c.start_logical_ip(0);
    c.init_local(4, 0);
    c.init_local(4, 1);
    let a = c.load_local(4, 0);
    let b = c.load_local(4, 1);
    let q = c.div(4, a, b);
    c.ret(4, Some(q));

    c.compile().unwrap();

    assert_eq!(
        c.assembler().count(|op| matches!(
            op,
            RecordedOp::Ternary {
                op: TernaryOperation::Divide,
                ..
            }
        )),
        0
    );
    assert_eq!(
        c.assembler()
            .count(|op| matches!(op, RecordedOp::Unary { op: UnaryOperation::Call, .. })),
        1
    );

    // Both operands travelled through the argument registers.
    assert!(c.assembler().count(|op| is_move_to_register(op, 0)) >= 1);
    assert!(c.assembler().count(|op| is_move_to_register(op, 1)) >= 1);
}

/// Trace handlers receive a code promise that resolves to an address
/// inside the written code.
#[test]
fn test_trace_handler_receives_resolvable_promise() {
    init_logging();
    let arena = bumpalo::Bump::new();
    let mut c = test_compiler(&arena);
    c.init(1, 0, 0, 4);

    let promises = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    let handler: Box<dyn TraceHandler> = Box::new(TestTraceHandler(promises.clone()));

    c.start_logical_ip(0);
    let helper = c.constant(0x1234);
    let arg = c.constant(7);
    c.call(helper, 0, Some(handler), 4, &[Argument { value: arg, size: 4 }]);
    c.ret(4, None);

    let size = c.compile().unwrap();
    let mut out = vec![0u8; pad(size) as usize + c.pool_size() as usize];
    c.write_to(&mut out).unwrap();

    let recorded = promises.borrow();
    assert_eq!(recorded.len(), 1);
    assert!(c.promise_resolved(recorded[0]));
    let value = c.promise_value(recorded[0]).unwrap();
    let base = out.as_ptr() as i64;
    assert!(value >= base && value <= base + size as i64);
}

/// A bounds check against a constant index emits the length compare,
/// the taken-side jump and the handler call.
#[test]
fn test_bounds_check_with_constant_index() {
    init_logging();
    let arena = bumpalo::Bump::new();
    let mut c = test_compiler(&arena);
    c.init(1, 0, 1, 8);

    c.start_logical_ip(0);
    c.init_local(BYTES_PER_WORD, 0);
    let object = c.load_local(BYTES_PER_WORD, 0);
    let index = c.constant(5);
    c.check_bounds(object, 16, index, 0xdead_beef);
    c.ret(4, None);

    c.compile().unwrap();

    let asm = c.assembler();
    assert_eq!(
        asm.count(|op| matches!(
            op,
            RecordedOp::Binary {
                op: BinaryOperation::Compare,
                ..
            }
        )),
        1
    );
    assert_eq!(
        asm.count(|op| matches!(
            op,
            RecordedOp::Unary {
                op: UnaryOperation::JumpIfGreater,
                ..
            }
        )),
        1
    );
    assert_eq!(
        asm.count(|op| matches!(op, RecordedOp::Unary { op: UnaryOperation::Call, .. })),
        1
    );

    // The length operand is a memory site off the object's register.
    assert!(asm.count(|op| matches!(
        op,
        RecordedOp::Binary {
            op: BinaryOperation::Compare,
            b: AsmOperand::Memory { offset: 16, .. },
            ..
        }
    )) == 1);
}

/// A value pushed while it also lives in a local joins that local's
/// buddy ring: reads through the popped copy see the original's sites.
#[test]
fn test_buddy_ring_shares_sites_between_stack_and_local() {
    init_logging();
    let arena = bumpalo::Bump::new();
    let mut c = test_compiler(&arena);
    c.init(1, 0, 1, 4);

    c.start_logical_ip(0);
    let v = c.constant(7);
    c.store_local(4, v, 0);
    let lv = c.load_local(4, 0);
    c.push_value(4, lv);
    let popped = c.pop(4);
    let one = c.constant(1);
    let sum = c.add(4, popped, one);
    c.ret(4, Some(sum));

    c.compile().unwrap();

    // The popped copy never got its own site; the add's first operand is
    // the constant site it sees through the ring.
    let asm = c.assembler();
    assert_eq!(
        asm.count(|op| matches!(
            op,
            RecordedOp::Ternary {
                op: TernaryOperation::Add,
                a: AsmOperand::Constant(_),
                ..
            }
        )),
        1
    );
}

/// Zero-extension keeps its own opcode through the move event.
#[test]
fn test_zero_extending_load() {
    init_logging();
    let arena = bumpalo::Bump::new();
    let mut c = test_compiler(&arena);
    c.init(1, 0, 1, 4);

    c.start_logical_ip(0);
    c.init_local(4, 0);
    let x = c.load_local(4, 0);
    let y = c.loadz(4, x);
    c.ret(4, Some(y));

    c.compile().unwrap();

    assert_eq!(
        c.assembler().count(|op| matches!(
            op,
            RecordedOp::Binary {
                op: BinaryOperation::MoveZ,
                ..
            }
        )),
        1
    );
}

/// Constant-pool entries are appended word-aligned after the code and
/// hold their resolved values.
#[test]
fn test_constant_pool_written_after_code() {
    init_logging();
    let arena = bumpalo::Bump::new();
    let mut c = test_compiler(&arena);
    c.init(1, 0, 0, 2);

    let pool_promise = c.pool_append(0x5a5a_1234);

    c.start_logical_ip(0);
    let v = c.constant(9);
    c.ret(4, Some(v));

    let size = c.compile().unwrap();
    assert_eq!(c.pool_size(), BYTES_PER_WORD);

    let mut out = vec![0u8; pad(size) as usize + c.pool_size() as usize];
    c.write_to(&mut out).unwrap();

    let word = BYTES_PER_WORD as usize;
    let start = pad(size) as usize;
    let mut bytes = [0u8; 8];
    bytes[..word].copy_from_slice(&out[start..start + word]);
    assert_eq!(i64::from_le_bytes(bytes), 0x5a5a_1234);

    // The pool promise itself resolves to the slot's address.
    let expected = out.as_ptr() as i64 + start as i64;
    assert_eq!(c.promise_value(pool_promise).unwrap(), expected);
}
