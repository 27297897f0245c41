//! Test utilities: a mock architecture and a recording assembler.
//!
//! The mock target has 8 general registers with register 7 reserved as
//! the stack pointer, argument registers {0, 1, 2} and return registers
//! 0/1. The recording assembler logs every applied operation (one byte of
//! "code" each) and simulates block layout, so tests can assert on the
//! emitted instruction stream without a real encoder.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use bumpalo::Bump;

use crate::assembler::{
    Architecture, AsmOperand, Assembler, AssemblerClient, BinaryOperation, BinaryPlan, Client,
    OffsetToken, OperandConstraint, OperandType, Operation, PromiseResolver, TernaryOperation,
    TernaryPlan, TraceHandler, TypeMask, UnaryOperation, ANY_REGISTER_MASK,
};
use crate::compiler::Compiler;
use crate::core::context::{ArchInfo, Context};
use crate::core::promise::PromiseId;

pub struct TestArchitecture {
    pub condensed: bool,
    /// Bit per register the runtime keeps for itself.
    pub reserved_mask: u64,
    /// Ternary operations reported as unencodable.
    pub thunk_ops: HashSet<TernaryOperation>,
}

impl Default for TestArchitecture {
    fn default() -> Self {
        TestArchitecture {
            condensed: true,
            reserved_mask: 1 << 7,
            thunk_ops: HashSet::new(),
        }
    }
}

impl Architecture for TestArchitecture {
    fn register_count(&self) -> u32 {
        8
    }

    fn reserved(&self, register: u8) -> bool {
        self.reserved_mask & (1 << register) != 0
    }

    fn stack(&self) -> u8 {
        7
    }

    fn thread(&self) -> u8 {
        6
    }

    fn argument_register_count(&self) -> u32 {
        3
    }

    fn argument_register(&self, index: u32) -> u8 {
        [0, 1, 2][index as usize]
    }

    fn return_low(&self) -> u8 {
        0
    }

    fn return_high(&self) -> u8 {
        1
    }

    fn frame_header_size(&self) -> u32 {
        2
    }

    fn frame_footer_size(&self) -> u32 {
        1
    }

    fn condensed_addressing(&self) -> bool {
        self.condensed
    }

    fn plan_binary(&self, op: BinaryOperation, _src_size: u32, _dst_size: u32) -> BinaryPlan {
        match op {
            // Comparisons accept immediates on both sides so constant
            // folding stays move-free.
            BinaryOperation::Compare => BinaryPlan {
                src: OperandConstraint::any(),
                dst: OperandConstraint::any(),
                thunk: false,
            },
            _ => BinaryPlan {
                src: OperandConstraint::any(),
                dst: OperandConstraint {
                    type_mask: TypeMask::of(OperandType::Register).with(OperandType::Memory),
                    register_mask: ANY_REGISTER_MASK,
                },
                thunk: false,
            },
        }
    }

    fn plan_ternary(
        &self,
        op: TernaryOperation,
        _first_size: u32,
        _second_size: u32,
        _result_size: u32,
    ) -> TernaryPlan {
        TernaryPlan {
            first: OperandConstraint {
                type_mask: TypeMask::of(OperandType::Register).with(OperandType::Constant),
                register_mask: ANY_REGISTER_MASK,
            },
            second: OperandConstraint {
                type_mask: TypeMask::of(OperandType::Register),
                register_mask: ANY_REGISTER_MASK,
            },
            result: OperandConstraint {
                type_mask: TypeMask::of(OperandType::Register),
                register_mask: ANY_REGISTER_MASK,
            },
            thunk: self.thunk_ops.contains(&op),
        }
    }
}

/// One operation applied through the recording assembler.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedOp {
    AllocateFrame {
        slots: u32,
    },
    PopFrame,
    Op(Operation),
    Unary {
        op: UnaryOperation,
        size: u32,
        a: AsmOperand,
    },
    Binary {
        op: BinaryOperation,
        a_size: u32,
        a: AsmOperand,
        b_size: u32,
        b: AsmOperand,
    },
    Ternary {
        op: TernaryOperation,
        a: AsmOperand,
        b: AsmOperand,
        c: AsmOperand,
    },
}

pub struct TestBlock {
    index: usize,
}

struct BlockSpan {
    begin: usize,
    end: usize,
    start: Option<u32>,
}

/// Records applied operations; each costs one byte of simulated code.
pub struct RecordingAssembler {
    pub arch: TestArchitecture,
    pub ops: Vec<RecordedOp>,
    blocks: Vec<BlockSpan>,
    block_begin: usize,
    tokens: Vec<usize>,
}

impl RecordingAssembler {
    pub fn new() -> RecordingAssembler {
        RecordingAssembler::with_arch(TestArchitecture::default())
    }

    pub fn with_arch(arch: TestArchitecture) -> RecordingAssembler {
        RecordingAssembler {
            arch,
            ops: Vec::new(),
            blocks: Vec::new(),
            block_begin: 0,
            tokens: Vec::new(),
        }
    }

    /// Number of applied operations matching `predicate`.
    pub fn count<F: Fn(&RecordedOp) -> bool>(&self, predicate: F) -> usize {
        self.ops.iter().filter(|op| predicate(*op)).count()
    }
}

impl Default for RecordingAssembler {
    fn default() -> Self {
        RecordingAssembler::new()
    }
}

impl Assembler for RecordingAssembler {
    type Block = TestBlock;

    fn arch(&self) -> &dyn Architecture {
        &self.arch
    }

    fn allocate_frame(&mut self, slot_count: u32) {
        self.ops.push(RecordedOp::AllocateFrame { slots: slot_count });
    }

    fn pop_frame(&mut self) {
        self.ops.push(RecordedOp::PopFrame);
    }

    fn apply_op(&mut self, op: Operation) {
        self.ops.push(RecordedOp::Op(op));
    }

    fn apply_unary(
        &mut self,
        op: UnaryOperation,
        size: u32,
        a: AsmOperand,
        _client: &mut dyn AssemblerClient,
    ) {
        self.ops.push(RecordedOp::Unary { op, size, a });
    }

    fn apply_binary(
        &mut self,
        op: BinaryOperation,
        a_size: u32,
        a: AsmOperand,
        b_size: u32,
        b: AsmOperand,
        _client: &mut dyn AssemblerClient,
    ) {
        self.ops.push(RecordedOp::Binary {
            op,
            a_size,
            a,
            b_size,
            b,
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_ternary(
        &mut self,
        op: TernaryOperation,
        _a_size: u32,
        a: AsmOperand,
        _b_size: u32,
        b: AsmOperand,
        _c_size: u32,
        c: AsmOperand,
        _client: &mut dyn AssemblerClient,
    ) {
        self.ops.push(RecordedOp::Ternary { op, a, b, c });
    }

    fn offset(&mut self) -> OffsetToken {
        let token = self.tokens.len();
        self.tokens.push(self.ops.len());
        OffsetToken(token as u32)
    }

    fn offset_value(&self, token: OffsetToken) -> Option<u32> {
        let op_index = self.tokens[token.0 as usize];
        for block in &self.blocks {
            if block.begin <= op_index && op_index <= block.end {
                return block
                    .start
                    .map(|start| start + (op_index - block.begin) as u32);
            }
        }
        None
    }

    fn end_block(&mut self, _has_next: bool) -> TestBlock {
        let index = self.blocks.len();
        self.blocks.push(BlockSpan {
            begin: self.block_begin,
            end: self.ops.len(),
            start: None,
        });
        self.block_begin = self.ops.len();
        TestBlock { index }
    }

    fn resolve_block(&mut self, block: &TestBlock, start: u32, _next: Option<&TestBlock>) -> u32 {
        let span = &mut self.blocks[block.index];
        span.start = Some(start);
        start + (span.end - span.begin) as u32
    }

    fn write_to(&mut self, _dst: &mut [u8], _promises: &dyn PromiseResolver) {}
}

/// Host-runtime mock that hands out fake thunk addresses and records
/// what was asked for.
#[derive(Default)]
pub struct TestClient {
    pub requested: Vec<(TernaryOperation, u32)>,
}

impl Client for TestClient {
    fn get_thunk(&mut self, op: TernaryOperation, result_size: u32) -> i64 {
        self.requested.push((op, result_size));
        0x7000_0000 + self.requested.len() as i64
    }
}

/// Collects the code promises handed to it at call sites.
pub struct TestTraceHandler(pub Rc<RefCell<Vec<PromiseId>>>);

impl TraceHandler for TestTraceHandler {
    fn handle_trace(&mut self, code: PromiseId) {
        self.0.borrow_mut().push(code);
    }
}

/// A bare context over the mock architecture.
pub fn test_context(arena: &Bump) -> Context<'_> {
    Context::new(arena, ArchInfo::new(&TestArchitecture::default()))
}

/// A full compiler over the recording assembler and mock client.
pub fn test_compiler(arena: &Bump) -> Compiler<'_, RecordingAssembler, TestClient> {
    Compiler::new(arena, RecordingAssembler::new(), TestClient::default())
}

/// A compiler whose architecture routes `thunk_ops` through the runtime.
pub fn test_compiler_with(
    arena: &Bump,
    arch: TestArchitecture,
) -> Compiler<'_, RecordingAssembler, TestClient> {
    Compiler::new(
        arena,
        RecordingAssembler::with_arch(arch),
        TestClient::default(),
    )
}
