use alloc::boxed::Box;

use crate::ValType;

/// An integer value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntTy {
    I32,
    I64,
}

/// A float value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatTy {
    F32,
    F64,
}

/// Any numeric value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumTy {
    I32,
    I64,
    F32,
    F64,
}

/// A numeric type with signedness attached, for operations whose behaviour
/// depends on it (comparisons, division).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignedTy {
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
}

/// An inclusive range of value-stack slots, counted downwards from the top
/// of the stack (0 is the topmost slot).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DropRange {
    pub start: u32,
    pub end: u32,
}

/// A branch destination: the label to jump to and the slots to discard so
/// the target sees its expected stack shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchTarget {
    pub label: u32,
    pub drop: Option<DropRange>,
}

/// One lowered operation.
///
/// Operations act on an implicit stack of untyped 64-bit slots; the stack
/// effect of every operation was resolved during lowering, so engines never
/// consult value types at run time. Control flow is expressed through
/// numbered labels that appear inline in the stream ([`Operation::Label`])
/// and branch operations that reference them.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Unreachable,
    /// Marks a branch target. Labels with zero callers may be skipped
    /// entirely by code generation.
    Label(u32),
    Br(BranchTarget),
    BrIf {
        then: BranchTarget,
        els: BranchTarget,
    },
    BrTable {
        targets: Box<[BranchTarget]>,
        default: BranchTarget,
    },
    /// Direct call, function index counting imports first.
    Call(u32),
    CallIndirect {
        type_idx: u32,
        table: u32,
    },
    /// Discard a range of stack slots, keeping anything above it.
    Drop(Option<DropRange>),
    /// `c ? a : b`; `wide` selects between two-slot (v128) operands.
    Select {
        wide: bool,
    },
    /// Copy the slot `depth` positions below the top onto the top.
    Pick {
        depth: u32,
        wide: bool,
    },
    /// Pop the top into the slot `depth` positions below it.
    Set {
        depth: u32,
        wide: bool,
    },
    GlobalGet {
        index: u32,
        wide: bool,
    },
    GlobalSet {
        index: u32,
        wide: bool,
    },
    Load {
        ty: NumTy,
        offset: u32,
    },
    Load8 {
        ty: IntTy,
        signed: bool,
        offset: u32,
    },
    Load16 {
        ty: IntTy,
        signed: bool,
        offset: u32,
    },
    /// 32-bit load extended to i64.
    Load32 {
        signed: bool,
        offset: u32,
    },
    Store {
        ty: NumTy,
        offset: u32,
    },
    Store8 {
        offset: u32,
    },
    Store16 {
        offset: u32,
    },
    Store32 {
        offset: u32,
    },
    MemorySize,
    MemoryGrow,
    MemoryInit(u32),
    DataDrop(u32),
    MemoryCopy,
    MemoryFill,
    TableGet(u32),
    TableSet(u32),
    TableSize(u32),
    TableGrow(u32),
    TableFill(u32),
    TableInit {
        elem: u32,
        table: u32,
    },
    TableCopy {
        dst: u32,
        src: u32,
    },
    ElemDrop(u32),
    RefNull,
    RefFunc(u32),
    RefIsNull,
    Const32(u32),
    Const64(u64),
    ConstV128 {
        lo: u64,
        hi: u64,
    },
    Eqz(IntTy),
    Eq(NumTy),
    Ne(NumTy),
    Lt(SignedTy),
    Gt(SignedTy),
    Le(SignedTy),
    Ge(SignedTy),
    Add(NumTy),
    Sub(NumTy),
    Mul(NumTy),
    Clz(IntTy),
    Ctz(IntTy),
    Popcnt(IntTy),
    /// Integer division traps on zero and overflow; float division does not.
    Div(SignedTy),
    Rem {
        ty: IntTy,
        signed: bool,
    },
    And(IntTy),
    Or(IntTy),
    Xor(IntTy),
    Shl(IntTy),
    Shr {
        ty: IntTy,
        signed: bool,
    },
    Rotl(IntTy),
    Rotr(IntTy),
    Abs(FloatTy),
    Neg(FloatTy),
    Ceil(FloatTy),
    Floor(FloatTy),
    Trunc(FloatTy),
    Nearest(FloatTy),
    Sqrt(FloatTy),
    Min(FloatTy),
    Max(FloatTy),
    Copysign(FloatTy),
    I32WrapI64,
    ITruncF {
        int: IntTy,
        signed: bool,
        float: FloatTy,
        saturating: bool,
    },
    FConvertI {
        float: FloatTy,
        signed: bool,
        int: IntTy,
    },
    F32DemoteF64,
    F64PromoteF32,
    I64ExtendI32 {
        signed: bool,
    },
    /// `i32.extend8_s` and friends: sign-extend the low `bits` bits.
    SignExtend {
        ty: IntTy,
        bits: u8,
    },
    /// Lane-wise i32x4 addition of two v128 operands.
    V128Add,
}

/// What parts of the instance a function body touches. Engines use these to
/// skip initializing context they can prove is never read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FunctionFlags {
    pub uses_memory: bool,
    pub uses_table: bool,
    pub uses_data_instances: bool,
    pub uses_element_instances: bool,
}

/// The lowering result for one function body.
#[derive(Debug, Clone)]
pub struct CompiledFunction {
    /// Index of the function's type in the module's type section.
    pub type_idx: u32,

    /// Declared locals (parameters excluded).
    pub locals: Box<[ValType]>,

    /// Value-stack slots the declared locals occupy.
    pub local_slots: u32,

    /// The lowered operation stream.
    pub ops: Box<[Operation]>,

    /// Number of labels allocated for this body.
    pub label_count: u32,

    /// Per-label branch count; labels nobody branches to can be elided.
    pub label_callers: Box<[u32]>,

    /// Worst-case value-stack height of this body, in slots relative to the
    /// frame base (parameters, locals, and operand stack included).
    pub stack_ceil: u32,

    pub flags: FunctionFlags,
}
