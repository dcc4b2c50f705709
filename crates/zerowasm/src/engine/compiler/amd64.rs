//! The x86-64 emitter.
//!
//! Register convention inside compiled code: `rbx` holds the call engine,
//! `r12` the module context, `r13` the value-stack base address, `r14` the
//! stack pointer (slot index), `r15` the frame base (slot index). `rax`,
//! `rcx`, and `rdx` are codegen scratch; `rsi`, `rdi`, `r8`-`r11` and
//! `xmm0`-`xmm5` are allocatable; `xmm6`/`xmm7` are float scratch. The
//! machine stack is never touched, so exits return straight to the
//! trampoline with `ret`.
//!
//! All value-stack addressing is frame-base-relative with compile-time
//! slot indexes; `r14` is only brought up to date at spill boundaries
//! (labels, branches, calls, exits). Requires SSE4.1, POPCNT, and
//! LZCNT/TZCNT, as any x86-64 made this decade has.

use zerowasm_types::{
    BranchTarget, CompiledFunction, DropRange, FloatTy, FuncType, IntTy, Module, NumTy, Operation, SignedTy,
};

use super::location::{Loc, LocationStack, Take};
use super::{
    BUILTIN_DATA_DROP, BUILTIN_ELEM_DROP, BUILTIN_MEMORY_COPY, BUILTIN_MEMORY_FILL, BUILTIN_MEMORY_GROW,
    BUILTIN_MEMORY_INIT, BUILTIN_TABLE_COPY, BUILTIN_TABLE_FILL, BUILTIN_TABLE_GROW, BUILTIN_TABLE_INIT,
    STATUS_CALL_BUILTIN, STATUS_CALL_HOST, STATUS_GROW_FRAME_STACK, STATUS_GROW_VALUE_STACK, STATUS_RETURNED,
    STATUS_TRAP_BASE, TRAP_DIV_BY_ZERO, TRAP_INDIRECT_MISMATCH, TRAP_INT_OVERFLOW, TRAP_INVALID_CONVERSION,
    TRAP_MEMORY_OOB, TRAP_NULL_REF, TRAP_TABLE_OOB, TRAP_UNREACHABLE,
};
use crate::{Error, Result};

const RAX: u8 = 0;
const RCX: u8 = 1;
const RDX: u8 = 2;
const RBX: u8 = 3;
const RSP: u8 = 4;
const R12: u8 = 12;
const R13: u8 = 13;
const R14: u8 = 14;
const R15: u8 = 15;

/// rax/rcx/rdx stay scratch for division, shifts, and sequence temporaries.
const INT_POOL: &[u8] = &[6, 7, 8, 9, 10, 11]; // rsi, rdi, r8-r11
const FLT_POOL: &[u8] = &[0, 1, 2, 3, 4, 5];
const XMM6: u8 = 6;
const XMM7: u8 = 7;

// call-engine field offsets
const CE_STACK_LEN: i32 = 0x08;
const CE_SP: i32 = 0x10;
const CE_BP: i32 = 0x18;
const CE_FRAMES_PTR: i32 = 0x20;
const CE_FRAMES_CAP: i32 = 0x28;
const CE_FRAMES_LEN: i32 = 0x30;
const CE_CTX: i32 = 0x38;
const CE_STATUS: i32 = 0x40;
const CE_EXIT_ARG: i32 = 0x44;
const CE_EXIT_VALUE: i32 = 0x48;
const CE_CONTINUATION: i32 = 0x50;

// module-context field offsets
const CTX_MEMORY: i32 = 0x00;
const CTX_GLOBALS: i32 = 0x08;
const CTX_TABLES: i32 = 0x10;
const CTX_TYPE_IDS: i32 = 0x18;
const CTX_FUNCTIONS: i32 = 0x20;

// function-handle field offsets and stride
const HANDLE_CODE: i32 = 0x00;
const HANDLE_CTX: i32 = 0x08;
const HANDLE_TYPE_ID: i32 = 0x10;
const HANDLE_SIZE: i32 = 0x30;

// condition codes
const CC_B: u8 = 0x2;
const CC_AE: u8 = 0x3;
const CC_E: u8 = 0x4;
const CC_NE: u8 = 0x5;
const CC_BE: u8 = 0x6;
const CC_A: u8 = 0x7;
const CC_S: u8 = 0x8;
const CC_NS: u8 = 0x9;
const CC_P: u8 = 0xa;
const CC_NP: u8 = 0xb;
const CC_L: u8 = 0xc;
const CC_GE: u8 = 0xd;
const CC_LE: u8 = 0xe;
const CC_G: u8 = 0xf;

/// Compiles every function body, returning the code image and per-function
/// entry offsets.
pub(crate) fn compile(module: &Module) -> Result<(Vec<u8>, Vec<u32>)> {
    let mut code = Vec::with_capacity(4096);
    let mut offsets = Vec::with_capacity(module.functions.len());
    for function in module.functions.iter() {
        offsets.push(code.len() as u32);
        FunctionCompiler::new(&mut code, module, function).compile()?;
    }
    Ok((code, offsets))
}

#[derive(Debug, Clone, Copy)]
enum Rm {
    Reg(u8),
    /// `[base + index*2^scale + disp]`
    Mem { base: u8, index: Option<(u8, u8)>, disp: i32 },
}

/// The value-stack slot `bp + index`.
fn slot(index: u32) -> Rm {
    Rm::Mem { base: R13, index: Some((R15, 3)), disp: 8 * index as i32 }
}

fn mem(base: u8, disp: i32) -> Rm {
    Rm::Mem { base, index: None, disp }
}

fn indexed(base: u8, index: u8, scale: u8, disp: i32) -> Rm {
    Rm::Mem { base, index: Some((index, scale)), disp }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FixTarget {
    Label(u32),
    Local(u32),
}

#[derive(Debug)]
struct Fix {
    /// position of the rel32 field
    at: usize,
    target: FixTarget,
}

/// A `br_table` jump-table entry to patch: the i32 at `at` becomes
/// `local_target - table_base`.
#[derive(Debug)]
struct TableFix {
    at: usize,
    base: usize,
    local: u32,
}

struct FunctionCompiler<'a> {
    code: &'a mut Vec<u8>,
    module: &'a Module,
    func: &'a CompiledFunction,
    ty: &'a FuncType,
    entry: usize,
    locs: LocationStack,
    label_offsets: Vec<Option<usize>>,
    /// Expected stack height per label, recorded by its branches.
    label_heights: Vec<Option<u32>>,
    local_offsets: Vec<Option<usize>>,
    fixes: Vec<Fix>,
    table_fixes: Vec<TableFix>,
    trap_labels: [Option<u32>; 8],
    /// Code after an unconditional transfer, before a live label.
    dead: bool,
}

impl<'a> FunctionCompiler<'a> {
    fn new(code: &'a mut Vec<u8>, module: &'a Module, func: &'a CompiledFunction) -> Self {
        let ty = &module.types[func.type_idx as usize];
        let base_slots = ty.param_slots() + func.local_slots;
        let entry = code.len();
        Self {
            code,
            module,
            func,
            ty,
            entry,
            locs: LocationStack::new(base_slots, INT_POOL, FLT_POOL),
            label_offsets: vec![None; func.label_count as usize],
            label_heights: vec![None; func.label_count as usize],
            local_offsets: Vec::new(),
            fixes: Vec::new(),
            table_fixes: Vec::new(),
            trap_labels: [None; 8],
            dead: false,
        }
    }

    // ---- byte-level emission ----

    fn u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    fn bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    fn i32_(&mut self, value: i32) {
        self.bytes(&value.to_le_bytes());
    }

    fn pos(&self) -> usize {
        self.code.len()
    }

    fn modrm_tail(&mut self, reg: u8, rm: Rm) {
        match rm {
            Rm::Reg(r) => self.u8(0xc0 | ((reg & 7) << 3) | (r & 7)),
            Rm::Mem { base, index, disp } => match index {
                Some((idx, scale)) => {
                    self.u8(0x80 | ((reg & 7) << 3) | 0x04);
                    self.u8((scale << 6) | ((idx & 7) << 3) | (base & 7));
                    self.i32_(disp);
                }
                None => {
                    if base & 7 == RSP {
                        self.u8(0x80 | ((reg & 7) << 3) | 0x04);
                        self.u8((RSP << 3) | (base & 7));
                    } else {
                        self.u8(0x80 | ((reg & 7) << 3) | (base & 7));
                    }
                    self.i32_(disp);
                }
            },
        }
    }

    fn rex_for(rm: Rm) -> (u8, u8) {
        match rm {
            Rm::Reg(r) => (0, r >> 3),
            Rm::Mem { base, index, .. } => (index.map(|(i, _)| i >> 3).unwrap_or(0), base >> 3),
        }
    }

    /// prefix + REX + opcode + modrm(+sib)(+disp32)
    fn rm(&mut self, prefix: Option<u8>, w: bool, opcode: &[u8], reg: u8, rm: Rm) {
        if let Some(p) = prefix {
            self.u8(p);
        }
        let (x, b) = Self::rex_for(rm);
        let rex = 0x40 | ((w as u8) << 3) | ((reg >> 3) << 2) | (x << 1) | b;
        if rex != 0x40 {
            self.u8(rex);
        }
        self.bytes(opcode);
        self.modrm_tail(reg, rm);
    }

    /// Byte-operand ops always carry a REX so sil/dil encode correctly.
    fn rm8(&mut self, opcode: &[u8], reg: u8, rm: Rm) {
        let (x, b) = Self::rex_for(rm);
        self.u8(0x40 | ((reg >> 3) << 2) | (x << 1) | b);
        self.bytes(opcode);
        self.modrm_tail(reg, rm);
    }

    fn mov_ri64(&mut self, reg: u8, imm: u64) {
        self.u8(0x48 | (reg >> 3));
        self.u8(0xb8 | (reg & 7));
        self.bytes(&imm.to_le_bytes());
    }

    fn mov_ri32(&mut self, reg: u8, imm: u32) {
        if reg >= 8 {
            self.u8(0x41);
        }
        self.u8(0xb8 | (reg & 7));
        self.bytes(&imm.to_le_bytes());
    }

    fn mov_imm(&mut self, reg: u8, imm: u64) {
        if imm <= u32::MAX as u64 {
            self.mov_ri32(reg, imm as u32);
        } else {
            self.mov_ri64(reg, imm);
        }
    }

    fn mov_rr(&mut self, w: bool, dst: u8, src: u8) {
        self.rm(None, w, &[0x89], src, Rm::Reg(dst));
    }

    fn load(&mut self, w: bool, dst: u8, src: Rm) {
        self.rm(None, w, &[0x8b], dst, src);
    }

    fn store(&mut self, w: bool, src: u8, dst: Rm) {
        self.rm(None, w, &[0x89], src, dst);
    }

    fn lea(&mut self, dst: u8, rm: Rm) {
        self.rm(None, true, &[0x8d], dst, rm);
    }

    /// `lea dst, [rip + target]` with a fixup.
    fn lea_rip(&mut self, dst: u8, target: FixTarget) {
        self.u8(0x48 | ((dst >> 3) << 2));
        self.bytes(&[0x8d, ((dst & 7) << 3) | 0x05]);
        let at = self.pos();
        self.i32_(0);
        self.fixes.push(Fix { at, target });
    }

    fn alu_rr(&mut self, w: bool, opcode: u8, dst: u8, src: u8) {
        self.rm(None, w, &[opcode], src, Rm::Reg(dst));
    }

    fn alu_imm(&mut self, w: bool, ext: u8, dst: u8, imm: i32) {
        self.rm(None, w, &[0x81], ext, Rm::Reg(dst));
        self.i32_(imm);
    }

    fn shift_cl(&mut self, w: bool, ext: u8, reg: u8) {
        self.rm(None, w, &[0xd3], ext, Rm::Reg(reg));
    }

    fn shift_imm(&mut self, w: bool, ext: u8, reg: u8, imm: u8) {
        self.rm(None, w, &[0xc1], ext, Rm::Reg(reg));
        self.u8(imm);
    }

    fn cmp_rr(&mut self, w: bool, a: u8, b: u8) {
        // cmp a, b
        self.rm(None, w, &[0x39], b, Rm::Reg(a));
    }

    fn cmp_rm(&mut self, w: bool, reg: u8, rm: Rm) {
        self.rm(None, w, &[0x3b], reg, rm);
    }

    fn test_rr(&mut self, w: bool, a: u8, b: u8) {
        self.rm(None, w, &[0x85], b, Rm::Reg(a));
    }

    fn setcc(&mut self, cc: u8, reg: u8) {
        self.rm8(&[0x0f, 0x90 | cc], 0, Rm::Reg(reg));
        // zero-extend the byte result
        self.rm(None, false, &[0x0f, 0xb6], reg, Rm::Reg(reg));
    }

    fn cmov(&mut self, cc: u8, dst: u8, src: u8) {
        self.rm(None, true, &[0x0f, 0x40 | cc], dst, Rm::Reg(src));
    }

    fn jcc(&mut self, cc: u8, target: FixTarget) {
        self.bytes(&[0x0f, 0x80 | cc]);
        let at = self.pos();
        self.i32_(0);
        self.fixes.push(Fix { at, target });
    }

    fn jmp(&mut self, target: FixTarget) {
        self.u8(0xe9);
        let at = self.pos();
        self.i32_(0);
        self.fixes.push(Fix { at, target });
    }

    fn jmp_reg(&mut self, reg: u8) {
        self.rm(None, false, &[0xff], 4, Rm::Reg(reg));
    }

    fn ret(&mut self) {
        self.u8(0xc3);
    }

    fn local_label(&mut self) -> u32 {
        self.local_offsets.push(None);
        (self.local_offsets.len() - 1) as u32
    }

    fn bind_local(&mut self, label: u32) {
        self.local_offsets[label as usize] = Some(self.pos());
    }

    // ---- SSE ----

    fn sse(&mut self, prefix: Option<u8>, opcode: &[u8], reg: u8, rm: Rm) {
        self.rm(prefix, false, opcode, reg, rm);
    }

    fn movss_load(&mut self, dst: u8, src: Rm) {
        self.sse(Some(0xf3), &[0x0f, 0x10], dst, src);
    }

    fn movsd_load(&mut self, dst: u8, src: Rm) {
        self.sse(Some(0xf2), &[0x0f, 0x10], dst, src);
    }

    fn movsd_store(&mut self, src: u8, dst: Rm) {
        self.sse(Some(0xf2), &[0x0f, 0x11], src, dst);
    }

    fn movss_store(&mut self, src: u8, dst: Rm) {
        self.sse(Some(0xf3), &[0x0f, 0x11], src, dst);
    }

    fn movq_to_xmm(&mut self, wide: bool, xmm: u8, gp: u8) {
        self.rm(Some(0x66), wide, &[0x0f, 0x6e], xmm, Rm::Reg(gp));
    }

    fn movq_from_xmm(&mut self, wide: bool, gp: u8, xmm: u8) {
        self.rm(Some(0x66), wide, &[0x0f, 0x7e], xmm, Rm::Reg(gp));
    }

    fn movaps(&mut self, dst: u8, src: u8) {
        self.sse(None, &[0x0f, 0x28], dst, Rm::Reg(src));
    }

    fn ucomis(&mut self, wide: bool, a: u8, b: u8) {
        let prefix = if wide { Some(0x66) } else { None };
        self.sse(prefix, &[0x0f, 0x2e], a, Rm::Reg(b));
    }

    fn sse_arith(&mut self, wide: bool, opcode: u8, dst: u8, src: u8) {
        let prefix = if wide { 0xf2 } else { 0xf3 };
        self.sse(Some(prefix), &[0x0f, opcode], dst, Rm::Reg(src));
    }

    /// cvtsi2ss/cvtsi2sd from a 32- or 64-bit integer register.
    fn cvt_int_to_float(&mut self, to_wide: bool, from_wide: bool, xmm: u8, gp: u8) {
        let prefix = if to_wide { 0xf2 } else { 0xf3 };
        self.rm(Some(prefix), from_wide, &[0x0f, 0x2a], xmm, Rm::Reg(gp));
    }

    /// cvttsd2si, 32- or 64-bit destination; the source is always f64.
    fn cvtt_f64_to_int(&mut self, wide_dst: bool, gp: u8, xmm: u8) {
        self.rm(Some(0xf2), wide_dst, &[0x0f, 0x2c], gp, Rm::Reg(xmm));
    }

    // ---- value-stack plumbing ----

    fn load_slot(&mut self, dst: u8, index: u32) {
        self.load(true, dst, slot(index));
    }

    fn store_slot(&mut self, src: u8, index: u32) {
        self.store(true, src, slot(index));
    }

    /// Writes every register- or constant-held slot to its home; afterwards
    /// all registers are free.
    fn spill_all(&mut self) {
        for (index, loc) in self.locs.pending_spills() {
            match loc {
                Loc::IntReg(reg) => self.store_slot(reg, index as u32),
                Loc::FltReg(reg) => self.movsd_store(reg, slot(index as u32)),
                Loc::Const(value) => {
                    self.mov_imm(RAX, value);
                    self.store_slot(RAX, index as u32);
                }
                Loc::Stack => {}
            }
        }
        self.locs.spill_done();
    }

    /// r14 = bp + current height
    fn sync_sp(&mut self) {
        let height = self.locs.height();
        self.lea(R14, mem(R15, height as i32));
    }

    fn alloc_int(&mut self) -> u8 {
        match self.locs.take_int() {
            Take::Free(reg) => reg,
            Take::Steal { index, reg } => {
                self.store_slot(reg, index as u32);
                self.locs.mark_spilled(index);
                reg
            }
        }
    }

    fn alloc_flt(&mut self) -> u8 {
        match self.locs.take_flt() {
            Take::Free(reg) => reg,
            Take::Steal { index, reg } => {
                self.movsd_store(reg, slot(index as u32));
                self.locs.mark_spilled(index);
                reg
            }
        }
    }

    /// Pops the top value into an allocatable general-purpose register,
    /// which stays reserved until pushed back or freed.
    fn pop_int(&mut self) -> u8 {
        let index = self.locs.height() - 1;
        match self.locs.pop_keep() {
            Loc::IntReg(reg) => reg,
            Loc::FltReg(reg) => {
                self.locs.free_flt(reg);
                let dst = self.alloc_int();
                self.movq_from_xmm(true, dst, reg);
                dst
            }
            Loc::Const(value) => {
                let dst = self.alloc_int();
                self.mov_imm(dst, value);
                dst
            }
            Loc::Stack => {
                let dst = self.alloc_int();
                self.load_slot(dst, index);
                dst
            }
        }
    }

    /// Pops the top value into an allocatable float register.
    fn pop_flt(&mut self, wide: bool) -> u8 {
        let index = self.locs.height() - 1;
        match self.locs.pop_keep() {
            Loc::FltReg(reg) => reg,
            Loc::IntReg(reg) => {
                self.locs.free_int(reg);
                let dst = self.alloc_flt();
                self.movq_to_xmm(true, dst, reg);
                dst
            }
            Loc::Const(value) => {
                self.mov_imm(RAX, value);
                let dst = self.alloc_flt();
                self.movq_to_xmm(true, dst, RAX);
                dst
            }
            Loc::Stack => {
                let dst = self.alloc_flt();
                if wide {
                    self.movsd_load(dst, slot(index));
                } else {
                    self.movss_load(dst, slot(index));
                }
                dst
            }
        }
    }

    /// Pops the top into one of the scratch registers.
    fn pop_to_scratch(&mut self, scratch: u8) {
        let index = self.locs.height() - 1;
        match self.locs.pop() {
            Loc::IntReg(reg) => self.mov_rr(true, scratch, reg),
            Loc::FltReg(reg) => self.movq_from_xmm(true, scratch, reg),
            Loc::Const(value) => self.mov_imm(scratch, value),
            Loc::Stack => self.load_slot(scratch, index),
        }
    }

    // ---- exits and traps ----

    fn sync_engine(&mut self) {
        self.store(true, R14, mem(RBX, CE_SP));
        self.store(true, R15, mem(RBX, CE_BP));
        self.store(true, R12, mem(RBX, CE_CTX));
    }

    fn set_status(&mut self, status: u32) {
        self.mov_ri32(RAX, status);
        self.store(false, RAX, mem(RBX, CE_STATUS));
    }

    fn trap_target(&mut self, trap: u32) -> FixTarget {
        if let Some(label) = self.trap_labels[trap as usize] {
            return FixTarget::Local(label);
        }
        let label = self.local_label();
        self.trap_labels[trap as usize] = Some(label);
        FixTarget::Local(label)
    }

    fn emit_trap_stubs(&mut self) {
        for trap in 0..self.trap_labels.len() {
            if let Some(label) = self.trap_labels[trap] {
                self.bind_local(label);
                self.set_status(STATUS_TRAP_BASE + trap as u32);
                self.ret();
            }
        }
    }

    /// A builtin request: operands were already popped from the location
    /// stack but remain on the value stack for the runtime to consume; the
    /// immediate travels in `exit_value`.
    fn emit_builtin(&mut self, builtin: u32, imm: u64, pops: u32, pushes: u32) {
        for _ in 0..pops {
            let _ = self.locs.pop();
        }
        self.spill_all();
        let height = self.locs.height() + pops;
        self.lea(R14, mem(R15, height as i32));
        self.sync_engine();
        self.mov_imm(RAX, imm);
        self.store(true, RAX, mem(RBX, CE_EXIT_VALUE));
        self.mov_ri32(RCX, builtin);
        self.store(false, RCX, mem(RBX, CE_EXIT_ARG));
        let resume = self.local_label();
        self.lea_rip(RCX, FixTarget::Local(resume));
        self.store(true, RCX, mem(RBX, CE_CONTINUATION));
        self.set_status(STATUS_CALL_BUILTIN);
        self.ret();
        self.bind_local(resume);
        for _ in 0..pushes {
            self.locs.push_stack();
        }
    }

    // ---- control flow ----

    /// Moves the kept slots of a drop range down and adjusts r14. Runs on
    /// the taken edge only, with everything spilled.
    fn emit_drop_shuffle(&mut self, height: u32, range: &DropRange) {
        let kept = range.start;
        let dropped = range.end - range.start + 1;
        for i in 0..kept {
            self.load_slot(RAX, height - kept + i);
            self.store_slot(RAX, height - kept - dropped + i);
        }
        self.lea(R14, mem(R15, (height - dropped) as i32));
    }

    fn record_target_height(&mut self, target: &BranchTarget) -> u32 {
        let height = self.locs.height();
        let after = match &target.drop {
            Some(range) => height - (range.end - range.start + 1),
            None => height,
        };
        let previous = self.label_heights[target.label as usize].replace(after);
        debug_assert!(previous.is_none() || previous == Some(after), "branches disagree on stack shape");
        after
    }

    /// The taken edge of a branch: shuffle, then jump.
    fn emit_branch(&mut self, target: &BranchTarget) {
        self.record_target_height(target);
        let height = self.locs.height();
        if let Some(range) = &target.drop {
            self.emit_drop_shuffle(height, range);
        }
        self.jmp(FixTarget::Label(target.label));
    }

    // ---- prologue / epilogue ----

    fn emit_entry(&mut self) {
        let params = self.ty.param_slots();
        let locals = self.func.local_slots;
        let ceil = self.func.stack_ceil.max(params + locals).max(self.ty.result_slots());

        // make sure this frame fits the value stack
        self.lea(RAX, mem(R15, ceil as i32));
        self.cmp_rm(true, RAX, mem(RBX, CE_STACK_LEN));
        let fits = self.local_label();
        self.jcc(CC_BE, FixTarget::Local(fits));
        self.sync_engine();
        self.mov_ri32(RCX, ceil);
        self.store(false, RCX, mem(RBX, CE_EXIT_ARG));
        // resume at the function entry so the check reruns after growth
        let delta = (self.entry as i64 - (self.pos() as i64 + 7)) as i32;
        self.bytes(&[0x48, 0x8d, 0x0d]); // lea rcx, [rip + delta]
        self.i32_(delta);
        self.store(true, RCX, mem(RBX, CE_CONTINUATION));
        self.set_status(STATUS_GROW_VALUE_STACK);
        self.ret();
        self.bind_local(fits);

        if locals > 0 {
            self.alu_rr(false, 0x31, RAX, RAX); // xor eax, eax
            for i in 0..locals {
                self.store_slot(RAX, params + i);
            }
        }
        self.lea(R14, mem(R15, (params + locals) as i32));
    }

    /// The return sequence: move results to the frame base, pop the native
    /// frame, restore the caller, jump to its return address. A zero
    /// return address marks the outermost frame.
    fn emit_return(&mut self) {
        let results = self.ty.result_slots();
        let height = self.locs.height();
        for i in 0..results {
            self.load_slot(RAX, height - results + i);
            self.store_slot(RAX, i);
        }
        self.lea(R14, mem(R15, results as i32));

        self.load(true, RCX, mem(RBX, CE_FRAMES_LEN));
        self.alu_imm(true, 5, RCX, 1); // sub rcx, 1
        self.store(true, RCX, mem(RBX, CE_FRAMES_LEN));
        self.load(true, RDX, mem(RBX, CE_FRAMES_PTR));
        self.lea(RCX, indexed(RCX, RCX, 1, 0)); // rcx *= 3
        self.lea(RDX, indexed(RDX, RCX, 3, 0)); // frame address
        self.load(true, RCX, mem(RDX, 0x00)); // return address
        self.load(true, R15, mem(RDX, 0x08)); // caller bp
        self.load(true, R12, mem(RDX, 0x10)); // caller ctx
        self.test_rr(true, RCX, RCX);
        let inner = self.local_label();
        self.jcc(CC_NE, FixTarget::Local(inner));
        self.sync_engine();
        self.set_status(STATUS_RETURNED);
        self.ret();
        self.bind_local(inner);
        self.jmp_reg(RCX);
    }

    /// The shared tail of direct and indirect calls, entered with the
    /// callee handle address in rax, everything spilled, and r14 synced.
    /// `seq_start` restarts the whole sequence after frame-stack growth;
    /// `index_slots` is 1 for indirect calls (the table index sits above
    /// the arguments and is swallowed by the callee frame).
    fn emit_call_via_handle(&mut self, param_slots: u32, index_slots: u32, seq_start: u32) {
        // host callees have no compiled body
        self.load(true, RCX, mem(RAX, HANDLE_CODE));
        self.test_rr(true, RCX, RCX);
        let wasm = self.local_label();
        self.jcc(CC_NE, FixTarget::Local(wasm));
        self.store(true, RAX, mem(RBX, CE_EXIT_VALUE));
        self.sync_engine();
        self.mov_ri32(RCX, index_slots);
        self.store(false, RCX, mem(RBX, CE_EXIT_ARG));
        let done = self.local_label();
        self.lea_rip(RCX, FixTarget::Local(done));
        self.store(true, RCX, mem(RBX, CE_CONTINUATION));
        self.set_status(STATUS_CALL_HOST);
        self.ret();

        self.bind_local(wasm);
        self.load(true, RCX, mem(RBX, CE_FRAMES_LEN));
        self.cmp_rm(true, RCX, mem(RBX, CE_FRAMES_CAP));
        let room = self.local_label();
        self.jcc(CC_B, FixTarget::Local(room));
        self.sync_engine();
        self.lea_rip(RCX, FixTarget::Local(seq_start));
        self.store(true, RCX, mem(RBX, CE_CONTINUATION));
        self.set_status(STATUS_GROW_FRAME_STACK);
        self.ret();

        self.bind_local(room);
        // push the native frame
        self.load(true, RDX, mem(RBX, CE_FRAMES_PTR));
        self.lea(RCX, indexed(RCX, RCX, 1, 0)); // rcx *= 3
        self.lea(RDX, indexed(RDX, RCX, 3, 0));
        self.lea_rip(RCX, FixTarget::Local(done));
        self.store(true, RCX, mem(RDX, 0x00));
        self.store(true, R15, mem(RDX, 0x08));
        self.store(true, R12, mem(RDX, 0x10));
        self.load(true, RCX, mem(RBX, CE_FRAMES_LEN));
        self.alu_imm(true, 0, RCX, 1); // add rcx, 1
        self.store(true, RCX, mem(RBX, CE_FRAMES_LEN));

        // callee frame base and context, then enter
        let height = self.locs.height();
        self.lea(R15, mem(R15, (height - index_slots - param_slots) as i32));
        self.load(true, R12, mem(RAX, HANDLE_CTX));
        self.load(true, RCX, mem(RAX, HANDLE_CODE));
        self.jmp_reg(RCX);

        // the wasm return and the serviced host call both land here
        self.bind_local(done);
    }

    // ---- memory access ----

    /// Pops the i32 address, bounds-checks `addr + offset + size` against
    /// the memory length, and leaves the host address in rax; the returned
    /// operand carries any remaining displacement.
    fn emit_memory_operand(&mut self, offset: u32, size: u32) -> Rm {
        self.pop_to_scratch(RAX);
        self.mov_rr(false, RAX, RAX); // wasm addresses are 32-bit
        let end = offset as u64 + size as u64;
        if end <= i32::MAX as u64 {
            self.lea(RCX, mem(RAX, end as i32));
        } else {
            self.mov_imm(RCX, end);
            self.alu_rr(true, 0x01, RCX, RAX); // add rcx, rax
        }
        self.load(true, RDX, mem(R12, CTX_MEMORY));
        self.cmp_rm(true, RCX, mem(RDX, 0x08));
        let oob = self.trap_target(TRAP_MEMORY_OOB);
        self.jcc(CC_A, oob);
        self.load(true, RDX, mem(RDX, 0x00)); // buffer base
        self.alu_rr(true, 0x01, RAX, RDX); // rax = base + addr
        if offset <= i32::MAX as u32 {
            mem(RAX, offset as i32)
        } else {
            self.mov_imm(RCX, offset as u64);
            self.alu_rr(true, 0x01, RAX, RCX);
            mem(RAX, 0)
        }
    }

    /// The table instance pointer for `table`, left in rcx.
    fn emit_table_ptr(&mut self, table: u32) {
        self.load(true, RCX, mem(R12, CTX_TABLES));
        self.load(true, RCX, mem(RCX, 8 * table as i32));
    }

    // ---- numeric helpers ----

    fn int_binop(&mut self, w: bool, opcode: u8) {
        let b = self.pop_int();
        let a = self.pop_int();
        self.alu_rr(w, opcode, a, b);
        self.locs.free_int(b);
        self.locs.push_int(a);
    }

    fn flt_binop(&mut self, wide: bool, opcode: u8) {
        let b = self.pop_flt(wide);
        let a = self.pop_flt(wide);
        self.sse_arith(wide, opcode, a, b);
        self.locs.free_flt(b);
        self.locs.push_flt(a);
    }

    fn int_cmp(&mut self, w: bool, cc: u8) {
        let b = self.pop_int();
        let a = self.pop_int();
        self.cmp_rr(w, a, b);
        self.setcc(cc, a);
        self.locs.free_int(b);
        self.locs.push_int(a);
    }

    /// Ordered float comparison via reversal: `a < b` is `b > a`, so the
    /// `above` family works and unordered operands come out false.
    fn flt_cmp(&mut self, wide: bool, cc: u8, reversed: bool) {
        let b = self.pop_flt(wide);
        let a = self.pop_flt(wide);
        if reversed {
            self.ucomis(wide, b, a);
        } else {
            self.ucomis(wide, a, b);
        }
        self.locs.free_flt(a);
        self.locs.free_flt(b);
        let dst = self.alloc_int();
        self.setcc(cc, dst);
        self.locs.push_int(dst);
    }

    /// Float equality needs the parity flag folded in.
    fn flt_eq(&mut self, wide: bool, negate: bool) {
        let b = self.pop_flt(wide);
        let a = self.pop_flt(wide);
        self.ucomis(wide, a, b);
        self.locs.free_flt(a);
        self.locs.free_flt(b);
        if negate {
            self.setcc(CC_P, RAX);
            self.setcc(CC_NE, RCX);
            self.alu_rr(false, 0x09, RAX, RCX); // or
        } else {
            self.setcc(CC_NP, RAX);
            self.setcc(CC_E, RCX);
            self.alu_rr(false, 0x21, RAX, RCX); // and
        }
        let dst = self.alloc_int();
        self.mov_rr(false, dst, RAX);
        self.locs.push_int(dst);
    }

    /// Division and remainder, which need rax/rdx and explicit checks: the
    /// hardware faults where wasm wants traps or defined results.
    fn emit_div_rem(&mut self, wide: bool, signed: bool, want_rem: bool) {
        let b = self.pop_int();
        self.pop_to_scratch(RAX);
        self.test_rr(wide, b, b);
        let div0 = self.trap_target(TRAP_DIV_BY_ZERO);
        self.jcc(CC_E, div0);
        if signed {
            let do_div = self.local_label();
            let done = self.local_label();
            self.alu_imm(wide, 7, b, -1); // cmp b, -1
            self.jcc(CC_NE, FixTarget::Local(do_div));
            if want_rem {
                // INT_MIN % -1 is 0, and idiv would fault
                self.alu_rr(false, 0x31, RDX, RDX);
                self.jmp(FixTarget::Local(done));
            } else {
                // INT_MIN / -1 overflows
                if wide {
                    self.mov_ri64(RCX, i64::MIN as u64);
                    self.cmp_rr(true, RAX, RCX);
                } else {
                    self.alu_imm(false, 7, RAX, i32::MIN);
                }
                let overflow = self.trap_target(TRAP_INT_OVERFLOW);
                self.jcc(CC_E, overflow);
            }
            self.bind_local(do_div);
            // sign-extend rax into rdx
            if wide {
                self.bytes(&[0x48, 0x99]); // cqo
            } else {
                self.u8(0x99); // cdq
            }
            self.rm(None, wide, &[0xf7], 7, Rm::Reg(b)); // idiv
            self.bind_local(done);
        } else {
            self.alu_rr(false, 0x31, RDX, RDX); // xor edx, edx
            self.rm(None, wide, &[0xf7], 6, Rm::Reg(b)); // div
        }
        self.locs.free_int(b);
        let dst = self.alloc_int();
        self.mov_rr(wide, dst, if want_rem { RDX } else { RAX });
        self.locs.push_int(dst);
    }

    /// Float min/max with wasm NaN and signed-zero semantics.
    fn emit_min_max(&mut self, wide: bool, is_min: bool) {
        let b = self.pop_flt(wide);
        let a = self.pop_flt(wide);
        let nan = self.local_label();
        let ordered = self.local_label();
        let done = self.local_label();
        self.ucomis(wide, a, b);
        self.jcc(CC_P, FixTarget::Local(nan));
        self.jcc(CC_NE, FixTarget::Local(ordered));
        // equal operands: merge the sign bits so min(-0, +0) is -0
        let merge = if is_min { 0x56 } else { 0x54 }; // orps / andps
        self.sse(None, &[0x0f, merge], a, Rm::Reg(b));
        self.jmp(FixTarget::Local(done));
        self.bind_local(ordered);
        self.sse_arith(wide, if is_min { 0x5d } else { 0x5f }, a, b); // minss / maxss
        self.jmp(FixTarget::Local(done));
        self.bind_local(nan);
        self.sse_arith(wide, 0x58, a, b); // add: produces a canonical NaN
        self.bind_local(done);
        self.locs.free_flt(b);
        self.locs.push_flt(a);
    }

    /// Float to integer truncation. The source is widened to f64 in xmm6
    /// first, so one family of sequences covers both source types.
    fn emit_trunc(&mut self, int: IntTy, signed: bool, float: FloatTy, saturating: bool) {
        let src = self.pop_flt(float == FloatTy::F64);
        match float {
            FloatTy::F32 => self.sse(Some(0xf3), &[0x0f, 0x5a], XMM6, Rm::Reg(src)), // cvtss2sd
            FloatTy::F64 => self.movaps(XMM6, src),
        }
        self.locs.free_flt(src);

        let done = self.local_label();
        match (int, signed) {
            (IntTy::I32, true) => {
                self.cvtt_f64_to_int(false, RAX, XMM6);
                self.alu_imm(false, 7, RAX, i32::MIN); // sentinel check
                self.jcc(CC_NE, FixTarget::Local(done));
                self.ucomis(true, XMM6, XMM6);
                if saturating {
                    let not_nan = self.local_label();
                    self.jcc(CC_NP, FixTarget::Local(not_nan));
                    self.alu_rr(false, 0x31, RAX, RAX);
                    self.jmp(FixTarget::Local(done));
                    self.bind_local(not_nan);
                    self.movq_from_xmm(true, RCX, XMM6);
                    self.test_rr(true, RCX, RCX);
                    self.jcc(CC_S, FixTarget::Local(done)); // negative keeps INT_MIN
                    self.mov_ri32(RAX, i32::MAX as u32);
                } else {
                    let invalid = self.trap_target(TRAP_INVALID_CONVERSION);
                    self.jcc(CC_P, invalid);
                    // exactly INT_MIN is fine
                    self.mov_ri64(RCX, (-2147483648.0f64).to_bits());
                    self.movq_to_xmm(true, XMM7, RCX);
                    self.ucomis(true, XMM6, XMM7);
                    self.jcc(CC_E, FixTarget::Local(done));
                    let overflow = self.trap_target(TRAP_INT_OVERFLOW);
                    self.jmp(overflow);
                }
            }
            (IntTy::I32, false) => {
                if saturating {
                    self.mov_ri64(RCX, (4294967296.0f64).to_bits());
                    self.movq_to_xmm(true, XMM7, RCX);
                    self.ucomis(true, XMM6, XMM7);
                    let clamp = self.local_label();
                    self.jcc(CC_AE, FixTarget::Local(clamp));
                    self.cvtt_f64_to_int(true, RAX, XMM6);
                    self.test_rr(true, RAX, RAX);
                    self.jcc(CC_NS, FixTarget::Local(done));
                    self.alu_rr(false, 0x31, RAX, RAX);
                    self.jmp(FixTarget::Local(done));
                    self.bind_local(clamp);
                    self.mov_ri32(RAX, u32::MAX);
                } else {
                    let invalid = self.trap_target(TRAP_INVALID_CONVERSION);
                    self.ucomis(true, XMM6, XMM6);
                    self.jcc(CC_P, invalid);
                    self.cvtt_f64_to_int(true, RAX, XMM6);
                    self.mov_ri64(RCX, 1 << 32);
                    self.cmp_rr(true, RAX, RCX);
                    let overflow = self.trap_target(TRAP_INT_OVERFLOW);
                    self.jcc(CC_AE, overflow);
                }
            }
            (IntTy::I64, true) => {
                if saturating {
                    self.cvtt_f64_to_int(true, RAX, XMM6);
                    self.mov_ri64(RCX, i64::MIN as u64);
                    self.cmp_rr(true, RAX, RCX);
                    self.jcc(CC_NE, FixTarget::Local(done));
                    let not_nan = self.local_label();
                    self.ucomis(true, XMM6, XMM6);
                    self.jcc(CC_NP, FixTarget::Local(not_nan));
                    self.alu_rr(false, 0x31, RAX, RAX);
                    self.jmp(FixTarget::Local(done));
                    self.bind_local(not_nan);
                    self.movq_from_xmm(true, RCX, XMM6);
                    self.test_rr(true, RCX, RCX);
                    self.jcc(CC_S, FixTarget::Local(done));
                    self.mov_ri64(RAX, i64::MAX as u64);
                } else {
                    let invalid = self.trap_target(TRAP_INVALID_CONVERSION);
                    self.ucomis(true, XMM6, XMM6);
                    self.jcc(CC_P, invalid);
                    self.cvtt_f64_to_int(true, RAX, XMM6);
                    self.mov_ri64(RCX, i64::MIN as u64);
                    self.cmp_rr(true, RAX, RCX);
                    self.jcc(CC_NE, FixTarget::Local(done));
                    self.mov_ri64(RCX, (-9223372036854775808.0f64).to_bits());
                    self.movq_to_xmm(true, XMM7, RCX);
                    self.ucomis(true, XMM6, XMM7);
                    self.jcc(CC_E, FixTarget::Local(done));
                    let overflow = self.trap_target(TRAP_INT_OVERFLOW);
                    self.jmp(overflow);
                }
            }
            (IntTy::I64, false) => {
                self.mov_ri64(RCX, (9223372036854775808.0f64).to_bits());
                self.movq_to_xmm(true, XMM7, RCX);
                self.ucomis(true, XMM6, XMM7);
                let big = self.local_label();
                self.jcc(CC_AE, FixTarget::Local(big));
                self.cvtt_f64_to_int(true, RAX, XMM6);
                self.test_rr(true, RAX, RAX);
                self.jcc(CC_NS, FixTarget::Local(done));
                if saturating {
                    // NaN and negatives saturate to zero
                    self.alu_rr(false, 0x31, RAX, RAX);
                    self.jmp(FixTarget::Local(done));
                } else {
                    let invalid = self.trap_target(TRAP_INVALID_CONVERSION);
                    self.ucomis(true, XMM6, XMM6);
                    self.jcc(CC_P, invalid);
                    let overflow = self.trap_target(TRAP_INT_OVERFLOW);
                    self.jmp(overflow);
                }
                self.bind_local(big);
                // subtract 2^63, convert, put the top bit back
                self.sse_arith(true, 0x5c, XMM6, XMM7); // subsd
                self.cvtt_f64_to_int(true, RAX, XMM6);
                self.test_rr(true, RAX, RAX);
                if saturating {
                    let ok = self.local_label();
                    self.jcc(CC_NS, FixTarget::Local(ok));
                    self.mov_ri64(RAX, u64::MAX);
                    self.jmp(FixTarget::Local(done));
                    self.bind_local(ok);
                } else {
                    let overflow = self.trap_target(TRAP_INT_OVERFLOW);
                    self.jcc(CC_S, overflow);
                }
                self.mov_ri64(RCX, 1 << 63);
                self.alu_rr(true, 0x09, RAX, RCX); // or
            }
        }
        self.bind_local(done);
        let dst = self.alloc_int();
        let wide = int == IntTy::I64;
        self.mov_rr(wide, dst, RAX);
        self.locs.push_int(dst);
    }

    fn emit_convert(&mut self, float: FloatTy, signed: bool, int: IntTy) {
        let to_wide = float == FloatTy::F64;
        let v = self.pop_int();
        let dst = self.alloc_flt();
        match (int, signed) {
            (IntTy::I32, true) => self.cvt_int_to_float(to_wide, false, dst, v),
            (IntTy::I32, false) => {
                self.mov_rr(false, v, v); // zero-extend, then convert as i64
                self.cvt_int_to_float(to_wide, true, dst, v);
            }
            (IntTy::I64, true) => self.cvt_int_to_float(to_wide, true, dst, v),
            (IntTy::I64, false) => {
                // u64: halve with the low bit folded in, convert, double
                let direct = self.local_label();
                let done = self.local_label();
                self.test_rr(true, v, v);
                self.jcc(CC_NS, FixTarget::Local(direct));
                self.mov_rr(true, RCX, v);
                self.shift_imm(true, 5, RCX, 1); // shr rcx, 1
                self.mov_rr(true, RAX, v);
                self.alu_imm(true, 4, RAX, 1); // and rax, 1
                self.alu_rr(true, 0x09, RCX, RAX); // or
                self.cvt_int_to_float(to_wide, true, dst, RCX);
                self.sse_arith(to_wide, 0x58, dst, dst); // add dst, dst
                self.jmp(FixTarget::Local(done));
                self.bind_local(direct);
                self.cvt_int_to_float(to_wide, true, dst, v);
                self.bind_local(done);
            }
        }
        self.locs.free_int(v);
        self.locs.push_flt(dst);
    }

    /// abs/neg/copysign work on the bit pattern in general registers.
    fn emit_sign_op(&mut self, wide: bool, clear_sign: bool, set_from: Option<()>) {
        match set_from {
            None => {
                let v = self.pop_int();
                if wide {
                    let mask = if clear_sign { i64::MAX as u64 } else { 1u64 << 63 };
                    self.mov_ri64(RAX, mask);
                    self.alu_rr(true, if clear_sign { 0x21 } else { 0x31 }, v, RAX);
                } else {
                    let (op, mask) = if clear_sign { (0x21, i32::MAX) } else { (0x31, i32::MIN) };
                    self.alu_imm(false, if op == 0x21 { 4 } else { 6 }, v, mask);
                }
                self.locs.push_int(v);
            }
            Some(()) => {
                // copysign: (a & !sign) | (b & sign)
                let b = self.pop_int();
                let a = self.pop_int();
                if wide {
                    self.mov_ri64(RAX, i64::MAX as u64);
                    self.alu_rr(true, 0x21, a, RAX);
                    self.mov_ri64(RAX, 1u64 << 63);
                    self.alu_rr(true, 0x21, b, RAX);
                } else {
                    self.alu_imm(false, 4, a, i32::MAX);
                    self.alu_imm(false, 4, b, i32::MIN);
                }
                self.alu_rr(wide, 0x09, a, b);
                self.locs.free_int(b);
                self.locs.push_int(a);
            }
        }
    }

    fn emit_round(&mut self, wide: bool, mode: u8) {
        let a = self.pop_flt(wide);
        let opcode = if wide { 0x0b } else { 0x0a };
        self.rm(Some(0x66), false, &[0x0f, 0x3a, opcode], a, Rm::Reg(a));
        self.u8(mode);
        self.locs.push_flt(a);
    }

    // ---- the operation dispatch ----

    fn compile(mut self) -> Result<()> {
        self.emit_entry();
        let ops: &[Operation] = &self.func.ops;
        for op in ops {
            self.emit_op(op);
        }
        if !self.dead {
            self.emit_return();
        }
        self.emit_trap_stubs();
        self.finish()
    }

    #[allow(clippy::too_many_lines)]
    fn emit_op(&mut self, op: &Operation) {
        if self.dead {
            if let Operation::Label(id) = op {
                if let Some(height) = self.label_heights[*id as usize] {
                    self.locs.reset_to_height(height);
                    self.label_offsets[*id as usize] = Some(self.pos());
                    self.dead = false;
                }
            }
            return;
        }

        match op {
            Operation::Unreachable => {
                let trap = self.trap_target(TRAP_UNREACHABLE);
                self.jmp(trap);
                self.dead = true;
            }
            Operation::Label(id) => {
                // a control join: canonicalize by spilling everything so
                // every predecessor agrees on locations
                self.spill_all();
                self.sync_sp();
                let height = self.locs.height();
                debug_assert!(
                    self.label_heights[*id as usize].is_none()
                        || self.label_heights[*id as usize] == Some(height),
                    "fallthrough disagrees with branches on stack shape"
                );
                self.label_heights[*id as usize] = Some(height);
                self.label_offsets[*id as usize] = Some(self.pos());
            }
            Operation::Br(target) => {
                self.spill_all();
                self.sync_sp();
                self.emit_branch(target);
                self.dead = true;
            }
            Operation::BrIf { then, els } => {
                let cond = self.pop_int();
                self.spill_all();
                self.sync_sp();
                self.test_rr(false, cond, cond);
                self.locs.free_int(cond);
                let fall = self.local_label();
                self.jcc(CC_E, FixTarget::Local(fall));
                self.emit_branch(then);
                self.bind_local(fall);
                // the else edge falls through to its label, which follows
                self.record_target_height(els);
            }
            Operation::BrTable { targets, default } => {
                self.pop_to_scratch(RAX);
                self.spill_all();
                self.sync_sp();
                let count = targets.len() as i32;
                self.mov_rr(false, RAX, RAX);
                self.alu_imm(false, 7, RAX, count); // cmp
                let in_range = self.local_label();
                self.jcc(CC_B, FixTarget::Local(in_range));
                self.mov_ri32(RAX, count as u32); // clamp to the default entry
                self.bind_local(in_range);
                let table = self.local_label();
                self.lea_rip(RCX, FixTarget::Local(table));
                // rdx = sign-extended table[rax]
                self.rm(None, true, &[0x63], RDX, indexed(RCX, RAX, 2, 0));
                self.alu_rr(true, 0x01, RCX, RDX);
                self.jmp_reg(RCX);

                self.bind_local(table);
                let base = self.pos();
                let mut stubs = Vec::with_capacity(targets.len() + 1);
                for _ in 0..=targets.len() {
                    let stub = self.local_label();
                    let at = self.pos();
                    self.i32_(0);
                    self.table_fixes.push(TableFix { at, base, local: stub });
                    stubs.push(stub);
                }
                for (target, stub) in targets.iter().chain([default]).zip(stubs) {
                    self.bind_local(stub);
                    self.emit_branch(target);
                }
                self.dead = true;
            }
            Operation::Call(func_index) => {
                let callee = self.module.func_type(*func_index).expect("validated function index").clone();
                let params = callee.param_slots();
                let results = callee.result_slots();
                self.spill_all();
                self.sync_sp();
                let seq_start = self.local_label();
                self.bind_local(seq_start);
                self.load(true, RAX, mem(R12, CTX_FUNCTIONS));
                self.lea(RAX, mem(RAX, *func_index as i32 * HANDLE_SIZE));
                self.emit_call_via_handle(params, 0, seq_start);
                for _ in 0..params {
                    let _ = self.locs.pop();
                }
                for _ in 0..results {
                    self.locs.push_stack();
                }
            }
            Operation::CallIndirect { type_idx, table } => {
                let callee = self.module.types[*type_idx as usize].clone();
                let params = callee.param_slots();
                let results = callee.result_slots();
                self.spill_all();
                self.sync_sp();
                let seq_start = self.local_label();
                self.bind_local(seq_start);
                // the table element index stays in its slot so the whole
                // sequence can restart after frame-stack growth
                let height = self.locs.height();
                self.load_slot(RAX, height - 1);
                self.mov_rr(false, RAX, RAX);
                self.emit_table_ptr(*table);
                self.cmp_rm(true, RAX, mem(RCX, 0x08));
                let oob = self.trap_target(TRAP_TABLE_OOB);
                self.jcc(CC_AE, oob);
                self.load(true, RDX, mem(RCX, 0x00));
                self.load(true, RAX, indexed(RDX, RAX, 3, 0));
                self.test_rr(true, RAX, RAX);
                let null = self.trap_target(TRAP_NULL_REF);
                self.jcc(CC_E, null);
                self.load(false, RCX, mem(RAX, HANDLE_TYPE_ID));
                self.load(true, RDX, mem(R12, CTX_TYPE_IDS));
                self.cmp_rm(false, RCX, mem(RDX, 4 * *type_idx as i32));
                let mismatch = self.trap_target(TRAP_INDIRECT_MISMATCH);
                self.jcc(CC_NE, mismatch);
                self.emit_call_via_handle(params, 1, seq_start);
                for _ in 0..params + 1 {
                    let _ = self.locs.pop();
                }
                for _ in 0..results {
                    self.locs.push_stack();
                }
            }

            Operation::Drop(range) => match range {
                None => {}
                Some(range) if range.start == 0 => {
                    for _ in 0..=range.end {
                        let _ = self.locs.pop();
                    }
                }
                Some(range) => {
                    self.spill_all();
                    let height = self.locs.height();
                    let dropped = range.end - range.start + 1;
                    self.emit_drop_shuffle(height, range);
                    self.locs.reset_to_height(height - dropped);
                }
            },
            Operation::Select { wide: false } => {
                self.pop_to_scratch(RAX);
                let b = self.pop_int();
                let a = self.pop_int();
                self.test_rr(false, RAX, RAX);
                self.cmov(CC_E, a, b);
                self.locs.free_int(b);
                self.locs.push_int(a);
            }
            Operation::Select { wide: true } => {
                self.pop_to_scratch(RAX);
                self.spill_all();
                let height = self.locs.height();
                self.test_rr(false, RAX, RAX);
                let keep = self.local_label();
                self.jcc(CC_NE, FixTarget::Local(keep));
                self.load_slot(RCX, height - 2);
                self.store_slot(RCX, height - 4);
                self.load_slot(RCX, height - 1);
                self.store_slot(RCX, height - 3);
                self.bind_local(keep);
                let _ = self.locs.pop();
                let _ = self.locs.pop();
            }
            Operation::Pick { depth, .. } => {
                let index = self.locs.height() - 1 - depth;
                match self.locs.get(index as usize) {
                    Loc::Const(value) => self.locs.push_const(value),
                    Loc::IntReg(src) => {
                        let dst = self.alloc_int();
                        self.mov_rr(true, dst, src);
                        self.locs.push_int(dst);
                    }
                    Loc::FltReg(src) => {
                        let dst = self.alloc_int();
                        self.movq_from_xmm(true, dst, src);
                        self.locs.push_int(dst);
                    }
                    Loc::Stack => {
                        let dst = self.alloc_int();
                        self.load_slot(dst, index);
                        self.locs.push_int(dst);
                    }
                }
            }
            Operation::Set { depth, .. } => {
                let target = self.locs.height() - 1 - depth;
                self.pop_to_scratch(RAX);
                self.locs.invalidate(target as usize);
                self.store_slot(RAX, target);
            }

            Operation::GlobalGet { index, wide } => {
                self.load(true, RAX, mem(R12, CTX_GLOBALS));
                self.load(true, RAX, mem(RAX, 8 * *index as i32));
                let lo = self.alloc_int();
                self.load(true, lo, mem(RAX, 0));
                self.locs.push_int(lo);
                if *wide {
                    let hi = self.alloc_int();
                    self.load(true, hi, mem(RAX, 8));
                    self.locs.push_int(hi);
                }
            }
            Operation::GlobalSet { index, wide } => {
                if *wide {
                    self.pop_to_scratch(RCX); // high half
                    self.pop_to_scratch(RDX);
                    self.load(true, RAX, mem(R12, CTX_GLOBALS));
                    self.load(true, RAX, mem(RAX, 8 * *index as i32));
                    self.store(true, RDX, mem(RAX, 0));
                    self.store(true, RCX, mem(RAX, 8));
                } else {
                    self.pop_to_scratch(RCX);
                    self.load(true, RAX, mem(R12, CTX_GLOBALS));
                    self.load(true, RAX, mem(RAX, 8 * *index as i32));
                    self.store(true, RCX, mem(RAX, 0));
                }
            }

            Operation::Load { ty, offset } => {
                let size = match ty {
                    NumTy::I32 | NumTy::F32 => 4,
                    NumTy::I64 | NumTy::F64 => 8,
                };
                let operand = self.emit_memory_operand(*offset, size);
                match ty {
                    NumTy::I32 => {
                        let dst = self.alloc_int();
                        self.load(false, dst, operand);
                        self.locs.push_int(dst);
                    }
                    NumTy::I64 => {
                        let dst = self.alloc_int();
                        self.load(true, dst, operand);
                        self.locs.push_int(dst);
                    }
                    NumTy::F32 => {
                        let dst = self.alloc_flt();
                        self.movss_load(dst, operand);
                        self.locs.push_flt(dst);
                    }
                    NumTy::F64 => {
                        let dst = self.alloc_flt();
                        self.movsd_load(dst, operand);
                        self.locs.push_flt(dst);
                    }
                }
            }
            Operation::Load8 { ty, signed, offset } => {
                let operand = self.emit_memory_operand(*offset, 1);
                let dst = self.alloc_int();
                let wide = *ty == IntTy::I64;
                let opcode = if *signed { 0xbe } else { 0xb6 };
                self.rm(None, wide, &[0x0f, opcode], dst, operand);
                self.locs.push_int(dst);
            }
            Operation::Load16 { ty, signed, offset } => {
                let operand = self.emit_memory_operand(*offset, 2);
                let dst = self.alloc_int();
                let wide = *ty == IntTy::I64;
                let opcode = if *signed { 0xbf } else { 0xb7 };
                self.rm(None, wide, &[0x0f, opcode], dst, operand);
                self.locs.push_int(dst);
            }
            Operation::Load32 { signed, offset } => {
                let operand = self.emit_memory_operand(*offset, 4);
                let dst = self.alloc_int();
                if *signed {
                    self.rm(None, true, &[0x63], dst, operand); // movsxd
                } else {
                    self.load(false, dst, operand);
                }
                self.locs.push_int(dst);
            }
            Operation::Store { ty, offset } => {
                let size = match ty {
                    NumTy::I32 | NumTy::F32 => 4,
                    NumTy::I64 | NumTy::F64 => 8,
                };
                let value = self.pop_int();
                let operand = self.emit_memory_operand(*offset, size);
                self.store(size == 8, value, operand);
                self.locs.free_int(value);
            }
            Operation::Store8 { offset } => {
                let value = self.pop_int();
                let operand = self.emit_memory_operand(*offset, 1);
                self.rm8(&[0x88], value, operand);
                self.locs.free_int(value);
            }
            Operation::Store16 { offset } => {
                let value = self.pop_int();
                let operand = self.emit_memory_operand(*offset, 2);
                self.rm(Some(0x66), false, &[0x89], value, operand);
                self.locs.free_int(value);
            }
            Operation::Store32 { offset } => {
                let value = self.pop_int();
                let operand = self.emit_memory_operand(*offset, 4);
                self.store(false, value, operand);
                self.locs.free_int(value);
            }

            Operation::MemorySize => {
                let dst = self.alloc_int();
                self.load(true, RAX, mem(R12, CTX_MEMORY));
                self.load(true, dst, mem(RAX, 0x08));
                self.shift_imm(true, 5, dst, 16); // bytes to pages
                self.locs.push_int(dst);
            }
            Operation::MemoryGrow => self.emit_builtin(BUILTIN_MEMORY_GROW, 0, 1, 1),
            Operation::MemoryInit(seg) => self.emit_builtin(BUILTIN_MEMORY_INIT, *seg as u64, 3, 0),
            Operation::DataDrop(seg) => self.emit_builtin(BUILTIN_DATA_DROP, *seg as u64, 0, 0),
            Operation::MemoryCopy => self.emit_builtin(BUILTIN_MEMORY_COPY, 0, 3, 0),
            Operation::MemoryFill => self.emit_builtin(BUILTIN_MEMORY_FILL, 0, 3, 0),

            Operation::TableGet(table) => {
                self.pop_to_scratch(RAX);
                self.mov_rr(false, RAX, RAX);
                self.emit_table_ptr(*table);
                self.cmp_rm(true, RAX, mem(RCX, 0x08));
                let oob = self.trap_target(TRAP_TABLE_OOB);
                self.jcc(CC_AE, oob);
                self.load(true, RDX, mem(RCX, 0x00));
                let dst = self.alloc_int();
                self.load(true, dst, indexed(RDX, RAX, 3, 0));
                self.locs.push_int(dst);
            }
            Operation::TableSet(table) => {
                let value = self.pop_int();
                self.pop_to_scratch(RAX);
                self.mov_rr(false, RAX, RAX);
                self.emit_table_ptr(*table);
                self.cmp_rm(true, RAX, mem(RCX, 0x08));
                let oob = self.trap_target(TRAP_TABLE_OOB);
                self.jcc(CC_AE, oob);
                self.load(true, RDX, mem(RCX, 0x00));
                self.store(true, value, indexed(RDX, RAX, 3, 0));
                self.locs.free_int(value);
            }
            Operation::TableSize(table) => {
                self.emit_table_ptr(*table);
                let dst = self.alloc_int();
                self.load(true, dst, mem(RCX, 0x08));
                self.locs.push_int(dst);
            }
            Operation::TableGrow(table) => self.emit_builtin(BUILTIN_TABLE_GROW, *table as u64, 2, 1),
            Operation::TableFill(table) => self.emit_builtin(BUILTIN_TABLE_FILL, *table as u64, 3, 0),
            Operation::TableInit { elem, table } => {
                self.emit_builtin(BUILTIN_TABLE_INIT, ((*elem as u64) << 32) | *table as u64, 3, 0)
            }
            Operation::TableCopy { dst, src } => {
                self.emit_builtin(BUILTIN_TABLE_COPY, ((*dst as u64) << 32) | *src as u64, 3, 0)
            }
            Operation::ElemDrop(seg) => self.emit_builtin(BUILTIN_ELEM_DROP, *seg as u64, 0, 0),

            Operation::RefNull => self.locs.push_const(0),
            Operation::RefFunc(index) => {
                self.load(true, RAX, mem(R12, CTX_FUNCTIONS));
                let dst = self.alloc_int();
                self.lea(dst, mem(RAX, *index as i32 * HANDLE_SIZE));
                self.locs.push_int(dst);
            }
            Operation::RefIsNull => {
                let v = self.pop_int();
                self.test_rr(true, v, v);
                self.setcc(CC_E, v);
                self.locs.push_int(v);
            }

            Operation::Const32(value) => self.locs.push_const(*value as u64),
            Operation::Const64(value) => self.locs.push_const(*value),
            Operation::ConstV128 { lo, hi } => {
                self.locs.push_const(*lo);
                self.locs.push_const(*hi);
            }

            Operation::Eqz(ty) => {
                let wide = *ty == IntTy::I64;
                let v = self.pop_int();
                self.test_rr(wide, v, v);
                self.setcc(CC_E, v);
                self.locs.push_int(v);
            }
            Operation::Eq(ty) => match ty {
                NumTy::I32 => self.int_cmp(false, CC_E),
                NumTy::I64 => self.int_cmp(true, CC_E),
                NumTy::F32 => self.flt_eq(false, false),
                NumTy::F64 => self.flt_eq(true, false),
            },
            Operation::Ne(ty) => match ty {
                NumTy::I32 => self.int_cmp(false, CC_NE),
                NumTy::I64 => self.int_cmp(true, CC_NE),
                NumTy::F32 => self.flt_eq(false, true),
                NumTy::F64 => self.flt_eq(true, true),
            },
            Operation::Lt(ty) => self.emit_ordered_cmp(*ty, CC_L, CC_B, CC_A, true),
            Operation::Gt(ty) => self.emit_ordered_cmp(*ty, CC_G, CC_A, CC_A, false),
            Operation::Le(ty) => self.emit_ordered_cmp(*ty, CC_LE, CC_BE, CC_AE, true),
            Operation::Ge(ty) => self.emit_ordered_cmp(*ty, CC_GE, CC_AE, CC_AE, false),

            Operation::Add(ty) => match ty {
                NumTy::I32 => self.int_binop(false, 0x01),
                NumTy::I64 => self.int_binop(true, 0x01),
                NumTy::F32 => self.flt_binop(false, 0x58),
                NumTy::F64 => self.flt_binop(true, 0x58),
            },
            Operation::Sub(ty) => match ty {
                NumTy::I32 => self.int_binop(false, 0x29),
                NumTy::I64 => self.int_binop(true, 0x29),
                NumTy::F32 => self.flt_binop(false, 0x5c),
                NumTy::F64 => self.flt_binop(true, 0x5c),
            },
            Operation::Mul(ty) => match ty {
                NumTy::F32 => self.flt_binop(false, 0x59),
                NumTy::F64 => self.flt_binop(true, 0x59),
                int => {
                    let wide = *int == NumTy::I64;
                    let b = self.pop_int();
                    let a = self.pop_int();
                    self.rm(None, wide, &[0x0f, 0xaf], a, Rm::Reg(b)); // imul
                    self.locs.free_int(b);
                    self.locs.push_int(a);
                }
            },
            Operation::Clz(ty) => self.emit_bitcount(*ty, 0xbd),
            Operation::Ctz(ty) => self.emit_bitcount(*ty, 0xbc),
            Operation::Popcnt(ty) => self.emit_bitcount(*ty, 0xb8),
            Operation::Div(ty) => match ty {
                SignedTy::I32 => self.emit_div_rem(false, true, false),
                SignedTy::U32 => self.emit_div_rem(false, false, false),
                SignedTy::I64 => self.emit_div_rem(true, true, false),
                SignedTy::U64 => self.emit_div_rem(true, false, false),
                SignedTy::F32 => self.flt_binop(false, 0x5e),
                SignedTy::F64 => self.flt_binop(true, 0x5e),
            },
            Operation::Rem { ty, signed } => self.emit_div_rem(*ty == IntTy::I64, *signed, true),
            Operation::And(ty) => self.int_binop(*ty == IntTy::I64, 0x21),
            Operation::Or(ty) => self.int_binop(*ty == IntTy::I64, 0x09),
            Operation::Xor(ty) => self.int_binop(*ty == IntTy::I64, 0x31),
            Operation::Shl(ty) => self.emit_shift(*ty == IntTy::I64, 4),
            Operation::Shr { ty, signed } => self.emit_shift(*ty == IntTy::I64, if *signed { 7 } else { 5 }),
            Operation::Rotl(ty) => self.emit_shift(*ty == IntTy::I64, 0),
            Operation::Rotr(ty) => self.emit_shift(*ty == IntTy::I64, 1),

            Operation::Abs(ty) => self.emit_sign_op(*ty == FloatTy::F64, true, None),
            Operation::Neg(ty) => self.emit_sign_op(*ty == FloatTy::F64, false, None),
            Operation::Copysign(ty) => self.emit_sign_op(*ty == FloatTy::F64, false, Some(())),
            Operation::Ceil(ty) => self.emit_round(*ty == FloatTy::F64, 2),
            Operation::Floor(ty) => self.emit_round(*ty == FloatTy::F64, 1),
            Operation::Trunc(ty) => self.emit_round(*ty == FloatTy::F64, 3),
            Operation::Nearest(ty) => self.emit_round(*ty == FloatTy::F64, 0),
            Operation::Sqrt(ty) => {
                let wide = *ty == FloatTy::F64;
                let a = self.pop_flt(wide);
                self.sse_arith(wide, 0x51, a, a);
                self.locs.push_flt(a);
            }
            Operation::Min(ty) => self.emit_min_max(*ty == FloatTy::F64, true),
            Operation::Max(ty) => self.emit_min_max(*ty == FloatTy::F64, false),

            Operation::I32WrapI64 => {
                let v = self.pop_int();
                self.mov_rr(false, v, v);
                self.locs.push_int(v);
            }
            Operation::ITruncF { int, signed, float, saturating } => {
                self.emit_trunc(*int, *signed, *float, *saturating)
            }
            Operation::FConvertI { float, signed, int } => self.emit_convert(*float, *signed, *int),
            Operation::F32DemoteF64 => {
                let a = self.pop_flt(true);
                self.sse(Some(0xf2), &[0x0f, 0x5a], a, Rm::Reg(a)); // cvtsd2ss
                self.locs.push_flt(a);
            }
            Operation::F64PromoteF32 => {
                let a = self.pop_flt(false);
                self.sse(Some(0xf3), &[0x0f, 0x5a], a, Rm::Reg(a)); // cvtss2sd
                self.locs.push_flt(a);
            }
            Operation::I64ExtendI32 { signed } => {
                let v = self.pop_int();
                if *signed {
                    self.rm(None, true, &[0x63], v, Rm::Reg(v)); // movsxd
                } else {
                    self.mov_rr(false, v, v);
                }
                self.locs.push_int(v);
            }
            Operation::SignExtend { ty, bits } => {
                let wide = *ty == IntTy::I64;
                let v = self.pop_int();
                match bits {
                    8 => self.rm(None, wide, &[0x0f, 0xbe], v, Rm::Reg(v)),
                    16 => self.rm(None, wide, &[0x0f, 0xbf], v, Rm::Reg(v)),
                    _ => self.rm(None, true, &[0x63], v, Rm::Reg(v)),
                }
                self.locs.push_int(v);
            }

            Operation::V128Add => {
                self.spill_all();
                let height = self.locs.height();
                self.sse(Some(0xf3), &[0x0f, 0x6f], XMM6, slot(height - 4)); // movdqu
                self.sse(Some(0xf3), &[0x0f, 0x6f], XMM7, slot(height - 2));
                self.sse(Some(0x66), &[0x0f, 0xfe], XMM6, Rm::Reg(XMM7)); // paddd
                self.sse(Some(0xf3), &[0x0f, 0x7f], XMM6, slot(height - 4));
                let _ = self.locs.pop();
                let _ = self.locs.pop();
            }
        }
    }

    /// Ordered comparisons: signed/unsigned condition codes for integers;
    /// floats reverse operands for `<`/`<=` so unordered comes out false.
    fn emit_ordered_cmp(&mut self, ty: SignedTy, signed_cc: u8, unsigned_cc: u8, float_cc: u8, reversed: bool) {
        match ty {
            SignedTy::I32 => self.int_cmp(false, signed_cc),
            SignedTy::U32 => self.int_cmp(false, unsigned_cc),
            SignedTy::I64 => self.int_cmp(true, signed_cc),
            SignedTy::U64 => self.int_cmp(true, unsigned_cc),
            SignedTy::F32 => self.flt_cmp(false, float_cc, reversed),
            SignedTy::F64 => self.flt_cmp(true, float_cc, reversed),
        }
    }

    fn emit_bitcount(&mut self, ty: IntTy, opcode: u8) {
        let wide = ty == IntTy::I64;
        let v = self.pop_int();
        self.rm(Some(0xf3), wide, &[0x0f, opcode], v, Rm::Reg(v));
        self.locs.push_int(v);
    }

    fn emit_shift(&mut self, wide: bool, ext: u8) {
        self.pop_to_scratch(RCX);
        let v = self.pop_int();
        self.shift_cl(wide, ext, v);
        self.locs.push_int(v);
    }

    fn finish(mut self) -> Result<()> {
        for fix in std::mem::take(&mut self.fixes) {
            let target = self.resolve(fix.target)?;
            let rel = (target as i64 - (fix.at as i64 + 4)) as i32;
            self.code[fix.at..fix.at + 4].copy_from_slice(&rel.to_le_bytes());
        }
        for fix in std::mem::take(&mut self.table_fixes) {
            let target = self.resolve(FixTarget::Local(fix.local))?;
            let rel = (target as i64 - fix.base as i64) as i32;
            self.code[fix.at..fix.at + 4].copy_from_slice(&rel.to_le_bytes());
        }
        Ok(())
    }

    fn resolve(&self, target: FixTarget) -> Result<usize> {
        match target {
            FixTarget::Label(label) => self.label_offsets[label as usize]
                .ok_or_else(|| Error::CompilationFailed(format!("unresolved label {label}"))),
            FixTarget::Local(label) => self.local_offsets[label as usize]
                .ok_or_else(|| Error::CompilationFailed(format!("unresolved local label {label}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerowasm_types::Features;
    use zerowasm_parser::{CompileOptions, Parser};

    fn lower(wat: &str) -> Module {
        let wasm = wat::parse_str(wat).unwrap();
        Parser::new(Features::wasm_core_2()).parse_module_bytes(wasm, &CompileOptions::default()).unwrap()
    }

    #[test]
    fn emits_position_independent_code() {
        let module = lower(
            r#"(module (func (param i32 i32) (result i32)
                local.get 0
                local.get 1
                i32.add))"#,
        );
        let (code, offsets) = compile(&module).unwrap();
        assert_eq!(offsets, vec![0]);
        assert!(!code.is_empty());
        // every function ends with a reachable ret somewhere
        assert!(code.contains(&0xc3));
    }

    #[test]
    fn compiles_control_flow_and_calls() {
        let module = lower(
            r#"(module
                (func $leaf (param i32) (result i32) local.get 0)
                (func (param i32) (result i32)
                    (block (result i32)
                        local.get 0
                        i32.eqz
                        br_if 0
                        local.get 0
                        call $leaf)))"#,
        );
        let (code, offsets) = compile(&module).unwrap();
        assert_eq!(offsets.len(), 2);
        assert!(offsets[1] > 0);
        assert!(code.len() > offsets[1] as usize);
    }
}
