//! The aarch64 emitter.
//!
//! Register convention inside compiled code: `x19` holds the call engine,
//! `x20` the module context, `x21` the value-stack base address, `x22` the
//! stack pointer (slot index), `x23` the frame base (slot index).
//! `x8`-`x10` and `x16`/`x17` are codegen scratch; `x11`-`x15` and
//! `v0`-`v5` are allocatable; `v6`/`v7` are float scratch. The machine
//! stack is never touched; exits `ret` straight to the trampoline.
//!
//! The structure mirrors the x86-64 emitter: frame-base-relative slot
//! addressing with compile-time indexes, spill-everything at labels,
//! branches, calls, and exits.

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

const X8: u8 = 8;
const X9: u8 = 9;
const X10: u8 = 10;
const X16: u8 = 16;
const X17: u8 = 17;
const CE: u8 = 19; // call engine
const CTX: u8 = 20; // module context
const BASE: u8 = 21; // value-stack base address
const SP: u8 = 22; // stack pointer, in slots
const BP: u8 = 23; // frame base, in slots
const XZR: u8 = 31;

const INT_POOL: &[u8] = &[11, 12, 13, 14, 15];
const FLT_POOL: &[u8] = &[0, 1, 2, 3, 4, 5];
const V6: u8 = 6;
const V7: u8 = 7;

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

const HANDLE_CODE: i32 = 0x00;
const HANDLE_CTX: i32 = 0x08;
const HANDLE_TYPE_ID: i32 = 0x10;
const HANDLE_SIZE: i32 = 0x30;

// condition codes
const EQ: u8 = 0;
const NE: u8 = 1;
const HS: u8 = 2;
const LO: u8 = 3;
const MI: u8 = 4;
const VS: u8 = 6;
const HI: u8 = 8;
const LS: u8 = 9;
const GE: u8 = 10;
const LT: u8 = 11;
const GT: u8 = 12;
const LE: u8 = 13;

pub(crate) fn compile(module: &Module) -> Result<(Vec<u8>, Vec<u32>)> {
    let mut code = Vec::with_capacity(4096);
    let mut offsets = Vec::with_capacity(module.functions.len());
    for function in module.functions.iter() {
        offsets.push(code.len() as u32);
        FunctionCompiler::new(&mut code, module, function).compile()?;
    }
    Ok((code, offsets))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FixTarget {
    Label(u32),
    Local(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FixKind {
    /// B, imm26 at bits 0..26
    Branch26,
    /// B.cond / CBZ / CBNZ, imm19 at bits 5..24
    Branch19,
    /// ADR, imm21 split over immlo/immhi
    Adr,
}

#[derive(Debug)]
struct Fix {
    at: usize,
    target: FixTarget,
    kind: FixKind,
}

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
    label_heights: Vec<Option<u32>>,
    local_offsets: Vec<Option<usize>>,
    fixes: Vec<Fix>,
    table_fixes: Vec<TableFix>,
    trap_labels: [Option<u32>; 8],
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

    // ---- instruction emission ----

    fn ins(&mut self, word: u32) {
        self.code.extend_from_slice(&word.to_le_bytes());
    }

    fn pos(&self) -> usize {
        self.code.len()
    }

    fn local_label(&mut self) -> u32 {
        self.local_offsets.push(None);
        (self.local_offsets.len() - 1) as u32
    }

    fn bind_local(&mut self, label: u32) {
        self.local_offsets[label as usize] = Some(self.pos());
    }

    fn fix_here(&mut self, target: FixTarget, kind: FixKind) {
        self.fixes.push(Fix { at: self.pos(), target, kind });
    }

    fn b(&mut self, target: FixTarget) {
        self.fix_here(target, FixKind::Branch26);
        self.ins(0x14000000);
    }

    fn b_cond(&mut self, cond: u8, target: FixTarget) {
        self.fix_here(target, FixKind::Branch19);
        self.ins(0x54000000 | cond as u32);
    }

    fn cbz(&mut self, wide: bool, reg: u8, target: FixTarget) {
        self.fix_here(target, FixKind::Branch19);
        self.ins(if wide { 0xb4000000 } else { 0x34000000 } | reg as u32);
    }

    fn cbnz(&mut self, wide: bool, reg: u8, target: FixTarget) {
        self.fix_here(target, FixKind::Branch19);
        self.ins(if wide { 0xb5000000 } else { 0x35000000 } | reg as u32);
    }

    fn adr(&mut self, reg: u8, target: FixTarget) {
        self.fix_here(target, FixKind::Adr);
        self.ins(0x10000000 | reg as u32);
    }

    fn br(&mut self, reg: u8) {
        self.ins(0xd61f0000 | ((reg as u32) << 5));
    }

    fn ret(&mut self) {
        self.ins(0xd65f03c0);
    }

    /// Loads a 64-bit immediate with movz/movk.
    fn mov_imm(&mut self, reg: u8, imm: u64) {
        let mut emitted = false;
        for hw in 0..4 {
            let part = (imm >> (hw * 16)) & 0xffff;
            if part != 0 || (hw == 3 && !emitted && imm == 0) {
                let opcode = if emitted { 0xf2800000 } else { 0xd2800000 };
                self.ins(opcode | ((hw as u32) << 21) | ((part as u32) << 5) | reg as u32);
                emitted = true;
            }
        }
        if !emitted {
            self.ins(0xd2800000 | reg as u32); // movz reg, #0
        }
    }

    fn mov_rr(&mut self, wide: bool, dst: u8, src: u8) {
        // orr dst, zr, src; the 32-bit form zero-extends
        let base = if wide { 0xaa0003e0 } else { 0x2a0003e0 };
        self.ins(base | ((src as u32) << 16) | dst as u32);
    }

    /// ldr/str of a 64-bit register with an unsigned scaled offset.
    fn ldr(&mut self, dst: u8, base: u8, offset: i32) {
        debug_assert!(offset >= 0 && offset % 8 == 0 && offset / 8 < 4096);
        self.ins(0xf9400000 | (((offset / 8) as u32) << 10) | ((base as u32) << 5) | dst as u32);
    }

    fn str(&mut self, src: u8, base: u8, offset: i32) {
        debug_assert!(offset >= 0 && offset % 8 == 0 && offset / 8 < 4096);
        self.ins(0xf9000000 | (((offset / 8) as u32) << 10) | ((base as u32) << 5) | src as u32);
    }

    fn ldr32(&mut self, dst: u8, base: u8, offset: i32) {
        debug_assert!(offset >= 0 && offset % 4 == 0 && offset / 4 < 4096);
        self.ins(0xb9400000 | (((offset / 4) as u32) << 10) | ((base as u32) << 5) | dst as u32);
    }

    fn str32(&mut self, src: u8, base: u8, offset: i32) {
        debug_assert!(offset >= 0 && offset % 4 == 0 && offset / 4 < 4096);
        self.ins(0xb9000000 | (((offset / 4) as u32) << 10) | ((base as u32) << 5) | src as u32);
    }

    /// add/sub immediate, materializing through x17 when out of range.
    fn add_imm(&mut self, dst: u8, src: u8, imm: u64) {
        if imm < 4096 {
            self.ins(0x91000000 | ((imm as u32) << 10) | ((src as u32) << 5) | dst as u32);
        } else {
            self.mov_imm(X17, imm);
            self.add_rr(true, dst, src, X17);
        }
    }

    fn sub_imm(&mut self, dst: u8, src: u8, imm: u64) {
        if imm < 4096 {
            self.ins(0xd1000000 | ((imm as u32) << 10) | ((src as u32) << 5) | dst as u32);
        } else {
            self.mov_imm(X17, imm);
            self.ins(0xcb000000 | ((X17 as u32) << 16) | ((src as u32) << 5) | dst as u32);
        }
    }

    fn add_rr(&mut self, wide: bool, dst: u8, a: u8, b: u8) {
        let base = if wide { 0x8b000000 } else { 0x0b000000 };
        self.ins(base | ((b as u32) << 16) | ((a as u32) << 5) | dst as u32);
    }

    fn sub_rr(&mut self, wide: bool, dst: u8, a: u8, b: u8) {
        let base = if wide { 0xcb000000 } else { 0x4b000000 };
        self.ins(base | ((b as u32) << 16) | ((a as u32) << 5) | dst as u32);
    }

    /// add dst, a, b, LSL #shift
    fn add_shifted(&mut self, dst: u8, a: u8, b: u8, shift: u8) {
        self.ins(0x8b000000 | ((b as u32) << 16) | ((shift as u32) << 10) | ((a as u32) << 5) | dst as u32);
    }

    fn logic_rr(&mut self, wide: bool, opc: u32, dst: u8, a: u8, b: u8) {
        // opc: 0x0a and, 0x2a orr, 0x4a eor (the 32-bit opcode bytes)
        let base = (opc << 24) | if wide { 0x80000000 } else { 0 };
        self.ins(base | ((b as u32) << 16) | ((a as u32) << 5) | dst as u32);
    }

    /// orr dst, a, b, LSL #shift
    fn orr_shifted(&mut self, dst: u8, a: u8, b: u8, shift: u8) {
        self.ins(0xaa000000 | ((b as u32) << 16) | ((shift as u32) << 10) | ((a as u32) << 5) | dst as u32);
    }

    fn lsr_imm(&mut self, wide: bool, dst: u8, src: u8, amount: u8) {
        if wide {
            // ubfm dst, src, #amount, #63
            self.ins(0xd340fc00 | ((amount as u32) << 16) | ((src as u32) << 5) | dst as u32);
        } else {
            self.ins(0x53007c00 | ((amount as u32) << 16) | ((src as u32) << 5) | dst as u32);
        }
    }

    fn cmp_rr(&mut self, wide: bool, a: u8, b: u8) {
        let base = if wide { 0xeb00001f } else { 0x6b00001f };
        self.ins(base | ((b as u32) << 16) | ((a as u32) << 5));
    }

    fn cmp_imm(&mut self, wide: bool, reg: u8, imm: u32) {
        debug_assert!(imm < 4096);
        let base = if wide { 0xf100001f } else { 0x7100001f };
        self.ins(base | (imm << 10) | ((reg as u32) << 5));
    }

    /// cmn reg, #1 — compare against -1 without a temporary
    fn cmn_one(&mut self, wide: bool, reg: u8) {
        let base = if wide { 0xb100001f } else { 0x3100001f };
        self.ins(base | (1 << 10) | ((reg as u32) << 5));
    }

    fn tst_rr(&mut self, wide: bool, a: u8, b: u8) {
        let base = if wide { 0xea00001f } else { 0x6a00001f };
        self.ins(base | ((b as u32) << 16) | ((a as u32) << 5));
    }

    fn cset(&mut self, reg: u8, cond: u8) {
        // csinc reg, zr, zr, !cond
        let inv = (cond ^ 1) as u32;
        self.ins(0x1a9f07e0 | (inv << 12) | reg as u32);
    }

    fn csel(&mut self, wide: bool, dst: u8, a: u8, b: u8, cond: u8) {
        let base = if wide { 0x9a800000 } else { 0x1a800000 };
        self.ins(base | ((b as u32) << 16) | ((cond as u32) << 12) | ((a as u32) << 5) | dst as u32);
    }

    /// Variable shifts and rotates (lslv family).
    fn shift_var(&mut self, wide: bool, op: u32, dst: u8, a: u8, b: u8) {
        // op: 8 lsl, 9 lsr, 10 asr, 11 ror
        let base = if wide { 0x9ac00000 } else { 0x1ac00000 };
        self.ins(base | ((b as u32) << 16) | (op << 10) | ((a as u32) << 5) | dst as u32);
    }

    // ---- FP emission ----

    fn fmov_to_gp(&mut self, wide: bool, gp: u8, v: u8) {
        let base = if wide { 0x9e660000 } else { 0x1e260000 };
        self.ins(base | ((v as u32) << 5) | gp as u32);
    }

    fn fmov_from_gp(&mut self, wide: bool, v: u8, gp: u8) {
        let base = if wide { 0x9e670000 } else { 0x1e270000 };
        self.ins(base | ((gp as u32) << 5) | v as u32);
    }

    fn ldr_d(&mut self, dst: u8, base: u8, offset: i32) {
        debug_assert!(offset >= 0 && offset % 8 == 0 && offset / 8 < 4096);
        self.ins(0xfd400000 | (((offset / 8) as u32) << 10) | ((base as u32) << 5) | dst as u32);
    }

    fn str_d(&mut self, src: u8, base: u8, offset: i32) {
        debug_assert!(offset >= 0 && offset % 8 == 0 && offset / 8 < 4096);
        self.ins(0xfd000000 | (((offset / 8) as u32) << 10) | ((base as u32) << 5) | src as u32);
    }

    /// Two-operand scalar FP arithmetic.
    fn fp_binop(&mut self, wide: bool, opc: u32, dst: u8, a: u8, b: u8) {
        // opc at bits 10..15: 0x0a fadd? encoded via full pattern below
        let ty = if wide { 0x00400000 } else { 0 };
        self.ins(0x1e200800 | ty | ((b as u32) << 16) | (opc << 12) | ((a as u32) << 5) | dst as u32);
    }

    /// One-operand scalar FP ops (fabs/fneg/fsqrt/frint*/fcvt).
    fn fp_unop(&mut self, word: u32, dst: u8, src: u8) {
        self.ins(word | ((src as u32) << 5) | dst as u32);
    }

    fn fcmp(&mut self, wide: bool, a: u8, b: u8) {
        let ty = if wide { 0x00400000 } else { 0 };
        self.ins(0x1e202000 | ty | ((b as u32) << 16) | ((a as u32) << 5));
    }

    // ---- value-stack plumbing ----

    /// The address of slot `bp + index` into x16, returning the remaining
    /// immediate for the access.
    fn slot_addr(&mut self, index: u32) -> (u8, i32) {
        self.add_shifted(X16, BASE, BP, 3);
        let offset = 8 * index as i64;
        if offset / 8 < 4096 {
            (X16, offset as i32)
        } else {
            self.add_imm(X16, X16, offset as u64);
            (X16, 0)
        }
    }

    fn load_slot(&mut self, dst: u8, index: u32) {
        let (base, offset) = self.slot_addr(index);
        self.ldr(dst, base, offset);
    }

    fn store_slot(&mut self, src: u8, index: u32) {
        let (base, offset) = self.slot_addr(index);
        self.str(src, base, offset);
    }

    fn load_slot_d(&mut self, dst: u8, index: u32) {
        let (base, offset) = self.slot_addr(index);
        self.ldr_d(dst, base, offset);
    }

    fn store_slot_d(&mut self, src: u8, index: u32) {
        let (base, offset) = self.slot_addr(index);
        self.str_d(src, base, offset);
    }

    fn spill_all(&mut self) {
        for (index, loc) in self.locs.pending_spills() {
            match loc {
                Loc::IntReg(reg) => self.store_slot(reg, index as u32),
                Loc::FltReg(reg) => self.store_slot_d(reg, index as u32),
                Loc::Const(value) => {
                    self.mov_imm(X8, value);
                    self.store_slot(X8, index as u32);
                }
                Loc::Stack => {}
            }
        }
        self.locs.spill_done();
    }

    fn sync_sp(&mut self) {
        let height = self.locs.height();
        self.add_imm(SP, BP, height as u64);
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
                self.store_slot_d(reg, index as u32);
                self.locs.mark_spilled(index);
                reg
            }
        }
    }

    fn pop_int(&mut self) -> u8 {
        let index = self.locs.height() - 1;
        match self.locs.pop_keep() {
            Loc::IntReg(reg) => reg,
            Loc::FltReg(reg) => {
                self.locs.free_flt(reg);
                let dst = self.alloc_int();
                self.fmov_to_gp(true, dst, reg);
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

    fn pop_flt(&mut self) -> u8 {
        let index = self.locs.height() - 1;
        match self.locs.pop_keep() {
            Loc::FltReg(reg) => reg,
            Loc::IntReg(reg) => {
                self.locs.free_int(reg);
                let dst = self.alloc_flt();
                self.fmov_from_gp(true, dst, reg);
                dst
            }
            Loc::Const(value) => {
                self.mov_imm(X8, value);
                let dst = self.alloc_flt();
                self.fmov_from_gp(true, dst, X8);
                dst
            }
            Loc::Stack => {
                let dst = self.alloc_flt();
                self.load_slot_d(dst, index);
                dst
            }
        }
    }

    fn pop_to_scratch(&mut self, scratch: u8) {
        let index = self.locs.height() - 1;
        match self.locs.pop() {
            Loc::IntReg(reg) => self.mov_rr(true, scratch, reg),
            Loc::FltReg(reg) => self.fmov_to_gp(true, scratch, reg),
            Loc::Const(value) => self.mov_imm(scratch, value),
            Loc::Stack => self.load_slot(scratch, index),
        }
    }

    // ---- exits ----

    fn sync_engine(&mut self) {
        self.str(SP, CE, CE_SP);
        self.str(BP, CE, CE_BP);
        self.str(CTX, CE, CE_CTX);
    }

    fn set_status(&mut self, status: u32) {
        self.mov_imm(X17, status as u64);
        self.str32(X17, CE, CE_STATUS);
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

    fn emit_builtin(&mut self, builtin: u32, imm: u64, pops: u32, pushes: u32) {
        for _ in 0..pops {
            let _ = self.locs.pop();
        }
        self.spill_all();
        let height = self.locs.height() + pops;
        self.add_imm(SP, BP, height as u64);
        self.sync_engine();
        self.mov_imm(X8, imm);
        self.str(X8, CE, CE_EXIT_VALUE);
        self.mov_imm(X17, builtin as u64);
        self.str32(X17, CE, CE_EXIT_ARG);
        let resume = self.local_label();
        self.adr(X17, FixTarget::Local(resume));
        self.str(X17, CE, CE_CONTINUATION);
        self.set_status(STATUS_CALL_BUILTIN);
        self.ret();
        self.bind_local(resume);
        for _ in 0..pushes {
            self.locs.push_stack();
        }
    }

    // ---- control flow ----

    fn emit_drop_shuffle(&mut self, height: u32, range: &DropRange) {
        let kept = range.start;
        let dropped = range.end - range.start + 1;
        for i in 0..kept {
            self.load_slot(X8, height - kept + i);
            self.store_slot(X8, height - kept - dropped + i);
        }
        self.add_imm(SP, BP, (height - dropped) as u64);
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

    fn emit_branch(&mut self, target: &BranchTarget) {
        self.record_target_height(target);
        let height = self.locs.height();
        if let Some(range) = &target.drop {
            self.emit_drop_shuffle(height, range);
        }
        self.b(FixTarget::Label(target.label));
    }

    // ---- prologue / epilogue ----

    fn emit_entry(&mut self) {
        let params = self.ty.param_slots();
        let locals = self.func.local_slots;
        let ceil = self.func.stack_ceil.max(params + locals).max(self.ty.result_slots());

        self.add_imm(X8, BP, ceil as u64);
        self.ldr(X9, CE, CE_STACK_LEN);
        self.cmp_rr(true, X8, X9);
        let fits = self.local_label();
        self.b_cond(LS, FixTarget::Local(fits));
        self.sync_engine();
        self.mov_imm(X17, ceil as u64);
        self.str32(X17, CE, CE_EXIT_ARG);
        // rerun the entry check after growth
        let entry_back = self.entry as i64 - self.pos() as i64;
        self.emit_adr_fixed(X17, entry_back);
        self.str(X17, CE, CE_CONTINUATION);
        self.set_status(STATUS_GROW_VALUE_STACK);
        self.ret();
        self.bind_local(fits);

        for i in 0..locals {
            self.store_slot(XZR, params + i);
        }
        self.add_imm(SP, BP, (params + locals) as u64);
    }

    /// adr with a known delta (backwards to the function entry).
    fn emit_adr_fixed(&mut self, reg: u8, delta: i64) {
        assert!((-(1 << 20)..(1 << 20)).contains(&delta), "adr target out of range");
        let imm = delta as u32 & 0x1fffff;
        let immlo = imm & 3;
        let immhi = imm >> 2;
        self.ins(0x10000000 | (immlo << 29) | (immhi << 5) | reg as u32);
    }

    fn emit_return(&mut self) {
        let results = self.ty.result_slots();
        let height = self.locs.height();
        for i in 0..results {
            self.load_slot(X8, height - results + i);
            self.store_slot(X8, i);
        }
        self.add_imm(SP, BP, results as u64);

        self.ldr(X9, CE, CE_FRAMES_LEN);
        self.sub_imm(X9, X9, 1);
        self.str(X9, CE, CE_FRAMES_LEN);
        self.ldr(X10, CE, CE_FRAMES_PTR);
        self.add_shifted(X8, X9, X9, 1); // x8 = 3 * frames_len
        self.add_shifted(X10, X10, X8, 3); // frame address
        self.ldr(X9, X10, 0x00); // return address
        self.ldr(BP, X10, 0x08);
        self.ldr(CTX, X10, 0x10);
        let inner = self.local_label();
        self.cbnz(true, X9, FixTarget::Local(inner));
        self.sync_engine();
        self.set_status(STATUS_RETURNED);
        self.ret();
        self.bind_local(inner);
        self.br(X9);
    }

    /// The shared call tail; the callee handle address is in x8.
    fn emit_call_via_handle(&mut self, param_slots: u32, index_slots: u32, seq_start: u32) {
        self.ldr(X9, X8, HANDLE_CODE);
        let wasm = self.local_label();
        self.cbnz(true, X9, FixTarget::Local(wasm));
        self.str(X8, CE, CE_EXIT_VALUE);
        self.sync_engine();
        self.mov_imm(X17, index_slots as u64);
        self.str32(X17, CE, CE_EXIT_ARG);
        let done = self.local_label();
        self.adr(X17, FixTarget::Local(done));
        self.str(X17, CE, CE_CONTINUATION);
        self.set_status(STATUS_CALL_HOST);
        self.ret();

        self.bind_local(wasm);
        self.ldr(X9, CE, CE_FRAMES_LEN);
        self.ldr(X10, CE, CE_FRAMES_CAP);
        self.cmp_rr(true, X9, X10);
        let room = self.local_label();
        self.b_cond(LO, FixTarget::Local(room));
        self.sync_engine();
        self.adr(X17, FixTarget::Local(seq_start));
        self.str(X17, CE, CE_CONTINUATION);
        self.set_status(STATUS_GROW_FRAME_STACK);
        self.ret();

        self.bind_local(room);
        self.ldr(X10, CE, CE_FRAMES_PTR);
        self.add_shifted(X16, X9, X9, 1); // 3 * frames_len
        self.add_shifted(X10, X10, X16, 3);
        self.adr(X17, FixTarget::Local(done));
        self.str(X17, X10, 0x00);
        self.str(BP, X10, 0x08);
        self.str(CTX, X10, 0x10);
        self.add_imm(X9, X9, 1);
        self.str(X9, CE, CE_FRAMES_LEN);

        let height = self.locs.height();
        self.add_imm(BP, BP, (height - index_slots - param_slots) as u64);
        self.ldr(CTX, X8, HANDLE_CTX);
        self.ldr(X9, X8, HANDLE_CODE);
        self.br(X9);

        self.bind_local(done);
    }

    // ---- memory access ----

    /// Pops the i32 address, bounds-checks, and leaves the host address
    /// (base + addr + offset) in x8.
    fn emit_memory_address(&mut self, offset: u32, size: u32) {
        self.pop_to_scratch(X8);
        self.mov_rr(false, X8, X8); // 32-bit addresses
        let end = offset as u64 + size as u64;
        self.add_imm(X9, X8, end);
        self.ldr(X10, CTX, CTX_MEMORY);
        self.ldr(X17, X10, 0x08);
        self.cmp_rr(true, X9, X17);
        let oob = self.trap_target(TRAP_MEMORY_OOB);
        self.b_cond(HI, oob);
        self.ldr(X10, X10, 0x00);
        self.add_rr(true, X8, X8, X10);
        if offset > 0 {
            self.add_imm(X8, X8, offset as u64);
        }
    }

    fn emit_table_ptr(&mut self, table: u32) {
        self.ldr(X9, CTX, CTX_TABLES);
        if 8 * table as i64 / 8 < 4096 {
            self.ldr(X9, X9, 8 * table as i32);
        } else {
            self.add_imm(X9, X9, 8 * table as u64);
            self.ldr(X9, X9, 0);
        }
    }

    // ---- numeric helpers ----

    fn int_binop(&mut self, f: impl FnOnce(&mut Self, u8, u8, u8)) {
        let b = self.pop_int();
        let a = self.pop_int();
        f(self, a, a, b);
        self.locs.free_int(b);
        self.locs.push_int(a);
    }

    fn int_cmp(&mut self, wide: bool, cond: u8) {
        let b = self.pop_int();
        let a = self.pop_int();
        self.cmp_rr(wide, a, b);
        self.cset(a, cond);
        self.locs.free_int(b);
        self.locs.push_int(a);
    }

    fn flt_cmp(&mut self, wide: bool, cond: u8) {
        let b = self.pop_flt();
        let a = self.pop_flt();
        self.fcmp(wide, a, b);
        self.locs.free_flt(a);
        self.locs.free_flt(b);
        let dst = self.alloc_int();
        self.cset(dst, cond);
        self.locs.push_int(dst);
    }

    fn flt_binop(&mut self, wide: bool, opc: u32) {
        let b = self.pop_flt();
        let a = self.pop_flt();
        self.fp_binop(wide, opc, a, a, b);
        self.locs.free_flt(b);
        self.locs.push_flt(a);
    }

    fn flt_unop(&mut self, word32: u32, word64: u32, wide: bool) {
        let a = self.pop_flt();
        self.fp_unop(if wide { word64 } else { word32 }, a, a);
        self.locs.push_flt(a);
    }

    fn emit_div(&mut self, wide: bool, signed: bool) {
        let b = self.pop_int();
        let a = self.pop_int();
        let div0 = self.trap_target(TRAP_DIV_BY_ZERO);
        self.cbz(wide, b, div0);
        if signed {
            // INT_MIN / -1 overflows; the hardware would return INT_MIN
            let ok = self.local_label();
            self.cmn_one(wide, b);
            self.b_cond(NE, FixTarget::Local(ok));
            let min = if wide { i64::MIN as u64 } else { i32::MIN as u32 as u64 };
            self.mov_imm(X17, min);
            self.cmp_rr(wide, a, X17);
            let overflow = self.trap_target(TRAP_INT_OVERFLOW);
            self.b_cond(EQ, overflow);
            self.bind_local(ok);
            let base = if wide { 0x9ac00c00 } else { 0x1ac00c00 };
            self.ins(base | ((b as u32) << 16) | ((a as u32) << 5) | a as u32);
        } else {
            let base = if wide { 0x9ac00800 } else { 0x1ac00800 };
            self.ins(base | ((b as u32) << 16) | ((a as u32) << 5) | a as u32);
        }
        self.locs.free_int(b);
        self.locs.push_int(a);
    }

    fn emit_rem(&mut self, wide: bool, signed: bool) {
        let b = self.pop_int();
        let a = self.pop_int();
        let div0 = self.trap_target(TRAP_DIV_BY_ZERO);
        self.cbz(wide, b, div0);
        // quotient into x17, then a - q*b; INT_MIN % -1 comes out 0 without
        // a special case
        let div = if signed { 0x0c00 } else { 0x0800 };
        let base = if wide { 0x9ac00000 } else { 0x1ac00000 };
        self.ins(base | div | ((b as u32) << 16) | ((a as u32) << 5) | X17 as u32);
        // msub a, x17, b, a
        let msub = if wide { 0x9b008000 } else { 0x1b008000 };
        self.ins(msub | ((b as u32) << 16) | ((a as u32) << 10) | ((X17 as u32) << 5) | a as u32);
        self.locs.free_int(b);
        self.locs.push_int(a);
    }

    /// Trapping or saturating float-to-int truncation. The source is
    /// widened to f64 in v6; fcvtzs/fcvtzu already saturate, so the
    /// saturating variants need no checks at all.
    fn emit_trunc(&mut self, int: IntTy, signed: bool, float: FloatTy, saturating: bool) {
        let src = self.pop_flt();
        match float {
            FloatTy::F32 => self.fp_unop(0x1e22c000, V6, src), // fcvt d6, s
            FloatTy::F64 => self.fp_unop(0x1e604000, V6, src), // fmov d6, d
        }
        self.locs.free_flt(src);

        if !saturating {
            let invalid = self.trap_target(TRAP_INVALID_CONVERSION);
            self.fcmp(true, V6, V6);
            self.b_cond(VS, invalid);
            let overflow = self.trap_target(TRAP_INT_OVERFLOW);
            let (upper, lower_trap_cond, lower): (f64, u8, f64) = match (int, signed) {
                (IntTy::I32, true) => (2147483648.0, LS, -2147483649.0),
                (IntTy::I32, false) => (4294967296.0, LS, -1.0),
                (IntTy::I64, true) => (9223372036854775808.0, MI, -9223372036854775808.0),
                (IntTy::I64, false) => (18446744073709551616.0, LS, -1.0),
            };
            self.mov_imm(X17, upper.to_bits());
            self.fmov_from_gp(true, V7, X17);
            self.fcmp(true, V6, V7);
            self.b_cond(GE, overflow);
            self.mov_imm(X17, lower.to_bits());
            self.fmov_from_gp(true, V7, X17);
            self.fcmp(true, V6, V7);
            self.b_cond(lower_trap_cond, overflow);
        }

        let dst = self.alloc_int();
        let word = match (int, signed) {
            (IntTy::I32, true) => 0x1e780000,  // fcvtzs w, d
            (IntTy::I32, false) => 0x1e790000, // fcvtzu w, d
            (IntTy::I64, true) => 0x9e780000,
            (IntTy::I64, false) => 0x9e790000,
        };
        self.fp_unop(word, dst, V6);
        self.locs.push_int(dst);
    }

    fn emit_convert(&mut self, float: FloatTy, signed: bool, int: IntTy) {
        let v = self.pop_int();
        if int == IntTy::I32 && !signed {
            self.mov_rr(false, v, v);
        }
        let dst = self.alloc_flt();
        let wide_int = int == IntTy::I64 || !signed && int == IntTy::I32;
        let word = match (float, signed, wide_int) {
            (FloatTy::F32, true, false) => 0x1e220000,
            (FloatTy::F32, true, true) => 0x9e220000,
            (FloatTy::F32, false, _) => {
                if int == IntTy::I64 {
                    0x9e230000
                } else {
                    0x9e220000 // zero-extended, convert as signed 64-bit
                }
            }
            (FloatTy::F64, true, false) => 0x1e620000,
            (FloatTy::F64, true, true) => 0x9e620000,
            (FloatTy::F64, false, _) => {
                if int == IntTy::I64 {
                    0x9e630000
                } else {
                    0x9e620000
                }
            }
        };
        self.fp_unop(word, dst, v);
        self.locs.free_int(v);
        self.locs.push_flt(dst);
    }

    fn emit_popcnt(&mut self, wide: bool) {
        let v = self.pop_int();
        if !wide {
            self.mov_rr(false, v, v);
        }
        self.fmov_from_gp(true, V6, v);
        self.ins(0x0e205800 | ((V6 as u32) << 5) | V6 as u32); // cnt v6.8b
        self.ins(0x0e31b800 | ((V6 as u32) << 5) | V6 as u32); // addv b6
        self.fmov_to_gp(false, v, V6);
        self.locs.push_int(v);
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
                self.b(trap);
                self.dead = true;
            }
            Operation::Label(id) => {
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
                self.locs.free_int(cond);
                let fall = self.local_label();
                self.cbz(false, cond, FixTarget::Local(fall));
                self.emit_branch(then);
                self.bind_local(fall);
                self.record_target_height(els);
            }
            Operation::BrTable { targets, default } => {
                self.pop_to_scratch(X8);
                self.spill_all();
                self.sync_sp();
                let count = targets.len() as u32;
                self.mov_rr(false, X8, X8);
                if count < 4096 {
                    self.cmp_imm(false, X8, count);
                } else {
                    self.mov_imm(X17, count as u64);
                    self.cmp_rr(false, X8, X17);
                }
                let in_range = self.local_label();
                self.b_cond(LO, FixTarget::Local(in_range));
                self.mov_imm(X8, count as u64);
                self.bind_local(in_range);
                let table = self.local_label();
                self.adr(X16, FixTarget::Local(table));
                // ldrsw x17, [x16, w8, uxtw #2]
                self.ins(0xb8a04800 | (1 << 12) | ((X8 as u32) << 16) | ((X16 as u32) << 5) | X17 as u32);
                self.add_rr(true, X16, X16, X17);
                self.br(X16);

                self.bind_local(table);
                let base = self.pos();
                let mut stubs = Vec::with_capacity(targets.len() + 1);
                for _ in 0..=targets.len() {
                    let stub = self.local_label();
                    let at = self.pos();
                    self.ins(0);
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
                self.ldr(X8, CTX, CTX_FUNCTIONS);
                self.add_imm(X8, X8, *func_index as u64 * HANDLE_SIZE as u64);
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
                let height = self.locs.height();
                self.load_slot(X8, height - 1);
                self.mov_rr(false, X8, X8);
                self.emit_table_ptr(*table);
                self.ldr(X17, X9, 0x08);
                self.cmp_rr(true, X8, X17);
                let oob = self.trap_target(TRAP_TABLE_OOB);
                self.b_cond(HS, oob);
                self.ldr(X10, X9, 0x00);
                // x8 = table element
                self.ins(0xf8607800 | ((X8 as u32) << 16) | ((X10 as u32) << 5) | X8 as u32);
                let null = self.trap_target(TRAP_NULL_REF);
                self.cbz(true, X8, null);
                self.ldr32(X9, X8, HANDLE_TYPE_ID);
                self.ldr(X10, CTX, CTX_TYPE_IDS);
                self.ldr32(X10, X10, 4 * *type_idx as i32);
                self.cmp_rr(false, X9, X10);
                let mismatch = self.trap_target(TRAP_INDIRECT_MISMATCH);
                self.b_cond(NE, mismatch);
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
                self.pop_to_scratch(X8);
                let b = self.pop_int();
                let a = self.pop_int();
                self.cmp_imm(false, X8, 0);
                self.csel(true, a, a, b, NE);
                self.locs.free_int(b);
                self.locs.push_int(a);
            }
            Operation::Select { wide: true } => {
                self.pop_to_scratch(X8);
                self.spill_all();
                let height = self.locs.height();
                let keep = self.local_label();
                self.cbnz(false, X8, FixTarget::Local(keep));
                self.load_slot(X9, height - 2);
                self.store_slot(X9, height - 4);
                self.load_slot(X9, height - 1);
                self.store_slot(X9, height - 3);
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
                        self.fmov_to_gp(true, dst, src);
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
                self.pop_to_scratch(X8);
                self.locs.invalidate(target as usize);
                self.store_slot(X8, target);
            }

            Operation::GlobalGet { index, wide } => {
                self.ldr(X8, CTX, CTX_GLOBALS);
                self.ldr(X8, X8, 8 * *index as i32);
                let lo = self.alloc_int();
                self.ldr(lo, X8, 0);
                self.locs.push_int(lo);
                if *wide {
                    let hi = self.alloc_int();
                    self.ldr(hi, X8, 8);
                    self.locs.push_int(hi);
                }
            }
            Operation::GlobalSet { index, wide } => {
                if *wide {
                    self.pop_to_scratch(X9); // high half
                    self.pop_to_scratch(X10);
                    self.ldr(X8, CTX, CTX_GLOBALS);
                    self.ldr(X8, X8, 8 * *index as i32);
                    self.str(X10, X8, 0);
                    self.str(X9, X8, 8);
                } else {
                    self.pop_to_scratch(X9);
                    self.ldr(X8, CTX, CTX_GLOBALS);
                    self.ldr(X8, X8, 8 * *index as i32);
                    self.str(X9, X8, 0);
                }
            }

            Operation::Load { ty, offset } => {
                let size = match ty {
                    NumTy::I32 | NumTy::F32 => 4,
                    NumTy::I64 | NumTy::F64 => 8,
                };
                self.emit_memory_address(*offset, size);
                match ty {
                    NumTy::I32 => {
                        let dst = self.alloc_int();
                        self.ldr32(dst, X8, 0);
                        self.locs.push_int(dst);
                    }
                    NumTy::I64 => {
                        let dst = self.alloc_int();
                        self.ldr(dst, X8, 0);
                        self.locs.push_int(dst);
                    }
                    NumTy::F32 => {
                        let dst = self.alloc_flt();
                        self.ins(0xbd400000 | ((X8 as u32) << 5) | dst as u32); // ldr s
                        self.locs.push_flt(dst);
                    }
                    NumTy::F64 => {
                        let dst = self.alloc_flt();
                        self.ldr_d(dst, X8, 0);
                        self.locs.push_flt(dst);
                    }
                }
            }
            Operation::Load8 { ty, signed, offset } => {
                self.emit_memory_address(*offset, 1);
                let dst = self.alloc_int();
                let word = match (signed, ty) {
                    (false, _) => 0x39400000,            // ldrb
                    (true, IntTy::I32) => 0x39c00000,    // ldrsb w
                    (true, IntTy::I64) => 0x39800000,    // ldrsb x
                };
                self.ins(word | ((X8 as u32) << 5) | dst as u32);
                self.locs.push_int(dst);
            }
            Operation::Load16 { ty, signed, offset } => {
                self.emit_memory_address(*offset, 2);
                let dst = self.alloc_int();
                let word = match (signed, ty) {
                    (false, _) => 0x79400000,
                    (true, IntTy::I32) => 0x79c00000,
                    (true, IntTy::I64) => 0x79800000,
                };
                self.ins(word | ((X8 as u32) << 5) | dst as u32);
                self.locs.push_int(dst);
            }
            Operation::Load32 { signed, offset } => {
                self.emit_memory_address(*offset, 4);
                let dst = self.alloc_int();
                let word = if *signed { 0xb9800000 } else { 0xb9400000 };
                self.ins(word | ((X8 as u32) << 5) | dst as u32);
                self.locs.push_int(dst);
            }
            Operation::Store { ty, offset } => {
                let size = match ty {
                    NumTy::I32 | NumTy::F32 => 4,
                    NumTy::I64 | NumTy::F64 => 8,
                };
                let value = self.pop_int();
                self.emit_memory_address(*offset, size);
                if size == 8 {
                    self.str(value, X8, 0);
                } else {
                    self.str32(value, X8, 0);
                }
                self.locs.free_int(value);
            }
            Operation::Store8 { offset } => {
                let value = self.pop_int();
                self.emit_memory_address(*offset, 1);
                self.ins(0x39000000 | ((X8 as u32) << 5) | value as u32); // strb
                self.locs.free_int(value);
            }
            Operation::Store16 { offset } => {
                let value = self.pop_int();
                self.emit_memory_address(*offset, 2);
                self.ins(0x79000000 | ((X8 as u32) << 5) | value as u32); // strh
                self.locs.free_int(value);
            }
            Operation::Store32 { offset } => {
                let value = self.pop_int();
                self.emit_memory_address(*offset, 4);
                self.str32(value, X8, 0);
                self.locs.free_int(value);
            }

            Operation::MemorySize => {
                self.ldr(X8, CTX, CTX_MEMORY);
                let dst = self.alloc_int();
                self.ldr(dst, X8, 0x08);
                self.lsr_imm(true, dst, dst, 16);
                self.locs.push_int(dst);
            }
            Operation::MemoryGrow => self.emit_builtin(BUILTIN_MEMORY_GROW, 0, 1, 1),
            Operation::MemoryInit(seg) => self.emit_builtin(BUILTIN_MEMORY_INIT, *seg as u64, 3, 0),
            Operation::DataDrop(seg) => self.emit_builtin(BUILTIN_DATA_DROP, *seg as u64, 0, 0),
            Operation::MemoryCopy => self.emit_builtin(BUILTIN_MEMORY_COPY, 0, 3, 0),
            Operation::MemoryFill => self.emit_builtin(BUILTIN_MEMORY_FILL, 0, 3, 0),

            Operation::TableGet(table) => {
                self.pop_to_scratch(X8);
                self.mov_rr(false, X8, X8);
                self.emit_table_ptr(*table);
                self.ldr(X17, X9, 0x08);
                self.cmp_rr(true, X8, X17);
                let oob = self.trap_target(TRAP_TABLE_OOB);
                self.b_cond(HS, oob);
                self.ldr(X10, X9, 0x00);
                let dst = self.alloc_int();
                self.ins(0xf8607800 | ((X8 as u32) << 16) | ((X10 as u32) << 5) | dst as u32);
                self.locs.push_int(dst);
            }
            Operation::TableSet(table) => {
                let value = self.pop_int();
                self.pop_to_scratch(X8);
                self.mov_rr(false, X8, X8);
                self.emit_table_ptr(*table);
                self.ldr(X17, X9, 0x08);
                self.cmp_rr(true, X8, X17);
                let oob = self.trap_target(TRAP_TABLE_OOB);
                self.b_cond(HS, oob);
                self.ldr(X10, X9, 0x00);
                // str value, [x10, x8, lsl #3]
                self.ins(0xf8207800 | ((X8 as u32) << 16) | ((X10 as u32) << 5) | value as u32);
                self.locs.free_int(value);
            }
            Operation::TableSize(table) => {
                self.emit_table_ptr(*table);
                let dst = self.alloc_int();
                self.ldr(dst, X9, 0x08);
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
                self.ldr(X8, CTX, CTX_FUNCTIONS);
                let dst = self.alloc_int();
                self.add_imm(dst, X8, *index as u64 * HANDLE_SIZE as u64);
                self.locs.push_int(dst);
            }
            Operation::RefIsNull => {
                let v = self.pop_int();
                self.cmp_imm(true, v, 0);
                self.cset(v, EQ);
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
                self.cmp_imm(wide, v, 0);
                self.cset(v, EQ);
                self.locs.push_int(v);
            }
            Operation::Eq(ty) => match ty {
                NumTy::I32 => self.int_cmp(false, EQ),
                NumTy::I64 => self.int_cmp(true, EQ),
                NumTy::F32 => self.flt_cmp(false, EQ),
                NumTy::F64 => self.flt_cmp(true, EQ),
            },
            Operation::Ne(ty) => match ty {
                NumTy::I32 => self.int_cmp(false, NE),
                NumTy::I64 => self.int_cmp(true, NE),
                NumTy::F32 => self.flt_cmp(false, NE),
                NumTy::F64 => self.flt_cmp(true, NE),
            },
            Operation::Lt(ty) => self.emit_ordered_cmp(*ty, LT, LO, MI),
            Operation::Gt(ty) => self.emit_ordered_cmp(*ty, GT, HI, GT),
            Operation::Le(ty) => self.emit_ordered_cmp(*ty, LE, LS, LS),
            Operation::Ge(ty) => self.emit_ordered_cmp(*ty, GE, HS, GE),

            Operation::Add(ty) => match ty {
                NumTy::I32 => self.int_binop(|s, d, a, b| s.add_rr(false, d, a, b)),
                NumTy::I64 => self.int_binop(|s, d, a, b| s.add_rr(true, d, a, b)),
                NumTy::F32 => self.flt_binop(false, 2), // fadd
                NumTy::F64 => self.flt_binop(true, 2),
            },
            Operation::Sub(ty) => match ty {
                NumTy::I32 => self.int_binop(|s, d, a, b| s.sub_rr(false, d, a, b)),
                NumTy::I64 => self.int_binop(|s, d, a, b| s.sub_rr(true, d, a, b)),
                NumTy::F32 => self.flt_binop(false, 3), // fsub
                NumTy::F64 => self.flt_binop(true, 3),
            },
            Operation::Mul(ty) => match ty {
                NumTy::F32 => self.flt_binop(false, 0), // fmul
                NumTy::F64 => self.flt_binop(true, 0),
                int => {
                    let wide = *int == NumTy::I64;
                    let b = self.pop_int();
                    let a = self.pop_int();
                    // madd a, a, b, zr
                    let base = if wide { 0x9b007c00 } else { 0x1b007c00 };
                    self.ins(base | ((b as u32) << 16) | ((a as u32) << 5) | a as u32);
                    self.locs.free_int(b);
                    self.locs.push_int(a);
                }
            },
            Operation::Clz(ty) => {
                let wide = *ty == IntTy::I64;
                let v = self.pop_int();
                let base = if wide { 0xdac01000 } else { 0x5ac01000 };
                self.ins(base | ((v as u32) << 5) | v as u32);
                self.locs.push_int(v);
            }
            Operation::Ctz(ty) => {
                let wide = *ty == IntTy::I64;
                let v = self.pop_int();
                let rbit = if wide { 0xdac00000 } else { 0x5ac00000 };
                self.ins(rbit | ((v as u32) << 5) | v as u32);
                let clz = if wide { 0xdac01000 } else { 0x5ac01000 };
                self.ins(clz | ((v as u32) << 5) | v as u32);
                self.locs.push_int(v);
            }
            Operation::Popcnt(ty) => self.emit_popcnt(*ty == IntTy::I64),
            Operation::Div(ty) => match ty {
                SignedTy::I32 => self.emit_div(false, true),
                SignedTy::U32 => self.emit_div(false, false),
                SignedTy::I64 => self.emit_div(true, true),
                SignedTy::U64 => self.emit_div(true, false),
                SignedTy::F32 => self.flt_binop(false, 1), // fdiv
                SignedTy::F64 => self.flt_binop(true, 1),
            },
            Operation::Rem { ty, signed } => self.emit_rem(*ty == IntTy::I64, *signed),
            Operation::And(ty) => {
                let wide = *ty == IntTy::I64;
                self.int_binop(move |s, d, a, b| s.logic_rr(wide, 0x0a, d, a, b));
            }
            Operation::Or(ty) => {
                let wide = *ty == IntTy::I64;
                self.int_binop(move |s, d, a, b| s.logic_rr(wide, 0x2a, d, a, b));
            }
            Operation::Xor(ty) => {
                let wide = *ty == IntTy::I64;
                self.int_binop(move |s, d, a, b| s.logic_rr(wide, 0x4a, d, a, b));
            }
            Operation::Shl(ty) => {
                let wide = *ty == IntTy::I64;
                self.int_binop(move |s, d, a, b| s.shift_var(wide, 8, d, a, b));
            }
            Operation::Shr { ty, signed } => {
                let wide = *ty == IntTy::I64;
                let op = if *signed { 10 } else { 9 };
                self.int_binop(move |s, d, a, b| s.shift_var(wide, op, d, a, b));
            }
            Operation::Rotr(ty) => {
                let wide = *ty == IntTy::I64;
                self.int_binop(move |s, d, a, b| s.shift_var(wide, 11, d, a, b));
            }
            Operation::Rotl(ty) => {
                // rotl(a, b) is rotr(a, width - b)
                let wide = *ty == IntTy::I64;
                let b = self.pop_int();
                let a = self.pop_int();
                let width = if wide { 64 } else { 32 };
                self.mov_imm(X17, width);
                self.sub_rr(wide, X17, X17, b);
                self.shift_var(wide, 11, a, a, X17);
                self.locs.free_int(b);
                self.locs.push_int(a);
            }

            Operation::Abs(ty) => {
                let wide = *ty == FloatTy::F64;
                self.flt_unop(0x1e20c000, 0x1e60c000, wide);
            }
            Operation::Neg(ty) => {
                let wide = *ty == FloatTy::F64;
                self.flt_unop(0x1e214000, 0x1e614000, wide);
            }
            Operation::Ceil(ty) => {
                let wide = *ty == FloatTy::F64;
                self.flt_unop(0x1e24c000, 0x1e64c000, wide);
            }
            Operation::Floor(ty) => {
                let wide = *ty == FloatTy::F64;
                self.flt_unop(0x1e254000, 0x1e654000, wide);
            }
            Operation::Trunc(ty) => {
                let wide = *ty == FloatTy::F64;
                self.flt_unop(0x1e25c000, 0x1e65c000, wide);
            }
            Operation::Nearest(ty) => {
                let wide = *ty == FloatTy::F64;
                self.flt_unop(0x1e244000, 0x1e644000, wide);
            }
            Operation::Sqrt(ty) => {
                let wide = *ty == FloatTy::F64;
                self.flt_unop(0x1e21c000, 0x1e61c000, wide);
            }
            Operation::Min(ty) => {
                let wide = *ty == FloatTy::F64;
                self.flt_binop(wide, 5); // fmin: wasm NaN and zero semantics
            }
            Operation::Max(ty) => {
                let wide = *ty == FloatTy::F64;
                self.flt_binop(wide, 4); // fmax
            }
            Operation::Copysign(ty) => {
                let wide = *ty == FloatTy::F64;
                let b = self.pop_int();
                let a = self.pop_int();
                let (clear, sign) = if wide {
                    (i64::MAX as u64, 1u64 << 63)
                } else {
                    (i32::MAX as u32 as u64, 1u64 << 31)
                };
                self.mov_imm(X17, clear);
                self.logic_rr(true, 0x0a, a, a, X17);
                self.mov_imm(X17, sign);
                self.logic_rr(true, 0x0a, b, b, X17);
                self.logic_rr(true, 0x2a, a, a, b);
                self.locs.free_int(b);
                self.locs.push_int(a);
            }

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
                let a = self.pop_flt();
                self.fp_unop(0x1e624000, a, a); // fcvt s, d
                self.locs.push_flt(a);
            }
            Operation::F64PromoteF32 => {
                let a = self.pop_flt();
                self.fp_unop(0x1e22c000, a, a); // fcvt d, s
                self.locs.push_flt(a);
            }
            Operation::I64ExtendI32 { signed } => {
                let v = self.pop_int();
                if *signed {
                    // sxtw
                    self.ins(0x93407c00 | ((v as u32) << 5) | v as u32);
                } else {
                    self.mov_rr(false, v, v);
                }
                self.locs.push_int(v);
            }
            Operation::SignExtend { ty, bits } => {
                let v = self.pop_int();
                let word = match (*ty == IntTy::I64, bits) {
                    (false, 8) => 0x13001c00,  // sxtb w
                    (false, _) => 0x13003c00,  // sxth w
                    (true, 8) => 0x93401c00,   // sxtb x
                    (true, 16) => 0x93403c00,  // sxth x
                    (true, _) => 0x93407c00,   // sxtw
                };
                self.ins(word | ((v as u32) << 5) | v as u32);
                self.locs.push_int(v);
            }

            Operation::V128Add => {
                self.spill_all();
                let height = self.locs.height();
                // lane-wise i32x4 addition on the two slot pairs
                for half in 0..2u32 {
                    self.load_slot(X8, height - 4 + half);
                    self.load_slot(X9, height - 2 + half);
                    self.add_rr(false, X10, X8, X9); // low lanes
                    self.lsr_imm(true, X8, X8, 32);
                    self.lsr_imm(true, X9, X9, 32);
                    self.add_rr(false, X8, X8, X9); // high lanes
                    self.orr_shifted(X10, X10, X8, 32);
                    self.store_slot(X10, height - 4 + half);
                }
                let _ = self.locs.pop();
                let _ = self.locs.pop();
            }
        }
    }

    fn emit_ordered_cmp(&mut self, ty: SignedTy, signed_cond: u8, unsigned_cond: u8, float_cond: u8) {
        match ty {
            SignedTy::I32 => self.int_cmp(false, signed_cond),
            SignedTy::U32 => self.int_cmp(false, unsigned_cond),
            SignedTy::I64 => self.int_cmp(true, signed_cond),
            SignedTy::U64 => self.int_cmp(true, unsigned_cond),
            SignedTy::F32 => self.flt_cmp(false, float_cond),
            SignedTy::F64 => self.flt_cmp(true, float_cond),
        }
    }

    fn finish(mut self) -> Result<()> {
        for fix in std::mem::take(&mut self.fixes) {
            let target = self.resolve(fix.target)?;
            let delta = target as i64 - fix.at as i64;
            let word = u32::from_le_bytes(self.code[fix.at..fix.at + 4].try_into().expect("code word"));
            let patched = match fix.kind {
                FixKind::Branch26 => {
                    assert!((-(1 << 27)..(1 << 27)).contains(&delta), "branch out of range");
                    word | (((delta / 4) as u32) & 0x03ff_ffff)
                }
                FixKind::Branch19 => {
                    assert!((-(1 << 20)..(1 << 20)).contains(&delta), "branch out of range");
                    word | ((((delta / 4) as u32) & 0x7ffff) << 5)
                }
                FixKind::Adr => {
                    assert!((-(1 << 20)..(1 << 20)).contains(&delta), "adr target out of range");
                    let imm = delta as u32 & 0x1fffff;
                    word | ((imm & 3) << 29) | ((imm >> 2) << 5)
                }
            };
            self.code[fix.at..fix.at + 4].copy_from_slice(&patched.to_le_bytes());
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
    use zerowasm_parser::{CompileOptions, Parser};
    use zerowasm_types::Features;

    fn lower(wat: &str) -> Module {
        let wasm = wat::parse_str(wat).unwrap();
        Parser::new(Features::wasm_core_2()).parse_module_bytes(wasm, &CompileOptions::default()).unwrap()
    }

    #[test]
    fn emits_word_aligned_code() {
        let module = lower(
            r#"(module (func (param i32 i32) (result i32)
                local.get 0
                local.get 1
                i32.add))"#,
        );
        let (code, offsets) = compile(&module).unwrap();
        assert_eq!(offsets, vec![0]);
        assert_eq!(code.len() % 4, 0);
    }
}
