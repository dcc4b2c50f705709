//! Value-location tracking shared by the per-architecture emitters.
//!
//! Every operand on the abstract stack has a location: a general-purpose
//! or floating-point register, its home slot on the value stack (addressed
//! base-pointer-relative), or an immediate constant. The stack of
//! locations mirrors the operand stack one slot per entry; v128 values
//! occupy two entries.

/// Where one value-stack slot currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Loc {
    /// In its home slot on the value stack.
    Stack,
    /// In a general-purpose register (backend encoding).
    IntReg(u8),
    /// In a floating-point register (backend encoding).
    FltReg(u8),
    /// A constant not yet materialized.
    Const(u64),
}

/// What the allocator decided for a register request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Take {
    /// The register is free.
    Free(u8),
    /// The register must be stolen from the slot at `index`; the backend
    /// stores that slot to its home first, then calls [`LocationStack::mark_spilled`].
    Steal { index: usize, reg: u8 },
}

#[derive(Debug)]
pub(crate) struct LocationStack {
    locs: Vec<Loc>,
    int_pool: Vec<u8>,
    flt_pool: Vec<u8>,
    int_free: Vec<u8>,
    flt_free: Vec<u8>,
}

impl LocationStack {
    /// `base_slots` covers parameters and locals, which always live in
    /// their home slots.
    pub(crate) fn new(base_slots: u32, int_pool: &[u8], flt_pool: &[u8]) -> Self {
        Self {
            locs: vec![Loc::Stack; base_slots as usize],
            int_pool: int_pool.to_vec(),
            flt_pool: flt_pool.to_vec(),
            int_free: int_pool.to_vec(),
            flt_free: flt_pool.to_vec(),
        }
    }

    pub(crate) fn height(&self) -> u32 {
        self.locs.len() as u32
    }

    pub(crate) fn get(&self, index: usize) -> Loc {
        self.locs[index]
    }

    pub(crate) fn push_stack(&mut self) {
        self.locs.push(Loc::Stack);
    }

    pub(crate) fn push_const(&mut self, value: u64) {
        self.locs.push(Loc::Const(value));
    }

    pub(crate) fn push_int(&mut self, reg: u8) {
        self.int_free.retain(|r| *r != reg);
        self.locs.push(Loc::IntReg(reg));
    }

    pub(crate) fn push_flt(&mut self, reg: u8) {
        self.flt_free.retain(|r| *r != reg);
        self.locs.push(Loc::FltReg(reg));
    }

    /// Pops the top location, releasing any register it held.
    pub(crate) fn pop(&mut self) -> Loc {
        let loc = self.locs.pop().expect("location stack underflow");
        self.release(loc);
        loc
    }

    /// Pops the top location keeping its register reserved; the backend
    /// releases or reuses it explicitly.
    pub(crate) fn pop_keep(&mut self) -> Loc {
        self.locs.pop().expect("location stack underflow")
    }

    pub(crate) fn free_int(&mut self, reg: u8) {
        self.int_free.push(reg);
    }

    pub(crate) fn free_flt(&mut self, reg: u8) {
        self.flt_free.push(reg);
    }

    pub(crate) fn release(&mut self, loc: Loc) {
        match loc {
            Loc::IntReg(reg) => self.int_free.push(reg),
            Loc::FltReg(reg) => self.flt_free.push(reg),
            Loc::Stack | Loc::Const(_) => {}
        }
    }

    /// Requests a general-purpose register. When none is free the victim
    /// is the lowest (least recently pushed) slot holding one.
    pub(crate) fn take_int(&mut self) -> Take {
        if let Some(reg) = self.int_free.pop() {
            return Take::Free(reg);
        }
        let index = self
            .locs
            .iter()
            .position(|loc| matches!(loc, Loc::IntReg(_)))
            .expect("an integer register is always live when none are free");
        let Loc::IntReg(reg) = self.locs[index] else { unreachable!() };
        Take::Steal { index, reg }
    }

    pub(crate) fn take_flt(&mut self) -> Take {
        if let Some(reg) = self.flt_free.pop() {
            return Take::Free(reg);
        }
        let index = self
            .locs
            .iter()
            .position(|loc| matches!(loc, Loc::FltReg(_)))
            .expect("a float register is always live when none are free");
        let Loc::FltReg(reg) = self.locs[index] else { unreachable!() };
        Take::Steal { index, reg }
    }

    /// After the backend stored the stolen slot to its home.
    pub(crate) fn mark_spilled(&mut self, index: usize) {
        self.locs[index] = Loc::Stack;
    }

    /// The slot's old value is dead (it is about to be overwritten at its
    /// home); any register it held is released.
    pub(crate) fn invalidate(&mut self, index: usize) {
        let loc = self.locs[index];
        self.release(loc);
        self.locs[index] = Loc::Stack;
    }

    /// Slots (index, loc) that are not at home, bottom first, for the
    /// spill-everything boundaries (branches, calls, exits).
    pub(crate) fn pending_spills(&self) -> Vec<(usize, Loc)> {
        self.locs
            .iter()
            .enumerate()
            .filter(|(_, loc)| !matches!(loc, Loc::Stack))
            .map(|(i, loc)| (i, *loc))
            .collect()
    }

    /// Marks every slot as home and frees all registers; the backend has
    /// emitted the stores.
    pub(crate) fn spill_done(&mut self) {
        for loc in &mut self.locs {
            *loc = Loc::Stack;
        }
        self.int_free = self.int_pool.clone();
        self.flt_free = self.flt_pool.clone();
    }

    /// Resets the stack shape at a control join: everything is at home and
    /// the height matches what the label expects.
    pub(crate) fn reset_to_height(&mut self, height: u32) {
        self.locs.clear();
        self.locs.resize(height as usize, Loc::Stack);
        self.int_free = self.int_pool.clone();
        self.flt_free = self.flt_pool.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steals_the_oldest_register_when_exhausted() {
        let mut locs = LocationStack::new(0, &[1, 2], &[]);
        let Take::Free(a) = locs.take_int() else { panic!() };
        locs.push_int(a);
        let Take::Free(b) = locs.take_int() else { panic!() };
        locs.push_int(b);
        match locs.take_int() {
            Take::Steal { index: 0, reg } => assert_eq!(reg, a),
            other => panic!("expected steal of the oldest slot, got {other:?}"),
        }
    }

    #[test]
    fn spill_done_returns_registers_to_the_pool() {
        let mut locs = LocationStack::new(2, &[7], &[3]);
        let Take::Free(r) = locs.take_int() else { panic!() };
        locs.push_int(r);
        assert_eq!(locs.pending_spills(), vec![(2, Loc::IntReg(7))]);
        locs.spill_done();
        assert!(locs.pending_spills().is_empty());
        assert!(matches!(locs.take_int(), Take::Free(7)));
    }
}
