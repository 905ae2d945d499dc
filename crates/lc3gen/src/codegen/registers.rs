// Register file bookkeeping for the demand-driven allocator.
//
// Each of the eight registers is either free or bound to one memory location:
// a data-segment cell, or a set of symbolic stack slots that currently hold
// equal values. Bound registers carry a dirty flag (memory is behind the
// register) and a weak flag (released by its last user, first in line for
// eviction). Pins are tracked separately so that a free register can be
// reserved too, e.g. the result register across a call sequence.

use std::collections::BTreeSet;

use crate::abi::REG_COUNT;
use crate::isa::Reg;
use crate::{Error, Result};

/// Memory location mirrored by a bound register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    Data(u16),
    Stack(BTreeSet<usize>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterState {
    pub binding: Binding,
    pub dirty: bool,
    pub weak: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterFile {
    state: [Option<RegisterState>; REG_COUNT],
    pins: [u8; REG_COUNT],
}

impl RegisterFile {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, reg: Reg) -> Option<&RegisterState> {
        self.state[reg.index()].as_ref()
    }

    #[must_use]
    pub fn is_bound(&self, reg: Reg) -> bool {
        self.state[reg.index()].is_some()
    }

    #[must_use]
    pub fn is_dirty(&self, reg: Reg) -> bool {
        self.get(reg).is_some_and(|s| s.dirty)
    }

    #[must_use]
    pub fn is_pinned(&self, reg: Reg) -> bool {
        self.pins[reg.index()] > 0
    }

    #[must_use]
    pub fn pinned(&self) -> Vec<Reg> {
        Reg::ALL.into_iter().filter(|r| self.is_pinned(*r)).collect()
    }

    /// Stack slots claimed by `reg`, empty when free or data-bound.
    #[must_use]
    pub fn stack_slots(&self, reg: Reg) -> Vec<usize> {
        match self.get(reg).map(|s| &s.binding) {
            Some(Binding::Stack(slots)) => slots.iter().copied().collect(),
            _ => Vec::new(),
        }
    }

    #[must_use]
    pub fn data_cell(&self, reg: Reg) -> Option<u16> {
        match self.get(reg).map(|s| &s.binding) {
            Some(Binding::Data(cell)) => Some(*cell),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_dirty_stack(&self, reg: Reg) -> bool {
        self.get(reg)
            .is_some_and(|s| s.dirty && matches!(s.binding, Binding::Stack(_)))
    }

    // ── Lookup ──

    /// Register claiming stack slot `index`, pinned or not.
    #[must_use]
    pub fn stack_owner(&self, index: usize) -> Option<Reg> {
        Reg::ALL.into_iter().find(|r| {
            matches!(self.get(*r).map(|s| &s.binding), Some(Binding::Stack(slots)) if slots.contains(&index))
        })
    }

    /// Register mirroring data cell `cell`, pinned or not. Unpinned owners win.
    #[must_use]
    pub fn data_owner(&self, cell: u16) -> Option<Reg> {
        let mut owners = Reg::ALL
            .into_iter()
            .filter(|r| self.data_cell(*r) == Some(cell));
        let first = owners.next()?;
        if !self.is_pinned(first) {
            return Some(first);
        }
        owners.find(|r| !self.is_pinned(*r)).or(Some(first))
    }

    /// An unbound, unpinned register.
    #[must_use]
    pub fn find_free(&self) -> Option<Reg> {
        Reg::ALL
            .into_iter()
            .find(|r| !self.is_bound(*r) && !self.is_pinned(*r))
    }

    #[must_use]
    pub fn find_bound_to_data(&self, cell: u16) -> Option<Reg> {
        Reg::ALL
            .into_iter()
            .find(|r| !self.is_pinned(*r) && self.data_cell(*r) == Some(cell))
            .or_else(|| self.find_free())
    }

    #[must_use]
    pub fn find_bound_to_stack_slot(&self, index: usize) -> Option<Reg> {
        self.stack_owner(index)
            .filter(|r| !self.is_pinned(*r))
            .or_else(|| self.find_free())
    }

    /// A free register, else the cheapest unpinned one to evict.
    ///
    /// Eviction order: weak before strong, clean before dirty, dirty data
    /// cells (one store) before dirty stack slots (needs the frame base).
    #[must_use]
    pub fn find_any(&self) -> Option<Reg> {
        self.find_free().or_else(|| {
            Reg::ALL
                .into_iter()
                .filter(|r| !self.is_pinned(*r))
                .filter_map(|r| self.get(r).map(|s| (r, s)))
                .min_by_key(|(r, s)| {
                    let cost = match (s.dirty, &s.binding) {
                        (false, _) => 0,
                        (true, Binding::Data(_)) => 1,
                        (true, Binding::Stack(_)) => 2,
                    };
                    (cost, !s.weak, r.index())
                })
                .map(|(r, _)| r)
        })
    }

    // ── Binding ──

    pub fn bind_to_data(&mut self, reg: Reg, cell: u16) {
        self.state[reg.index()] = Some(RegisterState {
            binding: Binding::Data(cell),
            dirty: false,
            weak: false,
        });
    }

    pub fn bind_to_stack(&mut self, reg: Reg, slots: impl IntoIterator<Item = usize>) {
        let slots: BTreeSet<usize> = slots.into_iter().collect();
        self.state[reg.index()] = if slots.is_empty() {
            None
        } else {
            Some(RegisterState {
                binding: Binding::Stack(slots),
                dirty: false,
                weak: false,
            })
        };
    }

    /// Replace the slot set of a stack-bound register, keeping its flags.
    /// An empty set frees the register.
    pub fn update_stack_binding(
        &mut self,
        reg: Reg,
        slots: impl IntoIterator<Item = usize>,
    ) -> Result<()> {
        let slots: BTreeSet<usize> = slots.into_iter().collect();
        let entry = &mut self.state[reg.index()];
        match entry {
            Some(RegisterState {
                binding: Binding::Stack(current),
                ..
            }) => {
                if slots.is_empty() {
                    *entry = None;
                } else {
                    *current = slots;
                }
                Ok(())
            }
            _ => Err(Error::MissingBinding(format!("{reg} is not stack-bound"))),
        }
    }

    /// Add `index` to the slot set of `reg`, binding it if free.
    pub fn add_stack_slot(&mut self, reg: Reg, index: usize) {
        match &mut self.state[reg.index()] {
            Some(RegisterState {
                binding: Binding::Stack(slots),
                ..
            }) => {
                slots.insert(index);
            }
            _ => self.bind_to_stack(reg, [index]),
        }
    }

    /// Remove `index` from whichever register claims it. Returns that register.
    pub fn detach_stack_slot(&mut self, index: usize) -> Option<Reg> {
        let owner = self.stack_owner(index)?;
        let remaining: Vec<usize> = self
            .stack_slots(owner)
            .into_iter()
            .filter(|i| *i != index)
            .collect();
        if remaining.is_empty() {
            self.unbind(owner);
        } else if let Some(RegisterState {
            binding: Binding::Stack(slots),
            ..
        }) = &mut self.state[owner.index()]
        {
            *slots = remaining.into_iter().collect();
        }
        Some(owner)
    }

    /// Drop every other register's claim on data cell `cell`.
    pub fn release_data_cell(&mut self, cell: u16, keep: Reg) {
        for reg in Reg::ALL {
            if reg != keep && self.data_cell(reg) == Some(cell) {
                self.unbind(reg);
            }
        }
    }

    pub fn unbind(&mut self, reg: Reg) {
        self.state[reg.index()] = None;
    }

    pub fn mark_dirty(&mut self, reg: Reg) {
        if let Some(state) = &mut self.state[reg.index()] {
            state.dirty = true;
        }
    }

    pub fn mark_clean(&mut self, reg: Reg) {
        if let Some(state) = &mut self.state[reg.index()] {
            state.dirty = false;
        }
    }

    pub fn pin(&mut self, reg: Reg) {
        self.pins[reg.index()] += 1;
        if let Some(state) = &mut self.state[reg.index()] {
            state.weak = false;
        }
    }

    /// Release one pin. The register becomes weak once nothing holds it.
    pub fn unpin(&mut self, reg: Reg) {
        let pins = &mut self.pins[reg.index()];
        *pins = pins.saturating_sub(1);
        if *pins == 0
            && let Some(state) = &mut self.state[reg.index()]
        {
            state.weak = true;
        }
    }

    #[must_use]
    pub fn pinned_count(&self) -> usize {
        self.pins.iter().filter(|p| **p > 0).count()
    }

    /// Unbind every register. Pins survive: they belong to the generator's
    /// in-progress operations, not to the machine state being discarded.
    pub fn clear(&mut self) {
        self.state = Default::default();
    }

    #[must_use]
    pub fn dirty_registers(&self) -> Vec<Reg> {
        Reg::ALL.into_iter().filter(|r| self.is_dirty(*r)).collect()
    }

    /// Every stack slot must be claimed by at most one register and no
    /// stack-bound register may have an empty slot set.
    pub fn check_invariants(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for reg in Reg::ALL {
            if let Some(RegisterState {
                binding: Binding::Stack(slots),
                ..
            }) = self.get(reg)
            {
                if slots.is_empty() {
                    return Err(Error::Internal(format!("{reg} claims an empty slot set")));
                }
                for slot in slots {
                    if !seen.insert(*slot) {
                        return Err(Error::Internal(format!(
                            "stack slot {slot} claimed by more than one register"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_free_skips_bound_and_pinned() {
        let mut regs = RegisterFile::new();
        regs.bind_to_data(Reg::R0, 0);
        regs.pin(Reg::R1);
        assert_eq!(regs.find_free(), Some(Reg::R2));
    }

    #[test]
    fn test_find_bound_prefers_match_over_free() {
        let mut regs = RegisterFile::new();
        regs.bind_to_stack(Reg::R4, [3]);
        regs.bind_to_data(Reg::R5, 7);
        assert_eq!(regs.find_bound_to_stack_slot(3), Some(Reg::R4));
        assert_eq!(regs.find_bound_to_data(7), Some(Reg::R5));
        assert_eq!(regs.find_bound_to_stack_slot(9), Some(Reg::R0));
    }

    #[test]
    fn test_pinned_owner_excluded_from_find() {
        let mut regs = RegisterFile::new();
        regs.bind_to_stack(Reg::R0, [0]);
        regs.pin(Reg::R0);
        assert_eq!(regs.find_bound_to_stack_slot(0), Some(Reg::R1));
        assert_eq!(regs.stack_owner(0), Some(Reg::R0));
    }

    #[test]
    fn test_find_any_prefers_clean_weak_victims() {
        let mut regs = RegisterFile::new();
        for (i, reg) in Reg::ALL.into_iter().enumerate() {
            regs.bind_to_stack(reg, [i]);
            regs.mark_dirty(reg);
        }
        regs.mark_clean(Reg::R6);
        regs.mark_clean(Reg::R3);
        regs.pin(Reg::R6);
        regs.unpin(Reg::R6);
        // Both clean; R6 is weak after its release.
        assert_eq!(regs.find_any(), Some(Reg::R6));
        regs.pin(Reg::R6);
        assert_eq!(regs.find_any(), Some(Reg::R3));
    }

    #[test]
    fn test_find_any_with_everything_pinned() {
        let mut regs = RegisterFile::new();
        for reg in Reg::ALL {
            regs.pin(reg);
        }
        assert_eq!(regs.find_any(), None);
    }

    #[test]
    fn test_detach_unbinds_sole_owner() {
        let mut regs = RegisterFile::new();
        regs.bind_to_stack(Reg::R2, [1, 4]);
        assert_eq!(regs.detach_stack_slot(1), Some(Reg::R2));
        assert_eq!(regs.stack_slots(Reg::R2), vec![4]);
        assert_eq!(regs.detach_stack_slot(4), Some(Reg::R2));
        assert!(!regs.is_bound(Reg::R2));
        assert_eq!(regs.detach_stack_slot(4), None);
    }

    #[test]
    fn test_update_stack_binding_keeps_flags() {
        let mut regs = RegisterFile::new();
        regs.bind_to_stack(Reg::R3, [0]);
        regs.mark_dirty(Reg::R3);
        regs.update_stack_binding(Reg::R3, [5, 6]).unwrap();
        assert!(regs.is_dirty(Reg::R3));
        assert_eq!(regs.stack_slots(Reg::R3), vec![5, 6]);
        regs.bind_to_data(Reg::R4, 1);
        assert!(regs.update_stack_binding(Reg::R4, [1]).is_err());
    }

    #[test]
    fn test_pin_counts_nest() {
        let mut regs = RegisterFile::new();
        regs.pin(Reg::R0);
        regs.pin(Reg::R0);
        regs.unpin(Reg::R0);
        assert!(regs.is_pinned(Reg::R0));
        regs.unpin(Reg::R0);
        assert!(!regs.is_pinned(Reg::R0));
    }

    #[test]
    fn test_clear_keeps_pins() {
        let mut regs = RegisterFile::new();
        regs.bind_to_stack(Reg::R1, [0]);
        regs.pin(Reg::R1);
        regs.clear();
        assert!(!regs.is_bound(Reg::R1));
        assert!(regs.is_pinned(Reg::R1));
    }

    #[test]
    fn test_invariant_detects_overlap() {
        let mut regs = RegisterFile::new();
        regs.bind_to_stack(Reg::R0, [0, 1]);
        regs.bind_to_stack(Reg::R1, [2]);
        assert!(regs.check_invariants().is_ok());
        regs.add_stack_slot(Reg::R1, 1);
        assert!(regs.check_invariants().is_err());
    }
}
