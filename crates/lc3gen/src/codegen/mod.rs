// Code generator: maps the unbounded symbolic stack onto eight registers.
//
// Every operation takes a `Target`: either a register fixed by the caller
// (calling-convention wiring) or a continuation that receives whichever
// register the allocator picked. Continuations run with their register
// pinned, so nested operations cannot evict it.
//
// Registers are write-back caches of memory. A dirty register is flushed
// (spilled) before it is repurposed and before any control transfer.

#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss
)]

mod alu;
mod calls;
mod chunks;
mod data;
mod registers;
mod stack;

use std::fmt::{self, Write as _};

pub use alu::{BinaryOp, UnaryOp};
pub use calls::Frame;
pub use chunks::{ChunkStream, Label, PatchSite};
pub use data::DataSegment;
pub use registers::{Binding, RegisterFile, RegisterState};
pub use stack::{Slot, StackModel};

use crate::abi::{
    DEFAULT_FRAME_BASE, FRAME_BASE_CELL, IMM5_BITS, OFFSET6_BITS, SPILL_SCRATCH_CELL, TRAP_HALT,
    fits_signed,
};
use crate::isa::{Image, Instruction, Reg};
use crate::{Error, Result};

/// Code run against the register an operation picked.
pub type Continuation<'a> = Box<dyn FnOnce(&mut CodeGen, Reg) -> Result<()> + 'a>;

/// Where an operation delivers (or takes) its value.
pub enum Target<'a> {
    Fixed(Reg),
    Computed(Continuation<'a>),
}

impl<'a> Target<'a> {
    pub fn computed(f: impl FnOnce(&mut CodeGen, Reg) -> Result<()> + 'a) -> Self {
        Self::Computed(Box::new(f))
    }
}

impl fmt::Debug for Target<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(reg) => write!(f, "Fixed({reg})"),
            Self::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

/// Generator context for one compilation: register file, stack model,
/// frame stack, chunk stream and data segment, all owned here.
#[derive(Debug, Clone)]
pub struct CodeGen {
    registers: RegisterFile,
    stack: StackModel,
    frames: Vec<Frame>,
    chunks: ChunkStream,
    data: DataSegment,
}

impl Default for CodeGen {
    fn default() -> Self {
        Self::new(DEFAULT_FRAME_BASE)
    }
}

impl CodeGen {
    #[must_use]
    pub fn new(frame_base: u16) -> Self {
        Self {
            registers: RegisterFile::new(),
            stack: StackModel::new(),
            frames: Vec::new(),
            chunks: ChunkStream::new(),
            data: DataSegment::new(frame_base),
        }
    }

    #[must_use]
    pub fn registers(&self) -> &RegisterFile {
        &self.registers
    }

    #[must_use]
    pub fn stack(&self) -> &StackModel {
        &self.stack
    }

    #[must_use]
    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn instructions(&self) -> &[Instruction] {
        self.chunks.instructions()
    }

    #[must_use]
    pub fn data(&self) -> &DataSegment {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut DataSegment {
        &mut self.data
    }

    pub fn emit(&mut self, instr: Instruction) -> usize {
        self.chunks.emit(instr)
    }

    fn with_pinned(&mut self, reg: Reg, f: Continuation<'_>) -> Result<()> {
        self.registers.pin(reg);
        let result = f(self, reg);
        self.registers.unpin(reg);
        result
    }

    // ── Allocation and spilling ──

    /// A register ready to be rebound: free, or evicted after write-back.
    fn acquire(&mut self) -> Result<Reg> {
        let reg = self
            .registers
            .find_any()
            .ok_or_else(|| Error::NoRegisterAvailable {
                pinned: self.registers.pinned(),
            })?;
        if self.registers.is_bound(reg) {
            tracing::debug!(%reg, "evicting register");
            self.evict(reg)?;
        }
        Ok(reg)
    }

    /// Write `reg` back if dirty, then forget what it holds.
    pub fn evict(&mut self, reg: Reg) -> Result<()> {
        self.write_back(reg)?;
        self.registers.unbind(reg);
        Ok(())
    }

    /// Spill dirty registers to memory: just `target`, or all of them.
    pub fn flush(&mut self, target: Option<Reg>) -> Result<()> {
        if let Some(reg) = target {
            return self.write_back(reg);
        }
        while let Some(&reg) = self.registers.dirty_registers().first() {
            self.write_back(reg)?;
        }
        Ok(())
    }

    fn write_back(&mut self, reg: Reg) -> Result<()> {
        let Some(state) = self.registers.get(reg) else {
            return Ok(());
        };
        if !state.dirty {
            return Ok(());
        }
        let binding = state.binding.clone();
        self.registers.mark_clean(reg);

        match binding {
            Binding::Data(cell) => {
                self.emit(Instruction::Store { src: reg, cell });
                Ok(())
            }
            Binding::Stack(slots) => {
                // One store per slot: each is a distinct memory cell.
                let offsets = slots
                    .iter()
                    .map(|&index| self.stack.slot(index).and_then(|s| self.frame_offset(s)))
                    .collect::<Result<Vec<_>>>()?;
                tracing::debug!(%reg, ?slots, "spilling register");
                self.registers.pin(reg);
                let result = self.store_to_frame(reg, offsets);
                self.registers.unpin(reg);
                result
            }
        }
    }

    fn store_to_frame(&mut self, src: Reg, offsets: Vec<i32>) -> Result<()> {
        let emit_stores = move |cg: &mut CodeGen, base: Reg| -> Result<()> {
            for offset in offsets {
                if fits_signed(offset, OFFSET6_BITS) {
                    cg.emit(Instruction::StoreInd { src, base, offset });
                } else {
                    cg.store_far(src, base, offset);
                }
            }
            Ok(())
        };

        if let Some(base) = self.registers.data_owner(FRAME_BASE_CELL) {
            return emit_stores(self, base);
        }
        match self.registers.find_any() {
            Some(borrowed) if self.registers.is_dirty_stack(borrowed) => {
                // Every candidate would need the frame base for its own
                // write-back. Park one in the scratch cell and borrow it.
                tracing::debug!(%borrowed, "borrowing register for frame base");
                self.emit(Instruction::Store {
                    src: borrowed,
                    cell: SPILL_SCRATCH_CELL,
                });
                self.emit(Instruction::Load {
                    dst: borrowed,
                    cell: FRAME_BASE_CELL,
                });
                emit_stores(self, borrowed)?;
                self.emit(Instruction::Load {
                    dst: borrowed,
                    cell: SPILL_SCRATCH_CELL,
                });
                Ok(())
            }
            Some(_) => self.data_get(FRAME_BASE_CELL, Target::computed(emit_stores)),
            None => Err(Error::NoRegisterAvailable {
                pinned: self.registers.pinned(),
            }),
        }
    }

    /// `mem[base + offset] = src` for an offset beyond `STR`'s reach.
    /// `src` is parked while it carries the offset and both registers hold
    /// their values again afterwards.
    fn store_far(&mut self, src: Reg, base: Reg, offset: i32) {
        let park = self.data.far_scratch();
        let forward = self.data.literal(offset as u16);
        let back = self.data.literal(offset.wrapping_neg() as u16);
        tracing::debug!(%src, offset, "store through far frame offset");

        self.emit(Instruction::Store { src, cell: park });
        self.emit(Instruction::Load {
            dst: src,
            cell: forward,
        });
        self.emit(Instruction::Add {
            dst: base,
            src1: base,
            src2: src,
        });
        self.emit(Instruction::Load { dst: src, cell: park });
        self.emit(Instruction::StoreInd {
            src,
            base,
            offset: 0,
        });
        self.emit(Instruction::Load {
            dst: src,
            cell: back,
        });
        self.emit(Instruction::Add {
            dst: base,
            src1: base,
            src2: src,
        });
        self.emit(Instruction::Load { dst: src, cell: park });
    }

    // ── Stack slot protocol ──

    /// Word offset of `slot` from the frame base, as an instruction operand.
    fn frame_offset(&self, slot: Slot) -> Result<i32> {
        i16::try_from(slot.offset)
            .map(i32::from)
            .map_err(|_| Error::OutOfRange {
                field: "frame offset",
                value: i32::try_from(slot.offset).unwrap_or(i32::MAX),
                bits: 16,
                chunk: self.chunks.len(),
            })
    }

    fn load_slot(&mut self, reg: Reg, index: usize, slot: Slot) -> Result<()> {
        let offset = self.frame_offset(slot)?;
        self.registers.pin(reg);
        let result = self.data_get(
            FRAME_BASE_CELL,
            Target::computed(move |cg, base| {
                if fits_signed(offset, OFFSET6_BITS) {
                    cg.emit(Instruction::LoadInd {
                        dst: reg,
                        base,
                        offset,
                    });
                } else {
                    // address built in the destination itself
                    let cell = cg.data.literal(offset as u16);
                    cg.emit(Instruction::Load { dst: reg, cell });
                    cg.emit(Instruction::Add {
                        dst: reg,
                        src1: reg,
                        src2: base,
                    });
                    cg.emit(Instruction::LoadInd {
                        dst: reg,
                        base: reg,
                        offset: 0,
                    });
                }
                Ok(())
            }),
        );
        self.registers.unpin(reg);
        result?;
        self.registers.bind_to_stack(reg, [index]);
        Ok(())
    }

    fn fetch_slot_any(&mut self, index: usize, slot: Slot) -> Result<Reg> {
        if let Some(owner) = self.registers.stack_owner(index) {
            return Ok(owner);
        }
        let reg = self.acquire()?;
        self.load_slot(reg, index, slot)?;
        Ok(reg)
    }

    fn fetch_slot_into(&mut self, index: usize, slot: Slot, reg: Reg) -> Result<()> {
        if self.registers.stack_owner(index) == Some(reg) {
            return Ok(());
        }
        self.write_back(reg)?;

        if let Some(prev) = self.registers.stack_owner(index) {
            // Already resident elsewhere: move it, carrying the dirty state over.
            let dirty = self.registers.is_dirty(prev);
            self.registers.detach_stack_slot(index);
            self.emit(Instruction::move_reg(reg, prev));
            self.registers.bind_to_stack(reg, [index]);
            if dirty {
                self.registers.mark_dirty(reg);
            }
            Ok(())
        } else {
            self.registers.unbind(reg);
            self.load_slot(reg, index, slot)
        }
    }

    /// Make some register mirror stack slot `index`.
    pub fn get(&mut self, index: usize, target: Target<'_>) -> Result<()> {
        let slot = self.stack.slot(index)?;
        match target {
            Target::Fixed(reg) => self.fetch_slot_into(index, slot, reg),
            Target::Computed(f) => {
                let reg = self.fetch_slot_any(index, slot)?;
                self.with_pinned(reg, f)
            }
        }
    }

    /// Record that a register now holds the authoritative value of `index`.
    /// Never loads: the previous value of the slot is dead.
    pub fn set(&mut self, index: usize, target: Target<'_>) -> Result<()> {
        self.stack.slot(index)?;
        match target {
            Target::Fixed(reg) => {
                if self.registers.data_cell(reg).is_some() {
                    self.evict(reg)?;
                }
                if self
                    .registers
                    .stack_owner(index)
                    .is_some_and(|owner| owner != reg)
                {
                    self.registers.detach_stack_slot(index);
                }
                self.registers.add_stack_slot(reg, index);
                self.registers.mark_dirty(reg);
                Ok(())
            }
            Target::Computed(f) => {
                let reg = match self.registers.stack_owner(index) {
                    Some(owner)
                        if !self.registers.is_pinned(owner)
                            && self.registers.stack_slots(owner) == [index] =>
                    {
                        owner
                    }
                    _ => {
                        self.registers.detach_stack_slot(index);
                        self.acquire()?
                    }
                };
                self.registers.bind_to_stack(reg, [index]);
                self.registers.mark_dirty(reg);
                self.with_pinned(reg, f)
            }
        }
    }

    pub fn push(&mut self, target: Target<'_>) -> Result<()> {
        let index = self.stack.push(1);
        self.set(index, target)
    }

    /// Remove the top slot, delivering its value to `target`.
    pub fn pop(&mut self, target: Target<'_>) -> Result<()> {
        let len = self.stack.len();
        let index = len
            .checked_sub(1)
            .ok_or(Error::StackUnderflow { needed: 1, len })?;
        let slot = self.stack.slot(index)?;
        match target {
            Target::Fixed(reg) => {
                self.fetch_slot_into(index, slot, reg)?;
                self.registers.detach_stack_slot(index);
                self.stack.pop()?;
                Ok(())
            }
            Target::Computed(f) => {
                let reg = self.fetch_slot_any(index, slot)?;
                self.registers.detach_stack_slot(index);
                self.stack.pop()?;
                self.with_pinned(reg, f)
            }
        }
    }

    /// Pop and discard the top slot without touching memory.
    pub fn discard(&mut self) -> Result<()> {
        let len = self.stack.len();
        let index = len
            .checked_sub(1)
            .ok_or(Error::StackUnderflow { needed: 1, len })?;
        self.registers.detach_stack_slot(index);
        self.stack.pop()?;
        Ok(())
    }

    /// Push a value and bubble it down to position `index`.
    pub fn insert(&mut self, index: usize, target: Target<'_>) -> Result<()> {
        let len = self.stack.len();
        if index > len {
            return Err(Error::SlotOutOfRange { index, len });
        }
        self.push(target)?;
        for i in (index + 1..=len).rev() {
            self.swap(i, i - 1)?;
        }
        Ok(())
    }

    /// Exchange two slots by relabelling the registers that hold them.
    /// Both end up dirty: memory has not been exchanged yet.
    pub fn swap(&mut self, a: usize, b: usize) -> Result<()> {
        if a == b {
            self.stack.slot(a)?;
            return Ok(());
        }
        self.get(
            a,
            Target::computed(move |cg, ra| {
                cg.get(
                    b,
                    Target::computed(move |cg, rb| cg.exchange_slots(ra, a, rb, b)),
                )
            }),
        )
    }

    fn exchange_slots(&mut self, ra: Reg, a: usize, rb: Reg, b: usize) -> Result<()> {
        if ra == rb {
            return Ok(());
        }
        let relabel = |slots: Vec<usize>, from: usize, to: usize| {
            slots
                .into_iter()
                .map(move |s| if s == from { to } else { s })
        };
        let slots_a = relabel(self.registers.stack_slots(ra), a, b);
        self.registers.update_stack_binding(ra, slots_a)?;
        let slots_b = relabel(self.registers.stack_slots(rb), b, a);
        self.registers.update_stack_binding(rb, slots_b)?;
        self.registers.mark_dirty(ra);
        self.registers.mark_dirty(rb);
        Ok(())
    }

    /// Duplicate slot `index` onto the top of the stack.
    pub fn copy(&mut self, index: usize) -> Result<()> {
        self.get(
            index,
            Target::computed(|cg, src| {
                cg.push(Target::computed(move |cg, dst| {
                    cg.emit(Instruction::move_reg(dst, src));
                    Ok(())
                }))
            }),
        )
    }

    /// Pop the top value into slot `index`.
    pub fn replace(&mut self, index: usize) -> Result<()> {
        let len = self.stack.len();
        if index >= len.saturating_sub(1) {
            return Err(Error::SlotOutOfRange { index, len });
        }
        self.set(
            index,
            Target::computed(|cg, dst| {
                cg.pop(Target::computed(move |cg, src| {
                    cg.emit(Instruction::move_reg(dst, src));
                    Ok(())
                }))
            }),
        )
    }

    /// Write back and unbind every register claiming a slot at or above
    /// `index`, so the stack model can be reshaped underneath.
    fn release_slots_from(&mut self, index: usize) -> Result<()> {
        for reg in Reg::ALL {
            if !self.registers.stack_slots(reg).iter().any(|s| *s >= index) {
                continue;
            }
            self.write_back(reg)?;
            let slots = self.registers.stack_slots(reg);
            if !slots.is_empty() {
                let keep: Vec<usize> = slots.into_iter().filter(|s| *s < index).collect();
                self.registers.update_stack_binding(reg, keep)?;
            }
        }
        Ok(())
    }

    /// Merge `count` slots from `index` into one composite value.
    pub fn join(&mut self, index: usize, count: usize) -> Result<()> {
        self.release_slots_from(index)?;
        self.stack.join(index, count)
    }

    /// Split slot `index` after its first `split_size` words.
    pub fn split(&mut self, index: usize, split_size: usize) -> Result<()> {
        self.release_slots_from(index)?;
        self.stack.split(index, split_size)
    }

    // ── Data segment protocol ──

    fn fetch_data_cell(&mut self, cell: u16) -> Result<Reg> {
        // A pinned owner may be ahead of memory.
        if let Some(owner) = self.registers.data_owner(cell) {
            self.write_back(owner)?;
        }
        let reg = self.acquire()?;
        self.emit(Instruction::Load { dst: reg, cell });
        self.registers.bind_to_data(reg, cell);
        Ok(reg)
    }

    /// Make some register mirror data cell `cell`.
    pub fn data_get(&mut self, cell: u16, target: Target<'_>) -> Result<()> {
        match target {
            Target::Fixed(reg) => {
                if self.registers.data_cell(reg) == Some(cell) {
                    return Ok(());
                }
                self.evict(reg)?;
                if let Some(owner) = self.registers.data_owner(cell) {
                    self.write_back(owner)?;
                    self.emit(Instruction::move_reg(reg, owner));
                } else {
                    self.emit(Instruction::Load { dst: reg, cell });
                }
                self.registers.bind_to_data(reg, cell);
                Ok(())
            }
            Target::Computed(f) => {
                let reg = match self.registers.find_bound_to_data(cell) {
                    Some(reg) if self.registers.data_cell(reg) == Some(cell) => reg,
                    _ => self.fetch_data_cell(cell)?,
                };
                self.with_pinned(reg, f)
            }
        }
    }

    /// Record that a register now holds the new value of data cell `cell`.
    pub fn data_set(&mut self, cell: u16, target: Target<'_>) -> Result<()> {
        match target {
            Target::Fixed(reg) => {
                if self.registers.data_cell(reg) != Some(cell) {
                    self.evict(reg)?;
                }
                self.registers.release_data_cell(cell, reg);
                self.registers.bind_to_data(reg, cell);
                self.registers.mark_dirty(reg);
                Ok(())
            }
            Target::Computed(f) => {
                let reg = match self.registers.find_bound_to_data(cell) {
                    Some(reg) if self.registers.data_cell(reg) == Some(cell) => reg,
                    _ => self.acquire()?,
                };
                self.registers.release_data_cell(cell, reg);
                self.registers.bind_to_data(reg, cell);
                self.registers.mark_dirty(reg);
                self.with_pinned(reg, f)
            }
        }
    }

    /// Read-modify-write of a data cell through one register.
    pub fn data_update<'a, F>(&mut self, cell: u16, f: F) -> Result<()>
    where
        F: FnOnce(&mut CodeGen, Reg) -> Result<()> + 'a,
    {
        self.data_get(
            cell,
            Target::computed(move |cg, reg| {
                f(cg, reg)?;
                cg.registers.release_data_cell(cell, reg);
                cg.registers.mark_dirty(reg);
                Ok(())
            }),
        )
    }

    // ── Values ──

    /// Push a constant: small values are built in place, others come from
    /// the literal pool.
    pub fn push_const(&mut self, value: i16) -> Result<()> {
        let imm = i32::from(value);
        if fits_signed(imm, IMM5_BITS) {
            return self.push(Target::computed(move |cg, reg| {
                cg.emit(Instruction::AndImm {
                    dst: reg,
                    src: reg,
                    value: 0,
                });
                if imm != 0 {
                    cg.emit(Instruction::AddImm {
                        dst: reg,
                        src: reg,
                        value: imm,
                    });
                }
                Ok(())
            }));
        }
        let cell = self.data.literal(value as u16);
        self.push(Target::computed(move |cg, reg| {
            cg.emit(Instruction::Load { dst: reg, cell });
            Ok(())
        }))
    }

    /// Push the value of data cell `cell`.
    pub fn load_data(&mut self, cell: u16) -> Result<()> {
        self.data_get(
            cell,
            Target::computed(|cg, src| {
                cg.push(Target::computed(move |cg, dst| {
                    cg.emit(Instruction::move_reg(dst, src));
                    Ok(())
                }))
            }),
        )
    }

    /// Pop the top value into data cell `cell`.
    pub fn store_data(&mut self, cell: u16) -> Result<()> {
        self.pop(Target::computed(move |cg, src| {
            cg.data_set(cell, Target::Fixed(src))
        }))
    }

    // ── Labels and units ──

    pub fn alloc_label(&mut self) -> Label {
        self.chunks.alloc_label()
    }

    /// Define a jump target. Register contents are unknown on arrival, so
    /// everything is written back and forgotten first.
    pub fn define_label(&mut self, label: Label) -> Result<()> {
        self.flush(None)?;
        self.registers.clear();
        self.chunks.define_label(label)
    }

    /// Push the address of the code at `label`.
    pub fn push_label_address(&mut self, label: Label) -> Result<()> {
        self.push(Target::computed(move |cg, reg| {
            cg.chunks.emit_lea_to_label(reg, label);
            Ok(())
        }))
    }

    /// Start a new function body at `label` with an empty frame.
    pub fn begin_function(&mut self, label: Label) -> Result<()> {
        if !self.frames.is_empty() {
            return Err(Error::InvalidOp(
                "function started inside an open call frame".to_string(),
            ));
        }
        self.stack = StackModel::new();
        self.registers.clear();
        self.chunks.define_label(label)
    }

    pub fn halt(&mut self) -> Result<()> {
        self.flush(None)?;
        self.emit(Instruction::Trap { vector: TRAP_HALT });
        Ok(())
    }

    /// Resolve fixups and hand over the finished program.
    pub fn finish(self) -> Result<Program> {
        if !self.frames.is_empty() {
            return Err(Error::Internal(format!(
                "{} call frames still open",
                self.frames.len()
            )));
        }
        Ok(Program {
            chunks: self.chunks.finish()?,
            data: self.data.words().to_vec(),
        })
    }
}

/// Resolved chunks plus the data segment they address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    chunks: Vec<Instruction>,
    data: Vec<u16>,
}

impl Program {
    #[must_use]
    pub fn instructions(&self) -> &[Instruction] {
        &self.chunks
    }

    #[must_use]
    pub fn data(&self) -> &[u16] {
        &self.data
    }

    pub fn assemble(&self, origin: u16) -> Result<Image> {
        Image::assemble(&self.chunks, &self.data, origin)
    }

    /// Human-readable listing of code and data.
    #[must_use]
    pub fn listing(&self) -> String {
        let mut out = String::new();
        for (index, instr) in self.chunks.iter().enumerate() {
            let _ = writeln!(out, "{index:5}  {instr}");
        }
        for (cell, word) in self.data.iter().enumerate() {
            let _ = writeln!(out, "data[{cell}]  {word:#06x}");
        }
        out
    }
}
