// Calling convention: call/yield, return, frame entry and frame-base bookkeeping.
//
// Caller stack before `call`: [.., arg, closure, callee]. The return address
// is spliced in below `arg`, so the callee's frame starts at that slot and
// sees [ret, arg, closure] at offsets 0, 1, 2.

#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss
)]

use crate::abi::{ARG_REG, FRAME_BASE_CELL, IMM5_BITS, RESULT_REG, fits_signed};
use crate::isa::{Instruction, Reg};
use crate::{Error, Result};

use super::{CodeGen, PatchSite, RegisterFile, StackModel, Target};

/// Caller state saved while a callee runs.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    stack: StackModel,
    registers: RegisterFile,
    base_delta: i32,
}

impl Frame {
    #[must_use]
    pub fn stack(&self) -> &StackModel {
        &self.stack
    }

    #[must_use]
    pub fn registers(&self) -> &RegisterFile {
        &self.registers
    }

    /// Words the frame base moved when this frame was pushed.
    #[must_use]
    pub const fn base_delta(&self) -> i32 {
        self.base_delta
    }
}

impl CodeGen {
    /// Call the function whose address is on top of the stack.
    ///
    /// Consumes `arg`, `closure` and `callee`; leaves the callee's result.
    pub fn call(&mut self) -> Result<()> {
        let len = self.stack.len();
        if len < 3 {
            return Err(Error::StackUnderflow { needed: 3, len });
        }
        let ret_index = len - 3;

        self.evict(RESULT_REG)?;
        let site = self.chunks.emit_lea_placeholder(RESULT_REG);
        self.registers.pin(RESULT_REG);
        let result = self.emit_call_sequence(ret_index, site);
        self.registers.unpin(RESULT_REG);
        result
    }

    /// Suspension point. Compiled exactly like a call.
    pub fn yield_(&mut self) -> Result<()> {
        self.call()
    }

    fn emit_call_sequence(&mut self, ret_index: usize, site: PatchSite) -> Result<()> {
        self.insert(ret_index, Target::Fixed(RESULT_REG))?;
        self.get(ret_index + 1, Target::Fixed(ARG_REG))?;

        self.registers.pin(ARG_REG);
        let top = self.stack.len() - 1;
        let transfer = self.get(
            top,
            Target::computed(move |cg, callee| {
                cg.flush(None)?;
                cg.push_frame(ret_index)?;
                let jump = cg.emit(Instruction::Jump { base: callee });
                let resume = jump + 1;
                cg.chunks.patch(site, (resume - site.index()) as i32)?;
                tracing::debug!(lea = site.index(), jump, %callee, "call");
                cg.pop_frame()
            }),
        );
        self.registers.unpin(ARG_REG);
        transfer?;

        self.push(Target::Fixed(RESULT_REG))
    }

    /// Return from the current function: slot 0 goes to the result
    /// register and control jumps to the address on top of the stack.
    pub fn ret(&mut self) -> Result<()> {
        self.get(0, Target::Fixed(RESULT_REG))?;
        self.registers.pin(RESULT_REG);
        let result = self.pop(Target::computed(|cg, target| {
            cg.flush(None)?;
            cg.emit(Instruction::Jump { base: target });
            Ok(())
        }));
        self.registers.unpin(RESULT_REG);
        result
    }

    /// Lay out a fresh frame as the caller left it: return address in R0,
    /// argument in R1, both already in memory.
    pub fn entry(&mut self, closure_size: usize) -> Result<()> {
        if !self.stack.is_empty() {
            return Err(Error::InvalidOp(format!(
                "entry with {} live slots",
                self.stack.len()
            )));
        }
        if i16::try_from(closure_size).is_err() {
            return Err(Error::InvalidOp(format!(
                "closure of {closure_size} words does not fit in a frame"
            )));
        }
        let ret = self.stack.push(1);
        let arg = self.stack.push(1);
        self.stack.push(closure_size);

        self.registers.clear();
        self.registers.bind_to_stack(RESULT_REG, [ret]);
        self.registers.bind_to_stack(ARG_REG, [arg]);
        Ok(())
    }

    /// Enter a callee frame starting at caller slot `keep`.
    pub(super) fn push_frame(&mut self, keep: usize) -> Result<()> {
        let base_delta = self
            .stack
            .get(keep)
            .map_or_else(|| self.stack.words(), |slot| slot.offset) as i32;

        let mut saved = self.stack.clone();
        saved.truncate(keep);
        self.frames.push(Frame {
            stack: saved,
            registers: self.registers.clone(),
            base_delta,
        });
        tracing::debug!(depth = self.frames.len(), base_delta, "push frame");

        self.stack = StackModel::new();
        self.registers.clear();
        self.adjust_frame_base(base_delta)?;
        self.flush(None)
    }

    /// Back in the caller after the callee jumped to the return address.
    /// Registers other than the pinned convention registers hold garbage.
    pub(super) fn pop_frame(&mut self) -> Result<()> {
        let frame = self.frames.pop().ok_or(Error::FrameUnderflow)?;
        if let Some(reg) = frame.registers.dirty_registers().first() {
            return Err(Error::Internal(format!(
                "{reg} still dirty when its frame was saved"
            )));
        }
        tracing::debug!(depth = self.frames.len(), "pop frame");

        self.stack = frame.stack;
        self.registers.clear();
        self.adjust_frame_base(-frame.base_delta)
    }

    /// Move the frame-base cell by `delta` words.
    pub fn adjust_frame_base(&mut self, delta: i32) -> Result<()> {
        if delta == 0 {
            return Ok(());
        }
        if fits_signed(delta, IMM5_BITS) {
            return self.data_update(FRAME_BASE_CELL, move |cg: &mut CodeGen, base: Reg| {
                cg.emit(Instruction::AddImm {
                    dst: base,
                    src: base,
                    value: delta,
                });
                Ok(())
            });
        }

        let literal = i16::try_from(delta).map_err(|_| Error::OutOfRange {
            field: "frame delta",
            value: delta,
            bits: 16,
            chunk: self.chunks.len(),
        })?;
        let cell = self.data.literal(literal as u16);
        tracing::debug!(delta, cell, "frame delta through literal pool");
        self.data_get(
            cell,
            Target::computed(move |cg, amount| {
                cg.data_update(FRAME_BASE_CELL, move |cg: &mut CodeGen, base: Reg| {
                    cg.emit(Instruction::Add {
                        dst: base,
                        src1: base,
                        src2: amount,
                    });
                    Ok(())
                })
            }),
        )
    }
}
