// Append-only instruction stream with two kinds of deferred fields:
// single-shot patch sites (return addresses computed by the call sequence)
// and label fixups (addresses of code defined later in the stream).

#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]

use crate::isa::{Instruction, Reg, Rel};
use crate::{Error, Result};

/// A chunk emitted with a placeholder offset, waiting for `ChunkStream::patch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchSite(usize);

impl PatchSite {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(usize);

#[derive(Debug, Clone, Default)]
pub struct ChunkStream {
    chunks: Vec<Instruction>,
    labels: Vec<Option<usize>>,
    fixups: Vec<(usize, Label)>,
}

impl ChunkStream {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&mut self, instr: Instruction) -> usize {
        let index = self.chunks.len();
        tracing::trace!(index, %instr, "emit");
        self.chunks.push(instr);
        index
    }

    /// Emit `LEA dst` whose offset is filled in later by `patch`.
    pub fn emit_lea_placeholder(&mut self, dst: Reg) -> PatchSite {
        PatchSite(self.emit(Instruction::LoadEffectiveAddress {
            dst,
            offset: Rel::Placeholder,
        }))
    }

    /// Overwrite the offset of a placeholder. Each site is patched exactly once.
    pub fn patch(&mut self, site: PatchSite, value: i32) -> Result<()> {
        match self.chunks.get_mut(site.0) {
            Some(Instruction::LoadEffectiveAddress { offset, .. }) if *offset == Rel::Placeholder => {
                *offset = Rel::Resolved(value);
                Ok(())
            }
            _ => Err(Error::NotAPlaceholder(site.0)),
        }
    }

    pub fn alloc_label(&mut self) -> Label {
        let id = self.labels.len();
        self.labels.push(None);
        Label(id)
    }

    /// Bind `label` to the next chunk to be emitted.
    pub fn define_label(&mut self, label: Label) -> Result<()> {
        let here = self.chunks.len();
        let slot = self
            .labels
            .get_mut(label.0)
            .ok_or(Error::UndefinedLabel(label.0))?;
        if slot.is_some() {
            return Err(Error::InvalidOp(format!("label {} defined twice", label.0)));
        }
        *slot = Some(here);
        Ok(())
    }

    pub fn emit_lea_to_label(&mut self, dst: Reg, label: Label) {
        let fixup_idx = self.chunks.len();
        self.fixups.push((fixup_idx, label));
        self.emit(Instruction::LoadEffectiveAddress {
            dst,
            offset: Rel::Placeholder,
        });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    #[must_use]
    pub fn instructions(&self) -> &[Instruction] {
        &self.chunks
    }

    /// Resolve label fixups and hand over the chunks. Fails if any
    /// placeholder is still unpatched.
    pub fn finish(mut self) -> Result<Vec<Instruction>> {
        for (instr_idx, label) in std::mem::take(&mut self.fixups) {
            let target = self
                .labels
                .get(label.0)
                .copied()
                .flatten()
                .ok_or(Error::UndefinedLabel(label.0))?;
            self.patch(PatchSite(instr_idx), target as i32 - instr_idx as i32)?;
        }
        if let Some(pending) = self.chunks.iter().position(Instruction::is_placeholder) {
            return Err(Error::UnresolvedPlaceholder(pending));
        }
        Ok(self.chunks)
    }
}
