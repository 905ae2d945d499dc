use std::fmt;

use super::{Opcode, Reg};
use crate::abi::{IMM5_BITS, OFFSET6_BITS, PC_OFFSET9_BITS, fits_signed};
use crate::{Error, Result};

/// A PC-relative field that may still be waiting for backpatching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rel {
    /// Written by `ChunkStream::patch` or label fixup resolution.
    Placeholder,
    /// Distance in chunks from the owning instruction to its target.
    Resolved(i32),
}

/// One emitted chunk.
///
/// Data-segment operands name a cell offset rather than an address; the
/// image assembler converts them to PC-relative fields once the code length
/// is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    Add { dst: Reg, src1: Reg, src2: Reg },
    AddImm { dst: Reg, src: Reg, value: i32 },
    And { dst: Reg, src1: Reg, src2: Reg },
    AndImm { dst: Reg, src: Reg, value: i32 },
    Not { dst: Reg, src: Reg },
    /// `dst = data[cell]`
    Load { dst: Reg, cell: u16 },
    /// `data[cell] = src`
    Store { src: Reg, cell: u16 },
    /// `dst = mem[base + offset]`
    LoadInd { dst: Reg, base: Reg, offset: i32 },
    /// `mem[base + offset] = src`
    StoreInd { src: Reg, base: Reg, offset: i32 },
    /// `dst = address of (this chunk + offset)`
    LoadEffectiveAddress { dst: Reg, offset: Rel },
    Jump { base: Reg },
    Trap { vector: u8 },
}

impl Instruction {
    /// Register-to-register move, expressed as an add of zero.
    #[must_use]
    pub const fn move_reg(dst: Reg, src: Reg) -> Self {
        Self::AddImm { dst, src, value: 0 }
    }

    #[must_use]
    pub const fn opcode(&self) -> Opcode {
        match self {
            Self::Add { .. } | Self::AddImm { .. } => Opcode::Add,
            Self::And { .. } | Self::AndImm { .. } => Opcode::And,
            Self::Not { .. } => Opcode::Not,
            Self::Load { .. } => Opcode::Load,
            Self::Store { .. } => Opcode::Store,
            Self::LoadInd { .. } => Opcode::LoadInd,
            Self::StoreInd { .. } => Opcode::StoreInd,
            Self::LoadEffectiveAddress { .. } => Opcode::LoadEffectiveAddress,
            Self::Jump { .. } => Opcode::Jump,
            Self::Trap { .. } => Opcode::Trap,
        }
    }

    /// Returns the destination register written by this instruction, if any.
    #[must_use]
    pub const fn dest_reg(&self) -> Option<Reg> {
        match self {
            Self::Add { dst, .. }
            | Self::AddImm { dst, .. }
            | Self::And { dst, .. }
            | Self::AndImm { dst, .. }
            | Self::Not { dst, .. }
            | Self::Load { dst, .. }
            | Self::LoadInd { dst, .. }
            | Self::LoadEffectiveAddress { dst, .. } => Some(*dst),
            Self::Store { .. } | Self::StoreInd { .. } | Self::Jump { .. } | Self::Trap { .. } => {
                None
            }
        }
    }

    #[must_use]
    pub const fn is_terminating(&self) -> bool {
        self.opcode().is_terminating()
    }

    #[must_use]
    pub const fn is_placeholder(&self) -> bool {
        matches!(
            self,
            Self::LoadEffectiveAddress {
                offset: Rel::Placeholder,
                ..
            }
        )
    }

    /// Encode into a single machine word.
    ///
    /// `at` is this chunk's index and `data_start` the index of data cell 0,
    /// both counted in words from the image origin.
    pub fn encode(&self, at: usize, data_start: usize) -> Result<u16> {
        let op = self.opcode().word_bits();
        let word = match self {
            Self::Add { dst, src1, src2 } | Self::And { dst, src1, src2 } => {
                op | dst.bits() << 9 | src1.bits() << 6 | src2.bits()
            }
            Self::AddImm { dst, src, value } | Self::AndImm { dst, src, value } => {
                let imm = field("imm5", *value, IMM5_BITS, at)?;
                op | dst.bits() << 9 | src.bits() << 6 | 1 << 5 | imm
            }
            Self::Not { dst, src } => op | dst.bits() << 9 | src.bits() << 6 | 0x3F,
            Self::Load { dst: reg, cell } | Self::Store { src: reg, cell } => {
                let target = (data_start + usize::from(*cell)) as i64;
                let rel = i32::try_from(target - (at as i64 + 1))
                    .map_err(|_| Error::Internal(format!("data cell {cell} unreachable")))?;
                op | reg.bits() << 9 | field("pc_offset9", rel, PC_OFFSET9_BITS, at)?
            }
            Self::LoadInd {
                dst: reg,
                base,
                offset,
            }
            | Self::StoreInd {
                src: reg,
                base,
                offset,
            } => op | reg.bits() << 9 | base.bits() << 6 | field("offset6", *offset, OFFSET6_BITS, at)?,
            Self::LoadEffectiveAddress { dst, offset } => match offset {
                Rel::Resolved(rel) => {
                    op | dst.bits() << 9 | field("pc_offset9", rel - 1, PC_OFFSET9_BITS, at)?
                }
                Rel::Placeholder => return Err(Error::UnresolvedPlaceholder(at)),
            },
            Self::Jump { base } => op | base.bits() << 6,
            Self::Trap { vector } => op | u16::from(*vector),
        };
        Ok(word)
    }
}

/// `opcode | high << 9 | PCoffset9`, for words the assembler builds itself.
pub(super) fn pc_relative(opcode: Opcode, high: u16, rel: i32, at: usize) -> Result<u16> {
    Ok(opcode.word_bits() | high << 9 | field("pc_offset9", rel, PC_OFFSET9_BITS, at)?)
}

fn field(name: &'static str, value: i32, bits: u32, chunk: usize) -> Result<u16> {
    if !fits_signed(value, bits) {
        return Err(Error::OutOfRange {
            field: name,
            value,
            bits,
            chunk,
        });
    }
    Ok((value as u16) & ((1u16 << bits) - 1))
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add { dst, src1, src2 } => write!(f, "ADD {dst}, {src1}, {src2}"),
            Self::AddImm { dst, src, value } => write!(f, "ADD {dst}, {src}, #{value}"),
            Self::And { dst, src1, src2 } => write!(f, "AND {dst}, {src1}, {src2}"),
            Self::AndImm { dst, src, value } => write!(f, "AND {dst}, {src}, #{value}"),
            Self::Not { dst, src } => write!(f, "NOT {dst}, {src}"),
            Self::Load { dst, cell } => write!(f, "LD {dst}, data[{cell}]"),
            Self::Store { src, cell } => write!(f, "ST {src}, data[{cell}]"),
            Self::LoadInd { dst, base, offset } => write!(f, "LDR {dst}, {base}, #{offset}"),
            Self::StoreInd { src, base, offset } => write!(f, "STR {src}, {base}, #{offset}"),
            Self::LoadEffectiveAddress { dst, offset } => match offset {
                Rel::Resolved(rel) => write!(f, "LEA {dst}, @{rel:+}"),
                Rel::Placeholder => write!(f, "LEA {dst}, @?"),
            },
            Self::Jump { base } => write!(f, "JMP {base}"),
            Self::Trap { vector } => write!(f, "TRAP x{vector:02X}"),
        }
    }
}
