//! Calling convention and memory layout constants.
//!
//! Shared by the code generator, the image assembler and the test harness so
//! that all three agree on register roles and reserved cells.

use crate::isa::Reg;

// ── Register Assignments ──

/// Result register (R0).
/// Carries the return address into a callee and the result back out of it.
pub const RESULT_REG: Reg = Reg::R0;

/// Argument register (R1).
/// Carries the single call argument into the callee.
pub const ARG_REG: Reg = Reg::R1;

/// Number of general purpose registers.
pub const REG_COUNT: usize = 8;

// ── Data Segment ──

/// Data cell holding the current frame base address.
pub const FRAME_BASE_CELL: u16 = 0;

/// Data cell used to park a register while it temporarily holds the frame
/// base during a write-back.
pub const SPILL_SCRATCH_CELL: u16 = 1;

/// Default load address of an assembled image.
pub const DEFAULT_ORIGIN: u16 = 0x3000;

/// Default initial frame base (start of the runtime stack area).
pub const DEFAULT_FRAME_BASE: u16 = 0x4000;

// ── Immediate Widths ──

/// Width of the sign-extended immediate of `ADD`/`AND`.
pub const IMM5_BITS: u32 = 5;

/// Width of the base-relative offset of `LDR`/`STR`.
pub const OFFSET6_BITS: u32 = 6;

/// Width of the PC-relative offset of `LD`/`ST`/`LEA`.
pub const PC_OFFSET9_BITS: u32 = 9;

/// Trap vector that stops the machine.
pub const TRAP_HALT: u8 = 0x25;

/// Returns true if `value` is representable as a `bits`-wide two's complement field.
#[must_use]
pub const fn fits_signed(value: i32, bits: u32) -> bool {
    let min = -(1i32 << (bits - 1));
    let max = (1i32 << (bits - 1)) - 1;
    value >= min && value <= max
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_imm5_boundaries() {
        assert!(fits_signed(15, IMM5_BITS));
        assert!(fits_signed(-16, IMM5_BITS));
        assert!(!fits_signed(16, IMM5_BITS));
        assert!(!fits_signed(-17, IMM5_BITS));
    }

    #[test]
    fn test_pc_offset9_boundaries() {
        assert!(fits_signed(255, PC_OFFSET9_BITS));
        assert!(!fits_signed(256, PC_OFFSET9_BITS));
        assert!(fits_signed(-256, PC_OFFSET9_BITS));
    }
}
