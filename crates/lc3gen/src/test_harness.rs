//! Test harness for lc3gen unit and integration tests.
//!
//! Two halves: instruction pattern matching over emitted chunks, and a small
//! reference machine that executes an assembled [`Image`] so tests can check
//! what the code actually computes.
//!
//! # Example
//!
//! ```rust
//! use lc3gen::test_harness::*;
//! use lc3gen::{Op, Reg};
//!
//! let ops = [
//!     Op::PushConst { value: 2 },
//!     Op::PushConst { value: 40 },
//!     Op::Add,
//!     Op::Pop { reg: Reg::R0 },
//!     Op::Halt,
//! ];
//! let program = compile_ops(&ops).expect("Failed to compile");
//! assert_has_pattern(
//!     program.instructions(),
//!     &[InstructionPattern::Add { dst: Pat::Any, src1: Pat::Any, src2: Pat::Any }],
//! );
//!
//! let machine = run_ops(&ops).expect("Failed to run");
//! assert_eq!(machine.reg(Reg::R0), 42);
//! ```

#![allow(
    clippy::match_same_arms,
    clippy::must_use_candidate,
    clippy::manual_assert,
    clippy::missing_panics_doc,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::uninlined_format_args
)]

use crate::abi::{DEFAULT_FRAME_BASE, DEFAULT_ORIGIN, TRAP_HALT};
use crate::codegen::{CodeGen, Program};
use crate::isa::{Image, Instruction, Opcode, Reg};
use crate::translate::{CompileOptions, Op, compile};
use crate::{Error, Result};

/// Default step budget for [`Machine::run`].
pub const DEFAULT_STEP_LIMIT: usize = 100_000;

/// Compile an operation stream with default options.
pub fn compile_ops(ops: &[Op]) -> Result<Program> {
    compile(ops, &CompileOptions::default())
}

/// Compile, assemble at the default origin and run until `HALT`.
pub fn run_ops(ops: &[Op]) -> Result<Machine> {
    let image = compile_ops(ops)?.assemble(DEFAULT_ORIGIN)?;
    run_image(&image)
}

/// Finish a generator, assemble it at the default origin and run it.
pub fn run_codegen(cg: CodeGen) -> Result<Machine> {
    let image = cg.finish()?.assemble(DEFAULT_ORIGIN)?;
    run_image(&image)
}

pub fn run_image(image: &Image) -> Result<Machine> {
    let mut machine = Machine::new(image);
    machine.run(DEFAULT_STEP_LIMIT)?;
    Ok(machine)
}

/// Pattern matching for instruction fields
#[derive(Debug, Clone)]
pub enum Pat<T> {
    /// Match any value
    Any,
    /// Match exact value
    Exact(T),
    /// Match if value satisfies predicate
    Predicate(fn(&T) -> bool),
}

impl<T: PartialEq> Pat<T> {
    /// Check if a value matches this pattern
    pub fn matches(&self, value: &T) -> bool {
        match self {
            Pat::Any => true,
            Pat::Exact(expected) => value == expected,
            Pat::Predicate(pred) => pred(value),
        }
    }
}

/// Pattern for matching instructions in tests
///
/// This allows flexible matching of instruction sequences where some
/// fields can be wildcards or predicates.
#[derive(Debug, Clone)]
pub enum InstructionPattern {
    /// Match any instruction
    Any,
    Add {
        dst: Pat<Reg>,
        src1: Pat<Reg>,
        src2: Pat<Reg>,
    },
    AddImm {
        dst: Pat<Reg>,
        src: Pat<Reg>,
        value: Pat<i32>,
    },
    And {
        dst: Pat<Reg>,
        src1: Pat<Reg>,
        src2: Pat<Reg>,
    },
    AndImm {
        dst: Pat<Reg>,
        src: Pat<Reg>,
        value: Pat<i32>,
    },
    Not {
        dst: Pat<Reg>,
        src: Pat<Reg>,
    },
    Load {
        dst: Pat<Reg>,
        cell: Pat<u16>,
    },
    Store {
        src: Pat<Reg>,
        cell: Pat<u16>,
    },
    LoadInd {
        dst: Pat<Reg>,
        base: Pat<Reg>,
        offset: Pat<i32>,
    },
    StoreInd {
        src: Pat<Reg>,
        base: Pat<Reg>,
        offset: Pat<i32>,
    },
    LoadEffectiveAddress {
        dst: Pat<Reg>,
    },
    Jump {
        base: Pat<Reg>,
    },
    Trap {
        vector: Pat<u8>,
    },
}

impl InstructionPattern {
    /// Check if an instruction matches this pattern
    pub fn matches(&self, instr: &Instruction) -> bool {
        use InstructionPattern as P;

        match (self, instr) {
            (P::Any, _) => true,
            (
                P::Add {
                    dst: d_pat,
                    src1: s1_pat,
                    src2: s2_pat,
                },
                Instruction::Add { dst, src1, src2 },
            )
            | (
                P::And {
                    dst: d_pat,
                    src1: s1_pat,
                    src2: s2_pat,
                },
                Instruction::And { dst, src1, src2 },
            ) => d_pat.matches(dst) && s1_pat.matches(src1) && s2_pat.matches(src2),
            (
                P::AddImm {
                    dst: d_pat,
                    src: s_pat,
                    value: v_pat,
                },
                Instruction::AddImm { dst, src, value },
            )
            | (
                P::AndImm {
                    dst: d_pat,
                    src: s_pat,
                    value: v_pat,
                },
                Instruction::AndImm { dst, src, value },
            ) => d_pat.matches(dst) && s_pat.matches(src) && v_pat.matches(value),
            (P::Not { dst: d_pat, src: s_pat }, Instruction::Not { dst, src }) => {
                d_pat.matches(dst) && s_pat.matches(src)
            }
            (P::Load { dst: r_pat, cell: c_pat }, Instruction::Load { dst: reg, cell })
            | (P::Store { src: r_pat, cell: c_pat }, Instruction::Store { src: reg, cell }) => {
                r_pat.matches(reg) && c_pat.matches(cell)
            }
            (
                P::LoadInd {
                    dst: r_pat,
                    base: b_pat,
                    offset: o_pat,
                },
                Instruction::LoadInd {
                    dst: reg,
                    base,
                    offset,
                },
            )
            | (
                P::StoreInd {
                    src: r_pat,
                    base: b_pat,
                    offset: o_pat,
                },
                Instruction::StoreInd {
                    src: reg,
                    base,
                    offset,
                },
            ) => r_pat.matches(reg) && b_pat.matches(base) && o_pat.matches(offset),
            (P::LoadEffectiveAddress { dst: d_pat }, Instruction::LoadEffectiveAddress { dst, .. }) => {
                d_pat.matches(dst)
            }
            (P::Jump { base: b_pat }, Instruction::Jump { base }) => b_pat.matches(base),
            (P::Trap { vector: v_pat }, Instruction::Trap { vector }) => v_pat.matches(vector),
            _ => false,
        }
    }
}

/// Find the first occurrence of a contiguous pattern in an instruction sequence
///
/// Returns the starting index if found, None otherwise
pub fn find_pattern(instructions: &[Instruction], pattern: &[InstructionPattern]) -> Option<usize> {
    if pattern.is_empty() {
        return Some(0);
    }

    'outer: for start in 0..=instructions.len().saturating_sub(pattern.len()) {
        for (i, pat) in pattern.iter().enumerate() {
            match instructions.get(start + i) {
                Some(instr) if pat.matches(instr) => {}
                _ => continue 'outer,
            }
        }
        return Some(start);
    }
    None
}

/// Assert that an instruction sequence contains a pattern
///
/// Panics with a descriptive message if the pattern is not found
pub fn assert_has_pattern(instructions: &[Instruction], pattern: &[InstructionPattern]) {
    if find_pattern(instructions, pattern).is_none() {
        panic!(
            "Pattern not found in instruction sequence.\n\nExpected pattern:\n{}\n\nActual instructions:\n{}",
            format_patterns(pattern),
            format_instructions(instructions)
        );
    }
}

/// Assert that instructions match a pattern exactly
///
/// Panics with a descriptive message if they don't match
pub fn assert_matches(instructions: &[Instruction], pattern: &[InstructionPattern]) {
    if instructions.len() != pattern.len() {
        panic!(
            "Instruction count mismatch: expected {}, got {}.\n\nExpected pattern:\n{}\n\nActual instructions:\n{}",
            pattern.len(),
            instructions.len(),
            format_patterns(pattern),
            format_instructions(instructions)
        );
    }

    for (i, (instr, pat)) in instructions.iter().zip(pattern.iter()).enumerate() {
        if !pat.matches(instr) {
            panic!(
                "Instruction mismatch at index {}:\nExpected: {:?}\nActual:   {}\n\nFull pattern:\n{}\n\nFull instructions:\n{}",
                i,
                pat,
                instr,
                format_patterns(pattern),
                format_instructions(instructions)
            );
        }
    }
}

fn format_patterns(patterns: &[InstructionPattern]) -> String {
    patterns
        .iter()
        .map(|p| format!("  {:?}", p))
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_instructions(instructions: &[Instruction]) -> String {
    instructions
        .iter()
        .enumerate()
        .map(|(i, instr)| format!("  {:4}: {}", i, instr))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Count instructions with a specific opcode
pub fn count_opcode(instructions: &[Instruction], opcode: Opcode) -> usize {
    instructions
        .iter()
        .filter(|i| i.opcode() == opcode)
        .count()
}

/// Check if an instruction sequence contains a specific opcode
pub fn has_opcode(instructions: &[Instruction], opcode: Opcode) -> bool {
    instructions.iter().any(|i| i.opcode() == opcode)
}

/// Filter instructions by opcode
pub fn filter_by_opcode(instructions: &[Instruction], opcode: Opcode) -> Vec<&Instruction> {
    instructions
        .iter()
        .filter(|i| i.opcode() == opcode)
        .collect()
}

// ── Reference machine ──

const MEMORY_WORDS: usize = 1 << 16;

fn sext(value: u16, bits: u32) -> u16 {
    let shift = 16 - bits;
    (((value << shift) as i16) >> shift) as u16
}

/// Executes the instruction subset the generator and assembler emit.
///
/// Memory is fully word addressed and zero initialised apart from the
/// loaded image. `TRAP x25` stops the machine; anything else it cannot
/// decode is an error.
#[derive(Clone)]
pub struct Machine {
    memory: Vec<u16>,
    regs: [u16; 8],
    pc: u16,
    steps: usize,
    halted: bool,
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("regs", &self.regs)
            .field("pc", &format_args!("{:#06x}", self.pc))
            .field("steps", &self.steps)
            .field("halted", &self.halted)
            .finish_non_exhaustive()
    }
}

impl Machine {
    pub fn new(image: &Image) -> Self {
        let mut memory = vec![0; MEMORY_WORDS];
        for (i, word) in image.words().iter().enumerate() {
            memory[(usize::from(image.origin()) + i) % MEMORY_WORDS] = *word;
        }
        Self {
            memory,
            regs: [0; 8],
            pc: image.origin(),
            steps: 0,
            halted: false,
        }
    }

    pub fn reg(&self, reg: Reg) -> u16 {
        self.regs[reg.index()]
    }

    pub fn set_reg(&mut self, reg: Reg, value: u16) {
        self.regs[reg.index()] = value;
    }

    pub fn mem(&self, address: u16) -> u16 {
        self.memory[usize::from(address)]
    }

    /// Word `offset` of the outermost frame, assuming the default frame base.
    pub fn frame_word(&self, offset: u16) -> u16 {
        self.mem(DEFAULT_FRAME_BASE.wrapping_add(offset))
    }

    pub fn pc(&self) -> u16 {
        self.pc
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Run until `HALT` or until `limit` instructions have executed.
    pub fn run(&mut self, limit: usize) -> Result<()> {
        while !self.halted {
            if self.steps >= limit {
                return Err(Error::Internal(format!(
                    "step limit {limit} reached at pc {:#06x}",
                    self.pc
                )));
            }
            self.step()?;
        }
        Ok(())
    }

    pub fn step(&mut self) -> Result<()> {
        let word = self.mem(self.pc);
        let at = self.pc;
        self.pc = self.pc.wrapping_add(1);
        self.steps += 1;

        let dr = usize::from((word >> 9) & 0x7);
        let sr1 = usize::from((word >> 6) & 0x7);
        let pc_offset9 = sext(word & 0x1FF, 9);
        let offset6 = sext(word & 0x3F, 6);
        let operand2 = |regs: &[u16; 8]| {
            if word & 0x20 == 0 {
                regs[usize::from(word & 0x7)]
            } else {
                sext(word & 0x1F, 5)
            }
        };

        match Opcode::from_word(word) {
            // only the unconditional form is ever assembled
            Some(Opcode::Branch) if dr == 0b111 => self.pc = self.pc.wrapping_add(pc_offset9),
            Some(Opcode::Add) => self.regs[dr] = self.regs[sr1].wrapping_add(operand2(&self.regs)),
            Some(Opcode::And) => self.regs[dr] = self.regs[sr1] & operand2(&self.regs),
            Some(Opcode::Not) => self.regs[dr] = !self.regs[sr1],
            Some(Opcode::Load) => self.regs[dr] = self.mem(self.pc.wrapping_add(pc_offset9)),
            Some(Opcode::Store) => {
                let address = self.pc.wrapping_add(pc_offset9);
                self.memory[usize::from(address)] = self.regs[dr];
            }
            Some(Opcode::LoadIndirect) => {
                let pointer = self.mem(self.pc.wrapping_add(pc_offset9));
                self.regs[dr] = self.mem(pointer);
            }
            Some(Opcode::StoreIndirect) => {
                let pointer = self.mem(self.pc.wrapping_add(pc_offset9));
                self.memory[usize::from(pointer)] = self.regs[dr];
            }
            Some(Opcode::LoadInd) => {
                self.regs[dr] = self.mem(self.regs[sr1].wrapping_add(offset6));
            }
            Some(Opcode::StoreInd) => {
                let address = self.regs[sr1].wrapping_add(offset6);
                self.memory[usize::from(address)] = self.regs[dr];
            }
            Some(Opcode::LoadEffectiveAddress) => self.regs[dr] = self.pc.wrapping_add(pc_offset9),
            Some(Opcode::Jump) => self.pc = self.regs[sr1],
            Some(Opcode::Trap) if word & 0xFF == u16::from(TRAP_HALT) => self.halted = true,
            _ => {
                return Err(Error::Internal(format!(
                    "cannot execute {word:#06x} at {at:#06x}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instruction_pattern_matching() {
        let instr = Instruction::Add {
            dst: Reg::R5,
            src1: Reg::R2,
            src2: Reg::R3,
        };

        // Exact match
        let pattern_exact = InstructionPattern::Add {
            dst: Pat::Exact(Reg::R5),
            src1: Pat::Exact(Reg::R2),
            src2: Pat::Exact(Reg::R3),
        };
        assert!(pattern_exact.matches(&instr));

        // Wildcard match
        let pattern_wildcard = InstructionPattern::Add {
            dst: Pat::Any,
            src1: Pat::Any,
            src2: Pat::Any,
        };
        assert!(pattern_wildcard.matches(&instr));

        // Wrong instruction type
        let pattern_wrong = InstructionPattern::And {
            dst: Pat::Any,
            src1: Pat::Any,
            src2: Pat::Any,
        };
        assert!(!pattern_wrong.matches(&instr));
    }

    #[test]
    fn test_find_pattern() {
        let instructions = vec![
            Instruction::AndImm {
                dst: Reg::R2,
                src: Reg::R2,
                value: 0,
            },
            Instruction::AddImm {
                dst: Reg::R2,
                src: Reg::R2,
                value: 5,
            },
            Instruction::Add {
                dst: Reg::R4,
                src1: Reg::R2,
                src2: Reg::R3,
            },
            Instruction::Trap { vector: 0x25 },
        ];

        let pattern = vec![
            InstructionPattern::AddImm {
                dst: Pat::Any,
                src: Pat::Any,
                value: Pat::Any,
            },
            InstructionPattern::Add {
                dst: Pat::Any,
                src1: Pat::Exact(Reg::R2),
                src2: Pat::Any,
            },
        ];

        assert_eq!(find_pattern(&instructions, &pattern), Some(1));
        assert_eq!(count_opcode(&instructions, Opcode::Add), 2);
        assert_eq!(count_opcode(&instructions, Opcode::Trap), 1);
        assert!(!has_opcode(&instructions, Opcode::Jump));
    }

    #[test]
    fn test_pat_predicate() {
        let is_positive = |v: &i32| *v > 0;
        let pat = Pat::Predicate(is_positive);

        assert!(pat.matches(&5));
        assert!(!pat.matches(&-1));
        assert!(!pat.matches(&0));
    }

    #[test]
    fn test_machine_runs_arithmetic() {
        let chunks = [
            Instruction::AndImm {
                dst: Reg::R0,
                src: Reg::R0,
                value: 0,
            },
            Instruction::AddImm {
                dst: Reg::R0,
                src: Reg::R0,
                value: -3,
            },
            Instruction::Load {
                dst: Reg::R1,
                cell: 0,
            },
            Instruction::Add {
                dst: Reg::R2,
                src1: Reg::R0,
                src2: Reg::R1,
            },
            Instruction::Trap { vector: 0x25 },
        ];
        let image = Image::assemble(&chunks, &[100], 0x3000).unwrap();
        let machine = run_image(&image).unwrap();
        assert_eq!(machine.reg(Reg::R0), (-3i16) as u16);
        assert_eq!(machine.reg(Reg::R2), 97);
        assert_eq!(machine.steps(), 5);
    }

    #[test]
    fn test_machine_indirect_and_lea() {
        let chunks = [
            Instruction::Load {
                dst: Reg::R6,
                cell: 0,
            },
            Instruction::LoadEffectiveAddress {
                dst: Reg::R1,
                offset: crate::isa::Rel::Resolved(3),
            },
            Instruction::StoreInd {
                src: Reg::R1,
                base: Reg::R6,
                offset: 2,
            },
            Instruction::LoadInd {
                dst: Reg::R3,
                base: Reg::R6,
                offset: 2,
            },
            Instruction::Trap { vector: 0x25 },
        ];
        let image = Image::assemble(&chunks, &[0x4000], 0x3000).unwrap();
        let machine = run_image(&image).unwrap();
        assert_eq!(machine.reg(Reg::R1), 0x3004);
        assert_eq!(machine.reg(Reg::R3), 0x3004);
        assert_eq!(machine.mem(0x4002), 0x3004);
    }

    #[test]
    fn test_machine_step_limit() {
        // JMP to itself
        let chunks = [
            Instruction::LoadEffectiveAddress {
                dst: Reg::R0,
                offset: crate::isa::Rel::Resolved(1),
            },
            Instruction::Jump { base: Reg::R0 },
        ];
        let image = Image::assemble(&chunks, &[], 0x3000).unwrap();
        let mut machine = Machine::new(&image);
        assert!(machine.run(50).is_err());
        assert!(!machine.is_halted());
    }

    #[test]
    fn test_run_ops_add() {
        let machine = run_ops(&[
            Op::PushConst { value: 2 },
            Op::PushConst { value: 40 },
            Op::Add,
            Op::Pop { reg: Reg::R0 },
            Op::Halt,
        ])
        .unwrap();
        assert_eq!(machine.reg(Reg::R0), 42);
        assert!(machine.is_halted());
    }
}
