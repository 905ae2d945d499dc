// Arithmetic and logic lowering: pop operands, push the combination.

use serde::{Deserialize, Serialize};

use crate::isa::{Instruction, Reg};
use crate::{Error, Result};

use super::{CodeGen, Target};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    And,
    Sub,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Not,
    Neg,
}

fn lower_binary(cg: &mut CodeGen, op: BinaryOp, dst: Reg, lhs: Reg, rhs: Reg) {
    match op {
        BinaryOp::Add => {
            cg.emit(Instruction::Add {
                dst,
                src1: lhs,
                src2: rhs,
            });
        }
        BinaryOp::And => {
            cg.emit(Instruction::And {
                dst,
                src1: lhs,
                src2: rhs,
            });
        }
        BinaryOp::Sub => {
            // lhs + (!rhs + 1)
            cg.emit(Instruction::Not { dst, src: rhs });
            cg.emit(Instruction::AddImm {
                dst,
                src: dst,
                value: 1,
            });
            cg.emit(Instruction::Add {
                dst,
                src1: lhs,
                src2: dst,
            });
        }
    }
}

impl CodeGen {
    /// `[.., lhs, rhs] -> [.., lhs op rhs]`
    pub fn binary(&mut self, op: BinaryOp) -> Result<()> {
        let len = self.stack.len();
        if len < 2 {
            return Err(Error::StackUnderflow { needed: 2, len });
        }
        self.pop(Target::computed(move |cg, rhs| {
            cg.pop(Target::computed(move |cg, lhs| {
                cg.push(Target::computed(move |cg, dst| {
                    lower_binary(cg, op, dst, lhs, rhs);
                    Ok(())
                }))
            }))
        }))
    }

    pub fn add(&mut self) -> Result<()> {
        self.binary(BinaryOp::Add)
    }

    pub fn and(&mut self) -> Result<()> {
        self.binary(BinaryOp::And)
    }

    pub fn sub(&mut self) -> Result<()> {
        self.binary(BinaryOp::Sub)
    }

    /// `[.., x] -> [.., op x]`
    pub fn unary(&mut self, op: UnaryOp) -> Result<()> {
        self.pop(Target::computed(move |cg, src| {
            cg.push(Target::computed(move |cg, dst| {
                cg.emit(Instruction::Not { dst, src });
                if op == UnaryOp::Neg {
                    cg.emit(Instruction::AddImm {
                        dst,
                        src: dst,
                        value: 1,
                    });
                }
                Ok(())
            }))
        }))
    }
}
