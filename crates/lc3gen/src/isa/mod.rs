// Encoding utilities pack register numbers and offsets into 16-bit words.
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss
)]

mod image;
mod instruction;
mod opcode;
mod reg;

pub use image::Image;
pub use instruction::{Instruction, Rel};
pub use opcode::Opcode;
pub use reg::Reg;
