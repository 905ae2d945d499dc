#![allow(
    clippy::missing_errors_doc, // every fallible operation returns the crate `Error`
    clippy::missing_panics_doc,
    clippy::module_name_repetitions
)]

pub mod abi;
pub mod codegen;
pub mod error;
pub mod isa;
pub mod translate;

/// Test harness module for writing unit and integration tests.
///
/// This module is only available when running tests or when the
/// `test-harness` feature is enabled.
#[cfg(any(test, feature = "test-harness"))]
pub mod test_harness;

pub use codegen::{CodeGen, Program, Target};
pub use error::{Error, Result};
pub use isa::{Image, Instruction, Opcode, Reg};
pub use translate::{CompileOptions, Op, compile, compile_to_image};
