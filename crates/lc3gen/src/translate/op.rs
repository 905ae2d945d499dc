use serde::{Deserialize, Serialize};

use crate::isa::Reg;

/// One stack-machine operation as produced by the lowering pass.
///
/// Serialized as an internally tagged object, e.g.
/// `{"op":"push_const","value":5}` or `{"op":"add"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    /// Append raw words to the data segment. Cells are handed out in order,
    /// starting right after the reserved ones.
    Data { words: Vec<u16> },
    PushConst { value: i16 },
    /// Push the address of a labelled chunk.
    PushLabel { name: String },
    LoadData { cell: u16 },
    StoreData { cell: u16 },
    /// Pop the top value into a specific register.
    Pop { reg: Reg },
    Drop,
    Copy { index: usize },
    Replace { index: usize },
    Swap { a: usize, b: usize },
    Join { index: usize, count: usize },
    Split { index: usize, size: usize },
    Add,
    And,
    Sub,
    Not,
    Neg,
    Call,
    Yield,
    Return,
    Entry { closure_size: usize },
    /// Start a function body; `name` labels its first chunk.
    Function { name: String },
    Label { name: String },
    Flush,
    Halt,
}
