use crate::isa::Reg;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("No register available (pinned: {pinned:?})")]
    NoRegisterAvailable { pinned: Vec<Reg> },

    #[error("Stack slot {index} out of range (stack has {len} slots)")]
    SlotOutOfRange { index: usize, len: usize },

    #[error("Stack underflow: need {needed} slots, have {len}")]
    StackUnderflow { needed: usize, len: usize },

    #[error("Frame stack underflow")]
    FrameUnderflow,

    #[error("Missing register binding for {0}")]
    MissingBinding(String),

    #[error("Chunk {0} is not an unpatched placeholder")]
    NotAPlaceholder(usize),

    #[error("Chunk {0} still holds an unresolved placeholder")]
    UnresolvedPlaceholder(usize),

    #[error("Label {0} was never defined")]
    UndefinedLabel(usize),

    #[error("Unknown label name: {0}")]
    UnknownLabel(String),

    #[error("{field} value {value} does not fit in {bits} signed bits (chunk {chunk})")]
    OutOfRange {
        field: &'static str,
        value: i32,
        bits: u32,
        chunk: usize,
    },

    #[error("Invalid operation stream: {0}")]
    InvalidOp(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
