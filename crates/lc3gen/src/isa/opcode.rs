/// Four-bit primary opcodes of the target ISA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Only produced by the image assembler, to step over a pointer island.
    Branch = 0b0000,
    Add = 0b0001,
    Load = 0b0010,
    Store = 0b0011,
    And = 0b0101,
    LoadInd = 0b0110,
    StoreInd = 0b0111,
    Not = 0b1001,
    /// Only produced by the image assembler for far data cells.
    LoadIndirect = 0b1010,
    /// Only produced by the image assembler for far data cells.
    StoreIndirect = 0b1011,
    Jump = 0b1100,
    LoadEffectiveAddress = 0b1110,
    Trap = 0b1111,
}

impl Opcode {
    #[must_use]
    pub const fn is_terminating(self) -> bool {
        matches!(self, Self::Branch | Self::Jump | Self::Trap)
    }

    /// The opcode field placed in bits 15..12 of an encoded word.
    #[must_use]
    pub const fn word_bits(self) -> u16 {
        (self as u16) << 12
    }

    #[must_use]
    pub const fn from_word(word: u16) -> Option<Self> {
        match word >> 12 {
            0b0000 => Some(Self::Branch),
            0b0001 => Some(Self::Add),
            0b0010 => Some(Self::Load),
            0b0011 => Some(Self::Store),
            0b0101 => Some(Self::And),
            0b0110 => Some(Self::LoadInd),
            0b0111 => Some(Self::StoreInd),
            0b1001 => Some(Self::Not),
            0b1010 => Some(Self::LoadIndirect),
            0b1011 => Some(Self::StoreIndirect),
            0b1100 => Some(Self::Jump),
            0b1110 => Some(Self::LoadEffectiveAddress),
            0b1111 => Some(Self::Trap),
            _ => None,
        }
    }
}
