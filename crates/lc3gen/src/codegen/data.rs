use std::collections::HashMap;

use crate::abi::{FRAME_BASE_CELL, SPILL_SCRATCH_CELL};

/// Constant/data segment. Cell 0 holds the frame base, cell 1 is scratch
/// space for spilling a register while the frame base is borrowed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSegment {
    words: Vec<u16>,
    literals: HashMap<u16, u16>,
    far_scratch: Option<u16>,
}

impl DataSegment {
    #[must_use]
    pub fn new(frame_base: u16) -> Self {
        let mut words = vec![0; usize::from(SPILL_SCRATCH_CELL) + 1];
        words[usize::from(FRAME_BASE_CELL)] = frame_base;
        Self {
            words,
            literals: HashMap::new(),
            far_scratch: None,
        }
    }

    /// Append raw words, returning the offset of the first one.
    pub fn push_data(&mut self, data: &[u16]) -> u16 {
        let offset = self.words.len() as u16;
        self.words.extend_from_slice(data);
        offset
    }

    /// Offset of a literal-pool cell holding `value`, shared between uses.
    pub fn literal(&mut self, value: u16) -> u16 {
        if let Some(&offset) = self.literals.get(&value) {
            return offset;
        }
        let offset = self.push_data(&[value]);
        self.literals.insert(value, offset);
        offset
    }

    /// Cell that parks a value while a far frame slot is addressed.
    /// Allocated on first use.
    pub fn far_scratch(&mut self) -> u16 {
        if let Some(cell) = self.far_scratch {
            return cell;
        }
        let cell = self.push_data(&[0]);
        self.far_scratch = Some(cell);
        cell
    }

    #[must_use]
    pub fn frame_base(&self) -> u16 {
        self.words[usize::from(FRAME_BASE_CELL)]
    }

    #[must_use]
    pub fn words(&self) -> &[u16] {
        &self.words
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.words.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

impl Default for DataSegment {
    fn default() -> Self {
        Self::new(crate::abi::DEFAULT_FRAME_BASE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_cells() {
        let data = DataSegment::new(0x5000);
        assert_eq!(data.frame_base(), 0x5000);
        assert_eq!(data.len(), 2);
    }

    #[test]
    fn test_literals_are_deduplicated() {
        let mut data = DataSegment::default();
        let a = data.literal(1000);
        let b = data.literal(2000);
        let c = data.literal(1000);
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(data.words()[usize::from(b)], 2000);
    }

    #[test]
    fn test_push_data_is_not_pooled() {
        let mut data = DataSegment::default();
        let raw = data.push_data(&[7, 8]);
        let lit = data.literal(7);
        assert_ne!(raw, lit);
        assert_eq!(data.len(), 5);
    }

    #[test]
    fn test_far_scratch_allocated_once() {
        let mut data = DataSegment::default();
        assert_eq!(data.len(), 2);
        let cell = data.far_scratch();
        assert_eq!(data.far_scratch(), cell);
        assert_eq!(data.len(), 3);
        assert_ne!(data.literal(0), cell);
    }
}
