use crate::{Error, Result};

/// One logical value on the current frame's stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    /// Word offset from the frame base.
    pub offset: usize,
    /// Size in words.
    pub size: usize,
}

impl Slot {
    #[must_use]
    pub const fn end(self) -> usize {
        self.offset + self.size
    }
}

/// The compiler's model of the runtime stack shape for one frame.
/// Index 0 is the oldest slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackModel {
    slots: Vec<Slot>,
}

impl StackModel {
    #[must_use]
    pub const fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Append a slot of `size` words directly after the previous one.
    pub fn push(&mut self, size: usize) -> usize {
        let offset = self.slots.last().map_or(0, |s| s.end());
        self.slots.push(Slot { offset, size });
        self.slots.len() - 1
    }

    pub fn pop(&mut self) -> Result<Slot> {
        self.slots
            .pop()
            .ok_or(Error::StackUnderflow { needed: 1, len: 0 })
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<Slot> {
        self.slots.get(index).copied()
    }

    pub fn slot(&self, index: usize) -> Result<Slot> {
        self.get(index).ok_or(Error::SlotOutOfRange {
            index,
            len: self.slots.len(),
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Total frame size in words.
    #[must_use]
    pub fn words(&self) -> usize {
        self.slots.last().map_or(0, |s| s.end())
    }

    pub fn truncate(&mut self, len: usize) {
        self.slots.truncate(len);
    }

    /// Merge `count` slots starting at `index` into one composite slot.
    pub fn join(&mut self, index: usize, count: usize) -> Result<()> {
        let len = self.slots.len();
        let end = match index.checked_add(count) {
            Some(end) if count > 0 && end <= len => end,
            _ => return Err(Error::SlotOutOfRange { index, len }),
        };
        let offset = self.slots[index].offset;
        let size = self.slots[index..end].iter().map(|s| s.size).sum();
        self.slots.splice(index..end, [Slot { offset, size }]);
        Ok(())
    }

    /// Split slot `index` into two, the first `split_size` words long.
    pub fn split(&mut self, index: usize, split_size: usize) -> Result<()> {
        let slot = self.slot(index)?;
        if split_size > slot.size {
            return Err(Error::InvalidOp(format!(
                "cannot split {split_size} words off a {}-word slot",
                slot.size
            )));
        }
        self.slots[index].size = split_size;
        self.slots.insert(
            index + 1,
            Slot {
                offset: slot.offset + split_size,
                size: slot.size - split_size,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop() {
        let mut stack = StackModel::new();
        assert_eq!(stack.len(), 0);

        assert_eq!(stack.push(1), 0);
        assert_eq!(stack.push(3), 1);
        assert_eq!(stack.push(1), 2);
        assert_eq!(stack.slot(2).unwrap(), Slot { offset: 4, size: 1 });
        assert_eq!(stack.words(), 5);

        let popped = stack.pop().unwrap();
        assert_eq!(popped.offset, 4);
        assert_eq!(stack.len(), 2);
    }

    #[test]
    fn test_pop_empty_underflows() {
        let mut stack = StackModel::new();
        assert!(matches!(stack.pop(), Err(Error::StackUnderflow { .. })));
    }

    #[test]
    fn test_join_sums_sizes_and_keeps_first_offset() {
        let mut stack = StackModel::new();
        stack.push(1);
        stack.push(2);
        stack.push(1);
        stack.push(1);
        stack.join(1, 2).unwrap();
        assert_eq!(stack.len(), 3);
        assert_eq!(stack.slot(1).unwrap(), Slot { offset: 1, size: 3 });
        assert_eq!(stack.slot(2).unwrap().offset, 4);
    }

    #[test]
    fn test_split_then_join_restores_slot() {
        let mut stack = StackModel::new();
        stack.push(1);
        stack.push(4);
        let before = stack.clone();
        stack.split(1, 3).unwrap();
        assert_eq!(stack.slot(2).unwrap(), Slot { offset: 4, size: 1 });
        stack.join(1, 2).unwrap();
        assert_eq!(stack, before);
    }

    #[test]
    fn test_split_rejects_oversized() {
        let mut stack = StackModel::new();
        stack.push(2);
        assert!(stack.split(0, 3).is_err());
        assert!(stack.split(4, 1).is_err());
    }

    #[test]
    fn test_join_out_of_range() {
        let mut stack = StackModel::new();
        stack.push(1);
        assert!(stack.join(0, 2).is_err());
        assert!(stack.join(0, 0).is_err());
    }

    #[test]
    fn test_join_with_huge_index_errors() {
        let mut stack = StackModel::new();
        stack.push(1);
        assert!(matches!(
            stack.join(usize::MAX, 2),
            Err(Error::SlotOutOfRange {
                index: usize::MAX,
                len: 1
            })
        ));
        assert!(stack.join(0, usize::MAX).is_err());
        assert_eq!(stack.len(), 1);
    }
}
