// Image assembly. Chunks are laid out in order with the data segment right
// after them. Load/store and LEA reach their targets through a 9-bit
// PC-relative field, so a chunk whose target ends up too far away is
// rewritten to go through a pointer word holding the absolute address:
// `LDI`/`STI` for data cells, `LD` for code addresses. Pointers are
// collected into islands placed after their users, with a `BR` over each
// island that code can fall into.

use std::collections::HashMap;

use super::instruction::pc_relative;
use super::{Instruction, Opcode, Rel};
use crate::abi::{PC_OFFSET9_BITS, fits_signed};
use crate::{Error, Result};

/// Furthest forward distance a PC-relative field can reach.
const PC_REACH: usize = (1 << (PC_OFFSET9_BITS - 1)) - 1;

/// `nzp` bits of an unconditional branch.
const BRANCH_ALWAYS: u16 = 0b111;

/// Absolute address held by a pointer word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PointerTarget {
    Data(u16),
    Code(usize),
}

#[derive(Debug, Clone, Copy)]
enum Word {
    Chunk(usize),
    /// Unconditional branch over the `usize` pointer words that follow.
    Branch(usize),
    Pointer(PointerTarget),
}

/// Pointers waiting to be placed, with the chunks that use them.
#[derive(Debug, Default)]
struct Island {
    targets: Vec<PointerTarget>,
    users: Vec<(usize, usize)>,
    first_use: Option<usize>,
}

impl Island {
    /// Whether placing a chunk at `at` would push the island's last pointer
    /// out of reach of its first user.
    fn must_close_before(&self, at: usize, target: Option<PointerTarget>) -> bool {
        let grows = target.is_some_and(|t| !self.targets.contains(&t));
        let count = self.targets.len() + usize::from(grows);
        if count == 0 {
            return false;
        }
        let first = self.first_use.unwrap_or(at);
        // chunk at `at`, branch after it, then `count` pointers
        let last = at + 1 + count;
        last - (first + 1) > PC_REACH
    }

    fn add(&mut self, chunk: usize, at: usize, target: PointerTarget) {
        let slot = match self.targets.iter().position(|t| *t == target) {
            Some(slot) => slot,
            None => {
                self.targets.push(target);
                self.targets.len() - 1
            }
        };
        self.users.push((chunk, slot));
        self.first_use.get_or_insert(at);
    }

    fn close(&mut self, words: &mut Vec<Word>, pointers: &mut HashMap<usize, usize>, branch: bool) {
        if self.targets.is_empty() {
            return;
        }
        if branch {
            words.push(Word::Branch(self.targets.len()));
        }
        let base = words.len();
        words.extend(self.targets.iter().map(|t| Word::Pointer(*t)));
        for (chunk, slot) in self.users.drain(..) {
            pointers.insert(chunk, base + slot);
        }
        *self = Self::default();
    }
}

/// Word-level placement of chunks, branches and pointers.
#[derive(Debug)]
struct Layout {
    words: Vec<Word>,
    /// Address of every chunk, plus one entry for the end of the code.
    chunk_addr: Vec<usize>,
    /// Pointer word used by each far chunk.
    pointers: HashMap<usize, usize>,
}

impl Layout {
    fn new(chunks: &[Instruction], far: &[bool]) -> Result<Self> {
        let mut words = Vec::with_capacity(chunks.len());
        let mut chunk_addr = Vec::with_capacity(chunks.len() + 1);
        let mut pointers = HashMap::new();
        let mut island = Island::default();

        for (i, &is_far) in far.iter().enumerate() {
            let target = if is_far {
                pointer_target(chunks, i)?
            } else {
                None
            };
            if island.must_close_before(words.len(), target) {
                island.close(&mut words, &mut pointers, true);
            }
            let at = words.len();
            chunk_addr.push(at);
            words.push(Word::Chunk(i));
            if let Some(target) = target {
                island.add(i, at, target);
            }
        }
        chunk_addr.push(words.len());
        // nothing falls through past the last chunk
        island.close(&mut words, &mut pointers, false);

        Ok(Self {
            words,
            chunk_addr,
            pointers,
        })
    }

    /// Whether chunk `i`, encoded in place, reaches its target.
    fn reaches(&self, chunks: &[Instruction], i: usize, data_start: usize) -> Result<bool> {
        let from = self.chunk_addr[i] as i64 + 1;
        let to = match &chunks[i] {
            Instruction::Load { cell, .. } | Instruction::Store { cell, .. } => {
                (data_start + usize::from(*cell)) as i64
            }
            Instruction::LoadEffectiveAddress { offset, .. } => match offset {
                Rel::Resolved(rel) => self.chunk_addr[lea_target(chunks, i, *rel)?] as i64,
                Rel::Placeholder => return Err(Error::UnresolvedPlaceholder(i)),
            },
            _ => return Ok(true),
        };
        Ok(i32::try_from(to - from).is_ok_and(|rel| fits_signed(rel, PC_OFFSET9_BITS)))
    }

    fn encode_chunk(&self, chunks: &[Instruction], i: usize, at: usize, far: bool) -> Result<u16> {
        let code_len = self.words.len();
        let chunk = &chunks[i];
        if far {
            let pointer = *self
                .pointers
                .get(&i)
                .ok_or_else(|| Error::Internal(format!("far chunk {i} has no pointer")))?;
            let rel = pointer as i32 - (at as i32 + 1);
            return match chunk {
                Instruction::Load { dst, .. } => {
                    pc_relative(Opcode::LoadIndirect, dst.bits(), rel, at)
                }
                Instruction::Store { src, .. } => {
                    pc_relative(Opcode::StoreIndirect, src.bits(), rel, at)
                }
                Instruction::LoadEffectiveAddress { dst, .. } => {
                    pc_relative(Opcode::Load, dst.bits(), rel, at)
                }
                _ => Err(Error::Internal(format!("chunk {i} cannot use a pointer"))),
            };
        }
        match chunk {
            Instruction::LoadEffectiveAddress {
                dst,
                offset: Rel::Resolved(rel),
            } => {
                let target = self.chunk_addr[lea_target(chunks, i, *rel)?];
                Instruction::LoadEffectiveAddress {
                    dst: *dst,
                    offset: Rel::Resolved(target as i32 - at as i32),
                }
                .encode(at, code_len)
            }
            _ => chunk.encode(at, code_len),
        }
    }
}

/// Chunk index a resolved LEA at `i` points to. One past the last chunk is
/// allowed: a call may be the final chunk of a unit.
fn lea_target(chunks: &[Instruction], i: usize, rel: i32) -> Result<usize> {
    let target = i as i64 + i64::from(rel);
    usize::try_from(target)
        .ok()
        .filter(|t| *t <= chunks.len())
        .ok_or_else(|| Error::Internal(format!("chunk {i} points outside the code")))
}

fn pointer_target(chunks: &[Instruction], i: usize) -> Result<Option<PointerTarget>> {
    Ok(match &chunks[i] {
        Instruction::Load { cell, .. } | Instruction::Store { cell, .. } => {
            Some(PointerTarget::Data(*cell))
        }
        Instruction::LoadEffectiveAddress {
            offset: Rel::Resolved(rel),
            ..
        } => Some(PointerTarget::Code(lea_target(chunks, i, *rel)?)),
        _ => None,
    })
}

/// A fully resolved memory image: code words followed by the data segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    origin: u16,
    code_len: usize,
    words: Vec<u16>,
}

impl Image {
    /// Encode `chunks` and lay `data` out directly after them.
    pub fn assemble(chunks: &[Instruction], data: &[u16], origin: u16) -> Result<Self> {
        // Every pass only moves chunks from near to far, so this settles.
        let mut far = vec![false; chunks.len()];
        let layout = loop {
            let layout = Layout::new(chunks, &far)?;
            let data_start = layout.words.len();
            let mut moved = false;
            for (i, is_far) in far.iter_mut().enumerate() {
                if !*is_far && !layout.reaches(chunks, i, data_start)? {
                    *is_far = true;
                    moved = true;
                }
            }
            if !moved {
                break layout;
            }
        };

        let code_len = layout.words.len();
        let total = code_len + data.len();
        if usize::from(origin) + total > usize::from(u16::MAX) + 1 {
            return Err(Error::Internal(format!(
                "image of {total} words does not fit at origin {origin:#06x}"
            )));
        }
        let address = |offset: usize| origin.wrapping_add(offset as u16);

        let mut words = Vec::with_capacity(total);
        for (at, word) in layout.words.iter().enumerate() {
            words.push(match *word {
                Word::Chunk(i) => layout.encode_chunk(chunks, i, at, far[i])?,
                Word::Branch(skip) => pc_relative(Opcode::Branch, BRANCH_ALWAYS, skip as i32, at)?,
                Word::Pointer(PointerTarget::Data(cell)) => address(code_len + usize::from(cell)),
                Word::Pointer(PointerTarget::Code(chunk)) => address(layout.chunk_addr[chunk]),
            });
        }
        words.extend_from_slice(data);

        tracing::debug!(
            code_len,
            chunks = chunks.len(),
            far = far.iter().filter(|f| **f).count(),
            data_len = data.len(),
            origin,
            "assembled image"
        );
        Ok(Self {
            origin,
            code_len,
            words,
        })
    }

    #[must_use]
    pub fn origin(&self) -> u16 {
        self.origin
    }

    #[must_use]
    pub fn words(&self) -> &[u16] {
        &self.words
    }

    /// Code words, including any pointer islands.
    #[must_use]
    pub fn code_len(&self) -> usize {
        self.code_len
    }

    /// Absolute address of data cell `cell`.
    #[must_use]
    pub fn data_address(&self, cell: u16) -> u16 {
        self.origin
            .wrapping_add(self.code_len as u16)
            .wrapping_add(cell)
    }

    /// Object file layout: origin word followed by every image word, big-endian.
    #[must_use]
    pub fn to_object_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity((self.words.len() + 1) * 2);
        bytes.extend_from_slice(&self.origin.to_be_bytes());
        for word in &self.words {
            bytes.extend_from_slice(&word.to_be_bytes());
        }
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::Reg;
    use crate::test_harness::run_image;

    fn filler(count: usize) -> impl Iterator<Item = Instruction> {
        std::iter::repeat_n(Instruction::move_reg(Reg::R1, Reg::R1), count)
    }

    #[test]
    fn test_data_follows_code() {
        let chunks = vec![
            Instruction::Load {
                dst: Reg::R0,
                cell: 1,
            },
            Instruction::Trap { vector: 0x25 },
        ];
        let image = Image::assemble(&chunks, &[0x4000, 42], 0x3000).unwrap();
        assert_eq!(image.code_len(), 2);
        assert_eq!(image.words().len(), 4);
        assert_eq!(image.words()[3], 42);
        assert_eq!(image.data_address(1), 0x3003);
        // LD at 0 reaching word 3: PC offset 2.
        assert_eq!(image.words()[0], 0b0010_0000_0000_0010);
    }

    #[test]
    fn test_object_bytes_are_big_endian_with_origin() {
        let image = Image::assemble(&[Instruction::Trap { vector: 0x25 }], &[], 0x3000).unwrap();
        assert_eq!(image.to_object_bytes(), vec![0x30, 0x00, 0xF0, 0x25]);
    }

    #[test]
    fn test_far_data_goes_through_pointer_island() {
        let mut chunks = vec![Instruction::Load {
            dst: Reg::R0,
            cell: 0,
        }];
        chunks.extend(filler(300));
        chunks.push(Instruction::Store {
            src: Reg::R0,
            cell: 1,
        });
        chunks.push(Instruction::Trap { vector: 0x25 });

        let image = Image::assemble(&chunks, &[7, 0], 0x3000).unwrap();
        // one branch and one pointer
        assert_eq!(image.code_len(), chunks.len() + 2);
        assert_eq!(
            Opcode::from_word(image.words()[0]),
            Some(Opcode::LoadIndirect)
        );
        // the store sits next to the data and stays direct
        let store = image.words()[image.code_len() - 2];
        assert_eq!(Opcode::from_word(store), Some(Opcode::Store));

        let machine = run_image(&image).unwrap();
        assert_eq!(machine.reg(Reg::R0), 7);
        assert_eq!(machine.mem(image.data_address(1)), 7);
    }

    #[test]
    fn test_far_lea_loads_absolute_address() {
        let mut chunks = vec![
            Instruction::LoadEffectiveAddress {
                dst: Reg::R2,
                offset: Rel::Resolved(302),
            },
            Instruction::Jump { base: Reg::R2 },
        ];
        chunks.extend(filler(300));
        chunks.push(Instruction::Trap { vector: 0x25 });

        let image = Image::assemble(&chunks, &[], 0x3000).unwrap();
        assert_eq!(Opcode::from_word(image.words()[0]), Some(Opcode::Load));

        let machine = run_image(&image).unwrap();
        assert!(machine.is_halted());
        assert_eq!(machine.steps(), 3);
        assert_eq!(machine.reg(Reg::R2), 0x3000 + image.code_len() as u16 - 1);
    }

    #[test]
    fn test_near_chunks_need_no_islands() {
        let mut chunks = vec![Instruction::Load {
            dst: Reg::R0,
            cell: 0,
        }];
        chunks.extend(filler(200));
        chunks.push(Instruction::Trap { vector: 0x25 });
        let image = Image::assemble(&chunks, &[1], 0x3000).unwrap();
        assert_eq!(image.code_len(), chunks.len());
        assert_eq!(Opcode::from_word(image.words()[0]), Some(Opcode::Load));
    }

    #[test]
    fn test_lea_outside_code_is_rejected() {
        let chunks = [Instruction::LoadEffectiveAddress {
            dst: Reg::R0,
            offset: Rel::Resolved(5),
        }];
        assert!(Image::assemble(&chunks, &[], 0x3000).is_err());
    }
}
