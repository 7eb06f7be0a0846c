//! Reference model of the packed rx index word.
//!
//! Drives the real [`IndexWord`] with reservations and consumer swaps and
//! checks it against a plain `(index, count)` pair, including the pre-check
//! producers run before reserving.

use std::collections::HashSet;

use pktq_shm::layout::{IndexWord, PackedIndex, COUNT_MASK, INITIAL_INDEX};
use pktq_shm::MAX_BATCH;

/// Minimum sub-buffer capacity for fuzzing.
pub const MIN_SIZE: u32 = 1;
/// Maximum sub-buffer capacity for fuzzing (keep small to find edge cases faster).
pub const MAX_SIZE: u32 = 64;

/// Operations on the index word.
#[derive(Clone, Copy, Debug)]
pub enum IndexOp {
    /// A producer reserves a batch of this many packets.
    Reserve(u32),
    /// The consumer swaps sub-buffers.
    Swap,
}

/// Execute a sequence of operations and verify invariants.
pub fn execute_and_verify(size: u32, ops: &[IndexOp]) -> Result<(), String> {
    let size = size.clamp(MIN_SIZE, MAX_SIZE);
    let word = IndexWord::new(PackedIndex::new(INITIAL_INDEX, 0));

    let mut index = INITIAL_INDEX;
    let mut count = 0u32;
    let mut claimed: HashSet<u32> = HashSet::new();

    for (i, op) in ops.iter().enumerate() {
        match *op {
            IndexOp::Reserve(n) => {
                let n = n % (MAX_BATCH as u32 + 1);
                if n == 0 {
                    continue;
                }
                if word.load().count() >= size {
                    // Full: producers do not reserve.
                    continue;
                }

                let prev = word.reserve(n);
                if prev.index() != index || prev.count() != count {
                    return Err(format!(
                        "op {}: reserve saw ({}, {}), model has ({}, {})",
                        i,
                        prev.index(),
                        prev.count(),
                        index,
                        count
                    ));
                }

                for offset in prev.count()..prev.count() + n {
                    if offset >= size {
                        break;
                    }
                    if !claimed.insert(offset) {
                        return Err(format!("op {}: offset {} reserved twice", i, offset));
                    }
                }
                count += n;
            }
            IndexOp::Swap => {
                let prev = word.swap_next();
                if prev != PackedIndex::new(index, count) {
                    return Err(format!(
                        "op {}: swap returned {:?}, model has ({}, {})",
                        i, prev, index, count
                    ));
                }
                index = index.wrapping_add(1);
                count = 0;
                claimed.clear();
            }
        }

        verify_index_invariants(&word, index, count, size, i)?;
    }

    Ok(())
}

fn verify_index_invariants(
    word: &IndexWord,
    index: u8,
    count: u32,
    size: u32,
    op_idx: usize,
) -> Result<(), String> {
    let current = word.load();

    // Invariant 1: word matches model
    if current.index() != index || current.count() != count {
        return Err(format!(
            "after op {}: word ({}, {}) but model ({}, {})",
            op_idx,
            current.index(),
            current.count(),
            index,
            count
        ));
    }

    // Invariant 2: selector is the low bit of the index
    if current.selector() != (index & 1) as usize {
        return Err(format!(
            "after op {}: selector {} for index {}",
            op_idx,
            current.selector(),
            index
        ));
    }

    // Invariant 3: the pre-check bounds overshoot to one batch
    if count >= size + MAX_BATCH as u32 {
        return Err(format!(
            "after op {}: count {} overshoots size {} by more than a batch",
            op_idx, count, size
        ));
    }

    // Invariant 4: the count never carries into the index
    if count > COUNT_MASK {
        return Err(format!("after op {}: count {} overflowed", op_idx, count));
    }

    Ok(())
}
