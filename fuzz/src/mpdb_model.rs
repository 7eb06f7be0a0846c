//! In-memory model of the multi-producer disjoint-buffer rx queue.
//!
//! Producers reserve with the real [`IndexWord`] but commit their slots one
//! step at a time, so a fuzzer can interleave reservations, individual slot
//! commits and consumer swaps in any order. Slot storage is a pair of plain
//! vectors standing in for the two sub-buffers.
//!
//! The consumer swaps in one of two ways. A patient swap waits for every
//! producer it depends on. A swap after a commit timeout skips uncommitted
//! slots as lost and leaves their producers free to commit late; it is
//! postponed while a producer is still registered on the sub-buffer it would
//! hand out.

use std::collections::{HashSet, VecDeque};

use pktq_shm::layout::{IndexWord, PackedIndex, INITIAL_INDEX};
use pktq_shm::MAX_BATCH;

/// Minimum sub-buffer capacity for fuzzing.
pub const MIN_SIZE: u32 = 1;
/// Maximum sub-buffer capacity for fuzzing.
pub const MAX_SIZE: u32 = 32;
/// Number of simulated producers.
pub const PRODUCERS: usize = 4;

/// Operations on the queue.
#[derive(Clone, Copy, Debug)]
pub enum MpdbOp {
    /// Producer reserves a batch of `n` packets.
    Reserve { producer: u8, n: u8 },
    /// Producer commits its oldest reserved slot.
    Commit { producer: u8 },
    /// Consumer swaps sub-buffers and reads the frozen one, waiting for
    /// every producer it depends on.
    Swap,
    /// Consumer swaps after its commit timeout ran out.
    SwapTimeout,
}

/// A reserved, not yet committed slot.
#[derive(Debug, Clone, Copy)]
struct Pending {
    reservation: u64,
    index: u8,
    offset: u32,
    tag: u64,
}

/// Slot storage for one sub-buffer.
struct SubBuffer {
    commit: Vec<u8>,
    tags: Vec<u64>,
}

/// In-memory model of the queue.
pub struct MpdbModel {
    word: IndexWord,
    size: u32,
    buffers: [SubBuffer; 2],
    pending: Vec<VecDeque<Pending>>,
    /// Reservations still in progress on each sub-buffer.
    writers: [u32; 2],
    next_tag: u64,
    next_reservation: u64,
    /// Committed and not yet read.
    unread: HashSet<u64>,
    read: HashSet<u64>,
    /// Skipped by a timed-out swap and not yet committed.
    lost_pending: HashSet<u64>,
    committed_this_cycle: [u32; 2],
    dropped: u64,
    lost: u64,
    postponed: u64,
}

impl MpdbModel {
    pub fn new(size: u32) -> Self {
        let size = size.clamp(MIN_SIZE, MAX_SIZE);
        let buffer = || SubBuffer {
            commit: vec![0; size as usize],
            tags: vec![u64::MAX; size as usize],
        };
        Self {
            word: IndexWord::new(PackedIndex::new(INITIAL_INDEX, 0)),
            size,
            buffers: [buffer(), buffer()],
            pending: vec![VecDeque::new(); PRODUCERS],
            writers: [0; 2],
            next_tag: 0,
            next_reservation: 0,
            unread: HashSet::new(),
            read: HashSet::new(),
            lost_pending: HashSet::new(),
            committed_this_cycle: [0; 2],
            dropped: 0,
            lost: 0,
            postponed: 0,
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Slots a timed-out swap skipped.
    pub fn lost(&self) -> u64 {
        self.lost
    }

    /// Timed-out swaps that did not happen because of a registered writer.
    pub fn postponed(&self) -> u64 {
        self.postponed
    }

    pub fn read_count(&self) -> usize {
        self.read.len()
    }

    /// Reserve `n` slots for `producer`. Returns how many were reserved.
    pub fn reserve(&mut self, producer: usize, n: u32) -> u32 {
        if n == 0 {
            return 0;
        }
        if self.word.load().count() >= self.size {
            self.dropped += n as u64;
            return 0;
        }

        let prev = self.word.reserve(n);
        self.writers[prev.selector()] += 1;
        let reservation = self.next_reservation;
        self.next_reservation += 1;

        for k in 0..n {
            let tag = self.next_tag;
            self.next_tag += 1;
            self.pending[producer].push_back(Pending {
                reservation,
                index: prev.index(),
                offset: prev.count() + k,
                tag,
            });
        }
        n
    }

    /// Commit `producer`'s oldest reserved slot.
    ///
    /// A slot past the end of the sub-buffer ends its reservation: it and
    /// the rest of that batch are dropped.
    pub fn commit_next(&mut self, producer: usize) -> Result<(), String> {
        let Some(p) = self.pending[producer].pop_front() else {
            return Ok(());
        };

        let result = if p.offset >= self.size {
            self.dropped += 1;
            while self.pending[producer]
                .front()
                .is_some_and(|next| next.reservation == p.reservation)
            {
                self.pending[producer].pop_front();
                self.dropped += 1;
            }
            Ok(())
        } else {
            self.write_slot(&p)
        };

        let finished = !self.pending[producer]
            .front()
            .is_some_and(|next| next.reservation == p.reservation);
        if finished {
            self.writers[(p.index & 1) as usize] -= 1;
        }
        result
    }

    fn write_slot(&mut self, p: &Pending) -> Result<(), String> {
        let selector = (p.index & 1) as usize;
        let active = self.word.load().index();
        if active != p.index && active != p.index.wrapping_add(1) {
            return Err(format!(
                "slot {} of index {} written while index {} is active",
                p.offset, p.index, active
            ));
        }

        let buffer = &mut self.buffers[selector];
        let slot = p.offset as usize;
        buffer.tags[slot] = p.tag;
        buffer.commit[slot] = p.index;

        if active != p.index {
            // Its cycle was already read: only a slot skipped as lost may
            // still be committed.
            if !self.lost_pending.remove(&p.tag) {
                return Err(format!(
                    "tag {} committed after its cycle was read but never counted lost",
                    p.tag
                ));
            }
            return Ok(());
        }

        self.committed_this_cycle[selector] += 1;
        if self.committed_this_cycle[selector] > self.size {
            return Err(format!(
                "{} slots committed into sub-buffer {} of size {}",
                self.committed_this_cycle[selector], selector, self.size
            ));
        }
        self.unread.insert(p.tag);
        Ok(())
    }

    /// Commit every pending slot of `index`, oldest first.
    fn commit_index(&mut self, index: u8) -> Result<(), String> {
        for producer in 0..PRODUCERS {
            while self.pending[producer]
                .front()
                .is_some_and(|p| p.index == index)
            {
                self.commit_next(producer)?;
            }
            if self.pending[producer].iter().any(|p| p.index == index) {
                return Err(format!(
                    "producer {} holds a slot of index {} behind a newer one",
                    producer, index
                ));
            }
        }
        Ok(())
    }

    /// Swap sub-buffers and read the frozen one. Returns the tags read.
    ///
    /// Producers still registered on the sub-buffer about to be handed out
    /// finish first, then every slot of the index about to be frozen is
    /// committed, as the real reader waits for both.
    pub fn swap(&mut self) -> Result<Vec<u64>, String> {
        let active = self.word.load();
        self.commit_index(active.index().wrapping_sub(1))?;
        let next = active.next().selector();
        if self.writers[next] != 0 {
            return Err(format!(
                "{} writers left on sub-buffer {} after waiting",
                self.writers[next], next
            ));
        }
        self.commit_index(active.index())?;
        self.read_frozen(false)
    }

    /// Swap without waiting for commits. `None` when the swap is postponed.
    pub fn swap_timeout(&mut self) -> Result<Option<Vec<u64>>, String> {
        let next = self.word.load().next().selector();
        if self.writers[next] != 0 {
            self.postponed += 1;
            return Ok(None);
        }
        self.read_frozen(true).map(Some)
    }

    fn read_frozen(&mut self, lossy: bool) -> Result<Vec<u64>, String> {
        let prev = self.word.swap_next();
        let index = prev.index();
        let selector = prev.selector();
        let len = prev.count().min(self.size) as usize;

        let mut tags = Vec::with_capacity(len);
        for slot in 0..len {
            if self.buffers[selector].commit[slot] != index {
                if !lossy {
                    return Err(format!(
                        "slot {} of sub-buffer {} reserved under index {} but never committed",
                        slot, selector, index
                    ));
                }
                let owner = self
                    .pending
                    .iter()
                    .flatten()
                    .find(|p| p.index == index && p.offset as usize == slot)
                    .ok_or_else(|| {
                        format!(
                            "slot {} of sub-buffer {} uncommitted with no producer holding it",
                            slot, selector
                        )
                    })?;
                self.lost_pending.insert(owner.tag);
                self.lost += 1;
                continue;
            }

            let tag = self.buffers[selector].tags[slot];
            if !self.unread.remove(&tag) {
                return Err(format!(
                    "slot {} of sub-buffer {} holds tag {} that is not pending read",
                    slot, selector, tag
                ));
            }
            if !self.read.insert(tag) {
                return Err(format!("tag {} read twice", tag));
            }
            tags.push(tag);
        }

        self.committed_this_cycle[selector] = 0;
        Ok(tags)
    }

    /// Committed slots the consumer has not read yet.
    pub fn unread(&self) -> usize {
        self.unread.len()
    }

    pub fn pending(&self) -> usize {
        self.pending.iter().map(VecDeque::len).sum()
    }

    pub fn reserved(&self) -> u64 {
        self.next_tag
    }
}

/// Execute a sequence of operations and verify invariants.
pub fn execute_and_verify(size: u32, ops: &[MpdbOp]) -> Result<(), String> {
    let mut model = MpdbModel::new(size);

    for (i, op) in ops.iter().enumerate() {
        match *op {
            MpdbOp::Reserve { producer, n } => {
                let producer = producer as usize % PRODUCERS;
                let n = n as u32 % (MAX_BATCH as u32 + 1);
                model.reserve(producer, n);
            }
            MpdbOp::Commit { producer } => {
                let producer = producer as usize % PRODUCERS;
                model
                    .commit_next(producer)
                    .map_err(|e| format!("op {}: {}", i, e))?;
            }
            MpdbOp::Swap => {
                model.swap().map_err(|e| format!("op {}: {}", i, e))?;
            }
            MpdbOp::SwapTimeout => {
                model
                    .swap_timeout()
                    .map_err(|e| format!("op {}: {}", i, e))?;
            }
        }

        verify_mpdb_invariants(&model, i)?;
    }

    // Two patient swaps resolve everything still reserved in either
    // sub-buffer, late commits included.
    model.swap().map_err(|e| format!("final swap: {}", e))?;
    model.swap().map_err(|e| format!("final swap: {}", e))?;

    if model.pending() != 0 {
        return Err(format!("{} slots still pending after drain", model.pending()));
    }
    if model.unread() != 0 {
        return Err(format!("{} committed slots never read", model.unread()));
    }
    if !model.lost_pending.is_empty() {
        return Err(format!(
            "{} lost slots never committed late",
            model.lost_pending.len()
        ));
    }
    let accounted = model.read_count() as u64 + model.dropped() + model.lost();
    if accounted != model.reserved() {
        return Err(format!(
            "read {} + dropped {} + lost {} != reserved {}",
            model.read_count(),
            model.dropped(),
            model.lost(),
            model.reserved()
        ));
    }

    Ok(())
}

fn verify_mpdb_invariants(model: &MpdbModel, op_idx: usize) -> Result<(), String> {
    // Invariant 1: the active count covers every pending slot of the active index
    let active = model.word.load();
    let pending_active = model
        .pending
        .iter()
        .flatten()
        .filter(|p| p.index == active.index())
        .count() as u32;
    if pending_active > active.count() {
        return Err(format!(
            "after op {}: {} pending slots but count is {}",
            op_idx,
            pending_active,
            active.count()
        ));
    }

    // Invariant 2: pending slots belong to the active index, or to the one
    // just frozen when a swap timed out on them
    let frozen = active.index().wrapping_sub(1);
    for p in model.pending.iter().flatten() {
        if p.index != active.index() && p.index != frozen {
            return Err(format!(
                "after op {}: slot of index {} still pending under index {}",
                op_idx,
                p.index,
                active.index()
            ));
        }
    }

    // Invariant 3: the writer counts match the reservations in progress
    for selector in 0..2 {
        let in_progress: HashSet<u64> = model
            .pending
            .iter()
            .flatten()
            .filter(|p| (p.index & 1) as usize == selector)
            .map(|p| p.reservation)
            .collect();
        if in_progress.len() as u32 != model.writers[selector] {
            return Err(format!(
                "after op {}: sub-buffer {} has {} writers but {} reservations in progress",
                op_idx,
                selector,
                model.writers[selector],
                in_progress.len()
            ));
        }
    }

    // Invariant 4: nothing is both unread and read
    if model.unread.iter().any(|t| model.read.contains(t)) {
        return Err(format!("after op {}: tag both read and unread", op_idx));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interleaved_commits() {
        let mut model = MpdbModel::new(8);
        model.reserve(0, 2);
        model.reserve(1, 2);
        model.commit_next(1).unwrap();
        model.commit_next(0).unwrap();
        model.commit_next(1).unwrap();
        model.commit_next(0).unwrap();

        let mut tags = model.swap().unwrap();
        tags.sort();
        assert_eq!(tags, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_overflow_drops_tail_of_batch() {
        let mut model = MpdbModel::new(4);
        model.reserve(0, 6);
        for _ in 0..6 {
            model.commit_next(0).unwrap();
        }
        assert_eq!(model.swap().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(model.dropped(), 2);
    }

    #[test]
    fn test_swap_waits_for_reserved_slots() {
        let mut model = MpdbModel::new(4);
        model.reserve(2, 3);
        // Nothing committed yet: the swap completes the batch first.
        assert_eq!(model.swap().unwrap(), vec![0, 1, 2]);
        assert_eq!(model.pending(), 0);
    }

    #[test]
    fn test_late_commit_holds_back_reuse() {
        let mut model = MpdbModel::new(4);
        model.reserve(0, 2);
        model.commit_next(0).unwrap();

        // The second slot times out and is skipped.
        assert_eq!(model.swap_timeout().unwrap(), Some(vec![0]));
        assert_eq!(model.lost(), 1);

        model.reserve(1, 1);
        model.commit_next(1).unwrap();
        // Producer 0 is still registered on the sub-buffer next in line.
        assert_eq!(model.swap_timeout().unwrap(), None);
        assert_eq!(model.postponed(), 1);

        model.commit_next(0).unwrap();
        assert_eq!(model.swap_timeout().unwrap(), Some(vec![2]));
        assert_eq!(model.read_count(), 2);
    }

    #[test]
    fn test_timeouts_across_wrap() {
        let mut ops = Vec::new();
        for round in 0..300u32 {
            let producer = (round % 4) as u8;
            ops.push(MpdbOp::Reserve { producer, n: 2 });
            ops.push(MpdbOp::Commit { producer });
            ops.push(MpdbOp::SwapTimeout);
            ops.push(MpdbOp::Commit { producer });
            ops.push(MpdbOp::SwapTimeout);
        }
        execute_and_verify(4, &ops).unwrap();
    }

    #[test]
    fn test_long_run_wraps_index() {
        let mut ops = Vec::new();
        for round in 0..300u32 {
            ops.push(MpdbOp::Reserve {
                producer: (round % 4) as u8,
                n: (round % 5) as u8,
            });
            ops.push(MpdbOp::Commit {
                producer: (round % 4) as u8,
            });
            ops.push(MpdbOp::Swap);
        }
        execute_and_verify(4, &ops).unwrap();
    }
}
