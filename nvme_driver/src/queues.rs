// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Submission and completion rings.

use super::spec;
use crate::registers::DeviceRegisters;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Acquire;
use std::sync::atomic::Ordering::Relaxed;
use user_driver::DeviceRegisterIo;
use user_driver::memory::AtomicSliceOps;
use user_driver::memory::MemoryBlock;

pub(crate) struct SubmissionQueue {
    sqid: u16,
    head: u32,
    tail: u32,
    committed_tail: u32,
    len: u32,
    mem: MemoryBlock,
}

#[derive(Debug)]
pub(crate) struct QueueFull;

impl SubmissionQueue {
    pub fn new(sqid: u16, len: u16, mem: MemoryBlock) -> Self {
        Self {
            sqid,
            head: 0,
            tail: 0,
            committed_tail: 0,
            len: len.into(),
            mem,
        }
    }

    /// Moves the head forward per a completion's `sqhd`, releasing ring
    /// space the controller has consumed.
    pub fn update_head(&mut self, head: u16) {
        let head = head as u32;
        assert!(head < self.len);
        self.head = head;
    }

    pub fn is_full(&self) -> bool {
        advance(self.tail, self.len) == self.head
    }

    pub fn write(&mut self, command: spec::Command) -> Result<(), QueueFull> {
        let next_tail = advance(self.tail, self.len);
        if next_tail == self.head {
            return Err(QueueFull);
        }
        self.mem
            .write_obj(self.tail as usize * size_of_val(&command), &command);
        // The tail advances only now that the entry is fully written; commit
        // makes it visible to the controller.
        self.tail = next_tail;
        Ok(())
    }

    pub fn commit<R: DeviceRegisterIo>(&mut self, registers: &DeviceRegisters<R>) {
        if self.tail != self.committed_tail {
            registers.doorbell(self.sqid, false, self.tail);
            self.committed_tail = self.tail;
        }
    }
}

pub(crate) struct CompletionQueue {
    cqid: u16,
    head: u32,
    committed_head: u32,
    /// Queue size in entries.
    len: u32,
    phase: bool,
    mem: MemoryBlock,
}

impl CompletionQueue {
    pub fn new(cqid: u16, len: u16, mem: MemoryBlock) -> CompletionQueue {
        Self {
            cqid,
            head: 0,
            committed_head: 0,
            len: len.into(),
            // The ring starts zeroed, so the first pass expects phase 1.
            phase: true,
            mem,
        }
    }

    pub fn read(&mut self) -> Option<spec::Completion> {
        let completion_mem = self.mem.as_slice()
            [self.head as usize * size_of::<spec::Completion>()..]
            [..size_of::<spec::Completion>()]
            .as_atomic_u64_slice()
            .unwrap();

        // Check the phase bit, using an acquire read to ensure the rest of
        // the completion is read with or after the phase bit.
        let high = completion_mem[1].load(Acquire);
        let status = spec::CompletionStatus::from((high >> 48) as u16);
        if status.phase() != self.phase {
            return None;
        }
        let low = completion_mem[0].load(Relaxed);
        let completion: spec::Completion = zerocopy::transmute!([low, high]);
        self.head += 1;
        if self.head == self.len {
            self.head = 0;
            self.phase = !self.phase;
        }
        Some(completion)
    }

    pub fn commit<R: DeviceRegisterIo>(&mut self, registers: &DeviceRegisters<R>) {
        if self.head != self.committed_head {
            registers.doorbell(self.cqid, true, self.head);
            self.committed_head = self.head;
        }
    }
}

fn advance(n: u32, l: u32) -> u32 {
    if n + 1 < l { n + 1 } else { 0 }
}

// Keep the type in the signature above honest: the atomic view is over
// exactly one entry.
const _: () = assert!(size_of::<spec::Completion>() == 2 * size_of::<AtomicU64>());

#[cfg(test)]
mod tests {
    use super::*;
    use user_driver::memory::PAGE_SIZE;
    use user_driver::shmem::SharedMemory;
    use zerocopy::FromZeros;
    use zerocopy::IntoBytes;

    fn ring_mem(mem: &SharedMemory) -> MemoryBlock {
        MemoryBlock::new(mem.alloc(PAGE_SIZE).unwrap())
    }

    fn completion(cid: u16, phase: bool) -> spec::Completion {
        spec::Completion {
            cid,
            status: spec::CompletionStatus::new().with_phase(phase),
            ..FromZeros::new_zeroed()
        }
    }

    #[test]
    fn sq_fills_at_len_minus_one() {
        let mem = SharedMemory::new(PAGE_SIZE);
        let mut sq = SubmissionQueue::new(1, 4, ring_mem(&mem));
        for _ in 0..3 {
            sq.write(FromZeros::new_zeroed()).unwrap();
        }
        assert!(sq.is_full());
        assert!(sq.write(FromZeros::new_zeroed()).is_err());
        sq.update_head(1);
        assert!(!sq.is_full());
        sq.write(FromZeros::new_zeroed()).unwrap();
    }

    #[test]
    fn cq_phase_flips_on_wrap() {
        let mem = SharedMemory::new(PAGE_SIZE);
        let block = ring_mem(&mem);
        let mut cq = CompletionQueue::new(1, 4, block.clone());

        // Nothing posted yet.
        assert!(cq.read().is_none());

        // First pass: phase 1 entries.
        for cid in 0..4u16 {
            block.write_obj(cid as usize * 16, &completion(cid, true));
        }
        for cid in 0..4u16 {
            assert_eq!(cq.read().unwrap().cid, cid);
        }

        // Stale phase-1 entry at index 0 is not a new completion.
        assert!(cq.read().is_none());

        // Second pass flips the expected phase to 0.
        block.write_obj(0, &completion(7, false));
        assert_eq!(cq.read().unwrap().cid, 7);
    }

    #[test]
    fn cq_read_returns_full_entry() {
        let mem = SharedMemory::new(PAGE_SIZE);
        let block = ring_mem(&mem);
        let mut cq = CompletionQueue::new(1, 4, block.clone());
        let entry = spec::Completion {
            dw0: 0x1234_5678,
            dw1: 0,
            sqhd: 3,
            sqid: 1,
            cid: 0x102,
            status: spec::CompletionStatus::new()
                .with_phase(true)
                .with_status(spec::Status::LBA_OUT_OF_RANGE.0),
        };
        block.write_at(0, entry.as_bytes());
        let read = cq.read().unwrap();
        assert_eq!(read.dw0, 0x1234_5678);
        assert_eq!(read.sqhd, 3);
        assert_eq!(read.cid, 0x102);
        assert_eq!(read.status.status(), spec::Status::LBA_OUT_OF_RANGE.0);
    }
}
