// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An admin or IO queue pair and its command-slot and descriptor engines.
//!
//! One queue pair is a thread-affine resource: a single thread submits to and
//! reaps a given pair at a time (the admin pair only during open and close).
//! Submission and reaping never block; callers that need to wait spin with
//! [`Backoff`] between probes.

use super::spec;
use super::spec::nvm;
use crate::page_allocator::PageAllocator;
use crate::queues::CompletionQueue;
use crate::queues::SubmissionQueue;
use crate::registers::DeviceRegisters;
use anyhow::Context;
use slab::Slab;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use user_driver::DeviceRegisterIo;
use user_driver::DmaClient;
use user_driver::backoff::Backoff;
use user_driver::backoff::Deadline;
use user_driver::memory::MemoryBlock;
use user_driver::memory::PAGE_SIZE;
use user_driver::memory::PAGE_SIZE64;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

/// Value for unused PRP entries, to catch/mitigate buffer size mismatches.
const INVALID_PAGE_ADDR: u64 = !(PAGE_SIZE64 - 1);

/// Pages per queue for staging admin payloads.
const STAGING_PAGES: usize = 8;

/// An error issuing an NVMe request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// No command slot or descriptor is available on the queue.
    #[error("queue is full")]
    QueueFull,
    #[error("nvme error")]
    Nvme(#[source] NvmeError),
    /// The wall clock expired before the command completed. The command is
    /// still outstanding on the device.
    #[error("request timed out")]
    Timeout,
}

/// A non-zero NVMe completion status.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NvmeError(spec::Status);

impl NvmeError {
    pub fn status(&self) -> spec::Status {
        self.0
    }

    /// The process-exit convention for NVMe failures:
    /// `(status type << 8) | status code`.
    pub fn exit_code(&self) -> i32 {
        self.0.0.into()
    }
}

impl From<spec::Status> for NvmeError {
    fn from(value: spec::Status) -> Self {
        Self(value)
    }
}

impl std::error::Error for NvmeError {}

impl std::fmt::Display for NvmeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.status_code_type() {
            spec::StatusCodeType::GENERIC => write!(f, "general error {:#x?}", self.0),
            spec::StatusCodeType::COMMAND_SPECIFIC => {
                write!(f, "command-specific error {:#x?}", self.0)
            }
            spec::StatusCodeType::MEDIA_ERROR => {
                write!(f, "media error {:#x?}", self.0)
            }
            _ => write!(f, "{:#x?}", self.0),
        }
    }
}

/// The outcome of probing one descriptor.
pub(crate) enum PollOutcome {
    /// All chained sub-commands finished; command-specific DW0 of the last
    /// completion. The descriptor has been released.
    Complete(u32),
    /// Still has sub-commands in flight or waiting for slots.
    Pending,
    /// A sub-command failed; latched status. The descriptor has been
    /// released.
    Failed(NvmeError),
}

/// A request for a block I/O chain on a queue.
pub(crate) struct IoRequest {
    pub opcode: nvm::NvmOpcode,
    pub nsid: u32,
    /// Device addresses of the buffer's pages, page-aligned.
    pub pages: Vec<u64>,
    pub slba: u64,
    pub nlb: u32,
    pub block_shift: u32,
    /// Largest block count for a single sub-command.
    pub max_per_cmd: u32,
}

pub(crate) struct QueuePair<R: DeviceRegisterIo> {
    qid: u16,
    registers: Arc<DeviceRegisters<R>>,
    sq: SubmissionQueue,
    cq: CompletionQueue,
    mem: MemoryBlock,
    /// One PRP-list page per command slot.
    prp_mem: MemoryBlock,
    alloc: Arc<PageAllocator>,
    /// Slot index -> descriptor currently bound to it.
    slots: Vec<Option<usize>>,
    free_slots: Vec<u16>,
    descriptors: Slab<IoDescriptor>,
    /// Descriptors with unsubmitted sub-commands, oldest first.
    starved: VecDeque<usize>,
    issued: u64,
    completed: u64,
}

impl<R: DeviceRegisterIo> QueuePair<R> {
    /// Maximum SQ size in entries: the ring occupies a single page.
    pub const MAX_SQ_ENTRIES: u16 = (PAGE_SIZE / 64) as u16;
    /// Maximum CQ size in entries.
    pub const MAX_CQ_ENTRIES: u16 = (PAGE_SIZE / 16) as u16;

    pub fn new(
        qid: u16,
        len: u16,
        registers: Arc<DeviceRegisters<R>>,
        dma_client: &Arc<dyn DmaClient>,
    ) -> anyhow::Result<Self> {
        assert!(len >= 2 && len <= Self::MAX_SQ_ENTRIES);
        let mem = dma_client
            .allocate_dma_buffer(2 * PAGE_SIZE)
            .context("failed to allocate memory for queues")?;
        let sq = SubmissionQueue::new(qid, len, mem.subblock(0, PAGE_SIZE));
        let cq = CompletionQueue::new(qid, len, mem.subblock(PAGE_SIZE, PAGE_SIZE));

        let slot_count = len - 1;
        let prp_mem = dma_client
            .allocate_dma_buffer(slot_count as usize * PAGE_SIZE)
            .context("failed to allocate prp list pages")?;
        let alloc = Arc::new(PageAllocator::new(
            dma_client
                .allocate_dma_buffer(STAGING_PAGES * PAGE_SIZE)
                .context("failed to allocate staging pages")?,
        ));

        Ok(Self {
            qid,
            registers,
            sq,
            cq,
            mem,
            prp_mem,
            alloc,
            slots: vec![None; slot_count as usize],
            free_slots: (0..slot_count).rev().collect(),
            descriptors: Slab::with_capacity(slot_count as usize),
            starved: VecDeque::new(),
            issued: 0,
            completed: 0,
        })
    }

    pub fn sq_addr(&self) -> u64 {
        self.mem.pfns()[0] * PAGE_SIZE64
    }

    pub fn cq_addr(&self) -> u64 {
        self.mem.pfns()[1] * PAGE_SIZE64
    }

    /// Starts a read/write chain, fragmenting it into sub-commands of at
    /// most `max_per_cmd` blocks. Returns the descriptor key.
    pub fn start_io(&mut self, req: IoRequest) -> Result<usize, RequestError> {
        self.start(Payload::rw(req))
    }

    pub fn start_flush(&mut self, nsid: u32) -> Result<usize, RequestError> {
        self.start(Payload::Flush {
            nsid,
            submitted: false,
        })
    }

    fn start(&mut self, payload: Payload) -> Result<usize, RequestError> {
        if self.descriptors.len() == self.slots.len() {
            return Err(RequestError::QueueFull);
        }
        let key = self.descriptors.insert(IoDescriptor {
            payload,
            inflight: 0,
            error: None,
            dw0: 0,
            queued: false,
        });
        self.pump(key);
        self.sq.commit(&self.registers);
        Ok(key)
    }

    /// Submits as much of a descriptor's chain as free slots allow; the
    /// remainder waits for the reap path to free capacity.
    fn pump(&mut self, key: usize) {
        while self.descriptors[key].payload.has_unsubmitted() {
            let Some(slot) = self.free_slots.pop() else {
                let desc = &mut self.descriptors[key];
                if !desc.queued {
                    desc.queued = true;
                    self.starved.push_back(key);
                }
                break;
            };
            let cid = (self.qid << 8) | slot;
            let desc = &mut self.descriptors[key];
            let command = desc.payload.next_command(cid, slot, &self.prp_mem);
            // A free slot implies ring space: at most `len - 1` commands are
            // in flight, and the ring only holds commands not yet fetched.
            self.sq.write(command).expect("slot accounting covers the ring");
            self.slots[slot as usize] = Some(key);
            desc.inflight += 1;
            self.issued += 1;
        }
    }

    fn pump_starved(&mut self) {
        while !self.free_slots.is_empty() {
            let Some(key) = self.starved.pop_front() else {
                break;
            };
            // Entries go stale when a chain resolves or latches an error
            // with submissions still queued here.
            let live = self.descriptors.get(key).is_some_and(|d| d.queued);
            if !live {
                continue;
            }
            self.descriptors[key].queued = false;
            self.pump(key);
        }
    }

    /// Reaps the completion ring. Returns whether any completions arrived.
    pub fn process_completions(&mut self) -> bool {
        let mut progress = false;
        while let Some(cqe) = self.cq.read() {
            progress = true;
            self.sq.update_head(cqe.sqhd);
            debug_assert_eq!(cqe.cid >> 8, self.qid, "completion routed to wrong queue");
            let slot = (cqe.cid & 0xff) as usize;
            if cqe.status.more() {
                // More notifications follow for this command; the slot stays
                // bound until the final one.
                continue;
            }
            let key = self.slots[slot]
                .take()
                .expect("completion for an idle slot");
            self.free_slots.push(slot as u16);

            let desc = &mut self.descriptors[key];
            desc.inflight -= 1;
            desc.dw0 = cqe.dw0;
            let status = spec::Status(cqe.status.status());
            if status != spec::Status::SUCCESS {
                tracing::debug!(
                    qid = self.qid,
                    cid = cqe.cid,
                    status = ?status,
                    "command failed"
                );
                if desc.error.is_none() {
                    desc.error = Some(status);
                }
                // Suppress the unsubmitted remainder; sub-commands already in
                // flight still complete and are awaited.
                desc.payload.abandon();
            }
            self.completed += 1;

            self.pump(key);
            self.pump_starved();
        }
        if progress {
            self.cq.commit(&self.registers);
            self.sq.commit(&self.registers);
        }
        progress
    }

    /// Resolves a descriptor if its chain has fully completed, releasing it.
    pub fn resolve(&mut self, key: usize) -> PollOutcome {
        let desc = self.descriptors.get(key).expect("live descriptor key");
        if desc.inflight != 0 || desc.payload.has_unsubmitted() {
            return PollOutcome::Pending;
        }
        let desc = self.descriptors.remove(key);
        match desc.error {
            Some(status) => PollOutcome::Failed(NvmeError(status)),
            None => PollOutcome::Complete(desc.dw0),
        }
    }

    /// Reaps until the descriptor resolves or the deadline expires.
    pub fn poll_key(&mut self, key: usize, deadline: Deadline) -> PollOutcome {
        let mut backoff = Backoff::new();
        loop {
            self.process_completions();
            match self.resolve(key) {
                PollOutcome::Pending => {}
                outcome => return outcome,
            }
            if deadline.expired() {
                return PollOutcome::Pending;
            }
            backoff.back_off();
        }
    }

    /// Issues a fully built command and waits for its completion.
    pub fn issue(
        &mut self,
        command: spec::Command,
        deadline: Deadline,
    ) -> Result<u32, RequestError> {
        let key = self.start(Payload::Raw {
            command: Some(command),
        })?;
        match self.poll_key(key, deadline) {
            PollOutcome::Complete(dw0) => Ok(dw0),
            PollOutcome::Failed(err) => Err(RequestError::Nvme(err)),
            // The command stays outstanding; the descriptor is reclaimed by
            // queue teardown.
            PollOutcome::Pending => Err(RequestError::Timeout),
        }
    }

    /// Issues a command that transfers no data.
    pub fn issue_neither(
        &mut self,
        mut command: spec::Command,
        deadline: Deadline,
    ) -> Result<u32, RequestError> {
        command.dptr = [INVALID_PAGE_ADDR; 2];
        self.issue(command, deadline)
    }

    /// Issues a command whose payload the controller writes; copied out to
    /// `data` on success.
    pub fn issue_out(
        &mut self,
        mut command: spec::Command,
        data: &mut [u8],
        deadline: Deadline,
    ) -> Result<u32, RequestError> {
        let alloc = self.alloc.clone();
        let mem = alloc
            .alloc_bytes(data.len())
            .ok_or(RequestError::QueueFull)?;
        command.dptr = staging_prp(&mem);
        let dw0 = self.issue(command, deadline)?;
        mem.read(data);
        Ok(dw0)
    }

    /// Reaps until every outstanding descriptor resolves or the deadline
    /// expires. Used by controller teardown.
    pub fn drain(&mut self, deadline: Deadline) -> bool {
        let mut backoff = Backoff::new();
        loop {
            self.process_completions();
            let resolved: Vec<usize> = self
                .descriptors
                .iter()
                .filter(|(_, d)| d.inflight == 0 && !d.payload.has_unsubmitted())
                .map(|(key, _)| key)
                .collect();
            for key in resolved {
                self.descriptors.remove(key);
            }
            if self.descriptors.is_empty() {
                tracing::debug!(
                    qid = self.qid,
                    issued = self.issued,
                    completed = self.completed,
                    "queue drained"
                );
                return true;
            }
            if deadline.expired() {
                tracing::warn!(
                    qid = self.qid,
                    outstanding = self.descriptors.len(),
                    "queue drain timed out"
                );
                return false;
            }
            backoff.back_off();
        }
    }
}

fn staging_prp(mem: &crate::page_allocator::ScopedPages<'_>) -> [u64; 2] {
    match mem.page_count() {
        1 => [mem.physical_address(0), INVALID_PAGE_ADDR],
        2 => [mem.physical_address(0), mem.physical_address(1)],
        n => panic!("staging transfers above two pages unsupported: {n}"),
    }
}

struct IoDescriptor {
    payload: Payload,
    /// Sub-commands currently holding a slot.
    inflight: u16,
    error: Option<spec::Status>,
    dw0: u32,
    /// Whether the descriptor sits in the starved queue.
    queued: bool,
}

enum Payload {
    Rw {
        opcode: nvm::NvmOpcode,
        nsid: u32,
        pages: Vec<u64>,
        block_shift: u32,
        slba: u64,
        next_lba: u64,
        /// Blocks not yet submitted.
        remaining: u32,
        max_per_cmd: u32,
    },
    Flush {
        nsid: u32,
        submitted: bool,
    },
    Raw {
        command: Option<spec::Command>,
    },
}

impl Payload {
    fn rw(req: IoRequest) -> Self {
        Payload::Rw {
            opcode: req.opcode,
            nsid: req.nsid,
            pages: req.pages,
            block_shift: req.block_shift,
            slba: req.slba,
            next_lba: req.slba,
            remaining: req.nlb,
            max_per_cmd: req.max_per_cmd,
        }
    }

    fn has_unsubmitted(&self) -> bool {
        match self {
            Payload::Rw { remaining, .. } => *remaining > 0,
            Payload::Flush { submitted, .. } => !submitted,
            Payload::Raw { command } => command.is_some(),
        }
    }

    /// Drops the unsubmitted remainder after a latched error.
    fn abandon(&mut self) {
        match self {
            Payload::Rw { remaining, .. } => *remaining = 0,
            Payload::Flush { submitted, .. } => *submitted = true,
            Payload::Raw { command } => *command = None,
        }
    }

    /// Builds the next sub-command of the chain, consuming its range and
    /// writing a PRP list into the slot's page if the transfer needs one.
    fn next_command(&mut self, cid: u16, slot: u16, prp_mem: &MemoryBlock) -> spec::Command {
        match self {
            Payload::Rw {
                opcode,
                nsid,
                pages,
                block_shift,
                slba,
                next_lba,
                remaining,
                max_per_cmd,
            } => {
                let chunk = (*remaining).min(*max_per_cmd);
                let offset = ((*next_lba - *slba) << *block_shift) as usize;
                let len = (chunk as usize) << *block_shift;
                let first_page = offset / PAGE_SIZE;
                let in_page = (offset % PAGE_SIZE) as u64;
                let last_page = (offset + len - 1) / PAGE_SIZE;
                let pages = &pages[first_page..=last_page];

                let dptr = match pages {
                    [one] => [*one + in_page, INVALID_PAGE_ADDR],
                    [first, second] => [*first + in_page, *second],
                    [first, list @ ..] => {
                        let list_base = slot as usize * PAGE_SIZE;
                        prp_mem.write_at(list_base, list.as_bytes());
                        [
                            *first + in_page,
                            prp_mem.pfns()[slot as usize] * PAGE_SIZE64,
                        ]
                    }
                    [] => unreachable!("chunks are non-empty"),
                };

                let lba = *next_lba;
                *next_lba += u64::from(chunk);
                *remaining -= chunk;

                spec::Command {
                    cdw0: spec::Cdw0::new().with_opcode(opcode.0).with_cid(cid),
                    nsid: *nsid,
                    dptr,
                    cdw10: nvm::Cdw10ReadWrite::new().with_slba_low(lba as u32).into(),
                    cdw11: nvm::Cdw11ReadWrite::new()
                        .with_slba_high((lba >> 32) as u32)
                        .into(),
                    cdw12: nvm::Cdw12ReadWrite::new()
                        .with_nlb_z((chunk - 1) as u16)
                        .into(),
                    ..FromZeros::new_zeroed()
                }
            }
            Payload::Flush { nsid, submitted } => {
                *submitted = true;
                spec::Command {
                    cdw0: spec::Cdw0::new()
                        .with_opcode(nvm::NvmOpcode::FLUSH.0)
                        .with_cid(cid),
                    nsid: *nsid,
                    dptr: [INVALID_PAGE_ADDR; 2],
                    ..FromZeros::new_zeroed()
                }
            }
            Payload::Raw { command } => {
                let mut command = command.take().expect("raw command submitted once");
                command.cdw0.set_cid(cid);
                command
            }
        }
    }
}

pub(crate) fn admin_cmd(opcode: spec::AdminOpcode) -> spec::Command {
    spec::Command {
        cdw0: spec::Cdw0::new().with_opcode(opcode.0),
        ..FromZeros::new_zeroed()
    }
}
