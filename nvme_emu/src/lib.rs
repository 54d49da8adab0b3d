// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An in-process NVMe controller for driver tests.
//!
//! The controller implements the BAR0 register model, admin and IO queues,
//! and PRP data transfer against a RAM disk, entirely synchronously: a
//! submission doorbell write executes the queued commands and posts their
//! completions before returning. Test hooks can defer execution to exercise
//! pending paths, inject failures, and count executed commands.

#![forbid(unsafe_code)]

use nvme_spec as spec;
use parking_lot::Mutex;
use spec::nvm;
use std::collections::BTreeMap;
use std::sync::Arc;
use user_driver::DeviceBacking;
use user_driver::DeviceRegisterIo;
use user_driver::DmaClient;
use user_driver::memory::PAGE_SIZE;
use user_driver::memory::PAGE_SIZE64;
use user_driver::shmem::SharedMemory;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

const DOORBELL_BASE: usize = 0x1000;

/// Configuration for an emulated controller.
pub struct NvmeEmuBuilder {
    pub block_count: u64,
    pub block_shift: u32,
    /// Max data transfer size as a power-of-two page count; zero means
    /// unlimited.
    pub mdts: u8,
    pub max_io_queues: u16,
    /// Max queue entries, zero based.
    pub mqes_z: u16,
    /// Shared-memory heap size for rings and buffers.
    pub mem_size: usize,
}

impl Default for NvmeEmuBuilder {
    fn default() -> Self {
        Self {
            block_count: 0x4000,
            block_shift: 9,
            mdts: 0,
            max_io_queues: 8,
            mqes_z: 63,
            mem_size: 32 << 20,
        }
    }
}

impl NvmeEmuBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block_count(mut self, count: u64) -> Self {
        self.block_count = count;
        self
    }

    pub fn mdts(mut self, mdts: u8) -> Self {
        self.mdts = mdts;
        self
    }

    pub fn max_io_queues(mut self, count: u16) -> Self {
        self.max_io_queues = count;
        self
    }

    pub fn mqes_z(mut self, mqes_z: u16) -> Self {
        self.mqes_z = mqes_z;
        self
    }

    pub fn build(self, pci_id: &str) -> EmulatedNvmeDevice {
        let disk_len = (self.block_count as usize) << self.block_shift;
        let state = ControllerState {
            cc: spec::Cc::new(),
            csts: spec::Csts::new(),
            aqa: spec::Aqa::new(),
            asq: 0,
            acq: 0,
            sqs: BTreeMap::new(),
            cqs: BTreeMap::new(),
            disk: vec![0; disk_len],
            block_count: self.block_count,
            block_shift: self.block_shift,
            mdts: self.mdts,
            max_io_queues: self.max_io_queues,
            mqes_z: self.mqes_z,
            halted: false,
            kicked: Vec::new(),
            io_commands: 0,
            fail: None,
        };
        EmulatedNvmeDevice {
            state: Arc::new(Mutex::new(state)),
            mem: SharedMemory::new(self.mem_size),
            pci_id: pci_id.to_owned(),
        }
    }
}

/// An emulated NVMe PCI function.
pub struct EmulatedNvmeDevice {
    state: Arc<Mutex<ControllerState>>,
    mem: SharedMemory,
    pci_id: String,
}

impl EmulatedNvmeDevice {
    /// Test controls, usable while the driver owns the device.
    pub fn hooks(&self) -> NvmeTestHooks {
        NvmeTestHooks {
            state: self.state.clone(),
            mem: self.mem.clone(),
        }
    }
}

impl DeviceBacking for EmulatedNvmeDevice {
    type Registers = EmulatedBar0;

    fn id(&self) -> &str {
        &self.pci_id
    }

    fn map_bar(&mut self, n: u8) -> anyhow::Result<EmulatedBar0> {
        if n != 0 {
            anyhow::bail!("invalid bar {n}");
        }
        Ok(EmulatedBar0 {
            state: self.state.clone(),
            mem: self.mem.clone(),
        })
    }

    fn dma_client(&self) -> Arc<dyn DmaClient> {
        self.mem.client()
    }
}

/// Deferred-execution and fault-injection controls.
#[derive(Clone)]
pub struct NvmeTestHooks {
    state: Arc<Mutex<ControllerState>>,
    mem: SharedMemory,
}

impl NvmeTestHooks {
    /// Stops executing submissions; doorbell writes only record the new
    /// tails until [`Self::resume`].
    pub fn halt_completions(&self) {
        self.state.lock().halted = true;
    }

    /// Executes everything rung while halted and resumes synchronous
    /// processing.
    pub fn resume(&self) {
        let mut state = self.state.lock();
        state.halted = false;
        let mut kicked = std::mem::take(&mut state.kicked);
        kicked.sort_unstable();
        kicked.dedup();
        for qid in kicked {
            state.process_sq(qid, &self.mem);
        }
    }

    /// Number of IO commands (read/write/flush) executed so far.
    pub fn io_command_count(&self) -> u64 {
        self.state.lock().io_commands
    }

    /// Fails the next `count` IO commands with `opcode` using `status`.
    pub fn fail_commands(&self, opcode: u8, status: spec::Status, count: u32) {
        self.state.lock().fail = Some(FailInjection {
            opcode,
            status,
            remaining: count,
        });
    }

    /// Whether the controller is enabled and ready.
    pub fn enabled(&self) -> bool {
        self.state.lock().csts.rdy()
    }

    /// Allocates device-visible memory outside the driver's own arena,
    /// standing in for memory the caller mapped through the container.
    pub fn alloc_external(&self, len: usize) -> user_driver::memory::MemoryBlock {
        self.mem
            .client()
            .allocate_dma_buffer(len)
            .expect("test heap exhausted")
    }

    /// Number of live IO submission queues.
    pub fn io_queue_count(&self) -> usize {
        let state = self.state.lock();
        state.sqs.keys().filter(|&&qid| qid != 0).count()
    }
}

/// The BAR0 register window handed to the driver.
pub struct EmulatedBar0 {
    state: Arc<Mutex<ControllerState>>,
    mem: SharedMemory,
}

impl DeviceRegisterIo for EmulatedBar0 {
    fn len(&self) -> usize {
        DOORBELL_BASE + 0x1000
    }

    fn read_u32(&self, offset: usize) -> u32 {
        let state = self.state.lock();
        match offset {
            0x0 => state.cap() as u32,
            0x4 => (state.cap() >> 32) as u32,
            0x8 => 0x0001_0400, // VS 1.4
            0x14 => state.cc.into(),
            0x1c => state.csts.into(),
            0x24 => state.aqa.into(),
            0x28 => state.asq as u32,
            0x2c => (state.asq >> 32) as u32,
            0x30 => state.acq as u32,
            0x34 => (state.acq >> 32) as u32,
            _ => 0,
        }
    }

    fn read_u64(&self, offset: usize) -> u64 {
        let state = self.state.lock();
        match offset {
            0x0 => state.cap(),
            0x28 => state.asq,
            0x30 => state.acq,
            _ => {
                drop(state);
                u64::from(self.read_u32(offset)) | u64::from(self.read_u32(offset + 4)) << 32
            }
        }
    }

    fn write_u32(&self, offset: usize, data: u32) {
        let mut state = self.state.lock();
        match offset {
            0x14 => state.write_cc(data),
            0x24 => state.aqa = data.into(),
            0x28 => state.asq = state.asq & !0xffff_ffff | u64::from(data),
            0x2c => state.asq = state.asq & 0xffff_ffff | u64::from(data) << 32,
            0x30 => state.acq = state.acq & !0xffff_ffff | u64::from(data),
            0x34 => state.acq = state.acq & 0xffff_ffff | u64::from(data) << 32,
            _ if offset >= DOORBELL_BASE => state.write_doorbell(offset, data, &self.mem),
            _ => {}
        }
    }

    fn write_u64(&self, offset: usize, data: u64) {
        match offset {
            0x28 => self.state.lock().asq = data,
            0x30 => self.state.lock().acq = data,
            _ => {
                self.write_u32(offset, data as u32);
                self.write_u32(offset + 4, (data >> 32) as u32);
            }
        }
    }
}

struct SqState {
    base: u64,
    len: u16,
    head: u16,
    tail: u16,
    cqid: u16,
}

struct CqState {
    base: u64,
    len: u16,
    tail: u16,
    /// Consumer head, from the CQ doorbell.
    head: u16,
    phase: bool,
}

struct FailInjection {
    opcode: u8,
    status: spec::Status,
    remaining: u32,
}

struct ControllerState {
    cc: spec::Cc,
    csts: spec::Csts,
    aqa: spec::Aqa,
    asq: u64,
    acq: u64,
    /// Submission queues by qid; 0 is admin.
    sqs: BTreeMap<u16, SqState>,
    cqs: BTreeMap<u16, CqState>,
    disk: Vec<u8>,
    block_count: u64,
    block_shift: u32,
    mdts: u8,
    max_io_queues: u16,
    mqes_z: u16,
    halted: bool,
    kicked: Vec<u16>,
    io_commands: u64,
    fail: Option<FailInjection>,
}

impl ControllerState {
    fn cap(&self) -> u64 {
        spec::Cap::new()
            .with_mqes_z(self.mqes_z)
            .with_to(1)
            .with_dstrd(0)
            .with_css_nvm(true)
            .into()
    }

    fn write_cc(&mut self, data: u32) {
        let new: spec::Cc = data.into();
        let was_enabled = self.cc.en();
        self.cc = new;
        if new.en() && !was_enabled {
            // Latch the admin queue registers and come ready.
            self.sqs.insert(
                0,
                SqState {
                    base: self.asq,
                    len: self.aqa.asqs_z() + 1,
                    head: 0,
                    tail: 0,
                    cqid: 0,
                },
            );
            self.cqs.insert(
                0,
                CqState {
                    base: self.acq,
                    len: self.aqa.acqs_z() + 1,
                    tail: 0,
                    head: 0,
                    phase: true,
                },
            );
            self.csts.set_rdy(true);
            tracing::debug!("emulated controller enabled");
        } else if !new.en() && was_enabled {
            self.sqs.clear();
            self.cqs.clear();
            self.kicked.clear();
            self.csts.set_rdy(false);
            tracing::debug!("emulated controller reset");
        }
    }

    fn write_doorbell(&mut self, offset: usize, data: u32, mem: &SharedMemory) {
        let index = (offset - DOORBELL_BASE) >> 2;
        let qid = (index / 2) as u16;
        if index % 2 == 1 {
            if let Some(cq) = self.cqs.get_mut(&qid) {
                cq.head = data as u16;
            }
        } else if let Some(sq) = self.sqs.get_mut(&qid) {
            sq.tail = data as u16;
            if self.halted {
                self.kicked.push(qid);
            } else {
                self.process_sq(qid, mem);
            }
        }
    }

    fn process_sq(&mut self, qid: u16, mem: &SharedMemory) {
        loop {
            let (command, sqhd) = {
                let Some(sq) = self.sqs.get_mut(&qid) else {
                    return;
                };
                if sq.head == sq.tail {
                    return;
                }
                let mut bytes = [0u8; 64];
                mem.read_at(sq.base + u64::from(sq.head) * 64, &mut bytes);
                sq.head = if sq.head + 1 < sq.len { sq.head + 1 } else { 0 };
                let command = spec::Command::read_from_bytes(&bytes).unwrap();
                (command, sq.head)
            };

            let (status, dw0) = if qid == 0 {
                self.execute_admin(&command, mem)
            } else {
                self.execute_io(&command, mem)
            };

            let cqid = self.sqs[&qid].cqid;
            self.post_completion(
                cqid,
                spec::Completion {
                    dw0,
                    dw1: 0,
                    sqhd,
                    sqid: qid,
                    cid: command.cdw0.cid(),
                    status: spec::CompletionStatus::new().with_status(status.0),
                },
                mem,
            );
        }
    }

    fn post_completion(&mut self, cqid: u16, mut entry: spec::Completion, mem: &SharedMemory) {
        let cq = self.cqs.get_mut(&cqid).expect("sq posts to a live cq");
        debug_assert_ne!(
            (cq.tail + 1) % cq.len,
            cq.head,
            "completion queue overflow"
        );
        entry.status.set_phase(cq.phase);
        let addr = cq.base + u64::from(cq.tail) * 16;
        // Phase lives in the high quadword; write it last.
        let bytes = entry.as_bytes();
        mem.write_at(addr, &bytes[..8]);
        mem.write_at(addr + 8, &bytes[8..]);
        cq.tail += 1;
        if cq.tail == cq.len {
            cq.tail = 0;
            cq.phase = !cq.phase;
        }
    }

    fn execute_admin(&mut self, command: &spec::Command, mem: &SharedMemory) -> (spec::Status, u32) {
        let opcode = spec::AdminOpcode(command.cdw0.opcode());
        match opcode {
            spec::AdminOpcode::IDENTIFY => {
                let cns = spec::Cns((command.cdw10 & 0xff) as u8);
                let payload = match cns {
                    spec::Cns::CONTROLLER => self.identify_controller(),
                    spec::Cns::NAMESPACE => self.identify_namespace(command.nsid),
                    _ => return (spec::Status::INVALID_FIELD_IN_COMMAND, 0),
                };
                self.dma_to_host(command.dptr, &payload, mem);
                (spec::Status::SUCCESS, 0)
            }
            spec::AdminOpcode::SET_FEATURES | spec::AdminOpcode::GET_FEATURES => {
                let fid = spec::Feature((command.cdw10 & 0xff) as u8);
                match fid {
                    spec::Feature::NUMBER_OF_QUEUES => {
                        let requested = spec::Cdw11FeatureNumberOfQueues::from(command.cdw11);
                        let granted_sq = requested.nsq_z().min(self.max_io_queues - 1);
                        let granted_cq = requested.ncq_z().min(self.max_io_queues - 1);
                        let dw0 = spec::Cdw11FeatureNumberOfQueues::new()
                            .with_nsq_z(granted_sq)
                            .with_ncq_z(granted_cq);
                        (spec::Status::SUCCESS, dw0.into())
                    }
                    _ => (spec::Status::INVALID_FIELD_IN_COMMAND, 0),
                }
            }
            spec::AdminOpcode::CREATE_IO_COMPLETION_QUEUE => {
                let cdw10 = spec::Cdw10CreateIoQueue::from(command.cdw10);
                let qid = cdw10.qid();
                if qid == 0 || qid > self.max_io_queues || self.cqs.contains_key(&qid) {
                    return (spec::Status::INVALID_QUEUE_IDENTIFIER, 0);
                }
                let len = cdw10.qsize_z() + 1;
                if len < 2 || cdw10.qsize_z() > self.mqes_z {
                    return (spec::Status::INVALID_QUEUE_SIZE, 0);
                }
                self.cqs.insert(
                    qid,
                    CqState {
                        base: command.dptr[0],
                        len,
                        tail: 0,
                        head: 0,
                        phase: true,
                    },
                );
                (spec::Status::SUCCESS, 0)
            }
            spec::AdminOpcode::CREATE_IO_SUBMISSION_QUEUE => {
                let cdw10 = spec::Cdw10CreateIoQueue::from(command.cdw10);
                let cdw11 = spec::Cdw11CreateIoSubmissionQueue::from(command.cdw11);
                let qid = cdw10.qid();
                if qid == 0 || qid > self.max_io_queues || self.sqs.contains_key(&qid) {
                    return (spec::Status::INVALID_QUEUE_IDENTIFIER, 0);
                }
                let len = cdw10.qsize_z() + 1;
                if len < 2 || cdw10.qsize_z() > self.mqes_z {
                    return (spec::Status::INVALID_QUEUE_SIZE, 0);
                }
                if !self.cqs.contains_key(&cdw11.cqid()) {
                    return (spec::Status::COMPLETION_QUEUE_INVALID, 0);
                }
                self.sqs.insert(
                    qid,
                    SqState {
                        base: command.dptr[0],
                        len,
                        head: 0,
                        tail: 0,
                        cqid: cdw11.cqid(),
                    },
                );
                (spec::Status::SUCCESS, 0)
            }
            spec::AdminOpcode::DELETE_IO_SUBMISSION_QUEUE => {
                let qid = spec::Cdw10DeleteIoQueue::from(command.cdw10).qid();
                if qid == 0 || self.sqs.remove(&qid).is_none() {
                    return (spec::Status::INVALID_QUEUE_IDENTIFIER, 0);
                }
                (spec::Status::SUCCESS, 0)
            }
            spec::AdminOpcode::DELETE_IO_COMPLETION_QUEUE => {
                let qid = spec::Cdw10DeleteIoQueue::from(command.cdw10).qid();
                if qid == 0 || !self.cqs.contains_key(&qid) {
                    return (spec::Status::INVALID_QUEUE_IDENTIFIER, 0);
                }
                if self.sqs.values().any(|sq| sq.cqid == qid) {
                    return (spec::Status::INVALID_QUEUE_DELETION, 0);
                }
                self.cqs.remove(&qid);
                (spec::Status::SUCCESS, 0)
            }
            _ => (spec::Status::INVALID_COMMAND_OPCODE, 0),
        }
    }

    fn execute_io(&mut self, command: &spec::Command, mem: &SharedMemory) -> (spec::Status, u32) {
        let opcode = command.cdw0.opcode();
        if let Some(fail) = &mut self.fail {
            if fail.opcode == opcode && fail.remaining > 0 {
                fail.remaining -= 1;
                let status = fail.status;
                self.io_commands += 1;
                return (status, 0);
            }
        }
        match nvm::NvmOpcode(opcode) {
            nvm::NvmOpcode::FLUSH => {
                self.io_commands += 1;
                (spec::Status::SUCCESS, 0)
            }
            nvm::NvmOpcode::READ | nvm::NvmOpcode::WRITE => {
                let slba = u64::from(command.cdw10) | u64::from(command.cdw11) << 32;
                let nlb = u64::from(command.cdw12 as u16) + 1;
                if slba + nlb > self.block_count {
                    return (spec::Status::LBA_OUT_OF_RANGE, 0);
                }
                self.io_commands += 1;
                let offset = (slba << self.block_shift) as usize;
                let len = (nlb << self.block_shift) as usize;
                let segments = prp_segments(command.dptr, len, mem);
                let mut pos = offset;
                for (addr, seg_len) in segments {
                    if nvm::NvmOpcode(opcode) == nvm::NvmOpcode::READ {
                        mem.write_at(addr, &self.disk[pos..pos + seg_len]);
                    } else {
                        mem.read_at(addr, &mut self.disk[pos..pos + seg_len]);
                    }
                    pos += seg_len;
                }
                (spec::Status::SUCCESS, 0)
            }
            _ => (spec::Status::INVALID_COMMAND_OPCODE, 0),
        }
    }

    fn dma_to_host(&self, dptr: [u64; 2], data: &[u8], mem: &SharedMemory) {
        let mut pos = 0;
        for (addr, len) in prp_segments(dptr, data.len(), mem) {
            mem.write_at(addr, &data[pos..pos + len]);
            pos += len;
        }
    }

    fn identify_controller(&self) -> Vec<u8> {
        let mut identify = spec::IdentifyController::new_zeroed();
        identify.vid = 0x1b36;
        identify.ssvid = 0x1b36;
        write_ascii_padded(&mut identify.sn.0, "EMU00000000000001");
        write_ascii_padded(&mut identify.mn.0, "NVME EMULATED CTRL");
        write_ascii_padded(&mut identify.fr.0, "1.0");
        identify.mdts = self.mdts;
        identify.cntlid = 1;
        identify.ver = 0x0001_0400;
        identify.nn = 1;
        identify.sqes = spec::QueueEntrySize::new().with_min(6).with_max(6);
        identify.cqes = spec::QueueEntrySize::new().with_min(4).with_max(4);
        identify.as_bytes().to_vec()
    }

    fn identify_namespace(&self, nsid: u32) -> Vec<u8> {
        let mut identify = nvm::IdentifyNamespace::new_zeroed();
        if nsid == 1 {
            identify.nsze = self.block_count;
            identify.ncap = self.block_count;
            identify.nuse = self.block_count;
            identify.nlbaf = 0;
            identify.lbaf[0] = nvm::Lbaf::new().with_lbads(self.block_shift as u8);
        }
        // Unknown namespaces identify as zero-sized.
        identify.as_bytes().to_vec()
    }
}

/// Resolves a command's PRP entries into `(address, length)` transfer
/// segments covering `len` bytes.
fn prp_segments(dptr: [u64; 2], len: usize, mem: &SharedMemory) -> Vec<(u64, usize)> {
    let mut segments = Vec::new();
    let first_off = (dptr[0] % PAGE_SIZE64) as usize;
    let first_len = len.min(PAGE_SIZE - first_off);
    segments.push((dptr[0], first_len));
    let mut remaining = len - first_len;
    if remaining == 0 {
        return segments;
    }

    if remaining <= PAGE_SIZE {
        // PRP2 points directly at the second (final) page.
        segments.push((dptr[1], remaining));
        return segments;
    }

    // PRP2 points at a list of page entries.
    let mut list_addr = dptr[1];
    while remaining > 0 {
        let mut entry = [0u8; 8];
        mem.read_at(list_addr, &mut entry);
        let addr = u64::from_le_bytes(entry);
        let seg = remaining.min(PAGE_SIZE);
        segments.push((addr, seg));
        remaining -= seg;
        list_addr += 8;
    }
    segments
}

fn write_ascii_padded(dst: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(dst.len());
    dst[..n].copy_from_slice(&bytes[..n]);
    dst[n..].fill(b' ');
}

#[cfg(test)]
mod tests {
    use super::*;
    use user_driver::memory::MappedDmaTarget;

    fn enabled_controller() -> (EmulatedBar0, SharedMemory, NvmeTestHooks) {
        let mut device = NvmeEmuBuilder::new().build("00:01.0");
        let hooks = device.hooks();
        let mem = device.mem.clone();
        let bar = device.map_bar(0).unwrap();

        // Admin rings: SQ at page 0, CQ at page 1 of a fresh buffer.
        let rings = mem.alloc(2 * PAGE_SIZE).unwrap();
        let sq_base = rings.pfns()[0] * PAGE_SIZE64;
        let cq_base = rings.pfns()[1] * PAGE_SIZE64;
        std::mem::forget(rings);
        bar.write_u32(0x24, u32::from(spec::Aqa::new().with_asqs_z(31).with_acqs_z(31)));
        bar.write_u64(0x28, sq_base);
        bar.write_u64(0x30, cq_base);
        bar.write_u32(0x14, u32::from(spec::Cc::new().with_en(true)));
        assert!(spec::Csts::from(bar.read_u32(0x1c)).rdy());
        (bar, mem, hooks)
    }

    #[test]
    fn identify_roundtrip_through_admin_queue() {
        let (bar, mem, _hooks) = enabled_controller();
        let sq_base = bar.state.lock().sqs[&0].base;
        let cq_base = bar.state.lock().cqs[&0].base;

        let payload = mem.alloc(PAGE_SIZE).unwrap();
        let payload_addr = payload.pfns()[0] * PAGE_SIZE64;
        let command = spec::Command {
            cdw0: spec::Cdw0::new()
                .with_opcode(spec::AdminOpcode::IDENTIFY.0)
                .with_cid(7),
            cdw10: spec::Cdw10Identify::new()
                .with_cns(spec::Cns::CONTROLLER.0)
                .into(),
            dptr: [payload_addr, 0],
            ..FromZeros::new_zeroed()
        };
        mem.write_at(sq_base, command.as_bytes());
        bar.write_u32(DOORBELL_BASE, 1);

        let mut cqe = [0u8; 16];
        mem.read_at(cq_base, &mut cqe);
        let completion = spec::Completion::read_from_bytes(&cqe).unwrap();
        assert_eq!(completion.cid, 7);
        assert!(completion.status.phase());
        assert_eq!(completion.status.status(), 0);

        let mut ident = [0u8; 4096];
        mem.read_at(payload_addr, &mut ident);
        let ident = spec::IdentifyController::read_from_bytes(&ident).unwrap();
        assert_eq!(ident.nn, 1);
        assert_eq!(ident.sn.as_str().unwrap(), "EMU00000000000001");
    }

    #[test]
    fn halted_controller_defers_processing() {
        let (bar, mem, hooks) = enabled_controller();
        let sq_base = bar.state.lock().sqs[&0].base;
        let cq_base = bar.state.lock().cqs[&0].base;

        hooks.halt_completions();
        let command = spec::Command {
            cdw0: spec::Cdw0::new()
                .with_opcode(spec::AdminOpcode::SET_FEATURES.0)
                .with_cid(3),
            cdw10: spec::Cdw10SetFeatures::new()
                .with_fid(spec::Feature::NUMBER_OF_QUEUES.0)
                .into(),
            cdw11: spec::Cdw11FeatureNumberOfQueues::new()
                .with_nsq_z(3)
                .with_ncq_z(3)
                .into(),
            ..FromZeros::new_zeroed()
        };
        mem.write_at(sq_base, command.as_bytes());
        bar.write_u32(DOORBELL_BASE, 1);

        let mut cqe = [0u8; 16];
        mem.read_at(cq_base, &mut cqe);
        assert!(cqe.iter().all(|&b| b == 0), "completed while halted");

        hooks.resume();
        mem.read_at(cq_base, &mut cqe);
        let completion = spec::Completion::read_from_bytes(&cqe).unwrap();
        assert_eq!(completion.cid, 3);
        let granted = spec::Cdw11FeatureNumberOfQueues::from(completion.dw0);
        assert_eq!(granted.nsq_z(), 3);
    }
}
