// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Controller attach, bring-up, and teardown.

use super::spec;
use super::spec::nvm;
use crate::dma::DmaArena;
use crate::queue_pair::QueuePair;
use crate::queue_pair::RequestError;
use crate::queue_pair::admin_cmd;
use crate::registers::Bar0;
use crate::registers::DeviceRegisters;
use anyhow::Context;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use user_driver::DeviceBacking;
use user_driver::DmaClient;
use user_driver::backoff::Backoff;
use user_driver::backoff::Deadline;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

/// Wall-clock bound for a single admin command.
const ADMIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Wall-clock bound for draining in-flight IO at close.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// An error attaching to a device.
#[derive(Debug, Error)]
pub enum OpenError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The controller did not reach the requested state within `CAP.TO`.
    #[error("device timed out during bring-up")]
    Timeout,
    /// The device is already open through a different backing type.
    #[error("device is already open with an incompatible backing")]
    IncompatibleBacking,
    #[error("failed to open namespace")]
    Namespace(#[from] crate::namespace::NamespaceError),
    #[error("controller bring-up failed")]
    Fatal(#[source] anyhow::Error),
}

/// An exclusive attachment to one NVMe controller.
pub struct Controller<T: DeviceBacking> {
    device_id: String,
    registers: Arc<DeviceRegisters<T::Registers>>,
    admin: Mutex<QueuePair<T::Registers>>,
    io: Vec<Mutex<QueuePair<T::Registers>>>,
    arena: DmaArena,
    identify: Arc<spec::IdentifyController>,
    qsize: u16,
    /// Keeps the backing (and with it the register and DMA mappings) alive
    /// for the controller's lifetime. Never locked after bring-up.
    _device: Mutex<T>,
}

impl<T: DeviceBacking> Controller<T> {
    /// Attaches to `device`, resets and enables the controller, and creates
    /// the IO queues.
    ///
    /// `requested_qcount`/`requested_qsize` of zero mean "device maximum".
    pub(crate) fn new(
        mut device: T,
        requested_qcount: u16,
        requested_qsize: u16,
    ) -> Result<Self, OpenError> {
        let device_id = device.id().to_owned();
        tracing::info!(pci_id = %device_id, "attaching nvme controller");

        let bar0 = Bar0(
            device
                .map_bar(0)
                .context("failed to map device registers")
                .map_err(OpenError::Fatal)?,
        );
        let registers = Arc::new(DeviceRegisters::new(bar0));
        if u64::from(registers.cap) == !0u64 {
            return Err(OpenError::Fatal(anyhow::anyhow!("device is gone")));
        }
        if registers.cap.mpsmin() != 0 {
            return Err(OpenError::Fatal(anyhow::anyhow!(
                "unsupported minimum page size: 2^{}",
                registers.cap.mpsmin() + crate::NVME_PAGE_SHIFT
            )));
        }
        if registers.cap.mqes_z() == 0 {
            return Err(OpenError::Fatal(anyhow::anyhow!(
                "bad device behavior, mqes cannot be 0"
            )));
        }

        let ready_timeout = registers.ready_timeout();
        if registers.bar0.cc().en() || registers.bar0.csts().rdy() {
            tracing::debug!(pci_id = %device_id, "controller already enabled, resetting");
            if !registers.bar0.reset(ready_timeout) {
                return Err(OpenError::Timeout);
            }
        }

        let dma_client = device.dma_client();
        let arena = DmaArena::new(dma_client.clone());

        // Admin submission and completion rings use the same depth.
        let admin_len = QueuePair::<T::Registers>::MAX_SQ_ENTRIES
            .min(QueuePair::<T::Registers>::MAX_CQ_ENTRIES);
        let mut admin = QueuePair::new(0, admin_len, registers.clone(), &dma_client)
            .context("failed to create admin queue pair")
            .map_err(OpenError::Fatal)?;

        // Register the admin queue and enable the controller.
        registers.bar0.set_aqa(
            spec::Aqa::new()
                .with_asqs_z(admin_len - 1)
                .with_acqs_z(admin_len - 1),
        );
        registers.bar0.set_asq(admin.sq_addr());
        registers.bar0.set_acq(admin.cq_addr());
        registers.bar0.set_cc(
            spec::Cc::new()
                .with_iocqes(4)
                .with_iosqes(6)
                .with_mps(0)
                .with_en(true),
        );

        let deadline = Deadline::after(Some(ready_timeout));
        let mut backoff = Backoff::new();
        loop {
            let csts = registers.bar0.csts();
            if u32::from(csts) == !0 {
                return Err(OpenError::Fatal(anyhow::anyhow!("device is gone")));
            }
            if csts.cfs() {
                registers.bar0.reset(ready_timeout);
                return Err(OpenError::Fatal(anyhow::anyhow!("device had fatal error")));
            }
            if csts.rdy() {
                break;
            }
            if deadline.expired() {
                return Err(OpenError::Timeout);
            }
            backoff.back_off();
        }

        // Get the controller identify structure.
        let mut identify = spec::IdentifyController::new_zeroed();
        admin
            .issue_out(
                spec::Command {
                    cdw10: spec::Cdw10Identify::new()
                        .with_cns(spec::Cns::CONTROLLER.0)
                        .into(),
                    ..admin_cmd(spec::AdminOpcode::IDENTIFY)
                },
                identify.as_mut_bytes(),
                Deadline::after(Some(ADMIN_TIMEOUT)),
            )
            .map_err(|err| {
                registers.bar0.reset(ready_timeout);
                bring_up_error(err, "failed to identify controller")
            })?;
        let identify = Arc::new(identify);
        tracing::info!(
            pci_id = %device_id,
            model = %identify.mn,
            serial = %identify.sn,
            firmware = %identify.fr,
            mdts = identify.mdts,
            "identified controller"
        );

        // Configure the number of IO queues and see how many the controller
        // actually grants.
        let requested = if requested_qcount == 0 {
            MAX_QCOUNT
        } else {
            requested_qcount
        };
        let dw0 = admin
            .issue_neither(
                spec::Command {
                    cdw10: spec::Cdw10SetFeatures::new()
                        .with_fid(spec::Feature::NUMBER_OF_QUEUES.0)
                        .into(),
                    cdw11: spec::Cdw11FeatureNumberOfQueues::new()
                        .with_nsq_z(requested - 1)
                        .with_ncq_z(requested - 1)
                        .into(),
                    ..admin_cmd(spec::AdminOpcode::SET_FEATURES)
                },
                Deadline::after(Some(ADMIN_TIMEOUT)),
            )
            .map_err(|err| {
                registers.bar0.reset(ready_timeout);
                bring_up_error(err, "failed to set number of queues")
            })?;
        let dw0 = spec::Cdw11FeatureNumberOfQueues::from(dw0);
        let granted = (dw0.nsq_z() + 1).min(dw0.ncq_z() + 1);

        let qcount = if requested_qcount == 0 {
            granted.min(MAX_QCOUNT)
        } else if requested_qcount <= granted {
            requested_qcount
        } else {
            tracing::warn!(
                requested_qcount,
                granted,
                "controller granted fewer io queues than requested"
            );
            registers.bar0.reset(ready_timeout);
            return Err(OpenError::InvalidArgument("qcount exceeds device maximum"));
        };

        let max_qsize = (QueuePair::<T::Registers>::MAX_SQ_ENTRIES - 1)
            .min(registers.cap.mqes_z())
            + 1;
        let qsize = if requested_qsize == 0 {
            max_qsize
        } else if requested_qsize <= max_qsize {
            requested_qsize
        } else {
            registers.bar0.reset(ready_timeout);
            return Err(OpenError::InvalidArgument("qsize exceeds device maximum"));
        };

        // Create the IO queue pairs. Numbering starts at 1; 0 is admin.
        let mut io: Vec<Mutex<QueuePair<T::Registers>>> = Vec::new();
        for qid in 1..=qcount {
            match create_io_queue(&mut admin, qid, qsize, &registers, &dma_client) {
                Ok(queue) => io.push(Mutex::new(queue)),
                Err(err) => {
                    tracing::error!(
                        pci_id = %device_id,
                        qid,
                        error = err.as_ref() as &dyn std::error::Error,
                        "io queue creation failed, tearing down"
                    );
                    delete_io_queues(&mut admin, io.len() as u16);
                    registers.bar0.reset(ready_timeout);
                    return Err(OpenError::Fatal(err));
                }
            }
        }
        tracing::info!(pci_id = %device_id, qcount, qsize, "controller ready");

        Ok(Self {
            device_id,
            registers,
            admin: Mutex::new(admin),
            io,
            arena,
            identify,
            qsize,
            _device: Mutex::new(device),
        })
    }

    pub(crate) fn device_id(&self) -> &str {
        &self.device_id
    }

    pub(crate) fn identify(&self) -> &Arc<spec::IdentifyController> {
        &self.identify
    }

    pub(crate) fn arena(&self) -> &DmaArena {
        &self.arena
    }

    pub(crate) fn qsize(&self) -> u16 {
        self.qsize
    }

    pub(crate) fn queue_count(&self) -> u16 {
        self.io.len() as u16
    }

    pub(crate) fn max_queue_count(&self) -> u16 {
        MAX_QCOUNT
    }

    pub(crate) fn max_qsize(&self) -> u16 {
        (QueuePair::<T::Registers>::MAX_SQ_ENTRIES - 1).min(self.registers.cap.mqes_z()) + 1
    }

    /// The IO queue for a zero-based client queue index.
    pub(crate) fn io_queue(&self, qid: u16) -> Option<&Mutex<QueuePair<T::Registers>>> {
        self.io.get(qid as usize)
    }

    /// Queries the identify structure for namespace `nsid`.
    pub(crate) fn identify_namespace(
        &self,
        nsid: u32,
    ) -> Result<nvm::IdentifyNamespace, RequestError> {
        let mut identify = nvm::IdentifyNamespace::new_zeroed();
        self.admin.lock().issue_out(
            spec::Command {
                nsid,
                cdw10: spec::Cdw10Identify::new()
                    .with_cns(spec::Cns::NAMESPACE.0)
                    .into(),
                ..admin_cmd(spec::AdminOpcode::IDENTIFY)
            },
            identify.as_mut_bytes(),
            Deadline::after(Some(ADMIN_TIMEOUT)),
        )?;
        Ok(identify)
    }

    /// Drains in-flight IO, deletes the IO queues, and disables the
    /// controller. Called when the last namespace handle closes.
    pub(crate) fn shutdown(&self) {
        tracing::info!(pci_id = %self.device_id, "shutting down nvme controller");
        let deadline = Deadline::after(Some(DRAIN_TIMEOUT));
        for queue in &self.io {
            queue.lock().drain(deadline);
        }
        delete_io_queues(&mut self.admin.lock(), self.io.len() as u16);
        self.registers.bar0.reset(self.registers.ready_timeout());
    }
}

/// The library's ceiling on IO queue count; `cid` routing reserves the low
/// byte for the slot index.
const MAX_QCOUNT: u16 = 255;

fn bring_up_error(err: RequestError, msg: &'static str) -> OpenError {
    match err {
        RequestError::Timeout => OpenError::Timeout,
        err => OpenError::Fatal(anyhow::Error::new(err).context(msg)),
    }
}

fn create_io_queue<R: user_driver::DeviceRegisterIo>(
    admin: &mut QueuePair<R>,
    qid: u16,
    qsize: u16,
    registers: &Arc<DeviceRegisters<R>>,
    dma_client: &Arc<dyn DmaClient>,
) -> anyhow::Result<QueuePair<R>> {
    tracing::debug!(qid, qsize, "creating io queue pair");
    let queue = QueuePair::new(qid, qsize, registers.clone(), dma_client)
        .with_context(|| format!("failed to allocate io queue pair {qid}"))?;

    // The completion queue must exist before the submission queue that posts
    // to it. The reference path polls, so interrupts stay disabled.
    admin
        .issue(
            spec::Command {
                cdw10: spec::Cdw10CreateIoQueue::new()
                    .with_qid(qid)
                    .with_qsize_z(qsize - 1)
                    .into(),
                cdw11: spec::Cdw11CreateIoCompletionQueue::new()
                    .with_ien(false)
                    .with_pc(true)
                    .into(),
                dptr: [queue.cq_addr(), 0],
                ..admin_cmd(spec::AdminOpcode::CREATE_IO_COMPLETION_QUEUE)
            },
            Deadline::after(Some(ADMIN_TIMEOUT)),
        )
        .map_err(anyhow::Error::new)
        .with_context(|| format!("failed to create io completion queue {qid}"))?;

    if let Err(err) = admin
        .issue(
            spec::Command {
                cdw10: spec::Cdw10CreateIoQueue::new()
                    .with_qid(qid)
                    .with_qsize_z(qsize - 1)
                    .into(),
                cdw11: spec::Cdw11CreateIoSubmissionQueue::new()
                    .with_cqid(qid)
                    .with_pc(true)
                    .into(),
                dptr: [queue.sq_addr(), 0],
                ..admin_cmd(spec::AdminOpcode::CREATE_IO_SUBMISSION_QUEUE)
            },
            Deadline::after(Some(ADMIN_TIMEOUT)),
        )
        .map_err(anyhow::Error::new)
        .with_context(|| format!("failed to create io submission queue {qid}"))
    {
        if let Err(delete_err) = admin.issue_neither(
            spec::Command {
                cdw10: spec::Cdw10DeleteIoQueue::new().with_qid(qid).into(),
                ..admin_cmd(spec::AdminOpcode::DELETE_IO_COMPLETION_QUEUE)
            },
            Deadline::after(Some(ADMIN_TIMEOUT)),
        ) {
            tracing::error!(
                qid,
                error = &delete_err as &dyn std::error::Error,
                "failed to delete completion queue in teardown path"
            );
        }
        return Err(err);
    }

    Ok(queue)
}

/// Deletes IO queue pairs `1..=count` in reverse order, submission queue
/// first. Best effort; failures are logged.
fn delete_io_queues<R: user_driver::DeviceRegisterIo>(admin: &mut QueuePair<R>, count: u16) {
    for qid in (1..=count).rev() {
        for opcode in [
            spec::AdminOpcode::DELETE_IO_SUBMISSION_QUEUE,
            spec::AdminOpcode::DELETE_IO_COMPLETION_QUEUE,
        ] {
            if let Err(err) = admin.issue_neither(
                spec::Command {
                    cdw10: spec::Cdw10DeleteIoQueue::new().with_qid(qid).into(),
                    ..admin_cmd(opcode)
                },
                Deadline::after(Some(ADMIN_TIMEOUT)),
            ) {
                tracing::error!(
                    qid,
                    opcode = opcode.0,
                    error = &err as &dyn std::error::Error,
                    "failed to delete io queue"
                );
            }
        }
    }
}
