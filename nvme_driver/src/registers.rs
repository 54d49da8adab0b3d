// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Device register access.

use super::spec;
use std::sync::atomic::Ordering;
use std::sync::atomic::fence;
use std::time::Duration;
use user_driver::DeviceRegisterIo;
use user_driver::backoff::Backoff;
use user_driver::backoff::Deadline;

pub(crate) struct DeviceRegisters<R> {
    pub bar0: Bar0<R>,
    pub cap: spec::Cap,
}

impl<R: DeviceRegisterIo> DeviceRegisters<R> {
    pub fn new(bar0: Bar0<R>) -> Self {
        let cap = bar0.cap();
        Self { bar0, cap }
    }

    fn doorbell_offset(&self, qid: u16, completion: bool) -> usize {
        let doorbell_stride_bits = self.cap.dstrd() + 2;
        spec::DOORBELL_BASE + ((qid as usize * 2 + completion as usize) << doorbell_stride_bits)
    }

    /// Rings a doorbell. The fence orders every prior ring write before the
    /// controller can observe the new index.
    pub fn doorbell(&self, qid: u16, completion: bool, value: u32) {
        fence(Ordering::SeqCst);
        self.bar0
            .0
            .write_u32(self.doorbell_offset(qid, completion), value);
    }

    /// The worst-case time the controller may take to transition ready state,
    /// from `CAP.TO`.
    pub fn ready_timeout(&self) -> Duration {
        // TO is in 500ms units; a zero value still gets a small grace period.
        Duration::from_millis(500 * u64::from(self.cap.to()).max(1))
    }
}

pub(crate) struct Bar0<R>(pub R);

macro_rules! reg32 {
    ($get:ident, $set:ident, $reg:ident, $ty:ty) => {
        #[allow(dead_code)]
        pub fn $get(&self) -> $ty {
            <$ty>::from(self.0.read_u32(spec::Register::$reg.0 as usize))
        }
        #[allow(dead_code)]
        pub fn $set(&self, v: $ty) {
            self.0.write_u32(spec::Register::$reg.0 as usize, v.into())
        }
    };
}

macro_rules! reg64 {
    ($get:ident, $set:ident, $reg:ident, $ty:ty) => {
        #[allow(dead_code)]
        pub fn $get(&self) -> $ty {
            <$ty>::from(self.0.read_u64(spec::Register::$reg.0 as usize))
        }
        #[allow(dead_code)]
        pub fn $set(&self, v: $ty) {
            self.0.write_u64(spec::Register::$reg.0 as usize, v.into())
        }
    };
}

impl<R: DeviceRegisterIo> Bar0<R> {
    reg64!(cap, set_cap, CAP, spec::Cap);
    reg32!(vs, set_vs, VS, u32);
    reg64!(asq, set_asq, ASQ, u64);
    reg64!(acq, set_acq, ACQ, u64);
    reg32!(cc, set_cc, CC, spec::Cc);
    reg32!(csts, set_csts, CSTS, spec::Csts);
    reg32!(aqa, set_aqa, AQA, spec::Aqa);

    /// Clears `CC.EN` and waits for the controller to report not-ready.
    ///
    /// Returns false if the device appears to be gone (all-ones reads) or the
    /// wait timed out.
    pub fn reset(&self, timeout: Duration) -> bool {
        let cc = self.cc().with_en(false);
        self.set_cc(cc);
        let deadline = Deadline::after(Some(timeout));
        let mut backoff = Backoff::new();
        loop {
            let csts = self.csts();
            if u32::from(csts) == !0 {
                break false;
            }
            if !csts.rdy() {
                break true;
            }
            if deadline.expired() {
                tracing::warn!("controller reset timed out");
                break false;
            }
            backoff.back_off();
        }
    }
}
