// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The process-wide table of open devices.
//!
//! A controller is owned exclusively by this process for its lifetime, but
//! several namespace handles may share it: `open` of an already-open device
//! bumps a refcount instead of attaching twice. The table mutex covers only
//! lookup and insert; bring-up runs outside it behind an in-progress
//! sentinel.

use crate::driver::Controller;
use crate::driver::OpenError;
use crate::namespace::Namespace;
use crate::namespace::OpenOptions;
use crate::pci::PciName;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;
use user_driver::DeviceBacking;

enum DeviceSlot {
    /// Another thread is attaching this device right now.
    Opening,
    Open {
        controller: Arc<dyn Any + Send + Sync>,
        refs: usize,
    },
}

static DEVICES: OnceLock<Mutex<HashMap<String, DeviceSlot>>> = OnceLock::new();

fn devices() -> &'static Mutex<HashMap<String, DeviceSlot>> {
    DEVICES.get_or_init(Default::default)
}

/// Opens namespace `name.nsid` on the device `name`, constructing the
/// backing via `connect` only if this is the first open of that device.
pub(crate) fn open_with<T: DeviceBacking>(
    name: PciName,
    options: &OpenOptions,
    connect: impl FnOnce() -> anyhow::Result<T>,
) -> Result<Namespace<T>, OpenError> {
    let key = name.bdf();
    loop {
        let mut map = devices().lock();
        if !map.contains_key(&key) {
            map.insert(key.clone(), DeviceSlot::Opening);
            break;
        }
        match map.get_mut(&key).unwrap() {
            DeviceSlot::Opening => {
                // Lost the race; wait for the winner to finish attaching.
                drop(map);
                std::thread::yield_now();
            }
            DeviceSlot::Open { controller, refs } => {
                let controller = controller
                    .clone()
                    .downcast::<Controller<T>>()
                    .map_err(|_| OpenError::IncompatibleBacking)?;
                *refs += 1;
                drop(map);
                tracing::debug!(device = %key, nsid = name.nsid, "reusing open controller");
                return match Namespace::new(controller.clone(), key.clone(), name.nsid) {
                    Ok(ns) => Ok(ns),
                    Err(err) => {
                        if release(&key) {
                            controller.shutdown();
                        }
                        Err(err.into())
                    }
                };
            }
        }
    }

    // First opener: attach outside the table lock.
    let attached = connect()
        .map_err(OpenError::Fatal)
        .and_then(|device| Controller::new(device, options.qcount, options.qsize));
    let controller = match attached {
        Ok(controller) => Arc::new(controller),
        Err(err) => {
            devices().lock().remove(&key);
            return Err(err);
        }
    };
    devices().lock().insert(
        key.clone(),
        DeviceSlot::Open {
            controller: controller.clone(),
            refs: 1,
        },
    );
    match Namespace::new(controller.clone(), key.clone(), name.nsid) {
        Ok(ns) => Ok(ns),
        Err(err) => {
            if release(&key) {
                controller.shutdown();
            }
            Err(err.into())
        }
    }
}

/// Drops one reference to an open device. Returns true if this was the last
/// handle and the entry was removed; the caller then tears the controller
/// down.
pub(crate) fn release(key: &str) -> bool {
    let mut map = devices().lock();
    let Some(DeviceSlot::Open { refs, .. }) = map.get_mut(key) else {
        panic!("release of a device that is not open: {key}");
    };
    *refs -= 1;
    if *refs == 0 {
        map.remove(key);
        true
    } else {
        false
    }
}
