// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::DmaBuffer;
use crate::IoStatus;
use crate::IoTicket;
use crate::Namespace;
use crate::NotOwned;
use crate::OpenError;
use crate::OpenOptions;
use crate::RequestError;
use nvme_emu::EmulatedNvmeDevice;
use nvme_emu::NvmeEmuBuilder;
use nvme_emu::NvmeTestHooks;
use nvme_spec::Status;
use nvme_spec::nvm::NvmOpcode;
use std::time::Duration;

const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Each test opens its own fake PCI function so the process-wide open-device
/// table never aliases devices across tests.
fn open_emu(
    name: &str,
    options: OpenOptions,
    builder: NvmeEmuBuilder,
) -> (Namespace<EmulatedNvmeDevice>, NvmeTestHooks) {
    let device = builder.build(name.split('/').next().unwrap());
    let hooks = device.hooks();
    let ns = crate::open_with(name, &options, move || Ok(device)).unwrap();
    (ns, hooks)
}

fn pattern(seed: u64, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (seed.wrapping_mul(31).wrapping_add(i as u64) % 251) as u8)
        .collect()
}

fn await_io(ns: &Namespace<EmulatedNvmeDevice>, ticket: IoTicket) -> u32 {
    match ns.poll(ticket, POLL_TIMEOUT).unwrap() {
        IoStatus::Complete(dw0) => dw0,
        IoStatus::Pending(_) => panic!("io did not complete in time"),
    }
}

fn write_buf(buf: &DmaBuffer, data: &[u8]) {
    buf.write_at(0, data);
}

fn read_buf(buf: &DmaBuffer, len: usize) -> Vec<u8> {
    let mut data = vec![0; len];
    buf.read_at(0, &mut data);
    data
}

#[test]
fn round_trip_single_page() {
    let (ns, _hooks) = open_emu("a1:00.0", OpenOptions::default(), NvmeEmuBuilder::new());
    assert_eq!(ns.block_size(), 512);
    assert_eq!(ns.nsid(), 1);

    let nlb = ns.blocks_per_page();
    let buf = ns.alloc(4096).unwrap();
    let data = vec![0xa5; 4096];
    write_buf(&buf, &data);

    let ticket = ns.begin_write(0, &buf, 0, nlb).unwrap();
    await_io(&ns, ticket);

    write_buf(&buf, &[0; 4096]);
    let ticket = ns.begin_read(0, &buf, 0, nlb).unwrap();
    await_io(&ns, ticket);
    assert_eq!(read_buf(&buf, 4096), data);

    ns.free(buf).unwrap();
}

#[test]
fn fragmented_io_is_transparent() {
    // mdts 2 => 4 pages per command => 32 blocks of 512.
    let (ns, hooks) = open_emu(
        "a2:00.0",
        OpenOptions::default(),
        NvmeEmuBuilder::new().mdts(2),
    );
    let max = ns.max_transfer_block_count();
    assert_eq!(max, 32);

    // A write of 4 * max splits into exactly four sub-commands.
    let len = (4 * max as usize) << ns.block_shift();
    let buf = ns.alloc(len).unwrap();
    let data = pattern(2, len);
    write_buf(&buf, &data);
    let before = hooks.io_command_count();
    let ticket = ns.begin_write(0, &buf, 0, 4 * max).unwrap();
    await_io(&ns, ticket);
    assert_eq!(hooks.io_command_count() - before, 4);
    ns.free(buf).unwrap();

    // Any size up to 8 * max behaves like a bounded-size IO.
    for nlb in [1, max - 1, max, max + 1, 3 * max + 7, 8 * max] {
        let len = (nlb as usize) << ns.block_shift();
        let buf = ns.alloc(len).unwrap();
        let data = pattern(u64::from(nlb), len);
        write_buf(&buf, &data);
        let ticket = ns.begin_write(0, &buf, 7, nlb).unwrap();
        await_io(&ns, ticket);

        write_buf(&buf, &vec![0; len]);
        let ticket = ns.begin_read(0, &buf, 7, nlb).unwrap();
        await_io(&ns, ticket);
        assert_eq!(read_buf(&buf, len), data, "nlb={nlb}");
        ns.free(buf).unwrap();
    }
}

#[test]
fn starved_chains_fill_slots_as_they_free() {
    // Three command slots, 32-block sub-commands: chains longer than the
    // slot pool must trickle in behind the reap path.
    let (ns, _hooks) = open_emu(
        "ae:00.0",
        OpenOptions {
            qcount: 1,
            qsize: 4,
        },
        NvmeEmuBuilder::new().mdts(2),
    );
    let max = ns.max_transfer_block_count();
    assert_eq!(ns.max_io_per_queue(), 3);

    // First chain takes every slot; the second starts fully starved.
    let len_a = (3 * max as usize) << ns.block_shift();
    let len_b = (2 * max as usize) << ns.block_shift();
    let buf_a = ns.alloc(len_a).unwrap();
    let buf_b = ns.alloc(len_b).unwrap();
    let data_a = pattern(3, len_a);
    let data_b = pattern(4, len_b);
    write_buf(&buf_a, &data_a);
    write_buf(&buf_b, &data_b);

    let a = ns.begin_write(0, &buf_a, 0, 3 * max).unwrap();
    let b = ns.begin_write(0, &buf_b, 4096, 2 * max).unwrap();
    await_io(&ns, b);
    await_io(&ns, a);

    write_buf(&buf_a, &vec![0; len_a]);
    write_buf(&buf_b, &vec![0; len_b]);
    let a = ns.begin_read(0, &buf_a, 0, 3 * max).unwrap();
    let b = ns.begin_read(0, &buf_b, 4096, 2 * max).unwrap();
    await_io(&ns, a);
    await_io(&ns, b);
    assert_eq!(read_buf(&buf_a, len_a), data_a);
    assert_eq!(read_buf(&buf_b, len_b), data_b);

    ns.free(buf_a).unwrap();
    ns.free(buf_b).unwrap();
}

#[test]
fn concurrent_queues_are_isolated() {
    let (ns, _hooks) = open_emu(
        "a3:00.0",
        OpenOptions {
            qcount: 4,
            qsize: 0,
        },
        NvmeEmuBuilder::new(),
    );
    assert_eq!(ns.queue_count(), 4);

    std::thread::scope(|scope| {
        for qid in 0..4u16 {
            let ns = &ns;
            scope.spawn(move || {
                let lba_base = u64::from(qid) * 1024;
                let buf = ns.alloc(4096).unwrap();
                let nlb = ns.blocks_per_page();
                for iter in 0..200u64 {
                    let data = pattern(u64::from(qid) << 32 | iter, 4096);
                    write_buf(&buf, &data);
                    ns.write(qid, &buf, lba_base, nlb).unwrap();
                    write_buf(&buf, &[0; 4096]);
                    ns.read(qid, &buf, lba_base, nlb).unwrap();
                    assert_eq!(read_buf(&buf, 4096), data, "qid={qid} iter={iter}");
                }
                ns.free(buf).unwrap();
            });
        }
    });

    // The per-queue ranges still hold their last writes: nothing crossed.
    let buf = ns.alloc(4096).unwrap();
    for qid in 0..4u16 {
        let expected = pattern(u64::from(qid) << 32 | 199, 4096);
        ns.read(0, &buf, u64::from(qid) * 1024, ns.blocks_per_page())
            .unwrap();
        assert_eq!(read_buf(&buf, 4096), expected, "qid={qid}");
    }
    ns.free(buf).unwrap();
}

#[test]
fn slot_saturation_and_recovery() {
    let (ns, hooks) = open_emu(
        "a4:00.0",
        OpenOptions {
            qcount: 1,
            qsize: 16,
        },
        NvmeEmuBuilder::new(),
    );
    assert_eq!(ns.queue_size(), 16);
    assert_eq!(ns.max_io_per_queue(), 15);

    let buf = ns.alloc(4096).unwrap();
    hooks.halt_completions();

    // Fifteen writes fill every slot; the sixteenth is out of resources.
    let mut tickets = Vec::new();
    for i in 0..15u64 {
        tickets.push(ns.begin_write(0, &buf, i, 1).unwrap());
    }
    match ns.begin_write(0, &buf, 15, 1) {
        Err(RequestError::QueueFull) => {}
        other => panic!("expected queue-full, got {other:?}"),
    }

    // Freeing one descriptor lets a new submit in.
    hooks.resume();
    await_io(&ns, tickets.remove(0));
    tickets.push(ns.begin_write(0, &buf, 15, 1).unwrap());
    for ticket in tickets {
        await_io(&ns, ticket);
    }

    // Slot conservation: all slots came back, so a full burst fits again.
    let burst: Vec<_> = (0..15u64)
        .map(|i| ns.begin_write(0, &buf, i, 1).unwrap())
        .collect();
    for ticket in burst {
        await_io(&ns, ticket);
    }
    ns.free(buf).unwrap();
}

#[test]
fn invalid_arguments_leave_device_untouched() {
    let (ns, hooks) = open_emu("a5:00.0", OpenOptions::default(), NvmeEmuBuilder::new());
    let (other_ns, _other_hooks) =
        open_emu("a6:00.0", OpenOptions::default(), NvmeEmuBuilder::new());

    let buf = ns.alloc(4096).unwrap();
    let foreign = other_ns.alloc(4096).unwrap();
    let before = hooks.io_command_count();

    // Zero-length IO.
    assert!(matches!(
        ns.begin_read(0, &buf, 0, 0),
        Err(RequestError::InvalidArgument(_))
    ));
    // Range past the end of the namespace.
    assert!(matches!(
        ns.begin_read(0, &buf, ns.block_count() - 1, 2),
        Err(RequestError::InvalidArgument(_))
    ));
    assert!(matches!(
        ns.begin_write(0, &buf, u64::MAX, 1),
        Err(RequestError::InvalidArgument(_))
    ));
    // Queue index out of range.
    assert!(matches!(
        ns.begin_read(999, &buf, 0, 1),
        Err(RequestError::InvalidArgument(_))
    ));
    assert!(matches!(
        ns.begin_flush(999),
        Err(RequestError::InvalidArgument(_))
    ));
    // Buffer from another controller's arena.
    assert!(matches!(
        ns.begin_read(0, &foreign, 0, 1),
        Err(RequestError::InvalidArgument(_))
    ));
    // Buffer smaller than the transfer.
    assert!(matches!(
        ns.begin_read(0, &buf, 0, ns.blocks_per_page() + 1),
        Err(RequestError::InvalidArgument(_))
    ));

    // Nothing reached the device.
    assert_eq!(hooks.io_command_count(), before);

    // Freeing a foreign buffer reports not-owned and returns it intact.
    let NotOwned(foreign) = ns.free(foreign).unwrap_err();
    other_ns.free(foreign).unwrap();
    ns.free(buf).unwrap();
}

#[test]
fn zero_timeout_poll_probes_without_freeing() {
    let (ns, hooks) = open_emu("a7:00.0", OpenOptions::default(), NvmeEmuBuilder::new());
    let buf = ns.alloc(4096).unwrap();

    hooks.halt_completions();
    let ticket = ns.begin_write(0, &buf, 0, 1).unwrap();

    // Not complete yet: the probe hands the ticket back.
    let ticket = match ns.poll(ticket, Duration::ZERO).unwrap() {
        IoStatus::Pending(ticket) => ticket,
        IoStatus::Complete(_) => panic!("completed while halted"),
    };

    hooks.resume();
    match ns.poll(ticket, Duration::ZERO).unwrap() {
        IoStatus::Complete(_) => {}
        IoStatus::Pending(_) => panic!("still pending after resume"),
    }
    ns.free(buf).unwrap();
}

#[test]
fn refcounted_open_tears_down_once() {
    let (first, hooks) = open_emu("a8:00.0", OpenOptions::default(), NvmeEmuBuilder::new());
    assert!(hooks.enabled());
    let queues = hooks.io_queue_count();
    assert!(queues > 0);

    // Second open of the same device shares the controller: the backing
    // connector must not run again.
    let second: Namespace<EmulatedNvmeDevice> =
        crate::open_with("a8:00.0", &OpenOptions::default(), || {
            panic!("device already open, connect must not be called")
        })
        .unwrap();

    drop(first);
    assert!(hooks.enabled(), "controller closed with a live handle");
    assert_eq!(hooks.io_queue_count(), queues);

    // The surviving handle still does IO.
    let buf = second.alloc(4096).unwrap();
    second.write(0, &buf, 0, 1).unwrap();
    second.free(buf).unwrap();

    drop(second);
    assert!(!hooks.enabled(), "last close must disable the controller");
    assert_eq!(hooks.io_queue_count(), 0, "io queues must be deleted");
}

#[test]
fn latched_error_resolves_fragmented_io() {
    let (ns, hooks) = open_emu(
        "a9:00.0",
        OpenOptions::default(),
        NvmeEmuBuilder::new().mdts(2),
    );
    let max = ns.max_transfer_block_count();
    let len = (4 * max as usize) << ns.block_shift();
    let buf = ns.alloc(len).unwrap();

    hooks.fail_commands(NvmOpcode::WRITE.0, Status::MEDIA_WRITE_FAULT, 1);
    let ticket = ns.begin_write(0, &buf, 0, 4 * max).unwrap();
    match ns.poll(ticket, POLL_TIMEOUT) {
        Err(RequestError::Nvme(err)) => {
            assert_eq!(err.status(), Status::MEDIA_WRITE_FAULT);
            // Exit-code convention: (status type << 8) | status code.
            assert_eq!(err.exit_code(), 0x280);
        }
        other => panic!("expected latched media error, got {other:?}"),
    }

    // The failed chain released its descriptor and slots.
    let ticket = ns.begin_write(0, &buf, 0, 4 * max).unwrap();
    await_io(&ns, ticket);
    ns.free(buf).unwrap();
}

#[test]
fn sync_wrappers_round_trip() {
    let (ns, _hooks) = open_emu("aa:00.0", OpenOptions::default(), NvmeEmuBuilder::new());
    let len = 2 * 4096;
    let buf = ns.alloc(len).unwrap();
    let data = pattern(7, len);
    write_buf(&buf, &data);

    ns.write(1, &buf, 128, 2 * ns.blocks_per_page()).unwrap();
    ns.flush(1).unwrap();
    write_buf(&buf, &vec![0; len]);
    ns.read(1, &buf, 128, 2 * ns.blocks_per_page()).unwrap();
    assert_eq!(read_buf(&buf, len), data);
    ns.free(buf).unwrap();
}

#[test]
fn translated_region_streams_chunks() {
    let (ns, hooks) = open_emu(
        "ab:00.0",
        OpenOptions::default(),
        NvmeEmuBuilder::new().mdts(2),
    );
    let max = ns.max_transfer_block_count();
    let slba = 64;

    // Seed the window the device serves translated data from.
    let window_len = (max as usize) << ns.block_shift();
    let seed_buf = ns.alloc(window_len).unwrap();
    let window = pattern(11, window_len);
    write_buf(&seed_buf, &window);
    ns.write(0, &seed_buf, slba, max).unwrap();
    ns.free(seed_buf).unwrap();

    let nlb = 3 * max + 7;
    let len = (nlb as usize) << ns.block_shift();
    let buf = ns.alloc(len).unwrap();
    // The configuration block occupies the head of the buffer when sent.
    let config = pattern(13, ns.block_size() as usize);
    write_buf(&buf, &config);

    let before = hooks.io_command_count();
    ns.read_translated_region(0, &buf, slba, nlb, 1).unwrap();
    // One configuration write plus one read per chunk.
    assert_eq!(
        hooks.io_command_count() - before,
        1 + u64::from(nlb.div_ceil(max))
    );

    // The RAM disk applies the configuration write in place, so each chunk
    // observes the window with its first block replaced by the config block.
    let mut expected = window.clone();
    expected[..config.len()].copy_from_slice(&config);
    let chunk_bytes = (max as usize) << ns.block_shift();
    let out = read_buf(&buf, len);
    for (i, chunk) in out.chunks(chunk_bytes).enumerate() {
        assert_eq!(chunk, &expected[..chunk.len()], "chunk {i}");
    }
    ns.free(buf).unwrap();
}

#[test]
fn mapped_external_memory_works_as_io_buffer() {
    let (ns, hooks) = open_emu("ad:00.0", OpenOptions::default(), NvmeEmuBuilder::new());

    // Memory mapped by the caller through the container, not ns.alloc.
    let mapped = ns.map_existing(hooks.alloc_external(4096));
    let data = pattern(17, 4096);
    mapped.write_at(0, &data);
    let ticket = ns.begin_write(0, &mapped, 32, ns.blocks_per_page()).unwrap();
    await_io(&ns, ticket);

    let buf = ns.alloc(4096).unwrap();
    ns.read(0, &buf, 32, ns.blocks_per_page()).unwrap();
    assert_eq!(read_buf(&buf, 4096), data);

    ns.free(buf).unwrap();
    ns.free(mapped).unwrap();
}

#[test]
fn open_rejects_bad_arguments() {
    // Queue depth one cannot hold an outstanding command.
    let err = crate::open_with::<EmulatedNvmeDevice, _>(
        "b0:00.0",
        &OpenOptions {
            qcount: 0,
            qsize: 1,
        },
        || unreachable!("invalid options must fail before connect"),
    )
    .unwrap_err();
    assert!(matches!(err, OpenError::InvalidArgument(_)));

    // Malformed device names.
    for name in ["", "nvme0", "01-00.0", "01:00.0/0"] {
        let err = crate::open_with::<EmulatedNvmeDevice, _>(
            name,
            &OpenOptions::default(),
            || unreachable!("invalid name must fail before connect"),
        )
        .unwrap_err();
        assert!(matches!(err, OpenError::InvalidArgument(_)), "{name}");
    }

    // More IO queues than the device can grant.
    let device = NvmeEmuBuilder::new().max_io_queues(2).build("b1:00.0");
    let err = crate::open_with(
        "b1:00.0",
        &OpenOptions {
            qcount: 3,
            qsize: 0,
        },
        move || Ok(device),
    )
    .unwrap_err();
    assert!(matches!(err, OpenError::InvalidArgument(_)));
}

#[test]
fn missing_namespace_fails_open_and_releases_device() {
    let device = NvmeEmuBuilder::new().build("b2:00.0");
    let hooks = device.hooks();
    let err = crate::open_with("b2:00.0/2", &OpenOptions::default(), move || Ok(device)).unwrap_err();
    assert!(matches!(err, OpenError::Namespace(_)), "{err:?}");
    assert!(!hooks.enabled(), "failed open must release the device");

    // The device name is free again afterwards.
    let device = NvmeEmuBuilder::new().build("b2:00.0");
    let ns: Namespace<EmulatedNvmeDevice> =
        crate::open_with("b2:00.0", &OpenOptions::default(), move || Ok(device)).unwrap();
    drop(ns);
}
