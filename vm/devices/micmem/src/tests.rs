// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! End-to-end transfers against the emulated device.

use crate::ChannelSlot;
use crate::ChannelState;
use crate::DeviceContext;
use crate::DeviceContextConfig;
use crate::DmaError;
use crate::DmaTimeouts;
use crate::InvalidArgument;
use crate::MappedRange;
use crate::PAGE_SIZE64;
use crate::PinnedRegion;
use crate::TransferMode;
use crate::emulated::EmulatedDevice;
use crate::emulated::HOST_VIRT_BASE;
use crate::hardware::HostPinner;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use test_with_tracing::test;

const PAGE: u64 = PAGE_SIZE64;
const DEVICE_ADDR: u64 = 0x10_0000;

struct Fixture {
    device: Arc<EmulatedDevice>,
    ctx: DeviceContext,
    region: Arc<PinnedRegion>,
}

impl Fixture {
    fn new(runs: &[u64]) -> Self {
        let device = Arc::new(EmulatedDevice::new("mic0", runs, 1 << 22));
        let ctx = DeviceContext::open(
            device.clone(),
            DeviceContextConfig {
                timeouts: DmaTimeouts {
                    completion: Duration::from_millis(50),
                    channel_acquire: Duration::from_secs(1),
                },
            },
        )
        .unwrap();
        let region = Arc::new(device.pin(HOST_VIRT_BASE, device.host_len()).unwrap());
        Self {
            device,
            ctx,
            region,
        }
    }

    fn map_all(&self) -> MappedRange {
        self.ctx
            .map_range(&self.region, 0, self.region.len())
            .unwrap()
    }

    fn handle(&self, slot: ChannelSlot) -> crate::hardware::ChannelHandle {
        self.ctx.channel_handle(slot)
    }

    fn all_free(&self) -> bool {
        self.ctx
            .channel_states()
            .iter()
            .all(|&(_, state)| state == ChannelState::Free)
    }
}

fn pattern(len: u64, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31) ^ seed).collect()
}

#[test]
fn round_trip_through_device() {
    let f = Fixture::new(&[3, 2, 3]);
    let range = f.map_all();
    assert_eq!(range.chunks().len(), 3);

    let data = pattern(8 * PAGE, 0x5a);
    f.device.write_host(HOST_VIRT_BASE, &data).unwrap();
    f.ctx
        .host_to_device(DEVICE_ADDR, &range, 0, 8 * PAGE, TransferMode::Single)
        .unwrap();

    let mut on_device = vec![0; data.len()];
    f.device.read_device(DEVICE_ADDR, &mut on_device).unwrap();
    assert_eq!(on_device, data);

    f.device
        .write_host(HOST_VIRT_BASE, &vec![0; data.len()])
        .unwrap();
    f.ctx
        .device_to_host(&range, 0, DEVICE_ADDR, 8 * PAGE, TransferMode::Dual)
        .unwrap();

    let mut back = vec![0; data.len()];
    f.device.read_host(HOST_VIRT_BASE, &mut back).unwrap();
    assert_eq!(back, data);
    assert!(f.all_free());

    f.ctx.unmap_range(range);
    assert_eq!(f.device.aperture_mappings(), 0);
}

#[test]
fn offset_transfer_moves_only_the_window() {
    let f = Fixture::new(&[3, 2, 3]);
    let range = f.map_all();
    let data = pattern(8 * PAGE, 0x11);
    f.device.write_host(HOST_VIRT_BASE, &data).unwrap();

    f.ctx
        .host_to_device(DEVICE_ADDR, &range, 2 * PAGE, 4 * PAGE, TransferMode::Auto)
        .unwrap();

    let mut on_device = vec![0; (6 * PAGE) as usize];
    f.device.read_device(DEVICE_ADDR, &mut on_device).unwrap();
    assert_eq!(
        on_device[..(4 * PAGE) as usize],
        data[(2 * PAGE) as usize..(6 * PAGE) as usize]
    );
    assert!(on_device[(4 * PAGE) as usize..].iter().all(|&b| b == 0));
    f.ctx.unmap_range(range);
}

#[test]
fn single_chunk_transfer_is_one_request() {
    let f = Fixture::new(&[8]);
    let range = f.map_all();
    f.ctx
        .host_to_device(DEVICE_ADDR, &range, PAGE, 3 * PAGE, TransferMode::Single)
        .unwrap();

    let submissions = f.device.submissions();
    assert_eq!(submissions.len(), 1);
    let s = &submissions[0];
    assert_eq!(s.channel, f.handle(ChannelSlot::HostToDevice));
    assert_eq!(s.request.src, range.chunks()[0].aperture + PAGE);
    assert_eq!(s.request.dst, DEVICE_ADDR);
    assert_eq!(s.request.len, 3 * PAGE);
    assert!(s.request.want_cookie);
    f.ctx.unmap_range(range);
}

#[test]
fn single_channel_cookie_only_on_last_request() {
    let f = Fixture::new(&[3, 2, 3]);
    let range = f.map_all();
    f.ctx
        .device_to_host(&range, 2 * PAGE, DEVICE_ADDR, 4 * PAGE, TransferMode::Single)
        .unwrap();

    let submissions = f.device.submissions();
    let lens: Vec<_> = submissions.iter().map(|s| s.request.len / PAGE).collect();
    assert_eq!(lens, [1, 2, 1]);
    let cookies: Vec<_> = submissions.iter().map(|s| s.request.want_cookie).collect();
    assert_eq!(cookies, [false, false, true]);
    assert!(
        submissions
            .iter()
            .all(|s| s.channel == f.handle(ChannelSlot::DeviceToHost))
    );

    // Device addresses advance contiguously, host addresses follow the chunks.
    let chunks = range.chunks();
    let srcs: Vec<_> = submissions.iter().map(|s| s.request.src).collect();
    assert_eq!(srcs, [DEVICE_ADDR, DEVICE_ADDR + PAGE, DEVICE_ADDR + 3 * PAGE]);
    let dsts: Vec<_> = submissions.iter().map(|s| s.request.dst).collect();
    assert_eq!(
        dsts,
        [
            chunks[0].aperture + 2 * PAGE,
            chunks[1].aperture,
            chunks[2].aperture
        ]
    );
    f.ctx.unmap_range(range);
}

#[test]
fn dual_channel_alternates_by_chunk_parity() {
    let f = Fixture::new(&[1, 1, 1, 1, 1]);
    let range = f.map_all();
    let data = pattern(5 * PAGE, 0x77);
    f.device.write_host(HOST_VIRT_BASE, &data).unwrap();
    f.ctx
        .host_to_device(DEVICE_ADDR, &range, 0, 5 * PAGE, TransferMode::Dual)
        .unwrap();

    let primary = f.handle(ChannelSlot::HostToDevice);
    let secondary = f.handle(ChannelSlot::HostToDeviceSecondary);
    let submissions = f.device.submissions();
    let channels: Vec<_> = submissions.iter().map(|s| s.channel).collect();
    assert_eq!(
        channels,
        [secondary, primary, secondary, primary, secondary]
    );
    let cookies: Vec<_> = submissions.iter().map(|s| s.request.want_cookie).collect();
    assert_eq!(cookies, [false, false, false, true, true]);

    let mut on_device = vec![0; data.len()];
    f.device.read_device(DEVICE_ADDR, &mut on_device).unwrap();
    assert_eq!(on_device, data);
    assert!(f.all_free());
    f.ctx.unmap_range(range);
}

#[test]
fn dual_channel_two_chunks_one_cookie_each() {
    let f = Fixture::new(&[2, 2]);
    let range = f.map_all();
    f.ctx
        .device_to_host(&range, PAGE, DEVICE_ADDR, 2 * PAGE, TransferMode::Dual)
        .unwrap();

    let submissions = f.device.submissions();
    assert_eq!(submissions.len(), 2);
    assert_eq!(submissions[0].channel, f.handle(ChannelSlot::DeviceToHost));
    assert_eq!(
        submissions[1].channel,
        f.handle(ChannelSlot::DeviceToHostSecondary)
    );
    assert!(submissions.iter().all(|s| s.request.want_cookie));
    assert_eq!(submissions[0].request.len, PAGE);
    assert_eq!(submissions[1].request.len, PAGE);
    f.ctx.unmap_range(range);
}

#[test]
fn dual_channel_single_chunk_uses_primary() {
    let f = Fixture::new(&[4, 4]);
    let range = f.map_all();
    f.ctx
        .host_to_device(DEVICE_ADDR, &range, 4 * PAGE, 2 * PAGE, TransferMode::Dual)
        .unwrap();

    let submissions = f.device.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].channel, f.handle(ChannelSlot::HostToDevice));
    assert_eq!(submissions[0].request.src, range.chunks()[1].aperture);
    assert!(f.all_free());
    f.ctx.unmap_range(range);
}

#[test]
fn out_of_bounds_transfer_submits_nothing() {
    let f = Fixture::new(&[3, 2, 3]);
    let range = f.ctx.map_range(&f.region, 0, 4 * PAGE).unwrap();
    let err = f
        .ctx
        .host_to_device(DEVICE_ADDR, &range, 2 * PAGE, 3 * PAGE, TransferMode::Single)
        .unwrap_err();
    assert!(matches!(
        err,
        DmaError::InvalidArgument(InvalidArgument::TransferOutOfRange { .. })
    ));
    assert_eq!(err.errno(), crate::errno::EINVAL);
    assert!(f.device.submissions().is_empty());
    assert!(f.all_free());
    f.ctx.unmap_range(range);
}

#[test]
fn unaligned_and_empty_transfers_rejected() {
    let f = Fixture::new(&[4]);
    let range = f.map_all();
    for (device_addr, offset, len) in [
        (DEVICE_ADDR + 1, 0, PAGE),
        (DEVICE_ADDR, 0x200, PAGE),
        (DEVICE_ADDR, 0, PAGE + 8),
    ] {
        let err = f
            .ctx
            .host_to_device(device_addr, &range, offset, len, TransferMode::Single)
            .unwrap_err();
        assert!(matches!(
            err,
            DmaError::InvalidArgument(InvalidArgument::Unaligned { .. })
        ));
    }
    let err = f
        .ctx
        .host_to_device(DEVICE_ADDR, &range, 0, 0, TransferMode::Single)
        .unwrap_err();
    assert!(matches!(
        err,
        DmaError::InvalidArgument(InvalidArgument::Empty { .. })
    ));
    assert!(f.device.submissions().is_empty());
    f.ctx.unmap_range(range);
}

#[test]
fn range_from_another_context_rejected() {
    let f = Fixture::new(&[4]);
    let other = DeviceContext::open(f.device.clone(), DeviceContextConfig::default()).unwrap();
    let range = other.map_range(&f.region, 0, PAGE).unwrap();
    let err = f
        .ctx
        .host_to_device(DEVICE_ADDR, &range, 0, PAGE, TransferMode::Single)
        .unwrap_err();
    assert!(matches!(
        err,
        DmaError::InvalidArgument(InvalidArgument::ForeignRange)
    ));
    other.unmap_range(range);
    drop(other);
    assert_eq!(f.device.allocated_channels(), 4);
}

#[test]
fn map_failure_rolls_back() {
    let f = Fixture::new(&[1, 1, 1]);
    f.device.faults().fail_map_at = Some(2);
    let err = f.ctx.map_range(&f.region, 0, 3 * PAGE).unwrap_err();
    assert!(matches!(err, DmaError::ApertureMap { .. }));
    assert_eq!(err.errno(), crate::errno::ENOMEM);
    assert_eq!(f.device.aperture_mappings(), 0);

    // Later mappings are unaffected.
    let range = f.ctx.map_range(&f.region, 0, 3 * PAGE).unwrap();
    assert_eq!(f.device.aperture_mappings(), 3);
    f.ctx.unmap_range(range);
    assert_eq!(f.device.aperture_mappings(), 0);
}

#[test]
fn timeout_quarantines_until_recovered() {
    let f = Fixture::new(&[2, 2]);
    let range = f.map_all();
    f.device.faults().stall_completions = true;

    let start = Instant::now();
    let err = f
        .ctx
        .host_to_device(DEVICE_ADDR, &range, 0, 4 * PAGE, TransferMode::Single)
        .unwrap_err();
    assert!(start.elapsed() >= Duration::from_millis(50));
    assert!(matches!(
        err,
        DmaError::Timeout {
            slot: ChannelSlot::HostToDevice
        }
    ));
    assert_eq!(err.errno(), crate::errno::ETIMEDOUT);
    assert_eq!(
        f.ctx.channel_states()[1],
        (ChannelSlot::HostToDevice, ChannelState::Quarantined)
    );

    // The quarantined channel refuses work; the other direction still runs.
    f.device.faults().stall_completions = false;
    let err = f
        .ctx
        .host_to_device(DEVICE_ADDR, &range, 0, PAGE, TransferMode::Single)
        .unwrap_err();
    assert!(matches!(
        err,
        DmaError::ChannelTainted {
            slot: ChannelSlot::HostToDevice
        }
    ));
    f.ctx
        .device_to_host(&range, 0, DEVICE_ADDR, PAGE, TransferMode::Single)
        .unwrap();

    // Recovery waits for the hardware to confirm the abandoned request.
    assert!(matches!(
        f.ctx.recover_channel(ChannelSlot::HostToDevice),
        Err(DmaError::ChannelTainted { .. })
    ));
    f.device.complete_stalled();
    f.ctx.recover_channel(ChannelSlot::HostToDevice).unwrap();
    f.ctx
        .host_to_device(DEVICE_ADDR, &range, 0, PAGE, TransferMode::Single)
        .unwrap();
    assert!(f.all_free());
    f.ctx.unmap_range(range);
}

#[test]
fn dual_timeout_abandons_both_channels() {
    let f = Fixture::new(&[1, 1, 1]);
    let range = f.map_all();
    f.device.faults().stall_completions = true;

    let err = f
        .ctx
        .host_to_device(DEVICE_ADDR, &range, 0, 3 * PAGE, TransferMode::Dual)
        .unwrap_err();
    assert!(matches!(
        err,
        DmaError::Timeout {
            slot: ChannelSlot::HostToDevice
        }
    ));
    let states = f.ctx.channel_states();
    assert_eq!(states[1].1, ChannelState::Quarantined);
    assert_eq!(states[3].1, ChannelState::Quarantined);
    assert_eq!(states[0].1, ChannelState::Free);

    f.ctx.unmap_range(range);
    let device = f.device.clone();
    let report = f.ctx.close();
    assert_eq!(
        report.leaked,
        [
            ChannelSlot::HostToDevice,
            ChannelSlot::HostToDeviceSecondary
        ]
    );
    assert_eq!(
        report.freed,
        [
            ChannelSlot::DeviceToHost,
            ChannelSlot::DeviceToHostSecondary
        ]
    );
    assert_eq!(device.allocated_channels(), 2);
    assert_eq!(device.references(), 0);
}

#[test]
fn dual_second_channel_times_out_on_its_own_deadline() {
    let f = Fixture::new(&[1, 1, 1]);
    let range = f.map_all();
    f.device.faults().stall_channel = Some(f.handle(ChannelSlot::HostToDeviceSecondary));

    let start = Instant::now();
    let err = f
        .ctx
        .host_to_device(DEVICE_ADDR, &range, 0, 3 * PAGE, TransferMode::Dual)
        .unwrap_err();
    assert!(start.elapsed() >= Duration::from_millis(50));
    assert!(matches!(
        err,
        DmaError::Timeout {
            slot: ChannelSlot::HostToDeviceSecondary
        }
    ));

    // The primary channel completed and stays in service.
    let states = f.ctx.channel_states();
    assert_eq!(states[1].1, ChannelState::Free);
    assert_eq!(states[3].1, ChannelState::Quarantined);
    assert_eq!(states[0].1, ChannelState::Free);
    assert_eq!(states[2].1, ChannelState::Free);

    f.device.faults().stall_channel = None;
    f.ctx
        .host_to_device(DEVICE_ADDR, &range, 0, 3 * PAGE, TransferMode::Single)
        .unwrap();
    f.device.complete_stalled();
    f.ctx
        .recover_channel(ChannelSlot::HostToDeviceSecondary)
        .unwrap();
    assert!(f.all_free());
    f.ctx.unmap_range(range);
}

#[test]
fn dual_second_submission_failure_abandons_first() {
    let f = Fixture::new(&[1, 1]);
    let range = f.map_all();
    f.device.faults().fail_submission_at = Some(1);

    let err = f
        .ctx
        .device_to_host(&range, 0, DEVICE_ADDR, 2 * PAGE, TransferMode::Dual)
        .unwrap_err();
    assert!(matches!(
        err,
        DmaError::Submission {
            slot: ChannelSlot::DeviceToHostSecondary,
            ..
        }
    ));
    assert_eq!(err.errno(), crate::errno::EIO);
    let states = f.ctx.channel_states();
    assert_eq!(states[0].1, ChannelState::Quarantined);
    assert_eq!(states[2].1, ChannelState::Free);

    // The abandoned request did complete, so the channel can be recovered.
    f.ctx.recover_channel(ChannelSlot::DeviceToHost).unwrap();
    assert!(f.all_free());
    f.ctx.unmap_range(range);
}

#[test]
fn submission_failure_releases_channel() {
    let f = Fixture::new(&[1, 1, 1]);
    let range = f.map_all();
    f.device.faults().fail_submission_at = Some(1);

    let err = f
        .ctx
        .host_to_device(DEVICE_ADDR, &range, 0, 3 * PAGE, TransferMode::Single)
        .unwrap_err();
    assert!(matches!(
        err,
        DmaError::Submission {
            slot: ChannelSlot::HostToDevice,
            ..
        }
    ));
    assert!(f.all_free());
    f.ctx
        .host_to_device(DEVICE_ADDR, &range, 0, 3 * PAGE, TransferMode::Single)
        .unwrap();
    f.ctx.unmap_range(range);
}

#[test]
fn concurrent_transfers_share_a_context() {
    let f = Fixture::new(&[2, 2, 2, 2]);
    let range = f.map_all();
    let data = pattern(8 * PAGE, 0x3c);
    f.device.write_host(HOST_VIRT_BASE, &data).unwrap();

    let f_ref = &f;
    let range_ref = &range;
    std::thread::scope(|s| {
        for i in 0..4u64 {
            s.spawn(move || {
                f_ref
                    .ctx
                    .host_to_device(
                        DEVICE_ADDR + i * 2 * PAGE,
                        range_ref,
                        i * 2 * PAGE,
                        2 * PAGE,
                        TransferMode::Single,
                    )
                    .unwrap();
            });
        }
    });

    let mut on_device = vec![0; data.len()];
    f.device.read_device(DEVICE_ADDR, &mut on_device).unwrap();
    assert_eq!(on_device, data);
    assert!(f.all_free());
    f.ctx.unmap_range(range);
}
