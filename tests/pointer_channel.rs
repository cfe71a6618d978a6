//! Pointer channels: descriptor exchange and the free-list ring.

mod common;

use common::harness;
use modem_ipc::channel::{ChannelKind, RingKind, SharedBuffer};
use modem_ipc::config::SIZE_128K;
use modem_ipc::error::Error;
use modem_ipc::layout::SharedBufferDescriptor;
use modem_ipc::memory::{PoolClass, PoolLayout, VirtAddr};

const CH: u32 = 20;

fn pointer_harness() -> common::Harness {
    let h = harness();
    h.ipc
        .configure_channel(CH, 4, ChannelKind::Pointer, SIZE_128K, false)
        .unwrap();
    h
}

#[test]
fn test_pointer_scenario() {
    let h = pointer_harness();

    assert!(matches!(h.ipc.recv_ptr(CH), Err(Error::ChannelEmpty(CH))));
    assert_eq!(h.modem.free_buffers(0, CH).unwrap(), 4);

    let payload: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
    let cookie = h.modem.send_ptr(0, CH, &payload).unwrap();
    assert_eq!(h.modem.free_buffers(0, CH).unwrap(), 3);

    let buffer = h.ipc.recv_ptr(CH).unwrap();
    assert_eq!(buffer.channel(), CH);
    assert_eq!(buffer.cookie(), cookie);
    assert_eq!(buffer.len(), payload.len());
    assert_eq!(buffer.capacity(), SIZE_128K as usize);
    assert_eq!(
        h.ipc.translator().host_virtual_to_coprocessor_physical(buffer.addr()).unwrap(),
        buffer.modem_phys()
    );
    assert_eq!(h.ipc.buffer_bytes(&buffer).unwrap(), &payload[..]);

    let before = h.ipc.ring_state(CH, RingKind::BufferList).unwrap();
    h.ipc.put_buf(CH, buffer).unwrap();
    let after = h.ipc.ring_state(CH, RingKind::BufferList).unwrap();
    assert_eq!(after.pc, before.pc.wrapping_add(1));
    assert_eq!(after.cc, before.cc);
    assert_eq!(h.modem.free_buffers(0, CH).unwrap(), 4);
}

#[test]
fn test_buffers_circulate() {
    let h = pointer_harness();

    for round in 0..20u8 {
        h.modem.send_ptr(0, CH, &[round; 512]).unwrap();
        h.modem.send_ptr(0, CH, &[round ^ 0xFF; 256]).unwrap();

        let first = h.ipc.recv_ptr(CH).unwrap();
        let second = h.ipc.recv_ptr(CH).unwrap();
        assert_eq!(h.ipc.buffer_bytes(&first).unwrap(), &[round; 512][..]);
        assert_eq!(h.ipc.buffer_bytes(&second).unwrap(), &[round ^ 0xFF; 256][..]);
        assert_ne!(first.addr(), second.addr());

        h.ipc.put_buf(CH, first).unwrap();
        h.ipc.put_buf(CH, second).unwrap();
    }
    assert_eq!(h.modem.free_buffers(0, CH).unwrap(), 4);
}

#[test]
fn test_free_list_exhaustion_on_modem_side() {
    let h = pointer_harness();
    for _ in 0..4 {
        h.modem.send_ptr(0, CH, b"block").unwrap();
    }
    assert!(matches!(
        h.modem.send_ptr(0, CH, b"block"),
        Err(Error::ChannelEmpty(CH))
    ));

    let buffer = h.ipc.recv_ptr(CH).unwrap();
    h.ipc.put_buf(CH, buffer).unwrap();
    h.modem.send_ptr(0, CH, b"block").unwrap();
}

#[test]
fn test_put_buf_outside_dma_region() {
    let h = pointer_harness();
    let before = h.ipc.ring_state(CH, RingKind::BufferList).unwrap();

    let outside = VirtAddr::new(h.ipc.translator().dma_base().get() + h.ipc.translator().dma_len());
    let (host_virt_h, host_virt_l) = outside.to_wire();
    let desc = SharedBufferDescriptor {
        mod_phys: 0,
        host_virt_l,
        host_virt_h,
        buf_size: SIZE_128K,
        data_size: 0,
        cookie: 99,
    };
    // SAFETY: the descriptor names no real buffer; it only exercises the check.
    let forged = unsafe { SharedBuffer::from_descriptor(CH, desc) };

    let err = h.ipc.put_buf(CH, forged).unwrap_err();
    assert!(matches!(err.error, Error::InputInvalid(_)));
    assert_eq!(err.buffer.cookie(), 99);
    assert_eq!(h.ipc.ring_state(CH, RingKind::BufferList).unwrap(), before);
    assert_eq!(h.ipc.counters(CH).unwrap().err_input_invalid, 1);
}

#[test]
fn test_put_buf_on_full_free_list_hands_buffer_back() {
    let h = pointer_harness();
    let pool = h.ipc.pools().get(PoolClass::Ptr128K).unwrap();
    let spare = pool.alloc().unwrap();
    let (host_virt_h, host_virt_l) = spare.to_wire();
    let desc = SharedBufferDescriptor {
        mod_phys: h
            .ipc
            .translator()
            .host_virtual_to_coprocessor_physical(spare)
            .unwrap(),
        host_virt_l,
        host_virt_h,
        buf_size: pool.element_size(),
        data_size: 0,
        cookie: 7,
    };
    // SAFETY: `spare` was just taken from the pool and is owned here.
    let buffer = unsafe { SharedBuffer::from_descriptor(CH, desc) };

    let before = h.ipc.ring_state(CH, RingKind::BufferList).unwrap();
    assert!(before.is_full());
    let err = h.ipc.put_buf(CH, buffer).unwrap_err();
    assert!(matches!(err.error, Error::BufferListFull(CH)));
    assert_eq!(err.buffer.addr(), spare);
    assert_eq!(h.ipc.ring_state(CH, RingKind::BufferList).unwrap(), before);
    assert_eq!(h.ipc.counters(CH).unwrap().err_buf_list_full, 1);

    pool.free(err.buffer.addr()).unwrap();
}

#[test]
fn test_discipline_mismatch() {
    let h = pointer_harness();
    h.ipc
        .configure_channel(21, 4, ChannelKind::Message, 256, false)
        .unwrap();

    let mut buf = [0u8; 256];
    assert!(matches!(h.ipc.recv(CH, &mut buf), Err(Error::ChannelInvalid(_))));
    assert!(matches!(h.ipc.send(CH, b"x"), Err(Error::ChannelInvalid(_))));
    assert!(matches!(h.ipc.recv_ptr(21), Err(Error::ChannelInvalid(_))));
}

#[test]
fn test_noncopy_on_pointer_channel_sees_descriptor() {
    let h = pointer_harness();
    h.modem.send_ptr(0, CH, b"payload").unwrap();

    let pending = h.ipc.recv_ptr_noncopy(CH).unwrap();
    assert_eq!(pending.len(), SharedBufferDescriptor::SIZE);
    let raw: [u8; SharedBufferDescriptor::SIZE] =
        h.ipc.message_bytes(&pending).unwrap().try_into().unwrap();
    assert_eq!(SharedBufferDescriptor::from_bytes(&raw).data_size, 7);
    h.ipc.mark_consumed(CH).unwrap();
}

#[test]
fn test_stocking_failure_returns_buffers() {
    let layout = PoolLayout::empty()
        .with_class(PoolClass::Msg2K, 2048, 16)
        .with_class(PoolClass::Ptr128K, 128 * 1024, 2)
        .with_class(PoolClass::SharedDescriptor, 24, 16);
    let h = common::harness_with(Default::default(), &layout);
    let descriptors = h.ipc.pools().get(PoolClass::SharedDescriptor).unwrap();

    let err = h
        .ipc
        .configure_channel(CH, 4, ChannelKind::Pointer, SIZE_128K, false)
        .unwrap_err();
    assert!(matches!(err, Error::HostBufferAllocFail(_)));
    assert_eq!(descriptors.available(), 16);
    assert_eq!(h.ipc.pools().get(PoolClass::Ptr128K).unwrap().available(), 2);
    assert!(!h.ipc.is_channel_configured(CH));
    assert_eq!(h.ipc.counters(CH).unwrap().err_host_buf_alloc_fail, 1);
}
