//! Message and pointer channel throughput over the loopback bus.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use modem_ipc::channel::ChannelKind;
use modem_ipc::config::{IpcConfig, SIZE_128K};
use modem_ipc::instance::Instance;
use modem_ipc::memory::{BufferPools, PoolClass, PoolLayout};
use modem_ipc::ring::RingMetadata;
use modem_ipc::sim::{Coprocessor, LoopbackBus};

fn setup() -> (Instance, Coprocessor, LoopbackBus) {
    let bus = LoopbackBus::new(8 << 20).unwrap();
    let modem = Coprocessor::attach(&bus).unwrap();
    let layout = PoolLayout::empty()
        .with_class(PoolClass::Msg2K, 2048, 64)
        .with_class(PoolClass::Msg16K, 16 * 1024, 32)
        .with_class(PoolClass::Ptr128K, 128 * 1024, 16)
        .with_class(PoolClass::SharedDescriptor, 24, 64);
    let dma = bus.host_dma().unwrap();
    let pools = BufferPools::carve(&dma, &layout).unwrap();
    let ipc = Instance::init_with(&IpcConfig::default(), pools, dma, bus.devices()).unwrap();
    (ipc, modem, bus)
}

fn bench_ring_counters(c: &mut Criterion) {
    let md = RingMetadata::new(16, 2048);
    c.bench_function("ring_advance_pair", |b| {
        b.iter(|| {
            md.advance_producer();
            std::hint::black_box(md.is_full());
            md.advance_consumer();
            std::hint::black_box(md.is_empty());
        });
    });
}

fn bench_message_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("message_round_trip");
    let (ipc, _modem, _bus) = setup();

    for (ch, size) in [(0u32, 64usize), (1, 2048), (2, 16 * 1024)] {
        ipc.configure_channel(ch, 16, ChannelKind::Message, size as u32, false)
            .unwrap();
        let payload = vec![0x5Au8; size];
        let mut buf = vec![0u8; size];

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                ipc.send(ch, &payload).unwrap();
                std::hint::black_box(ipc.recv(ch, &mut buf).unwrap());
            });
        });
    }

    group.finish();
}

fn bench_pointer_exchange(c: &mut Criterion) {
    let (ipc, modem, _bus) = setup();
    ipc.configure_channel(8, 8, ChannelKind::Pointer, SIZE_128K, false)
        .unwrap();
    let payload = vec![0xC3u8; 4096];

    c.bench_function("pointer_send_recv_put", |b| {
        b.iter(|| {
            modem.send_ptr(0, 8, &payload).unwrap();
            let buffer = ipc.recv_ptr(8).unwrap();
            std::hint::black_box(buffer.len());
            ipc.put_buf(8, buffer).unwrap();
        });
    });
}

criterion_group!(
    benches,
    bench_ring_counters,
    bench_message_round_trip,
    bench_pointer_exchange
);
criterion_main!(benches);
