//! Dispatch throughput benchmarks.
//!
//! Measures ingest push plus in-order dispatch through a hand-driven channel,
//! the cost of one preemption machine step, and a sync round trip through a
//! spawned channel.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use gpuchan_channel::preemption::PreemptionInputs;
use gpuchan_channel::prelude::*;
use gpuchan_channel::PreemptionMachine;
use gpuchan_core::{PreemptionConfig, SyncPointManager};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::time::Instant;

const BATCH_SIZES: &[u32] = &[1, 64, 1024];
const STREAM_COUNTS: &[u32] = &[1, 4, 16];

struct Sink;

impl CommandHandler for Sink {
    fn handle(&mut self, message: &Message, cx: &mut HandlerContext<'_>) -> HandleOutcome {
        if message.is_sync() {
            cx.reply(Message::reply_to(message));
        }
        HandleOutcome::Completed
    }
}

struct SinkFactory;

impl HandlerFactory for SinkFactory {
    fn create(
        &mut self,
        _params: &CreateCommandBufferParams,
        _reschedule: RescheduleHandle,
    ) -> Result<Box<dyn CommandHandler>, HandlerError> {
        Ok(Box::new(Sink))
    }
}

/// A hand-driven channel with one route per stream.
fn channel_with_streams(streams: u32) -> (GpuChannel, MemoryPeer) {
    let (transport, peer, _events) = memory_pair();
    let mut channel = ChannelBuilder::new(transport, SinkFactory)
        .with_sync_points(Arc::new(SyncPointManager::new()))
        .build()
        .unwrap();
    for id in 1..=streams {
        let params = CreateCommandBufferParams {
            route_id: RouteId::new(id),
            stream_id: StreamId::new(id),
            priority: StreamPriority::Normal,
            share_group: None,
        };
        channel.deliver(Message::control(MessageKind::CreateCommandBuffer(params)));
    }
    channel.run_until_idle();
    (channel, peer)
}

fn bench_push_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("push_dispatch");

    for &batch in BATCH_SIZES {
        group.throughput(Throughput::Elements(u64::from(batch)));
        group.bench_with_input(BenchmarkId::new("single_stream", batch), &batch, |b, &batch| {
            let (mut channel, _peer) = channel_with_streams(1);
            b.iter(|| {
                for opcode in 0..batch {
                    channel.deliver(Message::new(RouteId::new(1), MessageKind::Command { opcode }));
                }
                black_box(channel.run_until_idle());
            });
        });
    }

    for &streams in STREAM_COUNTS {
        group.throughput(Throughput::Elements(1024));
        group.bench_with_input(BenchmarkId::new("interleaved_streams", streams), &streams, |b, &streams| {
            let (mut channel, _peer) = channel_with_streams(streams);
            b.iter(|| {
                for opcode in 0..1024u32 {
                    let route = RouteId::new(opcode % streams + 1);
                    channel.deliver(Message::new(route, MessageKind::Command { opcode }));
                }
                black_box(channel.run_until_idle());
            });
        });
    }

    group.finish();
}

fn bench_preemption_update(c: &mut Criterion) {
    let config = PreemptionConfig::default();
    let start = Instant::now();

    c.bench_function("preemption_machine_cycle", |b| {
        b.iter(|| {
            let mut machine = PreemptionMachine::new(config);
            let mut now = start;
            machine.update(PreemptionInputs { now, head_received: Some(start), scheduled: true });
            now += config.preempt_wait;
            machine.timer_fired();
            machine.update(PreemptionInputs { now, head_received: Some(start), scheduled: true });
            now += Duration::from_millis(1);
            black_box(machine.update(PreemptionInputs { now, head_received: None, scheduled: true }))
        });
    });
}

fn bench_spawned_round_trip(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    c.bench_function("spawned_sync_round_trip", |b| {
        let (transport, peer, events) = memory_pair();
        let handle = rt.block_on(async {
            ChannelBuilder::new(transport, SinkFactory)
                .with_sync_points(Arc::new(SyncPointManager::new()))
                .build()
                .unwrap()
                .spawn(events)
        });
        let peer = tokio::sync::Mutex::new(peer);

        b.to_async(&rt).iter(|| async {
            let mut peer = peer.lock().await;
            peer.send(Message::sync(RouteId::CONTROL, MessageKind::Nop, 1));
            black_box(peer.recv().await)
        });

        handle.shutdown();
    });
}

criterion_group!(benches, bench_push_dispatch, bench_preemption_update, bench_spawned_round_trip);
criterion_main!(benches);
