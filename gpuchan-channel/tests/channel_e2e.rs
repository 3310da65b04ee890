//! Spawned channels talking to an in-process client.

mod common;

use common::{create_params, sync_command, Script, ScriptedFactory};
use gpuchan_channel::{memory_pair, ChannelBuilder, ChannelError, ChannelHandle, ChannelStatus, MemoryPeer};
use gpuchan_core::{Message, MessageKind, RouteId, StreamId, StreamPriority, SyncPointManager};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const ROUTE: RouteId = RouteId::new(3);

fn spawn_channel() -> (ChannelHandle, MemoryPeer, Arc<Script>) {
    let script = Script::new();
    let (transport, peer, events) = memory_pair();
    let handle = ChannelBuilder::new(transport, ScriptedFactory::new(&script))
        .with_sync_points(Arc::new(SyncPointManager::new()))
        .build()
        .unwrap()
        .spawn(events);
    (handle, peer, script)
}

async fn next_reply(peer: &mut MemoryPeer) -> Message {
    timeout(Duration::from_secs(5), peer.recv()).await.unwrap().unwrap()
}

#[tokio::test]
async fn test_command_buffer_lifecycle() {
    let (handle, mut peer, script) = spawn_channel();

    let params = create_params(ROUTE, StreamId::new(1), StreamPriority::Normal);
    peer.send(Message::sync(RouteId::CONTROL, MessageKind::CreateCommandBuffer(params), 1));
    let reply = next_reply(&mut peer).await;
    assert_eq!(reply.sync_id, Some(1));
    assert!(!reply.reply_error);

    for (opcode, sync_id) in [(10, 2), (11, 3)] {
        peer.send(sync_command(ROUTE, opcode, sync_id));
        let reply = next_reply(&mut peer).await;
        assert_eq!(reply.sync_id, Some(sync_id));
        assert!(!reply.reply_error);
    }
    assert_eq!(script.completed_opcodes(ROUTE), vec![10, 11]);

    peer.send(Message::sync(RouteId::CONTROL, MessageKind::DestroyCommandBuffer { route_id: ROUTE }, 4));
    assert!(!next_reply(&mut peer).await.reply_error);

    peer.send(sync_command(ROUTE, 12, 5));
    let reply = next_reply(&mut peer).await;
    assert_eq!(reply.sync_id, Some(5));
    assert!(reply.reply_error);
    assert_eq!(script.destroyed(), vec![ROUTE]);

    handle.shutdown();
    assert_eq!(handle.closed().await, ChannelError::Shutdown);
}

#[tokio::test]
async fn test_nop_and_unknown_route() {
    let (handle, mut peer, _script) = spawn_channel();

    peer.send(Message::sync(RouteId::CONTROL, MessageKind::Nop, 1));
    let reply = next_reply(&mut peer).await;
    assert_eq!(reply.sync_id, Some(1));
    assert!(!reply.reply_error);

    peer.send(sync_command(RouteId::new(99), 1, 2));
    let reply = next_reply(&mut peer).await;
    assert_eq!(reply.sync_id, Some(2));
    assert!(reply.reply_error);

    let metrics = handle.metrics();
    assert_eq!(metrics.messages_received, 2);
    assert_eq!(metrics.nop_replies, 1);
    assert_eq!(metrics.messages_rejected, 1);
}

#[tokio::test]
async fn test_peer_close_tears_channel_down() {
    let (handle, peer, _script) = spawn_channel();
    assert_eq!(handle.status(), ChannelStatus::Open);

    peer.close();
    let reason = timeout(Duration::from_secs(5), handle.closed()).await.unwrap();
    assert_eq!(reason, ChannelError::TransportClosed);
    assert!(handle.status().is_closed());
    timeout(Duration::from_secs(5), handle.join()).await.unwrap();
}

#[tokio::test]
async fn test_transport_error_answers_queued_messages() {
    let (handle, mut peer, script) = spawn_channel();
    let params = create_params(ROUTE, StreamId::new(1), StreamPriority::Normal);
    peer.send(Message::sync(RouteId::CONTROL, MessageKind::CreateCommandBuffer(params), 1));
    next_reply(&mut peer).await;

    script.push_outcomes(ROUTE, [gpuchan_channel::HandleOutcome::Deschedule]);
    peer.send(sync_command(ROUTE, 1, 2));
    peer.send(sync_command(ROUTE, 2, 3));
    peer.fail(ChannelError::Transport("pipe broken".to_string()));

    let reason = timeout(Duration::from_secs(5), handle.closed()).await.unwrap();
    assert_eq!(reason, ChannelError::Transport("pipe broken".to_string()));

    let replies: Vec<_> = peer.drain().iter().map(|r| (r.sync_id, r.reply_error)).collect();
    assert_eq!(replies, vec![(Some(2), true), (Some(3), true)]);
    assert_eq!(handle.metrics().channel_errors, 1);
}

#[tokio::test]
async fn test_preempted_channel_backs_off_until_flag_clears() {
    let flag = Arc::new(AtomicBool::new(false));
    let script = Script::new();
    let (transport, mut peer, events) = memory_pair();
    let handle = ChannelBuilder::new(transport, ScriptedFactory::new(&script))
        .with_sync_points(Arc::new(SyncPointManager::new()))
        .preempted_by(Arc::clone(&flag))
        .build()
        .unwrap()
        .spawn(events);

    let params = create_params(ROUTE, StreamId::new(1), StreamPriority::Normal);
    peer.send(Message::sync(RouteId::CONTROL, MessageKind::CreateCommandBuffer(params), 1));
    assert!(!next_reply(&mut peer).await.reply_error);

    flag.store(true, Ordering::Release);
    peer.send(sync_command(ROUTE, 7, 2));
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert!(peer.try_recv().is_none());
    let turns = handle.metrics().preempted_turns;
    assert!(turns >= 1, "turn was never retried");
    assert!(turns < 100, "{turns} retries in 30ms");

    flag.store(false, Ordering::Release);
    let reply = next_reply(&mut peer).await;
    assert_eq!(reply.sync_id, Some(2));
    assert!(!reply.reply_error);
    assert_eq!(script.completed_opcodes(ROUTE), vec![7]);

    handle.shutdown();
    handle.closed().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_parallel_clients_keep_per_route_order() {
    let (handle, mut peer, script) = spawn_channel();
    for route in 1..=2u32 {
        let params = create_params(RouteId::new(route), StreamId::new(route), StreamPriority::Normal);
        peer.send(Message::sync(RouteId::CONTROL, MessageKind::CreateCommandBuffer(params), route));
        assert!(!next_reply(&mut peer).await.reply_error);
    }

    for opcode in 0..50u32 {
        let route = RouteId::new(opcode % 2 + 1);
        peer.send(sync_command(route, opcode, 100 + opcode));
    }
    for _ in 0..50 {
        assert!(!next_reply(&mut peer).await.reply_error);
    }

    let evens: Vec<u32> = (0..50).filter(|n| n % 2 == 0).collect();
    let odds: Vec<u32> = (0..50).filter(|n| n % 2 == 1).collect();
    assert_eq!(script.completed_opcodes(RouteId::new(1)), evens);
    assert_eq!(script.completed_opcodes(RouteId::new(2)), odds);

    handle.shutdown();
    handle.closed().await;
}
