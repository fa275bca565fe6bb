//! End-to-end dispatcher tests over the in-process transport.
//!
//! A full coordinator (producer, pool, delay runner) runs against a
//! [`MemoryBus`]; messages are published the way an external client would,
//! and assertions observe the pool's counters and the work-cleared pulse.

use std::sync::Arc;
use std::time::Duration;

use dispatchd_broker::{Broker, BrokeredProducer, MemoryBus};
use dispatchd_service::{DispatcherMain, InProcessSpawner, WorkerPool};

const SLEEP_TASK: &str = "sleep 0.1";

async fn start_dispatcher(
    bus: &MemoryBus,
    channels: &[&str],
    max_workers: usize,
) -> Arc<DispatcherMain> {
    let producer = BrokeredProducer::new(
        Arc::new(bus.broker()),
        channels.iter().map(|name| name.to_string()).collect(),
        false,
    );
    let pool = WorkerPool::new(Arc::new(InProcessSpawner), max_workers);
    let dispatcher = DispatcherMain::new(vec![producer], pool, Some("itest-node".to_string()));
    dispatcher.start_working().await;
    dispatcher.wait_for_producers_ready().await;
    dispatcher
}

async fn publish(bus: &MemoryBus, channel: &str, payload: &str) {
    bus.broker()
        .publish(channel, payload)
        .await
        .expect("publish should succeed");
}

async fn wait_cleared(dispatcher: &DispatcherMain) {
    let events = dispatcher.pool().events();
    tokio::time::timeout(Duration::from_secs(3), events.work_cleared.wait())
        .await
        .expect("work should clear in time");
}

#[tokio::test]
async fn published_task_runs_and_clears() {
    let bus = MemoryBus::default();
    let dispatcher = start_dispatcher(&bus, &["test_channel"], 2).await;
    assert_eq!(dispatcher.pool().finished_count(), 0);

    publish(&bus, "test_channel", "echo This worked!").await;
    wait_cleared(&dispatcher).await;

    assert_eq!(dispatcher.pool().finished_count(), 1);
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn only_subscribed_channels_are_consumed() {
    let bus = MemoryBus::default();
    let dispatcher =
        start_dispatcher(&bus, &["test_channel", "test_channel2", "test_channel3"], 4).await;

    publish(&bus, "test_channel", SLEEP_TASK).await;
    publish(&bus, "test_channel2", SLEEP_TASK).await;
    publish(&bus, "test_channel3", SLEEP_TASK).await;
    // Not listening to this one.
    publish(&bus, "test_channel4", SLEEP_TASK).await;

    wait_cleared(&dispatcher).await;
    assert_eq!(dispatcher.pool().finished_count(), 3);
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn fifteen_messages_queue_beyond_the_pool() {
    let bus = MemoryBus::default();
    let dispatcher = start_dispatcher(&bus, &["test_channel"], 4).await;

    for _ in 0..15 {
        publish(&bus, "test_channel", SLEEP_TASK).await;
    }
    wait_cleared(&dispatcher).await;

    assert_eq!(dispatcher.pool().finished_count(), 15);
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn structured_message_keeps_publisher_uuid() {
    let bus = MemoryBus::default();
    let dispatcher = start_dispatcher(&bus, &["test_channel"], 2).await;

    publish(
        &bus,
        "test_channel",
        r#"{"task": "sleep 3.14", "uuid": "find_me"}"#,
    )
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let running = dispatcher.pool().running_snapshot().await;
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].1.uuid.as_deref(), Some("find_me"));
    assert_eq!(running[0].1.channel.as_deref(), Some("test_channel"));
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn delayed_message_waits_then_runs() {
    let bus = MemoryBus::default();
    let dispatcher = start_dispatcher(&bus, &["test_channel"], 2).await;

    publish(
        &bus,
        "test_channel",
        r#"{"task": "noop", "uuid": "delay_task", "delay": 0.2}"#,
    )
    .await;

    tokio::time::sleep(Duration::from_millis(40)).await;
    let delayed = dispatcher.delayed_report();
    assert_eq!(delayed.len(), 1);
    assert_eq!(delayed[0].uuid.as_deref(), Some("delay_task"));
    assert_eq!(dispatcher.pool().finished_count(), 0);

    wait_cleared(&dispatcher).await;
    assert_eq!(dispatcher.pool().finished_count(), 1);
    assert!(dispatcher.delayed_report().is_empty());
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn producer_startup_failure_sets_exit_event() {
    let bus = MemoryBus::default();
    // Channel name outside the permitted alphabet: subscribe is rejected
    // before any delivery, and startup flags the failure.
    let producer = BrokeredProducer::new(
        Arc::new(bus.broker()),
        vec!["bad channel".to_string()],
        false,
    );
    let pool = WorkerPool::new(Arc::new(InProcessSpawner), 1);
    let dispatcher = DispatcherMain::new(vec![producer], pool, None);

    dispatcher.start_working().await;
    assert!(dispatcher.events.exit_event.is_set());
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn discard_deduplicates_no_uuid_submissions_by_content() {
    let bus = MemoryBus::default();
    let dispatcher = start_dispatcher(&bus, &["test_channel"], 2).await;

    // No publisher uuid: ingress assigns internal ids, and the policy keys
    // on the task body instead.
    for _ in 0..2 {
        publish(
            &bus,
            "test_channel",
            r#"{"task": "sleep 0.2", "on_duplicate": "discard"}"#,
        )
        .await;
    }
    wait_cleared(&dispatcher).await;

    assert_eq!(dispatcher.pool().finished_count(), 1);
    assert_eq!(dispatcher.pool().discarded_count(), 1);
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn queue_one_coalesces_no_uuid_submissions_by_content() {
    let bus = MemoryBus::default();
    let dispatcher = start_dispatcher(&bus, &["test_channel"], 2).await;

    for _ in 0..3 {
        publish(
            &bus,
            "test_channel",
            r#"{"task": "sleep 0.15", "on_duplicate": "queue_one"}"#,
        )
        .await;
    }
    wait_cleared(&dispatcher).await;

    // One ran, one stayed queued behind it, the third replaced the pending
    // copy and displaced it.
    assert_eq!(dispatcher.pool().finished_count(), 2);
    assert_eq!(dispatcher.pool().discarded_count(), 1);
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn duplicate_policies_flow_through_ingress() {
    let bus = MemoryBus::default();
    let dispatcher = start_dispatcher(&bus, &["test_channel"], 2).await;

    for _ in 0..3 {
        publish(
            &bus,
            "test_channel",
            r#"{"task": "sleep 0.2", "on_duplicate": "discard", "uuid": "dscd"}"#,
        )
        .await;
    }
    wait_cleared(&dispatcher).await;

    assert_eq!(dispatcher.pool().finished_count(), 1);
    assert_eq!(dispatcher.pool().discarded_count(), 2);
    dispatcher.shutdown().await;
}
