//! Integration tests for the single-flight scheduler
#![allow(clippy::unwrap_used, clippy::expect_used)]

mod support;

use std::{collections::HashSet, sync::Arc, time::Duration};

use postbag_common::Signal;
use postbag_dispatch::{
    CycleReport, DispatchConfig, MemoryMessageStore, MessageId, MessageStatus, MessageStore,
    Scheduler, Transport,
};
use postbag_metrics::DispatchMetrics;
use pretty_assertions::assert_eq;
use support::{GatedTransport, InstrumentedStore, ScriptedTransport, seed};
use tokio::sync::broadcast;

fn scheduler(
    config: DispatchConfig,
    store: Arc<dyn MessageStore>,
    transport: Arc<dyn Transport>,
) -> Arc<Scheduler> {
    Arc::new(Scheduler::new(config, store, transport, None).expect("valid config"))
}

#[tokio::test]
async fn test_concurrent_trigger_is_a_no_op() {
    let memory = MemoryMessageStore::new();
    seed(&memory, 3);
    let store = InstrumentedStore::new(memory.clone());
    let transport = GatedTransport::new();
    let scheduler = scheduler(DispatchConfig::default(), store.clone(), transport.clone());

    let running = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.trigger().await })
    };
    transport.wait_entered().await;
    assert!(scheduler.is_running());

    let before = memory.all();
    let report = scheduler.trigger().await;

    assert!(matches!(report, CycleReport::Skipped));
    assert_eq!(store.fetch_count(), 1);
    assert_eq!(store.update_count(), 0);
    assert_eq!(memory.all(), before);

    transport.open();
    let report = running.await.unwrap();

    let summary = report.summary().expect("cycle completed");
    assert_eq!(summary.sent, 3);
    assert_eq!(transport.call_count(), 1);
    assert!(!scheduler.is_running());
}

#[tokio::test]
async fn test_skipped_trigger_is_counted() {
    let memory = MemoryMessageStore::new();
    seed(&memory, 1);
    let transport = GatedTransport::new();
    let metrics = Arc::new(DispatchMetrics::new().unwrap());
    let scheduler = Arc::new(
        Scheduler::new(
            DispatchConfig::default(),
            Arc::new(memory),
            transport.clone(),
            Some(Arc::clone(&metrics)),
        )
        .unwrap(),
    );

    let running = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.trigger().await })
    };
    transport.wait_entered().await;

    scheduler.trigger().await;
    scheduler.trigger().await;
    transport.open();
    running.await.unwrap();

    assert_eq!(metrics.skipped_total(), 2);
    assert_eq!(metrics.sent_total(), 1);
}

#[tokio::test]
async fn test_cycles_page_in_id_order() {
    let store = MemoryMessageStore::new();
    seed(&store, 7);
    let transport = ScriptedTransport::new();
    let config = DispatchConfig {
        page_size: 5,
        ..DispatchConfig::default()
    };
    let scheduler = scheduler(config, Arc::new(store.clone()), transport.clone());

    scheduler.trigger().await;
    scheduler.trigger().await;
    let last = scheduler.trigger().await;

    assert_eq!(
        transport.calls(),
        vec![
            (1..=5).map(MessageId).collect::<Vec<_>>(),
            vec![MessageId(6), MessageId(7)],
        ]
    );
    assert!(matches!(last, CycleReport::Idle));
    assert_eq!(store.count_by_status(MessageStatus::Sent), 7);
}

#[tokio::test]
async fn test_page_fans_out_over_sub_batches() {
    let store = MemoryMessageStore::new();
    seed(&store, 10);
    let transport = ScriptedTransport::new();
    let config = DispatchConfig {
        sub_batch_size: Some(3),
        worker_pool_size: 2,
        ..DispatchConfig::default()
    };
    let scheduler = scheduler(config, Arc::new(store.clone()), transport.clone());

    let report = scheduler.trigger().await;
    let summary = report.summary().expect("cycle completed");

    assert_eq!(summary.batches, 4);
    assert_eq!(summary.sent, 10);

    let mut sizes: Vec<_> = transport.calls().iter().map(Vec::len).collect();
    sizes.sort_unstable();
    assert_eq!(sizes, vec![1, 3, 3, 3]);

    // One batch id per cycle, shared by every sub-batch
    let batch_ids: HashSet<_> = store.all().iter().map(|r| r.batch_id).collect();
    assert_eq!(batch_ids, HashSet::from([Some(summary.batch_id)]));
}

#[tokio::test]
async fn test_guard_released_after_fetch_error() {
    let store = InstrumentedStore::new(MemoryMessageStore::new());
    store.fail_fetches(true);
    let scheduler = scheduler(DispatchConfig::default(), store.clone(), ScriptedTransport::new());

    let first = scheduler.trigger().await;
    assert!(matches!(first, CycleReport::Failed(ref e) if e.is_store()));
    assert!(!scheduler.is_running());

    // The next trigger runs instead of being skipped
    store.fail_fetches(false);
    let second = scheduler.trigger().await;
    assert!(matches!(second, CycleReport::Idle));
    assert_eq!(store.fetch_count(), 2);
}

#[tokio::test]
async fn test_retrying_records_reenter_next_cycle() {
    let store = MemoryMessageStore::new();
    seed(&store, 2);
    let scheduler = scheduler(
        DispatchConfig::default(),
        Arc::new(store.clone()),
        ScriptedTransport::rejecting(),
    );

    for _ in 0..3 {
        scheduler.trigger().await;
    }

    assert_eq!(store.count_by_status(MessageStatus::Failed), 2);
    assert!(store.all().iter().all(|r| r.attempts == 3));
    assert!(matches!(scheduler.trigger().await, CycleReport::Idle));
}

#[test]
fn test_invalid_config_is_rejected() {
    let config = DispatchConfig {
        page_size: 0,
        ..DispatchConfig::default()
    };

    let result = Scheduler::new(
        config,
        Arc::new(MemoryMessageStore::new()),
        ScriptedTransport::new(),
        None,
    );

    assert!(result.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_serve_runs_cycles_until_shutdown() {
    let store = MemoryMessageStore::new();
    seed(&store, 4);
    let transport = ScriptedTransport::new();
    let config = DispatchConfig {
        initial_delay_secs: 5,
        interval_secs: 10,
        ..DispatchConfig::default()
    };
    let scheduler = scheduler(config, Arc::new(store.clone()), transport.clone());
    let (tx, rx) = broadcast::channel(1);

    let serving = tokio::spawn(Arc::clone(&scheduler).serve(rx));

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(transport.call_count(), 0);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(store.count_by_status(MessageStatus::Sent), 4);

    tx.send(Signal::Shutdown).unwrap();
    serving.await.unwrap();
    assert!(!scheduler.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_waits_for_cycle_in_transport() {
    let store = MemoryMessageStore::new();
    seed(&store, 2);
    let transport = GatedTransport::new();
    let config = DispatchConfig {
        initial_delay_secs: 0,
        interval_secs: 60,
        shutdown_timeout_secs: 30,
        ..DispatchConfig::default()
    };
    let scheduler = scheduler(config, Arc::new(store.clone()), transport.clone());
    let (tx, rx) = broadcast::channel(1);

    let serving = tokio::spawn(Arc::clone(&scheduler).serve(rx));
    transport.wait_entered().await;

    tx.send(Signal::Shutdown).unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(!serving.is_finished());

    transport.open();
    serving.await.unwrap();

    assert_eq!(store.count_by_status(MessageStatus::Sent), 2);
    assert!(!scheduler.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_no_cycle_runs_after_serve_returns() {
    let store = InstrumentedStore::new(MemoryMessageStore::new());
    let transport = ScriptedTransport::new();
    let config = DispatchConfig {
        initial_delay_secs: 0,
        interval_secs: 1,
        ..DispatchConfig::default()
    };
    let scheduler = scheduler(config, store.clone(), transport);
    let (tx, rx) = broadcast::channel(1);

    let serving = tokio::spawn(Arc::clone(&scheduler).serve(rx));

    // Land the shutdown on a tick boundary so a freshly spawned cycle may
    // not have taken the guard yet
    tokio::time::sleep(Duration::from_secs(5)).await;
    tx.send(Signal::Shutdown).unwrap();
    serving.await.unwrap();

    let fetches = store.fetch_count();
    assert!(fetches >= 1);

    tokio::time::sleep(Duration::from_secs(10)).await;
    tokio::task::yield_now().await;

    assert_eq!(store.fetch_count(), fetches);
    assert!(!scheduler.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_timeout_abandons_stuck_cycle() {
    let store = MemoryMessageStore::new();
    seed(&store, 1);
    let transport = GatedTransport::new();
    let config = DispatchConfig {
        initial_delay_secs: 0,
        interval_secs: 60,
        shutdown_timeout_secs: 10,
        send_timeout_secs: 300,
        ..DispatchConfig::default()
    };
    let scheduler = scheduler(config, Arc::new(store.clone()), transport.clone());
    let (tx, rx) = broadcast::channel(1);

    let serving = tokio::spawn(Arc::clone(&scheduler).serve(rx));
    transport.wait_entered().await;

    tx.send(Signal::Shutdown).unwrap();
    serving.await.unwrap();

    // The abandoned cycle released its guard and never recorded a result
    assert!(!scheduler.is_running());
    assert_eq!(store.count_by_status(MessageStatus::Queued), 1);
}

#[tokio::test]
async fn test_disabled_scheduler_returns_immediately() {
    let store = MemoryMessageStore::new();
    seed(&store, 1);
    let config = DispatchConfig {
        enabled: false,
        ..DispatchConfig::default()
    };
    let scheduler = scheduler(config, Arc::new(store.clone()), ScriptedTransport::new());
    let (_tx, rx) = broadcast::channel(1);

    scheduler.serve(rx).await;

    assert_eq!(store.count_by_status(MessageStatus::Queued), 1);
}
