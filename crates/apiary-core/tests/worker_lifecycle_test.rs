// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker death and reaping, observed through the engine.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use serde_json::json;
use tokio::time::timeout;

use apiary_core::config::Config;
use apiary_core::engine::Engine;
use apiary_core::session::SessionSink;
use apiary_core::storage::MemoryStorage;

fn engine_with_config(factory: Arc<TestFactory>, config: Config) -> Engine {
    init_tracing();

    Engine::builder()
        .target("test://source")
        .factory(factory)
        .storage(Arc::new(MemoryStorage::new()))
        .config(config)
        .build()
        .expect("engine should build")
}

#[tokio::test]
async fn test_heartbeat_loss_fails_all_sessions() {
    // A wedged plugin blocks the worker loop, so heartbeats stop.
    let factory = Arc::new(TestFactory::new(FetchBehavior::Hang));
    let mut engine = engine_with_config(factory, fast_config());

    let (sink_a, mut rx_a) = SessionSink::channel();
    engine.push(sink_a, json!({"type": "once", "token": "t1"}));
    let (sink_b, mut rx_b) = SessionSink::channel();
    engine.push(sink_b, json!({"type": "once", "token": "t2"}));

    // Both sessions die with the worker once the heartbeat deadline passes.
    assert_eq!(expect_failure(&mut rx_a).await, "WORKER_GONE");
    assert_eq!(expect_failure(&mut rx_b).await, "WORKER_GONE");

    // The engine is told to reap exactly one slave.
    let notice = timeout(WAIT, engine.departed())
        .await
        .expect("timed out waiting for the reaper notice")
        .expect("reaper channel closed");
    assert_eq!(notice.engine, "test://source");
    assert_eq!(notice.thread, "default");

    engine.kill(&notice.thread).await;
    assert_eq!(engine.slave_count(), 0);
}

#[tokio::test]
async fn test_push_to_dead_slave_fails_worker_gone() {
    let factory = Arc::new(TestFactory::new(FetchBehavior::Hang));
    let mut engine = engine_with_config(factory, fast_config());

    let (sink, mut rx) = SessionSink::channel();
    engine.push(sink, json!({"type": "once", "token": "t1"}));
    assert_eq!(expect_failure(&mut rx).await, "WORKER_GONE");

    // From Dead there is no way back: before the engine reaps, further
    // requests for the same thread fail immediately.
    let (sink, mut rx) = SessionSink::channel();
    engine.push(sink, json!({"type": "once", "token": "t1"}));
    assert_eq!(expect_failure(&mut rx).await, "WORKER_GONE");

    assert!(engine.reap().await >= 1);
    assert_eq!(engine.slave_count(), 0);
}

#[tokio::test]
async fn test_worker_idle_suicide_is_reaped() {
    let config = Config {
        suicide_timeout: Duration::from_millis(200),
        ..fast_config()
    };
    let factory = Arc::new(TestFactory::new(FetchBehavior::Static(sample_dict())));
    let mut engine = engine_with_config(factory, config);

    // A one-shot leaves the worker with an empty scheduler table.
    let (sink, mut rx) = SessionSink::channel();
    engine.push(sink, json!({"type": "once", "token": "t1"}));
    assert!(expect_reply(&mut rx).await.result.is_some());
    assert_eq!(engine.slave_count(), 1);

    let notice = timeout(WAIT, engine.departed())
        .await
        .expect("idle worker never committed suicide")
        .expect("reaper channel closed");
    assert_eq!(notice.thread, "default");

    engine.kill(&notice.thread).await;
    assert_eq!(engine.slave_count(), 0);
}

#[tokio::test]
async fn test_kill_of_missing_slave_is_a_noop() {
    let factory = Arc::new(TestFactory::new(FetchBehavior::Static(sample_dict())));
    let mut engine = engine_with_config(factory, fast_config());

    engine.kill("default").await;
    assert_eq!(engine.slave_count(), 0);
}

#[tokio::test]
async fn test_engine_terminate_joins_workers() {
    let factory = Arc::new(TestFactory::new(FetchBehavior::Static(sample_dict())));
    let mut engine = engine_with_config(factory, fast_config());

    let (sink, mut rx) = SessionSink::channel();
    engine.push(
        sink,
        json!({"type": "auto", "interval": 50, "token": "t1"}),
    );
    assert!(expect_reply(&mut rx).await.key.is_some());
    assert_eq!(engine.slave_count(), 1);

    timeout(WAIT, engine.terminate())
        .await
        .expect("terminate should not hang on a healthy worker");
    assert_eq!(engine.slave_count(), 0);
}

#[tokio::test]
async fn test_sessions_on_distinct_threads_use_distinct_workers() {
    let factory = Arc::new(TestFactory::new(FetchBehavior::Static(sample_dict())));
    let mut engine = engine_with_config(factory, fast_config());

    let (sink, mut rx_a) = SessionSink::channel();
    engine.push(sink, json!({"type": "once", "token": "t1"}));
    let (sink, mut rx_b) = SessionSink::channel();
    engine.push(
        sink,
        json!({"type": "once", "token": "t1", "thread": "aux"}),
    );

    assert!(expect_reply(&mut rx_a).await.result.is_some());
    assert!(expect_reply(&mut rx_b).await.result.is_some());
    assert_eq!(engine.slave_count(), 2);

    timeout(WAIT, engine.terminate())
        .await
        .expect("terminate should not hang");
}
