use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower::util::ServiceExt;

use sensorflow_rule_engine::consumer::{EngineSettings, WindowSource};
use sensorflow_rule_engine::queue::{self, MessageSource};
use sensorflow_rule_engine::routes::{self, AppState};
use sensorflow_rule_engine::{
    AckStrategy, AlertKind, ConsumerError, HistoryStore, MemoryStore, Reading, RuleEngine,
    StreamConsumer, WindowCache,
};

// ---

fn ts(seq: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 26, 18, 0, 0).unwrap() + chrono::Duration::seconds(seq)
}

fn packet(device_id: i64, seq: i64, pressure: f64, temperature: f64) -> Value {
    json!({
        "device_id": device_id,
        "timestamp": ts(seq).to_rfc3339(),
        "pressure": pressure,
        "temperature": temperature,
    })
}

fn build_engine(window_size: usize, delta_pressure: f64) -> (RuleEngine, MemoryStore) {
    // ---
    let store = MemoryStore::new();
    let settings = EngineSettings {
        window_size,
        delta_pressure,
        store_timeout: Duration::from_secs(2),
        ack_strategy: AckStrategy::BestEffort,
    };
    let engine = RuleEngine::new(
        Arc::new(WindowCache::new(window_size)),
        Arc::new(store.clone()),
        settings,
    );
    (engine, store)
}

fn build_app(engine: &RuleEngine, store: &MemoryStore, publisher: queue::Publisher) -> axum::Router {
    routes::router(AppState {
        store: Arc::new(store.clone()),
        publisher,
        stats: Arc::clone(engine.stats()),
        store_timeout: Duration::from_secs(2),
    })
}

async fn post_packet(app: &axum::Router, body: String) -> Result<StatusCode> {
    // ---
    let request = Request::builder()
        .method("POST")
        .uri("/packets")
        .header("content-type", "application/json")
        .body(Body::from(body))?;
    let response = app.clone().oneshot(request).await?;
    Ok(response.status())
}

#[tokio::test]
async fn pipeline_emits_instant_and_sustained_alerts() -> Result<()> {
    // ---
    let (engine, store) = build_engine(4, 0.00002);
    let (publisher, subscription) = queue::channel("packets", 64);
    let app = build_app(&engine, &store, publisher);

    // Each packet is consumed before the next one is posted, as in steady state.
    let mut packets: Vec<Value> = [0.0500, 0.0500, 0.0500, 0.0501]
        .iter()
        .enumerate()
        .map(|(seq, pressure)| packet(1, seq as i64, *pressure, 20.0))
        .collect();
    packets.push(packet(2, 0, 0.02, 20.0));

    for body in packets {
        assert_eq!(post_packet(&app, body.to_string()).await?, StatusCode::ACCEPTED);
        let delivery = subscription.next().await.expect("delivery");
        engine.handle(delivery).await?;
    }

    let alerts = store.alerts().await;
    let reasons: Vec<(i64, &str)> = alerts
        .iter()
        .map(|a| (a.device_id, a.reason.as_str()))
        .collect();
    assert_eq!(
        reasons,
        vec![(1, "rapid pressure increase"), (2, "pressure low")]
    );
    match alerts[0].kind {
        AlertKind::Sustained { change } => assert!((change - 0.0001).abs() < 1e-12),
        ref other => panic!("unexpected alert kind {other:?}"),
    }

    let stats = engine.stats().snapshot();
    assert_eq!(stats.received, 5);
    assert_eq!(stats.acked, 5);
    assert_eq!(stats.instant_alerts, 1);
    assert_eq!(stats.sustained_alerts, 1);
    Ok(())
}

#[tokio::test]
async fn store_history_warms_a_fresh_engine() -> Result<()> {
    // ---
    // A restarted engine has an empty cache but the store still has history.
    let (engine, store) = build_engine(3, 0.001);
    for (seq, pressure) in [(0, 0.050), (1, 0.052)] {
        store
            .insert_reading(&Reading {
                device_id: 4,
                timestamp: ts(seq),
                pressure,
                temperature: 20.0,
            })
            .await?;
    }

    // Ingestion persists before publishing, so the store sees the new reading.
    let (publisher, subscription) = queue::channel("packets", 8);
    let app = build_app(&engine, &store, publisher);
    assert_eq!(
        post_packet(&app, packet(4, 2, 0.056, 20.0).to_string()).await?,
        StatusCode::ACCEPTED
    );

    let delivery = subscription.next().await.expect("delivery");
    let evaluation = engine.handle(delivery).await?;

    assert_eq!(evaluation.window_source, WindowSource::Store);
    assert_eq!(evaluation.alerts.len(), 1);
    assert_eq!(evaluation.alerts[0].reason, "rapid pressure increase");
    assert_eq!(store.find_recent_calls(), 1);
    Ok(())
}

#[tokio::test]
async fn malformed_messages_are_acked_and_dropped() -> Result<()> {
    // ---
    let (engine, store) = build_engine(3, 0.001);
    let (publisher, subscription) = queue::channel("packets", 8);
    publisher.publish(b"{\"device_id\": \"seven\"}".to_vec()).await?;
    publisher.publish(b"\x00\x01".to_vec()).await?;
    drop(publisher);

    let mut consumer = StreamConsumer::new(0, engine.clone(), subscription.clone());
    let _ = consumer.run(CancellationToken::new()).await;

    let stats = engine.stats().snapshot();
    assert_eq!(stats.decode_errors, 2);
    assert_eq!(stats.acked, 2);
    assert_eq!(engine.cache().device_count(), 0);
    assert!(store.alerts().await.is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn stalled_store_does_not_stall_the_consumer() -> Result<()> {
    // ---
    let (engine, store) = build_engine(3, 0.001);
    let (publisher, subscription) = queue::channel("packets", 8);
    // One device per message keeps every window cold.
    for seq in 0..3 {
        publisher
            .publish_json(&Reading {
                device_id: 1 + seq,
                timestamp: ts(seq),
                pressure: 0.05,
                temperature: 20.0,
            })
            .await?;
    }
    drop(publisher);
    store.set_stall(Duration::from_secs(3600));

    let started = tokio::time::Instant::now();
    let mut consumer = StreamConsumer::new(0, engine.clone(), subscription.clone());
    let _ = consumer.run(CancellationToken::new()).await;

    let stats = engine.stats().snapshot();
    assert_eq!(stats.timeouts, 3);
    assert_eq!(stats.acked, 3);
    assert!(started.elapsed() <= Duration::from_secs(7));
    Ok(())
}

#[tokio::test]
async fn concurrent_consumers_share_one_cache() -> Result<()> {
    // ---
    let (engine, store) = build_engine(10, 0.001);
    let (publisher, subscription) = queue::channel("packets", 256);
    for seq in 0..40 {
        publisher
            .publish_json(&Reading {
                device_id: 1 + seq % 4,
                timestamp: ts(seq),
                pressure: 0.05,
                temperature: 20.0,
            })
            .await?;
    }
    drop(publisher);

    let handles: Vec<_> = (0..4)
        .map(|id| {
            let mut consumer = StreamConsumer::new(id, engine.clone(), subscription.clone());
            tokio::spawn(async move { consumer.run(CancellationToken::new()).await })
        })
        .collect();
    for handle in handles {
        let result = handle.await?;
        assert!(matches!(result, Err(ConsumerError::ChannelClosed(_))));
    }

    for device_id in 1..=4 {
        assert_eq!(engine.cache().len(device_id), 10);
    }
    assert_eq!(engine.stats().snapshot().acked, 40);
    assert!(store.alerts().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn ingestion_rejects_invalid_packets() -> Result<()> {
    // ---
    let (engine, store) = build_engine(3, 0.001);
    let (publisher, subscription) = queue::channel("packets", 8);
    let app = build_app(&engine, &store, publisher);

    let bad = [
        packet(0, 0, 0.05, 20.0).to_string(),
        packet(1, 0, -0.05, 20.0).to_string(),
        packet(1, 0, 0.05, -3.0).to_string(),
        json!({"device_id": 1, "timestamp": "yesterday", "pressure": 0.05, "temperature": 20.0})
            .to_string(),
        json!({"device_id": 1, "pressure": 0.05, "temperature": 20.0}).to_string(),
        "{not json".to_string(),
    ];
    for body in bad {
        assert_eq!(post_packet(&app, body).await?, StatusCode::BAD_REQUEST);
    }

    assert!(store.readings().await.is_empty());
    assert_eq!(
        subscription.stats().published.load(std::sync::atomic::Ordering::Relaxed),
        0
    );
    Ok(())
}

#[tokio::test]
async fn ingestion_reports_store_failure() -> Result<()> {
    // ---
    let (engine, store) = build_engine(3, 0.001);
    let (publisher, _subscription) = queue::channel("packets", 8);
    let app = build_app(&engine, &store, publisher);
    store.set_failing(true);

    let status = post_packet(&app, packet(1, 0, 0.05, 20.0).to_string()).await?;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    Ok(())
}

#[tokio::test]
async fn health_and_stats_endpoints() -> Result<()> {
    // ---
    let (engine, store) = build_engine(3, 0.001);
    let (publisher, _subscription) = queue::channel("packets", 8);
    let app = build_app(&engine, &store, publisher);

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_slice(&to_bytes(response.into_body(), usize::MAX).await?)?;
    assert_eq!(body["status"], "ok");

    let response = app
        .oneshot(Request::builder().uri("/stats").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_slice(&to_bytes(response.into_body(), usize::MAX).await?)?;
    assert_eq!(body["received"], 0);
    assert_eq!(body["acked"], 0);
    Ok(())
}
