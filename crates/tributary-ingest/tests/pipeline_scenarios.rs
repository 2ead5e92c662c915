//! End-to-end scenarios: subscription → pipeline → archive + tables.
//!
//! All scenarios run against the in-memory stores except the last one,
//! which replays a JSONL file into the filesystem stores.

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tributary_core::{RawMessage, RoutingTable};
use tributary_core::metrics::HealthState;
use tributary_ingest::{
    BlobStore, Disposition, JsonlConfig, JsonlInput, JsonlSource, JsonlTableStore,
    LocalBlobStore, MemoryBlobStore, MemorySubscription, MemorySubscriptionConfig,
    MemoryTableStore, Pipeline, PipelineConfig, PipelineStats, RetryPolicy, TableStore,
};

fn config() -> PipelineConfig {
    PipelineConfig {
        workers: 16,
        pull_batch: 8,
        retry: RetryPolicy::none(),
        table_batch_size: 4,
        table_flush_interval: Duration::from_millis(10),
        pull_error_backoff: Duration::from_millis(10),
        ..Default::default()
    }
}

fn subscription(max_deliveries: u32) -> Arc<MemorySubscription> {
    Arc::new(MemorySubscription::new(
        "scenario",
        MemorySubscriptionConfig {
            max_deliveries,
            poll_timeout: Duration::from_millis(10),
            ..Default::default()
        },
    ))
}

struct Harness {
    pipeline: Arc<Pipeline>,
    blobs: Arc<MemoryBlobStore>,
    tables: Arc<MemoryTableStore>,
}

impl Harness {
    fn new(config: PipelineConfig) -> Self {
        let blobs = Arc::new(MemoryBlobStore::new());
        let tables = Arc::new(MemoryTableStore::new());
        let pipeline = Pipeline::new(
            RoutingTable::default(),
            blobs.clone(),
            tables.clone(),
            config,
            HealthState::default(),
        )
        .unwrap();
        Self {
            pipeline: Arc::new(pipeline),
            blobs,
            tables,
        }
    }

    /// Close the subscription and process until it is exhausted.
    async fn drain(&self, sub: &Arc<MemorySubscription>) -> PipelineStats {
        sub.close();
        let stats = tokio::time::timeout(
            Duration::from_secs(10),
            self.pipeline
                .clone()
                .run(sub.clone(), Arc::new(AtomicBool::new(true))),
        )
        .await
        .expect("pipeline did not finish")
        .unwrap();
        self.pipeline.shutdown().await;
        stats
    }
}

fn blob_json(blobs: &MemoryBlobStore, key: &str) -> Value {
    serde_json::from_slice(&blobs.get(key).expect("blob missing")).unwrap()
}

#[tokio::test]
async fn order_is_archived_by_order_date_and_appended() {
    let harness = Harness::new(config());
    let sub = subscription(5);
    let payload = json!({
        "event_type": "order",
        "order_id": "o-1001",
        "order_date": "2025-11-04T14:30:00Z",
        "amount": 42.5,
        "items": [{"sku": "a", "qty": 2}],
        "gift": false,
        "coupon": null
    });
    sub.publish(payload.to_string()).unwrap();

    let stats = harness.drain(&sub).await;
    assert_eq!(stats.delivered, 1);

    let key = "order/2025/11/04/14/30/order_20251104143000.json";
    assert_eq!(harness.blobs.keys(), vec![key.to_string()]);

    let rows = harness.tables.rows("orders");
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    for (k, v) in payload.as_object().unwrap() {
        assert_eq!(row.get(k), Some(v), "field {k}");
    }
    assert!(row.contains_key("ingested_at"));
    assert_eq!(row.len(), payload.as_object().unwrap().len() + 1);

    let blob = blob_json(&harness.blobs, key);
    assert_eq!(&blob, &Value::Object(row.clone()));
}

#[tokio::test]
async fn bad_timestamp_falls_back_to_ingestion_time() {
    let harness = Harness::new(config());
    let sub = subscription(5);
    sub.publish(r#"{"event_type":"inventory","sku":"w-1","timestamp":"bad-value"}"#)
        .unwrap();

    let stats = harness.drain(&sub).await;
    assert_eq!(stats.delivered, 1);

    let rows = harness.tables.rows("inventory");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["timestamp"], "bad-value");

    let ingested_at: DateTime<Utc> = rows[0]["ingested_at"]
        .as_str()
        .unwrap()
        .parse()
        .unwrap();
    let expected = format!(
        "inventory/{}/inventory_{}.json",
        ingested_at.format("%Y/%m/%d/%H/%M"),
        ingested_at.format("%Y%m%d%H%M%S")
    );
    assert_eq!(harness.blobs.keys(), vec![expected]);
}

#[tokio::test]
async fn malformed_payloads_produce_no_events() {
    let harness = Harness::new(config());
    let sub = subscription(5);
    sub.publish(vec![0xff, 0xfe, 0x7b]).unwrap();
    sub.publish("not json").unwrap();
    sub.publish("[1, 2, 3]").unwrap();
    sub.publish(r#""a string""#).unwrap();
    sub.publish("").unwrap();

    let stats = harness.drain(&sub).await;
    assert_eq!(stats.received, 5);
    assert_eq!(stats.decode_failures, 5);
    assert_eq!(stats.acked, 5);
    assert!(harness.blobs.is_empty());
    assert_eq!(harness.tables.total_rows(), 0);
    assert!(sub.dead_letter_ids().is_empty());
}

#[tokio::test]
async fn poison_message_does_not_block_the_rest() {
    let harness = Harness::new(config());
    let sub = subscription(5);
    sub.publish("{").unwrap();
    for i in 0..10 {
        sub.publish(format!(r#"{{"event_type":"user_activity","user":"u-{}"}}"#, i))
            .unwrap();
    }

    let stats = harness.drain(&sub).await;
    assert_eq!(stats.decode_failures, 1);
    assert_eq!(stats.delivered, 10);
    assert_eq!(harness.tables.rows("user_activity").len(), 10);
}

#[tokio::test]
async fn redelivered_message_is_written_twice() {
    let harness = Harness::new(config());
    let sub = subscription(5);
    let payload = br#"{"event_type":"order","order_id":"o-7","order_date":"2025-11-04T14:30:00Z"}"#;
    sub.publish_message(RawMessage::new("dup-1", payload.to_vec()))
        .unwrap();
    sub.publish_message(RawMessage::new("dup-1", payload.to_vec()))
        .unwrap();

    let stats = harness.drain(&sub).await;
    assert_eq!(stats.delivered, 2);

    // Rows are not deduplicated.
    let rows = harness.tables.rows("orders");
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r["order_id"] == "o-7"));

    // Same event time, same key: the second write overwrites the first.
    assert_eq!(harness.blobs.put_count(), 2);
    assert_eq!(harness.blobs.len(), 1);
}

#[tokio::test]
async fn unique_suffix_separates_same_second_events() {
    let harness = Harness::new(PipelineConfig {
        archive_unique_suffix: true,
        ..config()
    });
    let sub = subscription(5);
    for id in ["a", "b"] {
        sub.publish_message(RawMessage::new(
            format!("msg-{}", id),
            br#"{"event_type":"order","order_date":"2025-11-04T14:30:00Z"}"#.to_vec(),
        ))
        .unwrap();
    }

    harness.drain(&sub).await;
    assert_eq!(
        harness.blobs.keys(),
        vec![
            "order/2025/11/04/14/30/order_20251104143000_msg-a.json".to_string(),
            "order/2025/11/04/14/30/order_20251104143000_msg-b.json".to_string(),
        ]
    );
}

#[tokio::test]
async fn table_failure_nacks_and_redelivery_completes() {
    let harness = Harness::new(config());
    harness.tables.fail_next(1);
    let sub = subscription(5);
    sub.publish(r#"{"event_type":"order","order_id":"o-9","order_date":"2025-11-04T14:30:00Z"}"#)
        .unwrap();

    let stats = harness.drain(&sub).await;
    assert_eq!(stats.delivery_failures, 1);
    assert_eq!(stats.delivered, 1);
    assert_eq!(stats.nacked, 1);
    assert_eq!(stats.acked, 1);

    let sub_stats = sub.stats();
    assert_eq!(sub_stats.redelivered, 1);
    assert_eq!(sub_stats.dead_lettered, 0);

    // The archive branch succeeded both times; the table got one row.
    assert_eq!(harness.blobs.put_count(), 2);
    assert_eq!(harness.tables.rows("orders").len(), 1);
}

#[tokio::test]
async fn archive_failure_does_not_stop_table_append() {
    let harness = Harness::new(config());
    harness.blobs.fail_next(1);
    let sub = subscription(5);
    sub.publish(r#"{"event_type":"inventory","sku":"s-1","timestamp":"2025-03-01 08:15:00"}"#)
        .unwrap();

    let stats = harness.drain(&sub).await;
    assert_eq!(stats.delivery_failures, 1);
    assert_eq!(stats.delivered, 1);

    // Redelivery appends the row a second time.
    assert_eq!(harness.tables.rows("inventory").len(), 2);
    assert_eq!(
        harness.blobs.keys(),
        vec!["inventory/2025/03/01/08/15/inventory_20250301081500.json".to_string()]
    );
}

#[tokio::test]
async fn sustained_outage_dead_letters_after_max_deliveries() {
    let harness = Harness::new(config());
    harness.tables.set_unavailable(true);
    let sub = subscription(3);
    sub.publish(r#"{"event_type":"user_activity","user":"u-1"}"#)
        .unwrap();

    let stats = harness.drain(&sub).await;
    assert_eq!(stats.delivery_failures, 3);
    assert_eq!(stats.nacked, 3);
    assert_eq!(sub.dead_letter_ids().len(), 1);
    assert_eq!(harness.tables.total_rows(), 0);
}

#[tokio::test]
async fn rejected_row_does_not_hold_back_its_batch() {
    let harness = Harness::new(config());
    harness.tables.reject_where("qty", json!("lots"));
    let sub = subscription(3);

    let mut good = Vec::new();
    for (id, qty) in [("o-1", 1), ("o-2", 2), ("o-3", 3)] {
        let payload = json!({
            "event_type": "order",
            "order_id": id,
            "order_date": "2025-11-04T14:30:00Z",
            "qty": qty
        });
        good.push(sub.publish(payload.to_string()).unwrap());
    }
    let poison = sub
        .publish(r#"{"event_type":"order","order_id":"o-4","order_date":"2025-11-04T14:30:00Z","qty":"lots"}"#)
        .unwrap();

    let stats = harness.drain(&sub).await;
    assert_eq!(stats.delivered, 3);
    assert_eq!(stats.delivery_failures, 3);
    assert_eq!(sub.dead_letter_ids(), vec![poison]);
    assert_eq!(sub.stats().acked, good.len() as u64);

    let mut ids: Vec<String> = harness
        .tables
        .rows("orders")
        .iter()
        .filter_map(|r| r["order_id"].as_str().map(str::to_string))
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["o-1", "o-2", "o-3"]);
}

#[tokio::test]
async fn unroutable_events_are_dropped_by_default() {
    let harness = Harness::new(config());
    let sub = subscription(5);
    sub.publish(r#"{"event_type":"refund","amount":3}"#).unwrap();
    sub.publish(r#"{"amount":3}"#).unwrap();
    sub.publish(r#"{"event_type":7}"#).unwrap();

    let stats = harness.drain(&sub).await;
    assert_eq!(stats.unroutable, 3);
    assert_eq!(stats.acked, 3);
    assert!(harness.blobs.is_empty());
    assert_eq!(harness.tables.total_rows(), 0);
}

#[tokio::test]
async fn unroutable_events_can_be_archived() {
    let harness = Harness::new(PipelineConfig {
        archive_unroutable: true,
        archive_prefix: "forensics".to_string(),
        ..config()
    });
    let sub = subscription(5);
    sub.publish(r#"{"event_type":"refund","amount":3}"#).unwrap();

    let stats = harness.drain(&sub).await;
    assert_eq!(stats.unroutable, 1);

    let keys = harness.blobs.keys();
    assert_eq!(keys.len(), 1);
    assert!(keys[0].starts_with("forensics/_unroutable/"), "{}", keys[0]);
    assert_eq!(harness.tables.total_rows(), 0);
    assert_eq!(blob_json(&harness.blobs, &keys[0])["event_type"], "refund");
}

#[tokio::test]
async fn direct_processing_reports_dispositions() {
    let harness = Harness::new(config());
    let msg = |payload: &str| RawMessage::new("direct", payload.as_bytes().to_vec());

    assert_eq!(
        harness
            .pipeline
            .process(&msg(r#"{"event_type":"inventory"}"#))
            .await,
        Disposition::Delivered
    );
    assert_eq!(
        harness.pipeline.process(&msg("{]")).await,
        Disposition::DecodeFailure
    );
    assert_eq!(
        harness.pipeline.process(&msg(r#"{"event_type":"x"}"#)).await,
        Disposition::Unroutable
    );
    harness.pipeline.shutdown().await;
}

#[tokio::test]
async fn jsonl_replay_into_filesystem_stores() {
    let tmp = TempDir::new().unwrap();
    let input = tmp.path().join("events.jsonl");
    std::fs::write(
        &input,
        concat!(
            r#"{"event_type":"order","order_id":"o-1","order_date":"2025-11-04T14:30:00Z"}"#,
            "\n",
            r#"{"event_type":"user_activity","user":"u-1","timestamp":"2025-11-04T09:05:07+02:00"}"#,
            "\n",
            "\n",
            "garbage\n",
        ),
    )
    .unwrap();

    let archive_dir = tmp.path().join("archive");
    let table_dir = tmp.path().join("tables");
    let blobs: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new(&archive_dir).unwrap());
    let table_store = Arc::new(JsonlTableStore::new(&table_dir).unwrap());
    let tables: Arc<dyn TableStore> = table_store.clone();

    let pipeline = Arc::new(
        Pipeline::new(
            RoutingTable::default(),
            blobs,
            tables,
            config(),
            HealthState::default(),
        )
        .unwrap(),
    );
    let sub = subscription(5);
    let running = Arc::new(AtomicBool::new(true));

    let source = JsonlSource::new(JsonlConfig {
        input: JsonlInput::Path(input),
        ..Default::default()
    });
    let source_stats = source.run(&sub, &CancellationToken::new()).await.unwrap();
    assert_eq!(source_stats.messages_published, 3);

    let stats = pipeline.clone().run(sub.clone(), running).await.unwrap();
    pipeline.shutdown().await;
    assert_eq!(stats.delivered, 2);
    assert_eq!(stats.decode_failures, 1);

    assert!(
        archive_dir
            .join("order/2025/11/04/14/30/order_20251104143000.json")
            .is_file()
    );
    // +02:00 is normalised to UTC.
    assert!(
        archive_dir
            .join("user_activity/2025/11/04/07/05/user_activity_20251104070507.json")
            .is_file()
    );

    let orders = std::fs::read_to_string(table_store.table_path("orders")).unwrap();
    let lines: Vec<Value> = orders
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["order_id"], "o-1");
    assert!(table_store.table_path("user_activity").is_file());
}

#[tokio::test]
async fn shutdown_releases_loader_blocked_on_full_queue() {
    let tmp = TempDir::new().unwrap();
    let input = tmp.path().join("events.jsonl");
    std::fs::write(
        &input,
        concat!(
            r#"{"event_type":"inventory","sku":"s-1","timestamp":"2025-03-01 08:15:00"}"#,
            "\n",
            r#"{"event_type":"inventory","sku":"s-2","timestamp":"2025-03-01 08:16:00"}"#,
            "\n",
            r#"{"event_type":"inventory","sku":"s-3","timestamp":"2025-03-01 08:17:00"}"#,
            "\n",
        ),
    )
    .unwrap();

    let harness = Harness::new(config());
    let sub = subscription(5);
    let source = JsonlSource::new(JsonlConfig {
        input: JsonlInput::Path(input),
        max_pending: 1,
        ..Default::default()
    });

    // No consumer is pulling, so the loader parks after the first line.
    let cancel = CancellationToken::new();
    let loader = {
        let sub = sub.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { source.run(&sub, &cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!loader.is_finished());

    cancel.cancel();
    let source_stats = tokio::time::timeout(Duration::from_secs(2), loader)
        .await
        .expect("loader did not stop after shutdown")
        .unwrap()
        .unwrap();
    assert_eq!(source_stats.messages_published, 1);
    assert!(sub.is_closed());

    // What was already queued is still processed.
    let stats = harness.drain(&sub).await;
    assert_eq!(stats.delivered, 1);
    assert_eq!(harness.tables.rows("inventory").len(), 1);
}
