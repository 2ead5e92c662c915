//! In-memory stores for tests and dry runs.
//!
//! Both stores support failure injection: [`fail_next`](MemoryBlobStore::fail_next)
//! makes the next `n` calls fail, [`set_unavailable`](MemoryBlobStore::set_unavailable)
//! makes every call fail until cleared. [`MemoryTableStore::reject_where`]
//! rejects any append containing a matching row, the way a real table
//! rejects a row whose column types don't fit.

use super::{BlobStore, Row, TableStore};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Debug, Default)]
struct Faults {
    fail_next: AtomicUsize,
    unavailable: AtomicBool,
}

impl Faults {
    fn check(&self) -> bool {
        if self.unavailable.load(Ordering::SeqCst) {
            return true;
        }
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Blob store backed by a `BTreeMap`.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    objects: Mutex<BTreeMap<String, Bytes>>,
    puts: AtomicUsize,
    faults: Faults,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` puts.
    pub fn fail_next(&self, n: usize) {
        self.faults.fail_next.store(n, Ordering::SeqCst);
    }

    /// Fail every put while `unavailable` is true.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().get(key).cloned()
    }

    /// Stored keys in lexical order.
    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }

    /// Successful puts, overwrites included.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        if self.faults.check() {
            return Err(Error::BlobStore(format!("injected failure writing {}", key)));
        }
        self.objects.lock().insert(key.to_string(), data);
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Table store backed by a map of row vectors.
#[derive(Debug, Default)]
pub struct MemoryTableStore {
    tables: Mutex<BTreeMap<String, Vec<Row>>>,
    appends: AtomicUsize,
    faults: Faults,
    rejects: Mutex<Vec<(String, Value)>>,
}

impl MemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` appends.
    pub fn fail_next(&self, n: usize) {
        self.faults.fail_next.store(n, Ordering::SeqCst);
    }

    /// Fail every append while `unavailable` is true.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Reject every append that contains a row with `field == value`.
    pub fn reject_where(&self, field: &str, value: Value) {
        self.rejects.lock().push((field.to_string(), value));
    }

    fn rejected(&self, rows: &[Row]) -> bool {
        let rejects = self.rejects.lock();
        rows.iter().any(|row| {
            rejects
                .iter()
                .any(|(field, value)| row.get(field) == Some(value))
        })
    }

    /// Rows appended to `table`, in append order.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables.lock().get(table).cloned().unwrap_or_default()
    }

    /// Tables that have received at least one row.
    pub fn tables(&self) -> Vec<String> {
        self.tables.lock().keys().cloned().collect()
    }

    pub fn total_rows(&self) -> usize {
        self.tables.lock().values().map(Vec::len).sum()
    }

    /// Successful append calls (one per flushed batch).
    pub fn append_count(&self) -> usize {
        self.appends.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TableStore for MemoryTableStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn append(&self, table: &str, rows: &[Row]) -> Result<()> {
        if self.faults.check() {
            return Err(Error::TableStore(format!(
                "injected failure appending {} rows to {}",
                rows.len(),
                table
            )));
        }
        if self.rejected(rows) {
            return Err(Error::TableStore(format!(
                "{} rejected a row in a batch of {}",
                table,
                rows.len()
            )));
        }
        self.tables
            .lock()
            .entry(table.to_string())
            .or_default()
            .extend_from_slice(rows);
        self.appends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(v: serde_json::Value) -> Row {
        v.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_blob_put_and_overwrite() {
        let store = MemoryBlobStore::new();
        store.put("a/b.json", Bytes::from_static(b"1")).await.unwrap();
        store.put("a/b.json", Bytes::from_static(b"2")).await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.put_count(), 2);
        assert_eq!(store.get("a/b.json").unwrap(), Bytes::from_static(b"2"));
    }

    #[tokio::test]
    async fn test_blob_fail_next() {
        let store = MemoryBlobStore::new();
        store.fail_next(2);
        assert!(store.put("k", Bytes::new()).await.is_err());
        assert!(store.put("k", Bytes::new()).await.is_err());
        assert!(store.put("k", Bytes::new()).await.is_ok());
        assert_eq!(store.put_count(), 1);
    }

    #[tokio::test]
    async fn test_blob_unavailable() {
        let store = MemoryBlobStore::new();
        store.set_unavailable(true);
        assert!(store.put("k", Bytes::new()).await.is_err());
        store.set_unavailable(false);
        assert!(store.put("k", Bytes::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_table_append_keeps_existing_rows() {
        let store = MemoryTableStore::new();
        store
            .append("orders", &[row(json!({"id": 1}))])
            .await
            .unwrap();
        store
            .append("orders", &[row(json!({"id": 1})), row(json!({"id": 2}))])
            .await
            .unwrap();

        let rows = store.rows("orders");
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["id"], 1);
        assert_eq!(rows[2]["id"], 2);
        assert_eq!(store.append_count(), 2);
        assert_eq!(store.tables(), vec!["orders".to_string()]);
    }

    #[tokio::test]
    async fn test_table_failure_appends_nothing() {
        let store = MemoryTableStore::new();
        store.fail_next(1);
        assert!(store.append("orders", &[row(json!({"id": 1}))]).await.is_err());
        assert_eq!(store.total_rows(), 0);
        assert!(store.rows("orders").is_empty());
    }

    #[tokio::test]
    async fn test_table_reject_where_fails_whole_append() {
        let store = MemoryTableStore::new();
        store.reject_where("qty", json!("lots"));

        let batch = [row(json!({"qty": 1})), row(json!({"qty": "lots"}))];
        assert!(store.append("orders", &batch).await.is_err());
        assert_eq!(store.total_rows(), 0);

        store
            .append("orders", &[row(json!({"qty": 1}))])
            .await
            .unwrap();
        assert_eq!(store.rows("orders").len(), 1);
    }
}
