//! ClickHouse table store.
//!
//! Rows are open JSON maps whose shape depends on the category, so they
//! are inserted with `INSERT INTO <table> FORMAT JSONEachRow` rather than
//! through a typed `Row`. The table schema is owned by ClickHouse; with
//! `skip_unknown_fields` enabled, payload keys without a matching column are
//! ignored instead of failing the insert.
//!
//! Inserts are append-only. Nothing here deduplicates rows: a redelivered
//! message appends its row again.

use super::{Row, TableStore, is_valid_table_name};
use crate::{Error, Result};
use async_trait::async_trait;
use clickhouse::Client;

/// Configuration for the ClickHouse table store.
#[derive(Debug, Clone)]
pub struct ClickHouseConfig {
    /// ClickHouse server URL (e.g., "http://localhost:8123")
    pub url: String,

    /// Database name
    pub database: String,

    /// Optional user name
    pub user: Option<String>,

    /// Optional password
    pub password: Option<String>,

    /// Ignore payload keys that have no column
    pub skip_unknown_fields: bool,
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8123".to_string(),
            database: "events".to_string(),
            user: None,
            password: None,
            skip_unknown_fields: true,
        }
    }
}

/// Appends rows to ClickHouse tables.
pub struct ClickHouseTableStore {
    client: Client,
    config: ClickHouseConfig,
}

impl ClickHouseTableStore {
    /// Create a new ClickHouse table store.
    pub fn new(config: ClickHouseConfig) -> Self {
        let mut client = Client::default()
            .with_url(&config.url)
            .with_database(&config.database);
        if let Some(user) = &config.user {
            client = client.with_user(user);
        }
        if let Some(password) = &config.password {
            client = client.with_password(password);
        }
        if config.skip_unknown_fields {
            client = client.with_option("input_format_skip_unknown_fields", "1");
        }

        tracing::info!(
            "ClickHouse table store initialized: url={}, database={}",
            config.url,
            config.database
        );

        Self { client, config }
    }

    pub fn config(&self) -> &ClickHouseConfig {
        &self.config
    }

    /// Check that ClickHouse is reachable and answering queries.
    pub async fn health_check(&self) -> Result<()> {
        let result: u8 = self.client.query("SELECT 1").fetch_one().await?;
        if result != 1 {
            return Err(Error::TableStore(format!(
                "unexpected health check result from {}: {}",
                self.config.url, result
            )));
        }
        Ok(())
    }
}

/// Build the `JSONEachRow` insert statement for `rows`.
///
/// `?` is the client's bind placeholder, so literal question marks in the
/// payload are escaped as `??`.
fn build_insert(table: &str, rows: &[Row]) -> Result<String> {
    let mut sql = format!("INSERT INTO {} FORMAT JSONEachRow\n", table);
    for row in rows {
        let line = serde_json::to_string(row)?;
        sql.push_str(&line.replace('?', "??"));
        sql.push('\n');
    }
    Ok(sql)
}

#[async_trait]
impl TableStore for ClickHouseTableStore {
    fn name(&self) -> &'static str {
        "clickhouse"
    }

    async fn append(&self, table: &str, rows: &[Row]) -> Result<()> {
        if !is_valid_table_name(table) {
            return Err(Error::TableStore(format!("invalid table name: {:?}", table)));
        }
        if rows.is_empty() {
            return Ok(());
        }

        let sql = build_insert(table, rows)?;
        self.client.query(&sql).execute().await?;

        tracing::debug!(table, rows = rows.len(), "appended rows to ClickHouse");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_default() {
        let config = ClickHouseConfig::default();
        assert_eq!(config.database, "events");
        assert!(config.skip_unknown_fields);
    }

    #[test]
    fn test_build_insert() {
        let rows = vec![
            json!({"event_type": "order", "order_id": "o-1"})
                .as_object()
                .cloned()
                .unwrap(),
            json!({"event_type": "order", "note": "why?"})
                .as_object()
                .cloned()
                .unwrap(),
        ];
        let sql = build_insert("orders", &rows).unwrap();
        let mut lines = sql.lines();
        assert_eq!(lines.next(), Some("INSERT INTO orders FORMAT JSONEachRow"));
        assert_eq!(
            lines.next(),
            Some(r#"{"event_type":"order","order_id":"o-1"}"#)
        );
        assert_eq!(lines.next(), Some(r#"{"event_type":"order","note":"why??"}"#));
        assert_eq!(lines.next(), None);
    }

    #[tokio::test]
    async fn test_append_rejects_invalid_table() {
        let store = ClickHouseTableStore::new(ClickHouseConfig::default());
        let result = store.append("orders; DROP TABLE x", &[]).await;
        assert!(matches!(result, Err(Error::TableStore(_))));
    }

    #[tokio::test]
    async fn test_health_check_fails_when_unreachable() {
        let store = ClickHouseTableStore::new(ClickHouseConfig {
            url: "http://127.0.0.1:1".to_string(),
            ..Default::default()
        });
        assert!(matches!(store.health_check().await, Err(Error::ClickHouse(_))));
    }

    // Append tests would require a running ClickHouse instance
}
