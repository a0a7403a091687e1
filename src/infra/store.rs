//! Append-only persistent store for telemetry events.
//!
//! One SQLite file, four indexes, type-driven column extraction. The full
//! event JSON is always kept in the payload column; the extracted columns
//! exist only so queries stay indexed.

use {
    crate::{
        domain::telemetry::{Direction, Event},
        infra::metrics,
    },
    serde::Serialize,
    sqlx::{
        sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
        QueryBuilder, Row, SqlitePool,
    },
    std::{path::Path, time::Duration},
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("event is not serializable: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A persisted event row.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEvent {
    pub id: i64,
    pub event_type: String,
    pub timestamp: i64,
    pub node_id: String,
    pub direction: Option<String>,
    pub peer_id: Option<String>,
    pub packet_id: Option<String>,
    pub amount: Option<String>,
    pub destination: Option<String>,
    pub payload: serde_json::Value,
}

impl StoredEvent {
    fn from_row(row: SqliteRow) -> Result<Self, sqlx::Error> {
        let payload: String = row.try_get("payload")?;
        Ok(Self {
            id: row.try_get("id")?,
            event_type: row.try_get("event_type")?,
            timestamp: row.try_get("timestamp")?,
            node_id: row.try_get("node_id")?,
            direction: row.try_get("direction")?,
            peer_id: row.try_get("peer_id")?,
            packet_id: row.try_get("packet_id")?,
            amount: row.try_get("amount")?,
            destination: row.try_get("destination")?,
            payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        })
    }
}

/// Query filter; all fields are conjunctive.
#[derive(Clone, Debug, Default)]
pub struct Filter {
    pub event_types: Vec<String>,
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub peer_id: Option<String>,
    pub packet_id: Option<String>,
    pub direction: Option<Direction>,
}

/// Retention knobs; see [`EventStore::run_retention_policy`].
#[derive(Clone, Copy, Debug)]
pub struct Retention {
    pub max_age: Duration,
    pub max_event_count: u64,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(7 * 24 * 3600),
            max_event_count: 1_000_000,
        }
    }
}

pub const DEFAULT_QUERY_LIMIT: u32 = 50;

pub struct EventStore {
    pool: SqlitePool,
    retention: Retention,
}

impl EventStore {
    pub async fn open(path: &Path, retention: Retention) -> Result<Self, Error> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self { pool, retention };
        store.migrate().await?;
        Ok(store)
    }

    /// An in-memory store, used by tests and nodes that opt out of
    /// persistence.
    pub async fn open_in_memory(retention: Retention) -> Result<Self, Error> {
        // A single pinned connection keeps the in-memory database alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(SqliteConnectOptions::new().filename(":memory:"))
            .await?;
        let store = Self { pool, retention };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_type TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                node_id TEXT NOT NULL,
                direction TEXT,
                peer_id TEXT,
                packet_id TEXT,
                amount TEXT,
                destination TEXT,
                payload TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        for index in [
            "CREATE INDEX IF NOT EXISTS idx_events_type ON events (event_type)",
            "CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events (timestamp DESC)",
            "CREATE INDEX IF NOT EXISTS idx_events_peer ON events (peer_id)",
            "CREATE INDEX IF NOT EXISTS idx_events_packet ON events (packet_id)",
        ] {
            sqlx::query(index).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn store_event(&self, event: &Event) -> Result<i64, Error> {
        let mut conn = self.pool.acquire().await?;
        let id = Self::insert(&mut conn, event).await?;
        metrics::store_write("ok");
        Ok(id)
    }

    /// Stores the batch in one transaction: either every event lands or none
    /// does.
    pub async fn store_events(&self, events: &[Event]) -> Result<Vec<i64>, Error> {
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(events.len());
        for event in events {
            ids.push(Self::insert(&mut tx, event).await?);
        }
        tx.commit().await?;
        metrics::store_write("ok");
        Ok(ids)
    }

    async fn insert(
        conn: &mut sqlx::SqliteConnection,
        event: &Event,
    ) -> Result<i64, Error> {
        let extracted = event.kind.extracted();
        let payload = serde_json::to_string(event)?;
        let result = sqlx::query(
            "INSERT INTO events
                (event_type, timestamp, node_id, direction, peer_id, packet_id, amount, destination, payload)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(event.kind.name())
        .bind(event.timestamp.millis())
        .bind(&event.node_id)
        .bind(extracted.direction.map(|direction| direction.as_str()))
        .bind(extracted.peer_id)
        .bind(extracted.packet_id)
        .bind(extracted.amount)
        .bind(extracted.destination)
        .bind(payload)
        .execute(&mut *conn)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Matching events, newest first.
    pub async fn query_events(
        &self,
        filter: &Filter,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<StoredEvent>, Error> {
        let mut builder = QueryBuilder::new("SELECT * FROM events");
        Self::push_filter(&mut builder, filter);
        builder.push(" ORDER BY timestamp DESC, id DESC LIMIT ");
        builder.push_bind(limit as i64);
        builder.push(" OFFSET ");
        builder.push_bind(offset as i64);

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|row| StoredEvent::from_row(row).map_err(Error::from))
            .collect()
    }

    pub async fn count_events(&self, filter: &Filter) -> Result<i64, Error> {
        let mut builder = QueryBuilder::new("SELECT COUNT(*) AS n FROM events");
        Self::push_filter(&mut builder, filter);
        let row = builder.build().fetch_one(&self.pool).await?;
        Ok(row.try_get("n")?)
    }

    fn push_filter<'a>(builder: &mut QueryBuilder<'a, sqlx::Sqlite>, filter: &'a Filter) {
        builder.push(" WHERE 1 = 1");
        if !filter.event_types.is_empty() {
            builder.push(" AND event_type IN (");
            {
                let mut separated = builder.separated(", ");
                for event_type in &filter.event_types {
                    separated.push_bind(event_type);
                }
            }
            builder.push(")");
        }
        if let Some(since) = filter.since {
            builder.push(" AND timestamp >= ");
            builder.push_bind(since);
        }
        if let Some(until) = filter.until {
            builder.push(" AND timestamp <= ");
            builder.push_bind(until);
        }
        if let Some(peer_id) = &filter.peer_id {
            builder.push(" AND peer_id = ");
            builder.push_bind(peer_id);
        }
        if let Some(packet_id) = &filter.packet_id {
            builder.push(" AND packet_id = ");
            builder.push_bind(packet_id);
        }
        if let Some(direction) = filter.direction {
            builder.push(" AND direction = ");
            builder.push_bind(direction.as_str());
        }
    }

    /// Deletes events older than the retention age. Returns how many rows
    /// went away.
    pub async fn prune_by_age(&self) -> Result<u64, Error> {
        let cutoff = chrono::Utc::now().timestamp_millis() - self.retention.max_age.as_millis() as i64;
        let result = sqlx::query("DELETE FROM events WHERE timestamp < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Keeps only the newest `max_event_count` rows.
    pub async fn prune_by_count(&self) -> Result<u64, Error> {
        let result = sqlx::query(
            "DELETE FROM events WHERE id NOT IN
                (SELECT id FROM events ORDER BY timestamp DESC, id DESC LIMIT ?)",
        )
        .bind(self.retention.max_event_count as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn run_retention_policy(&self) -> Result<u64, Error> {
        let by_age = self.prune_by_age().await?;
        let by_count = self.prune_by_count().await?;
        if by_age + by_count > 0 {
            tracing::debug!(by_age, by_count, "retention pass pruned events");
        }
        Ok(by_age + by_count)
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::domain::{
            account::{AssetId, PeerId},
            eth::U256,
            packet::PacketId,
            telemetry::{Kind, Timestamp},
        },
    };

    fn event(kind: Kind, millis: i64) -> Event {
        Event {
            node_id: "node-test".to_owned(),
            timestamp: Timestamp::from_millis(millis),
            kind,
        }
    }

    fn packet_received(peer: &str, packet: &str, millis: i64) -> Event {
        event(
            Kind::PacketReceived {
                peer_id: PeerId::new(peer),
                packet_id: PacketId::new(packet),
                destination: "g.c.x".parse().unwrap(),
                amount: U256::from(1000),
            },
            millis,
        )
    }

    async fn store() -> EventStore {
        EventStore::open_in_memory(Retention::default()).await.unwrap()
    }

    #[tokio::test]
    async fn query_orders_newest_first_and_counts_match() {
        let store = store().await;
        for i in 0..5 {
            store
                .store_event(&packet_received("peer-a", &format!("p-{i}"), 1000 + i))
                .await
                .unwrap();
        }

        let filter = Filter::default();
        let events = store.query_events(&filter, 50, 0).await.unwrap();
        let timestamps: Vec<_> = events.iter().map(|event| event.timestamp).collect();
        assert_eq!(timestamps, vec![1004, 1003, 1002, 1001, 1000]);
        assert_eq!(store.count_events(&filter).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn filters_compose() {
        let store = store().await;
        store
            .store_event(&packet_received("peer-a", "p-1", 1000))
            .await
            .unwrap();
        store
            .store_event(&packet_received("peer-b", "p-2", 2000))
            .await
            .unwrap();
        store
            .store_event(&event(
                Kind::AccountBalance {
                    peer_id: PeerId::new("peer-b"),
                    asset: AssetId::new("ILP"),
                    credit_balance: U256::from(5500),
                    debit_balance: U256::ZERO,
                    net_balance: "5500".to_owned(),
                },
                3000,
            ))
            .await
            .unwrap();

        let by_type = Filter {
            event_types: vec!["ACCOUNT_BALANCE".to_owned()],
            ..Default::default()
        };
        assert_eq!(store.count_events(&by_type).await.unwrap(), 1);

        let by_peer = Filter {
            peer_id: Some("peer-b".to_owned()),
            ..Default::default()
        };
        assert_eq!(store.count_events(&by_peer).await.unwrap(), 2);

        let by_packet = Filter {
            packet_id: Some("p-1".to_owned()),
            ..Default::default()
        };
        let found = store.query_events(&by_packet, 50, 0).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].peer_id.as_deref(), Some("peer-a"));
        assert_eq!(found[0].payload["type"], "PACKET_RECEIVED");

        let by_window = Filter {
            since: Some(1500),
            until: Some(2500),
            ..Default::default()
        };
        assert_eq!(store.count_events(&by_window).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn batch_store_is_atomic() {
        let store = store().await;
        let ids = store
            .store_events(&[
                packet_received("peer-a", "p-1", 1000),
                packet_received("peer-a", "p-2", 1001),
            ])
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids[1] > ids[0]);
        assert_eq!(store.count_events(&Filter::default()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn prune_by_age_removes_old_rows() {
        let store = EventStore::open_in_memory(Retention {
            max_age: Duration::from_secs(60),
            max_event_count: 1_000_000,
        })
        .await
        .unwrap();

        let now = chrono::Utc::now().timestamp_millis();
        store
            .store_event(&packet_received("peer-a", "old", now - 120_000))
            .await
            .unwrap();
        store
            .store_event(&packet_received("peer-a", "new", now))
            .await
            .unwrap();

        assert_eq!(store.prune_by_age().await.unwrap(), 1);
        let remaining = store.query_events(&Filter::default(), 50, 0).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].packet_id.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn prune_by_count_keeps_the_newest() {
        let store = EventStore::open_in_memory(Retention {
            max_age: Duration::from_secs(3600),
            max_event_count: 2,
        })
        .await
        .unwrap();

        for i in 0..5 {
            store
                .store_event(&packet_received("peer-a", &format!("p-{i}"), 1000 + i))
                .await
                .unwrap();
        }
        assert_eq!(store.prune_by_count().await.unwrap(), 3);
        let remaining = store.query_events(&Filter::default(), 50, 0).await.unwrap();
        let packets: Vec<_> = remaining
            .iter()
            .map(|event| event.packet_id.clone().unwrap())
            .collect();
        assert_eq!(packets, vec!["p-4", "p-3"]);
    }

    #[tokio::test]
    async fn iso8601_timestamps_normalize_to_millis() {
        let store = store().await;
        let event: Event = serde_json::from_value(serde_json::json!({
            "nodeId": "node-test",
            "timestamp": "2023-11-14T22:13:20Z",
            "type": "NODE_STATUS",
            "status": "healthy",
        }))
        .unwrap();
        store.store_event(&event).await.unwrap();

        let stored = store.query_events(&Filter::default(), 50, 0).await.unwrap();
        assert_eq!(stored[0].timestamp, 1700000000000);
    }
}
