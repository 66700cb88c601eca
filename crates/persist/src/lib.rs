//! Vicinity persistence: a SQLite `GeoStore`.
//! One table, one geohash index; range scans are `BETWEEN` on the index.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Context;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::watch;
use tracing::debug;
use vicinity_core::{Coordinate, Entity, EntityId, Filter, GeoKey, StoreError, Tier, Value};
use vicinity_store::GeoStore;

const SELECT_COLUMNS: &str = "SELECT id, lat, lng, tier, recency_at, credits, attrs FROM entities";

/// SQLite-backed store. The connection is shared behind a mutex and driven from the
/// blocking pool so async callers never stall the runtime.
pub struct SqliteStore {
    db: Arc<Mutex<Connection>>,
    epoch_tx: watch::Sender<u64>,
}

impl SqliteStore {
    /// Open the database named by `VICINITY_DB_PATH`, or `~/.vicinity/vicinity.db`.
    pub fn open_default() -> anyhow::Result<Self> {
        let path = std::env::var("VICINITY_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> anyhow::Result<Self> {
        let started = Instant::now();
        let db = Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS entities (
                id         TEXT PRIMARY KEY,
                lat        REAL,
                lng        REAL,
                geohash    TEXT,
                tier       INTEGER NOT NULL,
                recency_at INTEGER NOT NULL,
                credits    INTEGER NOT NULL,
                attrs      TEXT NOT NULL
            )",
            [],
        )
        .context("creating entities table")?;
        db.execute("CREATE INDEX IF NOT EXISTS idx_entities_geohash ON entities(geohash)", [])
            .context("creating geohash index")?;
        let (epoch_tx, _rx) = watch::channel(0u64);
        let me = Self { db: Arc::new(Mutex::new(db)), epoch_tx };
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(path, "sqlite store opened");
        Ok(me)
    }

    async fn with_db<R, F>(&self, op: &'static str, f: F) -> Result<R, StoreError>
    where
        R: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<R, StoreError> + Send + 'static,
    {
        let started = Instant::now();
        let db = Arc::clone(&self.db);
        let out = tokio::task::spawn_blocking(move || {
            let mut conn = db.lock().map_err(|_| StoreError::Unavailable("sqlite connection poisoned".into()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("sqlite worker: {}", e)))?;
        histogram!("persist_op_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => op);
        if out.is_err() {
            counter!("persist_errors_total", 1u64, "op" => op);
        }
        out
    }

    fn bump_epoch(&self) {
        self.epoch_tx.send_modify(|e| *e = e.saturating_add(1));
    }
}

fn sql_err(e: rusqlite::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

/// Row as stored; converted to an `Entity` outside the rusqlite row callback.
struct Row {
    id: String,
    lat: Option<f64>,
    lng: Option<f64>,
    tier: i64,
    recency_ms: i64,
    credits: i64,
    attrs: String,
}

impl Row {
    fn read(r: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            lat: r.get(1)?,
            lng: r.get(2)?,
            tier: r.get(3)?,
            recency_ms: r.get(4)?,
            credits: r.get(5)?,
            attrs: r.get(6)?,
        })
    }

    fn into_entity(self) -> Result<Entity, StoreError> {
        let id = EntityId::parse(self.id).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let location = match (self.lat, self.lng) {
            (Some(lat), Some(lng)) => {
                Some(GeoKey::new(Coordinate { lat, lng }).map_err(|e| StoreError::Corrupt(format!("{}: {}", id, e)))?)
            }
            _ => None,
        };
        let tier = u8::try_from(self.tier).map_err(|_| StoreError::Corrupt(format!("{}: tier {}", id, self.tier)))?;
        let credits =
            u32::try_from(self.credits).map_err(|_| StoreError::Corrupt(format!("{}: credits {}", id, self.credits)))?;
        let recency_at = DateTime::<Utc>::from_timestamp_millis(self.recency_ms)
            .ok_or_else(|| StoreError::Corrupt(format!("{}: recency_at {}", id, self.recency_ms)))?;
        let attributes: BTreeMap<String, Value> =
            serde_json::from_str(&self.attrs).map_err(|e| StoreError::Corrupt(format!("{}: attrs: {}", id, e)))?;
        Ok(Entity { id, location, tier: Tier(tier), recency_at, credits, attributes })
    }
}

#[async_trait::async_trait]
impl GeoStore for SqliteStore {
    async fn range_query(
        &self,
        lower: &str,
        upper: &str,
        filters: &[Filter],
        limit: Option<usize>,
    ) -> Result<Vec<Entity>, StoreError> {
        let (lower, upper, filters) = (lower.to_string(), upper.to_string(), filters.to_vec());
        self.with_db("range_query", move |db| {
            let sql = format!("{} WHERE geohash BETWEEN ?1 AND ?2 ORDER BY geohash, id", SELECT_COLUMNS);
            let mut stmt = db.prepare_cached(&sql).map_err(sql_err)?;
            let mut rows = stmt.query(params![lower, upper]).map_err(sql_err)?;
            let cap = limit.unwrap_or(usize::MAX);
            let mut out = Vec::new();
            while let Some(r) = rows.next().map_err(sql_err)? {
                if out.len() >= cap {
                    break;
                }
                let e = Row::read(r).map_err(sql_err)?.into_entity()?;
                // Attribute filters are evaluated here rather than in SQL.
                if filters.iter().all(|f| f.matches(&e.attributes)) {
                    out.push(e);
                }
            }
            Ok(out)
        })
        .await
    }

    async fn conditional_update(
        &self,
        id: &EntityId,
        expected_credits: u32,
        new_credits: u32,
        new_recency_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let id = id.as_str().to_string();
        self.with_db("conditional_update", move |db| {
            let tx = db.transaction().map_err(sql_err)?;
            let changed = tx
                .execute(
                    "UPDATE entities SET credits = ?3, recency_at = ?4 WHERE id = ?1 AND credits = ?2",
                    params![id, expected_credits, new_credits, new_recency_at.timestamp_millis()],
                )
                .map_err(sql_err)?;
            if changed == 0 {
                let actual: Option<i64> = tx
                    .query_row("SELECT credits FROM entities WHERE id = ?1", [&id], |r| r.get(0))
                    .optional()
                    .map_err(sql_err)?;
                return match actual {
                    None => Err(StoreError::NotFound),
                    Some(actual) => Err(StoreError::Conflict {
                        expected: expected_credits,
                        actual: u32::try_from(actual).unwrap_or_default(),
                    }),
                };
            }
            tx.commit().map_err(sql_err)
        })
        .await?;
        self.bump_epoch();
        Ok(())
    }

    async fn get(&self, id: &EntityId) -> Result<Option<Entity>, StoreError> {
        let id = id.as_str().to_string();
        self.with_db("get", move |db| {
            let sql = format!("{} WHERE id = ?1", SELECT_COLUMNS);
            let row = db.query_row(&sql, [&id], Row::read).optional().map_err(sql_err)?;
            row.map(Row::into_entity).transpose()
        })
        .await
    }

    async fn put(&self, entity: Entity) -> Result<(), StoreError> {
        let attrs = serde_json::to_string(&entity.attributes).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        self.with_db("put", move |db| {
            let (lat, lng, hash) = match &entity.location {
                Some(l) => (Some(l.coordinate().lat), Some(l.coordinate().lng), Some(l.hash().to_string())),
                None => (None, None, None),
            };
            db.execute(
                "INSERT OR REPLACE INTO entities(id, lat, lng, geohash, tier, recency_at, credits, attrs)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    entity.id.as_str(),
                    lat,
                    lng,
                    hash,
                    entity.tier.0,
                    entity.recency_at.timestamp_millis(),
                    entity.credits,
                    attrs
                ],
            )
            .map_err(sql_err)?;
            Ok(())
        })
        .await?;
        counter!("persist_put_total", 1u64);
        self.bump_epoch();
        Ok(())
    }

    async fn relocate(&self, id: &EntityId, location: GeoKey) -> Result<(), StoreError> {
        let id = id.as_str().to_string();
        self.with_db("relocate", move |db| {
            let c = location.coordinate();
            let changed = db
                .execute(
                    "UPDATE entities SET lat = ?2, lng = ?3, geohash = ?4 WHERE id = ?1",
                    params![id, c.lat, c.lng, location.hash()],
                )
                .map_err(sql_err)?;
            if changed == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
        .await?;
        self.bump_epoch();
        Ok(())
    }

    async fn remove(&self, id: &EntityId) -> Result<bool, StoreError> {
        let id = id.as_str().to_string();
        let removed = self
            .with_db("remove", move |db| {
                let n = db.execute("DELETE FROM entities WHERE id = ?1", [&id]).map_err(sql_err)?;
                Ok(n > 0)
            })
            .await?;
        if removed {
            self.bump_epoch();
        }
        Ok(removed)
    }

    fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.epoch_tx.subscribe()
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".vicinity");
        let _ = std::fs::create_dir_all(&p);
        p.push("vicinity.db");
        return p.to_string_lossy().to_string();
    }
    "vicinity.db".to_string()
}
