//! SQLite snapshot store + HTTP fetch utilities for V85 ingestion.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, Instrument};
use v85_core::{CurrentEntry, Division, DivisionError, HistoryRecord, SnapshotKind};

pub const CRATE_NAME: &str = "v85-storage";

const SCHEMA_STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS current_entries (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        date TEXT NOT NULL,
        division INTEGER NOT NULL,
        start_number TEXT NOT NULL DEFAULT '',
        horse_name TEXT NOT NULL,
        driver TEXT NOT NULL DEFAULT '',
        trainer TEXT NOT NULL DEFAULT '',
        bet_percentage TEXT NOT NULL DEFAULT '',
        win_odds TEXT NOT NULL DEFAULT '',
        sulky_type TEXT NOT NULL DEFAULT '',
        source_file TEXT NOT NULL,
        UNIQUE (date, division, horse_name)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS current_entries_source_file_idx ON current_entries(source_file)",
    r#"
    CREATE TABLE IF NOT EXISTS history_records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        date TEXT NOT NULL DEFAULT '',
        division INTEGER NOT NULL,
        horse_name TEXT NOT NULL DEFAULT '',
        track TEXT NOT NULL DEFAULT '',
        driver TEXT NOT NULL DEFAULT '',
        finishing_place TEXT NOT NULL DEFAULT '',
        distance_post_position TEXT NOT NULL DEFAULT '',
        kilometer_time TEXT NOT NULL DEFAULT '',
        shoe_configuration TEXT NOT NULL DEFAULT '',
        odds TEXT NOT NULL DEFAULT '',
        prize TEXT NOT NULL DEFAULT '',
        sulky_type TEXT NOT NULL DEFAULT '',
        source_file TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS history_records_source_file_idx ON history_records(source_file)",
];

const CURRENT_COLUMNS: &[&str] = &[
    "id",
    "date",
    "division",
    "start_number",
    "horse_name",
    "driver",
    "trainer",
    "bet_percentage",
    "win_odds",
    "sulky_type",
    "source_file",
];

const HISTORY_COLUMNS: &[&str] = &[
    "id",
    "date",
    "division",
    "horse_name",
    "track",
    "driver",
    "finishing_place",
    "distance_post_position",
    "kilometer_time",
    "shoe_configuration",
    "odds",
    "prize",
    "sulky_type",
    "source_file",
];

pub fn table_for(kind: SnapshotKind) -> &'static str {
    match kind {
        SnapshotKind::Current => "current_entries",
        SnapshotKind::History => "history_records",
    }
}

pub fn columns_for(kind: SnapshotKind) -> &'static [&'static str] {
    match kind {
        SnapshotKind::Current => CURRENT_COLUMNS,
        SnapshotKind::History => HISTORY_COLUMNS,
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("opening store {}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: sqlx::Error,
    },
    #[error("creating store directory {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("stored row carries an invalid division")]
    InvalidDivision(#[from] DivisionError),
}

/// Write side of an import run. Implementations scope every call to one
/// unit of work that is committed or discarded as a whole.
#[async_trait]
pub trait SnapshotWriter: Send {
    /// Deletes all rows of `kind` attributed to any of `source_files`.
    async fn clear_attribution(
        &mut self,
        kind: SnapshotKind,
        source_files: &[&str],
    ) -> Result<u64, StoreError>;

    /// Inserts or overwrites the row keyed by `(date, division, horse_name)`.
    async fn upsert_current(&mut self, entry: &CurrentEntry) -> Result<(), StoreError>;

    async fn insert_history(&mut self, record: &HistoryRecord) -> Result<(), StoreError>;
}

/// Rendered-as-text view of a table, used by the display command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl SnapshotStore {
    /// Opens (creating if missing) the SQLite file at `path` and bootstraps the schema.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        // One connection: runs are sequential and a transaction owns it for the whole run.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|source| StoreError::Open {
                path: path.clone(),
                source,
            })?;

        let store = Self { pool, path };
        store.bootstrap_schema().await?;
        Ok(store)
    }

    /// Opens a store that must already exist. Nothing is created or migrated.
    pub async fn open_existing(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(false)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|source| StoreError::Open {
                path: path.clone(),
                source,
            })?;
        Ok(Self { pool, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn bootstrap_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA_STATEMENTS {
            sqlx::query(*statement).execute(&self.pool).await?;
        }
        debug!(path = %self.path.display(), "schema ready");
        Ok(())
    }

    pub async fn begin(&self) -> Result<ImportTransaction, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(ImportTransaction { tx })
    }

    pub async fn count(&self, kind: SnapshotKind) -> Result<i64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM {}", table_for(kind));
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count)
    }

    pub async fn count_attributed(
        &self,
        kind: SnapshotKind,
        source_file: &str,
    ) -> Result<i64, StoreError> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE source_file = ?",
            table_for(kind)
        );
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(source_file)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn current_entries(&self) -> Result<Vec<CurrentEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT date, division, start_number, horse_name, driver, trainer,
                   bet_percentage, win_odds, sulky_type, source_file
              FROM current_entries
             ORDER BY date, division, horse_name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(current_from_row).collect()
    }

    pub async fn history_records(&self) -> Result<Vec<HistoryRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT date, division, horse_name, track, driver, finishing_place,
                   distance_post_position, kilometer_time, shoe_configuration,
                   odds, prize, sulky_type, source_file
              FROM history_records
             ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(history_from_row).collect()
    }

    /// Most recently inserted rows first, every value rendered as text.
    pub async fn recent_rows(&self, kind: SnapshotKind, limit: u32) -> Result<TableRows, StoreError> {
        let columns = columns_for(kind);
        let select = columns
            .iter()
            .map(|c| format!("CAST({c} AS TEXT) AS {c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {select} FROM {} ORDER BY id DESC LIMIT ?",
            table_for(kind)
        );
        let fetched = sqlx::query(&sql)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

        let mut rows = Vec::with_capacity(fetched.len());
        for row in &fetched {
            let mut values = Vec::with_capacity(columns.len());
            for idx in 0..columns.len() {
                let value: Option<String> = row.try_get(idx)?;
                values.push(value.unwrap_or_default());
            }
            rows.push(values);
        }

        Ok(TableRows {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
        })
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

fn division_from_row(row: &SqliteRow) -> Result<Division, StoreError> {
    let raw: i64 = row.try_get("division")?;
    Ok(Division::try_from(raw)?)
}

fn current_from_row(row: &SqliteRow) -> Result<CurrentEntry, StoreError> {
    Ok(CurrentEntry {
        date: row.try_get("date")?,
        division: division_from_row(row)?,
        start_number: row.try_get("start_number")?,
        horse_name: row.try_get("horse_name")?,
        driver: row.try_get("driver")?,
        trainer: row.try_get("trainer")?,
        bet_percentage: row.try_get("bet_percentage")?,
        win_odds: row.try_get("win_odds")?,
        sulky_type: row.try_get("sulky_type")?,
        source_file: row.try_get("source_file")?,
    })
}

fn history_from_row(row: &SqliteRow) -> Result<HistoryRecord, StoreError> {
    Ok(HistoryRecord {
        division: division_from_row(row)?,
        horse_name: row.try_get("horse_name")?,
        date: row.try_get("date")?,
        track: row.try_get("track")?,
        driver: row.try_get("driver")?,
        finishing_place: row.try_get("finishing_place")?,
        distance_post_position: row.try_get("distance_post_position")?,
        kilometer_time: row.try_get("kilometer_time")?,
        shoe_configuration: row.try_get("shoe_configuration")?,
        odds: row.try_get("odds")?,
        prize: row.try_get("prize")?,
        sulky_type: row.try_get("sulky_type")?,
        source_file: row.try_get("source_file")?,
    })
}

/// Unit of work for one import run. Dropping it without `commit` rolls back.
pub struct ImportTransaction {
    tx: Transaction<'static, Sqlite>,
}

impl ImportTransaction {
    pub async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotWriter for ImportTransaction {
    async fn clear_attribution(
        &mut self,
        kind: SnapshotKind,
        source_files: &[&str],
    ) -> Result<u64, StoreError> {
        if source_files.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; source_files.len()].join(", ");
        let sql = format!(
            "DELETE FROM {} WHERE source_file IN ({placeholders})",
            table_for(kind)
        );
        let mut query = sqlx::query(&sql);
        for name in source_files {
            query = query.bind(*name);
        }
        let result = query.execute(&mut *self.tx).await?;
        Ok(result.rows_affected())
    }

    async fn upsert_current(&mut self, entry: &CurrentEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO current_entries (
              date, division, start_number, horse_name, driver, trainer,
              bet_percentage, win_odds, sulky_type, source_file
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(date, division, horse_name) DO UPDATE SET
              start_number = excluded.start_number,
              driver = excluded.driver,
              trainer = excluded.trainer,
              bet_percentage = excluded.bet_percentage,
              win_odds = excluded.win_odds,
              sulky_type = excluded.sulky_type,
              source_file = excluded.source_file
            "#,
        )
        .bind(&entry.date)
        .bind(i64::from(entry.division.get()))
        .bind(&entry.start_number)
        .bind(&entry.horse_name)
        .bind(&entry.driver)
        .bind(&entry.trainer)
        .bind(&entry.bet_percentage)
        .bind(&entry.win_odds)
        .bind(&entry.sulky_type)
        .bind(&entry.source_file)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn insert_history(&mut self, record: &HistoryRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO history_records (
              date, division, horse_name, track, driver, finishing_place,
              distance_post_position, kilometer_time, shoe_configuration,
              odds, prize, sulky_type, source_file
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.date)
        .bind(i64::from(record.division.get()))
        .bind(&record.horse_name)
        .bind(&record.track)
        .bind(&record.driver)
        .bind(&record.finishing_place)
        .bind(&record.distance_post_position)
        .bind(&record.kilometer_time)
        .bind(&record.shoe_configuration)
        .bind(&record.odds)
        .bind(&record.prize)
        .bind(&record.sulky_type)
        .bind(&record.source_file)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            token_bucket: Some(TokenBucketConfig {
                capacity: 4,
                refill_every: Duration::from_millis(250),
            }),
        }
    }
}

/// Paces outgoing requests; one token per request.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding json from {url}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    token_bucket: Option<Arc<TokenBucket>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(TokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            token_bucket,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }
        self.fetch_with_retries(url)
            .instrument(info_span!("http_fetch", url))
            .await
    }

    pub async fn fetch_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        let response = self.fetch_bytes(url).await?;
        serde_json::from_slice(&response.body).map_err(|source| FetchError::Decode {
            url: response.final_url,
            source,
        })
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            let resp_result = self
                .client
                .get(url)
                .header(ACCEPT, "application/json")
                .send()
                .await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        debug!(status = status.as_u16(), bytes = body.len(), "fetched");
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        info!(status = status.as_u16(), attempt, "retrying after http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        info!(error = %err, attempt, "retrying after transport error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(horse: &str, odds: &str, source_file: &str) -> CurrentEntry {
        CurrentEntry {
            date: "2026-02-21".into(),
            division: Division::new(1).unwrap(),
            start_number: "01".into(),
            horse_name: horse.into(),
            driver: "Örjan Kihlström".into(),
            trainer: "Daniel Redén".into(),
            bet_percentage: "12.50".into(),
            win_odds: odds.into(),
            sulky_type: "Amerikansk".into(),
            source_file: source_file.into(),
        }
    }

    fn record(horse: &str, date: &str, source_file: &str) -> HistoryRecord {
        HistoryRecord {
            division: Division::new(2).unwrap(),
            horse_name: horse.into(),
            date: date.into(),
            track: "Solvalla".into(),
            driver: "Magnus A Djuse".into(),
            finishing_place: "1".into(),
            distance_post_position: "2140:4".into(),
            kilometer_time: "1:12,3".into(),
            shoe_configuration: "Barfota runt om".into(),
            odds: "3.40".into(),
            prize: "100000".into(),
            sulky_type: "Vanlig".into(),
            source_file: source_file.into(),
        }
    }

    #[tokio::test]
    async fn open_creates_parent_directory_and_schema() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("v85.sqlite");
        let store = SnapshotStore::open(&path).await.expect("open");
        assert!(path.exists());
        assert_eq!(store.count(SnapshotKind::Current).await.expect("count"), 0);
        assert_eq!(store.count(SnapshotKind::History).await.expect("count"), 0);
        store.bootstrap_schema().await.expect("bootstrap is idempotent");
    }

    #[tokio::test]
    async fn open_existing_never_creates_a_store() {
        let dir = tempdir().expect("tempdir");
        let missing = dir.path().join("typo.sqlite");
        let err = SnapshotStore::open_existing(&missing)
            .await
            .expect_err("missing store");
        assert!(matches!(err, StoreError::Open { .. }));
        assert!(!missing.exists());

        let path = dir.path().join("v85.sqlite");
        let store = SnapshotStore::open(&path).await.expect("create");
        let mut tx = store.begin().await.expect("begin");
        tx.upsert_current(&entry("Odin", "3.00", "v85_20260221_1.csv"))
            .await
            .expect("insert");
        tx.commit().await.expect("commit");
        store.close().await;

        let reopened = SnapshotStore::open_existing(&path).await.expect("reopen");
        assert_eq!(reopened.count(SnapshotKind::Current).await.expect("count"), 1);
    }

    #[tokio::test]
    async fn upsert_overwrites_attributes_and_attribution() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::open(dir.path().join("db.sqlite"))
            .await
            .expect("open");

        let mut tx = store.begin().await.expect("begin");
        tx.upsert_current(&entry("Odin", "3.00", "v85_20260221_1.csv"))
            .await
            .expect("insert");
        tx.upsert_current(&entry("Odin", "3.50", "v85_20260221_1b.csv"))
            .await
            .expect("update");
        tx.commit().await.expect("commit");

        let rows = store.current_entries().await.expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].win_odds, "3.50");
        assert_eq!(rows[0].source_file, "v85_20260221_1b.csv");
        assert_eq!(rows[0].start_number, "01");
    }

    #[tokio::test]
    async fn clear_attribution_removes_only_named_files() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::open(dir.path().join("db.sqlite"))
            .await
            .expect("open");

        let mut tx = store.begin().await.expect("begin");
        tx.insert_history(&record("Odin", "2026-01-01", "a.csv")).await.expect("a");
        tx.insert_history(&record("Odin", "2026-01-02", "b.csv")).await.expect("b");
        tx.insert_history(&record("Tor", "2026-01-03", "c.csv")).await.expect("c");
        let cleared = tx
            .clear_attribution(SnapshotKind::History, &["a.csv", "c.csv"])
            .await
            .expect("clear");
        assert_eq!(cleared, 2);
        assert_eq!(
            tx.clear_attribution(SnapshotKind::History, &[])
                .await
                .expect("noop"),
            0
        );
        tx.commit().await.expect("commit");

        let rows = store.history_records().await.expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].source_file, "b.csv");
        assert_eq!(rows[0].division.get(), 2);
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::open(dir.path().join("db.sqlite"))
            .await
            .expect("open");

        {
            let mut tx = store.begin().await.expect("begin");
            tx.upsert_current(&entry("Odin", "3.00", "x.csv"))
                .await
                .expect("insert");
        }

        assert_eq!(store.count(SnapshotKind::Current).await.expect("count"), 0);
    }

    #[tokio::test]
    async fn recent_rows_are_newest_first_and_limited() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::open(dir.path().join("db.sqlite"))
            .await
            .expect("open");

        let mut tx = store.begin().await.expect("begin");
        for horse in ["Alfa", "Beta", "Gamma"] {
            tx.upsert_current(&entry(horse, "2.00", "v85_20260221_1.csv"))
                .await
                .expect("insert");
        }
        tx.commit().await.expect("commit");

        let table = store
            .recent_rows(SnapshotKind::Current, 2)
            .await
            .expect("rows");
        assert_eq!(table.columns.first().map(String::as_str), Some("id"));
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0][0], "3");
        assert_eq!(table.rows[0][2], "1");
        assert_eq!(table.rows[0][4], "Gamma");
        assert_eq!(table.rows[1][4], "Beta");
        assert_eq!(
            store
                .count_attributed(SnapshotKind::Current, "v85_20260221_1.csv")
                .await
                .expect("count"),
            3
        );
    }

    #[test]
    fn retry_classification() {
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn default_backoff_doubles_from_250ms_up_to_5s() {
        let policy = HttpClientConfig::default().backoff;
        assert_eq!(policy.max_retries, 3);
        let delays = (0..6)
            .map(|attempt| policy.delay_for_attempt(attempt).as_millis())
            .collect::<Vec<_>>();
        assert_eq!(delays, vec![250, 500, 1000, 2000, 4000, 5000]);
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn token_bucket_hands_out_its_capacity_without_waiting() {
        let bucket = TokenBucket::new(3, Duration::from_secs(60));
        let started = Instant::now();
        for _ in 0..3 {
            bucket.take().await;
        }
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
