//! Import + fetch orchestration.
//!
//! [`ImportPipeline`] discovers snapshot CSV files, reconciles them into the
//! store inside a single transaction and reports per-kind counters.
//! [`FetchPipeline`] collects a snapshot from a race-data source and writes
//! it as a CSV file the importer recognises.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;
use v85_adapters::{
    collect_current_snapshot, collect_history_snapshot, normalize_row, read_snapshot_csv,
    write_current_csv, write_history_csv, AdapterError, AtgClient, FixtureRaceSource,
    NormalizedRow, RaceDataSource, DEFAULT_API_BASE, DEFAULT_MAX_HISTORY_PER_HORSE,
};
use v85_core::{Division, SnapshotFile, SnapshotKind};
use v85_storage::{
    HttpClientConfig, HttpFetcher, SnapshotStore, SnapshotWriter, StoreError, TableRows,
};

pub const CRATE_NAME: &str = "v85-sync";

pub const DEFAULT_DB_PATH: &str = "./v85.sqlite";
pub const DEFAULT_CSV_DIR: &str = "./csv";

fn env_flag(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "True" | "yes")
}

#[derive(Debug, Clone)]
pub struct ImportConfig {
    pub database_path: PathBuf,
    pub csv_dir: PathBuf,
    pub skip_history: bool,
}

impl ImportConfig {
    pub fn from_env() -> Self {
        Self {
            database_path: std::env::var("V85_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_DB_PATH)),
            csv_dir: std::env::var("V85_CSV_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_CSV_DIR)),
            skip_history: std::env::var("V85_SKIP_HISTORY")
                .map(|v| env_flag(&v))
                .unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub csv_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_history: usize,
    pub api_base: String,
    /// Replay captured API responses from this directory instead of the network.
    pub fixtures_dir: Option<PathBuf>,
}

impl FetchConfig {
    pub fn from_env() -> Self {
        Self {
            csv_dir: std::env::var("V85_CSV_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_CSV_DIR)),
            user_agent: std::env::var("V85_USER_AGENT")
                .unwrap_or_else(|_| "Mozilla/5.0".to_string()),
            http_timeout_secs: std::env::var("V85_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            max_history: std::env::var("V85_MAX_HISTORY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_MAX_HISTORY_PER_HORSE),
            api_base: std::env::var("V85_API_BASE")
                .unwrap_or_else(|_| DEFAULT_API_BASE.to_string()),
            fixtures_dir: std::env::var("V85_FIXTURES_DIR").ok().map(PathBuf::from),
        }
    }
}

// ---------------------------------------------------------------------------
// Import

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("cannot read csv directory {}", path.display())]
    UnreadableDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed csv file {file}")]
    MalformedCsv {
        file: String,
        #[source]
        source: AdapterError,
    },
    #[error("csv file {file} has no header row")]
    MissingHeader { file: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ImportError {
    fn from_csv(file: &str, err: AdapterError) -> Self {
        match err {
            AdapterError::MissingHeader { .. } => Self::MissingHeader {
                file: file.to_string(),
            },
            source => Self::MalformedCsv {
                file: file.to_string(),
                source,
            },
        }
    }
}

/// A file whose name resolved to a snapshot kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    pub name: String,
    pub path: PathBuf,
    pub kind: SnapshotKind,
    pub resolved: SnapshotFile,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Discovery {
    /// Recognised files in lexicographic name order.
    pub files: Vec<DiscoveredFile>,
    pub unrecognized: usize,
}

/// Lists regular files in `dir` and classifies them by name. Subdirectories
/// are not searched.
pub fn discover_snapshot_files(dir: &Path) -> Result<Discovery, ImportError> {
    let unreadable = |source| ImportError::UnreadableDirectory {
        path: dir.to_path_buf(),
        source,
    };

    let mut candidates = Vec::new();
    let mut discovery = Discovery::default();
    for entry in fs::read_dir(dir).map_err(unreadable)? {
        let entry = entry.map_err(unreadable)?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        match entry.file_name().into_string() {
            Ok(name) => candidates.push((name, path)),
            Err(raw) => {
                debug!(name = ?raw, "skipping non utf-8 file name");
                discovery.unrecognized += 1;
            }
        }
    }
    candidates.sort_by(|a, b| a.0.cmp(&b.0));

    for (name, path) in candidates {
        let resolved = SnapshotFile::resolve(&name);
        match resolved.kind() {
            Some(kind) => discovery.files.push(DiscoveredFile {
                name,
                path,
                kind,
                resolved,
            }),
            None => {
                debug!(file = %name, "skipping unrecognized file");
                discovery.unrecognized += 1;
            }
        }
    }
    Ok(discovery)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KindCounts {
    pub files: usize,
    pub rows: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileOutcome {
    pub kind: SnapshotKind,
    pub rows: usize,
    pub cleared: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileTotals {
    pub current: KindCounts,
    pub history: KindCounts,
    pub cleared_rows: u64,
}

impl ReconcileTotals {
    fn record(&mut self, outcome: FileOutcome) {
        let counts = match outcome.kind {
            SnapshotKind::Current => &mut self.current,
            SnapshotKind::History => &mut self.history,
        };
        counts.files += 1;
        counts.rows += outcome.rows;
        self.cleared_rows += outcome.cleared;
    }
}

/// Clears every row attributed to the file or its legacy alias, then writes
/// the file's rows: Current rows upsert on their natural key, History rows
/// append.
pub async fn reconcile_file<W>(writer: &mut W, file: &DiscoveredFile) -> Result<FileOutcome, ImportError>
where
    W: SnapshotWriter + ?Sized,
{
    let rows = read_snapshot_csv(&file.path).map_err(|err| ImportError::from_csv(&file.name, err))?;

    let alias = file.resolved.legacy_alias().unwrap_or(file.name.as_str());
    let cleared = writer
        .clear_attribution(file.kind, &[file.name.as_str(), alias])
        .await?;

    let mut written = 0;
    for row in &rows {
        match normalize_row(row, &file.resolved, &file.name) {
            Some(NormalizedRow::Current(entry)) => writer.upsert_current(&entry).await?,
            Some(NormalizedRow::History(record)) => writer.insert_history(&record).await?,
            None => continue,
        }
        written += 1;
    }

    debug!(rows = written, cleared, "file reconciled");
    Ok(FileOutcome {
        kind: file.kind,
        rows: written,
        cleared,
    })
}

/// Reconciles `files` in order through one writer; the first failure stops the batch.
pub async fn reconcile_files<W>(writer: &mut W, files: &[DiscoveredFile]) -> Result<ReconcileTotals, ImportError>
where
    W: SnapshotWriter + ?Sized,
{
    let mut totals = ReconcileTotals::default();
    for file in files {
        let span = info_span!("import_file", file = %file.name, kind = %file.kind);
        let outcome = reconcile_file(writer, file).instrument(span).await?;
        totals.record(outcome);
    }
    Ok(totals)
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub database_path: String,
    pub csv_dir: String,
    pub current: KindCounts,
    pub history: KindCounts,
    pub unrecognized_files: usize,
    pub skipped_history_files: usize,
    pub cleared_rows: u64,
}

impl ImportRunSummary {
    pub fn render_text(&self) -> String {
        format!(
            "Store: {}\nCSV directory: {}\nImported current files: {}, rows: {}\nImported history files: {}, rows: {}",
            self.database_path,
            self.csv_dir,
            self.current.files,
            self.current.rows,
            self.history.files,
            self.history.rows,
        )
    }
}

pub struct ImportPipeline {
    store: SnapshotStore,
    config: ImportConfig,
}

impl ImportPipeline {
    pub fn new(store: SnapshotStore, config: ImportConfig) -> Self {
        Self { store, config }
    }

    /// Opens the store named by `config`, creating it if missing. The CSV
    /// directory is checked first so an unreadable one leaves no store behind.
    pub async fn open(config: ImportConfig) -> Result<Self, ImportError> {
        discover_snapshot_files(&config.csv_dir)?;
        let store = SnapshotStore::open(&config.database_path).await?;
        Ok(Self::new(store, config))
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Runs one import. Either every discovered file is applied or, on the
    /// first failure, nothing is.
    pub async fn run_once(&self) -> Result<ImportRunSummary, ImportError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("import_run", %run_id);
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<ImportRunSummary, ImportError> {
        let started_at = Utc::now();
        let discovery = discover_snapshot_files(&self.config.csv_dir)?;

        let (files, skipped): (Vec<_>, Vec<_>) = discovery
            .files
            .into_iter()
            .partition(|f| !(self.config.skip_history && f.kind == SnapshotKind::History));
        for file in &skipped {
            info!(file = %file.name, "skipping history file");
        }

        let mut tx = self.store.begin().await?;
        let totals = match reconcile_files(&mut tx, &files).await {
            Ok(totals) => totals,
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "rollback failed");
                }
                return Err(err);
            }
        };
        tx.commit().await?;

        let finished_at = Utc::now();
        info!(
            current_files = totals.current.files,
            current_rows = totals.current.rows,
            history_files = totals.history.files,
            history_rows = totals.history.rows,
            cleared_rows = totals.cleared_rows,
            unrecognized = discovery.unrecognized,
            "import committed"
        );

        Ok(ImportRunSummary {
            run_id,
            started_at,
            finished_at,
            database_path: self.store.path().display().to_string(),
            csv_dir: self.config.csv_dir.display().to_string(),
            current: totals.current,
            history: totals.history,
            unrecognized_files: discovery.unrecognized,
            skipped_history_files: skipped.len(),
            cleared_rows: totals.cleared_rows,
        })
    }
}

pub async fn run_import_once_from_env() -> Result<ImportRunSummary> {
    let config = ImportConfig::from_env();
    let pipeline = ImportPipeline::open(config)
        .await
        .context("opening snapshot store")?;
    Ok(pipeline.run_once().await?)
}

// ---------------------------------------------------------------------------
// Fetch

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub division: Division,
    pub kind: SnapshotKind,
    /// Output path; defaults to the conventional name inside the CSV directory.
    pub out: Option<PathBuf>,
    pub today: NaiveDate,
}

impl FetchRequest {
    pub fn new(division: Division, kind: SnapshotKind) -> Self {
        Self {
            division,
            kind,
            out: None,
            today: Local::now().date_naive(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchSummary {
    pub kind: SnapshotKind,
    pub game_id: String,
    pub division: Division,
    pub race_number: Option<u32>,
    pub date: NaiveDate,
    pub rows: usize,
    pub output: String,
    pub track: Option<String>,
    pub start_time: Option<String>,
    pub max_history: Option<usize>,
}

impl FetchSummary {
    pub fn render_text(&self) -> String {
        let race = self
            .race_number
            .map(|n| n.to_string())
            .unwrap_or_default();
        let mut lines = vec![
            format!("Wrote {} rows to: {}", self.rows, self.output),
            format!("Game: {}", self.game_id),
        ];
        match self.kind {
            SnapshotKind::Current => {
                lines.push(format!(
                    "Start time (division): {}",
                    self.start_time.as_deref().unwrap_or("")
                ));
                lines.push(format!(
                    "Track/race: {} / race {race}",
                    self.track.as_deref().unwrap_or("")
                ));
            }
            SnapshotKind::History => {
                lines.push(format!("Division: {} (race {race})", self.division));
                lines.push(format!(
                    "Max history per horse: {}",
                    self.max_history.unwrap_or(DEFAULT_MAX_HISTORY_PER_HORSE)
                ));
            }
        }
        lines.join("\n")
    }
}

pub struct FetchPipeline {
    config: FetchConfig,
    source: Box<dyn RaceDataSource>,
}

impl FetchPipeline {
    /// Uses the fixture replay source when `fixtures_dir` is set, else the live API.
    pub fn new(config: FetchConfig) -> Result<Self> {
        let source: Box<dyn RaceDataSource> = match &config.fixtures_dir {
            Some(dir) => Box::new(FixtureRaceSource::new(dir.clone())),
            None => {
                let http = HttpFetcher::new(HttpClientConfig {
                    timeout: Duration::from_secs(config.http_timeout_secs),
                    user_agent: Some(config.user_agent.clone()),
                    ..Default::default()
                })?;
                Box::new(AtgClient::new(http, config.api_base.clone()))
            }
        };
        Ok(Self { config, source })
    }

    pub fn with_source(config: FetchConfig, source: Box<dyn RaceDataSource>) -> Self {
        Self { config, source }
    }

    pub async fn run_once(&self, request: &FetchRequest) -> Result<FetchSummary> {
        if self.config.max_history == 0 {
            bail!("max history per horse must be at least 1");
        }

        let span = info_span!(
            "fetch_snapshot",
            source = self.source.source_id(),
            kind = %request.kind,
            division = %request.division
        );
        async {
            match request.kind {
                SnapshotKind::Current => self.fetch_current(request).await,
                SnapshotKind::History => self.fetch_history(request).await,
            }
        }
        .instrument(span)
        .await
    }

    async fn fetch_current(&self, request: &FetchRequest) -> Result<FetchSummary> {
        let snapshot = collect_current_snapshot(self.source.as_ref(), request.division, request.today)
            .await
            .context("collecting starting list")?;
        let out = self.output_path(request, snapshot.file_name());
        write_current_csv(&out, &snapshot.rows)
            .with_context(|| format!("writing {}", out.display()))?;
        info!(rows = snapshot.rows.len(), output = %out.display(), "starting list written");

        Ok(FetchSummary {
            kind: SnapshotKind::Current,
            game_id: snapshot.game_id,
            division: snapshot.division,
            race_number: snapshot.race_number,
            date: snapshot.date,
            rows: snapshot.rows.len(),
            output: out.display().to_string(),
            track: Some(snapshot.track),
            start_time: snapshot.start_time,
            max_history: None,
        })
    }

    async fn fetch_history(&self, request: &FetchRequest) -> Result<FetchSummary> {
        let snapshot = collect_history_snapshot(
            self.source.as_ref(),
            request.division,
            request.today,
            self.config.max_history,
        )
        .await
        .context("collecting horse history")?;
        let out = self.output_path(request, snapshot.file_name());
        write_history_csv(&out, &snapshot.rows)
            .with_context(|| format!("writing {}", out.display()))?;
        info!(rows = snapshot.rows.len(), output = %out.display(), "history written");

        Ok(FetchSummary {
            kind: SnapshotKind::History,
            game_id: snapshot.game_id,
            division: snapshot.division,
            race_number: snapshot.race_number,
            date: snapshot.date,
            rows: snapshot.rows.len(),
            output: out.display().to_string(),
            track: None,
            start_time: None,
            max_history: Some(snapshot.max_per_horse),
        })
    }

    fn output_path(&self, request: &FetchRequest, file_name: String) -> PathBuf {
        request
            .out
            .clone()
            .unwrap_or_else(|| self.config.csv_dir.join(file_name))
    }
}

// ---------------------------------------------------------------------------
// Display

/// Aligned text table; `(no rows)` when there is nothing to show.
pub fn render_table(table: &TableRows) -> String {
    if table.rows.is_empty() {
        return "(no rows)".to_string();
    }

    let mut widths = table
        .columns
        .iter()
        .map(|c| c.chars().count())
        .collect::<Vec<_>>();
    for row in &table.rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let line = |cells: &[String]| {
        cells
            .iter()
            .zip(&widths)
            .map(|(cell, &width)| format!("{cell:<width$}"))
            .collect::<Vec<_>>()
            .join(" | ")
    };

    let mut out = vec![line(table.columns.as_slice())];
    out.push(
        widths
            .iter()
            .map(|w| "-".repeat(*w))
            .collect::<Vec<_>>()
            .join("-+-"),
    );
    out.extend(table.rows.iter().map(|row| line(row.as_slice())));
    out.join("\n")
}

/// Header lines plus the most recent `limit` rows of `kind`.
pub async fn show_table(store: &SnapshotStore, kind: SnapshotKind, limit: u32) -> Result<String> {
    let total = store
        .count(kind)
        .await
        .with_context(|| format!("counting {kind} rows"))?;
    let rows = store
        .recent_rows(kind, limit)
        .await
        .with_context(|| format!("reading {kind} rows"))?;
    Ok(format!(
        "Store: {}\nTable: {}\nTotal rows: {total}\n{}",
        store.path().display(),
        v85_storage::table_for(kind),
        render_table(&rows)
    ))
}
