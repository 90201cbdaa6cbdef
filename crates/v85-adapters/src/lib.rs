//! Snapshot CSV normalization + race-data source adapters.
//!
//! The import side reads dated per-division CSV files into canonical
//! [`CurrentEntry`]/[`HistoryRecord`] values. The collection side pulls the
//! upcoming V85 game from a [`RaceDataSource`] and shapes it into the rows
//! those CSV files carry.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;
use v85_core::{
    current_file_name, history_file_name, CurrentEntry, Division, HistoryRecord, SnapshotFile,
};
use v85_storage::{FetchError, HttpFetcher};

pub const CRATE_NAME: &str = "v85-adapters";

pub const GAME_TYPE: &str = "V85";
pub const DEFAULT_API_BASE: &str = "https://www.atg.se/services/racinginfo/v1/api";
pub const DEFAULT_MAX_HISTORY_PER_HORSE: usize = 5;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Column labels used in the snapshot CSV files.
pub mod columns {
    pub const START_NUMBER: &str = "startnummer";
    pub const HORSE_NAME: &str = "hästnamn";
    pub const DRIVER: &str = "kusk";
    pub const TRAINER: &str = "tränare";
    pub const BET_PERCENTAGE: &str = "v85%";
    pub const WIN_ODDS: &str = "v-odds";
    pub const SULKY: &str = "vagn";
    pub const DATE: &str = "datum";
    pub const TRACK: &str = "bana";
    pub const PLACE: &str = "placering";
    pub const DISTANCE_POST: &str = "distans:spår";
    pub const KM_TIME: &str = "KM-tid";
    pub const SHOES: &str = "skor";
    pub const ODDS: &str = "odds";
    pub const PRIZE: &str = "pris";

    pub const CURRENT_HEADER: [&str; 7] = [
        START_NUMBER,
        HORSE_NAME,
        DRIVER,
        TRAINER,
        BET_PERCENTAGE,
        WIN_ODDS,
        SULKY,
    ];

    pub const HISTORY_HEADER: [&str; 11] = [
        HORSE_NAME,
        DATE,
        TRACK,
        DRIVER,
        PLACE,
        DISTANCE_POST,
        KM_TIME,
        SHOES,
        ODDS,
        PRIZE,
        SULKY,
    ];
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("reading csv {}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("csv {} has no header row", path.display())]
    MissingHeader { path: PathBuf },
    #[error("writing csv {}", path.display())]
    WriteCsv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("accessing {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("no upcoming {game_type} game in the product listing")]
    NoUpcomingGame { game_type: String },
    #[error("division {division} requested but the game only has {available} races")]
    DivisionOutOfRange { division: Division, available: usize },
}

// ---------------------------------------------------------------------------
// Row normalization

/// A CSV row keyed by column label. Lookups ignore case and a leading BOM,
/// and an absent column reads as the empty string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRow {
    cells: HashMap<String, String>,
}

impl RawRow {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut row = Self::default();
        for (label, value) in pairs {
            row.insert(label.as_ref(), value);
        }
        row
    }

    pub fn insert(&mut self, label: &str, value: impl Into<String>) {
        let key = normalize_label(label);
        if !key.is_empty() {
            self.cells.insert(key, value.into());
        }
    }

    pub fn get(&self, label: &str) -> &str {
        self.cells
            .get(&normalize_label(label))
            .map(String::as_str)
            .unwrap_or("")
    }

    fn text(&self, label: &str) -> String {
        self.get(label).trim().to_string()
    }
}

fn normalize_label(label: &str) -> String {
    label.trim_start_matches('\u{feff}').trim().to_lowercase()
}

/// Canonical Current row. Values are kept as received apart from trimming.
pub fn normalize_current(
    row: &RawRow,
    date: &str,
    division: Division,
    source_file: &str,
) -> CurrentEntry {
    CurrentEntry {
        date: date.to_string(),
        division,
        start_number: row.text(columns::START_NUMBER),
        horse_name: row.text(columns::HORSE_NAME),
        driver: row.text(columns::DRIVER),
        trainer: row.text(columns::TRAINER),
        bet_percentage: row.text(columns::BET_PERCENTAGE),
        win_odds: row.text(columns::WIN_ODDS),
        sulky_type: row.text(columns::SULKY),
        source_file: source_file.to_string(),
    }
}

pub fn normalize_history(row: &RawRow, division: Division, source_file: &str) -> HistoryRecord {
    HistoryRecord {
        division,
        horse_name: row.text(columns::HORSE_NAME),
        date: row.text(columns::DATE),
        track: row.text(columns::TRACK),
        driver: row.text(columns::DRIVER),
        finishing_place: row.text(columns::PLACE),
        distance_post_position: row.text(columns::DISTANCE_POST),
        kilometer_time: row.text(columns::KM_TIME),
        shoe_configuration: row.text(columns::SHOES),
        odds: row.text(columns::ODDS),
        prize: row.text(columns::PRIZE),
        sulky_type: row.text(columns::SULKY),
        source_file: source_file.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizedRow {
    Current(CurrentEntry),
    History(HistoryRecord),
}

/// Normalizes `row` according to the kind `file` was resolved to.
pub fn normalize_row(row: &RawRow, file: &SnapshotFile, source_file: &str) -> Option<NormalizedRow> {
    match file {
        SnapshotFile::Current { date, division, .. } => Some(NormalizedRow::Current(
            normalize_current(row, date, *division, source_file),
        )),
        SnapshotFile::History { division, .. } => Some(NormalizedRow::History(
            normalize_history(row, *division, source_file),
        )),
        SnapshotFile::Unrecognized => None,
    }
}

pub fn read_snapshot_csv(path: impl AsRef<Path>) -> Result<Vec<RawRow>, AdapterError> {
    let path = path.as_ref();
    let file = fs::File::open(path).map_err(|source| AdapterError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_snapshot_csv(file, path)
}

/// Parses a headed CSV. A missing or blank header row is an error; short or
/// long data rows are tolerated.
pub fn parse_snapshot_csv<R: Read>(input: R, path: &Path) -> Result<Vec<RawRow>, AdapterError> {
    let csv_err = |source| AdapterError::Csv {
        path: path.to_path_buf(),
        source,
    };

    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(input);
    let labels = reader
        .headers()
        .map_err(csv_err)?
        .iter()
        .map(normalize_label)
        .collect::<Vec<_>>();
    if labels.iter().all(String::is_empty) {
        return Err(AdapterError::MissingHeader {
            path: path.to_path_buf(),
        });
    }

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(csv_err)?;
        rows.push(RawRow::from_pairs(labels.iter().zip(record.iter())));
    }
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Snapshot rows as written to CSV

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartingListRow {
    #[serde(rename = "startnummer")]
    pub start_number: String,
    #[serde(rename = "hästnamn")]
    pub horse_name: String,
    #[serde(rename = "kusk")]
    pub driver: String,
    #[serde(rename = "tränare")]
    pub trainer: String,
    #[serde(rename = "v85%")]
    pub bet_percentage: String,
    #[serde(rename = "v-odds")]
    pub win_odds: String,
    #[serde(rename = "vagn")]
    pub sulky_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HorseResultRow {
    #[serde(rename = "hästnamn")]
    pub horse_name: String,
    #[serde(rename = "datum")]
    pub date: String,
    #[serde(rename = "bana")]
    pub track: String,
    #[serde(rename = "kusk")]
    pub driver: String,
    #[serde(rename = "placering")]
    pub place: String,
    #[serde(rename = "distans:spår")]
    pub distance_post: String,
    #[serde(rename = "KM-tid")]
    pub km_time: String,
    #[serde(rename = "skor")]
    pub shoes: String,
    #[serde(rename = "odds")]
    pub odds: String,
    #[serde(rename = "pris")]
    pub prize: String,
    #[serde(rename = "vagn")]
    pub sulky_type: String,
}

/// Writes `rows` under `header`, BOM-prefixed. The header is written even
/// when there are no rows so the importer still accepts the file.
pub fn write_snapshot_csv<T: Serialize>(
    path: &Path,
    header: &[&str],
    rows: &[T],
) -> Result<(), AdapterError> {
    let io_err = |source| AdapterError::Io {
        path: path.to_path_buf(),
        source,
    };
    let write_err = |source| AdapterError::WriteCsv {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let mut file = fs::File::create(path).map_err(io_err)?;
    file.write_all(UTF8_BOM).map_err(io_err)?;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    writer.write_record(header).map_err(write_err)?;
    for row in rows {
        writer.serialize(row).map_err(write_err)?;
    }
    writer.flush().map_err(io_err)?;
    Ok(())
}

pub fn write_current_csv(path: &Path, rows: &[StartingListRow]) -> Result<(), AdapterError> {
    write_snapshot_csv(path, &columns::CURRENT_HEADER, rows)
}

pub fn write_history_csv(path: &Path, rows: &[HorseResultRow]) -> Result<(), AdapterError> {
    write_snapshot_csv(path, &columns::HISTORY_HEADER, rows)
}

// ---------------------------------------------------------------------------
// Retention

/// Groups rows by horse, keeps each horse's `max_per_horse` most recent rows
/// (newest first, ties in input order) and returns horses in name order.
pub fn retain_recent_per_horse(
    rows: Vec<HorseResultRow>,
    max_per_horse: usize,
) -> Vec<HorseResultRow> {
    let mut by_horse: BTreeMap<String, Vec<HorseResultRow>> = BTreeMap::new();
    for row in rows {
        by_horse.entry(row.horse_name.clone()).or_default().push(row);
    }

    by_horse
        .into_values()
        .flat_map(|mut horse_rows| {
            horse_rows.sort_by(|a, b| b.date.cmp(&a.date));
            horse_rows.truncate(max_per_horse);
            horse_rows
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Race data payloads

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProductListing {
    #[serde(default)]
    pub upcoming: Vec<GameSummary>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSummary {
    pub id: String,
    pub start_time: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Game {
    pub id: Option<String>,
    pub start_time: Option<String>,
    #[serde(default)]
    pub races: Vec<Race>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Race {
    pub number: Option<u32>,
    pub start_time: Option<String>,
    pub track: Option<Track>,
    #[serde(default)]
    pub starts: Vec<Start>,
}

impl Race {
    pub fn track_name(&self) -> String {
        self.track
            .as_ref()
            .and_then(|t| t.name.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Track {
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Start {
    pub number: Option<JsonValue>,
    pub horse: Option<Horse>,
    pub driver: Option<Person>,
    pub pools: Option<Pools>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Horse {
    pub id: Option<JsonValue>,
    pub name: Option<String>,
    pub trainer: Option<Person>,
    pub sulky: Option<Sulky>,
    pub shoes: Option<Shoes>,
}

impl Horse {
    pub fn sulky_text(&self) -> Option<String> {
        self.sulky.as_ref()?.kind.as_ref()?.text.clone()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Person {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

impl Person {
    pub fn full_name(&self) -> String {
        format!(
            "{} {}",
            self.first_name.as_deref().unwrap_or(""),
            self.last_name.as_deref().unwrap_or("")
        )
        .trim()
        .to_string()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Sulky {
    #[serde(rename = "type")]
    pub kind: Option<SulkyType>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SulkyType {
    pub text: Option<String>,
}

/// Front/back shoe flags, either plain booleans or `{"hasShoe": bool}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Shoes {
    pub front: Option<JsonValue>,
    pub back: Option<JsonValue>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Pools {
    #[serde(rename = "V85")]
    pub v85: Option<BetPool>,
    pub vinnare: Option<WinPool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BetPool {
    pub bet_distribution: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WinPool {
    pub odds: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HorseResults {
    #[serde(default)]
    pub records: Vec<ResultRecord>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
    pub date: Option<String>,
    pub place: Option<JsonValue>,
    pub odds: Option<f64>,
    pub km_time: Option<KmTime>,
    pub start: Option<ResultStart>,
    pub race: Option<ResultRace>,
    pub track: Option<Track>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KmTime {
    pub minutes: Option<u32>,
    pub seconds: Option<u32>,
    pub tenths: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultStart {
    pub distance: Option<u32>,
    pub post_position: Option<u32>,
    pub driver: Option<Person>,
    pub horse: Option<Horse>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRace {
    pub first_prize: Option<f64>,
}

// ---------------------------------------------------------------------------
// Field formatting

/// Renders a JSON scalar as text whether it arrived as a number or a string.
pub fn json_text(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}

/// Values the API reports in hundredths (odds, bet distribution).
pub fn format_hundredths(value: Option<f64>) -> String {
    value
        .map(|v| format!("{:.2}", v / 100.0))
        .unwrap_or_default()
}

/// First prize arrives in öre; rendered in whole kronor, ties to even.
pub fn format_prize(first_prize: Option<f64>) -> String {
    first_prize
        .map(|v| format!("{}", (v / 100.0).round_ties_even() as i64))
        .unwrap_or_default()
}

pub fn format_km_time(km_time: Option<&KmTime>) -> String {
    let Some(km) = km_time else {
        return String::new();
    };
    if km.minutes.is_none() && km.seconds.is_none() && km.tenths.is_none() {
        return String::new();
    }
    format!(
        "{}:{:02},{}",
        km.minutes.unwrap_or(0),
        km.seconds.unwrap_or(0),
        km.tenths.unwrap_or(0)
    )
}

pub fn format_distance_post(distance: Option<u32>, post_position: Option<u32>) -> String {
    match (distance, post_position) {
        (None, None) => String::new(),
        (None, Some(post)) => post.to_string(),
        (Some(distance), None) => distance.to_string(),
        (Some(distance), Some(post)) => format!("{distance}:{post}"),
    }
}

fn shoe_on(value: &JsonValue) -> Option<bool> {
    match value {
        JsonValue::Bool(on) => Some(*on),
        JsonValue::Object(map) => map.get("hasShoe").and_then(JsonValue::as_bool),
        _ => None,
    }
}

pub fn format_shoes(shoes: Option<&Shoes>) -> String {
    let Some(shoes) = shoes else {
        return String::new();
    };
    let front = shoes.front.as_ref().and_then(shoe_on);
    let back = shoes.back.as_ref().and_then(shoe_on);
    let text = match (front, back) {
        (Some(true), Some(true)) => "Skor runt om",
        (Some(false), Some(false)) => "Barfota runt om",
        (Some(false), Some(true)) => "Barfota fram",
        (Some(true), Some(false)) => "Barfota bak",
        _ => "",
    };
    text.to_string()
}

// ---------------------------------------------------------------------------
// Sources

#[async_trait]
pub trait RaceDataSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn product(&self, game_type: &str) -> Result<ProductListing, AdapterError>;

    async fn game(&self, game_id: &str) -> Result<Game, AdapterError>;

    async fn horse_results(&self, horse_id: &str) -> Result<HorseResults, AdapterError>;
}

/// Live racing-info API.
#[derive(Debug)]
pub struct AtgClient {
    http: HttpFetcher,
    base_url: String,
}

impl AtgClient {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { http, base_url }
    }
}

#[async_trait]
impl RaceDataSource for AtgClient {
    fn source_id(&self) -> &'static str {
        "atg"
    }

    async fn product(&self, game_type: &str) -> Result<ProductListing, AdapterError> {
        let url = format!("{}/products/{game_type}", self.base_url);
        Ok(self.http.fetch_json(&url).await?)
    }

    async fn game(&self, game_id: &str) -> Result<Game, AdapterError> {
        let url = format!("{}/games/{game_id}", self.base_url);
        Ok(self.http.fetch_json(&url).await?)
    }

    async fn horse_results(&self, horse_id: &str) -> Result<HorseResults, AdapterError> {
        let url = format!("{}/horses/{horse_id}/results", self.base_url);
        Ok(self.http.fetch_json(&url).await?)
    }
}

/// Replays captured API responses laid out like the API paths:
/// `products/<type>.json`, `games/<id>.json`, `horses/<id>/results.json`.
#[derive(Debug, Clone)]
pub struct FixtureRaceSource {
    root: PathBuf,
}

impl FixtureRaceSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn read_json<T: DeserializeOwned>(&self, relative: impl AsRef<Path>) -> Result<T, AdapterError> {
        let path = self.root.join(relative);
        let data = fs::read_to_string(&path).map_err(|source| AdapterError::Io {
            path: path.clone(),
            source,
        })?;
        serde_json::from_str(&data).map_err(|source| AdapterError::Json { path, source })
    }
}

#[async_trait]
impl RaceDataSource for FixtureRaceSource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn product(&self, game_type: &str) -> Result<ProductListing, AdapterError> {
        self.read_json(Path::new("products").join(format!("{game_type}.json")))
    }

    async fn game(&self, game_id: &str) -> Result<Game, AdapterError> {
        self.read_json(Path::new("games").join(format!("{game_id}.json")))
    }

    async fn horse_results(&self, horse_id: &str) -> Result<HorseResults, AdapterError> {
        self.read_json(Path::new("horses").join(horse_id).join("results.json"))
    }
}

// ---------------------------------------------------------------------------
// Collection

pub fn parse_start_time(value: &str) -> Option<NaiveDateTime> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.naive_local())
        .ok()
        .or_else(|| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S").ok())
        .or_else(|| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f").ok())
}

/// Earliest listed game starting on or after `today`.
pub fn choose_upcoming_game(upcoming: &[GameSummary], today: NaiveDate) -> Option<&GameSummary> {
    upcoming
        .iter()
        .filter_map(|game| {
            game.start_time
                .as_deref()
                .and_then(parse_start_time)
                .map(|start| (start, game))
        })
        .filter(|(start, _)| start.date() >= today)
        .min_by_key(|(start, _)| *start)
        .map(|(_, game)| game)
}

/// Date used in the snapshot file name: race start, else game start, else today.
pub fn snapshot_date(game: &GameSummary, race: &Race, today: NaiveDate) -> NaiveDate {
    race.start_time
        .as_deref()
        .and_then(parse_start_time)
        .or_else(|| game.start_time.as_deref().and_then(parse_start_time))
        .map(|start| start.date())
        .unwrap_or(today)
}

fn race_for_division(game: &Game, division: Division) -> Result<&Race, AdapterError> {
    game.races
        .get(division.index())
        .ok_or(AdapterError::DivisionOutOfRange {
            division,
            available: game.races.len(),
        })
}

pub fn extract_starting_list(race: &Race) -> Vec<StartingListRow> {
    race.starts
        .iter()
        .map(|start| {
            let horse = start.horse.as_ref();
            let pools = start.pools.as_ref();
            StartingListRow {
                start_number: start.number.as_ref().map(json_text).unwrap_or_default(),
                horse_name: horse.and_then(|h| h.name.clone()).unwrap_or_default(),
                driver: start
                    .driver
                    .as_ref()
                    .map(Person::full_name)
                    .unwrap_or_default(),
                trainer: horse
                    .and_then(|h| h.trainer.as_ref())
                    .map(Person::full_name)
                    .unwrap_or_default(),
                bet_percentage: format_hundredths(
                    pools
                        .and_then(|p| p.v85.as_ref())
                        .and_then(|p| p.bet_distribution),
                ),
                win_odds: format_hundredths(
                    pools.and_then(|p| p.vinnare.as_ref()).and_then(|p| p.odds),
                ),
                sulky_type: horse.and_then(Horse::sulky_text).unwrap_or_default(),
            }
        })
        .collect()
}

pub fn history_rows_for_horse(horse_name: &str, results: &HorseResults) -> Vec<HorseResultRow> {
    results
        .records
        .iter()
        .map(|record| {
            let start = record.start.as_ref();
            let horse = start.and_then(|s| s.horse.as_ref());
            HorseResultRow {
                horse_name: horse_name.to_string(),
                date: record.date.clone().unwrap_or_default(),
                track: record
                    .track
                    .as_ref()
                    .and_then(|t| t.name.clone())
                    .unwrap_or_default(),
                driver: start
                    .and_then(|s| s.driver.as_ref())
                    .map(Person::full_name)
                    .unwrap_or_default(),
                place: record.place.as_ref().map(json_text).unwrap_or_default(),
                distance_post: start
                    .map(|s| format_distance_post(s.distance, s.post_position))
                    .unwrap_or_default(),
                km_time: format_km_time(record.km_time.as_ref()),
                shoes: format_shoes(horse.and_then(|h| h.shoes.as_ref())),
                odds: format_hundredths(record.odds),
                prize: format_prize(record.race.as_ref().and_then(|r| r.first_prize)),
                sulky_type: horse.and_then(Horse::sulky_text).unwrap_or_default(),
            }
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct CurrentSnapshot {
    pub game_id: String,
    pub date: NaiveDate,
    pub division: Division,
    pub race_number: Option<u32>,
    pub track: String,
    pub start_time: Option<String>,
    pub rows: Vec<StartingListRow>,
}

impl CurrentSnapshot {
    pub fn file_name(&self) -> String {
        current_file_name(self.date, self.division)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HistorySnapshot {
    pub game_id: String,
    pub date: NaiveDate,
    pub division: Division,
    pub race_number: Option<u32>,
    pub max_per_horse: usize,
    pub rows: Vec<HorseResultRow>,
}

impl HistorySnapshot {
    pub fn file_name(&self) -> String {
        history_file_name(self.date, self.division)
    }
}

/// Starting list of `division` in the first upcoming game.
pub async fn collect_current_snapshot<S>(
    source: &S,
    division: Division,
    today: NaiveDate,
) -> Result<CurrentSnapshot, AdapterError>
where
    S: RaceDataSource + ?Sized,
{
    let listing = source.product(GAME_TYPE).await?;
    let summary = choose_upcoming_game(&listing.upcoming, today).ok_or_else(|| {
        AdapterError::NoUpcomingGame {
            game_type: GAME_TYPE.to_string(),
        }
    })?;
    let game = source.game(&summary.id).await?;
    let race = race_for_division(&game, division)?;
    debug!(source = source.source_id(), game_id = %summary.id, %division, starts = race.starts.len(), "collected starting list");

    Ok(CurrentSnapshot {
        game_id: summary.id.clone(),
        date: snapshot_date(summary, race, today),
        division,
        race_number: race.number,
        track: race.track_name(),
        start_time: race.start_time.clone(),
        rows: extract_starting_list(race),
    })
}

/// Recent results for every horse in `division`, capped per horse.
///
/// Falls back to the first listed game when none starts on or after `today`.
pub async fn collect_history_snapshot<S>(
    source: &S,
    division: Division,
    today: NaiveDate,
    max_per_horse: usize,
) -> Result<HistorySnapshot, AdapterError>
where
    S: RaceDataSource + ?Sized,
{
    let listing = source.product(GAME_TYPE).await?;
    let summary = choose_upcoming_game(&listing.upcoming, today)
        .or_else(|| listing.upcoming.first())
        .ok_or_else(|| AdapterError::NoUpcomingGame {
            game_type: GAME_TYPE.to_string(),
        })?;
    let game = source.game(&summary.id).await?;
    let race = race_for_division(&game, division)?;

    let mut rows = Vec::new();
    for start in &race.starts {
        let Some(horse) = start.horse.as_ref() else {
            continue;
        };
        let Some(horse_id) = horse
            .id
            .as_ref()
            .map(json_text)
            .filter(|id| !id.is_empty() && id != "0")
        else {
            continue;
        };
        let horse_name = horse
            .name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("horse_{horse_id}"));

        let results = source.horse_results(&horse_id).await?;
        debug!(%horse_id, horse = %horse_name, records = results.records.len(), "fetched horse results");
        rows.extend(history_rows_for_horse(&horse_name, &results));
    }

    Ok(HistorySnapshot {
        game_id: summary.id.clone(),
        date: snapshot_date(summary, race, today),
        division,
        race_number: race.number,
        max_per_horse,
        rows: retain_recent_per_horse(rows, max_per_horse),
    })
}
