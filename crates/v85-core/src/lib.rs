//! Core domain model and snapshot file naming for V85 bet-pool ingestion.

use std::fmt;
use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "v85-core";

/// Namespace token of the current file naming convention.
pub const ACTIVE_NAMESPACE: &str = "v85";
/// Deprecated namespace token; files named with it describe the same snapshots.
pub const LEGACY_NAMESPACE: &str = "v86";

const HISTORY_SEGMENT: &str = "history";
const CSV_SUFFIX: &str = ".csv";

static CURRENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^v85_([0-9]{8})_([1-8])\.csv$").expect("valid current pattern"));
static HISTORY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^v85_history_([0-9]{8})_([1-8])\.csv$").expect("valid history pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("division must be between 1 and 8, got {0}")]
pub struct DivisionError(pub i64);

/// One race ("avdelning") of a V85 game, numbered 1 through 8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Division(u8);

impl Division {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 8;

    pub fn new(value: u8) -> Result<Self, DivisionError> {
        if (Self::MIN..=Self::MAX).contains(&value) {
            Ok(Self(value))
        } else {
            Err(DivisionError(i64::from(value)))
        }
    }

    /// Accepts exactly the digit characters `1`..=`8`.
    pub fn from_digit(c: char) -> Option<Self> {
        let value = c.to_digit(10)?;
        Self::new(u8::try_from(value).ok()?).ok()
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// Zero-based position of this division in a game's race list.
    pub fn index(self) -> usize {
        usize::from(self.0 - 1)
    }
}

impl TryFrom<u8> for Division {
    type Error = DivisionError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<i64> for Division {
    type Error = DivisionError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        u8::try_from(value)
            .map_err(|_| DivisionError(value))
            .and_then(Self::new)
    }
}

impl From<Division> for u8 {
    fn from(value: Division) -> Self {
        value.0
    }
}

impl fmt::Display for Division {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    Current,
    History,
}

impl SnapshotKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Current => "current",
            Self::History => "history",
        }
    }
}

impl fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a candidate file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotFile {
    Current {
        /// ISO `YYYY-MM-DD`, extracted syntactically and never calendar-checked.
        date: String,
        division: Division,
        legacy_alias: String,
    },
    History {
        division: Division,
        legacy_alias: String,
    },
    Unrecognized,
}

impl SnapshotFile {
    /// Classifies `v85_<YYYYMMDD>_<1-8>.csv` and `v85_history_<YYYYMMDD>_<1-8>.csv`.
    pub fn resolve(file_name: &str) -> Self {
        if let Some(caps) = CURRENT_RE.captures(file_name) {
            if let Some(division) = division_capture(&caps) {
                return Self::Current {
                    date: iso_date(&caps[1]),
                    division,
                    legacy_alias: legacy_alias(file_name),
                };
            }
        }
        if let Some(caps) = HISTORY_RE.captures(file_name) {
            if let Some(division) = division_capture(&caps) {
                return Self::History {
                    division,
                    legacy_alias: legacy_alias(file_name),
                };
            }
        }
        Self::Unrecognized
    }

    pub fn kind(&self) -> Option<SnapshotKind> {
        match self {
            Self::Current { .. } => Some(SnapshotKind::Current),
            Self::History { .. } => Some(SnapshotKind::History),
            Self::Unrecognized => None,
        }
    }

    pub fn legacy_alias(&self) -> Option<&str> {
        match self {
            Self::Current { legacy_alias, .. } | Self::History { legacy_alias, .. } => {
                Some(legacy_alias)
            }
            Self::Unrecognized => None,
        }
    }
}

/// Swaps the leading namespace token for the legacy one. Purely textual.
pub fn legacy_alias(file_name: &str) -> String {
    file_name.replacen(
        &format!("{ACTIVE_NAMESPACE}_"),
        &format!("{LEGACY_NAMESPACE}_"),
        1,
    )
}

pub fn current_file_name(date: NaiveDate, division: Division) -> String {
    format!("{ACTIVE_NAMESPACE}_{}_{division}{CSV_SUFFIX}", date.format("%Y%m%d"))
}

pub fn history_file_name(date: NaiveDate, division: Division) -> String {
    format!(
        "{ACTIVE_NAMESPACE}_{HISTORY_SEGMENT}_{}_{division}{CSV_SUFFIX}",
        date.format("%Y%m%d")
    )
}

fn division_capture(caps: &Captures<'_>) -> Option<Division> {
    caps.get(2)
        .and_then(|m| m.as_str().chars().next())
        .and_then(Division::from_digit)
}

/// `YYYYMMDD` digits as `YYYY-MM-DD`, without calendar checks.
fn iso_date(digits: &str) -> String {
    format!("{}-{}-{}", &digits[0..4], &digits[4..6], &digits[6..8])
}

/// One horse's starting-list state for one division of one race date.
///
/// Identity is `(date, division, horse_name)`; everything else is overwritten
/// by the latest import carrying the same key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentEntry {
    pub date: String,
    pub division: Division,
    pub start_number: String,
    pub horse_name: String,
    pub driver: String,
    pub trainer: String,
    pub bet_percentage: String,
    pub win_odds: String,
    pub sulky_type: String,
    pub source_file: String,
}

/// One past race result for a horse. Rows have no natural key; the batch
/// attributed to a `source_file` is replaced as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub division: Division,
    pub horse_name: String,
    pub date: String,
    pub track: String,
    pub driver: String,
    pub finishing_place: String,
    pub distance_post_position: String,
    pub kilometer_time: String,
    pub shoe_configuration: String,
    pub odds: String,
    pub prize: String,
    pub sulky_type: String,
    pub source_file: String,
}
