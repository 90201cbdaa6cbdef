use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use v85_adapters::{
    collect_current_snapshot, collect_history_snapshot, normalize_row, read_snapshot_csv,
    write_current_csv, write_history_csv, FixtureRaceSource, NormalizedRow,
};
use v85_core::{Division, SnapshotFile};

fn sample_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/atg/sample")
}

#[test]
fn atg_sample_fixtures_exist() {
    let root = sample_root();
    assert!(root.join("products/V85.json").exists());
    assert!(root.join("games/V85_2026-02-21_5_5.json").exists());
    assert!(root.join("current_snapshot.json").exists());
}

#[tokio::test]
async fn fetched_snapshots_are_importable_files() {
    let source = FixtureRaceSource::new(sample_root());
    let today = NaiveDate::from_ymd_opt(2026, 2, 20).expect("date");
    let division = Division::new(1).expect("division");
    let out = tempfile::tempdir().expect("tempdir");

    let current = collect_current_snapshot(&source, division, today)
        .await
        .expect("current");
    let current_path = out.path().join(current.file_name());
    write_current_csv(&current_path, &current.rows).expect("write current");

    let history = collect_history_snapshot(&source, division, today, 5)
        .await
        .expect("history");
    let history_path = out.path().join(history.file_name());
    write_history_csv(&history_path, &history.rows).expect("write history");

    let resolved = SnapshotFile::resolve(&current.file_name());
    let rows = read_snapshot_csv(&current_path).expect("read current");
    assert_eq!(rows.len(), 3);
    match normalize_row(&rows[0], &resolved, &current.file_name()) {
        Some(NormalizedRow::Current(entry)) => {
            assert_eq!(entry.date, "2026-02-21");
            assert_eq!(entry.horse_name, "Odin Sisu");
            assert_eq!(entry.trainer, "Daniel Redén");
            assert_eq!(entry.bet_percentage, "12.50");
        }
        other => panic!("unexpected {other:?}"),
    }

    let resolved = SnapshotFile::resolve(&history.file_name());
    let rows = read_snapshot_csv(&history_path).expect("read history");
    assert_eq!(rows.len(), 8);
    match normalize_row(&rows[0], &resolved, &history.file_name()) {
        Some(NormalizedRow::History(record)) => {
            assert_eq!(record.distance_post_position, "2140:4");
            assert_eq!(record.kilometer_time, "1:11,4");
            assert_eq!(record.shoe_configuration, "Barfota fram");
        }
        other => panic!("unexpected {other:?}"),
    }
}
