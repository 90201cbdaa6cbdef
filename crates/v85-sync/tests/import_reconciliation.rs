use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use v85_core::{CurrentEntry, Division, HistoryRecord, SnapshotKind};
use v85_storage::{SnapshotStore, SnapshotWriter};
use v85_sync::{ImportConfig, ImportError, ImportPipeline, ImportRunSummary, KindCounts};

const CURRENT_HEADER: &str = "startnummer,hästnamn,kusk,tränare,v85%,v-odds,vagn";
const HISTORY_HEADER: &str =
    "hästnamn,datum,bana,kusk,placering,distans:spår,KM-tid,skor,odds,pris,vagn";

struct Workspace {
    _root: TempDir,
    csv_dir: PathBuf,
    store: SnapshotStore,
}

impl Workspace {
    async fn new() -> Self {
        let root = tempfile::tempdir().expect("tempdir");
        let csv_dir = root.path().join("csv");
        fs::create_dir(&csv_dir).expect("csv dir");
        let store = SnapshotStore::open(root.path().join("db").join("v85.sqlite"))
            .await
            .expect("open store");
        Self {
            _root: root,
            csv_dir,
            store,
        }
    }

    fn write(&self, name: &str, header: &str, rows: &[&str]) {
        let mut body = format!("\u{feff}{header}\n");
        for row in rows {
            body.push_str(row);
            body.push('\n');
        }
        fs::write(self.csv_dir.join(name), body).expect("write csv");
    }

    fn remove(&self, name: &str) {
        fs::remove_file(self.csv_dir.join(name)).expect("remove csv");
    }

    async fn import(&self, skip_history: bool) -> Result<ImportRunSummary, ImportError> {
        let config = ImportConfig {
            database_path: self.store.path().to_path_buf(),
            csv_dir: self.csv_dir.clone(),
            skip_history,
        };
        ImportPipeline::new(self.store.clone(), config).run_once().await
    }

    async fn count(&self, kind: SnapshotKind) -> i64 {
        self.store.count(kind).await.expect("count")
    }

    async fn attributed(&self, kind: SnapshotKind, file: &str) -> i64 {
        self.store
            .count_attributed(kind, file)
            .await
            .expect("count attributed")
    }
}

fn path_name(path: &Path) -> &str {
    path.file_name().and_then(|n| n.to_str()).expect("file name")
}

#[tokio::test]
async fn reimporting_unchanged_files_is_idempotent() {
    let ws = Workspace::new().await;
    ws.write(
        "v85_20260221_1.csv",
        CURRENT_HEADER,
        &[
            "1,Odin Sisu,Örjan Kihlström,Daniel Redén,12.50,3.45,Amerikansk",
            "02,Tor,Magnus A Djuse,,3.05,,",
        ],
    );
    ws.write(
        "v85_history_20260221_1.csv",
        HISTORY_HEADER,
        &[
            "Odin Sisu,2026-02-07,Solvalla,Örjan Kihlström,1,2140:4,\"1:11,4\",Barfota fram,3.45,150000,Amerikansk",
            "Odin Sisu,2026-01-30,Åby,Magnus A Djuse,d,2640,\"1:09,0\",Skor runt om,12.05,50000,",
        ],
    );

    let first = ws.import(false).await.expect("first import");
    assert_eq!(first.current, KindCounts { files: 1, rows: 2 });
    assert_eq!(first.history, KindCounts { files: 1, rows: 2 });
    assert_eq!(first.cleared_rows, 0);
    let current_after_first = ws.store.current_entries().await.expect("current");
    let history_after_first = ws.store.history_records().await.expect("history");

    let second = ws.import(false).await.expect("second import");
    assert_eq!(second.current, first.current);
    assert_eq!(second.history, first.history);
    assert_eq!(second.cleared_rows, 4);
    assert_ne!(second.run_id, first.run_id);

    assert_eq!(ws.store.current_entries().await.expect("current"), current_after_first);
    assert_eq!(ws.store.history_records().await.expect("history"), history_after_first);
    assert_eq!(current_after_first[1].start_number, "02");
    assert_eq!(history_after_first[0].kilometer_time, "1:11,4");
    assert_eq!(history_after_first[1].finishing_place, "d");
}

#[tokio::test]
async fn newer_odds_overwrite_the_stored_row() {
    let ws = Workspace::new().await;
    ws.write("v85_20260101_1.csv", CURRENT_HEADER, &["1,Odin,,,,3.00,"]);
    ws.import(false).await.expect("first import");

    ws.write("v85_20260101_1.csv", CURRENT_HEADER, &["1,Odin,,,,3.50,"]);
    ws.import(false).await.expect("second import");

    let entries = ws.store.current_entries().await.expect("current");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].horse_name, "Odin");
    assert_eq!(entries[0].date, "2026-01-01");
    assert_eq!(entries[0].win_odds, "3.50");
}

#[tokio::test]
async fn active_name_supersedes_legacy_attribution() {
    let ws = Workspace::new().await;
    let legacy = "v86_20260101_1.csv";
    let division = Division::new(1).expect("division");
    let legacy_entry = |horse: &str| CurrentEntry {
        date: "2026-01-01".into(),
        division,
        start_number: "1".into(),
        horse_name: horse.into(),
        driver: String::new(),
        trainer: String::new(),
        bet_percentage: String::new(),
        win_odds: "3.00".into(),
        sulky_type: String::new(),
        source_file: legacy.into(),
    };
    let mut tx = ws.store.begin().await.expect("begin");
    tx.upsert_current(&legacy_entry("Odin")).await.expect("seed");
    tx.upsert_current(&legacy_entry("Scratched")).await.expect("seed");
    tx.commit().await.expect("commit");

    ws.write(legacy, CURRENT_HEADER, &["1,Ignored,,,,9.99,"]);
    ws.write("v85_20260101_1.csv", CURRENT_HEADER, &["1,Odin,,,,4.10,"]);
    let summary = ws.import(false).await.expect("import");
    assert_eq!(summary.current.files, 1);
    assert_eq!(summary.unrecognized_files, 1);
    assert_eq!(summary.cleared_rows, 2);

    assert_eq!(ws.attributed(SnapshotKind::Current, legacy).await, 0);
    let entries = ws.store.current_entries().await.expect("current");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].horse_name, "Odin");
    assert_eq!(entries[0].win_odds, "4.10");
    assert_eq!(entries[0].source_file, "v85_20260101_1.csv");
}

#[tokio::test]
async fn history_files_append_without_doubling() {
    let ws = Workspace::new().await;
    let first = "v85_history_20260214_2.csv";
    let second = "v85_history_20260221_2.csv";
    ws.write(
        first,
        HISTORY_HEADER,
        &[
            "Odin,2026-01-30,Åby,,2,,,,5.00,20000,",
            "Odin,2026-01-15,Solvalla,,1,,,,2.10,40000,",
        ],
    );
    ws.import(false).await.expect("first import");
    ws.import(false).await.expect("re-import");
    assert_eq!(ws.attributed(SnapshotKind::History, first).await, 2);

    ws.write(
        second,
        HISTORY_HEADER,
        &[
            "Odin,2026-02-07,Solvalla,,1,,,,3.45,150000,",
            "Odin,2026-01-30,Åby,,2,,,,5.00,20000,",
        ],
    );
    let summary = ws.import(false).await.expect("both files");
    assert_eq!(summary.history, KindCounts { files: 2, rows: 4 });
    assert_eq!(ws.attributed(SnapshotKind::History, first).await, 2);
    assert_eq!(ws.attributed(SnapshotKind::History, second).await, 2);
    assert_eq!(ws.count(SnapshotKind::History).await, 4);
}

#[tokio::test]
async fn unrecognized_files_are_skipped() {
    let ws = Workspace::new().await;
    ws.write("v85_20260221_3.csv", CURRENT_HEADER, &["1,Odin,,,,,"]);
    ws.write("startlista kopia.csv", CURRENT_HEADER, &["1,Tor,,,,,"]);

    let summary = ws.import(false).await.expect("import");
    assert_eq!(summary.current, KindCounts { files: 1, rows: 1 });
    assert_eq!(summary.history, KindCounts::default());
    assert_eq!(summary.unrecognized_files, 1);
    assert_eq!(ws.count(SnapshotKind::Current).await, 1);
}

#[tokio::test]
async fn a_headerless_file_aborts_the_whole_run() {
    let ws = Workspace::new().await;
    ws.write("v85_20260221_1.csv", CURRENT_HEADER, &["1,Odin,,,,3.00,"]);
    ws.import(false).await.expect("baseline");

    ws.write("v85_20260221_1.csv", CURRENT_HEADER, &["1,Odin,,,,3.50,"]);
    fs::write(ws.csv_dir.join("v85_20260221_2.csv"), "").expect("empty file");

    let err = ws.import(false).await.expect_err("missing header");
    match err {
        ImportError::MissingHeader { file } => assert_eq!(file, "v85_20260221_2.csv"),
        other => panic!("unexpected {other:?}"),
    }

    let entries = ws.store.current_entries().await.expect("current");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].win_odds, "3.00");

    ws.remove("v85_20260221_2.csv");
    ws.import(false).await.expect("rerun");
    let entries = ws.store.current_entries().await.expect("current");
    assert_eq!(entries[0].win_odds, "3.50");
}

#[tokio::test]
async fn missing_csv_directory_fails_before_writing() {
    let ws = Workspace::new().await;
    fs::remove_dir(&ws.csv_dir).expect("remove csv dir");
    let err = ws.import(false).await.expect_err("no directory");
    assert!(matches!(err, ImportError::UnreadableDirectory { .. }));
    assert_eq!(ws.count(SnapshotKind::Current).await, 0);
}

#[tokio::test]
async fn missing_csv_directory_leaves_no_store_behind() {
    let root = tempfile::tempdir().expect("tempdir");
    let database_path = root.path().join("fresh").join("v85.sqlite");
    let config = ImportConfig {
        database_path: database_path.clone(),
        csv_dir: root.path().join("no-such-dir"),
        skip_history: false,
    };

    let err = match ImportPipeline::open(config).await {
        Ok(_) => panic!("opened without a csv directory"),
        Err(err) => err,
    };
    assert!(matches!(err, ImportError::UnreadableDirectory { .. }));
    assert!(!database_path.exists());
    assert!(!root.path().join("fresh").exists());
}

#[tokio::test]
async fn active_history_name_supersedes_legacy_batch() {
    let ws = Workspace::new().await;
    let legacy = "v86_history_20260101_1.csv";
    let active = "v85_history_20260101_1.csv";
    let division = Division::new(1).expect("division");
    let legacy_record = |date: &str| HistoryRecord {
        division,
        horse_name: "Odin".into(),
        date: date.into(),
        track: "Solvalla".into(),
        driver: String::new(),
        finishing_place: "3".into(),
        distance_post_position: String::new(),
        kilometer_time: String::new(),
        shoe_configuration: String::new(),
        odds: String::new(),
        prize: String::new(),
        sulky_type: String::new(),
        source_file: legacy.into(),
    };
    let mut tx = ws.store.begin().await.expect("begin");
    for date in ["2025-12-01", "2025-11-20", "2025-10-05"] {
        tx.insert_history(&legacy_record(date)).await.expect("seed");
    }
    tx.commit().await.expect("commit");

    ws.write(
        active,
        HISTORY_HEADER,
        &[
            "Odin,2026-02-07,Solvalla,,1,,,,3.45,150000,",
            "Odin,2025-12-01,Solvalla,,3,,,,,,",
        ],
    );
    let summary = ws.import(false).await.expect("import");
    assert_eq!(summary.history, KindCounts { files: 1, rows: 2 });
    assert_eq!(summary.cleared_rows, 3);

    assert_eq!(ws.attributed(SnapshotKind::History, legacy).await, 0);
    assert_eq!(ws.attributed(SnapshotKind::History, active).await, 2);
    let dates = ws
        .store
        .history_records()
        .await
        .expect("history")
        .into_iter()
        .map(|r| r.date)
        .collect::<Vec<_>>();
    assert_eq!(dates, vec!["2026-02-07", "2025-12-01"]);
}

#[tokio::test]
async fn unreadable_row_bytes_abort_the_whole_run() {
    let ws = Workspace::new().await;
    ws.write("v85_20260101_1.csv", CURRENT_HEADER, &["1,Odin,,,,3.00,"]);
    let mut body = format!("{CURRENT_HEADER}\n").into_bytes();
    body.extend_from_slice(b"1,Tor\xff\xfe,,,,2.00,\n");
    fs::write(ws.csv_dir.join("v85_20260101_2.csv"), body).expect("write bytes");

    let err = ws.import(false).await.expect_err("invalid utf-8");
    match err {
        ImportError::MalformedCsv { file, .. } => assert_eq!(file, "v85_20260101_2.csv"),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(ws.count(SnapshotKind::Current).await, 0);
    assert_eq!(ws.attributed(SnapshotKind::Current, "v85_20260101_1.csv").await, 0);
}

#[tokio::test]
async fn skip_history_leaves_history_untouched() {
    let ws = Workspace::new().await;
    let history = ws.csv_dir.join("v85_history_20260221_4.csv");
    ws.write(path_name(&history), HISTORY_HEADER, &["Odin,2026-01-01,,,,,,,,,"]);
    ws.write("v85_20260221_4.csv", CURRENT_HEADER, &["1,Odin,,,,,"]);

    let summary = ws.import(true).await.expect("import");
    assert_eq!(summary.current, KindCounts { files: 1, rows: 1 });
    assert_eq!(summary.history, KindCounts::default());
    assert_eq!(summary.skipped_history_files, 1);
    assert_eq!(ws.count(SnapshotKind::History).await, 0);

    let summary = ws.import(false).await.expect("with history");
    assert_eq!(summary.history, KindCounts { files: 1, rows: 1 });
}
