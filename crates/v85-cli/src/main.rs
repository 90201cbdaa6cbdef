use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;
use v85_core::{Division, SnapshotKind};
use v85_storage::SnapshotStore;
use v85_sync::{FetchConfig, FetchPipeline, FetchRequest, ImportConfig, ImportPipeline};

#[derive(Debug, Parser)]
#[command(name = "v85")]
#[command(about = "V85 snapshot collection and SQLite ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile snapshot CSV files into the store (default).
    Import(ImportArgs),
    /// Collect the upcoming starting list or horse history into a CSV file.
    Fetch(FetchArgs),
    /// Print the most recent rows of a table.
    Show(ShowArgs),
    /// Create the store schema if missing.
    Migrate(MigrateArgs),
}

#[derive(Debug, Default, Args)]
struct ImportArgs {
    /// SQLite file [env: V85_DB_PATH, default ./v85.sqlite]
    #[arg(long)]
    db: Option<PathBuf>,
    /// Directory holding the snapshot CSV files [env: V85_CSV_DIR, default ./csv]
    #[arg(long)]
    csv_dir: Option<PathBuf>,
    /// Ignore history files entirely
    #[arg(short = 's', long)]
    skip_history: bool,
    /// Print the run summary as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct FetchArgs {
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=8))]
    division: u8,
    /// Collect recent results per horse instead of the starting list
    #[arg(long)]
    history: bool,
    /// Results kept per horse [env: V85_MAX_HISTORY, default 5]
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    max_history: Option<u64>,
    /// Output file; defaults to the conventional name inside the CSV directory
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long)]
    csv_dir: Option<PathBuf>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Table {
    Current,
    History,
}

impl From<Table> for SnapshotKind {
    fn from(value: Table) -> Self {
        match value {
            Table::Current => SnapshotKind::Current,
            Table::History => SnapshotKind::History,
        }
    }
}

#[derive(Debug, Args)]
struct ShowArgs {
    #[arg(long)]
    db: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = Table::Current)]
    table: Table,
    #[arg(long, default_value_t = 20)]
    limit: u32,
}

#[derive(Debug, Args)]
struct MigrateArgs {
    #[arg(long)]
    db: Option<PathBuf>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn database_path(flag: Option<PathBuf>) -> PathBuf {
    flag.unwrap_or_else(|| ImportConfig::from_env().database_path)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or_else(|| Commands::Import(ImportArgs::default())) {
        Commands::Import(args) => import(args).await?,
        Commands::Fetch(args) => fetch(args).await?,
        Commands::Show(args) => show(args).await?,
        Commands::Migrate(args) => {
            let path = database_path(args.db);
            let store = SnapshotStore::open(&path)
                .await
                .with_context(|| format!("opening store {}", path.display()))?;
            store.bootstrap_schema().await?;
            store.close().await;
            println!("schema ready: {}", path.display());
        }
    }

    Ok(())
}

async fn import(args: ImportArgs) -> Result<()> {
    let mut config = ImportConfig::from_env();
    if let Some(db) = args.db {
        config.database_path = db;
    }
    if let Some(csv_dir) = args.csv_dir {
        config.csv_dir = csv_dir;
    }
    config.skip_history |= args.skip_history;

    let pipeline = ImportPipeline::open(config)
        .await
        .context("opening snapshot store")?;
    let summary = pipeline.run_once().await.context("import failed, nothing was committed")?;
    info!(run_id = %summary.run_id, "import complete");

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{}", summary.render_text());
    }
    Ok(())
}

async fn fetch(args: FetchArgs) -> Result<()> {
    let mut config = FetchConfig::from_env();
    if let Some(csv_dir) = args.csv_dir {
        config.csv_dir = csv_dir;
    }
    if let Some(max_history) = args.max_history {
        config.max_history = usize::try_from(max_history).context("max history out of range")?;
    }

    let division = Division::new(args.division)?;
    let kind = if args.history {
        SnapshotKind::History
    } else {
        SnapshotKind::Current
    };
    let mut request = FetchRequest::new(division, kind);
    request.out = args.out;

    let summary = FetchPipeline::new(config)?.run_once(&request).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{}", summary.render_text());
    }
    Ok(())
}

async fn show(args: ShowArgs) -> Result<()> {
    let path = database_path(args.db);
    let store = SnapshotStore::open_existing(&path)
        .await
        .with_context(|| format!("opening store {}", path.display()))?;
    let report = v85_sync::show_table(&store, args.table.into(), args.limit).await?;
    println!("{report}");
    store.close().await;
    Ok(())
}
