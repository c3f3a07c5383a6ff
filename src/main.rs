use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use freesia_sandbox::{EngineConfig, SandboxEngine};
use freesia_scheduler::{Scheduler, SchedulerConfig};
use freesia_source::{FsSourceStore, SourceStore};
use freesia_store::{CallStore, ObjectStore, SqliteStore};

/// Freesia - content-addressed Lua script objects with declared schedules
#[derive(Parser)]
#[command(name = "freesia")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.freesia)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Store a script and print its object hash
  Add {
    /// Path to the Lua script
    file: PathBuf,
  },

  /// Execute a script object and print its call record
  Run {
    /// Object hash or declared id
    target: String,

    /// Validate declarations only: no dependencies, no call record
    #[arg(long)]
    debug: bool,
  },

  /// List declared objects
  Objects,

  /// List recent call records, newest first
  Calls {
    /// Maximum number of records
    #[arg(long, default_value_t = 20)]
    limit: i64,
  },

  /// Show one call record
  Call {
    /// The call id
    call_id: String,
  },

  /// List stored script sources
  Sources,

  /// Run the cron worker until interrupted
  Worker,
}

fn main() -> Result<()> {
  tracing_subscriber::registry()
    .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
    .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
    .init();

  let cli = Cli::parse();

  let data_dir = cli.data_dir.unwrap_or_else(|| {
    dirs::home_dir()
      .expect("could not determine home directory")
      .join(".freesia")
  });

  match cli.command {
    Some(Commands::Add { file }) => add_script(file, data_dir)?,
    Some(Commands::Run { target, debug }) => run_object(target, debug, data_dir)?,
    Some(Commands::Objects) => list_objects(data_dir)?,
    Some(Commands::Calls { limit }) => list_calls(limit, data_dir)?,
    Some(Commands::Call { call_id }) => show_call(call_id, data_dir)?,
    Some(Commands::Sources) => list_sources(data_dir)?,
    Some(Commands::Worker) => run_worker(data_dir)?,
    None => {
      println!("freesia - use --help to see available commands");
    }
  }

  Ok(())
}

async fn open_services(data_dir: &Path) -> Result<(Arc<SqliteStore>, Arc<FsSourceStore>)> {
  tokio::fs::create_dir_all(data_dir)
    .await
    .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

  let store = SqliteStore::connect(&data_dir.join("freesia.db"))
    .await
    .context("failed to open database")?;
  store.migrate().await.context("failed to run migrations")?;

  let sources = FsSourceStore::new(data_dir.join("sources"));

  Ok((Arc::new(store), Arc::new(sources)))
}

fn build_engine(store: &Arc<SqliteStore>, sources: &Arc<FsSourceStore>) -> SandboxEngine {
  SandboxEngine::new(
    store.clone(),
    store.clone(),
    sources.clone(),
    EngineConfig::default(),
  )
}

fn add_script(file: PathBuf, data_dir: PathBuf) -> Result<()> {
  let rt = tokio::runtime::Runtime::new()?;
  rt.block_on(async { add_script_async(file, data_dir).await })
}

async fn add_script_async(file: PathBuf, data_dir: PathBuf) -> Result<()> {
  let (_, sources) = open_services(&data_dir).await?;

  let content = tokio::fs::read_to_string(&file)
    .await
    .with_context(|| format!("failed to read script file: {}", file.display()))?;

  let hash = sources
    .write(&content)
    .await
    .context("failed to store script source")?;

  eprintln!("Stored {}", file.display());
  println!("{hash}");

  Ok(())
}

fn run_object(target: String, debug: bool, data_dir: PathBuf) -> Result<()> {
  let rt = tokio::runtime::Runtime::new()?;
  rt.block_on(async { run_object_async(target, debug, data_dir).await })
}

async fn run_object_async(target: String, debug: bool, data_dir: PathBuf) -> Result<()> {
  let (store, sources) = open_services(&data_dir).await?;

  // the target is a stored hash or, failing that, a declared id
  let object_hash = match sources.exists_by_hash(&target).await {
    Ok(true) => target.clone(),
    Ok(false) | Err(freesia_source::Error::InvalidHash { .. }) => {
      match store.find_object_by_id(&target).await? {
        Some(meta) => meta.object_hash,
        None => bail!(
          "nothing matches '{}': not a stored hash or a declared id",
          target
        ),
      }
    }
    Err(e) => return Err(e.into()),
  };

  if debug {
    eprintln!("Executing {object_hash} (debug)");
  } else {
    eprintln!("Executing {object_hash}");
  }

  let engine = build_engine(&store, &sources);
  let record = engine.execute(&object_hash, debug).await;

  println!("{}", serde_json::to_string_pretty(&record)?);

  Ok(())
}

fn list_objects(data_dir: PathBuf) -> Result<()> {
  let rt = tokio::runtime::Runtime::new()?;
  rt.block_on(async { list_objects_async(data_dir).await })
}

async fn list_objects_async(data_dir: PathBuf) -> Result<()> {
  let (store, _) = open_services(&data_dir).await?;
  let objects = store.list_objects().await?;

  eprintln!("{} object(s)", objects.len());
  println!("{}", serde_json::to_string_pretty(&objects)?);

  Ok(())
}

fn list_calls(limit: i64, data_dir: PathBuf) -> Result<()> {
  let rt = tokio::runtime::Runtime::new()?;
  rt.block_on(async { list_calls_async(limit, data_dir).await })
}

async fn list_calls_async(limit: i64, data_dir: PathBuf) -> Result<()> {
  let (store, _) = open_services(&data_dir).await?;
  let calls = store.list_calls(limit).await?;

  eprintln!("{} call(s)", calls.len());
  println!("{}", serde_json::to_string_pretty(&calls)?);

  Ok(())
}

fn show_call(call_id: String, data_dir: PathBuf) -> Result<()> {
  let rt = tokio::runtime::Runtime::new()?;
  rt.block_on(async { show_call_async(call_id, data_dir).await })
}

async fn show_call_async(call_id: String, data_dir: PathBuf) -> Result<()> {
  let (store, _) = open_services(&data_dir).await?;

  let Some(record) = store.find_call(&call_id).await? else {
    bail!("call '{}' not found", call_id);
  };

  println!("{}", serde_json::to_string_pretty(&record)?);

  Ok(())
}

fn list_sources(data_dir: PathBuf) -> Result<()> {
  let rt = tokio::runtime::Runtime::new()?;
  rt.block_on(async { list_sources_async(data_dir).await })
}

async fn list_sources_async(data_dir: PathBuf) -> Result<()> {
  let (_, sources) = open_services(&data_dir).await?;
  let entries = sources.list().await?;

  eprintln!("{} source(s)", entries.len());
  println!("{}", serde_json::to_string_pretty(&entries)?);

  Ok(())
}

fn run_worker(data_dir: PathBuf) -> Result<()> {
  let rt = tokio::runtime::Runtime::new()?;
  rt.block_on(async { run_worker_async(data_dir).await })
}

async fn run_worker_async(data_dir: PathBuf) -> Result<()> {
  let (store, sources) = open_services(&data_dir).await?;
  let engine = build_engine(&store, &sources);
  let scheduler = Scheduler::new(
    store.clone() as Arc<dyn ObjectStore>,
    engine,
    SchedulerConfig::default(),
  );

  let cancel = CancellationToken::new();
  {
    let cancel = cancel.clone();
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        eprintln!("shutting down");
        cancel.cancel();
      }
    });
  }

  eprintln!("Worker started; press Ctrl-C to stop");
  scheduler.run(cancel).await;

  Ok(())
}
