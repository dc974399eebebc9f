//! Fileshare Store CLI
//!
//! Maintenance commands for the chunked file store: store and fetch files,
//! inspect metadata, migrate between backends and backfill checksums.

use std::env;
use std::path::PathBuf;

use anyhow::Context;
use bytes::Bytes;
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use futures::{stream, Stream, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fileshare_store::{
    db, BinaryId, BinaryStore, ByteRange, Config, FileStore, Hint, StoreError,
};

/// Read buffer for streaming files into the store
const READ_BUFFER: usize = 64 * 1024;

/// Chunked file store maintenance tool
#[derive(Parser, Debug)]
#[command(name = "fileshare-store", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store a file and print its metadata
    Put {
        file: PathBuf,
        /// Declared content type, used when the bytes don't tell
        #[arg(long)]
        content_type: Option<String>,
    },
    /// Write a stored file, or a byte range of it, to a file or stdout
    Get {
        id: String,
        #[arg(long, default_value_t = 0)]
        start: u64,
        /// Exclusive end offset
        #[arg(long)]
        end: Option<u64>,
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Print the metadata of a stored file
    Stat { id: String },
    /// Delete a stored file
    Rm { id: String },
    /// Copy every stored file into another backend
    Copy {
        #[arg(long)]
        to: TargetBackend,
        /// Target directory for the filesystem backend
        #[arg(long)]
        directory: Option<PathBuf>,
    },
    /// Queue files still missing a checksum
    Backfill {
        #[arg(long, default_value_t = 1000)]
        limit: u32,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TargetBackend {
    Database,
    Filesystem,
    S3,
}

impl TargetBackend {
    fn as_str(&self) -> &'static str {
        match self {
            TargetBackend::Database => "database",
            TargetBackend::Filesystem => "filesystem",
            TargetBackend::S3 => "s3",
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "fileshare_store=info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env().context("Invalid configuration")?;

    let (store, worker) = FileStore::open(&config)
        .await
        .context("Failed to open file store")?;

    let result = run(&store, &config, cli.command).await;

    // Let queued checksum jobs finish before exiting
    drop(store);
    if let Some(worker) = worker {
        worker.await.context("Checksum worker panicked")?;
    }

    result
}

async fn run(store: &FileStore, config: &Config, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Put { file, content_type } => {
            let name = file.file_name().map(|n| n.to_string_lossy().into_owned());
            let hint = Hint {
                filename: name,
                content_type,
            };

            let handle = tokio::fs::File::open(&file)
                .await
                .with_context(|| format!("Failed to open {}", file.display()))?;
            let meta = store.insert(file_stream(handle), &hint, Utc::now()).await?;

            println!("{}", serde_json::to_string_pretty(&meta)?);
        }
        Command::Get {
            id,
            start,
            end,
            output,
        } => {
            let id = BinaryId::new(id)?;
            let range = match end {
                Some(end) => ByteRange::new(start, end),
                None => ByteRange::starting_at(start),
            };

            let binary = store
                .find_binary(&id, range)
                .await?
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

            let mut writer: Box<dyn tokio::io::AsyncWrite + Unpin + Send> = match &output {
                Some(path) => Box::new(tokio::fs::File::create(path).await?),
                None => Box::new(tokio::io::stdout()),
            };

            let mut stream = binary.stream;
            while let Some(chunk) = stream.next().await {
                writer.write_all(&chunk?).await?;
            }
            writer.flush().await?;
        }
        Command::Stat { id } => {
            let id = BinaryId::new(id)?;
            let meta = store
                .find_meta(&id)
                .await?
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

            println!("{}", serde_json::to_string_pretty(&meta)?);
        }
        Command::Rm { id } => {
            store.delete(&BinaryId::new(id)?).await?;
        }
        Command::Copy { to, directory } => {
            let target = open_target(config, to, directory).await?;
            let stats = store.copy_files(&target).await?;

            println!("{}", serde_json::to_string_pretty(&stats)?);
            if stats.failed > 0 {
                anyhow::bail!("{} files failed to copy", stats.failed);
            }
        }
        Command::Backfill { limit } => {
            let count = store.resubmit_missing_checksums(limit).await?;
            println!("Submitted {} files for checksum computation", count);
        }
    }

    Ok(())
}

/// Build the copy target from the environment with the backend overridden
async fn open_target(
    config: &Config,
    backend: TargetBackend,
    directory: Option<PathBuf>,
) -> anyhow::Result<BinaryStore> {
    let directory = directory.map(|d| d.to_string_lossy().into_owned());
    let target = Config::from_lookup(|key| match key {
        "FILESTORE_BACKEND" => Some(backend.as_str().to_string()),
        "FILESTORE_DIRECTORY" if directory.is_some() => directory.clone(),
        _ => env::var(key).ok(),
    })
    .context("Invalid target configuration")?;

    let pool = db::create_pool(&config.database.url).await?;
    Ok(BinaryStore::from_config(&target.storage, &pool).await?)
}

/// Stream a file in fixed-size reads
fn file_stream(file: tokio::fs::File) -> impl Stream<Item = fileshare_store::Result<Bytes>> + Send {
    stream::try_unfold(file, |mut file| async move {
        let mut buffer = vec![0u8; READ_BUFFER];
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            return Ok(None);
        }

        buffer.truncate(read);
        Ok::<_, StoreError>(Some((Bytes::from(buffer), file)))
    })
}
