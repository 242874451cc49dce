use anyhow::{Context as _, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use clap::{Args, Parser, Subcommand};
use rendergate_config::{Config, ConfigWatcher, LogConfig, LogFormat};
use rendergate_store::SqliteKeyPool;
use rendergate_types::{
    ApiKey, AspectRatio, ImageRequest, InlineImage, JobRef, ResolutionTier, TextRequest,
    UserFacingError, VideoRequest,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

#[derive(Parser, Debug)]
#[command(
    name = "rendergate",
    about = "rendergate — resilient multi-key generation client"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,
    /// SQLite key pool path (default: pool.database, else ~/.rendergate/pool.db).
    #[arg(long, value_name = "PATH", global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a generation request through the key pool.
    #[command(subcommand)]
    Generate(GenerateCommand),
    /// Manage pool keys.
    #[command(subcommand)]
    Keys(KeysCommand),
    /// Inspect job key reports.
    #[command(subcommand)]
    Jobs(JobsCommand),
}

#[derive(Subcommand, Debug)]
enum GenerateCommand {
    /// Generate text.
    Text {
        #[arg(long)]
        prompt: String,
        /// System instruction.
        #[arg(long)]
        system: Option<String>,
        /// Image to include with the prompt (repeatable).
        #[arg(long = "image", value_name = "FILE")]
        images: Vec<PathBuf>,
        #[arg(long, value_name = "ID")]
        job: Option<String>,
    },
    /// Generate or edit an image.
    Image(ImageArgs),
    /// Generate or edit a high-resolution image.
    HdImage {
        #[command(flatten)]
        image: ImageArgs,
        /// 1K, 2K or 4K.
        #[arg(long, default_value = "1K")]
        resolution: ResolutionTier,
    },
    /// Generate a video.
    Video {
        #[arg(long)]
        prompt: String,
        /// Starting frame.
        #[arg(long, value_name = "FILE")]
        source: Option<PathBuf>,
        #[arg(long)]
        aspect_ratio: Option<AspectRatio>,
        #[arg(long, value_name = "ID")]
        job: Option<String>,
    },
}

#[derive(Args, Debug)]
struct ImageArgs {
    #[arg(long)]
    prompt: String,
    /// Image to edit.
    #[arg(long, value_name = "FILE")]
    source: Option<PathBuf>,
    /// Reference image (repeatable).
    #[arg(long = "reference", value_name = "FILE")]
    references: Vec<PathBuf>,
    /// 1:1, 16:9, 9:16, 4:3 or 3:4.
    #[arg(long)]
    aspect_ratio: Option<AspectRatio>,
    #[arg(long, default_value_t = 1)]
    count: u32,
    /// Directory the images are written to.
    #[arg(long, value_name = "DIR", default_value = ".")]
    out: PathBuf,
    #[arg(long, value_name = "ID")]
    job: Option<String>,
}

#[derive(Subcommand, Debug)]
enum KeysCommand {
    /// Add a key to the pool (or relabel it).
    Add {
        key: String,
        #[arg(long)]
        label: Option<String>,
    },
    /// Remove a key from the pool.
    Remove { key: String },
    /// List pool keys by fingerprint.
    List,
    /// Clear every exhaustion cooldown.
    Reset,
}

#[derive(Subcommand, Debug)]
enum JobsCommand {
    /// Show which key serviced a job.
    Show { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let watcher = cli
        .config
        .as_deref()
        .map(ConfigWatcher::open)
        .transpose()?
        .map(Arc::new);
    let config = match &watcher {
        Some(watcher) => watcher.current(),
        None => Arc::new(env_config()?),
    };
    let _guard = init_tracing(&config.log)?;
    let pool = Arc::new(open_pool(cli.db, &config).await?);

    match cli.command {
        Commands::Generate(cmd) => cmd_generate(cmd, &config, watcher, pool).await,
        Commands::Keys(cmd) => cmd_keys(cmd, &pool).await,
        Commands::Jobs(JobsCommand::Show { id }) => {
            match pool.job_key(&JobRef::new(id.as_str())).await? {
                Some(fingerprint) => println!("{id}: {fingerprint}"),
                None => println!("{id}: no key reported"),
            }
            Ok(())
        }
    }
}

/// Defaults plus `RENDERGATE_` overrides, used when no `--config` is given.
fn env_config() -> Result<Config> {
    let config = Config::from_env().map_err(|e| anyhow::anyhow!("config error: {e}"))?;
    config.validate()?;
    Ok(config)
}

fn init_tracing(log: &LogConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&log.level))
        .context("invalid log level")?;

    let (writer, guard) = match &log.file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .context("log.file must name a file")?;
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, name));
            (BoxMakeWriter::new(writer), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);
    match log.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
    Ok(guard)
}

/// Opens the shared pool and seeds it with the configured keys.
async fn open_pool(db: Option<PathBuf>, config: &Config) -> Result<SqliteKeyPool> {
    let path = pool_path(db, config);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let url = format!("sqlite://{}", path.display());
    let pool = SqliteKeyPool::new(&url, Duration::from_secs(config.pool.cooldown_secs))
        .await
        .map_err(|e| anyhow::anyhow!("database error: {e}"))?;
    for entry in &config.pool.keys {
        pool.add_key(&ApiKey::new(entry.api_key.trim()), entry.label.as_deref())
            .await?;
    }
    tracing::debug!(db = %path.display(), seeded = config.pool.keys.len(), "key pool ready");
    Ok(pool)
}

/// `--db`, then `pool.database`, then `~/.rendergate/pool.db`.
fn pool_path(db: Option<PathBuf>, config: &Config) -> PathBuf {
    db.or_else(|| config.pool.database.clone())
        .unwrap_or_else(default_db_path)
}

fn default_db_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".rendergate").join("pool.db")
}

async fn cmd_generate(
    cmd: GenerateCommand,
    config: &Config,
    watcher: Option<Arc<ConfigWatcher>>,
    pool: Arc<SqliteKeyPool>,
) -> Result<()> {
    let http = rquest::Client::builder()
        .timeout(Duration::from_secs(config.provider.timeout_secs))
        .build()?;
    let reporter = Some(pool.clone() as Arc<dyn rendergate_types::JobReporter>);
    let client = match watcher {
        Some(watcher) => {
            let _watching = Arc::clone(&watcher).watch()?;
            rendergate_provider::build_live_client(watcher.shared(), pool, reporter, http)
        }
        None => rendergate_provider::build_client(config, pool, reporter, http),
    };

    match cmd {
        GenerateCommand::Text {
            prompt,
            system,
            images,
            job,
        } => {
            let request = TextRequest::builder()
                .prompt(prompt)
                .maybe_system(system)
                .images(read_images(&images)?)
                .build();
            let job = job.map(JobRef::new);
            let text = client
                .text(&request, job.as_ref())
                .await
                .map_err(surface)?;
            println!("{text}");
        }
        GenerateCommand::Image(args) => {
            let (request, out, job) = image_request(args, ResolutionTier::default())?;
            let uris = client
                .image(&request, job.as_ref())
                .await
                .map_err(surface)?;
            write_images(&uris, &out, job.as_ref())?;
        }
        GenerateCommand::HdImage { image, resolution } => {
            let (request, out, job) = image_request(image, resolution)?;
            let uris = client
                .hd_image(&request, job.as_ref())
                .await
                .map_err(surface)?;
            write_images(&uris, &out, job.as_ref())?;
        }
        GenerateCommand::Video {
            prompt,
            source,
            aspect_ratio,
            job,
        } => {
            let request = VideoRequest::builder()
                .prompt(prompt)
                .maybe_source(source.as_deref().map(read_image).transpose()?)
                .maybe_aspect_ratio(aspect_ratio)
                .build();
            let job = job.map(JobRef::new);
            let uri = client
                .video(&request, job.as_ref())
                .await
                .map_err(surface)?;
            println!("{uri}");
        }
    }
    Ok(())
}

async fn cmd_keys(cmd: KeysCommand, pool: &SqliteKeyPool) -> Result<()> {
    match cmd {
        KeysCommand::Add { key, label } => {
            let key = ApiKey::new(key.trim());
            pool.add_key(&key, label.as_deref()).await?;
            eprintln!("added {key}");
        }
        KeysCommand::Remove { key } => {
            let key = ApiKey::new(key.trim());
            if pool.remove_key(&key).await? {
                eprintln!("removed {key}");
            } else {
                eprintln!("{key} is not in the pool");
            }
        }
        KeysCommand::List => {
            for info in pool.list_keys().await? {
                let state = if info.exhausted { "cooling down" } else { "available" };
                println!(
                    "{}\t{}\t{state}\tleases={}",
                    info.fingerprint,
                    info.label.as_deref().unwrap_or("-"),
                    info.lease_count
                );
            }
        }
        KeysCommand::Reset => {
            let cleared = pool.reset_exhausted().await?;
            eprintln!("cleared {cleared} cooldown(s)");
        }
    }
    Ok(())
}

/// Only the sanitized message reaches the terminal; the raw error is logged.
fn surface(err: UserFacingError) -> anyhow::Error {
    if let Some(raw) = &err.raw {
        tracing::debug!(
            kind = %err.kind,
            attempts = err.attempts,
            status = ?raw.status(),
            raw = %raw,
            "generation failed"
        );
    }
    anyhow::anyhow!("{err}")
}

fn image_request(
    args: ImageArgs,
    resolution: ResolutionTier,
) -> Result<(ImageRequest, PathBuf, Option<JobRef>)> {
    let request = ImageRequest::builder()
        .prompt(args.prompt)
        .maybe_source(args.source.as_deref().map(read_image).transpose()?)
        .references(read_images(&args.references)?)
        .maybe_aspect_ratio(args.aspect_ratio)
        .resolution(resolution)
        .count(args.count)
        .build();
    Ok((request, args.out, args.job.map(JobRef::new)))
}

fn read_images(paths: &[PathBuf]) -> Result<Vec<InlineImage>> {
    paths.iter().map(|p| read_image(p)).collect()
}

fn read_image(path: &Path) -> Result<InlineImage> {
    let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mime = match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("png") => "image/png",
        _ => anyhow::bail!("unsupported image type: {}", path.display()),
    };
    Ok(InlineImage::new(mime, data))
}

/// Decodes `data:` URIs into files under `out`, printing each path.
fn write_images(uris: &[String], out: &Path, job: Option<&JobRef>) -> Result<()> {
    std::fs::create_dir_all(out)?;
    let stem = job.map_or_else(|| uuid::Uuid::new_v4().to_string(), |j| j.to_string());
    for (i, uri) in uris.iter().enumerate() {
        let (mime, payload) = uri
            .strip_prefix("data:")
            .and_then(|rest| rest.split_once(";base64,"))
            .context("provider returned a non-data URI")?;
        let ext = match mime {
            "image/jpeg" => "jpg",
            "image/webp" => "webp",
            _ => "png",
        };
        let bytes = STANDARD.decode(payload).context("decoding image payload")?;
        let path = out.join(format!("{stem}-{i}.{ext}"));
        std::fs::write(&path, bytes).with_context(|| format!("writing {}", path.display()))?;
        println!("{}", path.display());
    }
    Ok(())
}
