use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use lockviz_contracts::catalog::{LockCatalog, LockReference};
use lockviz_contracts::events::{new_session_id, EventWriter};
use lockviz_contracts::state::{AttemptState, FailureKind, OutputImage};
use lockviz_engine::config::{
    DOOR_MAX_WIDTH_ENV, IMAGE_MODEL_ENV, LOCK_MAX_WIDTH_ENV, MAX_ATTEMPTS_ENV, RETRY_BASE_MS_ENV,
};
use lockviz_engine::{
    DryrunService, GeminiService, GenerationService, GenerationSession, PipelineConfig,
    SourceImage,
};
use reqwest::Client as HttpClient;
use serde_json::{json, Value};

const LOCK_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const EXIT_FAILED: i32 = 1;
const EXIT_RATE_LIMITED: i32 = 2;

#[derive(Debug, Parser)]
#[command(name = "lockviz-rs", version, about = "Preview a smart lock on a photo of your door")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the locks that can be previewed.
    Catalog(CatalogArgs),
    /// Composite a lock onto a door photo and save the result.
    Preview(PreviewArgs),
}

#[derive(Debug, Parser)]
struct CatalogArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Parser)]
struct PreviewArgs {
    #[arg(long)]
    door: PathBuf,
    /// Catalog id; defaults to the first catalog entry.
    #[arg(long)]
    lock: Option<String>,
    /// Local lock photo used instead of downloading the catalog image.
    #[arg(long)]
    lock_image: Option<PathBuf>,
    #[arg(long, default_value = "lockviz-preview.jpg")]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = Provider::Gemini)]
    provider: Provider,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    door_max_width: Option<u32>,
    #[arg(long)]
    lock_max_width: Option<u32>,
    #[arg(long)]
    max_attempts: Option<u32>,
    #[arg(long)]
    retry_base_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Provider {
    Gemini,
    Dryrun,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    match run().await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("lockviz-rs error: {err:#}");
            std::process::exit(EXIT_FAILED);
        }
    }
}

async fn run() -> Result<i32> {
    let cli = Cli::parse();
    load_dotenv(Path::new(".env"));
    match cli.command {
        Command::Catalog(args) => run_catalog(args),
        Command::Preview(args) => run_preview(args).await,
    }
}

fn run_catalog(args: CatalogArgs) -> Result<i32> {
    let catalog = LockCatalog::load()?;
    if args.json {
        let rows: Vec<Value> = catalog
            .list()
            .map(|lock| {
                json!({
                    "id": lock.id,
                    "name": lock.name,
                    "image_url": lock.image_url,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(0);
    }
    for lock in catalog.list() {
        println!("{:<12} {:<22} {}", lock.id, lock.name, lock.image_url);
    }
    Ok(0)
}

async fn run_preview(args: PreviewArgs) -> Result<i32> {
    let config = apply_overrides(PipelineConfig::from_env(), &args);
    let catalog = LockCatalog::load()?;
    let lock = resolve_lock(&catalog, args.lock.as_deref())?;

    let door_bytes =
        fs::read(&args.door).with_context(|| format!("failed reading {}", args.door.display()))?;
    let door = SourceImage::from_bytes(door_bytes)
        .with_context(|| format!("{} is not a readable image", args.door.display()))?;
    let lock_bytes = match args.lock_image.as_ref() {
        Some(path) => {
            fs::read(path).with_context(|| format!("failed reading {}", path.display()))?
        }
        None => fetch_image_bytes(&lock.image_url).await?,
    };
    let lock_image = SourceImage::from_bytes(lock_bytes)
        .with_context(|| format!("lock image for '{}' is not readable", lock.id))?;

    let job = PreviewJob {
        door,
        lock,
        lock_image,
        out: args.out,
        events: args.events,
    };
    match args.provider {
        Provider::Gemini => {
            let service = GeminiService::from_env(config.image_model.clone(), config.request_timeout)?;
            run_session(service, config, job).await
        }
        Provider::Dryrun => run_session(DryrunService, config, job).await,
    }
}

struct PreviewJob {
    door: SourceImage,
    lock: LockReference,
    lock_image: SourceImage,
    out: PathBuf,
    events: Option<PathBuf>,
}

async fn run_session<S: GenerationService>(
    service: S,
    config: PipelineConfig,
    job: PreviewJob,
) -> Result<i32> {
    let mut session = GenerationSession::new(service, config);
    if let Some(path) = job.events.as_ref() {
        session = session.with_events(EventWriter::new(path, new_session_id()));
    }
    println!(
        "Previewing {} with {}...",
        job.lock.name,
        session.service().name()
    );
    session.set_door_image(job.door);
    session.select_lock(job.lock, job.lock_image);

    let mut updates = session.subscribe();
    let generation = session.generate();
    tokio::pin!(generation);
    let result = loop {
        tokio::select! {
            result = &mut generation => break result,
            changed = updates.changed() => {
                if changed.is_err() {
                    break (&mut generation).await;
                }
                let label = updates.borrow_and_update().progress_label();
                if let Some(label) = label {
                    println!("  {label}");
                }
            }
        }
    };

    match result {
        Ok(invocation) => {
            let out = output_path(&job.out, &invocation.image);
            save_output(&out, &invocation.image)?;
            println!(
                "Saved preview to {} ({} attempt(s))",
                out.display(),
                invocation.attempts
            );
            Ok(0)
        }
        Err(err) => match session.state() {
            AttemptState::Failed { kind, message, .. } => {
                eprintln!("{message}");
                if let Some(wait) = kind.retry_after() {
                    eprintln!("Retry after {}s.", wait.as_secs());
                }
                Ok(exit_code_for(kind))
            }
            _ => Err(err.into()),
        },
    }
}

fn exit_code_for(kind: FailureKind) -> i32 {
    match kind {
        FailureKind::RateLimited => EXIT_RATE_LIMITED,
        _ => EXIT_FAILED,
    }
}

/// Flags go through the same parsing and clamping as `LOCKVIZ_*` variables.
fn apply_overrides(config: PipelineConfig, args: &PreviewArgs) -> PipelineConfig {
    let flags: HashMap<&str, String> = [
        (IMAGE_MODEL_ENV, args.model.clone()),
        (
            DOOR_MAX_WIDTH_ENV,
            args.door_max_width.map(|width| width.to_string()),
        ),
        (
            LOCK_MAX_WIDTH_ENV,
            args.lock_max_width.map(|width| width.to_string()),
        ),
        (
            MAX_ATTEMPTS_ENV,
            args.max_attempts.map(|attempts| attempts.to_string()),
        ),
        (
            RETRY_BASE_MS_ENV,
            args.retry_base_ms.map(|base_ms| base_ms.to_string()),
        ),
    ]
    .into_iter()
    .filter_map(|(key, value)| value.map(|value| (key, value)))
    .collect();
    config.with_overrides(|key| flags.get(key).cloned())
}

fn resolve_lock(catalog: &LockCatalog, requested: Option<&str>) -> Result<LockReference> {
    match requested.map(str::trim).filter(|value| !value.is_empty()) {
        Some(id) => catalog
            .get(id)
            .cloned()
            .with_context(|| format!("unknown lock '{id}' (see `lockviz-rs catalog`)")),
        None => catalog
            .default_lock()
            .cloned()
            .context("lock catalog is empty"),
    }
}

/// Catalog images are usually remote; `file://` URLs and bare paths are read from disk.
async fn fetch_image_bytes(location: &str) -> Result<Vec<u8>> {
    let trimmed = location.trim();
    if let Some(path) = trimmed.strip_prefix("file://") {
        return fs::read(path).with_context(|| format!("failed reading {path}"));
    }
    if !trimmed.starts_with("http://") && !trimmed.starts_with("https://") {
        return fs::read(trimmed).with_context(|| format!("failed reading {trimmed}"));
    }

    let response = HttpClient::new()
        .get(trimmed)
        .timeout(LOCK_FETCH_TIMEOUT)
        .send()
        .await
        .with_context(|| format!("lock image request failed ({trimmed})"))?;
    let status = response.status();
    if !status.is_success() {
        bail!("lock image request failed ({}): {trimmed}", status.as_u16());
    }
    let bytes = response
        .bytes()
        .await
        .with_context(|| format!("lock image body read failed ({trimmed})"))?;
    Ok(bytes.to_vec())
}

/// Keeps the requested name but swaps the extension when the service returned another format.
fn output_path(requested: &Path, image: &OutputImage) -> PathBuf {
    let extension = image.extension();
    let matches = requested
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| {
            let value = value.to_ascii_lowercase();
            value == extension || (extension == "jpg" && value == "jpeg")
        })
        .unwrap_or(false);
    if matches {
        requested.to_path_buf()
    } else {
        requested.with_extension(extension)
    }
}

fn save_output(path: &Path, image: &OutputImage) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(path, &image.data).with_context(|| format!("failed to write {}", path.display()))
}

/// Exports `.env` entries that are not already set in the environment.
fn load_dotenv(path: &Path) {
    for (key, value) in parse_dotenv(path) {
        if env::var_os(&key).is_none() {
            env::set_var(key, value);
        }
    }
}

fn parse_dotenv(path: &Path) -> HashMap<String, String> {
    let content = fs::read_to_string(path).unwrap_or_default();
    let mut vars = HashMap::new();
    for raw_line in content.lines() {
        let mut line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(stripped) = line.strip_prefix("export ") {
            line = stripped.trim();
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value.trim();
        let unquoted = ['"', '\'']
            .iter()
            .find_map(|quote| {
                value
                    .strip_prefix(*quote)
                    .and_then(|rest| rest.strip_suffix(*quote))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), unquoted.to_string());
    }
    vars
}
