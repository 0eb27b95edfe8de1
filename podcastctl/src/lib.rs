use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::process::Command;
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

use podcast_core::audio::{AudioInfo, ProbeError};
use podcast_core::catalog::CatalogError;
use podcast_core::command::{run_with_timeout, CommandExecutor, SystemCommandExecutor, ToolOutcome};
use podcast_core::feed::FeedError;
use podcast_core::processing::{ProcessingError, ProcessingJob, ProcessingOutcome};
use podcast_core::upload::{CleanupReport, UploadError, UploadStatus};
use podcast_core::{load_publisher_config, ConfigError, PublisherConfig, PublisherContext};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Processing(#[from] ProcessingError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{0}")]
    CheckFailed(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Podcast publisher control interface", long_about = None)]
pub struct Cli {
    /// Path to publisher.toml
    #[arg(long, global = true, default_value = "configs/publisher.toml")]
    pub config: PathBuf,
    /// Log filter, e.g. `info` or `podcast_core=debug`; falls back to RUST_LOG
    #[arg(long, global = true)]
    pub log_level: Option<String>,
    /// Output format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Runs the HTTP API and processing workers
    Serve(ServeArgs),
    /// Prints the RSS feed of a show
    Feed(FeedArgs),
    /// Reports audio attributes and the transcode decision for a file
    Probe(ProbeArgs),
    /// Processes one episode's audio in the foreground
    Process(ProcessArgs),
    /// Inspects or prunes chunked upload sessions
    #[command(subcommand)]
    Uploads(UploadCommands),
    /// Checks directories and external tools
    #[command(subcommand)]
    Health(HealthCommands),
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Overrides server.bind
    #[arg(long)]
    pub bind: Option<String>,
}

#[derive(Args, Debug)]
pub struct FeedArgs {
    pub show_id: String,
    /// Base URL for links; defaults to server.public_base_url
    #[arg(long)]
    pub base_url: Option<String>,
}

#[derive(Args, Debug)]
pub struct ProbeArgs {
    pub file: PathBuf,
}

#[derive(Args, Debug)]
pub struct ProcessArgs {
    pub show_id: String,
    pub episode_id: String,
}

#[derive(Subcommand, Debug)]
pub enum UploadCommands {
    /// Shows progress of one session
    Status { upload_id: String },
    /// Removes sessions idle for longer than the TTL
    Cleanup {
        /// TTL in seconds; defaults to upload.session_ttl_seconds
        #[arg(long)]
        ttl: Option<u64>,
    },
}

#[derive(Subcommand, Debug)]
pub enum HealthCommands {
    /// Runs basic checks
    Check,
}

/// Installs the global subscriber. Call once, before [`run`].
pub fn init_tracing(level: Option<&str>) {
    let filter = level
        .and_then(|level| EnvFilter::try_new(level).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub fn run(cli: Cli) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run_async(cli))
}

pub async fn run_async(cli: Cli) -> Result<()> {
    let config = load_publisher_config(&cli.config)?;

    match &cli.command {
        Commands::Serve(args) => {
            let context = AppContext::new(config, Arc::new(SystemCommandExecutor));
            context.serve(args, shutdown_signal()).await?;
        }
        Commands::Feed(args) => {
            let context = AppContext::new(config, Arc::new(SystemCommandExecutor));
            let feed = context.feed(args).await;
            context.close().await;
            render(&feed?, cli.format)?;
        }
        Commands::Probe(args) => {
            let context = AppContext::new(config, Arc::new(SystemCommandExecutor));
            let report = context.probe(&args.file).await;
            context.close().await;
            render(&report?, cli.format)?;
        }
        Commands::Process(args) => {
            let context = AppContext::new(config, Arc::new(SystemCommandExecutor));
            let outcome = context.process(args).await;
            context.close().await;
            let outcome = outcome?;
            render(&outcome, cli.format)?;
            if let Some(error) = outcome.error {
                return Err(AppError::CheckFailed(format!("processing failed: {error}")));
            }
        }
        Commands::Uploads(UploadCommands::Status { upload_id }) => {
            let context = AppContext::new(config, Arc::new(SystemCommandExecutor));
            let status = context.ctx.uploads.status(upload_id).await;
            context.close().await;
            render(&status?, cli.format)?;
        }
        Commands::Uploads(UploadCommands::Cleanup { ttl }) => {
            let context = AppContext::new(config, Arc::new(SystemCommandExecutor));
            let report = context.cleanup(*ttl).await;
            context.close().await;
            render(&report?, cli.format)?;
        }
        Commands::Health(HealthCommands::Check) => {
            let report = health_check(&config, &SystemCommandExecutor).await;
            render(&report, cli.format)?;
            if report
                .iter()
                .any(|entry| matches!(entry.status, CheckStatus::Error))
            {
                return Err(AppError::CheckFailed(
                    "one or more checks failed".to_string(),
                ));
            }
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

struct AppContext {
    ctx: Arc<PublisherContext>,
}

impl AppContext {
    fn new(config: PublisherConfig, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            ctx: Arc::new(PublisherContext::from_config(config, executor)),
        }
    }

    async fn close(&self) {
        self.ctx.shutdown().await;
    }

    async fn serve<F>(&self, args: &ServeArgs, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr: SocketAddr = match args.bind.as_deref() {
            Some(bind) => bind
                .parse()
                .map_err(|err| AppError::InvalidArgument(format!("--bind {bind}: {err}")))?,
            None => self.ctx.config.server.bind_addr()?,
        };
        let listener = TcpListener::bind(addr).await?;
        podcast_core::serve(Arc::clone(&self.ctx), listener, shutdown).await?;
        Ok(())
    }

    async fn feed(&self, args: &FeedArgs) -> Result<FeedOutput> {
        let base_url = match args.base_url.as_deref() {
            Some(raw) => Url::parse(raw)
                .map_err(|err| AppError::InvalidArgument(format!("--base-url {raw}: {err}")))?,
            None => self
                .ctx
                .config
                .server
                .public_base_url()?
                .ok_or_else(|| {
                    AppError::InvalidArgument(
                        "pass --base-url or set server.public_base_url".to_string(),
                    )
                })?,
        };
        let document = self.ctx.feed.render(&args.show_id, &base_url).await?;
        Ok(FeedOutput {
            show_id: args.show_id.clone(),
            etag: document.etag.clone(),
            last_modified: document.last_modified_header(),
            xml: document.xml,
        })
    }

    async fn probe(&self, file: &Path) -> Result<ProbeReport> {
        let info = self.ctx.prober.probe(file).await?;
        let decision = self.ctx.policy.decide(file, Ok(info.clone()));
        let target_bitrate = decision
            .required
            .then(|| self.ctx.policy.select(info.bitrate_kbps()).label());
        Ok(ProbeReport {
            info,
            transcode_required: decision.required,
            reason: decision.reason,
            target_bitrate,
        })
    }

    /// Marks the episode `processing` and runs the job on this task.
    async fn process(&self, args: &ProcessArgs) -> Result<ProcessingOutcome> {
        {
            let catalog = &self.ctx.catalog;
            let _guard = catalog.lock_episode(&args.show_id, &args.episode_id).await;
            let mut metadata = catalog.load_episode(&args.show_id, &args.episode_id).await?;
            metadata.mark_processing();
            catalog
                .save_episode(&args.show_id, &args.episode_id, &metadata)
                .await?;
        }
        let job = ProcessingJob::new(&args.show_id, &args.episode_id);
        Ok(self.ctx.processor.process(&job).await?)
    }

    async fn cleanup(&self, ttl: Option<u64>) -> Result<CleanupReport> {
        let ttl = ttl
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.ctx.session_ttl());
        Ok(self.ctx.uploads.cleanup(ttl).await?)
    }
}

async fn health_check(config: &PublisherConfig, executor: &dyn CommandExecutor) -> Vec<HealthEntry> {
    let mut entries = Vec::new();
    for (name, dir) in [
        ("shows_dir", config.paths.shows_dir()),
        ("uploads_dir", config.paths.uploads_dir()),
        ("assembled_dir", config.paths.assembled_dir()),
    ] {
        let entry = match tokio::fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => HealthEntry::ok(name, dir.display().to_string()),
            Ok(_) => HealthEntry::error(name, format!("{} is not a directory", dir.display())),
            Err(_) => HealthEntry::warn(name, format!("{} missing, created on first use", dir.display())),
        };
        entries.push(entry);
    }

    let limit = config.audio.probe_timeout();
    for (name, program) in [("ffprobe", &config.audio.ffprobe), ("ffmpeg", &config.audio.ffmpeg)] {
        let mut command = Command::new(program);
        command.arg("-version");
        let entry = match run_with_timeout(executor, &mut command, limit).await {
            ToolOutcome::Completed(output) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout)
                    .lines()
                    .next()
                    .unwrap_or_default()
                    .to_string();
                HealthEntry::ok(name, version)
            }
            ToolOutcome::Completed(output) => HealthEntry::error(
                name,
                format!("exited with {:?}: {}", output.status.code(), ToolOutcome::stderr_lossy(&output)),
            ),
            ToolOutcome::NotFound => {
                HealthEntry::error(name, format!("{} not found", program.display()))
            }
            ToolOutcome::SpawnFailed(err) => HealthEntry::error(name, err.to_string()),
            ToolOutcome::TimedOut(limit) => {
                HealthEntry::error(name, format!("no answer within {limit:?}"))
            }
        };
        entries.push(entry);
    }
    entries
}

#[derive(Debug, Serialize)]
pub struct FeedOutput {
    pub show_id: String,
    pub etag: String,
    pub last_modified: String,
    pub xml: String,
}

impl DisplayFallback for FeedOutput {
    fn display(&self) -> String {
        self.xml.trim_end().to_string()
    }
}

#[derive(Debug, Serialize)]
pub struct ProbeReport {
    #[serde(flatten)]
    pub info: AudioInfo,
    pub transcode_required: bool,
    pub reason: String,
    pub target_bitrate: Option<String>,
}

impl DisplayFallback for ProbeReport {
    fn display(&self) -> String {
        let info = &self.info;
        let mut lines = vec![
            format!("File:       {}", info.filename),
            format!("Format:     {}", info.format),
            format!("Bitrate:    {}", info.bitrate),
            format!("Duration:   {}", info.duration),
            format!("Size:       {}", info.size),
        ];
        if let (Some(rate), Some(channels)) = (info.samplerate, info.channels) {
            lines.push(format!("Audio:      {rate} Hz, {channels} ch"));
        }
        let verdict = match &self.target_bitrate {
            Some(target) => format!("transcode to {target} ({})", self.reason),
            None => self.reason.clone(),
        };
        lines.push(format!("Decision:   {verdict}"));
        lines.join("\n")
    }
}

impl DisplayFallback for ProcessingOutcome {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "{}/{}: {}",
            self.show_id, self.episode_id, self.status
        )];
        if let Some(audio) = &self.audio {
            lines.push(format!("  audio: {}", audio.display()));
        }
        if self.transcoded {
            lines.push("  transcoded".to_string());
        }
        if self.retagged {
            lines.push("  retagged".to_string());
        }
        if let Some(reason) = &self.reason {
            lines.push(format!("  reason: {reason}"));
        }
        if let Some(error) = &self.error {
            lines.push(format!("  error: {error}"));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for UploadStatus {
    fn display(&self) -> String {
        format!(
            "{} ({}): {}/{} chunks, {:.1}%{}\nstarted {} ago, last chunk {} ago",
            self.upload_id,
            self.filename,
            self.received,
            self.total,
            self.percent_complete,
            if self.complete { ", complete" } else { "" },
            human_seconds(self.elapsed_seconds),
            human_seconds(self.age_seconds),
        )
    }
}

impl DisplayFallback for CleanupReport {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "deleted {}, kept {}, failed {}, unclaimed files removed {}",
            self.deleted, self.skipped, self.failed, self.assembled_removed
        )];
        for entry in &self.results {
            let age = entry
                .age_seconds
                .map(human_seconds)
                .unwrap_or_else(|| "?".to_string());
            let mut line = format!("- {} {:?} (idle {age})", entry.upload_id, entry.outcome);
            if let Some(error) = &entry.error {
                line.push_str(&format!(": {error}"));
            }
            lines.push(line);
        }
        lines.join("\n")
    }
}

fn human_seconds(seconds: i64) -> String {
    let seconds = seconds.max(0);
    match seconds {
        s if s < 60 => format!("{s}s"),
        s if s < 3600 => format!("{}m{:02}s", s / 60, s % 60),
        s => format!("{}h{:02}m", s / 3600, (s % 3600) / 60),
    }
}

#[derive(Debug, Serialize)]
pub struct HealthEntry {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub enum CheckStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warn => "WARN",
            CheckStatus::Error => "ERROR",
        };
        write!(f, "{}", label)
    }
}

impl HealthEntry {
    fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Ok,
            detail: detail.into(),
        }
    }

    fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warn,
            detail: detail.into(),
        }
    }

    fn error(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Error,
            detail: detail.into(),
        }
    }
}

impl DisplayFallback for Vec<HealthEntry> {
    fn display(&self) -> String {
        self.iter()
            .map(|entry| format!("[{}] {}: {}", entry.status, entry.name, entry.detail))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::os::unix::process::ExitStatusExt;
    use std::process::{ExitStatus, Output};

    use podcast_core::catalog::ShowFeedConfig;
    use tempfile::TempDir;

    /// Answers `-version` for any program except ones under a `missing` path.
    struct VersionOnly;

    #[async_trait::async_trait]
    impl CommandExecutor for VersionOnly {
        async fn run(&self, command: &mut Command) -> io::Result<Output> {
            let program = command.as_std().get_program().to_string_lossy().to_string();
            if program.contains("missing") {
                return Err(io::Error::new(io::ErrorKind::NotFound, "not installed"));
            }
            Ok(Output {
                status: ExitStatus::from_raw(0),
                stdout: format!("{program} version 6.1\nbuilt with gcc").into_bytes(),
                stderr: Vec::new(),
            })
        }
    }

    fn config(temp: &TempDir) -> PublisherConfig {
        PublisherConfig::with_base_dir(temp.path())
    }

    #[test]
    fn global_flags_follow_subcommands() {
        let cli = Cli::try_parse_from([
            "podcastctl",
            "uploads",
            "cleanup",
            "--ttl",
            "60",
            "--format",
            "json",
            "--config",
            "/etc/podcast.toml",
        ])
        .unwrap();
        assert_eq!(cli.format, OutputFormat::Json);
        assert_eq!(cli.config, PathBuf::from("/etc/podcast.toml"));
        assert!(matches!(
            cli.command,
            Commands::Uploads(UploadCommands::Cleanup { ttl: Some(60) })
        ));
    }

    #[test]
    fn process_takes_show_and_episode() {
        let cli = Cli::try_parse_from(["podcastctl", "process", "morning", "ab12cd34"]).unwrap();
        match cli.command {
            Commands::Process(args) => {
                assert_eq!(args.show_id, "morning");
                assert_eq!(args.episode_id, "ab12cd34");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[tokio::test]
    async fn health_check_reports_missing_tools() {
        let temp = tempfile::tempdir().unwrap();
        let mut config = config(&temp);
        std::fs::create_dir_all(config.paths.shows_dir()).unwrap();
        config.audio.ffmpeg = PathBuf::from("/opt/missing/ffmpeg");

        let report = health_check(&config, &VersionOnly).await;
        let status = |name: &str| {
            report
                .iter()
                .find(|entry| entry.name == name)
                .map(|entry| entry.status.to_string())
                .unwrap()
        };
        assert_eq!(status("shows_dir"), "OK");
        assert_eq!(status("uploads_dir"), "WARN");
        assert_eq!(status("ffprobe"), "OK");
        assert_eq!(status("ffmpeg"), "ERROR");
        assert!(report
            .iter()
            .any(|entry| entry.detail.ends_with("ffprobe version 6.1")));
    }

    #[tokio::test]
    async fn feed_needs_a_base_url() {
        let temp = tempfile::tempdir().unwrap();
        let context = AppContext::new(config(&temp), Arc::new(VersionOnly));
        context
            .ctx
            .catalog
            .save_show(
                "morning",
                &ShowFeedConfig {
                    title: Some("Morning Show".into()),
                    ..ShowFeedConfig::default()
                },
            )
            .await
            .unwrap();

        let missing = context
            .feed(&FeedArgs {
                show_id: "morning".into(),
                base_url: None,
            })
            .await;
        assert!(matches!(missing, Err(AppError::InvalidArgument(_))));

        let feed = context
            .feed(&FeedArgs {
                show_id: "morning".into(),
                base_url: Some("https://pod.example/".into()),
            })
            .await
            .unwrap();
        assert!(feed
            .display()
            .contains("<link>https://pod.example/shows/morning</link>"));
        assert!(feed.etag.starts_with('"'));
        context.close().await;
    }

    #[tokio::test]
    async fn cleanup_honours_ttl_override() {
        let temp = tempfile::tempdir().unwrap();
        let context = AppContext::new(config(&temp), Arc::new(VersionOnly));
        context
            .ctx
            .uploads
            .put_chunk("u1", 0, 2, "a.mp3", b"data")
            .await
            .unwrap();

        let report = context.cleanup(None).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert!(report.display().starts_with("deleted 0, kept 1, failed 0"));
        context.close().await;
    }

    #[tokio::test]
    async fn process_reports_missing_episode() {
        let temp = tempfile::tempdir().unwrap();
        let context = AppContext::new(config(&temp), Arc::new(VersionOnly));
        let err = context
            .process(&ProcessArgs {
                show_id: "morning".into(),
                episode_id: "ghost".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Catalog(CatalogError::EpisodeNotFound { .. })));
        context.close().await;
    }

    #[test]
    fn human_seconds_picks_a_unit() {
        assert_eq!(human_seconds(42), "42s");
        assert_eq!(human_seconds(125), "2m05s");
        assert_eq!(human_seconds(7_260), "2h01m");
        assert_eq!(human_seconds(-5), "0s");
    }
}
