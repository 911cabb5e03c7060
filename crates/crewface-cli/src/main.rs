use anyhow::{Context, Result};
use clap::{ArgGroup, Parser};
use crewface_core::{FaceExtractor, OnnxExtractor};
use crewface_image::ImageFetcher;
use crewface_pipeline::{
    BatchOptions, BatchOrchestrator, Config, ConfigError, EmbeddingStore, PipelineSettings,
    RunScope, RunSummary, SqliteRoster, SubjectOutcome, SubjectReport,
};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "generate-embeddings",
    version,
    about = "Generate face embeddings for crew members from their roster photos"
)]
#[command(group(ArgGroup::new("target").required(true).args(["all", "crew_id"])))]
struct Cli {
    /// Process every active crew member with a photo
    #[arg(long)]
    all: bool,

    /// Process a single crew member
    #[arg(long, value_name = "ID")]
    crew_id: Option<String>,

    /// Regenerate embeddings that already exist
    #[arg(long)]
    force: bool,

    /// Verbose logging (RUST_LOG still takes precedence)
    #[arg(long)]
    debug: bool,

    /// Stop scheduling new subjects after this many seconds
    #[arg(long, value_name = "SECS")]
    timeout_secs: Option<u64>,

    /// Subjects processed at once (overrides BATCH_CONCURRENCY)
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u16).range(1..))]
    concurrency: Option<u16>,

    /// Print the run summary as JSON instead of text
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn scope(&self) -> RunScope {
        match &self.crew_id {
            Some(id) => RunScope::Subject(id.clone()),
            None => RunScope::All,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(&cli).await {
        Ok(summary) if summary.failed == 0 => ExitCode::SUCCESS,
        Ok(_) => ExitCode::from(1),
        Err(err) => {
            eprintln!("error: {err:#}");
            if err.downcast_ref::<ConfigError>().is_some() {
                ExitCode::from(2)
            } else {
                ExitCode::from(1)
            }
        }
    }
}

async fn run(cli: &Cli) -> Result<RunSummary> {
    let mut config = Config::from_env()?;
    if let Some(n) = cli.concurrency {
        config.batch_concurrency = n as usize;
    }

    tracing::info!(
        base_url = %config.image_base_url,
        model = %config.model_name,
        detector = %config.detector_backend,
        db = %config.db_path.display(),
        "generate-embeddings starting"
    );

    let store = EmbeddingStore::open(&config.db_path)
        .await
        .with_context(|| format!("opening embedding store {}", config.db_path.display()))?;
    let roster = SqliteRoster::open(&config.roster_db_path)
        .await
        .with_context(|| format!("opening roster {}", config.roster_db_path.display()))?;
    let fetcher = ImageFetcher::new(config.fetch_config()).context("building image fetcher")?;
    let extractor = load_extractor(&config).await?;

    let settings = PipelineSettings::from_config(&config);
    let orchestrator = BatchOrchestrator::new(roster, fetcher, extractor, store, settings);

    let cancel = CancellationToken::new();
    spawn_cancel_triggers(&cancel, cli.timeout_secs);

    let options = BatchOptions {
        force: cli.force,
        concurrency: config.batch_concurrency,
        delay: config.batch_delay,
    };
    let summary = orchestrator
        .run_with(&cli.scope(), &options, &cancel, |report| {
            if !cli.json {
                println!("{}", outcome_line(report));
            }
        })
        .await?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{}", summary_line(&summary));
    }
    Ok(summary)
}

async fn load_extractor(config: &Config) -> Result<Arc<dyn FaceExtractor>> {
    let extractor_config = config.extractor_config();
    let expected = OnnxExtractor::model_dir_hint(
        &extractor_config.model_dir,
        &extractor_config.model_name,
        &extractor_config.detector_backend,
    );
    let extractor = tokio::task::spawn_blocking(move || OnnxExtractor::load(&extractor_config))
        .await
        .context("model loading task failed")?
        .with_context(|| {
            format!(
                "loading {} / {} models (expected files: {expected:?})",
                config.model_name, config.detector_backend
            )
        })?;
    Ok(Arc::new(extractor))
}

fn spawn_cancel_triggers(cancel: &CancellationToken, timeout_secs: Option<u64>) {
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, finishing in-flight subjects");
            on_signal.cancel();
        }
    });

    if let Some(secs) = timeout_secs {
        let on_timeout = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            tracing::warn!(timeout_secs = secs, "run timeout reached, no new subjects will start");
            on_timeout.cancel();
        });
    }
}

fn outcome_line(report: &SubjectReport) -> String {
    let who = match report.subject.display_name() {
        name if name.is_empty() => report.subject.subject_id.clone(),
        name => format!("{} ({name})", report.subject.subject_id),
    };
    let secs = report.elapsed.as_secs_f32();
    match &report.outcome {
        SubjectOutcome::Succeeded { record, replaced } => {
            let verb = if replaced.is_some() { "re-enrolled" } else { "enrolled" };
            format!("[ok]   {who}: {verb}, confidence {:.3} ({secs:.2}s)", record.confidence)
        }
        SubjectOutcome::Skipped { record } => {
            format!("[skip] {who}: already enrolled (record {})", record.id)
        }
        SubjectOutcome::Failed(err) => format!(
            "[fail] {who}: {} {} - {} ({secs:.2}s)",
            err.stage, err.kind, err.message
        ),
    }
}

fn summary_line(summary: &RunSummary) -> String {
    format!(
        "{} succeeded, {} failed, {} skipped, {} not attempted in {:.1}s (avg {:.2}s per subject)",
        summary.succeeded,
        summary.failed,
        summary.skipped,
        summary.not_attempted,
        summary.elapsed.as_secs_f32(),
        summary.average_latency().as_secs_f32()
    )
}
