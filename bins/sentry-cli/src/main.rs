//! # Sentry CLI - Anomaly Detection Pipeline Runner
//!
//! Loads a YAML pipeline configuration, builds the configured
//! source-filters-sink chain, and runs it to exhaustion with proper error
//! handling, logging, and graceful shutdown.
//!
//! ## Usage
//!
//! ```bash
//! # Run a pipeline from a YAML configuration file
//! sentry-cli -c demos/historical-alert.yml
//!
//! # Raise the log level
//! sentry-cli -c pipeline.yml -L DEBUG
//!
//! # Print the regex a key-pattern glob compiles to
//! sentry-cli --debug-glob 'aaa.(*).prober-?.zzz'
//! ```
//!
//! Exit codes: 0 on success, 1 for configuration or usage errors, 255 for
//! internal errors.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use sentry_core::config::{load_config, PipelineSpec, StageSpec};
use sentry_core::{glob, pipeline, Context, SentryError, DEFAULT_CHANNEL_CAPACITY};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter};

/// Command-line arguments for the sentry pipeline runner
#[derive(Parser, Debug)]
#[command(name = "sentry-cli")]
#[command(about = "Detect outages in streaming time-series data and send alerts")]
struct Args {
    /// Name of configuration file
    #[arg(short = 'c', long, required_unless_present = "debug_glob")]
    configfile: Option<PathBuf>,

    /// Logging level
    #[arg(short = 'L', long, default_value = "INFO")]
    loglevel: String,

    /// Convert a glob to a regex and exit
    #[arg(long)]
    debug_glob: Option<String>,

    /// Buffer size for the channels between pipeline stages
    #[arg(long, default_value_t = DEFAULT_CHANNEL_CAPACITY)]
    channel_capacity: usize,
}

/// The tracing target a stage's module logs under.
fn log_target(module: &str) -> Option<&'static str> {
    match module {
        "sources.Realtime" => Some("sentry_io::source_realtime"),
        "sources.Historical" => Some("sentry_io::source_historical"),
        "sources.JsonIn" => Some("sentry_io::source_json"),
        "filters.TimeOrder" => Some("sentry_tx::time_order"),
        "filters.TimeOrderChecker" => Some("sentry_tx::time_order_checker"),
        "filters.Keyfilter" => Some("sentry_tx::key_filter"),
        "filters.KeyEntity" => Some("sentry_tx::key_entity"),
        "filters.ToSigned" => Some("sentry_tx::to_signed"),
        "filters.AggSum" => Some("sentry_tx::agg_sum"),
        "filters.AggTimeMedian" => Some("sentry_tx::agg_time_median"),
        "filters.MovingStat" => Some("sentry_tx::moving_stat"),
        "sinks.AlertKafka" => Some("sentry_io::sink_alert_kafka"),
        "sinks.JsonOut" => Some("sentry_io::sink_json"),
        _ => None,
    }
}

/// Compose the global level with the config's global and per-stage levels.
fn build_filter(cli_level: &str, spec: Option<&PipelineSpec>) -> Result<EnvFilter, SentryError> {
    let mut directives = spec
        .and_then(|s| s.loglevel.clone())
        .unwrap_or_else(|| cli_level.to_string());
    if let Some(spec) = spec {
        for stage in &spec.pipeline {
            if let (Some(level), Some(target)) = (stage.loglevel(), log_target(stage.module())) {
                directives.push_str(&format!(",{target}={level}"));
            }
        }
    }
    EnvFilter::try_new(&directives)
        .map_err(|e| SentryError::user(format!("invalid loglevel '{directives}': {e}")))
}

/// Instantiate the stages in pipeline order, threading the shared context.
fn build_stages(
    spec: &PipelineSpec,
) -> Result<
    (
        Box<dyn sentry_core::Source>,
        Vec<Box<dyn sentry_core::Filter>>,
        Box<dyn sentry_core::Sink>,
    ),
    SentryError,
> {
    let mut ctx = Context::default();
    let last = spec.pipeline.len() - 1;
    let source = sentry_io::create_source(&spec.pipeline[0], &mut ctx)?;
    let mut filters = Vec::new();
    for stage in &spec.pipeline[1..last] {
        filters.push(sentry_tx::create_filter(stage, &mut ctx)?);
    }
    let sink = sentry_io::create_sink(&spec.pipeline[last], &ctx)?;
    Ok((source, filters, sink))
}

async fn run(args: Args, reload_handle: FilterHandle) -> Result<()> {
    if let Some(pattern) = &args.debug_glob {
        println!("{}", glob::glob_to_regex(pattern)?);
        return Ok(());
    }

    // clap enforces the presence of the config file in the non-glob path
    let Some(configfile) = &args.configfile else {
        return Err(SentryError::user("a configuration file is required").into());
    };
    let spec = load_config(configfile)?;
    if let Err(e) = reload_handle.reload(build_filter(&args.loglevel, Some(&spec))?) {
        error!("could not apply configured log levels: {e}");
    }

    let (source, filters, sink) = build_stages(&spec)?;
    info!(
        "pipeline: {}",
        spec.pipeline
            .iter()
            .map(StageSpec::module)
            .collect::<Vec<_>>()
            .join(" -> ")
    );

    let cancel = CancellationToken::new();
    let mut pipeline = tokio::spawn(pipeline::run_pipeline(
        source,
        filters,
        sink,
        args.channel_capacity,
        cancel.clone(),
    ));

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
            cancel.cancel();
            pipeline.await??;
        }
        result = &mut pipeline => result??,
    }
    Ok(())
}

type FilterHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

fn is_user_error(e: &anyhow::Error) -> bool {
    e.chain()
        .any(|cause| matches!(cause.downcast_ref::<SentryError>(), Some(SentryError::User(_))))
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let initial = match build_filter(&args.loglevel, None) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(1);
        }
    };
    let (filter, reload_handle) = reload::Layer::new(initial);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run(args, reload_handle).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if is_user_error(&e) => {
            error!("{e}");
            ExitCode::from(1)
        }
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(255)
        }
    }
}
