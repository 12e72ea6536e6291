//! diffusion: replay producer streams through the dashboard diffusion pipeline

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use dashboard_diffusion::format::{format_registry, format_report, FormatOptions};
use dashboard_diffusion::parser::parse_stream;
use dashboard_diffusion::replay::{replay, ReplayOptions};
use diffusion_core::RunMode;
use diffusion_engine::{DiffusionConfig, Registry, CONTEXTS};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser)]
#[command(
    name = "diffusion",
    about = "Dashboard diffusion: validated, budgeted UI state from a producer stream"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a JSONL event stream and print the final dashboard
    Replay {
        /// Path to a .jsonl file, one event per line
        file: PathBuf,
        /// Producer context (dm, evidence, policy, strategy, vision, feedback)
        #[arg(short, long, default_value = "dm")]
        context: String,
        /// Run mode: stable (conservative) or deep (exploratory)
        #[arg(short, long, default_value = "stable")]
        mode: String,
        /// TOML config file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Print the report as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
        /// Print counts and health only
        #[arg(long, default_value_t = false)]
        summary: bool,
        /// Don't truncate long panel values
        #[arg(long, default_value_t = false)]
        raw: bool,
        /// Also write logs to this file
        #[arg(long)]
        log_file: Option<PathBuf>,
    },
    /// Print the default configuration as TOML
    Config,
    /// List registered panel kinds
    Registry {
        /// Only kinds this context may create
        #[arg(short, long)]
        context: Option<String>,
        /// TOML config file
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn init_tracing(log_file: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = || {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "diffusion=info,dashboard_diffusion=info,diffusion_engine=info".into())
    };
    let console = fmt::layer().with_writer(std::io::stderr).with_filter(filter());

    let Some(path) = log_file else {
        tracing_subscriber::registry().with(console).init();
        return Ok(None);
    };

    let dir = path.parent().filter(|d| !d.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let name = path
        .file_name()
        .context("--log-file must name a file")?;
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
    let file = fmt::layer()
        .with_ansi(false)
        .with_writer(writer)
        .with_filter(filter());
    tracing_subscriber::registry().with(console).with(file).init();
    Ok(Some(guard))
}

fn load_config(path: Option<&Path>) -> DiffusionConfig {
    match path {
        Some(p) => DiffusionConfig::load(p),
        None => DiffusionConfig::default(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Replay {
            file,
            context,
            mode,
            config,
            json,
            summary,
            raw,
            log_file,
        } => {
            let _guard = init_tracing(log_file.as_deref())?;

            let mode: RunMode = mode.parse().map_err(anyhow::Error::msg)?;
            if !CONTEXTS.contains(&context.as_str()) {
                tracing::warn!("Context {:?} is not a known producer context", context);
            }

            let parsed = parse_stream(&file).with_context(|| format!("reading {}", file.display()))?;
            for e in &parsed.errors {
                eprintln!("{}:{}: {}", file.display(), e.line, e.message);
            }

            let opts = ReplayOptions {
                context,
                mode,
                config: load_config(config.as_deref()),
            };
            let report = replay(parsed.events, &opts).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                let fmt_opts = FormatOptions {
                    summary_only: summary,
                    raw,
                };
                print!("{}", format_report(&report, &fmt_opts));
            }
        }
        Commands::Config => {
            print!("{}", DiffusionConfig::default().to_toml());
        }
        Commands::Registry { context, config } => {
            init_tracing(None)?;
            let config = load_config(config.as_deref());
            let registry = Registry::from_config(&config.registry, &config.budget);
            print!("{}", format_registry(&registry, context.as_deref()));
        }
    }

    Ok(())
}
