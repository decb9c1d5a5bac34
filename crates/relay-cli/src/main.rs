//! relay CLI - adaptive LLM routing gateway

use anyhow::{bail, Context as _};
use clap::{Parser, Subcommand};
use relay_core::{GatewayConfig, LearningSnapshot, TokenMeter};
use relay_runtime::{Gateway, RouteRequest};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "relay")]
#[command(author, version, about = "Adaptive LLM routing gateway", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// More logging (-v debug, -vv trace); RUST_LOG takes precedence
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Clone, Copy, Default, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a gateway config file (YAML or JSON)
    Validate {
        /// Path to the config
        config: PathBuf,
    },

    /// Estimate tokens and cost of a prompt without calling a backend
    Estimate {
        #[arg(short, long)]
        config: PathBuf,
        /// Prompt text; reads stdin when omitted
        #[arg(short, long)]
        prompt: Option<String>,
        /// Models to price; defaults to the effective candidates
        #[arg(short, long, value_delimiter = ',')]
        models: Vec<String>,
        #[arg(short, long)]
        tenant: Option<String>,
        /// Completion tokens to assume
        #[arg(long)]
        output_tokens: Option<u32>,
    },

    /// Inspect learning snapshots
    Snapshot {
        #[command(subcommand)]
        action: SnapshotAction,
    },

    /// Route a single prompt through the gateway
    Route {
        #[arg(short, long)]
        config: PathBuf,
        /// Task type used for learning and caching
        #[arg(long)]
        task: String,
        /// Prompt text; reads stdin when omitted
        #[arg(short, long)]
        prompt: Option<String>,
        /// Bypass selection and use this model
        #[arg(short, long)]
        model: Option<String>,
        #[arg(long, value_delimiter = ',')]
        candidates: Vec<String>,
        #[arg(short, long)]
        tenant: Option<String>,
        #[arg(short, long)]
        workspace: Option<String>,
        #[arg(long)]
        system: Option<String>,
        /// Restore learning state from this snapshot first
        #[arg(long)]
        snapshot_in: Option<PathBuf>,
        /// Write learning state here afterwards
        #[arg(long)]
        snapshot_out: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum SnapshotAction {
    /// List domains, policies and versions in a snapshot file
    Show { path: PathBuf },
    /// Check which domains a config would restore from a snapshot
    Check {
        path: PathBuf,
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    match cli.command {
        Commands::Validate { config } => validate(&config, cli.format),
        Commands::Estimate {
            config,
            prompt,
            models,
            tenant,
            output_tokens,
        } => estimate(&config, prompt, models, tenant, output_tokens, cli.format),
        Commands::Snapshot { action } => match action {
            SnapshotAction::Show { path } => snapshot_show(&path, cli.format),
            SnapshotAction::Check { path, config } => snapshot_check(&path, &config, cli.format),
        },
        Commands::Route {
            config,
            task,
            prompt,
            model,
            candidates,
            tenant,
            workspace,
            system,
            snapshot_in,
            snapshot_out,
        } => {
            let mut request = RouteRequest::new(read_prompt(prompt)?, task);
            request.model = model;
            request.candidates = candidates;
            request.tenant = tenant;
            request.workspace = workspace;
            request.system_prompt = system;
            route(&config, request, snapshot_in, snapshot_out, cli.format).await
        }
    }
}

fn init_tracing(verbose: u8) -> anyhow::Result<()> {
    let level = match verbose {
        0 => "relay_cli=info,relay_core=warn,relay_runtime=warn",
        1 => "relay_cli=debug,relay_core=debug,relay_runtime=debug",
        _ => "trace",
    };
    let filter = match std::env::var("RUST_LOG") {
        Ok(_) => tracing_subscriber::EnvFilter::from_default_env(),
        Err(_) => tracing_subscriber::EnvFilter::try_new(level)?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<GatewayConfig> {
    let config = GatewayConfig::from_path(path)
        .with_context(|| format!("loading config {}", path.display()))?;
    debug!(path = %path.display(), policy = %config.learning.policy, "config loaded");
    Ok(config)
}

fn read_prompt(prompt: Option<String>) -> anyhow::Result<String> {
    match prompt {
        Some(p) => Ok(p),
        None => {
            let text = std::io::read_to_string(std::io::stdin()).context("reading prompt from stdin")?;
            if text.trim().is_empty() {
                bail!("no prompt given (use --prompt or pipe text on stdin)");
            }
            Ok(text)
        }
    }
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn validate(path: &Path, format: OutputFormat) -> anyhow::Result<()> {
    let config = load_config(path)?;
    match format {
        OutputFormat::Json => print_json(&serde_json::json!({
            "valid": true,
            "policy": config.learning.policy,
            "domain": config.routing.domain,
            "default_model": config.routing.default_model,
            "candidates": config.effective_candidates(None),
            "tenants": config.routing.tenants.keys().collect::<Vec<_>>(),
            "experiments": config.experiments.definitions.keys().collect::<Vec<_>>(),
        })),
        OutputFormat::Text => {
            println!("{}: valid", path.display());
            println!("  policy:        {}", config.learning.policy);
            println!("  domain:        {}", config.routing.domain);
            println!("  default model: {}", config.routing.default_model);
            println!("  candidates:    {}", config.effective_candidates(None).join(", "));
            println!("  tenants:       {}", config.routing.tenants.len());
            println!("  experiments:   {}", config.experiments.definitions.len());
            Ok(())
        }
    }
}

#[derive(serde::Serialize)]
struct Estimate {
    model: String,
    tokens_in: u32,
    tokens_out: u32,
    cost: f64,
    affordable: bool,
}

fn estimate_rows(
    config: &GatewayConfig,
    prompt: &str,
    models: Vec<String>,
    tenant: Option<&str>,
    output_tokens: Option<u32>,
) -> Vec<Estimate> {
    let meter = TokenMeter::new(config.effective_prices(tenant));
    let ceiling = config.max_per_request(tenant);
    let tokens_in = TokenMeter::estimate_tokens(prompt);
    let tokens_out = output_tokens.unwrap_or(config.routing.expected_output_tokens);
    let models = if models.is_empty() {
        config.effective_candidates(tenant)
    } else {
        models
    };
    models
        .into_iter()
        .map(|model| {
            let cost = meter.estimate_cost(&model, tokens_in, tokens_out);
            Estimate {
                model,
                tokens_in,
                tokens_out,
                cost,
                affordable: cost <= ceiling,
            }
        })
        .collect()
}

fn estimate(
    path: &Path,
    prompt: Option<String>,
    models: Vec<String>,
    tenant: Option<String>,
    output_tokens: Option<u32>,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let config = load_config(path)?;
    let prompt = read_prompt(prompt)?;
    let rows = estimate_rows(&config, &prompt, models, tenant.as_deref(), output_tokens);
    match format {
        OutputFormat::Json => print_json(&rows),
        OutputFormat::Text => {
            println!("{:<40} {:>8} {:>8} {:>12}", "MODEL", "IN", "OUT", "COST (USD)");
            for row in &rows {
                let flag = if row.affordable { "" } else { "  over per-request limit" };
                println!(
                    "{:<40} {:>8} {:>8} {:>12.6}{}",
                    row.model, row.tokens_in, row.tokens_out, row.cost, flag
                );
            }
            Ok(())
        }
    }
}

fn read_snapshot(path: &Path) -> anyhow::Result<LearningSnapshot> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing snapshot {}", path.display()))
}

fn snapshot_show(path: &Path, format: OutputFormat) -> anyhow::Result<()> {
    let snapshot = read_snapshot(path)?;
    match format {
        OutputFormat::Json => print_json(&snapshot),
        OutputFormat::Text => {
            if snapshot.is_empty() {
                println!("(no domains)");
            }
            for (domain, policy) in &snapshot {
                println!(
                    "{domain}: {} v{} ({} state fields)",
                    policy.policy,
                    policy.version,
                    policy.state.len()
                );
            }
            Ok(())
        }
    }
}

fn snapshot_check(path: &Path, config: &Path, format: OutputFormat) -> anyhow::Result<()> {
    let snapshot = read_snapshot(path)?;
    let config = load_config(config)?;
    let engine = relay_core::LearningEngine::new(config.learning.clone());
    let report = engine.restore(&snapshot);
    match format {
        OutputFormat::Json => print_json(&serde_json::json!({
            "restored": report.restored,
            "skipped": report.skipped,
        })),
        OutputFormat::Text => {
            println!("restored: {}", report.restored.join(", "));
            println!("skipped:  {}", report.skipped.join(", "));
            Ok(())
        }
    }
}

async fn route(
    path: &Path,
    request: RouteRequest,
    snapshot_in: Option<PathBuf>,
    snapshot_out: Option<PathBuf>,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let config = load_config(path)?;
    let gateway = Gateway::builder(config).build().context("building gateway")?;

    if let Some(path) = snapshot_in {
        let report = gateway.restore_learning(&read_snapshot(&path)?);
        info!(restored = ?report.restored, skipped = ?report.skipped, "learning state restored");
    }

    let response = gateway.route(request).await;
    gateway.emit_metrics();

    if let Some(path) = snapshot_out {
        let json = serde_json::to_string_pretty(&gateway.snapshot_learning())?;
        std::fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
    }

    match format {
        OutputFormat::Json => print_json(&response)?,
        OutputFormat::Text => match (&response.response, &response.error) {
            (Some(text), _) => {
                println!("{text}");
                eprintln!(
                    "-- {} ({:?}) tokens={} cost=${:.6}{}",
                    response.model,
                    response.selection,
                    response.tokens.total,
                    response.cost,
                    if response.cached { " cached" } else { "" }
                );
            }
            (None, Some(error)) => eprintln!("error [{}]: {}", error.kind.as_str(), error.message),
            (None, None) => {}
        },
    }

    if !response.is_success() {
        std::process::exit(1);
    }
    Ok(())
}
