//! # Resilience Configuration Validator
//!
//! Command-line tool for validating resilience configuration across
//! environments. Loads the same layers the runtime bootstrap loads and prints
//! the effective circuit and job policies.

use anyhow::{Context, Result};
use campus_core::config::ConfigManager;
use campus_core::jobs::JobType;
use campus_core::policy::PolicyRegistry;
use campus_core::resilience::Feature;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "config-validator")]
#[command(about = "Validate campus resilience configuration files")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Environment overlay to apply (development, test, production, ...)
    #[arg(short, long, default_value = "development")]
    environment: String,

    /// Configuration directory path (default: $CAMPUS_CONFIG_DIR or ./config)
    #[arg(short, long)]
    config_dir: Option<PathBuf>,

    /// Verbose output level (use multiple times for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load and validate the configuration
    Validate,

    /// Print the effective circuit and job policies
    Policies,

    /// Compare effective policies between two environments
    Compare {
        /// Base environment for comparison
        #[arg(short, long, default_value = "development")]
        base: String,

        /// Target environment for comparison
        #[arg(short, long)]
        target: String,
    },
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let _subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .try_init();

    let result = match &cli.command {
        Some(Commands::Validate) | None => validate(&cli),
        Some(Commands::Policies) => show_policies(&cli),
        Some(Commands::Compare { base, target }) => compare(&cli, base, target),
    };

    match result {
        Ok(()) => {
            info!("Configuration validation completed successfully");
            process::exit(0);
        }
        Err(e) => {
            error!("Configuration validation failed: {e:#}");
            eprintln!("❌ {e:#}");
            process::exit(1);
        }
    }
}

fn load(cli: &Cli, environment: &str) -> Result<Arc<ConfigManager>> {
    ConfigManager::load_from_directory_with_env(cli.config_dir.clone(), environment)
        .with_context(|| format!("failed to load configuration for environment '{environment}'"))
}

fn validate(cli: &Cli) -> Result<()> {
    let manager = load(cli, &cli.environment)?;

    if cli.format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&manager.debug_config())?);
        return Ok(());
    }

    let config = manager.config();
    println!("🔧 Validating Campus Resilience Configuration");
    println!("Environment: {}", manager.environment());
    println!("Config Directory: {}", manager.config_directory().display());
    println!();
    println!("✅ Configuration loaded and validated");
    println!(
        "   circuit breakers: {}",
        if config.circuit_breakers.enabled { "enabled" } else { "disabled" }
    );
    println!(
        "   broker: {} (queue capacity {}, {} workers)",
        if config.dispatcher.broker_enabled { "enabled" } else { "disabled" },
        config.dispatcher.queue_capacity,
        config.dispatcher.worker_concurrency
    );
    println!(
        "   ledger: {}",
        if config.database.url.is_some() { "postgres" } else { "in-memory" }
    );
    println!(
        "   unclassified job errors: {:?}",
        config.runner.unclassified_errors
    );

    let critical = manager.policies().critical_features();
    if !critical.is_empty() {
        let names: Vec<&str> = critical.iter().map(Feature::as_str).collect();
        println!("   critical features: {}", names.join(", "));
    }
    Ok(())
}

fn show_policies(cli: &Cli) -> Result<()> {
    let manager = load(cli, &cli.environment)?;
    let policies = manager.policies();

    if cli.format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&policies_json(policies))?);
        return Ok(());
    }

    println!("Circuit policies ({}):", manager.environment());
    println!(
        "  {:<18} {:>9} {:>8} {:>8} {:>9} {:>8}",
        "FEATURE", "THRESHOLD", "WINDOW", "OPEN", "HALF-OPEN", "CRITICAL"
    );
    for feature in Feature::ALL {
        let policy = policies.feature_policy(feature);
        println!(
            "  {:<18} {:>9} {:>7}s {:>7}s {:>9} {:>8}",
            feature.as_str(),
            policy.failure_threshold,
            policy.window_seconds,
            policy.open_duration_seconds,
            policy.half_open_max_calls,
            policy.is_critical
        );
    }

    println!();
    println!("Job policies:");
    println!(
        "  {:<20} {:>8} {:>8} {:>8}  {}",
        "JOB TYPE", "TIMEOUT", "RETRIES", "DELAY", "AUDIT ACTION"
    );
    for job_type in JobType::ALL {
        let policy = policies.job_policy(job_type);
        println!(
            "  {:<20} {:>7}s {:>8} {:>7}s  {}",
            job_type.identifier(),
            policy.timeout_seconds,
            policy.max_retries,
            policy.retry_delay_seconds,
            policy.audit_action
        );
    }
    Ok(())
}

fn compare(cli: &Cli, base: &str, target: &str) -> Result<()> {
    let base_policies = policies_json(load(cli, base)?.policies());
    let target_policies = policies_json(load(cli, target)?.policies());

    println!("Comparing {base} → {target}");
    let mut differences = 0;
    for section in ["features", "jobs"] {
        let (Some(left), Some(right)) = (
            base_policies[section].as_object(),
            target_policies[section].as_object(),
        ) else {
            continue;
        };
        for (name, value) in left {
            if right.get(name) != Some(value) {
                differences += 1;
                println!("  {section}.{name}:");
                println!("    {base}: {value}");
                println!(
                    "    {target}: {}",
                    right.get(name).cloned().unwrap_or_default()
                );
            }
        }
    }

    if differences == 0 {
        println!("  no policy differences");
    }
    Ok(())
}

fn policies_json(policies: &PolicyRegistry) -> serde_json::Value {
    let features: serde_json::Map<String, serde_json::Value> = Feature::ALL
        .iter()
        .map(|feature| {
            (
                feature.as_str().to_string(),
                serde_json::to_value(policies.feature_policy(*feature)).unwrap_or_default(),
            )
        })
        .collect();
    let jobs: serde_json::Map<String, serde_json::Value> = JobType::ALL
        .iter()
        .map(|job_type| {
            (
                job_type.identifier().to_string(),
                serde_json::to_value(policies.job_policy(*job_type)).unwrap_or_default(),
            )
        })
        .collect();
    serde_json::json!({ "features": features, "jobs": jobs })
}
