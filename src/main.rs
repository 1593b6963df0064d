use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use keyrate::clock::SystemClock;
use keyrate::config::KeyrateConfig;
use keyrate::store::RedisStore;
use keyrate::{KeyRateLimiter, LimiterRegistry};

/// Inspect and administer keyrate limiters in a shared store.
#[derive(Debug, Parser)]
#[command(name = "keyrate", version, about)]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Take one token for a key and print the decision
    Check {
        #[arg(short, long)]
        limiter: String,
        #[arg(short, long)]
        key: String,
    },
    /// Refill a key's bucket to capacity
    Reset {
        #[arg(short, long)]
        limiter: String,
        #[arg(short, long)]
        key: String,
    },
    /// Show a key's bucket without consuming a token
    Inspect {
        #[arg(short, long)]
        limiter: String,
        #[arg(short, long)]
        key: String,
    },
    /// List configured limiters
    Limiters,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json);

    let config = KeyrateConfig::load(cli.config.as_deref())?;
    info!(prefix = %config.store.prefix, limiters = config.limiters.len(), "Configuration loaded");

    if let Command::Limiters = cli.command {
        for limiter in &config.limiters {
            println!("{}\t{} per {}ms", limiter.name, limiter.capacity, limiter.window_ms);
        }
        return Ok(());
    }

    let store = RedisStore::connect(&config.store)
        .await
        .with_context(|| format!("connecting to {}", config.store.url))?;
    let registry = LimiterRegistry::from_definitions(
        Arc::new(store),
        Arc::new(SystemClock),
        &config.lock,
        &config.limiters,
    )?;

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_shutdown(cancel.clone()));

    match cli.command {
        Command::Check { limiter, key } => {
            let limiter = lookup(&registry, &limiter)?;
            let decision = limiter.for_key(&key, &cancel).await?;
            if decision.allowed {
                println!("allowed");
            } else {
                println!(
                    "denied\tretry after {}ms (Retry-After: {})",
                    decision.retry_after.as_millis(),
                    decision.retry_after_secs()
                );
            }
        }
        Command::Reset { limiter, key } => {
            let limiter = lookup(&registry, &limiter)?;
            limiter.reset(&key, &cancel).await?;
            println!("reset {}", limiter.address(&key));
        }
        Command::Inspect { limiter, key } => {
            let limiter = lookup(&registry, &limiter)?;
            let snapshot = limiter.peek(&key, &cancel).await?;
            match snapshot.state {
                Some(state) => println!(
                    "{}\t{:.3}/{} tokens available (stored {:.3} at {})",
                    snapshot.address,
                    snapshot.available,
                    snapshot.capacity,
                    state.tokens,
                    state.last_refill_at.to_rfc3339()
                ),
                None => println!(
                    "{}\tno stored state ({} tokens available)",
                    snapshot.address, snapshot.capacity
                ),
            }
        }
        Command::Limiters => unreachable!("handled before connecting"),
    }

    Ok(())
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn lookup(registry: &LimiterRegistry, name: &str) -> anyhow::Result<Arc<KeyRateLimiter>> {
    registry.get(name).with_context(|| {
        format!(
            "unknown limiter {name:?}; configured: {}",
            registry.names().join(", ")
        )
    })
}

/// Cancel in-flight operations on Ctrl+C or SIGTERM.
async fn cancel_on_shutdown(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, cancelling");
        }
        _ = terminate => {
            info!("Received SIGTERM, cancelling");
        }
    }

    cancel.cancel();
}
