use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod conn;
mod metrics;
mod policy;
mod server;
mod session;
mod verify;

use config::Config;
use metrics::Metrics;
use policy::{RuleEngine, SharedRules};
use server::ProxyServer;
use session::SessionOptions;
use verify::ChainVerifier;

#[derive(Parser)]
#[command(name = "l7proxify")]
#[command(author = "l7proxify developers")]
#[command(version)]
#[command(about = "Transparent TLS proxy that routes on the SNI host name", long_about = None)]
struct Cli {
    /// Configuration file (searched for in standard locations if omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides the configuration file
    #[arg(short, long)]
    listen: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Log as JSON lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let path = match cli.config {
        Some(path) => path,
        None => Config::find_config().context(
            "No configuration file found (tried ./config/l7proxify.yml, ./l7proxify.yml, \
             ~/.l7proxify/config.yml, /etc/l7proxify/config.yml)",
        )?,
    };
    let mut config = Config::load(&path)?;
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }

    init_tracing(cli.debug || config.debug, cli.json || config.logging.json);
    info!("l7proxify {} using {}", env!("CARGO_PKG_VERSION"), path.display());

    let engine = config.take_rule_engine();
    if engine.is_empty() {
        warn!("No rules configured, every connection will be rejected");
    }
    info!("Loaded {} rules", engine.len());
    let rules = SharedRules::new(engine);

    let verifier = if config.verify_certificates {
        Some(ChainVerifier::with_webpki_roots().context("Failed to build certificate verifier")?)
    } else {
        warn!("Backend certificate verification disabled");
        None
    };

    let options = SessionOptions {
        limits: config.limits(),
        verifier,
        handshake_timeout: config.handshake_timeout(),
        ..Default::default()
    };

    let metrics = Metrics::new();
    if let Some(addr) = config.metrics_listen {
        tokio::spawn(metrics::serve(addr, metrics.clone()));
    }

    #[cfg(unix)]
    tokio::spawn(reload_on_hangup(path.clone(), rules.clone()));

    let server = ProxyServer::bind(&config.listen, rules, options, metrics)
        .await
        .with_context(|| format!("Failed to listen on {}", config.listen))?;

    server
        .serve_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to wait for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    Ok(())
}

fn init_tracing(debug: bool, json: bool) {
    let default = if debug {
        "l7proxify=debug,l7proxify_shared=debug"
    } else {
        "l7proxify=info,l7proxify_shared=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Re-read the rules on SIGHUP. A bad file keeps the current ruleset.
#[cfg(unix)]
async fn reload_on_hangup(path: PathBuf, rules: SharedRules) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            warn!("Cannot install SIGHUP handler, rule reload disabled: {}", e);
            return;
        }
    };

    while hangup.recv().await.is_some() {
        match load_rules(&path) {
            Ok(engine) => {
                let n = rules.replace(engine).await;
                info!("Reloaded {} rules from {}", n, path.display());
            }
            Err(e) => error!("Rule reload failed, keeping previous rules: {:#}", e),
        }
    }
}

#[cfg(unix)]
fn load_rules(path: &std::path::Path) -> Result<RuleEngine> {
    Ok(Config::load(path)?.take_rule_engine())
}
