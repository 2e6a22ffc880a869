// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

use clap::Parser;
use std::net::SocketAddr;
use tokio::signal;

use mitm_proxy::{ca::RootCredential, config, proxy};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "mitm-proxy")]
struct Args {
    /// Listen address, e.g. 127.0.0.1:8081. Overrides config and environment.
    #[arg(long)]
    listen: Option<String>,

    /// Optional config TOML path
    #[arg(long)]
    config: Option<String>,

    /// Write a new root CA to the configured paths and exit
    #[arg(long)]
    generate_ca: bool,
}

// defaults, then the TOML file, then environment, then --listen
async fn resolve_config(args: &Args) -> anyhow::Result<config::Config> {
    let mut cfg = match args.config {
        Some(ref p) => config::Config::load_from_path(p).await?,
        None => config::Config::default(),
    };
    cfg.apply_process_env()?;
    if let Some(ref listen) = args.listen {
        let addr: SocketAddr = listen.parse()?;
        cfg.server.host = addr.ip().to_string();
        cfg.server.port = addr.port();
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mitm_proxy=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let cfg = resolve_config(&args).await?;

    if args.generate_ca {
        RootCredential::generate_and_save(&cfg.tls.ca_cert_path, &cfg.tls.ca_key_path).await?;
        info!(cert = ?cfg.tls.ca_cert_path, key = ?cfg.tls.ca_key_path, "root CA written");
        return Ok(());
    }

    let server = proxy::run_proxy(cfg);

    tokio::select! {
        res = server => {
            if let Err(e) = res {
                error!(%e, "server error");
                return Err(e);
            }
        }
        _ = signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    Ok(())
}
