use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tw_engine::{router, Engine};
use tw_types::{EngineConfig, SystemClock, LISTEN_ADDR_ENV};

/// Real-time portfolio risk monitor.
#[derive(Parser, Debug)]
#[command(name = "tripwire", version)]
struct Args {
    /// Start-up configuration document (JSON)
    #[arg(short, long)]
    config: PathBuf,

    /// Control-plane listen address; overrides TRIPWIRE_ADDR and the config
    #[arg(short, long)]
    listen: Option<String>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let code = match run(args) {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{:#}", e), "fatal runtime error");
            3
        }
    };
    ExitCode::from(code)
}

fn run(args: Args) -> anyhow::Result<u8> {
    let config = match EngineConfig::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration rejected");
            return Ok(1);
        }
    };
    let listen = args
        .listen
        .or_else(|| std::env::var(LISTEN_ADDR_ENV).ok())
        .unwrap_or_else(|| config.listen_addr.clone());

    let engine = match Engine::start(config, Arc::new(SystemClock)) {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            error!(error = %e, "engine did not start");
            return Ok(e.exit_code() as u8);
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building the control-plane runtime")?;
    runtime.block_on(serve(engine.clone(), &listen))?;
    drop(runtime);

    Ok(engine.shutdown() as u8)
}

async fn serve(engine: Arc<Engine>, listen: &str) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding {}", listen))?;
    info!(addr = %listen, "control plane listening");

    let fatal = engine.fatal_signal();
    axum::serve(listener, router(engine))
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("interrupt received"),
                _ = fatal.notified() => error!("safe mode entered; shutting down"),
            }
        })
        .await
        .context("control plane server")?;
    Ok(())
}
