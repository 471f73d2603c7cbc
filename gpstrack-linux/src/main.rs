// GPS tracker ingest daemon: one TCP listener per configured hardware family.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use gpstrack_core::ProtocolKind;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gpstrack_linux::config::{self, Config, Overrides};
use gpstrack_linux::listener;
use gpstrack_linux::registry::MemoryRegistry;
use gpstrack_linux::relay::RelayClient;
use gpstrack_linux::session::SessionSettings;
use gpstrack_linux::store::TrackStore;

#[derive(Parser, Debug)]
#[command(name = "gpstrack-linux", version, about = "GPS tracker ingest daemon")]
struct Cli {
    /// Config file (default ~/.config/gpstrack/config.toml, then /etc/gpstrack/config.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Address every listener binds to
    #[arg(long, value_name = "IP")]
    bind: Option<IpAddr>,

    /// Teltonika Codec8 listen port
    #[arg(long, value_name = "PORT")]
    codec8_port: Option<u16>,

    /// Concox GT06 listen port
    #[arg(long, value_name = "PORT")]
    gt06_port: Option<u16>,

    /// H02 listen port
    #[arg(long, value_name = "PORT")]
    h02_port: Option<u16>,

    /// MicTrack listen port
    #[arg(long, value_name = "PORT")]
    mictrack_port: Option<u16>,

    /// Queclink listen port
    #[arg(long, value_name = "PORT")]
    queclink_port: Option<u16>,

    /// Xexun listen port
    #[arg(long, value_name = "PORT")]
    xexun_port: Option<u16>,

    /// Xexun2 listen port
    #[arg(long, value_name = "PORT")]
    xexun2_port: Option<u16>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        let ports = [
            (ProtocolKind::Codec8, self.codec8_port),
            (ProtocolKind::Gt06, self.gt06_port),
            (ProtocolKind::H02, self.h02_port),
            (ProtocolKind::MicTrack, self.mictrack_port),
            (ProtocolKind::Queclink, self.queclink_port),
            (ProtocolKind::Xexun, self.xexun_port),
            (ProtocolKind::Xexun2, self.xexun2_port),
        ];
        Overrides {
            bind: self.bind,
            ports: ports
                .into_iter()
                .filter_map(|(kind, port)| Some((kind, port?)))
                .collect(),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut cfg = config::load(cli.config.as_deref())?;
    cfg.apply_overrides(&cli.overrides());

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_level)),
        )
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

async fn run(cfg: Config) -> anyhow::Result<()> {
    let registry = Arc::new(match &cfg.state_file {
        Some(path) => MemoryRegistry::load_from(path)
            .with_context(|| format!("loading registry from {}", path.display()))?,
        None => MemoryRegistry::new(),
    });
    info!(devices = registry.len(), "registry ready");

    let mut store = TrackStore::new(registry.clone(), cfg.max_append_retries);
    if let Some(addr) = &cfg.relay_addr {
        info!(addr = %addr, "relaying live positions");
        store = store.with_relay(Arc::new(RelayClient::new(addr.clone())));
    }
    let store = Arc::new(store);

    let plans = cfg.listener_plans();
    if plans.is_empty() {
        warn!("no listener has a port configured");
    }
    let mut tasks = Vec::with_capacity(plans.len());
    for plan in plans {
        let addr = SocketAddr::new(cfg.bind, plan.port);
        let socket = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding {} listener on {}", plan.kind, addr))?;
        info!(protocol = %plan.kind, addr = %addr, "listening");
        let settings = Arc::new(SessionSettings {
            kind: plan.kind,
            id_prefix: plan.id_prefix,
            idle_timeout: cfg.idle_timeout(),
        });
        tasks.push(tokio::spawn(listener::run(socket, settings, store.clone())));
    }

    shutdown_signal().await?;
    info!("shutting down");
    for task in &tasks {
        task.abort();
    }
    if let Some(path) = &cfg.state_file {
        registry
            .persist_to(path)
            .with_context(|| format!("saving registry to {}", path.display()))?;
        info!(devices = registry.len(), path = %path.display(), "registry saved");
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
