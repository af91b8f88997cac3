use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use core_framing::Message;
use core_mesh::{MeshContext, UdpMesh};
use mesh_proxy::{MeshUpstream, ProxyConfig, ProxyListener};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_appender::rolling;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("MESH_PROXY_CONFIG").map(PathBuf::from));
    let cfg = ProxyConfig::load(config_path.as_deref()).context("load config")?;

    let _guard = init_logging(&cfg)?;
    info!(port = cfg.listen_port, gid = cfg.local_gid, "config loaded");

    let (radio, inbound) = UdpMesh::bind(cfg.local_gid, cfg.radio.bind, cfg.radio.bridge)
        .await
        .with_context(|| format!("bind radio link {}", cfg.radio.bind))?;
    let ctx = MeshContext::new(cfg.mesh.clone(), Arc::new(radio));

    let (others_tx, mut others_rx) = mpsc::unbounded_channel();
    ctx.spawn_dispatcher(inbound, Some(others_tx));
    tokio::spawn(async move {
        while let Some(message) = others_rx.recv().await {
            match message {
                Message::Text(t) => info!(from = t.sender_gid, text = %t.text, "text message"),
                Message::Sms(s) => {
                    info!(from = s.sender_gid, phone = %s.phone_number, text = %s.text, "sms")
                }
                Message::TxSegment(s) => info!(index = s.index, "transaction segment ignored"),
                Message::StreamChunk(_) => {}
            }
        }
    });

    let addr = cfg.listen_addr();
    let listener = ProxyListener::bind(addr, cfg.max_connections, cfg.relay_config())
        .await
        .with_context(|| format!("bind {}", addr))?;
    info!(%addr, max_connections = ?cfg.max_connections, "starting SOCKS server");

    let make_upstream = {
        let ctx = ctx.clone();
        move || MeshUpstream::new(&ctx)
    };
    let shutdown = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown signal received"),
            Err(e) => warn!(error = %e, "cannot listen for ctrl-c; stopping"),
        }
    };
    listener
        .serve(make_upstream, shutdown)
        .await
        .context("proxy listener")?;

    info!("mesh-proxy stopped");
    Ok(())
}

fn init_logging(cfg: &ProxyConfig) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match &cfg.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
            // Rotating file logger (daily)
            let file_appender = rolling::daily(dir, "mesh-proxy.log");
            let (nb_writer, guard) = tracing_appender::non_blocking(file_appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_writer(nb_writer)
                .compact()
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .compact()
                .init();
            Ok(None)
        }
    }
}
