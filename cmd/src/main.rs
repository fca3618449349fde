//! tapmesh mesh node daemon.
//!
//! Owns process setup and wiring: configuration, logging, the SQLite
//! handle, TLS material, the TAP device and its pump tasks, the TLS
//! listener, and the mesh controller. All mesh behaviour lives in the
//! library crates; anything that fails in here before the controller runs
//! is an initialization error and exits with code 1.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tapmesh_session::{
    accept_tls, listen_tcp, local_mac_from_cert_pem, make_client_config, make_server_config,
    Connector, ControllerConfig, MeshController, MeshEvent,
};
use tapmesh_tap::TapDevice;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::{Args, NodeConfig};

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let args = Args::parse();

    let env_filter = EnvFilter::new(format!(
        "warn,tapmesh={level},tapmesh_session={level},tapmesh_wire={level},tapmesh_routing={level},tapmesh_tap={level},tapmesh_cmd={level}",
        level = args.log_level
    ));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    if let Err(e) = run(args).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    info!("Starting tapmesh v{}", env!("CARGO_PKG_VERSION"));

    let config = NodeConfig::from_args(&args);

    // The database is held open for the life of the process; the mesh core
    // neither reads nor writes it yet.
    let _db = rusqlite::Connection::open(&config.db_path)
        .with_context(|| format!("Could not open database {:?}", config.db_path))?;

    let key_pem = tokio::fs::read_to_string(&config.key_path)
        .await
        .with_context(|| format!("Could not open key file {:?}", config.key_path))?;
    let cert_pem = tokio::fs::read_to_string(&config.cert_path)
        .await
        .with_context(|| format!("Could not open cert file {:?}", config.cert_path))?;
    let ca_pem = tokio::fs::read_to_string(&config.ca_path)
        .await
        .with_context(|| format!("Could not open CA file {:?}", config.ca_path))?;

    let server_config = make_server_config(&cert_pem, &key_pem, &ca_pem)
        .context("Failed to build TLS server configuration")?;
    let acceptor = TlsAcceptor::from(Arc::new(server_config));

    let local_mac = local_mac_from_cert_pem(&cert_pem)
        .context("Failed to derive node identity from certificate")?;
    info!("Node identity: {}", local_mac);

    let connector = match config.seed {
        Some(seed) => {
            let client_config = make_client_config(&cert_pem, &key_pem, &ca_pem, seed.mac)
                .context("Failed to build TLS client configuration")?;
            Some(Connector {
                seed,
                tls: Arc::new(client_config),
            })
        }
        None => None,
    };

    let listen_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
    let listener = listen_tcp(listen_addr)
        .await
        .with_context(|| format!("Failed to listen on {}", listen_addr))?;
    info!("Listening on {}", listen_addr);

    let tap = TapDevice::open(&config.ifname).context("Failed to open TAP device")?;
    tap.set_mac(local_mac)
        .context("Failed to set TAP hardware address")?;
    info!("Got interface: {}", tap.name());
    let tap = Arc::new(tap);

    let (tap_in_tx, tap_in_rx) = mpsc::channel(256);
    let (tap_out_tx, mut tap_out_rx) = mpsc::channel(256);

    let mut controller_config = ControllerConfig::new(local_mac);
    controller_config.announce_interval = config.announce_interval;
    controller_config.reconnect_interval = config.reconnect_interval;

    let (controller, events_tx) =
        MeshController::new(controller_config, tap_in_rx, tap_out_tx, connector);

    // TAP to mesh
    {
        let tap = tap.clone();
        tokio::spawn(async move {
            loop {
                match tap.recv().await {
                    Ok(frame) => {
                        if tap_in_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("TAP read failed: {}", e);
                        break;
                    }
                }
            }
        });
    }

    // Mesh to TAP
    {
        let tap = tap.clone();
        tokio::spawn(async move {
            while let Some(frame) = tap_out_rx.recv().await {
                if let Err(e) = tap.send(&frame).await {
                    warn!("TAP write failed: {}", e);
                }
            }
        });
    }

    // Accept loop: every completed handshake becomes a LinkReady event
    {
        let events = events_tx.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((tcp_stream, peer_addr)) => {
                        let acceptor = acceptor.clone();
                        let events = events.clone();
                        tokio::spawn(async move {
                            match accept_tls(&acceptor, tcp_stream).await {
                                Ok((stream, mac)) => {
                                    let _ = events.send(MeshEvent::LinkReady { mac, stream }).await;
                                }
                                Err(e) => {
                                    info!("Handshake with {} failed: {:#}", peer_addr, e);
                                }
                            }
                        });
                    }
                    Err(e) => {
                        warn!("Accept error: {}; stopping listener", e);
                        break;
                    }
                }
            }
        });
    }

    tokio::select! {
        result = controller.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received interrupt, shutting down");
            Ok(())
        }
    }
}
