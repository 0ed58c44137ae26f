use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{anyhow, Result};
use log::{error, info, trace, warn};
use structopt::StructOpt;
use tokio::{net::TcpListener, task::JoinHandle};
use visync::{
    load_secret, Adapter, AdapterConfig, InputSource, LatencyEstimate, Relay, Uplink,
};

#[derive(StructOpt)]
#[structopt(about = "midi to visualizer sync utility")]
enum Opt {
    /// Fan events from one producer out to websocket viewers.
    Relay {
        #[structopt(long, default_value = "0.0.0.0:8765")]
        listen: SocketAddr,
        /// File holding the shared secret a producer must present.
        #[structopt(long, parse(from_os_str))]
        secret_file: Option<PathBuf>,
    },
    /// Read MIDI and publish events.
    Adapter {
        /// Serial port carrying raw MIDI.
        #[structopt(long)]
        device: Option<String>,
        #[structopt(long)]
        baud: Option<u32>,
        /// Raw MIDI device node.
        #[structopt(long, parse(from_os_str))]
        raw: Option<PathBuf>,
        /// Generate a fake clock at this tempo.
        #[structopt(long)]
        fake: Option<f64>,
        /// Serve viewers directly on this address.
        #[structopt(long)]
        listen: Option<SocketAddr>,
        /// Publish to a remote relay, e.g. ws://relay.local:8765
        #[structopt(long)]
        relay: Option<String>,
        #[structopt(long, parse(from_os_str))]
        secret_file: Option<PathBuf>,
        /// Treat notes on channel 16 as clock pulses.
        #[structopt(long)]
        note_syncs: bool,
    },
}

async fn bind(listen: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(listen)
        .await
        .map_err(|e| anyhow!("can't listen on {}: {}", listen, e))
}

fn spawn_server(relay: Arc<Relay>, listener: TcpListener) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = relay.serve(listener).await {
            error!("relay server error: {}", e);
        }
    })
}

/// Resolves when the server task ends; never resolves without a server.
async fn server_exit(server: &mut Option<JoinHandle<()>>) {
    match server {
        Some(handle) => {
            let _ = handle.await;
        }
        None => std::future::pending().await,
    }
}

struct AdapterTask {
    adapter: Adapter,
    relay: Option<Arc<Relay>>,
    server: Option<JoinHandle<()>>,
    uplink: Option<Uplink>,
}

impl AdapterTask {
    async fn start(
        config: AdapterConfig,
        listen: Option<SocketAddr>,
        uplink: Option<(String, String)>,
    ) -> Result<()> {
        let latency = LatencyEstimate::new();

        let (relay, server) = match listen {
            Some(listen) => {
                let listener = bind(listen).await?;
                let relay = Arc::new(Relay::new(None, latency.clone()));
                let server = spawn_server(relay.clone(), listener);
                (Some(relay), Some(server))
            }
            None => (None, None),
        };
        let uplink = uplink.map(|(url, secret)| Uplink::spawn(url, secret, latency.clone()));
        let adapter = Adapter::start(config, latency).await?;

        let task = AdapterTask {
            adapter,
            relay,
            server,
            uplink,
        };
        info!("adapter running");

        task.run().await
    }

    async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    break;
                }
                _ = server_exit(&mut self.server) => {
                    self.adapter.terminate().await;
                    return Err(anyhow!("relay server stopped"));
                }
                res = self.adapter.next() => {
                    let event = res?;
                    trace!("event: {:?}", event);
                    if let Some(relay) = &self.relay {
                        relay.publish(&event)?;
                    }
                    if let Some(uplink) = &self.uplink {
                        if !uplink.send(&event) {
                            warn!("uplink backed up, dropping {}", event.payload);
                        }
                    }
                }
            }
        }
        info!("terminating");
        self.adapter.terminate().await;
        if let Some(uplink) = self.uplink {
            uplink.terminate().await;
        }

        Ok(())
    }
}

async fn relay(listen: SocketAddr, secret_file: Option<PathBuf>) -> Result<()> {
    let secret = secret_file.map(load_secret).transpose()?;
    if secret.is_none() {
        warn!("no secret file given, no producer will be accepted");
    }
    let listener = bind(listen).await?;
    let relay = Arc::new(Relay::new(secret, LatencyEstimate::new()));
    let server = spawn_server(relay, listener);

    tokio::select! {
        res = tokio::signal::ctrl_c() => res?,
        _ = server => return Err(anyhow!("relay server stopped")),
    }
    info!("terminating");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let opt = Opt::from_args();

    match opt {
        Opt::Relay {
            listen,
            secret_file,
        } => relay(listen, secret_file).await,
        Opt::Adapter {
            device,
            baud,
            raw,
            fake,
            listen,
            relay,
            secret_file,
            note_syncs,
        } => {
            let mut config = AdapterConfig::new(InputSource::from_options(device, baud, raw, fake)?);
            config.policy.use_note_syncs = note_syncs;

            if listen.is_none() && relay.is_none() {
                return Err(anyhow!("adapter needs --listen or --relay"));
            }
            let uplink = match relay {
                Some(url) => {
                    let secret_file = secret_file
                        .ok_or_else(|| anyhow!("--relay requires --secret-file"))?;
                    Some((url, load_secret(secret_file)?))
                }
                None => None,
            };

            AdapterTask::start(config, listen, uplink).await
        }
    }
}
