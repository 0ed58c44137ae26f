use anyhow::anyhow;
use log::error;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};

mod backoff;
pub mod config;
pub mod dispatch;
pub mod event;
pub mod latency;
pub mod midi;
pub mod relay;
pub mod tempo;
mod tasks;
pub mod uplink;

use dispatch::Dispatcher;
use tasks::{fake::FakeTask, serial::SerialTask};
use tempo::TempoTracker;

pub use config::{load_secret, AdapterConfig, InputSource};
pub use event::{Echo, Event, Payload};
pub use latency::LatencyEstimate;
pub use relay::Relay;
pub use uplink::Uplink;

#[derive(Error, Debug)]
pub enum VisyncError {
    #[error("terminating")]
    Terminating,

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Decode(#[from] midi::DecodeError),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Serial(#[from] tokio_serial::Error),

    #[error(transparent)]
    Timeout(#[from] tokio::time::error::Elapsed),
}

pub type Result<T> = std::result::Result<T, VisyncError>;

/// Running MIDI input. Yields events in the order the input produced them.
pub struct Adapter {
    child_tasks: Vec<JoinHandle<()>>,
    event_rx: mpsc::Receiver<Event>,
}

impl Adapter {
    pub async fn start(config: AdapterConfig, latency: LatencyEstimate) -> Result<Adapter> {
        let (event_tx, event_rx) = mpsc::channel(256);

        let handle = match config.input {
            InputSource::Fake { bpm } => {
                let fake = FakeTask::new(bpm, latency, event_tx);
                tokio::spawn(async move {
                    if let Err(e) = fake.run().await {
                        error!(target: "visync", "fake input task error: {}", e);
                    }
                })
            }
            source => {
                let dispatcher =
                    Dispatcher::new(TempoTracker::new(config.tracker), &config.policy, latency);
                let serial = SerialTask::new(source, dispatcher, event_tx);
                tokio::spawn(async move {
                    if let Err(e) = serial.run().await {
                        error!(target: "visync", "midi input task error: {}", e);
                    }
                })
            }
        };

        Ok(Adapter {
            child_tasks: vec![handle],
            event_rx,
        })
    }

    pub async fn next(&mut self) -> Result<Event> {
        self.event_rx
            .recv()
            .await
            .ok_or_else(|| anyhow!("midi input task has terminated").into())
    }

    pub async fn terminate(self) {
        // Dropping the receiver tells the input task to stop.
        drop(self.event_rx);
        for t in self.child_tasks {
            let _ = tokio::join!(t);
        }
    }
}
