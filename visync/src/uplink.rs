//! Producer side connection to a remote relay.
//!
//! The uplink authenticates with a promotion, waits for the grant, then
//! streams events while folding the viewer echoes the relay hands back into
//! the shared latency estimate. Lost connections are retried with backoff;
//! events produced while disconnected are dropped.

use std::time::Duration;

use anyhow::anyhow;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::{sync::mpsc, task::JoinHandle, time};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use crate::{
    backoff::Backoff,
    event::{now_secs, Echo},
    latency::LatencyEstimate,
    Event, Payload, Result, VisyncError,
};

const GRANT_TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Handle to the background uplink task.
pub struct Uplink {
    event_tx: mpsc::Sender<Event>,
    handle: JoinHandle<()>,
}

impl Uplink {
    pub fn spawn(url: String, secret: String, latency: LatencyEstimate) -> Uplink {
        let (event_tx, event_rx) = mpsc::channel(256);
        let task = UplinkTask {
            url,
            secret,
            latency,
            event_rx,
            backoff: Backoff::default(),
        };
        let handle = tokio::spawn(async move {
            if let Err(e) = task.run().await {
                error!(target: "visync", "uplink task error: {}", e);
            }
        });
        Uplink { event_tx, handle }
    }

    /// Queue an event for the relay. Returns `false` if it was dropped.
    pub fn send(&self, event: &Event) -> bool {
        self.event_tx.try_send(event.clone()).is_ok()
    }

    pub async fn terminate(self) {
        drop(self.event_tx);
        let _ = tokio::join!(self.handle);
    }
}

struct UplinkTask {
    url: String,
    secret: String,
    latency: LatencyEstimate,
    event_rx: mpsc::Receiver<Event>,
    backoff: Backoff,
}

impl UplinkTask {
    async fn run(mut self) -> Result<()> {
        loop {
            match self.session().await {
                Ok(()) => info!("relay {} closed the connection", self.url),
                Err(VisyncError::Terminating) => return Ok(()),
                Err(e) => warn!("relay {}: {}", self.url, e),
            }

            let delay = self.backoff.next_delay();
            info!("reconnecting to {} in {:?}", self.url, delay);
            let sleep = time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    event = self.event_rx.recv() => {
                        if event.is_none() {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    async fn session(&mut self) -> Result<()> {
        let connect = connect(&self.url, &self.secret);
        tokio::pin!(connect);
        let mut ws = loop {
            tokio::select! {
                ws = &mut connect => break ws?,
                event = self.event_rx.recv() => {
                    event.ok_or(VisyncError::Terminating)?;
                }
            }
        };
        info!("promoted to producer on {}", self.url);
        self.backoff.reset();

        loop {
            tokio::select! {
                event = self.event_rx.recv() => {
                    let event = event.ok_or(VisyncError::Terminating)?;
                    ws.send(Message::Text(event.to_json()?)).await?;
                }
                msg = ws.next() => {
                    match msg {
                        None | Some(Ok(Message::Close(_))) => return Ok(()),
                        Some(Ok(Message::Text(text))) => self.handle_echo(&text),
                        Some(Ok(_)) => (),
                        Some(Err(e)) => return Err(e.into()),
                    }
                }
            }
        }
    }

    fn handle_echo(&self, text: &str) {
        match Echo::from_json(text) {
            Some(echo) => {
                self.latency.record_echo(echo.timestamp, now_secs());
            }
            None => debug!("ignoring relay message: {}", text),
        }
    }
}

async fn connect(url: &str, secret: &str) -> Result<WsStream> {
    let (mut ws, _) = connect_async(url).await?;
    ws.send(Message::Text(Event::promotion(secret).to_json()?))
        .await?;
    time::timeout(GRANT_TIMEOUT, await_grant(&mut ws)).await??;
    Ok(ws)
}

async fn await_grant(ws: &mut WsStream) -> Result<()> {
    while let Some(msg) = ws.next().await {
        if let Message::Text(text) = msg? {
            if let Ok(Event {
                payload: Payload::PromotionGrant,
                ..
            }) = Event::from_json(&text)
            {
                return Ok(());
            }
        }
    }
    Err(anyhow!("connection closed before promotion was granted").into())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::net::TcpListener;

    use super::*;
    use crate::relay::Relay;

    async fn start_relay(secret: &str) -> (Arc<Relay>, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let relay = Arc::new(Relay::new(Some(secret.to_string()), LatencyEstimate::new()));
        tokio::spawn(relay.clone().serve(listener));
        (relay, url)
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        time::timeout(Duration::from_secs(5), async {
            while !cond() {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_uplink_streams_and_measures_latency() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (relay, url) = start_relay("hunter2").await;

        let (mut viewer, _) = connect_async(url.as_str()).await.unwrap();
        wait_for(|| relay.viewer_count() == 1).await;

        let latency = LatencyEstimate::new();
        let uplink = Uplink::spawn(url.clone(), "hunter2".to_string(), latency.clone());
        wait_for(|| relay.has_producer()).await;
        // Let the grant reach the uplink before queueing.
        time::sleep(Duration::from_millis(200)).await;

        let event = Event::new(Payload::Beat { channel: 2, on: true }, 0.0);
        assert!(uplink.send(&event));

        let text = loop {
            let msg = time::timeout(Duration::from_secs(5), viewer.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Text(text) = msg {
                break text;
            }
        };
        assert_eq!(Event::from_json(&text).unwrap().payload, event.payload);

        // Pretend the round trip took a second.
        let echo = format!(r#"{{"t": {}}}"#, now_secs() - 1.0);
        viewer.send(Message::Text(echo)).await.unwrap();
        wait_for(|| latency.get() > 0.0).await;
        let measured = latency.get();
        assert!(measured >= 0.5 && measured < 1.0, "latency {}", measured);
        assert_eq!(relay.latency().get(), 0.0);

        time::timeout(Duration::from_secs(5), uplink.terminate())
            .await
            .unwrap();
        wait_for(|| !relay.has_producer()).await;
    }

    #[tokio::test]
    async fn test_uplink_rejected_secret() {
        let (relay, url) = start_relay("hunter2").await;
        let uplink = Uplink::spawn(url, "wrong".to_string(), LatencyEstimate::new());

        // The relay never grants, so the uplink is still waiting.
        time::sleep(Duration::from_millis(100)).await;
        assert!(!relay.has_producer());
        assert_eq!(relay.viewer_count(), 1);

        time::timeout(Duration::from_secs(1), uplink.terminate())
            .await
            .unwrap();
    }
}
