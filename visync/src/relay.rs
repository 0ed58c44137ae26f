//! Websocket fan-out from one authenticated producer to many viewers.
//!
//! Every connection starts out as a viewer candidate. Its first message may
//! be a `Promotion` carrying the shared secret, in which case it becomes the
//! producer, provided no other producer is registered. Everything else the
//! producer sends is forwarded verbatim to all viewers. Viewer messages are
//! only ever latency echoes: they go to the producer when one is connected,
//! and otherwise feed the relay's own latency estimate.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time,
};
use tokio_tungstenite::{accept_async, tungstenite::Message};

use crate::{
    event::{now_secs, Echo, Event, Payload},
    latency::LatencyEstimate,
    Result,
};

pub type ConnId = u64;

const ACCEPT_RETRY: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    /// Connected, first message not seen yet. Receives broadcasts.
    Candidate,
    Viewer,
    Producer,
}

struct Viewer {
    tx: mpsc::UnboundedSender<String>,
    candidate: bool,
}

#[derive(Default)]
struct Registry {
    viewers: HashMap<ConnId, Viewer>,
    producer: Option<(ConnId, mpsc::UnboundedSender<String>)>,
}

impl Registry {
    fn is_producer(&self, id: ConnId) -> bool {
        matches!(self.producer, Some((producer, _)) if producer == id)
    }

    fn broadcast(&self, text: &str) -> usize {
        let mut sent = 0;
        for viewer in self.viewers.values() {
            // A failed send means the connection is being torn down; its
            // registration goes away with it.
            if viewer.tx.send(text.to_string()).is_ok() {
                sent += 1;
            }
        }
        sent
    }
}

pub struct Relay {
    registry: Mutex<Registry>,
    secret: Option<String>,
    latency: LatencyEstimate,
    next_id: AtomicU64,
}

/// Deregisters a connection however its handler exits.
struct Registration {
    relay: Arc<Relay>,
    id: ConnId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.relay.disconnect(self.id);
    }
}

impl Relay {
    /// With no `secret` no connection can ever become the producer.
    pub fn new(secret: Option<String>, latency: LatencyEstimate) -> Relay {
        Relay {
            registry: Mutex::new(Registry::default()),
            secret,
            latency,
            next_id: AtomicU64::new(1),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn latency(&self) -> &LatencyEstimate {
        &self.latency
    }

    pub fn viewer_count(&self) -> usize {
        self.registry().viewers.len()
    }

    pub fn has_producer(&self) -> bool {
        self.registry().producer.is_some()
    }

    pub fn role(&self, id: ConnId) -> Option<Role> {
        let registry = self.registry();
        if registry.is_producer(id) {
            return Some(Role::Producer);
        }
        registry.viewers.get(&id).map(|v| {
            if v.candidate {
                Role::Candidate
            } else {
                Role::Viewer
            }
        })
    }

    /// Register a new connection. Messages for it arrive on the returned
    /// receiver in the order they were sent.
    pub fn connect(&self) -> (ConnId, mpsc::UnboundedReceiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = self.registry();
        registry.viewers.insert(id, Viewer { tx, candidate: true });
        debug!("connection {} registered, {} viewers", id, registry.viewers.len());
        (id, rx)
    }

    /// Remove a connection. Removing an unknown connection does nothing.
    pub fn disconnect(&self, id: ConnId) {
        let mut registry = self.registry();
        if registry.is_producer(id) {
            registry.producer = None;
            info!("producer {} disconnected", id);
        } else if registry.viewers.remove(&id).is_some() {
            debug!("viewer {} disconnected, {} left", id, registry.viewers.len());
        }
    }

    /// Broadcast a locally produced event to every viewer.
    pub fn publish(&self, event: &Event) -> Result<usize> {
        let text = event.to_json()?;
        Ok(self.registry().broadcast(&text))
    }

    /// Handle one text message from connection `id`. Returns the
    /// connection's role afterwards, or `None` if it isn't registered.
    pub fn receive(&self, id: ConnId, text: &str) -> Option<Role> {
        let mut registry = self.registry();

        if registry.is_producer(id) {
            if let Ok(event) = Event::from_json(text) {
                if event.is_promotion() {
                    warn!("producer {} resent its promotion, not broadcasting it", id);
                    return Some(Role::Producer);
                }
            }
            let sent = registry.broadcast(text);
            debug!("producer message to {} viewers", sent);
            return Some(Role::Producer);
        }

        let first = {
            let viewer = registry.viewers.get_mut(&id)?;
            std::mem::replace(&mut viewer.candidate, false)
        };

        if let Ok(Event {
            payload: Payload::Promotion { secret },
            ..
        }) = Event::from_json(text)
        {
            if first {
                return Some(self.promote(&mut registry, id, &secret));
            }
            warn!("ignoring late promotion attempt from {}", id);
            return Some(Role::Viewer);
        }

        if let Some((_, producer)) = &registry.producer {
            let _ = producer.send(text.to_string());
        } else if let Some(echo) = Echo::from_json(text) {
            self.latency.record_echo(echo.timestamp, now_secs());
        } else {
            debug!("dropping message from viewer {}", id);
        }
        Some(Role::Viewer)
    }

    fn promote(&self, registry: &mut Registry, id: ConnId, secret: &str) -> Role {
        if self.secret.as_deref() != Some(secret) {
            warn!("rejected promotion from {}: bad secret", id);
            return Role::Viewer;
        }
        if let Some((producer, _)) = &registry.producer {
            warn!(
                "rejected promotion from {}: {} is already the producer",
                id, producer
            );
            return Role::Viewer;
        }

        let viewer = match registry.viewers.remove(&id) {
            Some(viewer) => viewer,
            None => return Role::Viewer,
        };
        if let Ok(grant) = Event::new(Payload::PromotionGrant, 0.0).to_json() {
            let _ = viewer.tx.send(grant);
        }
        registry.producer = Some((id, viewer.tx));
        info!("connection {} promoted to producer", id);
        Role::Producer
    }

    /// Accept websocket connections forever. A failed accept only costs
    /// that one connection.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("relay listening on {}", listener.local_addr()?);
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    time::sleep(ACCEPT_RETRY).await;
                    continue;
                }
            };
            let relay = self.clone();
            tokio::spawn(async move {
                if let Err(e) = relay.handle_connection(stream, addr).await {
                    debug!("connection from {} ended: {}", addr, e);
                }
            });
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        let ws = accept_async(stream).await?;
        let (mut sink, mut source) = ws.split();

        let (id, mut rx) = self.connect();
        let _registration = Registration {
            relay: self.clone(),
            id,
        };
        info!("connection {} from {}", id, addr);

        tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        while let Some(msg) = source.next().await {
            match msg? {
                Message::Text(text) => {
                    self.receive(id, &text);
                }
                Message::Close(_) => break,
                _ => (),
            }
        }
        info!("connection {} from {} closed", id, addr);
        Ok(())
    }
}
