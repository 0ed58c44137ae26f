use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use strum::Display;

use crate::Result;

/// One message exchanged between the producer, the relay and viewers.
///
/// On the wire this is a flat JSON object: the envelope fields sit next to
/// the payload fields and `kind` names the payload variant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Producer wall clock, seconds since the unix epoch.
    pub timestamp: f64,
    /// Last measured one-way transit estimate in seconds.
    pub latency: f64,
    #[serde(flatten)]
    pub payload: Payload,
}

#[derive(Clone, Debug, Display, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Payload {
    Sync { rate_hz: f64, pulse_index: u64 },
    Beat { channel: u8, on: bool },
    GotoScene { scene_id: i32, background: bool },
    AdvanceSceneState { step: i8 },
    ControlChange { index: u8, value: u8 },
    PitchBend { value: u16 },
    ProgramChange { channel: u8, program: u8 },
    Promotion { secret: String },
    PromotionGrant,
}

impl Event {
    pub fn new(payload: Payload, latency: f64) -> Event {
        Event {
            timestamp: now_secs(),
            latency: latency.max(0.0),
            payload,
        }
    }

    pub fn promotion(secret: &str) -> Event {
        Event::new(
            Payload::Promotion {
                secret: secret.to_string(),
            },
            0.0,
        )
    }

    pub fn is_promotion(&self) -> bool {
        matches!(self.payload, Payload::Promotion { .. })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(s: &str) -> Result<Event> {
        Ok(serde_json::from_str(s)?)
    }
}

/// Viewer acknowledgement. Viewers send back the timestamp of an event they
/// received, either on its own or as part of the echoed event.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
pub struct Echo {
    #[serde(alias = "t")]
    pub timestamp: f64,
}

impl Echo {
    pub fn from_json(s: &str) -> Option<Echo> {
        serde_json::from_str(s).ok()
    }
}

/// Wall clock seconds since the unix epoch.
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
