use std::{
    ops::RangeInclusive,
    path::{Path, PathBuf},
};

use crate::{dispatch::ChannelPolicy, tempo::TrackerConfig, Result, VisyncError};

/// MIDI DIN wire rate.
pub const DEFAULT_BAUD: u32 = 31250;

/// Tempo range accepted for the fake clock.
pub const FAKE_BPM_RANGE: RangeInclusive<f64> = 1.0..=2000.0;

/// Where MIDI comes from. Exactly one is active per adapter.
#[derive(Clone, Debug, PartialEq)]
pub enum InputSource {
    /// Serial port carrying raw MIDI, e.g. a UART wired to a DIN jack.
    Serial { path: String, baud: u32 },
    /// A raw MIDI device node that can be read as a plain byte stream.
    Raw { path: PathBuf },
    /// Synthetic clock and drum pattern at a fixed tempo.
    Fake { bpm: f64 },
}

impl InputSource {
    pub fn from_options(
        device: Option<String>,
        baud: Option<u32>,
        raw: Option<PathBuf>,
        fake: Option<f64>,
    ) -> Result<InputSource> {
        let selected = device.is_some() as usize + raw.is_some() as usize + fake.is_some() as usize;
        if selected != 1 {
            return Err(VisyncError::Configuration(format!(
                "exactly one input source must be selected, got {}",
                selected
            )));
        }
        if baud.is_some() && device.is_none() {
            return Err(VisyncError::Configuration(
                "a baud rate only applies to a serial device".to_string(),
            ));
        }

        if let Some(path) = device {
            Ok(InputSource::Serial {
                path,
                baud: baud.unwrap_or(DEFAULT_BAUD),
            })
        } else if let Some(path) = raw {
            Ok(InputSource::Raw { path })
        } else {
            let bpm = fake.unwrap_or_default();
            if !FAKE_BPM_RANGE.contains(&bpm) {
                return Err(VisyncError::Configuration(format!(
                    "fake bpm must be between {} and {}, got {}",
                    FAKE_BPM_RANGE.start(),
                    FAKE_BPM_RANGE.end(),
                    bpm
                )));
            }
            Ok(InputSource::Fake { bpm })
        }
    }
}

#[derive(Clone, Debug)]
pub struct AdapterConfig {
    pub input: InputSource,
    pub tracker: TrackerConfig,
    pub policy: ChannelPolicy,
}

impl AdapterConfig {
    pub fn new(input: InputSource) -> AdapterConfig {
        AdapterConfig {
            input,
            tracker: TrackerConfig::default(),
            policy: ChannelPolicy::default(),
        }
    }
}

/// Read the producer secret. Surrounding whitespace is not part of it.
pub fn load_secret(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let secret = std::fs::read_to_string(path).map_err(|e| {
        VisyncError::Configuration(format!("can't read secret file {}: {}", path.display(), e))
    })?;
    let secret = secret.trim();
    if secret.is_empty() {
        return Err(VisyncError::Configuration(format!(
            "secret file {} is empty",
            path.display()
        )));
    }
    Ok(secret.to_string())
}
