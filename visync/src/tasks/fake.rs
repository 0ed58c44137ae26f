use std::time::Duration;

use log::info;
use tokio::{
    sync::mpsc,
    time::{self, MissedTickBehavior},
};

use crate::{
    latency::LatencyEstimate, tempo::PULSES_PER_BEAT, Event, Payload, Result, VisyncError,
};

const PULSES_PER_STEP: u64 = PULSES_PER_BEAT as u64 / 4;

/// One bar of sixteenths per element channel; bit n plays on step n.
static PATTERN: [(u8, u16); 3] = [
    (1, 0b0001_0001_0001_0001), // kick on every quarter
    (4, 0b0001_0000_0001_0000), // snare on two and four
    (9, 0b1111_1111_1111_1111), // hats
];

fn beats_at(step: u64) -> impl Iterator<Item = u8> {
    let bit = 1u16 << (step % 16);
    PATTERN
        .iter()
        .filter(move |(_, steps)| steps & bit != 0)
        .map(|(channel, _)| *channel)
}

/// Generates a steady clock and drum pattern without any MIDI hardware.
pub(crate) struct FakeTask {
    bpm: f64,
    latency: LatencyEstimate,
    event_tx: mpsc::Sender<Event>,
}

impl FakeTask {
    pub(crate) fn new(bpm: f64, latency: LatencyEstimate, event_tx: mpsc::Sender<Event>) -> FakeTask {
        FakeTask {
            bpm,
            latency,
            event_tx,
        }
    }

    pub(crate) async fn run(self) -> Result<()> {
        match self.run_impl().await {
            Err(VisyncError::Terminating) => Ok(()),
            res => res,
        }
    }

    async fn run_impl(&self) -> Result<()> {
        let rate_hz = self.bpm * PULSES_PER_BEAT as f64 / 60.0;
        info!("faking midi clock at {} bpm", self.bpm);

        let period = Duration::try_from_secs_f64(1.0 / rate_hz)
            .ok()
            .filter(|period| !period.is_zero())
            .ok_or_else(|| {
                VisyncError::Configuration(format!("can't fake a clock at {} bpm", self.bpm))
            })?;
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut pulse_index: u64 = 0;
        loop {
            tokio::select! {
                _ = self.event_tx.closed() => {
                    return Err(VisyncError::Terminating);
                }
                _ = ticker.tick() => {}
            }

            self.send(Payload::Sync {
                rate_hz,
                pulse_index,
            })
            .await?;
            if pulse_index % PULSES_PER_STEP == 0 {
                for channel in beats_at(pulse_index / PULSES_PER_STEP) {
                    self.send(Payload::Beat { channel, on: true }).await?;
                }
            }
            pulse_index += 1;
        }
    }

    async fn send(&self, payload: Payload) -> Result<()> {
        self.event_tx
            .send(Event::new(payload, self.latency.get()))
            .await
            .map_err(|_| VisyncError::Terminating)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern() {
        assert_eq!(beats_at(0).collect::<Vec<_>>(), vec![1, 9]);
        assert_eq!(beats_at(1).collect::<Vec<_>>(), vec![9]);
        assert_eq!(beats_at(4).collect::<Vec<_>>(), vec![1, 4, 9]);
        assert_eq!(beats_at(12).collect::<Vec<_>>(), vec![1, 4, 9]);
        assert_eq!(beats_at(16).collect::<Vec<_>>(), vec![1, 9]);
    }

    #[tokio::test]
    async fn test_tempo_out_of_range() {
        for bpm in [1e12, 1e-20, 0.0, f64::NAN] {
            let (event_tx, _event_rx) = mpsc::channel(1);
            let res = FakeTask::new(bpm, LatencyEstimate::new(), event_tx).run().await;
            assert!(
                matches!(res, Err(VisyncError::Configuration(_))),
                "bpm {}",
                bpm
            );
        }
    }

    #[tokio::test]
    async fn test_fake_clock() {
        let (event_tx, mut event_rx) = mpsc::channel(64);
        let latency = LatencyEstimate::new();
        latency.set(0.01);
        // 500 Hz pulse rate keeps the test short.
        let handle = tokio::spawn(FakeTask::new(1250.0, latency, event_tx).run());

        let mut payloads = Vec::new();
        while payloads.len() < 12 {
            let event = time::timeout(Duration::from_secs(5), event_rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(event.latency, 0.01);
            payloads.push(event.payload);
        }
        drop(event_rx);
        handle.await.unwrap().unwrap();

        assert_eq!(
            payloads[0],
            Payload::Sync {
                rate_hz: 500.0,
                pulse_index: 0
            }
        );
        assert_eq!(
            &payloads[1..3],
            &[
                Payload::Beat {
                    channel: 1,
                    on: true
                },
                Payload::Beat {
                    channel: 9,
                    on: true
                },
            ]
        );
        let pulses: Vec<u64> = payloads
            .iter()
            .filter_map(|p| match p {
                Payload::Sync { pulse_index, .. } => Some(*pulse_index),
                _ => None,
            })
            .collect();
        assert_eq!(pulses, (0..pulses.len() as u64).collect::<Vec<_>>());
        // Second sixteenth lands on pulse 6 with only the hats.
        let step = payloads
            .iter()
            .position(|p| {
                *p == Payload::Sync {
                    rate_hz: 500.0,
                    pulse_index: 6,
                }
            })
            .unwrap();
        assert_eq!(
            payloads[step + 1],
            Payload::Beat {
                channel: 9,
                on: true
            }
        );
    }
}
