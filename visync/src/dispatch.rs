use std::time::Instant;

use log::{debug, trace};

use crate::{
    event::{Event, Payload},
    latency::LatencyEstimate,
    midi::{ChannelFrame, ChannelMessage, Frame, Realtime},
    tempo::TempoTracker,
};

const NOTE_SYNC_CHANNEL: u8 = 16;
const AUTO_CHANNEL: u8 = 15;
const SCENE_CHANNEL: u8 = 14;
const ADVANCE_CHANNEL: u8 = 13;
const RETREAT_CHANNEL: u8 = 12;

/// Velocities at or above this select the foreground layer.
const FOREGROUND_VELOCITY: u8 = 100;

/// What a note-on on a given channel means.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Route {
    /// Each note is a clock pulse.
    NoteSync,
    /// Drum machine auto channel: note ranges select scenes, steps or beats.
    AutoMap,
    /// Note number selects a scene relative to middle C.
    GotoScene,
    Advance(i8),
    /// Beat on the given element channel.
    Element(u8),
}

#[derive(Clone, Debug)]
pub struct ChannelPolicy {
    /// Treat notes on channel 16 as clock pulses.
    pub use_note_syncs: bool,
    /// (from, to) pairs folding element channels onto a smaller set.
    pub element_remap: Vec<(u8, u8)>,
}

impl Default for ChannelPolicy {
    fn default() -> ChannelPolicy {
        ChannelPolicy {
            use_note_syncs: false,
            element_remap: vec![(4, 2), (9, 4), (2, 3), (5, 3)],
        }
    }
}

impl ChannelPolicy {
    /// Route table indexed by wire channel (0-15).
    pub fn routes(&self) -> [Route; 16] {
        let mut routes = [Route::Element(0); 16];
        for (idx, route) in routes.iter_mut().enumerate() {
            let channel = idx as u8 + 1;
            *route = match channel {
                NOTE_SYNC_CHANNEL if self.use_note_syncs => Route::NoteSync,
                AUTO_CHANNEL => Route::AutoMap,
                SCENE_CHANNEL => Route::GotoScene,
                ADVANCE_CHANNEL => Route::Advance(1),
                RETREAT_CHANNEL => Route::Advance(-1),
                _ => Route::Element(self.remap(channel)),
            };
        }
        routes
    }

    fn remap(&self, channel: u8) -> u8 {
        self.element_remap
            .iter()
            .find(|(from, _)| *from == channel)
            .map(|(_, to)| *to)
            .unwrap_or(channel)
    }
}

/// Turns decoded frames into events, driving the tempo tracker from clock
/// frames.
#[derive(Debug)]
pub struct Dispatcher {
    tracker: TempoTracker,
    routes: [Route; 16],
    playing: bool,
    latency: LatencyEstimate,
}

impl Dispatcher {
    pub fn new(tracker: TempoTracker, policy: &ChannelPolicy, latency: LatencyEstimate) -> Dispatcher {
        Dispatcher {
            tracker,
            routes: policy.routes(),
            playing: true,
            latency,
        }
    }

    pub fn tracker(&self) -> &TempoTracker {
        &self.tracker
    }

    pub fn playing(&self) -> bool {
        self.playing
    }

    pub fn dispatch(&mut self, frame: &Frame) -> Option<Event> {
        self.dispatch_at(frame, Instant::now())
    }

    pub fn dispatch_at(&mut self, frame: &Frame, now: Instant) -> Option<Event> {
        let payload = match frame {
            Frame::Realtime(rt) => self.realtime(*rt, now),
            Frame::Channel(frame) => self.channel(frame, now),
        }?;
        Some(Event::new(payload, self.latency.get()))
    }

    fn realtime(&mut self, rt: Realtime, now: Instant) -> Option<Payload> {
        match rt {
            Realtime::Clock => {
                self.tracker.ping_at(now);
                if self.playing {
                    self.sync()
                } else {
                    None
                }
            }
            Realtime::Start => {
                debug!(target: "visync", "transport start");
                self.playing = true;
                self.tracker.reset();
                None
            }
            Realtime::Continue => {
                debug!(target: "visync", "transport continue");
                self.playing = true;
                None
            }
            Realtime::Stop => {
                debug!(target: "visync", "transport stop");
                self.playing = false;
                None
            }
            Realtime::ActiveSensing | Realtime::Reset => None,
        }
    }

    fn sync(&self) -> Option<Payload> {
        if !self.tracker.synced() {
            return None;
        }
        Some(Payload::Sync {
            rate_hz: self.tracker.rate_hz(),
            pulse_index: self.tracker.pulse_index(),
        })
    }

    fn channel(&mut self, frame: &ChannelFrame, now: Instant) -> Option<Payload> {
        let channel = frame.logical_channel();
        match frame.message {
            ChannelMessage::NoteOn { note, velocity } => {
                trace!("{}:{}:{}", channel, note, velocity);
                // Note-on with zero velocity is a note-off.
                if velocity == 0 {
                    return None;
                }
                self.note_on(self.routes[frame.channel as usize], note, velocity, now)
            }
            ChannelMessage::NoteOff { .. } | ChannelMessage::PolyPressure { .. } => None,
            ChannelMessage::ControlChange { control, value } => {
                debug!("control change: {} {}", control, value);
                Some(Payload::ControlChange {
                    index: control,
                    value,
                })
            }
            ChannelMessage::PitchBend { value } => Some(Payload::PitchBend { value }),
            ChannelMessage::ProgramChange { program } => {
                debug!("program change: {} {}", channel, program);
                self.tracker.reset_pulse_index();
                Some(Payload::ProgramChange { channel, program })
            }
        }
    }

    fn note_on(&mut self, route: Route, note: u8, velocity: u8, now: Instant) -> Option<Payload> {
        let background = velocity < FOREGROUND_VELOCITY;
        match route {
            Route::NoteSync => {
                self.tracker.ping_at(now);
                self.sync()
            }
            Route::AutoMap => Some(match note {
                0..=11 => Payload::Beat {
                    channel: note + 1,
                    on: true,
                },
                12..=35 => Payload::GotoScene {
                    scene_id: note as i32 - 12,
                    background,
                },
                _ => Payload::AdvanceSceneState {
                    step: if note % 2 == 0 { -1 } else { 1 },
                },
            }),
            Route::GotoScene => Some(Payload::GotoScene {
                scene_id: note as i32 - 60,
                background,
            }),
            Route::Advance(step) => Some(Payload::AdvanceSceneState { step }),
            Route::Element(channel) => Some(Payload::Beat { channel, on: true }),
        }
    }
}
