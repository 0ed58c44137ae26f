use std::io::Write;

use byteorder::WriteBytesExt;
use nom::{
    combinator::verify,
    error::{Error as NomError, ErrorKind},
    number::complete::be_u8,
    sequence::tuple,
    IResult,
};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use thiserror::Error;

const SYSEX_START: u8 = 0xf0;
const SYSEX_END: u8 = 0xf7;

/// Single byte system real-time messages. These may appear anywhere in the
/// stream, including between the bytes of a channel message.
#[derive(Clone, Copy, Debug, Eq, FromPrimitive, PartialEq)]
#[repr(u8)]
pub enum Realtime {
    Clock = 0xf8,
    Start = 0xfa,
    Continue = 0xfb,
    Stop = 0xfc,
    ActiveSensing = 0xfe,
    Reset = 0xff,
}

/// High nibble of a channel message status byte.
#[derive(Clone, Copy, Debug, Eq, FromPrimitive, PartialEq)]
#[repr(u8)]
pub enum StatusKind {
    NoteOff = 0x8,
    NoteOn = 0x9,
    PolyPressure = 0xa,
    ControlChange = 0xb,
    ProgramChange = 0xc,
    PitchBend = 0xe,
}

impl StatusKind {
    /// Frame length including the status byte.
    pub fn frame_len(self) -> usize {
        match self {
            StatusKind::ProgramChange => 2,
            _ => 3,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChannelMessage {
    NoteOff { note: u8, velocity: u8 },
    NoteOn { note: u8, velocity: u8 },
    PolyPressure { note: u8, pressure: u8 },
    ControlChange { control: u8, value: u8 },
    ProgramChange { program: u8 },
    /// 14 bit value, 0x2000 is centered.
    PitchBend { value: u16 },
}

impl ChannelMessage {
    pub fn kind(&self) -> StatusKind {
        match self {
            ChannelMessage::NoteOff { .. } => StatusKind::NoteOff,
            ChannelMessage::NoteOn { .. } => StatusKind::NoteOn,
            ChannelMessage::PolyPressure { .. } => StatusKind::PolyPressure,
            ChannelMessage::ControlChange { .. } => StatusKind::ControlChange,
            ChannelMessage::ProgramChange { .. } => StatusKind::ProgramChange,
            ChannelMessage::PitchBend { .. } => StatusKind::PitchBend,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ChannelFrame {
    /// Wire channel, 0-15.
    pub channel: u8,
    pub message: ChannelMessage,
}

fn data_byte(i: &[u8]) -> IResult<&[u8], u8> {
    verify(be_u8, |b: &u8| *b < 0x80)(i)
}

fn data_pair(i: &[u8]) -> IResult<&[u8], (u8, u8)> {
    tuple((data_byte, data_byte))(i)
}

impl ChannelFrame {
    /// Channel number as printed on gear, 1-16.
    pub fn logical_channel(&self) -> u8 {
        self.channel + 1
    }

    pub fn parse(i: &[u8]) -> IResult<&[u8], ChannelFrame> {
        let (i, status) = be_u8(i)?;
        let kind = StatusKind::from_u8(status >> 4)
            .ok_or_else(|| nom::Err::Error(NomError::new(i, ErrorKind::Tag)))?;
        let (i, message) = match kind {
            StatusKind::NoteOff => {
                let (i, (note, velocity)) = data_pair(i)?;
                (i, ChannelMessage::NoteOff { note, velocity })
            }
            StatusKind::NoteOn => {
                let (i, (note, velocity)) = data_pair(i)?;
                (i, ChannelMessage::NoteOn { note, velocity })
            }
            StatusKind::PolyPressure => {
                let (i, (note, pressure)) = data_pair(i)?;
                (i, ChannelMessage::PolyPressure { note, pressure })
            }
            StatusKind::ControlChange => {
                let (i, (control, value)) = data_pair(i)?;
                (i, ChannelMessage::ControlChange { control, value })
            }
            StatusKind::ProgramChange => {
                let (i, program) = data_byte(i)?;
                (i, ChannelMessage::ProgramChange { program })
            }
            StatusKind::PitchBend => {
                // LSB first.
                let (i, (lo, hi)) = data_pair(i)?;
                let value = ((hi as u16) << 7) | lo as u16;
                (i, ChannelMessage::PitchBend { value })
            }
        };
        Ok((
            i,
            ChannelFrame {
                channel: status & 0x0f,
                message,
            },
        ))
    }

    pub fn write(&self, w: &mut dyn Write) -> std::io::Result<()> {
        w.write_u8(((self.message.kind() as u8) << 4) | (self.channel & 0x0f))?;
        match self.message {
            ChannelMessage::NoteOff { note, velocity } | ChannelMessage::NoteOn { note, velocity } => {
                w.write_all(&[note, velocity])?
            }
            ChannelMessage::PolyPressure { note, pressure } => w.write_all(&[note, pressure])?,
            ChannelMessage::ControlChange { control, value } => w.write_all(&[control, value])?,
            ChannelMessage::ProgramChange { program } => w.write_u8(program)?,
            ChannelMessage::PitchBend { value } => {
                w.write_all(&[(value & 0x7f) as u8, ((value >> 7) & 0x7f) as u8])?
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Frame {
    Realtime(Realtime),
    Channel(ChannelFrame),
}

impl Frame {
    pub fn write(&self, w: &mut dyn Write) -> std::io::Result<()> {
        match self {
            Frame::Realtime(rt) => w.write_u8(*rt as u8),
            Frame::Channel(frame) => frame.write(w),
        }
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum DecodeError {
    #[error("unknown status byte 0x{0:02x}")]
    UnknownStatus(u8),

    #[error("data byte 0x{0:02x} with no frame in progress")]
    UnexpectedData(u8),

    #[error("frame {dropped:02x?} interrupted by status byte 0x{by:02x}")]
    Interrupted { dropped: Vec<u8>, by: u8 },

    /// A partial frame was cut short by a status byte that is itself not
    /// understood. Both the partial frame and the status byte are lost.
    #[error("frame {dropped:02x?} interrupted by unknown status byte 0x{status:02x}")]
    InterruptedByUnknown { dropped: Vec<u8>, status: u8 },

    #[error("malformed frame {0:02x?}")]
    Malformed(Vec<u8>),
}

impl DecodeError {
    /// Bytes that were discarded because of this error.
    pub fn dropped(&self) -> Vec<u8> {
        match self {
            DecodeError::UnknownStatus(b) | DecodeError::UnexpectedData(b) => vec![*b],
            DecodeError::Interrupted { dropped, .. } | DecodeError::Malformed(dropped) => {
                dropped.clone()
            }
            DecodeError::InterruptedByUnknown { dropped, status } => {
                let mut bytes = dropped.clone();
                bytes.push(*status);
                bytes
            }
        }
    }
}

/// Incremental decoder for a raw MIDI byte stream.
///
/// Real-time bytes are returned immediately and leave any partially
/// accumulated channel message untouched.
#[derive(Debug, Default)]
pub struct Decoder {
    buf: [u8; 3],
    len: usize,
    expected: usize,
    in_sysex: bool,
}

impl Decoder {
    pub fn new() -> Decoder {
        Decoder::default()
    }

    pub fn feed(&mut self, b: u8) -> Result<Option<Frame>, DecodeError> {
        if b >= 0xf8 {
            return Realtime::from_u8(b)
                .map(|rt| Some(Frame::Realtime(rt)))
                .ok_or(DecodeError::UnknownStatus(b));
        }

        if b & 0x80 != 0 {
            return self.begin(b);
        }

        if self.in_sysex {
            return Ok(None);
        }
        if self.len == 0 {
            return Err(DecodeError::UnexpectedData(b));
        }

        self.buf[self.len] = b;
        self.len += 1;
        if self.len < self.expected {
            return Ok(None);
        }

        let frame = &self.buf[..self.len];
        self.len = 0;
        match ChannelFrame::parse(frame) {
            Ok((_, frame)) => Ok(Some(Frame::Channel(frame))),
            Err(_) => Err(DecodeError::Malformed(frame.to_vec())),
        }
    }

    fn begin(&mut self, status: u8) -> Result<Option<Frame>, DecodeError> {
        let dropped = self.buf[..self.len].to_vec();
        self.len = 0;
        self.in_sysex = false;

        let started = match status {
            SYSEX_START => {
                self.in_sysex = true;
                Ok(None)
            }
            SYSEX_END => Ok(None),
            _ => match StatusKind::from_u8(status >> 4) {
                Some(kind) => {
                    self.buf[0] = status;
                    self.len = 1;
                    self.expected = kind.frame_len();
                    Ok(None)
                }
                None => Err(DecodeError::UnknownStatus(status)),
            },
        };

        if dropped.is_empty() {
            return started;
        }
        match started {
            Err(DecodeError::UnknownStatus(status)) => {
                Err(DecodeError::InterruptedByUnknown { dropped, status })
            }
            _ => Err(DecodeError::Interrupted {
                dropped,
                by: status,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note_on(channel: u8, note: u8, velocity: u8) -> Frame {
        Frame::Channel(ChannelFrame {
            channel,
            message: ChannelMessage::NoteOn { note, velocity },
        })
    }

    fn decode_all(decoder: &mut Decoder, bytes: &[u8]) -> Vec<Result<Frame, DecodeError>> {
        bytes
            .iter()
            .filter_map(|b| decoder.feed(*b).transpose())
            .collect()
    }

    fn frames(results: Vec<Result<Frame, DecodeError>>) -> Vec<Frame> {
        results.into_iter().map(|r| r.unwrap()).collect()
    }

    fn sample_frames() -> Vec<Frame> {
        vec![
            Frame::Realtime(Realtime::Start),
            note_on(13, 72, 50),
            Frame::Realtime(Realtime::Clock),
            Frame::Channel(ChannelFrame {
                channel: 0,
                message: ChannelMessage::ControlChange {
                    control: 7,
                    value: 127,
                },
            }),
            Frame::Channel(ChannelFrame {
                channel: 3,
                message: ChannelMessage::ProgramChange { program: 5 },
            }),
            Frame::Channel(ChannelFrame {
                channel: 15,
                message: ChannelMessage::PitchBend { value: 0x2000 },
            }),
            Frame::Channel(ChannelFrame {
                channel: 2,
                message: ChannelMessage::NoteOff {
                    note: 40,
                    velocity: 0,
                },
            }),
            Frame::Channel(ChannelFrame {
                channel: 9,
                message: ChannelMessage::PolyPressure {
                    note: 36,
                    pressure: 90,
                },
            }),
            Frame::Realtime(Realtime::Stop),
        ]
    }

    #[test]
    fn test_parse() {
        let test_cases = [
            (&[0x9d, 0x48, 0x32][..], note_on(13, 72, 50)),
            (
                &[0xb0, 0x07, 0x7f],
                Frame::Channel(ChannelFrame {
                    channel: 0,
                    message: ChannelMessage::ControlChange {
                        control: 7,
                        value: 127,
                    },
                }),
            ),
            (
                &[0xc3, 0x05],
                Frame::Channel(ChannelFrame {
                    channel: 3,
                    message: ChannelMessage::ProgramChange { program: 5 },
                }),
            ),
            (
                &[0xe1, 0x7f, 0x7f],
                Frame::Channel(ChannelFrame {
                    channel: 1,
                    message: ChannelMessage::PitchBend { value: 0x3fff },
                }),
            ),
        ];

        for (data, frame) in test_cases.iter() {
            let mut c = std::io::Cursor::new(Vec::new());
            frame.write(&mut c).unwrap();
            assert_eq!(c.into_inner().as_slice(), *data);

            let mut decoder = Decoder::new();
            assert_eq!(frames(decode_all(&mut decoder, data)), vec![*frame]);
        }
    }

    #[test]
    fn test_parse_rejects_data_with_high_bit() {
        assert!(ChannelFrame::parse(&[0x90, 0x3c, 0x90]).is_err());
        assert!(ChannelFrame::parse(&[0xd0, 0x3c]).is_err());
        assert!(ChannelFrame::parse(&[0x90, 0x3c]).is_err());
    }

    #[test]
    fn test_pitch_bend_combines_lsb_and_msb() {
        let mut decoder = Decoder::new();
        let decoded = frames(decode_all(&mut decoder, &[0xe0, 0x01, 0x40]));
        assert_eq!(
            decoded,
            vec![Frame::Channel(ChannelFrame {
                channel: 0,
                message: ChannelMessage::PitchBend {
                    value: (0x40 << 7) | 0x01
                },
            })]
        );
    }

    #[test]
    fn test_chunk_boundaries_do_not_matter() {
        let expected = sample_frames();
        let mut stream = Vec::new();
        for frame in &expected {
            frame.write(&mut stream).unwrap();
        }

        for chunk_size in 1..=stream.len() {
            let mut decoder = Decoder::new();
            let mut decoded = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                decoded.extend(frames(decode_all(&mut decoder, chunk)));
            }
            assert_eq!(decoded, expected, "chunk size {}", chunk_size);
        }
    }

    #[test]
    fn test_realtime_interleaved_in_channel_message() {
        let mut decoder = Decoder::new();
        let decoded = frames(decode_all(
            &mut decoder,
            &[0x9d, 0xf8, 0x48, 0xfa, 0xf8, 0x32, 0xf8],
        ));
        assert_eq!(
            decoded,
            vec![
                Frame::Realtime(Realtime::Clock),
                Frame::Realtime(Realtime::Start),
                Frame::Realtime(Realtime::Clock),
                note_on(13, 72, 50),
                Frame::Realtime(Realtime::Clock),
            ]
        );
    }

    #[test]
    fn test_undefined_realtime_keeps_buffer() {
        let mut decoder = Decoder::new();
        let decoded = decode_all(&mut decoder, &[0x90, 0x3c, 0xf9, 0x64]);
        assert_eq!(
            decoded,
            vec![Err(DecodeError::UnknownStatus(0xf9)), Ok(note_on(0, 0x3c, 0x64))]
        );
    }

    #[test]
    fn test_status_byte_restarts_framing() {
        let mut decoder = Decoder::new();
        let decoded = decode_all(&mut decoder, &[0x90, 0x3c, 0x9d, 0x48, 0x32]);
        assert_eq!(
            decoded,
            vec![
                Err(DecodeError::Interrupted {
                    dropped: vec![0x90, 0x3c],
                    by: 0x9d
                }),
                Ok(note_on(13, 72, 50)),
            ]
        );
    }

    #[test]
    fn test_unknown_status_dropped() {
        let mut decoder = Decoder::new();
        // Channel pressure is not framed; its data byte has nowhere to go.
        let decoded = decode_all(&mut decoder, &[0xd0, 0x10, 0x90, 0x3c, 0x64]);
        assert_eq!(
            decoded,
            vec![
                Err(DecodeError::UnknownStatus(0xd0)),
                Err(DecodeError::UnexpectedData(0x10)),
                Ok(note_on(0, 0x3c, 0x64)),
            ]
        );
        assert_eq!(decoded[0].as_ref().unwrap_err().dropped(), vec![0xd0]);
    }

    #[test]
    fn test_unknown_status_interrupts_frame() {
        let mut decoder = Decoder::new();
        let decoded = decode_all(&mut decoder, &[0x90, 0x3c, 0xf4, 0x64, 0x90, 0x3c, 0x64]);
        assert_eq!(
            decoded,
            vec![
                Err(DecodeError::InterruptedByUnknown {
                    dropped: vec![0x90, 0x3c],
                    status: 0xf4
                }),
                Err(DecodeError::UnexpectedData(0x64)),
                Ok(note_on(0, 0x3c, 0x64)),
            ]
        );
        assert_eq!(
            decoded[0].as_ref().unwrap_err().dropped(),
            vec![0x90, 0x3c, 0xf4]
        );
    }

    #[test]
    fn test_sysex_skipped() {
        let mut decoder = Decoder::new();
        let decoded = decode_all(
            &mut decoder,
            &[0xf0, 0x43, 0x12, 0xf8, 0x00, 0x41, 0xf7, 0x90, 0x3c, 0x64],
        );
        assert_eq!(
            decoded,
            vec![Ok(Frame::Realtime(Realtime::Clock)), Ok(note_on(0, 0x3c, 0x64))]
        );
    }

    #[test]
    fn test_sysex_ended_by_status() {
        let mut decoder = Decoder::new();
        let decoded = decode_all(&mut decoder, &[0xf0, 0x01, 0x02, 0xc0, 0x03]);
        assert_eq!(
            decoded,
            vec![Ok(Frame::Channel(ChannelFrame {
                channel: 0,
                message: ChannelMessage::ProgramChange { program: 3 },
            }))]
        );
    }
}
