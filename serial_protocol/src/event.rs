use crate::frame::FrameError;

/// Display-name field width in a [`WwEntryStatus`]: 32 bytes plus NUL.
pub const WW_NAME_LEN: usize = 33;

/// Event tags carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventId {
    Nop = 0x00,
    Status = 0x01,
    Mode = 0x10,
    Config = 0x11,
    Audio = 0x12,
    BAudio = 0x13,
    Areset = 0x14,
    Reboot = 0x15,
    WwList = 0x20,
    WwStatus = 0x21,
    WwConf = 0x22,
    WwMatch = 0x23,
}

impl TryFrom<u8> for EventId {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(EventId::Nop),
            0x01 => Ok(EventId::Status),
            0x10 => Ok(EventId::Mode),
            0x11 => Ok(EventId::Config),
            0x12 => Ok(EventId::Audio),
            0x13 => Ok(EventId::BAudio),
            0x14 => Ok(EventId::Areset),
            0x15 => Ok(EventId::Reboot),
            0x20 => Ok(EventId::WwList),
            0x21 => Ok(EventId::WwStatus),
            0x22 => Ok(EventId::WwConf),
            0x23 => Ok(EventId::WwMatch),
            _ => Err(FrameError::UnknownEvent(value)),
        }
    }
}

/// Bridge status report, 13 bytes on the wire.
///
/// `kind` is the last recorded error kind (0 = ok); `wakeword_mask` has bit
/// `i` set when catalog entry `i` is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StatusReport {
    pub mode: u8,
    pub kind: u8,
    pub ready: u8,
    pub wakeword_mask: u16,
    pub frames: u32,
    pub matches: u32,
}

impl StatusReport {
    pub const SIZE: usize = 13;

    fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.mode);
        out.push(self.kind);
        out.push(self.ready);
        out.extend_from_slice(&self.wakeword_mask.to_le_bytes());
        out.extend_from_slice(&self.frames.to_le_bytes());
        out.extend_from_slice(&self.matches.to_le_bytes());
    }

    fn decode(b: &[u8]) -> Self {
        StatusReport {
            mode: b[0],
            kind: b[1],
            ready: b[2],
            wakeword_mask: u16::from_le_bytes([b[3], b[4]]),
            frames: u32::from_le_bytes([b[5], b[6], b[7], b[8]]),
            matches: u32::from_le_bytes([b[9], b[10], b[11], b[12]]),
        }
    }
}

/// Audio preprocessing configuration, 7 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioConf {
    pub preamp: f32,
    pub noiser: u8,
    pub autogain: u8,
    pub vad: u8,
}

impl Default for AudioConf {
    fn default() -> Self {
        AudioConf { preamp: 1.0, noiser: 0, autogain: 0, vad: 0 }
    }
}

impl AudioConf {
    pub const SIZE: usize = 7;

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.preamp.to_le_bytes());
        out.push(self.noiser);
        out.push(self.autogain);
        out.push(self.vad);
    }

    fn decode(b: &[u8]) -> Self {
        AudioConf {
            preamp: f32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            noiser: b[4],
            autogain: b[5],
            vad: b[6],
        }
    }
}

/// Per-entry wake-word configuration, 7 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WwConf {
    pub index: u8,
    pub enabled: u8,
    pub threshold: f32,
    pub patience: u8,
}

impl WwConf {
    pub const SIZE: usize = 7;

    fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.index);
        out.push(self.enabled);
        out.extend_from_slice(&self.threshold.to_le_bytes());
        out.push(self.patience);
    }

    fn decode(b: &[u8]) -> Self {
        WwConf {
            index: b[0],
            enabled: b[1],
            threshold: f32::from_le_bytes([b[2], b[3], b[4], b[5]]),
            patience: b[6],
        }
    }
}

/// Catalog entry dump: NUL-padded display name followed by its [`WwConf`],
/// 40 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WwEntryStatus {
    pub name: [u8; WW_NAME_LEN],
    pub conf: WwConf,
}

impl WwEntryStatus {
    pub const SIZE: usize = WW_NAME_LEN + WwConf::SIZE;

    pub fn new(name: &str, conf: WwConf) -> Self {
        let mut entry = WwEntryStatus { name: [0u8; WW_NAME_LEN], conf };
        entry.set_name(name);
        entry
    }

    /// Copies at most 32 bytes of `name`; the field is always NUL-terminated.
    pub fn set_name(&mut self, name: &str) {
        self.name = [0u8; WW_NAME_LEN];
        let bytes = name.as_bytes();
        let n = bytes.len().min(WW_NAME_LEN - 1);
        self.name[..n].copy_from_slice(&bytes[..n]);
    }

    pub fn name(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        std::str::from_utf8(&self.name[..end]).unwrap_or("")
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.name);
        self.conf.encode(out);
    }

    fn decode(b: &[u8]) -> Self {
        let mut name = [0u8; WW_NAME_LEN];
        name.copy_from_slice(&b[..WW_NAME_LEN]);
        WwEntryStatus { name, conf: WwConf::decode(&b[WW_NAME_LEN..]) }
    }
}

/// Wake-word match notification, 6 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WwMatch {
    pub index: u8,
    pub score: f32,
    pub count: u8,
}

impl WwMatch {
    pub const SIZE: usize = 6;

    fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.index);
        out.extend_from_slice(&self.score.to_le_bytes());
        out.push(self.count);
    }

    fn decode(b: &[u8]) -> Self {
        WwMatch {
            index: b[0],
            score: f32::from_le_bytes([b[1], b[2], b[3], b[4]]),
            count: b[5],
        }
    }
}

/// Decoded protocol event.
///
/// `Status(None)` and `Config(None)` are the zero-payload query forms; the
/// populated variants are the replies. Small operands (mode, refractory
/// count, list-clear flag, BAudio VAD byte) travel in the header's
/// `event_extra` byte and carry no payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Nop,
    Status(Option<StatusReport>),
    Mode { mode: u8 },
    Config(Option<AudioConf>),
    Audio(Vec<u8>),
    BAudio { vad: u8, pcm: Vec<u8> },
    Areset { refrac: u8 },
    Reboot,
    WwList { clear: bool },
    WwStatus(WwEntryStatus),
    WwConf(WwConf),
    WwMatch(WwMatch),
}

impl Event {
    pub fn id(&self) -> EventId {
        match self {
            Event::Nop => EventId::Nop,
            Event::Status(_) => EventId::Status,
            Event::Mode { .. } => EventId::Mode,
            Event::Config(_) => EventId::Config,
            Event::Audio(_) => EventId::Audio,
            Event::BAudio { .. } => EventId::BAudio,
            Event::Areset { .. } => EventId::Areset,
            Event::Reboot => EventId::Reboot,
            Event::WwList { .. } => EventId::WwList,
            Event::WwStatus(_) => EventId::WwStatus,
            Event::WwConf(_) => EventId::WwConf,
            Event::WwMatch(_) => EventId::WwMatch,
        }
    }

    /// Value for the header's `event_extra` byte.
    pub fn extra(&self) -> u8 {
        match self {
            Event::Mode { mode } => *mode,
            Event::BAudio { vad, .. } => *vad,
            Event::Areset { refrac } => *refrac,
            Event::WwList { clear } => u8::from(*clear),
            _ => 0,
        }
    }

    pub(crate) fn encode_payload(&self, out: &mut Vec<u8>) {
        match self {
            Event::Nop
            | Event::Mode { .. }
            | Event::Areset { .. }
            | Event::Reboot
            | Event::WwList { .. }
            | Event::Status(None)
            | Event::Config(None) => {}
            Event::Status(Some(report)) => report.encode(out),
            Event::Config(Some(conf)) => conf.encode(out),
            Event::Audio(pcm) => out.extend_from_slice(pcm),
            Event::BAudio { pcm, .. } => out.extend_from_slice(pcm),
            Event::WwStatus(entry) => entry.encode(out),
            Event::WwConf(conf) => conf.encode(out),
            Event::WwMatch(m) => m.encode(out),
        }
    }

    pub(crate) fn decode(id: EventId, extra: u8, payload: &[u8]) -> Result<Event, FrameError> {
        let fixed = |expected: usize| -> Result<(), FrameError> {
            if payload.len() == expected {
                Ok(())
            } else {
                Err(FrameError::InvalidPayloadLen {
                    id: id as u8,
                    expected,
                    got: payload.len(),
                })
            }
        };

        match id {
            EventId::Nop => {
                fixed(0)?;
                Ok(Event::Nop)
            }
            EventId::Status => match payload.len() {
                0 => Ok(Event::Status(None)),
                StatusReport::SIZE => Ok(Event::Status(Some(StatusReport::decode(payload)))),
                got => Err(FrameError::InvalidPayloadLen {
                    id: id as u8,
                    expected: StatusReport::SIZE,
                    got,
                }),
            },
            EventId::Mode => {
                fixed(0)?;
                Ok(Event::Mode { mode: extra })
            }
            EventId::Config => match payload.len() {
                0 => Ok(Event::Config(None)),
                AudioConf::SIZE => Ok(Event::Config(Some(AudioConf::decode(payload)))),
                got => Err(FrameError::InvalidPayloadLen {
                    id: id as u8,
                    expected: AudioConf::SIZE,
                    got,
                }),
            },
            EventId::Audio => Ok(Event::Audio(payload.to_vec())),
            EventId::BAudio => Ok(Event::BAudio { vad: extra, pcm: payload.to_vec() }),
            EventId::Areset => {
                fixed(0)?;
                Ok(Event::Areset { refrac: extra })
            }
            EventId::Reboot => {
                fixed(0)?;
                Ok(Event::Reboot)
            }
            EventId::WwList => {
                fixed(0)?;
                Ok(Event::WwList { clear: extra != 0 })
            }
            EventId::WwStatus => {
                fixed(WwEntryStatus::SIZE)?;
                Ok(Event::WwStatus(WwEntryStatus::decode(payload)))
            }
            EventId::WwConf => {
                fixed(WwConf::SIZE)?;
                Ok(Event::WwConf(WwConf::decode(payload)))
            }
            EventId::WwMatch => {
                fixed(WwMatch::SIZE)?;
                Ok(Event::WwMatch(WwMatch::decode(payload)))
            }
        }
    }
}
