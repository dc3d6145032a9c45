use std::io::{self, Read, Write};

use thiserror::Error;

use crate::event::{Event, EventId};

/// Start-of-header byte delimiting every frame.
pub const SOH: u8 = 0x01;

/// Upper bound on a frame payload; larger sizes are rejected unread.
pub const MAX_PAYLOAD: usize = 2048;

/// How far a single read call scans for SOH before giving up.
const RESYNC_SCAN_LIMIT: usize = 4096;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("no SOH found in input")]
    NoSoh,

    #[error("header integrity check failed")]
    HeaderIntegrity,

    #[error("payload size {0} exceeds limit")]
    PayloadTooBig(u16),

    #[error("event 0x{id:02x}: payload length {got}, expected {expected}")]
    InvalidPayloadLen { id: u8, expected: usize, got: usize },

    #[error("payload checksum mismatch")]
    PayloadChecksum,

    #[error("unknown event id 0x{0:02x}")]
    UnknownEvent(u8),

    #[error("frame truncated mid-event")]
    IncompleteEvent,
}

/// Modular-256 sum over `bytes`.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

fn truncated(e: io::Error) -> FrameError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        FrameError::IncompleteEvent
    } else {
        FrameError::Io(e)
    }
}

/// Reads one event, scanning forward to the next SOH first.
///
/// Garbage before the SOH is consumed and logged at WARN; every validation
/// failure after the SOH is a distinct [`FrameError`] kind and leaves the
/// stream positioned for another resync attempt.
pub fn read_event<R: Read>(r: &mut R) -> Result<Event, FrameError> {
    let mut skipped = 0usize;
    loop {
        let mut byte = [0u8; 1];
        r.read_exact(&mut byte).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                FrameError::NoSoh
            } else {
                FrameError::Io(e)
            }
        })?;
        if byte[0] == SOH {
            break;
        }
        skipped += 1;
        if skipped >= RESYNC_SCAN_LIMIT {
            return Err(FrameError::NoSoh);
        }
    }
    if skipped > 0 {
        log::warn!("frame resync: skipped {} bytes before SOH", skipped);
    }

    // header: id, ~id, extra, size_lo, size_hi, checksum
    let mut hdr = [0u8; 6];
    r.read_exact(&mut hdr).map_err(truncated)?;
    let raw_id = hdr[0];
    if hdr[1] != !raw_id {
        return Err(FrameError::HeaderIntegrity);
    }
    if hdr[5] != checksum(&hdr[..5]) {
        return Err(FrameError::HeaderIntegrity);
    }
    let extra = hdr[2];
    let size = u16::from_le_bytes([hdr[3], hdr[4]]);
    if size as usize > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooBig(size));
    }

    let mut payload = vec![0u8; size as usize];
    r.read_exact(&mut payload).map_err(truncated)?;
    let mut ck = [0u8; 1];
    r.read_exact(&mut ck).map_err(truncated)?;
    if ck[0] != checksum(&payload) {
        return Err(FrameError::PayloadChecksum);
    }

    // Payload is consumed before the id check so an unknown tag leaves the
    // stream aligned on the next frame.
    let id = EventId::try_from(raw_id)?;
    Event::decode(id, extra, &payload)
}

/// Writes one event as a single frame and flushes.
pub fn write_event<W: Write>(w: &mut W, event: &Event) -> Result<(), FrameError> {
    let mut payload = Vec::new();
    event.encode_payload(&mut payload);
    if payload.len() > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooBig(payload.len() as u16));
    }

    let mut frame = Vec::with_capacity(7 + payload.len() + 1);
    frame.push(SOH);
    let id = event.id() as u8;
    frame.push(id);
    frame.push(!id);
    frame.push(event.extra());
    frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.push(checksum(&frame[1..6]));
    frame.extend_from_slice(&payload);
    frame.push(checksum(&payload));

    w.write_all(&frame)?;
    w.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{AudioConf, StatusReport, WwConf, WwEntryStatus, WwMatch, WW_NAME_LEN};
    use std::io::Cursor;

    fn sample_events() -> Vec<Event> {
        vec![
            Event::Nop,
            Event::Status(None),
            Event::Status(Some(StatusReport {
                mode: 1,
                kind: 0,
                ready: 1,
                wakeword_mask: 0b101,
                frames: 1234,
                matches: 7,
            })),
            Event::Mode { mode: 2 },
            Event::Config(None),
            Event::Config(Some(AudioConf { preamp: 1.5, noiser: 2, autogain: 10, vad: 1 })),
            Event::Audio(vec![0x10, 0x20, 0x30]),
            Event::BAudio { vad: 0b1010_0000, pcm: vec![1, 2, 3, 4] },
            Event::Areset { refrac: 5 },
            Event::Reboot,
            Event::WwList { clear: true },
            Event::WwStatus(WwEntryStatus::new(
                "hey_mycroft",
                WwConf { index: 0, enabled: 1, threshold: 0.5, patience: 1 },
            )),
            Event::WwConf(WwConf { index: 3, enabled: 0, threshold: 0.72, patience: 2 }),
            Event::WwMatch(WwMatch { index: 1, score: 0.91, count: 3 }),
        ]
    }

    fn frame_bytes(event: &Event) -> Vec<u8> {
        let mut buf = Vec::new();
        write_event(&mut buf, event).unwrap();
        buf
    }

    #[test]
    fn round_trip_every_event() {
        for event in sample_events() {
            let bytes = frame_bytes(&event);
            let decoded = read_event(&mut Cursor::new(bytes)).unwrap();
            assert_eq!(decoded, event, "round trip mismatch for {:?}", event.id());
        }
    }

    #[test]
    fn single_bit_flip_is_rejected() {
        let reference = Event::Status(Some(StatusReport {
            mode: 1,
            kind: 0,
            ready: 1,
            wakeword_mask: 3,
            frames: 42,
            matches: 2,
        }));
        let bytes = frame_bytes(&reference);
        for byte_idx in 0..bytes.len() {
            for bit in 0..8 {
                let mut corrupted = bytes.clone();
                corrupted[byte_idx] ^= 1 << bit;
                match read_event(&mut Cursor::new(corrupted)) {
                    Ok(decoded) => panic!(
                        "flip of byte {} bit {} went undetected ({:?})",
                        byte_idx,
                        bit,
                        decoded.id()
                    ),
                    Err(_) => {}
                }
            }
        }
    }

    #[test]
    fn resyncs_over_leading_garbage() {
        let mut stream = vec![0x55u8; 32];
        stream.extend(frame_bytes(&Event::Status(None)));
        let decoded = read_event(&mut Cursor::new(stream)).unwrap();
        assert_eq!(decoded, Event::Status(None));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let mut frame = vec![SOH];
        let id = EventId::Audio as u8;
        frame.push(id);
        frame.push(!id);
        frame.push(0);
        frame.extend_from_slice(&(MAX_PAYLOAD as u16 + 1).to_le_bytes());
        let ck = checksum(&frame[1..6]);
        frame.push(ck);
        assert!(matches!(
            read_event(&mut Cursor::new(frame)),
            Err(FrameError::PayloadTooBig(_))
        ));
    }

    #[test]
    fn unknown_event_id_is_reported() {
        let mut frame = vec![SOH];
        frame.push(0x7f);
        frame.push(!0x7f);
        frame.push(0);
        frame.extend_from_slice(&0u16.to_le_bytes());
        let ck = checksum(&frame[1..6]);
        frame.push(ck);
        frame.push(0); // empty payload checksum
        assert!(matches!(
            read_event(&mut Cursor::new(frame)),
            Err(FrameError::UnknownEvent(0x7f))
        ));
    }

    #[test]
    fn truncated_frame_is_incomplete() {
        let bytes = frame_bytes(&Event::Audio(vec![0u8; 16]));
        let cut = &bytes[..bytes.len() - 4];
        assert!(matches!(
            read_event(&mut Cursor::new(cut.to_vec())),
            Err(FrameError::IncompleteEvent)
        ));
    }

    #[test]
    fn mismatched_fixed_payload_len() {
        // WwMatch advertising 5 bytes instead of 6.
        let payload = [1u8, 2, 3, 4, 5];
        let mut frame = vec![SOH];
        let id = EventId::WwMatch as u8;
        frame.push(id);
        frame.push(!id);
        frame.push(0);
        frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        let ck = checksum(&frame[1..6]);
        frame.push(ck);
        frame.extend_from_slice(&payload);
        frame.push(checksum(&payload));
        assert!(matches!(
            read_event(&mut Cursor::new(frame)),
            Err(FrameError::InvalidPayloadLen { .. })
        ));
    }

    #[test]
    fn ww_entry_name_truncates_to_32_bytes() {
        let long = "a".repeat(64);
        let entry = WwEntryStatus::new(&long, WwConf::default());
        assert_eq!(entry.name().len(), 32);
        assert_eq!(entry.name, {
            let mut expect = [0u8; WW_NAME_LEN];
            expect[..32].fill(b'a');
            expect
        });
    }
}
