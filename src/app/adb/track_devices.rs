//! Framing for the `adb track-devices` stream.
//!
//! Every message is a four character ASCII hex length followed by that many
//! bytes of `SERIAL\tSTATUS` lines. `0000` is an explicit empty snapshot.

use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEVICES_HEADER: &str = "List of devices attached";
pub const LENGTH_HEADER_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackedStatus {
    pub serial: String,
    pub status: String,
}

impl TrackedStatus {
    pub fn new(serial: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            status: status.into(),
        }
    }
}

/// Ordered (serial, status) pairs with one entry per serial.
pub type TrackSnapshot = Vec<TrackedStatus>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedFrame {
    Snapshot(TrackSnapshot),
    /// The length header was not four hex digits; it has been discarded.
    Malformed(String),
}

/// Reassembles frames from arbitrarily split reads.
#[derive(Debug, Default)]
pub struct TrackFrameDecoder {
    buffer: Vec<u8>,
}

impl TrackFrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes of an incomplete frame are waiting for more input.
    pub fn has_partial_frame(&self) -> bool {
        !self.buffer.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn next_frame(&mut self) -> Option<DecodedFrame> {
        if self.buffer.len() < LENGTH_HEADER_LEN {
            return None;
        }
        let header = &self.buffer[..LENGTH_HEADER_LEN];
        let Some(length) = parse_length_header(header) else {
            let raw = String::from_utf8_lossy(header).into_owned();
            self.buffer.drain(..LENGTH_HEADER_LEN);
            return Some(DecodedFrame::Malformed(raw));
        };
        let frame_end = LENGTH_HEADER_LEN + length;
        if self.buffer.len() < frame_end {
            return None;
        }
        let payload = String::from_utf8_lossy(&self.buffer[LENGTH_HEADER_LEN..frame_end]).into_owned();
        self.buffer.drain(..frame_end);
        Some(DecodedFrame::Snapshot(parse_track_payload(&payload)))
    }
}

fn parse_length_header(header: &[u8]) -> Option<usize> {
    if header.len() != LENGTH_HEADER_LEN || !header.iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    let text = std::str::from_utf8(header).ok()?;
    usize::from_str_radix(text, 16).ok()
}

/// Later lines for the same serial overwrite its status in place, so the
/// order is that of first appearance and the value is the last one seen.
pub fn parse_track_payload(payload: &str) -> TrackSnapshot {
    let mut snapshot: TrackSnapshot = Vec::new();
    for line in payload.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.contains(DEVICES_HEADER) {
            continue;
        }
        let mut tokens = trimmed.split_whitespace();
        let (Some(serial), status) = (tokens.next(), tokens.next().unwrap_or("")) else {
            continue;
        };
        match snapshot.iter_mut().find(|entry| entry.serial == serial) {
            Some(entry) => entry.status = status.to_string(),
            None => snapshot.push(TrackedStatus::new(serial, status)),
        }
    }
    snapshot
}

/// Decoder plus duplicate suppression: a snapshot is surfaced only when it
/// differs from the last one surfaced.
#[derive(Debug, Default)]
pub struct TrackDevicesStreamParser {
    decoder: TrackFrameDecoder,
    last_emitted: Option<TrackSnapshot>,
}

impl TrackDevicesStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, bytes: &[u8], trace_id: &str) -> Vec<TrackSnapshot> {
        self.decoder.extend(bytes);
        let mut emitted = Vec::new();
        while let Some(frame) = self.decoder.next_frame() {
            match frame {
                DecodedFrame::Snapshot(snapshot) => {
                    if self.last_emitted.as_ref() == Some(&snapshot) {
                        continue;
                    }
                    self.last_emitted = Some(snapshot.clone());
                    emitted.push(snapshot);
                }
                DecodedFrame::Malformed(header) => {
                    warn!(trace_id = %trace_id, header = %header.escape_debug(), "skipping malformed track-devices length header");
                }
            }
        }
        emitted
    }

    /// Drops any half-read frame; dedup state survives a new stream.
    pub fn reset_stream(&mut self) -> bool {
        let had_partial = self.decoder.has_partial_frame();
        self.decoder.clear();
        had_partial
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(payload: &str) -> Vec<u8> {
        let mut bytes = format!("{:04x}", payload.len()).into_bytes();
        bytes.extend_from_slice(payload.as_bytes());
        bytes
    }

    fn status(serial: &str, status: &str) -> TrackedStatus {
        TrackedStatus::new(serial, status)
    }

    #[test]
    fn parses_consecutive_frames_including_empty() {
        let mut stream = chunk("35151FDJH000GQ\tdevice\n");
        stream.extend(chunk("35151FDJH000GQ\toffline\n"));
        stream.extend_from_slice(b"0000");

        let mut parser = TrackDevicesStreamParser::new();
        let snapshots = parser.push_bytes(&stream, "trace");
        assert_eq!(
            snapshots,
            vec![
                vec![status("35151FDJH000GQ", "device")],
                vec![status("35151FDJH000GQ", "offline")],
                vec![],
            ]
        );
    }

    #[test]
    fn reassembles_frames_split_at_every_boundary() {
        let frame = b"000BdevA\tdevice".to_vec();
        for first_cut in 1..frame.len() {
            for second_cut in first_cut..frame.len() {
                let mut parser = TrackDevicesStreamParser::new();
                let mut snapshots = parser.push_bytes(&frame[..first_cut], "trace");
                snapshots.extend(parser.push_bytes(&frame[first_cut..second_cut], "trace"));
                snapshots.extend(parser.push_bytes(&frame[second_cut..], "trace"));
                assert_eq!(snapshots, vec![vec![status("devA", "device")]]);
            }
        }
    }

    #[test]
    fn last_occurrence_wins_within_a_frame() {
        let mut parser = TrackDevicesStreamParser::new();
        let snapshots = parser.push_bytes(&chunk("devA\tdevice\ndevA\toffline\n"), "trace");
        assert_eq!(snapshots, vec![vec![status("devA", "offline")]]);
    }

    #[test]
    fn keeps_first_appearance_order() {
        let snapshot = parse_track_payload(
            "List of devices attached\nB\tdevice\nA\tunauthorized\nB\toffline\n",
        );
        assert_eq!(snapshot, vec![status("B", "offline"), status("A", "unauthorized")]);
    }

    #[test]
    fn suppresses_duplicate_consecutive_snapshots() {
        let mut parser = TrackDevicesStreamParser::new();
        let mut stream = chunk("A\tdevice\n");
        stream.extend(chunk("A\tdevice\n"));
        stream.extend(chunk("A\tdevice\nA\tdevice\n"));
        assert_eq!(parser.push_bytes(&stream, "trace").len(), 1);

        // Across a restarted stream as well.
        parser.reset_stream();
        assert!(parser.push_bytes(&chunk("A\tdevice\n"), "trace").is_empty());
        assert_eq!(parser.push_bytes(&chunk("A\toffline\n"), "trace").len(), 1);
    }

    #[test]
    fn malformed_header_is_skipped() {
        let mut stream = b"zz!?".to_vec();
        stream.extend(chunk("A\tdevice\n"));
        let mut parser = TrackDevicesStreamParser::new();
        assert_eq!(parser.push_bytes(&stream, "trace"), vec![vec![status("A", "device")]]);
    }

    #[test]
    fn plus_sign_is_not_a_hex_digit() {
        let mut decoder = TrackFrameDecoder::new();
        decoder.extend(b"+00A");
        assert_eq!(decoder.next_frame(), Some(DecodedFrame::Malformed("+00A".to_string())));
        assert!(!decoder.has_partial_frame());
    }

    #[test]
    fn reports_partial_frame_on_reset() {
        let mut parser = TrackDevicesStreamParser::new();
        assert!(parser.push_bytes(b"0010devA", "trace").is_empty());
        assert!(parser.reset_stream());
        assert!(!parser.reset_stream());
    }

    #[test]
    fn first_empty_snapshot_is_emitted() {
        let mut parser = TrackDevicesStreamParser::new();
        assert_eq!(parser.push_bytes(b"0000", "trace"), vec![Vec::<TrackedStatus>::new()]);
        assert!(parser.push_bytes(b"0000", "trace").is_empty());
    }
}
