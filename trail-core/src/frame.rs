//! Voice/location demultiplexing over an unframed byte stream.
//!
//! The link carries raw audio and, now and then, a location record. There is no
//! length prefix and no escaping: a record is text wrapped in two marker words
//! and dropped between audio bytes.
//!
//! ```text
//! <audio>* start <location text> end <audio>* start ...
//! ```
//!
//! Audio is cut into chunks of exactly `buffer_size` bytes. Both peers must use
//! the same size; it is never exchanged on the wire.

use std::mem;

/// Marker word opening a location record.
pub const START_MARKER: &[u8] = b"start";

/// Marker word closing a location record.
pub const END_MARKER: &[u8] = b"end";

/// Longest capture (markers included) before it is given back to the audio stream.
pub const MAX_RECORD_LEN: usize = 4096;

/// One fixed-size block of received audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk(Vec<u8>);

impl AudioChunk {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for AudioChunk {
    fn from(bytes: Vec<u8>) -> Self {
        AudioChunk(bytes)
    }
}

/// A complete unit pulled out of the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Demuxed {
    /// Exactly `buffer_size` audio bytes, in arrival order.
    Audio(AudioChunk),
    /// Raw text found between the markers. Not validated here.
    Location(String),
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("audio buffer size must be non-zero")]
    ZeroBufferSize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Voice,
    MatchingStart,
    CapturingRecord,
}

/// Demultiplexing state for one session.
///
/// Feed bytes strictly in arrival order. Nothing is ever emitted out of order:
/// audio that precedes a record comes out before it, and bytes that only looked
/// like the start of a marker are handed back to the audio stream where they
/// were found.
#[derive(Debug)]
pub struct FrameCodec {
    buffer_size: usize,
    mode: Mode,
    /// Tentative match against `START_MARKER`.
    pending: Vec<u8>,
    /// Captured record, leading `START_MARKER` included.
    record: Vec<u8>,
    audio: Vec<u8>,
}

impl FrameCodec {
    pub fn new(buffer_size: usize) -> Result<Self, FrameError> {
        if buffer_size == 0 {
            return Err(FrameError::ZeroBufferSize);
        }
        Ok(Self {
            buffer_size,
            mode: Mode::Voice,
            pending: Vec::with_capacity(START_MARKER.len()),
            record: Vec::new(),
            audio: Vec::with_capacity(buffer_size),
        })
    }

    /// Drop all partial state and start over with a (possibly new) chunk size.
    pub fn reset(&mut self, buffer_size: usize) -> Result<(), FrameError> {
        if buffer_size == 0 {
            return Err(FrameError::ZeroBufferSize);
        }
        self.buffer_size = buffer_size;
        self.mode = Mode::Voice;
        self.pending.clear();
        self.record.clear();
        self.audio = Vec::with_capacity(buffer_size);
        Ok(())
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Consume one byte, appending any completed units to `out`.
    pub fn push(&mut self, byte: u8, out: &mut Vec<Demuxed>) {
        match self.mode {
            Mode::Voice => self.push_voice(byte, out),
            Mode::MatchingStart => {
                let expected = START_MARKER[self.pending.len()];
                // A byte repeating the previous one never extends the match.
                let repeats_last = self.pending.last() == Some(&byte);
                if byte == expected && !repeats_last {
                    self.pending.push(byte);
                    if self.pending.len() == START_MARKER.len() {
                        mem::swap(&mut self.pending, &mut self.record);
                        self.mode = Mode::CapturingRecord;
                    }
                } else {
                    self.mode = Mode::Voice;
                    self.flush_pending(out);
                    self.push_voice(byte, out);
                }
            }
            Mode::CapturingRecord => {
                self.record.push(byte);
                if self.record.ends_with(&END_MARKER[END_MARKER.len() - 2..]) {
                    self.finish_record(out);
                } else if self.record.len() > MAX_RECORD_LEN {
                    self.abandon_record(out);
                }
            }
        }
    }

    /// Consume a slice of bytes and return everything it completed.
    pub fn decode(&mut self, bytes: &[u8]) -> Vec<Demuxed> {
        let mut out = Vec::new();
        for &b in bytes {
            self.push(b, &mut out);
        }
        out
    }

    fn push_voice(&mut self, byte: u8, out: &mut Vec<Demuxed>) {
        if byte == START_MARKER[0] {
            self.pending.push(byte);
            self.mode = Mode::MatchingStart;
        } else {
            self.push_audio(byte, out);
        }
    }

    fn push_audio(&mut self, byte: u8, out: &mut Vec<Demuxed>) {
        self.audio.push(byte);
        if self.audio.len() == self.buffer_size {
            let chunk = mem::replace(&mut self.audio, Vec::with_capacity(self.buffer_size));
            out.push(Demuxed::Audio(AudioChunk(chunk)));
        }
    }

    fn flush_pending(&mut self, out: &mut Vec<Demuxed>) {
        let pending = mem::take(&mut self.pending);
        for &b in &pending {
            self.push_audio(b, out);
        }
        self.pending = pending;
        self.pending.clear();
    }

    fn finish_record(&mut self, out: &mut Vec<Demuxed>) {
        let body_end = self
            .record
            .len()
            .saturating_sub(END_MARKER.len())
            .max(START_MARKER.len());
        let text = String::from_utf8_lossy(&self.record[START_MARKER.len()..body_end]).into_owned();
        self.record.clear();
        self.mode = Mode::Voice;
        if !text.is_empty() {
            out.push(Demuxed::Location(text));
        }
    }

    fn abandon_record(&mut self, out: &mut Vec<Demuxed>) {
        let record = mem::take(&mut self.record);
        self.mode = Mode::Voice;
        for &b in &record {
            self.push_audio(b, out);
        }
    }
}

/// Wrap location text with the marker words, ready to be written to the link.
pub fn encode_location_record(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(START_MARKER.len() + text.len() + END_MARKER.len());
    out.extend_from_slice(START_MARKER);
    out.extend_from_slice(text.as_bytes());
    out.extend_from_slice(END_MARKER);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio_bytes(items: &[Demuxed]) -> Vec<u8> {
        items
            .iter()
            .filter_map(|d| match d {
                Demuxed::Audio(chunk) => Some(chunk.as_bytes().to_vec()),
                Demuxed::Location(_) => None,
            })
            .flatten()
            .collect()
    }

    fn records(items: &[Demuxed]) -> Vec<String> {
        items
            .iter()
            .filter_map(|d| match d {
                Demuxed::Location(text) => Some(text.clone()),
                Demuxed::Audio(_) => None,
            })
            .collect()
    }

    #[test]
    fn rejects_zero_buffer_size() {
        assert!(matches!(FrameCodec::new(0), Err(FrameError::ZeroBufferSize)));
        let mut codec = FrameCodec::new(4).unwrap();
        assert!(codec.reset(0).is_err());
        assert_eq!(codec.buffer_size(), 4);
    }

    #[test]
    fn plain_audio_is_cut_into_fixed_chunks() {
        let input: Vec<u8> = (0u8..=99).filter(|b| *b != b's').collect();
        let mut codec = FrameCodec::new(16).unwrap();
        let out = codec.decode(&input);

        assert_eq!(out.len(), input.len() / 16);
        for item in &out {
            match item {
                Demuxed::Audio(chunk) => assert_eq!(chunk.len(), 16),
                Demuxed::Location(_) => panic!("no record expected"),
            }
        }
        let full = input.len() / 16 * 16;
        assert_eq!(audio_bytes(&out), input[..full].to_vec());
    }

    #[test]
    fn partial_chunk_is_withheld_until_full() {
        let mut codec = FrameCodec::new(8).unwrap();
        assert!(codec.decode(b"abcde").is_empty());
        let out = codec.decode(b"fgh");
        assert_eq!(audio_bytes(&out), b"abcdefgh".to_vec());
    }

    #[test]
    fn audio_with_lone_marker_letters_passes_through() {
        // Contains 's', "st", "sta" and "star", none of which complete the marker.
        let input = b"sun stop stable stark 1234".to_vec();
        let mut codec = FrameCodec::new(input.len()).unwrap();
        let out = codec.decode(&input);
        assert!(records(&out).is_empty());
        assert_eq!(audio_bytes(&out), input);
    }

    #[test]
    fn record_between_audio_runs() {
        let text = r#"{"latitude":55.75,"longitude":37.61}"#;
        let mut input = b"0123456789".to_vec();
        input.extend_from_slice(&encode_location_record(text));
        input.extend_from_slice(b"ABCDEFGHIJ");

        let mut codec = FrameCodec::new(5).unwrap();
        let out = codec.decode(&input);

        assert_eq!(out.len(), 5);
        assert_eq!(out[0], Demuxed::Audio(b"01234".to_vec().into()));
        assert_eq!(out[1], Demuxed::Audio(b"56789".to_vec().into()));
        assert_eq!(out[2], Demuxed::Location(text.to_string()));
        assert_eq!(out[3], Demuxed::Audio(b"ABCDE".to_vec().into()));
        assert_eq!(out[4], Demuxed::Audio(b"FGHIJ".to_vec().into()));
    }

    #[test]
    fn record_completes_a_partial_chunk_afterwards() {
        let mut input = b"abc".to_vec();
        input.extend_from_slice(&encode_location_record("{}"));
        input.extend_from_slice(b"d");

        let mut codec = FrameCodec::new(4).unwrap();
        let out = codec.decode(&input);
        assert_eq!(
            out,
            vec![
                Demuxed::Location("{}".to_string()),
                Demuxed::Audio(b"abcd".to_vec().into()),
            ]
        );
    }

    #[test]
    fn diverging_prefix_is_flushed_in_order() {
        let mut codec = FrameCodec::new(6).unwrap();
        let out = codec.decode(b"xstaX!");
        assert_eq!(out, vec![Demuxed::Audio(b"xstaX!".to_vec().into())]);
    }

    #[test]
    fn flush_crossing_chunk_boundary_keeps_order() {
        let mut codec = FrameCodec::new(4).unwrap();
        let out = codec.decode(b"abcstax");
        assert_eq!(out, vec![Demuxed::Audio(b"abcs".to_vec().into())]);
        let out = codec.decode(b"y");
        assert_eq!(out, vec![Demuxed::Audio(b"taxy".to_vec().into())]);
    }

    #[test]
    fn repeated_first_letter_restarts_match() {
        let mut input = b"s".to_vec();
        input.extend_from_slice(&encode_location_record("{}"));
        input.extend_from_slice(b"zzz");

        let mut codec = FrameCodec::new(4).unwrap();
        let out = codec.decode(&input);
        assert_eq!(
            out,
            vec![
                Demuxed::Location("{}".to_string()),
                Demuxed::Audio(b"szzz".to_vec().into()),
            ]
        );
    }

    #[test]
    fn marker_like_bytes_inside_record_are_captured() {
        let mut codec = FrameCodec::new(64).unwrap();
        let out = codec.decode(b"startstart-startend");
        assert_eq!(records(&out), vec!["start-start".to_string()]);
    }

    #[test]
    fn record_closes_on_last_two_end_letters() {
        // "found" ends in "nd", which closes the record early; the rest is audio.
        let mut codec = FrameCodec::new(3).unwrap();
        let out = codec.decode(b"startfoundend");
        assert_eq!(
            out,
            vec![
                Demuxed::Location("fo".to_string()),
                Demuxed::Audio(b"end".to_vec().into()),
            ]
        );
    }

    #[test]
    fn empty_record_is_not_emitted() {
        let mut codec = FrameCodec::new(4).unwrap();
        assert!(codec.decode(b"startend").is_empty());
        assert!(codec.decode(b"startnd").is_empty());
    }

    #[test]
    fn runaway_capture_returns_to_audio() {
        let mut input = START_MARKER.to_vec();
        input.extend(std::iter::repeat(b'x').take(MAX_RECORD_LEN));
        let mut codec = FrameCodec::new(input.len()).unwrap();
        let out = codec.decode(&input);
        assert_eq!(out, vec![Demuxed::Audio(input.clone().into())]);
    }

    #[test]
    fn reset_discards_partial_state() {
        let mut codec = FrameCodec::new(4).unwrap();
        assert!(codec.decode(b"ab").is_empty());
        assert!(codec.decode(b"startpartial").is_empty());
        codec.reset(2).unwrap();
        let out = codec.decode(b"nd12");
        assert_eq!(
            out,
            vec![
                Demuxed::Audio(b"nd".to_vec().into()),
                Demuxed::Audio(b"12".to_vec().into()),
            ]
        );
    }

    #[test]
    fn encode_wraps_text_with_markers() {
        assert_eq!(encode_location_record("{\"a\":1}"), b"start{\"a\":1}end".to_vec());
        assert_eq!(encode_location_record(""), b"startend".to_vec());
    }
}
