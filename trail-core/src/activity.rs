//! Half-duplex turn-taking.
//!
//! The local side may only talk once the peer has been quiet for longer than
//! the silence threshold. The monitor is clocked by the caller, so it never
//! reads the system time itself.

use std::time::{Duration, Instant};

pub const DEFAULT_SILENCE_THRESHOLD: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TalkState {
    /// The peer is (or was recently) talking.
    Busy,
    /// The channel is quiet; local capture may be sent.
    CanTalk,
}

impl TalkState {
    pub fn can_talk(self) -> bool {
        matches!(self, TalkState::CanTalk)
    }
}

#[derive(Debug, Clone)]
pub struct TransmissionMonitor {
    silence_threshold: Duration,
    last_audio: Instant,
}

impl TransmissionMonitor {
    /// Starts out as if audio had just been heard at `now`.
    pub fn new(silence_threshold: Duration, now: Instant) -> Self {
        Self {
            silence_threshold,
            last_audio: now,
        }
    }

    pub fn silence_threshold(&self) -> Duration {
        self.silence_threshold
    }

    pub fn last_audio(&self) -> Instant {
        self.last_audio
    }

    /// Note an incoming audio chunk. Talking is blocked from here on.
    pub fn record_audio(&mut self, at: Instant) -> TalkState {
        if at > self.last_audio {
            self.last_audio = at;
        }
        TalkState::Busy
    }

    /// CanTalk only when strictly more than the threshold has passed.
    pub fn poll(&self, now: Instant) -> TalkState {
        if now.saturating_duration_since(self.last_audio) > self.silence_threshold {
            TalkState::CanTalk
        } else {
            TalkState::Busy
        }
    }
}
