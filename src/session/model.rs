//! # Session Data Model
//!
//! Turns, the append-only transcript, audio chunks and the audio format state.
//!
//! ## Transcript ordering:
//! Turns are stored in arrival order, not conversation order. Recognized speech,
//! typed text and assistant transcripts interleave exactly as their events arrive.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attributed utterance. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    pub ts: DateTime<Utc>,
}

/// Append-only, lock-protected list of turns.
///
/// ## Thread Safety:
/// Two tasks append (the ingress reader and the event relay), the coordinator reads
/// snapshots. A single mutex makes every append atomic with respect to the others
/// and keeps timestamps non-decreasing.
#[derive(Debug, Default)]
pub struct Transcript {
    turns: Mutex<Vec<Turn>>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a turn with trimmed text, returning it, or `None` when nothing is left
    /// after trimming.
    ///
    /// The timestamp is the capture time, clamped so it never goes backwards
    /// relative to the previous turn.
    pub fn append(&self, role: Role, text: &str) -> Option<Turn> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        let mut turns = self.turns.lock();
        let now = Utc::now();
        let ts = match turns.last() {
            Some(last) if last.ts > now => last.ts,
            _ => now,
        };

        let turn = Turn {
            role,
            text: text.to_string(),
            ts,
        };
        turns.push(turn.clone());
        Some(turn)
    }

    /// Copy of every turn so far, in arrival order.
    pub fn snapshot(&self) -> Vec<Turn> {
        self.turns.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.turns.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.lock().is_empty()
    }
}

/// How the client prefers to ship audio. Informational; both paths are always accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AudioTransport {
    #[default]
    Auto,
    Binary,
    Base64,
}

impl AudioTransport {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "auto" => Some(AudioTransport::Auto),
            "binary" => Some(AudioTransport::Binary),
            "base64" => Some(AudioTransport::Base64),
            _ => None,
        }
    }
}

/// Format state of a session's inbound audio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub mime: String,
    pub transport: AudioTransport,
}

impl AudioFormat {
    pub fn new(mime: impl Into<String>) -> Self {
        Self {
            mime: mime.into(),
            transport: AudioTransport::Auto,
        }
    }

    pub fn is_pcm(&self) -> bool {
        self.mime.contains("audio/pcm")
    }
}

/// One queued piece of audio, tagged with the format active when it was enqueued.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub data: Vec<u8>,
    pub mime: String,
}

/// Lifecycle of a session.
///
/// ## State Transitions:
/// Active → Ending (teardown started) → Closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    Active,
    Ending,
    Closed,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Active => "active",
            SessionPhase::Ending => "ending",
            SessionPhase::Closed => "closed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_skips_blank_text() {
        let transcript = Transcript::new();
        assert!(transcript.append(Role::User, "   ").is_none());
        assert!(transcript.append(Role::User, "").is_none());
        assert!(transcript.is_empty());
    }

    #[test]
    fn test_timestamps_never_go_backwards() {
        let transcript = Transcript::new();
        for i in 0..50 {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            transcript.append(role, &format!("turn {}", i));
        }

        let turns = transcript.snapshot();
        assert_eq!(turns.len(), 50);
        assert!(turns.windows(2).all(|pair| pair[0].ts <= pair[1].ts));
        assert_eq!(turns[3].text, "turn 3");
        assert_eq!(turns[3].role, Role::Assistant);
    }

    #[test]
    fn test_concurrent_appends_are_all_kept() {
        let transcript = std::sync::Arc::new(Transcript::new());
        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let transcript = transcript.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        transcript.append(Role::User, &format!("{}-{}", worker, i));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(transcript.len(), 400);
    }

    #[test]
    fn test_audio_transport_parse() {
        assert_eq!(AudioTransport::parse("binary"), Some(AudioTransport::Binary));
        assert_eq!(AudioTransport::parse("base64"), Some(AudioTransport::Base64));
        assert_eq!(AudioTransport::parse("carrier-pigeon"), None);
    }
}
