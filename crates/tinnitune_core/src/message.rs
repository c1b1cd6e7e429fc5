//! Engine Events
//!
//! Events flow from the render thread and the engine to the host. The render
//! callback never logs; it reports through this channel instead.

use serde::{Deserialize, Serialize};

use crate::graph::UnitId;

/// Which protocol is currently playing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SoundKind {
    Tone,
    File,
    BandGap,
    Modulation,
}

/// Events sent from the engine to the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Event {
    /// Output opened and master chain built
    Initialized { sample_rate: f32, backend: String },

    /// A therapy sound became the active sound
    SoundStarted { kind: SoundKind },

    /// The active sound was torn down
    SoundStopped,

    /// A non-looping buffer source reached the end of its data
    SourceEnded { unit: UnitId },

    /// Output paused
    Suspended,

    /// Output restarted
    Resumed,

    /// Error occurred
    Error { message: String },
}

impl Event {
    /// Create an error event from any error type
    pub fn error<E: std::fmt::Display>(err: E) -> Self {
        Event::Error {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = Event::SoundStarted {
            kind: SoundKind::BandGap,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("SoundStarted"));
        assert!(json.contains("band_gap"));

        let deserialized: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, event);
    }

    #[test]
    fn test_error_event() {
        let event = Event::error("Test error message");
        if let Event::Error { message } = event {
            assert_eq!(message, "Test error message");
        } else {
            panic!("Should be Error variant");
        }
    }

    #[test]
    fn test_source_ended_serialization() {
        let event = Event::SourceEnded { unit: UnitId(42) };
        let json = serde_json::to_string(&event).unwrap();
        let deserialized: Event = serde_json::from_str(&json).unwrap();

        if let Event::SourceEnded { unit } = deserialized {
            assert_eq!(unit, UnitId(42));
        } else {
            panic!("Wrong variant");
        }
    }
}
