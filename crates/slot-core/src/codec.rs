//! Task payload encoding for the built-in executors.
//!
//! Payloads travel through the core as opaque bytes; only executors and
//! the code that builds task specs look inside them.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Todo;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("payload encode failed: {0}")]
    Encode(String),

    #[error("payload decode failed: {0}")]
    Decode(String),
}

/// Payload for the sleep executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SleepPayload {
    pub duration_ms: u64,
}

/// Payload for the scaling executor: run a nested session of `todo`
/// tasks against `master`.
///
/// Without `next` the nested tasks sleep for `duration_ms`. With it they
/// are scaling tasks themselves and open one more level below.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NestedPayload {
    pub master: String,
    pub todo: Todo,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<Box<NestedPayload>>,
}

impl SleepPayload {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration_ms: duration.as_millis() as u64,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

impl NestedPayload {
    pub fn new(master: impl Into<String>, todo: Todo, duration: Duration) -> Self {
        Self {
            master: master.into(),
            todo,
            duration_ms: duration.as_millis() as u64,
            next: None,
        }
    }

    /// Nest one more level below this one.
    pub fn with_next(mut self, next: NestedPayload) -> Self {
        self.next = Some(Box::new(next));
        self
    }

    /// Levels of nesting this payload describes, itself included.
    pub fn depth(&self) -> usize {
        1 + self.next.as_ref().map_or(0, |next| next.depth())
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

pub fn encode<T: Serialize>(payload: &T) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(payload).map_err(|e| CodecError::Encode(e.to_string()))
}

pub fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, CodecError> {
    serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_payload_keeps_unbounded_sentinel() {
        let payload = NestedPayload::new("sub", Todo::Unbounded, Duration::from_millis(10));
        let bytes = encode(&payload).unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains("\"todo\":-1"));
        assert!(!text.contains("next"));
        assert_eq!(decode::<NestedPayload>(&bytes).unwrap(), payload);
    }

    #[test]
    fn nested_payload_carries_lower_levels() {
        let payload = NestedPayload::new("a", Todo::Bounded(2), Duration::from_millis(1))
            .with_next(NestedPayload::new("b", Todo::Bounded(3), Duration::from_millis(1)));
        assert_eq!(payload.depth(), 2);

        let decoded: NestedPayload = decode(&encode(&payload).unwrap()).unwrap();
        let next = decoded.next.unwrap();
        assert_eq!(next.master, "b");
        assert_eq!(next.todo, Todo::Bounded(3));
        assert!(next.next.is_none());
    }

    #[test]
    fn sleep_payload_is_not_a_nested_payload() {
        let bytes = encode(&SleepPayload::new(Duration::from_secs(1))).unwrap();
        assert!(decode::<NestedPayload>(&bytes).is_err());
    }

    #[test]
    fn garbage_fails_to_decode() {
        assert!(matches!(
            decode::<SleepPayload>(b"\x00\x01"),
            Err(CodecError::Decode(_))
        ));
    }
}
