//! Echo suppression.
//!
//! Room fan-out delivers every broadcast back to its originator. Applying our
//! own echo would overwrite in-flight local edits with stale content, so any
//! event stamped with our [`ClientId`] is dropped here before it reaches the
//! engine.

use crate::protocol::{ClientId, ServerEvent};

pub struct EchoFilter {
    own: ClientId,
    dropped: u64,
}

impl EchoFilter {
    pub fn new(own: ClientId) -> Self {
        Self { own, dropped: 0 }
    }

    /// Returns `true` when the event came from someone else.
    pub fn admit(&mut self, event: &ServerEvent) -> bool {
        match event.origin() {
            Some(origin) if origin == self.own => {
                self.dropped += 1;
                log::trace!("dropping echoed {}", event.name());
                false
            }
            _ => true,
        }
    }

    pub fn own(&self) -> ClientId {
        self.own
    }

    /// Number of echoes dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
