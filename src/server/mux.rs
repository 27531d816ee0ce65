//! Per-connection channel bookkeeping.
//!
//! Decides which channel opens are accepted and which in-channel request starts
//! the session handler, independent of the SSH library's callback shapes.

use std::collections::HashMap;
use std::hash::Hash;

pub const SESSION_CHANNEL: &str = "session";
pub const SHELL_REQUEST: &str = "shell";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOpen {
    Accepted,
    /// Refused as an unknown channel type.
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Acknowledge the request and start the session handler.
    StartSession,
    /// Leave the request unanswered.
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Open,
    SessionStarted,
}

/// Tracks the open channels of one connection.
#[derive(Debug)]
pub struct ChannelMux<K> {
    slots: HashMap<K, Slot>,
}

impl<K> Default for ChannelMux<K> {
    fn default() -> Self {
        Self {
            slots: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash> ChannelMux<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self, id: K, channel_type: &str) -> ChannelOpen {
        if channel_type != SESSION_CHANNEL {
            return ChannelOpen::Rejected;
        }
        self.slots.insert(id, Slot::Open);
        ChannelOpen::Accepted
    }

    /// Only the first `shell` request on an open channel starts a session.
    pub fn request(&mut self, id: &K, request_type: &str) -> Dispatch {
        match self.slots.get_mut(id) {
            Some(slot) if *slot == Slot::Open && request_type == SHELL_REQUEST => {
                *slot = Slot::SessionStarted;
                Dispatch::StartSession
            }
            _ => Dispatch::Ignore,
        }
    }

    pub fn close(&mut self, id: &K) -> bool {
        self.slots.remove(id).is_some()
    }

    pub fn open_channels(&self) -> usize {
        self.slots.len()
    }

    pub fn active_sessions(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| **slot == Slot::SessionStarted)
            .count()
    }
}
