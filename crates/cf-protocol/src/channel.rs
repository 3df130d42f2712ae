//! Virtual channel identifier type

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a virtual channel, unique within one tunnel connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(pub u32);

impl ChannelId {
    /// Create a new channel ID
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Whether this is the control channel
    pub fn is_control(&self) -> bool {
        *self == Self::CONTROL
    }

    /// Reserved channel for tunnel control traffic (handshake, heartbeats, presence)
    pub const CONTROL: ChannelId = ChannelId(0);
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel-{}", self.0)
    }
}

impl From<u32> for ChannelId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}
