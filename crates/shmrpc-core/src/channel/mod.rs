//! Shared memory message channels.
//!
//! One [`Channel`] per connection carries a single in-flight request or
//! response. The first byte says whose turn it is; a segment that is too
//! small is replaced by a larger one under the same name and the old one is
//! flagged [`ChannelState::Invalid`].

pub mod frame;
mod segment;

pub use frame::{Request, Response, Status};
pub use segment::Channel;

use crate::config::ChannelConfig;

/// Value of a channel's state byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// The client may write a request (or read the response).
    ClientTurn,
    /// A request is waiting for the server.
    ServerTurn,
    /// The segment was replaced; reconnect by name.
    Invalid,
}

impl ChannelState {
    pub fn as_byte(self) -> u8 {
        match self {
            ChannelState::ClientTurn => ChannelConfig::STATE_CLIENT_TURN,
            ChannelState::ServerTurn => ChannelConfig::STATE_SERVER_TURN,
            ChannelState::Invalid => ChannelConfig::STATE_INVALID,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            ChannelConfig::STATE_CLIENT_TURN => Some(ChannelState::ClientTurn),
            ChannelConfig::STATE_SERVER_TURN => Some(ChannelState::ServerTurn),
            ChannelConfig::STATE_INVALID => Some(ChannelState::Invalid),
            _ => None,
        }
    }
}
