use super::ChannelState;
use crate::config::ChannelConfig;
use crate::error::{Result, ShmRpcError};
use crate::platform::shm::round_to_page_power;
use crate::platform::ShmSegment;
use tracing::debug;

/// A named shared memory segment carrying one request or response.
///
/// Byte 0 is the state byte; the frame follows. Only the side whose turn
/// it is (and who holds the connection lock) touches the payload.
#[derive(Debug)]
pub struct Channel {
    segment: ShmSegment,
}

impl Channel {
    /// Create a segment of at least `min_size` bytes in the client's turn.
    ///
    /// Any existing segment of that name is unlinked first; processes still
    /// mapping it keep their (now orphaned) view.
    pub fn create(name: &str, min_size: usize) -> Result<Self> {
        let mut segment = ShmSegment::create(name, round_to_page_power(min_size), false)?;
        segment.as_mut_slice()[0] = ChannelConfig::STATE_CLIENT_TURN;
        debug!("Created channel {} ({} bytes)", name, segment.len());
        Ok(Self { segment })
    }

    /// Attach to an existing segment; the capacity is whatever the OS reports.
    pub fn connect(name: &str) -> Result<Self> {
        Ok(Self {
            segment: ShmSegment::open(name)?,
        })
    }

    /// Attach, creating the segment if it does not exist yet.
    ///
    /// Returns whether it was created. Callers must serialize this through a
    /// lock, otherwise two creators could race.
    pub fn connect_or_create(name: &str, min_size: usize) -> Result<(Self, bool)> {
        match Self::connect(name) {
            Ok(channel) => Ok((channel, false)),
            Err(ShmRpcError::NoSuchChannel { .. }) => Ok((Self::create(name, min_size)?, true)),
            Err(e) => Err(e),
        }
    }

    /// Unlink a channel by name, flagging it invalid for anyone still attached.
    pub fn remove(name: &str) -> Result<bool> {
        if let Ok(mut channel) = Self::connect(name) {
            channel.set_state(ChannelState::Invalid);
        }
        ShmSegment::unlink(name)
    }

    pub fn exists(name: &str) -> bool {
        ShmSegment::exists(name)
    }

    pub fn name(&self) -> &str {
        self.segment.name()
    }

    /// Total segment size, state byte included.
    pub fn capacity(&self) -> usize {
        self.segment.len()
    }

    /// Whether a frame of `frame_len` bytes fits after the state byte.
    pub fn fits(&self, frame_len: usize) -> bool {
        ChannelConfig::PAYLOAD_OFFSET + frame_len <= self.capacity()
    }

    pub fn state_byte(&self) -> u8 {
        self.segment.as_slice()[0]
    }

    pub fn state(&self) -> Result<ChannelState> {
        let byte = self.state_byte();
        ChannelState::from_byte(byte).ok_or_else(|| {
            ShmRpcError::protocol(format!(
                "unknown state byte {:#04x} in channel {}",
                byte,
                self.name()
            ))
        })
    }

    pub fn set_state(&mut self, state: ChannelState) {
        self.segment.as_mut_slice()[0] = state.as_byte();
    }

    pub fn payload(&self) -> &[u8] {
        &self.segment.as_slice()[ChannelConfig::PAYLOAD_OFFSET..]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.segment.as_mut_slice()[ChannelConfig::PAYLOAD_OFFSET..]
    }

    /// Replace this segment with a larger one under the same name.
    ///
    /// The new capacity holds at least 1.5 x `min_size`. The state byte is
    /// carried over and the old segment is flagged `Invalid`, which sends the
    /// peer through [`Channel::reconnect`]. The payload is not copied.
    pub fn resize(&mut self, min_size: usize) -> Result<()> {
        let old_capacity = self.capacity();
        let target = (min_size * ChannelConfig::GROWTH_NUMERATOR)
            .div_ceil(ChannelConfig::GROWTH_DENOMINATOR);
        let new_capacity = round_to_page_power(target);
        if new_capacity <= old_capacity {
            return Err(ShmRpcError::ResizeDidNotGrow {
                name: self.name().to_string(),
                old: old_capacity,
                new: new_capacity,
            });
        }

        let name = self.name().to_string();
        let state = self.state_byte();
        let mut segment = ShmSegment::create(&name, new_capacity, false)?;
        segment.as_mut_slice()[0] = state;

        self.set_state(ChannelState::Invalid);
        self.segment = segment;
        debug!(
            "Resized channel {} from {} to {} bytes",
            name, old_capacity, new_capacity
        );
        Ok(())
    }

    /// Re-attach after observing `Invalid`.
    ///
    /// The peer resized, so the segment found under the name must be strictly
    /// larger than the one we had.
    pub fn reconnect(&mut self) -> Result<()> {
        let fresh = Self::connect(self.name())?;
        if fresh.capacity() <= self.capacity() {
            return Err(ShmRpcError::ResizeDidNotGrow {
                name: self.name().to_string(),
                old: self.capacity(),
                new: fresh.capacity(),
            });
        }
        debug!(
            "Reconnected channel {} ({} -> {} bytes)",
            self.name(),
            self.capacity(),
            fresh.capacity()
        );
        *self = fresh;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::page_size;
    use crate::test_support::unique_name;

    #[test]
    fn test_create_rounds_to_page_power() {
        let name = unique_name("chan");
        let page = page_size();
        let channel = Channel::create(&name, page + 1).unwrap();
        assert_eq!(channel.capacity(), page * 2);
        assert_eq!(channel.state().unwrap(), ChannelState::ClientTurn);
        Channel::remove(&name).unwrap();
    }

    #[test]
    fn test_connect_reads_actual_size() {
        let name = unique_name("size");
        let created = Channel::create(&name, 10_000).unwrap();
        let connected = Channel::connect(&name).unwrap();
        assert_eq!(connected.capacity(), created.capacity());
        Channel::remove(&name).unwrap();
    }

    #[test]
    fn test_resize_grows_and_invalidates_old() {
        let name = unique_name("resize");
        let mut owner = Channel::create(&name, 4096).unwrap();
        let mut peer = Channel::connect(&name).unwrap();
        owner.set_state(ChannelState::ServerTurn);
        let before = owner.capacity();

        owner.resize(100_000).unwrap();
        assert!(owner.capacity() >= 150_000);
        assert!(owner.capacity() > before);
        assert_eq!(owner.state().unwrap(), ChannelState::ServerTurn);

        assert_eq!(peer.state().unwrap(), ChannelState::Invalid);
        peer.reconnect().unwrap();
        assert_eq!(peer.capacity(), owner.capacity());
        assert_eq!(peer.state().unwrap(), ChannelState::ServerTurn);
        Channel::remove(&name).unwrap();
    }

    #[test]
    fn test_resize_must_grow() {
        let name = unique_name("nogrow");
        let mut channel = Channel::create(&name, 65_536).unwrap();
        let err = channel.resize(16).unwrap_err();
        assert!(matches!(err, ShmRpcError::ResizeDidNotGrow { .. }));
        // Failed resize leaves the channel usable
        assert_eq!(channel.state().unwrap(), ChannelState::ClientTurn);
        Channel::remove(&name).unwrap();
    }

    #[test]
    fn test_reconnect_without_growth_is_rejected() {
        let name = unique_name("stuck");
        let mut channel = Channel::create(&name, 4096).unwrap();
        let err = channel.reconnect().unwrap_err();
        assert!(matches!(err, ShmRpcError::ResizeDidNotGrow { .. }));
        Channel::remove(&name).unwrap();
    }

    #[test]
    fn test_remove_invalidates_attached_views() {
        let name = unique_name("remove");
        let mut attached = Channel::create(&name, 4096).unwrap();
        assert!(Channel::remove(&name).unwrap());
        assert_eq!(attached.state().unwrap(), ChannelState::Invalid);
        assert!(matches!(
            attached.reconnect(),
            Err(ShmRpcError::NoSuchChannel { .. })
        ));
        assert!(!Channel::exists(&name));
    }
}
