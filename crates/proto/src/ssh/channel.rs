//! Channel state and multiplexing (RFC 4254 Section 5).
//!
//! A [`Channel`] tracks both flow-control windows: the local window is what
//! the peer may still send us, the remote window is what we may still send.
//! Extended data counts against the window exactly like normal data
//! (RFC 4254 Section 5.2). Data we send is additionally bounded by the
//! peer's maximum packet size; [`Channel::max_chunk`] gives the largest
//! payload currently sendable.
//!
//! The [`ChannelMux`] owns every live channel of a session. Local ids are
//! the smallest free integer, so an id is reused only after its previous
//! channel has been fully torn down.
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::channel::{ChannelMux, MuxConfig};
//!
//! let mut mux = ChannelMux::new(MuxConfig::default());
//! let id = mux.allocate_local().unwrap();
//! assert_eq!(id, 0);
//! ```

use skiff_platform::{SkiffError, SkiffResult};
use std::collections::{BTreeMap, VecDeque};
use tracing::trace;

/// Mux-wide configuration.
#[derive(Debug, Clone, Copy)]
pub struct MuxConfig {
    /// Window we advertise on new channels.
    pub initial_window: u32,
    /// Maximum packet we advertise on new channels.
    pub max_packet: u32,
    /// Concurrent channel limit (0 = unlimited).
    pub max_channels: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            initial_window: 2 * 1024 * 1024,
            max_packet: 32 * 1024,
            max_channels: 0,
        }
    }
}

/// Lifecycle of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// CHANNEL_OPEN sent or received, not yet confirmed.
    Opening,
    /// Confirmed; data may flow.
    Open,
    /// CHANNEL_CLOSE sent and/or received but not both yet.
    Closing,
    /// Both sides closed; the entry is ready for removal.
    Closed,
}

/// One channel's state.
#[derive(Debug)]
pub struct Channel {
    /// Our id for this channel.
    pub local_id: u32,
    /// The peer's id for this channel.
    pub remote_id: u32,
    state: ChannelState,

    /// Bytes the peer may still send us.
    local_window: u32,
    /// The window size we replenish toward.
    local_initial_window: u32,
    /// Largest packet we accept.
    pub local_max_packet: u32,

    /// Bytes we may still send the peer.
    remote_window: u32,
    /// Largest packet the peer accepts.
    pub remote_max_packet: u32,

    eof_sent: bool,
    eof_received: bool,
    close_sent: bool,
    close_received: bool,

    /// Names of our in-flight want-reply requests, oldest first. Replies
    /// arrive strictly in this order (RFC 4254 Section 5.4).
    outstanding_requests: VecDeque<String>,
}

impl Channel {
    fn new(local_id: u32, config: &MuxConfig) -> Self {
        Self {
            local_id,
            remote_id: 0,
            state: ChannelState::Opening,
            local_window: config.initial_window,
            local_initial_window: config.initial_window,
            local_max_packet: config.max_packet,
            remote_window: 0,
            remote_max_packet: 0,
            eof_sent: false,
            eof_received: false,
            close_sent: false,
            close_received: false,
            outstanding_requests: VecDeque::new(),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Bytes the peer may still send us.
    pub fn local_window(&self) -> u32 {
        self.local_window
    }

    /// Bytes we may still send the peer.
    pub fn remote_window(&self) -> u32 {
        self.remote_window
    }

    /// Marks the channel confirmed with the peer's parameters.
    pub fn confirm(&mut self, remote_id: u32, remote_window: u32, remote_max_packet: u32) {
        self.remote_id = remote_id;
        self.remote_window = remote_window;
        self.remote_max_packet = remote_max_packet;
        self.state = ChannelState::Open;
    }

    /// Largest data payload currently sendable: bounded by the remote
    /// window and the remote maximum packet size. Zero means blocked.
    pub fn max_chunk(&self) -> usize {
        self.remote_window.min(self.remote_max_packet) as usize
    }

    /// Accounts for data bytes we are about to send.
    ///
    /// Sending more than the remote window is a protocol violation on our
    /// side, so this is an internal error rather than a peer error.
    pub fn consume_remote_window(&mut self, len: usize) -> SkiffResult<()> {
        if len > self.remote_window as usize {
            return Err(SkiffError::Protocol(format!(
                "attempt to send {} bytes with a remote window of {}",
                len, self.remote_window
            )));
        }
        if len > self.remote_max_packet as usize {
            return Err(SkiffError::Protocol(format!(
                "attempt to send {} bytes with a remote max packet of {}",
                len, self.remote_max_packet
            )));
        }
        self.remote_window -= len as u32;
        Ok(())
    }

    /// Applies a WINDOW_ADJUST from the peer.
    pub fn grow_remote_window(&mut self, additional: u32) {
        self.remote_window = self.remote_window.saturating_add(additional);
    }

    /// Accounts for data bytes received from the peer (normal and
    /// extended data alike). Overflowing our window is fatal.
    pub fn consume_local_window(&mut self, len: usize) -> SkiffResult<()> {
        if len > self.local_window as usize {
            return Err(SkiffError::Protocol(format!(
                "peer overflowed the channel window: sent {} with {} available",
                len, self.local_window
            )));
        }
        self.local_window -= len as u32;
        Ok(())
    }

    /// Replenishes the local window once it has dropped below half of its
    /// initial size. Returns the grant to send as WINDOW_ADJUST.
    pub fn replenish_local_window(&mut self) -> Option<u32> {
        if self.local_window >= self.local_initial_window / 2 {
            return None;
        }
        let grant = self.local_initial_window - self.local_window;
        self.local_window = self.local_initial_window;
        trace!(channel = self.local_id, grant, "window replenished");
        Some(grant)
    }

    /// Records that we sent CHANNEL_EOF.
    pub fn mark_eof_sent(&mut self) {
        self.eof_sent = true;
    }

    /// Records that the peer sent CHANNEL_EOF.
    pub fn mark_eof_received(&mut self) {
        self.eof_received = true;
    }

    /// True once we have sent CHANNEL_EOF.
    pub fn eof_sent(&self) -> bool {
        self.eof_sent
    }

    /// True once the peer has sent CHANNEL_EOF.
    pub fn eof_received(&self) -> bool {
        self.eof_received
    }

    /// Records that we sent CHANNEL_CLOSE.
    pub fn mark_close_sent(&mut self) {
        self.close_sent = true;
        self.state = if self.close_received {
            ChannelState::Closed
        } else {
            ChannelState::Closing
        };
    }

    /// Records that the peer sent CHANNEL_CLOSE.
    pub fn mark_close_received(&mut self) {
        self.close_received = true;
        self.state = if self.close_sent {
            ChannelState::Closed
        } else {
            ChannelState::Closing
        };
    }

    /// True once we sent CHANNEL_CLOSE.
    pub fn close_sent(&self) -> bool {
        self.close_sent
    }

    /// Both sides have sent CHANNEL_CLOSE.
    pub fn is_fully_closed(&self) -> bool {
        self.close_sent && self.close_received
    }

    /// Registers one of our want-reply requests.
    pub fn push_outstanding_request(&mut self, name: &str) {
        self.outstanding_requests.push_back(name.to_string());
    }

    /// Resolves the oldest outstanding request on SUCCESS/FAILURE.
    pub fn pop_outstanding_request(&mut self) -> SkiffResult<String> {
        self.outstanding_requests.pop_front().ok_or_else(|| {
            SkiffError::Protocol(
                "channel reply without an outstanding request".to_string(),
            )
        })
    }
}

/// The session's channel table.
#[derive(Debug)]
pub struct ChannelMux {
    config: MuxConfig,
    channels: BTreeMap<u32, Channel>,
}

impl ChannelMux {
    /// Creates an empty mux.
    pub fn new(config: MuxConfig) -> Self {
        Self {
            config,
            channels: BTreeMap::new(),
        }
    }

    /// The mux configuration.
    pub fn config(&self) -> &MuxConfig {
        &self.config
    }

    /// Number of live channels.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// True when no channels are live.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    fn lowest_free_id(&self) -> u32 {
        let mut candidate = 0u32;
        for id in self.channels.keys() {
            if *id != candidate {
                break;
            }
            candidate += 1;
        }
        candidate
    }

    fn check_limit(&self) -> SkiffResult<()> {
        if self.config.max_channels != 0 && self.channels.len() >= self.config.max_channels {
            return Err(SkiffError::Protocol(format!(
                "channel limit of {} reached",
                self.config.max_channels
            )));
        }
        Ok(())
    }

    /// Allocates a local id for a channel we are opening.
    pub fn allocate_local(&mut self) -> SkiffResult<u32> {
        self.check_limit()?;
        let id = self.lowest_free_id();
        self.channels.insert(id, Channel::new(id, &self.config));
        Ok(id)
    }

    /// Accepts a peer CHANNEL_OPEN: allocates a local id and confirms the
    /// channel immediately with the peer's parameters.
    pub fn accept_remote(
        &mut self,
        remote_id: u32,
        remote_window: u32,
        remote_max_packet: u32,
    ) -> SkiffResult<u32> {
        self.check_limit()?;
        let id = self.lowest_free_id();
        let mut channel = Channel::new(id, &self.config);
        channel.confirm(remote_id, remote_window, remote_max_packet);
        self.channels.insert(id, channel);
        Ok(id)
    }

    /// Looks up a channel by our id.
    pub fn get(&self, local_id: u32) -> SkiffResult<&Channel> {
        self.channels.get(&local_id).ok_or_else(|| {
            SkiffError::Protocol(format!("message for unknown channel {}", local_id))
        })
    }

    /// Looks up a channel mutably by our id.
    pub fn get_mut(&mut self, local_id: u32) -> SkiffResult<&mut Channel> {
        self.channels.get_mut(&local_id).ok_or_else(|| {
            SkiffError::Protocol(format!("message for unknown channel {}", local_id))
        })
    }

    /// Drops the entry once both closes have happened, freeing the id.
    pub fn remove_if_closed(&mut self, local_id: u32) -> bool {
        if self
            .channels
            .get(&local_id)
            .is_some_and(|c| c.is_fully_closed())
        {
            self.channels.remove(&local_id);
            return true;
        }
        false
    }

    /// Removes a channel unconditionally (open failure path).
    pub fn remove(&mut self, local_id: u32) {
        self.channels.remove(&local_id);
    }

    /// Iterates over live channel ids.
    pub fn ids(&self) -> Vec<u32> {
        self.channels.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> MuxConfig {
        MuxConfig {
            initial_window: 1000,
            max_packet: 256,
            max_channels: 0,
        }
    }

    #[test]
    fn test_window_accounting() {
        let mut mux = ChannelMux::new(small_config());
        let id = mux.allocate_local().unwrap();
        let channel = mux.get_mut(id).unwrap();
        channel.confirm(42, 16, 8);

        // Remote window 16, remote max packet 8: two 8-byte chunks fit.
        assert_eq!(channel.max_chunk(), 8);
        channel.consume_remote_window(8).unwrap();
        channel.consume_remote_window(8).unwrap();
        assert_eq!(channel.max_chunk(), 0);
        assert!(channel.consume_remote_window(1).is_err());

        channel.grow_remote_window(24);
        assert_eq!(channel.remote_window(), 24);
        assert_eq!(channel.max_chunk(), 8);
    }

    #[test]
    fn test_zero_initial_window_blocks() {
        let mut mux = ChannelMux::new(small_config());
        let id = mux.allocate_local().unwrap();
        let channel = mux.get_mut(id).unwrap();
        channel.confirm(0, 0, 512);

        assert_eq!(channel.max_chunk(), 0);
        assert!(channel.consume_remote_window(1).is_err());
        channel.grow_remote_window(100);
        assert!(channel.consume_remote_window(100).is_ok());
    }

    #[test]
    fn test_local_window_overflow_is_error() {
        let mut mux = ChannelMux::new(small_config());
        let id = mux.allocate_local().unwrap();
        let channel = mux.get_mut(id).unwrap();
        channel.confirm(1, 100, 64);

        channel.consume_local_window(1000).unwrap();
        assert!(channel.consume_local_window(1).is_err());
    }

    #[test]
    fn test_replenish_at_half() {
        let mut mux = ChannelMux::new(small_config());
        let id = mux.allocate_local().unwrap();
        let channel = mux.get_mut(id).unwrap();
        channel.confirm(1, 100, 64);

        channel.consume_local_window(400).unwrap();
        // 600 remaining >= 500: no replenish yet.
        assert_eq!(channel.replenish_local_window(), None);

        channel.consume_local_window(200).unwrap();
        // 400 remaining < 500: grant back up to the initial window.
        assert_eq!(channel.replenish_local_window(), Some(600));
        assert_eq!(channel.local_window(), 1000);
    }

    #[test]
    fn test_id_allocation_and_reuse() {
        let mut mux = ChannelMux::new(small_config());
        let a = mux.allocate_local().unwrap();
        let b = mux.allocate_local().unwrap();
        let c = mux.allocate_local().unwrap();
        assert_eq!((a, b, c), (0, 1, 2));

        // Close and free the middle channel; its id is reused next.
        let channel = mux.get_mut(b).unwrap();
        channel.mark_close_sent();
        channel.mark_close_received();
        assert!(mux.remove_if_closed(b));

        let d = mux.allocate_local().unwrap();
        assert_eq!(d, 1);
    }

    #[test]
    fn test_id_not_reused_while_live() {
        let mut mux = ChannelMux::new(small_config());
        let a = mux.allocate_local().unwrap();
        let channel = mux.get_mut(a).unwrap();
        channel.mark_close_sent();
        // Peer has not closed yet: the id stays allocated.
        assert!(!mux.remove_if_closed(a));
        let b = mux.allocate_local().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_channel_limit() {
        let mut config = small_config();
        config.max_channels = 32;
        let mut mux = ChannelMux::new(config);
        for _ in 0..32 {
            mux.allocate_local().unwrap();
        }
        // The 33rd concurrent channel exceeds the configured limit.
        assert!(mux.allocate_local().is_err());
        assert!(mux.accept_remote(99, 1024, 256).is_err());
    }

    #[test]
    fn test_close_handshake_states() {
        let mut mux = ChannelMux::new(small_config());
        let id = mux.allocate_local().unwrap();
        let channel = mux.get_mut(id).unwrap();
        channel.confirm(7, 100, 64);
        assert_eq!(channel.state(), ChannelState::Open);

        channel.mark_eof_sent();
        assert!(channel.eof_sent());
        assert_eq!(channel.state(), ChannelState::Open);

        channel.mark_close_received();
        assert_eq!(channel.state(), ChannelState::Closing);
        channel.mark_close_sent();
        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(channel.is_fully_closed());
    }

    #[test]
    fn test_outstanding_request_order() {
        let mut mux = ChannelMux::new(small_config());
        let id = mux.allocate_local().unwrap();
        let channel = mux.get_mut(id).unwrap();
        channel.push_outstanding_request("pty-req");
        channel.push_outstanding_request("shell");

        assert_eq!(channel.pop_outstanding_request().unwrap(), "pty-req");
        assert_eq!(channel.pop_outstanding_request().unwrap(), "shell");
        assert!(channel.pop_outstanding_request().is_err());
    }

    #[test]
    fn test_unknown_channel_id() {
        let mux = ChannelMux::new(small_config());
        assert!(mux.get(5).is_err());
    }
}
