use std::collections::VecDeque;

use crate::tcp_wire::BlockInfo;

/// Contains the state of both sides of the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoreState {
    /// If we're choking, we don't allow the peer to download pieces from us.
    pub am_choking: bool,

    /// If we're interested, peer has pieces that we don't have.
    pub am_interested: bool,

    /// If peer is choking, they don't allow us to download pieces from them.
    pub peer_choking: bool,

    /// If peer is interested in us, they mean to download pieces that we have.
    pub peer_interested: bool,
}

impl Default for CoreState {
    /// By default, both sides of the connection start off as choked and not
    /// interested in the other.
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

/// Progress of the handshake exchange. Both flags must be set before any
/// other message is sent or accepted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HandshakeState {
    pub sent: bool,
    pub received: bool,
}

impl HandshakeState {
    pub fn is_done(&self) -> bool {
        self.sent && self.received
    }
}

/// Messages decided by the engine that are waiting for the socket.
///
/// A choke or interest change is only applied to [`CoreState`] when its
/// message is handed to the socket, so the flags always describe what the
/// peer was told.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Pending {
    /// `Some(true)` to choke, `Some(false)` to unchoke.
    pub choke: Option<bool>,
    /// `Some(true)` for interested, `Some(false)` for not interested.
    pub interest: Option<bool>,
    pub cancels: VecDeque<BlockInfo>,
    /// Pieces we completed that the peer should hear about.
    pub haves: VecDeque<u32>,
}

/// The change that brings `current` to `desired`, if any.
pub(crate) fn pending_change(current: bool, desired: bool) -> Option<bool> {
    (current != desired).then_some(desired)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_start_choked() {
        let state = CoreState::default();
        assert!(state.am_choking && state.peer_choking);
        assert!(!state.am_interested && !state.peer_interested);
    }

    #[test]
    fn pending_changes() {
        assert_eq!(pending_change(true, false), Some(false));
        assert_eq!(pending_change(true, true), None);
        assert_eq!(pending_change(false, true), Some(true));
    }
}
