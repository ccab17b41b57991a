//! Peer group membership, quorum arithmetic and per-peer status.
//!
//! The group is pure bookkeeping: it never opens sockets. The runtime
//! reports link transitions through [`PeerGroup::set_link`] and the
//! proposer reports who it believes is leading through
//! [`PeerGroup::observe_leader`].

use std::fmt::{self, Display};

use paxlog_types::PeerId;
use serde::{Deserialize, Serialize};

use crate::error::{ConsensusError, Result};

/// Advisory role a peer is believed to play.
///
/// Leadership never gates correctness: any peer may propose at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PeerRole {
    #[default]
    Unknown,
    Leader,
    Follower,
}

/// Whether the outbound link to a peer is usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum LinkState {
    Connected,
    #[default]
    Disconnected,
}

impl Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// A member of the group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    pub address: String,
    pub role: PeerRole,
    pub link: LinkState,
}

/// Point-in-time view of the group, for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GroupStatus {
    pub local: PeerId,
    pub quorum: usize,
    pub leader: Option<PeerId>,
    pub peers: Vec<Peer>,
}

impl GroupStatus {
    /// Number of peers (self included) currently reachable.
    pub fn reachable(&self) -> usize {
        self.peers
            .iter()
            .filter(|p| p.link == LinkState::Connected)
            .count()
    }
}

/// The fixed set of peers taking part in consensus.
#[derive(Debug, Clone)]
pub struct PeerGroup {
    local: PeerId,
    /// Sorted by peer id.
    peers: Vec<Peer>,
    quorum: usize,
}

impl PeerGroup {
    /// Builds a group from `(id, address)` pairs.
    ///
    /// The local peer must be listed. Its link is always `Connected`.
    pub fn new(local: PeerId, members: impl IntoIterator<Item = (PeerId, String)>) -> Result<Self> {
        let mut peers: Vec<Peer> = members
            .into_iter()
            .map(|(id, address)| Peer {
                id,
                address,
                role: PeerRole::Unknown,
                link: if id == local {
                    LinkState::Connected
                } else {
                    LinkState::Disconnected
                },
            })
            .collect();

        if peers.is_empty() {
            return Err(ConsensusError::EmptyGroup);
        }
        peers.sort_by_key(|p| p.id);
        if let Some(dup) = peers.windows(2).find(|w| w[0].id == w[1].id) {
            return Err(ConsensusError::DuplicatePeer(dup[0].id));
        }
        if !peers.iter().any(|p| p.id == local) {
            return Err(ConsensusError::LocalNotMember(local));
        }

        let mut group = Self {
            local,
            peers,
            quorum: 0,
        };
        group.recompute_quorum();
        Ok(group)
    }

    fn recompute_quorum(&mut self) {
        self.quorum = self.peers.len() / 2 + 1;
    }

    pub fn local(&self) -> PeerId {
        self.local
    }

    /// Strict majority of the current membership.
    pub fn quorum_size(&self) -> usize {
        self.quorum
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.peer(id).is_some()
    }

    pub fn peer(&self, id: PeerId) -> Option<&Peer> {
        self.peers
            .binary_search_by_key(&id, |p| p.id)
            .ok()
            .map(|i| &self.peers[i])
    }

    fn peer_mut(&mut self, id: PeerId) -> Option<&mut Peer> {
        self.peers
            .binary_search_by_key(&id, |p| p.id)
            .ok()
            .map(|i| &mut self.peers[i])
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter()
    }

    /// Every member except the local one.
    pub fn remote_peers(&self) -> impl Iterator<Item = &Peer> {
        let local = self.local;
        self.peers.iter().filter(move |p| p.id != local)
    }

    /// Adds a member and recomputes the quorum.
    pub fn add_peer(&mut self, id: PeerId, address: impl Into<String>) -> Result<()> {
        match self.peers.binary_search_by_key(&id, |p| p.id) {
            Ok(_) => Err(ConsensusError::DuplicatePeer(id)),
            Err(at) => {
                self.peers.insert(
                    at,
                    Peer {
                        id,
                        address: address.into(),
                        role: PeerRole::Unknown,
                        link: LinkState::Disconnected,
                    },
                );
                self.recompute_quorum();
                tracing::info!(peer = %id, quorum = self.quorum, "peer added");
                Ok(())
            }
        }
    }

    /// Removes a member and recomputes the quorum.
    pub fn remove_peer(&mut self, id: PeerId) -> Result<Peer> {
        if id == self.local {
            return Err(ConsensusError::RemoveLocal(id));
        }
        let at = self
            .peers
            .binary_search_by_key(&id, |p| p.id)
            .map_err(|_| ConsensusError::UnknownPeer(id))?;
        let removed = self.peers.remove(at);
        self.recompute_quorum();
        tracing::info!(peer = %id, quorum = self.quorum, "peer removed");
        Ok(removed)
    }

    /// Records a link transition. Returns true if the state changed.
    ///
    /// The local peer's link cannot be changed.
    pub fn set_link(&mut self, id: PeerId, link: LinkState) -> Result<bool> {
        if id == self.local {
            return Ok(false);
        }
        let peer = self.peer_mut(id).ok_or(ConsensusError::UnknownPeer(id))?;
        if peer.link == link {
            return Ok(false);
        }
        peer.link = link;
        Ok(true)
    }

    /// Number of peers (self included) with a usable link.
    pub fn reachable(&self) -> usize {
        self.peers
            .iter()
            .filter(|p| p.link == LinkState::Connected)
            .count()
    }

    /// Returns true if `count` votes form a quorum.
    pub fn has_quorum(&self, count: usize) -> bool {
        count >= self.quorum
    }

    /// Returns true if enough peers are reachable to make progress.
    pub fn quorum_reachable(&self) -> bool {
        self.has_quorum(self.reachable())
    }

    /// Marks `leader` as the believed leader and everyone else as a
    /// follower. Returns true if the believed leader changed.
    pub fn observe_leader(&mut self, leader: PeerId) -> bool {
        if !self.contains(leader) || self.leader() == Some(leader) {
            return false;
        }
        for peer in &mut self.peers {
            peer.role = if peer.id == leader {
                PeerRole::Leader
            } else {
                PeerRole::Follower
            };
        }
        tracing::debug!(leader = %leader, "leader observed");
        true
    }

    pub fn leader(&self) -> Option<PeerId> {
        self.peers
            .iter()
            .find(|p| p.role == PeerRole::Leader)
            .map(|p| p.id)
    }

    pub fn status(&self) -> GroupStatus {
        GroupStatus {
            local: self.local,
            quorum: self.quorum,
            leader: self.leader(),
            peers: self.peers.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn members(n: u8) -> Vec<(PeerId, String)> {
        (0..n)
            .map(|i| (PeerId::new(i), format!("127.0.0.1:{}", 7000 + u16::from(i))))
            .collect()
    }

    #[test_case(1, 1)]
    #[test_case(2, 2)]
    #[test_case(3, 2)]
    #[test_case(4, 3)]
    #[test_case(5, 3)]
    #[test_case(7, 4)]
    fn quorum_is_strict_majority(n: u8, quorum: usize) {
        let group = PeerGroup::new(PeerId::new(0), members(n)).unwrap();
        assert_eq!(group.quorum_size(), quorum);
    }

    #[test]
    fn rejects_bad_membership() {
        assert_eq!(
            PeerGroup::new(PeerId::new(0), Vec::new()).unwrap_err(),
            ConsensusError::EmptyGroup
        );
        assert_eq!(
            PeerGroup::new(PeerId::new(9), members(3)).unwrap_err(),
            ConsensusError::LocalNotMember(PeerId::new(9))
        );
        let mut dup = members(3);
        dup.push((PeerId::new(1), "elsewhere:1".to_string()));
        assert_eq!(
            PeerGroup::new(PeerId::new(0), dup).unwrap_err(),
            ConsensusError::DuplicatePeer(PeerId::new(1))
        );
    }

    #[test]
    fn local_counts_as_reachable() {
        let mut group = PeerGroup::new(PeerId::new(0), members(5)).unwrap();
        assert_eq!(group.reachable(), 1);
        assert!(!group.quorum_reachable());

        assert!(group.set_link(PeerId::new(3), LinkState::Connected).unwrap());
        assert!(!group.set_link(PeerId::new(3), LinkState::Connected).unwrap());
        assert!(group.set_link(PeerId::new(4), LinkState::Connected).unwrap());
        assert_eq!(group.reachable(), 3);
        assert!(group.quorum_reachable());

        assert!(!group.set_link(PeerId::new(0), LinkState::Disconnected).unwrap());
        assert_eq!(group.reachable(), 3);
    }

    #[test]
    fn membership_changes_recompute_quorum() {
        let mut group = PeerGroup::new(PeerId::new(0), members(3)).unwrap();
        group.add_peer(PeerId::new(3), "127.0.0.1:7003").unwrap();
        group.add_peer(PeerId::new(4), "127.0.0.1:7004").unwrap();
        assert_eq!(group.quorum_size(), 3);

        group.remove_peer(PeerId::new(4)).unwrap();
        group.remove_peer(PeerId::new(3)).unwrap();
        assert_eq!(group.quorum_size(), 2);

        assert_eq!(
            group.remove_peer(PeerId::new(0)).unwrap_err(),
            ConsensusError::RemoveLocal(PeerId::new(0))
        );
        assert_eq!(
            group.add_peer(PeerId::new(1), "x").unwrap_err(),
            ConsensusError::DuplicatePeer(PeerId::new(1))
        );
    }

    #[test]
    fn leader_tracking() {
        let mut group = PeerGroup::new(PeerId::new(1), members(3)).unwrap();
        assert_eq!(group.leader(), None);
        assert!(group.observe_leader(PeerId::new(2)));
        assert!(!group.observe_leader(PeerId::new(2)));
        assert_eq!(group.leader(), Some(PeerId::new(2)));
        assert_eq!(group.peer(PeerId::new(0)).unwrap().role, PeerRole::Follower);
        assert!(!group.observe_leader(PeerId::new(9)));

        let status = group.status();
        assert_eq!(status.leader, Some(PeerId::new(2)));
        assert_eq!(status.reachable(), 1);
    }
}
