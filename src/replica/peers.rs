use crate::replica::messages::PeerMessage;
use crate::replica::LeaderRedirectInfo;
use crate::transport::PeerLink;
use bytes::Bytes;
use prost::Message;
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddrV4;
use std::sync::Arc;

/// ServerId names a cluster member. It is the member's position in the cluster config.
#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ServerId(pub u32);

impl ServerId {
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Debug for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// PeerSender is the only thing the replica needs from a peer link: best-effort delivery.
pub trait PeerSender: Send {
    fn send(&self, payload: Bytes);
}

impl PeerSender for Arc<PeerLink> {
    fn send(&self, payload: Bytes) {
        PeerLink::send(self, payload);
    }
}

pub struct Peer {
    pub id: ServerId,
    /// Where this peer serves clients. Handed out as a redirect hint when it's leader.
    pub client_address: SocketAddrV4,
    pub sender: Box<dyn PeerSender>,
}

pub(super) struct ClusterTracker {
    my_id: ServerId,
    peers: BTreeMap<ServerId, Peer>,
}

impl ClusterTracker {
    pub(super) fn new(my_id: ServerId, peers: Vec<Peer>) -> Self {
        let peers = peers.into_iter().map(|peer| (peer.id, peer)).collect();

        ClusterTracker { my_id, peers }
    }

    pub(super) fn my_id(&self) -> ServerId {
        self.my_id
    }

    pub(super) fn contains_peer(&self, id: ServerId) -> bool {
        self.peers.contains_key(&id)
    }

    pub(super) fn peer_ids(&self) -> Vec<ServerId> {
        self.peers.keys().copied().collect()
    }

    pub(super) fn num_voting_members(&self) -> usize {
        self.peers.len() + 1
    }

    /// Strict majority of the whole cluster, including me.
    // Not ceil((n+1)/2): for 4 members that is 2, and two disjoint pairs could each elect a leader.
    pub(super) fn majority(&self) -> usize {
        self.num_voting_members() / 2 + 1
    }

    pub(super) fn leader_redirect_info(&self, id: ServerId) -> Option<LeaderRedirectInfo> {
        self.peers.get(&id).map(|peer| LeaderRedirectInfo {
            server_id: id,
            client_address: peer.client_address,
        })
    }

    pub(super) fn send(&self, to: ServerId, message: &PeerMessage) {
        match self.peers.get(&to) {
            Some(peer) => peer.sender.send(Bytes::from(message.encode_to_vec())),
            None => debug_assert!(false, "Sending to unknown peer {:?}", to),
        }
    }
}
