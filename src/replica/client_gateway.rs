use crate::commitlog::Index;
use crate::replica::{LeaderRedirectInfo, Term};
use bytes::Bytes;

/// ClientGateway is how the replica drives the client facing server. Calls are made from inside
/// the replica's event loop, so implementations must not block.
pub trait ClientGateway: Send {
    /// We became leader. Accept commands from clients.
    fn start_serving(&self);

    /// We aren't leader. Point clients at `leader` if we know who it is.
    fn start_redirecting(&self, leader: Option<LeaderRedirectInfo>);

    /// The command appended at `index` in `term` was committed and applied; `response` is the
    /// state machine's output.
    fn respond_to_client(&self, term: Term, index: Index, response: Bytes);
}
