use bytes::Bytes;

/// PeerMessage is the single wire message exchanged between replicas. One message per frame.
///
/// Which fields are meaningful depends on `kind`:
///
/// * AppendEntriesRequest: `prev_log_index`, `prev_log_term`, `leader_commit`, `entries`
/// * AppendEntriesResponse: `success`, `appended_log_index`
/// * RequestVoteRequest: `last_log_index`, `last_log_term`
/// * RequestVoteResponse: `vote_granted`
#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct PeerMessage {
    #[prost(enumeration = "MessageKind", tag = "1")]
    pub(crate) kind: i32,
    #[prost(uint64, tag = "2")]
    pub(crate) term: u64,
    #[prost(uint32, tag = "3")]
    pub(crate) sender_id: u32,
    #[prost(bool, tag = "4")]
    pub(crate) success: bool,
    #[prost(bool, tag = "5")]
    pub(crate) vote_granted: bool,
    #[prost(uint64, tag = "6")]
    pub(crate) prev_log_index: u64,
    #[prost(uint64, tag = "7")]
    pub(crate) prev_log_term: u64,
    #[prost(uint64, tag = "8")]
    pub(crate) leader_commit: u64,
    #[prost(message, repeated, tag = "9")]
    pub(crate) entries: Vec<WireLogEntry>,
    #[prost(uint64, tag = "10")]
    pub(crate) appended_log_index: u64,
    #[prost(uint64, tag = "11")]
    pub(crate) last_log_index: u64,
    #[prost(uint64, tag = "12")]
    pub(crate) last_log_term: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct WireLogEntry {
    #[prost(uint64, tag = "1")]
    pub(crate) term: u64,
    #[prost(bytes = "bytes", tag = "2")]
    pub(crate) command: Bytes,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub(crate) enum MessageKind {
    AppendEntriesRequest = 0,
    AppendEntriesResponse = 1,
    RequestVoteRequest = 2,
    RequestVoteResponse = 3,
}

impl PeerMessage {
    pub(crate) fn new(kind: MessageKind, term: u64, sender_id: u32) -> Self {
        PeerMessage {
            kind: kind as i32,
            term,
            sender_id,
            ..PeerMessage::default()
        }
    }

    /// `None` if the sender used a kind we don't know about.
    pub(crate) fn message_kind(&self) -> Option<MessageKind> {
        MessageKind::try_from(self.kind).ok()
    }
}
