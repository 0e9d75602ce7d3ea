mod framer;
mod peer_link;
mod shutdown;

pub use peer_link::FrameSink;
pub use peer_link::PeerLink;
pub use peer_link::PeerLinkConfig;

pub(crate) use shutdown::shutdown_signal;
pub(crate) use shutdown::ShutdownHandle;
pub(crate) use shutdown::ShutdownSignal;
