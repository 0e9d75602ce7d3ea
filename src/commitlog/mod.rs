mod atomic_file;
mod in_memory;
mod log;
mod storage;

pub use in_memory::InMemoryLog;
pub use log::Entry;
pub use log::Index;
pub use log::Log;
pub use storage::PersistentLog;

pub(crate) use atomic_file::remove_if_exists;
pub(crate) use atomic_file::replace as atomic_replace;
pub(crate) use atomic_file::with_suffix;
