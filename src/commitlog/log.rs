use std::convert::TryFrom;
use std::{fmt, io};

/// Index is an index of an entry in the log; i.e. a log entry's index.
#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash, Default)]
pub struct Index(u64);

impl Index {
    pub fn new(index: u64) -> Self {
        Index(index)
    }

    pub fn new_usize(index: usize) -> Self {
        Self::new(index as u64)
    }

    pub fn start_index() -> Self {
        Self::new(0)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }

    pub fn plus(&self, delta: u64) -> Index {
        Index::new(self.0 + delta)
    }

    pub fn checked_minus(&self, delta: u64) -> Option<Index> {
        self.0.checked_sub(delta).map(Index::new)
    }
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Log is an append only log intended for use as a replicated commit log.
///
/// Log indexes entries starting from 0. The only way to remove entries is from the tail, one at
/// a time, which is all that conflict resolution during replication needs.
pub trait Log<E: Entry> {
    /// append() appends a log entry to the log at the next log entry index, then returns
    /// the log entry index that was just used to append the entry.
    fn append(&mut self, entry: E) -> Result<Index, io::Error>;

    /// Read log entry at specified index. Returns `None` if the index is out of range.
    ///
    /// Takes `&mut self` because implementations may cache what they load.
    fn read(&mut self, index: Index) -> Result<Option<E>, io::Error>;

    /// Remove the last entry. Returns false if the log was already empty.
    fn remove_last(&mut self) -> Result<bool, io::Error>;

    /// Index of the last entry, or `None` for an empty log.
    fn last_index(&self) -> Option<Index>;

    /// next_index returns the next index that will be used to append an entry.
    fn next_index(&self) -> Index {
        self.last_index()
            .map(|i| i.plus(1))
            .unwrap_or_else(Index::start_index)
    }
}

/// Entry is anything that the log can store as an opaque byte record.
pub trait Entry: Clone + TryFrom<Vec<u8>, Error = io::Error> {
    fn to_bytes(&self) -> Result<Vec<u8>, io::Error>;
}
