use crate::commitlog::{Entry, Index, Log};
use std::convert::TryFrom;
use std::io;
use std::marker::PhantomData;

/// InMemoryLog is a volatile log with the same contract as the persistent one. Useful for
/// exercising replication logic without touching disk.
pub struct InMemoryLog<E: Entry> {
    // We don't *need* to convert these to bytes. We could just hold the original entry in memory,
    // but we want to exercise the conversion logic.
    log: Vec<Vec<u8>>,
    _pd: PhantomData<E>,
}

impl<E: Entry> InMemoryLog<E> {
    pub fn create() -> Self {
        InMemoryLog {
            log: vec![],
            _pd: PhantomData::default(),
        }
    }
}

impl<E: Entry> Default for InMemoryLog<E> {
    fn default() -> Self {
        Self::create()
    }
}

impl<E: Entry> Log<E> for InMemoryLog<E> {
    fn append(&mut self, entry: E) -> Result<Index, io::Error> {
        self.log.push(entry.to_bytes()?);

        Ok(Index::new_usize(self.log.len() - 1))
    }

    fn read(&mut self, index: Index) -> Result<Option<E>, io::Error> {
        match self.log.get(index.as_usize()) {
            Some(bytes) => E::try_from(bytes.clone()).map(Some),
            None => Ok(None),
        }
    }

    fn remove_last(&mut self) -> Result<bool, io::Error> {
        Ok(self.log.pop().is_some())
    }

    fn last_index(&self) -> Option<Index> {
        self.log.len().checked_sub(1).map(Index::new_usize)
    }
}
