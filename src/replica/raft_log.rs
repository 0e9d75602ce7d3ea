use crate::commitlog::{self, Index};
use crate::replica::{RaftLogEntry, Term};
use std::io;

/// RaftLog is the raft-specific log facade.
///
/// Index 0 always holds a placeholder entry with term 0, so there is always a "previous" entry
/// to check against, and `latest_entry()` is never empty.
///
/// Note: A log entry has 3 states (not modeled directly in code):
/// 1. Persisted - written to disk, not yet replicated to majority
/// 2. Committed - written to disk, replicated to majority
/// 3. Applied - a committed entry that has also been applied to the state machine
///
/// A log entry's state has no global truth. Each replica will have their own local view of what
/// state the log entry is in.
pub(super) struct RaftLog<L>
where
    L: commitlog::Log<RaftLogEntry>,
{
    // Application's info/debug log.
    logger: slog::Logger,

    // This is the log that we're replicating.
    log: L,
    // Metadata about the highest log entry that we've locally written.
    latest_entry_metadata: (Term, Index),

    // Index of highest log entry known to be committed.
    commit_index: Index,
    // Index of highest log entry applied to state machine.
    last_applied_index: Index,
}

impl<L> RaftLog<L>
where
    L: commitlog::Log<RaftLogEntry>,
{
    /// `last_applied` comes from durable local state. Everything up to it is treated as committed.
    pub(super) fn new(logger: slog::Logger, mut log: L, last_applied: Index) -> Result<Self, io::Error> {
        if log.last_index().is_none() {
            log.append(RaftLogEntry::placeholder())?;
        }

        let latest_index = log.last_index().unwrap_or_else(Index::start_index);
        let latest_term = match log.read(latest_index)? {
            Some(entry) => entry.term,
            None => return Err(missing_entry(latest_index)),
        };

        if last_applied > latest_index {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "last applied index {:?} is beyond the end of the log {:?}",
                    last_applied, latest_index
                ),
            ));
        }

        Ok(RaftLog {
            logger,
            log,
            latest_entry_metadata: (latest_term, latest_index),
            commit_index: last_applied,
            last_applied_index: last_applied,
        })
    }

    pub(super) fn latest_entry(&self) -> (Term, Index) {
        self.latest_entry_metadata
    }

    pub(super) fn last_index(&self) -> Index {
        self.latest_entry_metadata.1
    }

    pub(super) fn read(&mut self, index: Index) -> Result<Option<RaftLogEntry>, io::Error> {
        self.log.read(index)
    }

    pub(super) fn read_required(&mut self, index: Index) -> Result<RaftLogEntry, io::Error> {
        self.read(index)?.ok_or_else(|| missing_entry(index))
    }

    pub(super) fn term_at(&mut self, index: Index) -> Result<Option<Term>, io::Error> {
        if index == self.latest_entry_metadata.1 {
            return Ok(Some(self.latest_entry_metadata.0));
        }

        Ok(self.read(index)?.map(|entry| entry.term))
    }

    pub(super) fn append(&mut self, entry: RaftLogEntry) -> Result<Index, io::Error> {
        let appended_term = entry.term;
        let appended_index = self.log.append(entry)?;
        // Only update state after log action completes.
        self.latest_entry_metadata = (appended_term, appended_index);

        Ok(appended_index)
    }

    /// Remove anything starting at `index` and later. Committed entries can never be removed.
    pub(super) fn truncate(&mut self, index: Index) -> Result<(), io::Error> {
        if index <= self.commit_index {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "refusing to truncate at {:?}, entries up to {:?} are committed",
                    index, self.commit_index
                ),
            ));
        }

        while self.last_index() >= index {
            self.log.remove_last()?;
            let new_latest_index = self.log.last_index().unwrap_or_else(Index::start_index);
            let new_latest_term = self.read_required(new_latest_index)?.term;
            self.latest_entry_metadata = (new_latest_term, new_latest_index);
        }
        slog::debug!(self.logger, "Truncated log, latest entry is now {:?}", self.latest_entry_metadata);

        Ok(())
    }

    pub(super) fn commit_index(&self) -> Index {
        self.commit_index
    }

    pub(super) fn last_applied_index(&self) -> Index {
        self.last_applied_index
    }

    /// Leader path. Returns true if the commit index moved.
    pub(super) fn ratchet_fwd_commit_index_if_valid(
        &mut self,
        tentative_new_commit_index: Index,
        current_term: Term,
    ) -> Result<bool, io::Error> {
        if tentative_new_commit_index <= self.commit_index {
            return Ok(false);
        }

        // > If there exists an N such that N > commitIndex, a majority
        // > of matchIndex[i] ≥ N, and log[N].term == currentTerm:
        // > set commitIndex = N (§5.3, §5.4).
        let entry = self.read_required(tentative_new_commit_index)?;
        if entry.term != current_term {
            return Ok(false);
        }

        self.ratchet_fwd_commit_index_panicking(tentative_new_commit_index);
        Ok(true)
    }

    /// Follower path. Returns true if the commit index moved.
    pub(super) fn ratchet_fwd_commit_index_if_increased(&mut self, new_commit_index: Index) -> bool {
        if new_commit_index <= self.commit_index {
            return false;
        }

        self.ratchet_fwd_commit_index_panicking(new_commit_index);
        true
    }

    fn ratchet_fwd_commit_index_panicking(&mut self, new_commit_index: Index) {
        // Assert we only mark as committed if we have the entry locally.
        assert!(
            self.latest_entry_metadata.1 >= new_commit_index,
            "Can't ratchet commit index forwards past our local log. Expected [latest log] {:?} >= {:?} [input]",
            self.latest_entry_metadata.1,
            new_commit_index,
        );

        self.commit_index = new_commit_index;
    }

    /// The next committed entry that hasn't been applied yet, if any.
    pub(super) fn next_entry_to_apply(&mut self) -> Result<Option<(Index, RaftLogEntry)>, io::Error> {
        if self.last_applied_index >= self.commit_index {
            return Ok(None);
        }

        let next_index = self.last_applied_index.plus(1);
        let entry = self.read_required(next_index)?;
        Ok(Some((next_index, entry)))
    }

    pub(super) fn mark_applied(&mut self, index: Index) {
        assert_eq!(
            index,
            self.last_applied_index.plus(1),
            "Entries must be applied in order"
        );
        self.last_applied_index = index;
    }
}

fn missing_entry(index: Index) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("no log entry found for index {:?}", index),
    )
}
