use crate::commitlog::{self, Index};
use crate::replica::peers::ServerId;
use prost::Message;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Copy, Clone, PartialOrd, Ord, PartialEq, Eq, Hash, Default)]
pub struct Term(u64);

impl Term {
    pub fn new(term: u64) -> Self {
        Term(term)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub(crate) fn incr(&mut self) {
        self.0 += 1;
    }
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// PersistentLocalState is used whenever the raft paper requires that something is persisted to a
/// durable store to guarantee safety. Not everything that uses disk has to go through this, only
/// algorithm-correctness-critical ones.
///
/// Every mutator persists before returning. If it returns an error, the in-memory view is unchanged.
pub trait PersistentLocalState {
    fn current_term(&self) -> Term;

    /// Who we voted for in `current_term()`, if anyone.
    fn voted_for(&self) -> Option<ServerId>;

    fn last_applied(&self) -> Index;

    /// The only mutator of the term/vote pair. Both are written as one unit.
    fn set_term_and_vote(&mut self, term: Term, voted_for: Option<ServerId>) -> Result<(), io::Error>;

    fn set_last_applied(&mut self, index: Index) -> Result<(), io::Error>;

    /// Return the new term. Used when transitioning to candidate.
    fn increment_term_and_vote_for_self(&mut self, my_id: ServerId) -> Result<Term, io::Error> {
        let mut new_term = self.current_term();
        new_term.incr();
        self.set_term_and_vote(new_term, Some(my_id))?;

        Ok(new_term)
    }
}

/// Keeps everything in RAM. Only suitable for tests.
#[derive(Default)]
pub struct VolatileLocalState {
    current_term: Term,
    voted_for: Option<ServerId>,
    last_applied: Index,
}

impl VolatileLocalState {
    pub fn new() -> Self {
        VolatileLocalState::default()
    }

    pub fn with_term(current_term: Term) -> Self {
        VolatileLocalState {
            current_term,
            ..VolatileLocalState::default()
        }
    }
}

impl PersistentLocalState for VolatileLocalState {
    fn current_term(&self) -> Term {
        self.current_term
    }

    fn voted_for(&self) -> Option<ServerId> {
        self.voted_for
    }

    fn last_applied(&self) -> Index {
        self.last_applied
    }

    fn set_term_and_vote(&mut self, term: Term, voted_for: Option<ServerId>) -> Result<(), io::Error> {
        self.current_term = term;
        self.voted_for = voted_for;
        Ok(())
    }

    fn set_last_applied(&mut self, index: Index) -> Result<(), io::Error> {
        self.last_applied = index;
        Ok(())
    }
}

#[derive(Clone, PartialEq, prost::Message)]
struct LocalStateRecord {
    #[prost(uint64, tag = "1")]
    current_term: u64,
    #[prost(uint32, optional, tag = "2")]
    voted_for: Option<u32>,
    #[prost(uint64, tag = "3")]
    last_applied: u64,
}

/// Durable local state kept in a single `<prefix>_state` file, replaced atomically on every write.
pub struct FileLocalState {
    path: PathBuf,
    record: LocalStateRecord,
}

impl FileLocalState {
    pub fn open_or_create<P: AsRef<Path>>(path_prefix: P) -> Result<Self, io::Error> {
        let path = Self::path(path_prefix.as_ref());

        let record = match fs::read(&path) {
            Ok(bytes) => LocalStateRecord::decode(bytes.as_slice())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let record = LocalStateRecord::default();
                commitlog::atomic_replace(&path, &record.encode_to_vec())?;
                record
            }
            Err(e) => return Err(e),
        };

        Ok(FileLocalState { path, record })
    }

    pub fn remove_file<P: AsRef<Path>>(path_prefix: P) -> Result<(), io::Error> {
        commitlog::remove_if_exists(&Self::path(path_prefix.as_ref()))
    }

    fn path(path_prefix: &Path) -> PathBuf {
        commitlog::with_suffix(path_prefix, "_state")
    }

    fn save(&mut self, record: LocalStateRecord) -> Result<(), io::Error> {
        commitlog::atomic_replace(&self.path, &record.encode_to_vec())?;
        self.record = record;
        Ok(())
    }
}

impl PersistentLocalState for FileLocalState {
    fn current_term(&self) -> Term {
        Term::new(self.record.current_term)
    }

    fn voted_for(&self) -> Option<ServerId> {
        self.record.voted_for.map(ServerId)
    }

    fn last_applied(&self) -> Index {
        Index::new(self.record.last_applied)
    }

    fn set_term_and_vote(&mut self, term: Term, voted_for: Option<ServerId>) -> Result<(), io::Error> {
        self.save(LocalStateRecord {
            current_term: term.as_u64(),
            voted_for: voted_for.map(|id| id.as_u32()),
            last_applied: self.record.last_applied,
        })
    }

    fn set_last_applied(&mut self, index: Index) -> Result<(), io::Error> {
        self.save(LocalStateRecord {
            last_applied: index.as_u64(),
            ..self.record.clone()
        })
    }
}
