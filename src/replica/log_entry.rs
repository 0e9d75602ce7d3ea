use crate::commitlog;
use crate::replica::Term;
use bytes::Bytes;
use std::convert::TryFrom;
use std::io;

const TERM_SIZE: usize = 4;

/// Byte representation:
///
/// ```text
/// | 0 | 1 | 2 | 3 | 4 | 5 | ... |
/// +---+---+---+---+---+---+-...-+
/// | Term (u32 LE) | Data  ...   |
/// +---------------+-------...---+
/// ```
///
/// * `Term` - raft leadership term when this entry was created
/// * `Data` - the client's command
///
/// Not needed:
///
/// * Size/length of `Data` is not needed; the underlying commitlog will give us the correctly allocated array.
#[derive(Clone, Debug, PartialEq)]
pub struct RaftLogEntry {
    pub term: Term,
    pub data: Bytes,
}

impl RaftLogEntry {
    /// Sits at index 0 of every log, so that the entry before the first real one always exists.
    pub(crate) fn placeholder() -> Self {
        RaftLogEntry {
            term: Term::new(0),
            data: Bytes::new(),
        }
    }
}

impl commitlog::Entry for RaftLogEntry {
    fn to_bytes(&self) -> Result<Vec<u8>, io::Error> {
        let term = u32::try_from(self.term.as_u64()).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("term {:?} does not fit the log record format", self.term),
            )
        })?;

        let mut bytes = Vec::with_capacity(TERM_SIZE + self.data.len());
        bytes.extend_from_slice(&term.to_le_bytes());
        bytes.extend_from_slice(&self.data);
        Ok(bytes)
    }
}

impl TryFrom<Vec<u8>> for RaftLogEntry {
    type Error = io::Error;

    fn try_from(mut bytes: Vec<u8>) -> Result<Self, Self::Error> {
        if bytes.len() < TERM_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("log record of {} bytes is too short to hold a term", bytes.len()),
            ));
        }

        let data = bytes.split_off(TERM_SIZE);
        let mut term = [0u8; TERM_SIZE];
        term.copy_from_slice(&bytes);

        Ok(RaftLogEntry {
            term: Term::new(u32::from_le_bytes(term) as u64),
            data: Bytes::from(data),
        })
    }
}
