use bytes::Bytes;

/// StateMachine is the application specific view of applying the replicated logs in sequential
/// consistent order.
pub trait StateMachine {
    /// apply_committed_entry is called only when its guaranteed that the provided entry has been
    /// committed (i.e. replicated to a majority). Because of this guarantee, you will never need
    /// to reverse an entry once you've been asked to apply it, so your impl of applying an entry
    /// need not be reversible. Note: Entry here is synonymous with a state transition.
    ///
    /// The leader will not respond to the client's request until this method call completes. You
    /// can optionally provide an opaque data blob as a result of applying the state transition,
    /// and it is returned to the client that submitted the command.
    ///
    /// An entry may be applied more than once across a crash and restart, if we crash after
    /// applying it but before recording that we did.
    fn apply_committed_entry(&mut self, entry: Bytes) -> StateMachineOutput;
}

#[derive(Debug, Clone, PartialEq)]
pub enum StateMachineOutput {
    Data(Bytes),
    NoData,
}

impl StateMachineOutput {
    pub(crate) fn into_bytes(self) -> Bytes {
        match self {
            StateMachineOutput::Data(data) => data,
            StateMachineOutput::NoData => Bytes::new(),
        }
    }
}

#[derive(Default)]
pub struct NoOpStateMachine {
    // nothing
}

impl NoOpStateMachine {
    pub fn new() -> Self {
        NoOpStateMachine {}
    }
}

impl StateMachine for NoOpStateMachine {
    fn apply_committed_entry(&mut self, _: Bytes) -> StateMachineOutput {
        StateMachineOutput::NoData
    }
}
