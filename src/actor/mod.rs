use crate::commitlog;
use crate::replica::{self, ServerId};
use crate::transport::FrameSink;
use bytes::Bytes;
use std::error::Error;
use std::fmt::Debug;
use tokio::sync::{mpsc, oneshot};

// v1 Design choice: Disk interaction will be synchronous. Future improvement: There should be a
//                   Disk Actor.
//
// v1 Design choice: Raft lib will contain application state machine. Future improvement: We should
//                   just send to a channel, where the app has the receiver and applies to state
//                   machine.
#[derive(Debug)]
pub(crate) enum Event {
    // Leader: Handle replies from followers. Step down on higher term.
    // Candidate: Count votes. Step down if someone else won.
    // Follower: Append entries, grant votes. Reset timeout.
    PeerMessage { from: ServerId, payload: Bytes },

    // Leader: Write to disk, replicate, respond once applied. Callback only carries the index.
    // Candidate: Reject request.
    // Follower: Redirect.
    ClientCommand(
        replica::ClientCommandInput,
        Callback<replica::ClientCommandOutput, replica::ClientCommandError>,
    ),

    // Leader: Send AppendEntries to every peer, as heartbeat or to catch them up.
    // Candidate: NOT POSSIBLE - discard
    // Follower: NOT POSSIBLE - discard
    LeaderTimer(replica::LeaderTimerTick),

    // Leader: NOT POSSIBLE - discard
    // Candidate: Start a new election in the next term.
    // Follower: Transition to candidate. Trigger new election.
    ElectionTimeout,
}

#[derive(Debug)]
pub(crate) struct Callback<O: Debug, E: Error>(oneshot::Sender<Result<O, E>>);

impl<O: Debug, E: Error> Callback<O, E> {
    pub fn send(self, message: Result<O, E>) {
        // Caller may have given up waiting. Nothing to do about it.
        let _ = self.0.send(message);
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Raft replica event loop actor has exited")]
pub struct ActorExited;

/// ActorClient is the strong handle to the replica actor. The event loop runs for as long as at
/// least one ActorClient is alive.
#[derive(Clone)]
pub struct ActorClient {
    sender: mpsc::Sender<Event>,
}

impl ActorClient {
    pub(crate) fn new(buffer_size: usize) -> (ActorClient, mpsc::Receiver<Event>) {
        let (sender, receiver) = mpsc::channel(buffer_size);

        (ActorClient { sender }, receiver)
    }

    pub(crate) fn weak(&self) -> WeakActorClient {
        WeakActorClient {
            sender: self.sender.downgrade(),
        }
    }

    pub async fn client_command(
        &self,
        input: replica::ClientCommandInput,
    ) -> Result<replica::ClientCommandOutput, replica::ClientCommandError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Event::ClientCommand(input, Callback(tx)))
            .await
            .map_err(|_| replica::ClientCommandError::ActorExited)?;

        rx.await.map_err(|_| replica::ClientCommandError::ActorExited)?
    }
}

/// WeakActorClient is held by everything the actor owns, directly or indirectly, so that it
/// doesn't keep itself alive.
#[derive(Clone)]
pub struct WeakActorClient {
    sender: mpsc::WeakSender<Event>,
}

impl WeakActorClient {
    pub(crate) async fn election_timeout(&self) -> Result<(), ActorExited> {
        self.send(Event::ElectionTimeout).await
    }

    pub(crate) async fn leader_timer(&self, tick: replica::LeaderTimerTick) -> Result<(), ActorExited> {
        self.send(Event::LeaderTimer(tick)).await
    }

    pub(crate) async fn peer_message(&self, from: ServerId, payload: Bytes) -> Result<(), ActorExited> {
        self.send(Event::PeerMessage { from, payload }).await
    }

    async fn send(&self, event: Event) -> Result<(), ActorExited> {
        let sender = self.sender.upgrade().ok_or(ActorExited)?;
        sender.send(event).await.map_err(|_| ActorExited)
    }
}

/// PeerInbox tags every frame from one peer link with the peer's id and hands it to the actor.
pub(crate) struct PeerInbox {
    from: ServerId,
    actor_client: WeakActorClient,
}

impl PeerInbox {
    pub(crate) fn new(from: ServerId, actor_client: WeakActorClient) -> Self {
        PeerInbox { from, actor_client }
    }
}

#[async_trait::async_trait]
impl FrameSink for PeerInbox {
    async fn deliver(&self, frame: Bytes) {
        // Server is shutting down if this fails. Peers will retry against whoever is left.
        let _ = self.actor_client.peer_message(self.from, frame).await;
    }
}

/// ReplicaActor is replica logic in actor model.
pub(crate) struct ReplicaActor<L, S>
where
    L: commitlog::Log<replica::RaftLogEntry>,
    S: replica::PersistentLocalState,
{
    receiver: mpsc::Receiver<Event>,
    replica: replica::Replica<L, S>,
}

impl<L, S> ReplicaActor<L, S>
where
    L: commitlog::Log<replica::RaftLogEntry>,
    S: replica::PersistentLocalState,
{
    pub(crate) fn new(receiver: mpsc::Receiver<Event>, replica: replica::Replica<L, S>) -> Self {
        ReplicaActor { receiver, replica }
    }

    pub(crate) async fn run_event_loop(mut self) {
        while let Some(event) = self.receiver.recv().await {
            self.handle_event(event);
        }
    }

    // This must NOT be async. Any long running work must be spawned on another actor
    // and/or come as a callback to this actor.
    fn handle_event(&mut self, event: Event) {
        match event {
            Event::PeerMessage { from, payload } => {
                self.replica.handle_peer_message(from, payload);
            }
            Event::ClientCommand(input, callback) => {
                let result = self.replica.handle_client_command(input);
                callback.send(result);
            }
            Event::LeaderTimer(tick) => {
                self.replica.handle_leader_timer(tick);
            }
            Event::ElectionTimeout => {
                self.replica.handle_election_timeout();
            }
        }
    }
}
