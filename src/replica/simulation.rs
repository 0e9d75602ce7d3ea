//! A deterministic, in-process cluster of replicas. Messages sit in a shared queue until the test
//! decides to deliver, drop, or reorder them.

use crate::actor::ActorClient;
use crate::commitlog::{InMemoryLog, Index, Log};
use crate::replica::messages::{MessageKind, PeerMessage, WireLogEntry};
use crate::replica::{
    ClientCommandError, ClientCommandInput, ClientCommandOutput, ClientGateway, ElectionStateSnapshot,
    LeaderRedirectInfo, LeaderTimerTick, Peer, PeerSender, PersistentLocalState, RaftLogEntry, Replica,
    ReplicaConfig, ServerId, StateMachine, StateMachineOutput, Term, VolatileLocalState,
};
use bytes::Bytes;
use prost::Message;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type SimReplica = Replica<InMemoryLog<RaftLogEntry>, VolatileLocalState>;

struct Envelope {
    from: ServerId,
    to: ServerId,
    payload: Bytes,
}

type Network = Arc<Mutex<VecDeque<Envelope>>>;

struct SimSender {
    from: ServerId,
    to: ServerId,
    network: Network,
}

impl PeerSender for SimSender {
    fn send(&self, payload: Bytes) {
        self.network.lock().unwrap().push_back(Envelope {
            from: self.from,
            to: self.to,
            payload,
        });
    }
}

#[derive(Debug, Clone, PartialEq)]
enum GatewayEvent {
    Serving,
    Redirecting(Option<ServerId>),
    Responded(Index, Bytes),
}

#[derive(Clone, Default)]
struct RecordingGateway {
    events: Arc<Mutex<Vec<GatewayEvent>>>,
}

impl ClientGateway for RecordingGateway {
    fn start_serving(&self) {
        self.events.lock().unwrap().push(GatewayEvent::Serving);
    }

    fn start_redirecting(&self, leader: Option<LeaderRedirectInfo>) {
        self.events
            .lock()
            .unwrap()
            .push(GatewayEvent::Redirecting(leader.map(|info| info.server_id)));
    }

    fn respond_to_client(&self, _term: Term, index: Index, response: Bytes) {
        self.events.lock().unwrap().push(GatewayEvent::Responded(index, response));
    }
}

#[derive(Clone, Default)]
struct RecordingStateMachine {
    applied: Arc<Mutex<Vec<Bytes>>>,
}

impl StateMachine for RecordingStateMachine {
    fn apply_committed_entry(&mut self, entry: Bytes) -> StateMachineOutput {
        self.applied.lock().unwrap().push(entry.clone());
        let mut output = b"applied:".to_vec();
        output.extend_from_slice(&entry);
        StateMachineOutput::Data(Bytes::from(output))
    }
}

/// Makes writes fail while set, like a full disk.
#[derive(Clone, Default)]
struct DiskFailure(Arc<AtomicBool>);

impl DiskFailure {
    fn set(&self, failing: bool) {
        self.0.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), io::Error> {
        if self.0.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "No space left on device"));
        }
        Ok(())
    }
}

struct FailingLocalState {
    state: VolatileLocalState,
    failure: DiskFailure,
}

impl PersistentLocalState for FailingLocalState {
    fn current_term(&self) -> Term {
        self.state.current_term()
    }

    fn voted_for(&self) -> Option<ServerId> {
        self.state.voted_for()
    }

    fn last_applied(&self) -> Index {
        self.state.last_applied()
    }

    fn set_term_and_vote(&mut self, term: Term, voted_for: Option<ServerId>) -> Result<(), io::Error> {
        self.failure.check()?;
        self.state.set_term_and_vote(term, voted_for)
    }

    fn set_last_applied(&mut self, index: Index) -> Result<(), io::Error> {
        self.failure.check()?;
        self.state.set_last_applied(index)
    }
}

struct FailingLog {
    log: InMemoryLog<RaftLogEntry>,
    failure: DiskFailure,
}

impl Log<RaftLogEntry> for FailingLog {
    fn append(&mut self, entry: RaftLogEntry) -> Result<Index, io::Error> {
        self.failure.check()?;
        self.log.append(entry)
    }

    fn read(&mut self, index: Index) -> Result<Option<RaftLogEntry>, io::Error> {
        self.log.read(index)
    }

    fn remove_last(&mut self) -> Result<bool, io::Error> {
        self.failure.check()?;
        self.log.remove_last()
    }

    fn last_index(&self) -> Option<Index> {
        self.log.last_index()
    }
}

fn client_address(id: u32) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, 6000 + id as u16)
}

/// Server `my_id` of a `size` member cluster. Everything it sends lands in `network`.
///
/// Timers are never allowed to fire on their own. Tests drive elections and heartbeats.
fn build_replica<L, S>(
    my_id: u32,
    size: u32,
    log: L,
    local_state: S,
    network: &Network,
) -> (Replica<L, S>, RecordingGateway, RecordingStateMachine)
where
    L: Log<RaftLogEntry>,
    S: PersistentLocalState,
{
    // Timer tasks hold a weak handle, so with the strong one gone they can't reach anyone.
    let (actor_client, _rx) = ActorClient::new(1);

    let peers = (0..size)
        .filter(|peer_id| *peer_id != my_id)
        .map(|peer_id| Peer {
            id: ServerId(peer_id),
            client_address: client_address(peer_id),
            sender: Box::new(SimSender {
                from: ServerId(my_id),
                to: ServerId(peer_id),
                network: network.clone(),
            }),
        })
        .collect();
    let gateway = RecordingGateway::default();
    let state_machine = RecordingStateMachine::default();

    let (replica, _listener) = Replica::new(ReplicaConfig {
        logger: slog::Logger::root(slog::Discard, slog::o!("ServerId" => my_id)),
        my_id: ServerId(my_id),
        peers,
        log,
        local_state,
        state_machine: Box::new(state_machine.clone()),
        client_gateway: Box::new(gateway.clone()),
        actor_client: actor_client.weak(),
        leader_heartbeat_duration: Duration::from_secs(3600),
        election_min_timeout: Duration::from_secs(7200),
        election_max_timeout: Duration::from_secs(7200),
    })
    .unwrap();

    (replica, gateway, state_machine)
}

/// Everything sent so far, as `(to, message)`.
fn take_sent(network: &Network) -> Vec<(ServerId, PeerMessage)> {
    network
        .lock()
        .unwrap()
        .drain(..)
        .map(|envelope| (envelope.to, PeerMessage::decode(envelope.payload).unwrap()))
        .collect()
}

struct SimulatedCluster {
    replicas: Vec<SimReplica>,
    network: Network,
    gateways: Vec<RecordingGateway>,
    state_machines: Vec<RecordingStateMachine>,
    // Who was leader in each term, across the whole run.
    leaders_by_term: BTreeMap<Term, ServerId>,
    commit_indexes: Vec<Index>,
    trace: Vec<(ServerId, ServerId, PeerMessage)>,
    // Everything sent to or from this server is lost.
    isolated: Option<ServerId>,
}

impl SimulatedCluster {
    fn new(size: u32) -> Self {
        Self::with_terms(vec![Term::new(0); size as usize])
    }

    fn with_terms(terms: Vec<Term>) -> Self {
        let network: Network = Arc::default();
        let size = terms.len() as u32;

        let mut replicas = vec![];
        let mut gateways = vec![];
        let mut state_machines = vec![];
        for (my_id, term) in (0..size).zip(terms) {
            let (replica, gateway, state_machine) = build_replica(
                my_id,
                size,
                InMemoryLog::create(),
                VolatileLocalState::with_term(term),
                &network,
            );

            replicas.push(replica);
            gateways.push(gateway);
            state_machines.push(state_machine);
        }

        SimulatedCluster {
            replicas,
            network,
            gateways,
            state_machines,
            leaders_by_term: BTreeMap::new(),
            commit_indexes: vec![Index::new(0); size as usize],
            trace: vec![],
            isolated: None,
        }
    }

    fn replica(&mut self, id: u32) -> &mut SimReplica {
        &mut self.replicas[id as usize]
    }

    fn start_election(&mut self, id: u32) {
        self.replica(id).start_election();
        self.check_invariants();
    }

    fn heartbeat(&mut self, id: u32) {
        let term = self.replica(id).current_term();
        self.replica(id).handle_leader_timer(LeaderTimerTick { term });
        self.check_invariants();
    }

    fn client_command(&mut self, id: u32, command: &'static str) -> Result<ClientCommandOutput, ClientCommandError> {
        let result = self.replica(id).handle_client_command(ClientCommandInput {
            command: Bytes::from_static(command.as_bytes()),
        });
        self.check_invariants();
        result
    }

    fn pending_messages(&self) -> usize {
        self.network.lock().unwrap().len()
    }

    fn take_message(&self, i: usize) -> Option<Envelope> {
        self.network.lock().unwrap().remove(i)
    }

    fn deliver(&mut self, envelope: Envelope) {
        if self.isolated == Some(envelope.from) || self.isolated == Some(envelope.to) {
            return;
        }
        if let Ok(message) = PeerMessage::decode(envelope.payload.clone()) {
            self.trace.push((envelope.from, envelope.to, message));
        }
        self.replicas[envelope.to.as_u32() as usize].handle_peer_message(envelope.from, envelope.payload);
        self.check_invariants();
    }

    /// In order, nothing lost, until the network is quiet.
    fn deliver_all(&mut self) {
        for _ in 0..100_000 {
            match self.take_message(0) {
                Some(envelope) => self.deliver(envelope),
                None => return,
            }
        }
        panic!("Network never went quiet");
    }

    /// Deliver up to `steps` messages, picked at random from the queue, dropping some.
    fn deliver_randomly(&mut self, rng: &mut StdRng, steps: usize, drop_rate: f64) {
        for _ in 0..steps {
            let pending = self.pending_messages();
            if pending == 0 {
                return;
            }
            let envelope = match self.take_message(rng.gen_range(0..pending)) {
                Some(envelope) => envelope,
                None => return,
            };
            if !rng.gen_bool(drop_rate) {
                self.deliver(envelope);
            }
        }
    }

    fn drop_all_messages(&mut self) {
        self.network.lock().unwrap().clear();
    }

    fn check_invariants(&mut self) {
        for (i, replica) in self.replicas.iter().enumerate() {
            let id = ServerId(i as u32);
            if let ElectionStateSnapshot::Leader { term } = replica.election_state() {
                let leader = *self.leaders_by_term.entry(term).or_insert(id);
                assert_eq!(leader, id, "Two leaders in term {:?}", term);
            }

            let commit_index = replica.commit_index();
            assert!(
                commit_index >= self.commit_indexes[i],
                "Commit index of {:?} went backwards from {:?} to {:?}",
                id,
                self.commit_indexes[i],
                commit_index
            );
            self.commit_indexes[i] = commit_index;
        }
    }

    fn leaders(&self) -> Vec<(ServerId, Term)> {
        self.replicas
            .iter()
            .enumerate()
            .filter_map(|(i, replica)| match replica.election_state() {
                ElectionStateSnapshot::Leader { term } => Some((ServerId(i as u32), term)),
                _ => None,
            })
            .collect()
    }

    /// The leader of the highest term, if anyone thinks they're leader.
    fn current_leader(&self) -> Option<u32> {
        self.leaders()
            .into_iter()
            .max_by_key(|(_, term)| *term)
            .map(|(id, _)| id.as_u32())
    }

    fn log_terms(&mut self, id: u32) -> Vec<u64> {
        self.replica(id)
            .log_entries()
            .iter()
            .map(|entry| entry.term.as_u64())
            .collect()
    }

    fn append_terms(&mut self, id: u32, terms: &[u64]) {
        for term in terms {
            self.replica(id).append_to_log(RaftLogEntry {
                term: Term::new(*term),
                data: Bytes::from(format!("cmd-{}", term)),
            });
        }
    }

    fn gateway_events(&self, id: u32) -> Vec<GatewayEvent> {
        self.gateways[id as usize].events.lock().unwrap().clone()
    }

    fn applied(&self, id: u32) -> Vec<Bytes> {
        self.state_machines[id as usize].applied.lock().unwrap().clone()
    }

    /// Lossless network, elect whoever has the most up-to-date log, push everything through.
    fn stabilize(&mut self) -> u32 {
        self.drop_all_messages();
        let best = (0..self.replicas.len() as u32)
            .max_by_key(|id| self.replicas[*id as usize].latest_entry())
            .unwrap();
        // The first try can lose to someone already in a higher term. By the second, we're past it.
        for _ in 0..3 {
            self.start_election(best);
            self.deliver_all();
            if self.leaders() == vec![(ServerId(best), self.replicas[best as usize].current_term())] {
                break;
            }
        }
        assert_eq!(self.current_leader(), Some(best));
        assert_eq!(self.leaders().len(), 1);

        // Entries from earlier terms only commit along with one from the current term.
        self.client_command(best, "stabilize").unwrap();
        self.deliver_all();
        self.heartbeat(best);
        self.deliver_all();

        best
    }

    fn assert_logs_match(&mut self) {
        let logs: Vec<Vec<RaftLogEntry>> = self.replicas.iter_mut().map(|r| r.log_entries()).collect();
        for a in 0..logs.len() {
            for b in (a + 1)..logs.len() {
                // > If two entries in different logs have the same index and term, then the logs
                // > are identical in all entries up through the given index.
                let common = logs[a].len().min(logs[b].len());
                for i in (0..common).rev() {
                    if logs[a][i].term == logs[b][i].term {
                        assert_eq!(logs[a][..=i], logs[b][..=i], "Logs of {} and {} diverge", a, b);
                        break;
                    }
                }
            }
        }
    }

    fn assert_committed_prefixes_match(&mut self) {
        let logs: Vec<Vec<RaftLogEntry>> = self.replicas.iter_mut().map(|r| r.log_entries()).collect();
        for a in 0..logs.len() {
            for b in (a + 1)..logs.len() {
                let committed = self.commit_indexes[a].min(self.commit_indexes[b]).as_usize();
                assert_eq!(logs[a][..committed], logs[b][..committed]);
            }
        }
    }
}

#[tokio::test]
async fn three_node_election_and_commit() {
    let mut cluster = SimulatedCluster::new(3);

    cluster.start_election(0);
    cluster.deliver_all();

    assert_eq!(cluster.leaders(), vec![(ServerId(0), Term::new(1))]);
    for id in [1, 2] {
        assert_eq!(
            cluster.replica(id).election_state(),
            ElectionStateSnapshot::Follower {
                term: Term::new(1),
                leader: ServerId(0)
            }
        );
        assert_eq!(cluster.replica(id).voted_for(), Some(ServerId(0)));
    }
    assert!(cluster.gateway_events(0).contains(&GatewayEvent::Serving));
    assert_eq!(
        cluster.gateway_events(1).last(),
        Some(&GatewayEvent::Redirecting(Some(ServerId(0))))
    );

    let output = cluster.client_command(0, "echo hi").unwrap();
    assert_eq!(output.index, Index::new(1));
    assert_eq!(output.term, Term::new(1));
    assert_eq!(cluster.replica(0).commit_index(), Index::new(0));

    cluster.deliver_all();

    assert_eq!(cluster.replica(0).commit_index(), Index::new(1));
    assert_eq!(cluster.applied(0), vec![Bytes::from_static(b"echo hi")]);
    assert_eq!(
        cluster.gateway_events(0).last(),
        Some(&GatewayEvent::Responded(Index::new(1), Bytes::from_static(b"applied:echo hi")))
    );
    for id in 0..3 {
        assert_eq!(
            cluster.replica(id).log_entries(),
            vec![RaftLogEntry {
                term: Term::new(1),
                data: Bytes::from_static(b"echo hi"),
            }]
        );
    }

    // Followers learn about the commit on the next heartbeat. They never respond to clients.
    cluster.heartbeat(0);
    cluster.deliver_all();
    for id in [1, 2] {
        assert_eq!(cluster.replica(id).commit_index(), Index::new(1));
        assert_eq!(cluster.applied(id), vec![Bytes::from_static(b"echo hi")]);
        assert!(!cluster
            .gateway_events(id)
            .iter()
            .any(|event| matches!(event, GatewayEvent::Responded(..))));
    }
}

#[tokio::test]
async fn follower_rejects_mismatched_previous_entry_and_leader_backs_off() {
    let mut cluster = SimulatedCluster::with_terms(vec![Term::new(3); 3]);
    cluster.append_terms(0, &[1, 1, 2, 2, 2]);
    cluster.append_terms(1, &[1, 1, 3, 3, 3]);
    cluster.append_terms(2, &[1, 1]);

    // Server 1's log is more up-to-date than 0's, so only 2 votes for 0.
    cluster.start_election(0);
    cluster.deliver_all();
    assert_eq!(cluster.leaders(), vec![(ServerId(0), Term::new(4))]);

    let first_heartbeat = cluster
        .trace
        .iter()
        .find(|(from, to, m)| {
            *from == ServerId(0) && *to == ServerId(1) && m.message_kind() == Some(MessageKind::AppendEntriesRequest)
        })
        .map(|(_, _, m)| m.clone())
        .unwrap();
    assert_eq!((first_heartbeat.prev_log_index, first_heartbeat.prev_log_term), (5, 2));

    let first_reply = cluster
        .trace
        .iter()
        .find(|(from, to, m)| {
            *from == ServerId(1) && *to == ServerId(0) && m.message_kind() == Some(MessageKind::AppendEntriesResponse)
        })
        .map(|(_, _, m)| m.clone())
        .unwrap();
    assert!(!first_reply.success);
    assert_eq!(first_reply.appended_log_index, 6);

    // Leader walked back to index 2 and overwrote the rest.
    let prev_indexes_sent_to_1: Vec<u64> = cluster
        .trace
        .iter()
        .filter(|(from, to, m)| {
            *from == ServerId(0) && *to == ServerId(1) && m.message_kind() == Some(MessageKind::AppendEntriesRequest)
        })
        .map(|(_, _, m)| m.prev_log_index)
        .collect();
    assert_eq!(prev_indexes_sent_to_1, vec![5, 4, 3, 2, 3, 4]);

    for id in 0..3 {
        assert_eq!(cluster.log_terms(id), vec![1, 1, 2, 2, 2]);
    }

    // Nothing from an earlier term is committed by counting replicas.
    assert_eq!(cluster.replica(0).commit_index(), Index::new(0));

    // An entry from the current term commits everything before it.
    let output = cluster.client_command(0, "ls").unwrap();
    assert_eq!(output.index, Index::new(6));
    cluster.deliver_all();
    assert_eq!(cluster.replica(0).commit_index(), Index::new(6));
    assert_eq!(cluster.applied(0).len(), 6);

    // Only the entry appended this term has a client waiting.
    let responses: Vec<GatewayEvent> = cluster
        .gateway_events(0)
        .into_iter()
        .filter(|event| matches!(event, GatewayEvent::Responded(..)))
        .collect();
    assert_eq!(
        responses,
        vec![GatewayEvent::Responded(Index::new(6), Bytes::from_static(b"applied:ls"))]
    );
}

#[tokio::test]
async fn vote_goes_to_first_candidate_only() {
    let mut cluster = SimulatedCluster::new(3);

    cluster.start_election(1);
    cluster.start_election(2);
    cluster.deliver_all();

    assert_eq!(cluster.leaders(), vec![(ServerId(1), Term::new(1))]);
    assert_eq!(cluster.replica(0).voted_for(), Some(ServerId(1)));
    assert_eq!(
        cluster.replica(2).election_state(),
        ElectionStateSnapshot::Follower {
            term: Term::new(1),
            leader: ServerId(1)
        }
    );
}

#[tokio::test]
async fn candidate_with_stale_log_is_not_elected() {
    let mut cluster = SimulatedCluster::with_terms(vec![Term::new(1); 3]);
    cluster.append_terms(1, &[1]);
    cluster.append_terms(2, &[1]);

    cluster.start_election(0);
    cluster.deliver_all();

    assert!(cluster.leaders().is_empty());
    assert_eq!(
        cluster.replica(0).election_state(),
        ElectionStateSnapshot::Candidate { term: Term::new(2) }
    );
    for id in [1, 2] {
        // Saw the higher term, but didn't vote.
        assert_eq!(cluster.replica(id).current_term(), Term::new(2));
        assert_eq!(cluster.replica(id).voted_for(), None);
    }

    cluster.start_election(1);
    cluster.deliver_all();
    assert_eq!(cluster.leaders(), vec![(ServerId(1), Term::new(3))]);
    assert_eq!(cluster.log_terms(0), vec![1]);
}

#[tokio::test]
async fn stale_leader_is_rejected_and_steps_down() {
    let mut cluster = SimulatedCluster::new(3);
    cluster.start_election(0);
    cluster.deliver_all();

    // Server 0 gets partitioned away and misses a new election.
    cluster.isolated = Some(ServerId(0));
    cluster.start_election(1);
    cluster.deliver_all();
    assert_eq!(cluster.current_leader(), Some(1));
    assert_eq!(cluster.leaders(), vec![(ServerId(0), Term::new(1)), (ServerId(1), Term::new(2))]);

    // Old leader still accepts commands, but can't commit them.
    let stale = cluster.client_command(0, "stale").unwrap();
    assert_eq!(stale.term, Term::new(1));
    cluster.heartbeat(0);
    cluster.deliver_all();
    assert_eq!(cluster.replica(0).commit_index(), Index::new(0));
    assert_eq!(cluster.log_terms(0), vec![1]);

    // The partition heals. The first heartbeat from the new leader demotes the old one.
    cluster.isolated = None;
    cluster.heartbeat(1);
    cluster.deliver_all();
    assert_eq!(
        cluster.replica(0).election_state(),
        ElectionStateSnapshot::Follower {
            term: Term::new(2),
            leader: ServerId(1)
        }
    );
    assert_eq!(
        cluster.gateway_events(0).last(),
        Some(&GatewayEvent::Redirecting(Some(ServerId(1))))
    );

    match cluster.client_command(0, "redirect me") {
        Err(ClientCommandError::NotLeader(Some(info))) => {
            assert_eq!(info.server_id, ServerId(1));
            assert_eq!(info.client_address, client_address(1));
        }
        other => panic!("Expected redirect, got {:?}", other),
    }

    // Replicating the new leader's first entry overwrites the stale one.
    cluster.client_command(1, "fresh").unwrap();
    cluster.deliver_all();
    for id in 0..3 {
        assert_eq!(cluster.log_terms(id), vec![2]);
    }
    assert_eq!(cluster.replica(1).commit_index(), Index::new(1));
    assert!(cluster.applied(0).is_empty());
}

#[tokio::test]
async fn malformed_and_spoofed_messages_are_dropped() {
    let mut cluster = SimulatedCluster::new(3);

    cluster
        .replica(0)
        .handle_peer_message(ServerId(1), Bytes::from_static(&[0xff, 0xff, 0xff]));

    // Claims to be from 2, but arrived on the link from 1.
    let spoofed = PeerMessage::new(MessageKind::RequestVoteRequest, 9, 2);
    cluster
        .replica(0)
        .handle_peer_message(ServerId(1), Bytes::from(spoofed.encode_to_vec()));

    assert_eq!(cluster.pending_messages(), 0);
    assert_eq!(cluster.replica(0).current_term(), Term::new(0));
}

#[tokio::test]
async fn single_node_commits_immediately() {
    let mut cluster = SimulatedCluster::new(1);

    cluster.start_election(0);
    assert_eq!(cluster.leaders(), vec![(ServerId(0), Term::new(1))]);

    let output = cluster.client_command(0, "whoami").unwrap();

    assert_eq!(cluster.replica(0).commit_index(), output.index);
    assert_eq!(
        cluster.gateway_events(0).last(),
        Some(&GatewayEvent::Responded(Index::new(1), Bytes::from_static(b"applied:whoami")))
    );
    assert_eq!(cluster.pending_messages(), 0);
}

#[tokio::test]
async fn election_safety_under_random_delivery() {
    let mut runs_with_a_leader = 0;
    for seed in 0..30 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut cluster = SimulatedCluster::new(5);

        for _ in 0..40 {
            // A few servers time out around the same time.
            for id in 0..5 {
                if rng.gen_bool(0.15) {
                    cluster.start_election(id);
                }
            }
            cluster.deliver_randomly(&mut rng, 30, 0.2);
            if let Some(leader) = cluster.current_leader() {
                if rng.gen_bool(0.5) {
                    cluster.heartbeat(leader);
                }
            }
        }

        // check_invariants ran after every step.
        if !cluster.leaders_by_term.is_empty() {
            runs_with_a_leader += 1;
        }
    }
    assert!(runs_with_a_leader > 0);
}

#[tokio::test]
async fn logs_converge_under_loss_and_reorder() {
    for seed in 0..20 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut cluster = SimulatedCluster::new(5);
        cluster.start_election(0);
        cluster.deliver_all();

        let commands = ["a", "b", "c", "d", "e", "f", "g", "h"];
        for round in 0..60 {
            if let Some(leader) = cluster.current_leader() {
                if rng.gen_bool(0.3) {
                    // Ignore NotLeader, that leader may have stepped down already.
                    let _ = cluster.client_command(leader, commands[round % commands.len()]);
                }
                if rng.gen_bool(0.5) {
                    cluster.heartbeat(leader);
                }
            }
            if rng.gen_bool(0.05) {
                cluster.start_election(rng.gen_range(0..5));
            }
            cluster.deliver_randomly(&mut rng, 25, 0.25);
            cluster.assert_logs_match();
            cluster.assert_committed_prefixes_match();
        }

        let leader = cluster.stabilize();
        cluster.assert_logs_match();

        let leader_log = cluster.replica(leader).log_entries();
        let last_index = Index::new_usize(leader_log.len());
        for id in 0..5 {
            assert_eq!(cluster.replica(id).log_entries(), leader_log, "Seed {}", seed);
            assert_eq!(cluster.replica(id).commit_index(), last_index, "Seed {}", seed);
            assert_eq!(cluster.applied(id).len(), leader_log.len(), "Seed {}", seed);
        }
    }
}

#[tokio::test]
async fn vote_is_not_granted_when_it_cannot_be_persisted() {
    let network = Network::default();
    let failure = DiskFailure::default();
    let local_state = FailingLocalState {
        state: VolatileLocalState::with_term(Term::new(1)),
        failure: failure.clone(),
    };
    let (mut replica, _gateway, _state_machine) = build_replica(0, 3, InMemoryLog::create(), local_state, &network);
    let request = Bytes::from(PeerMessage::new(MessageKind::RequestVoteRequest, 1, 1).encode_to_vec());

    failure.set(true);
    replica.handle_peer_message(ServerId(1), request.clone());

    let replies = take_sent(&network);
    assert_eq!(replies.len(), 1);
    let (to, reply) = &replies[0];
    assert_eq!(*to, ServerId(1));
    assert_eq!(reply.message_kind(), Some(MessageKind::RequestVoteResponse));
    assert!(!reply.vote_granted);
    assert_eq!(replica.voted_for(), None);

    // Same request once the disk recovers.
    failure.set(false);
    replica.handle_peer_message(ServerId(1), request);

    let replies = take_sent(&network);
    assert_eq!(replies.len(), 1);
    assert!(replies[0].1.vote_granted);
    assert_eq!(replica.voted_for(), Some(ServerId(1)));
}

#[tokio::test]
async fn higher_term_is_not_adopted_when_it_cannot_be_persisted() {
    let network = Network::default();
    let failure = DiskFailure::default();
    let local_state = FailingLocalState {
        state: VolatileLocalState::with_term(Term::new(1)),
        failure: failure.clone(),
    };
    let (mut replica, gateway, _state_machine) = build_replica(0, 3, InMemoryLog::create(), local_state, &network);

    failure.set(true);
    let request = PeerMessage::new(MessageKind::RequestVoteRequest, 5, 2);
    replica.handle_peer_message(ServerId(2), Bytes::from(request.encode_to_vec()));

    assert!(take_sent(&network).is_empty());
    assert_eq!(replica.current_term(), Term::new(1));
    assert_eq!(replica.voted_for(), None);
    assert!(gateway.events.lock().unwrap().is_empty());
}

#[tokio::test]
async fn election_is_not_started_when_new_term_cannot_be_persisted() {
    let network = Network::default();
    let failure = DiskFailure::default();
    let local_state = FailingLocalState {
        state: VolatileLocalState::new(),
        failure: failure.clone(),
    };
    let (mut replica, gateway, _state_machine) = build_replica(0, 3, InMemoryLog::create(), local_state, &network);

    failure.set(true);
    replica.start_election();

    assert!(take_sent(&network).is_empty());
    assert_eq!(replica.current_term(), Term::new(0));
    assert_eq!(
        replica.election_state(),
        ElectionStateSnapshot::FollowerNoLeader { term: Term::new(0) }
    );
    assert!(gateway.events.lock().unwrap().is_empty());

    failure.set(false);
    replica.start_election();

    let requests = take_sent(&network);
    assert_eq!(requests.len(), 2);
    for (_, request) in requests {
        assert_eq!(request.message_kind(), Some(MessageKind::RequestVoteRequest));
        assert_eq!(request.term, 1);
    }
}

#[tokio::test]
async fn append_entries_is_rejected_when_log_write_fails() {
    let network = Network::default();
    let failure = DiskFailure::default();
    let log = FailingLog {
        log: InMemoryLog::create(),
        failure: failure.clone(),
    };
    let (mut replica, _gateway, _state_machine) =
        build_replica(0, 3, log, VolatileLocalState::with_term(Term::new(1)), &network);

    let mut request = PeerMessage::new(MessageKind::AppendEntriesRequest, 1, 1);
    request.entries = vec![WireLogEntry {
        term: 1,
        command: Bytes::from_static(b"ls"),
    }];
    let request = Bytes::from(request.encode_to_vec());

    failure.set(true);
    replica.handle_peer_message(ServerId(1), request.clone());

    let replies = take_sent(&network);
    assert_eq!(replies.len(), 1);
    let (to, reply) = &replies[0];
    assert_eq!(*to, ServerId(1));
    assert_eq!(reply.message_kind(), Some(MessageKind::AppendEntriesResponse));
    assert!(!reply.success);
    assert_eq!(reply.appended_log_index, 1);
    assert!(replica.log_entries().is_empty());

    failure.set(false);
    replica.handle_peer_message(ServerId(1), request);

    let replies = take_sent(&network);
    assert_eq!(replies.len(), 1);
    assert!(replies[0].1.success);
    assert_eq!(replies[0].1.appended_log_index, 1);
    assert_eq!(
        replica.log_entries(),
        vec![RaftLogEntry {
            term: Term::new(1),
            data: Bytes::from_static(b"ls"),
        }]
    );
}

#[tokio::test]
async fn restart_resumes_applying_after_last_applied() {
    // What a server finds on disk after applying "one" and "two", then crashing.
    let mut log = InMemoryLog::create();
    log.append(RaftLogEntry::placeholder()).unwrap();
    for command in ["one", "two", "three"] {
        log.append(RaftLogEntry {
            term: Term::new(1),
            data: Bytes::from_static(command.as_bytes()),
        })
        .unwrap();
    }
    let mut local_state = VolatileLocalState::with_term(Term::new(1));
    local_state.set_last_applied(Index::new(2)).unwrap();

    let network = Network::default();
    let (mut replica, gateway, state_machine) = build_replica(0, 1, log, local_state, &network);
    assert_eq!(replica.commit_index(), Index::new(2));

    replica.start_election();
    assert_eq!(replica.election_state(), ElectionStateSnapshot::Leader { term: Term::new(2) });
    // "three" is from an older term. It only commits along with an entry from this one.
    assert!(state_machine.applied.lock().unwrap().is_empty());

    replica
        .handle_client_command(ClientCommandInput {
            command: Bytes::from_static(b"four"),
        })
        .unwrap();

    assert_eq!(
        *state_machine.applied.lock().unwrap(),
        vec![Bytes::from_static(b"three"), Bytes::from_static(b"four")]
    );
    let responses: Vec<GatewayEvent> = gateway
        .events
        .lock()
        .unwrap()
        .iter()
        .filter(|event| matches!(event, GatewayEvent::Responded(..)))
        .cloned()
        .collect();
    assert_eq!(
        responses,
        vec![GatewayEvent::Responded(Index::new(4), Bytes::from_static(b"applied:four"))]
    );
}
