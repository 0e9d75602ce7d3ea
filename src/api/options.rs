use std::convert::TryFrom;
use tokio::time::Duration;

#[derive(Clone, Default)]
pub struct RaftOptions {
    pub leader_heartbeat_duration: Option<Duration>,
    pub election_min_timeout: Option<Duration>,
    pub election_max_timeout: Option<Duration>,
    pub peer_connect_timeout: Option<Duration>,
    pub peer_rebind_delay: Option<Duration>,
    pub actor_queue_size: Option<usize>,
}

#[derive(Clone, Debug)]
pub(crate) struct RaftOptionsValidated {
    pub leader_heartbeat_duration: Duration,
    pub election_min_timeout: Duration,
    pub election_max_timeout: Duration,
    pub peer_connect_timeout: Duration,
    pub peer_rebind_delay: Duration,
    pub actor_queue_size: usize,
}

impl RaftOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.leader_heartbeat_duration.is_zero()
            || self.election_min_timeout.is_zero()
            || self.peer_connect_timeout.is_zero()
            || self.peer_rebind_delay.is_zero()
        {
            return Err("Durations must be greater than zero");
        }
        if self.leader_heartbeat_duration >= self.election_min_timeout {
            return Err("Election minimum timeout must be greater than leader's heartbeat");
        }
        if self.election_min_timeout > self.election_max_timeout {
            return Err("Election minimum timeout must not exceed maximum timeout");
        }
        if self.actor_queue_size == 0 {
            return Err("Actor queue size must be greater than zero");
        }

        Ok(())
    }
}

impl TryFrom<RaftOptions> for RaftOptionsValidated {
    type Error = &'static str;

    fn try_from(options: RaftOptions) -> Result<Self, Self::Error> {
        let values = RaftOptionsValidated {
            leader_heartbeat_duration: options.leader_heartbeat_duration.unwrap_or(Duration::from_secs(2)),
            election_min_timeout: options.election_min_timeout.unwrap_or(Duration::from_secs(5)),
            election_max_timeout: options.election_max_timeout.unwrap_or(Duration::from_secs(10)),
            peer_connect_timeout: options.peer_connect_timeout.unwrap_or(Duration::from_secs(1)),
            peer_rebind_delay: options.peer_rebind_delay.unwrap_or(Duration::from_secs(1)),
            actor_queue_size: options.actor_queue_size.unwrap_or(256),
        };

        values.validate()?;
        Ok(values)
    }
}
