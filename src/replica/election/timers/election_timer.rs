use crate::actor;
use crate::replica::election::timers::shared_option::SharedOption;
use crate::replica::election::timers::time::{Clock, RealClock};
use rand::Rng;
use std::ops::RangeInclusive;
use std::sync::{Arc, Weak};
use tokio::time::{Duration, Instant};

/// Owned by the Follower and Candidate states. Dropping the handle stops the timer task.
pub(crate) struct ElectionTimerHandle<C: Clock = RealClock> {
    shared: Arc<Shared<C>>,
    // Latest deadline handed to the task. Lets the actor tell a real timeout from a stale one.
    deadline: Instant,
}

struct Shared<C: Clock> {
    next_wake_time: SharedOption<Instant>,
    timeout_range: RangeInclusive<Duration>,
    clock: C,
}

struct ElectionTimerTask<C: Clock> {
    weak_shared: Weak<Shared<C>>,
    next_wake_time: SharedOption<Instant>,
    actor_client: actor::WeakActorClient,
    clock: C,
    // Static pause between two consecutive timeout events, so that a busy actor isn't flooded
    // while it's handling the first one.
    timeout_backoff: Duration,
}

impl ElectionTimerHandle {
    pub(crate) fn spawn_timer_task(
        min_timeout: Duration,
        max_timeout: Duration,
        actor_client: actor::WeakActorClient,
    ) -> Self {
        let (task, handle) = ElectionTimerTask::new(min_timeout, max_timeout, actor_client, RealClock);
        tokio::task::spawn(task.run());

        handle
    }
}

impl<C: Clock + Send + Sync + 'static> ElectionTimerHandle<C> {
    /// Pick a fresh random timeout, counting from now.
    pub(crate) fn reset_timeout(&mut self) {
        let rand_timeout = rand::thread_rng().gen_range(self.shared.timeout_range.clone());
        self.deadline = self.shared.clock.now() + rand_timeout;
        self.shared.next_wake_time.replace(self.deadline);
    }

    /// False if the timer was reset after the task decided to fire.
    pub(crate) fn is_expired(&self) -> bool {
        self.shared.clock.now() >= self.deadline
    }
}

impl<C: Clock + Send + Sync + 'static> ElectionTimerTask<C> {
    fn new(
        min_timeout: Duration,
        max_timeout: Duration,
        actor_client: actor::WeakActorClient,
        clock: C,
    ) -> (Self, ElectionTimerHandle<C>) {
        let next_wake_time = SharedOption::new();
        let shared = Arc::new(Shared {
            next_wake_time: next_wake_time.clone(),
            timeout_range: RangeInclusive::new(min_timeout, max_timeout),
            clock: clock.clone(),
        });

        let task = ElectionTimerTask {
            weak_shared: Arc::downgrade(&shared),
            next_wake_time,
            actor_client,
            clock: clock.clone(),
            timeout_backoff: min_timeout,
        };
        let mut handle = ElectionTimerHandle {
            shared,
            deadline: clock.now(),
        };

        // Task must have a deadline present when it starts, otherwise it would fire immediately.
        handle.reset_timeout();

        (task, handle)
    }

    async fn run(mut self) {
        loop {
            match self.next_wake_time.take() {
                Some(wake_time) => {
                    self.clock.sleep_until(wake_time).await;
                }
                None => {
                    // Slept until the latest deadline and nobody moved it. Keep firing until the
                    // handle drops, in case the actor ignored the event as stale.
                    if self.weak_shared.strong_count() == 0 {
                        return;
                    }
                    if self.actor_client.election_timeout().await.is_err() {
                        return;
                    }
                    self.clock.sleep(self.timeout_backoff).await;
                }
            }

            // Handle dropped: we changed election state. The new state owns a new timer.
            if self.weak_shared.strong_count() == 0 {
                return;
            }
        }
    }
}
