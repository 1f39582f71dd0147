use {
    crate::{consumer::SourceStream, producer::RecordSink, prom},
    std::{
        sync::{
            atomic::{AtomicU64, Ordering},
            Condvar, Mutex, MutexGuard, PoisonError,
        },
        time::{Duration, Instant},
    },
    tracing::{debug, info},
};

/// Bounded wait per drain iteration. Delivery reports signal the condition,
/// the timeout is a safety net against a transport that loses one.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

struct FlowState {
    /// Sends handed to the producer without a terminal delivery report yet.
    in_flight: u64,
    /// Once true, mirroring is compromised and offsets must not be
    /// committed. Never reset.
    send_failed: bool,
    last_commit: Instant,
}

/// Tracks un-acked sends and holds offset commits back until every in-flight
/// record has a terminal outcome.
///
/// Delivery callbacks run on producer-owned threads; every transition on
/// `FlowState` happens under the same mutex the drain loop waits on, so the
/// drain predicate can never observe a torn update and a waiter that sees
/// `in_flight == 0` is guaranteed to also see a `send_failed` raised before
/// the final decrement.
pub struct CommitBarrier {
    state: Mutex<FlowState>,
    drained: Condvar,
    commit_interval: Duration,
    dropped: AtomicU64,
    client_id: String,
}

impl CommitBarrier {
    pub fn new(commit_interval: Duration, client_id: String) -> Self {
        Self {
            state: Mutex::new(FlowState {
                in_flight: 0,
                send_failed: false,
                last_commit: Instant::now(),
            }),
            drained: Condvar::new(),
            commit_interval,
            dropped: AtomicU64::new(0),
            client_id,
        }
    }

    fn lock(&self) -> MutexGuard<'_, FlowState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Accounts for a record about to be handed to the producer transport.
    /// Must run before the enqueue so that a synchronously-delivered report
    /// cannot decrement below zero.
    pub fn record_sent(&self) {
        let mut state = self.lock();
        state.in_flight += 1;
        prom::in_flight_records_set(state.in_flight as i64);
    }

    pub fn delivery_succeeded(&self) {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        prom::in_flight_records_set(state.in_flight as i64);
        prom::mirrored_messages_inc(&self.client_id);
        if state.in_flight == 0 || state.send_failed {
            self.drained.notify_all();
        }
    }

    /// Terminal failure of one send. The failure flag is raised before the
    /// in-flight decrement so that a drain waiter woken by the final
    /// decrement always observes it.
    pub fn delivery_failed(&self, abort_on_send_failure: bool) {
        let mut state = self.lock();
        if abort_on_send_failure && !state.send_failed {
            state.send_failed = true;
            info!("delivery failure is fatal, blocking further commits");
        }
        self.dropped.fetch_add(1, Ordering::Relaxed);
        prom::dropped_messages_inc(&self.client_id);
        state.in_flight = state.in_flight.saturating_sub(1);
        prom::in_flight_records_set(state.in_flight as i64);
        if state.in_flight == 0 || state.send_failed {
            self.drained.notify_all();
        }
    }

    /// Marks mirroring as compromised without a send being involved, e.g. an
    /// unhandled pump error. Frees any drain waiter.
    pub fn force_abort(&self) {
        let mut state = self.lock();
        if !state.send_failed {
            state.send_failed = true;
            self.drained.notify_all();
        }
    }

    pub fn aborted(&self) -> bool {
        self.lock().send_failed
    }

    pub fn in_flight(&self) -> u64 {
        self.lock().in_flight
    }

    /// Count of records whose delivery terminated in failure.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Flushes the producer, waits until every in-flight send has a terminal
    /// outcome, then commits consumer offsets. Without `force` the whole
    /// operation is skipped until the commit interval has elapsed. Returns
    /// whether a commit happened.
    ///
    /// Offsets are committed only when `in_flight == 0` and no send has
    /// failed; every committed offset therefore corresponds to a record whose
    /// delivery was acknowledged.
    pub fn maybe_flush_and_commit(
        &self,
        force: bool,
        sink: &dyn RecordSink,
        stream: &dyn SourceStream,
    ) -> anyhow::Result<bool> {
        if !force {
            let state = self.lock();
            if state.last_commit.elapsed() < self.commit_interval {
                return Ok(false);
            }
        }

        sink.flush()?;

        let mut state = self.lock();
        while !state.send_failed && state.in_flight > 0 {
            let (guard, _) = self
                .drained
                .wait_timeout(state, DRAIN_POLL_INTERVAL)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
        if state.send_failed {
            debug!("skipping offset commit after delivery failure");
            return Ok(false);
        }
        drop(state);

        stream.commit()?;

        let mut state = self.lock();
        state.last_commit = Instant::now();
        drop(state);
        prom::last_commit_timestamp_update();
        debug!("offsets committed");
        Ok(true)
    }
}
