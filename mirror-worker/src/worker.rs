use {
    crate::{
        commit::CommitBarrier,
        config::Config,
        consumer::{KafkaSourceStream, SourceStream},
        membership::{MembershipClient, Participant, PartitionStateListener},
        producer::{KafkaRecordSink, RecordSink},
        pump::{Pump, PumpExit},
        topic_map::TopicMap,
        transform::MessageTransformer,
    },
    anyhow::Context,
    std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc, Mutex, PoisonError,
        },
        thread,
        time::Duration,
    },
    tracing::{error, info, warn},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Init,
    Joining,
    Running,
    Draining,
    Stopped,
}

/// Wires the pump, the barrier and the membership session together and owns
/// shutdown orchestration.
pub struct MirrorWorker {
    stream: Arc<dyn SourceStream>,
    sink: Arc<dyn RecordSink>,
    barrier: Arc<CommitBarrier>,
    transformer: Arc<dyn MessageTransformer>,
    topic_map: Arc<TopicMap>,
    membership: Box<dyn MembershipClient>,
    participant: Participant,
    producer_close_grace: Duration,
    shutting_down: AtomicBool,
    pump_stop: Arc<AtomicBool>,
    state: Mutex<LifecycleState>,
}

impl MirrorWorker {
    pub fn new(
        config: &Config,
        topic_map: TopicMap,
        transformer: Arc<dyn MessageTransformer>,
        membership: Box<dyn MembershipClient>,
    ) -> anyhow::Result<Self> {
        let stream = Arc::new(KafkaSourceStream::new(&config.source)?);
        let barrier = Arc::new(CommitBarrier::new(
            Duration::from_millis(config.mirror.offset_commit_interval_ms),
            stream.client_id().to_string(),
        ));
        let sink = Arc::new(KafkaRecordSink::new(
            &config.destination,
            config.mirror.abort_on_send_failure,
            Arc::clone(&barrier),
        )?);
        let participant = config.membership.participant()?;
        Ok(Self::with_parts(
            stream,
            sink,
            barrier,
            transformer,
            Arc::new(topic_map),
            membership,
            participant,
            Duration::from_millis(config.destination.close_grace_ms),
        ))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_parts(
        stream: Arc<dyn SourceStream>,
        sink: Arc<dyn RecordSink>,
        barrier: Arc<CommitBarrier>,
        transformer: Arc<dyn MessageTransformer>,
        topic_map: Arc<TopicMap>,
        membership: Box<dyn MembershipClient>,
        participant: Participant,
        producer_close_grace: Duration,
    ) -> Self {
        Self {
            stream,
            sink,
            barrier,
            transformer,
            topic_map,
            membership,
            participant,
            producer_close_grace,
            shutting_down: AtomicBool::new(false),
            pump_stop: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(LifecycleState::Init),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: LifecycleState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        info!("lifecycle {:?} -> {next:?}", *state);
        *state = next;
    }

    /// Requests a clean shutdown. Safe to call from any thread, any number
    /// of times; only the first call wins. Returns whether this call started
    /// the shutdown.
    pub fn initiate_shutdown(&self) -> bool {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!("shutdown requested, draining mirror pump");
            self.set_state(LifecycleState::Draining);
            self.pump_stop.store(true, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Joins the membership service, runs the pump to completion and tears
    /// everything down. Blocks the calling thread for the lifetime of the
    /// worker. Returns an error when the pump died without a shutdown
    /// request; the process must then exit non-zero so peers rebalance.
    pub fn run(self: Arc<Self>) -> anyhow::Result<()> {
        self.set_state(LifecycleState::Joining);
        let listener = Arc::new(AssignmentListener {
            stream: Arc::clone(&self.stream),
        });
        let worker = Arc::downgrade(&self);
        let handle = self
            .membership
            .join(
                self.participant.clone(),
                listener,
                Box::new(move || {
                    let Some(worker) = worker.upgrade() else {
                        return;
                    };
                    if worker.shutting_down.load(Ordering::SeqCst) {
                        info!("membership session closed during shutdown");
                    } else {
                        // Eviction: drain exactly the way an operator
                        // shutdown would.
                        warn!("membership session lost, starting clean shutdown");
                        worker.initiate_shutdown();
                    }
                }),
            )
            .context("failed to join membership")?;

        let pump = Pump::new(
            Arc::clone(&self.stream),
            Arc::clone(&self.sink),
            Arc::clone(&self.barrier),
            Arc::clone(&self.transformer),
            Arc::clone(&self.topic_map),
            Arc::clone(&self.pump_stop),
        );
        let (latch_tx, latch_rx) = crossbeam_channel::bounded::<PumpExit>(1);
        let pump_thread = thread::Builder::new()
            .name("mirror-pump".to_string())
            .spawn(move || {
                let _ = latch_tx.send(pump.run());
            })
            .context("failed to spawn pump thread")?;
        {
            // A shutdown request may already have moved the state to
            // Draining; the lock orders this against initiate_shutdown.
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if !self.shutting_down.load(Ordering::SeqCst) {
                info!("lifecycle {:?} -> {:?}", *state, LifecycleState::Running);
                *state = LifecycleState::Running;
            }
        }

        // A disconnected latch means the pump panicked.
        let exit = latch_rx.recv().unwrap_or(PumpExit::Aborted);
        let _ = pump_thread.join();

        if !self.shutting_down.load(Ordering::SeqCst) {
            // The pump died on its own. A partially mirroring worker is
            // worse than none; exit so peers rebalance the partitions.
            self.set_state(LifecycleState::Stopped);
            if self.barrier.aborted() {
                self.sink.close_now();
            }
            if let Err(error) = handle.disconnect() {
                warn!("membership disconnect failed: {error:#}");
            }
            anyhow::bail!("mirror pump exited unexpectedly ({exit:?})");
        }

        match self
            .barrier
            .maybe_flush_and_commit(true, &*self.sink, &*self.stream)
        {
            Ok(true) => info!("final offsets committed"),
            Ok(false) => warn!("final offset commit skipped"),
            Err(error) => error!("final flush-and-commit failed: {error:#}"),
        }
        self.stream.shutdown();
        if self.barrier.aborted() {
            self.sink.close_now();
        } else {
            self.sink.close(self.producer_close_grace);
        }
        if let Err(error) = handle.disconnect() {
            warn!("membership disconnect failed: {error:#}");
        }
        self.set_state(LifecycleState::Stopped);
        info!(
            dropped = self.barrier.dropped(),
            "mirror worker stopped cleanly"
        );
        Ok(())
    }
}

/// Routes membership transitions into the consumer's assignment set.
struct AssignmentListener {
    stream: Arc<dyn SourceStream>,
}

impl PartitionStateListener for AssignmentListener {
    fn partition_online(&self, topic: &str, partition: i32) {
        if let Err(error) = self.stream.assign(topic, partition) {
            error!(topic, partition, "failed to apply online transition: {error:#}");
        }
    }

    fn partition_offline(&self, topic: &str, partition: i32) {
        if let Err(error) = self.stream.revoke(topic, partition) {
            error!(topic, partition, "failed to apply offline transition: {error:#}");
        }
    }
}
