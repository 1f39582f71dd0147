use {
    crate::{
        commit::CommitBarrier,
        consumer::{PollOutcome, SourceStream},
        producer::{RecordSink, SinkRecord, SourcePosition},
        topic_map::TopicMap,
        transform::MessageTransformer,
    },
    std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    tracing::{error, info},
};

/// Why the pump loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    /// The lifecycle controller asked the pump to stop.
    Stopped,
    /// The source stream ended on its own.
    StreamClosed,
    /// Mirroring is compromised; no further offsets will be committed.
    Aborted,
}

enum Step {
    Continue,
    StreamClosed,
}

/// Single long-lived task driving consume, transform, produce. Runs on its
/// own thread; every other actor talks to it through the stop flag and the
/// barrier.
pub struct Pump {
    stream: Arc<dyn SourceStream>,
    sink: Arc<dyn RecordSink>,
    barrier: Arc<CommitBarrier>,
    transformer: Arc<dyn MessageTransformer>,
    topic_map: Arc<TopicMap>,
    stop: Arc<AtomicBool>,
}

impl Pump {
    pub fn new(
        stream: Arc<dyn SourceStream>,
        sink: Arc<dyn RecordSink>,
        barrier: Arc<CommitBarrier>,
        transformer: Arc<dyn MessageTransformer>,
        topic_map: Arc<TopicMap>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            stream,
            sink,
            barrier,
            transformer,
            topic_map,
            stop,
        }
    }

    pub fn run(&self) -> PumpExit {
        info!("mirror pump started");
        let exit = loop {
            if self.stop.load(Ordering::Acquire) {
                break PumpExit::Stopped;
            }
            if self.barrier.aborted() {
                break PumpExit::Aborted;
            }
            match self.step() {
                Ok(Step::Continue) => {}
                Ok(Step::StreamClosed) => break PumpExit::StreamClosed,
                Err(error) => {
                    error!("mirror pump failed: {error:#}");
                    self.barrier.force_abort();
                    break PumpExit::Aborted;
                }
            }
        };
        info!("mirror pump exited: {exit:?}");
        exit
    }

    fn step(&self) -> anyhow::Result<Step> {
        let record = match self.stream.poll_record()? {
            PollOutcome::Record(record) => record,
            // Heartbeat for low-volume partitions: nothing new, but the
            // commit interval may have elapsed.
            PollOutcome::Timeout => {
                self.barrier
                    .maybe_flush_and_commit(false, &*self.sink, &*self.stream)?;
                return Ok(Step::Continue);
            }
            PollOutcome::EndOfStream => return Ok(Step::StreamClosed),
        };

        let outputs = self.transformer.handle(&record)?;
        let destination_topic = self.topic_map.resolve(&record.topic);
        for output in outputs {
            self.sink.send(
                SinkRecord {
                    topic: destination_topic.to_string(),
                    key: output.key,
                    payload: output.payload,
                },
                SourcePosition {
                    topic: record.topic.clone(),
                    partition: record.partition,
                    offset: record.offset,
                },
            )?;
        }

        self.barrier
            .maybe_flush_and_commit(false, &*self.sink, &*self.stream)?;
        Ok(Step::Continue)
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{consumer::SourceRecord, transform::MirrorRecord},
        anyhow::anyhow,
        std::{
            collections::{HashSet, VecDeque},
            sync::{
                atomic::{AtomicUsize, Ordering},
                Mutex,
            },
            thread,
            time::Duration,
        },
    };

    struct ScriptedStream {
        outcomes: Mutex<VecDeque<anyhow::Result<PollOutcome>>>,
        /// When the script runs dry: yield timeouts forever instead of
        /// ending the stream.
        idle_when_empty: bool,
        commits: AtomicUsize,
    }

    impl ScriptedStream {
        fn new(outcomes: Vec<anyhow::Result<PollOutcome>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                idle_when_empty: false,
                commits: AtomicUsize::new(0),
            }
        }

        fn records(topic: &str, offsets: std::ops::Range<i64>) -> Vec<anyhow::Result<PollOutcome>> {
            offsets
                .map(|offset| {
                    Ok(PollOutcome::Record(SourceRecord {
                        topic: topic.to_string(),
                        partition: 0,
                        offset,
                        key: Some(offset.to_string().into_bytes()),
                        payload: Some(b"payload".to_vec()),
                    }))
                })
                .collect()
        }
    }

    impl SourceStream for ScriptedStream {
        fn poll_record(&self) -> anyhow::Result<PollOutcome> {
            match self.outcomes.lock().unwrap().pop_front() {
                Some(outcome) => outcome,
                None if self.idle_when_empty => {
                    thread::sleep(Duration::from_millis(5));
                    Ok(PollOutcome::Timeout)
                }
                None => Ok(PollOutcome::EndOfStream),
            }
        }

        fn commit(&self) -> anyhow::Result<()> {
            self.commits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn assign(&self, _topic: &str, _partition: i32) -> anyhow::Result<()> {
            Ok(())
        }

        fn revoke(&self, _topic: &str, _partition: i32) -> anyhow::Result<()> {
            Ok(())
        }

        fn shutdown(&self) {}

        fn client_id(&self) -> &str {
            "test-client"
        }

        fn group_id(&self) -> &str {
            "test-group"
        }
    }

    /// Completes every send synchronously, failing the offsets it was told
    /// to fail.
    struct InstantAckSink {
        barrier: Arc<CommitBarrier>,
        sent: Mutex<Vec<(SinkRecord, SourcePosition)>>,
        fail_offsets: HashSet<i64>,
        abort_on_send_failure: bool,
    }

    impl InstantAckSink {
        fn new(barrier: Arc<CommitBarrier>) -> Self {
            Self {
                barrier,
                sent: Mutex::new(Vec::new()),
                fail_offsets: HashSet::new(),
                abort_on_send_failure: true,
            }
        }

        fn sent_offsets(&self) -> Vec<i64> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|(_, source)| source.offset)
                .collect()
        }
    }

    impl RecordSink for InstantAckSink {
        fn send(&self, record: SinkRecord, source: SourcePosition) -> anyhow::Result<()> {
            self.barrier.record_sent();
            let failed = self.fail_offsets.contains(&source.offset);
            self.sent.lock().unwrap().push((record, source));
            if failed {
                self.barrier.delivery_failed(self.abort_on_send_failure);
            } else {
                self.barrier.delivery_succeeded();
            }
            Ok(())
        }

        fn flush(&self) -> anyhow::Result<()> {
            Ok(())
        }

        fn close(&self, _grace: Duration) {}

        fn close_now(&self) {}
    }

    struct NullTransformer;

    impl MessageTransformer for NullTransformer {
        fn handle(&self, _record: &SourceRecord) -> anyhow::Result<Vec<MirrorRecord>> {
            Ok(Vec::new())
        }
    }

    struct FailingTransformer;

    impl MessageTransformer for FailingTransformer {
        fn handle(&self, _record: &SourceRecord) -> anyhow::Result<Vec<MirrorRecord>> {
            Err(anyhow!("boom"))
        }
    }

    struct PumpParts {
        stream: Arc<ScriptedStream>,
        sink: Arc<InstantAckSink>,
        barrier: Arc<CommitBarrier>,
        stop: Arc<AtomicBool>,
    }

    fn pump_with(
        parts: &PumpParts,
        transformer: Arc<dyn MessageTransformer>,
        topic_map: TopicMap,
    ) -> Pump {
        Pump::new(
            Arc::clone(&parts.stream) as _,
            Arc::clone(&parts.sink) as _,
            Arc::clone(&parts.barrier),
            transformer,
            Arc::new(topic_map),
            Arc::clone(&parts.stop),
        )
    }

    fn parts(
        outcomes: Vec<anyhow::Result<PollOutcome>>,
        commit_interval: Duration,
    ) -> PumpParts {
        let barrier = Arc::new(CommitBarrier::new(commit_interval, "test-client".to_string()));
        PumpParts {
            stream: Arc::new(ScriptedStream::new(outcomes)),
            sink: Arc::new(InstantAckSink::new(Arc::clone(&barrier))),
            barrier,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    #[test]
    fn mirrors_records_in_offset_order() {
        let parts = parts(ScriptedStream::records("events", 0..10), Duration::ZERO);
        let pump = pump_with(
            &parts,
            Arc::new(crate::transform::IdentityTransformer),
            TopicMap::parse("events events-mirrored"),
        );

        assert_eq!(pump.run(), PumpExit::StreamClosed);
        assert_eq!(parts.sink.sent_offsets(), (0..10).collect::<Vec<_>>());
        let sent = parts.sink.sent.lock().unwrap();
        assert!(sent
            .iter()
            .all(|(record, _)| record.topic == "events-mirrored"));
        drop(sent);
        assert_eq!(parts.barrier.dropped(), 0);
        assert_eq!(parts.stream.commits.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn continues_past_non_fatal_delivery_failure() {
        let mut parts = parts(ScriptedStream::records("events", 0..10), Duration::ZERO);
        {
            let sink = Arc::get_mut(&mut parts.sink).unwrap();
            sink.fail_offsets.insert(5);
            sink.abort_on_send_failure = false;
        }
        let pump = pump_with(
            &parts,
            Arc::new(crate::transform::IdentityTransformer),
            TopicMap::identity(),
        );

        assert_eq!(pump.run(), PumpExit::StreamClosed);
        assert_eq!(parts.sink.sent_offsets().len(), 10);
        assert_eq!(parts.barrier.dropped(), 1);
        assert!(!parts.barrier.aborted());
        assert!(parts.stream.commits.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn fatal_delivery_failure_stops_the_pump_without_commit() {
        let mut parts = parts(
            ScriptedStream::records("events", 0..10),
            Duration::from_secs(3600),
        );
        {
            let sink = Arc::get_mut(&mut parts.sink).unwrap();
            sink.fail_offsets.insert(5);
        }
        let pump = pump_with(
            &parts,
            Arc::new(crate::transform::IdentityTransformer),
            TopicMap::identity(),
        );

        assert_eq!(pump.run(), PumpExit::Aborted);
        // Offsets 0..=5 were handed to the sink before the failure surfaced.
        assert_eq!(parts.sink.sent_offsets(), (0..6).collect::<Vec<_>>());
        assert_eq!(parts.barrier.dropped(), 1);
        assert_eq!(parts.stream.commits.load(Ordering::SeqCst), 0);
        assert!(parts.barrier.aborted());
    }

    #[test]
    fn transformer_error_aborts() {
        let parts = parts(ScriptedStream::records("events", 0..3), Duration::ZERO);
        let pump = pump_with(&parts, Arc::new(FailingTransformer), TopicMap::identity());

        assert_eq!(pump.run(), PumpExit::Aborted);
        assert!(parts.barrier.aborted());
        assert!(parts.sink.sent_offsets().is_empty());
    }

    #[test]
    fn stream_error_aborts() {
        let parts = parts(vec![Err(anyhow!("poll failed"))], Duration::ZERO);
        let pump = pump_with(
            &parts,
            Arc::new(crate::transform::IdentityTransformer),
            TopicMap::identity(),
        );

        assert_eq!(pump.run(), PumpExit::Aborted);
        assert!(parts.barrier.aborted());
    }

    #[test]
    fn timeouts_drive_periodic_commits() {
        let parts = parts(
            vec![Ok(PollOutcome::Timeout), Ok(PollOutcome::Timeout)],
            Duration::ZERO,
        );
        let pump = pump_with(
            &parts,
            Arc::new(crate::transform::IdentityTransformer),
            TopicMap::identity(),
        );

        assert_eq!(pump.run(), PumpExit::StreamClosed);
        assert_eq!(parts.stream.commits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn empty_transform_output_skips_the_send() {
        let parts = parts(ScriptedStream::records("events", 0..4), Duration::ZERO);
        let pump = pump_with(&parts, Arc::new(NullTransformer), TopicMap::identity());

        assert_eq!(pump.run(), PumpExit::StreamClosed);
        assert!(parts.sink.sent_offsets().is_empty());
        assert_eq!(parts.stream.commits.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn stop_flag_ends_an_idle_pump() {
        let mut parts = parts(Vec::new(), Duration::from_secs(3600));
        {
            let stream = Arc::get_mut(&mut parts.stream).unwrap();
            stream.idle_when_empty = true;
        }
        let pump = Arc::new(pump_with(
            &parts,
            Arc::new(crate::transform::IdentityTransformer),
            TopicMap::identity(),
        ));

        let runner = {
            let pump = Arc::clone(&pump);
            thread::spawn(move || pump.run())
        };
        thread::sleep(Duration::from_millis(30));
        parts.stop.store(true, Ordering::Release);
        assert_eq!(runner.join().expect("pump thread"), PumpExit::Stopped);
    }
}
