use {
    crate::{commit::CommitBarrier, config::ConfigDestination},
    anyhow::Context as _,
    rdkafka::{
        config::ClientConfig,
        error::KafkaError,
        producer::{
            BaseRecord, DeliveryResult, Producer, ProducerContext, PurgeConfig, ThreadedProducer,
        },
        types::RDKafkaErrorCode,
        ClientContext, Message,
    },
    std::{sync::Arc, thread, time::Duration},
    tracing::{debug, error, info, warn},
};

/// Producer settings applied unless the user set them. Overriding any of
/// these trades away delivery or ordering guarantees, so an override is
/// kept but called out in the log.
const ENFORCED_DEFAULTS: &[(&str, &str)] = &[
    ("acks", "all"),
    ("retries", "2147483647"),
    // One request per connection keeps per-partition order intact under
    // librdkafka's internal retries.
    ("max.in.flight.requests.per.connection", "1"),
    // No local delivery expiry: a record stays queued until acknowledged.
    ("message.timeout.ms", "0"),
];

const ENQUEUE_RETRY_DELAY: Duration = Duration::from_millis(100);
const FLUSH_WAIT: Duration = Duration::from_millis(500);

/// Source coordinates of a record in flight, attached to the send as the
/// delivery opaque and returned with its delivery report.
#[derive(Debug, Clone)]
pub struct SourcePosition {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// A record bound for the destination cluster.
#[derive(Debug, Clone)]
pub struct SinkRecord {
    pub topic: String,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
}

/// Destination-cluster producer seam.
pub trait RecordSink: Send + Sync {
    /// Hands a record to the producer for asynchronous delivery. The
    /// in-flight count is raised before the transport sees the record.
    fn send(&self, record: SinkRecord, source: SourcePosition) -> anyhow::Result<()>;
    /// Blocks until local buffers have been handed to the network layer.
    fn flush(&self) -> anyhow::Result<()>;
    fn close(&self, grace: Duration);
    /// Drops buffered records immediately. Abort paths only.
    fn close_now(&self);
}

struct DeliveryTracker {
    barrier: Arc<CommitBarrier>,
    abort_on_send_failure: bool,
}

impl ClientContext for DeliveryTracker {}

impl ProducerContext for DeliveryTracker {
    type DeliveryOpaque = Box<SourcePosition>;

    // Runs on the producer poll thread. librdkafka forbids destroying the
    // client from inside its own callback, so the zero-grace close after a
    // fatal failure is performed by the thread that observes the flag, not
    // here.
    fn delivery(&self, delivery_result: &DeliveryResult<'_>, source: Self::DeliveryOpaque) {
        match delivery_result {
            Ok(_) => self.barrier.delivery_succeeded(),
            Err((error, message)) => {
                error!(
                    topic = message.topic(),
                    key = ?message.key().map(String::from_utf8_lossy),
                    src_partition = source.partition,
                    src_offset = source.offset,
                    "failed to deliver record: {error}"
                );
                self.barrier.delivery_failed(self.abort_on_send_failure);
            }
        }
    }
}

pub struct KafkaRecordSink {
    producer: ThreadedProducer<DeliveryTracker>,
    barrier: Arc<CommitBarrier>,
    abort_on_send_failure: bool,
}

impl KafkaRecordSink {
    pub fn new(
        config: &ConfigDestination,
        abort_on_send_failure: bool,
        barrier: Arc<CommitBarrier>,
    ) -> anyhow::Result<Self> {
        let client_config = Self::build_config(config);
        let producer = client_config
            .create_with_context(DeliveryTracker {
                barrier: Arc::clone(&barrier),
                abort_on_send_failure,
            })
            .context("failed to create destination producer")?;
        info!("destination producer created");
        Ok(Self {
            producer,
            barrier,
            abort_on_send_failure,
        })
    }

    /// Builds the librdkafka config for the destination side, applying the
    /// enforced defaults for keys the user left unset. There is no
    /// block-on-full property in librdkafka; `send` gets the same behaviour
    /// by retrying on a full queue.
    fn build_config(config: &ConfigDestination) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        for (key, value) in config.kafka.iter() {
            client_config.set(key, value);
        }
        for (key, default) in ENFORCED_DEFAULTS {
            match config.kafka.get(*key) {
                Some(value) if value != default => warn!(
                    "destination config overrides {key}={value} (default {default}), \
                     records may be lost or reordered"
                ),
                Some(_) => {}
                None => {
                    client_config.set(*key, *default);
                }
            }
        }
        client_config
    }

    fn drop_unqueued(&self, source: &SourcePosition, error: &KafkaError) {
        error!(
            src_topic = source.topic,
            src_partition = source.partition,
            src_offset = source.offset,
            "failed to enqueue record: {error}"
        );
        self.barrier.delivery_failed(self.abort_on_send_failure);
    }
}

impl RecordSink for KafkaRecordSink {
    fn send(&self, record: SinkRecord, source: SourcePosition) -> anyhow::Result<()> {
        self.barrier.record_sent();
        let mut base: BaseRecord<'_, [u8], [u8], Box<SourcePosition>> =
            BaseRecord::with_opaque_to(&record.topic, Box::new(source));
        if let Some(key) = record.key.as_deref() {
            base = base.key(key);
        }
        if let Some(payload) = record.payload.as_deref() {
            base = base.payload(payload);
        }
        loop {
            match self.producer.send(base) {
                Ok(()) => return Ok(()),
                // Local buffer full: backpressure the pump instead of
                // dropping the record, unless an abort is already underway.
                Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), returned))
                    if !self.barrier.aborted() =>
                {
                    base = returned;
                    thread::sleep(ENQUEUE_RETRY_DELAY);
                }
                Err((error, returned)) => {
                    self.drop_unqueued(&returned.delivery_opaque, &error);
                    return Ok(());
                }
            }
        }
    }

    fn flush(&self) -> anyhow::Result<()> {
        loop {
            match self.producer.flush(FLUSH_WAIT) {
                Ok(()) => return Ok(()),
                Err(KafkaError::Flush(RDKafkaErrorCode::OperationTimedOut)) => {
                    if self.barrier.aborted() {
                        return Ok(());
                    }
                    debug!(
                        queued = self.producer.in_flight_count(),
                        "producer still draining"
                    );
                }
                Err(error) => return Err(error).context("producer flush failed"),
            }
        }
    }

    fn close(&self, grace: Duration) {
        if let Err(error) = self.producer.flush(grace) {
            warn!("destination producer closed with undelivered records: {error}");
        }
        info!("destination producer closed");
    }

    fn close_now(&self) {
        warn!(
            queued = self.producer.in_flight_count(),
            "closing destination producer without grace, purging queued records"
        );
        self.producer
            .purge(PurgeConfig::default().queue().inflight());
    }
}
