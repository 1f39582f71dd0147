use {
    crate::config::ConfigSource,
    anyhow::Context,
    rdkafka::{
        config::ClientConfig,
        consumer::{BaseConsumer, CommitMode, Consumer},
        error::KafkaError,
        types::RDKafkaErrorCode,
        Message, TopicPartitionList,
    },
    std::{
        collections::BTreeSet,
        sync::{
            atomic::{AtomicBool, Ordering},
            Mutex, PoisonError,
        },
        time::Duration,
    },
    tracing::{info, trace, warn},
};

const DEFAULT_CLIENT_ID: &str = "mirror-worker";

/// A record pulled from the source cluster, together with its coordinates.
#[derive(Debug, Clone)]
pub struct SourceRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
}

#[derive(Debug)]
pub enum PollOutcome {
    Record(SourceRecord),
    /// Nothing arrived within the poll timeout. Recoverable; the pump uses
    /// it as a heartbeat for periodic maintenance.
    Timeout,
    /// The stream will yield no further records.
    EndOfStream,
}

/// Source-cluster consumer seam. Offset commits are always explicit; the
/// flush-commit barrier is the only caller of `commit`.
pub trait SourceStream: Send + Sync {
    fn poll_record(&self) -> anyhow::Result<PollOutcome>;
    /// Persist, for every assigned partition, the next offset to consume.
    fn commit(&self) -> anyhow::Result<()>;
    fn assign(&self, topic: &str, partition: i32) -> anyhow::Result<()>;
    fn revoke(&self, topic: &str, partition: i32) -> anyhow::Result<()>;
    fn shutdown(&self);
    fn client_id(&self) -> &str;
    fn group_id(&self) -> &str;
}

pub struct KafkaSourceStream {
    consumer: BaseConsumer,
    assignment: Mutex<BTreeSet<(String, i32)>>,
    closed: AtomicBool,
    poll_timeout: Duration,
    client_id: String,
    group_id: String,
}

impl KafkaSourceStream {
    pub fn new(config: &ConfigSource) -> anyhow::Result<Self> {
        let (client_config, client_id, group_id) = Self::build_config(config)?;
        let consumer: BaseConsumer = client_config
            .create()
            .context("failed to create source consumer")?;
        info!(client_id, group_id, "source consumer created");
        Ok(Self {
            consumer,
            assignment: Mutex::new(BTreeSet::new()),
            closed: AtomicBool::new(false),
            poll_timeout: Duration::from_millis(config.poll_timeout_ms),
            client_id,
            group_id,
        })
    }

    /// Builds the librdkafka config for the source side. Auto-commit is
    /// forced off: a commit must never cover a record that is still waiting
    /// for a delivery report.
    fn build_config(config: &ConfigSource) -> anyhow::Result<(ClientConfig, String, String)> {
        let group_id = config
            .kafka
            .get("group.id")
            .cloned()
            .context("source config is missing group.id")?;
        let client_id = config
            .kafka
            .get("client.id")
            .cloned()
            .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string());

        let mut client_config = ClientConfig::new();
        for (key, value) in config.kafka.iter() {
            client_config.set(key, value);
        }
        if let Some(requested) = config.kafka.get("enable.auto.commit") {
            if requested != "false" {
                warn!("source config sets enable.auto.commit={requested}, forcing false");
            }
        }
        client_config.set("enable.auto.commit", "false");
        client_config.set("client.id", &client_id);
        Ok((client_config, client_id, group_id))
    }

    fn push_assignment(&self, assignment: &BTreeSet<(String, i32)>) -> anyhow::Result<()> {
        let mut list = TopicPartitionList::new();
        for (topic, partition) in assignment.iter() {
            list.add_partition(topic, *partition);
        }
        self.consumer
            .assign(&list)
            .context("failed to update partition assignment")
    }
}

impl SourceStream for KafkaSourceStream {
    fn poll_record(&self) -> anyhow::Result<PollOutcome> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(PollOutcome::EndOfStream);
        }
        match self.consumer.poll(self.poll_timeout) {
            None => {
                trace!("no record within poll timeout");
                Ok(PollOutcome::Timeout)
            }
            Some(Ok(message)) => Ok(PollOutcome::Record(SourceRecord {
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
                key: message.key().map(<[u8]>::to_vec),
                payload: message.payload().map(<[u8]>::to_vec),
            })),
            Some(Err(error)) => Err(error).context("source consumer poll failed"),
        }
    }

    fn commit(&self) -> anyhow::Result<()> {
        match self.consumer.commit_consumer_state(CommitMode::Sync) {
            Ok(()) => Ok(()),
            // Nothing consumed since the last commit.
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => Ok(()),
            Err(error) => Err(error).context("offset commit failed"),
        }
    }

    fn assign(&self, topic: &str, partition: i32) -> anyhow::Result<()> {
        let mut assignment = self
            .assignment
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if assignment.insert((topic.to_string(), partition)) {
            info!(topic, partition, "partition assigned");
            self.push_assignment(&assignment)
        } else {
            Ok(())
        }
    }

    fn revoke(&self, topic: &str, partition: i32) -> anyhow::Result<()> {
        let mut assignment = self
            .assignment
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if assignment.remove(&(topic.to_string(), partition)) {
            info!(topic, partition, "partition revoked");
            self.push_assignment(&assignment)
        } else {
            Ok(())
        }
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut assignment = self
            .assignment
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        assignment.clear();
        if let Err(error) = self.push_assignment(&assignment) {
            warn!("failed to clear assignment on shutdown: {error:#}");
        }
        info!("source consumer shut down");
    }

    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn group_id(&self) -> &str {
        &self.group_id
    }
}
