use {crate::config::ConfigMembership, anyhow::Context, std::sync::Arc, tracing::info};

/// Identity under which this worker joins the fleet.
#[derive(Debug, Clone)]
pub struct Participant {
    pub cluster: String,
    pub instance_id: String,
    pub host: String,
}

/// Per-partition state transitions, invoked on the membership thread.
/// Both calls are idempotent.
pub trait PartitionStateListener: Send + Sync {
    fn partition_online(&self, topic: &str, partition: i32);
    fn partition_offline(&self, topic: &str, partition: i32);
}

/// Invoked when the membership session is lost, on the membership thread.
pub type DisconnectHandler = Box<dyn Fn() + Send + Sync>;

/// Live membership session; dropping it without `disconnect` leaks the
/// registration until the coordinator times it out.
pub trait MembershipHandle: Send {
    fn disconnect(&self) -> anyhow::Result<()>;
}

/// Coordination-service seam. The service partitions the work set across
/// fleet instances and notifies each of its slice through the listener.
pub trait MembershipClient: Send + Sync {
    fn join(
        &self,
        participant: Participant,
        listener: Arc<dyn PartitionStateListener>,
        on_disconnect: DisconnectHandler,
    ) -> anyhow::Result<Box<dyn MembershipHandle>>;
}

/// Fixed assignment read from config: every listed partition is reported
/// online at join time and stays owned until shutdown. Used when no external
/// coordinator drives the worker.
pub struct StaticMembership {
    assignments: Vec<(String, i32)>,
}

impl StaticMembership {
    pub fn new(assignments: Vec<(String, i32)>) -> Self {
        Self { assignments }
    }

    pub fn from_config(config: &ConfigMembership) -> anyhow::Result<Self> {
        let assignments = config
            .assignments
            .iter()
            .map(|entry| parse_assignment(entry))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self::new(assignments))
    }
}

/// Parses a `topic:partition` entry.
pub fn parse_assignment(entry: &str) -> anyhow::Result<(String, i32)> {
    let (topic, partition) = entry
        .rsplit_once(':')
        .with_context(|| format!("invalid assignment {entry:?}, expected topic:partition"))?;
    anyhow::ensure!(!topic.is_empty(), "invalid assignment {entry:?}, empty topic");
    let partition = partition
        .parse()
        .with_context(|| format!("invalid assignment {entry:?}, bad partition number"))?;
    Ok((topic.to_string(), partition))
}

impl MembershipClient for StaticMembership {
    fn join(
        &self,
        participant: Participant,
        listener: Arc<dyn PartitionStateListener>,
        on_disconnect: DisconnectHandler,
    ) -> anyhow::Result<Box<dyn MembershipHandle>> {
        info!(
            cluster = participant.cluster,
            instance_id = participant.instance_id,
            host = participant.host,
            partitions = self.assignments.len(),
            "joined with static assignment"
        );
        for (topic, partition) in &self.assignments {
            listener.partition_online(topic, *partition);
        }
        Ok(Box::new(StaticHandle { on_disconnect }))
    }
}

struct StaticHandle {
    on_disconnect: DisconnectHandler,
}

impl MembershipHandle for StaticHandle {
    fn disconnect(&self) -> anyhow::Result<()> {
        (self.on_disconnect)();
        info!("left static membership");
        Ok(())
    }
}
