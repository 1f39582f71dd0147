use {
    crate::membership::Participant,
    anyhow::Context,
    serde::Deserialize,
    std::{collections::HashMap, net::SocketAddr, path::PathBuf},
    tokio::fs,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub prometheus: Option<SocketAddr>,
    pub source: ConfigSource,
    pub destination: ConfigDestination,
    #[serde(default)]
    pub mirror: ConfigMirror,
    pub membership: ConfigMembership,
}

impl Config {
    pub async fn load(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        json5::from_str(text).context("failed to parse config")
    }
}

/// Source-cluster consumer settings. `kafka` is passed through to librdkafka
/// verbatim and must carry at least `bootstrap.servers` and `group.id`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigSource {
    pub kafka: HashMap<String, String>,
    #[serde(default = "ConfigSource::default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
}

impl ConfigSource {
    const fn default_poll_timeout_ms() -> u64 {
        10_000
    }
}

/// Destination-cluster producer settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigDestination {
    pub kafka: HashMap<String, String>,
    #[serde(default = "ConfigDestination::default_close_grace_ms")]
    pub close_grace_ms: u64,
}

impl ConfigDestination {
    const fn default_close_grace_ms() -> u64 {
        30_000
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ConfigMirror {
    /// Path to the topic mapping file. Absent means identity mapping.
    pub topic_mapping: Option<PathBuf>,
    /// Treat any delivery failure as fatal to the process.
    pub abort_on_send_failure: bool,
    pub offset_commit_interval_ms: u64,
}

impl Default for ConfigMirror {
    fn default() -> Self {
        Self {
            topic_mapping: None,
            abort_on_send_failure: true,
            offset_commit_interval_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigMembership {
    pub cluster: String,
    #[serde(default)]
    pub instance_id: Option<String>,
    /// Static `topic:partition` assignments, used when no external
    /// coordinator drives the worker.
    #[serde(default)]
    pub assignments: Vec<String>,
}

impl ConfigMembership {
    pub fn participant(&self) -> anyhow::Result<Participant> {
        let host = hostname::get()
            .context("failed to resolve hostname")?
            .to_string_lossy()
            .into_owned();
        let instance_id = self.instance_id.clone().unwrap_or_else(|| host.clone());
        Ok(Participant {
            cluster: self.cluster.clone(),
            instance_id,
            host,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        prometheus: "127.0.0.1:8873",
        source: {
            kafka: {
                "bootstrap.servers": "src-kafka:9092",
                "group.id": "mirror",
            },
        },
        destination: {
            kafka: {
                "bootstrap.servers": "dst-kafka:9092",
            },
        },
        mirror: {
            abort_on_send_failure: false,
            offset_commit_interval_ms: 5000,
        },
        membership: {
            cluster: "mirror-fleet",
            assignments: ["events:0", "events:1"],
        },
    }"#;

    #[test]
    fn parse_sample() {
        let config = Config::parse(SAMPLE).expect("valid config");
        assert_eq!(
            config.source.kafka.get("group.id").map(String::as_str),
            Some("mirror")
        );
        assert_eq!(config.source.poll_timeout_ms, 10_000);
        assert_eq!(config.destination.close_grace_ms, 30_000);
        assert!(!config.mirror.abort_on_send_failure);
        assert_eq!(config.mirror.offset_commit_interval_ms, 5000);
        assert_eq!(config.membership.assignments.len(), 2);
    }

    #[test]
    fn mirror_section_defaults() {
        let config = Config::parse(
            r#"{
                source: { kafka: { "bootstrap.servers": "a:9092", "group.id": "g" } },
                destination: { kafka: { "bootstrap.servers": "b:9092" } },
                membership: { cluster: "c" },
            }"#,
        )
        .expect("valid config");
        assert!(config.mirror.abort_on_send_failure);
        assert_eq!(config.mirror.offset_commit_interval_ms, 60_000);
        assert!(config.mirror.topic_mapping.is_none());
        assert!(config.prometheus.is_none());
    }

    #[tokio::test]
    async fn load_missing_file_fails() {
        let error = Config::load("/nonexistent/mirror.json")
            .await
            .expect_err("missing file");
        assert!(error.to_string().contains("failed to read config"));
    }
}
