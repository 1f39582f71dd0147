use {
    anyhow::Context,
    std::{collections::HashMap, path::Path},
    tokio::fs,
    tracing::{error, info},
};

/// Immutable source-topic to destination-topic routing table, built once at
/// startup. Topics without an entry mirror to a topic of the same name.
#[derive(Debug, Default)]
pub struct TopicMap {
    routes: HashMap<String, String>,
}

impl TopicMap {
    pub fn identity() -> Self {
        Self::default()
    }

    /// Parses a mapping file: one `<source-topic> <destination-topic>` pair
    /// per line. Blank lines and `#` comments are ignored; anything else that
    /// is not exactly two tokens is logged and skipped.
    pub fn parse(text: &str) -> Self {
        let mut routes = HashMap::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut tokens = line.split_whitespace();
            match (tokens.next(), tokens.next(), tokens.next()) {
                (Some(source), Some(destination), None) => {
                    routes.insert(source.to_string(), destination.to_string());
                }
                _ => error!("invalid topic mapping at line {}: {line:?}", lineno + 1),
            }
        }
        Self { routes }
    }

    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read topic mapping: {}", path.display()))?;
        let map = Self::parse(&text);
        info!("loaded {} topic mappings from {}", map.len(), path.display());
        Ok(map)
    }

    pub fn resolve<'a>(&'a self, source_topic: &'a str) -> &'a str {
        self.routes
            .get(source_topic)
            .map_or(source_topic, String::as_str)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
