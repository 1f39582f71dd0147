use crate::consumer::SourceRecord;

/// Key/value pair produced by a transformer, bound for the destination
/// cluster.
#[derive(Debug, Clone)]
pub struct MirrorRecord {
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
}

/// Per-record hook between consume and produce. May emit zero, one or many
/// output records; an error is fatal to the pump.
pub trait MessageTransformer: Send + Sync {
    fn handle(&self, record: &SourceRecord) -> anyhow::Result<Vec<MirrorRecord>>;
}

/// Mirrors key and payload untouched.
pub struct IdentityTransformer;

impl MessageTransformer for IdentityTransformer {
    fn handle(&self, record: &SourceRecord) -> anyhow::Result<Vec<MirrorRecord>> {
        Ok(vec![MirrorRecord {
            key: record.key.clone(),
            payload: record.payload.clone(),
        }])
    }
}
