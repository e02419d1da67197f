use serde::{Deserialize, Serialize};

pub const DEFAULT_SOURCE: &str = "USOM - Ulusal Siber Olaylara Müdahale Merkezi";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateFilter {
    pub from: Option<String>,
    pub to: Option<String>,
}

/// Contents of `<prefix>meta`, written when an ingestion run completes.
///
/// Unknown keys written by other tools are ignored on read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ArchiveMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub export_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    pub date_filter: DateFilter,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_count: Option<u64>,
    /// When the last run finished; the next incremental run starts from here.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_date: Option<String>,
}

/// Contents of `<prefix>temp:data`: the last batch whose records were fully stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub last_batch: u64,
    pub page_count: u64,
    pub timestamp: String,
}
