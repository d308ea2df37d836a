//! Engine configuration (loaded from `config.toml` by autoflow-infra).

use serde::{Deserialize, Serialize};

/// Tunables of the VM extension and the ExtData offloader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Prefix of every object-storage key written by the engine.
    pub storage_prefix: String,
    /// Largest JSON payload (bytes) kept inline on a DagInstance record.
    pub max_inline_size: usize,
    /// TTL of the per-instance advisory lock taken by Boot.
    pub lock_ttl_secs: u64,
    /// Retries after the first failed blob upload/download.
    pub blob_max_retries: u32,
    pub blob_retry_delay_ms: u64,
    /// Name prefix routing calls to trigger operators.
    pub trigger_operator_prefix: String,
    /// Exact action names that receive a user access token, in addition to
    /// the `@anyshare`, `@custom` and `@operator` families.
    pub token_action_names: Vec<String>,
    pub callback_timeout_secs: u64,
    /// Endpoint of the token service. When unset, `access_token` is used.
    pub token_endpoint: Option<String>,
    pub access_token: Option<String>,
}

/// Trigger, AI and content operators that call back into the platform on
/// behalf of the user.
pub const DEFAULT_TOKEN_ACTION_NAMES: &[&str] = &[
    "@trigger/manual",
    "@trigger/cron",
    "@trigger/cron/week",
    "@trigger/cron/month",
    "@trigger/cron/custom",
    "@trigger/dataflow-doc",
    "@trigger/dataflow-user",
    "@trigger/dataflow-dept",
    "@trigger/dataflow-tag",
    "@internal/tool/py3",
    "@internal/database/write",
    "@ocr/general",
    "@audio/transfer",
    "@docinfo/entity/extract",
    "@anydata/call-agent",
    "@llm/chat/completion",
    "@llm/embedding",
    "@llm/reranker",
    "@content/entity",
    "@content/file_parse",
    "@ecoconfig/reindex",
];

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage_prefix: "automation".to_string(),
            max_inline_size: 4 * 1024 * 1024,
            lock_ttl_secs: 300,
            blob_max_retries: 3,
            blob_retry_delay_ms: 1000,
            trigger_operator_prefix: "@trigger/operator/".to_string(),
            token_action_names: DEFAULT_TOKEN_ACTION_NAMES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            callback_timeout_secs: 10,
            token_endpoint: None,
            access_token: None,
        }
    }
}
