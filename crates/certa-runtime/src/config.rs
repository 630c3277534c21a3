//! Node configuration

use certa_cert::CertConfig;
use certa_core::Seqno;
use thiserror::Error;

/// Configuration rejected by [`NodeConfig::validate`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("At least one applier thread is required")]
    NoAppliers,

    #[error("Queue {0} must hold at least one item")]
    ZeroQueue(&'static str),

    #[error("Purge interval must be positive")]
    ZeroPurgeInterval,

    #[error("Start position must be defined, got {0}")]
    UndefinedStartPosition(Seqno),
}

/// When the certifier releases applied trxs from the index.
///
/// Purging changes which earlier trxs later ones can conflict with, so only
/// purge points shared by every replica keep verdicts identical cluster-wide.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PurgePolicy {
    /// Purge up to the local apply position every `interval` applied trxs.
    /// Verdicts then follow local apply progress; for standalone nodes.
    LocalApply { interval: u64 },
    /// Purge only at commit cuts carried by the delivery stream
    CommitCut,
}

/// CERTA node configuration
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Parallel applier tasks
    pub applier_threads: usize,
    /// Capacity of the inbound delivery queue
    pub delivery_queue: usize,
    /// Capacity of the certified -> applier queue
    pub applier_queue: usize,
    pub purge: PurgePolicy,
    /// Last global seqno already applied when the node starts
    pub start_position: Seqno,
    /// Certification engine settings
    pub cert: CertConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            applier_threads: 4,
            delivery_queue: 1024,
            applier_queue: 1024,
            purge: PurgePolicy::LocalApply { interval: 64 },
            start_position: Seqno::new(0),
            cert: CertConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Strictly sequential application
    pub fn single_applier() -> Self {
        NodeConfig {
            applier_threads: 1,
            ..NodeConfig::default()
        }
    }

    /// Small queues and eager purging, for tests
    pub fn compact() -> Self {
        NodeConfig {
            applier_threads: 2,
            delivery_queue: 8,
            applier_queue: 8,
            purge: PurgePolicy::LocalApply { interval: 1 },
            ..NodeConfig::default()
        }
    }

    /// Cluster member: purge only at stream commit cuts
    pub fn cluster() -> Self {
        NodeConfig {
            purge: PurgePolicy::CommitCut,
            ..NodeConfig::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.applier_threads == 0 {
            return Err(ConfigError::NoAppliers);
        }
        if self.delivery_queue == 0 {
            return Err(ConfigError::ZeroQueue("delivery"));
        }
        if self.applier_queue == 0 {
            return Err(ConfigError::ZeroQueue("applier"));
        }
        if self.purge == (PurgePolicy::LocalApply { interval: 0 }) {
            return Err(ConfigError::ZeroPurgeInterval);
        }
        if self.start_position.is_undefined() {
            return Err(ConfigError::UndefinedStartPosition(self.start_position));
        }
        Ok(())
    }
}
