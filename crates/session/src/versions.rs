//! Per-type config version tracking

use std::collections::HashMap;

use protocol::ConfigType;
use serde::{Deserialize, Serialize};

/// Last applied version for each config family.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigVersions {
    applied: HashMap<ConfigType, u64>,
}

impl ConfigVersions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self, config_type: ConfigType) -> u64 {
        self.applied.get(&config_type).copied().unwrap_or(0)
    }

    /// Record `version` if it is strictly newer; returns whether it was accepted.
    pub fn accept(&mut self, config_type: ConfigType, version: u64) -> bool {
        let current = self.applied.entry(config_type).or_insert(0);
        if version > *current {
            *current = version;
            true
        } else {
            false
        }
    }

    /// Next version the host should stamp on a change.
    pub fn bump(&mut self, config_type: ConfigType) -> u64 {
        let current = self.applied.entry(config_type).or_insert(0);
        *current += 1;
        *current
    }
}
