//! Runtime feature flags
//!
//! Resolution order per flag: live override, then the environment value
//! captured at startup, then the built-in default. Overrides can be set at
//! any time; the env layer is fixed for the process lifetime.

use dashmap::DashMap;

use super::Config;

/// Flag key switching admission to the SFU transport mode
pub const SFU_TRANSPORT_FLAG: &str = "feature:voice:transport:sfu";

pub struct FeatureFlags {
    /// Live overrides, keyed by flag name
    overrides: DashMap<String, String>,
    /// Env-derived default for the SFU transport flag
    sfu_env: bool,
}

impl FeatureFlags {
    pub fn from_config(config: &Config) -> Self {
        Self {
            overrides: DashMap::new(),
            sfu_env: config.sfu_enabled,
        }
    }

    /// Install or replace a runtime override
    pub fn set_override(&self, key: &str, value: impl Into<String>) {
        self.overrides.insert(key.to_string(), value.into());
    }

    /// Drop a runtime override, falling back to the env layer
    pub fn clear_override(&self, key: &str) {
        self.overrides.remove(key);
    }

    pub fn sfu_enabled(&self) -> bool {
        match self.overrides.get(SFU_TRANSPORT_FLAG) {
            Some(value) => parse_bool(value.value()),
            None => self.sfu_env,
        }
    }

    /// Transport mode advertised at admission
    pub fn transport_mode(&self) -> &'static str {
        if self.sfu_enabled() {
            "sfu"
        } else {
            "p2p"
        }
    }
}

pub(crate) fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}
