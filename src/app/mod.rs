//! Application state shared across routes

use std::sync::Arc;

use crate::config::{Config, FeatureFlags};
use crate::ice::IceServerResolver;
use crate::shard::ShardRegistry;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub flags: Arc<FeatureFlags>,
    pub ice: Arc<IceServerResolver>,
    pub shards: ShardRegistry,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let flags = Arc::new(FeatureFlags::from_config(&config));
        let ice = IceServerResolver::new(&config);

        Self {
            config: Arc::new(config),
            flags,
            ice,
            shards: ShardRegistry::new(),
        }
    }
}
