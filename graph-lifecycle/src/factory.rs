use std::sync::Arc;

use async_trait::async_trait;
use common_bolt::{BoltDriver, GraphDriver};

use crate::config::ConnectionConfig;
use crate::error::InitError;

/// Turns resolved configuration into a live driver.
///
/// Implementations make exactly one attempt: retrying is the caller's
/// decision. Invalid configuration must be rejected before any socket is
/// opened, and anything opened by a failed attempt must be released before
/// returning.
#[async_trait]
pub trait ClientFactory {
    async fn build(&self, config: &ConnectionConfig) -> Result<GraphDriver, InitError>;
}

pub type SharedFactory = Arc<dyn ClientFactory + Send + Sync>;

#[derive(Debug, Clone, Copy, Default)]
pub struct BoltClientFactory;

#[async_trait]
impl ClientFactory for BoltClientFactory {
    async fn build(&self, config: &ConnectionConfig) -> Result<GraphDriver, InitError> {
        config.validate()?;
        let driver = BoltDriver::connect(config.driver_config()).await?;
        Ok(Arc::new(driver))
    }
}
