use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use common_bolt::mock::MockDriver;
use common_bolt::GraphDriver;

use crate::config::ConnectionConfig;
use crate::error::InitError;
use crate::factory::ClientFactory;

struct Script {
    driver: Option<MockDriver>,
    failures: VecDeque<InitError>,
    delay: Duration,
}

/// [`ClientFactory`] handing out [`MockDriver`]s. It validates the
/// configuration like the real factory and counts every construction it
/// starts afterwards.
#[derive(Clone)]
pub struct MockClientFactory {
    script: Arc<Mutex<Script>>,
    constructions: Arc<AtomicUsize>,
}

impl Default for MockClientFactory {
    fn default() -> Self {
        Self {
            script: Arc::new(Mutex::new(Script {
                driver: None,
                failures: VecDeque::new(),
                delay: Duration::ZERO,
            })),
            constructions: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl MockClientFactory {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_script(&self) -> MutexGuard<'_, Script> {
        match self.script.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Every construction returns a clone of this driver, sharing its calls.
    pub fn with_driver(&mut self, driver: MockDriver) -> Self {
        self.lock_script().driver = Some(driver);
        self.clone()
    }

    /// Queues an error for the next construction. Queued errors are
    /// returned in order, after which constructions succeed again.
    pub fn fail_next(&mut self, err: InitError) -> Self {
        self.lock_script().failures.push_back(err);
        self.clone()
    }

    /// How long each construction takes.
    pub fn delay(&mut self, delay: Duration) -> Self {
        self.lock_script().delay = delay;
        self.clone()
    }

    pub fn constructions(&self) -> usize {
        self.constructions.load(Ordering::SeqCst)
    }

    /// Waits until at least `count` constructions have started, for at most
    /// five seconds.
    pub async fn wait_for_constructions(&self, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.constructions() < count && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(self.constructions() >= count)
    }
}

#[async_trait]
impl ClientFactory for MockClientFactory {
    async fn build(&self, config: &ConnectionConfig) -> Result<GraphDriver, InitError> {
        config.validate()?;
        self.constructions.fetch_add(1, Ordering::SeqCst);

        let delay = self.lock_script().delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut script = self.lock_script();
        if let Some(err) = script.failures.pop_front() {
            return Err(err);
        }
        let driver = script.driver.clone().unwrap_or_default();
        Ok(Arc::new(driver))
    }
}
