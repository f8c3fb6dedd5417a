use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::{Driver, DriverError, PoolStats};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockDriverCall {
    VerifyConnectivity,
    Close,
}

struct Behaviour {
    ping_ret: Result<(), DriverError>,
    ping_delay: Duration,
    close_ret: Result<(), DriverError>,
    close_delay: Duration,
    stats: PoolStats,
}

/// Scripted [`Driver`]. Clones share behaviour and the call log, so a test can
/// keep one clone and change what the others return.
#[derive(Clone)]
pub struct MockDriver {
    behaviour: Arc<Mutex<Behaviour>>,
    calls: Arc<Mutex<Vec<MockDriverCall>>>,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self {
            behaviour: Arc::new(Mutex::new(Behaviour {
                ping_ret: Ok(()),
                ping_delay: Duration::ZERO,
                close_ret: Ok(()),
                close_delay: Duration::ZERO,
                stats: PoolStats::default(),
            })),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_behaviour(&self) -> MutexGuard<'_, Behaviour> {
        match self.behaviour.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_calls(&self) -> MutexGuard<'_, Vec<MockDriverCall>> {
        match self.calls.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn ping_ret(&mut self, ret: Result<(), DriverError>) -> Self {
        self.lock_behaviour().ping_ret = ret;
        self.clone()
    }

    pub fn ping_delay(&mut self, delay: Duration) -> Self {
        self.lock_behaviour().ping_delay = delay;
        self.clone()
    }

    pub fn close_ret(&mut self, ret: Result<(), DriverError>) -> Self {
        self.lock_behaviour().close_ret = ret;
        self.clone()
    }

    pub fn close_delay(&mut self, delay: Duration) -> Self {
        self.lock_behaviour().close_delay = delay;
        self.clone()
    }

    pub fn stats(&mut self, stats: PoolStats) -> Self {
        self.lock_behaviour().stats = stats;
        self.clone()
    }

    pub fn get_calls(&self) -> Vec<MockDriverCall> {
        self.lock_calls().clone()
    }

    pub fn close_calls(&self) -> usize {
        self.lock_calls()
            .iter()
            .filter(|call| **call == MockDriverCall::Close)
            .count()
    }
}

#[async_trait]
impl Driver for MockDriver {
    async fn verify_connectivity(&self) -> Result<(), DriverError> {
        self.lock_calls().push(MockDriverCall::VerifyConnectivity);
        let (delay, ret) = {
            let behaviour = self.lock_behaviour();
            (behaviour.ping_delay, behaviour.ping_ret.clone())
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        ret
    }

    fn pool_stats(&self) -> PoolStats {
        self.lock_behaviour().stats.clone()
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.lock_calls().push(MockDriverCall::Close);
        let (delay, ret) = {
            let behaviour = self.lock_behaviour();
            (behaviour.close_delay, behaviour.close_ret.clone())
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        ret
    }
}
