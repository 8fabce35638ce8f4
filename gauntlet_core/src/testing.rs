//! Test helpers shared across the core modules.

use async_trait::async_trait;
use gauntlet_env::GauntletContext;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Context whose clock only moves when told to.
#[derive(Debug, Clone, Default)]
pub struct ManualContext {
    now: Arc<Mutex<Duration>>,
}

impl ManualContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }
}

#[async_trait]
impl GauntletContext for ManualContext {
    fn now(&self) -> Duration {
        *self.now.lock().unwrap()
    }

    fn system_time(&self) -> SystemTime {
        UNIX_EPOCH + self.now()
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }

    fn spawn<F>(&self, _name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(future);
    }

    fn entropy_words(&self) -> [u32; 4] {
        [1, 2, 3, 4]
    }

    fn seed(&self) -> u64 {
        42
    }
}
