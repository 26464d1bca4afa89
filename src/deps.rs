use crate::catalog::Catalog;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::runner::{SubprocessRunner, SystemRunner};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

/// Explicit dependency container threaded through every component:
/// catalog, subprocess runner, clock, config, and the shared operation
/// locks. Substituting fakes here is how the test suites run without a
/// database or real tar/pg binaries.
#[derive(Debug)]
pub struct Deps {
    pub catalog: Arc<dyn Catalog>,
    pub runner: Arc<dyn SubprocessRunner>,
    pub clock: Arc<dyn Clock>,
    pub config: Config,
    pub locks: OpLocks,
}

impl Deps {
    /// Production wiring: system clock and a real subprocess runner
    /// with the configured timeout.
    pub fn new(config: Config, catalog: Arc<dyn Catalog>) -> Self {
        let timeout = Duration::from_secs(config.operational.subprocess_timeout_seconds);
        Self {
            catalog,
            runner: Arc::new(SystemRunner::new(timeout)),
            clock: Arc::new(SystemClock),
            config,
            locks: OpLocks::new(),
        }
    }

    /// Fully custom wiring, used by tests.
    pub fn with_parts(
        config: Config,
        catalog: Arc<dyn Catalog>,
        runner: Arc<dyn SubprocessRunner>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            catalog,
            runner,
            clock,
            config,
            locks: OpLocks::new(),
        }
    }
}

/// Per-key async locks serializing create/restore/delete on the same
/// artifact (or the same (kind, name) pair during creation).
#[derive(Debug, Default)]
pub struct OpLocks {
    locks: std::sync::Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl OpLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap();
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}
