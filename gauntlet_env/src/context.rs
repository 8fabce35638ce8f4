//! Core environment context trait for Gauntlet supervisors and units.

use async_trait::async_trait;
use std::future::Future;
use std::time::{Duration, SystemTime};

/// The central interface for Environment Interaction.
///
/// This trait abstracts the "real world" so that the bracket runner, the
/// unit pool and the step runner can run in both production (tokio) and
/// deterministic simulation (virtual clock) environments.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time`, `OsRng`
/// - **Simulation**: `SimContext` - manual virtual clock, `ChaCha8Rng(seed)`
///
/// # Determinism
///
/// Everything that would normally introduce non-determinism (time, entropy
/// for root seeds) goes through this trait.
#[async_trait]
pub trait GauntletContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// Step batches compute their deadlines and checkback boundaries
    /// from this clock. In simulation, this is the virtual clock time.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time (used for export timestamps).
    fn system_time(&self) -> SystemTime;

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: advances virtual clock
    async fn sleep(&self, duration: Duration);

    /// Spawns a background task on the supervising runtime.
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;

    /// Draws four words of entropy for a fresh root seed.
    ///
    /// Production draws from the OS; simulation draws from its seeded RNG
    /// so that "no seed given" runs are still reproducible there.
    fn entropy_words(&self) -> [u32; 4];

    /// Returns the context's seed (for logging/debugging).
    ///
    /// In production, returns 0 (not seeded).
    fn seed(&self) -> u64;
}
