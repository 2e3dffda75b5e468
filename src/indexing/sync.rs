//! Drift detection between the lexical index and the vector index.
//!
//! Purely advisory: a missing or failing lexical source never blocks
//! indexing or search, it only produces a debug note.

use crate::config::SyncConfig;
use crate::error::StoreResult;
use tracing::{debug, info};

/// Anything that can report how many documents the lexical index holds.
pub trait LexicalDocCount: Send + Sync {
    fn document_count(&self) -> StoreResult<usize>;
}

/// Called when drift exceeds the configured ratio.
pub trait ResyncHandler: Send + Sync {
    fn resync(&self, status: &SyncStatus) -> StoreResult<()>;
}

impl<F> ResyncHandler for F
where
    F: Fn(&SyncStatus) -> StoreResult<()> + Send + Sync,
{
    fn resync(&self, status: &SyncStatus) -> StoreResult<()> {
        self(status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncStatus {
    pub lexical_count: usize,
    pub dense_count: usize,
    /// `|lexical - dense| / max(lexical, dense)`, 0 when both are empty
    pub ratio: f64,
    pub drifted: bool,
    pub resync_triggered: bool,
}

/// Relative difference between two counts.
pub fn drift_ratio(lexical: usize, dense: usize) -> f64 {
    let larger = lexical.max(dense);
    if larger == 0 {
        return 0.0;
    }
    lexical.abs_diff(dense) as f64 / larger as f64
}

pub struct SyncMonitor {
    config: SyncConfig,
    handler: Option<Box<dyn ResyncHandler>>,
}

impl std::fmt::Debug for SyncMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncMonitor")
            .field("config", &self.config)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

impl SyncMonitor {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            handler: None,
        }
    }

    pub fn with_handler(mut self, handler: impl ResyncHandler + 'static) -> Self {
        self.handler = Some(Box::new(handler));
        self
    }

    pub fn set_handler(&mut self, handler: Box<dyn ResyncHandler>) {
        self.handler = Some(handler);
    }

    /// Compare counts and trigger the resync handler on drift.
    ///
    /// Returns `None` when monitoring is disabled or the lexical count is
    /// unavailable.
    pub fn check(&self, lexical: &dyn LexicalDocCount, dense_count: usize) -> Option<SyncStatus> {
        if !self.config.enabled {
            return None;
        }

        let lexical_count = match lexical.document_count() {
            Ok(count) => count,
            Err(e) => {
                debug!("Skipping sync check, lexical count unavailable: {e}");
                return None;
            }
        };

        let ratio = drift_ratio(lexical_count, dense_count);
        let drifted = ratio > self.config.desync_ratio;
        let mut status = SyncStatus {
            lexical_count,
            dense_count,
            ratio,
            drifted,
            resync_triggered: false,
        };

        if drifted {
            info!(
                "Lexical/vector drift {:.1}% exceeds {:.1}% (lexical={lexical_count}, vectors={dense_count})",
                ratio * 100.0,
                self.config.desync_ratio * 100.0
            );
            if let Some(handler) = &self.handler {
                match handler.resync(&status) {
                    Ok(()) => status.resync_triggered = true,
                    Err(e) => debug!("Resync handler failed: {e}"),
                }
            }
        } else {
            debug!("Lexical/vector counts in sync: {lexical_count} vs {dense_count}");
        }
        Some(status)
    }
}
