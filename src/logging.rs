//! Injected logging, process role, and cancellation
//!
//! Components never look a logger up by name: they receive a `&dyn TrainLog`
//! at construction. The default sink forwards to `tracing`; `MemoryLog`
//! records lines so tests can assert on the exact output.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Log sink injected into the epoch driver and the inference runner.
pub trait TrainLog: Send + Sync {
    fn info(&self, msg: &str);
    fn warn(&self, msg: &str);
}

/// Forwards to the `tracing` subscriber installed by the binary.
#[derive(Debug, Default)]
pub struct TracingLog;

impl TrainLog for TracingLog {
    fn info(&self, msg: &str) {
        tracing::info!("{msg}");
    }

    fn warn(&self, msg: &str) {
        tracing::warn!("{msg}");
    }
}

/// Records every line in memory. Used by tests to check log cadence.
#[derive(Debug, Default)]
pub struct MemoryLog {
    infos: Mutex<Vec<String>>,
    warns: Mutex<Vec<String>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn infos(&self) -> Vec<String> {
        self.infos.lock().unwrap().clone()
    }

    pub fn warns(&self) -> Vec<String> {
        self.warns.lock().unwrap().clone()
    }
}

impl TrainLog for MemoryLog {
    fn info(&self, msg: &str) {
        self.infos.lock().unwrap().push(msg.to_string());
    }

    fn warn(&self, msg: &str) {
        self.warns.lock().unwrap().push(msg.to_string());
    }
}

/// Role of this process in a (possibly multi-process) training run.
///
/// Exactly one process owns checkpoint writes and evaluation logging; the
/// others participate in the computation but suppress their own I/O. The
/// role is resolved once at startup and injected, so side-effect gating is
/// a pure function of state rather than of an ambient distributed context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Coordinator,
    Worker,
}

impl Role {
    /// Resolve the role from the launcher environment.
    ///
    /// Single-process runs are always the coordinator. Distributed runs use
    /// the `RANK` variable set by the launcher; rank 0 coordinates.
    pub fn from_env(dist_train: bool) -> Self {
        if !dist_train {
            return Role::Coordinator;
        }
        match std::env::var("RANK") {
            Ok(rank) => match rank.trim().parse::<u64>() {
                Ok(0) | Err(_) => Role::Coordinator,
                Ok(_) => Role::Worker,
            },
            Err(_) => Role::Coordinator,
        }
    }

    pub fn is_coordinator(&self) -> bool {
        matches!(self, Role::Coordinator)
    }
}

/// Cooperative cancellation flag checked between batches and epochs.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_process_is_coordinator() {
        assert!(Role::from_env(false).is_coordinator());
    }

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_memory_log_records_lines() {
        let log = MemoryLog::new();
        log.info("hello");
        log.warn("careful");
        assert_eq!(log.infos(), vec!["hello".to_string()]);
        assert_eq!(log.warns(), vec!["careful".to_string()]);
    }
}
