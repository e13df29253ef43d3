use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScannerState {
    Idle,
    Scanning,
    Paused,
}

/// A barcode read reported by the scanning collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub code: String,
    pub timestamp: DateTime<Utc>,
}

impl Detection {
    pub fn new(code: impl Into<String>, timestamp: DateTime<Utc>) -> Self { Self { code: code.into(), timestamp } }
    pub fn now(code: impl Into<String>) -> Self { Self::new(code, Utc::now()) }
}

/// Camera/decoder handle. Detections themselves arrive on a channel.
pub trait ScanSource: Send + Sync {
    fn start(&self) -> AppResult<()> { Ok(()) }
    fn pause(&self);
    fn resume(&self);
    fn stop(&self) {}
}

/// Source that does nothing, for headless runs and tests.
#[derive(Debug, Default)]
pub struct NullSource;

impl ScanSource for NullSource {
    fn pause(&self) {}
    fn resume(&self) {}
}

/// `idle -> scanning -> (paused <-> scanning) -> idle`.
#[derive(Clone)]
pub struct Scanner {
    source: Arc<dyn ScanSource>,
    state: watch::Sender<ScannerState>,
    transition: Arc<Mutex<()>>,
}

impl Scanner {
    pub fn new(source: Arc<dyn ScanSource>) -> Self {
        let (state, _) = watch::channel(ScannerState::Idle);
        Self { source, state, transition: Arc::new(Mutex::new(())) }
    }

    pub fn state(&self) -> ScannerState { *self.state.borrow() }
    pub fn watch(&self) -> watch::Receiver<ScannerState> { self.state.subscribe() }
    pub fn is_scanning(&self) -> bool { self.state() == ScannerState::Scanning }

    pub fn start(&self) -> AppResult<()> {
        let _t = self.transition.lock();
        match self.state() {
            ScannerState::Idle => {
                self.source.start()?;
                self.set(ScannerState::Scanning);
                Ok(())
            }
            other => Err(bad_transition("start", other)),
        }
    }

    pub fn pause(&self) -> AppResult<()> {
        let _t = self.transition.lock();
        match self.state() {
            ScannerState::Scanning => {
                self.source.pause();
                self.set(ScannerState::Paused);
                Ok(())
            }
            other => Err(bad_transition("pause", other)),
        }
    }

    pub fn resume(&self) -> AppResult<()> {
        let _t = self.transition.lock();
        match self.state() {
            ScannerState::Paused => {
                self.source.resume();
                self.set(ScannerState::Scanning);
                Ok(())
            }
            other => Err(bad_transition("resume", other)),
        }
    }

    /// Back to idle from any state.
    pub fn stop(&self) {
        let _t = self.transition.lock();
        if self.state() != ScannerState::Idle {
            self.source.stop();
            self.set(ScannerState::Idle);
        }
    }

    fn set(&self, next: ScannerState) {
        debug!(target: "scan", ?next, "scanner state");
        self.state.send_replace(next);
    }
}

fn bad_transition(op: &str, from: ScannerState) -> AppError {
    AppError::conflict("invalid_transition".to_string(), format!("cannot {} while {:?}", op, from))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        pauses: AtomicUsize,
        resumes: AtomicUsize,
    }

    impl ScanSource for Counting {
        fn pause(&self) { self.pauses.fetch_add(1, Ordering::SeqCst); }
        fn resume(&self) { self.resumes.fetch_add(1, Ordering::SeqCst); }
    }

    #[test]
    fn transitions_follow_state_machine() {
        let src = Arc::new(Counting::default());
        let s = Scanner::new(src.clone());
        assert_eq!(s.state(), ScannerState::Idle);
        assert!(s.pause().is_err());
        s.start().unwrap();
        assert!(s.start().is_err());
        assert!(s.resume().is_err());
        s.pause().unwrap();
        assert_eq!(s.state(), ScannerState::Paused);
        s.resume().unwrap();
        assert!(s.is_scanning());
        assert_eq!(src.pauses.load(Ordering::SeqCst), 1);
        assert_eq!(src.resumes.load(Ordering::SeqCst), 1);
        s.pause().unwrap();
        s.stop();
        assert_eq!(s.state(), ScannerState::Idle);
        assert_eq!(s.pause().unwrap_err().code_str(), "invalid_transition");
    }
}
