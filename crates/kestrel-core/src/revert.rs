//! Pending change set for multi-step operations.
//!
//! Each successful step registers its inverse. On failure the inverses run
//! newest first; on success they are discarded.

use crate::error::Result;
use futures::future::BoxFuture;
use std::future::Future;

type Step = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

#[derive(Default)]
pub struct Reverter {
    steps: Vec<(String, Step)>,
}

impl Reverter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the inverse of a completed step.
    pub fn add<F, Fut>(&mut self, label: impl Into<String>, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.steps.push((label.into(), Box::new(move || Box::pin(f()))));
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every inverse, newest first. Failures are logged and skipped.
    pub async fn fail(mut self) {
        while let Some((label, step)) = self.steps.pop() {
            tracing::debug!(step = %label, "Reverting");
            if let Err(e) = step().await {
                tracing::warn!(step = %label, error = %e, "Revert step failed");
            }
        }
    }

    /// Discard all inverses.
    pub fn success(mut self) {
        self.steps.clear();
    }
}

impl Drop for Reverter {
    fn drop(&mut self) {
        if !self.steps.is_empty() {
            tracing::warn!(
                pending = self.steps.len(),
                "Reverter dropped without success or fail; changes not reverted"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn test_fail_runs_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut revert = Reverter::new();
        for label in ["mount", "device", "launch"] {
            let log = log.clone();
            revert.add(label, move || async move {
                log.lock().unwrap().push(label);
                if label == "device" {
                    return Err(CoreError::Storage("still busy".into()));
                }
                Ok(())
            });
        }
        assert_eq!(revert.len(), 3);
        revert.fail().await;
        assert_eq!(*log.lock().unwrap(), vec!["launch", "device", "mount"]);
    }

    #[tokio::test]
    async fn test_success_discards() {
        let ran = Arc::new(Mutex::new(false));
        let mut revert = Reverter::new();
        let flag = ran.clone();
        revert.add("step", move || async move {
            *flag.lock().unwrap() = true;
            Ok(())
        });
        revert.success();
        assert!(!*ran.lock().unwrap());
    }
}
