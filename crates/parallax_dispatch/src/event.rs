use parallax_core::error::{Error, Result};
use std::sync::{Arc, Condvar, Mutex};

struct Inner {
    label: String,
    status: Mutex<Option<Result<()>>>,
    done: Condvar,
}

/// Completion signal of one submitted task, carrying its outcome.
#[derive(Clone)]
pub struct Event {
    inner: Arc<Inner>,
}

impl Event {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                label: label.into(),
                status: Mutex::new(None),
                done: Condvar::new(),
            }),
        }
    }

    /// An event that has already completed successfully.
    pub fn ready(label: impl Into<String>) -> Self {
        let event = Self::new(label);
        event.complete(Ok(()));
        event
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Records the outcome and wakes all waiters. Later calls are ignored.
    pub fn complete(&self, result: Result<()>) {
        let mut status = match self.inner.status.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        if status.is_none() {
            *status = Some(result);
            self.inner.done.notify_all();
        }
    }

    pub fn is_complete(&self) -> bool {
        self.inner.status.lock().map(|s| s.is_some()).unwrap_or(true)
    }

    pub fn status(&self) -> Option<Result<()>> {
        self.inner.status.lock().ok().and_then(|s| s.clone())
    }

    /// Blocks until the event completes and returns its outcome.
    pub fn wait(&self) -> Result<()> {
        let mut status = self.inner.status.lock().map_err(|_| Error::Lock)?;
        while status.is_none() {
            status = self.inner.done.wait(status).map_err(|_| Error::Lock)?;
        }
        status.clone().unwrap_or(Ok(()))
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("label", &self.inner.label)
            .field("status", &self.status())
            .finish()
    }
}
