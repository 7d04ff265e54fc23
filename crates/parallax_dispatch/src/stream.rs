use crate::{
    event::Event,
    trace::{ExecutionTrace, TracePoint},
};
use crossbeam::channel::{self, Sender};
use parallax_core::{
    error::{Error, Result},
    placement::Placement,
};
use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
};

pub type Work = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

struct Task {
    label: String,
    deps: Vec<Event>,
    work: Work,
    done: Event,
}

/// An in-order execution queue bound to one placement, drained by a dedicated
/// worker thread.
///
/// Each task first waits for its dependencies. If any of them failed the task
/// is skipped and completes with `Aborted`.
pub struct Stream {
    placement: Placement,
    queue: Mutex<Option<Sender<Task>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Stream {
    pub fn new(placement: Placement, trace: Option<Arc<ExecutionTrace>>) -> Result<Self> {
        let (tx, rx) = channel::unbounded::<Task>();
        let worker = thread::Builder::new()
            .name(format!("parallax-{}", placement))
            .spawn(move || {
                for task in rx {
                    run_task(task, placement, trace.as_deref());
                }
            })
            .map_err(|e| Error::InvalidState(format!("cannot start stream for {}: {}", placement, e)))?;

        Ok(Self {
            placement,
            queue: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn placement(&self) -> Placement {
        self.placement
    }

    pub fn submit(&self, label: impl Into<String>, deps: Vec<Event>, work: Work) -> Result<Event> {
        let label = label.into();
        let done = Event::new(label.clone());
        let queue = self.queue.lock().map_err(|_| Error::Lock)?;
        let queue = queue
            .as_ref()
            .ok_or_else(|| Error::Aborted(format!("stream {} is shut down", self.placement)))?;
        queue
            .send(Task {
                label,
                deps,
                work,
                done: done.clone(),
            })
            .map_err(|_| Error::Aborted(format!("stream {} worker exited", self.placement)))?;
        Ok(done)
    }

    /// Stops accepting work, lets queued tasks drain and joins the worker.
    pub fn shutdown(&self) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.take();
        }
        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(worker) = worker {
            if worker.join().is_err() {
                log::error!("stream {} worker panicked", self.placement);
            }
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

fn run_task(task: Task, placement: Placement, trace: Option<&ExecutionTrace>) {
    let Task { label, deps, work, done } = task;

    for dep in &deps {
        if let Err(e) = dep.wait() {
            log::debug!("{} on {} skipped: '{}' failed", label, placement, dep.label());
            done.complete(Err(match e {
                Error::Aborted(msg) => Error::Aborted(msg),
                other => Error::Aborted(format!("'{}' failed: {}", dep.label(), other)),
            }));
            return;
        }
    }

    if let Some(trace) = trace {
        trace.record(&label, placement, TracePoint::Start);
    }
    let result = match panic::catch_unwind(AssertUnwindSafe(work)) {
        Ok(result) => result,
        Err(payload) => Err(Error::Compute {
            operator: label.clone(),
            message: panic_message(payload),
        }),
    };
    if let Some(trace) = trace {
        trace.record(&label, placement, TracePoint::End);
    }

    if let Err(e) = &result {
        log::error!("{} on {} failed: {}", label, placement, e);
    }
    done.complete(result);
}
