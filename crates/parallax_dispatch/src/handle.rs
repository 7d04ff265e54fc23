use crate::event::Event;
use parallax_core::error::Result;

/// A set of events that together make up one asynchronous run.
#[derive(Clone, Debug, Default)]
pub struct Handle {
    events: Vec<Event>,
}

impl Handle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_events(events: Vec<Event>) -> Self {
        Self { events }
    }

    pub fn push(&mut self, event: Event) {
        self.events.push(event);
    }

    pub fn merge(&mut self, other: Handle) {
        self.events.extend(other.events);
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.events.iter().all(Event::is_complete)
    }

    /// Waits for every event, then returns the first failure in submission
    /// order. Nothing of the run is still executing once this returns.
    pub fn wait(&self) -> Result<()> {
        let mut first = Ok(());
        for event in &self.events {
            let result = event.wait();
            if first.is_ok() {
                first = result;
            }
        }
        first
    }
}
