pub mod dispatcher;
pub mod event;
pub mod handle;
pub mod stream;
pub mod trace;

pub use crate::{
    dispatcher::{Dispatcher, RunMode},
    event::Event,
    handle::Handle,
    stream::Stream,
    trace::{ExecutionTrace, TraceEntry, TracePoint},
};
