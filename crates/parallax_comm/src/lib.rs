//! Point-to-point messaging between ranks.
//!
//! A [`Transport`] moves opaque frames; the [`Communicator`] on top of it adds
//! tagged messages, out-of-order matching, retries and abort.

pub mod communicator;
pub mod context;
pub mod local;
pub mod message;
pub mod tcp;
pub mod transport;

pub use crate::{
    communicator::{Communicator, RetryPolicy},
    context::{CommConfig, CommContext},
    local::LocalTransport,
    message::{Message, MessageKind, Tag},
    tcp::TcpTransport,
    transport::Transport,
};
