use parallax_core::error::{Error, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Gradient,
    Parameter,
    AggregatedGradient,
    Barrier,
}

/// Identifies a message within an iteration. Receivers match on the full tag,
/// so messages may arrive in any order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub iteration: u64,
    pub slot: u32,
    pub kind: MessageKind,
}

impl Tag {
    pub fn new(iteration: u64, slot: u32, kind: MessageKind) -> Self {
        Self { iteration, slot, kind }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub src: usize,
    pub tag: Tag,
    pub payload: Vec<f32>,
}

pub fn encode(message: &Message) -> Result<Vec<u8>> {
    let config = bincode::config::legacy();
    bincode::serde::encode_to_vec(message, config).map_err(|e| Error::Serialization(e.to_string()))
}

pub fn decode(bytes: &[u8]) -> Result<Message> {
    let config = bincode::config::legacy();
    let (message, read) =
        bincode::serde::decode_from_slice(bytes, config).map_err(|e| Error::Serialization(e.to_string()))?;
    if read != bytes.len() {
        return Err(Error::Serialization(format!(
            "{} trailing bytes after message",
            bytes.len() - read
        )));
    }
    Ok(message)
}
