use parallax_core::error::Result;

/// Moves frames between ranks. Frames from one source arrive in send order.
pub trait Transport: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    fn send(&self, dst: usize, frame: Vec<u8>) -> Result<()>;

    /// Blocks until the next frame from `src` arrives, the peer goes away, or
    /// the transport is shut down.
    fn recv(&self, src: usize) -> Result<Vec<u8>>;

    /// Unblocks pending receives and drops connections. Idempotent.
    fn shutdown(&self);
}
