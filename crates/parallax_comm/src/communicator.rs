use crate::{
    message::{self, Message, MessageKind, Tag},
    transport::Transport,
};
use dashmap::DashMap;
use parallax_core::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex,
    },
    thread,
    time::Duration,
};

/// Bounded retry for transient transport failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: 10,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff_ms: 0,
        }
    }
}

/// Tagged point-to-point messaging over a [`Transport`].
///
/// Frames that arrive for a tag nobody is waiting on yet are parked in a
/// mailbox keyed by `(source, tag)`, so `recv` calls can be issued in any
/// order relative to the matching sends.
pub struct Communicator {
    transport: Box<dyn Transport>,
    mailbox: DashMap<(usize, Tag), VecDeque<Vec<f32>>>,
    // one reader at a time per source keeps frames from a source in order
    readers: Vec<Mutex<()>>,
    retry: RetryPolicy,
    aborted: AtomicBool,
    barriers: AtomicU64,
}

impl Communicator {
    pub fn new(transport: Box<dyn Transport>, retry: RetryPolicy) -> Self {
        let readers = (0..transport.world_size()).map(|_| Mutex::new(())).collect();
        Self {
            transport,
            mailbox: DashMap::new(),
            readers,
            retry,
            aborted: AtomicBool::new(false),
            barriers: AtomicU64::new(0),
        }
    }

    pub fn rank(&self) -> usize {
        self.transport.rank()
    }

    pub fn world_size(&self) -> usize {
        self.transport.world_size()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Messages received but not yet claimed.
    pub fn pending(&self) -> usize {
        self.mailbox.iter().map(|e| e.value().len()).sum()
    }

    pub fn send(&self, dst: usize, tag: Tag, payload: &[f32]) -> Result<()> {
        self.check_aborted()?;
        let frame = message::encode(&Message {
            src: self.rank(),
            tag,
            payload: payload.to_vec(),
        })?;
        log::trace!("rank {} -> {} {:?} ({} values)", self.rank(), dst, tag, payload.len());
        self.with_retry("send", || self.transport.send(dst, frame.clone()))
    }

    /// Blocks until the message from `src` with exactly `tag` arrives.
    pub fn recv(&self, src: usize, tag: Tag) -> Result<Vec<f32>> {
        let reader = self
            .readers
            .get(src)
            .ok_or_else(|| Error::InvalidArgument(format!("rank {} outside world of {}", src, self.world_size())))?;

        loop {
            self.check_aborted()?;
            if let Some(payload) = self.take(src, tag) {
                return Ok(payload);
            }

            let _guard = reader.lock().map_err(|_| Error::Lock)?;
            // another receiver may have parked it while we waited for the lock
            if let Some(payload) = self.take(src, tag) {
                return Ok(payload);
            }

            let frame = self.with_retry("recv", || self.transport.recv(src))?;
            let msg = message::decode(&frame)?;
            if msg.src != src {
                return Err(Error::Transport(format!(
                    "frame on the rank {} link claims to come from rank {}",
                    src, msg.src
                )));
            }
            if msg.tag == tag {
                return Ok(msg.payload);
            }
            log::trace!("rank {} parked {:?} from {}", self.rank(), msg.tag, src);
            self.mailbox.entry((src, msg.tag)).or_default().push_back(msg.payload);
        }
    }

    /// Every rank sends a marker to every other rank and waits for theirs.
    pub fn barrier(&self) -> Result<()> {
        let epoch = self.barriers.fetch_add(1, Ordering::AcqRel);
        let tag = Tag::new(epoch, 0, MessageKind::Barrier);
        let me = self.rank();
        for peer in (0..self.world_size()).filter(|&p| p != me) {
            self.send(peer, tag, &[])?;
        }
        for peer in (0..self.world_size()).filter(|&p| p != me) {
            self.recv(peer, tag)?;
        }
        Ok(())
    }

    /// Fails every pending and future operation and closes the transport.
    pub fn abort(&self) {
        if !self.aborted.swap(true, Ordering::AcqRel) {
            log::warn!("rank {} communicator aborted", self.rank());
            self.transport.shutdown();
        }
    }

    fn check_aborted(&self) -> Result<()> {
        if self.is_aborted() {
            return Err(Error::Aborted(format!("rank {} communicator was aborted", self.rank())));
        }
        Ok(())
    }

    fn take(&self, src: usize, tag: Tag) -> Option<Vec<f32>> {
        let payload = self.mailbox.get_mut(&(src, tag))?.pop_front();
        self.mailbox.remove_if(&(src, tag), |_, queue| queue.is_empty());
        payload
    }

    fn with_retry<T>(&self, what: &str, mut f: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempt = 0;
        loop {
            match f() {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < self.retry.max_retries && !self.is_aborted() => {
                    attempt += 1;
                    log::warn!(
                        "rank {} {} failed ({}), retry {}/{}",
                        self.rank(),
                        what,
                        e,
                        attempt,
                        self.retry.max_retries
                    );
                    thread::sleep(Duration::from_millis(self.retry.backoff_ms * attempt as u64));
                }
                Err(e) => {
                    if e.is_transient() {
                        log::error!("rank {} {} failed after {} retries: {}", self.rank(), what, attempt, e);
                    }
                    return Err(e);
                }
            }
        }
    }
}

impl Drop for Communicator {
    fn drop(&mut self) {
        self.transport.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalTransport;

    fn pair() -> (Communicator, Communicator) {
        let mut mesh = LocalTransport::mesh(2);
        let b = mesh.pop().expect("mesh of two");
        let a = mesh.pop().expect("mesh of two");
        (
            Communicator::new(Box::new(a), RetryPolicy::default()),
            Communicator::new(Box::new(b), RetryPolicy::default()),
        )
    }

    #[test]
    fn out_of_order_tags() -> Result<()> {
        let (a, b) = pair();
        let first = Tag::new(1, 0, MessageKind::Gradient);
        let second = Tag::new(1, 1, MessageKind::Gradient);
        a.send(1, first, &[1.0])?;
        a.send(1, second, &[2.0])?;

        assert_eq!(b.recv(0, second)?, vec![2.0]);
        assert_eq!(b.pending(), 1);
        assert_eq!(b.recv(0, first)?, vec![1.0]);
        assert_eq!(b.pending(), 0);
        Ok(())
    }

    #[test]
    fn same_tag_is_fifo() -> Result<()> {
        let (a, b) = pair();
        let tag = Tag::new(4, 2, MessageKind::Parameter);
        let other = Tag::new(4, 3, MessageKind::Parameter);
        a.send(1, tag, &[1.0])?;
        a.send(1, tag, &[2.0])?;
        a.send(1, other, &[3.0])?;
        assert_eq!(b.recv(0, other)?, vec![3.0]);
        assert_eq!(b.recv(0, tag)?, vec![1.0]);
        assert_eq!(b.recv(0, tag)?, vec![2.0]);
        Ok(())
    }

    #[test]
    fn abort_fails_fast() {
        let (a, _b) = pair();
        a.abort();
        assert!(a.is_aborted());
        assert!(matches!(
            a.recv(1, Tag::new(0, 0, MessageKind::Gradient)),
            Err(Error::Aborted(_))
        ));
        assert!(matches!(a.send(1, Tag::new(0, 0, MessageKind::Gradient), &[]), Err(Error::Aborted(_))));
    }
}
