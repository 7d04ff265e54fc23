use crate::transport::Transport;
use crossbeam::channel::{self, Receiver, Sender};
use parallax_core::error::{Error, Result};
use std::sync::Mutex;

/// In-process transport: every ordered pair of ranks gets its own channel.
pub struct LocalTransport {
    rank: usize,
    // indexed by destination; `None` after shutdown
    senders: Mutex<Vec<Option<Sender<Vec<u8>>>>>,
    // indexed by source
    receivers: Vec<Receiver<Vec<u8>>>,
    closing: Mutex<Option<Sender<()>>>,
    closed: Receiver<()>,
}

impl LocalTransport {
    /// One transport per rank, fully connected (self-sends included).
    pub fn mesh(world_size: usize) -> Vec<LocalTransport> {
        let mut senders: Vec<Vec<Option<Sender<Vec<u8>>>>> = (0..world_size).map(|_| Vec::new()).collect();
        let mut receivers: Vec<Vec<Receiver<Vec<u8>>>> = (0..world_size).map(|_| Vec::new()).collect();

        for src in 0..world_size {
            for dst in 0..world_size {
                let (tx, rx) = channel::unbounded();
                senders[src].push(Some(tx));
                debug_assert_eq!(receivers[dst].len(), src);
                receivers[dst].push(rx);
            }
        }

        senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (senders, receivers))| {
                let (closing, closed) = channel::bounded(0);
                LocalTransport {
                    rank,
                    senders: Mutex::new(senders),
                    receivers,
                    closing: Mutex::new(Some(closing)),
                    closed,
                }
            })
            .collect()
    }

    fn check_peer(&self, peer: usize) -> Result<()> {
        if peer >= self.receivers.len() {
            return Err(Error::InvalidArgument(format!(
                "rank {} outside world of {}",
                peer,
                self.receivers.len()
            )));
        }
        Ok(())
    }
}

impl Transport for LocalTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.receivers.len()
    }

    fn send(&self, dst: usize, frame: Vec<u8>) -> Result<()> {
        self.check_peer(dst)?;
        let senders = self.senders.lock().map_err(|_| Error::Lock)?;
        let sender = senders[dst]
            .as_ref()
            .ok_or_else(|| Error::Aborted(format!("rank {} transport is shut down", self.rank)))?;
        sender
            .send(frame)
            .map_err(|_| Error::Transport(format!("rank {} is gone", dst)))
    }

    fn recv(&self, src: usize) -> Result<Vec<u8>> {
        self.check_peer(src)?;
        channel::select! {
            recv(self.receivers[src]) -> frame => {
                frame.map_err(|_| Error::Transport(format!("rank {} disconnected", src)))
            }
            recv(self.closed) -> _ => {
                Err(Error::Aborted(format!("rank {} transport is shut down", self.rank)))
            }
        }
    }

    fn shutdown(&self) {
        if let Ok(mut closing) = self.closing.lock() {
            closing.take();
        }
        if let Ok(mut senders) = self.senders.lock() {
            senders.iter_mut().for_each(|s| {
                s.take();
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn pairwise_fifo() -> Result<()> {
        let mut mesh = LocalTransport::mesh(2);
        let b = mesh.pop().expect("mesh of two");
        let a = mesh.pop().expect("mesh of two");

        a.send(1, vec![1])?;
        a.send(1, vec![2])?;
        a.send(0, vec![9])?;
        assert_eq!(b.recv(0)?, vec![1]);
        assert_eq!(b.recv(0)?, vec![2]);
        assert_eq!(a.recv(0)?, vec![9]);
        Ok(())
    }

    #[test]
    fn shutdown_unblocks_recv() -> Result<()> {
        let mut mesh = LocalTransport::mesh(2);
        let _b = mesh.pop();
        let a = std::sync::Arc::new(mesh.pop().expect("mesh of two"));

        let waiter = {
            let a = a.clone();
            thread::spawn(move || a.recv(1))
        };
        thread::sleep(std::time::Duration::from_millis(20));
        a.shutdown();
        let result = waiter.join().expect("waiter panicked");
        assert!(matches!(result, Err(Error::Aborted(_))));
        assert!(matches!(a.send(1, vec![0]), Err(Error::Aborted(_))));
        Ok(())
    }

    #[test]
    fn peer_shutdown_disconnects() -> Result<()> {
        let mut mesh = LocalTransport::mesh(2);
        let b = mesh.pop().expect("mesh of two");
        let a = mesh.pop().expect("mesh of two");
        a.shutdown();
        assert!(matches!(b.recv(0), Err(Error::Transport(_))));
        Ok(())
    }
}
