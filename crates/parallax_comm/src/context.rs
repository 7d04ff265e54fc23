use crate::{
    communicator::{Communicator, RetryPolicy},
    local::LocalTransport,
    tcp::TcpTransport,
};
use parallax_core::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc, time::Duration};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CommConfig {
    /// A world of one rank; every message stays in process.
    Single,
    Tcp {
        rank: usize,
        addrs: Vec<SocketAddr>,
        #[serde(default)]
        retry: RetryPolicy,
        #[serde(default = "default_connect_attempts")]
        connect_attempts: u32,
    },
}

fn default_connect_attempts() -> u32 {
    50
}

/// The process-wide communication state of one rank.
///
/// Created once with [`CommContext::init`] (or [`CommContext::local_mesh`] for
/// in-process worlds) and torn down explicitly with
/// [`finalize`](CommContext::finalize).
#[derive(Clone)]
pub struct CommContext {
    comm: Arc<Communicator>,
}

impl CommContext {
    pub fn init(config: &CommConfig) -> Result<Self> {
        let comm = match config {
            CommConfig::Single => {
                let transport = LocalTransport::mesh(1)
                    .pop()
                    .ok_or_else(|| Error::Config("empty local mesh".into()))?;
                Communicator::new(Box::new(transport), RetryPolicy::default())
            }
            CommConfig::Tcp {
                rank,
                addrs,
                retry,
                connect_attempts,
            } => {
                let transport = TcpTransport::connect(
                    *rank,
                    addrs,
                    *connect_attempts,
                    Duration::from_millis(retry.backoff_ms.max(1) * 10),
                )?;
                Communicator::new(Box::new(transport), *retry)
            }
        };
        log::info!("rank {} of {} initialized", comm.rank(), comm.world_size());
        Ok(Self { comm: Arc::new(comm) })
    }

    /// One context per rank of an in-process world, for threads standing in
    /// for processes.
    pub fn local_mesh(world_size: usize, retry: RetryPolicy) -> Vec<CommContext> {
        LocalTransport::mesh(world_size)
            .into_iter()
            .map(|t| CommContext {
                comm: Arc::new(Communicator::new(Box::new(t), retry)),
            })
            .collect()
    }

    pub fn from_communicator(comm: Communicator) -> Self {
        Self { comm: Arc::new(comm) }
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn world_size(&self) -> usize {
        self.comm.world_size()
    }

    pub fn communicator(&self) -> &Arc<Communicator> {
        &self.comm
    }

    /// Closes the transport. Outstanding receives on this rank fail with
    /// `Aborted`.
    pub fn finalize(self) -> Result<()> {
        if self.comm.is_aborted() {
            return Err(Error::Aborted(format!("rank {} was aborted before finalize", self.rank())));
        }
        log::info!("rank {} finalized", self.rank());
        self.comm.abort();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_rank() -> Result<()> {
        let ctx = CommContext::init(&CommConfig::Single)?;
        assert_eq!(ctx.rank(), 0);
        assert_eq!(ctx.world_size(), 1);
        ctx.communicator().barrier()?;
        ctx.finalize()
    }

    #[test]
    fn config_from_json() -> Result<()> {
        let config: CommConfig = serde_json::from_str(
            r#"{ "mode": "tcp", "rank": 1, "addrs": ["127.0.0.1:7000", "127.0.0.1:7001"] }"#,
        )?;
        match config {
            CommConfig::Tcp { rank, addrs, retry, .. } => {
                assert_eq!(rank, 1);
                assert_eq!(addrs.len(), 2);
                assert_eq!(retry, RetryPolicy::default());
            }
            CommConfig::Single => panic!("expected tcp"),
        }
        Ok(())
    }
}
