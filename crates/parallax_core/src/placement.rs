use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const HOST_DEVICE: i32 = -1;

/// A (process rank, device index) pair. Device `-1` is a host-only placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Placement {
    rank: usize,
    device: i32,
}

impl Placement {
    pub fn new(rank: usize, device: i32) -> Result<Self> {
        if device < HOST_DEVICE {
            return Err(Error::Placement(format!("invalid device index {} on rank {}", device, rank)));
        }
        Ok(Self { rank, device })
    }

    pub fn host(rank: usize) -> Self {
        Self {
            rank,
            device: HOST_DEVICE,
        }
    }

    pub fn device_of(rank: usize, device: usize) -> Self {
        Self {
            rank,
            device: device as i32,
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn device(&self) -> Option<usize> {
        if self.is_host() {
            None
        } else {
            Some(self.device as usize)
        }
    }

    pub fn raw_device(&self) -> i32 {
        self.device
    }

    pub fn is_host(&self) -> bool {
        self.device == HOST_DEVICE
    }

    pub fn same_rank(&self, other: &Placement) -> bool {
        self.rank == other.rank
    }
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.device() {
            Some(d) => write!(f, "rank{}:dev{}", self.rank, d),
            None => write!(f, "rank{}:host", self.rank),
        }
    }
}

/// Shape of the cluster a run is allowed to place work on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub world_size: usize,
    pub devices_per_rank: usize,
}

impl Topology {
    pub fn new(world_size: usize, devices_per_rank: usize) -> Self {
        Self {
            world_size,
            devices_per_rank,
        }
    }

    pub fn validate(&self, placement: &Placement) -> Result<()> {
        if placement.rank() >= self.world_size {
            return Err(Error::Placement(format!(
                "{} is unreachable: world size is {}",
                placement, self.world_size
            )));
        }
        if let Some(device) = placement.device() {
            if device >= self.devices_per_rank {
                return Err(Error::Placement(format!(
                    "{} is unreachable: rank {} has {} devices",
                    placement,
                    placement.rank(),
                    self.devices_per_rank
                )));
            }
        }
        Ok(())
    }
}
