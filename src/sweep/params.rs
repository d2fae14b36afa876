use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

pub const PAGE_SIZE: u32 = 4096; // 4 KiB
pub const PREFETCH_GROUP_SIZE: u32 = 8; // translations fetched together by the NIC

/// Mellanox ConnectX class adapters
pub static MLX_CONNECTX: CacheGeometry = CacheGeometry {
    page_size: PAGE_SIZE,
    prefetch_group: PREFETCH_GROUP_SIZE,
};

/// Shape of the translation cache of the targeted adapter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheGeometry {
    pub page_size: u32,
    pub prefetch_group: u32,
}

impl CacheGeometry {
    pub fn new(page_size: u32, prefetch_group: u32) -> CacheGeometry {
        CacheGeometry {
            page_size,
            prefetch_group,
        }
    }
}

impl Default for CacheGeometry {
    fn default() -> Self {
        MLX_CONNECTX
    }
}

/// Distance between two consecutive reads of a sweep.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepPolicy {
    /// One read per prefetch group of pages
    Coarse,
    /// `prefetch_group` bytes, several reads per page
    FineGroup,
    /// One read per page
    FinePage,
}

pub const POLICIES: [&str; 3] = ["coarse", "fine-group", "fine-page"];

impl StepPolicy {
    pub fn step(self, geometry: &CacheGeometry) -> u64 {
        let (p, g) = (geometry.page_size as u64, geometry.prefetch_group as u64);
        match self {
            StepPolicy::Coarse => p * g,
            StepPolicy::FineGroup => g,
            StepPolicy::FinePage => p,
        }
    }
}

impl FromStr for StepPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<StepPolicy> {
        match s {
            "coarse" => Ok(StepPolicy::Coarse),
            "fine-group" => Ok(StepPolicy::FineGroup),
            "fine-page" => Ok(StepPolicy::FinePage),
            other => Err(Error::Config(format!(
                "unknown step policy {:?}, expected one of {:?}",
                other, POLICIES
            ))),
        }
    }
}

impl fmt::Display for StepPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepPolicy::Coarse => POLICIES[0],
            StepPolicy::FineGroup => POLICIES[1],
            StepPolicy::FinePage => POLICIES[2],
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SweepParams {
    pub geometry: CacheGeometry,
    pub policy: StepPolicy,
    // bytes fetched by every read
    pub read_len: u32,
    // reads posted before draining, capped by the provider queue depth
    pub batch_size: usize,
    // None sweeps until cancelled
    pub iterations: Option<u64>,
}

impl SweepParams {
    pub fn step(&self) -> u64 {
        self.policy.step(&self.geometry)
    }
}

impl Default for SweepParams {
    fn default() -> Self {
        SweepParams {
            geometry: MLX_CONNECTX,
            policy: StepPolicy::Coarse,
            read_len: 1,
            batch_size: 10,
            iterations: None,
        }
    }
}
