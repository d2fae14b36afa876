//! # Sweep
//! Eviction sweeps over the peer's advertised regions.
//!
//! A [`SweepPlan`] lists every remote byte to touch, one per bucket of the translation cache,
//! and a [`SweepEngine`] posts those one-sided reads in bounded batches, draining each batch
//! completely before posting the next one. Timing one full pass gives an [`IterationSample`].
pub mod latency;
pub mod layout;
pub mod params;

use crate::cancel::CancellationToken;
use crate::connection::{Address, ReadRequest, RegisteredRegion, Transport};
use crate::endpoint::{Endpoint, ReadyToSend};
use crate::error::{Error, Result};
use crate::exchange::RegionDescriptor;
use crate::output::Record;
use params::SweepParams;
use serde::Serialize;
use std::time::Instant;
use tracing::{debug, info};

/// Remote region as seen by the reading side. All read targets are obtained through
/// [`RemoteRegion::target`].
#[derive(Clone, Copy, Debug)]
pub struct RemoteRegion {
    desc: RegionDescriptor,
}

/// A validated remote read target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemoteTarget {
    pub address: Address,
    pub remote_key: u32,
    pub len: u32,
}

impl RemoteRegion {
    pub fn new(desc: RegionDescriptor) -> RemoteRegion {
        RemoteRegion { desc }
    }

    pub fn target(&self, offset: u64, len: u32) -> Result<RemoteTarget> {
        let size = self.desc.size_bytes;
        if offset >= size as u64 || offset + len as u64 > size as u64 {
            return Err(Error::OutOfBounds { offset, len, size });
        }
        let base = self.desc.remote_base_address;
        if base.checked_add(offset + len as u64).is_none() {
            return Err(Error::Protocol(format!(
                "region at {:#x} wraps past the end of the address space",
                base
            )));
        }

        Ok(RemoteTarget {
            address: base + offset,
            remote_key: self.desc.remote_key,
            len,
        })
    }
}

/// Every read of one sweep, in posting order.
#[derive(Clone, Debug, Default)]
pub struct SweepPlan {
    targets: Vec<RemoteTarget>,
}

impl SweepPlan {
    /// Offsets `0, step, 2*step, ...` of each region while a whole step still fits; the
    /// trailing partial step of a region is not read.
    pub fn new(regions: &[RegionDescriptor], step: u64, read_len: u32) -> Result<SweepPlan> {
        if step == 0 {
            return Err(Error::Config("sweep step must be nonzero".to_string()));
        }
        if read_len == 0 {
            return Err(Error::Config("read length must be nonzero".to_string()));
        }

        let mut targets = Vec::new();
        for desc in regions {
            let region = RemoteRegion::new(*desc);
            let reads = desc.size_bytes as u64 / step;
            for k in 0..reads {
                targets.push(region.target(k * step, read_len)?);
            }
        }
        debug!("planned {} reads over {} regions", targets.len(), regions.len());

        Ok(SweepPlan { targets })
    }

    pub fn targets(&self) -> &[RemoteTarget] {
        &self.targets
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// What a sweep needs once the connection is up.
pub struct SweepSession {
    pub scratch: RegisteredRegion,
    pub plan: SweepPlan,
    pub endpoint: Endpoint<ReadyToSend>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct IterationSample {
    pub index: u64,
    pub reads: usize,
    pub elapsed_ns: u64,
}

pub struct SweepEngine<'a> {
    transport: &'a mut Transport,
    session: &'a SweepSession,
    batch: usize,
    read_len: u32,
    next_wr_id: u64,
}

impl<'a> SweepEngine<'a> {
    pub fn new(
        transport: &'a mut Transport,
        session: &'a SweepSession,
        params: &SweepParams,
    ) -> Result<SweepEngine<'a>> {
        let batch = params.batch_size.min(transport.max_outstanding());
        if batch == 0 {
            return Err(Error::Config(format!(
                "batch size {} with a queue depth of {} leaves no room for reads",
                params.batch_size,
                transport.max_outstanding()
            )));
        }
        if params.read_len > session.scratch.size_bytes {
            return Err(Error::Config(format!(
                "scratch buffer of {} bytes cannot hold a {} byte read",
                session.scratch.size_bytes, params.read_len
            )));
        }

        Ok(SweepEngine {
            transport,
            session,
            batch,
            read_len: params.read_len,
            next_wr_id: 0,
        })
    }

    fn request(&mut self, target: &RemoteTarget) -> ReadRequest {
        let wr_id = self.next_wr_id;
        self.next_wr_id = self.next_wr_id.wrapping_add(1);

        ReadRequest {
            wr_id,
            remote_address: target.address,
            remote_key: target.remote_key,
            local_address: self.session.scratch.base_address,
            local_key: self.session.scratch.local_key,
            len: target.len.min(self.read_len),
        }
    }

    /// One full pass over the plan. Every posted read is drained before this returns.
    pub fn run_iteration(&mut self, index: u64) -> Result<IterationSample> {
        let session = self.session;
        let endpoint = session.endpoint.handle();

        let start = Instant::now();
        for chunk in session.plan.targets().chunks(self.batch) {
            for target in chunk {
                let req = self.request(target);
                self.transport.post_read(endpoint, &req)?;
            }
            self.transport.drain(chunk.len())?;
        }
        let elapsed = start.elapsed();

        Ok(IterationSample {
            index,
            reads: session.plan.len(),
            elapsed_ns: elapsed.as_nanos() as u64,
        })
    }

    /// Sweeps until `token` is cancelled or `limit` iterations are done. Cancellation is only
    /// observed between iterations. Returns the number of completed iterations.
    pub fn run<R>(
        &mut self,
        token: &CancellationToken,
        limit: Option<u64>,
        sink: &mut R,
    ) -> Result<u64>
    where
        R: Record<IterationSample> + ?Sized,
    {
        info!(
            "sweeping {} targets in batches of {}",
            self.session.plan.len(),
            self.batch
        );

        let mut done = 0;
        while limit.map_or(true, |l| done < l) {
            if token.is_cancelled() {
                info!("cancelled after {} iterations", done);
                break;
            }
            let sample = self.run_iteration(done)?;
            debug!("iteration {}: {} ns", sample.index, sample.elapsed_ns);
            sink.record(sample)?;
            done += 1;
        }

        Ok(done)
    }
}
