//! Latency of a single remote read, repeated at a slow pace so the translation of the target
//! address may age out of the cache between samples.
use super::{IterationSample, RemoteRegion, RemoteTarget, SweepSession};
use crate::cancel::CancellationToken;
use crate::connection::{ReadRequest, Transport};
use crate::error::{Error, Result};
use crate::exchange::RegionDescriptor;
use crate::output::Record;
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);
// granularity at which a pause notices cancellation
const PAUSE_SLICE: Duration = Duration::from_millis(50);

pub struct LatencyProbe {
    target: RemoteTarget,
    interval: Duration,
}

impl LatencyProbe {
    /// Probes the first byte of the first advertised region.
    pub fn new(regions: &[RegionDescriptor], interval: Duration) -> Result<LatencyProbe> {
        let first = regions.first().ok_or_else(|| {
            Error::Config("latency probe needs at least one peer region".to_string())
        })?;
        let target = RemoteRegion::new(*first).target(0, 1)?;

        Ok(LatencyProbe { target, interval })
    }

    pub fn target(&self) -> &RemoteTarget {
        &self.target
    }

    /// Sleeps for the interval, returning early when `token` fires.
    fn pause(&self, token: &CancellationToken) {
        let deadline = Instant::now() + self.interval;
        loop {
            let now = Instant::now();
            if now >= deadline || token.is_cancelled() {
                return;
            }
            thread::sleep(PAUSE_SLICE.min(deadline - now));
        }
    }

    /// Times post + drain of one read per sample until cancelled or `limit` samples are taken.
    pub fn run<R>(
        &self,
        transport: &mut Transport,
        session: &SweepSession,
        token: &CancellationToken,
        limit: Option<u64>,
        sink: &mut R,
    ) -> Result<u64>
    where
        R: Record<IterationSample> + ?Sized,
    {
        info!("probing {:#x} every {:?}", self.target.address, self.interval);
        let endpoint = session.endpoint.handle();

        let mut done = 0;
        while limit.map_or(true, |l| done < l) && !token.is_cancelled() {
            let req = ReadRequest {
                wr_id: done,
                remote_address: self.target.address,
                remote_key: self.target.remote_key,
                local_address: session.scratch.base_address,
                local_key: session.scratch.local_key,
                len: self.target.len,
            };

            let start = Instant::now();
            transport.post_read(endpoint, &req)?;
            transport.drain(1)?;
            let elapsed = start.elapsed();

            info!("{:>10}) {}", done, elapsed.as_micros());
            sink.record(IterationSample {
                index: done,
                reads: 1,
                elapsed_ns: elapsed.as_nanos() as u64,
            })?;
            done += 1;

            if limit.map_or(true, |l| done < l) {
                self.pause(token);
            }
        }

        Ok(done)
    }
}
