//! In-process stand-in for the RDMA hardware. It keeps real buffers and enforces what a device
//! would (endpoint transitions, send queue depth, key checks), but completes every posted read
//! immediately. Everything it does is appended to a shared [`ProviderLog`] for inspection.
use crate::cancel::CancellationToken;
use crate::connection::mapping::Backing;
use crate::connection::{Address, EndpointHandle, ReadRequest, RegisteredRegion, TransportProvider};
use crate::endpoint::{EndpointState, StateChange};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::trace;

pub const DEFAULT_MAX_OUTSTANDING: usize = 10;
const LOCAL_PORT_ID: u16 = 1;

/// Everything observable the local provider has done.
#[derive(Clone, Debug, Default)]
pub struct ProviderLog {
    pub reads: Vec<ReadRequest>,
    /// Size of every drain, in call order
    pub drains: Vec<usize>,
    pub transitions: Vec<(EndpointHandle, EndpointState)>,
    pub registered: usize,
    pub deregistered: usize,
    pub destroyed: Vec<EndpointHandle>,
    /// Highest number of reads that were posted but not drained at the same time
    pub max_in_flight: usize,
    pub outstanding: usize,
    /// Reads posted so far, also when the history is off
    pub posted: usize,
}

struct LocalRegion {
    backing: Backing,
    region: RegisteredRegion,
}

pub struct LocalProvider {
    regions: HashMap<usize, LocalRegion>,
    next_region: usize,
    endpoints: HashMap<u32, EndpointState>,
    next_endpoint: u32,
    capacity: usize,
    fail_read_at: Option<usize>,
    cancel_at: Option<(usize, CancellationToken)>,
    history: bool,
    log: Arc<Mutex<ProviderLog>>,
}

impl LocalProvider {
    pub fn new() -> LocalProvider {
        LocalProvider::with_capacity(DEFAULT_MAX_OUTSTANDING)
    }

    /// Provider whose send queue holds `capacity` outstanding reads
    pub fn with_capacity(capacity: usize) -> LocalProvider {
        LocalProvider {
            regions: HashMap::new(),
            next_region: 0,
            endpoints: HashMap::new(),
            next_endpoint: rand::random::<u32>() & 0x00ff_ffff,
            capacity,
            fail_read_at: None,
            cancel_at: None,
            history: true,
            log: Arc::new(Mutex::new(ProviderLog::default())),
        }
    }

    /// The `n`-th posted read (counting from 1) completes with an error status.
    pub fn fail_read_at(mut self, n: usize) -> LocalProvider {
        self.fail_read_at = Some(n);
        self
    }

    /// Cancels `token` while posting the `n`-th read (counting from 1), i.e. from inside an
    /// in-flight batch.
    pub fn cancel_at(mut self, n: usize, token: CancellationToken) -> LocalProvider {
        self.cancel_at = Some((n, token));
        self
    }

    /// Stops recording individual reads and drains; counters are still kept.
    pub fn without_history(mut self) -> LocalProvider {
        self.history = false;
        self
    }

    /// Shared handle on the provider log; stays valid after the provider is moved into a
    /// [`Transport`](crate::connection::Transport).
    pub fn log(&self) -> Arc<Mutex<ProviderLog>> {
        self.log.clone()
    }

    fn with_log<T, F: FnOnce(&mut ProviderLog) -> T>(&self, f: F) -> Result<T> {
        let mut log = self
            .log
            .lock()
            .map_err(|_| Error::transport("log", "provider log poisoned"))?;
        Ok(f(&mut log))
    }

    fn owns_local(&self, addr: Address, len: u32, lkey: u32) -> bool {
        self.regions.values().any(|r| {
            r.region.local_key == lkey
                && addr >= r.region.base_address
                && addr + len as u64 <= r.region.base_address + r.region.size_bytes as u64
        })
    }
}

impl Default for LocalProvider {
    fn default() -> Self {
        LocalProvider::new()
    }
}

impl TransportProvider for LocalProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    fn register_region(
        &mut self,
        size: usize,
        placement: Option<Address>,
    ) -> Result<RegisteredRegion> {
        let mut backing = Backing::allocate(size, placement)?;
        let id = self.next_region;
        self.next_region += 1;

        let region = RegisteredRegion {
            id,
            base_address: backing.address(),
            size_bytes: size as u32,
            local_key: rand::random(),
            remote_key: rand::random(),
        };
        self.regions.insert(id, LocalRegion { backing, region });
        self.with_log(|l| l.registered += 1)?;

        Ok(region)
    }

    fn deregister_region(&mut self, region: RegisteredRegion) -> Result<()> {
        match self.regions.remove(&region.id) {
            Some(r) => {
                trace!("released {} bytes of region {}", r.backing.len(), region.id);
                self.with_log(|l| l.deregistered += 1)
            }
            None => Err(Error::transport(
                "dereg_mr",
                format!("region {} is not registered", region.id),
            )),
        }
    }

    fn create_endpoint(&mut self) -> Result<EndpointHandle> {
        let num = self.next_endpoint;
        self.next_endpoint += 1;
        self.endpoints.insert(num, EndpointState::Reset);

        Ok(EndpointHandle(num))
    }

    fn destroy_endpoint(&mut self, endpoint: EndpointHandle) -> Result<()> {
        if self.endpoints.remove(&endpoint.0).is_none() {
            return Err(Error::transport(
                "destroy_qp",
                format!("no endpoint {}", endpoint.0),
            ));
        }
        // destroying the queue pair flushes whatever it still had posted
        self.with_log(|l| {
            l.outstanding = 0;
            l.destroyed.push(endpoint);
        })
    }

    fn modify_endpoint(&mut self, endpoint: EndpointHandle, change: &StateChange) -> Result<()> {
        let current = self
            .endpoints
            .get_mut(&endpoint.0)
            .ok_or_else(|| Error::transport("modify_qp", format!("no endpoint {}", endpoint.0)))?;

        if *current != change.source() || !change.mask().contains(change.required_mask()) {
            let from = *current;
            *current = EndpointState::Error;
            return Err(Error::transport(
                "modify_qp",
                format!("illegal transition {:?} -> {:?}", from, change.target()),
            ));
        }

        *current = change.target();
        let target = change.target();
        self.with_log(|l| l.transitions.push((endpoint, target)))
    }

    fn local_port_id(&self) -> Result<u16> {
        Ok(LOCAL_PORT_ID)
    }

    fn post_read(&mut self, endpoint: EndpointHandle, request: &ReadRequest) -> Result<()> {
        match self.endpoints.get(&endpoint.0) {
            Some(EndpointState::ReadyToSend) => {}
            state => {
                return Err(Error::transport(
                    "post_send",
                    format!("endpoint {} is in state {:?}", endpoint.0, state),
                ))
            }
        }
        if !self.owns_local(request.local_address, request.len, request.local_key) {
            return Err(Error::transport(
                "post_send",
                format!(
                    "local buffer {:#x} with lkey {} is not registered",
                    request.local_address, request.local_key
                ),
            ));
        }

        let (capacity, history) = (self.capacity, self.history);
        let posted = self.with_log(|l| {
            if l.outstanding >= capacity {
                return None;
            }
            l.outstanding += 1;
            l.posted += 1;
            l.max_in_flight = l.max_in_flight.max(l.outstanding);
            if history {
                l.reads.push(*request);
            }
            Some(l.posted)
        })?;
        let posted = posted.ok_or_else(|| {
            Error::transport("post_send", format!("send queue full ({} outstanding)", capacity))
        })?;

        if let Some((n, token)) = &self.cancel_at {
            if *n == posted {
                token.cancel();
            }
        }
        if self.fail_read_at == Some(posted) {
            return Err(Error::transport(
                "post_send",
                format!("work request {} completed with IBV_WC_REM_ACCESS_ERR", request.wr_id),
            ));
        }

        Ok(())
    }

    fn drain(&mut self, n: usize) -> Result<usize> {
        let history = self.history;
        self.with_log(|l| {
            if n > l.outstanding {
                return Err(Error::transport(
                    "poll_cq",
                    format!("waiting for {} completions with {} outstanding", n, l.outstanding),
                ));
            }
            l.outstanding -= n;
            if history {
                l.drains.push(n);
            }
            Ok(n)
        })?
    }

    fn max_outstanding(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{InitAttributes, ReadyToSendAttributes};

    #[test]
    fn registered_regions_are_distinct() {
        let mut p = LocalProvider::new();
        let a = p.register_region(4096, None).unwrap();
        let b = p.register_region(8192, None).unwrap();

        assert_ne!(a.id, b.id);
        assert_ne!(a.base_address, b.base_address);
        assert_eq!(b.size_bytes, 8192);
        assert_eq!(p.log().lock().unwrap().registered, 2);

        p.deregister_region(a).unwrap();
        assert!(p.deregister_region(a).is_err());
    }

    #[test]
    fn skipping_a_transition_is_rejected() {
        let mut p = LocalProvider::new();
        let ep = p.create_endpoint().unwrap();

        let skip = StateChange::ReadyToSend(ReadyToSendAttributes::default());
        let res = p.modify_endpoint(ep, &skip);
        assert!(res.is_err());
        assert_eq!(p.endpoints[&ep.0], EndpointState::Error);
    }

    #[test]
    fn reads_need_a_ready_endpoint() {
        let mut p = LocalProvider::new();
        let scratch = p.register_region(64, None).unwrap();
        let ep = p.create_endpoint().unwrap();
        p.modify_endpoint(ep, &StateChange::Init(InitAttributes::default()))
            .unwrap();

        let req = ReadRequest {
            wr_id: 0,
            remote_address: 0x1000,
            remote_key: 7,
            local_address: scratch.base_address,
            local_key: scratch.local_key,
            len: 1,
        };
        assert!(p.post_read(ep, &req).is_err());
    }

    #[test]
    fn draining_more_than_posted_fails() {
        let mut p = LocalProvider::new();
        assert!(p.drain(1).is_err());
        assert_eq!(p.drain(0).unwrap(), 0);
    }
}
