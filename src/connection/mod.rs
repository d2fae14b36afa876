//! # Connection
//! This module provides a uniform interface over the transport provider (device, protection
//! domain, memory regions, queue pairs and completions). Everything above this layer talks to
//! a [`Transport`], which wraps one [`TransportProvider`] implementation.
pub mod local;
pub mod mapping;
#[cfg(feature = "rdma")]
pub mod rdma;

use crate::endpoint::StateChange;
use crate::error::{Error, Result};
use crate::exchange::RegionDescriptor;
use tracing::{debug, error};

pub type Time = u64;
pub type Address = u64;

/// Identifier of a communication endpoint (the queue pair number).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EndpointHandle(pub u32);

/// A buffer registered for remote access. Only the registering side owns it; the peer gets
/// a [`RegionDescriptor`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisteredRegion {
    pub id: usize,
    pub base_address: Address,
    pub size_bytes: u32,
    pub local_key: u32,
    pub remote_key: u32,
}

impl RegisteredRegion {
    /// What the peer needs to issue one-sided reads against this region
    pub fn descriptor(&self) -> RegionDescriptor {
        RegionDescriptor {
            remote_base_address: self.base_address,
            remote_key: self.remote_key,
            size_bytes: self.size_bytes,
        }
    }
}

/// A single one-sided read from `remote_address` into `local_address`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadRequest {
    pub wr_id: u64,
    pub remote_address: Address,
    pub remote_key: u32,
    pub local_address: Address,
    pub local_key: u32,
    pub len: u32,
}

/// Raw operations of a remote memory access provider.
///
/// Implementations report failures as [`Error::Transport`] and never retry.
pub trait TransportProvider {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Allocates and registers `size` bytes for local write and remote read/write access.
    /// When `placement` is given the buffer must start exactly at that virtual address.
    fn register_region(&mut self, size: usize, placement: Option<Address>)
        -> Result<RegisteredRegion>;

    fn deregister_region(&mut self, region: RegisteredRegion) -> Result<()>;

    /// Creates a reliable-connected endpoint in the Reset state
    fn create_endpoint(&mut self) -> Result<EndpointHandle>;

    fn destroy_endpoint(&mut self, endpoint: EndpointHandle) -> Result<()>;

    /// Applies one state transition with its explicit attribute mask.
    fn modify_endpoint(&mut self, endpoint: EndpointHandle, change: &StateChange) -> Result<()>;

    /// Port-local identifier (LID) the peer needs to address us
    fn local_port_id(&self) -> Result<u16>;

    /// Posts a signaled remote read. Returns as soon as the request is queued.
    fn post_read(&mut self, endpoint: EndpointHandle, request: &ReadRequest) -> Result<()>;

    /// Blocks until exactly `n` completions are retired. Any completion with an error status
    /// fails the whole drain.
    fn drain(&mut self, n: usize) -> Result<usize>;

    /// How many posted reads may be outstanding at once
    fn max_outstanding(&self) -> usize;
}

/// The single error-handling wrapper around a provider: every call is logged before and after,
/// and failures are logged once here before being handed up.
pub struct Transport {
    inner: Box<dyn TransportProvider>,
}

impl Transport {
    pub fn new<P: TransportProvider + 'static>(provider: P) -> Transport {
        Transport {
            inner: Box::new(provider),
        }
    }

    pub fn provider_name(&self) -> &'static str {
        self.inner.name()
    }

    fn call<T, F>(&mut self, op: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn TransportProvider) -> Result<T>,
    {
        let provider = self.inner.name();
        debug!(provider, op, "calling");
        match f(self.inner.as_mut()) {
            Ok(v) => {
                debug!(provider, op, "done");
                Ok(v)
            }
            Err(e) => {
                error!(provider, op, "{}", e);
                Err(e)
            }
        }
    }

    pub fn register_region(
        &mut self,
        size: usize,
        placement: Option<Address>,
    ) -> Result<RegisteredRegion> {
        if size > u32::MAX as usize {
            return Err(Error::Config(format!(
                "region of {} bytes does not fit the 32-bit size field",
                size
            )));
        }
        self.call("register_region", |p| p.register_region(size, placement))
    }

    pub fn deregister_region(&mut self, region: RegisteredRegion) -> Result<()> {
        self.call("deregister_region", |p| p.deregister_region(region))
    }

    pub fn create_endpoint(&mut self) -> Result<EndpointHandle> {
        self.call("create_endpoint", |p| p.create_endpoint())
    }

    pub fn destroy_endpoint(&mut self, endpoint: EndpointHandle) -> Result<()> {
        self.call("destroy_endpoint", |p| p.destroy_endpoint(endpoint))
    }

    pub fn modify_endpoint(
        &mut self,
        endpoint: EndpointHandle,
        change: &StateChange,
    ) -> Result<()> {
        self.call("modify_endpoint", |p| p.modify_endpoint(endpoint, change))
    }

    pub fn local_port_id(&mut self) -> Result<u16> {
        self.call("local_port_id", |p| p.local_port_id())
    }

    pub fn post_read(&mut self, endpoint: EndpointHandle, request: &ReadRequest) -> Result<()> {
        self.call("post_read", |p| p.post_read(endpoint, request))
    }

    /// Drains `n` completions, treating any other count as a provider failure.
    pub fn drain(&mut self, n: usize) -> Result<()> {
        let drained = self.call("drain", |p| p.drain(n))?;
        if drained != n {
            let e = Error::transport(
                "drain",
                format!("expected {} completions, got {}", n, drained),
            );
            error!("{}", e);
            return Err(e);
        }
        Ok(())
    }

    pub fn max_outstanding(&self) -> usize {
        self.inner.max_outstanding()
    }
}
