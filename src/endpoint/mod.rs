//! # Endpoint
//! Reliable-connected endpoint (queue pair) brought up through the only legal path:
//! Reset -> Init -> ReadyToReceive -> ReadyToSend.
//!
//! The state lives in the type parameter of [`Endpoint`], so asking for ReadyToSend before
//! ReadyToReceive does not compile. Every transition consumes the endpoint; when the provider
//! refuses it the endpoint is gone and the error is fatal.
use crate::connection::{EndpointHandle, Transport};
use crate::error::Result;
use crate::exchange::ConnectionInfo;
use std::fmt;
use std::marker::PhantomData;
use std::ops::BitOr;
use tracing::{error, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointState {
    Reset,
    Init,
    ReadyToReceive,
    ReadyToSend,
    Error,
}

impl fmt::Display for EndpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EndpointState::Reset => "RESET",
            EndpointState::Init => "INIT",
            EndpointState::ReadyToReceive => "RTR",
            EndpointState::ReadyToSend => "RTS",
            EndpointState::Error => "ERR",
        };
        f.write_str(s)
    }
}

/// Attribute mask of a transition. Bit values are the libibverbs `ibv_qp_attr_mask` ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttrMask(u32);

impl AttrMask {
    pub const STATE: AttrMask = AttrMask(1);
    pub const ACCESS_FLAGS: AttrMask = AttrMask(1 << 3);
    pub const PKEY_INDEX: AttrMask = AttrMask(1 << 4);
    pub const PORT: AttrMask = AttrMask(1 << 5);
    pub const AV: AttrMask = AttrMask(1 << 7);
    pub const PATH_MTU: AttrMask = AttrMask(1 << 8);
    pub const TIMEOUT: AttrMask = AttrMask(1 << 9);
    pub const RETRY_CNT: AttrMask = AttrMask(1 << 10);
    pub const RNR_RETRY: AttrMask = AttrMask(1 << 11);
    pub const RQ_PSN: AttrMask = AttrMask(1 << 12);
    pub const MAX_QP_RD_ATOMIC: AttrMask = AttrMask(1 << 13);
    pub const MIN_RNR_TIMER: AttrMask = AttrMask(1 << 15);
    pub const SQ_PSN: AttrMask = AttrMask(1 << 16);
    pub const MAX_DEST_RD_ATOMIC: AttrMask = AttrMask(1 << 17);
    pub const DEST_QPN: AttrMask = AttrMask(1 << 20);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: AttrMask) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for AttrMask {
    type Output = AttrMask;

    fn bitor(self, rhs: AttrMask) -> AttrMask {
        AttrMask(self.0 | rhs.0)
    }
}

/// Access rights granted to the peer. Bit values are the `ibv_access_flags` ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccessFlags(pub u32);

impl AccessFlags {
    pub const LOCAL_WRITE: AccessFlags = AccessFlags(1);
    pub const REMOTE_WRITE: AccessFlags = AccessFlags(1 << 1);
    pub const REMOTE_READ: AccessFlags = AccessFlags(1 << 2);
}

impl BitOr for AccessFlags {
    type Output = AccessFlags;

    fn bitor(self, rhs: AccessFlags) -> AccessFlags {
        AccessFlags(self.0 | rhs.0)
    }
}

/// Path MTU classes, numbered like `ibv_mtu`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathMtu {
    Mtu256 = 1,
    Mtu512 = 2,
    Mtu1024 = 3,
    Mtu2048 = 4,
    Mtu4096 = 5,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InitAttributes {
    pub access: AccessFlags,
    pub pkey_index: u16,
    pub port_num: u8,
}

impl Default for InitAttributes {
    fn default() -> Self {
        InitAttributes {
            access: AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ | AccessFlags::REMOTE_WRITE,
            pkey_index: 0,
            port_num: 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadyToReceiveAttributes {
    pub dest_endpoint: u32,
    pub dest_port_id: u16,
    pub port_num: u8,
    pub path_mtu: PathMtu,
    pub rq_psn: u32,
    /// Reads the peer may have outstanding against us
    pub max_dest_rd_atomic: u8,
    pub min_rnr_timer: u8,
}

impl ReadyToReceiveAttributes {
    pub fn for_peer(peer: &ConnectionInfo) -> ReadyToReceiveAttributes {
        ReadyToReceiveAttributes {
            dest_endpoint: peer.endpoint_id,
            dest_port_id: peer.local_port_id,
            port_num: 1,
            path_mtu: PathMtu::Mtu1024,
            rq_psn: 1,
            max_dest_rd_atomic: 1,
            min_rnr_timer: 12,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadyToSendAttributes {
    pub timeout: u8,
    pub retry_cnt: u8,
    pub rnr_retry: u8,
    pub sq_psn: u32,
    pub max_rd_atomic: u8,
}

impl Default for ReadyToSendAttributes {
    fn default() -> Self {
        ReadyToSendAttributes {
            timeout: 14,
            retry_cnt: 7,
            rnr_retry: 7,
            sq_psn: 1,
            max_rd_atomic: 1,
        }
    }
}

/// One transition together with the attributes it binds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateChange {
    Init(InitAttributes),
    ReadyToReceive(ReadyToReceiveAttributes),
    ReadyToSend(ReadyToSendAttributes),
}

impl StateChange {
    /// State the endpoint must be in for this change to apply
    pub fn source(&self) -> EndpointState {
        match self {
            StateChange::Init(_) => EndpointState::Reset,
            StateChange::ReadyToReceive(_) => EndpointState::Init,
            StateChange::ReadyToSend(_) => EndpointState::ReadyToReceive,
        }
    }

    pub fn target(&self) -> EndpointState {
        match self {
            StateChange::Init(_) => EndpointState::Init,
            StateChange::ReadyToReceive(_) => EndpointState::ReadyToReceive,
            StateChange::ReadyToSend(_) => EndpointState::ReadyToSend,
        }
    }

    /// Mask sent along with the change
    pub fn mask(&self) -> AttrMask {
        match self {
            StateChange::Init(_) => {
                AttrMask::STATE | AttrMask::PKEY_INDEX | AttrMask::PORT | AttrMask::ACCESS_FLAGS
            }
            StateChange::ReadyToReceive(_) => {
                AttrMask::STATE
                    | AttrMask::AV
                    | AttrMask::PATH_MTU
                    | AttrMask::DEST_QPN
                    | AttrMask::RQ_PSN
                    | AttrMask::MAX_DEST_RD_ATOMIC
                    | AttrMask::MIN_RNR_TIMER
            }
            StateChange::ReadyToSend(_) => {
                AttrMask::STATE
                    | AttrMask::TIMEOUT
                    | AttrMask::RETRY_CNT
                    | AttrMask::RNR_RETRY
                    | AttrMask::SQ_PSN
                    | AttrMask::MAX_QP_RD_ATOMIC
            }
        }
    }

    /// Attributes a provider refuses the transition without (IB spec, table of required attributes)
    pub fn required_mask(&self) -> AttrMask {
        match self {
            StateChange::Init(_) => AttrMask::STATE | AttrMask::PKEY_INDEX | AttrMask::PORT,
            StateChange::ReadyToReceive(_) => {
                AttrMask::STATE
                    | AttrMask::AV
                    | AttrMask::PATH_MTU
                    | AttrMask::DEST_QPN
                    | AttrMask::RQ_PSN
            }
            StateChange::ReadyToSend(_) => AttrMask::STATE | AttrMask::SQ_PSN,
        }
    }
}

pub trait State {
    const STATE: EndpointState;
}

#[derive(Debug)]
pub struct Reset;
#[derive(Debug)]
pub struct Init;
#[derive(Debug)]
pub struct ReadyToReceive;
#[derive(Debug)]
pub struct ReadyToSend;

impl State for Reset {
    const STATE: EndpointState = EndpointState::Reset;
}
impl State for Init {
    const STATE: EndpointState = EndpointState::Init;
}
impl State for ReadyToReceive {
    const STATE: EndpointState = EndpointState::ReadyToReceive;
}
impl State for ReadyToSend {
    const STATE: EndpointState = EndpointState::ReadyToSend;
}

/// A local endpoint in state `S`.
///
/// Only the next state is reachable from each state:
///
/// ```
/// use mttsweep::connection::{local::LocalProvider, Transport};
/// use mttsweep::endpoint::*;
/// use mttsweep::exchange::ConnectionInfo;
///
/// let mut t = Transport::new(LocalProvider::new());
/// let peer = ConnectionInfo::new(1, 1, vec![]);
/// let ep = Endpoint::create(&mut t)?
///     .into_init(&mut t, &InitAttributes::default())?
///     .into_ready_to_receive(&mut t, &ReadyToReceiveAttributes::for_peer(&peer))?
///     .into_ready_to_send(&mut t, &ReadyToSendAttributes::default())?;
/// assert_eq!(ep.state(), EndpointState::ReadyToSend);
/// # Ok::<(), mttsweep::Error>(())
/// ```
///
/// Skipping ReadyToReceive does not compile:
///
/// ```compile_fail
/// use mttsweep::connection::{local::LocalProvider, Transport};
/// use mttsweep::endpoint::*;
///
/// let mut t = Transport::new(LocalProvider::new());
/// let ep = Endpoint::create(&mut t)?.into_init(&mut t, &InitAttributes::default())?;
/// ep.into_ready_to_send(&mut t, &ReadyToSendAttributes::default())?;
/// # Ok::<(), mttsweep::Error>(())
/// ```
///
/// Neither does skipping Init:
///
/// ```compile_fail
/// use mttsweep::connection::{local::LocalProvider, Transport};
/// use mttsweep::endpoint::*;
/// use mttsweep::exchange::ConnectionInfo;
///
/// let mut t = Transport::new(LocalProvider::new());
/// let peer = ConnectionInfo::new(1, 1, vec![]);
/// let ep = Endpoint::create(&mut t)?;
/// ep.into_ready_to_receive(&mut t, &ReadyToReceiveAttributes::for_peer(&peer))?;
/// # Ok::<(), mttsweep::Error>(())
/// ```
#[derive(Debug)]
pub struct Endpoint<S: State> {
    handle: EndpointHandle,
    _state: PhantomData<S>,
}

impl<S: State> Endpoint<S> {
    pub fn handle(&self) -> EndpointHandle {
        self.handle
    }

    pub fn state(&self) -> EndpointState {
        S::STATE
    }

    fn transition<N: State>(
        self,
        transport: &mut Transport,
        change: StateChange,
    ) -> Result<Endpoint<N>> {
        if let Err(e) = transport.modify_endpoint(self.handle, &change) {
            error!(
                "endpoint {}: {} -> {} refused, now {}",
                self.handle.0,
                S::STATE,
                N::STATE,
                EndpointState::Error
            );
            return Err(e);
        }
        info!("endpoint {}: {} -> {}", self.handle.0, S::STATE, N::STATE);

        Ok(Endpoint {
            handle: self.handle,
            _state: PhantomData,
        })
    }

    pub fn destroy(self, transport: &mut Transport) -> Result<()> {
        transport.destroy_endpoint(self.handle)
    }
}

impl Endpoint<Reset> {
    pub fn create(transport: &mut Transport) -> Result<Endpoint<Reset>> {
        let handle = transport.create_endpoint()?;
        info!("endpoint {} created", handle.0);

        Ok(Endpoint {
            handle,
            _state: PhantomData,
        })
    }

    pub fn into_init(
        self,
        transport: &mut Transport,
        attrs: &InitAttributes,
    ) -> Result<Endpoint<Init>> {
        self.transition(transport, StateChange::Init(*attrs))
    }
}

impl Endpoint<Init> {
    pub fn into_ready_to_receive(
        self,
        transport: &mut Transport,
        attrs: &ReadyToReceiveAttributes,
    ) -> Result<Endpoint<ReadyToReceive>> {
        self.transition(transport, StateChange::ReadyToReceive(*attrs))
    }
}

impl Endpoint<ReadyToReceive> {
    pub fn into_ready_to_send(
        self,
        transport: &mut Transport,
        attrs: &ReadyToSendAttributes,
    ) -> Result<Endpoint<ReadyToSend>> {
        self.transition(transport, StateChange::ReadyToSend(*attrs))
    }
}

/// Runs the whole transition sequence against the peer described by `peer`.
pub fn bring_up(
    transport: &mut Transport,
    endpoint: Endpoint<Reset>,
    peer: &ConnectionInfo,
) -> Result<Endpoint<ReadyToSend>> {
    endpoint
        .into_init(transport, &InitAttributes::default())?
        .into_ready_to_receive(transport, &ReadyToReceiveAttributes::for_peer(peer))?
        .into_ready_to_send(transport, &ReadyToSendAttributes::default())
}
