//! # Session
//! One run of either side, from memory registration to teardown.
//!
//! Both sides walk the same steps so that the two rendezvous points line up: register memory,
//! open the control channel, swap connection info, bring the endpoint up, meet at the first
//! barrier, let the client measure, meet at the second barrier and release everything.
use crate::cancel::{install_interrupt_handler, CancellationToken};
use crate::connection::{RegisteredRegion, Transport};
use crate::control;
use crate::endpoint::{bring_up, Endpoint, ReadyToSend, Reset};
use crate::error::{Error, Result};
use crate::exchange::{exchange_with_peer, ConnectionInfo, RegionDescriptor};
use crate::output::file::JsonLines;
use crate::output::{Progress, Record, SweepReport};
use crate::sweep::latency::{LatencyProbe, DEFAULT_INTERVAL};
use crate::sweep::layout::BucketLayout;
use crate::sweep::params::SweepParams;
use crate::sweep::{IterationSample, SweepEngine, SweepPlan, SweepSession};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_REGION_SIZE: usize = 1 << 20;
pub const DEFAULT_LAYOUT_REGION_SIZE: usize = 4096;
pub const DEFAULT_SCRATCH_SIZE: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Server,
    Client(Ipv4Addr),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Sweep,
    Latency,
}

/// Memory the server registers and advertises.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegionSpec {
    /// One heap region per entry, of the given size
    Sizes(Vec<usize>),
    /// One region of `size` bytes at the base address of every bucket of `layout`
    Layout { layout: BucketLayout, size: usize },
}

impl RegionSpec {
    pub fn uniform(count: usize, size: usize) -> RegionSpec {
        RegionSpec::Sizes(vec![size; count])
    }
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub role: Role,
    pub port: u16,
    pub mode: Mode,
    pub sweep: SweepParams,
    pub server_regions: RegionSpec,
    pub scratch_size: usize,
    pub advertise_scratch: bool,
    pub latency_interval: Duration,
    pub output: Option<PathBuf>,
    pub progress: bool,
    /// Route SIGINT into the token while the client measures
    pub catch_interrupts: bool,
}

impl SessionConfig {
    pub fn new(role: Role) -> SessionConfig {
        SessionConfig {
            role,
            port: control::DEFAULT_PORT,
            mode: Mode::Sweep,
            sweep: SweepParams::default(),
            server_regions: RegionSpec::uniform(1, DEFAULT_REGION_SIZE),
            scratch_size: DEFAULT_SCRATCH_SIZE,
            advertise_scratch: true,
            latency_interval: DEFAULT_INTERVAL,
            output: None,
            progress: false,
            catch_interrupts: false,
        }
    }
}

fn register_all(
    transport: &mut Transport,
    wanted: &[(usize, Option<u64>)],
) -> Result<Vec<RegisteredRegion>> {
    let mut regions = Vec::with_capacity(wanted.len());
    for &(size, placement) in wanted {
        match transport.register_region(size, placement) {
            Ok(r) => regions.push(r),
            Err(e) => {
                release(transport, regions);
                return Err(e);
            }
        }
    }
    Ok(regions)
}

/// Deregisters every region, carrying on past failures. Returns false if any failed.
fn release(transport: &mut Transport, regions: Vec<RegisteredRegion>) -> bool {
    let mut clean = true;
    for r in regions {
        if let Err(e) = transport.deregister_region(r) {
            warn!("region {} not released: {}", r.id, e);
            clean = false;
        }
    }
    clean
}

/// What this side registers, as (size, placement) pairs.
fn wanted_regions(config: &SessionConfig) -> Result<Vec<(usize, Option<u64>)>> {
    match config.role {
        Role::Client(_) => Ok(vec![(config.scratch_size, None)]),
        Role::Server => match &config.server_regions {
            RegionSpec::Sizes(sizes) => Ok(sizes.iter().map(|&s| (s, None)).collect()),
            RegionSpec::Layout { layout, size } => {
                let spacing = 1usize << layout.lower_first;
                if *size > spacing {
                    return Err(Error::Config(format!(
                        "regions of {} bytes overlap buckets spaced {} bytes apart",
                        size, spacing
                    )));
                }
                Ok(layout.addresses()?.into_iter().map(|a| (*size, Some(a))).collect())
            }
        },
    }
}

fn save(report: &SweepReport, path: &Path) -> Result<()> {
    let file = File::create(path)
        .map_err(|e| Error::Output(format!("cannot create {}: {}", path.display(), e)))?;
    report.dump_to(&mut JsonLines::new(BufWriter::new(file)))?;
    info!("{} samples written to {}", report.samples().len(), path.display());
    Ok(())
}

/// Runs the client side measurement on a connected endpoint.
fn measure<R: Record<IterationSample>>(
    config: &SessionConfig,
    transport: &mut Transport,
    token: &CancellationToken,
    session: &SweepSession,
    peer: &ConnectionInfo,
    sink: &mut R,
) -> Result<u64> {
    match config.mode {
        Mode::Sweep => {
            let mut engine = SweepEngine::new(transport, session, &config.sweep)?;
            engine.run(token, config.sweep.iterations, sink)
        }
        Mode::Latency => LatencyProbe::new(peer.regions(), config.latency_interval)?.run(
            transport,
            session,
            token,
            config.sweep.iterations,
            sink,
        ),
    }
}

fn connected<S: Read + Write>(
    config: &SessionConfig,
    transport: &mut Transport,
    token: &CancellationToken,
    stream: &mut S,
    regions: &[RegisteredRegion],
    report: &mut SweepReport,
) -> Result<()> {
    let endpoint = Endpoint::create(transport)?;
    let handle = endpoint.handle();

    match established(config, transport, token, stream, regions, report, endpoint) {
        Ok(endpoint) => endpoint.destroy(transport),
        Err(e) => {
            // the endpoint goes before the regions its reads may still target
            if let Err(d) = transport.destroy_endpoint(handle) {
                warn!("endpoint {} not destroyed: {}", handle.0, d);
            }
            Err(e)
        }
    }
}

/// Everything between endpoint creation and its destruction. On success the endpoint is handed
/// back for the caller to destroy.
fn established<S: Read + Write>(
    config: &SessionConfig,
    transport: &mut Transport,
    token: &CancellationToken,
    stream: &mut S,
    regions: &[RegisteredRegion],
    report: &mut SweepReport,
    endpoint: Endpoint<Reset>,
) -> Result<Endpoint<ReadyToSend>> {
    let advertised: Vec<RegionDescriptor> = match config.role {
        Role::Server => regions.iter().map(|r| r.descriptor()).collect(),
        Role::Client(_) if config.advertise_scratch => {
            regions.iter().map(|r| r.descriptor()).collect()
        }
        Role::Client(_) => Vec::new(),
    };

    let local = ConnectionInfo::new(endpoint.handle().0, transport.local_port_id()?, advertised);
    let peer = exchange_with_peer(stream, &local)?;

    let endpoint = bring_up(transport, endpoint, &peer)?;
    control::barrier_ping(stream)?;
    info!("connection established");

    let endpoint = match config.role {
        Role::Server => {
            info!("serving reads until the client is done");
            endpoint
        }
        Role::Client(_) => {
            let plan = match config.mode {
                Mode::Sweep => {
                    SweepPlan::new(peer.regions(), config.sweep.step(), config.sweep.read_len)?
                }
                Mode::Latency => SweepPlan::default(),
            };
            let session = SweepSession {
                scratch: regions[0],
                plan,
                endpoint,
            };

            let _interrupts = if config.catch_interrupts {
                Some(install_interrupt_handler(token)?)
            } else {
                None
            };
            let res = if config.progress {
                let mut progress = Progress::new(&mut *report, "iterations");
                let res = measure(config, transport, token, &session, &peer, &mut progress);
                progress.finish();
                res
            } else {
                measure(config, transport, token, &session, &peer, report)
            };
            let done = res?;
            info!("{} iterations completed", done);
            session.endpoint
        }
    };

    control::barrier_ping(stream)?;
    Ok(endpoint)
}

/// Runs one session over the channel returned by `open`, which is called once memory is
/// registered.
pub fn run_with<S, F>(
    config: &SessionConfig,
    transport: &mut Transport,
    token: &CancellationToken,
    open: F,
) -> Result<SweepReport>
where
    S: Read + Write,
    F: FnOnce() -> Result<S>,
{
    let mut report = SweepReport::new()?;
    let regions = register_all(transport, &wanted_regions(config)?)?;
    info!(
        "registered {} regions with the {} provider",
        regions.len(),
        transport.provider_name()
    );

    let res = open().and_then(|mut stream| {
        connected(config, transport, token, &mut stream, &regions, &mut report)
    });
    let clean = release(transport, regions);
    res?;
    if !clean {
        return Err(Error::transport("teardown", "not every region could be released"));
    }

    if let Some(path) = &config.output {
        save(&report, path)?;
    }
    Ok(report)
}

/// Runs one session, listening on or connecting to `config.port`.
pub fn run(
    config: &SessionConfig,
    transport: &mut Transport,
    token: &CancellationToken,
) -> Result<SweepReport> {
    run_with(config, transport, token, || match config.role {
        Role::Server => control::listen_and_accept(config.port),
        Role::Client(ip) => control::connect(ip, config.port),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::local::LocalProvider;
    use crate::exchange::tests::Duplex;

    #[test]
    fn client_registers_only_scratch() {
        let mut config = SessionConfig::new(Role::Client(Ipv4Addr::LOCALHOST));
        config.scratch_size = 64;

        assert_eq!(wanted_regions(&config).unwrap(), vec![(64, None)]);
    }

    #[test]
    fn server_registers_every_size() {
        let mut config = SessionConfig::new(Role::Server);
        config.server_regions = RegionSpec::Sizes(vec![4096, 8192]);

        assert_eq!(wanted_regions(&config).unwrap(), vec![(4096, None), (8192, None)]);
    }

    #[test]
    fn layout_regions_must_fit_their_bucket() {
        let mut config = SessionConfig::new(Role::Server);
        config.server_regions = RegionSpec::Layout {
            layout: BucketLayout::default(),
            size: 64 << 10,
        };

        assert!(matches!(wanted_regions(&config), Err(Error::Config(_))));
    }

    #[test]
    fn regions_are_released_when_the_channel_fails() {
        let provider = LocalProvider::new();
        let log = provider.log();
        let mut transport = Transport::new(provider);
        let config = SessionConfig::new(Role::Server);

        let token = CancellationToken::new();
        let res = run_with::<std::net::TcpStream, _>(&config, &mut transport, &token, || {
            Err(Error::channel("accept", std::io::ErrorKind::ConnectionAborted.into()))
        });

        assert!(matches!(res, Err(Error::ControlChannel { .. })));
        let log = log.lock().unwrap();
        assert_eq!(log.registered, 1);
        assert_eq!(log.deregistered, 1);
    }

    #[test]
    fn endpoint_goes_before_the_regions_when_the_peer_leaves() {
        let mut incoming = Vec::new();
        let peer = ConnectionInfo::new(9, 1, vec![]).encode().unwrap();
        control::send_framed(&mut incoming, &peer).unwrap();

        let provider = LocalProvider::new();
        let log = provider.log();
        let mut transport = Transport::new(provider);
        let config = SessionConfig::new(Role::Server);

        // the peer is gone by the first barrier
        let token = CancellationToken::new();
        let res = run_with(&config, &mut transport, &token, || Ok(Duplex::new(incoming)));

        assert!(matches!(res, Err(Error::ControlChannel { .. })));
        let log = log.lock().unwrap();
        assert_eq!(log.transitions.len(), 3);
        assert_eq!(log.destroyed.len(), 1);
        assert_eq!(log.deregistered, 1);
    }
}
