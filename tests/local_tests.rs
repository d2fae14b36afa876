use mttsweep::cancel::CancellationToken;
use mttsweep::connection::local::{LocalProvider, ProviderLog};
use mttsweep::connection::Transport;
use mttsweep::control;
use mttsweep::output::SweepReport;
use mttsweep::session::{run_with, Mode, RegionSpec, Role, SessionConfig};
use mttsweep::sweep::params::StepPolicy;
use mttsweep::Result;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("mttsweep=debug")
        .with_test_writer()
        .try_init();
}

struct Outcome {
    report: Result<SweepReport>,
    log: Arc<Mutex<ProviderLog>>,
}

/// Runs both sides over loopback, each with its own local provider.
fn run_pair(
    server: SessionConfig,
    mut client: SessionConfig,
    client_provider: LocalProvider,
) -> (Outcome, Outcome) {
    init_tracing();
    let listener = control::bind(0).unwrap();
    let port = listener.local_addr().unwrap().port();

    let server_provider = LocalProvider::new();
    let server_log = server_provider.log();
    let server_thread = thread::spawn(move || {
        let mut transport = Transport::new(server_provider);
        run_with(&server, &mut transport, &CancellationToken::new(), || {
            control::accept(&listener)
        })
    });

    client.port = port;
    let client_log = client_provider.log();
    let token = CancellationToken::new();
    let mut transport = Transport::new(client_provider);
    let client_report = run_with(&client, &mut transport, &token, || {
        control::connect(Ipv4Addr::LOCALHOST, port)
    });

    let server_report = server_thread.join().unwrap();
    (
        Outcome {
            report: server_report,
            log: server_log,
        },
        Outcome {
            report: client_report,
            log: client_log,
        },
    )
}

fn server(regions: Vec<usize>) -> SessionConfig {
    let mut config = SessionConfig::new(Role::Server);
    config.server_regions = RegionSpec::Sizes(regions);
    config
}

fn client(policy: StepPolicy, iterations: Option<u64>) -> SessionConfig {
    let mut config = SessionConfig::new(Role::Client(Ipv4Addr::LOCALHOST));
    config.sweep.policy = policy;
    config.sweep.iterations = iterations;
    config
}

fn assert_torn_down(log: &Arc<Mutex<ProviderLog>>) {
    let log = log.lock().unwrap();
    assert_eq!(log.registered, log.deregistered, "regions leaked");
    assert_eq!(log.destroyed.len(), 1, "endpoint not destroyed");
    assert_eq!(log.outstanding, 0, "completions leaked");
}

#[test]
fn two_regions_one_page_step() {
    let (s, c) = run_pair(
        server(vec![4096, 8192]),
        client(StepPolicy::FinePage, Some(1)),
        LocalProvider::new(),
    );

    let report = c.report.unwrap();
    assert!(s.report.is_ok());
    assert_eq!(report.samples().len(), 1);
    assert_eq!(report.samples()[0].reads, 3);

    {
        let log = c.log.lock().unwrap();
        assert_eq!(log.reads.len(), 3);
        assert_eq!(log.drains, vec![3]);
        assert_eq!(log.reads[1].remote_address + 4096, log.reads[2].remote_address);
    }
    assert!(s.log.lock().unwrap().reads.is_empty());
    assert_torn_down(&s.log);
    assert_torn_down(&c.log);
}

#[test]
fn empty_region_and_silent_client() {
    let mut quiet_client = client(StepPolicy::Coarse, Some(1));
    quiet_client.advertise_scratch = false;

    let (s, c) = run_pair(server(vec![0]), quiet_client, LocalProvider::new());

    let report = c.report.unwrap();
    assert!(s.report.is_ok());
    assert_eq!(report.samples().len(), 1);
    assert_eq!(report.samples()[0].reads, 0);
    assert!(c.log.lock().unwrap().reads.is_empty());
    assert_torn_down(&s.log);
    assert_torn_down(&c.log);
}

#[test]
fn interrupt_mid_iteration_drains_before_stopping() {
    let token = CancellationToken::new();
    // the provider flips the token while the second iteration is being posted
    let provider = LocalProvider::new().cancel_at(17, token.clone());

    init_tracing();
    let listener = control::bind(0).unwrap();
    let port = listener.local_addr().unwrap().port();
    let server_provider = LocalProvider::new();
    let server_log = server_provider.log();
    let srv = thread::spawn(move || {
        let mut transport = Transport::new(server_provider);
        run_with(&server(vec![15 * 4096]), &mut transport, &CancellationToken::new(), || {
            control::accept(&listener)
        })
    });

    let client_log = provider.log();
    let mut transport = Transport::new(provider);
    let report = run_with(&client(StepPolicy::FinePage, None), &mut transport, &token, || {
        control::connect(Ipv4Addr::LOCALHOST, port)
    })
    .unwrap();

    assert!(srv.join().unwrap().is_ok());
    assert_eq!(report.samples().len(), 2);
    {
        let log = client_log.lock().unwrap();
        assert_eq!(log.reads.len(), 30);
        assert_eq!(log.drains, vec![10, 5, 10, 5]);
    }
    assert_torn_down(&client_log);
    assert_torn_down(&server_log);
}

#[test]
fn latency_probe_over_loopback() {
    let mut probe = client(StepPolicy::Coarse, Some(3));
    probe.mode = Mode::Latency;
    probe.latency_interval = Duration::from_millis(1);

    let (s, c) = run_pair(server(vec![4096]), probe, LocalProvider::new());

    let report = c.report.unwrap();
    assert!(s.report.is_ok());
    assert_eq!(report.reads(), 3);
    assert_eq!(c.log.lock().unwrap().drains, vec![1, 1, 1]);
    assert_torn_down(&c.log);
}

#[test]
fn failed_read_still_releases_memory() {
    let (s, c) = run_pair(
        server(vec![8 * 4096]),
        client(StepPolicy::FinePage, Some(1)),
        LocalProvider::new().fail_read_at(2),
    );

    assert!(c.report.is_err());
    // the client never reaches the closing barrier
    assert!(s.report.is_err());

    assert_eq!(c.log.lock().unwrap().posted, 2);
    assert_torn_down(&c.log);
    assert_torn_down(&s.log);
}

#[test]
fn samples_are_dumped_as_json_lines() {
    let path = std::env::temp_dir().join(format!("mttsweep-{}.jsonl", std::process::id()));
    let mut dumping = client(StepPolicy::Coarse, Some(4));
    dumping.output = Some(path.clone());

    let (s, c) = run_pair(server(vec![1 << 20]), dumping, LocalProvider::new());
    assert!(s.report.is_ok());
    assert_eq!(c.report.unwrap().reads(), 4 * 32);

    let text = std::fs::read_to_string(&path).unwrap();
    std::fs::remove_file(&path).unwrap();
    let lines: Vec<serde_json::Value> =
        text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[3]["index"], 3);
    assert_eq!(lines[3]["reads"], 32);
}
