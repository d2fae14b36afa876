use clap::{crate_authors, crate_version, App, AppSettings, Arg, ArgMatches};
use console::style;
use mttsweep::cancel::CancellationToken;
use mttsweep::connection::local::LocalProvider;
use mttsweep::connection::Transport;
use mttsweep::control::DEFAULT_PORT;
use mttsweep::session::{self, Mode, RegionSpec, Role, SessionConfig};
use mttsweep::sweep::layout::BucketLayout;
use mttsweep::sweep::params::POLICIES;
use mttsweep::{Error, Result};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::exit;
use std::str::FromStr;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

static MODES: &[&str] = &["sweep", "latency"];
static PROVIDERS: &[&str] = &["rdma", "local"];

#[cfg(feature = "rdma")]
const DEFAULT_PROVIDER: &str = "rdma";
#[cfg(not(feature = "rdma"))]
const DEFAULT_PROVIDER: &str = "local";

fn main() {
    let mut app = app_cli_config();
    let matches = app.clone().get_matches();

    if matches.is_present("help") {
        let _ = app.print_help();
        println!();
        exit(1);
    }

    init_logging(matches.occurrences_of("verbose"), matches.is_present("quiet"));

    if let Err(e) = run(&matches) {
        error!("{}", e);
        eprintln!("{}", style(e).red());
        exit(1);
    }
}

fn app_cli_config() -> App<'static, 'static> {
    App::new("mttsweep")
        .version(crate_version!())
        .author(crate_authors!())
        .about("Evicts entries of the RDMA NIC address translation cache with remote reads")
        .setting(AppSettings::DisableHelpFlags)
        .setting(AppSettings::DisableVersion)
        .arg_from_usage("[help] -h 'Prints usage and exits'")
        .arg(
            Arg::with_name("address")
                .help("Server to connect to; runs as the server when absent")
                .long("addr")
                .short("a")
                .takes_value(true)
                .value_name("IPV4_ADDR")
                .validator(|x| match Ipv4Addr::from_str(x.as_str()) {
                    Ok(_) => Ok(()),
                    Err(_) => Err(String::from("Faulty IPv4 address")),
                }),
        )
        .arg(
            Arg::with_name("port")
                .help("Port of the control channel")
                .long("port")
                .short("p")
                .takes_value(true)
                .value_name("PORT")
                .validator(|x| match x.parse::<u16>() {
                    Ok(_) => Ok(()),
                    Err(_) => Err(String::from("Faulty port")),
                }),
        )
        .arg(
            Arg::with_name("mode")
                .help("What the client measures")
                .long("mode")
                .short("m")
                .default_value("sweep")
                .possible_values(MODES),
        )
        .arg(
            Arg::with_name("step")
                .help("Distance between two reads of a sweep")
                .long("step")
                .short("s")
                .default_value("coarse")
                .possible_values(&POLICIES),
        )
        .arg(
            number_arg(
                "iterations",
                "Number of sweeps or samples; runs until interrupted when absent",
            )
            .short("n"),
        )
        .arg(
            number_arg("batch", "Reads posted before waiting for their completions")
                .short("b")
                .default_value("10"),
        )
        .arg(number_arg("regions", "Number of regions the server registers").default_value("1"))
        .arg(number_arg("region-size", "Size of every server region in bytes"))
        .arg(number_arg("scratch", "Size of the client scratch buffer in bytes"))
        .arg(number_arg("interval-ms", "Pause between two latency samples").default_value("1000"))
        .arg_from_usage(
            "[layout] --layout 'Places one server region on every translation cache bucket'",
        )
        .arg_from_usage(
            "[no-advertise] --no-advertise 'The client does not advertise its scratch buffer'",
        )
        .arg(
            Arg::with_name("provider")
                .help("Transport provider")
                .long("provider")
                .default_value(DEFAULT_PROVIDER)
                .possible_values(PROVIDERS),
        )
        .arg_from_usage("[verbose] -v... 'More logging, repeat for even more'")
        .arg_from_usage("[quiet] -q --quiet 'Only warnings and the final summary'")
        .arg_from_usage("[output] 'Output file to dump every sample to'")
}

fn number_arg(name: &'static str, help: &'static str) -> Arg<'static, 'static> {
    Arg::with_name(name)
        .help(help)
        .long(name)
        .takes_value(true)
        .value_name("N")
        .validator(|x| match x.parse::<u64>() {
            Ok(_) => Ok(()),
            Err(_) => Err(String::from("should be a number")),
        })
}

fn init_logging(verbosity: u64, quiet: bool) {
    let level = match (quiet, verbosity) {
        (true, _) => "warn",
        (false, 0) => "info",
        (false, 1) => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn number<T: FromStr>(args: &ArgMatches, name: &str) -> Result<Option<T>> {
    match args.value_of(name) {
        None => Ok(None),
        Some(v) => v
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{} should be a number, got {:?}", name, v))),
    }
}

fn session_config(args: &ArgMatches) -> Result<SessionConfig> {
    let role = match args.value_of("address") {
        Some(a) => Role::Client(
            a.parse()
                .map_err(|_| Error::Config(format!("faulty IPv4 address {:?}", a)))?,
        ),
        None => Role::Server,
    };
    let mut config = SessionConfig::new(role);

    config.port = number(args, "port")?.unwrap_or(DEFAULT_PORT);
    config.mode = match args.value_of("mode") {
        Some("latency") => Mode::Latency,
        _ => Mode::Sweep,
    };
    config.sweep.policy = args.value_of("step").unwrap_or("coarse").parse()?;
    config.sweep.iterations = number(args, "iterations")?;
    config.sweep.batch_size = number(args, "batch")?.unwrap_or(config.sweep.batch_size);

    config.server_regions = if args.is_present("layout") {
        RegionSpec::Layout {
            layout: BucketLayout::default(),
            size: number(args, "region-size")?.unwrap_or(session::DEFAULT_LAYOUT_REGION_SIZE),
        }
    } else {
        RegionSpec::uniform(
            number(args, "regions")?.unwrap_or(1),
            number(args, "region-size")?.unwrap_or(session::DEFAULT_REGION_SIZE),
        )
    };
    config.scratch_size = number(args, "scratch")?.unwrap_or(config.scratch_size);
    config.advertise_scratch = !args.is_present("no-advertise");
    config.latency_interval = Duration::from_millis(number(args, "interval-ms")?.unwrap_or(1000));
    config.output = args.value_of("output").map(PathBuf::from);
    config.progress = !args.is_present("quiet");
    config.catch_interrupts = true;

    Ok(config)
}

fn transport(name: &str) -> Result<Transport> {
    match name {
        "local" => Ok(Transport::new(LocalProvider::new())),
        #[cfg(feature = "rdma")]
        "rdma" => {
            use mttsweep::connection::rdma::{IbvProvider, DEFAULT_MAX_OUTSTANDING};
            Ok(Transport::new(IbvProvider::open(DEFAULT_MAX_OUTSTANDING)?))
        }
        other => Err(Error::Config(format!(
            "provider {:?} is not available in this build",
            other
        ))),
    }
}

fn run(args: &ArgMatches) -> Result<()> {
    let config = session_config(args)?;
    let mut transport = transport(args.value_of("provider").unwrap_or(DEFAULT_PROVIDER))?;

    let token = CancellationToken::new();

    info!("starting {:?} with the {} provider", config.role, transport.provider_name());
    let report = session::run(&config, &mut transport, &token)?;

    if let Role::Client(_) = config.role {
        report.print();
    } else {
        println!("{}", style("SESSION COMPLETED").green());
    }
    Ok(())
}
