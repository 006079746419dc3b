use anyhow::{Context, Result};
use clap::Arg;
use log::*;
use pagecache::base_types::PAGE_SIZE;
use siaobject::init::StartSettings;
use siaobject::paths;
use std::path::PathBuf;
use std::process;
use std::time::Duration;

fn main() {
    let matches = clap::App::new("Sia NBD Agent")
        .about("Exports a network block device backed by the Sia storage network")
        .arg(
            Arg::with_name("verbosity")
                .short("v")
                .multiple(true)
                .help("Sets the level of logging verbosity"),
        )
        .arg(
            Arg::with_name("size")
                .long("size")
                .value_name("BYTES")
                .help("Size of the exported block device in bytes")
                .takes_value(true)
                .default_value("1099511627776"),
        )
        .arg(
            Arg::with_name("hard")
                .long("hard")
                .value_name("PAGES")
                .help("Hard limit on the number of cached pages")
                .takes_value(true)
                .default_value("192"),
        )
        .arg(
            Arg::with_name("soft")
                .long("soft")
                .value_name("PAGES")
                .help("Soft limit on the number of cached pages; must be below the hard limit")
                .takes_value(true)
                .default_value("176"),
        )
        .arg(
            Arg::with_name("idle")
                .long("idle")
                .value_name("SECONDS")
                .help("Idle time after which a dirty page is uploaded")
                .takes_value(true)
                .default_value("300"),
        )
        .arg(
            Arg::with_name("unix")
                .long("unix")
                .value_name("PATH")
                .help("Unix-domain socket to listen on (default: $XDG_RUNTIME_DIR/sia-nbdserver)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("sia-daemon")
                .long("sia-daemon")
                .value_name("HOST:PORT")
                .help("Address of the Sia daemon API")
                .takes_value(true)
                .default_value("localhost:9980"),
        )
        .arg(
            Arg::with_name("sia-password-file")
                .long("sia-password-file")
                .value_name("FILE")
                .help("File containing the Sia API password (default: ~/.sia/apipassword)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("fast-shutdown")
                .long("fast-shutdown")
                .help("On shutdown, keep dirty pages on disk instead of uploading them"),
        )
        .arg(
            Arg::with_name("output-file")
                .short("o")
                .long("output-file")
                .value_name("FILE")
                .help("File to log output to")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("config-file")
                .short("t")
                .long("config-file")
                .value_name("FILE")
                .help("Configuration file to set tunables (toml/json/yaml)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("log-config")
                .short("l")
                .long("log-config")
                .value_name("FILE")
                .help("Logging configuration yaml file")
                .conflicts_with("output-file")
                .conflicts_with("verbosity")
                .takes_value(true),
        )
        .get_matches();

    siaobject::init::setup_logging(
        matches.occurrences_of("verbosity"),
        matches.value_of("output-file"),
        matches.value_of("log-config"),
    );

    if let Some(file_name) = matches.value_of("config-file") {
        if let Err(e) = util::read_tunable_config(file_name) {
            error!("{:#}", e);
            process::exit(1);
        }
    }

    error!(
        "Starting Sia NBD Agent.  Local timezone is {}",
        chrono::Local::now().format("%Z (%:z)")
    );

    // error!() should be used when an invalid state is encountered; the
    // related operation will fail and the program may exit.  E.g. an
    // invalid request was received from the NBD client.
    error!("logging level ERROR enabled");

    // warn!() should be used when something unexpected has happened, but it
    // can be recovered from.
    warn!("logging level WARN enabled");

    // info!() should be used for very high level operations which are
    // expected to happen infrequently.  e.g. accepting a client, page
    // downloads/uploads, shutdown.
    info!("logging level INFO enabled");

    // debug!() can be used for all but the most frequent operations.
    debug!("logging level DEBUG enabled");

    // trace!() can be used indiscriminately.
    trace!("logging level TRACE enabled");

    let settings = match parse_settings(&matches) {
        Ok(settings) => settings,
        Err(e) => {
            error!("{:#}", e);
            process::exit(1);
        }
    };

    if let Err(e) = siaobject::init::start(settings) {
        error!("{:#}", e);
        process::exit(1);
    }
}

fn parse_settings(matches: &clap::ArgMatches) -> Result<StartSettings> {
    let size: u64 = matches
        .value_of("size")
        .unwrap()
        .parse()
        .context("invalid size")?;
    let hard_max_cached: usize = matches
        .value_of("hard")
        .unwrap()
        .parse()
        .context("invalid hard limit")?;
    let soft_max_cached: usize = matches
        .value_of("soft")
        .unwrap()
        .parse()
        .context("invalid soft limit")?;
    let idle_seconds: u64 = matches
        .value_of("idle")
        .unwrap()
        .parse()
        .context("invalid idle interval")?;

    if size % PAGE_SIZE != 0 {
        warn!(
            "size {} is not a multiple of the page size; the trailing partial page is stored full-sized",
            size
        );
    }

    let socket_path = match matches.value_of("unix") {
        Some(path) => PathBuf::from(path),
        None => paths::default_socket_path()?,
    };
    let sia_password_file = match matches.value_of("sia-password-file") {
        Some(path) => PathBuf::from(path),
        None => paths::default_password_file()?,
    };

    Ok(StartSettings {
        size,
        hard_max_cached,
        soft_max_cached,
        idle_interval: Duration::from_secs(idle_seconds),
        socket_path,
        sia_daemon_address: matches.value_of("sia-daemon").unwrap().to_string(),
        sia_password_file,
        fast_shutdown: matches.is_present("fast-shutdown"),
    })
}
