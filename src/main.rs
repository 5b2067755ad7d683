use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use clap::{Arg, ArgAction, Command, crate_version};
use depot::{Server, ServerConfig};
use log::{LevelFilter, error, info};

static SIGNALLED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_sig: libc::c_int) {
    SIGNALLED.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, on_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as libc::sighandler_t);
    }
}

fn main() {
    let matches = Command::new("depot")
        .version(crate_version!())
        .arg(
            Arg::new("port")
                .long("port")
                .value_name("PORT")
                .default_value("8080")
                .value_parser(clap::value_parser!(u16))
                .help("TCP port to listen on"),
        )
        .arg(
            Arg::new("data-dir")
                .long("data-dir")
                .value_name("DIR")
                .default_value("/tmp/depot")
                .help("Set local directory used to store data"),
        )
        .arg(
            Arg::new("handler-threads")
                .long("handler-threads")
                .value_name("N")
                .default_value("10")
                .value_parser(clap::value_parser!(usize))
                .help("Size of the client-handler thread pool"),
        )
        .arg(
            Arg::new("worker-threads")
                .long("worker-threads")
                .value_name("N")
                .default_value("5")
                .value_parser(clap::value_parser!(usize))
                .help("Size of the file-worker thread pool"),
        )
        .arg(
            Arg::new("quota-mb")
                .long("quota-mb")
                .value_name("MB")
                .default_value("100")
                .value_parser(clap::value_parser!(u64))
                .help("Per-user storage quota in MiB"),
        )
        .arg(
            Arg::new("v")
                .short('v')
                .action(ArgAction::Count)
                .help("Sets the level of verbosity"),
        )
        .get_matches();

    let verbosity = matches.get_count("v");
    let log_level = match verbosity {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::builder()
        .format_timestamp_nanos()
        .filter_level(log_level)
        .init();

    let config = ServerConfig::new()
        .port(*matches.get_one::<u16>("port").unwrap())
        .data_dir(matches.get_one::<String>("data-dir").unwrap())
        .handler_threads(*matches.get_one::<usize>("handler-threads").unwrap())
        .worker_threads(*matches.get_one::<usize>("worker-threads").unwrap())
        .quota_bytes(*matches.get_one::<u64>("quota-mb").unwrap() * 1024 * 1024);

    let server = match Server::bind(config) {
        Ok(server) => server,
        Err(e) => {
            error!("failed to start server: {e}");
            process::exit(1);
        }
    };
    let shutdown = match server.shutdown_handle() {
        Ok(handle) => handle,
        Err(e) => {
            error!("failed to create shutdown handle: {e}");
            process::exit(1);
        }
    };

    install_signal_handlers();
    let watcher = thread::Builder::new()
        .name("depot-signal".to_string())
        .spawn(move || {
            while !SIGNALLED.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(100));
            }
            info!("signal received, shutting down");
            shutdown.shutdown();
        });
    if let Err(e) = watcher {
        error!("failed to start signal watcher: {e}");
        process::exit(1);
    }

    if let Err(e) = server.run() {
        error!("server failed: {e}");
        process::exit(1);
    }
}
