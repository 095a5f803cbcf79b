#![allow(unknown_lints)]

extern crate chan_signal;
extern crate chrono;
extern crate fern;
extern crate stafford;

#[macro_use]
extern crate log;

use chrono::Utc;
use stafford::server::{http, rpc, Core};
use stafford::thread;
use stafford::thread::Stoppable;
use std::process;
use std::sync::Arc;
use std::time::Duration;

fn main() {
    let config = stafford::config::parse_server_args();

    let level = match config.verbose {
        0 => log::LevelFilter::Error,
        1 => log::LevelFilter::Warn,
        2 => log::LevelFilter::Info,
        3 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    let signal =
        chan_signal::notify(&[chan_signal::Signal::INT, chan_signal::Signal::TERM]);

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}][{}] {}",
                record.module_path().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                Utc::now().to_rfc3339(),
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stdout())
        .apply()
        .expect("could not set up logging");

    info!("stafford-server - {}", config.version);

    let core = match Core::new(&config) {
        Ok(core) => Arc::new(core),
        Err(e) => {
            error!("configuration error for server: {}", e);
            process::exit(1);
        }
    };

    // storage that cannot come up is not a server worth running
    if let Err(e) = core.bootstrap() {
        error!("{}", e);
        process::exit(1);
    }

    let http_srv = match http::Server::new(&config.address, Arc::clone(&core)) {
        Ok(srv) => srv,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };

    let mut run_msg = format!("listening on {}", config.address);
    if let Some(subnet) = config.trusted_subnet {
        run_msg.push_str(&format!(", trusted subnet: {}", subnet));
    }
    info!("{}", run_msg);

    let native_srv = match config.native_address {
        Some(ref address) => match rpc::Server::new(address, Arc::clone(&core)) {
            Ok(srv) => Some(srv),
            Err(e) => {
                error!("{}", e);
                process::exit(1);
            }
        },
        None => None,
    };

    let dump_timer = if core.periodic_dump_enabled() {
        let interval = Duration::from_secs(config.store_interval);
        let timer_core = Arc::clone(&core);
        info!("periodic metrics backup started");
        Some(thread::spawn(move |stop| {
            loop {
                if stop.wait_timeout(interval) {
                    break;
                }
                timer_core.dump();
            }
            debug!("metrics backup cancelled");
        }))
    } else {
        None
    };

    signal.recv().unwrap();
    info!("shutting down...");

    // listeners first to quiesce writes, then the dump timer, then storage
    http_srv.shutdown();
    if let Some(srv) = native_srv {
        srv.shutdown();
    }
    if let Some(timer) = dump_timer {
        timer.shutdown();
    }

    core.close();
    info!("connection to storage closed");
    info!("successfully shut down");
}
