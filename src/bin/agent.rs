#![allow(unknown_lints)]

extern crate chan_signal;
extern crate chrono;
extern crate fern;
extern crate stafford;

#[macro_use]
extern crate log;

use chrono::Utc;
use stafford::agent::Agent;
use std::process;

fn main() {
    let config = stafford::config::parse_agent_args();

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

    info!("stafford-agent - {}", config.version);

    let mut agent = match Agent::new(config) {
        Ok(agent) => agent,
        Err(e) => {
            error!("configuration error for agent: {}", e);
            process::exit(1);
        }
    };
    agent.run();

    signal.recv().unwrap();
    agent.shutdown();
}
