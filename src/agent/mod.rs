//! The collection agent.
//!
//! Three workers run concurrently against two bits of shared state: a
//! process collector and a host collector refresh the shared gauge set on
//! every poll tick (the process collector also advances the poll counter),
//! and a reporter snapshots that state on every report tick and ships it
//! upstream. Delivery is lossy on purpose -- a failed report is skipped and
//! the next one carries the latest readings instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rsa::RsaPublicKey;
use sysinfo::{System, SystemExt};

use crate::config::AgentConfig;
use crate::crypto;
use crate::thread;
use crate::thread::Stoppable;

mod collect;
mod send;

pub use self::collect::{update_host_metrics, update_process_metrics};
pub use self::send::{prepare_metrics, Reporter};

/// The local metric set, shared between collectors and the reporter. All
/// collected readings are gauges; the poll counter rides separately.
pub type MetricSet = Arc<Mutex<HashMap<String, f64>>>;

/// Agent state: configuration, crypto material, the shared metric set and
/// the worker threads once running.
pub struct Agent {
    config: AgentConfig,
    crypto_key: Option<RsaPublicKey>,
    metrics: MetricSet,
    poll_counter: Arc<AtomicI64>,
    workers: Vec<thread::ThreadHandle>,
}

impl Agent {
    /// Create a new Agent. Loads the server's public key when payload
    /// encryption is configured.
    pub fn new(config: AgentConfig) -> Result<Agent, String> {
        let crypto_key = match config.crypto_key {
            Some(ref path) => Some(crypto::load_public_key(path)?),
            None => None,
        };

        Ok(Agent {
            config,
            crypto_key,
            metrics: Arc::new(Mutex::new(HashMap::new())),
            poll_counter: Arc::new(AtomicI64::new(0)),
            workers: Vec::new(),
        })
    }

    /// Spawn the collectors and the reporter. Returns once everything is
    /// running; call `shutdown` to stop and join them.
    pub fn run(&mut self) {
        let poll = Duration::from_secs(self.config.poll_interval);
        let report = Duration::from_secs(self.config.report_interval);

        let metrics = Arc::clone(&self.metrics);
        let counter = Arc::clone(&self.poll_counter);
        self.workers.push(thread::spawn(move |stop| {
            let mut sys = System::new();
            loop {
                if stop.wait_timeout(poll) {
                    break;
                }
                collect::update_process_metrics(&metrics, &mut sys);
                counter.fetch_add(1, Ordering::Relaxed);
                debug!("successfully collected process metrics");
            }
            debug!("process metric collection cancelled");
        }));

        let metrics = Arc::clone(&self.metrics);
        self.workers.push(thread::spawn(move |stop| {
            let mut sys = System::new();
            loop {
                if stop.wait_timeout(poll) {
                    break;
                }
                collect::update_host_metrics(&metrics, &mut sys);
                debug!("successfully collected host metrics");
            }
            debug!("host metric collection cancelled");
        }));

        let reporter = Reporter::new(
            &self.config,
            self.crypto_key.clone(),
            Arc::clone(&self.metrics),
            Arc::clone(&self.poll_counter),
        );
        self.workers.push(thread::spawn(move |stop| {
            loop {
                if stop.wait_timeout(report) {
                    break;
                }
                reporter.report();
            }
            debug!("metric reporting cancelled");
        }));

        info!(
            "agent started, polling every {}s, reporting to {} every {}s",
            self.config.poll_interval, self.config.address, self.config.report_interval
        );
    }

    /// Stop scheduling new cycles, let in-flight ones finish and join every
    /// worker.
    pub fn shutdown(self) {
        info!("shutting down...");
        for worker in self.workers {
            worker.shutdown();
        }
        info!("successfully shut down");
    }
}
