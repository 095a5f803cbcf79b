//! The report cycle: snapshot, sign, encrypt, deliver.
//!
//! Delivery is fire-and-forget per cycle. A transport or server-side
//! rejection is logged and the cycle is skipped -- no retries, no queueing.
//! Whatever the next tick snapshots supersedes anything that was lost.

use std::collections::HashMap;
use std::io::Read;
use std::net::{TcpStream, UdpSocket};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hyper::client::Body;
use hyper::header::{ContentType, Headers};
use hyper::Client;
use rsa::RsaPublicKey;

use super::MetricSet;
use crate::config::{AgentConfig, Transport};
use crate::crypto;
use crate::metric::Metric;
use crate::protocols::wire;
use crate::protocols::wire::{Request, Response};

lazy_static! {
    /// Total reports delivered upstream
    pub static ref REPORT_SUCCESS_SUM: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
    /// Total reports dropped on delivery failure
    pub static ref REPORT_FAILURE_SUM: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
}

/// Convert the gauge snapshot plus the running poll counter into a wire
/// batch, signing each metric when a key is configured.
pub fn prepare_metrics(
    gauges: &HashMap<String, f64>,
    poll_count: i64,
    key: Option<&str>,
) -> Vec<Metric> {
    let mut metrics = Vec::with_capacity(gauges.len() + 1);

    for (name, value) in gauges {
        let mut metric = Metric::gauge(name.clone(), *value);
        if let Some(key) = key {
            metric.hash = crypto::sign(key, &metric);
        }
        metrics.push(metric);
    }

    let mut poll = Metric::counter("PollCount", poll_count);
    if let Some(key) = key {
        poll.hash = crypto::sign(key, &poll);
    }
    metrics.push(poll);

    metrics
}

// Learn the address the kernel would source upstream traffic from. The
// connect never sends a packet.
fn local_address() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip().to_string())
}

/// Ships one report per tick over the configured transport.
pub struct Reporter {
    upstream: String,
    transport: Transport,
    key: Option<String>,
    crypto_key: Option<RsaPublicKey>,
    metrics: MetricSet,
    poll_counter: Arc<AtomicI64>,
    client: Client,
}

impl Reporter {
    /// Create a new Reporter against the configured upstream.
    pub fn new(
        config: &AgentConfig,
        crypto_key: Option<RsaPublicKey>,
        metrics: MetricSet,
        poll_counter: Arc<AtomicI64>,
    ) -> Reporter {
        let mut client = Client::new();
        client.set_read_timeout(Some(Duration::from_secs(1)));
        client.set_write_timeout(Some(Duration::from_secs(1)));

        Reporter {
            upstream: config.address.clone(),
            transport: config.transport,
            key: config.key.clone(),
            crypto_key,
            metrics,
            poll_counter,
            client,
        }
    }

    /// Run one report cycle: snapshot the metric set and deliver it.
    pub fn report(&self) {
        let snapshot = { self.metrics.lock().unwrap().clone() };
        let poll_count = self.poll_counter.load(Ordering::Relaxed);
        let metrics = prepare_metrics(
            &snapshot,
            poll_count,
            self.key.as_ref().map(|k| k.as_str()),
        );
        let count = metrics.len();

        match self.deliver(metrics) {
            Ok(summary) => {
                REPORT_SUCCESS_SUM.fetch_add(1, Ordering::Relaxed);
                info!("delivered {} metrics: {}", count, summary);
            }
            Err(e) => {
                REPORT_FAILURE_SUM.fetch_add(1, Ordering::Relaxed);
                warn!("report skipped: {}", e);
            }
        }
    }

    fn deliver(&self, metrics: Vec<Metric>) -> Result<String, String> {
        match self.transport {
            Transport::Http => self.deliver_http(&metrics),
            Transport::Native => self.deliver_native(metrics),
        }
    }

    fn maybe_encrypt(&self, payload: Vec<u8>) -> Result<Vec<u8>, String> {
        match self.crypto_key {
            Some(ref key) => crypto::encrypt(key, &payload),
            None => Ok(payload),
        }
    }

    fn deliver_http(&self, metrics: &[Metric]) -> Result<String, String> {
        let payload = serde_json::to_vec(metrics)
            .map_err(|e| format!("failed to marshal metrics: {}", e))?;
        let payload = self.maybe_encrypt(payload)?;

        let endpoint = format!("http://{}/updates/", self.upstream);
        let mut headers = Headers::new();
        headers.set(ContentType::json());
        if let Some(ip) = local_address() {
            headers.set_raw("X-Real-IP", vec![ip.into_bytes()]);
        }

        let mut response = self
            .client
            .post(&endpoint[..])
            .headers(headers)
            .body(Body::BufBody(&payload[..], payload.len()))
            .send()
            .map_err(|e| format!("failed to make a request: {}", e))?;

        let mut body = String::new();
        response
            .read_to_string(&mut body)
            .map_err(|e| format!("failed to read response body: {}", e))?;

        if response.status.is_success() {
            Ok(format!("{} {}", response.status, body.trim()))
        } else {
            Err(format!("server answered {}: {}", response.status, body.trim()))
        }
    }

    fn deliver_native(&self, metrics: Vec<Metric>) -> Result<String, String> {
        let document = serde_json::to_vec(&Request::UpdateMany { metrics })
            .map_err(|e| format!("failed to marshal request: {}", e))?;
        let payload = self.maybe_encrypt(document)?;

        let mut stream = TcpStream::connect(&self.upstream[..])
            .map_err(|e| format!("failed to connect to {}: {}", self.upstream, e))?;
        stream
            .set_read_timeout(Some(Duration::from_secs(1)))
            .and_then(|_| stream.set_write_timeout(Some(Duration::from_secs(1))))
            .map_err(|e| format!("failed to configure stream: {}", e))?;

        wire::write_frame(&mut stream, &payload)
            .map_err(|e| format!("failed to send frame: {}", e))?;

        let answer = wire::read_frame(&mut stream)
            .map_err(|e| format!("failed to read response frame: {}", e))?;
        let response: Response = serde_json::from_slice(&answer)
            .map_err(|e| format!("failed to parse response: {}", e))?;

        match response {
            Response::Ok | Response::Metric { .. } => Ok("ok".to_string()),
            Response::Error { code, message } => {
                Err(format!("server answered {}: {}", code, message))
            }
        }
    }
}

// Tests
//
#[cfg(test)]
mod test {
    use super::*;
    use crate::crypto::verify;

    #[test]
    fn test_prepare_metrics_shapes_the_batch() {
        let mut gauges = HashMap::new();
        gauges.insert("TotalMemory".to_string(), 1024.0);
        gauges.insert("RandomValue".to_string(), 0.5);

        let metrics = prepare_metrics(&gauges, 7, None);
        assert_eq!(metrics.len(), 3);

        let poll = metrics
            .iter()
            .find(|m| m.id == "PollCount")
            .expect("poll counter missing");
        assert_eq!(poll.kind, "counter");
        assert_eq!(poll.delta, Some(7));
        assert_eq!(poll.hash, None);

        let memory = metrics.iter().find(|m| m.id == "TotalMemory").unwrap();
        assert_eq!(memory.kind, "gauge");
        assert_eq!(memory.value, Some(1024.0));
    }

    #[test]
    fn test_prepare_metrics_signs_when_keyed() {
        let mut gauges = HashMap::new();
        gauges.insert("cpu".to_string(), 0.25);

        let metrics = prepare_metrics(&gauges, 3, Some("testkey"));
        for metric in &metrics {
            assert!(metric.hash.is_some(), "{} went out unsigned", metric.id);
            assert_eq!(verify("testkey", metric), Ok(()));
        }
    }

    #[test]
    fn test_empty_snapshot_still_reports_poll_count() {
        let metrics = prepare_metrics(&HashMap::new(), 0, None);
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].id, "PollCount");
        assert_eq!(metrics[0].delta, Some(0));
    }
}
