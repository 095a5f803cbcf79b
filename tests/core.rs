//! End-to-end exercise of the pipeline core: an agent-side batch is
//! prepared, signed and encrypted, then walked through the server core the
//! way a transport adapter would -- admission, decryption, verification,
//! storage and read-back.

extern crate rand;
extern crate rsa;
extern crate serde_json;
extern crate stafford;
extern crate tempdir;

use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::collections::HashMap;
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use tempdir::TempDir;

use stafford::agent::prepare_metrics;
use stafford::config::{Ipv4Net, ServerConfig};
use stafford::crypto;
use stafford::metric::Metric;
use stafford::server::{Core, ServeError};

fn write_key_pair(dir: &TempDir) -> (PathBuf, PathBuf) {
    let mut rng = rand::thread_rng();
    let private = RsaPrivateKey::new(&mut rng, 1024).unwrap();
    let public = RsaPublicKey::from(&private);

    let private_path = dir.path().join("server.pem");
    let public_path = dir.path().join("server.pub.pem");
    fs::write(
        &private_path,
        private.to_pkcs1_pem(LineEnding::LF).unwrap().as_bytes(),
    ).unwrap();
    fs::write(
        &public_path,
        public.to_public_key_pem(LineEnding::LF).unwrap(),
    ).unwrap();

    (private_path, public_path)
}

fn trusted(ip: [u8; 4]) -> Option<IpAddr> {
    Some(IpAddr::V4(Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3])))
}

#[test]
fn signed_encrypted_batch_flows_end_to_end() {
    let dir = TempDir::new("stafford-core").unwrap();
    let (private_path, public_path) = write_key_pair(&dir);

    let mut config = ServerConfig::default();
    config.store_file = None;
    config.restore = false;
    config.key = Some("testkey".to_string());
    config.crypto_key = Some(private_path);
    config.trusted_subnet = Some(Ipv4Net::from_cidr("10.0.0.0/8").unwrap());

    let core = Core::new(&config).unwrap();
    core.bootstrap().unwrap();

    // what the agent does each report tick
    let public = crypto::load_public_key(&public_path).unwrap();
    let mut gauges = HashMap::new();
    gauges.insert("TotalMemory".to_string(), 4096.0);
    gauges.insert("FreeMemory".to_string(), 1024.0);

    let send_once = |poll_count: i64| -> Vec<u8> {
        let batch = prepare_metrics(&gauges, poll_count, Some("testkey"));
        let document = serde_json::to_vec(&batch).unwrap();
        crypto::encrypt(&public, &document).unwrap()
    };

    // what the server does with the wire bytes
    let receive = |core: &Core, body: &[u8]| {
        core.admit(trusted([10, 3, 2, 1])).unwrap();
        let plain = core.decrypt_body(body).unwrap();
        let metrics: Vec<Metric> = serde_json::from_slice(&plain).unwrap();
        core.save_many(&metrics).unwrap();
    };

    receive(&core, &send_once(5));
    receive(&core, &send_once(3));

    // counters accumulated across reports, gauges kept the last reading
    let poll = core.load_one("PollCount", "counter").unwrap();
    assert_eq!(poll.delta, Some(8));

    let memory = core.load_one("TotalMemory", "gauge").unwrap();
    assert_eq!(memory.value, Some(4096.0));

    // the read-back is signed by the server and verifies against the key
    assert!(poll.hash.is_some());
    assert_eq!(crypto::verify("testkey", &poll), Ok(()));
}

#[test]
fn untrusted_caller_is_rejected_before_any_work() {
    let mut config = ServerConfig::default();
    config.store_file = None;
    config.restore = false;
    config.key = Some("testkey".to_string());
    config.trusted_subnet = Some(Ipv4Net::from_cidr("10.0.0.0/8").unwrap());

    let core = Core::new(&config).unwrap();
    core.bootstrap().unwrap();

    // well-formed and correctly signed, but from outside the subnet
    let mut metric = Metric::counter("hits", 1);
    metric.hash = crypto::sign("testkey", &metric);

    match core.admit(trusted([203, 0, 113, 9])) {
        Err(ServeError::Forbidden(_)) => {}
        other => panic!("expected forbidden, got {:?}", other),
    }
    // nothing was stored
    assert_eq!(
        core.load_one("hits", "counter"),
        Err(ServeError::NotFound)
    );
}

#[test]
fn tampered_batch_is_rejected_wholesale() {
    let mut config = ServerConfig::default();
    config.store_file = None;
    config.restore = false;
    config.key = Some("testkey".to_string());

    let core = Core::new(&config).unwrap();
    core.bootstrap().unwrap();

    let mut good = Metric::counter("hits", 10);
    good.hash = crypto::sign("testkey", &good);

    let mut evil = Metric::counter("hits", 1_000_000);
    evil.hash = crypto::sign("wrongkey", &evil);

    assert_eq!(
        core.save_many(&[good, evil]),
        Err(ServeError::HashMismatch)
    );
    assert_eq!(
        core.load_one("hits", "counter"),
        Err(ServeError::NotFound)
    );
}
