//! The aggregation server.
//!
//! Both transports -- HTTP and the native protocol -- are thin adapters over
//! the `Core` in this module. Core owns the store, the crypto material and
//! the admission rule, and every request walks the same path regardless of
//! transport: admit the caller, decrypt the body, validate and verify each
//! metric, touch storage, answer. The transports only translate wire formats
//! and error conventions.

use std::fmt;
use std::net::IpAddr;

use rsa::RsaPrivateKey;

use crate::backup::Backuper;
use crate::config::{Ipv4Net, ServerConfig};
use crate::crypto;
use crate::crypto::SignatureError;
use crate::metric::{supported, Metric};
use crate::store;
use crate::store::{Store, StoreError};

pub mod http;
pub mod rpc;

/// Failure classes shared by both transports. Each transport maps these to
/// its own status convention.
#[derive(PartialEq, Debug, Clone)]
pub enum ServeError {
    /// The request body or a field in it could not be decoded.
    BadPayload(String),
    /// The metric kind is not supported.
    Unsupported,
    /// The carried signature is not decodable.
    HashUndecodable,
    /// The carried signature does not match the recomputed one.
    HashMismatch,
    /// No metric under the requested id.
    NotFound,
    /// The caller is outside the trusted network.
    Forbidden(String),
    /// The storage backend failed.
    Internal(String),
}

impl fmt::Display for ServeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ServeError::BadPayload(ref what) => write!(f, "bad payload: {}", what),
            ServeError::Unsupported => f.write_str("unsupported metric type"),
            ServeError::HashUndecodable => f.write_str("failed to decode hash"),
            ServeError::HashMismatch => f.write_str("invalid hash"),
            ServeError::NotFound => f.write_str("unknown metric id"),
            ServeError::Forbidden(ref what) => f.write_str(what),
            ServeError::Internal(ref what) => write!(f, "internal error: {}", what),
        }
    }
}

impl From<StoreError> for ServeError {
    fn from(err: StoreError) -> ServeError {
        match err {
            StoreError::Unsupported => ServeError::Unsupported,
            StoreError::Malformed(what) => ServeError::BadPayload(what),
            StoreError::NotFound => ServeError::NotFound,
            StoreError::Internal(what) => ServeError::Internal(what),
        }
    }
}

impl From<SignatureError> for ServeError {
    fn from(err: SignatureError) -> ServeError {
        match err {
            SignatureError::Undecodable => ServeError::HashUndecodable,
            SignatureError::Mismatch => ServeError::HashMismatch,
        }
    }
}

/// The transport-agnostic heart of the server.
pub struct Core {
    store: Box<dyn Store>,
    key: Option<String>,
    crypto_key: Option<RsaPrivateKey>,
    trusted_subnet: Option<Ipv4Net>,
    backuper: Option<Backuper>,
    restore: bool,
    sync_dump: bool,
    periodic_dump: bool,
}

impl Core {
    /// Assemble the core from configuration: load the private key if one is
    /// configured and open the storage backend it selects.
    pub fn new(config: &ServerConfig) -> Result<Core, String> {
        let crypto_key = match config.crypto_key {
            Some(ref path) => Some(crypto::load_private_key(path)?),
            None => None,
        };

        let store = store::open(config.database.as_ref().map(|p| p.as_path()))
            .map_err(|e| format!("failed to open store: {}", e))?;

        // backups only make sense for the in-memory backend
        let memory_backed = config.database.is_none();
        let backuper = match config.store_file {
            Some(ref path) if memory_backed => Some(Backuper::new(path.clone())),
            _ => None,
        };
        let has_backups = backuper.is_some();

        Ok(Core {
            store,
            key: config.key.clone(),
            crypto_key,
            trusted_subnet: config.trusted_subnet,
            backuper,
            restore: memory_backed && config.restore,
            sync_dump: has_backups && config.store_interval == 0,
            periodic_dump: has_backups && config.store_interval > 0,
        })
    }

    /// Initialize storage and replay the backup if enabled. Storage failure
    /// here must be treated as fatal by the caller.
    pub fn bootstrap(&self) -> Result<(), String> {
        self.store
            .init()
            .map_err(|e| format!("failed to init store: {}", e))?;

        if self.restore {
            if let Some(ref backuper) = self.backuper {
                match backuper.read_metrics() {
                    Ok(metrics) => {
                        for metric in &metrics {
                            if let Err(e) = self.store.set(metric) {
                                warn!("failed to restore metric {}: {}", metric.id, e);
                            }
                        }
                        info!("successfully restored {} metrics", metrics.len());
                    }
                    Err(e) => warn!("{}", e),
                }
            }
        }
        Ok(())
    }

    /// Enforce the trusted-subnet rule. Runs before any decoding or storage
    /// work. Without a configured subnet everyone is admitted; with one, a
    /// caller with no resolvable address is rejected like an outsider.
    pub fn admit(&self, caller: Option<IpAddr>) -> Result<(), ServeError> {
        let net = match self.trusted_subnet {
            Some(net) => net,
            None => return Ok(()),
        };

        match caller {
            Some(IpAddr::V4(ip)) if net.contains(ip) => Ok(()),
            Some(ip) => Err(ServeError::Forbidden(format!(
                "request from {} is forbidden",
                ip
            ))),
            None => Err(ServeError::Forbidden(
                "request carries no resolvable caller address".to_string(),
            )),
        }
    }

    /// Undo the agent's payload encryption. Identity when no private key is
    /// configured.
    pub fn decrypt_body(&self, body: &[u8]) -> Result<Vec<u8>, ServeError> {
        match self.crypto_key {
            Some(ref key) => {
                crypto::decrypt(key, body).map_err(ServeError::BadPayload)
            }
            None => Ok(body.to_vec()),
        }
    }

    fn screen(&self, metric: &Metric) -> Result<(), ServeError> {
        if !supported(&metric.kind) {
            return Err(ServeError::Unsupported);
        }
        if let Some(ref key) = self.key {
            crypto::verify(key, metric)?;
        }
        Ok(())
    }

    /// Store one signed metric: kind check, signature check when keyed,
    /// write, synchronous dump when configured.
    pub fn save_one(&self, metric: &Metric) -> Result<(), ServeError> {
        self.screen(metric)?;
        self.store.set(metric)?;
        self.dump_if_synchronous();
        Ok(())
    }

    /// Store a batch. Every element is screened before any is written; a
    /// single bad element fails the whole batch.
    pub fn save_many(&self, metrics: &[Metric]) -> Result<(), ServeError> {
        for metric in metrics {
            self.screen(metric)?;
        }
        self.store.set_bulk(metrics)?;
        self.dump_if_synchronous();
        Ok(())
    }

    /// Store one metric without signature screening. The path-segment HTTP
    /// endpoint has nowhere to carry a signature, so it lands here.
    pub fn save_unsigned(&self, metric: &Metric) -> Result<(), ServeError> {
        if !supported(&metric.kind) {
            return Err(ServeError::Unsupported);
        }
        self.store.set(metric)?;
        self.dump_if_synchronous();
        Ok(())
    }

    /// Read a metric back, freshly signed when the server is keyed so the
    /// caller can verify what the server holds.
    pub fn load_one(&self, id: &str, kind: &str) -> Result<Metric, ServeError> {
        if !supported(kind) {
            return Err(ServeError::Unsupported);
        }
        let mut metric = self.store.get(id)?;
        if let Some(ref key) = self.key {
            metric.hash = crypto::sign(key, &metric);
        }
        Ok(metric)
    }

    /// Probe the storage backend.
    pub fn ping(&self) -> Result<(), ServeError> {
        self.store.check().map_err(ServeError::from)
    }

    /// Serialize the full store snapshot to the backup file, overwriting
    /// whatever was there.
    pub fn dump(&self) {
        let backuper = match self.backuper {
            Some(ref b) => b,
            None => return,
        };
        match self.store.get_all() {
            Ok(all) => {
                let metrics: Vec<Metric> = all.into_iter().map(|(_, m)| m).collect();
                match backuper.write_metrics(&metrics) {
                    Ok(()) => info!("successfully dumped {} metrics", metrics.len()),
                    Err(e) => warn!("{}", e),
                }
            }
            Err(e) => warn!("failed to snapshot store for dump: {}", e),
        }
    }

    fn dump_if_synchronous(&self) {
        if self.sync_dump {
            self.dump();
        }
    }

    /// True when the binary should run the periodic dump timer.
    pub fn periodic_dump_enabled(&self) -> bool {
        self.periodic_dump
    }

    /// Release storage resources.
    pub fn close(&self) {
        self.store.close();
    }
}
