//! Provides the CLI option parser for both stafford binaries.
//!
//! Used to parse the argv/config file into structs the agent and server can
//! consume as configuration data. Defaults are overlaid by an optional TOML
//! config file, which in turn is overlaid by environment variables.

use clap::{App, Arg};
use std::env;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process;
use std::str::FromStr;

const VERSION: Option<&'static str> = option_env!("CARGO_PKG_VERSION");

fn default_version() -> String {
    VERSION.unwrap_or("unknown").to_string()
}

/// An IPv4 network in CIDR notation, used for trusted-subnet admission.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub struct Ipv4Net {
    addr: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Net {
    /// Parse `a.b.c.d/len` notation.
    pub fn from_cidr(s: &str) -> Result<Ipv4Net, String> {
        let mut parts = s.splitn(2, '/');
        let addr = parts.next().unwrap_or("");
        let prefix = parts
            .next()
            .ok_or_else(|| format!("{} is not in CIDR notation", s))?;

        let addr = Ipv4Addr::from_str(addr)
            .map_err(|_| format!("bad network address in {}", s))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| format!("bad prefix length in {}", s))?;
        if prefix > 32 {
            return Err(format!("prefix length {} is out of range", prefix));
        }
        Ok(Ipv4Net { addr, prefix })
    }

    fn mask(self) -> u32 {
        match self.prefix {
            0 => 0,
            p => u32::max_value() << (32 - u32::from(p)),
        }
    }

    /// True if `ip` falls inside this network.
    pub fn contains(self, ip: Ipv4Addr) -> bool {
        let mask = self.mask();
        (u32::from(ip) & mask) == (u32::from(self.addr) & mask)
    }
}

impl fmt::Display for Ipv4Net {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// Which protocol the agent ships its reports over.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// JSON over HTTP, `POST /updates/`.
    Http,
    /// Stafford's native length-prefixed TCP protocol.
    Native,
}

/// Configuration for the stafford-agent executable.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Upstream server to report to, `host:port`.
    pub address: String,
    /// Report transport. See `Transport`.
    pub transport: Transport,
    /// Seconds between collection cycles.
    pub poll_interval: u64,
    /// Seconds between report cycles.
    pub report_interval: u64,
    /// Shared signing secret. Reports are unsigned without it.
    pub key: Option<String>,
    /// Path to the server's RSA public key PEM. Reports are sent in the
    /// clear without it.
    pub crypto_key: Option<PathBuf>,
    /// The verbosity setting. The higher the value the chattier the agent.
    pub verbose: u64,
    /// Agent version string. This is set automatically.
    pub version: String,
}

impl Default for AgentConfig {
    fn default() -> AgentConfig {
        AgentConfig {
            address: "localhost:8080".to_string(),
            transport: Transport::Http,
            poll_interval: 2,
            report_interval: 10,
            key: None,
            crypto_key: None,
            verbose: 0,
            version: default_version(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AgentConfigFile {
    address: Option<String>,
    transport: Option<Transport>,
    poll_interval: Option<u64>,
    report_interval: Option<u64>,
    key: Option<String>,
    crypto_key: Option<PathBuf>,
}

/// Configuration for the stafford-server executable.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket for the HTTP listener, `host:port`.
    pub address: String,
    /// Socket for the native protocol listener. The listener only runs when
    /// this is set.
    pub native_address: Option<String>,
    /// Whether to replay the backup file through the store at startup.
    pub restore: bool,
    /// Seconds between backup dumps. Zero means dump synchronously after
    /// every write instead.
    pub store_interval: u64,
    /// Where backups live. No file, no backups.
    pub store_file: Option<PathBuf>,
    /// Shared signing secret. Incoming metrics are verified when set.
    pub key: Option<String>,
    /// Path to the server's RSA private key PEM. Request bodies are
    /// decrypted when set.
    pub crypto_key: Option<PathBuf>,
    /// Path of the relational database. Selects the relational backend;
    /// absent means the in-memory store.
    pub database: Option<PathBuf>,
    /// Only accept writes from callers inside this network.
    pub trusted_subnet: Option<Ipv4Net>,
    /// The verbosity setting. The higher the value the chattier the server.
    pub verbose: u64,
    /// Server version string. This is set automatically.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            address: "localhost:8080".to_string(),
            native_address: None,
            restore: true,
            store_interval: 300,
            store_file: Some(PathBuf::from("/tmp/stafford-metrics.json")),
            key: None,
            crypto_key: None,
            database: None,
            trusted_subnet: None,
            verbose: 0,
            version: default_version(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ServerConfigFile {
    address: Option<String>,
    native_address: Option<String>,
    restore: Option<bool>,
    store_interval: Option<u64>,
    store_file: Option<PathBuf>,
    key: Option<String>,
    crypto_key: Option<PathBuf>,
    database: Option<PathBuf>,
    trusted_subnet: Option<String>,
}

fn read_config_file(path: &str) -> String {
    let mut buffer = String::new();
    let mut file = File::open(path).unwrap_or_else(|e| {
        eprintln!("unable to open config file {}: {}", path, e);
        process::exit(1);
    });
    file.read_to_string(&mut buffer).unwrap_or_else(|e| {
        eprintln!("unable to read config file {}: {}", path, e);
        process::exit(1);
    });
    buffer
}

fn parse_cidr_or_exit(s: &str) -> Ipv4Net {
    Ipv4Net::from_cidr(s).unwrap_or_else(|e| {
        eprintln!("invalid trusted_subnet: {}", e);
        process::exit(1);
    })
}

fn merge_agent(config: &mut AgentConfig, file: AgentConfigFile) {
    if let Some(address) = file.address {
        config.address = address;
    }
    if let Some(transport) = file.transport {
        config.transport = transport;
    }
    if let Some(poll_interval) = file.poll_interval {
        config.poll_interval = poll_interval;
    }
    if let Some(report_interval) = file.report_interval {
        config.report_interval = report_interval;
    }
    if let Some(key) = file.key {
        config.key = Some(key);
    }
    if let Some(crypto_key) = file.crypto_key {
        config.crypto_key = Some(crypto_key);
    }
}

fn merge_server(config: &mut ServerConfig, file: ServerConfigFile) {
    if let Some(address) = file.address {
        config.address = address;
    }
    if let Some(native_address) = file.native_address {
        config.native_address = Some(native_address);
    }
    if let Some(restore) = file.restore {
        config.restore = restore;
    }
    if let Some(store_interval) = file.store_interval {
        config.store_interval = store_interval;
    }
    if let Some(store_file) = file.store_file {
        config.store_file = Some(store_file);
    }
    if let Some(key) = file.key {
        config.key = Some(key);
    }
    if let Some(crypto_key) = file.crypto_key {
        config.crypto_key = Some(crypto_key);
    }
    if let Some(database) = file.database {
        config.database = Some(database);
    }
    if let Some(ref subnet) = file.trusted_subnet {
        config.trusted_subnet = Some(parse_cidr_or_exit(subnet));
    }
}

fn env_override_string(name: &str, slot: &mut String) {
    if let Ok(value) = env::var(name) {
        *slot = value;
    }
}

fn env_override_opt(name: &str, slot: &mut Option<String>) {
    if let Ok(value) = env::var(name) {
        *slot = Some(value);
    }
}

fn env_override_u64(name: &str, slot: &mut u64) {
    if let Ok(value) = env::var(name) {
        match value.parse() {
            Ok(parsed) => *slot = parsed,
            Err(_) => {
                eprintln!("{} must be an integer, got {}", name, value);
                process::exit(1);
            }
        }
    }
}

fn base_matches(name: &'static str, about: &'static str) -> clap::ArgMatches<'static> {
    App::new(name)
        .version(VERSION.unwrap_or("unknown"))
        .about(about)
        .arg(
            Arg::with_name("config-file")
                .long("config")
                .short("C")
                .value_name("config")
                .help("The config file to feed in.")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .multiple(true)
                .help("Turn on verbose output."),
        )
        .get_matches()
}

/// Parse the stafford-agent configuration arguments.
pub fn parse_agent_args() -> AgentConfig {
    let args = base_matches("stafford-agent", "host telemetry collection and shipping");

    let mut config = AgentConfig::default();

    if let Some(path) = args.value_of("config-file") {
        let buffer = read_config_file(path);
        match toml::from_str::<AgentConfigFile>(&buffer) {
            Ok(file) => merge_agent(&mut config, file),
            Err(e) => {
                eprintln!("unable to parse config file {}: {}", path, e);
                process::exit(1);
            }
        }
    }

    env_override_string("ADDRESS", &mut config.address);
    env_override_u64("POLL_INTERVAL", &mut config.poll_interval);
    env_override_u64("REPORT_INTERVAL", &mut config.report_interval);
    env_override_opt("KEY", &mut config.key);
    if let Ok(path) = env::var("CRYPTO_KEY") {
        config.crypto_key = Some(PathBuf::from(path));
    }

    config.verbose = if args.is_present("verbose") {
        args.occurrences_of("verbose")
    } else {
        0
    };
    config
}

/// Parse the stafford-server configuration arguments.
pub fn parse_server_args() -> ServerConfig {
    let args = base_matches("stafford-server", "telemetry aggregation and storage");

    let mut config = ServerConfig::default();

    if let Some(path) = args.value_of("config-file") {
        let buffer = read_config_file(path);
        match toml::from_str::<ServerConfigFile>(&buffer) {
            Ok(file) => merge_server(&mut config, file),
            Err(e) => {
                eprintln!("unable to parse config file {}: {}", path, e);
                process::exit(1);
            }
        }
    }

    env_override_string("ADDRESS", &mut config.address);
    env_override_opt("NATIVE_ADDRESS", &mut config.native_address);
    env_override_u64("STORE_INTERVAL", &mut config.store_interval);
    env_override_opt("KEY", &mut config.key);
    if let Ok(value) = env::var("RESTORE") {
        config.restore = value == "true" || value == "1";
    }
    if let Ok(path) = env::var("STORE_FILE") {
        config.store_file = Some(PathBuf::from(path));
    }
    if let Ok(path) = env::var("CRYPTO_KEY") {
        config.crypto_key = Some(PathBuf::from(path));
    }
    if let Ok(path) = env::var("DATABASE") {
        config.database = Some(PathBuf::from(path));
    }
    if let Ok(subnet) = env::var("TRUSTED_SUBNET") {
        config.trusted_subnet = Some(parse_cidr_or_exit(&subnet));
    }

    config.verbose = if args.is_present("verbose") {
        args.occurrences_of("verbose")
    } else {
        0
    };
    config
}

// Tests
//
#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_cidr_parsing() {
        let net = Ipv4Net::from_cidr("10.1.2.0/24").unwrap();
        assert_eq!(net.to_string(), "10.1.2.0/24");

        assert!(Ipv4Net::from_cidr("10.1.2.0").is_err());
        assert!(Ipv4Net::from_cidr("10.1.2/24").is_err());
        assert!(Ipv4Net::from_cidr("10.1.2.0/33").is_err());
        assert!(Ipv4Net::from_cidr("not-an-ip/8").is_err());
    }

    #[test]
    fn test_cidr_contains() {
        let net = Ipv4Net::from_cidr("192.168.0.0/16").unwrap();
        assert!(net.contains(Ipv4Addr::new(192, 168, 7, 9)));
        assert!(!net.contains(Ipv4Addr::new(192, 169, 0, 1)));

        let host = Ipv4Net::from_cidr("10.0.0.5/32").unwrap();
        assert!(host.contains(Ipv4Addr::new(10, 0, 0, 5)));
        assert!(!host.contains(Ipv4Addr::new(10, 0, 0, 6)));

        let everything = Ipv4Net::from_cidr("0.0.0.0/0").unwrap();
        assert!(everything.contains(Ipv4Addr::new(203, 0, 113, 7)));
    }

    #[test]
    fn test_server_file_merge() {
        let mut config = ServerConfig::default();
        let file: ServerConfigFile = toml::from_str(
            r#"
            address = "0.0.0.0:9090"
            native_address = "0.0.0.0:9091"
            restore = false
            store_interval = 0
            key = "sekrit"
            trusted_subnet = "10.0.0.0/8"
            "#,
        ).unwrap();
        merge_server(&mut config, file);

        assert_eq!(config.address, "0.0.0.0:9090");
        assert_eq!(config.native_address, Some("0.0.0.0:9091".to_string()));
        assert!(!config.restore);
        assert_eq!(config.store_interval, 0);
        assert_eq!(config.key, Some("sekrit".to_string()));
        assert_eq!(
            config.trusted_subnet,
            Some(Ipv4Net::from_cidr("10.0.0.0/8").unwrap())
        );
        // untouched fields keep their defaults
        assert_eq!(
            config.store_file,
            Some(PathBuf::from("/tmp/stafford-metrics.json"))
        );
    }

    #[test]
    fn test_agent_file_merge() {
        let mut config = AgentConfig::default();
        let file: AgentConfigFile = toml::from_str(
            r#"
            address = "collector:8080"
            transport = "native"
            poll_interval = 1
            report_interval = 5
            "#,
        ).unwrap();
        merge_agent(&mut config, file);

        assert_eq!(config.address, "collector:8080");
        assert_eq!(config.transport, Transport::Native);
        assert_eq!(config.poll_interval, 1);
        assert_eq!(config.report_interval, 5);
        assert_eq!(config.key, None);
    }
}
