//! Network connectivity polling
//!
//! Publishes `internet_connection` once per interval until the installation
//! is running. The check is a plain TCP connect to the host of the configured
//! checker URL, no HTTP client and no shelling out.

use std::net::{TcpStream, ToSocketAddrs};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use url::{Host, Url};

use crate::config::{ConfigStore, Key, Value};

/// Default interval between two checks.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Extract `host:port` from an `http(s)://` URL.
pub fn checker_address(url: &str) -> Result<String> {
    let parsed = Url::parse(url).with_context(|| format!("Invalid checker URL: {}", url))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        anyhow::bail!("Unsupported checker URL (expected http or https): {}", url);
    }
    let host = match parsed.host() {
        Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
        Some(Host::Ipv4(addr)) => addr.to_string(),
        Some(Host::Ipv6(addr)) => format!("[{}]", addr),
        Some(Host::Domain(_)) | None => anyhow::bail!("Checker URL has no host: {}", url),
    };
    let port = parsed
        .port_or_known_default()
        .with_context(|| format!("Checker URL has no port: {}", url))?;
    Ok(format!("{}:{}", host, port))
}

/// Try to reach the checker host.
pub fn check_connection(url: &str) -> Result<()> {
    let address = checker_address(url)?;
    let addrs: Vec<_> = address
        .to_socket_addrs()
        .with_context(|| format!("Failed to resolve {}", address))?
        .collect();

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            Ok(_stream) => return Ok(()),
            Err(e) => last_error = Some(e),
        }
    }
    match last_error {
        Some(e) => Err(e).with_context(|| format!("Failed to connect to {}", address)),
        None => anyhow::bail!("{} resolved to no addresses", address),
    }
}

/// Run `check` every `interval` and publish the result, until
/// `installation_running` is set.
pub fn spawn_poll<F>(config: &ConfigStore, interval: Duration, check: F) -> JoinHandle<()>
where
    F: Fn() -> bool + Send + 'static,
{
    let config = config.clone();
    std::thread::spawn(move || {
        log::debug!("Connectivity poll started");
        while !config.get_bool(Key::InstallationRunning) {
            let connected = check();
            if config.set(Key::InternetConnection, Value::Bool(connected)) {
                log::info!("Internet connection {}", if connected { "available" } else { "lost" });
            }
            std::thread::sleep(interval);
        }
        log::debug!("Connectivity poll stopped, installation running");
    })
}

/// Poll the configured checker URL.
pub fn spawn_checker(config: &ConfigStore) -> JoinHandle<()> {
    let url = config.settings().internet_checker_url.clone();
    spawn_poll(config, POLL_INTERVAL, move || match check_connection(&url) {
        Ok(()) => true,
        Err(e) => {
            log::debug!("Connectivity check failed: {:#}", e);
            false
        }
    })
}
