//! Configuration validation.
use std::collections::BTreeSet;
use std::fs;
use std::net::UdpSocket;
use std::path::Path;

use eyre::{bail, ensure, WrapErr};
use tracing::{debug, warn};

use meshbus_bus::client::BusConfig;
use meshbus_bus::common::addr::{CanonicalAddr, NetworkClass, DEFAULT_PORT};

use super::DaemonConfig;

/// Default port of the UDP signal socket.
const SIGNAL_PORT: u16 = 4041;

/// Validate a configuration file and assemble the runnable configuration.
pub fn check(config: &DaemonConfig) -> eyre::Result<BusConfig> {
    ensure!(!config.server_name.is_empty(), "server_name must be set");
    ensure!(
        config.max_connections >= 10,
        "max_connections must be at least 10 ({} given)",
        config.max_connections
    );
    ensure!(
        (5..=1000).contains(&config.max_pending_connections),
        "max_pending_connections must be between 5 and 1000 ({} given)",
        config.max_pending_connections
    );

    let my_address = CanonicalAddr::parse(&config.my_address, DEFAULT_PORT)
        .wrap_err("my_address is not a usable address")?;
    // The address must exist on a local interface; a config file copied
    // from another machine is a classic way to get this wrong.
    UdpSocket::bind((my_address.ip(), 0)).wrap_err_with(|| {
        format!(
            "my_address \"{}\" not found on this computer. Did a copy of the configuration file and forgot to change that entry?",
            my_address
        )
    })?;

    let local_listen = CanonicalAddr::parse(&config.local_listen, DEFAULT_PORT)
        .wrap_err("local_listen is not a usable address")?;
    ensure!(
        local_listen.class() == NetworkClass::Loopback,
        "local_listen must be a loopback address ({} given)",
        local_listen
    );

    let listen = CanonicalAddr::parse(&config.listen, DEFAULT_PORT)
        .wrap_err("listen is not a usable address")?;
    let public_listen = if listen.class() == NetworkClass::Loopback {
        warn!(
            "listen is \"{}\", so it is ignored and no peer connections will be possible",
            listen
        );
        None
    } else {
        Some(listen.to_socket_addr())
    };

    let signal = CanonicalAddr::parse(&config.signal, SIGNAL_PORT)
        .wrap_err("signal is not a usable address")?;

    match (&config.ssl_certificate, &config.ssl_private_key) {
        (Some(_), None) | (None, Some(_)) => {
            bail!("ssl_certificate and ssl_private_key must be configured together")
        }
        (Some(certificate), Some(_)) => {
            // TODO: terminate TLS on the public listener with this material.
            warn!(
                "ssl_certificate \"{}\" is configured but this build serves plaintext",
                certificate.display()
            );
        }
        (None, None) => {}
    }

    if config.username.is_some() || config.groupname.is_some() {
        debug!("username/groupname are handled by the service manager, ignoring");
    }

    Ok(BusConfig {
        server_name: config.server_name.clone(),
        my_address,
        local_listen: local_listen.to_socket_addr(),
        public_listen,
        signal: signal.to_socket_addr(),
        backlog: config.max_pending_connections,
        neighbors: config.neighbors.clone(),
        cache_dir: config.cache_path.clone(),
        local_services: scan_services(&config.services),
        max_connections: config.max_connections,
        debug_lock_messages: config.debug_lock_messages,
    })
}

/// Enumerate the `<name>.service` files naming this host's services. The
/// set is captured once; it never changes while the daemon runs.
fn scan_services(dir: &Path) -> BTreeSet<String> {
    let mut services = BTreeSet::new();

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            // A host with no local services is legal.
            debug!("services directory {} not read: {}", dir.display(), err);
            return services;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("service") {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                services.insert(stem.to_owned());
            }
        }
    }

    services
}
