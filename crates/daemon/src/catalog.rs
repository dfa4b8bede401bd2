use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::config::Config;
use crate::db::{self, NewPort, Store};
use crate::error::{Error, Result};
use crate::rotation::{self, ProxyProber};

#[derive(Debug, Deserialize)]
struct SeedFile {
    #[serde(default)]
    geos: Vec<String>,
    #[serde(default)]
    ports: Vec<SeedPort>,
}

#[derive(Debug, Deserialize)]
struct SeedPort {
    host: String,
    #[serde(default)]
    socks_port: u16,
    #[serde(default)]
    http_port: u16,
    #[serde(default)]
    login: String,
    #[serde(default)]
    password: String,
    geo: String,
    #[serde(default = "default_ip_version")]
    ip_version: u8,
    #[serde(default = "default_active")]
    active: bool,
    #[serde(default)]
    rotation_link: Option<String>,
    #[serde(default)]
    rent_end: Option<DateTime<Utc>>,
    #[serde(default)]
    exit_ip: Option<SeedExitIp>,
}

/// Last known exit address, carried by providers that report it up front.
#[derive(Debug, Deserialize)]
struct SeedExitIp {
    ip: String,
    #[serde(default = "default_ip_version")]
    ip_version: u8,
    #[serde(default)]
    operator: Option<String>,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    region: Option<String>,
}

fn default_ip_version() -> u8 {
    4
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ImportSummary {
    pub geos: usize,
    pub ports: usize,
    pub primed: usize,
}

/// Import the JSON seed file: geos upsert by name, ports by endpoint, and a
/// seed exit-IP block primes the cache of a port that has none yet (a fresher
/// probed address is never overwritten by re-import).
pub fn import_catalog(store: &Store, path: &Path) -> Result<ImportSummary> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::Catalog(format!("cannot read {}: {e}", path.display())))?;
    let seed: SeedFile = serde_json::from_str(&raw)
        .map_err(|e| Error::Catalog(format!("bad seed file {}: {e}", path.display())))?;

    let mut summary = ImportSummary::default();
    let conn = store.lock();
    for geo in &seed.geos {
        db::upsert_geo(&conn, geo)?;
        summary.geos += 1;
    }
    for port in &seed.ports {
        let id = db::upsert_port(
            &conn,
            &NewPort {
                host: port.host.clone(),
                socks_port: port.socks_port,
                http_port: port.http_port,
                login: port.login.clone(),
                password: port.password.clone(),
                geo: port.geo.clone(),
                ip_version: port.ip_version,
                active: port.active,
                rotation_link: port.rotation_link.clone(),
                rent_end: port.rent_end,
            },
        )?;
        summary.ports += 1;

        if let Some(exit) = &port.exit_ip {
            if db::latest_ip_info_id(&conn, id)?.is_none() {
                db::insert_ip_info(
                    &conn,
                    id,
                    &exit.ip,
                    exit.ip_version,
                    exit.operator.as_deref(),
                    exit.city.as_deref(),
                    exit.region.as_deref(),
                )?;
                summary.primed += 1;
            }
        }
    }
    Ok(summary)
}

/// One-shot pass probing every active port that has no cached exit address,
/// so fresh catalog entries become allocatable. Per-port failures are logged
/// and skipped.
pub async fn prime_missing_ip_info(store: Store, prober: Arc<dyn ProxyProber>, cfg: Arc<Config>) {
    let ports = {
        let conn = store.lock();
        match db::active_ports_missing_ip_info(&conn) {
            Ok(ports) => ports,
            Err(e) => {
                tracing::error!("priming scan failed: {e}");
                return;
            }
        }
    };
    if ports.is_empty() {
        return;
    }
    tracing::info!(count = ports.len(), "probing exit addresses for new ports");

    let mut set = tokio::task::JoinSet::new();
    for port in ports {
        let store = store.clone();
        let prober = prober.clone();
        let cfg = cfg.clone();
        set.spawn(async move {
            if let Err(e) = rotation::refresh_exit_ip(&store, prober, &cfg, &port).await {
                tracing::warn!(port_id = port.id, host = %port.host, "priming probe failed: {e}");
            }
        });
    }
    while set.join_next().await.is_some() {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeProber;
    use std::io::Write;

    fn seed_to_tempfile(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    const SEED: &str = r#"{
        "geos": ["de", "us"],
        "ports": [
            {
                "host": "proxy-1.example",
                "socks_port": 1080,
                "http_port": 8080,
                "login": "u",
                "password": "p",
                "geo": "de",
                "ip_version": 4,
                "rotation_link": "https://provider.example/rotate?key=1",
                "exit_ip": {"ip": "198.51.100.4", "operator": "AS64500", "city": "Berlin"}
            },
            {
                "host": "proxy-2.example",
                "http_port": 8080,
                "geo": "us",
                "ip_version": 6,
                "active": false
            }
        ]
    }"#;

    #[test]
    fn import_is_idempotent() {
        let store = Store::in_memory().unwrap();
        let file = seed_to_tempfile(SEED);

        let first = import_catalog(&store, file.path()).unwrap();
        assert_eq!(first.geos, 2);
        assert_eq!(first.ports, 2);
        assert_eq!(first.primed, 1);

        let second = import_catalog(&store, file.path()).unwrap();
        assert_eq!(second.ports, 2);
        assert_eq!(second.primed, 0);

        let conn = store.lock();
        let port_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM ports", [], |r| r.get(0))
            .unwrap();
        assert_eq!(port_count, 2);
        let ip_rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM ip_info", [], |r| r.get(0))
            .unwrap();
        assert_eq!(ip_rows, 1);
    }

    #[test]
    fn bad_seed_files_are_rejected() {
        let store = Store::in_memory().unwrap();
        let file = seed_to_tempfile("{ not json");
        assert!(matches!(
            import_catalog(&store, file.path()),
            Err(Error::Catalog(_))
        ));
        assert!(matches!(
            import_catalog(&store, Path::new("/nonexistent/seed.json")),
            Err(Error::Catalog(_))
        ));
    }

    #[tokio::test]
    async fn priming_records_exit_addresses_for_bare_ports() {
        let store = Store::in_memory().unwrap();
        let file = seed_to_tempfile(SEED);
        import_catalog(&store, file.path()).unwrap();
        // Re-activate the v6 port so the pass sees it.
        {
            let conn = store.lock();
            conn.execute("UPDATE ports SET is_active = 1", []).unwrap();
        }

        let prober = Arc::new(FakeProber::new());
        prime_missing_ip_info(store.clone(), prober.clone(), Arc::new(Config::default())).await;

        assert_eq!(prober.probe_count(), 1);
        let conn = store.lock();
        let covered: i64 = conn
            .query_row(
                "SELECT COUNT(DISTINCT port_id) FROM ip_info",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(covered, 2);
    }

    #[tokio::test]
    async fn priming_survives_probe_failures() {
        let store = Store::in_memory().unwrap();
        let file = seed_to_tempfile(SEED);
        import_catalog(&store, file.path()).unwrap();
        {
            let conn = store.lock();
            conn.execute("UPDATE ports SET is_active = 1", []).unwrap();
        }

        let prober = Arc::new(FakeProber::new());
        prober.fail_next_probes(usize::MAX);
        let mut cfg = Config::default();
        cfg.probe_attempts = 2;
        prime_missing_ip_info(store.clone(), prober, Arc::new(cfg)).await;

        let conn = store.lock();
        let ip_rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM ip_info", [], |r| r.get(0))
            .unwrap();
        assert_eq!(ip_rows, 1);
    }
}
