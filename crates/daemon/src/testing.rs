//! In-process doubles for the outbound seams, shared by the unit tests and
//! the integration suite.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::auth::StaticTokenAuth;
use crate::config::Config;
use crate::db::{PortRow, Store};
use crate::error::Error;
use crate::notify::AdminNotifier;
use crate::rotation::{ExitIp, GeoDetails, ProxyProber, ProxyProtocol};
use crate::AppState;

/// Prober double: canned answers with optional failures and delays; every
/// call is recorded.
pub struct FakeProber {
    exit_ip: Mutex<ExitIp>,
    geo: Mutex<Option<GeoDetails>>,
    fail_probes: AtomicUsize,
    fail_rotations: AtomicBool,
    probe_delay: Mutex<Duration>,
    probes: AtomicUsize,
    rotations: Mutex<Vec<String>>,
}

impl FakeProber {
    pub const DEFAULT_IP: &'static str = "203.0.113.7";

    pub fn new() -> Self {
        Self {
            exit_ip: Mutex::new(ExitIp {
                ip: Self::DEFAULT_IP.to_string(),
                version: 4,
            }),
            geo: Mutex::new(Some(GeoDetails {
                ip: Self::DEFAULT_IP.to_string(),
                city: Some("Berlin".to_string()),
                region: Some("Berlin".to_string()),
                operator: Some("AS64500 Example Carrier".to_string()),
            })),
            fail_probes: AtomicUsize::new(0),
            fail_rotations: AtomicBool::new(false),
            probe_delay: Mutex::new(Duration::ZERO),
            probes: AtomicUsize::new(0),
            rotations: Mutex::new(Vec::new()),
        }
    }

    pub fn set_exit_ip(&self, ip: &str, version: u8) {
        *self.exit_ip.lock().unwrap() = ExitIp {
            ip: ip.to_string(),
            version,
        };
    }

    pub fn set_geo(&self, geo: Option<GeoDetails>) {
        *self.geo.lock().unwrap() = geo;
    }

    /// The next `n` exit-IP probes fail; usize::MAX means all of them do.
    pub fn fail_next_probes(&self, n: usize) {
        self.fail_probes.store(n, Ordering::SeqCst);
    }

    pub fn fail_rotations(&self, fail: bool) {
        self.fail_rotations.store(fail, Ordering::SeqCst);
    }

    pub fn set_probe_delay(&self, delay: Duration) {
        *self.probe_delay.lock().unwrap() = delay;
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn rotation_links(&self) -> Vec<String> {
        self.rotations.lock().unwrap().clone()
    }
}

impl Default for FakeProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProxyProber for FakeProber {
    async fn trigger_rotation(&self, link: &str) -> Result<(), Error> {
        self.rotations.lock().unwrap().push(link.to_string());
        if self.fail_rotations.load(Ordering::SeqCst) {
            return Err(Error::Probe("rotation refused".to_string()));
        }
        Ok(())
    }

    async fn lookup_exit_ip(
        &self,
        _port: &PortRow,
        _protocol: ProxyProtocol,
    ) -> Result<ExitIp, Error> {
        let delay = *self.probe_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.probes.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_probes.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != usize::MAX {
                self.fail_probes.fetch_sub(1, Ordering::SeqCst);
            }
            return Err(Error::Probe("probe refused".to_string()));
        }
        Ok(self.exit_ip.lock().unwrap().clone())
    }

    async fn lookup_geo(&self, _ip: &str) -> Result<Option<GeoDetails>, Error> {
        Ok(self.geo.lock().unwrap().clone())
    }
}

/// Notifier double that keeps every message.
#[derive(Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl AdminNotifier for RecordingNotifier {
    async fn notify_admin(&self, text: &str) {
        self.messages.lock().unwrap().push(text.to_string());
    }
}

/// AppState over an in-memory store with fake seams, for driving the engine
/// and jobs directly in tests.
pub fn fake_state(cfg: Config) -> (AppState, Arc<FakeProber>, Arc<RecordingNotifier>) {
    let store = Store::in_memory().expect("in-memory store");
    let prober = Arc::new(FakeProber::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let state = AppState {
        store,
        cfg: Arc::new(cfg),
        prober: prober.clone(),
        notifier: notifier.clone(),
        auth: Arc::new(StaticTokenAuth::new(None)),
    };
    (state, prober, notifier)
}
