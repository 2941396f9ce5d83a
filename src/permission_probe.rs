//! Local-network capability probe.
//!
//! The OS gives no direct way to ask whether local-network traffic is
//! allowed, so the probe observes it: bind an ephemeral TCP listener,
//! advertise it over mDNS, and watch what happens. A successful
//! announcement means granted; a failure that smells like a permission
//! error means denied; everything else leaves the answer unknown.

use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use mdns_sd::{DaemonEvent, ServiceDaemon, ServiceInfo};
use tokio::sync::broadcast;

use crate::persistence::ProbeStore;
use crate::protocol::{Message, PermissionStatus};

pub const PROBE_SERVICE_TYPE: &str = "_tonebridge._tcp.local.";
const PROBE_INSTANCE_NAME: &str = "Tonebridge";
const PROBE_HOST_NAME: &str = "tonebridge.local.";

/// Hard teardown deadline for one probe run. Whatever signal arrives
/// first inside this window decides the run.
pub const PROBE_DEADLINE: Duration = Duration::from_secs(2);

pub struct LocalCapabilityProbe {
    store: ProbeStore,
    status: Mutex<PermissionStatus>,
    bus_producer: broadcast::Sender<Message>,
}

impl LocalCapabilityProbe {
    pub fn new(store: ProbeStore, bus_producer: broadcast::Sender<Message>) -> Self {
        let status = store.load_status();
        LocalCapabilityProbe {
            store,
            status: Mutex::new(status),
            bus_producer,
        }
    }

    pub fn status(&self) -> PermissionStatus {
        match self.status.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Starts one background probe run. Fire-and-forget; the result lands
    /// through `record`.
    pub fn refresh(self: &Arc<Self>) {
        let this = self.clone();
        std::thread::Builder::new()
            .name("capability-probe".to_string())
            .spawn(move || {
                let outcome = run_probe_once();
                this.record(outcome);
            })
            .ok();
    }

    /// Applies a probe outcome. An unknown outcome is informational only;
    /// a terminal outcome persists and emits an event, but only when it
    /// differs from the previous answer.
    pub fn record(&self, outcome: PermissionStatus) {
        if outcome == PermissionStatus::Unknown {
            debug!("LocalCapabilityProbe: run ended without a terminal signal");
            return;
        }
        {
            let mut status = match self.status.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if *status == outcome {
                return;
            }
            *status = outcome;
        }
        self.store.save_status(outcome);
        info!("LocalCapabilityProbe: local network access is {}", outcome.as_str());
        if self
            .bus_producer
            .send(Message::Permission(outcome))
            .is_err()
        {
            warn!("LocalCapabilityProbe: no bus receivers for permission change");
        }
    }
}

fn run_probe_once() -> PermissionStatus {
    let listener = match TcpListener::bind(("0.0.0.0", 0)) {
        Ok(listener) => listener,
        Err(err) => return classify_bind_error(&err),
    };
    let port = match listener.local_addr() {
        Ok(addr) => addr.port(),
        Err(err) => {
            debug!("LocalCapabilityProbe: no local addr for listener: {err}");
            return PermissionStatus::Unknown;
        }
    };
    let daemon = match ServiceDaemon::new() {
        Ok(daemon) => daemon,
        Err(err) => return classify_mdns_error(&err),
    };
    let outcome = advertise_and_wait(&daemon, port);
    // Teardown runs regardless of the outcome; the listener drops with
    // this frame.
    if let Err(err) = daemon.shutdown() {
        debug!("LocalCapabilityProbe: daemon shutdown: {err}");
    }
    outcome
}

fn advertise_and_wait(daemon: &ServiceDaemon, port: u16) -> PermissionStatus {
    let monitor = match daemon.monitor() {
        Ok(monitor) => monitor,
        Err(err) => return classify_mdns_error(&err),
    };
    let info = match ServiceInfo::new(
        PROBE_SERVICE_TYPE,
        PROBE_INSTANCE_NAME,
        PROBE_HOST_NAME,
        "",
        port,
        None::<HashMap<String, String>>,
    ) {
        Ok(info) => info.enable_addr_auto(),
        Err(err) => {
            debug!("LocalCapabilityProbe: bad service info: {err}");
            return PermissionStatus::Unknown;
        }
    };
    if let Err(err) = daemon.register(info) {
        return classify_mdns_error(&err);
    }

    let deadline = Instant::now() + PROBE_DEADLINE;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return PermissionStatus::Unknown;
        }
        match monitor.recv_timeout(remaining) {
            Ok(DaemonEvent::Announce(name, _)) => {
                debug!("LocalCapabilityProbe: announced {name}");
                return PermissionStatus::Granted;
            }
            Ok(DaemonEvent::Error(err)) => return classify_mdns_error(&err),
            Ok(_) => continue,
            Err(_) => return PermissionStatus::Unknown,
        }
    }
}

fn classify_bind_error(err: &std::io::Error) -> PermissionStatus {
    if err.kind() == std::io::ErrorKind::PermissionDenied {
        PermissionStatus::Denied
    } else {
        debug!("LocalCapabilityProbe: listener bind failed: {err}");
        PermissionStatus::Unknown
    }
}

fn classify_mdns_error(err: &mdns_sd::Error) -> PermissionStatus {
    let text = err.to_string();
    if is_denied_text(&text) {
        PermissionStatus::Denied
    } else {
        debug!("LocalCapabilityProbe: mdns error: {text}");
        PermissionStatus::Unknown
    }
}

/// The daemon wraps OS errors in strings, so denial is recognized by its
/// usual spellings.
fn is_denied_text(text: &str) -> bool {
    let lowered = text.to_lowercase();
    ["permission denied", "eacces", "eperm", "operation not permitted"]
        .iter()
        .any(|needle| lowered.contains(needle))
}
