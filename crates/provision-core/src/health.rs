//! Readiness polling and the built-in probes.
//!
//! `HealthChecker` is probe-agnostic: anything `FnMut() -> bool` works.
//! `HttpProbe` treats a 2xx response as ready; `ServiceProbe` asks systemd
//! whether a unit is active.

use serde::{Deserialize, Serialize};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// HealthChecker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct HealthChecker {
    interrupt: Option<Arc<AtomicBool>>,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }

    pub fn interrupted(&self) -> bool {
        self.interrupt
            .as_ref()
            .is_some_and(|f| f.load(Ordering::SeqCst))
    }

    /// Poll `probe` every `poll_interval` until it returns true or `timeout`
    /// elapses. Returns false on timeout or interrupt; never errors.
    ///
    /// No poll is scheduled at or past the deadline, so an always-false probe
    /// with a 2s timeout and 0.5s interval is polled four times.
    pub fn wait_until_ready<P>(&self, mut probe: P, timeout: Duration, poll_interval: Duration) -> bool
    where
        P: FnMut() -> bool,
    {
        let start = Instant::now();
        let deadline = start + timeout;
        let mut polls = 0u32;

        loop {
            if self.interrupted() {
                tracing::warn!(polls, "readiness wait interrupted");
                return false;
            }
            polls += 1;
            if probe() {
                tracing::debug!(polls, elapsed_ms = start.elapsed().as_millis() as u64, "probe ready");
                return true;
            }
            let next = Instant::now() + poll_interval;
            if next >= deadline {
                tracing::debug!(polls, "probe not ready before deadline");
                return false;
            }
            self.sleep_until(next);
        }
    }

    fn sleep_until(&self, until: Instant) {
        const SLICE: Duration = Duration::from_millis(50);
        loop {
            let now = Instant::now();
            if now >= until || self.interrupted() {
                return;
            }
            std::thread::sleep((until - now).min(SLICE));
        }
    }
}

// ---------------------------------------------------------------------------
// HttpProbe
// ---------------------------------------------------------------------------

/// GET `url`; ready iff the response status is 2xx within `timeout`.
///
/// A client that cannot be built leaves the probe permanently not ready.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    url: String,
    client: Option<reqwest::blocking::Client>,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let url = url.into();
        let client = match reqwest::blocking::Client::builder().timeout(timeout).build() {
            Ok(client) => Some(client),
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "failed to build http client");
                None
            }
        };
        Self { url, client }
    }

    pub fn check(&self) -> bool {
        let Some(client) = &self.client else {
            return false;
        };
        match client.get(&self.url).send() {
            Ok(resp) => {
                let ok = resp.status().is_success();
                tracing::debug!(url = %self.url, status = resp.status().as_u16(), ok, "http probe");
                ok
            }
            Err(e) => {
                tracing::debug!(url = %self.url, error = %e, "http probe failed");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ServiceProbe
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Active,
    Inactive,
    NotFound,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceState::Active => f.write_str("active"),
            ServiceState::Inactive => f.write_str("inactive"),
            ServiceState::NotFound => f.write_str("not-found"),
        }
    }
}

/// Ask systemd for the state of `unit`.
///
/// A missing `systemctl` binary reports `NotFound`.
pub fn query_service(unit: &str) -> ServiceState {
    let output = Command::new("systemctl")
        .args(["show", "--property=LoadState,ActiveState", unit])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output();
    match output {
        Ok(out) => parse_service_state(&String::from_utf8_lossy(&out.stdout)),
        Err(e) => {
            tracing::debug!(unit, error = %e, "systemctl unavailable");
            ServiceState::NotFound
        }
    }
}

/// Parse `systemctl show --property=LoadState,ActiveState` output.
pub fn parse_service_state(output: &str) -> ServiceState {
    let mut load = None;
    let mut active = None;
    for line in output.lines() {
        if let Some((key, value)) = line.split_once('=') {
            match key.trim() {
                "LoadState" => load = Some(value.trim()),
                "ActiveState" => active = Some(value.trim()),
                _ => {}
            }
        }
    }
    match (load, active) {
        (None, _) | (Some("not-found"), _) => ServiceState::NotFound,
        (_, Some("active")) | (_, Some("reloading")) => ServiceState::Active,
        _ => ServiceState::Inactive,
    }
}

#[derive(Debug, Clone)]
pub struct ServiceProbe {
    unit: String,
}

impl ServiceProbe {
    pub fn new(unit: impl Into<String>) -> Self {
        Self { unit: unit.into() }
    }

    pub fn check(&self) -> bool {
        query_service(&self.unit) == ServiceState::Active
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn always_false_probe_times_out_after_four_polls() {
        let checker = HealthChecker::new();
        let mut polls = 0;
        let started = Instant::now();
        let ready = checker.wait_until_ready(
            || {
                polls += 1;
                false
            },
            Duration::from_secs(2),
            Duration::from_millis(500),
        );
        assert!(!ready);
        assert_eq!(polls, 4);
        assert!(started.elapsed() < Duration::from_millis(2500));
    }

    #[test]
    fn ready_probe_returns_immediately() {
        let checker = HealthChecker::new();
        let started = Instant::now();
        assert!(checker.wait_until_ready(|| true, Duration::from_secs(5), Duration::from_secs(1)));
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn becomes_ready_on_third_poll() {
        let checker = HealthChecker::new();
        let mut polls = 0;
        let ready = checker.wait_until_ready(
            || {
                polls += 1;
                polls == 3
            },
            Duration::from_secs(2),
            Duration::from_millis(20),
        );
        assert!(ready);
        assert_eq!(polls, 3);
    }

    #[test]
    fn interrupt_ends_wait() {
        let flag = Arc::new(AtomicBool::new(true));
        let checker = HealthChecker::new().with_interrupt(flag);
        let mut polls = 0;
        let ready = checker.wait_until_ready(
            || {
                polls += 1;
                true
            },
            Duration::from_secs(30),
            Duration::from_secs(1),
        );
        assert!(!ready);
        assert_eq!(polls, 0);
    }

    #[test]
    fn http_probe_accepts_2xx() {
        let mut server = mockito::Server::new();
        let mock = server.mock("GET", "/api/tags").with_status(200).create();
        let probe = HttpProbe::new(format!("{}/api/tags", server.url()), Duration::from_secs(2));
        assert!(probe.check());
        mock.assert();
    }

    #[test]
    fn http_probe_rejects_5xx() {
        let mut server = mockito::Server::new();
        let _mock = server.mock("GET", "/health").with_status(503).create();
        let probe = HttpProbe::new(format!("{}/health", server.url()), Duration::from_secs(2));
        assert!(!probe.check());
    }

    #[test]
    fn http_probe_unreachable_is_false() {
        let probe = HttpProbe::new("http://127.0.0.1:9/", Duration::from_millis(300));
        assert!(!probe.check());
    }

    #[test]
    fn http_check_without_client_is_never_ready() {
        let mut server = mockito::Server::new();
        let mock = server.mock("GET", "/").with_status(200).expect(0).create();
        let probe = HttpProbe {
            url: server.url(),
            client: None,
        };
        assert!(!probe.check());
        mock.assert();
    }

    #[test]
    fn parse_active_unit() {
        let out = "LoadState=loaded\nActiveState=active\n";
        assert_eq!(parse_service_state(out), ServiceState::Active);
    }

    #[test]
    fn parse_inactive_and_failed_units() {
        assert_eq!(
            parse_service_state("LoadState=loaded\nActiveState=inactive\n"),
            ServiceState::Inactive
        );
        assert_eq!(
            parse_service_state("LoadState=loaded\nActiveState=failed\n"),
            ServiceState::Inactive
        );
    }

    #[test]
    fn parse_missing_unit() {
        assert_eq!(
            parse_service_state("LoadState=not-found\nActiveState=inactive\n"),
            ServiceState::NotFound
        );
        assert_eq!(parse_service_state(""), ServiceState::NotFound);
    }

    #[test]
    fn service_state_display() {
        assert_eq!(ServiceState::NotFound.to_string(), "not-found");
        assert_eq!(ServiceState::Active.to_string(), "active");
    }
}
