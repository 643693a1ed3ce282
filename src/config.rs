//! Unified stack-wide configuration.
//!
//! Mirrors the teacher's `DialogManagerConfig` in spirit — one struct with
//! fluent `with_*` builders instead of a dozen constructor arguments — but
//! flattened to a single struct, since this crate's spec calls for "one
//! stack-wide config object" rather than client/server/hybrid behavioral
//! modes.

use std::net::IpAddr;
use std::time::Duration;

/// Address family preference used when both A and AAAA records are present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamilyPreference {
    Inet,
    Inet6,
}

/// Digest authentication compatibility policy (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DigestAuthPolicy {
    pub allow_md5: bool,
    pub allow_no_qop: bool,
}

impl Default for DigestAuthPolicy {
    fn default() -> Self {
        DigestAuthPolicy {
            allow_md5: true,
            allow_no_qop: true,
        }
    }
}

/// Stack-wide tunables (§9, §6 timer defaults).
#[derive(Debug, Clone)]
pub struct StackConfig {
    // RFC 3261 §17 base timers.
    pub t1: Duration,
    pub t2: Duration,
    pub t4: Duration,

    pub transport_timeout: Duration,
    pub dns_timeout: Duration,
    pub pong_timeout: Duration,
    pub inactive_transport_timeout: Duration,
    pub inactive_http_transport_timeout: Duration,
    pub unreliable_transport_timeout: Duration,

    /// Refresh scheduled at this fraction of the obtained expiry (90% per §4.7).
    pub refresh_window_min: f32,
    pub refresh_window_max: f32,

    /// Delay before retrying a refresh after a transport/timeout failure
    /// (§4.7, default 60s); the very first retry after an I/O error instead
    /// uses `refresher_io_retry_first`.
    pub refresher_retry_after: Duration,
    pub refresher_io_retry_first: Duration,

    pub http_proxy_host: Option<String>,
    pub http_proxy_port: Option<u16>,
    pub http_proxy_username: Option<String>,
    pub http_proxy_passwd: Option<String>,

    pub dns_servers: Vec<IpAddr>,
    pub dns_resolv_conf_path: Option<String>,
    pub dns_user_hosts_file: Option<String>,
    pub ai_family_preference: AddressFamilyPreference,

    pub rport_enabled: bool,
    pub nat_helper_enabled: bool,
    pub dns_srv_enabled: bool,
    pub dns_search_enabled: bool,

    /// belle-sip `provider.c`: when a channel has failed over to a
    /// non-primary SRV target, retry the primary address in the background
    /// and migrate new outbound traffic back to it once reachable.
    pub reconnect_to_primary_asap: bool,
    pub reconnect_primary_retry_interval: Duration,

    /// Debug knob (belle-sip `simulate_non_working_srv`): force the combined
    /// resolver to treat every SRV answer as failed, exercising the A/AAAA
    /// fallback path from test suites without controlling a real DNS zone.
    pub simulate_non_working_srv: bool,

    pub digest_auth_policy: DigestAuthPolicy,
}

impl StackConfig {
    /// RFC 3261 §17.1.1.2: F = 64*T1.
    pub fn timer_f(&self) -> Duration {
        self.t1 * 64
    }

    /// RFC 3261 §17.1.1.2: B = 64*T1.
    pub fn timer_b(&self) -> Duration {
        self.t1 * 64
    }

    /// RFC 3261 §17.1.1.2: D = 32s on unreliable transports, 0 on reliable.
    pub fn timer_d(&self, reliable: bool) -> Duration {
        if reliable {
            Duration::ZERO
        } else {
            Duration::from_secs(32)
        }
    }

    /// RFC 3261 §17.1.2.2 / §17.2.2: K = T4 on unreliable, 0 on reliable.
    pub fn timer_k(&self, reliable: bool) -> Duration {
        if reliable {
            Duration::ZERO
        } else {
            self.t4
        }
    }

    pub fn with_t1(mut self, t1: Duration) -> Self {
        self.t1 = t1;
        self
    }

    pub fn with_dns_servers(mut self, servers: Vec<IpAddr>) -> Self {
        self.dns_servers = servers;
        self
    }

    pub fn with_http_proxy(
        mut self,
        host: impl Into<String>,
        port: u16,
        username: Option<String>,
        passwd: Option<String>,
    ) -> Self {
        self.http_proxy_host = Some(host.into());
        self.http_proxy_port = Some(port);
        self.http_proxy_username = username;
        self.http_proxy_passwd = passwd;
        self
    }

    pub fn with_nat_helper(mut self, enabled: bool) -> Self {
        self.nat_helper_enabled = enabled;
        self
    }

    pub fn with_digest_policy(mut self, policy: DigestAuthPolicy) -> Self {
        self.digest_auth_policy = policy;
        self
    }

    pub fn with_simulated_non_working_srv(mut self, enabled: bool) -> Self {
        self.simulate_non_working_srv = enabled;
        self
    }
}

impl Default for StackConfig {
    fn default() -> Self {
        StackConfig {
            t1: Duration::from_millis(500),
            t2: Duration::from_millis(4000),
            t4: Duration::from_millis(5000),
            transport_timeout: Duration::from_millis(63_000),
            dns_timeout: Duration::from_millis(15_000),
            pong_timeout: Duration::from_millis(10_000),
            inactive_transport_timeout: Duration::from_millis(3_600_000),
            inactive_http_transport_timeout: Duration::from_millis(50_000),
            unreliable_transport_timeout: Duration::from_millis(120_000),
            refresh_window_min: 0.5,
            refresh_window_max: 0.9,
            refresher_retry_after: Duration::from_millis(60_000),
            refresher_io_retry_first: Duration::from_millis(500),
            http_proxy_host: None,
            http_proxy_port: None,
            http_proxy_username: None,
            http_proxy_passwd: None,
            dns_servers: Vec::new(),
            dns_resolv_conf_path: None,
            dns_user_hosts_file: None,
            ai_family_preference: AddressFamilyPreference::Inet,
            rport_enabled: true,
            nat_helper_enabled: false,
            dns_srv_enabled: true,
            dns_search_enabled: true,
            reconnect_to_primary_asap: false,
            reconnect_primary_retry_interval: Duration::from_millis(30_000),
            simulate_non_working_srv: false,
            digest_auth_policy: DigestAuthPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timers_match_rfc3261_section17() {
        let cfg = StackConfig::default();
        assert_eq!(cfg.t1, Duration::from_millis(500));
        assert_eq!(cfg.t2, Duration::from_millis(4000));
        assert_eq!(cfg.t4, Duration::from_millis(5000));
        assert_eq!(cfg.timer_f(), Duration::from_millis(32_000));
        assert_eq!(cfg.timer_d(false), Duration::from_secs(32));
        assert_eq!(cfg.timer_d(true), Duration::ZERO);
        assert_eq!(cfg.timer_k(false), cfg.t4);
        assert_eq!(cfg.timer_k(true), Duration::ZERO);
    }

    #[test]
    fn builder_methods_compose() {
        let cfg = StackConfig::default()
            .with_t1(Duration::from_millis(250))
            .with_nat_helper(true);
        assert_eq!(cfg.t1, Duration::from_millis(250));
        assert!(cfg.nat_helper_enabled);
    }
}
