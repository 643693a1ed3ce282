//! Combined SRV + A/AAAA DNS resolution with weighted SRV election (§4.3).
//!
//! Grounded in `hickory-resolver`'s `TokioAsyncResolver`, the pattern used by
//! the `resolver.rs` module of the example pack's pksip crate, generalized
//! here to the three context kinds belle-sip's `belle_sip_resolver.c`
//! exposes: simple, dual-stack, and SRV-then-A/AAAA combined.

pub mod combined;
pub mod dual;
pub mod mdns;
pub mod results;
pub mod simple;

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;

use crate::config::{AddressFamilyPreference, StackConfig};
use crate::error::{Result, TransportError};

pub use mdns::{is_mdns_name, MdnsOverrides};
pub use results::{elect_srv_by_weight, AddrInfo, ResolverResults, SrvEntry};

/// A handle a caller can use to stop a resolution in progress.
///
/// Cancellation is idempotent (§4.3 "cancellation is idempotent"): flipping
/// the flag twice has the same effect as once, and in-flight sub-queries are
/// only checked before their callback fires, never aborted outright —
/// "best-effort" per the same section.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Wraps a `TokioAsyncResolver` with the stack's configured timeout,
/// search-domain and mDNS policy, and dispatches to the simple/dual/combined
/// variants.
#[derive(Clone)]
pub struct Resolver {
    inner: Arc<TokioAsyncResolver>,
    dns_timeout: Duration,
    family_preference: AddressFamilyPreference,
    srv_enabled: bool,
    search_enabled: bool,
    simulate_non_working_srv: bool,
    mdns_overrides: Arc<MdnsOverrides>,
}

impl Resolver {
    /// Builds a resolver from system configuration (`/etc/resolv.conf` on
    /// Unix), overridden by any explicit `dns_servers` in `config`.
    pub fn from_config(config: &StackConfig) -> Result<Self> {
        let inner = if config.dns_servers.is_empty() {
            TokioAsyncResolver::tokio_from_system_conf().map_err(|e| {
                TransportError::ResolutionFailed(format!("system resolver config: {e}"))
            })?
        } else {
            let mut resolver_config = ResolverConfig::new();
            for ip in &config.dns_servers {
                resolver_config.add_name_server(hickory_resolver::config::NameServerConfig::new(
                    std::net::SocketAddr::new(*ip, 53),
                    hickory_resolver::config::Protocol::Udp,
                ));
            }
            TokioAsyncResolver::tokio(resolver_config, ResolverOpts::default())
        };

        Ok(Resolver {
            inner: Arc::new(inner),
            dns_timeout: config.dns_timeout,
            family_preference: config.ai_family_preference,
            srv_enabled: config.dns_srv_enabled,
            search_enabled: config.dns_search_enabled,
            simulate_non_working_srv: config.simulate_non_working_srv,
            mdns_overrides: Arc::new(MdnsOverrides::new()),
        })
    }

    /// The caller-fed `.local` override table consulted before any real SRV
    /// query is issued for an mDNS-eligible name (§4.10).
    pub fn mdns_overrides(&self) -> &MdnsOverrides {
        &self.mdns_overrides
    }

    /// Registers a local SRV answer for an mDNS-eligible name, consulted by
    /// [`Self::resolve_combined`]/`resolve_hop` instead of a real query
    /// (§4.10, belle-sip `belle_sip_mdns_register`).
    pub fn register_local_srv(&self, name: impl Into<String>, srv: Vec<SrvEntry>) {
        self.mdns_overrides.insert(name, srv);
    }

    pub fn dns_timeout(&self) -> Duration {
        self.dns_timeout
    }

    pub fn family_preference(&self) -> AddressFamilyPreference {
        self.family_preference
    }

    pub fn srv_enabled(&self) -> bool {
        self.srv_enabled
    }

    pub fn search_enabled(&self) -> bool {
        self.search_enabled
    }

    pub fn simulate_non_working_srv(&self) -> bool {
        self.simulate_non_working_srv
    }

    pub(crate) fn hickory(&self) -> &TokioAsyncResolver {
        &self.inner
    }

    /// §4.3 "Simple": one A, AAAA, or SRV query for one name.
    pub async fn resolve_simple(
        &self,
        name: &str,
        record: simple::RecordKind,
        cancel: &CancelToken,
    ) -> ResolverResults {
        simple::resolve(self, name, record, cancel).await
    }

    /// §4.3 "Dual": A and AAAA fanned out together, AAAA given up to 3000 ms
    /// grace once A has already returned.
    pub async fn resolve_dual(&self, name: &str, cancel: &CancelToken) -> ResolverResults {
        dual::resolve(self, name, cancel).await
    }

    /// §4.3 "Combined": SRV first, falling back to dual A/AAAA if SRV is
    /// empty; resolves each elected SRV target afterward.
    pub async fn resolve_combined(&self, name: &str, cancel: &CancelToken) -> ResolverResults {
        combined::resolve(self, name, cancel).await
    }
}

/// Converts a resolved IP + port into the addrinfo shape `ResolverResults`
/// carries, tagging it with the record's TTL.
pub(crate) fn make_addrinfo(addr: IpAddr, port: u16, ttl: u32) -> AddrInfo {
    AddrInfo { addr, port, ttl }
}
