//! Local SRV override for `.local` names (§4.10 supplement).
//!
//! belle-sip ships a real multicast-DNS responder (`belle_sip_mdns_*`,
//! behind `HAVE_MDNS`) gated on `is_mdns_query`, which simply checks whether
//! the queried name ends in `.local`. Standing up an mDNS responder is out of
//! scope here; instead this module reproduces the *dispatch* behavior —
//! names ending in `.local` never hit the real resolver — backed by an
//! in-process override table a caller populates for tests or for
//! link-local peers discovered through some other channel (manual
//! configuration, a service-discovery library upstream of this crate).

use std::collections::HashMap;
use std::sync::RwLock;

use super::results::{elect_srv_by_weight, thread_rng_draw, SrvEntry};
use super::ResolverResults;

/// True when `name` would be routed to the mDNS path rather than to unicast
/// DNS, mirroring belle-sip's `is_mdns_query`.
pub fn is_mdns_name(name: &str) -> bool {
    let trimmed = name.strip_suffix('.').unwrap_or(name);
    trimmed
        .rsplit_once('.')
        .map(|(_, suffix)| suffix.eq_ignore_ascii_case("local"))
        .unwrap_or(false)
}

/// A table of statically known `.local` SRV answers, consulted instead of
/// the real resolver for names [`is_mdns_name`] accepts.
#[derive(Default)]
pub struct MdnsOverrides {
    entries: RwLock<HashMap<String, Vec<SrvEntry>>>,
}

impl MdnsOverrides {
    pub fn new() -> Self {
        MdnsOverrides {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, name: impl Into<String>, srv: Vec<SrvEntry>) {
        self.entries.write().unwrap().insert(name.into(), srv);
    }

    pub fn lookup(&self, name: &str) -> Option<Vec<SrvEntry>> {
        self.entries.read().unwrap().get(name).cloned()
    }
}

/// Consults `overrides` instead of issuing a real SRV/A query for a name
/// [`is_mdns_name`] accepts. Empty when the caller never registered an entry
/// for `name` — callers are expected to check [`is_mdns_name`] first and
/// treat this as the entire answer rather than falling through to DNS.
pub fn resolve(overrides: &MdnsOverrides, name: &str) -> ResolverResults {
    let Some(srv_list) = overrides.lookup(name) else {
        return ResolverResults::empty(name);
    };

    let elected = elect_srv_by_weight(&srv_list, thread_rng_draw);
    let mut results = ResolverResults::empty(name);
    for entry in &elected {
        results.fold_ttl(entry.ttl);
        for a in &entry.a_results {
            results.fold_ttl(a.ttl);
        }
    }
    results.srv_list = elected;
    results
}
