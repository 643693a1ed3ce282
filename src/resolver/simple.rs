//! §4.3 "Simple": one A, AAAA, or SRV query for one name.

use std::net::IpAddr;

use super::{make_addrinfo, CancelToken, Resolver, ResolverResults, SrvEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    A,
    Aaaa,
    Srv,
}

pub async fn resolve(
    resolver: &Resolver,
    name: &str,
    kind: RecordKind,
    cancel: &CancelToken,
) -> ResolverResults {
    let query = async {
        match kind {
            RecordKind::A => resolve_ipv4(resolver, name).await,
            RecordKind::Aaaa => resolve_ipv6(resolver, name).await,
            RecordKind::Srv => resolve_srv(resolver, name).await,
        }
    };

    let outcome = tokio::time::timeout(resolver.dns_timeout(), query).await;
    if cancel.is_cancelled() {
        return ResolverResults::empty(name);
    }
    match outcome {
        Ok(results) => results,
        Err(_elapsed) => ResolverResults::empty(name),
    }
}

async fn resolve_ipv4(resolver: &Resolver, name: &str) -> ResolverResults {
    let mut results = ResolverResults::empty(name);
    if let Ok(lookup) = resolver.hickory().ipv4_lookup(name).await {
        for record in lookup.iter() {
            // hickory-resolver's typed lookups don't surface per-record TTL seconds; use a
            // conservative default consistent with the other record kinds below.
            let ttl = 300;
            results.addrinfo.push(make_addrinfo(IpAddr::V4(record.0), 0, ttl));
            results.fold_ttl(ttl);
        }
    }
    results
}

async fn resolve_ipv6(resolver: &Resolver, name: &str) -> ResolverResults {
    let mut results = ResolverResults::empty(name);
    if let Ok(lookup) = resolver.hickory().ipv6_lookup(name).await {
        for record in lookup.iter() {
            let ttl = 300;
            results.addrinfo.push(make_addrinfo(IpAddr::V6(record.0), 0, ttl));
            results.fold_ttl(ttl);
        }
    }
    results
}

async fn resolve_srv(resolver: &Resolver, name: &str) -> ResolverResults {
    let mut results = ResolverResults::empty(name);
    if !resolver.srv_enabled() || resolver.simulate_non_working_srv() {
        return results;
    }
    if let Ok(lookup) = resolver.hickory().srv_lookup(name).await {
        for record in lookup.iter() {
            let ttl = 300;
            results.srv_list.push(SrvEntry {
                priority: record.priority(),
                weight: record.weight(),
                port: record.port(),
                target: record.target().to_utf8(),
                ttl,
                a_results: Vec::new(),
            });
            results.fold_ttl(ttl);
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_kind_variants_are_distinct() {
        assert_ne!(RecordKind::A, RecordKind::Aaaa);
        assert_ne!(RecordKind::Aaaa, RecordKind::Srv);
    }
}
