//! §4.3 "Combined": fans out SRV and A/AAAA in parallel. When SRV returns
//! results, the A/AAAA fallback is abandoned and one A/AAAA query is issued
//! per elected SRV target instead. If SRV is empty, the dual A/AAAA result is
//! used as-is. If A/AAAA arrives first, SRV gets a 3000 ms grace window
//! before the combined resolver gives up on it.

use std::time::Duration;

use super::dual;
use super::simple::{self, RecordKind};
use super::{elect_srv_by_weight, thread_rng_draw, CancelToken, Resolver, ResolverResults, SrvEntry};

const SRV_GRACE: Duration = Duration::from_millis(3000);

pub async fn resolve(resolver: &Resolver, name: &str, cancel: &CancelToken) -> ResolverResults {
    let srv_query = simple::resolve(resolver, name, RecordKind::Srv, cancel);
    let fallback_query = dual::resolve(resolver, name, cancel);

    let (srv, fallback) = tokio::join!(with_grace(srv_query), fallback_query);

    if cancel.is_cancelled() {
        return ResolverResults::empty(name);
    }

    let srv_results = match srv {
        Some(results) if !results.srv_list.is_empty() => results,
        _ => {
            // SRV empty or timed out: the A/AAAA fallback already has everything.
            return fallback;
        }
    };

    resolve_srv_targets(resolver, name, srv_results, cancel).await
}

async fn with_grace(
    srv_query: impl std::future::Future<Output = ResolverResults>,
) -> Option<ResolverResults> {
    tokio::time::timeout(SRV_GRACE, srv_query).await.ok()
}

/// Elects one SRV entry per priority, resolves each elected target's
/// A/AAAA records, and attaches them.
async fn resolve_srv_targets(
    resolver: &Resolver,
    name: &str,
    mut srv_results: ResolverResults,
    cancel: &CancelToken,
) -> ResolverResults {
    let elected = elect_srv_by_weight(&srv_results.srv_list, thread_rng_draw);

    let mut elected_with_targets = Vec::with_capacity(elected.len());
    for mut entry in elected {
        let target_results = dual::resolve(resolver, &entry.target, cancel).await;
        entry.a_results = target_results.addrinfo;
        if let Some(ttl) = target_results.ttl {
            srv_results.fold_ttl(ttl.as_secs() as u32);
        }
        elected_with_targets.push(entry);
    }

    srv_results.name = name.to_string();
    srv_results.srv_list = elected_with_targets;
    srv_results
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(priority: u16, weight: u16, target: &str) -> SrvEntry {
        SrvEntry {
            priority,
            weight,
            port: 5060,
            target: target.to_string(),
            ttl: 300,
            a_results: Vec::new(),
        }
    }

    #[test]
    fn srv_entry_constructor_sanity() {
        let e = entry(10, 0, "a.example.org");
        assert_eq!(e.priority, 10);
        assert_eq!(e.weight, 0);
    }
}
