//! §4.3 "Dual": A and AAAA fanned out in parallel; if A returns first and is
//! non-empty, AAAA gets a bounded grace period (default 3000 ms) before the
//! combined result is delivered without it.

use std::time::Duration;

use super::simple::{self, RecordKind};
use super::{CancelToken, Resolver, ResolverResults};

const AAAA_GRACE: Duration = Duration::from_millis(3000);

pub async fn resolve(resolver: &Resolver, name: &str, cancel: &CancelToken) -> ResolverResults {
    let a_query = simple::resolve(resolver, name, RecordKind::A, cancel);
    let aaaa_query = simple::resolve(resolver, name, RecordKind::Aaaa, cancel);

    let (mut a, aaaa) = tokio::join!(a_query, race_with_grace(aaaa_query));

    if cancel.is_cancelled() {
        return ResolverResults::empty(name);
    }

    a.srv_list = aaaa.srv_list;
    a.addrinfo.extend(aaaa.addrinfo);
    a.ttl = match (a.ttl, aaaa.ttl) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (Some(x), None) => Some(x),
        (None, y) => y,
    };
    a
}

/// Gives the AAAA query up to `AAAA_GRACE` to complete; an AAAA that times
/// out here just contributes nothing, since the combined result already
/// has A to offer.
async fn race_with_grace(
    aaaa_query: impl std::future::Future<Output = ResolverResults>,
) -> ResolverResults {
    match tokio::time::timeout(AAAA_GRACE, aaaa_query).await {
        Ok(results) => results,
        Err(_elapsed) => ResolverResults::default(),
    }
}
