//! S4 (spec.md §8): combined SRV + A resolution. A weight-0 SRV entry is
//! always elected over a high-weight sibling at the same priority, and the
//! folded TTL reflects the minimum across the SRV record and every A record
//! it expands to (so the combined result never caches longer than its
//! shortest-lived input).

use sip_stack_core::resolver::results::{elect_srv_by_weight, AddrInfo, ResolverResults, SrvEntry};

fn srv(priority: u16, weight: u16, target: &str, ttl: u32, addrs: Vec<AddrInfo>) -> SrvEntry {
    SrvEntry {
        priority,
        weight,
        port: 5060,
        target: target.to_string(),
        ttl,
        a_results: addrs,
    }
}

fn addr(ip: &str, ttl: u32) -> AddrInfo {
    AddrInfo { addr: ip.parse().unwrap(), port: 5060, ttl }
}

#[test]
fn weight_zero_wins_regardless_of_the_random_draw() {
    let low_priority_zero_weight = srv(10, 0, "primary.example.org", 300, vec![addr("192.0.2.1", 300)]);
    let low_priority_heavy_weight = srv(10, 100, "backup.example.org", 300, vec![addr("192.0.2.2", 300)]);
    let entries = vec![low_priority_zero_weight, low_priority_heavy_weight];

    for draw_value in [0u32, 1, 50, 99, 100] {
        let elected = elect_srv_by_weight(&entries, move |_sum| draw_value);
        assert_eq!(elected.len(), 1);
        assert_eq!(
            elected[0].target, "primary.example.org",
            "a weight-0 entry must win for any draw ({draw_value})"
        );
    }
}

#[test]
fn combined_ttl_is_the_minimum_across_srv_and_its_a_records() {
    let mut results = ResolverResults::empty("_sip._udp.example.org");

    let entry = srv(
        10,
        50,
        "target.example.org",
        300,
        vec![addr("192.0.2.10", 120), addr("192.0.2.11", 600)],
    );

    results.fold_ttl(entry.ttl);
    for a in &entry.a_results {
        results.fold_ttl(a.ttl);
    }

    assert_eq!(results.ttl, Some(std::time::Duration::from_secs(120)));
}

#[test]
fn higher_priority_group_is_never_elected_over_a_lower_one() {
    let entries = vec![
        srv(10, 0, "primary.example.org", 300, vec![]),
        srv(20, 100, "fallback.example.org", 300, vec![]),
    ];
    let elected = elect_srv_by_weight(&entries, |sum| sum.saturating_sub(1));
    assert_eq!(elected.len(), 2, "one representative per priority group");
    assert_eq!(elected[0].priority, 10);
    assert_eq!(elected[0].target, "primary.example.org");
    assert_eq!(elected[1].priority, 20);
}
