//! `ResolverResults` and the SRV weighted election (RFC 2782), ported from
//! belle-sip's `srv_select_by_weight`/`srv_elect_one` (§4.3).

use std::net::IpAddr;
use std::time::Duration;

/// One resolved address, carrying its own record TTL so the combined
/// resolver can fold a `min_ttl` across every record it used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrInfo {
    pub addr: IpAddr,
    pub port: u16,
    pub ttl: u32,
}

/// One SRV record, with its resolved targets attached after the follow-up
/// A/AAAA queries complete. `a_results` is empty until the combined resolver
/// has resolved `target`.
#[derive(Debug, Clone)]
pub struct SrvEntry {
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    pub target: String,
    pub ttl: u32,
    pub a_results: Vec<AddrInfo>,
}

/// The outcome every resolver context variant eventually produces (§4.3
/// "callers receive a `ResolverResults`").
#[derive(Debug, Clone, Default)]
pub struct ResolverResults {
    pub name: String,
    pub addrinfo: Vec<AddrInfo>,
    pub srv_list: Vec<SrvEntry>,
    pub ttl: Option<Duration>,
}

impl ResolverResults {
    pub fn empty(name: impl Into<String>) -> Self {
        ResolverResults {
            name: name.into(),
            addrinfo: Vec::new(),
            srv_list: Vec::new(),
            ttl: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.addrinfo.is_empty() && self.srv_list.is_empty()
    }

    /// Folds a newly observed record TTL into the running minimum.
    pub fn fold_ttl(&mut self, ttl_secs: u32) {
        let candidate = Duration::from_secs(ttl_secs as u64);
        self.ttl = Some(match self.ttl {
            Some(current) => current.min(candidate),
            None => candidate,
        });
    }
}

/// Elects one representative SRV entry per priority group, in ascending
/// priority order (RFC 2782 weighted election).
///
/// Within a priority group, entries with weight 0 are pre-placed first
/// (belle-sip's `srv_sort_weight`: "0 weighted must just appear first"),
/// then one entry is picked with probability proportional to its weight
/// using the supplied `rand_in_range` draw, exactly as belle-sip's
/// `srv_elect_one` walks the cumulative-weight list.
pub fn elect_srv_by_weight(
    entries: &[SrvEntry],
    mut rand_in_range: impl FnMut(u32) -> u32,
) -> Vec<SrvEntry> {
    let mut by_priority: Vec<u16> = entries.iter().map(|e| e.priority).collect();
    by_priority.sort_unstable();
    by_priority.dedup();

    let mut result = Vec::with_capacity(by_priority.len());
    for priority in by_priority {
        let mut group: Vec<SrvEntry> = entries
            .iter()
            .filter(|e| e.priority == priority)
            .cloned()
            .collect();
        // weight-0 entries sort first within the group, matching belle-sip.
        group.sort_by_key(|e| if e.weight == 0 { 0 } else { 1 });
        if let Some(elected) = elect_one(&group, &mut rand_in_range) {
            result.push(elected);
        }
    }
    result
}

fn elect_one(group: &[SrvEntry], rand_in_range: &mut impl FnMut(u32) -> u32) -> Option<SrvEntry> {
    if group.is_empty() {
        return None;
    }
    let sum: u32 = group.iter().map(|e| e.weight as u32).sum();
    if sum == 0 {
        return Some(group[0].clone());
    }
    let draw = rand_in_range(sum);
    let mut cumulative = 0u32;
    for entry in group {
        cumulative += entry.weight as u32;
        if draw <= cumulative {
            return Some(entry.clone());
        }
    }
    Some(group[0].clone())
}

/// Draws from `rand::thread_rng`, the production RNG source.
pub fn thread_rng_draw(sum: u32) -> u32 {
    use rand::Rng;
    rand::thread_rng().gen_range(0..sum)
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
    fn weight_zero_entry_always_wins_against_zero_draw() {
        let entries = vec![entry(10, 0, "a.example.org"), entry(10, 100, "b.example.org")];
        // draw() always returning 0 should still land on the weight-0 entry
        // since it's pre-placed first and sum > 0 walks from there.
        let elected = elect_srv_by_weight(&entries, |_sum| 0);
        assert_eq!(elected.len(), 1);
        assert_eq!(elected[0].target, "a.example.org");
    }

    #[test]
    fn one_representative_per_priority_group() {
        let entries = vec![
            entry(10, 50, "a.example.org"),
            entry(10, 50, "b.example.org"),
            entry(20, 10, "c.example.org"),
        ];
        let elected = elect_srv_by_weight(&entries, |sum| sum.saturating_sub(1));
        assert_eq!(elected.len(), 2);
        assert_eq!(elected[0].priority, 10);
        assert_eq!(elected[1].priority, 20);
    }

    #[test]
    fn all_zero_weight_returns_first_without_drawing() {
        let entries = vec![entry(10, 0, "a.example.org"), entry(10, 0, "b.example.org")];
        let elected = elect_srv_by_weight(&entries, |_| panic!("must not draw when sum == 0"));
        assert_eq!(elected[0].target, "a.example.org");
    }

    #[test]
    fn min_ttl_folds_across_records() {
        let mut results = ResolverResults::empty("sip.example.org");
        results.fold_ttl(300);
        results.fold_ttl(60);
        results.fold_ttl(600);
        assert_eq!(results.ttl, Some(Duration::from_secs(60)));
    }
}
