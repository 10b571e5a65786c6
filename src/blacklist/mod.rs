//! Composite membership oracle: exact/one-level-suffix domains, a CIDR set,
//! app UIDs, and ISO-3166 country codes, each independently insertable and
//! independently matchable.
//!
//! Grounded on the reference's `core/blacklist.c`.

mod cidr;
pub mod reload;

use crate::error::RuleParseError;
use cidr::CidrSet;
use rustc_hash::FxHashSet;
use std::net::IpAddr;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddOutcome {
    Ok,
    AlreadyPresent,
    Invalid,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BlacklistStats {
    pub num_lists: u64,
    pub num_domains: u64,
    pub num_ips: u64,
    pub num_uids: u64,
    pub num_countries: u64,
    pub num_failed: u64,
}

/// Per-file outcome published alongside a reload, distinct from the
/// cumulative [`BlacklistStats`]: duplicates are tallied locally but counted
/// in neither `rules_ok` nor `rules_failed`, matching the reference.
#[derive(Clone, Debug, Default)]
pub struct LoadOutcome {
    pub name: String,
    pub rules_ok: u64,
    pub rules_failed: u64,
    pub rules_duplicate: u64,
}

#[derive(Default)]
pub struct Blacklist {
    domains: FxHashSet<String>,
    ips: CidrSet,
    uids: FxHashSet<i32>,
    countries: FxHashSet<[u8; 2]>,
    stats: BlacklistStats,
}

impl Blacklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> BlacklistStats {
        self.stats
    }

    pub fn add_domain(&mut self, domain: &str) -> AddOutcome {
        let stripped = strip_www(domain);
        if stripped.is_empty() {
            self.stats.num_failed += 1;
            return AddOutcome::Invalid;
        }
        if self.match_domain(stripped) {
            return AddOutcome::AlreadyPresent;
        }
        self.domains.insert(stripped.to_ascii_lowercase());
        self.stats.num_domains += 1;
        AddOutcome::Ok
    }

    pub fn add_ip(&mut self, addr: IpAddr, prefix_bits: u8) -> AddOutcome {
        let max_bits = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix_bits > max_bits {
            self.stats.num_failed += 1;
            return AddOutcome::Invalid;
        }
        if is_skipped_sentinel(&addr, prefix_bits) {
            // Silently skipped: not ok, not failed, not duplicate.
            return AddOutcome::Ok;
        }
        match self.ips.insert(addr, prefix_bits) {
            AddOutcome::Ok => {
                self.stats.num_ips += 1;
                AddOutcome::Ok
            }
            other @ AddOutcome::AlreadyPresent => other,
            other => {
                self.stats.num_failed += 1;
                other
            }
        }
    }

    /// Parses `ADDR[/bits]`, defaulting to a full-host prefix when `/bits`
    /// is absent.
    pub fn add_ip_str(&mut self, text: &str) -> Result<AddOutcome, RuleParseError> {
        let (addr_part, prefix_part) = match text.split_once('/') {
            Some((a, b)) => (a, Some(b)),
            None => (text, None),
        };
        let addr: IpAddr = addr_part
            .trim()
            .parse()
            .map_err(|_| RuleParseError::NotAnAddress(text.to_string()))?;
        let default_bits = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let bits = match prefix_part {
            Some(p) => p
                .trim()
                .parse::<u8>()
                .map_err(|_| RuleParseError::InvalidPrefix(0))?,
            None => default_bits,
        };
        Ok(self.add_ip(addr, bits))
    }

    pub fn add_uid(&mut self, uid: i32) -> AddOutcome {
        if self.uids.insert(uid) {
            self.stats.num_uids += 1;
            AddOutcome::Ok
        } else {
            AddOutcome::AlreadyPresent
        }
    }

    pub fn add_country(&mut self, code: &str) -> AddOutcome {
        let normalized = normalize_country(code);
        let Some(normalized) = normalized else {
            self.stats.num_failed += 1;
            return AddOutcome::Invalid;
        };
        if self.countries.insert(normalized) {
            self.stats.num_countries += 1;
            AddOutcome::Ok
        } else {
            AddOutcome::AlreadyPresent
        }
    }

    /// Exact match on the (`www.`-stripped) domain; on a miss, if the domain
    /// has a distinct one-level suffix (at least 3 labels), tries that once.
    /// Never recurses further.
    pub fn match_domain(&self, domain: &str) -> bool {
        let stripped = strip_www(domain).to_ascii_lowercase();
        if self.domains.contains(&stripped) {
            return true;
        }
        let suffix = second_level_domain(&stripped);
        if suffix != stripped && self.domains.contains(suffix) {
            return true;
        }
        false
    }

    pub fn match_ip(&self, addr: &IpAddr) -> bool {
        self.ips.contains(addr)
    }

    pub fn match_uid(&self, uid: i32) -> bool {
        self.uids.contains(&uid)
    }

    pub fn match_country(&self, code: &str) -> bool {
        match normalize_country(code) {
            Some(code) => self.countries.contains(&code),
            None => false,
        }
    }

    pub fn record_load(&mut self, outcome: &LoadOutcome) {
        self.stats.num_lists += 1;
        self.stats.num_failed += outcome.rules_failed;
    }
}

fn strip_www(domain: &str) -> &str {
    if domain.len() > 4 && domain[..4].eq_ignore_ascii_case("www.") {
        &domain[4..]
    } else {
        domain
    }
}

/// Returns the substring starting just past the first label of a domain
/// with >= 3 labels (e.g. `a.b.example.com` -> `b.example.com`... applied
/// once more by the caller only via a fresh call, matching the reference's
/// single non-recursive fallback). When fewer than 3 labels are present,
/// returns the input unchanged.
fn second_level_domain(domain: &str) -> &str {
    let Some(last_dot) = domain.rfind('.') else {
        return domain;
    };
    if last_dot == 0 {
        return domain;
    }
    let Some(prior_dot) = domain[..last_dot].rfind('.') else {
        return domain;
    };
    &domain[prior_dot + 1..]
}

fn normalize_country(code: &str) -> Option<[u8; 2]> {
    let trimmed = code.trim();
    if trimmed.len() != 2 || !trimmed.is_ascii() {
        return None;
    }
    let upper = trimmed.to_ascii_uppercase();
    let bytes = upper.as_bytes();
    Some([bytes[0], bytes[1]])
}

fn is_skipped_sentinel(addr: &IpAddr, prefix_bits: u8) -> bool {
    if prefix_bits != 32 {
        return false;
    }
    match addr {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            octets == [0, 0, 0, 0] || octets == [255, 255, 255, 255] || octets == [127, 0, 0, 1]
        }
        IpAddr::V6(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_match_includes_www_variant() {
        let mut bl = Blacklist::new();
        assert_eq!(bl.add_domain("example.org"), AddOutcome::Ok);
        assert!(bl.match_domain("example.org"));
        assert!(bl.match_domain("www.example.org"));
    }

    #[test]
    fn duplicate_domain_add_reports_already_present() {
        let mut bl = Blacklist::new();
        bl.add_domain("example.org");
        assert_eq!(bl.add_domain("example.org"), AddOutcome::AlreadyPresent);
        assert_eq!(bl.add_domain("www.example.org"), AddOutcome::AlreadyPresent);
    }

    #[test]
    fn one_level_suffix_fallback_matches_subdomain() {
        let mut bl = Blacklist::new();
        bl.add_domain("evil.com");
        assert!(bl.match_domain("sub.evil.com"));
        // Falls back to the same one-level suffix regardless of extra depth.
        assert!(bl.match_domain("deep.sub.evil.com"));
    }

    #[test]
    fn sentinel_ipv4_addresses_are_silently_skipped() {
        let mut bl = Blacklist::new();
        assert_eq!(
            bl.add_ip_str("0.0.0.0/32").unwrap(),
            AddOutcome::Ok
        );
        assert_eq!(
            bl.add_ip_str("255.255.255.255/32").unwrap(),
            AddOutcome::Ok
        );
        assert_eq!(bl.add_ip_str("127.0.0.1/32").unwrap(), AddOutcome::Ok);
        assert_eq!(bl.stats().num_ips, 0);
        assert!(!bl.match_ip(&"127.0.0.1".parse().unwrap()));
    }

    #[test]
    fn uid_and_country_membership() {
        let mut bl = Blacklist::new();
        assert_eq!(bl.add_uid(1000), AddOutcome::Ok);
        assert_eq!(bl.add_uid(1000), AddOutcome::AlreadyPresent);
        assert!(bl.match_uid(1000));
        assert_eq!(bl.add_country("it"), AddOutcome::Ok);
        assert!(bl.match_country("IT"));
        assert!(!bl.match_country("fr"));
    }
}
