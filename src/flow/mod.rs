//! Flow table: one [`Connection`] per live [`FiveTuple`], plus the
//! netd-resolution re-attribution mechanism described for new connections
//! created while the system resolver is still the only known owner.
//!
//! Grounded on the reference's `flow_manager`'s `HashMap<FlowKey, FlowEntry>`
//! pattern, generalized to the richer `Connection` record.

use crate::blacklist::Blacklist;
use crate::dns_lru::ReverseDnsLru;
use crate::logger::{self, BreadcrumbFlags};
use crate::model::{AppUid, Connection, FiveTuple, HostSource, L4Proto, Verdict};
use rustc_hash::FxHashMap;

/// How long a DNS-sourced netd connection's UID rewrite window stays open.
const NETD_RESOLUTION_WINDOW_MS: u64 = 3_000;

pub struct FirewallConfig<'a> {
    pub malware_blacklist: &'a Blacklist,
    pub malware_whitelist: Option<&'a Blacklist>,
    pub firewall_blocklist: Option<&'a Blacklist>,
    pub firewall_whitelist: Option<&'a Blacklist>,
    pub firewall_whitelist_mode: bool,
}

/// Runtime-mutable lists layered on top of the baseline malware blacklist:
/// a malware whitelist, a firewall blocklist/whitelist, and the
/// whitelist-mode flag. Staged via external config and applied by the
/// housekeeper on its next tick; the malware blacklist itself is swapped in
/// separately via the reload worker.
#[derive(Default)]
pub struct FirewallLists {
    pub malware_whitelist: Option<Blacklist>,
    pub firewall_blocklist: Option<Blacklist>,
    pub firewall_whitelist: Option<Blacklist>,
    pub firewall_whitelist_mode: bool,
}

impl FirewallLists {
    pub fn as_config<'a>(&'a self, malware_blacklist: &'a Blacklist) -> FirewallConfig<'a> {
        FirewallConfig {
            malware_blacklist,
            malware_whitelist: self.malware_whitelist.as_ref(),
            firewall_blocklist: self.firewall_blocklist.as_ref(),
            firewall_whitelist: self.firewall_whitelist.as_ref(),
            firewall_whitelist_mode: self.firewall_whitelist_mode,
        }
    }
}

pub struct FlowTable {
    connections: FxHashMap<FiveTuple, Connection>,
    next_id: u64,
    /// At most one active netd-resolution delay at a time, by construction:
    /// a new trigger while one is outstanding is a no-op.
    netd_delay_until_ms: Option<u64>,
    pending_netd_tuples: Vec<FiveTuple>,
}

impl FlowTable {
    pub fn new() -> Self {
        Self {
            connections: FxHashMap::default(),
            next_id: 1,
            netd_delay_until_ms: None,
            pending_netd_tuples: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn lookup(&mut self, tuple: &FiveTuple) -> Option<&mut Connection> {
        self.connections.get_mut(tuple)
    }

    pub fn contains(&self, tuple: &FiveTuple) -> bool {
        self.connections.contains_key(tuple)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&FiveTuple, &mut Connection)> {
        self.connections.iter_mut()
    }

    pub fn purge(&mut self, tuple: &FiveTuple) {
        self.connections.remove(tuple);
    }

    /// Removes every connection flagged `to_purge`, returning their ids.
    pub fn sweep_purged(&mut self) -> Vec<u64> {
        let dead: Vec<FiveTuple> = self
            .connections
            .iter()
            .filter(|(_, c)| c.to_purge)
            .map(|(t, _)| *t)
            .collect();
        let mut ids = Vec::with_capacity(dead.len());
        for tuple in dead {
            if let Some(conn) = self.connections.remove(&tuple) {
                ids.push(conn.incr_id);
            }
        }
        ids
    }

    pub fn new_connection(
        &mut self,
        tuple: FiveTuple,
        uid: AppUid,
        now_ms: u64,
        lru: &mut ReverseDnsLru,
        firewall: &FirewallConfig,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let mut conn = Connection::new(id, tuple, uid, now_ms);

        if let Some(host) = lru.find(&tuple.dst_addr) {
            conn.set_host(host, HostSource::Lru);
        }

        apply_initial_verdict(&mut conn, firewall);

        let is_dns = tuple.l4_proto == L4Proto::Udp && (tuple.dst_port == 53 || tuple.src_port == 53);
        match uid {
            AppUid::Netd if is_dns => {
                self.pending_netd_tuples.push(tuple);
                if self.netd_delay_until_ms.is_none() {
                    self.netd_delay_until_ms = Some(now_ms + NETD_RESOLUTION_WINDOW_MS);
                }
            }
            AppUid::Known(resolved_uid) if conn.host.is_some() => {
                self.note_resolved_host(resolved_uid, conn.host.as_ref().unwrap());
            }
            _ => {}
        }

        self.connections.insert(tuple, conn);
        id
    }

    /// Whenever a connection's host becomes known (at creation from the LRU,
    /// or later from DPI) and its owning app UID is resolved, rewrites any
    /// still-pending netd-attributed connection sharing that host.
    pub fn note_resolved_host(&mut self, resolved_uid: i32, host: &str) {
        let mut resolved_any = false;
        self.pending_netd_tuples.retain(|tuple| {
            let Some(pending) = self.connections.get_mut(tuple) else {
                return false;
            };
            if pending.host.as_deref() == Some(host) {
                pending.uid = AppUid::Known(resolved_uid);
                pending.pending_update |= crate::model::UpdateMask::INFO;
                logger::breadcrumb(
                    BreadcrumbFlags::FLOW,
                    format!("re-attributed netd connection on {host} to uid {resolved_uid}"),
                );
                resolved_any = true;
                false
            } else {
                true
            }
        });
        if resolved_any && self.pending_netd_tuples.is_empty() {
            self.netd_delay_until_ms = None;
        }
    }

    /// Whether the current housekeeping batch should be held back to give a
    /// pending netd resolution a chance to land first.
    pub fn notification_delay_active(&mut self, now_ms: u64) -> bool {
        match self.netd_delay_until_ms {
            Some(deadline) if now_ms >= deadline => {
                self.netd_delay_until_ms = None;
                self.pending_netd_tuples.clear();
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Re-applies initial verdict rules to every live connection, used after
    /// a blacklist/firewall list swap.
    pub fn recompute_all_verdicts(&mut self, firewall: &FirewallConfig) {
        for conn in self.connections.values_mut() {
            recompute_verdict(conn, firewall);
        }
    }
}

impl Default for FlowTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Re-evaluates verdict rules for a single connection, flagging an `INFO`
/// update if the verdict changed. Used both after a blacklist/firewall-list
/// swap and whenever DPI authoritative evidence updates `host`.
pub(crate) fn recompute_verdict(conn: &mut Connection, firewall: &FirewallConfig) {
    let before = conn.verdict;
    apply_initial_verdict(conn, firewall);
    if conn.verdict != before {
        conn.pending_update |= crate::model::UpdateMask::INFO;
    }
}

/// Rules 1-4: malware whitelist overrides malware blacklist; malware
/// blacklist sets `to_block` unless also IP/host-whitelisted; firewall
/// blocklist sets `to_block`; firewall whitelist-mode blocks anything not
/// listed, except system-resolver DNS traffic.
fn apply_initial_verdict(conn: &mut Connection, firewall: &FirewallConfig) {
    conn.verdict.remove(Verdict::BLACKLISTED_DOMAIN | Verdict::BLACKLISTED_IP | Verdict::WHITELISTED_APP | Verdict::TO_BLOCK);

    let uid = conn.uid.as_i32();
    let whitelisted_app = firewall
        .malware_whitelist
        .map(|wl| wl.match_uid(uid))
        .unwrap_or(false);
    if whitelisted_app {
        conn.verdict |= Verdict::WHITELISTED_APP;
    } else {
        let ip_hit = firewall.malware_blacklist.match_ip(&conn.tuple.dst_addr);
        let domain_hit = conn
            .host
            .as_deref()
            .map(|h| firewall.malware_blacklist.match_domain(h))
            .unwrap_or(false);
        if ip_hit || domain_hit {
            let ip_whitelisted = firewall
                .malware_whitelist
                .map(|wl| wl.match_ip(&conn.tuple.dst_addr))
                .unwrap_or(false);
            let domain_whitelisted = conn
                .host
                .as_deref()
                .and_then(|h| firewall.malware_whitelist.map(|wl| wl.match_domain(h)))
                .unwrap_or(false);
            if ip_whitelisted || domain_whitelisted {
                logger::breadcrumb(
                    BreadcrumbFlags::BLACKLIST,
                    "malware hit overridden by malware whitelist",
                );
            } else {
                if ip_hit {
                    conn.verdict |= Verdict::BLACKLISTED_IP;
                }
                if domain_hit {
                    conn.verdict |= Verdict::BLACKLISTED_DOMAIN;
                }
                conn.verdict |= Verdict::TO_BLOCK;
            }
        }
    }

    if let Some(blocklist) = firewall.firewall_blocklist {
        let hit = blocklist.match_ip(&conn.tuple.dst_addr)
            || blocklist.match_uid(uid)
            || conn.host.as_deref().map(|h| blocklist.match_domain(h)).unwrap_or(false);
        if hit {
            conn.verdict |= Verdict::TO_BLOCK;
        }
    }

    if firewall.firewall_whitelist_mode {
        let is_system_dns = conn.tuple.l4_proto == L4Proto::Udp
            && (conn.tuple.dst_port == 53 || conn.tuple.src_port == 53)
            && matches!(conn.uid, AppUid::Netd | AppUid::Unknown);
        if !is_system_dns {
            let whitelisted = firewall
                .firewall_whitelist
                .map(|wl| wl.match_uid(uid))
                .unwrap_or(false);
            if !whitelisted {
                conn.verdict |= Verdict::TO_BLOCK;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FiveTuple, L4Proto};
    use std::net::{IpAddr, Ipv4Addr};

    fn tuple(port: u16) -> FiveTuple {
        FiveTuple {
            l4_proto: L4Proto::Tcp,
            src_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            dst_addr: IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)),
            src_port: port,
            dst_port: 443,
        }
    }

    #[test]
    fn new_connection_prefills_host_from_lru() {
        let mut table = FlowTable::new();
        let mut lru = ReverseDnsLru::new(8);
        lru.add(IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)), "example.org".into());
        let bl = Blacklist::new();
        let firewall = FirewallConfig {
            malware_blacklist: &bl,
            malware_whitelist: None,
            firewall_blocklist: None,
            firewall_whitelist: None,
            firewall_whitelist_mode: false,
        };
        table.new_connection(tuple(1111), AppUid::Known(2000), 0, &mut lru, &firewall);
        let conn = table.lookup(&tuple(1111)).unwrap();
        assert_eq!(conn.host.as_deref(), Some("example.org"));
        assert_eq!(conn.host_source, HostSource::Lru);
    }

    #[test]
    fn malware_ip_hit_sets_to_block() {
        let mut table = FlowTable::new();
        let mut lru = ReverseDnsLru::new(8);
        let mut bl = Blacklist::new();
        bl.add_ip("93.184.216.34".parse().unwrap(), 32);
        let firewall = FirewallConfig {
            malware_blacklist: &bl,
            malware_whitelist: None,
            firewall_blocklist: None,
            firewall_whitelist: None,
            firewall_whitelist_mode: false,
        };
        table.new_connection(tuple(2222), AppUid::Known(2000), 0, &mut lru, &firewall);
        let conn = table.lookup(&tuple(2222)).unwrap();
        assert!(conn.verdict.contains(Verdict::BLACKLISTED_IP));
        assert!(conn.verdict.contains(Verdict::TO_BLOCK));
    }

    #[test]
    fn netd_dns_connection_is_reattributed_on_matching_host_connection() {
        let mut table = FlowTable::new();
        let mut lru = ReverseDnsLru::new(8);
        let bl = Blacklist::new();
        let firewall = FirewallConfig {
            malware_blacklist: &bl,
            malware_whitelist: None,
            firewall_blocklist: None,
            firewall_whitelist: None,
            firewall_whitelist_mode: false,
        };
        let dns_tuple = FiveTuple {
            l4_proto: L4Proto::Udp,
            src_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            dst_addr: IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
            src_port: 5000,
            dst_port: 53,
        };
        table.new_connection(dns_tuple, AppUid::Netd, 0, &mut lru, &firewall);
        table.lookup(&dns_tuple).unwrap().set_host("example.org".into(), HostSource::Dpi);

        // The app's own connection to the same host resolves to a concrete uid.
        let http_tuple = tuple(3333);
        table.new_connection(http_tuple, AppUid::Known(2000), 1, &mut lru, &firewall);
        table.lookup(&http_tuple).unwrap().set_host("example.org".into(), HostSource::Dpi);
        table.note_resolved_host(2000, "example.org");

        assert_eq!(table.lookup(&dns_tuple).unwrap().uid, AppUid::Known(2000));
    }
}
