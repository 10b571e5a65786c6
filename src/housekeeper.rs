//! Scheduled batch emission: stats, connection deltas, PCAPNG flush,
//! blacklist reload service, and external config application. Notification
//! batching is deferred outside the flow table's borrow, so the sink never
//! runs while other packet processing could be blocked on it.
//!
//! Grounded on the reference's `CallbackBatch` deferred-execution pattern.

use crate::blacklist::reload::{self, ReloadOutcome, RuleSource, SourceKind};
use crate::blacklist::{Blacklist, LoadOutcome};
use crate::flow::{FirewallLists, FlowTable};
use crate::interfaces::EngineSink;
use crate::logger::{self, BreadcrumbFlags};
use crate::pcapng::Dumper;
use smallvec::SmallVec;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use tokio::sync::oneshot;

#[derive(Clone, Copy, Debug, Default)]
pub struct StatsSnapshot {
    pub active_connections: usize,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub dump_size: u64,
}

#[derive(Default)]
struct NotificationBatch {
    new_connections: SmallVec<[u64; 8]>,
    updated_connections: SmallVec<[u64; 8]>,
}

pub struct Housekeeper {
    stats_interval_ms: u64,
    batch_interval_ms: u64,
    last_stats_ms: u64,
    last_batch_ms: u64,
    pending: NotificationBatch,
    reload_rx: Option<oneshot::Receiver<ReloadOutcome>>,
    reload_requested: bool,
    reload_sources: Vec<(PathBuf, SourceKind)>,
    blacklist_max_file_rules: u64,
    pending_firewall: Option<FirewallLists>,
}

impl Housekeeper {
    pub fn new(stats_interval_ms: u64, batch_interval_ms: u64) -> Self {
        Self {
            stats_interval_ms,
            batch_interval_ms,
            last_stats_ms: 0,
            last_batch_ms: 0,
            pending: NotificationBatch::default(),
            reload_rx: None,
            reload_requested: false,
            reload_sources: Vec::new(),
            blacklist_max_file_rules: u64::MAX,
            pending_firewall: None,
        }
    }

    pub fn note_new_connection(&mut self, id: u64) {
        self.pending.new_connections.push(id);
    }

    pub fn note_updated_connection(&mut self, id: u64) {
        self.pending.updated_connections.push(id);
    }

    /// Configures which files feed a future reload and the per-file rule cap.
    /// Call once at startup and again whenever the configured source list
    /// changes; does not itself trigger a reload.
    pub fn set_reload_sources(&mut self, sources: Vec<(PathBuf, SourceKind)>, max_file_rules: u64) {
        self.reload_sources = sources;
        self.blacklist_max_file_rules = max_file_rules;
    }

    pub fn request_blacklist_reload(&mut self) {
        self.reload_requested = true;
    }

    pub fn set_reload_receiver(&mut self, rx: oneshot::Receiver<ReloadOutcome>) {
        self.reload_rx = Some(rx);
        self.reload_requested = false;
    }

    pub fn reload_in_progress(&self) -> bool {
        self.reload_rx.is_some()
    }

    pub fn should_launch_reload(&self) -> bool {
        self.reload_requested && self.reload_rx.is_none()
    }

    /// Stages a new malware-whitelist / firewall-blocklist / firewall-
    /// whitelist object and whitelist-mode flag, received from external
    /// config. Applied on the next tick (item 5); does not itself recompute
    /// any verdict.
    pub fn stage_firewall_lists(&mut self, lists: FirewallLists) {
        self.pending_firewall = Some(lists);
    }

    /// Opens the configured source files and spawns the background rebuild.
    /// Files that fail to open are logged and skipped rather than failing
    /// the whole reload.
    fn launch_reload(&mut self) {
        let mut sources = Vec::with_capacity(self.reload_sources.len());
        for (path, kind) in &self.reload_sources {
            match File::open(path) {
                Ok(file) => sources.push(RuleSource {
                    name: path.display().to_string(),
                    kind: *kind,
                    reader: BufReader::new(file),
                }),
                Err(err) => {
                    logger::warn(format!("skipping unreadable blacklist source {}: {err}", path.display()));
                }
            }
        }
        let rx = reload::spawn_reload(sources, self.blacklist_max_file_rules);
        self.set_reload_receiver(rx);
    }

    /// Runs the housekeeper's ordered responsibilities once. Items 1-4 are a
    /// single exclusive chain — only the first applicable one fires per
    /// tick; item 5 (apply pending firewall-list config) always runs.
    /// Returns bytes flushed from the dumper, if any, for the caller to hand
    /// to `dump_callback`.
    #[allow(clippy::too_many_arguments)]
    pub fn tick(
        &mut self,
        now_ms: u64,
        flows: &mut FlowTable,
        dumper: &mut Dumper,
        blacklist: &mut Blacklist,
        firewall: &mut FirewallLists,
        sink: &dyn EngineSink,
        stats_dirty: bool,
    ) -> Option<Vec<u8>> {
        let flushed = if stats_dirty || now_ms.saturating_sub(self.last_stats_ms) >= self.stats_interval_ms {
            self.emit_stats(now_ms, flows, dumper, sink);
            None
        } else if now_ms.saturating_sub(self.last_batch_ms) >= self.batch_interval_ms
            && !flows.notification_delay_active(now_ms)
        {
            self.emit_connection_deltas(now_ms, flows, sink);
            None
        } else if let Some(bytes) = dumper.check_export(now_ms) {
            Some(bytes)
        } else {
            self.service_reload(blacklist, firewall, flows, sink);
            None
        };

        self.apply_pending_firewall(firewall, flows, blacklist);

        flushed
    }

    fn apply_pending_firewall(&mut self, firewall: &mut FirewallLists, flows: &mut FlowTable, blacklist: &Blacklist) {
        if let Some(pending) = self.pending_firewall.take() {
            *firewall = pending;
            flows.recompute_all_verdicts(&firewall.as_config(blacklist));
            logger::breadcrumb(BreadcrumbFlags::HOUSEKEEPER, "firewall lists applied from external config");
        }
    }

    fn emit_stats(&mut self, now_ms: u64, flows: &mut FlowTable, dumper: &Dumper, sink: &dyn EngineSink) {
        let mut bytes_sent = 0u64;
        let mut bytes_received = 0u64;
        for (_, conn) in flows.iter_mut() {
            bytes_sent += conn.sent.bytes;
            bytes_received += conn.received.bytes;
        }
        let snapshot = StatsSnapshot {
            active_connections: flows.len(),
            bytes_sent,
            bytes_received,
            dump_size: dumper.dump_size(),
        };
        sink.notify_stats(&snapshot);
        self.last_stats_ms = now_ms;
    }

    fn emit_connection_deltas(&mut self, now_ms: u64, flows: &mut FlowTable, sink: &dyn EngineSink) {
        if self.pending.new_connections.is_empty() && self.pending.updated_connections.is_empty() {
            self.last_batch_ms = now_ms;
            return;
        }
        sink.notify_connections(&self.pending.new_connections, &self.pending.updated_connections);
        self.pending.new_connections.clear();
        self.pending.updated_connections.clear();
        flows.sweep_purged();
        self.last_batch_ms = now_ms;
    }

    fn service_reload(&mut self, blacklist: &mut Blacklist, firewall: &FirewallLists, flows: &mut FlowTable, sink: &dyn EngineSink) {
        if self.should_launch_reload() {
            self.launch_reload();
        }
        if let Some(rx) = &mut self.reload_rx {
            match rx.try_recv() {
                Ok(outcome) => {
                    *blacklist = outcome.blacklist;
                    self.reload_rx = None;
                    publish_load_outcomes(&outcome.per_file, sink);
                    logger::breadcrumb(BreadcrumbFlags::HOUSEKEEPER, "blacklist swapped in after reload");
                    flows.recompute_all_verdicts(&firewall.as_config(blacklist));
                }
                Err(oneshot::error::TryRecvError::Empty) => {}
                Err(oneshot::error::TryRecvError::Closed) => {
                    logger::warn("blacklist reload worker dropped without a result");
                    self.reload_rx = None;
                }
            }
        }
    }
}

fn publish_load_outcomes(per_file: &[LoadOutcome], sink: &dyn EngineSink) {
    sink.notify_blacklists_loaded(per_file);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        stats_calls: Mutex<u32>,
        conn_batches: Mutex<Vec<(Vec<u64>, Vec<u64>)>>,
    }

    impl EngineSink for RecordingSink {
        fn dump_callback(&self, _bytes: &[u8]) {}
        fn notify_connections(&self, new_conns: &[u64], updated_conns: &[u64]) {
            self.conn_batches
                .lock()
                .unwrap()
                .push((new_conns.to_vec(), updated_conns.to_vec()));
        }
        fn notify_stats(&self, _snapshot: &StatsSnapshot) {
            *self.stats_calls.lock().unwrap() += 1;
        }
        fn notify_blacklists_loaded(&self, _per_file: &[LoadOutcome]) {}
        fn notify_service_status(&self, _started: bool) {}
        fn dump_payload_chunk(&self, _conn_id: u64, _is_client_to_server: bool, _chunk: &[u8]) {}
    }

    #[test]
    fn stats_emitted_before_connection_batch_on_first_tick() {
        let mut hk = Housekeeper::new(300, 1000);
        let mut flows = FlowTable::new();
        let config = EngineConfig::default();
        let mut dumper = Dumper::new(&config);
        let mut bl = Blacklist::new();
        let mut firewall = FirewallLists::default();
        let sink = RecordingSink::default();

        hk.note_new_connection(1);
        hk.tick(0, &mut flows, &mut dumper, &mut bl, &mut firewall, &sink, true);
        assert_eq!(*sink.stats_calls.lock().unwrap(), 1);
        assert!(sink.conn_batches.lock().unwrap().is_empty());
    }

    #[test]
    fn connection_batch_emitted_after_interval() {
        // A high stats interval keeps item 1 from preempting item 2 at
        // `now_ms = 1000`; the chain is exclusive, so only one item fires.
        let mut hk = Housekeeper::new(10_000, 1000);
        let mut flows = FlowTable::new();
        let config = EngineConfig::default();
        let mut dumper = Dumper::new(&config);
        let mut bl = Blacklist::new();
        let mut firewall = FirewallLists::default();
        let sink = RecordingSink::default();

        hk.note_new_connection(7);
        hk.tick(1000, &mut flows, &mut dumper, &mut bl, &mut firewall, &sink, false);
        let batches = sink.conn_batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].0, vec![7]);
        assert_eq!(*sink.stats_calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn reload_is_launched_and_swapped_from_a_configured_file() {
        // High stats/batch intervals so items 1-2 never preempt item 4
        // across the polling loop below.
        let mut hk = Housekeeper::new(10_000, 10_000);
        let mut flows = FlowTable::new();
        let config = EngineConfig::default();
        let mut dumper = Dumper::new(&config);
        let mut bl = Blacklist::new();
        let mut firewall = FirewallLists::default();
        let sink = RecordingSink::default();

        let mut path = std::env::temp_dir();
        path.push(format!("pcapcore-housekeeper-test-{}.txt", std::process::id()));
        std::fs::write(&path, "evil.example\n").unwrap();

        hk.set_reload_sources(vec![(path.clone(), SourceKind::Domain)], 1000);
        hk.request_blacklist_reload();

        for _ in 0..50 {
            hk.tick(0, &mut flows, &mut dumper, &mut bl, &mut firewall, &sink, false);
            if !hk.reload_in_progress() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        assert!(bl.match_domain("evil.example"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn pending_firewall_lists_are_applied_and_recompute_verdicts() {
        let mut hk = Housekeeper::new(10_000, 10_000);
        let mut flows = FlowTable::new();
        let config = EngineConfig::default();
        let mut dumper = Dumper::new(&config);
        let mut bl = Blacklist::new();
        let mut firewall = FirewallLists::default();
        let sink = RecordingSink::default();

        let mut lru = crate::dns_lru::ReverseDnsLru::new(8);
        let tuple = crate::model::FiveTuple {
            l4_proto: crate::model::L4Proto::Tcp,
            src_addr: "10.0.0.2".parse().unwrap(),
            dst_addr: "93.184.216.34".parse().unwrap(),
            src_port: 4000,
            dst_port: 443,
        };
        flows.new_connection(
            tuple,
            crate::model::AppUid::Known(7000),
            0,
            &mut lru,
            &firewall.as_config(&bl),
        );
        assert!(!flows.lookup(&tuple).unwrap().verdict.contains(crate::model::Verdict::WHITELISTED_APP));

        let mut whitelist = Blacklist::new();
        whitelist.add_uid(7000);
        hk.stage_firewall_lists(crate::flow::FirewallLists {
            malware_whitelist: Some(whitelist),
            firewall_blocklist: None,
            firewall_whitelist: None,
            firewall_whitelist_mode: false,
        });

        hk.tick(0, &mut flows, &mut dumper, &mut bl, &mut firewall, &sink, false);

        assert!(flows.lookup(&tuple).unwrap().verdict.contains(crate::model::Verdict::WHITELISTED_APP));
    }
}
