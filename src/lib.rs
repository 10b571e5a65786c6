//! Flow-centric packet classification and capture core.
//!
//! Consumers supply a [`PacketSource`], a [`UidResolver`], a [`DpiEngine`],
//! and an [`EngineSink`]; this crate owns the flow table, the reverse-DNS
//! LRU, the blacklist subsystem, the PCAPNG dumper, and the housekeeping
//! loop that ties them together.

pub mod blacklist;
pub mod config;
pub mod dns_lru;
pub mod dpi;
pub mod error;
pub mod flow;
pub mod housekeeper;
pub mod interfaces;
pub mod logger;
pub mod model;
pub mod pcapng;

use blacklist::Blacklist;
use config::EngineConfig;
use dns_lru::ReverseDnsLru;
use flow::{FirewallLists, FlowTable};
use housekeeper::Housekeeper;
use interfaces::{DpiEngine, EngineSink, UidResolver};
use logger::BreadcrumbFlags;
use model::{AppUid, FiveTuple, UpdateMask};
use pcapng::{Dumper, Interface, UidNames};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Top-level engine. Construct once per capture run via [`Engine::new`].
pub struct Engine<D: DpiEngine> {
    config: EngineConfig,
    running: AtomicBool,
    flows: FlowTable,
    lru: ReverseDnsLru,
    malware_blacklist: Blacklist,
    firewall: FirewallLists,
    housekeeper: Housekeeper,
    dumper: Dumper,
    dpi: D,
    dpi_states: rustc_hash::FxHashMap<FiveTuple, D::State>,
    uid_resolver: Arc<dyn UidResolver>,
    sink: Arc<dyn EngineSink>,
}

impl<D: DpiEngine> Engine<D> {
    pub fn new(
        config: EngineConfig,
        dpi: D,
        uid_resolver: Arc<dyn UidResolver>,
        sink: Arc<dyn EngineSink>,
    ) -> anyhow::Result<Self> {
        let dumper = Dumper::new(&config);
        let housekeeper = Housekeeper::new(config.stats_interval_ms, config.connection_batch_interval_ms);
        Ok(Self {
            running: AtomicBool::new(false),
            lru: ReverseDnsLru::new(config.dns_lru_capacity),
            flows: FlowTable::new(),
            malware_blacklist: Blacklist::new(),
            firewall: FirewallLists::default(),
            housekeeper,
            dumper,
            dpi,
            dpi_states: rustc_hash::FxHashMap::default(),
            uid_resolver,
            sink,
            config,
        })
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        self.sink.notify_service_status(true);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.sink.notify_service_status(false);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Preamble bytes for the configured dump format; write once at the
    /// start of the output stream.
    pub fn dump_preamble(&self) -> Vec<u8> {
        self.dumper.preamble()
    }

    /// Processes one already-parsed packet through the full pipeline:
    /// flow lookup/create, DPI feed, blacklist/firewall verdict refresh,
    /// accounting, and an opportunistic PCAPNG write.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_packet(
        &mut self,
        tuple: FiveTuple,
        payload: &[u8],
        is_client_to_server: bool,
        ts_us: u64,
        now_ms: u64,
        ifindex: Option<i32>,
    ) {
        let firewall = self.firewall.as_config(&self.malware_blacklist);

        let is_new = !self.flows.contains(&tuple);
        if is_new {
            let uid = self
                .uid_resolver
                .resolve(&tuple)
                .map(AppUid::Known)
                .unwrap_or(AppUid::Unknown);
            let id = self
                .flows
                .new_connection(tuple, uid, now_ms, &mut self.lru, &firewall);
            self.housekeeper.note_new_connection(id);
            logger::breadcrumb(BreadcrumbFlags::FLOW, format!("new flow {id}"));
        }

        let dpi_state = self.dpi_states.entry(tuple).or_default();
        let mut gave_up = false;
        let mut resolved_host = None;
        let mut conn_uid = AppUid::Unknown;

        if let Some(conn) = self.flows.lookup(&tuple) {
            conn_uid = conn.uid;
            if payload.is_empty() {
                conn.record_bytes(0, 0, now_ms);
            } else if is_client_to_server {
                conn.record_bytes(payload.len() as u64, 0, now_ms);
            } else {
                conn.record_bytes(0, payload.len() as u64, now_ms);
            }

            if !conn.dpi_done && !payload.is_empty() {
                gave_up = dpi::feed(
                    &self.dpi,
                    dpi_state,
                    conn,
                    payload,
                    is_client_to_server,
                    self.config.dpi_max_packets_per_flow,
                    &mut self.lru,
                    &firewall,
                    self.config.payload_capture,
                    self.sink.as_ref(),
                );
            }
            if conn.host_source == model::HostSource::Dpi {
                resolved_host = conn.host.clone();
            }
            if !conn.pending_update.is_empty() {
                conn.pending_update = UpdateMask::empty();
                self.housekeeper.note_updated_connection(conn.incr_id);
            }
        }

        if gave_up {
            self.dpi_states.remove(&tuple);
        }

        if let (Some(host), AppUid::Known(uid)) = (resolved_host, conn_uid) {
            self.flows.note_resolved_host(uid, &host);
        }

        let uid_names = match conn_uid {
            AppUid::Known(uid) => self.uid_resolver.resolve_name(uid),
            AppUid::Netd | AppUid::Unknown => None,
        };
        let uid_names_ref = uid_names
            .as_ref()
            .map(|(pkg, app)| UidNames {
                uid: conn_uid.as_i32(),
                package_name: pkg,
                app_name: app,
            });
        let iface = ifindex.map(|idx| Interface { os_ifindex: idx, name: None });
        match self
            .dumper
            .dump_packet(payload, ts_us, conn_uid.as_i32(), uid_names_ref.as_ref(), iface.as_ref())
        {
            pcapng::DumpOutcome::Written(Some(bytes)) => self.sink.dump_callback(&bytes),
            pcapng::DumpOutcome::Written(None) => {}
            pcapng::DumpOutcome::Full => {
                logger::warn("pcapng dump size cap reached");
            }
        }

        self.run_housekeeping(now_ms, false);
    }

    /// Drives the housekeeper's scheduled responsibilities. Call this after
    /// every packet and periodically when idle, per the housekeeping
    /// contract.
    pub fn run_housekeeping(&mut self, now_ms: u64, stats_dirty: bool) {
        if let Some(flushed) = self.housekeeper.tick(
            now_ms,
            &mut self.flows,
            &mut self.dumper,
            &mut self.malware_blacklist,
            &mut self.firewall,
            self.sink.as_ref(),
            stats_dirty,
        ) {
            self.sink.dump_callback(&flushed);
        }
    }

    pub fn dump_secret(&self, secret: &[u8]) -> bool {
        self.dumper.dump_secret(secret)
    }

    /// Stages a new malware-whitelist / firewall-blocklist / firewall-
    /// whitelist object and whitelist-mode flag, received from external
    /// config. Applied on the engine's next housekeeping tick.
    pub fn set_firewall_lists(&mut self, lists: FirewallLists) {
        self.housekeeper.stage_firewall_lists(lists);
    }

    /// Configures which files feed a future reload. Does not itself trigger
    /// one; call [`Engine::request_blacklist_reload`] to launch a rebuild on
    /// the next housekeeping tick.
    pub fn set_blacklist_sources(&mut self, sources: Vec<(std::path::PathBuf, blacklist::reload::SourceKind)>) {
        self.housekeeper
            .set_reload_sources(sources, self.config.blacklist_max_file_rules);
    }

    pub fn request_blacklist_reload(&mut self) {
        self.housekeeper.request_blacklist_reload();
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    /// Flushes and releases all dumper state; call once at shutdown.
    pub fn shutdown_dumper(&mut self) -> Option<Vec<u8>> {
        self.dumper.destroy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::{DpiFields, DpiStepResult};
    use crate::model::{L4Proto, L7Proto};
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Mutex;

    struct SniDpi;

    impl DpiEngine for SniDpi {
        type State = bool;

        fn step(&self, done: &mut bool, _payload: &[u8], _c2s: bool) -> (DpiStepResult, DpiFields) {
            if *done {
                return (DpiStepResult::GiveUp, DpiFields::default());
            }
            *done = true;
            (
                DpiStepResult::GiveUp,
                DpiFields {
                    tls_sni: Some("example.org".into()),
                    tls_alpn: Some("http/1.1".into()),
                    ..Default::default()
                },
            )
        }

        fn give_up(&self, _done: &mut bool) -> DpiFields {
            DpiFields::default()
        }
    }

    struct NoopResolver;

    impl UidResolver for NoopResolver {
        fn resolve(&self, _tuple: &FiveTuple) -> Option<i32> {
            Some(10100)
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        dumps: Mutex<Vec<Vec<u8>>>,
        started: Mutex<Option<bool>>,
    }

    impl EngineSink for RecordingSink {
        fn dump_callback(&self, bytes: &[u8]) {
            self.dumps.lock().unwrap().push(bytes.to_vec());
        }
        fn notify_connections(&self, _new_conns: &[u64], _updated_conns: &[u64]) {}
        fn notify_stats(&self, _snapshot: &housekeeper::StatsSnapshot) {}
        fn notify_blacklists_loaded(&self, _per_file: &[blacklist::LoadOutcome]) {}
        fn notify_service_status(&self, started: bool) {
            *self.started.lock().unwrap() = Some(started);
        }
        fn dump_payload_chunk(&self, _conn_id: u64, _is_client_to_server: bool, _chunk: &[u8]) {}
    }

    fn tuple() -> FiveTuple {
        FiveTuple {
            l4_proto: L4Proto::Tcp,
            src_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
            dst_addr: IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)),
            src_port: 55000,
            dst_port: 443,
        }
    }

    #[test]
    fn start_and_stop_notify_service_status() {
        let sink = Arc::new(RecordingSink::default());
        let engine = Engine::new(
            EngineConfig::default(),
            SniDpi,
            Arc::new(NoopResolver),
            sink.clone(),
        )
        .unwrap();
        engine.start();
        assert!(engine.is_running());
        assert_eq!(*sink.started.lock().unwrap(), Some(true));
        engine.stop();
        assert!(!engine.is_running());
        assert_eq!(*sink.started.lock().unwrap(), Some(false));
    }

    #[test]
    fn handle_packet_creates_flow_and_classifies_via_dpi() {
        let sink = Arc::new(RecordingSink::default());
        let mut engine = Engine::new(
            EngineConfig::default(),
            SniDpi,
            Arc::new(NoopResolver),
            sink,
        )
        .unwrap();

        engine.handle_packet(tuple(), b"client hello", true, 0, 0, None);
        assert_eq!(engine.flow_count(), 1);

        let conn = engine.flows.lookup(&tuple()).unwrap();
        assert_eq!(conn.host.as_deref(), Some("example.org"));
        assert_eq!(conn.l7_proto, L7Proto::Https);
    }
}
