//! Trait boundaries to the engine's external collaborators: a packet
//! source, a UID resolver, an opaque DPI engine, and the sink that receives
//! every outbound notification. None of these are implemented by this
//! crate; an embedder supplies concrete types.

use crate::model::FiveTuple;

/// One parsed inbound packet, already attributed with an OS interface index
/// and (when known) the owning app UID.
pub struct CapturedPacket<'a> {
    pub timestamp_us: u64,
    pub bytes: &'a [u8],
    pub ifindex: i32,
    pub uid: Option<i32>,
}

/// Blocking packet source. The core does not own a thread for this; an
/// embedder drives `Engine::handle_packet` in its own read loop and polls
/// the engine's `running` flag to know when to stop.
pub trait PacketSource {
    fn recv_timeout(&mut self, timeout_ms: u64) -> Option<CapturedPacket<'_>>;
}

/// Resolves the owning app UID for a flow when the capture path itself
/// didn't already know it (e.g. root-capture mode consulting `/proc/net`).
pub trait UidResolver: Send + Sync {
    fn resolve(&self, tuple: &FiveTuple) -> Option<i32>;

    /// Looks up `(package_name, app_name)` for a UID, used to populate the
    /// PCAPNG UID-map custom block.
    fn resolve_name(&self, _uid: i32) -> Option<(String, String)> {
        None
    }
}

#[derive(Clone, Debug, Default)]
pub struct DpiFields {
    pub dns_question: Option<String>,
    pub dns_answers: Vec<(std::net::IpAddr, String)>,
    pub http_host: Option<String>,
    pub http_url: Option<String>,
    pub tls_sni: Option<String>,
    pub tls_alpn: Option<String>,
    pub is_dns_response: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DpiStepResult {
    /// More packets may still change the classification.
    Continue,
    /// The engine has committed to a final verdict; stop feeding it.
    GiveUp,
}

/// Opaque stream classifier. The core drives it packet-by-packet and reads
/// back extracted fields; it never inspects payload bytes itself beyond
/// deciding whether/how much to capture.
pub trait DpiEngine: Send + Sync {
    type State: Default;

    fn step(&self, state: &mut Self::State, payload: &[u8], is_client_to_server: bool) -> (DpiStepResult, DpiFields);

    fn give_up(&self, state: &mut Self::State) -> DpiFields;
}

/// Everything the core emits. One `Arc<dyn EngineSink>` is installed once at
/// construction, matching how the core installs a single logging sink.
pub trait EngineSink: Send + Sync {
    fn dump_callback(&self, bytes: &[u8]);
    fn notify_connections(&self, new_conns: &[u64], updated_conns: &[u64]);
    fn notify_stats(&self, snapshot: &crate::housekeeper::StatsSnapshot);
    fn notify_blacklists_loaded(&self, per_file: &[crate::blacklist::LoadOutcome]);
    fn notify_service_status(&self, started: bool);

    /// Delivers one captured payload chunk for a connection, per the
    /// configured [`crate::config::PayloadCaptureMode`].
    fn dump_payload_chunk(&self, conn_id: u64, is_client_to_server: bool, chunk: &[u8]);
}
