//! Core data model: [`FiveTuple`] keys the flow table, [`Connection`] is the
//! per-flow record the rest of the crate mutates in place.

use bitflags::bitflags;
use std::net::IpAddr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum L4Proto {
    Tcp,
    Udp,
    Icmp,
    Other(u8),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FiveTuple {
    pub l4_proto: L4Proto,
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl FiveTuple {
    pub fn ip_version(&self) -> u8 {
        match self.src_addr {
            IpAddr::V4(_) => 4,
            IpAddr::V6(_) => 6,
        }
    }

    /// Returns the tuple with source and destination swapped, used when
    /// normalizing direction for lookups keyed by the initiator's view.
    pub fn reversed(&self) -> Self {
        Self {
            l4_proto: self.l4_proto,
            src_addr: self.dst_addr,
            dst_addr: self.src_addr,
            src_port: self.dst_port,
            dst_port: self.src_port,
        }
    }
}

/// A well-known sentinel UID representing the platform's resolver daemon.
/// Connections opened on its behalf are candidates for re-attribution once
/// the originating app's own connection to the same host appears.
pub const NETD_UID: i32 = -999;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppUid {
    Known(i32),
    Netd,
    Unknown,
}

impl AppUid {
    pub fn as_i32(self) -> i32 {
        match self {
            AppUid::Known(uid) => uid,
            AppUid::Netd => NETD_UID,
            AppUid::Unknown => -1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnStatus {
    New,
    Connecting,
    Connected,
    Closed,
    Reset,
}

impl ConnStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnStatus::Closed | ConnStatus::Reset)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum L7Proto {
    #[default]
    Unknown,
    Dns,
    Http,
    Https,
    Tls,
    Imaps,
    Smtps,
    Quic,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Verdict: u16 {
        const BLACKLISTED_DOMAIN   = 0b0000_0001;
        const BLACKLISTED_IP       = 0b0000_0010;
        const WHITELISTED_APP      = 0b0000_0100;
        const TO_BLOCK             = 0b0000_1000;
        const NETD_BLOCK_MISSED    = 0b0001_0000;
        const PROXIED              = 0b0010_0000;
        const PAYLOAD_TRUNCATED    = 0b0100_0000;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct UpdateMask: u8 {
        const STATS   = 0b001;
        const INFO    = 0b010;
        const PAYLOAD = 0b100;
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DirectionalStats {
    pub bytes: u64,
    pub packets: u64,
}

#[derive(Clone, Debug, Default)]
pub struct PayloadCapture {
    pub sent: Vec<u8>,
    pub received: Vec<u8>,
    pub truncated: bool,
}

/// Whether `host` came from authoritative DPI evidence or was merely a
/// pre-fill borrowed from the reverse-DNS LRU. LRU-sourced hosts are
/// overwritten the moment DPI produces its own answer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostSource {
    None,
    Lru,
    Dpi,
}

pub struct Connection {
    pub incr_id: u64,
    pub tuple: FiveTuple,
    pub uid: AppUid,
    pub first_seen_ms: u64,
    pub last_seen_ms: u64,
    pub sent: DirectionalStats,
    pub received: DirectionalStats,

    pub l7_proto: L7Proto,
    pub alpn: Option<String>,
    pub host: Option<String>,
    pub host_source: HostSource,
    pub url: Option<String>,

    pub status: ConnStatus,
    pub verdict: Verdict,
    pub pending_update: UpdateMask,
    pub to_purge: bool,

    pub payload: PayloadCapture,

    pub dpi_packets_fed: u32,
    pub dpi_done: bool,
}

impl Connection {
    pub fn new(incr_id: u64, tuple: FiveTuple, uid: AppUid, now_ms: u64) -> Self {
        Self {
            incr_id,
            tuple,
            uid,
            first_seen_ms: now_ms,
            last_seen_ms: now_ms,
            sent: DirectionalStats::default(),
            received: DirectionalStats::default(),
            l7_proto: L7Proto::default(),
            alpn: None,
            host: None,
            host_source: HostSource::None,
            url: None,
            status: ConnStatus::New,
            verdict: Verdict::empty(),
            pending_update: UpdateMask::INFO,
            to_purge: false,
            payload: PayloadCapture::default(),
            dpi_packets_fed: 0,
            dpi_done: false,
        }
    }

    /// Advances the status machine. Never rewinds: a request to move to an
    /// earlier-or-equal state is ignored.
    pub fn advance_status(&mut self, next: ConnStatus) {
        if next > self.status {
            self.status = next;
            self.pending_update |= UpdateMask::INFO;
        }
    }

    pub fn set_host(&mut self, host: String, source: HostSource) {
        if source == HostSource::Dpi || self.host_source != HostSource::Dpi {
            self.host = Some(host);
            self.host_source = source;
            self.pending_update |= UpdateMask::INFO;
        }
    }

    pub fn record_bytes(&mut self, sent: u64, received: u64, now_ms: u64) {
        self.sent.bytes += sent;
        self.sent.packets += (sent > 0) as u64;
        self.received.bytes += received;
        self.received.packets += (received > 0) as u64;
        self.last_seen_ms = now_ms;
        self.pending_update |= UpdateMask::STATS;
    }
}
