//! Tunable thresholds handed to [`crate::Engine::new`] once at construction.

#[derive(Clone, Copy, Debug)]
pub enum PayloadCaptureMode {
    None,
    Minimal,
    Full,
}

#[derive(Clone, Copy, Debug)]
pub enum DumpFormat {
    Pcap { trailer_extensions: bool },
    PcapNg { trailer_extensions: bool },
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Maximum number of entries the reverse-DNS LRU retains.
    pub dns_lru_capacity: usize,
    /// Per-file rule cap applied while loading a blacklist source.
    pub blacklist_max_file_rules: u64,
    /// Primary PCAPNG/PCAP buffer size in bytes, flushed via `dump_callback`.
    pub dump_buffer_size: usize,
    /// Optional hard cap on cumulative dumped bytes across the engine's run.
    pub dump_max_size: Option<u64>,
    /// Per-packet capture truncation length.
    pub dump_snaplen: u32,
    pub dump_format: DumpFormat,
    /// Milliseconds of buffered-but-unflushed data before `check_export` forces a flush.
    pub dump_flush_delay_ms: u64,
    /// Upper bound on DPI packets fed per flow before giving up.
    pub dpi_max_packets_per_flow: u32,
    pub payload_capture: PayloadCaptureMode,
    /// Minimum interval between stats snapshots emitted by the housekeeper.
    pub stats_interval_ms: u64,
    /// Minimum interval between connection delta batches.
    pub connection_batch_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dns_lru_capacity: 64,
            blacklist_max_file_rules: 15_000_000,
            dump_buffer_size: 512 * 1024,
            dump_max_size: None,
            dump_snaplen: 65_535,
            dump_format: DumpFormat::PcapNg {
                trailer_extensions: true,
            },
            dump_flush_delay_ms: 1_000,
            dpi_max_packets_per_flow: 12,
            payload_capture: PayloadCaptureMode::None,
            stats_interval_ms: 300,
            connection_batch_interval_ms: 1_000,
        }
    }
}
