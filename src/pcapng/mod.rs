//! Buffered, size-capped PCAP/PCAPNG writer. The dumper never does I/O
//! itself: flushes are returned as owned byte buffers for the caller to pass
//! to its `dump_callback`, keeping file/socket access out of the core.
//!
//! Grounded on the reference's `core/pcap_dump.c`.

mod blocks;
mod constants;

use crate::config::{DumpFormat, EngineConfig};
use crate::logger::{self};
use blocks::{crc32_ieee, BlockWriter};
use constants::*;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

/// High-water fraction of the primary buffer at which pending keylog text
/// forces a flush even if the delay timer hasn't elapsed (450/512 in the
/// reference's fixed-size buffer).
const KEYLOG_HIGH_WATER_FRACTION: f64 = 450.0 / 512.0;

#[derive(Debug, PartialEq, Eq)]
pub enum DumpOutcome {
    /// Written into the buffer; carries flushed bytes if writing this
    /// record required making room first.
    Written(Option<Vec<u8>>),
    Full,
}

pub struct Interface<'a> {
    pub os_ifindex: i32,
    pub name: Option<&'a str>,
}

pub struct UidNames<'a> {
    pub uid: i32,
    pub package_name: &'a str,
    pub app_name: &'a str,
}

pub struct Dumper {
    format: DumpFormat,
    snaplen: u32,
    buffer_capacity: usize,
    buffer: Vec<u8>,
    dump_size: u64,
    max_dump_size: Option<u64>,
    max_dump_size_reached: bool,
    last_flush_ms: u64,
    flush_delay_ms: u64,
    keylog_capacity: usize,
    keylog: Mutex<Vec<u8>>,
    dumped_interfaces: FxHashMap<i32, u32>,
    next_interface_id: u32,
    mapped_uids: FxHashSet<i32>,
    trailer_warned: bool,
}

impl Dumper {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            format: config.dump_format,
            snaplen: config.dump_snaplen,
            buffer_capacity: config.dump_buffer_size,
            buffer: Vec::with_capacity(config.dump_buffer_size.min(64 * 1024)),
            dump_size: 0,
            max_dump_size: config.dump_max_size,
            max_dump_size_reached: false,
            last_flush_ms: 0,
            flush_delay_ms: config.dump_flush_delay_ms,
            keylog_capacity: config.dump_buffer_size,
            keylog: Mutex::new(Vec::new()),
            dumped_interfaces: FxHashMap::default(),
            next_interface_id: 1,
            mapped_uids: FxHashSet::default(),
            trailer_warned: false,
        }
    }

    fn extensions_enabled(&self) -> bool {
        matches!(
            self.format,
            DumpFormat::Pcap { trailer_extensions: true } | DumpFormat::PcapNg { trailer_extensions: true }
        )
    }

    pub fn preamble(&self) -> Vec<u8> {
        match self.format {
            DumpFormat::Pcap { .. } => self.pcap_file_header(),
            DumpFormat::PcapNg { .. } => self.pcapng_preamble(),
        }
    }

    fn pcap_file_header(&self) -> Vec<u8> {
        let mut w = BlockWriter::new();
        w.u32(PCAP_MAGIC);
        w.u16(PCAP_VERSION_MAJOR);
        w.u16(PCAP_VERSION_MINOR);
        w.i32(0); // thiszone
        w.u32(0); // sigfigs
        w.u32(self.snaplen);
        let network = if self.extensions_enabled() {
            LINKTYPE_ETHERNET
        } else {
            LINKTYPE_RAW
        };
        w.u32(network);
        w.into_bytes()
    }

    fn pcapng_preamble(&self) -> Vec<u8> {
        let mut opts = BlockWriter::new();
        let mut opt_len = 0usize;
        opt_len += opts.option(SHB_OPT_HARDWARE, b"generic");
        opt_len += opts.option(SHB_OPT_OS, std::env::consts::OS.as_bytes());
        opt_len += opts.option(SHB_OPT_USERAPPL, b"pcapcore");
        opt_len += blocks::end_of_options(&mut opts);
        let opts_bytes = opts.into_bytes();

        let shb_fixed = 4 + 4 + 4 + 2 + 2 + 8; // type,total_len,magic,ver_major,ver_minor,section_length
        let shb_total = shb_fixed + opt_len + 4; // + trailing total_length
        let idb_total = 4 + 4 + 2 + 2 + 4 + 4; // type,total_len,linktype,reserved,snaplen,trailing total_len

        let mut w = BlockWriter::new();
        w.u32(SHB_BLOCK_TYPE);
        w.u32(shb_total as u32);
        w.u32(SHB_MAGIC);
        w.u16(SHB_VERSION_MAJOR);
        w.u16(SHB_VERSION_MINOR);
        w.i64(-1); // section_length unknown (8 bytes)
        w.bytes(&opts_bytes);
        w.u32(shb_total as u32);

        w.u32(IDB_BLOCK_TYPE);
        w.u32(idb_total as u32);
        w.u16(LINKTYPE_RAW as u16);
        w.u16(0); // reserved
        w.u32(self.snaplen);
        w.u32(idb_total as u32);

        w.into_bytes()
    }

    /// Registers (or looks up) the PCAPNG interface id for an OS interface
    /// index, emitting a fresh Interface-Description-Block on first sight.
    fn interface_block(&mut self, iface: &Interface) -> (u32, Option<Vec<u8>>) {
        if let Some(&id) = self.dumped_interfaces.get(&iface.os_ifindex) {
            return (id, None);
        }
        let id = self.next_interface_id;
        self.next_interface_id += 1;
        self.dumped_interfaces.insert(iface.os_ifindex, id);

        let mut opt_len = 0usize;
        let mut opts = BlockWriter::new();
        if let Some(name) = iface.name {
            opt_len += opts.option(IDB_OPT_IF_NAME, name.as_bytes());
            opt_len += blocks::end_of_options(&mut opts);
        }
        let opts_bytes = opts.into_bytes();
        let total = 4 + 4 + 2 + 2 + 4 + opt_len + 4;

        let mut w = BlockWriter::new();
        w.u32(IDB_BLOCK_TYPE);
        w.u32(total as u32);
        w.u16(LINKTYPE_RAW as u16);
        w.u16(0);
        w.u32(self.snaplen);
        w.bytes(&opts_bytes);
        w.u32(total as u32);
        (id, Some(w.into_bytes()))
    }

    fn uid_map_block(&mut self, names: &UidNames) -> Option<Vec<u8>> {
        if self.mapped_uids.contains(&names.uid) {
            return None;
        }
        self.mapped_uids.insert(names.uid);

        let pkg = names.package_name.as_bytes();
        let app = names.app_name.as_bytes();
        // block_type(4) total_length(4) pen(4) version(2) custom_type(4)
        // uid(4) package_name_len(2) app_name_len(2) <data> padding total_length(4)
        let header_len = 4 + 4 + 4 + 2 + 4 + 4 + 2 + 2;
        let payload_len = pkg.len() + app.len();
        let pad = blocks::padding_for(payload_len);
        let total = header_len + payload_len + pad + 4;

        let mut w = BlockWriter::new();
        w.u32(CUSTOM_BLOCK_TYPE);
        w.u32(total as u32);
        w.u32(PCAPDROID_PEN);
        w.u16(PCAPDROID_PCAPNG_VERSION);
        w.u32(CUSTOM_BLOCK_UID_MAP);
        w.i32(names.uid);
        w.u16(pkg.len() as u16);
        w.u16(app.len() as u16);
        w.bytes(pkg);
        w.bytes(app);
        w.zeros(pad);
        w.u32(total as u32);
        Some(w.into_bytes())
    }

    /// Writes one packet record. `iface` is `None` for packets with no
    /// meaningful OS interface (e.g. produced by a virtual tunnel).
    pub fn dump_packet(
        &mut self,
        pkt: &[u8],
        ts_us: u64,
        uid: i32,
        uid_names: Option<&UidNames>,
        iface: Option<&Interface>,
    ) -> DumpOutcome {
        if self.max_dump_size_reached {
            return DumpOutcome::Full;
        }

        let record = match self.format {
            DumpFormat::PcapNg { .. } => self.build_pcapng_record(pkt, ts_us, uid, uid_names, iface),
            DumpFormat::Pcap { .. } => self.build_pcap_record(pkt, ts_us, uid, uid_names),
        };

        match self.reserve(record.len()) {
            Ok(flushed) => {
                self.buffer.extend_from_slice(&record);
                self.dump_size += record.len() as u64;
                DumpOutcome::Written(flushed)
            }
            Err(()) => DumpOutcome::Full,
        }
    }

    fn build_pcapng_record(
        &mut self,
        pkt: &[u8],
        ts_us: u64,
        uid: i32,
        uid_names: Option<&UidNames>,
        iface: Option<&Interface>,
    ) -> Vec<u8> {
        let mut prefix = Vec::new();
        let interface_id = if let Some(iface) = iface {
            let (id, block) = self.interface_block(iface);
            if let Some(block) = block {
                prefix.extend_from_slice(&block);
            }
            id
        } else {
            0
        };
        if self.extensions_enabled() {
            if let Some(names) = uid_names {
                if let Some(block) = self.uid_map_block(names) {
                    prefix.extend_from_slice(&block);
                }
            }
        }

        let incl_len = pkt.len().min(self.snaplen as usize);
        let pad = blocks::padding_for(incl_len);

        let comment = if self.extensions_enabled() {
            Some(format!("u-{uid}"))
        } else {
            None
        };
        let comment_opt_len = comment
            .as_ref()
            .map(|c| 4 + c.len() + blocks::padding_for(c.len()))
            .unwrap_or(0);

        let fixed = 4 + 4 + 4 + 4 + 4 + 4 + 4; // type,total_len,ifid,ts_high,ts_low,caplen,origlen
        let total = fixed + incl_len + pad + comment_opt_len + 4;

        let mut w = BlockWriter::new();
        w.u32(EPB_BLOCK_TYPE);
        w.u32(total as u32);
        w.u32(interface_id);
        w.u32((ts_us >> 32) as u32);
        w.u32(ts_us as u32);
        w.u32(incl_len as u32);
        w.u32(pkt.len() as u32);
        w.bytes(&pkt[..incl_len]);
        w.zeros(pad);
        if let Some(comment) = &comment {
            w.option(EPB_OPT_COMMENT, comment.as_bytes());
        }
        w.u32(total as u32);

        prefix.extend_from_slice(&w.into_bytes());
        prefix
    }

    fn build_pcap_record(&mut self, pkt: &[u8], ts_us: u64, uid: i32, uid_names: Option<&UidNames>) -> Vec<u8> {
        const ETH_HDR_LEN: usize = 14;
        const TRAILER_LEN: usize = 4 + 4 + TRAILER_APPNAME_LEN + 4;

        let base_incl = pkt.len().min(self.snaplen as usize);
        let mut with_trailer = false;
        let mut pre_trailer_padding = 0usize;
        let mut trailer_overhead = 0usize;

        if self.extensions_enabled() {
            pre_trailer_padding = blocks::padding_for(ETH_HDR_LEN + base_incl);
            trailer_overhead = ETH_HDR_LEN + pre_trailer_padding + TRAILER_LEN;
            if base_incl + trailer_overhead > self.snaplen as usize {
                if !self.trailer_warned {
                    logger::warn("packet too large for trailer extension at this snaplen; disabling trailer for this packet");
                    self.trailer_warned = true;
                }
            } else {
                with_trailer = true;
            }
        }

        let mut content = Vec::new();
        if with_trailer {
            content.resize(12, 0); // zeroed dst+src MAC
            let ethertype = if pkt.first().map(|b| b >> 4) == Some(4) {
                ETH_P_IP
            } else {
                ETH_P_IPV6
            };
            content.extend_from_slice(&ethertype.to_be_bytes());
        }
        content.extend_from_slice(&pkt[..base_incl]);
        if with_trailer {
            content.resize(content.len() + pre_trailer_padding, 0);
            content.extend_from_slice(&TRAILER_MAGIC.to_be_bytes());
            content.extend_from_slice(&uid.to_be_bytes());
            let mut appname = [0u8; TRAILER_APPNAME_LEN];
            if let Some(names) = uid_names {
                let bytes = names.app_name.as_bytes();
                let n = bytes.len().min(TRAILER_APPNAME_LEN);
                appname[..n].copy_from_slice(&bytes[..n]);
            }
            content.extend_from_slice(&appname);
            let fcs = crc32_ieee(&content);
            content.extend_from_slice(&fcs.to_be_bytes());
        }

        let incl_len = content.len();
        let orig_len = pkt.len() + if with_trailer { trailer_overhead } else { 0 };

        let mut record = BlockWriter::new();
        record.u32((ts_us / 1_000_000) as u32);
        record.u32((ts_us % 1_000_000) as u32);
        record.u32(incl_len as u32);
        record.u32(orig_len as u32);
        record.bytes(&content);
        record.into_bytes()
    }

    /// Appends TLS keylog text, newline-terminated. Discards (and logs) the
    /// chunk if staging would overflow the configured capacity.
    pub fn dump_secret(&self, secret: &[u8]) -> bool {
        let mut guard = self.keylog.lock();
        if guard.len() + secret.len() + 1 >= self.keylog_capacity {
            logger::warn("keylog staging buffer full, discarding secret");
            return false;
        }
        guard.extend_from_slice(secret);
        guard.push(b'\n');
        true
    }

    fn export_keylog(&mut self) -> Option<Vec<u8>> {
        let mut guard = self.keylog.lock();
        if guard.is_empty() {
            return None;
        }
        let sec_len = guard.len();
        let pad = blocks::padding_for(sec_len);
        let header_len = 4 + 4 + 4 + 4; // type,total_len,secrets_type,secrets_len
        let total = header_len + sec_len + pad + 4;

        if let Some(max) = self.max_dump_size {
            if self.dump_size + total as u64 >= max {
                logger::warn("discarding keylog buffer: dump size cap reached");
                guard.clear();
                return None;
            }
        }

        let mut w = BlockWriter::new();
        w.u32(DSB_BLOCK_TYPE);
        w.u32(total as u32);
        w.u32(DSB_SECRETS_TYPE_TLS_KEYLOG);
        w.u32(sec_len as u32);
        w.bytes(&guard);
        w.zeros(pad);
        w.u32(total as u32);
        guard.clear();
        drop(guard);
        self.dump_size += total as u64;
        Some(w.into_bytes())
    }

    /// Flushes secrets then the packet buffer (secrets always precede the
    /// packets accumulated in the same export), returning the combined
    /// bytes if anything was pending.
    fn export(&mut self) -> Option<Vec<u8>> {
        if self.max_dump_size_reached {
            return None;
        }
        let mut out = self.export_keylog().unwrap_or_default();
        if !self.buffer.is_empty() {
            out.extend_from_slice(&self.buffer);
            self.buffer.clear();
        }
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }

    fn reserve(&mut self, size: usize) -> Result<Option<Vec<u8>>, ()> {
        if self.max_dump_size_reached {
            return Err(());
        }
        let mut flushed = None;
        if self.buffer_capacity.saturating_sub(self.buffer.len()) <= size {
            flushed = self.export();
            if self.buffer_capacity.saturating_sub(self.buffer.len()) < size {
                logger::error("pcapng record does not fit even an empty buffer");
                return Err(());
            }
        }
        if let Some(max) = self.max_dump_size {
            if self.dump_size + size as u64 >= max {
                self.max_dump_size_reached = true;
                logger::info("dump size cap reached, further writes refused");
                return Err(());
            }
        }
        Ok(flushed)
    }

    /// Call periodically (and whenever idle) to let the dumper flush on its
    /// own schedule even without new packets arriving.
    pub fn check_export(&mut self, now_ms: u64) -> Option<Vec<u8>> {
        if self.max_dump_size_reached {
            return None;
        }
        let keylog_len = self.keylog.lock().len();
        let keylog_high_water = (self.keylog_capacity as f64 * KEYLOG_HIGH_WATER_FRACTION) as usize;
        let time_elapsed =
            !self.buffer.is_empty() && now_ms.saturating_sub(self.last_flush_ms) >= self.flush_delay_ms;
        if time_elapsed || keylog_len > keylog_high_water {
            let flushed = self.export();
            self.last_flush_ms = now_ms;
            flushed
        } else {
            None
        }
    }

    /// Flushes once and releases all state.
    pub fn destroy(&mut self) -> Option<Vec<u8>> {
        let out = self.export();
        self.buffer = Vec::new();
        self.keylog.lock().clear();
        self.dumped_interfaces.clear();
        self.mapped_uids.clear();
        out
    }

    pub fn dump_size(&self) -> u64 {
        self.dump_size
    }

    pub fn cap_reached(&self) -> bool {
        self.max_dump_size_reached
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn config() -> EngineConfig {
        let mut c = EngineConfig::default();
        c.dump_format = DumpFormat::PcapNg {
            trailer_extensions: false,
        };
        c
    }

    #[test]
    fn preamble_is_shb_plus_idb() {
        let dumper = Dumper::new(&config());
        let bytes = dumper.preamble();
        let shb_type = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        assert_eq!(shb_type, SHB_BLOCK_TYPE);
    }

    #[test]
    fn single_packet_emits_one_epb_referencing_interface_zero() {
        let mut dumper = Dumper::new(&config());
        let pkt = vec![0x45u8; 40];
        let outcome = dumper.dump_packet(&pkt, 1_000_000, 1000, None, None);
        assert_eq!(outcome, DumpOutcome::Written(None));
        let flushed = dumper.destroy().expect("expected flushed bytes");
        let epb_type = EPB_BLOCK_TYPE.to_le_bytes();
        assert!(flushed.windows(4).any(|w| w == epb_type));
    }

    #[test]
    fn snaplen_truncates_captured_length() {
        let mut c = config();
        c.dump_snaplen = 16;
        let mut dumper = Dumper::new(&c);
        let pkt = vec![0x45u8; 64];
        dumper.dump_packet(&pkt, 0, 1, None, None);
        let flushed = dumper.destroy().unwrap();
        let idx = flushed
            .windows(4)
            .position(|w| w == EPB_BLOCK_TYPE.to_le_bytes())
            .unwrap();
        let caplen = u32::from_le_bytes(flushed[idx + 20..idx + 24].try_into().unwrap());
        assert_eq!(caplen, 16);
    }

    #[test]
    fn dump_size_cap_latches_off() {
        let mut c = config();
        c.dump_max_size = Some(64);
        let mut dumper = Dumper::new(&c);
        let pkt = vec![0x45u8; 64];
        for _ in 0..8 {
            dumper.dump_packet(&pkt, 0, 1, None, None);
        }
        assert!(dumper.cap_reached());
        assert!(dumper.dump_size() <= 64);
    }

    #[test]
    fn secret_then_packet_flush_orders_secret_first() {
        let mut dumper = Dumper::new(&config());
        dumper.dump_secret(b"CLIENT_RANDOM aaaa bbbb");
        let pkt = vec![0x45u8; 20];
        dumper.dump_packet(&pkt, 0, 1, None, None);
        let flushed = dumper.destroy().unwrap();
        let dsb_pos = flushed
            .windows(4)
            .position(|w| w == DSB_BLOCK_TYPE.to_le_bytes());
        let epb_pos = flushed
            .windows(4)
            .position(|w| w == EPB_BLOCK_TYPE.to_le_bytes());
        assert!(dsb_pos.unwrap() < epb_pos.unwrap());
    }
}
