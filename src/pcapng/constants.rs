//! Block types, magic numbers, and link-type codes for the legacy PCAP and
//! PCAPNG output formats. Values are byte-exact with the reference dumper.

pub const PCAP_MAGIC: u32 = 0xa1b2_c3d4;
pub const PCAP_VERSION_MAJOR: u16 = 2;
pub const PCAP_VERSION_MINOR: u16 = 4;

pub const LINKTYPE_ETHERNET: u32 = 1;
pub const LINKTYPE_RAW: u32 = 101;

pub const SHB_BLOCK_TYPE: u32 = 0x0A0D_0D0A;
pub const SHB_MAGIC: u32 = 0x1a2b_3c4d;
pub const SHB_VERSION_MAJOR: u16 = 1;
pub const SHB_VERSION_MINOR: u16 = 0;

pub const IDB_BLOCK_TYPE: u32 = 0x0000_0001;
pub const IDB_OPT_IF_NAME: u16 = 2;

pub const EPB_BLOCK_TYPE: u32 = 0x0000_0006;
pub const EPB_OPT_COMMENT: u16 = 0x0001;

pub const DSB_BLOCK_TYPE: u32 = 0x0000_000A;
pub const DSB_SECRETS_TYPE_TLS_KEYLOG: u32 = 0x544c_534b; // "TLSK"

pub const CUSTOM_BLOCK_TYPE: u32 = 0x0000_0bad;
pub const PCAPDROID_PEN: u32 = 62_652;
pub const PCAPDROID_PCAPNG_VERSION: u16 = 1;
pub const CUSTOM_BLOCK_UID_MAP: u32 = 1;

pub const SHB_OPT_HARDWARE: u16 = 2;
pub const SHB_OPT_OS: u16 = 3;
pub const SHB_OPT_USERAPPL: u16 = 4;

/// Legacy PCAP extension trailer magic (`pcapdroid_trailer_t::magic`).
pub const TRAILER_MAGIC: u32 = 0x0107_2021;
pub const TRAILER_APPNAME_LEN: usize = 20;

pub const ETH_P_IP: u16 = 0x0800;
pub const ETH_P_IPV6: u16 = 0x86DD;
