//! Process-wide logging facade. One installable sink, leveled messages, and a
//! breadcrumb category mask so an embedder can light up one subsystem's
//! tracing without drowning in the others.

use bitflags::bitflags;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::fmt::Write as _;
use std::sync::Arc;

static LOGGER: Lazy<LogManager> = Lazy::new(LogManager::new);

pub fn warn(message: impl Into<String>) {
    LOGGER.log(LogLevel::Warn, message.into());
}

pub fn error(message: impl Into<String>) {
    LOGGER.log(LogLevel::Error, message.into());
}

pub fn info(message: impl Into<String>) {
    LOGGER.log(LogLevel::Info, message.into());
}

pub fn debug(message: impl Into<String>) {
    LOGGER.log(LogLevel::Debug, message.into());
}

pub fn breadcrumb(flag: BreadcrumbFlags, message: impl Into<String>) {
    LOGGER.breadcrumb(flag, message.into());
}

/// Installs the process-wide sink. `None` clears it (subsequent log calls
/// become no-ops). `min_level` and `breadcrumbs` are independent filters:
/// plain messages are gated by level, breadcrumb messages by mask.
pub fn install_sink(sink: Option<LogSink>, min_level: LogLevel, breadcrumbs: BreadcrumbFlags) {
    LOGGER.install_sink(sink, min_level, breadcrumbs);
}

pub fn set_breadcrumb_mask(mask: BreadcrumbFlags) {
    LOGGER.set_breadcrumb_mask(mask);
}

pub type LogSink = Arc<dyn Fn(LogLevel, &str, BreadcrumbFlags) + Send + Sync>;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct BreadcrumbFlags: u32 {
        const FLOW        = 0b0000_0001;
        const DNS         = 0b0000_0010;
        const BLACKLIST   = 0b0000_0100;
        const PCAP        = 0b0000_1000;
        const HOUSEKEEPER = 0b0001_0000;
        const DPI         = 0b0010_0000;
        const ALL         = u32::MAX;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

struct SinkInner {
    sink: LogSink,
    breadcrumbs: BreadcrumbFlags,
    min_level: LogLevel,
}

struct LogManager {
    sink: Mutex<Option<SinkInner>>,
    prefix: String,
}

impl LogManager {
    fn new() -> Self {
        let pid = std::process::id();
        Self {
            sink: Mutex::new(None),
            prefix: format!("[pcapcore-p{pid}]"),
        }
    }

    fn install_sink(&self, sink: Option<LogSink>, min_level: LogLevel, breadcrumbs: BreadcrumbFlags) {
        let mut guard = self.sink.lock();
        *guard = sink.map(|sink| SinkInner {
            sink,
            breadcrumbs,
            min_level,
        });
    }

    fn set_breadcrumb_mask(&self, mask: BreadcrumbFlags) {
        if let Some(inner) = self.sink.lock().as_mut() {
            inner.breadcrumbs = mask;
        }
    }

    fn log(&self, level: LogLevel, message: String) {
        if message.is_empty() {
            return;
        }
        self.dispatch(level, BreadcrumbFlags::empty(), message);
    }

    fn breadcrumb(&self, flag: BreadcrumbFlags, message: String) {
        if message.is_empty() || flag.is_empty() {
            return;
        }
        self.dispatch(LogLevel::Debug, flag, message);
    }

    fn dispatch(&self, level: LogLevel, breadcrumbs: BreadcrumbFlags, message: String) {
        let guard = self.sink.lock();
        let Some(inner) = guard.as_ref() else { return };
        if breadcrumbs.is_empty() {
            if level > inner.min_level {
                return;
            }
        } else if !inner.breadcrumbs.intersects(breadcrumbs) {
            return;
        }

        let mut formatted = String::new();
        if breadcrumbs.is_empty() {
            let _ = write!(formatted, "{} {}", self.prefix, message);
        } else {
            let _ = write!(formatted, "{} [{}] {}", self.prefix, label_for(breadcrumbs), message);
        }
        (inner.sink)(level, &formatted, breadcrumbs);
    }
}

fn label_for(flags: BreadcrumbFlags) -> &'static str {
    if flags.contains(BreadcrumbFlags::FLOW) {
        "FLOW"
    } else if flags.contains(BreadcrumbFlags::DNS) {
        "DNS"
    } else if flags.contains(BreadcrumbFlags::BLACKLIST) {
        "BLACKLIST"
    } else if flags.contains(BreadcrumbFlags::PCAP) {
        "PCAP"
    } else if flags.contains(BreadcrumbFlags::HOUSEKEEPER) {
        "HOUSEKEEPER"
    } else if flags.contains(BreadcrumbFlags::DPI) {
        "DPI"
    } else {
        "LOG"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn breadcrumb_filtered_by_mask() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        install_sink(
            Some(Arc::new(move |_level, _msg, _bits| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
            })),
            LogLevel::Info,
            BreadcrumbFlags::DNS,
        );
        breadcrumb(BreadcrumbFlags::FLOW, "should be filtered out");
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        breadcrumb(BreadcrumbFlags::DNS, "should pass");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        install_sink(None, LogLevel::Info, BreadcrumbFlags::empty());
    }

    #[test]
    fn plain_messages_gated_by_level() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        install_sink(
            Some(Arc::new(move |_level, _msg, _bits| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
            })),
            LogLevel::Warn,
            BreadcrumbFlags::empty(),
        );
        debug("too chatty for warn level");
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        error("loud enough");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        install_sink(None, LogLevel::Info, BreadcrumbFlags::empty());
    }
}
