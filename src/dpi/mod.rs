//! Drives an opaque [`DpiEngine`] for a connection until it gives up, a
//! packet budget is exhausted, or the connection closes; harvests DNS,
//! HTTP, and TLS metadata along the way.

use crate::config::PayloadCaptureMode;
use crate::dns_lru::ReverseDnsLru;
use crate::flow::{self, FirewallConfig};
use crate::interfaces::{DpiEngine, DpiFields, DpiStepResult, EngineSink};
use crate::logger::{self, BreadcrumbFlags};
use crate::model::{Connection, HostSource, L7Proto, UpdateMask, Verdict};

/// Per-direction capture cap under `Minimal` payload mode.
pub const MINIMAL_PAYLOAD_MAX_DIRECTION_SIZE: usize = 512;

/// Feeds one payload chunk into the connection's DPI state, harvests any
/// newly extracted fields into `conn`, extracts a payload chunk per the
/// configured capture mode, and releases DPI state on give-up. Returns
/// `true` if the engine gave up (caller should stop calling this for the
/// connection).
#[allow(clippy::too_many_arguments)]
pub fn feed<E: DpiEngine>(
    engine: &E,
    state: &mut E::State,
    conn: &mut Connection,
    payload: &[u8],
    is_client_to_server: bool,
    max_packets: u32,
    lru: &mut ReverseDnsLru,
    firewall: &FirewallConfig,
    payload_mode: PayloadCaptureMode,
    sink: &dyn EngineSink,
) -> bool {
    if conn.dpi_done {
        return true;
    }

    capture_payload(conn, payload, is_client_to_server, payload_mode, sink);

    conn.dpi_packets_fed += 1;
    let (result, fields) = engine.step(state, payload, is_client_to_server);
    harvest(conn, &fields, lru, firewall);

    let exhausted = conn.dpi_packets_fed >= max_packets;
    let give_up = result == DpiStepResult::GiveUp || exhausted || conn.status.is_terminal();
    if give_up {
        let final_fields = engine.give_up(state);
        harvest(conn, &final_fields, lru, firewall);
        conn.dpi_done = true;
        logger::breadcrumb(
            BreadcrumbFlags::DPI,
            format!("flow {} dpi gave up after {} packets", conn.incr_id, conn.dpi_packets_fed),
        );
    }
    give_up
}

/// Dumps the first payload chunk seen in each direction (every chunk, under
/// `Full`), capped at [`MINIMAL_PAYLOAD_MAX_DIRECTION_SIZE`] under `Minimal`.
fn capture_payload(
    conn: &mut Connection,
    payload: &[u8],
    is_client_to_server: bool,
    mode: PayloadCaptureMode,
    sink: &dyn EngineSink,
) {
    if payload.is_empty() {
        return;
    }
    let cap = match mode {
        PayloadCaptureMode::None => return,
        PayloadCaptureMode::Minimal => {
            let already_captured = if is_client_to_server {
                !conn.payload.sent.is_empty()
            } else {
                !conn.payload.received.is_empty()
            };
            if already_captured {
                return;
            }
            MINIMAL_PAYLOAD_MAX_DIRECTION_SIZE
        }
        PayloadCaptureMode::Full => usize::MAX,
    };

    let to_dump_len = payload.len().min(cap);
    let chunk = &payload[..to_dump_len];
    if is_client_to_server {
        conn.payload.sent.extend_from_slice(chunk);
    } else {
        conn.payload.received.extend_from_slice(chunk);
    }
    if payload.len() > cap {
        conn.payload.truncated = true;
        conn.verdict |= Verdict::PAYLOAD_TRUNCATED;
    }
    conn.pending_update |= UpdateMask::PAYLOAD;
    sink.dump_payload_chunk(conn.incr_id, is_client_to_server, chunk);
}

fn harvest(conn: &mut Connection, fields: &DpiFields, lru: &mut ReverseDnsLru, firewall: &FirewallConfig) {
    let mut host_written = false;

    if fields.is_dns_response {
        conn.l7_proto = L7Proto::Dns;
        if let Some(question) = &fields.dns_question {
            conn.set_host(question.clone(), HostSource::Dpi);
            host_written = true;
            for (ip, name) in &fields.dns_answers {
                lru.add(*ip, name.clone());
            }
        }
    }

    if let Some(host) = &fields.http_host {
        if !host.is_empty() && host.parse::<std::net::IpAddr>().is_err() {
            conn.l7_proto = L7Proto::Http;
            conn.set_host(host.clone(), HostSource::Dpi);
            host_written = true;
        }
    }
    if let Some(url) = &fields.http_url {
        conn.url = Some(url.clone());
    }

    if let Some(sni) = &fields.tls_sni {
        conn.set_host(sni.clone(), HostSource::Dpi);
        host_written = true;
        conn.l7_proto = classify_tls(fields, conn.tuple.dst_port);
    } else if conn.l7_proto == L7Proto::Unknown && conn.tuple.dst_port == 443 {
        conn.l7_proto = L7Proto::Https;
    }

    if let Some(alpn) = &fields.tls_alpn {
        conn.alpn = Some(alpn.clone());
    }

    if host_written {
        flow::recompute_verdict(conn, firewall);
    }
}

fn classify_tls(fields: &DpiFields, dst_port: u16) -> L7Proto {
    if let Some(alpn) = &fields.tls_alpn {
        if alpn.starts_with("http/") {
            return L7Proto::Https;
        }
        if alpn.starts_with("imap") {
            return L7Proto::Imaps;
        }
        if alpn.starts_with("stmp") || alpn.starts_with("smtp") {
            return L7Proto::Smtps;
        }
    }
    if let Some(host) = &fields.tls_sni {
        if host.starts_with("imap.") {
            return L7Proto::Imaps;
        }
        if host.starts_with("smtp.") {
            return L7Proto::Smtps;
        }
    }
    if dst_port == 443 {
        L7Proto::Https
    } else {
        L7Proto::Tls
    }
}
