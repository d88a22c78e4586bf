//! Logging setup and short-id helpers for log lines.
//!
//! Library code logs through `tracing` macros with structured fields.
//! Binaries call [`init`] once at startup; output goes to stderr with the
//! filter taken from `PARLEY_LOG`, then `RUST_LOG`, then `info`.
//!
//! Peer keys and message ids are long, so log lines carry short forms:
//!
//! ```text
//! 2026-02-11T21:33:12.000Z  INFO parley::messages: stored incoming message peer=p-76518406 msg=m-3f9c2a1
//! ```

use std::io::IsTerminal;

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::model::PublicKey;

/// Environment variable holding the log filter directive.
pub const LOG_ENV: &str = "PARLEY_LOG";
const DEFAULT_FILTER: &str = "info";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber writing to stderr. Colour is enabled only
/// when stderr is a terminal. Returns false if a subscriber was already set.
pub fn init() -> bool {
    let ansi = std::io::stderr().is_terminal();
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .with_ansi(ansi)
        .try_init()
        .is_ok()
}

/// Install the global subscriber with a custom writer (file, test buffer,
/// TUI adapter). Colour codes are always disabled.
pub fn init_with_writer<W>(writer: W) -> bool
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .is_ok()
}

const LOG_ID_TRUNCATE_LEN: usize = 8;

fn truncate_id(id: &str) -> &str {
    let end = id
        .char_indices()
        .nth(LOG_ID_TRUNCATE_LEN)
        .map(|(i, _)| i)
        .unwrap_or(id.len());
    &id[..end]
}

/// Short form of a peer key, e.g. `p-76518406`.
pub fn peer_id(key: &PublicKey) -> String {
    format!("p-{}", truncate_id(&key.to_hex()))
}

/// Short form of a message id, e.g. `m-3f9c2a1b`. UUIDv7 values share
/// their leading timestamp bits, so the random tail is used.
pub fn msg_id(id: &Uuid) -> String {
    let simple = id.simple().to_string();
    let start = simple.len().saturating_sub(LOG_ID_TRUNCATE_LEN);
    format!("m-{}", &simple[start..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_is_short_and_stable() {
        let key = PublicKey::from_bytes([0xAB; 32]);
        assert_eq!(peer_id(&key), "p-ABABABAB");
        assert_eq!(peer_id(&key), peer_id(&key));
    }

    #[test]
    fn test_msg_id_uses_random_tail() {
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        assert_eq!(msg_id(&a).len(), 2 + LOG_ID_TRUNCATE_LEN);
        assert!(msg_id(&a).starts_with("m-"));
        assert_ne!(msg_id(&a), msg_id(&b));
    }

    #[test]
    fn test_truncate_short_input() {
        assert_eq!(truncate_id("abc"), "abc");
    }
}
