//! Log stream negotiation.
//!
//! Decides per request whether command output is combined or split, and
//! whether it is fetched once over HTTP or streamed over a WebSocket. The
//! decision is based on the SDK version the client declares.

use axum::http::{header, HeaderMap};
use semver::Version;
use std::cmp::Ordering;
use tracing::debug;

pub const SDK_VERSION_HEADER: &str = "X-Daytona-SDK-Version";
pub const SPLIT_OUTPUT_HEADER: &str = "X-Daytona-Split-Output";
pub const SUBPROTOCOL_PREFIX: &str = "X-Daytona-SDK-Version~";

/// First SDK version that demultiplexes stdout and stderr itself.
pub const SPLIT_OUTPUT_MIN_VERSION: &str = "0.27.0-0";

/// Development builds always count as modern.
pub const DEV_SDK_VERSION: &str = "0.0.0-dev";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTransport {
    /// Plain HTTP body with the log so far
    Fetch,
    /// WebSocket; `follow` keeps streaming until the command completes
    WebSocket { follow: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogNegotiation {
    /// Strip stream markers so stdout and stderr arrive interleaved
    pub combined_output: bool,
    pub transport: LogTransport,
    /// Subprotocols the WebSocket upgrade may accept
    pub subprotocols: Vec<String>,
}

/// SDK version declared by the client, empty if none.
pub fn sdk_version(headers: &HeaderMap) -> String {
    headers
        .get(SDK_VERSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .unwrap_or_default()
}

/// Compare a client version to `threshold`. `None` if either fails to parse.
pub fn compare_versions(version: &str, threshold: &str) -> Option<Ordering> {
    let version = parse_version(version)?;
    let threshold = parse_version(threshold)?;
    Some(version.cmp(&threshold))
}

/// Lenient semver: accepts a leading `v` and missing minor/patch parts.
fn parse_version(raw: &str) -> Option<Version> {
    let raw = raw.trim().trim_start_matches('v');
    if raw.is_empty() {
        return None;
    }
    if let Ok(version) = Version::parse(raw) {
        return Some(version);
    }

    let (core, rest) = match raw.find(|c: char| c == '-' || c == '+') {
        Some(idx) => raw.split_at(idx),
        None => (raw, ""),
    };
    let mut parts: Vec<&str> = core.split('.').collect();
    if parts.len() >= 3 {
        return None;
    }
    while parts.len() < 3 {
        parts.push("0");
    }
    Version::parse(&format!("{}{}", parts.join("."), rest)).ok()
}

/// Unparseable versions are treated as newer than the threshold.
fn version_ordering(sdk_version: &str) -> Ordering {
    compare_versions(sdk_version, SPLIT_OUTPUT_MIN_VERSION).unwrap_or_else(|| {
        if !sdk_version.is_empty() {
            debug!(sdk_version, "unparseable SDK version, assuming modern client");
        }
        Ordering::Greater
    })
}

/// A declared version older than the split-output threshold.
pub fn is_legacy_client(headers: &HeaderMap) -> bool {
    let version = sdk_version(headers);
    version_ordering(&version) == Ordering::Less && version != DEV_SDK_VERSION
}

/// Combined output for old SDKs, and for unversioned clients that did not
/// ask for split output.
pub fn is_combined_output(headers: &HeaderMap) -> bool {
    let version = sdk_version(headers);
    let split_requested = headers
        .get(SPLIT_OUTPUT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    is_legacy_client(headers) || (version.is_empty() && !split_requested)
}

pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

pub fn negotiate(headers: &HeaderMap, follow: bool) -> LogNegotiation {
    let version = sdk_version(headers);
    let subprotocols = if version.is_empty() {
        Vec::new()
    } else {
        vec![format!("{}{}", SUBPROTOCOL_PREFIX, version)]
    };

    let transport = if is_websocket_upgrade(headers) {
        LogTransport::WebSocket { follow }
    } else {
        LogTransport::Fetch
    };

    LogNegotiation {
        combined_output: is_combined_output(headers),
        transport,
        subprotocols,
    }
}
