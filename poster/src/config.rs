//! Environment configuration of a poster context.
use std::time::Duration;

use crate::op::Wait;
use crate::{Error, Result};

/// Port of a poster server when the host names none.
pub const DEFAULT_PORT: u16 = 2507;

/// Names the remote host that owns all posters of this process.
pub const ENV_HOST: &str = "POSTER_HOST";
/// Colon separated hosts searched for posters not found locally.
///
/// Entries use the default port. Write `[host]:port` for another one, a bare `host:port` is two
/// entries.
pub const ENV_PATH: &str = "POSTER_PATH";
/// Milliseconds to wait for a poster lock or a server reply, or `forever`.
pub const ENV_TIMEOUT: &str = "POSTER_TIMEOUT_MS";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Config {
    /// When set, every poster is created and found on this host.
    pub remote_host: Option<String>,
    /// Hosts to search, in order, for names the local node does not know.
    pub search_path: Vec<String>,
    /// Wait for contended posters and for replies.
    pub wait: Wait,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let host = std::env::var(ENV_HOST).ok();
        let path = std::env::var(ENV_PATH).ok();
        let timeout = std::env::var(ENV_TIMEOUT).ok();
        Self::from_vars(host.as_deref(), path.as_deref(), timeout.as_deref())
    }

    /// Interpret the values of the three variables.
    pub fn from_vars(host: Option<&str>, path: Option<&str>, timeout: Option<&str>) -> Result<Self> {
        let remote_host = match host.map(str::trim) {
            None | Some("") => None,
            Some(host) => Some(host.to_owned()),
        };

        let mut search_path = Vec::new();
        let mut rest = path.unwrap_or_default();
        loop {
            let (entry, tail) = next_entry(rest);
            let entry = entry.trim();
            if !entry.is_empty() {
                search_path.push(unbracket(entry));
            }
            match tail {
                Some(tail) => rest = tail,
                None => break,
            }
        }

        let wait = match timeout.map(str::trim) {
            None | Some("") => Wait::default(),
            Some("forever") => Wait::Forever,
            Some(millis) => {
                let millis = millis
                    .parse::<u64>()
                    .map_err(|_| Error::ConfigurationMissing("POSTER_TIMEOUT_MS is not a number"))?;
                Wait::Timeout(Duration::from_millis(millis))
            }
        };

        Ok(Config {
            remote_host,
            search_path,
            wait,
        })
    }
}

/// Split the first host off a search path.
///
/// A bracketed entry may carry a port, `[host]:port`, all other colons separate entries.
fn next_entry(path: &str) -> (&str, Option<&str>) {
    let path = path.trim_start();
    let start = match path.starts_with('[').then(|| path.find(']')).flatten() {
        Some(close) => {
            let close = close + 1;
            match path[close..].strip_prefix(':') {
                Some(after) => {
                    let digits = after
                        .find(|c: char| !c.is_ascii_digit())
                        .unwrap_or(after.len());
                    if digits > 0 {
                        close + 1 + digits
                    } else {
                        close
                    }
                }
                None => close,
            }
        }
        None => 0,
    };

    match path[start..].find(':') {
        Some(sep) => (&path[..start + sep], Some(&path[start + sep + 1..])),
        None => (path, None),
    }
}

/// `[name]:port` to `name:port`, IPv6 addresses keep their brackets.
fn unbracket(entry: &str) -> String {
    if let Some((host, port)) = entry.strip_prefix('[').and_then(|inner| inner.split_once(']')) {
        if !host.contains(':') {
            return format!("{host}{port}");
        }
    }
    entry.to_owned()
}

/// Append the default port to a host that names none.
///
/// Accepts `host`, `host:port`, `[v6]` and `[v6]:port`.
pub(crate) fn with_port(host: &str) -> String {
    if host.starts_with('[') {
        return match host.rfind("]:") {
            Some(_) => host.to_owned(),
            None => format!("{host}:{DEFAULT_PORT}"),
        };
    }

    match host.rsplit_once(':') {
        Some((_, port)) if port.parse::<u16>().is_ok() => host.to_owned(),
        _ => format!("{host}:{DEFAULT_PORT}"),
    }
}
