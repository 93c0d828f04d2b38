//! Configuration loading from `.env` files.

use std::{env, time::Duration};

use anyhow::{Context, Result};

use crate::{
    event::Keys,
    pow::MineOptions,
    relay::{RelayPool, DEFAULT_TIMEOUT},
};

pub const DEFAULT_POW_MAX_ITERATIONS: u64 = 10_000_000;

/// Every variable [`Settings::from_env`] reads.
pub const ENV_VARS: [&str; 6] = [
    "SECRET_KEY",
    "RELAYS",
    "TOR_SOCKS",
    "POW_DIFFICULTY",
    "POW_MAX_ITERATIONS",
    "PUBLISH_TIMEOUT_SECS",
];

/// Runtime settings derived from environment variables.
#[derive(Clone)]
pub struct Settings {
    /// Hex secret key of the local identity.
    pub secret_key: Option<String>,
    /// Relays to publish to and fetch from.
    pub relays: Vec<String>,
    /// Optional Tor SOCKS proxy (host:port).
    pub tor_socks: Option<String>,
    /// Leading zero bits required on outgoing inner records; 0 disables mining.
    pub pow_difficulty: u32,
    pub pow_max_iterations: u64,
    /// Per-relay publish and fetch timeout.
    pub publish_timeout: Duration,
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .field("relays", &self.relays)
            .field("tor_socks", &self.tor_socks)
            .field("pow_difficulty", &self.pow_difficulty)
            .field("pow_max_iterations", &self.pow_max_iterations)
            .field("publish_timeout", &self.publish_timeout)
            .finish()
    }
}

fn non_empty(name: &str) -> Option<String> {
    env::var(name).ok().filter(|s| !s.trim().is_empty())
}

fn parsed<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match non_empty(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("parsing {name}={raw:?}")),
        None => Ok(default),
    }
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let secret_key = non_empty("SECRET_KEY");
        let relays = csv_strings(env::var("RELAYS").unwrap_or_default());
        let tor_socks = non_empty("TOR_SOCKS");
        let pow_difficulty = parsed("POW_DIFFICULTY", 0)?;
        let pow_max_iterations = parsed("POW_MAX_ITERATIONS", DEFAULT_POW_MAX_ITERATIONS)?;
        let publish_timeout = match non_empty("PUBLISH_TIMEOUT_SECS") {
            Some(_) => Duration::from_secs(parsed("PUBLISH_TIMEOUT_SECS", 0)?),
            None => DEFAULT_TIMEOUT,
        };
        Ok(Self {
            secret_key,
            relays,
            tor_socks,
            pow_difficulty,
            pow_max_iterations,
            publish_timeout,
        })
    }

    /// The local identity.
    pub fn keys(&self) -> Result<Keys> {
        let hex = self
            .secret_key
            .as_deref()
            .context("SECRET_KEY is not set; run `reswire keygen` and add it to the env file")?;
        Keys::from_secret_hex(hex).context("SECRET_KEY is not a valid secp256k1 secret key")
    }

    /// Mining parameters, or `None` when mining is disabled.
    pub fn mine_options(&self) -> Option<MineOptions> {
        (self.pow_difficulty > 0)
            .then(|| MineOptions::new(self.pow_difficulty, self.pow_max_iterations))
    }

    pub fn relay_pool(&self) -> RelayPool {
        RelayPool::new(&self.relays, self.tor_socks.as_deref(), self.publish_timeout)
    }
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    let s = input.as_ref();
    s.split(',')
        .filter_map(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .collect()
}

/// Serialises tests that touch process environment variables.
#[cfg(test)]
pub(crate) static ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
pub(crate) fn clear_env() {
    for v in ENV_VARS {
        env::remove_var(v);
    }
}
