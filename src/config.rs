// Copyright 2024 Notarizer Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const fn default_port() -> u16 {
    9944
}

/// Minimum delay between two completed notarizations, in milliseconds.
const fn min_delay_default() -> u64 {
    3_000
}

/// How often the scheduler wakes up to check the queue, in milliseconds.
const fn tick_interval_default() -> u64 {
    5_000
}

/// Capture cache entry time-to-live in seconds.
const fn capture_ttl_default() -> u64 {
    60 * 5
}

/// Maximum number of entries held by the capture cache.
const fn max_entries_default() -> usize {
    1_000_000
}

/// NotarizerConfig is the configuration for the notarizer daemon.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct NotarizerConfig {
    /// WebSocket command server port number.
    ///
    /// default to 9944
    #[serde(default = "default_port", skip_serializing)]
    pub port: u16,
    /// Ordered URL pattern strings admitted into the notarization
    /// pipeline. Each entry must be a valid regular expression; an
    /// invalid entry fails config loading with its index.
    #[serde(default)]
    pub url_patterns: Vec<String>,
    /// Scheduler knobs for the notarization queue.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Capture cache knobs.
    #[serde(default)]
    pub capture: CaptureConfig,
    /// Overrides for the external notary endpoints and transcript limits.
    ///
    /// Anything left unset falls back to the persisted settings store
    /// (and its documented defaults).
    #[serde(default)]
    pub notary: NotaryConfig,
    /// Optional encrypt-and-publish side channel for completed proofs.
    #[serde(default)]
    pub publish: PublishConfig,
}

/// QueueConfig is the configuration for the notarization scheduler.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct QueueConfig {
    /// Minimum number of milliseconds between two completed
    /// notarizations.
    #[serde(default = "min_delay_default")]
    pub min_delay: u64,
    /// Milliseconds between scheduler wakeups.
    #[serde(default = "tick_interval_default")]
    pub tick_interval: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            min_delay: min_delay_default(),
            tick_interval: tick_interval_default(),
        }
    }
}

impl QueueConfig {
    /// The minimum inter-request delay as a [`Duration`].
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay)
    }

    /// The scheduler wakeup interval as a [`Duration`].
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval)
    }
}

/// CaptureConfig is the configuration for the request capture cache.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct CaptureConfig {
    /// Seconds an entry survives in the cache without being written.
    #[serde(default = "capture_ttl_default")]
    pub ttl: u64,
    /// Maximum number of entries before the oldest is evicted.
    #[serde(default = "max_entries_default")]
    pub max_entries: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            ttl: capture_ttl_default(),
            max_entries: max_entries_default(),
        }
    }
}

impl CaptureConfig {
    /// The entry time-to-live as a [`Duration`].
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl)
    }
}

/// NotaryConfig overrides the persisted notary settings on startup.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct NotaryConfig {
    /// Http(s) endpoint of the notary service.
    #[serde(skip_serializing)]
    pub api: Option<url::Url>,
    /// Websocket proxy endpoint used by the notary for the TLS
    /// connection.
    #[serde(skip_serializing)]
    pub proxy: Option<url::Url>,
    /// Maximum bytes of sent data covered by the transcript.
    pub max_sent: Option<u64>,
    /// Maximum bytes of received data covered by the transcript.
    pub max_received: Option<u64>,
}

/// PublishConfig is the configuration for the proof publish side effect.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct PublishConfig {
    /// Whether completed proofs are encrypted and published at all.
    #[serde(default)]
    pub enabled: bool,
    /// The endpoint receiving the ciphertext blobs.
    #[serde(skip_serializing)]
    pub endpoint: Option<url::Url>,
    /// The symmetric key used to encrypt proofs before publishing.
    ///
    /// The format is dynamic:
    /// 1. a 64-char hex string is used directly as the 32-byte key.
    ///    Example: 8917174396171783496173419137618235192359106130478137647163400318ab42
    ///
    /// 2. if it starts with '$' then it is read from that environment
    ///    variable, which must contain a 64-char hex string.
    ///    Example: $NOTARIZER_PROOF_KEY
    #[serde(skip_serializing)]
    pub encryption_key: Option<EncryptionKey>,
}

/// A 32-byte symmetric key, deserialized from hex or an env indirection.
#[derive(Clone)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    /// The raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("EncryptionKey").finish()
    }
}

impl std::str::FromStr for EncryptionKey {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim_start_matches("0x"))
            .map_err(|_| crate::error::Error::InvalidEncryptionKey)?;
        let key: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| crate::error::Error::InvalidEncryptionKey)?;
        Ok(Self(key))
    }
}

impl<'de> Deserialize<'de> for EncryptionKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct EncryptionKeyVisitor;
        impl serde::de::Visitor<'_> for EncryptionKeyVisitor {
            type Value = EncryptionKey;

            fn expecting(
                &self,
                formatter: &mut std::fmt::Formatter,
            ) -> std::fmt::Result {
                formatter.write_str(
                    "hex string or an env var containing a hex string in it",
                )
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if let Some(var) = value.strip_prefix('$') {
                    tracing::trace!("Reading {} from env", var);
                    let val = std::env::var(var).map_err(|e| {
                        serde::de::Error::custom(format!(
                            "error while loading this env {}: {}",
                            var, e,
                        ))
                    })?;
                    val.parse().map_err(|e| {
                        serde::de::Error::custom(format!("{e}"))
                    })
                } else {
                    value.parse().map_err(|e| {
                        serde::de::Error::custom(format!("{e}"))
                    })
                }
            }
        }

        deserializer.deserialize_str(EncryptionKeyVisitor)
    }
}

/// Load the configuration from all toml/json files under the given path.
pub fn load<P: AsRef<Path>>(path: P) -> crate::Result<NotarizerConfig> {
    let mut cfg = config::Config::new();
    // A pattern that covers all toml or json files in the config directory
    // and subdirectories.
    let toml_pattern = format!("{}/**/*.toml", path.as_ref().display());
    let json_pattern = format!("{}/**/*.json", path.as_ref().display());
    tracing::trace!(
        "Loading config files from {} and {}",
        toml_pattern,
        json_pattern
    );
    let config_files = glob::glob(&toml_pattern)?
        .flatten()
        .chain(glob::glob(&json_pattern)?.flatten());

    for config_file in config_files {
        tracing::trace!("Loading config file: {}", config_file.display());
        let ext = config_file
            .extension()
            .map(|e| e.to_str().unwrap_or(""))
            .unwrap_or("");
        let format = match ext {
            "toml" => config::FileFormat::Toml,
            "json" => config::FileFormat::Json,
            _ => {
                tracing::warn!("Unknown file extension: {}", ext);
                continue;
            }
        };
        let file = config::File::from(config_file).format(format);
        if let Err(e) = cfg.merge(file) {
            tracing::warn!("Error while loading config file: {} skipping!", e);
            continue;
        }
    }

    // also merge in the environment (with a prefix of NOTARIZER).
    cfg.merge(config::Environment::with_prefix("NOTARIZER").separator("_"))?;
    // and finally deserialize the config and post-process it
    let config: Result<
        NotarizerConfig,
        serde_path_to_error::Error<config::ConfigError>,
    > = serde_path_to_error::deserialize(cfg);
    match config {
        Ok(c) => postloading_process(c),
        Err(e) => {
            tracing::error!("{}", e);
            Err(e.into())
        }
    }
}

// The postloading_process exists to validate configuration and standardize
// the format of the configuration
fn postloading_process(
    config: NotarizerConfig,
) -> crate::Result<NotarizerConfig> {
    tracing::trace!("Checking configration sanity ...");
    tracing::trace!("postloaded config: {:?}", config);
    // every url pattern must compile; report the first failing index.
    for (index, pattern) in config.url_patterns.iter().enumerate() {
        if let Err(source) = regex::Regex::new(pattern) {
            return Err(crate::error::Error::InvalidUrlPattern {
                index,
                source,
            });
        }
    }
    if config.publish.enabled {
        if config.publish.endpoint.is_none() {
            return Err(crate::error::Error::Generic(
                "publish.endpoint is required when publish is enabled",
            ));
        }
        if config.publish.encryption_key.is_none() {
            return Err(crate::error::Error::Generic(
                "publish.encryption-key is required when publish is enabled",
            ));
        }
    }
    Ok(config)
}
