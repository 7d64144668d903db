//! Types for configuring telefab modules.

use crate::*;
use std::time::Duration;

/// helper transcode function
fn tc<S: serde::Serialize, D: serde::de::DeserializeOwned>(
    s: &S,
) -> FabResult<D> {
    serde_json::from_str(
        &serde_json::to_string(s)
            .map_err(|e| FabError::other_src("encode", e))?,
    )
    .map_err(|e| FabError::other_src("decode", e))
}

/// Denotes a type used to configure a specific telefab module.
///
/// These types carry configuration that cannot change at runtime, the
/// likes of which would be found in a configuration file. Serialization
/// must tolerate missing properties by falling back to sane defaults,
/// since config files are edited by humans.
pub trait ModConfig:
    'static
    + Sized
    + Default
    + std::fmt::Debug
    + serde::Serialize
    + serde::de::DeserializeOwned
    + Send
    + Sync
{
    /// The key under which this module config is stored.
    const MODULE: &'static str;
}

/// Endpoint configuration: a map of module name to module config.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct Config(serde_json::Map<String, serde_json::Value>);

impl Config {
    /// Insert or replace one module's config.
    pub fn set_module_config<M: ModConfig>(
        &mut self,
        module: &M,
    ) -> FabResult<()> {
        self.0.insert(M::MODULE.to_string(), tc(module)?);
        Ok(())
    }

    /// Insert one module's default config, refusing to clobber an
    /// existing entry. Factories call this while the builder assembles
    /// a default configuration.
    pub fn add_default_module_config<M: ModConfig>(
        &mut self,
    ) -> FabResult<()> {
        if self.0.contains_key(M::MODULE) {
            return Err(FabError::other(format!(
                "refusing to overwrite conflicting module name: {}",
                M::MODULE
            )));
        }
        self.0.insert(M::MODULE.to_string(), tc(&M::default())?);
        Ok(())
    }

    /// Extract one module's config, falling back to its default when
    /// the module has no entry.
    pub fn get_module_config<M: ModConfig>(&self) -> FabResult<M> {
        self.0
            .get(M::MODULE)
            .map(tc)
            .unwrap_or_else(|| Ok(M::default()))
    }
}

/// Configuration of the fabric itself: routing, flow control, and store
/// timing knobs.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FabricConfig {
    /// Hop TTL on data messages. Default: 16.
    pub max_hops: u16,
    /// Interval after which an idle connection sends a PING, in
    /// milliseconds. A connection silent for twice this long is
    /// considered lost. Default: 5000.
    pub peer_ping_interval_ms: u32,
    /// Bounded queue capacity of each local subscriber. Default: 20.
    pub subscriber_queue_capacity: usize,
    /// Outbound buffer capacity per peer, which is also the credit a
    /// peer starts with. Default: 512.
    pub peer_buffer_capacity: u32,
    /// How often a receiver returns consumed credits, in milliseconds.
    /// Default: 500.
    pub credit_interval_ms: u32,
    /// How long a store read waits for its response, in milliseconds.
    /// Default: 10000.
    pub store_request_timeout_ms: u32,
    /// How long a clone without a reachable master queues writes before
    /// rejecting them, in milliseconds. Default: 30000.
    pub store_reconnect_timeout_ms: u32,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            max_hops: 16,
            peer_ping_interval_ms: 5_000,
            subscriber_queue_capacity: 20,
            peer_buffer_capacity: 512,
            credit_interval_ms: 500,
            store_request_timeout_ms: 10_000,
            store_reconnect_timeout_ms: 30_000,
        }
    }
}

impl ModConfig for FabricConfig {
    const MODULE: &'static str = "fabric";
}

impl FabricConfig {
    /// Get the ping interval as a [Duration].
    pub fn peer_ping_interval(&self) -> Duration {
        Duration::from_millis(self.peer_ping_interval_ms as u64)
    }

    /// Get the credit round interval as a [Duration].
    pub fn credit_interval(&self) -> Duration {
        Duration::from_millis(self.credit_interval_ms as u64)
    }

    /// Get the store request timeout as a [Duration].
    pub fn store_request_timeout(&self) -> Duration {
        Duration::from_millis(self.store_request_timeout_ms as u64)
    }

    /// Get the store reconnect timeout as a [Duration].
    pub fn store_reconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.store_reconnect_timeout_ms as u64)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = FabricConfig::default();
        assert_eq!(16, c.max_hops);
        assert_eq!(Duration::from_secs(5), c.peer_ping_interval());
        assert_eq!(20, c.subscriber_queue_capacity);
        assert_eq!(512, c.peer_buffer_capacity);
        assert_eq!(Duration::from_millis(500), c.credit_interval());
        assert_eq!(Duration::from_secs(10), c.store_request_timeout());
        assert_eq!(Duration::from_secs(30), c.store_reconnect_timeout());
    }

    #[test]
    fn partial_config_from_disk_fills_defaults() {
        let config: Config = serde_json::from_str(
            r#"{
              "fabric": { "maxHops": 4, "extraneous": true },
              "somethingElse": { "ignored": 1 }
            }"#,
        )
        .unwrap();
        let c: FabricConfig = config.get_module_config().unwrap();
        assert_eq!(4, c.max_hops);
        assert_eq!(512, c.peer_buffer_capacity);
    }

    #[test]
    fn missing_module_gets_default() {
        let config = Config::default();
        let c: FabricConfig = config.get_module_config().unwrap();
        assert_eq!(16, c.max_hops);
    }

    #[test]
    fn add_default_refuses_duplicates() {
        let mut config = Config::default();
        config.add_default_module_config::<FabricConfig>().unwrap();
        assert!(config
            .add_default_module_config::<FabricConfig>()
            .is_err());
    }
}
