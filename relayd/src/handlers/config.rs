use itertools::Itertools;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

use crate::handlers::verifier;
use crate::types::{EVMAddress, SigningKey};
use crate::url::Url;

fn default_lookback_window() -> u64 {
    5000
}

fn default_max_scan_range() -> u64 {
    2000
}

fn deserialize_optional_sensitive_url<'de, D>(deserializer: D) -> Result<Option<Url>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)?
        .map(|raw| Url::new_sensitive(&raw).map_err(de::Error::custom))
        .transpose()
}

/// One relay role. `rpc_url` is the chain the role watches (and, for the
/// executor, also calls); a ws/wss scheme there or a separate `ws_url`
/// selects the push transport for the live tail.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum Config {
    Verifier {
        #[serde(deserialize_with = "Url::deserialize_sensitive")]
        rpc_url: Url,
        #[serde(default, deserialize_with = "deserialize_optional_sensitive_url")]
        ws_url: Option<Url>,
        endpoint: EVMAddress,
        #[serde(deserialize_with = "Url::deserialize_sensitive")]
        destination_rpc_url: Url,
        verifier_contract: EVMAddress,
        signing_key: SigningKey,
        #[serde(default)]
        start_block: Option<u64>,
        #[serde(default = "default_lookback_window")]
        lookback_window: u64,
        #[serde(default = "default_max_scan_range")]
        max_scan_range: u64,
        #[serde(default)]
        mode: verifier::Mode,
    },
    Executor {
        #[serde(deserialize_with = "Url::deserialize_sensitive")]
        rpc_url: Url,
        #[serde(default, deserialize_with = "deserialize_optional_sensitive_url")]
        ws_url: Option<Url>,
        endpoint: EVMAddress,
        executor_contract: EVMAddress,
        signing_key: SigningKey,
        #[serde(default)]
        start_block: Option<u64>,
        #[serde(default = "default_lookback_window")]
        lookback_window: u64,
        #[serde(default = "default_max_scan_range")]
        max_scan_range: u64,
    },
}

impl Config {
    fn watched_endpoint(&self) -> &EVMAddress {
        match self {
            Config::Verifier { endpoint, .. } | Config::Executor { endpoint, .. } => endpoint,
        }
    }
}

fn validate_unique_endpoints<'de, D>(configs: &[Config]) -> Result<(), D::Error>
where
    D: Deserializer<'de>,
{
    if !configs
        .iter()
        .map(Config::watched_endpoint)
        .all_unique()
    {
        return Err(de::Error::custom(
            "each configured handler must watch a distinct endpoint",
        ));
    }

    Ok(())
}

pub fn deserialize_handler_configs<'de, D>(deserializer: D) -> Result<Vec<Config>, D::Error>
where
    D: Deserializer<'de>,
{
    let configs: Vec<Config> = Deserialize::deserialize(deserializer)?;

    validate_unique_endpoints::<D>(&configs)?;

    Ok(configs)
}

#[cfg(test)]
mod tests {
    use super::Config;
    use crate::handlers::verifier::Mode;

    #[test]
    fn deserialize_verifier_with_defaults() {
        let config: Config = toml::from_str(
            "
            type = 'Verifier'
            rpc_url = 'http://localhost:8545/'
            endpoint = '0xcccccccccccccccccccccccccccccccccccccc03'
            destination_rpc_url = 'http://localhost:9545/'
            verifier_contract = '0xeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee05'
            signing_key = '0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d'
            ",
        )
        .unwrap();

        match config {
            Config::Verifier {
                ws_url,
                start_block,
                lookback_window,
                max_scan_range,
                mode,
                ..
            } => {
                assert!(ws_url.is_none());
                assert!(start_block.is_none());
                assert_eq!(lookback_window, 5000);
                assert_eq!(max_scan_range, 2000);
                assert_eq!(mode, Mode::Verify);
            }
            other => panic!("unexpected config {other:?}"),
        }
    }

    #[test]
    fn deserialize_executor_with_explicit_values() {
        let config: Config = toml::from_str(
            "
            type = 'Executor'
            rpc_url = 'http://localhost:9545/'
            ws_url = 'ws://localhost:9546/'
            endpoint = '0xdddddddddddddddddddddddddddddddddddddd04'
            executor_contract = '0xeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee05'
            signing_key = '0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d'
            start_block = 1234
            lookback_window = 100
            max_scan_range = 500
            ",
        )
        .unwrap();

        match config {
            Config::Executor {
                ws_url,
                start_block,
                lookback_window,
                max_scan_range,
                ..
            } => {
                assert!(ws_url.is_some());
                assert_eq!(start_block, Some(1234));
                assert_eq!(lookback_window, 100);
                assert_eq!(max_scan_range, 500);
            }
            other => panic!("unexpected config {other:?}"),
        }
    }

    #[test]
    fn attest_mode_is_selectable() {
        let config: Config = toml::from_str(
            "
            type = 'Verifier'
            rpc_url = 'http://localhost:8545/'
            endpoint = '0xcccccccccccccccccccccccccccccccccccccc03'
            destination_rpc_url = 'http://localhost:9545/'
            verifier_contract = '0xeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee05'
            signing_key = '0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d'
            mode = 'attest'
            ",
        )
        .unwrap();

        assert!(matches!(config, Config::Verifier { mode: Mode::Attest, .. }));
    }

    #[test]
    fn missing_required_field_is_rejected() {
        assert!(toml::from_str::<Config>(
            "
            type = 'Executor'
            rpc_url = 'http://localhost:9545/'
            endpoint = '0xdddddddddddddddddddddddddddddddddddddd04'
            "
        )
        .is_err());
    }

    #[test]
    fn invalid_signing_key_is_rejected() {
        assert!(toml::from_str::<Config>(
            "
            type = 'Executor'
            rpc_url = 'http://localhost:9545/'
            endpoint = '0xdddddddddddddddddddddddddddddddddddddd04'
            executor_contract = '0xeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee05'
            signing_key = 'not hex at all'
            "
        )
        .is_err());
    }
}
