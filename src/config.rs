//! Configuration for the facilitator server, loaded from environment variables.
//!
//! `.env` values are loaded by the entrypoint before this module reads anything.
//! The settlement backend is selected by `SETTLEMENT_MODE`:
//!
//! - `demo` — deterministic in-process settlement, no further configuration;
//! - `chain` — requires `RPC_URL` and `EXPECTED_CHAIN_ID`; `PRIVATE_KEY` is
//!   optional (verification works without it, settlement does not);
//! - `remote` — requires `FACILITATOR_URL`.

use alloy::signers::local::PrivateKeySigner;
use std::env;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

use crate::challenge::random_hex;
use crate::types::{EvmAddress, Network, TokenAmount};

const ENV_HOST: &str = "HOST";
const ENV_PORT: &str = "PORT";
const ENV_SETTLEMENT_MODE: &str = "SETTLEMENT_MODE";
const ENV_NETWORK: &str = "NETWORK";
const ENV_RPC_URL: &str = "RPC_URL";
const ENV_EXPECTED_CHAIN_ID: &str = "EXPECTED_CHAIN_ID";
const ENV_PRIVATE_KEY: &str = "PRIVATE_KEY";
const ENV_CONFIRMATIONS: &str = "CONFIRMATIONS";
const ENV_RPC_TIMEOUT_MS: &str = "RPC_TIMEOUT_MS";
const ENV_FACILITATOR_URL: &str = "FACILITATOR_URL";
const ENV_JWT_SECRET: &str = "JWT_SECRET";
const ENV_CHALLENGE_TTL_SECS: &str = "CHALLENGE_TTL_SECS";
const ENV_ACCESS_TTL_SECS: &str = "ACCESS_TTL_SECS";
const ENV_REFRESH_TTL_SECS: &str = "REFRESH_TTL_SECS";
const ENV_PROBE_TTL_SECS: &str = "PROBE_TTL_SECS";
const ENV_GATE_ASSET: &str = "GATE_ASSET";
const ENV_GATE_PAY_TO: &str = "GATE_PAY_TO";
const ENV_GATE_PRICE: &str = "GATE_PRICE";
const ENV_GATE_BUDGET: &str = "GATE_BUDGET";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("env {0} not set")]
    Missing(&'static str),
    #[error("env {key} is invalid: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Settlement backend selection.
#[derive(Clone)]
pub enum SettlementConfig {
    Demo,
    Chain {
        rpc_url: Url,
        network: Network,
        expected_chain_id: u64,
        signer: Option<PrivateKeySigner>,
        confirmations: u64,
        rpc_timeout: Duration,
    },
    Remote {
        facilitator_url: Url,
        timeout: Duration,
    },
}

/// Pricing of the built-in gated demo route.
#[derive(Debug, Clone)]
pub struct GateConfig {
    pub network: Network,
    pub asset: EvmAddress,
    pub pay_to: EvmAddress,
    pub price: TokenAmount,
    pub budget: Option<TokenAmount>,
}

/// Fully resolved server configuration.
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub network: Network,
    pub settlement: SettlementConfig,
    pub jwt_secret: Vec<u8>,
    pub challenge_ttl: Duration,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
    pub probe_ttl: Duration,
    pub gate: GateConfig,
}

impl Config {
    /// Reads configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = parse_or(ENV_HOST, IpAddr::from([0, 0, 0, 0]))?;
        let port = parse_or(ENV_PORT, 8402u16)?;
        let network = parse_or(ENV_NETWORK, Network::KiteTestnet)?;

        let settlement = match env::var(ENV_SETTLEMENT_MODE).as_deref() {
            Err(_) | Ok("demo") => SettlementConfig::Demo,
            Ok("chain") => {
                let rpc_url = require_parsed::<Url>(ENV_RPC_URL)?;
                let expected_chain_id = match env::var(ENV_EXPECTED_CHAIN_ID) {
                    Ok(raw) => raw.parse::<u64>().map_err(|e| ConfigError::Invalid {
                        key: ENV_EXPECTED_CHAIN_ID,
                        reason: e.to_string(),
                    })?,
                    Err(_) => network.chain_id(),
                };
                let signer = match env::var(ENV_PRIVATE_KEY) {
                    Ok(raw) => Some(PrivateKeySigner::from_str(raw.trim()).map_err(|e| {
                        ConfigError::Invalid {
                            key: ENV_PRIVATE_KEY,
                            reason: e.to_string(),
                        }
                    })?),
                    Err(_) => None,
                };
                let confirmations = parse_or(ENV_CONFIRMATIONS, 1u64)?;
                let rpc_timeout = Duration::from_millis(parse_or(ENV_RPC_TIMEOUT_MS, 10_000u64)?);
                SettlementConfig::Chain {
                    rpc_url,
                    network,
                    expected_chain_id,
                    signer,
                    confirmations,
                    rpc_timeout,
                }
            }
            Ok("remote") => {
                let facilitator_url = require_parsed::<Url>(ENV_FACILITATOR_URL)?;
                let timeout = Duration::from_millis(parse_or(ENV_RPC_TIMEOUT_MS, 10_000u64)?);
                SettlementConfig::Remote {
                    facilitator_url,
                    timeout,
                }
            }
            Ok(other) => {
                return Err(ConfigError::Invalid {
                    key: ENV_SETTLEMENT_MODE,
                    reason: format!("unknown mode {other}, expected demo|chain|remote"),
                });
            }
        };

        let jwt_secret = match env::var(ENV_JWT_SECRET) {
            Ok(secret) => secret.into_bytes(),
            Err(_) => {
                tracing::warn!(
                    "env {ENV_JWT_SECRET} not set, using a process-local random secret; \
                     sessions will not survive a restart"
                );
                random_hex(32).into_bytes()
            }
        };

        let challenge_ttl = Duration::from_secs(parse_or(ENV_CHALLENGE_TTL_SECS, 300u64)?);
        let access_ttl = Duration::from_secs(parse_or(ENV_ACCESS_TTL_SECS, 900u64)?);
        let refresh_ttl = Duration::from_secs(parse_or(ENV_REFRESH_TTL_SECS, 86_400u64)?);
        let probe_ttl = Duration::from_secs(parse_or(ENV_PROBE_TTL_SECS, 30u64)?);

        let gate = GateConfig {
            network,
            asset: require_parsed::<EvmAddress>(ENV_GATE_ASSET)?,
            pay_to: require_parsed::<EvmAddress>(ENV_GATE_PAY_TO)?,
            price: require_parsed::<TokenAmount>(ENV_GATE_PRICE)?,
            budget: match env::var(ENV_GATE_BUDGET) {
                Ok(raw) => Some(raw.parse::<TokenAmount>().map_err(|e| {
                    ConfigError::Invalid {
                        key: ENV_GATE_BUDGET,
                        reason: e.to_string(),
                    }
                })?),
                Err(_) => None,
            },
        };

        Ok(Config {
            host,
            port,
            network,
            settlement,
            jwt_secret,
            challenge_ttl,
            access_ttl,
            refresh_ttl,
            probe_ttl,
            gate,
        })
    }
}

fn parse_or<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
            key,
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn require_parsed<T>(key: &'static str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = env::var(key).map_err(|_| ConfigError::Missing(key))?;
    raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
        key,
        reason: e.to_string(),
    })
}
