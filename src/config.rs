#![allow(dead_code)]

//! Environment-scoped configuration (spec §6). Loads `.env` if present, then
//! reads from the process environment; validates once at startup.

use eyre::{eyre, Result, WrapErr};
use std::env;
use std::fmt;
use std::path::Path;

/// Top-level configuration, one sub-struct per concern.
#[derive(Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub chain: ChainConfig,
    pub hd_wallet: HdWalletConfig,
    pub wallets: WalletConfig,
    pub jwt: JwtConfig,
    pub api_key: ApiKeyConfig,
    pub webhook: WebhookConfig,
    pub custodial: Option<CustodialConfig>,
}

#[derive(Clone)]
pub struct ServerConfig {
    pub port: u16,
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig").field("port", &self.port).finish()
    }
}

#[derive(Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig").field("url", &"<redacted>").finish()
    }
}

#[derive(Clone)]
pub struct QueueConfig {
    pub rabbitmq_url: String,
}

impl fmt::Debug for QueueConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueConfig")
            .field("rabbitmq_url", &"<redacted>")
            .finish()
    }
}

/// BNB Smart Chain node configuration. `rpc_url`/`ws_url` may each carry a
/// comma-separated fallback list (see `rpc_fallback::parse_rpc_urls`).
#[derive(Clone)]
pub struct ChainConfig {
    pub rpc_url: String,
    pub rpc_fallback_urls: Vec<String>,
    pub ws_url: Option<String>,
    pub chain_id: u64,
    pub usdt_contract_address: String,
    pub required_confirmations: u32,
    pub reorg_rewind_blocks: u64,
    pub poll_interval_ms: u64,
}

impl fmt::Debug for ChainConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainConfig")
            .field("rpc_url", &self.rpc_url)
            .field("rpc_fallback_urls", &self.rpc_fallback_urls)
            .field("ws_url", &self.ws_url)
            .field("chain_id", &self.chain_id)
            .field("usdt_contract_address", &self.usdt_contract_address)
            .field("required_confirmations", &self.required_confirmations)
            .field("reorg_rewind_blocks", &self.reorg_rewind_blocks)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .finish()
    }
}

/// The HD mnemonic and path template. Never logged, never returned by any API
/// (spec §4.1 Key policy). Consumed only by `secrets::SecretRegistry`.
#[derive(Clone)]
pub struct HdWalletConfig {
    pub mnemonic: String,
    pub path_template: String,
    pub encryption_key: [u8; 32],
}

impl fmt::Debug for HdWalletConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HdWalletConfig")
            .field("mnemonic", &"<redacted>")
            .field("path_template", &self.path_template)
            .field("encryption_key", &"<redacted>")
            .finish()
    }
}

#[derive(Clone)]
pub struct WalletConfig {
    pub cold_wallet_address: String,
    pub hot_wallet_threshold: rust_decimal::Decimal,
    pub hot_wallet_target_reserve: rust_decimal::Decimal,
}

impl fmt::Debug for WalletConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletConfig")
            .field("cold_wallet_address", &self.cold_wallet_address)
            .field("hot_wallet_threshold", &self.hot_wallet_threshold)
            .field("hot_wallet_target_reserve", &self.hot_wallet_target_reserve)
            .finish()
    }
}

#[derive(Clone)]
pub struct JwtConfig {
    pub secret: String,
    pub expiration_secs: u64,
}

impl fmt::Debug for JwtConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtConfig")
            .field("secret", &"<redacted>")
            .field("expiration_secs", &self.expiration_secs)
            .finish()
    }
}

#[derive(Clone)]
pub struct ApiKeyConfig {
    pub salt: String,
}

impl fmt::Debug for ApiKeyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKeyConfig").field("salt", &"<redacted>").finish()
    }
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub default_secret: String,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
}

#[derive(Clone)]
pub struct CustodialConfig {
    pub binance_api_key: String,
    pub binance_api_secret: String,
    pub binance_api_url: String,
}

impl fmt::Debug for CustodialConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustodialConfig")
            .field("binance_api_key", &"<redacted>")
            .field("binance_api_secret", &"<redacted>")
            .field("binance_api_url", &self.binance_api_url)
            .finish()
    }
}

fn default_port() -> u16 {
    3000
}
fn default_confirmations() -> u32 {
    12
}
fn default_rewind() -> u64 {
    50
}
fn default_poll_ms() -> u64 {
    5000
}
fn default_webhook_max_retries() -> u32 {
    5
}
fn default_webhook_retry_delay() -> u64 {
    15
}
fn default_jwt_expiration() -> u64 {
    3600
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env").or_else(|_| Self::load_from_env())
    }

    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {path}"))?;
        }
        Self::load_from_env()
    }

    fn load_from_env() -> Result<Self> {
        let server = ServerConfig {
            port: env::var("PORT").ok().and_then(|v| v.parse().ok()).unwrap_or_else(default_port),
        };

        let database = DatabaseConfig {
            url: require_env("DATABASE_URL")?,
        };

        let queue = QueueConfig {
            rabbitmq_url: require_env("RABBITMQ_URL")?,
        };

        let rpc_raw = require_env("BSC_MAINNET_RPC_URL").or_else(|_| require_env("BSC_RPC_URL"))?;
        let rpc_urls = crate::rpc_fallback::parse_rpc_urls(&rpc_raw);
        if rpc_urls.is_empty() {
            return Err(eyre!("BSC_RPC_URL cannot be empty"));
        }

        let chain = ChainConfig {
            rpc_url: rpc_urls[0].clone(),
            rpc_fallback_urls: rpc_urls[1..].to_vec(),
            ws_url: env::var("BSC_MAINNET_WS_URL").ok().or_else(|| env::var("BSC_WS_URL").ok()),
            chain_id: env::var("BSC_CHAIN_ID").ok().and_then(|v| v.parse().ok()).unwrap_or(56),
            usdt_contract_address: require_env("USDT_CONTRACT_ADDRESS")?,
            required_confirmations: env::var("REQUIRED_CONFIRMATIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_confirmations),
            reorg_rewind_blocks: env::var("REORG_REWIND_BLOCKS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_rewind),
            poll_interval_ms: env::var("CHAIN_POLL_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_poll_ms),
        };

        let mnemonic = require_env("HD_WALLET_MNEMONIC")?;
        let mnemonic_words: Vec<&str> = mnemonic.split_whitespace().collect();
        if mnemonic_words.len() < 12 {
            return Err(eyre!("HD_WALLET_MNEMONIC must be a valid BIP-39 mnemonic (>= 12 words)"));
        }

        let encryption_key = derive_encryption_key(&require_env("API_KEY_SALT").unwrap_or_default());

        let hd_wallet = HdWalletConfig {
            mnemonic,
            path_template: env::var("HD_WALLET_PATH_TEMPLATE")
                .unwrap_or_else(|_| "m/44'/60'/0'/0/{index}".to_string()),
            encryption_key,
        };

        let wallets = WalletConfig {
            cold_wallet_address: require_env("COLD_WALLET_ADDRESS")?,
            hot_wallet_threshold: parse_decimal_env("HOT_WALLET_THRESHOLD")?,
            hot_wallet_target_reserve: env::var("HOT_WALLET_TARGET_RESERVE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
        };

        let jwt = JwtConfig {
            secret: require_env("JWT_SECRET")?,
            expiration_secs: env::var("JWT_EXPIRATION")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_jwt_expiration),
        };

        let api_key = ApiKeyConfig {
            salt: require_env("API_KEY_SALT")?,
        };

        let webhook = WebhookConfig {
            default_secret: require_env("WEBHOOK_SECRET")?,
            max_retries: env::var("WEBHOOK_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_webhook_max_retries),
            retry_delay_secs: env::var("WEBHOOK_RETRY_DELAY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_webhook_retry_delay),
        };

        let custodial = match (
            env::var("BINANCE_API_KEY").ok(),
            env::var("BINANCE_API_SECRET").ok(),
        ) {
            (Some(binance_api_key), Some(binance_api_secret)) => Some(CustodialConfig {
                binance_api_key,
                binance_api_secret,
                binance_api_url: env::var("BINANCE_API_URL")
                    .unwrap_or_else(|_| "https://api.binance.com".to_string()),
            }),
            _ => None,
        };

        let config = Config {
            server,
            database,
            queue,
            chain,
            hd_wallet,
            wallets,
            jwt,
            api_key,
            webhook,
            custodial,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(eyre!("database.url cannot be empty"));
        }
        if self.chain.rpc_url.is_empty() {
            return Err(eyre!("chain.rpc_url cannot be empty"));
        }
        if !self.chain.usdt_contract_address.starts_with("0x")
            || self.chain.usdt_contract_address.len() != 42
        {
            return Err(eyre!("USDT_CONTRACT_ADDRESS must be a 0x-prefixed 20-byte address"));
        }
        if self.chain.required_confirmations == 0 {
            return Err(eyre!("REQUIRED_CONFIRMATIONS must be >= 1"));
        }
        if self.wallets.hot_wallet_threshold <= rust_decimal::Decimal::ZERO {
            return Err(eyre!("HOT_WALLET_THRESHOLD must be > 0"));
        }
        Ok(())
    }
}

fn require_env(key: &str) -> Result<String> {
    env::var(key).map_err(|_| eyre!("{key} environment variable is required"))
}

fn parse_decimal_env(key: &str) -> Result<rust_decimal::Decimal> {
    require_env(key)?
        .parse()
        .wrap_err_with(|| format!("{key} must be a valid decimal"))
}

/// Derive a 32-byte AES-256-GCM key from the deployment secret (spec §4.1:
/// "symmetric encryption with a key derived from a deployment secret").
fn derive_encryption_key(deployment_secret: &str) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(b"usdt-gateway-address-key-encryption");
    hasher.update(deployment_secret.as_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encryption_key_is_deterministic_per_secret() {
        assert_eq!(derive_encryption_key("abc"), derive_encryption_key("abc"));
        assert_ne!(derive_encryption_key("abc"), derive_encryption_key("xyz"));
    }
}
