use std::env;
use std::str::FromStr;

const DEFAULT_CHAIN_ID: &str = "solana-mainnet";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "postgres" | "pg" => Ok(StoreBackend::Postgres),
            "memory" | "mem" => Ok(StoreBackend::Memory),
            other => Err(anyhow::anyhow!("unknown STORE_BACKEND: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub store_backend: StoreBackend,
    pub database_url: Option<String>,
    pub host: String,
    pub port: u16,
    /// Bearer token for the operator API. Empty disables auth.
    pub api_token: String,

    // Feeds
    pub wallet_feed_url: Option<String>,
    pub price_feed_url: Option<String>,
    pub feed_chain_id: String,

    // Swap venue credentials (optional: dry run without them)
    pub swap_api_url: Option<String>,
    pub swap_api_key: Option<String>,
    pub swap_api_secret: Option<String>,
    pub dry_run: bool,

    // Workers and queues
    pub evaluator_workers: usize,
    pub executor_workers: usize,
    pub queue_capacity: usize,

    // Trigger and guard
    pub staleness_secs: i64,
    pub intent_ttl_secs: i64,
    pub guard_soft_capacity: usize,
    pub revocation_ttl_secs: i64,

    // Background loops
    pub cursor_checkpoint_secs: u64,
    pub expiry_sweep_secs: u64,
    pub reconcile_interval_secs: u64,
    pub reconcile_stale_secs: i64,

    // Notifications
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            store_backend: StoreBackend::Memory,
            database_url: None,
            host: "0.0.0.0".into(),
            port: 8080,
            api_token: String::new(),
            wallet_feed_url: None,
            price_feed_url: None,
            feed_chain_id: DEFAULT_CHAIN_ID.into(),
            swap_api_url: None,
            swap_api_key: None,
            swap_api_secret: None,
            dry_run: true,
            evaluator_workers: 4,
            executor_workers: 8,
            queue_capacity: 1024,
            staleness_secs: 30,
            intent_ttl_secs: 120,
            guard_soft_capacity: 100_000,
            revocation_ttl_secs: 600,
            cursor_checkpoint_secs: 5,
            expiry_sweep_secs: 15,
            reconcile_interval_secs: 60,
            reconcile_stale_secs: 120,
            telegram_bot_token: None,
            telegram_chat_id: None,
        }
    }
}

/// Parse an env var, falling back to `default` when unset or empty.
fn parse_or<T: FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {key}={raw}: {e}")),
        _ => Ok(default),
    }
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let d = Self::default();
        let store_backend = parse_or("STORE_BACKEND", StoreBackend::Postgres)?;
        let database_url = non_empty("DATABASE_URL");
        if store_backend == StoreBackend::Postgres && database_url.is_none() {
            anyhow::bail!("DATABASE_URL must be set unless STORE_BACKEND=memory");
        }

        Ok(Self {
            store_backend,
            database_url,
            host: env::var("HOST").unwrap_or(d.host),
            port: parse_or("PORT", d.port)?,
            api_token: env::var("API_TOKEN").unwrap_or_default(),

            wallet_feed_url: non_empty("WALLET_FEED_URL"),
            price_feed_url: non_empty("PRICE_FEED_URL"),
            feed_chain_id: non_empty("FEED_CHAIN_ID").unwrap_or(d.feed_chain_id),

            swap_api_url: non_empty("SWAP_API_URL"),
            swap_api_key: non_empty("SWAP_API_KEY"),
            swap_api_secret: non_empty("SWAP_API_SECRET"),
            dry_run: parse_or("DRY_RUN", d.dry_run)?,

            evaluator_workers: parse_or("EVALUATOR_WORKERS", d.evaluator_workers)?,
            executor_workers: parse_or("EXECUTOR_WORKERS", d.executor_workers)?,
            queue_capacity: parse_or("QUEUE_CAPACITY", d.queue_capacity)?,

            staleness_secs: parse_or("STALENESS_SECS", d.staleness_secs)?,
            intent_ttl_secs: parse_or("INTENT_TTL_SECS", d.intent_ttl_secs)?,
            guard_soft_capacity: parse_or("GUARD_SOFT_CAPACITY", d.guard_soft_capacity)?,
            revocation_ttl_secs: parse_or("REVOCATION_TTL_SECS", d.revocation_ttl_secs)?,

            cursor_checkpoint_secs: parse_or("CURSOR_CHECKPOINT_SECS", d.cursor_checkpoint_secs)?,
            expiry_sweep_secs: parse_or("EXPIRY_SWEEP_SECS", d.expiry_sweep_secs)?,
            reconcile_interval_secs: parse_or("RECONCILE_INTERVAL_SECS", d.reconcile_interval_secs)?,
            reconcile_stale_secs: parse_or("RECONCILE_STALE_SECS", d.reconcile_stale_secs)?,

            telegram_bot_token: non_empty("TELEGRAM_BOT_TOKEN"),
            telegram_chat_id: non_empty("TELEGRAM_CHAT_ID"),
        })
    }

    /// Returns true if all swap API credentials are configured.
    pub fn has_swap_auth(&self) -> bool {
        self.swap_api_url.is_some() && self.swap_api_key.is_some() && self.swap_api_secret.is_some()
    }

    /// Live trading needs credentials and an explicit `DRY_RUN=false`.
    pub fn live_trading(&self) -> bool {
        !self.dry_run && self.has_swap_auth()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_backend_parses() {
        assert_eq!("memory".parse::<StoreBackend>().unwrap(), StoreBackend::Memory);
        assert_eq!("Postgres".parse::<StoreBackend>().unwrap(), StoreBackend::Postgres);
        assert!("sqlite".parse::<StoreBackend>().is_err());
    }

    #[test]
    fn test_live_trading_requires_credentials_and_flag() {
        let mut c = AppConfig::default();
        assert!(!c.live_trading());
        c.swap_api_url = Some("https://swap.example".into());
        c.swap_api_key = Some("k".into());
        c.swap_api_secret = Some("s".into());
        assert!(!c.live_trading());
        c.dry_run = false;
        assert!(c.live_trading());
    }
}
