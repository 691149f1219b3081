//! Configuration for Laurel
//!
//! CLI arguments and environment variable handling using clap.

use clap::Parser;
use uuid::Uuid;

use crate::types::{Result, SettlementError};

/// Laurel - settlement and reconciliation core for on-chain learning rewards
#[derive(Parser, Debug, Clone)]
#[command(name = "laurel")]
#[command(about = "Non-custodial settlement core: diploma mints, reward payouts, forum sync")]
pub struct Args {
    /// Unique node identifier for this instance
    #[arg(long, env = "NODE_ID", default_value_t = Uuid::new_v4())]
    pub node_id: Uuid,

    /// Ledger node REST endpoint
    #[arg(long, env = "LEDGER_RPC_URL", default_value = "http://localhost:16110")]
    pub ledger_rpc_url: String,

    /// Public indexer REST endpoint (authoritative conversation state)
    #[arg(long, env = "INDEXER_URL", default_value = "http://localhost:8090")]
    pub indexer_url: String,

    /// MongoDB connection URI
    #[arg(long, env = "MONGODB_URI", default_value = "mongodb://localhost:27017")]
    pub mongodb_uri: String,

    /// MongoDB database name
    #[arg(long, env = "MONGODB_DB", default_value = "laurel")]
    pub mongodb_db: String,

    /// Enable development mode (in-memory stores when MongoDB is down,
    /// open eligibility gate)
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Interval between conversation reconciliation passes, in seconds
    #[arg(long, env = "SYNC_INTERVAL_SECS", default_value = "30")]
    pub sync_interval_secs: u64,

    /// Interval between mint reservation expiry sweeps, in seconds
    #[arg(long, env = "SWEEP_INTERVAL_SECS", default_value = "60")]
    pub sweep_interval_secs: u64,

    /// Mint reservation lifetime in minutes
    #[arg(long, env = "RESERVATION_EXPIRY_MINUTES", default_value = "15")]
    pub reservation_expiry_minutes: i64,

    /// Comma-separated relay/treasury addresses whose reported initiator
    /// must be overridden by the locally known one
    #[arg(long, env = "RELAY_ADDRESSES")]
    pub relay_addresses: Option<String>,

    /// Reject payloads whose funding origin cannot be resolved
    #[arg(long, env = "STRICT_SENDER_CHECK", default_value = "false")]
    pub strict_sender_check: bool,

    /// Treasury address queue-settled transactions spend from
    #[arg(long, env = "FUNDING_ADDRESS")]
    pub funding_address: Option<String>,

    /// Comma-separated whitelist of reward-eligible addresses
    /// (unset = open gate)
    #[arg(long, env = "REWARD_WHITELIST")]
    pub reward_whitelist: Option<String>,

    /// Maximum settlement attempts before a job is dead-lettered
    #[arg(long, env = "QUEUE_MAX_ATTEMPTS", default_value = "5")]
    pub queue_max_attempts: u32,

    /// Address prefix of the target network (e.g. "laurel", "laureltest")
    #[arg(long, env = "NETWORK_PREFIX", default_value = "laurel")]
    pub network_prefix: String,

    /// Token id supply cap applied when a collection is first seen
    #[arg(long, env = "COLLECTION_MAX_SUPPLY", default_value = "1000")]
    pub collection_max_supply: u64,

    /// Outbound HTTP request timeout in milliseconds
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value = "30000")]
    pub request_timeout_ms: u64,
}

impl Args {
    /// Relay addresses as a list
    pub fn relay_address_list(&self) -> Vec<String> {
        split_list(self.relay_addresses.as_deref())
    }

    /// Whitelisted reward addresses as a list; empty means open gate
    pub fn reward_whitelist_list(&self) -> Vec<String> {
        split_list(self.reward_whitelist.as_deref())
    }

    /// Reject configurations that cannot run safely
    pub fn validate(&self) -> Result<()> {
        // Expiry is bounded in minutes: long-lived reservations starve
        // fixed-supply collections
        if self.reservation_expiry_minutes < 1 || self.reservation_expiry_minutes > 120 {
            return Err(SettlementError::Config(format!(
                "reservation expiry must be 1-120 minutes, got {}",
                self.reservation_expiry_minutes
            )));
        }
        if self.queue_max_attempts == 0 {
            return Err(SettlementError::Config(
                "queue max attempts must be at least 1".into(),
            ));
        }
        if !self.dev_mode && self.funding_address.is_none() {
            return Err(SettlementError::Config(
                "FUNDING_ADDRESS is required outside dev mode".into(),
            ));
        }
        Ok(())
    }

    /// Treasury address, with a placeholder in dev mode
    pub fn funding_address(&self) -> String {
        self.funding_address.clone().unwrap_or_else(|| {
            format!("{}:dev-treasury", self.network_prefix)
        })
    }
}

fn split_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        Args::parse_from(["laurel", "--dev-mode"])
    }

    #[test]
    fn test_defaults_validate_in_dev_mode() {
        let args = base_args();
        assert!(args.dev_mode);
        assert!(args.validate().is_ok());
        assert_eq!(args.reservation_expiry_minutes, 15);
        assert_eq!(args.funding_address(), "laurel:dev-treasury");
    }

    #[test]
    fn test_production_requires_funding_address() {
        let args = Args::parse_from(["laurel"]);
        assert!(args.validate().is_err());

        let args = Args::parse_from(["laurel", "--funding-address", "laurel:treasury"]);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_expiry_bounds() {
        let args = Args::parse_from(["laurel", "--dev-mode", "--reservation-expiry-minutes", "0"]);
        assert!(args.validate().is_err());

        let args =
            Args::parse_from(["laurel", "--dev-mode", "--reservation-expiry-minutes", "600"]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_relay_address_list_parsing() {
        let args = Args::parse_from([
            "laurel",
            "--relay-addresses",
            "laurel:treasury, laurel:relay-1,,laurel:relay-2",
        ]);
        assert_eq!(
            args.relay_address_list(),
            vec!["laurel:treasury", "laurel:relay-1", "laurel:relay-2"]
        );
        assert!(Args::parse_from(["laurel"]).relay_address_list().is_empty());
    }
}
