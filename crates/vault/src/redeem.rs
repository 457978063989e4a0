//! Redemption protocol: spend one unit of a token's budget for one copy of
//! the asset.
//!
//! Each attempt reads the record, opens the asset, and then commits the
//! decrement with a conditional write against the bytes it read. Losing the
//! write to a concurrent redeemer sends the attempt back to the read. The
//! asset is opened before the write, so a committed charge always comes with
//! a stream to deliver.
use chrono::Utc;
use rand::Rng;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::asset::{AssetHandle, AssetRegistry};
use crate::error::Result;
use crate::ledger::{Consume, TokenLedger};
use crate::token::{self, TokenRecord};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(10);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedeemPolicy {
    /// Minimum conditional-write attempts before giving up with `Contention`.
    /// A token with more budget left gets `remaining + 1`.
    pub max_attempts: u32,
    /// Upper bound of the random pause between attempts.
    pub backoff: Duration,
    /// Overall limit for one redemption call.
    pub timeout: Option<Duration>,
}

impl Default for RedeemPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
            timeout: Some(DEFAULT_TIMEOUT),
        }
    }
}

impl RedeemPolicy {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn pause(&self) -> Duration {
        let ceiling = self.backoff.as_micros() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(rand::thread_rng().gen_range(0..=ceiling))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// Budget fully spent. Permanent.
    Exhausted,
    /// Lost the race to concurrent redemptions or ran out of time. Retriable.
    Contention,
    /// Nothing has been published yet; no charge was made.
    AssetUnavailable,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::Exhausted => "exhausted",
            DenyReason::Contention => "contention",
            DenyReason::AssetUnavailable => "asset-unavailable",
        }
    }

    pub fn is_retriable(&self) -> bool {
        !matches!(self, DenyReason::Exhausted)
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A committed redemption: the record after the charge and the asset to send.
#[derive(Debug)]
pub struct Grant {
    pub record: TokenRecord,
    pub asset: AssetHandle,
}

#[derive(Debug)]
pub enum Redemption {
    Granted(Grant),
    Denied(DenyReason),
    NotFound,
}

impl Redemption {
    pub fn is_granted(&self) -> bool {
        matches!(self, Redemption::Granted(_))
    }

    pub fn deny_reason(&self) -> Option<DenyReason> {
        match self {
            Redemption::Denied(reason) => Some(*reason),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct Redeemer {
    ledger: TokenLedger,
    assets: AssetRegistry,
    policy: RedeemPolicy,
}

impl Redeemer {
    pub fn new(ledger: TokenLedger, assets: AssetRegistry, policy: RedeemPolicy) -> Self {
        Self {
            ledger,
            assets,
            policy,
        }
    }

    pub fn policy(&self) -> &RedeemPolicy {
        &self.policy
    }

    /// Store faults come back as `Err`; every decision about the token is an
    /// `Ok(Redemption)`.
    pub async fn redeem(&self, token: &str) -> Result<Redemption> {
        let Some(limit) = self.policy.timeout else {
            return self.attempt(token).await;
        };

        match tokio::time::timeout(limit, self.attempt(token)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(
                    "Redemption of {}… timed out after {:?}",
                    token::short(token),
                    limit
                );
                Ok(Redemption::Denied(DenyReason::Contention))
            }
        }
    }

    /// Attempts allowed for a redemption that first saw `remaining` left.
    ///
    /// A lost conditional write means another redeemer committed, and each
    /// commit spends one unit. After `remaining` losses the next read finds
    /// the token exhausted, so `remaining + 1` attempts always reach a
    /// verdict other than contention.
    fn attempt_limit(&self, remaining: u32) -> u32 {
        self.policy
            .max_attempts
            .max(remaining.saturating_add(1))
            .max(1)
    }

    async fn attempt(&self, token: &str) -> Result<Redemption> {
        let mut limit = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let Some(snapshot) = self.ledger.load(token).await? else {
                debug!("Redemption of unknown token");
                return Ok(Redemption::NotFound);
            };
            if snapshot.record.is_exhausted() {
                debug!("Token {}… has no redemptions left", token::short(token));
                return Ok(Redemption::Denied(DenyReason::Exhausted));
            }
            if attempt == 1 {
                limit = self.attempt_limit(snapshot.record.remaining);
            }

            let Some(asset) = self.assets.fetch().await? else {
                warn!(
                    "Token {}… redeemed before any asset was published",
                    token::short(token)
                );
                return Ok(Redemption::Denied(DenyReason::AssetUnavailable));
            };

            match self.ledger.try_consume(token, &snapshot, Utc::now()).await? {
                Consume::Committed(record) => {
                    info!(
                        "Token {}… redeemed ({} of {} left)",
                        token::short(token),
                        record.remaining,
                        record.max
                    );
                    return Ok(Redemption::Granted(Grant { record, asset }));
                }
                Consume::Exhausted => return Ok(Redemption::Denied(DenyReason::Exhausted)),
                Consume::Conflict => {
                    drop(asset);
                    debug!(
                        "Token {}… changed under attempt {}/{}",
                        token::short(token),
                        attempt,
                        limit
                    );
                    if attempt >= limit {
                        break;
                    }
                    tokio::time::sleep(self.policy.pause()).await;
                }
            }
        }

        warn!(
            "Giving up on {}… after {} contended attempts",
            token::short(token),
            limit
        );
        Ok(Redemption::Denied(DenyReason::Contention))
    }
}
