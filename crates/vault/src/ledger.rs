//! Token Ledger: the only writer of token records.
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{clamp_batch, clamp_budget, token_key, TOKEN_PREFIX};
use crate::error::{Result, StoreError, VaultError};
use crate::store::{KvStore, Swap};
use crate::token::{self, TokenRecord};

/// A record together with the exact bytes it was read from.
///
/// The bytes are the expectation for the conditional write, so a write based
/// on this snapshot only lands if nobody changed the record in between.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub record: TokenRecord,
    raw: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Consume {
    Committed(TokenRecord),
    Exhausted,
    /// Someone else changed the record since the snapshot was taken.
    Conflict,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExhaustedToken {
    pub token: String,
    pub exhausted_at: DateTime<Utc>,
    pub max: u32,
}

#[derive(Clone)]
pub struct TokenLedger {
    store: Arc<dyn KvStore>,
}

impl TokenLedger {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Create `count` fresh tokens with `max` redemptions each.
    ///
    /// Both arguments are clamped into the allowed ranges. A store fault
    /// aborts the rest of the batch; tokens written before it stay valid.
    pub async fn issue(&self, count: i64, max: i64) -> Result<Vec<String>> {
        let count = clamp_batch(count) as usize;
        let max = clamp_budget(max);
        let record = TokenRecord::new(max, Utc::now());
        let value = encode(&record)?;

        let mut tokens = Vec::with_capacity(count);
        while tokens.len() < count {
            let token = token::generate_token();
            let outcome = match self
                .store
                .put_if_unchanged(&token_key(&token), None, &value)
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(
                        "Store fault after issuing {} of {} tokens: {}",
                        tokens.len(),
                        count,
                        e
                    );
                    return Err(e.into());
                }
            };
            match outcome {
                Swap::Committed => tokens.push(token),
                Swap::Conflict => warn!("Generated token collided with an existing one, drawing again"),
            }
        }

        info!("Issued {} tokens with {} redemptions each", tokens.len(), max);
        Ok(tokens)
    }

    /// Current record of `token`, `None` if it was never issued. Read only.
    pub async fn status(&self, token: &str) -> Result<Option<TokenRecord>> {
        Ok(self.load(token).await?.map(|s| s.record))
    }

    pub async fn load(&self, token: &str) -> Result<Option<Snapshot>> {
        if !token::is_well_formed(token) {
            debug!("Rejected malformed token lookup");
            return Ok(None);
        }

        let Some(raw) = self.store.get(&token_key(token)).await? else {
            return Ok(None);
        };
        let record = decode(token, &raw)?;
        Ok(Some(Snapshot { record, raw }))
    }

    /// Spend one redemption, but only if the record still matches `snapshot`.
    pub async fn try_consume(
        &self,
        token: &str,
        snapshot: &Snapshot,
        now: DateTime<Utc>,
    ) -> Result<Consume> {
        let Some(next) = snapshot.record.consume(now) else {
            return Ok(Consume::Exhausted);
        };
        let value = encode(&next)?;

        match self
            .store
            .put_if_unchanged(&token_key(token), Some(&snapshot.raw), &value)
            .await?
        {
            Swap::Committed => {
                if next.is_exhausted() {
                    info!("Token {}… exhausted", token::short(token));
                }
                Ok(Consume::Committed(next))
            }
            Swap::Conflict => Ok(Consume::Conflict),
        }
    }

    /// Every exhausted token, oldest exhaustion first.
    pub async fn exhausted(&self) -> Result<Vec<ExhaustedToken>> {
        let mut exhausted = Vec::new();
        for key in self.store.list(TOKEN_PREFIX).await? {
            let token = &key[TOKEN_PREFIX.len()..];
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            let record = match decode(token, &raw) {
                Ok(record) => record,
                Err(e) => {
                    warn!("Skipping unreadable record: {}", e);
                    continue;
                }
            };
            if let Some(exhausted_at) = record.exhausted_at {
                exhausted.push(ExhaustedToken {
                    token: token.to_string(),
                    exhausted_at,
                    max: record.max,
                });
            }
        }

        exhausted.sort_by(|a, b| a.exhausted_at.cmp(&b.exhausted_at));
        Ok(exhausted)
    }
}

fn encode(record: &TokenRecord) -> Result<Vec<u8>> {
    serde_json::to_vec(record).map_err(|e| StoreError::Serialization(e.to_string()).into())
}

fn decode(token: &str, raw: &[u8]) -> Result<TokenRecord> {
    serde_json::from_slice(raw).map_err(|e| VaultError::CorruptRecord {
        token: token::short(token).to_string(),
        reason: e.to_string(),
    })
}
