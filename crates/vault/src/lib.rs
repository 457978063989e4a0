//! Download codes with a bounded number of redemptions.
//!
//! An operator issues batches of opaque tokens, each carrying a budget, and
//! publishes one shared archive. Redeeming a token spends one unit of its
//! budget and hands back a stream of the archive.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dropcode::{MemoryStore, Redeemer, RedeemPolicy, Redemption, TokenLedger, AssetRegistry};
//!
//! #[tokio::main]
//! async fn main() -> dropcode::Result<()> {
//!     let store = Arc::new(MemoryStore::new());
//!     let ledger = TokenLedger::new(store.clone());
//!     let assets = AssetRegistry::new(store);
//!
//!     let tokens = ledger.issue(10, 3).await?;
//!     let redeemer = Redeemer::new(ledger, assets, RedeemPolicy::default());
//!
//!     match redeemer.redeem(&tokens[0]).await? {
//!         Redemption::Granted(grant) => println!("{} left", grant.record.remaining),
//!         other => println!("no download: {:?}", other),
//!     }
//!     Ok(())
//! }
//! ```

pub mod asset;
pub mod config;
pub mod error;
pub mod ledger;
pub mod redeem;
pub mod store;
pub mod token;

pub use asset::{AssetHandle, AssetInfo, AssetRegistry};
pub use config::{clamp_batch, clamp_budget, ASSET_CONTENT_TYPE, ASSET_FILENAME};
pub use error::{Result, StoreError, VaultError};
pub use ledger::{ExhaustedToken, TokenLedger};
pub use redeem::{DenyReason, Grant, RedeemPolicy, Redeemer, Redemption};
pub use store::{Blob, BlobInfo, ByteStream, FsStore, KvStore, MemoryStore, Swap};
pub use token::TokenRecord;
