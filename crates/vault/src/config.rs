/// Fewest tokens a single issuance call creates.
pub const MIN_BATCH: u32 = 1;
/// Most tokens a single issuance call creates.
pub const MAX_BATCH: u32 = 5000;
pub const MIN_BUDGET: u32 = 1;
pub const MAX_BUDGET: u32 = 100;

pub const TOKEN_PREFIX: &str = "token:";
pub const ASSET_KEY: &str = "asset:album";

pub const ASSET_FILENAME: &str = "album.zip";
pub const ASSET_CONTENT_TYPE: &str = "application/zip";

/// Chunk size used when a store hands out a blob as a stream.
pub const STREAM_CHUNK: usize = 64 * 1024;

pub fn clamp_batch(count: i64) -> u32 {
    count.clamp(MIN_BATCH as i64, MAX_BATCH as i64) as u32
}

pub fn clamp_budget(max: i64) -> u32 {
    max.clamp(MIN_BUDGET as i64, MAX_BUDGET as i64) as u32
}

pub fn token_key(token: &str) -> String {
    format!("{}{}", TOKEN_PREFIX, token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_clamp() {
        assert_eq!(clamp_batch(0), 1);
        assert_eq!(clamp_batch(-20), 1);
        assert_eq!(clamp_batch(10), 10);
        assert_eq!(clamp_batch(5000), 5000);
        assert_eq!(clamp_batch(i64::MAX), 5000);
    }

    #[test]
    fn test_budget_clamp() {
        assert_eq!(clamp_budget(0), 1);
        assert_eq!(clamp_budget(3), 3);
        assert_eq!(clamp_budget(101), 100);
    }

    #[test]
    fn test_token_key_namespace() {
        assert_eq!(token_key("abc"), "token:abc");
        assert!(!ASSET_KEY.starts_with(TOKEN_PREFIX));
    }
}
