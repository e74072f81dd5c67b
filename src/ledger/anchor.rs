use std::fmt;
use std::sync::Arc;

use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{LedgerError, Result, TraceError};
use crate::keys::RowKey;
use super::client::LedgerClient;
use super::{LedgerCall, TxReceipt, TxStatus};

/// SHA-256 digest of canonical record bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let raw = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(raw).ok()?;
        bytes.try_into().ok().map(ContentHash)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

pub fn content_hash(bytes: &[u8]) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    ContentHash(out)
}

/// Write/read access to the ledger's key→hash audit store.
#[derive(Clone)]
pub struct HashAnchor {
    client: Arc<LedgerClient>,
}

impl HashAnchor {
    pub fn new(client: Arc<LedgerClient>) -> Self {
        Self { client }
    }

    /// Submit `storeHash(key, hash)`. A revert is an `AnchorWrite` error; an
    /// indeterminate outcome (timeout, connection loss) is `AnchorUnavailable`.
    pub async fn write(&self, key: &RowKey, hash: &ContentHash) -> Result<TxReceipt> {
        debug!("storeHash {} -> {}", key, hash);

        let receipt = self.client
            .send(LedgerCall::StoreHash { key: *key, hash: *hash })
            .await
            .map_err(|e| map_anchor_error(key, e))?;

        match &receipt.status {
            TxStatus::Success => {
                info!("⛓  storeHash tx = {} (block {})", receipt.tx_hash, receipt.block);
                Ok(receipt)
            }
            TxStatus::Reverted(reason) => Err(TraceError::AnchorWrite {
                row_key: key.to_hex(),
                reason: format!("tx {} reverted: {}", receipt.tx_hash, reason),
            }),
        }
    }

    /// Stored hash for `key`, or `None` if nothing was ever anchored there.
    pub async fn read(&self, key: &RowKey) -> Result<Option<ContentHash>> {
        self.client
            .get_proof(key)
            .await
            .map_err(|e| map_anchor_error(key, e))
    }
}

fn map_anchor_error(key: &RowKey, err: LedgerError) -> TraceError {
    match err {
        e if e.is_indeterminate() => TraceError::AnchorUnavailable(format!("{} ({})", e, key)),
        LedgerError::Reverted { reason, tx_hash, .. } => TraceError::AnchorWrite {
            row_key: key.to_hex(),
            reason: format!("tx {} reverted: {}", tx_hash, reason),
        },
        other => TraceError::Ledger(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            content_hash(b"abc").to_hex(),
            "0xba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_sha256_deterministic() {
        assert_eq!(content_hash(b"hello world"), content_hash(b"hello world"));
        assert_ne!(content_hash(b"hello"), content_hash(b"world"));
    }

    #[test]
    fn test_hex_parse() {
        let h = content_hash(b"x");
        assert_eq!(ContentHash::from_hex(&h.to_hex()), Some(h));
        assert_eq!(ContentHash::from_hex("0xzz"), None);
    }
}
