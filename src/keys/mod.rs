use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};
use sha3::{Digest, Keccak256};

use crate::error::{Result, TraceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Produce,
    Ship,
    Deliver,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Produce, Stage::Ship, Stage::Deliver];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Produce => "produce",
            Stage::Ship => "ship",
            Stage::Deliver => "deliver",
        }
    }

    /// Whether the key template for this stage embeds the event timestamp.
    pub fn is_timestamped(&self) -> bool {
        !matches!(self, Stage::Produce)
    }

    /// Text that is hashed into the row key.
    pub fn key_template(&self, bottle_id: &str, ts: Option<i64>) -> Result<String> {
        match (self, ts) {
            (Stage::Produce, _) => Ok(format!("wine_batch:{}", bottle_id)),
            (Stage::Ship, Some(ts)) => Ok(format!("ship:{}:{}", bottle_id, ts)),
            (Stage::Deliver, Some(ts)) => Ok(format!("deliver:{}:{}", bottle_id, ts)),
            (stage, None) => Err(TraceError::KeyDerivation(format!(
                "{} key for bottle '{}' requires a timestamp",
                stage, bottle_id
            ))),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "produce" => Ok(Stage::Produce),
            "ship" => Ok(Stage::Ship),
            "deliver" => Ok(Stage::Deliver),
            other => Err(format!("Unknown stage '{}'. Expected produce, ship or deliver", other)),
        }
    }
}

impl Serialize for Stage {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

macro_rules! key_type {
    ($name:ident) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// 0x-prefixed lowercase hex.
            pub fn to_hex(&self) -> String {
                format!("0x{}", hex::encode(self.0))
            }

            pub fn from_hex(s: &str) -> Result<Self> {
                let raw = s.strip_prefix("0x").unwrap_or(s);
                let bytes = hex::decode(raw)
                    .map_err(|e| TraceError::KeyDerivation(format!("Invalid hex key '{}': {}", s, e)))?;
                let arr: [u8; 32] = bytes.try_into().map_err(|_| {
                    TraceError::KeyDerivation(format!("Key '{}' is not 32 bytes", s))
                })?;
                Ok(Self(arr))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }
    };
}

key_type!(RowKey);
key_type!(BottleKey);

fn keccak256(text: &str) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(text.as_bytes());
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Key under which a stage record's hash is anchored.
pub fn row_key(stage: Stage, bottle_id: &str, ts: Option<i64>) -> Result<RowKey> {
    let template = stage.key_template(bottle_id, ts)?;
    Ok(RowKey(keccak256(&template)))
}

/// Stable ledger-side identifier of a bottle's lifecycle entry.
pub fn bottle_key(bottle_id: &str) -> BottleKey {
    BottleKey(keccak256(&format!("bottle:{}", bottle_id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_keccak_matches_known_vector() {
        // keccak256("") from the Ethereum yellow paper
        assert_eq!(
            hex::encode(keccak256("")),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn test_templates() {
        assert_eq!(Stage::Produce.key_template("coco1514", None).unwrap(), "wine_batch:coco1514");
        assert_eq!(Stage::Produce.key_template("coco1514", Some(5)).unwrap(), "wine_batch:coco1514");
        assert_eq!(Stage::Ship.key_template("coco1514", Some(1700000000)).unwrap(), "ship:coco1514:1700000000");
        assert_eq!(Stage::Deliver.key_template("coco1514", Some(1700050000)).unwrap(), "deliver:coco1514:1700050000");
    }

    #[test]
    fn test_timestamped_stage_requires_ts() {
        let err = row_key(Stage::Ship, "coco1514", None).unwrap_err();
        assert!(err.to_string().contains("requires a timestamp"));
    }

    #[test]
    fn test_row_key_is_stable() {
        let a = row_key(Stage::Ship, "coco1514", Some(1700000000)).unwrap();
        let b = row_key(Stage::Ship, "coco1514", Some(1700000000)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_bottle_key_differs_from_produce_key() {
        let bk = bottle_key("coco1514");
        let rk = row_key(Stage::Produce, "coco1514", None).unwrap();
        assert_ne!(bk.0, rk.0);
    }

    #[test]
    fn test_no_collisions_over_corpus() {
        let mut seen = HashSet::new();
        for bottle in 0..40 {
            let id = format!("bottle{}", bottle);
            assert!(seen.insert(row_key(Stage::Produce, &id, None).unwrap().0));
            for ts in 1700000000..1700000015 {
                assert!(seen.insert(row_key(Stage::Ship, &id, Some(ts)).unwrap().0));
                assert!(seen.insert(row_key(Stage::Deliver, &id, Some(ts)).unwrap().0));
            }
        }
        assert_eq!(seen.len(), 40 * (1 + 2 * 15));
    }

    #[test]
    fn test_hex_roundtrip_and_prefix() {
        let key = bottle_key("coco1514");
        let hex = key.to_hex();
        assert!(hex.starts_with("0x"));
        assert_eq!(hex.len(), 66);
        assert_eq!(BottleKey::from_hex(&hex).unwrap(), key);
        assert!(BottleKey::from_hex("0x1234").is_err());
    }

    #[test]
    fn test_stage_from_str() {
        assert_eq!("SHIP".parse::<Stage>().unwrap(), Stage::Ship);
        assert!("sell".parse::<Stage>().is_err());
    }
}
