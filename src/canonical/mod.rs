mod encoder;

use serde_json::{Map, Value};

use crate::error::{Result, TraceError};
use crate::keys::Stage;
use crate::ledger::{content_hash, ContentHash};

pub use encoder::{encode_object, encode_value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Integer,
    /// Integer restricted to 0 or 1.
    Flag,
}

pub const SHIP_FIELDS: &[(&str, FieldKind)] = &[
    ("location", FieldKind::Text),
    ("status", FieldKind::Text),
    ("ts", FieldKind::Integer),
    ("is_milestone", FieldKind::Flag),
    ("bottle_id", FieldKind::Text),
];

pub const DELIVER_FIELDS: &[(&str, FieldKind)] = &[
    ("bottle_id", FieldKind::Text),
    ("store", FieldKind::Text),
    ("ts", FieldKind::Integer),
];

/// Allow-list for a stage; `None` means the whole submission snapshot is hashed.
pub fn allow_list(stage: Stage) -> Option<&'static [(&'static str, FieldKind)]> {
    match stage {
        Stage::Produce => None,
        Stage::Ship => Some(SHIP_FIELDS),
        Stage::Deliver => Some(DELIVER_FIELDS),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRecord {
    pub stage: Stage,
    fields: Map<String, Value>,
}

impl CanonicalRecord {
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn to_json(&self) -> String {
        encode_object(&self.fields)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_json().into_bytes()
    }

    pub fn content_hash(&self) -> ContentHash {
        content_hash(&self.to_bytes())
    }
}

/// Build the canonical record for `stage` from `source`.
///
/// For produce, `source` must be the submission object as received. For ship
/// and deliver, `source` may be a full stored row; only allow-listed fields are
/// kept, in allow-list order, and each must have the declared type.
pub fn canonicalize(stage: Stage, source: &Map<String, Value>) -> Result<CanonicalRecord> {
    let fields = match allow_list(stage) {
        None => source.clone(),
        Some(allowed) => project(stage, source, allowed)?,
    };
    Ok(CanonicalRecord { stage, fields })
}

fn project(
    stage: Stage,
    source: &Map<String, Value>,
    allowed: &[(&str, FieldKind)],
) -> Result<Map<String, Value>> {
    let mut fields = Map::new();
    for (name, kind) in allowed {
        let value = source.get(*name).ok_or_else(|| {
            TraceError::Canonical(format!("{} record is missing field '{}'", stage, name))
        })?;
        check_kind(stage, name, *kind, value)?;
        fields.insert((*name).to_string(), value.clone());
    }
    Ok(fields)
}

fn check_kind(stage: Stage, name: &str, kind: FieldKind, value: &Value) -> Result<()> {
    let ok = match kind {
        FieldKind::Text => value.is_string(),
        FieldKind::Integer => value.is_i64() || value.is_u64(),
        FieldKind::Flag => matches!(value.as_u64(), Some(0) | Some(1)),
    };
    if ok {
        Ok(())
    } else {
        Err(TraceError::Canonical(format!(
            "{} field '{}' must be {:?}, got {}",
            stage, name, kind, value
        )))
    }
}
