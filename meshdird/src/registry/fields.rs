//! Field extraction and validation for `commit_service`.

use shared::codec::{Map, Value};
use shared::protocol::{RECORD_VERSION, TXT_DESCRIPTION, TXT_ICON, TXT_NAME, TXT_URI};
use shared::types::{Fingerprint, ServiceRecord};

use super::{CommitError, Rejection};
use crate::discovery::txt;

/// Most categories a record may carry (16-bit list count on the wire).
pub const MAX_CATEGORIES: usize = u16::MAX as usize;

const REQUIRED: [&str; 4] = ["name", "description", "uri", "icon"];

/// Fields supplied by a `commit_service` call.
#[derive(Debug)]
pub struct CommitFields {
    pub name: String,
    pub description: String,
    pub uri: String,
    pub icon: String,
    pub ttl: Option<u64>,
    pub lifetime: Option<u64>,
    pub categories: Option<Vec<String>>,
    pub key: Option<Fingerprint>,
}

impl CommitFields {
    pub fn from_map(map: &Map) -> Result<Self, CommitError> {
        let missing: Vec<&'static str> = REQUIRED
            .into_iter()
            .filter(|field| map.get(field).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(CommitError::MissingFields(missing));
        }

        let key = match map.get("key") {
            None => None,
            Some(value) => {
                let text = value.as_str().ok_or(CommitError::InvalidField {
                    field: "key",
                    reason: "must be a string",
                })?;
                Some(Fingerprint::parse(text)?)
            }
        };

        // Non-empty lists replace the stored categories; anything else keeps them.
        let categories = match map.get("categories").and_then(Value::as_list) {
            Some(items) if !items.is_empty() => Some(
                items
                    .iter()
                    .map(|item| {
                        item.as_str().map(str::to_string).ok_or(CommitError::InvalidField {
                            field: "categories",
                            reason: "entries must be strings",
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            _ => None,
        };

        Ok(Self {
            name: required_str(map, "name")?,
            description: required_str(map, "description")?,
            uri: required_str(map, "uri")?,
            icon: required_str(map, "icon")?,
            ttl: map.get("ttl").and_then(Value::as_u64),
            lifetime: map.get("lifetime").and_then(Value::as_u64),
            categories,
            key,
        })
    }

    /// Writes the supplied fields over `record`.
    pub fn apply(self, record: &mut ServiceRecord) -> Result<(), Rejection> {
        record.version = RECORD_VERSION.to_string();
        record.name = self.name;
        record.description = self.description;
        record.uri = self.uri;
        record.icon = self.icon;
        if let Some(ttl) = self.ttl {
            record.ttl = u8::try_from(ttl).map_err(|_| Rejection::Field {
                field: "ttl",
                reason: "does not fit in 8 bits",
            })?;
        }
        if let Some(lifetime) = self.lifetime {
            record.lifetime = u32::try_from(lifetime).map_err(|_| Rejection::Field {
                field: "lifetime",
                reason: "does not fit in 32 bits",
            })?;
        }
        if let Some(categories) = self.categories {
            record.categories = categories;
        }
        Ok(())
    }
}

fn required_str(map: &Map, field: &'static str) -> Result<String, CommitError> {
    map.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(CommitError::InvalidField {
            field,
            reason: "must be a string",
        })
}

/// Checks a record is fit for signing and publication.
pub fn validate(record: &ServiceRecord) -> Result<(), Rejection> {
    for (field, key, value) in [
        ("name", TXT_NAME, &record.name),
        ("description", TXT_DESCRIPTION, &record.description),
        ("uri", TXT_URI, &record.uri),
        ("icon", TXT_ICON, &record.icon),
    ] {
        check_text(field, key, value)?;
    }

    url::Url::parse(&record.uri).map_err(|_| Rejection::Field {
        field: "uri",
        reason: "is not a valid URI",
    })?;

    if record.categories.len() > MAX_CATEGORIES {
        return Err(Rejection::Field {
            field: "categories",
            reason: "has too many entries",
        });
    }
    for (i, category) in record.categories.iter().enumerate() {
        check_text("categories", &txt::category_key(i), category)?;
    }
    Ok(())
}

/// Each field is announced as one `key=value` TXT entry and must fit in it.
fn check_text(field: &'static str, key: &str, value: &str) -> Result<(), Rejection> {
    if value.is_empty() {
        return Err(Rejection::Field {
            field,
            reason: "is empty",
        });
    }
    if txt::entry_len(key, value) > txt::MAX_ENTRY_LEN {
        return Err(Rejection::Field {
            field,
            reason: "is too long",
        });
    }
    Ok(())
}
