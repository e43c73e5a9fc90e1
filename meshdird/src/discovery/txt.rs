//! Mapping between service records and DNS-SD TXT properties.

use std::collections::HashMap;

use shared::protocol::{
    TXT_CATEGORY_PREFIX, TXT_DESCRIPTION, TXT_ICON, TXT_KEY, TXT_LIFETIME, TXT_NAME,
    TXT_SIGNATURE, TXT_TTL, TXT_URI, TXT_VERSION,
};
use shared::types::{Fingerprint, ServiceRecord};

/// Longest `key=value` string a single TXT entry can hold.
pub const MAX_ENTRY_LEN: usize = 255;

pub fn category_key(index: usize) -> String {
    format!("{}{}", TXT_CATEGORY_PREFIX, index)
}

/// Encoded length of the `key=value` entry.
pub fn entry_len(key: &str, value: &str) -> usize {
    key.len() + 1 + value.len()
}

pub fn to_properties(record: &ServiceRecord) -> HashMap<String, String> {
    let mut txt = HashMap::from([
        (TXT_NAME.to_string(), record.name.clone()),
        (TXT_DESCRIPTION.to_string(), record.description.clone()),
        (TXT_URI.to_string(), record.uri.clone()),
        (TXT_ICON.to_string(), record.icon.clone()),
        (TXT_VERSION.to_string(), record.version.clone()),
        (TXT_TTL.to_string(), record.ttl.to_string()),
        (TXT_LIFETIME.to_string(), record.lifetime.to_string()),
    ]);
    if let Some(key) = &record.key {
        txt.insert(TXT_KEY.to_string(), key.to_string());
    }
    if let Some(signature) = &record.signature {
        txt.insert(TXT_SIGNATURE.to_string(), signature.clone());
    }
    for (i, category) in record.categories.iter().enumerate() {
        txt.insert(category_key(i), category.clone());
    }
    txt
}

/// Rebuilds a record from announced properties. The flag is true when every
/// required field was present.
pub fn from_properties(txt: &HashMap<String, String>) -> (ServiceRecord, bool) {
    let text = |key: &str| txt.get(key).cloned().unwrap_or_default();

    let mut categories: Vec<(usize, String)> = txt
        .iter()
        .filter_map(|(key, value)| {
            let index = key.strip_prefix(TXT_CATEGORY_PREFIX)?.parse().ok()?;
            Some((index, value.clone()))
        })
        .collect();
    categories.sort();

    let record = ServiceRecord {
        name: text(TXT_NAME),
        description: text(TXT_DESCRIPTION),
        uri: text(TXT_URI),
        icon: text(TXT_ICON),
        version: text(TXT_VERSION),
        ttl: txt.get(TXT_TTL).and_then(|v| v.parse().ok()).unwrap_or(0),
        lifetime: txt.get(TXT_LIFETIME).and_then(|v| v.parse().ok()).unwrap_or(0),
        categories: categories.into_iter().map(|(_, c)| c).collect(),
        key: txt.get(TXT_KEY).and_then(|k| Fingerprint::parse(k).ok()),
        uuid: None,
        signature: txt.get(TXT_SIGNATURE).cloned(),
    };

    let complete = [&record.name, &record.description, &record.uri, &record.icon]
        .iter()
        .all(|field| !field.is_empty());
    (record, complete)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::protocol::RECORD_VERSION;

    #[test]
    fn test_properties_carry_every_field() {
        let mut record = ServiceRecord::with_defaults(RECORD_VERSION, 5, 60);
        record.name = "Mesh Chat".to_string();
        record.description = "chat app".to_string();
        record.uri = "http://10.0.0.1:8080".to_string();
        record.icon = "chat.png".to_string();
        record.key = Some(Fingerprint::parse(&"ab".repeat(32)).unwrap());
        record.signature = Some("sig".to_string());
        record.categories = (0..12).map(|i| format!("c{i}")).collect();

        let txt = to_properties(&record);
        assert_eq!(txt.get("cat.11").map(String::as_str), Some("c11"));

        let (parsed, complete) = from_properties(&txt);
        assert!(complete);
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_partial_properties_are_incomplete() {
        let txt = HashMap::from([
            ("name".to_string(), "Printer".to_string()),
            ("ttl".to_string(), "nonsense".to_string()),
            ("key".to_string(), "short".to_string()),
        ]);
        let (record, complete) = from_properties(&txt);
        assert!(!complete);
        assert_eq!(record.name, "Printer");
        assert_eq!(record.ttl, 0);
        assert!(record.key.is_none());
    }
}
