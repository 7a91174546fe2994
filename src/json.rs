//! Serialization glue over `serde_json`.
//!
//! Parse failures are surfaced as `None` and logged, never propagated
//! as raw serde errors into caller code. Unknown input fields are
//! tolerated on decode.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{error, warn};

/// Serializes a value to a JSON string. `None` on failure.
pub fn to_json<T>(value: &T) -> Option<String>
where
    T: Serialize + ?Sized,
{
    match serde_json::to_string(value) {
        Ok(text) => Some(text),
        Err(source) => {
            error!(error = %source, "failed to serialize value to json");
            None
        }
    }
}

/// Deserializes a JSON string into `T`. `None` on an empty input or a
/// parse failure. Collection shapes deserialize through the same entry
/// point (`from_json::<Vec<Record>>`, `from_json::<HashMap<_, _>>`).
pub fn from_json<T>(json: &str) -> Option<T>
where
    T: DeserializeOwned,
{
    if json.trim().is_empty() {
        return None;
    }
    match serde_json::from_str(json) {
        Ok(value) => Some(value),
        Err(source) => {
            warn!(error = %source, "failed to parse json string");
            None
        }
    }
}

/// Parses a JSON string into a dynamic tree.
pub fn tree(json: &str) -> Option<Value> {
    from_json(json)
}

/// Converts a dynamic tree into `T`.
pub fn from_value<T>(value: Value) -> Option<T>
where
    T: DeserializeOwned,
{
    match serde_json::from_value(value) {
        Ok(converted) => Some(converted),
        Err(source) => {
            warn!(error = %source, "failed to convert json value");
            None
        }
    }
}

/// Updates `target` from a partial JSON document: fields present in
/// `json` overwrite the corresponding fields of `target`, nested
/// objects merge recursively, everything else is left untouched.
pub fn update<T>(json: &str, target: &T) -> Option<T>
where
    T: Serialize + DeserializeOwned,
{
    let patch = tree(json)?;
    let mut base = match serde_json::to_value(target) {
        Ok(value) => value,
        Err(source) => {
            warn!(error = %source, "failed to reserialize update target");
            return None;
        }
    };
    merge_value(&mut base, patch);
    from_value(base)
}

fn merge_value(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, patch_entry) in patch_map {
                match base_map.get_mut(&key) {
                    Some(base_entry) => merge_value(base_entry, patch_entry),
                    None => {
                        base_map.insert(key, patch_entry);
                    }
                }
            }
        }
        (base_slot, replacement) => *base_slot = replacement,
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::{from_json, to_json, tree, update};

    #[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
    struct Account {
        name: String,
        quota: u64,
        tags: Vec<String>,
    }

    #[test]
    fn round_trip_preserves_value() {
        let account = Account {
            name: "billing".to_owned(),
            quota: 42,
            tags: vec!["internal".to_owned(), "batch".to_owned()],
        };
        let encoded = to_json(&account).expect("serializes");
        let decoded: Account = from_json(&encoded).expect("parses");
        assert_eq!(decoded, account);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let decoded: Account = from_json(
            r#"{"name":"billing","quota":1,"tags":[],"added_later":"ignored"}"#,
        )
        .expect("unknown fields must not fail the decode");
        assert_eq!(decoded.name, "billing");
    }

    #[test]
    fn empty_and_invalid_input_decode_to_none() {
        assert!(from_json::<Account>("").is_none());
        assert!(from_json::<Account>("   ").is_none());
        assert!(from_json::<Account>("{broken").is_none());
    }

    #[test]
    fn collection_shapes_decode_through_generics() {
        let accounts: Vec<Account> =
            from_json(r#"[{"name":"a","quota":1,"tags":[]},{"name":"b","quota":2,"tags":[]}]"#)
                .expect("list of records parses");
        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[1].name, "b");
    }

    #[test]
    fn update_merges_partial_documents() {
        let account = Account {
            name: "billing".to_owned(),
            quota: 42,
            tags: vec!["internal".to_owned()],
        };
        let updated = update(r#"{"quota":100}"#, &account).expect("partial update applies");
        assert_eq!(updated.quota, 100);
        assert_eq!(updated.name, "billing");
        assert_eq!(updated.tags, vec!["internal".to_owned()]);
    }

    #[test]
    fn tree_exposes_dynamic_values() {
        let value = tree(r#"{"nested":{"flag":true}}"#).expect("parses");
        assert_eq!(value["nested"]["flag"], true);
    }
}
