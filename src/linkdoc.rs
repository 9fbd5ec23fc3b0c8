//! Pure codec for the link structures stored inside `custom_data`.
//!
//! The document is an opaque JSON object shared with other features (user
//! attributes, projection settings), so encoding rewrites only the link
//! array and leaves every other key untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{AppError, AppResult};

/// Key of the asset-side array inside `assets.custom_data`.
pub const GOAL_EARMARKS_KEY: &str = "goalEarmarks";
/// Key of the goal-side array inside `financial_goal.custom_data`.
pub const LINKED_ASSETS_KEY: &str = "linkedAssets";

/// Asset-side view of a link: a percentage of this asset earmarked to a goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalEarmark {
    pub goal_id: i64,
    /// Cached display label; never used for identity.
    pub goal_name: String,
    pub percent: f64,
}

/// Goal-side view of the same link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetLink {
    pub asset_id: i64,
    /// Cached display label; never used for identity.
    pub asset_name: String,
    pub percent: f64,
}

/// Parse a raw `custom_data` column into a document, treating NULL and empty
/// strings as an empty object.
pub fn parse_document(raw: Option<&str>) -> AppResult<Value> {
    match raw {
        None => Ok(Value::Object(Map::new())),
        Some(s) if s.trim().is_empty() => Ok(Value::Object(Map::new())),
        Some(s) => serde_json::from_str(s).map_err(AppError::from),
    }
}

/// Serialize a document back to its stored TEXT form.
pub fn document_to_string(doc: &Value) -> AppResult<String> {
    serde_json::to_string(doc).map_err(AppError::from)
}

fn number_field(entry: &Map<String, Value>, key: &str) -> Option<f64> {
    match entry.get(key) {
        Some(Value::Number(n)) => n.as_f64(),
        // Legacy rows occasionally store percents as strings.
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn id_field(entry: &Map<String, Value>, key: &str) -> Option<i64> {
    match entry.get(key) {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn string_field(entry: &Map<String, Value>, key: &str) -> String {
    entry
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn decode_entries<T>(
    doc: &Value,
    array_key: &str,
    decode: impl Fn(&Map<String, Value>) -> Option<T>,
) -> Vec<T> {
    let Some(entries) = doc.get(array_key).and_then(Value::as_array) else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(Value::as_object)
        .filter_map(|entry| decode(entry))
        .collect()
}

/// Decode the asset-side earmark list. Missing or malformed documents yield
/// an empty sequence; entries without a usable goal id are dropped.
pub fn decode_asset_links(doc: &Value) -> Vec<GoalEarmark> {
    decode_entries(doc, GOAL_EARMARKS_KEY, |entry| {
        Some(GoalEarmark {
            goal_id: id_field(entry, "goalId")?,
            goal_name: string_field(entry, "goalName"),
            percent: number_field(entry, "percent").unwrap_or(0.0),
        })
    })
}

/// Decode the goal-side linked-asset list, symmetric to [`decode_asset_links`].
pub fn decode_goal_links(doc: &Value) -> Vec<AssetLink> {
    decode_entries(doc, LINKED_ASSETS_KEY, |entry| {
        Some(AssetLink {
            asset_id: id_field(entry, "assetId")?,
            asset_name: string_field(entry, "assetName"),
            percent: number_field(entry, "percent").unwrap_or(0.0),
        })
    })
}

fn encode_entries<T: Serialize>(doc: &mut Value, array_key: &str, entries: &[T]) {
    if !doc.is_object() {
        *doc = Value::Object(Map::new());
    }
    let array = entries
        .iter()
        .map(|entry| serde_json::to_value(entry).unwrap_or(Value::Null))
        .collect();
    if let Some(map) = doc.as_object_mut() {
        map.insert(array_key.to_string(), Value::Array(array));
    }
}

/// Write the earmark list into the asset document, preserving other keys.
pub fn encode_asset_links(doc: &mut Value, earmarks: &[GoalEarmark]) {
    encode_entries(doc, GOAL_EARMARKS_KEY, earmarks);
}

/// Write the linked-asset list into the goal document, preserving other keys.
pub fn encode_goal_links(doc: &mut Value, links: &[AssetLink]) {
    encode_entries(doc, LINKED_ASSETS_KEY, links);
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn missing_document_decodes_to_empty() {
        assert!(decode_asset_links(&Value::Null).is_empty());
        assert!(decode_asset_links(&json!({})).is_empty());
        assert!(decode_goal_links(&json!({ "other": 1 })).is_empty());
    }

    #[test]
    fn parse_document_tolerates_null_and_empty() {
        assert_eq!(parse_document(None).unwrap(), json!({}));
        assert_eq!(parse_document(Some("")).unwrap(), json!({}));
        assert_eq!(parse_document(Some("  ")).unwrap(), json!({}));
        assert!(parse_document(Some("{nope")).is_err());
    }

    #[test]
    fn decode_skips_entries_without_id_and_defaults_percent() {
        let doc = json!({
            "goalEarmarks": [
                { "goalId": 3, "goalName": "House", "percent": 40 },
                { "goalName": "no id" },
                { "goalId": 5 },
                { "goalId": "7", "percent": "12.5" },
                "not an object"
            ]
        });
        let earmarks = decode_asset_links(&doc);
        assert_eq!(earmarks.len(), 3);
        assert_eq!(earmarks[0].goal_id, 3);
        assert_eq!(earmarks[0].percent, 40.0);
        assert_eq!(earmarks[1].goal_id, 5);
        assert_eq!(earmarks[1].goal_name, "");
        assert_eq!(earmarks[1].percent, 0.0);
        assert_eq!(earmarks[2].goal_id, 7);
        assert_eq!(earmarks[2].percent, 12.5);
    }

    #[test]
    fn encode_preserves_unrelated_keys() {
        let mut doc = json!({ "sipAmount": 500, "notes": "keep me" });
        encode_asset_links(
            &mut doc,
            &[GoalEarmark {
                goal_id: 1,
                goal_name: "Retirement".into(),
                percent: 25.0,
            }],
        );
        assert_eq!(doc["sipAmount"], 500);
        assert_eq!(doc["notes"], "keep me");
        assert_eq!(doc["goalEarmarks"][0]["goalId"], 1);
        assert_eq!(doc["goalEarmarks"][0]["goalName"], "Retirement");
    }

    #[test]
    fn encode_replaces_non_object_document() {
        let mut doc = Value::Null;
        encode_goal_links(
            &mut doc,
            &[AssetLink {
                asset_id: 9,
                asset_name: "Index fund".into(),
                percent: 50.0,
            }],
        );
        assert_eq!(decode_goal_links(&doc).len(), 1);
    }

    fn arb_percent() -> impl Strategy<Value = f64> {
        // Percents as they occur in practice: two decimal places, 0..=100.
        (0u32..=10_000).prop_map(|n| f64::from(n) / 100.0)
    }

    proptest! {
        #[test]
        fn asset_links_round_trip(
            entries in proptest::collection::vec(
                (1i64..10_000, "[a-zA-Z ]{0,12}", arb_percent()),
                0..8,
            )
        ) {
            let earmarks: Vec<GoalEarmark> = entries
                .into_iter()
                .map(|(goal_id, goal_name, percent)| GoalEarmark { goal_id, goal_name, percent })
                .collect();
            let mut doc = serde_json::json!({ "unrelated": true });
            encode_asset_links(&mut doc, &earmarks);
            let raw = document_to_string(&doc).unwrap();
            let parsed = parse_document(Some(&raw)).unwrap();
            prop_assert_eq!(decode_asset_links(&parsed), earmarks);
            prop_assert_eq!(&parsed["unrelated"], &serde_json::json!(true));
        }

        #[test]
        fn goal_links_round_trip(
            entries in proptest::collection::vec(
                (1i64..10_000, "[a-zA-Z ]{0,12}", arb_percent()),
                0..8,
            )
        ) {
            let links: Vec<AssetLink> = entries
                .into_iter()
                .map(|(asset_id, asset_name, percent)| AssetLink { asset_id, asset_name, percent })
                .collect();
            let mut doc = serde_json::json!({});
            encode_goal_links(&mut doc, &links);
            let raw = document_to_string(&doc).unwrap();
            let parsed = parse_document(Some(&raw)).unwrap();
            prop_assert_eq!(decode_goal_links(&parsed), links);
        }
    }
}
