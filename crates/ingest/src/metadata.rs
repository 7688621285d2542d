//! Metadata pruning and artifact aggregation.
//!
//! Vector-store payloads have a practical size ceiling; oversized chunk
//! metadata is cut down by truncating the big list fields first and then
//! dropping non-essential keys smallest-first, so the identifying keys
//! always survive.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::models::DocChunk;

/// Payload size ceiling in approximate bytes.
pub const MAX_METADATA_BYTES: usize = 6_000;

/// Keys that must survive pruning.
const ESSENTIAL_KEYS: [&str; 6] = ["uri", "path_hash", "chunk_id", "source", "mime", "user_id"];

/// List fields truncated before anything is dropped.
const TRUNCATABLE_LISTS: [&str; 5] = ["pages", "tables", "images", "charts", "artifacts_sample"];

const TRUNCATED_LIST_LEN: usize = 3;

/// Approximate serialized size of a value, cheap on purpose: strings by
/// byte length, numbers flat-rate, containers sampled.
pub fn approx_size(value: &Value) -> usize {
    match value {
        Value::String(s) => s.len(),
        Value::Number(_) | Value::Bool(_) => 20,
        Value::Array(items) => items.iter().take(10).map(approx_size).sum::<usize>() + 50,
        Value::Object(map) => {
            map.iter()
                .take(20)
                .map(|(k, v)| k.len() + approx_size(v))
                .sum::<usize>()
                + 100
        }
        Value::Null => 50,
    }
}

fn map_size(map: &Map<String, Value>) -> usize {
    map.iter()
        .take(20)
        .map(|(k, v)| k.len() + approx_size(v))
        .sum::<usize>()
        + 100
}

/// Prune metadata to fit within `max_bytes`.
///
/// Order of operations: truncate the known list fields to three items,
/// then drop non-essential keys in ascending size order. Essential keys
/// are always retained even if the result stays over the limit.
pub fn prune_metadata(metadata: &Map<String, Value>, max_bytes: usize) -> Map<String, Value> {
    if metadata.is_empty() {
        return Map::new();
    }

    let mut working = metadata.clone();
    if map_size(&working) <= max_bytes {
        return working;
    }

    for key in TRUNCATABLE_LISTS {
        if let Some(Value::Array(items)) = working.get_mut(key) {
            if items.len() > TRUNCATED_LIST_LEN {
                items.truncate(TRUNCATED_LIST_LEN);
                if map_size(&working) <= max_bytes {
                    return working;
                }
            }
        }
    }

    let mut removable: Vec<(String, usize)> = working
        .iter()
        .filter(|(k, _)| !ESSENTIAL_KEYS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), approx_size(v)))
        .collect();
    removable.sort_by_key(|(_, size)| *size);

    for (key, _) in removable {
        working.remove(&key);
        if map_size(&working) <= max_bytes {
            return working;
        }
    }

    working
}

/// Stable content hash used as a dedup key for artifacts.
pub fn stable_hash(value: &Value) -> String {
    // serde_json maps are sorted by key, so serialization is canonical.
    let encoded = value.to_string();
    let digest = Sha256::digest(encoded.as_bytes());
    hex::encode(digest)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Artifact aggregation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const CHART_KEYWORDS: [&str; 4] = ["chart", "graph", "plot", "diagram"];
const MAX_ARTIFACT_SAMPLES: usize = 5;

/// Classify a chunk as chart-like by explicit type or by keywords in
/// its label, caption, or text.
pub fn is_chart_chunk(content_type: &str, label: &str, caption: &str, text_preview: &str) -> bool {
    if content_type == "chart" {
        return true;
    }
    [label, caption, text_preview].iter().any(|haystack| {
        let lowered = haystack.to_ascii_lowercase();
        CHART_KEYWORDS.iter().any(|kw| lowered.contains(kw))
    })
}

fn is_table_chunk(metadata: &Map<String, Value>) -> bool {
    metadata
        .get("content_type")
        .and_then(Value::as_str)
        .map(|v| v.eq_ignore_ascii_case("table"))
        .unwrap_or(false)
        || metadata.contains_key("table")
        || metadata.contains_key("table_data")
}

fn str_field<'a>(metadata: &'a Map<String, Value>, key: &str) -> &'a str {
    metadata.get(key).and_then(Value::as_str).unwrap_or_default()
}

/// Aggregate artifact metadata (tables, images, charts) across a
/// document's parsed chunks: deduplicated samples, per-page counts, and
/// totals. Attached to the per-file persistence record and, as counts,
/// to every chunk's metadata.
pub fn collect_artifacts(chunks: &[DocChunk]) -> Value {
    let mut tables: Vec<Value> = Vec::new();
    let mut images: Vec<Value> = Vec::new();
    let mut charts: Vec<Value> = Vec::new();
    let mut pages: std::collections::BTreeMap<i64, (u64, u64, u64)> = Default::default();
    let mut seen_tables = std::collections::HashSet::new();
    let mut seen_images = std::collections::HashSet::new();
    let mut seen_charts = std::collections::HashSet::new();

    for chunk in chunks {
        let metadata = &chunk.metadata;
        let page = metadata.get("page").and_then(Value::as_i64);
        let content_type = str_field(metadata, "content_type").to_ascii_lowercase();
        let label = str_field(metadata, "label");
        let caption = str_field(metadata, "caption");
        let text_preview: String = chunk.text.trim().chars().take(500).collect();

        if is_table_chunk(metadata) {
            let key = stable_hash(&serde_json::json!({
                "table": metadata.get("table_data").or_else(|| metadata.get("table")),
                "text": chunk.text,
                "page": page,
            }));
            if seen_tables.insert(key) {
                if tables.len() < MAX_ARTIFACT_SAMPLES {
                    tables.push(serde_json::json!({
                        "page": page,
                        "preview": text_preview,
                        "rows": metadata.get("rows").and_then(Value::as_i64),
                        "columns": metadata.get("columns").and_then(Value::as_i64),
                        "label": if label.is_empty() {
                            metadata.get("element_type").cloned().unwrap_or(Value::Null)
                        } else {
                            Value::String(label.to_string())
                        },
                    }));
                }
                if let Some(page) = page {
                    pages.entry(page).or_default().0 += 1;
                }
            }
            continue;
        }

        let chart_like = is_chart_chunk(&content_type, label, caption, &text_preview);

        if content_type == "image" || metadata.contains_key("image_ref") {
            let key = metadata
                .get("image_hash")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| {
                    stable_hash(&serde_json::json!({
                        "uri": metadata.get("image_ref"),
                        "text": chunk.text,
                        "page": page,
                    }))
                });
            if seen_images.insert(key.clone()) {
                if images.len() < MAX_ARTIFACT_SAMPLES {
                    images.push(serde_json::json!({
                        "page": page,
                        "caption": if caption.is_empty() { label } else { caption },
                        "hash": metadata.get("image_hash").cloned().unwrap_or(Value::Null),
                        "ocr": metadata.get("ocr_text").cloned().unwrap_or(Value::Null),
                    }));
                }
                if let Some(page) = page {
                    pages.entry(page).or_default().1 += 1;
                }
            }

            if chart_like && seen_charts.insert(key) {
                if charts.len() < MAX_ARTIFACT_SAMPLES {
                    charts.push(serde_json::json!({
                        "page": page,
                        "caption": if caption.is_empty() { label } else { caption },
                        "hash": metadata.get("image_hash").cloned().unwrap_or(Value::Null),
                    }));
                }
                if let Some(page) = page {
                    pages.entry(page).or_default().2 += 1;
                }
            }
            continue;
        }

        if chart_like {
            let key = stable_hash(&serde_json::json!({
                "label": label, "caption": caption, "page": page,
            }));
            if seen_charts.insert(key) {
                if charts.len() < MAX_ARTIFACT_SAMPLES {
                    charts.push(serde_json::json!({
                        "page": page,
                        "caption": if caption.is_empty() { label } else { caption },
                        "preview": text_preview,
                    }));
                }
                if let Some(page) = page {
                    pages.entry(page).or_default().2 += 1;
                }
            }
        }
    }

    let pages_list: Vec<Value> = pages
        .into_iter()
        .map(|(page, (t, i, c))| {
            serde_json::json!({ "page": page, "tables": t, "images": i, "charts": c })
        })
        .collect();

    serde_json::json!({
        "pages": pages_list,
        "artifacts": { "tables": tables, "images": images, "charts": charts },
        "counts": {
            "tables": seen_tables.len(),
            "images": seen_images.len(),
            "charts": seen_charts.len(),
        },
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceKind;

    fn chunk_with(metadata: Value, text: &str) -> DocChunk {
        let Value::Object(metadata) = metadata else {
            panic!("metadata must be an object")
        };
        DocChunk::new(1, text, None, None, SourceKind::File, metadata)
    }

    #[test]
    fn small_metadata_is_untouched() {
        let metadata: Map<String, Value> = serde_json::from_value(serde_json::json!({
            "uri": "file:///a", "chunk_id": 1, "mime": "text/plain"
        }))
        .unwrap();
        assert_eq!(prune_metadata(&metadata, MAX_METADATA_BYTES), metadata);
    }

    #[test]
    fn oversized_metadata_truncates_lists_and_keeps_essentials() {
        let pages: Vec<Value> = (0..10)
            .map(|i| serde_json::json!({ "page_number": i, "segments": ["x".repeat(400)] }))
            .collect();
        let metadata: Map<String, Value> = serde_json::from_value(serde_json::json!({
            "uri": "file:///doc.pdf",
            "path_hash": "abc123",
            "chunk_id": 4,
            "source": "file",
            "mime": "application/pdf",
            "user_id": 42,
            "pages": pages,
            "text_preview": "y".repeat(5000),
        }))
        .unwrap();

        let pruned = prune_metadata(&metadata, MAX_METADATA_BYTES);

        if let Some(Value::Array(pages)) = pruned.get("pages") {
            assert!(pages.len() <= 3, "pages not truncated: {}", pages.len());
        }
        for key in ESSENTIAL_KEYS {
            assert!(pruned.contains_key(key), "essential key dropped: {key}");
        }
        assert!(map_size(&pruned) <= MAX_METADATA_BYTES);
    }

    #[test]
    fn drops_non_essential_keys_smallest_first() {
        let metadata: Map<String, Value> = serde_json::from_value(serde_json::json!({
            "uri": "u", "path_hash": "h", "chunk_id": 1, "source": "file", "mime": "m",
            "small_extra": "tiny",
            "huge_extra": "z".repeat(8000),
        }))
        .unwrap();

        let pruned = prune_metadata(&metadata, 600);
        // The huge key goes; the small one fits.
        assert!(!pruned.contains_key("huge_extra"));
        assert!(pruned.contains_key("small_extra"));
    }

    #[test]
    fn approx_size_samples_containers() {
        let long_list = Value::Array(vec![Value::String("a".repeat(100)); 50]);
        // Only the first 10 items are counted.
        assert_eq!(approx_size(&long_list), 100 * 10 + 50);
    }

    #[test]
    fn chart_detection_by_keyword() {
        assert!(is_chart_chunk("text", "Figure: revenue chart", "", ""));
        assert!(is_chart_chunk("chart", "", "", ""));
        assert!(is_chart_chunk("text", "", "", "a bar graph of sales"));
        assert!(!is_chart_chunk("text", "plain label", "", "plain text"));
    }

    #[test]
    fn collect_artifacts_counts_and_dedupes() {
        let table = serde_json::json!({
            "content_type": "table",
            "table_data": {"rows": [["A"], ["1"]]},
            "page": 1,
        });
        let chunks = vec![
            chunk_with(table.clone(), "| A |\n| 1 |"),
            chunk_with(table, "| A |\n| 1 |"),
            chunk_with(
                serde_json::json!({"content_type": "image", "image_hash": "h1", "page": 2}),
                "Image caption: a pie chart",
            ),
        ];

        let summary = collect_artifacts(&chunks);
        assert_eq!(summary["counts"]["tables"], 1);
        assert_eq!(summary["counts"]["images"], 1);
        // The image text mentions a chart, so it is also counted there.
        assert_eq!(summary["counts"]["charts"], 1);
        assert_eq!(summary["artifacts"]["tables"].as_array().unwrap().len(), 1);

        let pages = summary["pages"].as_array().unwrap();
        assert_eq!(pages[0]["page"], 1);
        assert_eq!(pages[0]["tables"], 1);
        assert_eq!(pages[1]["images"], 1);
    }
}
