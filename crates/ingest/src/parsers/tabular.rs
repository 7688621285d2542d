//! Tabular fallback extractor for spreadsheet-like inputs (CSV/TSV).
//!
//! Used only when the structured pass produced nothing; emits one item
//! per file carrying the serialized grid.

use std::path::Path;

use serde_json::json;

use crate::models::IngestError;
use crate::parsers::document::DocItem;

const TABULAR_MIMES: [&str; 3] = [
    "text/csv",
    "text/tab-separated-values",
    "application/csv",
];

/// Whether the tabular fallback applies to this item.
pub fn looks_tabular(path: &Path, mime: Option<&str>) -> bool {
    let mime = mime.unwrap_or_default().to_ascii_lowercase();
    if TABULAR_MIMES.contains(&mime.as_str()) {
        return true;
    }
    matches!(
        path.extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase()
            .as_str(),
        "csv" | "tsv"
    )
}

/// Read a delimiter-separated file into a grid item.
pub async fn extract(path: &Path, mime: Option<&str>) -> Result<Vec<DocItem>, IngestError> {
    let bytes = tokio::fs::read(path).await?;
    let content = String::from_utf8_lossy(&bytes);

    let delimiter = if mime == Some("text/tab-separated-values")
        || path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("tsv"))
            .unwrap_or(false)
    {
        '\t'
    } else {
        ','
    };

    let rows: Vec<Vec<String>> = content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| split_delimited(line, delimiter))
        .collect();

    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let columns = rows.iter().map(Vec::len).max().unwrap_or(0);
    let text = content.trim().to_string();
    let metadata = json!({
        "content_type": "table",
        "table": { "rows": rows },
        "rows": rows.len(),
        "columns": columns,
    });

    Ok(vec![DocItem {
        text,
        metadata: match metadata {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        },
    }])
}

/// Split one line on the delimiter, honouring double-quoted fields
/// (with `""` as the escaped quote).
fn split_delimited(line: &str, delimiter: char) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    current.push('"');
                } else {
                    in_quotes = false;
                }
            } else {
                current.push(c);
            }
        } else if c == '"' {
            in_quotes = true;
        } else if c == delimiter {
            fields.push(current.trim().to_string());
            current = String::new();
        } else {
            current.push(c);
        }
    }
    fields.push(current.trim().to_string());
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn detects_tabular_by_mime_and_extension() {
        assert!(looks_tabular(&PathBuf::from("a.bin"), Some("text/csv")));
        assert!(looks_tabular(&PathBuf::from("data.CSV"), None));
        assert!(looks_tabular(&PathBuf::from("data.tsv"), None));
        assert!(!looks_tabular(&PathBuf::from("doc.pdf"), Some("application/pdf")));
    }

    #[test]
    fn splits_quoted_fields() {
        assert_eq!(
            split_delimited(r#"a,"b, with comma","quoted ""q"""#, ','),
            vec!["a", "b, with comma", r#"quoted "q""#]
        );
    }

    #[tokio::test]
    async fn extracts_csv_grid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("revenue.csv");
        tokio::fs::write(&path, "Revenue,Amount\nQ1,1000\nQ2,1200\n")
            .await
            .unwrap();

        let items = extract(&path, Some("text/csv")).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].metadata["rows"], 3);
        assert_eq!(items[0].metadata["columns"], 2);
        assert_eq!(items[0].metadata["table"]["rows"][1][1], "1000");
        assert!(items[0].text.starts_with("Revenue,Amount"));
    }

    #[tokio::test]
    async fn tsv_uses_tab_delimiter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.tsv");
        tokio::fs::write(&path, "a\tb\n1\t2\n").await.unwrap();
        let items = extract(&path, None).await.unwrap();
        assert_eq!(items[0].metadata["table"]["rows"][0][1], "b");
    }

    #[tokio::test]
    async fn empty_file_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.csv");
        tokio::fs::write(&path, "").await.unwrap();
        assert!(extract(&path, None).await.unwrap().is_empty());
    }
}
