//! Structured document extraction.
//!
//! The document model yields a flat list of items — text blocks,
//! section headers, lists, tables, pictures — each with its textual
//! projection, page of origin, and element attributes. The built-in
//! model covers HTML (parsed with `scraper`), Markdown/plain text, and
//! PDF (per-page text through a `pdftotext` subprocess); richer
//! converters plug in behind the same trait.

use std::path::Path;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::models::IngestError;

/// One structured item extracted from a document.
#[derive(Debug, Clone)]
pub struct DocItem {
    pub text: String,
    pub metadata: Map<String, Value>,
}

impl DocItem {
    fn new(text: impl Into<String>, metadata: Value) -> Self {
        let metadata = match metadata {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            text: text.into(),
            metadata,
        }
    }
}

/// Structured extractor seam.
#[async_trait]
pub trait DocumentModel: Send + Sync {
    async fn extract(&self, path: &Path, mime: Option<&str>) -> Result<Vec<DocItem>, IngestError>;
}

/// Built-in extractor: HTML, Markdown/plain text, and PDF text.
pub struct BuiltinDocumentModel;

#[async_trait]
impl DocumentModel for BuiltinDocumentModel {
    async fn extract(&self, path: &Path, mime: Option<&str>) -> Result<Vec<DocItem>, IngestError> {
        let mime = mime.unwrap_or_default().to_ascii_lowercase();
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();

        if mime == "text/html" || extension == "html" || extension == "htm" {
            let html = tokio::fs::read_to_string(path).await?;
            // scraper's parse is CPU-bound on large pages.
            return tokio::task::spawn_blocking(move || extract_html_items(&html))
                .await
                .map_err(|e| IngestError::Parse(format!("html extraction task failed: {e}")));
        }

        if mime == "application/pdf" || extension == "pdf" {
            return extract_pdf_items(path).await;
        }

        // Spreadsheet-like inputs belong to the tabular reader.
        if crate::parsers::tabular::looks_tabular(path, Some(&mime)) {
            return Err(IngestError::Unsupported(
                "tabular input, use the tabular reader".into(),
            ));
        }

        if mime.starts_with("text/") || matches!(extension.as_str(), "md" | "markdown" | "txt") {
            let text = read_lossy(path).await?;
            return Ok(extract_text_items(&text));
        }

        Err(IngestError::Unsupported(format!(
            "no structured extractor for mime {mime:?} / extension {extension:?}"
        )))
    }
}

/// Last-resort extractor: decode the whole file as text.
pub async fn fallback_decode(path: &Path) -> Result<Vec<DocItem>, IngestError> {
    let text = read_lossy(path).await?;
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(vec![DocItem::new(
        text.trim(),
        serde_json::json!({ "content_type": "text" }),
    )])
}

async fn read_lossy(path: &Path) -> Result<String, IngestError> {
    let bytes = tokio::fs::read(path).await?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTML
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Container tags whose content is boilerplate, not document content.
const SKIPPED_TAGS: [&str; 6] = ["script", "style", "nav", "footer", "header", "noscript"];

fn extract_html_items(html: &str) -> Vec<DocItem> {
    let document = scraper::Html::parse_document(html);
    let mut items = Vec::new();
    walk_element(document.root_element(), &mut items);
    items
}

fn walk_element(element: scraper::ElementRef<'_>, items: &mut Vec<DocItem>) {
    let tag = element.value().name();
    if SKIPPED_TAGS.contains(&tag) {
        return;
    }

    if let Some(level) = heading_level(tag) {
        let text = element_text(element);
        if !text.is_empty() {
            items.push(DocItem::new(
                text.clone(),
                serde_json::json!({
                    "content_type": "text",
                    "element_type": "section_header",
                    "hierarchy_level": level,
                    "heading": text,
                }),
            ));
        }
        return;
    }

    match tag {
        "p" | "blockquote" => {
            let text = element_text(element);
            if !text.is_empty() {
                items.push(DocItem::new(
                    text,
                    serde_json::json!({ "content_type": "text", "element_type": "paragraph" }),
                ));
            }
        }
        "li" => {
            let text = element_text(element);
            if !text.is_empty() {
                items.push(DocItem::new(
                    text,
                    serde_json::json!({ "content_type": "text", "element_type": "list_item" }),
                ));
            }
        }
        "pre" => {
            let text: String = element.text().collect();
            let text = text.trim().to_string();
            if !text.is_empty() {
                items.push(DocItem::new(
                    text,
                    serde_json::json!({ "content_type": "text", "element_type": "code" }),
                ));
            }
        }
        "table" => {
            if let Some(item) = extract_html_table(element) {
                items.push(item);
            }
        }
        "img" => {
            let src = element.value().attr("src").unwrap_or_default();
            let alt = element.value().attr("alt").unwrap_or_default().trim().to_string();
            let text = if alt.is_empty() {
                "[Image]".to_string()
            } else {
                format!("Image caption: {alt}")
            };
            let mut metadata = serde_json::json!({
                "content_type": "image",
                "element_type": "picture",
            });
            if !src.is_empty() {
                metadata["image_ref"] = Value::String(src.to_string());
            }
            if !alt.is_empty() {
                metadata["caption"] = Value::String(alt.clone());
                metadata["alt_text"] = Value::String(alt);
            }
            items.push(DocItem::new(text, metadata));
        }
        _ => {
            for child in element.children() {
                if let Some(child) = scraper::ElementRef::wrap(child) {
                    walk_element(child, items);
                }
            }
        }
    }
}

fn heading_level(tag: &str) -> Option<u32> {
    let mut chars = tag.chars();
    if chars.next() != Some('h') {
        return None;
    }
    let digit = chars.next()?.to_digit(10)?;
    if chars.next().is_some() || !(1..=6).contains(&digit) {
        return None;
    }
    Some(digit)
}

fn element_text(element: scraper::ElementRef<'_>) -> String {
    let raw: String = element.text().collect::<Vec<_>>().join(" ");
    normalize_whitespace(&raw)
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn extract_html_table(element: scraper::ElementRef<'_>) -> Option<DocItem> {
    use std::sync::OnceLock;
    static ROW: OnceLock<scraper::Selector> = OnceLock::new();
    static CELL: OnceLock<scraper::Selector> = OnceLock::new();
    let row_selector = ROW.get_or_init(|| scraper::Selector::parse("tr").expect("valid selector"));
    let cell_selector =
        CELL.get_or_init(|| scraper::Selector::parse("th, td").expect("valid selector"));

    let mut rows: Vec<Vec<String>> = Vec::new();
    for row in element.select(row_selector) {
        let cells: Vec<String> = row
            .select(cell_selector)
            .map(|cell| normalize_whitespace(&cell.text().collect::<Vec<_>>().join(" ")))
            .collect();
        if cells.iter().any(|c| !c.is_empty()) {
            rows.push(cells);
        }
    }
    if rows.is_empty() {
        return None;
    }

    let columns = rows.iter().map(Vec::len).max().unwrap_or(0);
    let text = rows
        .iter()
        .map(|row| row.join(","))
        .collect::<Vec<_>>()
        .join("\n");

    Some(DocItem::new(
        text,
        serde_json::json!({
            "content_type": "table",
            "element_type": "table",
            "table_data": { "rows": rows },
            "rows": rows.len(),
            "columns": columns,
        }),
    ))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// PDF
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-page text extraction via the `pdftotext` CLI. Pages come back
/// separated by form feeds.
async fn extract_pdf_items(path: &Path) -> Result<Vec<DocItem>, IngestError> {
    let output = tokio::process::Command::new("pdftotext")
        .args(["-layout", "-enc", "UTF-8"])
        .arg(path)
        .arg("-")
        .output()
        .await
        .map_err(|e| IngestError::Engine(format!("pdftotext failed to start: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(IngestError::Engine(format!(
            "pdftotext exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let text = String::from_utf8_lossy(&output.stdout);
    let items = text
        .split('\u{0c}')
        .enumerate()
        .filter_map(|(idx, page)| {
            let page_text = page.trim();
            if page_text.is_empty() {
                return None;
            }
            Some(DocItem::new(
                page_text,
                serde_json::json!({
                    "content_type": "text",
                    "page": idx + 1,
                }),
            ))
        })
        .collect();
    Ok(items)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Markdown / plain text
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn extract_text_items(text: &str) -> Vec<DocItem> {
    let mut items = Vec::new();

    for paragraph in split_paragraphs(text) {
        if let Some(stripped) = paragraph.strip_prefix('#') {
            let level = paragraph.chars().take_while(|c| *c == '#').count();
            if level <= 6 {
                let heading = stripped
                    .trim_start_matches('#')
                    .trim()
                    .to_string();
                if !heading.is_empty() {
                    items.push(DocItem::new(
                        heading.clone(),
                        serde_json::json!({
                            "content_type": "text",
                            "element_type": "section_header",
                            "hierarchy_level": level,
                            "heading": heading,
                        }),
                    ));
                    continue;
                }
            }
        }
        items.push(DocItem::new(
            paragraph,
            serde_json::json!({ "content_type": "text", "element_type": "paragraph" }),
        ));
    }

    items
}

fn split_paragraphs(text: &str) -> Vec<String> {
    text.split("\n\n")
        .flat_map(|block| block.split("\r\n\r\n"))
        .map(str::trim)
        .filter(|block| !block.is_empty())
        .map(str::to_string)
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn html_items_preserve_document_order() {
        let html = r#"
            <html><body>
              <h1>Title</h1>
              <p>Intro paragraph.</p>
              <ul><li>first</li><li>second</li></ul>
              <table><tr><th>A</th><th>B</th></tr><tr><td>1</td><td>2</td></tr></table>
              <img src="diagram.png" alt="flow diagram">
            </body></html>
        "#;
        let items = extract_html_items(html);
        let kinds: Vec<&str> = items
            .iter()
            .map(|i| i.metadata["element_type"].as_str().unwrap())
            .collect();
        assert_eq!(
            kinds,
            vec!["section_header", "paragraph", "list_item", "list_item", "table", "picture"]
        );

        assert_eq!(items[0].metadata["hierarchy_level"], 1);
        assert_eq!(items[0].metadata["heading"], "Title");
        assert_eq!(items[4].metadata["table_data"]["rows"][0][0], "A");
        assert_eq!(items[4].metadata["rows"], 2);
        assert_eq!(items[5].metadata["image_ref"], "diagram.png");
        assert_eq!(items[5].metadata["caption"], "flow diagram");
        assert_eq!(items[5].text, "Image caption: flow diagram");
    }

    #[test]
    fn html_skips_boilerplate_containers() {
        let html = r#"
            <html><body>
              <nav><p>menu</p></nav>
              <script>var x = 1;</script>
              <p>real content</p>
              <footer><p>copyright</p></footer>
            </body></html>
        "#;
        let items = extract_html_items(html);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].text, "real content");
    }

    #[test]
    fn html_image_without_alt_gets_placeholder() {
        let items = extract_html_items(r#"<html><body><img src="x.png"></body></html>"#);
        assert_eq!(items[0].text, "[Image]");
        assert!(items[0].metadata.get("caption").is_none());
    }

    #[test]
    fn markdown_headings_and_paragraphs() {
        let items = extract_text_items("# Top\n\nBody text here.\n\n## Sub\n\nMore text.");
        assert_eq!(items.len(), 4);
        assert_eq!(items[0].metadata["element_type"], "section_header");
        assert_eq!(items[0].metadata["hierarchy_level"], 1);
        assert_eq!(items[2].metadata["hierarchy_level"], 2);
        assert_eq!(items[1].metadata["element_type"], "paragraph");
    }

    #[test]
    fn plain_text_splits_on_blank_lines() {
        let items = extract_text_items("one\n\ntwo\n\n\nthree");
        assert_eq!(items.len(), 3);
        assert_eq!(items[2].text, "three");
    }

    #[test]
    fn heading_levels_bounded() {
        assert_eq!(heading_level("h1"), Some(1));
        assert_eq!(heading_level("h6"), Some(6));
        assert_eq!(heading_level("h7"), None);
        assert_eq!(heading_level("hr"), None);
        assert_eq!(heading_level("html"), None);
    }

    #[tokio::test]
    async fn fallback_decode_reads_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.unknown");
        tokio::fs::write(&path, "some opaque text").await.unwrap();
        let items = fallback_decode(&path).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].text, "some opaque text");
    }

    #[tokio::test]
    async fn unsupported_mime_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        tokio::fs::write(&path, [0u8, 1, 2]).await.unwrap();
        let err = BuiltinDocumentModel
            .extract(&path, Some("application/octet-stream"))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Unsupported(_)));
    }
}
