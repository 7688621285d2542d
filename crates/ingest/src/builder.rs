//! Chunk building: turns raw parser output into final, token-bounded
//! chunks with structural metadata.
//!
//! Two modes:
//! - **Media**: each transcript paragraph is windowed on its own, and
//!   every window gets proportionally interpolated start/end seconds.
//! - **Document**: all raw chunks are flattened into one token stream
//!   (separated by paragraph breaks) with a parallel provenance array
//!   mapping tokens back to their raw chunk, so each window knows which
//!   pages and artifacts contributed to it.

use serde_json::{Map, Value};

use crate::chunker::{chunk_token_ranges, tokenize_text};
use crate::models::{DocChunk, IngestionItem, SourceKind};

pub struct ChunkBuilder {
    chunk_size: usize,
    chunk_overlap: usize,
}

/// Artifacts contributed to one window, already deduplicated.
#[derive(Debug, Default)]
pub struct Artifacts {
    pub tables: Vec<Value>,
    pub images: Vec<Value>,
    pub charts: Vec<Value>,
}

impl Artifacts {
    fn is_empty(&self) -> bool {
        self.tables.is_empty() && self.images.is_empty() && self.charts.is_empty()
    }
}

/// Provenance record for one raw chunk inside the flattened stream.
struct SpanSummary {
    source_chunk_id: u32,
    metadata: Map<String, Value>,
    global_start: usize,
    global_end: usize,
}

/// One raw chunk's overlap with a specific window.
struct SpanOverlap<'a> {
    summary: &'a SpanSummary,
    absolute: (usize, usize),
    relative: (usize, usize),
}

impl ChunkBuilder {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            chunk_size,
            chunk_overlap,
        }
    }

    /// Build final chunks from raw parser output.
    pub fn prepare(
        &self,
        raw_chunks: Vec<DocChunk>,
        item: &IngestionItem,
        source: SourceKind,
        path_hash: &str,
        user_id: Option<i64>,
    ) -> Vec<DocChunk> {
        if raw_chunks.is_empty() {
            return Vec::new();
        }
        match source {
            SourceKind::Audio | SourceKind::Video => {
                self.prepare_media_chunks(raw_chunks, item, source, path_hash, user_id)
            }
            _ => self.prepare_text_chunks(raw_chunks, item, source, path_hash, user_id),
        }
    }

    // ── Media mode ─────────────────────────────────────────────────

    fn prepare_media_chunks(
        &self,
        raw_chunks: Vec<DocChunk>,
        item: &IngestionItem,
        source: SourceKind,
        path_hash: &str,
        user_id: Option<i64>,
    ) -> Vec<DocChunk> {
        let mut chunk_counter = 0u32;
        let mut prepared = Vec::new();

        for raw in raw_chunks {
            let text = raw.text.trim();
            if text.is_empty() {
                continue;
            }
            let tokens = tokenize_text(text);
            if tokens.is_empty() {
                continue;
            }
            let total_tokens = tokens.len();

            let paragraph_start = raw.metadata.get("start").and_then(Value::as_f64);
            let paragraph_end = raw.metadata.get("end").and_then(Value::as_f64);

            let ranges = chunk_token_ranges(total_tokens, self.chunk_size, self.chunk_overlap);
            for (segment_idx, (token_start, token_end)) in ranges.into_iter().enumerate() {
                let segment_text = tokens[token_start..token_end].concat();
                let segment_text = segment_text.trim();
                if segment_text.is_empty() {
                    continue;
                }
                chunk_counter += 1;

                let (segment_start, segment_end) = interpolate_window(
                    paragraph_start,
                    paragraph_end,
                    token_start,
                    token_end.min(total_tokens),
                    total_tokens,
                );

                let mut segment_details = Map::new();
                segment_details.insert("type".into(), Value::String("transcript".into()));
                segment_details.insert("segment_index".into(), (segment_idx as u64 + 1).into());
                segment_details.insert(
                    "token_range".into(),
                    serde_json::json!([token_start, token_end.min(total_tokens)]),
                );
                segment_details.insert("total_tokens".into(), (total_tokens as u64).into());

                let mut timeline = Map::new();
                if let Some(start) = segment_start {
                    timeline.insert("start".into(), round3(start));
                    timeline.insert(
                        "start_timestamp".into(),
                        Value::String(format_seconds_to_timestamp(start)),
                    );
                }
                if let Some(end) = segment_end {
                    timeline.insert("end".into(), round3(end));
                    timeline.insert(
                        "end_timestamp".into(),
                        Value::String(format_seconds_to_timestamp(end)),
                    );
                }
                if !timeline.is_empty() {
                    segment_details.insert("timeline".into(), Value::Object(timeline));
                }

                let mut paragraph = Map::new();
                if let Some(start) = paragraph_start {
                    paragraph.insert("start".into(), round3(start));
                }
                if let Some(end) = paragraph_end {
                    paragraph.insert("end".into(), round3(end));
                }
                if !paragraph.is_empty() {
                    let mut timestamp_range = Map::new();
                    if let Some(start) = paragraph_start {
                        timestamp_range.insert(
                            "start".into(),
                            Value::String(format_seconds_to_timestamp(start)),
                        );
                    }
                    if let Some(end) = paragraph_end {
                        timestamp_range.insert(
                            "end".into(),
                            Value::String(format_seconds_to_timestamp(end)),
                        );
                    }
                    paragraph.insert("timestamp_range".into(), Value::Object(timestamp_range));
                    segment_details.insert("paragraph".into(), Value::Object(paragraph));
                }

                let mut details = Map::new();
                for key in ["language", "speaker", "speaker_label", "confidence"] {
                    if let Some(value) = raw.metadata.get(key) {
                        if !is_empty_value(value) {
                            details.insert(key.into(), value.clone());
                        }
                    }
                }
                if !details.is_empty() {
                    segment_details.insert("details".into(), Value::Object(details));
                }

                let pages = vec![serde_json::json!({
                    "page_number": Value::Null,
                    "segments": [Value::Object(segment_details)],
                })];

                let uri = raw.uri.as_deref().or(item.uri.as_deref());
                let mime = raw.mime.as_deref().or(item.mime.as_deref());
                let metadata = make_chunk_metadata(
                    uri,
                    path_hash,
                    chunk_counter,
                    mime,
                    "markdown",
                    pages,
                    user_id,
                );

                prepared.push(DocChunk::new(
                    chunk_counter,
                    segment_text,
                    uri,
                    mime,
                    source,
                    metadata,
                ));
            }
        }

        prepared
    }

    // ── Document mode ──────────────────────────────────────────────

    fn prepare_text_chunks(
        &self,
        raw_chunks: Vec<DocChunk>,
        item: &IngestionItem,
        source: SourceKind,
        path_hash: &str,
        user_id: Option<i64>,
    ) -> Vec<DocChunk> {
        // Flatten raw chunks into one token stream; token_sources maps
        // each token back to its contributing summary.
        let mut tokens: Vec<String> = Vec::new();
        let mut token_sources: Vec<Option<usize>> = Vec::new();
        let mut summaries: Vec<SpanSummary> = Vec::new();

        for raw in &raw_chunks {
            let text = raw.text.trim();
            if text.is_empty() {
                continue;
            }
            let chunk_tokens = tokenize_text(text);
            if chunk_tokens.is_empty() {
                continue;
            }

            if !tokens.is_empty() {
                tokens.push("\n\n".to_string());
                token_sources.push(None);
            }

            let global_start = tokens.len();
            let count = chunk_tokens.len();
            tokens.extend(chunk_tokens);
            let global_end = tokens.len();

            let summary_index = summaries.len();
            summaries.push(SpanSummary {
                source_chunk_id: raw.chunk_id,
                metadata: raw.metadata.clone(),
                global_start,
                global_end,
            });
            token_sources.extend(std::iter::repeat(Some(summary_index)).take(count));
        }

        if tokens.is_empty() {
            return Vec::new();
        }

        let mut chunk_counter = 0u32;
        let mut prepared = Vec::new();

        for (token_start, token_end) in
            chunk_token_ranges(tokens.len(), self.chunk_size, self.chunk_overlap)
        {
            let segment_text = tokens[token_start..token_end].concat();
            let segment_text = segment_text.trim().to_string();
            if segment_text.is_empty() {
                continue;
            }
            chunk_counter += 1;

            let overlaps =
                collect_span_overlaps(&summaries, &token_sources, token_start, token_end);
            let (pages, artifacts) = build_pages_metadata(&overlaps, &segment_text);
            let output_format = select_output_format(&segment_text, &artifacts);
            let metadata = make_chunk_metadata(
                item.uri.as_deref(),
                path_hash,
                chunk_counter,
                item.mime.as_deref(),
                output_format,
                pages.clone(),
                user_id,
            );

            let final_text = if output_format == "json" {
                let mut payload = Map::new();
                payload.insert("pages".into(), Value::Array(pages));
                if !artifacts.tables.is_empty() {
                    payload.insert("tables".into(), Value::Array(artifacts.tables.clone()));
                }
                if !artifacts.charts.is_empty() {
                    payload.insert("charts".into(), Value::Array(artifacts.charts.clone()));
                }
                if !artifacts.images.is_empty() {
                    payload.insert("images".into(), Value::Array(artifacts.images.clone()));
                }
                Value::Object(payload).to_string()
            } else {
                render_chunk_markdown(&segment_text, &artifacts)
            };

            prepared.push(DocChunk::new(
                chunk_counter,
                final_text,
                item.uri.as_deref(),
                item.mime.as_deref(),
                source,
                metadata,
            ));
        }

        prepared
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Window provenance
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn collect_span_overlaps<'a>(
    summaries: &'a [SpanSummary],
    token_sources: &[Option<usize>],
    token_start: usize,
    token_end: usize,
) -> Vec<SpanOverlap<'a>> {
    let mut contributors: Vec<usize> = token_sources
        [token_start..token_end.min(token_sources.len())]
        .iter()
        .flatten()
        .copied()
        .collect();
    contributors.sort_unstable();
    contributors.dedup();

    contributors
        .into_iter()
        .filter_map(|index| {
            let summary = &summaries[index];
            let overlap_start = token_start.max(summary.global_start);
            let overlap_end = token_end.min(summary.global_end);
            if overlap_start >= overlap_end {
                return None;
            }
            Some(SpanOverlap {
                summary,
                absolute: (overlap_start, overlap_end),
                relative: (
                    overlap_start - summary.global_start,
                    overlap_end - summary.global_start,
                ),
            })
        })
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Page + artifact metadata
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn build_pages_metadata(overlaps: &[SpanOverlap<'_>], segment_text: &str) -> (Vec<Value>, Artifacts) {
    if overlaps.is_empty() {
        return (Vec::new(), Artifacts::default());
    }

    // Page entries keep insertion order here and are sorted at the end
    // (numbered pages first, page-less content last).
    let mut pages: Vec<(Option<i64>, Value)> = Vec::new();
    let mut tables = Vec::new();
    let mut images = Vec::new();
    let mut charts = Vec::new();

    for overlap in overlaps {
        let span_metadata = &overlap.summary.metadata;
        let page_number = span_metadata.get("page").and_then(Value::as_i64);

        let mut segment_entry = format_page_segment(overlap, span_metadata, segment_text);

        if let Some(table_info) = extract_table_artifact(span_metadata, overlap, page_number) {
            segment_entry.insert("table".into(), table_info["data"].clone());
            if let Some(caption) = table_info["caption"].as_str() {
                push_label(&mut segment_entry, caption);
            }
            tables.push(table_info);
        }

        if let Some(image_info) = extract_image_artifact(span_metadata, overlap, page_number) {
            let mut brief = Map::new();
            for key in ["image_ref", "caption", "detailed_caption", "hash"] {
                brief.insert(key.into(), image_info[key].clone());
            }
            segment_entry.insert("image".into(), Value::Object(brief));
            images.push(image_info);
        }

        if let Some(chart_info) = extract_chart_artifact(span_metadata, overlap, page_number) {
            segment_entry.insert("chart".into(), chart_info["data"].clone());
            if let Some(caption) = chart_info["caption"].as_str() {
                push_label(&mut segment_entry, caption);
            }
            charts.push(chart_info);
        }

        let slot = match pages.iter().position(|(page, _)| *page == page_number) {
            Some(slot) => slot,
            None => {
                pages.push((
                    page_number,
                    serde_json::json!({ "page_number": page_number, "segments": [] }),
                ));
                pages.len() - 1
            }
        };
        if let Some(segments) = pages[slot].1["segments"].as_array_mut() {
            segments.push(Value::Object(segment_entry));
        }
    }

    pages.sort_by_key(|(page, _)| (page.is_none(), page.unwrap_or(0)));
    let pages_list = pages.into_iter().map(|(_, entry)| entry).collect();

    let artifacts = Artifacts {
        tables: dedupe_by(tables, |t| stable_key(t)),
        images: dedupe_by(images, image_key),
        charts: dedupe_by(charts, |c| stable_key(c)),
    };
    (pages_list, artifacts)
}

fn push_label(entry: &mut Map<String, Value>, label: &str) {
    let labels = entry
        .entry("labels".to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    if let Some(labels) = labels.as_array_mut() {
        labels.push(Value::String(label.to_string()));
    }
}

fn format_page_segment(
    overlap: &SpanOverlap<'_>,
    metadata: &Map<String, Value>,
    segment_text: &str,
) -> Map<String, Value> {
    let mut entry = Map::new();
    entry.insert(
        "source_chunk".into(),
        (overlap.summary.source_chunk_id as u64).into(),
    );
    entry.insert(
        "token_range".into(),
        serde_json::json!([overlap.relative.0, overlap.relative.1]),
    );
    entry.insert(
        "absolute_token_range".into(),
        serde_json::json!([overlap.absolute.0, overlap.absolute.1]),
    );

    let content_type = metadata
        .get("content_type")
        .and_then(Value::as_str)
        .unwrap_or("text");
    entry.insert("type".into(), Value::String(content_type.to_string()));

    match metadata.get("text").and_then(Value::as_str) {
        Some(text) if !text.trim().is_empty() => {
            entry.insert("text".into(), Value::String(text.trim().to_string()));
        }
        _ => {
            if content_type == "text" && !segment_text.trim().is_empty() {
                entry.insert("text".into(), Value::String(segment_text.trim().to_string()));
            }
        }
    }

    if let Some(heading) = metadata.get("heading").and_then(Value::as_str) {
        if !heading.trim().is_empty() {
            entry.insert("heading".into(), Value::String(heading.trim().to_string()));
        }
    }

    let details = sanitize_span_details(metadata);
    if !details.is_empty() {
        entry.insert("details".into(), Value::Object(details));
    }

    entry
}

/// Keys already surfaced elsewhere in the segment entry or artifacts.
const SPAN_DETAIL_DROP_KEYS: [&str; 18] = [
    "page",
    "content_type",
    "table_data",
    "table_caption",
    "chart_data",
    "chart_caption",
    "chart_type",
    "chart_transcription",
    "chart",
    "caption",
    "label",
    "detailed_caption",
    "image_ref",
    "image_hash",
    "image_dimensions",
    "ocr_text",
    "alt_text",
    "text",
];

fn sanitize_span_details(metadata: &Map<String, Value>) -> Map<String, Value> {
    metadata
        .iter()
        .filter(|(key, value)| {
            !SPAN_DETAIL_DROP_KEYS.contains(&key.as_str()) && !is_empty_value(value)
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn extract_table_artifact(
    metadata: &Map<String, Value>,
    overlap: &SpanOverlap<'_>,
    page_number: Option<i64>,
) -> Option<Value> {
    let table_data = metadata.get("table_data")?;
    Some(serde_json::json!({
        "data": table_data,
        "caption": metadata.get("table_caption").or_else(|| metadata.get("caption")),
        "page": page_number,
        "source_chunk": overlap.summary.source_chunk_id,
    }))
}

fn extract_image_artifact(
    metadata: &Map<String, Value>,
    overlap: &SpanOverlap<'_>,
    page_number: Option<i64>,
) -> Option<Value> {
    let is_image = metadata.get("content_type").and_then(Value::as_str) == Some("image");
    if !is_image && !metadata.contains_key("image_ref") {
        return None;
    }
    let caption = metadata.get("caption").or_else(|| metadata.get("label"));
    Some(serde_json::json!({
        "image_ref": metadata.get("image_ref"),
        "caption": caption,
        "detailed_caption": metadata.get("detailed_caption").or(caption),
        "hash": metadata.get("image_hash"),
        "page": page_number,
        "source_chunk": overlap.summary.source_chunk_id,
        "ocr_text": metadata.get("ocr_text"),
        "dimensions": metadata.get("image_dimensions"),
        "alt_text": metadata.get("alt_text"),
    }))
}

fn extract_chart_artifact(
    metadata: &Map<String, Value>,
    overlap: &SpanOverlap<'_>,
    page_number: Option<i64>,
) -> Option<Value> {
    let chart_data = metadata.get("chart_data").or_else(|| metadata.get("chart"))?;
    let mut info = serde_json::json!({
        "data": chart_data,
        "caption": metadata.get("chart_caption").or_else(|| metadata.get("caption")),
        "type": metadata.get("chart_type"),
        "page": page_number,
        "source_chunk": overlap.summary.source_chunk_id,
    });
    if let Some(transcription) = metadata
        .get("chart_transcription")
        .or_else(|| metadata.get("transcription"))
    {
        info["transcription"] = transcription.clone();
    }
    Some(info)
}

fn dedupe_by(items: Vec<Value>, key_fn: impl Fn(&Value) -> String) -> Vec<Value> {
    let mut seen = std::collections::HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(key_fn(item)))
        .collect()
}

fn stable_key(value: &Value) -> String {
    value.to_string()
}

/// Images dedupe by hash, then reference + page, then full content.
fn image_key(image: &Value) -> String {
    if let Some(hash) = image["hash"].as_str() {
        return format!("hash:{hash}");
    }
    if let Some(image_ref) = image["image_ref"].as_str() {
        return format!("ref:{image_ref}:{}", image["page"]);
    }
    image.to_string()
}

fn select_output_format(segment_text: &str, artifacts: &Artifacts) -> &'static str {
    if !segment_text.trim().is_empty() {
        return "markdown";
    }
    if !artifacts.tables.is_empty() || !artifacts.charts.is_empty() {
        return "json";
    }
    "markdown"
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Markdown rendering
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Render the chunk as markdown: the base text followed by embedded
/// table / image / chart sections.
pub fn render_chunk_markdown(text: &str, artifacts: &Artifacts) -> String {
    let mut parts: Vec<String> = Vec::new();
    let base = text.trim();
    if !base.is_empty() {
        parts.push(base.to_string());
    }

    if artifacts.is_empty() {
        return if parts.is_empty() {
            text.to_string()
        } else {
            parts.join("\n\n")
        };
    }

    let tables = render_tables_markdown(&artifacts.tables);
    if !tables.is_empty() {
        parts.push(tables);
    }
    let images = render_images_markdown(&artifacts.images);
    if !images.is_empty() {
        parts.push(images);
    }
    let charts = render_charts_markdown(&artifacts.charts);
    if !charts.is_empty() {
        parts.push(charts);
    }

    parts
        .iter()
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn render_tables_markdown(tables: &[Value]) -> String {
    let total = tables.len();
    let mut blocks = Vec::new();

    for (idx, table) in tables.iter().enumerate() {
        let idx = idx + 1;
        let (caption, data) = match table {
            Value::Object(obj) => (
                obj.get("caption").and_then(Value::as_str),
                obj.get("data")
                    .or_else(|| obj.get("table"))
                    .or_else(|| obj.get("table_data"))
                    .unwrap_or(table),
            ),
            _ => (None, table),
        };

        let table_md = table_to_markdown(data);
        if table_md.is_empty() {
            continue;
        }
        let label = match caption {
            Some(caption) => format!("**Table {idx}: {}**", escape_markdown_text(caption)),
            None if total > 1 => format!("**Table {idx}:**"),
            None => "**Table:**".to_string(),
        };
        blocks.push(format!("{label}\n\n{table_md}"));
    }

    if blocks.is_empty() {
        String::new()
    } else {
        format!("### Embedded Tables\n\n{}", blocks.join("\n\n"))
    }
}

fn render_images_markdown(images: &[Value]) -> String {
    let mut blocks = Vec::new();

    for (idx, image) in images.iter().enumerate() {
        let idx = idx + 1;
        let Value::Object(image) = image else { continue };

        let caption_value = image
            .get("caption")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .or_else(|| image.get("detailed_caption").and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| format!("Embedded image {idx}"));
        let caption = escape_markdown_text(&caption_value);

        let image_ref = match image.get("image_ref").and_then(Value::as_str) {
            Some(r) if !r.is_empty() && r != "None" => r.to_string(),
            _ => {
                let placeholder = image
                    .get("hash")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("image-{idx}"));
                format!("#embedded-image-{placeholder}")
            }
        };
        let image_line = format!("![{caption}]({image_ref})");

        let mut details: Vec<String> = Vec::new();
        if let Some(detailed) = image.get("detailed_caption").and_then(Value::as_str) {
            if Some(detailed) != image.get("caption").and_then(Value::as_str) {
                details.push(format!("Detailed caption: {detailed}"));
            }
        }
        if let Some(dims) = image.get("dimensions").and_then(Value::as_object) {
            if let (Some(width), Some(height)) = (
                dims.get("width").and_then(Value::as_u64),
                dims.get("height").and_then(Value::as_u64),
            ) {
                details.push(format!("Dimensions: {width}×{height} px"));
            }
        }
        if let Some(ocr) = image.get("ocr_text").and_then(Value::as_str) {
            if !ocr.is_empty() {
                details.push(format!("OCR: {ocr}"));
            }
        }
        if let Some(hash) = image.get("hash").and_then(Value::as_str) {
            details.push(format!("Image hash: `{hash}`"));
        }

        let detail_text = details
            .iter()
            .map(|line| format!("> {}", escape_markdown_text(line)))
            .collect::<Vec<_>>()
            .join("\n");

        if detail_text.is_empty() {
            blocks.push(image_line);
        } else {
            blocks.push(format!("{image_line}\n\n{detail_text}"));
        }
    }

    if blocks.is_empty() {
        String::new()
    } else {
        format!("### Embedded Images\n\n{}", blocks.join("\n\n\n"))
    }
}

fn render_charts_markdown(charts: &[Value]) -> String {
    let mut blocks = Vec::new();

    for (idx, chart) in charts.iter().enumerate() {
        let idx = idx + 1;
        let Value::Object(chart) = chart else { continue };

        let caption_value = chart
            .get("caption")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("Embedded chart {idx}"));
        let mut lines = vec![format!(
            "**Chart {idx}: {}**",
            escape_markdown_text(&caption_value)
        )];

        if let Some(chart_type) = chart.get("type").and_then(Value::as_str) {
            lines.push(format!("> Type: {}", escape_markdown_text(chart_type)));
        }
        if let Some(transcription) = chart.get("transcription").and_then(Value::as_str) {
            lines.push(format!(
                "> Transcription: {}",
                escape_markdown_text(transcription)
            ));
        }
        if let Some(data) = chart.get("data") {
            if !data.is_null() {
                let data_json = serde_json::to_string_pretty(data)
                    .unwrap_or_else(|_| data.to_string());
                lines.push(format!("```json\n{data_json}\n```"));
            }
        }
        blocks.push(lines.join("\n\n"));
    }

    if blocks.is_empty() {
        String::new()
    } else {
        format!("### Embedded Charts\n\n{}", blocks.join("\n\n"))
    }
}

fn table_to_markdown(table: &Value) -> String {
    let grid: Option<&Vec<Value>> = match table {
        Value::Object(obj) => obj
            .get("grid")
            .and_then(Value::as_array)
            .or_else(|| obj.get("rows").and_then(Value::as_array))
            .or_else(|| {
                obj.get("table")
                    .and_then(Value::as_object)
                    .and_then(|inner| {
                        inner
                            .get("rows")
                            .and_then(Value::as_array)
                            .or_else(|| inner.get("grid").and_then(Value::as_array))
                    })
            }),
        Value::Array(rows) => Some(rows),
        _ => None,
    };
    let Some(grid) = grid else {
        return String::new();
    };

    let mut rows: Vec<Vec<String>> = Vec::new();
    for row in grid {
        let row_values: Vec<String> = match row {
            Value::Array(cells) => cells.iter().map(stringify_table_cell).collect(),
            other => vec![stringify_table_cell(other)],
        };
        if row_values.iter().any(|value| !value.trim().is_empty()) {
            rows.push(row_values);
        }
    }
    if rows.is_empty() {
        return String::new();
    }

    let column_count = rows[0].len();
    if column_count == 0 {
        return String::new();
    }
    let pad = |mut row: Vec<String>| -> Vec<String> {
        row.resize(column_count, String::new());
        row
    };

    let mut iter = rows.into_iter();
    let header = pad(iter.next().expect("non-empty rows"));
    let mut lines = vec![
        format!("| {} |", header.join(" | ")),
        format!("| {} |", vec!["---"; column_count].join(" | ")),
    ];
    for row in iter {
        lines.push(format!("| {} |", pad(row).join(" | ")));
    }
    lines.join("\n")
}

fn stringify_table_cell(cell: &Value) -> String {
    match cell {
        Value::Null => String::new(),
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Object(obj) => {
            for key in ["text", "content", "value", "raw"] {
                if let Some(value) = obj.get(key) {
                    if !is_empty_value(value) {
                        return stringify_table_cell(value);
                    }
                }
            }
            cell.to_string()
        }
        Value::Array(items) => items
            .iter()
            .map(stringify_table_cell)
            .collect::<Vec<_>>()
            .join(" ")
            .trim()
            .to_string(),
    }
}

fn escape_markdown_text(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('|', "\\|")
        .replace('[', "\\[")
        .replace(']', "\\]")
        .replace('\r', " ")
        .replace('\n', " ")
        .trim()
        .to_string()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Shared metadata shape
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn make_chunk_metadata(
    uri: Option<&str>,
    path_hash: &str,
    chunk_id: u32,
    original_format: Option<&str>,
    output_format: &str,
    pages: Vec<Value>,
    user_id: Option<i64>,
) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert(
        "uri".into(),
        uri.map(|u| Value::String(u.to_string())).unwrap_or(Value::Null),
    );
    metadata.insert("path_hash".into(), Value::String(path_hash.to_string()));
    metadata.insert("chunk_id".into(), (chunk_id as u64).into());
    metadata.insert(
        "original_format".into(),
        original_format
            .map(|f| Value::String(f.to_string()))
            .unwrap_or(Value::Null),
    );
    metadata.insert(
        "output_format".into(),
        Value::String(output_format.to_string()),
    );
    metadata.insert("pages".into(), Value::Array(pages));
    if let Some(user_id) = user_id {
        metadata.insert("user_id".into(), user_id.into());
    }
    metadata
}

/// Interpolate a token window's time range proportionally within its
/// paragraph's start/end seconds.
fn interpolate_window(
    paragraph_start: Option<f64>,
    paragraph_end: Option<f64>,
    token_start: usize,
    token_end: usize,
    total_tokens: usize,
) -> (Option<f64>, Option<f64>) {
    match (paragraph_start, paragraph_end) {
        (Some(start), Some(end)) if total_tokens > 0 && end >= start => {
            let duration = end - start;
            let start_ratio = token_start as f64 / total_tokens as f64;
            let end_ratio = token_end as f64 / total_tokens as f64;
            (
                Some(start + duration * start_ratio),
                Some(start + duration * end_ratio),
            )
        }
        _ => (paragraph_start, paragraph_end),
    }
}

pub fn format_seconds_to_timestamp(value: f64) -> String {
    let total_seconds = if value.is_finite() && value > 0.0 {
        value.round() as u64
    } else {
        0
    };
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

fn round3(value: f64) -> Value {
    serde_json::Number::from_f64((value * 1000.0).round() / 1000.0)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn item(mime: &str) -> IngestionItem {
        IngestionItem {
            path: PathBuf::from("/tmp/doc"),
            uri: Some("file:///tmp/doc".into()),
            mime: Some(mime.to_string()),
            bytes_size: 10,
        }
    }

    fn raw_chunk(chunk_id: u32, text: &str, metadata: Value) -> DocChunk {
        let Value::Object(metadata) = metadata else {
            panic!("metadata must be an object")
        };
        DocChunk::new(chunk_id, text, None, None, SourceKind::File, metadata)
    }

    #[test]
    fn timestamp_formatting() {
        assert_eq!(format_seconds_to_timestamp(0.0), "00:00:00");
        assert_eq!(format_seconds_to_timestamp(61.4), "00:01:01");
        assert_eq!(format_seconds_to_timestamp(3723.0), "01:02:03");
        assert_eq!(format_seconds_to_timestamp(-5.0), "00:00:00");
    }

    #[test]
    fn media_chunks_interpolate_time() {
        let builder = ChunkBuilder::new(10, 2);
        // 20 words -> 39 tokens (word + space), two windows.
        let words: Vec<String> = (0..20).map(|i| format!("w{i}")).collect();
        let raw = raw_chunk(
            1,
            &words.join(" "),
            serde_json::json!({ "start": 0.0, "end": 100.0, "language": "en" }),
        );

        let chunks =
            builder.prepare(vec![raw], &item("audio/mpeg"), SourceKind::Audio, "hash", None);
        assert!(chunks.len() > 1);

        let first = &chunks[0];
        assert_eq!(first.chunk_id, 1);
        let pages = first.metadata["pages"].as_array().unwrap();
        let segment = &pages[0]["segments"][0];
        assert_eq!(segment["type"], "transcript");
        assert_eq!(segment["timeline"]["start"], 0.0);
        assert_eq!(segment["timeline"]["start_timestamp"], "00:00:00");
        assert_eq!(segment["details"]["language"], "en");
        // Later windows begin strictly after the paragraph start.
        let second_start = chunks[1].metadata["pages"][0]["segments"][0]["timeline"]["start"]
            .as_f64()
            .unwrap();
        assert!(second_start > 0.0);
        assert!(second_start < 100.0);
    }

    #[test]
    fn document_mode_tracks_page_provenance() {
        let builder = ChunkBuilder::new(500, 50);
        let chunks = builder.prepare(
            vec![
                raw_chunk(1, "First page text.", serde_json::json!({ "page": 1, "content_type": "text" })),
                raw_chunk(2, "Second page text.", serde_json::json!({ "page": 2, "content_type": "text" })),
            ],
            &item("application/pdf"),
            SourceKind::File,
            "hash",
            Some(7),
        );

        assert_eq!(chunks.len(), 1);
        let chunk = &chunks[0];
        assert_eq!(chunk.metadata["user_id"], 7);
        assert_eq!(chunk.metadata["output_format"], "markdown");
        assert_eq!(chunk.metadata["path_hash"], "hash");

        let pages = chunk.metadata["pages"].as_array().unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0]["page_number"], 1);
        assert_eq!(pages[1]["page_number"], 2);
        assert_eq!(pages[0]["segments"][0]["source_chunk"], 1);
        assert_eq!(pages[1]["segments"][0]["source_chunk"], 2);
    }

    #[test]
    fn table_artifacts_render_as_markdown_section() {
        let builder = ChunkBuilder::new(500, 50);
        let chunks = builder.prepare(
            vec![
                raw_chunk(1, "Quarterly summary.", serde_json::json!({ "page": 1, "content_type": "text" })),
                raw_chunk(
                    2,
                    "Revenue Amount Q1 1000",
                    serde_json::json!({
                        "page": 2,
                        "content_type": "table",
                        "table_data": { "rows": [["Revenue", "Amount"], ["Q1", "1000"]] },
                    }),
                ),
            ],
            &item("application/pdf"),
            SourceKind::File,
            "hash",
            None,
        );

        assert_eq!(chunks.len(), 1);
        let text = &chunks[0].text;
        assert!(text.contains("Quarterly summary."));
        assert!(text.contains("### Embedded Tables"));
        assert!(text.contains("| Revenue | Amount |"));
        assert!(text.contains("| --- | --- |"));
        assert!(text.contains("| Q1 | 1000 |"));
    }

    #[test]
    fn duplicate_tables_are_deduped() {
        let table = serde_json::json!({
            "page": 1,
            "content_type": "table",
            "table_data": { "rows": [["A"], ["1"]] },
        });
        let builder = ChunkBuilder::new(500, 50);
        let chunks = builder.prepare(
            vec![
                raw_chunk(1, "| A |\n| 1 |", table.clone()),
                raw_chunk(2, "| A |\n| 1 |", table),
            ],
            &item("application/pdf"),
            SourceKind::File,
            "hash",
            None,
        );

        // Identical grid + page collapses to one artifact, so the
        // rendered section has a single unnumbered label.
        assert_eq!(chunks[0].text.matches("**Table").count(), 1);
    }

    #[test]
    fn image_artifacts_render_links_and_details() {
        let builder = ChunkBuilder::new(500, 50);
        let chunks = builder.prepare(
            vec![raw_chunk(
                1,
                "Image caption: system architecture",
                serde_json::json!({
                    "page": 3,
                    "content_type": "image",
                    "caption": "system architecture",
                    "image_hash": "deadbeef",
                    "image_dimensions": { "width": 640, "height": 480 },
                    "ocr_text": "boxes and arrows",
                }),
            )],
            &item("application/pdf"),
            SourceKind::File,
            "hash",
            None,
        );

        let text = &chunks[0].text;
        assert!(text.contains("### Embedded Images"));
        assert!(text.contains("![system architecture](#embedded-image-deadbeef)"));
        assert!(text.contains("Dimensions: 640×480 px"));
        assert!(text.contains("OCR: boxes and arrows"));
    }

    #[test]
    fn overlap_windows_share_source_chunks() {
        let builder = ChunkBuilder::new(20, 5);
        let long_text: String = (0..30).map(|i| format!("word{i} ")).collect();
        let chunks = builder.prepare(
            vec![raw_chunk(1, long_text.trim(), serde_json::json!({ "page": 1 }))],
            &item("text/plain"),
            SourceKind::File,
            "hash",
            None,
        );

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            let pages = chunk.metadata["pages"].as_array().unwrap();
            assert_eq!(pages[0]["segments"][0]["source_chunk"], 1);
            let range = pages[0]["segments"][0]["absolute_token_range"]
                .as_array()
                .unwrap();
            assert!(range[0].as_u64().unwrap() < range[1].as_u64().unwrap());
        }
    }

    #[test]
    fn chunk_ids_are_monotone() {
        let builder = ChunkBuilder::new(10, 2);
        let long_text: String = (0..50).map(|i| format!("word{i} ")).collect();
        let chunks = builder.prepare(
            vec![raw_chunk(1, long_text.trim(), serde_json::json!({}))],
            &item("text/plain"),
            SourceKind::File,
            "hash",
            None,
        );
        let ids: Vec<u32> = chunks.iter().map(|c| c.chunk_id).collect();
        let expected: Vec<u32> = (1..=chunks.len() as u32).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn table_to_markdown_handles_grid_shapes() {
        let from_rows = table_to_markdown(&serde_json::json!({ "rows": [["A", "B"], ["1", "2"]] }));
        assert!(from_rows.starts_with("| A | B |"));

        let from_list = table_to_markdown(&serde_json::json!([["X"], ["9"]]));
        assert!(from_list.contains("| X |"));

        let ragged = table_to_markdown(&serde_json::json!({ "rows": [["A", "B"], ["only"]] }));
        assert!(ragged.contains("| only |  |"));

        assert_eq!(table_to_markdown(&serde_json::json!("nope")), "");
    }

    #[test]
    fn escape_markdown_special_chars() {
        assert_eq!(escape_markdown_text("a|b [c]\nd"), "a\\|b \\[c\\] d");
    }
}
