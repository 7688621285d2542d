//! Token-window chunking.
//!
//! The tokenizer is whitespace-preserving: words, single punctuation
//! marks, and whitespace runs are separate tokens, so joining a window
//! reproduces the original text exactly. Windows of `size` tokens slide
//! with `overlap` tokens of context carried between neighbours.

use std::sync::OnceLock;

use regex::Regex;

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\w+|[^\w\s]|\s+").expect("valid token pattern"))
}

/// Split text into word / punctuation / whitespace tokens.
pub fn tokenize_text(text: &str) -> Vec<String> {
    token_pattern()
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Sliding-window token ranges.
///
/// The final window ends exactly at the token count; every other window
/// is `size` tokens and the next one starts `overlap` tokens earlier.
/// `overlap` must be smaller than `size` (validated at startup).
pub fn chunk_token_ranges(token_count: usize, size: usize, overlap: usize) -> Vec<(usize, usize)> {
    debug_assert!(size > 0, "chunk size must be positive");
    debug_assert!(overlap < size, "overlap must be smaller than size");

    let mut ranges = Vec::new();
    let mut start = 0;
    while start < token_count {
        let end = token_count.min(start + size);
        ranges.push((start, end));
        if end == token_count {
            break;
        }
        start = end - overlap;
    }
    ranges
}

/// Split text into overlapping token chunks suitable for embedding.
///
/// For markdown with tables, prefer [`chunk_markdown_with_headers`] so
/// table context survives window boundaries.
pub fn chunk_text(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let normalized = text.trim();
    if normalized.is_empty() {
        return Vec::new();
    }

    let tokens = tokenize_text(normalized);
    if tokens.is_empty() {
        return Vec::new();
    }

    chunk_token_ranges(tokens.len(), size, overlap)
        .into_iter()
        .filter_map(|(start, end)| {
            let segment = tokens[start..end].concat();
            let segment = segment.trim();
            if segment.is_empty() {
                None
            } else {
                Some(segment.to_string())
            }
        })
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Markdown-aware chunking
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn separator_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\s*\|?[\s\-:|]+\|[\s\-:|]+\|?\s*$").expect("valid separator pattern")
    })
}

#[derive(Debug, Clone)]
struct TableHeader {
    header_line: String,
    separator_line: String,
}

/// Split markdown into chunks, prefixing table continuations with the
/// table's header and separator rows so each chunk keeps its context.
pub fn chunk_markdown_with_headers(markdown: &str, size: usize, overlap: usize) -> Vec<String> {
    let normalized = markdown.trim();
    if normalized.is_empty() {
        return Vec::new();
    }

    let headers = find_table_headers(normalized);
    if headers.is_empty() {
        return chunk_text(normalized, size, overlap);
    }

    let tokens = tokenize_text(normalized);
    if tokens.is_empty() {
        return Vec::new();
    }

    chunk_token_ranges(tokens.len(), size, overlap)
        .into_iter()
        .filter_map(|(start, end)| {
            let segment = tokens[start..end].concat();
            let segment = segment.trim();
            if segment.is_empty() {
                return None;
            }
            Some(prepend_table_header_if_needed(segment, &headers, start > 0))
        })
        .collect()
}

fn find_table_headers(markdown: &str) -> Vec<TableHeader> {
    let lines: Vec<&str> = markdown.split('\n').collect();
    let mut headers = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        if i > 0 && separator_pattern().is_match(line) {
            headers.push(TableHeader {
                header_line: lines[i - 1].to_string(),
                separator_line: line.to_string(),
            });
        }
    }
    headers
}

/// Prepend a table header when the chunk starts inside a table body.
fn prepend_table_header_if_needed(
    chunk: &str,
    headers: &[TableHeader],
    is_continuation: bool,
) -> String {
    if !is_continuation || headers.is_empty() {
        return chunk.to_string();
    }

    let lines: Vec<&str> = chunk.split('\n').collect();
    let has_table_rows = lines.iter().take(5).any(|line| line.contains('|'));
    if !has_table_rows {
        return chunk.to_string();
    }

    // Already carries its own header?
    if lines.len() >= 2 && separator_pattern().is_match(lines[1]) {
        return chunk.to_string();
    }

    // Use the last table header seen before this content.
    let header = &headers[headers.len() - 1];
    format!(
        "{}\n{}\n\n{}",
        header.header_line, header.separator_line, chunk
    )
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizer_separates_words_punctuation_whitespace() {
        let tokens = tokenize_text("Hello, world!");
        assert_eq!(tokens, vec!["Hello", ",", " ", "world", "!"]);
    }

    #[test]
    fn tokenizer_roundtrips() {
        let text = "line one\n\n  line two, with  spacing!";
        assert_eq!(tokenize_text(text).concat(), text);
    }

    #[test]
    fn ranges_cover_all_tokens_with_overlap() {
        let ranges = chunk_token_ranges(25, 10, 3);
        assert_eq!(ranges, vec![(0, 10), (7, 17), (14, 24), (21, 25)]);
    }

    #[test]
    fn ranges_single_window_when_small() {
        assert_eq!(chunk_token_ranges(5, 10, 3), vec![(0, 5)]);
        assert!(chunk_token_ranges(0, 10, 3).is_empty());
    }

    #[test]
    fn chunk_roundtrip_with_overlap_removed() {
        // Concatenating consecutive windows minus the overlap tokens
        // reproduces the original token stream.
        let text = "the quick brown fox jumps over the lazy dog again and again";
        let tokens = tokenize_text(text);
        let ranges = chunk_token_ranges(tokens.len(), 8, 3);

        let mut rebuilt: Vec<String> = Vec::new();
        for (i, (start, end)) in ranges.iter().enumerate() {
            let skip = if i == 0 { 0 } else { 3 };
            rebuilt.extend(tokens[start + skip..*end].iter().cloned());
        }
        assert_eq!(rebuilt.concat(), text);
    }

    #[test]
    fn chunk_text_empty_input() {
        assert!(chunk_text("", 10, 2).is_empty());
        assert!(chunk_text("   \n ", 10, 2).is_empty());
    }

    #[test]
    fn markdown_without_tables_falls_back_to_plain_chunking() {
        let text = "just a plain paragraph of markdown text with no tables at all";
        assert_eq!(
            chunk_markdown_with_headers(text, 500, 50),
            chunk_text(text, 500, 50)
        );
    }

    #[test]
    fn table_continuation_gets_header_prefix() {
        let mut markdown = String::from("| Name | Value |\n| --- | --- |\n");
        for i in 0..200 {
            markdown.push_str(&format!("| row{i} | {i} |\n"));
        }

        let chunks = chunk_markdown_with_headers(&markdown, 120, 10);
        assert!(chunks.len() > 1);
        for chunk in &chunks[1..] {
            assert!(
                chunk.starts_with("| Name | Value |"),
                "continuation chunk missing table header: {}",
                &chunk[..chunk.len().min(60)]
            );
        }
    }

    #[test]
    fn first_chunk_not_modified() {
        let markdown = "| A | B |\n| --- | --- |\n| 1 | 2 |";
        let chunks = chunk_markdown_with_headers(markdown, 500, 50);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], markdown);
    }
}
