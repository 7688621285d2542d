//! Audio/video transcription.
//!
//! Media is demuxed to mono 16 kHz PCM WAV with an `ffmpeg` subprocess
//! and handed to a Whisper-style engine behind the [`SpeechToText`]
//! trait. Segments are grouped into paragraphs on terminal punctuation
//! or embedded newlines; each paragraph chunk carries start/end seconds
//! and formatted timestamps.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::builder::format_seconds_to_timestamp;
use crate::models::{DocChunk, IngestError, SourceKind};

/// One recognized speech segment.
#[derive(Debug, Clone)]
pub struct SpeechSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// A full transcription pass.
#[derive(Debug, Clone, Default)]
pub struct Transcription {
    pub segments: Vec<SpeechSegment>,
    pub language: Option<String>,
}

/// Speech-to-text seam. The engine is a pluggable endpoint; `release`
/// frees whatever the implementation keeps loaded.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn transcribe(
        &self,
        wav: &Path,
        language_hint: Option<&str>,
    ) -> Result<Transcription, IngestError>;

    fn name(&self) -> &'static str {
        "whisper"
    }

    fn release(&self) {}
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Whisper HTTP endpoint
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Whisper-compatible transcription server.
///
/// Sends the WAV body to the configured endpoint with model, compute
/// type, device, and optional language as query parameters, and expects
/// `{"language": …, "segments": [{"start", "end", "text"}]}` back
/// (a bare `{"text": …}` is accepted as a single segment).
pub struct WhisperEndpoint {
    endpoint: String,
    model: String,
    compute_type: String,
    device: String,
    client: reqwest::Client,
}

impl WhisperEndpoint {
    pub fn new(
        endpoint: &str,
        model: &str,
        compute_type: &str,
        device: &str,
    ) -> Result<Self, IngestError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(600))
            .build()
            .map_err(|e| IngestError::Engine(e.to_string()))?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model: model.to_string(),
            compute_type: compute_type.to_string(),
            device: device.to_string(),
            client,
        })
    }
}

#[async_trait]
impl SpeechToText for WhisperEndpoint {
    async fn transcribe(
        &self,
        wav: &Path,
        language_hint: Option<&str>,
    ) -> Result<Transcription, IngestError> {
        let audio = tokio::fs::read(wav).await?;

        let mut request = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "audio/wav")
            .query(&[
                ("model", self.model.as_str()),
                ("compute_type", self.compute_type.as_str()),
                ("device", self.device.as_str()),
            ])
            .body(audio);
        if let Some(language) = language_hint {
            request = request.query(&[("language", language)]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| IngestError::Engine(format!("transcription request: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IngestError::Engine(format!(
                "transcription endpoint returned {}: {}",
                status,
                body.chars().take(300).collect::<String>()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| IngestError::Engine(format!("transcription response: {e}")))?;
        Ok(parse_transcription(&body))
    }
}

fn parse_transcription(body: &Value) -> Transcription {
    let language = body
        .get("language")
        .and_then(Value::as_str)
        .map(|l| l.to_ascii_lowercase());

    let segments = match body.get("segments").and_then(Value::as_array) {
        Some(segments) => segments
            .iter()
            .filter_map(|segment| {
                let text = segment.get("text")?.as_str()?.trim().to_string();
                if text.is_empty() {
                    return None;
                }
                let start = segment.get("start").and_then(Value::as_f64).unwrap_or(0.0);
                let end = segment.get("end").and_then(Value::as_f64).unwrap_or(start);
                Some(SpeechSegment { start, end, text })
            })
            .collect(),
        None => body
            .get("text")
            .and_then(Value::as_str)
            .map(|text| text.trim())
            .filter(|text| !text.is_empty())
            .map(|text| {
                vec![SpeechSegment {
                    start: 0.0,
                    end: 0.0,
                    text: text.to_string(),
                }]
            })
            .unwrap_or_default(),
    };

    Transcription { segments, language }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transcriber
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Media transcriber: demux, engine pass, paragraph chunks.
pub struct Transcriber {
    engine: Arc<dyn SpeechToText>,
    language_hint: Option<String>,
}

impl Transcriber {
    pub fn new(engine: Arc<dyn SpeechToText>, language_hint: Option<String>) -> Self {
        Self {
            engine,
            language_hint: language_hint.and_then(|hint| resolve_language_hint(&hint)),
        }
    }

    /// Transcribe one media item into paragraph-level chunks.
    pub async fn transcribe_media(
        &self,
        path: &Path,
        uri: Option<&str>,
        mime: Option<&str>,
        source: SourceKind,
    ) -> Result<Vec<DocChunk>, IngestError> {
        let wav = demux_to_wav(path).await?;

        tracing::info!(
            path = %path.display(),
            engine = self.engine.name(),
            language_hint = self.language_hint.as_deref().unwrap_or("auto"),
            "transcription started"
        );

        let transcription = self
            .engine
            .transcribe(wav.path(), self.language_hint.as_deref())
            .await?;

        tracing::info!(
            path = %path.display(),
            segments = transcription.segments.len(),
            language = transcription.language.as_deref().unwrap_or("unknown"),
            "transcription complete"
        );

        let paragraphs = segments_to_paragraphs(&transcription.segments);
        Ok(paragraphs_to_chunks(
            &paragraphs,
            transcription.language.as_deref(),
            self.engine.name(),
            uri,
            mime,
            source,
        ))
    }

    pub fn release(&self) {
        self.engine.release();
    }
}

/// Extract the audio track as mono 16 kHz PCM WAV.
async fn demux_to_wav(path: &Path) -> Result<tempfile::NamedTempFile, IngestError> {
    let wav = tempfile::Builder::new()
        .suffix(".wav")
        .tempfile()
        .map_err(IngestError::Io)?;

    let output = tokio::process::Command::new("ffmpeg")
        .arg("-i")
        .arg(path)
        .args(["-f", "wav", "-ac", "1", "-ar", "16000", "-y"])
        .arg(wav.path())
        .output()
        .await
        .map_err(|e| IngestError::Engine(format!("ffmpeg failed to start: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(IngestError::Engine(format!(
            "ffmpeg exited with {}: {}",
            output.status,
            stderr.lines().last().unwrap_or_default()
        )));
    }
    Ok(wav)
}

/// A paragraph: text plus its time range.
type Paragraph = (String, f64, f64);

/// Group segments into paragraphs at terminal punctuation or newlines.
fn segments_to_paragraphs(segments: &[SpeechSegment]) -> Vec<Paragraph> {
    let mut paragraphs = Vec::new();
    let mut buffer: Vec<&str> = Vec::new();
    let mut start: Option<f64> = None;
    let mut end: f64 = 0.0;

    for segment in segments {
        let text = segment.text.trim();
        if text.is_empty() {
            continue;
        }
        if start.is_none() {
            start = Some(segment.start);
        }
        end = segment.end;
        buffer.push(text);

        if ends_paragraph(text) {
            let paragraph = buffer.join(" ").trim().to_string();
            if !paragraph.is_empty() {
                paragraphs.push((paragraph, start.unwrap_or(0.0), end));
            }
            buffer.clear();
            start = None;
        }
    }

    if !buffer.is_empty() {
        if let Some(start) = start {
            let paragraph = buffer.join(" ").trim().to_string();
            if !paragraph.is_empty() {
                paragraphs.push((paragraph, start, end.max(start)));
            }
        }
    }

    paragraphs
}

fn ends_paragraph(text: &str) -> bool {
    let trimmed = text.trim_end();
    trimmed.ends_with(['.', '?', '!', '…']) || trimmed.contains('\n')
}

/// Build one chunk per paragraph, appending the timestamp range to the
/// text the way transcripts are displayed.
fn paragraphs_to_chunks(
    paragraphs: &[Paragraph],
    language: Option<&str>,
    engine_name: &str,
    uri: Option<&str>,
    mime: Option<&str>,
    source: SourceKind,
) -> Vec<DocChunk> {
    paragraphs
        .iter()
        .enumerate()
        .map(|(idx, (text, start, end))| {
            let chunk_id = idx as u32 + 1;
            let start_ts = format_seconds_to_timestamp(*start);
            let end_ts = format_seconds_to_timestamp(*end);
            let chunk_text = format!("{text}\n\n[{start_ts} - {end_ts}]");

            let metadata = json!({
                "paragraph_index": chunk_id,
                "start": start,
                "end": end,
                "language": language,
                "transcription_engine": engine_name,
                "transcript_type": "original",
                "timestamp_range": { "start": start_ts, "end": end_ts },
            });
            let metadata = match metadata {
                Value::Object(map) => map,
                _ => unreachable!(),
            };

            DocChunk::new(chunk_id, chunk_text, uri, mime, source, metadata)
        })
        .collect()
}

/// Normalize a configured language hint; "auto"-style values mean none.
fn resolve_language_hint(language: &str) -> Option<String> {
    let normalized = language.trim().to_ascii_lowercase();
    if matches!(normalized.as_str(), "" | "auto" | "detect" | "automatic") {
        return None;
    }
    let first = normalized.split(',').next().unwrap_or("").trim().to_string();
    if first.is_empty() {
        None
    } else {
        Some(first)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
