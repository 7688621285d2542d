//! OCR extraction for images and scanned PDFs.
//!
//! The engine runs over several preprocessed variants of each image
//! (grayscale, contrast-stretched, sharpened, thresholded) crossed with
//! several engine configurations; the first non-empty reading wins.

use std::io::Cursor;
use std::path::Path;

use async_trait::async_trait;
use image::DynamicImage;
use serde_json::json;

use crate::models::{DocChunk, IngestError, SourceKind};

/// Engine configurations tried in order for every image variant.
const OCR_CONFIGS: [&str; 3] = ["--oem 3 --psm 6", "--oem 3 --psm 4", "--oem 1 --psm 6"];

/// Minimum edge length; smaller images are upscaled before OCR.
const MIN_EDGE: u32 = 800;

/// PDF page render resolution for scanned-document OCR.
const PDF_RENDER_DPI: &str = "300";

/// OCR engine seam: PNG bytes in, recognized text out.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    async fn image_to_text(&self, png: &[u8], config: &str) -> Result<String, IngestError>;

    fn name(&self) -> &'static str {
        "ocr"
    }
}

/// Decide whether OCR should be attempted for the given document.
///
/// Images always OCR. PDFs OCR only when the structured pass produced
/// no textual chunks, which indicates a scanned document.
pub fn should_run_ocr(mime: Option<&str>, text_chunks: &[DocChunk]) -> bool {
    let mime = mime.unwrap_or_default().to_ascii_lowercase();
    if mime.starts_with("image/") {
        return true;
    }
    if mime == "application/pdf" {
        return !text_chunks.iter().any(|chunk| !chunk.text.trim().is_empty());
    }
    false
}

/// Run OCR for one ingestion item (image file or scanned PDF).
pub async fn extract(
    engine: &dyn OcrEngine,
    path: &Path,
    uri: Option<&str>,
    mime: Option<&str>,
    source: SourceKind,
) -> Result<Vec<DocChunk>, IngestError> {
    let lowered = mime.unwrap_or_default().to_ascii_lowercase();
    if lowered.starts_with("image/") {
        extract_image(engine, path, uri, mime, source).await
    } else if lowered == "application/pdf" {
        extract_scanned_pdf(engine, path, uri, mime, source).await
    } else {
        Ok(Vec::new())
    }
}

async fn extract_image(
    engine: &dyn OcrEngine,
    path: &Path,
    uri: Option<&str>,
    mime: Option<&str>,
    source: SourceKind,
) -> Result<Vec<DocChunk>, IngestError> {
    let bytes = tokio::fs::read(path).await?;
    let image = decode_image(bytes).await?;

    let text = run_ocr_image(engine, &image).await?;
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let metadata = json!({ "ocr_used": true, "ocr_engine": engine.name() });
    Ok(vec![DocChunk::new(
        1,
        text.trim(),
        uri,
        mime,
        source,
        into_map(metadata),
    )])
}

/// Render each PDF page to an image with `pdftoppm` and OCR it.
async fn extract_scanned_pdf(
    engine: &dyn OcrEngine,
    path: &Path,
    uri: Option<&str>,
    mime: Option<&str>,
    source: SourceKind,
) -> Result<Vec<DocChunk>, IngestError> {
    let render_dir = tempfile::tempdir()?;
    let prefix = render_dir.path().join("page");

    let output = tokio::process::Command::new("pdftoppm")
        .args(["-r", PDF_RENDER_DPI, "-png"])
        .arg(path)
        .arg(&prefix)
        .output()
        .await
        .map_err(|e| IngestError::Engine(format!("pdftoppm failed to start: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(IngestError::Engine(format!(
            "pdftoppm exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let mut pages: Vec<std::path::PathBuf> = std::fs::read_dir(render_dir.path())?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("png"))
        .collect();
    pages.sort();

    let mut chunks = Vec::new();
    for (idx, page_path) in pages.iter().enumerate() {
        let page_number = idx + 1;
        let bytes = tokio::fs::read(page_path).await?;
        let image = match decode_image(bytes).await {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!(page = page_number, error = %e, "failed to decode rendered page");
                continue;
            }
        };
        let text = run_ocr_image(engine, &image).await?;
        if text.trim().is_empty() {
            continue;
        }
        let metadata = json!({
            "page": page_number,
            "ocr_used": true,
            "ocr_engine": engine.name(),
        });
        chunks.push(DocChunk::new(
            page_number as u32,
            text.trim(),
            uri,
            mime,
            source,
            into_map(metadata),
        ));
    }

    Ok(chunks)
}

async fn decode_image(bytes: Vec<u8>) -> Result<DynamicImage, IngestError> {
    tokio::task::spawn_blocking(move || {
        image::load_from_memory(&bytes).map_err(|e| IngestError::Parse(format!("image decode: {e}")))
    })
    .await
    .map_err(|e| IngestError::Parse(format!("image decode task failed: {e}")))?
}

/// OCR one image: try every variant × config, first non-empty wins.
pub async fn run_ocr_image(
    engine: &dyn OcrEngine,
    image: &DynamicImage,
) -> Result<String, IngestError> {
    let variants = {
        let image = image.clone();
        tokio::task::spawn_blocking(move || prepare_image_variants(&image))
            .await
            .map_err(|e| IngestError::Parse(format!("image preprocessing failed: {e}")))?
    };

    for variant in &variants {
        let png = encode_png(variant)?;
        for config in OCR_CONFIGS {
            let candidate = match engine.image_to_text(&png, config).await {
                Ok(candidate) => candidate,
                Err(e) => {
                    tracing::warn!(config, error = %e, "OCR pass failed");
                    continue;
                }
            };
            let candidate = candidate.trim();
            if !candidate.is_empty() {
                return Ok(candidate.to_string());
            }
        }
    }
    Ok(String::new())
}

/// Generate OCR-friendly variants of the image.
pub fn prepare_image_variants(image: &DynamicImage) -> Vec<DynamicImage> {
    let mut working = image.clone();

    let (width, height) = (working.width(), working.height());
    if width.min(height) < MIN_EDGE && width.min(height) > 0 {
        let scale = MIN_EDGE as f32 / width.min(height) as f32;
        working = working.resize(
            (width as f32 * scale) as u32,
            (height as f32 * scale) as u32,
            image::imageops::FilterType::CatmullRom,
        );
    }

    let grayscale = DynamicImage::ImageLuma8(working.to_luma8());
    let stretched = autocontrast(&grayscale);
    let sharpened = stretched.unsharpen(1.6, 2);
    let thresholded = threshold(&stretched, 160);

    vec![grayscale, stretched, sharpened, thresholded]
}

/// Histogram stretch: map the observed min..max range onto 0..255.
fn autocontrast(image: &DynamicImage) -> DynamicImage {
    let luma = image.to_luma8();
    let (mut min, mut max) = (u8::MAX, u8::MIN);
    for pixel in luma.pixels() {
        min = min.min(pixel.0[0]);
        max = max.max(pixel.0[0]);
    }
    if max <= min {
        return DynamicImage::ImageLuma8(luma);
    }
    let range = (max - min) as f32;
    let stretched = image::ImageBuffer::from_fn(luma.width(), luma.height(), |x, y| {
        let value = luma.get_pixel(x, y).0[0];
        let scaled = ((value - min) as f32 / range * 255.0).round() as u8;
        image::Luma([scaled])
    });
    DynamicImage::ImageLuma8(stretched)
}

fn threshold(image: &DynamicImage, cutoff: u8) -> DynamicImage {
    let luma = image.to_luma8();
    let binary = image::ImageBuffer::from_fn(luma.width(), luma.height(), |x, y| {
        let value = luma.get_pixel(x, y).0[0];
        image::Luma([if value > cutoff { 255u8 } else { 0u8 }])
    });
    DynamicImage::ImageLuma8(binary)
}

fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, IngestError> {
    let mut buffer = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buffer), image::ImageFormat::Png)
        .map_err(|e| IngestError::Parse(format!("png encode: {e}")))?;
    Ok(buffer)
}

fn into_map(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
    match value {
        serde_json::Value::Object(map) => map,
        _ => serde_json::Map::new(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tesseract CLI engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// OCR through the `tesseract` CLI (CPU-only, no daemon).
pub struct TesseractCli;

#[async_trait]
impl OcrEngine for TesseractCli {
    async fn image_to_text(&self, png: &[u8], config: &str) -> Result<String, IngestError> {
        let input = tempfile::Builder::new()
            .suffix(".png")
            .tempfile()
            .map_err(IngestError::Io)?;
        tokio::fs::write(input.path(), png).await?;

        let mut command = tokio::process::Command::new("tesseract");
        command.arg(input.path()).arg("stdout");
        for token in config.split_whitespace() {
            command.arg(token);
        }

        let output = command
            .output()
            .await
            .map_err(|e| IngestError::Engine(format!("tesseract failed to start: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(IngestError::Engine(format!(
                "tesseract exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn name(&self) -> &'static str {
        "tesseract"
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn text_chunk(text: &str) -> DocChunk {
        DocChunk::new(1, text, None, None, SourceKind::File, Map::new())
    }

    #[test]
    fn ocr_gating() {
        assert!(should_run_ocr(Some("image/png"), &[]));
        // PDF with text: skip OCR.
        assert!(!should_run_ocr(
            Some("application/pdf"),
            &[text_chunk("extracted text")]
        ));
        // PDF with only empty chunks: scanned document.
        assert!(should_run_ocr(Some("application/pdf"), &[text_chunk("  ")]));
        assert!(should_run_ocr(Some("application/pdf"), &[]));
        assert!(!should_run_ocr(Some("text/plain"), &[]));
    }

    #[test]
    fn variants_cover_preprocessing_steps() {
        let image = DynamicImage::new_rgb8(1000, 1000);
        let variants = prepare_image_variants(&image);
        assert_eq!(variants.len(), 4);
        for variant in &variants {
            assert_eq!(variant.width(), 1000);
        }
    }

    #[test]
    fn small_images_are_upscaled() {
        let image = DynamicImage::new_rgb8(100, 200);
        let variants = prepare_image_variants(&image);
        assert!(variants[0].width() >= MIN_EDGE || variants[0].height() >= MIN_EDGE);
    }

    #[test]
    fn autocontrast_stretches_range() {
        let mut buffer = image::ImageBuffer::new(2, 1);
        buffer.put_pixel(0, 0, image::Luma([100u8]));
        buffer.put_pixel(1, 0, image::Luma([150u8]));
        let stretched = autocontrast(&DynamicImage::ImageLuma8(buffer)).to_luma8();
        assert_eq!(stretched.get_pixel(0, 0).0[0], 0);
        assert_eq!(stretched.get_pixel(1, 0).0[0], 255);
    }

    /// Engine that fails until the nth call, then answers.
    struct FlakyEngine {
        calls: AtomicUsize,
        succeed_on: usize,
    }

    #[async_trait]
    impl OcrEngine for FlakyEngine {
        async fn image_to_text(&self, _png: &[u8], _config: &str) -> Result<String, IngestError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call < self.succeed_on {
                Ok(String::new())
            } else {
                Ok("recognized text".into())
            }
        }
    }

    #[tokio::test]
    async fn first_non_empty_reading_wins() {
        let engine = FlakyEngine {
            calls: AtomicUsize::new(0),
            succeed_on: 5,
        };
        let image = DynamicImage::new_rgb8(820, 820);
        let text = run_ocr_image(&engine, &image).await.unwrap();
        assert_eq!(text, "recognized text");
        // Stopped as soon as a reading came back.
        assert_eq!(engine.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn all_empty_readings_yield_empty() {
        struct SilentEngine;
        #[async_trait]
        impl OcrEngine for SilentEngine {
            async fn image_to_text(&self, _png: &[u8], _cfg: &str) -> Result<String, IngestError> {
                Ok("   ".into())
            }
        }
        let image = DynamicImage::new_rgb8(820, 820);
        let text = run_ocr_image(&SilentEngine, &image).await.unwrap();
        assert!(text.is_empty());
    }
}
