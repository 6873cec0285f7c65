//! Still-frame extraction for submitted face videos.
//!
//! Comparison providers only accept still images, so a video note is reduced
//! to one small JPEG before it leaves the process. Payloads that already are
//! a still image skip the decoder.

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Edge length of the square frame sent for comparison.
pub const FRAME_EDGE: u32 = 200;
const FRAME_JPEG_QUALITY: u8 = 40;
/// Zero-based index of the frame taken from a clip; the first few frames of
/// a video note are often blurred.
const FRAME_INDEX: u32 = 6;

/// Turns an uploaded clip into a single still image.
#[async_trait]
pub trait FrameExtractor: Send + Sync {
    /// A JPEG still taken from `media`, or `None` when nothing in the
    /// payload decodes to a frame.
    async fn extract(&self, media: &[u8]) -> Result<Option<Vec<u8>>, FrameError>;
}

/// Frame extraction through an external `ffmpeg` binary.
pub struct FfmpegFrameExtractor {
    binary: String,
    timeout: Duration,
}

impl FfmpegFrameExtractor {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    /// Decode frame `FRAME_INDEX` of the clip at `path` as PNG on stdout.
    async fn decode_clip(&self, path: &std::path::Path) -> Result<Option<Vec<u8>>, FrameError> {
        let select = format!("select=gte(n\\,{FRAME_INDEX})");
        let child = Command::new(&self.binary)
            .args(["-hide_banner", "-loglevel", "error", "-i"])
            .arg(path)
            .args(["-vf", select.as_str(), "-frames:v", "1", "-f", "image2pipe", "-vcodec", "png", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(FrameError::Spawn)?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| FrameError::Timeout(self.timeout))?
            .map_err(FrameError::Io)?;

        if !output.status.success() || output.stdout.is_empty() {
            tracing::debug!(
                status = ?output.status.code(),
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "No frame decoded from clip"
            );
            return Ok(None);
        }
        Ok(Some(output.stdout))
    }
}

#[async_trait]
impl FrameExtractor for FfmpegFrameExtractor {
    async fn extract(&self, media: &[u8]) -> Result<Option<Vec<u8>>, FrameError> {
        if media.is_empty() {
            return Ok(None);
        }
        if image::guess_format(media).is_ok() {
            return Ok(normalize_still(media));
        }

        let clip = tempfile::Builder::new()
            .prefix("face-clip-")
            .suffix(".mp4")
            .tempfile()
            .map_err(FrameError::Io)?;
        tokio::fs::write(clip.path(), media)
            .await
            .map_err(FrameError::Io)?;

        let decoded = self.decode_clip(clip.path()).await?;
        Ok(decoded.and_then(|png| normalize_still(&png)))
    }
}

/// Resize a decodable still to `FRAME_EDGE` square and encode it as JPEG.
pub fn normalize_still(bytes: &[u8]) -> Option<Vec<u8>> {
    let img = image::load_from_memory(bytes).ok()?;
    let small = img.resize_exact(FRAME_EDGE, FRAME_EDGE, FilterType::Triangle);
    let rgb = DynamicImage::ImageRgb8(small.to_rgb8());
    let mut out = Vec::new();
    rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut out, FRAME_JPEG_QUALITY))
        .ok()?;
    Some(out)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Failed to start frame decoder: {0}")]
    Spawn(std::io::Error),

    #[error("Frame decoder I/O failed: {0}")]
    Io(std::io::Error),

    #[error("Frame decoder did not finish within {0:?}")]
    Timeout(Duration),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        });
        let mut out = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
            .unwrap();
        out
    }

    #[test]
    fn test_still_is_normalized_to_small_jpeg() {
        let jpeg = normalize_still(&png(640, 480)).unwrap();
        assert_eq!(image::guess_format(&jpeg).unwrap(), image::ImageFormat::Jpeg);
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (FRAME_EDGE, FRAME_EDGE));
    }

    #[test]
    fn test_garbage_is_not_a_still() {
        assert!(normalize_still(b"definitely not an image").is_none());
    }

    #[tokio::test]
    async fn test_still_upload_skips_decoder() {
        // A binary that cannot exist proves the decoder is never started.
        let frames = FfmpegFrameExtractor::new("/nonexistent/ffmpeg", Duration::from_secs(1));
        let out = frames.extract(&png(64, 64)).await.unwrap().unwrap();
        assert_eq!(image::guess_format(&out).unwrap(), image::ImageFormat::Jpeg);
    }

    #[tokio::test]
    async fn test_empty_payload_has_no_frame() {
        let frames = FfmpegFrameExtractor::new("/nonexistent/ffmpeg", Duration::from_secs(1));
        assert!(frames.extract(&[]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_decoder_is_an_error() {
        let frames = FfmpegFrameExtractor::new("/nonexistent/ffmpeg", Duration::from_secs(1));
        let err = frames.extract(&[0u8; 512]).await.unwrap_err();
        assert!(matches!(err, FrameError::Spawn(_)));
    }
}
