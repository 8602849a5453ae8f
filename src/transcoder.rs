//! Preview generation for uploaded media.
//!
//! Images are downscaled to fit a square bounding box and re-encoded as JPEG,
//! videos contribute their first frame. Previews are inline data URLs.

use std::fmt;
use std::io::Cursor;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::metadata::Orientation;
use image::{DynamicImage, ImageDecoder, ImageReader};
use tokio::process::Command;
use tracing::{debug, warn};

pub const DEFAULT_MAX_DIMENSION: u32 = 720;
const JPEG_QUALITY: u8 = 80;
const FRAME_TIMEOUT: Duration = Duration::from_secs(30);

const EXTENSION_TO_MIME: [(&str, &str); 16] = [
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("png", "image/png"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
    ("bmp", "image/bmp"),
    ("tif", "image/tiff"),
    ("tiff", "image/tiff"),
    ("heic", "image/heic"),
    ("heif", "image/heif"),
    ("mp4", "video/mp4"),
    ("m4v", "video/x-m4v"),
    ("mov", "video/quicktime"),
    ("webm", "video/webm"),
    ("mkv", "video/x-matroska"),
    ("avi", "video/x-msvideo"),
];

/// A file exactly as the guest picked it.
#[derive(Debug, Clone)]
pub struct RawFile {
    pub filename: String,
    pub content_type: String,
    pub bytes: Bytes,
}

impl RawFile {
    #[must_use]
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    #[must_use]
    pub fn kind(&self) -> MediaKind {
        MediaKind::of(&self.content_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
    Other,
}

impl MediaKind {
    #[must_use]
    pub fn of(content_type: &str) -> Self {
        if content_type.starts_with("image/") {
            MediaKind::Image
        } else if content_type.starts_with("video/") {
            MediaKind::Video
        } else {
            MediaKind::Other
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    Frame(String),
    Image(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Frame(msg) => write!(f, "could not extract video frame: {msg}"),
            DecodeError::Image(msg) => write!(f, "could not process image: {msg}"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Source of the first frame of a video, as encoded image bytes.
#[async_trait]
pub trait FrameExtractor: Send + Sync {
    async fn first_frame(&self, file: &RawFile) -> Result<Bytes, DecodeError>;
}

/// Grabs the frame at timestamp zero with an external `ffmpeg` binary.
pub struct FfmpegFrameExtractor {
    binary: String,
}

impl FfmpegFrameExtractor {
    #[must_use]
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl FrameExtractor for FfmpegFrameExtractor {
    async fn first_frame(&self, file: &RawFile) -> Result<Bytes, DecodeError> {
        // Containers like mp4 keep their index at the end, so ffmpeg needs a seekable input.
        let input = tempfile::Builder::new()
            .prefix("frame-")
            .tempfile()
            .map_err(|e| DecodeError::Frame(format!("tempfile: {e}")))?;
        tokio::fs::write(input.path(), &file.bytes)
            .await
            .map_err(|e| DecodeError::Frame(format!("tempfile write: {e}")))?;

        let child = Command::new(&self.binary)
            .arg("-hide_banner")
            .args(["-loglevel", "error", "-ss", "0", "-i"])
            .arg(input.path())
            .args(["-frames:v", "1", "-f", "image2pipe", "-vcodec", "mjpeg", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DecodeError::Frame(format!("spawn {}: {e}", self.binary)))?;

        let output = tokio::time::timeout(FRAME_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| DecodeError::Frame("ffmpeg timed out".to_string()))?
            .map_err(|e| DecodeError::Frame(e.to_string()))?;

        if !output.status.success() || output.stdout.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DecodeError::Frame(format!(
                "ffmpeg exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        Ok(Bytes::from(output.stdout))
    }
}

pub struct Transcoder {
    max_dimension: u32,
    frames: Arc<dyn FrameExtractor>,
}

impl Transcoder {
    pub fn new(max_dimension: u32, frames: Arc<dyn FrameExtractor>) -> Self {
        Self {
            max_dimension: max_dimension.max(1),
            frames,
        }
    }

    /// Produce the inline preview for `file`.
    ///
    /// Images never fail: anything the decoder cannot handle is inlined as-is.
    /// Videos fail with [`DecodeError`] when no frame can be extracted.
    /// Everything else gets an empty preview.
    pub async fn transcode(&self, file: &RawFile) -> Result<String, DecodeError> {
        match file.kind() {
            MediaKind::Image => Ok(self
                .image_preview(file.bytes.clone(), file.content_type.clone(), &file.filename)
                .await),
            MediaKind::Video => {
                let frame = self.frames.first_frame(file).await?;
                let cap = self.max_dimension;
                run_blocking(move || bounded_jpeg(&frame, cap, true)).await
            }
            MediaKind::Other => Ok(String::new()),
        }
    }

    async fn image_preview(&self, bytes: Bytes, content_type: String, filename: &str) -> String {
        let cap = self.max_dimension;
        let original = bytes.clone();
        let mime = content_type.clone();
        match run_blocking(move || downscale_image(&bytes, &content_type, cap)).await {
            Ok(preview) => preview,
            Err(err) => {
                debug!(filename, error = %err, "Falling back to original bytes for preview");
                sentry::add_breadcrumb(sentry::Breadcrumb {
                    category: Some("transcoder".into()),
                    message: Some(format!("image preview fallback for {filename}: {err}")),
                    level: sentry::Level::Info,
                    ..Default::default()
                });
                data_url(&mime, &original)
            }
        }
    }
}

async fn run_blocking<F>(work: F) -> Result<String, DecodeError>
where
    F: FnOnce() -> Result<String, DecodeError> + Send + 'static,
{
    tokio::task::spawn_blocking(work).await.unwrap_or_else(|err| {
        warn!(error = %err, "Preview worker panicked");
        Err(DecodeError::Image(err.to_string()))
    })
}

/// Identity for images inside the box, JPEG re-encode otherwise.
fn downscale_image(bytes: &[u8], content_type: &str, cap: u32) -> Result<String, DecodeError> {
    let (width, height) = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| DecodeError::Image(e.to_string()))?
        .into_dimensions()
        .map_err(|e| DecodeError::Image(e.to_string()))?;

    if width <= cap && height <= cap {
        return Ok(data_url(content_type, bytes));
    }

    bounded_jpeg(bytes, cap, false)
}

/// Decode and rotate into display orientation. The re-encoded preview carries
/// no EXIF, so the rotation has to be baked into the pixels.
fn decode_upright(bytes: &[u8]) -> Result<DynamicImage, DecodeError> {
    let mut decoder = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| DecodeError::Image(e.to_string()))?
        .into_decoder()
        .map_err(|e| DecodeError::Image(e.to_string()))?;
    let orientation = decoder
        .orientation()
        .unwrap_or(Orientation::NoTransforms);
    let mut img =
        DynamicImage::from_decoder(decoder).map_err(|e| DecodeError::Image(e.to_string()))?;
    img.apply_orientation(orientation);
    Ok(img)
}

/// Decode, shrink into the box if needed and encode as JPEG.
/// With `always_encode` unset the caller has already checked that shrinking is needed.
fn bounded_jpeg(bytes: &[u8], cap: u32, always_encode: bool) -> Result<String, DecodeError> {
    let img = decode_upright(bytes)?;

    let (width, height) = scaled_dimensions(img.width(), img.height(), cap);
    if !always_encode && (width, height) == (img.width(), img.height()) {
        return Ok(data_url("image/jpeg", bytes));
    }

    let resized = if (width, height) == (img.width(), img.height()) {
        img
    } else {
        img.resize_exact(width, height, FilterType::Triangle)
    };

    let mut buf = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY);
    DynamicImage::from(resized.to_rgb8())
        .write_with_encoder(encoder)
        .map_err(|e| DecodeError::Image(e.to_string()))?;

    Ok(data_url("image/jpeg", &buf))
}

/// Fit `width` x `height` into a `cap` x `cap` box, keeping the aspect ratio.
#[must_use]
pub fn scaled_dimensions(width: u32, height: u32, cap: u32) -> (u32, u32) {
    if width <= cap && height <= cap {
        return (width, height);
    }
    let scale = |side: u32, longest: u32| {
        let scaled = (f64::from(side) * f64::from(cap) / f64::from(longest)).round() as u32;
        scaled.max(1)
    };
    if width >= height {
        (cap, scale(height, width))
    } else {
        (scale(width, height), cap)
    }
}

#[must_use]
pub fn data_url(mime: &str, bytes: &[u8]) -> String {
    format!("data:{mime};base64,{}", BASE64_STANDARD.encode(bytes))
}

/// Guess a MIME type from the file extension.
#[must_use]
pub fn content_type_for_filename(filename: &str) -> Option<&'static str> {
    let (_, ext) = filename.rsplit_once('.')?;
    let ext = ext.to_lowercase();
    EXTENSION_TO_MIME
        .iter()
        .find(|(candidate, _)| *candidate == ext)
        .map(|(_, mime)| *mime)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, RgbImage};

    struct StaticFrame(Bytes);

    #[async_trait]
    impl FrameExtractor for StaticFrame {
        async fn first_frame(&self, _file: &RawFile) -> Result<Bytes, DecodeError> {
            Ok(self.0.clone())
        }
    }

    struct NoFrame;

    #[async_trait]
    impl FrameExtractor for NoFrame {
        async fn first_frame(&self, _file: &RawFile) -> Result<Bytes, DecodeError> {
            Err(DecodeError::Frame("corrupt container".into()))
        }
    }

    fn encoded(width: u32, height: u32, format: ImageFormat) -> Bytes {
        let img = DynamicImage::ImageRgb8(RgbImage::new(width, height));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, format).unwrap();
        Bytes::from(buf.into_inner())
    }

    fn decode_preview(preview: &str) -> DynamicImage {
        let (_, b64) = preview.split_once(";base64,").unwrap();
        let bytes = BASE64_STANDARD.decode(b64).unwrap();
        image::load_from_memory(&bytes).unwrap()
    }

    fn raw(filename: &str, content_type: &str, bytes: Bytes) -> RawFile {
        RawFile {
            filename: filename.into(),
            content_type: content_type.into(),
            bytes,
        }
    }

    fn transcoder(frames: Arc<dyn FrameExtractor>) -> Transcoder {
        Transcoder::new(DEFAULT_MAX_DIMENSION, frames)
    }

    #[tokio::test]
    async fn image_within_cap_is_passed_through() {
        let bytes = encoded(100, 50, ImageFormat::Png);
        let preview = transcoder(Arc::new(NoFrame))
            .transcode(&raw("small.png", "image/png", bytes.clone()))
            .await
            .unwrap();
        assert_eq!(preview, data_url("image/png", &bytes));
    }

    #[tokio::test]
    async fn wide_image_is_scaled_to_the_cap() {
        let bytes = encoded(1000, 500, ImageFormat::Png);
        let preview = transcoder(Arc::new(NoFrame))
            .transcode(&raw("wide.png", "image/png", bytes))
            .await
            .unwrap();
        assert!(preview.starts_with("data:image/jpeg;base64,"));
        let img = decode_preview(&preview);
        assert_eq!((img.width(), img.height()), (720, 360));
    }

    #[tokio::test]
    async fn tall_image_keeps_its_aspect_ratio() {
        let bytes = encoded(300, 1200, ImageFormat::Png);
        let preview = transcoder(Arc::new(NoFrame))
            .transcode(&raw("tall.png", "image/png", bytes))
            .await
            .unwrap();
        let img = decode_preview(&preview);
        assert_eq!(img.height(), 720);
        assert_eq!(img.width(), 180);
    }

    /// Insert an EXIF APP1 segment carrying only an orientation tag right after SOI.
    fn with_exif_orientation(jpeg: &[u8], orientation: u8) -> Bytes {
        let mut exif = b"Exif\0\0".to_vec();
        // Little-endian TIFF header, IFD0 at offset 8 with a single entry.
        exif.extend_from_slice(&[0x49, 0x49, 0x2A, 0x00, 0x08, 0x00, 0x00, 0x00]);
        exif.extend_from_slice(&[0x01, 0x00]);
        exif.extend_from_slice(&[0x12, 0x01, 0x03, 0x00, 0x01, 0x00, 0x00, 0x00]);
        exif.extend_from_slice(&[orientation, 0x00, 0x00, 0x00]);
        exif.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);

        let segment_len = u16::try_from(exif.len() + 2).unwrap();
        let mut out = jpeg[..2].to_vec();
        out.extend_from_slice(&[0xFF, 0xE1]);
        out.extend_from_slice(&segment_len.to_be_bytes());
        out.extend_from_slice(&exif);
        out.extend_from_slice(&jpeg[2..]);
        Bytes::from(out)
    }

    #[tokio::test]
    async fn rotated_phone_photo_preview_is_upright() {
        // Stored landscape, displayed portrait (EXIF orientation 6).
        let stored = encoded(1440, 720, ImageFormat::Jpeg);
        let bytes = with_exif_orientation(&stored, 6);
        let preview = transcoder(Arc::new(NoFrame))
            .transcode(&raw("portrait.jpg", "image/jpeg", bytes))
            .await
            .unwrap();
        assert!(preview.starts_with("data:image/jpeg;base64,"));
        let img = decode_preview(&preview);
        assert_eq!((img.width(), img.height()), (360, 720));
    }

    #[tokio::test]
    async fn undecodable_image_falls_back_to_original_bytes() {
        let bytes = Bytes::from_static(b"<svg xmlns='http://www.w3.org/2000/svg'/>");
        let preview = transcoder(Arc::new(NoFrame))
            .transcode(&raw("logo.svg", "image/svg+xml", bytes.clone()))
            .await
            .unwrap();
        assert_eq!(preview, data_url("image/svg+xml", &bytes));
    }

    #[tokio::test]
    async fn video_preview_is_the_bounded_first_frame() {
        let frame = encoded(1920, 1080, ImageFormat::Jpeg);
        let preview = transcoder(Arc::new(StaticFrame(frame)))
            .transcode(&raw("clip.mp4", "video/mp4", Bytes::from_static(b"not inspected")))
            .await
            .unwrap();
        let img = decode_preview(&preview);
        assert_eq!((img.width(), img.height()), (720, 405));
    }

    #[tokio::test]
    async fn video_without_frame_is_a_decode_error() {
        let err = transcoder(Arc::new(NoFrame))
            .transcode(&raw("clip.mov", "video/quicktime", Bytes::from_static(b"x")))
            .await
            .unwrap_err();
        assert!(matches!(err, DecodeError::Frame(_)));
    }

    #[tokio::test]
    async fn other_types_get_an_empty_preview() {
        let preview = transcoder(Arc::new(NoFrame))
            .transcode(&raw("notes.txt", "text/plain", Bytes::from_static(b"hi")))
            .await
            .unwrap();
        assert!(preview.is_empty());
    }

    #[test]
    fn scaled_dimensions_never_collapse_to_zero() {
        assert_eq!(scaled_dimensions(10_000, 1, 720), (720, 1));
        assert_eq!(scaled_dimensions(720, 720, 720), (720, 720));
        assert_eq!(scaled_dimensions(1000, 500, 720), (720, 360));
    }

    #[test]
    fn content_type_lookup_is_case_insensitive() {
        assert_eq!(content_type_for_filename("IMG_0001.JPG"), Some("image/jpeg"));
        assert_eq!(content_type_for_filename("clip.mov"), Some("video/quicktime"));
        assert_eq!(content_type_for_filename("README"), None);
    }
}
