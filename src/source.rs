use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use fast_image_resize::images::Image as FastImage;
use fast_image_resize::{PixelType, ResizeOptions, Resizer};
use thiserror::Error;
use tracing::debug;

/// Subdirectory holding precomputed thumbnails, named after the data file
/// stem with a png extension.
pub const THUMBNAIL_DIR: &str = "thumbs";

#[derive(Debug, Error)]
pub enum PreviewError {
    #[error("no data present")]
    Missing,
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("unsupported data: {0}")]
    Unsupported(String),
}

/// Resolved reference to one data item, handed to workers by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DataHandle {
    pub path: PathBuf,
}

impl DataHandle {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

/// A rendered preview: pixels sized to the requested preview edge, plus the
/// dimensions of whatever source image was decoded to produce them.
pub struct Artifact {
    pub image: egui::ColorImage,
    pub original: (u32, u32),
}

impl std::fmt::Debug for Artifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Artifact")
            .field("size", &[self.image.width(), self.image.height()])
            .field("original", &self.original)
            .finish()
    }
}

/// Produces a renderable preview for a data handle. Loads are slow (file
/// I/O, decoding) and must only ever run on a worker thread.
pub trait PreviewSource: Send + Sync {
    fn load(&self, handle: &DataHandle, preview_size: u32) -> Result<Artifact, PreviewError>;
}

/// File-backed source: prefers a stored thumbnail close to the requested
/// pixel size, falls back to decoding the full image, and downscales the
/// result with SIMD resizing.
pub struct FilePreviewSource;

impl PreviewSource for FilePreviewSource {
    fn load(&self, handle: &DataHandle, preview_size: u32) -> Result<Artifact, PreviewError> {
        if preview_size == 0 {
            return Err(PreviewError::Unsupported("zero preview size".to_string()));
        }

        if let Some(artifact) = try_stored_thumbnail(&handle.path, preview_size) {
            return Ok(artifact);
        }

        let bytes = fs::read(&handle.path)?;
        let image = decode_bytes(&bytes, &handle.path)?;
        let original = (image.width() as u32, image.height() as u32);
        let image = resize_to_fit(image, preview_size as usize)?;
        Ok(Artifact { image, original })
    }
}

fn decode_bytes(bytes: &[u8], path: &Path) -> Result<egui::ColorImage, PreviewError> {
    // Guess the format from magic bytes; fall back to the file extension,
    // which some formats (PCX, TGA) need.
    let mut reader = image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .unwrap_or_else(|_| image::ImageReader::new(Cursor::new(bytes)));
    if reader.format().is_none() {
        if let Ok(fmt) = image::ImageFormat::from_path(path) {
            reader.set_format(fmt);
        }
    }

    let decoded = reader.decode()?;
    let dims = (decoded.width() as usize, decoded.height() as usize);
    let rgba = decoded.to_rgba8();
    let pixels = rgba.as_flat_samples();
    Ok(egui::ColorImage::from_rgba_unmultiplied([dims.0, dims.1], pixels.as_slice()))
}

/// Looks for `thumbs/<stem>.png` next to the data file and uses it when it
/// is at least as large as the requested preview edge. Anything that fails
/// along the way falls back to the full decode.
fn try_stored_thumbnail(path: &Path, preview_size: u32) -> Option<Artifact> {
    let thumb_path = stored_thumbnail_path(path)?;
    let bytes = fs::read(&thumb_path).ok()?;
    let image = decode_bytes(&bytes, &thumb_path).ok()?;
    let dims = (image.width() as u32, image.height() as u32);
    if dims.0.max(dims.1) < preview_size {
        return None;
    }
    debug!(path = %thumb_path.display(), "using stored thumbnail");
    let image = resize_to_fit(image, preview_size as usize).ok()?;
    Some(Artifact { image, original: dims })
}

pub fn stored_thumbnail_path(path: &Path) -> Option<PathBuf> {
    let dir = path.parent()?;
    let stem = path.file_stem()?;
    let mut name = stem.to_os_string();
    name.push(".png");
    Some(dir.join(THUMBNAIL_DIR).join(name))
}

/// Downscales to fit inside `max_side` x `max_side`, preserving the aspect
/// ratio. Images already small enough pass through untouched.
pub fn resize_to_fit(image: egui::ColorImage, max_side: usize) -> Result<egui::ColorImage, PreviewError> {
    let (w, h) = (image.width(), image.height());
    if w == 0 || h == 0 {
        return Err(PreviewError::Unsupported("empty image".to_string()));
    }
    if w <= max_side && h <= max_side {
        return Ok(image);
    }

    let scale = max_side as f32 / w.max(h) as f32;
    let new_w = ((w as f32 * scale).round() as usize).max(1);
    let new_h = ((h as f32 * scale).round() as usize).max(1);

    let src = FastImage::from_vec_u8(w as u32, h as u32, image.as_raw().to_vec(), PixelType::U8x4)
        .map_err(|e| PreviewError::Unsupported(e.to_string()))?;
    let mut dst = FastImage::new(new_w as u32, new_h as u32, PixelType::U8x4);
    let mut resizer = Resizer::new();
    resizer
        .resize(&src, &mut dst, &ResizeOptions::default())
        .map_err(|e| PreviewError::Unsupported(e.to_string()))?;

    Ok(egui::ColorImage::from_rgba_unmultiplied([new_w, new_h], dst.buffer()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_png(path: &Path, w: u32, h: u32, rgba: [u8; 4]) {
        let img = image::RgbaImage::from_pixel(w, h, image::Rgba(rgba));
        img.save(path).expect("failed to write test png");
    }

    #[test]
    fn full_decode_is_downscaled_to_preview_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("row0.png");
        write_png(&path, 200, 100, [10, 20, 30, 255]);

        let artifact = FilePreviewSource
            .load(&DataHandle::new(&path), 64)
            .expect("load failed");
        assert_eq!(artifact.original, (200, 100));
        assert_eq!(artifact.image.width(), 64);
        assert_eq!(artifact.image.height(), 32);
    }

    #[test]
    fn small_images_are_not_upscaled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.png");
        write_png(&path, 16, 12, [200, 0, 0, 255]);

        let artifact = FilePreviewSource
            .load(&DataHandle::new(&path), 64)
            .expect("load failed");
        assert_eq!(artifact.image.width(), 16);
        assert_eq!(artifact.image.height(), 12);
    }

    #[test]
    fn missing_file_reports_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.png");
        let err = FilePreviewSource
            .load(&DataHandle::new(&path), 64)
            .unwrap_err();
        assert!(matches!(err, PreviewError::Io(_)), "got {:?}", err);
    }

    #[test]
    fn garbage_bytes_report_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.png");
        fs::write(&path, b"not an image at all").unwrap();

        let err = FilePreviewSource
            .load(&DataHandle::new(&path), 64)
            .unwrap_err();
        assert!(matches!(err, PreviewError::Decode(_)), "got {:?}", err);
    }

    #[test]
    fn stored_thumbnail_is_preferred_when_large_enough() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cells.png");
        write_png(&path, 400, 400, [0, 0, 255, 255]);

        let thumbs = dir.path().join(THUMBNAIL_DIR);
        fs::create_dir(&thumbs).unwrap();
        write_png(&thumbs.join("cells.png"), 128, 128, [0, 255, 0, 255]);

        let artifact = FilePreviewSource
            .load(&DataHandle::new(&path), 64)
            .expect("load failed");
        // The thumbnail was used, so the decoded source is 128px, not 400px.
        assert_eq!(artifact.original, (128, 128));
        assert_eq!(artifact.image.width(), 64);
    }

    #[test]
    fn undersized_thumbnail_falls_back_to_full_decode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cells.png");
        write_png(&path, 400, 400, [0, 0, 255, 255]);

        let thumbs = dir.path().join(THUMBNAIL_DIR);
        fs::create_dir(&thumbs).unwrap();
        write_png(&thumbs.join("cells.png"), 16, 16, [0, 255, 0, 255]);

        let artifact = FilePreviewSource
            .load(&DataHandle::new(&path), 64)
            .expect("load failed");
        assert_eq!(artifact.original, (400, 400));
        assert_eq!(artifact.image.width(), 64);
    }
}
