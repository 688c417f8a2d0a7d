//! Stateless image transforms: disk I/O, resizing, blending, and the
//! lightweight conditioning maps used in place of dedicated preprocessing
//! models.

use std::fs;
use std::io::BufWriter;
use std::path::Path;

use anyhow::{bail, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, GrayImage, ImageFormat, Luma, RgbImage};
use serde::{Deserialize, Serialize};

pub const JPEG_QUALITY: u8 = 95;
pub const EDGE_THRESHOLD: u16 = 128;

/// Load an image from disk, normalized to 8-bit RGB.
pub fn load_image(path: impl AsRef<Path>) -> Result<DynamicImage> {
    let path = path.as_ref();
    let image = image::open(path)
        .with_context(|| format!("failed to load image {}", path.display()))?;
    Ok(DynamicImage::ImageRgb8(image.to_rgb8()))
}

/// Save an image, creating parent directories. `.jpg`/`.jpeg` extensions
/// write JPEG at a fixed quality; everything else writes PNG.
pub fn save_image(image: &DynamicImage, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => {
            let file = fs::File::create(path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            let mut encoder = JpegEncoder::new_with_quality(BufWriter::new(file), JPEG_QUALITY);
            encoder
                .encode_image(&image.to_rgb8())
                .with_context(|| format!("failed to encode {}", path.display()))?;
        }
        _ => {
            image
                .save_with_format(path, ImageFormat::Png)
                .with_context(|| format!("failed to write {}", path.display()))?;
        }
    }
    Ok(())
}

/// Resize to the target size, either fitting within it (aspect preserved)
/// or stretching to it exactly.
pub fn resize(image: &DynamicImage, width: u32, height: u32, keep_aspect: bool) -> DynamicImage {
    if keep_aspect {
        image.resize(width, height, FilterType::Lanczos3)
    } else {
        image.resize_exact(width, height, FilterType::Lanczos3)
    }
}

/// Alpha-blend `overlay` onto `base`. Both images must share dimensions.
pub fn blend(base: &DynamicImage, overlay: &DynamicImage, alpha: f32) -> Result<DynamicImage> {
    if base.dimensions() != overlay.dimensions() {
        bail!(
            "cannot blend images of different sizes ({:?} vs {:?})",
            base.dimensions(),
            overlay.dimensions()
        );
    }
    let alpha = alpha.clamp(0.0, 1.0);
    let base = base.to_rgb8();
    let overlay = overlay.to_rgb8();
    let mut out = RgbImage::new(base.width(), base.height());
    for (dst, (a, b)) in out
        .pixels_mut()
        .zip(base.pixels().zip(overlay.pixels()))
    {
        for channel in 0..3 {
            let mixed = a.0[channel] as f32 * (1.0 - alpha) + b.0[channel] as f32 * alpha;
            dst.0[channel] = mixed.round() as u8;
        }
    }
    Ok(DynamicImage::ImageRgb8(out))
}

/// Binary Sobel edge map, the stand-in for a canny conditioning model.
pub fn sobel_edges(image: &DynamicImage, threshold: u16) -> DynamicImage {
    let gray = image.to_luma8();
    let (width, height) = gray.dimensions();
    let mut edges = GrayImage::new(width, height);
    for y in 1..height.saturating_sub(1) {
        for x in 1..width.saturating_sub(1) {
            let sample = |dx: i32, dy: i32| -> i32 {
                let px = (x as i32 + dx) as u32;
                let py = (y as i32 + dy) as u32;
                gray.get_pixel(px, py).0[0] as i32
            };
            let gx = sample(1, -1) + 2 * sample(1, 0) + sample(1, 1)
                - sample(-1, -1)
                - 2 * sample(-1, 0)
                - sample(-1, 1);
            let gy = sample(-1, 1) + 2 * sample(0, 1) + sample(1, 1)
                - sample(-1, -1)
                - 2 * sample(0, -1)
                - sample(1, -1);
            let magnitude = ((gx * gx + gy * gy) as f64).sqrt() as u16;
            let value = if magnitude >= threshold { 255 } else { 0 };
            edges.put_pixel(x, y, Luma([value]));
        }
    }
    DynamicImage::ImageRgb8(DynamicImage::ImageLuma8(edges).to_rgb8())
}

/// Grayscale map, the stand-in for a depth-estimation model.
pub fn grayscale_map(image: &DynamicImage) -> DynamicImage {
    DynamicImage::ImageRgb8(image.grayscale().to_rgb8())
}

/// Build a binary mask with the given box filled white.
pub fn mask_from_bbox(width: u32, height: u32, bbox: (u32, u32, u32, u32)) -> GrayImage {
    let (x0, y0, x1, y1) = bbox;
    let mut mask = GrayImage::new(width, height);
    for y in y0..y1.min(height) {
        for x in x0..x1.min(width) {
            mask.put_pixel(x, y, Luma([255]));
        }
    }
    mask
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditioningKind {
    Canny,
    Depth,
    Pose,
}

serde_plain::derive_fromstr_from_deserialize!(ConditioningKind);
serde_plain::derive_display_from_serialize!(ConditioningKind);

/// Preprocess a conditioning input. Pose extraction has no lightweight
/// stand-in and passes the image through unchanged.
pub fn conditioning_image(image: &DynamicImage, kind: ConditioningKind) -> DynamicImage {
    match kind {
        ConditioningKind::Canny => sobel_edges(image, EDGE_THRESHOLD),
        ConditioningKind::Depth => grayscale_map(image),
        ConditioningKind::Pose => image.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn solid(width: u32, height: u32, value: u8) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([value; 3])))
    }

    #[test]
    fn save_and_load_png_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.png");
        save_image(&solid(16, 8, 40), &path).unwrap();
        let loaded = load_image(&path).unwrap();
        assert_eq!(loaded.dimensions(), (16, 8));
        assert_eq!(loaded.to_rgb8().get_pixel(3, 3).0, [40, 40, 40]);
    }

    #[test]
    fn jpeg_extension_writes_jpeg() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jpg");
        save_image(&solid(16, 16, 90), &path).unwrap();
        let bytes = fs::read(&path).unwrap();
        // JPEG SOI marker
        assert_eq!(&bytes[..2], &[0xff, 0xd8]);
    }

    #[test]
    fn load_missing_file_mentions_path() {
        let err = load_image("no_such_image.png").unwrap_err();
        assert!(format!("{err:#}").contains("no_such_image.png"));
    }

    #[test]
    fn resize_preserves_aspect_when_asked() {
        let image = solid(100, 50, 0);
        let fitted = resize(&image, 64, 64, true);
        assert_eq!(fitted.dimensions(), (64, 32));
        let stretched = resize(&image, 64, 64, false);
        assert_eq!(stretched.dimensions(), (64, 64));
    }

    #[test]
    fn blend_endpoints_pick_each_source() {
        let a = solid(8, 8, 10);
        let b = solid(8, 8, 200);
        let only_a = blend(&a, &b, 0.0).unwrap();
        assert_eq!(only_a.to_rgb8().get_pixel(0, 0).0, [10, 10, 10]);
        let only_b = blend(&a, &b, 1.0).unwrap();
        assert_eq!(only_b.to_rgb8().get_pixel(0, 0).0, [200, 200, 200]);
    }

    #[test]
    fn blend_rejects_size_mismatch() {
        let a = solid(8, 8, 0);
        let b = solid(4, 4, 0);
        assert!(blend(&a, &b, 0.5).is_err());
    }

    #[test]
    fn sobel_marks_square_boundary_only() {
        let mut canvas = RgbImage::from_pixel(32, 32, Rgb([0; 3]));
        for y in 8..24 {
            for x in 8..24 {
                canvas.put_pixel(x, y, Rgb([255; 3]));
            }
        }
        let edges = sobel_edges(&DynamicImage::ImageRgb8(canvas), EDGE_THRESHOLD);
        let edges = edges.to_rgb8();
        // On the boundary
        assert_eq!(edges.get_pixel(8, 16).0[0], 255);
        // Inside and outside the square are uniform
        assert_eq!(edges.get_pixel(16, 16).0[0], 0);
        assert_eq!(edges.get_pixel(2, 2).0[0], 0);
    }

    #[test]
    fn bbox_mask_is_white_inside_black_outside() {
        let mask = mask_from_bbox(16, 16, (4, 4, 8, 8));
        assert_eq!(mask.get_pixel(5, 5).0[0], 255);
        assert_eq!(mask.get_pixel(0, 0).0[0], 0);
        assert_eq!(mask.get_pixel(9, 9).0[0], 0);
    }

    #[test]
    fn pose_conditioning_passes_through() {
        let image = solid(8, 8, 33);
        let out = conditioning_image(&image, ConditioningKind::Pose);
        assert_eq!(out.to_rgb8().get_pixel(4, 4).0, [33, 33, 33]);
    }
}
