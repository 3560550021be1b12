//! Image preprocessing for the DenseNet chest X-ray classifier.
//!
//! Uploaded films arrive as arbitrary PNG/JPEG/TIFF bytes. The network wants
//! one 224x224 channel with intensities on a fixed [-1024, 1024] scale.
//!
//! Flow:
//! 1. Validate byte length, then the pixel count from the header
//! 2. Decode
//! 3. Correct EXIF orientation (phone photos of a light box)
//! 4. Average colour channels into one
//! 5. Center-crop to the largest square
//! 6. Resize the square to 224x224
//! 7. Rescale intensities linearly onto [-1024, 1024]
//!
//! Cropping happens before resizing so non-square films are never stretched.

use std::io::Cursor;

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageBuffer, Luma};
use ndarray::Array2;
use tracing::debug;

use super::types::NormalizedTensor;
use super::PreprocessingError;
use crate::config::INPUT_SIZE;

/// Maximum input image size (in bytes) before rejecting.
/// Prevents OOM on corrupt/adversarial files.
const MAX_IMAGE_BYTES: usize = 50 * 1024 * 1024;

/// Maximum decoded raster size (width * height). A small, highly compressed
/// upload can still declare a huge raster; this is checked from the header.
pub const MAX_IMAGE_PIXELS: u64 = 50_000_000;

/// Half-width of the normalized intensity range. Pixel 0 maps to `-RANGE`,
/// pixel 255 maps to `+RANGE`; this is the scale the pretrained weights expect.
pub const INTENSITY_RANGE: f32 = 1024.0;

/// Intermediate single-channel raster. 16-bit so the channel mean keeps
/// sub-8-bit precision through the resize.
pub type GrayImage16 = ImageBuffer<Luma<u16>, Vec<u16>>;

// ═══════════════════════════════════════════════════════════
// Service traits
// ═══════════════════════════════════════════════════════════

/// Turns raw upload bytes into the classifier input tensor.
///
/// Pure transform: no I/O and no model calls.
pub trait ImagePreprocessor: Send + Sync {
    fn preprocess(&self, image_bytes: &[u8]) -> Result<NormalizedTensor, PreprocessingError>;
}

/// Fixes image orientation from EXIF metadata.
///
/// Phone photos embed rotation in EXIF tag 0x0112. Without correction a
/// portrait photo of a film reaches the network sideways.
pub trait OrientationCorrector: Send + Sync {
    /// Returns the corrected image. No-op if no EXIF or orientation=1.
    fn correct(&self, raw_bytes: &[u8], image: DynamicImage) -> DynamicImage;
}

// ═══════════════════════════════════════════════════════════
// XRayPreprocessor
// ═══════════════════════════════════════════════════════════

pub struct XRayPreprocessor {
    orientation: Box<dyn OrientationCorrector>,
    filter: FilterType,
    max_bytes: usize,
    max_pixels: u64,
}

impl XRayPreprocessor {
    pub fn new(orientation: Box<dyn OrientationCorrector>) -> Self {
        Self {
            orientation,
            // Bilinear; widens into an area filter when downsampling, so large films don't alias.
            filter: FilterType::Triangle,
            max_bytes: MAX_IMAGE_BYTES,
            max_pixels: MAX_IMAGE_PIXELS,
        }
    }

    /// Override the upload size ceiling (bytes).
    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Override the decoded raster ceiling (width * height).
    pub fn with_max_pixels(mut self, max_pixels: u64) -> Self {
        self.max_pixels = max_pixels;
        self
    }
}

impl Default for XRayPreprocessor {
    fn default() -> Self {
        Self::new(Box::new(ExifOrientationCorrector))
    }
}

impl ImagePreprocessor for XRayPreprocessor {
    fn preprocess(&self, image_bytes: &[u8]) -> Result<NormalizedTensor, PreprocessingError> {
        validate_image_bytes(image_bytes, self.max_bytes)?;
        validate_image_dimensions(image_bytes, self.max_pixels)?;

        let img = image::load_from_memory(image_bytes)
            .map_err(|e| PreprocessingError::Decode(e.to_string()))?;
        let (orig_w, orig_h) = img.dimensions();
        if orig_w == 0 || orig_h == 0 {
            return Err(PreprocessingError::ZeroExtent {
                width: orig_w,
                height: orig_h,
            });
        }

        let img = self.orientation.correct(image_bytes, img);
        let gray = average_channels(&img);
        let square = center_crop(&gray);
        let side = INPUT_SIZE as u32;
        let resized = image::imageops::resize(&square, side, side, self.filter);

        let (out_w, out_h) = resized.dimensions();
        let pixels: Vec<f32> = resized.into_raw().into_iter().map(normalize_intensity).collect();
        let data = Array2::from_shape_vec((out_h as usize, out_w as usize), pixels).map_err(|_| {
            PreprocessingError::Shape {
                expected: INPUT_SIZE,
                actual: vec![out_h as usize, out_w as usize],
            }
        })?;

        debug!(
            original_width = orig_w,
            original_height = orig_h,
            crop = square.width(),
            "Image preprocessed for classifier"
        );

        NormalizedTensor::new(data)
    }
}

// ── ExifOrientationCorrector ──────────────────────────────

/// EXIF-based orientation correction.
///
/// EXIF orientation values:
/// 1 = Normal, 2 = Mirrored, 3 = 180deg, 4 = Flipped V,
/// 5 = Mirrored + 90deg CW, 6 = 90deg CW, 7 = Mirrored + 270deg CW, 8 = 270deg CW
pub struct ExifOrientationCorrector;

impl OrientationCorrector for ExifOrientationCorrector {
    fn correct(&self, raw_bytes: &[u8], image: DynamicImage) -> DynamicImage {
        let orientation = read_exif_orientation(raw_bytes);
        if orientation != 1 {
            debug!(orientation, "Applying EXIF orientation");
        }
        apply_orientation(image, orientation)
    }
}

/// No-op orientation corrector, for inputs known to carry no EXIF.
pub struct NoOpOrientationCorrector;

impl OrientationCorrector for NoOpOrientationCorrector {
    fn correct(&self, _raw_bytes: &[u8], image: DynamicImage) -> DynamicImage {
        image
    }
}

/// Read EXIF orientation tag from raw image bytes.
/// Returns 1 (normal) if no EXIF data or tag not present.
pub fn read_exif_orientation(bytes: &[u8]) -> u32 {
    let mut cursor = Cursor::new(bytes);
    let reader = match exif::Reader::new().read_from_container(&mut cursor) {
        Ok(r) => r,
        Err(_) => return 1,
    };

    reader
        .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
        .and_then(|f| f.value.get_uint(0))
        .unwrap_or(1)
}

/// Apply EXIF orientation transform to a `DynamicImage`.
pub fn apply_orientation(img: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}

// ═══════════════════════════════════════════════════════════
// Pure helper functions
// ═══════════════════════════════════════════════════════════

/// Reject clearly invalid input before decoding.
pub fn validate_image_bytes(bytes: &[u8], max_bytes: usize) -> Result<(), PreprocessingError> {
    if bytes.is_empty() {
        return Err(PreprocessingError::Empty);
    }
    if bytes.len() > max_bytes {
        return Err(PreprocessingError::TooLarge {
            limit_mb: max_bytes / (1024 * 1024),
        });
    }
    Ok(())
}

/// Read the raster size from the header and reject anything over `max_pixels`
/// before a full decode allocates it.
pub fn validate_image_dimensions(
    bytes: &[u8],
    max_pixels: u64,
) -> Result<(), PreprocessingError> {
    let (width, height) = image::io::Reader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| PreprocessingError::Decode(e.to_string()))?
        .into_dimensions()
        .map_err(|e| PreprocessingError::Decode(e.to_string()))?;

    if u64::from(width) * u64::from(height) > max_pixels {
        return Err(PreprocessingError::TooManyPixels {
            width,
            height,
            max_pixels,
        });
    }
    Ok(())
}

/// Mean of the colour channels, stretched from 8-bit onto the full 16-bit range.
/// Alpha is ignored. Grayscale inputs come through unchanged (R = G = B).
pub fn average_channels(img: &DynamicImage) -> GrayImage16 {
    let rgb = img.to_rgb8();
    ImageBuffer::from_fn(rgb.width(), rgb.height(), |x, y| {
        let [r, g, b] = rgb.get_pixel(x, y).0;
        let sum = u32::from(r) + u32::from(g) + u32::from(b);
        // 765 * 257 / 3 == 65535, so this never overflows u16.
        Luma([((sum * 257 + 1) / 3) as u16])
    })
}

/// Largest centered square, starting at `w/2 - side/2` (floor division on
/// each term). With an even long side and odd short side the extra column
/// or row goes to the left/top edge.
pub fn center_crop(img: &GrayImage16) -> GrayImage16 {
    let (w, h) = img.dimensions();
    let side = w.min(h);
    let x = w / 2 - side / 2;
    let y = h / 2 - side / 2;
    image::imageops::crop_imm(img, x, y, side, side).to_image()
}

/// Map a 16-bit intensity onto [-INTENSITY_RANGE, INTENSITY_RANGE].
pub fn normalize_intensity(value: u16) -> f32 {
    let unit = f32::from(value) / f32::from(u16::MAX);
    (2.0 * unit - 1.0) * INTENSITY_RANGE
}
