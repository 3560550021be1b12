//! Attribution overlay rendering.
//!
//! Composites an attribution heat map over the preprocessed film and encodes
//! the figure as a base64 PNG. Layout: 800x800 white canvas, the 224x224
//! composite upscaled to a centered 616x616 panel, and a one-line title
//! above it.

use std::fmt;
use std::io::Cursor;
use std::str::FromStr;

use base64::Engine;
use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImage, ImageOutputFormat, Rgb, RgbImage};
use ndarray::{Array2, ArrayView2};
use tracing::debug;

use super::glyphs;
use super::types::OverlayImage;
use super::VisualizationError;
use crate::config::INPUT_SIZE;

const CANVAS_SIZE: u32 = 800;
const PANEL_SIZE: u32 = 616;
const PANEL_TOP: u32 = 112;
const TITLE_SCALE: u32 = 3;
const TITLE_MARGIN: u32 = 16;
const DEFAULT_ALPHA: f32 = 0.5;

const WHITE: Rgb<u8> = Rgb([255, 255, 255]);
const INK: Rgb<u8> = Rgb([0, 0, 0]);

// ═══════════════════════════════════════════════════════════
// Colormaps
// ═══════════════════════════════════════════════════════════

/// Heat-map palette for attribution values.
///
/// `Bwr` is diverging and centered on zero: negative evidence blue, positive
/// red, no contribution white. `Jet` stretches the attribution range across
/// the full rainbow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorMap {
    Bwr,
    Jet,
}

impl ColorMap {
    /// RGB in [0, 1] for a position `t` in [0, 1]. Out-of-range input is clamped.
    pub fn color(&self, t: f32) -> [f32; 3] {
        let t = if t.is_nan() { 0.5 } else { t.clamp(0.0, 1.0) };
        match self {
            ColorMap::Bwr => {
                if t < 0.5 {
                    let u = t / 0.5;
                    [u, u, 1.0]
                } else {
                    let u = (1.0 - t) / 0.5;
                    [1.0, u, u]
                }
            }
            ColorMap::Jet => [
                piecewise(t, &JET_RED),
                piecewise(t, &JET_GREEN),
                piecewise(t, &JET_BLUE),
            ],
        }
    }

    /// Map each attribution value to its palette position.
    fn positions(&self, attribution: ArrayView2<'_, f32>) -> Array2<f32> {
        match self {
            ColorMap::Bwr => {
                let bound = attribution
                    .iter()
                    .fold(0.0f32, |acc, v| acc.max(v.abs()));
                if bound <= 0.0 || !bound.is_finite() {
                    return attribution.mapv(|_| 0.5);
                }
                attribution.mapv(|v| 0.5 + 0.5 * v / bound)
            }
            ColorMap::Jet => min_max(attribution),
        }
    }
}

// Control points of matplotlib's jet, per channel.
const JET_RED: [(f32, f32); 5] = [(0.0, 0.0), (0.35, 0.0), (0.66, 1.0), (0.89, 1.0), (1.0, 0.5)];
const JET_GREEN: [(f32, f32); 6] = [
    (0.0, 0.0),
    (0.125, 0.0),
    (0.375, 1.0),
    (0.64, 1.0),
    (0.91, 0.0),
    (1.0, 0.0),
];
const JET_BLUE: [(f32, f32); 5] = [(0.0, 0.5), (0.11, 1.0), (0.34, 1.0), (0.65, 0.0), (1.0, 0.0)];

fn piecewise(t: f32, points: &[(f32, f32)]) -> f32 {
    for pair in points.windows(2) {
        let (x0, y0) = pair[0];
        let (x1, y1) = pair[1];
        if t <= x1 {
            return y0 + (y1 - y0) * (t - x0) / (x1 - x0);
        }
    }
    points.last().map(|&(_, y)| y).unwrap_or(0.0)
}

impl fmt::Display for ColorMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColorMap::Bwr => write!(f, "bwr"),
            ColorMap::Jet => write!(f, "jet"),
        }
    }
}

impl FromStr for ColorMap {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bwr" => Ok(ColorMap::Bwr),
            "jet" => Ok(ColorMap::Jet),
            other => Err(format!("unknown colormap '{other}' (expected bwr or jet)")),
        }
    }
}

/// Rescale to [0, 1]. A constant array maps to 0.5 everywhere.
fn min_max(values: ArrayView2<'_, f32>) -> Array2<f32> {
    let (lo, hi) = values
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let range = hi - lo;
    if range <= 0.0 || !range.is_finite() {
        return values.mapv(|_| 0.5);
    }
    values.mapv(|v| (v - lo) / range)
}

// ═══════════════════════════════════════════════════════════
// Renderer
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct OverlayRenderer {
    colormap: ColorMap,
    alpha: f32,
}

impl OverlayRenderer {
    pub fn new(colormap: ColorMap) -> Self {
        Self {
            colormap,
            alpha: DEFAULT_ALPHA,
        }
    }

    pub fn colormap(&self) -> ColorMap {
        self.colormap
    }

    /// Render `attribution` over `image`, titled "Attribution for {label}".
    ///
    /// Both arrays must be 224x224. The film is min-max scaled to gray; the
    /// heat map is blended on top at 50% opacity.
    pub fn render(
        &self,
        image: ArrayView2<'_, f32>,
        attribution: ArrayView2<'_, f32>,
        label: &str,
    ) -> Result<OverlayImage, VisualizationError> {
        check_shape("image", image)?;
        check_shape("attribution", attribution)?;

        let composite = self.composite(image, attribution);
        let canvas = self.layout(&composite, &format!("Attribution for {label}"))?;

        let mut png = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(canvas)
            .write_to(&mut png, ImageOutputFormat::Png)
            .map_err(|e| VisualizationError::Encode(e.to_string()))?;

        debug!(
            colormap = %self.colormap,
            png_bytes = png.get_ref().len(),
            "Overlay rendered"
        );
        Ok(OverlayImage::new(
            base64::engine::general_purpose::STANDARD.encode(png.get_ref()),
        ))
    }

    fn composite(&self, image: ArrayView2<'_, f32>, attribution: ArrayView2<'_, f32>) -> RgbImage {
        let gray = min_max(image);
        let heat = self.colormap.positions(attribution);
        let size = INPUT_SIZE as u32;

        RgbImage::from_fn(size, size, |x, y| {
            let (row, col) = (y as usize, x as usize);
            let base = gray[[row, col]];
            let color = self.colormap.color(heat[[row, col]]);
            let blend = |c: f32| {
                let v = (1.0 - self.alpha) * base + self.alpha * c;
                (v.clamp(0.0, 1.0) * 255.0).round() as u8
            };
            Rgb([blend(color[0]), blend(color[1]), blend(color[2])])
        })
    }

    fn layout(&self, composite: &RgbImage, title: &str) -> Result<RgbImage, VisualizationError> {
        let mut canvas = RgbImage::from_pixel(CANVAS_SIZE, CANVAS_SIZE, WHITE);

        let panel = imageops::resize(composite, PANEL_SIZE, PANEL_SIZE, FilterType::Nearest);
        let panel_left = (CANVAS_SIZE - PANEL_SIZE) / 2;
        canvas
            .copy_from(&panel, panel_left, PANEL_TOP)
            .map_err(|e| VisualizationError::Encode(format!("panel placement: {e}")))?;

        // Shrink the title until it fits between the margins.
        let available = CANVAS_SIZE - 2 * TITLE_MARGIN;
        let mut scale = TITLE_SCALE;
        while scale > 1 && glyphs::text_width(title, scale) > available {
            scale -= 1;
        }
        let width = glyphs::text_width(title, scale).min(available);
        let x = (CANVAS_SIZE - width) / 2;
        let y = PANEL_TOP.saturating_sub(glyphs::GLYPH_HEIGHT * scale) / 2;
        glyphs::draw_text(&mut canvas, title, x, y, scale, INK);

        Ok(canvas)
    }
}

impl Default for OverlayRenderer {
    fn default() -> Self {
        Self::new(ColorMap::Bwr)
    }
}

fn check_shape(what: &'static str, array: ArrayView2<'_, f32>) -> Result<(), VisualizationError> {
    if array.dim() != (INPUT_SIZE, INPUT_SIZE) {
        return Err(VisualizationError::Shape {
            what,
            expected: INPUT_SIZE,
            actual: array.shape().to_vec(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(overlay: &OverlayImage) -> RgbImage {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(overlay.as_str())
            .unwrap();
        assert_eq!(&bytes[..8], b"\x89PNG\r\n\x1a\n");
        image::load_from_memory(&bytes).unwrap().to_rgb8()
    }

    fn gradient_image() -> Array2<f32> {
        Array2::from_shape_fn((INPUT_SIZE, INPUT_SIZE), |(r, c)| (r + c) as f32 - 224.0)
    }

    #[test]
    fn wrong_image_shape_is_rejected() {
        let image = Array2::zeros((100, 100));
        let attribution = Array2::zeros((INPUT_SIZE, INPUT_SIZE));
        let err = OverlayRenderer::default()
            .render(image.view(), attribution.view(), "Edema")
            .unwrap_err();
        match err {
            VisualizationError::Shape { what, actual, .. } => {
                assert_eq!(what, "image");
                assert_eq!(actual, vec![100, 100]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn wrong_attribution_shape_is_rejected() {
        let image = Array2::zeros((INPUT_SIZE, INPUT_SIZE));
        let attribution = Array2::zeros((INPUT_SIZE, 112));
        let err = OverlayRenderer::default()
            .render(image.view(), attribution.view(), "Edema")
            .unwrap_err();
        assert!(err.to_string().contains("attribution"));
        assert!(err.to_string().contains("[224, 112]"));
    }

    #[test]
    fn output_is_800_square_png() {
        let image = gradient_image();
        let attribution = Array2::from_shape_fn((INPUT_SIZE, INPUT_SIZE), |(r, _)| r as f32 - 112.0);
        let overlay = OverlayRenderer::new(ColorMap::Jet)
            .render(image.view(), attribution.view(), "Cardiomegaly")
            .unwrap();
        let decoded = decode(&overlay);
        assert_eq!(decoded.dimensions(), (CANVAS_SIZE, CANVAS_SIZE));
    }

    #[test]
    fn title_band_contains_ink_and_corners_stay_white() {
        let image = gradient_image();
        let attribution = Array2::zeros((INPUT_SIZE, INPUT_SIZE));
        let overlay = OverlayRenderer::default()
            .render(image.view(), attribution.view(), "Lung Opacity")
            .unwrap();
        let decoded = decode(&overlay);

        let dark_in_title = (0..CANVAS_SIZE)
            .flat_map(|x| (0..PANEL_TOP).map(move |y| (x, y)))
            .filter(|&(x, y)| decoded.get_pixel(x, y)[0] < 64)
            .count();
        assert!(dark_in_title > 0);
        assert_eq!(*decoded.get_pixel(0, 0), WHITE);
        assert_eq!(*decoded.get_pixel(CANVAS_SIZE - 1, CANVAS_SIZE - 1), WHITE);
    }

    #[test]
    fn zero_attribution_with_bwr_is_neutral_gray() {
        // Constant film maps to mid-gray; white at half opacity keeps it neutral.
        let image = Array2::zeros((INPUT_SIZE, INPUT_SIZE));
        let attribution = Array2::zeros((INPUT_SIZE, INPUT_SIZE));
        let renderer = OverlayRenderer::new(ColorMap::Bwr);
        let composite = renderer.composite(image.view(), attribution.view());
        let px = composite.get_pixel(50, 50);
        assert_eq!(px[0], px[1]);
        assert_eq!(px[1], px[2]);
        assert_eq!(px[0], 191);
    }

    #[test]
    fn positive_attribution_tints_red_under_bwr() {
        let image = Array2::zeros((INPUT_SIZE, INPUT_SIZE));
        let mut attribution = Array2::zeros((INPUT_SIZE, INPUT_SIZE));
        attribution[[10, 20]] = 4.0;
        attribution[[30, 40]] = -4.0;
        let composite = OverlayRenderer::new(ColorMap::Bwr).composite(image.view(), attribution.view());

        let hot = composite.get_pixel(20, 10);
        assert!(hot[0] > hot[2]);
        let cold = composite.get_pixel(40, 30);
        assert!(cold[2] > cold[0]);
    }

    #[test]
    fn rendering_is_deterministic() {
        let image = gradient_image();
        let attribution = Array2::from_shape_fn((INPUT_SIZE, INPUT_SIZE), |(r, c)| {
            ((r * 7 + c * 3) % 11) as f32 - 5.0
        });
        let renderer = OverlayRenderer::default();
        let a = renderer.render(image.view(), attribution.view(), "Mass").unwrap();
        let b = renderer.render(image.view(), attribution.view(), "Mass").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn long_titles_still_render() {
        let image = gradient_image();
        let attribution = Array2::zeros((INPUT_SIZE, INPUT_SIZE));
        let label = "Enlarged Cardiomediastinum with a much longer qualifier appended";
        assert!(OverlayRenderer::default()
            .render(image.view(), attribution.view(), label)
            .is_ok());
    }

    #[test]
    fn jet_endpoints_match_reference() {
        let low = ColorMap::Jet.color(0.0);
        let high = ColorMap::Jet.color(1.0);
        assert_eq!(low, [0.0, 0.0, 0.5]);
        assert_eq!(high, [0.5, 0.0, 0.0]);
        let mid = ColorMap::Jet.color(0.5);
        assert!(mid[1] > 0.99);
    }

    #[test]
    fn bwr_endpoints() {
        assert_eq!(ColorMap::Bwr.color(0.0), [0.0, 0.0, 1.0]);
        assert_eq!(ColorMap::Bwr.color(0.5), [1.0, 1.0, 1.0]);
        assert_eq!(ColorMap::Bwr.color(1.0), [1.0, 0.0, 0.0]);
    }

    #[test]
    fn colormap_parses_case_insensitively() {
        assert_eq!("JET".parse::<ColorMap>().unwrap(), ColorMap::Jet);
        assert_eq!("bwr".parse::<ColorMap>().unwrap(), ColorMap::Bwr);
        assert!("viridis".parse::<ColorMap>().is_err());
    }

    #[test]
    fn constant_input_min_max_is_half() {
        let flat = Array2::from_elem((4, 4), 7.0f32);
        assert!(min_max(flat.view()).iter().all(|&v| v == 0.5));
    }
}
