use std::path::Path;

use fontdue::{Font, FontSettings};
use image::{DynamicImage, Rgb, RgbImage, imageops::FilterType};
use tracing::{debug, warn};

use crate::config::{BackgroundType, GradientDirection, Scaling, VisualConfig, parse_hex_color};
use crate::error::{PipelineError, Result};
use crate::segmenter::Segment;

/// Fonts tried, in order, when the config names none.
const SYSTEM_FONTS: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans-Bold.ttf",
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
    "/usr/share/fonts/liberation-sans/LiberationSans-Regular.ttf",
    "/Library/Fonts/Arial Unicode.ttf",
    "/System/Library/Fonts/Supplemental/Arial Unicode.ttf",
    "C:/Windows/Fonts/arial.ttf",
];

/// One still image per segment, at the configured resolution.
#[derive(Debug, Clone)]
pub struct Frame {
    pub segment_index: usize,
    pub image: RgbImage,
    /// Fraction of the configured font size the text was drawn at.
    pub font_scale: f32,
}

pub trait Compositor: Send + Sync {
    fn compose(&self, segment: &Segment, visual: &VisualConfig) -> Result<Frame>;
}

/// Horizontal extent of a run of text at a given pixel size.
pub trait TextMeasure {
    fn text_width(&self, text: &str, size: f32) -> f32;
}

impl TextMeasure for Font {
    fn text_width(&self, text: &str, size: f32) -> f32 {
        text.chars().map(|ch| self.metrics(ch, size).advance_width).sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextLayout {
    pub scale: f32,
    pub font_size: f32,
    pub line_height: f32,
    pub lines: Vec<(String, f32)>,
}

impl TextLayout {
    pub fn height(&self) -> f32 {
        self.lines.len() as f32 * self.line_height
    }
}

/// Greedy word wrap. `None` when a single word is wider than `max_width`.
fn wrap<M: TextMeasure + ?Sized>(
    measure: &M,
    text: &str,
    size: f32,
    max_width: f32,
) -> Option<Vec<(String, f32)>> {
    let space = measure.text_width(" ", size);
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut current_width = 0.0;

    for word in text.split_whitespace() {
        let word_width = measure.text_width(word, size);
        if word_width > max_width {
            return None;
        }
        if current.is_empty() {
            current.push_str(word);
            current_width = word_width;
        } else if current_width + space + word_width <= max_width {
            current.push(' ');
            current.push_str(word);
            current_width += space + word_width;
        } else {
            lines.push((std::mem::take(&mut current), current_width));
            current.push_str(word);
            current_width = word_width;
        }
    }
    if !current.is_empty() {
        lines.push((current, current_width));
    }
    Some(lines)
}

/// Lays `text` out inside the padded frame, shrinking the font by
/// `font_scale_step` until it fits or `min_font_scale` is passed.
pub fn fit_text<M: TextMeasure + ?Sized>(
    measure: &M,
    text: &str,
    visual: &VisualConfig,
    segment_index: usize,
) -> Result<TextLayout> {
    let max_width = visual.width.saturating_sub(2 * visual.padding) as f32;
    let max_height = visual.height.saturating_sub(2 * visual.padding) as f32;

    let mut step = 0u32;
    loop {
        let scale = (1.0 - step as f32 * visual.font_scale_step).max(visual.min_font_scale);
        let font_size = visual.font_size * scale;
        let line_height = font_size * visual.line_spacing;

        if let Some(lines) = wrap(measure, text, font_size, max_width) {
            let layout = TextLayout {
                scale,
                font_size,
                line_height,
                lines,
            };
            if layout.height() <= max_height {
                return Ok(layout);
            }
        }

        if scale <= visual.min_font_scale + f32::EPSILON {
            return Err(PipelineError::TextOverflow {
                segment_index,
                min_scale: visual.min_font_scale,
            });
        }
        step += 1;
        debug!(segment = segment_index, scale, "text overflows frame, shrinking font");
    }
}

/// Draws text with fontdue over a configured background.
pub struct FontCompositor {
    font: Font,
    background_image: Option<(String, DynamicImage)>,
}

impl FontCompositor {
    pub fn new(visual: &VisualConfig) -> Result<Self> {
        let font = load_font(visual.font_family.as_deref())?;
        Self::with_font(font, visual)
    }

    pub fn with_font(font: Font, visual: &VisualConfig) -> Result<Self> {
        let background_image = match &visual.background {
            BackgroundType::Image { path, .. } => Some((path.clone(), load_image(path)?)),
            _ => None,
        };
        Ok(Self {
            font,
            background_image,
        })
    }

    fn render_background(&self, visual: &VisualConfig) -> Result<RgbImage> {
        let (width, height) = (visual.width, visual.height);

        match &visual.background {
            BackgroundType::Solid { color } => {
                Ok(RgbImage::from_pixel(width, height, Rgb(parse_hex_color(color)?)))
            }
            BackgroundType::Gradient {
                start_color,
                end_color,
                direction,
            } => Ok(render_gradient(
                width,
                height,
                parse_hex_color(start_color)?,
                parse_hex_color(end_color)?,
                *direction,
            )),
            BackgroundType::Image {
                path,
                scaling,
                opacity,
            } => {
                let source = match &self.background_image {
                    Some((cached, image)) if cached == path => image.clone(),
                    _ => load_image(path)?,
                };
                let mut img = RgbImage::from_pixel(width, height, Rgb([0, 0, 0]));
                let scaled = scale_image(source, *scaling, width, height).to_rgb8();
                let x = (width as i64 - scaled.width() as i64) / 2;
                let y = (height as i64 - scaled.height() as i64) / 2;
                blend_image_onto_background(&mut img, &scaled, x, y, *opacity);
                Ok(img)
            }
        }
    }

    fn draw_text(
        &self,
        img: &mut RgbImage,
        text: &str,
        x: f32,
        baseline: f32,
        size: f32,
        color: [u8; 3],
    ) {
        let mut pen_x = x;
        for ch in text.chars() {
            let (metrics, bitmap) = self.font.rasterize(ch, size);
            let left = (pen_x + metrics.xmin as f32).round() as i64;
            let top = (baseline - (metrics.height as i32 + metrics.ymin) as f32).round() as i64;

            for (i, &alpha) in bitmap.iter().enumerate() {
                if alpha == 0 {
                    continue;
                }
                let px = left + (i % metrics.width) as i64;
                let py = top + (i / metrics.width) as i64;
                if px < 0 || py < 0 || px >= img.width() as i64 || py >= img.height() as i64 {
                    continue;
                }

                let pixel = img.get_pixel_mut(px as u32, py as u32);
                let alpha_f = alpha as f32 / 255.0;
                for (channel, &c) in pixel.0.iter_mut().zip(color.iter()) {
                    *channel = ((1.0 - alpha_f) * *channel as f32 + alpha_f * c as f32) as u8;
                }
            }

            pen_x += metrics.advance_width;
        }
    }
}

impl Compositor for FontCompositor {
    fn compose(&self, segment: &Segment, visual: &VisualConfig) -> Result<Frame> {
        let mut img = self.render_background(visual)?;
        let layout = fit_text(&self.font, &segment.text, visual, segment.index)?;
        if layout.scale < 1.0 {
            warn!(
                segment = segment.index,
                scale = layout.scale,
                "reduced font size to fit frame"
            );
        }

        let text_color = parse_hex_color(&visual.font_color)?;
        let shadow_color = visual
            .shadow_color
            .as_deref()
            .map(parse_hex_color)
            .transpose()?;
        let shadow_offset = (layout.font_size / 24.0).max(2.0);
        let ascent = self
            .font
            .horizontal_line_metrics(layout.font_size)
            .map(|m| m.ascent)
            .unwrap_or(layout.font_size * 0.8);

        let top = (visual.height as f32 - layout.height()) / 2.0;
        for (row, (line, line_width)) in layout.lines.iter().enumerate() {
            let x = (visual.width as f32 - line_width) / 2.0;
            let baseline = top + row as f32 * layout.line_height + ascent;
            if let Some(shadow) = shadow_color {
                self.draw_text(
                    &mut img,
                    line,
                    x + shadow_offset,
                    baseline + shadow_offset,
                    layout.font_size,
                    shadow,
                );
            }
            self.draw_text(&mut img, line, x, baseline, layout.font_size, text_color);
        }

        Ok(Frame {
            segment_index: segment.index,
            image: img,
            font_scale: layout.scale,
        })
    }
}

/// First existing file among the usual system font locations.
pub fn find_system_font() -> Option<&'static str> {
    SYSTEM_FONTS
        .iter()
        .copied()
        .find(|path| Path::new(path).exists())
}

pub fn load_font(font_path: Option<&str>) -> Result<Font> {
    let path = match font_path {
        Some(path) => {
            if !Path::new(path).exists() {
                return Err(PipelineError::Validation(format!(
                    "Font file not found: {}",
                    path
                )));
            }
            path
        }
        None => find_system_font().ok_or_else(|| {
            PipelineError::Validation(
                "No font configured and no system font found; set visual.font_family".to_string(),
            )
        })?,
    };
    debug!(font = path, "loading font");

    let font_data = std::fs::read(path)?;
    Font::from_bytes(font_data.as_slice(), FontSettings::default())
        .map_err(|e| PipelineError::Validation(format!("Failed to load font '{}': {}", path, e)))
}

fn load_image(path: &str) -> Result<DynamicImage> {
    image::open(path).map_err(|e| {
        PipelineError::Validation(format!("Failed to load background image '{}': {}", path, e))
    })
}

fn render_gradient(
    width: u32,
    height: u32,
    start: [u8; 3],
    end: [u8; 3],
    direction: GradientDirection,
) -> RgbImage {
    let span = |extent: u32| (extent.max(2) - 1) as f32;
    RgbImage::from_fn(width, height, |x, y| {
        let ratio = match direction {
            GradientDirection::Horizontal => x as f32 / span(width),
            GradientDirection::Vertical => y as f32 / span(height),
            GradientDirection::Diagonal => {
                (x as f32 + y as f32) / (span(width) + span(height))
            }
        };
        let mix = |a: u8, b: u8| (a as f32 * (1.0 - ratio) + b as f32 * ratio).round() as u8;
        Rgb([
            mix(start[0], end[0]),
            mix(start[1], end[1]),
            mix(start[2], end[2]),
        ])
    })
}

fn scale_image(image: DynamicImage, scaling: Scaling, width: u32, height: u32) -> DynamicImage {
    let (img_width, img_height) = (image.width(), image.height());

    match scaling {
        Scaling::Stretch => image.resize_exact(width, height, FilterType::Lanczos3),
        Scaling::Fit => image.resize(width, height, FilterType::Lanczos3),
        Scaling::Fill => {
            let scale_x = width as f32 / img_width as f32;
            let scale_y = height as f32 / img_height as f32;
            let scale = scale_x.max(scale_y);

            let new_width = ((img_width as f32 * scale).ceil() as u32).max(width);
            let new_height = ((img_height as f32 * scale).ceil() as u32).max(height);
            let resized = image.resize_exact(new_width, new_height, FilterType::Lanczos3);

            let crop_x = (new_width - width) / 2;
            let crop_y = (new_height - height) / 2;
            resized.crop_imm(crop_x, crop_y, width, height)
        }
        Scaling::Center => image,
        Scaling::Tile => {
            let mut tiled = DynamicImage::new_rgb8(width, height);
            for y in (0..height).step_by(img_height.max(1) as usize) {
                for x in (0..width).step_by(img_width.max(1) as usize) {
                    image::imageops::overlay(&mut tiled, &image, x as i64, y as i64);
                }
            }
            tiled
        }
    }
}

fn blend_image_onto_background(
    background: &mut RgbImage,
    foreground: &RgbImage,
    offset_x: i64,
    offset_y: i64,
    opacity: f32,
) {
    let opacity = opacity.clamp(0.0, 1.0);

    for (x, y, bg_pixel) in background.enumerate_pixels_mut() {
        let fx = x as i64 - offset_x;
        let fy = y as i64 - offset_y;
        if fx < 0 || fy < 0 {
            continue;
        }
        if let Some(fg_pixel) = foreground.get_pixel_checked(fx as u32, fy as u32) {
            for i in 0..3 {
                bg_pixel.0[i] = ((1.0 - opacity) * bg_pixel.0[i] as f32
                    + opacity * fg_pixel.0[i] as f32) as u8;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Every character is 0.5 em wide.
    struct Monospace;

    impl TextMeasure for Monospace {
        fn text_width(&self, text: &str, size: f32) -> f32 {
            text.chars().count() as f32 * size * 0.5
        }
    }

    fn visual() -> VisualConfig {
        VisualConfig {
            width: 400,
            height: 300,
            font_size: 40.0,
            padding: 20,
            line_spacing: 1.25,
            font_scale_step: 0.1,
            min_font_scale: 0.5,
            ..VisualConfig::default()
        }
    }

    #[test]
    fn short_text_fits_at_full_size() {
        let layout = fit_text(&Monospace, "Short and sweet.", &visual(), 0).unwrap();
        assert_eq!(layout.scale, 1.0);
        assert_eq!(layout.lines.len(), 1);
        assert_eq!(layout.lines[0].1, 16.0 * 20.0);
    }

    #[test]
    fn overflowing_text_shrinks_before_fitting() {
        // 360px of usable width fits 18 chars per line at 40px, 5 lines of 50px.
        let text = "one two three four five six seven eight nine ten eleven twelve \
                    thirteen fourteen fifteen sixteen seventeen eighteen nineteen twenty";
        let layout = fit_text(&Monospace, text, &visual(), 4).unwrap();

        assert!(layout.scale < 1.0, "scale {}", layout.scale);
        assert!(layout.scale >= 0.5);
        assert!(layout.height() <= 260.0);
        let max_width = 360.0;
        assert!(layout.lines.iter().all(|(_, w)| *w <= max_width));
        let rejoined: Vec<&str> = layout.lines.iter().map(|(l, _)| l.as_str()).collect();
        assert_eq!(rejoined.join(" "), text.split_whitespace().collect::<Vec<_>>().join(" "));
    }

    #[test]
    fn gives_up_at_minimum_scale() {
        let text = "word ".repeat(400);
        let err = fit_text(&Monospace, &text, &visual(), 9).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::TextOverflow {
                segment_index: 9,
                ..
            }
        ));

        // A single word wider than the frame at any allowed scale.
        let err = fit_text(&Monospace, &"x".repeat(60), &visual(), 2).unwrap_err();
        assert!(matches!(err, PipelineError::TextOverflow { .. }));
    }

    #[test]
    fn layout_is_deterministic() {
        let text = "The same words always land on the same lines at the same size.";
        assert_eq!(
            fit_text(&Monospace, text, &visual(), 0).unwrap(),
            fit_text(&Monospace, text, &visual(), 0).unwrap()
        );
    }

    #[test]
    fn gradients_run_between_endpoints() {
        let img = render_gradient(4, 3, [0, 0, 0], [200, 100, 50], GradientDirection::Vertical);
        assert_eq!(img.get_pixel(2, 0).0, [0, 0, 0]);
        assert_eq!(img.get_pixel(2, 2).0, [200, 100, 50]);

        let img =
            render_gradient(5, 2, [10, 10, 10], [20, 20, 20], GradientDirection::Horizontal);
        assert_eq!(img.get_pixel(0, 1).0, [10, 10, 10]);
        assert_eq!(img.get_pixel(4, 1).0, [20, 20, 20]);
    }

    #[test]
    fn blends_at_offset_with_opacity() {
        let mut bg = RgbImage::from_pixel(4, 4, Rgb([0, 0, 0]));
        let fg = RgbImage::from_pixel(2, 2, Rgb([200, 200, 200]));
        blend_image_onto_background(&mut bg, &fg, 1, 1, 0.5);

        assert_eq!(bg.get_pixel(0, 0).0, [0, 0, 0]);
        assert_eq!(bg.get_pixel(1, 1).0, [100, 100, 100]);
        assert_eq!(bg.get_pixel(2, 2).0, [100, 100, 100]);
        assert_eq!(bg.get_pixel(3, 3).0, [0, 0, 0]);
    }

    #[test]
    fn fill_scaling_covers_target() {
        let src = DynamicImage::new_rgb8(30, 10);
        let scaled = scale_image(src, Scaling::Fill, 20, 40);
        assert_eq!((scaled.width(), scaled.height()), (20, 40));
    }

    #[test]
    fn missing_font_file_is_a_validation_error() {
        assert!(matches!(
            load_font(Some("/nonexistent/font.ttf")),
            Err(PipelineError::Validation(_))
        ));
    }

    #[test]
    fn composes_frame_at_configured_size() {
        // Needs a real font; skipped on hosts without one.
        let Some(path) = find_system_font() else {
            return;
        };
        let visual = VisualConfig {
            width: 360,
            height: 640,
            font_family: Some(path.to_string()),
            font_size: 48.0,
            padding: 24,
            ..VisualConfig::default()
        };
        let compositor = FontCompositor::new(&visual).unwrap();
        let segment = Segment {
            index: 3,
            text: "Nobody expected the cat to answer the phone.".to_string(),
        };

        let frame = compositor.compose(&segment, &visual).unwrap();
        assert_eq!(frame.segment_index, 3);
        assert_eq!(frame.image.dimensions(), (360, 640));

        let background = parse_hex_color("#101820").unwrap();
        assert!(frame.image.pixels().any(|p| p.0 != background));

        let again = compositor.compose(&segment, &visual).unwrap();
        assert_eq!(frame.image, again.image);
    }
}
