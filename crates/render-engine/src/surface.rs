//! Drawing surfaces.
//!
//! The compositor draws through the [`Surface`] trait. [`RgbaCanvas`] is the
//! CPU implementation used for preview and export; [`RecordingSurface`] only
//! records the calls it receives.

use cosmic_text::{Attrs, Buffer, Color, Family, FontSystem, Metrics, Shaping, SwashCache};
use image::{Rgba, RgbaImage};
use serde::{Deserialize, Serialize};

use cutline_project_model::TextStyle;

/// Axis-aligned rectangle in surface pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// The whole of a `width` x `height` surface.
    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0.0, 0.0, width as f64, height as f64)
    }

    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }

    pub fn is_empty(&self) -> bool {
        !(self.width > 0.0 && self.height > 0.0)
    }

    /// Overlap of two rectangles, `None` when they do not overlap.
    pub fn intersect(&self, other: &Rect) -> Option<Rect> {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        let rect = Rect::new(x, y, right - x, bottom - y);
        (!rect.is_empty()).then_some(rect)
    }

    /// Integer pixel span `(x0, y0, x1, y1)` covered by the rectangle on a
    /// `width` x `height` surface. Pixel centers decide coverage.
    fn pixel_span(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let x0 = (self.x - 0.5).ceil().max(0.0);
        let y0 = (self.y - 0.5).ceil().max(0.0);
        let x1 = (self.right() - 0.5).ceil().min(width as f64);
        let y1 = (self.bottom() - 0.5).ceil().min(height as f64);
        (x1 > x0 && y1 > y0).then_some((x0 as u32, y0 as u32, x1 as u32, y1 as u32))
    }
}

/// Parse `#rgb`, `#rrggbb` or `#rrggbbaa`.
pub fn parse_hex_color(raw: &str) -> Option<Rgba<u8>> {
    let hex = raw.trim().strip_prefix('#')?;
    let nibble = |i: usize| u8::from_str_radix(hex.get(i..i + 1)?, 16).ok();
    let byte = |i: usize| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok();
    match hex.len() {
        3 => Some(Rgba([nibble(0)? * 17, nibble(1)? * 17, nibble(2)? * 17, 255])),
        6 => Some(Rgba([byte(0)?, byte(2)?, byte(4)?, 255])),
        8 => Some(Rgba([byte(0)?, byte(2)?, byte(4)?, byte(6)?])),
        _ => None,
    }
}

/// Something the compositor can draw into.
pub trait Surface: Send {
    fn size(&self) -> (u32, u32);

    /// Fill the whole surface with `color`.
    fn clear(&mut self, color: Rgba<u8>);

    /// Draw `image` scaled into `dest` at `opacity`, restricted to `clip`.
    fn draw_image(&mut self, image: &RgbaImage, dest: Rect, opacity: f64, clip: Option<Rect>);

    /// Draw a text block laid out inside `dest`.
    fn draw_text(&mut self, text: &TextStyle, dest: Rect, opacity: f64, clip: Option<Rect>);
}

/// Source-over blend of `src` onto `dst` with extra opacity.
fn blend(dst: &mut Rgba<u8>, src: Rgba<u8>, opacity: f64) {
    let alpha = (src[3] as f64 / 255.0) * opacity;
    if alpha <= 0.0 {
        return;
    }
    let inv = 1.0 - alpha;
    for c in 0..3 {
        dst[c] = (src[c] as f64 * alpha + dst[c] as f64 * inv).round() as u8;
    }
    let dst_alpha = dst[3] as f64 / 255.0;
    dst[3] = ((alpha + dst_alpha * inv) * 255.0).round() as u8;
}

/// CPU RGBA canvas.
pub struct RgbaCanvas {
    image: RgbaImage,
    fonts: Option<(FontSystem, SwashCache)>,
}

impl RgbaCanvas {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            image: RgbaImage::new(width, height),
            fonts: None,
        }
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    /// Copy of the current pixels.
    pub fn snapshot(&self) -> RgbaImage {
        self.image.clone()
    }

    pub fn into_image(self) -> RgbaImage {
        self.image
    }

    fn fill_rect(&mut self, rect: Rect, color: Rgba<u8>, opacity: f64) {
        let (width, height) = self.image.dimensions();
        let Some((x0, y0, x1, y1)) = rect.pixel_span(width, height) else {
            return;
        };
        for y in y0..y1 {
            for x in x0..x1 {
                blend(self.image.get_pixel_mut(x, y), color, opacity);
            }
        }
    }
}

impl std::fmt::Debug for RgbaCanvas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RgbaCanvas")
            .field("size", &self.image.dimensions())
            .field("fonts_loaded", &self.fonts.is_some())
            .finish()
    }
}

impl Surface for RgbaCanvas {
    fn size(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    fn clear(&mut self, color: Rgba<u8>) {
        for pixel in self.image.pixels_mut() {
            *pixel = color;
        }
    }

    fn draw_image(&mut self, image: &RgbaImage, dest: Rect, opacity: f64, clip: Option<Rect>) {
        let opacity = opacity.clamp(0.0, 1.0);
        let (src_w, src_h) = image.dimensions();
        if opacity <= 0.0 || src_w == 0 || src_h == 0 || dest.is_empty() {
            return;
        }
        let area = match clip {
            Some(clip) => match dest.intersect(&clip) {
                Some(area) => area,
                None => return,
            },
            None => dest,
        };
        let (width, height) = self.image.dimensions();
        let Some((x0, y0, x1, y1)) = area.pixel_span(width, height) else {
            return;
        };

        let scale_x = src_w as f64 / dest.width;
        let scale_y = src_h as f64 / dest.height;
        for y in y0..y1 {
            let sy = (((y as f64 + 0.5 - dest.y) * scale_y).floor() as i64).clamp(0, src_h as i64 - 1);
            for x in x0..x1 {
                let sx =
                    (((x as f64 + 0.5 - dest.x) * scale_x).floor() as i64).clamp(0, src_w as i64 - 1);
                let src = *image.get_pixel(sx as u32, sy as u32);
                blend(self.image.get_pixel_mut(x, y), src, opacity);
            }
        }
    }

    fn draw_text(&mut self, text: &TextStyle, dest: Rect, opacity: f64, clip: Option<Rect>) {
        let opacity = opacity.clamp(0.0, 1.0);
        let area = match clip {
            Some(clip) => match dest.intersect(&clip) {
                Some(area) => area,
                None => return,
            },
            None => dest,
        };
        if opacity <= 0.0 || area.is_empty() {
            return;
        }

        if let Some(background) = text.background_color.as_deref().and_then(parse_hex_color) {
            self.fill_rect(area, background, opacity);
        }
        if text.content.is_empty() {
            return;
        }

        let color = parse_hex_color(&text.color).unwrap_or(Rgba([255, 255, 255, 255]));
        let font_size = (text.font_size as f32).max(1.0);
        let (fonts, swash) = self
            .fonts
            .get_or_insert_with(|| (FontSystem::new(), SwashCache::new()));

        let mut buffer = Buffer::new(fonts, Metrics::new(font_size, font_size * 1.2));
        buffer.set_size(fonts, Some(dest.width as f32), Some(dest.height as f32));
        buffer.set_text(
            fonts,
            &text.content,
            &Attrs::new().family(Family::SansSerif),
            Shaping::Advanced,
            None,
        );
        buffer.shape_until_scroll(fonts, false);

        let (width, height) = self.image.dimensions();
        let Some((x0, y0, x1, y1)) = area.pixel_span(width, height) else {
            return;
        };
        let image = &mut self.image;
        buffer.draw(
            fonts,
            swash,
            Color::rgba(color[0], color[1], color[2], color[3]),
            |gx, gy, gw, gh, glyph| {
                for dy in 0..gh as i64 {
                    for dx in 0..gw as i64 {
                        let px = dest.x.floor() as i64 + gx as i64 + dx;
                        let py = dest.y.floor() as i64 + gy as i64 + dy;
                        if px < x0 as i64 || py < y0 as i64 || px >= x1 as i64 || py >= y1 as i64 {
                            continue;
                        }
                        let src = Rgba([glyph.r(), glyph.g(), glyph.b(), glyph.a()]);
                        blend(image.get_pixel_mut(px as u32, py as u32), src, opacity);
                    }
                }
            },
        );
    }
}

/// One recorded draw call.
#[derive(Debug, Clone, PartialEq)]
pub enum DrawCommand {
    Clear(Rgba<u8>),
    Image {
        /// Size of the drawn image.
        source_size: (u32, u32),
        /// Top-left pixel of the drawn image, enough to tell sources apart.
        first_pixel: Option<Rgba<u8>>,
        dest: Rect,
        opacity: f64,
        clip: Option<Rect>,
    },
    Text {
        content: String,
        dest: Rect,
        opacity: f64,
        clip: Option<Rect>,
    },
}

/// Surface that only records what was drawn.
#[derive(Debug, Default)]
pub struct RecordingSurface {
    width: u32,
    height: u32,
    commands: Vec<DrawCommand>,
}

impl RecordingSurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            commands: Vec::new(),
        }
    }

    pub fn commands(&self) -> &[DrawCommand] {
        &self.commands
    }

    /// Commands recorded since the last clear.
    pub fn last_frame(&self) -> &[DrawCommand] {
        let start = self
            .commands
            .iter()
            .rposition(|command| matches!(command, DrawCommand::Clear(_)))
            .map(|i| i + 1)
            .unwrap_or(0);
        &self.commands[start..]
    }

    /// Number of frames drawn (one clear per frame).
    pub fn frames(&self) -> usize {
        self.commands
            .iter()
            .filter(|command| matches!(command, DrawCommand::Clear(_)))
            .count()
    }

    pub fn take(&mut self) -> Vec<DrawCommand> {
        std::mem::take(&mut self.commands)
    }
}

impl Surface for RecordingSurface {
    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn clear(&mut self, color: Rgba<u8>) {
        self.commands.push(DrawCommand::Clear(color));
    }

    fn draw_image(&mut self, image: &RgbaImage, dest: Rect, opacity: f64, clip: Option<Rect>) {
        let first_pixel = (image.width() > 0 && image.height() > 0).then(|| *image.get_pixel(0, 0));
        self.commands.push(DrawCommand::Image {
            source_size: image.dimensions(),
            first_pixel,
            dest,
            opacity,
            clip,
        });
    }

    fn draw_text(&mut self, text: &TextStyle, dest: Rect, opacity: f64, clip: Option<Rect>) {
        self.commands.push(DrawCommand::Text {
            content: text.content.clone(),
            dest,
            opacity,
            clip,
        });
    }
}
