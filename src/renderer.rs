use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use fontdue::layout::{
    CoordinateSystem, GlyphRasterConfig, HorizontalAlign, Layout, LayoutSettings, TextStyle,
    VerticalAlign, WrapStyle,
};
use fontdue::{Font, FontSettings};
use tracing::warn;

use crate::assets::{AssetAtlas, Sprite};
use crate::chat_log::{ChatEvent, MessageSegment};
use crate::config::RenderConfig;
use crate::error::{ChatcutError, Result};
use crate::style::{Rgba, RoleStyle, StyleTable};
use crate::window::FrameState;

/// One composed frame: `width * height` straight-alpha RGBA pixels, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBuffer {
    pub frame_index: u64,
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl FrameBuffer {
    pub fn into_pixels(self) -> Vec<u8> {
        self.pixels
    }
}

#[derive(Debug, Clone)]
struct GlyphBitmap {
    width: usize,
    height: usize,
    bitmap: Vec<u8>,
}

enum Face {
    Font(Box<Font>),
    /// Solid boxes with fixed proportions, used when no font file is available.
    Boxes,
}

struct TextPainter {
    face: Face,
    glyph_cache: Mutex<HashMap<GlyphRasterConfig, GlyphBitmap>>,
}

impl TextPainter {
    fn new(face: Face) -> Self {
        Self {
            face,
            glyph_cache: Mutex::new(HashMap::new()),
        }
    }

    fn is_fallback(&self) -> bool {
        matches!(self.face, Face::Boxes)
    }

    fn measure(&self, text: &str, size: f32) -> u32 {
        match &self.face {
            Face::Font(font) => text
                .chars()
                .map(|ch| font.metrics(ch, size).advance_width)
                .sum::<f32>()
                .ceil() as u32,
            Face::Boxes => text.chars().map(|ch| box_advance(ch, size)).sum(),
        }
    }

    fn space_width(&self, size: f32) -> u32 {
        self.measure(" ", size)
    }

    fn draw(
        &self,
        canvas: &mut Canvas<'_>,
        x: i32,
        y: i32,
        text: &str,
        size: f32,
        color: Rgba,
        outline: Outline,
    ) {
        let glyphs = self.glyphs(x, y, text, size);
        if outline.width > 0 {
            let w = outline.width as i32;
            for (gx, gy, glyph) in &glyphs {
                for dy in -w..=w {
                    for dx in -w..=w {
                        if (dx != 0 || dy != 0) && dx * dx + dy * dy <= w * w {
                            canvas.blend_mask(gx + dx, gy + dy, glyph, outline.color);
                        }
                    }
                }
            }
        }
        for (gx, gy, glyph) in &glyphs {
            canvas.blend_mask(*gx, *gy, glyph, color);
        }
    }

    fn glyphs(&self, x: i32, y: i32, text: &str, size: f32) -> Vec<(i32, i32, GlyphBitmap)> {
        match &self.face {
            Face::Font(font) => {
                let mut layout = Layout::new(CoordinateSystem::PositiveYDown);
                layout.reset(&LayoutSettings {
                    x: x as f32,
                    y: y as f32,
                    max_width: None,
                    max_height: None,
                    horizontal_align: HorizontalAlign::Left,
                    vertical_align: VerticalAlign::Top,
                    line_height: 1.0,
                    wrap_style: WrapStyle::Letter,
                    wrap_hard_breaks: false,
                });
                layout.append(&[font.as_ref()], &TextStyle::new(text, size, 0));

                let mut cache = self
                    .glyph_cache
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                layout
                    .glyphs()
                    .iter()
                    .filter(|glyph| glyph.width > 0 && glyph.height > 0)
                    .map(|glyph| {
                        let bitmap = cache
                            .entry(glyph.key)
                            .or_insert_with(|| {
                                let (_, bitmap) = font.rasterize_config(glyph.key);
                                GlyphBitmap {
                                    width: glyph.width,
                                    height: glyph.height,
                                    bitmap,
                                }
                            })
                            .clone();
                        (glyph.x.round() as i32, glyph.y.round() as i32, bitmap)
                    })
                    .collect()
            }
            Face::Boxes => {
                let mut pen = x;
                let box_height = (size * 0.7).round().max(1.0) as usize;
                let top = y + (size * 0.2).round() as i32;
                text.chars()
                    .filter_map(|ch| {
                        let advance = box_advance(ch, size) as i32;
                        let at = pen;
                        pen += advance;
                        if ch.is_whitespace() {
                            return None;
                        }
                        let width = (advance - 1).max(1) as usize;
                        Some((
                            at,
                            top,
                            GlyphBitmap {
                                width,
                                height: box_height,
                                bitmap: vec![255; width * box_height],
                            },
                        ))
                    })
                    .collect()
            }
        }
    }
}

fn box_advance(ch: char, size: f32) -> u32 {
    let factor = if ch.is_whitespace() { 0.3 } else { 0.6 };
    (size * factor).round().max(1.0) as u32
}

/// Author and message faces.
pub struct FontSet {
    author: TextPainter,
    message: TextPainter,
}

impl FontSet {
    /// Deterministic box glyphs for both faces.
    pub fn fallback() -> Self {
        Self {
            author: TextPainter::new(Face::Boxes),
            message: TextPainter::new(Face::Boxes),
        }
    }

    /// Load TTF/OTF faces. A missing or unreadable file degrades that face to
    /// box glyphs with a warning. An author face falls back to the message face.
    pub fn load(author: Option<&Path>, message: Option<&Path>) -> Self {
        let message_font = message.and_then(load_font);
        let author_font = author.and_then(load_font).or_else(|| message_font.clone());
        let face = |font: Option<Font>| match font {
            Some(font) => Face::Font(Box::new(font)),
            None => Face::Boxes,
        };
        Self {
            author: TextPainter::new(face(author_font)),
            message: TextPainter::new(face(message_font)),
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.author.is_fallback() && self.message.is_fallback()
    }
}

fn load_font(path: &Path) -> Option<Font> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(error) => {
            warn!(path = %path.display(), %error, "font unreadable, using box glyphs");
            return None;
        }
    };
    match Font::from_bytes(bytes, FontSettings::default()) {
        Ok(font) => Some(font),
        Err(error) => {
            warn!(path = %path.display(), error, "font unparseable, using box glyphs");
            None
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Outline {
    width: u32,
    color: Rgba,
}

struct Canvas<'a> {
    pixels: &'a mut [u8],
    width: u32,
    height: u32,
}

impl Canvas<'_> {
    fn blend_at(&mut self, x: i32, y: i32, color: [u8; 4]) {
        let (Ok(x), Ok(y)) = (usize::try_from(x), usize::try_from(y)) else {
            return;
        };
        let (width, height) = (self.width as usize, self.height as usize);
        if x >= width || y >= height {
            return;
        }
        let idx = (y * width + x) * 4;
        blend_pixel(&mut self.pixels[idx..idx + 4], color);
    }

    fn blend_mask(&mut self, x: i32, y: i32, glyph: &GlyphBitmap, color: Rgba) {
        let [r, g, b, a] = color.0;
        for row in 0..glyph.height {
            for col in 0..glyph.width {
                let mask = glyph.bitmap[row * glyph.width + col];
                if mask == 0 {
                    continue;
                }
                let alpha = ((u16::from(mask) * u16::from(a)) / 255) as u8;
                self.blend_at(x + col as i32, y + row as i32, [r, g, b, alpha]);
            }
        }
    }

    fn blit(&mut self, x: i32, y: i32, sprite: &Sprite) {
        for row in 0..sprite.height {
            for col in 0..sprite.width {
                let idx = (row as usize * sprite.width as usize + col as usize) * 4;
                let px = &sprite.rgba[idx..idx + 4];
                self.blend_at(
                    x + col as i32,
                    y + row as i32,
                    [px[0], px[1], px[2], px[3]],
                );
            }
        }
    }
}

/// Source-over for straight alpha. Reduces to a plain lerp on opaque destinations.
fn blend_pixel(dst: &mut [u8], src: [u8; 4]) {
    let sa = u32::from(src[3]);
    if sa == 0 {
        return;
    }
    let da = u32::from(dst[3]);
    let inv = 255 - sa;
    let out_a = (sa * 255 + da * inv + 127) / 255;
    if out_a == 0 {
        return;
    }
    let denom = out_a * 255;
    for channel in 0..3 {
        let sc = u32::from(src[channel]);
        let dc = u32::from(dst[channel]);
        dst[channel] = ((sc * sa * 255 + dc * da * inv + denom / 2) / denom).min(255) as u8;
    }
    dst[3] = out_a.min(255) as u8;
}

enum RunKind<'a> {
    Word(&'a str),
    Emoji(&'a Sprite),
}

struct Run<'a> {
    x: i32,
    line: u32,
    kind: RunKind<'a>,
}

struct MessageLayout<'a> {
    event: &'a ChatEvent,
    style: &'a RoleStyle,
    height: u32,
    avatar: Option<(&'a Sprite, i32, i32)>,
    author_x: i32,
    author_y: i32,
    runs_y: i32,
    runs: Vec<Run<'a>>,
}

/// Turns window states into pixels. Holds only immutable inputs, so frames
/// can be composed concurrently and in any order.
pub struct FrameRenderer {
    width: u32,
    height: u32,
    background: [u8; 4],
    outline: Outline,
    clip_at_top: bool,
    styles: StyleTable,
    avatar_gap: u32,
    author_gap: u32,
    padding_v: u32,
    fonts: FontSet,
    atlas: AssetAtlas,
}

impl FrameRenderer {
    pub fn new(config: &RenderConfig, fonts: FontSet, mut atlas: AssetAtlas) -> Self {
        let styles = config.style_table();
        for (_, style) in styles.iter() {
            atlas.ensure_placeholder(style.avatar_size);
        }
        let background = if config.transparent {
            Rgba::TRANSPARENT.0
        } else {
            let [r, g, b, _] = config.background.0;
            [r, g, b, 255]
        };
        Self {
            width: config.resolution.width,
            height: config.resolution.height,
            background,
            outline: Outline {
                width: config.scaled_outline_width(),
                color: config.outline_color,
            },
            clip_at_top: config.clip_at_top,
            styles,
            avatar_gap: config.scale(16),
            author_gap: config.scale(8),
            padding_v: config.scale(4),
            fonts,
            atlas,
        }
    }

    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }

    pub fn blank(&self, frame_index: u64) -> FrameBuffer {
        FrameBuffer {
            frame_index,
            width: self.width,
            height: self.height,
            pixels: self.background.repeat(self.width as usize * self.height as usize),
        }
    }

    /// Compose one frame. Output depends only on `state` and the renderer's
    /// construction inputs.
    pub fn compose(&self, state: &FrameState<'_>) -> Result<FrameBuffer> {
        let mut frame = self.blank(state.frame_index);
        let mut canvas = Canvas {
            pixels: &mut frame.pixels,
            width: self.width,
            height: self.height,
        };

        let mut layouts = Vec::new();
        let mut shift = 0;
        let mut y = self.height as i32;
        for (idx, line) in state.lines.iter().enumerate() {
            let layout = self.layout_message(line.event);
            if idx == 0 {
                // The newest message slides up from below while the scroll eases in.
                shift = (state.pending_scroll() * layout.height as f32).round() as i32;
                y += shift;
            }
            let height = layout.height as i32;
            if !self.clip_at_top && y - height < 0 {
                break;
            }
            layouts.push(layout);
            y -= height;
            if y < 0 {
                break;
            }
        }

        let mut top = self.height as i32 + shift;
        for layout in &layouts {
            top -= layout.height as i32;
            self.draw_message(&mut canvas, layout, top);
        }

        if frame.pixels.len() != self.frame_len() {
            return Err(ChatcutError::encoding(format!(
                "frame {} has {} bytes, expected {}",
                state.frame_index,
                frame.pixels.len(),
                self.frame_len()
            )));
        }
        Ok(frame)
    }

    fn layout_message<'a>(&'a self, event: &'a ChatEvent) -> MessageLayout<'a> {
        let style = self.styles.get(event.role);
        let padding = style.padding as i32;
        let right_edge = self.width as i32 - padding;
        let avatar = self
            .atlas
            .avatar(event.avatar_ref.as_deref(), style.avatar_size);

        let avatar_x = padding;
        let author_x = match avatar {
            Some(_) => avatar_x + (style.avatar_size + self.avatar_gap) as i32,
            None => avatar_x,
        };
        let author_size = style.author_font_size as f32;
        let message_size = style.message_font_size as f32;
        let author_width =
            self.fonts.author.measure(&event.author, author_size) + self.outline.width * 2;
        let space = self.fonts.message.space_width(message_size) as i32;

        let mut runs = Vec::new();
        let mut pen = author_x + (author_width + self.author_gap) as i32;
        let mut line = 0;
        let mut place = |width: i32, kind: RunKind<'a>, pen: &mut i32, line: &mut u32| {
            if *pen + width > right_edge && *pen > author_x {
                *line += 1;
                *pen = author_x;
            }
            runs.push(Run {
                x: *pen,
                line: *line,
                kind,
            });
            *pen += width;
        };

        for segment in &event.message_segments {
            match segment {
                MessageSegment::Text(text) => {
                    for word in text.split(' ').filter(|word| !word.is_empty()) {
                        let width = self.fonts.message.measure(word, message_size) as i32 + space;
                        place(width, RunKind::Word(word), &mut pen, &mut line);
                    }
                }
                MessageSegment::Emoji { url, alt } => {
                    match self.atlas.emoji(url, style.emoji_size) {
                        Some(sprite) => {
                            place(
                                sprite.width as i32,
                                RunKind::Emoji(sprite),
                                &mut pen,
                                &mut line,
                            );
                        }
                        None if !alt.is_empty() => {
                            let width =
                                self.fonts.message.measure(alt, message_size) as i32 + space;
                            place(width, RunKind::Word(alt), &mut pen, &mut line);
                        }
                        None => {}
                    }
                }
            }
        }

        let pv = self.padding_v;
        let (height, author_y, runs_y) = if line == 0 {
            let avatar_height = if avatar.is_some() { style.avatar_size } else { 0 };
            let content = avatar_height
                .max(style.author_font_size)
                .max(style.message_font_size);
            let height = content + pv * 2;
            (
                height,
                (height.saturating_sub(style.author_font_size) / 2) as i32,
                (height.saturating_sub(style.message_font_size) / 2) as i32,
            )
        } else {
            ((line + 1) * style.line_height + pv * 2, pv as i32, pv as i32)
        };

        MessageLayout {
            event,
            style,
            height,
            avatar: avatar.map(|sprite| (sprite, avatar_x, pv as i32)),
            author_x,
            author_y,
            runs_y,
            runs,
        }
    }

    fn draw_message(&self, canvas: &mut Canvas<'_>, layout: &MessageLayout<'_>, top: i32) {
        let style = layout.style;
        if let Some((sprite, x, y)) = layout.avatar {
            canvas.blit(x, top + y, sprite);
        }
        self.fonts.author.draw(
            canvas,
            layout.author_x,
            top + layout.author_y,
            &layout.event.author,
            style.author_font_size as f32,
            style.author_color,
            self.outline,
        );
        for run in &layout.runs {
            let y = top + layout.runs_y + (run.line * style.line_height) as i32;
            match run.kind {
                RunKind::Word(word) => self.fonts.message.draw(
                    canvas,
                    run.x,
                    y,
                    word,
                    style.message_font_size as f32,
                    style.message_color,
                    self.outline,
                ),
                RunKind::Emoji(sprite) => canvas.blit(run.x, y, sprite),
            }
        }
    }
}
