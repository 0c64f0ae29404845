use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ChatcutError, Result};
use crate::style::{Rgba, Role, RoleStyle, StyleTable};

/// Largest accepted frame side, in pixels.
pub const MAX_DIMENSION: u32 = 16_384;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RenderConfig {
    pub resolution: Resolution,
    pub fps: u32,
    pub codec: Codec,
    pub transparent: bool,
    pub hwaccel: bool,
    pub background: Rgba,
    pub outline_color: Rgba,
    pub outline_width: u32,
    /// Multiplies every pixel size in `style` and `roles`.
    pub chat_scale: f32,
    pub style: BaseStyle,
    pub roles: RoleOverrides,
    pub retention: Retention,
    pub skip_avatars: bool,
    pub skip_emojis: bool,
    /// Draw the partially visible top message cut off instead of dropping it.
    pub clip_at_top: bool,
    /// Frames a new message takes to slide in. 0 = jump.
    pub scroll_frames: u32,
    pub author_font: Option<PathBuf>,
    pub message_font: Option<PathBuf>,
    pub assets: AssetSettings,
    /// Depth of the bounded frame queue in front of the encoder.
    pub queue_depth: usize,
    /// Worker threads for frame composition. `None` = one per core.
    pub render_threads: Option<usize>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            resolution: Resolution {
                width: 400,
                height: 540,
            },
            fps: 60,
            codec: Codec::H264,
            transparent: false,
            hwaccel: false,
            background: Rgba::rgb(0x0f, 0x0f, 0x0f),
            outline_color: Rgba::BLACK,
            outline_width: 1,
            chat_scale: 1.0,
            style: BaseStyle::default(),
            roles: RoleOverrides::default(),
            retention: Retention::default(),
            skip_avatars: false,
            skip_emojis: false,
            clip_at_top: false,
            scroll_frames: 6,
            author_font: None,
            message_font: None,
            assets: AssetSettings::default(),
            queue_depth: 8,
            render_threads: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    H264,
    #[serde(alias = "h265")]
    Hevc,
    #[serde(alias = "prores")]
    Prores4444,
    Av1,
}

impl Codec {
    pub fn supports_alpha(self) -> bool {
        matches!(self, Codec::Hevc | Codec::Prores4444)
    }

    /// 4:2:0 codecs subsample chroma in both axes; ProRes 4:2:2 only horizontally.
    pub fn requires_even_width(self) -> bool {
        true
    }

    pub fn requires_even_height(self) -> bool {
        !matches!(self, Codec::Prores4444)
    }

    pub fn label(self) -> &'static str {
        match self {
            Codec::H264 => "h264",
            Codec::Hevc => "hevc",
            Codec::Prores4444 => "prores4444",
            Codec::Av1 => "av1",
        }
    }
}

impl std::str::FromStr for Codec {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "h264" => Ok(Codec::H264),
            "hevc" | "h265" => Ok(Codec::Hevc),
            "prores" | "prores4444" => Ok(Codec::Prores4444),
            "av1" => Ok(Codec::Av1),
            other => Err(format!(
                "unknown codec '{other}'. Supported: h264, hevc, prores4444, av1"
            )),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BaseStyle {
    pub author_font_size: u32,
    pub message_font_size: u32,
    pub line_height: u32,
    pub avatar_size: u32,
    pub emoji_size: u32,
    pub padding: u32,
    pub message_color: Rgba,
    pub color_owner: Rgba,
    pub color_moderator: Rgba,
    pub color_member: Rgba,
    pub color_normal: Rgba,
}

impl Default for BaseStyle {
    fn default() -> Self {
        Self {
            author_font_size: 13,
            message_font_size: 13,
            line_height: 16,
            avatar_size: 24,
            emoji_size: 16,
            padding: 24,
            message_color: Rgba::WHITE,
            color_owner: Rgba::rgb(0xff, 0xd6, 0x00),
            color_moderator: Rgba::rgb(0x5e, 0x84, 0xf1),
            color_member: Rgba::rgb(0x2b, 0xa6, 0x40),
            color_normal: Rgba::WHITE,
        }
    }
}

/// Per-role overrides; unset fields fall back to `BaseStyle`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RoleOverride {
    pub author_color: Option<Rgba>,
    pub message_color: Option<Rgba>,
    pub author_font_size: Option<u32>,
    pub message_font_size: Option<u32>,
    pub line_height: Option<u32>,
    pub avatar_size: Option<u32>,
    pub emoji_size: Option<u32>,
    pub padding: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RoleOverrides {
    pub owner: RoleOverride,
    pub moderator: RoleOverride,
    pub member: RoleOverride,
    pub normal: RoleOverride,
}

impl RoleOverrides {
    pub fn get(&self, role: Role) -> &RoleOverride {
        match role {
            Role::Owner => &self.owner,
            Role::Moderator => &self.moderator,
            Role::Member => &self.member,
            Role::Normal => &self.normal,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Retention {
    pub max_lines: usize,
    /// Seconds of output time a message stays visible. `None` = forever.
    pub max_age: Option<f64>,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            max_lines: 100,
            max_age: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AssetSettings {
    /// Disk cache for downloaded avatars/emoji. `None` = in-memory only.
    pub cache_dir: Option<PathBuf>,
    pub timeout_secs: f64,
    pub proxy: Option<String>,
}

impl Default for AssetSettings {
    fn default() -> Self {
        Self {
            cache_dir: None,
            timeout_secs: 10.0,
            proxy: None,
        }
    }
}

impl AssetSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs.max(0.0))
    }
}

impl RenderConfig {
    /// Reject configurations the encoder would choke on, before any work starts.
    pub fn validate(&self) -> Result<()> {
        let Resolution { width, height } = self.resolution;
        if width == 0 || height == 0 {
            return Err(ChatcutError::validation(format!(
                "resolution must be positive, got {width}x{height}"
            )));
        }
        if width > MAX_DIMENSION || height > MAX_DIMENSION {
            return Err(ChatcutError::validation(format!(
                "resolution {width}x{height} exceeds {MAX_DIMENSION} pixels per side"
            )));
        }
        if self.fps == 0 {
            return Err(ChatcutError::validation("fps must be > 0"));
        }
        if !self.chat_scale.is_finite() || self.chat_scale <= 0.0 {
            return Err(ChatcutError::validation(format!(
                "chat_scale must be > 0, got {}",
                self.chat_scale
            )));
        }
        if self.retention.max_lines == 0 {
            return Err(ChatcutError::validation("retention.max_lines must be > 0"));
        }
        if let Some(max_age) = self.retention.max_age {
            if !max_age.is_finite() || max_age <= 0.0 {
                return Err(ChatcutError::validation(format!(
                    "retention.max_age must be > 0 seconds, got {max_age}"
                )));
            }
        }
        if self.queue_depth == 0 {
            return Err(ChatcutError::validation("queue_depth must be > 0"));
        }
        if self.render_threads == Some(0) {
            return Err(ChatcutError::validation("render_threads must be > 0"));
        }
        if !self.assets.timeout_secs.is_finite() || self.assets.timeout_secs <= 0.0 {
            return Err(ChatcutError::validation("assets.timeout_secs must be > 0"));
        }
        validate_codec(self.codec, self.transparent, width, height)
    }

    pub fn frame_len(&self) -> usize {
        self.resolution.width as usize * self.resolution.height as usize * 4
    }

    pub fn style_table(&self) -> StyleTable {
        let resolve = |role: Role| self.resolve_role(role);
        StyleTable {
            owner: resolve(Role::Owner),
            moderator: resolve(Role::Moderator),
            member: resolve(Role::Member),
            normal: resolve(Role::Normal),
        }
    }

    pub fn scaled_outline_width(&self) -> u32 {
        self.scale(self.outline_width)
    }

    pub fn scale(&self, value: u32) -> u32 {
        (value as f32 * self.chat_scale) as u32
    }

    fn resolve_role(&self, role: Role) -> RoleStyle {
        let base = &self.style;
        let role_override = self.roles.get(role);
        let author_color = match role {
            Role::Owner => base.color_owner,
            Role::Moderator => base.color_moderator,
            Role::Member => base.color_member,
            Role::Normal => base.color_normal,
        };
        let size = |value: Option<u32>, fallback: u32| self.scale(value.unwrap_or(fallback));

        RoleStyle {
            author_color: role_override.author_color.unwrap_or(author_color),
            message_color: role_override.message_color.unwrap_or(base.message_color),
            author_font_size: size(role_override.author_font_size, base.author_font_size),
            message_font_size: size(role_override.message_font_size, base.message_font_size),
            line_height: size(role_override.line_height, base.line_height),
            avatar_size: size(role_override.avatar_size, base.avatar_size),
            emoji_size: size(role_override.emoji_size, base.emoji_size),
            padding: size(role_override.padding, base.padding),
        }
    }
}

pub fn validate_codec(codec: Codec, transparent: bool, width: u32, height: u32) -> Result<()> {
    if transparent && !codec.supports_alpha() {
        return Err(ChatcutError::validation(format!(
            "codec {} cannot carry an alpha channel. Hint: use hevc or prores4444 for transparent output",
            codec.label()
        )));
    }
    if codec.requires_even_width() && width % 2 != 0 {
        return Err(ChatcutError::validation(format!(
            "codec {} requires an even width, got {width}",
            codec.label()
        )));
    }
    if codec.requires_even_height() && height % 2 != 0 {
        return Err(ChatcutError::validation(format!(
            "codec {} requires an even height, got {height}",
            codec.label()
        )));
    }
    Ok(())
}

/// Load a YAML (or JSON) render config. Missing keys take defaults.
pub fn load_render_config(path: &Path) -> Result<RenderConfig> {
    let contents = fs::read_to_string(path)
        .map_err(|e| ChatcutError::io("failed to read render config", path, e))?;
    let config: RenderConfig = serde_yaml::from_str(&contents).map_err(|error| {
        let line = error.location().map(|location| location.line()).unwrap_or(0);
        ChatcutError::parse(path.display().to_string(), line, error.to_string())
    })?;
    Ok(config)
}
