//! Avatar and emoji resolution.
//!
//! Every image a render needs is resolved and decoded up front into an
//! immutable [`AssetAtlas`], so frame composition never touches the network or
//! the disk. A failed fetch costs one `warn!` and a placeholder, never the job.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use image::imageops::{self, FilterType};
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use tiny_skia::{FillRule, Mask, Paint, PathBuilder, Pixmap, Transform};
use tracing::{debug, info, warn};
use url::Url;

use crate::chat_log::{ChatEvent, MessageSegment};
use crate::config::AssetSettings;
use crate::error::{ChatcutError, Result};
use crate::style::StyleTable;

const PLACEHOLDER_AVATAR: [u8; 4] = [0x71, 0x71, 0x71, 255];

/// Turns an asset reference into a readable local file.
pub trait AssetResolver: Send + Sync {
    fn resolve(&self, url: &str) -> Result<PathBuf>;
}

/// Downloads over HTTP(S) into a content-addressed disk cache.
///
/// Cache entries are named by the SHA-256 of the URL, so a second render of
/// the same chat never hits the network.
pub struct HttpAssetCache {
    client: reqwest::blocking::Client,
    cache_dir: PathBuf,
    // Keeps an anonymous cache alive for the lifetime of the resolver.
    _scratch: Option<tempfile::TempDir>,
}

impl HttpAssetCache {
    pub fn new(settings: &AssetSettings) -> Result<Self> {
        let mut builder = reqwest::blocking::Client::builder()
            .timeout(settings.timeout())
            .user_agent(concat!("chatcut/", env!("CARGO_PKG_VERSION")));
        if let Some(proxy) = &settings.proxy {
            let proxy = reqwest::Proxy::all(proxy.as_str()).map_err(|error| {
                ChatcutError::validation(format!("invalid assets.proxy '{proxy}': {error}"))
            })?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|error| ChatcutError::validation(format!("failed to build HTTP client: {error}")))?;

        let (cache_dir, scratch) = match &settings.cache_dir {
            Some(dir) => {
                fs::create_dir_all(dir)
                    .map_err(|e| ChatcutError::io("failed to create asset cache dir", dir, e))?;
                (dir.clone(), None)
            }
            None => {
                let scratch = tempfile::Builder::new()
                    .prefix("chatcut-assets-")
                    .tempdir()
                    .map_err(|e| ChatcutError::io("failed to create asset cache in", std::env::temp_dir(), e))?;
                (scratch.path().to_path_buf(), Some(scratch))
            }
        };

        Ok(Self {
            client,
            cache_dir,
            _scratch: scratch,
        })
    }

    fn download(&self, url: &Url, dest: &Path) -> Result<()> {
        let fetch_error = |reason: String| ChatcutError::AssetFetch {
            url: url.to_string(),
            reason,
        };
        let response = self
            .client
            .get(url.clone())
            .send()
            .map_err(|error| fetch_error(if error.is_timeout() { "timed out".to_owned() } else { error.to_string() }))?;
        if !response.status().is_success() {
            return Err(fetch_error(format!("HTTP {}", response.status())));
        }
        let bytes = response.bytes().map_err(|error| fetch_error(error.to_string()))?;

        // Write-then-rename so a concurrent or interrupted fetch never leaves a torn entry.
        let mut staged = tempfile::NamedTempFile::new_in(&self.cache_dir)
            .map_err(|e| ChatcutError::io("failed to stage asset in", &self.cache_dir, e))?;
        staged
            .write_all(&bytes)
            .map_err(|e| ChatcutError::io("failed to write asset", dest, e))?;
        staged
            .persist(dest)
            .map_err(|e| ChatcutError::io("failed to store asset", dest, e.error))?;
        debug!(url = %url, bytes = bytes.len(), "cached asset");
        Ok(())
    }
}

impl AssetResolver for HttpAssetCache {
    fn resolve(&self, raw: &str) -> Result<PathBuf> {
        let url = match parse_reference(raw)? {
            Reference::Local(path) => return Ok(path),
            Reference::Remote(url) => url,
        };
        let dest = self.cache_dir.join(cache_key(raw));
        if dest.is_file() {
            return Ok(dest);
        }
        self.download(&url, &dest)?;
        Ok(dest)
    }
}

/// Resolves only local files; every remote reference fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineResolver;

impl AssetResolver for OfflineResolver {
    fn resolve(&self, raw: &str) -> Result<PathBuf> {
        match parse_reference(raw)? {
            Reference::Local(path) => Ok(path),
            Reference::Remote(url) => Err(ChatcutError::AssetFetch {
                url: url.to_string(),
                reason: "offline".to_owned(),
            }),
        }
    }
}

enum Reference {
    Local(PathBuf),
    Remote(Url),
}

fn parse_reference(raw: &str) -> Result<Reference> {
    let not_found = |reason: &str| ChatcutError::AssetFetch {
        url: raw.to_owned(),
        reason: reason.to_owned(),
    };
    match Url::parse(raw) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(Reference::Remote(url)),
        Ok(url) if url.scheme() == "file" => {
            let path = url.to_file_path().map_err(|_| not_found("invalid file URL"))?;
            if path.is_file() {
                Ok(Reference::Local(path))
            } else {
                Err(not_found("file not found"))
            }
        }
        // Drive letters parse as a one-character scheme.
        Ok(url) if url.scheme().len() > 1 => Err(not_found("unsupported URL scheme")),
        _ => {
            let path = PathBuf::from(raw);
            if path.is_file() {
                Ok(Reference::Local(path))
            } else {
                Err(not_found("file not found"))
            }
        }
    }
}

pub fn cache_key(url: &str) -> String {
    format!("{:x}", Sha256::digest(url.as_bytes()))
}

/// Straight-alpha RGBA bitmap, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sprite {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

impl Sprite {
    fn from_pixmap(pixmap: &Pixmap) -> Self {
        let rgba = pixmap
            .pixels()
            .iter()
            .flat_map(|pixel| {
                let color = pixel.demultiply();
                [color.red(), color.green(), color.blue(), color.alpha()]
            })
            .collect();
        Self {
            width: pixmap.width(),
            height: pixmap.height(),
            rgba,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PreloadReport {
    pub loaded: usize,
    pub failed: usize,
}

/// Decoded avatars and emoji, keyed by `(url, size in px)`.
#[derive(Debug, Default)]
pub struct AssetAtlas {
    avatars: HashMap<(String, u32), Sprite>,
    emojis: HashMap<(String, u32), Sprite>,
    placeholders: HashMap<u32, Sprite>,
    skip_avatars: bool,
    skip_emojis: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Kind {
    Avatar,
    Emoji,
}

impl AssetAtlas {
    /// An atlas with nothing loaded: every avatar is a placeholder and every
    /// emoji falls back to its alt text.
    pub fn empty(skip_avatars: bool, skip_emojis: bool) -> Self {
        Self {
            skip_avatars,
            skip_emojis,
            ..Self::default()
        }
    }

    /// Load every sprite the given events reference. Callers pass only the
    /// events that can reach the screen.
    pub fn preload<'a>(
        events: impl IntoIterator<Item = &'a ChatEvent>,
        styles: &StyleTable,
        resolver: &dyn AssetResolver,
        skip_avatars: bool,
        skip_emojis: bool,
    ) -> (Self, PreloadReport) {
        let mut atlas = Self::empty(skip_avatars, skip_emojis);
        let mut wanted = BTreeSet::new();
        let mut avatar_sizes = BTreeSet::new();

        for event in events {
            let style = styles.get(event.role);
            if !skip_avatars && style.avatar_size > 0 {
                avatar_sizes.insert(style.avatar_size);
                if let Some(avatar) = &event.avatar_ref {
                    wanted.insert((Kind::Avatar, avatar.as_str(), style.avatar_size));
                }
            }
            if !skip_emojis && style.emoji_size > 0 {
                for segment in &event.message_segments {
                    if let MessageSegment::Emoji { url, .. } = segment {
                        wanted.insert((Kind::Emoji, url.as_str(), style.emoji_size));
                    }
                }
            }
        }

        for size in avatar_sizes {
            atlas.placeholders.insert(size, placeholder_avatar(size));
        }

        let wanted = wanted.into_iter().collect::<Vec<_>>();
        let loaded = wanted
            .par_iter()
            .map(|&(kind, url, size)| {
                let sprite = resolver
                    .resolve(url)
                    .and_then(|path| decode_sprite(&path, url, size, kind == Kind::Avatar));
                (kind, url, size, sprite)
            })
            .collect::<Vec<_>>();

        let mut report = PreloadReport::default();
        for (kind, url, size, sprite) in loaded {
            match sprite {
                Ok(sprite) => {
                    report.loaded += 1;
                    let key = (url.to_owned(), size);
                    match kind {
                        Kind::Avatar => atlas.avatars.insert(key, sprite),
                        Kind::Emoji => atlas.emojis.insert(key, sprite),
                    };
                }
                Err(error) => {
                    report.failed += 1;
                    warn!(url, %error, "asset unavailable, using placeholder");
                }
            }
        }

        info!(
            loaded = report.loaded,
            failed = report.failed,
            "assets preloaded"
        );
        (atlas, report)
    }

    /// Avatar for `url` at `size`, or the placeholder disc when it failed to load.
    pub fn avatar(&self, url: Option<&str>, size: u32) -> Option<&Sprite> {
        if self.skip_avatars || size == 0 {
            return None;
        }
        url.and_then(|url| self.avatars.get(&(url.to_owned(), size)))
            .or_else(|| self.placeholders.get(&size))
    }

    /// `None` means draw the emoji's alt text instead.
    pub fn emoji(&self, url: &str, size: u32) -> Option<&Sprite> {
        if self.skip_emojis {
            return None;
        }
        self.emojis.get(&(url.to_owned(), size))
    }

    /// Install a placeholder for `size`; used when the atlas was not preloaded.
    pub fn ensure_placeholder(&mut self, size: u32) {
        if size > 0 {
            self.placeholders
                .entry(size)
                .or_insert_with(|| placeholder_avatar(size));
        }
    }
}

fn decode_sprite(path: &Path, url: &str, size: u32, circular: bool) -> Result<Sprite> {
    let decode_error = |reason: String| ChatcutError::AssetFetch {
        url: url.to_owned(),
        reason,
    };
    let bytes = fs::read(path).map_err(|e| decode_error(format!("read {}: {e}", path.display())))?;
    let image = image::load_from_memory(&bytes)
        .map_err(|e| decode_error(format!("decode: {e}")))?
        .to_rgba8();
    let resized = imageops::resize(&image, size, size, FilterType::Triangle);
    let mut rgba = resized.into_raw();

    if circular {
        let mask = circle_mask(size).ok_or_else(|| decode_error("avatar size too small".to_owned()))?;
        for (pixel, coverage) in rgba.chunks_exact_mut(4).zip(mask.data()) {
            pixel[3] = ((u16::from(pixel[3]) * u16::from(*coverage) + 127) / 255) as u8;
        }
    }

    Ok(Sprite {
        width: size,
        height: size,
        rgba,
    })
}

fn circle_path(size: u32) -> Option<tiny_skia::Path> {
    let radius = size as f32 / 2.0;
    PathBuilder::from_circle(radius, radius, radius)
}

fn circle_mask(size: u32) -> Option<Mask> {
    let mut mask = Mask::new(size, size)?;
    mask.fill_path(&circle_path(size)?, FillRule::Winding, true, Transform::identity());
    Some(mask)
}

fn placeholder_avatar(size: u32) -> Sprite {
    let Some(mut pixmap) = Pixmap::new(size, size) else {
        return Sprite {
            width: 0,
            height: 0,
            rgba: Vec::new(),
        };
    };
    if let Some(path) = circle_path(size) {
        let mut paint = Paint::default();
        let [r, g, b, a] = PLACEHOLDER_AVATAR;
        paint.set_color_rgba8(r, g, b, a);
        paint.anti_alias = true;
        pixmap.fill_path(&path, &paint, FillRule::Winding, Transform::identity(), None);
    }
    Sprite::from_pixmap(&pixmap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RenderConfig;
    use crate::style::Role;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TimeoutResolver {
        calls: AtomicUsize,
    }

    impl AssetResolver for TimeoutResolver {
        fn resolve(&self, url: &str) -> Result<PathBuf> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ChatcutError::AssetFetch {
                url: url.to_owned(),
                reason: "timed out".to_owned(),
            })
        }
    }

    fn event(avatar: Option<&str>, emoji: Option<&str>) -> ChatEvent {
        let mut segments = vec![MessageSegment::Text("hi".to_owned())];
        if let Some(url) = emoji {
            segments.push(MessageSegment::Emoji {
                url: url.to_owned(),
                alt: ":wave:".to_owned(),
            });
        }
        ChatEvent {
            timestamp_offset: 0.0,
            author: "viewer".to_owned(),
            role: Role::Normal,
            message_segments: segments,
            avatar_ref: avatar.map(str::to_owned),
        }
    }

    #[test]
    fn cache_key_is_sha256_hex() {
        let key = cache_key("https://yt3.ggpht.com/a.png");
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(key, cache_key("https://yt3.ggpht.com/b.png"));
    }

    #[test]
    fn failed_fetches_fall_back_to_placeholders() {
        let styles = RenderConfig::default().style_table();
        let events = vec![
            event(Some("https://example.invalid/a.png"), Some("https://example.invalid/e.png")),
            event(Some("https://example.invalid/a.png"), None),
        ];
        let resolver = TimeoutResolver {
            calls: AtomicUsize::new(0),
        };
        let (atlas, report) = AssetAtlas::preload(&events, &styles, &resolver, false, false);

        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2, "deduplicated by url and size");
        assert_eq!(report, PreloadReport { loaded: 0, failed: 2 });
        let size = styles.normal.avatar_size;
        let avatar = atlas
            .avatar(Some("https://example.invalid/a.png"), size)
            .expect("placeholder");
        assert_eq!(avatar.width, size);
        assert_eq!(avatar.rgba.len(), (size * size * 4) as usize);
        assert!(atlas.emoji("https://example.invalid/e.png", styles.normal.emoji_size).is_none());
    }

    #[test]
    fn placeholder_is_a_disc() {
        let sprite = placeholder_avatar(24);
        let alpha_at = |x: u32, y: u32| sprite.rgba[((y * 24 + x) * 4 + 3) as usize];
        assert_eq!(alpha_at(12, 12), 255);
        assert_eq!(alpha_at(0, 0), 0);
    }

    #[test]
    fn local_files_decode_with_circular_mask() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("avatar.png");
        image::RgbaImage::from_pixel(8, 8, image::Rgba([200, 10, 10, 255]))
            .save(&path)
            .expect("write png");

        let raw = path.to_string_lossy().into_owned();
        let resolved = OfflineResolver.resolve(&raw).expect("local file");
        let sprite = decode_sprite(&resolved, &raw, 16, true).expect("decodes");
        assert_eq!(sprite.rgba[3], 0, "corner masked out");
        let centre = ((8 * 16 + 8) * 4) as usize;
        assert_eq!(&sprite.rgba[centre..centre + 4], &[200, 10, 10, 255]);

        let error = OfflineResolver
            .resolve("https://example.invalid/x.png")
            .expect_err("remote while offline");
        assert_eq!(error.code(), "ASSET_FETCH_ERROR");
    }

    #[test]
    fn skipped_avatars_resolve_to_nothing() {
        let mut atlas = AssetAtlas::empty(true, false);
        atlas.ensure_placeholder(24);
        assert!(atlas.avatar(None, 24).is_none());
        let mut atlas = AssetAtlas::empty(false, false);
        atlas.ensure_placeholder(24);
        assert!(atlas.avatar(None, 24).is_some());
    }
}
