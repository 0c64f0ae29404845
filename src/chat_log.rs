//! Chat replay normalization.
//!
//! Accepts YouTube live-chat replay exports (one `replayChatItemAction`
//! object per line, or the same objects in a JSON array) and a plain array of
//! already-normalized events. Only text messages are kept; membership
//! notices, polls and other renderers are skipped.

use std::fs;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{ChatcutError, Result};
use crate::style::Role;

#[derive(Debug, Clone, PartialEq)]
pub enum MessageSegment {
    Text(String),
    /// Emoji image URL, plus the shortcut text used when no image is drawn.
    Emoji { url: String, alt: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatEvent {
    /// Seconds from stream start.
    pub timestamp_offset: f64,
    pub author: String,
    pub role: Role,
    pub message_segments: Vec<MessageSegment>,
    pub avatar_ref: Option<String>,
}

pub fn load_chat_log(path: &Path) -> Result<Vec<ChatEvent>> {
    let raw = fs::read_to_string(path)
        .map_err(|e| ChatcutError::io("failed to read chat log", path, e))?;
    parse_chat_log(&raw, &path.display().to_string())
}

pub fn parse_chat_log(raw: &str, source_name: &str) -> Result<Vec<ChatEvent>> {
    let mut events = Vec::new();

    if raw.trim_start().starts_with('[') {
        let entries: Vec<Value> = serde_json::from_str(raw).map_err(|error| {
            ChatcutError::parse(source_name, error.line(), format!("invalid JSON array: {error}"))
        })?;
        for (idx, entry) in entries.iter().enumerate() {
            collect_entry(entry, source_name, idx + 1, &mut events)?;
        }
    } else {
        for (idx, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: Value = serde_json::from_str(line).map_err(|error| {
                ChatcutError::parse(source_name, idx + 1, format!("invalid JSON line: {error}"))
            })?;
            collect_entry(&entry, source_name, idx + 1, &mut events)?;
        }
    }

    if events.is_empty() {
        return Err(ChatcutError::parse(
            source_name,
            0,
            "no chat messages found. Hint: does the video have a replayable live chat?",
        ));
    }

    // Stable: simultaneous messages keep their log order.
    events.sort_by(|a, b| a.timestamp_offset.total_cmp(&b.timestamp_offset));
    Ok(events)
}

fn collect_entry(
    entry: &Value,
    source_name: &str,
    position: usize,
    events: &mut Vec<ChatEvent>,
) -> Result<()> {
    let is_replay = entry.get("replayChatItemAction").is_some() || entry.get("actions").is_some();
    if !is_replay {
        let record: NormalizedRecord = serde_json::from_value(entry.clone()).map_err(|error| {
            ChatcutError::parse(source_name, position, format!("invalid chat event: {error}"))
        })?;
        if let Some(event) = record.into_event(source_name, position)? {
            events.push(event);
        }
        return Ok(());
    }

    let item = entry.get("replayChatItemAction").unwrap_or(entry);
    let replay: ReplayAction = serde_json::from_value(item.clone()).map_err(|error| {
        ChatcutError::parse(source_name, position, format!("invalid replay action: {error}"))
    })?;
    let offset_ms = replay
        .video_offset_time_msec
        .as_ref()
        .map(|value| parse_offset_ms(value, source_name, position))
        .transpose()?
        .unwrap_or(0);

    if offset_ms < 0 {
        debug!(line = position, offset_ms, "skipping pre-stream chat action");
        return Ok(());
    }

    for action in replay.actions {
        let Some(renderer) = action
            .add_chat_item_action
            .and_then(|add| add.item.live_chat_text_message_renderer)
        else {
            continue;
        };
        events.push(renderer.into_event(offset_ms as f64 / 1000.0));
    }
    Ok(())
}

fn parse_offset_ms(value: &Value, source_name: &str, position: usize) -> Result<i64> {
    let parsed = match value {
        Value::String(text) => text.trim().parse::<i64>().ok(),
        Value::Number(number) => number.as_i64(),
        _ => None,
    };
    parsed.ok_or_else(|| {
        ChatcutError::parse(
            source_name,
            position,
            format!("videoOffsetTimeMsec must be an integer, got {value}"),
        )
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReplayAction {
    #[serde(default)]
    actions: Vec<ReplayItemAction>,
    #[serde(default)]
    video_offset_time_msec: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReplayItemAction {
    #[serde(default)]
    add_chat_item_action: Option<AddChatItemAction>,
}

#[derive(Debug, Deserialize)]
struct AddChatItemAction {
    item: ChatItem,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatItem {
    #[serde(default)]
    live_chat_text_message_renderer: Option<TextMessageRenderer>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TextMessageRenderer {
    #[serde(default)]
    message: Option<Runs>,
    #[serde(default)]
    author_name: Option<SimpleText>,
    #[serde(default)]
    author_photo: Option<Thumbnails>,
    #[serde(default)]
    author_badges: Vec<AuthorBadge>,
}

#[derive(Debug, Deserialize)]
struct Runs {
    #[serde(default)]
    runs: Vec<Run>,
}

#[derive(Debug, Deserialize)]
struct Run {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    emoji: Option<Emoji>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Emoji {
    #[serde(default)]
    emoji_id: Option<String>,
    #[serde(default)]
    shortcuts: Vec<String>,
    #[serde(default)]
    image: Option<Thumbnails>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SimpleText {
    simple_text: String,
}

#[derive(Debug, Deserialize)]
struct Thumbnails {
    #[serde(default)]
    thumbnails: Vec<Thumbnail>,
}

#[derive(Debug, Deserialize)]
struct Thumbnail {
    url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorBadge {
    live_chat_author_badge_renderer: BadgeRenderer,
}

#[derive(Debug, Deserialize)]
struct BadgeRenderer {
    #[serde(default)]
    tooltip: String,
}

impl Thumbnails {
    fn first_url(&self) -> Option<String> {
        self.thumbnails.first().map(|thumb| thumb.url.clone())
    }
}

impl TextMessageRenderer {
    fn into_event(self, timestamp_offset: f64) -> ChatEvent {
        let role = self
            .author_badges
            .iter()
            .map(|badge| Role::from_badge_tooltip(&badge.live_chat_author_badge_renderer.tooltip))
            .max_by_key(|role| role.priority())
            .unwrap_or(Role::Normal);

        let mut message_segments = Vec::new();
        for run in self.message.map(|message| message.runs).unwrap_or_default() {
            if let Some(text) = run.text {
                let text = text.trim();
                if !text.is_empty() {
                    message_segments.push(MessageSegment::Text(text.to_owned()));
                }
            } else if let Some(emoji) = run.emoji {
                let alt = emoji
                    .shortcuts
                    .first()
                    .cloned()
                    .or(emoji.emoji_id)
                    .unwrap_or_default();
                match emoji.image.as_ref().and_then(Thumbnails::first_url) {
                    Some(url) => message_segments.push(MessageSegment::Emoji { url, alt }),
                    None if !alt.is_empty() => message_segments.push(MessageSegment::Text(alt)),
                    None => {}
                }
            }
        }

        ChatEvent {
            timestamp_offset,
            author: self
                .author_name
                .map(|name| name.simple_text)
                .unwrap_or_default(),
            role,
            message_segments,
            avatar_ref: self.author_photo.as_ref().and_then(Thumbnails::first_url),
        }
    }
}

/// Pre-normalized event, for logs produced by other tools and for fixtures.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NormalizedRecord {
    timestamp: f64,
    author: String,
    #[serde(default)]
    role: Role,
    #[serde(default)]
    avatar: Option<String>,
    #[serde(default)]
    segments: Vec<NormalizedSegment>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
enum NormalizedSegment {
    Text(String),
    Emoji(String),
}

impl NormalizedRecord {
    fn into_event(self, source_name: &str, position: usize) -> Result<Option<ChatEvent>> {
        if !self.timestamp.is_finite() {
            return Err(ChatcutError::parse(
                source_name,
                position,
                "timestamp must be a finite number of seconds",
            ));
        }
        if self.timestamp < 0.0 {
            debug!(entry = position, "skipping pre-stream chat event");
            return Ok(None);
        }
        Ok(Some(ChatEvent {
            timestamp_offset: self.timestamp,
            author: self.author,
            role: self.role,
            message_segments: self
                .segments
                .into_iter()
                .map(|segment| match segment {
                    NormalizedSegment::Text(text) => MessageSegment::Text(text),
                    NormalizedSegment::Emoji(url) => MessageSegment::Emoji {
                        url,
                        alt: String::new(),
                    },
                })
                .collect(),
            avatar_ref: self.avatar,
        }))
    }
}
