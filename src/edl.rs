//! CMX3600 edit decision list parsing.
//!
//! Event lines look like
//!
//! ```text
//! 001  AX       V     C        00:00:00:00 00:00:03:00 01:00:00:00 01:00:03:00
//! 002  AX       V     D    030 00:00:08:00 00:00:12:00 01:00:03:00 01:00:07:00
//! * FROM CLIP NAME: stream.mkv
//! ```
//!
//! Dissolves and wipes carry a duration column before the timecodes. They are
//! kept as distinct transition kinds, but the timeline treats every boundary
//! as a hard cut.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Serialize;
use tracing::debug;

use crate::error::{ChatcutError, Result};
use crate::timecode::timecode_to_seconds;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Cut,
    Dissolve,
    Wipe,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EdlClip {
    pub event_number: u32,
    pub reel: String,
    pub clip_name: String,
    pub transition: Transition,
    pub source_in: f64,
    pub source_out: f64,
    pub record_in: f64,
    pub record_out: f64,
}

impl EdlClip {
    pub fn record_duration(&self) -> f64 {
        self.record_out - self.record_in
    }
}

#[derive(Debug, Clone, Default)]
pub struct EdlDocument {
    pub title: Option<String>,
    pub clips: Vec<EdlClip>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClipUsage {
    pub clip_name: String,
    pub events: usize,
}

pub fn load_edl(path: &Path, fps: f64) -> Result<EdlDocument> {
    let raw = fs::read_to_string(path).map_err(|e| ChatcutError::io("failed to read EDL", path, e))?;
    parse_edl(&raw, fps, &path.display().to_string())
}

pub fn parse_edl(raw: &str, fps: f64, source_name: &str) -> Result<EdlDocument> {
    let mut document = EdlDocument::default();
    let mut pending: Vec<PendingEvent> = Vec::new();

    for (idx, line) in raw.lines().enumerate() {
        let line_number = idx + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if let Some(title) = trimmed.strip_prefix("TITLE:") {
            document.title = Some(title.trim().to_owned());
            continue;
        }
        if trimmed.starts_with("FCM:") || trimmed.starts_with("M2") {
            continue;
        }

        if let Some(comment) = trimmed.strip_prefix('*') {
            apply_comment(comment.trim(), &mut pending);
            continue;
        }

        let starts_with_event_number = trimmed
            .split_whitespace()
            .next()
            .is_some_and(|token| token.chars().all(|c| c.is_ascii_digit()));
        if !starts_with_event_number {
            debug!(line = line_number, "skipping unrecognized EDL line");
            continue;
        }

        let event = parse_event_line(trimmed, fps, source_name, line_number)?;
        let continues_event = pending
            .last()
            .is_some_and(|last| last.clip.event_number == event.clip.event_number);
        if !continues_event {
            flush_pending(&mut pending, &mut document.clips);
        }
        pending.push(event);
    }

    flush_pending(&mut pending, &mut document.clips);
    Ok(document)
}

/// Distinct clip names with their event counts, most used first.
pub fn summarize_clip_names(clips: &[EdlClip]) -> Vec<ClipUsage> {
    let mut counts = BTreeMap::<&str, usize>::new();
    for clip in clips {
        *counts.entry(clip.clip_name.as_str()).or_default() += 1;
    }
    let mut usage = counts
        .into_iter()
        .map(|(name, events)| ClipUsage {
            clip_name: name.to_owned(),
            events,
        })
        .collect::<Vec<_>>();
    usage.sort_by(|a, b| b.events.cmp(&a.events).then_with(|| a.clip_name.cmp(&b.clip_name)));
    usage
}

#[derive(Debug)]
struct PendingEvent {
    clip: EdlClip,
    named: bool,
    is_video: bool,
    line_number: usize,
}

fn parse_event_line(
    line: &str,
    fps: f64,
    source_name: &str,
    line_number: usize,
) -> Result<PendingEvent> {
    let parts = line.split_whitespace().collect::<Vec<_>>();
    let fail = |message: String| ChatcutError::parse(source_name, line_number, message);

    if parts.len() < 8 {
        return Err(fail(format!(
            "event line has {} fields, expected at least 8 (NUM REEL TRACK TRANS SRC_IN SRC_OUT REC_IN REC_OUT)",
            parts.len()
        )));
    }

    let event_number = parts[0]
        .parse::<u32>()
        .map_err(|_| fail(format!("invalid event number '{}'", parts[0])))?;
    let reel = parts[1].to_owned();
    let track = parts[2];

    let transition_raw = parts[3].to_ascii_uppercase();
    let (transition, timecode_start) = if transition_raw == "C" {
        (Transition::Cut, 4)
    } else if transition_raw == "D" {
        (Transition::Dissolve, 5)
    } else if transition_raw.starts_with('W') {
        (Transition::Wipe, 5)
    } else {
        return Err(fail(format!(
            "unsupported transition '{}'. Hint: expected C, D, or W###",
            parts[3]
        )));
    };

    if parts.len() < timecode_start + 4 {
        return Err(fail(format!(
            "event {event_number} is missing timecodes: expected 4 after the transition field"
        )));
    }

    let mut times = [0.0_f64; 4];
    for (slot, raw) in times.iter_mut().zip(&parts[timecode_start..timecode_start + 4]) {
        *slot = timecode_to_seconds(raw, fps).map_err(&fail)?;
    }
    let [source_in, source_out, record_in, record_out] = times;

    if source_out < source_in || record_out < record_in {
        return Err(fail(format!(
            "event {event_number} has an out point before its in point"
        )));
    }

    Ok(PendingEvent {
        clip: EdlClip {
            event_number,
            clip_name: reel.clone(),
            reel,
            transition,
            source_in,
            source_out,
            record_in,
            record_out,
        },
        named: false,
        is_video: is_video_track(track),
        line_number,
    })
}

fn is_video_track(track: &str) -> bool {
    let track = track.to_ascii_uppercase();
    track.starts_with('V') || track == "B" || track.ends_with("/V")
}

fn apply_comment(comment: &str, pending: &mut [PendingEvent]) {
    let (target, name) = if let Some(name) = comment.strip_prefix("FROM CLIP NAME:") {
        (pending.iter_mut().find(|event| !event.named), name)
    } else if let Some(name) = comment.strip_prefix("TO CLIP NAME:") {
        (pending.last_mut(), name)
    } else {
        return;
    };

    let name = name.trim();
    if let Some(event) = target {
        if !name.is_empty() {
            event.clip.clip_name = name.to_owned();
            event.named = true;
        }
    }
}

fn flush_pending(pending: &mut Vec<PendingEvent>, clips: &mut Vec<EdlClip>) {
    for event in pending.drain(..) {
        if !event.is_video {
            continue;
        }
        // The outgoing half of a dissolve pair is zero length; it contributes no frames.
        if event.clip.source_out <= event.clip.source_in
            || event.clip.record_out <= event.clip.record_in
        {
            debug!(
                line = event.line_number,
                event = event.clip.event_number,
                "dropping zero-length EDL event"
            );
            continue;
        }
        clips.push(event.clip);
    }
}
