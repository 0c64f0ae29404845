//! Mapping between the edited output timeline and the original recording.
//!
//! Record time is the position in the editor's program; source time is the
//! position in the raw stream the chat log was captured against. Output
//! frame `i` sits at record time `origin + i / fps`, where `origin` is the
//! first record timecode of the EDL (programs commonly start at 01:00:00:00).

use crate::edl::EdlClip;
use crate::error::{ChatcutError, Result};

/// Fraction of a frame absorbed when snapping record times to frames.
const FRAME_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimelineSegment {
    /// Record-time start, inclusive.
    pub output_start: f64,
    /// Record-time end, exclusive.
    pub output_end: f64,
    pub source_start: f64,
    /// Index into the clip list the segment was derived from.
    pub clip_index: usize,
}

impl TimelineSegment {
    pub fn duration(&self) -> f64 {
        self.output_end - self.output_start
    }

    pub fn source_end(&self) -> f64 {
        self.source_start + self.duration()
    }
}

#[derive(Debug, Clone)]
pub struct Timeline {
    origin: f64,
    segments: Vec<TimelineSegment>,
}

/// Build the resynchronized timeline for `target_clip_name`.
///
/// Each matching clip becomes one segment, in record order. Adjacent clips
/// are never merged, so a later stage can still see every cut.
pub fn build_segments(clips: &[EdlClip], target_clip_name: &str, fps: f64) -> Result<Timeline> {
    if !fps.is_finite() || fps <= 0.0 {
        return Err(ChatcutError::validation(format!("fps must be > 0, got {fps}")));
    }

    let mut segments = clips
        .iter()
        .enumerate()
        .filter(|(_, clip)| clip.clip_name == target_clip_name)
        .map(|(clip_index, clip)| TimelineSegment {
            output_start: clip.record_in,
            output_end: clip.record_out,
            source_start: clip.source_in,
            clip_index,
        })
        .collect::<Vec<_>>();

    if segments.is_empty() {
        let mut names = clips
            .iter()
            .map(|clip| clip.clip_name.as_str())
            .collect::<Vec<_>>();
        names.sort_unstable();
        names.dedup();
        return Err(ChatcutError::NoMatch {
            clip_name: target_clip_name.to_owned(),
            available: if names.is_empty() {
                "none".to_owned()
            } else {
                names.join(", ")
            },
        });
    }

    segments.sort_by(|a, b| a.output_start.total_cmp(&b.output_start));

    // Timecodes are frame quantized, so any genuine overlap is at least one frame.
    let tolerance = 0.5 / fps;
    for pair in segments.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        if next.output_start < prev.output_end - tolerance {
            let prev_clip = &clips[prev.clip_index];
            let next_clip = &clips[next.clip_index];
            return Err(ChatcutError::validation(format!(
                "EDL events {} and {} overlap in record time ({:.3}s..{:.3}s vs {:.3}s..{:.3}s)",
                prev_clip.event_number,
                next_clip.event_number,
                prev.output_start,
                prev.output_end,
                next.output_start,
                next.output_end
            )));
        }
    }

    let origin = clips
        .iter()
        .map(|clip| clip.record_in)
        .fold(f64::INFINITY, f64::min);

    Ok(Timeline { origin, segments })
}

impl Timeline {
    /// Single segment mapping output `[0, to - from)` onto source `[from, to)`.
    pub fn linear(from: f64, to: f64) -> Result<Self> {
        if !(from >= 0.0) || !(to > from) {
            return Err(ChatcutError::validation(format!(
                "time window must satisfy 0 <= from < to, got from={from} to={to}"
            )));
        }
        Ok(Self {
            origin: 0.0,
            segments: vec![TimelineSegment {
                output_start: 0.0,
                output_end: to - from,
                source_start: from,
                clip_index: 0,
            }],
        })
    }

    pub fn origin(&self) -> f64 {
        self.origin
    }

    pub fn segments(&self) -> &[TimelineSegment] {
        &self.segments
    }

    /// Output duration from the program origin to the end of the last segment.
    pub fn duration(&self) -> f64 {
        self.segments
            .last()
            .map(|last| (last.output_end - self.origin).max(0.0))
            .unwrap_or(0.0)
    }

    /// Sum of mapped segment lengths; smaller than `duration` when the
    /// matched clip leaves gaps for other clips.
    pub fn mapped_duration(&self) -> f64 {
        self.segments.iter().map(TimelineSegment::duration).sum()
    }

    pub fn total_frames(&self, fps: f64) -> u64 {
        self.segments
            .last()
            .map(|last| self.frame_at(last.output_end, fps))
            .unwrap_or(0)
    }

    /// Index of the first output frame at or after `record_time`.
    fn frame_at(&self, record_time: f64, fps: f64) -> u64 {
        // Timecodes and frame times round differently; a cut within a
        // fraction of a frame of an integer frame lands on that frame.
        ((record_time - self.origin) * fps - FRAME_EPSILON)
            .ceil()
            .max(0.0) as u64
    }

    /// Output frames `[start, end)` covered by `segment` at `fps`.
    pub fn frame_span(&self, segment: &TimelineSegment, fps: f64) -> (u64, u64) {
        (
            self.frame_at(segment.output_start, fps),
            self.frame_at(segment.output_end, fps),
        )
    }

    /// Range of source time touched by any segment, for pre-filtering chat.
    pub fn source_bounds(&self) -> (f64, f64) {
        let start = self
            .segments
            .iter()
            .map(|segment| segment.source_start)
            .fold(f64::INFINITY, f64::min);
        let end = self
            .segments
            .iter()
            .map(TimelineSegment::source_end)
            .fold(f64::NEG_INFINITY, f64::max);
        (start, end)
    }

    /// Locate the segment owning output frame `frame_index`.
    pub fn locate_frame(&self, frame_index: u64, fps: f64) -> Option<(usize, &TimelineSegment)> {
        let idx = self
            .segments
            .partition_point(|segment| self.frame_at(segment.output_end, fps) <= frame_index);
        self.segments
            .get(idx)
            .filter(|segment| self.frame_at(segment.output_start, fps) <= frame_index)
            .map(|segment| (idx, segment))
    }

    /// Source time shown on output frame `frame_index` of `segment`.
    ///
    /// Counted in whole frames from the segment's first frame, so the first
    /// frame after a cut shows exactly the clip's source in point.
    pub fn source_time_at(&self, segment: &TimelineSegment, frame_index: u64, fps: f64) -> f64 {
        let (start, _) = self.frame_span(segment, fps);
        // Non-zero only when the cut falls between frames of the output rate.
        let phase = start as f64 / fps - (segment.output_start - self.origin);
        let phase = if phase.abs() * fps < FRAME_EPSILON {
            0.0
        } else {
            phase.max(0.0)
        };
        segment.source_start + frame_index.saturating_sub(start) as f64 / fps + phase
    }

    /// Output time (seconds since origin) of a record-time position.
    pub fn output_time(&self, record_time: f64) -> f64 {
        record_time - self.origin
    }
}
