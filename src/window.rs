//! Per-frame chat windowing against the resynchronized timeline.
//!
//! A message is *played* when the output timeline passes over its source
//! timestamp inside some segment. Only played messages are ever visible, so
//! chat from footage the editor cut away never leaks into the overlay.

use std::ops::Range;

use crate::chat_log::ChatEvent;
use crate::config::Retention;
use crate::timeline::Timeline;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VisibleLine<'a> {
    pub event: &'a ChatEvent,
    /// Output time (seconds since origin) at which the message entered.
    pub output_time: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameState<'a> {
    pub frame_index: u64,
    pub output_time: f64,
    /// `None` inside a gap between matched clips.
    pub source_time: Option<f64>,
    pub segment: Option<usize>,
    /// Eased scroll position, in lines, since the active segment was entered.
    pub scroll_offset: f32,
    /// Messages entered since the active segment was entered.
    pub scroll_target: u32,
    /// Newest first.
    pub lines: Vec<VisibleLine<'a>>,
}

impl FrameState<'_> {
    pub fn is_blank(&self) -> bool {
        self.lines.is_empty()
    }

    /// Fraction of the newest line still sliding in, in `[0, 1]`.
    pub fn pending_scroll(&self) -> f32 {
        (self.scroll_target as f32 - self.scroll_offset).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScrollState {
    Idle,
    Active {
        segment: usize,
        scroll_offset: f32,
        scroll_target: u32,
    },
}

impl ScrollState {
    /// Advance the machine for one frame.
    ///
    /// Same segment: ease toward the new target, never backwards. Different
    /// segment (or leaving a gap): snap to the target, since the boundary is a
    /// discontinuity in source time and must not animate.
    pub fn step(self, segment: Option<usize>, entered: u32, scroll_frames: u32) -> Self {
        let Some(segment) = segment else {
            return ScrollState::Idle;
        };
        let target = entered as f32;

        match self {
            ScrollState::Active {
                segment: current,
                scroll_offset,
                ..
            } if current == segment => {
                let offset = if scroll_frames == 0 {
                    target
                } else {
                    // Only the newest line animates; older backlog snaps into place.
                    let base = scroll_offset.max(target - 1.0);
                    let eased = base + 1.0 / scroll_frames as f32;
                    // Absorb f32 drift so the last step lands exactly on the target.
                    if target - eased < 1e-4 {
                        target
                    } else {
                        eased
                    }
                };
                ScrollState::Active {
                    segment,
                    scroll_offset: offset.max(scroll_offset),
                    scroll_target: entered,
                }
            }
            _ => ScrollState::Active {
                segment,
                scroll_offset: target,
                scroll_target: entered,
            },
        }
    }
}

pub struct ChatWindowEngine<'a> {
    events: &'a [ChatEvent],
    timeline: &'a Timeline,
    fps: f64,
    retention: Retention,
    scroll_frames: u32,
    /// Event index range played by each segment.
    played: Vec<Range<usize>>,
    state: ScrollState,
    next_frame: u64,
    total_frames: u64,
}

impl<'a> ChatWindowEngine<'a> {
    /// `events` must be sorted by `timestamp_offset`, as `parse_chat_log` returns them.
    pub fn new(
        events: &'a [ChatEvent],
        timeline: &'a Timeline,
        fps: u32,
        retention: Retention,
        scroll_frames: u32,
    ) -> Self {
        let fps = f64::from(fps.max(1));
        let played = timeline
            .segments()
            .iter()
            .map(|segment| {
                let start = events.partition_point(|e| e.timestamp_offset < segment.source_start);
                let end = events.partition_point(|e| e.timestamp_offset < segment.source_end());
                start..end.max(start)
            })
            .collect();

        Self {
            events,
            timeline,
            fps,
            retention,
            scroll_frames,
            played,
            state: ScrollState::Idle,
            next_frame: 0,
            total_frames: timeline.total_frames(fps),
        }
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    /// Jump to `frame_index` without easing; the next frame starts from a snapped state.
    pub fn seek(&mut self, frame_index: u64) {
        self.next_frame = frame_index;
        self.state = ScrollState::Idle;
    }

    /// Compute the state of the next sequential frame.
    pub fn next_frame(&mut self) -> Option<FrameState<'a>> {
        if self.next_frame >= self.total_frames {
            return None;
        }
        let frame_index = self.next_frame;
        self.next_frame += 1;
        Some(self.compute(frame_index))
    }

    fn compute(&mut self, frame_index: u64) -> FrameState<'a> {
        let output_time = frame_index as f64 / self.fps;

        let Some((segment_idx, segment)) = self.timeline.locate_frame(frame_index, self.fps) else {
            self.state = self.state.step(None, 0, self.scroll_frames);
            return FrameState {
                frame_index,
                output_time,
                source_time: None,
                segment: None,
                scroll_offset: 0.0,
                scroll_target: 0,
                lines: Vec::new(),
            };
        };

        let source_time = self.timeline.source_time_at(segment, frame_index, self.fps);
        let range = self.played[segment_idx].clone();
        let reached = range.start
            + self.events[range.clone()].partition_point(|e| e.timestamp_offset <= source_time);
        let entered = (reached - range.start) as u32;

        self.state = self
            .state
            .step(Some(segment_idx), entered, self.scroll_frames);
        let (scroll_offset, scroll_target) = match self.state {
            ScrollState::Active {
                scroll_offset,
                scroll_target,
                ..
            } => (scroll_offset, scroll_target),
            ScrollState::Idle => (0.0, 0),
        };

        let lines = self.collect_visible(segment_idx, range.start..reached, output_time);
        FrameState {
            frame_index,
            output_time,
            source_time: Some(source_time),
            segment: Some(segment_idx),
            scroll_offset,
            scroll_target,
            lines,
        }
    }

    fn collect_visible(
        &self,
        segment_idx: usize,
        current: Range<usize>,
        output_time: f64,
    ) -> Vec<VisibleLine<'a>> {
        let max_lines = self.retention.max_lines;
        let mut lines = Vec::with_capacity(max_lines.min(64));
        let segments = self.timeline.segments();

        for idx in (0..=segment_idx).rev() {
            let segment = &segments[idx];
            let range = if idx == segment_idx {
                current.clone()
            } else {
                self.played[idx].clone()
            };
            for event in self.events[range].iter().rev() {
                let entered_at = self
                    .timeline
                    .output_time(segment.output_start + (event.timestamp_offset - segment.source_start));
                if let Some(max_age) = self.retention.max_age {
                    if output_time - entered_at > max_age {
                        return lines;
                    }
                }
                lines.push(VisibleLine {
                    event,
                    output_time: entered_at,
                });
                if lines.len() >= max_lines {
                    return lines;
                }
            }
        }
        lines
    }
}

impl<'a> Iterator for ChatWindowEngine<'a> {
    type Item = FrameState<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_frame()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.total_frames.saturating_sub(self.next_frame) as usize;
        (remaining, Some(remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat_log::MessageSegment;
    use crate::edl::{EdlClip, Transition};
    use crate::style::Role;
    use crate::timeline::build_segments;

    fn event(ts: f64, author: &str) -> ChatEvent {
        ChatEvent {
            timestamp_offset: ts,
            author: author.to_owned(),
            role: Role::Normal,
            message_segments: vec![MessageSegment::Text(format!("at {ts}"))],
            avatar_ref: None,
        }
    }

    fn clip(name: &str, src: (f64, f64), rec: (f64, f64)) -> EdlClip {
        EdlClip {
            event_number: 1,
            reel: "AX".to_owned(),
            clip_name: name.to_owned(),
            transition: Transition::Cut,
            source_in: src.0,
            source_out: src.1,
            record_in: rec.0,
            record_out: rec.1,
        }
    }

    fn authors(state: &FrameState<'_>) -> Vec<String> {
        state.lines.iter().map(|l| l.event.author.clone()).collect()
    }

    #[test]
    fn scroll_eases_within_a_segment_and_never_decreases() {
        let mut state = ScrollState::Idle;
        state = state.step(Some(0), 0, 4);
        let mut last = 0.0;
        for _ in 0..6 {
            state = state.step(Some(0), 1, 4);
            let ScrollState::Active { scroll_offset, .. } = state else {
                panic!("expected active");
            };
            assert!(scroll_offset >= last);
            last = scroll_offset;
        }
        assert_eq!(last, 1.0);
    }

    #[test]
    fn scroll_resets_on_segment_change() {
        let state = ScrollState::Active {
            segment: 0,
            scroll_offset: 2.5,
            scroll_target: 3,
        };
        let next = state.step(Some(1), 1, 8);
        assert_eq!(
            next,
            ScrollState::Active {
                segment: 1,
                scroll_offset: 1.0,
                scroll_target: 1
            }
        );
        assert_eq!(next.step(None, 0, 8), ScrollState::Idle);
    }

    #[test]
    fn retention_limits_line_count_and_age() {
        let events = (0..10).map(|i| event(i as f64, &format!("u{i}"))).collect::<Vec<_>>();
        let timeline = Timeline::linear(0.0, 20.0).expect("window");

        let mut by_count = ChatWindowEngine::new(
            &events,
            &timeline,
            1,
            Retention {
                max_lines: 3,
                max_age: None,
            },
            0,
        );
        let frame = by_count.nth(9).expect("frame 9");
        assert_eq!(authors(&frame), vec!["u9", "u8", "u7"]);

        let mut by_age = ChatWindowEngine::new(
            &events,
            &timeline,
            1,
            Retention {
                max_lines: 100,
                max_age: Some(2.0),
            },
            0,
        );
        let frame = by_age.nth(12).expect("frame 12");
        assert!(frame.lines.is_empty(), "all messages older than 2s");
        by_age.seek(9);
        let frame = by_age.next().expect("frame 9");
        assert_eq!(authors(&frame), vec!["u9", "u8", "u7"]);
    }

    #[test]
    fn gap_frames_are_blank_and_idle() {
        let events = vec![event(0.5, "a")];
        let clips = vec![
            clip("stream", (0.0, 2.0), (0.0, 2.0)),
            clip("other", (0.0, 2.0), (2.0, 4.0)),
            clip("stream", (2.0, 4.0), (4.0, 6.0)),
        ];
        let timeline = build_segments(&clips, "stream", 2.0).expect("timeline");
        let frames = ChatWindowEngine::new(&events, &timeline, 2, Retention::default(), 0)
            .collect::<Vec<_>>();
        assert_eq!(frames.len(), 12);
        let gap = &frames[5];
        assert!(gap.is_blank());
        assert_eq!(gap.segment, None);
        assert_eq!(gap.source_time, None);
        let after = &frames[8];
        assert_eq!(after.segment, Some(1));
        assert_eq!(authors(after), vec!["a"], "earlier played chat stays visible");
    }

    #[test]
    fn first_frame_after_a_late_cut_belongs_to_the_new_clip() {
        let edl = "TITLE: late cut\n\
001  AX  V  C  00:00:00:00 00:04:16:08 01:00:00:00 01:04:16:08\n\
* FROM CLIP NAME: s.mkv\n\
002  AX  V  C  00:10:00:00 00:10:03:22 01:04:16:08 01:04:20:00\n\
* FROM CLIP NAME: s.mkv\n";
        let document = crate::edl::parse_edl(edl, 30.0, "late.edl").expect("parses");
        let timeline = build_segments(&document.clips, "s.mkv", 30.0).expect("timeline");
        let events = vec![event(255.0, "before"), event(600.0, "after")];

        let mut engine = ChatWindowEngine::new(&events, &timeline, 30, Retention::default(), 6);
        engine.seek(7687);
        let last_of_first = engine.next().expect("frame 7687");
        assert_eq!(last_of_first.segment, Some(0));
        let first_of_second = engine.next().expect("frame 7688");
        assert_eq!(first_of_second.segment, Some(1));
        assert_eq!(first_of_second.source_time, Some(600.0));
        assert_eq!(authors(&first_of_second), vec!["after", "before"]);
        assert_eq!(first_of_second.scroll_offset, 1.0, "snapped at the cut");
    }
}
