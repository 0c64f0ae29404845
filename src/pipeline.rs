//! Render job orchestration.
//!
//! `prepare` performs every structural check (config, chat log, EDL, clip
//! match) and `render` only starts the encoder once assets are loaded, so a
//! bad input never leaves a half-written file behind.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::assets::{AssetAtlas, AssetResolver};
use crate::chat_log::{load_chat_log, ChatEvent};
use crate::config::RenderConfig;
use crate::edl::{load_edl, summarize_clip_names};
use crate::encoding::{EncoderPipe, EncoderSettings};
use crate::error::{ChatcutError, Result};
use crate::renderer::{FontSet, FrameRenderer};
use crate::timeline::{build_segments, Timeline};
use crate::window::{ChatWindowEngine, FrameState};

/// Seconds of output kept after the last message when rendering without an EDL.
pub const DEFAULT_TAIL_SECS: f64 = 5.0;

/// Cooperative cancellation shared between the CLI's signal handler and the job.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How output time relates to the chat's source time.
#[derive(Debug, Clone)]
pub enum TimelineSource {
    Edl {
        path: PathBuf,
        /// `None` picks the clip with the most events.
        clip_name: Option<String>,
        /// Frame rate the EDL timecodes are counted in. `None` = output fps.
        fps: Option<f64>,
    },
    Window {
        from: f64,
        /// `None` = last message plus `DEFAULT_TAIL_SECS`.
        to: Option<f64>,
    },
}

#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub chat_path: PathBuf,
    pub timeline: TimelineSource,
    pub config: RenderConfig,
}

/// Structurally valid inputs, ready to render.
#[derive(Debug)]
pub struct PreparedJob {
    pub config: RenderConfig,
    pub events: Vec<ChatEvent>,
    pub timeline: Timeline,
    pub clip_name: Option<String>,
}

pub fn prepare(request: &RenderRequest) -> Result<PreparedJob> {
    request.config.validate()?;
    let events = load_chat_log(&request.chat_path)?;
    debug!(events = events.len(), path = %request.chat_path.display(), "chat log loaded");

    let (timeline, clip_name) = match &request.timeline {
        TimelineSource::Edl {
            path,
            clip_name,
            fps,
        } => {
            let fps = fps.unwrap_or(f64::from(request.config.fps));
            let document = load_edl(path, fps)?;
            let clip_name = match clip_name {
                Some(name) => name.clone(),
                None => summarize_clip_names(&document.clips)
                    .into_iter()
                    .next()
                    .map(|usage| usage.clip_name)
                    .ok_or_else(|| {
                        ChatcutError::validation(format!(
                            "EDL {} contains no video events",
                            path.display()
                        ))
                    })?,
            };
            let timeline = build_segments(&document.clips, &clip_name, fps)?;
            info!(
                clip = %clip_name,
                segments = timeline.segments().len(),
                "timeline reconstructed"
            );
            (timeline, Some(clip_name))
        }
        TimelineSource::Window { from, to } => {
            let to = match to {
                Some(to) => *to,
                None => {
                    let last = events
                        .last()
                        .map(|event| event.timestamp_offset)
                        .unwrap_or(0.0);
                    last.max(*from) + DEFAULT_TAIL_SECS
                }
            };
            (Timeline::linear(*from, to)?, None)
        }
    };

    let job = PreparedJob {
        config: request.config.clone(),
        events,
        timeline,
        clip_name,
    };
    if job.timeline.total_frames(f64::from(job.config.fps)) == 0 {
        return Err(ChatcutError::validation("timeline is shorter than one frame"));
    }
    Ok(job)
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckSummary {
    pub clip_name: Option<String>,
    pub segments: usize,
    pub duration_secs: f64,
    pub mapped_duration_secs: f64,
    pub total_frames: u64,
    pub fps: u32,
    pub chat_events: usize,
    /// Messages whose source time falls inside some segment.
    pub played_events: usize,
    /// Played messages per author role.
    pub played_roles: BTreeMap<&'static str, usize>,
    pub source_start_secs: f64,
    pub source_end_secs: f64,
}

impl PreparedJob {
    pub fn summary(&self) -> CheckSummary {
        let fps = self.config.fps;
        let (source_start, source_end) = self.timeline.source_bounds();
        CheckSummary {
            clip_name: self.clip_name.clone(),
            segments: self.timeline.segments().len(),
            duration_secs: self.timeline.duration(),
            mapped_duration_secs: self.timeline.mapped_duration(),
            total_frames: self.timeline.total_frames(f64::from(fps)),
            fps,
            chat_events: self.events.len(),
            played_events: played_event_count(&self.events, &self.timeline),
            played_roles: played_events(&self.events, &self.timeline).fold(
                BTreeMap::new(),
                |mut roles, event| {
                    *roles.entry(event.role.as_str()).or_insert(0) += 1;
                    roles
                },
            ),
            source_start_secs: source_start,
            source_end_secs: source_end,
        }
    }

    pub fn encoder_settings(&self) -> EncoderSettings {
        EncoderSettings::from_config(&self.config)
    }
}

/// Events whose source time falls inside some segment, once per segment that plays them.
pub fn played_events<'a>(
    events: &'a [ChatEvent],
    timeline: &'a Timeline,
) -> impl Iterator<Item = &'a ChatEvent> + 'a {
    timeline.segments().iter().flat_map(move |segment| {
        let start = events.partition_point(|e| e.timestamp_offset < segment.source_start);
        let end = events.partition_point(|e| e.timestamp_offset < segment.source_end());
        &events[start..end.max(start)]
    })
}

pub fn played_event_count(events: &[ChatEvent], timeline: &Timeline) -> usize {
    played_events(events, timeline).count()
}

#[derive(Debug, Clone, Serialize)]
pub struct RenderSummary {
    pub frames: u64,
    pub duration_secs: f64,
    pub output: PathBuf,
    pub elapsed_secs: f64,
    pub assets_loaded: usize,
    pub assets_failed: usize,
}

/// Render `job` and stream it into the encoder returned by `open_encoder`.
///
/// Frame states are computed sequentially (scrolling carries state), composed
/// in parallel one batch at a time, and written strictly in frame order.
pub fn render<F>(
    job: &PreparedJob,
    resolver: &dyn AssetResolver,
    open_encoder: F,
    cancel: &CancelToken,
) -> Result<RenderSummary>
where
    F: FnOnce(&EncoderSettings) -> Result<Box<dyn EncoderPipe>>,
{
    let started = Instant::now();
    let config = &job.config;
    let settings = job.encoder_settings();
    settings.validate()?;

    let styles = config.style_table();
    let (atlas, report) = AssetAtlas::preload(
        played_events(&job.events, &job.timeline),
        &styles,
        resolver,
        config.skip_avatars,
        config.skip_emojis,
    );
    let fonts = FontSet::load(config.author_font.as_deref(), config.message_font.as_deref());
    if fonts.is_fallback() {
        warn!("no usable font configured, text renders as glyph boxes");
    }
    let renderer = FrameRenderer::new(config, fonts, atlas);

    let mut builder = rayon::ThreadPoolBuilder::new()
        .thread_name(|idx| format!("chatcut-render-{idx}"));
    if let Some(threads) = config.render_threads {
        builder = builder.num_threads(threads);
    }
    let pool = builder
        .build()
        .map_err(|error| ChatcutError::validation(format!("failed to build render pool: {error}")))?;
    let batch_size = pool.current_num_threads().max(1) * 4;

    if cancel.is_cancelled() {
        return Err(ChatcutError::Cancelled);
    }

    let mut encoder = open_encoder(&settings)?;
    let mut engine = ChatWindowEngine::new(
        &job.events,
        &job.timeline,
        config.fps,
        config.retention.clone(),
        config.scroll_frames,
    );
    let total = engine.total_frames();
    info!(frames = total, fps = config.fps, "rendering");

    let mut written = 0u64;
    let mut next_report = 0u64;
    loop {
        if cancel.is_cancelled() {
            encoder.abort();
            return Err(ChatcutError::Cancelled);
        }

        let batch = engine.by_ref().take(batch_size).collect::<Vec<FrameState<'_>>>();
        if batch.is_empty() {
            break;
        }

        let frames = pool.install(|| {
            batch
                .par_iter()
                .map(|state| renderer.compose(state))
                .collect::<Vec<_>>()
        });

        for frame in frames {
            let frame = match frame {
                Ok(frame) => frame,
                Err(error) => {
                    encoder.abort();
                    return Err(error);
                }
            };
            if let Err(error) = encoder.write_frame(frame.into_pixels()) {
                return Err(encoder.fail(error));
            }
            written += 1;
        }

        if written >= next_report {
            let percent = if total == 0 { 100 } else { written * 100 / total };
            info!(written, total, percent, "progress");
            next_report = written + (total / 10).max(1);
        }
    }

    let output = encoder.finish()?;
    let summary = RenderSummary {
        frames: written,
        duration_secs: job.timeline.duration(),
        output,
        elapsed_secs: started.elapsed().as_secs_f64(),
        assets_loaded: report.loaded,
        assets_failed: report.failed,
    };
    info!(
        frames = summary.frames,
        elapsed_secs = summary.elapsed_secs,
        output = %summary.output.display(),
        "render complete"
    );
    Ok(summary)
}

/// Compose a single frame as a still, for previews and debugging.
pub fn render_still(
    job: &PreparedJob,
    resolver: &dyn AssetResolver,
    output_time: f64,
) -> Result<crate::renderer::FrameBuffer> {
    let config = &job.config;
    let styles = config.style_table();
    let (atlas, _) = AssetAtlas::preload(
        played_events(&job.events, &job.timeline),
        &styles,
        resolver,
        config.skip_avatars,
        config.skip_emojis,
    );
    let fonts = FontSet::load(config.author_font.as_deref(), config.message_font.as_deref());
    let renderer = FrameRenderer::new(config, fonts, atlas);

    let mut engine = ChatWindowEngine::new(
        &job.events,
        &job.timeline,
        config.fps,
        config.retention.clone(),
        config.scroll_frames,
    );
    let frame_index = (output_time.max(0.0) * f64::from(config.fps)).floor() as u64;
    engine.seek(frame_index.min(engine.total_frames().saturating_sub(1)));
    let state = engine
        .next()
        .ok_or_else(|| ChatcutError::validation("timeline has no frames"))?;
    renderer.compose(&state)
}

/// Write a composed frame as PNG.
pub fn save_png(frame: &crate::renderer::FrameBuffer, path: &Path) -> Result<()> {
    image::save_buffer(
        path,
        &frame.pixels,
        frame.width,
        frame.height,
        image::ColorType::Rgba8,
    )
    .map_err(|error| match error {
        image::ImageError::IoError(source) => ChatcutError::io("failed to write still", path, source),
        other => ChatcutError::encoding(format!("failed to encode still: {other}")),
    })
}
