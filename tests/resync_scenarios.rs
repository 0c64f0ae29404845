use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chatcut::assets::AssetResolver;
use chatcut::chat_log::load_chat_log;
use chatcut::config::{Resolution, RenderConfig, Retention};
use chatcut::edl::load_edl;
use chatcut::encoding::EncoderPipe;
use chatcut::pipeline::{prepare, render, CancelToken, RenderRequest, TimelineSource};
use chatcut::timeline::build_segments;
use chatcut::window::ChatWindowEngine;
use chatcut::ChatcutError;

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

fn authors_at(frame: &chatcut::window::FrameState<'_>) -> Vec<String> {
    frame.lines.iter().map(|line| line.event.author.clone()).collect()
}

#[test]
fn chat_follows_the_cut_and_skips_removed_footage() {
    let events = load_chat_log(&fixture("resync_chat.json")).expect("chat loads");
    let document = load_edl(&fixture("resync.edl"), 30.0).expect("edl parses");
    let timeline = build_segments(&document.clips, "stream.mkv", 30.0).expect("timeline builds");
    assert_eq!(timeline.segments().len(), 2);
    assert_eq!(timeline.duration(), 7.0);

    let frames = ChatWindowEngine::new(&events, &timeline, 30, Retention::default(), 6)
        .collect::<Vec<_>>();
    assert_eq!(frames.len(), 210);

    let at_one = &frames[30];
    assert_eq!(at_one.source_time, Some(1.0));
    assert_eq!(authors_at(at_one), vec!["early"]);

    let at_five = &frames[150];
    let source = at_five.source_time.expect("inside second segment");
    assert!((source - 10.0).abs() < 1e-9, "source time {source}");
    assert_eq!(authors_at(at_five), vec!["late", "early"]);

    assert!(
        frames
            .iter()
            .flat_map(|frame| frame.lines.iter())
            .all(|line| line.event.author != "cut"),
        "chat from removed footage never appears"
    );
}

#[test]
fn scroll_snaps_at_segment_boundaries_and_eases_inside() {
    let events = load_chat_log(&fixture("resync_chat.json")).expect("chat loads");
    let document = load_edl(&fixture("resync.edl"), 30.0).expect("edl parses");
    let timeline = build_segments(&document.clips, "stream.mkv", 30.0).expect("timeline builds");
    let frames = ChatWindowEngine::new(&events, &timeline, 30, Retention::default(), 6)
        .collect::<Vec<_>>();

    for pair in frames.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        if prev.segment == next.segment {
            assert!(next.scroll_offset >= prev.scroll_offset, "frame {}", next.frame_index);
        }
    }

    let entering = &frames[90];
    assert_eq!(entering.segment, Some(1));
    assert_eq!(entering.scroll_offset, entering.scroll_target as f32);

    // "late" arrives 2s into the second segment and eases over six frames.
    let arrival = frames
        .iter()
        .position(|frame| frame.segment == Some(1) && frame.scroll_target == 1)
        .expect("late message arrives");
    assert_eq!(arrival, 150);
    assert!(frames[arrival].scroll_offset < 1.0);
    assert_eq!(frames[arrival + 5].scroll_offset, 1.0);
}

#[derive(Default)]
struct CountingPipeLog {
    opened: AtomicUsize,
    frames: AtomicUsize,
}

struct CountingPipe {
    frame_len: usize,
    log: Arc<CountingPipeLog>,
}

impl EncoderPipe for CountingPipe {
    fn frame_len(&self) -> usize {
        self.frame_len
    }

    fn write_frame(&mut self, frame: Vec<u8>) -> chatcut::Result<()> {
        assert_eq!(frame.len(), self.frame_len);
        self.log.frames.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn finish(self: Box<Self>) -> chatcut::Result<PathBuf> {
        Ok(PathBuf::from("counted"))
    }

    fn abort(self: Box<Self>) {}
}

fn small_config() -> RenderConfig {
    RenderConfig {
        resolution: Resolution {
            width: 96,
            height: 64,
        },
        fps: 10,
        render_threads: Some(2),
        ..RenderConfig::default()
    }
}

#[test]
fn missing_clip_fails_before_any_frame() {
    let request = RenderRequest {
        chat_path: fixture("resync_chat.json"),
        timeline: TimelineSource::Edl {
            path: fixture("resync.edl"),
            clip_name: Some("missing.mkv".to_owned()),
            fps: Some(30.0),
        },
        config: small_config(),
    };
    let error = prepare(&request).expect_err("no such clip");
    match &error {
        ChatcutError::NoMatch { clip_name, available } => {
            assert_eq!(clip_name, "missing.mkv");
            assert!(available.contains("stream.mkv"), "{available}");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(error.code(), "NO_MATCH");
}

#[test]
fn most_used_clip_is_selected_when_unnamed() {
    let request = RenderRequest {
        chat_path: fixture("resync_chat.json"),
        timeline: TimelineSource::Edl {
            path: fixture("resync.edl"),
            clip_name: None,
            fps: Some(30.0),
        },
        config: small_config(),
    };
    let job = prepare(&request).expect("prepares");
    assert_eq!(job.clip_name.as_deref(), Some("stream.mkv"));
    let summary = job.summary();
    assert_eq!(summary.total_frames, 70);
    assert_eq!(summary.played_events, 2);
}

struct TimingOutResolver {
    requests: Mutex<Vec<String>>,
}

impl AssetResolver for TimingOutResolver {
    fn resolve(&self, url: &str) -> chatcut::Result<PathBuf> {
        self.requests.lock().expect("requests").push(url.to_owned());
        Err(ChatcutError::AssetFetch {
            url: url.to_owned(),
            reason: "timed out".to_owned(),
        })
    }
}

#[test]
fn avatar_timeout_still_completes_the_job() {
    let dir = tempfile::tempdir().expect("tempdir");
    let chat = dir.path().join("chat.json");
    std::fs::write(
        &chat,
        r#"[
  {"timestamp": 0.5, "author": "slow", "avatar": "https://avatars.invalid/slow.png", "segments": [{"text": "hi"}]},
  {"timestamp": 1.0, "author": "fine", "segments": [{"text": "hello"}]}
]"#,
    )
    .expect("write chat");

    let job = prepare(&RenderRequest {
        chat_path: chat,
        timeline: TimelineSource::Window {
            from: 0.0,
            to: Some(2.0),
        },
        config: small_config(),
    })
    .expect("prepares");

    let resolver = TimingOutResolver {
        requests: Mutex::new(Vec::new()),
    };
    let log = Arc::new(CountingPipeLog::default());
    let pipe_log = Arc::clone(&log);
    let summary = render(
        &job,
        &resolver,
        move |settings| {
            pipe_log.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(CountingPipe {
                frame_len: settings.frame_len(),
                log: pipe_log,
            }) as Box<dyn EncoderPipe>)
        },
        &CancelToken::new(),
    )
    .expect("job completes despite the timeout");

    assert_eq!(summary.frames, 20);
    assert_eq!(summary.assets_failed, 1);
    assert_eq!(log.opened.load(Ordering::SeqCst), 1);
    assert_eq!(log.frames.load(Ordering::SeqCst), 20);
    assert_eq!(
        *resolver.requests.lock().expect("requests"),
        vec!["https://avatars.invalid/slow.png".to_owned()]
    );
}

#[test]
fn invalid_codec_combination_never_opens_the_encoder() {
    let mut config = small_config();
    config.transparent = true;
    let request = RenderRequest {
        chat_path: fixture("resync_chat.json"),
        timeline: TimelineSource::Window {
            from: 0.0,
            to: Some(1.0),
        },
        config,
    };
    let error = prepare(&request).expect_err("h264 has no alpha");
    assert_eq!(error.code(), "VALIDATION_ERROR");
}
