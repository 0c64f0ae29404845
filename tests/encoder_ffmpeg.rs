use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use chatcut::assets::OfflineResolver;
use chatcut::config::{Codec, Resolution, RenderConfig};
use chatcut::encoding::{EncoderPipe, EncoderSettings, FfmpegMode, FfmpegPipe};
use chatcut::pipeline::{prepare, render, CancelToken, RenderRequest, TimelineSource};
use tempfile::tempdir;

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

fn command_available(name: &str, version_arg: &str) -> bool {
    Command::new(name)
        .arg(version_arg)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

fn staged_leftovers(dir: &Path) -> Vec<String> {
    fs::read_dir(dir)
        .expect("dir should read")
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with(".chatcut-"))
        .collect()
}

fn prores_settings() -> EncoderSettings {
    EncoderSettings {
        width: 64,
        height: 48,
        fps: 10,
        codec: Codec::Prores4444,
        transparent: true,
        hwaccel: false,
        queue_depth: 2,
    }
}

#[test]
fn edl_render_produces_a_video_and_cleans_up_staging() {
    if !command_available("ffmpeg", "-version") {
        eprintln!("skipping: ffmpeg not available");
        return;
    }

    let dir = tempdir().expect("tempdir should create");
    let output = dir.path().join("overlay.mov");
    let job = prepare(&RenderRequest {
        chat_path: fixture("resync_chat.json"),
        timeline: TimelineSource::Edl {
            path: fixture("resync.edl"),
            clip_name: None,
            fps: Some(30.0),
        },
        config: RenderConfig {
            resolution: Resolution {
                width: 64,
                height: 48,
            },
            fps: 10,
            codec: Codec::Prores4444,
            transparent: true,
            render_threads: Some(2),
            ..RenderConfig::default()
        },
    })
    .expect("job prepares");

    let summary = render(
        &job,
        &OfflineResolver,
        |settings| {
            let pipe = FfmpegPipe::spawn_with_mode(settings, &output, FfmpegMode::System)?;
            Ok(Box::new(pipe) as Box<dyn EncoderPipe>)
        },
        &CancelToken::new(),
    )
    .expect("render should succeed");

    assert_eq!(summary.frames, 70);
    assert_eq!(summary.output, output);
    let size = fs::metadata(&output).expect("output should exist").len();
    assert!(size > 0, "output should not be empty");
    assert!(staged_leftovers(dir.path()).is_empty());
}

#[test]
fn aborted_encode_leaves_nothing_behind() {
    if !command_available("ffmpeg", "-version") {
        eprintln!("skipping: ffmpeg not available");
        return;
    }

    let dir = tempdir().expect("tempdir should create");
    let output = dir.path().join("aborted.mov");
    let settings = prores_settings();
    let mut pipe = Box::new(FfmpegPipe::spawn(&settings, &output).expect("ffmpeg should spawn"));
    for _ in 0..3 {
        pipe.write_frame(vec![0u8; settings.frame_len()])
            .expect("frame should queue");
    }
    pipe.abort();

    assert!(!output.exists());
    assert!(staged_leftovers(dir.path()).is_empty());
}

#[test]
fn failed_encode_discards_output_and_reports_ffmpeg() {
    if !command_available("ffmpeg", "-version") {
        eprintln!("skipping: ffmpeg not available");
        return;
    }

    let dir = tempdir().expect("tempdir should create");
    let output = dir.path().join("failed.mov");
    let settings = prores_settings();
    let mut pipe = Box::new(FfmpegPipe::spawn(&settings, &output).expect("ffmpeg should spawn"));
    pipe.write_frame(vec![0u8; settings.frame_len()])
        .expect("frame should queue");

    let error = pipe.fail(chatcut::error::ChatcutError::encoding("ffmpeg stopped accepting frames"));
    assert_eq!(error.code(), "ENCODING_ERROR");
    assert!(error.to_string().starts_with("ffmpeg stopped accepting frames"));
    assert!(!output.exists(), "a failed encode must not be persisted");
    assert!(staged_leftovers(dir.path()).is_empty());
}

#[test]
fn wrong_frame_size_is_rejected_without_killing_the_pipe() {
    if !command_available("ffmpeg", "-version") {
        eprintln!("skipping: ffmpeg not available");
        return;
    }

    let dir = tempdir().expect("tempdir should create");
    let output = dir.path().join("sized.mov");
    let settings = prores_settings();
    let mut pipe = Box::new(FfmpegPipe::spawn(&settings, &output).expect("ffmpeg should spawn"));

    let error = pipe
        .write_frame(vec![0u8; 16])
        .expect_err("short frame must be rejected");
    assert_eq!(error.code(), "ENCODING_ERROR");

    pipe.write_frame(vec![0u8; settings.frame_len()])
        .expect("full frame should queue");
    let written = pipe.finish().expect("encode should finish");
    assert_eq!(written, output);
    assert!(output.exists());
}

#[test]
fn cli_renders_a_still_without_ffmpeg() {
    let dir = tempdir().expect("tempdir should create");
    let still = dir.path().join("frame.png");
    let output = Command::new(env!("CARGO_BIN_EXE_chatcut"))
        .current_dir(dir.path())
        .env("CHATCUT_LOG", "warn")
        .args([
            "render",
            fixture("resync_chat.json").to_str().expect("utf-8 path"),
            "--edl",
            fixture("resync.edl").to_str().expect("utf-8 path"),
            "--edl-fps",
            "30",
            "--width",
            "120",
            "--height",
            "80",
            "--offline",
            "--still",
            "5.0",
            "-o",
            still.to_str().expect("utf-8 path"),
        ])
        .output()
        .expect("chatcut command should run");
    assert!(
        output.status.success(),
        "still render should succeed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let decoded = image::open(&still).expect("png should decode").to_rgba8();
    assert_eq!(decoded.dimensions(), (120, 80));
}
