use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use tempfile::TempPath;
use tracing::{debug, info, warn};

use crate::config::{validate_codec, Codec, RenderConfig};
use crate::error::{ChatcutError, Result};

const STDERR_TAIL_CHARS: usize = 500;

/// Ordered sink for composed frames.
pub trait EncoderPipe: Send {
    /// Exact byte length every frame must have.
    fn frame_len(&self) -> usize;
    /// Blocks while the queue is full.
    fn write_frame(&mut self, frame: Vec<u8>) -> Result<()>;
    /// Flush, wait for the encoder, and move the output into place.
    fn finish(self: Box<Self>) -> Result<PathBuf>;
    /// Stop immediately and leave nothing at the destination.
    fn abort(self: Box<Self>);
    /// Stop after a failed write. Nothing is left at the destination and the
    /// returned error carries whatever the encoder reported.
    fn fail(self: Box<Self>, error: ChatcutError) -> ChatcutError {
        self.abort();
        error
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfmpegMode {
    Auto,
    System,
    Sidecar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPlatform {
    MacOs,
    Other,
}

impl HostPlatform {
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            HostPlatform::MacOs
        } else {
            HostPlatform::Other
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub codec: Codec,
    pub transparent: bool,
    pub hwaccel: bool,
    pub queue_depth: usize,
}

impl EncoderSettings {
    pub fn from_config(config: &RenderConfig) -> Self {
        Self {
            width: config.resolution.width,
            height: config.resolution.height,
            fps: config.fps,
            codec: config.codec,
            transparent: config.transparent,
            hwaccel: config.hwaccel,
            queue_depth: config.queue_depth,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.fps == 0 {
            return Err(ChatcutError::validation("fps must be > 0"));
        }
        if self.queue_depth == 0 {
            return Err(ChatcutError::validation("queue_depth must be > 0"));
        }
        validate_codec(self.codec, self.transparent, self.width, self.height)
    }

    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

/// Concrete encoder and pixel format for one codec on one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderChoice {
    pub encoder: &'static str,
    pub pix_fmt: &'static str,
    pub extra: Vec<String>,
    /// Set when the request could not be honoured as asked.
    pub note: Option<String>,
}

pub fn select_encoder(settings: &EncoderSettings, platform: HostPlatform) -> EncoderChoice {
    let mac_hw = settings.hwaccel && platform == HostPlatform::MacOs;
    let alpha = settings.transparent;

    let mut chosen = match settings.codec {
        Codec::H264 if mac_hw => choice("h264_videotoolbox", "yuv420p", Vec::new()),
        Codec::H264 => choice(
            "libx264",
            "yuv420p",
            strings(&["-preset", "medium", "-crf", "18"]),
        ),
        Codec::Hevc if mac_hw && alpha => choice(
            "hevc_videotoolbox",
            "bgra",
            strings(&["-alpha_quality", "0.75", "-tag:v", "hvc1"]),
        ),
        Codec::Hevc if mac_hw => choice("hevc_videotoolbox", "yuv420p", strings(&["-tag:v", "hvc1"])),
        Codec::Hevc => choice(
            "libx265",
            if alpha { "yuva420p" } else { "yuv420p" },
            strings(&["-crf", "20", "-tag:v", "hvc1"]),
        ),
        Codec::Prores4444 if mac_hw => choice(
            "prores_videotoolbox",
            if alpha { "bgra" } else { "yuv422p10le" },
            strings(&["-profile:v", "4"]),
        ),
        Codec::Prores4444 => choice(
            "prores_ks",
            if alpha { "yuva444p10le" } else { "yuv422p10le" },
            strings(&["-profile:v", if alpha { "4444" } else { "3" }, "-vendor", "apl0"]),
        ),
        Codec::Av1 => {
            let mut chosen = choice("libsvtav1", "yuv420p", strings(&["-crf", "30"]));
            if mac_hw {
                chosen.note =
                    Some("no hardware AV1 encoder on this platform; using libsvtav1".to_owned());
            }
            chosen
        }
    };

    // VideoToolbox is the only hardware path; elsewhere the request degrades to software.
    if settings.hwaccel && platform != HostPlatform::MacOs {
        chosen.note = Some(format!(
            "hardware encoding is only available on macOS; using {}",
            chosen.encoder
        ));
    }
    chosen
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|arg| (*arg).to_owned()).collect()
}

fn choice(encoder: &'static str, pix_fmt: &'static str, extra: Vec<String>) -> EncoderChoice {
    EncoderChoice {
        encoder,
        pix_fmt,
        extra,
        note: None,
    }
}

pub fn ffmpeg_args(settings: &EncoderSettings, choice: &EncoderChoice, output_path: &Path) -> Vec<String> {
    let size = format!("{}x{}", settings.width, settings.height);
    let mut args = ffmpeg_rawvideo_input_args(&size, &settings.fps.to_string());
    args.extend([
        "-c:v".to_owned(),
        choice.encoder.to_owned(),
        "-pix_fmt".to_owned(),
        choice.pix_fmt.to_owned(),
    ]);
    args.extend(choice.extra.iter().cloned());
    args.extend(ffmpeg_container_output_args(output_path));
    args.push(output_path.to_string_lossy().into_owned());
    args
}

pub fn ffmpeg_rawvideo_input_args(size: &str, fps: &str) -> Vec<String> {
    vec![
        "-hide_banner".to_owned(),
        "-loglevel".to_owned(),
        "error".to_owned(),
        "-y".to_owned(),
        "-f".to_owned(),
        "rawvideo".to_owned(),
        "-pix_fmt".to_owned(),
        "rgba".to_owned(),
        "-s:v".to_owned(),
        size.to_owned(),
        "-r".to_owned(),
        fps.to_owned(),
        "-i".to_owned(),
        "-".to_owned(),
        "-an".to_owned(),
    ]
}

pub fn ffmpeg_container_output_args(output_path: &Path) -> Vec<String> {
    let ext = output_path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    if matches!(ext.as_str(), "mov" | "mp4" | "m4v") {
        vec!["-movflags".to_owned(), "+faststart".to_owned()]
    } else {
        Vec::new()
    }
}

trait VideoEncoderBackend {
    fn mode_label(&self) -> &'static str;
    fn ffmpeg_path(&self) -> Result<PathBuf>;
}

struct SystemFfmpegBackend;

impl VideoEncoderBackend for SystemFfmpegBackend {
    fn mode_label(&self) -> &'static str {
        "system"
    }

    fn ffmpeg_path(&self) -> Result<PathBuf> {
        Ok(PathBuf::from("ffmpeg"))
    }
}

#[cfg(feature = "sidecar_ffmpeg")]
struct SidecarFfmpegBackend;

#[cfg(feature = "sidecar_ffmpeg")]
impl VideoEncoderBackend for SidecarFfmpegBackend {
    fn mode_label(&self) -> &'static str {
        "sidecar"
    }

    fn ffmpeg_path(&self) -> Result<PathBuf> {
        let path = ffmpeg_sidecar::paths::ffmpeg_path();
        if !path.exists() {
            info!("downloading ffmpeg sidecar binary");
            ffmpeg_sidecar::download::auto_download().map_err(|error| {
                ChatcutError::encoding(format!("failed to auto-download ffmpeg sidecar binary: {error}"))
            })?;
        }
        Ok(path)
    }
}

fn select_backend(mode: FfmpegMode) -> Result<Box<dyn VideoEncoderBackend>> {
    match mode {
        FfmpegMode::Auto | FfmpegMode::System => Ok(Box::new(SystemFfmpegBackend)),
        FfmpegMode::Sidecar => {
            #[cfg(feature = "sidecar_ffmpeg")]
            {
                Ok(Box::new(SidecarFfmpegBackend))
            }
            #[cfg(not(feature = "sidecar_ffmpeg"))]
            {
                Err(ChatcutError::validation(
                    "ffmpeg sidecar mode requested but chatcut was built without `sidecar_ffmpeg`. Rebuild with `--features sidecar_ffmpeg`.",
                ))
            }
        }
    }
}

/// Streams raw RGBA frames to an `ffmpeg` child over stdin.
///
/// A writer thread drains a bounded queue into the child's stdin, so a slow
/// encoder stalls the renderer instead of growing memory. ffmpeg writes to a
/// hidden temp file beside the destination, renamed into place by `finish`.
pub struct FfmpegPipe {
    sender: Option<mpsc::SyncSender<Vec<u8>>>,
    worker: Option<JoinHandle<std::io::Result<()>>>,
    stderr: Option<JoinHandle<String>>,
    child: Child,
    staged: Option<TempPath>,
    destination: PathBuf,
    frame_len: usize,
    mode_label: &'static str,
    args: Vec<String>,
}

impl FfmpegPipe {
    pub fn spawn(settings: &EncoderSettings, output_path: &Path) -> Result<Self> {
        Self::spawn_with_mode(settings, output_path, FfmpegMode::Auto)
    }

    pub fn spawn_with_mode(
        settings: &EncoderSettings,
        output_path: &Path,
        mode: FfmpegMode,
    ) -> Result<Self> {
        settings.validate()?;
        check_output_path(output_path)?;

        let backend = select_backend(mode)?;
        let ffmpeg_path = backend.ffmpeg_path()?;
        let choice = select_encoder(settings, HostPlatform::current());
        if let Some(note) = &choice.note {
            warn!("{note}");
        }

        let staged = stage_output(output_path)?;
        let args = ffmpeg_args(settings, &choice, &staged);
        debug!(mode = backend.mode_label(), args = %args.join(" "), "spawning ffmpeg");

        let mut child = Command::new(&ffmpeg_path)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|error| {
                let message = if error.kind() == ErrorKind::NotFound {
                    format!(
                        "ffmpeg executable not found (mode={}, resolved_path={}). Install ffmpeg (system mode) or use sidecar mode with `--features sidecar_ffmpeg`.",
                        backend.mode_label(),
                        ffmpeg_path.display()
                    )
                } else {
                    format!(
                        "failed to spawn ffmpeg process (mode={}, resolved_path={}): {error}",
                        backend.mode_label(),
                        ffmpeg_path.display()
                    )
                };
                ChatcutError::encoding(message)
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ChatcutError::encoding("failed to capture ffmpeg stdin"))?;
        let stderr = child.stderr.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf);
                last_n_chars(&String::from_utf8_lossy(&buf), STDERR_TAIL_CHARS)
            })
        });

        let (sender, receiver) = mpsc::sync_channel::<Vec<u8>>(settings.queue_depth);
        let worker = thread::Builder::new()
            .name(format!("chatcut-ffmpeg-{}", backend.mode_label()))
            .spawn(move || write_frames(stdin, receiver));
        let worker = match worker {
            Ok(worker) => worker,
            Err(error) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ChatcutError::encoding(format!(
                    "failed to spawn ffmpeg writer thread: {error}"
                )));
            }
        };

        info!(
            encoder = choice.encoder,
            pix_fmt = choice.pix_fmt,
            output = %output_path.display(),
            "encoder started"
        );

        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
            stderr,
            child,
            staged: Some(staged),
            destination: output_path.to_path_buf(),
            frame_len: settings.frame_len(),
            mode_label: backend.mode_label(),
            args,
        })
    }

    fn stderr_tail(&mut self) -> String {
        self.stderr
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default()
    }

    fn join_worker(&mut self) -> Option<std::io::Error> {
        drop(self.sender.take());
        match self.worker.take().map(JoinHandle::join) {
            Some(Ok(Ok(()))) | None => None,
            Some(Ok(Err(error))) => Some(error),
            Some(Err(_)) => Some(std::io::Error::other("ffmpeg writer thread panicked")),
        }
    }
}

impl EncoderPipe for FfmpegPipe {
    fn frame_len(&self) -> usize {
        self.frame_len
    }

    fn write_frame(&mut self, frame: Vec<u8>) -> Result<()> {
        if frame.len() != self.frame_len {
            return Err(ChatcutError::encoding(format!(
                "frame size mismatch: expected {} bytes, got {}",
                self.frame_len,
                frame.len()
            )));
        }
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| ChatcutError::encoding("encoder has already been finalized"))?;
        sender
            .send(frame)
            .map_err(|_| ChatcutError::encoding("ffmpeg stopped accepting frames"))
    }

    fn finish(mut self: Box<Self>) -> Result<PathBuf> {
        let write_error = self.join_worker();
        let status = self
            .child
            .wait()
            .map_err(|error| ChatcutError::encoding(format!("failed waiting for ffmpeg: {error}")))?;
        let stderr_tail = self.stderr_tail();

        if !status.success() || write_error.is_some() {
            let mut message = format!(
                "ffmpeg failed with status {status} (mode={}, args='{}')",
                self.mode_label,
                self.args.join(" ")
            );
            if let Some(error) = write_error {
                message.push_str(&format!(", write error: {error}"));
            }
            // Dropping the staged path removes whatever ffmpeg wrote.
            drop(self.staged.take());
            return Err(ChatcutError::Encoding {
                message,
                stderr_tail,
            });
        }

        let staged = self
            .staged
            .take()
            .ok_or_else(|| ChatcutError::encoding("staged output missing"))?;
        staged
            .persist(&self.destination)
            .map_err(|error| ChatcutError::io("failed to move output into place at", &self.destination, error.error))?;
        info!(output = %self.destination.display(), "encoder finished");
        Ok(self.destination.clone())
    }

    fn abort(mut self: Box<Self>) {
        let _ = self.child.kill();
        let _ = self.join_worker();
        let _ = self.child.wait();
        let _ = self.stderr_tail();
        drop(self.staged.take());
        warn!(output = %self.destination.display(), "encoder aborted, output discarded");
    }

    fn fail(mut self: Box<Self>, error: ChatcutError) -> ChatcutError {
        let _ = self.child.kill();
        let write_error = self.join_worker();
        let status = self.child.wait();
        let stderr_tail = self.stderr_tail();
        drop(self.staged.take());
        warn!(output = %self.destination.display(), "encoder failed, output discarded");

        let mut message = format!("{error} (mode={}, args='{}')", self.mode_label, self.args.join(" "));
        if let Ok(status) = status {
            message.push_str(&format!(", ffmpeg exited with {status}"));
        }
        if let Some(write_error) = write_error {
            message.push_str(&format!(", write error: {write_error}"));
        }
        ChatcutError::Encoding {
            message,
            stderr_tail,
        }
    }
}

fn write_frames(mut stdin: ChildStdin, receiver: mpsc::Receiver<Vec<u8>>) -> std::io::Result<()> {
    while let Ok(frame) = receiver.recv() {
        stdin.write_all(&frame)?;
    }
    stdin.flush()
}

fn check_output_path(output_path: &Path) -> Result<()> {
    let path_str = output_path.to_string_lossy();
    if path_str.is_empty() {
        return Err(ChatcutError::validation("output path is empty"));
    }
    if path_str.chars().any(char::is_control) {
        return Err(ChatcutError::validation(
            "output path contains invalid control characters",
        ));
    }
    if output_path.is_dir() {
        return Err(ChatcutError::validation(format!(
            "output path {} is a directory",
            output_path.display()
        )));
    }
    Ok(())
}

fn stage_output(output_path: &Path) -> Result<TempPath> {
    let dir = match output_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    // ffmpeg picks the muxer from the extension, so the staged file keeps it.
    let suffix = output_path
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();
    tempfile::Builder::new()
        .prefix(".chatcut-")
        .suffix(&suffix)
        .tempfile_in(&dir)
        .map(tempfile::NamedTempFile::into_temp_path)
        .map_err(|error| ChatcutError::io("failed to stage output in", dir, error))
}

fn last_n_chars(s: &str, max_chars: usize) -> String {
    let count = s.chars().count();
    s.chars()
        .skip(count.saturating_sub(max_chars))
        .collect::<String>()
        .trim()
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(codec: Codec, transparent: bool, hwaccel: bool) -> EncoderSettings {
        EncoderSettings {
            width: 400,
            height: 540,
            fps: 60,
            codec,
            transparent,
            hwaccel,
            queue_depth: 4,
        }
    }

    #[test]
    fn software_encoders_per_codec() {
        let cases = [
            (Codec::H264, false, "libx264", "yuv420p"),
            (Codec::Hevc, true, "libx265", "yuva420p"),
            (Codec::Prores4444, true, "prores_ks", "yuva444p10le"),
            (Codec::Prores4444, false, "prores_ks", "yuv422p10le"),
            (Codec::Av1, false, "libsvtav1", "yuv420p"),
        ];
        for (codec, alpha, encoder, pix_fmt) in cases {
            let chosen = select_encoder(&settings(codec, alpha, false), HostPlatform::Other);
            assert_eq!(chosen.encoder, encoder, "{codec:?}");
            assert_eq!(chosen.pix_fmt, pix_fmt, "{codec:?}");
            assert!(chosen.note.is_none());
        }
    }

    #[test]
    fn hwaccel_maps_per_platform() {
        let mac = select_encoder(&settings(Codec::Hevc, true, true), HostPlatform::MacOs);
        assert_eq!(mac.encoder, "hevc_videotoolbox");
        assert_eq!(mac.pix_fmt, "bgra");

        let h264 = select_encoder(&settings(Codec::H264, false, true), HostPlatform::Other);
        assert_eq!(h264.encoder, "libx264");
        assert_eq!(
            h264.note.as_deref(),
            Some("hardware encoding is only available on macOS; using libx264")
        );

        let prores = select_encoder(&settings(Codec::Prores4444, false, true), HostPlatform::Other);
        assert_eq!(prores.encoder, "prores_ks");
        assert!(prores.note.is_some(), "software fallback is reported");
    }

    #[test]
    fn every_codec_falls_back_to_software_off_macos() {
        for (codec, software) in [
            (Codec::H264, "libx264"),
            (Codec::Hevc, "libx265"),
            (Codec::Prores4444, "prores_ks"),
            (Codec::Av1, "libsvtav1"),
        ] {
            let requested = select_encoder(&settings(codec, false, true), HostPlatform::Other);
            let plain = select_encoder(&settings(codec, false, false), HostPlatform::Other);
            assert_eq!(requested.encoder, software);
            assert_eq!(requested.extra, plain.extra);
            assert!(requested.note.is_some());
            assert!(plain.note.is_none());
        }
    }

    #[test]
    fn args_describe_raw_rgba_input_and_output() {
        let settings = settings(Codec::H264, false, false);
        let chosen = select_encoder(&settings, HostPlatform::Other);
        let args = ffmpeg_args(&settings, &chosen, Path::new("/tmp/out.mp4"));
        let joined = args.join(" ");
        assert!(joined.contains("-f rawvideo -pix_fmt rgba -s:v 400x540 -r 60 -i -"));
        assert!(joined.contains("-c:v libx264 -pix_fmt yuv420p"));
        assert!(joined.contains("-movflags +faststart"));
        assert_eq!(args.last().map(String::as_str), Some("/tmp/out.mp4"));
    }

    #[test]
    fn invalid_settings_fail_before_spawning() {
        let dir = tempfile::tempdir().expect("tempdir");
        let output = dir.path().join("out.mp4");
        let error = FfmpegPipe::spawn(&settings(Codec::H264, true, false), &output)
            .err()
            .expect("alpha with h264");
        assert_eq!(error.code(), "VALIDATION_ERROR");

        let odd = EncoderSettings {
            width: 401,
            ..settings(Codec::Hevc, false, false)
        };
        let error = FfmpegPipe::spawn(&odd, &output).err().expect("odd width");
        assert_eq!(error.code(), "VALIDATION_ERROR");
        assert_eq!(std::fs::read_dir(dir.path()).expect("list").count(), 0);
    }

    #[test]
    fn stderr_tail_keeps_the_end() {
        let long = format!("{}END", "x".repeat(1000));
        let tail = last_n_chars(&long, 10);
        assert_eq!(tail, "xxxxxxxEND");
    }
}
