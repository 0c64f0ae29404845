use std::sync::OnceLock;

use regex::Regex;

/// Parse an SMPTE-style `HH:MM:SS:FF` timecode into seconds at `fps`.
///
/// `;` and `.` are accepted as the frame separator (drop-frame notation is
/// read as a plain frame count; the timeline only needs consistent
/// arithmetic across one document). `HH:MM:SS` without a frame field is also
/// accepted.
pub fn timecode_to_seconds(raw: &str, fps: f64) -> Result<f64, String> {
    static TIMECODE_RE: OnceLock<Regex> = OnceLock::new();
    let re = TIMECODE_RE.get_or_init(|| {
        Regex::new(r"^(\d{1,2}):(\d{2}):(\d{2})(?:[:;.](\d{2,3}))?$")
            .expect("timecode regex should compile")
    });

    if !fps.is_finite() || fps <= 0.0 {
        return Err(format!("frame rate must be > 0, got {fps}"));
    }

    let captures = re
        .captures(raw.trim())
        .ok_or_else(|| format!("malformed timecode '{raw}' (expected HH:MM:SS:FF)"))?;

    let field = |idx: usize| -> u32 {
        captures
            .get(idx)
            .and_then(|m| m.as_str().parse::<u32>().ok())
            .unwrap_or(0)
    };
    let (hours, minutes, seconds, frames) = (field(1), field(2), field(3), field(4));

    if minutes >= 60 || seconds >= 60 {
        return Err(format!("malformed timecode '{raw}': minutes/seconds out of range"));
    }
    let frames_per_second = fps.ceil() as u32;
    if frames >= frames_per_second {
        return Err(format!(
            "malformed timecode '{raw}': frame {frames} out of range at {fps} fps"
        ));
    }

    let whole = f64::from(hours * 3600 + minutes * 60 + seconds);
    Ok(whole + f64::from(frames) / fps)
}

/// Format seconds as `HH:MM:SS:FF` at `fps`, for log and CLI output.
pub fn seconds_to_timecode(seconds: f64, fps: f64) -> String {
    let fps = fps.max(1.0);
    let total_frames = (seconds.max(0.0) * fps).round() as u64;
    let nominal = fps.ceil() as u64;
    let frames = total_frames % nominal;
    let total_seconds = total_frames / nominal;
    format!(
        "{:02}:{:02}:{:02}:{:02}",
        total_seconds / 3600,
        (total_seconds / 60) % 60,
        total_seconds % 60,
        frames
    )
}
