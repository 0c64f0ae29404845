use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::info;

use chatcut::assets::{AssetResolver, HttpAssetCache, OfflineResolver};
use chatcut::config::{load_render_config, Codec, RenderConfig};
use chatcut::edl::{load_edl, summarize_clip_names};
use chatcut::encoding::{EncoderPipe, FfmpegMode, FfmpegPipe};
use chatcut::error::find_chatcut_error;
use chatcut::logging::init_logging;
use chatcut::pipeline::{
    prepare, render, render_still, save_png, CancelToken, PreparedJob, RenderRequest,
    TimelineSource,
};
use chatcut::style::Rgba;
use chatcut::timecode::seconds_to_timecode;

#[derive(Debug, Parser)]
#[command(name = "chatcut")]
#[command(version = env!("CHATCUT_VERSION"))]
#[command(about = "Render live-chat replays as overlays resynchronized to an edited timeline")]
struct Cli {
    /// Debug logging (CHATCUT_LOG overrides).
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Print machine-readable JSON: summaries on stdout, error envelopes on stderr.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Render the chat overlay video.
    Render {
        #[command(flatten)]
        job: JobArgs,
        #[arg(short = 'o', long = "output")]
        output: PathBuf,
        /// Write a single PNG frame at this output time (seconds) instead of a video.
        #[arg(long)]
        still: Option<f64>,
        /// Never download avatars or emoji.
        #[arg(long)]
        offline: bool,
        #[arg(long, value_enum, default_value_t = FfmpegArg::System)]
        ffmpeg: FfmpegArg,
    },
    /// Validate inputs and report the reconstructed timeline without rendering.
    Check {
        #[command(flatten)]
        job: JobArgs,
    },
    /// List clip names in an EDL with their event counts.
    Clips {
        edl: PathBuf,
        /// Frame rate of the EDL timecodes.
        #[arg(long, default_value_t = 30.0)]
        fps: f64,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FfmpegArg {
    System,
    Sidecar,
}

#[derive(Debug, Args)]
struct JobArgs {
    /// Chat replay (YouTube JSON lines, JSON array, or normalized events).
    chat: PathBuf,
    /// Edit decision list the overlay should follow.
    #[arg(long)]
    edl: Option<PathBuf>,
    /// Clip name to follow in the EDL. Defaults to the most-used clip.
    #[arg(long, requires = "edl")]
    clip: Option<String>,
    /// Frame rate of the EDL timecodes. Defaults to the output fps.
    #[arg(long, requires = "edl")]
    edl_fps: Option<f64>,
    /// Start of the chat window in seconds, without an EDL.
    #[arg(long, default_value_t = 0.0, conflicts_with = "edl")]
    from: f64,
    /// End of the chat window in seconds, without an EDL.
    #[arg(long, conflicts_with = "edl")]
    to: Option<f64>,
    /// Render config file (YAML or JSON).
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[command(flatten)]
    overrides: ConfigOverrides,
}

#[derive(Debug, Args)]
struct ConfigOverrides {
    #[arg(long)]
    width: Option<u32>,
    #[arg(long)]
    height: Option<u32>,
    #[arg(long)]
    fps: Option<u32>,
    #[arg(long)]
    codec: Option<Codec>,
    #[arg(long)]
    transparent: bool,
    #[arg(long)]
    hwaccel: bool,
    #[arg(long)]
    background: Option<Rgba>,
    #[arg(long)]
    scale: Option<f32>,
    #[arg(long)]
    max_lines: Option<usize>,
    #[arg(long)]
    max_age: Option<f64>,
    #[arg(long)]
    skip_avatars: bool,
    #[arg(long)]
    skip_emojis: bool,
    #[arg(long)]
    clip_at_top: bool,
    #[arg(long)]
    scroll_frames: Option<u32>,
    #[arg(long)]
    author_font: Option<PathBuf>,
    #[arg(long)]
    message_font: Option<PathBuf>,
    #[arg(long)]
    cache_dir: Option<PathBuf>,
    #[arg(long)]
    threads: Option<usize>,
}

impl ConfigOverrides {
    fn apply(&self, config: &mut RenderConfig) {
        if let Some(width) = self.width {
            config.resolution.width = width;
        }
        if let Some(height) = self.height {
            config.resolution.height = height;
        }
        if let Some(fps) = self.fps {
            config.fps = fps;
        }
        if let Some(codec) = self.codec {
            config.codec = codec;
        }
        config.transparent |= self.transparent;
        config.hwaccel |= self.hwaccel;
        if let Some(background) = self.background {
            config.background = background;
        }
        if let Some(scale) = self.scale {
            config.chat_scale = scale;
        }
        if let Some(max_lines) = self.max_lines {
            config.retention.max_lines = max_lines;
        }
        if self.max_age.is_some() {
            config.retention.max_age = self.max_age;
        }
        config.skip_avatars |= self.skip_avatars;
        config.skip_emojis |= self.skip_emojis;
        config.clip_at_top |= self.clip_at_top;
        if let Some(frames) = self.scroll_frames {
            config.scroll_frames = frames;
        }
        if self.author_font.is_some() {
            config.author_font = self.author_font.clone();
        }
        if self.message_font.is_some() {
            config.message_font = self.message_font.clone();
        }
        if self.cache_dir.is_some() {
            config.assets.cache_dir = self.cache_dir.clone();
        }
        if self.threads.is_some() {
            config.render_threads = self.threads;
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let json = cli.json;
    let result = match cli.command {
        Commands::Render {
            job,
            output,
            still,
            offline,
            ffmpeg,
        } => run_render(&job, &output, still, offline, ffmpeg),
        Commands::Check { job } => run_check(&job, json),
        Commands::Clips { edl, fps } => run_clips(&edl, fps, json),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => report_error(&error, json),
    }
}

fn report_error(error: &anyhow::Error, json: bool) -> ExitCode {
    let typed = find_chatcut_error(error);
    if json {
        let envelope = match typed {
            Some(typed) => serde_json::to_string(&typed.envelope()),
            None => serde_json::to_string(&serde_json::json!({
                "ok": false,
                "error": { "code": "INTERNAL_ERROR", "message": format!("{error:#}") }
            })),
        };
        match envelope {
            Ok(line) => eprintln!("{line}"),
            Err(_) => eprintln!("error: {error:#}"),
        }
    } else {
        eprintln!("error: {error:#}");
    }
    let code = typed.map(|typed| typed.exit_code()).unwrap_or(1);
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn load_job(args: &JobArgs) -> Result<PreparedJob> {
    let mut config = match &args.config {
        Some(path) => load_render_config(path)
            .with_context(|| format!("failed to load render config {}", path.display()))?,
        None => RenderConfig::default(),
    };
    args.overrides.apply(&mut config);

    let timeline = match &args.edl {
        Some(path) => TimelineSource::Edl {
            path: path.clone(),
            clip_name: args.clip.clone(),
            fps: args.edl_fps,
        },
        None => TimelineSource::Window {
            from: args.from,
            to: args.to,
        },
    };
    let request = RenderRequest {
        chat_path: args.chat.clone(),
        timeline,
        config,
    };
    Ok(prepare(&request)?)
}

fn run_check(args: &JobArgs, json: bool) -> Result<()> {
    let job = load_job(args)?;
    let summary = job.summary();
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    let config = &job.config;
    println!(
        "OK: {} ({}x{}, {} fps, {}, {} frames, {:.2}s)",
        args.chat.display(),
        config.resolution.width,
        config.resolution.height,
        config.fps,
        config.codec.label(),
        summary.total_frames,
        summary.duration_secs
    );
    if let Some(clip) = &summary.clip_name {
        println!(
            "Clip: {clip} ({} segments, {:.2}s mapped)",
            summary.segments, summary.mapped_duration_secs
        );
    }
    if summary.segments > 0 {
        let fps = f64::from(config.fps);
        println!(
            "Source: {} - {}",
            seconds_to_timecode(summary.source_start_secs, fps),
            seconds_to_timecode(summary.source_end_secs, fps)
        );
    }
    println!(
        "Chat: {} messages, {} inside the mapped ranges",
        summary.chat_events, summary.played_events
    );
    if !summary.played_roles.is_empty() {
        let roles = summary
            .played_roles
            .iter()
            .map(|(role, count)| format!("{role} {count}"))
            .collect::<Vec<_>>();
        println!("Roles: {}", roles.join(", "));
    }
    Ok(())
}

fn run_clips(edl: &Path, fps: f64, json: bool) -> Result<()> {
    let document = load_edl(edl, fps)?;
    let usage = summarize_clip_names(&document.clips);
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "title": document.title,
                "selected": usage.first().map(|clip| clip.clip_name.clone()),
                "clips": usage,
            }))?
        );
        return Ok(());
    }

    if let Some(title) = &document.title {
        println!("Title: {title}");
    }
    for clip in &usage {
        println!("{:>5}  {}", clip.events, clip.clip_name);
    }
    match usage.first() {
        Some(first) => println!("Selected: {}", first.clip_name),
        None => println!("No video events found"),
    }
    Ok(())
}

fn run_render(
    args: &JobArgs,
    output: &Path,
    still: Option<f64>,
    offline: bool,
    ffmpeg: FfmpegArg,
) -> Result<()> {
    let job = load_job(args)?;
    let resolver: Box<dyn AssetResolver> = if offline {
        Box::new(OfflineResolver)
    } else {
        Box::new(HttpAssetCache::new(&job.config.assets)?)
    };

    if let Some(seconds) = still {
        let frame = render_still(&job, resolver.as_ref(), seconds)?;
        save_png(&frame, output)?;
        println!("Wrote {}", output.display());
        return Ok(());
    }

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        info!("interrupt received, stopping");
        handler_token.cancel();
    })
    .context("failed to install Ctrl-C handler")?;

    let mode = match ffmpeg {
        FfmpegArg::System => FfmpegMode::System,
        FfmpegArg::Sidecar => FfmpegMode::Sidecar,
    };
    let summary = render(
        &job,
        resolver.as_ref(),
        |settings| {
            let pipe = FfmpegPipe::spawn_with_mode(settings, output, mode)?;
            Ok(Box::new(pipe) as Box<dyn EncoderPipe>)
        },
        &cancel,
    )?;
    println!(
        "Wrote {} ({} frames in {:.1}s)",
        summary.output.display(),
        summary.frames,
        summary.elapsed_secs
    );
    Ok(())
}
