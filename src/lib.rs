//! chatcut: render live-chat replays as video overlays that follow an edited
//! timeline.
//!
//! The pipeline, leaf first: [`chat_log`] and [`edl`] parse inputs,
//! [`timeline`] maps output time back to stream time, [`window`] decides what
//! is on screen each frame, [`renderer`] draws it and [`encoding`] streams the
//! frames to ffmpeg. [`pipeline`] wires them together.

pub mod assets;
pub mod chat_log;
pub mod config;
pub mod edl;
pub mod encoding;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod renderer;
pub mod style;
pub mod timecode;
pub mod timeline;
pub mod window;

pub use error::{ChatcutError, Result};
