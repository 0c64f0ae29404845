use std::path::Path;

use chatcut::assets::AssetAtlas;
use chatcut::chat_log::load_chat_log;
use chatcut::config::{Resolution, RenderConfig};
use chatcut::edl::load_edl;
use chatcut::renderer::{FontSet, FrameRenderer};
use chatcut::timeline::build_segments;
use chatcut::window::ChatWindowEngine;

fn fixture(name: &str) -> std::path::PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

fn config() -> RenderConfig {
    RenderConfig {
        resolution: Resolution {
            width: 160,
            height: 120,
        },
        fps: 10,
        ..RenderConfig::default()
    }
}

/// Hash of every frame of the fixture render, in order.
fn sequence_hash(config: &RenderConfig) -> Vec<u64> {
    let events = load_chat_log(&fixture("resync_chat.json")).expect("chat loads");
    let document = load_edl(&fixture("resync.edl"), 30.0).expect("edl parses");
    let timeline = build_segments(&document.clips, "stream.mkv", 30.0).expect("timeline builds");
    let renderer = FrameRenderer::new(
        config,
        FontSet::fallback(),
        AssetAtlas::empty(config.skip_avatars, config.skip_emojis),
    );

    ChatWindowEngine::new(
        &events,
        &timeline,
        config.fps,
        config.retention.clone(),
        config.scroll_frames,
    )
    .map(|state| {
        let frame = renderer.compose(&state).expect("frame composes");
        assert_eq!(frame.pixels.len(), config.frame_len());
        fnv1a64(&frame.pixels)
    })
    .collect()
}

#[test]
fn determinism_identical_inputs_give_identical_frames() {
    let first = sequence_hash(&config());
    let second = sequence_hash(&config());
    assert_eq!(first.len(), 70);
    assert_eq!(first, second, "render must be byte-for-byte reproducible");
}

#[test]
fn determinism_parallel_and_sequential_composition_agree() {
    use rayon::prelude::*;

    let config = config();
    let events = load_chat_log(&fixture("resync_chat.json")).expect("chat loads");
    let document = load_edl(&fixture("resync.edl"), 30.0).expect("edl parses");
    let timeline = build_segments(&document.clips, "stream.mkv", 30.0).expect("timeline builds");
    let renderer = FrameRenderer::new(&config, FontSet::fallback(), AssetAtlas::empty(false, false));
    let states = ChatWindowEngine::new(
        &events,
        &timeline,
        config.fps,
        config.retention.clone(),
        config.scroll_frames,
    )
    .collect::<Vec<_>>();

    let parallel = states
        .par_iter()
        .map(|state| fnv1a64(&renderer.compose(state).expect("compose").pixels))
        .collect::<Vec<_>>();
    assert_eq!(parallel, sequence_hash(&config));
}

#[test]
fn determinism_style_changes_change_output() {
    let base = sequence_hash(&config());
    let restyled = sequence_hash(&RenderConfig {
        chat_scale: 1.5,
        ..config()
    });
    assert_ne!(base, restyled);
}

fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325_u64;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0001_0000_01b3);
    }
    hash
}
