//! # Chorus
//!
//! Minimal terminal front end for the playback engine: load a track from a
//! path or URL, then drive it with one-line commands on stdin.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chorus_core::Resource;
use chorus_playback::engine::{AudioEngine, PlayerEvent};
use chorus_playback::graph::OutputGraph;
use chorus_playback::output::CpalGraph;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chorus=info,chorus_playback=info".into()),
        )
        .init();

    info!("Starting Chorus v{}", env!("CARGO_PKG_VERSION"));

    let Some(target) = std::env::args().nth(1) else {
        bail!("usage: chorus <path-or-url>");
    };
    let resource = if target.starts_with("http://") || target.starts_with("https://") {
        Resource::Url(target)
    } else {
        Resource::Path(PathBuf::from(target))
    };

    let graph = Arc::new(CpalGraph::new().context("failed to open audio output")?);
    println!(
        "output: {} ({} Hz, {} ch)",
        graph.device_name(),
        graph.sample_rate(),
        graph.channels()
    );

    let engine =
        AudioEngine::new(Arc::clone(&graph) as Arc<dyn OutputGraph>).context("engine start")?;

    // Print events as they arrive, without blocking the prompt.
    let events = engine.events();
    std::thread::spawn(move || {
        for event in events {
            match event {
                PlayerEvent::StateChanged(state) => println!("\r[state] {state:?}"),
                PlayerEvent::DurationChanged(d) => println!("\r[duration] {d:.1}s"),
                PlayerEvent::Ended => println!("\r[ended]"),
                PlayerEvent::Error(e) => println!("\r[error] {e}"),
                PlayerEvent::TimeUpdate(_) => {}
            }
        }
    });

    let metadata = engine.load(resource).wait().context("load failed")?;
    let title = metadata
        .tags
        .get("TrackTitle")
        .or_else(|| metadata.tags.get("Title"))
        .map_or("unknown", String::as_str);
    println!(
        "loaded: {title} [{}] {:.1}s, {} Hz, {} ch",
        metadata.encoding, metadata.duration, metadata.sample_rate, metadata.channels
    );

    engine.play();
    println!("commands: play | pause | seek <secs> | vol <0-100> | time | quit");

    let stdin = io::stdin();
    loop {
        print!("> ");
        io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("play") => engine.play(),
            Some("pause") => engine.pause(),
            Some("seek") => match parts.next().and_then(|s| s.parse::<f64>().ok()) {
                Some(t) => engine.seek(t),
                None => println!("usage: seek <secs>"),
            },
            Some("vol") => match parts.next().and_then(|s| s.parse::<f32>().ok()) {
                Some(v) => engine.set_volume(v / 100.0),
                None => println!("usage: vol <0-100>"),
            },
            Some("time") => {
                println!("{:.1}s / {:.1}s", engine.current_time(), engine.duration());
            }
            Some("quit" | "q") => break,
            Some(other) => println!("unknown command: {other}"),
            None => {}
        }
    }

    Ok(())
}
