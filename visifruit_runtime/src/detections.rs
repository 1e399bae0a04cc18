//! Frame source + detector shim (§6 "consumed" interfaces the core
//! does not implement): replays a scripted newline-delimited JSON feed
//! of frames, each carrying an offset from process start and the raw
//! detections observed in it. Stands in for the camera + vision-model
//! pipeline that §1 explicitly scopes out of the core.

use std::path::Path;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use visifruit_common::types::{BBoxPx, FruitClass, RawDetection};

#[derive(Debug, Deserialize)]
struct ScriptedFrame {
    offset_ms: u64,
    detections: Vec<ScriptedDetection>,
}

#[derive(Debug, Deserialize)]
struct ScriptedDetection {
    class: String,
    confidence: f64,
    bbox_px: [f64; 4],
}

pub(crate) fn parse_class(s: &str) -> FruitClass {
    match s.to_ascii_lowercase().as_str() {
        "apple" => FruitClass::Apple,
        "pear" => FruitClass::Pear,
        "lemon" => FruitClass::Lemon,
        _ => FruitClass::Unknown,
    }
}

/// Parses `path` once at startup and spawns a task that replays each
/// frame against `epoch`, sending its detections as they come due. The
/// task exits once every frame has played, which drops the sender and
/// lets the orchestrator's receive loop observe the feed closing
/// gracefully, per §6's "on shutdown, closes; the orchestrator drains
/// gracefully".
pub fn spawn_from_file(
    path: &Path,
    epoch: Instant,
) -> std::io::Result<mpsc::Receiver<(Vec<RawDetection>, Instant)>> {
    let text = std::fs::read_to_string(path)?;
    let mut frames = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<ScriptedFrame>(line) {
            Ok(frame) => frames.push(frame),
            Err(error) => warn!(
                path = %path.display(),
                line = lineno + 1,
                %error,
                "skipping malformed detection frame"
            ),
        }
    }
    frames.sort_by_key(|f| f.offset_ms);
    info!(path = %path.display(), frames = frames.len(), "loaded scripted detection feed");

    let (tx, rx) = mpsc::channel(8);
    tokio::spawn(async move {
        for frame in frames {
            let fire_at = epoch + Duration::from_millis(frame.offset_ms);
            let now = Instant::now();
            if fire_at > now {
                tokio::time::sleep(fire_at - now).await;
            }
            let frame_time = Instant::now();
            let detections = frame
                .detections
                .into_iter()
                .map(|d| RawDetection {
                    class: parse_class(&d.class),
                    confidence: d.confidence,
                    bbox_px: BBoxPx { x1: d.bbox_px[0], y1: d.bbox_px[1], x2: d.bbox_px[2], y2: d.bbox_px[3] },
                    frame_time,
                })
                .collect();
            if tx.send((detections, frame_time)).await.is_err() {
                break;
            }
        }
        info!("scripted detection feed exhausted");
    });
    Ok(rx)
}
