//! Host capture threads feeding a [`FrameRing`]: a looping image-directory
//! reader and a synthetic test-pattern camera.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use chrono::Utc;
use image::{DynamicImage, imageops::FilterType};
use tracing::{debug, info, warn};

use crate::{
    rgb565,
    ring::{FrameRing, FrameSource},
    types::{CaptureError, FrameGeometry, PixelFormat},
};

const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

/// Spawn a thread that replays every image in `dir` into `ring` at `fps`,
/// looping until `running` is cleared.
///
/// Images are decoded and converted to the ring's geometry up front so the
/// capture loop only copies bytes.
pub fn spawn_image_dir_reader(
    dir: &Path,
    ring: Arc<FrameRing>,
    fps: u32,
    running: Arc<AtomicBool>,
) -> Result<thread::JoinHandle<()>, CaptureError> {
    let frames = load_image_dir(dir, &ring.geometry())?;
    info!(
        "Loaded {} frame(s) from {} for replay at {fps} fps",
        frames.len(),
        dir.display()
    );
    let interval = frame_interval(fps);

    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name("capture-image-dir".into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, || {
            let mut cursor = 0usize;
            while running.load(Ordering::Relaxed) {
                let started = Instant::now();
                let data = frames[cursor].clone();
                cursor = (cursor + 1) % frames.len();
                if let Err(err) = ring.push(data, Utc::now().timestamp_millis()) {
                    warn!("Dropping replayed frame: {err}");
                }
                pace(started, interval);
            }
            debug!("image directory capture stopped");
        }))
        .map_err(CaptureError::from)
}

/// Spawn a thread producing a moving test pattern at `fps`.
pub fn spawn_synthetic_camera(
    ring: Arc<FrameRing>,
    fps: u32,
    running: Arc<AtomicBool>,
) -> Result<thread::JoinHandle<()>, CaptureError> {
    let interval = frame_interval(fps);
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name("capture-synthetic".into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, || {
            let geometry = ring.geometry();
            let mut tick: u32 = 0;
            while running.load(Ordering::Relaxed) {
                let started = Instant::now();
                let rgb = test_pattern(geometry.width, geometry.height, tick);
                let data = convert_rgb888(&rgb, geometry.format);
                if let Err(err) = ring.push(data, Utc::now().timestamp_millis()) {
                    warn!("Dropping synthetic frame: {err}");
                }
                tick = tick.wrapping_add(1);
                pace(started, interval);
            }
            debug!("synthetic capture stopped");
        }))
        .map_err(CaptureError::from)
}

fn load_image_dir(dir: &Path, geometry: &FrameGeometry) -> Result<Vec<Vec<u8>>, CaptureError> {
    let entries = fs::read_dir(dir).map_err(|_| CaptureError::Open {
        path: dir.to_path_buf(),
    })?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();

    let mut frames = Vec::with_capacity(paths.len());
    for path in paths {
        match image::open(&path) {
            Ok(img) => frames.push(convert_image(img, geometry)),
            Err(err) => warn!("Skipping {}: {err}", path.display()),
        }
    }

    if frames.is_empty() {
        return Err(CaptureError::Empty {
            path: dir.to_path_buf(),
        });
    }
    Ok(frames)
}

fn convert_image(img: DynamicImage, geometry: &FrameGeometry) -> Vec<u8> {
    let resized = if img.width() != geometry.width || img.height() != geometry.height {
        img.resize_exact(geometry.width, geometry.height, FilterType::Triangle)
    } else {
        img
    };
    match geometry.format {
        PixelFormat::Gray8 => resized.to_luma8().into_raw(),
        format => {
            let rgb = resized.to_rgb8().into_raw();
            convert_rgb888(&rgb, format)
        }
    }
}

fn convert_rgb888(rgb: &[u8], format: PixelFormat) -> Vec<u8> {
    match format {
        PixelFormat::Rgb565 => rgb565::from_rgb888(rgb),
        PixelFormat::Rgb888 => rgb.to_vec(),
        PixelFormat::Gray8 => rgb
            .chunks_exact(3)
            .map(|px| ((px[0] as u32 * 77 + px[1] as u32 * 150 + px[2] as u32 * 29) >> 8) as u8)
            .collect(),
    }
}

fn test_pattern(width: u32, height: u32, tick: u32) -> Vec<u8> {
    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    let bar = if width > 0 { (tick * 4) % width } else { 0 };
    for y in 0..height {
        for x in 0..width {
            if x.abs_diff(bar) < 8 {
                rgb.extend_from_slice(&[255, 255, 255]);
            } else {
                let r = ((x * 255) / width.max(1)) as u8;
                let g = ((y * 255) / height.max(1)) as u8;
                rgb.extend_from_slice(&[r, g, 96]);
            }
        }
    }
    rgb
}

fn frame_interval(fps: u32) -> Duration {
    Duration::from_millis(1000 / fps.max(1) as u64)
}

fn pace(started: Instant, interval: Duration) {
    let elapsed = started.elapsed();
    if elapsed < interval {
        thread::sleep(interval - elapsed);
    }
}
