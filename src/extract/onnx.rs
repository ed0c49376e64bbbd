//! ONNX Runtime face analyzer: a detector producing scored boxes and a
//! recognizer embedding 112x112 face crops.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{Context, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ort::session::{builder::GraphOptimizationLevel, Session};

use super::{BoundingBox, DetectedFace, FaceAnalyzer};
use crate::config::ModelConfig;

const RECOGNIZER_SIZE: u32 = 112;

/// One detector + recognizer pair. Sessions need exclusive access to run.
struct SessionPair {
    detector: Mutex<Session>,
    recognizer: Mutex<Session>,
}

impl SessionPair {
    fn load(config: &ModelConfig, intra_threads: usize) -> Result<Self> {
        let detector = build_session(Path::new(&config.detector_path), intra_threads)
            .with_context(|| format!("loading detector {}", config.detector_path))?;
        let recognizer = build_session(Path::new(&config.recognizer_path), intra_threads)
            .with_context(|| format!("loading recognizer {}", config.recognizer_path))?;
        Ok(Self {
            detector: Mutex::new(detector),
            recognizer: Mutex::new(recognizer),
        })
    }
}

fn build_session(path: &Path, intra_threads: usize) -> Result<Session> {
    if !path.exists() {
        anyhow::bail!("model file not found: {}", path.display());
    }
    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(intra_threads)?
        .commit_from_file(path)?;
    Ok(session)
}

/// Pool of session pairs picked round-robin so concurrent workers rarely
/// contend on the same session.
pub struct OnnxFaceAnalyzer {
    pairs: Vec<SessionPair>,
    next_idx: AtomicUsize,
    det_size: u32,
    score_threshold: f32,
    dimension: usize,
}

impl OnnxFaceAnalyzer {
    pub fn from_config(config: &ModelConfig, dimension: usize) -> Result<Self> {
        let size = config.pool_size.clamp(1, 8);
        let threads_per_instance = (config.intra_threads / size).max(1);

        #[cfg(feature = "gpu")]
        tracing::info!("GPU feature enabled, ort will use CUDA when available");

        let mut pairs = Vec::with_capacity(size);
        for i in 0..size {
            pairs.push(SessionPair::load(config, threads_per_instance)?);
            tracing::debug!("Face analyzer: session pair {}/{} loaded", i + 1, size);
        }

        tracing::info!(
            "Face analyzer initialized: {} session pairs, {} threads each, det_size={}, {} dims",
            size,
            threads_per_instance,
            config.det_size,
            dimension
        );

        Ok(Self {
            pairs,
            next_idx: AtomicUsize::new(0),
            det_size: config.det_size.max(32),
            score_threshold: config.score_threshold,
            dimension,
        })
    }

    fn pick(&self) -> &SessionPair {
        let idx = self.next_idx.fetch_add(1, Ordering::Relaxed) % self.pairs.len();
        &self.pairs[idx]
    }

    fn detect(&self, pair: &SessionPair, image: &RgbImage) -> Result<Vec<(BoundingBox, f32)>> {
        let (tensor_data, scale) = letterbox(image, self.det_size);
        let size = self.det_size as usize;
        let input = ort::value::Tensor::from_array(([1usize, 3, size, size], tensor_data))?;

        let mut session = pair
            .detector
            .lock()
            .map_err(|e| anyhow::anyhow!("Detector lock poisoned: {}", e))?;
        let outputs = session.run(ort::inputs![input])?;
        let (shape, data) = outputs[0].try_extract_tensor::<f32>()?;

        // Rows of [x1, y1, x2, y2, score, ...landmarks]
        let stride = shape.last().copied().unwrap_or(5).max(5) as usize;
        let boxes = parse_detections(data, stride, self.score_threshold, scale, image);
        Ok(boxes)
    }

    fn embed(&self, pair: &SessionPair, image: &RgbImage, bbox: &BoundingBox) -> Result<Vec<f32>> {
        let crop = crop_face(image, bbox);
        let side = RECOGNIZER_SIZE as usize;
        let input = ort::value::Tensor::from_array(([1usize, 3, side, side], to_chw(&crop, 127.5)))?;

        let mut session = pair
            .recognizer
            .lock()
            .map_err(|e| anyhow::anyhow!("Recognizer lock poisoned: {}", e))?;
        let outputs = session.run(ort::inputs![input])?;
        let (_, data) = outputs[0].try_extract_tensor::<f32>()?;

        if data.len() != self.dimension {
            anyhow::bail!(
                "recognizer produced {} values, expected {}",
                data.len(),
                self.dimension
            );
        }
        Ok(l2_normalize(data.to_vec()))
    }
}

impl FaceAnalyzer for OnnxFaceAnalyzer {
    fn analyze(&self, image: &RgbImage) -> Result<Vec<DetectedFace>> {
        let pair = self.pick();
        let detections = self.detect(pair, image)?;

        let mut faces = Vec::with_capacity(detections.len());
        for (bbox, score) in detections {
            let embedding = self.embed(pair, image, &bbox)?;
            faces.push(DetectedFace {
                bbox,
                score,
                embedding,
            });
        }
        Ok(faces)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Resize keeping aspect ratio onto a zero-padded square canvas.
/// Returns CHW data and the applied scale factor.
fn letterbox(image: &RgbImage, target: u32) -> (Box<[f32]>, f32) {
    let (w, h) = image.dimensions();
    let scale = target as f32 / w.max(h).max(1) as f32;
    let new_w = ((w as f32 * scale).round() as u32).clamp(1, target);
    let new_h = ((h as f32 * scale).round() as u32).clamp(1, target);

    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);
    let mut canvas = RgbImage::new(target, target);
    imageops::replace(&mut canvas, &resized, 0, 0);

    (to_chw(&canvas, 128.0), scale)
}

/// Planar RGB with `(x - 127.5) / std` normalization.
fn to_chw(image: &RgbImage, std: f32) -> Box<[f32]> {
    let (w, h) = image.dimensions();
    let plane = (w * h) as usize;
    let mut out = vec![0f32; plane * 3];
    for (x, y, pixel) in image.enumerate_pixels() {
        let offset = (y * w + x) as usize;
        for c in 0..3 {
            out[c * plane + offset] = (pixel[c] as f32 - 127.5) / std;
        }
    }
    out.into_boxed_slice()
}

fn parse_detections(
    data: &[f32],
    stride: usize,
    score_threshold: f32,
    scale: f32,
    image: &RgbImage,
) -> Vec<(BoundingBox, f32)> {
    let (w, h) = (image.width() as f32, image.height() as f32);
    data.chunks_exact(stride)
        .filter(|row| row[4] >= score_threshold)
        .map(|row| {
            let bbox = BoundingBox {
                x1: (row[0] / scale).clamp(0.0, w),
                y1: (row[1] / scale).clamp(0.0, h),
                x2: (row[2] / scale).clamp(0.0, w),
                y2: (row[3] / scale).clamp(0.0, h),
            };
            (bbox, row[4])
        })
        .filter(|(bbox, _)| bbox.area() > 0.0)
        .collect()
}

/// Square crop around the box center, resized for the recognizer.
fn crop_face(image: &RgbImage, bbox: &BoundingBox) -> RgbImage {
    let side = bbox.width().max(bbox.height()).max(1.0);
    let cx = (bbox.x1 + bbox.x2) / 2.0;
    let cy = (bbox.y1 + bbox.y2) / 2.0;

    let x = (cx - side / 2.0).max(0.0) as u32;
    let y = (cy - side / 2.0).max(0.0) as u32;
    let cw = (side as u32).min(image.width().saturating_sub(x)).max(1);
    let ch = (side as u32).min(image.height().saturating_sub(y)).max(1);

    let view = imageops::crop_imm(image, x, y, cw, ch).to_image();
    imageops::resize(&view, RECOGNIZER_SIZE, RECOGNIZER_SIZE, FilterType::Triangle)
}

fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        v.iter_mut().for_each(|x| *x /= norm);
    }
    v
}
