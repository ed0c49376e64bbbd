//! Face extraction adapter over a pluggable [`FaceAnalyzer`] capability.

pub mod onnx;

use std::sync::Arc;

use image::RgbImage;
use thiserror::Error;

use crate::models::FeatureVector;

pub use onnx::OnnxFaceAnalyzer;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Image decode failed: {0}")]
    Decode(String),
    #[error("Face analyzer failed: {0}")]
    Analyzer(String),
    #[error("Extraction task failed: {0}")]
    Join(String),
}

pub type Result<T> = std::result::Result<T, ExtractError>;

/// Axis-aligned face box in source pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub score: f32,
    pub embedding: FeatureVector,
}

/// External face analysis capability: detect every face in an RGB image and
/// embed each one. Blocking; must be safe to call from several threads.
pub trait FaceAnalyzer: Send + Sync {
    fn analyze(&self, image: &RgbImage) -> anyhow::Result<Vec<DetectedFace>>;

    /// Length of the produced embeddings.
    fn dimension(&self) -> usize;
}

/// Result of a successful extraction call.
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    Face(FeatureVector),
    NoFace,
}

/// Pick the face with the largest box area. Ties keep the first one.
pub fn select_largest(faces: Vec<DetectedFace>) -> Option<DetectedFace> {
    let mut best: Option<DetectedFace> = None;
    for face in faces {
        match &best {
            Some(current) if face.bbox.area() <= current.bbox.area() => {}
            _ => best = Some(face),
        }
    }
    best
}

/// Decode any supported format into canonical 8-bit RGB channel order.
pub fn decode_rgb(bytes: &[u8]) -> Result<RgbImage> {
    image::load_from_memory(bytes)
        .map(|img| img.to_rgb8())
        .map_err(|e| ExtractError::Decode(e.to_string()))
}

/// Shared extraction handle. Cloning is cheap; the analyzer is built once.
#[derive(Clone)]
pub struct FaceExtractor {
    analyzer: Arc<dyn FaceAnalyzer>,
}

impl FaceExtractor {
    pub fn new(analyzer: Arc<dyn FaceAnalyzer>) -> Self {
        Self { analyzer }
    }

    pub fn dimension(&self) -> usize {
        self.analyzer.dimension()
    }

    /// Extract one representative embedding from an encoded image.
    /// CPU-bound work runs on the blocking pool.
    pub async fn extract(&self, bytes: Vec<u8>) -> Result<Extraction> {
        let analyzer = self.analyzer.clone();
        tokio::task::spawn_blocking(move || extract_blocking(analyzer.as_ref(), &bytes))
            .await
            .map_err(|e| ExtractError::Join(e.to_string()))?
    }
}

fn extract_blocking(analyzer: &dyn FaceAnalyzer, bytes: &[u8]) -> Result<Extraction> {
    let image = decode_rgb(bytes)?;
    let faces = analyzer
        .analyze(&image)
        .map_err(|e| ExtractError::Analyzer(e.to_string()))?;

    let detected = faces.len();
    match select_largest(faces) {
        Some(face) => {
            if detected > 1 {
                tracing::debug!(
                    "Extractor: {} faces detected, keeping largest ({:.0}px²)",
                    detected,
                    face.bbox.area()
                );
            }
            Ok(Extraction::Face(face.embedding))
        }
        None => Ok(Extraction::NoFace),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ingest::validator::png_bytes;

    pub(crate) fn face(x1: f32, y1: f32, x2: f32, y2: f32, tag: f32) -> DetectedFace {
        DetectedFace {
            bbox: BoundingBox { x1, y1, x2, y2 },
            score: 0.9,
            embedding: vec![tag, tag],
        }
    }

    /// Analyzer returning a fixed set of faces, keyed on image width.
    pub(crate) struct FixedAnalyzer {
        pub faces_by_width: std::collections::HashMap<u32, Vec<DetectedFace>>,
        pub fail_width: Option<u32>,
    }

    impl FaceAnalyzer for FixedAnalyzer {
        fn analyze(&self, image: &RgbImage) -> anyhow::Result<Vec<DetectedFace>> {
            if self.fail_width == Some(image.width()) {
                anyhow::bail!("model exploded");
            }
            Ok(self
                .faces_by_width
                .get(&image.width())
                .cloned()
                .unwrap_or_default())
        }

        fn dimension(&self) -> usize {
            2
        }
    }

    #[test]
    fn test_bbox_area_is_width_times_height() {
        let b = BoundingBox {
            x1: 10.0,
            y1: 20.0,
            x2: 40.0,
            y2: 30.0,
        };
        assert_eq!(b.area(), 300.0);

        let inverted = BoundingBox {
            x1: 5.0,
            y1: 5.0,
            x2: 1.0,
            y2: 9.0,
        };
        assert_eq!(inverted.area(), 0.0);
    }

    #[test]
    fn test_select_largest_ignores_position() {
        // Far from the origin but small: bottom-right coordinate must not win
        let small_far = face(900.0, 900.0, 910.0, 910.0, 1.0);
        let big_near = face(0.0, 0.0, 100.0, 100.0, 2.0);
        let chosen = select_largest(vec![small_far, big_near]).unwrap();
        assert_eq!(chosen.embedding, vec![2.0, 2.0]);
    }

    #[test]
    fn test_select_largest_tie_keeps_first() {
        let a = face(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = face(50.0, 50.0, 60.0, 60.0, 2.0);
        let chosen = select_largest(vec![a, b]).unwrap();
        assert_eq!(chosen.embedding, vec![1.0, 1.0]);
    }

    #[test]
    fn test_select_largest_empty() {
        assert!(select_largest(Vec::new()).is_none());
    }

    #[test]
    fn test_decode_rgb_rejects_garbage() {
        assert!(matches!(decode_rgb(b"xyz"), Err(ExtractError::Decode(_))));
        assert_eq!(decode_rgb(&png_bytes(5, 2)).unwrap().dimensions(), (5, 2));
    }

    #[tokio::test]
    async fn test_extract_no_face() {
        let extractor = FaceExtractor::new(Arc::new(FixedAnalyzer {
            faces_by_width: Default::default(),
            fail_width: None,
        }));
        let result = extractor.extract(png_bytes(3, 3)).await.unwrap();
        assert_eq!(result, Extraction::NoFace);
    }

    #[tokio::test]
    async fn test_extract_picks_largest_face() {
        let mut faces = std::collections::HashMap::new();
        faces.insert(
            8,
            vec![
                face(0.0, 0.0, 2.0, 2.0, 1.0),
                face(0.0, 0.0, 6.0, 5.0, 3.0),
                face(1.0, 1.0, 3.0, 3.0, 2.0),
            ],
        );
        let extractor = FaceExtractor::new(Arc::new(FixedAnalyzer {
            faces_by_width: faces,
            fail_width: None,
        }));
        let result = extractor.extract(png_bytes(8, 8)).await.unwrap();
        assert_eq!(result, Extraction::Face(vec![3.0, 3.0]));
    }

    #[tokio::test]
    async fn test_extract_analyzer_failure() {
        let extractor = FaceExtractor::new(Arc::new(FixedAnalyzer {
            faces_by_width: Default::default(),
            fail_width: Some(4),
        }));
        let result = extractor.extract(png_bytes(4, 4)).await;
        assert!(matches!(result, Err(ExtractError::Analyzer(msg)) if msg.contains("exploded")));
    }
}
