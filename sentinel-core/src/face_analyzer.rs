//! `FaceAnalyzer`: the capability boundary the core consumes instead of
//! owning a face-embedding model. The default implementation runs an
//! ONNX/InsightFace-style detector+embedder through `ort`, the same
//! ONNX Runtime binding `motion_ai/pipeline` already depends on for its
//! detector backend; a `hailo` feature gate leaves room for an
//! on-accelerator backend without touching call sites.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use ndarray::{Array2, ArrayView, Axis, Ix3};

use crate::error::DetectorError;

/// One detected face: its bounding box in pixel coordinates and its raw
/// (unnormalized) embedding.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: [i32; 4],
    pub embedding: Vec<f32>,
}

/// Detection input and output never leave the process boundary, so this
/// trait takes an owned `image::RgbImage` rather than a path or bytes.
pub trait FaceAnalyzer: Send + Sync {
    /// Detect and embed all faces in `image`. `det_size` mirrors the
    /// retry-lowering schedule `/recognise` drives directly;
    /// `None` lets the backend pick its default input resolution.
    fn analyze(
        &self,
        image: &image::RgbImage,
        det_size: Option<(u32, u32)>,
    ) -> Result<Vec<DetectedFace>, DetectorError>;
}

/// ONNX Runtime backed implementation, selected when `USE_INSIGHTFACE=true`.
pub struct OrtFaceAnalyzer {
    session: ort::session::Session,
    embedding_dim: usize,
}

impl OrtFaceAnalyzer {
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        let session = ort::session::Session::builder()
            .map_err(|e| DetectorError::Analyzer(e.to_string()))?
            .commit_from_file(model_path)
            .map_err(|e| DetectorError::Analyzer(e.to_string()))?;
        Ok(OrtFaceAnalyzer {
            session,
            embedding_dim: 512,
        })
    }

    fn preprocess(image: &image::RgbImage, det_size: (u32, u32)) -> Array2<f32> {
        let resized = image::imageops::resize(
            image,
            det_size.0,
            det_size.1,
            image::imageops::FilterType::Triangle,
        );
        let mut flat = Array2::<f32>::zeros((det_size.1 as usize, det_size.0 as usize * 3));
        for (y, row) in resized.rows().enumerate() {
            for (x, px) in row.enumerate() {
                flat[[y, x * 3]] = px[0] as f32 / 255.0;
                flat[[y, x * 3 + 1]] = px[1] as f32 / 255.0;
                flat[[y, x * 3 + 2]] = px[2] as f32 / 255.0;
            }
        }
        flat
    }
}

impl FaceAnalyzer for OrtFaceAnalyzer {
    fn analyze(
        &self,
        image: &image::RgbImage,
        det_size: Option<(u32, u32)>,
    ) -> Result<Vec<DetectedFace>, DetectorError> {
        let size = det_size.unwrap_or((640, 640));
        let input = Self::preprocess(image, size);
        let input: ArrayView<f32, Ix3> = input
            .view()
            .into_shape((1, size.1 as usize, size.0 as usize * 3))
            .map_err(|e| DetectorError::Analyzer(e.to_string()))?;

        let outputs = self
            .session
            .run(ort::inputs![input.to_owned()].map_err(|e| DetectorError::Analyzer(e.to_string()))?)
            .map_err(|e| DetectorError::Analyzer(e.to_string()))?;

        let boxes = outputs
            .get("boxes")
            .ok_or_else(|| DetectorError::Analyzer("model output missing 'boxes'".into()))?
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::Analyzer(e.to_string()))?;
        let embeddings = outputs
            .get("embeddings")
            .ok_or_else(|| DetectorError::Analyzer("model output missing 'embeddings'".into()))?
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::Analyzer(e.to_string()))?;

        let mut faces = Vec::new();
        for (bbox_row, emb_row) in boxes
            .view()
            .axis_iter(Axis(0))
            .zip(embeddings.view().axis_iter(Axis(0)))
        {
            if bbox_row.len() < 4 || emb_row.len() < self.embedding_dim {
                continue;
            }
            faces.push(DetectedFace {
                bbox: [
                    bbox_row[0] as i32,
                    bbox_row[1] as i32,
                    bbox_row[2] as i32,
                    bbox_row[3] as i32,
                ],
                embedding: emb_row.iter().take(self.embedding_dim).copied().collect(),
            });
        }
        Ok(faces)
    }
}

/// Deterministic fixture used by component tests: returns a fixed set of
/// faces regardless of input, so trigger/matching logic can be exercised
/// without a real model file.
#[cfg(any(test, feature = "test-fixtures"))]
pub struct FixedFaceAnalyzer {
    pub faces: Vec<DetectedFace>,
}

#[cfg(any(test, feature = "test-fixtures"))]
impl FaceAnalyzer for FixedFaceAnalyzer {
    fn analyze(
        &self,
        _image: &image::RgbImage,
        _det_size: Option<(u32, u32)>,
    ) -> Result<Vec<DetectedFace>, DetectorError> {
        Ok(self.faces.clone())
    }
}
