//! Embedding extraction boundary.
//!
//! Extraction itself (face detection + neural embedding) happens outside this
//! crate. Extractors only have to say "here is a vector" or "no face".
//! [`parse_represent_output`] understands the JSON emitted by DeepFace's
//! `represent()`, which is what the enrollment tooling produces.

use crate::types::Embedding;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractError {
    #[error("no face detected in image")]
    NoFaceDetected,
    #[error("embedding extraction failed: {0}")]
    ExtractionFailed(String),
}

/// Turns an image on disk into a live embedding.
pub trait EmbeddingExtractor: Send {
    fn extract(&mut self, image: &Path) -> Result<Embedding, ExtractError>;
}

impl<F> EmbeddingExtractor for F
where
    F: FnMut(&Path) -> Result<Embedding, ExtractError> + Send,
{
    fn extract(&mut self, image: &Path) -> Result<Embedding, ExtractError> {
        self(image)
    }
}

/// Face region reported by DeepFace.
#[derive(Debug, Clone, Deserialize)]
pub struct FacialArea {
    pub x: i64,
    pub y: i64,
    pub w: i64,
    pub h: i64,
}

/// One element of DeepFace `represent()` output.
#[derive(Debug, Clone, Deserialize)]
pub struct Representation {
    pub embedding: Vec<f64>,
    #[serde(default)]
    pub face_confidence: Option<f64>,
    #[serde(default)]
    pub facial_area: Option<FacialArea>,
}

/// Parse DeepFace `represent()` JSON and pick the most confident face.
///
/// An empty list, or a best face with zero confidence (what DeepFace reports
/// under `enforce_detection=False` when it found nothing), is `NoFaceDetected`.
pub fn parse_represent_output(json: &str) -> Result<Embedding, ExtractError> {
    let reps: Vec<Representation> = serde_json::from_str(json)
        .map_err(|e| ExtractError::ExtractionFailed(format!("malformed represent output: {e}")))?;
    select_representation(reps)
}

fn select_representation(reps: Vec<Representation>) -> Result<Embedding, ExtractError> {
    let mut best: Option<Representation> = None;
    for rep in reps {
        let is_better = match &best {
            None => true,
            Some(prev) => rep.face_confidence.unwrap_or(1.0) > prev.face_confidence.unwrap_or(1.0),
        };
        if is_better {
            best = Some(rep);
        }
    }

    let rep = best.ok_or(ExtractError::NoFaceDetected)?;
    if rep.face_confidence == Some(0.0) {
        return Err(ExtractError::NoFaceDetected);
    }

    tracing::debug!(
        dim = rep.embedding.len(),
        confidence = ?rep.face_confidence,
        area = ?rep.facial_area,
        "representation selected"
    );

    let embedding = Embedding::new(rep.embedding);
    embedding
        .validate()
        .map_err(|e| ExtractError::ExtractionFailed(e.to_string()))?;
    Ok(embedding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_parse_picks_most_confident_face() {
        let json = r#"[
            {"embedding": [0.1, 0.2], "facial_area": {"x": 1, "y": 2, "w": 30, "h": 40}, "face_confidence": 0.71},
            {"embedding": [0.3, 0.4], "facial_area": {"x": 5, "y": 6, "w": 30, "h": 40}, "face_confidence": 0.98}
        ]"#;
        let emb = parse_represent_output(json).unwrap();
        assert_eq!(emb.values, vec![0.3, 0.4]);
    }

    #[test]
    fn test_parse_without_confidence() {
        // Older DeepFace releases emit only the embedding.
        let emb = parse_represent_output(r#"[{"embedding": [1.0, -1.0, 0.5]}]"#).unwrap();
        assert_eq!(emb.dim(), 3);
    }

    #[test]
    fn test_parse_empty_list_is_no_face() {
        assert_eq!(parse_represent_output("[]"), Err(ExtractError::NoFaceDetected));
    }

    #[test]
    fn test_parse_zero_confidence_is_no_face() {
        let json = r#"[{"embedding": [0.0, 0.1], "face_confidence": 0}]"#;
        assert_eq!(parse_represent_output(json), Err(ExtractError::NoFaceDetected));
    }

    #[test]
    fn test_parse_malformed() {
        assert!(matches!(
            parse_represent_output(r#"{"embedding": [1.0]}"#),
            Err(ExtractError::ExtractionFailed(_))
        ));
        assert!(matches!(
            parse_represent_output(r#"[{"embedding": []}]"#),
            Err(ExtractError::ExtractionFailed(_))
        ));
    }

    #[test]
    fn test_closure_extractor() {
        let mut calls = 0;
        let mut extractor = |path: &Path| {
            calls += 1;
            if path.ends_with("empty.jpg") {
                Err(ExtractError::NoFaceDetected)
            } else {
                Ok(Embedding::new(vec![1.0, 0.0]))
            }
        };
        assert!(extractor.extract(&PathBuf::from("/tmp/face.jpg")).is_ok());
        assert_eq!(
            extractor.extract(&PathBuf::from("/tmp/empty.jpg")),
            Err(ExtractError::NoFaceDetected)
        );
        drop(extractor);
        assert_eq!(calls, 2);
    }
}
