//! External embedding extractor.
//!
//! Runs a configured program (typically a small DeepFace wrapper) with the image
//! path appended, and reads DeepFace `represent()` JSON from its stdout.

use roster_core::extract::{parse_represent_output, EmbeddingExtractor, ExtractError};
use roster_core::Embedding;
use std::path::Path;
use std::process::Command;

pub struct CommandExtractor {
    program: String,
    args: Vec<String>,
}

impl CommandExtractor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Build from a full argv (`[program, args...]`). `None` if empty.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program.clone(), args.to_vec()))
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl EmbeddingExtractor for CommandExtractor {
    fn extract(&mut self, image: &Path) -> Result<Embedding, ExtractError> {
        if !image.is_file() {
            return Err(ExtractError::ExtractionFailed(format!(
                "image not found: {}",
                image.display()
            )));
        }

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(image)
            .output()
            .map_err(|e| ExtractError::ExtractionFailed(format!("spawn {}: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::warn!(
                program = %self.program,
                status = %output.status,
                stderr = %stderr.trim(),
                "extractor exited with failure"
            );
            return Err(ExtractError::ExtractionFailed(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_represent_output(stdout.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    /// Write `contents` to a fresh temp file and return its path.
    fn temp_file(contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("rosterd-extract-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    /// `sh -c 'cat "$1"' sh <image>` echoes the "image" back as extractor output.
    fn cat_extractor() -> CommandExtractor {
        CommandExtractor::new(
            "sh",
            vec!["-c".into(), "cat \"$1\"".into(), "extract".into()],
        )
    }

    #[test]
    fn test_reads_represent_output() {
        let image = temp_file(r#"[{"embedding": [0.5, 0.25, -0.125], "face_confidence": 0.97}]"#);
        let emb = cat_extractor().extract(&image).unwrap();
        assert_eq!(emb.values, vec![0.5, 0.25, -0.125]);
        let _ = std::fs::remove_file(image);
    }

    #[test]
    fn test_no_face_surfaces_distinctly() {
        let image = temp_file("[]");
        assert_eq!(
            cat_extractor().extract(&image),
            Err(ExtractError::NoFaceDetected)
        );
        let _ = std::fs::remove_file(image);
    }

    #[test]
    fn test_failing_program() {
        let image = temp_file("ignored");
        let mut extractor = CommandExtractor::new(
            "sh",
            vec!["-c".into(), "echo model missing >&2; exit 3".into(), "extract".into()],
        );
        match extractor.extract(&image) {
            Err(ExtractError::ExtractionFailed(msg)) => assert!(msg.contains("model missing")),
            other => panic!("expected failure, got {other:?}"),
        }
        let _ = std::fs::remove_file(image);
    }

    #[test]
    fn test_missing_image() {
        let mut extractor = cat_extractor();
        assert!(matches!(
            extractor.extract(Path::new("/nonexistent/roster/face.jpg")),
            Err(ExtractError::ExtractionFailed(_))
        ));
    }

    #[test]
    fn test_from_argv() {
        assert!(CommandExtractor::from_argv(&[]).is_none());
        let argv = vec!["python3".to_string(), "represent.py".to_string()];
        let extractor = CommandExtractor::from_argv(&argv).unwrap();
        assert_eq!(extractor.program(), "python3");
    }
}
