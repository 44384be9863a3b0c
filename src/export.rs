//! Export seam.
//!
//! Subtitle and document formatters live outside the core; the pipeline
//! only depends on this trait. The JSON exporter ships with the crate
//! because the persisted-state layout is JSON end to end.

use crate::error::Result;
use crate::types::FusedSegment;
use std::path::{Path, PathBuf};

/// Writes the fused transcript to its final destination.
pub trait Exporter: Send + Sync {
    /// Writes `segments` to `dest` (or a derived path) and returns the path
    /// actually written.
    fn export(&self, segments: &[FusedSegment], dest: &Path) -> Result<PathBuf>;
}

/// Pretty-printed UTF-8 JSON, deterministic for identical input.
pub struct JsonExporter;

impl Exporter for JsonExporter {
    fn export(&self, segments: &[FusedSegment], dest: &Path) -> Result<PathBuf> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(segments)?;
        std::fs::write(dest, json)?;
        tracing::info!(segments = segments.len(), dest = %dest.display(), "transcript exported");
        Ok(dest.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn segment(start: f64, end: f64, speaker: &str, text: &str) -> FusedSegment {
        FusedSegment {
            start,
            end,
            speaker: speaker.to_string(),
            text: text.to_string(),
            confidence: None,
            diarization_speaker: None,
            identified_as: None,
            match_score: None,
        }
    }

    #[test]
    fn test_json_export_roundtrip() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("out/transcript.json");
        let segments = vec![segment(0.0, 2.0, "S0", "hello"), segment(2.0, 4.0, "S1", "hi")];

        let written = JsonExporter.export(&segments, &dest).unwrap();
        assert_eq!(written, dest);

        let loaded: Vec<FusedSegment> =
            serde_json::from_str(&std::fs::read_to_string(&dest).unwrap()).unwrap();
        assert_eq!(loaded, segments);
    }

    #[test]
    fn test_json_export_is_deterministic() {
        let dir = tempdir().unwrap();
        let segments = vec![segment(0.0, 1.0, "S0", "same")];

        let a = dir.path().join("a.json");
        let b = dir.path().join("b.json");
        JsonExporter.export(&segments, &a).unwrap();
        JsonExporter.export(&segments, &b).unwrap();

        assert_eq!(std::fs::read(&a).unwrap(), std::fs::read(&b).unwrap());
    }
}
