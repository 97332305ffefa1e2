//! Error types for model bootstrap and the per-request colorize pipeline.

use std::path::PathBuf;

use thiserror::Error;

/// Fatal errors raised while building the model handle.
///
/// Every variant is surfaced before the server binds its listener; none of
/// them can occur once a [`crate::model::ColorizationModel`] exists.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("model artifact missing or empty: {}", path.display())]
    MissingArtifact { path: PathBuf },

    #[error("failed to read {what} from {}", path.display())]
    Corrupt {
        what: &'static str,
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("layer '{0}' not found in network graph")]
    MissingLayer(String),

    #[error("layer '{layer}' is incompatible with the loaded artifacts: {reason}")]
    Incompatible { layer: String, reason: String },

    #[error("failed to create inference session")]
    Session(#[source] anyhow::Error),
}

/// Errors local to one colorize request.
#[derive(Debug, Error)]
pub enum ColorizeError {
    #[error("could not decode uploaded image: {0}")]
    Decode(#[source] image::ImageError),

    #[error("unexpected tensor shape at {stage}: expected {expected}, got {actual:?}")]
    InternalShape {
        stage: &'static str,
        expected: String,
        actual: Vec<usize>,
    },

    #[error("inference failed: {0:#}")]
    Inference(anyhow::Error),

    #[error("failed to encode PNG output: {0}")]
    Encode(image::ImageError),
}

impl ColorizeError {
    pub fn shape(stage: &'static str, expected: impl Into<String>, actual: &[usize]) -> Self {
        Self::InternalShape {
            stage,
            expected: expected.into(),
            actual: actual.to_vec(),
        }
    }

    /// True when the failure was caused by the uploaded bytes rather than the service.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Decode(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_error_reports_stage_and_dims() {
        let err = ColorizeError::shape("prediction", "[2, H, W]", &[3, 56, 56]);
        let message = err.to_string();
        assert!(message.contains("prediction"));
        assert!(message.contains("[3, 56, 56]"));
        assert!(!err.is_client_error());
    }

    #[test]
    fn inference_error_carries_runtime_message() {
        let err = ColorizeError::Inference(
            anyhow::anyhow!("CUDA out of memory").context("session run failed"),
        );
        let message = format!("{err:#}");
        assert!(message.contains("session run failed"));
        assert!(message.contains("CUDA out of memory"));

        // Wrapping once more must not repeat the cause.
        let chained = format!("{:#}", anyhow::Error::new(err));
        assert_eq!(chained.matches("CUDA out of memory").count(), 1);
    }

    #[test]
    fn encode_error_carries_codec_message() {
        let err = ColorizeError::Encode(image::ImageError::Limits(
            image::error::LimitError::from_kind(image::error::LimitErrorKind::DimensionError),
        ));
        assert!(err.to_string().starts_with("failed to encode PNG output: "));
        assert!(err.to_string().len() > "failed to encode PNG output: ".len());
    }

    #[test]
    fn missing_layer_names_the_layer() {
        let err = StartupError::MissingLayer("class8_ab".to_string());
        assert_eq!(err.to_string(), "layer 'class8_ab' not found in network graph");
    }

    #[test]
    fn corrupt_keeps_source_chain() {
        let err = StartupError::Corrupt {
            what: "cluster points",
            path: PathBuf::from("models/pts_in_hull.npy"),
            source: anyhow::anyhow!("bad header"),
        };
        let chained = format!("{:#}", anyhow::Error::new(err));
        assert!(chained.contains("cluster points"));
        assert!(chained.contains("bad header"));
    }
}
