//! Inference backend selection and `ort::Session` construction.

use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Execution provider used for the colorization graph.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    #[default]
    Cpu,
    Cuda,
}

impl FromStr for InferenceBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda),
            other => Err(format!("unknown inference backend '{other}' (expected cpu or cuda)")),
        }
    }
}

impl fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
        }
    }
}

/// Build a session from an in-memory ONNX graph.
///
/// For `Cuda` the CUDA EP is registered and ORT falls back to CPU when the
/// provider cannot be loaded.
pub fn build_session(model_bytes: &[u8], backend: InferenceBackend) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

    let session = match backend {
        InferenceBackend::Cpu => {
            debug!(backend = "cpu", "Building session");
            builder
                .commit_from_memory(model_bytes)
                .context("failed to load ONNX graph on CPU")?
        }
        InferenceBackend::Cuda => {
            let cuda = CUDAExecutionProvider::default();
            if !cuda.is_available().unwrap_or(false) {
                warn!("CUDA EP is not available; inference will fall back to CPU");
            }

            debug!(backend = "cuda", "Building session with CUDA EP");
            builder
                .with_execution_providers([CUDAExecutionProvider::default().build()])?
                .commit_from_memory(model_bytes)
                .context("failed to load ONNX graph with CUDA EP")?
        }
    };

    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_backends() {
        assert_eq!("cpu".parse::<InferenceBackend>(), Ok(InferenceBackend::Cpu));
        assert_eq!("CUDA".parse::<InferenceBackend>(), Ok(InferenceBackend::Cuda));
        assert_eq!(" gpu ".parse::<InferenceBackend>(), Ok(InferenceBackend::Cuda));
        assert!("tensorrt".parse::<InferenceBackend>().is_err());
    }

    #[test]
    fn serde_uses_lowercase_names() {
        let encoded = serde_json::to_string(&InferenceBackend::Cuda).expect("serialize");
        assert_eq!(encoded, "\"cuda\"");
        let decoded: InferenceBackend = serde_json::from_str("\"cpu\"").expect("deserialize");
        assert_eq!(decoded, InferenceBackend::Cpu);
        assert_eq!(InferenceBackend::Cuda.to_string(), "cuda");
    }
}
