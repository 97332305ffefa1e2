//! Model bootstrap: load the colorization network, inject the cluster-center
//! and rebalancing tensors into their layers and expose the result as an
//! immutable [`ColorizationModel`] handle.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use anyhow::anyhow;
use ndarray::{Array2, Array3, Array4, ArrayView2, ArrayViewD, Axis, Ix3, ShapeBuilder};
use ort::{session::Session, tensor::TensorElementType, value::Tensor};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backend::{self, InferenceBackend};
use crate::config::{resolve_relative_to, AppConfig};
use crate::error::{ColorizeError, StartupError};
use crate::onnx_graph::{self, proto::ModelProto, PatchedSlot};

// The constants below are properties of the pretrained colorization
// artifact. Swapping the model files may require changing them.

/// Number of quantized ab bins the classifier predicts over.
pub const CHROMA_BINS: usize = 313;
/// Per-bin scale baked into the rebalancing layer.
pub const REBALANCE_TEMPERATURE: f32 = 2.606;
/// Square spatial size of the network input.
pub const NETWORK_INPUT_SIZE: usize = 224;
/// Subtracted from Lab lightness before it is fed to the network.
pub const LUMINANCE_CENTER: f32 = 50.0;
/// Largest side accepted before the downscale guard kicks in.
pub const DOWNSCALE_CEILING: u32 = 800;
pub const CLUSTER_CENTER_LAYER: &str = "class8_ab";
pub const REBALANCE_LAYER: &str = "conv8_313_rh";

/// Predicts ab chrominance from a centered lightness plane.
///
/// `luminance` is `(H, W)`; the result is `(2, h, w)` at the network's native
/// output resolution. Implementations must be callable from several request
/// threads at once.
pub trait ChromaPredictor: Send + Sync {
    fn predict(&self, luminance: ArrayView2<'_, f32>) -> Result<Array3<f32>, ColorizeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Network,
    Weights,
    ClusterPoints,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 3] = [Self::Network, Self::Weights, Self::ClusterPoints];

    pub fn label(self) -> &'static str {
        match self {
            Self::Network => "network graph",
            Self::Weights => "trained weights",
            Self::ClusterPoints => "cluster points",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelPaths {
    pub network: PathBuf,
    pub weights: PathBuf,
    pub cluster_points: PathBuf,
}

impl ModelPaths {
    pub fn from_config(config: &AppConfig) -> Self {
        let dir = &config.paths.models_dir;
        Self {
            network: resolve_relative_to(dir, &config.model.network),
            weights: resolve_relative_to(dir, &config.model.weights),
            cluster_points: resolve_relative_to(dir, &config.model.cluster_points),
        }
    }

    pub fn path(&self, kind: ArtifactKind) -> &Path {
        match kind {
            ArtifactKind::Network => &self.network,
            ArtifactKind::Weights => &self.weights,
            ArtifactKind::ClusterPoints => &self.cluster_points,
        }
    }
}

/// True when the file exists and holds at least one byte.
pub fn artifact_present(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}

fn read_artifact(kind: ArtifactKind, path: &Path) -> Result<Vec<u8>, StartupError> {
    if !artifact_present(path) {
        return Err(StartupError::MissingArtifact {
            path: path.to_path_buf(),
        });
    }
    fs::read(path).map_err(|err| StartupError::Corrupt {
        what: kind.label(),
        path: path.to_path_buf(),
        source: err.into(),
    })
}

fn npy_values<R: std::io::Read>(npy: npyz::NpyFile<R>) -> std::io::Result<Vec<f32>> {
    let npy = match npy.try_data::<f32>() {
        Ok(reader) => return reader.collect(),
        Err(npy) => npy,
    };
    let npy = match npy.try_data::<f64>() {
        Ok(reader) => return reader.map(|v| v.map(|v| v as f32)).collect(),
        Err(npy) => npy,
    };
    let npy = match npy.try_data::<i64>() {
        Ok(reader) => return reader.map(|v| v.map(|v| v as f32)).collect(),
        Err(npy) => npy,
    };
    match npy.try_data::<i32>() {
        Ok(reader) => reader.map(|v| v.map(|v| v as f32)).collect(),
        Err(npy) => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unsupported dtype {:?}", npy.dtype()),
        )),
    }
}

/// Parse a `[K, 2]` cluster-point array and lay it out as the `[2, K, 1, 1]`
/// weight of the cluster-center layer.
pub fn cluster_centers_from_npy(bytes: &[u8]) -> anyhow::Result<Array4<f32>> {
    let npy = npyz::NpyFile::new(bytes)?;
    let shape: Vec<usize> = npy.shape().iter().map(|&d| d as usize).collect();
    let fortran = matches!(npy.order(), npyz::Order::Fortran);

    if shape != [CHROMA_BINS, 2] {
        return Err(anyhow!(
            "expected cluster points of shape [{CHROMA_BINS}, 2], got {shape:?}"
        ));
    }

    let values = npy_values(npy)?;
    let points = if fortran {
        Array2::from_shape_vec((CHROMA_BINS, 2).f(), values)?
    } else {
        Array2::from_shape_vec((CHROMA_BINS, 2), values)?
    };

    let centers = points
        .t()
        .as_standard_layout()
        .to_owned()
        .into_shape_with_order((2, CHROMA_BINS, 1, 1))?;
    Ok(centers)
}

/// `[1, K]` tensor of the rebalancing temperature.
pub fn rebalance_weights() -> Array2<f32> {
    Array2::from_elem((1, CHROMA_BINS), REBALANCE_TEMPERATURE)
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelSummary {
    pub network: PathBuf,
    pub backend: InferenceBackend,
    pub chroma_bins: usize,
    pub rebalance_temperature: f32,
    pub cluster_centers: PatchedSlot,
    pub rebalance: PatchedSlot,
    pub inlined_initializers: usize,
    pub op_count: usize,
    pub param_count: u64,
    pub input_name: String,
    pub output_name: String,
}

/// Graph with weights inlined and both layers patched, ready for a session.
#[derive(Debug)]
pub struct PreparedGraph {
    pub model: ModelProto,
    pub cluster_centers: PatchedSlot,
    pub rebalance: PatchedSlot,
    pub inlined_initializers: usize,
}

/// Read all three artifacts and produce the patched graph.
pub fn prepare_graph(paths: &ModelPaths) -> Result<PreparedGraph, StartupError> {
    let network_bytes = read_artifact(ArtifactKind::Network, &paths.network)?;
    let weight_bytes = read_artifact(ArtifactKind::Weights, &paths.weights)?;
    let points_bytes = read_artifact(ArtifactKind::ClusterPoints, &paths.cluster_points)?;

    let corrupt = |kind: ArtifactKind, source: anyhow::Error| StartupError::Corrupt {
        what: kind.label(),
        path: paths.path(kind).to_path_buf(),
        source,
    };

    let mut model = onnx_graph::decode_model(&network_bytes)
        .map_err(|err| corrupt(ArtifactKind::Network, err))?;
    let inlined_initializers = onnx_graph::inline_external_data(&mut model, &weight_bytes)
        .map_err(|err| corrupt(ArtifactKind::Weights, err))?;
    if inlined_initializers == 0 {
        warn!(
            weights = %paths.weights.display(),
            "Network graph stores its weights inline; weight file was not consulted"
        );
    }

    let centers = cluster_centers_from_npy(&points_bytes).map_err(|err| {
        if err.downcast_ref::<std::io::Error>().is_some() {
            corrupt(ArtifactKind::ClusterPoints, err)
        } else {
            StartupError::Incompatible {
                layer: CLUSTER_CENTER_LAYER.to_string(),
                reason: format!("{err:#}"),
            }
        }
    })?;
    let rebalance = rebalance_weights();

    let graph = model.graph.as_mut().ok_or_else(|| {
        corrupt(ArtifactKind::Network, anyhow!("ONNX model has no graph"))
    })?;

    let bins = CHROMA_BINS as i64;
    let cluster_slot = onnx_graph::patch_layer_weights(
        graph,
        CLUSTER_CENTER_LAYER,
        centers.as_slice().unwrap_or_default(),
        &[2, bins, 1, 1],
    )?;
    // The rebalance scale multiplies NCHW activations, so a fresh slot gets
    // the broadcastable per-channel layout of the same K values.
    let rebalance_slot = onnx_graph::patch_layer_weights(
        graph,
        REBALANCE_LAYER,
        rebalance.as_slice().unwrap_or_default(),
        &[1, bins, 1, 1],
    )?;

    for slot in [&cluster_slot, &rebalance_slot] {
        if !slot.dropped_inputs.is_empty() {
            info!(
                layer = %slot.layer,
                dropped = ?slot.dropped_inputs,
                "Unwired extra layer parameters"
            );
        }
    }

    debug!(
        cluster_slot = %cluster_slot.initializer,
        rebalance_slot = %rebalance_slot.initializer,
        inlined_initializers,
        "Patched colorization layers"
    );

    Ok(PreparedGraph {
        model,
        cluster_centers: cluster_slot,
        rebalance: rebalance_slot,
        inlined_initializers,
    })
}

/// Process-wide colorization handle. Immutable after [`ColorizationModel::load`].
pub struct ColorizationModel {
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
    summary: ModelSummary,
}

impl std::fmt::Debug for ColorizationModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColorizationModel")
            .field("input_name", &self.input_name)
            .field("output_name", &self.output_name)
            .finish_non_exhaustive()
    }
}

impl ColorizationModel {
    /// Load and patch the network, then build the inference session.
    ///
    /// Every failure is fatal and reported here, never on a later request.
    pub fn load(paths: &ModelPaths, backend: InferenceBackend) -> Result<Self, StartupError> {
        let started = Instant::now();
        let prepared = prepare_graph(paths)?;

        let inspection = onnx_graph::inspect_model(&prepared.model).map_err(|err| {
            StartupError::Corrupt {
                what: ArtifactKind::Network.label(),
                path: paths.network.clone(),
                source: err,
            }
        })?;

        let bytes = onnx_graph::encode_model(&prepared.model);
        let session = backend::build_session(&bytes, backend).map_err(StartupError::Session)?;

        let input = session
            .inputs()
            .first()
            .ok_or_else(|| incompatible_io("session exposes no inputs"))?;
        if input.dtype().tensor_type() != Some(TensorElementType::Float32) {
            return Err(incompatible_io(&format!(
                "input '{}' is not a float32 tensor",
                input.name()
            )));
        }
        let input_name = input.name().to_string();
        let output_name = session
            .outputs()
            .first()
            .map(|outlet| outlet.name().to_string())
            .ok_or_else(|| incompatible_io("session exposes no outputs"))?;

        let summary = ModelSummary {
            network: paths.network.clone(),
            backend,
            chroma_bins: CHROMA_BINS,
            rebalance_temperature: REBALANCE_TEMPERATURE,
            cluster_centers: prepared.cluster_centers,
            rebalance: prepared.rebalance,
            inlined_initializers: prepared.inlined_initializers,
            op_count: inspection.op_count,
            param_count: inspection.param_count,
            input_name: input_name.clone(),
            output_name: output_name.clone(),
        };

        info!(
            network = %paths.network.display(),
            %backend,
            input = %input_name,
            output = %output_name,
            op_count = summary.op_count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Colorization model ready"
        );

        Ok(Self {
            session: Mutex::new(session),
            input_name,
            output_name,
            summary,
        })
    }

    pub fn summary(&self) -> &ModelSummary {
        &self.summary
    }
}

fn incompatible_io(reason: &str) -> StartupError {
    StartupError::Incompatible {
        layer: "graph io".to_string(),
        reason: reason.to_string(),
    }
}

/// Add the batch and channel axes the network expects: `(H, W)` → `(1, 1, H, W)`.
fn network_tensor(luminance: ArrayView2<'_, f32>) -> Result<Array4<f32>, ColorizeError> {
    let (height, width) = luminance.dim();
    luminance
        .to_owned()
        .into_shape_with_order((1, 1, height, width))
        .map_err(|_| ColorizeError::shape("network input", "[H, W]", &[height, width]))
}

/// Strip the batch axis from a `[1, 2, h, w]` network output.
fn chroma_from_output(output: ArrayViewD<'_, f32>) -> Result<Array3<f32>, ColorizeError> {
    let shape = output.shape().to_vec();
    if shape.len() != 4 || shape[0] != 1 || shape[1] != 2 {
        return Err(ColorizeError::shape("network output", "[1, 2, H, W]", &shape));
    }

    output
        .index_axis(Axis(0), 0)
        .to_owned()
        .into_dimensionality::<Ix3>()
        .map_err(|_| ColorizeError::shape("network output", "[1, 2, H, W]", &shape))
}

impl ChromaPredictor for ColorizationModel {
    fn predict(&self, luminance: ArrayView2<'_, f32>) -> Result<Array3<f32>, ColorizeError> {
        let tensor = Tensor::from_array(network_tensor(luminance)?)
            .map_err(|err| ColorizeError::Inference(err.into()))?;

        // Session::run needs exclusive access; requests queue here.
        let mut session = self
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let outputs = session
            .run(ort::inputs![self.input_name.as_str() => &tensor])
            .map_err(|err| ColorizeError::Inference(err.into()))?;
        let view = outputs[self.output_name.as_str()]
            .try_extract_array::<f32>()
            .map_err(|err| ColorizeError::Inference(err.into()))?;

        chroma_from_output(view)
    }
}
