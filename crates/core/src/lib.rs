//! Core crate for the recolor image colorization service.

pub mod backend;
pub mod color;
pub mod config;
pub mod error;
pub mod fetch;
pub mod logging;
pub mod model;
pub mod onnx_graph;
pub mod pipeline;
pub mod resize;
pub mod runtime;
pub mod server;
