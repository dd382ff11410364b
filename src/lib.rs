//! Prompt scoring for embedding-guided image optimization.
//!
//! A [`Prompt`] holds a target embedding produced by one or more
//! [`Perceptor`]s and scores candidate embeddings with a weighted, floored
//! spherical distance whose gradient flows back to the candidate.

#[cfg(feature = "clip")]
pub mod clip;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod fetch;
pub mod image_repr;
pub mod loss;
pub mod perceptor;
pub mod prompt;
pub mod table;
pub mod utils;

pub use config::{Config, FloorValue, ScoringConfig};
pub use descriptor::{PromptSpec, SplitRule};
pub use error::{PerceptorError, PromptError, Result};
pub use image_repr::PixelImage;
pub use loss::{replace_grad, spherical_distance};
pub use perceptor::{Axis, Embedder, MultiPerceptorEmbedder, Perceptor, PerceptorSet};
pub use prompt::Prompt;
pub use table::EmbeddingTable;
