//! Prompts: a target embedding plus the weight/stop rules used to score
//! candidate embeddings against it.
//!
//! Loss for one prompt:
//!
//! ```text
//! signed  = sign(weight) * spherical_distance(candidate, target)
//! floored = max(signed, stop)          // zero gradient while the floor is active
//! loss    = mean(|weight| * floored)
//! ```
//!
//! Negative weights flip the direction, so the optimizer is rewarded for
//! moving away from the target. The stop keeps the optimizer from pushing a
//! prompt further once it is close enough.

use crate::config::{FetchConfig, FloorValue, ScoringConfig};
use crate::descriptor::{PromptSpec, SplitRule};
use crate::error::{PerceptorError, PromptError, Result};
use crate::fetch::load_rgb;
use crate::image_repr::PixelImage;
use crate::loss::{full_like, replace_grad, spherical_distance};
use crate::perceptor::{format_embedding, Embedder, PerceptorSet};
use candle_core::{DType, Device, Tensor, D};
use image::RgbImage;
use std::borrow::Cow;
use std::fmt;

/// Descriptor used for image prompts built from an in-memory image
pub const IMAGE_PROMPT_DESCRIPTOR: &str = "IMAGE PROMPT";

/// Suffix marking prompts whose target came from an image
const SEMANTIC_SUFFIX: &str = " (semantic)";

pub struct Prompt {
    /// Target embedding, `(n, c, i, feature)`, detached
    embeds: Tensor,
    weight: f32,
    stop: f32,
    text: String,
    descriptor: String,
    floor_value: FloorValue,
}

impl Prompt {
    /// Build a prompt around an existing `(n, c, i, feature)` embedding.
    pub fn from_embedding(
        embeds: Tensor,
        spec: PromptSpec,
        text: impl Into<String>,
        scoring: &ScoringConfig,
    ) -> Result<Self> {
        if embeds.rank() != 4 {
            return Err(PromptError::ShapeMismatch {
                expected: "a (batch, channel, instance, feature) embedding".to_string(),
                actual: embeds.dims().to_vec(),
            });
        }

        Ok(Self {
            embeds: embeds.to_dtype(DType::F32)?.detach(),
            weight: spec.weight,
            stop: spec.stop,
            text: text.into(),
            descriptor: spec.descriptor,
            floor_value: scoring.floor_value,
        })
    }

    /// Parse a `TEXT[:WEIGHT[:STOP]]` descriptor and embed the text with
    /// every perceptor in the set.
    pub fn from_text(
        descriptor: &str,
        perceptors: &PerceptorSet,
        device: &Device,
        scoring: &ScoringConfig,
    ) -> Result<Self> {
        let spec = parse(descriptor, SplitRule::Text, scoring)?;
        if perceptors.is_empty() {
            return Err(PerceptorError::Empty.into());
        }

        let embeds = perceptors.encode_text(&spec.text, device)?;
        let (channels, width) = embeds.dims2()?;
        let embeds = embeds.reshape((1, channels, 1, width))?;

        tracing::debug!(
            descriptor,
            perceptors = channels,
            width,
            "built text prompt"
        );

        let text = spec.text.clone();
        Self::from_embedding(embeds, spec, text, scoring)
    }

    /// Parse a `LABEL_OR_URL[:WEIGHT[:STOP]]` descriptor and embed an image
    /// with `embedder`. When `image` is `None` the label is fetched as a
    /// path or URL.
    pub fn from_image(
        embedder: &dyn Embedder,
        descriptor: &str,
        image: Option<&RgbImage>,
        device: &Device,
        fetch: &FetchConfig,
        scoring: &ScoringConfig,
    ) -> Result<Self> {
        let spec = parse(descriptor, SplitRule::UrlSafe, scoring)?;

        let image = match image {
            Some(img) => Cow::Borrowed(img),
            None => Cow::Owned(load_rgb(&spec.text, fetch)?),
        };

        let (width, height) = image.dimensions();
        let mut pixels = PixelImage::new(width, height, device)?;
        pixels.encode_image(&image)?;

        let embeds = embedder
            .embed(&pixels)?
            .to_device(device)?
            .to_dtype(DType::F32)?
            .detach();
        let embeds = format_embedding(&embeds, embedder.output_axes())?;

        tracing::debug!(
            descriptor,
            width,
            height,
            dims = ?embeds.dims(),
            "built image prompt"
        );

        let text = format!("{}{}", spec.text, SEMANTIC_SUFFIX);
        Self::from_embedding(embeds, spec, text, scoring)
    }

    /// Loss of `candidate` against this prompt, as a scalar tensor that
    /// carries gradients back to the candidate.
    ///
    /// The candidate's last axis must match the target width and its
    /// leading axes must broadcast against the target's `(n, c, i)`.
    pub fn score(&self, candidate: &Tensor) -> Result<Tensor> {
        self.check_shape(candidate)?;

        let candidate = candidate
            .to_device(self.embeds.device())?
            .to_dtype(DType::F32)?;

        let dists = spherical_distance(&candidate, &self.embeds)?;
        let signed = dists.affine(self.weight.signum() as f64, 0.0)?;
        let floored = signed.maximum(&full_like(&signed, self.stop as f64)?)?;

        let dists = match self.floor_value {
            FloorValue::Floored => floored,
            FloorValue::Raw => replace_grad(&signed, &floored)?,
        };

        Ok(dists.affine(self.weight.abs() as f64, 0.0)?.mean_all()?)
    }

    /// [`Prompt::score`] as a plain number
    pub fn score_value(&self, candidate: &Tensor) -> Result<f32> {
        Ok(self.score(candidate)?.to_scalar::<f32>()?)
    }

    fn check_shape(&self, candidate: &Tensor) -> Result<()> {
        let target = self.embeds.dims();
        let dims = candidate.dims();

        let width_matches = dims.last() == target.last();
        let broadcasts = dims
            .iter()
            .rev()
            .zip(target.iter().rev())
            .all(|(a, b)| a == b || *a == 1 || *b == 1);

        if !width_matches || !broadcasts {
            return Err(PromptError::ShapeMismatch {
                expected: format!("a shape broadcastable with {:?}", target),
                actual: dims.to_vec(),
            });
        }
        Ok(())
    }

    /// The target embedding, `(n, c, i, feature)`
    pub fn embeds(&self) -> &Tensor {
        &self.embeds
    }

    pub fn weight(&self) -> f32 {
        self.weight
    }

    pub fn stop(&self) -> f32 {
        self.stop
    }

    /// Human-readable prompt text (image prompts carry a " (semantic)" suffix)
    pub fn text(&self) -> &str {
        &self.text
    }

    /// The descriptor exactly as it was given
    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    /// Width of the target embedding
    pub fn width(&self) -> Result<usize> {
        Ok(self.embeds.dim(D::Minus1)?)
    }
}

impl fmt::Display for Prompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl fmt::Debug for Prompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.descriptor)
    }
}

fn parse(descriptor: &str, rule: SplitRule, scoring: &ScoringConfig) -> Result<PromptSpec> {
    if scoring.validate_stop_sign {
        PromptSpec::parse_strict(descriptor, rule)
    } else {
        PromptSpec::parse(descriptor, rule)
    }
}
