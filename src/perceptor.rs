//! Encoder contracts
//!
//! A [`Perceptor`] turns text or pixels into embedding vectors. Text prompts
//! are encoded by every perceptor in a [`PerceptorSet`]; image prompts go
//! through a single [`Embedder`], which declares the axis layout of its
//! output so the prompt can reorder it.

use crate::error::{PerceptorError, PromptError, Result};
use crate::image_repr::PixelImage;
use candle_core::{Device, Tensor, D};
use std::fmt;
use std::sync::Arc;

/// Leading axes of an embedding tensor (the feature axis is always last)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    /// Batch of candidates / cutouts (`n`)
    Batch,
    /// Which encoder produced the vector (`c`)
    Channel,
    /// Instance within a prompt (`i`)
    Instance,
}

/// Axis order expected by prompt scoring: `(n, c, i, feature)`
pub const PROMPT_AXES: [Axis; 3] = [Axis::Batch, Axis::Channel, Axis::Instance];

/// A text and image encoder sharing one embedding space.
pub trait Perceptor: Send + Sync {
    fn name(&self) -> &str;

    /// Encode `text` into a `(1, width)` embedding.
    fn encode_text(&self, text: &str, device: &Device) -> Result<Tensor, PerceptorError>;

    /// Encode an image into a `(1, width)` embedding.
    fn encode_image(&self, image: &PixelImage) -> Result<Tensor, PerceptorError>;
}

/// Encodes an image for an image prompt.
pub trait Embedder: Send + Sync {
    /// Leading axes of the tensor returned by [`Embedder::embed`], in order.
    fn output_axes(&self) -> &[Axis];

    fn embed(&self, image: &PixelImage) -> Result<Tensor, PerceptorError>;
}

/// The encoders a text prompt is embedded with.
#[derive(Clone, Default)]
pub struct PerceptorSet {
    perceptors: Vec<Arc<dyn Perceptor>>,
}

impl PerceptorSet {
    pub fn new(perceptors: Vec<Arc<dyn Perceptor>>) -> Self {
        Self { perceptors }
    }

    pub fn push(&mut self, perceptor: Arc<dyn Perceptor>) {
        self.perceptors.push(perceptor);
    }

    pub fn len(&self) -> usize {
        self.perceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.perceptors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Perceptor>> {
        self.perceptors.iter()
    }

    /// Encode `text` with every perceptor and stack the results into a
    /// `(perceptors, width)` tensor, zero-padding narrower embeddings.
    pub fn encode_text(&self, text: &str, device: &Device) -> Result<Tensor, PerceptorError> {
        let embeds = self
            .perceptors
            .iter()
            .map(|p| -> Result<Tensor, PerceptorError> {
                let embed = p.encode_text(text, device)?;
                tracing::debug!(perceptor = p.name(), dims = ?embed.dims(), "encoded text");
                Ok(embed)
            })
            .collect::<Result<Vec<_>, PerceptorError>>()?;
        cat_with_pad(&embeds)
    }
}

impl fmt::Debug for PerceptorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.perceptors.iter().map(|p| p.name()))
            .finish()
    }
}

/// Image embedder that runs every perceptor of a set and lays the results
/// out as `(channel, batch, feature)`.
#[derive(Debug, Clone)]
pub struct MultiPerceptorEmbedder {
    perceptors: PerceptorSet,
}

impl MultiPerceptorEmbedder {
    const AXES: [Axis; 2] = [Axis::Channel, Axis::Batch];

    pub fn new(perceptors: PerceptorSet) -> Self {
        Self { perceptors }
    }
}

impl Embedder for MultiPerceptorEmbedder {
    fn output_axes(&self) -> &[Axis] {
        &Self::AXES
    }

    fn embed(&self, image: &PixelImage) -> Result<Tensor, PerceptorError> {
        let embeds = self
            .perceptors
            .iter()
            .map(|p| p.encode_image(image))
            .collect::<Result<Vec<_>, PerceptorError>>()?;
        Ok(cat_with_pad(&embeds)?.unsqueeze(1)?)
    }
}

/// Concatenate tensors along the first axis after zero-padding their last
/// axis to the widest one.
pub fn cat_with_pad(tensors: &[Tensor]) -> Result<Tensor, PerceptorError> {
    let width = tensors
        .iter()
        .map(|t| t.dim(D::Minus1))
        .collect::<candle_core::Result<Vec<_>>>()?
        .into_iter()
        .max()
        .ok_or(PerceptorError::Empty)?;

    let padded = tensors
        .iter()
        .map(|t| {
            let missing = width - t.dim(D::Minus1)?;
            if missing == 0 {
                Ok(t.clone())
            } else {
                t.pad_with_zeros(D::Minus1, 0, missing)
            }
        })
        .collect::<candle_core::Result<Vec<_>>>()?;

    Ok(Tensor::cat(&padded, 0)?)
}

/// Reorder an embedding whose leading axes are `axes` into the
/// `(n, c, i, feature)` layout, inserting size-1 axes for any that are
/// missing.
pub fn format_embedding(embedding: &Tensor, axes: &[Axis]) -> Result<Tensor> {
    let distinct = axes
        .iter()
        .enumerate()
        .all(|(i, a)| !axes[..i].contains(a));
    if embedding.rank() != axes.len() + 1 || !distinct {
        return Err(PromptError::ShapeMismatch {
            expected: format!("a feature axis after distinct axes {:?}", axes),
            actual: embedding.dims().to_vec(),
        });
    }

    let mut t = embedding.clone();
    let mut order = axes.to_vec();
    for axis in PROMPT_AXES {
        if !order.contains(&axis) {
            // Keep the feature axis last
            t = t.unsqueeze(order.len())?;
            order.push(axis);
        }
    }

    let perm: Vec<usize> = PROMPT_AXES
        .iter()
        .filter_map(|axis| order.iter().position(|o| o == axis))
        .chain(std::iter::once(PROMPT_AXES.len()))
        .collect();

    Ok(t.permute(perm)?.contiguous()?)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Perceptor returning a fixed vector for every input
    pub(crate) struct FixedPerceptor {
        pub name: String,
        pub vector: Vec<f32>,
    }

    impl FixedPerceptor {
        pub fn new(name: &str, vector: Vec<f32>) -> Arc<dyn Perceptor> {
            Arc::new(Self {
                name: name.to_string(),
                vector,
            })
        }
    }

    impl Perceptor for FixedPerceptor {
        fn name(&self) -> &str {
            &self.name
        }

        fn encode_text(&self, _text: &str, device: &Device) -> Result<Tensor, PerceptorError> {
            Ok(Tensor::from_slice(&self.vector, (1, self.vector.len()), device)?)
        }

        fn encode_image(&self, image: &PixelImage) -> Result<Tensor, PerceptorError> {
            Ok(Tensor::from_slice(
                &self.vector,
                (1, self.vector.len()),
                image.device(),
            )?)
        }
    }

    #[test]
    fn test_cat_with_pad_pads_to_widest() {
        let device = Device::Cpu;
        let narrow = Tensor::ones((1, 512), candle_core::DType::F32, &device).unwrap();
        let wide = Tensor::ones((1, 768), candle_core::DType::F32, &device).unwrap();

        let out = cat_with_pad(&[narrow, wide]).unwrap();
        assert_eq!(out.dims(), &[2, 768]);

        let rows = out.to_vec2::<f32>().unwrap();
        assert!(rows[0][..512].iter().all(|v| *v == 1.0));
        assert!(rows[0][512..].iter().all(|v| *v == 0.0));
        assert!(rows[1].iter().all(|v| *v == 1.0));
    }

    #[test]
    fn test_cat_with_pad_empty() {
        assert!(matches!(cat_with_pad(&[]), Err(PerceptorError::Empty)));
    }

    #[test]
    fn test_set_encodes_with_every_perceptor() {
        let set = PerceptorSet::new(vec![
            FixedPerceptor::new("a", vec![1.0, 2.0]),
            FixedPerceptor::new("b", vec![3.0, 4.0, 5.0]),
        ]);
        let out = set.encode_text("anything", &Device::Cpu).unwrap();
        assert_eq!(
            out.to_vec2::<f32>().unwrap(),
            vec![vec![1.0, 2.0, 0.0], vec![3.0, 4.0, 5.0]]
        );
        assert_eq!(format!("{:?}", set), "[\"a\", \"b\"]");
    }

    #[test]
    fn test_format_embedding_inserts_missing_axes() {
        let t = Tensor::zeros((5, 16), candle_core::DType::F32, &Device::Cpu).unwrap();
        let out = format_embedding(&t, &[Axis::Batch]).unwrap();
        assert_eq!(out.dims(), &[5, 1, 1, 16]);
    }

    #[test]
    fn test_format_embedding_permutes() {
        // (c=2, n=3, feature=4)
        let data: Vec<f32> = (0..24).map(|v| v as f32).collect();
        let t = Tensor::from_vec(data, (2, 3, 4), &Device::Cpu).unwrap();
        let out = format_embedding(&t, &[Axis::Channel, Axis::Batch]).unwrap();
        assert_eq!(out.dims(), &[3, 2, 1, 4]);

        // element [n=1, c=1] is source row [c=1, n=1]
        let v = out.get(1).unwrap().get(1).unwrap().get(0).unwrap();
        assert_eq!(v.to_vec1::<f32>().unwrap(), vec![16.0, 17.0, 18.0, 19.0]);
    }

    #[test]
    fn test_format_embedding_rejects_bad_axes() {
        let t = Tensor::zeros((2, 3, 4), candle_core::DType::F32, &Device::Cpu).unwrap();
        assert!(format_embedding(&t, &[Axis::Batch]).is_err());
        assert!(format_embedding(&t, &[Axis::Batch, Axis::Batch]).is_err());
    }

    #[test]
    fn test_multi_embedder_layout() {
        let set = PerceptorSet::new(vec![
            FixedPerceptor::new("a", vec![1.0; 4]),
            FixedPerceptor::new("b", vec![2.0; 6]),
        ]);
        let embedder = MultiPerceptorEmbedder::new(set);
        let image = PixelImage::new(2, 2, &Device::Cpu).unwrap();

        let out = embedder.embed(&image).unwrap();
        assert_eq!(out.dims(), &[2, 1, 6]);

        let formatted = format_embedding(&out, embedder.output_axes()).unwrap();
        assert_eq!(formatted.dims(), &[1, 2, 1, 6]);
    }
}
