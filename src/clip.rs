//! CLIP perceptor backed by ONNX Runtime
//!
//! Runs the vision and text towers of a CLIP export (ViT-B/32 by default)
//! and downloads the model files into the cache directory on first use.

use crate::config::ClipModelConfig;
use crate::error::PerceptorError;
use crate::image_repr::PixelImage;
use crate::perceptor::Perceptor;
use crate::utils::expand_tilde;
use candle_core::{Device, Tensor};
use image::{imageops::FilterType, RgbImage};
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{Array2, Array4};
use ort::session::Session;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokenizers::{PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};

/// CLIP text context length
const CONTEXT_LENGTH: usize = 77;

/// CLIP normalization constants
const MEAN: [f32; 3] = [0.48145466, 0.4578275, 0.40821073];
const STD: [f32; 3] = [0.26862954, 0.26130258, 0.27577711];

/// Model cache directory manager
pub struct ModelManager {
    cache_dir: PathBuf,
}

impl ModelManager {
    pub fn new(config: &ClipModelConfig) -> Self {
        let cache_dir = match &config.model_dir {
            Some(dir) => expand_tilde(&dir.to_string_lossy()),
            None => directories::ProjectDirs::from("com", "mrmattias", "perceptor")
                .map(|dirs| dirs.cache_dir().join("models"))
                .unwrap_or_else(|| PathBuf::from("/tmp/perceptor/models"))
                .join(&config.name),
        };

        Self { cache_dir }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Path of `file`, downloading it from `url` when it is not cached yet.
    pub fn ensure(&self, url: &str, file: &str, label: &str) -> Result<PathBuf, PerceptorError> {
        fs::create_dir_all(&self.cache_dir)?;

        let path = self.cache_dir.join(file);
        if !path.exists() {
            self.download(url, &path, label)?;
        }

        Ok(path)
    }

    fn download(&self, url: &str, dest: &Path, label: &str) -> Result<(), PerceptorError> {
        tracing::info!(url, "Downloading CLIP {}", label);

        let download_err = |reason: String| PerceptorError::Download {
            url: url.to_string(),
            reason,
        };

        let mut response = reqwest::blocking::get(url)
            .and_then(|r| r.error_for_status())
            .map_err(|e| download_err(e.to_string()))?;

        let pb = ProgressBar::new(response.content_length().unwrap_or(0));
        if let Ok(style) = ProgressStyle::default_bar().template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
        ) {
            pb.set_style(style.progress_chars("#>-"));
        }

        // Write to a side file so an interrupted download is never mistaken
        // for a cached model
        let partial = dest.with_extension("part");
        let mut file = fs::File::create(&partial)?;
        let mut buf = vec![0u8; 64 * 1024];

        loop {
            let n = response
                .read(&mut buf)
                .map_err(|e| download_err(e.to_string()))?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])?;
            pb.inc(n as u64);
        }

        file.flush()?;
        fs::rename(&partial, dest)?;
        pb.finish_with_message("Download complete");
        tracing::info!(path = %dest.display(), "Saved CLIP {}", label);

        Ok(())
    }
}

/// CLIP text and image encoder
pub struct ClipPerceptor {
    name: String,
    image_size: u32,
    vision: Mutex<Session>,
    text: Mutex<Session>,
    tokenizer: Tokenizer,
}

impl ClipPerceptor {
    /// Load (downloading if needed) the configured CLIP model.
    pub fn load(config: &ClipModelConfig) -> Result<Self, PerceptorError> {
        let models = ModelManager::new(config);
        let vision_path = models.ensure(&config.vision_model_url, "vision_model.onnx", "vision encoder")?;
        let text_path = models.ensure(&config.text_model_url, "text_model.onnx", "text encoder")?;
        let tokenizer_path = models.ensure(&config.tokenizer_url, "tokenizer.json", "tokenizer")?;

        tracing::info!(model = %config.name, "Loading CLIP model");

        let vision = load_session(&vision_path)?;
        let text = load_session(&text_path)?;
        let tokenizer = load_tokenizer(&tokenizer_path)?;

        tracing::info!(model = %config.name, "CLIP model loaded");

        Ok(Self {
            name: config.name.clone(),
            image_size: config.image_size,
            vision: Mutex::new(vision),
            text: Mutex::new(text),
            tokenizer,
        })
    }

    /// Resize to the model resolution and normalize into NCHW.
    fn preprocess(&self, img: &RgbImage) -> Result<Array4<f32>, PerceptorError> {
        let size = self.image_size;
        let img = image::imageops::resize(img, size, size, FilterType::Lanczos3);

        let mut data = Vec::with_capacity(3 * size as usize * size as usize);

        for c in 0..3 {
            for y in 0..size {
                for x in 0..size {
                    let pixel = img.get_pixel(x, y);
                    let value = (pixel[c] as f32 / 255.0 - MEAN[c]) / STD[c];
                    data.push(value);
                }
            }
        }

        Array4::from_shape_vec((1, 3, size as usize, size as usize), data)
            .map_err(|e| PerceptorError::Inference(e.to_string()))
    }
}

impl Perceptor for ClipPerceptor {
    fn name(&self) -> &str {
        &self.name
    }

    fn encode_text(&self, text: &str, device: &Device) -> Result<Tensor, PerceptorError> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| PerceptorError::Inference(format!("Text tokenization failed: {}", e)))?;

        let to_i64 = |ids: &[u32]| ids.iter().map(|&id| id as i64).collect::<Vec<_>>();
        let input_ids = to_i64(encoding.get_ids());
        let attention_mask = to_i64(encoding.get_attention_mask());
        let len = input_ids.len();

        let input_ids = Array2::from_shape_vec((1, len), input_ids)
            .map_err(|e| PerceptorError::Inference(e.to_string()))?;
        let attention_mask = Array2::from_shape_vec((1, len), attention_mask)
            .map_err(|e| PerceptorError::Inference(e.to_string()))?;

        let mut session = self
            .text
            .lock()
            .map_err(|_| PerceptorError::Inference("text session lock poisoned".into()))?;

        let input_names: Vec<String> = session.inputs.iter().map(|i| i.name.clone()).collect();
        let output_name = session
            .outputs
            .first()
            .map(|o| o.name.clone())
            .unwrap_or_else(|| "text_embeds".into());

        let ids_tensor = ort::value::Tensor::from_array(input_ids).map_err(onnx_err)?;
        let outputs = if input_names.len() >= 2 {
            let mask_tensor = ort::value::Tensor::from_array(attention_mask).map_err(onnx_err)?;
            session
                .run(ort::inputs![
                    input_names[0].clone() => ids_tensor,
                    input_names[1].clone() => mask_tensor
                ])
                .map_err(onnx_err)?
        } else {
            let name = input_names
                .first()
                .cloned()
                .unwrap_or_else(|| "input_ids".to_string());
            session
                .run(ort::inputs![name => ids_tensor])
                .map_err(onnx_err)?
        };

        let output = outputs.get(&output_name).ok_or_else(|| {
            PerceptorError::Inference(format!("No output '{}' from text model", output_name))
        })?;
        let (_shape, data) = output.try_extract_tensor::<f32>().map_err(onnx_err)?;

        tracing::debug!(text_len = text.len(), dims = data.len(), "Generated CLIP text embedding");
        Ok(Tensor::from_slice(data, (1, data.len()), device)?)
    }

    fn encode_image(&self, image: &PixelImage) -> Result<Tensor, PerceptorError> {
        let rgb = image.decode_image()?;
        let pixel_values = self.preprocess(&rgb)?;

        let mut session = self
            .vision
            .lock()
            .map_err(|_| PerceptorError::Inference("vision session lock poisoned".into()))?;

        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .unwrap_or_else(|| "pixel_values".into());
        let output_name = session
            .outputs
            .first()
            .map(|o| o.name.clone())
            .unwrap_or_else(|| "image_embeds".into());

        let input = ort::value::Tensor::from_array(pixel_values).map_err(onnx_err)?;
        let outputs = session
            .run(ort::inputs![input_name => input])
            .map_err(onnx_err)?;

        let output = outputs.get(&output_name).ok_or_else(|| {
            PerceptorError::Inference(format!("No output '{}' from vision model", output_name))
        })?;
        let (_shape, data) = output.try_extract_tensor::<f32>().map_err(onnx_err)?;

        tracing::debug!(dims = data.len(), "Generated CLIP image embedding");
        Ok(Tensor::from_slice(data, (1, data.len()), image.device())?)
    }
}

fn load_session(path: &Path) -> Result<Session, PerceptorError> {
    tracing::debug!(path = %path.display(), "Loading ONNX session");
    Session::builder()
        .map_err(onnx_err)?
        .with_intra_threads(4)
        .map_err(onnx_err)?
        .commit_from_file(path)
        .map_err(|e| PerceptorError::Inference(format!("Failed to load {}: {}", path.display(), e)))
}

fn load_tokenizer(path: &Path) -> Result<Tokenizer, PerceptorError> {
    let mut tokenizer = Tokenizer::from_file(path)
        .map_err(|e| PerceptorError::Inference(format!("Failed to load tokenizer: {}", e)))?;

    tokenizer.with_padding(Some(PaddingParams {
        strategy: PaddingStrategy::Fixed(CONTEXT_LENGTH),
        ..Default::default()
    }));
    tokenizer
        .with_truncation(Some(TruncationParams {
            max_length: CONTEXT_LENGTH,
            ..Default::default()
        }))
        .map_err(|e| PerceptorError::Inference(format!("Failed to configure truncation: {}", e)))?;

    Ok(tokenizer)
}

fn onnx_err(e: impl std::fmt::Display) -> PerceptorError {
    PerceptorError::Inference(e.to_string())
}
