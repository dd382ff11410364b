//! Compact binary tables of precomputed text embeddings.
//!
//! A table acts as an offline text perceptor: encoding a prompt looks its
//! text up instead of running a model, so prompts can be scored without
//! ONNX Runtime.
//!
//! Binary format (little-endian):
//!   [u32] embedding_dim
//!   [u32] number_of_entries
//!   Per entry:
//!     [u32] text_length
//!     [u8 * text_length] UTF-8 text
//!     [f32 * embedding_dim] embedding values

use crate::error::PerceptorError;
use crate::image_repr::PixelImage;
use crate::perceptor::Perceptor;
use candle_core::{Device, Tensor};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct EmbeddingTable {
    name: String,
    source: PathBuf,
    dim: usize,
    entries: BTreeMap<String, Vec<f32>>,
}

impl EmbeddingTable {
    /// Build a table from text → embedding pairs. All embeddings must share
    /// one width.
    pub fn from_entries(
        name: &str,
        entries: BTreeMap<String, Vec<f32>>,
    ) -> Result<Self, PerceptorError> {
        let source = PathBuf::from(name);
        let dim = entries.values().next().map(|v| v.len()).unwrap_or(0);

        if let Some((text, v)) = entries.iter().find(|(_, v)| v.len() != dim) {
            return Err(PerceptorError::Table {
                path: source,
                reason: format!("{:?} has {} values, expected {}", text, v.len(), dim),
            });
        }

        Ok(Self {
            name: name.to_string(),
            source,
            dim,
            entries,
        })
    }

    /// Read a table file. The perceptor is named after the file stem.
    pub fn open(path: &Path) -> Result<Self, PerceptorError> {
        let data = fs::read(path)?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "table".to_string());

        let mut table = Self::parse(&name, &data).map_err(|reason| PerceptorError::Table {
            path: path.to_path_buf(),
            reason,
        })?;
        table.source = path.to_path_buf();

        tracing::debug!(
            path = %path.display(),
            entries = table.len(),
            dim = table.dim,
            "loaded embedding table"
        );
        Ok(table)
    }

    fn parse(name: &str, data: &[u8]) -> Result<Self, String> {
        let mut offset = 0;

        let dim = read_u32(data, &mut offset)? as usize;
        let count = read_u32(data, &mut offset)?;
        let mut entries = BTreeMap::new();

        for _ in 0..count {
            let text_len = read_u32(data, &mut offset)? as usize;
            let bytes = take(data, &mut offset, text_len)?;
            let text = std::str::from_utf8(bytes)
                .map_err(|_| format!("invalid UTF-8 in entry at byte {}", offset - text_len))?
                .to_string();

            let remaining = data.len() - offset;
            if dim.checked_mul(4).map_or(true, |needed| needed > remaining) {
                return Err(format!("truncated at byte {}: embedding needs {} values", offset, dim));
            }

            let mut embedding = Vec::with_capacity(dim);
            for _ in 0..dim {
                embedding.push(read_f32(data, &mut offset)?);
            }

            entries.insert(text, embedding);
        }

        if offset != data.len() {
            return Err(format!("{} trailing bytes", data.len() - offset));
        }

        Ok(Self {
            name: name.to_string(),
            source: PathBuf::from(name),
            dim,
            entries,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.dim as u32).to_le_bytes());
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());

        for (text, embedding) in &self.entries {
            out.extend_from_slice(&(text.len() as u32).to_le_bytes());
            out.extend_from_slice(text.as_bytes());
            for value in embedding {
                out.extend_from_slice(&value.to_le_bytes());
            }
        }

        out
    }

    pub fn save(&self, path: &Path) -> Result<(), PerceptorError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_bytes())?;
        Ok(())
    }

    /// Look up an embedding, falling back to a case-insensitive match.
    pub fn get(&self, text: &str) -> Option<&[f32]> {
        let text = text.trim();
        self.entries
            .get(text)
            .or_else(|| {
                self.entries
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(text))
                    .map(|(_, v)| v)
            })
            .map(|v| v.as_slice())
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn source(&self) -> &Path {
        &self.source
    }
}

impl Perceptor for EmbeddingTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn encode_text(&self, text: &str, device: &Device) -> Result<Tensor, PerceptorError> {
        let embedding = self.get(text).ok_or_else(|| PerceptorError::UnknownText {
            perceptor: self.name.clone(),
            text: text.to_string(),
        })?;
        Ok(Tensor::from_slice(embedding, (1, self.dim), device)?)
    }

    fn encode_image(&self, _image: &PixelImage) -> Result<Tensor, PerceptorError> {
        Err(PerceptorError::Unsupported {
            perceptor: self.name.clone(),
            modality: "images",
        })
    }
}

fn take<'a>(data: &'a [u8], offset: &mut usize, len: usize) -> Result<&'a [u8], String> {
    let end = offset
        .checked_add(len)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| format!("truncated at byte {}", offset))?;
    let bytes = &data[*offset..end];
    *offset = end;
    Ok(bytes)
}

fn read_u32(data: &[u8], offset: &mut usize) -> Result<u32, String> {
    let bytes = take(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_f32(data: &[u8], offset: &mut usize) -> Result<f32, String> {
    let bytes = take(data, offset, 4)?;
    Ok(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> EmbeddingTable {
        let mut entries = BTreeMap::new();
        entries.insert("nature".to_string(), vec![0.6, 0.8, 0.0]);
        entries.insert("space".to_string(), vec![0.0, 0.0, 1.0]);
        EmbeddingTable::from_entries("sample", entries).unwrap()
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vit-b32.bin");
        sample().save(&path).unwrap();

        let table = EmbeddingTable::open(&path).unwrap();
        assert_eq!(table.name(), "vit-b32");
        assert_eq!(table.dim(), 3);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get("space"), Some(&[0.0f32, 0.0, 1.0][..]));
    }

    #[test]
    fn test_lookup_is_trimmed_and_case_insensitive() {
        let table = sample();
        assert!(table.get("  nature ").is_some());
        assert!(table.get("Nature").is_some());
        assert!(table.get("city").is_none());
    }

    #[test]
    fn test_mismatched_widths_rejected() {
        let mut entries = BTreeMap::new();
        entries.insert("a".to_string(), vec![1.0, 2.0]);
        entries.insert("b".to_string(), vec![1.0]);
        assert!(EmbeddingTable::from_entries("bad", entries).is_err());
    }

    #[test]
    fn test_truncated_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.bin");
        let mut bytes = sample().to_bytes();
        bytes.truncate(bytes.len() - 2);
        fs::write(&path, bytes).unwrap();

        assert!(matches!(
            EmbeddingTable::open(&path),
            Err(PerceptorError::Table { .. })
        ));
    }

    #[test]
    fn test_oversized_dimension_rejected() {
        let bytes: Vec<u8> = [u32::MAX, 1, 0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let err = EmbeddingTable::parse("x", &bytes).unwrap_err();
        assert!(err.contains("truncated"), "{}", err);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = sample().to_bytes();
        bytes.push(0);
        assert!(EmbeddingTable::parse("x", &bytes).is_err());
    }

    #[test]
    fn test_perceptor_text_and_image() {
        let table = sample();
        let t = table.encode_text("nature", &Device::Cpu).unwrap();
        assert_eq!(t.dims(), &[1, 3]);

        assert!(matches!(
            table.encode_text("city", &Device::Cpu),
            Err(PerceptorError::UnknownText { .. })
        ));

        let img = PixelImage::new(2, 2, &Device::Cpu).unwrap();
        assert!(matches!(
            table.encode_image(&img),
            Err(PerceptorError::Unsupported { .. })
        ));
    }
}
