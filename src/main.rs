use anyhow::{bail, Context, Result};
use candle_core::{Device, Tensor};
use clap::{Parser, Subcommand};
use perceptor::descriptor::{PromptSpec, SplitRule};
use perceptor::{Config, EmbeddingTable, MultiPerceptorEmbedder, PerceptorSet, Prompt};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::Level;

#[derive(Parser)]
#[command(name = "perceptor")]
#[command(author = "MrMattias")]
#[command(version)]
#[command(about = "Score embeddings against weighted text and image prompts")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a prompt descriptor and print its fields
    Parse {
        /// TEXT[:WEIGHT[:STOP]]
        descriptor: String,
        /// Parse as an image prompt (URLs keep their scheme colon)
        #[arg(short, long)]
        image: bool,
    },
    /// Score a candidate embedding against a prompt
    Score {
        /// TEXT[:WEIGHT[:STOP]] or PATH_OR_URL[:WEIGHT[:STOP]] with --image
        descriptor: String,
        /// JSON file with { "shape": [...], "values": [...] }
        #[arg(short, long)]
        candidate: PathBuf,
        /// Build the target from an image instead of text
        #[arg(short, long)]
        image: bool,
    },
    /// Pack a JSON map of text → embedding into a binary table
    PackTable {
        /// JSON object { "text": [f32, ...] }
        json: PathBuf,
        /// Output table path
        out: PathBuf,
    },
}

/// Candidate embedding as read from disk
#[derive(Deserialize)]
struct CandidateFile {
    shape: Vec<usize>,
    values: Vec<f32>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Parse { descriptor, image } => cmd_parse(&descriptor, image)?,
        Commands::Score {
            descriptor,
            candidate,
            image,
        } => cmd_score(&descriptor, &candidate, image)?,
        Commands::PackTable { json, out } => cmd_pack_table(&json, &out)?,
    }

    Ok(())
}

fn cmd_parse(descriptor: &str, image: bool) -> Result<()> {
    let config = Config::load()?;
    let rule = if image { SplitRule::UrlSafe } else { SplitRule::Text };

    let spec = if config.scoring.validate_stop_sign {
        PromptSpec::parse_strict(descriptor, rule)?
    } else {
        PromptSpec::parse(descriptor, rule)?
    };

    println!("Descriptor: {}", spec.descriptor);
    println!("Text:       {}", spec.text);
    println!("Weight:     {}", spec.weight);
    println!("Stop:       {}", spec.stop);

    Ok(())
}

fn cmd_score(descriptor: &str, candidate_path: &Path, image: bool) -> Result<()> {
    let config = Config::load()?;
    if image {
        check_image_support(&config)?;
    }
    let device = config.device.device()?;
    let perceptors = load_perceptors(&config)?;

    let prompt = if image {
        let embedder = MultiPerceptorEmbedder::new(perceptors);
        Prompt::from_image(
            &embedder,
            descriptor,
            None,
            &device,
            &config.fetch,
            &config.scoring,
        )?
    } else {
        Prompt::from_text(descriptor, &perceptors, &device, &config.scoring)?
    };

    let candidate = load_candidate(candidate_path, &device)?;
    let loss = prompt.score_value(&candidate)?;

    tracing::info!(prompt = %prompt, "scored candidate");
    println!("{}", loss);

    Ok(())
}

fn cmd_pack_table(json: &Path, out: &Path) -> Result<()> {
    let data = fs::read_to_string(json)
        .with_context(|| format!("Failed to read {}", json.display()))?;
    let entries: BTreeMap<String, Vec<f32>> = serde_json::from_str(&data)
        .with_context(|| format!("Failed to parse {}", json.display()))?;

    let name = out
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "table".to_string());
    let table = EmbeddingTable::from_entries(&name, entries)?;
    table.save(out)?;

    tracing::info!(entries = table.len(), dim = table.dim(), "packed embedding table");
    println!("✓ Wrote {} embeddings to {}", table.len(), out.display());

    Ok(())
}

/// Embedding tables only hold text, so image prompts need a CLIP model.
fn check_image_support(config: &Config) -> Result<()> {
    if !cfg!(feature = "clip") {
        bail!("Image prompts need a CLIP model. Rebuild perceptor with --features clip");
    }
    if config.perceptors.clip.is_none() {
        bail!(
            "Image prompts need a CLIP model. Add a [perceptors.clip] section to {}",
            Config::config_path().display()
        );
    }
    Ok(())
}

fn load_perceptors(config: &Config) -> Result<PerceptorSet> {
    let mut perceptors = PerceptorSet::default();

    for path in config.perceptors.table_paths() {
        let table = EmbeddingTable::open(&path)
            .with_context(|| format!("Failed to load embedding table {}", path.display()))?;
        tracing::info!(path = %path.display(), entries = table.len(), "loaded embedding table");
        perceptors.push(Arc::new(table));
    }

    #[cfg(feature = "clip")]
    {
        if let Some(clip_config) = &config.perceptors.clip {
            let clip = perceptor::clip::ClipPerceptor::load(clip_config)
                .context("Failed to load CLIP model")?;
            perceptors.push(Arc::new(clip));
        }
    }

    #[cfg(not(feature = "clip"))]
    {
        if config.perceptors.clip.is_some() {
            tracing::warn!("CLIP configured but perceptor was built without the 'clip' feature");
        }
    }

    if perceptors.is_empty() {
        bail!(
            "No perceptors configured. Add embedding tables under [perceptors] in {}",
            Config::config_path().display()
        );
    }

    Ok(perceptors)
}

fn load_candidate(path: &Path, device: &Device) -> Result<Tensor> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let candidate: CandidateFile = serde_json::from_str(&data)
        .with_context(|| format!("Failed to parse {}", path.display()))?;

    let expected: usize = candidate.shape.iter().product();
    if expected != candidate.values.len() {
        bail!(
            "Candidate shape {:?} needs {} values, found {}",
            candidate.shape,
            expected,
            candidate.values.len()
        );
    }

    Ok(Tensor::from_vec(candidate.values, candidate.shape, device)?)
}
