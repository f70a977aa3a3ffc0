mod logging;

use std::path::PathBuf;

use anyhow::{bail, Context};
use candle_core::{DType, Device};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;
use vlm_core::loader::{load_weights, ModelFiles};
use vlm_core::multimodal::{PoolingGeometry, DEFAULT_TOKENS_PER_IMAGE};
use vlm_core::{Input, ModelRegistry};

#[derive(Parser)]
#[command(name = "vlm", about = "Gemma 3 multimodal request assembly tools")]
struct Cli {
    /// Log level used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Encode images with a local checkpoint and print payload shapes and fingerprints
    Encode {
        /// Directory holding config.json and safetensors weights
        #[arg(long)]
        model_dir: PathBuf,

        /// Image file; repeat to encode several adjacent images
        #[arg(long = "image", required = true)]
        images: Vec<PathBuf>,

        /// Weight dtype: f32, f16 or bf16
        #[arg(long, default_value = "f32")]
        dtype: String,
    },

    /// Print patch grid and pooling arithmetic for a vision tower
    Geometry {
        #[arg(long, default_value_t = 896)]
        image_size: usize,

        #[arg(long, default_value_t = 14)]
        patch_size: usize,

        #[arg(long, default_value_t = DEFAULT_TOKENS_PER_IMAGE)]
        tokens_per_image: usize,
    },

    /// List registered architectures
    Architectures,
}

fn parse_dtype(name: &str) -> anyhow::Result<DType> {
    Ok(match name {
        "f32" => DType::F32,
        "f16" => DType::F16,
        "bf16" => DType::BF16,
        other => bail!("unsupported dtype {other:?} (expected f32, f16 or bf16)"),
    })
}

fn encode(model_dir: PathBuf, images: Vec<PathBuf>, dtype: &str) -> anyhow::Result<()> {
    let dtype = parse_dtype(dtype)?;
    let device = Device::Cpu;

    let files = ModelFiles::from_dir(&model_dir)
        .with_context(|| format!("reading model directory {}", model_dir.display()))?;
    let vb = load_weights(&files.weights, dtype, &device)?;
    let model = ModelRegistry::with_defaults().construct_from_config(&files.config, vb)?;

    let mut inputs = Vec::with_capacity(images.len());
    let mut reports = Vec::with_capacity(images.len());
    for path in &images {
        let bytes =
            std::fs::read(path).with_context(|| format!("reading image {}", path.display()))?;
        let encoded = model
            .encode_multimodal(&bytes)
            .with_context(|| format!("encoding {}", path.display()))?;
        info!(image = %path.display(), "encoded");
        reports.push(json!({
            "image": path.display().to_string(),
            "shape": encoded.payload.embedding().dims(),
            "fingerprint": format!("{:016x}", encoded.fingerprint),
        }));
        inputs.push(Input::placeholder(encoded.payload, encoded.fingerprint));
    }

    let merged = model.post_tokenize(inputs)?;
    let fused = merged
        .first()
        .and_then(|input| input.multimodal.as_ref().map(|p| (p, input.multimodal_hash)));
    let fused = fused.map(|(payload, hash)| {
        json!({
            "shape": payload.embedding().dims(),
            "fingerprint": format!("{hash:016x}"),
        })
    });

    let report = json!({ "images": reports, "fused": fused });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn geometry(image_size: usize, patch_size: usize, tokens_per_image: usize) -> anyhow::Result<()> {
    let g = PoolingGeometry::new(image_size, patch_size, tokens_per_image)?;
    let report = json!({
        "image_size": image_size,
        "patch_size": patch_size,
        "patches_per_side": g.patches_per_side,
        "num_patches": g.num_patches,
        "kernel": g.kernel,
        "stride": g.kernel,
        "tokens_per_image": g.tokens_per_image,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level, logging::LogFormat::from_env());

    match cli.command {
        Command::Encode {
            model_dir,
            images,
            dtype,
        } => encode(model_dir, images, &dtype),
        Command::Geometry {
            image_size,
            patch_size,
            tokens_per_image,
        } => geometry(image_size, patch_size, tokens_per_image),
        Command::Architectures => {
            for name in ModelRegistry::with_defaults().names() {
                println!("{name}");
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_repeated_images() {
        let cli = Cli::try_parse_from([
            "vlm",
            "encode",
            "--model-dir",
            "/models/gemma3",
            "--image",
            "a.png",
            "--image",
            "b.png",
        ])
        .unwrap();
        match cli.command {
            Command::Encode { images, dtype, .. } => {
                assert_eq!(images.len(), 2);
                assert_eq!(dtype, "f32");
            }
            _ => panic!("expected encode"),
        }
    }

    #[test]
    fn encode_requires_an_image() {
        assert!(Cli::try_parse_from(["vlm", "encode", "--model-dir", "/m"]).is_err());
    }

    #[test]
    fn dtype_names() {
        assert_eq!(parse_dtype("bf16").unwrap(), DType::BF16);
        assert!(parse_dtype("int8").is_err());
    }
}
