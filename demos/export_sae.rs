//! Export a pretrained SAE to ONNX and validate the artifact.
//!
//! Downloads `{hookpoint}/cfg.json` and `{hookpoint}/sae.safetensors`,
//! wraps the model for export, writes `sae.onnx` (+ `sae.onnx.data`), and
//! runs the checker on the result.
//!
//! Usage:
//!   cargo run --release --example `export_sae`
//!   cargo run --release --example `export_sae` -- --repo EleutherAI/sae-llama-3-8b-32x --hookpoint layers.10

#![allow(clippy::doc_markdown)]

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use sae_onnx::{check_model, select_device, Sae, SaeOnnxWrapper};

#[derive(Parser)]
struct Args {
    /// `HuggingFace` SAE repository
    #[arg(long, default_value = "EleutherAI/sae-llama-3-8b-32x")]
    repo: String,

    /// Hookpoint to export
    #[arg(long, default_value = "layers.10")]
    hookpoint: String,

    /// Output directory
    #[arg(long, default_value = "onnx_export")]
    output: PathBuf,

    /// Force CPU execution
    #[arg(long)]
    cpu: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let device = select_device(args.cpu);
    println!("Device: {device:?}");

    let sae = Sae::load_from_hub(&args.repo, &args.hookpoint, &device, true)?;
    println!(
        "\nSAE {}: d_in={}, num_latents={}, k={}",
        args.hookpoint,
        sae.d_in(),
        sae.num_latents(),
        sae.k()
    );

    let wrapper = SaeOnnxWrapper::new(&sae);
    let exported = wrapper.export(&args.output)?;
    println!("\nWrote {}", exported.model_path.display());
    if let Some(data) = &exported.data_path {
        println!(
            "External data: {} ({} of {} initializers)",
            data.display(),
            exported.num_external,
            exported.num_initializers
        );
    }

    match check_model(&exported.model_path) {
        Ok(_) => println!("The ONNX model is valid."),
        Err(e) => println!("The ONNX model is invalid: {e}"),
    }

    Ok(())
}
