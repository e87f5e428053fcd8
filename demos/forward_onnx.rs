//! Round-trip a randomly initialized SAE through ONNX without any download.
//!
//! Builds an SAE, exports it to a temporary directory, replays the graph
//! with the bundled runtime, and compares it with `Sae::forward_onnx`.
//!
//! Usage:
//!   cargo run --release --example `forward_onnx`
//!   cargo run --release --example `forward_onnx` -- --d-in 256 --k 16 --batch 8

#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_precision_loss)]

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use clap::Parser;
use sae_onnx::{export_sae, ExportOptions, OnnxSession, Sae, SaeConfig};

#[derive(Parser)]
struct Args {
    /// Input width
    #[arg(long, default_value_t = 128)]
    d_in: usize,

    /// Latents per input dimension
    #[arg(long, default_value_t = 8)]
    expansion_factor: usize,

    /// Latents kept per row
    #[arg(long, default_value_t = 32)]
    k: usize,

    /// Rows of random input
    #[arg(long, default_value_t = 4)]
    batch: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    let device = Device::Cpu;

    let config = SaeConfig {
        expansion_factor: args.expansion_factor,
        k: args.k,
        ..Default::default()
    };
    let sae = Sae::new(args.d_in, config, &device, DType::F32, true)?;
    println!(
        "SAE: d_in={}, num_latents={}, k={}, decode={}",
        sae.d_in(),
        sae.num_latents(),
        sae.k(),
        sae.decode_strategy()
    );

    let dir = tempfile::tempdir()?;
    let exported = export_sae(&sae, dir.path(), &ExportOptions::default())?;
    let session = OnnxSession::load(&exported.model_path)?;
    println!(
        "Graph inputs: {:?}, outputs: {:?}",
        session.input_names(),
        session.output_names()
    );

    let x = Tensor::randn(0.0f32, 1.0, (args.batch, args.d_in), &device)?;
    let expected = sae.forward_onnx(&x)?;
    let actual = session.run_sae(&x)?;
    let max_diff = (&expected - &actual)?
        .abs()?
        .flatten_all()?
        .max(0)?
        .to_scalar::<f32>()?;

    let fvu = sae.forward(&x)?.fvu;
    println!("\nOutput shape: {:?}", actual.dims());
    println!("Max |forward_onnx - onnx| = {max_diff:.3e}");
    println!("FVU on random input: {fvu:.4}");

    Ok(())
}
