//! sae-onnx CLI: export, check, and replay SAE inference graphs

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use clap::{Parser, Subcommand};
use sae_onnx::{check_model, export_sae, select_device, ExportOptions, OnnxSession, Sae, SaeError};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "sae-onnx")]
#[command(about = "Export top-k sparse autoencoders to ONNX")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Download an SAE, export it, and validate the result
    Export {
        /// SAE repository on `HuggingFace` (e.g., "EleutherAI/sae-llama-3-8b-32x")
        #[arg(short, long)]
        repo: String,

        /// Hookpoint subdirectory (e.g., "layers.10")
        #[arg(long)]
        hookpoint: String,

        /// Output directory for sae.onnx
        #[arg(short, long, default_value = "onnx_export")]
        output: PathBuf,

        /// Embed every weight in the model file
        #[arg(long)]
        no_external_data: bool,

        /// Force CPU mode
        #[arg(long)]
        cpu: bool,
    },

    /// Validate an exported model
    Check {
        /// Path to the .onnx file
        path: PathBuf,
    },

    /// Compare the exported graph against the in-process SAE on random input
    Run {
        #[arg(short, long)]
        repo: String,

        #[arg(long)]
        hookpoint: String,

        /// Directory holding sae.onnx
        #[arg(short, long, default_value = "onnx_export")]
        output: PathBuf,

        /// Rows of random input
        #[arg(short, long, default_value_t = 1)]
        batch: usize,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install logger: {e}");
    }

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<SaeError>() {
                Some(SaeError::Validation(msg)) => error!("ONNX model is invalid: {msg}"),
                _ => error!("{e:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::Export {
            repo,
            hookpoint,
            output,
            no_external_data,
            cpu,
        } => {
            let device = select_device(cpu);
            let sae = Sae::load_from_hub(&repo, &hookpoint, &device, true)
                .with_context(|| format!("loading {hookpoint} from {repo}"))?;

            let options = ExportOptions {
                external_data: !no_external_data,
                ..Default::default()
            };
            let exported = export_sae(&sae, &output, &options)
                .with_context(|| format!("exporting to {}", output.display()))?;
            check_model(&exported.model_path)?;
            println!("ONNX model is valid: {}", exported.model_path.display());
            if let Some(data) = &exported.data_path {
                println!("External data:      {}", data.display());
            }
        }
        Command::Check { path } => {
            let model = check_model(&path)?;
            let nodes = model.graph.as_ref().map_or(0, |g| g.node.len());
            println!("ONNX model is valid: {} ({nodes} nodes)", path.display());
        }
        Command::Run {
            repo,
            hookpoint,
            output,
            batch,
        } => {
            let sae = Sae::load_from_hub(&repo, &hookpoint, &Device::Cpu, true)
                .with_context(|| format!("loading {hookpoint} from {repo}"))?;
            let model_path = output.join(ExportOptions::default().file_name);
            let session = OnnxSession::load(&model_path)
                .with_context(|| format!("loading {}", model_path.display()))?;

            let x = Tensor::randn(0.0f32, 1.0, (batch, sae.d_in()), &Device::Cpu)?;
            let expected = sae.forward_onnx(&x)?;
            let actual = session.run_sae(&x)?;
            let max_diff = (expected - &actual)?
                .abs()?
                .flatten_all()?
                .max(0)?
                .to_scalar::<f32>()?;
            info!("Output shape: {:?}", actual.dims());
            println!("Max |forward_onnx - onnx| = {max_diff:.3e}");
        }
    }
    Ok(())
}
