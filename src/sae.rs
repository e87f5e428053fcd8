//! Top-k sparse autoencoder
//!
//! Loads SAE checkpoints in the per-hookpoint layout used on the HuggingFace
//! hub (e.g. `EleutherAI/sae-llama-3-8b-32x`):
//!
//! ```text
//! {hookpoint}/cfg.json          SaeConfig + d_in
//! {hookpoint}/sae.safetensors   encoder.weight [L, D], encoder.bias [L],
//!                               W_dec [L, D], b_dec [D]
//! ```
//!
//! # Forward pass
//!
//! ```text
//! pre_acts = ReLU(encoder(x - b_dec))              [N, L]
//! top_acts, top_indices = top_k(pre_acts, k)       [N, k]
//! sae_out  = decode(top_acts, top_indices)         [N, D]
//! ```
//!
//! `decode` goes through the model's [`DecodeStrategy`]; `forward_onnx`
//! always uses the eager strategy because that is the computation the
//! exported graph encodes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::Linear;
use hf_hub::{api::sync::Api, Repo, RepoType};
use safetensors::tensor::SafeTensors;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::decode::{decode, default_strategy, DecodeStrategy};
use crate::error::{Result, SaeError};

const CONFIG_FILE: &str = "cfg.json";
const WEIGHTS_FILE: &str = "sae.safetensors";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// SAE hyperparameters (matches the `cfg.json` stored next to the weights).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaeConfig {
    /// Latents per input dimension, used when `num_latents` is 0
    #[serde(default = "default_expansion_factor")]
    pub expansion_factor: usize,
    /// Normalize decoder rows to unit norm at initialization
    #[serde(default = "default_normalize_decoder")]
    pub normalize_decoder: bool,
    /// Explicit latent count (0 = `d_in * expansion_factor`)
    #[serde(default)]
    pub num_latents: usize,
    /// Number of latents kept per row
    #[serde(default = "default_k")]
    pub k: usize,
}

fn default_expansion_factor() -> usize {
    32
}

fn default_normalize_decoder() -> bool {
    true
}

fn default_k() -> usize {
    32
}

impl Default for SaeConfig {
    fn default() -> Self {
        Self {
            expansion_factor: default_expansion_factor(),
            normalize_decoder: default_normalize_decoder(),
            num_latents: 0,
            k: default_k(),
        }
    }
}

impl SaeConfig {
    /// Latent dimension for an input of width `d_in`.
    pub fn num_latents(&self, d_in: usize) -> usize {
        if self.num_latents == 0 {
            d_in * self.expansion_factor
        } else {
            self.num_latents
        }
    }
}

/// On-disk form of `cfg.json`: the config plus the input width.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SaeFileConfig {
    #[serde(flatten)]
    config: SaeConfig,
    d_in: usize,
}

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

/// Top-k selection of the encoder's activations.
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    /// Largest activations, sorted descending along the last axis. Shape `(..., k)`.
    pub top_acts: Tensor,
    /// Latent indices of `top_acts` (U32). Shape `(..., k)`.
    pub top_indices: Tensor,
}

/// Result of a full forward pass.
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    /// Reconstruction, same shape as the input
    pub sae_out: Tensor,
    pub latent_acts: Tensor,
    pub latent_indices: Tensor,
    /// Fraction of variance unexplained: `Σ(sae_out - x)² / Σ(x - mean(x))²`
    pub fvu: f32,
}

// ---------------------------------------------------------------------------
// Sae
// ---------------------------------------------------------------------------

/// Top-k sparse autoencoder.
pub struct Sae {
    config: SaeConfig,
    d_in: usize,
    num_latents: usize,
    encoder: Linear,
    w_dec: Option<Tensor>,
    b_dec: Tensor,
    strategy: DecodeStrategy,
    device: Device,
}

impl Sae {
    /// Freshly initialized SAE.
    ///
    /// Encoder weights are uniform in `±1/sqrt(d_in)`, biases are zero, and
    /// (when `decoder` is set) `W_dec` starts as a copy of the encoder weight,
    /// row-normalized if `config.normalize_decoder`.
    pub fn new(
        d_in: usize,
        config: SaeConfig,
        device: &Device,
        dtype: DType,
        decoder: bool,
    ) -> Result<Self> {
        if d_in == 0 || config.k == 0 {
            return Err(SaeError::InvalidConfig(format!(
                "d_in ({d_in}) and k ({}) must be positive",
                config.k
            )));
        }
        let dtype = compute_dtype(device, dtype);
        let num_latents = config.num_latents(d_in);
        let bound = 1.0 / (d_in as f64).sqrt();
        let weight = Tensor::rand(-bound, bound, (num_latents, d_in), device)?.to_dtype(dtype)?;
        let bias = Tensor::zeros((num_latents,), dtype, device)?;

        let w_dec = if decoder {
            let w = weight.copy()?;
            Some(if config.normalize_decoder {
                unit_norm_rows(&w)?
            } else {
                w
            })
        } else {
            None
        };
        let b_dec = Tensor::zeros((d_in,), dtype, device)?;

        Self::from_parts(config, weight, bias, w_dec, b_dec)
    }

    /// Assemble an SAE from existing tensors.
    ///
    /// `encoder_weight` is `[L, D]`, `encoder_bias` `[L]`, `w_dec` `[L, D]`, `b_dec` `[D]`.
    /// Half-precision tensors on the CPU are upcast to F32, since candle has
    /// no CPU matmul for BF16/F16.
    pub fn from_parts(
        config: SaeConfig,
        encoder_weight: Tensor,
        encoder_bias: Tensor,
        w_dec: Option<Tensor>,
        b_dec: Tensor,
    ) -> Result<Self> {
        let dtype = compute_dtype(encoder_weight.device(), encoder_weight.dtype());
        if dtype != encoder_weight.dtype() {
            info!(
                "Upcasting SAE weights from {:?} to {dtype:?} for CPU",
                encoder_weight.dtype()
            );
        }
        let encoder_weight = encoder_weight.to_dtype(dtype)?;
        let encoder_bias = encoder_bias.to_dtype(dtype)?;
        let w_dec = w_dec.map(|w| w.to_dtype(dtype)).transpose()?;
        let b_dec = b_dec.to_dtype(dtype)?;

        let (num_latents, d_in) = encoder_weight.dims2()?;
        if encoder_bias.dims() != [num_latents] || b_dec.dims() != [d_in] {
            return Err(SaeError::InvalidConfig(format!(
                "bias shapes {:?} / {:?} do not match encoder [{num_latents}, {d_in}]",
                encoder_bias.dims(),
                b_dec.dims()
            )));
        }
        if let Some(w) = &w_dec {
            if w.dims() != [num_latents, d_in] {
                return Err(SaeError::InvalidConfig(format!(
                    "W_dec shape {:?} does not match encoder [{num_latents}, {d_in}]",
                    w.dims()
                )));
            }
        }
        if config.k > num_latents {
            return Err(SaeError::InvalidConfig(format!(
                "k={} exceeds num_latents={num_latents}",
                config.k
            )));
        }

        let device = encoder_weight.device().clone();
        Ok(Self {
            config,
            d_in,
            num_latents,
            encoder: Linear::new(encoder_weight, Some(encoder_bias)),
            w_dec,
            b_dec,
            strategy: default_strategy(),
            device,
        })
    }

    /// Replace the decode strategy chosen at construction.
    pub fn with_decode_strategy(mut self, strategy: DecodeStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    // --- Loading ---

    /// Download and load the SAE trained on `hookpoint` from a hub repository.
    ///
    /// Only `{hookpoint}/cfg.json` and `{hookpoint}/sae.safetensors` are fetched.
    ///
    /// # Arguments
    /// * `repo_id` - HuggingFace repository ID (e.g., `"EleutherAI/sae-llama-3-8b-32x"`)
    /// * `hookpoint` - Subdirectory naming the hooked module (e.g., `"layers.10"`)
    /// * `decoder` - Load `W_dec`; when false, decoding fails as uninitialized
    pub fn load_from_hub(
        repo_id: &str,
        hookpoint: &str,
        device: &Device,
        decoder: bool,
    ) -> Result<Self> {
        let api = Api::new()?;
        let repo = api.repo(Repo::new(repo_id.to_string(), RepoType::Model));

        info!("Downloading {hookpoint}/{CONFIG_FILE} from {repo_id}");
        let cfg_path = repo.get(&format!("{hookpoint}/{CONFIG_FILE}"))?;
        info!("Downloading {hookpoint}/{WEIGHTS_FILE} from {repo_id}");
        let weights_path = repo.get(&format!("{hookpoint}/{WEIGHTS_FILE}"))?;

        Self::load_files(&cfg_path, &weights_path, device, decoder)
    }

    /// Load every SAE in a hub repository, keyed by hookpoint.
    ///
    /// Hookpoints are discovered from the repo file listing and loaded in
    /// natural order (`layers.2` before `layers.10`).
    pub fn load_many_from_hub(
        repo_id: &str,
        device: &Device,
        decoder: bool,
    ) -> Result<Vec<(String, Self)>> {
        let api = Api::new()?;
        let repo = api.repo(Repo::new(repo_id.to_string(), RepoType::Model));
        let info = repo.info()?;

        let mut hookpoints: Vec<String> = info
            .siblings
            .iter()
            .filter_map(|s| s.rfilename.strip_suffix(&format!("/{CONFIG_FILE}")))
            .map(str::to_string)
            .collect();
        if hookpoints.is_empty() {
            return Err(SaeError::InvalidConfig(format!(
                "no */{CONFIG_FILE} found in {repo_id}"
            )));
        }
        hookpoints.sort_by_key(|h| natural_key(h));
        info!("Found {} hookpoints in {repo_id}", hookpoints.len());

        hookpoints
            .into_iter()
            .map(|hookpoint| {
                let sae = Self::load_from_hub(repo_id, &hookpoint, device, decoder)?;
                Ok((hookpoint, sae))
            })
            .collect()
    }

    /// Load from a directory containing `cfg.json` and `sae.safetensors`.
    pub fn load_from_disk(dir: &Path, device: &Device, decoder: bool) -> Result<Self> {
        Self::load_files(&dir.join(CONFIG_FILE), &dir.join(WEIGHTS_FILE), device, decoder)
    }

    fn load_files(
        cfg_path: &Path,
        weights_path: &Path,
        device: &Device,
        decoder: bool,
    ) -> Result<Self> {
        let text = std::fs::read_to_string(cfg_path)?;
        let file_config: SaeFileConfig = serde_json::from_str(&text)?;

        let data = std::fs::read(weights_path)?;
        let st = SafeTensors::deserialize(&data)?;

        let encoder_weight = tensor_from_view(&st.tensor("encoder.weight")?, device)?;
        let encoder_bias = tensor_from_view(&st.tensor("encoder.bias")?, device)?;
        let b_dec = tensor_from_view(&st.tensor("b_dec")?, device)?;
        let w_dec = if decoder {
            Some(tensor_from_view(&st.tensor("W_dec")?, device)?)
        } else {
            None
        };

        let sae = Self::from_parts(file_config.config, encoder_weight, encoder_bias, w_dec, b_dec)?;
        check_declared_d_in(sae.d_in, file_config.d_in)?;
        info!(
            "SAE config: d_in={}, num_latents={}, k={}, decode={}",
            sae.d_in, sae.num_latents, sae.config.k, sae.strategy
        );
        Ok(sae)
    }

    /// Write `cfg.json` and `sae.safetensors` into `dir` (created if missing).
    pub fn save_to_disk(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;

        let file_config = SaeFileConfig {
            config: self.config.clone(),
            d_in: self.d_in,
        };
        std::fs::write(
            dir.join(CONFIG_FILE),
            serde_json::to_string_pretty(&file_config)?,
        )?;

        let mut tensors: HashMap<String, Tensor> = HashMap::new();
        tensors.insert("encoder.weight".to_string(), self.encoder.weight().clone());
        if let Some(bias) = self.encoder.bias() {
            tensors.insert("encoder.bias".to_string(), bias.clone());
        }
        if let Some(w_dec) = &self.w_dec {
            tensors.insert("W_dec".to_string(), w_dec.clone());
        }
        tensors.insert("b_dec".to_string(), self.b_dec.clone());

        let weights_path = dir.join(WEIGHTS_FILE);
        candle_core::safetensors::save(&tensors, &weights_path)?;
        info!("Saved SAE to {}", dir.display());
        Ok(weights_path)
    }

    // --- Accessors ---

    pub fn config(&self) -> &SaeConfig {
        &self.config
    }

    pub fn d_in(&self) -> usize {
        self.d_in
    }

    pub fn num_latents(&self) -> usize {
        self.num_latents
    }

    pub fn k(&self) -> usize {
        self.config.k
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.encoder.weight().dtype()
    }

    pub fn decode_strategy(&self) -> DecodeStrategy {
        self.strategy
    }

    /// Encoder weight `[L, D]`.
    pub fn encoder_weight(&self) -> &Tensor {
        self.encoder.weight()
    }

    /// Encoder bias `[L]`.
    pub fn encoder_bias(&self) -> Option<&Tensor> {
        self.encoder.bias()
    }

    /// Decoder weight `[L, D]`, if loaded.
    pub fn w_dec(&self) -> Option<&Tensor> {
        self.w_dec.as_ref()
    }

    pub fn b_dec(&self) -> &Tensor {
        &self.b_dec
    }

    // --- Computation ---

    /// `ReLU(encoder(x - b_dec))`. `x` is `(..., d_in)`.
    pub fn pre_acts(&self, x: &Tensor) -> Result<Tensor> {
        let sae_in = x.to_dtype(self.dtype())?.broadcast_sub(&self.b_dec)?;
        Ok(self.encoder.forward(&sae_in)?.relu()?)
    }

    /// Keep the `k` largest latents per row.
    pub fn select_topk(&self, latents: &Tensor) -> Result<EncoderOutput> {
        let (top_acts, top_indices) = top_k_last_dim(latents, self.config.k)?;
        Ok(EncoderOutput {
            top_acts,
            top_indices,
        })
    }

    pub fn encode(&self, x: &Tensor) -> Result<EncoderOutput> {
        self.select_topk(&self.pre_acts(x)?)
    }

    /// Decode through the model's strategy.
    pub fn decode(&self, top_acts: &Tensor, top_indices: &Tensor) -> Result<Tensor> {
        decode(
            &self.strategy,
            self.w_dec.as_ref(),
            &self.b_dec,
            top_acts,
            top_indices,
        )
    }

    /// Encode, decode, and report the reconstruction's FVU. `x` is `[N, d_in]`.
    pub fn forward(&self, x: &Tensor) -> Result<ForwardOutput> {
        let x = x.to_dtype(self.dtype())?;
        let EncoderOutput {
            top_acts,
            top_indices,
        } = self.encode(&x)?;
        let sae_out = self.decode(&top_acts, &top_indices)?;

        // Computed in F32 regardless of model dtype
        let x_f32 = x.to_dtype(DType::F32)?;
        let e = (sae_out.to_dtype(DType::F32)? - &x_f32)?;
        let l2_loss = e.sqr()?.sum_all()?.to_scalar::<f32>()?;
        let total_variance = x_f32
            .broadcast_sub(&x_f32.mean_keepdim(0)?)?
            .sqr()?
            .sum_all()?
            .to_scalar::<f32>()?;

        Ok(ForwardOutput {
            sae_out,
            latent_acts: top_acts,
            latent_indices: top_indices,
            fvu: l2_loss / total_variance,
        })
    }

    /// Reconstruction only, decoded eagerly. This is the exported computation.
    pub fn forward_onnx(&self, x: &Tensor) -> Result<Tensor> {
        let EncoderOutput {
            top_acts,
            top_indices,
        } = self.encode(x)?;
        decode(
            &DecodeStrategy::Eager,
            self.w_dec.as_ref(),
            &self.b_dec,
            &top_acts,
            &top_indices,
        )
    }
}

/// Single-tensor adapter over [`Sae::forward_onnx`], the shape export tooling expects.
pub struct SaeOnnxWrapper<'a> {
    sae: &'a Sae,
}

impl<'a> SaeOnnxWrapper<'a> {
    pub fn new(sae: &'a Sae) -> Self {
        Self { sae }
    }

    pub fn sae(&self) -> &Sae {
        self.sae
    }

    /// Export to `output_dir/sae.onnx` with default options.
    pub fn export(&self, output_dir: &Path) -> Result<crate::onnx::ExportedModel> {
        crate::onnx::export_sae(self.sae, output_dir, &crate::onnx::ExportOptions::default())
    }
}

impl Module for SaeOnnxWrapper<'_> {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        self.sae
            .forward_onnx(xs)
            .map_err(|e| candle_core::Error::Msg(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Helper functions
// ---------------------------------------------------------------------------

/// CUDA device 0 when available and not disabled, else the CPU.
pub fn select_device(force_cpu: bool) -> Device {
    if force_cpu {
        info!("Forcing CPU mode");
        return Device::Cpu;
    }
    match Device::cuda_if_available(0) {
        Ok(dev) if dev.is_cuda() => {
            info!("Using CUDA device");
            dev
        }
        _ => {
            info!("CUDA not available, using CPU");
            Device::Cpu
        }
    }
}

fn check_declared_d_in(d_in: usize, declared: usize) -> Result<()> {
    if d_in == declared {
        Ok(())
    } else {
        Err(SaeError::InvalidConfig(format!(
            "cfg.json declares d_in={declared} but weights have d_in={d_in}"
        )))
    }
}

/// F32 in place of BF16/F16 on the CPU, otherwise `dtype` unchanged.
fn compute_dtype(device: &Device, dtype: DType) -> DType {
    match dtype {
        DType::BF16 | DType::F16 if device.is_cpu() => DType::F32,
        other => other,
    }
}

/// Top-k along the last axis: `(values, indices)` sorted by value descending.
///
/// Indices are U32. CUDA's sort kernel is limited to short rows, so
/// non-CPU inputs are sorted on the CPU and moved back.
pub(crate) fn top_k_last_dim(x: &Tensor, k: usize) -> Result<(Tensor, Tensor)> {
    let width = x.dim(D::Minus1)?;
    if k > width {
        return Err(SaeError::InvalidConfig(format!(
            "k={k} exceeds last dimension {width}"
        )));
    }
    let device = x.device().clone();
    let x_sort = if device.is_cpu() {
        x.contiguous()?
    } else {
        x.to_device(&Device::Cpu)?
    };

    let indices = x_sort
        .arg_sort_last_dim(false)?
        .narrow(D::Minus1, 0, k)?
        .contiguous()?;
    let values = x_sort.gather(&indices, D::Minus1)?;

    Ok((values.to_device(&device)?, indices.to_device(&device)?))
}

/// Divide each row by its L2 norm (plus machine epsilon).
fn unit_norm_rows(w: &Tensor) -> Result<Tensor> {
    let eps = match w.dtype() {
        DType::F64 => f64::EPSILON,
        DType::BF16 => 0.0078125,
        DType::F16 => 0.000_976_562_5,
        _ => f64::from(f32::EPSILON),
    };
    let norm = (w.sqr()?.sum_keepdim(1)?.sqrt()? + eps)?;
    Ok(w.broadcast_div(&norm)?)
}

/// Sort key treating digit runs as numbers, so `layers.2` < `layers.10`.
fn natural_key(s: &str) -> Vec<(u64, String)> {
    let mut key = Vec::new();
    let mut text = String::new();
    let mut digits = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
        } else {
            if !digits.is_empty() {
                key.push((digits.parse().unwrap_or(u64::MAX), std::mem::take(&mut text)));
                digits.clear();
            }
            text.push(c);
        }
    }
    key.push((digits.parse().unwrap_or(0), text));
    key
}

/// Convert a safetensors `TensorView` to a candle `Tensor` on the given device.
fn tensor_from_view(view: &safetensors::tensor::TensorView<'_>, device: &Device) -> Result<Tensor> {
    let shape: Vec<usize> = view.shape().to_vec();
    let dtype = match view.dtype() {
        safetensors::Dtype::BF16 => DType::BF16,
        safetensors::Dtype::F16 => DType::F16,
        safetensors::Dtype::F32 => DType::F32,
        safetensors::Dtype::F64 => DType::F64,
        other => {
            return Err(SaeError::InvalidConfig(format!(
                "Unsupported SAE tensor dtype: {other:?}"
            )))
        }
    };
    Ok(Tensor::from_raw_buffer(view.data(), dtype, &shape, device)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn small_sae(decoder: bool) -> Sae {
        let config = SaeConfig {
            expansion_factor: 4,
            k: 8,
            ..Default::default()
        };
        Sae::new(32, config, &Device::Cpu, DType::F32, decoder).unwrap()
    }

    #[test]
    fn test_config_defaults_from_partial_json() {
        let file: SaeFileConfig =
            serde_json::from_str(r#"{"d_in": 4096, "k": 192, "signed": false}"#).unwrap();
        assert_eq!(file.d_in, 4096);
        assert_eq!(file.config.k, 192);
        assert_eq!(file.config.expansion_factor, 32);
        assert!(file.config.normalize_decoder);
        assert_eq!(file.config.num_latents(file.d_in), 131_072);
    }

    #[test]
    fn test_explicit_num_latents_wins() {
        let config = SaeConfig {
            num_latents: 1000,
            ..Default::default()
        };
        assert_eq!(config.num_latents(64), 1000);
    }

    #[test]
    fn test_new_normalizes_decoder_rows() {
        let sae = small_sae(true);
        assert_eq!(sae.num_latents(), 128);
        let norms: Vec<f32> = sae
            .w_dec()
            .unwrap()
            .sqr()
            .unwrap()
            .sum(1)
            .unwrap()
            .sqrt()
            .unwrap()
            .to_vec1()
            .unwrap();
        for n in norms {
            assert!((n - 1.0).abs() < 1e-4, "row norm {n}");
        }
    }

    #[test]
    fn test_encode_keeps_k_sorted_nonnegative() {
        let sae = small_sae(true);
        let x = Tensor::randn(0.0f32, 1.0, (5, 32), &Device::Cpu).unwrap();
        let out = sae.encode(&x).unwrap();
        assert_eq!(out.top_acts.dims(), &[5, 8]);
        assert_eq!(out.top_indices.dims(), &[5, 8]);
        assert_eq!(out.top_indices.dtype(), DType::U32);

        let acts: Vec<Vec<f32>> = out.top_acts.to_vec2().unwrap();
        for row in &acts {
            for pair in row.windows(2) {
                assert!(pair[0] >= pair[1], "not sorted: {row:?}");
            }
            assert!(row.iter().all(|&v| v >= 0.0));
        }
        let indices: Vec<Vec<u32>> = out.top_indices.to_vec2().unwrap();
        for row in &indices {
            assert!(row.iter().all(|&i| (i as usize) < sae.num_latents()));
        }
    }

    #[test]
    fn test_forward_shapes_and_fvu() {
        let sae = small_sae(true);
        let x = Tensor::randn(0.0f32, 1.0, (6, 32), &Device::Cpu).unwrap();
        let out = sae.forward(&x).unwrap();
        assert_eq!(out.sae_out.dims(), &[6, 32]);
        assert_eq!(out.latent_acts.dims(), &[6, 8]);
        assert!(out.fvu.is_finite() && out.fvu >= 0.0);
    }

    #[test]
    fn test_forward_onnx_matches_forward() {
        let sae = small_sae(true);
        let x = Tensor::randn(0.0f32, 1.0, (4, 32), &Device::Cpu).unwrap();
        let a = sae.forward(&x).unwrap().sae_out;
        let b = sae.forward_onnx(&x).unwrap();
        let diff: f32 = (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-3, "forward vs forward_onnx diff {diff}");

        let wrapper = SaeOnnxWrapper::new(&sae);
        let c = wrapper.forward(&x).unwrap();
        assert_eq!(c.dims(), &[4, 32]);
    }

    #[test]
    fn test_missing_decoder_is_uninitialized() {
        let sae = small_sae(false);
        assert!(sae.w_dec().is_none());
        let x = Tensor::randn(0.0f32, 1.0, (2, 32), &Device::Cpu).unwrap();
        assert!(sae.encode(&x).is_ok());
        assert!(matches!(
            sae.forward(&x),
            Err(SaeError::Uninitialized(_))
        ));
        assert!(matches!(
            sae.forward_onnx(&x),
            Err(SaeError::Uninitialized(_))
        ));
    }

    #[test]
    fn test_save_load_round_trip() {
        let sae = small_sae(true);
        let dir = tempfile::tempdir().unwrap();
        sae.save_to_disk(dir.path()).unwrap();

        let loaded = Sae::load_from_disk(dir.path(), &Device::Cpu, true).unwrap();
        assert_eq!(loaded.config(), sae.config());
        assert_eq!(loaded.d_in(), 32);
        assert_eq!(loaded.num_latents(), 128);

        let x = Tensor::randn(0.0f32, 1.0, (3, 32), &Device::Cpu).unwrap();
        let a: Vec<Vec<u32>> = sae.encode(&x).unwrap().top_indices.to_vec2().unwrap();
        let b: Vec<Vec<u32>> = loaded.encode(&x).unwrap().top_indices.to_vec2().unwrap();
        assert_eq!(a, b);

        let no_decoder = Sae::load_from_disk(dir.path(), &Device::Cpu, false).unwrap();
        assert!(no_decoder.w_dec().is_none());
    }

    #[test]
    fn test_half_precision_on_cpu_is_upcast() {
        let config = SaeConfig {
            expansion_factor: 4,
            k: 8,
            ..Default::default()
        };
        let sae = Sae::new(16, config, &Device::Cpu, DType::BF16, true).unwrap();
        assert_eq!(sae.dtype(), DType::F32);
        assert_eq!(sae.w_dec().unwrap().dtype(), DType::F32);

        let x = Tensor::randn(0.0f32, 1.0, (2, 16), &Device::Cpu).unwrap();
        assert_eq!(sae.forward_onnx(&x).unwrap().dims(), &[2, 16]);
        assert!(sae.forward(&x).unwrap().fvu.is_finite());
    }

    #[test]
    fn test_bf16_checkpoint_loads_on_cpu() {
        let sae = small_sae(true);
        let dir = tempfile::tempdir().unwrap();
        let file_config = SaeFileConfig {
            config: sae.config().clone(),
            d_in: sae.d_in(),
        };
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            serde_json::to_string(&file_config).unwrap(),
        )
        .unwrap();
        let bf16 = |t: &Tensor| t.to_dtype(DType::BF16).unwrap();
        let tensors: HashMap<String, Tensor> = [
            ("encoder.weight", bf16(sae.encoder_weight())),
            ("encoder.bias", bf16(sae.encoder_bias().unwrap())),
            ("W_dec", bf16(sae.w_dec().unwrap())),
            ("b_dec", bf16(sae.b_dec())),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        candle_core::safetensors::save(&tensors, dir.path().join(WEIGHTS_FILE)).unwrap();

        let loaded = Sae::load_from_disk(dir.path(), &Device::Cpu, true).unwrap();
        assert_eq!(loaded.dtype(), DType::F32);
        let x = Tensor::randn(0.0f32, 1.0, (3, 32), &Device::Cpu).unwrap();
        let out = loaded.forward_onnx(&x).unwrap();
        assert_eq!(out.dims(), &[3, 32]);
    }

    #[test]
    fn test_from_parts_rejects_bad_shapes() {
        let dev = Device::Cpu;
        let w = Tensor::zeros((16, 4), DType::F32, &dev).unwrap();
        let b = Tensor::zeros((16,), DType::F32, &dev).unwrap();
        let bad_dec = Tensor::zeros((4, 16), DType::F32, &dev).unwrap();
        let b_dec = Tensor::zeros((4,), DType::F32, &dev).unwrap();
        let config = SaeConfig {
            k: 2,
            ..Default::default()
        };
        assert!(Sae::from_parts(config.clone(), w.clone(), b.clone(), Some(bad_dec), b_dec.clone()).is_err());

        let too_many = SaeConfig { k: 17, ..config };
        assert!(Sae::from_parts(too_many, w, b, None, b_dec).is_err());
    }

    #[test]
    fn test_top_k_last_dim_hand_computed() {
        let x = Tensor::new(&[[0.1f32, 3.0, 0.0, 2.0], [5.0, 1.0, 4.0, 0.5]], &Device::Cpu).unwrap();
        let (values, indices) = top_k_last_dim(&x, 2).unwrap();
        assert_eq!(
            values.to_vec2::<f32>().unwrap(),
            vec![vec![3.0, 2.0], vec![5.0, 4.0]]
        );
        assert_eq!(
            indices.to_vec2::<u32>().unwrap(),
            vec![vec![1, 3], vec![0, 2]]
        );
        assert!(top_k_last_dim(&x, 5).is_err());
    }

    #[test]
    fn test_natural_key_orders_layers() {
        let mut hooks = vec!["layers.10", "layers.2", "layers.0.mlp", "embed"];
        hooks.sort_by_key(|h| natural_key(h));
        assert_eq!(hooks, vec!["embed", "layers.0.mlp", "layers.2", "layers.10"]);
    }

    // --- Hub tests (auto-detected prerequisites) ---------------------------

    const SAE_REPO: &str = "EleutherAI/sae-llama-3-8b-32x";
    const HOOKPOINT: &str = "layers.10";

    /// Whether the hub checkpoint is already in the local HuggingFace cache.
    /// No network access is performed.
    fn sae_files_cached() -> bool {
        let cache = hf_hub::Cache::default();
        let repo = cache.repo(Repo::new(SAE_REPO.to_string(), RepoType::Model));
        repo.get(&format!("{HOOKPOINT}/{WEIGHTS_FILE}")).is_some()
    }

    #[test]
    fn test_load_from_hub_llama3_8b() {
        if !sae_files_cached() {
            eprintln!("  SKIP test_load_from_hub_llama3_8b: SAE files not in local cache");
            return;
        }
        let sae = Sae::load_from_hub(SAE_REPO, HOOKPOINT, &Device::Cpu, true).unwrap();
        assert_eq!(sae.d_in(), 4096);
        assert_eq!(sae.num_latents(), 131_072);

        let x = Tensor::randn(0.0f32, 1.0, (1, 4096), &Device::Cpu).unwrap();
        let out = sae.forward_onnx(&x).unwrap();
        assert_eq!(out.dims(), &[1, 4096]);
    }
}
