//! Sparse top-k decode with eager and fused strategies
//!
//! A top-k SAE keeps, for every input row, only the `k` largest latent
//! activations and their indices. Decoding reconstructs the dense output:
//!
//! ```text
//! latents[..., i]  = top_acts[..., j]   where top_indices[..., j] == i, else 0
//! out              = latents @ W_dec + b_dec          (..., D_out) -> (..., D_in)
//! ```
//!
//! Two strategies compute the same result:
//!
//! - **Eager**: scatters into a zero buffer of shape `(..., D_out)` and runs a
//!   dense matmul. Always available.
//! - **Fused** (feature `fused-decode`): gathers the `k` selected rows of
//!   `W_dec` per input row and contracts them with `top_acts` directly, never
//!   building the `(..., D_out)` buffer.
//!
//! The strategy is chosen once, either explicitly via [`DecoderConfig`] or
//! process-wide through [`default_strategy`], and injected where decode runs.
//!
//! # Duplicate indices
//!
//! If a row repeats an index, both strategies add the repeated
//! contributions (the eager buffer is filled with `scatter_add`, the fused
//! path sums gathered rows). Top-k selection never produces duplicates, so
//! this only matters for hand-built activation records. The exported ONNX
//! graph scatters with `ScatterElements`, which overwrites instead of
//! summing, so the two disagree for such records.
//!
//! # Index width
//!
//! Eager casts indices to I64; fused casts them to U32 for `index_select`.
//! Both casts are exact for indices below 2^31. Larger or negative indices
//! on the fused path are not checked and give wrong rows.

use std::sync::LazyLock;

use candle_core::{DType, Tensor, D};
use tracing::info;

use crate::error::{Result, SaeError};

/// Environment variable that forces the eager strategy when set to `"1"`.
pub const DISABLE_FUSED_ENV: &str = "SAE_DISABLE_FUSED";

/// Older name of [`DISABLE_FUSED_ENV`], still honored.
pub const LEGACY_DISABLE_ENV: &str = "SAE_DISABLE_TRITON";

/// Explicit decoder configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderConfig {
    /// Use the eager strategy even when the fused one is compiled in.
    pub prefer_portable: bool,
}

impl DecoderConfig {
    /// Read the override from [`DISABLE_FUSED_ENV`] or [`LEGACY_DISABLE_ENV`].
    pub fn from_env() -> Self {
        Self::from_env_values(
            std::env::var(DISABLE_FUSED_ENV).ok().as_deref(),
            std::env::var(LEGACY_DISABLE_ENV).ok().as_deref(),
        )
    }

    /// Either variable set to `"1"` disables the fused strategy.
    pub fn from_env_values(current: Option<&str>, legacy: Option<&str>) -> Self {
        let config = Self::from_env_value(current);
        if config.prefer_portable {
            return config;
        }
        let legacy_config = Self::from_env_value(legacy);
        if legacy_config.prefer_portable {
            info!("{LEGACY_DISABLE_ENV} is deprecated, use {DISABLE_FUSED_ENV}");
        }
        legacy_config
    }

    /// Interpret a raw value of [`DISABLE_FUSED_ENV`]. Only the literal `"1"`
    /// disables the fused strategy.
    pub fn from_env_value(value: Option<&str>) -> Self {
        Self {
            prefer_portable: value == Some("1"),
        }
    }
}

/// Something that turns an activation record into `activations @ w_dec`.
///
/// Bias is applied by [`decode`], not by implementors.
pub trait SparseDecode {
    fn decode_sparse(&self, top_indices: &Tensor, top_acts: &Tensor, w_dec: &Tensor)
        -> Result<Tensor>;
}

/// Which decode implementation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStrategy {
    /// Scatter into a dense buffer, then matmul.
    Eager,
    /// Gather selected decoder rows and contract them directly.
    #[cfg(feature = "fused-decode")]
    Fused,
}

impl DecodeStrategy {
    /// Pick a strategy. Never fails: when the fused path is unavailable or
    /// disabled it falls back to [`DecodeStrategy::Eager`] and says so.
    pub fn select(config: &DecoderConfig) -> Self {
        #[cfg(feature = "fused-decode")]
        {
            if config.prefer_portable {
                info!("Fused decode disabled, using eager implementation of SAE decoder");
                Self::Eager
            } else {
                Self::Fused
            }
        }
        #[cfg(not(feature = "fused-decode"))]
        {
            let _ = config;
            info!("Fused decode not compiled in, using eager implementation of SAE decoder");
            Self::Eager
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Eager => "eager",
            #[cfg(feature = "fused-decode")]
            Self::Fused => "fused",
        }
    }
}

impl std::fmt::Display for DecodeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl SparseDecode for DecodeStrategy {
    fn decode_sparse(
        &self,
        top_indices: &Tensor,
        top_acts: &Tensor,
        w_dec: &Tensor,
    ) -> Result<Tensor> {
        match self {
            Self::Eager => eager_decode(top_indices, top_acts, w_dec),
            #[cfg(feature = "fused-decode")]
            Self::Fused => fused_decode(top_indices, top_acts, w_dec),
        }
    }
}

static DEFAULT_STRATEGY: LazyLock<DecodeStrategy> =
    LazyLock::new(|| DecodeStrategy::select(&DecoderConfig::from_env()));

/// Process-wide strategy, selected from the environment on first use.
pub fn default_strategy() -> DecodeStrategy {
    *DEFAULT_STRATEGY
}

/// Decode an activation record and add the bias.
///
/// `w` is the decoder weight `[D_out, D_in]`; `None` means it was never
/// loaded and fails with [`SaeError::Uninitialized`] before any work.
/// `top_acts` is cast to `w`'s dtype.
pub fn decode<F: SparseDecode + ?Sized>(
    f_dec: &F,
    w: Option<&Tensor>,
    b: &Tensor,
    top_acts: &Tensor,
    top_indices: &Tensor,
) -> Result<Tensor> {
    let w = w.ok_or(SaeError::Uninitialized("Decoder weight"))?;
    let top_acts = top_acts.to_dtype(w.dtype())?;
    let y = f_dec.decode_sparse(top_indices, &top_acts, w)?;
    Ok(y.broadcast_add(&b.to_dtype(y.dtype())?)?)
}

/// Eager decode: scatter into `(..., D_out)` zeros, then multiply by `w_dec`.
///
/// Duplicate indices within a row are summed.
pub fn eager_decode(top_indices: &Tensor, top_acts: &Tensor, w_dec: &Tensor) -> Result<Tensor> {
    let (lead, _k) = check_record(top_indices, top_acts)?;
    let (d_out, _d_in) = w_dec.dims2()?;

    let top_indices = top_indices.to_dtype(DType::I64)?.contiguous()?;
    let top_acts = top_acts.contiguous()?;

    let mut buf_shape = lead.clone();
    buf_shape.push(d_out);
    let buf = Tensor::zeros(buf_shape, top_acts.dtype(), top_acts.device())?;
    let latents = buf.scatter_add(&top_indices, &top_acts, D::Minus1)?;

    matmul_rows(&latents, &lead, w_dec)
}

/// Fused decode: `out[r] = Σ_j top_acts[r, j] * w_dec[top_indices[r, j]]`.
///
/// Indices are cast to U32; see the module docs for the valid range.
#[cfg(feature = "fused-decode")]
pub fn fused_decode(top_indices: &Tensor, top_acts: &Tensor, w_dec: &Tensor) -> Result<Tensor> {
    let (lead, k) = check_record(top_indices, top_acts)?;
    let (_d_out, d_in) = w_dec.dims2()?;
    let n_rows: usize = lead.iter().product();

    let flat_indices = top_indices.to_dtype(DType::U32)?.flatten_all()?;
    // [n_rows * k, d_in] -> [n_rows, k, d_in]
    let rows = w_dec
        .index_select(&flat_indices, 0)?
        .reshape((n_rows, k, d_in))?;
    let acts = top_acts.reshape((n_rows, 1, k))?;

    let y = acts.matmul(&rows)?; // [n_rows, 1, d_in]
    let mut out_shape = lead;
    out_shape.push(d_in);
    Ok(y.reshape(out_shape)?)
}

/// Validate that indices and values are co-indexed. Returns `(lead, k)`.
fn check_record(top_indices: &Tensor, top_acts: &Tensor) -> Result<(Vec<usize>, usize)> {
    if top_indices.dims() != top_acts.dims() {
        return Err(SaeError::InvalidConfig(format!(
            "top_indices shape {:?} does not match top_acts shape {:?}",
            top_indices.dims(),
            top_acts.dims()
        )));
    }
    match top_acts.dims().split_last() {
        Some((&k, lead)) => Ok((lead.to_vec(), k)),
        None => Err(SaeError::InvalidConfig(
            "activation record must have at least one dimension".to_string(),
        )),
    }
}

/// `(lead..., K) @ [K, N] -> (lead..., N)` by flattening the leading dims.
fn matmul_rows(x: &Tensor, lead: &[usize], w: &Tensor) -> Result<Tensor> {
    let (k, n) = w.dims2()?;
    let n_rows: usize = lead.iter().product();
    let y = x.reshape((n_rows, k))?.matmul(w)?;
    let mut out_shape = lead.to_vec();
    out_shape.push(n);
    Ok(y.reshape(out_shape)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::cell::Cell;

    /// Random activation record with unique indices per row.
    fn random_record(
        rng: &mut StdRng,
        lead: &[usize],
        k: usize,
        d_out: usize,
    ) -> (Tensor, Tensor) {
        let n_rows: usize = lead.iter().product();
        let mut indices: Vec<u32> = Vec::with_capacity(n_rows * k);
        let mut acts: Vec<f32> = Vec::with_capacity(n_rows * k);
        for _ in 0..n_rows {
            let row = rand::seq::index::sample(rng, d_out, k);
            indices.extend(row.iter().map(|i| i as u32));
            acts.extend((0..k).map(|_| rng.gen_range(0.0f32..4.0)));
        }
        let mut shape = lead.to_vec();
        shape.push(k);
        let indices = Tensor::from_vec(indices, shape.as_slice(), &Device::Cpu).unwrap();
        let acts = Tensor::from_vec(acts, shape.as_slice(), &Device::Cpu).unwrap();
        (indices, acts)
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    fn small_decoder() -> (Tensor, Tensor) {
        // d_out = 4, d_in = 2
        let w = Tensor::new(
            &[[1.0f32, 0.0], [0.0, 1.0], [1.0, 1.0], [2.0, -1.0]],
            &Device::Cpu,
        )
        .unwrap();
        let b = Tensor::new(&[1.0f32, 1.0], &Device::Cpu).unwrap();
        (w, b)
    }

    #[test]
    fn test_env_override_only_accepts_literal_one() {
        assert!(DecoderConfig::from_env_value(Some("1")).prefer_portable);
        assert!(!DecoderConfig::from_env_value(Some("0")).prefer_portable);
        assert!(!DecoderConfig::from_env_value(Some("true")).prefer_portable);
        assert!(!DecoderConfig::from_env_value(Some("")).prefer_portable);
        assert!(!DecoderConfig::from_env_value(None).prefer_portable);
    }

    #[test]
    fn test_legacy_env_name_still_disables_fused() {
        assert!(DecoderConfig::from_env_values(None, Some("1")).prefer_portable);
        assert!(DecoderConfig::from_env_values(Some("1"), None).prefer_portable);
        assert!(DecoderConfig::from_env_values(Some("0"), Some("1")).prefer_portable);
        assert!(!DecoderConfig::from_env_values(Some("0"), Some("yes")).prefer_portable);
        assert!(!DecoderConfig::from_env_values(None, None).prefer_portable);
    }

    #[test]
    fn test_prefer_portable_selects_eager() {
        let config = DecoderConfig {
            prefer_portable: true,
        };
        assert_eq!(DecodeStrategy::select(&config), DecodeStrategy::Eager);
    }

    #[cfg(feature = "fused-decode")]
    #[test]
    fn test_default_config_selects_fused() {
        assert_eq!(
            DecodeStrategy::select(&DecoderConfig::default()),
            DecodeStrategy::Fused
        );
    }

    #[test]
    fn test_eager_decode_hand_computed() {
        let (w, b) = small_decoder();
        let indices = Tensor::new(&[[2u32, 3]], &Device::Cpu).unwrap();
        let acts = Tensor::new(&[[0.5f32, 2.0]], &Device::Cpu).unwrap();

        let out = decode(&DecodeStrategy::Eager, Some(&w), &b, &acts, &indices).unwrap();
        // 0.5 * [1, 1] + 2 * [2, -1] + [1, 1]
        assert_eq!(out.to_vec2::<f32>().unwrap(), vec![vec![5.5, -0.5]]);
    }

    #[cfg(feature = "fused-decode")]
    #[test]
    fn test_fused_decode_hand_computed() {
        let (w, b) = small_decoder();
        let indices = Tensor::new(&[[2u32, 3], [0, 1]], &Device::Cpu).unwrap();
        let acts = Tensor::new(&[[0.5f32, 2.0], [3.0, -1.0]], &Device::Cpu).unwrap();

        let out = decode(&DecodeStrategy::Fused, Some(&w), &b, &acts, &indices).unwrap();
        assert_eq!(
            out.to_vec2::<f32>().unwrap(),
            vec![vec![5.5, -0.5], vec![4.0, 0.0]]
        );
    }

    #[cfg(feature = "fused-decode")]
    #[test]
    fn test_eager_and_fused_agree() {
        let mut rng = StdRng::seed_from_u64(42);
        let (d_out, d_in, k) = (512, 64, 16);
        let w = Tensor::randn(0.0f32, 1.0, (d_out, d_in), &Device::Cpu).unwrap();
        let b = Tensor::randn(0.0f32, 1.0, (d_in,), &Device::Cpu).unwrap();
        let (indices, acts) = random_record(&mut rng, &[8], k, d_out);

        let eager = decode(&DecodeStrategy::Eager, Some(&w), &b, &acts, &indices).unwrap();
        let fused = decode(&DecodeStrategy::Fused, Some(&w), &b, &acts, &indices).unwrap();

        assert_eq!(eager.dims(), &[8, d_in]);
        let diff = max_abs_diff(&eager, &fused);
        assert!(diff < 1e-3, "eager/fused max abs diff {diff}");
    }

    #[test]
    fn test_output_shape_follows_leading_dims() {
        let mut rng = StdRng::seed_from_u64(7);
        let (d_out, d_in, k) = (64, 12, 4);
        let w = Tensor::randn(0.0f32, 1.0, (d_out, d_in), &Device::Cpu).unwrap();
        let b = Tensor::zeros((d_in,), DType::F32, &Device::Cpu).unwrap();

        let (indices, acts) = random_record(&mut rng, &[2, 3], k, d_out);
        let strategy = DecodeStrategy::select(&DecoderConfig::default());
        let out = decode(&strategy, Some(&w), &b, &acts, &indices).unwrap();
        assert_eq!(out.dims(), &[2, 3, d_in]);

        // A bare (k,) record decodes to (d_in,)
        let (indices, acts) = random_record(&mut rng, &[], k, d_out);
        let out = decode(&DecodeStrategy::Eager, Some(&w), &b, &acts, &indices).unwrap();
        assert_eq!(out.dims(), &[d_in]);
    }

    #[test]
    fn test_i64_indices_accepted() {
        let (w, b) = small_decoder();
        let indices = Tensor::new(&[[2i64, 3]], &Device::Cpu).unwrap();
        let acts = Tensor::new(&[[0.5f32, 2.0]], &Device::Cpu).unwrap();
        let strategy = DecodeStrategy::select(&DecoderConfig::default());
        let out = decode(&strategy, Some(&w), &b, &acts, &indices).unwrap();
        assert_eq!(out.to_vec2::<f32>().unwrap(), vec![vec![5.5, -0.5]]);
    }

    #[test]
    fn test_duplicate_indices_accumulate() {
        let (w, b) = small_decoder();
        let indices = Tensor::new(&[[1u32, 1]], &Device::Cpu).unwrap();
        let acts = Tensor::new(&[[2.0f32, 3.0]], &Device::Cpu).unwrap();

        let eager = decode(&DecodeStrategy::Eager, Some(&w), &b, &acts, &indices).unwrap();
        assert_eq!(eager.to_vec2::<f32>().unwrap(), vec![vec![1.0, 6.0]]);

        #[cfg(feature = "fused-decode")]
        {
            let fused = decode(&DecodeStrategy::Fused, Some(&w), &b, &acts, &indices).unwrap();
            assert_eq!(fused.to_vec2::<f32>().unwrap(), vec![vec![1.0, 6.0]]);
        }
    }

    /// Counts calls so tests can see whether decode reached the strategy.
    struct CountingDecoder {
        calls: Cell<usize>,
    }

    impl SparseDecode for CountingDecoder {
        fn decode_sparse(
            &self,
            top_indices: &Tensor,
            top_acts: &Tensor,
            w_dec: &Tensor,
        ) -> Result<Tensor> {
            self.calls.set(self.calls.get() + 1);
            eager_decode(top_indices, top_acts, w_dec)
        }
    }

    #[test]
    fn test_uninitialized_weight_fails_before_decoding() {
        let mock = CountingDecoder {
            calls: Cell::new(0),
        };
        let b = Tensor::zeros((2,), DType::F32, &Device::Cpu).unwrap();
        let indices = Tensor::new(&[[0u32]], &Device::Cpu).unwrap();
        let acts = Tensor::new(&[[1.0f32]], &Device::Cpu).unwrap();

        let err = decode(&mock, None, &b, &acts, &indices).unwrap_err();
        assert!(matches!(err, SaeError::Uninitialized(_)), "got {err:?}");
        assert_eq!(mock.calls.get(), 0);

        let (w, _) = small_decoder();
        decode(&mock, Some(&w), &b, &acts, &indices).unwrap();
        assert_eq!(mock.calls.get(), 1);
    }

    #[test]
    fn test_mismatched_record_rejected() {
        let (w, _) = small_decoder();
        let indices = Tensor::new(&[[0u32, 1]], &Device::Cpu).unwrap();
        let acts = Tensor::new(&[[1.0f32]], &Device::Cpu).unwrap();
        let err = eager_decode(&indices, &acts, &w).unwrap_err();
        assert!(matches!(err, SaeError::InvalidConfig(_)));
    }
}
