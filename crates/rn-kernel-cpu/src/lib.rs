#![forbid(unsafe_code)]

use std::fmt;

use log::{debug, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use rn_core::{DType, KernelTensor, ResizeError, StorageMut, TensorId};
use rn_runtime::{EvidenceKind, RuntimeContext, SeedPolicy};

pub const RANDN_OUT: &str = "randn.out";

/// Runtime-level classification of a kernel failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    ResizeFailed {
        tensor: TensorId,
        source: ResizeError,
    },
    ShapeMismatch {
        tensor: TensorId,
        requested: Vec<i64>,
        actual: Vec<i32>,
    },
    UnsupportedDType {
        tensor: TensorId,
        dtype: DType,
    },
}

impl KernelError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ResizeFailed { .. }
            | Self::ShapeMismatch { .. }
            | Self::UnsupportedDType { .. } => ErrorKind::InvalidArgument,
        }
    }

    #[must_use]
    pub fn tensor(&self) -> TensorId {
        match self {
            Self::ResizeFailed { tensor, .. }
            | Self::ShapeMismatch { tensor, .. }
            | Self::UnsupportedDType { tensor, .. } => *tensor,
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResizeFailed { tensor, source } => {
                write!(f, "failed to resize output tensor {tensor}: {source}")
            }
            Self::ShapeMismatch {
                tensor,
                requested,
                actual,
            } => write!(
                f,
                "output tensor {tensor} shape mismatch after resize: requested={requested:?}, actual={actual:?}"
            ),
            Self::UnsupportedDType { tensor, dtype } => {
                write!(f, "output tensor {tensor} has non-floating dtype {dtype:?}")
            }
        }
    }
}

impl std::error::Error for KernelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ResizeFailed { source, .. } => Some(source),
            Self::ShapeMismatch { .. } | Self::UnsupportedDType { .. } => None,
        }
    }
}

/// Compares a requested shape against a stored one, widening the stored
/// extents. Any length or value difference is a mismatch.
#[must_use]
pub fn check_sizes(requested: &[i64], actual: &[i32]) -> bool {
    requested.len() == actual.len()
        && requested
            .iter()
            .zip(actual.iter())
            .all(|(wide, narrow)| *wide == i64::from(*narrow))
}

fn resize_and_check<T>(size: &[i64], out: &mut T) -> Result<(), KernelError>
where
    T: KernelTensor + ?Sized,
{
    let tensor = out.id();
    out.resize(size)
        .map_err(|source| KernelError::ResizeFailed { tensor, source })?;

    if !check_sizes(size, out.sizes()) {
        return Err(KernelError::ShapeMismatch {
            tensor,
            requested: size.to_vec(),
            actual: out.sizes().to_vec(),
        });
    }

    let dtype = out.dtype();
    if !dtype.is_floating_point() {
        return Err(KernelError::UnsupportedDType { tensor, dtype });
    }
    Ok(())
}

fn sample_into<F, R>(values: &mut [F], rng: &mut R) -> usize
where
    StandardNormal: Distribution<F>,
    R: Rng + ?Sized,
{
    for value in values.iter_mut() {
        *value = StandardNormal.sample(rng);
    }
    values.len()
}

/// Resizes `out` to `size`, then overwrites every element with an
/// independent standard-normal sample drawn from `rng` in linear order.
///
/// Returns the number of elements written. Nothing is written unless the
/// resize succeeded and the resulting shape equals `size` exactly.
pub fn fill_randn<T, R>(size: &[i64], out: &mut T, rng: &mut R) -> Result<usize, KernelError>
where
    T: KernelTensor + ?Sized,
    R: Rng + ?Sized,
{
    resize_and_check(size, out)?;

    let tensor = out.id();
    let numel = out.numel();
    let Some(storage) = out.mutable_storage() else {
        return Ok(0);
    };

    debug_assert_eq!(
        storage.len(),
        numel,
        "storage view of {tensor} must cover exactly numel() elements"
    );

    match storage {
        StorageMut::F32(values) => Ok(sample_into(values, rng)),
        StorageMut::F64(values) => Ok(sample_into(values, rng)),
        StorageMut::I64(_) => Err(KernelError::UnsupportedDType {
            tensor,
            dtype: DType::I64,
        }),
    }
}

#[must_use]
pub fn generator_for(policy: SeedPolicy) -> StdRng {
    match policy {
        SeedPolicy::Entropy => StdRng::from_entropy(),
        SeedPolicy::Fixed(seed) => StdRng::seed_from_u64(seed),
    }
}

/// `randn.out(SymInt[] size, *, Tensor(a!) out) -> Tensor(a!)`
///
/// The generator lives for this call only. Failures are recorded in the
/// context's ledger, tagged with the output tensor, before being returned.
pub fn randn_out<'a, T>(
    ctx: &mut RuntimeContext,
    size: &[i64],
    out: &'a mut T,
) -> Result<&'a mut T, KernelError>
where
    T: KernelTensor + ?Sized,
{
    let mut rng = generator_for(ctx.seed_policy());
    match fill_randn(size, out, &mut rng) {
        Ok(written) => {
            let tensor = out.id();
            debug!("{RANDN_OUT}: filled {written} elements of {tensor} with shape {size:?}");
            ctx.ledger_mut().record_for(
                EvidenceKind::Kernel,
                tensor,
                format!("{RANDN_OUT} filled {written} elements"),
            );
            Ok(out)
        }
        Err(error) => {
            warn!("{RANDN_OUT}: {error}");
            ctx.record_kernel_failure(RANDN_OUT, error.tensor(), &error);
            Err(error)
        }
    }
}
