#![forbid(unsafe_code)]

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

static NEXT_TENSOR_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    F32,
    F64,
    I64,
}

impl DType {
    #[must_use]
    pub const fn is_floating_point(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }
}

/// Process-unique identity of a tensor, used to tag diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TensorId(pub u64);

impl TensorId {
    #[must_use]
    pub fn fresh() -> Self {
        Self(NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tensor#{}", self.0)
    }
}

/// How far a tensor's shape may move away from the shape it was allocated with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShapeDynamism {
    /// Shape is fixed; only a resize to the identical shape succeeds.
    Static,
    /// Shape may change while the element count fits the allocated capacity.
    DynamicBound,
    /// Shape may change freely; storage is reallocated on growth.
    DynamicUnbound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResizeError {
    RankMismatch {
        expected: usize,
        actual: usize,
    },
    NegativeExtent {
        dim: usize,
        size: i64,
    },
    ExtentOverflow {
        dim: usize,
        size: i64,
    },
    NumelOverflow {
        sizes: Vec<i64>,
    },
    StaticShape {
        current: Vec<i32>,
        requested: Vec<i64>,
    },
    CapacityExceeded {
        needed: usize,
        capacity: usize,
    },
    AllocationFailed {
        needed: usize,
    },
}

impl fmt::Display for ResizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RankMismatch { expected, actual } => {
                write!(f, "resize rank mismatch: expected={expected}, actual={actual}")
            }
            Self::NegativeExtent { dim, size } => {
                write!(f, "negative extent at dim={dim}: size={size}")
            }
            Self::ExtentOverflow { dim, size } => {
                write!(f, "extent at dim={dim} does not fit i32: size={size}")
            }
            Self::NumelOverflow { sizes } => {
                write!(f, "element count overflow for sizes={sizes:?}")
            }
            Self::StaticShape { current, requested } => write!(
                f,
                "static tensor cannot change shape: current={current:?}, requested={requested:?}"
            ),
            Self::CapacityExceeded { needed, capacity } => write!(
                f,
                "bounded tensor capacity exceeded: needed={needed}, capacity={capacity}"
            ),
            Self::AllocationFailed { needed } => {
                write!(f, "failed to allocate storage for {needed} elements")
            }
        }
    }
}

impl std::error::Error for ResizeError {}

/// Mutable view over exactly `numel()` elements of a tensor's backing buffer.
#[derive(Debug)]
pub enum StorageMut<'a> {
    F32(&'a mut [f32]),
    F64(&'a mut [f64]),
    I64(&'a mut [i64]),
}

impl StorageMut<'_> {
    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::F32(_) => DType::F32,
            Self::F64(_) => DType::F64,
            Self::I64(_) => DType::I64,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::F32(values) => values.len(),
            Self::F64(values) => values.len(),
            Self::I64(values) => values.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The tensor capabilities a kernel is allowed to use on its output.
///
/// Tensors are owned by the runtime; kernels only query shape, request a
/// resize, and write through [`KernelTensor::mutable_storage`].
pub trait KernelTensor {
    fn id(&self) -> TensorId;

    fn dtype(&self) -> DType;

    fn sizes(&self) -> &[i32];

    fn numel(&self) -> usize;

    fn resize(&mut self, new_sizes: &[i64]) -> Result<(), ResizeError>;

    /// Returns `None` when the tensor has no addressable elements.
    fn mutable_storage(&mut self) -> Option<StorageMut<'_>>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorStorage {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I64(Vec<i64>),
}

impl TensorStorage {
    pub fn try_zeroed(dtype: DType, len: usize) -> Result<Self, ResizeError> {
        let mut storage = match dtype {
            DType::F32 => Self::F32(Vec::new()),
            DType::F64 => Self::F64(Vec::new()),
            DType::I64 => Self::I64(Vec::new()),
        };
        storage.try_grow_to(len)?;
        Ok(storage)
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::F32(_) => DType::F32,
            Self::F64(_) => DType::F64,
            Self::I64(_) => DType::I64,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::F32(values) => values.len(),
            Self::F64(values) => values.len(),
            Self::I64(values) => values.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn try_grow_to(&mut self, len: usize) -> Result<(), ResizeError> {
        match self {
            Self::F32(values) => grow_zeroed(values, len, 0.0),
            Self::F64(values) => grow_zeroed(values, len, 0.0),
            Self::I64(values) => grow_zeroed(values, len, 0),
        }
    }

    fn window_mut(&mut self, len: usize) -> StorageMut<'_> {
        match self {
            Self::F32(values) => StorageMut::F32(&mut values[..len]),
            Self::F64(values) => StorageMut::F64(&mut values[..len]),
            Self::I64(values) => StorageMut::I64(&mut values[..len]),
        }
    }

    fn fill(&mut self, value: f64) {
        match self {
            Self::F32(values) => values.fill(value as f32),
            Self::F64(values) => values.fill(value),
            Self::I64(values) => values.fill(value as i64),
        }
    }
}

// Leaves `values` untouched when the allocation cannot be made.
fn grow_zeroed<E: Copy>(values: &mut Vec<E>, len: usize, zero: E) -> Result<(), ResizeError> {
    let additional = len.saturating_sub(values.len());
    values
        .try_reserve_exact(additional)
        .map_err(|_| ResizeError::AllocationFailed { needed: len })?;
    values.resize(len, zero);
    Ok(())
}

/// Contiguous CPU tensor with an `i32` shape, the runtime-side owner of
/// kernel outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseTensor {
    id: TensorId,
    sizes: Vec<i32>,
    numel: usize,
    dynamism: ShapeDynamism,
    capacity: usize,
    storage: TensorStorage,
}

impl DenseTensor {
    pub fn zeros(
        sizes: &[i64],
        dtype: DType,
        dynamism: ShapeDynamism,
    ) -> Result<Self, ResizeError> {
        let (sizes, numel) = validate_sizes(sizes)?;
        Ok(Self {
            id: TensorId::fresh(),
            sizes,
            numel,
            dynamism,
            capacity: numel,
            storage: TensorStorage::try_zeroed(dtype, numel)?,
        })
    }

    /// Allocates a `DynamicBound` tensor whose storage holds `capacity`
    /// elements regardless of the initial shape.
    pub fn bounded(sizes: &[i64], dtype: DType, capacity: usize) -> Result<Self, ResizeError> {
        let (sizes, numel) = validate_sizes(sizes)?;
        if numel > capacity {
            return Err(ResizeError::CapacityExceeded {
                needed: numel,
                capacity,
            });
        }
        Ok(Self {
            id: TensorId::fresh(),
            sizes,
            numel,
            dynamism: ShapeDynamism::DynamicBound,
            capacity,
            storage: TensorStorage::try_zeroed(dtype, capacity)?,
        })
    }

    #[must_use]
    pub fn filled_with(mut self, value: f64) -> Self {
        self.storage.fill(value);
        self
    }

    #[must_use]
    pub fn dynamism(&self) -> ShapeDynamism {
        self.dynamism
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn storage(&self) -> &TensorStorage {
        &self.storage
    }

    #[must_use]
    pub fn shape_i64(&self) -> Vec<i64> {
        self.sizes.iter().copied().map(i64::from).collect()
    }

    #[must_use]
    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.storage {
            TensorStorage::F32(values) => Some(&values[..self.numel]),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<&[f64]> {
        match &self.storage {
            TensorStorage::F64(values) => Some(&values[..self.numel]),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<&[i64]> {
        match &self.storage {
            TensorStorage::I64(values) => Some(&values[..self.numel]),
            _ => None,
        }
    }
}

impl KernelTensor for DenseTensor {
    fn id(&self) -> TensorId {
        self.id
    }

    fn dtype(&self) -> DType {
        self.storage.dtype()
    }

    fn sizes(&self) -> &[i32] {
        &self.sizes
    }

    fn numel(&self) -> usize {
        self.numel
    }

    fn resize(&mut self, new_sizes: &[i64]) -> Result<(), ResizeError> {
        if new_sizes.len() != self.sizes.len() {
            return Err(ResizeError::RankMismatch {
                expected: self.sizes.len(),
                actual: new_sizes.len(),
            });
        }

        let (sizes, numel) = validate_sizes(new_sizes)?;
        match self.dynamism {
            ShapeDynamism::Static => {
                if sizes != self.sizes {
                    return Err(ResizeError::StaticShape {
                        current: self.sizes.clone(),
                        requested: new_sizes.to_vec(),
                    });
                }
            }
            ShapeDynamism::DynamicBound => {
                if numel > self.capacity {
                    return Err(ResizeError::CapacityExceeded {
                        needed: numel,
                        capacity: self.capacity,
                    });
                }
            }
            ShapeDynamism::DynamicUnbound => {
                if numel > self.capacity {
                    self.storage.try_grow_to(numel)?;
                    self.capacity = numel;
                }
            }
        }

        self.sizes = sizes;
        self.numel = numel;
        Ok(())
    }

    fn mutable_storage(&mut self) -> Option<StorageMut<'_>> {
        if self.numel == 0 {
            return None;
        }
        Some(self.storage.window_mut(self.numel))
    }
}

/// Narrows a requested shape to the stored `i32` form and computes its
/// element count. A rank-0 shape has one element.
pub fn validate_sizes(sizes: &[i64]) -> Result<(Vec<i32>, usize), ResizeError> {
    let mut narrow = Vec::with_capacity(sizes.len());
    let mut numel = 1usize;
    for (dim, size) in sizes.iter().copied().enumerate() {
        if size < 0 {
            return Err(ResizeError::NegativeExtent { dim, size });
        }
        let extent = i32::try_from(size).map_err(|_| ResizeError::ExtentOverflow { dim, size })?;
        numel = usize::try_from(extent)
            .ok()
            .and_then(|extent| numel.checked_mul(extent))
            .ok_or_else(|| ResizeError::NumelOverflow {
                sizes: sizes.to_vec(),
            })?;
        narrow.push(extent);
    }
    Ok((narrow, numel))
}
