//! Compute backend contract
//!
//! The network never touches device memory directly. It talks to a [`Platform`]
//! to enumerate devices and create an [`Accelerator`], a context bound to exactly
//! one device that owns buffers and dispatches data-parallel kernels.
//!
//! All matrices are row-major `f32`. Kernels operate on the leading `len`
//! (or `rows × cols`) elements of a buffer, so buffers sized for a full batch
//! can serve the final partial batch as well.
//!
//! # Example
//!
//! ```
//! use digit_recognition::backend::{Accelerator, CpuPlatform, Platform};
//!
//! let platform = CpuPlatform::new();
//! let device = platform.devices().remove(0);
//! let mut acc = platform.create_accelerator(&device).unwrap();
//!
//! let mut buf = acc.alloc(3).unwrap();
//! acc.upload(&mut buf, &[1.0, 2.0, 3.0]).unwrap();
//! let mut out = [0.0f32; 3];
//! acc.download(&buf, &mut out).unwrap();
//! assert_eq!(out, [1.0, 2.0, 3.0]);
//! ```

pub mod cpu;

pub use cpu::{CpuAccelerator, CpuBuffer, CpuPlatform};

use crate::error::Result;

/// Description of a device a [`Platform`] can bind an accelerator to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Index within the platform's device list.
    pub id: usize,
    pub name: String,
    /// Number of parallel lanes the device executes kernels on.
    pub lanes: usize,
}

/// Shape and scaling of a GEMM dispatch: `c = alpha·op(a)·op(b) + beta·c`.
///
/// `op(a)` is `m × k` and `op(b)` is `k × n`; the stored matrices are the
/// transposes when the corresponding flag is set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GemmShape {
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub transpose_a: bool,
    pub transpose_b: bool,
    pub alpha: f32,
    pub beta: f32,
}

impl GemmShape {
    /// Plain product `c = a·b`.
    pub fn new(m: usize, n: usize, k: usize) -> Self {
        Self {
            m,
            n,
            k,
            transpose_a: false,
            transpose_b: false,
            alpha: 1.0,
            beta: 0.0,
        }
    }

    pub fn transpose_a(mut self) -> Self {
        self.transpose_a = true;
        self
    }

    pub fn transpose_b(mut self) -> Self {
        self.transpose_b = true;
        self
    }

    pub fn alpha(mut self, alpha: f32) -> Self {
        self.alpha = alpha;
        self
    }

    /// Elements of `a` the shape reads.
    pub fn a_len(&self) -> usize {
        self.m * self.k
    }

    /// Elements of `b` the shape reads.
    pub fn b_len(&self) -> usize {
        self.k * self.n
    }

    /// Elements of `c` the shape writes.
    pub fn c_len(&self) -> usize {
        self.m * self.n
    }
}

/// Enumerates devices and creates accelerator contexts on them.
pub trait Platform {
    type Accelerator: Accelerator;

    fn devices(&self) -> Vec<DeviceInfo>;

    /// Create a context bound to `device`.
    fn create_accelerator(&self, device: &DeviceInfo) -> Result<Self::Accelerator>;
}

/// A live compute context bound to one device.
///
/// Every method fails with [`NetworkError::AcceleratorLost`] once the device is
/// gone. Buffers are released when dropped. Kernels may run asynchronously;
/// [`Accelerator::synchronize`] waits for completion and reports any failure.
///
/// [`NetworkError::AcceleratorLost`]: crate::error::NetworkError::AcceleratorLost
pub trait Accelerator: Send {
    type Buffer: Send;

    fn device(&self) -> &DeviceInfo;

    /// Allocate a zero-filled buffer of `len` floats.
    fn alloc(&mut self, len: usize) -> Result<Self::Buffer>;

    /// Copy `src` into the leading elements of `dst`.
    fn upload(&mut self, dst: &mut Self::Buffer, src: &[f32]) -> Result<()>;

    /// Copy the leading `dst.len()` elements of `src` to the host.
    fn download(&mut self, src: &Self::Buffer, dst: &mut [f32]) -> Result<()>;

    fn gemm(
        &mut self,
        shape: GemmShape,
        a: &Self::Buffer,
        b: &Self::Buffer,
        c: &mut Self::Buffer,
    ) -> Result<()>;

    /// `out[r][c] += bias[c]` for every row.
    fn add_row_bias(
        &mut self,
        out: &mut Self::Buffer,
        bias: &Self::Buffer,
        rows: usize,
        cols: usize,
    ) -> Result<()>;

    /// `dst[i] = sigmoid(src[i])`.
    fn sigmoid(&mut self, src: &Self::Buffer, dst: &mut Self::Buffer, len: usize) -> Result<()>;

    /// Row-wise softmax of `src` into `dst`.
    fn softmax_rows(
        &mut self,
        src: &Self::Buffer,
        dst: &mut Self::Buffer,
        rows: usize,
        cols: usize,
    ) -> Result<()>;

    /// `dst[i] = a[i] - b[i]`.
    fn sub(
        &mut self,
        a: &Self::Buffer,
        b: &Self::Buffer,
        dst: &mut Self::Buffer,
        len: usize,
    ) -> Result<()>;

    /// `delta[i] *= a[i]·(1 - a[i])`, where `activation` holds sigmoid outputs.
    fn sigmoid_backward(
        &mut self,
        delta: &mut Self::Buffer,
        activation: &Self::Buffer,
        len: usize,
    ) -> Result<()>;

    /// `dst[c] = alpha·Σ_r src[r][c]`.
    fn column_sums(
        &mut self,
        src: &Self::Buffer,
        dst: &mut Self::Buffer,
        rows: usize,
        cols: usize,
        alpha: f32,
    ) -> Result<()>;

    /// `dst[i] = a[i] + b[i]`.
    fn add(
        &mut self,
        a: &Self::Buffer,
        b: &Self::Buffer,
        dst: &mut Self::Buffer,
        len: usize,
    ) -> Result<()>;

    /// Wait for all dispatched work and surface any device failure.
    fn synchronize(&mut self) -> Result<()>;
}
