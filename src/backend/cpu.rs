//! CPU implementation of the compute backend
//!
//! Each CPU "device" is a dedicated rayon thread pool whose threads are the
//! device's lanes. Kernels split their output across lanes (one row, column or
//! element per task), mirroring how a GPU kernel assigns one thread per output
//! cell.
//!
//! The platform tracks, per device, the bytes held by live buffers and the
//! number of live contexts, and it can simulate a device disappearing. Those
//! hooks make resource release and `AcceleratorLost` handling observable.

use super::{Accelerator, DeviceInfo, GemmShape, Platform};
use crate::error::{NetworkError, Result};
use crate::utils::{sigmoid, sigmoid_derivative, softmax_into};
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

const UNLIMITED: i64 = -1;

#[derive(Debug)]
struct DeviceState {
    lost: AtomicBool,
    bytes_in_use: AtomicUsize,
    bytes_downloaded: AtomicUsize,
    live_contexts: AtomicUsize,
    /// Kernel dispatches left before the device fails; negative means unlimited.
    dispatch_budget: AtomicI64,
}

impl DeviceState {
    fn new() -> Self {
        Self {
            lost: AtomicBool::new(false),
            bytes_in_use: AtomicUsize::new(0),
            bytes_downloaded: AtomicUsize::new(0),
            live_contexts: AtomicUsize::new(0),
            dispatch_budget: AtomicI64::new(UNLIMITED),
        }
    }
}

/// Platform exposing one or more thread-pool devices.
#[derive(Debug)]
pub struct CpuPlatform {
    devices: Vec<(DeviceInfo, Arc<DeviceState>)>,
}

impl Default for CpuPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuPlatform {
    /// A single device using every available core.
    pub fn new() -> Self {
        let lanes = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::with_lanes(&[lanes])
    }

    /// One device per entry, each with the given number of lanes.
    pub fn with_lanes(lanes: &[usize]) -> Self {
        let devices = lanes
            .iter()
            .enumerate()
            .map(|(id, &lanes)| {
                let lanes = lanes.max(1);
                let info = DeviceInfo {
                    id,
                    name: format!("cpu{} ({} lanes)", id, lanes),
                    lanes,
                };
                (info, Arc::new(DeviceState::new()))
            })
            .collect();
        Self { devices }
    }

    fn state(&self, device: &DeviceInfo) -> Result<&Arc<DeviceState>> {
        self.devices
            .iter()
            .find(|(info, _)| info.id == device.id)
            .map(|(_, state)| state)
            .ok_or_else(|| NetworkError::AcceleratorLost {
                device: device.name.clone(),
            })
    }

    /// Simulate the device being unplugged: every context on it fails from now on.
    pub fn remove_device(&self, device: &DeviceInfo) {
        if let Ok(state) = self.state(device) {
            state.lost.store(true, Ordering::SeqCst);
        }
    }

    /// Let `dispatches` more kernels succeed on `device`, then lose it.
    pub fn fail_after_dispatches(&self, device: &DeviceInfo, dispatches: u32) {
        if let Ok(state) = self.state(device) {
            state
                .dispatch_budget
                .store(i64::from(dispatches), Ordering::SeqCst);
        }
    }

    /// Bytes currently held by buffers allocated on `device`.
    pub fn memory_in_use(&self, device: &DeviceInfo) -> usize {
        self.state(device)
            .map(|s| s.bytes_in_use.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Bytes copied from `device` to the host since the platform was created.
    pub fn bytes_downloaded(&self, device: &DeviceInfo) -> usize {
        self.state(device)
            .map(|s| s.bytes_downloaded.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Accelerator contexts currently alive on `device`.
    pub fn live_contexts(&self, device: &DeviceInfo) -> usize {
        self.state(device)
            .map(|s| s.live_contexts.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

impl Platform for CpuPlatform {
    type Accelerator = CpuAccelerator;

    fn devices(&self) -> Vec<DeviceInfo> {
        self.devices.iter().map(|(info, _)| info.clone()).collect()
    }

    fn create_accelerator(&self, device: &DeviceInfo) -> Result<CpuAccelerator> {
        let state = Arc::clone(self.state(device)?);
        if state.lost.load(Ordering::SeqCst) {
            return Err(NetworkError::AcceleratorLost {
                device: device.name.clone(),
            });
        }

        let id = device.id;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(device.lanes)
            .thread_name(move |lane| format!("cpu{}-lane{}", id, lane))
            .build()
            .map_err(|err| NetworkError::AcceleratorLost {
                device: format!("{}: {}", device.name, err),
            })?;

        state.live_contexts.fetch_add(1, Ordering::SeqCst);
        log::debug!("created accelerator on {}", device.name);
        Ok(CpuAccelerator {
            device: device.clone(),
            state,
            pool,
        })
    }
}

/// Host memory standing in for device memory.
#[derive(Debug)]
pub struct CpuBuffer {
    data: Vec<f32>,
    state: Arc<DeviceState>,
}

impl CpuBuffer {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Drop for CpuBuffer {
    fn drop(&mut self) {
        self.state
            .bytes_in_use
            .fetch_sub(self.data.len() * std::mem::size_of::<f32>(), Ordering::SeqCst);
    }
}

/// Context on one CPU device.
pub struct CpuAccelerator {
    device: DeviceInfo,
    state: Arc<DeviceState>,
    pool: rayon::ThreadPool,
}

impl Drop for CpuAccelerator {
    fn drop(&mut self) {
        self.state.live_contexts.fetch_sub(1, Ordering::SeqCst);
        log::debug!("released accelerator on {}", self.device.name);
    }
}

fn ensure_len(context: &'static str, buffer: &CpuBuffer, needed: usize) -> Result<()> {
    if buffer.data.len() < needed {
        return Err(NetworkError::dimension(context, needed, buffer.data.len()));
    }
    Ok(())
}

impl CpuAccelerator {
    fn check(&self) -> Result<()> {
        if self.state.lost.load(Ordering::SeqCst) {
            return Err(NetworkError::AcceleratorLost {
                device: self.device.name.clone(),
            });
        }
        Ok(())
    }

    /// Validate the context before a kernel launch and charge the dispatch budget.
    fn dispatch(&self) -> Result<()> {
        self.check()?;
        let budget = self.state.dispatch_budget.load(Ordering::SeqCst);
        if budget == 0 {
            self.state.lost.store(true, Ordering::SeqCst);
            return self.check();
        }
        if budget > 0 {
            self.state.dispatch_budget.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Accelerator for CpuAccelerator {
    type Buffer = CpuBuffer;

    fn device(&self) -> &DeviceInfo {
        &self.device
    }

    fn alloc(&mut self, len: usize) -> Result<CpuBuffer> {
        self.check()?;
        self.state
            .bytes_in_use
            .fetch_add(len * std::mem::size_of::<f32>(), Ordering::SeqCst);
        Ok(CpuBuffer {
            data: vec![0.0f32; len],
            state: Arc::clone(&self.state),
        })
    }

    fn upload(&mut self, dst: &mut CpuBuffer, src: &[f32]) -> Result<()> {
        self.check()?;
        ensure_len("upload", dst, src.len())?;
        dst.data[..src.len()].copy_from_slice(src);
        Ok(())
    }

    fn download(&mut self, src: &CpuBuffer, dst: &mut [f32]) -> Result<()> {
        self.check()?;
        ensure_len("download", src, dst.len())?;
        dst.copy_from_slice(&src.data[..dst.len()]);
        self.state
            .bytes_downloaded
            .fetch_add(std::mem::size_of_val(dst), Ordering::SeqCst);
        Ok(())
    }

    fn gemm(
        &mut self,
        shape: GemmShape,
        a: &CpuBuffer,
        b: &CpuBuffer,
        c: &mut CpuBuffer,
    ) -> Result<()> {
        self.dispatch()?;
        ensure_len("gemm operand a", a, shape.a_len())?;
        ensure_len("gemm operand b", b, shape.b_len())?;
        ensure_len("gemm result", c, shape.c_len())?;
        if shape.c_len() == 0 {
            return Ok(());
        }
        let (a, b, c) = (&a.data[..], &b.data[..], &mut c.data[..shape.c_len()]);
        self.pool.install(|| gemm_kernel(shape, a, b, c));
        Ok(())
    }

    fn add_row_bias(
        &mut self,
        out: &mut CpuBuffer,
        bias: &CpuBuffer,
        rows: usize,
        cols: usize,
    ) -> Result<()> {
        self.dispatch()?;
        ensure_len("bias", bias, cols)?;
        ensure_len("bias target", out, rows * cols)?;
        if cols == 0 {
            return Ok(());
        }
        let bias = &bias.data[..cols];
        let out = &mut out.data[..rows * cols];
        self.pool.install(|| {
            out.par_chunks_mut(cols).for_each(|row| {
                for (value, b) in row.iter_mut().zip(bias) {
                    *value += b;
                }
            })
        });
        Ok(())
    }

    fn sigmoid(&mut self, src: &CpuBuffer, dst: &mut CpuBuffer, len: usize) -> Result<()> {
        self.dispatch()?;
        ensure_len("sigmoid input", src, len)?;
        ensure_len("sigmoid output", dst, len)?;
        let (src, dst) = (&src.data[..len], &mut dst.data[..len]);
        self.pool.install(|| {
            dst.par_iter_mut()
                .zip(src.par_iter())
                .for_each(|(d, &s)| *d = sigmoid(s))
        });
        Ok(())
    }

    fn softmax_rows(
        &mut self,
        src: &CpuBuffer,
        dst: &mut CpuBuffer,
        rows: usize,
        cols: usize,
    ) -> Result<()> {
        self.dispatch()?;
        ensure_len("softmax input", src, rows * cols)?;
        ensure_len("softmax output", dst, rows * cols)?;
        if cols == 0 {
            return Ok(());
        }
        let (src, dst) = (&src.data[..rows * cols], &mut dst.data[..rows * cols]);
        self.pool.install(|| {
            dst.par_chunks_mut(cols)
                .zip(src.par_chunks(cols))
                .for_each(|(d, s)| softmax_into(s, d))
        });
        Ok(())
    }

    fn sub(&mut self, a: &CpuBuffer, b: &CpuBuffer, dst: &mut CpuBuffer, len: usize) -> Result<()> {
        self.dispatch()?;
        ensure_len("sub operand a", a, len)?;
        ensure_len("sub operand b", b, len)?;
        ensure_len("sub output", dst, len)?;
        let (a, b, dst) = (&a.data[..len], &b.data[..len], &mut dst.data[..len]);
        self.pool.install(|| {
            dst.par_iter_mut()
                .zip(a.par_iter().zip(b.par_iter()))
                .for_each(|(d, (&x, &y))| *d = x - y)
        });
        Ok(())
    }

    fn sigmoid_backward(
        &mut self,
        delta: &mut CpuBuffer,
        activation: &CpuBuffer,
        len: usize,
    ) -> Result<()> {
        self.dispatch()?;
        ensure_len("delta", delta, len)?;
        ensure_len("activation", activation, len)?;
        let (delta, activation) = (&mut delta.data[..len], &activation.data[..len]);
        self.pool.install(|| {
            delta
                .par_iter_mut()
                .zip(activation.par_iter())
                .for_each(|(d, &a)| *d *= sigmoid_derivative(a))
        });
        Ok(())
    }

    fn column_sums(
        &mut self,
        src: &CpuBuffer,
        dst: &mut CpuBuffer,
        rows: usize,
        cols: usize,
        alpha: f32,
    ) -> Result<()> {
        self.dispatch()?;
        ensure_len("column sum input", src, rows * cols)?;
        ensure_len("column sum output", dst, cols)?;
        let (src, dst) = (&src.data[..rows * cols], &mut dst.data[..cols]);
        self.pool.install(|| {
            dst.par_iter_mut().enumerate().for_each(|(col, out)| {
                let sum: f32 = (0..rows).map(|row| src[row * cols + col]).sum();
                *out = alpha * sum;
            })
        });
        Ok(())
    }

    fn add(&mut self, a: &CpuBuffer, b: &CpuBuffer, dst: &mut CpuBuffer, len: usize) -> Result<()> {
        self.dispatch()?;
        ensure_len("add operand a", a, len)?;
        ensure_len("add operand b", b, len)?;
        ensure_len("add output", dst, len)?;
        let (a, b, dst) = (&a.data[..len], &b.data[..len], &mut dst.data[..len]);
        self.pool.install(|| {
            dst.par_iter_mut()
                .zip(a.par_iter().zip(b.par_iter()))
                .for_each(|(d, (&x, &y))| *d = x + y)
        });
        Ok(())
    }

    fn synchronize(&mut self) -> Result<()> {
        // Kernels complete inside `install`; only device loss is left to report.
        self.check()
    }
}

#[cfg(not(feature = "blas"))]
fn gemm_kernel(shape: GemmShape, a: &[f32], b: &[f32], c: &mut [f32]) {
    let GemmShape {
        m,
        n,
        k,
        transpose_a,
        transpose_b,
        alpha,
        beta,
    } = shape;

    c.par_chunks_mut(n).enumerate().for_each(|(i, row)| {
        for (j, out) in row.iter_mut().enumerate() {
            let mut acc = 0.0f32;
            for p in 0..k {
                let av = if transpose_a { a[p * m + i] } else { a[i * k + p] };
                let bv = if transpose_b { b[j * k + p] } else { b[p * n + j] };
                acc += av * bv;
            }
            // beta == 0 ignores the previous contents, as BLAS does.
            *out = if beta == 0.0 {
                alpha * acc
            } else {
                alpha * acc + beta * *out
            };
        }
    });
}

#[cfg(feature = "blas")]
fn gemm_kernel(shape: GemmShape, a: &[f32], b: &[f32], c: &mut [f32]) {
    use cblas::{sgemm, Layout, Transpose};

    let trans = |flag: bool| {
        if flag {
            Transpose::Ordinary
        } else {
            Transpose::None
        }
    };
    let lda = if shape.transpose_a { shape.m } else { shape.k };
    let ldb = if shape.transpose_b { shape.k } else { shape.n };

    unsafe {
        sgemm(
            Layout::RowMajor,
            trans(shape.transpose_a),
            trans(shape.transpose_b),
            shape.m as i32,
            shape.n as i32,
            shape.k as i32,
            shape.alpha,
            a,
            lda.max(1) as i32,
            b,
            ldb.max(1) as i32,
            shape.beta,
            c,
            shape.n as i32,
        );
    }
}
