// ─────────────────────────────────────────────────────────────────────
// SCPN PRISM Core — Backends & Deferred Tasks
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Array residency and the deferred chunk graph.
//!
//! A [`TaskNode`] is a pure closure over `Arc`-captured inputs whose result is
//! memoized. Siblings are materialized with rayon and assembled by index, so
//! evaluation order never affects values.

use ndarray::{concatenate, s, Array3, Axis};
use num_complex::Complex32;
use parking_lot::Mutex;
use prism_types::error::{PrismError, PrismResult};
use prism_types::state::Device;
use rayon::prelude::*;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

/// Moves wave stacks between host memory and a compute device.
pub trait ArrayBackend: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Device this backend computes on.
    fn device(&self) -> Device;

    fn supports(&self, device: Device) -> bool;

    fn to_device(&self, array: Array3<Complex32>, device: Device) -> PrismResult<Array3<Complex32>>;
}

/// Plain host memory. Only reaches [`Device::Cpu`].
#[derive(Debug, Clone, Copy, Default)]
pub struct HostBackend;

impl ArrayBackend for HostBackend {
    fn name(&self) -> &str {
        "host"
    }

    fn device(&self) -> Device {
        Device::Cpu
    }

    fn supports(&self, device: Device) -> bool {
        device == Device::Cpu
    }

    fn to_device(&self, array: Array3<Complex32>, device: Device) -> PrismResult<Array3<Complex32>> {
        match device {
            Device::Cpu => Ok(array),
            other => Err(PrismError::Device(format!(
                "backend '{}' cannot reach device '{other}'",
                self.name()
            ))),
        }
    }
}

/// Device moves around one propagated chunk.
#[derive(Debug, Clone)]
pub(crate) struct Transfers {
    pub backend: Arc<dyn ArrayBackend>,
    /// Device the chunk is moved to before propagation.
    pub upload: Option<Device>,
    /// Move the chunk back to the host afterwards.
    pub download: bool,
}

impl Transfers {
    pub fn new(backend: Arc<dyn ArrayBackend>, device: Device, store_on_host: bool) -> Self {
        let remote = device != Device::Cpu;
        Transfers {
            backend,
            upload: remote.then_some(device),
            download: store_on_host && remote,
        }
    }

    /// Values stay where they are.
    pub fn resident(backend: Arc<dyn ArrayBackend>) -> Self {
        Transfers {
            backend,
            upload: None,
            download: false,
        }
    }

    pub fn upload(&self, waves: Array3<Complex32>) -> PrismResult<Array3<Complex32>> {
        match self.upload {
            Some(device) => self.backend.to_device(waves, device),
            None => Ok(waves),
        }
    }

    pub fn download(&self, waves: Array3<Complex32>) -> PrismResult<Array3<Complex32>> {
        if self.download {
            self.backend.to_device(waves, Device::Cpu)
        } else {
            Ok(waves)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    #[default]
    Eager,
    Deferred,
}

type TaskFn<T> = dyn Fn() -> PrismResult<T> + Send + Sync;

/// Memoized node of the deferred graph.
pub struct TaskNode<T> {
    func: Box<TaskFn<T>>,
    cache: Mutex<Option<Arc<T>>>,
}

impl<T> fmt::Debug for TaskNode<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskNode")
            .field("computed", &self.is_computed())
            .finish()
    }
}

impl<T> TaskNode<T> {
    pub fn is_computed(&self) -> bool {
        self.cache.lock().is_some()
    }
}

impl<T: Send + Sync + 'static> TaskNode<T> {
    pub fn new<F>(func: F) -> Arc<Self>
    where
        F: Fn() -> PrismResult<T> + Send + Sync + 'static,
    {
        Arc::new(TaskNode {
            func: Box::new(func),
            cache: Mutex::new(None),
        })
    }

    /// A node whose value is already known.
    pub fn ready(value: T) -> Arc<Self> {
        Arc::new(TaskNode {
            func: Box::new(|| Err(PrismError::Invariant("ready node has no producer".to_string()))),
            cache: Mutex::new(Some(Arc::new(value))),
        })
    }

    /// Evaluate once and share the result.
    ///
    /// The lock is not held while the closure runs: closures may block on
    /// rayon joins that steal other tasks touching this node.
    pub fn get(&self) -> PrismResult<Arc<T>> {
        if let Some(value) = self.cache.lock().as_ref() {
            return Ok(Arc::clone(value));
        }
        let value = Arc::new((self.func)()?);
        let mut cache = self.cache.lock();
        Ok(Arc::clone(cache.get_or_insert(value)))
    }
}

/// A deferred slice `[range, nx, ny]` of the plane-wave axis.
#[derive(Debug, Clone)]
pub struct LazyChunk {
    pub range: Range<usize>,
    pub node: Arc<TaskNode<Array3<Complex32>>>,
}

impl LazyChunk {
    pub fn new(range: Range<usize>, node: Arc<TaskNode<Array3<Complex32>>>) -> Self {
        LazyChunk { range, node }
    }

    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// Apply `f` to this chunk's values in a new node.
    pub fn map<F>(&self, f: F) -> LazyChunk
    where
        F: Fn(&Array3<Complex32>, Range<usize>) -> PrismResult<Array3<Complex32>> + Send + Sync + 'static,
    {
        let parent = Arc::clone(&self.node);
        let range = self.range.clone();
        let captured = range.clone();
        LazyChunk {
            range,
            node: TaskNode::new(move || {
                let values = parent.get()?;
                f(&values, captured.clone())
            }),
        }
    }
}

/// Evaluate chunks in parallel and concatenate them in index order.
pub fn materialize(chunks: &[LazyChunk]) -> PrismResult<Array3<Complex32>> {
    let values: Vec<Arc<Array3<Complex32>>> = chunks
        .par_iter()
        .map(|c| c.node.get())
        .collect::<PrismResult<_>>()?;
    for (chunk, value) in chunks.iter().zip(&values) {
        if value.len_of(Axis(0)) != chunk.len() {
            return Err(PrismError::Invariant(format!(
                "chunk {:?} produced {} waves",
                chunk.range,
                value.len_of(Axis(0))
            )));
        }
    }
    let views: Vec<_> = values.iter().map(|v| v.view()).collect();
    concatenate(Axis(0), &views).map_err(|e| PrismError::Invariant(format!("chunk shapes: {e}")))
}

/// Re-partition chunks along the wave axis without touching values.
pub fn rechunk(chunks: &[LazyChunk], new_ranges: Vec<Range<usize>>) -> Vec<LazyChunk> {
    new_ranges
        .into_iter()
        .map(|target| {
            let parents: Vec<LazyChunk> = chunks
                .iter()
                .filter(|c| c.range.start < target.end && target.start < c.range.end)
                .cloned()
                .collect();
            let captured = target.clone();
            let node = TaskNode::new(move || {
                let mut pieces = Vec::with_capacity(parents.len());
                for parent in &parents {
                    let values = parent.node.get()?;
                    let lo = captured.start.max(parent.range.start) - parent.range.start;
                    let hi = captured.end.min(parent.range.end) - parent.range.start;
                    pieces.push(values.slice(s![lo..hi, .., ..]).to_owned());
                }
                let views: Vec<_> = pieces.iter().map(|p| p.view()).collect();
                concatenate(Axis(0), &views).map_err(|e| PrismError::Invariant(format!("rechunk: {e}")))
            });
            LazyChunk::new(target, node)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_chunk(range: Range<usize>, calls: Arc<AtomicUsize>) -> LazyChunk {
        let captured = range.clone();
        LazyChunk::new(
            range,
            TaskNode::new(move || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Array3::from_shape_fn((captured.len(), 2, 2), |(i, _, _)| {
                    Complex32::new((captured.start + i) as f32, 0.0)
                }))
            }),
        )
    }

    #[test]
    fn test_host_backend_rejects_gpu() {
        let array = Array3::<Complex32>::zeros((1, 2, 2));
        assert!(HostBackend.to_device(array.clone(), Device::Cpu).is_ok());
        assert!(matches!(
            HostBackend.to_device(array, Device::Gpu),
            Err(PrismError::Device(_))
        ));
    }

    #[test]
    fn test_node_memoizes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chunk = counting_chunk(0..3, Arc::clone(&calls));
        chunk.node.get().expect("first");
        chunk.node.get().expect("second");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(chunk.node.is_computed());
    }

    #[test]
    fn test_materialize_in_index_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chunks = vec![
            counting_chunk(0..3, Arc::clone(&calls)),
            counting_chunk(3..4, Arc::clone(&calls)),
            counting_chunk(4..7, Arc::clone(&calls)),
        ];
        let array = materialize(&chunks).expect("materialize");
        let order: Vec<f32> = (0..7).map(|i| array[[i, 0, 0]].re).collect();
        assert_eq!(order, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_rechunk_preserves_values() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chunks = vec![counting_chunk(0..4, Arc::clone(&calls)), counting_chunk(4..7, Arc::clone(&calls))];
        let before = materialize(&chunks).expect("before");
        let rechunked = rechunk(&chunks, vec![0..2, 2..5, 5..7]);
        let after = materialize(&rechunked).expect("after");
        assert_eq!(before, after);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_host_transfers_are_noops() {
        let array = Array3::from_elem((1, 2, 2), Complex32::new(1.0, 0.0));
        let transfers = Transfers::new(Arc::new(HostBackend), Device::Cpu, true);
        assert_eq!(transfers.upload, None);
        assert!(!transfers.download);
        let moved = transfers.download(transfers.upload(array.clone()).expect("up")).expect("down");
        assert_eq!(moved, array);
    }

    #[test]
    fn test_failed_chunk_aborts() {
        let bad = LazyChunk::new(
            0..1,
            TaskNode::new(|| Err(PrismError::Numerical("nan".to_string()))),
        );
        assert!(matches!(materialize(&[bad]), Err(PrismError::Numerical(_))));
    }
}
