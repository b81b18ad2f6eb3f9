use crate::error::Error;
use anyhow::Result;
use crossbeam_channel::{unbounded as unbounded_channel, Receiver, Sender};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

static VOLUMES: Lazy<Pool<f32>> = Lazy::new(Pool::new);

/// Free list for one shape.
///
/// The channel is used as a lock free MPMC queue of buffers; the list keeps both
/// ends alive so sends never fail.
struct FreeList<T> {
    sender: Sender<Vec<T>>,
    receiver: Receiver<Vec<T>>,
    allocated: AtomicUsize,
}

impl<T> FreeList<T> {
    fn new() -> Self {
        let (sender, receiver) = unbounded_channel();
        Self {
            sender,
            receiver,
            allocated: AtomicUsize::new(0),
        }
    }
}

/// Buffers of `T` keyed by 3-D shape.
///
/// Lists are created on first use and live as long as the pool.
pub(crate) struct Pool<T> {
    lists: RwLock<HashMap<[usize; 3], Arc<FreeList<T>>>>,
}

impl<T: Clone + Default> Pool<T> {
    pub(crate) fn new() -> Self {
        Self {
            lists: RwLock::default(),
        }
    }
    fn list(&self, shape: [usize; 3]) -> Arc<FreeList<T>> {
        if let Some(list) = self.lists.read().get(&shape) {
            return list.clone();
        }
        self.lists
            .write()
            .entry(shape)
            .or_insert_with(|| Arc::new(FreeList::new()))
            .clone()
    }
    /// Takes a buffer of `shape`, allocating if the free list is empty.
    ///
    /// The contents are unspecified.
    pub(crate) fn acquire(&self, shape: [usize; 3]) -> Result<Vec<T>> {
        let list = self.list(shape);
        if let Ok(buffer) = list.receiver.try_recv() {
            return Ok(buffer);
        }
        let len = shape.iter().product();
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(len)
            .map_err(|_| Error::OutOfMemory { shape })?;
        buffer.resize(len, T::default());
        list.allocated.fetch_add(1, Ordering::Relaxed);
        Ok(buffer)
    }
    /// Returns a buffer of `shape`, buffers of any other length are dropped.
    pub(crate) fn release(&self, shape: [usize; 3], buffer: Vec<T>) {
        if buffer.is_empty() || buffer.len() != shape.iter().product::<usize>() {
            return;
        }
        let list = self.list(shape);
        // Both ends are owned by the list, the channel cannot be disconnected.
        let _ = list.sender.send(buffer);
    }
    pub(crate) fn stats(&self, shape: [usize; 3]) -> PoolStats {
        let lists = self.lists.read();
        if let Some(list) = lists.get(&shape) {
            PoolStats {
                allocated: list.allocated.load(Ordering::Relaxed),
                available: list.receiver.len(),
            }
        } else {
            PoolStats::default()
        }
    }
}

/// Takes a volume buffer of `shape` from the pool, allocating if the free list is empty.
///
/// The contents are unspecified.
pub(crate) fn acquire(shape: [usize; 3]) -> Result<Vec<f32>> {
    VOLUMES.acquire(shape)
}

/// Returns a volume buffer of `shape` to the pool.
pub(crate) fn release(shape: [usize; 3], buffer: Vec<f32>) {
    VOLUMES.release(shape, buffer);
}

/// Pool counters for one shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Buffers allocated for the shape since process start.
    pub allocated: usize,
    /// Buffers currently waiting in the free list.
    pub available: usize,
}

/// Volume counters for `shape`.
///
/// `allocated - available` is the number of live volumes of that shape.
pub fn stats(shape: [usize; 3]) -> PoolStats {
    VOLUMES.stats(shape)
}
