//! Kernel dispatch over independent work items.
//!
//! Kernels only see a [`Lane`] (their index and the total count); how the
//! lanes are scheduled is up to the [`Dispatcher`].

use rayon::prelude::*;

/// Position of one kernel invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lane {
    pub index: usize,
    pub count: usize,
}

/// Runs one kernel per item.
pub trait Dispatcher: Send + Sync {
    /// Short name used in logs and benchmarks.
    fn name(&self) -> &'static str;

    /// Calls `kernel` once for every item. Returns after all calls finished.
    fn dispatch<T, F>(&self, items: &mut [T], kernel: F)
    where
        T: Send,
        F: Fn(Lane, &mut T) + Send + Sync;
}

/// In-order loop on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sequential;

impl Dispatcher for Sequential {
    fn name(&self) -> &'static str {
        "sequential"
    }

    fn dispatch<T, F>(&self, items: &mut [T], kernel: F)
    where
        T: Send,
        F: Fn(Lane, &mut T) + Send + Sync,
    {
        let count = items.len();
        for (index, item) in items.iter_mut().enumerate() {
            kernel(Lane { index, count }, item);
        }
    }
}

/// Data-parallel loop on the rayon thread pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct Rayon;

impl Dispatcher for Rayon {
    fn name(&self) -> &'static str {
        "rayon"
    }

    fn dispatch<T, F>(&self, items: &mut [T], kernel: F)
    where
        T: Send,
        F: Fn(Lane, &mut T) + Send + Sync,
    {
        let count = items.len();
        items
            .par_iter_mut()
            .enumerate()
            .for_each(|(index, item)| kernel(Lane { index, count }, item));
    }
}
