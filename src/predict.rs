//! Parallel prediction through a scratch big map.
//!
//! Predictions are computed concurrently into a temporary concurrent map
//! keyed by record index, then applied to the records one at a time in
//! order. The records themselves are only read by the workers, so `apply`
//! never races with prediction.

use crate::error::{Result, StorageError};
use crate::persistence::{BigMap, MapOptions, MapValue, StorageEngine, StorageHint};
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParallelPredictBuffer {
    workers: usize,
    hint: StorageHint,
}

impl ParallelPredictBuffer {
    /// `workers == 0` uses one worker per available core.
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            hint: StorageHint::InDisk,
        }
    }

    /// Where the scratch map lives. Defaults to [`StorageHint::InDisk`].
    pub fn with_storage_hint(mut self, hint: StorageHint) -> Self {
        self.hint = hint;
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Predict every record with `predict`, then hand each prediction to
    /// `apply` together with its record, in record order.
    ///
    /// The first failing prediction aborts the run. The scratch map is
    /// dropped whether or not the run succeeds. Returns the number of
    /// records updated.
    pub fn run<E, R, P, F, A>(&self, engine: &E, records: &mut [R], predict: F, mut apply: A) -> Result<usize>
    where
        E: StorageEngine,
        R: Sync,
        P: MapValue,
        F: Fn(&R) -> Result<P> + Sync,
        A: FnMut(&mut R, P),
    {
        let name = format!(
            "tmp_prediction_buffer_{}",
            NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed)
        );
        let options = MapOptions::hash_map()
            .hint(self.hint)
            .concurrent(true)
            .temporary(true)
            .capacity(records.len());
        let scratch: BigMap<u64, P> = engine.get_big_map(&name, options)?;
        debug!(map = %name, records = records.len(), workers = self.workers, "running parallel prediction");

        let result = self.fill_and_apply(&scratch, records, &predict, &mut apply);
        let dropped = engine.drop_big_map(&name);
        let applied = result?;
        dropped?;
        Ok(applied)
    }

    fn fill_and_apply<R, P, F, A>(
        &self,
        scratch: &BigMap<u64, P>,
        records: &mut [R],
        predict: &F,
        apply: &mut A,
    ) -> Result<usize>
    where
        R: Sync,
        P: MapValue,
        F: Fn(&R) -> Result<P> + Sync,
        A: FnMut(&mut R, P),
    {
        let pool = ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|i| format!("predict-{i}"))
            .build()
            .map_err(|e| StorageError::InvalidConfiguration(format!("worker pool: {e}")))?;

        let shared: &[R] = records;
        pool.install(|| {
            shared
                .par_iter()
                .enumerate()
                .try_for_each(|(i, record)| scratch.put(i as u64, predict(record)?))
        })?;

        for (i, record) in records.iter_mut().enumerate() {
            let prediction = scratch.remove(&(i as u64))?.ok_or_else(|| {
                StorageError::InvalidState(format!("no prediction recorded for record {i}"))
            })?;
            apply(record, prediction);
        }
        Ok(records.len())
    }
}

impl Default for ParallelPredictBuffer {
    fn default() -> Self {
        Self::new(0)
    }
}
