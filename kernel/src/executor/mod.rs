// Parallel Executor
//
// Two-phase fan-out used by rollback, marker cleanup and file writing:
// an independent per-item transform, optionally followed by an
// associative merge keyed by partition. Each call runs on a dedicated
// rayon pool sized to the work.

use std::collections::HashMap;
use std::hash::Hash;

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};

/// Errors raised by the executor itself (not by mapped tasks).
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("failed to build a worker pool of width {width}: {source}")]
    PoolBuild {
        width: usize,
        #[source]
        source: ThreadPoolBuildError,
    },
}

/// Parallel width for `items` units of work: never more workers than
/// there is work, never zero.
pub fn effective_parallelism(configured: usize, items: usize) -> usize {
    configured.min(items).max(1)
}

#[derive(Debug, Clone)]
pub struct ParallelExecutor {
    name: String,
}

impl Default for ParallelExecutor {
    fn default() -> Self {
        Self::new("tidemark")
    }
}

impl ParallelExecutor {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    fn pool(&self, width: usize) -> Result<ThreadPool, ExecutorError> {
        let name = self.name.clone();
        ThreadPoolBuilder::new()
            .num_threads(width)
            .thread_name(move |i| format!("{name}-worker-{i}"))
            .build()
            .map_err(|source| ExecutorError::PoolBuild { width, source })
    }

    /// Apply `f` to every item on at most `parallelism` workers.
    ///
    /// The first task error aborts the call and is returned once.
    pub fn map<T, R, E, F>(&self, items: Vec<T>, parallelism: usize, f: F) -> Result<Vec<R>, E>
    where
        T: Send,
        R: Send,
        E: From<ExecutorError> + Send,
        F: Fn(T) -> Result<R, E> + Send + Sync,
    {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let width = effective_parallelism(parallelism, items.len());
        let pool = self.pool(width)?;
        pool.install(|| items.into_par_iter().map(&f).collect())
    }

    /// Map every item to a `(key, value)` pair and merge values sharing a
    /// key with `merge`.
    ///
    /// `merge` must be associative and commutative: values are folded per
    /// worker and the partial maps are combined in no particular order.
    pub fn map_to_pair_and_reduce_by_key<T, K, V, E, F, M>(
        &self,
        items: Vec<T>,
        parallelism: usize,
        f: F,
        merge: M,
    ) -> Result<HashMap<K, V>, E>
    where
        T: Send,
        K: Eq + Hash + Send,
        V: Send,
        E: From<ExecutorError> + Send,
        F: Fn(T) -> Result<(K, V), E> + Send + Sync,
        M: Fn(V, V) -> V + Send + Sync,
    {
        if items.is_empty() {
            return Ok(HashMap::new());
        }

        let width = effective_parallelism(parallelism, items.len());
        let pool = self.pool(width)?;
        pool.install(|| {
            items
                .into_par_iter()
                .map(&f)
                .try_fold(HashMap::new, |mut acc, pair: Result<(K, V), E>| {
                    let (key, value) = pair?;
                    insert_merged(&mut acc, key, value, &merge);
                    Ok::<_, E>(acc)
                })
                .try_reduce(HashMap::new, |mut left, right| {
                    for (key, value) in right {
                        insert_merged(&mut left, key, value, &merge);
                    }
                    Ok(left)
                })
        })
    }
}

fn insert_merged<K, V, M>(acc: &mut HashMap<K, V>, key: K, value: V, merge: &M)
where
    K: Eq + Hash,
    M: Fn(V, V) -> V,
{
    let merged = match acc.remove(&key) {
        Some(existing) => merge(existing, value),
        None => value,
    };
    acc.insert(key, merged);
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    #[derive(Debug, thiserror::Error)]
    enum TestError {
        #[error("task {0} failed")]
        Task(u32),
        #[error(transparent)]
        Executor(#[from] ExecutorError),
    }

    #[test]
    fn parallel_width_is_bounded_by_work() {
        assert_eq!(effective_parallelism(8, 3), 3);
        assert_eq!(effective_parallelism(2, 3), 2);
        assert_eq!(effective_parallelism(8, 0), 1);
        assert_eq!(effective_parallelism(0, 5), 1);
    }

    #[test]
    fn map_runs_on_a_pool_of_effective_width() {
        let executor = ParallelExecutor::default();

        let widths: Vec<usize> = executor
            .map(vec![1, 2, 3], 8, |_| {
                Ok::<_, TestError>(rayon::current_num_threads())
            })
            .unwrap();

        assert_eq!(widths, vec![3, 3, 3]);
    }

    #[test]
    fn reduce_by_key_runs_on_a_pool_of_effective_width() {
        let executor = ParallelExecutor::default();

        let widths = executor
            .map_to_pair_and_reduce_by_key(
                vec!["a", "b", "a"],
                8,
                |key| Ok::<_, TestError>((key, BTreeSet::from([rayon::current_num_threads()]))),
                |mut a, b| {
                    a.extend(b);
                    a
                },
            )
            .unwrap();

        assert_eq!(widths.len(), 2);
        assert!(widths.values().all(|w| *w == BTreeSet::from([3])));
    }

    #[test]
    fn map_surfaces_task_error_once() {
        let executor = ParallelExecutor::default();

        let err = executor
            .map(vec![1u32, 2, 3, 4], 4, |i| {
                if i == 3 {
                    Err(TestError::Task(i))
                } else {
                    Ok(i)
                }
            })
            .unwrap_err();

        assert!(matches!(err, TestError::Task(3)));
    }

    #[test]
    fn reduce_by_key_merges_every_value() {
        let executor = ParallelExecutor::default();

        let sums = executor
            .map_to_pair_and_reduce_by_key(
                (1u64..=100).collect(),
                7,
                |i| Ok::<_, TestError>((i % 3, i)),
                |a, b| a + b,
            )
            .unwrap();

        assert_eq!(sums.len(), 3);
        assert_eq!(sums.values().sum::<u64>(), 5050);
        assert_eq!(sums[&0], (1u64..=100).filter(|i| i % 3 == 0).sum::<u64>());
    }

    #[test]
    fn empty_input_needs_no_pool() {
        let executor = ParallelExecutor::default();
        let out: Vec<u8> = executor
            .map(Vec::<u8>::new(), 4, |i| Ok::<_, TestError>(i))
            .unwrap();
        assert!(out.is_empty());
    }
}
