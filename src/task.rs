//! Summary: Fork-join helper for parallel page I/O.
//! Copyright (c) YOAB. All rights reserved.
//!
//! The tree writer hands page writes to short-lived worker tasks. The
//! helper waits for every task, recovers panics, and folds all failures
//! into one composite error so a batch fails as a unit.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Mutex;

use crate::error::{Error, Result};

/// Below this many items the overhead of spawning outweighs the win and
/// the work runs inline.
pub const PARALLEL_THRESHOLD: usize = 4;

/// Runs `op` over every item, in parallel for larger sets, and returns
/// the collected failures as a single error.
///
/// # Errors
///
/// One failure is returned as-is; several are wrapped in
/// [`Error::Batch`]. A panicking task surfaces as [`Error::Panicked`].
pub fn fork_join<T, F>(items: Vec<T>, op: F) -> Result<()>
where
    T: Send,
    F: Fn(T) -> Result<()> + Send + Sync,
{
    if items.len() < PARALLEL_THRESHOLD {
        let mut errors = Vec::new();
        for item in items {
            if let Err(e) = run_one(&op, item) {
                errors.push(e);
            }
        }
        return fold(errors);
    }

    let errors = Mutex::new(Vec::new());
    rayon::scope(|scope| {
        for item in items {
            scope.spawn(|_| {
                if let Err(e) = run_one(&op, item) {
                    errors.lock().unwrap().push(e);
                }
            });
        }
    });
    fold(errors.into_inner().unwrap())
}

fn run_one<T, F>(op: &F, item: T) -> Result<()>
where
    F: Fn(T) -> Result<()>,
{
    match catch_unwind(AssertUnwindSafe(|| op(item))) {
        Ok(res) => res,
        Err(payload) => Err(Error::Panicked {
            message: panic_message(payload),
        }),
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn fold(mut errors: Vec<Error>) -> Result<()> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.pop().unwrap()),
        _ => Err(Error::Batch(errors)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_all_tasks_run() {
        let counter = AtomicUsize::new(0);
        fork_join((0..32).collect(), |_| {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
        .expect("no failures");
        assert_eq!(counter.load(Ordering::Relaxed), 32);
    }

    #[test]
    fn test_small_set_runs_inline() {
        let counter = AtomicUsize::new(0);
        fork_join(vec![1, 2], |_| {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
        .expect("no failures");
        assert_eq!(counter.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_single_error_passes_through() {
        let err = fork_join(vec![0usize], |_| Err(Error::OutOfSpace))
            .err()
            .expect("must fail");
        assert!(matches!(err, Error::OutOfSpace));
    }

    #[test]
    fn test_multiple_errors_fold_into_batch() {
        let err = fork_join((0..16).collect::<Vec<usize>>(), |i| {
            if i % 2 == 0 {
                Err(Error::OutOfSpace)
            } else {
                Ok(())
            }
        })
        .err()
        .expect("must fail");
        assert_eq!(err.errors().len(), 8);
    }

    #[test]
    fn test_panic_recovered_as_error() {
        let err = fork_join(vec![0usize], |_| -> Result<()> {
            panic!("worker exploded");
        })
        .err()
        .expect("must fail");
        match err {
            Error::Panicked { message } => assert!(message.contains("worker exploded")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
