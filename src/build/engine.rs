//! Tile-task engine for the validate and compile phases: batches of tasks
//! run on N workers with per-worker reusable contexts, while the calling
//! thread serializes the outputs. A batch is a barrier — no task of batch
//! K+1 starts before every output of batch K has been committed — which
//! is what lets the validator write across tiles safely.

use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, unbounded};

use crate::common::CancelFlag;

pub fn process_batches<T, C, O>(
    batches: Vec<Vec<T>>,
    mut contexts: Vec<C>,
    work: impl Fn(&mut C, T) -> Result<O> + Sync,
    mut output: impl FnMut(O) -> Result<()>,
    cancel: &CancelFlag,
) -> Result<()>
where
    T: Send,
    C: Send,
    O: Send,
{
    let thread_count = contexts.len();
    assert!(thread_count > 0);
    for batch in batches {
        let (task_tx, task_rx) = unbounded::<T>();
        for task in batch {
            task_tx.send(task).expect("queue cannot be closed yet");
        }
        drop(task_tx);
        let (out_tx, out_rx) = bounded::<O>(thread_count * 2);

        let batch_result = std::thread::scope(|scope| -> Result<()> {
            let mut handles = Vec::with_capacity(thread_count);
            for mut ctx in contexts.drain(..) {
                let task_rx = task_rx.clone();
                let out_tx = out_tx.clone();
                let work = &work;
                handles.push(scope.spawn(move || -> Result<C> {
                    for task in task_rx {
                        if cancel.is_cancelled() {
                            break;
                        }
                        let out = work(&mut ctx, task)?;
                        if out_tx.send(out).is_err() {
                            break; // output side bailed
                        }
                    }
                    Ok(ctx)
                }));
            }
            drop(task_rx);
            drop(out_tx);

            // Serialize outputs on this thread. On an output error, keep
            // draining so workers never block on a full queue.
            let mut out_result = Ok(());
            for item in out_rx {
                if out_result.is_ok() {
                    out_result = output(item);
                }
            }

            let mut worker_result = Ok(());
            for handle in handles {
                match handle.join().map_err(|_| anyhow!("worker thread panicked")) {
                    Ok(Ok(ctx)) => contexts.push(ctx),
                    Ok(Err(e)) | Err(e) => {
                        if worker_result.is_ok() {
                            worker_result = Err(e);
                        }
                    }
                }
            }
            worker_result?;
            out_result
        });
        batch_result?;
        cancel.check()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn batches_are_barriers() {
        // each batch's outputs must all be committed before the next starts
        let committed = AtomicU64::new(0);
        let batches: Vec<Vec<u64>> = vec![vec![0; 10], vec![10; 10], vec![20; 10]];
        let contexts = vec![(); 4];
        let mut seen = Vec::new();
        process_batches(
            batches,
            contexts,
            |_, floor| {
                let done = committed.load(Ordering::SeqCst);
                assert!(done >= floor, "task of a later batch ran too early");
                Ok(())
            },
            |_| {
                committed.fetch_add(1, Ordering::SeqCst);
                seen.push(());
                Ok(())
            },
            &Default::default(),
        )
        .unwrap();
        assert_eq!(seen.len(), 30);
    }

    #[test]
    fn cancellation_surfaces_as_an_error() {
        let cancel = CancelFlag::default();
        cancel.cancel();
        let result =
            process_batches(vec![vec![1]], vec![(); 1], |_, t| Ok(t), |_| Ok(()), &cancel);
        assert!(result.is_err());
    }

    #[test]
    fn worker_errors_propagate() {
        let result = process_batches(
            vec![vec![1, 2, 3]],
            vec![(); 2],
            |_, task| {
                if task == 2 {
                    anyhow::bail!("boom");
                }
                Ok(task)
            },
            |_| Ok(()),
            &Default::default(),
        );
        assert!(result.is_err());
    }
}
