//! Parallel block pump: one producer (the calling thread) reads blobs, N
//! workers decode and process them, and a single output thread serializes
//! whatever the workers post.

use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, Sender};

use super::{Block, BlockSource};
use crate::common::CancelFlag;

/// Handle through which a worker posts results to the output thread.
/// Posting blocks when the output queue is full (backpressure).
pub struct OutputQueue<'a, T> {
    tx: &'a Sender<T>,
}

impl<T> OutputQueue<'_, T> {
    pub fn post(&self, item: T) {
        // The output thread outlives all workers; a send can only fail
        // after a panic there, which already aborts the scan.
        let _ = self.tx.send(item);
    }
}

/// Per-worker processing context. Each callback may post output batches;
/// `after_tasks` runs once the task queue is exhausted (and is where phased
/// workers catch up through any phases they never saw input for).
pub trait OsmWorker: Send {
    type Output: Send + 'static;

    fn string_table(&mut self, strings: &[String]);
    fn node(&mut self, node: &super::RawNode, strings: &[String], out: &OutputQueue<Self::Output>);
    fn begin_way_group(&mut self, out: &OutputQueue<Self::Output>);
    fn way(&mut self, way: &super::RawWay, strings: &[String], out: &OutputQueue<Self::Output>);
    fn begin_relation_group(&mut self, out: &OutputQueue<Self::Output>);
    fn relation(
        &mut self,
        rel: &super::RawRelation,
        strings: &[String],
        out: &OutputQueue<Self::Output>,
    );
    fn end_block(&mut self, out: &OutputQueue<Self::Output>);
    fn after_tasks(&mut self, out: &OutputQueue<Self::Output>);
}

fn dispatch<W: OsmWorker>(worker: &mut W, block: &Block, out: &OutputQueue<W::Output>) {
    worker.string_table(&block.strings);
    for node in &block.nodes {
        worker.node(node, &block.strings, out);
    }
    if !block.ways.is_empty() {
        worker.begin_way_group(out);
        for way in &block.ways {
            worker.way(way, &block.strings, out);
        }
    }
    if !block.relations.is_empty() {
        worker.begin_relation_group(out);
        for rel in &block.relations {
            worker.relation(rel, &block.strings, out);
        }
    }
    worker.end_block(out);
}

/// Run the scan. Returns the workers (for harvesting their local state)
/// and the sink (for harvesting the globally merged state). Cancellation
/// stops the producer; workers still run their end-of-input handling so
/// every buffered write lands before the error surfaces.
pub fn scan<S, W, F>(
    mut source: S,
    workers: Vec<W>,
    sink: F,
    cancel: &CancelFlag,
) -> Result<(Vec<W>, F)>
where
    S: BlockSource,
    W: OsmWorker,
    F: FnMut(W::Output) + Send,
{
    let thread_count = workers.len();
    assert!(thread_count > 0);
    let (task_tx, task_rx) = bounded::<S::Blob>(thread_count * 2);
    let (out_tx, out_rx) = bounded::<W::Output>(thread_count * 4);

    std::thread::scope(|scope| {
        let mut worker_handles = Vec::with_capacity(thread_count);
        for mut worker in workers {
            let task_rx = task_rx.clone();
            let out_tx = out_tx.clone();
            worker_handles.push(scope.spawn(move || -> Result<W> {
                let out = OutputQueue { tx: &out_tx };
                for blob in task_rx {
                    if let Some(block) = S::decode(blob)? {
                        dispatch(&mut worker, &block, &out);
                    }
                }
                worker.after_tasks(&out);
                Ok(worker)
            }));
        }
        drop(task_rx);
        drop(out_tx);

        let output_handle = scope.spawn(move || {
            let mut sink = sink;
            for item in out_rx {
                sink(item);
            }
            sink
        });

        // Produce on the calling thread. A send error means all workers
        // are gone (panicked); the join below surfaces the cause.
        let mut source_result = Ok(());
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match source.next_blob() {
                Ok(Some(blob)) => {
                    if task_tx.send(blob).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    source_result = Err(e);
                    break;
                }
            }
        }
        drop(task_tx);

        let mut harvested = Vec::with_capacity(thread_count);
        let mut worker_result = Ok(());
        for handle in worker_handles {
            match handle.join().map_err(|_| anyhow!("worker thread panicked")) {
                Ok(Ok(worker)) => harvested.push(worker),
                Ok(Err(e)) | Err(e) => {
                    if worker_result.is_ok() {
                        worker_result = Err(e);
                    }
                }
            }
        }
        let sink = output_handle.join().map_err(|_| anyhow!("output thread panicked"))?;

        source_result?;
        worker_result?;
        cancel.check()?;
        Ok((harvested, sink))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::osm::{MemSource, RawNode, RawRelation, RawWay};

    struct CountingWorker {
        nodes: u64,
        ways: u64,
        relations: u64,
        blocks: u64,
    }

    impl OsmWorker for CountingWorker {
        type Output = u64;

        fn string_table(&mut self, strings: &[String]) {
            assert!(!strings.is_empty());
        }
        fn node(&mut self, _: &RawNode, _: &[String], _: &OutputQueue<u64>) {
            self.nodes += 1;
        }
        fn begin_way_group(&mut self, _: &OutputQueue<u64>) {}
        fn way(&mut self, _: &RawWay, _: &[String], _: &OutputQueue<u64>) {
            self.ways += 1;
        }
        fn begin_relation_group(&mut self, _: &OutputQueue<u64>) {}
        fn relation(&mut self, _: &RawRelation, _: &[String], _: &OutputQueue<u64>) {
            self.relations += 1;
        }
        fn end_block(&mut self, out: &OutputQueue<u64>) {
            self.blocks += 1;
            out.post(1);
        }
        fn after_tasks(&mut self, _: &OutputQueue<u64>) {}
    }

    fn test_block(node_ids: std::ops::Range<i64>) -> crate::osm::Block {
        let mut block = crate::osm::Block {
            strings: vec![String::new()],
            ..Default::default()
        };
        for id in node_ids {
            block.nodes.push(RawNode { id, lon: 0, lat: 0, tags: vec![] });
        }
        block
    }

    #[test]
    fn every_block_is_processed_exactly_once() {
        let blocks: Vec<_> = (0..20).map(|i| test_block(i * 10..i * 10 + 10)).collect();
        let workers = (0..4)
            .map(|_| CountingWorker { nodes: 0, ways: 0, relations: 0, blocks: 0 })
            .collect();
        let mut merged = 0u64;
        let (workers, _) =
            scan(MemSource::new(blocks), workers, |n| merged += n, &Default::default()).unwrap();
        let total_blocks: u64 = workers.iter().map(|w| w.blocks).sum();
        let total_nodes: u64 = workers.iter().map(|w| w.nodes).sum();
        assert_eq!(total_blocks, 20);
        assert_eq!(total_nodes, 200);
        assert_eq!(merged, 20);
    }
}
