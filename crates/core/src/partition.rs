use std::collections::HashMap;
use std::future::Future;

use futures::StreamExt;
use tracing::debug;

/// Anything that can be queued by destination origin.
pub trait Partitioned {
    fn partition_key(&self) -> &str;
}

#[derive(Debug)]
pub struct OriginQueue<T> {
    pub origin: String,
    pub tasks: Vec<T>,
}

/// Groups tasks into one FIFO queue per origin. Queues keep the order in
/// which their origin was first seen; tasks keep insertion order.
#[derive(Debug)]
pub struct WorkPartitioner<T> {
    queues: Vec<OriginQueue<T>>,
    by_origin: HashMap<String, usize>,
}

impl<T> Default for WorkPartitioner<T> {
    fn default() -> Self {
        Self {
            queues: Vec::new(),
            by_origin: HashMap::new(),
        }
    }
}

#[derive(Debug)]
pub struct DispatchReport<E> {
    pub succeeded: usize,
    pub failures: Vec<E>,
}

impl<T: Partitioned> WorkPartitioner<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: T) {
        let origin = task.partition_key();
        let slot = match self.by_origin.get(origin) {
            Some(&slot) => slot,
            None => {
                let slot = self.queues.len();
                self.by_origin.insert(origin.to_string(), slot);
                self.queues.push(OriginQueue {
                    origin: origin.to_string(),
                    tasks: Vec::new(),
                });
                slot
            }
        };
        self.queues[slot].tasks.push(task);
    }

    pub fn origin_count(&self) -> usize {
        self.queues.len()
    }

    pub fn task_count(&self) -> usize {
        self.queues.iter().map(|q| q.tasks.len()).sum()
    }

    pub fn queues(&self) -> &[OriginQueue<T>] {
        &self.queues
    }

    /// Runs every queued task and collects the failures.
    ///
    /// With `max_parallel <= 1` tasks run one at a time, queue by queue, in
    /// insertion order. Otherwise each origin keeps up to `max_parallel` tasks
    /// in flight and all origins advance concurrently. A failing task never
    /// stops its siblings.
    pub async fn dispatch<F, Fut, E>(self, max_parallel: usize, run: F) -> DispatchReport<E>
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        let total = self.task_count();
        debug!(
            event = "dispatch.start",
            origins = self.queues.len(),
            tasks = total,
            max_parallel,
            "dispatch.start"
        );

        let results: Vec<Result<(), E>> = if max_parallel <= 1 {
            let mut results = Vec::with_capacity(total);
            for queue in self.queues {
                for task in queue.tasks {
                    results.push(run(task).await);
                }
            }
            results
        } else {
            let run = &run;
            let per_origin = self.queues.into_iter().map(|queue| async move {
                futures::stream::iter(queue.tasks)
                    .map(run)
                    .buffer_unordered(max_parallel)
                    .collect::<Vec<_>>()
                    .await
            });
            futures::future::join_all(per_origin)
                .await
                .into_iter()
                .flatten()
                .collect()
        };

        let mut report = DispatchReport {
            succeeded: 0,
            failures: Vec::new(),
        };
        for res in results {
            match res {
                Ok(()) => report.succeeded += 1,
                Err(e) => report.failures.push(e),
            }
        }
        debug!(
            event = "dispatch.finish",
            succeeded = report.succeeded,
            failed = report.failures.len(),
            "dispatch.finish"
        );
        report
    }
}
