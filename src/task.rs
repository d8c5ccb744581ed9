//! Pipeline-staged task execution.
//!
//! A [`TaskComposer`] is a list of stages. Every stage depends on all earlier
//! stages; tasks inside a stage are independent and run on scoped worker
//! threads unless the composer is inline.

use std::thread;

use crossbeam_channel::unbounded;

type Task<'a> = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'a>;

pub struct TaskGroup<'a> {
    name: String,
    tasks: Vec<(String, Task<'a>)>,
}

impl<'a> TaskGroup<'a> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn enqueue_task(
        &mut self,
        name: impl Into<String>,
        task: impl FnOnce() -> anyhow::Result<()> + Send + 'a,
    ) -> &mut Self {
        self.tasks.push((name.into(), Box::new(task)));
        self
    }
}

pub struct TaskComposer<'a> {
    stages: Vec<TaskGroup<'a>>,
    threaded: bool,
}

impl Default for TaskComposer<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> TaskComposer<'a> {
    pub fn new() -> Self {
        Self {
            stages: Vec::new(),
            threaded: true,
        }
    }

    /// Runs every task on the calling thread, in enqueue order.
    pub fn inline() -> Self {
        Self {
            stages: Vec::new(),
            threaded: false,
        }
    }

    /// Opens a stage that starts once every earlier stage has finished.
    pub fn begin_pipeline_stage(&mut self, name: &str) -> &mut TaskGroup<'a> {
        self.stages.push(TaskGroup {
            name: name.to_string(),
            tasks: Vec::new(),
        });
        let last = self.stages.len() - 1;
        &mut self.stages[last]
    }

    pub fn stages(&self) -> &[TaskGroup<'a>] {
        &self.stages
    }

    /// Runs all stages in order and returns how many tasks failed.
    ///
    /// Failures are logged and never stop later tasks or stages.
    pub fn run(self) -> usize {
        let (error_tx, error_rx) = unbounded::<(String, anyhow::Error)>();
        let mut failures = 0;

        for stage in self.stages {
            let _span = tracing::debug_span!("task_stage", stage = %stage.name).entered();

            if !self.threaded || stage.tasks.len() < 2 {
                for (name, task) in stage.tasks {
                    if let Err(e) = task() {
                        let _ = error_tx.send((name, e));
                    }
                }
            } else {
                failures += run_threaded(&stage.name, stage.tasks, &error_tx);
            }

            for (name, e) in error_rx.try_iter() {
                log::error!("Task {} failed: {:?}", name, e);
                failures += 1;
            }
        }

        failures
    }
}

/// Returns the number of tasks that panicked. Errors go to `error_tx`.
fn run_threaded(
    stage: &str,
    tasks: Vec<(String, Task<'_>)>,
    error_tx: &crossbeam_channel::Sender<(String, anyhow::Error)>,
) -> usize {
    thread::scope(|scope| {
        let mut handles = Vec::with_capacity(tasks.len());
        for (name, task) in tasks {
            let task_tx = error_tx.clone();
            let thread_name = format!("{}:{}", stage, name);
            let task_name = name.clone();
            let spawned = thread::Builder::new()
                .name(thread_name)
                .spawn_scoped(scope, move || {
                    if let Err(e) = task() {
                        let _ = task_tx.send((task_name, e));
                    }
                });
            match spawned {
                Ok(handle) => handles.push((name, handle)),
                Err(e) => {
                    let _ = error_tx.send((name, anyhow::Error::new(e).context("failed to spawn task")));
                }
            }
        }

        let mut panicked = 0;
        for (name, handle) in handles {
            if handle.join().is_err() {
                log::error!("Task {} panicked", name);
                panicked += 1;
            }
        }
        panicked
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;
    use rstest::rstest;

    use super::*;

    fn composer<'a>(threaded: bool) -> TaskComposer<'a> {
        if threaded {
            TaskComposer::new()
        } else {
            TaskComposer::inline()
        }
    }

    #[rstest]
    fn stages_run_in_order(#[values(false, true)] threaded: bool) {
        let order = Mutex::new(Vec::new());
        let order_ref = &order;
        let mut composer = composer(threaded);

        let first = composer.begin_pipeline_stage("first");
        for i in 0..4 {
            first.enqueue_task(format!("first-{}", i), move || {
                order_ref.lock().push(("first", i));
                Ok(())
            });
        }
        composer
            .begin_pipeline_stage("second")
            .enqueue_task("second", move || {
                order_ref.lock().push(("second", 0));
                Ok(())
            });

        assert_eq!(composer.run(), 0);
        let order = order.into_inner();
        assert_eq!(order.len(), 5);
        assert_eq!(order[4], ("second", 0));
    }

    #[rstest]
    fn failures_are_counted_and_do_not_stop_later_tasks(#[values(false, true)] threaded: bool) {
        let ran = AtomicUsize::new(0);
        let ran_ref = &ran;
        let mut composer = composer(threaded);

        composer
            .begin_pipeline_stage("work")
            .enqueue_task("fails", || anyhow::bail!("device lost"))
            .enqueue_task("succeeds", move || {
                ran_ref.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        composer
            .begin_pipeline_stage("after")
            .enqueue_task("after", move || {
                ran_ref.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });

        assert_eq!(composer.run(), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }
}
