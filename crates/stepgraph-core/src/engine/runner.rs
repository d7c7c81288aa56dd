//! Task execution for one superstep
//!
//! Every triggered task runs as its own tokio task, bounded by an optional
//! global concurrency cap. One shared [`CancellationToken`] governs the
//! whole step: the first terminal, non-interrupt failure cancels it, a
//! step timeout cancels it, and still-running siblings observe it
//! cooperatively and report `Cancelled`. Tasks that finished before the
//! signal keep their outcomes; the loop preserves their writes as pending
//! writes. Interrupts do not cancel siblings; the rest of the step is
//! allowed to finish so its progress can be persisted before suspension.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::TaskCache;
use crate::engine::types::{ExecutableTask, TaskOutcome, TaskResult};
use crate::error::GraphError;
use crate::interrupt::TaskContext;

/// Outcome of one superstep's execution, results in task order.
#[derive(Debug)]
pub struct StepReport {
    pub results: Vec<TaskResult>,
    /// The step's wall-clock budget expired
    pub timed_out: bool,
}

impl StepReport {
    /// First terminal failure, if any.
    pub fn first_failure(&self) -> Option<&TaskResult> {
        self.results
            .iter()
            .find(|r| matches!(r.outcome, TaskOutcome::Failed(_)))
    }

    /// All interrupts raised during the step, in task order.
    pub fn interrupts(&self) -> Vec<crate::interrupt::InterruptRecord> {
        self.results
            .iter()
            .filter_map(|r| match &r.outcome {
                TaskOutcome::Interrupted(records) => Some(records.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }
}

/// Executes the triggered task set under concurrency, timeout, retry, and
/// cancellation policy.
pub struct TaskRunner {
    semaphore: Option<Arc<Semaphore>>,
    step_timeout: Option<Duration>,
    cache: Arc<TaskCache>,
}

impl TaskRunner {
    pub fn new(
        concurrency: Option<usize>,
        step_timeout: Option<Duration>,
        cache: Arc<TaskCache>,
    ) -> Self {
        Self {
            semaphore: concurrency.map(|n| Arc::new(Semaphore::new(n))),
            step_timeout,
            cache,
        }
    }

    /// Run one superstep's tasks to terminal state.
    ///
    /// `resume` maps node names to ordinal-ordered resume values for
    /// replayed tasks. `cancel` is the caller-level signal; the step runs
    /// under a child token so external cancellation reaches every task.
    pub async fn run_step(
        &self,
        tasks: Vec<ExecutableTask>,
        resume: &HashMap<String, Vec<Value>>,
        step: i64,
        cancel: &CancellationToken,
    ) -> StepReport {
        let token = cancel.child_token();
        let mut handles = Vec::with_capacity(tasks.len());

        for task in tasks {
            let token = token.clone();
            let semaphore = self.semaphore.clone();
            let cache = self.cache.clone();
            let resume_values = resume.get(&task.name).cloned().unwrap_or_default();
            handles.push(tokio::spawn(run_task(
                task,
                resume_values,
                step,
                token,
                semaphore,
                cache,
            )));
        }

        let mut join_fut = futures::future::join_all(handles);
        let mut timed_out = false;
        let joined = match self.step_timeout {
            Some(duration) => match tokio::time::timeout(duration, &mut join_fut).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(step, "step timeout expired, cancelling remaining tasks");
                    timed_out = true;
                    token.cancel();
                    join_fut.await
                }
            },
            None => join_fut.await,
        };

        let results = joined
            .into_iter()
            .map(|joined| match joined {
                Ok(result) => result,
                Err(join_err) => TaskResult {
                    task_id: String::new(),
                    name: String::new(),
                    outcome: TaskOutcome::Failed(GraphError::Custom(format!(
                        "task panicked: {join_err}"
                    ))),
                },
            })
            .collect();

        StepReport { results, timed_out }
    }
}

async fn run_task(
    task: ExecutableTask,
    resume: Vec<Value>,
    step: i64,
    token: CancellationToken,
    semaphore: Option<Arc<Semaphore>>,
    cache: Arc<TaskCache>,
) -> TaskResult {
    let done = |outcome| TaskResult {
        task_id: task.id.clone(),
        name: task.name.clone(),
        outcome,
    };

    let _permit = match semaphore {
        Some(sem) => {
            tokio::select! {
                permit = sem.acquire_owned() => match permit {
                    Ok(p) => Some(p),
                    Err(_) => return done(TaskOutcome::Cancelled),
                },
                _ = token.cancelled() => return done(TaskOutcome::Cancelled),
            }
        }
        None => None,
    };

    let cache_key = task
        .cache_policy
        .as_ref()
        .map(|policy| format!("{}:{}", task.name, policy.key_for(&task.input)));
    if let Some(key) = &cache_key {
        if let Some(output) = cache.get(key) {
            debug!(task = %task.name, "cache hit, skipping execution");
            return done(TaskOutcome::Success(output));
        }
    }

    let mut attempts = 0usize;
    loop {
        if token.is_cancelled() {
            return done(TaskOutcome::Cancelled);
        }
        attempts += 1;
        let ctx = TaskContext::new(
            &task.id,
            &task.name,
            step,
            attempts,
            token.clone(),
            resume.clone(),
        );

        let result = tokio::select! {
            result = task.executor.execute(task.input.clone(), &ctx) => result,
            _ = token.cancelled() => return done(TaskOutcome::Cancelled),
        };

        match result {
            Ok(output) => {
                if let (Some(key), Some(policy)) = (&cache_key, &task.cache_policy) {
                    cache.insert(key.clone(), output.clone(), policy.ttl);
                }
                debug!(task = %task.name, attempts, "task succeeded");
                return done(TaskOutcome::Success(output));
            }
            Err(error) if error.is_interrupt() => {
                // cooperative suspension; siblings keep running
                return done(TaskOutcome::Interrupted(ctx.raised_interrupts()));
            }
            Err(error) if error.is_cancellation() => {
                return done(TaskOutcome::Cancelled);
            }
            Err(error) => {
                let retry = task
                    .retry_policy
                    .as_ref()
                    .filter(|p| p.should_retry(attempts) && p.is_retryable(&error));
                match retry {
                    Some(policy) => {
                        let delay = policy.calculate_delay(attempts);
                        warn!(
                            task = %task.name,
                            attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "task attempt failed, retrying"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = token.cancelled() => return done(TaskOutcome::Cancelled),
                        }
                    }
                    None => {
                        warn!(task = %task.name, attempts, error = %error, "task failed terminally");
                        // bring the rest of the step down with us
                        token.cancel();
                        return done(TaskOutcome::Failed(GraphError::task_failed(
                            task.name.clone(),
                            error,
                        )));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::node_fn;
    use crate::retry::RetryPolicy;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn runner() -> TaskRunner {
        TaskRunner::new(None, None, Arc::new(TaskCache::new()))
    }

    fn task(name: &str, executor: Arc<dyn crate::engine::types::NodeExecutor>) -> ExecutableTask {
        ExecutableTask {
            id: format!("cp:{name}"),
            name: name.to_string(),
            input: json!(null),
            triggers: vec![],
            writes: vec![],
            retry_policy: None,
            cache_policy: None,
            executor,
        }
    }

    #[tokio::test]
    async fn successful_tasks_return_outputs_in_order() {
        let tasks = vec![
            task("a", node_fn(|_, _| Box::pin(async { Ok(json!("one")) }))),
            task("b", node_fn(|_, _| Box::pin(async { Ok(json!("two")) }))),
        ];
        let report = runner()
            .run_step(tasks, &HashMap::new(), 0, &CancellationToken::new())
            .await;

        assert!(!report.timed_out);
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.results[0].name, "a");
        assert!(matches!(
            report.results[0].outcome,
            TaskOutcome::Success(ref v) if v == &json!("one")
        ));
        assert!(matches!(
            report.results[1].outcome,
            TaskOutcome::Success(ref v) if v == &json!("two")
        ));
    }

    #[tokio::test]
    async fn transient_failure_recovers_within_retry_budget() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let executor = node_fn(move |_, _| {
            let counter = counter.clone();
            Box::pin(async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(GraphError::execution("transient"))
                } else {
                    Ok(json!("recovered"))
                }
            })
        });
        let mut t = task("flaky", executor);
        t.retry_policy = Some(
            RetryPolicy::new(3)
                .with_initial_interval(0.001)
                .with_jitter(false),
        );

        let report = runner()
            .run_step(vec![t], &HashMap::new(), 0, &CancellationToken::new())
            .await;
        assert!(matches!(
            report.results[0].outcome,
            TaskOutcome::Success(ref v) if v == &json!("recovered")
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_with_task_identity() {
        let executor = node_fn(|_, _| {
            Box::pin(async { Err(GraphError::execution("always broken")) })
        });
        let mut t = task("doomed", executor);
        t.retry_policy = Some(
            RetryPolicy::new(2)
                .with_initial_interval(0.001)
                .with_jitter(false),
        );

        let report = runner()
            .run_step(vec![t], &HashMap::new(), 0, &CancellationToken::new())
            .await;
        match &report.results[0].outcome {
            TaskOutcome::Failed(GraphError::TaskFailed { task, .. }) => {
                assert_eq!(task, "doomed");
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failure_cancels_slow_sibling() {
        let slow = node_fn(|_, ctx| {
            let token = ctx.cancellation_token();
            Box::pin(async move {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(30)) => Ok(json!("finished")),
                    _ = token.cancelled() => Err(GraphError::Cancelled { task: "slow".into() }),
                }
            })
        });
        let failing = node_fn(|_, _| {
            Box::pin(async { Err(GraphError::execution("boom")) })
        });

        let report = runner()
            .run_step(
                vec![task("slow", slow), task("failing", failing)],
                &HashMap::new(),
                0,
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(report.results[0].outcome, TaskOutcome::Cancelled));
        assert!(matches!(
            report.results[1].outcome,
            TaskOutcome::Failed(_)
        ));
    }

    #[tokio::test]
    async fn interrupt_is_terminal_without_retry_and_spares_siblings() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let interrupting = node_fn(move |_, ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            let value = ctx.interrupt(json!("confirm?"));
            Box::pin(async move {
                value?;
                Ok(json!("unreachable"))
            })
        });
        let mut t = task("gate", interrupting);
        t.retry_policy = Some(RetryPolicy::new(5).with_initial_interval(0.001));

        let sibling = task("sibling", node_fn(|_, _| Box::pin(async { Ok(json!("done")) })));

        let report = runner()
            .run_step(
                vec![t, sibling],
                &HashMap::new(),
                0,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        match &report.results[0].outcome {
            TaskOutcome::Interrupted(records) => {
                assert_eq!(records.len(), 1);
                assert_eq!(records[0].value, json!("confirm?"));
            }
            other => panic!("expected interrupt, got {other:?}"),
        }
        assert!(matches!(
            report.results[1].outcome,
            TaskOutcome::Success(_)
        ));
        assert_eq!(report.interrupts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn step_timeout_cancels_all_running_tasks() {
        let hung = node_fn(|_, _| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(json!("never"))
            })
        });
        let runner = TaskRunner::new(None, Some(Duration::from_millis(50)), Arc::new(TaskCache::new()));
        let report = runner
            .run_step(
                vec![task("hung", hung)],
                &HashMap::new(),
                0,
                &CancellationToken::new(),
            )
            .await;

        assert!(report.timed_out);
        assert!(matches!(report.results[0].outcome, TaskOutcome::Cancelled));
    }

    #[tokio::test]
    async fn concurrency_cap_bounds_parallelism() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for i in 0..4 {
            let active = active.clone();
            let peak = peak.clone();
            tasks.push(task(
                &format!("t{i}"),
                node_fn(move |_, _| {
                    let active = active.clone();
                    let peak = peak.clone();
                    Box::pin(async move {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                        Ok(json!(null))
                    })
                }),
            ));
        }

        let runner = TaskRunner::new(Some(1), None, Arc::new(TaskCache::new()));
        let report = runner
            .run_step(tasks, &HashMap::new(), 0, &CancellationToken::new())
            .await;
        assert_eq!(report.results.len(), 4);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cache_hit_skips_execution() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let executor = node_fn(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(json!("computed")) })
        });
        let mut t = task("cached", executor);
        t.cache_policy = Some(crate::cache::CachePolicy::hashed(None));

        let cache = Arc::new(TaskCache::new());
        let runner = TaskRunner::new(None, None, cache);
        let token = CancellationToken::new();

        runner
            .run_step(vec![t.clone()], &HashMap::new(), 0, &token)
            .await;
        let report = runner.run_step(vec![t], &HashMap::new(), 1, &token).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            report.results[0].outcome,
            TaskOutcome::Success(ref v) if v == &json!("computed")
        ));
    }
}
