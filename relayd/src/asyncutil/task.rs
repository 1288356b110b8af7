use std::future::Future;
use std::pin::Pin;

use error_stack::{Context, Report, Result, ResultExt};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Error, Debug)]
#[error("task failed")]
pub struct TaskError;

type BoxedTaskFn<T> =
    Box<dyn FnOnce(CancellationToken) -> Pin<Box<dyn Future<Output = T> + Send>> + Send>;

/// A deferred, cancellable unit of work. Nothing runs until the owning
/// [TaskManager] is started, so tasks can be collected and wired up freely
/// beforehand.
pub struct CancellableTask<T> {
    run: BoxedTaskFn<T>,
}

impl<T> CancellableTask<T> {
    pub fn create<Fut>(task: impl FnOnce(CancellationToken) -> Fut + Send + 'static) -> Self
    where
        Fut: Future<Output = T> + Send + 'static,
    {
        Self {
            run: Box::new(move |token| Box::pin(task(token))),
        }
    }

    fn start(self, token: CancellationToken) -> Pin<Box<dyn Future<Output = T> + Send>> {
        (self.run)(token)
    }
}

/// Supervises a set of cancellable tasks: all run concurrently, and the
/// first one to stop, for any reason, takes the rest down with it. Panics
/// are folded into the error report instead of tearing the process down.
pub struct TaskManager<E>
where
    E: From<TaskError> + Context,
{
    tasks: Vec<CancellableTask<Result<(), E>>>,
}

impl<E> TaskManager<E>
where
    E: From<TaskError> + Context,
{
    pub fn new() -> Self {
        TaskManager { tasks: vec![] }
    }

    pub fn add_task(mut self, task: CancellableTask<Result<(), E>>) -> Self {
        self.tasks.push(task);
        self
    }

    pub async fn run(self, token: CancellationToken) -> Result<(), E> {
        let total = self.tasks.len();
        let mut running = JoinSet::new();
        for task in self.tasks {
            // every task gets a child token, so a task consuming its own
            // token cannot cancel its siblings directly
            running.spawn(task.start(token.child_token()));
        }

        let mut outcome = Ok(());
        while let Some(joined) = running.join_next().await {
            // the first task to stop triggers shutdown of all the others;
            // cancelling an already-cancelled token is a no-op
            token.cancel();
            info!(
                "shutting down sub-tasks ({}/{})",
                total.saturating_sub(running.len()),
                total
            );

            outcome = match joined.change_context(E::from(TaskError {})) {
                Ok(Ok(())) => outcome,
                Err(err) | Ok(Err(err)) => fold_err(outcome, err),
            };
        }

        outcome
    }
}

impl<E> Default for TaskManager<E>
where
    E: From<TaskError> + Context,
{
    fn default() -> Self {
        Self::new()
    }
}

fn fold_err<E>(outcome: Result<(), E>, new: Report<E>) -> Result<(), E> {
    match outcome {
        Ok(()) => Err(new),
        Err(mut collected) => {
            collected.extend_one(new);
            Err(collected)
        }
    }
}
