use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

/// Task is one unit of work, usually the handling of a single connection
pub type Task = BoxFuture<'static, ()>;

/// Rejected hands a task back to the caller when a pool cannot take it
pub struct Rejected(pub Task);

impl std::fmt::Debug for Rejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Rejected(..)")
    }
}

/// TaskPool runs tasks on behalf of the server. A rejected task is not lost:
/// the server falls back to spawning it directly.
pub trait TaskPool: Send + Sync {
    fn submit(&self, task: Task) -> Result<(), Rejected>;
}

/// BoundedPool runs at most `limit` tasks at a time and rejects the rest
#[derive(Debug, Clone)]
pub struct BoundedPool {
    permits: Arc<Semaphore>,
}

impl BoundedPool {
    pub fn new(limit: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(limit)),
        }
    }

    /// number of tasks that could still be accepted right now
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

impl TaskPool for BoundedPool {
    fn submit(&self, task: Task) -> Result<(), Rejected> {
        match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => {
                tokio::spawn(async move {
                    task.await;
                    drop(permit);
                });
                Ok(())
            }
            Err(_) => Err(Rejected(task)),
        }
    }
}

/// submit hands the task to the pool when there is one, and spawns it on the
/// runtime when there is none or the pool refuses it
pub fn submit(pool: Option<&Arc<dyn TaskPool>>, task: Task) {
    let task = match pool {
        Some(pool) => match pool.submit(task) {
            Ok(()) => return,
            Err(Rejected(task)) => {
                debug!("task pool saturated, spawning directly");
                task
            }
        },
        None => task,
    };
    tokio::spawn(task);
}
