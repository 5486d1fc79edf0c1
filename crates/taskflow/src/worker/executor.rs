use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;

/// Failure reported by an executor; becomes the task's `error`.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ExecError {
    pub message: String,
}

impl ExecError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for ExecError {
    fn from(e: serde_json::Error) -> Self {
        ExecError::new(format!("bad params: {e}"))
    }
}

/// Runs one `task_name`. Called concurrently for different tasks.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, task_name: &str, params: Value) -> Result<Value, ExecError>;
}

/// Adapts an async closure over `params`.
pub struct FnExecutor<F>(F);

#[async_trait]
impl<F, Fut> Executor for FnExecutor<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ExecError>> + Send + 'static,
{
    async fn execute(&self, _task_name: &str, params: Value) -> Result<Value, ExecError> {
        (self.0)(params).await
    }
}

#[derive(Clone, Debug, Default)]
pub struct HandlerOptions {
    max_concurrency: Option<usize>,
    timeout: Option<Duration>,
}

impl HandlerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = Some(n);
        self
    }

    /// Upper bound on top of the task's own `timeout_sec`.
    pub fn timeout(mut self, dur: Duration) -> Self {
        self.timeout = Some(dur);
        self
    }
}

#[derive(Clone)]
pub struct HandlerEntry {
    executor: Arc<dyn Executor>,
    semaphore: Option<Arc<Semaphore>>,
    timeout: Option<Duration>,
}

impl HandlerEntry {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub async fn run(&self, task_name: &str, params: Value) -> Result<Value, ExecError> {
        let _permit = match &self.semaphore {
            Some(sem) => Some(
                sem.clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| ExecError::new("handler semaphore closed"))?,
            ),
            None => None,
        };

        self.executor.execute(task_name, params).await
    }
}

#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    handlers: HashMap<String, HandlerEntry>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, task_name: &str, executor: impl Executor + 'static) {
        self.register_with_options(task_name, executor, HandlerOptions::new());
    }

    pub fn register_fn<F, Fut>(&mut self, task_name: &str, f: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ExecError>> + Send + 'static,
    {
        self.register(task_name, FnExecutor(f));
    }

    pub fn register_fn_with_options<F, Fut>(&mut self, task_name: &str, f: F, opts: HandlerOptions)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ExecError>> + Send + 'static,
    {
        self.register_with_options(task_name, FnExecutor(f), opts);
    }

    pub fn register_with_options(
        &mut self,
        task_name: &str,
        executor: impl Executor + 'static,
        opts: HandlerOptions,
    ) {
        let semaphore = opts
            .max_concurrency
            .map(|n| Arc::new(Semaphore::new(n.max(1))));
        self.handlers.insert(
            task_name.to_string(),
            HandlerEntry {
                executor: Arc::new(executor),
                semaphore,
                timeout: opts.timeout,
            },
        );
    }

    pub fn handler_for(&self, task_name: &str) -> Option<HandlerEntry> {
        self.handlers.get(task_name).cloned()
    }

    pub fn task_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
