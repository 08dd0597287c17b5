//! Worker engine: matches operations and drives each action end-to-end.
//!
//! # Components
//!
//! - [`Worker`]: match loop plus the per-action lifecycle pipeline
//! - [`executor`]: command execution harness (spawn, streams, timeout)
//! - [`inputs`]: input tree materialization into the execution directory
//! - [`poller`]: stage liveness heartbeat back to the operation queue
//!
//! # Action flow
//!
//! 1. `match_operation` blocks until the queue dispatches an operation
//! 2. Inputs are hard-linked from the CAS file cache into a fresh
//!    execution directory, pinning every linked entry
//! 3. The operation is published at EXECUTING (pollers swapped around the
//!    publication; a refused publication aborts before execution)
//! 4. The command runs under its timeout with captured std-streams
//! 5. The result is assembled, optionally written to the action cache,
//!    and published with `done = true`
//! 6. Cleanup always runs: poller stopped, execution directory removed,
//!    cache pins released as a group
//!
//! [`shutdown_token`] wires SIGTERM/SIGINT to the token the match loop
//! selects on, so the worker exits between actions rather than mid-pipeline.

pub mod executor;
pub mod inputs;
pub mod poller;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::cache::{BlobSource, CacheKey, CasFileCache};
use crate::config::WorkerConfig;
use crate::digest::Digest;
use crate::error::Result;
use crate::instance::{ByteSource, Instance, MatchHandler};
use crate::messages::{
    Action, ActionResult, Command, ExecuteOperationMetadata, ExecuteResponse, Operation,
    OutputFile, Stage,
};

pub use executor::CommandExecutor;
pub use inputs::InputMaterializer;
pub use poller::OperationPoller;

/// Token cancelled when the process receives SIGTERM or SIGINT.
///
/// [`Worker::start`] checks it in the match-loop `select!`, so cancellation
/// takes effect while the worker is blocked waiting for the next operation.
/// An action already past matching is not preempted; it runs its pipeline
/// and cleanup, and the loop exits afterwards.
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let signal_token = token.clone();

    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                tracing::error!(error = %err, "Failed to install SIGTERM handler");
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(sigint) => sigint,
            Err(err) => {
                tracing::error!(error = %err, "Failed to install SIGINT handler");
                return;
            }
        };

        let received = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        };
        tracing::info!(
            signal = received,
            "Stopping match loop; an in-flight action finishes its cleanup first"
        );
        signal_token.cancel();
    });

    token
}

/// Adapter feeding the cache blob streams from the instance byte-stream
/// surface.
pub struct InstanceBlobSource {
    instance: Arc<dyn Instance>,
}

impl InstanceBlobSource {
    pub fn new(instance: Arc<dyn Instance>) -> Self {
        Self { instance }
    }
}

#[async_trait]
impl BlobSource for InstanceBlobSource {
    async fn open(&self, digest: &Digest) -> std::io::Result<ByteSource> {
        let name = self.instance.blob_name(digest);
        self.instance
            .new_stream_input(&name)
            .await
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))
    }
}

/// The worker: one action at a time, looping on `match_operation` until
/// shut down. Per-action failures are contained; the loop keeps running.
pub struct Worker {
    config: WorkerConfig,
    instance: Arc<dyn Instance>,
    cache: Arc<CasFileCache>,
    root: PathBuf,
}

impl Worker {
    /// Validates the configured root and cache directory and wires the
    /// cache to the instance's blob streams.
    pub fn new(config: WorkerConfig, instance: Arc<dyn Instance>) -> Result<Self> {
        let root = config.validated_root()?;
        let cache_directory = config.validated_cas_cache_directory(&root)?;
        let blobs = Arc::new(InstanceBlobSource::new(Arc::clone(&instance)));
        let cache = Arc::new(CasFileCache::new(
            cache_directory,
            config.cas_cache_max_size_bytes,
            blobs,
        ));
        Ok(Self {
            config,
            instance,
            cache,
            root,
        })
    }

    pub fn cache(&self) -> &Arc<CasFileCache> {
        &self.cache
    }

    /// Match-and-execute loop. Returns when the shutdown token fires.
    pub async fn start(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        self.cache.start().await?;
        tracing::info!(root = %self.root.display(), "Worker started");

        loop {
            let worker = Arc::clone(&self);
            let handler: MatchHandler = Box::new(move |operation| {
                Box::pin(async move {
                    let name = operation.name.clone();
                    match worker.execute_operation(operation).await {
                        Ok(()) => true,
                        Err(err) => {
                            tracing::error!(operation = %name, error = %err, "Action failed");
                            false
                        }
                    }
                })
            });

            tokio::select! {
                _ = shutdown.cancelled() => break,
                matched = self.instance.match_operation(
                    &self.config.platform,
                    self.config.requeue_on_failure,
                    handler,
                ) => {
                    if let Err(err) = matched {
                        tracing::error!(error = %err, "Match failed");
                    }
                }
            }
        }

        tracing::info!("Worker stopped");
        Ok(())
    }

    /// Run one matched operation. The cleanup phase (poller stop, execDir
    /// removal, pin release) runs on every path.
    pub async fn execute_operation(self: &Arc<Self>, operation: Operation) -> Result<()> {
        let operation_name = operation.name.clone();
        let mut poller = Some(OperationPoller::start(
            Arc::clone(&self.instance),
            operation_name.clone(),
            Stage::Queued,
            self.config.operation_poll_period(),
        ));

        let exec_dir = self.root.join(&operation_name);
        let mut pins: Vec<CacheKey> = Vec::new();

        let outcome = self
            .run_action(operation, &exec_dir, &mut pins, &mut poller)
            .await;

        if let Some(poller) = poller.take() {
            poller.stop().await;
        }
        if let Err(err) = tokio::fs::remove_dir_all(&exec_dir).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    operation = %operation_name,
                    error = %err,
                    "Failed to remove execution directory"
                );
            }
        }
        self.cache.update(&pins).await;

        outcome
    }

    async fn run_action(
        &self,
        operation: Operation,
        exec_dir: &Path,
        pins: &mut Vec<CacheKey>,
        poller: &mut Option<OperationPoller>,
    ) -> Result<()> {
        let metadata = operation.metadata.clone();
        let action = Action::decode(&self.instance.get_blob(&metadata.action_digest).await?)?;

        tokio::fs::create_dir_all(exec_dir).await?;

        let materializer = InputMaterializer::new(
            Arc::clone(&self.instance),
            Arc::clone(&self.cache),
            self.config.tree_page_size,
        );
        materializer
            .fetch_inputs(exec_dir, &action.input_root_digest, pins)
            .await?;
        materializer
            .verify_output_locations(exec_dir, &action.output_files, &action.output_directories)
            .await?;

        // QUEUED -> EXECUTING. The queued poller is fully stopped before
        // the executing one starts.
        if let Some(queued_poller) = poller.take() {
            queued_poller.stop().await;
        }
        let executing = Operation {
            name: operation.name.clone(),
            metadata: ExecuteOperationMetadata {
                stage: Stage::Executing,
                ..metadata.clone()
            },
            done: false,
            response: None,
        };
        if !self.instance.put_operation(&executing).await? {
            tracing::info!(
                operation = %operation.name,
                "Queue lost interest, aborting before execution"
            );
            return Ok(());
        }
        *poller = Some(OperationPoller::start(
            Arc::clone(&self.instance),
            operation.name.clone(),
            Stage::Executing,
            self.config.operation_poll_period(),
        ));

        let command = Command::decode(&self.instance.get_blob(&action.command_digest).await?)?;

        let exec_dir = tokio::fs::canonicalize(exec_dir).await?;
        let command_executor = CommandExecutor::new(Arc::clone(&self.instance), &self.config);
        let mut result = command_executor
            .execute(
                &exec_dir,
                &command,
                action.timeout,
                &metadata.stdout_stream_name,
                &metadata.stderr_stream_name,
            )
            .await?;

        if result.exit_code == 0 {
            self.collect_output_files(&exec_dir, &action.output_files, &mut result)
                .await?;
        }

        if !action.do_not_cache {
            self.instance
                .put_action_result(&metadata.action_digest, result.clone())
                .await?;
        }

        // EXECUTING -> COMPLETED.
        if let Some(executing_poller) = poller.take() {
            executing_poller.stop().await;
        }
        let completed = Operation {
            name: operation.name,
            metadata: ExecuteOperationMetadata {
                stage: Stage::Completed,
                ..metadata
            },
            done: true,
            response: Some(ExecuteResponse {
                result,
                cached_result: false,
            }),
        };
        self.instance.put_operation(&completed).await?;
        Ok(())
    }

    /// Read each declared output that exists, apply the file insertion
    /// control, and batch CAS-bound contents into a single `put_all_blobs`.
    async fn collect_output_files(
        &self,
        exec_dir: &Path,
        output_files: &[String],
        result: &mut ActionResult,
    ) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let control = self.config.file_cas_control;
        let mut contents = Vec::new();
        for output_file in output_files {
            let path = exec_dir.join(output_file);
            let content = match tokio::fs::read(&path).await {
                Ok(content) => content,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            let mode = tokio::fs::metadata(&path).await?.permissions().mode();

            let size = content.len() as u64;
            let mut output = OutputFile {
                path: output_file.clone(),
                content: None,
                digest: None,
                is_executable: mode & 0o111 != 0,
            };
            if control.within_limit(size) {
                output.content = Some(content.clone());
            }
            if control.should_insert(size) {
                output.digest = Some(Digest::of(&content));
                contents.push(content);
            }
            result.output_files.push(output);
        }
        self.instance.put_all_blobs(contents).await?;
        Ok(())
    }
}
