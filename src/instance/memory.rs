//! In-process instance: an operation queue, CAS, and action cache held in
//! memory. Backs the `memory_instance` config variant so the worker binary
//! runs end-to-end without a remote server, and carries the integration
//! tests.

use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::config::MemoryInstanceConfig;
use crate::digest::Digest;
use crate::error::{Result, WorkerError};
use crate::instance::{ByteSink, ByteSource, Instance, MatchHandler};
use crate::messages::{ActionResult, Directory, Operation, Platform, Stage};

#[derive(Default)]
struct State {
    blobs: HashMap<Digest, Vec<u8>>,
    action_results: HashMap<Digest, ActionResult>,
    queue: VecDeque<Operation>,
    /// Last published operation per name, seeded at dispatch time.
    operations: HashMap<String, Operation>,
    published: Vec<Operation>,
}

pub struct MemoryInstance {
    name: String,
    capacity: usize,
    state: Mutex<State>,
    streams: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    queued: Notify,
}

impl MemoryInstance {
    pub fn new(name: String, config: MemoryInstanceConfig) -> Self {
        Self {
            name,
            capacity: config.operation_queue_capacity,
            state: Mutex::new(State::default()),
            streams: Arc::new(Mutex::new(HashMap::new())),
            queued: Notify::new(),
        }
    }

    pub fn instance_name(&self) -> &str {
        &self.name
    }

    /// Store a blob and return its digest.
    pub fn add_blob(&self, blob: Vec<u8>) -> Digest {
        let digest = Digest::of(&blob);
        self.state.lock().unwrap().blobs.insert(digest.clone(), blob);
        digest
    }

    /// Enqueue an operation for dispatch. Returns false at capacity.
    pub fn queue_operation(&self, operation: Operation) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if state.queue.len() >= self.capacity {
                return false;
            }
            state
                .operations
                .insert(operation.name.clone(), operation.clone());
            state.queue.push_back(operation);
        }
        self.queued.notify_one();
        true
    }

    /// Operations the worker has published, in publication order.
    pub fn published_operations(&self) -> Vec<Operation> {
        self.state.lock().unwrap().published.clone()
    }

    pub fn action_result(&self, action_digest: &Digest) -> Option<ActionResult> {
        self.state
            .lock()
            .unwrap()
            .action_results
            .get(action_digest)
            .cloned()
    }

    /// Bytes forwarded so far to a named output stream.
    pub fn stream_output(&self, name: &str) -> Vec<u8> {
        self.streams
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    fn pop_operation(&self) -> Option<Operation> {
        self.state.lock().unwrap().queue.pop_front()
    }

    fn parse_blob_name(&self, name: &str) -> Result<Digest> {
        let mut parts = name.split('/');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some("blobs"), Some(hash), Some(size), None) => {
                let size_bytes = size
                    .parse::<u64>()
                    .map_err(|_| WorkerError::Internal(format!("bad blob name: {name}")))?;
                Ok(Digest {
                    hash: hash.to_string(),
                    size_bytes,
                })
            }
            _ => Err(WorkerError::Internal(format!("bad blob name: {name}"))),
        }
    }

    /// All directories reachable from the root, breadth first, root first.
    fn collect_tree(&self, root_digest: &Digest) -> Result<Vec<Directory>> {
        let state = self.state.lock().unwrap();
        let mut directories = Vec::new();
        let mut pending = VecDeque::from([root_digest.clone()]);
        let mut seen = std::collections::HashSet::new();
        while let Some(digest) = pending.pop_front() {
            if !seen.insert(digest.clone()) {
                continue;
            }
            let blob = state
                .blobs
                .get(&digest)
                .ok_or_else(|| WorkerError::BlobNotFound(digest.clone()))?;
            let directory = Directory::decode(blob)?;
            for node in &directory.directories {
                pending.push_back(node.digest.clone());
            }
            directories.push(directory);
        }
        Ok(directories)
    }
}

#[async_trait]
impl Instance for MemoryInstance {
    async fn match_operation(
        &self,
        _platform: &Platform,
        requeue_on_failure: bool,
        handler: MatchHandler,
    ) -> Result<()> {
        let operation = loop {
            let notified = self.queued.notified();
            if let Some(operation) = self.pop_operation() {
                break operation;
            }
            notified.await;
        };

        let name = operation.name.clone();
        let handled = handler(operation.clone()).await;
        if !handled && requeue_on_failure {
            tracing::info!(operation = %name, "Requeueing unhandled operation");
            self.queue_operation(operation);
        }
        Ok(())
    }

    async fn get_blob(&self, digest: &Digest) -> Result<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .blobs
            .get(digest)
            .cloned()
            .ok_or_else(|| WorkerError::BlobNotFound(digest.clone()))
    }

    async fn put_blob(&self, blob: Vec<u8>) -> Result<Digest> {
        Ok(self.add_blob(blob))
    }

    async fn put_all_blobs(&self, blobs: Vec<Vec<u8>>) -> Result<Vec<Digest>> {
        Ok(blobs.into_iter().map(|blob| self.add_blob(blob)).collect())
    }

    async fn get_action_result(&self, action_digest: &Digest) -> Result<Option<ActionResult>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .action_results
            .get(action_digest)
            .cloned())
    }

    async fn put_action_result(&self, action_digest: &Digest, result: ActionResult) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .action_results
            .insert(action_digest.clone(), result);
        Ok(())
    }

    async fn get_tree(
        &self,
        root_digest: &Digest,
        page_size: u32,
        page_token: &str,
    ) -> Result<(Vec<Directory>, String)> {
        let directories = self.collect_tree(root_digest)?;
        let start = if page_token.is_empty() {
            0
        } else {
            page_token
                .parse::<usize>()
                .map_err(|_| WorkerError::Internal(format!("bad page token: {page_token}")))?
        };
        let end = if page_size == 0 {
            directories.len()
        } else {
            directories.len().min(start + page_size as usize)
        };
        let next_token = if end < directories.len() {
            end.to_string()
        } else {
            String::new()
        };
        Ok((directories[start.min(end)..end].to_vec(), next_token))
    }

    async fn new_stream_input(&self, name: &str) -> Result<ByteSource> {
        let digest = self.parse_blob_name(name)?;
        let blob = self.get_blob(&digest).await?;
        Ok(Box::new(Cursor::new(blob)))
    }

    async fn get_stream_output(&self, name: &str) -> Result<ByteSink> {
        Ok(Box::new(SharedBufferSink {
            name: name.to_string(),
            streams: Arc::clone(&self.streams),
        }))
    }

    async fn put_operation(&self, operation: &Operation) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let known = state.operations.contains_key(&operation.name);
        if known {
            state
                .operations
                .insert(operation.name.clone(), operation.clone());
            state.published.push(operation.clone());
        }
        Ok(known)
    }

    async fn poll_operation(&self, operation_name: &str, _stage: Stage) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .operations
            .get(operation_name)
            .map(|operation| !operation.done)
            .unwrap_or(false))
    }
}

/// Sink that appends written bytes to a named in-memory stream.
struct SharedBufferSink {
    name: String,
    streams: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl tokio::io::AsyncWrite for SharedBufferSink {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.streams
            .lock()
            .unwrap()
            .entry(self.name.clone())
            .or_default()
            .extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
