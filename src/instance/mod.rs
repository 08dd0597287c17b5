//! The remote instance surface the worker consumes.
//!
//! The worker never inspects the concrete transport: everything it needs
//! from the server (operation matching, blob and tree fetches, byte
//! streams, action-cache writes, operation publication, liveness polling)
//! is expressed on the [`Instance`] trait and consumed through
//! `Arc<dyn Instance>`.

pub mod memory;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::digest::Digest;
use crate::error::Result;
use crate::messages::{ActionResult, Directory, Operation, Platform, Stage};

pub use memory::MemoryInstance;

/// Byte stream for reading a blob out of the CAS.
pub type ByteSource = Box<dyn tokio::io::AsyncRead + Send + Unpin>;

/// Byte sink for live-forwarding captured std-stream output.
pub type ByteSink = Box<dyn tokio::io::AsyncWrite + Send + Unpin>;

/// Callback invoked with the one operation a `match_operation` call yields.
/// Returns whether the worker handled it, so the queue can requeue failures.
pub type MatchHandler = Box<dyn FnOnce(Operation) -> BoxFuture<'static, bool> + Send>;

#[async_trait]
pub trait Instance: Send + Sync {
    /// Block until the server dispatches one operation, then run the handler.
    async fn match_operation(
        &self,
        platform: &Platform,
        requeue_on_failure: bool,
        handler: MatchHandler,
    ) -> Result<()>;

    async fn get_blob(&self, digest: &Digest) -> Result<Vec<u8>>;

    async fn put_blob(&self, blob: Vec<u8>) -> Result<Digest>;

    async fn put_all_blobs(&self, blobs: Vec<Vec<u8>>) -> Result<Vec<Digest>>;

    async fn get_action_result(&self, action_digest: &Digest) -> Result<Option<ActionResult>>;

    async fn put_action_result(&self, action_digest: &Digest, result: ActionResult) -> Result<()>;

    /// One page of the directory tree rooted at `root_digest`. Returns the
    /// page of directories and the next page token, empty when exhausted.
    async fn get_tree(
        &self,
        root_digest: &Digest,
        page_size: u32,
        page_token: &str,
    ) -> Result<(Vec<Directory>, String)>;

    async fn new_stream_input(&self, name: &str) -> Result<ByteSource>;

    async fn get_stream_output(&self, name: &str) -> Result<ByteSink>;

    /// Publish an updated operation. A false return means the queue has lost
    /// interest in it.
    async fn put_operation(&self, operation: &Operation) -> Result<bool>;

    /// Assert continued ownership of an operation at a stage. A false return
    /// means the queue has disowned the operation.
    async fn poll_operation(&self, operation_name: &str, stage: Stage) -> Result<bool>;

    /// Byte-stream name for reading the blob with this digest.
    fn blob_name(&self, digest: &Digest) -> String {
        format!("blobs/{}/{}", digest.hash, digest.size_bytes)
    }
}
