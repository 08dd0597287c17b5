use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use farmhand::cache::{BlobSource, CacheError, CasFileCache};
use farmhand::digest::Digest;
use farmhand::instance::ByteSource;

/// Blob source over a fixed map, counting opens and optionally delaying
/// them to widen race windows.
struct CountingSource {
    blobs: HashMap<Digest, Vec<u8>>,
    opens: AtomicUsize,
    delay: Option<Duration>,
}

impl CountingSource {
    fn new(contents: &[&[u8]], delay: Option<Duration>) -> (Arc<Self>, Vec<Digest>) {
        let mut blobs = HashMap::new();
        let mut digests = Vec::new();
        for content in contents {
            let digest = Digest::of(content);
            blobs.insert(digest.clone(), content.to_vec());
            digests.push(digest);
        }
        (
            Arc::new(Self {
                blobs,
                opens: AtomicUsize::new(0),
                delay,
            }),
            digests,
        )
    }
}

#[async_trait]
impl BlobSource for CountingSource {
    async fn open(&self, digest: &Digest) -> std::io::Result<ByteSource> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let blob = self
            .blobs
            .get(digest)
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, digest.to_string()))?;
        Ok(Box::new(Cursor::new(blob.clone())) as ByteSource)
    }
}

/// Source that serves bytes whose digest never matches the request.
struct CorruptSource;

#[async_trait]
impl BlobSource for CorruptSource {
    async fn open(&self, _digest: &Digest) -> std::io::Result<ByteSource> {
        Ok(Box::new(Cursor::new(b"corrupted bytes".to_vec())) as ByteSource)
    }
}

#[tokio::test]
async fn mismatched_fetch_is_rejected_and_unreserved() {
    let dir = tempfile::tempdir().unwrap();
    let cache = CasFileCache::new(
        dir.path().to_path_buf(),
        1 << 20,
        Arc::new(CorruptSource) as Arc<dyn BlobSource>,
    );
    cache.start().await.unwrap();

    let wanted = Digest::of(b"what was actually requested");
    let err = cache.put(&wanted, false).await.unwrap_err();
    assert!(matches!(err, CacheError::ContentMismatch { .. }));

    // The reservation was released and no entry or temp file survived.
    assert_eq!(cache.used_bytes().await, 0);
    let mut leftovers = std::fs::read_dir(dir.path()).unwrap();
    assert!(leftovers.next().is_none());

    // The rejection is not sticky: a later put retries the fetch.
    let err = cache.put(&wanted, false).await.unwrap_err();
    assert!(matches!(err, CacheError::ContentMismatch { .. }));
}

#[tokio::test]
async fn concurrent_puts_fetch_once() {
    let dir = tempfile::tempdir().unwrap();
    let (source, digests) = CountingSource::new(&[b"contended"], Some(Duration::from_millis(50)));
    let cache = Arc::new(CasFileCache::new(
        dir.path().to_path_buf(),
        1 << 20,
        Arc::clone(&source) as Arc<dyn BlobSource>,
    ));
    cache.start().await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let cache = Arc::clone(&cache);
        let digest = digests[0].clone();
        handles.push(tokio::spawn(
            async move { cache.put(&digest, false).await },
        ));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(source.opens.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn repin_after_release_does_not_refetch() {
    let dir = tempfile::tempdir().unwrap();
    let (source, digests) = CountingSource::new(&[b"sticky"], None);
    let cache = CasFileCache::new(
        dir.path().to_path_buf(),
        1 << 20,
        Arc::clone(&source) as Arc<dyn BlobSource>,
    );
    cache.start().await.unwrap();

    let key = cache.put(&digests[0], false).await.unwrap();
    cache.update(&[key.clone()]).await;
    let again = cache.put(&digests[0], false).await.unwrap();
    assert_eq!(key, again);
    cache.update(&[again]).await;

    assert_eq!(source.opens.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn put_then_release_leaves_resident_total_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let (source, digests) = CountingSource::new(&[b"aaaa", b"bb"], None);
    let cache = CasFileCache::new(
        dir.path().to_path_buf(),
        1 << 20,
        Arc::clone(&source) as Arc<dyn BlobSource>,
    );
    cache.start().await.unwrap();

    let a = cache.put(&digests[0], false).await.unwrap();
    cache.update(&[a]).await;
    let before = cache.used_bytes().await;

    // Pin and release an already-present entry: no change in residency.
    let key = cache.put(&digests[0], false).await.unwrap();
    cache.update(&[key]).await;
    assert_eq!(cache.used_bytes().await, before);

    // A new entry grows residency by exactly its size.
    let b = cache.put(&digests[1], false).await.unwrap();
    cache.update(&[b]).await;
    assert_eq!(cache.used_bytes().await, before + 2);
}

#[tokio::test]
async fn budget_holds_at_every_quiescent_point() {
    let dir = tempfile::tempdir().unwrap();
    let (source, digests) =
        CountingSource::new(&[b"eight by", b"eight bi", b"eight bu"], None);
    let cache = CasFileCache::new(
        dir.path().to_path_buf(),
        16,
        Arc::clone(&source) as Arc<dyn BlobSource>,
    );
    cache.start().await.unwrap();

    for digest in &digests {
        let key = cache.put(digest, false).await.unwrap();
        cache.update(&[key]).await;
        assert!(cache.used_bytes().await <= 16);
    }
}

#[tokio::test]
async fn release_order_drives_eviction_order() {
    let dir = tempfile::tempdir().unwrap();
    let (source, digests) =
        CountingSource::new(&[b"one.", b"two.", b"three..."], None);
    let cache = CasFileCache::new(
        dir.path().to_path_buf(),
        8,
        Arc::clone(&source) as Arc<dyn BlobSource>,
    );
    cache.start().await.unwrap();

    let one = cache.put(&digests[0], false).await.unwrap();
    let two = cache.put(&digests[1], false).await.unwrap();
    // Release `two` first, then `one`: `two` is the older candidate.
    cache.update(&[two.clone()]).await;
    cache.update(&[one.clone()]).await;

    // Eight bytes incoming evicts both, oldest first; the files go too.
    let three = cache.put(&digests[2], false).await.unwrap();
    assert!(!cache.path(&two).exists());
    assert!(!cache.path(&one).exists());
    assert!(cache.path(&three).exists());
    assert_eq!(cache.used_bytes().await, 8);
}
