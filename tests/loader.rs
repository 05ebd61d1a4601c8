mod common;

use std::{path::Path, sync::Arc};

use bytes::Bytes;
use common::{payload, temp_dir, FakeRemote, MEDIA_KEY};
use media_cache::{
    error::{CacheError, TransferError},
    CacheEntry, FileDataAccess, HttpRemote, Loader, RemoteSource, ReportingDataAccess, Step,
    HEADER_LEN,
};
use mockito::Server;
use rangemap::RangeSet;

const BLOCK_SIZE: u64 = 50;
const SIZE: u64 = 250;

async fn reporting(path: &Path, entry: CacheEntry) -> Arc<ReportingDataAccess> {
    let (data, _) = FileDataAccess::open(path, entry.key(), entry.size(), entry.block_size())
        .await
        .unwrap();

    Arc::new(ReportingDataAccess::new(Arc::new(entry), Box::new(data)))
}

async fn cached_payload(path: &Path) -> Bytes {
    let raw = tokio::fs::read(path).await.unwrap();
    Bytes::from(raw).slice(HEADER_LEN as usize..)
}

#[tokio::test]
async fn test_step_by_step() {
    let temp_dir = temp_dir();
    let path = temp_dir.path().join("clip.data");
    let data = payload(SIZE as usize);

    let remote = Arc::new(FakeRemote::new(data.clone(), 30));
    let access = reporting(&path, CacheEntry::new(MEDIA_KEY, SIZE, BLOCK_SIZE)).await;
    let entry = access.entry().clone();

    let mut loader = Loader::new(access, remote.clone());
    assert_eq!(loader.resume_offset(), 0);

    // Opening the stream writes nothing yet.
    assert_eq!(loader.step().await.unwrap(), Step::Continue);
    assert_eq!(remote.opens(), 1);
    assert_eq!(entry.available_len(), 0);

    for block in 0..entry.block_count() {
        assert_eq!(loader.step().await.unwrap(), Step::Continue);
        assert!(entry.has(block));
        assert_eq!(entry.contiguous_len(), (block + 1) * BLOCK_SIZE);
    }

    assert_eq!(loader.step().await.unwrap(), Step::Done);
    assert_eq!(loader.step().await.unwrap(), Step::Done);
    assert!(entry.is_fully_available());
    assert_eq!(cached_payload(&path).await, data);
}

#[tokio::test]
async fn test_resume_from_first_missing_block() {
    let temp_dir = temp_dir();
    let path = temp_dir.path().join("clip.data");
    let data = payload(SIZE as usize);

    let mut available = RangeSet::new();
    available.insert(0..2);
    available.insert(3..4);
    let entry = CacheEntry::with_available(MEDIA_KEY, SIZE, BLOCK_SIZE, available).unwrap();

    let remote = Arc::new(FakeRemote::new(data.clone(), 64));
    let access = reporting(&path, entry).await;
    let entry = access.entry().clone();

    let loader = Loader::new(access, remote.clone());
    assert_eq!(loader.resume_offset(), 2 * BLOCK_SIZE);
    loader.run().await.unwrap();

    assert_eq!(remote.offsets(), vec![2 * BLOCK_SIZE]);
    assert!(entry.is_fully_available());

    let cached = cached_payload(&path).await;
    assert_eq!(cached.slice(2 * BLOCK_SIZE as usize..), data.slice(2 * BLOCK_SIZE as usize..));
    // The available prefix is not transferred again.
    assert!(cached[..2 * BLOCK_SIZE as usize].iter().all(|b| *b == 0));
}

#[tokio::test]
async fn test_nothing_to_transfer() {
    let temp_dir = temp_dir();
    let remote = Arc::new(FakeRemote::new(Bytes::new(), 10));

    let access = reporting(
        &temp_dir.path().join("empty.data"),
        CacheEntry::new(MEDIA_KEY, 0, BLOCK_SIZE),
    )
    .await;

    let mut loader = Loader::new(access, remote.clone());
    assert_eq!(loader.step().await.unwrap(), Step::Done);
    assert_eq!(remote.opens(), 0);
}

#[tokio::test]
async fn test_premature_end() {
    let temp_dir = temp_dir();
    let path = temp_dir.path().join("clip.data");

    let remote: Arc<dyn RemoteSource> =
        Arc::new(FakeRemote::new(payload(180), 30).unannounced());
    let access = reporting(&path, CacheEntry::new(MEDIA_KEY, SIZE, BLOCK_SIZE)).await;
    let entry = access.entry().clone();

    let err = Loader::new(access, remote).run().await.unwrap_err();
    assert!(matches!(
        err,
        CacheError::Transfer(TransferError::PrematureEnd {
            offset: 180,
            size: SIZE
        })
    ));

    // Whatever arrived completely is kept.
    assert_eq!(entry.contiguous_len(), 3 * BLOCK_SIZE);
    assert!(!entry.has(3));
}

#[tokio::test]
async fn test_length_mismatch() {
    let temp_dir = temp_dir();
    let path = temp_dir.path().join("clip.data");

    let remote: Arc<dyn RemoteSource> = Arc::new(FakeRemote::new(payload(180), 30));
    let access = reporting(&path, CacheEntry::new(MEDIA_KEY, SIZE, BLOCK_SIZE)).await;

    let err = Loader::new(access, remote).run().await.unwrap_err();
    assert!(matches!(
        err,
        CacheError::Transfer(TransferError::LengthMismatch {
            expected: SIZE,
            actual: 180,
            ..
        })
    ));
}

#[tokio::test]
async fn test_resume_not_found() {
    let temp_dir = temp_dir();
    let path = temp_dir.path().join("clip.data");

    let mut server = Server::new_async().await;
    let key = format!("{}/clip.mp4", server.url());

    let mock = server
        .mock("GET", "/clip.mp4")
        .match_header("range", "bytes=4-")
        .with_status(404)
        .expect(1)
        .create_async()
        .await;

    let mut available = RangeSet::new();
    available.insert(0..1);
    let entry = CacheEntry::with_available(key.as_str(), 10, 4, available).unwrap();
    let access = reporting(&path, entry).await;
    let entry = access.entry().clone();
    let before = entry.available_snapshot();

    let mut loader = Loader::new(access, Arc::new(HttpRemote::default()));
    let err = loader.step().await.unwrap_err();

    mock.assert_async().await;
    assert!(matches!(
        err,
        CacheError::Transfer(TransferError::NotFound { .. })
    ));
    assert_eq!(entry.available_snapshot(), before);
}

#[tokio::test]
async fn test_full_response_is_rejected() {
    let temp_dir = temp_dir();
    let path = temp_dir.path().join("clip.data");

    let mut server = Server::new_async().await;
    let key = format!("{}/clip.mp4", server.url());

    // A server ignoring the range would send the start of the resource.
    let _mock = server
        .mock("GET", "/clip.mp4")
        .with_status(200)
        .with_body(payload(10))
        .create_async()
        .await;

    let access = reporting(&path, CacheEntry::new(key.as_str(), 10, 4)).await;
    let entry = access.entry().clone();

    let err = Loader::new(access, Arc::new(HttpRemote::default()))
        .run()
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        CacheError::Transfer(TransferError::UnexpectedStatus { .. })
    ));
    assert_eq!(entry.available_len(), 0);
}
