use async_trait::async_trait;
use bytes::Bytes;
use chunkport::client::{
    ByteProgress, EngineOptions, FileSource, LocalTransport, ProgressCallback, UploadEngine, UploadFile,
    UploadStatus, UploadTransport,
};
use chunkport::client::transport::PROGRESS_SLICE;
use chunkport::client::HttpTransport;
use chunkport::config::Limits;
use chunkport::editor::{HttpPreloader, ImagePreloader};
use chunkport::error::ClientError;
use chunkport::session::{
    AttachmentResponse, CompleteRequest, InitRequest, InitResponse, StatusResponse, UploadService,
};
use chunkport::store::ChunkStore;
use chunkport::temp_area::TempArea;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, Semaphore};

/// Wraps the in-process transport with scripted failures, delays and
/// call bookkeeping.
struct ScriptedTransport {
    inner: LocalTransport,
    init_calls: AtomicUsize,
    chunk_calls: Mutex<Vec<u64>>,
    /// Remaining injected failures per chunk index
    failures: Mutex<HashMap<u64, usize>>,
    /// Store the chunk before reporting the injected failure
    lose_response: bool,
    delay: Option<Duration>,
    /// Announces each chunk and waits for a permit before sending it
    gate: Option<(mpsc::UnboundedSender<u64>, Arc<Semaphore>)>,
}

impl ScriptedTransport {
    fn new(service: UploadService) -> Self {
        Self {
            inner: LocalTransport::new(service),
            init_calls: AtomicUsize::new(0),
            chunk_calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            lose_response: false,
            delay: None,
            gate: None,
        }
    }

    fn fail_chunk(self, index: u64, times: usize) -> Self {
        self.failures.lock().unwrap().insert(index, times);
        self
    }

    fn chunk_calls(&self) -> Vec<u64> {
        self.chunk_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl UploadTransport for ScriptedTransport {
    async fn init(&self, req: &InitRequest) -> Result<InitResponse, ClientError> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.init(req).await
    }

    async fn status(&self, upload_id: &str) -> Result<StatusResponse, ClientError> {
        self.inner.status(upload_id).await
    }

    async fn upload_chunk(
        &self,
        upload_id: &str,
        chunk_index: u64,
        data: Bytes,
        progress: ByteProgress,
    ) -> Result<(), ClientError> {
        self.chunk_calls.lock().unwrap().push(chunk_index);
        if let Some((announce, permits)) = &self.gate {
            let _ = announce.send(chunk_index);
            permits.acquire().await.unwrap().forget();
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let fail = {
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(&chunk_index) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    true
                }
                _ => false,
            }
        };
        if fail {
            if self.lose_response {
                self.inner.upload_chunk(upload_id, chunk_index, data, progress).await?;
            }
            return Err(ClientError::Network("connection reset".into()));
        }
        self.inner.upload_chunk(upload_id, chunk_index, data, progress).await
    }

    async fn complete(&self, req: &CompleteRequest) -> Result<AttachmentResponse, ClientError> {
        self.inner.complete(req).await
    }
}

fn setup_service(limits: Limits) -> (UploadService, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let temp = TempArea::new(dir.path().join("temp")).unwrap();
    (
        UploadService::new(ChunkStore::in_memory(), temp, limits, "http://files.local"),
        dir,
    )
}

fn options(limits: Limits) -> EngineOptions {
    EngineOptions {
        limits,
        retry_backoff: Duration::from_millis(1),
        ..EngineOptions::default()
    }
}

fn file(len: usize) -> UploadFile {
    let data: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
    UploadFile::new("photo.png", Some("image/png".into()), FileSource::from_bytes(data))
}

fn recorder() -> (ProgressCallback, Arc<Mutex<Vec<u8>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (Arc::new(move |p| sink.lock().unwrap().push(p)), seen)
}

#[tokio::test]
async fn test_uploads_all_chunks_and_reports_progress() {
    let limits = Limits::new(1000, 10).unwrap();
    let (service, _dir) = setup_service(limits);
    let transport = Arc::new(ScriptedTransport::new(service.clone()));
    let engine = UploadEngine::new(transport.clone(), options(limits));

    let id = engine.add(file(35), "draft_1").unwrap();
    assert_eq!(engine.task(id).unwrap().status, UploadStatus::Pending);
    assert_eq!(engine.task(id).unwrap().total_chunks, 4);

    let (on_progress, seen) = recorder();
    let done = engine.upload(id, on_progress).await.unwrap();

    assert_eq!(done.original_filename, "photo.png");
    assert_eq!(done.size_bytes, 35);
    assert!(done.path.starts_with("draft_1/") && done.path.ends_with(".png"));
    assert_eq!(transport.chunk_calls(), vec![0, 1, 2, 3]);

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.first(), Some(&0));
    assert_eq!(seen.last(), Some(&100));
    assert!(seen.windows(2).all(|w| w[0] < w[1]), "{seen:?}");

    let task = engine.task(id).unwrap();
    assert_eq!(task.status, UploadStatus::Done);
    assert_eq!(task.progress_percent, 100);
    assert_eq!(task.uploaded_chunks.len(), 4);
}

#[tokio::test]
async fn test_resume_uploads_only_missing_chunks() {
    let limits = Limits::new(1000, 10).unwrap();
    let (service, _dir) = setup_service(limits);
    let source = file(30);

    // A previous attempt got chunks 0 and 2 through
    let init = service
        .init(InitRequest {
            filename: "photo.png".into(),
            size: 30,
            temp_identifier: "draft_1".into(),
            mime_type: None,
        })
        .await
        .unwrap();
    for index in [0u64, 2] {
        let data = source.source.slice(index * 10..index * 10 + 10).await.unwrap();
        service.put_chunk(&init.upload_id, index as i64, data).await.unwrap();
    }

    let transport = Arc::new(ScriptedTransport::new(service.clone()));
    let engine = UploadEngine::new(transport.clone(), options(limits));
    let id = engine.add(source, "draft_1").unwrap();

    let (on_progress, seen) = recorder();
    let done = engine.resume(id, &init.upload_id, on_progress).await.unwrap();

    assert_eq!(transport.chunk_calls(), vec![1]);
    assert_eq!(transport.init_calls.load(Ordering::SeqCst), 0);
    assert_eq!(done.size_bytes, 30);

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.first(), Some(&67));
    assert_eq!(seen.last(), Some(&100));
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let limits = Limits::new(1000, 10).unwrap();
    let (service, _dir) = setup_service(limits);
    let transport = Arc::new(ScriptedTransport::new(service).fail_chunk(1, 2));
    let engine = UploadEngine::new(transport.clone(), options(limits));

    let id = engine.add(file(25), "draft_1").unwrap();
    let (on_progress, _) = recorder();
    engine.upload(id, on_progress).await.unwrap();

    assert_eq!(transport.chunk_calls(), vec![0, 1, 1, 1, 2]);
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_file() {
    let limits = Limits::new(1000, 10).unwrap();
    let (service, _dir) = setup_service(limits);
    let transport = Arc::new(ScriptedTransport::new(service).fail_chunk(1, 3));
    let engine = UploadEngine::new(transport.clone(), options(limits));

    let id = engine.add(file(25), "draft_1").unwrap();
    let (on_progress, _) = recorder();
    let err = engine.upload(id, on_progress).await.unwrap_err();

    match err {
        ClientError::ChunkFailed { index, attempts, .. } => {
            assert_eq!(index, 1);
            assert_eq!(attempts, 3);
        }
        other => panic!("expected chunk failure, got {other:?}"),
    }
    assert_eq!(transport.chunk_calls(), vec![0, 1, 1, 1]);
    assert_eq!(engine.task(id).unwrap().status, UploadStatus::Failed);
}

#[tokio::test]
async fn test_retry_skips_chunk_that_landed() {
    let limits = Limits::new(1000, 10).unwrap();
    let (service, _dir) = setup_service(limits);
    let mut transport = ScriptedTransport::new(service).fail_chunk(0, 1);
    transport.lose_response = true;
    let transport = Arc::new(transport);
    let engine = UploadEngine::new(transport.clone(), options(limits));

    let id = engine.add(file(15), "draft_1").unwrap();
    let (on_progress, _) = recorder();
    engine.upload(id, on_progress).await.unwrap();

    // Status showed chunk 0 after the lost response, so it was not re-sent
    assert_eq!(transport.chunk_calls(), vec![0, 1]);
}

#[tokio::test]
async fn test_admission_rejects_before_any_request() {
    let limits = Limits::new(100, 10).unwrap();
    let (service, _dir) = setup_service(limits);
    let transport = Arc::new(ScriptedTransport::new(service));
    let engine = UploadEngine::new(transport.clone(), options(limits));

    match engine.add(file(101), "draft_1") {
        Err(ClientError::TooLarge { size, max }) => {
            assert_eq!(size, 101);
            assert_eq!(max, 100);
        }
        other => panic!("expected TooLarge, got {:?}", other.map(|_| ())),
    }
    assert!(matches!(engine.add(file(0), "draft_1"), Err(ClientError::Empty)));
    assert!(engine.is_empty());
    assert_eq!(transport.init_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unknown_session_is_not_retried() {
    let limits = Limits::new(1000, 10).unwrap();
    let (service, _dir) = setup_service(limits);
    let transport = Arc::new(ScriptedTransport::new(service));
    let engine = UploadEngine::new(transport.clone(), options(limits));

    let id = engine.add(file(25), "draft_1").unwrap();
    let (on_progress, _) = recorder();
    let err = engine.resume(id, "does-not-exist", on_progress).await.unwrap_err();

    assert!(err.is_not_found());
    assert!(transport.chunk_calls().is_empty());
    assert_eq!(engine.task(id).unwrap().status, UploadStatus::Failed);
}

#[tokio::test]
async fn test_remove_stops_scheduling_chunks() {
    let limits = Limits::new(1000, 10).unwrap();
    let (service, _dir) = setup_service(limits);
    let (announce, mut announced) = mpsc::unbounded_channel();
    let permits = Arc::new(Semaphore::new(0));
    let mut transport = ScriptedTransport::new(service);
    transport.gate = Some((announce, permits.clone()));
    let transport = Arc::new(transport);
    let engine = Arc::new(UploadEngine::new(transport.clone(), options(limits)));

    let id = engine.add(file(30), "draft_1").unwrap();
    let running = {
        let engine = engine.clone();
        let (on_progress, _) = recorder();
        tokio::spawn(async move { engine.upload(id, on_progress).await })
    };

    assert_eq!(announced.recv().await, Some(0));
    assert!(engine.remove(id));
    assert!(engine.task(id).is_none());
    // The in-flight chunk is allowed to finish
    permits.add_permits(10);

    let result = running.await.unwrap();
    assert!(matches!(result, Err(ClientError::Cancelled)));
    assert_eq!(transport.chunk_calls(), vec![0]);
    assert!(!engine.remove(id));
}

#[tokio::test(start_paused = true)]
async fn test_deadline_bounds_whole_upload() {
    let limits = Limits::new(1000, 10).unwrap();
    let (service, _dir) = setup_service(limits);
    let mut transport = ScriptedTransport::new(service);
    transport.delay = Some(Duration::from_secs(30));
    let transport = Arc::new(transport);

    let engine = UploadEngine::new(
        transport,
        EngineOptions {
            deadline: Some(Duration::from_secs(5)),
            ..options(limits)
        },
    );
    let id = engine.add(file(25), "draft_1").unwrap();
    let (on_progress, _) = recorder();
    let err = engine.upload(id, on_progress).await.unwrap_err();

    assert!(matches!(err, ClientError::DeadlineExceeded(d) if d == Duration::from_secs(5)));
    assert_eq!(engine.task(id).unwrap().status, UploadStatus::Failed);
}

/// Serves the upload routes on an ephemeral local port and returns its base URL.
async fn spawn_server(limits: Limits) -> (String, TempDir) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());

    let dir = tempfile::tempdir().unwrap();
    let temp = TempArea::new(dir.path().join("temp")).unwrap();
    let service = UploadService::new(ChunkStore::in_memory(), temp, limits, base_url.clone());
    let app = chunkport::api::routes(service);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (base_url, dir)
}

#[tokio::test]
async fn test_http_transport_streams_byte_progress() {
    let chunk_size = 4 * PROGRESS_SLICE as u64;
    let limits = Limits::new(16 * chunk_size, chunk_size).unwrap();
    let (base_url, _dir) = spawn_server(limits).await;

    let engine = UploadEngine::new(Arc::new(HttpTransport::new(&base_url).unwrap()), options(limits));
    // Two full chunks and a short third one
    let len = 2 * chunk_size as usize + PROGRESS_SLICE + 100;
    let original = file(len);
    let expected = original.source.slice(0..len as u64).await.unwrap();

    let id = engine.add(original, "draft_http").unwrap();
    let (on_progress, seen) = recorder();
    let done = engine.upload(id, on_progress).await.unwrap();
    assert_eq!(done.size_bytes, len as u64);
    assert!(done.url.starts_with(&format!("{base_url}/attachments/temp/draft_http/")));

    let seen = seen.lock().unwrap().clone();
    assert!(seen.windows(2).all(|w| w[0] < w[1]), "{seen:?}");
    assert_eq!(seen.last(), Some(&100));
    // Percent after the first slice of chunk 0, well before the chunk ends
    let first_slice = (PROGRESS_SLICE as f64 * 100.0 / len as f64).round() as u8;
    let first_chunk = (chunk_size as f64 * 100.0 / len as f64).round() as u8;
    assert!(first_slice < first_chunk);
    assert!(seen.contains(&first_slice), "{seen:?}");

    // The returned URL serves the assembled bytes
    let preloader = HttpPreloader::new().unwrap();
    let served = preloader.fetch(&done.url).await.unwrap();
    assert_eq!(served, expected);
}

#[tokio::test]
async fn test_http_preloader_resolves_for_served_and_missing_urls() {
    let limits = Limits::new(1000, 10).unwrap();
    let (base_url, _dir) = spawn_server(limits).await;
    let engine = UploadEngine::new(Arc::new(HttpTransport::new(&base_url).unwrap()), options(limits));

    let id = engine.add(file(25), "draft_http").unwrap();
    let (on_progress, _) = recorder();
    let done = engine.upload(id, on_progress).await.unwrap();

    let preloader = HttpPreloader::new().unwrap();
    tokio::time::timeout(Duration::from_secs(5), preloader.preload(&done.url))
        .await
        .unwrap();
    assert_eq!(preloader.fetch(&done.url).await.unwrap().len(), 25);

    let missing = format!("{base_url}/attachments/temp/draft_http/missing.png");
    assert!(preloader.fetch(&missing).await.is_err());
    // A failed load still resolves
    tokio::time::timeout(Duration::from_secs(5), preloader.preload(&missing))
        .await
        .unwrap();
}
