use bytes::Bytes;
use chunkport::config::Limits;
use chunkport::error::UploadError;
use chunkport::session::{CompleteRequest, InitRequest, UploadService};
use chunkport::store::{ChunkStore, UploadSession};
use chunkport::temp_area::TempArea;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tempfile::TempDir;

const MIB: u64 = 1024 * 1024;

fn setup(limits: Limits) -> (UploadService, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let temp = TempArea::new(dir.path().join("temp")).unwrap();
    let service = UploadService::new(ChunkStore::in_memory(), temp, limits, "http://localhost:8080");
    (service, dir)
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

fn init_req(filename: &str, size: usize) -> InitRequest {
    InitRequest {
        filename: filename.to_string(),
        size: size as i64,
        temp_identifier: "draft_42".to_string(),
        mime_type: Some("image/png".to_string()),
    }
}

fn complete_req(upload_id: &str) -> CompleteRequest {
    CompleteRequest {
        upload_id: upload_id.to_string(),
        sha256: None,
    }
}

fn chunk(data: &[u8], index: usize, chunk_size: usize) -> Bytes {
    let start = index * chunk_size;
    let end = (start + chunk_size).min(data.len());
    Bytes::copy_from_slice(&data[start..end])
}

/// Files currently in the temp area for `draft_42`, excluding sidecars.
async fn temp_files(service: &UploadService) -> Vec<String> {
    service
        .temp_area()
        .list("draft_42")
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.filename)
        .collect()
}

#[tokio::test]
async fn test_twelve_mib_scenario() {
    let (service, _dir) = setup(Limits::default());
    let data = pattern(12 * MIB as usize);
    let cs = 5 * MIB as usize;

    let init = service.init(init_req("holiday.PNG", data.len())).await.unwrap();
    assert_eq!(init.total_chunks, 3);
    assert_eq!(init.chunk_size, 5 * MIB);
    assert_eq!(init.max_bytes, 40 * MIB);

    service.put_chunk(&init.upload_id, 0, chunk(&data, 0, cs)).await.unwrap();
    service.put_chunk(&init.upload_id, 2, chunk(&data, 2, cs)).await.unwrap();

    let status = service.status(&init.upload_id).await.unwrap();
    assert_eq!(status.uploaded_chunks, vec![0, 2]);
    assert_eq!(status.total_chunks, 3);

    service.put_chunk(&init.upload_id, 1, chunk(&data, 1, cs)).await.unwrap();
    let done = service.complete(complete_req(&init.upload_id)).await.unwrap();

    assert_eq!(done.original_filename, "holiday.PNG");
    assert!(done.path.starts_with("draft_42/"));
    assert!(done.path.ends_with(".png"));
    assert_eq!(done.size_bytes, data.len() as u64);
    assert_eq!(done.url, format!("http://localhost:8080/attachments/temp/{}", done.path));

    let (scope, name) = done.path.split_once('/').unwrap();
    let stored = service.temp_area().read(scope, name).await.unwrap().unwrap();
    assert!(stored == data);
    assert_eq!(done.sha256.as_deref(), Some(hex::encode(Sha256::digest(&data)).as_str()));

    // Session is consumed
    assert!(matches!(service.status(&init.upload_id).await, Err(UploadError::NotFound)));
}

#[tokio::test]
async fn test_round_trip_small_chunks() {
    let (service, _dir) = setup(Limits::new(4096, 100).unwrap());
    let data = pattern(1001);

    let init = service.init(init_req("notes.txt", data.len())).await.unwrap();
    assert_eq!(init.total_chunks, 11);
    for i in 0..11 {
        service.put_chunk(&init.upload_id, i, chunk(&data, i as usize, 100)).await.unwrap();
    }
    let done = service.complete(complete_req(&init.upload_id)).await.unwrap();
    assert_eq!(done.size_bytes, 1001);

    let (scope, name) = done.path.split_once('/').unwrap();
    assert_eq!(service.temp_area().read(scope, name).await.unwrap().unwrap(), data);
}

#[tokio::test]
async fn test_reverse_order_assembles_identically() {
    let (service, _dir) = setup(Limits::new(4096, 64).unwrap());
    let data = pattern(300);

    let forward = service.init(init_req("a.bin", data.len())).await.unwrap();
    let reverse = service.init(init_req("a.bin", data.len())).await.unwrap();
    for i in 0..5 {
        service.put_chunk(&forward.upload_id, i, chunk(&data, i as usize, 64)).await.unwrap();
    }
    for i in (0..5).rev() {
        service.put_chunk(&reverse.upload_id, i, chunk(&data, i as usize, 64)).await.unwrap();
    }

    let a = service.complete(complete_req(&forward.upload_id)).await.unwrap();
    let b = service.complete(complete_req(&reverse.upload_id)).await.unwrap();
    assert_ne!(a.path, b.path);
    assert_eq!(a.sha256, b.sha256);

    let (sa, na) = a.path.split_once('/').unwrap();
    let (sb, nb) = b.path.split_once('/').unwrap();
    let area = service.temp_area();
    assert_eq!(area.read(sa, na).await.unwrap(), area.read(sb, nb).await.unwrap());
}

#[tokio::test]
async fn test_chunk_rewrite_last_write_wins() {
    let (service, _dir) = setup(Limits::new(4096, 4).unwrap());
    let init = service.init(init_req("x.bin", 8)).await.unwrap();

    service.put_chunk(&init.upload_id, 0, Bytes::from_static(b"AAAA")).await.unwrap();
    service.put_chunk(&init.upload_id, 0, Bytes::from_static(b"BBBB")).await.unwrap();
    service.put_chunk(&init.upload_id, 1, Bytes::from_static(b"CCCC")).await.unwrap();

    let status = service.status(&init.upload_id).await.unwrap();
    assert_eq!(status.uploaded_chunks, vec![0, 1]);

    let done = service.complete(complete_req(&init.upload_id)).await.unwrap();
    let (scope, name) = done.path.split_once('/').unwrap();
    assert_eq!(service.temp_area().read(scope, name).await.unwrap().unwrap(), b"BBBBCCCC");
}

#[tokio::test]
async fn test_missing_chunk_conflict() {
    let (service, _dir) = setup(Limits::new(4096, 10).unwrap());
    let data = pattern(25);
    let init = service.init(init_req("x.bin", data.len())).await.unwrap();

    service.put_chunk(&init.upload_id, 0, chunk(&data, 0, 10)).await.unwrap();
    service.put_chunk(&init.upload_id, 1, chunk(&data, 1, 10)).await.unwrap();

    let err = service.complete(complete_req(&init.upload_id)).await.unwrap_err();
    match &err {
        UploadError::MissingChunks { missing } => assert_eq!(missing, &vec![2]),
        other => panic!("expected missing chunks, got {other:?}"),
    }
    assert_eq!(err.status().as_u16(), 409);
    assert!(temp_files(&service).await.is_empty());

    // Designed recovery: send the missing chunk and complete again
    service.put_chunk(&init.upload_id, 2, chunk(&data, 2, 10)).await.unwrap();
    assert!(service.complete(complete_req(&init.upload_id)).await.is_ok());
}

#[tokio::test]
async fn test_size_mismatch_leaves_no_file() {
    let (service, _dir) = setup(Limits::new(4096, 10).unwrap());
    let init = service.init(init_req("x.bin", 20)).await.unwrap();

    service.put_chunk(&init.upload_id, 0, Bytes::from(pattern(10))).await.unwrap();
    service.put_chunk(&init.upload_id, 1, Bytes::from(pattern(7))).await.unwrap();

    let err = service.complete(complete_req(&init.upload_id)).await.unwrap_err();
    assert_eq!(err.reason(), "size_mismatch");
    assert_eq!(err.status().as_u16(), 422);
    assert!(temp_files(&service).await.is_empty());
    assert!(service.temp_area().list_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_digest_mismatch_keeps_session() {
    let (service, _dir) = setup(Limits::new(4096, 10).unwrap());
    let data = pattern(15);
    let init = service.init(init_req("x.bin", data.len())).await.unwrap();
    service.put_chunk(&init.upload_id, 0, chunk(&data, 0, 10)).await.unwrap();
    service.put_chunk(&init.upload_id, 1, chunk(&data, 1, 10)).await.unwrap();

    let err = service
        .complete(CompleteRequest {
            upload_id: init.upload_id.clone(),
            sha256: Some("00".repeat(32)),
        })
        .await
        .unwrap_err();
    assert_eq!(err.reason(), "digest_mismatch");
    assert!(temp_files(&service).await.is_empty());

    let status = service.status(&init.upload_id).await.unwrap();
    assert_eq!(status.uploaded_chunks, vec![0, 1]);

    let good = service
        .complete(CompleteRequest {
            upload_id: init.upload_id.clone(),
            sha256: Some(hex::encode(Sha256::digest(&data)).to_uppercase()),
        })
        .await
        .unwrap();
    assert_eq!(good.size_bytes, 15);
}

#[tokio::test]
async fn test_unsafe_ids_are_not_found() {
    let (service, _dir) = setup(Limits::default());
    for id in ["../etc", "..%2F..", "a/b", "", "a b", "ok\0", &"x".repeat(500)] {
        assert!(matches!(service.status(id).await, Err(UploadError::NotFound)), "status {id:?}");
        assert!(
            matches!(service.put_chunk(id, 0, Bytes::from_static(b"x")).await, Err(UploadError::NotFound)),
            "chunk {id:?}"
        );
        assert!(
            matches!(service.complete(complete_req(id)).await, Err(UploadError::NotFound)),
            "complete {id:?}"
        );
    }
}

#[tokio::test]
async fn test_init_validation() {
    let (service, _dir) = setup(Limits::new(1000, 100).unwrap());

    let too_big = service.init(init_req("a.bin", 1001)).await.unwrap_err();
    assert_eq!(too_big.reason(), "file_too_large");

    let mut req = init_req("a.bin", 0);
    assert_eq!(service.init(req.clone()).await.unwrap_err().reason(), "invalid_size");
    req.size = -5;
    assert_eq!(service.init(req).await.unwrap_err().reason(), "invalid_size");

    let blank = service.init(init_req("   ", 10)).await.unwrap_err();
    assert_eq!(blank.reason(), "invalid_filename");

    let mut bad_scope = init_req("a.bin", 10);
    bad_scope.temp_identifier = "../x".into();
    assert_eq!(service.init(bad_scope).await.unwrap_err().reason(), "invalid_temp_identifier");
}

#[tokio::test]
async fn test_chunk_index_out_of_range() {
    let (service, _dir) = setup(Limits::new(1000, 10).unwrap());
    let init = service.init(init_req("a.bin", 25)).await.unwrap();

    for index in [-1, 3, 100] {
        let err = service
            .put_chunk(&init.upload_id, index, Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "chunk_index_out_of_range");
        assert_eq!(err.status().as_u16(), 422);
    }

    let err = service
        .put_chunk(&init.upload_id, 0, Bytes::from(vec![0u8; 11]))
        .await
        .unwrap_err();
    assert_eq!(err.reason(), "chunk_too_large");
}

#[tokio::test]
async fn test_abort_removes_session() {
    let (service, _dir) = setup(Limits::new(1000, 10).unwrap());
    let init = service.init(init_req("a.bin", 20)).await.unwrap();
    service.put_chunk(&init.upload_id, 0, Bytes::from(pattern(10))).await.unwrap();

    service.abort(&init.upload_id).await.unwrap();
    assert!(matches!(service.status(&init.upload_id).await, Err(UploadError::NotFound)));
    assert!(matches!(service.abort(&init.upload_id).await, Err(UploadError::NotFound)));
}

#[tokio::test]
async fn test_stale_sessions_are_swept() {
    let (service, _dir) = setup(Limits::new(1000, 10).unwrap());
    let fresh = service.init(init_req("a.bin", 20)).await.unwrap();

    let old = UploadSession {
        upload_id: "abandoned-session".into(),
        original_filename: "old.bin".into(),
        size_bytes: 20,
        temp_identifier: "draft_42".into(),
        mime_type: None,
        chunk_size: 10,
        total_chunks: 2,
        created_at: chrono::Utc::now() - chrono::Duration::hours(48),
    };
    service.chunk_store().create_session(&old).await.unwrap();
    service
        .chunk_store()
        .put_chunk(&old.upload_id, 0, Bytes::from(pattern(10)))
        .await
        .unwrap();

    let removed = service.sweep_stale_sessions(Duration::from_secs(24 * 3600)).await.unwrap();
    assert_eq!(removed, 1);
    assert!(matches!(service.status(&old.upload_id).await, Err(UploadError::NotFound)));
    assert!(service.status(&fresh.upload_id).await.is_ok());
    assert!(service.metrics().render().contains("chunkport_sessions_swept_total 1"));
}

#[tokio::test]
async fn test_local_backend_removes_session_directories() {
    let dir = tempfile::tempdir().unwrap();
    let chunk_root = dir.path().join("chunks");
    let temp = TempArea::new(dir.path().join("temp")).unwrap();
    let service = UploadService::new(
        ChunkStore::local(&chunk_root).unwrap(),
        temp,
        Limits::new(1000, 10).unwrap(),
        "http://localhost:8080",
    );
    let data = pattern(25);

    // Completed
    let done = service.init(init_req("a.bin", data.len())).await.unwrap();
    for i in 0..3 {
        service.put_chunk(&done.upload_id, i, chunk(&data, i as usize, 10)).await.unwrap();
    }
    assert!(chunk_root.join(&done.upload_id).is_dir());
    service.complete(complete_req(&done.upload_id)).await.unwrap();
    assert!(!chunk_root.join(&done.upload_id).exists());

    // Aborted
    let aborted = service.init(init_req("b.bin", data.len())).await.unwrap();
    service.put_chunk(&aborted.upload_id, 1, chunk(&data, 1, 10)).await.unwrap();
    service.abort(&aborted.upload_id).await.unwrap();
    assert!(!chunk_root.join(&aborted.upload_id).exists());

    // An emptied directory left behind by an older run is swept
    std::fs::create_dir_all(chunk_root.join("leftover-session")).unwrap();
    let removed = service.sweep_stale_sessions(Duration::from_secs(3600)).await.unwrap();
    assert_eq!(removed, 1);
    assert!(!chunk_root.join("leftover-session").exists());
    assert!(service.chunk_store().list_session_ids().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_single_shot_matches_chunked_contract() {
    let (service, _dir) = setup(Limits::new(1000, 10).unwrap());

    let done = service
        .upload_single("draft_42", "Scan 01.JPEG", b"jpeg-bytes", Some("image/jpeg".into()))
        .await
        .unwrap();
    assert_eq!(done.original_filename, "Scan 01.JPEG");
    assert!(done.path.starts_with("draft_42/"));
    assert!(done.path.ends_with(".jpeg"));
    assert_eq!(done.size_bytes, 10);

    let too_big = service
        .upload_single("draft_42", "big.bin", &pattern(1001), None)
        .await
        .unwrap_err();
    assert_eq!(too_big.reason(), "file_too_large");

    let empty = service.upload_single("draft_42", "e.bin", b"", None).await.unwrap_err();
    assert_eq!(empty.reason(), "invalid_size");
}

#[tokio::test]
async fn test_temp_area_sweep() {
    let (service, _dir) = setup(Limits::default());
    service
        .upload_single("draft_42", "a.txt", b"hello", None)
        .await
        .unwrap();

    assert_eq!(service.sweep_temp_area(Duration::from_secs(3600)).await.unwrap(), 0);
    assert_eq!(temp_files(&service).await.len(), 1);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(service.sweep_temp_area(Duration::ZERO).await.unwrap(), 1);
    assert!(temp_files(&service).await.is_empty());
}
