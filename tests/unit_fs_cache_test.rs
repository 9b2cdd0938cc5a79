// tests/unit_fs_cache_test.rs

use edgecache::core::storage::fs_cache;
use edgecache::EdgeCacheError;

#[tokio::test]
async fn test_write_creates_intermediate_directories() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("1/2024/05/02/10/30/abc_1.html");
    fs_cache::write_atomic(&path, b"<html>ok</html>").await.unwrap();
    assert_eq!(fs_cache::read(&path).await.unwrap(), b"<html>ok</html>");
}

#[tokio::test]
async fn test_write_leaves_no_temp_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a/artifact.html");
    fs_cache::write_atomic(&path, b"body").await.unwrap();

    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(path.parent().unwrap()).await.unwrap();
    while let Some(entry) = entries.next_entry().await.unwrap() {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    assert_eq!(names, vec!["artifact.html"]);
}

#[tokio::test]
async fn test_write_replaces_existing_content() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("artifact.html");
    fs_cache::write_atomic(&path, b"old").await.unwrap();
    fs_cache::write_atomic(&path, b"new").await.unwrap();
    assert_eq!(fs_cache::read(&path).await.unwrap(), b"new");
}

#[tokio::test]
async fn test_read_missing_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let err = fs_cache::read(&dir.path().join("absent.html")).await.unwrap_err();
    assert!(matches!(err, EdgeCacheError::NotFound));
}

#[tokio::test]
async fn test_delete_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("artifact.html");
    fs_cache::write_atomic(&path, b"body").await.unwrap();
    fs_cache::delete(&path).await.unwrap();
    // Second delete of a missing file is still success.
    fs_cache::delete(&path).await.unwrap();
    assert!(matches!(
        fs_cache::read(&path).await.unwrap_err(),
        EdgeCacheError::NotFound
    ));
}
