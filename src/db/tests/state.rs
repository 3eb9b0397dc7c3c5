use super::*;

#[tokio::test]
async fn test_fresh_store_counts_as_clean() {
    let (db, _dir) = open_store().await;

    assert!(
        !db.was_unclean_shutdown().await.unwrap(),
        "a store that never ran must not report a crash"
    );

    db.close().await;
}

#[tokio::test]
async fn test_shutdown_state_clean_lifecycle() {
    let (db, _dir) = open_store().await;

    db.set_clean_start().await.unwrap();
    assert!(
        db.was_unclean_shutdown().await.unwrap(),
        "running but not yet shut down"
    );

    db.set_clean_shutdown().await.unwrap();
    assert!(!db.was_unclean_shutdown().await.unwrap());

    db.close().await;
}

#[tokio::test]
async fn test_shutdown_state_unclean_detection() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("uplink.db");

    // First session starts but never shuts down cleanly
    {
        let db = Database::new(&path).await.unwrap();
        db.set_clean_start().await.unwrap();
        db.close().await;
    }

    let db = Database::new(&path).await.unwrap();
    assert!(db.was_unclean_shutdown().await.unwrap());

    db.close().await;
}
