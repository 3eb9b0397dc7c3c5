use crate::db::*;
use crate::types::Priority;
use tempfile::TempDir;

mod artifacts;
mod state;

/// Open a fresh store inside a temp dir (keep the dir alive for the test)
async fn open_store() -> (Database, TempDir) {
    let dir = TempDir::new().unwrap();
    let db = Database::new(&dir.path().join("uplink.db")).await.unwrap();
    (db, dir)
}

fn new_artifact(name: &str, priority: Priority, created_at: i64) -> NewArtifact {
    NewArtifact {
        name: name.to_string(),
        source: format!("/data/out/{}", name),
        payload_path: format!("/data/out/{}", name).into(),
        owns_payload: false,
        size_bytes: 1024,
        checksum: crate::utils::sha256_bytes(name.as_bytes()),
        priority,
        created_at,
    }
}
