use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{CountingBroker, ScriptedSource, content, granted_ticket, read_all, seeded_provider};
use crate::auth::CredentialManager;
use crate::entry::{Drive, Entry};
use crate::error::Error;
use crate::event::ChangeKind;
use crate::fs::FileSystem;
use crate::provider::Provider;

fn seeded_fs() -> FileSystem {
    FileSystem::new(Arc::new(seeded_provider()))
}

#[tokio::test]
async fn test_separator_styles_share_one_cache_slot() {
    let fs = seeded_fs();
    let cancel = CancellationToken::new();

    let first = fs.directory("docs|", false, &cancel).await.unwrap().unwrap();
    let second = fs.directory("\\docs", false, &cancel).await.unwrap().unwrap();
    let third = fs.directory("/docs/", false, &cancel).await.unwrap().unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert!(Arc::ptr_eq(&first, &third));
}

#[tokio::test]
async fn test_listing_edits_mirror_into_single_cache() {
    let fs = seeded_fs();
    let cancel = CancellationToken::new();

    let listing = fs.directories("", &cancel).await.unwrap();
    assert_eq!(listing.len(), 2);

    // An entry inserted into a live listing becomes individually fetchable
    // without a provider round trip.
    let extra = Arc::new(Entry::directory("extra", "extra"));
    listing.insert(extra.clone());
    let fetched = fs.directory("extra", false, &cancel).await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&fetched, &extra));

    // Removal evicts the mirrored slot again.
    listing.remove_where(|d| d.id() == "extra");
    assert!(fs.directory("extra", false, &cancel).await.unwrap().is_none());
}

#[tokio::test]
async fn test_write_file_roundtrip_and_replace() {
    let fs = seeded_fs();
    let cancel = CancellationToken::new();

    let files = fs.files("docs", &cancel).await.unwrap();
    assert_eq!(files.len(), 1);

    fs.write_file("docs", Entry::file("new.txt", "new.txt"), content(b"data"), &cancel)
        .await
        .unwrap();
    assert_eq!(files.len(), 2);
    let body = read_all(fs.open_file("docs/new.txt", &cancel).await.unwrap()).await;
    assert_eq!(body, b"data");

    // A re-upload replaces the row instead of duplicating it.
    fs.write_file("docs", Entry::file("new.txt", "new.txt"), content(b"data2"), &cancel)
        .await
        .unwrap();
    assert_eq!(files.len(), 2);
    let body = read_all(fs.open_file("docs/new.txt", &cancel).await.unwrap()).await;
    assert_eq!(body, b"data2");
}

#[tokio::test]
async fn test_delete_file_routes_into_trash_listing() {
    let provider = seeded_provider().with_trash("trash");
    let fs = FileSystem::new(Arc::new(provider));
    let cancel = CancellationToken::new();

    let docs_files = fs.files("docs", &cancel).await.unwrap();
    let trash_files = fs.files("trash", &cancel).await.unwrap();
    assert_eq!((docs_files.len(), trash_files.len()), (1, 0));

    let deleted = fs.delete_file("docs/notes.txt", true, &cancel).await.unwrap();
    assert!(deleted.is_some());
    assert_eq!((docs_files.len(), trash_files.len()), (0, 1));

    assert!(fs.file("docs/notes.txt", false, &cancel).await.unwrap().is_none());
    let body = read_all(fs.open_file("trash/notes.txt", &cancel).await.unwrap()).await;
    assert_eq!(body, b"hello");
}

#[tokio::test]
async fn test_move_directory_transfers_cache_rows() {
    let fs = seeded_fs();
    let cancel = CancellationToken::new();

    let root = fs.directories("", &cancel).await.unwrap();
    let pics = fs.directories("pics", &cancel).await.unwrap();
    assert_eq!((root.len(), pics.len()), (2, 0));

    fs.move_directory("docs", "pics", None, &cancel).await.unwrap();

    assert_eq!((root.len(), pics.len()), (1, 1));
    assert!(fs.directory("pics/docs", false, &cancel).await.unwrap().is_some());
    assert!(fs.directory("docs", false, &cancel).await.unwrap().is_none());

    // The file moved along with its directory.
    let body = read_all(fs.open_file("pics/docs/notes.txt", &cancel).await.unwrap()).await;
    assert_eq!(body, b"hello");
}

#[tokio::test]
async fn test_cannot_move_into_current_parent() {
    let fs = seeded_fs();
    let cancel = CancellationToken::new();

    assert!(!fs.can_move_file("docs/notes.txt", "docs", &cancel).await.unwrap());
    assert!(!fs.can_move_directory("docs", "", &cancel).await.unwrap());
    let error = fs.move_directory("docs", "", None, &cancel).await.unwrap_err();
    assert!(matches!(error, Error::Usage(_)));
}

#[tokio::test]
async fn test_counts_patched_on_write_and_delete() {
    let provider = seeded_provider().with_counts();
    provider.add_directory("", Entry::directory("counted", "counted").with_count(0));
    let fs = FileSystem::new(Arc::new(provider));
    let cancel = CancellationToken::new();

    // Keep the root listing alive so the patched entry stays cached.
    let root = fs.directories("", &cancel).await.unwrap();
    assert!(root.find(|d| d.id() == "counted").is_some());

    fs.write_file("counted", Entry::file("a.txt", "a.txt"), content(b"a"), &cancel)
        .await
        .unwrap();
    let counted = fs.directory("counted", false, &cancel).await.unwrap().unwrap();
    assert_eq!(counted.count(), Some(1));

    fs.delete_file("counted/a.txt", false, &cancel).await.unwrap();
    let counted = fs.directory("counted", false, &cancel).await.unwrap().unwrap();
    assert_eq!(counted.count(), Some(0));
}

#[tokio::test]
async fn test_change_events_report_each_mutation() {
    let fs = seeded_fs();
    let cancel = CancellationToken::new();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in_listener = seen.clone();
    fs.on_changed(move |event| {
        seen_in_listener
            .lock()
            .unwrap()
            .push((event.kind(), event.id().to_string()));
    });

    fs.create_directory("", Entry::directory("new", "new"), &cancel).await.unwrap();
    fs.write_file("new", Entry::file("a.txt", "a.txt"), content(b"a"), &cancel)
        .await
        .unwrap();
    fs.move_file("new/a.txt", "docs", None, &cancel).await.unwrap();
    fs.delete_directory("new", false, &cancel).await.unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(
        *seen,
        vec![
            (ChangeKind::DirectoryCreated, "new".to_string()),
            (ChangeKind::FileWritten, "new/a.txt".to_string()),
            (ChangeKind::FileMoved, "docs/a.txt".to_string()),
            (ChangeKind::DirectoryDeleted, "new".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_change_listener_defers_completion() {
    let fs = seeded_fs();
    let cancel = CancellationToken::new();

    let durable = Arc::new(AtomicBool::new(false));
    let durable_in_listener = durable.clone();
    fs.on_changed(move |event| {
        let deferral = event.deferral().unwrap();
        let durable = durable_in_listener.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            durable.store(true, Ordering::SeqCst);
            deferral.complete();
        });
    });

    fs.create_directory("", Entry::directory("new", "new"), &cancel).await.unwrap();

    // The operation waited for the listener's spawned work.
    assert!(durable.load(Ordering::SeqCst));
}

/// A provider that overrides nothing; every capability defaults to false.
struct InertProvider;

#[async_trait]
impl Provider for InertProvider {}

#[tokio::test]
async fn test_defaults_gate_every_mutation() {
    let fs = FileSystem::new(Arc::new(InertProvider));
    let cancel = CancellationToken::new();

    let error = fs.open_file("a.txt", &cancel).await.map(|_| ()).unwrap_err();
    assert!(matches!(error, Error::Usage(_)));
    let error = fs
        .write_file("", Entry::file("a.txt", "a.txt"), content(b"a"), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(error, Error::Usage(_)));
    let error = fs
        .create_directory("", Entry::directory("d", "d"), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(error, Error::Usage(_)));
    let error = fs.search("", "query", &cancel).await.unwrap_err();
    assert!(matches!(error, Error::Usage(_)));

    // Reads are not gated; an inert provider just reports nothing.
    assert!(fs.directories("", &cancel).await.unwrap().is_empty());
    assert!(fs.directory("d", false, &cancel).await.unwrap().is_none());
}

#[tokio::test]
async fn test_exists_and_drive() {
    let provider = seeded_provider().with_drive(Drive::new(Some(10), Some(100), Some(5)));
    let fs = FileSystem::new(Arc::new(provider));
    let cancel = CancellationToken::new();

    assert!(fs.exists_directory("", &cancel).await.unwrap());
    assert!(fs.exists_directory("docs", &cancel).await.unwrap());
    assert!(!fs.exists_directory("nope", &cancel).await.unwrap());

    let drive = fs.drive(&cancel).await.unwrap().unwrap();
    assert_eq!(drive.available(), Some(90));
}

#[tokio::test]
async fn test_thumbnail_and_link_capabilities_follow_entry() {
    let provider = seeded_provider();
    provider.add_file(
        "pics",
        Entry::file("photo.jpg", "photo.jpg")
            .with_thumbnail("https://example.test/thumb.jpg")
            .with_link("https://example.test/photo.jpg"),
        b"jpeg",
    );
    let fs = FileSystem::new(Arc::new(provider));
    let cancel = CancellationToken::new();

    assert!(fs.can_open_file_thumbnail("pics/photo.jpg", &cancel).await.unwrap());
    assert!(!fs.can_open_file_thumbnail("docs/notes.txt", &cancel).await.unwrap());
    assert!(!fs.can_open_file_thumbnail("missing", &cancel).await.unwrap());

    // No entry or no thumbnail URL short-circuits before any fetch.
    assert!(fs.open_file_thumbnail("missing", &cancel).await.unwrap().is_none());
    assert!(fs.open_file_thumbnail("docs/notes.txt", &cancel).await.unwrap().is_none());

    assert!(fs.can_file_link("pics/photo.jpg", &cancel).await.unwrap());
    let link = fs.file_link("pics/photo.jpg", &cancel).await.unwrap();
    assert_eq!(link.as_deref(), Some("https://example.test/photo.jpg"));
    assert!(fs.file_link("docs/notes.txt", &cancel).await.unwrap().is_none());
}

#[tokio::test]
async fn test_check_access_reuses_credentials() {
    let source = ScriptedSource::new(vec![]);
    let broker = Arc::new(CountingBroker::new(granted_ticket(&["read"])));
    let manager = Arc::new(CredentialManager::new(Arc::new(source), broker.clone()));
    let fs = FileSystem::with_credentials(Arc::new(seeded_provider()), manager);
    let cancel = CancellationToken::new();

    assert!(fs.check_access("docs", true, &cancel).await.unwrap());
    assert!(fs.check_access("docs", true, &cancel).await.unwrap());
    assert_eq!(broker.logins.load(Ordering::SeqCst), 1);

    // Invalidation forces a fresh authentication next time.
    fs.invalidate_access("docs").await.unwrap();
    assert!(fs.check_access("docs", true, &cancel).await.unwrap());
    assert_eq!(broker.logins.load(Ordering::SeqCst), 2);

    // Without a prompt allowance the denied state surfaces as false-path
    // error rather than a silent prompt.
    fs.invalidate_access("docs").await.unwrap();
    let error = fs.check_access("docs", false, &cancel).await.unwrap_err();
    assert!(error.is_access_denied());
}
