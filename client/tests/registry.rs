use feed_client::{EntityMetadata, Registry, UpsertOutcome};
use feed_core::{events::EntityStatus, LogLayout};
use std::path::PathBuf;

fn registry() -> Registry {
    Registry::new(LogLayout::new("/data/logs", "/data/logs/closed"))
}

#[test]
fn entity_lifecycle_from_first_sighting_to_closure() {
    let mut r = registry();

    let first = r.upsert("1.201", Some(0), Some(EntityStatus::Open), 1_000);
    assert_eq!(
        first,
        UpsertOutcome {
            is_new: true,
            version_changed: false,
            just_closed: false
        }
    );
    assert_eq!(r.refresh_queue_mut().take(10), vec!["1.201".to_string()]);

    let bumped = r.upsert("1.201", Some(5), Some(EntityStatus::Open), 2_000);
    assert!(bumped.version_changed);
    assert!(!bumped.is_new);
    assert!(r.refresh_queue().contains("1.201"));
    r.refresh_queue_mut().take(10);

    let closed = r.upsert("1.201", Some(5), Some(EntityStatus::Closed), 3_000);
    assert!(closed.just_closed);
    assert_eq!(r.get("1.201").unwrap().closed_at, Some(3_000));
    assert_eq!(r.pending_archive().to_vec(), vec!["1.201".to_string()]);

    let late = r.upsert("1.201", Some(6), None, 4_000);
    assert_eq!(late, UpsertOutcome::default());
    assert!(r.refresh_queue().is_empty(), "closed entities are not re-enriched");
    assert_eq!(r.get("1.201").unwrap().version, 5);
}

#[test]
fn repeated_update_is_idempotent() {
    let mut r = registry();
    r.upsert("1.7", Some(3), Some(EntityStatus::Open), 10);
    let again = r.upsert("1.7", Some(3), Some(EntityStatus::Open), 20);
    assert_eq!(again, UpsertOutcome::default());
    assert_eq!(r.get("1.7").unwrap().last_update, 20);
    assert_eq!(r.refresh_queue().len(), 1);
}

#[test]
fn close_is_reported_once() {
    let mut r = registry();
    r.upsert("1.8", None, Some(EntityStatus::Open), 0);
    assert!(r.upsert("1.8", None, Some(EntityStatus::Closed), 1).just_closed);
    assert!(!r.upsert("1.8", None, Some(EntityStatus::Closed), 2).just_closed);
    r.upsert("1.8", None, Some(EntityStatus::Open), 3);
    assert_eq!(r.get("1.8").unwrap().status, EntityStatus::Closed);
    assert_eq!(r.get("1.8").unwrap().closed_at, Some(1));
    assert_eq!(r.pending_archive().len(), 1);
}

#[test]
fn closing_update_with_version_bump_does_not_requeue() {
    let mut r = registry();
    r.upsert("1.9", Some(1), None, 0);
    r.refresh_queue_mut().take(10);
    let out = r.upsert("1.9", Some(2), Some(EntityStatus::Closed), 1);
    assert!(out.just_closed);
    assert!(!out.version_changed);
    assert!(r.refresh_queue().is_empty());
}

#[test]
fn archival_waits_for_grace_period() {
    let mut r = registry();
    r.upsert("1.1", None, Some(EntityStatus::Closed), 1_000);
    r.upsert("1.2", None, Some(EntityStatus::Closed), 8_000);

    assert!(r.drain_archivable(5_000, 10_000).is_empty());

    let tasks = r.drain_archivable(12_000, 10_000);
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].entity_id, "1.1");
    assert_eq!(tasks[0].source, PathBuf::from("/data/logs/11.txt"));
    assert_eq!(tasks[0].archive, PathBuf::from("/data/logs/closed/11.txt"));
    assert!(r.get("1.1").is_none());
    assert!(r.get("1.2").is_some());

    let tasks = r.drain_archivable(18_000, 10_000);
    assert_eq!(tasks.len(), 1);
    assert!(r.is_empty());
}

#[test]
fn metadata_applies_only_to_tracked_entities() {
    let mut r = registry();
    r.upsert("1.3", Some(1), None, 0);
    let meta = EntityMetadata {
        name: Some("2m Hcap".into()),
        start_time: Some("2024-01-01T13:30:00.000Z".into()),
        status: None,
    };
    assert_eq!(
        r.apply_metadata("1.3", meta.clone(), 50),
        Some(PathBuf::from("/data/logs/13.txt"))
    );
    let e = r.get("1.3").unwrap();
    assert!(!e.needs_refresh);
    assert_eq!(e.metadata.as_ref(), Some(&meta));
    assert!(r.refresh_queue().is_empty());

    assert_eq!(r.apply_metadata("9.99", meta, 60), None);
}
