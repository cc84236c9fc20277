use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use super::*;
use crate::state::data::NewImageRecord;
use crate::state::library::Library;
use crate::test_support::{FakeObjects, FlakyRecords};

fn new_record(n: usize) -> NewImageRecord {
    NewImageRecord {
        storage_path: format!("photo-{:02}.jpg", n),
        author: "Marina".to_string(),
        moment: Utc::now(),
    }
}

async fn seeded_library(count: usize) -> Arc<Library> {
    let library = Arc::new(Library::open_in_memory().unwrap());
    for n in 0..count {
        library.insert_record(new_record(n)).await.unwrap();
    }
    library
}

fn loader(library: &Arc<Library>, objects: &Arc<FakeObjects>) -> PageLoader {
    let records: Arc<dyn RecordStore> = library.clone();
    let objects: Arc<dyn ObjectStore> = objects.clone();
    PageLoader::new(records, objects)
}

fn item(n: usize) -> TimelineItem {
    let now = Utc::now();
    TimelineItem {
        record: ImageRecord {
            id: Uuid::new_v4(),
            storage_path: format!("rt-{}.jpg", n),
            author: "Daniel".to_string(),
            moment: now,
            created_at: now + chrono::Duration::seconds(n as i64),
        },
        url: format!("mem://rt-{}.jpg", n),
    }
}

fn ids(items: &[TimelineItem]) -> Vec<Uuid> {
    items.iter().map(|i| i.id()).collect()
}

fn initial_loaded(timeline: &mut Timeline, page: Page) {
    let request = timeline.begin_initial();
    timeline.apply(TimelineEvent::PageLoaded {
        request,
        result: Ok(page),
    });
}

// ── PageLoader ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_pages_of_ten_over_twenty_five_records() {
    let library = seeded_library(25).await;
    let objects = Arc::new(FakeObjects::new());
    let loader = loader(&library, &objects);

    let first = loader.load_page(None).await.unwrap();
    assert_eq!(first.items.len(), 10);
    assert!(first.has_more);

    let second = loader
        .load_page(Some(first.items.last().unwrap().created_at()))
        .await
        .unwrap();
    assert_eq!(second.items.len(), 10);
    assert!(second.has_more);

    let third = loader
        .load_page(Some(second.items.last().unwrap().created_at()))
        .await
        .unwrap();
    assert_eq!(third.items.len(), 5);
    assert!(!third.has_more);

    // Gap-free, duplicate-free, strictly descending traversal of everything
    let all: Vec<_> = first
        .items
        .iter()
        .chain(&second.items)
        .chain(&third.items)
        .collect();
    let unique: HashSet<_> = all.iter().map(|i| i.id()).collect();
    assert_eq!(unique.len(), 25);
    assert!(all.windows(2).all(|w| w[0].created_at() > w[1].created_at()));

    let everything = library.query_page(None, 100).await.unwrap();
    let traversed: Vec<_> = all.iter().map(|i| i.id()).collect();
    let expected: Vec<_> = everything.iter().map(|r| r.id).collect();
    assert_eq!(traversed, expected);
}

#[tokio::test]
async fn test_one_signing_round_trip_per_page() {
    let library = seeded_library(15).await;
    let objects = Arc::new(FakeObjects::new());
    let loader = loader(&library, &objects);

    let page = loader.load_page(None).await.unwrap();
    assert_eq!(objects.batch_calls(), 1);
    assert_eq!(objects.sign_calls(), 0);

    for item in &page.items {
        assert_eq!(item.url, format!("mem://{}", item.record.storage_path));
    }
}

#[tokio::test]
async fn test_exact_page_has_no_more() {
    let library = seeded_library(10).await;
    let objects = Arc::new(FakeObjects::new());
    let page = loader(&library, &objects).load_page(None).await.unwrap();
    assert_eq!(page.items.len(), 10);
    assert!(!page.has_more);
}

#[tokio::test]
async fn test_empty_store_gives_empty_page() {
    let library = seeded_library(0).await;
    let objects = Arc::new(FakeObjects::new());
    let page = loader(&library, &objects).load_page(None).await.unwrap();
    assert!(page.items.is_empty());
    assert!(!page.has_more);
}

#[tokio::test]
async fn test_unbounded_page_size_loads_everything() {
    let library = seeded_library(3).await;
    let objects = Arc::new(FakeObjects::new());
    let page = loader(&library, &objects)
        .with_page_size(usize::MAX)
        .load_page(None)
        .await
        .unwrap();
    assert_eq!(page.items.len(), 3);
    assert!(!page.has_more);
}

#[tokio::test]
async fn test_load_page_propagates_query_failure() {
    let records = Arc::new(FlakyRecords::new(Library::open_in_memory().unwrap()));
    records.set_failing(true);
    let objects: Arc<dyn ObjectStore> = Arc::new(FakeObjects::new());
    let loader = PageLoader::new(records, objects);

    assert!(loader.load_page(None).await.is_err());
}

#[tokio::test]
async fn test_load_page_propagates_signing_failure() {
    let library = seeded_library(3).await;
    let objects = Arc::new(FakeObjects::unsignable(&["photo-01.jpg"]));
    let err = loader(&library, &objects).load_page(None).await.unwrap_err();
    assert!(matches!(err, Error::ObjectNotFound(_)));
}

// ── Timeline reducer ────────────────────────────────────────────────────

#[test]
fn test_initial_load_sets_cursor_and_flags() {
    let mut timeline = Timeline::new();
    let page = Page {
        items: vec![item(3), item(2), item(1)],
        has_more: true,
    };
    let last = page.items[2].created_at();

    let request = timeline.begin_initial();
    let outcome = timeline.apply(TimelineEvent::PageLoaded {
        request,
        result: Ok(page),
    });

    assert_eq!(outcome, ApplyOutcome::Replaced { count: 3 });
    assert!(timeline.initial_loaded());
    assert!(timeline.has_more());
    assert_eq!(timeline.cursor(), Some(last));
}

#[test]
fn test_failed_initial_load_still_unblocks() {
    let mut timeline = Timeline::new();
    let request = timeline.begin_initial();
    let outcome = timeline.apply(TimelineEvent::PageLoaded {
        request,
        result: Err(Error::Validation("boom".to_string())),
    });

    assert_eq!(outcome, ApplyOutcome::LoadFailed { kind: PageKind::Initial });
    assert!(timeline.initial_loaded());
    assert!(timeline.is_empty());
    assert!(!timeline.has_more());
    assert_eq!(timeline.begin_load_more(), None);
}

#[test]
fn test_load_more_guard() {
    let mut timeline = Timeline::new();
    // Nothing before the initial load completes
    assert_eq!(timeline.begin_load_more(), None);

    initial_loaded(
        &mut timeline,
        Page {
            items: vec![item(2), item(1)],
            has_more: true,
        },
    );

    let request = timeline.begin_load_more().unwrap();
    assert_eq!(request.kind, PageKind::More);
    assert_eq!(request.cursor, timeline.cursor());
    assert!(timeline.is_loading_more());

    // One in flight at a time
    assert_eq!(timeline.begin_load_more(), None);

    timeline.apply(TimelineEvent::PageLoaded {
        request,
        result: Ok(Page {
            items: vec![item(0)],
            has_more: false,
        }),
    });
    assert!(!timeline.is_loading_more());

    // Nothing left to load
    assert_eq!(timeline.begin_load_more(), None);
}

#[test]
fn test_load_more_appends_and_moves_cursor() {
    let mut timeline = Timeline::new();
    initial_loaded(
        &mut timeline,
        Page {
            items: vec![item(5), item(4)],
            has_more: true,
        },
    );

    let older = vec![item(3), item(2)];
    let last = older[1].created_at();
    let request = timeline.begin_load_more().unwrap();
    let outcome = timeline.apply(TimelineEvent::PageLoaded {
        request,
        result: Ok(Page {
            items: older,
            has_more: true,
        }),
    });

    assert_eq!(outcome, ApplyOutcome::Appended { added: 2, duplicates: 0 });
    assert_eq!(timeline.len(), 4);
    assert_eq!(timeline.cursor(), Some(last));
    assert!(timeline.has_more());
}

#[test]
fn test_load_more_skips_items_already_merged_by_realtime() {
    let mut timeline = Timeline::new();
    initial_loaded(
        &mut timeline,
        Page {
            items: vec![item(5), item(4)],
            has_more: true,
        },
    );

    let raced = item(3);
    let generation = timeline.generation();
    timeline.apply(TimelineEvent::Inserted {
        generation,
        item: raced.clone(),
    });

    let request = timeline.begin_load_more().unwrap();
    let outcome = timeline.apply(TimelineEvent::PageLoaded {
        request,
        result: Ok(Page {
            items: vec![raced, item(2)],
            has_more: false,
        }),
    });

    assert_eq!(outcome, ApplyOutcome::Appended { added: 1, duplicates: 1 });
    let unique: HashSet<_> = ids(timeline.items()).into_iter().collect();
    assert_eq!(unique.len(), timeline.len());
    assert_eq!(timeline.len(), 4);
}

#[test]
fn test_failed_load_more_leaves_state() {
    let mut timeline = Timeline::new();
    initial_loaded(
        &mut timeline,
        Page {
            items: vec![item(2), item(1)],
            has_more: true,
        },
    );
    let before = timeline.snapshot();
    let cursor = timeline.cursor();

    let request = timeline.begin_load_more().unwrap();
    let outcome = timeline.apply(TimelineEvent::PageLoaded {
        request,
        result: Err(Error::Validation("offline".to_string())),
    });

    assert_eq!(outcome, ApplyOutcome::LoadFailed { kind: PageKind::More });
    assert_eq!(timeline.snapshot(), before);
    assert_eq!(timeline.cursor(), cursor);

    // The guard is released so the guest can try again
    assert!(timeline.begin_load_more().is_some());
}

#[test]
fn test_realtime_duplicate_keeps_length() {
    let mut timeline = Timeline::new();
    let existing = item(1);
    initial_loaded(
        &mut timeline,
        Page {
            items: vec![existing.clone()],
            has_more: false,
        },
    );

    let generation = timeline.generation();
    let outcome = timeline.apply(TimelineEvent::Inserted {
        generation,
        item: existing,
    });

    assert_eq!(outcome, ApplyOutcome::Skipped(SkipReason::AlreadyPresent));
    assert_eq!(timeline.len(), 1);
}

#[test]
fn test_realtime_new_item_goes_first() {
    let mut timeline = Timeline::new();
    initial_loaded(
        &mut timeline,
        Page {
            items: vec![item(3), item(2), item(1)],
            has_more: false,
        },
    );
    let before = ids(timeline.items());
    let cursor = timeline.cursor();

    let fresh = item(10);
    let generation = timeline.generation();
    let outcome = timeline.apply(TimelineEvent::Inserted {
        generation,
        item: fresh.clone(),
    });

    assert_eq!(outcome, ApplyOutcome::Prepended);
    assert_eq!(timeline.len(), 4);
    assert_eq!(timeline.items()[0], fresh);
    assert_eq!(ids(&timeline.items()[1..]), before);
    assert_eq!(timeline.cursor(), cursor);
}

#[test]
fn test_realtime_before_initial_page_is_kept() {
    let mut timeline = Timeline::new();
    let request = timeline.begin_initial();

    // Arrives while the first page is in flight; the page may or may not contain it
    let early = item(20);
    let overlapping = item(19);
    let generation = timeline.generation();
    timeline.apply(TimelineEvent::Inserted {
        generation,
        item: early.clone(),
    });
    timeline.apply(TimelineEvent::Inserted {
        generation,
        item: overlapping.clone(),
    });

    timeline.apply(TimelineEvent::PageLoaded {
        request,
        result: Ok(Page {
            items: vec![overlapping.clone(), item(5)],
            has_more: false,
        }),
    });

    assert_eq!(timeline.len(), 3);
    assert_eq!(timeline.items()[0], early);
    assert_eq!(timeline.items()[1], overlapping);
}

#[test]
fn test_nothing_applies_after_close() {
    let mut timeline = Timeline::new();
    initial_loaded(
        &mut timeline,
        Page {
            items: vec![item(2), item(1)],
            has_more: true,
        },
    );
    let request = timeline.begin_load_more().unwrap();
    let generation = timeline.generation();
    let before = timeline.snapshot();

    timeline.close();

    let stale_page = timeline.apply(TimelineEvent::PageLoaded {
        request,
        result: Ok(Page {
            items: vec![item(0)],
            has_more: false,
        }),
    });
    let late_insert = timeline.apply(TimelineEvent::Inserted {
        generation,
        item: item(9),
    });

    assert_eq!(stale_page, ApplyOutcome::Skipped(SkipReason::Closed));
    assert_eq!(late_insert, ApplyOutcome::Skipped(SkipReason::Closed));
    assert_eq!(timeline.items(), before.items.as_slice());
    assert_eq!(timeline.begin_load_more(), None);
}

#[test]
fn test_stale_generation_is_discarded() {
    let mut timeline = Timeline::new();
    let mut request = timeline.begin_initial();
    request.generation += 1;

    let outcome = timeline.apply(TimelineEvent::PageLoaded {
        request,
        result: Ok(Page {
            items: vec![item(1)],
            has_more: false,
        }),
    });
    assert_eq!(outcome, ApplyOutcome::Skipped(SkipReason::Stale));
    assert!(!timeline.initial_loaded());
}

// ── TimelineHandle ──────────────────────────────────────────────────────

async fn wait_until(
    rx: &mut watch::Receiver<TimelineSnapshot>,
    condition: impl FnMut(&TimelineSnapshot) -> bool,
) -> TimelineSnapshot {
    let snapshot = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(condition))
        .await
        .expect("timed out waiting for timeline")
        .expect("timeline task ended");
    snapshot.clone()
}

#[tokio::test]
async fn test_handle_loads_pages_on_demand() {
    let library = seeded_library(25).await;
    let objects = Arc::new(FakeObjects::new());
    let handle = TimelineHandle::spawn(loader(&library, &objects));
    let mut rx = handle.watch();

    let first = wait_until(&mut rx, |s| s.initial_loaded).await;
    assert_eq!(first.items.len(), 10);
    assert!(first.has_more);

    handle.request_more();
    wait_until(&mut rx, |s| s.items.len() == 20 && !s.loading_more).await;

    let outcome = handle.load_more().await;
    assert_eq!(outcome, Some(ApplyOutcome::Appended { added: 5, duplicates: 0 }));
    let last = handle.snapshot();
    assert_eq!(last.items.len(), 25);
    assert!(!last.has_more);

    // Further requests are ignored
    assert_eq!(handle.load_more().await, None);
    handle.close().await.unwrap();
    assert_eq!(rx.borrow().items.len(), 25);
}

#[tokio::test]
async fn test_handle_merges_realtime_inserts() {
    let library = seeded_library(12).await;
    let objects = Arc::new(FakeObjects::new());
    let handle = TimelineHandle::spawn(loader(&library, &objects));
    let mut rx = handle.watch();

    let before = wait_until(&mut rx, |s| s.initial_loaded).await;

    let inserted = library.insert_record(new_record(99)).await.unwrap();
    let after = wait_until(&mut rx, |s| s.items.len() == before.items.len() + 1).await;

    assert_eq!(after.items[0].record, inserted);
    assert_eq!(ids(&after.items[1..]), ids(&before.items));

    handle.close().await.unwrap();
}

#[tokio::test]
async fn test_handle_merges_inserts_from_another_connection() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("timeline.db");
    let uploader = Library::open(&db_path).unwrap();
    for n in 0..3 {
        uploader.insert_record(new_record(n)).await.unwrap();
    }

    let viewer = Arc::new(
        Library::open(&db_path)
            .unwrap()
            .with_poll_interval(Duration::from_millis(20)),
    );
    let objects = Arc::new(FakeObjects::new());
    let handle = TimelineHandle::spawn(loader(&viewer, &objects));
    let mut rx = handle.watch();
    let before = wait_until(&mut rx, |s| s.initial_loaded).await;
    assert_eq!(before.items.len(), 3);

    let inserted = uploader.insert_record(new_record(42)).await.unwrap();
    let after = wait_until(&mut rx, |s| s.items.len() == 4).await;

    assert_eq!(after.items[0].record, inserted);
    assert_eq!(after.items[0].url, "mem://photo-42.jpg");
    assert_eq!(ids(&after.items[1..]), ids(&before.items));

    handle.close().await.unwrap();
}

#[tokio::test]
async fn test_handle_drops_realtime_insert_without_url() {
    let library = seeded_library(2).await;
    let objects = Arc::new(FakeObjects::unsignable(&["broken.jpg"]));
    let handle = TimelineHandle::spawn(loader(&library, &objects));
    let mut rx = handle.watch();
    wait_until(&mut rx, |s| s.initial_loaded).await;

    let broken = NewImageRecord {
        storage_path: "broken.jpg".to_string(),
        ..new_record(50)
    };
    library.insert_record(broken).await.unwrap();
    let good = library.insert_record(new_record(51)).await.unwrap();

    let after = wait_until(&mut rx, |s| s.items.len() == 3).await;
    assert_eq!(after.items[0].record, good);
    assert!(after.items.iter().all(|i| i.record.storage_path != "broken.jpg"));

    handle.close().await.unwrap();
}

#[tokio::test]
async fn test_handle_failed_initial_load_unblocks() {
    let records = Arc::new(FlakyRecords::new(Library::open_in_memory().unwrap()));
    records.set_failing(true);
    let objects: Arc<dyn ObjectStore> = Arc::new(FakeObjects::new());
    let handle = TimelineHandle::spawn(PageLoader::new(records, objects));
    let mut rx = handle.watch();

    let snapshot = wait_until(&mut rx, |s| s.initial_loaded).await;
    assert!(snapshot.items.is_empty());
    assert!(!snapshot.has_more);

    handle.close().await.unwrap();
}

#[tokio::test]
async fn test_close_unsubscribes_and_freezes_state() {
    let library = seeded_library(3).await;
    let objects = Arc::new(FakeObjects::new());
    let handle = TimelineHandle::spawn(loader(&library, &objects));
    let mut rx = handle.watch();
    wait_until(&mut rx, |s| s.initial_loaded).await;
    assert_eq!(library.subscriber_count(), 1);

    handle.close().await.unwrap();
    assert_eq!(library.subscriber_count(), 0);

    let frozen = rx.borrow().clone();
    library.insert_record(new_record(7)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*rx.borrow(), frozen);
}
