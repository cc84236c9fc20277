//! Guest timeline: paginated loading merged with live inserts.
//!
//! Two producers feed one ordered, id-deduplicated sequence:
//! - page loads (initial and "load more"), pulled through [`PageLoader`]
//! - realtime inserts pushed by the record store
//!
//! Both arrive as [`TimelineEvent`]s applied by [`Timeline::apply`], which
//! keeps the invariants regardless of interleaving:
//! - ids in the sequence are pairwise distinct
//! - loaded pages are sorted by `created_at` descending, realtime items go to index 0
//! - after [`Timeline::close`] nothing mutates the sequence
//!
//! [`TimelineHandle`] runs a `Timeline` in its own task and exposes it as a
//! watch channel of [`TimelineSnapshot`]s.
//!
//! # Lifecycle
//!
//! ```text
//! new ──begin_initial──▶ initial in flight ──PageLoaded──▶ loaded
//!                                                           │  ▲
//!                                          begin_load_more  │  │ PageLoaded
//!                                                           ▼  │
//!                                                    loading more
//! any state ──close──▶ closed (generation bumped, every later event skipped)
//! ```

mod handle;

pub use handle::TimelineHandle;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::state::data::{Cursor, ImageRecord, TimelineItem};
use crate::store::{ObjectStore, RecordStore, SIGNED_URL_TTL};

/// Records per page shown to the guest
pub const PAGE_SIZE: usize = 10;

/// One page of resolved items
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub items: Vec<TimelineItem>,
    pub has_more: bool,
}

/// Fetches pages and resolves signed URLs.
///
/// Cheap to clone; holds no timeline state, so fetches can run while the
/// owning [`Timeline`] keeps applying realtime events.
#[derive(Clone)]
pub struct PageLoader {
    records: Arc<dyn RecordStore>,
    objects: Arc<dyn ObjectStore>,
    page_size: usize,
    url_ttl: Duration,
}

impl PageLoader {
    pub fn new(records: Arc<dyn RecordStore>, objects: Arc<dyn ObjectStore>) -> Self {
        Self {
            records,
            objects,
            page_size: PAGE_SIZE,
            url_ttl: SIGNED_URL_TTL,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_url_ttl(mut self, url_ttl: Duration) -> Self {
        self.url_ttl = url_ttl;
        self
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.records
    }

    /// Load the page that follows `cursor` (or the newest page without one).
    ///
    /// Asks for one record more than a page to learn whether more exist, and
    /// signs every URL of the page in a single batched call.
    pub async fn load_page(&self, cursor: Option<Cursor>) -> Result<Page> {
        let mut records = self.records.query_page(cursor, self.page_size.saturating_add(1)).await?;

        let has_more = records.len() > self.page_size;
        records.truncate(self.page_size);

        let paths: Vec<String> = records.iter().map(|r| r.storage_path.clone()).collect();
        let urls = self.objects.sign_urls(&paths, self.url_ttl).await?;
        if urls.len() != records.len() {
            return Err(Error::Contract(format!(
                "signed {} URLs for {} records",
                urls.len(),
                records.len()
            )));
        }

        let items = records
            .into_iter()
            .zip(urls)
            .map(|(record, url)| TimelineItem { record, url })
            .collect();

        Ok(Page { items, has_more })
    }

    /// Resolve the URL of a single record (the realtime path)
    pub async fn resolve(&self, record: ImageRecord) -> Result<TimelineItem> {
        let url = self.objects.sign_url(&record.storage_path, self.url_ttl).await?;
        Ok(TimelineItem { record, url })
    }
}

/// Which load a page request belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Initial,
    More,
}

/// A page fetch issued by the timeline; carried back with the result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub kind: PageKind,
    pub cursor: Option<Cursor>,
    pub generation: u64,
}

/// Input to the timeline reducer
#[derive(Debug)]
pub enum TimelineEvent {
    /// A page fetch finished (successfully or not)
    PageLoaded {
        request: PageRequest,
        result: Result<Page>,
    },
    /// A realtime insert whose URL has been resolved
    Inserted { generation: u64, item: TimelineItem },
}

/// What applying an event did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The initial page replaced the loaded sequence
    Replaced { count: usize },
    /// A "load more" page was appended
    Appended { added: usize, duplicates: usize },
    /// A realtime item went to the front
    Prepended,
    /// The fetch failed; the sequence is unchanged
    LoadFailed { kind: PageKind },
    /// The event was ignored
    Skipped(SkipReason),
}

impl ApplyOutcome {
    /// Whether observers should be told about new state
    pub fn changed(&self) -> bool {
        !matches!(self, ApplyOutcome::Skipped(_))
    }
}

/// Why an event left the timeline untouched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// An item with the same id is already shown
    AlreadyPresent,
    /// Issued under an earlier generation
    Stale,
    /// The timeline has been torn down
    Closed,
}

/// Read-only view handed to the UI
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimelineSnapshot {
    pub items: Vec<TimelineItem>,
    pub has_more: bool,
    pub initial_loaded: bool,
    pub loading_more: bool,
}

/// The in-memory timeline of one viewing session
#[derive(Debug, Default)]
pub struct Timeline {
    items: Vec<TimelineItem>,
    ids: HashSet<Uuid>,
    cursor: Option<Cursor>,
    has_more: bool,
    initial_loaded: bool,
    loading_more: bool,
    generation: u64,
    closed: bool,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> &[TimelineItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn cursor(&self) -> Option<Cursor> {
        self.cursor
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn initial_loaded(&self) -> bool {
        self.initial_loaded
    }

    pub fn is_loading_more(&self) -> bool {
        self.loading_more
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn snapshot(&self) -> TimelineSnapshot {
        TimelineSnapshot {
            items: self.items.clone(),
            has_more: self.has_more,
            initial_loaded: self.initial_loaded,
            loading_more: self.loading_more,
        }
    }

    /// Request for the first page
    pub fn begin_initial(&self) -> PageRequest {
        PageRequest {
            kind: PageKind::Initial,
            cursor: None,
            generation: self.generation,
        }
    }

    /// Request for the next page, if one may start now.
    ///
    /// Returns `None` while the initial load is pending, when no more pages
    /// exist, when a previous "load more" is still in flight, or after close.
    pub fn begin_load_more(&mut self) -> Option<PageRequest> {
        if self.closed || !self.initial_loaded || !self.has_more || self.loading_more {
            return None;
        }
        self.loading_more = true;
        Some(PageRequest {
            kind: PageKind::More,
            cursor: self.cursor,
            generation: self.generation,
        })
    }

    /// Tear down: every event produced before this point is discarded
    pub fn close(&mut self) {
        self.closed = true;
        self.loading_more = false;
        self.generation += 1;
    }

    pub fn apply(&mut self, event: TimelineEvent) -> ApplyOutcome {
        if self.closed {
            return ApplyOutcome::Skipped(SkipReason::Closed);
        }

        match event {
            TimelineEvent::PageLoaded { request, result } => {
                if request.generation != self.generation {
                    debug!(?request, current = self.generation, "discarding stale page");
                    return ApplyOutcome::Skipped(SkipReason::Stale);
                }
                match request.kind {
                    PageKind::Initial => self.apply_initial(result),
                    PageKind::More => self.apply_more(result),
                }
            }
            TimelineEvent::Inserted { generation, item } => {
                if generation != self.generation {
                    return ApplyOutcome::Skipped(SkipReason::Stale);
                }
                self.apply_inserted(item)
            }
        }
    }

    fn apply_initial(&mut self, result: Result<Page>) -> ApplyOutcome {
        // Unblock the UI whatever happened
        self.initial_loaded = true;

        let page = match result {
            Ok(page) => page,
            Err(e) => {
                warn!(error = %e, "initial timeline load failed");
                self.has_more = false;
                return ApplyOutcome::LoadFailed { kind: PageKind::Initial };
            }
        };

        let page_ids: HashSet<Uuid> = page.items.iter().map(|i| i.id()).collect();

        // Realtime items that arrived before the page and are missing from it
        // are newer than everything in it, so they stay in front
        let mut items: Vec<TimelineItem> = self
            .items
            .drain(..)
            .filter(|item| !page_ids.contains(&item.id()))
            .collect();
        let kept = items.len();

        self.cursor = page.items.last().map(|i| i.created_at());
        self.has_more = page.has_more;

        let mut ids: HashSet<Uuid> = items.iter().map(|i| i.id()).collect();
        for item in page.items {
            if ids.insert(item.id()) {
                items.push(item);
            }
        }
        self.ids = ids;
        self.items = items;

        debug!(count = self.items.len(), kept, has_more = self.has_more, "initial page applied");
        ApplyOutcome::Replaced {
            count: self.items.len(),
        }
    }

    fn apply_more(&mut self, result: Result<Page>) -> ApplyOutcome {
        self.loading_more = false;

        let page = match result {
            Ok(page) => page,
            Err(e) => {
                warn!(error = %e, cursor = ?self.cursor, "loading more timeline items failed");
                return ApplyOutcome::LoadFailed { kind: PageKind::More };
            }
        };

        if let Some(last) = page.items.last() {
            self.cursor = Some(last.created_at());
        }
        self.has_more = page.has_more;

        let mut added = 0;
        let mut duplicates = 0;
        for item in page.items {
            if self.ids.insert(item.id()) {
                self.items.push(item);
                added += 1;
            } else {
                duplicates += 1;
            }
        }

        if duplicates > 0 {
            debug!(duplicates, "page overlapped realtime items");
        }
        ApplyOutcome::Appended { added, duplicates }
    }

    fn apply_inserted(&mut self, item: TimelineItem) -> ApplyOutcome {
        if !self.ids.insert(item.id()) {
            return ApplyOutcome::Skipped(SkipReason::AlreadyPresent);
        }
        self.items.insert(0, item);
        ApplyOutcome::Prepended
    }
}

#[cfg(test)]
mod tests;
