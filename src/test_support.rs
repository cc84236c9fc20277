//! Store fakes for failure injection in unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::state::data::{Cursor, ImageRecord, NewImageRecord};
use crate::state::library::Library;
use crate::store::{InsertSubscription, ObjectStore, RecordStore};

/// In-memory object store that counts calls and fails on demand
#[derive(Default)]
pub struct FakeObjects {
    /// Paths that cannot be signed
    pub unsignable: HashSet<String>,
    /// 1-based `put_object` call numbers that fail
    pub failing_puts: HashSet<usize>,
    pub puts: Mutex<Vec<(String, Vec<u8>, String)>>,
    put_calls: AtomicUsize,
    sign_calls: AtomicUsize,
    batch_calls: AtomicUsize,
}

impl FakeObjects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unsignable(paths: &[&str]) -> Self {
        Self {
            unsignable: paths.iter().map(|p| p.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn failing_puts(calls: &[usize]) -> Self {
        Self {
            failing_puts: calls.iter().copied().collect(),
            ..Self::default()
        }
    }

    pub fn sign_calls(&self) -> usize {
        self.sign_calls.load(Ordering::SeqCst)
    }

    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    fn url(&self, path: &str) -> Result<String> {
        if self.unsignable.contains(path) {
            return Err(Error::ObjectNotFound(path.to_string()));
        }
        Ok(format!("mem://{}", path))
    }
}

#[async_trait]
impl ObjectStore for FakeObjects {
    async fn put_object(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        let call = self.put_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing_puts.contains(&call) {
            return Err(Error::Io(std::io::Error::other("injected upload failure")));
        }
        self.puts
            .lock()
            .push((path.to_string(), bytes, content_type.to_string()));
        Ok(())
    }

    async fn sign_url(&self, path: &str, _ttl: Duration) -> Result<String> {
        self.sign_calls.fetch_add(1, Ordering::SeqCst);
        self.url(path)
    }

    async fn sign_urls(&self, paths: &[String], _ttl: Duration) -> Result<Vec<String>> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        paths.iter().map(|p| self.url(p)).collect()
    }
}

/// Library wrapper whose queries can be switched to fail
pub struct FlakyRecords {
    pub inner: Library,
    pub fail_queries: AtomicBool,
}

impl FlakyRecords {
    pub fn new(inner: Library) -> Self {
        Self {
            inner,
            fail_queries: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_queries.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl RecordStore for FlakyRecords {
    async fn query_page(&self, before: Option<Cursor>, limit: usize) -> Result<Vec<ImageRecord>> {
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::other("injected query failure")));
        }
        self.inner.query_page(before, limit).await
    }

    async fn insert_record(&self, record: NewImageRecord) -> Result<ImageRecord> {
        self.inner.insert_record(record).await
    }

    fn subscribe_inserts(&self) -> InsertSubscription {
        self.inner.subscribe_inserts()
    }
}
