//! Background driver for a [`Timeline`].
//!
//! ```text
//!   TimelineHandle           mpsc            driver task
//!   ┌──────────────┐  ─────────────────▶  ┌──────────────────────────┐
//!   │ .load_more() │    LoadMore/Close    │ Timeline (sole owner)    │
//!   │ .close()     │                      │ ◀── page future (≤ 1)    │
//!   │ .watch()     │  ◀─────────────────  │ ◀── insert subscription  │
//!   └──────────────┘   watch snapshots    └──────────────────────────┘
//! ```
//!
//! All mutation happens inside the driver task, one event at a time.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    ApplyOutcome, Page, PageLoader, PageRequest, Timeline, TimelineEvent, TimelineSnapshot,
};
use crate::error::Result;
use crate::store::InsertSubscription;

type PageFuture = Pin<Box<dyn Future<Output = (PageRequest, Result<Page>)> + Send>>;

type MoreReply = oneshot::Sender<Option<ApplyOutcome>>;

enum Command {
    LoadMore { reply: Option<MoreReply> },
    Close,
}

/// Owner-side handle of a running timeline session.
///
/// Dropping the handle tears the session down like [`TimelineHandle::close`],
/// without waiting for the task to finish.
pub struct TimelineHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<TimelineSnapshot>,
    task: JoinHandle<()>,
}

impl TimelineHandle {
    /// Subscribe to inserts and start the initial load.
    ///
    /// The subscription is taken before the first page is requested so no
    /// insert can fall between the two.
    pub fn spawn(loader: PageLoader) -> Self {
        let subscription = loader.records().subscribe_inserts();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshots) = watch::channel(TimelineSnapshot::default());

        let task = tokio::spawn(run(loader, subscription, command_rx, snapshot_tx));

        Self {
            commands,
            snapshots,
            task,
        }
    }

    /// Current state of the timeline
    pub fn snapshot(&self) -> TimelineSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Receiver notified on every visible change
    pub fn watch(&self) -> watch::Receiver<TimelineSnapshot> {
        self.snapshots.clone()
    }

    /// Signal that the guest reached the end of what is shown.
    /// Ignored unless a further page can be loaded right now.
    pub fn request_more(&self) {
        if self.commands.send(Command::LoadMore { reply: None }).is_err() {
            debug!("load more requested after timeline shut down");
        }
    }

    /// Like [`request_more`](Self::request_more), waiting for the page to be applied.
    ///
    /// Returns `None` when the request was ignored (nothing more to load, a
    /// load already in flight, or the session is closed).
    pub async fn load_more(&self) -> Option<ApplyOutcome> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::LoadMore { reply: Some(reply) })
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Unsubscribe, discard anything still in flight and wait for the driver to stop
    pub async fn close(self) -> Result<()> {
        // The task may already be gone; joining below still reports how it ended
        let _ = self.commands.send(Command::Close);
        self.task.await?;
        Ok(())
    }
}

fn fetch(loader: PageLoader, request: PageRequest) -> PageFuture {
    Box::pin(async move {
        let result = loader.load_page(request.cursor).await;
        (request, result)
    })
}

async fn next_page(pending: &mut Option<PageFuture>) -> (PageRequest, Result<Page>) {
    match pending.as_mut() {
        Some(page) => page.await,
        None => std::future::pending().await,
    }
}

async fn run(
    loader: PageLoader,
    mut subscription: InsertSubscription,
    mut commands: mpsc::UnboundedReceiver<Command>,
    snapshots: watch::Sender<TimelineSnapshot>,
) {
    let mut timeline = Timeline::new();
    let mut pending = Some(fetch(loader.clone(), timeline.begin_initial()));
    let mut more_reply: Option<MoreReply> = None;
    info!(page_size = loader.page_size(), "timeline session started");

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::LoadMore { reply }) => match timeline.begin_load_more() {
                    Some(request) => {
                        debug!(cursor = ?request.cursor, "loading more");
                        pending = Some(fetch(loader.clone(), request));
                        more_reply = reply;
                        snapshots.send_replace(timeline.snapshot());
                    }
                    None => {
                        if let Some(reply) = reply {
                            let _ = reply.send(None);
                        }
                    }
                },
                Some(Command::Close) | None => break,
            },

            (request, result) = next_page(&mut pending), if pending.is_some() => {
                pending = None;
                let outcome = timeline.apply(TimelineEvent::PageLoaded { request, result });
                debug!(?outcome, len = timeline.len(), "page applied");
                if outcome.changed() {
                    snapshots.send_replace(timeline.snapshot());
                }
                if let Some(reply) = more_reply.take() {
                    let _ = reply.send(Some(outcome));
                }
            }

            record = subscription.recv(), if subscription.is_active() => {
                let Some(record) = record else {
                    warn!("insert feed ended, timeline no longer live");
                    continue;
                };
                let generation = timeline.generation();
                let id = record.id;
                match loader.resolve(record).await {
                    Ok(item) => {
                        let outcome = timeline.apply(TimelineEvent::Inserted { generation, item });
                        debug!(%id, ?outcome, "realtime insert");
                        if outcome.changed() {
                            snapshots.send_replace(timeline.snapshot());
                        }
                    }
                    Err(e) => warn!(%id, error = %e, "dropping realtime insert without URL"),
                }
            }
        }
    }

    subscription.unsubscribe();
    timeline.close();
    drop(pending);
    info!(len = timeline.len(), "timeline session closed");
}
