use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::api::history::HistorySource;
use crate::error::Result;
use crate::store::SharedMessageStore;

/// Result of a `load_older` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// This many messages were merged.
    Loaded(usize),
    /// Nothing fetched: no older pages, or a fetch is already in flight.
    Empty,
}

/// Viewport measurement taken just before a page merge, used to put the
/// scroll position back so the user's visual anchor does not jump.
///
/// The engine does no rendering; callers capture the pre-merge content
/// height and offset, merge, re-measure, and apply [`restore`].
///
/// [`restore`]: ScrollAnchor::restore
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollAnchor {
    pub content_height: f64,
    pub offset: f64,
}

impl ScrollAnchor {
    pub fn capture(content_height: f64, offset: f64) -> Self {
        Self {
            content_height,
            offset,
        }
    }

    /// Adjusted offset after the merge: shifted down by exactly the
    /// height the new messages introduced, pixel for pixel.
    pub fn restore(&self, new_content_height: f64) -> f64 {
        self.offset + (new_content_height - self.content_height)
    }
}

#[derive(Debug)]
struct PageFlags {
    has_more_older: bool,
    is_loading_older: bool,
    last_page: u32,
}

/// Fetches history pages on demand and merges them into the store.
///
/// The server ships pages newest-first; they are reversed before the
/// merge so the store stays oldest-first. `load_older` is single-flight:
/// a call while another is in flight returns `Empty` instead of issuing
/// a duplicate fetch.
pub struct PaginationController<H: HistorySource> {
    history: Arc<H>,
    store: SharedMessageStore,
    page_size: usize,
    flags: Mutex<PageFlags>,
}

impl<H: HistorySource> PaginationController<H> {
    pub fn new(history: Arc<H>, store: SharedMessageStore, page_size: usize) -> Self {
        Self {
            history,
            store,
            page_size,
            flags: Mutex::new(PageFlags {
                has_more_older: true,
                is_loading_older: false,
                last_page: 0,
            }),
        }
    }

    pub fn has_more_older(&self) -> bool {
        self.flags.lock().has_more_older
    }

    pub fn is_loading_older(&self) -> bool {
        self.flags.lock().is_loading_older
    }

    /// Newest page of history. Resets the page cursor.
    pub async fn load_initial(&self) -> Result<usize> {
        let (conversation_id, viewer_id) = {
            let store = self.store.lock();
            (store.conversation_id().to_string(), store.viewer_id().to_string())
        };

        let mut page = self
            .history
            .fetch_page(&conversation_id, &viewer_id, 1, self.page_size)
            .await?;
        page.reverse();

        let fetched = page.len();
        self.store.lock().merge(page);

        let mut flags = self.flags.lock();
        flags.last_page = 1;
        flags.has_more_older = fetched == self.page_size;
        debug!(%conversation_id, fetched, has_more = flags.has_more_older, "initial history loaded");
        Ok(fetched)
    }

    /// Next older page, prepended through the merge primitive.
    ///
    /// Terminal condition: a page shorter than `page_size` clears
    /// `has_more_older` and no further requests are issued.
    pub async fn load_older(&self) -> Result<LoadOutcome> {
        let next_page = {
            let mut flags = self.flags.lock();
            if !flags.has_more_older || flags.is_loading_older {
                return Ok(LoadOutcome::Empty);
            }
            flags.is_loading_older = true;
            flags.last_page + 1
        };

        let (conversation_id, viewer_id) = {
            let store = self.store.lock();
            (store.conversation_id().to_string(), store.viewer_id().to_string())
        };

        let result = self
            .history
            .fetch_page(&conversation_id, &viewer_id, next_page, self.page_size)
            .await;

        let mut page = match result {
            Ok(page) => page,
            Err(e) => {
                // Local state untouched; just release the single-flight
                // guard so the user can retry.
                self.flags.lock().is_loading_older = false;
                return Err(e);
            }
        };
        page.reverse();

        let fetched = page.len();
        self.store.lock().merge(page);

        let mut flags = self.flags.lock();
        flags.is_loading_older = false;
        flags.last_page = next_page;
        flags.has_more_older = fetched == self.page_size;
        debug!(%conversation_id, page = next_page, fetched, "older history merged");

        if fetched == 0 {
            Ok(LoadOutcome::Empty)
        } else {
            Ok(LoadOutcome::Loaded(fetched))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::history::HistorySource;
    use crate::error::ChatError;
    use crate::models::{Message, MessageBody, MessageKind};
    use crate::store::MessageStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn msg(id: &str, sent_at: i64) -> Message {
        Message {
            id: id.into(),
            conversation_id: "c1".into(),
            sender_id: "other".into(),
            kind: MessageKind::Text,
            body: MessageBody::Plain("x".into()),
            sent_at,
            read_at: None,
            recalled: false,
            is_local_only: false,
        }
    }

    /// Serves `total` messages, newest first, in pages.
    struct FakeHistory {
        total: i64,
        calls: AtomicU32,
    }

    impl FakeHistory {
        fn new(total: i64) -> Self {
            Self {
                total,
                calls: AtomicU32::new(0),
            }
        }
    }

    impl HistorySource for FakeHistory {
        async fn fetch_page(
            &self,
            _conversation_id: &str,
            _viewer_id: &str,
            page: u32,
            page_size: usize,
        ) -> Result<Vec<Message>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let newest = self.total - (page as i64 - 1) * page_size as i64;
            let oldest = (newest - page_size as i64).max(0);
            // Newest-first, like the real server.
            Ok((oldest..newest)
                .rev()
                .map(|t| msg(&format!("m{}", t), t))
                .collect())
        }
    }

    struct FailingHistory;

    impl HistorySource for FailingHistory {
        async fn fetch_page(
            &self,
            _conversation_id: &str,
            _viewer_id: &str,
            _page: u32,
            _page_size: usize,
        ) -> Result<Vec<Message>> {
            Err(ChatError::HistoryFetch("boom".into()))
        }
    }

    fn controller(total: i64) -> PaginationController<FakeHistory> {
        PaginationController::new(
            Arc::new(FakeHistory::new(total)),
            MessageStore::shared("c1", "me"),
            30,
        )
    }

    #[tokio::test]
    async fn initial_load_reverses_to_oldest_first() {
        let pc = controller(90);
        assert_eq!(pc.load_initial().await.unwrap(), 30);
        let store = pc.store.lock();
        let times: Vec<i64> = store.messages().iter().map(|m| m.sent_at).collect();
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(times.first(), Some(&60));
        assert_eq!(times.last(), Some(&89));
    }

    #[tokio::test]
    async fn load_older_prepends_strictly_older_page() {
        let pc = controller(60);
        pc.load_initial().await.unwrap();
        let outcome = pc.load_older().await.unwrap();
        assert_eq!(outcome, LoadOutcome::Loaded(30));

        let store = pc.store.lock();
        assert_eq!(store.len(), 60);
        let times: Vec<i64> = store.messages().iter().map(|m| m.sent_at).collect();
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn short_page_is_terminal() {
        let pc = controller(40);
        pc.load_initial().await.unwrap();
        assert!(pc.has_more_older());

        // 10 remaining: short page clears the flag.
        assert_eq!(pc.load_older().await.unwrap(), LoadOutcome::Loaded(10));
        assert!(!pc.has_more_older());

        let calls_before = pc.history.calls.load(Ordering::SeqCst);
        assert_eq!(pc.load_older().await.unwrap(), LoadOutcome::Empty);
        assert_eq!(pc.history.calls.load(Ordering::SeqCst), calls_before);
    }

    #[tokio::test]
    async fn fetch_failure_resets_loading_flag_and_leaves_store() {
        let pc = PaginationController::new(
            Arc::new(FailingHistory),
            MessageStore::shared("c1", "me"),
            30,
        );
        pc.store.lock().merge(vec![msg("seed", 100)]);

        let err = pc.load_older().await.unwrap_err();
        assert!(matches!(err, ChatError::HistoryFetch(_)));
        assert!(!pc.is_loading_older());
        assert_eq!(pc.store.lock().len(), 1);
    }

    #[test]
    fn scroll_anchor_restores_by_exact_height_delta() {
        let anchor = ScrollAnchor::capture(1200.0, 35.0);
        // Merge added 800px of content above the viewport.
        assert_eq!(anchor.restore(2000.0), 835.0);
        // No growth, no jump.
        assert_eq!(anchor.restore(1200.0), 35.0);
    }
}
