//! Read-receipt propagation, both directions.
//!
//! Outbound: telling the server the viewer has seen the conversation,
//! without spamming the network when nothing changed. Inbound: applying
//! the other participant's "seen" events to the viewer's own sent
//! messages. Read state never reorders anything; the UI shows a single
//! most-recent marker, not per-message ticks.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::api::history::HistoryClient;
use crate::connection::ConnectionManager;
use crate::error::Result;
use crate::store::SharedMessageStore;
use crate::wire::ClientFrame;

struct ReceiptState {
    last_sent: Option<Instant>,
    /// Newest other-party timestamp we have already acknowledged.
    acked_up_to: i64,
}

pub struct ReadReceiptReconciler {
    store: SharedMessageStore,
    min_interval: Duration,
    state: Mutex<ReceiptState>,
}

impl ReadReceiptReconciler {
    pub fn new(store: SharedMessageStore, min_interval: Duration) -> Self {
        Self {
            store,
            min_interval,
            state: Mutex::new(ReceiptState {
                last_sent: None,
                acked_up_to: 0,
            }),
        }
    }

    /// Whether an outbound receipt is due: there are unacknowledged
    /// messages from the other party and the rate limit has cooled off.
    /// Returns the timestamp to acknowledge up to.
    fn due(&self) -> Option<i64> {
        let latest = self.store.lock().latest_from_other()?;
        let state = self.state.lock();
        if latest <= state.acked_up_to {
            return None;
        }
        if let Some(last) = state.last_sent {
            if last.elapsed() < self.min_interval {
                return None;
            }
        }
        Some(latest)
    }

    /// Outbound read intent. Idempotent: when nothing from the other
    /// party is unread, or a receipt just went out, this is a no-op.
    /// Prefers the live channel; falls back to the REST call when the
    /// channel is down.
    pub async fn mark_as_read(
        &self,
        conn: &ConnectionManager,
        fallback: &HistoryClient,
    ) -> Result<bool> {
        let Some(up_to) = self.due() else {
            return Ok(false);
        };

        let (conversation_id, viewer_id) = {
            let store = self.store.lock();
            (store.conversation_id().to_string(), store.viewer_id().to_string())
        };

        if conn.is_connected() {
            conn.invoke(ClientFrame::MarkRead {
                conversation_id,
                viewer_id,
            })
            .await?;
        } else {
            fallback.mark_as_read(&conversation_id, &viewer_id).await?;
        }

        let mut state = self.state.lock();
        state.last_sent = Some(Instant::now());
        state.acked_up_to = state.acked_up_to.max(up_to);
        debug!(up_to, "read receipt sent");
        Ok(true)
    }

    /// Inbound "seen" event from the other participant. Flips `read_at`
    /// on the viewer's own messages only, via the store's exclusivity
    /// rule.
    pub fn on_remote_seen(&self, seen_by: &str, up_to: i64) {
        self.store.lock().mark_read_from(seen_by, up_to);
    }
}
