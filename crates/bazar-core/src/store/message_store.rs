use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::models::message::RECALLED_PLACEHOLDER;
use crate::models::{Message, MessageBody};

/// A store behind a lock, shared between the UI side and the event pump.
pub type SharedMessageStore = Arc<Mutex<MessageStore>>;

/// Ordered, deduplicated client-local view of one conversation.
///
/// This is the single source of truth the UI renders from. Every insert
/// goes through [`merge`](MessageStore::merge); live pushes, history
/// pages and optimistic sends all share that one code path, which is
/// what guarantees the ordering and dedup invariants.
pub struct MessageStore {
    conversation_id: String,
    viewer_id: String,
    messages: Vec<Message>,
    ids: HashSet<String>,
}

impl MessageStore {
    pub fn new(conversation_id: impl Into<String>, viewer_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            viewer_id: viewer_id.into(),
            messages: Vec::new(),
            ids: HashSet::new(),
        }
    }

    pub fn shared(conversation_id: impl Into<String>, viewer_id: impl Into<String>) -> SharedMessageStore {
        Arc::new(Mutex::new(Self::new(conversation_id, viewer_id)))
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn viewer_id(&self) -> &str {
        &self.viewer_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// What the UI renders: every message except the locally deleted
    /// ones.
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages
            .iter()
            .filter(|m| !m.is_local_only)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn oldest_sent_at(&self) -> Option<i64> {
        self.messages.first().map(|m| m.sent_at)
    }

    /// The other human participant, learned from the first message not
    /// authored by the viewer or the assistant. `None` until the peer
    /// has said something.
    pub fn peer_id(&self) -> Option<&str> {
        self.messages
            .iter()
            .find(|m| m.sender_id != self.viewer_id && !m.is_from_assistant())
            .map(|m| m.sender_id.as_str())
    }

    /// Sole insertion point. Deduplicates by id, inserts each message at
    /// its sort position (`sent_at` ascending, ties after existing
    /// entries), and is an idempotent union: merging overlapping or
    /// already-known data is a no-op for the known part.
    ///
    /// Messages for a different conversation are dropped, not merged.
    /// An in-flight fetch that resolves after the user switched
    /// conversations lands in a store that no longer matches its tag.
    pub fn merge(&mut self, incoming: Vec<Message>) {
        for message in incoming {
            if message.conversation_id != self.conversation_id {
                warn!(
                    message_id = %message.id,
                    expected = %self.conversation_id,
                    got = %message.conversation_id,
                    "dropping message for stale conversation"
                );
                continue;
            }
            if self.ids.contains(&message.id) {
                continue;
            }
            let pos = self
                .messages
                .partition_point(|m| m.sent_at <= message.sent_at);
            self.ids.insert(message.id.clone());
            self.messages.insert(pos, message);
        }
    }

    /// Match a provisional message to its server-confirmed record.
    ///
    /// If the server id is unseen, the provisional entry is renamed in
    /// place (same list position) so the UI does not flicker. If a
    /// duplicate push already delivered the server record, the
    /// provisional entry is discarded and the existing entry kept.
    /// Replaying the same server event is a no-op.
    pub fn reconcile_local(&mut self, local_id: &str, server: Message) {
        if server.conversation_id != self.conversation_id {
            return;
        }
        if self.ids.contains(&server.id) {
            // Server record already present via a duplicate push; drop
            // the provisional if it still exists.
            if self.ids.remove(local_id) {
                debug!(%local_id, server_id = %server.id, "provisional superseded by pushed record");
                self.messages.retain(|m| m.id != local_id);
            }
            return;
        }

        match self.messages.iter_mut().find(|m| m.id == local_id) {
            Some(entry) => {
                self.ids.remove(local_id);
                self.ids.insert(server.id.clone());
                entry.id = server.id;
                entry.sent_at = server.sent_at;
                entry.read_at = server.read_at;
                entry.body = server.body;
                entry.kind = server.kind;
            }
            None => {
                // Provisional already gone (reconciled earlier, or never
                // injected here). Treat the server record as a plain push.
                self.merge(vec![server]);
            }
        }
    }

    /// Flip `read_at` on the viewer's own messages up to a timestamp.
    ///
    /// Only messages authored by the local viewer are touched, and only
    /// when the reader is someone else; a viewer's own read action never
    /// marks their own sent messages as seen by themselves.
    pub fn mark_read_from(&mut self, seen_by: &str, up_to: i64) {
        if seen_by == self.viewer_id {
            return;
        }
        for message in &mut self.messages {
            if message.sender_id == self.viewer_id
                && message.sent_at <= up_to
                && message.read_at.is_none()
            {
                message.read_at = Some(up_to);
            }
        }
    }

    /// Most recent own message that has been seen. The UI renders a
    /// single marker here, not per-message ticks.
    pub fn last_seen_marker(&self) -> Option<&Message> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.sender_id == self.viewer_id && m.read_at.is_some() && !m.is_local_only)
    }

    /// Timestamp of the newest message authored by the other party.
    pub fn latest_from_other(&self) -> Option<i64> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.sender_id != self.viewer_id && !m.is_local_only)
            .map(|m| m.sent_at)
    }

    /// Tombstone a message. Monotonic: a recalled message never comes
    /// back, and recalling twice is a no-op. Relative order of the
    /// remaining messages is untouched.
    pub fn recall(&mut self, id: &str) {
        if let Some(message) = self.messages.iter_mut().find(|m| m.id == id) {
            if message.recalled {
                return;
            }
            message.recalled = true;
            message.body = MessageBody::Plain(RECALLED_PLACEHOLDER.to_string());
        }
    }

    /// Remove a message from this device only. The entry is flagged and
    /// hidden rather than deleted; its id stays known so a later history
    /// re-fetch of the same page cannot resurrect it. The other
    /// participant is unaffected.
    pub fn remove_local(&mut self, id: &str) {
        if let Some(message) = self.messages.iter_mut().find(|m| m.id == id) {
            message.is_local_only = true;
        }
    }
}
