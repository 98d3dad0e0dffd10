//! Optimistic send pipeline.
//!
//! A locally authored message is injected into the store before any
//! network round trip, then dispatched to the active backend, then
//! reconciled against the server-confirmed record. On failure the
//! provisional message is left visible so the user can retry or copy
//! the text out; nothing retries automatically.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::api::assistant::AssistantApi;
use crate::connection::ConnectionManager;
use crate::error::Result;
use crate::models::{
    next_provisional_id, Message, MessageBody, MessageKind, MessageRecord, AI_SENDER_ID,
};
use crate::store::SharedMessageStore;
use crate::wire::ClientFrame;

/// How far apart a provisional message and a server record may be in
/// time and still heuristically match. Only used when the server did
/// not echo the client id.
const RECONCILE_WINDOW_MS: i64 = 5_000;

/// Per-send lifecycle. An entry exists while a send is in flight or has
/// failed; successful reconciliation prunes it, so the bookkeeping never
/// grows with conversation length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    Injected,
    Dispatched,
    Failed,
}

pub struct SendPipeline {
    store: SharedMessageStore,
    viewer_id: String,
    pending: Mutex<HashMap<String, SendState>>,
}

impl SendPipeline {
    pub fn new(store: SharedMessageStore, viewer_id: impl Into<String>) -> Self {
        Self {
            store,
            viewer_id: viewer_id.into(),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn send_state(&self, client_id: &str) -> Option<SendState> {
        self.pending.lock().get(client_id).copied()
    }

    /// Inject a provisional message. The UI reflects it immediately.
    fn inject(&self, content: String, kind: MessageKind) -> Message {
        let now = chrono::Utc::now().timestamp_millis();
        let conversation_id = self.store.lock().conversation_id().to_string();
        let message = Message {
            id: next_provisional_id(now),
            conversation_id,
            sender_id: self.viewer_id.clone(),
            kind,
            body: MessageBody::Plain(content),
            sent_at: now,
            read_at: None,
            recalled: false,
            is_local_only: false,
        };
        self.pending
            .lock()
            .insert(message.id.clone(), SendState::Injected);
        self.store.lock().merge(vec![message.clone()]);
        message
    }

    /// Live-channel send: inject, dispatch over the connection, and let
    /// the server echo drive reconciliation.
    pub async fn send_live(
        &self,
        conn: &ConnectionManager,
        content: String,
        kind: MessageKind,
    ) -> Result<()> {
        let message = self.inject(content, kind);
        let client_id = message.id.clone();
        self.pending
            .lock()
            .insert(client_id.clone(), SendState::Dispatched);

        let frame = ClientFrame::SendMessage {
            conversation_id: message.conversation_id.clone(),
            client_id: client_id.clone(),
            sender_id: message.sender_id.clone(),
            kind: message.kind,
            content: message.text().to_string(),
        };

        if let Err(e) = conn.invoke(frame).await {
            warn!(%client_id, error = %e, "dispatch failed, provisional message kept");
            self.pending.lock().insert(client_id, SendState::Failed);
            return Err(e);
        }
        Ok(())
    }

    /// Reconcile an inbound push against any pending provisional send.
    ///
    /// Exact reconciliation uses the client id the server echoes back.
    /// For servers that drop the echo, a heuristic fallback matches on
    /// sender + content + a small time window. Unmatched pushes are a
    /// plain merge; replays are absorbed by merge idempotency.
    pub fn on_server_message(&self, client_id: Option<String>, record: MessageRecord) {
        let server = record.into_message();

        if let Some(cid) = client_id {
            if self.pending.lock().contains_key(&cid) || self.store.lock().contains(&cid) {
                debug!(%cid, server_id = %server.id, "exact reconciliation");
                self.store.lock().reconcile_local(&cid, server);
                self.pending.lock().remove(&cid);
                return;
            }
        }

        if server.sender_id == self.viewer_id {
            if let Some(local_id) = self.heuristic_match(&server) {
                debug!(%local_id, server_id = %server.id, "heuristic reconciliation");
                self.store.lock().reconcile_local(&local_id, server);
                self.pending.lock().remove(&local_id);
                return;
            }
        }

        self.store.lock().merge(vec![server]);
    }

    /// Delete a message from this device and forget any send state tied
    /// to it.
    pub fn remove_local(&self, message_id: &str) {
        self.pending.lock().remove(message_id);
        self.store.lock().remove_local(message_id);
    }

    fn heuristic_match(&self, server: &Message) -> Option<String> {
        let store = self.store.lock();
        store
            .messages()
            .iter()
            .find(|m| {
                m.is_provisional()
                    && !m.is_local_only
                    && m.sender_id == server.sender_id
                    && m.text() == server.text()
                    && (m.sent_at - server.sent_at).abs() <= RECONCILE_WINDOW_MS
            })
            .map(|m| m.id.clone())
    }

    /// Assistant send: inject the user's turn, call the stateless API
    /// with the trailing history window, and synthesize the reply as a
    /// second injected message tagged with the AI sentinel sender.
    pub async fn send_ai<A: AssistantApi>(&self, assistant: &A, content: String) -> Result<()> {
        // Prior turns only; the new message rides in the request itself.
        let history = self.store.lock().snapshot();
        let message = self.inject(content, MessageKind::Text);
        let client_id = message.id.clone();
        self.pending
            .lock()
            .insert(client_id.clone(), SendState::Dispatched);

        let reply = match assistant
            .chat(message.text(), &self.viewer_id, &history)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                warn!(%client_id, error = %e, "assistant call failed, provisional message kept");
                self.pending.lock().insert(client_id, SendState::Failed);
                return Err(e);
            }
        };
        self.pending.lock().remove(&client_id);

        let body = if reply.suggested_products.is_empty() && reply.clarifying_question.is_none() {
            MessageBody::Plain(reply.reply_text)
        } else {
            MessageBody::AiReply {
                text: reply.reply_text,
                suggestions: reply.suggested_products,
                clarifying_question: reply.clarifying_question,
            }
        };
        let ai_message = Message {
            id: format!("ai-{}", uuid::Uuid::new_v4()),
            conversation_id: message.conversation_id,
            sender_id: AI_SENDER_ID.to_string(),
            kind: MessageKind::Text,
            body,
            sent_at: chrono::Utc::now().timestamp_millis(),
            read_at: None,
            recalled: false,
            is_local_only: false,
        };
        self.store.lock().merge(vec![ai_message]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::assistant::AssistantReply;
    use crate::error::ChatError;
    use crate::models::{MessageKind, ProductSuggestion};
    use crate::store::MessageStore;

    fn record(id: &str, sender: &str, content: &str, sent_at: i64) -> MessageRecord {
        MessageRecord {
            id: id.into(),
            conversation_id: "c1".into(),
            sender_id: sender.into(),
            kind: MessageKind::Text,
            content: content.into(),
            sent_at,
            read_at: None,
            recalled: false,
            suggested_products: vec![],
            clarifying_question: None,
        }
    }

    fn pipeline() -> SendPipeline {
        SendPipeline::new(MessageStore::shared("c1", "me"), "me")
    }

    #[test]
    fn echo_with_client_id_reconciles_exactly_once() {
        let p = pipeline();
        let provisional = p.inject("Hi".into(), MessageKind::Text);

        let echo = record("srv-42", "me", "Hi", provisional.sent_at);
        p.on_server_message(Some(provisional.id.clone()), echo.clone());
        p.on_server_message(Some(provisional.id.clone()), echo);

        let store = p.store.lock();
        assert_eq!(store.len(), 1);
        assert_eq!(store.messages()[0].id, "srv-42");
        assert_eq!(store.messages()[0].text(), "Hi");
        drop(store);
        // Terminal: the bookkeeping entry is gone.
        assert_eq!(p.send_state(&provisional.id), None);
        assert!(p.pending.lock().is_empty());
    }

    #[test]
    fn heuristic_fallback_matches_sender_content_and_time() {
        let p = pipeline();
        let provisional = p.inject("Hello".into(), MessageKind::Text);

        let echo = record("srv-7", "me", "Hello", provisional.sent_at + 1_200);
        p.on_server_message(None, echo);

        let store = p.store.lock();
        assert_eq!(store.len(), 1);
        assert_eq!(store.messages()[0].id, "srv-7");
        drop(store);
        assert!(p.pending.lock().is_empty());
    }

    #[test]
    fn reconciled_sends_leave_no_pending_entries_behind() {
        let p = pipeline();
        for i in 0..20 {
            let provisional = p.inject(format!("msg {}", i), MessageKind::Text);
            let echo = record(&format!("srv-{}", i), "me", &format!("msg {}", i), provisional.sent_at);
            p.on_server_message(Some(provisional.id.clone()), echo);
        }
        assert_eq!(p.store.lock().len(), 20);
        assert!(p.pending.lock().is_empty());
    }

    #[test]
    fn removing_a_failed_send_clears_its_state() {
        let p = pipeline();
        let provisional = p.inject("lost".into(), MessageKind::Text);
        p.pending
            .lock()
            .insert(provisional.id.clone(), SendState::Failed);

        p.remove_local(&provisional.id);

        assert_eq!(p.send_state(&provisional.id), None);
        assert!(p.store.lock().snapshot().is_empty());
    }

    #[test]
    fn unrelated_push_is_a_plain_merge() {
        let p = pipeline();
        p.inject("mine".into(), MessageKind::Text);
        p.on_server_message(None, record("srv-9", "other", "theirs", 50));
        assert_eq!(p.store.lock().len(), 2);
    }

    #[test]
    fn heuristic_ignores_records_outside_the_window() {
        let p = pipeline();
        let provisional = p.inject("Hello".into(), MessageKind::Text);

        let echo = record(
            "srv-8",
            "me",
            "Hello",
            provisional.sent_at + RECONCILE_WINDOW_MS + 1,
        );
        p.on_server_message(None, echo);
        // Too far apart: both the provisional and the server record stay.
        assert_eq!(p.store.lock().len(), 2);
    }

    struct FakeAssistant {
        reply: AssistantReply,
    }

    impl AssistantApi for FakeAssistant {
        async fn chat(
            &self,
            _message: &str,
            _user_id: &str,
            _history: &[Message],
        ) -> Result<AssistantReply> {
            Ok(AssistantReply {
                reply_text: self.reply.reply_text.clone(),
                suggested_products: self.reply.suggested_products.clone(),
                clarifying_question: self.reply.clarifying_question.clone(),
            })
        }
    }

    struct BrokenAssistant;

    impl AssistantApi for BrokenAssistant {
        async fn chat(
            &self,
            _message: &str,
            _user_id: &str,
            _history: &[Message],
        ) -> Result<AssistantReply> {
            Err(ChatError::Dispatch("offline".into()))
        }
    }

    #[tokio::test]
    async fn ai_send_injects_user_turn_and_synthesized_reply() {
        let p = SendPipeline::new(MessageStore::shared("c1", "me"), "me");
        let assistant = FakeAssistant {
            reply: AssistantReply {
                reply_text: "Try this bike".into(),
                suggested_products: vec![ProductSuggestion {
                    id: "p1".into(),
                    title: "Bike".into(),
                    price: None,
                    image_url: None,
                }],
                clarifying_question: None,
            },
        };

        p.send_ai(&assistant, "looking for a bike".into()).await.unwrap();

        let store = p.store.lock();
        assert_eq!(store.len(), 2);
        assert_eq!(store.messages()[0].sender_id, "me");
        let reply = &store.messages()[1];
        assert!(reply.is_from_assistant());
        assert!(matches!(reply.body, MessageBody::AiReply { .. }));
    }

    #[tokio::test]
    async fn failed_ai_send_keeps_provisional_visible() {
        let p = SendPipeline::new(MessageStore::shared("c1", "me"), "me");
        let err = p.send_ai(&BrokenAssistant, "hello?".into()).await.unwrap_err();
        assert!(matches!(err, ChatError::Dispatch(_)));

        let store = p.store.lock();
        assert_eq!(store.len(), 1);
        assert!(store.messages()[0].is_provisional());
    }
}
