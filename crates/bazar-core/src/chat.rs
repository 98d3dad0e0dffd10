//! The uniform conversation surface over two backends.
//!
//! A conversation id starting with the reserved AI prefix opens the
//! request/response strategy; anything else opens the live channel.
//! Selection happens exactly once, at open; call sites never branch on
//! backend again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{AssistantClient, HistoryClient};
use crate::config::CoreConfig;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::error::Result;
use crate::models::{
    ai_conversation_id, is_ai_conversation, ConversationVisibility, Message, MessageKind,
    PresenceSource, PresenceTracker,
};
use crate::receipts::ReadReceiptReconciler;
use crate::send::SendPipeline;
use crate::store::{LoadOutcome, MessageStore, PaginationController, SharedMessageStore};
use crate::wire::{ClientFrame, ServerEvent};

/// Shared clients and config; opens conversations.
pub struct ChatEngine {
    cfg: CoreConfig,
    viewer_id: String,
    conn: Arc<ConnectionManager>,
    history: Arc<HistoryClient>,
    assistant: Arc<AssistantClient>,
}

impl ChatEngine {
    pub fn new(cfg: CoreConfig, auth_token: &str, viewer_id: impl Into<String>) -> Result<Self> {
        let conn = Arc::new(ConnectionManager::connect(&cfg, auth_token)?);
        let history = Arc::new(HistoryClient::new(
            cfg.api_base.clone(),
            auth_token,
            cfg.request_timeout,
        )?);
        let assistant = Arc::new(AssistantClient::new(
            cfg.assistant_base.clone(),
            auth_token,
            cfg.request_timeout,
            cfg.ai_context_window,
        )?);
        Ok(Self {
            cfg,
            viewer_id: viewer_id.into(),
            conn,
            history,
            assistant,
        })
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.conn
    }

    pub fn viewer_id(&self) -> &str {
        &self.viewer_id
    }

    /// Server-authoritative hidden/deleted records, fetched on session
    /// start.
    pub async fn conversation_state(&self) -> Result<Vec<ConversationVisibility>> {
        self.history.conversation_state(&self.viewer_id).await
    }

    /// Open a conversation, selecting the backend by id convention.
    pub async fn open_conversation(&self, conversation_id: &str) -> Result<Conversation> {
        if is_ai_conversation(conversation_id) {
            Ok(Conversation::Assistant(
                RequestResponseChat::open(
                    self.assistant.clone(),
                    self.history.clone(),
                    &self.cfg,
                    &self.viewer_id,
                )
                .await?,
            ))
        } else {
            Ok(Conversation::Live(
                LiveChannelChat::open(
                    self.conn.clone(),
                    self.history.clone(),
                    &self.cfg,
                    conversation_id,
                    &self.viewer_id,
                )
                .await?,
            ))
        }
    }

    /// The viewer's assistant thread; its id is deterministic.
    pub async fn open_assistant(&self) -> Result<Conversation> {
        let id = ai_conversation_id(&self.viewer_id);
        self.open_conversation(&id).await
    }
}

/// One open conversation, whichever strategy backs it.
pub enum Conversation {
    Live(LiveChannelChat),
    Assistant(RequestResponseChat),
}

impl Conversation {
    pub fn conversation_id(&self) -> String {
        match self {
            Conversation::Live(c) => c.store.lock().conversation_id().to_string(),
            Conversation::Assistant(c) => c.store.lock().conversation_id().to_string(),
        }
    }

    pub fn messages(&self) -> Vec<Message> {
        match self {
            Conversation::Live(c) => c.store.lock().snapshot(),
            Conversation::Assistant(c) => c.store.lock().snapshot(),
        }
    }

    /// The assistant backend has no persistent session and reports
    /// connected unconditionally.
    pub fn is_connected(&self) -> bool {
        match self {
            Conversation::Live(c) => c.conn.is_connected(),
            Conversation::Assistant(_) => true,
        }
    }

    pub async fn send(&self, content: String, kind: MessageKind) -> Result<()> {
        match self {
            Conversation::Live(c) => c.pipeline.send_live(&c.conn, content, kind).await,
            Conversation::Assistant(c) => c.pipeline.send_ai(c.assistant.as_ref(), content).await,
        }
    }

    pub async fn load_more(&self) -> Result<LoadOutcome> {
        match self {
            Conversation::Live(c) => c.pagination.load_older().await,
            Conversation::Assistant(c) => c.pagination.load_older().await,
        }
    }

    pub fn has_more(&self) -> bool {
        match self {
            Conversation::Live(c) => c.pagination.has_more_older(),
            Conversation::Assistant(c) => c.pagination.has_more_older(),
        }
    }

    pub fn is_loading_more(&self) -> bool {
        match self {
            Conversation::Live(c) => c.pagination.is_loading_older(),
            Conversation::Assistant(c) => c.pagination.is_loading_older(),
        }
    }

    pub async fn mark_as_read(&self) -> Result<bool> {
        match self {
            Conversation::Live(c) => c.receipts.mark_as_read(&c.conn, &c.history).await,
            // The assistant never sends read receipts.
            Conversation::Assistant(_) => Ok(false),
        }
    }

    /// Recall a message for both participants. Silently ignored on the
    /// assistant backend; capability absence is not an error.
    pub async fn recall(&self, message_id: &str) -> Result<()> {
        match self {
            Conversation::Live(c) => c.recall(message_id).await,
            Conversation::Assistant(_) => Ok(()),
        }
    }

    /// Delete a message from this device only.
    pub fn remove_local(&self, message_id: &str) {
        match self {
            Conversation::Live(c) => c.pipeline.remove_local(message_id),
            Conversation::Assistant(c) => c.pipeline.remove_local(message_id),
        }
    }

    pub fn is_peer_online(&self) -> bool {
        match self {
            Conversation::Live(c) => c.presence.lock().is_online(),
            Conversation::Assistant(_) => true,
        }
    }

    /// Tear down: leave the room and stop the event pump. In-flight
    /// fetches resolve into the discarded store and go nowhere.
    pub async fn close(self) {
        if let Conversation::Live(c) = self {
            let id = c.store.lock().conversation_id().to_string();
            let _ = c.conn.leave_room(id).await;
            c.pump.abort();
        }
    }
}

/// Human-to-human chat over the live channel.
pub struct LiveChannelChat {
    conn: Arc<ConnectionManager>,
    history: Arc<HistoryClient>,
    store: SharedMessageStore,
    pagination: PaginationController<HistoryClient>,
    pipeline: Arc<SendPipeline>,
    receipts: Arc<ReadReceiptReconciler>,
    presence: Arc<Mutex<PresenceTracker>>,
    /// The listing behind this conversation changed server-side.
    pub listing_changed: Arc<AtomicBool>,
    pub blocked: Arc<AtomicBool>,
    pump: JoinHandle<()>,
}

impl LiveChannelChat {
    pub async fn open(
        conn: Arc<ConnectionManager>,
        history: Arc<HistoryClient>,
        cfg: &CoreConfig,
        conversation_id: &str,
        viewer_id: &str,
    ) -> Result<Self> {
        let store = MessageStore::shared(conversation_id, viewer_id);
        let pipeline = Arc::new(SendPipeline::new(store.clone(), viewer_id));
        let receipts = Arc::new(ReadReceiptReconciler::new(
            store.clone(),
            cfg.read_receipt_min_interval,
        ));
        let presence = Arc::new(Mutex::new(PresenceTracker::new()));
        let listing_changed = Arc::new(AtomicBool::new(false));
        let blocked = Arc::new(AtomicBool::new(false));

        conn.join_room(conversation_id).await?;

        let pagination =
            PaginationController::new(history.clone(), store.clone(), cfg.page_size);
        pagination.load_initial().await?;

        let pump = tokio::spawn(event_pump(
            conn.subscribe(),
            conn.state_watch(),
            conversation_id.to_string(),
            viewer_id.to_string(),
            store.clone(),
            pipeline.clone(),
            receipts.clone(),
            presence.clone(),
            listing_changed.clone(),
            blocked.clone(),
        ));

        info!(%conversation_id, "live conversation opened");
        Ok(Self {
            conn,
            history,
            store,
            pagination,
            pipeline,
            receipts,
            presence,
            listing_changed,
            blocked,
            pump,
        })
    }

    pub fn store(&self) -> &SharedMessageStore {
        &self.store
    }

    async fn recall(&self, message_id: &str) -> Result<()> {
        let conversation_id = self.store.lock().conversation_id().to_string();
        self.conn
            .invoke(ClientFrame::Recall {
                conversation_id,
                message_id: message_id.to_string(),
            })
            .await?;
        self.store.lock().recall(message_id);
        Ok(())
    }
}

impl Drop for LiveChannelChat {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// AI assistant chat over the stateless request/response API.
pub struct RequestResponseChat {
    assistant: Arc<AssistantClient>,
    store: SharedMessageStore,
    pagination: PaginationController<HistoryClient>,
    pipeline: Arc<SendPipeline>,
}

impl RequestResponseChat {
    pub async fn open(
        assistant: Arc<AssistantClient>,
        history: Arc<HistoryClient>,
        cfg: &CoreConfig,
        user_id: &str,
    ) -> Result<Self> {
        let conversation_id = ai_conversation_id(user_id);
        let store = MessageStore::shared(conversation_id.clone(), user_id);
        let pipeline = Arc::new(SendPipeline::new(store.clone(), user_id));
        let pagination = PaginationController::new(history, store.clone(), cfg.page_size);
        pagination.load_initial().await?;

        info!(%conversation_id, "assistant conversation opened");
        Ok(Self {
            assistant,
            store,
            pagination,
            pipeline,
        })
    }
}

/// Routes server events for one conversation into its store.
///
/// Everything funnels through the same merge/reconcile primitives the
/// other producers use, so ordering between a pagination fetch and a
/// live push resolving in either order is absorbed by idempotent union.
#[allow(clippy::too_many_arguments)]
async fn event_pump(
    mut events: broadcast::Receiver<ServerEvent>,
    mut states: watch::Receiver<ConnectionState>,
    conversation_id: String,
    viewer_id: String,
    store: SharedMessageStore,
    pipeline: Arc<SendPipeline>,
    receipts: Arc<ReadReceiptReconciler>,
    presence: Arc<Mutex<PresenceTracker>>,
    listing_changed: Arc<AtomicBool>,
    blocked: Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "event pump lagged behind the channel");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                if event
                    .conversation_id()
                    .is_some_and(|id| id != conversation_id)
                {
                    continue;
                }

                match event {
                    ServerEvent::NewMessage { message, client_id } => {
                        pipeline.on_server_message(client_id, message);
                    }
                    ServerEvent::MessageRecalled { message_id, .. } => {
                        store.lock().recall(&message_id);
                    }
                    ServerEvent::Seen { seen_by, up_to, .. } => {
                        receipts.on_remote_seen(&seen_by, up_to);
                    }
                    ServerEvent::Presence { user_id, online, at } => {
                        // Presence carries no conversation tag; attribute
                        // it to this conversation's peer only, never to
                        // some third user.
                        let is_peer = store.lock().peer_id() == Some(user_id.as_str());
                        if is_peer {
                            presence.lock().observe(PresenceSource::Push, online, at);
                        }
                    }
                    ServerEvent::ConversationUpdated { .. } => {
                        listing_changed.store(true, Ordering::Relaxed);
                    }
                    ServerEvent::Blocked { by, .. } => {
                        if by != viewer_id {
                            blocked.store(true, Ordering::Relaxed);
                        }
                    }
                    ServerEvent::Unblocked { by, .. } => {
                        if by != viewer_id {
                            blocked.store(false, Ordering::Relaxed);
                        }
                    }
                    ServerEvent::Joined { .. } => {
                        debug!(%conversation_id, "room join confirmed");
                    }
                }
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let connected = *states.borrow() == ConnectionState::Connected;
                presence.lock().set_live_authoritative(connected);
            }
        }
    }
    debug!(%conversation_id, "event pump stopped");
}
