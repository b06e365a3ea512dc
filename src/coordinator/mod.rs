//! Streaming completion coordinator.
//!
//! Owns the bus-facing behavior of the daemon: content updates from page
//! contexts land in the snapshot cache, content queries are answered from it,
//! and user prompts become streamed completions. Sessions are keyed by
//! `(connection, session key)`; a new prompt under a live key supersedes the
//! running completion, which is cancelled and emits nothing further.

mod assembler;
mod session;

pub use assembler::{assemble, ContextPage, NO_CONTENT_PLACEHOLDER};
pub use session::{ActiveSession, SessionKey, SessionState};

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::StreamExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::protocol::{
    ContentDelta, ContentInit, GetContentReply, GetContentRequest, ListPagesReply, PageContent,
    PageListing, TurnRole, UserPromptRequest,
};
use crate::bus::{
    handler, Channel, ConnectionId, HandlerGuard, HandlerScope, MessageBus, MessageContext, Reply,
    Request, StreamHandle,
};
use crate::cache::{ChangeType, ContentUpdate, SnapshotCache};
use crate::llm::{ChatMessage, ChatOptions, CompletionClient};
use crate::settings::SettingsStore;

const SYSTEM_PROMPT: &str = "You are a browsing assistant. Answer the user's question using the \
page content provided below. If the content does not contain the answer, say so rather than \
guessing.";

pub struct Coordinator {
    cache: Arc<SnapshotCache>,
    settings: Arc<SettingsStore>,
    client: Arc<dyn CompletionClient>,
    sessions: Mutex<HashMap<SessionKey, ActiveSession>>,
    /// Pages owned by each page connection, cleared when it disconnects.
    pages_by_conn: Mutex<HashMap<ConnectionId, HashSet<u64>>>,
    max_history_turns: usize,
}

impl Coordinator {
    pub fn new(
        cache: Arc<SnapshotCache>,
        settings: Arc<SettingsStore>,
        client: Arc<dyn CompletionClient>,
        max_history_turns: usize,
    ) -> Self {
        Self {
            cache,
            settings,
            client,
            sessions: Mutex::new(HashMap::new()),
            pages_by_conn: Mutex::new(HashMap::new()),
            max_history_turns,
        }
    }

    /// Register the coordinator's channel handlers on the bus. The handlers
    /// stay registered for as long as the returned guards are held.
    pub fn attach(self: &Arc<Self>, bus: &Arc<MessageBus>) -> Vec<HandlerGuard> {
        let mut guards = Vec::new();

        let coordinator = self.clone();
        guards.push(bus.register_handler(
            Channel::ContentInit,
            HandlerScope::Global,
            handler(move |request, ctx| {
                let coordinator = coordinator.clone();
                async move {
                    if let Request::ContentInit(init) = request {
                        coordinator.handle_content_init(&ctx.connection, init).await;
                    }
                }
            }),
        ));

        let coordinator = self.clone();
        guards.push(bus.register_handler(
            Channel::ContentDelta,
            HandlerScope::Global,
            handler(move |request, ctx| {
                let coordinator = coordinator.clone();
                async move {
                    if let Request::ContentDelta(delta) = request {
                        coordinator.handle_content_delta(&ctx.connection, delta).await;
                    }
                }
            }),
        ));

        let coordinator = self.clone();
        guards.push(bus.register_handler(
            Channel::GetContent,
            HandlerScope::Global,
            handler(move |request, ctx| {
                let coordinator = coordinator.clone();
                async move {
                    if let Request::GetContent(req) = request {
                        coordinator.handle_get_content(req, &ctx).await;
                    }
                }
            }),
        ));

        let coordinator = self.clone();
        guards.push(bus.register_handler(
            Channel::ListPages,
            HandlerScope::Global,
            handler(move |request, ctx| {
                let coordinator = coordinator.clone();
                async move {
                    if let Request::ListPages(_) = request {
                        coordinator.handle_list_pages(&ctx).await;
                    }
                }
            }),
        ));

        let coordinator = self.clone();
        guards.push(bus.register_handler(
            Channel::UserPrompt,
            HandlerScope::Global,
            handler(move |request, ctx| {
                let coordinator = coordinator.clone();
                async move {
                    if let Request::UserPrompt(req) = request {
                        coordinator.handle_prompt(req, &ctx);
                    }
                }
            }),
        ));

        guards
    }

    async fn handle_content_init(&self, conn: &ConnectionId, init: ContentInit) {
        self.track_page(conn, init.page_id);
        let snapshot = self
            .cache
            .put(ContentUpdate {
                page_id: init.page_id,
                url: init.url,
                title: Some(init.title),
                content: init.content,
                change_type: ChangeType::Init,
                timestamp: init.timestamp,
            })
            .await;
        debug!(
            page_id = snapshot.page_id,
            version = snapshot.version,
            "Captured initial page content"
        );
    }

    async fn handle_content_delta(&self, conn: &ConnectionId, delta: ContentDelta) {
        self.track_page(conn, delta.page_id);
        let snapshot = self
            .cache
            .put(ContentUpdate {
                page_id: delta.page_id,
                url: delta.url,
                title: None,
                content: delta.content,
                change_type: delta.change_type,
                timestamp: delta.timestamp,
            })
            .await;
        debug!(
            page_id = snapshot.page_id,
            version = snapshot.version,
            change_type = ?snapshot.change_type,
            "Captured content delta"
        );
    }

    async fn handle_get_content(&self, req: GetContentRequest, ctx: &MessageContext) {
        let snapshots = self.cache.get_latest_many(&req.page_ids).await;
        let pages = snapshots
            .into_iter()
            .map(|snapshot| {
                snapshot.map(|s| PageContent {
                    page_id: s.page_id,
                    url: s.url,
                    title: s.title,
                    content: s.content,
                    last_updated: s.timestamp,
                })
            })
            .collect();
        ctx.reply(Reply::GetContent(GetContentReply { pages }));
    }

    async fn handle_list_pages(&self, ctx: &MessageContext) {
        let pages = self
            .cache
            .latest_snapshots()
            .await
            .into_iter()
            .map(|s| PageListing {
                id: s.page_id,
                title: s.title,
                url: s.url,
                favicon_url: None,
            })
            .collect();
        ctx.reply(Reply::ListPages(ListPagesReply { pages }));
    }

    /// Start a completion session. Registration and supersede happen
    /// synchronously; the completion itself runs on its own task so dispatch
    /// is never blocked on the provider.
    fn handle_prompt(self: &Arc<Self>, req: UserPromptRequest, ctx: &MessageContext) {
        let Some(handle) = ctx.stream() else {
            warn!(connection = %ctx.connection, "Prompt without a request id, dropping");
            return;
        };

        let key = SessionKey::new(ctx.connection.clone(), req.session_key.clone());
        let session = ActiveSession::new(
            handle.request_id().to_string(),
            req.page_ids.clone(),
            handle.cancel_token(),
        );
        let session_id = session.id;
        {
            let mut sessions = self.sessions.lock().unwrap();
            if let Some(previous) = sessions.insert(key.clone(), session) {
                debug!(
                    connection = %key.connection,
                    session_key = %key.key,
                    superseded_request = %previous.request_id,
                    pages = previous.page_ids.len(),
                    "Superseding running completion"
                );
                previous.cancel.cancel();
            }
        }

        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator.run_session(key, session_id, req, handle).await;
        });
    }

    async fn run_session(
        self: Arc<Self>,
        key: SessionKey,
        session_id: Uuid,
        req: UserPromptRequest,
        handle: StreamHandle,
    ) {
        let cancel = handle.cancel_token();

        let snapshots = self.cache.get_latest_many(&req.page_ids).await;
        let pages: Vec<ContextPage> = req
            .page_ids
            .iter()
            .zip(snapshots)
            .map(|(page_id, snapshot)| match snapshot {
                Some(s) => ContextPage {
                    url: s.url,
                    title: s.title,
                    content: s.content,
                    last_updated: Some(s.timestamp),
                },
                None => ContextPage::placeholder(*page_id),
            })
            .collect();
        let messages = self.build_messages(&req, &pages);

        let provider = self.settings.provider().await;
        let mut stream = match self
            .client
            .stream_chat(&provider.model, &messages, ChatOptions::default())
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "Failed to open completion stream");
                handle.error(e.to_string());
                self.finish_session(&key, session_id, SessionState::Error);
                return;
            }
        };
        self.set_state(&key, session_id, SessionState::Streaming);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    handle.close();
                    self.finish_session(&key, session_id, SessionState::Cancelled);
                    return;
                }
                item = stream.next() => match item {
                    Some(Ok(delta)) => handle.delta(delta.text),
                    Some(Err(e)) => {
                        warn!(error = %e, "Completion stream failed");
                        handle.error(e.to_string());
                        self.finish_session(&key, session_id, SessionState::Error);
                        return;
                    }
                    None => {
                        handle.done();
                        self.finish_session(&key, session_id, SessionState::Done);
                        return;
                    }
                }
            }
        }
    }

    fn build_messages(&self, req: &UserPromptRequest, pages: &[ContextPage]) -> Vec<ChatMessage> {
        let mut system = SYSTEM_PROMPT.to_string();
        let context = assemble(pages);
        if !context.is_empty() {
            system.push_str("\n\n");
            system.push_str(&context);
        }

        let mut messages = vec![ChatMessage::system(system)];
        let history = &req.conversation_history;
        let skip = history.len().saturating_sub(self.max_history_turns);
        for turn in &history[skip..] {
            messages.push(match turn.role {
                TurnRole::User => ChatMessage::user(turn.content.as_str()),
                TurnRole::Assistant => ChatMessage::assistant(turn.content.as_str()),
            });
        }
        messages.push(ChatMessage::user(req.prompt.as_str()));
        messages
    }

    fn set_state(&self, key: &SessionKey, session_id: Uuid, state: SessionState) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(session) = sessions.get_mut(key) {
            if session.id == session_id {
                session.state = state;
            }
        }
    }

    /// Remove the session entry, unless a successor already replaced it.
    fn finish_session(&self, key: &SessionKey, session_id: Uuid, state: SessionState) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(session) = sessions.get(key) {
            if session.id == session_id {
                let elapsed = Utc::now() - session.started_at;
                debug!(
                    session_key = %key.key,
                    state = ?state,
                    elapsed_ms = elapsed.num_milliseconds(),
                    "Completion session finished"
                );
                sessions.remove(key);
            }
        }
    }

    fn track_page(&self, conn: &ConnectionId, page_id: u64) {
        self.pages_by_conn
            .lock()
            .unwrap()
            .entry(conn.clone())
            .or_default()
            .insert(page_id);
    }

    /// A page connection went away; its snapshots are no longer useful.
    pub async fn page_connection_closed(&self, conn: &ConnectionId) {
        let pages = self.pages_by_conn.lock().unwrap().remove(conn);
        if let Some(pages) = pages {
            let page_ids: Vec<u64> = pages.into_iter().collect();
            debug!(connection = %conn, pages = page_ids.len(), "Clearing snapshots for closed page connection");
            self.cache.clear_many(&page_ids).await;
        }
    }

    /// A UI connection went away; its sessions are cancelled and dropped.
    /// The bus already cancelled the stream tokens, so this is bookkeeping.
    pub fn ui_connection_closed(&self, conn: &ConnectionId) {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.retain(|key, session| {
            if &key.connection == conn {
                session.cancel.cancel();
                false
            } else {
                true
            }
        });
    }

    #[cfg(test)]
    fn active_session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::time::Duration;

    use chrono::Utc;
    use futures::stream::BoxStream;
    use tokio::sync::mpsc;

    use crate::bus::protocol::HistoryTurn;
    use crate::bus::{ConnectionKind, Frame};
    use crate::cache::{CacheConfig, SnapshotCache};
    use crate::config::Config;
    use crate::llm::{CompletionStream, LlmError, StreamDelta};

    struct StubClient {
        captured: Mutex<Vec<(String, Vec<ChatMessage>)>>,
        scripts: Mutex<VecDeque<CompletionStream>>,
    }

    impl StubClient {
        fn new(scripts: Vec<CompletionStream>) -> Self {
            Self {
                captured: Mutex::new(Vec::new()),
                scripts: Mutex::new(scripts.into_iter().collect()),
            }
        }

        fn text_stream(parts: &[&str]) -> CompletionStream {
            let items: Vec<Result<StreamDelta, LlmError>> = parts
                .iter()
                .map(|p| {
                    Ok(StreamDelta {
                        text: p.to_string(),
                    })
                })
                .collect();
            futures::stream::iter(items).boxed()
        }

        fn pending_stream() -> CompletionStream {
            let stream: BoxStream<'static, Result<StreamDelta, LlmError>> =
                futures::stream::pending().boxed();
            stream
        }

        fn calls(&self) -> usize {
            self.captured.lock().unwrap().len()
        }

        fn messages_of_call(&self, call: usize) -> Vec<ChatMessage> {
            self.captured.lock().unwrap()[call].1.clone()
        }
    }

    #[async_trait::async_trait]
    impl CompletionClient for StubClient {
        async fn stream_chat(
            &self,
            model: &str,
            messages: &[ChatMessage],
            _options: ChatOptions,
        ) -> Result<CompletionStream, LlmError> {
            self.captured
                .lock()
                .unwrap()
                .push((model.to_string(), messages.to_vec()));
            Ok(self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Self::text_stream(&[])))
        }
    }

    async fn setup(
        client: Arc<StubClient>,
    ) -> (
        Arc<MessageBus>,
        Arc<Coordinator>,
        Arc<SnapshotCache>,
        Vec<HandlerGuard>,
    ) {
        let config = Config::default();
        let cache = Arc::new(SnapshotCache::new(CacheConfig::default()));
        let settings = Arc::new(SettingsStore::load(&config).await);
        let coordinator = Arc::new(Coordinator::new(
            cache.clone(),
            settings,
            client,
            config.max_history_turns,
        ));
        let bus = Arc::new(MessageBus::new());
        let guards = coordinator.attach(&bus);
        (bus, coordinator, cache, guards)
    }

    async fn next_frame(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Frame {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("outbound channel closed")
    }

    fn content_init(page_id: u64, url: &str, title: &str, content: &str) -> Frame {
        Frame::Message {
            request_id: None,
            payload: Request::ContentInit(ContentInit {
                page_id,
                url: url.to_string(),
                title: title.to_string(),
                content: content.to_string(),
                timestamp: Utc::now(),
            }),
        }
    }

    fn prompt(request_id: &str, session_key: &str, prompt: &str, page_ids: Vec<u64>) -> Frame {
        Frame::Message {
            request_id: Some(request_id.to_string()),
            payload: Request::UserPrompt(UserPromptRequest {
                prompt: prompt.to_string(),
                page_ids,
                session_key: session_key.to_string(),
                conversation_history: Vec::new(),
            }),
        }
    }

    async fn wait_for_calls(stub: &StubClient, count: usize) {
        for _ in 0..200 {
            if stub.calls() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("stub never reached {} calls", count);
    }

    #[tokio::test]
    async fn test_prompt_streams_deltas_then_done() {
        let stub = Arc::new(StubClient::new(vec![StubClient::text_stream(&[
            "Sum", "mary",
        ])]));
        let (bus, coordinator, _cache, _guards) = setup(stub.clone()).await;
        let (page_conn, _page_rx) = bus.connect(ConnectionKind::Page);
        let (ui_conn, mut ui_rx) = bus.connect(ConnectionKind::Ui);

        bus.dispatch(&page_conn, content_init(1, "https://a", "Alpha", "alpha body"))
            .await;
        bus.dispatch(&page_conn, content_init(2, "https://b", "Beta", "beta body"))
            .await;
        bus.dispatch(&ui_conn, prompt("r1", "s1", "summarize", vec![1, 2]))
            .await;

        match next_frame(&mut ui_rx).await {
            Frame::Delta { request_id, text } => {
                assert_eq!(request_id, "r1");
                assert_eq!(text, "Sum");
            }
            other => panic!("expected delta, got {:?}", other),
        }
        match next_frame(&mut ui_rx).await {
            Frame::Delta { text, .. } => assert_eq!(text, "mary"),
            other => panic!("expected delta, got {:?}", other),
        }
        match next_frame(&mut ui_rx).await {
            Frame::Done { request_id } => assert_eq!(request_id, "r1"),
            other => panic!("expected done, got {:?}", other),
        }

        let messages = stub.messages_of_call(0);
        assert_eq!(messages.len(), 2, "system plus user prompt");
        assert!(messages[0].content.contains("alpha body"));
        assert!(messages[0].content.contains("beta body"));
        assert_eq!(messages[1].content, "summarize");

        // Session bookkeeping is cleaned up after the terminal frame.
        for _ in 0..200 {
            if coordinator.active_session_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("session entry never removed");
    }

    #[tokio::test]
    async fn test_missing_page_gets_placeholder() {
        let stub = Arc::new(StubClient::new(vec![StubClient::text_stream(&["ok"])]));
        let (bus, _coordinator, _cache, _guards) = setup(stub.clone()).await;
        let (ui_conn, mut ui_rx) = bus.connect(ConnectionKind::Ui);

        bus.dispatch(&ui_conn, prompt("r1", "s1", "what is this", vec![42]))
            .await;
        // Drain through the terminal frame so the call is fully captured.
        loop {
            if let Frame::Done { .. } = next_frame(&mut ui_rx).await {
                break;
            }
        }

        let messages = stub.messages_of_call(0);
        assert!(messages[0].content.contains("Page 42"));
        assert!(messages[0].content.contains(NO_CONTENT_PLACEHOLDER));
    }

    #[tokio::test]
    async fn test_new_prompt_supersedes_running_session() {
        let stub = Arc::new(StubClient::new(vec![
            StubClient::pending_stream(),
            StubClient::text_stream(&["ok"]),
        ]));
        let (bus, _coordinator, _cache, _guards) = setup(stub.clone()).await;
        let (ui_conn, mut ui_rx) = bus.connect(ConnectionKind::Ui);

        bus.dispatch(&ui_conn, prompt("r1", "s1", "first", vec![])).await;
        wait_for_calls(&stub, 1).await;
        bus.dispatch(&ui_conn, prompt("r2", "s1", "second", vec![])).await;

        // Only the successor emits; the superseded stream goes silent with no
        // terminal frame.
        match next_frame(&mut ui_rx).await {
            Frame::Delta { request_id, text } => {
                assert_eq!(request_id, "r2");
                assert_eq!(text, "ok");
            }
            other => panic!("expected delta for r2, got {:?}", other),
        }
        match next_frame(&mut ui_rx).await {
            Frame::Done { request_id } => assert_eq!(request_id, "r2"),
            other => panic!("expected done for r2, got {:?}", other),
        }
        assert!(
            tokio::time::timeout(Duration::from_millis(100), ui_rx.recv())
                .await
                .is_err(),
            "superseded session must not emit"
        );
    }

    #[tokio::test]
    async fn test_distinct_session_keys_run_independently() {
        let stub = Arc::new(StubClient::new(vec![
            StubClient::pending_stream(),
            StubClient::text_stream(&["ok"]),
        ]));
        let (bus, coordinator, _cache, _guards) = setup(stub.clone()).await;
        let (ui_conn, mut ui_rx) = bus.connect(ConnectionKind::Ui);

        bus.dispatch(&ui_conn, prompt("r1", "s1", "first", vec![])).await;
        wait_for_calls(&stub, 1).await;
        bus.dispatch(&ui_conn, prompt("r2", "s2", "second", vec![])).await;

        match next_frame(&mut ui_rx).await {
            Frame::Delta { request_id, .. } => assert_eq!(request_id, "r2"),
            other => panic!("expected delta for r2, got {:?}", other),
        }
        match next_frame(&mut ui_rx).await {
            Frame::Done { request_id } => assert_eq!(request_id, "r2"),
            other => panic!("expected done for r2, got {:?}", other),
        }
        // The first session is still live under its own key.
        assert_eq!(coordinator.active_session_count(), 1);
    }

    #[tokio::test]
    async fn test_stream_error_becomes_error_frame() {
        let failing: CompletionStream = futures::stream::iter(vec![
            Ok(StreamDelta {
                text: "par".to_string(),
            }),
            Err(LlmError::server_error(500, "boom".to_string())),
        ])
        .boxed();
        let stub = Arc::new(StubClient::new(vec![failing]));
        let (bus, _coordinator, _cache, _guards) = setup(stub).await;
        let (ui_conn, mut ui_rx) = bus.connect(ConnectionKind::Ui);

        bus.dispatch(&ui_conn, prompt("r1", "s1", "hello", vec![])).await;

        match next_frame(&mut ui_rx).await {
            Frame::Delta { text, .. } => assert_eq!(text, "par"),
            other => panic!("expected delta, got {:?}", other),
        }
        match next_frame(&mut ui_rx).await {
            Frame::Error { request_id, .. } => assert_eq!(request_id, "r1"),
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_history_is_truncated_to_recent_turns() {
        let stub = Arc::new(StubClient::new(vec![StubClient::text_stream(&["ok"])]));
        let (bus, _coordinator, _cache, _guards) = setup(stub.clone()).await;
        let (ui_conn, mut ui_rx) = bus.connect(ConnectionKind::Ui);

        let history: Vec<HistoryTurn> = (0..25)
            .map(|i| HistoryTurn {
                role: if i % 2 == 0 {
                    TurnRole::User
                } else {
                    TurnRole::Assistant
                },
                content: format!("turn {}", i),
            })
            .collect();
        bus.dispatch(
            &ui_conn,
            Frame::Message {
                request_id: Some("r1".to_string()),
                payload: Request::UserPrompt(UserPromptRequest {
                    prompt: "latest".to_string(),
                    page_ids: vec![],
                    session_key: "s1".to_string(),
                    conversation_history: history,
                }),
            },
        )
        .await;
        loop {
            if let Frame::Done { .. } = next_frame(&mut ui_rx).await {
                break;
            }
        }

        let messages = stub.messages_of_call(0);
        // system + 10 most recent turns + prompt
        assert_eq!(messages.len(), 12);
        assert_eq!(messages[1].content, "turn 15");
        assert_eq!(messages[10].content, "turn 24");
        assert_eq!(messages[11].content, "latest");
    }

    #[tokio::test]
    async fn test_get_content_preserves_order_with_nulls() {
        let stub = Arc::new(StubClient::new(vec![]));
        let (bus, _coordinator, _cache, _guards) = setup(stub).await;
        let (page_conn, _page_rx) = bus.connect(ConnectionKind::Page);
        let (ui_conn, mut ui_rx) = bus.connect(ConnectionKind::Ui);

        bus.dispatch(&page_conn, content_init(1, "https://a", "Alpha", "a"))
            .await;
        bus.dispatch(&page_conn, content_init(2, "https://b", "Beta", "b"))
            .await;
        bus.dispatch(
            &ui_conn,
            Frame::Message {
                request_id: Some("r1".to_string()),
                payload: Request::GetContent(GetContentRequest {
                    page_ids: vec![2, 42, 1],
                }),
            },
        )
        .await;

        match next_frame(&mut ui_rx).await {
            Frame::Reply {
                request_id,
                payload: Reply::GetContent(reply),
            } => {
                assert_eq!(request_id, "r1");
                assert_eq!(reply.pages.len(), 3);
                assert_eq!(reply.pages[0].as_ref().unwrap().page_id, 2);
                assert!(reply.pages[1].is_none());
                assert_eq!(reply.pages[2].as_ref().unwrap().page_id, 1);
            }
            other => panic!("expected get-content reply, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_list_pages_reply() {
        let stub = Arc::new(StubClient::new(vec![]));
        let (bus, _coordinator, _cache, _guards) = setup(stub).await;
        let (page_conn, _page_rx) = bus.connect(ConnectionKind::Page);
        let (ui_conn, mut ui_rx) = bus.connect(ConnectionKind::Ui);

        bus.dispatch(&page_conn, content_init(2, "https://b", "Beta", "b"))
            .await;
        bus.dispatch(&page_conn, content_init(1, "https://a", "Alpha", "a"))
            .await;
        bus.dispatch(
            &ui_conn,
            Frame::Message {
                request_id: Some("r1".to_string()),
                payload: Request::ListPages(Default::default()),
            },
        )
        .await;

        match next_frame(&mut ui_rx).await {
            Frame::Reply {
                payload: Reply::ListPages(reply),
                ..
            } => {
                assert_eq!(reply.pages.len(), 2);
                assert_eq!(reply.pages[0].id, 1);
                assert_eq!(reply.pages[0].title, "Alpha");
                assert_eq!(reply.pages[1].id, 2);
            }
            other => panic!("expected list-pages reply, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_page_connection_close_clears_its_snapshots() {
        let stub = Arc::new(StubClient::new(vec![]));
        let (bus, coordinator, cache, _guards) = setup(stub).await;
        let (conn_a, _rx_a) = bus.connect(ConnectionKind::Page);
        let (conn_b, _rx_b) = bus.connect(ConnectionKind::Page);

        bus.dispatch(&conn_a, content_init(1, "https://a", "Alpha", "a")).await;
        bus.dispatch(&conn_b, content_init(2, "https://b", "Beta", "b")).await;

        coordinator.page_connection_closed(&conn_a).await;
        assert!(cache.get_latest(1).await.is_none());
        assert!(cache.get_latest(2).await.is_some());
    }

    #[tokio::test]
    async fn test_ui_connection_close_cancels_sessions() {
        let stub = Arc::new(StubClient::new(vec![StubClient::pending_stream()]));
        let (bus, coordinator, _cache, _guards) = setup(stub.clone()).await;
        let (ui_conn, _ui_rx) = bus.connect(ConnectionKind::Ui);

        bus.dispatch(&ui_conn, prompt("r1", "s1", "first", vec![])).await;
        wait_for_calls(&stub, 1).await;
        assert_eq!(coordinator.active_session_count(), 1);

        coordinator.ui_connection_closed(&ui_conn);
        for _ in 0..200 {
            if coordinator.active_session_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("cancelled session never removed");
    }
}
