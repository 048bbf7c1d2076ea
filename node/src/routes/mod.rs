pub mod chats;
pub mod health;

use crate::state::AppState;
use axum::Router;
use std::sync::Arc;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(health::routes())
        .merge(chats::routes())
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::router;
    use crate::chats::ChatDirectory;
    use crate::config::AppConfig;
    use crate::state::AppState;
    use crate::storage::fixtures::{chat, message, push_message};
    use crate::storage::{ChangeSet, ChatHandleJoin, HandleRow, MessageRepository, MirrorDb};
    use crate::sync::Connectivity;
    use crate::testing::ScriptedTransport;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use axum::response::Response;
    use axum::Router;
    use std::sync::Arc;
    use tokio::sync::watch;

    /// Router over a two-chat mirror: chat 1 (one handle, message 10 at t=100)
    /// and chat 2 (message 20 at t=500).
    pub fn test_app() -> (Router, Arc<ScriptedTransport>) {
        let db = MirrorDb::open_in_memory().unwrap();
        let mut changes = ChangeSet::default();
        changes.chat.push(chat(1, "+15555550100"));
        changes.chat.push(chat(2, "chat-two"));
        changes.handle.push(HandleRow {
            rowid: Some(9),
            id: "+15555550100".into(),
            ..Default::default()
        });
        changes.chat_handle_join.push(ChatHandleJoin {
            chat_id: 1,
            handle_id: 9,
        });
        push_message(&mut changes, message(10, 1, "hello", 100));
        push_message(&mut changes, message(20, 2, "later", 500));
        db.apply_changes(&changes).unwrap();

        let directory = Arc::new(ChatDirectory::new(MessageRepository::new(db)));
        directory.load_all().unwrap();
        let transport = Arc::new(ScriptedTransport::reachable(true));
        let (_connectivity_tx, connectivity) = watch::channel(Connectivity::Up);
        let (_checkpoint_tx, checkpoint) = watch::channel(500);
        let config = AppConfig {
            build_id: "test-build".into(),
            ..AppConfig::default()
        };
        let state = AppState::new(config, directory, transport.clone(), connectivity, checkpoint);
        (router(state), transport)
    }

    pub fn request(method: &str, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
        let builder = Request::builder().method(method).uri(uri);
        match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    pub async fn read_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }
}
