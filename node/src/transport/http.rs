use async_trait::async_trait;
use chatmirror_messaging::{
    OutboundTransport, OutgoingMessage, ReactionTarget, ReactionType, TransportError,
};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

const PING_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Serialize)]
struct MessageBody<'a> {
    chat_id: i64,
    text: &'a str,
}

#[derive(Serialize)]
struct NewChatBody<'a> {
    recipient_string: String,
    text: &'a str,
}

#[derive(Serialize)]
struct ReactionBody {
    chat_id: i64,
    associated_guid: String,
    associated_type: i64,
}

/// Queues sends through the host's HTTP API.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self, TransportError> {
        let client = Client::builder()
            .use_rustls_tls()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|err| TransportError::Command(format!("failed to build http client: {err}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<(), TransportError> {
        let mut request = self.client.post(format!("{}{}", self.base_url, path)).json(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(host_unreachable)?;
        let status = response.status();
        if status.is_success() {
            debug!(path, %status, "request queued by host");
            return Ok(());
        }
        let detail = response.text().await.unwrap_or_default();
        Err(rejected(status, &detail))
    }
}

fn host_unreachable(err: reqwest::Error) -> TransportError {
    TransportError::Unreachable(err.to_string())
}

fn rejected(status: StatusCode, detail: &str) -> TransportError {
    TransportError::Rejected(format!("{status}: {}", detail.trim()))
}

#[async_trait]
impl OutboundTransport for HttpTransport {
    async fn send_message(&self, message: OutgoingMessage<'_>) -> Result<(), TransportError> {
        match message.chat_id {
            Some(chat_id) => {
                self.post(
                    "/message",
                    &MessageBody {
                        chat_id,
                        text: message.text,
                    },
                )
                .await
            }
            None => {
                self.post(
                    "/chat",
                    &NewChatBody {
                        recipient_string: message.recipient_string(),
                        text: message.text,
                    },
                )
                .await
            }
        }
    }

    async fn send_reaction(
        &self,
        chat_id: i64,
        target: &ReactionTarget,
        reaction_type: ReactionType,
    ) -> Result<(), TransportError> {
        self.post(
            "/reaction",
            &ReactionBody {
                chat_id,
                associated_guid: target.associated_guid(),
                associated_type: reaction_type.code(),
            },
        )
        .await
    }

    /// Any HTTP answer counts; only connection failures mean down.
    async fn ping(&self) -> bool {
        self.client
            .get(&self.base_url)
            .timeout(PING_TIMEOUT)
            .send()
            .await
            .is_ok()
    }
}
