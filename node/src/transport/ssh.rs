use async_trait::async_trait;
use chatmirror_messaging::{
    OutboundTransport, OutgoingMessage, ReactionTarget, ReactionType, TransportError,
};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::debug;

const SSH_PORT: u16 = 22;
const PING_TIMEOUT: Duration = Duration::from_secs(1);
/// Exit status ssh itself uses for connection errors.
const SSH_CONNECT_FAILURE: i32 = 255;

const MESSAGE_CODE: u8 = 0;
const REACTION_CODE: u8 = 1;

/// Runs the host-side send script over ssh.
#[derive(Debug, Clone)]
pub struct SshTransport {
    user: String,
    host: String,
    script_path: String,
}

/// Arguments of one script invocation, in the order the script reads them.
#[derive(Debug, Default)]
struct ScriptCall<'a> {
    text: &'a str,
    chat_id: Option<i64>,
    code: u8,
    message_id: i64,
    reaction_type: i64,
    recipients: &'a str,
}

impl SshTransport {
    pub fn new(
        user: impl Into<String>,
        host: impl Into<String>,
        script_path: impl Into<String>,
    ) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            script_path: script_path.into(),
        }
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    fn remote_command(&self, call: &ScriptCall<'_>) -> String {
        let chat_id = call.chat_id.map(|id| id.to_string()).unwrap_or_default();
        format!(
            "python {} {} '{}' '{}' '{}' '{}' {}",
            single_quote(&self.script_path),
            ansi_c_quote(call.text),
            chat_id,
            call.code,
            call.message_id,
            call.reaction_type,
            ansi_c_quote(call.recipients),
        )
    }

    async fn run(&self, call: ScriptCall<'_>) -> Result<(), TransportError> {
        let output = Command::new("ssh")
            .arg(self.destination())
            .arg(self.remote_command(&call))
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| TransportError::Command(format!("failed to spawn ssh: {err}")))?;

        if output.status.success() {
            debug!(code = call.code, chat_id = ?call.chat_id, "remote script finished");
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        match output.status.code() {
            Some(SSH_CONNECT_FAILURE) => Err(TransportError::Unreachable(stderr)),
            code => Err(TransportError::Command(format!(
                "remote script exited with {code:?}: {stderr}"
            ))),
        }
    }
}

/// `$'...'` quoting, so newlines and quotes in message text survive the remote shell.
fn ansi_c_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 3);
    quoted.push_str("$'");
    for c in value.chars() {
        match c {
            '\\' => quoted.push_str("\\\\"),
            '\'' => quoted.push_str("\\'"),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            '\t' => quoted.push_str("\\t"),
            c => quoted.push(c),
        }
    }
    quoted.push('\'');
    quoted
}

fn single_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[async_trait]
impl OutboundTransport for SshTransport {
    async fn send_message(&self, message: OutgoingMessage<'_>) -> Result<(), TransportError> {
        let recipients = message.recipient_string();
        self.run(ScriptCall {
            text: message.text,
            chat_id: message.chat_id,
            code: MESSAGE_CODE,
            recipients: &recipients,
            ..Default::default()
        })
        .await
    }

    async fn send_reaction(
        &self,
        chat_id: i64,
        target: &ReactionTarget,
        reaction_type: ReactionType,
    ) -> Result<(), TransportError> {
        self.run(ScriptCall {
            chat_id: Some(chat_id),
            code: REACTION_CODE,
            message_id: target.message_id,
            reaction_type: reaction_type.code(),
            ..Default::default()
        })
        .await
    }

    async fn ping(&self) -> bool {
        let connect = TcpStream::connect((self.host.as_str(), SSH_PORT));
        matches!(tokio::time::timeout(PING_TIMEOUT, connect).await, Ok(Ok(_)))
    }
}
