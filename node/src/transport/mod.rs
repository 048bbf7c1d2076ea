//! Outbound transports that ask the remote host to send on our behalf.

mod http;
mod ssh;

pub use http::HttpTransport;
pub use ssh::SshTransport;

use crate::config::{AppConfig, TransportKind};
use anyhow::Context;
use chatmirror_messaging::OutboundTransport;
use std::sync::Arc;

/// Build the transport selected by configuration.
pub fn from_config(config: &AppConfig) -> anyhow::Result<Arc<dyn OutboundTransport>> {
    match config.transport {
        TransportKind::Http => {
            let transport = HttpTransport::new(&config.remote_url, config.remote_token.clone())
                .context("failed to set up http transport")?;
            Ok(Arc::new(transport))
        }
        TransportKind::Ssh => {
            let ssh = config
                .ssh
                .as_ref()
                .context("ssh transport selected but no ssh user/host/script configured")?;
            Ok(Arc::new(SshTransport::new(
                &ssh.user,
                &ssh.host,
                &ssh.script_path,
            )))
        }
    }
}
