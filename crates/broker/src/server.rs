//! Broker accept loop.

use std::sync::Arc;

use cachefs_channel::{CredentialListener, CredentialStream};
use cachefs_protocol::BrokerReply;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::Authorizer;
use crate::error::BrokerError;
use crate::ops::BrokerOps;

/// Serves broker requests until cancelled.
pub struct BrokerServer {
    listener: CredentialListener,
    authorizer: Authorizer,
    ops: Arc<BrokerOps>,
}

impl BrokerServer {
    pub fn new(listener: CredentialListener, authorizer: Authorizer, ops: BrokerOps) -> Self {
        Self {
            listener,
            authorizer,
            ops: Arc::new(ops),
        }
    }

    /// Accepts connections until `cancel` fires. Each connection is served
    /// on its own task; a failing connection never stops the broker.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), BrokerError> {
        info!(
            socket = %self.listener.path().display(),
            authorized_pid = self.authorizer.authorized_pid(),
            "broker ready"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("broker shutting down");
                    break Ok(());
                }
                result = self.listener.accept() => {
                    match result {
                        Ok(stream) => {
                            let authorizer = self.authorizer;
                            let ops = Arc::clone(&self.ops);
                            let cancel = cancel.clone();
                            tokio::spawn(async move {
                                let peer = stream.peer();
                                if let Err(e) = serve_connection(stream, authorizer, ops, cancel).await {
                                    warn!(%peer, "broker connection ended: {e}");
                                }
                            });
                        }
                        Err(e) => error!("broker accept error: {e}"),
                    }
                }
            }
        }
    }
}

/// Answers every request on `stream` with exactly one reply.
async fn serve_connection(
    mut stream: CredentialStream,
    authorizer: Authorizer,
    ops: Arc<BrokerOps>,
    cancel: CancellationToken,
) -> Result<(), BrokerError> {
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            message = stream.recv_credentialed() => match message? {
                Some(message) => message,
                None => {
                    debug!(peer = %stream.peer(), "broker peer disconnected");
                    return Ok(());
                }
            },
        };

        let reply = match authorizer.decode(&message) {
            Ok(request) => {
                let verb = request.verb();
                let ops = Arc::clone(&ops);
                let peer = message.peer;
                let outcome = tokio::task::spawn_blocking(move || ops.execute(&request, peer))
                    .await
                    .map_err(|e| BrokerError::Task(e.to_string()))
                    .and_then(|result| result);
                match outcome {
                    Ok(()) => {
                        debug!(verb, "broker request done");
                        BrokerReply::Ack
                    }
                    Err(e) => {
                        warn!(verb, "broker request failed: {e}");
                        BrokerReply::rejected(e.to_string())
                    }
                }
            }
            Err(rejection) => {
                warn!(peer = %message.peer, "broker request rejected: {rejection}");
                rejection.reply()
            }
        };

        stream.send(&reply.encode()).await?;
    }
}
