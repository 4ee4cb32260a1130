//! Connection service loop.
//!
//! One connection at a time; further connects queue in the OS backlog.
//! Per connection: peer authorization first, then a request/response loop
//! with the read timeout, the size limit (close without responding) and the
//! per-identity rate limit (respond, then close).

use std::sync::Arc;

use tokio::net::UnixStream;
use tracing::{debug, info, warn};

use flowgate_common::proto::{self, RequestEnvelope, Source};
use flowgate_common::{consts, Error, ErrorKind, Result};

use flowgate_common::framing::{read_frame, write_frame};

use crate::authz;
use crate::state::ServiceState;

use super::handlers;

#[cfg(unix)]
pub async fn serve(listener: tokio::net::UnixListener, state: Arc<ServiceState>) -> Result<()> {
    info!(path = %state.socket_path().display(), "IPC endpoint listening");
    loop {
        let (stream, _addr) = listener
            .accept()
            .await
            .map_err(|e| Error::Ipc(format!("accept failed: {e}")))?;
        if let Err(err) = handle_connection(stream, &state).await {
            debug!(?err, "connection ended with error");
        }
    }
}

#[cfg(unix)]
async fn handle_connection(mut stream: UnixStream, state: &Arc<ServiceState>) -> Result<()> {
    let cred = stream
        .peer_cred()
        .map_err(|e| Error::Ipc(format!("peer credentials unavailable: {e}")))?;
    let identity = match authz::authorize_peer(cred.uid(), cred.gid()) {
        Ok(identity) => identity,
        Err(err) => {
            warn!(uid = cred.uid(), "unauthorized connection");
            let response = proto::error_response(&err);
            let _ = write_frame(&mut stream, response.to_string().as_bytes()).await;
            return Ok(());
        }
    };
    debug!(user = %identity.username, "connection authorized");

    // Connection-scoped source attribute, updated by request hints.
    let mut source = Source::Cli;

    loop {
        let frame = match tokio::time::timeout(consts::READ_TIMEOUT, read_frame(&mut stream)).await
        {
            Err(_) => {
                debug!("read timed out; closing connection");
                return Ok(());
            }
            Ok(Ok(None)) => return Ok(()),
            Ok(Ok(Some(frame))) => frame,
            Ok(Err(err)) if err.kind() == ErrorKind::RequestTooLarge => {
                // Oversized frame: close without a response body.
                warn!(%err, "oversized request; closing connection");
                return Ok(());
            }
            Ok(Err(err)) => return Err(err),
        };

        if let Err(err) = state.rate_limiter.check(&identity.username) {
            let response = proto::error_response(&err);
            let _ = write_frame(&mut stream, response.to_string().as_bytes()).await;
            return Ok(());
        }

        let response = match RequestEnvelope::parse(&frame) {
            Err(err) => proto::error_response(&err),
            Ok(env) => {
                if let Some(hint) = env.source.as_deref().and_then(Source::parse_hint) {
                    source = hint;
                }
                match env.check_protocol_version() {
                    Err(err) => proto::error_response(&err),
                    Ok(()) => match handlers::dispatch(state, &env, source).await {
                        Ok(fields) => proto::ok_response(fields),
                        Err(err) => proto::error_response(&err),
                    },
                }
            }
        };
        let failed = response.get("ok") != Some(&serde_json::Value::Bool(true));
        write_frame(&mut stream, response.to_string().as_bytes()).await?;
        // Error responses end the exchange; the client reconnects.
        if failed {
            return Ok(());
        }
    }
}
