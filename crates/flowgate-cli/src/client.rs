//! Framed request/response client for the service endpoint.

use std::path::PathBuf;

use serde_json::{Map, Value};
use tokio::net::UnixStream;

use flowgate_common::framing::{read_frame, write_frame};
use flowgate_common::{consts, Error, Result};

pub struct IpcClient {
    socket_path: PathBuf,
}

impl IpcClient {
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    /// Sends one `type`d request and returns the decoded response envelope.
    pub async fn call(&self, kind: &str, fields: Value) -> Result<Value> {
        let mut body = match fields {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(Error::InvalidArgument(format!(
                    "request fields must be an object, got {other}"
                )));
            }
        };
        body.insert("type".into(), Value::from(kind));
        body.insert(
            "protocolVersion".into(),
            Value::from(consts::PROTOCOL_VERSION),
        );
        body.insert("source".into(), Value::from("cli"));
        let payload = Value::Object(body).to_string();

        let mut stream =
            tokio::time::timeout(consts::CONNECT_TIMEOUT, UnixStream::connect(&self.socket_path))
                .await
                .map_err(|_| Error::RequestTimeout {
                    seconds: consts::CONNECT_TIMEOUT.as_secs(),
                })?
                .map_err(|err| {
                    Error::ServiceUnavailable(format!(
                        "cannot reach the service at '{}': {err} (is flowgated running?)",
                        self.socket_path.display()
                    ))
                })?;

        write_frame(&mut stream, payload.as_bytes()).await?;
        let frame = tokio::time::timeout(consts::READ_TIMEOUT, read_frame(&mut stream))
            .await
            .map_err(|_| Error::RequestTimeout {
                seconds: consts::READ_TIMEOUT.as_secs(),
            })??
            .ok_or_else(|| {
                Error::Ipc("service closed the connection without responding".to_string())
            })?;
        serde_json::from_slice(&frame)
            .map_err(|err| Error::Ipc(format!("malformed response JSON: {err}")))
    }

    /// `call`, then fail on `ok:false` with the server's code and message.
    pub async fn expect_ok(&self, kind: &str, fields: Value) -> Result<Value> {
        let response = self.call(kind, fields).await?;
        if response.get("ok").and_then(Value::as_bool) == Some(true) {
            return Ok(response);
        }
        let code = response
            .get("errorCode")
            .and_then(Value::as_str)
            .unwrap_or("ServiceError");
        let message = response
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("request failed");
        Err(Error::Service(format!("[{code}] {message}")))
    }
}
