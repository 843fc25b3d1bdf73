//! Blocking facade over the async client.
//!
//! The synchronous profile drives the async core on a private
//! current-thread runtime, so interceptors and wire behavior are identical
//! to [`ConnectClient`]. Unary and server-streaming calls are offered;
//! client-streaming and full-duplex bidi need overlapped reads and writes
//! that a blocking caller cannot provide, so they are not constructible
//! here.

use connect_rs_core::MethodSpec;
use futures::StreamExt;
use prost::Message;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::client::{CallResponse, ConnectClient};
use crate::error::ClientError;
use crate::options::CallOptions;

/// Blocking Connect client for synchronous applications.
pub struct BlockingClient {
    runtime: tokio::runtime::Runtime,
    client: ConnectClient,
}

impl BlockingClient {
    /// Wrap an async client. Fails if a runtime cannot be created.
    pub fn new(client: ConnectClient) -> Result<Self, ClientError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| ClientError::Transport(format!("failed to start runtime: {e}")))?;
        Ok(Self { runtime, client })
    }

    /// Issue a unary call, blocking until the response arrives.
    pub fn call_unary<Req, Resp>(
        &self,
        spec: MethodSpec,
        request: &Req,
        options: CallOptions,
    ) -> Result<CallResponse<Resp>, ClientError>
    where
        Req: Message + Serialize,
        Resp: Message + DeserializeOwned + Default,
    {
        self.runtime
            .block_on(self.client.call_unary(spec, request, options))
    }

    /// Issue a server-streaming call and collect every response message.
    /// The stream is drained half-duplex; an in-band error surfaces after
    /// the messages already received are discarded.
    pub fn call_server_stream<Req, Resp>(
        &self,
        spec: MethodSpec,
        request: &Req,
        options: CallOptions,
    ) -> Result<Vec<Resp>, ClientError>
    where
        Req: Message + Serialize,
        Resp: Message + DeserializeOwned + Default + Send + 'static,
    {
        self.runtime.block_on(async {
            let mut stream = self
                .client
                .call_server_stream::<Req, Resp>(spec, request, options)
                .await?;
            let mut messages = Vec::new();
            while let Some(item) = stream.next().await {
                messages.push(item?);
            }
            Ok(messages)
        })
    }
}

impl std::fmt::Debug for BlockingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingClient").finish_non_exhaustive()
    }
}
