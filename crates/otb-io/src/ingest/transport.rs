//! Ingest transport seam
//!
//! The stream manager talks to the cloud through these traits so the rest of
//! the pipeline is testable without a network. Production uses
//! [`GrpcTransport`]; tests and demos use the in-process
//! [`loopback`](crate::ingest::loopback) transport.

use async_trait::async_trait;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};

use otb_core::{BridgeError, IngestTarget};

use super::wire::{WireAck, WireBatch};

/// Sending half of an open ingest stream
#[async_trait]
pub trait BatchSink: Send {
    /// Hand one batch to the stream. Resolves once the transport has taken
    /// ownership of the message, not once it is acknowledged.
    async fn send(&mut self, batch: WireBatch) -> Result<(), BridgeError>;

    /// Close the sending direction cleanly
    async fn close(&mut self);
}

/// Receiving half of an open ingest stream
#[async_trait]
pub trait AckSource: Send {
    async fn next_ack(&mut self) -> Result<WireAck, BridgeError>;
}

/// Factory for ingest streams
#[async_trait]
pub trait IngestTransport: Send + Sync {
    async fn open(
        &self,
        endpoint: &str,
        bearer: &str,
        target: &IngestTarget,
    ) -> Result<(Box<dyn BatchSink>, Box<dyn AckSource>), BridgeError>;
}

/// Hand-maintained client in the shape `tonic-build` emits for
/// `otb.zerobus.v1.ZerobusIngest/StreamBatches`.
pub mod zerobus_client {
    use super::super::wire::{WireAck, WireBatch};
    use tonic::codegen::http::uri::PathAndQuery;
    use tonic::codegen::*;

    #[derive(Debug, Clone)]
    pub struct ZerobusIngestClient<T> {
        inner: tonic::client::Grpc<T>,
    }

    impl ZerobusIngestClient<tonic::transport::Channel> {
        pub fn new(channel: tonic::transport::Channel) -> Self {
            Self {
                inner: tonic::client::Grpc::new(channel),
            }
        }
    }

    impl<T> ZerobusIngestClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::Error: Into<StdError>,
        T::ResponseBody: Body<Data = Bytes> + Send + 'static,
        <T::ResponseBody as Body>::Error: Into<StdError> + Send,
    {
        pub async fn stream_batches(
            &mut self,
            request: impl tonic::IntoStreamingRequest<Message = WireBatch>,
        ) -> std::result::Result<tonic::Response<tonic::codec::Streaming<WireAck>>, tonic::Status>
        {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::unknown(format!("Service was not ready: {}", e.into()))
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = PathAndQuery::from_static("/otb.zerobus.v1.ZerobusIngest/StreamBatches");
            let mut req = request.into_streaming_request();
            req.extensions_mut()
                .insert(GrpcMethod::new("otb.zerobus.v1.ZerobusIngest", "StreamBatches"));
            self.inner.streaming(req, path, codec).await
        }
    }
}

/// TLS gRPC transport against the real ingest endpoint
pub struct GrpcTransport;

#[async_trait]
impl IngestTransport for GrpcTransport {
    async fn open(
        &self,
        endpoint: &str,
        bearer: &str,
        _target: &IngestTarget,
    ) -> Result<(Box<dyn BatchSink>, Box<dyn AckSource>), BridgeError> {
        let channel = connect(endpoint).await?;
        let mut client = zerobus_client::ZerobusIngestClient::new(channel);

        let (batch_tx, batch_rx) = tokio::sync::mpsc::channel::<WireBatch>(16);
        let mut request = tonic::Request::new(ReceiverStream::new(batch_rx));
        let header = format!("Bearer {bearer}")
            .parse()
            .map_err(|_| BridgeError::AuthFailed("token is not a valid header value".into()))?;
        request.metadata_mut().insert("authorization", header);

        let acks = client
            .stream_batches(request)
            .await
            .map_err(status_to_error)?
            .into_inner();

        Ok((
            Box::new(GrpcBatchSink {
                tx: Some(batch_tx),
            }),
            Box::new(GrpcAckSource { acks }),
        ))
    }
}

async fn connect(endpoint: &str) -> Result<Channel, BridgeError> {
    let tls = endpoint.starts_with("https://");
    let mut builder = Endpoint::from_shared(endpoint.to_string())
        .map_err(|e| BridgeError::ConfigInvalid(format!("ingest endpoint: {e}")))?
        .connect_timeout(std::time::Duration::from_secs(5));
    if tls {
        builder = builder
            .tls_config(ClientTlsConfig::new().with_native_roots())
            .map_err(|e| BridgeError::TlsFailed(e.to_string()))?;
    }
    builder
        .connect()
        .await
        .map_err(|e| BridgeError::NetworkUnreachable(format!("ingest endpoint: {e}")))
}

fn status_to_error(status: tonic::Status) -> BridgeError {
    match status.code() {
        tonic::Code::Unauthenticated | tonic::Code::PermissionDenied => {
            BridgeError::AuthFailed(status.message().to_string())
        }
        tonic::Code::Unavailable | tonic::Code::DeadlineExceeded => {
            BridgeError::NetworkUnreachable(status.message().to_string())
        }
        tonic::Code::InvalidArgument | tonic::Code::NotFound => {
            BridgeError::TargetInvalid(status.message().to_string())
        }
        _ => BridgeError::ProtocolError(format!("{}: {}", status.code(), status.message())),
    }
}

struct GrpcBatchSink {
    tx: Option<tokio::sync::mpsc::Sender<WireBatch>>,
}

#[async_trait]
impl BatchSink for GrpcBatchSink {
    async fn send(&mut self, batch: WireBatch) -> Result<(), BridgeError> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| BridgeError::NetworkUnreachable("stream closed".into()))?;
        tx.send(batch)
            .await
            .map_err(|_| BridgeError::NetworkUnreachable("stream closed by server".into()))
    }

    async fn close(&mut self) {
        // Dropping the sender half-closes the stream; the server finishes
        // acking what it received.
        self.tx = None;
    }
}

struct GrpcAckSource {
    acks: tonic::codec::Streaming<WireAck>,
}

#[async_trait]
impl AckSource for GrpcAckSource {
    async fn next_ack(&mut self) -> Result<WireAck, BridgeError> {
        match self.acks.message().await {
            Ok(Some(ack)) => Ok(ack),
            Ok(None) => Err(BridgeError::NetworkUnreachable(
                "ack stream ended".into(),
            )),
            Err(status) => Err(status_to_error(status)),
        }
    }
}
