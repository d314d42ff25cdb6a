//! Shared test helpers: a scripted in-memory transport.

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::error::TransportError;
use crate::transport::{FetchRequest, ResponseMeta, Transport, TransportResponse};

/// One scripted reply
#[derive(Clone, Debug)]
pub(crate) struct FakeResponse {
    pub(crate) status: u16,
    pub(crate) body: Vec<u8>,
    /// Body is split into chunks of this size (0 = one chunk)
    pub(crate) chunk_size: usize,
    /// Chunk `gate_at` is withheld until the gate is notified
    pub(crate) gate: Option<Arc<Notify>>,
    pub(crate) gate_at: usize,
    /// Fail the request instead of answering
    pub(crate) error: Option<TransportError>,
}

impl FakeResponse {
    pub(crate) fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            chunk_size: 0,
            gate: None,
            gate_at: 0,
            error: None,
        }
    }

    pub(crate) fn json(value: serde_json::Value) -> Self {
        Self::ok(value.to_string())
    }

    pub(crate) fn status(status: u16) -> Self {
        Self {
            status,
            ..Self::ok(Vec::new())
        }
    }

    pub(crate) fn error(error: TransportError) -> Self {
        Self {
            error: Some(error),
            ..Self::ok(Vec::new())
        }
    }

    pub(crate) fn chunked(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub(crate) fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self.gate_at = 0;
        self
    }

    /// Deliver `chunks` chunks, then stall until the gate is notified
    pub(crate) fn gated_after(mut self, gate: Arc<Notify>, chunks: usize) -> Self {
        self.gate = Some(gate);
        self.gate_at = chunks;
        self
    }

    pub(crate) fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }
}

type Handler = Arc<dyn Fn(&FetchRequest) -> FakeResponse + Send + Sync>;

/// Transport that answers from scripted routes and records every request
///
/// Routes match by URL prefix; the most recently added match wins.
#[derive(Default)]
pub(crate) struct FakeTransport {
    routes: Mutex<Vec<(String, Handler)>>,
    head_routes: Mutex<Vec<(String, Result<ResponseMeta, TransportError>)>>,
    requests: Mutex<Vec<FetchRequest>>,
    head_requests: Mutex<Vec<FetchRequest>>,
}

impl FakeTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn route(&self, prefix: impl Into<String>, response: FakeResponse) {
        self.route_fn(prefix, move |_| response.clone());
    }

    pub(crate) fn route_fn<F>(&self, prefix: impl Into<String>, handler: F)
    where
        F: Fn(&FetchRequest) -> FakeResponse + Send + Sync + 'static,
    {
        self.routes
            .lock()
            .unwrap()
            .push((prefix.into(), Arc::new(handler)));
    }

    pub(crate) fn head_route(
        &self,
        prefix: impl Into<String>,
        reply: Result<ResponseMeta, TransportError>,
    ) {
        self.head_routes
            .lock()
            .unwrap()
            .push((prefix.into(), reply));
    }

    /// Every GET request received so far
    pub(crate) fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Every HEAD request received so far
    pub(crate) fn head_requests(&self) -> Vec<FetchRequest> {
        self.head_requests.lock().unwrap().clone()
    }

    /// GET requests whose URL starts with `prefix`
    pub(crate) fn requests_to(&self, prefix: &str) -> Vec<FetchRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.url.starts_with(prefix))
            .collect()
    }

    fn handler_for(&self, url: &str) -> Option<Handler> {
        self.routes
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(prefix, _)| url.starts_with(prefix.as_str()))
            .map(|(_, handler)| handler.clone())
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn head(&self, request: &FetchRequest) -> Result<ResponseMeta, TransportError> {
        self.head_requests.lock().unwrap().push(request.clone());

        let reply = self
            .head_routes
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(prefix, _)| request.url.starts_with(prefix.as_str()))
            .map(|(_, reply)| reply.clone());

        reply.unwrap_or_else(|| {
            Ok(ResponseMeta {
                status: 404,
                final_url: request.url.clone(),
                ..Default::default()
            })
        })
    }

    async fn get(&self, request: &FetchRequest) -> Result<TransportResponse, TransportError> {
        self.requests.lock().unwrap().push(request.clone());

        let response = match self.handler_for(&request.url) {
            Some(handler) => handler(request),
            None => FakeResponse::status(404),
        };
        if let Some(error) = response.error {
            return Err(error);
        }

        let meta = ResponseMeta {
            status: response.status,
            final_url: request.url.clone(),
            content_length: Some(response.body.len() as u64),
            location: None,
        };

        let chunks: Vec<Vec<u8>> = if response.chunk_size == 0 || response.body.is_empty() {
            vec![response.body]
        } else {
            response
                .body
                .chunks(response.chunk_size)
                .map(<[u8]>::to_vec)
                .collect()
        };
        let state = (chunks.into_iter().enumerate(), response.gate, response.gate_at);
        let body = futures::stream::unfold(state, |(mut chunks, gate, gate_at)| async move {
            let (index, chunk) = chunks.next()?;
            if index == gate_at
                && let Some(gate) = &gate
            {
                gate.notified().await;
            }
            Some((Ok(chunk), (chunks, gate, gate_at)))
        })
        .boxed();

        Ok(TransportResponse { meta, body })
    }
}
