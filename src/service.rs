//! A [`tower_service::Service`] wrapper so the server mounts on any
//! compatible HTTP router. Requests under the configured path go to the
//! front door, everything else falls through to the inner service
//! ([`NotFoundService`] by default).

use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::future::{self, Ready};
use http::request::Parts;
use http::{Request, Response, StatusCode};
use http_body::Body;
use http_body_util::Empty;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tower_service::Service;

use crate::body::ResponseBody;
use crate::errors::Error;
use crate::server::Server;
use crate::transport::ws;

pub struct SocketIoService<S = NotFoundService> {
    server: Arc<Server>,
    inner: S,
}

impl SocketIoService {
    pub fn new(server: Arc<Server>) -> Self {
        Self {
            server,
            inner: NotFoundService,
        }
    }
}

impl<S> SocketIoService<S> {
    /// Wrap an inner service that answers everything outside the socket.io
    /// path.
    pub fn with_inner(server: Arc<Server>, inner: S) -> Self {
        Self { server, inner }
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    /// Drive a websocket session over an already-upgraded stream. Useful for
    /// runtimes that perform the HTTP upgrade themselves, and for tests with
    /// in-memory streams.
    pub async fn ws_init<St>(
        &self,
        stream: St,
        sid: Option<String>,
        parts: Parts,
    ) -> Result<(), Error>
    where
        St: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let ws = WebSocketStream::from_raw_socket(stream, Role::Server, None).await;
        ws::on_init(self.server.clone(), ws, sid, parts).await
    }
}

impl<S: Clone> Clone for SocketIoService<S> {
    fn clone(&self) -> Self {
        Self {
            server: self.server.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<S> fmt::Debug for SocketIoService<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketIoService").finish_non_exhaustive()
    }
}

impl<ReqBody, ResBody, S> Service<Request<ReqBody>> for SocketIoService<S>
where
    ReqBody: Body + Send + 'static,
    ReqBody::Data: Send,
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Future: Send + 'static,
    ResBody: Body + Send + 'static,
{
    type Response = Response<ResponseBody<ResBody>>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        if req.uri().path().starts_with(&self.server.config().req_path) {
            let server = self.server.clone();
            Box::pin(async move {
                Ok(server
                    .handle_request(req)
                    .await
                    .unwrap_or_else(Error::into_response))
            })
        } else {
            let fut = self.inner.call(req);
            Box::pin(async move { Ok(fut.await?.map(ResponseBody::new)) })
        }
    }
}

/// Default fallback for requests outside the socket.io path.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotFoundService;

impl<ReqBody> Service<Request<ReqBody>> for NotFoundService
where
    ReqBody: Body + Send + 'static,
{
    type Response = Response<Empty<Bytes>>;
    type Error = Infallible;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: Request<ReqBody>) -> Self::Future {
        future::ready(Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Empty::new())
            .expect("static response")))
    }
}
