//! Response body wrapper so the front door can answer with its own payloads
//! while passing inner-service responses through untouched.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use http_body_util::Full;
use pin_project_lite::pin_project;

pin_project! {
    #[project = BodyProj]
    pub enum ResponseBody<B> {
        Empty,
        Custom { #[pin] body: Full<Bytes> },
        Inner { #[pin] body: B },
    }
}

impl<B> Default for ResponseBody<B> {
    fn default() -> Self {
        Self::empty_response()
    }
}

impl<B> ResponseBody<B> {
    pub fn empty_response() -> Self {
        ResponseBody::Empty
    }

    pub fn custom_response(body: impl Into<Bytes>) -> Self {
        ResponseBody::Custom {
            body: Full::new(body.into()),
        }
    }

    pub fn new(body: B) -> Self {
        ResponseBody::Inner { body }
    }
}

impl<B> Body for ResponseBody<B>
where
    B: Body<Data = Bytes>,
    B::Error: std::error::Error + 'static,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.project() {
            BodyProj::Empty => Poll::Ready(None),
            BodyProj::Custom { body } => body.poll_frame(cx).map_err(|err| match err {}),
            BodyProj::Inner { body } => body.poll_frame(cx),
        }
    }

    fn is_end_stream(&self) -> bool {
        match self {
            ResponseBody::Empty => true,
            ResponseBody::Custom { body } => body.is_end_stream(),
            ResponseBody::Inner { body } => body.is_end_stream(),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match self {
            ResponseBody::Empty => {
                let mut hint = SizeHint::default();
                hint.set_upper(0);
                hint
            }
            ResponseBody::Custom { body } => body.size_hint(),
            ResponseBody::Inner { body } => body.size_hint(),
        }
    }
}
