//! The client side of the XHR long-polling transport.
//!
//! Frames are pulled with GET requests and pushed with POST requests, both
//! carrying the `<length>:<payload>` framing (lengths count characters). A
//! poll response may carry several frames; they are buffered so the channel's
//! inbound loop consumes them one at a time — including the initial `Open`
//! frame of the handshake, which flows through the inbound loop like any
//! other frame.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::channel::ConnectionHeader;
use crate::config::Config;
use crate::errors::TransportError;
use crate::protocol::CLOSE_MESSAGE;
use crate::transport::Conn;

pub struct PollingClientConn {
    http: reqwest::Client,
    poll_url: String,
    buffer: Mutex<VecDeque<String>>,
    ping_interval: Duration,
    ping_timeout: Duration,
    receive_timeout: Duration,
    send_timeout: Duration,
}

impl PollingClientConn {
    /// Perform the opening GET and keep every received frame (the `Open`
    /// header included) buffered for the inbound loop. The sid is only
    /// peeked at here to build the session-scoped poll URL.
    pub(crate) async fn connect(url: &str, config: &Config) -> Result<Self, TransportError> {
        let http = reqwest::Client::new();
        let body = http
            .get(url)
            .timeout(config.receive_timeout)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let frames = split_frames(&body)?;
        let open = frames
            .front()
            .filter(|frame| frame.starts_with('0'))
            .ok_or(TransportError::Handshake)?;
        let header: ConnectionHeader =
            serde_json::from_str(&open[1..]).map_err(|_| TransportError::Handshake)?;

        Ok(Self {
            http,
            poll_url: format!("{url}&sid={}", header.sid),
            buffer: Mutex::new(frames),
            ping_interval: config.ping_interval,
            ping_timeout: config.ping_timeout,
            receive_timeout: config.receive_timeout,
            send_timeout: config.send_timeout,
        })
    }
}

#[async_trait]
impl Conn for PollingClientConn {
    async fn get_message(&self) -> Result<String, TransportError> {
        let mut buffer = self.buffer.lock().await;
        loop {
            if let Some(frame) = buffer.pop_front() {
                return Ok(frame);
            }
            let body = self
                .http
                .get(&self.poll_url)
                .timeout(self.receive_timeout)
                .send()
                .await
                .map_err(map_reqwest)?
                .error_for_status()
                .map_err(map_reqwest)?
                .text()
                .await
                .map_err(map_reqwest)?;
            // an empty body means the long poll expired with nothing to say
            buffer.extend(split_frames(&body)?);
        }
    }

    async fn write_message(&self, frame: String) -> Result<(), TransportError> {
        let body = format!("{}:{}", frame.chars().count(), frame);
        let response = self
            .http
            .post(&self.poll_url)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(body)
            .timeout(self.send_timeout)
            .send()
            .await
            .map_err(map_reqwest)?
            .text()
            .await
            .map_err(map_reqwest)?;
        if response != "ok" {
            return Err(TransportError::BadResponse(response));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.write_message(CLOSE_MESSAGE.to_owned()).await.ok();
        Ok(())
    }

    fn ping_params(&self) -> (Duration, Duration) {
        (self.ping_interval, self.ping_timeout)
    }
}

fn map_reqwest(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::ReceiveTimeout
    } else {
        TransportError::HttpClient(err)
    }
}

/// Split a poll body into its `<length>:<payload>` frames.
fn split_frames(body: &str) -> Result<VecDeque<String>, TransportError> {
    let mut frames = VecDeque::new();
    let mut rest = body;
    while !rest.is_empty() {
        let colon = rest
            .find(':')
            .ok_or_else(|| TransportError::BadResponse(body.to_owned()))?;
        let len: usize = rest[..colon]
            .parse()
            .map_err(|_| TransportError::BadResponse(body.to_owned()))?;
        let tail = &rest[colon + 1..];
        let byte_len = match tail.char_indices().nth(len) {
            Some((offset, _)) => offset,
            None if tail.chars().count() == len => tail.len(),
            None => return Err(TransportError::BadResponse(body.to_owned())),
        };
        frames.push_back(tail[..byte_len].to_owned());
        rest = &tail[byte_len..];
    }
    Ok(frames)
}
