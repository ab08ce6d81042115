//! The write contract server-mode handlers emit responses through.

use bytes::{Bytes, BytesMut};
use http_body_util::Full;
use hyper::header::HeaderMap;
use hyper::{Response, StatusCode};
use tracing::debug;

/// An HTTP response under construction.
///
/// Headers are mutable until the status is committed by `write_header` (or
/// implicitly by the first `write`); later header changes are not sent.
pub trait ResponseSink {
    fn headers_mut(&mut self) -> &mut HeaderMap;

    /// Commit the status line. Only the first call has an effect.
    fn write_header(&mut self, status: StatusCode);

    /// Append body bytes, committing `200` if no status was written yet.
    /// Returns the number of bytes accepted.
    fn write(&mut self, buf: &[u8]) -> usize;
}

/// Collects a response in memory for hyper to send.
#[derive(Debug, Default)]
pub struct BufferedSink {
    headers: HeaderMap,
    committed: Option<(StatusCode, HeaderMap)>,
    body: BytesMut,
}

impl BufferedSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.committed.as_ref().map(|(status, _)| *status)
    }

    pub fn into_response(self) -> Response<Full<Bytes>> {
        let (status, headers) = self
            .committed
            .unwrap_or((StatusCode::OK, self.headers));
        let mut resp = Response::new(Full::new(self.body.freeze()));
        *resp.status_mut() = status;
        *resp.headers_mut() = headers;
        resp
    }
}

impl ResponseSink for BufferedSink {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn write_header(&mut self, status: StatusCode) {
        if let Some((committed, _)) = &self.committed {
            debug!(committed = %committed, ignored = %status, "superfluous write_header");
            return;
        }
        self.committed = Some((status, self.headers.clone()));
    }

    fn write(&mut self, buf: &[u8]) -> usize {
        if self.committed.is_none() {
            self.write_header(StatusCode::OK);
        }
        self.body.extend_from_slice(buf);
        buf.len()
    }
}
