//! Streaming response body instrumentation.
//!
//! The upstream body is forwarded to the client chunk by chunk; this wrapper
//! observes end-of-stream so the completion log and duration metrics fire
//! only after the response actually finished, and a body dropped early is
//! reported as a client disconnect.

use crate::proxy::metrics::ProxyMetrics;
use crate::proxy::types::RouteName;
use axum::http::StatusCode;
use http_body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Everything needed to account for one finished (or abandoned) response.
#[derive(Debug)]
pub struct Completion {
    route: RouteName,
    method: String,
    path: String,
    status: StatusCode,
    start: Instant,
    metrics: Option<Arc<ProxyMetrics>>,
    finished: bool,
}

impl Completion {
    pub fn new(
        route: RouteName,
        method: String,
        path: String,
        status: StatusCode,
        start: Instant,
        metrics: Option<Arc<ProxyMetrics>>,
    ) -> Self {
        Self {
            route,
            method,
            path,
            status,
            start,
            metrics,
            finished: false,
        }
    }

    /// Record metrics and emit the completion log. Idempotent.
    pub fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        let duration = self.start.elapsed();
        if let Some(metrics) = &self.metrics {
            metrics.record_response(
                self.route.as_ref(),
                &self.method,
                self.status.as_u16(),
            );
            metrics.record_request_duration(
                self.route.as_ref(),
                &self.method,
                duration.as_secs_f64(),
            );
        }

        let status = self.status.as_u16();
        let duration_ms = duration.as_millis() as u64;
        if status >= 500 {
            error!(
                route = %self.route,
                path = %self.path,
                method = %self.method,
                status,
                duration_ms,
                "request completed"
            );
        } else if status >= 400 {
            warn!(
                route = %self.route,
                path = %self.path,
                method = %self.method,
                status,
                duration_ms,
                "request completed"
            );
        } else {
            debug!(
                route = %self.route,
                path = %self.path,
                method = %self.method,
                status,
                duration_ms,
                "request completed"
            );
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if !self.finished {
            self.finished = true;
            info!(
                route = %self.route,
                path = %self.path,
                method = %self.method,
                duration_ms = self.start.elapsed().as_millis() as u64,
                "client disconnected before response completed"
            );
            if let Some(metrics) = &self.metrics {
                metrics.record_request_error(self.route.as_ref(), &self.method);
            }
        }
    }
}

pin_project! {
    /// Body wrapper that fires [`Completion`] at end of stream.
    pub struct MeteredBody<B> {
        #[pin]
        inner: B,
        completion: Completion,
    }
}

impl<B> MeteredBody<B> {
    pub fn new(inner: B, completion: Completion) -> Self {
        Self { inner, completion }
    }
}

impl<B> Body for MeteredBody<B>
where
    B: Body,
{
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        match this.inner.poll_frame(cx) {
            Poll::Ready(None) => {
                this.completion.finish();
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(err))) => {
                // Headers and status already reached the client; account for
                // the response as sent before the stream aborts.
                this.completion.finish();
                Poll::Ready(Some(Err(err)))
            }
            other => other,
        }
    }

    fn is_end_stream(&self) -> bool {
        // Always demand a final poll: an eagerly-ended body would otherwise
        // be dropped unpolled and misreported as a client disconnect.
        false
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
