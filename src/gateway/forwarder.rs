//! Forwarding engine: issues the outbound request and relays the upstream
//! response, either fully buffered or streamed chunk by chunk.

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, Response};
use bytes::Bytes;
use futures_util::future::ready;
use futures_util::StreamExt;
use tracing::{debug, warn};

use crate::admission::AdmissionPermit;
use crate::error::GatewayError;
use crate::gateway::ForwardRequest;

/// Transport-level headers regenerated by the outbound client rather than
/// copied from the inbound request.
fn is_hop_by_hop_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Headers for the outbound leg: hop-by-hop, `Host` and `Content-Length`
/// are always dropped; streaming mode also drops `Accept-Encoding` so the
/// relay never has to decode chunks.
pub(crate) fn filter_request_headers(inbound: &HeaderMap, streaming: bool) -> HeaderMap {
    let mut outbound = HeaderMap::new();
    for (name, value) in inbound {
        if is_hop_by_hop_header(name)
            || *name == header::HOST
            || *name == header::CONTENT_LENGTH
            || (streaming && *name == header::ACCEPT_ENCODING)
        {
            continue;
        }
        outbound.append(name.clone(), value.clone());
    }
    outbound
}

/// Headers relayed back to the caller. `Content-Length` is dropped along
/// with the hop-by-hop set; the response body determines its own framing.
pub(crate) fn filter_response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::new();
    for (name, value) in upstream {
        if is_hop_by_hop_header(name) || *name == header::CONTENT_LENGTH {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }
    filtered
}

fn map_send_error(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::UpstreamTimeout
    } else {
        GatewayError::UpstreamUnreachable(err.to_string())
    }
}

fn build_response(
    status: reqwest::StatusCode,
    headers: HeaderMap,
    body: Body,
) -> Result<Response<Body>, GatewayError> {
    let mut builder = Response::builder().status(status);
    for (name, value) in headers.iter() {
        builder = builder.header(name, value);
    }
    builder
        .body(body)
        .map_err(|err| GatewayError::Internal(err.to_string()))
}

/// Issue the request and await the complete upstream response.
///
/// A non-2xx upstream status is logged as an upstream error but its status
/// and body still propagate to the caller verbatim.
pub async fn forward_buffered(
    client: &reqwest::Client,
    target_url: &str,
    inbound_headers: &HeaderMap,
    body: &ForwardRequest,
    request_id: &str,
) -> Result<Response<Body>, GatewayError> {
    let upstream = client
        .post(target_url)
        .headers(filter_request_headers(inbound_headers, false))
        .header("x-request-id", request_id)
        .json(body)
        .send()
        .await
        .map_err(map_send_error)?;

    let status = upstream.status();
    let headers = filter_response_headers(upstream.headers());
    let bytes = upstream.bytes().await.map_err(map_send_error)?;

    if status.is_success() {
        debug!(%status, bytes = bytes.len(), "upstream response buffered");
    } else {
        warn!(%status, "upstream returned an error response");
    }

    build_response(status, headers, Body::from(bytes))
}

/// Issue the request and relay the response body as chunks arrive, without
/// buffering it.
///
/// The admission permit rides along with the relay stream, so the slot is
/// released when the stream completes or the caller disconnects, not when
/// the handler returns. If the upstream connection dies mid-stream the
/// relay terminates after whatever was already delivered; bytes the caller
/// has seen are never retroactively turned into an error.
pub async fn forward_streaming(
    client: &reqwest::Client,
    target_url: &str,
    inbound_headers: &HeaderMap,
    body: &ForwardRequest,
    request_id: &str,
    permit: AdmissionPermit,
) -> Result<Response<Body>, GatewayError> {
    let upstream = client
        .post(target_url)
        .headers(filter_request_headers(inbound_headers, true))
        .header("x-request-id", request_id)
        .json(body)
        .send()
        .await
        .map_err(map_send_error)?;

    let status = upstream.status();
    let headers = filter_response_headers(upstream.headers());
    if !status.is_success() {
        warn!(%status, "upstream returned an error response, relaying as-is");
    }

    let relay = upstream.bytes_stream().scan(permit, |_permit, chunk| {
        ready(match chunk {
            Ok(bytes) => Some(Ok::<Bytes, std::convert::Infallible>(bytes)),
            Err(err) => {
                warn!(error = %err, "upstream stream ended early, terminating relay");
                None
            }
        })
    });

    build_response(status, headers, Body::from_stream(relay))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn inbound() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("gateway.local"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("128"));
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer sk-test"),
        );
        headers.insert(
            header::ACCEPT_ENCODING,
            HeaderValue::from_static("gzip, br"),
        );
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers
    }

    #[test]
    fn outbound_leg_strips_transport_headers() {
        let filtered = filter_request_headers(&inbound(), false);
        assert!(!filtered.contains_key(header::HOST));
        assert!(!filtered.contains_key(header::CONTENT_LENGTH));
        assert!(!filtered.contains_key(header::CONNECTION));
        assert_eq!(
            filtered.get(header::AUTHORIZATION).unwrap(),
            "Bearer sk-test"
        );
        // buffered mode keeps Accept-Encoding
        assert!(filtered.contains_key(header::ACCEPT_ENCODING));
    }

    #[test]
    fn streaming_mode_also_strips_accept_encoding() {
        let filtered = filter_request_headers(&inbound(), true);
        assert!(!filtered.contains_key(header::ACCEPT_ENCODING));
        assert!(filtered.contains_key(header::AUTHORIZATION));
    }

    #[test]
    fn response_leg_strips_framing_headers() {
        let mut upstream = HeaderMap::new();
        upstream.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        upstream.insert(header::CONTENT_LENGTH, HeaderValue::from_static("42"));
        upstream.insert(
            header::TRANSFER_ENCODING,
            HeaderValue::from_static("chunked"),
        );

        let filtered = filter_response_headers(&upstream);
        assert_eq!(filtered.get(header::CONTENT_TYPE).unwrap(), "application/json");
        assert!(!filtered.contains_key(header::CONTENT_LENGTH));
        assert!(!filtered.contains_key(header::TRANSFER_ENCODING));
    }
}
