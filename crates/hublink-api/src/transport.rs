// Shared WebSocket transport helpers.
//
// Both links open their sockets through this module: URL normalization
// (http → ws), upgrade-request headers, and a bounded connect.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{ClientRequestBuilder, http::Uri};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::error::Error;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Normalize a base URL into a WebSocket URL.
///
/// `http` / `https` map to `ws` / `wss`; `ws` / `wss` pass through. If
/// `path` is given and the URL has no path of its own, it is appended.
pub fn websocket_url(base: &Url, path: Option<&str>) -> Result<Url, Error> {
    let scheme = match base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(Error::UnsupportedScheme {
                scheme: other.to_owned(),
            });
        }
    };

    let mut url = base.clone();
    url.set_scheme(scheme)
        .map_err(|()| Error::UnsupportedScheme {
            scheme: base.scheme().to_owned(),
        })?;

    if let Some(path) = path {
        if url.path().is_empty() || url.path() == "/" {
            url.set_path(path);
        }
    }

    Ok(url)
}

/// Build the upgrade request with extra headers.
pub(crate) fn upgrade_request(
    url: &Url,
    headers: &[(&str, String)],
) -> Result<ClientRequestBuilder, Error> {
    let uri: Uri = url
        .as_str()
        .parse()
        .map_err(|e: tokio_tungstenite::tungstenite::http::uri::InvalidUri| {
            Error::Transport(e.to_string())
        })?;

    let mut request = ClientRequestBuilder::new(uri);
    for (name, value) in headers {
        request = request.with_header(*name, value.clone());
    }
    Ok(request)
}

/// Open a socket, failing with [`Error::Timeout`] if the TCP/TLS/upgrade
/// handshake does not finish within `timeout`.
pub(crate) async fn open(request: ClientRequestBuilder, timeout: Duration) -> Result<WsStream, Error> {
    match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(request)).await {
        Ok(Ok((stream, _response))) => Ok(stream),
        Ok(Err(e)) => Err(Error::from(e)),
        Err(_) => Err(Error::Timeout {
            timeout_ms: duration_ms(timeout),
        }),
    }
}

pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
