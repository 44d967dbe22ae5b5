//! HTTP transport for webhook deliveries.
//!
//! Two process-wide clients are built lazily: one verifying certificates
//! against the system roots for SSL hooks, one accepting any certificate for
//! the rest. Both live until the process exits.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use kiln_state::model::Headers;

use crate::error::HookError;

static VERIFYING: OnceLock<reqwest::Client> = OnceLock::new();
static PERMISSIVE: OnceLock<reqwest::Client> = OnceLock::new();

fn client(ssl: bool) -> Result<&'static reqwest::Client, HookError> {
    let cell = if ssl { &VERIFYING } else { &PERMISSIVE };
    if let Some(client) = cell.get() {
        return Ok(client);
    }
    let builder = reqwest::Client::builder().use_rustls_tls();
    let builder = if ssl {
        builder.tls_built_in_root_certs(true)
    } else {
        builder.danger_accept_invalid_certs(true)
    };
    let built = builder
        .build()
        .map_err(|e| HookError::Client(e.to_string()))?;
    Ok(cell.get_or_init(|| built))
}

/// Outcome of one POST. Transport failures land in `error`.
#[derive(Debug, Default)]
pub(crate) struct Exchange {
    pub code: Option<u16>,
    pub headers: Option<Headers>,
    pub body: Option<String>,
    pub truncated: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Split header values on `;` so they compare equal after a trip through
/// the delivery log codec.
fn append_value(headers: &mut Headers, name: &str, value: &str) {
    for part in value.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        headers.append(name, part);
    }
}

/// POST `body` to `url`. Multi-valued headers are sent joined with `"; "`.
/// At most `body_limit` bytes of the response body are kept (`0` keeps all).
pub(crate) async fn post(
    url: &str,
    ssl: bool,
    headers: &Headers,
    body: &str,
    timeout: Duration,
    body_limit: usize,
) -> Result<Exchange, HookError> {
    let client = client(ssl)?;
    let mut request = client.post(url).timeout(timeout).body(body.to_owned());
    for (name, values) in headers.iter() {
        request = request.header(name.as_str(), values.join("; "));
    }

    let start = Instant::now();
    let mut exchange = Exchange::default();
    match request.send().await {
        Ok(mut response) => {
            exchange.code = Some(response.status().as_u16());

            let mut received = Headers::new();
            for (name, value) in response.headers() {
                append_value(&mut received, name.as_str(), &String::from_utf8_lossy(value.as_bytes()));
            }
            exchange.headers = Some(received);

            let mut buf: Vec<u8> = Vec::new();
            loop {
                match response.chunk().await {
                    Ok(Some(chunk)) => {
                        if body_limit > 0 && buf.len() + chunk.len() > body_limit {
                            let room = body_limit - buf.len();
                            buf.extend_from_slice(&chunk[..room]);
                            exchange.truncated = true;
                            break;
                        }
                        buf.extend_from_slice(&chunk);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        exchange.error = Some(e.to_string());
                        break;
                    }
                }
            }
            exchange.body = Some(String::from_utf8_lossy(&buf).into_owned());
        }
        Err(e) => exchange.error = Some(e.to_string()),
    }
    exchange.duration_ms = start.elapsed().as_millis() as u64;
    Ok(exchange)
}
