use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use flume::SendError;
use flume::Sender;
use reqwest::Client;
use reqwest::Method;
use reqwest::Response;
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use thiserror::Error;
use tokio::sync::watch;
use url::Url;

use crate::validator::Check;
use crate::validator::IR;

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("channel error")]
    ChannelError(#[from] SendError<RunnerResult>),
}

/// Failure to complete the HTTP round trip for one scenario. Distinct from
/// an HTTP error status, which is a normal transport outcome and is left to
/// the asserter.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("network failure: {0}")]
    Network(reqwest::Error),

    #[error("invalid url after substitution: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// The one seam between the runner and the network. Production code uses
/// [`HttpTransport`]; tests substitute a stub so the pipeline runs without
/// sockets.
pub trait Transport: Send + Sync {
    fn send(
        &self,
        method: Method,
        url: Url,
        headers: HeaderMap,
        body: Option<&serde_json::Value>,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<CapturedResponse, TransportError>> + Send;
}

#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl Transport for HttpTransport {
    /// Performs exactly one network call: no retries, no redirect to a
    /// second attempt on failure. A JSON body also sets the
    /// `Content-Type: application/json` header.
    async fn send(
        &self,
        method: Method,
        url: Url,
        headers: HeaderMap,
        body: Option<&serde_json::Value>,
        timeout: Option<Duration>,
    ) -> Result<CapturedResponse, TransportError> {
        let mut request = self.client.request(method, url).headers(headers);

        if let Some(body) = body {
            request = request.json(body);
        }

        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        match request.send().await {
            Ok(response) => Ok(CapturedResponse::from_response(response).await),
            Err(err) if err.is_timeout() => Err(TransportError::Timeout),
            Err(err) => Err(TransportError::Network(err)),
        }
    }
}

#[derive(Debug)]
pub struct RunnerResult {
    pub name: String,
    pub method: String,
    pub path: String,
    pub response: Option<CapturedResponse>,
    pub error: Option<TransportError>,
    pub checks: Vec<Check>,
}

/// Runs every scenario in the plan, strictly one at a time: each round trip
/// is awaited to completion before the next scenario starts. A transport
/// failure becomes the result for that scenario and the loop moves on, so
/// one dead endpoint never takes the rest of the suite with it.
///
/// The cancel flag is only consulted between scenarios. Once it flips, no
/// further scenario starts, but an in-flight request is never interrupted.
pub async fn run_scenarios<T: Transport>(
    ir: IR,
    transport: &T,
    tx: Sender<RunnerResult>,
    cancel: watch::Receiver<bool>,
) -> Result<(), RunnerError> {
    let IR {
        base_url,
        scenarios,
    } = ir;

    for scenario in scenarios {
        if *cancel.borrow() {
            break;
        }

        let path = resolve_template(&scenario.path, &scenario.params);
        let query = scenario
            .query
            .as_deref()
            .map(|query| resolve_template(query, &scenario.params));
        let method = scenario.method.to_string();

        let result = match resolve_url(&base_url, &path, query.as_deref()) {
            Ok(url) => {
                transport
                    .send(
                        scenario.method,
                        url,
                        scenario.headers,
                        scenario.body.as_ref(),
                        scenario.timeout,
                    )
                    .await
            }
            Err(error) => Err(error),
        };

        let runner_result = match result {
            Ok(response) => RunnerResult {
                name: scenario.name,
                method,
                path,
                response: Some(response),
                error: None,
                checks: scenario.checks,
            },
            Err(error) => RunnerResult {
                name: scenario.name,
                method,
                path,
                response: None,
                error: Some(error),
                checks: scenario.checks,
            },
        };

        tx.send_async(runner_result).await?;
    }

    Ok(())
}

/// Substitutes every `{placeholder}` with its value from `params`. The
/// validator has already checked that the two sets line up.
pub fn resolve_template(template: &str, params: &BTreeMap<String, String>) -> String {
    let mut resolved = template.to_string();
    for (key, value) in params {
        resolved = resolved.replace(&format!("{{{key}}}"), value);
    }
    resolved
}

fn resolve_url(base_url: &str, path: &str, query: Option<&str>) -> Result<Url, TransportError> {
    let url_string = query.map_or_else(
        || format!("{base_url}{path}"),
        |query| format!("{base_url}{path}{query}"),
    );

    Ok(Url::parse(&url_string)?)
}

#[derive(Debug)]
pub struct CapturedResponse {
    pub status: StatusCode,
    pub body_text: String,
    pub body_json: Option<serde_json::Value>,
}

impl CapturedResponse {
    pub async fn from_response(resp: Response) -> Self {
        let status = resp.status();

        // Consume the body exactly once
        let body_text = match resp.text().await {
            Ok(t) => t,
            Err(err) => format!("Failed to read body: {}", err),
        };

        let body_json = serde_json::from_str::<serde_json::Value>(&body_text).ok();

        Self {
            status,
            body_text,
            body_json,
        }
    }
}
