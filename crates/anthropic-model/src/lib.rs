//! A model provider for the Anthropic Messages API.

#[macro_use]
extern crate tracing;

mod config;
mod io;
mod proto;
mod response;

use std::error::Error as StdError;
use std::fmt::{self, Display};
use std::sync::Arc;

use colloquy_model::{
    ErrorKind, ModelProvider, ModelProviderError, ModelRequest,
};
use mime::Mime;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url, header};

pub use config::{AnthropicConfig, AnthropicConfigBuilder};
use io::{Chunks, Sse};
use proto::{ApiError, Body};
pub use response::AnthropicResponse;

const MESSAGES_PATH: &str = "/v1/messages";
const MODELS_PATH: &str = "/v1/models";
const MODELS_PAGE_LIMIT: u32 = 100;

/// Error type for [`AnthropicProvider`].
#[derive(Debug)]
pub struct Error {
    message: String,
    kind: ErrorKind,
    status: Option<u16>,
}

impl Error {
    fn new(message: impl Into<String>, kind: ErrorKind) -> Self {
        Self {
            message: message.into(),
            kind,
            status: None,
        }
    }

    #[inline]
    fn validation(message: impl Into<String>) -> Self {
        Self::new(message, ErrorKind::Validation)
    }

    fn from_api_error(error: ApiError) -> Self {
        Self::new(
            format!("{}: {}", error.kind, error.message),
            error.error_kind(),
        )
    }

    /// Builds the error of a response whose status is not a success.
    ///
    /// The error type in the body, when recognized, is more precise than
    /// the status code.
    fn from_status(status: StatusCode, body: &str) -> Self {
        let mut err = match serde_json::from_str::<Body>(body) {
            Ok(Body::Error { error }) => {
                let by_body = error.error_kind();
                let mut err = Self::from_api_error(error);
                if by_body == ErrorKind::Other {
                    err.kind = status_kind(status);
                }
                err
            }
            _ => Self::new(
                format!("HTTP {status}: {}", body.trim()),
                status_kind(status),
            ),
        };
        err.status = Some(status.as_u16());
        err
    }

    /// Returns the error message.
    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the HTTP status of the failed response, if any.
    #[inline]
    pub fn status(&self) -> Option<u16> {
        self.status
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl StdError for Error {}

impl ModelProviderError for Error {
    #[inline]
    fn kind(&self) -> ErrorKind {
        self.kind
    }
}

fn status_kind(status: StatusCode) -> ErrorKind {
    match status.as_u16() {
        401 | 403 => ErrorKind::Auth,
        400 | 404 | 413 | 422 => ErrorKind::Validation,
        429 => ErrorKind::RateLimitExceeded,
        408 | 504 => ErrorKind::Transport,
        _ => ErrorKind::Other,
    }
}

fn transport_error(err: reqwest::Error) -> Error {
    Error::new(format!("{err}"), ErrorKind::Transport)
}

/// A model available to the configured account.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ModelInfo {
    /// The identifier to put in requests.
    pub id: String,
    /// A human readable name.
    pub display_name: String,
    /// RFC 3339 timestamp of the release.
    pub created_at: String,
}

/// Anthropic model provider.
#[derive(Clone, Debug)]
pub struct AnthropicProvider {
    client: Client,
    config: Arc<AnthropicConfig>,
}

impl AnthropicProvider {
    /// Creates a new `AnthropicProvider` with the given configuration.
    ///
    /// Fails if the HTTP client cannot be initialized, e.g. when no TLS
    /// backend is usable.
    pub fn new(config: AnthropicConfig) -> Result<Self, Error> {
        let mut builder = Client::builder();
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(|err| {
            Error::new(
                format!("failed to build the http client: {err}"),
                ErrorKind::Other,
            )
        })?;
        Ok(Self {
            client,
            config: Arc::new(config),
        })
    }

    /// Returns the configuration of this provider.
    #[inline]
    pub fn config(&self) -> &AnthropicConfig {
        &self.config
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        let mut builder = builder
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", &self.config.version);
        if !self.config.betas.is_empty() {
            builder = builder.header("anthropic-beta", self.config.betas.join(","));
        }
        builder
    }

    /// Lists the models available to the configured account, following
    /// pagination until the last page.
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, Error> {
        let mut models = Vec::new();
        let mut after_id: Option<String> = None;
        loop {
            let mut url =
                Url::parse(&self.config.endpoint(MODELS_PATH)).map_err(|err| {
                    Error::validation(format!("invalid base url: {err}"))
                })?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("limit", &MODELS_PAGE_LIMIT.to_string());
                if let Some(after_id) = &after_id {
                    query.append_pair("after_id", after_id);
                }
            }
            debug!("listing models: {url}");

            let resp = self
                .authorized(self.client.get(url))
                .send()
                .await
                .map_err(transport_error)?;
            let resp = check_status(resp).await?;
            let page = resp.json::<proto::ModelPage>().await.map_err(|err| {
                Error::new(format!("malformed model list: {err}"), ErrorKind::Other)
            })?;

            models.extend(page.data.into_iter().map(|entry| ModelInfo {
                id: entry.id,
                display_name: entry.display_name,
                created_at: entry.created_at,
            }));
            match page.last_id {
                Some(last_id) if page.has_more => after_id = Some(last_id),
                _ => break,
            }
        }
        Ok(models)
    }
}

async fn check_status(resp: Response) -> Result<Response, Error> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let err = Error::from_status(status, &body);
    debug!("request failed with {status}: {err}");
    Err(err)
}

impl ModelProvider for AnthropicProvider {
    type Error = Error;
    type Response = AnthropicResponse;

    fn send_request(
        &self,
        req: &ModelRequest,
    ) -> impl Future<Output = Result<Self::Response, Self::Error>> + Send + 'static
    {
        let resp_fut = proto::create_request(req, &self.config).map(|body| {
            trace!("sending request: {body:?}");
            self.authorized(self.client.post(self.config.endpoint(MESSAGES_PATH)))
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::ACCEPT, "text/event-stream")
                .json(&body)
                .send()
        });

        async move {
            let resp = resp_fut?.await.map_err(transport_error)?;
            let resp = check_status(resp).await?;

            let content_type = resp
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<Mime>().ok());
            match content_type.as_ref().map(Mime::essence_str) {
                Some("text/event-stream") => {
                    let sse = Sse::new(Chunks::from_response(resp));
                    Ok(AnthropicResponse::from_sse(sse))
                }
                Some("application/json") => {
                    let body = resp.bytes().await.map_err(transport_error)?;
                    match serde_json::from_slice::<Body>(&body) {
                        Ok(Body::Message(message)) => {
                            AnthropicResponse::from_message(message)
                        }
                        Ok(Body::Error { error }) => {
                            Err(Error::from_api_error(error))
                        }
                        Err(err) => Err(Error::new(
                            format!("malformed response body: {err}"),
                            ErrorKind::Other,
                        )),
                    }
                }
                _ => Err(Error::new(
                    format!("unexpected content type: {content_type:?}"),
                    ErrorKind::Other,
                )),
            }
        }
    }
}
