use std::collections::BTreeMap;
use std::env;
use std::fmt::Debug;
use std::time::Duration;

use colloquy_model::ErrorKind;

use crate::Error;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 1024;

const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";
const BASE_URL_ENV: &str = "ANTHROPIC_BASE_URL";
const MODEL_ENV: &str = "ANTHROPIC_MODEL";
const VERSION_ENV: &str = "ANTHROPIC_VERSION";
const BETA_ENV: &str = "ANTHROPIC_BETA";
const MAX_TOKENS_ENV: &str = "ANTHROPIC_MAX_TOKENS";
const MODEL_MAPPINGS_ENV: &str = "ANTHROPIC_MODEL_MAPPINGS";

/// Builder for [`AnthropicConfig`].
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct AnthropicConfigBuilder {
    api_key: String,
    model: Option<String>,
    base_url: Option<String>,
    version: Option<String>,
    betas: Vec<String>,
    max_tokens: Option<u32>,
    model_mappings: BTreeMap<String, String>,
    timeout: Option<Duration>,
}

impl AnthropicConfigBuilder {
    /// Creates a builder with the given API key.
    #[inline]
    pub fn with_api_key<S: Into<String>>(api_key: S) -> Self {
        Self {
            api_key: api_key.into(),
            model: None,
            base_url: None,
            version: None,
            betas: Vec::new(),
            max_tokens: None,
            model_mappings: BTreeMap::new(),
            timeout: None,
        }
    }

    /// Creates a builder from the `ANTHROPIC_*` environment variables.
    ///
    /// `ANTHROPIC_API_KEY` is required. `ANTHROPIC_MODEL` is not read
    /// here: when no model is configured, it is looked up each time a
    /// request is built.
    pub fn from_env() -> Result<Self, Error> {
        let Some(api_key) = env_var(API_KEY_ENV) else {
            return Err(Error::new(
                format!("{API_KEY_ENV} environment variable is not set"),
                ErrorKind::Auth,
            ));
        };

        let mut builder = Self::with_api_key(api_key);
        if let Some(base_url) = env_var(BASE_URL_ENV) {
            builder = builder.with_base_url(base_url);
        }
        if let Some(version) = env_var(VERSION_ENV) {
            builder = builder.with_version(version);
        }
        if let Some(betas) = env_var(BETA_ENV) {
            for beta in betas.split(',').map(str::trim) {
                if !beta.is_empty() {
                    builder = builder.with_beta(beta);
                }
            }
        }
        if let Some(max_tokens) = env_var(MAX_TOKENS_ENV) {
            match max_tokens.parse() {
                Ok(max_tokens) => builder = builder.with_max_tokens(max_tokens),
                Err(_) => {
                    warn!("ignoring invalid {MAX_TOKENS_ENV}: {max_tokens}")
                }
            }
        }
        if let Some(mappings) = env_var(MODEL_MAPPINGS_ENV) {
            builder = builder.with_model_mappings(&mappings);
        }
        Ok(builder)
    }

    /// Sets the model to use when a request doesn't name one.
    #[inline]
    pub fn with_model<S: Into<String>>(mut self, model: S) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets a custom base URL, e.g. a proxy in front of the API.
    #[inline]
    pub fn with_base_url<S: Into<String>>(mut self, base_url: S) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Sets the `anthropic-version` header.
    #[inline]
    pub fn with_version<S: Into<String>>(mut self, version: S) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Adds a value to the `anthropic-beta` header.
    #[inline]
    pub fn with_beta<S: Into<String>>(mut self, beta: S) -> Self {
        self.betas.push(beta.into());
        self
    }

    /// Sets the default `max_tokens` of requests.
    #[inline]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Maps a model alias to the identifier sent to the backend.
    #[inline]
    pub fn with_model_mapping<A: Into<String>, M: Into<String>>(
        mut self,
        alias: A,
        model: M,
    ) -> Self {
        self.model_mappings.insert(alias.into(), model.into());
        self
    }

    /// Adds model mappings written as `alias=model,alias2=model2`.
    ///
    /// Malformed pairs are skipped.
    #[inline]
    pub fn with_model_mappings(mut self, raw: &str) -> Self {
        self.model_mappings.extend(parse_model_mappings(raw));
        self
    }

    /// Sets the timeout of a whole request, including streaming.
    #[inline]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Builds the configuration.
    #[inline]
    pub fn build(self) -> AnthropicConfig {
        let base_url = self
            .base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        AnthropicConfig {
            api_key: self.api_key,
            model: self.model,
            base_url: base_url.trim_end_matches('/').to_owned(),
            version: self.version.unwrap_or_else(|| DEFAULT_VERSION.to_string()),
            betas: self.betas,
            max_tokens: self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            model_mappings: self.model_mappings,
            timeout: self.timeout,
        }
    }
}

impl Debug for AnthropicConfigBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicConfigBuilder")
            .field("api_key", &"<deducted>")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("version", &self.version)
            .field("betas", &self.betas)
            .field("max_tokens", &self.max_tokens)
            .field("model_mappings", &self.model_mappings)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Configuration for the Anthropic provider.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct AnthropicConfig {
    pub(crate) api_key: String,
    pub(crate) model: Option<String>,
    pub(crate) base_url: String,
    pub(crate) version: String,
    pub(crate) betas: Vec<String>,
    pub(crate) max_tokens: u32,
    pub(crate) model_mappings: BTreeMap<String, String>,
    pub(crate) timeout: Option<Duration>,
}

impl AnthropicConfig {
    /// Resolves the model of a request.
    ///
    /// The requested model wins over the configured one, which wins over
    /// `ANTHROPIC_MODEL`. The result is then looked up in the mappings.
    pub(crate) fn resolve_model(&self, requested: Option<&str>) -> Option<String> {
        self.resolve_model_with(requested, || env_var(MODEL_ENV))
    }

    fn resolve_model_with(
        &self,
        requested: Option<&str>,
        env_model: impl FnOnce() -> Option<String>,
    ) -> Option<String> {
        let model = requested
            .map(ToOwned::to_owned)
            .or_else(|| self.model.clone())
            .or_else(env_model)?;
        match self.model_mappings.get(&model) {
            Some(mapped) => {
                debug!("model `{model}` is mapped to `{mapped}`");
                Some(mapped.clone())
            }
            None => Some(model),
        }
    }

    #[inline]
    pub(crate) fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Debug for AnthropicConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicConfig")
            .field("api_key", &"<deducted>")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("version", &self.version)
            .field("betas", &self.betas)
            .field("max_tokens", &self.max_tokens)
            .field("model_mappings", &self.model_mappings)
            .field("timeout", &self.timeout)
            .finish()
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn parse_model_mappings(raw: &str) -> BTreeMap<String, String> {
    let mut mappings = BTreeMap::new();
    for pair in raw.split(',') {
        let mut kv = pair.split('=');
        let (Some(alias), Some(model), None) = (kv.next(), kv.next(), kv.next())
        else {
            continue;
        };
        let (alias, model) = (alias.trim(), model.trim());
        if alias.is_empty() || model.is_empty() {
            continue;
        }
        mappings.insert(alias.to_owned(), model.to_owned());
    }
    mappings
}
