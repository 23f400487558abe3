//! Authenticated requests against the management API.
//!
//! A request carries either nothing (marketplace), the cached `JSESSIONID`
//! cookie, or basic credentials. Sending basic credentials drops the cached
//! session; a 200 response that sets a new session cookie caches it again. A
//! 403 triggers one re-authenticated retry.

use std::time::Duration;

use reqwest::blocking::{Client as HttpClient, RequestBuilder, Response};
use reqwest::header::{CONTENT_TYPE, COOKIE};
use reqwest::{Method, StatusCode};
use sandboxctl_error::ErrorEnvelope;
use serde::de::DeserializeOwned;
use url::Url;

use crate::cli::{write_stderr_line, CliError};
use crate::prompt::{prompt_until_valid, Prompter};
use crate::remote::Remote;
use crate::runtime::RuntimeStateStore;
use crate::spinner::Spinner;

pub const MARKET_URL: &str = "https://market.enonic.com/api/graphql";
pub const SESSION_COOKIE: &str = "JSESSIONID";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
/// Re-authenticated retries after a 403 before the response is handed back.
pub const MAX_REAUTH_ATTEMPTS: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestAuth {
    Anonymous,
    Session(String),
    Basic { user: String, pass: String },
}

/// A fully resolved request. The body is kept as bytes so the request can be
/// sent again after re-authentication.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: Url,
    pub body: Option<Vec<u8>>,
    pub auth: RequestAuth,
}

impl ApiRequest {
    fn to_http(&self, client: &HttpClient) -> RequestBuilder {
        let mut builder = client
            .request(self.method.clone(), self.url.clone())
            .header(CONTENT_TYPE, "application/json");
        match &self.auth {
            RequestAuth::Anonymous => {}
            RequestAuth::Session(id) => {
                builder = builder.header(COOKIE, format!("{SESSION_COOKIE}={id}"));
            }
            RequestAuth::Basic { user, pass } => {
                builder = builder.basic_auth(user, Some(pass));
            }
        }
        if let Some(body) = &self.body {
            builder = builder.body(body.clone());
        }
        builder
    }
}

pub struct SessionClient<'a> {
    store: &'a RuntimeStateStore,
    remote: Remote,
    prompter: &'a dyn Prompter,
    auth_token: Option<String>,
    market_url: String,
}

impl<'a> SessionClient<'a> {
    pub fn new(
        store: &'a RuntimeStateStore,
        remote: Remote,
        prompter: &'a dyn Prompter,
        auth_token: Option<String>,
    ) -> Self {
        Self {
            store,
            remote,
            prompter,
            auth_token: auth_token.filter(|token| !token.is_empty()),
            market_url: MARKET_URL.to_string(),
        }
    }

    pub fn with_market_url(mut self, market_url: impl Into<String>) -> Self {
        self.market_url = market_url.into();
        self
    }

    pub fn remote(&self) -> &Remote {
        &self.remote
    }

    /// An absolute URL is used as is. `/path` is rooted at the remote host;
    /// anything else is appended to the remote's base path. Relative targets
    /// never leave the remote's scheme, host and port.
    pub fn resolve_target(&self, target: &str) -> Result<Url, CliError> {
        if let Ok(url) = Url::parse(target) {
            if !url.cannot_be_a_base() {
                return Ok(url);
            }
        }

        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (target, None),
        };
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("{}/{}", self.remote.url.path().trim_end_matches('/'), path)
        };
        let mut url = self.remote.url.clone();
        url.set_path(&path);
        url.set_query(query);
        url.set_fragment(None);
        Ok(url)
    }

    fn is_market(&self, url: &Url) -> bool {
        url.as_str().trim_end_matches('/') == self.market_url.trim_end_matches('/')
    }

    pub fn build_request(
        &self,
        method: Method,
        target: &str,
        body: Option<Vec<u8>>,
    ) -> Result<ApiRequest, CliError> {
        let url = self.resolve_target(target)?;
        let mut request = ApiRequest {
            method,
            url,
            body,
            auth: RequestAuth::Anonymous,
        };
        if self.is_market(&request.url) {
            return Ok(request);
        }

        match (self.store.session_id(), &self.auth_token) {
            (Some(session_id), None) => {
                request.auth = RequestAuth::Session(session_id);
                Ok(request)
            }
            _ => {
                let initial = self
                    .auth_token
                    .clone()
                    .or_else(|| self.remote.credentials())
                    .unwrap_or_default();
                let (user, pass) = ensure_auth(&initial, self.prompter)?;
                self.with_basic_auth(request, user, pass)
            }
        }
    }

    /// Switches `request` to basic credentials, dropping the cached session.
    pub fn with_basic_auth(
        &self,
        mut request: ApiRequest,
        user: String,
        pass: String,
    ) -> Result<ApiRequest, CliError> {
        if self.store.clear_session()? {
            tracing::debug!("dropped cached session in favour of basic auth");
        }
        request.auth = RequestAuth::Basic { user, pass };
        Ok(request)
    }

    pub fn send(&self, request: ApiRequest, progress: Option<&str>) -> Result<Response, CliError> {
        self.send_with_timeout(request, progress, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn send_with_timeout(
        &self,
        mut request: ApiRequest,
        progress: Option<&str>,
        timeout: Duration,
    ) -> Result<Response, CliError> {
        let http = HttpClient::builder().timeout(timeout).build()?;
        let mut reauth_attempts = 0u32;
        loop {
            tracing::debug!(method = %request.method, url = %request.url, "sending request");
            let response = {
                let _spinner = progress.map(Spinner::start);
                request.to_http(&http).send().map_err(CliError::Connect)?
            };

            let status = response.status();
            if status == StatusCode::OK {
                self.remember_session(&response)?;
                return Ok(response);
            }
            if status != StatusCode::FORBIDDEN
                || request.auth == RequestAuth::Anonymous
                || reauth_attempts >= MAX_REAUTH_ATTEMPTS
            {
                return Ok(response);
            }

            reauth_attempts += 1;
            tracing::debug!(url = %request.url, attempt = reauth_attempts, "re-authenticating after 403");
            request = self.reauthenticate(request)?;
        }
    }

    fn reauthenticate(&self, request: ApiRequest) -> Result<ApiRequest, CliError> {
        if self.store.clear_session()? {
            write_stderr_line("Session is no longer valid.")?;
        }
        let initial = match &request.auth {
            RequestAuth::Basic { .. } => {
                write_stderr_line("Supplied user and password are not valid.")?;
                String::new()
            }
            _ => self.remote.credentials().unwrap_or_default(),
        };
        let (user, pass) = ensure_auth(&initial, self.prompter)?;
        self.with_basic_auth(request, user, pass)
    }

    fn remember_session(&self, response: &Response) -> Result<(), CliError> {
        let cookie = response
            .cookies()
            .find(|cookie| cookie.name() == SESSION_COOKIE)
            .map(|cookie| cookie.value().to_string());
        if let Some(session_id) = cookie {
            if self.store.set_session(&session_id)? {
                tracing::debug!("cached new session");
            }
        }
        Ok(())
    }
}

/// Decodes a 200 body into `T`; any other status becomes an error.
pub fn parse_response<T: DeserializeOwned>(response: Response) -> Result<T, CliError> {
    let status = response.status();
    let text = response.text()?;
    if status != StatusCode::OK {
        return Err(status_error(status, &text));
    }
    serde_json::from_str(&text).map_err(CliError::ParseResponse)
}

fn status_error(status: StatusCode, body: &str) -> CliError {
    match ErrorEnvelope::from_body(body) {
        Some(envelope) => CliError::Api {
            status: envelope.status,
            message: envelope.message,
        },
        None => CliError::HttpStatus(status),
    }
}

/// Validates `initial` as `user:password`, prompting until it is.
pub fn ensure_auth(initial: &str, prompter: &dyn Prompter) -> Result<(String, String), CliError> {
    let token = prompt_until_valid(prompter, initial, validate_auth_token)?;
    split_auth_token(&token).ok_or(CliError::InvalidAuthToken(token))
}

pub fn validate_auth_token(value: &str, attempt: u32) -> Option<String> {
    if value.trim().is_empty() {
        return Some(if attempt == 0 {
            "Enter authentication token (<user>:<password>): ".to_string()
        } else {
            "Authentication token can not be empty (<user>:<password>): ".to_string()
        });
    }
    if split_auth_token(value).is_none() {
        return Some(format!(
            "Authentication token '{value}' must have the following format <user>:<password>: "
        ));
    }
    None
}

pub fn split_auth_token(value: &str) -> Option<(String, String)> {
    let (user, pass) = value.split_once(':')?;
    if pass.contains(':') {
        return None;
    }
    Some((user.to_string(), pass.to_string()))
}
