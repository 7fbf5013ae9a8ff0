use std::{io::Read, time::Duration};

use anyhow::Context;
use reqwest::{
    blocking::Client,
    header::{CONNECTION, CONTENT_TYPE},
};
use thiserror::Error;
use tracing::{debug, warn};

use smartlock_common::{
    directive::{
        encode_report_body, parse_directive_bytes, API_KEY_HEADER, MAX_DIRECTIVE_BYTES,
        REPORT_CONTENT_TYPE,
    },
    ApiConfig, CommandSource, RemoteCommand, StatusReporter,
};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected HTTP status {0}")]
    Status(u16),
    #[error("reading body failed: {0}")]
    Body(#[from] std::io::Error),
}

fn build_client(api: &ApiConfig) -> anyhow::Result<Client> {
    Client::builder()
        .timeout(Duration::from_millis(api.timeout_ms))
        .connect_timeout(Duration::from_millis(api.timeout_ms))
        .build()
        .context("failed to build HTTP client")
}

/// Polls the directive endpoint. Must be built and used off the async runtime.
pub struct HttpCommandSource {
    client: Client,
    url: String,
    api_key: String,
}

impl HttpCommandSource {
    pub fn new(api: &ApiConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client(api)?,
            url: api.command_url(),
            api_key: api.api_key.clone(),
        })
    }

    fn try_fetch(&self) -> Result<RemoteCommand, FetchError> {
        let mut request = self.client.get(&self.url).header(CONNECTION, "close");
        if !self.api_key.is_empty() {
            request = request.header(API_KEY_HEADER, &self.api_key);
        }

        let response = request.send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        // Only the head of the body is ever read off the socket.
        let mut body = Vec::with_capacity(MAX_DIRECTIVE_BYTES);
        response
            .take(MAX_DIRECTIVE_BYTES as u64)
            .read_to_end(&mut body)?;
        Ok(parse_directive_bytes(&body))
    }
}

impl CommandSource for HttpCommandSource {
    fn fetch(&mut self) -> RemoteCommand {
        match self.try_fetch() {
            Ok(command) => command,
            Err(err) => {
                warn!("directive fetch from {} failed: {err}", self.url);
                RemoteCommand::FetchFailed
            }
        }
    }
}

pub struct HttpStatusReporter {
    client: Client,
    url: Option<String>,
    api_key: String,
}

impl HttpStatusReporter {
    pub fn new(api: &ApiConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client(api)?,
            url: api.report_url(),
            api_key: api.api_key.clone(),
        })
    }

    fn try_report(&self, url: &str, status_line: &str) -> Result<(), FetchError> {
        let mut request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, REPORT_CONTENT_TYPE)
            .header(CONNECTION, "close")
            .body(encode_report_body(status_line));
        if !self.api_key.is_empty() {
            request = request.header(API_KEY_HEADER, &self.api_key);
        }

        let response = request.send()?;
        debug!("status report answered with HTTP {}", response.status());
        Ok(())
    }
}

impl StatusReporter for HttpStatusReporter {
    fn report(&mut self, status_line: &str) {
        let Some(url) = self.url.as_deref() else {
            debug!("status reporting disabled; dropping `{status_line}`");
            return;
        };

        if let Err(err) = self.try_report(url, status_line) {
            warn!("status report to {url} failed: {err}");
        }
    }
}
