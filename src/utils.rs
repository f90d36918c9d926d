use std::{env, path::Path, path::PathBuf};

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} must be {expected}, got '{value}'")]
    Invalid {
        name: &'static str,
        expected: &'static str,
        value: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("{path} is missing and {var} is not set")]
    NoSource { path: PathBuf, var: &'static str },
    #[error("GITHUB_TOKEN is not a valid header value")]
    InvalidToken,
    #[error("request to {url} failed: {source}")]
    Request { url: String, source: reqwest::Error },
    #[error("failed to download {url}: HTTP {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub port: u16,
    pub body_limit_bytes: usize,
    pub model_path: PathBuf,
    pub labels_path: PathBuf,
    pub input_op: String,
    pub output_op: String,
    pub model_url: Option<String>,
    pub labels_url: Option<String>,
    pub github_token: Option<String>,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let or = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.to_string());

        let body_limit_bytes = {
            let value = or("BODY_LIMIT_MB", "5");
            let mb = value.parse::<usize>().map_err(|_| ConfigError::Invalid {
                name: "BODY_LIMIT_MB",
                expected: "a valid integer",
                value,
            })?;
            mb * 1024 * 1024
        };

        let port = {
            let value = or("PORT", "5020");
            value.parse::<u16>().map_err(|_| ConfigError::Invalid {
                name: "PORT",
                expected: "a valid number between 0 and 65535",
                value,
            })?
        };

        Ok(Self {
            port,
            body_limit_bytes,
            model_path: or("MODEL_PATH", "./model/frozen_graph.pb").into(),
            labels_path: or("LABELS_PATH", "./model/labels.json").into(),
            input_op: or("MODEL_INPUT_OP", "x"),
            output_op: or("MODEL_OUTPUT_OP", "Identity"),
            model_url: lookup("MODEL_URL"),
            labels_url: lookup("LABELS_URL"),
            github_token: lookup("GITHUB_TOKEN"),
        })
    }
}

async fn download_file(url: &str, path: &Path, token: Option<&str>) -> Result<(), DownloadError> {
    tracing::info!(url, path = %path.display(), "downloading model artifact");

    let mut header_map = HeaderMap::new();
    if let Some(token) = token {
        let auth_value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| DownloadError::InvalidToken)?;
        header_map.insert(AUTHORIZATION, auth_value);
    }
    header_map.insert(ACCEPT, HeaderValue::from_static("application/octet-stream"));

    let request_err = |source| DownloadError::Request {
        url: url.to_string(),
        source,
    };

    let client = reqwest::Client::new();
    let response = client
        .get(url)
        .headers(header_map)
        .send()
        .await
        .map_err(request_err)?;

    if !response.status().is_success() {
        return Err(DownloadError::Status {
            url: url.to_string(),
            status: response.status(),
        });
    }

    let bytes = response.bytes().await.map_err(request_err)?;

    let write_err = |source| DownloadError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }
    tokio::fs::write(path, bytes).await.map_err(write_err)
}

/// Fetches the model graph and label list when they are not on disk yet.
pub async fn ensure_files_exist(config: &ServerConfig) -> Result<(), DownloadError> {
    let artifacts = [
        (&config.model_path, config.model_url.as_deref(), "MODEL_URL"),
        (&config.labels_path, config.labels_url.as_deref(), "LABELS_URL"),
    ];

    for (path, url, var) in artifacts {
        if path.exists() {
            continue;
        }
        let url = url.ok_or_else(|| DownloadError::NoSource {
            path: path.clone(),
            var,
        })?;
        download_file(url, path, config.github_token.as_deref()).await?;
    }

    Ok(())
}
