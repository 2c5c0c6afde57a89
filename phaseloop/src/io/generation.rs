//! Text generation backends.
//!
//! The loop only sees the `Generator` trait: a prompt goes in, text or a typed
//! `GenerationError` comes out. Retries of transient failures happen here;
//! phase-level retries are the engine's business.

use std::path::PathBuf;
use std::process::Command;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::core::types::GenerationErrorKind;
use crate::io::config::{GenerationBackend, GenerationConfig};
use crate::io::process::run_with_timeout;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    /// Overrides the backend's configured model for this request.
    pub model: Option<String>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: None,
            model: None,
        }
    }

    pub fn with_system(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub text: String,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    #[error("generation timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("cannot reach generation service at {target}: {message}")]
    Connection { target: String, message: String },
    #[error("model '{0}' not found")]
    ModelNotFound(String),
    #[error("generation service error{}: {message}", status.map(|s| format!(" (status {s})")).unwrap_or_default())]
    Server {
        status: Option<u16>,
        message: String,
    },
}

impl GenerationError {
    pub fn kind(&self) -> GenerationErrorKind {
        match self {
            GenerationError::Timeout(_) => GenerationErrorKind::Timeout,
            GenerationError::Connection { .. } => GenerationErrorKind::Connection,
            GenerationError::ModelNotFound(_) => GenerationErrorKind::ModelNotFound,
            GenerationError::Server { .. } => GenerationErrorKind::ServerError,
        }
    }

    /// Transient failures worth another request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GenerationError::Connection { .. } | GenerationError::Server { .. }
        )
    }
}

pub trait Generator {
    fn generate(&mut self, request: &GenerationRequest) -> Result<Generation, GenerationError>;
}

impl<G: Generator + ?Sized> Generator for Box<G> {
    fn generate(&mut self, request: &GenerationRequest) -> Result<Generation, GenerationError> {
        (**self).generate(request)
    }
}

/// Build the backend selected in config.
pub fn generator_from_config(
    cfg: &GenerationConfig,
    workdir: PathBuf,
) -> anyhow::Result<Box<dyn Generator + Send>> {
    let model = cfg.model.clone();
    Ok(match cfg.backend {
        GenerationBackend::Ollama => Box::new(OllamaClient::new(cfg, model)?),
        GenerationBackend::Command => Box::new(CommandGenerator {
            argv: cfg.command.clone(),
            workdir,
            model,
            timeout: Duration::from_secs(cfg.timeout_secs),
            output_limit_bytes: cfg.output_limit_bytes,
        }),
    })
}

#[derive(Debug, Serialize)]
struct OllamaGenerateBody<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OllamaGenerateResponse {
    response: String,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaErrorBody {
    error: String,
}

/// Client for an Ollama-compatible `/api/generate` endpoint.
pub struct OllamaClient {
    http: reqwest::blocking::Client,
    endpoint: String,
    model: String,
    timeout: Duration,
    max_retries: u32,
    backoff: Duration,
    exponential: bool,
}

impl OllamaClient {
    pub fn new(cfg: &GenerationConfig, model: String) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(cfg.timeout_secs);
        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            endpoint: format!("{}/api/generate", cfg.base_url.trim_end_matches('/')),
            model,
            timeout,
            max_retries: cfg.max_retries.max(1),
            backoff: Duration::from_millis(cfg.backoff_ms),
            exponential: cfg.exponential_backoff,
        })
    }

    fn attempt(&self, request: &GenerationRequest) -> Result<Generation, GenerationError> {
        let model = request.model.as_deref().unwrap_or(&self.model);
        let body = OllamaGenerateBody {
            model,
            prompt: &request.prompt,
            system: request.system_prompt.as_deref(),
            stream: false,
        };
        let response = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .map_err(|err| self.classify_transport(err))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            let message = serde_json::from_str::<OllamaErrorBody>(&text)
                .map(|b| b.error)
                .unwrap_or(text);
            return Err(classify_status(status.as_u16(), message, model));
        }

        let parsed: OllamaGenerateResponse =
            response.json().map_err(|err| GenerationError::Server {
                status: Some(status.as_u16()),
                message: format!("malformed response: {err}"),
            })?;
        Ok(Generation {
            text: parsed.response,
            model: parsed.model.unwrap_or_else(|| model.to_string()),
        })
    }

    fn classify_transport(&self, err: reqwest::Error) -> GenerationError {
        if err.is_timeout() {
            GenerationError::Timeout(self.timeout)
        } else if err.is_connect() || err.is_request() {
            GenerationError::Connection {
                target: self.endpoint.clone(),
                message: err.to_string(),
            }
        } else {
            GenerationError::Server {
                status: err.status().map(|s| s.as_u16()),
                message: err.to_string(),
            }
        }
    }
}

/// Delay before retry number `retry` (1-based): `backoff`, then doubling when
/// `exponential` is set.
fn retry_backoff(backoff: Duration, retry: u32, exponential: bool) -> Duration {
    if !exponential {
        return backoff;
    }
    backoff.saturating_mul(2u32.saturating_pow(retry.saturating_sub(1)))
}

fn classify_status(status: u16, message: String, model: &str) -> GenerationError {
    if status == 404 || message.to_ascii_lowercase().contains("not found") {
        GenerationError::ModelNotFound(model.to_string())
    } else {
        GenerationError::Server {
            status: Some(status),
            message,
        }
    }
}

impl Generator for OllamaClient {
    #[instrument(
        skip_all,
        fields(
            model = request.model.as_deref().unwrap_or(&self.model),
            prompt_len = request.prompt.len()
        )
    )]
    fn generate(&mut self, request: &GenerationRequest) -> Result<Generation, GenerationError> {
        let mut attempt = 1;
        loop {
            match self.attempt(request) {
                Ok(generation) => {
                    debug!(attempt, chars = generation.text.len(), "generation complete");
                    return Ok(generation);
                }
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    let delay = retry_backoff(self.backoff, attempt, self.exponential);
                    warn!(
                        attempt,
                        err = %err,
                        delay_ms = delay.as_millis() as u64,
                        "generation failed, retrying"
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Runs an external command per request: the prompt goes to stdin, the
/// generated text is read from stdout.
pub struct CommandGenerator {
    pub argv: Vec<String>,
    pub workdir: PathBuf,
    pub model: String,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl Generator for CommandGenerator {
    #[instrument(skip_all, fields(program = self.argv.first().map(String::as_str).unwrap_or("")))]
    fn generate(&mut self, request: &GenerationRequest) -> Result<Generation, GenerationError> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| GenerationError::Connection {
                target: "command".to_string(),
                message: "generation command is empty".to_string(),
            })?;
        let model = request.model.as_deref().unwrap_or(&self.model);
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&self.workdir)
            .env("PHASELOOP_MODEL", model);

        let mut input = String::new();
        if let Some(system) = &request.system_prompt {
            input.push_str(system);
            input.push_str("\n\n");
        }
        input.push_str(&request.prompt);

        let output = run_with_timeout(
            cmd,
            Some(input.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
        )
        .map_err(|err| GenerationError::Connection {
            target: program.clone(),
            message: format!("{err:#}"),
        })?;

        if output.timed_out {
            return Err(GenerationError::Timeout(self.timeout));
        }
        if !output.status.success() {
            return Err(GenerationError::Server {
                status: output.status.code().map(|c| c as u16),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(Generation {
            text: output.stdout_text(),
            model: model.to_string(),
        })
    }
}
