//! Mock service backends for deterministic testing.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use handbook_inference::mock::{MockCompletionBackend, MockOcrProvider};
//!
//! let llm = MockCompletionBackend::new()
//!     .with_fixed_response(r#"{"sections": [{"title": "Regler", "content": "..."}]}"#);
//! let ocr = MockOcrProvider::new().with_pages(["Regel 1", "Regel 2"]);
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use handbook_core::{
    CompletionBackend, Error, OcrOperation, OcrProvider, OcrRequest, OperationState, Result,
};

/// Scripted outcome of one mock call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockReply {
    /// Return this content.
    Content(String),
    /// Fail with a transient rate-limit error.
    RateLimited,
    /// Fail with a transient upstream error.
    ServerError,
    /// Fail with a permanent error carrying this message.
    Rejected(String),
}

impl MockReply {
    fn into_result(self) -> Result<String> {
        match self {
            MockReply::Content(s) => Ok(s),
            MockReply::RateLimited => Err(Error::RateLimited("mock rate limit".into())),
            MockReply::ServerError => Err(Error::Upstream("mock upstream 503".into())),
            MockReply::Rejected(msg) => Err(Error::Inference(msg)),
        }
    }
}

/// A recorded completion call.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub system: String,
    pub prompt: String,
}

#[derive(Debug, Clone)]
struct MockConfig {
    default_response: String,
    latency_ms: u64,
    failure_rate: f64,
    model: String,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            default_response: r#"{"sections": []}"#.to_string(),
            latency_ms: 0,
            failure_rate: 0.0,
            model: "mock-model".to_string(),
        }
    }
}

/// Mock [`CompletionBackend`].
///
/// Scripted replies are consumed first, in order; afterwards every call gets
/// the fixed response.
#[derive(Clone, Default)]
pub struct MockCompletionBackend {
    config: Arc<MockConfig>,
    script: Arc<Mutex<VecDeque<MockReply>>>,
    call_log: Arc<Mutex<Vec<MockCall>>>,
}

impl MockCompletionBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the response returned once the script is exhausted.
    pub fn with_fixed_response(mut self, response: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.config).default_response = response.into();
        self
    }

    /// Queue a scripted reply.
    pub fn with_reply(self, reply: MockReply) -> Self {
        self.push_reply(reply);
        self
    }

    /// Set simulated latency for every call.
    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        Arc::make_mut(&mut self.config).latency_ms = latency_ms;
        self
    }

    /// Set failure rate (0.0 - 1.0); failures are transient rate limits.
    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        Arc::make_mut(&mut self.config).failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn push_reply(&self, reply: MockReply) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(reply);
        }
    }

    /// Get all logged calls for assertion.
    pub fn calls(&self) -> Vec<MockCall> {
        self.call_log.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.call_log.lock().map(|c| c.len()).unwrap_or(0)
    }
}

#[async_trait]
impl CompletionBackend for MockCompletionBackend {
    async fn complete_json(&self, system: &str, prompt: &str) -> Result<String> {
        if let Ok(mut log) = self.call_log.lock() {
            log.push(MockCall {
                system: system.to_string(),
                prompt: prompt.to_string(),
            });
        }

        if self.config.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.latency_ms)).await;
        }

        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        if let Some(reply) = scripted {
            return reply.into_result();
        }

        if self.config.failure_rate > 0.0 && rand::random::<f64>() < self.config.failure_rate {
            return MockReply::RateLimited.into_result();
        }
        Ok(self.config.default_response.clone())
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

#[derive(Debug, Clone)]
struct OcrScript {
    pages: Vec<String>,
    polls_until_done: usize,
    submit_reply: Option<MockReply>,
    operation_failure: Option<String>,
}

impl Default for OcrScript {
    fn default() -> Self {
        Self {
            pages: vec!["Mock OCR text".to_string()],
            polls_until_done: 0,
            submit_reply: None,
            operation_failure: None,
        }
    }
}

/// Mock [`OcrProvider`].
#[derive(Clone, Default)]
pub struct MockOcrProvider {
    script: Arc<OcrScript>,
    submissions: Arc<Mutex<Vec<OcrRequest>>>,
    polls: Arc<Mutex<usize>>,
}

impl MockOcrProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Page texts returned by `fetch_output`, joined with newlines.
    pub fn with_pages<I, S>(mut self, pages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Arc::make_mut(&mut self.script).pages = pages.into_iter().map(Into::into).collect();
        self
    }

    /// Report `Running` this many times before `Done`.
    pub fn with_polls_until_done(mut self, polls: usize) -> Self {
        Arc::make_mut(&mut self.script).polls_until_done = polls;
        self
    }

    /// Make `submit` fail with the given reply's error.
    pub fn with_submit_failure(mut self, reply: MockReply) -> Self {
        Arc::make_mut(&mut self.script).submit_reply = Some(reply);
        self
    }

    /// Make the operation finish as failed.
    pub fn with_operation_failure(mut self, message: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.script).operation_failure = Some(message.into());
        self
    }

    /// Requests passed to `submit`.
    pub fn submissions(&self) -> Vec<OcrRequest> {
        self.submissions.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn poll_count(&self) -> usize {
        self.polls.lock().map(|p| *p).unwrap_or(0)
    }
}

#[async_trait]
impl OcrProvider for MockOcrProvider {
    async fn submit(&self, request: &OcrRequest) -> Result<OcrOperation> {
        if let Some(reply) = self.script.submit_reply.clone() {
            reply.into_result()?;
        }
        let count = {
            let mut submissions = self
                .submissions
                .lock()
                .map_err(|_| Error::Internal("mock lock poisoned".into()))?;
            submissions.push(request.clone());
            submissions.len()
        };
        Ok(OcrOperation {
            name: format!("operations/mock-{}", count),
            output_uri: request.output_uri.clone(),
        })
    }

    async fn poll(&self, _operation: &OcrOperation) -> Result<OperationState> {
        let polls = {
            let mut polls = self
                .polls
                .lock()
                .map_err(|_| Error::Internal("mock lock poisoned".into()))?;
            *polls += 1;
            *polls
        };
        if polls <= self.script.polls_until_done {
            return Ok(OperationState::Running);
        }
        Ok(match self.script.operation_failure {
            Some(ref message) => OperationState::Failed(message.clone()),
            None => OperationState::Done,
        })
    }

    async fn fetch_output(&self, _operation: &OcrOperation) -> Result<String> {
        Ok(self.script.pages.join("\n"))
    }
}
