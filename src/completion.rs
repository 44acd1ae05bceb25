//! Completion service adapter: the four LLM tasks of a group summary.
//!
//! Each task renders its prompt, calls the gateway and validates the output
//! against its schema. A response that fails validation is asked for again up
//! to `schema_attempts` times before the task gives up.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::gateway::{Attribution, ChatGateway, ChatModel, ChatRequest, ProviderError};
use crate::prompts::{self, PromptInstance};
use crate::schema::{
    parse_assignments, parse_patterns, parse_session_summary, PatternAssignment, RawPattern,
    SchemaValidationError,
};
use crate::session::{GroupSummaryRequest, PreparedSession, SingleSessionSummary};

#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("schema validation failed: {0}")]
    Schema(#[from] SchemaValidationError),
}

impl CompletionError {
    pub fn is_transient(&self) -> bool {
        match self {
            CompletionError::Provider(e) => e.is_retryable(),
            CompletionError::Schema(_) => false,
        }
    }
}

/// Per-execution values every task call carries.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub model: String,
    pub team_id: i64,
    pub execution_id: Option<String>,
    pub extra_context: Option<String>,
}

impl CallContext {
    pub fn for_request(request: &GroupSummaryRequest, execution_id: impl Into<String>) -> Self {
        Self {
            model: request.model_name.clone(),
            team_id: request.team_id,
            execution_id: Some(execution_id.into()),
            extra_context: request.extra_context.clone(),
        }
    }

    fn attribution(&self, caller: &'static str) -> Attribution {
        let attribution = Attribution::new(caller).with_team(self.team_id);
        match &self.execution_id {
            Some(id) => attribution.with_execution(id),
            None => attribution,
        }
    }
}

pub const SUMMARY_MAX_OUTPUT_TOKENS: u32 = 8_192;
pub const PATTERNS_MAX_OUTPUT_TOKENS: u32 = 4_096;
pub const ASSIGN_MAX_OUTPUT_TOKENS: u32 = 4_096;

pub struct CompletionService {
    gateway: Arc<dyn ChatGateway>,
    schema_attempts: u32,
}

impl CompletionService {
    pub fn new(gateway: Arc<dyn ChatGateway>) -> Self {
        Self {
            gateway,
            schema_attempts: 2,
        }
    }

    /// Number of calls made for one task before a schema error is final (min 1).
    pub fn with_schema_attempts(mut self, attempts: u32) -> Self {
        self.schema_attempts = attempts.max(1);
        self
    }

    async fn call_validated<T, F>(
        &self,
        ctx: &CallContext,
        caller: &'static str,
        prompt: PromptInstance,
        max_tokens: u32,
        parse: F,
    ) -> Result<T, CompletionError>
    where
        F: Fn(&str) -> Result<T, SchemaValidationError>,
    {
        let mut last_error = None;
        for attempt in 0..self.schema_attempts {
            let mut request = ChatRequest::new(
                ChatModel::openrouter(&ctx.model),
                prompt.to_messages(),
                ctx.attribution(caller),
            )
            .max_tokens(max_tokens);
            // Only OpenAI models reliably support response_format=json_object via OpenRouter.
            if ctx.model.starts_with("openai/") {
                request = request.json();
            }

            let response = self.gateway.chat(request).await?;
            match parse(&response.content) {
                Ok(value) => {
                    debug!(
                        caller,
                        template = %prompt.template_slug,
                        attempt,
                        output_tokens = response.output_tokens,
                        "completion validated"
                    );
                    return Ok(value);
                }
                Err(err) => {
                    warn!(
                        caller,
                        template = %prompt.template_slug,
                        attempt,
                        error = %err,
                        "completion failed schema validation"
                    );
                    last_error = Some(err);
                }
            }
        }
        Err(last_error
            .unwrap_or(SchemaValidationError::NoJson)
            .into())
    }

    pub async fn summarize_session(
        &self,
        ctx: &CallContext,
        session: &PreparedSession,
    ) -> Result<SingleSessionSummary, CompletionError> {
        let prompt = prompts::render_summarize_session(session, ctx.extra_context.as_deref());
        self.call_validated(
            ctx,
            "completion::summarize_session",
            prompt,
            SUMMARY_MAX_OUTPUT_TOKENS,
            |raw| parse_session_summary(raw, session),
        )
        .await
    }

    pub async fn extract_patterns(
        &self,
        ctx: &CallContext,
        chunk: &[SingleSessionSummary],
    ) -> Result<Vec<RawPattern>, CompletionError> {
        let prompt = prompts::render_extract_patterns(chunk, ctx.extra_context.as_deref());
        self.call_validated(
            ctx,
            "completion::extract_patterns",
            prompt,
            PATTERNS_MAX_OUTPUT_TOKENS,
            parse_patterns,
        )
        .await
    }

    /// Merge per-chunk pattern lists into one list with fresh ids.
    pub async fn combine_patterns(
        &self,
        ctx: &CallContext,
        lists: &[Vec<RawPattern>],
    ) -> Result<Vec<RawPattern>, CompletionError> {
        let prompt = prompts::render_combine_patterns(lists, ctx.extra_context.as_deref());
        self.call_validated(
            ctx,
            "completion::combine_patterns",
            prompt,
            PATTERNS_MAX_OUTPUT_TOKENS,
            parse_patterns,
        )
        .await
    }

    pub async fn assign_events(
        &self,
        ctx: &CallContext,
        patterns: &[RawPattern],
        unit: &[SingleSessionSummary],
    ) -> Result<Vec<PatternAssignment>, CompletionError> {
        let prompt = prompts::render_assign_events(patterns, unit);
        self.call_validated(
            ctx,
            "completion::assign_events",
            prompt,
            ASSIGN_MAX_OUTPUT_TOKENS,
            parse_assignments,
        )
        .await
    }
}
