//! Safe action pipeline.
//!
//! Every state-mutating operation runs through [`ActionRunner::run`], which
//! executes four stages in order and stops at the first failure:
//!
//! 1. authenticate: a principal must be present
//! 2. validate: deserialize the raw JSON and run `validator` rules
//! 3. rate-limit: `"<action>-<principal>"` against the action's cap
//! 4. execute: call the business operation
//!
//! Failures come back as [`ActionError`] values; nothing raised by business
//! code reaches the caller unfiltered, panics included.

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use std::panic::AssertUnwindSafe;
use thiserror::Error;
use validator::{Validate, ValidationErrors, ValidationErrorsKind};

use crate::{
    config::Environment,
    models::principal::{Principal, Role},
    services::{rate_limiter::RateLimiter, tenant_guard::GuardError},
};

pub const DEFAULT_ACTION_LIMIT: u32 = 10;
pub const ACTION_WINDOW_SECS: u64 = 60;

const INTERNAL_ERROR_MESSAGE: &str = "Internal Server Error";

/// Who is calling, as handed to business code.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionContext {
    pub principal_id: String,
    pub principal_role: Role,
}

/// A failure whose message is meant for the caller, e.g. "Subdomain already taken".
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ActionFailure(pub String);

impl ActionFailure {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ActionError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Invalid input: {}", .0.join(", "))]
    InvalidInput(Vec<String>),
    #[error("Rate limit exceeded. Please try again later.")]
    RateLimited,
    #[error("{0}")]
    Failed(String),
    #[error("{0}")]
    Internal(String),
}

pub type ActionOutcome<T> = Result<T, ActionError>;

/// A request body as handed to the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum RawInput {
    Json(Value),
    /// The body did not decode; carries the decoder's message.
    Malformed(String),
}

impl From<Value> for RawInput {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl RawInput {
    /// Decode a request body. An empty body is JSON `null`.
    pub fn from_body(body: &[u8]) -> Self {
        if body.is_empty() {
            return Self::Json(Value::Null);
        }
        match serde_json::from_slice(body) {
            Ok(value) => Self::Json(value),
            Err(err) => Self::Malformed(format!("Malformed JSON body: {err}")),
        }
    }
}

/// Uniform `{ success, data }` / `{ success, error }` body for an outcome.
pub fn envelope<T: Serialize>(outcome: &ActionOutcome<T>) -> Value {
    match outcome {
        Ok(data) => json!({ "success": true, "data": data }),
        Err(err) => json!({ "success": false, "error": err.to_string() }),
    }
}

/// A named business operation with a declared input schema.
#[async_trait]
pub trait SafeAction: Send + Sync {
    type Input: DeserializeOwned + Validate + Send;
    type Output: Serialize + Send;

    const NAME: &'static str;

    /// Requests allowed per principal per window.
    fn rate_limit(&self) -> u32 {
        DEFAULT_ACTION_LIMIT
    }

    async fn execute(&self, input: Self::Input, ctx: ActionContext) -> anyhow::Result<Self::Output>;
}

#[derive(Clone)]
pub struct ActionRunner {
    limiter: RateLimiter,
    environment: Environment,
}

impl ActionRunner {
    pub fn new(limiter: RateLimiter, environment: Environment) -> Self {
        Self {
            limiter,
            environment,
        }
    }

    pub async fn run<A: SafeAction>(
        &self,
        action: &A,
        principal: Option<&Principal>,
        raw: impl Into<RawInput>,
    ) -> ActionOutcome<A::Output> {
        let Some(principal) = principal else {
            return Err(ActionError::Unauthorized);
        };

        let input = parse_input::<A::Input>(raw.into())?;

        let key = format!("{}-{}", A::NAME, principal.id);
        let decision = self
            .limiter
            .check(&key, action.rate_limit(), ACTION_WINDOW_SECS)
            .await;
        if !decision.allowed {
            tracing::info!(action = A::NAME, principal_id = %principal.id, "action rate limited");
            return Err(ActionError::RateLimited);
        }

        let ctx = ActionContext {
            principal_id: principal.id.clone(),
            principal_role: principal.role,
        };
        match AssertUnwindSafe(action.execute(input, ctx)).catch_unwind().await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(err)) => Err(self.translate(A::NAME, err)),
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|m| m.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".into());
                Err(self.translate(A::NAME, anyhow::anyhow!("action panicked: {msg}")))
            }
        }
    }

    /// Same as [`run`](Self::run) with the output serialized to JSON.
    pub async fn run_json<A: SafeAction>(
        &self,
        action: &A,
        principal: Option<&Principal>,
        raw: impl Into<RawInput>,
    ) -> ActionOutcome<Value> {
        let output = self.run(action, principal, raw).await?;
        serde_json::to_value(output).map_err(|err| self.translate(A::NAME, err.into()))
    }

    fn translate(&self, action: &'static str, err: anyhow::Error) -> ActionError {
        if let Some(guard) = err.downcast_ref::<GuardError>() {
            if matches!(guard, GuardError::TenantNotFound | GuardError::Unauthorized) {
                tracing::warn!(action, error = %guard, "action denied by tenant guard");
                return ActionError::Unauthorized;
            }
        }
        if let Some(failure) = err.downcast_ref::<ActionFailure>() {
            return ActionError::Failed(failure.0.clone());
        }

        tracing::error!(action, error = ?err, "action failed");
        if self.environment.is_production() {
            ActionError::Internal(INTERNAL_ERROR_MESSAGE.into())
        } else {
            ActionError::Internal(format!("{err:#}"))
        }
    }
}

fn parse_input<T: DeserializeOwned + Validate>(raw: RawInput) -> ActionOutcome<T> {
    let raw = match raw {
        RawInput::Json(value) => value,
        RawInput::Malformed(msg) => return Err(ActionError::InvalidInput(vec![msg])),
    };
    let input: T =
        serde_json::from_value(raw).map_err(|err| ActionError::InvalidInput(vec![err.to_string()]))?;
    input.validate().map_err(|errs| {
        let mut messages = Vec::new();
        collect_messages(&mut messages, "", &errs);
        messages.sort();
        ActionError::InvalidInput(messages)
    })?;
    Ok(input)
}

fn collect_messages(out: &mut Vec<String>, prefix: &str, errs: &ValidationErrors) {
    for (field, kind) in errs.errors() {
        let path = if prefix.is_empty() {
            field.to_string()
        } else {
            format!("{prefix}.{field}")
        };
        match kind {
            ValidationErrorsKind::Field(field_errors) => {
                for e in field_errors {
                    let msg = e
                        .message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| format!("{path} is invalid ({})", e.code));
                    out.push(msg);
                }
            }
            ValidationErrorsKind::Struct(nested) => collect_messages(out, &path, nested),
            ValidationErrorsKind::List(items) => {
                for (idx, nested) in items {
                    collect_messages(out, &format!("{path}[{idx}]"), nested);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::rate_limit::RateLimitCounter;
    use crate::services::rate_limiter::{
        CounterStore, FailurePolicy, MemoryCounterStore, RateLimitError,
    };
    use serde::Deserialize;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    /// Counts how often the limiter is consulted.
    #[derive(Default)]
    struct CountingCounterStore {
        inner: MemoryCounterStore,
        hits: AtomicUsize,
    }

    #[async_trait]
    impl CounterStore for CountingCounterStore {
        async fn hit(
            &self,
            key: &str,
            limit: u32,
            now_ms: i64,
            window_ms: i64,
        ) -> Result<RateLimitCounter, RateLimitError> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            self.inner.hit(key, limit, now_ms, window_ms).await
        }
    }

    #[derive(Debug, Deserialize, Validate)]
    struct EchoInput {
        #[validate(length(min = 1, max = 10, message = "Title is required"))]
        title: String,
        #[validate(range(min = 1, message = "Count must be positive"))]
        count: u32,
    }

    enum Behavior {
        Echo,
        FailWith(fn() -> anyhow::Error),
        Panic,
    }

    struct EchoAction {
        calls: AtomicUsize,
        limit: u32,
        behavior: Behavior,
    }

    impl EchoAction {
        fn new(behavior: Behavior) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                limit: DEFAULT_ACTION_LIMIT,
                behavior,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SafeAction for EchoAction {
        type Input = EchoInput;
        type Output = String;

        const NAME: &'static str = "echo";

        fn rate_limit(&self) -> u32 {
            self.limit
        }

        async fn execute(&self, input: EchoInput, ctx: ActionContext) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Echo => Ok(format!("{}:{}:{}", ctx.principal_id, input.title, input.count)),
                Behavior::FailWith(make) => Err(make()),
                Behavior::Panic => panic!("index out of bounds in {}", input.title),
            }
        }
    }

    fn runner(environment: Environment) -> (ActionRunner, Arc<CountingCounterStore>) {
        let store = Arc::new(CountingCounterStore::default());
        let limiter = RateLimiter::new(store.clone(), FailurePolicy::FailOpen);
        (ActionRunner::new(limiter, environment), store)
    }

    fn valid_input() -> Value {
        json!({ "title": "hello", "count": 2 })
    }

    #[tokio::test]
    async fn unauthenticated_call_stops_before_validation() {
        let (runner, store) = runner(Environment::Development);
        let action = EchoAction::new(Behavior::Echo);

        // Even garbage input reports Unauthorized: validation never ran.
        let outcome = runner.run(&action, None, json!("garbage")).await;
        assert_eq!(outcome, Err(ActionError::Unauthorized));
        assert_eq!(action.calls(), 0);
        assert_eq!(store.hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalid_input_never_reaches_rate_limit_or_execute() {
        let (runner, store) = runner(Environment::Development);
        let action = EchoAction::new(Behavior::Echo);
        let principal = Principal::user("u1");

        let outcome = runner
            .run(&action, Some(&principal), json!({ "title": "", "count": 0 }))
            .await;
        assert_eq!(
            outcome,
            Err(ActionError::InvalidInput(vec![
                "Count must be positive".into(),
                "Title is required".into(),
            ]))
        );
        assert_eq!(action.calls(), 0);
        assert_eq!(store.hits.load(Ordering::SeqCst), 0);

        let outcome = runner
            .run(&action, Some(&principal), json!({ "title": "x" }))
            .await;
        assert!(matches!(outcome, Err(ActionError::InvalidInput(ref m)) if m.len() == 1));
    }

    #[tokio::test]
    async fn malformed_body_is_invalid_input_after_authentication() {
        let (runner, store) = runner(Environment::Development);
        let action = EchoAction::new(Behavior::Echo);
        let body = RawInput::from_body(br#"{"title": "x","#);
        assert!(matches!(body, RawInput::Malformed(_)));

        let outcome = runner.run(&action, None, body.clone()).await;
        assert_eq!(outcome, Err(ActionError::Unauthorized));

        let principal = Principal::user("u1");
        match runner.run(&action, Some(&principal), body).await {
            Err(ActionError::InvalidInput(messages)) => {
                assert_eq!(messages.len(), 1);
                assert!(messages[0].starts_with("Malformed JSON body: EOF"), "{}", messages[0]);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(action.calls(), 0);
        assert_eq!(store.hits.load(Ordering::SeqCst), 0);

        assert_eq!(RawInput::from_body(b""), RawInput::Json(Value::Null));
    }

    #[tokio::test]
    async fn panics_in_execute_become_internal_errors() {
        let action = EchoAction::new(Behavior::Panic);
        let principal = Principal::user("u1");

        let (prod, _) = runner(Environment::Production);
        let outcome = prod.run(&action, Some(&principal), valid_input()).await;
        assert_eq!(
            outcome,
            Err(ActionError::Internal("Internal Server Error".into()))
        );

        let (dev, _) = runner(Environment::Development);
        let outcome = dev.run(&action, Some(&principal), valid_input()).await;
        assert_eq!(
            outcome,
            Err(ActionError::Internal("action panicked: index out of bounds in hello".into()))
        );
    }

    #[tokio::test]
    async fn rate_limited_calls_do_not_execute() {
        let (runner, _) = runner(Environment::Development);
        let mut action = EchoAction::new(Behavior::Echo);
        action.limit = 2;
        let principal = Principal::user("u1");

        for _ in 0..2 {
            let outcome = runner.run(&action, Some(&principal), valid_input()).await;
            assert_eq!(outcome, Ok("u1:hello:2".to_string()));
        }
        let outcome = runner.run(&action, Some(&principal), valid_input()).await;
        assert_eq!(outcome, Err(ActionError::RateLimited));
        assert_eq!(action.calls(), 2);

        // Keys are per principal.
        let other = Principal::user("u2");
        assert!(runner.run(&action, Some(&other), valid_input()).await.is_ok());
    }

    #[tokio::test]
    async fn internal_errors_are_opaque_in_production() {
        let action = EchoAction::new(Behavior::FailWith(|| anyhow::anyhow!("disk on fire")));
        let principal = Principal::user("u1");

        let (prod, _) = runner(Environment::Production);
        let outcome = prod.run(&action, Some(&principal), valid_input()).await;
        assert_eq!(
            outcome,
            Err(ActionError::Internal("Internal Server Error".into()))
        );

        let (dev, _) = runner(Environment::Development);
        let outcome = dev.run(&action, Some(&principal), valid_input()).await;
        assert_eq!(outcome, Err(ActionError::Internal("disk on fire".into())));
    }

    #[tokio::test]
    async fn guard_denials_become_unauthorized() {
        let principal = Principal::user("u1");
        let (runner, _) = runner(Environment::Development);

        for make in [
            (|| GuardError::TenantNotFound.into()) as fn() -> anyhow::Error,
            || GuardError::Unauthorized.into(),
        ] {
            let action = EchoAction::new(Behavior::FailWith(make));
            let outcome = runner.run(&action, Some(&principal), valid_input()).await;
            assert_eq!(outcome, Err(ActionError::Unauthorized));
        }
    }

    #[tokio::test]
    async fn action_failures_pass_through() {
        let principal = Principal::user("u1");
        let (runner, _) = runner(Environment::Production);
        let action = EchoAction::new(Behavior::FailWith(|| {
            ActionFailure::new("Subdomain already taken").into()
        }));
        let outcome = runner.run(&action, Some(&principal), valid_input()).await;
        assert_eq!(outcome, Err(ActionError::Failed("Subdomain already taken".into())));
    }

    #[test]
    fn envelope_has_uniform_shape() {
        let ok: ActionOutcome<u32> = Ok(7);
        assert_eq!(envelope(&ok), json!({ "success": true, "data": 7 }));

        let err: ActionOutcome<u32> = Err(ActionError::InvalidInput(vec!["a".into(), "b".into()]));
        assert_eq!(
            envelope(&err),
            json!({ "success": false, "error": "Invalid input: a, b" })
        );

        let limited: ActionOutcome<u32> = Err(ActionError::RateLimited);
        assert_eq!(
            envelope(&limited)["error"],
            "Rate limit exceeded. Please try again later."
        );
    }
}
