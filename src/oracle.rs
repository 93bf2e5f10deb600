pub mod openai;

use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::warn;
use utoipa::ToSchema;

use crate::error::{Error, Result};

/// Grading material handed to the oracle alongside the learner's text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Rubric {
    pub system_message: String,
    #[serde(default)]
    pub reference_text: String,
    pub task: String,
}

/// Score card returned by the oracle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct Evaluation {
    /// Score from 0 to 100
    pub score: i64,
    /// Feedback for the learner about the submission
    pub feedback: String,
    /// A concrete next step the learner should take
    pub next_step: String,
}

/// Opaque scorer. Implementations report `Error::OracleTimeout` or
/// `Error::Oracle`; anything else is treated as an oracle failure too.
#[async_trait]
pub trait ScoringOracle: Send + Sync {
    async fn evaluate(&self, rubric: &Rubric, submission: &str) -> Result<Evaluation>;
}

/// Runs one evaluation with a hard time bound and a clamped score. Holds no
/// lock or transaction while waiting.
pub async fn evaluate_bounded(
    oracle: &dyn ScoringOracle,
    rubric: &Rubric,
    submission: &str,
    timeout: Duration,
) -> Result<Evaluation> {
    match tokio::time::timeout(timeout, oracle.evaluate(rubric, submission)).await {
        Ok(Ok(mut evaluation)) => {
            evaluation.score = evaluation.score.clamp(0, 100);
            Ok(evaluation)
        }
        Ok(Err(e @ (Error::OracleTimeout | Error::Oracle(_)))) => {
            warn!("scoring oracle failed: {e}");
            Err(e)
        }
        Ok(Err(e)) => {
            warn!("scoring oracle failed: {e}");
            Err(Error::Oracle(e.to_string()))
        }
        Err(_) => {
            warn!("scoring oracle timed out after {:?}", timeout);
            Err(Error::OracleTimeout)
        }
    }
}
