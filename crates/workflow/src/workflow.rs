//! The workflow contract.

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};

use crate::context::ExecutionContext;
use crate::error::StepError;
use crate::outcome::Outcome;

/// A named unit of orchestration executed by the engine.
///
/// `execute` returns `Ok(Outcome::Failure(..))` for expected business
/// failures and `Err(..)` for anything unexpected. Both are accepted by
/// the engine and both trigger compensation; they are logged and metered
/// differently.
#[async_trait]
pub trait Workflow: Send + Sync {
    type Input: Serialize + DeserializeOwned + Send + 'static;
    type Output: Serialize + DeserializeOwned + Send + 'static;

    /// Stable identifier used for registration, lock keys and extension matching.
    fn name(&self) -> &str;

    /// Number of steps, when known up front. Carried on step events.
    fn total_steps(&self) -> Option<u32> {
        None
    }

    async fn execute(
        &self,
        input: Self::Input,
        ctx: &mut ExecutionContext,
    ) -> Result<Outcome<Self::Output>, StepError>;

    /// Undoes partial effects after a failure.
    ///
    /// The default unwinds the compensations registered by completed steps,
    /// newest first. Overrides may use metadata recorded during the forward
    /// pass instead.
    async fn compensate(&self, ctx: &mut ExecutionContext) -> Result<(), StepError> {
        ctx.run_compensations().await
    }
}
