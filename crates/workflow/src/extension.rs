//! Extension points for named workflows.
//!
//! A [`Customizer`] hooks before/after/error around a workflow run and may
//! rewrite its output. A [`StepProvider`] injects an extra step at a fixed
//! position. Both are bound to a workflow by name and collected once at
//! startup into an immutable [`ExtensionRegistry`]. Workflows that opt in
//! implement [`ExtensibleWorkflow`] and are wrapped in [`Extended`], which
//! applies the hooks in a fixed order.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};

use crate::context::ExecutionContext;
use crate::error::StepError;
use crate::outcome::{Failure, Outcome};
use crate::step::Step;
use crate::workflow::Workflow;

/// Cross-cutting hooks around a named workflow.
///
/// Customizers for a workflow run in ascending [`order`](Customizer::order).
#[async_trait]
pub trait Customizer<I, O>: Send + Sync
where
    I: Send + Sync + 'static,
    O: Send + 'static,
{
    fn workflow_name(&self) -> &str;

    fn order(&self) -> i32 {
        0
    }

    async fn before_execute(&self, _input: &I, _ctx: &mut ExecutionContext) -> Result<(), StepError> {
        Ok(())
    }

    /// May replace the output.
    async fn after_execute(
        &self,
        _input: &I,
        output: O,
        _ctx: &mut ExecutionContext,
    ) -> Result<O, StepError> {
        Ok(output)
    }

    /// Called when the run fails. Errors returned here are logged and ignored.
    async fn on_error(
        &self,
        _input: &I,
        _failure: &Failure,
        _ctx: &ExecutionContext,
    ) -> Result<(), StepError> {
        Ok(())
    }
}

/// Where a provided step is inserted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StepPosition {
    BeforeAll,
    AfterAll,
    BeforeStep(String),
    AfterStep(String),
}

/// Supplies an extra step for a named workflow.
///
/// Injected steps see JSON: `BeforeAll` gets the workflow input, `AfterAll`
/// the output, `BeforeStep` the step's input and `AfterStep` its output.
/// Their own outputs are discarded; their errors fail the run.
pub trait StepProvider: Send + Sync {
    fn workflow_name(&self) -> &str;

    fn position(&self) -> StepPosition;

    fn order(&self) -> i32 {
        0
    }

    fn is_enabled(&self) -> bool {
        true
    }

    fn step(&self) -> Step<serde_json::Value, serde_json::Value>;
}

struct CustomizerEntry {
    order: i32,
    type_name: &'static str,
    // Holds an `Arc<dyn Customizer<I, O>>`
    handle: Box<dyn Any + Send + Sync>,
}

/// Immutable, ordered per-workflow extension lists.
#[derive(Default)]
pub struct ExtensionRegistry {
    customizers: HashMap<String, Vec<CustomizerEntry>>,
    providers: HashMap<String, Vec<Arc<dyn StepProvider>>>,
}

impl ExtensionRegistry {
    pub fn builder() -> ExtensionRegistryBuilder {
        ExtensionRegistryBuilder::default()
    }

    /// An empty registry.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Customizers for `workflow_name` with matching input/output types, in order.
    pub fn customizers_for<I, O>(&self, workflow_name: &str) -> Vec<Arc<dyn Customizer<I, O>>>
    where
        I: Send + Sync + 'static,
        O: Send + 'static,
    {
        let Some(entries) = self.customizers.get(workflow_name) else {
            return Vec::new();
        };

        entries
            .iter()
            .filter_map(|entry| {
                let customizer = entry.handle.downcast_ref::<Arc<dyn Customizer<I, O>>>();
                if customizer.is_none() {
                    tracing::warn!(
                        workflow = workflow_name,
                        customizer = entry.type_name,
                        "skipping customizer with mismatched input/output types"
                    );
                }
                customizer.cloned()
            })
            .collect()
    }

    /// Enabled step providers for `workflow_name`, in order.
    pub fn providers_for(&self, workflow_name: &str) -> Vec<Arc<dyn StepProvider>> {
        self.providers
            .get(workflow_name)
            .map(|providers| {
                providers
                    .iter()
                    .filter(|p| p.is_enabled())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn customizer_count(&self, workflow_name: &str) -> usize {
        self.customizers.get(workflow_name).map_or(0, Vec::len)
    }

    pub fn provider_count(&self, workflow_name: &str) -> usize {
        self.providers.get(workflow_name).map_or(0, Vec::len)
    }
}

/// Collects extensions before freezing them into a registry.
#[derive(Default)]
pub struct ExtensionRegistryBuilder {
    customizers: HashMap<String, Vec<CustomizerEntry>>,
    providers: HashMap<String, Vec<Arc<dyn StepProvider>>>,
}

impl ExtensionRegistryBuilder {
    pub fn customizer<I, O, C>(mut self, customizer: C) -> Self
    where
        I: Send + Sync + 'static,
        O: Send + 'static,
        C: Customizer<I, O> + 'static,
    {
        let name = customizer.workflow_name().to_string();
        let order = customizer.order();
        let handle: Arc<dyn Customizer<I, O>> = Arc::new(customizer);
        self.customizers
            .entry(name)
            .or_default()
            .push(CustomizerEntry {
                order,
                type_name: std::any::type_name::<C>(),
                handle: Box::new(handle),
            });
        self
    }

    pub fn provider(mut self, provider: impl StepProvider + 'static) -> Self {
        self.providers
            .entry(provider.workflow_name().to_string())
            .or_default()
            .push(Arc::new(provider));
        self
    }

    /// Sorts every list by order; ties keep registration order.
    pub fn build(mut self) -> ExtensionRegistry {
        for entries in self.customizers.values_mut() {
            entries.sort_by_key(|entry| entry.order);
        }
        for providers in self.providers.values_mut() {
            providers.sort_by_key(|provider| provider.order());
        }
        ExtensionRegistry {
            customizers: self.customizers,
            providers: self.providers,
        }
    }
}

/// Runs a workflow's own steps with `BeforeStep`/`AfterStep` injection.
pub struct StepRunner<'a> {
    ctx: &'a mut ExecutionContext,
    providers: &'a [Arc<dyn StepProvider>],
}

impl<'a> StepRunner<'a> {
    pub fn new(ctx: &'a mut ExecutionContext, providers: &'a [Arc<dyn StepProvider>]) -> Self {
        Self { ctx, providers }
    }

    pub fn context(&self) -> &ExecutionContext {
        self.ctx
    }

    pub fn context_mut(&mut self) -> &mut ExecutionContext {
        self.ctx
    }

    /// Invokes `step`, surrounded by any providers positioned on its name.
    pub async fn run<I, O>(&mut self, step: &Step<I, O>, input: I) -> Result<O, StepError>
    where
        I: Serialize + Send + 'static,
        O: Serialize + Send + 'static,
    {
        let before = StepPosition::BeforeStep(step.name().to_string());
        if self.has_providers(&before) {
            let input_json = serde_json::to_value(&input)?;
            run_injected(self.providers, &before, input_json, self.ctx).await?;
        }

        let output = step.invoke(input, self.ctx).await?;

        let after = StepPosition::AfterStep(step.name().to_string());
        if self.has_providers(&after) {
            let output_json = serde_json::to_value(&output)?;
            run_injected(self.providers, &after, output_json, self.ctx).await?;
        }

        Ok(output)
    }

    fn has_providers(&self, position: &StepPosition) -> bool {
        self.providers.iter().any(|p| &p.position() == position)
    }
}

async fn run_injected(
    providers: &[Arc<dyn StepProvider>],
    position: &StepPosition,
    input: serde_json::Value,
    ctx: &mut ExecutionContext,
) -> Result<(), StepError> {
    for provider in providers.iter().filter(|p| &p.position() == position) {
        provider.step().invoke(input.clone(), ctx).await?;
    }
    Ok(())
}

/// A workflow whose body runs inside the extension template.
#[async_trait]
pub trait ExtensibleWorkflow: Send + Sync {
    type Input: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;
    type Output: Serialize + DeserializeOwned + Send + 'static;

    fn name(&self) -> &str;

    fn total_steps(&self) -> Option<u32> {
        None
    }

    /// The workflow's own logic. Run named steps through `steps` so providers can attach to them.
    async fn do_execute(
        &self,
        input: Self::Input,
        steps: &mut StepRunner<'_>,
    ) -> Result<Outcome<Self::Output>, StepError>;

    async fn compensate(&self, ctx: &mut ExecutionContext) -> Result<(), StepError> {
        ctx.run_compensations().await
    }
}

/// Wraps an [`ExtensibleWorkflow`] so it runs with its registered extensions.
///
/// Order: customizers' `before_execute`, `BeforeAll` steps, `do_execute`,
/// `AfterAll` steps, customizers' `after_execute`. Any error or failure
/// runs every `on_error` hook and surfaces as `Outcome::Failure`.
pub struct Extended<W> {
    inner: W,
    extensions: Arc<ExtensionRegistry>,
}

impl<W: ExtensibleWorkflow> Extended<W> {
    pub fn new(inner: W, extensions: Arc<ExtensionRegistry>) -> Self {
        Self { inner, extensions }
    }

    pub fn inner(&self) -> &W {
        &self.inner
    }

    async fn run_template(
        &self,
        input: W::Input,
        ctx: &mut ExecutionContext,
        customizers: &[Arc<dyn Customizer<W::Input, W::Output>>],
        providers: &[Arc<dyn StepProvider>],
    ) -> Result<Outcome<W::Output>, StepError> {
        for customizer in customizers {
            customizer.before_execute(&input, ctx).await?;
        }

        if providers.iter().any(|p| p.position() == StepPosition::BeforeAll) {
            let input_json = serde_json::to_value(&input)?;
            run_injected(providers, &StepPosition::BeforeAll, input_json, ctx).await?;
        }

        let outcome = {
            let mut runner = StepRunner::new(ctx, providers);
            self.inner.do_execute(input.clone(), &mut runner).await?
        };
        let mut output = match outcome {
            Outcome::Success(output) => output,
            Outcome::Failure(failure) => return Ok(Outcome::Failure(failure)),
        };

        if providers.iter().any(|p| p.position() == StepPosition::AfterAll) {
            let output_json = serde_json::to_value(&output)?;
            run_injected(providers, &StepPosition::AfterAll, output_json, ctx).await?;
        }

        for customizer in customizers {
            output = customizer.after_execute(&input, output, ctx).await?;
        }

        Ok(Outcome::Success(output))
    }
}

#[async_trait]
impl<W: ExtensibleWorkflow> Workflow for Extended<W> {
    type Input = W::Input;
    type Output = W::Output;

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn total_steps(&self) -> Option<u32> {
        self.inner.total_steps()
    }

    async fn execute(
        &self,
        input: W::Input,
        ctx: &mut ExecutionContext,
    ) -> Result<Outcome<W::Output>, StepError> {
        let customizers = self
            .extensions
            .customizers_for::<W::Input, W::Output>(self.name());
        let providers = self.extensions.providers_for(self.name());

        let failure = match self
            .run_template(input.clone(), ctx, &customizers, &providers)
            .await
        {
            Ok(Outcome::Success(output)) => return Ok(Outcome::Success(output)),
            Ok(Outcome::Failure(failure)) => failure,
            Err(error) => Failure::from(error),
        };

        for customizer in &customizers {
            if let Err(e) = customizer.on_error(&input, &failure, ctx).await {
                tracing::warn!(
                    workflow = self.name(),
                    error = %e,
                    "on_error hook failed"
                );
            }
        }

        Ok(Outcome::Failure(failure))
    }

    async fn compensate(&self, ctx: &mut ExecutionContext) -> Result<(), StepError> {
        self.inner.compensate(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Pricing;

    #[async_trait]
    impl ExtensibleWorkflow for Pricing {
        type Input = u32;
        type Output = u32;

        fn name(&self) -> &str {
            "pricing"
        }

        async fn do_execute(
            &self,
            input: u32,
            steps: &mut StepRunner<'_>,
        ) -> Result<Outcome<u32>, StepError> {
            if input == 0 {
                return Ok(Outcome::fail("ZeroQuantity", "nothing to price"));
            }
            let price = Step::from_fn("price", |qty: u32| async move { Ok(qty * 10) });
            let total = steps.run(&price, input).await?;
            if total > 1000 {
                return Err(StepError::new("Overflow", "too expensive"));
            }
            Ok(Outcome::Success(total))
        }
    }

    struct Tagging {
        order: i32,
        log: Log,
        add: u32,
    }

    #[async_trait]
    impl Customizer<u32, u32> for Tagging {
        fn workflow_name(&self) -> &str {
            "pricing"
        }

        fn order(&self) -> i32 {
            self.order
        }

        async fn before_execute(&self, _input: &u32, _ctx: &mut ExecutionContext) -> Result<(), StepError> {
            self.log.lock().unwrap().push(format!("before:{}", self.order));
            Ok(())
        }

        async fn after_execute(
            &self,
            _input: &u32,
            output: u32,
            _ctx: &mut ExecutionContext,
        ) -> Result<u32, StepError> {
            self.log.lock().unwrap().push(format!("after:{}", self.order));
            Ok(output + self.add)
        }

        async fn on_error(
            &self,
            _input: &u32,
            failure: &Failure,
            _ctx: &ExecutionContext,
        ) -> Result<(), StepError> {
            self.log
                .lock()
                .unwrap()
                .push(format!("error:{}:{}", self.order, failure.error_type));
            Err(StepError::new("HookFailed", "ignored"))
        }
    }

    struct WrongTypes;

    #[async_trait]
    impl Customizer<String, String> for WrongTypes {
        fn workflow_name(&self) -> &str {
            "pricing"
        }
    }

    struct Audit {
        position: StepPosition,
        order: i32,
        enabled: bool,
        log: Log,
    }

    impl StepProvider for Audit {
        fn workflow_name(&self) -> &str {
            "pricing"
        }

        fn position(&self) -> StepPosition {
            self.position.clone()
        }

        fn order(&self) -> i32 {
            self.order
        }

        fn is_enabled(&self) -> bool {
            self.enabled
        }

        fn step(&self) -> Step<serde_json::Value, serde_json::Value> {
            let log = self.log.clone();
            let label = format!("{:?}:{}", self.position, self.order);
            Step::from_fn(format!("audit-{}", self.order), move |value: serde_json::Value| {
                let log = log.clone();
                let label = label.clone();
                async move {
                    log.lock().unwrap().push(format!("{label}={value}"));
                    Ok(serde_json::Value::Null)
                }
            })
        }
    }

    fn audit(position: StepPosition, order: i32, log: &Log) -> Audit {
        Audit {
            position,
            order,
            enabled: true,
            log: log.clone(),
        }
    }

    #[tokio::test]
    async fn template_runs_hooks_in_order() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let registry = ExtensionRegistry::builder()
            .customizer(Tagging { order: 2, log: log.clone(), add: 1 })
            .customizer(Tagging { order: 1, log: log.clone(), add: 100 })
            .provider(audit(StepPosition::AfterAll, 0, &log))
            .provider(audit(StepPosition::BeforeStep("price".to_string()), 0, &log))
            .provider(audit(StepPosition::BeforeAll, 0, &log))
            .provider(audit(StepPosition::AfterStep("price".to_string()), 0, &log))
            .build();
        let workflow = Extended::new(Pricing, Arc::new(registry));
        let mut ctx = ExecutionContext::new();

        let outcome = workflow.execute(3, &mut ctx).await.unwrap();

        assert_eq!(outcome.success(), Some(131));
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "before:1",
                "before:2",
                "BeforeAll:0=3",
                "BeforeStep(\"price\"):0=3",
                "AfterStep(\"price\"):0=30",
                "AfterAll:0=30",
                "after:1",
                "after:2",
            ]
        );
        assert_eq!(
            ctx.executed_steps(),
            ["audit-0", "audit-0", "price", "audit-0", "audit-0"]
        );
    }

    #[tokio::test]
    async fn disabled_providers_are_skipped() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let mut disabled = audit(StepPosition::BeforeAll, 0, &log);
        disabled.enabled = false;
        let registry = ExtensionRegistry::builder()
            .provider(disabled)
            .provider(audit(StepPosition::BeforeAll, 5, &log))
            .build();

        assert_eq!(registry.provider_count("pricing"), 2);
        assert_eq!(registry.providers_for("pricing").len(), 1);

        let workflow = Extended::new(Pricing, Arc::new(registry));
        workflow.execute(1, &mut ExecutionContext::new()).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["BeforeAll:5=1"]);
    }

    #[tokio::test]
    async fn errors_run_every_on_error_hook() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let registry = ExtensionRegistry::builder()
            .customizer(Tagging { order: 1, log: log.clone(), add: 0 })
            .customizer(Tagging { order: 2, log: log.clone(), add: 0 })
            .build();
        let workflow = Extended::new(Pricing, Arc::new(registry));

        let outcome = workflow
            .execute(500, &mut ExecutionContext::new())
            .await
            .unwrap();

        let failure = outcome.failure().unwrap();
        assert_eq!(failure.error_type, "Overflow");
        let log = log.lock().unwrap();
        assert!(log.contains(&"error:1:Overflow".to_string()));
        assert!(log.contains(&"error:2:Overflow".to_string()));
        assert!(!log.iter().any(|entry| entry.starts_with("after")));
    }

    #[tokio::test]
    async fn business_failure_skips_after_hooks() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let registry = ExtensionRegistry::builder()
            .customizer(Tagging { order: 1, log: log.clone(), add: 0 })
            .build();
        let workflow = Extended::new(Pricing, Arc::new(registry));

        let outcome = workflow.execute(0, &mut ExecutionContext::new()).await.unwrap();

        assert!(outcome.failure().unwrap().is_business());
        assert_eq!(
            *log.lock().unwrap(),
            vec!["before:1", "error:1:ZeroQuantity"]
        );
    }

    #[tokio::test]
    async fn mismatched_customizer_is_skipped() {
        let registry = ExtensionRegistry::builder().customizer(WrongTypes).build();

        assert_eq!(registry.customizer_count("pricing"), 1);
        assert!(registry.customizers_for::<u32, u32>("pricing").is_empty());
        assert_eq!(registry.customizers_for::<String, String>("pricing").len(), 1);
    }

    #[tokio::test]
    async fn other_workflows_are_untouched() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let registry = ExtensionRegistry::builder()
            .customizer(Tagging { order: 1, log: log.clone(), add: 0 })
            .build();

        assert!(registry.customizers_for::<u32, u32>("shipping").is_empty());
        assert!(registry.providers_for("shipping").is_empty());
    }
}
