//! Service step: settles the effective service definition for a stage

use crate::core::context::{Ambiance, Visibility};
use crate::core::entity::{EntityResolver, ServiceDefinition};
use crate::core::error::StepError;
use crate::core::state::StepResponse;
use crate::execution::log::{LogLevel, LogSink};
use crate::execution::step::SyncExecutable;
use crate::execution::sweeping::SweepingOutputService;
use crate::planner::overrides::{merge_effective_service_config, OverridesFromEnvironment};
use crate::planner::service::ServiceStepParameters;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Stage-visible output holding the effective service
pub const SERVICE: &str = "service";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceOutcome {
    #[serde(default)]
    pub service_ref: Option<String>,
    #[serde(default)]
    pub environment_ref: Option<String>,
    pub service_definition: ServiceDefinition,
}

pub struct ServiceStep {
    parameters: ServiceStepParameters,
    entities: Arc<dyn EntityResolver>,
    outputs: SweepingOutputService,
    log_sink: Arc<dyn LogSink>,
}

fn concrete<'a>(field: &str, value: Option<&'a str>) -> Result<Option<&'a str>, StepError> {
    match value {
        Some(v) if v.contains("<+") => Err(StepError::InvalidRequest(format!(
            "{} [{}] is not resolved",
            field, v
        ))),
        other => Ok(other),
    }
}

impl ServiceStep {
    pub fn new(
        parameters: ServiceStepParameters,
        entities: Arc<dyn EntityResolver>,
        outputs: SweepingOutputService,
        log_sink: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            parameters,
            entities,
            outputs,
            log_sink,
        }
    }

    /// Definition resolved at plan time wins; otherwise look the service up
    /// and apply the environment's overrides
    fn effective_definition(&self, ambiance: &Ambiance) -> Result<ServiceDefinition, StepError> {
        if let Some(definition) = &self.parameters.service_definition {
            return Ok(definition.clone());
        }

        let service_ref = concrete("Service ref", self.parameters.service_ref.as_deref())?
            .ok_or_else(|| StepError::InvalidRequest("Service ref must be provided".to_string()))?;
        let scope = &ambiance.scope;
        let service = self
            .entities
            .service(scope, service_ref)
            .ok_or_else(|| StepError::InvalidRequest(format!("Service [{}] not found", service_ref)))?;

        let overrides = match concrete("Environment ref", self.parameters.environment_ref.as_deref())? {
            Some(environment_ref) => Some(OverridesFromEnvironment {
                service_override_config: self
                    .entities
                    .service_override(scope, environment_ref, service_ref)
                    .map(|o| o.overrides),
                environment_global_override: self
                    .entities
                    .environment(scope, environment_ref)
                    .and_then(|e| e.overrides),
                env_identifier: environment_ref.to_string(),
            }),
            None => self.parameters.overrides.clone(),
        };

        Ok(merge_effective_service_config(
            &service.service_definition,
            None,
            overrides.as_ref(),
        ))
    }
}

#[async_trait]
impl SyncExecutable for ServiceStep {
    async fn execute_sync(&self, ambiance: &Ambiance) -> Result<StepResponse, StepError> {
        let scope = ambiance.scope_key(Visibility::Step);
        let definition = self.effective_definition(ambiance)?;
        let outcome = ServiceOutcome {
            service_ref: self.parameters.service_ref.clone(),
            environment_ref: self.parameters.environment_ref.clone(),
            service_definition: definition,
        };

        self.outputs
            .consume(ambiance, SERVICE, &outcome, Visibility::Stage)
            .await?;
        let name = outcome.service_ref.as_deref().unwrap_or("<inline>");
        info!("Service {} published", name);
        self.log_sink
            .append_line(&scope, LogLevel::Info, &format!("Processed service [{}]", name));

        Ok(StepResponse::succeeded())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::{Level, Scope};
    use crate::core::entity::EntityCatalog;
    use crate::core::plan::StepOutcomeGroup;
    use crate::execution::log::InMemoryLogSink;
    use crate::persistence::InMemorySweepingOutputBackend;
    use serde_json::json;

    const CATALOG: &str = r#"
services:
  - identifier: svc
    serviceDefinition:
      type: Kubernetes
      spec:
        variables:
          - name: replicas
            value: 1
environments:
  - identifier: prod
    overrides:
      variables:
        - name: replicas
          value: 2
serviceOverrides:
  - environmentRef: prod
    serviceRef: svc
    overrides:
      variables:
        - name: replicas
          value: 5
"#;

    async fn run_parameters(
        parameters: ServiceStepParameters,
    ) -> (Result<StepResponse, StepError>, SweepingOutputService, Ambiance) {
        let entities: Arc<dyn EntityResolver> = Arc::new(EntityCatalog::from_yaml(CATALOG).unwrap());
        let outputs = SweepingOutputService::new(Arc::new(InMemorySweepingOutputBackend::new()));
        let ambiance = Ambiance::new("exec", Scope::default())
            .with_level(Level::new("stage", "deploy", Some(StepOutcomeGroup::Stage)))
            .with_level(Level::new("service", "service", Some(StepOutcomeGroup::Step)));
        let step = ServiceStep::new(parameters, entities, outputs.clone(), Arc::new(InMemoryLogSink::new()));
        let result = step.execute_sync(&ambiance).await;
        (result, outputs, ambiance)
    }

    #[tokio::test]
    async fn test_service_override_wins_over_environment() {
        let (result, outputs, ambiance) = run_parameters(ServiceStepParameters {
            service_ref: Some("svc".to_string()),
            environment_ref: Some("prod".to_string()),
            ..Default::default()
        })
        .await;
        assert_eq!(result.unwrap(), StepResponse::succeeded());

        let outcome: ServiceOutcome = outputs.resolve(&ambiance, SERVICE).await.unwrap();
        assert_eq!(outcome.service_definition.spec.variables[0].value, json!(5));
    }

    #[tokio::test]
    async fn test_unresolved_ref_is_rejected() {
        let (result, _, _) = run_parameters(ServiceStepParameters {
            service_ref: Some("<+matrix.serviceRef>".to_string()),
            ..Default::default()
        })
        .await;
        assert!(result.unwrap_err().to_string().contains("is not resolved"));
    }

    #[tokio::test]
    async fn test_missing_service() {
        let (result, _, _) = run_parameters(ServiceStepParameters {
            service_ref: Some("ghost".to_string()),
            ..Default::default()
        })
        .await;
        assert!(result.unwrap_err().to_string().contains("Service [ghost] not found"));
    }
}
