//! Artifact source declarations and resolved artifact outcomes

use crate::core::parameter::ParameterField;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Identifier given to the primary artifact once a source is selected
pub const PRIMARY_ARTIFACT: &str = "primary";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArtifactSourceType {
    DockerRegistry,
    Gcr,
    Ecr,
    Acr,
    Nexus3Registry,
    ArtifactoryRegistry,
    AmazonS3,
    Jenkins,
    GithubPackageRegistry,
    AzureArtifacts,
    AmazonMachineImage,
    GoogleArtifactRegistry,
    CustomArtifact,
}

impl ArtifactSourceType {
    /// Remote task type that fetches artifacts of this source type
    pub fn task_type(&self) -> &'static str {
        match self {
            ArtifactSourceType::DockerRegistry => "DOCKER_ARTIFACT_TASK_NG",
            ArtifactSourceType::Gcr => "GCR_ARTIFACT_TASK_NG",
            ArtifactSourceType::Ecr => "ECR_ARTIFACT_TASK_NG",
            ArtifactSourceType::Acr => "ACR_ARTIFACT_TASK_NG",
            ArtifactSourceType::Nexus3Registry => "NEXUS_ARTIFACT_TASK_NG",
            ArtifactSourceType::ArtifactoryRegistry => "ARTIFACTORY_ARTIFACT_TASK_NG",
            ArtifactSourceType::AmazonS3 => "AMAZON_S3_ARTIFACT_TASK_NG",
            ArtifactSourceType::Jenkins => "JENKINS_ARTIFACT_TASK_NG",
            ArtifactSourceType::GithubPackageRegistry => "GITHUB_PACKAGES_TASK_NG",
            ArtifactSourceType::AzureArtifacts => "AZURE_ARTIFACT_TASK_NG",
            ArtifactSourceType::AmazonMachineImage => "AMI_ARTIFACT_TASK_NG",
            ArtifactSourceType::GoogleArtifactRegistry => "GOOGLE_ARTIFACT_REGISTRY_TASK_NG",
            ArtifactSourceType::CustomArtifact => "CUSTOM_ARTIFACT_NG",
        }
    }
}

/// `artifacts` block of a service definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactListConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<PrimaryArtifact>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sidecars: Vec<SidecarArtifactWrapper>,
}

/// Either an inline primary (`type` + `spec`) or a list of `sources` with a
/// `primaryArtifactRef` choosing one of them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrimaryArtifact {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<ArtifactSourceType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_artifact_ref: Option<ParameterField<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<ArtifactSource>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactSource {
    pub identifier: String,
    #[serde(rename = "type")]
    pub source_type: ArtifactSourceType,
    #[serde(default)]
    pub spec: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SidecarArtifactWrapper {
    pub sidecar: SidecarArtifact,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SidecarArtifact {
    pub identifier: String,
    #[serde(rename = "type")]
    pub source_type: ArtifactSourceType,
    #[serde(default)]
    pub spec: Value,
}

impl ArtifactListConfig {
    /// Replace a source-list primary with the source named by
    /// `primaryArtifactRef`. A ref given as an expression is left alone.
    pub fn select_primary_source(&mut self) {
        let Some(primary) = self.primary.as_mut() else { return };
        if primary.spec.is_some() || primary.sources.is_empty() {
            return;
        }
        let Some(ParameterField::Value(reference)) = primary.primary_artifact_ref.as_ref() else {
            return;
        };
        if let Some(source) = primary.sources.iter().find(|s| &s.identifier == reference) {
            *primary = PrimaryArtifact {
                source_type: Some(source.source_type),
                spec: Some(source.spec.clone()),
                primary_artifact_ref: None,
                sources: Vec::new(),
            };
        }
    }

    /// Flatten into artifact configs, primary first, then sidecars in
    /// declaration order. A primary without a selected spec is omitted.
    pub fn artifact_configs(&self) -> Vec<ArtifactConfig> {
        let mut configs = Vec::new();
        if let Some(primary) = &self.primary {
            if let (Some(source_type), Some(spec)) = (primary.source_type, primary.spec.as_ref()) {
                configs.push(ArtifactConfig {
                    identifier: PRIMARY_ARTIFACT.to_string(),
                    source_type,
                    spec: spec.clone(),
                    primary_artifact: true,
                });
            }
        }
        for wrapper in &self.sidecars {
            configs.push(ArtifactConfig {
                identifier: wrapper.sidecar.identifier.clone(),
                source_type: wrapper.sidecar.source_type,
                spec: wrapper.sidecar.spec.clone(),
                primary_artifact: false,
            });
        }
        configs
    }
}

/// One artifact ready to be fetched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactConfig {
    pub identifier: String,
    pub source_type: ArtifactSourceType,
    pub spec: Value,
    pub primary_artifact: bool,
}

const LOG_INFO_FIELDS: &[&str] = &[
    "connectorRef",
    "imagePath",
    "repository",
    "tag",
    "tagRegex",
    "artifactPath",
    "bucketName",
    "filePath",
    "version",
];

const CUSTOM_SCRIPT_POINTER: &str = "/scripts/fetchAllArtifacts/spec/source/spec/script";

impl ArtifactConfig {
    /// Short description used in execution logs
    pub fn log_info(&self) -> String {
        let mut parts = vec![format!("type: {:?}", self.source_type)];
        for field in LOG_INFO_FIELDS {
            match self.spec.get(*field) {
                Some(Value::String(s)) => parts.push(format!("{}: {}", field, s)),
                Some(Value::Number(n)) => parts.push(format!("{}: {}", field, n)),
                _ => {}
            }
        }
        parts.join(", ")
    }

    /// A custom artifact whose fetch script is absent or blank is resolved
    /// in place. Everything else needs a remote task.
    pub fn needs_remote_fetch(&self) -> bool {
        if self.source_type != ArtifactSourceType::CustomArtifact {
            return true;
        }
        if self.spec.get("scripts").map_or(true, Value::is_null) {
            return false;
        }
        self.spec
            .pointer(CUSTOM_SCRIPT_POINTER)
            .and_then(Value::as_str)
            .is_some_and(|script| !script.trim().is_empty())
    }

    pub fn delegate_selectors(&self) -> Vec<String> {
        self.spec
            .get("delegateSelectors")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Resolved details of one artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactOutcome {
    pub identifier: String,
    #[serde(rename = "type")]
    pub source_type: ArtifactSourceType,
    pub primary_artifact: bool,
    pub spec: Value,
    /// Details returned by the remote fetch; absent for in-place artifacts
    #[serde(default)]
    pub details: Option<Value>,
}

impl ArtifactOutcome {
    pub fn from_config(config: &ArtifactConfig, details: Option<Value>) -> Self {
        Self {
            identifier: config.identifier.clone(),
            source_type: config.source_type,
            primary_artifact: config.primary_artifact,
            spec: config.spec.clone(),
            details,
        }
    }
}

/// Published under the stage-visible `artifacts` output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactsOutcome {
    pub primary: Option<ArtifactOutcome>,
    pub sidecars: BTreeMap<String, ArtifactOutcome>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_select_primary_source() {
        let mut artifacts: ArtifactListConfig = serde_yaml::from_str(
            r#"
primary:
  primaryArtifactRef: nginx
  sources:
    - identifier: redis
      type: DockerRegistry
      spec: { imagePath: redis }
    - identifier: nginx
      type: Ecr
      spec: { imagePath: nginx, tag: "1.25" }
"#,
        )
        .unwrap();

        artifacts.select_primary_source();
        let configs = artifacts.artifact_configs();

        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].identifier, PRIMARY_ARTIFACT);
        assert_eq!(configs[0].source_type, ArtifactSourceType::Ecr);
        assert_eq!(configs[0].spec["imagePath"], "nginx");
    }

    #[test]
    fn test_expression_ref_leaves_sources_untouched() {
        let mut artifacts: ArtifactListConfig = serde_yaml::from_str(
            r#"
primary:
  primaryArtifactRef: <+input>
  sources:
    - identifier: nginx
      type: DockerRegistry
      spec: {}
"#,
        )
        .unwrap();

        artifacts.select_primary_source();
        assert!(artifacts.primary.as_ref().unwrap().spec.is_none());
        assert!(artifacts.artifact_configs().is_empty());
    }

    #[test]
    fn test_custom_artifact_remote_fetch_decision() {
        let mut config = ArtifactConfig {
            identifier: "custom".to_string(),
            source_type: ArtifactSourceType::CustomArtifact,
            spec: json!({"version": "1.0"}),
            primary_artifact: false,
        };
        assert!(!config.needs_remote_fetch());

        config.spec = json!({"scripts": {"fetchAllArtifacts": {"spec": {"source": {"spec": {"script": "  "}}}}}});
        assert!(!config.needs_remote_fetch());

        config.spec = json!({"scripts": {"fetchAllArtifacts": {"spec": {"source": {"spec": {"script": "curl x"}}}}}});
        assert!(config.needs_remote_fetch());

        config.source_type = ArtifactSourceType::DockerRegistry;
        config.spec = json!({});
        assert!(config.needs_remote_fetch());
    }

    #[test]
    fn test_log_info_and_selectors() {
        let config = ArtifactConfig {
            identifier: PRIMARY_ARTIFACT.to_string(),
            source_type: ArtifactSourceType::DockerRegistry,
            spec: json!({"imagePath": "library/nginx", "tag": "latest", "delegateSelectors": ["d1"]}),
            primary_artifact: true,
        };
        assert_eq!(
            config.log_info(),
            "type: DockerRegistry, imagePath: library/nginx, tag: latest"
        );
        assert_eq!(config.delegate_selectors(), vec!["d1".to_string()]);
    }
}
