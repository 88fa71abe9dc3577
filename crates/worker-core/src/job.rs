//! The job configuration value object.
//!
//! A `JobConfiguration` is rendered from a work pool's base job template
//! plus deployment overrides, then enriched with flow-run context just
//! before submission. Subtype-specific fields ride along in an extension
//! bag so rendering stays structural.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Context as _;
use chrono::SecondsFormat;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::schemas::{Deployment, Flow, FlowRun};
use crate::template::{self, BlockDocumentResolver};

/// Command used to start a flow run when the configuration leaves it unset.
///
/// Passed through opaquely; the worker never interprets it.
pub const DEFAULT_FLOW_RUN_COMMAND: &str = "python -m prefect.engine";

/// A resource related to an emitted event (deployment, flow, tag, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelatedResource {
    /// Resource id, e.g. `prefect.deployment.<uuid>`.
    #[serde(rename = "prefect.resource.id")]
    pub id: String,
    /// Role the resource plays for the event.
    #[serde(rename = "prefect.resource.role")]
    pub role: String,
    /// Display name, when the resource has one.
    #[serde(rename = "prefect.resource.name", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Rendered instructions for launching one flow run on some infrastructure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobConfiguration {
    /// Command used to start the flow run. Empty strings deserialize as
    /// unset; `prepare_for_flow_run` fills in the engine default.
    #[serde(default, deserialize_with = "empty_string_as_none")]
    pub command: Option<String>,
    /// Environment for the launched infrastructure. Null values mark
    /// variables to drop and are removed by `prepare_for_flow_run`.
    #[serde(default)]
    pub env: BTreeMap<String, Option<String>>,
    /// Labels applied to infrastructure created from this configuration.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Name given to the created infrastructure.
    #[serde(default)]
    pub name: Option<String>,
    /// Subtype-specific fields the base engine carries but does not read.
    #[serde(flatten)]
    pub extra: Map<String, Value>,

    #[serde(skip)]
    related: Vec<RelatedResource>,
}

impl JobConfiguration {
    /// Renders a configuration from a base job template and override values.
    ///
    /// Rendering starts from the schema defaults, overlays `values`,
    /// resolves block-document references, and substitutes the result into
    /// the `job_configuration` tree. The template is expected to have been
    /// validated server-side.
    pub async fn from_template_and_values(
        base_job_template: &Value,
        values: &Map<String, Value>,
        resolver: &dyn BlockDocumentResolver,
    ) -> anyhow::Result<Self> {
        let job_configuration = base_job_template
            .get("job_configuration")
            .context("base job template is missing a `job_configuration` section")?;
        let variables_schema = base_job_template
            .get("variables")
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()));

        let mut variables = template::schema_defaults(&variables_schema);
        for (name, value) in values {
            variables.insert(name.clone(), value.clone());
        }
        let variables = template::resolve_block_document_references(variables, resolver).await?;

        let populated = template::apply_values(job_configuration, &variables);
        serde_json::from_value(populated)
            .context("rendered job configuration did not match the expected shape")
    }

    /// Overlays flow-run context onto the rendered configuration.
    ///
    /// Fills the environment (base settings, then the flow-run id, then the
    /// user environment, dropping nulls), the observable label set, and the
    /// name/command fallbacks. Also records the related resources used when
    /// emitting the submission event.
    pub fn prepare_for_flow_run(
        &mut self,
        flow_run: &FlowRun,
        deployment: Option<&Deployment>,
        flow: Option<&Flow>,
        base_env: &BTreeMap<String, String>,
    ) {
        let mut env: BTreeMap<String, Option<String>> = base_env
            .iter()
            .map(|(key, value)| (key.clone(), Some(value.clone())))
            .collect();
        env.insert(
            "PREFECT__FLOW_RUN_ID".to_string(),
            Some(flow_run.id.as_simple().to_string()),
        );
        env.extend(self.env.clone());
        self.env = env.into_iter().filter(|(_, value)| value.is_some()).collect();

        let mut labels = flow_run_labels(flow_run);
        if let Some(deployment) = deployment {
            labels.extend(deployment_labels(deployment));
        }
        if let Some(flow) = flow {
            labels.extend(flow_labels(flow));
        }
        labels.extend(self.labels.clone());
        self.labels = labels;

        if self.name.is_none() {
            self.name = Some(flow_run.name.clone());
        }
        if self.command.is_none() {
            self.command = Some(DEFAULT_FLOW_RUN_COMMAND.to_string());
        }

        self.related = related_resources(flow_run, deployment, flow);
    }

    /// Environment entries with their null markers filtered out.
    pub fn env_vars(&self) -> impl Iterator<Item = (&str, &str)> {
        self.env
            .iter()
            .filter_map(|(key, value)| value.as_deref().map(|value| (key.as_str(), value)))
    }

    /// Resources related to this configuration's flow run, for events.
    pub fn related_resources(&self) -> &[RelatedResource] {
        &self.related
    }
}

/// The variables schema of the engine-default base job template.
pub fn default_variables_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "name": {
                "title": "Name",
                "type": "string",
                "description": "Name given to infrastructure created by a worker.",
            },
            "env": {
                "title": "Environment Variables",
                "type": "object",
                "additionalProperties": {"type": "string"},
                "default": {},
                "description": "Environment variables to set when starting a flow run.",
            },
            "labels": {
                "title": "Labels",
                "type": "object",
                "additionalProperties": {"type": "string"},
                "default": {},
                "description": "Labels applied to infrastructure created by a worker.",
            },
            "command": {
                "title": "Command",
                "type": "string",
                "description": "The command to use when starting a flow run. In most cases, \
                    this should be left blank and the command will be automatically generated \
                    by the worker.",
            },
        },
    })
}

/// The base job template installed on pools that do not have one yet.
pub fn default_base_job_template() -> Value {
    let variables = default_variables_schema();
    serde_json::json!({
        "job_configuration": template::json_template(&variables),
        "variables": variables,
    })
}

/// Lowercases a name and collapses anything non-alphanumeric into dashes.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            slug.push(ch.to_ascii_lowercase());
            pending_dash = false;
        } else {
            pending_dash = true;
        }
    }
    slug
}

fn empty_string_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|text| !text.is_empty()))
}

fn flow_run_labels(flow_run: &FlowRun) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("prefect.io/flow-run-id".to_string(), flow_run.id.to_string()),
        ("prefect.io/flow-run-name".to_string(), flow_run.name.clone()),
        (
            "prefect.io/version".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        ),
    ])
}

fn deployment_labels(deployment: &Deployment) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([
        (
            "prefect.io/deployment-id".to_string(),
            deployment.id.to_string(),
        ),
        (
            "prefect.io/deployment-name".to_string(),
            deployment.name.clone(),
        ),
    ]);
    if let Some(updated) = deployment.updated {
        labels.insert(
            "prefect.io/deployment-updated".to_string(),
            updated.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        );
    }
    labels
}

fn flow_labels(flow: &Flow) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("prefect.io/flow-id".to_string(), flow.id.to_string()),
        ("prefect.io/flow-name".to_string(), flow.name.clone()),
    ])
}

fn related_resources(
    flow_run: &FlowRun,
    deployment: Option<&Deployment>,
    flow: Option<&Flow>,
) -> Vec<RelatedResource> {
    let mut related = Vec::new();
    let mut tags: BTreeSet<String> = BTreeSet::new();

    if let Some(deployment) = deployment {
        tags.extend(deployment.tags.iter().cloned());
        related.push(RelatedResource {
            id: format!("prefect.deployment.{}", deployment.id),
            role: "deployment".to_string(),
            name: Some(deployment.name.clone()),
        });
    }
    if let Some(flow) = flow {
        tags.extend(flow.tags.iter().cloned());
        related.push(RelatedResource {
            id: format!("prefect.flow.{}", flow.id),
            role: "flow".to_string(),
            name: Some(flow.name.clone()),
        });
    }
    tags.extend(flow_run.tags.iter().cloned());
    related.push(RelatedResource {
        id: format!("prefect.flow-run.{}", flow_run.id),
        role: "flow-run".to_string(),
        name: Some(flow_run.name.clone()),
    });

    for tag in tags {
        related.push(RelatedResource {
            id: format!("prefect.tag.{tag}"),
            role: "tag".to_string(),
            name: None,
        });
    }

    related
}
