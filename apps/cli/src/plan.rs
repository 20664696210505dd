//! Install plan files.
//!
//! A plan is a TOML document listing the operations of one installation in the
//! order they must run:
//!
//! ```toml
//! name = "contoso"
//!
//! [tokens]
//! "https://management.azure.com/" = "eyJ0eXAi..."
//!
//! [[operations]]
//! kind = "resource_group"
//! subscription_id = "00000000-0000-0000-0000-000000000000"
//! resource_group = "contoso-{id}"
//! location = "westus2"
//! ```
//!
//! `{id}` in any string is replaced by the plan's short id, which stays the same
//! for every operation of the plan within one process.

use callsheet_orchestrator::{
    DEFAULT_ID_LENGTH, Operation, OperationContext, OperationError, shared_id,
};
use callsheet_provisioning::{Endpoints, ProvisioningSession, StaticTokenSource, TrackedRequest};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or building a plan.
#[derive(Debug, Error)]
pub enum PlanError {
    /// The plan or a file it references could not be read.
    #[error("Failed to read {path}: {source}")]
    Read {
        /// File that failed.
        path: String,
        /// Underlying IO error.
        source: std::io::Error,
    },

    /// The plan is not valid TOML or has the wrong shape.
    #[error("Failed to parse plan {path}: {source}")]
    Parse {
        /// Plan file.
        path: String,
        /// Underlying parse error.
        source: toml::de::Error,
    },

    /// A template or parameters file is not valid JSON.
    #[error("Invalid JSON in {path}: {source}")]
    Json {
        /// File that failed.
        path: String,
        /// Underlying parse error.
        source: serde_json::Error,
    },

    /// The plan lists no operations.
    #[error("Plan '{0}' has no operations")]
    Empty(String),
}

/// Result type for plan handling.
pub type Result<T> = std::result::Result<T, PlanError>;

fn default_plan_name() -> String {
    "callsheet".to_string()
}

fn default_language() -> String {
    "1033".to_string()
}

fn default_currency() -> String {
    "USD".to_string()
}

/// One entry of `[[operations]]`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationSpec {
    /// Create a resource group unless it exists.
    ResourceGroup {
        name: Option<String>,
        subscription_id: String,
        resource_group: String,
        location: String,
    },
    /// Deploy an ARM template into a resource group.
    ArmDeployment {
        name: Option<String>,
        subscription_id: String,
        resource_group: String,
        deployment: String,
        /// Template JSON file, relative to the plan.
        template: PathBuf,
        /// Parameters JSON file, relative to the plan.
        parameters: Option<PathBuf>,
    },
    /// Delete a resource group.
    ResourceGroupDeletion {
        name: Option<String>,
        subscription_id: String,
        resource_group: String,
    },
    /// Provision the CDS database of an environment.
    CdsDatabase {
        name: Option<String>,
        environment_id: String,
        #[serde(default = "default_language")]
        language: String,
        #[serde(default = "default_currency")]
        currency: String,
    },
    /// Train a LUIS app version.
    LuisTraining {
        name: Option<String>,
        app_id: String,
        version: String,
    },
    /// Wait a fixed time, e.g. for a role assignment to propagate.
    Pause {
        name: Option<String>,
        millis: u64,
    },
}

impl OperationSpec {
    /// The `kind` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ResourceGroup { .. } => "resource_group",
            Self::ArmDeployment { .. } => "arm_deployment",
            Self::ResourceGroupDeletion { .. } => "resource_group_deletion",
            Self::CdsDatabase { .. } => "cds_database",
            Self::LuisTraining { .. } => "luis_training",
            Self::Pause { .. } => "pause",
        }
    }

    /// The configured name, or one derived from the target.
    pub fn display_name(&self) -> String {
        let (name, fallback) = match self {
            Self::ResourceGroup { name, resource_group, .. } => {
                (name, format!("Create resource group {resource_group}"))
            }
            Self::ArmDeployment { name, deployment, .. } => (name, format!("Deploy {deployment}")),
            Self::ResourceGroupDeletion { name, resource_group, .. } => {
                (name, format!("Delete resource group {resource_group}"))
            }
            Self::CdsDatabase { name, environment_id, .. } => {
                (name, format!("Create CDS database in {environment_id}"))
            }
            Self::LuisTraining { name, app_id, version } => {
                (name, format!("Train LUIS app {app_id} v{version}"))
            }
            Self::Pause { name, millis } => (name, format!("Pause {millis}ms")),
        };
        name.clone().unwrap_or(fallback)
    }
}

/// A parsed install plan.
#[derive(Debug, Clone, Deserialize)]
pub struct InstallPlan {
    /// Plan name; also keys the plan's short id.
    #[serde(default = "default_plan_name")]
    pub name: String,

    /// Report progress without a known total.
    #[serde(default)]
    pub indeterminate: bool,

    /// API locations.
    #[serde(default)]
    pub endpoints: Endpoints,

    /// Bearer tokens by audience.
    #[serde(default)]
    pub tokens: BTreeMap<String, String>,

    /// Operations in run order.
    #[serde(default)]
    pub operations: Vec<OperationSpec>,

    /// Directory relative file references resolve against.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl InstallPlan {
    /// Loads a plan file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|source| PlanError::Read { path: path.display().to_string(), source })?;
        let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Self::parse(&content, base_dir)
            .map_err(|source| PlanError::Parse { path: path.display().to_string(), source })
    }

    /// Parses plan text.
    pub fn parse(content: &str, base_dir: PathBuf) -> std::result::Result<Self, toml::de::Error> {
        let mut plan: Self = toml::from_str(content)?;
        plan.base_dir = base_dir;
        Ok(plan)
    }

    /// The plan's short id.
    pub fn short_id(&self) -> String {
        shared_id(&self.name, DEFAULT_ID_LENGTH)
    }

    /// Replaces `{id}` with the plan's short id.
    pub fn expand(&self, value: &str) -> String {
        if value.contains("{id}") { value.replace("{id}", &self.short_id()) } else { value.to_string() }
    }

    /// Token source serving the plan's tokens, then `fallback`.
    pub fn token_source(&self, fallback: Option<&str>) -> StaticTokenSource {
        let source = self
            .tokens
            .iter()
            .fold(StaticTokenSource::new(), |source, (audience, token)| source.with_token(audience, token));
        match fallback {
            Some(token) => source.with_fallback(token),
            None => source,
        }
    }

    /// Builds runnable operations. Reads referenced files but sends nothing.
    pub fn build(&self, session: &Arc<ProvisioningSession>) -> Result<Vec<Operation>> {
        if self.operations.is_empty() {
            return Err(PlanError::Empty(self.name.clone()));
        }
        self.operations.iter().map(|entry| self.build_one(entry, session)).collect()
    }

    fn build_one(&self, entry: &OperationSpec, session: &Arc<ProvisioningSession>) -> Result<Operation> {
        let name = self.expand(&entry.display_name());
        let session = Arc::clone(session);
        let op = match entry {
            OperationSpec::ResourceGroup { subscription_id, resource_group, location, .. } => {
                Operation::from_step(
                    name,
                    TrackedRequest::ensure_resource_group(
                        session,
                        subscription_id,
                        &self.expand(resource_group),
                        location,
                    ),
                )
            }
            OperationSpec::ArmDeployment {
                subscription_id,
                resource_group,
                deployment,
                template,
                parameters,
                ..
            } => {
                let template = self.read_json(template)?;
                let parameters = match parameters {
                    Some(path) => self.read_json(path)?,
                    None => json!({}),
                };
                Operation::from_step(
                    name,
                    TrackedRequest::arm_deployment(
                        session,
                        subscription_id,
                        &self.expand(resource_group),
                        &self.expand(deployment),
                        template,
                        parameters,
                    ),
                )
            }
            OperationSpec::ResourceGroupDeletion { subscription_id, resource_group, .. } => {
                Operation::from_step(
                    name,
                    TrackedRequest::resource_group_deletion(
                        session,
                        subscription_id,
                        &self.expand(resource_group),
                    ),
                )
            }
            OperationSpec::CdsDatabase { environment_id, language, currency, .. } => Operation::from_step(
                name,
                TrackedRequest::cds_database(session, environment_id, language, currency),
            ),
            OperationSpec::LuisTraining { app_id, version, .. } => {
                Operation::from_step(name, TrackedRequest::luis_training(session, app_id, version))
            }
            OperationSpec::Pause { millis, .. } => pause(name, *millis),
        };
        Ok(op)
    }

    fn read_json(&self, path: &Path) -> Result<Value> {
        let path = self.base_dir.join(path);
        let content = std::fs::read_to_string(&path)
            .map_err(|source| PlanError::Read { path: path.display().to_string(), source })?;
        serde_json::from_str(&content)
            .map_err(|source| PlanError::Json { path: path.display().to_string(), source })
    }
}

fn pause(name: String, millis: u64) -> Operation {
    Operation::new(name, move |ctx: OperationContext| async move {
        tokio::select! {
            biased;
            () = ctx.cancellation().cancelled() => Err(OperationError::Cancelled),
            () = tokio::time::sleep(Duration::from_millis(millis)) => Ok(json!({ "paused_ms": millis })),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use callsheet_orchestrator::OperationRunner;
    use callsheet_provisioning::TokenSource;
    use tempfile::TempDir;

    fn session() -> Arc<ProvisioningSession> {
        let source = Arc::new(StaticTokenSource::new().with_fallback("t"));
        Arc::new(ProvisioningSession::new(source, Endpoints::default()).unwrap())
    }

    const PLAN: &str = r#"
name = "plan-tests"
indeterminate = true

[endpoints]
arm_url = "http://localhost:9999"

[tokens]
"https://management.azure.com/" = "arm-token"

[[operations]]
kind = "resource_group"
subscription_id = "sub"
resource_group = "contoso-{id}"
location = "westus2"

[[operations]]
kind = "arm_deployment"
name = "Deploy bot"
subscription_id = "sub"
resource_group = "contoso-{id}"
deployment = "bot"
template = "template.json"

[[operations]]
kind = "cds_database"
environment_id = "env-1"

[[operations]]
kind = "pause"
millis = 5
"#;

    #[test]
    fn test_parse_plan() {
        let plan = InstallPlan::parse(PLAN, PathBuf::new()).unwrap();

        assert_eq!(plan.name, "plan-tests");
        assert!(plan.indeterminate);
        assert_eq!(plan.endpoints.arm_url, "http://localhost:9999");
        assert_eq!(plan.endpoints.luis_url, Endpoints::default().luis_url);
        let kinds: Vec<&str> = plan.operations.iter().map(OperationSpec::kind).collect();
        assert_eq!(kinds, vec!["resource_group", "arm_deployment", "cds_database", "pause"]);
        assert_eq!(
            plan.operations[2],
            OperationSpec::CdsDatabase {
                name: None,
                environment_id: "env-1".to_string(),
                language: "1033".to_string(),
                currency: "USD".to_string(),
            }
        );
        assert_eq!(plan.operations[1].display_name(), "Deploy bot");
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let err = InstallPlan::parse("[[operations]]\nkind = \"reboot\"\n", PathBuf::new()).unwrap_err();
        assert!(err.to_string().contains("reboot"));
    }

    #[test]
    fn test_id_placeholder_is_stable() {
        let plan = InstallPlan::parse(PLAN, PathBuf::new()).unwrap();
        let first = plan.expand("contoso-{id}");
        let second = plan.expand("contoso-{id}-db");

        assert_eq!(first.len(), "contoso-".len() + DEFAULT_ID_LENGTH);
        assert_eq!(second, format!("{first}-db"));
        assert_eq!(plan.expand("no placeholder"), "no placeholder");
    }

    #[test]
    fn test_build_reads_template_relative_to_plan() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("template.json"), r#"{"resources": []}"#).unwrap();
        let plan_path = dir.path().join("plan.toml");
        std::fs::write(&plan_path, PLAN).unwrap();

        let plan = InstallPlan::load(&plan_path).unwrap();
        let ops = plan.build(&session()).unwrap();

        assert_eq!(ops.len(), 4);
        assert_eq!(ops[0].name(), format!("Create resource group contoso-{}", plan.short_id()));
        assert!(ops[0].has_compensation());
        assert_eq!(ops[3].name(), "Pause 5ms");
    }

    #[test]
    fn test_build_reports_missing_template() {
        let plan = InstallPlan::parse(PLAN, PathBuf::from("/nonexistent-callsheet-dir")).unwrap();
        let err = plan.build(&session()).unwrap_err();
        assert!(matches!(err, PlanError::Read { ref path, .. } if path.ends_with("template.json")));
    }

    #[test]
    fn test_empty_plan_is_an_error() {
        let plan = InstallPlan::parse("name = \"empty\"\n", PathBuf::new()).unwrap();
        assert!(matches!(plan.build(&session()), Err(PlanError::Empty(name)) if name == "empty"));
    }

    #[tokio::test]
    async fn test_token_source_prefers_plan_tokens() {
        let plan = InstallPlan::parse(PLAN, PathBuf::new()).unwrap();
        let source = plan.token_source(Some("fallback"));

        assert_eq!(source.acquire("https://management.azure.com/").await.unwrap().value, "arm-token");
        assert_eq!(source.acquire("https://cognitiveservices.azure.com/").await.unwrap().value, "fallback");
    }

    #[tokio::test]
    async fn test_pause_runs_and_is_cancellable() {
        let mut runner = OperationRunner::new();
        runner.enqueue(pause("short".to_string(), 1));
        assert!(runner.run_operations().await.unwrap().is_completed());

        let mut runner = OperationRunner::new();
        runner.enqueue(pause("long".to_string(), 60_000));
        let handle = runner.begin_operations();
        handle.cancel();
        let (_, outcome) = handle.wait().await.unwrap();
        assert!(!outcome.is_completed());
    }
}
