//! Tracked remote steps.
//!
//! A [`TrackedRequest`] sends one request to a provisioning API, waits for the
//! long-running operation it starts, and stores the poll outcome as the
//! operation result. Its validator only lets the run continue on `"succeeded"`.

use crate::poll::{
    InitialResponse, PollOutcome, PollPolicy, StatusSchema, Tracking, poll_to_completion,
};
use crate::session::{HttpReply, ProvisioningSession, SessionPollSource};
use async_trait::async_trait;
use callsheet_abstraction::{OperationContext, OperationError, OperationStep, STATUS_SUCCESS};
use reqwest::Method;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

/// How to find out whether the target already exists before creating it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExistenceCheck {
    /// `HEAD` the URL; a 2xx reply means it exists, a 404 that it does not.
    Head(String),
    /// `GET` the URL; it exists when the JSON pointer resolves to a non-null value.
    BodyField {
        /// URL to read.
        url: String,
        /// JSON pointer into the reply body.
        pointer: String,
    },
}

impl ExistenceCheck {
    fn url(&self) -> &str {
        match self {
            Self::Head(url) | Self::BodyField { url, .. } => url,
        }
    }

    fn method(&self) -> Method {
        match self {
            Self::Head(_) => Method::HEAD,
            Self::BodyField { .. } => Method::GET,
        }
    }

    /// Only a 404 means absent; any other non-success reply is an error.
    fn exists(&self, reply: HttpReply) -> crate::Result<Option<HttpReply>> {
        if reply.status == STATUS_NOT_FOUND {
            return Ok(None);
        }
        let reply = reply.error_for_status()?;
        let found = match self {
            Self::Head(_) => true,
            Self::BodyField { pointer, .. } => reply.body.pointer(pointer).is_some_and(|v| !v.is_null()),
        };
        Ok(found.then_some(reply))
    }
}

const STATUS_CREATED: u16 = 201;
const STATUS_NOT_FOUND: u16 = 404;

/// A remote request whose completion is observed by polling.
#[derive(Debug)]
pub struct TrackedRequest {
    session: Arc<ProvisioningSession>,
    audience: String,
    method: Method,
    url: String,
    body: Option<Value>,
    existence: Option<ExistenceCheck>,
    exists_statuses: Vec<u16>,
    poll_url: Option<String>,
    schema: StatusSchema,
    policy: PollPolicy,
    undo_url: Option<String>,
    publish_as: Option<String>,
    created: AtomicBool,
}

impl TrackedRequest {
    /// Creates a request against `url` with the ARM defaults.
    #[must_use]
    pub fn new(
        session: Arc<ProvisioningSession>,
        audience: impl Into<String>,
        method: Method,
        url: impl Into<String>,
    ) -> Self {
        Self {
            session,
            audience: audience.into(),
            method,
            url: url.into(),
            body: None,
            existence: None,
            exists_statuses: Vec::new(),
            poll_url: None,
            schema: StatusSchema::ArmBody,
            policy: PollPolicy::ARM,
            undo_url: None,
            publish_as: None,
            created: AtomicBool::new(false),
        }
    }

    /// Creates (or confirms) a resource group.
    ///
    /// Skips the `PUT` when the group already exists. If a later operation
    /// halts the run, a group created here is deleted again.
    #[must_use]
    pub fn ensure_resource_group(
        session: Arc<ProvisioningSession>,
        subscription_id: &str,
        name: &str,
        location: &str,
    ) -> Self {
        let url = resource_group_url(&session, subscription_id, name);
        let audience = session.endpoints().arm_audience.clone();
        Self::new(session, audience, Method::PUT, url.clone())
            .with_body(json!({ "location": location }))
            .with_existence_check(ExistenceCheck::Head(url.clone()))
            .with_undo(url)
    }

    /// Starts an incremental ARM template deployment and waits for it.
    #[must_use]
    pub fn arm_deployment(
        session: Arc<ProvisioningSession>,
        subscription_id: &str,
        resource_group: &str,
        deployment_name: &str,
        template: Value,
        parameters: Value,
    ) -> Self {
        let endpoints = session.endpoints();
        let url = format!(
            "{}/subscriptions/{subscription_id}/resourcegroups/{resource_group}/providers/Microsoft.Resources/deployments/{deployment_name}?api-version={}",
            endpoints.arm_url, endpoints.arm_api_version
        );
        let audience = endpoints.arm_audience.clone();
        Self::new(session, audience, Method::PUT, url)
            .with_body(json!({
                "properties": {
                    "mode": "Incremental",
                    "template": template,
                    "parameters": parameters,
                }
            }))
    }

    /// Deletes a resource group and waits until it is gone.
    #[must_use]
    pub fn resource_group_deletion(
        session: Arc<ProvisioningSession>,
        subscription_id: &str,
        name: &str,
    ) -> Self {
        let url = resource_group_url(&session, subscription_id, name);
        let audience = session.endpoints().arm_audience.clone();
        Self::new(session, audience, Method::DELETE, url)
            .with_exists_statuses([404])
            .with_schema(StatusSchema::HttpStatus)
    }

    /// Provisions the CDS database of a PowerApps environment.
    ///
    /// Skips provisioning when the environment already has linked metadata.
    #[must_use]
    pub fn cds_database(
        session: Arc<ProvisioningSession>,
        environment_id: &str,
        language: &str,
        currency: &str,
    ) -> Self {
        let endpoints = session.endpoints();
        let base = format!("{}/providers/Microsoft.BusinessAppPlatform", endpoints.powerapps_url);
        let version = &endpoints.powerapps_api_version;
        let check = ExistenceCheck::BodyField {
            url: format!(
                "{base}/scopes/admin/environments/{environment_id}?api-version={version}&$expand=properties.linkedEnvironmentMetadata"
            ),
            pointer: "/properties/linkedEnvironmentMetadata".to_string(),
        };
        let url = format!("{base}/environments/{environment_id}/provisionInstance?api-version={version}");
        let audience = endpoints.powerapps_audience.clone();
        Self::new(session, audience, Method::POST, url)
            .with_body(json!({
                "baseLanguage": language,
                "currency": { "code": currency },
            }))
            .with_existence_check(check)
            .with_exists_statuses([409])
            .with_policy(PollPolicy::CDS)
    }

    /// Queues LUIS training for an app version and waits for every model.
    #[must_use]
    pub fn luis_training(session: Arc<ProvisioningSession>, app_id: &str, version: &str) -> Self {
        let endpoints = session.endpoints();
        let url = format!(
            "{}/luis/authoring/v3.0-preview/apps/{app_id}/versions/{version}/train",
            endpoints.luis_url
        );
        let audience = endpoints.luis_audience.clone();
        Self::new(session, audience, Method::POST, url.clone())
            .with_poll_url(url)
            .with_schema(StatusSchema::LuisTraining)
            .with_policy(PollPolicy::LUIS)
    }

    /// Sets the JSON request body.
    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Checks for an existing target before sending the request.
    #[must_use]
    pub fn with_existence_check(mut self, check: ExistenceCheck) -> Self {
        self.existence = Some(check);
        self
    }

    /// Statuses of the initial reply that mean there is nothing to do.
    #[must_use]
    pub fn with_exists_statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.exists_statuses = statuses.into_iter().collect();
        self
    }

    /// Polls this URL instead of the one the reply's headers name.
    #[must_use]
    pub fn with_poll_url(mut self, url: impl Into<String>) -> Self {
        self.poll_url = Some(url.into());
        self
    }

    /// Sets how poll replies are classified.
    #[must_use]
    pub fn with_schema(mut self, schema: StatusSchema) -> Self {
        self.schema = schema;
        self
    }

    /// Overrides the poll interval and timeout.
    #[must_use]
    pub fn with_policy(mut self, policy: PollPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Deletes `url` as compensation when this request created the target
    /// (the initial reply was `201 Created`).
    #[must_use]
    pub fn with_undo(mut self, url: impl Into<String>) -> Self {
        self.undo_url = Some(url.into());
        self
    }

    /// Drops the compensation.
    #[must_use]
    pub fn without_undo(mut self) -> Self {
        self.undo_url = None;
        self
    }

    /// Stores the result in the run context under `key` for later operations.
    #[must_use]
    pub fn publish_as(mut self, key: impl Into<String>) -> Self {
        self.publish_as = Some(key.into());
        self
    }

    /// The request URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The poll policy in effect.
    pub fn policy(&self) -> PollPolicy {
        self.policy
    }

    async fn already_exists(&self, ctx: &OperationContext) -> crate::Result<Option<HttpReply>> {
        let Some(check) = &self.existence else {
            return Ok(None);
        };
        let reply = self.session.send(&self.audience, check.method(), check.url(), None).await?;
        let existing = check.exists(reply)?;
        if existing.is_some() {
            ctx.log().info(format!("Found existing target at {}", check.url()));
        }
        Ok(existing)
    }

    async fn start(&self, ctx: &OperationContext) -> crate::Result<InitialResponse> {
        if let Some(reply) = self.already_exists(ctx).await? {
            return Ok(InitialResponse { tracking: Tracking::AlreadyExists, reading: reply.reading() });
        }

        let reply = self.session.send(&self.audience, self.method.clone(), &self.url, self.body.as_ref()).await?;
        let reply = if self.exists_statuses.contains(&reply.status) {
            reply
        } else {
            reply.error_for_status()?
        };

        // ARM answers 200 when the target already existed and was updated.
        if reply.status == STATUS_CREATED {
            self.created.store(true, Ordering::SeqCst);
        }
        let mut initial = InitialResponse::from_reply(reply.reading(), &reply.headers, &self.exists_statuses);
        if let Some(poll_url) = &self.poll_url
            && !initial.tracking.is_settled()
        {
            initial.tracking = Tracking::Location(poll_url.clone());
        }
        Ok(initial)
    }
}

fn resource_group_url(session: &ProvisioningSession, subscription_id: &str, name: &str) -> String {
    let endpoints = session.endpoints();
    format!(
        "{}/subscriptions/{subscription_id}/resourcegroups/{name}?api-version={}",
        endpoints.arm_url, endpoints.arm_api_version
    )
}

#[async_trait]
impl OperationStep for TrackedRequest {
    async fn execute(&self, ctx: &mut OperationContext) -> callsheet_abstraction::Result<Value> {
        ctx.log().info(format!("{} {}", self.method, self.url));
        let initial = self.start(ctx).await?;

        let source = SessionPollSource::new(self.session.clone(), self.audience.clone());
        let outcome = poll_to_completion(&source, &initial, self.schema, self.policy, ctx).await?;
        info!(url = %self.url, outcome = outcome.label(), "Tracked request finished");

        if let PollOutcome::Cancelled(_) = outcome {
            return Err(OperationError::Cancelled);
        }
        let result = outcome.to_json();
        if let Some(key) = &self.publish_as {
            ctx.set_var(key.clone(), result.clone());
        }
        Ok(result)
    }

    fn validate(&self, ctx: &OperationContext) -> bool {
        ctx.last_status_code == STATUS_SUCCESS
            && ctx
                .last_result
                .as_ref()
                .and_then(|r| r.get("outcome"))
                .and_then(Value::as_str)
                == Some("succeeded")
    }

    fn has_compensation(&self) -> bool {
        self.undo_url.is_some()
    }

    async fn compensate(&self, ctx: &mut OperationContext) -> callsheet_abstraction::Result<()> {
        let Some(url) = &self.undo_url else {
            return Ok(());
        };
        if !self.created.load(Ordering::SeqCst) {
            ctx.log().info(format!("Leaving {url} in place: it existed before this run"));
            return Ok(());
        }

        ctx.log().info(format!("DELETE {url}"));
        let undo = Self::new(self.session.clone(), self.audience.clone(), Method::DELETE, url.clone())
            .with_exists_statuses([404])
            .with_schema(StatusSchema::HttpStatus)
            .with_policy(self.policy);
        let initial = undo.start(ctx).await?;
        let source = SessionPollSource::new(self.session.clone(), self.audience.clone());
        let outcome = poll_to_completion(&source, &initial, undo.schema, undo.policy, ctx).await?;
        if outcome.is_success() {
            self.created.store(false, Ordering::SeqCst);
            Ok(())
        } else {
            warn!(url = %url, outcome = outcome.label(), "Compensation did not complete");
            Err(OperationError::Other(format!("Undo of {url} ended as {}", outcome.label())))
        }
    }
}
