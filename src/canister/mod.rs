//! Canister management collaborator.
//!
//! The bridge hands canister deploy and query requests to a
//! `CanisterManager`. `DfxCanisterManager` shells out to the `dfx` CLI;
//! tests substitute their own implementation.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::CanisterError;
use crate::store::keys;

/// Kind of canister operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CanisterRequestKind {
    Deploy,
    Query,
}

impl CanisterRequestKind {
    /// Returns the wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            CanisterRequestKind::Deploy => "deploy",
            CanisterRequestKind::Query => "query",
        }
    }

    /// Returns the request list this kind is read from.
    pub fn queue_key(&self) -> &'static str {
        match self {
            CanisterRequestKind::Deploy => keys::CANISTER_DEPLOY_QUEUE,
            CanisterRequestKind::Query => keys::CANISTER_QUERY_QUEUE,
        }
    }
}

impl std::str::FromStr for CanisterRequestKind {
    type Err = CanisterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "deploy" => Ok(CanisterRequestKind::Deploy),
            "query" => Ok(CanisterRequestKind::Query),
            other => Err(CanisterError::InvalidRequest(format!(
                "unknown request type '{}'",
                other
            ))),
        }
    }
}

/// A validated canister operation request.
#[derive(Debug, Clone, PartialEq)]
pub struct CanisterRequest {
    /// Correlation id echoed in the result.
    pub request_id: String,
    pub kind: CanisterRequestKind,
    pub canister_name: String,
    /// Target network; the manager's default when unset.
    pub network: Option<String>,
    /// Method to call (queries only).
    pub method: Option<String>,
    /// Positional arguments passed to the call.
    pub args: Vec<String>,
}

impl CanisterRequest {
    /// Parses a request popped from a request list.
    ///
    /// Fields may appear at the top level or nested under `data`; top-level
    /// values win. `request_id` and `canister_name` are required, and queries
    /// also require `method`.
    pub fn parse(kind: CanisterRequestKind, raw: &str) -> Result<Self, CanisterError> {
        let value: Value = serde_json::from_str(raw)?;
        let Value::Object(top) = value else {
            return Err(CanisterError::InvalidRequest(
                "request is not a JSON object".to_string(),
            ));
        };
        let nested = top.get("data").and_then(Value::as_object);

        let field = |name: &str| {
            top.get(name)
                .filter(|v| !v.is_null())
                .or_else(|| nested.and_then(|d| d.get(name)).filter(|v| !v.is_null()))
        };
        let string_field = |name: &str| -> Option<String> {
            field(name).map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
        };

        let request_id = string_field("request_id")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| CanisterError::InvalidRequest("missing request_id".to_string()))?;
        let canister_name = string_field("canister_name")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| CanisterError::InvalidRequest("missing canister_name".to_string()))?;
        let method = string_field("method").filter(|s| !s.is_empty());

        if kind == CanisterRequestKind::Query && method.is_none() {
            return Err(CanisterError::InvalidRequest(
                "query request missing method".to_string(),
            ));
        }

        let args = match field("args") {
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect(),
            Some(Value::String(s)) => vec![s.clone()],
            Some(other) => vec![other.to_string()],
            None => Vec::new(),
        };

        Ok(Self {
            request_id,
            kind,
            canister_name,
            network: string_field("network"),
            method,
            args,
        })
    }
}

/// Outcome of a canister operation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CanisterResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canister_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CanisterResult {
    /// A successful result for `request`.
    pub fn succeeded(request: &CanisterRequest, network: &str, output: String) -> Self {
        Self {
            success: true,
            canister_name: Some(request.canister_name.clone()),
            network: Some(network.to_string()),
            method: request.method.clone(),
            output: Some(output),
            error: None,
        }
    }

    /// A failed result for `request`.
    pub fn failed(request: &CanisterRequest, error: impl Into<String>) -> Self {
        Self {
            success: false,
            canister_name: Some(request.canister_name.clone()),
            network: request.network.clone(),
            method: request.method.clone(),
            output: None,
            error: Some(error.into()),
        }
    }

    /// Converts the result into a JSON object.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()))
    }
}

/// Performs canister operations.
#[async_trait]
pub trait CanisterManager: Send + Sync {
    /// Deploys a canister.
    async fn deploy(&self, request: &CanisterRequest) -> CanisterResult;

    /// Calls a canister method.
    async fn query(&self, request: &CanisterRequest) -> CanisterResult;

    /// Dispatches on the request kind.
    async fn execute(&self, request: &CanisterRequest) -> CanisterResult {
        match request.kind {
            CanisterRequestKind::Deploy => self.deploy(request).await,
            CanisterRequestKind::Query => self.query(request).await,
        }
    }
}

/// `CanisterManager` backed by the `dfx` CLI.
#[derive(Debug, Clone)]
pub struct DfxCanisterManager {
    dfx_path: String,
    default_network: String,
    timeout: Duration,
}

impl DfxCanisterManager {
    /// Creates a manager.
    ///
    /// # Arguments
    ///
    /// * `dfx_path` - Path of the `dfx` executable
    /// * `default_network` - Network used when a request names none
    /// * `timeout` - Upper bound for one CLI invocation
    pub fn new(dfx_path: impl Into<String>, default_network: impl Into<String>, timeout: Duration) -> Self {
        Self {
            dfx_path: dfx_path.into(),
            default_network: default_network.into(),
            timeout,
        }
    }

    fn network_for<'a>(&'a self, request: &'a CanisterRequest) -> &'a str {
        request.network.as_deref().unwrap_or(&self.default_network)
    }

    /// Builds the CLI arguments for a request.
    pub fn command_args(&self, request: &CanisterRequest) -> Vec<String> {
        let network = self.network_for(request).to_string();
        match request.kind {
            CanisterRequestKind::Deploy => vec![
                "deploy".to_string(),
                request.canister_name.clone(),
                "--network".to_string(),
                network,
            ],
            CanisterRequestKind::Query => {
                let mut args = vec![
                    "canister".to_string(),
                    "call".to_string(),
                    request.canister_name.clone(),
                    request.method.clone().unwrap_or_default(),
                ];
                args.extend(request.args.iter().cloned());
                args.push("--network".to_string());
                args.push(network);
                args
            }
        }
    }

    async fn run(&self, args: &[String]) -> Result<String, CanisterError> {
        debug!(command = %format!("{} {}", self.dfx_path, args.join(" ")), "Running dfx");

        let mut cmd = Command::new(&self.dfx_path);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| CanisterError::Timeout(self.timeout))??;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(CanisterError::CommandFailed {
                exit_code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    async fn invoke(&self, request: &CanisterRequest) -> CanisterResult {
        let network = self.network_for(request).to_string();
        match self.run(&self.command_args(request)).await {
            Ok(output) => {
                info!(
                    request_id = %request.request_id,
                    canister = %request.canister_name,
                    kind = request.kind.as_str(),
                    "Canister operation succeeded"
                );
                CanisterResult::succeeded(request, &network, output)
            }
            Err(e) => {
                warn!(
                    request_id = %request.request_id,
                    canister = %request.canister_name,
                    kind = request.kind.as_str(),
                    error = %e,
                    "Canister operation failed"
                );
                let mut result = CanisterResult::failed(request, e.to_string());
                result.network = Some(network);
                result
            }
        }
    }
}

#[async_trait]
impl CanisterManager for DfxCanisterManager {
    async fn deploy(&self, request: &CanisterRequest) -> CanisterResult {
        self.invoke(request).await
    }

    async fn query(&self, request: &CanisterRequest) -> CanisterResult {
        self.invoke(request).await
    }
}
