//! gRPC plumbing between the host and a [`ProviderService`].
//!
//! The host spawns the plugin with a magic cookie in the environment, reads
//! a single handshake line from stdout and then talks gRPC to the advertised
//! address until it sends `Stop` or terminates the process.
//!
//! # Signal Handling
//!
//! SIGTERM and SIGINT trigger a graceful shutdown: new connections are
//! refused, in-flight requests get [`ServeOptions::shutdown_timeout`] to
//! finish, then the provider's `stop()` runs.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tonic::transport::Server;
use tracing::{debug, error, info, instrument, warn};

use crate::error::ProviderError;
use crate::generated as pb;
use crate::schema::{has_errors, Block, Diagnostic, DiagnosticSeverity, ProviderSchema, Schema};
use crate::types::{
    Handshake, ImportedResource, PlanResult, ProviderMetadata, MAGIC_COOKIE_KEY,
    MAGIC_COOKIE_VALUE,
};

/// Operations a provider implements, in terms of JSON values rather than
/// protobuf messages.
///
/// A `read` that finds the object gone returns `serde_json::Value::Null`.
#[async_trait::async_trait]
pub trait ProviderService: Send + Sync + 'static {
    /// Return the provider configuration schema and every resource schema.
    fn schema(&self) -> ProviderSchema;

    /// Return provider metadata. Derived from the schema by default.
    fn metadata(&self) -> ProviderMetadata {
        ProviderMetadata {
            resources: self.schema().resources.keys().cloned().collect(),
            capabilities: Default::default(),
        }
    }

    /// Validate the provider configuration before configuring.
    async fn validate_provider_config(
        &self,
        config: serde_json::Value,
    ) -> Result<Vec<Diagnostic>, ProviderError> {
        let _ = config;
        Ok(vec![])
    }

    /// Apply the provider configuration.
    async fn configure(&self, config: serde_json::Value) -> Result<Vec<Diagnostic>, ProviderError>;

    /// Release pooled connections and other resources.
    async fn stop(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    /// Validate a resource's configuration before planning.
    async fn validate_resource_config(
        &self,
        resource_type: &str,
        config: serde_json::Value,
    ) -> Result<Vec<Diagnostic>, ProviderError> {
        let _ = (resource_type, config);
        Ok(vec![])
    }

    /// Upgrade resource state written by an older schema version.
    async fn upgrade_resource_state(
        &self,
        resource_type: &str,
        version: i64,
        state: serde_json::Value,
    ) -> Result<serde_json::Value, ProviderError> {
        let _ = (resource_type, version);
        Ok(state)
    }

    /// Plan changes for a resource. A null `proposed_state` plans a destroy.
    async fn plan(
        &self,
        resource_type: &str,
        prior_state: Option<serde_json::Value>,
        proposed_state: serde_json::Value,
        config: serde_json::Value,
    ) -> Result<PlanResult, ProviderError>;

    /// Create a resource from its planned state.
    async fn create(
        &self,
        resource_type: &str,
        planned_state: serde_json::Value,
    ) -> Result<serde_json::Value, ProviderError>;

    /// Refresh a resource from the server.
    async fn read(
        &self,
        resource_type: &str,
        current_state: serde_json::Value,
    ) -> Result<serde_json::Value, ProviderError>;

    /// Update a resource in place.
    async fn update(
        &self,
        resource_type: &str,
        prior_state: serde_json::Value,
        planned_state: serde_json::Value,
    ) -> Result<serde_json::Value, ProviderError>;

    /// Delete a resource.
    async fn delete(
        &self,
        resource_type: &str,
        current_state: serde_json::Value,
    ) -> Result<(), ProviderError>;

    /// Import an existing object by resource id.
    async fn import_resource(
        &self,
        resource_type: &str,
        _id: &str,
    ) -> Result<Vec<ImportedResource>, ProviderError> {
        Err(ProviderError::Validation(format!(
            "Import not supported for resource type: {}",
            resource_type
        )))
    }
}

fn decode(bytes: &[u8]) -> serde_json::Value {
    if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(bytes).unwrap_or(serde_json::Value::Null)
    }
}

fn encode(value: &serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(value).unwrap_or_default()
}

fn diagnostics_to_proto(diagnostics: Vec<Diagnostic>) -> Vec<pb::Diagnostic> {
    diagnostics
        .into_iter()
        .map(|d| pb::Diagnostic {
            severity: match d.severity {
                DiagnosticSeverity::Error => pb::diagnostic::Severity::Error as i32,
                DiagnosticSeverity::Warning => pb::diagnostic::Severity::Warning as i32,
            },
            summary: d.summary,
            detail: d.detail.unwrap_or_default(),
            attribute: d.attribute.unwrap_or_default(),
        })
        .collect()
}

fn error_to_diagnostics(err: ProviderError) -> Vec<pb::Diagnostic> {
    vec![pb::Diagnostic {
        severity: pb::diagnostic::Severity::Error as i32,
        summary: err.to_string(),
        detail: String::new(),
        attribute: String::new(),
    }]
}

/// Flatten a diagnostics-or-error result, logging the outcome under `rpc`.
fn diagnostics_response(
    rpc: &str,
    result: Result<Vec<Diagnostic>, ProviderError>,
) -> Vec<pb::Diagnostic> {
    match result {
        Ok(diagnostics) => {
            if has_errors(&diagnostics) {
                warn!(
                    rpc,
                    diagnostics = diagnostics.len(),
                    "completed with errors"
                );
            } else {
                debug!(rpc, "completed successfully");
            }
            diagnostics_to_proto(diagnostics)
        }
        Err(e) => {
            error!(rpc, error = %e, "failed");
            error_to_diagnostics(e)
        }
    }
}

fn schema_to_proto(schema: &Schema) -> pb::Schema {
    pb::Schema {
        version: schema.version as i64,
        block: Some(block_to_proto(&schema.block)),
    }
}

fn block_to_proto(block: &Block) -> pb::Block {
    pb::Block {
        attributes: block
            .attributes
            .iter()
            .map(|(name, attr)| pb::Attribute {
                name: name.clone(),
                r#type: serde_json::to_vec(&attr.attr_type).unwrap_or_default(),
                required: attr.flags.required,
                optional: attr.flags.optional,
                computed: attr.flags.computed,
                sensitive: attr.flags.sensitive,
                description: attr.description.clone().unwrap_or_default(),
                force_new: attr.force_new,
                default_value: attr.default.as_ref().map(encode).unwrap_or_default(),
                conflicts_with: attr.conflicts_with.clone(),
            })
            .collect(),
        block_types: block
            .blocks
            .iter()
            .map(|(name, nested)| pb::NestedBlock {
                type_name: name.clone(),
                block: Some(block_to_proto(&nested.block)),
                nesting_mode: pb::nested_block::NestingMode::Single as i32,
                min_items: nested.min_items as i32,
                max_items: nested.max_items as i32,
            })
            .collect(),
        description: block.description.clone().unwrap_or_default(),
        at_most_one_of: block.at_most_one_of.clone(),
    }
}

/// Adapter from the generated gRPC trait to a [`ProviderService`].
struct ProviderGrpcService<P: ProviderService> {
    provider: Arc<P>,
}

#[tonic::async_trait]
impl<P: ProviderService> pb::provider_server::Provider for ProviderGrpcService<P> {
    #[instrument(skip(self, _request), name = "grpc.get_metadata")]
    async fn get_metadata(
        &self,
        _request: tonic::Request<pb::GetMetadataRequest>,
    ) -> Result<tonic::Response<pb::GetMetadataResponse>, tonic::Status> {
        let metadata = self.provider.metadata();
        debug!(resources = metadata.resources.len(), "GetMetadata completed");
        Ok(tonic::Response::new(pb::GetMetadataResponse {
            server_capabilities: Some(pb::ServerCapabilities {
                plan_destroy: metadata.capabilities.plan_destroy,
            }),
            resources: metadata.resources,
            diagnostics: vec![],
        }))
    }

    #[instrument(skip(self, _request), name = "grpc.get_schema")]
    async fn get_schema(
        &self,
        _request: tonic::Request<pb::GetSchemaRequest>,
    ) -> Result<tonic::Response<pb::GetSchemaResponse>, tonic::Status> {
        let schema = self.provider.schema();
        debug!(resources = schema.resources.len(), "GetSchema completed");
        Ok(tonic::Response::new(pb::GetSchemaResponse {
            provider: Some(schema_to_proto(&schema.provider)),
            resources: schema
                .resources
                .iter()
                .map(|(k, v)| (k.clone(), schema_to_proto(v)))
                .collect(),
            diagnostics: vec![],
        }))
    }

    #[instrument(skip(self, request), name = "grpc.validate_provider_config")]
    async fn validate_provider_config(
        &self,
        request: tonic::Request<pb::ValidateProviderConfigRequest>,
    ) -> Result<tonic::Response<pb::ValidateProviderConfigResponse>, tonic::Status> {
        let config = decode(&request.into_inner().config);
        let result = self.provider.validate_provider_config(config).await;
        Ok(tonic::Response::new(pb::ValidateProviderConfigResponse {
            diagnostics: diagnostics_response("ValidateProviderConfig", result),
        }))
    }

    #[instrument(skip(self, request), name = "grpc.configure")]
    async fn configure(
        &self,
        request: tonic::Request<pb::ConfigureRequest>,
    ) -> Result<tonic::Response<pb::ConfigureResponse>, tonic::Status> {
        let config = decode(&request.into_inner().config);
        let result = self.provider.configure(config).await;
        if matches!(&result, Ok(d) if !has_errors(d)) {
            info!("provider configured");
        }
        Ok(tonic::Response::new(pb::ConfigureResponse {
            diagnostics: diagnostics_response("Configure", result),
        }))
    }

    #[instrument(skip(self, _request), name = "grpc.stop")]
    async fn stop(
        &self,
        _request: tonic::Request<pb::StopRequest>,
    ) -> Result<tonic::Response<pb::StopResponse>, tonic::Status> {
        info!("Stop called");
        let error = match self.provider.stop().await {
            Ok(()) => String::new(),
            Err(e) => {
                error!(error = %e, "Stop failed");
                e.to_string()
            }
        };
        Ok(tonic::Response::new(pb::StopResponse { error }))
    }

    #[instrument(skip(self, request), fields(resource_type = %request.get_ref().resource_type), name = "grpc.validate_resource_config")]
    async fn validate_resource_config(
        &self,
        request: tonic::Request<pb::ValidateResourceConfigRequest>,
    ) -> Result<tonic::Response<pb::ValidateResourceConfigResponse>, tonic::Status> {
        let req = request.into_inner();
        let result = self
            .provider
            .validate_resource_config(&req.resource_type, decode(&req.config))
            .await;
        Ok(tonic::Response::new(pb::ValidateResourceConfigResponse {
            diagnostics: diagnostics_response("ValidateResourceConfig", result),
        }))
    }

    #[instrument(skip(self, request), fields(resource_type = %request.get_ref().resource_type), name = "grpc.upgrade_resource_state")]
    async fn upgrade_resource_state(
        &self,
        request: tonic::Request<pb::UpgradeResourceStateRequest>,
    ) -> Result<tonic::Response<pb::UpgradeResourceStateResponse>, tonic::Status> {
        let req = request.into_inner();
        debug!(version = req.version, "UpgradeResourceState called");
        match self
            .provider
            .upgrade_resource_state(&req.resource_type, req.version, decode(&req.raw_state))
            .await
        {
            Ok(upgraded) => Ok(tonic::Response::new(pb::UpgradeResourceStateResponse {
                upgraded_state: encode(&upgraded),
                diagnostics: vec![],
            })),
            Err(e) => {
                error!(version = req.version, error = %e, "UpgradeResourceState failed");
                Ok(tonic::Response::new(pb::UpgradeResourceStateResponse {
                    upgraded_state: vec![],
                    diagnostics: error_to_diagnostics(e),
                }))
            }
        }
    }

    #[instrument(skip(self, request), fields(resource_type = %request.get_ref().resource_type), name = "grpc.plan")]
    async fn plan(
        &self,
        request: tonic::Request<pb::PlanRequest>,
    ) -> Result<tonic::Response<pb::PlanResponse>, tonic::Status> {
        let req = request.into_inner();
        let prior_state = match decode(&req.prior_state) {
            serde_json::Value::Null => None,
            state => Some(state),
        };
        debug!(is_create = prior_state.is_none(), "Plan called");

        match self
            .provider
            .plan(
                &req.resource_type,
                prior_state,
                decode(&req.proposed_state),
                decode(&req.config),
            )
            .await
        {
            Ok(result) => {
                info!(
                    changes = result.changes.len(),
                    requires_replace = result.requires_replace,
                    "Plan completed"
                );
                Ok(tonic::Response::new(pb::PlanResponse {
                    planned_state: encode(&result.planned_state),
                    changes: result.changes.into_iter().map(Into::into).collect(),
                    requires_replace: result.requires_replace,
                    diagnostics: vec![],
                }))
            }
            Err(e) => {
                error!(error = %e, "Plan failed");
                Ok(tonic::Response::new(pb::PlanResponse {
                    planned_state: vec![],
                    changes: vec![],
                    requires_replace: false,
                    diagnostics: error_to_diagnostics(e),
                }))
            }
        }
    }

    #[instrument(skip(self, request), fields(resource_type = %request.get_ref().resource_type), name = "grpc.create")]
    async fn create(
        &self,
        request: tonic::Request<pb::CreateRequest>,
    ) -> Result<tonic::Response<pb::CreateResponse>, tonic::Status> {
        let req = request.into_inner();
        match self
            .provider
            .create(&req.resource_type, decode(&req.planned_state))
            .await
        {
            Ok(state) => {
                info!(id = %state["id"], "Create completed");
                Ok(tonic::Response::new(pb::CreateResponse {
                    state: encode(&state),
                    diagnostics: vec![],
                }))
            }
            Err(e) => {
                error!(error = %e, "Create failed");
                Ok(tonic::Response::new(pb::CreateResponse {
                    state: vec![],
                    diagnostics: error_to_diagnostics(e),
                }))
            }
        }
    }

    #[instrument(skip(self, request), fields(resource_type = %request.get_ref().resource_type), name = "grpc.read")]
    async fn read(
        &self,
        request: tonic::Request<pb::ReadRequest>,
    ) -> Result<tonic::Response<pb::ReadResponse>, tonic::Status> {
        let req = request.into_inner();
        match self
            .provider
            .read(&req.resource_type, decode(&req.current_state))
            .await
        {
            Ok(state) => {
                if state.is_null() {
                    warn!("object no longer exists, removing from state");
                }
                Ok(tonic::Response::new(pb::ReadResponse {
                    state: encode(&state),
                    diagnostics: vec![],
                }))
            }
            Err(e) => {
                error!(error = %e, "Read failed");
                Ok(tonic::Response::new(pb::ReadResponse {
                    state: vec![],
                    diagnostics: error_to_diagnostics(e),
                }))
            }
        }
    }

    #[instrument(skip(self, request), fields(resource_type = %request.get_ref().resource_type), name = "grpc.update")]
    async fn update(
        &self,
        request: tonic::Request<pb::UpdateRequest>,
    ) -> Result<tonic::Response<pb::UpdateResponse>, tonic::Status> {
        let req = request.into_inner();
        match self
            .provider
            .update(
                &req.resource_type,
                decode(&req.prior_state),
                decode(&req.planned_state),
            )
            .await
        {
            Ok(state) => {
                info!(id = %state["id"], "Update completed");
                Ok(tonic::Response::new(pb::UpdateResponse {
                    state: encode(&state),
                    diagnostics: vec![],
                }))
            }
            Err(e) => {
                error!(error = %e, "Update failed");
                Ok(tonic::Response::new(pb::UpdateResponse {
                    state: vec![],
                    diagnostics: error_to_diagnostics(e),
                }))
            }
        }
    }

    #[instrument(skip(self, request), fields(resource_type = %request.get_ref().resource_type), name = "grpc.delete")]
    async fn delete(
        &self,
        request: tonic::Request<pb::DeleteRequest>,
    ) -> Result<tonic::Response<pb::DeleteResponse>, tonic::Status> {
        let req = request.into_inner();
        let diagnostics = match self
            .provider
            .delete(&req.resource_type, decode(&req.current_state))
            .await
        {
            Ok(()) => {
                info!("Delete completed");
                vec![]
            }
            Err(e) => {
                error!(error = %e, "Delete failed");
                error_to_diagnostics(e)
            }
        };
        Ok(tonic::Response::new(pb::DeleteResponse { diagnostics }))
    }

    #[instrument(skip(self, request), fields(resource_type = %request.get_ref().resource_type, id = %request.get_ref().id), name = "grpc.import_resource_state")]
    async fn import_resource_state(
        &self,
        request: tonic::Request<pb::ImportResourceStateRequest>,
    ) -> Result<tonic::Response<pb::ImportResourceStateResponse>, tonic::Status> {
        let req = request.into_inner();
        match self
            .provider
            .import_resource(&req.resource_type, &req.id)
            .await
        {
            Ok(imported) => {
                info!(imported = imported.len(), "ImportResourceState completed");
                Ok(tonic::Response::new(pb::ImportResourceStateResponse {
                    imported: imported
                        .into_iter()
                        .map(|r| pb::ImportedResource {
                            resource_type: r.resource_type,
                            state: encode(&r.state),
                        })
                        .collect(),
                    diagnostics: vec![],
                }))
            }
            Err(e) => {
                error!(error = %e, "ImportResourceState failed");
                Ok(tonic::Response::new(pb::ImportResourceStateResponse {
                    imported: vec![],
                    diagnostics: error_to_diagnostics(e),
                }))
            }
        }
    }
}

/// Options for configuring the provider server.
#[derive(Debug, Clone)]
pub struct ServeOptions {
    /// How long in-flight requests may run after a shutdown signal.
    /// Default: 30 seconds.
    pub shutdown_timeout: Duration,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl ServeOptions {
    /// Create new serve options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Check the magic cookie value the host passed in the environment.
pub fn magic_cookie_matches(value: Option<&str>) -> bool {
    value == Some(MAGIC_COOKIE_VALUE)
}

/// Wait for a shutdown signal (SIGTERM or SIGINT; CTRL+C on Windows).
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
            _ = sigint.recv() => info!("Received SIGINT, initiating graceful shutdown"),
        }
    }

    #[cfg(windows)]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C handler");
        info!("Received CTRL+C, initiating graceful shutdown");
    }

    #[cfg(not(any(unix, windows)))]
    {
        std::future::pending::<()>().await;
    }
}

/// Serve a provider as a plugin of the host.
///
/// Exits the process with status 1 when the magic cookie is missing, which
/// is what happens when the binary is started by hand. Otherwise binds an
/// ephemeral port on 127.0.0.1, prints the handshake line and serves until
/// a shutdown signal.
pub async fn serve<P: ProviderService>(provider: P) -> Result<(), Box<dyn std::error::Error>> {
    serve_with_options(provider, ServeOptions::default()).await
}

/// Serve a provider with custom options. See [`serve`].
pub async fn serve_with_options<P: ProviderService>(
    provider: P,
    options: ServeOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    let cookie = std::env::var(MAGIC_COOKIE_KEY).ok();
    if !magic_cookie_matches(cookie.as_deref()) {
        eprintln!(
            "This binary is a plugin. These are not meant to be executed directly.\n\
             Please execute the program that consumes these plugins, which will\n\
             load any plugins automatically"
        );
        std::process::exit(1);
    }

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    serve_on_listener(provider, listener, options).await
}

async fn serve_on_listener<P: ProviderService>(
    provider: P,
    listener: TcpListener,
    options: ServeOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr = listener.local_addr()?;
    println!("{}", Handshake::new(addr));

    info!(address = %addr, "Provider server starting");

    let provider = Arc::new(provider);
    let provider_for_shutdown = Arc::clone(&provider);

    let (signalled_tx, signalled_rx) = tokio::sync::oneshot::channel::<()>();
    let shutdown = async move {
        wait_for_shutdown_signal().await;
        let _ = signalled_tx.send(());
    };

    let server = pb::provider_server::ProviderServer::new(ProviderGrpcService { provider });
    let server_future = Server::builder().add_service(server).serve_with_incoming_shutdown(
        tokio_stream::wrappers::TcpListenerStream::new(listener),
        shutdown,
    );
    tokio::pin!(server_future);

    // The timeout only starts once a shutdown signal has arrived.
    let result = tokio::select! {
        result = &mut server_future => Some(result),
        _ = signalled_rx => {
            tokio::time::timeout(options.shutdown_timeout, &mut server_future).await.ok()
        }
    };

    match result {
        Some(Ok(())) => info!("Server shutdown complete"),
        Some(Err(e)) => {
            error!(error = %e, "Server error during shutdown");
            return Err(e.into());
        }
        None => warn!(
            timeout = ?options.shutdown_timeout,
            "Shutdown timeout exceeded, forcing shutdown"
        ),
    }

    debug!("Calling provider stop()");
    if let Err(e) = provider_for_shutdown.stop().await {
        warn!(error = %e, "Provider stop() returned error");
    }

    info!("Provider shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generated::provider_server::Provider;
    use crate::schema::{Attribute, NestedBlock};
    use serde_json::json;

    struct EchoProvider;

    #[async_trait::async_trait]
    impl ProviderService for EchoProvider {
        fn schema(&self) -> ProviderSchema {
            ProviderSchema::new().with_resource(
                "mssql_echo",
                Schema::v0()
                    .with_attribute(
                        "name",
                        Attribute::required_string().with_conflicts(&["other"]),
                    )
                    .with_block(
                        "server",
                        NestedBlock::single(Block::new().with_at_most_one_of(&["a", "b"]))
                            .required(),
                    ),
            )
        }

        async fn configure(
            &self,
            _config: serde_json::Value,
        ) -> Result<Vec<Diagnostic>, ProviderError> {
            Ok(vec![Diagnostic::warning("configured")])
        }

        async fn plan(
            &self,
            _resource_type: &str,
            _prior_state: Option<serde_json::Value>,
            proposed_state: serde_json::Value,
            _config: serde_json::Value,
        ) -> Result<PlanResult, ProviderError> {
            Ok(PlanResult::no_change(proposed_state))
        }

        async fn create(
            &self,
            _resource_type: &str,
            planned_state: serde_json::Value,
        ) -> Result<serde_json::Value, ProviderError> {
            Ok(planned_state)
        }

        async fn read(
            &self,
            _resource_type: &str,
            _current_state: serde_json::Value,
        ) -> Result<serde_json::Value, ProviderError> {
            Ok(serde_json::Value::Null)
        }

        async fn update(
            &self,
            _resource_type: &str,
            _prior_state: serde_json::Value,
            planned_state: serde_json::Value,
        ) -> Result<serde_json::Value, ProviderError> {
            Ok(planned_state)
        }

        async fn delete(
            &self,
            _resource_type: &str,
            _current_state: serde_json::Value,
        ) -> Result<(), ProviderError> {
            Err(ProviderError::PermissionDenied("cannot drop".to_string()))
        }
    }

    fn service() -> ProviderGrpcService<EchoProvider> {
        ProviderGrpcService {
            provider: Arc::new(EchoProvider),
        }
    }

    #[test]
    fn test_magic_cookie() {
        assert!(magic_cookie_matches(Some(MAGIC_COOKIE_VALUE)));
        assert!(!magic_cookie_matches(Some("nope")));
        assert!(!magic_cookie_matches(None));
    }

    #[test]
    fn test_schema_to_proto_carries_constraints() {
        let schema = EchoProvider.schema();
        let proto = schema_to_proto(&schema.resources["mssql_echo"]);
        let block = proto.block.unwrap();

        assert_eq!(block.attributes[0].conflicts_with, vec!["other"]);
        assert_eq!(block.block_types[0].type_name, "server");
        assert_eq!(block.block_types[0].min_items, 1);
        assert_eq!(
            block.block_types[0].nesting_mode,
            pb::nested_block::NestingMode::Single as i32
        );
        assert_eq!(
            block.block_types[0].block.as_ref().unwrap().at_most_one_of,
            vec!["a", "b"]
        );
    }

    #[tokio::test]
    async fn test_get_metadata_lists_resources() {
        let response = service()
            .get_metadata(tonic::Request::new(pb::GetMetadataRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.resources, vec!["mssql_echo"]);
    }

    #[tokio::test]
    async fn test_configure_returns_diagnostics() {
        let response = service()
            .configure(tonic::Request::new(pb::ConfigureRequest {
                config: b"{}".to_vec(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.diagnostics.len(), 1);
        assert_eq!(
            response.diagnostics[0].severity,
            pb::diagnostic::Severity::Warning as i32
        );
    }

    #[tokio::test]
    async fn test_read_of_missing_object_is_null_state() {
        let response = service()
            .read(tonic::Request::new(pb::ReadRequest {
                resource_type: "mssql_echo".to_string(),
                current_state: encode(&json!({"id": "x"})),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(decode(&response.state), serde_json::Value::Null);
        assert!(response.diagnostics.is_empty());
    }

    #[tokio::test]
    async fn test_errors_become_diagnostics() {
        let response = service()
            .delete(tonic::Request::new(pb::DeleteRequest {
                resource_type: "mssql_echo".to_string(),
                current_state: encode(&json!({})),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.diagnostics.len(), 1);
        assert!(response.diagnostics[0].summary.contains("cannot drop"));
    }

    #[tokio::test]
    async fn test_import_unsupported_by_default() {
        let response = service()
            .import_resource_state(tonic::Request::new(pb::ImportResourceStateRequest {
                resource_type: "mssql_echo".to_string(),
                id: "sqlserver://db:1433/x".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(response.imported.is_empty());
        assert!(response.diagnostics[0].summary.contains("Import not supported"));
    }

    #[test]
    fn test_decode_empty_is_null() {
        assert_eq!(decode(&[]), serde_json::Value::Null);
        assert_eq!(decode(b"{\"a\":1}"), json!({"a": 1}));
    }

    #[test]
    fn test_serve_options() {
        let options = ServeOptions::new().with_shutdown_timeout(Duration::from_secs(5));
        assert_eq!(options.shutdown_timeout, Duration::from_secs(5));
        assert_eq!(ServeOptions::default().shutdown_timeout, Duration::from_secs(30));
    }
}
