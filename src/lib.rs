//! SQL Server provider plugin
//!
//! Manages SQL Server and Azure SQL principals and permissions as
//! declarative resources: logins, users, roles, schemas, database scoped
//! credentials, database master keys and database permissions.
//!
//! # Overview
//!
//! - **Protocol**: gRPC service and handshake in [`server`], protobuf types
//!   in [`generated`]
//! - **Schema**: attribute/block schemas, validation and planning
//!   ([`schema`], [`validation`], [`plan`])
//! - **Connector**: pooled `tiberius` connections with SQL or Azure AD
//!   authentication ([`connector`], [`config`])
//! - **SQL**: bound statements and server-side dynamic DDL ([`sql`])
//! - **Resources**: one CRUD mapping per object type ([`resources`])
//! - **Provider**: [`MssqlProvider`] ties them together
//!
//! # Handshake Protocol
//!
//! The host starts the plugin with `TF_PLUGIN_MAGIC_COOKIE` set and reads a
//! single line from stdout:
//!
//! ```text
//! 1|1|tcp|127.0.0.1:50051|grpc
//! ```
//!
//! Format: `<core version>|<protocol version>|tcp|<address>|grpc`
//!
//! # Resource ids
//!
//! Every managed object has an id of the form
//! `sqlserver://host:port/<database>/<name>`, which is also the import id:
//!
//! ```text
//! sqlserver://sql.example.com:1433/app_login
//! sqlserver://sql.example.com:1433/appdb/app_user
//! sqlserver://sql.example.com:1433/appdb/app_user/permissions
//! sqlserver://sql.example.com:1433/appdb/masterkey
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connector;
pub mod error;
pub mod logging;
pub mod plan;
pub mod provider;
pub mod resource_id;
pub mod resources;
pub mod schema;
pub mod server;
pub mod sql;
pub mod testing;
pub mod types;
pub mod validation;

#[allow(missing_docs)]
#[allow(clippy::all)]
pub mod generated;

pub use config::{Auth, ProviderSettings, ServerConfig};
pub use connector::{Connector, ConnectorFactory, Database, TiberiusConnectorFactory};
pub use error::ProviderError;
pub use logging::{init_logging, init_logging_with_default, try_init_logging};
pub use provider::MssqlProvider;
pub use resource_id::ResourceId;
pub use schema::ProviderSchema;
pub use server::{serve, serve_with_options, ProviderService, ServeOptions};
pub use types::{
    AttributeChange, Handshake, ImportedResource, PlanResult, ProviderMetadata,
    ServerCapabilities, PROTOCOL_VERSION,
};
pub use validation::validate;

pub use async_trait::async_trait;
pub use serde_json;
