//! Resource ids: `sqlserver://host:port/<segments>`.
//!
//! Segments are object names as they appear in SQL Server, not
//! percent-encoded. A name containing `/` therefore cannot round-trip
//! through import.

use std::fmt;

use crate::config::ServerConfig;
use crate::error::ProviderError;

const SCHEME: &str = "sqlserver://";

/// Expected shape of one id segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    /// An object name.
    Name,
    /// A fixed marker such as `permissions`.
    Literal(&'static str),
}

/// A decoded resource id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceId {
    /// Server host name.
    pub host: String,
    /// Server TCP port.
    pub port: u16,
    /// Path segments after `host:port`, e.g. database and object name.
    pub segments: Vec<String>,
}

impl ResourceId {
    /// Build the id of an object on `server`.
    pub fn new(server: &ServerConfig, segments: &[&str]) -> Self {
        Self {
            host: server.host.clone(),
            port: server.port,
            segments: segments.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Decode an id without checking the segment layout.
    pub fn parse(id: &str) -> Result<Self, ProviderError> {
        let invalid = |reason: &str| ProviderError::InvalidId(format!("'{}': {}", id, reason));

        let rest = id
            .strip_prefix(SCHEME)
            .ok_or_else(|| invalid("expected sqlserver://host:port/..."))?;
        let (authority, path) = rest
            .split_once('/')
            .ok_or_else(|| invalid("missing object path"))?;
        let (host, port) = authority
            .rsplit_once(':')
            .ok_or_else(|| invalid("missing port"))?;
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port: u16 = port.parse().map_err(|_| invalid("invalid port"))?;

        let segments: Vec<String> = path.split('/').map(str::to_string).collect();
        if segments.iter().any(String::is_empty) {
            return Err(invalid("empty path segment"));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            segments,
        })
    }

    /// Decode an id and check that its path matches `shape`.
    pub fn parse_as(id: &str, shape: &[Segment]) -> Result<Self, ProviderError> {
        let parsed = Self::parse(id)?;
        let expected = shape
            .iter()
            .map(|s| match s {
                Segment::Name => "<name>",
                Segment::Literal(lit) => lit,
            })
            .collect::<Vec<_>>()
            .join("/");

        let matches = parsed.segments.len() == shape.len()
            && parsed.segments.iter().zip(shape).all(|(seg, s)| match s {
                Segment::Name => true,
                Segment::Literal(lit) => seg == lit,
            });
        if !matches {
            return Err(ProviderError::InvalidId(format!(
                "'{}': expected sqlserver://host:port/{}",
                id, expected
            )));
        }
        Ok(parsed)
    }

    /// The segment at `index`, or empty when absent.
    pub fn segment(&self, index: usize) -> &str {
        self.segments.get(index).map(String::as_str).unwrap_or_default()
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}:{}/{}",
            SCHEME,
            self.host,
            self.port,
            self.segments.join("/")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Auth;

    fn server() -> ServerConfig {
        ServerConfig {
            host: "db.example.com".to_string(),
            port: 1433,
            auth: Auth::SqlLogin {
                username: "sa".to_string(),
                password: "pw".to_string(),
            },
        }
    }

    #[test]
    fn test_display() {
        let id = ResourceId::new(&server(), &["appdb", "app_user"]);
        assert_eq!(id.to_string(), "sqlserver://db.example.com:1433/appdb/app_user");
    }

    #[test]
    fn test_parse_database_object() {
        let id = ResourceId::parse_as(
            "sqlserver://db.example.com:1433/appdb/app_user",
            &[Segment::Name, Segment::Name],
        )
        .unwrap();
        assert_eq!(id.host, "db.example.com");
        assert_eq!(id.port, 1433);
        assert_eq!(id.segment(0), "appdb");
        assert_eq!(id.segment(1), "app_user");
        assert_eq!(id.segment(2), "");
    }

    #[test]
    fn test_parse_literal_suffix() {
        let shape = [Segment::Name, Segment::Name, Segment::Literal("permissions")];
        assert!(ResourceId::parse_as("sqlserver://db:1433/appdb/app/permissions", &shape).is_ok());

        let err = ResourceId::parse_as("sqlserver://db:1433/appdb/app/grants", &shape).unwrap_err();
        assert!(err
            .message()
            .contains("sqlserver://host:port/<name>/<name>/permissions"));
    }

    #[test]
    fn test_parse_rejects_malformed_ids() {
        for id in [
            "mssql://db:1433/app",
            "sqlserver://db:1433",
            "sqlserver://db/app",
            "sqlserver://db:port/app",
            "sqlserver://db:99999/app",
            "sqlserver://:1433/app",
            "sqlserver://db:1433/appdb//x",
        ] {
            let err = ResourceId::parse(id).unwrap_err();
            assert!(matches!(err, ProviderError::InvalidId(_)), "{}", id);
        }
    }

    #[test]
    fn test_parse_wrong_segment_count() {
        let err = ResourceId::parse_as("sqlserver://db:1433/appdb/app", &[Segment::Name])
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidId(_)));
    }

    #[test]
    fn test_round_trip_through_display() {
        let id = ResourceId::new(&server(), &["master", "masterkey"]);
        let parsed =
            ResourceId::parse_as(&id.to_string(), &[Segment::Name, Segment::Literal("masterkey")])
                .unwrap();
        assert_eq!(parsed, id);
    }
}
