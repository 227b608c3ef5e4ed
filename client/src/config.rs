//! Tunnel configuration
//!
//! Validates the untyped configuration object into a [`TunnelConfig`] and
//! loads optional `porthole.yml` files. All defaulting happens here, before
//! any network code runs.

use anyhow::{Context, Result};
use porthole_shared::ValidationError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::path::Path;

/// Broker used when the configuration names none
pub fn default_domain() -> String {
    "tunnel.porthole.dev".to_string()
}

fn default_secure() -> bool {
    true
}

/// Validated, immutable tunnel configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    token: String,
    secure: bool,
    domain: String,
    subdomain: Option<String>,
    port: u16,
}

impl TunnelConfig {
    /// Validate and normalize an untyped configuration object.
    ///
    /// `null` fields count as absent. Unknown fields are ignored.
    pub fn from_value(value: &Value) -> std::result::Result<Self, ValidationError> {
        let fields = value.as_object().ok_or(ValidationError::NotAnObject)?;

        let token = match field(fields, "token") {
            None => return Err(ValidationError::Missing("token")),
            Some(v) => v.as_str().ok_or(ValidationError::WrongType {
                field: "token",
                expected: "a string",
            })?,
        };
        if token.is_empty() {
            return Err(ValidationError::Invalid {
                field: "token",
                reason: "must not be empty".to_string(),
            });
        }

        let secure = match field(fields, "secure") {
            None => default_secure(),
            Some(v) => v.as_bool().ok_or(ValidationError::WrongType {
                field: "secure",
                expected: "a boolean",
            })?,
        };

        let domain = match field(fields, "domain") {
            None => default_domain(),
            Some(v) => v
                .as_str()
                .ok_or(ValidationError::WrongType {
                    field: "domain",
                    expected: "a string",
                })?
                .to_string(),
        };
        if domain.is_empty() {
            return Err(ValidationError::Invalid {
                field: "domain",
                reason: "must not be empty".to_string(),
            });
        }

        let subdomain = match field(fields, "subdomain") {
            None => None,
            Some(v) => Some(v.as_str().ok_or(ValidationError::WrongType {
                field: "subdomain",
                expected: "a string",
            })?),
        }
        .filter(|s| !s.is_empty())
        .map(str::to_string);

        let port = match field(fields, "port") {
            None => return Err(ValidationError::Missing("port")),
            Some(Value::Number(n)) => integer(n).ok_or(ValidationError::WrongType {
                field: "port",
                expected: "an integer",
            })?,
            Some(_) => {
                return Err(ValidationError::WrongType {
                    field: "port",
                    expected: "an integer",
                })
            }
        };
        let port = u16::try_from(port)
            .ok()
            .filter(|p| *p > 0)
            .ok_or_else(|| ValidationError::Invalid {
                field: "port",
                reason: format!("{} is not a valid port (1-65535)", port),
            })?;

        Ok(Self {
            token: token.to_string(),
            secure,
            domain,
            subdomain,
            port,
        })
    }

    pub fn from_raw(raw: &RawTunnelConfig) -> std::result::Result<Self, ValidationError> {
        Self::from_value(&raw.to_value())
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn secure(&self) -> bool {
        self.secure
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn subdomain(&self) -> Option<&str> {
        self.subdomain.as_deref()
    }

    /// Port of the local service
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn scheme(&self) -> &'static str {
        if self.secure {
            "wss"
        } else {
            "ws"
        }
    }

    /// Broker URL: `{ws|wss}://{domain}?port=..&token=..[&subdomain=..]`
    pub fn connect_url(&self) -> String {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        query.append_pair("port", &self.port.to_string());
        query.append_pair("token", &self.token);
        if let Some(subdomain) = &self.subdomain {
            query.append_pair("subdomain", subdomain);
        }
        format!("{}://{}?{}", self.scheme(), self.domain, query.finish())
    }
}

fn field<'a>(fields: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    fields.get(name).filter(|v| !v.is_null())
}

/// Integer value of a JSON number; `8080.0` counts, `8080.5` does not
fn integer(n: &Number) -> Option<i64> {
    if let Some(i) = n.as_i64() {
        return Some(i);
    }
    if n.is_u64() {
        return Some(i64::MAX);
    }
    n.as_f64()
        .filter(|f| f.is_finite() && f.fract() == 0.0)
        .map(|f| f as i64)
}

/// Unvalidated configuration as found in a config file or on the command line
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawTunnelConfig {
    /// Broker authentication token
    pub token: Option<String>,

    /// Use `wss://` (default: true)
    pub secure: Option<bool>,

    /// Broker hostname
    pub domain: Option<String>,

    /// Requested public subdomain
    pub subdomain: Option<String>,

    /// Local port to expose
    pub port: Option<i64>,
}

impl RawTunnelConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: RawTunnelConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Search for config file in standard locations
    pub fn find_config() -> Option<std::path::PathBuf> {
        let candidates = [
            "porthole.yml",
            "porthole.yaml",
            ".porthole.yml",
            ".porthole.yaml",
        ];

        for name in &candidates {
            let path = std::path::PathBuf::from(name);
            if path.exists() {
                return Some(path);
            }
        }

        if let Some(home) = dirs::home_dir() {
            for name in &candidates {
                let path = home.join(name);
                if path.exists() {
                    return Some(path);
                }
            }
        }

        None
    }

    /// Fields set in `overrides` win over the ones in `self`
    pub fn merge(self, overrides: RawTunnelConfig) -> RawTunnelConfig {
        RawTunnelConfig {
            token: overrides.token.or(self.token),
            secure: overrides.secure.or(self.secure),
            domain: overrides.domain.or(self.domain),
            subdomain: overrides.subdomain.or(self.subdomain),
            port: overrides.port.or(self.port),
        }
    }

    /// Untyped object accepted by [`TunnelConfig::from_value`]
    pub fn to_value(&self) -> Value {
        let mut fields = Map::new();
        if let Some(token) = &self.token {
            fields.insert("token".into(), Value::from(token.as_str()));
        }
        if let Some(secure) = self.secure {
            fields.insert("secure".into(), Value::from(secure));
        }
        if let Some(domain) = &self.domain {
            fields.insert("domain".into(), Value::from(domain.as_str()));
        }
        if let Some(subdomain) = &self.subdomain {
            fields.insert("subdomain".into(), Value::from(subdomain.as_str()));
        }
        if let Some(port) = self.port {
            fields.insert("port".into(), Value::from(port));
        }
        Value::Object(fields)
    }
}
