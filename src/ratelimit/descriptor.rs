//! Per-request input to the limiter.

use crate::error::{QuotaGateError, Result};

/// Client identity used when a request does not carry one. All such requests
/// share a single bucket.
pub const ANONYMOUS_CLIENT: &str = "anonymous";

/// The parts of an incoming request the limiter decides on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestDescriptor {
    /// HTTP method as sent by the client
    pub method: String,
    /// Request path, without the query string
    pub path: String,
    /// The dimension counters are partitioned by, e.g. the client IP
    pub client_identity: Option<String>,
}

impl RequestDescriptor {
    pub fn new(method: &str, path: &str, client_identity: Option<&str>) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            client_identity: client_identity.map(str::to_string),
        }
    }

    /// Report which fields are missing.
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.method.trim().is_empty() {
            missing.push("method");
        }
        if self.path.trim().is_empty() {
            missing.push("path");
        }
        if self.client().is_none() {
            missing.push("client identity");
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(QuotaGateError::InvalidDescriptor(format!(
                "missing {}",
                missing.join(", ")
            )))
        }
    }

    /// Fill in missing fields so the request can still be decided.
    ///
    /// A blank client identity joins the anonymous bucket and a blank path
    /// becomes `/`. A blank method is left blank, so only wildcard-method
    /// rules can match it.
    pub fn normalized(&self) -> Self {
        let path = match self.path.trim() {
            "" => "/".to_string(),
            path => path.to_string(),
        };
        Self {
            method: self.method.trim().to_string(),
            path,
            client_identity: Some(self.client().unwrap_or(ANONYMOUS_CLIENT).to_string()),
        }
    }

    /// The client identity, if present and not blank.
    pub fn client(&self) -> Option<&str> {
        self.client_identity
            .as_deref()
            .map(str::trim)
            .filter(|client| !client.is_empty())
    }
}

impl std::fmt::Display for RequestDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} from {}",
            self.method,
            self.path,
            self.client().unwrap_or(ANONYMOUS_CLIENT)
        )
    }
}
