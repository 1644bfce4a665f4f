//! Naming convention for managed containers
//!
//! Every managed container is named `<prefix>_<request_id>`. The reaper relies
//! on the `<prefix>_` namespace to find containers it may touch, so a request
//! id is only accepted when it is safe to embed verbatim in a container name.

use crate::core::LifecycleError;

/// Separator between the prefix and the request id
pub const SEPARATOR: char = '_';

/// Upper bound on request id length, well inside runtime name limits
pub const MAX_REQUEST_ID_LEN: usize = 128;

/// Deterministic request id → container name mapping
#[derive(Debug, Clone)]
pub struct NamingRegistry {
    namespace: String,
}

impl NamingRegistry {
    /// Create a registry for `prefix`.
    ///
    /// The prefix must be name-safe and must not contain the separator,
    /// otherwise one namespace could nest inside another (`sandbox_` would
    /// own every `sandbox_lab_*` container).
    pub fn new(prefix: &str) -> Result<Self, LifecycleError> {
        validate_component(prefix)
            .and_then(|()| {
                if prefix.contains(SEPARATOR) {
                    Err("must not contain the separator")
                } else {
                    Ok(())
                }
            })
            .map_err(|reason| LifecycleError::InvalidRequestId {
                request_id: prefix.to_string(),
                reason,
            })?;
        Ok(Self {
            namespace: format!("{}{}", prefix, SEPARATOR),
        })
    }

    /// `<prefix>_`, the string every managed name starts with
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn prefix(&self) -> &str {
        &self.namespace[..self.namespace.len() - SEPARATOR.len_utf8()]
    }

    /// Container name for a request id
    pub fn name_for(&self, request_id: &str) -> Result<String, LifecycleError> {
        validate_component(request_id).map_err(|reason| LifecycleError::InvalidRequestId {
            request_id: request_id.to_string(),
            reason,
        })?;
        Ok(format!("{}{}", self.namespace, request_id))
    }

    /// Whether `name` lives in this registry's namespace
    pub fn owns(&self, name: &str) -> bool {
        name.len() > self.namespace.len() && name.starts_with(&self.namespace)
    }

    /// Recover the request id from a managed container name
    pub fn request_id_of<'a>(&self, name: &'a str) -> Option<&'a str> {
        if self.owns(name) {
            Some(&name[self.namespace.len()..])
        } else {
            None
        }
    }
}

fn validate_component(value: &str) -> Result<(), &'static str> {
    if value.is_empty() {
        return Err("must not be empty");
    }
    if value.len() > MAX_REQUEST_ID_LEN {
        return Err("is too long");
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err("contains a disallowed character");
    }
    Ok(())
}
