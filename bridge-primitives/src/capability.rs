//! Capability descriptors exposed by embedded tools.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

const MAX_NAME_LEN: usize = 96;

/// A named operation a tool instance exposes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "CapabilityFields")]
pub struct Capability {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(default)]
    parameters: Value,
    #[serde(default, rename = "async")]
    is_async: bool,
}

impl Capability {
    /// Starts building a capability descriptor.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> CapabilityBuilder {
        CapabilityBuilder {
            name: name.into(),
            description: None,
            parameters: Value::Null,
            is_async: false,
        }
    }

    /// Capability name used on the wire.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Optional capability description.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Declared parameter schema.
    #[must_use]
    pub fn parameters(&self) -> &Value {
        &self.parameters
    }

    /// Returns `true` when the capability may legitimately run longer than a
    /// synchronous call.
    #[must_use]
    pub const fn is_async(&self) -> bool {
        self.is_async
    }
}

/// Builder for [`Capability`].
#[derive(Debug)]
pub struct CapabilityBuilder {
    name: String,
    description: Option<String>,
    parameters: Value,
    is_async: bool,
}

impl CapabilityBuilder {
    /// Sets an optional description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Sets the parameter schema.
    #[must_use]
    pub fn parameters(mut self, schema: Value) -> Self {
        self.parameters = schema;
        self
    }

    /// Marks the capability as asynchronous.
    #[must_use]
    pub fn asynchronous(mut self, is_async: bool) -> Self {
        self.is_async = is_async;
        self
    }

    /// Finalises the capability descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCapability`] if the name is empty or too long, or
    /// if the parameter schema is neither null nor a JSON object.
    pub fn build(self) -> Result<Capability> {
        if self.name.trim().is_empty() {
            return Err(Error::capability("name cannot be empty"));
        }
        if self.name.len() > MAX_NAME_LEN {
            return Err(Error::capability(format!(
                "name length must be <= {MAX_NAME_LEN}"
            )));
        }
        if !matches!(self.parameters, Value::Null | Value::Object(_)) {
            return Err(Error::capability("parameter schema must be a JSON object"));
        }

        Ok(Capability {
            name: self.name,
            description: self.description,
            parameters: self.parameters,
            is_async: self.is_async,
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CapabilityFields {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Value,
    #[serde(default, rename = "async")]
    is_async: bool,
}

impl TryFrom<CapabilityFields> for Capability {
    type Error = Error;

    fn try_from(fields: CapabilityFields) -> Result<Self> {
        CapabilityBuilder {
            name: fields.name,
            description: fields.description,
            parameters: fields.parameters,
            is_async: fields.is_async,
        }
        .build()
    }
}
