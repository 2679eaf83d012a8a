//! Tool descriptors supplied by the external catalog.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Capability, Error, ToolId};

const DEFAULT_SANDBOX_PERMISSIONS: &[&str] = &["allow-scripts", "allow-forms"];

/// Permission set the isolated execution context is created with.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SandboxPolicy {
    permissions: BTreeSet<String>,
}

impl SandboxPolicy {
    /// Creates a policy granting exactly the supplied permissions.
    #[must_use]
    pub fn new<I, S>(permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            permissions: permissions
                .into_iter()
                .map(Into::into)
                .filter(|p: &String| !p.trim().is_empty())
                .collect(),
        }
    }

    /// Returns `true` when the permission is granted.
    #[must_use]
    pub fn allows(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }

    /// Iterates over the granted permissions in sorted order.
    pub fn permissions(&self) -> impl Iterator<Item = &str> {
        self.permissions.iter().map(String::as_str)
    }
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_SANDBOX_PERMISSIONS.iter().copied())
    }
}

/// Per-tool configuration blob forwarded to the embedded tool on initialise.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolConfig {
    #[serde(default)]
    sandbox: SandboxPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    load_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    settings: serde_json::Map<String, serde_json::Value>,
}

impl ToolConfig {
    /// Sandbox permissions for the execution context.
    #[must_use]
    pub fn sandbox(&self) -> &SandboxPolicy {
        &self.sandbox
    }

    /// Overrides the manager's default load timeout for this tool.
    #[must_use]
    pub fn load_timeout(&self) -> Option<Duration> {
        self.load_timeout_ms.map(Duration::from_millis)
    }

    /// Overrides the channel's default request timeout for this tool.
    #[must_use]
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    /// Free-form tool settings passed through to the tool.
    #[must_use]
    pub fn settings(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.settings
    }

    /// Sets the sandbox policy.
    #[must_use]
    pub fn with_sandbox(mut self, sandbox: SandboxPolicy) -> Self {
        self.sandbox = sandbox;
        self
    }

    /// Sets the load timeout override.
    #[must_use]
    pub fn with_load_timeout(mut self, timeout: Duration) -> Self {
        self.load_timeout_ms = Some(duration_millis(timeout));
        self
    }

    /// Sets the request timeout override.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = Some(duration_millis(timeout));
        self
    }

    /// Adds a free-form setting.
    #[must_use]
    pub fn with_setting(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.settings.insert(key.into(), value);
        self
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Immutable description of an embeddable capability provider.
///
/// Deserialisation goes through [`ToolDescriptorBuilder`], so a decoded
/// descriptor satisfies the same checks as a built one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "DescriptorFields")]
pub struct ToolDescriptor {
    id: ToolId,
    name: String,
    version: String,
    source: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    capabilities: Vec<Capability>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    input_formats: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    output_formats: Vec<String>,
    #[serde(default)]
    config: ToolConfig,
}

impl ToolDescriptor {
    /// Starts building a [`ToolDescriptor`].
    #[must_use]
    pub fn builder(id: ToolId) -> ToolDescriptorBuilder {
        ToolDescriptorBuilder {
            id,
            name: None,
            version: None,
            source: None,
            capabilities: Vec::new(),
            input_formats: Vec::new(),
            output_formats: Vec::new(),
            config: ToolConfig::default(),
        }
    }

    /// Returns the tool identifier.
    #[must_use]
    pub fn id(&self) -> &ToolId {
        &self.id
    }

    /// Returns the display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the tool version.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Location the execution context loads the tool from.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Returns the declared capabilities.
    #[must_use]
    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    /// Looks up a declared capability by name.
    #[must_use]
    pub fn capability(&self, name: &str) -> Option<&Capability> {
        self.capabilities.iter().find(|cap| cap.name() == name)
    }

    /// Formats the tool accepts.
    #[must_use]
    pub fn input_formats(&self) -> &[String] {
        &self.input_formats
    }

    /// Formats the tool produces.
    #[must_use]
    pub fn output_formats(&self) -> &[String] {
        &self.output_formats
    }

    /// Returns the configuration blob.
    #[must_use]
    pub fn config(&self) -> &ToolConfig {
        &self.config
    }
}

/// Wire shape of [`ToolDescriptor`] before validation.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescriptorFields {
    id: ToolId,
    name: String,
    version: String,
    source: String,
    #[serde(default)]
    capabilities: Vec<Capability>,
    #[serde(default)]
    input_formats: Vec<String>,
    #[serde(default)]
    output_formats: Vec<String>,
    #[serde(default)]
    config: ToolConfig,
}

impl TryFrom<DescriptorFields> for ToolDescriptor {
    type Error = Error;

    fn try_from(fields: DescriptorFields) -> crate::Result<Self> {
        ToolDescriptor::builder(fields.id)
            .name(fields.name)?
            .version(fields.version)?
            .source(fields.source)
            .capabilities(fields.capabilities)
            .input_formats(fields.input_formats)
            .output_formats(fields.output_formats)
            .config(fields.config)
            .build()
    }
}

/// Builder for [`ToolDescriptor`].
#[derive(Debug)]
pub struct ToolDescriptorBuilder {
    id: ToolId,
    name: Option<String>,
    version: Option<String>,
    source: Option<String>,
    capabilities: Vec<Capability>,
    input_formats: Vec<String>,
    output_formats: Vec<String>,
    config: ToolConfig,
}

impl ToolDescriptorBuilder {
    /// Sets the display name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDescriptor`] when the name is empty.
    pub fn name(mut self, name: impl Into<String>) -> crate::Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::descriptor("tool name cannot be empty"));
        }
        self.name = Some(name);
        Ok(self)
    }

    /// Sets the version string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDescriptor`] when the version is empty.
    pub fn version(mut self, version: impl Into<String>) -> crate::Result<Self> {
        let version = version.into();
        if version.trim().is_empty() {
            return Err(Error::descriptor("tool version cannot be empty"));
        }
        self.version = Some(version);
        Ok(self)
    }

    /// Sets the load location of the tool.
    #[must_use]
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Adds a capability.
    #[must_use]
    pub fn capability(mut self, capability: Capability) -> Self {
        self.capabilities.push(capability);
        self
    }

    /// Replaces the capability set.
    #[must_use]
    pub fn capabilities(mut self, capabilities: Vec<Capability>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Sets the accepted input formats.
    #[must_use]
    pub fn input_formats<I, S>(mut self, formats: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_formats = formats.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the produced output formats.
    #[must_use]
    pub fn output_formats<I, S>(mut self, formats: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_formats = formats.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the configuration blob.
    #[must_use]
    pub fn config(mut self, config: ToolConfig) -> Self {
        self.config = config;
        self
    }

    /// Consumes the builder and returns the descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDescriptor`] if mandatory fields are missing or
    /// two capabilities share a name.
    pub fn build(self) -> crate::Result<ToolDescriptor> {
        let name = self
            .name
            .ok_or_else(|| Error::descriptor("tool name must be provided"))?;
        let version = self
            .version
            .ok_or_else(|| Error::descriptor("tool version must be provided"))?;
        let source = self
            .source
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| Error::descriptor("tool source must be provided"))?;

        let mut seen = BTreeSet::new();
        for capability in &self.capabilities {
            if !seen.insert(capability.name()) {
                return Err(Error::descriptor(format!(
                    "duplicate capability `{}`",
                    capability.name()
                )));
            }
        }

        Ok(ToolDescriptor {
            id: self.id,
            name,
            version,
            source,
            capabilities: self.capabilities,
            input_formats: self.input_formats,
            output_formats: self.output_formats,
            config: self.config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capability(name: &str) -> Capability {
        Capability::builder(name).build().expect("capability")
    }

    #[test]
    fn builds_descriptor() {
        let descriptor = ToolDescriptor::builder(ToolId::new("image-editor").unwrap())
            .name("Image Editor")
            .unwrap()
            .version("2.1.0")
            .unwrap()
            .source("https://tools.example/image-editor")
            .capability(capability("resize"))
            .input_formats(["png", "jpeg"])
            .output_formats(["png"])
            .config(ToolConfig::default().with_load_timeout(Duration::from_secs(5)))
            .build()
            .unwrap();

        assert_eq!(descriptor.name(), "Image Editor");
        assert!(descriptor.capability("resize").is_some());
        assert!(descriptor.capability("crop").is_none());
        assert_eq!(descriptor.input_formats(), ["png", "jpeg"]);
        assert_eq!(
            descriptor.config().load_timeout(),
            Some(Duration::from_secs(5))
        );
        assert!(descriptor.config().sandbox().allows("allow-scripts"));
    }

    #[test]
    fn duplicate_capabilities_rejected() {
        let result = ToolDescriptor::builder(ToolId::new("dup").unwrap())
            .name("Dup")
            .unwrap()
            .version("1.0")
            .unwrap()
            .source("https://tools.example/dup")
            .capabilities(vec![capability("a"), capability("a")])
            .build();
        assert!(matches!(result, Err(Error::InvalidDescriptor { .. })));
    }

    #[test]
    fn decoding_applies_builder_checks() {
        let decoded: ToolDescriptor = serde_json::from_value(serde_json::json!({
            "id": "viewer",
            "name": "Viewer",
            "version": "1.0.0",
            "source": "https://tools.example/viewer",
            "capabilities": [{"name": "open"}]
        }))
        .unwrap();
        assert_eq!(decoded.capability("open").map(Capability::name), Some("open"));
        assert_eq!(
            serde_json::from_value::<ToolDescriptor>(serde_json::to_value(&decoded).unwrap())
                .unwrap(),
            decoded
        );

        for (field, value) in [("name", " "), ("version", ""), ("source", "  ")] {
            let mut raw = serde_json::to_value(&decoded).unwrap();
            raw[field] = serde_json::json!(value);
            let err = serde_json::from_value::<ToolDescriptor>(raw).unwrap_err();
            assert!(err.to_string().contains(field), "{field}: {err}");
        }

        let duplicated = serde_json::json!({
            "id": "viewer",
            "name": "Viewer",
            "version": "1.0.0",
            "source": "https://tools.example/viewer",
            "capabilities": [{"name": "open"}, {"name": "open"}]
        });
        assert!(serde_json::from_value::<ToolDescriptor>(duplicated).is_err());
    }

    #[test]
    fn source_is_required() {
        let result = ToolDescriptor::builder(ToolId::new("nosrc").unwrap())
            .name("No source")
            .unwrap()
            .version("1.0")
            .unwrap()
            .build();
        assert!(result.is_err());
    }
}
