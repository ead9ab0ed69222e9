//! Service contract types

use plexus_core::{capability_set, PluginError, Result, Version};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Service versions follow the plugin version rules
pub type ServiceVersion = Version;

capability_set! {
    /// Behavioural guarantees of a service or one of its methods
    pub struct MethodCapabilities {
        /// Returns its result directly
        const SYNCHRONOUS = 0, "synchronous";
        /// Completes asynchronously
        const ASYNCHRONOUS = 1, "asynchronous";
        /// Produces a stream of results
        const STREAMING = 2, "streaming";
        /// Participates in transactions
        const TRANSACTIONAL = 3, "transactional";
        /// Results may be cached by callers
        const CACHEABLE = 4, "cacheable";
        /// Repeating a call has no additional effect
        const IDEMPOTENT = 5, "idempotent";
        /// Safe to call concurrently
        const THREAD_SAFE = 6, "thread_safe";
        /// Keeps state between calls
        const STATEFUL = 7, "stateful";
        /// Listed in discovery queries
        const DISCOVERABLE = 8, "discoverable";
        /// Versioned independently of the provider
        const VERSIONED = 9, "versioned";
        /// Requires an authenticated caller
        const AUTHENTICATED = 10, "authenticated";
        /// Payloads are encrypted
        const ENCRYPTED = 11, "encrypted";
    }
}

/// Semantic type tag of a parameter
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParameterType {
    /// JSON string
    String,
    /// JSON number
    Number,
    /// JSON boolean
    Boolean,
    /// JSON array
    Array,
    /// JSON object
    Object,
    /// Application-defined tag; any non-null value passes structural checks
    Custom(String),
}

impl ParameterType {
    /// Tag as written in contract documents
    pub fn as_str(&self) -> &str {
        match self {
            ParameterType::String => "string",
            ParameterType::Number => "number",
            ParameterType::Boolean => "boolean",
            ParameterType::Array => "array",
            ParameterType::Object => "object",
            ParameterType::Custom(tag) => tag,
        }
    }

    /// Parse a tag; unknown tags become [`ParameterType::Custom`]
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "string" => ParameterType::String,
            "number" => ParameterType::Number,
            "boolean" => ParameterType::Boolean,
            "array" => ParameterType::Array,
            "object" => ParameterType::Object,
            other => ParameterType::Custom(other.to_string()),
        }
    }

    /// Whether a JSON value has this type
    pub fn matches(&self, value: &serde_json::Value) -> bool {
        use serde_json::Value;
        match self {
            ParameterType::String => value.is_string(),
            ParameterType::Number => value.is_number(),
            ParameterType::Boolean => value.is_boolean(),
            ParameterType::Array => value.is_array(),
            ParameterType::Object => value.is_object(),
            ParameterType::Custom(_) => !matches!(value, Value::Null),
        }
    }
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ParameterType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ParameterType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        Ok(ParameterType::from_tag(&tag))
    }
}

/// A method parameter or return value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceParameter {
    /// Parameter name
    pub name: String,

    /// Semantic type tag
    #[serde(rename = "type")]
    pub param_type: ParameterType,

    /// Description
    #[serde(default)]
    pub description: String,

    /// Whether callers must supply it
    #[serde(default)]
    pub required: bool,

    /// Value used when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<serde_json::Value>,

    /// Regular expression string arguments must match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_pattern: Option<String>,
}

impl ServiceParameter {
    /// A required parameter
    pub fn required(name: impl Into<String>, param_type: ParameterType) -> Self {
        Self {
            name: name.into(),
            param_type,
            description: String::new(),
            required: true,
            default_value: None,
            validation_pattern: None,
        }
    }

    /// An optional parameter
    pub fn optional(name: impl Into<String>, param_type: ParameterType) -> Self {
        Self {
            required: false,
            ..Self::required(name, param_type)
        }
    }

    /// Set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the default value
    pub fn with_default(mut self, value: serde_json::Value) -> Self {
        self.default_value = Some(value);
        self
    }

    /// Set the validation pattern
    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.validation_pattern = Some(pattern.into());
        self
    }
}

fn default_method_timeout() -> Duration {
    Duration::from_secs(30)
}

/// A method exposed by a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceMethod {
    /// Method name
    pub name: String,

    /// Description
    #[serde(default)]
    pub description: String,

    /// Ordered parameters
    #[serde(default)]
    pub parameters: Vec<ServiceParameter>,

    /// Return value declaration
    pub return_type: ServiceParameter,

    /// Behavioural guarantees
    #[serde(default)]
    pub capabilities: MethodCapabilities,

    /// Call timeout
    #[serde(default = "default_method_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl ServiceMethod {
    /// Start building a method
    pub fn builder(name: impl Into<String>) -> ServiceMethodBuilder {
        ServiceMethodBuilder::new(name)
    }

    /// Look a parameter up by name
    pub fn parameter(&self, name: &str) -> Option<&ServiceParameter> {
        self.parameters.iter().find(|p| p.name == name)
    }
}

/// Builder for [`ServiceMethod`]
#[derive(Debug, Clone)]
pub struct ServiceMethodBuilder {
    method: ServiceMethod,
}

impl ServiceMethodBuilder {
    /// New builder returning an untyped object by default
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            method: ServiceMethod {
                name: name.into(),
                description: String::new(),
                parameters: Vec::new(),
                return_type: ServiceParameter::optional("result", ParameterType::Object),
                capabilities: MethodCapabilities::SYNCHRONOUS,
                timeout: default_method_timeout(),
            },
        }
    }

    /// Description
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.method.description = description.into();
        self
    }

    /// Append a parameter
    pub fn parameter(mut self, parameter: ServiceParameter) -> Self {
        self.method.parameters.push(parameter);
        self
    }

    /// Return value
    pub fn returns(mut self, return_type: ServiceParameter) -> Self {
        self.method.return_type = return_type;
        self
    }

    /// Replace the capability set
    pub fn capabilities(mut self, caps: MethodCapabilities) -> Self {
        self.method.capabilities = caps;
        self
    }

    /// Call timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.method.timeout = timeout;
        self
    }

    /// Finish
    pub fn build(self) -> ServiceMethod {
        self.method
    }
}

/// Typed declaration of a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceContract {
    /// Service name, reverse-DNS
    pub service_name: String,

    /// Contract version
    pub version: ServiceVersion,

    /// Description
    #[serde(default)]
    pub description: String,

    /// Plugin providing the service
    #[serde(default)]
    pub provider_id: String,

    /// Service-level guarantees
    #[serde(default)]
    pub capabilities: MethodCapabilities,

    /// Methods by name
    #[serde(default)]
    pub methods: BTreeMap<String, ServiceMethod>,

    /// Services this one needs, by minimum version
    #[serde(default)]
    pub dependencies: BTreeMap<String, ServiceVersion>,
}

impl ServiceContract {
    /// Start building a contract
    pub fn builder(service_name: impl Into<String>, version: ServiceVersion) -> ServiceContractBuilder {
        ServiceContractBuilder::new(service_name, version)
    }

    /// Look a method up by name
    pub fn method(&self, name: &str) -> Option<&ServiceMethod> {
        self.methods.get(name)
    }

    /// Structural validation
    pub fn validate(&self) -> Result<()> {
        validate_service_name(&self.service_name)?;

        if self.methods.is_empty() {
            return Err(PluginError::invalid_argument(format!(
                "Service contract {} declares no methods",
                self.service_name
            )));
        }

        for (key, method) in &self.methods {
            if method.name.is_empty() || key != &method.name {
                return Err(PluginError::invalid_argument(format!(
                    "Service contract {} has a method keyed '{key}' named '{}'",
                    self.service_name, method.name
                )));
            }

            let mut seen = std::collections::HashSet::new();
            for param in &method.parameters {
                if !seen.insert(param.name.as_str()) {
                    return Err(PluginError::invalid_argument(format!(
                        "Method {}.{} declares parameter '{}' twice",
                        self.service_name, method.name, param.name
                    )));
                }
                if let Some(pattern) = &param.validation_pattern {
                    crate::registry::anchored(pattern).map_err(|e| {
                        PluginError::invalid_argument(format!(
                            "Invalid validation pattern for {}.{}({}): {e}",
                            self.service_name, method.name, param.name
                        ))
                    })?;
                }
            }
        }

        for dep in self.dependencies.keys() {
            validate_service_name(dep)?;
            if dep == &self.service_name {
                return Err(PluginError::circular_dependency(&[
                    self.service_name.clone(),
                    self.service_name.clone(),
                ]));
            }
        }

        Ok(())
    }
}

/// Service names are dotted, lowercase, with at least two segments
pub fn validate_service_name(name: &str) -> Result<()> {
    let segments: Vec<&str> = name.split('.').collect();
    let well_formed = segments.len() >= 2
        && segments.iter().all(|s| {
            !s.is_empty()
                && s.chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
        });

    if well_formed {
        Ok(())
    } else {
        Err(PluginError::invalid_argument(format!(
            "Invalid service name '{name}', expected reverse-DNS form such as com.example.service"
        )))
    }
}

/// Builder for [`ServiceContract`]
#[derive(Debug, Clone)]
pub struct ServiceContractBuilder {
    contract: ServiceContract,
}

impl ServiceContractBuilder {
    /// New builder
    pub fn new(service_name: impl Into<String>, version: ServiceVersion) -> Self {
        Self {
            contract: ServiceContract {
                service_name: service_name.into(),
                version,
                description: String::new(),
                provider_id: String::new(),
                capabilities: MethodCapabilities::empty(),
                methods: BTreeMap::new(),
                dependencies: BTreeMap::new(),
            },
        }
    }

    /// Description
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.contract.description = description.into();
        self
    }

    /// Provider plugin id
    pub fn provider(mut self, provider_id: impl Into<String>) -> Self {
        self.contract.provider_id = provider_id.into();
        self
    }

    /// Add service-level capabilities
    pub fn capabilities(mut self, caps: MethodCapabilities) -> Self {
        self.contract.capabilities.insert(caps);
        self
    }

    /// Add a method
    pub fn method(mut self, method: ServiceMethod) -> Self {
        self.contract.methods.insert(method.name.clone(), method);
        self
    }

    /// Add a dependency on another service
    pub fn depends_on(mut self, service_name: impl Into<String>, min_version: ServiceVersion) -> Self {
        self.contract.dependencies.insert(service_name.into(), min_version);
        self
    }

    /// Validate and build
    pub fn build(self) -> Result<ServiceContract> {
        self.contract.validate()?;
        Ok(self.contract)
    }
}

/// A service a plugin consumes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRequirement {
    /// Service name
    pub service_name: String,
    /// Minimum acceptable version
    pub min_version: ServiceVersion,
    /// Whether the plugin can run without it
    #[serde(default)]
    pub optional: bool,
}

impl ServiceRequirement {
    /// A required service
    pub fn required(service_name: impl Into<String>, min_version: ServiceVersion) -> Self {
        Self {
            service_name: service_name.into(),
            min_version,
            optional: false,
        }
    }

    /// An optional service
    pub fn optional(service_name: impl Into<String>, min_version: ServiceVersion) -> Self {
        Self {
            service_name: service_name.into(),
            min_version,
            optional: true,
        }
    }
}
