//! Service contract registry
//!
//! Typed directory of the services plugins provide. Contracts are grouped by
//! service name; within a group every `(major, minor, patch)` triple is unique.
//! Lookups take the read side of a single `RwLock`; registration and removal
//! take the write side and never perform I/O while holding it.

use crate::types::{MethodCapabilities, ServiceContract, ServiceRequirement, ServiceVersion};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use plexus_core::{PluginError, Result};
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A contract together with the plugin that registered it
#[derive(Debug, Clone)]
pub struct RegisteredContract {
    /// Provider plugin id
    pub provider_id: String,
    /// The contract
    pub contract: Arc<ServiceContract>,
    /// Registration time
    pub registered_at: DateTime<Utc>,
}

/// Thread-safe contract directory
#[derive(Debug, Default)]
pub struct ContractRegistry {
    services: RwLock<HashMap<String, Vec<RegisteredContract>>>,
    patterns: DashMap<String, Arc<Regex>>,
}

impl ContractRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a contract on behalf of `provider_id`
    pub fn register(&self, provider_id: &str, contract: ServiceContract) -> Result<()> {
        let entry = Self::prepare(provider_id, contract)?;
        let service_name = entry.contract.service_name.clone();
        let version = entry.contract.version;

        let mut services = self.services.write();
        let duplicate = services
            .get(&service_name)
            .is_some_and(|group| group.iter().any(|e| e.contract.version == version));
        if duplicate {
            return Err(PluginError::already_exists(format!(
                "Service contract {service_name} v{version}"
            ))
            .with_plugin(provider_id));
        }
        let group = services.entry(service_name.clone()).or_default();
        group.push(entry);
        group.sort_by(|a, b| b.contract.version.cmp(&a.contract.version));
        drop(services);

        info!(
            service = %service_name,
            version = %version,
            provider = %provider_id,
            "Service contract registered"
        );
        Ok(())
    }

    fn prepare(provider_id: &str, mut contract: ServiceContract) -> Result<RegisteredContract> {
        contract
            .validate()
            .map_err(|e| e.with_plugin(provider_id))?;
        if contract.provider_id.is_empty() {
            contract.provider_id = provider_id.to_string();
        } else if contract.provider_id != provider_id {
            return Err(PluginError::invalid_argument(format!(
                "Contract {} names provider {} but was registered by {provider_id}",
                contract.service_name, contract.provider_id
            ))
            .with_plugin(provider_id));
        }

        Ok(RegisteredContract {
            provider_id: provider_id.to_string(),
            contract: Arc::new(contract),
            registered_at: Utc::now(),
        })
    }

    /// Remove every version of `service_name` registered by `provider_id`
    pub fn unregister(&self, provider_id: &str, service_name: &str) -> Result<()> {
        let mut services = self.services.write();
        let group = services
            .get_mut(service_name)
            .ok_or_else(|| PluginError::not_found(format!("Service {service_name}")))?;

        let before = group.len();
        group.retain(|e| e.provider_id != provider_id);
        if group.len() == before {
            return Err(PluginError::not_found(format!(
                "Service {service_name} provided by {provider_id}"
            )));
        }
        if group.is_empty() {
            services.remove(service_name);
        }
        drop(services);

        info!(service = %service_name, provider = %provider_id, "Service contract unregistered");
        Ok(())
    }

    /// Remove every contract registered by `provider_id`, returning the
    /// affected service names
    pub fn unregister_provider(&self, provider_id: &str) -> Vec<String> {
        let mut removed = Vec::new();
        let mut services = self.services.write();
        services.retain(|name, group| {
            let before = group.len();
            group.retain(|e| e.provider_id != provider_id);
            if group.len() != before {
                removed.push(name.clone());
            }
            !group.is_empty()
        });
        drop(services);

        if !removed.is_empty() {
            debug!(provider = %provider_id, count = removed.len(), "Provider contracts removed");
        }
        removed.sort();
        removed
    }

    /// Atomically replace everything `provider_id` registered with `contracts`.
    ///
    /// Either all new contracts are installed and all old ones removed, or the
    /// registry is left untouched.
    pub fn replace_provider_contracts(
        &self,
        provider_id: &str,
        contracts: Vec<ServiceContract>,
    ) -> Result<()> {
        let prepared = contracts
            .into_iter()
            .map(|c| Self::prepare(provider_id, c))
            .collect::<Result<Vec<_>>>()?;

        let mut services = self.services.write();
        let mut next = services.clone();
        for group in next.values_mut() {
            group.retain(|e| e.provider_id != provider_id);
        }
        for entry in prepared {
            let group = next.entry(entry.contract.service_name.clone()).or_default();
            if group.iter().any(|e| e.contract.version == entry.contract.version) {
                return Err(PluginError::already_exists(format!(
                    "Service contract {} v{}",
                    entry.contract.service_name, entry.contract.version
                ))
                .with_plugin(provider_id));
            }
            group.push(entry);
            group.sort_by(|a, b| b.contract.version.cmp(&a.contract.version));
        }
        next.retain(|_, group| !group.is_empty());
        *services = next;
        drop(services);

        info!(provider = %provider_id, "Provider contracts replaced");
        Ok(())
    }

    /// Highest registered contract for `service_name` that satisfies `min_version`
    ///
    /// A service nobody provides is an `IncompatibleVersion` like any other
    /// unsatisfied requirement.
    pub fn resolve(&self, service_name: &str, min_version: &ServiceVersion) -> Result<Arc<ServiceContract>> {
        let services = self.services.read();
        let group = services.get(service_name).ok_or_else(|| {
            PluginError::incompatible_version(format!(
                "No provider of {service_name} satisfies v{min_version}"
            ))
            .with_details("available=")
        })?;

        // groups are kept sorted newest first
        group
            .iter()
            .find(|e| e.contract.version.satisfies(min_version))
            .map(|e| Arc::clone(&e.contract))
            .ok_or_else(|| {
                let available: Vec<String> =
                    group.iter().map(|e| e.contract.version.to_string()).collect();
                PluginError::incompatible_version(format!(
                    "No provider of {service_name} satisfies v{min_version}"
                ))
                .with_details(format!("available={}", available.join(",")))
            })
    }

    /// Resolve a consumer-side requirement; optional requirements yield `None`
    pub fn resolve_requirement(&self, requirement: &ServiceRequirement) -> Result<Option<Arc<ServiceContract>>> {
        match self.resolve(&requirement.service_name, &requirement.min_version) {
            Ok(contract) => Ok(Some(contract)),
            Err(_) if requirement.optional => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Exact version lookup
    pub fn get(&self, service_name: &str, version: &ServiceVersion) -> Option<RegisteredContract> {
        self.services
            .read()
            .get(service_name)
            .and_then(|group| group.iter().find(|e| &e.contract.version == version).cloned())
    }

    /// All contracts whose service capabilities contain `caps`
    pub fn find_by_capability(&self, caps: MethodCapabilities) -> Vec<Arc<ServiceContract>> {
        let services = self.services.read();
        let mut found: Vec<Arc<ServiceContract>> = services
            .values()
            .flatten()
            .filter(|e| e.contract.capabilities.contains(caps))
            .map(|e| Arc::clone(&e.contract))
            .collect();
        found.sort_by(|a, b| {
            a.service_name
                .cmp(&b.service_name)
                .then(b.version.cmp(&a.version))
        });
        found
    }

    /// Check that every dependency of `contract` currently resolves
    pub fn validate_dependencies(&self, contract: &ServiceContract) -> Result<()> {
        let missing: Vec<String> = contract
            .dependencies
            .iter()
            .filter(|(name, min)| self.resolve(name, min).is_err())
            .map(|(name, min)| format!("{name}>={min}"))
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(PluginError::dependency_missing(&contract.service_name, missing.join(", ")))
        }
    }

    /// Structural validation of arguments for a call to `service_name.method`
    /// against the newest registered contract
    pub fn validate_method_call(
        &self,
        service_name: &str,
        method: &str,
        arguments: &serde_json::Value,
    ) -> Result<()> {
        let contract = self.latest(service_name)?;
        let decl = contract.method(method).ok_or_else(|| {
            PluginError::command_not_found(format!("{service_name}.{method}"))
        })?;

        let empty = serde_json::Map::new();
        let args = match arguments {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => &empty,
            _ => {
                return Err(PluginError::invalid_parameters(format!(
                    "Arguments for {service_name}.{method} must be an object"
                )))
            }
        };

        for param in &decl.parameters {
            let value = match args.get(&param.name) {
                Some(serde_json::Value::Null) | None => {
                    if param.required && param.default_value.is_none() {
                        return Err(PluginError::invalid_parameters(format!(
                            "Missing required parameter '{}' for {service_name}.{method}",
                            param.name
                        )));
                    }
                    continue;
                }
                Some(v) => v,
            };

            if !param.param_type.matches(value) {
                return Err(PluginError::invalid_parameters(format!(
                    "Parameter '{}' of {service_name}.{method} expects {}",
                    param.name, param.param_type
                )));
            }

            if let (Some(pattern), Some(text)) = (&param.validation_pattern, value.as_str()) {
                let re = self.pattern(pattern)?;
                if !re.is_match(text) {
                    return Err(PluginError::invalid_parameters(format!(
                        "Parameter '{}' of {service_name}.{method} does not match {pattern}",
                        param.name
                    )));
                }
            }
        }

        Ok(())
    }

    fn latest(&self, service_name: &str) -> Result<Arc<ServiceContract>> {
        self.services
            .read()
            .get(service_name)
            .and_then(|group| group.first())
            .map(|e| Arc::clone(&e.contract))
            .ok_or_else(|| PluginError::not_found(format!("Service {service_name}")))
    }

    fn pattern(&self, pattern: &str) -> Result<Arc<Regex>> {
        if let Some(re) = self.patterns.get(pattern) {
            return Ok(Arc::clone(re.value()));
        }
        let re = Arc::new(anchored(pattern).map_err(|e| {
            warn!(pattern = %pattern, error = %e, "Invalid validation pattern");
            PluginError::invalid_argument(format!("Invalid validation pattern {pattern}: {e}"))
        })?);
        self.patterns.insert(pattern.to_string(), Arc::clone(&re));
        Ok(re)
    }

    /// Registered service names, sorted
    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Every registered contract, newest version first within a service
    pub fn list(&self) -> Vec<RegisteredContract> {
        let services = self.services.read();
        let mut names: Vec<&String> = services.keys().collect();
        names.sort();
        names
            .into_iter()
            .flat_map(|n| services[n].iter().cloned())
            .collect()
    }

    /// Plugins providing any version of `service_name`
    pub fn providers(&self, service_name: &str) -> Vec<String> {
        let mut providers: Vec<String> = self
            .services
            .read()
            .get(service_name)
            .map(|group| group.iter().map(|e| e.provider_id.clone()).collect())
            .unwrap_or_default();
        providers.sort();
        providers.dedup();
        providers
    }

    /// Contracts registered by `provider_id`
    pub fn contracts_of(&self, provider_id: &str) -> Vec<Arc<ServiceContract>> {
        let mut found: Vec<Arc<ServiceContract>> = self
            .services
            .read()
            .values()
            .flatten()
            .filter(|e| e.provider_id == provider_id)
            .map(|e| Arc::clone(&e.contract))
            .collect();
        found.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        found
    }

    /// Number of registered contracts across all services
    pub fn len(&self) -> usize {
        self.services.read().values().map(Vec::len).sum()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.services.read().is_empty()
    }

    /// Remove everything
    pub fn clear(&self) {
        self.services.write().clear();
    }
}

/// Compile a validation pattern that must match the whole value
pub(crate) fn anchored(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{pattern})$"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ParameterType, ServiceMethod, ServiceParameter};
    use plexus_core::{ErrorKind, Version};
    use serde_json::json;

    fn contract(name: &str, version: Version) -> ServiceContract {
        ServiceContract::builder(name, version)
            .capabilities(MethodCapabilities::THREAD_SAFE)
            .method(
                ServiceMethod::builder("lookup")
                    .parameter(
                        ServiceParameter::required("key", ParameterType::String)
                            .with_pattern("^[a-z]+$"),
                    )
                    .parameter(ServiceParameter::optional("limit", ParameterType::Number))
                    .build(),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_resolve_by_version() {
        let registry = ContractRegistry::new();
        registry
            .register("com.example.p", contract("com.example.svc", Version::new(1, 2, 0)))
            .unwrap();

        let found = registry
            .resolve("com.example.svc", &Version::new(1, 0, 0))
            .unwrap();
        assert_eq!(found.version, Version::new(1, 2, 0));
        assert_eq!(found.provider_id, "com.example.p");

        let err = registry
            .resolve("com.example.svc", &Version::new(2, 0, 0))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IncompatibleVersion);

        let err = registry
            .resolve("com.example.other", &Version::new(1, 0, 0))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IncompatibleVersion);
    }

    #[test]
    fn test_resolve_prefers_highest_minor() {
        let registry = ContractRegistry::new();
        registry.register("a", contract("com.example.svc", Version::new(1, 1, 0))).unwrap();
        registry.register("b", contract("com.example.svc", Version::new(1, 3, 2))).unwrap();
        registry.register("c", contract("com.example.svc", Version::new(2, 0, 0))).unwrap();

        let found = registry.resolve("com.example.svc", &Version::new(1, 2, 0)).unwrap();
        assert_eq!(found.version, Version::new(1, 3, 2));
        assert_eq!(registry.providers("com.example.svc"), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_duplicate_version_rejected() {
        let registry = ContractRegistry::new();
        registry.register("a", contract("com.example.svc", Version::new(1, 0, 0))).unwrap();
        let err = registry
            .register("b", contract("com.example.svc", Version::new(1, 0, 0)))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unregister_provider() {
        let registry = ContractRegistry::new();
        registry.register("a", contract("com.example.one", Version::new(1, 0, 0))).unwrap();
        registry.register("a", contract("com.example.two", Version::new(1, 0, 0))).unwrap();
        registry.register("b", contract("com.example.two", Version::new(1, 1, 0))).unwrap();

        let removed = registry.unregister_provider("a");
        assert_eq!(removed, vec!["com.example.one", "com.example.two"]);
        assert_eq!(registry.service_names(), vec!["com.example.two"]);
        assert!(registry.unregister("a", "com.example.two").is_err());
        registry.unregister("b", "com.example.two").unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_replace_provider_contracts_is_atomic() {
        let registry = ContractRegistry::new();
        registry.register("a", contract("com.example.svc", Version::new(1, 0, 0))).unwrap();
        registry.register("b", contract("com.example.svc", Version::new(1, 1, 0))).unwrap();

        // clashes with b's version, so nothing changes
        let err = registry
            .replace_provider_contracts("a", vec![contract("com.example.svc", Version::new(1, 1, 0))])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert!(registry.get("com.example.svc", &Version::new(1, 0, 0)).is_some());

        registry
            .replace_provider_contracts("a", vec![contract("com.example.svc", Version::new(1, 0, 1))])
            .unwrap();
        assert!(registry.get("com.example.svc", &Version::new(1, 0, 0)).is_none());
        assert_eq!(registry.contracts_of("a")[0].version, Version::new(1, 0, 1));
    }

    #[test]
    fn test_find_by_capability() {
        let registry = ContractRegistry::new();
        registry.register("a", contract("com.example.one", Version::new(1, 0, 0))).unwrap();
        let plain = ServiceContract::builder("com.example.plain", Version::new(1, 0, 0))
            .method(ServiceMethod::builder("noop").build())
            .build()
            .unwrap();
        registry.register("b", plain).unwrap();

        let found = registry.find_by_capability(MethodCapabilities::THREAD_SAFE);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].service_name, "com.example.one");
        assert_eq!(registry.find_by_capability(MethodCapabilities::empty()).len(), 2);
    }

    #[test]
    fn test_validate_dependencies() {
        let registry = ContractRegistry::new();
        let dependent = ServiceContract::builder("com.example.consumer", Version::new(1, 0, 0))
            .method(ServiceMethod::builder("run").build())
            .depends_on("com.example.svc", Version::new(1, 1, 0))
            .build()
            .unwrap();

        let err = registry.validate_dependencies(&dependent).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DependencyMissing);

        registry.register("a", contract("com.example.svc", Version::new(1, 2, 0))).unwrap();
        assert!(registry.validate_dependencies(&dependent).is_ok());
    }

    #[test]
    fn test_validate_method_call() {
        let registry = ContractRegistry::new();
        registry.register("a", contract("com.example.svc", Version::new(1, 0, 0))).unwrap();

        assert!(registry
            .validate_method_call("com.example.svc", "lookup", &json!({"key": "abc", "limit": 3}))
            .is_ok());

        let missing = registry
            .validate_method_call("com.example.svc", "lookup", &json!({}))
            .unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::InvalidParameters);

        let wrong_type = registry
            .validate_method_call("com.example.svc", "lookup", &json!({"key": 7}))
            .unwrap_err();
        assert_eq!(wrong_type.kind(), ErrorKind::InvalidParameters);

        let bad_pattern = registry
            .validate_method_call("com.example.svc", "lookup", &json!({"key": "ABC"}))
            .unwrap_err();
        assert_eq!(bad_pattern.kind(), ErrorKind::InvalidParameters);

        let unknown = registry
            .validate_method_call("com.example.svc", "nope", &json!({}))
            .unwrap_err();
        assert_eq!(unknown.kind(), ErrorKind::CommandNotFound);
    }

    #[test]
    fn test_validation_pattern_matches_whole_value() {
        let registry = ContractRegistry::new();
        let digits = ServiceContract::builder("com.example.ids", Version::new(1, 0, 0))
            .method(
                ServiceMethod::builder("get")
                    .parameter(ServiceParameter::required("id", ParameterType::String).with_pattern("[0-9]+"))
                    .build(),
            )
            .build()
            .unwrap();
        registry.register("a", digits).unwrap();

        assert!(registry
            .validate_method_call("com.example.ids", "get", &json!({"id": "123"}))
            .is_ok());
        for partial in ["abc123", "123abc", ""] {
            let err = registry
                .validate_method_call("com.example.ids", "get", &json!({ "id": partial }))
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidParameters, "{partial:?}");
        }
    }

    #[test]
    fn test_optional_requirement() {
        let registry = ContractRegistry::new();
        let req = ServiceRequirement::optional("com.example.missing", Version::new(1, 0, 0));
        assert!(registry.resolve_requirement(&req).unwrap().is_none());
        let req = ServiceRequirement::required("com.example.missing", Version::new(1, 0, 0));
        assert!(registry.resolve_requirement(&req).is_err());
    }
}
