// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The adapter registry.
//!
//! Every adapter the cluster talks to is registered here exactly once, at
//! startup. Components resolve adapters by service type and never construct
//! transports themselves, so adding a new kind of binding is a change to
//! this module alone.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use limes_repr::{ClusterConfig, ServiceType};

use crate::client::HttpLiquid;
use crate::Liquid;

/// How one service type's adapter is reached.
#[derive(Clone)]
pub enum LiquidBinding {
    /// An adapter process behind an HTTP endpoint.
    Http {
        /// The adapter's base URL.
        endpoint: String,
    },
    /// An adapter linked into this process (tests, built-in adapters).
    InProcess(Arc<dyn Liquid>),
}

impl fmt::Debug for LiquidBinding {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LiquidBinding::Http { endpoint } => {
                f.debug_struct("Http").field("endpoint", endpoint).finish()
            }
            LiquidBinding::InProcess(_) => f.write_str("InProcess(..)"),
        }
    }
}

/// The set of adapters the cluster is configured with.
#[derive(Clone, Default)]
pub struct LiquidRegistry {
    adapters: BTreeMap<ServiceType, Arc<dyn Liquid>>,
}

impl LiquidRegistry {
    /// Creates an empty registry.
    pub fn new() -> LiquidRegistry {
        LiquidRegistry::default()
    }

    /// Builds a registry from the cluster configuration. Every configured
    /// service must carry an endpoint; in-process adapters are registered
    /// separately before this call via [`LiquidRegistry::register`].
    pub fn from_config(config: &ClusterConfig) -> Result<LiquidRegistry, RegistryError> {
        let mut registry = LiquidRegistry::new();
        for (service_type, service) in &config.services {
            match &service.endpoint {
                Some(endpoint) => registry.register(
                    service_type.clone(),
                    LiquidBinding::Http {
                        endpoint: endpoint.clone(),
                    },
                ),
                None => return Err(RegistryError::MissingBinding(service_type.clone())),
            }
        }
        Ok(registry)
    }

    /// Registers an adapter for a service type, replacing any previous
    /// binding.
    pub fn register(&mut self, service_type: ServiceType, binding: LiquidBinding) {
        let adapter: Arc<dyn Liquid> = match binding {
            LiquidBinding::Http { endpoint } => {
                Arc::new(HttpLiquid::new(service_type.clone(), endpoint))
            }
            LiquidBinding::InProcess(adapter) => adapter,
        };
        self.adapters.insert(service_type, adapter);
    }

    /// Resolves the adapter for a service type.
    pub fn get(&self, service_type: &ServiceType) -> Result<Arc<dyn Liquid>, RegistryError> {
        self.adapters
            .get(service_type)
            .cloned()
            .ok_or_else(|| RegistryError::MissingBinding(service_type.clone()))
    }

    /// Returns all registered service types.
    pub fn service_types(&self) -> Vec<ServiceType> {
        self.adapters.keys().cloned().collect()
    }
}

impl fmt::Debug for LiquidRegistry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LiquidRegistry")
            .field("service_types", &self.service_types())
            .finish()
    }
}

/// An error resolving or constructing adapters.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A service type has no registered adapter.
    #[error("no adapter registered for service type {0}")]
    MissingBinding(ServiceType),
}

#[cfg(test)]
mod tests {
    use limes_repr::ClusterConfig;

    use super::LiquidRegistry;

    #[test]
    fn test_from_config_requires_endpoints() {
        let config: ClusterConfig = serde_json::from_str(
            r#"{"services": {"object-store": {}}}"#,
        )
        .unwrap();
        assert!(LiquidRegistry::from_config(&config).is_err());

        let config: ClusterConfig = serde_json::from_str(
            r#"{"services": {"object-store": {"endpoint": "http://localhost:8080"}}}"#,
        )
        .unwrap();
        let registry = LiquidRegistry::from_config(&config).unwrap();
        assert!(registry.get(&"object-store".into()).is_ok());
        assert!(registry.get(&"compute".into()).is_err());
    }
}
