// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The service info cache.
//!
//! Every scan and quota update is validated against the service info version
//! on file. The cache is filled at startup and refreshed when an adapter
//! starts answering under a newer version, which is the only coordination
//! the version protocol needs.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::info;

use limes_liquid::{Liquid, ServiceInfo};
use limes_ore::now::EpochMillis;
use limes_repr::ServiceType;
use limes_store::Store;

use crate::jobs::JobError;

/// The per-service [`ServiceInfo`] on file.
#[derive(Debug, Default)]
pub struct ServiceInfoCache {
    map: RwLock<BTreeMap<ServiceType, Arc<ServiceInfo>>>,
}

impl ServiceInfoCache {
    /// Creates an empty cache.
    pub fn new() -> ServiceInfoCache {
        ServiceInfoCache::default()
    }

    /// Returns the info on file for a service.
    pub fn get(&self, service_type: &ServiceType) -> Option<Arc<ServiceInfo>> {
        self.map
            .read()
            .expect("info lock poisoned")
            .get(service_type)
            .cloned()
    }

    /// Replaces the info on file for a service.
    pub fn insert(&self, service_type: ServiceType, info: Arc<ServiceInfo>) {
        self.map
            .write()
            .expect("info lock poisoned")
            .insert(service_type, info);
    }

    /// Re-fetches a service's info from its adapter and records the new
    /// version in cache and store.
    pub async fn refresh(
        &self,
        store: &dyn Store,
        liquid: &dyn Liquid,
        service_type: &ServiceType,
        now: EpochMillis,
        deadline: Duration,
    ) -> Result<Arc<ServiceInfo>, JobError> {
        let info = Arc::new(liquid.build_service_info(deadline).await?);
        store
            .ensure_service(now, service_type.clone(), info.version)
            .await?;
        info!(service_type = %service_type, version = info.version, "service info refreshed");
        self.insert(service_type.clone(), Arc::clone(&info));
        Ok(info)
    }
}
