// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Prometheus metrics.
//!
//! Counters and histograms are bumped inline by the jobs; the gauges
//! (commitment states, scrape staleness) are recomputed from the store by
//! the cleanup loop, which keeps gauge refresh off the hot paths.

use prometheus::{
    GaugeVec, Histogram, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
};

use limes_ore::cast::CastLossy;
use limes_ore::now::EpochMillis;
use limes_store::entities::CommitmentState;
use limes_store::{Store, StoreError};

/// The collector's metric families.
#[derive(Clone)]
pub struct CollectorMetrics {
    /// Usage scrapes by service and outcome.
    pub scrapes: IntCounterVec,
    /// Usage scrape duration by service.
    pub scrape_duration: HistogramVec,
    /// Capacity scrapes by service and outcome.
    pub capacity_scrapes: IntCounterVec,
    /// Quota syncs by service and outcome.
    pub quota_syncs: IntCounterVec,
    /// Discovery runs by outcome.
    pub discovery_runs: IntCounterVec,
    /// Distributor passes by service and outcome.
    pub distributor_runs: IntCounterVec,
    /// Distributor pass duration.
    pub distributor_duration: Histogram,
    /// Commitments by service and lifecycle state.
    pub commitments: IntGaugeVec,
    /// Age of the oldest scrape per service, in seconds.
    pub oldest_scrape_age: GaugeVec,
}

impl CollectorMetrics {
    /// Creates the families and registers them into `registry`.
    pub fn register_into(registry: &Registry) -> CollectorMetrics {
        fn counter(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
            let counter =
                IntCounterVec::new(Opts::new(name, help), labels).expect("valid metric options");
            registry
                .register(Box::new(counter.clone()))
                .expect("metric registered twice");
            counter
        }

        let scrapes = counter(
            registry,
            "limes_scrapes_total",
            "Usage scrapes, by service type and outcome.",
            &["service_type", "outcome"],
        );
        let capacity_scrapes = counter(
            registry,
            "limes_capacity_scrapes_total",
            "Capacity scrapes, by service type and outcome.",
            &["service_type", "outcome"],
        );
        let quota_syncs = counter(
            registry,
            "limes_quota_syncs_total",
            "Quota sync attempts, by service type and outcome.",
            &["service_type", "outcome"],
        );
        let discovery_runs = counter(
            registry,
            "limes_discovery_runs_total",
            "Identity discovery runs, by outcome.",
            &["outcome"],
        );
        let distributor_runs = counter(
            registry,
            "limes_distributor_runs_total",
            "Distributor passes, by service type and outcome.",
            &["service_type", "outcome"],
        );

        let scrape_duration = HistogramVec::new(
            HistogramOpts::new(
                "limes_scrape_duration_seconds",
                "Usage scrape duration, by service type.",
            ),
            &["service_type"],
        )
        .expect("valid metric options");
        registry
            .register(Box::new(scrape_duration.clone()))
            .expect("metric registered twice");

        let distributor_duration = Histogram::with_opts(HistogramOpts::new(
            "limes_distributor_duration_seconds",
            "Distributor pass duration.",
        ))
        .expect("valid metric options");
        registry
            .register(Box::new(distributor_duration.clone()))
            .expect("metric registered twice");

        let commitments = IntGaugeVec::new(
            Opts::new("limes_commitments", "Commitments, by service type and state."),
            &["service_type", "state"],
        )
        .expect("valid metric options");
        registry
            .register(Box::new(commitments.clone()))
            .expect("metric registered twice");

        let oldest_scrape_age = GaugeVec::new(
            Opts::new(
                "limes_oldest_scrape_age_seconds",
                "Age of the oldest successful scrape, by service type.",
            ),
            &["service_type"],
        )
        .expect("valid metric options");
        registry
            .register(Box::new(oldest_scrape_age.clone()))
            .expect("metric registered twice");

        CollectorMetrics {
            scrapes,
            scrape_duration,
            capacity_scrapes,
            quota_syncs,
            discovery_runs,
            distributor_runs,
            distributor_duration,
            commitments,
            oldest_scrape_age,
        }
    }

    /// Recomputes the gauges from the store.
    pub async fn refresh_gauges(
        &self,
        store: &dyn Store,
        now: EpochMillis,
    ) -> Result<(), StoreError> {
        self.commitments.reset();
        for ((service_type, state), count) in store.commitment_state_counts().await? {
            self.commitments
                .with_label_values(&[service_type.as_str(), &state.to_string()])
                .set(i64::try_from(count).unwrap_or(i64::MAX));
        }
        for (service_type, age) in store.oldest_scrape_ages(now).await? {
            self.oldest_scrape_age
                .with_label_values(&[service_type.as_str()])
                .set(age.as_secs_f64());
        }
        Ok(())
    }

    /// Reports whether any commitment gauge is non-zero, for tests.
    pub fn commitment_gauge(&self, service_type: &str, state: CommitmentState) -> i64 {
        self.commitments
            .with_label_values(&[service_type, &state.to_string()])
            .get()
    }
}

/// Renders the per-project data metrics (quota and usage per resource) as a
/// Prometheus exposition, built fresh from the store on every scrape of the
/// endpoint.
pub async fn render_data_metrics(store: &dyn Store) -> Result<String, StoreError> {
    let registry = Registry::new();
    let quota = GaugeVec::new(
        Opts::new("limes_project_quota", "Granted quota per project resource."),
        &["domain", "project", "service_type", "resource"],
    )
    .expect("valid metric options");
    let usage = GaugeVec::new(
        Opts::new("limes_project_usage", "Usage per project resource."),
        &["domain", "project", "service_type", "resource"],
    )
    .expect("valid metric options");
    registry
        .register(Box::new(quota.clone()))
        .expect("fresh registry");
    registry
        .register(Box::new(usage.clone()))
        .expect("fresh registry");

    for metric in store.data_metrics().await? {
        let labels = [
            metric.domain_uuid.as_str(),
            metric.project_uuid.as_str(),
            metric.service_type.as_str(),
            metric.resource.as_str(),
        ];
        if let Some(value) = metric.quota {
            quota.with_label_values(&labels).set(f64::cast_lossy(value));
        }
        usage
            .with_label_values(&labels)
            .set(f64::cast_lossy(metric.usage));
    }

    let mut buf = String::new();
    let encoder = prometheus::TextEncoder::new();
    encoder
        .encode_utf8(&registry.gather(), &mut buf)
        .expect("text encoding is infallible");
    Ok(buf)
}
