//! Observation accumulator: per-(object, source) stationary detection
//!
//! Each add appends a sample to a rolling window, trims the window to the
//! most recent `10 x min_observations` entries, and re-derives the status
//! from the total count and the positional variance of the retained
//! samples:
//!
//! - NEW        while fewer than `min_observations` samples have been seen
//! - STATIONARY when both lat and lon variance are below the threshold
//! - RANDOM     when either variance is at or above the threshold
//!
//! Transitions between STATIONARY and RANDOM are permitted on every add;
//! the current retained-sample variance alone decides. Aggregates expire
//! with the configured time window and a post-expiry sighting starts over
//! as a fresh NEW.

use std::sync::Arc;

use coordcheck_common::model::{
    ObservationAggregate, ObservationSample, ObservationStatus, SourceRef,
};
use coordcheck_common::params::ConfigRegistry;
use coordcheck_common::{time, Result};

use crate::catalog::CatalogStore;

pub struct ObservationAccumulator {
    catalog: Arc<CatalogStore>,
    config: Arc<ConfigRegistry>,
}

impl ObservationAccumulator {
    pub fn new(catalog: Arc<CatalogStore>, config: Arc<ConfigRegistry>) -> Self {
        Self { catalog, config }
    }

    /// Record one sighting of `source` by `object_id` and return the
    /// updated aggregate
    pub async fn add(
        &self,
        object_id: &str,
        source: &SourceRef,
        lat: f64,
        lon: f64,
    ) -> Result<ObservationAggregate> {
        let settings = self.config.snapshot();
        let now = time::now();

        let mut aggregate = match self.catalog.get_observation(object_id, source).await? {
            Some(existing) => existing,
            None => ObservationAggregate {
                object_id: object_id.to_string(),
                source_type: source.source_type,
                source_id: source.source_id.clone(),
                observations: Vec::new(),
                count: 0,
                status: ObservationStatus::New,
                first_seen: now,
                last_seen: now,
            },
        };

        aggregate.observations.push(ObservationSample {
            lat,
            lon,
            time: now,
        });
        aggregate.count += 1;
        aggregate.last_seen = now;

        // Retain only the most recent window
        let window = settings.min_observations.saturating_mul(10).max(1);
        if aggregate.observations.len() > window {
            let drop = aggregate.observations.len() - window;
            aggregate.observations.drain(..drop);
        }

        aggregate.status = derive_status(
            aggregate.count,
            &aggregate.observations,
            settings.min_observations,
            settings.variance_threshold,
        );

        self.catalog
            .put_observation(
                &aggregate,
                time::hours_to_duration(settings.time_window_hours),
            )
            .await?;

        Ok(aggregate)
    }
}

/// Derive the status from total count and retained samples
pub fn derive_status(
    count: i64,
    retained: &[ObservationSample],
    min_observations: usize,
    variance_threshold: f64,
) -> ObservationStatus {
    if count < min_observations as i64 || retained.len() < 2 {
        return ObservationStatus::New;
    }

    let (var_lat, var_lon) = variances(retained);
    if var_lat < variance_threshold && var_lon < variance_threshold {
        ObservationStatus::Stationary
    } else {
        ObservationStatus::Random
    }
}

/// Population variances of the retained samples, degrees squared
///
/// Naive sum-of-squared-deviation is fine here: the window is bounded to a
/// few tens of samples.
pub fn variances(samples: &[ObservationSample]) -> (f64, f64) {
    let n = samples.len() as f64;
    if samples.len() < 2 {
        return (0.0, 0.0);
    }

    let (sum_lat, sum_lon) = samples
        .iter()
        .fold((0.0, 0.0), |(la, lo), s| (la + s.lat, lo + s.lon));
    let mean_lat = sum_lat / n;
    let mean_lon = sum_lon / n;

    let (var_lat, var_lon) = samples.iter().fold((0.0, 0.0), |(la, lo), s| {
        let d_lat = s.lat - mean_lat;
        let d_lon = s.lon - mean_lon;
        (la + d_lat * d_lat, lo + d_lon * d_lon)
    });

    (var_lat / n, var_lon / n)
}
