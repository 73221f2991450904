//! Learning engine: source classification and anchor refinement
//!
//! For every source in a learning report the engine feeds the observation
//! accumulator, promotes STATIONARY sources into the object's companion
//! set, and refines the source's anchor coordinate with an exponentially
//! weighted moving average. Stationary sources pull the anchor harder
//! (weight 0.2) than unclassified or random ones (0.1), and the updated
//! coordinate always lies on the segment between the previous value and
//! the reported position.
//!
//! Anchor updates are last-writer-wins with no compare-and-swap. The
//! required property is eventual convergence under a stream of reports,
//! not linearizability.

use std::sync::Arc;

use coordcheck_common::model::{
    Anchor, AnchorKind, LearnOutcome, LearnReport, LearnResponse, LearningEvent,
    ObservationStatus, SourceRef,
};
use coordcheck_common::{time, Result};

use crate::accumulator::ObservationAccumulator;
use crate::catalog::CatalogStore;

/// EWMA weight for a source currently classified STATIONARY
const EWMA_WEIGHT_STATIONARY: f64 = 0.2;
/// EWMA weight for any other source
const EWMA_WEIGHT_DEFAULT: f64 = 0.1;

/// Anchor confidence as a function of total observation count
///
/// Saturates toward 0.95 and never drops below the 0.3 a fresh anchor is
/// created with, so confidence is non-decreasing in the count.
pub fn confidence_for(observation_count: i64) -> f64 {
    let grown = 0.95 * (1.0 - (-(observation_count as f64) / 200.0).exp());
    grown.max(0.3)
}

pub struct LearningEngine {
    catalog: Arc<CatalogStore>,
    accumulator: Arc<ObservationAccumulator>,
}

impl LearningEngine {
    pub fn new(catalog: Arc<CatalogStore>, accumulator: Arc<ObservationAccumulator>) -> Self {
        Self {
            catalog,
            accumulator,
        }
    }

    /// Process one learning report
    pub async fn learn(&self, report: &LearnReport) -> Result<LearnResponse> {
        let mut stationary_sources: Vec<String> = Vec::new();
        let mut random_sources: Vec<String> = Vec::new();
        let mut total_sources = 0usize;

        for reading in &report.wifi {
            total_sources += 1;
            let source = reading.source_ref();
            let kind = AnchorKind::Wifi {
                ssid: reading.ssid.clone(),
            };
            self.learn_source(
                report,
                &source,
                kind,
                reading.effective_rssi(),
                &mut stationary_sources,
                &mut random_sources,
            )
            .await?;
        }

        for reading in &report.bluetooth {
            total_sources += 1;
            let source = reading.source_ref();
            self.learn_source(
                report,
                &source,
                AnchorKind::Ble,
                reading.effective_rssi(),
                &mut stationary_sources,
                &mut random_sources,
            )
            .await?;
        }

        for reading in &report.cell_towers {
            total_sources += 1;
            let source = reading.source_ref();
            let kind = AnchorKind::Cell {
                mcc: reading.mcc,
                mnc: reading.mnc,
            };
            self.learn_source(
                report,
                &source,
                kind,
                reading.effective_rssi(),
                &mut stationary_sources,
                &mut random_sources,
            )
            .await?;
        }

        let result = derive_outcome(
            total_sources,
            stationary_sources.len(),
            random_sources.len(),
        );

        Ok(LearnResponse {
            result,
            stationary_sources,
            random_sources,
        })
    }

    /// Build the event payload published for a completed learning request
    pub fn event_for(&self, report: &LearnReport, response: &LearnResponse) -> LearningEvent {
        LearningEvent {
            object_id: report.object_id.clone(),
            latitude: report.latitude,
            longitude: report.longitude,
            timestamp: report.timestamp,
            result: response.result,
            stationary_sources: response.stationary_sources.clone(),
            random_sources: response.random_sources.clone(),
            event_time: time::now(),
        }
    }

    async fn learn_source(
        &self,
        report: &LearnReport,
        source: &SourceRef,
        kind: AnchorKind,
        rssi: Option<i32>,
        stationary_sources: &mut Vec<String>,
        random_sources: &mut Vec<String>,
    ) -> Result<()> {
        let aggregate = self
            .accumulator
            .add(&report.object_id, source, report.latitude, report.longitude)
            .await?;

        let stationary = aggregate.status == ObservationStatus::Stationary;
        if stationary {
            self.catalog.add_companion(&report.object_id, source).await?;
        }

        self.update_anchor(report, source, kind, rssi, stationary)
            .await?;

        match aggregate.status {
            ObservationStatus::Stationary => stationary_sources.push(source.source_id.clone()),
            ObservationStatus::Random => random_sources.push(source.source_id.clone()),
            ObservationStatus::New => {}
        }

        Ok(())
    }

    async fn update_anchor(
        &self,
        report: &LearnReport,
        source: &SourceRef,
        kind: AnchorKind,
        rssi: Option<i32>,
        stationary: bool,
    ) -> Result<()> {
        let now = time::now();

        let anchor = match self.catalog.get_anchor(source).await? {
            None => {
                let mut seeded = Anchor::seed(report.latitude, report.longitude, now, kind);
                seeded.last_rssi = rssi;
                seeded
            }
            Some(existing) => {
                let weight = if stationary {
                    EWMA_WEIGHT_STATIONARY
                } else {
                    EWMA_WEIGHT_DEFAULT
                };
                let observation_count = existing.observation_count + 1;
                Anchor {
                    lat: existing.lat * (1.0 - weight) + report.latitude * weight,
                    lon: existing.lon * (1.0 - weight) + report.longitude * weight,
                    last_seen: now,
                    version: existing.version + 1,
                    observation_count,
                    confidence: confidence_for(observation_count),
                    last_rssi: rssi.or(existing.last_rssi),
                    kind,
                }
            }
        };

        self.catalog.put_anchor(source, &anchor).await
    }
}

/// Derive the request-level outcome from per-source classifications
fn derive_outcome(total: usize, stationary: usize, random: usize) -> LearnOutcome {
    if total == 0 {
        LearnOutcome::NeedMoreData
    } else if stationary > 0 {
        LearnOutcome::StationaryDetected
    } else if random > stationary * 2 {
        LearnOutcome::RandomExcluded
    } else {
        LearnOutcome::Learned
    }
}
