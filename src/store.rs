use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;

use crate::encoder::RunResult;
use crate::metrics::AggregateMetric;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RecordId(u64);

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record {0} not found")]
    NotFound(RecordId),
}

/// Encode statistics and quality scores of one job, flattened for tabular output.
///
/// Times are in seconds and `max_rss` is in KiB.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Record {
    pub name: String,
    pub source_file: PathBuf,
    pub compressed_file: PathBuf,
    pub vqm_result_file: PathBuf,
    pub frame_metrics_file: PathBuf,
    pub cmd: String,

    pub system_time: f64,
    pub user_time: f64,
    pub elapsed: f64,
    pub max_rss: i64,
    pub video_duration: f64,
    pub avg_encoding_speed: f64,

    pub psnr_min: f64,
    pub psnr_max: f64,
    pub psnr_mean: f64,
    pub psnr_harmonic_mean: f64,
    pub psnr_stdev: f64,
    pub psnr_variance: f64,

    pub ms_ssim_min: f64,
    pub ms_ssim_max: f64,
    pub ms_ssim_mean: f64,
    pub ms_ssim_harmonic_mean: f64,
    pub ms_ssim_stdev: f64,
    pub ms_ssim_variance: f64,

    pub vmaf_min: f64,
    pub vmaf_max: f64,
    pub vmaf_mean: f64,
    pub vmaf_harmonic_mean: f64,
    pub vmaf_stdev: f64,
    pub vmaf_variance: f64,
}

impl Record {
    /// Builds a record from a successful run. Failed runs have nothing to record.
    #[must_use]
    pub fn from_run_result(result: &RunResult) -> Option<Self> {
        let encoded = result.encoded()?;
        let usage = result.usage.unwrap_or_default();

        Some(Self {
            name: result.job.name.clone(),
            source_file: result.job.source_file.clone(),
            compressed_file: result.job.compressed_file.clone(),
            cmd: result.job.cmd.clone(),
            system_time: usage.system_time.as_secs_f64(),
            user_time: usage.user_time.as_secs_f64(),
            elapsed: usage.elapsed.as_secs_f64(),
            max_rss: usage.max_rss,
            video_duration: encoded.video_duration,
            avg_encoding_speed: encoded.avg_encoding_speed,
            ..Self::default()
        })
    }

    pub fn apply_metrics(
        &mut self,
        aggregate: &AggregateMetric,
        vqm_result_file: &Path,
        frame_metrics_file: &Path,
    ) {
        self.vqm_result_file = vqm_result_file.to_path_buf();
        self.frame_metrics_file = frame_metrics_file.to_path_buf();

        let psnr = &aggregate.psnr;
        self.psnr_min = psnr.min;
        self.psnr_max = psnr.max;
        self.psnr_mean = psnr.mean;
        self.psnr_harmonic_mean = psnr.harmonic_mean;
        self.psnr_stdev = psnr.stdev;
        self.psnr_variance = psnr.variance;

        let ms_ssim = &aggregate.ms_ssim;
        self.ms_ssim_min = ms_ssim.min;
        self.ms_ssim_max = ms_ssim.max;
        self.ms_ssim_mean = ms_ssim.mean;
        self.ms_ssim_harmonic_mean = ms_ssim.harmonic_mean;
        self.ms_ssim_stdev = ms_ssim.stdev;
        self.ms_ssim_variance = ms_ssim.variance;

        let vmaf = &aggregate.vmaf;
        self.vmaf_min = vmaf.min;
        self.vmaf_max = vmaf.max;
        self.vmaf_mean = vmaf.mean;
        self.vmaf_harmonic_mean = vmaf.harmonic_mean;
        self.vmaf_stdev = vmaf.stdev;
        self.vmaf_variance = vmaf.variance;
    }
}

#[derive(Default)]
struct Records {
    records: HashMap<RecordId, Record>,
    next_id: u64,
}

/// Thread-safe collection of records. Identifiers are never reused.
#[derive(Default)]
pub struct Store {
    inner: RwLock<Records>,
}

impl Store {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock cannot leave the map half-updated, so a
    // poisoned lock is still usable.
    fn read(&self) -> RwLockReadGuard<'_, Records> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Records> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, record: Record) -> RecordId {
        let mut inner = self.write();

        let id = RecordId(inner.next_id);
        inner.next_id += 1;
        inner.records.insert(id, record);

        id
    }

    pub fn get(&self, id: RecordId) -> Result<Record, StoreError> {
        self.read()
            .records
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    pub fn update(&self, id: RecordId, record: Record) -> Result<(), StoreError> {
        let mut inner = self.write();

        match inner.records.get_mut(&id) {
            Some(existing) => {
                *existing = record;
                Ok(())
            }
            None => Err(StoreError::NotFound(id)),
        }
    }

    pub fn delete(&self, id: RecordId) -> Result<(), StoreError> {
        self.write()
            .records
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound(id))
    }

    #[must_use]
    pub fn exists(&self, id: RecordId) -> bool {
        self.read().records.contains_key(&id)
    }

    /// Snapshot of the current identifiers, in no particular order.
    #[must_use]
    pub fn ids(&self) -> Vec<RecordId> {
        self.read().records.keys().copied().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read().records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().records.is_empty()
    }

    /// Copies of all records ordered by identifier.
    #[must_use]
    pub fn sorted_records(&self) -> Vec<(RecordId, Record)> {
        let mut records: Vec<_> = self
            .read()
            .records
            .iter()
            .map(|(id, record)| (*id, record.clone()))
            .collect();

        records.sort_by_key(|(id, _)| *id);
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metric;

    fn record(name: &str) -> Record {
        Record {
            name: name.to_owned(),
            ..Record::default()
        }
    }

    #[test]
    fn operations_on_missing_records_fail() {
        let store = Store::new();
        let id = store.insert(record("a"));
        store.delete(id).unwrap();

        assert!(matches!(store.get(id), Err(StoreError::NotFound(missing)) if missing == id));
        assert!(store.update(id, record("b")).is_err());
        assert!(store.delete(id).is_err());
        assert!(!store.exists(id));
    }

    #[test]
    fn ids_are_not_reused_after_delete() {
        let store = Store::new();
        let first = store.insert(record("a"));
        store.delete(first).unwrap();
        let second = store.insert(record("b"));

        assert_ne!(first, second);
        assert_eq!(store.ids(), vec![second]);
    }

    #[test]
    fn get_returns_a_copy() {
        let store = Store::new();
        let id = store.insert(record("a"));

        let mut copy = store.get(id).unwrap();
        copy.name = "changed".to_owned();

        assert_eq!(store.get(id).unwrap().name, "a");

        store.update(id, copy).unwrap();
        assert_eq!(store.get(id).unwrap().name, "changed");
    }

    #[test]
    fn apply_metrics_fills_quality_columns() {
        let mut record = record("a");
        let aggregate = AggregateMetric {
            vmaf: Metric {
                min: 80.0,
                max: 99.0,
                mean: 90.0,
                harmonic_mean: 89.5,
                stdev: 2.0,
                variance: 4.0,
            },
            ..AggregateMetric::default()
        };

        record.apply_metrics(&aggregate, Path::new("a_vqm.json"), Path::new("a_frame_metrics.json"));

        assert_eq!(record.vmaf_min, 80.0);
        assert_eq!(record.vmaf_variance, 4.0);
        assert_eq!(record.psnr_mean, 0.0);
        assert_eq!(record.vqm_result_file, PathBuf::from("a_vqm.json"));
    }
}
