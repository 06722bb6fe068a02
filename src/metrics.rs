use std::io::{Read, Write};

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use statrs::statistics::Statistics;

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("frame metrics input is empty")]
    EmptyInput,

    #[error("no frame metrics to aggregate")]
    NoFrames,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MetricKind {
    Vmaf,
    Psnr,
    MsSsim,
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Vmaf => write!(f, "VMAF"),
            Self::Psnr => write!(f, "PSNR"),
            Self::MsSsim => write!(f, "MS-SSIM"),
        }
    }
}

/// Report keys accepted for each metric, in order of preference.
///
/// libvmaf renames its output fields between releases, e.g. `psnr` became
/// `psnr_y` and `ms_ssim` became `float_ms_ssim`.
pub const METRIC_ALIASES: [(MetricKind, &[&str]); 3] = [
    (MetricKind::Vmaf, &["vmaf"]),
    (MetricKind::Psnr, &["psnr", "psnr_y"]),
    (MetricKind::MsSsim, &["ms_ssim", "float_ms_ssim"]),
];

/// Looks up the first key in `fields` that is an accepted alias for `kind`.
#[must_use]
pub fn resolve_alias<'a>(fields: &'a Map<String, Value>, kind: MetricKind) -> Option<&'a Value> {
    METRIC_ALIASES
        .iter()
        .filter(|(candidate, _)| *candidate == kind)
        .flat_map(|(_, aliases)| aliases.iter())
        .find_map(|alias| fields.get(*alias))
}

fn resolve_score(fields: &Map<String, Value>, kind: MetricKind) -> f64 {
    resolve_alias(fields, kind)
        .and_then(Value::as_f64)
        .unwrap_or_default()
}

/// Quality scores of a single frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameMetric {
    pub frame_num: u64,
    pub vmaf: f64,
    pub psnr: f64,
    pub ms_ssim: f64,
}

impl FrameMetric {
    #[must_use]
    pub const fn score(&self, kind: MetricKind) -> f64 {
        match kind {
            MetricKind::Vmaf => self.vmaf,
            MetricKind::Psnr => self.psnr,
            MetricKind::MsSsim => self.ms_ssim,
        }
    }
}

/// Per-frame scores in frame order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrameMetrics(Vec<FrameMetric>);

impl FrameMetrics {
    #[must_use]
    pub const fn new(frames: Vec<FrameMetric>) -> Self {
        Self(frames)
    }

    #[must_use]
    pub fn as_slice(&self) -> &[FrameMetric] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FrameMetric> {
        self.0.iter()
    }

    #[must_use]
    pub fn scores(&self, kind: MetricKind) -> Vec<f64> {
        self.0.iter().map(|frame| frame.score(kind)).collect()
    }

    /// Reads the flat array written by [`FrameMetrics::to_json`].
    pub fn from_json(mut reader: impl Read) -> anyhow::Result<Self> {
        let mut json = Vec::new();
        reader
            .read_to_end(&mut json)
            .context("Unable to read frame metrics")?;

        if json.is_empty() {
            return Err(MetricsError::EmptyInput.into());
        }

        serde_json::from_slice(&json).context("Unable to deserialize frame metrics JSON")
    }

    pub fn to_json(&self, writer: impl Write) -> anyhow::Result<()> {
        serde_json::to_writer_pretty(writer, self).context("Unable to serialize frame metrics")
    }

    /// Reads the per-frame scores from a libvmaf JSON log.
    pub fn from_vmaf_report(reader: impl Read) -> anyhow::Result<Self> {
        Ok(VmafReport::from_reader(reader)?.frames)
    }

    /// Decodes either a libvmaf log or a flat array, based on the document shape.
    pub fn decode(json: &[u8]) -> anyhow::Result<Self> {
        match json.iter().find(|byte| !byte.is_ascii_whitespace()) {
            None => Err(MetricsError::EmptyInput.into()),
            Some(b'[') => Self::from_json(json),
            Some(b'{') => Self::from_vmaf_report(json),
            Some(other) => Err(anyhow!(
                "Unrecognized frame metrics document starting with {:?}",
                char::from(*other)
            )),
        }
    }

    /// Summarizes every score type over all frames.
    pub fn aggregate(&self) -> anyhow::Result<AggregateMetric> {
        if self.is_empty() {
            return Err(MetricsError::NoFrames.into());
        }

        Ok(AggregateMetric {
            vmaf: Metric::from_samples(&self.scores(MetricKind::Vmaf)),
            psnr: Metric::from_samples(&self.scores(MetricKind::Psnr)),
            ms_ssim: Metric::from_samples(&self.scores(MetricKind::MsSsim)),
        })
    }
}

impl<'a> IntoIterator for &'a FrameMetrics {
    type Item = &'a FrameMetric;
    type IntoIter = std::slice::Iter<'a, FrameMetric>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl FromIterator<FrameMetric> for FrameMetrics {
    fn from_iter<I: IntoIterator<Item = FrameMetric>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Summary statistics for one score type. Variance and standard deviation
/// are sample (unbiased) estimates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub harmonic_mean: f64,
    pub stdev: f64,
    pub variance: f64,
}

impl Metric {
    #[must_use]
    pub fn from_samples(samples: &[f64]) -> Self {
        Self {
            min: Statistics::min(samples),
            max: Statistics::max(samples),
            mean: Statistics::mean(samples),
            harmonic_mean: Statistics::harmonic_mean(samples),
            stdev: Statistics::std_dev(samples),
            variance: Statistics::variance(samples),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateMetric {
    pub vmaf: Metric,
    pub psnr: Metric,
    pub ms_ssim: Metric,
}

impl AggregateMetric {
    #[must_use]
    pub const fn get(&self, kind: MetricKind) -> &Metric {
        match kind {
            MetricKind::Vmaf => &self.vmaf,
            MetricKind::Psnr => &self.psnr,
            MetricKind::MsSsim => &self.ms_ssim,
        }
    }
}

/// Pooled statistics as computed by libvmaf itself.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PooledMetric {
    #[serde(default)]
    pub min: f64,
    #[serde(default)]
    pub max: f64,
    #[serde(default)]
    pub mean: f64,
    #[serde(default)]
    pub harmonic_mean: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PooledMetrics {
    pub vmaf: PooledMetric,
    pub psnr: PooledMetric,
    pub ms_ssim: PooledMetric,
}

impl PooledMetrics {
    #[must_use]
    pub const fn get(&self, kind: MetricKind) -> &PooledMetric {
        match kind {
            MetricKind::Vmaf => &self.vmaf,
            MetricKind::Psnr => &self.psnr,
            MetricKind::MsSsim => &self.ms_ssim,
        }
    }
}

#[derive(Deserialize)]
struct RawReport {
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    frames: Option<Vec<RawFrame>>,
    #[serde(default)]
    pooled_metrics: Option<Map<String, Value>>,
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "frameNum", default)]
    frame_num: u64,
    #[serde(default)]
    metrics: Option<Map<String, Value>>,
}

/// A decoded libvmaf JSON log.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VmafReport {
    pub version: Option<String>,
    pub frames: FrameMetrics,
    pub pooled: PooledMetrics,
}

impl VmafReport {
    pub fn from_reader(mut reader: impl Read) -> anyhow::Result<Self> {
        let mut json = Vec::new();
        reader
            .read_to_end(&mut json)
            .context("Unable to read libvmaf log")?;

        if json.is_empty() {
            return Err(MetricsError::EmptyInput.into());
        }

        let raw: RawReport =
            serde_json::from_slice(&json).context("Unable to parse libvmaf JSON log")?;

        let frames = raw
            .frames
            .unwrap_or_default()
            .iter()
            .map(|frame| {
                frame.metrics.as_ref().map_or_else(
                    || FrameMetric {
                        frame_num: frame.frame_num,
                        ..FrameMetric::default()
                    },
                    |fields| FrameMetric {
                        frame_num: frame.frame_num,
                        vmaf: resolve_score(fields, MetricKind::Vmaf),
                        psnr: resolve_score(fields, MetricKind::Psnr),
                        ms_ssim: resolve_score(fields, MetricKind::MsSsim),
                    },
                )
            })
            .collect();

        let pooled = match &raw.pooled_metrics {
            Some(fields) => PooledMetrics {
                vmaf: resolve_pooled(fields, MetricKind::Vmaf)?,
                psnr: resolve_pooled(fields, MetricKind::Psnr)?,
                ms_ssim: resolve_pooled(fields, MetricKind::MsSsim)?,
            },
            None => PooledMetrics::default(),
        };

        Ok(Self {
            version: raw.version,
            frames,
            pooled,
        })
    }
}

fn resolve_pooled(fields: &Map<String, Value>, kind: MetricKind) -> anyhow::Result<PooledMetric> {
    resolve_alias(fields, kind)
        .filter(|value| !value.is_null())
        .map_or_else(
            || Ok(PooledMetric::default()),
            |value| {
                PooledMetric::deserialize(value)
                    .with_context(|| format!("Unable to parse pooled {kind} metrics"))
            },
        )
}
