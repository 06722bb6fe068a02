use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{anyhow, Context};
use tracing::{debug, info, warn, Span};

use crate::ffmpeg::MetadataProbe;
use crate::metrics::{AggregateMetric, FrameMetrics, MetricKind, PooledMetrics, VmafReport};

/// Upper bound on libvmaf worker threads.
pub const MAX_VMAF_THREADS: usize = 32;

/// Arguments passed to ffmpeg to score a compressed file against its source.
pub const DEFAULT_VMAF_TEMPLATE: [&str; 10] = [
    "-hide_banner",
    "-i",
    "{compressed}",
    "-i",
    "{source}",
    "-lavfi",
    "libvmaf=n_subsample=1:log_path={result}:feature=name=psnr:log_fmt=json:model=path={model}:n_threads={threads}",
    "-f",
    "null",
    "-",
];

/// Placeholders understood in a quality tool template.
pub const TEMPLATE_PLACEHOLDERS: [&str; 5] = ["source", "compressed", "result", "model", "threads"];

#[derive(Debug, thiserror::Error)]
pub enum VqmError {
    #[error("measure() already executed")]
    AlreadyExecuted,

    #[error("metrics() depends on measure() called first")]
    NotMeasured,

    #[error("unknown placeholder {{{0}}} in quality tool template")]
    UnknownPlaceholder(String),

    #[error("frame count mismatch: source {source_frames} != compressed {compressed_frames}")]
    FrameCountMismatch {
        source_frames: u64,
        compressed_frames: u64,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VqmState {
    Created,
    Measuring,
    Measured,
}

#[derive(Clone, Debug)]
pub struct VmafConfig {
    pub ffmpeg_path: PathBuf,
    pub model_path: PathBuf,
    /// Argument list with `{source}`, `{compressed}`, `{result}`, `{model}`
    /// and `{threads}` placeholders.
    pub template: Vec<String>,
    pub result_file: PathBuf,
}

impl VmafConfig {
    #[must_use]
    pub fn new(ffmpeg_path: &Path, model_path: &Path, result_file: &Path) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.to_path_buf(),
            model_path: model_path.to_path_buf(),
            template: DEFAULT_VMAF_TEMPLATE.iter().map(|&arg| arg.to_owned()).collect(),
            result_file: result_file.to_path_buf(),
        }
    }

    /// Replaces the argument list with `template`, split the way a POSIX
    /// shell would split it.
    pub fn with_template(mut self, template: &str) -> anyhow::Result<Self> {
        let args = shlex::split(template)
            .ok_or_else(|| anyhow!("Unable to split quality tool template {template:?}"))?;

        if args.is_empty() {
            return Err(anyhow!("Quality tool template is empty"));
        }

        self.template = args;
        self.validate()?;

        Ok(self)
    }

    /// Fails on the first `{name}` token that is not a known placeholder.
    pub fn validate(&self) -> Result<(), VqmError> {
        for arg in &self.template {
            if let Some(name) = placeholders(arg).find(|name| !TEMPLATE_PLACEHOLDERS.contains(name)) {
                return Err(VqmError::UnknownPlaceholder(name.to_owned()));
            }
        }

        Ok(())
    }
}

/// Names of the `{name}` tokens in `arg`. Braces around anything other than
/// letters, digits and underscores are left alone.
fn placeholders(arg: &str) -> impl Iterator<Item = &str> {
    arg.split('{').skip(1).filter_map(|rest| {
        let name = rest.split_once('}')?.0;
        let is_name = !name.is_empty()
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');

        is_name.then_some(name)
    })
}

/// Location of the libvmaf log for a compressed file: `clip_enc.mp4` becomes
/// `clip_enc_vqm.json`.
#[must_use]
pub fn result_file_for(compressed_file: &Path) -> PathBuf {
    let stem = compressed_file
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();

    compressed_file.with_file_name(format!("{stem}_vqm.json"))
}

/// Scores from a completed measurement.
#[derive(Clone, Debug, PartialEq)]
pub struct Measurement {
    pub frames: FrameMetrics,
    /// Statistics recomputed from `frames`.
    pub aggregate: AggregateMetric,
    /// Statistics as reported by libvmaf.
    pub pooled: PooledMetrics,
}

/// One libvmaf run comparing a compressed file with its source.
///
/// `measure` may be called once. A failed measurement is not retried.
#[derive(Debug)]
pub struct VmafTool {
    executable: PathBuf,
    args: Vec<String>,
    source_file: PathBuf,
    compressed_file: PathBuf,
    result_file: PathBuf,
    output: Vec<u8>,
    state: VqmState,
    span: Span,
}

impl VmafTool {
    pub fn new(
        config: &VmafConfig,
        compressed_file: &Path,
        source_file: &Path,
    ) -> anyhow::Result<Self> {
        config
            .validate()
            .context("Unable to render quality tool template")?;

        let threads = num_cpus::get().min(MAX_VMAF_THREADS).to_string();
        let source = source_file.to_string_lossy();
        let compressed = compressed_file.to_string_lossy();
        let result = config.result_file.to_string_lossy();
        let model = config.model_path.to_string_lossy();

        let args = config
            .template
            .iter()
            .map(|arg| {
                arg.replace("{source}", &source)
                    .replace("{compressed}", &compressed)
                    .replace("{result}", &result)
                    .replace("{model}", &model)
                    .replace("{threads}", &threads)
            })
            .collect();

        Ok(Self {
            executable: config.ffmpeg_path.clone(),
            args,
            source_file: source_file.to_path_buf(),
            compressed_file: compressed_file.to_path_buf(),
            result_file: config.result_file.clone(),
            output: Vec::new(),
            state: VqmState::Created,
            span: Span::current(),
        })
    }

    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    #[must_use]
    pub const fn state(&self) -> VqmState {
        self.state
    }

    #[must_use]
    pub fn result_file(&self) -> &Path {
        &self.result_file
    }

    /// Combined stdout and stderr of the tool run.
    #[must_use]
    pub fn output(&self) -> &[u8] {
        &self.output
    }

    /// Runs the scoring tool. When `probe` is given, the source and compressed
    /// files must have the same frame count.
    pub fn measure(&mut self, probe: Option<&dyn MetadataProbe>) -> anyhow::Result<()> {
        if self.state != VqmState::Created {
            return Err(VqmError::AlreadyExecuted.into());
        }

        self.state = VqmState::Measuring;

        if let Some(probe) = probe {
            self.check_frame_counts(probe)?;
        }

        debug!(parent: &self.span, "Quality tool command: {:?} {:?}", self.executable, self.args);

        let result = Command::new(&self.executable)
            .args(&self.args)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("Unable to spawn quality tool {:?}", self.executable))?;

        self.output = result.stdout;
        self.output.extend_from_slice(&result.stderr);

        if !result.status.success() {
            info!(parent: &self.span, "Quality tool failed: {:?} {:?}", self.executable, self.args);
            info!(
                parent: &self.span,
                "Quality tool output:\n{}",
                String::from_utf8_lossy(&self.output)
            );

            return Err(anyhow!(
                "Quality tool exited with status {} while comparing {:?} to {:?}",
                result.status,
                self.compressed_file,
                self.source_file
            ));
        }

        self.state = VqmState::Measured;
        info!(parent: &self.span, "Measured {:?}", self.compressed_file);

        Ok(())
    }

    fn check_frame_counts(&self, probe: &dyn MetadataProbe) -> anyhow::Result<()> {
        let source = probe
            .probe(&self.source_file)
            .with_context(|| format!("Unable to read metadata of source {:?}", self.source_file))?;

        let compressed = probe.probe(&self.compressed_file).with_context(|| {
            format!(
                "Unable to read metadata of compressed file {:?}",
                self.compressed_file
            )
        })?;

        if source.frame_count != compressed.frame_count {
            return Err(VqmError::FrameCountMismatch {
                source_frames: source.frame_count,
                compressed_frames: compressed.frame_count,
            }
            .into());
        }

        Ok(())
    }

    /// Decodes the tool report and summarizes it.
    pub fn metrics(&self) -> anyhow::Result<Measurement> {
        if self.state != VqmState::Measured {
            return Err(VqmError::NotMeasured.into());
        }

        let file = File::open(&self.result_file)
            .with_context(|| format!("Unable to open quality report {:?}", self.result_file))?;

        let report = VmafReport::from_reader(BufReader::new(file))
            .with_context(|| format!("Unable to parse quality report {:?}", self.result_file))?;

        let aggregate = report
            .frames
            .aggregate()
            .with_context(|| format!("Unable to aggregate scores from {:?}", self.result_file))?;

        for kind in [MetricKind::Vmaf, MetricKind::Psnr, MetricKind::MsSsim] {
            let computed = aggregate.get(kind);
            let pooled = report.pooled.get(kind);

            debug!(
                parent: &self.span,
                "{kind} mean: computed {:.4}, reported {:.4}; harmonic mean: computed {:.4}, reported {:.4}",
                computed.mean,
                pooled.mean,
                computed.harmonic_mean,
                pooled.harmonic_mean
            );

            if pooled.mean != 0.0 && (computed.mean - pooled.mean).abs() > 1e-3 * pooled.mean.abs() {
                warn!(
                    parent: &self.span,
                    "{kind} mean {:.4} differs from the value reported by libvmaf ({:.4})",
                    computed.mean,
                    pooled.mean
                );
            }
        }

        Ok(Measurement {
            frames: report.frames,
            aggregate,
            pooled: report.pooled,
        })
    }
}
