use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context};
use indicatif::ProgressBar;
use tracing::{error, info, info_span, Span};

pub mod capture;
pub mod config;
pub mod encoder;
pub mod ffmpeg;
pub mod metrics;
pub mod process;
pub mod report;
pub mod scheme;
pub mod store;
pub mod util;
pub mod vqm;

use config::{Config, PlanConfig};
use encoder::{Plan, PlanResult};
use ffmpeg::{Ffprobe, MetadataProbe};
use scheme::Job;
use store::{Record, RecordId, Store};
use vqm::{VmafConfig, VmafTool};

/// Location of the flat per-frame scores for a compressed file.
#[must_use]
pub fn frame_metrics_file_for(compressed_file: &Path) -> PathBuf {
    let stem = compressed_file
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();

    compressed_file.with_file_name(format!("{stem}_frame_metrics.json"))
}

#[allow(clippy::print_stdout)]
fn print_jobs(jobs: &[Job]) {
    for job in jobs {
        println!("[{}] {:?} -> {:?}", job.name, job.source_file, job.compressed_file);
        println!("    {}", job.cmd);
    }
}

fn log_failures(result: &PlanResult, span: &Span) {
    for failure in result.failures() {
        let exit_code = failure
            .exit_code()
            .map_or_else(|| "none".to_owned(), |code| code.to_string());

        error!(
            parent: span,
            "Encoding {:?} with scheme {:?} failed (exit code {exit_code}, output in {:?})",
            failure.job.source_file,
            failure.job.name,
            failure.job.output_file
        );

        for err in failure.errors().into_iter().flat_map(encoder::JobErrors::iter) {
            error!(parent: span, "    {err:#}");
        }
    }
}

/// Quality tool settings shared by every record. The result file is set per
/// record.
fn vmaf_config(config: &Config, model: &Path) -> anyhow::Result<VmafConfig> {
    let vmaf_config = VmafConfig::new(&config.ffmpeg, model, Path::new(""));

    match &config.vmaf_template {
        Some(template) => vmaf_config
            .with_template(template)
            .context("Invalid quality tool template"),
        None => Ok(vmaf_config),
    }
}

fn measure_record(
    store: &Store,
    id: RecordId,
    config: &Config,
    vmaf_config: &VmafConfig,
    probe: &dyn MetadataProbe,
    span: &Span,
) -> anyhow::Result<()> {
    let mut record = store.get(id)?;

    let result_file = vqm::result_file_for(&record.compressed_file);
    let vmaf_config = VmafConfig {
        result_file: result_file.clone(),
        ..vmaf_config.clone()
    };
    let mut tool = VmafTool::new(&vmaf_config, &record.compressed_file, &record.source_file)?
        .with_span(span.clone());

    tool.measure((!config.skip_frame_count_check).then_some(probe))
        .with_context(|| format!("Unable to measure quality of {:?}", record.compressed_file))?;

    let measurement = tool.metrics()?;

    let frame_metrics_file = frame_metrics_file_for(&record.compressed_file);
    let mut json = Vec::new();
    measurement.frames.to_json(&mut json)?;
    std::fs::write(&frame_metrics_file, json)
        .with_context(|| format!("Unable to write frame metrics to {frame_metrics_file:?}"))?;

    record.apply_metrics(&measurement.aggregate, &result_file, &frame_metrics_file);
    store.update(id, record)?;

    Ok(())
}

fn measure_all(
    store: &Store,
    config: &Config,
    vmaf_config: &VmafConfig,
    span: &Span,
) -> anyhow::Result<usize> {
    let probe = Ffprobe::new(&config.ffprobe);
    let mut ids = store.ids();
    ids.sort();

    let progress_bar = ProgressBar::new(ids.len().try_into().unwrap_or(u64::MAX));
    progress_bar.set_style(
        util::create_progress_style(
            "{spinner:.green} [{elapsed_precise}] Measuring quality... [{wide_bar:.cyan/blue}] {pos:>4}/{len:4} (ETA: {smooth_eta}) {msg}",
        )
        .context("Unable to create measurement progress bar style")?,
    );
    progress_bar.enable_steady_tick(Duration::from_secs(1));

    let mut failures = 0;

    for id in ids {
        if let Err(err) = measure_record(store, id, config, vmaf_config, &probe, span) {
            error!(parent: span, "Quality measurement of record {id} failed: {err:#}");
            failures += 1;
        }

        progress_bar.inc(1);
    }

    progress_bar.finish_and_clear();

    Ok(failures)
}

pub fn run(config: &Config) -> anyhow::Result<()> {
    let span = info_span!("evaluate", plan = %config.plan.display());

    let plan_config = PlanConfig::load(&config.plan)?;
    plan_config
        .validate(&config.output_directory)
        .context("Plan file failed validation")?;

    let vmaf_config = config
        .vmaf_model
        .as_deref()
        .map(|model| vmaf_config(config, model))
        .transpose()?;

    if util::is_non_empty_directory(&config.output_directory) {
        return Err(anyhow!(
            "Output directory {:?} is not empty",
            config.output_directory
        ));
    }

    let mut plan = Plan::new(
        &plan_config.schemes,
        &plan_config.inputs,
        &config.output_directory,
    )
    .with_probe(Box::new(Ffprobe::new(&config.ffprobe)))
    .with_output_limit(config.output_limit)
    .with_span(span.clone())
    .with_progress(true);

    if config.dry_run {
        print_jobs(plan.jobs());
        return Ok(());
    }

    let result = plan
        .run_with_workers(config.workers)
        .context("Unable to execute encoding plan")?;

    info!(
        parent: &span,
        "Ran {} jobs in {}",
        result.run_results.len(),
        util::HumanSeconds(result.elapsed())
    );

    log_failures(&result, &span);

    let store = Store::new();
    for record in result.run_results.iter().filter_map(Record::from_run_result) {
        store.insert(record);
    }

    let measurement_failures = match &vmaf_config {
        Some(vmaf_config) => measure_all(&store, config, vmaf_config, &span)?,
        None => 0,
    };

    let records = store.sorted_records();
    let report_file = config.output_directory.join(&config.report_file_name);
    report::write_csv(&records, &report_file)?;
    info!(parent: &span, "Wrote report to {report_file:?}");

    report::print_summary(&records);

    result.ensure_success()?;

    if measurement_failures > 0 {
        return Err(anyhow!(
            "Quality measurement failed for {measurement_failures} encodes"
        ));
    }

    Ok(())
}
