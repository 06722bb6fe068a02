use std::borrow::Cow;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use anyhow::{anyhow, Context};
use crossbeam_queue::ArrayQueue;
use indicatif::ProgressBar;
use tracing::{debug, info, info_span, warn, Span};

use crate::capture::{OutputTee, DEFAULT_OUTPUT_LIMIT};
use crate::ffmpeg::{Ffprobe, MetadataProbe};
use crate::process::{ProcessRunner, SystemRunner};
use crate::scheme::{Job, Scheme};
use crate::util::{create_progress_style, verify_directory};

/// Resources consumed by one encoder run. `max_rss` is in KiB.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UsageStat {
    pub system_time: Duration,
    pub user_time: Duration,
    pub elapsed: Duration,
    pub max_rss: i64,
}

impl UsageStat {
    /// CPU time as a percentage of wall time. Multithreaded encoders exceed 100.
    #[must_use]
    pub fn cpu_percent(&self) -> f64 {
        let elapsed = self.elapsed.as_secs_f64();

        if elapsed > 0.0 {
            (self.system_time + self.user_time).as_secs_f64() / elapsed * 100.0
        } else {
            0.0
        }
    }
}

/// Properties of a successfully produced compressed file.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Encoded {
    /// Seconds of video in the compressed file.
    pub video_duration: f64,
    /// Seconds of video encoded per second of wall time.
    pub avg_encoding_speed: f64,
}

/// Everything that went wrong with one job. Never empty.
#[derive(Debug)]
pub struct JobErrors {
    first: anyhow::Error,
    rest: Vec<anyhow::Error>,
}

impl JobErrors {
    #[must_use]
    pub const fn new(error: anyhow::Error) -> Self {
        Self {
            first: error,
            rest: Vec::new(),
        }
    }

    /// Returns `None` when there is nothing to report.
    #[must_use]
    pub fn from_vec(errors: Vec<anyhow::Error>) -> Option<Self> {
        let mut errors = errors.into_iter();
        let first = errors.next()?;

        Some(Self {
            first,
            rest: errors.collect(),
        })
    }

    pub fn push(&mut self, error: anyhow::Error) {
        self.rest.push(error);
    }

    pub fn iter(&self) -> impl Iterator<Item = &anyhow::Error> {
        std::iter::once(&self.first).chain(self.rest.iter())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rest.len() + 1
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }
}

impl std::fmt::Display for JobErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for (index, error) in self.iter().enumerate() {
            if index > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{error:#}")?;
        }

        Ok(())
    }
}

impl std::error::Error for JobErrors {}

/// The result of executing one job.
#[derive(Debug)]
pub struct RunResult {
    pub job: Job,
    pub outcome: Result<Encoded, JobErrors>,
    /// Missing when the encoder could not be started or waited for.
    pub usage: Option<UsageStat>,
    /// Captured diagnostic output, at most the configured output limit.
    pub output: Vec<u8>,
    pub output_truncated: bool,
    exit_code: Option<i32>,
}

impl RunResult {
    fn failed(job: &Job, error: anyhow::Error) -> Self {
        Self {
            job: job.clone(),
            outcome: Err(JobErrors::new(error)),
            usage: None,
            output: Vec::new(),
            output_truncated: false,
            exit_code: None,
        }
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    #[must_use]
    pub fn encoded(&self) -> Option<&Encoded> {
        self.outcome.as_ref().ok()
    }

    #[must_use]
    pub fn errors(&self) -> Option<&JobErrors> {
        self.outcome.as_ref().err()
    }

    /// Exit code of the encoder, if it ran and was not killed by a signal.
    #[must_use]
    pub const fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    #[must_use]
    pub fn output_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.output)
    }
}

/// Collaborators shared by every job of a plan.
pub struct RunContext<'a> {
    pub runner: &'a dyn ProcessRunner,
    pub probe: &'a dyn MetadataProbe,
    pub output_limit: usize,
    pub span: Span,
}

impl Job {
    /// Executes the encoder command. Failures are recorded in the result.
    pub fn run(&self, context: &RunContext<'_>) -> RunResult {
        let span = info_span!(
            parent: &context.span,
            "job",
            name = %self.name,
            source = %self.source_file.display()
        );

        info!(parent: &span, "Start encoding {:?} -> {:?}", self.source_file, self.compressed_file);
        debug!(parent: &span, "Encoder command: {}", self.cmd);

        let file = match File::create(&self.output_file) {
            Ok(file) => file,
            Err(err) => {
                return RunResult::failed(
                    self,
                    anyhow::Error::from(err)
                        .context(format!("Unable to create output file {:?}", self.output_file)),
                );
            }
        };

        let mut tee = OutputTee::new(BufWriter::new(file), context.output_limit, span.clone());
        let mut errors = Vec::new();

        let start = Instant::now();
        let outcome = context.runner.run_shell(&self.cmd, &self.work_dir, &mut tee);
        let elapsed = start.elapsed();

        if let Err(err) = tee.flush() {
            errors.push(
                anyhow::Error::from(err)
                    .context(format!("Unable to write output file {:?}", self.output_file)),
            );
        }

        let (output, output_truncated) = tee.into_parts();

        let (usage, exit_code) = match outcome {
            Ok(outcome) => {
                if !outcome.status.success() {
                    errors.push(anyhow!("Encoder exited with {}", outcome.status));
                }

                if let Some(err) = outcome.capture_error {
                    errors.push(anyhow::Error::from(err).context("Unable to capture encoder output"));
                }

                let usage = UsageStat {
                    system_time: outcome.usage.system_time,
                    user_time: outcome.usage.user_time,
                    elapsed,
                    max_rss: outcome.usage.max_rss,
                };

                (Some(usage), outcome.status.code())
            }
            Err(err) => {
                errors.push(err.context("Unable to run encoder command"));
                (None, None)
            }
        };

        // Every encoder that ran gets its artifact probed, even after a failure.
        let encoded = if usage.is_some() {
            match self.probe_encoded(context.probe, elapsed) {
                Ok(encoded) => Some(encoded),
                Err(err) => {
                    errors.push(err);
                    None
                }
            }
        } else {
            None
        };

        let outcome = match (JobErrors::from_vec(errors), encoded) {
            (Some(errors), _) => Err(errors),
            (None, Some(encoded)) => Ok(encoded),
            (None, None) => Err(JobErrors::new(anyhow!("BUG: Encoder ran without a recorded outcome"))),
        };

        match &outcome {
            Ok(encoded) => info!(
                parent: &span,
                "Done encoding {:?} ({:.2}x realtime)",
                self.compressed_file,
                encoded.avg_encoding_speed
            ),
            Err(errors) => warn!(parent: &span, "Encoding {:?} failed: {errors}", self.compressed_file),
        }

        RunResult {
            job: self.clone(),
            outcome,
            usage,
            output,
            output_truncated,
            exit_code,
        }
    }

    fn probe_encoded(&self, probe: &dyn MetadataProbe, elapsed: Duration) -> anyhow::Result<Encoded> {
        let metadata = probe.probe(&self.compressed_file).with_context(|| {
            format!("Unable to read metadata of compressed file {:?}", self.compressed_file)
        })?;

        let seconds = elapsed.as_secs_f64();
        let avg_encoding_speed = if seconds > 0.0 {
            metadata.duration / seconds
        } else {
            0.0
        };

        Ok(Encoded {
            video_duration: metadata.duration,
            avg_encoding_speed,
        })
    }
}

/// Outcome of running every job of a plan, aligned with [`Plan::jobs`].
#[derive(Debug)]
pub struct PlanResult {
    pub start_time: SystemTime,
    pub end_time: SystemTime,
    pub run_results: Vec<RunResult>,
}

impl PlanResult {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.run_results.iter().all(RunResult::is_success)
    }

    pub fn failures(&self) -> impl Iterator<Item = &RunResult> {
        self.run_results.iter().filter(|result| !result.is_success())
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.end_time
            .duration_since(self.start_time)
            .unwrap_or_default()
    }

    pub fn ensure_success(&self) -> anyhow::Result<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(anyhow!("Plan run executed with errors"))
        }
    }
}

/// A list of jobs and everything needed to execute them.
pub struct Plan {
    jobs: Vec<Job>,
    output_directory: PathBuf,
    output_directory_created: bool,
    runner: Box<dyn ProcessRunner>,
    probe: Box<dyn MetadataProbe>,
    output_limit: usize,
    span: Span,
    progress: bool,
}

impl Plan {
    /// Expands every scheme over every input, schemes first.
    #[must_use]
    pub fn new(schemes: &[Scheme], inputs: &[PathBuf], output_directory: &Path) -> Self {
        let jobs = schemes
            .iter()
            .flat_map(|scheme| scheme.expand(inputs, output_directory))
            .collect();

        Self::from_jobs(jobs, output_directory)
    }

    #[must_use]
    pub fn from_jobs(jobs: Vec<Job>, output_directory: &Path) -> Self {
        Self {
            jobs,
            output_directory: output_directory.to_path_buf(),
            output_directory_created: false,
            runner: Box::new(SystemRunner),
            probe: Box::new(Ffprobe::default()),
            output_limit: DEFAULT_OUTPUT_LIMIT,
            span: Span::current(),
            progress: false,
        }
    }

    #[must_use]
    pub fn with_runner(mut self, runner: Box<dyn ProcessRunner>) -> Self {
        self.runner = runner;
        self
    }

    #[must_use]
    pub fn with_probe(mut self, probe: Box<dyn MetadataProbe>) -> Self {
        self.probe = probe;
        self
    }

    #[must_use]
    pub const fn with_output_limit(mut self, output_limit: usize) -> Self {
        self.output_limit = output_limit;
        self
    }

    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    #[must_use]
    pub const fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    #[must_use]
    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    fn ensure_output_directory(&mut self) -> anyhow::Result<()> {
        if self.output_directory_created {
            return Ok(());
        }

        debug!(parent: &self.span, "Creating output directory {:?}", self.output_directory);

        verify_directory(&self.output_directory).with_context(|| {
            format!("Unable to create output directory {:?}", self.output_directory)
        })?;

        self.output_directory_created = true;

        Ok(())
    }

    fn context(&self) -> RunContext<'_> {
        RunContext {
            runner: self.runner.as_ref(),
            probe: self.probe.as_ref(),
            output_limit: self.output_limit,
            span: self.span.clone(),
        }
    }

    fn progress_bar(&self) -> anyhow::Result<ProgressBar> {
        if !self.progress {
            return Ok(ProgressBar::hidden());
        }

        let progress_bar = ProgressBar::new(self.jobs.len().try_into().unwrap_or(u64::MAX));

        progress_bar.set_style(
            create_progress_style(
                "{spinner:.green} [{elapsed_precise}] Encoding... [{wide_bar:.cyan/blue}] {pos:>4}/{len:4} ({smooth_per_min} jobs/min, ETA: {smooth_eta}) {msg}",
            )
            .context("Unable to create encoding progress bar style")?,
        );
        progress_bar.enable_steady_tick(Duration::from_secs(1));

        Ok(progress_bar)
    }

    /// Runs every job in order on the calling thread.
    pub fn run(&mut self) -> anyhow::Result<PlanResult> {
        self.ensure_output_directory()?;

        let start_time = SystemTime::now();
        let progress_bar = self.progress_bar()?;
        let context = self.context();

        let run_results = self
            .jobs
            .iter()
            .map(|job| {
                progress_bar.set_message(job.name.clone());
                let result = job.run(&context);
                progress_bar.inc(1);
                result
            })
            .collect();

        progress_bar.finish_and_clear();

        Ok(PlanResult {
            start_time,
            end_time: SystemTime::now(),
            run_results,
        })
    }

    /// Runs jobs on up to `workers` threads. Results keep the job order.
    pub fn run_with_workers(&mut self, workers: usize) -> anyhow::Result<PlanResult> {
        if workers <= 1 || self.jobs.len() <= 1 {
            return self.run();
        }

        self.ensure_output_directory()?;

        let start_time = SystemTime::now();
        let progress_bar = self.progress_bar()?;
        let context = self.context();

        let job_queue: ArrayQueue<(usize, &Job)> = ArrayQueue::new(self.jobs.len());
        let result_queue: ArrayQueue<(usize, RunResult)> = ArrayQueue::new(self.jobs.len());

        for entry in self.jobs.iter().enumerate() {
            if job_queue.push(entry).is_err() {
                return Err(anyhow!("Encoding job queue was unexpectedly full"));
            }
        }

        std::thread::scope(|scope| -> anyhow::Result<()> {
            let threads = (0..workers.min(self.jobs.len()))
                .map(|_| {
                    scope.spawn(|| -> anyhow::Result<()> {
                        while let Some((index, job)) = job_queue.pop() {
                            let result = job.run(&context);
                            progress_bar.inc(1);

                            if result_queue.push((index, result)).is_err() {
                                return Err(anyhow!("Encoding result queue was unexpectedly full"));
                            }
                        }

                        Ok(())
                    })
                })
                .collect::<Vec<_>>();

            for thread in threads {
                match thread.join() {
                    Ok(result) => result.context("Unable to run encoding worker")?,
                    Err(error) => {
                        return Err(anyhow!("Encoding worker panicked: {:?}", error));
                    }
                }
            }

            Ok(())
        })
        .context("Unable to execute encoding workers")?;

        progress_bar.finish_and_clear();

        let mut slots: Vec<Option<RunResult>> = self.jobs.iter().map(|_| None).collect();

        while let Some((index, result)) = result_queue.pop() {
            if let Some(slot) = slots.get_mut(index) {
                *slot = Some(result);
            }
        }

        let run_results = slots
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| anyhow!("BUG: Missing encoding results after joining workers"))?;

        Ok(PlanResult {
            start_time,
            end_time: SystemTime::now(),
            run_results,
        })
    }
}
