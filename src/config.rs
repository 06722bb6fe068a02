use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::capture::DEFAULT_OUTPUT_LIMIT;
use crate::scheme::{output_base, Scheme};

#[derive(Clone, Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Path to the ffmpeg executable used for quality measurement
    #[arg(long, default_value = "ffmpeg")]
    pub ffmpeg: PathBuf,

    /// Path to the ffprobe executable used to read video metadata
    #[arg(long, default_value = "ffprobe")]
    pub ffprobe: PathBuf,

    /// libvmaf model file; quality measurement is skipped when omitted
    #[arg(long)]
    pub vmaf_model: Option<PathBuf>,

    /// ffmpeg arguments for quality measurement, split like a shell command.
    /// Supports {source}, {compressed}, {result}, {model} and {threads}
    #[arg(long, allow_hyphen_values = true)]
    pub vmaf_template: Option<String>,

    /// Number of encoder jobs to run at once
    #[arg(short, long, value_parser = clap::value_parser!(usize), default_value_t = 1)]
    pub workers: usize,

    /// Bytes of encoder output kept in memory per job
    #[arg(long, value_parser = clap::value_parser!(usize), default_value_t = DEFAULT_OUTPUT_LIMIT)]
    pub output_limit: usize,

    /// Name of the CSV report written to the output directory
    #[arg(long, default_value = "report.csv")]
    pub report_file_name: String,

    /// List the expanded jobs without running them
    #[arg(long)]
    pub dry_run: bool,

    /// Measure quality even when source and compressed frame counts differ
    #[arg(long)]
    pub skip_frame_count_check: bool,

    /// Plan file describing inputs and encoding schemes
    pub plan: PathBuf,

    /// Output directory, which must be empty or absent
    pub output_directory: PathBuf,
}

/// Source files and encoding schemes to evaluate, read from a JSON plan file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct PlanConfig {
    #[serde(default)]
    pub inputs: Vec<PathBuf>,
    #[serde(default)]
    pub schemes: Vec<Scheme>,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid plan: {}", .reasons.join("; "))]
pub struct PlanConfigError {
    pub reasons: Vec<String>,
}

impl PlanConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let file =
            File::open(path).with_context(|| format!("Unable to open plan file {path:?}"))?;

        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Unable to parse plan file {path:?}"))
    }

    /// Checks the plan against `output_directory`, reporting every problem at once.
    pub fn validate(&self, output_directory: &Path) -> Result<(), PlanConfigError> {
        let mut reasons = Vec::new();

        if self.inputs.is_empty() {
            reasons.push("no input files".to_owned());
        }

        let mut seen = HashSet::new();
        let mut unique = HashSet::new();
        for input in &self.inputs {
            if !seen.insert(input) {
                reasons.push(format!("duplicate input file {input:?}"));
            }
            if !input.is_file() {
                reasons.push(format!("input file {input:?} does not exist"));
            }
        }

        if self.schemes.is_empty() {
            reasons.push("no encoding schemes".to_owned());
        }

        for (index, scheme) in self.schemes.iter().enumerate() {
            if scheme.name.trim().is_empty() {
                reasons.push(format!("scheme #{index} has an empty name"));
            }
            if scheme.command_template.trim().is_empty() {
                reasons.push(format!("scheme {:?} has an empty command", scheme.name));
            }
        }

        // Distinct inputs or schemes can still normalize to the same files.
        let mut bases: HashMap<PathBuf, (&PathBuf, &str)> = HashMap::new();
        for (index, scheme) in self.schemes.iter().enumerate() {
            for input in &self.inputs {
                if !unique.insert((input, index)) {
                    continue;
                }

                let base = output_base(input, output_directory, &scheme.name);

                if let Some((other_input, other_scheme)) = bases.get(&base) {
                    reasons.push(format!(
                        "{input:?} with scheme {:?} and {other_input:?} with scheme {other_scheme:?} both write to {base:?}",
                        scheme.name
                    ));
                } else {
                    bases.insert(base, (input, &scheme.name));
                }
            }
        }

        if reasons.is_empty() {
            Ok(())
        } else {
            Err(PlanConfigError { reasons })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(directory: &Path, name: &str) -> PathBuf {
        let path = directory.join(name);
        std::fs::write(&path, b"").unwrap();
        path
    }

    #[test]
    fn loads_plan_file() {
        let directory = tempfile::tempdir().unwrap();
        let plan = directory.path().join("plan.json");
        std::fs::write(
            &plan,
            r#"{
                "inputs": ["a.mp4"],
                "schemes": [
                    {"name": "x264 fast", "command": "ffmpeg -i %INPUT% -preset fast %OUTPUT%.mp4"},
                    {"name": "two pass", "command": ["enc %INPUT% ", "-o %OUTPUT%.ivf"]}
                ]
            }"#,
        )
        .unwrap();

        let config = PlanConfig::load(&plan).unwrap();

        assert_eq!(config.inputs, vec![PathBuf::from("a.mp4")]);
        assert_eq!(config.schemes.len(), 2);
        assert_eq!(config.schemes[1].command_template, "enc %INPUT% -o %OUTPUT%.ivf");
    }

    #[test]
    fn load_reports_bad_json() {
        let directory = tempfile::tempdir().unwrap();
        let plan = directory.path().join("plan.json");
        std::fs::write(&plan, b"{\"inputs\": 3}").unwrap();

        assert!(PlanConfig::load(&plan).is_err());
        assert!(PlanConfig::load(&directory.path().join("missing.json")).is_err());
    }

    #[test]
    fn valid_plan_passes() {
        let directory = tempfile::tempdir().unwrap();
        let config = PlanConfig {
            inputs: vec![touch(directory.path(), "a.mp4"), touch(directory.path(), "b.mp4")],
            schemes: vec![
                Scheme::new("enc", "cmd %INPUT% %OUTPUT%.mp4"),
                Scheme::new("enc2", "cmd %INPUT% %OUTPUT%.mp4"),
            ],
        };

        config.validate(&directory.path().join("out")).unwrap();
    }

    #[test]
    fn collects_every_reason() {
        let directory = tempfile::tempdir().unwrap();
        let existing = touch(directory.path(), "a.mp4");
        let config = PlanConfig {
            inputs: vec![
                existing.clone(),
                existing,
                directory.path().join("missing.mp4"),
            ],
            schemes: vec![Scheme::new(" ", "")],
        };

        let error = config.validate(&directory.path().join("out")).unwrap_err();

        assert_eq!(error.reasons.len(), 4, "{:?}", error.reasons);
        assert!(error.to_string().starts_with("invalid plan: "));
    }

    #[test]
    fn empty_plan_is_invalid() {
        let error = PlanConfig::default().validate(Path::new("out")).unwrap_err();

        assert_eq!(error.reasons, vec!["no input files", "no encoding schemes"]);
    }

    #[test]
    fn rejects_colliding_output_files() {
        let directory = tempfile::tempdir().unwrap();
        let first = directory.path().join("one");
        let second = directory.path().join("two");
        std::fs::create_dir_all(&first).unwrap();
        std::fs::create_dir_all(&second).unwrap();

        let config = PlanConfig {
            inputs: vec![touch(&first, "clip.mp4"), touch(&second, "clip.mkv")],
            schemes: vec![Scheme::new("enc", "cmd %INPUT% %OUTPUT%.mp4")],
        };

        let error = config.validate(&directory.path().join("out")).unwrap_err();
        assert_eq!(error.reasons.len(), 1);

        let config = PlanConfig {
            inputs: vec![touch(&first, "clip.mp4")],
            schemes: vec![
                Scheme::new("fast preset", "cmd %INPUT% %OUTPUT%.mp4"),
                Scheme::new("fast_preset", "cmd %INPUT% %OUTPUT%.mp4"),
            ],
        };

        assert!(config.validate(&directory.path().join("out")).is_err());
    }
}
