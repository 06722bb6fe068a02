use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

pub const INPUT_PLACEHOLDER: &str = "%INPUT%";
pub const OUTPUT_PLACEHOLDER: &str = "%OUTPUT%";
pub const LOG_FILE_PLACEHOLDER: &str = "%LOGFILE%";

/// A named encoder command line with input, output and log file placeholders.
///
/// The name ends up in every generated file name, so it should work as part of
/// a naming scheme.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Scheme {
    pub name: String,

    #[serde(rename = "command", deserialize_with = "deserialize_command_template")]
    pub command_template: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CommandTemplate {
    Single(String),
    Fragments(Vec<String>),
}

fn deserialize_command_template<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match CommandTemplate::deserialize(deserializer)? {
        CommandTemplate::Single(command) => command,
        CommandTemplate::Fragments(fragments) => fragments.concat(),
    })
}

/// One concrete encoder invocation for a single source file.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Job {
    pub name: String,
    pub source_file: PathBuf,
    pub compressed_file: PathBuf,
    /// Diagnostic output captured from the encoder.
    pub output_file: PathBuf,
    /// Optional extra log file the encoder may write via `%LOGFILE%`.
    pub log_file: PathBuf,
    pub work_dir: PathBuf,
    pub cmd: String,
}

impl Scheme {
    #[must_use]
    pub fn new(name: &str, command_template: &str) -> Self {
        Self {
            name: name.to_owned(),
            command_template: command_template.to_owned(),
        }
    }

    /// Generates one job per source file, writing artifacts into `output_directory`.
    #[must_use]
    pub fn expand(&self, sources: &[PathBuf], output_directory: &Path) -> Vec<Job> {
        let work_dir = std::env::current_dir().unwrap_or_else(|err| {
            warn!("Unable to determine working directory for scheme {}: {err}", self.name);
            PathBuf::new()
        });

        let extension = compressed_extension(&self.command_template);

        sources
            .iter()
            .map(|source| {
                let base = output_base(source, output_directory, &self.name);

                let compressed_file = with_suffix(&base, extension);
                let output_file = with_suffix(&base, ".out");
                let log_file = with_suffix(&base, ".log");

                let cmd = self
                    .command_template
                    .replace(INPUT_PLACEHOLDER, &source.to_string_lossy())
                    .replace(OUTPUT_PLACEHOLDER, &base.to_string_lossy())
                    .replace(LOG_FILE_PLACEHOLDER, &log_file.to_string_lossy());

                Job {
                    name: self.name.clone(),
                    source_file: source.clone(),
                    compressed_file,
                    output_file,
                    log_file,
                    work_dir: work_dir.clone(),
                    cmd,
                }
            })
            .collect()
    }
}

fn normalize(value: &str) -> String {
    value.replace(' ', "_")
}

/// Shared base of every file derived from `source`, without extension.
#[must_use]
pub fn output_base(source: &Path, output_directory: &Path, scheme_name: &str) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();

    output_directory.join(format!("{}_{}", normalize(&stem), normalize(scheme_name)))
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut path = OsString::from(base.as_os_str());
    path.push(suffix);
    PathBuf::from(path)
}

/// Extension (including the dot) following the first output placeholder.
///
/// For chained extensions such as `%OUTPUT%.tar.gz` only the last one is used.
fn compressed_extension(template: &str) -> &str {
    let Some(index) = template.find(OUTPUT_PLACEHOLDER) else {
        return "";
    };

    let rest = template.get(index + OUTPUT_PLACEHOLDER.len()..).unwrap_or_default();
    let mut extension = "";
    let mut offset = 0;

    while rest.get(offset..).is_some_and(|tail| tail.starts_with('.')) {
        let word_length = rest
            .get(offset + 1..)
            .unwrap_or_default()
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
            .count();

        if word_length == 0 {
            break;
        }

        extension = rest.get(offset..=offset + word_length).unwrap_or_default();
        offset += word_length + 1;
    }

    extension
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sources(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn expands_one_job_per_source() {
        let scheme = Scheme::new("enc", "cmd %INPUT% %OUTPUT%.mp4");
        let jobs = scheme.expand(&sources(&["a.mp4", "b.mp4"]), Path::new("out"));

        let compressed: Vec<_> = jobs.iter().map(|job| job.compressed_file.clone()).collect();
        assert_eq!(
            compressed,
            vec![PathBuf::from("out/a_enc.mp4"), PathBuf::from("out/b_enc.mp4")]
        );
        assert_eq!(jobs[0].cmd, "cmd a.mp4 out/a_enc.mp4");
        assert_eq!(jobs[1].output_file, PathBuf::from("out/b_enc.out"));
        assert_eq!(jobs[1].log_file, PathBuf::from("out/b_enc.log"));
    }

    #[test]
    fn jobs_run_in_the_current_directory() {
        let scheme = Scheme::new("enc", "cmd %INPUT% %OUTPUT%.mp4");
        let jobs = scheme.expand(&sources(&["a.mp4", "b.mp4"]), Path::new("out"));

        let current = std::env::current_dir().unwrap();
        assert!(jobs.iter().all(|job| job.work_dir == current));
    }

    #[test]
    fn normalizes_spaces_in_names() {
        let scheme = Scheme::new("x264 param1 x", "ffmpeg -i %INPUT% -param1 x -y %OUTPUT%.mp4");
        let jobs = scheme.expand(&sources(&["videos/clip 01.mp4"]), Path::new("out"));

        assert_eq!(
            jobs[0].cmd,
            "ffmpeg -i videos/clip 01.mp4 -param1 x -y out/clip_01_x264_param1_x.mp4"
        );
        assert_eq!(jobs[0].output_file, PathBuf::from("out/clip_01_x264_param1_x.out"));
    }

    #[test]
    fn replaces_every_placeholder_occurrence() {
        let scheme = Scheme::new(
            "two pass",
            "enc -pass 1 -passlogfile %LOGFILE% %INPUT% && enc -pass 2 -passlogfile %LOGFILE% %INPUT% -o %OUTPUT%.mkv",
        );
        let jobs = scheme.expand(&sources(&["src/a.y4m"]), Path::new("o"));

        assert_eq!(
            jobs[0].cmd,
            "enc -pass 1 -passlogfile o/a_two_pass.log src/a.y4m && enc -pass 2 -passlogfile o/a_two_pass.log src/a.y4m -o o/a_two_pass.mkv"
        );
    }

    #[test]
    fn missing_placeholders_are_not_an_error() {
        let scheme = Scheme::new("noop", "true");
        let jobs = scheme.expand(&sources(&["a.mp4"]), Path::new("out"));

        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].cmd, "true");
        assert_eq!(jobs[0].compressed_file, PathBuf::from("out/a_noop"));
    }

    #[test]
    fn extension_detection() {
        assert_eq!(compressed_extension("x %OUTPUT%.mp4 y"), ".mp4");
        assert_eq!(compressed_extension("x %OUTPUT% y"), "");
        assert_eq!(compressed_extension("x %OUTPUT%"), "");
        assert_eq!(compressed_extension("x %OUTPUT%.tar.gz"), ".gz");
        assert_eq!(compressed_extension("x %OUTPUT%. y"), "");
        assert_eq!(compressed_extension("x %OUTPUT%.h265_stream"), ".h265_stream");
        assert_eq!(compressed_extension("a %OUTPUT% b %OUTPUT%.mp4"), "");
    }

    #[test]
    fn deserializes_fragmented_commands() {
        let scheme: Scheme = serde_json::from_str(
            r#"{"name": "enc", "command": ["ffmpeg -i %INPUT% ", "-c:v libx264 ", "%OUTPUT%.mp4"]}"#,
        )
        .unwrap();

        assert_eq!(scheme.command_template, "ffmpeg -i %INPUT% -c:v libx264 %OUTPUT%.mp4");

        let scheme: Scheme =
            serde_json::from_str(r#"{"name": "enc", "command": "cmd %OUTPUT%"}"#).unwrap();
        assert_eq!(scheme.command_template, "cmd %OUTPUT%");
    }

    proptest::proptest! {
        #[test]
        fn derived_files_share_a_base(
            stems in proptest::collection::vec("[a-z0-9 ]{1,12}", 0..8),
            name in "[a-z0-9 ]{1,12}",
        ) {
            let sources: Vec<PathBuf> = stems.iter().map(|stem| PathBuf::from(format!("in/{stem}.y4m"))).collect();
            let jobs = Scheme::new(&name, "enc %INPUT% -o %OUTPUT%.ivf").expand(&sources, Path::new("out"));

            proptest::prop_assert_eq!(jobs.len(), sources.len());

            for job in &jobs {
                let base = job.compressed_file.with_extension("");
                proptest::prop_assert_eq!(job.output_file.with_extension(""), base.clone());
                proptest::prop_assert_eq!(job.log_file.with_extension(""), base);
            }
        }
    }
}
