use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{anyhow, Context};
use cached::proc_macro::cached;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

/// Stream and container properties of a video file.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Metadata {
    pub codec_name: String,
    /// Frame rate as reported by the container, e.g. `30000/1001`.
    pub frame_rate: String,
    pub duration: f64,
    pub width: u32,
    pub height: u32,
    pub bit_rate: u64,
    pub frame_count: u64,
}

impl Metadata {
    /// Frame rate as a number, if the reported fraction is usable.
    #[must_use]
    pub fn frames_per_second(&self) -> Option<f64> {
        let (numerator, denominator) = self
            .frame_rate
            .split_once('/')
            .unwrap_or((self.frame_rate.as_str(), "1"));

        let numerator: f64 = numerator.trim().parse().ok()?;
        let denominator: f64 = denominator.trim().parse().ok()?;

        (denominator != 0.0).then_some(numerator / denominator)
    }
}

/// Source of video metadata.
pub trait MetadataProbe: Send + Sync {
    fn probe(&self, path: &Path) -> anyhow::Result<Metadata>;
}

/// Queries metadata by running an `ffprobe` executable.
#[derive(Clone, Debug)]
pub struct Ffprobe {
    executable: PathBuf,
}

impl Ffprobe {
    #[must_use]
    pub fn new(executable: &Path) -> Self {
        Self {
            executable: executable.to_path_buf(),
        }
    }
}

impl Default for Ffprobe {
    fn default() -> Self {
        Self::new(Path::new("ffprobe"))
    }
}

impl MetadataProbe for Ffprobe {
    fn probe(&self, path: &Path) -> anyhow::Result<Metadata> {
        probe_file(&self.executable, path)
    }
}

fn cache_key(executable: &Path, path: &Path) -> String {
    let stamp = std::fs::metadata(path)
        .map(|metadata| format!("{}:{:?}", metadata.len(), metadata.modified().ok()))
        .unwrap_or_default();

    format!("{}|{}|{stamp}", executable.to_string_lossy(), path.to_string_lossy())
}

#[cached(
    result = true,
    key = "String",
    convert = r#"{ cache_key(executable, path) }"#
)]
fn probe_file(executable: &Path, path: &Path) -> anyhow::Result<Metadata> {
    if !path.exists() {
        return Err(anyhow!("Video file {path:?} does not exist"));
    }

    let output = Command::new(executable)
        .args([
            "-v",
            "quiet",
            "-select_streams",
            "v:0",
            "-count_packets",
            "-of",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("Unable to spawn {executable:?}"))?;

    if !output.status.success() {
        return Err(anyhow!(
            "ffprobe exited with status {} for {path:?}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        ));
    }

    let metadata = parse_probe_output(&output.stdout)
        .with_context(|| format!("Unable to parse ffprobe output for {path:?}"))?;

    debug!("Metadata for {path:?}: {metadata:?}");

    Ok(metadata)
}

#[derive(Deserialize, Default)]
struct ProbeEntry {
    codec_name: Option<String>,
    r_frame_rate: Option<String>,
    #[serde(default, deserialize_with = "number_or_string")]
    duration: Option<f64>,
    width: Option<u32>,
    height: Option<u32>,
    #[serde(default, deserialize_with = "number_or_string")]
    bit_rate: Option<f64>,
    #[serde(default, deserialize_with = "number_or_string")]
    nb_frames: Option<f64>,
    #[serde(default, deserialize_with = "number_or_string")]
    nb_read_packets: Option<f64>,
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeEntry>,
    #[serde(default)]
    format: ProbeEntry,
}

/// ffprobe prints most numbers as strings, and "N/A" when unknown.
fn number_or_string<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Number(value)) => Some(value),
        Some(Raw::Text(text)) => text.trim().parse().ok(),
        None => None,
    })
}

#[allow(clippy::as_conversions)]
#[allow(clippy::cast_possible_truncation)]
#[allow(clippy::cast_sign_loss)]
pub fn parse_probe_output(json: &[u8]) -> anyhow::Result<Metadata> {
    let output: ProbeOutput =
        serde_json::from_slice(json).context("Unable to deserialize ffprobe JSON")?;

    let stream = output
        .streams
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("No video stream found"))?;

    let format = output.format;

    // Matroska keeps the duration on the container rather than the stream.
    let duration = stream
        .duration
        .unwrap_or_default()
        .max(format.duration.unwrap_or_default());

    Ok(Metadata {
        codec_name: stream.codec_name.unwrap_or_default(),
        frame_rate: stream.r_frame_rate.unwrap_or_default(),
        duration,
        width: stream.width.unwrap_or_default(),
        height: stream.height.unwrap_or_default(),
        bit_rate: stream.bit_rate.or(format.bit_rate).unwrap_or_default() as u64,
        frame_count: stream
            .nb_read_packets
            .or(stream.nb_frames)
            .unwrap_or_default() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MKV_PROBE: &str = r#"{
        "streams": [
            {
                "index": 0,
                "codec_name": "h264",
                "codec_type": "video",
                "width": 1280,
                "height": 720,
                "r_frame_rate": "30000/1001",
                "nb_read_packets": "300"
            }
        ],
        "format": {
            "filename": "clip.mkv",
            "duration": "10.010000",
            "bit_rate": "1250000"
        }
    }"#;

    #[test]
    fn parses_matroska_output() {
        let metadata = parse_probe_output(MKV_PROBE.as_bytes()).unwrap();

        assert_eq!(metadata.codec_name, "h264");
        assert_eq!(metadata.width, 1280);
        assert_eq!(metadata.height, 720);
        assert_eq!(metadata.frame_count, 300);
        assert_eq!(metadata.bit_rate, 1_250_000);
        assert!((metadata.duration - 10.01).abs() < 1e-9);
        assert!((metadata.frames_per_second().unwrap() - 29.97).abs() < 0.001);
    }

    #[test]
    fn prefers_longer_duration_and_tolerates_unknown_values() {
        let metadata = parse_probe_output(
            br#"{"streams": [{"duration": "12.5", "nb_frames": "N/A", "bit_rate": "N/A"}], "format": {"duration": "12.0"}}"#,
        )
        .unwrap();

        assert!((metadata.duration - 12.5).abs() < 1e-9);
        assert_eq!(metadata.frame_count, 0);
        assert_eq!(metadata.bit_rate, 0);
    }

    #[test]
    fn missing_video_stream_is_an_error() {
        assert!(parse_probe_output(br#"{"streams": [], "format": {}}"#).is_err());
        assert!(parse_probe_output(b"").is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        let error = Ffprobe::default()
            .probe(Path::new("/nonexistent/video.mp4"))
            .unwrap_err();

        assert!(error.to_string().contains("does not exist"));
    }
}
