//! ffprobe JSON output and its mapping onto media attributes.

use lumen_core::models::MediaAttributes;
use serde::Deserialize;

/// Subset of `ffprobe -print_format json -show_format -show_streams`.
#[derive(Debug, Default, Deserialize)]
pub struct ProbeOutput {
    #[serde(default)]
    pub streams: Vec<ProbeStream>,
    #[serde(default)]
    pub format: Option<ProbeFormat>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ProbeStream {
    #[serde(default)]
    pub codec_type: Option<String>,
    #[serde(default)]
    pub codec_name: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub r_frame_rate: Option<String>,
    #[serde(default)]
    pub avg_frame_rate: Option<String>,
    #[serde(default)]
    pub bit_rate: Option<String>,
    #[serde(default)]
    pub duration: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ProbeFormat {
    #[serde(default)]
    pub format_name: Option<String>,
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub bit_rate: Option<String>,
}

/// Parse an ffprobe rational such as `30000/1001`. `0/0` is unknown.
pub fn parse_rate(raw: &str) -> Option<f64> {
    let (num, den) = raw.split_once('/')?;
    let num: f64 = num.trim().parse().ok()?;
    let den: f64 = den.trim().parse().ok()?;
    if den == 0.0 || num <= 0.0 {
        return None;
    }
    Some(((num / den) * 1000.0).round() / 1000.0)
}

fn parse_seconds_ms(raw: &str) -> Option<u64> {
    let secs: f64 = raw.trim().parse().ok()?;
    (secs.is_finite() && secs >= 0.0).then(|| (secs * 1000.0).round() as u64)
}

impl ProbeOutput {
    pub fn parse(stdout: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(stdout)
    }

    pub fn video_stream(&self) -> Option<&ProbeStream> {
        self.streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("video"))
    }

    /// Attributes reported by the probe. Anything the probe did not report stays unknown.
    pub fn attributes(&self) -> MediaAttributes {
        let mut attributes = MediaAttributes::default();
        let format = self.format.as_ref();

        if let Some(stream) = self.video_stream() {
            if let (Some(w), Some(h)) = (stream.width, stream.height) {
                attributes = MediaAttributes::from_dimensions(w, h);
            }
            attributes.codec = stream.codec_name.clone();
            attributes.framerate = stream
                .r_frame_rate
                .as_deref()
                .and_then(parse_rate)
                .or_else(|| stream.avg_frame_rate.as_deref().and_then(parse_rate));
            attributes.duration_ms = format
                .and_then(|f| f.duration.as_deref())
                .or(stream.duration.as_deref())
                .and_then(parse_seconds_ms);
            attributes.bitrate = format
                .and_then(|f| f.bit_rate.as_deref())
                .or(stream.bit_rate.as_deref())
                .and_then(|b| b.trim().parse().ok());
        } else if let Some(format) = format {
            attributes.duration_ms = format.duration.as_deref().and_then(parse_seconds_ms);
            attributes.bitrate = format.bit_rate.as_deref().and_then(|b| b.trim().parse().ok());
        }

        attributes.format = format
            .and_then(|f| f.format_name.as_deref())
            .and_then(|name| name.split(',').next())
            .map(str::to_string);
        attributes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_core::models::Orientation;

    const SAMPLE: &str = r#"{
        "streams": [
            {"index": 0, "codec_type": "audio", "codec_name": "aac", "bit_rate": "128000"},
            {"index": 1, "codec_type": "video", "codec_name": "h264", "width": 1280,
             "height": 720, "r_frame_rate": "30000/1001", "avg_frame_rate": "30000/1001"}
        ],
        "format": {"format_name": "mov,mp4,m4a,3gp,3g2,mj2", "duration": "12.345000",
                   "bit_rate": "2500000", "size": "3858000"}
    }"#;

    #[test]
    fn test_parse_full_probe() {
        let attrs = ProbeOutput::parse(SAMPLE.as_bytes()).unwrap().attributes();
        assert_eq!(attrs.width, Some(1280));
        assert_eq!(attrs.height, Some(720));
        assert_eq!(attrs.codec.as_deref(), Some("h264"));
        assert_eq!(attrs.framerate, Some(29.97));
        assert_eq!(attrs.duration_ms, Some(12_345));
        assert_eq!(attrs.bitrate, Some(2_500_000));
        assert_eq!(attrs.format.as_deref(), Some("mov"));
        assert_eq!(attrs.orientation, Some(Orientation::Landscape));
    }

    #[test]
    fn test_missing_values_stay_unknown() {
        let attrs = ProbeOutput::parse(br#"{"streams": [{"codec_type": "video"}], "format": {}}"#)
            .unwrap()
            .attributes();
        assert_eq!(attrs.width, None);
        assert_eq!(attrs.duration_ms, None);
        assert_eq!(attrs.framerate, None);
        assert_eq!(attrs.codec, None);
    }

    #[test]
    fn test_rates() {
        assert_eq!(parse_rate("25/1"), Some(25.0));
        assert_eq!(parse_rate("0/0"), None);
        assert_eq!(parse_rate("garbage"), None);
    }

    #[test]
    fn test_rejects_non_json() {
        assert!(ProbeOutput::parse(b"duration=12.0").is_err());
    }
}
