use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};

/// Encoding parameters for one transcode.
///
/// The engine never interprets these; only the command builder does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeParams {
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub bitrate: Option<String>,
    pub crf: Option<u32>,
    pub preset: Option<String>,
    /// Scale target, e.g. "1280:720" or "1920:-2"
    pub resolution: Option<String>,
    /// Container extension of the output file
    pub format: String,
    /// "cuda", "cuda:<device>", "qsv" or "vaapi"
    pub hw_accel: Option<String>,
    pub threads: Option<u32>,
    /// Subtitle codec; "none" drops subtitle streams
    pub scodec: Option<String>,
    pub deinterlace: bool,
    /// "90", "180" or "270"
    pub rotation: Option<String>,
    pub extra_args: Vec<String>,
}

impl Default for TranscodeParams {
    fn default() -> Self {
        Self {
            vcodec: Some("libx264".to_string()),
            acodec: Some("aac".to_string()),
            bitrate: None,
            crf: None,
            preset: None,
            resolution: None,
            format: "mp4".to_string(),
            hw_accel: None,
            threads: Some(0),
            scodec: Some("copy".to_string()),
            deinterlace: false,
            rotation: None,
            extra_args: Vec::new(),
        }
    }
}

impl TranscodeParams {
    /// Parameters adjusted for a browser-playable preview clip
    pub fn for_preview(&self) -> Self {
        Self {
            format: "mp4".to_string(),
            scodec: Some("none".to_string()),
            ..self.clone()
        }
    }

    pub fn subtitles_enabled(&self) -> bool {
        self.scodec
            .as_deref()
            .map(|s| !s.eq_ignore_ascii_case("none"))
            .unwrap_or(false)
    }
}

/// Destination for `input` inside `output_dir`: same stem, extension from `params.format`
pub fn output_path_for(input: &Path, output_dir: &Path, params: &TranscodeParams) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".to_string());
    let format = params.format.trim_start_matches('.');
    output_dir.join(format!("{}.{}", stem, format))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_path_uses_stem_and_format() {
        let params = TranscodeParams { format: "mkv".to_string(), ..Default::default() };
        let out = output_path_for(Path::new("/in/Holiday Clip.mov"), Path::new("/out"), &params);
        assert_eq!(out, PathBuf::from("/out/Holiday Clip.mkv"));
    }

    #[test]
    fn test_output_path_tolerates_leading_dot() {
        let params = TranscodeParams { format: ".webm".to_string(), ..Default::default() };
        let out = output_path_for(Path::new("a.mp4"), Path::new("o"), &params);
        assert_eq!(out, PathBuf::from("o/a.webm"));
    }

    #[test]
    fn test_preview_forces_mp4_without_subtitles() {
        let params = TranscodeParams {
            format: "mkv".to_string(),
            crf: Some(23),
            ..Default::default()
        };
        let preview = params.for_preview();
        assert_eq!(preview.format, "mp4");
        assert!(!preview.subtitles_enabled());
        assert_eq!(preview.crf, Some(23));
        assert!(params.subtitles_enabled());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let params: TranscodeParams = serde_json::from_str(r#"{"crf": 28, "hw_accel": "vaapi"}"#).unwrap();
        assert_eq!(params.crf, Some(28));
        assert_eq!(params.vcodec.as_deref(), Some("libx264"));
        assert_eq!(params.format, "mp4");
    }
}
