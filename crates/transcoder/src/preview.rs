use std::path::{Path, PathBuf};
use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::command::CommandBuilder;
use crate::config::TranscodeConfig;
use crate::params::TranscodeParams;
use crate::probe::DurationProbe;
use crate::progress::estimate_full_size;
use crate::supervisor::run_command;

/// Result of a preview render
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewEstimate {
    pub preview_path: PathBuf,
    pub source_size: u64,
    pub preview_size: u64,
    /// Source duration in seconds, 0 when unknown
    pub duration: f64,
    /// 0 when the duration is unknown
    pub estimated_full_size: u64,
    /// Fraction of the source size saved by a full render
    pub compression_ratio: f64,
}

/// Stable key tying previews to their source path
pub fn preview_key(input: &Path) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, input.to_string_lossy().as_bytes())
        .simple()
        .to_string()
}

/// Start of the sample: ten seconds around the middle of the source
pub fn preview_start(duration: f64) -> f64 {
    (duration / 2.0 - 5.0).max(0.0)
}

/// Remove every preview rendered from `input`; returns how many were deleted
pub fn clear_previews(preview_dir: &Path, input: &Path) -> usize {
    let prefix = format!("preview_{}_", preview_key(input));
    let Ok(entries) = std::fs::read_dir(preview_dir) else {
        return 0;
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with(&prefix) || !name.ends_with(".mp4") {
            continue;
        }
        match std::fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to remove preview {}: {}", entry.path().display(), e),
        }
    }
    removed
}

/// Render a short mp4 sample of `input` and extrapolate the size of a full render.
///
/// Runs to completion without progress tracking or cancellation.
pub async fn render_preview(
    config: &TranscodeConfig,
    builder: &dyn CommandBuilder,
    probe: &dyn DurationProbe,
    input: &Path,
    params: &TranscodeParams,
) -> Result<PreviewEstimate> {
    if !input.is_file() {
        bail!("Input file does not exist: {}", input.display());
    }
    let source_size = std::fs::metadata(input)
        .with_context(|| format!("Failed to stat {}", input.display()))?
        .len();

    let duration = probe.probe(input).await;
    let start = preview_start(duration);

    std::fs::create_dir_all(&config.preview_dir)
        .with_context(|| format!("Failed to create preview dir: {}", config.preview_dir.display()))?;
    let preview_path = config.preview_dir.join(format!(
        "preview_{}_{}.mp4",
        preview_key(input),
        Uuid::new_v4().simple()
    ));

    let params = params.for_preview();
    let argv = builder.build_clip(input, &preview_path, &params, start, config.preview_seconds);
    info!(
        "Rendering {:.0}s preview of {} from {:.1}s",
        config.preview_seconds,
        input.display(),
        start
    );

    let output = run_command(&argv, None).await?;
    if !output.success {
        let _ = std::fs::remove_file(&preview_path);
        bail!(
            "Preview render failed (exit code {}): {}{}",
            output.exit_code.unwrap_or(-1),
            output.stdout.trim(),
            output.stderr.trim()
        );
    }

    let preview_size = std::fs::metadata(&preview_path)
        .with_context(|| format!("Preview render produced no file at {}", preview_path.display()))?
        .len();

    let (estimated_full_size, compression_ratio) =
        match estimate_full_size(preview_size, config.preview_seconds, duration, source_size) {
            Some(estimate) => (estimate.estimated_full_size, estimate.compression_ratio),
            None => {
                debug!("Unknown duration for {}, no size estimate", input.display());
                (0, 0.0)
            }
        };

    Ok(PreviewEstimate {
        preview_path,
        source_size,
        preview_size,
        duration,
        estimated_full_size,
        compression_ratio,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::FixedDurationProbe;

    /// Writes 1000 bytes to the output and records the clip window next to it
    struct ClipBuilder;

    impl CommandBuilder for ClipBuilder {
        fn build(&self, _input: &Path, output: &Path, _params: &TranscodeParams) -> Vec<String> {
            vec![
                "sh".to_string(),
                "-c".to_string(),
                r#"head -c 1000 /dev/zero > "$1""#.to_string(),
                "sh".to_string(),
                output.to_string_lossy().to_string(),
            ]
        }

        fn build_clip(
            &self,
            input: &Path,
            output: &Path,
            params: &TranscodeParams,
            start: f64,
            duration: f64,
        ) -> Vec<String> {
            assert_eq!(params.format, "mp4");
            assert!(!params.subtitles_enabled());
            let window = output.with_extension("window");
            std::fs::write(window, format!("{} {}", start, duration)).unwrap();
            self.build(input, output, params)
        }
    }

    struct FailingBuilder;

    impl CommandBuilder for FailingBuilder {
        fn build(&self, _input: &Path, _output: &Path, _params: &TranscodeParams) -> Vec<String> {
            ["sh", "-c", "echo 'Invalid data found when processing input' >&2; exit 1"]
                .iter()
                .map(|s| s.to_string())
                .collect()
        }
    }

    fn setup() -> (tempfile::TempDir, TranscodeConfig, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let config = TranscodeConfig {
            preview_dir: dir.path().join("previews"),
            ..TranscodeConfig::default_config()
        };
        let input = dir.path().join("movie.mkv");
        std::fs::write(&input, vec![0u8; 40_000]).unwrap();
        (dir, config, input)
    }

    #[test]
    fn test_preview_key_is_stable_per_path() {
        let a = preview_key(Path::new("/media/a.mkv"));
        assert_eq!(a, preview_key(Path::new("/media/a.mkv")));
        assert_ne!(a, preview_key(Path::new("/media/b.mkv")));
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_preview_start() {
        assert_eq!(preview_start(100.0), 45.0);
        assert_eq!(preview_start(6.0), 0.0);
        assert_eq!(preview_start(0.0), 0.0);
    }

    #[tokio::test]
    async fn test_render_preview_estimates_full_size() {
        let (_dir, config, input) = setup();
        let estimate = render_preview(&config, &ClipBuilder, &FixedDurationProbe(100.0), &input, &TranscodeParams::default())
            .await
            .unwrap();

        assert!(estimate.preview_path.starts_with(&config.preview_dir));
        let name = estimate.preview_path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with(&format!("preview_{}_", preview_key(&input))));
        assert_eq!(estimate.source_size, 40_000);
        assert_eq!(estimate.preview_size, 1000);
        assert_eq!(estimate.estimated_full_size, 10_000);
        assert!((estimate.compression_ratio - 0.75).abs() < 1e-9);

        let window = std::fs::read_to_string(estimate.preview_path.with_extension("window")).unwrap();
        assert_eq!(window, "45 10");
    }

    #[tokio::test]
    async fn test_unknown_duration_has_no_estimate() {
        let (_dir, config, input) = setup();
        let estimate = render_preview(&config, &ClipBuilder, &FixedDurationProbe(0.0), &input, &TranscodeParams::default())
            .await
            .unwrap();
        assert_eq!(estimate.estimated_full_size, 0);
        assert_eq!(estimate.compression_ratio, 0.0);
    }

    #[tokio::test]
    async fn test_failed_render_reports_diagnostics() {
        let (_dir, config, input) = setup();
        let err = render_preview(&config, &FailingBuilder, &FixedDurationProbe(50.0), &input, &TranscodeParams::default())
            .await
            .unwrap_err();
        assert!(format!("{}", err).contains("Invalid data"));
    }

    #[tokio::test]
    async fn test_missing_input_is_an_error() {
        let (dir, config, _input) = setup();
        let missing = dir.path().join("missing.mkv");
        assert!(render_preview(&config, &ClipBuilder, &FixedDurationProbe(10.0), &missing, &TranscodeParams::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_clear_previews_only_touches_matching_input() {
        let (_dir, config, input) = setup();
        let first = render_preview(&config, &ClipBuilder, &FixedDurationProbe(20.0), &input, &TranscodeParams::default())
            .await
            .unwrap();
        let other = config.preview_dir.join(format!("preview_{}_x.mp4", preview_key(Path::new("/other.mkv"))));
        std::fs::write(&other, b"keep").unwrap();

        assert_eq!(clear_previews(&config.preview_dir, &input), 1);
        assert!(!first.preview_path.exists());
        assert!(other.exists());
        assert_eq!(clear_previews(Path::new("/nonexistent/previews"), &input), 0);
    }
}
