use std::path::{Path, PathBuf};
use crate::params::TranscodeParams;

/// Maps an input/output pair and its parameters to an executable command line.
///
/// Implementations must be pure and never fail: parameters that make no sense
/// degrade to best-effort flags. `argv[0]` is the program to execute.
pub trait CommandBuilder: Send + Sync {
    fn build(&self, input: &Path, output: &Path, params: &TranscodeParams) -> Vec<String>;

    /// Build a command that renders only `duration` seconds starting at `start`.
    fn build_clip(
        &self,
        input: &Path,
        output: &Path,
        params: &TranscodeParams,
        start: f64,
        duration: f64,
    ) -> Vec<String> {
        let _ = (start, duration);
        self.build(input, output, params)
    }
}

/// Hardware acceleration family requested by `TranscodeParams::hw_accel`
#[derive(Debug, Clone, PartialEq, Eq)]
enum HwAccel {
    Cuda(Option<String>),
    Qsv,
    Vaapi,
    None,
}

impl HwAccel {
    fn from_params(params: &TranscodeParams) -> Self {
        match params.hw_accel.as_deref() {
            Some(s) if s.starts_with("cuda") => {
                HwAccel::Cuda(s.split_once(':').map(|(_, dev)| dev.to_string()))
            }
            Some("qsv") => HwAccel::Qsv,
            Some("vaapi") => HwAccel::Vaapi,
            _ => HwAccel::None,
        }
    }
}

/// Command builder producing ffmpeg invocations
#[derive(Debug, Clone)]
pub struct FfmpegCommandBuilder {
    ffmpeg_bin: PathBuf,
}

impl Default for FfmpegCommandBuilder {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl FfmpegCommandBuilder {
    pub fn new(ffmpeg_bin: impl Into<PathBuf>) -> Self {
        Self { ffmpeg_bin: ffmpeg_bin.into() }
    }

    fn build_with_input_options(
        &self,
        input: &Path,
        output: &Path,
        params: &TranscodeParams,
        input_options: &[String],
    ) -> Vec<String> {
        let mut args = vec![
            self.ffmpeg_bin.to_string_lossy().to_string(),
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "info".to_string(),
        ];

        // Hardware decode setup must precede -i
        let accel = HwAccel::from_params(params);
        match &accel {
            HwAccel::Cuda(device) => {
                push_pair(&mut args, "-hwaccel", "cuda");
                push_pair(&mut args, "-hwaccel_output_format", "cuda");
                if let Some(device) = device {
                    push_pair(&mut args, "-hwaccel_device", device);
                }
            }
            HwAccel::Qsv => {
                push_pair(&mut args, "-hwaccel", "qsv");
                push_pair(&mut args, "-hwaccel_output_format", "qsv");
            }
            HwAccel::Vaapi => {
                push_pair(&mut args, "-hwaccel", "vaapi");
                push_pair(&mut args, "-hwaccel_device", "/dev/dri/renderD128");
                push_pair(&mut args, "-hwaccel_output_format", "vaapi");
            }
            HwAccel::None => {}
        }

        args.extend(input_options.iter().cloned());
        push_pair(&mut args, "-i", &input.to_string_lossy());

        // Keep every stream: video, audio and subtitles
        push_pair(&mut args, "-map", "0");

        let is_cuda = matches!(accel, HwAccel::Cuda(_));
        let vcodec = params.vcodec.as_deref().map(|codec| match (is_cuda, codec) {
            (true, "libx264") => "h264_nvenc",
            (true, "libx265") => "hevc_nvenc",
            (_, other) => other,
        });

        if let Some(vcodec) = vcodec {
            push_pair(&mut args, "-c:v", vcodec);
        }
        if let Some(acodec) = &params.acodec {
            push_pair(&mut args, "-c:a", acodec);
        }

        if params.subtitles_enabled() {
            push_pair(&mut args, "-c:s", params.scodec.as_deref().unwrap_or("copy"));
        } else {
            args.push("-sn".to_string());
        }

        if let Some(bitrate) = &params.bitrate {
            push_pair(&mut args, "-b:v", bitrate);
        }

        // NVENC has no -crf; QSV uses ICQ via -global_quality
        if let Some(crf) = params.crf {
            let crf = crf.to_string();
            let vcodec = vcodec.unwrap_or("");
            if is_cuda && vcodec.contains("nvenc") {
                push_pair(&mut args, "-rc", "vbr");
                push_pair(&mut args, "-cq", &crf);
                push_pair(&mut args, "-qmin", &crf);
                push_pair(&mut args, "-qmax", &crf);
            } else if accel == HwAccel::Qsv && vcodec.contains("qsv") {
                push_pair(&mut args, "-global_quality", &crf);
            } else {
                push_pair(&mut args, "-crf", &crf);
            }
        }

        if let Some(preset) = &params.preset {
            push_pair(&mut args, "-preset", preset);
        }

        let filters = filter_chain(params, is_cuda);
        if !filters.is_empty() {
            push_pair(&mut args, "-vf", &filters.join(","));
        }

        if let Some(threads) = params.threads.filter(|t| *t > 0) {
            push_pair(&mut args, "-threads", &threads.to_string());
        }

        args.extend(params.extra_args.iter().cloned());
        args.push(output.to_string_lossy().to_string());
        args
    }
}

impl CommandBuilder for FfmpegCommandBuilder {
    fn build(&self, input: &Path, output: &Path, params: &TranscodeParams) -> Vec<String> {
        self.build_with_input_options(input, output, params, &[])
    }

    fn build_clip(
        &self,
        input: &Path,
        output: &Path,
        params: &TranscodeParams,
        start: f64,
        duration: f64,
    ) -> Vec<String> {
        // Seek before -i for fast input seeking
        let input_options = vec![
            "-ss".to_string(),
            start.to_string(),
            "-t".to_string(),
            duration.to_string(),
        ];
        self.build_with_input_options(input, output, params, &input_options)
    }
}

/// Deinterlace, scale and rotate, in that order.
///
/// CUDA filters are only used without rotation, since transpose needs frames in system memory.
fn filter_chain(params: &TranscodeParams, is_cuda: bool) -> Vec<String> {
    let use_hw_filters = is_cuda && params.rotation.is_none();
    let mut filters = Vec::new();

    if params.deinterlace {
        filters.push(if use_hw_filters { "yadif_cuda=0:-1:0" } else { "yadif" }.to_string());
    }

    if let Some(resolution) = &params.resolution {
        if use_hw_filters {
            filters.push(format!("scale_cuda={}", resolution));
        } else {
            filters.push(format!("scale={}", resolution));
        }
    }

    match params.rotation.as_deref() {
        Some("90") => filters.push("transpose=1".to_string()),
        Some("180") => filters.push("transpose=1,transpose=1".to_string()),
        Some("270") => filters.push("transpose=2".to_string()),
        _ => {}
    }

    filters
}

fn push_pair(args: &mut Vec<String>, flag: &str, value: &str) {
    args.push(flag.to_string());
    args.push(value.to_string());
}

/// Render an argv as a single line for logs and `Job::command`
pub fn display_command(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                format!("\"{}\"", arg)
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn build(params: &TranscodeParams) -> Vec<String> {
        FfmpegCommandBuilder::new("/usr/bin/ffmpeg").build(
            Path::new("/in/movie.mkv"),
            Path::new("/out/movie.mp4"),
            params,
        )
    }

    fn index_of(args: &[String], flag: &str) -> Option<usize> {
        args.iter().position(|a| a == flag)
    }

    #[test]
    fn test_default_command_shape() {
        let args = build(&TranscodeParams::default());
        assert_eq!(args[0], "/usr/bin/ffmpeg");
        assert_eq!(args.last().unwrap(), "/out/movie.mp4");
        assert!(args.windows(2).any(|w| w == ["-map", "0"]));
        assert!(args.windows(2).any(|w| w == ["-c:v", "libx264"]));
        assert!(args.windows(2).any(|w| w == ["-c:s", "copy"]));
        // threads=0 means "let ffmpeg decide" and is not passed
        assert!(index_of(&args, "-threads").is_none());
    }

    #[test]
    fn test_cuda_switches_encoder_and_crf_mode() {
        let params = TranscodeParams {
            hw_accel: Some("cuda:1".to_string()),
            vcodec: Some("libx265".to_string()),
            crf: Some(24),
            resolution: Some("1280:720".to_string()),
            ..Default::default()
        };
        let args = build(&params);
        assert!(args.windows(2).any(|w| w == ["-hwaccel_device", "1"]));
        assert!(args.windows(2).any(|w| w == ["-c:v", "hevc_nvenc"]));
        assert!(args.windows(2).any(|w| w == ["-cq", "24"]));
        assert!(index_of(&args, "-crf").is_none());
        assert!(args.windows(2).any(|w| w == ["-vf", "scale_cuda=1280:720"]));
        assert!(index_of(&args, "-hwaccel").unwrap() < index_of(&args, "-i").unwrap());
    }

    #[test]
    fn test_qsv_uses_global_quality() {
        let params = TranscodeParams {
            hw_accel: Some("qsv".to_string()),
            vcodec: Some("h264_qsv".to_string()),
            crf: Some(20),
            ..Default::default()
        };
        let args = build(&params);
        assert!(args.windows(2).any(|w| w == ["-global_quality", "20"]));
    }

    #[test]
    fn test_rotation_disables_cuda_filters() {
        let params = TranscodeParams {
            hw_accel: Some("cuda".to_string()),
            deinterlace: true,
            resolution: Some("1920:-2".to_string()),
            rotation: Some("270".to_string()),
            ..Default::default()
        };
        let args = build(&params);
        assert!(args.windows(2).any(|w| w == ["-vf", "yadif,scale=1920:-2,transpose=2"]));
    }

    #[test]
    fn test_disabled_subtitles_and_extra_args() {
        let params = TranscodeParams {
            scodec: Some("none".to_string()),
            threads: Some(4),
            extra_args: vec!["-movflags".to_string(), "+faststart".to_string()],
            ..Default::default()
        };
        let args = build(&params);
        assert!(args.contains(&"-sn".to_string()));
        assert!(index_of(&args, "-c:s").is_none());
        assert!(args.windows(2).any(|w| w == ["-threads", "4"]));
        let n = args.len();
        assert_eq!(&args[n - 3..n - 1], ["-movflags", "+faststart"]);
    }

    #[test]
    fn test_clip_seeks_before_input() {
        let args = FfmpegCommandBuilder::default().build_clip(
            Path::new("in.mp4"),
            Path::new("preview.mp4"),
            &TranscodeParams::default(),
            55.0,
            10.0,
        );
        let ss = index_of(&args, "-ss").unwrap();
        assert_eq!(args[ss + 1], "55");
        assert!(ss < index_of(&args, "-i").unwrap());
        assert!(args.windows(2).any(|w| w == ["-t", "10"]));
    }

    #[test]
    fn test_display_command_quotes_spaces() {
        let argv = vec!["ffmpeg".to_string(), "-i".to_string(), "My Movie.mkv".to_string()];
        assert_eq!(display_command(&argv), "ffmpeg -i \"My Movie.mkv\"");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Whatever the parameters, the program comes first and the output last,
        /// and the input appears exactly once after -i.
        #[test]
        fn test_command_frame_is_stable(
            crf in proptest::option::of(0u32..52),
            deinterlace in any::<bool>(),
            accel in prop_oneof![
                Just(None),
                Just(Some("cuda".to_string())),
                Just(Some("qsv".to_string())),
                Just(Some("vaapi".to_string())),
                Just(Some("bogus".to_string())),
            ],
            rotation in prop_oneof![Just(None), Just(Some("90".to_string())), Just(Some("45".to_string()))],
        ) {
            let params = TranscodeParams { crf, deinterlace, hw_accel: accel, rotation, ..Default::default() };
            let args = build(&params);
            prop_assert_eq!(&args[0], "/usr/bin/ffmpeg");
            prop_assert_eq!(args.last().unwrap(), "/out/movie.mp4");
            let inputs: Vec<_> = args.windows(2).filter(|w| w[0] == "-i").collect();
            prop_assert_eq!(inputs.len(), 1);
            prop_assert_eq!(&inputs[0][1], "/in/movie.mkv");
        }
    }
}
