use std::path::Path;
use log::debug;

/// Parse `HH:MM:SS.frac` into seconds.
pub fn parse_timestamp(time_str: &str) -> Option<f64> {
    let parts: Vec<&str> = time_str.split(':').collect();
    if parts.len() != 3 {
        return None;
    }

    let hours: u32 = parts[0].parse().ok()?;
    let minutes: u32 = parts[1].parse().ok()?;
    // Seconds must carry a fractional part
    if !parts[2].contains('.') {
        return None;
    }
    let seconds: f64 = parts[2].parse().ok()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }

    Some(hours as f64 * 3600.0 + minutes as f64 * 60.0 + seconds)
}

/// Extract the elapsed media time from an ffmpeg diagnostic line.
///
/// Matches the `time=HH:MM:SS.frac` field of the status line, e.g.
/// `frame=  200 fps= 45 q=28.0 size=    1024kB time=00:00:10.50 bitrate= 799.0kbits/s speed=2.3x`.
/// `out_time=` from `-progress` output is accepted as well.
pub fn parse_elapsed(line: &str) -> Option<f64> {
    let mut rest = line;
    while let Some(pos) = rest.find("time=") {
        let candidate = &rest[pos + 5..];
        let token = candidate
            .split(|c: char| c.is_whitespace())
            .next()
            .unwrap_or("");
        if let Some(seconds) = parse_timestamp(token) {
            return Some(seconds);
        }
        rest = candidate;
    }
    None
}

/// Completion percentage for a diagnostic line, if it carries a usable timestamp.
///
/// Jobs with an unknown (zero) duration never report progress.
pub fn progress_from_line(line: &str, duration: f64) -> Option<f64> {
    if !(duration > 0.0) {
        return None;
    }
    let elapsed = parse_elapsed(line)?;
    Some((elapsed / duration * 100.0).min(100.0))
}

/// Output statistics computed after a successful render
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OutputStats {
    pub output_size: Option<u64>,
    pub compression_ratio: Option<f64>,
}

/// Stat the rendered file and derive output/input ratio.
///
/// Any failure leaves the fields unset.
pub fn output_stats(output: &Path, input_size: Option<u64>) -> OutputStats {
    let output_size = match std::fs::metadata(output) {
        Ok(meta) => meta.len(),
        Err(e) => {
            debug!("Could not stat output {}: {}", output.display(), e);
            return OutputStats::default();
        }
    };

    let compression_ratio = match input_size {
        Some(input) if input > 0 => Some(output_size as f64 / input as f64),
        _ => None,
    };

    OutputStats {
        output_size: Some(output_size),
        compression_ratio,
    }
}

/// Extrapolated size of a full render from a short sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizeEstimate {
    pub estimated_full_size: u64,
    /// Fraction of the source size saved; negative when the render grows
    pub compression_ratio: f64,
}

/// Scale a sample of `sample_seconds` up to the full `duration`.
///
/// Returns `None` when the duration is unknown.
pub fn estimate_full_size(
    sample_size: u64,
    sample_seconds: f64,
    duration: f64,
    source_size: u64,
) -> Option<SizeEstimate> {
    if !(duration > 0.0) || !(sample_seconds > 0.0) {
        return None;
    }

    let rendered = sample_seconds.min(duration);
    let estimated = sample_size as f64 * (duration / rendered);
    let compression_ratio = if source_size > 0 {
        (source_size as f64 - estimated) / source_size as f64
    } else {
        0.0
    };

    Some(SizeEstimate {
        estimated_full_size: estimated as u64,
        compression_ratio,
    })
}
