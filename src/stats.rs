use std::fmt;
use std::time::Duration;

use crate::connection::StreamStats;

const KB: f64 = 1024.0;
const MB: f64 = 1024.0 * KB;

/// Per-run text report written under `stats/`, out of core scope
/// (`spec.md` §6.4) and kept deliberately small.
pub struct ConnectionReport {
    pub streams: Vec<StreamStats>,
    pub total_bytes_sent: u64,
    pub total_elapsed: Option<Duration>,
}

impl fmt::Display for ConnectionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for s in &self.streams {
            writeln!(f, "Stream {}:", s.stream_id)?;
            writeln!(f, "  Frames received: {}", s.frames_received)?;
            writeln!(f, "  Bytes received: {}", s.bytes_received)?;
            writeln!(f, "  Bytes sent: {}", s.bytes_sent)?;
            match s.elapsed {
                Some(elapsed) => {
                    let secs = elapsed.as_secs_f64();
                    writeln!(f, "  Time taken: {secs:.2} seconds")?;
                    if secs > 0.0 {
                        writeln!(
                            f,
                            "  Avg. bytes throughput: {:.2} bytes/sec",
                            s.bytes_received as f64 / secs
                        )?;
                    }
                }
                None => writeln!(f, "  Stream not fully completed yet.")?,
            }
            writeln!(f)?;
        }

        let total_bytes_received: u64 = self.streams.iter().map(|s| s.bytes_received).sum();
        let total_frames_received: u64 = self.streams.iter().map(|s| s.frames_received).sum();

        writeln!(f, "Total bytes sent: {}", self.total_bytes_sent)?;
        writeln!(f, "Total bytes received: {total_bytes_received}")?;
        writeln!(f, "Total frames received: {total_frames_received}")?;

        if let Some(elapsed) = self.total_elapsed {
            let secs = elapsed.as_secs_f64();
            writeln!(f, "Total time taken: {secs:.2} seconds")?;
            if secs > 0.0 {
                writeln!(
                    f,
                    "Total avg. frames throughput: {:.0} frames/sec",
                    total_frames_received as f64 / secs
                )?;
                writeln!(f, "Total avg. bytes throughput: {}", format_throughput(total_bytes_received as f64 / secs))?;
            }
        }

        Ok(())
    }
}

fn format_throughput(bytes_per_sec: f64) -> String {
    if bytes_per_sec < KB {
        format!("{bytes_per_sec:.2} bytes/sec")
    } else if bytes_per_sec < MB {
        format!("{:.2} KB/sec", bytes_per_sec / KB)
    } else {
        format!("{:.2} MB/sec", bytes_per_sec / MB)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn report_renders_without_panicking_on_incomplete_streams() {
        let report = ConnectionReport {
            streams: vec![StreamStats {
                stream_id: 1,
                bytes_sent: 0,
                bytes_received: 10,
                frames_received: 2,
                closed: false,
                elapsed: None,
            }],
            total_bytes_sent: 100,
            total_elapsed: None,
        };
        let rendered = report.to_string();
        assert!(rendered.contains("Stream 1"));
        assert!(rendered.contains("not fully completed"));
    }

    #[test]
    fn throughput_formatting_picks_the_right_unit() {
        assert!(format_throughput(10.0).ends_with("bytes/sec"));
        assert!(format_throughput(10_000.0).ends_with("KB/sec"));
        assert!(format_throughput(10_000_000.0).ends_with("MB/sec"));
    }
}
