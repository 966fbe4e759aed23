//! System boot time, reported to the collector alongside the scanner's start time.

const PROC_STAT: &str = "/proc/stat";

/// Boot time in Unix seconds, from the `btime` line of /proc/stat.
pub fn system_booted() -> Option<u64> {
    match std::fs::read_to_string(PROC_STAT) {
        Ok(stat) => parse_btime(&stat),
        Err(e) => {
            tracing::debug!(error = %e, "cannot read {PROC_STAT}");
            None
        }
    }
}

fn parse_btime(stat: &str) -> Option<u64> {
    stat.lines()
        .find_map(|l| l.strip_prefix("btime "))
        .and_then(|v| v.trim().parse().ok())
}
