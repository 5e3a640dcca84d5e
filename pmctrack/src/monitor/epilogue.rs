//! Process epilogue: final reap, `-t` times, exit status

use std::io::{self, Write};
use std::time::{Duration, Instant};

use super::launcher::{ChildExit, Target};
use crate::domain::MonitorError;

/// Collect the target's exit status, waiting for it if the loop did not
///
/// # Errors
/// `wait4` failed.
pub fn reap_target<T: Target>(target: &mut T, observed: Option<ChildExit>) -> Result<ChildExit, MonitorError> {
    match observed {
        Some(exit) => Ok(exit),
        None => target.reap(),
    }
}

fn centis(d: Duration) -> u32 {
    d.subsec_micros() / 10_000
}

/// `real` column: `H:MM:SS` from one hour on, `M:SS.cc` below
#[must_use]
pub fn format_real_time(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs >= 3600 {
        format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else {
        format!("{}:{:02}.{:02}", secs / 60, secs % 60, centis(elapsed))
    }
}

/// `user`/`sys` columns: `S.cc`
#[must_use]
pub fn format_cpu_time(time: Duration) -> String {
    format!("{}.{:02}", time.as_secs(), centis(time))
}

/// Print the `[Process times]` block
///
/// # Errors
/// Write failures.
pub fn write_process_times(out: &mut dyn Write, started: Instant, exit: &ChildExit) -> io::Result<()> {
    let real = exit.ended.saturating_duration_since(started);
    writeln!(out, "[Process times]")?;
    writeln!(out, "real\t{}", format_real_time(real))?;
    writeln!(out, "user\t{}", format_cpu_time(exit.user_time))?;
    writeln!(out, "sys\t{}", format_cpu_time(exit.system_time))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_real_time_formats() {
        assert_eq!(format_real_time(Duration::from_millis(75_430)), "1:15.43");
        assert_eq!(format_real_time(Duration::from_millis(5_070)), "0:05.07");
        assert_eq!(format_real_time(Duration::from_secs(3600 + 2 * 60 + 9)), "1:02:09");
    }

    #[test]
    fn test_cpu_time_format() {
        assert_eq!(format_cpu_time(Duration::from_micros(2_345_678)), "2.34");
        assert_eq!(format_cpu_time(Duration::ZERO), "0.00");
    }

    #[test]
    fn test_process_times_block() {
        let started = Instant::now();
        let exit = ChildExit {
            status: 0,
            user_time: Duration::from_millis(1500),
            system_time: Duration::from_millis(20),
            ended: started + Duration::from_millis(2250),
        };
        let mut buf = Vec::new();
        write_process_times(&mut buf, started, &exit).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "[Process times]\nreal\t0:02.25\nuser\t1.50\nsys\t0.02\n");
    }
}
