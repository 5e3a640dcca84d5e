use std::fs;
use std::path::Path;

use clap::Parser;
use pmctrack::cli::Args;
use pmctrack::monitor::control_loop::Phase;
use pmctrack::monitor::{Session, SessionConfig};
use pmctrack::pmc::procfs::ProcPmc;
use pmctrack_common::PmcSample;

/// Directory standing in for `/proc/pmc`, with `samples` in the monitor entry
fn fake_module(samples: &[PmcSample]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    for entry in ["config", "syswide", "enable"] {
        fs::write(dir.path().join(entry), "").unwrap();
    }
    let mut bytes = Vec::with_capacity(samples.len() * PmcSample::SIZE);
    for sample in samples {
        // SAFETY: PmcSample is repr(C) without padding
        let raw = unsafe {
            std::slice::from_raw_parts(std::ptr::from_ref(sample).cast::<u8>(), PmcSample::SIZE)
        };
        bytes.extend_from_slice(raw);
    }
    fs::write(dir.path().join("monitor"), bytes).unwrap();
    dir
}

fn sample(pid: i32, value: u64) -> PmcSample {
    let mut s = PmcSample { pid, pmc_mask: 0b1, nr_counters: 1, ..PmcSample::default() };
    s.pmc_counts[0] = value;
    s
}

fn config(root: &Path, argv: &[&str]) -> SessionConfig {
    let args = Args::try_parse_from(
        ["pmctrack", "--pmc-root", root.to_str().unwrap(), "-T", "0.05", "-k", "8192"]
            .into_iter()
            .chain(argv.iter().copied()),
    )
    .unwrap();
    SessionConfig::from_args(&args).unwrap()
}

fn rows(text: &str) -> Vec<Vec<&str>> {
    text.lines()
        .skip_while(|l| !l.trim_start().starts_with("nsample"))
        .skip(1)
        .take_while(|l| !l.starts_with('['))
        .map(|l| l.split_whitespace().collect())
        .collect()
}

#[test]
fn test_stream_session_reports_samples_and_exit_code() {
    let dir = fake_module(&[sample(77, 10), sample(77, 20)]);
    let cfg = config(dir.path(), &["-r", "-c", "pmc0", "sh", "-c", "exit 3"]);

    let mut out = Vec::new();
    let summary = Session::new(cfg, ProcPmc::new(dir.path()).unwrap()).run(&mut out).unwrap();

    assert_eq!(summary.exit_code, 3);
    assert_eq!(summary.samples, 2);
    assert_eq!(summary.phase, Phase::Done);
    assert_eq!(summary.limit, None);

    let text = String::from_utf8(out).unwrap();
    // Raw counters: no mapping block
    assert!(text.trim_start().starts_with("nsample"), "{text}");
    assert_eq!(rows(&text), vec![vec!["1", "77", "tick", "10"], vec!["2", "77", "tick", "20"]]);

    // The child started counting and the controller attached to it
    assert_eq!(fs::read_to_string(dir.path().join("enable")).unwrap(), "1");
    assert!(fs::read_to_string(dir.path().join("config")).unwrap().starts_with("attach "));
}

#[test]
fn test_accumulate_session_with_process_times() {
    let dir = fake_module(&[sample(77, 10), sample(78, 5), sample(77, 20)]);
    let cfg = config(dir.path(), &["-A", "-t", "-r", "-c", "pmc0", "true"]);

    let mut out = Vec::new();
    let summary = Session::new(cfg, ProcPmc::new(dir.path()).unwrap()).run(&mut out).unwrap();
    assert_eq!(summary.exit_code, 0);
    assert_eq!(summary.dropped, 0);

    let text = String::from_utf8(out).unwrap();
    assert_eq!(rows(&text), vec![vec!["2", "77", "tick", "30"], vec!["1", "78", "tick", "5"]]);
    assert!(text.contains("[Process times]\nreal\t"), "{text}");
}

#[test]
fn test_read_failure_still_reaps_and_reports() {
    let dir = fake_module(&[]);
    // Reading a directory fails with EISDIR on the first drain
    fs::remove_file(dir.path().join("monitor")).unwrap();
    fs::create_dir(dir.path().join("monitor")).unwrap();
    let cfg = config(dir.path(), &["-A", "-r", "-c", "pmc0", "sh", "-c", "sleep 0.3; exit 4"]);

    let mut out = Vec::new();
    let summary = Session::new(cfg, ProcPmc::new(dir.path()).unwrap()).run(&mut out).unwrap();

    assert_eq!(summary.phase, Phase::Error);
    assert_eq!(summary.exit_code, 4);
    assert_eq!(summary.samples, 0);

    let text = String::from_utf8(out).unwrap();
    assert!(text.trim_start().starts_with("nsample"), "{text}");
    assert!(rows(&text).is_empty(), "{text}");
}

#[test]
fn test_system_wide_session_configures_in_controller() {
    let dir = fake_module(&[sample(0, 42)]);
    let cfg = config(dir.path(), &["-S", "-r", "-c", "pmc0", "true"]);

    let mut out = Vec::new();
    let summary = Session::new(cfg, ProcPmc::new(dir.path()).unwrap()).run(&mut out).unwrap();
    assert_eq!(summary.exit_code, 0);

    let text = String::from_utf8(out).unwrap();
    assert!(text.lines().next().unwrap().contains("cpu"), "{text}");
    assert_eq!(rows(&text), vec![vec!["1", "0", "tick", "42"]]);
    assert!(fs::read_to_string(dir.path().join("syswide")).unwrap().starts_with("start"));
    // No per-process setup in system-wide mode
    assert_eq!(fs::read_to_string(dir.path().join("enable")).unwrap(), "");
}

#[test]
fn test_mnemonic_counters_print_mappings() {
    let dir = fake_module(&[]);
    let cfg = config(dir.path(), &["-c", "instr", "true"]);

    let mut out = Vec::new();
    Session::new(cfg, ProcPmc::new(dir.path()).unwrap()).run(&mut out).unwrap();

    let text = String::from_utf8(out).unwrap();
    assert!(text.starts_with("[Event-to-counter mappings]\npmc3=instr\n"), "{text}");
    assert!(text.contains("[Event counts]\n"));
}

#[test]
fn test_no_events_is_rejected_before_launch() {
    let dir = fake_module(&[]);
    let cfg = config(dir.path(), &["true"]);

    let err = Session::new(cfg, ProcPmc::new(dir.path()).unwrap()).run(Vec::new()).unwrap_err();
    assert!(format!("{err:#}").contains("specify events"), "{err:#}");
    assert_eq!(fs::read_to_string(dir.path().join("enable")).unwrap(), "");
}

#[test]
fn test_failing_setup_write_aborts_launch() {
    let dir = fake_module(&[]);
    fs::remove_file(dir.path().join("enable")).unwrap();
    let cfg = config(dir.path(), &["-r", "-c", "pmc0", "true"]);

    let err = Session::new(cfg, ProcPmc::new(dir.path()).unwrap()).run(Vec::new()).unwrap_err();
    let msg = format!("{err:#}");
    assert!(msg.contains("Failed to launch 'true'"), "{msg}");
    assert!(msg.contains("start counting"), "{msg}");
}
