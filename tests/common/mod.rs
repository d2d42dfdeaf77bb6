use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub log_path: PathBuf,
}

impl CmdResult {
    /// Parse every stdout line as JSON.
    pub fn json_lines(&self) -> Vec<Value> {
        self.stdout
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).unwrap_or_else(|e| panic!("bad JSON line {l:?}: {e}")))
            .collect()
    }
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn resolve_bin_path() -> PathBuf {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_cexp") {
        return PathBuf::from(path);
    }

    let exe_name = if cfg!(windows) { "cexp.exe" } else { "cexp" };
    let fallback = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
        .and_then(|deps| deps.parent().map(PathBuf::from))
        .map(|debug_dir| debug_dir.join(exe_name));

    match fallback {
        Some(path) if path.exists() => path,
        _ => panic!("unable to resolve cexp binary path for integration test"),
    }
}

/// Write a config that keeps tests fast and independent of `$HOME`.
pub fn write_test_config(dir: &Path) -> PathBuf {
    let path = dir.join("config.toml");
    fs::write(
        &path,
        "[server]\ncase_id = 1\n\n[refresh]\ninterval_secs = 1\nstatus_tick_ms = 50\n\n[grids]\npage_size = 10\n\n[logging]\nansi = false\n",
    )
    .expect("write test config");
    path
}

/// Write a replay fixture with a handful of assets and tasks.
pub fn write_fixture(dir: &Path) -> PathBuf {
    let path = dir.join("fixture.json");
    let assets: Vec<Value> = (1..=12)
        .map(|i| {
            serde_json::json!({
                "asset_id": i,
                "asset_name": if i % 2 == 0 { format!("web-{i}") } else { format!("db-{i}") },
                "asset_type_id": 1,
            })
        })
        .collect();
    let fixture = serde_json::json!({
        "grids": {
            "assets": assets,
            "tasks": [{"task_id": 1, "task_title": "triage", "task_status_id": 4}],
        },
        "lookups": {"asset_type": {"1": "Server"}, "task_status": {"4": "Open"}},
        "counts": {"assets": 12, "tasks": 1},
    });
    fs::write(&path, serde_json::to_vec(&fixture).expect("encode fixture")).expect("write fixture");
    path
}

pub fn run_cli_case(case_name: &str, args: &[&str]) -> CmdResult {
    let root = std::env::temp_dir().join("cexp-test-logs");
    fs::create_dir_all(&root).expect("create temp test log dir");

    let log_path = root.join(format!("{}-{}.log", sanitize(case_name), now_millis()));
    let bin_path = resolve_bin_path();

    let output = Command::new(&bin_path)
        .args(args)
        .env_remove("CEX_OUTPUT_FORMAT")
        .env_remove("CEX_LOG")
        .env("RUST_BACKTRACE", "1")
        .output()
        .expect("execute cexp command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    let mut log_content = String::new();
    log_content.push_str(&format!("case={case_name}\n"));
    log_content.push_str(&format!("bin={}\n", bin_path.display()));
    log_content.push_str(&format!("args={args:?}\n"));
    log_content.push_str(&format!("status={}\n", output.status));
    log_content.push_str("----- stdout -----\n");
    log_content.push_str(&stdout);
    log_content.push('\n');
    log_content.push_str("----- stderr -----\n");
    log_content.push_str(&stderr);
    log_content.push('\n');
    fs::write(&log_path, log_content).expect("write test log");

    CmdResult {
        status: output.status,
        stdout,
        stderr,
        log_path,
    }
}
