use std::io::Write;
use std::process::{Command, Output};

use tempfile::NamedTempFile;

fn scriptvm() -> Command {
    Command::new(env!("CARGO_BIN_EXE_scriptvm"))
}

fn program_file(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    file.write_all(json.as_bytes()).expect("write program");
    file
}

fn run(args: &[&str], json: &str) -> Output {
    let file = program_file(json);
    let path = file.path().to_str().expect("utf-8 path").to_string();
    let mut cmd = scriptvm();
    cmd.arg(args[0]).arg(&path).args(&args[1..]);
    cmd.output().expect("failed to run scriptvm")
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

fn stderr(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).to_string()
}

const SUM: &str = r#"{"functions": [{"name": "@main", "code": [
    {"op": "LOAD_rA_iBC", "args": [1, 10]},
    {"op": "LOAD_rA_iBC", "args": [2, 3]},
    {"op": "ADD_rA_rB_rC", "args": [0, 1, 2]},
    "RETURN"
]}]}"#;

const HELLO: &str = r#"{"functions": [{"name": "@main", "constants": ["print", "hello"], "code": [
    {"op": "LOAD_rA_kBC", "args": [2, 1]},
    {"op": "CALLFN_iA_kBC", "args": [1, 0]},
    "RETURN"
]}]}"#;

const UNDEFINED: &str = r#"{"functions": [{"name": "@main", "constants": ["ghost"], "code": [
    {"op": "LOADV_rA_rB_kC", "args": [0, 1, 0]},
    "RETURN"
]}]}"#;

const SPIN: &str = r#"{"functions": [{"name": "@main", "code": [
    {"op": "JUMP_iABC", "args": [-1]}
]}]}"#;

#[test]
fn run_prints_result() {
    let out = run(&["run"], SUM);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "13");
}

#[test]
fn run_under_gc_stress() {
    let out = run(&["run", "--gc-stress"], HELLO);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "hello");
}

#[test]
fn runtime_error_rendered_as_ansi() {
    let out = run(&["run"], UNDEFINED);
    assert_eq!(out.status.code(), Some(1));
    let err = stderr(&out);
    assert!(err.contains("error[R003]: Undefined Identifier: 'ghost'"), "stderr: {err}");
    assert!(err.contains("--> @main:0"), "stderr: {err}");
    assert!(err.contains("LOADV"), "stderr: {err}");
}

#[test]
fn runtime_error_rendered_as_json() {
    let out = run(&["run", "--error-format", "json"], UNDEFINED);
    assert_eq!(out.status.code(), Some(1));
    let err = stderr(&out);
    let line = err.lines().find(|l| l.starts_with('{')).expect("json line");
    let v: serde_json::Value = serde_json::from_str(line).expect("valid JSON");
    assert_eq!(v["code"], "R003");
    assert_eq!(v["location"]["function"], "@main");
    assert_eq!(v["location"]["pc"], 0);
}

#[test]
fn max_cycles_suspends() {
    let out = run(&["run", "--max-cycles", "50"], SPIN);
    assert_eq!(out.status.code(), Some(3));
    assert!(stderr(&out).contains("suspended after 50 cycles"));
}

#[test]
fn tiny_call_stack_overflows() {
    let recurse = r#"{"functions": [{"name": "@main", "max_regs": 2, "code": [
        {"op": "CALLF_iA_iBC", "args": [1, 0]},
        "RETURN"
    ]}]}"#;
    let out = run(&["run", "--call-slots", "4"], recurse);
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).contains("Call stack overflow"));
}

#[test]
fn missing_entry_function() {
    let out = run(&["run"], r#"{"functions": [{"name": "helper", "code": ["RETURN"]}]}"#);
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).contains("No @main function found"));
}

#[test]
fn malformed_program_is_reported() {
    let out = run(&["run"], "{ not json");
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).contains("malformed program"));
}

#[test]
fn dis_lists_functions() {
    let out = run(&["dis"], HELLO);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let text = stdout(&out);
    assert!(text.starts_with("@main() [regs 3]"), "stdout: {text}");
    assert!(text.contains("k1    \"hello\""), "stdout: {text}");
    assert!(text.contains("0001  CALLFN  1, k0"), "stdout: {text}");
}

#[test]
fn missing_file_is_reported() {
    let out = scriptvm().args(["run", "/nonexistent/program.json"]).output().expect("failed to run scriptvm");
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).contains("cannot read"));
}
