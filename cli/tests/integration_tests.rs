use std::path::Path;
use std::process::{Command, Output};

use tempfile::TempDir;

fn roost(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_roost"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run roost")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn db_arg(path: &Path) -> String {
    path.display().to_string()
}

#[test]
fn test_exec_then_query_json() {
    let dir = TempDir::new().unwrap();
    let db = db_arg(&dir.path().join("cli.db"));

    let created = roost(&["exec", "--db", &db, "CREATE TABLE kv (k TEXT PRIMARY KEY, v)"]);
    assert!(created.status.success(), "{created:?}");

    let inserted = roost(&[
        "exec", "--db", &db, "--arg", "'alpha'", "--arg", "42", "INSERT INTO kv VALUES (?, ?)",
    ]);
    assert!(inserted.status.success(), "{inserted:?}");
    assert!(stdout(&inserted).contains("1 row(s) affected"));

    let queried = roost(&["query", "--db", &db, "--format", "json", "SELECT k, v FROM kv"]);
    assert!(queried.status.success(), "{queried:?}");
    let rows: serde_json::Value = serde_json::from_str(&stdout(&queried)).unwrap();
    assert_eq!(rows, serde_json::json!([{"k": "alpha", "v": 42}]));
}

#[test]
fn test_query_table_output() {
    let dir = TempDir::new().unwrap();
    let db = db_arg(&dir.path().join("table.db"));
    roost(&["exec", "--db", &db, "CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)"]);
    roost(&["exec", "--db", &db, "INSERT INTO t VALUES (1, 'ada'), (2, 'grace')"]);

    let output = roost(&["query", "--db", &db, "SELECT * FROM t ORDER BY id"]);
    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("grace"));
    assert!(text.trim_end().ends_with("(2 rows)"));
}

#[test]
fn test_tables_lists_columns() {
    let dir = TempDir::new().unwrap();
    let db = db_arg(&dir.path().join("tables.db"));
    roost(&["exec", "--db", &db, "CREATE TABLE people (id INTEGER NOT NULL, email TEXT, PRIMARY KEY (id))"]);
    roost(&["exec", "--db", &db, "CREATE UNIQUE INDEX people_email ON people (email)"]);

    let output = roost(&["tables", "--db", &db]);
    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("people"));
    assert!(text.contains("id INTEGER NOT NULL [key]"));
    assert!(text.contains("unique index people_email (email)"));
}

#[test]
fn test_files_lists_companions() {
    let dir = TempDir::new().unwrap();
    let db = db_arg(&dir.path().join("files.db"));

    let output = roost(&["files", "--db", &db]);
    assert!(output.status.success());
    let lines: Vec<String> = stdout(&output).lines().map(str::to_string).collect();
    assert_eq!(lines.len(), 4);
    assert!(lines[0].ends_with("files.db"));
    assert!(lines[3].contains("files.db-journal"));
}

#[test]
fn test_config_round_trip() {
    let dir = TempDir::new().unwrap();
    let config = db_arg(&dir.path().join("roost.yaml"));
    let db = db_arg(&dir.path().join("configured.db"));

    let written = roost(&["config", "--output", &config]);
    assert!(written.status.success());
    let yaml = std::fs::read_to_string(&config).unwrap();
    assert!(yaml.contains("journal_mode: wal"));

    let output = roost(&["exec", "--db", &db, "--config", &config, "CREATE TABLE x (a)"]);
    assert!(output.status.success(), "{output:?}");
}

#[test]
fn test_errors_exit_nonzero() {
    let dir = TempDir::new().unwrap();
    let db = db_arg(&dir.path().join("errors.db"));

    let bad_sql = roost(&["exec", "--db", &db, "SELEC 1"]);
    assert!(!bad_sql.status.success());
    assert!(String::from_utf8_lossy(&bad_sql.stderr).contains("error:"));

    let bad_arg = roost(&["query", "--db", &db, "--arg", "bare", "SELECT ?"]);
    assert!(!bad_arg.status.success());
    assert!(String::from_utf8_lossy(&bad_arg.stderr).contains("Invalid --arg"));
}
