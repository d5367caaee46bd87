use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use roost_core::{Row, Value};
use roost_sqlite::{Arguments, Database, DatabaseOptions, DebugLogging};
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Output format for query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Json,
    Table,
}

#[derive(Debug, Parser)]
#[command(name = "roost")]
#[command(about = "Inspect and modify roost SQLite databases")]
#[command(version)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug with SQL statements).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one SQL statement and report affected rows.
    Exec(ExecArgs),
    /// Run one SQL query and print the rows.
    Query(QueryArgs),
    /// List tables with their live columns and indexes.
    Tables(DatabaseArgs),
    /// List the files backing a database.
    Files(DatabaseArgs),
    /// Write the default database options as YAML.
    Config(ConfigArgs),
}

#[derive(Debug, Args)]
struct DatabaseArgs {
    /// Database file path.
    #[arg(long)]
    db: PathBuf,
    /// YAML file with database options.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ExecArgs {
    #[command(flatten)]
    database: DatabaseArgs,
    /// Positional argument as a SQL literal (42, 1.5, 'text', X'ff', NULL).
    #[arg(long = "arg")]
    args: Vec<String>,
    /// SQL statement.
    sql: String,
}

#[derive(Debug, Args)]
struct QueryArgs {
    #[command(flatten)]
    database: DatabaseArgs,
    /// Positional argument as a SQL literal (42, 1.5, 'text', X'ff', NULL).
    #[arg(long = "arg")]
    args: Vec<String>,
    /// Output format.
    #[arg(long, default_value = "table")]
    format: OutputFormat,
    /// SQL query.
    sql: String,
}

#[derive(Debug, Args)]
struct ConfigArgs {
    /// Where to write the options file.
    #[arg(long)]
    output: PathBuf,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("Failed to start runtime: {e}"))
        .and_then(|runtime| runtime.block_on(run(cli)));

    if let Err(err) = result {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<(), String> {
    let verbose = cli.verbose;
    match cli.command {
        Command::Exec(args) => run_exec(args, verbose).await,
        Command::Query(args) => run_query(args, verbose).await,
        Command::Tables(args) => run_tables(args, verbose).await,
        Command::Files(args) => run_files(args, verbose).await,
        Command::Config(args) => run_config(args),
    }
}

// ---------------------------------------------------------------------------
// commands
// ---------------------------------------------------------------------------

async fn run_exec(args: ExecArgs, verbose: u8) -> Result<(), String> {
    let arguments = parse_arguments(&args.args)?;
    let db = open_database(&args.database, verbose)?;
    let affected = db
        .execute(&args.sql, arguments)
        .await
        .map_err(|e| format!("Statement failed: {e}"))?;
    close_database(&db).await?;
    println!("{affected} row(s) affected");
    Ok(())
}

async fn run_query(args: QueryArgs, verbose: u8) -> Result<(), String> {
    let arguments = parse_arguments(&args.args)?;
    let db = open_database(&args.database, verbose)?;
    let rows = db
        .query(&args.sql, arguments)
        .await
        .map_err(|e| format!("Query failed: {e}"))?;
    close_database(&db).await?;

    match args.format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&rows_to_json(&rows))
                .map_err(|e| format!("Failed to serialize rows: {e}"))?;
            println!("{json}");
        }
        OutputFormat::Table => print!("{}", format_table(&rows)),
    }
    Ok(())
}

async fn run_tables(args: DatabaseArgs, verbose: u8) -> Result<(), String> {
    let db = open_database(&args, verbose)?;
    let tables = db
        .list_tables()
        .await
        .map_err(|e| format!("Failed to list tables: {e}"))?;
    for table in &tables {
        let Some(schema) = db
            .live_schema(table)
            .await
            .map_err(|e| format!("Failed to read table '{table}': {e}"))?
        else {
            continue;
        };
        let key = schema.primary_key();
        println!("{table}");
        for column in &schema.columns {
            let mut line = format!("  {} {}", column.name, column.declared_type);
            if column.not_null {
                line.push_str(" NOT NULL");
            }
            if let Some(default) = &column.default {
                line.push_str(&format!(" DEFAULT {default}"));
            }
            if key.contains(&column.name) {
                line.push_str(" [key]");
            }
            println!("{line}");
        }
        for index in &schema.indexes {
            let kind = if index.unique { "unique index" } else { "index" };
            println!("  {kind} {} ({})", index.name, index.columns.join(", "));
        }
    }
    close_database(&db).await?;
    if tables.is_empty() {
        println!("No tables.");
    }
    Ok(())
}

async fn run_files(args: DatabaseArgs, verbose: u8) -> Result<(), String> {
    let db = open_database(&args, verbose)?;
    let files = db.file_paths();
    close_database(&db).await?;
    for file in files {
        let marker = if file.exists() { "" } else { " (absent)" };
        println!("{}{marker}", file.display());
    }
    Ok(())
}

fn run_config(args: ConfigArgs) -> Result<(), String> {
    DatabaseOptions::default()
        .save(&args.output)
        .map_err(|e| format!("Failed to write '{}': {e}", args.output.display()))?;
    println!("Wrote default options to '{}'.", args.output.display());
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn load_options(config: Option<&Path>) -> Result<DatabaseOptions, String> {
    match config {
        Some(path) => DatabaseOptions::load(path)
            .map_err(|e| format!("Failed to load config '{}': {e}", path.display())),
        None => Ok(DatabaseOptions::default()),
    }
}

fn open_database(args: &DatabaseArgs, verbose: u8) -> Result<Database, String> {
    let mut options = load_options(args.config.as_deref())?;
    if verbose >= 2 {
        options.debug = DebugLogging {
            queries: true,
            query_parameters: true,
            changes: true,
        };
    }
    debug!(db = %args.db.display(), "Opening database");
    Database::open_with_options(&args.db, options)
        .map_err(|e| format!("Failed to open database '{}': {e}", args.db.display()))
}

async fn close_database(db: &Database) -> Result<(), String> {
    db.close()
        .await
        .map_err(|e| format!("Failed to close database: {e}"))
}

/// Parses `--arg` literals into positional arguments.
fn parse_arguments(raw: &[String]) -> Result<Arguments, String> {
    raw.iter()
        .map(|literal| {
            Value::from_literal(literal).map_err(|e| format!("Invalid --arg {literal:?}: {e}"))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Arguments::Positional)
}

fn rows_to_json(rows: &[Row]) -> serde_json::Value {
    rows.iter()
        .map(|row| {
            row.iter()
                .map(|(column, value)| (column.to_string(), value.to_json()))
                .collect::<serde_json::Map<_, _>>()
        })
        .map(serde_json::Value::Object)
        .collect()
}

/// Text renders bare; everything else as its SQL literal.
fn cell(value: &Value) -> String {
    match value {
        Value::Text(text) => text.clone(),
        other => other.to_literal(),
    }
}

/// Renders rows as an aligned text table.
fn format_table(rows: &[Row]) -> String {
    let Some(first) = rows.first() else {
        return "(0 rows)\n".to_string();
    };
    let columns: Vec<&str> = first.columns().collect();
    let cells: Vec<Vec<String>> = rows
        .iter()
        .map(|row| {
            columns
                .iter()
                .map(|c| row.get(c).map(cell).unwrap_or_default())
                .collect()
        })
        .collect();

    let widths: Vec<usize> = columns
        .iter()
        .enumerate()
        .map(|(i, c)| {
            cells
                .iter()
                .map(|r| r[i].chars().count())
                .chain([c.chars().count()])
                .max()
                .unwrap_or(0)
        })
        .collect();

    let render = |values: Vec<&str>| -> String {
        values
            .iter()
            .zip(&widths)
            .map(|(v, &w)| format!("{v:<w$}"))
            .collect::<Vec<_>>()
            .join(" | ")
            .trim_end()
            .to_string()
    };

    let mut out = String::new();
    out.push_str(&render(columns.clone()));
    out.push('\n');
    out.push_str(
        &widths
            .iter()
            .map(|w| "-".repeat(*w))
            .collect::<Vec<_>>()
            .join("-+-"),
    );
    out.push('\n');
    for row in &cells {
        out.push_str(&render(row.iter().map(String::as_str).collect()));
        out.push('\n');
    }
    out.push_str(&format!("({} row{})\n", rows.len(), if rows.len() == 1 { "" } else { "s" }));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arguments() {
        let args = parse_arguments(&["42".into(), "'hi'".into(), "NULL".into()]).unwrap();
        assert_eq!(
            args,
            Arguments::Positional(vec![Value::Integer(42), Value::from("hi"), Value::Null])
        );
        assert!(parse_arguments(&["bare".into()]).is_err());
    }

    #[test]
    fn test_format_table() {
        let rows = vec![
            Row::new().with("id", 1).with("name", "ada"),
            Row::new().with("id", 10).with("name", Value::Null),
        ];
        let table = format_table(&rows);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines[0], "id | name");
        assert_eq!(lines[1], "---+-----");
        assert_eq!(lines[2], "1  | ada");
        assert_eq!(lines[4], "(2 rows)");
        assert_eq!(format_table(&[]), "(0 rows)\n");
    }

    #[test]
    fn test_rows_to_json() {
        let rows = vec![Row::new().with("id", 1).with("blob", vec![0xab_u8])];
        let json = rows_to_json(&rows);
        assert_eq!(json, serde_json::json!([{"id": 1, "blob": "X'ab'"}]));
    }
}
