//! formant: drive the dialogue engine from the command line.
//!
//! The CLI stands in for the surrounding chat application: it loads a
//! worksheet schema, feeds statement blocks (a file for `turn`, stdin
//! for `repl`) through the policy engine, and prints the agent acts and
//! the rendered state schema. Knowledge queries resolve against a canned
//! rows file, or to empty result sets when none is given.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use formant_engine::{
    load_registry, render, Config, EmptyQueryRunner, QueryRunner, Registry, Row, Runtime,
    StaticQueryRunner, Value,
};

#[derive(Parser)]
#[command(name = "formant", version, about = "Form-filling dialogue engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one policy turn over a statement block and print the acts.
    Turn {
        /// Worksheet schema JSON file.
        #[arg(long)]
        schema: PathBuf,
        /// Statement block file (the user target).
        #[arg(long)]
        input: PathBuf,
        /// Canned knowledge-base rows served to every query.
        #[arg(long)]
        rows: Option<PathBuf>,
        /// Allow the policy to open a fresh worksheet.
        #[arg(long)]
        open_ws: bool,
    },
    /// Interactive loop: statement blocks in, acts out. A blank line
    /// ends a block; EOF or `exit` ends the session.
    Repl {
        #[arg(long)]
        schema: PathBuf,
        #[arg(long)]
        rows: Option<PathBuf>,
        #[arg(long)]
        open_ws: bool,
    },
    /// Print the semantic-parser schema for a worksheet file.
    Schema {
        #[arg(long)]
        schema: PathBuf,
    },
}

fn load_schema(path: &PathBuf) -> Result<Registry, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    load_registry(&text).map_err(|e| format!("{}: {}", path.display(), e))
}

fn load_rows(path: &PathBuf) -> Result<Vec<Row>, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    let json: serde_json::Value =
        serde_json::from_str(&text).map_err(|e| format!("{}: {}", path.display(), e))?;
    let items = json
        .as_array()
        .ok_or_else(|| format!("{}: expected a JSON array of rows", path.display()))?;
    let mut rows = Vec::with_capacity(items.len());
    for item in items {
        let obj = item
            .as_object()
            .ok_or_else(|| format!("{}: each row must be an object", path.display()))?;
        let mut row = Row::new();
        for (key, value) in obj {
            let value = Value::from_json(value)
                .map_err(|e| format!("{}: column '{}': {}", path.display(), key, e))?;
            row.insert(key.clone(), value);
        }
        rows.push(row);
    }
    Ok(rows)
}

fn build_runtime(
    schema: &PathBuf,
    rows: Option<&PathBuf>,
    open_ws: bool,
) -> Result<Runtime, String> {
    let registry = load_schema(schema)?;
    let runner: Arc<dyn QueryRunner> = match rows {
        Some(path) => Arc::new(StaticQueryRunner::new(load_rows(path)?)),
        None => Arc::new(EmptyQueryRunner),
    };
    // The env var mirrors the --open-ws flag for scripted runs.
    let open_env = std::env::var("FORMANT_OPEN_WS")
        .map(|v| !matches!(v.trim().to_lowercase().as_str(), "" | "0" | "false" | "no"))
        .unwrap_or(false);
    Ok(Runtime::new(registry, runner).with_config(Config {
        open_new_worksheet: open_ws || open_env,
    }))
}

async fn run_turn_and_print(rt: &mut Runtime, target: &str) {
    let turn = rt.run_turn(None, target).await;
    println!("user target:");
    for line in turn.user_target.lines() {
        println!("  {}", line);
    }
    println!("agent acts:");
    if turn.system_acts.is_empty() {
        println!("  (none)");
    }
    for act in &turn.system_acts {
        println!("  {}", act);
    }
    let state = render::context_schema(&rt.context, true);
    println!("state:");
    if state.is_empty() {
        println!("  (empty)");
    }
    for line in state.lines() {
        println!("  {}", line);
    }
}

async fn repl(mut rt: Runtime) -> Result<(), String> {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("> ");
        let _ = io::stdout().flush();
        let mut block = String::new();
        loop {
            match lines.next() {
                Some(Ok(line)) => {
                    let trimmed = line.trim();
                    if trimmed == "exit" {
                        return Ok(());
                    }
                    if trimmed.is_empty() {
                        break;
                    }
                    block.push_str(&line);
                    block.push('\n');
                }
                Some(Err(e)) => return Err(e.to_string()),
                None => return Ok(()),
            }
        }
        if block.trim().is_empty() {
            continue;
        }
        run_turn_and_print(&mut rt, &block).await;
    }
}

async fn run(cli: Cli) -> Result<(), String> {
    match cli.command {
        Command::Turn {
            schema,
            input,
            rows,
            open_ws,
        } => {
            let mut rt = build_runtime(&schema, rows.as_ref(), open_ws)?;
            let target = std::fs::read_to_string(&input)
                .map_err(|e| format!("cannot read {}: {}", input.display(), e))?;
            run_turn_and_print(&mut rt, &target).await;
            Ok(())
        }
        Command::Repl {
            schema,
            rows,
            open_ws,
        } => {
            let rt = build_runtime(&schema, rows.as_ref(), open_ws)?;
            repl(rt).await
        }
        Command::Schema { schema } => {
            let registry = load_schema(&schema)?;
            println!("{}", render::registry_schema(&registry));
            Ok(())
        }
    }
}

// Worksheet instances are single-threaded by design, so the whole CLI
// runs on a current-thread runtime.
#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("error: {}", message);
            ExitCode::FAILURE
        }
    }
}
