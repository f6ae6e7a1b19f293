//! Interactive shell for nested transactions over the in-memory backend.
//!
//! `BEGIN`, `COMMIT` and `ROLLBACK` open and close scopes on a stack of
//! transaction handles; every other line is a statement executed on
//! whatever connection the transaction source hands out.

use std::io::{self, BufRead, Write};
use std::time::Instant;

use serde_json::Value;
use thiserror::Error;

use crate::connection::{Connection, MemoryDatabase, QueryResult};
use crate::error::TxError;
use crate::owner::OwnerId;
use crate::transaction::{TransactionHandle, TransactionSource};

/// Result type for shell operations.
pub type ReplResult<T> = Result<T, ReplError>;

/// Shell errors.
#[derive(Debug, Error)]
pub enum ReplError {
    #[error("transaction error: {0}")]
    Transaction(#[from] TxError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// REPL configuration.
#[derive(Debug, Clone)]
pub struct ReplConfig {
    /// Prompt string.
    pub prompt: String,
    /// Show timing information.
    pub timing: bool,
    /// Max rows to display.
    pub max_rows: usize,
}

impl Default for ReplConfig {
    fn default() -> Self {
        Self {
            prompt: "nestedtx> ".into(),
            timing: false,
            max_rows: 100,
        }
    }
}

/// The interactive shell.
pub struct Repl {
    db: MemoryDatabase,
    source: TransactionSource,
    config: ReplConfig,
    /// Open scopes, innermost last.
    scopes: Vec<TransactionHandle>,
    history: Vec<String>,
}

impl Repl {
    /// Create a shell over the given database.
    pub fn new(db: MemoryDatabase) -> Self {
        Self::with_config(db, ReplConfig::default())
    }

    /// Create a shell with custom configuration.
    pub fn with_config(db: MemoryDatabase, config: ReplConfig) -> Self {
        let source = TransactionSource::new(db.clone());
        Self {
            db,
            source,
            config,
            scopes: Vec::new(),
            history: Vec::new(),
        }
    }

    /// The transaction source driven by this shell.
    pub fn source(&self) -> &TransactionSource {
        &self.source
    }

    /// Number of open scopes.
    pub fn open_scopes(&self) -> usize {
        self.scopes.len()
    }

    /// Run the shell on stdin/stdout.
    pub fn run(&mut self) -> ReplResult<()> {
        let stdin = io::stdin();
        let mut stdout = io::stdout();
        self.run_with(stdin.lock(), &mut stdout)
    }

    /// Run the shell on arbitrary input and output.
    pub fn run_with(&mut self, mut input: impl BufRead, out: &mut impl Write) -> ReplResult<()> {
        writeln!(out, "nestedtx {}", env!("CARGO_PKG_VERSION"))?;
        writeln!(out, "Type .help for commands")?;

        loop {
            write!(out, "{}", self.prompt())?;
            out.flush()?;

            let mut line = String::new();
            if input.read_line(&mut line)? == 0 {
                writeln!(out)?;
                break;
            }

            match self.execute(line.trim(), out) {
                Ok(true) => break,
                Ok(false) => {}
                Err(ReplError::Transaction(e)) => writeln!(out, "Error: {}", e)?,
                Err(e) => return Err(e),
            }
        }

        self.finish(out)
    }

    /// Run `;`-separated commands, stopping at the first failure.
    pub fn run_batch(&mut self, script: &str, out: &mut impl Write) -> ReplResult<()> {
        for command in split_commands(script) {
            if self.execute(&command, out)? {
                break;
            }
        }
        self.finish(out)
    }

    /// Execute one line. Returns true when the shell should exit.
    pub fn execute(&mut self, line: &str, out: &mut impl Write) -> ReplResult<bool> {
        let line = line.trim().trim_end_matches(';').trim();
        if line.is_empty() {
            return Ok(false);
        }
        self.history.push(line.to_string());

        if line.starts_with('.') {
            return self.handle_command(line, out);
        }

        let start = Instant::now();
        match line.to_uppercase().as_str() {
            "BEGIN" => self.begin(out)?,
            "COMMIT" => self.commit(out)?,
            "ROLLBACK" => self.rollback(out)?,
            _ => {
                let result = self.source.connection()?.execute(line)?;
                self.print_result(&result, out)?;
            }
        }
        if self.config.timing {
            writeln!(out, "Time: {:.3}ms", start.elapsed().as_secs_f64() * 1000.0)?;
        }
        Ok(false)
    }

    /// Roll back every scope still open.
    pub fn finish(&mut self, out: &mut impl Write) -> ReplResult<()> {
        if self.scopes.is_empty() {
            return Ok(());
        }
        writeln!(out, "Rolling back {} open scope(s)", self.scopes.len())?;
        while let Some(scope) = self.scopes.pop() {
            scope.rollback()?;
        }
        Ok(())
    }

    fn prompt(&self) -> String {
        if self.scopes.is_empty() {
            self.config.prompt.clone()
        } else {
            format!("{}[{}] ", self.config.prompt.trim_end(), self.scopes.len())
        }
    }

    fn begin(&mut self, out: &mut impl Write) -> ReplResult<()> {
        let scope = self.source.begin_transaction()?;
        writeln!(out, "BEGIN (depth {})", scope.depth())?;
        self.scopes.push(scope);
        Ok(())
    }

    fn commit(&mut self, out: &mut impl Write) -> ReplResult<()> {
        let Some(mut scope) = self.scopes.pop() else {
            writeln!(out, "No open scope")?;
            return Ok(());
        };
        scope.commit()?;
        if self.scopes.is_empty() {
            writeln!(out, "COMMIT (written)")?;
        } else {
            writeln!(out, "COMMIT (depth {})", scope.depth())?;
        }
        Ok(())
    }

    fn rollback(&mut self, out: &mut impl Write) -> ReplResult<()> {
        let Some(scope) = self.scopes.pop() else {
            writeln!(out, "No open scope")?;
            return Ok(());
        };
        scope.rollback()?;
        writeln!(out, "ROLLBACK (transaction aborted)")?;
        if !self.scopes.is_empty() {
            writeln!(
                out,
                "{} enclosing scope(s) can no longer commit",
                self.scopes.len()
            )?;
        }
        Ok(())
    }

    fn handle_command(&mut self, cmd: &str, out: &mut impl Write) -> ReplResult<bool> {
        let command = cmd.trim_start_matches('.').to_lowercase();
        match command.as_str() {
            "help" | "h" | "?" => self.print_help(out)?,
            "quit" | "exit" | "q" => return Ok(true),
            "status" => self.print_status(out)?,
            "stats" => {
                let stats = self.db.stats();
                writeln!(out, "Keys:        {}", self.db.len())?;
                writeln!(out, "Connections: {} opened, {} closed", stats.opened, stats.closed)?;
                writeln!(out, "Commits:     {}", stats.commits)?;
                writeln!(out, "Rollbacks:   {}", stats.rollbacks)?;
            }
            "history" => {
                for (i, line) in self.history.iter().enumerate() {
                    writeln!(out, "{:4}  {}", i + 1, line)?;
                }
            }
            "timing" => {
                self.config.timing = !self.config.timing;
                writeln!(out, "Timing: {}", if self.config.timing { "on" } else { "off" })?;
            }
            other => {
                writeln!(out, "Unknown command: .{}", other)?;
                writeln!(out, "Type .help for available commands")?;
            }
        }
        Ok(false)
    }

    fn print_help(&self, out: &mut impl Write) -> ReplResult<()> {
        writeln!(out, "Commands:")?;
        writeln!(out, "  .help, .h, .?           Show this help message")?;
        writeln!(out, "  .quit, .exit, .q        Exit the shell")?;
        writeln!(out, "  .status                 Show the open transaction")?;
        writeln!(out, "  .stats                  Show backend counters")?;
        writeln!(out, "  .history                Show command history")?;
        writeln!(out, "  .timing                 Toggle timing display")?;
        writeln!(out)?;
        writeln!(out, "Scopes:")?;
        writeln!(out, "  BEGIN                   Open a (nested) scope")?;
        writeln!(out, "  COMMIT                  Commit the innermost scope")?;
        writeln!(out, "  ROLLBACK                Roll back the whole transaction")?;
        writeln!(out)?;
        writeln!(out, "Statements:")?;
        writeln!(out, "  PUT <key> <json>")?;
        writeln!(out, "  GET <key>")?;
        writeln!(out, "  DELETE <key>")?;
        writeln!(out, "  SCAN [prefix]")?;
        Ok(())
    }

    fn print_status(&self, out: &mut impl Write) -> ReplResult<()> {
        match self.source.transaction_info(OwnerId::current()) {
            Some(info) => {
                writeln!(out, "Transaction: {}", info.id)?;
                writeln!(out, "Owner:       {}", info.owner)?;
                writeln!(out, "Depth:       {}", info.depth)?;
                writeln!(out, "Started:     {}", info.started_at.to_rfc3339())?;
            }
            None => writeln!(out, "No active transaction")?,
        }
        if self.scopes.iter().any(|scope| scope.depth() < 0) {
            writeln!(out, "{} dead scope(s) still open", self.scopes.len())?;
        }
        Ok(())
    }

    fn print_result(&self, result: &QueryResult, out: &mut impl Write) -> ReplResult<()> {
        match result {
            QueryResult::Modified { rows_affected } => {
                writeln!(out, "{} row(s) modified", rows_affected)?;
            }
            QueryResult::Rows(rs) => {
                if rs.is_empty() {
                    writeln!(out, "(0 rows)")?;
                    return Ok(());
                }
                writeln!(out, "{}", rs.columns.join("\t"))?;
                for row in rs.iter().take(self.config.max_rows) {
                    let values: Vec<String> = rs
                        .columns
                        .iter()
                        .map(|col| row.get(col).map(format_value).unwrap_or_default())
                        .collect();
                    writeln!(out, "{}", values.join("\t"))?;
                }
                if rs.len() > self.config.max_rows {
                    writeln!(out, "... {} more", rs.len() - self.config.max_rows)?;
                }
                writeln!(out, "({} rows)", rs.len())?;
            }
        }
        Ok(())
    }
}

fn format_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        _ => value.to_string(),
    }
}

/// Split on `;` outside of double-quoted strings.
fn split_commands(script: &str) -> Vec<String> {
    let mut commands = Vec::new();
    let mut current = String::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in script.chars() {
        match c {
            _ if escaped => escaped = false,
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            ';' if !in_string => {
                commands.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    commands.push(current);

    commands
        .into_iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(script: &str) -> (MemoryDatabase, String) {
        let db = MemoryDatabase::default();
        let mut repl = Repl::new(db.clone());
        let mut out = Vec::new();
        let _ = repl.run_batch(script, &mut out);
        (db, String::from_utf8(out).unwrap())
    }

    #[test]
    fn test_split_commands() {
        assert_eq!(
            split_commands("BEGIN; PUT a \"x;y\" ;COMMIT;"),
            vec!["BEGIN", "PUT a \"x;y\"", "COMMIT"]
        );
        assert_eq!(split_commands("PUT a \"q\\\";\""), vec!["PUT a \"q\\\";\""]);
    }

    #[test]
    fn test_nested_commit_writes_once() {
        let (db, out) = run("BEGIN; PUT a 1; BEGIN; PUT b 2; COMMIT; COMMIT");
        assert_eq!(db.get("a"), Some(json!(1)));
        assert_eq!(db.get("b"), Some(json!(2)));
        assert_eq!(db.stats().commits, 1);
        assert!(out.contains("COMMIT (depth 0)"));
        assert!(out.contains("COMMIT (written)"));
    }

    #[test]
    fn test_inner_rollback_aborts_outer() {
        let (db, out) = run("BEGIN; PUT a 1; BEGIN; ROLLBACK; COMMIT");
        assert_eq!(db.get("a"), None);
        assert!(out.contains("1 enclosing scope(s) can no longer commit"));
        assert_eq!(db.stats().rollbacks, 1);
    }

    #[test]
    fn test_open_scopes_roll_back_at_exit() {
        let (db, out) = run("BEGIN; PUT a 1");
        assert_eq!(db.get("a"), None);
        assert!(out.contains("Rolling back 1 open scope(s)"));
    }

    #[test]
    fn test_interactive_session() {
        let db = MemoryDatabase::default();
        let mut repl = Repl::new(db.clone());
        let input = "PUT a \"x\"\nGET a\n.bogus\nGET\n.quit\nPUT b 1\n";
        let mut out = Vec::new();
        repl.run_with(input.as_bytes(), &mut out).unwrap();

        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("1 row(s) modified"));
        assert!(out.contains("a\tx"));
        assert!(out.contains("Unknown command: .bogus"));
        assert!(out.contains("Error: invalid statement"));
        assert_eq!(db.get("b"), None);
    }

    #[test]
    fn test_status() {
        let db = MemoryDatabase::default();
        let mut repl = Repl::new(db);
        let mut out = Vec::new();
        repl.execute("BEGIN", &mut out).unwrap();
        repl.execute(".status", &mut out).unwrap();
        assert_eq!(repl.open_scopes(), 1);

        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("Depth:       0"));
        assert!(out.contains(&OwnerId::current().to_string()));
    }
}
