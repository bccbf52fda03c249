// Rendering for command results and diagnostics.
//
// Results go to stdout: text on a terminal, one JSON object per line when
// piped or with `--json`, so a `watch` stream can be consumed line by line.
// Diagnostics go to stderr in the same format, tagged with a stable code.

use serde::Serialize;
use std::io::{self, IsTerminal, Write};

const ANSI_RED: &str = "\x1b[31m";
const ANSI_YELLOW: &str = "\x1b[33m";
const ANSI_RESET: &str = "\x1b[0m";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Human,
    /// One JSON object per line.
    Json,
}

impl OutputFormat {
    /// JSON if `--json` was passed or stdout is not a terminal.
    pub fn detect(json_flag: bool) -> Self {
        if json_flag {
            return Self::Json;
        }
        Self::detect_from_terminal(io::stdout().is_terminal())
    }

    pub fn detect_from_terminal(is_tty: bool) -> Self {
        if is_tty {
            Self::Human
        } else {
            Self::Json
        }
    }
}

pub fn print_output<T, F>(format: OutputFormat, value: &T, human_fn: F) -> io::Result<()>
where
    T: Serialize,
    F: FnOnce(&T) -> String,
{
    write_output(&mut io::stdout().lock(), format, value, human_fn)
}

/// Write one result. `human_fn` is only called for `Human`.
pub fn write_output<W, T, F>(
    writer: &mut W,
    format: OutputFormat,
    value: &T,
    human_fn: F,
) -> io::Result<()>
where
    W: Write,
    T: Serialize,
    F: FnOnce(&T) -> String,
{
    match format {
        OutputFormat::Human => writeln!(writer, "{}", human_fn(value)),
        OutputFormat::Json => {
            serde_json::to_writer(&mut *writer, value).map_err(io::Error::other)?;
            writeln!(writer)
        }
    }
}

// ── Diagnostics ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Severity {
    Error,
    Warning,
}

impl Severity {
    fn label(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
        }
    }

    fn color(self) -> &'static str {
        match self {
            Self::Error => ANSI_RED,
            Self::Warning => ANSI_YELLOW,
        }
    }
}

fn render_diagnostic(
    severity: Severity,
    format: OutputFormat,
    code: &str,
    message: &str,
    is_tty: bool,
) -> String {
    let label = severity.label();
    match format {
        OutputFormat::Human if is_tty => {
            format!("{}{label}:{ANSI_RESET} {message}", severity.color())
        }
        OutputFormat::Human => format!("{label}: {message}"),
        OutputFormat::Json => {
            serde_json::json!({ label: { "code": code, "message": message } }).to_string()
        }
    }
}

fn emit(severity: Severity, format: OutputFormat, code: &str, message: &str) {
    let line = render_diagnostic(severity, format, code, message, io::stderr().is_terminal());
    let _ = writeln!(io::stderr().lock(), "{line}");
}

pub fn print_error(format: OutputFormat, code: &str, message: &str) {
    emit(Severity::Error, format, code, message);
}

pub fn print_warning(format: OutputFormat, code: &str, message: &str) {
    emit(Severity::Warning, format, code, message);
}

/// Print a mapped, actionable error for a command failure.
pub fn print_anyhow_error(format: OutputFormat, error: &anyhow::Error) {
    let (code, message) = actionable_error(error);
    print_error(format, code, &message);
}

fn actionable_error(error: &anyhow::Error) -> (&'static str, String) {
    let message = format!("{error:#}");
    let lower = message.to_ascii_lowercase();

    if lower.contains("no stored session") {
        return (
            "NOT_LOGGED_IN",
            "No stored session. Run: workshop-sync token --set <TOKEN>".to_string(),
        );
    }

    if lower.contains("rejected the credential")
        || lower.contains("unauthorized")
        || lower.contains("invalid token")
        || lower.contains("expired")
    {
        return (
            "AUTH_FAILURE",
            "The server rejected the stored token. Log in again with: \
             workshop-sync token --set <TOKEN>"
                .to_string(),
        );
    }

    if lower.contains("timed out") {
        return (
            "NETWORK_TIMEOUT",
            "Timed out talking to the server. Check `server_url` in ~/.workshop-sync/config.toml"
                .to_string(),
        );
    }

    if lower.contains("connection refused")
        || lower.contains("dns error")
        || lower.contains("error sending request")
    {
        return (
            "SERVER_UNREACHABLE",
            format!("Could not reach the server ({message}). Is it running?"),
        );
    }

    if lower.contains("config") {
        return ("CONFIG_ERROR", message);
    }

    ("ERROR", message)
}
