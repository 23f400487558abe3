//! Prompt helpers with inquire → stdin fallback.
//!
//! When `inquire` cannot drive the terminal (piped stdin, CI) the prompts fall
//! back to plain line reads on stdin, with the question written to stderr so
//! stdout stays machine-readable.

use std::io::{self, BufRead, Write};

use inquire::{Confirm, InquireError, Select, Text};

use crate::cli::CliError;

pub trait Prompter {
    fn input(&self, message: &str) -> Result<String, CliError>;
    fn confirm(&self, message: &str, default: bool) -> Result<bool, CliError>;
    fn select(&self, message: &str, options: &[String]) -> Result<String, CliError>;
}

/// Re-prompts until `validate` accepts the value. `validate` receives the
/// candidate and the attempt index (0 for `initial`, then 1, 2, ...) and
/// returns the message to prompt with, or `None` to accept.
pub fn prompt_until_valid<F>(
    prompter: &dyn Prompter,
    initial: &str,
    validate: F,
) -> Result<String, CliError>
where
    F: Fn(&str, u32) -> Option<String>,
{
    let mut value = initial.to_string();
    let mut attempt = 0u32;
    loop {
        match validate(&value, attempt) {
            None => return Ok(value),
            Some(message) => {
                value = prompter.input(&message)?;
                attempt = attempt.saturating_add(1);
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompter;

impl Prompter for TerminalPrompter {
    fn input(&self, message: &str) -> Result<String, CliError> {
        match Text::new(inquire_label(message)).prompt() {
            Ok(value) => Ok(value),
            Err(err) if is_cancel(&err) => Err(cancelled()),
            Err(_) => {
                write_question(message)?;
                read_line()
            }
        }
    }

    fn confirm(&self, message: &str, default: bool) -> Result<bool, CliError> {
        match Confirm::new(message).with_default(default).prompt() {
            Ok(value) => Ok(value),
            Err(err) if is_cancel(&err) => Err(cancelled()),
            Err(_) => {
                let hint = if default { "Y/n" } else { "y/N" };
                write_question(&format!("{message} ({hint}) "))?;
                let input = read_line()?;
                match input.trim().to_lowercase().as_str() {
                    "y" | "yes" => Ok(true),
                    "n" | "no" => Ok(false),
                    _ => Ok(default),
                }
            }
        }
    }

    fn select(&self, message: &str, options: &[String]) -> Result<String, CliError> {
        if options.is_empty() {
            return Err(CliError::Prompt("nothing to select".to_string()));
        }
        match Select::new(message, options.to_vec()).prompt() {
            Ok(value) => Ok(value),
            Err(err) if is_cancel(&err) => Err(cancelled()),
            Err(_) => {
                let mut out = io::stderr();
                writeln!(out)?;
                for (idx, option) in options.iter().enumerate() {
                    writeln!(out, "  [{idx}] {option}")?;
                }
                loop {
                    write_question(&format!("{message} "))?;
                    let input = read_line()?;
                    let input = input.trim();
                    if let Some(option) = input
                        .parse::<usize>()
                        .ok()
                        .and_then(|idx| options.get(idx))
                    {
                        return Ok(option.clone());
                    }
                    if let Some(option) = options.iter().find(|option| **option == input) {
                        return Ok(option.clone());
                    }
                }
            }
        }
    }
}

fn inquire_label(message: &str) -> &str {
    message.trim_end_matches([':', ' '])
}

fn is_cancel(err: &InquireError) -> bool {
    matches!(
        err,
        InquireError::OperationCanceled | InquireError::OperationInterrupted
    )
}

fn cancelled() -> CliError {
    CliError::Aborted("Cancelled".to_string())
}

fn write_question(message: &str) -> Result<(), CliError> {
    let mut out = io::stderr();
    out.write_all(message.as_bytes())?;
    out.flush()?;
    Ok(())
}

/// Read a line from stdin without its line ending; end of input is an error
/// so callers that re-prompt cannot spin forever.
fn read_line() -> Result<String, CliError> {
    let mut input = String::new();
    let read = io::stdin().lock().read_line(&mut input)?;
    if read == 0 {
        return Err(CliError::Prompt("no more input available".to_string()));
    }
    Ok(strip_line_ending(&input).to_string())
}

/// Only the line ending goes; surrounding spaces may be part of a password.
fn strip_line_ending(line: &str) -> &str {
    line.strip_suffix('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .unwrap_or(line)
}
