//! Interactive prompt frontend seam.
//!
//! [`PromptFrontend`] is the boundary to whatever actually renders a prompt
//! (a terminal, a TUI, a test double).  The tunnel core only needs the four
//! primitives and their cancellation behavior: dropping a returned future
//! must abandon the pending prompt, which is how timeout races cancel the UI.
//!
//! [`TerminalFrontend`] is the default line-oriented implementation over
//! stdin/stdout.

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::tunnel::protocol::{PromptChoice, PromptConfig};
use crate::{AppError, Result};

/// Boxed future returned by frontend primitives.
pub type PromptFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Boundary to an interactive prompt UI.
///
/// Implementations must tolerate their futures being dropped before
/// completion (timeout cancellation) without corrupting later prompts.
pub trait PromptFrontend: Send + Sync {
    /// Free-text input prompt.
    fn input(&self, config: &PromptConfig) -> PromptFuture<'_, String>;

    /// Yes/no confirmation prompt.
    fn confirm(&self, config: &PromptConfig) -> PromptFuture<'_, bool>;

    /// Single-selection prompt; resolves to the chosen choice's value.
    fn select(&self, config: &PromptConfig) -> PromptFuture<'_, Value>;

    /// Multi-selection prompt; resolves to the checked choices' values in
    /// list order.
    fn checkbox(&self, config: &PromptConfig) -> PromptFuture<'_, Vec<Value>>;
}

// ── Terminal implementation ───────────────────────────────────────────────────

/// Line-oriented prompt frontend over stdin/stdout.
///
/// Selections are entered as 1-based indices; checkbox prompts accept a
/// comma-separated index list.  An empty answer takes the configured default
/// where one exists.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalFrontend;

impl TerminalFrontend {
    /// Create a terminal frontend.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl PromptFrontend for TerminalFrontend {
    fn input(&self, config: &PromptConfig) -> PromptFuture<'_, String> {
        let config = config.clone();
        Box::pin(async move {
            let default_text = config.default.as_ref().and_then(Value::as_str);
            let mut banner = config.message.clone();
            if let Some(hint) = &config.validation_hint {
                banner.push_str(&format!(" ({hint})"));
            }
            if let Some(default) = default_text {
                banner.push_str(&format!(" [{default}]"));
            }
            banner.push_str(": ");
            write_text(&banner).await?;

            let answer = read_line_trimmed().await?;
            if answer.is_empty() {
                if let Some(default) = default_text {
                    return Ok(default.to_owned());
                }
            }
            Ok(answer)
        })
    }

    fn confirm(&self, config: &PromptConfig) -> PromptFuture<'_, bool> {
        let config = config.clone();
        Box::pin(async move {
            let default = config.default.as_ref().and_then(Value::as_bool);
            let suffix = match default {
                Some(true) => "[Y/n]",
                Some(false) => "[y/N]",
                None => "[y/n]",
            };
            loop {
                write_text(&format!("{} {suffix}: ", config.message)).await?;
                let answer = read_line_trimmed().await?;
                if let Some(decision) = parse_yes_no(&answer, default) {
                    return Ok(decision);
                }
                write_text("Please answer 'y' or 'n'.\n").await?;
            }
        })
    }

    fn select(&self, config: &PromptConfig) -> PromptFuture<'_, Value> {
        let config = config.clone();
        Box::pin(async move {
            let choices = required_choices(&config)?;
            loop {
                write_text(&format!("{}\n", config.message)).await?;
                for (index, choice) in choices.iter().enumerate() {
                    write_text(&render_choice_line(index, choice, None)).await?;
                }
                write_text("Enter a number: ").await?;

                let answer = read_line_trimmed().await?;
                if answer.is_empty() {
                    if let Some(default) = default_choice_value(&config, choices) {
                        return Ok(default);
                    }
                }
                if let Some(index) = parse_selection(&answer, choices.len()) {
                    return Ok(choices[index].value.clone());
                }
                write_text("Invalid selection.\n").await?;
            }
        })
    }

    fn checkbox(&self, config: &PromptConfig) -> PromptFuture<'_, Vec<Value>> {
        let config = config.clone();
        Box::pin(async move {
            let choices = required_choices(&config)?;
            let preset = checked_indices(choices);
            loop {
                write_text(&format!("{}\n", config.message)).await?;
                for (index, choice) in choices.iter().enumerate() {
                    let checked = preset.contains(&index);
                    write_text(&render_choice_line(index, choice, Some(checked))).await?;
                }
                write_text("Enter numbers separated by commas (empty keeps the checked set): ")
                    .await?;

                let answer = read_line_trimmed().await?;
                if answer.is_empty() {
                    return Ok(values_at(choices, &preset));
                }
                if let Some(indices) = parse_multi_selection(&answer, choices.len()) {
                    return Ok(values_at(choices, &indices));
                }
                write_text("Invalid selection.\n").await?;
            }
        })
    }
}

// ── Terminal I/O helpers ──────────────────────────────────────────────────────

/// Write `text` to stdout and flush so the prompt is visible before reading.
async fn write_text(text: &str) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(text.as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}

/// Read one line from stdin; EOF counts as cancellation.
async fn read_line_trimmed() -> Result<String> {
    let mut reader = BufReader::new(tokio::io::stdin());
    let mut line = String::new();
    let read = reader.read_line(&mut line).await?;
    if read == 0 {
        return Err(AppError::Frontend("prompt cancelled: stdin closed".into()));
    }
    Ok(line.trim().to_owned())
}

// ── Pure helpers ──────────────────────────────────────────────────────────────

/// The choice list, which select/checkbox prompts require.
fn required_choices(config: &PromptConfig) -> Result<&[PromptChoice]> {
    config
        .choices
        .as_deref()
        .filter(|choices| !choices.is_empty())
        .ok_or_else(|| AppError::Frontend("prompt has no choices to offer".into()))
}

/// Resolve the configured default to a concrete choice value, when the
/// default matches one of the offered choices.
fn default_choice_value(config: &PromptConfig, choices: &[PromptChoice]) -> Option<Value> {
    let default = config.default.as_ref()?;
    choices
        .iter()
        .find(|choice| &choice.value == default)
        .map(|choice| choice.value.clone())
}

/// Interpret a yes/no answer; empty input takes the default when present.
fn parse_yes_no(input: &str, default: Option<bool>) -> Option<bool> {
    match input.to_ascii_lowercase().as_str() {
        "" => default,
        "y" | "yes" => Some(true),
        "n" | "no" => Some(false),
        _ => None,
    }
}

/// Parse a 1-based selection index into a 0-based one.
fn parse_selection(input: &str, len: usize) -> Option<usize> {
    let picked: usize = input.parse().ok()?;
    (1..=len).contains(&picked).then(|| picked - 1)
}

/// Parse a comma-separated list of 1-based indices, preserving first-seen
/// order and dropping duplicates.  Any invalid entry rejects the whole
/// answer.
fn parse_multi_selection(input: &str, len: usize) -> Option<Vec<usize>> {
    let mut indices = Vec::new();
    for part in input.split(',') {
        let index = parse_selection(part.trim(), len)?;
        if !indices.contains(&index) {
            indices.push(index);
        }
    }
    Some(indices)
}

/// Indices of choices that start checked.
fn checked_indices(choices: &[PromptChoice]) -> Vec<usize> {
    choices
        .iter()
        .enumerate()
        .filter(|(_, choice)| choice.checked == Some(true))
        .map(|(index, _)| index)
        .collect()
}

/// Values of the choices at `indices`, in the given order.
fn values_at(choices: &[PromptChoice], indices: &[usize]) -> Vec<Value> {
    indices
        .iter()
        .filter_map(|&index| choices.get(index))
        .map(|choice| choice.value.clone())
        .collect()
}

/// Render one choice line, with an optional checked marker.
fn render_choice_line(index: usize, choice: &PromptChoice, checked: Option<bool>) -> String {
    let marker = match checked {
        Some(true) => "[x] ",
        Some(false) => "[ ] ",
        None => "",
    };
    let mut line = format!("  {}. {marker}{}", index + 1, choice.name);
    if let Some(description) = &choice.description {
        line.push_str(&format!(" — {description}"));
    }
    line.push('\n');
    line
}

// ── Tests ─────────────────────────────────────────────────────────────────────
