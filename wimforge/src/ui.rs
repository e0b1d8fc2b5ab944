//! Prompts and progress widgets shared by the menu and the subcommands.
use anyhow::{Result, bail};
use console::{Term, style};
use dialoguer::{Confirm, Input, Select, theme::ColorfulTheme};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{Stdout, stdout};
use std::path::PathBuf;
use wimforge_core::progress::LineRenderer;

pub fn theme() -> ColorfulTheme {
    ColorfulTheme::default()
}

pub fn confirm(prompt: &str, default: bool) -> Result<bool> {
    Ok(Confirm::with_theme(&theme())
        .with_prompt(prompt)
        .default(default)
        .interact()?)
}

/// Picks one of `items`; `None` if the user backed out with Esc.
pub fn choose<T: std::fmt::Display>(
    prompt: &str,
    items: &[T],
    default: usize,
) -> Result<Option<usize>> {
    Ok(Select::with_theme(&theme())
        .with_prompt(prompt)
        .items(items)
        .default(default)
        .interact_opt()?)
}

/// Asks for a path. Surrounding quotes from drag-and-drop are stripped.
pub fn ask_path(prompt: &str) -> Result<PathBuf> {
    let raw: String = Input::with_theme(&theme())
        .with_prompt(prompt)
        .interact_text()?;
    let trimmed = raw.trim().trim_matches('"');
    if trimmed.is_empty() {
        bail!("a path is required");
    }
    Ok(PathBuf::from(trimmed))
}

pub fn ask_path_or(prompt: &str, default: PathBuf) -> Result<PathBuf> {
    let raw: String = Input::with_theme(&theme())
        .with_prompt(prompt)
        .default(default.display().to_string())
        .interact_text()?;
    Ok(PathBuf::from(raw.trim().trim_matches('"')))
}

pub fn ask_number(prompt: &str, default: u32) -> Result<u32> {
    Ok(Input::with_theme(&theme())
        .with_prompt(prompt)
        .default(default)
        .interact_text()?)
}

pub fn ask_text(prompt: &str, default: &str) -> Result<String> {
    Ok(Input::with_theme(&theme())
        .with_prompt(prompt)
        .default(default.to_string())
        .interact_text()?)
}

/// Parses `"1,3 4"` style index lists.
pub fn parse_index_list(text: &str) -> Result<Vec<u32>> {
    let indices = text
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<u32>()
                .map_err(|_| anyhow::anyhow!("'{part}' is not an image index"))
        })
        .collect::<Result<Vec<_>>>()?;
    if indices.is_empty() {
        bail!("at least one index is required");
    }
    Ok(indices)
}

/// The single-line progress renderer sized to the current terminal.
pub fn progress_line(label: &str) -> LineRenderer<Stdout> {
    let (_, columns) = Term::stdout().size();
    LineRenderer::new(label, stdout(), usize::from(columns))
}

/// A spinner for informational queries. The caller ticks it from the
/// runner's liveness callback.
pub fn spinner(message: &str, enabled: bool) -> ProgressBar {
    if !enabled {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new_spinner();
    let template = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg} [{elapsed}]");
    if let Ok(style) = template {
        pb.set_style(style.tick_chars("|/-\\ "));
    }
    pb.set_message(message.to_string());
    pb
}

pub fn info(message: impl std::fmt::Display) {
    println!("{} {message}", style("[INFO]").cyan().bold());
}

pub fn ok(message: impl std::fmt::Display) {
    println!("{} {message}", style("[OK]").green().bold());
}

pub fn warn(message: impl std::fmt::Display) {
    println!("{} {message}", style("WARNING:").yellow().bold());
}

pub fn error(message: impl std::fmt::Display) {
    eprintln!("{} {message}", style("ERROR:").red().bold());
}

pub fn header(title: &str) {
    println!();
    println!("{}", style(format!("== {title} ==")).green().bold());
}

/// Prints captured tool output, adding the final newline if it is missing.
pub fn print_output(text: Option<&str>) {
    if let Some(text) = text.filter(|t| !t.is_empty()) {
        print!("{text}");
        if !text.ends_with('\n') {
            println!();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_lists_accept_commas_and_spaces() {
        assert_eq!(parse_index_list("1,3 4").unwrap(), vec![1, 3, 4]);
        assert_eq!(parse_index_list(" 2 ,, 2 ").unwrap(), vec![2, 2]);
        assert!(parse_index_list("1,x").is_err());
        assert!(parse_index_list("  ").is_err());
    }
}
