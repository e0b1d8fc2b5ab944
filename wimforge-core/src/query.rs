//! Read-only queries against the image tool.
use crate::error::Result;
use crate::logs::Logs;
use crate::process::{ProcessResult, ProcessRunner};
use crate::tools::Tools;
use std::path::Path;
use std::sync::atomic::AtomicBool;

/// `/Get-WimInfo` for `image`: lists its indices with names and sizes.
pub fn image_info(
    tools: &Tools,
    logs: &Logs,
    image: &Path,
    running: &AtomicBool,
    on_tick: impl FnMut(),
) -> Result<ProcessResult> {
    let cmd = tools.primary().arg("/Get-WimInfo").flag_path("/WimFile:", image);
    ProcessRunner::new(logs).run_with_spinner(&cmd, running, on_tick)
}

/// The image tool's own record of what is mounted where.
pub fn mounted_images(
    tools: &Tools,
    logs: &Logs,
    running: &AtomicBool,
    on_tick: impl FnMut(),
) -> Result<ProcessResult> {
    let cmd = tools.primary().arg("/Get-MountedWimInfo");
    ProcessRunner::new(logs).run_with_spinner(&cmd, running, on_tick)
}

/// The value of a `Key : value` line when the key matches `key`, ignoring
/// case and surrounding blanks.
pub(crate) fn field<'t>(line: &'t str, key: &str) -> Option<&'t str> {
    let (name, value) = line.split_once(':')?;
    name.trim().eq_ignore_ascii_case(key).then_some(value.trim())
}

/// Index numbers listed as `Index : N` lines, in order, without repeats.
///
/// This scrapes human-readable output and can break on localized builds of
/// the tool.
pub fn parse_indices(text: &str) -> Vec<u32> {
    let mut indices = Vec::new();
    for line in text.lines() {
        let Some(value) = field(line, "index") else {
            continue;
        };
        let digits: String = value.chars().take_while(char::is_ascii_digit).collect();
        if let Ok(index) = digits.parse::<u32>() {
            if !indices.contains(&index) {
                indices.push(index);
            }
        }
    }
    indices
}
