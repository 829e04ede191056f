//! Alternate target names for autorename.
//!
//! Phase `Suffix` keeps the name (a `/` becomes `_`) and inserts
//! ` (N)` before the extension. Phase `WindowsSafe` additionally makes the
//! name valid on Windows servers. Each generator call in a phase yields the
//! next index; the phase that follows is reported so a later retry can
//! continue where a rejected name left off.

use crate::engine::types::AutorenamePhase;

const MAX_NAME_LEN: usize = 255;
const WINDOWS_INVALID: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];
const WINDOWS_RESERVED: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Produces candidate names for one original name within one phase.
#[derive(Debug, Clone)]
pub struct NameGenerator {
    original: String,
    phase: AutorenamePhase,
    index: u32,
    already_renamed: bool,
    first_call: bool,
    phase_after: AutorenamePhase,
}

impl NameGenerator {
    /// `already_renamed` is set when `original` is itself a generated name,
    /// so "a (2).txt" continues with "a (3).txt" rather than "a (2) (2).txt".
    pub fn new(original: impl Into<String>, phase: AutorenamePhase, already_renamed: bool) -> Self {
        Self {
            original: original.into(),
            phase,
            index: 0,
            already_renamed,
            first_call: true,
            phase_after: AutorenamePhase::Exhausted,
        }
    }

    pub fn phase(&self) -> AutorenamePhase {
        self.phase
    }

    /// Phase a retry should continue with once the last generated name
    /// turned out to be unusable.
    pub fn phase_after(&self) -> AutorenamePhase {
        self.phase_after
    }

    /// Numbering ran out of range: nothing more to offer in any phase.
    fn exhaust(&mut self) -> Option<String> {
        self.phase = AutorenamePhase::Exhausted;
        self.phase_after = AutorenamePhase::Exhausted;
        None
    }

    /// Next candidate, `None` when the phase is `Exhausted`.
    pub fn next_name(&mut self) -> Option<String> {
        let mut name: Vec<char> = match self.phase {
            AutorenamePhase::Exhausted => return None,
            AutorenamePhase::Suffix => self
                .original
                .chars()
                .map(|c| if c == '/' { '_' } else { c })
                .take(MAX_NAME_LEN)
                .collect(),
            AutorenamePhase::WindowsSafe => make_windows_valid(&self.original).chars().collect(),
        };

        let unchanged = name.iter().collect::<String>() == self.original;
        if self.index == 0 && unchanged {
            self.index = 1;
        }
        if self.index != 0 {
            let mut dot = extension_dot(&name);
            if self.already_renamed {
                if let Some((start, end, num)) = numbered_suffix(&name, dot) {
                    name.drain(start..end);
                    if let Some(d) = dot.as_mut() {
                        *d -= end - start;
                    }
                    if self.first_call {
                        self.index = num.max(1);
                    }
                }
            }
            let Some(number) = self.index.checked_add(1) else {
                return self.exhaust();
            };
            let suffix: Vec<char> = if name.is_empty() {
                format!("({})", number)
            } else {
                format!(" ({})", number)
            }
            .chars()
            .collect();
            fit_suffix(&mut name, &mut dot, suffix.len());
            let at = dot.unwrap_or(name.len());
            name.splice(at..at, suffix);
        }
        let Some(index) = self.index.checked_add(1) else {
            return self.exhaust();
        };
        self.index = index;
        self.first_call = false;

        let generated: String = name.into_iter().collect();
        self.phase_after = match self.phase {
            AutorenamePhase::Suffix if !is_valid_windows_name(&generated) => AutorenamePhase::WindowsSafe,
            _ => AutorenamePhase::Exhausted,
        };
        Some(generated)
    }
}

/// Position of the extension dot; a leading dot does not start an extension.
fn extension_dot(name: &[char]) -> Option<usize> {
    name.iter().rposition(|&c| c == '.').filter(|&pos| pos > 0)
}

/// Range and number of a trailing " (N)" right before `dot` (or the end).
fn numbered_suffix(name: &[char], dot: Option<usize>) -> Option<(usize, usize, u32)> {
    let end = dot.unwrap_or(name.len());
    if end == 0 || name[end - 1] != ')' {
        return None;
    }
    let mut pos = end - 1;
    while pos > 0 && name[pos - 1].is_ascii_digit() {
        pos -= 1;
    }
    if pos < 2 || name[pos - 1] != '(' || name[pos - 2] != ' ' {
        return None;
    }
    let digits: String = name[pos..end - 1].iter().collect();
    let num = digits.parse::<u32>().unwrap_or(0);
    Some((pos - 2, end, num))
}

/// Shorten `name` so that a suffix of `suffix_len` still fits.
fn fit_suffix(name: &mut Vec<char>, dot: &mut Option<usize>, suffix_len: usize) {
    let room = MAX_NAME_LEN.saturating_sub(name.len());
    if room >= suffix_len {
        return;
    }
    let cut = suffix_len - room;
    match *dot {
        Some(d) if d > cut => {
            name.drain(d - cut..d);
            *dot = Some(d - cut);
        }
        _ => {
            let mut keep = MAX_NAME_LEN - suffix_len;
            if *dot == Some(keep.saturating_sub(1)) {
                keep -= 1;
            }
            name.truncate(keep);
            if dot.map_or(false, |d| d >= keep) {
                *dot = None;
            }
        }
    }
}

/// Whether `name` can be used as a file name on a Windows server.
pub fn is_valid_windows_name(name: &str) -> bool {
    if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
        return false;
    }
    if name.chars().any(|c| (c as u32) < 32 || WINDOWS_INVALID.contains(&c)) {
        return false;
    }
    if name.ends_with(' ') || name.ends_with('.') {
        return false;
    }
    !is_reserved(name)
}

fn is_reserved(name: &str) -> bool {
    let stem = name.split('.').next().unwrap_or(name).trim_end();
    WINDOWS_RESERVED.iter().any(|r| r.eq_ignore_ascii_case(stem))
}

/// Replace what Windows rejects.
pub fn make_windows_valid(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if (c as u32) < 32 || WINDOWS_INVALID.contains(&c) { '_' } else { c })
        .collect();
    while out.ends_with(' ') || out.ends_with('.') {
        out.pop();
    }
    if out.is_empty() {
        out.push('_');
    }
    if is_reserved(&out) {
        out.insert(0, '_');
    }
    out.chars().take(MAX_NAME_LEN).collect()
}
