//! LIST / MLSD response parser.
//!
//! Supports three formats:
//! 1. **Unix-style** (`ls -l`): `-rwxr-xr-x 1 owner group 1234 Jan  1 12:00 file.txt`
//! 2. **Windows/IIS-style**: `01-01-26  12:00AM       1234 file.txt`
//! 3. **MLSD facts** (RFC 3659): `type=file;size=1234;modify=20260101120000; file.txt`
//!
//! Only what collision detection needs is kept: name, kind and size.
//! Lines that match no format are skipped; a listing with content but no
//! recognisable line is an error.

use crate::engine::error::{FtpError, FtpResult};
use crate::engine::types::{EntryKind, ListedSize, ListingEntry};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref UNIX_RE: Regex = Regex::new(
        r"(?x)
        ^([dlcbps-][rwxsStT-]{9})[@+.]?\s+   # permissions
        (\d+)\s+                             # link count
        (\S+)\s+                             # owner
        (?:(\S+)\s+)?                        # group
        (\d+)\s+                             # size
        (\w{3}\s+\d{1,2}\s+[\d:]+)\s          # date
        (.+)$                                # name (possibly with -> target)
        ",
    )
    .unwrap();
    static ref WINDOWS_RE: Regex = Regex::new(
        r"(?x)
        ^(\d{2}-\d{2}-\d{2,4})\s+       # date
        (\d{1,2}:\d{2}(?:AM|PM)?)\s+    # time
        (<DIR>|\d+)\s+                   # size or <DIR>
        (.+)$                            # name
        ",
    )
    .unwrap();
}

/// Parse a full LIST or MLSD response body.
pub fn parse_listing(raw: &str) -> FtpResult<Vec<ListingEntry>> {
    let mut content_lines = 0usize;
    let mut saw_dot_entry = false;
    let mut entries = Vec::new();
    for line in raw.lines().map(|l| l.trim_end_matches('\r')) {
        if line.trim().is_empty() || line.starts_with("total ") {
            continue;
        }
        content_lines += 1;
        match parse_line(line) {
            Line::Entry(e) => entries.push(e),
            Line::SelfOrParent => saw_dot_entry = true,
            Line::Unparsed => log::debug!("Unparsed listing line: {}", line),
        }
    }
    if content_lines > 0 && entries.is_empty() && !saw_dot_entry {
        return Err(FtpError::protocol_error("Unable to parse directory listing"));
    }
    Ok(entries)
}

enum Line {
    Entry(ListingEntry),
    /// "." / ".." or an MLSD `cdir` / `pdir` fact.
    SelfOrParent,
    Unparsed,
}

fn parse_line(line: &str) -> Line {
    if line.contains(';') && line.contains('=') {
        if let Some(parsed) = parse_mlsd(line) {
            return parsed;
        }
    }
    match parse_unix(line).or_else(|| parse_windows(line)) {
        Some(e) if e.name == "." || e.name == ".." => Line::SelfOrParent,
        Some(e) => Line::Entry(e),
        None => Line::Unparsed,
    }
}

// ─── MLSD ────────────────────────────────────────────────────────────

fn parse_mlsd(line: &str) -> Option<Line> {
    let (facts, name) = line.split_once("; ").or_else(|| line.rsplit_once(' '))?;
    if name.is_empty() {
        return None;
    }

    let mut kind = None;
    let mut size = ListedSize::Unknown;
    for fact in facts.split(';') {
        let Some((key, value)) = fact.trim().split_once('=') else {
            continue;
        };
        match key.to_ascii_lowercase().as_str() {
            "type" => {
                kind = match value.to_ascii_lowercase().as_str() {
                    "cdir" | "pdir" => return Some(Line::SelfOrParent),
                    "dir" => Some(EntryKind::Directory),
                    "file" => Some(EntryKind::File),
                    v if v.starts_with("os.unix=slink") || v.starts_with("os.unix=symlink") => {
                        Some(EntryKind::Link)
                    }
                    _ => None,
                }
            }
            "size" => {
                if let Ok(n) = value.parse::<u64>() {
                    size = ListedSize::Known(n);
                }
            }
            _ => {}
        }
    }

    let kind = kind?;
    if name == "." || name == ".." {
        return Some(Line::SelfOrParent);
    }
    Some(Line::Entry(ListingEntry {
        name: name.to_string(),
        kind,
        size: if kind == EntryKind::File { size } else { ListedSize::Unknown },
    }))
}

// ─── Unix ────────────────────────────────────────────────────────────

/// ```text
/// drwxr-xr-x   2 user group  4096 Jan  1 12:00 dirname
/// -rw-r--r--   1 user group  1234 Jan  1  2025 file.txt
/// lrwxrwxrwx   1 user group    42 Jan  1 12:00 link -> target
/// ```
fn parse_unix(line: &str) -> Option<ListingEntry> {
    let caps = UNIX_RE.captures(line)?;
    let perms = caps.get(1)?.as_str();
    let size = caps.get(5)?.as_str().parse::<u64>().ok();
    let name_raw = caps.get(7)?.as_str().trim_start();

    let kind = match perms.as_bytes().first() {
        Some(b'd') => EntryKind::Directory,
        Some(b'l') => EntryKind::Link,
        _ => EntryKind::File,
    };
    let name = match kind {
        EntryKind::Link => name_raw.split_once(" -> ").map_or(name_raw, |(n, _)| n),
        _ => name_raw,
    };

    Some(ListingEntry {
        name: name.to_string(),
        kind,
        size: match (kind, size) {
            (EntryKind::File, Some(n)) => ListedSize::Known(n),
            _ => ListedSize::Unknown,
        },
    })
}

// ─── Windows ─────────────────────────────────────────────────────────

/// ```text
/// 01-01-26  12:00AM       1234 file.txt
/// 01-01-26  12:00PM      <DIR> Directory Name
/// ```
fn parse_windows(line: &str) -> Option<ListingEntry> {
    let caps = WINDOWS_RE.captures(line)?;
    let size_or_dir = caps.get(3)?.as_str();
    let name = caps.get(4)?.as_str().to_string();

    let (kind, size) = if size_or_dir == "<DIR>" {
        (EntryKind::Directory, ListedSize::Unknown)
    } else {
        (
            EntryKind::File,
            size_or_dir.parse::<u64>().map_or(ListedSize::Unknown, ListedSize::Known),
        )
    };
    Some(ListingEntry { name, kind, size })
}
