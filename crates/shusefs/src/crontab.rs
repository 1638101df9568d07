//! Textual schedule list: render the cached schedules as a crontab-style
//! document, parse an edited document back, and compute the minimal set of
//! create/update/delete operations against the cache.
//!
//! The format is a non-strict crontab variant with a six-field timespec
//! (sec min hour dom month dow). `# id:N` comment lines bind the following
//! schedule line to an existing device schedule; a `#! ` prefix marks a
//! disabled entry.

use tracing::warn;

use crate::state::{ScheduleSlot, SchedulesState};

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

pub fn render(schedules: &SchedulesState) -> String {
    let mut out = String::with_capacity(256);

    out.push_str(&format!(
        "# Shelly device schedules (rev: {})\n\
         # Format: sec min hour dom month dow method [params]\n\
         # Use '#!' prefix for disabled entries\n\n",
        schedules.rev
    ));

    for sched in &schedules.slots {
        if sched.enable {
            out.push_str(&format!("# id:{}\n", sched.id));
        } else {
            out.push_str(&format!("# id:{} (disabled)\n", sched.id));
        }

        let prefix = if sched.enable { "" } else { "#! " };
        for call in &sched.calls {
            match call.params.as_deref() {
                Some(params) if !params.is_empty() => out.push_str(&format!(
                    "{prefix}{} {} {params}\n",
                    sched.timespec, call.method
                )),
                _ => out.push_str(&format!("{prefix}{} {}\n", sched.timespec, call.method)),
            }
        }

        out.push('\n');
    }

    out
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// One schedule line parsed out of an edited crontab document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEntry {
    /// Bound device schedule id from a preceding `# id:N` comment.
    pub id: Option<i64>,
    pub enable: bool,
    pub timespec: String,
    pub method: String,
    pub params: Option<String>,
}

fn next_token(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    let end = s.find(char::is_whitespace).unwrap_or(s.len());
    Some((&s[..end], &s[end..]))
}

/// Parse a whole document. Malformed schedule lines are logged and skipped;
/// they never queue an operation.
pub fn parse(content: &str) -> Vec<ParsedEntry> {
    let mut entries = Vec::new();
    // Sticky id from the most recent `# id:N` comment; consumed by the next
    // schedule line.
    let mut current_id: Option<i64> = None;

    for line in content.lines() {
        let trimmed = line.trim_start();
        if trimmed.is_empty() {
            continue;
        }

        if let Some(rest) = trimmed.strip_prefix("# id:") {
            let digits: String = rest
                .trim_start()
                .chars()
                .take_while(|c| c.is_ascii_digit() || *c == '-')
                .collect();
            if let Ok(id) = digits.parse::<i64>() {
                current_id = Some(id);
            }
            continue;
        }

        let (body, enable) = match trimmed.strip_prefix("#!") {
            Some(rest) => (rest.trim_start(), false),
            None if trimmed.starts_with('#') => continue, // plain comment
            None => (trimmed, true),
        };

        match parse_schedule_line(body, current_id, enable) {
            Some(entry) => {
                current_id = None;
                entries.push(entry);
            }
            None => warn!(line = %line.trim(), "skipping malformed crontab line"),
        }
    }

    entries
}

fn parse_schedule_line(body: &str, id: Option<i64>, enable: bool) -> Option<ParsedEntry> {
    let mut rest = body;
    let mut fields = Vec::with_capacity(6);
    for _ in 0..6 {
        let (tok, r) = next_token(rest)?;
        fields.push(tok);
        rest = r;
    }

    let (method, rest) = next_token(rest)?;

    let params = rest.trim();
    let params = (!params.is_empty()).then(|| params.to_string());

    Some(ParsedEntry {
        id,
        enable,
        timespec: fields.join(" "),
        method: method.to_string(),
        params,
    })
}

// ---------------------------------------------------------------------------
// Differential planning
// ---------------------------------------------------------------------------

/// One device operation the sync must issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOp {
    Create {
        enable: bool,
        timespec: String,
        method: String,
        params: Option<String>,
    },
    Update {
        id: i64,
        enable: bool,
        timespec: String,
        method: String,
        params: Option<String>,
    },
    Delete {
        id: i64,
    },
}

/// Compare the parsed document against the cached schedule list and plan
/// the operations: update changed id-bound entries, create id-less ones,
/// delete cached schedules the document no longer mentions. Re-planning
/// an unedited rendering yields no operations.
pub fn plan(parsed: &[ParsedEntry], schedules: &SchedulesState) -> Vec<SyncOp> {
    let mut ops = Vec::new();
    let mut seen = vec![false; schedules.slots.len()];

    for entry in parsed {
        match entry.id {
            Some(id) => {
                let Some(idx) = schedules.slots.iter().position(|s| s.id == id) else {
                    warn!(
                        schedule = id,
                        "unknown schedule id in crontab; ids cannot be assigned by the client"
                    );
                    continue;
                };
                seen[idx] = true;

                if entry_differs(entry, &schedules.slots[idx]) {
                    ops.push(SyncOp::Update {
                        id,
                        enable: entry.enable,
                        timespec: entry.timespec.clone(),
                        method: entry.method.clone(),
                        params: entry.params.clone(),
                    });
                }
            }
            None => ops.push(SyncOp::Create {
                enable: entry.enable,
                timespec: entry.timespec.clone(),
                method: entry.method.clone(),
                params: entry.params.clone(),
            }),
        }
    }

    for (idx, sched) in schedules.slots.iter().enumerate() {
        if !seen[idx] {
            ops.push(SyncOp::Delete { id: sched.id });
        }
    }

    ops
}

/// A parsed entry differs from its cached schedule if enable, timespec, or
/// the first call's method/params changed.
fn entry_differs(entry: &ParsedEntry, cached: &ScheduleSlot) -> bool {
    if cached.enable != entry.enable || cached.timespec != entry.timespec {
        return true;
    }
    match cached.calls.first() {
        Some(call) => {
            call.method != entry.method
                || call.params.as_deref().unwrap_or("")
                    != entry.params.as_deref().unwrap_or("")
        }
        None => true,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
