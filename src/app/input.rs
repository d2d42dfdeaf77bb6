//! Line-oriented operator commands for the watch loop.
//!
//! Each line read from stdin maps to at most one [`ExplorerMsg`]. Parsing is
//! pure so it can be unit-tested without a terminal.

#![allow(missing_docs)]

use thiserror::Error;

use super::model::{ExplorerMsg, PageMove};
use crate::grid::entity::{EntityKind, SortDirection};
use crate::grid::identity::RowId;

/// One entry in the command catalog shown by `help`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHelp {
    pub name: &'static str,
    pub usage: &'static str,
    pub summary: &'static str,
}

const COMMANDS: [CommandHelp; 14] = [
    CommandHelp { name: "tab", usage: "tab <name|1-7>", summary: "switch to a grid, loading it on first visit" },
    CommandHelp { name: "refresh", usage: "refresh[!]", summary: "refresh every loaded grid (! bypasses caches)" },
    CommandHelp { name: "sort", usage: "sort <col> [asc|desc]", summary: "sort by column; repeat to flip" },
    CommandHelp { name: "filter", usage: "filter <col> [text]", summary: "column filter; empty text clears" },
    CommandHelp { name: "search", usage: "search [text]", summary: "global search; empty text clears" },
    CommandHelp { name: "page", usage: "page next|prev|<n>", summary: "move between pages (1-based)" },
    CommandHelp { name: "extra", usage: "extra <key> [value]", summary: "set or clear an extra request parameter" },
    CommandHelp { name: "expand", usage: "expand <id>", summary: "show row details" },
    CommandHelp { name: "collapse", usage: "collapse <id>", summary: "hide row details" },
    CommandHelp { name: "toggle", usage: "toggle <id>", summary: "flip row details" },
    CommandHelp { name: "copy", usage: "copy <id>", summary: "print the row's record as JSON" },
    CommandHelp { name: "lookups", usage: "lookups", summary: "reload label tables" },
    CommandHelp { name: "help", usage: "help", summary: "list commands" },
    CommandHelp { name: "quit", usage: "quit", summary: "leave the explorer" },
];

/// Stable command catalog.
#[must_use]
pub const fn commands() -> &'static [CommandHelp] {
    &COMMANDS
}

/// Result of parsing one line.
#[derive(Debug)]
pub enum Parsed {
    Msg(ExplorerMsg),
    Help,
    Empty,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InputError {
    #[error("unknown command {0:?} (try `help`)")]
    UnknownCommand(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("{0}")]
    BadArgument(String),
}

/// Parse one operator line.
pub fn parse_line(line: &str) -> Result<Parsed, InputError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Parsed::Empty);
    }
    let (head, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();
    let head = head.to_ascii_lowercase();

    let msg = match head.as_str() {
        "help" | "?" => return Ok(Parsed::Help),
        "quit" | "q" | "exit" => ExplorerMsg::Quit,
        "refresh" | "r" => ExplorerMsg::Refresh { bust_cache: false },
        "refresh!" | "r!" => ExplorerMsg::Refresh { bust_cache: true },
        "lookups" => ExplorerMsg::RefreshLookups,
        "tab" => ExplorerMsg::SwitchTab(parse_tab(rest)?),
        "sort" => {
            let mut args = rest.split_whitespace();
            let column = parse_column(args.next(), usage("sort"))?;
            let direction = match args.next() {
                None => None,
                Some(raw) => Some(SortDirection::from_str_opt(raw).ok_or_else(|| {
                    InputError::BadArgument(format!("direction must be asc or desc, got {raw:?}"))
                })?),
            };
            ExplorerMsg::Sort { column, direction }
        }
        "filter" | "f" => {
            let (col, text) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            let column = parse_column(Some(col).filter(|c| !c.is_empty()), usage("filter"))?;
            ExplorerMsg::Filter {
                column,
                text: text.trim().to_string(),
            }
        }
        "search" | "/" => ExplorerMsg::Search(rest.to_string()),
        "page" | "p" => ExplorerMsg::Page(parse_page(rest)?),
        "next" | "n" => ExplorerMsg::Page(PageMove::Next),
        "prev" => ExplorerMsg::Page(PageMove::Prev),
        "extra" => {
            let (key, value) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            if key.is_empty() {
                return Err(InputError::Usage(usage("extra")));
            }
            ExplorerMsg::Extra {
                key: key.to_string(),
                value: value.trim().to_string(),
            }
        }
        "expand" | "e" => ExplorerMsg::Expand(parse_id(rest, "expand")?),
        "collapse" => ExplorerMsg::Collapse(parse_id(rest, "collapse")?),
        "toggle" | "t" => ExplorerMsg::Toggle(parse_id(rest, "toggle")?),
        "copy" | "c" => ExplorerMsg::CopyRecord(parse_id(rest, "copy")?),
        _ => return Err(InputError::UnknownCommand(head)),
    };
    Ok(Parsed::Msg(msg))
}

fn usage(name: &str) -> &'static str {
    COMMANDS
        .iter()
        .find(|c| c.name == name)
        .map_or("help", |c| c.usage)
}

fn parse_tab(raw: &str) -> Result<EntityKind, InputError> {
    if raw.is_empty() {
        return Err(InputError::Usage(usage("tab")));
    }
    if let Ok(n) = raw.parse::<usize>() {
        return n
            .checked_sub(1)
            .and_then(|i| EntityKind::ALL.get(i).copied())
            .ok_or_else(|| InputError::BadArgument(format!("tab number must be 1-{}", EntityKind::ALL.len())));
    }
    EntityKind::parse(raw).map_err(|e| InputError::BadArgument(e.to_string()))
}

fn parse_column(raw: Option<&str>, usage: &'static str) -> Result<usize, InputError> {
    let raw = raw.ok_or(InputError::Usage(usage))?;
    raw.parse()
        .map_err(|_| InputError::BadArgument(format!("column must be a number, got {raw:?}")))
}

fn parse_page(raw: &str) -> Result<PageMove, InputError> {
    match raw.to_ascii_lowercase().as_str() {
        "next" | "n" | "+" => Ok(PageMove::Next),
        "prev" | "p" | "-" => Ok(PageMove::Prev),
        "" => Err(InputError::Usage(usage("page"))),
        other => match other.parse::<usize>() {
            Ok(n) if n >= 1 => Ok(PageMove::Goto(n - 1)),
            _ => Err(InputError::BadArgument(format!("page must be next, prev or >= 1, got {raw:?}"))),
        },
    }
}

fn parse_id(raw: &str, name: &str) -> Result<RowId, InputError> {
    if raw.is_empty() {
        return Err(InputError::Usage(usage(name)));
    }
    Ok(RowId::from(raw))
}
