//! Plain-text frame rendering for the watch loop and `fetch` output.

use std::fmt::Write as _;

use super::model::{AppState, NoticeLevel};
use crate::grid::controller::{GridController, GridPhase};
use crate::grid::entity::EntityKind;
use crate::grid::view::truncate;

/// Widest a table cell may render before truncation.
pub const MAX_CELL_WIDTH: usize = 28;

/// Full screen: tab bar, active grid, status line, and notices.
#[must_use]
pub fn render_frame(state: &AppState) -> String {
    let mut out = String::new();
    out.push_str(&render_tabs(state));
    out.push('\n');
    match state.active_grid() {
        Ok(grid) => out.push_str(&render_grid(grid)),
        Err(err) => {
            let _ = writeln!(out, "  {err}");
        }
    }
    let _ = writeln!(out, "-- {}", state.status);
    for notice in &state.notices {
        let tag = match notice.level {
            NoticeLevel::Info => "info",
            NoticeLevel::Warning => "warn",
            NoticeLevel::Error => "error",
        };
        let _ = writeln!(out, "[{tag}] {}", notice.message);
    }
    out
}

/// `[Assets (30)] | Indicators (4) | Timeline (-)`; brackets mark the active tab.
#[must_use]
pub fn render_tabs(state: &AppState) -> String {
    state
        .grids
        .kinds()
        .map(|kind| {
            let badge = state
                .counts
                .get(&kind)
                .map_or_else(|| "-".to_string(), u64::to_string);
            let label = format!("{} ({badge})", kind.label());
            if kind == state.active_tab {
                format!("[{label}]")
            } else {
                label
            }
        })
        .collect::<Vec<_>>()
        .join(" | ")
}

/// Header, table, and expanded details for one grid.
#[must_use]
pub fn render_grid(grid: &GridController) -> String {
    let entity = grid.entity();
    let spec = entity.spec();
    let state = grid.state();
    let mut out = String::new();

    let _ = write!(
        out,
        "{}  page {}/{}  ({} of {})",
        entity.label(),
        state.page + 1,
        grid.page_count().max(1),
        grid.filtered(),
        grid.total()
    );
    if let Some(column) = spec.column(state.sort_column) {
        let _ = write!(out, "  sort: {} {}", column.title, state.sort_direction.as_str());
    }
    let filters = active_filters(entity, grid);
    if !filters.is_empty() {
        let _ = write!(out, "  filters: {}", filters.join(", "));
    }
    match grid.phase() {
        GridPhase::Mounted => {}
        phase => {
            let _ = write!(out, "  [{}]", phase.as_str());
        }
    }
    out.push('\n');
    if let Some(error) = grid.last_error() {
        let _ = writeln!(out, "  ! {error}");
    }

    let headers: Vec<String> = spec.columns.iter().map(|c| c.title.to_string()).collect();
    let body: Vec<Vec<String>> = grid
        .rows()
        .iter()
        .map(|row| {
            row.cells
                .iter()
                .map(|cell| truncate(&single_line(cell), MAX_CELL_WIDTH))
                .collect()
        })
        .collect();
    let widths = column_widths(&headers, &body);

    out.push_str(&table_line("  ", &headers, &widths));
    for (row, cells) in grid.rows().iter().zip(&body) {
        let marker = if row.expanded { "v " } else { "  " };
        out.push_str(&table_line(marker, cells, &widths));
        if let Some(detail) = &row.detail {
            for (field, value) in detail {
                let _ = writeln!(out, "      {field}: {value}");
            }
        }
    }
    if grid.rows().is_empty() && grid.phase().is_mounted() {
        out.push_str("  (no rows)\n");
    }
    out
}

fn active_filters(entity: EntityKind, grid: &GridController) -> Vec<String> {
    let spec = entity.spec();
    let state = grid.state();
    let mut parts: Vec<String> = state
        .column_filters
        .iter()
        .filter_map(|(index, text)| {
            spec.column(*index)
                .map(|c| format!("{}~{text:?}", c.title))
        })
        .collect();
    if !state.search.is_empty() {
        parts.push(format!("search~{:?}", state.search));
    }
    parts.extend(state.extra.iter().map(|(k, v)| format!("{k}={v}")));
    parts
}

fn single_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn column_widths(headers: &[String], body: &[Vec<String>]) -> Vec<usize> {
    headers
        .iter()
        .enumerate()
        .map(|(i, h)| {
            body.iter()
                .filter_map(|row| row.get(i))
                .map(|c| c.chars().count())
                .chain(std::iter::once(h.chars().count()))
                .max()
                .unwrap_or(0)
        })
        .collect()
}

fn table_line(prefix: &str, cells: &[String], widths: &[usize]) -> String {
    let mut line = String::from(prefix);
    for (i, (cell, width)) in cells.iter().zip(widths).enumerate() {
        if i > 0 {
            line.push_str(" | ");
        }
        let _ = write!(line, "{cell:<width$}");
    }
    let mut line = line.trim_end().to_string();
    line.push('\n');
    line
}
