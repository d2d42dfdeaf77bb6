//! Declarative per-entity grid tables.
//!
//! Every grid is described by one static [`EntitySpec`]: the ordered identity
//! fields used to correlate rows across fetches, the column table mapping a
//! column index to its remote field, and how each column projects to text.
//! Nothing here performs I/O.

#![allow(missing_docs)]

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::errors::{CexError, Result};

/// Record grids shown by the explorer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Assets,
    Iocs,
    Events,
    Tasks,
    Notes,
    Evidences,
    /// Correlation feed (external threat-intel events matched against the case).
    Feed,
}

impl EntityKind {
    /// All kinds in tab order.
    pub const ALL: [Self; 7] = [
        Self::Assets,
        Self::Iocs,
        Self::Events,
        Self::Tasks,
        Self::Notes,
        Self::Evidences,
        Self::Feed,
    ];

    /// Stable key used on the wire, in config, and in CLI arguments.
    #[must_use]
    pub const fn key(self) -> &'static str {
        match self {
            Self::Assets => "assets",
            Self::Iocs => "iocs",
            Self::Events => "events",
            Self::Tasks => "tasks",
            Self::Notes => "notes",
            Self::Evidences => "evidences",
            Self::Feed => "feed",
        }
    }

    /// Human-readable tab label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Assets => "Assets",
            Self::Iocs => "Indicators",
            Self::Events => "Timeline",
            Self::Tasks => "Tasks",
            Self::Notes => "Notes",
            Self::Evidences => "Evidence",
            Self::Feed => "Correlation feed",
        }
    }

    /// Resolve a key (or a few common aliases) to a kind.
    #[must_use]
    pub fn from_key(key: &str) -> Option<Self> {
        match key.trim().to_ascii_lowercase().as_str() {
            "assets" | "asset" => Some(Self::Assets),
            "iocs" | "ioc" | "indicators" => Some(Self::Iocs),
            "events" | "event" | "timeline" => Some(Self::Events),
            "tasks" | "task" => Some(Self::Tasks),
            "notes" | "note" => Some(Self::Notes),
            "evidences" | "evidence" => Some(Self::Evidences),
            "feed" | "shadowserver" | "correlation" => Some(Self::Feed),
            _ => None,
        }
    }

    /// Like [`Self::from_key`] but returns a typed error.
    pub fn parse(key: &str) -> Result<Self> {
        Self::from_key(key).ok_or_else(|| CexError::UnknownEntity {
            key: key.to_string(),
        })
    }

    /// Whether the grid lives under a case (and so needs a case id in its endpoint).
    #[must_use]
    pub const fn is_case_scoped(self) -> bool {
        !matches!(self, Self::Feed)
    }

    /// Static table describing this grid.
    #[must_use]
    pub const fn spec(self) -> &'static EntitySpec {
        match self {
            Self::Assets => &ASSETS,
            Self::Iocs => &IOCS,
            Self::Events => &EVENTS,
            Self::Tasks => &TASKS,
            Self::Notes => &NOTES,
            Self::Evidences => &EVIDENCES,
            Self::Feed => &FEED,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Sort direction as sent on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl SortDirection {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }

    /// Parse `asc`/`desc` (case-insensitive).
    #[must_use]
    pub fn from_str_opt(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Some(Self::Asc),
            "desc" | "descending" => Some(Self::Desc),
            _ => None,
        }
    }

    #[must_use]
    pub const fn flipped(self) -> Self {
        match self {
            Self::Asc => Self::Desc,
            Self::Desc => Self::Asc,
        }
    }
}

/// How a column's value is projected to display text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    /// Value rendered as-is.
    Plain,
    /// Free text truncated to `max_chars` characters followed by `...`.
    Text { max_chars: usize },
    /// Categorical id resolved through the lookup cache.
    Lookup { category: &'static str },
    /// Nested JSON object shown as a short compact preview.
    Json,
}

/// One column of a grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    /// Header text.
    pub title: &'static str,
    /// Candidate record fields in priority order; the first is the remote sort/filter field.
    pub fields: &'static [&'static str],
    pub kind: CellKind,
    pub sortable: bool,
    pub filterable: bool,
}

impl ColumnSpec {
    /// Remote field name used for ordering and filtering.
    #[must_use]
    pub const fn remote_field(&self) -> &'static str {
        self.fields[0]
    }

    /// Whether this column's text depends on the lookup cache.
    #[must_use]
    pub const fn is_label_dependent(&self) -> bool {
        matches!(self.kind, CellKind::Lookup { .. })
    }
}

/// Static description of one grid.
#[derive(Debug)]
pub struct EntitySpec {
    pub kind: EntityKind,
    /// Ordered identity candidates; the first present, non-null field wins.
    pub identity: &'static [&'static str],
    pub columns: &'static [ColumnSpec],
    /// Column sorted on at mount time.
    pub default_sort_column: usize,
    pub default_sort_direction: SortDirection,
    /// Remote field used when a sort column has no known mapping.
    pub default_sort_field: &'static str,
}

impl EntitySpec {
    /// Column at `index`, if any.
    #[must_use]
    pub fn column(&self, index: usize) -> Option<&'static ColumnSpec> {
        self.columns.get(index)
    }

    /// Map a column index to its remote sort field, falling back to the default field.
    #[must_use]
    pub fn sort_field(&self, index: usize) -> &'static str {
        self.columns
            .get(index)
            .filter(|c| c.sortable)
            .map_or(self.default_sort_field, ColumnSpec::remote_field)
    }

    /// Indices of label-dependent columns.
    pub fn lookup_columns(&self) -> impl Iterator<Item = (usize, &'static str)> + '_ {
        self.columns
            .iter()
            .enumerate()
            .filter_map(|(i, c)| match c.kind {
                CellKind::Lookup { category } => Some((i, category)),
                _ => None,
            })
    }
}

const fn col(title: &'static str, fields: &'static [&'static str]) -> ColumnSpec {
    ColumnSpec {
        title,
        fields,
        kind: CellKind::Plain,
        sortable: true,
        filterable: true,
    }
}

const fn text(title: &'static str, fields: &'static [&'static str], max_chars: usize) -> ColumnSpec {
    ColumnSpec {
        title,
        fields,
        kind: CellKind::Text { max_chars },
        sortable: true,
        filterable: true,
    }
}

const fn lookup(
    title: &'static str,
    fields: &'static [&'static str],
    category: &'static str,
) -> ColumnSpec {
    ColumnSpec {
        title,
        fields,
        kind: CellKind::Lookup { category },
        sortable: true,
        filterable: true,
    }
}

/// Truncation limit for description-like columns.
pub const DESCRIPTION_CHARS: usize = 200;
/// Truncation limit for note bodies.
pub const NOTE_CONTENT_CHARS: usize = 300;

static ASSETS: EntitySpec = EntitySpec {
    kind: EntityKind::Assets,
    identity: &["asset_id"],
    columns: &[
        col("ID", &["asset_id"]),
        col("Name", &["asset_name"]),
        col("IP", &["asset_ip"]),
        col("Domain", &["asset_domain"]),
        lookup("Type", &["asset_type_id", "asset_type"], "asset_type"),
        lookup(
            "Compromised",
            &["asset_compromise_status_id", "asset_compromise_status"],
            "compromise_status",
        ),
        text("Description", &["asset_description"], DESCRIPTION_CHARS),
        col("Added", &["date_added"]),
    ],
    default_sort_column: 0,
    default_sort_direction: SortDirection::Desc,
    default_sort_field: "asset_id",
};

static IOCS: EntitySpec = EntitySpec {
    kind: EntityKind::Iocs,
    identity: &["ioc_id"],
    columns: &[
        col("ID", &["ioc_id"]),
        col("Value", &["ioc_value"]),
        lookup("Type", &["ioc_type_id", "ioc_type"], "ioc_type"),
        lookup("TLP", &["ioc_tlp_id", "ioc_tlp"], "tlp"),
        col("Tags", &["ioc_tags"]),
        text("Description", &["ioc_description"], DESCRIPTION_CHARS),
    ],
    default_sort_column: 0,
    default_sort_direction: SortDirection::Desc,
    default_sort_field: "ioc_id",
};

static EVENTS: EntitySpec = EntitySpec {
    kind: EntityKind::Events,
    identity: &["event_id"],
    columns: &[
        col("ID", &["event_id"]),
        col("Date", &["event_date"]),
        col("Title", &["event_title"]),
        col("Source", &["event_source"]),
        col("Tags", &["event_tags"]),
        text("Content", &["event_content"], DESCRIPTION_CHARS),
    ],
    default_sort_column: 0,
    default_sort_direction: SortDirection::Desc,
    default_sort_field: "event_id",
};

static TASKS: EntitySpec = EntitySpec {
    kind: EntityKind::Tasks,
    identity: &["task_id", "id"],
    columns: &[
        col("ID", &["task_id", "id"]),
        col("Title", &["task_title"]),
        lookup("Status", &["task_status_id", "task_status"], "task_status"),
        col("Tags", &["task_tags"]),
        col("Opened", &["task_open_date"]),
        col("Closed", &["task_close_date"]),
        text("Description", &["task_description"], DESCRIPTION_CHARS),
    ],
    default_sort_column: 0,
    default_sort_direction: SortDirection::Desc,
    default_sort_field: "task_id",
};

static NOTES: EntitySpec = EntitySpec {
    kind: EntityKind::Notes,
    identity: &["note_id"],
    columns: &[
        col("ID", &["note_id"]),
        col("Title", &["note_title"]),
        col("Created", &["note_creationdate"]),
        col("Updated", &["note_lastupdate"]),
        text("Content", &["note_content"], NOTE_CONTENT_CHARS),
    ],
    default_sort_column: 0,
    default_sort_direction: SortDirection::Desc,
    default_sort_field: "note_id",
};

static EVIDENCES: EntitySpec = EntitySpec {
    kind: EntityKind::Evidences,
    identity: &["evidence_id", "id"],
    columns: &[
        col("ID", &["evidence_id", "id"]),
        col("Filename", &["filename"]),
        col("Hash", &["file_hash"]),
        col("Size", &["file_size"]),
        col("Added", &["date_added"]),
        text("Description", &["file_description"], DESCRIPTION_CHARS),
    ],
    default_sort_column: 0,
    default_sort_direction: SortDirection::Desc,
    default_sort_field: "evidence_id",
};

static FEED: EntitySpec = EntitySpec {
    kind: EntityKind::Feed,
    identity: &["id"],
    columns: &[
        col("Date", &["report_date"]),
        col("Report", &["report_type"]),
        col("IP", &["ip"]),
        col("Port", &["port"]),
        col("ASN", &["asn"]),
        col("Geo", &["geo"]),
        col("Hostname", &["hostname"]),
        col("Tag", &["tag"]),
        col("Severity", &["severity"]),
        ColumnSpec {
            title: "Details",
            fields: &["raw_data"],
            kind: CellKind::Json,
            sortable: false,
            filterable: false,
        },
    ],
    default_sort_column: 0,
    default_sort_direction: SortDirection::Desc,
    default_sort_field: "report_date",
};
