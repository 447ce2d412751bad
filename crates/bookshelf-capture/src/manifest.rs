//! CSV manifest of captured items.
//!
//! Encoding is pure and takes no browser capability; [`write_manifest`] only
//! adds the byte-order mark and the file write. Fields containing a quote, a
//! comma or a line break are wrapped in quotes with inner quotes doubled.

use std::fmt;
use std::path::Path;

use tracing::info;

use crate::types::CapturedItem;

/// Prefix that makes spreadsheet tools read the file as UTF-8.
pub const BYTE_ORDER_MARK: char = '\u{FEFF}';

#[derive(thiserror::Error, Debug)]
pub enum ManifestError {
    #[error("At least one manifest column must be provided")]
    NoColumns,

    #[error("Failed to write manifest to {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// A raw field value before it is rendered as text.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Number(i64),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => f.write_str(s),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

/// One manifest column: a header and how to read the field from a record.
pub struct ManifestColumn<T> {
    pub header: &'static str,
    pub accessor: fn(&T) -> FieldValue,
    /// Renders the raw value; `Display` is used when absent.
    pub transform: Option<fn(&FieldValue) -> String>,
}

impl<T> ManifestColumn<T> {
    fn render(&self, row: &T) -> String {
        let value = (self.accessor)(row);
        match self.transform {
            Some(transform) => transform(&value),
            None => value.to_string(),
        }
    }
}

/// Columns of the captured-item manifest.
pub const ITEM_COLUMNS: &[ManifestColumn<CapturedItem>] = &[
    ManifestColumn {
        header: "ID",
        accessor: item_id,
        transform: None,
    },
    ManifestColumn {
        header: "タイトル",
        accessor: item_title,
        transform: None,
    },
    ManifestColumn {
        header: "サークル名",
        accessor: item_organization,
        transform: None,
    },
    ManifestColumn {
        header: "購入日時",
        accessor: item_caused_at,
        transform: None,
    },
    ManifestColumn {
        header: "ファイル名",
        accessor: item_file_name,
        transform: None,
    },
];

fn item_id(item: &CapturedItem) -> FieldValue {
    FieldValue::Text(item.id.clone())
}

fn item_title(item: &CapturedItem) -> FieldValue {
    FieldValue::Text(item.title.clone())
}

fn item_organization(item: &CapturedItem) -> FieldValue {
    FieldValue::Text(item.organization_name.clone())
}

fn item_caused_at(item: &CapturedItem) -> FieldValue {
    FieldValue::Text(item.caused_at.clone())
}

fn item_file_name(item: &CapturedItem) -> FieldValue {
    FieldValue::Text(item.file_name.clone())
}

fn escape(field: &str) -> String {
    if field.contains(['"', ',', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Encode rows as CSV text: a header line, then one line per row.
pub fn encode_manifest<'a, T, I>(rows: I, columns: &[ManifestColumn<T>]) -> Result<String, ManifestError>
where
    T: 'a,
    I: IntoIterator<Item = &'a T>,
{
    if columns.is_empty() {
        return Err(ManifestError::NoColumns);
    }

    let mut lines = Vec::new();
    lines.push(
        columns
            .iter()
            .map(|c| escape(c.header))
            .collect::<Vec<_>>()
            .join(","),
    );
    for row in rows {
        lines.push(
            columns
                .iter()
                .map(|c| escape(&c.render(row)))
                .collect::<Vec<_>>()
                .join(","),
        );
    }
    Ok(lines.join("\n"))
}

/// Encode rows and write them to `path` with a byte-order mark.
pub async fn write_manifest<'a, T, I>(
    path: &Path,
    rows: I,
    columns: &[ManifestColumn<T>],
) -> Result<(), ManifestError>
where
    T: 'a,
    I: IntoIterator<Item = &'a T>,
{
    let mut content = String::new();
    content.push(BYTE_ORDER_MARK);
    content.push_str(&encode_manifest(rows, columns)?);

    tokio::fs::write(path, content)
        .await
        .map_err(|source| ManifestError::Write {
            path: path.display().to_string(),
            source,
        })?;
    info!(path = %path.display(), "Manifest written");
    Ok(())
}
