use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver};
use notify::{RecursiveMode, Watcher};
use rayon::prelude::*;
use serde::Deserialize;
use tracing::info;
use walkdir::WalkDir;

use crate::cache::ColumnKey;
use crate::source::DataHandle;

pub const TABLE_MANIFEST: &str = "table.json";

const IMAGE_EXTS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "tif", "tiff", "webp"];

pub fn is_image_ext(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// One data row: the primary data file plus its annotations.
#[derive(Debug, Clone)]
pub struct RowRecord {
    pub path: PathBuf,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub string_repr: String,
    pub text_annotations: BTreeMap<String, String>,
    pub data_annotations: BTreeMap<String, PathBuf>,
}

/// Supplies stable row identities to the grid and the scheduler. Model rows
/// never move; sorting only permutes the view. A change in row count is
/// handled by replacing the whole model (and its cache), never by patching.
pub trait RowModel: Send + Sync {
    fn row_count(&self) -> usize;
    /// Columns that render previews: the primary data column first, then one
    /// per data annotation.
    fn preview_columns(&self) -> &[ColumnKey];
    fn text_columns(&self) -> &[String];
    fn data_handle(&self, row: usize, column: &ColumnKey) -> Option<DataHandle>;
    fn text_annotation(&self, row: usize, name: &str) -> Option<&str>;
    fn string_repr(&self, row: usize) -> Option<&str>;
    fn record(&self, row: usize) -> Option<&RowRecord>;
    /// Name of the table a row came from; used as the leading column when
    /// several tables are merged.
    fn source_name(&self, row: usize) -> Option<&str>;
}

// --- Manifest format ---

#[derive(Deserialize)]
struct Manifest {
    #[serde(default)]
    rows: Vec<ManifestRow>,
}

#[derive(Deserialize)]
struct ManifestRow {
    data: PathBuf,
    #[serde(default)]
    string_repr: Option<String>,
    #[serde(default)]
    text_annotations: BTreeMap<String, String>,
    #[serde(default)]
    data_annotations: BTreeMap<String, PathBuf>,
}

// --- ResultTable ---

/// One table directory. With a `table.json` manifest the rows and their
/// annotations come from there; without one, every image file in the
/// directory becomes a row (natural name order).
pub struct ResultTable {
    pub dir: PathBuf,
    pub name: String,
    pub rows: Vec<RowRecord>,
    preview_columns: Vec<ColumnKey>,
    text_columns: Vec<String>,
}

impl ResultTable {
    pub fn load(dir: &Path) -> Result<Self> {
        let dir = dir
            .canonicalize()
            .with_context(|| format!("cannot open table directory {:?}", dir))?;
        let manifest = dir.join(TABLE_MANIFEST);
        let rows = if manifest.is_file() {
            Self::rows_from_manifest(&dir, &manifest)?
        } else {
            Self::rows_from_scan(&dir)?
        };
        info!(dir = %dir.display(), rows = rows.len(), "loaded table");
        Ok(Self::from_rows(dir, rows))
    }

    fn from_rows(dir: PathBuf, rows: Vec<RowRecord>) -> Self {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| dir.display().to_string());
        let (preview_columns, text_columns) = union_columns(&rows);
        Self { dir, name, rows, preview_columns, text_columns }
    }

    fn rows_from_manifest(dir: &Path, manifest: &Path) -> Result<Vec<RowRecord>> {
        let text = fs::read_to_string(manifest)
            .with_context(|| format!("cannot read {:?}", manifest))?;
        let manifest: Manifest = serde_json::from_str(&text)
            .with_context(|| format!("malformed table manifest in {:?}", dir))?;

        let rows = manifest
            .rows
            .into_iter()
            .map(|row| {
                let path = dir.join(&row.data);
                // A row whose file went missing still gets a record; the
                // failure surfaces per cell when its preview renders.
                let (size, modified) = stat_or_default(&path);
                let string_repr = row
                    .string_repr
                    .unwrap_or_else(|| row.data.display().to_string());
                let data_annotations = row
                    .data_annotations
                    .into_iter()
                    .map(|(name, rel)| (name, dir.join(rel)))
                    .collect();
                RowRecord {
                    path,
                    size,
                    modified,
                    string_repr,
                    text_annotations: row.text_annotations,
                    data_annotations,
                }
            })
            .collect();
        Ok(rows)
    }

    fn rows_from_scan(dir: &Path) -> Result<Vec<RowRecord>> {
        let mut paths: Vec<PathBuf> = WalkDir::new(dir)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && is_image_ext(e.path()))
            .map(|e| e.into_path())
            .collect();

        paths.sort_by(|a, b| {
            let name_a = a.file_name().map(|s| s.to_string_lossy().to_lowercase()).unwrap_or_default();
            let name_b = b.file_name().map(|s| s.to_string_lossy().to_lowercase()).unwrap_or_default();
            natord::compare(&name_a, &name_b)
        });

        let rows = paths
            .par_iter()
            .map(|path| {
                let (size, modified) = stat_or_default(path);
                let string_repr = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                RowRecord {
                    path: path.clone(),
                    size,
                    modified,
                    string_repr,
                    text_annotations: BTreeMap::new(),
                    data_annotations: BTreeMap::new(),
                }
            })
            .collect();
        Ok(rows)
    }
}

fn stat_or_default(path: &Path) -> (u64, DateTime<Utc>) {
    match fs::metadata(path) {
        Ok(meta) => {
            let modified = DateTime::from(meta.modified().unwrap_or(UNIX_EPOCH));
            (meta.len(), modified)
        }
        Err(_) => (0, DateTime::from(UNIX_EPOCH)),
    }
}

/// Annotation columns are the union over all rows, so merged and sparse
/// tables show every column and absent cells fall back per cell.
fn union_columns(rows: &[RowRecord]) -> (Vec<ColumnKey>, Vec<String>) {
    let mut data_names = BTreeSet::new();
    let mut text_names = BTreeSet::new();
    for row in rows {
        data_names.extend(row.data_annotations.keys().cloned());
        text_names.extend(row.text_annotations.keys().cloned());
    }
    let mut preview_columns = vec![ColumnKey::Primary];
    preview_columns.extend(data_names.into_iter().map(ColumnKey::DataAnnotation));
    (preview_columns, text_names.into_iter().collect())
}

impl RowModel for ResultTable {
    fn row_count(&self) -> usize {
        self.rows.len()
    }

    fn preview_columns(&self) -> &[ColumnKey] {
        &self.preview_columns
    }

    fn text_columns(&self) -> &[String] {
        &self.text_columns
    }

    fn data_handle(&self, row: usize, column: &ColumnKey) -> Option<DataHandle> {
        let record = self.rows.get(row)?;
        match column {
            ColumnKey::Primary => Some(DataHandle::new(record.path.clone())),
            ColumnKey::DataAnnotation(name) => record
                .data_annotations
                .get(name)
                .map(|p| DataHandle::new(p.clone())),
            ColumnKey::TextAnnotation(_) => None,
        }
    }

    fn text_annotation(&self, row: usize, name: &str) -> Option<&str> {
        self.rows
            .get(row)?
            .text_annotations
            .get(name)
            .map(String::as_str)
    }

    fn string_repr(&self, row: usize) -> Option<&str> {
        self.rows.get(row).map(|r| r.string_repr.as_str())
    }

    fn record(&self, row: usize) -> Option<&RowRecord> {
        self.rows.get(row)
    }

    fn source_name(&self, _row: usize) -> Option<&str> {
        Some(&self.name)
    }
}

// --- MergedTable ---

/// Several tables flattened into one grid. Row identity stays
/// (table, local row); columns are the union across tables.
pub struct MergedTable {
    tables: Vec<ResultTable>,
    index: Vec<(usize, usize)>,
    preview_columns: Vec<ColumnKey>,
    text_columns: Vec<String>,
}

impl MergedTable {
    pub fn new(tables: Vec<ResultTable>) -> Self {
        let mut index = Vec::new();
        for (t, table) in tables.iter().enumerate() {
            for local in 0..table.rows.len() {
                index.push((t, local));
            }
        }

        let mut data_names = BTreeSet::new();
        let mut text_names = BTreeSet::new();
        for table in &tables {
            for col in &table.preview_columns {
                if let ColumnKey::DataAnnotation(name) = col {
                    data_names.insert(name.clone());
                }
            }
            text_names.extend(table.text_columns.iter().cloned());
        }
        let mut preview_columns = vec![ColumnKey::Primary];
        preview_columns.extend(data_names.into_iter().map(ColumnKey::DataAnnotation));

        Self {
            tables,
            index,
            preview_columns,
            text_columns: text_names.into_iter().collect(),
        }
    }

    fn resolve(&self, row: usize) -> Option<(&ResultTable, usize)> {
        let (t, local) = *self.index.get(row)?;
        Some((&self.tables[t], local))
    }
}

impl RowModel for MergedTable {
    fn row_count(&self) -> usize {
        self.index.len()
    }

    fn preview_columns(&self) -> &[ColumnKey] {
        &self.preview_columns
    }

    fn text_columns(&self) -> &[String] {
        &self.text_columns
    }

    fn data_handle(&self, row: usize, column: &ColumnKey) -> Option<DataHandle> {
        let (table, local) = self.resolve(row)?;
        table.data_handle(local, column)
    }

    fn text_annotation(&self, row: usize, name: &str) -> Option<&str> {
        let (table, local) = self.resolve(row)?;
        table.text_annotation(local, name)
    }

    fn string_repr(&self, row: usize) -> Option<&str> {
        let (table, local) = self.resolve(row)?;
        table.string_repr(local)
    }

    fn record(&self, row: usize) -> Option<&RowRecord> {
        let (table, local) = self.resolve(row)?;
        table.record(local)
    }

    fn source_name(&self, row: usize) -> Option<&str> {
        let (table, _) = self.resolve(row)?;
        Some(&table.name)
    }
}

// --- Directory watcher ---

/// Watches the table directories and reports, when polled, whether anything
/// changed since the last poll. The GUI reacts by reloading the model
/// wholesale and starting a fresh cache.
pub struct TableWatcher {
    _watcher: notify::RecommendedWatcher,
    rx: Receiver<()>,
}

impl TableWatcher {
    pub fn new(dirs: &[PathBuf]) -> Result<Self> {
        let (tx, rx) = unbounded();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if res.is_ok() {
                let _ = tx.send(());
            }
        })
        .context("cannot create filesystem watcher")?;
        for dir in dirs {
            watcher
                .watch(dir, RecursiveMode::Recursive)
                .with_context(|| format!("cannot watch {:?}", dir))?;
        }
        Ok(Self { _watcher: watcher, rx })
    }

    pub fn take_dirty(&self) -> bool {
        let mut dirty = false;
        while self.rx.try_recv().is_ok() {
            dirty = true;
        }
        dirty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::THUMBNAIL_DIR;

    fn touch(path: &Path) {
        fs::write(path, b"x").unwrap();
    }

    #[test]
    fn scan_fallback_orders_rows_naturally() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["img10.png", "img2.png", "img1.png", "notes.txt"] {
            touch(&dir.path().join(name));
        }

        let table = ResultTable::load(dir.path()).unwrap();
        let names: Vec<_> = table
            .rows
            .iter()
            .map(|r| r.path.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, ["img1.png", "img2.png", "img10.png"], "natural order, images only");
        assert_eq!(table.preview_columns(), &[ColumnKey::Primary]);
        assert!(table.text_columns().is_empty());
    }

    #[test]
    fn scan_fallback_skips_thumbnail_sidecars() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("a.png"));
        fs::create_dir(dir.path().join(THUMBNAIL_DIR)).unwrap();
        touch(&dir.path().join(THUMBNAIL_DIR).join("a.png"));

        let table = ResultTable::load(dir.path()).unwrap();
        assert_eq!(table.row_count(), 1);
    }

    #[test]
    fn manifest_rows_carry_annotations_and_union_columns() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("r0.png"));
        touch(&dir.path().join("r0_mask.png"));
        touch(&dir.path().join("r1.png"));
        fs::write(
            dir.path().join(TABLE_MANIFEST),
            r#"{
                "rows": [
                    {
                        "data": "r0.png",
                        "string_repr": "row zero",
                        "text_annotations": {"Sample": "A1"},
                        "data_annotations": {"Mask": "r0_mask.png"}
                    },
                    {
                        "data": "r1.png",
                        "text_annotations": {"Condition": "control"}
                    }
                ]
            }"#,
        )
        .unwrap();

        let table = ResultTable::load(dir.path()).unwrap();
        assert_eq!(table.row_count(), 2);
        assert_eq!(table.string_repr(0), Some("row zero"));
        assert_eq!(table.string_repr(1), Some("r1.png"));
        assert_eq!(table.text_annotation(0, "Sample"), Some("A1"));
        assert_eq!(table.text_annotation(1, "Sample"), None);

        // Column union over rows.
        assert_eq!(
            table.preview_columns(),
            &[ColumnKey::Primary, ColumnKey::DataAnnotation("Mask".into())]
        );
        assert_eq!(table.text_columns(), &["Condition".to_string(), "Sample".to_string()]);

        // Row 1 has no Mask annotation, so that cell has no handle.
        let mask = ColumnKey::DataAnnotation("Mask".into());
        assert!(table.data_handle(0, &mask).is_some());
        assert!(table.data_handle(1, &mask).is_none());
    }

    #[test]
    fn merged_table_flattens_rows_and_unions_columns() {
        let dir_a = tempfile::tempdir().unwrap();
        touch(&dir_a.path().join("a1.png"));
        touch(&dir_a.path().join("a2.png"));
        let dir_b = tempfile::tempdir().unwrap();
        touch(&dir_b.path().join("b1.png"));
        fs::write(
            dir_b.path().join(TABLE_MANIFEST),
            r#"{"rows": [{"data": "b1.png", "data_annotations": {"Labels": "b1.png"}}]}"#,
        )
        .unwrap();

        let a = ResultTable::load(dir_a.path()).unwrap();
        let b = ResultTable::load(dir_b.path()).unwrap();
        let a_name = a.name.clone();
        let b_name = b.name.clone();
        let merged = MergedTable::new(vec![a, b]);

        assert_eq!(merged.row_count(), 3);
        assert_eq!(merged.source_name(0), Some(a_name.as_str()));
        assert_eq!(merged.source_name(2), Some(b_name.as_str()));
        assert_eq!(
            merged.preview_columns(),
            &[ColumnKey::Primary, ColumnKey::DataAnnotation("Labels".into())]
        );

        // Rows from the first table have no Labels data.
        let labels = ColumnKey::DataAnnotation("Labels".into());
        assert!(merged.data_handle(0, &labels).is_none());
        assert!(merged.data_handle(2, &labels).is_some());
        assert!(merged.data_handle(3, &ColumnKey::Primary).is_none(), "out of range row");
    }
}
