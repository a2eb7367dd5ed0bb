use std::collections::HashSet;

use eframe::egui;

use crate::cache::{CellKey, ColumnKey};

/// Computes the set of cell keys whose rows intersect the viewport,
/// optionally widened by a prefetch margin of whole rows above and below.
///
/// `viewport` and the rects produced by `row_rect` share the same (content)
/// coordinate space; `row_rect` is indexed by view row, `view_to_model`
/// translates view rows to stable model rows. Both can change between calls
/// (sorting, filtering, row-height changes), so the set is recomputed from
/// scratch every time instead of tracking deltas. Grids here are bounded to
/// a few thousand rows, which keeps the full pass cheap.
///
/// Transient layout states (zero-sized viewport, empty model, no preview
/// columns) yield an empty set rather than an error.
pub fn visible_keys(
    viewport: egui::Rect,
    view_rows: usize,
    row_rect: &dyn Fn(usize) -> egui::Rect,
    view_to_model: &dyn Fn(usize) -> Option<usize>,
    preview_columns: &[ColumnKey],
    prefetch_rows: usize,
) -> HashSet<CellKey> {
    let mut keys = HashSet::new();
    if view_rows == 0 || preview_columns.is_empty() {
        return keys;
    }
    if viewport.width() <= 0.0 || viewport.height() <= 0.0 {
        return keys;
    }

    let mut first: Option<usize> = None;
    let mut last = 0usize;
    for view_row in 0..view_rows {
        if row_rect(view_row).intersects(viewport) {
            if first.is_none() {
                first = Some(view_row);
            }
            last = view_row;
        }
    }
    let Some(first) = first else {
        return keys;
    };

    let start = first.saturating_sub(prefetch_rows);
    let end = (last + prefetch_rows).min(view_rows - 1);
    for view_row in start..=end {
        let Some(model_row) = view_to_model(view_row) else {
            continue;
        };
        for column in preview_columns {
            if column.bears_preview() {
                keys.insert(CellKey { row: model_row, column: column.clone() });
            }
        }
    }
    keys
}

/// Row geometry for grids with a fixed row height, which is what the table
/// view uses (every preview cell is sized by the same preview setting).
pub fn uniform_rows(row_height: f32, width: f32) -> impl Fn(usize) -> egui::Rect {
    move |view_row| {
        egui::Rect::from_min_size(
            egui::pos2(0.0, view_row as f32 * row_height),
            egui::vec2(width, row_height),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn primary_only() -> Vec<ColumnKey> {
        vec![ColumnKey::Primary]
    }

    #[test]
    fn only_rows_in_viewport_are_returned() {
        // 1000 rows of 20px, viewport covering rows 10..=19.
        let viewport = egui::Rect::from_min_size(egui::pos2(0.0, 200.0), egui::vec2(400.0, 200.0));
        let rows = uniform_rows(20.0, 400.0);
        let keys = visible_keys(viewport, 1000, &rows, &|v| Some(v), &primary_only(), 0);

        assert!(keys.contains(&CellKey::primary(10)));
        assert!(keys.contains(&CellKey::primary(19)));
        assert!(!keys.contains(&CellKey::primary(8)));
        assert!(!keys.contains(&CellKey::primary(21)));
        assert!(!keys.contains(&CellKey::primary(500)), "off-screen rows must stay untouched");
        // Rows 9 and 20 touch the viewport edges and may count as visible.
        assert!((10..=12).contains(&keys.len()), "got {} keys", keys.len());
    }

    #[test]
    fn prefetch_margin_extends_both_directions() {
        let viewport = egui::Rect::from_min_size(egui::pos2(0.0, 200.0), egui::vec2(400.0, 200.0));
        let rows = uniform_rows(20.0, 400.0);
        let keys = visible_keys(viewport, 1000, &rows, &|v| Some(v), &primary_only(), 3);

        // Edge-touching rows 9 and 20 widen to 6..=23.
        assert!(keys.contains(&CellKey::primary(7)));
        assert!(keys.contains(&CellKey::primary(22)));
        assert!(!keys.contains(&CellKey::primary(5)));
        assert!(!keys.contains(&CellKey::primary(24)));
        assert!(!keys.contains(&CellKey::primary(30)));
    }

    #[test]
    fn keys_carry_model_rows_under_sorting() {
        // A descending sort: view row v displays model row 99 - v.
        let viewport = egui::Rect::from_min_size(egui::pos2(0.0, 0.0), egui::vec2(400.0, 40.0));
        let rows = uniform_rows(20.0, 400.0);
        let keys = visible_keys(viewport, 100, &rows, &|v| Some(99 - v), &primary_only(), 0);

        assert!(keys.contains(&CellKey::primary(99)));
        assert!(keys.contains(&CellKey::primary(98)));
        assert!(!keys.contains(&CellKey::primary(0)));
    }

    #[test]
    fn every_preview_column_yields_a_key() {
        let viewport = egui::Rect::from_min_size(egui::pos2(0.0, 0.0), egui::vec2(400.0, 10.0));
        let rows = uniform_rows(20.0, 400.0);
        let columns = vec![
            ColumnKey::Primary,
            ColumnKey::DataAnnotation("Mask".into()),
            ColumnKey::TextAnnotation("Sample".into()),
        ];
        let keys = visible_keys(viewport, 10, &rows, &|v| Some(v), &columns, 0);

        assert!(keys.contains(&CellKey::primary(0)));
        assert!(keys.contains(&CellKey::data_annotation(0, "Mask")));
        // Text annotations never render previews.
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn degenerate_layouts_yield_empty_sets() {
        let rows = uniform_rows(20.0, 400.0);
        let zero = egui::Rect::from_min_size(egui::pos2(0.0, 0.0), egui::vec2(0.0, 0.0));
        let ok = egui::Rect::from_min_size(egui::pos2(0.0, 0.0), egui::vec2(400.0, 100.0));

        assert!(visible_keys(zero, 100, &rows, &|v| Some(v), &primary_only(), 2).is_empty());
        assert!(visible_keys(ok, 0, &rows, &|v| Some(v), &primary_only(), 2).is_empty());
        assert!(visible_keys(ok, 100, &rows, &|v| Some(v), &[], 2).is_empty());
        // Viewport scrolled past the end of the content.
        let below = egui::Rect::from_min_size(egui::pos2(0.0, 5000.0), egui::vec2(400.0, 100.0));
        assert!(visible_keys(below, 100, &rows, &|v| Some(v), &primary_only(), 2).is_empty());
    }
}
