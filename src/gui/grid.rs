use eframe::egui;

use crate::cache::{CacheSlot, CellKey, ColumnKey};
use crate::visibility;

use super::app::{GuiApp, SortKey};

const INDEX_WIDTH: f32 = 48.0;
const TABLE_WIDTH: f32 = 130.0;
const TEXT_WIDTH: f32 = 140.0;
const REPR_WIDTH: f32 = 240.0;
const MODIFIED_WIDTH: f32 = 110.0;
const CELL_PADDING: f32 = 4.0;
const HEADER_HEIGHT: f32 = 22.0;
const TEXT_ROW_HEIGHT: f32 = 24.0;

#[derive(Clone)]
enum GridColumn {
    Index,
    Table,
    Preview(ColumnKey),
    Repr,
    Text(String),
    Modified,
}

impl GridColumn {
    fn width(&self, row_h: f32) -> f32 {
        match self {
            GridColumn::Index => INDEX_WIDTH,
            GridColumn::Table => TABLE_WIDTH,
            GridColumn::Preview(_) => row_h.max(40.0),
            GridColumn::Repr => REPR_WIDTH,
            GridColumn::Text(_) => TEXT_WIDTH,
            GridColumn::Modified => MODIFIED_WIDTH,
        }
    }

    fn title(&self) -> String {
        match self {
            GridColumn::Index => "#".to_string(),
            GridColumn::Table => "Table".to_string(),
            GridColumn::Preview(key) => key.title().to_string(),
            GridColumn::Repr => "Data".to_string(),
            GridColumn::Text(name) => name.clone(),
            GridColumn::Modified => "Modified".to_string(),
        }
    }

    fn sort_key(&self) -> Option<SortKey> {
        match self {
            GridColumn::Repr => Some(SortKey::NameNatural),
            GridColumn::Modified => Some(SortKey::Modified),
            GridColumn::Text(name) => Some(SortKey::Text(name.clone())),
            _ => None,
        }
    }
}

fn build_columns(app: &GuiApp) -> Vec<GridColumn> {
    let mut columns = vec![GridColumn::Index];
    if app.merged() {
        columns.push(GridColumn::Table);
    }
    for key in app.model.preview_columns() {
        columns.push(GridColumn::Preview(key.clone()));
    }
    columns.push(GridColumn::Repr);
    for name in app.model.text_columns() {
        columns.push(GridColumn::Text(name.clone()));
    }
    columns.push(GridColumn::Modified);
    columns
}

pub(super) fn draw_grid(app: &mut GuiApp, ui: &mut egui::Ui) {
    let row_h = if app.scheduler.generate_previews() {
        app.scheduler.preview_size() as f32 + 2.0 * CELL_PADDING
    } else {
        TEXT_ROW_HEIGHT
    };
    let columns = build_columns(app);
    let grid_width: f32 = columns.iter().map(|c| c.width(row_h)).sum();

    if let Some(sort) = draw_header(app, ui, &columns, row_h) {
        app.set_sort(sort);
    }
    ui.separator();

    let n = app.model.row_count();
    if n == 0 {
        ui.centered_and_justified(|ui| {
            ui.label("No rows in this table");
        });
        return;
    }

    let prefetch = app.gui_config.prefetch_rows.unwrap_or(4);
    egui::ScrollArea::vertical()
        .auto_shrink([false, false])
        .show_viewport(ui, |ui, viewport| {
            let total_h = row_h * n as f32;
            ui.set_height(total_h);
            let content_width = ui.available_width().max(grid_width);

            // Schedule work for what is on (or near) the screen before any
            // painting happens, so freshly exposed cells go Pending within
            // the same frame.
            let row_rect = visibility::uniform_rows(row_h, content_width);
            let view_to_model = |v: usize| app.view_to_model.get(v).copied();
            let keys = visibility::visible_keys(
                viewport,
                n,
                &row_rect,
                &view_to_model,
                app.model.preview_columns(),
                prefetch,
            );
            app.scheduler.pass(&keys, app.model.as_ref());
            app.last_visible = keys;

            let origin = ui.min_rect().min;
            let first = (viewport.min.y / row_h).floor().max(0.0) as usize;
            let last = ((viewport.max.y / row_h).ceil() as usize).min(n);
            for view_row in first..last {
                let Some(model_row) = app.view_to_model.get(view_row).copied() else {
                    continue;
                };
                let rect = egui::Rect::from_min_size(
                    egui::pos2(origin.x, origin.y + view_row as f32 * row_h),
                    egui::vec2(content_width, row_h),
                );
                draw_row(app, ui, &columns, rect, model_row, view_row, row_h);
            }
        });

    // Drop textures that scrolled away or belong to an older epoch; the
    // artifacts stay in the preview cache, re-upload is cheap.
    let current_epoch = app.scheduler.cache().current_epoch();
    let visible = std::mem::take(&mut app.last_visible);
    app.textures.retain(|key, (epoch, _)| *epoch == current_epoch && visible.contains(key));
    app.last_visible = visible;
}

/// Header strip. Returns the sort key of a clicked sortable column.
fn draw_header(
    app: &GuiApp,
    ui: &mut egui::Ui,
    columns: &[GridColumn],
    row_h: f32,
) -> Option<SortKey> {
    let mut clicked = None;
    ui.horizontal(|ui| {
        ui.spacing_mut().item_spacing.x = 0.0;
        for column in columns {
            let mut title = column.title();
            let sort_key = column.sort_key();
            if let Some(key) = &sort_key {
                if *key == app.sort.key {
                    title.push_str(if app.sort.ascending { " \u{25b2}" } else { " \u{25bc}" });
                }
            }
            let size = egui::vec2(column.width(row_h), HEADER_HEIGHT);
            match sort_key {
                Some(key) => {
                    if ui.add_sized(size, egui::Button::new(title)).clicked() {
                        clicked = Some(key);
                    }
                }
                None => {
                    ui.add_sized(size, egui::Label::new(egui::RichText::new(title).strong()));
                }
            }
        }
    });
    clicked
}

fn draw_row(
    app: &mut GuiApp,
    ui: &mut egui::Ui,
    columns: &[GridColumn],
    row_rect: egui::Rect,
    model_row: usize,
    view_row: usize,
    row_h: f32,
) {
    let response = ui.allocate_rect(row_rect, egui::Sense::click());
    if response.clicked() {
        app.selected_row = Some(model_row);
    }

    let painter = ui.painter();
    if app.selected_row == Some(model_row) {
        painter.rect_filled(row_rect, 0.0, ui.visuals().selection.bg_fill.linear_multiply(0.4));
    } else if view_row % 2 == 1 {
        painter.rect_filled(row_rect, 0.0, ui.visuals().faint_bg_color);
    }

    let mut x = row_rect.min.x;
    for column in columns {
        let width = column.width(row_h);
        let cell = egui::Rect::from_min_size(egui::pos2(x, row_rect.min.y), egui::vec2(width, row_h));
        x += width;

        match column {
            GridColumn::Index => {
                draw_text_cell(ui, cell, &model_row.to_string(), true);
            }
            GridColumn::Table => {
                let name = app.model.source_name(model_row).unwrap_or("");
                draw_text_cell(ui, cell, name, false);
            }
            GridColumn::Preview(key) => {
                let key = CellKey { row: model_row, column: key.clone() };
                draw_preview_cell(app, ui, cell, key);
            }
            GridColumn::Repr => {
                let text = app.model.string_repr(model_row).unwrap_or("");
                draw_text_cell(ui, cell, text, false);
            }
            GridColumn::Text(name) => {
                let text = app.model.text_annotation(model_row, name).unwrap_or("");
                draw_text_cell(ui, cell, text, false);
            }
            GridColumn::Modified => {
                let text = app
                    .model
                    .record(model_row)
                    .map(|r| crate::modified_text(&r.modified))
                    .unwrap_or_default();
                draw_text_cell(ui, cell, &text, true);
            }
        }
    }
}

fn draw_text_cell(ui: &egui::Ui, cell: egui::Rect, text: &str, weak: bool) {
    if text.is_empty() {
        return;
    }
    let color = if weak {
        ui.visuals().weak_text_color()
    } else {
        ui.visuals().text_color()
    };
    let painter = ui.painter().with_clip_rect(cell.shrink(1.0));
    painter.text(
        egui::pos2(cell.min.x + CELL_PADDING, cell.center().y),
        egui::Align2::LEFT_CENTER,
        text,
        egui::FontId::new(12.0, egui::FontFamily::Proportional),
        color,
    );
}

fn draw_preview_cell(app: &mut GuiApp, ui: &mut egui::Ui, cell: egui::Rect, key: CellKey) {
    let inner = cell.shrink(CELL_PADDING);

    if !app.scheduler.generate_previews() {
        draw_fallback(ui, inner, None);
        return;
    }

    match app.scheduler.cache().get(&key) {
        CacheSlot::Ready { artifact, epoch } => {
            let texture = match app.textures.get(&key) {
                Some((tex_epoch, texture)) if *tex_epoch == epoch => texture.clone(),
                _ => {
                    // Upload happens here on the UI thread, at most once per
                    // artifact per epoch.
                    let name = format!("cell_r{}_{:?}", key.row, key.column);
                    let texture = ui.ctx().load_texture(name, artifact.image.clone(), Default::default());
                    app.textures.insert(key.clone(), (epoch, texture.clone()));
                    texture
                }
            };
            let size = texture.size_vec2();
            let scale = (inner.width() / size.x).min(inner.height() / size.y).min(1.0);
            let rect = egui::Rect::from_center_size(inner.center(), size * scale);
            egui::Image::from_texture((texture.id(), size)).paint_at(ui, rect);
        }
        CacheSlot::Pending { .. } => {
            ui.put(inner, egui::Spinner::new().size(inner.height().min(20.0)));
        }
        CacheSlot::Failed { error, .. } => {
            draw_fallback(ui, inner, Some(error));
        }
        // Not requested yet; the next visibility pass claims it.
        CacheSlot::Empty => {}
    }
}

/// The "N/A" glyph used both for failed renders and for disabled previews.
fn draw_fallback(ui: &mut egui::Ui, rect: egui::Rect, error: Option<String>) {
    ui.painter().text(
        rect.center(),
        egui::Align2::CENTER_CENTER,
        "N/A",
        egui::FontId::new(12.0, egui::FontFamily::Proportional),
        ui.visuals().weak_text_color(),
    );
    if let Some(error) = error {
        let id = egui::Id::new(("preview_fallback", rect.min.x.to_bits(), rect.min.y.to_bits()));
        ui.interact(rect, id, egui::Sense::hover()).on_hover_text(error);
    }
}
