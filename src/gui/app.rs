use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use eframe::egui;
use tracing::warn;

use crate::cache::{CellKey, PreviewCache};
use crate::config::{AppContext, GuiConfig};
use crate::sched::{default_worker_count, RenderBridge, Scheduler};
use crate::source::FilePreviewSource;
use crate::table::{MergedTable, ResultTable, RowModel, TableWatcher};

use super::APP_TITLE;

const RELOAD_DEBOUNCE: Duration = Duration::from_millis(400);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum SortKey {
    NameNatural,
    Modified,
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct SortOrder {
    pub key: SortKey,
    pub ascending: bool,
}

impl Default for SortOrder {
    fn default() -> Self {
        Self { key: SortKey::NameNatural, ascending: true }
    }
}

pub struct GuiApp {
    pub(super) ctx: AppContext,
    pub(super) gui_config: GuiConfig,
    dirs: Vec<PathBuf>,
    merged: bool,
    workers: usize,

    pub(super) model: Box<dyn RowModel>,
    pub(super) scheduler: Scheduler,

    // Uploaded textures for Ready cells, tagged with the epoch the artifact
    // was rendered under so stale ones are replaced on sight.
    pub(super) textures: HashMap<CellKey, (u64, egui::TextureHandle)>,
    // Keys the grid requested last frame; completions for anything else do
    // not trigger a repaint.
    pub(super) last_visible: HashSet<CellKey>,

    pub(super) sort: SortOrder,
    pub(super) view_to_model: Vec<usize>,
    pub(super) selected_row: Option<usize>,

    watcher: Option<TableWatcher>,
    reload_after: Option<Instant>,

    pub(super) status: Option<(String, bool)>,
    status_set_time: Option<Instant>,
    initial_scale_applied: bool,
    last_window_size: Option<(u32, u32)>,
    config_saved: bool,
}

impl GuiApp {
    pub fn new(
        dirs: Vec<PathBuf>,
        merge: bool,
        sort: &str,
        preview_size: Option<u32>,
        workers: Option<usize>,
    ) -> Result<Self> {
        let ctx = AppContext::new()?;
        let mut gui_config = ctx.gui_config.clone();
        if let Some(px) = preview_size {
            gui_config.preview_size = Some(px);
        }
        if let Some(n) = workers {
            gui_config.worker_threads = Some(n);
        }

        let merged = merge || dirs.len() > 1;
        let model = load_model(&dirs, merged)?;
        let worker_count = gui_config.worker_threads.unwrap_or_else(default_worker_count);
        let px = gui_config.preview_size.unwrap_or(64);

        let mut scheduler = Scheduler::new(
            Arc::new(PreviewCache::new()),
            Arc::new(FilePreviewSource),
            worker_count,
            px,
        );
        scheduler.set_generate_previews(gui_config.generate_previews.unwrap_or(true));

        let watcher = match TableWatcher::new(&dirs) {
            Ok(w) => Some(w),
            Err(e) => {
                warn!(error = %e, "directory watching disabled");
                None
            }
        };

        let sort = match sort {
            "date" => SortOrder { key: SortKey::Modified, ascending: true },
            "date-desc" => SortOrder { key: SortKey::Modified, ascending: false },
            "name-desc" => SortOrder { key: SortKey::NameNatural, ascending: false },
            _ => SortOrder::default(),
        };

        let mut app = Self {
            ctx,
            gui_config,
            dirs,
            merged,
            workers: worker_count,
            model,
            scheduler,
            textures: HashMap::new(),
            last_visible: HashSet::new(),
            sort,
            view_to_model: Vec::new(),
            selected_row: None,
            watcher,
            reload_after: None,
            status: None,
            status_set_time: None,
            initial_scale_applied: false,
            last_window_size: None,
            config_saved: false,
        };
        app.rebuild_view_mapping();
        Ok(app)
    }

    pub(super) fn merged(&self) -> bool {
        self.merged
    }

    pub(super) fn set_status(&mut self, msg: String, is_error: bool) {
        self.status = Some((msg, is_error));
        self.status_set_time = Some(Instant::now());
    }

    /// Rows changed on disk: replace the model and start over with a fresh
    /// cache and scheduler. Partial patching of the old cache is a bug
    /// factory; a clean swap never leaves half-invalidated slots behind.
    fn rebuild_model(&mut self) {
        match load_model(&self.dirs, self.merged) {
            Ok(model) => {
                let px = self.scheduler.preview_size();
                let generate = self.scheduler.generate_previews();
                let mut scheduler = Scheduler::new(
                    Arc::new(PreviewCache::new()),
                    Arc::new(FilePreviewSource),
                    self.workers,
                    px,
                );
                scheduler.set_generate_previews(generate);

                self.model = model;
                self.scheduler = scheduler;
                self.textures.clear();
                self.last_visible.clear();
                self.selected_row = None;
                self.rebuild_view_mapping();
                self.set_status(format!("Reloaded, {} rows", self.model.row_count()), false);
            }
            Err(e) => {
                self.set_status(format!("Reload failed: {e}"), true);
            }
        }
    }

    pub(super) fn set_sort(&mut self, key: SortKey) {
        if self.sort.key == key {
            self.sort.ascending = !self.sort.ascending;
        } else {
            self.sort = SortOrder { key, ascending: true };
        }
        // Only the view permutation changes; cell keys are model-row based,
        // so every cached preview stays valid.
        self.rebuild_view_mapping();
    }

    pub(super) fn rebuild_view_mapping(&mut self) {
        let n = self.model.row_count();
        let mut order: Vec<usize> = (0..n).collect();
        let model = self.model.as_ref();

        match &self.sort.key {
            SortKey::NameNatural => {
                let name = |row: usize| {
                    model
                        .record(row)
                        .and_then(|r| r.path.file_name())
                        .map(|s| s.to_string_lossy().to_lowercase())
                        .unwrap_or_default()
                };
                order.sort_by(|&a, &b| natord::compare(&name(a), &name(b)));
            }
            SortKey::Modified => {
                order.sort_by(|&a, &b| {
                    let ma = model.record(a).map(|r| r.modified);
                    let mb = model.record(b).map(|r| r.modified);
                    ma.cmp(&mb)
                });
            }
            SortKey::Text(column) => {
                order.sort_by(|&a, &b| {
                    let ta = model.text_annotation(a, column).unwrap_or("");
                    let tb = model.text_annotation(b, column).unwrap_or("");
                    ta.cmp(tb).then(a.cmp(&b))
                });
            }
        }
        if !self.sort.ascending {
            order.reverse();
        }
        self.view_to_model = order;
    }

    fn title_string(&self) -> String {
        format!(
            "{} v{} | {} rows",
            APP_TITLE,
            env!("CARGO_PKG_VERSION"),
            self.model.row_count()
        )
    }

    fn save_config(&mut self) {
        if self.config_saved {
            return;
        }
        self.config_saved = true;
        let mut gui_config = self.gui_config.clone();
        if let Some((w, h)) = self.last_window_size {
            gui_config.width = Some(w);
            gui_config.height = Some(h);
        }
        if let Err(e) = self.ctx.save_gui_config(&gui_config) {
            warn!(error = %e, "failed to save config");
        }
    }

    pub fn run(self) -> Result<(), eframe::Error> {
        let width = self.gui_config.width.unwrap_or(1280) as f32;
        let height = self.gui_config.height.unwrap_or(720) as f32;

        let options = eframe::NativeOptions {
            viewport: egui::ViewportBuilder::default().with_inner_size([width, height]),
            ..Default::default()
        };
        eframe::run_native(APP_TITLE, options, Box::new(move |_cc| Ok(Box::new(self))))
    }
}

fn load_model(dirs: &[PathBuf], merged: bool) -> Result<Box<dyn RowModel>> {
    let mut tables = dirs
        .iter()
        .map(|d| ResultTable::load(d))
        .collect::<Result<Vec<_>>>()?;
    if merged || tables.len() != 1 {
        Ok(Box::new(MergedTable::new(tables)))
    } else {
        // tables holds exactly one entry here.
        Ok(Box::new(tables.remove(0)))
    }
}

/// Repaint hook handed to the scheduler while draining completions. Repaints
/// only when the finished cell is still on screen; results for cells that
/// scrolled away simply wait in the cache.
struct FrameBridge<'a> {
    ctx: &'a egui::Context,
    visible: &'a HashSet<CellKey>,
}

impl RenderBridge for FrameBridge<'_> {
    fn slot_ready(&mut self, key: &CellKey) {
        if self.visible.contains(key) {
            self.ctx.request_repaint();
        }
    }
}

impl eframe::App for GuiApp {
    fn ui(&mut self, ui: &mut egui::Ui, _frame: &mut eframe::Frame) {
        let ctx = ui.ctx();
        ctx.send_viewport_cmd(egui::ViewportCommand::Title(self.title_string()));

        if !self.initial_scale_applied {
            let user_scale = self.gui_config.font_scale.unwrap_or(1.0);
            ctx.set_pixels_per_point(ctx.pixels_per_point() * user_scale);
            self.initial_scale_applied = true;
        }

        if let Some(set_time) = self.status_set_time {
            if set_time.elapsed() > Duration::from_secs(4) {
                self.status = None;
                self.status_set_time = None;
            }
        }

        // Apply finished renders before painting this frame.
        {
            let mut bridge = FrameBridge { ctx, visible: &self.last_visible };
            self.scheduler.pump(&mut bridge);
        }

        // Filesystem changes replace the model wholesale after a short
        // debounce, so bulk writes do not trigger a reload per file.
        if let Some(watcher) = &self.watcher {
            if watcher.take_dirty() {
                self.reload_after = Some(Instant::now() + RELOAD_DEBOUNCE);
            }
        }
        if let Some(at) = self.reload_after {
            if Instant::now() >= at {
                self.reload_after = None;
                self.rebuild_model();
            } else {
                ctx.request_repaint_after(RELOAD_DEBOUNCE);
            }
        }

        if let Some(rect) = ctx.input(|i| i.viewport().inner_rect) {
            self.last_window_size = Some((rect.width() as u32, rect.height() as u32));
        }

        egui::TopBottomPanel::top("settings").show(ctx, |ui| {
            ui.horizontal(|ui| {
                ui.label("Preview size:");
                let mut px = self.gui_config.preview_size.unwrap_or(64);
                let resp = ui.add(egui::Slider::new(&mut px, 16..=256).suffix(" px"));
                self.gui_config.preview_size = Some(px);
                // Invalidate only once the user lets go of the slider.
                if !resp.dragged() {
                    self.scheduler.observe_preview_size(px);
                }

                let mut generate = self.scheduler.generate_previews();
                if ui.checkbox(&mut generate, "Render previews").changed() {
                    self.scheduler.set_generate_previews(generate);
                    self.gui_config.generate_previews = Some(generate);
                }

                if self.merged() {
                    ui.separator();
                    ui.label(format!("{} tables merged", self.dirs.len().max(1)));
                }
            });
        });

        egui::TopBottomPanel::bottom("status").show(ctx, |ui| {
            if let Some((msg, is_error)) = &self.status {
                let color = if *is_error { egui::Color32::RED } else { egui::Color32::GREEN };
                ui.colored_label(color, msg);
            } else {
                let stats = self.scheduler.cache().stats();
                ui.label(format!(
                    "Rows: {} | Previews: {} ready, {} pending, {} failed",
                    self.model.row_count(),
                    stats.ready,
                    stats.pending,
                    stats.failed
                ));
            }
        });

        egui::CentralPanel::default().show(ctx, |ui| {
            super::grid::draw_grid(self, ui);
        });

        // A pending slot means a worker will finish soon; keep polling at a
        // gentle rate so its completion gets pumped without user input.
        if self.scheduler.cache().stats().pending > 0 {
            ctx.request_repaint_after(Duration::from_millis(100));
        }

        if ctx.input(|i| i.viewport().close_requested()) {
            self.save_config();
        }
    }
}
