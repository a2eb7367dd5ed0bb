use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::cache::{CellKey, PreviewCache};
use crate::source::{Artifact, DataHandle, PreviewError, PreviewSource};
use crate::table::RowModel;

/// One unit of preview work. The epoch travels with the item so a result
/// arriving after an invalidation can be matched and discarded.
pub struct WorkItem {
    pub key: CellKey,
    pub epoch: u64,
    pub handle: DataHandle,
    pub preview_size: u32,
}

pub struct Completion {
    pub key: CellKey,
    pub epoch: u64,
    pub result: Result<Artifact, PreviewError>,
}

/// Notified on the UI thread whenever a slot transitioned to Ready/Failed.
/// Implementations re-check visibility themselves; a cell that scrolled away
/// since the request is a no-op, not an error.
pub trait RenderBridge {
    fn slot_ready(&mut self, key: &CellKey);
}

pub fn default_worker_count() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(4).min(8)
}

/// Spawns the bounded worker pool. Workers pull items until every sender is
/// dropped, run the source load off the UI thread, and push the result back.
/// Loads are never cancelled mid-flight; stale results are discarded on
/// arrival by the epoch check in `PreviewCache::complete`.
pub fn spawn_preview_pool(
    source: Arc<dyn PreviewSource>,
    workers: usize,
) -> (Sender<WorkItem>, Receiver<Completion>) {
    let (work_tx, work_rx) = unbounded::<WorkItem>();
    let (done_tx, done_rx) = unbounded();

    for _ in 0..workers.max(1) {
        let rx = work_rx.clone();
        let tx = done_tx.clone();
        let source = source.clone();

        thread::spawn(move || {
            while let Ok(item) = rx.recv() {
                let result = source.load(&item.handle, item.preview_size);
                let _ = tx.send(Completion { key: item.key, epoch: item.epoch, result });
            }
        });
    }

    (work_tx, done_rx)
}

/// The only component that calls `PreviewCache::request` and submits work.
/// Driven per frame: `pass` dispatches loads for newly visible cells,
/// `pump` applies finished loads, `observe_preview_size` translates the
/// global preview size setting into epoch bumps.
pub struct Scheduler {
    cache: Arc<PreviewCache>,
    work_tx: Sender<WorkItem>,
    done_rx: Receiver<Completion>,
    preview_size: u32,
    generate_previews: bool,
}

impl Scheduler {
    pub fn new(
        cache: Arc<PreviewCache>,
        source: Arc<dyn PreviewSource>,
        workers: usize,
        preview_size: u32,
    ) -> Self {
        let (work_tx, done_rx) = spawn_preview_pool(source, workers);
        Self { cache, work_tx, done_rx, preview_size, generate_previews: true }
    }

    pub fn cache(&self) -> &Arc<PreviewCache> {
        &self.cache
    }

    pub fn preview_size(&self) -> u32 {
        self.preview_size
    }

    pub fn generate_previews(&self) -> bool {
        self.generate_previews
    }

    pub fn set_generate_previews(&mut self, on: bool) {
        self.generate_previews = on;
    }

    /// Single translator from "preview size setting changed" to an epoch
    /// bump. The cache itself stays free of settings state. Returns whether
    /// an invalidation happened.
    pub fn observe_preview_size(&mut self, preview_size: u32) -> bool {
        if preview_size == self.preview_size {
            return false;
        }
        self.preview_size = preview_size;
        let epoch = self.cache.invalidate_all();
        debug!(epoch, preview_size, "preview size changed, cache invalidated");
        true
    }

    /// Requests every visible key and dispatches one work unit per newly
    /// claimed cell. Cells whose model has no data behind them (absent data
    /// annotation) resolve straight to Failed without touching a worker.
    /// Returns the number of dispatched units.
    pub fn pass(&self, visible: &HashSet<CellKey>, model: &dyn RowModel) -> usize {
        if !self.generate_previews {
            return 0;
        }
        let mut dispatched = 0;
        for key in visible {
            let Some(epoch) = self.cache.request(key) else {
                continue;
            };
            match model.data_handle(key.row, &key.column) {
                Some(handle) => {
                    let item = WorkItem {
                        key: key.clone(),
                        epoch,
                        handle,
                        preview_size: self.preview_size,
                    };
                    let _ = self.work_tx.send(item);
                    dispatched += 1;
                }
                None => {
                    self.cache.complete(key, epoch, Err(PreviewError::Missing));
                }
            }
        }
        dispatched
    }

    /// Drains worker completions. Must run on the UI thread: results are
    /// applied here and the bridge is notified for each applied slot, so all
    /// repaint handling stays off the workers. Returns the number applied.
    pub fn pump(&self, bridge: &mut dyn RenderBridge) -> usize {
        let mut applied = 0;
        while let Ok(done) = self.done_rx.try_recv() {
            let error = done.result.as_ref().err().map(|e| e.to_string());
            if self.cache.complete(&done.key, done.epoch, done.result) {
                if let Some(error) = error {
                    warn!(key = ?done.key, %error, "preview render failed");
                }
                bridge.slot_ready(&done.key);
                applied += 1;
            } else {
                debug!(key = ?done.key, epoch = done.epoch, "stale preview result discarded");
            }
        }
        applied
    }
}
