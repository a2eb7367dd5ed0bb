pub mod app;
mod grid;

pub const APP_TITLE: &str = "previewgrid";
