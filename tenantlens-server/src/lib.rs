pub mod app;

pub use app::{AppState, build_router};
