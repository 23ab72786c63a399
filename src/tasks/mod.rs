//! Task records, live update fan-out, and the HTTP/WebSocket surface.

pub mod model;
pub mod publisher;
pub mod routes;

pub use model::{TaskMetrics, TaskPage, TaskPatch, TaskQuery, TaskRecord, UpdateEvent};
pub use publisher::{Subscription, UpdatePublisher, spawn_heartbeat};
pub use routes::{AppState, task_routes};
