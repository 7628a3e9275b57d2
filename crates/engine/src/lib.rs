//! Turtle API client, interaction-gated poller and persisted settings.

pub mod client;
pub mod poller;
pub mod settings;

pub use client::{ApiError, ErrorKind, HttpTurtleApi, TurtleApi};
pub use poller::{CommandOutcome, InteractionGate, PollStats, Poller, PollerConfig, ViewState};
pub use settings::{normalize_api_base_url, SettingsStore};
