//! # Review Orchestration Engine
//!
//! Automated code-review middleware: discovers review-worthy events via
//! webhook ingestion and periodic polling, plans and runs them through an
//! external code-assistant subprocess in token-bounded batches, and persists
//! the resulting findings against a per-task state machine.
//!
//! ## Architecture
//!
//! - Revision Store + Task Store (SQLite, single-writer/multi-reader pool)
//! - Working-Copy Manager (per-repo mutex-exclusive git checkouts)
//! - Change-Set Planner (token-bounded batches over a shared context map)
//! - Assistant Runner (subprocess invocation under a time budget)
//! - Report Parser & Scoring
//! - Webhook ingestion + Poller (event discovery)
//! - Scheduler / bounded worker pool (task execution)
//! - axum API surface (webhook intake, stats, polling control)

pub mod api;
pub mod assistant_runner;
pub mod batch_planner;
pub mod comment_adapter;
pub mod config;
pub mod db;
pub mod error;
pub mod metrics;
pub mod models;
pub mod platform_client;
pub mod poller;
pub mod report_parser;
pub mod scheduler;
pub mod server;
pub mod settings;
pub mod telemetry;
pub mod webhook;
pub mod working_copy;

pub use config::Config;
pub use error::{ReviewError, Result};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use server::{build_router, run, AppState};

/// Re-export of the crate's public surface for binaries and integration tests.
pub mod prelude {
    pub use crate::assistant_runner::{run_batch, AssistantRunConfig, BatchOutcome};
    pub use crate::batch_planner::{self, BatchPlanConfig, PlannedFile};
    pub use crate::comment_adapter::CommentAdapterConfig;
    pub use crate::config::Config;
    pub use crate::db::{self, DbError, DbResult, DbStats, TaskFilters};
    pub use crate::error::{ReviewError, Result};
    pub use crate::metrics::{global_registry, MetricsRegistry};
    pub use crate::models::{
        BatchResult, BatchStatus, ChangedFile, CloneStatus, Issue, Platform, RepoAuth, RepoConfig,
        ReviewTask, RevisionKind, RevisionMarker, RiskLevel, Severity, Strategy, TaskStatus,
        TriggerMode,
    };
    pub use crate::platform_client::{self, PlatformClient, RemoteCommit, RemoteMergeRequest};
    pub use crate::poller::{Poller, PollerConfig};
    pub use crate::report_parser;
    pub use crate::scheduler::{Scheduler, SchedulerConfig};
    pub use crate::server::{build_router, run, AppState};
    pub use crate::settings::SettingsStore;
    pub use crate::telemetry::TelemetryConfig;
    pub use crate::webhook::{self, WebhookOutcome};
    pub use crate::working_copy::WorkingCopyManager;
}
