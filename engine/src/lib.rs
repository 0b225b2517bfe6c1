//! # CardCopy Engine - Transfer Orchestration Library
//!
//! A headless engine that supervises bulk file transfers delegated to
//! `rsync`. Designed as the foundation for multiple front ends (CLI, web
//! handlers, automation).
//!
//! ## Overview
//!
//! The engine runs at most one operation at a time and exposes it through a
//! poll-based record. It features:
//! - Collision-free `<YYYYMMDD>/<LABEL>_<NNNNN>` destinations for card copies
//! - Source size estimation with `du`
//! - Incremental parsing of the transfer tool's progress output
//! - Cooperative cancellation with a forced kill after a grace period
//! - Removable device discovery and host power control
//!
//! ## Basic Usage
//!
//! ```no_run
//! use chrono::NaiveDate;
//! use engine::{OperationController, StartRequest};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let controller = OperationController::default();
//! let date = NaiveDate::from_ymd_opt(2024, 3, 5).ok_or("bad date")?;
//!
//! let id = controller
//!     .start(StartRequest::copy("/media/pi/EOS_DIGITAL", "/mnt/backup", date, Some("Canon".into())))
//!     .await?;
//!
//! loop {
//!     let record = controller.progress(id)?;
//!     println!("{}% {}", record.percentage, record.current_stage);
//!     if record.status.is_terminal() {
//!         break;
//!     }
//!     tokio::time::sleep(std::time::Duration::from_millis(500)).await;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **model**: Operation record, ids, modes and start requests
//! - **error**: Error types and handling
//! - **config**: External tool commands and engine settings
//! - **fs_ops**: Destination planning and path helpers
//! - **size**: Size token parsing and source size estimation
//! - **progress**: Progress line parsing
//! - **supervisor**: Transfer process supervision
//! - **controller**: The single-slot operation state machine
//! - **devices**: Removable device listing
//! - **power**: Reboot and shutdown

pub mod config;
pub mod controller;
pub mod devices;
pub mod error;
pub mod fs_ops;
pub mod model;
pub mod power;
pub mod progress;
pub mod size;
pub mod supervisor;

// Re-export main types and functions
pub use config::{EngineConfig, ToolCommand};
pub use controller::OperationController;
pub use devices::{Device, DeviceLister, LsblkDeviceLister};
pub use error::{EngineError, ErrorKind};
pub use fs_ops::parse_copy_date;
pub use model::{Mode, OperationId, OperationRecord, OperationStatus, StartRequest, ETA_UNKNOWN};
pub use power::{PowerAction, PowerControl};
pub use progress::{parse_progress_line, ProgressUpdate};
pub use size::parse_size_to_gb;
