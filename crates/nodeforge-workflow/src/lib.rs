//! nodeforge Workflow Engine
//!
//! This crate provides the step/workflow contract used to provision a
//! cluster node. Every unit of work is a [`Step`]: it decides whether work
//! is needed, performs it, records what it did during the current run, and
//! can undo exactly that. A [`Workflow`] runs steps in order and, when one
//! fails, rolls back every step it already ran in reverse order.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                     Workflow                         │
//! │  ┌─────────────────────────────────────────────┐    │
//! │  │  Step 1 ─▶ Step 2 ─▶ Step 3 (fails)         │    │
//! │  └─────────────────────────────────────────────┘    │
//! │                      │                               │
//! │                      ▼                               │
//! │  ┌─────────────────────────────────────────────┐    │
//! │  │  rollback: Step 3 ─▶ Step 2 ─▶ Step 1       │    │
//! │  └─────────────────────────────────────────────┘    │
//! │                      │                               │
//! │                      ▼                               │
//! │  ┌─────────────────────────────────────────────┐    │
//! │  │  Report tree + Notifier events              │    │
//! │  └─────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use nodeforge_workflow::{StepContext, Workflow};
//!
//! let workflow = Workflow::builder("node")
//!     .step(install_containerd)
//!     .step(configure_containerd)
//!     .build()?;
//!
//! let report = workflow.execute(&StepContext::new()).await;
//! assert!(report.is_success());
//! ```

pub mod context;
pub mod error;
pub mod ledger;
pub mod notify;
pub mod report;
pub mod state;
pub mod step;
pub mod workflow;

pub use context::*;
pub use error::*;
pub use ledger::*;
pub use notify::*;
pub use report::*;
pub use state::*;
pub use step::*;
pub use workflow::*;
