//! OVA Import Core Library
//!
//! This crate provides the core functionality for importing OVA appliances
//! into a HyperCore cluster through its REST management API.
//!
//! # Overview
//!
//! An import extracts the OVA, reads the OVF descriptor, creates a VM shell
//! with the right firmware, then uploads each disk image and attaches it to
//! the VM as a block device. Every remote operation that returns a task tag
//! is polled to completion before the next step starts.
//! The main entry point is the [`import_ova`] function.
//!
//! # Modules
//!
//! - [`error`] - Error types and Result alias
//! - [`ova`] - OVA archive extraction and the scoped working directory
//! - [`manifest`] - OVA manifest digest verification
//! - [`ovf`] - OVF descriptor parsing
//! - [`api`] - Management API trait and wire types
//! - [`client`] - HTTP client for the management API
//! - [`task`] - Polling remote tasks to a terminal state
//! - [`provision`] - VM shell creation
//! - [`transfer`] - Disk upload and attachment
//! - [`import`] - Import orchestrator coordinating the full pipeline
//!
//! # Quick Start
//!
//! ```no_run
//! use ovaimport_core::{import_ova, ImportOptions, ServerConfig};
//! use secrecy::SecretString;
//! use std::path::Path;
//!
//! let server = ServerConfig::new("10.0.0.5", "admin", SecretString::from("secret".to_string()));
//! import_ova(Path::new("/path/to/appliance.ova"), server, ImportOptions::default(), None).unwrap();
//! ```

pub mod api;
pub mod client;
pub mod error;
pub mod import;
pub mod manifest;
pub mod ova;
pub mod ovf;
pub mod provision;
pub mod task;
pub mod transfer;

pub use error::{Error, Result};

// Re-export main import functionality for convenience
pub use import::{
    import_ova, inspect_ova, ApplianceInfo, DiskDetail, ImportJob, ImportOptions, ImportPhase,
    ImportProgress, ImportReport, ImportStage, JobStatus, ProgressCallback, StageFailure,
};

pub use api::ManagementApi;
pub use client::{HyperCoreClient, ServerConfig};
pub use ovf::{ApplianceDescriptor, FirmwareKind};
pub use provision::VirtualMachineHandle;
pub use transfer::{DiskStatus, DiskTransferResult};
