//! Import orchestrator for OVA to HyperCore VM import.
//!
//! This module sequences the full pipeline for one appliance:
//! 1. Extract the OVA into a scoped working directory (and verify its manifest)
//! 2. Parse the OVF descriptor for firmware kind and disk images
//! 3. Create the VM shell and wait for the creation task
//! 4. Upload and attach every disk, in order, stopping at the first failure
//!
//! The working directory is removed on every exit path unless
//! [`ImportOptions::keep_work_dir`] is set.
//!
//! # Example
//!
//! ```no_run
//! use ovaimport_core::{import_ova, ImportOptions, ServerConfig};
//! use secrecy::SecretString;
//! use std::path::Path;
//!
//! let server = ServerConfig::new("10.0.0.5", "admin", SecretString::from("secret".to_string()));
//! let options = ImportOptions::default().with_performance_drivers(true);
//!
//! let report = import_ova(Path::new("/path/to/appliance.ova"), server, options, None).unwrap();
//! println!("VM {}", report.vm);
//! ```

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::api::ManagementApi;
use crate::client::{HyperCoreClient, ServerConfig};
use crate::error::{Error, Result};
use crate::manifest::verify_manifest;
use crate::ova::{extract_ova, WorkDir};
use crate::ovf::{parse_appliance, scan_files, DiskImage, FirmwareKind};
use crate::provision::{import_vm_name, VirtualMachineHandle, VmProvisioner};
use crate::task::{DEFAULT_POLL_INTERVAL, DEFAULT_TASK_TIMEOUT};
use crate::transfer::{
    DiskTransferEngine, DiskTransferResult, TransferSettings, TransferStep,
    DEFAULT_CONVERSION_GRACE,
};

/// Options for the import process.
#[derive(Debug, Clone)]
pub struct ImportOptions {
    /// Attach disks with the VIRTIO performance driver instead of IDE.
    pub use_performance_drivers: bool,
    /// Delay between task status queries.
    pub poll_interval: Duration,
    /// Deadline for each remote task.
    pub task_timeout: Duration,
    /// Fixed wait after each upload before attaching.
    pub conversion_grace: Duration,
    /// Directory under which the per-archive working directory is created.
    pub work_root: PathBuf,
    /// Leave the working directory in place after the job.
    pub keep_work_dir: bool,
    /// Check the archive manifest digests after extraction.
    pub verify_manifest: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            use_performance_drivers: false,
            poll_interval: DEFAULT_POLL_INTERVAL,
            task_timeout: DEFAULT_TASK_TIMEOUT,
            conversion_grace: DEFAULT_CONVERSION_GRACE,
            work_root: std::env::temp_dir(),
            keep_work_dir: false,
            verify_manifest: true,
        }
    }
}

impl ImportOptions {
    pub fn with_performance_drivers(mut self, enabled: bool) -> Self {
        self.use_performance_drivers = enabled;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_conversion_grace(mut self, grace: Duration) -> Self {
        self.conversion_grace = grace;
        self
    }

    pub fn with_work_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.work_root = root.into();
        self
    }

    pub fn with_keep_work_dir(mut self, keep: bool) -> Self {
        self.keep_work_dir = keep;
        self
    }

    pub fn with_verify_manifest(mut self, verify: bool) -> Self {
        self.verify_manifest = verify;
        self
    }

    /// Settings handed to the disk transfer engine.
    pub fn transfer_settings(&self) -> TransferSettings {
        TransferSettings {
            use_performance_driver: self.use_performance_drivers,
            conversion_grace: self.conversion_grace,
            task_timeout: self.task_timeout,
            poll_interval: self.poll_interval,
        }
    }

    /// Working directory used for `archive_path`.
    pub fn work_dir_for(&self, archive_path: &Path) -> PathBuf {
        let stem = archive_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "ova-import".to_string());
        self.work_root.join(stem)
    }
}

/// Pipeline stage, recorded when a job fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportStage {
    Extract,
    Parse,
    Provision,
    Transfer,
}

impl fmt::Display for ImportStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportStage::Extract => write!(f, "Extract"),
            ImportStage::Parse => write!(f, "Parse"),
            ImportStage::Provision => write!(f, "Provision"),
            ImportStage::Transfer => write!(f, "Transfer"),
        }
    }
}

/// Phase reported to progress callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportPhase {
    Extracting,
    Parsing,
    Provisioning,
    Uploading,
    Converting,
    Attaching,
    Complete,
}

impl fmt::Display for ImportPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportPhase::Extracting => write!(f, "Extracting"),
            ImportPhase::Parsing => write!(f, "Parsing"),
            ImportPhase::Provisioning => write!(f, "Provisioning"),
            ImportPhase::Uploading => write!(f, "Uploading"),
            ImportPhase::Converting => write!(f, "Converting"),
            ImportPhase::Attaching => write!(f, "Attaching"),
            ImportPhase::Complete => write!(f, "Complete"),
        }
    }
}

impl From<TransferStep> for ImportPhase {
    fn from(step: TransferStep) -> Self {
        match step {
            TransferStep::Uploading => ImportPhase::Uploading,
            TransferStep::Converting => ImportPhase::Converting,
            TransferStep::Attaching => ImportPhase::Attaching,
        }
    }
}

/// Progress information for the import process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportProgress {
    pub phase: ImportPhase,
    /// Disk being transferred (1-indexed), 0 outside the transfer stage.
    pub current_disk: usize,
    pub total_disks: usize,
    pub disk_name: Option<String>,
}

/// Type alias for the progress callback function.
pub type ProgressCallback = Box<dyn Fn(ImportProgress) + Send>;

/// Overall status of an import job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Where a failed job stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFailure {
    pub stage: ImportStage,
    /// Disk being transferred, for failures in the transfer stage.
    pub disk: Option<String>,
    pub cause: String,
}

/// Result of a successful import.
#[derive(Debug, Clone)]
pub struct ImportReport {
    pub vm: VirtualMachineHandle,
    pub firmware: FirmwareKind,
    pub disks: Vec<DiskTransferResult>,
}

/// One end-to-end import of an OVA archive.
///
/// The job owns its working directory and talks to the cluster only through
/// the API value it was given, so independent jobs share nothing.
pub struct ImportJob<'a, A: ManagementApi + ?Sized> {
    archive_path: PathBuf,
    work_dir: PathBuf,
    api: &'a A,
    options: ImportOptions,
    progress: Option<ProgressCallback>,
    status: JobStatus,
    vm: Option<VirtualMachineHandle>,
    results: Vec<DiskTransferResult>,
    failure: Option<StageFailure>,
}

type StageResult<T> = std::result::Result<T, (ImportStage, Option<String>, Error)>;

fn at(stage: ImportStage) -> impl Fn(Error) -> (ImportStage, Option<String>, Error) {
    move |e| (stage, None, e)
}

impl<'a, A: ManagementApi + ?Sized> ImportJob<'a, A> {
    /// Create a pending job for `archive_path`.
    pub fn new(archive_path: impl Into<PathBuf>, api: &'a A, options: ImportOptions) -> Self {
        let archive_path = archive_path.into();
        let work_dir = options.work_dir_for(&archive_path);
        Self {
            archive_path,
            work_dir,
            api,
            options,
            progress: None,
            status: JobStatus::Pending,
            vm: None,
            results: Vec::new(),
            failure: None,
        }
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// The provisioned VM, once the provision stage has succeeded.
    pub fn vm(&self) -> Option<&VirtualMachineHandle> {
        self.vm.as_ref()
    }

    /// Per-disk results, in transfer order.
    pub fn results(&self) -> &[DiskTransferResult] {
        &self.results
    }

    pub fn failure(&self) -> Option<&StageFailure> {
        self.failure.as_ref()
    }

    /// Run the job to completion.
    ///
    /// Running a job again starts over with fresh results.
    ///
    /// # Errors
    ///
    /// Any stage failure aborts the remaining stages and is returned as
    /// [`Error::Stage`], naming the stage and (for transfers) the disk.
    pub fn run(&mut self) -> Result<ImportReport> {
        self.status = JobStatus::Running;
        self.vm = None;
        self.results.clear();
        self.failure = None;

        let archive_name = self.archive_name();
        let _span = tracing::info_span!("import", archive = %archive_name).entered();
        tracing::info!(work_dir = %self.work_dir.display(), "starting import");

        let work_dir = WorkDir::new(&self.work_dir, self.options.keep_work_dir);
        let outcome = self.run_stages(&archive_name);
        if work_dir.is_kept() {
            tracing::info!(path = %work_dir.path().display(), "keeping working directory");
        }
        drop(work_dir);

        match outcome {
            Ok(report) => {
                self.status = JobStatus::Succeeded;
                tracing::info!(vm = %report.vm, disks = report.disks.len(), "import succeeded");
                Ok(report)
            }
            Err((stage, disk, error)) => {
                self.status = JobStatus::Failed;
                tracing::error!(%stage, disk = ?disk, error = %error, "import failed");
                self.failure = Some(StageFailure {
                    stage,
                    disk: disk.clone(),
                    cause: error.to_string(),
                });
                Err(Error::stage(stage, disk, error))
            }
        }
    }

    fn run_stages(&mut self, archive_name: &str) -> StageResult<ImportReport> {
        self.report(ImportPhase::Extracting, 0, 0, None);
        extract_ova(&self.archive_path, &self.work_dir).map_err(at(ImportStage::Extract))?;
        if self.options.verify_manifest {
            self.verify_manifests().map_err(at(ImportStage::Extract))?;
        }

        self.report(ImportPhase::Parsing, 0, 0, None);
        let descriptor = parse_appliance(&self.work_dir).map_err(at(ImportStage::Parse))?;
        let total_disks = descriptor.disks.len();
        if total_disks == 0 {
            tracing::warn!("appliance contains no disk images");
        }

        self.report(ImportPhase::Provisioning, 0, total_disks, None);
        let provisioner =
            VmProvisioner::new(self.api, self.options.task_timeout, self.options.poll_interval);
        let vm = provisioner
            .provision(&descriptor, &import_vm_name(archive_name))
            .map_err(at(ImportStage::Provision))?;
        self.vm = Some(vm.clone());

        let progress = &self.progress;
        let observer = |index: usize, disk: &DiskImage, step: TransferStep| {
            if let Some(callback) = progress {
                callback(ImportProgress {
                    phase: step.into(),
                    current_disk: index + 1,
                    total_disks,
                    disk_name: Some(disk.name.clone()),
                });
            }
        };
        let engine = DiskTransferEngine::new(self.api, self.options.transfer_settings())
            .with_observer(&observer);
        engine
            .transfer_all(&vm, &descriptor.disks, &mut self.results)
            .map_err(|failure| {
                (
                    ImportStage::Transfer,
                    Some(failure.result.source),
                    failure.error,
                )
            })?;

        self.report(ImportPhase::Complete, total_disks, total_disks, None);
        Ok(ImportReport {
            vm,
            firmware: descriptor.firmware,
            disks: self.results.clone(),
        })
    }

    fn verify_manifests(&self) -> Result<()> {
        let manifests: Vec<PathBuf> = scan_files(&self.work_dir)?
            .into_iter()
            .filter(|f| f.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("mf")))
            .collect();

        for manifest in manifests {
            let checked = verify_manifest(&self.work_dir.join(&manifest))?;
            tracing::info!(manifest = %manifest.display(), checked, "manifest verified");
        }
        Ok(())
    }

    fn archive_name(&self) -> String {
        self.archive_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.archive_path.display().to_string())
    }

    fn report(
        &self,
        phase: ImportPhase,
        current_disk: usize,
        total_disks: usize,
        disk_name: Option<String>,
    ) {
        if let Some(callback) = &self.progress {
            callback(ImportProgress {
                phase,
                current_disk,
                total_disks,
                disk_name,
            });
        }
    }
}

/// Import an OVA archive into the cluster described by `server`.
///
/// This is the main entry point: it builds a client for this job only and
/// runs an [`ImportJob`] with it.
pub fn import_ova(
    archive_path: &Path,
    server: ServerConfig,
    options: ImportOptions,
    progress_callback: Option<ProgressCallback>,
) -> Result<ImportReport> {
    let client = HyperCoreClient::new(server)?;
    tracing::debug!(endpoint = client.endpoint(), "connected client");

    let mut job = ImportJob::new(archive_path, &client, options);
    if let Some(callback) = progress_callback {
        job = job.with_progress(callback);
    }
    job.run()
}

/// Detail information about a disk image in an appliance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskDetail {
    pub filename: String,
    pub size_bytes: u64,
}

/// Summary information about an appliance.
#[derive(Debug, Clone)]
pub struct ApplianceInfo {
    pub descriptor: String,
    pub firmware: FirmwareKind,
    pub disks: Vec<DiskDetail>,
    pub total_disk_size: u64,
}

/// Extract and parse an appliance without contacting any server.
///
/// The working directory is removed before returning.
pub fn inspect_ova(archive_path: &Path, options: &ImportOptions) -> Result<ApplianceInfo> {
    let mut work_path = options.work_dir_for(archive_path).into_os_string();
    work_path.push("-inspect");
    let work_dir = WorkDir::new(PathBuf::from(work_path), false);

    extract_ova(archive_path, work_dir.path())?;
    if options.verify_manifest {
        for manifest in scan_files(work_dir.path())?
            .into_iter()
            .filter(|f| f.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("mf")))
        {
            verify_manifest(&work_dir.path().join(manifest))?;
        }
    }
    let descriptor = parse_appliance(work_dir.path())?;

    let mut disks = Vec::with_capacity(descriptor.disks.len());
    for disk in &descriptor.disks {
        let size_bytes = fs::metadata(&disk.path)
            .map_err(|e| Error::io(e, &disk.path))?
            .len();
        disks.push(DiskDetail {
            filename: disk.name.clone(),
            size_bytes,
        });
    }

    Ok(ApplianceInfo {
        descriptor: descriptor
            .descriptor_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        firmware: descriptor.firmware,
        total_disk_size: disks.iter().map(|d| d.size_bytes).sum(),
        disks,
    })
}
