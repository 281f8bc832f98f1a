//! Disk upload and attachment.
//!
//! Each disk goes through three steps: upload the raw image, wait a fixed
//! grace interval while the cluster converts it, then attach it to the VM as
//! a block device and wait for the attach task. Disks are processed one at a
//! time in descriptor order and the first failure stops the run.

use std::fmt;
use std::fs;
use std::thread;
use std::time::Duration;

use crate::api::{AttachDiskRequest, AttachOptions, AttachTemplate, DeviceType, ManagementApi};
use crate::error::{Error, Result};
use crate::ovf::DiskImage;
use crate::provision::VirtualMachineHandle;
use crate::task::{await_completion, DEFAULT_POLL_INTERVAL, DEFAULT_TASK_TIMEOUT};

/// Default wait between upload and attach.
///
/// The API offers no signal for the end of image conversion.
pub const DEFAULT_CONVERSION_GRACE: Duration = Duration::from_secs(90);

/// Final status of one disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskStatus {
    Attached,
    Failed,
}

/// Outcome of transferring one disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskTransferResult {
    /// Source image file name.
    pub source: String,
    /// UUID of the uploaded virtual disk, once the upload succeeded.
    pub uploaded_disk_id: Option<String>,
    /// UUID of the block device created by the attach call.
    pub block_device_id: Option<String>,
    pub status: DiskStatus,
}

impl DiskTransferResult {
    fn pending(source: &str) -> Self {
        Self {
            source: source.to_string(),
            uploaded_disk_id: None,
            block_device_id: None,
            status: DiskStatus::Failed,
        }
    }
}

/// A failed disk transfer: the partial result plus its cause.
///
/// `result.uploaded_disk_id` is set when the upload went through but the
/// attach did not; that virtual disk is left on the cluster.
#[derive(Debug)]
pub struct TransferFailure {
    pub result: DiskTransferResult,
    pub error: Error,
}

impl fmt::Display for TransferFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transfer of '{}' failed: {}", self.result.source, self.error)
    }
}

/// Step of a single disk transfer, for progress observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStep {
    Uploading,
    Converting,
    Attaching,
}

/// Settings for disk transfers.
#[derive(Debug, Clone)]
pub struct TransferSettings {
    /// Attach as `VIRTIO_DISK` instead of `IDE_DISK`.
    pub use_performance_driver: bool,
    pub conversion_grace: Duration,
    pub task_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            use_performance_driver: false,
            conversion_grace: DEFAULT_CONVERSION_GRACE,
            task_timeout: DEFAULT_TASK_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

type StepObserver<'a> = &'a dyn Fn(usize, &DiskImage, TransferStep);

/// Uploads disk images and attaches them to a provisioned VM.
pub struct DiskTransferEngine<'a, A: ManagementApi + ?Sized> {
    api: &'a A,
    settings: TransferSettings,
    observer: Option<StepObserver<'a>>,
}

impl<'a, A: ManagementApi + ?Sized> DiskTransferEngine<'a, A> {
    pub fn new(api: &'a A, settings: TransferSettings) -> Self {
        Self {
            api,
            settings,
            observer: None,
        }
    }

    /// Report each step with the zero-based disk index.
    pub fn with_observer(mut self, observer: StepObserver<'a>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Build the attach request for a disk of `capacity` bytes.
    pub fn attach_request(&self, vm: &VirtualMachineHandle, capacity: u64) -> AttachDiskRequest {
        AttachDiskRequest {
            template: AttachTemplate {
                vir_domain_uuid: vm.uuid().to_string(),
                device_type: DeviceType::for_performance_driver(
                    self.settings.use_performance_driver,
                ),
                capacity,
            },
            options: AttachOptions {
                regenerate_disk_id: false,
            },
        }
    }

    /// Transfer every disk in order, appending one result per attempted disk.
    ///
    /// Stops at the first failure; later disks are never uploaded.
    pub fn transfer_all(
        &self,
        vm: &VirtualMachineHandle,
        disks: &[DiskImage],
        results: &mut Vec<DiskTransferResult>,
    ) -> std::result::Result<(), TransferFailure> {
        for (index, disk) in disks.iter().enumerate() {
            let _span = tracing::info_span!("disk", name = %disk.name, index).entered();
            match self.transfer_indexed(index, vm, disk) {
                Ok(result) => results.push(result),
                Err(failure) => {
                    results.push(failure.result.clone());
                    let remaining = disks.len() - index - 1;
                    if remaining > 0 {
                        tracing::warn!(remaining, "aborting remaining disk transfers");
                    }
                    return Err(failure);
                }
            }
        }
        Ok(())
    }

    /// Upload `disk`, wait for conversion, and attach it to `vm`.
    pub fn transfer(
        &self,
        vm: &VirtualMachineHandle,
        disk: &DiskImage,
    ) -> std::result::Result<DiskTransferResult, TransferFailure> {
        self.transfer_indexed(0, vm, disk)
    }

    fn transfer_indexed(
        &self,
        index: usize,
        vm: &VirtualMachineHandle,
        disk: &DiskImage,
    ) -> std::result::Result<DiskTransferResult, TransferFailure> {
        let mut result = DiskTransferResult::pending(&disk.name);
        match self.run_steps(index, vm, disk, &mut result) {
            Ok(()) => {
                result.status = DiskStatus::Attached;
                Ok(result)
            }
            Err(error) => {
                if let Some(orphan) = &result.uploaded_disk_id {
                    tracing::warn!(
                        disk_uuid = %orphan,
                        "uploaded disk was not attached and remains on the cluster"
                    );
                }
                Err(TransferFailure { result, error })
            }
        }
    }

    fn run_steps(
        &self,
        index: usize,
        vm: &VirtualMachineHandle,
        disk: &DiskImage,
        result: &mut DiskTransferResult,
    ) -> Result<()> {
        let size = fs::metadata(&disk.path)
            .map_err(|e| Error::io(e, &disk.path))?
            .len();

        self.notify(index, disk, TransferStep::Uploading);
        tracing::info!(size, "uploading disk image");
        let uploaded = self.api.upload_disk(&disk.path, &disk.name, size)?;
        tracing::info!(disk_uuid = %uploaded, "upload finished");
        result.uploaded_disk_id = Some(uploaded.clone());

        // The image file is closed by now; nothing is held across the wait.
        self.notify(index, disk, TransferStep::Converting);
        if !self.settings.conversion_grace.is_zero() {
            tracing::info!(
                seconds = self.settings.conversion_grace.as_secs(),
                "waiting for disk conversion"
            );
            thread::sleep(self.settings.conversion_grace);
        }

        self.notify(index, disk, TransferStep::Attaching);
        let request = self.attach_request(vm, size);
        let attached = self.api.attach_disk(&uploaded, &request)?;
        await_completion(
            self.api,
            &attached.task_tag,
            self.settings.task_timeout,
            self.settings.poll_interval,
        )?;

        tracing::info!(
            block_device = %attached.created_uuid,
            vm = %vm,
            "disk attached"
        );
        result.block_device_id = Some(attached.created_uuid);
        Ok(())
    }

    fn notify(&self, index: usize, disk: &DiskImage, step: TransferStep) {
        if let Some(observer) = self.observer {
            observer(index, disk, step);
        }
    }
}
