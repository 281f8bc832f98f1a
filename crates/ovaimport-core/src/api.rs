//! Management API surface consumed by the importer.
//!
//! The [`ManagementApi`] trait is the seam between the pipeline and the
//! remote cluster: [`crate::client::HyperCoreClient`] speaks HTTP/JSON, tests
//! substitute a scripted implementation. Every call is a synchronous
//! request/response exchange.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::Result;

/// Operations the import pipeline needs from the management API.
pub trait ManagementApi {
    /// `POST /VirDomain/` - create a VM shell.
    fn create_vm(&self, request: &CreateVmRequest) -> Result<CreatedResource>;

    /// `GET /TaskTag/{tag}` - observe an asynchronous task.
    fn task_status(&self, tag: &TaskTag) -> Result<RemoteTask>;

    /// `PUT /VirtualDisk/upload` - stream a disk image, returning its UUID.
    fn upload_disk(&self, path: &Path, filename: &str, size: u64) -> Result<String>;

    /// `POST /VirtualDisk/{uuid}/attach` - attach an uploaded disk to a VM.
    fn attach_disk(&self, disk_uuid: &str, request: &AttachDiskRequest)
        -> Result<CreatedResource>;
}

/// Opaque identifier of a remote asynchronous task.
///
/// The API returns tags either as strings or as bare numbers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize)]
pub struct TaskTag(pub String);

impl TaskTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// An empty tag means the call completed synchronously.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for TaskTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for TaskTag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawTag {
            Text(String),
            Number(u64),
        }

        Ok(match RawTag::deserialize(deserializer)? {
            RawTag::Text(s) => TaskTag(s),
            RawTag::Number(n) => TaskTag(n.to_string()),
        })
    }
}

/// State of a remote task as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteTaskState {
    Pending,
    Running,
    Complete,
    Error,
}

impl RemoteTaskState {
    /// Map a wire state string. Unknown states count as pending.
    pub fn from_wire(state: &str) -> Self {
        match state {
            "RUNNING" => RemoteTaskState::Running,
            "COMPLETE" => RemoteTaskState::Complete,
            "ERROR" => RemoteTaskState::Error,
            _ => RemoteTaskState::Pending,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RemoteTaskState::Complete | RemoteTaskState::Error)
    }
}

/// One observation of a remote task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTask {
    pub tag: TaskTag,
    pub state: RemoteTaskState,
    pub error_message: Option<String>,
}

/// Body of `GET /TaskTag/{tag}`: a single object or a one-element list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum TaskStatusResponse {
    One(TaskStatusEntry),
    Many(Vec<TaskStatusEntry>),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusEntry {
    pub state: String,
    #[serde(default)]
    pub formatted_message: Option<String>,
}

impl TaskStatusResponse {
    /// Convert into a [`RemoteTask`]. An empty list reads as pending.
    pub fn into_task(self, tag: &TaskTag) -> RemoteTask {
        let entry = match self {
            TaskStatusResponse::One(entry) => Some(entry),
            TaskStatusResponse::Many(entries) => entries.into_iter().next(),
        };

        match entry {
            Some(entry) => RemoteTask {
                tag: tag.clone(),
                state: RemoteTaskState::from_wire(&entry.state),
                error_message: entry.formatted_message.filter(|m| !m.is_empty()),
            },
            None => RemoteTask {
                tag: tag.clone(),
                state: RemoteTaskState::Pending,
                error_message: None,
            },
        }
    }
}

/// Response of the create and attach calls (and, without a tag, upload).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CreatedResource {
    #[serde(rename = "createdUUID")]
    pub created_uuid: String,
    #[serde(rename = "taskTag", default)]
    pub task_tag: TaskTag,
}

/// Request body of `POST /VirDomain/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateVmRequest {
    pub dom: VmDomain,
    pub options: CreateVmOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmDomain {
    pub name: String,
    pub desc: String,
    /// Memory in bytes. Zero until configured after import.
    pub mem: u64,
    #[serde(rename = "numVCPU")]
    pub num_vcpu: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateVmOptions {
    pub machine_type_keyword: String,
}

/// Block device type used when attaching a disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceType {
    /// Paravirtualised performance driver.
    VirtioDisk,
    /// Generic IDE-class device.
    IdeDisk,
}

impl DeviceType {
    pub fn for_performance_driver(use_performance_driver: bool) -> Self {
        if use_performance_driver {
            DeviceType::VirtioDisk
        } else {
            DeviceType::IdeDisk
        }
    }
}

/// Request body of `POST /VirtualDisk/{uuid}/attach`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachDiskRequest {
    pub template: AttachTemplate,
    pub options: AttachOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachTemplate {
    #[serde(rename = "virDomainUUID")]
    pub vir_domain_uuid: String,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    pub capacity: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachOptions {
    #[serde(rename = "regenerateDiskID")]
    pub regenerate_disk_id: bool,
}
