//! Shared helpers for integration tests: a scripted management API and
//! builders for OVA fixtures.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use flate2::write::GzEncoder;
use flate2::Compression;
use ovaimport_core::api::{
    AttachDiskRequest, CreateVmRequest, CreatedResource, ManagementApi, RemoteTask,
    RemoteTaskState, TaskTag,
};
use ovaimport_core::{Error, Result};

pub const VM_UUID: &str = "vm-0001";
pub const CREATE_TAG: &str = "create-tag";

/// One scripted answer to a task status query.
#[derive(Debug, Clone)]
pub enum Step {
    Queued,
    Running,
    Complete,
    Error(&'static str),
    TransportFailure,
}

/// A call observed by [`MockApi`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreateVm(CreateVmRequest),
    TaskStatus(String),
    Upload { filename: String, size: u64 },
    Attach { disk_uuid: String, request: AttachDiskRequest },
}

/// In-memory management API that records every call.
///
/// Task tags without a script complete on the first query. A script's last
/// step repeats once the script is exhausted.
#[derive(Default)]
pub struct MockApi {
    calls: Mutex<Vec<Call>>,
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    failing_uploads: Mutex<HashSet<String>>,
    fail_create: Mutex<bool>,
}

impl MockApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the status sequence of `tag`.
    pub fn script(self, tag: &str, steps: Vec<Step>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(tag.to_string(), steps.into());
        self
    }

    /// Make the upload of `filename` fail with a transport error.
    pub fn fail_upload(self, filename: &str) -> Self {
        self.failing_uploads
            .lock()
            .unwrap()
            .insert(filename.to_string());
        self
    }

    /// Make the create-VM call itself fail.
    pub fn fail_create(self) -> Self {
        *self.fail_create.lock().unwrap() = true;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn uploads(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Upload { filename, .. } => Some(filename),
                _ => None,
            })
            .collect()
    }

    pub fn attaches(&self) -> Vec<(String, AttachDiskRequest)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Attach { disk_uuid, request } => Some((disk_uuid, request)),
                _ => None,
            })
            .collect()
    }

    pub fn status_queries(&self, tag: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::TaskStatus(t) if t == tag))
            .count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

/// Tag returned when attaching the disk uploaded from `filename`.
pub fn attach_tag(filename: &str) -> String {
    format!("attach-{}", upload_uuid(filename))
}

/// UUID returned for the upload of `filename`.
pub fn upload_uuid(filename: &str) -> String {
    format!("upload-{filename}")
}

/// Block device UUID returned for attaching the disk uploaded from `filename`.
pub fn block_device_uuid(filename: &str) -> String {
    format!("blockdev-{}", upload_uuid(filename))
}

impl ManagementApi for MockApi {
    fn create_vm(&self, request: &CreateVmRequest) -> Result<CreatedResource> {
        self.record(Call::CreateVm(request.clone()));
        if *self.fail_create.lock().unwrap() {
            return Err(Error::transport("HTTP 500 Internal Server Error - create failed"));
        }
        Ok(CreatedResource {
            created_uuid: VM_UUID.to_string(),
            task_tag: TaskTag::new(CREATE_TAG),
        })
    }

    fn task_status(&self, tag: &TaskTag) -> Result<RemoteTask> {
        self.record(Call::TaskStatus(tag.to_string()));

        let step = {
            let mut scripts = self.scripts.lock().unwrap();
            match scripts.get_mut(tag.as_str()) {
                Some(steps) if steps.len() > 1 => steps.pop_front(),
                Some(steps) => steps.front().cloned(),
                None => None,
            }
        }
        .unwrap_or(Step::Complete);

        let (state, error_message) = match step {
            Step::Queued => (RemoteTaskState::Pending, None),
            Step::Running => (RemoteTaskState::Running, None),
            Step::Complete => (RemoteTaskState::Complete, None),
            Step::Error(message) => (RemoteTaskState::Error, Some(message.to_string())),
            Step::TransportFailure => return Err(Error::transport("connection reset by peer")),
        };
        Ok(RemoteTask {
            tag: tag.clone(),
            state,
            error_message,
        })
    }

    fn upload_disk(&self, path: &Path, filename: &str, size: u64) -> Result<String> {
        self.record(Call::Upload {
            filename: filename.to_string(),
            size,
        });
        assert!(path.is_file(), "uploaded image must exist: {}", path.display());
        if self.failing_uploads.lock().unwrap().contains(filename) {
            return Err(Error::transport("broken pipe"));
        }
        Ok(upload_uuid(filename))
    }

    fn attach_disk(&self, disk_uuid: &str, request: &AttachDiskRequest) -> Result<CreatedResource> {
        self.record(Call::Attach {
            disk_uuid: disk_uuid.to_string(),
            request: request.clone(),
        });
        Ok(CreatedResource {
            created_uuid: format!("blockdev-{disk_uuid}"),
            task_tag: TaskTag::new(format!("attach-{disk_uuid}")),
        })
    }
}

/// OVF descriptor XML with an optional `Firmware` element and file references.
pub fn ovf_xml(firmware: Option<&str>, refs: &[&str]) -> String {
    let mut xml = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <ovf:Envelope xmlns:ovf=\"http://schemas.dmtf.org/ovf/envelope/1\">\n  <ovf:References>\n",
    );
    for (i, href) in refs.iter().enumerate() {
        xml.push_str(&format!(
            "    <ovf:File ovf:href=\"{href}\" ovf:id=\"file{}\"/>\n",
            i + 1
        ));
    }
    xml.push_str("  </ovf:References>\n  <ovf:VirtualSystem ovf:id=\"vm\">\n");
    if let Some(text) = firmware {
        xml.push_str(&format!("    <ovf:Firmware>{text}</ovf:Firmware>\n"));
    }
    xml.push_str("  </ovf:VirtualSystem>\n</ovf:Envelope>\n");
    xml
}

/// Write a plain TAR archive with the given members.
pub fn build_ova(dir: &Path, name: &str, members: &[(&str, &[u8])]) -> PathBuf {
    let path = dir.join(name);
    let file = File::create(&path).unwrap();
    let mut builder = tar::Builder::new(file);
    for (member, data) in members {
        append(&mut builder, member, data);
    }
    builder.into_inner().unwrap().flush().unwrap();
    path
}

/// Write a gzip-compressed TAR archive with the given members.
pub fn build_ova_gz(dir: &Path, name: &str, members: &[(&str, &[u8])]) -> PathBuf {
    let path = dir.join(name);
    let file = File::create(&path).unwrap();
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    for (member, data) in members {
        append(&mut builder, member, data);
    }
    builder.into_inner().unwrap().finish().unwrap();
    path
}

/// Write a TAR archive whose single member has `raw_name` written verbatim
/// into the header, bypassing the builder's path checks.
pub fn build_ova_raw_name(dir: &Path, name: &str, raw_name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    let file = File::create(&path).unwrap();
    let mut builder = tar::Builder::new(file);

    let mut header = tar::Header::new_old();
    {
        let old = header.as_old_mut();
        old.name[..raw_name.len()].copy_from_slice(raw_name.as_bytes());
    }
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_cksum();
    builder.append(&header, data).unwrap();
    builder.into_inner().unwrap().flush().unwrap();
    path
}

fn append<W: Write>(builder: &mut tar::Builder<W>, member: &str, data: &[u8]) {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, member, data).unwrap();
}

/// A standard appliance: descriptor with `firmware`, plus the named disks.
pub fn appliance(dir: &Path, name: &str, firmware: Option<&str>, disks: &[&str]) -> PathBuf {
    let xml = ovf_xml(firmware, &[]);
    let contents: Vec<Vec<u8>> = disks
        .iter()
        .map(|d| format!("raw image bytes of {d}").into_bytes())
        .collect();

    let mut members: Vec<(&str, &[u8])> = vec![("descriptor.ovf", xml.as_bytes())];
    for (disk, data) in disks.iter().zip(&contents) {
        members.push((disk, data.as_slice()));
    }
    build_ova(dir, name, &members)
}
