//! VM shell provisioning.
//!
//! The VM is created with zero memory and zero vCPUs; sizing is configured
//! after import, outside this crate.

use std::fmt;
use std::time::Duration;

use crate::api::{CreateVmOptions, CreateVmRequest, ManagementApi, VmDomain};
use crate::error::Result;
use crate::ovf::ApplianceDescriptor;
use crate::task::await_completion;

/// Remote identifier (UUID) of a provisioned VM.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VirtualMachineHandle(String);

impl VirtualMachineHandle {
    pub fn new(uuid: impl Into<String>) -> Self {
        Self(uuid.into())
    }

    pub fn uuid(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VirtualMachineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name given to a VM created for importing `archive_name`.
pub fn import_vm_name(archive_name: &str) -> String {
    format!("Importing-{archive_name}")
}

/// Build the create request for `descriptor`.
pub fn create_request(descriptor: &ApplianceDescriptor, vm_name: &str) -> CreateVmRequest {
    CreateVmRequest {
        dom: VmDomain {
            name: vm_name.to_string(),
            desc: vm_name.to_string(),
            mem: 0,
            num_vcpu: 0,
        },
        options: CreateVmOptions {
            machine_type_keyword: descriptor.firmware.machine_type_keyword().to_string(),
        },
    }
}

/// Creates VM shells and waits for their creation task.
pub struct VmProvisioner<'a, A: ManagementApi + ?Sized> {
    api: &'a A,
    task_timeout: Duration,
    poll_interval: Duration,
}

impl<'a, A: ManagementApi + ?Sized> VmProvisioner<'a, A> {
    pub fn new(api: &'a A, task_timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            api,
            task_timeout,
            poll_interval,
        }
    }

    /// Create a VM for `descriptor` named `vm_name` and wait until it exists.
    ///
    /// # Errors
    ///
    /// Fails on a transport error from the create call, or when the creation
    /// task reports `ERROR` or does not finish in time. No handle is
    /// returned in that case, so no disk transfer can start.
    pub fn provision(
        &self,
        descriptor: &ApplianceDescriptor,
        vm_name: &str,
    ) -> Result<VirtualMachineHandle> {
        tracing::info!(
            name = vm_name,
            firmware = %descriptor.firmware,
            "creating VM"
        );

        let request = create_request(descriptor, vm_name);
        let created = self.api.create_vm(&request)?;
        await_completion(
            self.api,
            &created.task_tag,
            self.task_timeout,
            self.poll_interval,
        )?;

        let handle = VirtualMachineHandle::new(created.created_uuid);
        tracing::info!(vm = %handle, "VM created");
        Ok(handle)
    }
}
