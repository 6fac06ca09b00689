//! Seams to the hypervisor API and to the node bootstrapper.
//!
//! Neither is implemented here; callers plug in a XenAPI client and a
//! bootstrap runner. Tests use in-memory fakes.
#![allow(async_fn_in_trait)]

use anyhow::Result;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::structs::{HostCandidate, StorageRepositoryInfo};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateInfo {
    pub name: String,
    pub uuid: Uuid,
    pub reference: String,
}

/// A disk-type VBD of a template, with the SR its VDI lives on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateDisk {
    pub repository: String,
    pub virtual_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    pub name: String,
    pub reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmRef {
    pub name: String,
    pub reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VifInfo {
    pub reference: String,
    pub device: u32,
}

/// A new VIF. `mac: None` lets the hypervisor generate one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VifSpec {
    pub network_reference: String,
    pub device: u32,
    pub mac: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VdiRef {
    pub name: String,
    pub reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmAttribute {
    MemoryLimits {
        static_min: u64,
        static_max: u64,
        dynamic_min: u64,
        dynamic_max: u64,
    },
    VcpusMax(u32),
    VcpusAtStartup(u32),
    XenstoreData(BTreeMap<String, String>),
    Tags(Vec<String>),
}

pub trait ControlPlane {
    async fn hosts(&self) -> Result<Vec<HostCandidate>>;
    async fn storage_repositories(&self) -> Result<Vec<StorageRepositoryInfo>>;
    /// Name of the first pool's default SR, if one is set.
    async fn default_storage_repository(&self) -> Result<Option<String>>;
    async fn templates(&self) -> Result<Vec<TemplateInfo>>;
    async fn template_disks(&self, template: &TemplateInfo) -> Result<Vec<TemplateDisk>>;
    async fn networks(&self) -> Result<Vec<NetworkInfo>>;

    async fn clone_vm(&self, template: &TemplateInfo, name: &str, affinity: &str)
        -> Result<VmRef>;
    async fn vifs(&self, vm: &VmRef) -> Result<Vec<VifInfo>>;
    async fn destroy_vif(&self, vif: &VifInfo) -> Result<()>;
    async fn create_vif(&self, vm: &VmRef, spec: &VifSpec) -> Result<()>;
    async fn set_attribute(&self, vm: &VmRef, attribute: VmAttribute) -> Result<()>;
    async fn provision(&self, vm: &VmRef) -> Result<()>;
    async fn create_vdi(&self, name: &str, repository: &str, virtual_size: u64) -> Result<VdiRef>;
    async fn destroy_vdi(&self, vdi: &VdiRef) -> Result<()>;
    async fn attach_vdi(&self, vm: &VmRef, vdi: &VdiRef, user_device: u32, bootable: bool)
        -> Result<()>;
    async fn start(&self, vm: &VmRef) -> Result<()>;
    /// Refreshes guest metrics. `None` until the guest agent reports in.
    async fn guest_networks(&self, vm: &VmRef) -> Result<Option<Vec<String>>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapRequest {
    pub address: String,
    pub run_list: Vec<String>,
    pub first_boot_attributes: Option<serde_json::Value>,
    pub ssh_user: String,
    pub ssh_password: Option<String>,
    pub identity_file: Option<String>,
    pub host_key_verify: bool,
    pub node_name: String,
    pub environment: Option<String>,
    pub distro: String,
    pub template_file: Option<String>,
    pub bootstrap_version: Option<String>,
    pub use_sudo: bool,
}

pub trait Bootstrapper {
    async fn bootstrap(&self, request: &BootstrapRequest) -> Result<()>;
}
