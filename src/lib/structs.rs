use serde::Deserialize;
use std::fmt;

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * 1024 * 1024;

pub const DEFAULT_VM_MEMORY_MB: u64 = 512;
pub const DEFAULT_VM_CPUS: u32 = 1;
pub const DEFAULT_SSH_USER: &str = "root";
pub const DEFAULT_DISTRO: &str = "ubuntu10.04-gems";
pub const DEFAULT_ENVIRONMENT: &str = "_default";

/// A pool member as reported by its host metrics.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HostCandidate {
    pub name: String,
    pub is_live: bool,
    pub memory_total: u64,
    pub memory_free: u64,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StorageRepositoryInfo {
    pub name: String,
    pub physical_size: u64,
    pub physical_utilisation: u64,
    pub virtual_allocation: u64,
}

/// Where a disk request lands. `Default` resolves to the pool's default SR.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RepositoryKey {
    Default,
    Named(String),
}

impl fmt::Display for RepositoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepositoryKey::Default => write!(f, "default"),
            RepositoryKey::Named(name) => write!(f, "{name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageRequest {
    pub repository: RepositoryKey,
    pub size_bytes: u64,
}

impl StorageRequest {
    pub fn new(repository: Option<&str>, size_bytes: u64) -> Self {
        StorageRequest {
            repository: match repository {
                Some(name) => RepositoryKey::Named(name.to_string()),
                None => RepositoryKey::Default,
            },
            size_bytes,
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission<T> {
    Admitted(T),
    Rejected { reason: String },
}

impl<T> Admission<T> {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted(_))
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Admission::Rejected {
            reason: reason.into(),
        }
    }

    /// Turns a rejection into a fatal error carrying its reason.
    pub fn into_result(self) -> anyhow::Result<T> {
        match self {
            Admission::Admitted(v) => Ok(v),
            Admission::Rejected { reason } => Err(anyhow::anyhow!(reason)),
        }
    }
}

/// Per-repository figures computed during storage admission.
#[derive(Debug, Clone, PartialEq)]
pub struct RepositoryVerdict {
    pub repository: String,
    pub requested_bytes: u64,
    pub projected_utilisation: f64,
    pub projected_allocation: f64,
    pub utilisation_pct: f64,
    pub admitted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Success { address: String },
    Failure { exhausted: bool },
}

/// Everything the operator asks for when creating one VM.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct VmCreateOptions {
    pub vm_template: Option<String>,
    pub vm_name: Option<String>,
    pub vm_memory: u64,
    pub vm_cpus: u32,
    pub vm_tags: Option<String>,
    pub vm_networks: Option<String>,
    pub mac_addresses: Option<String>,
    pub extra_vdis: Option<String>,
    pub vm_ip: Option<String>,
    pub vm_gateway: Option<String>,
    pub vm_netmask: Option<String>,
    pub vm_dns: Option<String>,
    pub vm_domain: Option<String>,
    pub skip_bootstrap: bool,
    pub keep_template_networks: bool,
    #[serde(deserialize_with = "crate::options::deserialize_run_list")]
    pub run_list: Vec<String>,
    pub first_boot_attributes: Option<String>,
    pub ssh_user: String,
    pub ssh_password: Option<String>,
    pub identity_file: Option<String>,
    pub host_key_verify: bool,
    pub node_name: Option<String>,
    pub environment: Option<String>,
    pub distro: String,
    pub template_file: Option<String>,
    pub bootstrap_version: Option<String>,
}

impl Default for VmCreateOptions {
    fn default() -> Self {
        VmCreateOptions {
            vm_template: None,
            vm_name: None,
            vm_memory: DEFAULT_VM_MEMORY_MB,
            vm_cpus: DEFAULT_VM_CPUS,
            vm_tags: None,
            vm_networks: None,
            mac_addresses: None,
            extra_vdis: None,
            vm_ip: None,
            vm_gateway: None,
            vm_netmask: None,
            vm_dns: None,
            vm_domain: None,
            skip_bootstrap: false,
            keep_template_networks: false,
            run_list: vec![],
            first_boot_attributes: None,
            ssh_user: DEFAULT_SSH_USER.to_string(),
            ssh_password: None,
            identity_file: None,
            host_key_verify: true,
            node_name: None,
            environment: None,
            distro: DEFAULT_DISTRO.to_string(),
            template_file: None,
            bootstrap_version: None,
        }
    }
}

pub fn bytes_to_gib(bytes: f64) -> f64 {
    bytes / GIB as f64
}
