//! The `vm create` workflow: validate, admit, clone, configure, start, wait
//! for sshd and hand the guest to the bootstrapper.
//!
//! Hypervisor calls are not rolled back. Errors raised after the clone carry
//! the last completed [`ProvisionStage`] so the operator knows what is left
//! behind.

use anyhow::{bail, Context, Result};
use std::fmt;
use uuid::Uuid;

use crate::capacity::{plan, Placement};
use crate::control_plane::{
    BootstrapRequest, Bootstrapper, ControlPlane, TemplateInfo, VdiRef, VifSpec, VmAttribute,
    VmRef,
};
use crate::options::{
    apply_guest_network_defaults, parse_extra_vdis, parse_nics, parse_tags, xenstore_data,
    NicRequest,
};
use crate::readiness::ReadinessPoller;
use crate::settings::Settings;
use crate::snapshot::PoolSnapshot;
use crate::structs::{
    RepositoryKey, StorageRequest, VmCreateOptions, DEFAULT_ENVIRONMENT, DEFAULT_SSH_USER, MIB,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProvisionStage {
    Created,
    NetworksConfigured,
    AttributesSet,
    Provisioned,
    DisksAttached,
    Started,
}

impl fmt::Display for ProvisionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProvisionStage::Created => "created",
            ProvisionStage::NetworksConfigured => "networks configured",
            ProvisionStage::AttributesSet => "attributes set",
            ProvisionStage::Provisioned => "provisioned",
            ProvisionStage::DisksAttached => "disks attached",
            ProvisionStage::Started => "started",
        };
        write!(f, "{s}")
    }
}

/// A request that passed validation. Nothing has touched the hypervisor yet.
#[derive(Debug, Clone)]
pub struct ValidatedRequest {
    pub template: String,
    pub name: String,
    pub memory_bytes: u64,
    pub cpus: u32,
    pub nics: Vec<NicRequest>,
    pub extra_vdis: Vec<StorageRequest>,
    pub tags: Vec<String>,
    pub first_boot_attributes: Option<serde_json::Value>,
    pub options: VmCreateOptions,
}

/// Checks required options and parses the free-form ones. Also fills in the
/// guest network defaults.
pub fn validate(mut opts: VmCreateOptions, settings: &Settings) -> Result<ValidatedRequest> {
    let template = match opts.vm_template.as_deref().map(str::trim) {
        Some(t) if !t.is_empty() => t.to_string(),
        _ => bail!("You have not provided a valid template name. (--vm-template)"),
    };
    let name = match opts.vm_name.as_deref().map(str::trim) {
        Some(n) if !n.is_empty() => n.to_string(),
        _ => bail!("Invalid Virtual Machine name (--vm-name)"),
    };
    if opts.vm_memory == 0 {
        bail!("Invalid memory size (--vm-memory)");
    }
    if opts.vm_cpus == 0 {
        bail!("Invalid VCPU count (--vm-cpus)");
    }
    let memory_bytes = match opts.vm_memory.checked_mul(MIB) {
        Some(b) => b,
        None => bail!("Invalid memory size (--vm-memory): {} MB", opts.vm_memory),
    };
    let extra_vdis = match &opts.extra_vdis {
        Some(spec) => parse_extra_vdis(spec)?,
        None => vec![],
    };
    let nics = match &opts.vm_networks {
        Some(networks) => parse_nics(networks, opts.mac_addresses.as_deref()),
        None => vec![],
    };
    let tags = opts.vm_tags.as_deref().map(parse_tags).unwrap_or_default();
    let first_boot_attributes = match opts.first_boot_attributes.as_deref() {
        Some(json) => Some(
            serde_json::from_str::<serde_json::Value>(json)
                .context("Invalid JSON in first boot attributes (--json-attributes)")?,
        ),
        None => None,
    };
    apply_guest_network_defaults(&mut opts, &settings.guest_network);

    Ok(ValidatedRequest {
        template,
        name,
        memory_bytes,
        cpus: opts.vm_cpus,
        nics,
        extra_vdis,
        tags,
        first_boot_attributes,
        options: opts,
    })
}

/// Templates match by name, or by UUID when the argument parses as one.
pub fn find_template<'a>(templates: &'a [TemplateInfo], wanted: &str) -> Option<&'a TemplateInfo> {
    let uuid = Uuid::parse_str(wanted).ok();
    templates
        .iter()
        .find(|t| t.name == wanted || Some(t.uuid) == uuid)
}

#[derive(Debug, Clone)]
pub struct ProvisionReport {
    pub vm: VmRef,
    pub host: String,
    pub stage: ProvisionStage,
    pub ssh_address: Option<String>,
    pub bootstrapped: bool,
}

/// Drives one VM through the creation stages.
pub struct VmCreate<'a, P: ControlPlane, B: Bootstrapper> {
    plane: &'a P,
    bootstrapper: &'a B,
    settings: &'a Settings,
}

impl<'a, P: ControlPlane, B: Bootstrapper> VmCreate<'a, P, B> {
    pub fn new(plane: &'a P, bootstrapper: &'a B, settings: &'a Settings) -> Self {
        VmCreate {
            plane,
            bootstrapper,
            settings,
        }
    }

    pub async fn run(&self, opts: VmCreateOptions) -> Result<ProvisionReport> {
        let req = validate(opts, self.settings)?;

        let templates = self.plane.templates().await.context("failed to list templates")?;
        let template = match find_template(&templates, &req.template) {
            Some(t) => t.clone(),
            None => bail!("Template {} not found.", req.template),
        };
        info!("Creating VM {}...", req.name);
        info!("Using template {} [uuid: {}]...", template.name, template.uuid);

        let snapshot = PoolSnapshot::capture(self.plane).await?;
        let template_disks: Vec<StorageRequest> = self
            .plane
            .template_disks(&template)
            .await
            .with_context(|| format!("failed to read disks of template {}", template.name))?
            .into_iter()
            .map(|d| StorageRequest::new(Some(&d.repository), d.virtual_size))
            .collect();
        let placement = plan(
            &snapshot,
            req.memory_bytes,
            &template_disks,
            &req.extra_vdis,
            &self.settings.planner,
        )?;

        let vm = self
            .plane
            .clone_vm(&template, &req.name, &placement.host.name)
            .await
            .with_context(|| format!("failed to create VM {}", req.name))?;
        let mut report = ProvisionReport {
            vm: vm.clone(),
            host: placement.host.name.clone(),
            stage: ProvisionStage::Created,
            ssh_address: None,
            bootstrapped: false,
        };

        if let Err(e) = self.configure(&req, &snapshot, &placement, &mut report).await {
            return Err(e.context(format!(
                "VM {} left in stage '{}'",
                report.vm.name, report.stage
            )));
        }

        info!("VM Name: {}", report.vm.name);
        info!("VM Memory: {} MB", req.memory_bytes / MIB);

        if req.options.skip_bootstrap {
            warn!("Skipping bootstrapping as requested.");
            return Ok(report);
        }

        let poller = ReadinessPoller::from_settings(&self.settings.readiness);
        info!("Waiting server...");
        let address = poller
            .wait_for_ssh(self.plane, &report.vm, req.options.vm_ip.as_deref())
            .await
            .with_context(|| format!("VM {} started but never became reachable", report.vm.name))?;
        report.ssh_address = Some(address.clone());

        let request = bootstrap_request(&req, &address);
        self.bootstrapper
            .bootstrap(&request)
            .await
            .with_context(|| format!("bootstrap of {} at {address} failed", request.node_name))?;
        report.bootstrapped = true;

        info!("Name: {}", report.vm.name);
        info!("IP Address: {address}");
        info!(
            "Environment: {}",
            request.environment.as_deref().unwrap_or(DEFAULT_ENVIRONMENT)
        );
        info!("Run List: {}", request.run_list.join(", "));
        info!("Done!");
        Ok(report)
    }

    async fn configure(
        &self,
        req: &ValidatedRequest,
        snapshot: &PoolSnapshot,
        placement: &Placement,
        report: &mut ProvisionReport,
    ) -> Result<()> {
        let vm = report.vm.clone();
        debug!(
            "{} placed on {} ({} template SRs, {} extra SRs checked)",
            vm.name,
            placement.host.name,
            placement.template_storage.len(),
            placement.extra_storage.len()
        );

        self.configure_networks(&vm, req).await?;
        report.stage = ProvisionStage::NetworksConfigured;

        self.set_attributes(&vm, req).await?;
        report.stage = ProvisionStage::AttributesSet;

        self.plane
            .provision(&vm)
            .await
            .with_context(|| format!("failed to provision {}", vm.name))?;
        report.stage = ProvisionStage::Provisioned;

        self.create_extra_vdis(&vm, req, snapshot).await?;
        report.stage = ProvisionStage::DisksAttached;

        self.plane
            .start(&vm)
            .await
            .with_context(|| format!("failed to start {}", vm.name))?;
        report.stage = ProvisionStage::Started;
        Ok(())
    }

    async fn configure_networks(&self, vm: &VmRef, req: &ValidatedRequest) -> Result<()> {
        if !req.options.keep_template_networks {
            for vif in self.plane.vifs(vm).await.context("failed to list VIFs")? {
                debug!("destroying template VIF {} (device {})", vif.reference, vif.device);
                self.plane
                    .destroy_vif(&vif)
                    .await
                    .with_context(|| format!("failed to destroy VIF {}", vif.reference))?;
            }
        }
        if req.nics.is_empty() {
            return Ok(());
        }

        let networks = self.plane.networks().await.context("failed to list networks")?;
        let highest_device = self
            .plane
            .vifs(vm)
            .await
            .context("failed to list VIFs")?
            .iter()
            .map(|v| i64::from(v.device))
            .max()
            .unwrap_or(-1);
        for (i, nic) in req.nics.iter().enumerate() {
            let net = match networks.iter().find(|n| n.name == nic.network) {
                Some(n) => n,
                None => bail!("Network {} not found", nic.network),
            };
            let device = u32::try_from(highest_device + 1 + i as i64)
                .context("VIF device index out of range")?;
            let spec = VifSpec {
                network_reference: net.reference.clone(),
                device,
                mac: nic.mac.clone(),
            };
            info!(
                "Attaching {} to network {} as device {device}",
                vm.name, net.name
            );
            self.plane
                .create_vif(vm, &spec)
                .await
                .with_context(|| format!("failed to create VIF on network {}", net.name))?;
        }
        Ok(())
    }

    async fn set_attributes(&self, vm: &VmRef, req: &ValidatedRequest) -> Result<()> {
        let mem = req.memory_bytes;
        let mut attributes = vec![
            VmAttribute::MemoryLimits {
                static_min: mem,
                static_max: mem,
                dynamic_min: mem,
                dynamic_max: mem,
            },
            VmAttribute::VcpusMax(req.cpus),
            VmAttribute::VcpusAtStartup(req.cpus),
        ];
        let xenstore = xenstore_data(&req.options);
        if !xenstore.is_empty() {
            info!("Adding attributes to xenstore...");
            attributes.push(VmAttribute::XenstoreData(xenstore));
        }
        if !req.tags.is_empty() {
            attributes.push(VmAttribute::Tags(req.tags.clone()));
        }
        for attribute in attributes {
            self.plane
                .set_attribute(vm, attribute.clone())
                .await
                .with_context(|| format!("failed to set {attribute:?} on {}", vm.name))?;
        }
        Ok(())
    }

    async fn create_extra_vdis(
        &self,
        vm: &VmRef,
        req: &ValidatedRequest,
        snapshot: &PoolSnapshot,
    ) -> Result<()> {
        let mut device: u32 = 0;
        for (i, extra) in req.extra_vdis.iter().enumerate() {
            let index = i + 1;
            device += 1;
            let sr = match snapshot.repository(&extra.repository) {
                Some(sr) => sr,
                None => bail!("Storage Repository {} not available", extra.repository),
            };
            if extra.repository == RepositoryKey::Default {
                warn!("No storage repository defined for extra VDI {index}.");
                warn!("Using default SR from Pool: {}", sr.name);
            }

            let name = format!("{}-extra-vdi-{index}", req.name);
            info!(
                "Creating extra VDI ({} MB, {name}, {})",
                extra.size_bytes / MIB,
                sr.name
            );
            let vdi = self
                .plane
                .create_vdi(&name, &sr.name, extra.size_bytes)
                .await
                .with_context(|| format!("failed to create VDI {name}"))?;
            device = self.attach_with_retry(vm, &vdi, device).await?;
        }
        Ok(())
    }

    /// Attaches `vdi` at `device`, retrying once on the next slot. After the
    /// second failure the VDI is destroyed (best effort) and the error
    /// returned. Returns the slot that was used.
    async fn attach_with_retry(&self, vm: &VmRef, vdi: &VdiRef, device: u32) -> Result<u32> {
        match self.plane.attach_vdi(vm, vdi, device, false).await {
            Ok(()) => return Ok(device),
            Err(e) => warn!("Could not attach {} at device {device}, retrying: {e}", vdi.name),
        }
        let device = device + 1;
        match self.plane.attach_vdi(vm, vdi, device, false).await {
            Ok(()) => Ok(device),
            Err(e) => {
                error!("Could not attach the VBD to the server");
                if let Err(destroy_err) = self.plane.destroy_vdi(vdi).await {
                    warn!("Could not destroy VDI {}: {destroy_err}", vdi.name);
                }
                Err(e.context(format!("failed to attach VDI {}", vdi.name)))
            }
        }
    }
}

pub fn bootstrap_request(req: &ValidatedRequest, address: &str) -> BootstrapRequest {
    let opts = &req.options;
    BootstrapRequest {
        address: address.to_string(),
        run_list: opts.run_list.clone(),
        first_boot_attributes: req.first_boot_attributes.clone(),
        ssh_user: opts.ssh_user.clone(),
        ssh_password: opts.ssh_password.clone(),
        identity_file: opts.identity_file.clone(),
        host_key_verify: opts.host_key_verify,
        node_name: opts
            .node_name
            .clone()
            .unwrap_or_else(|| req.name.clone()),
        environment: opts.environment.clone(),
        distro: opts.distro.clone(),
        template_file: opts.template_file.clone(),
        bootstrap_version: opts.bootstrap_version.clone(),
        use_sudo: opts.ssh_user != DEFAULT_SSH_USER,
    }
}
