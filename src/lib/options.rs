//! Parsing of the user-supplied option strings: extra VDI specs, NIC lists,
//! tags and guest network metadata.

use anyhow::{bail, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;

use crate::settings::GuestNetworkSettings;
use crate::structs::{StorageRequest, VmCreateOptions, MIB};

lazy_static! {
    pub static ref VDI_SPEC_REGEX: Regex =
        Regex::new(r#"^(?:(?:"(?P<quoted>[^"]+)"|(?P<sr>[^:"]+)):)?(?P<size>[^:]*)$"#).unwrap();
    static ref LAST_OCTET_REGEX: Regex = Regex::new(r"\.\d+$").unwrap();
    static ref RUN_LIST_SEPARATOR: Regex = Regex::new(r"[\s,]+").unwrap();
}

fn split_list(input: &str) -> impl Iterator<Item = &str> {
    input.split(',').map(str::trim)
}

/// Parses one `size` or `repo:size` item, size in MiB.
pub fn parse_vdi_spec(item: &str) -> Result<StorageRequest> {
    let item = item.trim();
    let caps = match VDI_SPEC_REGEX.captures(item) {
        Some(c) => c,
        None => bail!("Invalid VDI specification '{item}'. Expected size or \"SR name\":size"),
    };
    let repository = caps
        .name("quoted")
        .or_else(|| caps.name("sr"))
        .map(|m| m.as_str().trim());
    if repository == Some("") {
        bail!("Invalid VDI specification '{item}'. Empty storage repository name");
    }
    let size = &caps["size"];
    if size.is_empty() || !size.bytes().all(|b| b.is_ascii_digit()) {
        bail!("Invalid VDI size '{size}'. Not numeric.");
    }
    let size_mb: u64 = match size.parse() {
        Ok(n) => n,
        Err(e) => bail!("Invalid VDI size '{size}': {e}"),
    };
    let size_bytes = match size_mb.checked_mul(MIB) {
        Some(b) => b,
        None => bail!("Invalid VDI size '{size}'. Too large."),
    };
    Ok(StorageRequest::new(repository, size_bytes))
}

/// Parses a comma separated `--extra-vdis` value.
pub fn parse_extra_vdis(input: &str) -> Result<Vec<StorageRequest>> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(vec![]);
    }
    split_list(input).map(parse_vdi_spec).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NicRequest {
    pub network: String,
    pub mac: Option<String>,
}

/// Pairs networks with MAC addresses by position. A missing or empty MAC
/// means the hypervisor picks one.
pub fn parse_nics(networks: &str, macs: Option<&str>) -> Vec<NicRequest> {
    let macs: Vec<&str> = macs.map(|m| split_list(m).collect()).unwrap_or_default();
    split_list(networks)
        .filter(|n| !n.is_empty())
        .enumerate()
        .map(|(i, network)| NicRequest {
            network: network.to_string(),
            mac: macs
                .get(i)
                .filter(|m| !m.is_empty())
                .map(|m| m.to_string()),
        })
        .collect()
}

pub fn parse_tags(input: &str) -> Vec<String> {
    split_list(input)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}

/// Splits `"role[base], recipe[nginx]"` on commas and whitespace.
pub fn parse_run_list(input: &str) -> Vec<String> {
    RUN_LIST_SEPARATOR
        .split(input)
        .filter(|item| !item.is_empty())
        .map(String::from)
        .collect()
}

/// Accepts a run list either as one string or as an array of items.
pub fn deserialize_run_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RunList {
        Text(String),
        Items(Vec<String>),
    }
    Ok(match RunList::deserialize(deserializer)? {
        RunList::Text(text) => parse_run_list(&text),
        RunList::Items(items) => items.iter().flat_map(|i| parse_run_list(i)).collect(),
    })
}

/// `10.0.5.23` with octet 1 becomes `10.0.5.1`.
pub fn derive_gateway(ip: &str, last_octet: u8) -> String {
    LAST_OCTET_REGEX
        .replace(ip, format!(".{last_octet}").as_str())
        .into_owned()
}

/// Fills gateway, netmask, DNS and domain defaults into the options.
pub fn apply_guest_network_defaults(opts: &mut VmCreateOptions, defaults: &GuestNetworkSettings) {
    if opts.vm_gateway.is_none() {
        if let Some(ip) = &opts.vm_ip {
            opts.vm_gateway = Some(derive_gateway(ip, defaults.default_gateway_last_octet));
        }
    }
    if opts.vm_netmask.is_none() {
        opts.vm_netmask = defaults.default_netmask.clone();
    }
    if opts.vm_dns.is_none() {
        opts.vm_dns = defaults.default_dns.clone();
    }
    if opts.vm_domain.is_none() {
        opts.vm_domain = defaults.default_domain.clone();
    }
}

/// xenstore entries read by the guest's first-boot network script.
pub fn xenstore_data(opts: &VmCreateOptions) -> BTreeMap<String, String> {
    let mut attrs = BTreeMap::new();
    let entries = [
        ("vm-data/ip", &opts.vm_ip),
        ("vm-data/gw", &opts.vm_gateway),
        ("vm-data/nm", &opts.vm_netmask),
        ("vm-data/ns", &opts.vm_dns),
        ("vm-data/dm", &opts.vm_domain),
    ];
    for (key, value) in entries {
        if let Some(v) = value {
            attrs.insert(key.to_string(), v.clone());
        }
    }
    attrs
}
