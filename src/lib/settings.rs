use anyhow::{Context, Result};
use config::Config;
use serde::Deserialize;
use std::time::Duration;

pub const ENV_PREFIX: &str = "XENSERVER_VM_CREATE";
pub const DEFAULT_CONFIG_FILE: &str = "./config.toml";

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum HostSelection {
    /// First admissible host in reported order.
    #[default]
    FirstFit,
    /// Admissible host with the most free memory, ties broken by name.
    MostFreeMemory,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct PlannerSettings {
    pub vm_ram_overhead_pct: f64,
    pub host_max_ram_utilization_pct: f64,
    pub max_storage_allocated_pct: f64,
    pub template_allocation_pct: f64,
    pub additional_allocation_pct: f64,
    pub host_selection: HostSelection,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        PlannerSettings {
            vm_ram_overhead_pct: 25.0,
            host_max_ram_utilization_pct: 95.0,
            max_storage_allocated_pct: 80.0,
            template_allocation_pct: 100.0,
            additional_allocation_pct: 100.0,
            host_selection: HostSelection::FirstFit,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ReadinessSettings {
    pub ssh_port: u16,
    pub connect_timeout_secs: u64,
    pub refused_backoff_secs: u64,
    pub discovery_attempts: u32,
    pub discovery_interval_secs: u64,
    pub settle_delay_secs: u64,
    /// Overall cap on waiting for sshd. Unset waits forever.
    pub ssh_wait_timeout_secs: Option<u64>,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        ReadinessSettings {
            ssh_port: 22,
            connect_timeout_secs: 5,
            refused_backoff_secs: 2,
            discovery_attempts: 180,
            discovery_interval_secs: 1,
            settle_delay_secs: 10,
            ssh_wait_timeout_secs: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct GuestNetworkSettings {
    pub default_gateway_last_octet: u8,
    pub default_netmask: Option<String>,
    pub default_dns: Option<String>,
    pub default_domain: Option<String>,
}

impl Default for GuestNetworkSettings {
    fn default() -> Self {
        GuestNetworkSettings {
            default_gateway_last_octet: 1,
            default_netmask: None,
            default_dns: None,
            default_domain: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Settings {
    pub log_level: String,
    pub planner: PlannerSettings,
    pub readiness: ReadinessSettings,
    pub guest_network: GuestNetworkSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            log_level: String::from("info"),
            planner: PlannerSettings::default(),
            readiness: ReadinessSettings::default(),
            guest_network: GuestNetworkSettings::default(),
        }
    }
}

impl ReadinessSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn refused_backoff(&self) -> Duration {
        Duration::from_secs(self.refused_backoff_secs)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }

    pub fn ssh_wait_timeout(&self) -> Option<Duration> {
        self.ssh_wait_timeout_secs.map(Duration::from_secs)
    }
}

/// Reads `CONFIG_FILE_PATH` (or `./config.toml`) layered under
/// `XENSERVER_VM_CREATE_*` environment variables. Missing file is fine.
pub fn load_settings() -> Result<Settings> {
    let cfg_file = match std::env::var("CONFIG_FILE_PATH") {
        Ok(s) => s,
        Err(_e) => DEFAULT_CONFIG_FILE.to_string(),
    };
    let settings = Config::builder()
        .add_source(config::File::with_name(&cfg_file).required(false))
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("failed to load settings from {cfg_file}"))?;
    settings
        .try_deserialize()
        .context("invalid settings")
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.planner.vm_ram_overhead_pct, 25.0);
        assert_eq!(s.planner.host_max_ram_utilization_pct, 95.0);
        assert_eq!(s.planner.max_storage_allocated_pct, 80.0);
        assert_eq!(s.readiness.ssh_port, 22);
        assert_eq!(s.readiness.discovery_attempts, 180);
        assert!(s.readiness.ssh_wait_timeout().is_none());
    }

    #[test]
    fn partial_toml_keeps_remaining_defaults() {
        let toml = r#"
            log_level = "debug"
            [planner]
            max_storage_allocated_pct = 70.0
            host_selection = "most_free_memory"
            [readiness]
            ssh_wait_timeout_secs = 600
        "#;
        let s: Settings = Config::builder()
            .add_source(config::File::from_str(toml, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(s.log_level, "debug");
        assert_eq!(s.planner.max_storage_allocated_pct, 70.0);
        assert_eq!(s.planner.vm_ram_overhead_pct, 25.0);
        assert_eq!(s.planner.host_selection, HostSelection::MostFreeMemory);
        assert_eq!(s.readiness.ssh_wait_timeout(), Some(Duration::from_secs(600)));
        assert_eq!(s.guest_network.default_gateway_last_octet, 1);
    }

    #[test]
    fn environment_overrides_nested_keys() {
        let vars = [
            ("CONFIG_FILE_PATH", "./does-not-exist.toml"),
            ("XENSERVER_VM_CREATE_LOG_LEVEL", "trace"),
            ("XENSERVER_VM_CREATE_PLANNER__VM_RAM_OVERHEAD_PCT", "30"),
            ("XENSERVER_VM_CREATE_PLANNER__HOST_SELECTION", "most_free_memory"),
            ("XENSERVER_VM_CREATE_READINESS__SSH_WAIT_TIMEOUT_SECS", "90"),
        ];
        for (k, v) in vars {
            std::env::set_var(k, v);
        }
        let loaded = load_settings();
        for (k, _) in vars {
            std::env::remove_var(k);
        }

        let s = loaded.unwrap();
        assert_eq!(s.log_level, "trace");
        assert_eq!(s.planner.vm_ram_overhead_pct, 30.0);
        assert_eq!(s.planner.host_selection, HostSelection::MostFreeMemory);
        assert_eq!(s.planner.max_storage_allocated_pct, 80.0);
        assert_eq!(s.readiness.ssh_wait_timeout(), Some(Duration::from_secs(90)));
        assert_eq!(s.readiness.ssh_port, 22);
    }
}
