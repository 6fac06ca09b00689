//! Waits for a freshly started guest to get an address and accept SSH.

use anyhow::{anyhow, bail, Result};
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};

use crate::control_plane::{ControlPlane, VmRef};
use crate::settings::ReadinessSettings;
use crate::structs::PollOutcome;

/// One TCP probe against sshd.
#[derive(Debug, Clone)]
pub struct SshProbe {
    pub port: u16,
    pub connect_timeout: Duration,
    pub refused_backoff: Duration,
}

impl SshProbe {
    pub fn new(port: u16, connect_timeout: Duration, refused_backoff: Duration) -> Self {
        SshProbe {
            port,
            connect_timeout,
            refused_backoff,
        }
    }

    /// Connects to `address`, waits for the socket to become readable and
    /// reads the banner. `on_ready` runs once on success. Refused and
    /// unreachable errors back off before returning `false`; timeouts and
    /// permission errors return `false` straight away. The socket is dropped
    /// before returning on every path.
    pub async fn test_connection<F>(&self, address: &str, on_ready: F) -> Result<bool>
    where
        F: FnOnce(&str),
    {
        let stream = match timeout(
            self.connect_timeout,
            TcpStream::connect((address, self.port)),
        )
        .await
        {
            Err(_) => {
                debug!("connect to {address}:{} timed out", self.port);
                return Ok(false);
            }
            Ok(Err(e)) => return self.not_ready(address, e).await,
            Ok(Ok(s)) => s,
        };

        match timeout(self.connect_timeout, stream.readable()).await {
            Err(_) => {
                debug!("{address}:{} accepted but sent nothing", self.port);
                return Ok(false);
            }
            Ok(Err(e)) => return self.not_ready(address, e).await,
            Ok(Ok(())) => {}
        }

        let mut reader = BufReader::new(stream);
        let mut banner = String::new();
        if let Ok(Err(e)) = timeout(self.connect_timeout, reader.read_line(&mut banner)).await {
            debug!("couldn't read banner from {address}: {e}");
        }
        debug!(
            "sshd accepting connections on {address}, banner is {}",
            banner.trim_end()
        );
        on_ready(address);
        Ok(true)
    }

    async fn not_ready(&self, address: &str, e: std::io::Error) -> Result<bool> {
        match e.kind() {
            ErrorKind::TimedOut | ErrorKind::PermissionDenied => {
                debug!("{address}:{} not ready: {e}", self.port);
                Ok(false)
            }
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::HostUnreachable
            | ErrorKind::NetworkUnreachable => {
                debug!("{address}:{} not ready: {e}", self.port);
                sleep(self.refused_backoff).await;
                Ok(false)
            }
            _ => Err(anyhow!(e).context(format!("ssh probe to {address}:{} failed", self.port))),
        }
    }
}

/// Polls addresses until sshd answers, within the budgets configured in
/// [`ReadinessSettings`].
#[derive(Debug, Clone)]
pub struct ReadinessPoller {
    pub probe: SshProbe,
    pub discovery_attempts: u32,
    pub discovery_interval: Duration,
    pub settle_delay: Duration,
    pub overall_timeout: Option<Duration>,
}

impl ReadinessPoller {
    pub fn from_settings(settings: &ReadinessSettings) -> Self {
        ReadinessPoller {
            probe: SshProbe::new(
                settings.ssh_port,
                settings.connect_timeout(),
                settings.refused_backoff(),
            ),
            discovery_attempts: settings.discovery_attempts,
            discovery_interval: settings.discovery_interval(),
            settle_delay: settings.settle_delay(),
            overall_timeout: settings.ssh_wait_timeout(),
        }
    }

    /// Probes `addresses` round-robin until one answers. The first address
    /// to answer wins and the rest are left alone. Without an overall
    /// timeout this never gives up.
    pub async fn poll_addresses<F>(&self, addresses: &[String], on_ready: F) -> Result<PollOutcome>
    where
        F: FnOnce(&str),
    {
        if addresses.is_empty() {
            return Ok(PollOutcome::Failure { exhausted: false });
        }
        if self.overall_timeout.is_none() {
            warn!("no ssh wait timeout configured, waiting until sshd answers");
        }
        let started = Instant::now();
        let mut on_ready = Some(on_ready);
        let mut next = 0;
        loop {
            let address = &addresses[next % addresses.len()];
            next += 1;
            debug!("Trying to SSH to {address}...");
            let ready = self
                .probe
                .test_connection(address, |a| {
                    if let Some(f) = on_ready.take() {
                        f(a)
                    }
                })
                .await?;
            if ready {
                return Ok(PollOutcome::Success {
                    address: address.clone(),
                });
            }
            if let Some(limit) = self.overall_timeout {
                if started.elapsed() >= limit {
                    warn!("sshd did not answer within {}s", limit.as_secs());
                    return Ok(PollOutcome::Failure { exhausted: true });
                }
            }
        }
    }

    /// Fixed-IP mode: the operator already told us where the guest lives.
    pub async fn poll_fixed<F>(&self, address: &str, on_ready: F) -> Result<PollOutcome>
    where
        F: FnOnce(&str),
    {
        self.poll_addresses(&[address.to_string()], on_ready).await
    }

    /// Refreshes guest metrics until the guest reports at least one address.
    /// Running out of attempts is fatal.
    pub async fn discover_addresses<P: ControlPlane>(
        &self,
        plane: &P,
        vm: &VmRef,
    ) -> Result<Vec<String>> {
        for attempt in 1..=self.discovery_attempts {
            match plane.guest_networks(vm).await {
                Ok(Some(networks)) if !networks.is_empty() => {
                    info!("Server IPs: {}", networks.join(","));
                    return Ok(networks);
                }
                Ok(_) => debug!(
                    "Waiting a valid IP ({attempt}/{})...",
                    self.discovery_attempts
                ),
                Err(e) => debug!("guest metrics for {} not available yet: {e}", vm.name),
            }
            sleep(self.discovery_interval).await;
        }
        bail!("Timeout trying to reach the VM. Couldn't find the IP address.")
    }

    /// Waits for sshd on `fixed_ip`, or on whatever address the guest
    /// reports when none is given. Returns the address that answered.
    pub async fn wait_for_ssh<P: ControlPlane>(
        &self,
        plane: &P,
        vm: &VmRef,
        fixed_ip: Option<&str>,
    ) -> Result<String> {
        let outcome = match fixed_ip {
            Some(ip) => self.poll_fixed(ip, |a| info!("sshd on {a} is up")).await?,
            None => {
                let addresses = self.discover_addresses(plane, vm).await?;
                self.poll_addresses(&addresses, |a| info!("sshd on {a} is up"))
                    .await?
            }
        };
        match outcome {
            PollOutcome::Success { address } => {
                if !self.settle_delay.is_zero() {
                    sleep(self.settle_delay).await;
                }
                Ok(address)
            }
            PollOutcome::Failure { .. } => {
                bail!("Timeout waiting for sshd on {}", vm.name)
            }
        }
    }
}
