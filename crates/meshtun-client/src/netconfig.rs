//! Host network configuration for the virtual interface
//!
//! The command lists are built by pure functions per platform and executed
//! one by one with `tokio::process::Command`.

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum NetConfigError {
    #[error("Failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}: {output}")]
    CommandFailed {
        command: String,
        status: String,
        output: String,
    },

    #[error("Interface index unknown, cannot add route {0}")]
    MissingInterfaceIndex(String),

    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(&'static str),
}

#[async_trait]
pub trait NetworkConfigurator: Send + Sync {
    /// Bring the interface up with `ip` inside `gateway/24`
    async fn configure_interface(
        &self,
        name: &str,
        ip: &str,
        gateway: &str,
    ) -> Result<(), NetConfigError>;

    async fn release_interface(
        &self,
        name: &str,
        ip: &str,
        gateway: &str,
    ) -> Result<(), NetConfigError>;

    /// Route `route` (a CIDR from the route manifest) through the interface
    async fn add_route(
        &self,
        route: &str,
        name: &str,
        ip: &str,
        gateway: &str,
    ) -> Result<(), NetConfigError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    MacOs,
    Windows,
    Other(&'static str),
}

impl Platform {
    pub fn current() -> Self {
        match std::env::consts::OS {
            "linux" => Platform::Linux,
            "macos" => Platform::MacOs,
            "windows" => Platform::Windows,
            other => Platform::Other(other),
        }
    }
}

/// One external command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ShellCommand {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    pub async fn run(&self) -> Result<(), NetConfigError> {
        debug!("Running `{}`", self);
        let output = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .output()
            .await
            .map_err(|source| NetConfigError::Spawn {
                command: self.to_string(),
                source,
            })?;

        if output.status.success() {
            Ok(())
        } else {
            let mut text = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if text.is_empty() {
                text = String::from_utf8_lossy(&output.stdout).trim().to_string();
            }
            Err(NetConfigError::CommandFailed {
                command: self.to_string(),
                status: output.status.to_string(),
                output: text,
            })
        }
    }
}

impl fmt::Display for ShellCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

pub fn configure_commands(
    platform: Platform,
    name: &str,
    ip: &str,
    gateway: &str,
) -> Result<Vec<ShellCommand>, NetConfigError> {
    let commands = match platform {
        Platform::Linux => vec![
            ShellCommand::new("ifconfig", &[name, "up"]),
            ShellCommand::new("ip", &["addr", "add", &format!("{}/24", ip), "dev", name]),
        ],
        Platform::MacOs => vec![
            ShellCommand::new("ifconfig", &[name, "up"]),
            ShellCommand::new("ifconfig", &[name, ip, ip]),
            ShellCommand::new("route", &["add", "-net", &format!("{}/24", gateway), ip]),
        ],
        Platform::Windows => vec![
            ShellCommand::new(
                "netsh",
                &[
                    "interface",
                    "ip",
                    "set",
                    "address",
                    // Command quotes the argument itself if the name has spaces
                    &format!("name={}", name),
                    &format!("addr={}", ip),
                    "source=static",
                    "mask=255.255.255.0",
                    &format!("gateway={}", gateway),
                ],
            ),
            // netsh installs a default route through the gateway; drop it
            ShellCommand::new("route", &["delete", "0.0.0.0", gateway]),
        ],
        Platform::Other(os) => return Err(NetConfigError::UnsupportedPlatform(os)),
    };
    Ok(commands)
}

pub fn release_commands(platform: Platform, name: &str, ip: &str, gateway: &str) -> Vec<ShellCommand> {
    match platform {
        Platform::Linux => vec![
            ShellCommand::new("ip", &["addr", "del", &format!("{}/24", ip), "dev", name]),
            ShellCommand::new("ifconfig", &[name, "down"]),
        ],
        Platform::MacOs => {
            let mut commands = Vec::new();
            let octets: Vec<&str> = gateway.split('.').collect();
            if octets.len() == 4 {
                let network = format!("{}/24", octets[..3].join("."));
                commands.push(ShellCommand::new("route", &["delete", "-net", &network, ip]));
            }
            commands.push(ShellCommand::new("ifconfig", &[name, "delete", ip]));
            commands.push(ShellCommand::new("ifconfig", &[name, "down"]));
            commands
        }
        Platform::Windows | Platform::Other(_) => Vec::new(),
    }
}

pub fn route_command(
    platform: Platform,
    route: &str,
    name: &str,
    ip: &str,
    gateway: &str,
    interface_index: Option<u32>,
) -> Result<ShellCommand, NetConfigError> {
    match platform {
        Platform::Linux => Ok(ShellCommand::new("ip", &["ro", "add", route, "dev", name])),
        Platform::MacOs => Ok(ShellCommand::new("route", &["add", "-net", route, ip])),
        Platform::Windows => {
            let index = interface_index
                .ok_or_else(|| NetConfigError::MissingInterfaceIndex(route.to_string()))?;
            Ok(ShellCommand::new(
                "route",
                &["add", route, gateway, "if", &index.to_string()],
            ))
        }
        Platform::Other(os) => Err(NetConfigError::UnsupportedPlatform(os)),
    }
}

/// Configures the host by running the platform's network tools
#[derive(Debug, Clone)]
pub struct SystemConfigurator {
    platform: Platform,
    interface_index: Option<u32>,
}

impl SystemConfigurator {
    pub fn new() -> Self {
        Self {
            platform: Platform::current(),
            interface_index: None,
        }
    }

    /// Windows route commands need the interface index
    pub fn with_interface_index(mut self, index: u32) -> Self {
        self.interface_index = Some(index);
        self
    }
}

impl Default for SystemConfigurator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetworkConfigurator for SystemConfigurator {
    async fn configure_interface(
        &self,
        name: &str,
        ip: &str,
        gateway: &str,
    ) -> Result<(), NetConfigError> {
        for command in configure_commands(self.platform, name, ip, gateway)? {
            command.run().await?;
        }
        Ok(())
    }

    async fn release_interface(
        &self,
        name: &str,
        ip: &str,
        gateway: &str,
    ) -> Result<(), NetConfigError> {
        // Run every step even if an earlier one fails
        let mut first_error = None;
        for command in release_commands(self.platform, name, ip, gateway) {
            if let Err(e) = command.run().await {
                warn!("{}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn add_route(
        &self,
        route: &str,
        name: &str,
        ip: &str,
        gateway: &str,
    ) -> Result<(), NetConfigError> {
        route_command(self.platform, route, name, ip, gateway, self.interface_index)?
            .run()
            .await
    }
}
