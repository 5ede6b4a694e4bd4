//! Remote host access
//!
//! Scenario checks talk to provisioned machines through the [`Host`] trait.
//! Everything is a shell command underneath: `sh` on Linux, PowerShell on
//! Windows. Package, service, and path queries are built on top of `run`.

use std::path::PathBuf;
use std::process::Command;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

/// Errors from host command execution
#[derive(Error, Debug)]
pub enum HostError {
    #[error("Failed to spawn command for {host}: {source}")]
    Spawn {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command `{command}` on {host} exited with {exit_code}: {stderr}")]
    CommandFailed {
        host: String,
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Failed to parse output of `{command}`: {reason}")]
    Parse { command: String, reason: String },
}

/// Operating system family of a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    Windows,
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Linux => write!(f, "linux"),
            Self::Windows => write!(f, "windows"),
        }
    }
}

/// Captured result of one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn new(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    fn from_process(output: std::process::Output) -> Self {
        Self {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// Installed package information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageInfo {
    pub name: String,
    /// `None` when the package is not installed
    pub version: Option<String>,
}

impl PackageInfo {
    pub fn is_installed(&self) -> bool {
        self.version.is_some()
    }
}

/// Service manager state for one service
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceStatus {
    pub name: String,
    pub exists: bool,
    pub running: bool,
    /// Start-on-boot state, when the service manager reports one
    pub enabled: Option<bool>,
    /// Services this one depends on
    pub dependencies: Vec<String>,
    /// Services that depend on this one
    pub dependents: Vec<String>,
}

/// What lives at a filesystem path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    File,
    Directory,
    Missing,
}

/// A machine that scenario checks can run commands on
pub trait Host {
    /// Inventory name of the host
    fn name(&self) -> &str;

    fn platform(&self) -> Platform;

    /// Run a shell command and capture its output
    fn run(&self, command: &str) -> Result<CommandOutput, HostError>;

    /// Run a command and return stdout, failing on a non-zero exit
    fn check_output(&self, command: &str) -> Result<String, HostError> {
        let output = self.run(command)?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(HostError::CommandFailed {
                host: self.name().to_string(),
                command: command.to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }

    /// Full contents of a text file
    fn read_file(&self, path: &str) -> Result<String, HostError> {
        let command = match self.platform() {
            Platform::Linux => format!("cat {}", shell_quote(path)),
            Platform::Windows => format!("Get-Content -Raw -LiteralPath {}", ps_quote(path)),
        };
        self.check_output(&command)
    }

    fn package(&self, name: &str) -> Result<PackageInfo, HostError> {
        match self.platform() {
            Platform::Linux => linux_package(self, name),
            Platform::Windows => windows_package(self, name),
        }
    }

    fn service(&self, name: &str) -> Result<ServiceStatus, HostError> {
        match self.platform() {
            Platform::Linux => linux_service(self, name),
            Platform::Windows => windows_service(self, name),
        }
    }

    fn path_kind(&self, path: &str) -> Result<PathKind, HostError> {
        let command = match self.platform() {
            Platform::Linux => {
                let quoted = shell_quote(path);
                format!(
                    "if [ -d {q} ]; then echo directory; elif [ -f {q} ]; then echo file; else echo missing; fi",
                    q = quoted
                )
            }
            Platform::Windows => {
                let quoted = ps_quote(path);
                format!(
                    "if (Test-Path -LiteralPath {q} -PathType Container) {{ 'directory' }} \
                     elseif (Test-Path -LiteralPath {q} -PathType Leaf) {{ 'file' }} \
                     else {{ 'missing' }}",
                    q = quoted
                )
            }
        };

        let stdout = self.check_output(&command)?;
        match stdout.trim() {
            "directory" => Ok(PathKind::Directory),
            "file" => Ok(PathKind::File),
            "missing" => Ok(PathKind::Missing),
            other => Err(HostError::Parse {
                command,
                reason: format!("unexpected path kind '{}'", other),
            }),
        }
    }
}

/// Quote for POSIX `sh`
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Quote for PowerShell single-quoted strings
pub fn ps_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn linux_package<H: Host + ?Sized>(host: &H, name: &str) -> Result<PackageInfo, HostError> {
    let quoted = shell_quote(name);

    let dpkg = host.run(&format!("dpkg-query -W -f='${{Status}}|${{Version}}' {}", quoted))?;
    if dpkg.success() {
        if let Some((status, version)) = dpkg.stdout.trim().split_once('|') {
            if status.ends_with("install ok installed") {
                return Ok(PackageInfo {
                    name: name.to_string(),
                    version: Some(version.to_string()),
                });
            }
        }
    }

    let rpm = host.run(&format!("rpm -q --queryformat '%{{VERSION}}' {}", quoted))?;
    let version = if rpm.success() {
        Some(rpm.stdout.trim().to_string()).filter(|v| !v.is_empty())
    } else {
        None
    };

    trace!(host = host.name(), package = name, ?version, "Queried package");
    Ok(PackageInfo {
        name: name.to_string(),
        version,
    })
}

fn windows_package<H: Host + ?Sized>(host: &H, name: &str) -> Result<PackageInfo, HostError> {
    let command = format!(
        "Get-WmiObject -Class Win32_Product | Where-Object {{ $_.Name -eq {} }} | \
         Select-Object -First 1 -ExpandProperty Version",
        ps_quote(name)
    );
    let stdout = host.check_output(&command)?;
    let version = Some(stdout.trim().to_string()).filter(|v| !v.is_empty());

    Ok(PackageInfo {
        name: name.to_string(),
        version,
    })
}

fn linux_service<H: Host + ?Sized>(host: &H, name: &str) -> Result<ServiceStatus, HostError> {
    let command = format!(
        "systemctl show {} --property=LoadState,ActiveState,UnitFileState",
        shell_quote(name)
    );
    let stdout = host.check_output(&command)?;

    let mut status = ServiceStatus {
        name: name.to_string(),
        ..Default::default()
    };

    for line in stdout.lines() {
        match line.trim().split_once('=') {
            Some(("LoadState", value)) => status.exists = value != "not-found",
            Some(("ActiveState", value)) => status.running = value == "active",
            Some(("UnitFileState", value)) if !value.is_empty() => {
                status.enabled = Some(value == "enabled")
            }
            _ => {}
        }
    }

    Ok(status)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WindowsServiceRow {
    name: String,
    status: String,
    #[serde(default)]
    start_type: Option<String>,
    #[serde(default, deserialize_with = "string_or_list")]
    depends_on: Vec<String>,
    #[serde(default, deserialize_with = "string_or_list")]
    dependents: Vec<String>,
}

/// PowerShell collapses single-element arrays to scalars and empty ones to null
fn string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(s)) => vec![s],
        Some(OneOrMany::Many(v)) => v,
    })
}

fn windows_service<H: Host + ?Sized>(host: &H, name: &str) -> Result<ServiceStatus, HostError> {
    let command = format!(
        "Get-Service -Name {} -ErrorAction SilentlyContinue | Select-Object Name, \
         @{{n='Status';e={{$_.Status.ToString()}}}}, \
         @{{n='StartType';e={{$_.StartType.ToString()}}}}, \
         @{{n='DependsOn';e={{@($_.ServicesDependedOn | ForEach-Object {{ $_.Name }})}}}}, \
         @{{n='Dependents';e={{@($_.DependentServices | ForEach-Object {{ $_.Name }})}}}} | \
         ConvertTo-Json -Compress",
        ps_quote(name)
    );
    let stdout = host.check_output(&command)?;

    if stdout.trim().is_empty() {
        return Ok(ServiceStatus {
            name: name.to_string(),
            ..Default::default()
        });
    }

    let row: WindowsServiceRow =
        serde_json::from_str(stdout.trim()).map_err(|e| HostError::Parse {
            command: command.clone(),
            reason: e.to_string(),
        })?;

    Ok(ServiceStatus {
        name: row.name,
        exists: true,
        running: row.status.eq_ignore_ascii_case("running"),
        enabled: row
            .start_type
            .map(|t| !t.eq_ignore_ascii_case("disabled") && !t.eq_ignore_ascii_case("manual")),
        dependencies: row.depends_on,
        dependents: row.dependents,
    })
}

fn shell_program(platform: Platform) -> (&'static str, &'static [&'static str]) {
    match platform {
        Platform::Linux => ("sh", &["-c"]),
        Platform::Windows => ("powershell", &["-NoProfile", "-NonInteractive", "-Command"]),
    }
}

/// The machine this process runs on
#[derive(Debug, Clone)]
pub struct LocalHost {
    name: String,
    platform: Platform,
}

impl LocalHost {
    pub fn new(name: impl Into<String>, platform: Platform) -> Self {
        Self {
            name: name.into(),
            platform,
        }
    }

    /// Local machine, named after its hostname
    pub fn detect() -> Self {
        let name = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());
        let platform = if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Linux
        };
        Self::new(name, platform)
    }
}

impl Host for LocalHost {
    fn name(&self) -> &str {
        &self.name
    }

    fn platform(&self) -> Platform {
        self.platform
    }

    fn run(&self, command: &str) -> Result<CommandOutput, HostError> {
        let (program, args) = shell_program(self.platform);
        debug!(host = %self.name, %command, "Running local command");

        let output = Command::new(program)
            .args(args)
            .arg(command)
            .output()
            .map_err(|source| HostError::Spawn {
                host: self.name.clone(),
                source,
            })?;

        Ok(CommandOutput::from_process(output))
    }
}

/// A machine reached through the `ssh` client
#[derive(Debug, Clone)]
pub struct SshHost {
    name: String,
    address: String,
    platform: Platform,
    user: Option<String>,
    port: Option<u16>,
    identity_file: Option<PathBuf>,
}

impl SshHost {
    pub fn new(name: impl Into<String>, address: impl Into<String>, platform: Platform) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            platform,
            user: None,
            port: None,
            identity_file: None,
        }
    }

    pub fn with_user(mut self, user: Option<String>) -> Self {
        self.user = user;
        self
    }

    pub fn with_port(mut self, port: Option<u16>) -> Self {
        self.port = port;
        self
    }

    pub fn with_identity_file(mut self, identity_file: Option<PathBuf>) -> Self {
        self.identity_file = identity_file;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Arguments passed to the `ssh` client for one remote command
    pub fn ssh_args(&self, command: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "ConnectTimeout=10".to_string(),
        ];

        if let Some(port) = self.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }

        if let Some(identity) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity.to_string_lossy().into_owned());
        }

        args.push(match &self.user {
            Some(user) => format!("{}@{}", user, self.address),
            None => self.address.clone(),
        });

        args.push(match self.platform {
            Platform::Linux => command.to_string(),
            Platform::Windows => format!(
                "powershell -NoProfile -NonInteractive -Command \"{}\"",
                command.replace('"', "\\\"")
            ),
        });

        args
    }
}

impl Host for SshHost {
    fn name(&self) -> &str {
        &self.name
    }

    fn platform(&self) -> Platform {
        self.platform
    }

    fn run(&self, command: &str) -> Result<CommandOutput, HostError> {
        debug!(host = %self.name, address = %self.address, %command, "Running remote command");

        let output = Command::new("ssh")
            .args(self.ssh_args(command))
            .output()
            .map_err(|source| HostError::Spawn {
                host: self.name.clone(),
                source,
            })?;

        Ok(CommandOutput::from_process(output))
    }
}

/// Scripted host for unit tests
#[cfg(test)]
pub(crate) mod fake {
    use std::cell::RefCell;
    use std::collections::VecDeque;

    use super::*;

    /// Answers commands by substring match; the first matching rule wins
    ///
    /// A rule with several outputs replays them in order and then repeats
    /// the last one.
    pub struct FakeHost {
        name: String,
        platform: Platform,
        rules: RefCell<Vec<(String, VecDeque<CommandOutput>)>>,
        commands: RefCell<Vec<String>>,
    }

    impl FakeHost {
        pub fn new(name: &str, platform: Platform) -> Self {
            Self {
                name: name.to_string(),
                platform,
                rules: RefCell::new(Vec::new()),
                commands: RefCell::new(Vec::new()),
            }
        }

        pub fn linux(name: &str) -> Self {
            Self::new(name, Platform::Linux)
        }

        pub fn windows(name: &str) -> Self {
            Self::new(name, Platform::Windows)
        }

        pub fn respond(self, needle: &str, output: CommandOutput) -> Self {
            self.respond_seq(needle, vec![output])
        }

        pub fn respond_ok(self, needle: &str, stdout: &str) -> Self {
            self.respond(needle, CommandOutput::new(0, stdout, ""))
        }

        pub fn respond_seq(self, needle: &str, outputs: Vec<CommandOutput>) -> Self {
            self.rules
                .borrow_mut()
                .push((needle.to_string(), outputs.into_iter().collect()));
            self
        }

        pub fn commands(&self) -> Vec<String> {
            self.commands.borrow().clone()
        }
    }

    impl Host for FakeHost {
        fn name(&self) -> &str {
            &self.name
        }

        fn platform(&self) -> Platform {
            self.platform
        }

        fn run(&self, command: &str) -> Result<CommandOutput, HostError> {
            self.commands.borrow_mut().push(command.to_string());

            let mut rules = self.rules.borrow_mut();
            let rule = rules
                .iter_mut()
                .find(|(needle, outputs)| command.contains(needle.as_str()) && !outputs.is_empty());

            Ok(match rule {
                Some((_, outputs)) if outputs.len() > 1 => outputs.pop_front().unwrap(),
                Some((_, outputs)) => outputs.front().cloned().unwrap(),
                None => CommandOutput::new(127, "", format!("command not found: {}", command)),
            })
        }
    }
}
