//! CNI invocation plumbing: command dispatch from the environment.

use std::path::PathBuf;
use std::str::FromStr;

use crate::error::CniError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Add,
    Del,
    Check,
    Version,
}

impl FromStr for Command {
    type Err = CniError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ADD" => Ok(Command::Add),
            "DEL" => Ok(Command::Del),
            "CHECK" => Ok(Command::Check),
            "VERSION" => Ok(Command::Version),
            other => Err(CniError::UnknownCommand(other.to_string())),
        }
    }
}

/// Arguments of one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdArgs {
    pub container_id: String,
    /// Empty on DEL when the sandbox is already gone. Only ADD requires it.
    pub netns: String,
    pub ifname: String,
    pub args: String,
    /// Directories searched for delegated plugins.
    pub path: Vec<PathBuf>,
    pub stdin: Vec<u8>,
}

impl CmdArgs {
    /// Read the command and its arguments through `lookup`, which maps an
    /// environment variable name to its value.
    pub fn from_lookup<F>(lookup: F, stdin: Vec<u8>) -> Result<(Command, Self), CniError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let command: Command = lookup("CNI_COMMAND")
            .ok_or_else(|| missing("CNI_COMMAND"))?
            .parse()?;

        let get = |var: &'static str, required: bool| -> Result<String, CniError> {
            match lookup(var) {
                Some(value) if !value.is_empty() => Ok(value),
                _ if required => Err(missing(var)),
                _ => Ok(String::new()),
            }
        };

        let needs_sandbox = command == Command::Add;
        let args = match command {
            Command::Version => CmdArgs::default(),
            _ => CmdArgs {
                container_id: get("CNI_CONTAINERID", true)?,
                netns: get("CNI_NETNS", needs_sandbox)?,
                ifname: get("CNI_IFNAME", true)?,
                args: get("CNI_ARGS", false)?,
                path: get("CNI_PATH", false)?
                    .split(':')
                    .filter(|p| !p.is_empty())
                    .map(PathBuf::from)
                    .collect(),
                stdin,
            },
        };
        Ok((command, args))
    }

    pub fn from_env(stdin: Vec<u8>) -> Result<(Command, Self), CniError> {
        Self::from_lookup(|var| std::env::var(var).ok(), stdin)
    }
}

fn missing(var: &str) -> CniError {
    CniError::InvalidEnvArgs(format!("required env variable {var} missing"))
}
