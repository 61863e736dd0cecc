//! macvtap CNI plugin binary.

use std::io::{self, Read, Write};
use std::process::ExitCode;

use macvtap_cni::{
    logging, types::negotiate_version, CmdArgs, CniError, Command, NetConf, Provisioner,
    VersionInfo, CURRENT_VERSION,
};
use serde::Serialize;
use tracing::{debug, error};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    if let Err(e) = logging::init() {
        eprintln!("failed to initialize logging: {e}");
    }

    let mut stdin = Vec::new();
    let command = std::env::var("CNI_COMMAND").unwrap_or_default();
    if command != "VERSION" {
        if let Err(e) = io::stdin().read_to_end(&mut stdin) {
            return fail(&CniError::Io(e), CURRENT_VERSION);
        }
    }

    // Errors are reported in the version the runtime configured.
    let version = NetConf::parse(&stdin)
        .ok()
        .and_then(|conf| negotiate_version(&conf.cni_version).ok())
        .unwrap_or(CURRENT_VERSION);

    match run(stdin).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => fail(&e, version),
    }
}

async fn run(stdin: Vec<u8>) -> Result<(), CniError> {
    let (command, args) = CmdArgs::from_env(stdin)?;
    debug!(
        command = ?command,
        container_id = %args.container_id,
        netns = %args.netns,
        ifname = %args.ifname,
        "Invoked"
    );

    match command {
        Command::Version => print(&VersionInfo::default()),
        Command::Add => {
            let result = Provisioner::from_main_thread()?.cmd_add(&args).await?;
            print(&result)
        }
        Command::Del => Provisioner::from_main_thread()?.cmd_del(&args).await,
        Command::Check => Provisioner::from_main_thread()?.cmd_check(&args).await,
    }
}

fn print<T: Serialize>(value: &T) -> Result<(), CniError> {
    let json = serde_json::to_string(value).map_err(io::Error::other)?;
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{json}")?;
    stdout.flush()?;
    Ok(())
}

fn fail(err: &CniError, version: &str) -> ExitCode {
    error!(code = err.code(), error = %err, "Command failed");
    if let Err(e) = print(&err.to_document(version)) {
        eprintln!("failed to print error: {e}");
    }
    ExitCode::FAILURE
}
