use anyhow::{Context, Result};
use std::collections::HashMap;
use std::env;
use std::fs::OpenOptions;
use std::io::{self, Read};
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

use crate::config::NetConf;
use crate::plugin::GenevePlugin;
use crate::store::StoreError;
use crate::types::{
    CmdArgs, Error as CniError, ERR_GENERIC, ERR_INVALID_NETCONF, ERR_TRY_AGAIN_LATER,
    ERR_UNKNOWN_NETWORK,
};

/// CNI versions this plugin can produce results for.
pub const SUPPORTED_VERSIONS: &[&str] = &["0.3.0", "0.3.1", "0.4.0", "1.0.0"];

/// Parse command arguments from environment
pub fn parse_args() -> Result<CmdArgs> {
    let container_id =
        env::var("CNI_CONTAINERID").context("CNI_CONTAINERID not found in environment")?;
    let netns = env::var("CNI_NETNS").context("CNI_NETNS not found in environment")?;
    let ifname = env::var("CNI_IFNAME").context("CNI_IFNAME not found in environment")?;
    let path = env::var("CNI_PATH").unwrap_or_default();

    let args = parse_cni_args(&env::var("CNI_ARGS").unwrap_or_default());

    let mut stdin_data = Vec::new();
    io::stdin()
        .read_to_end(&mut stdin_data)
        .context("Failed to read from stdin")?;

    Ok(CmdArgs {
        container_id,
        netns,
        ifname,
        args,
        path,
        stdin_data,
    })
}

/// Parse CNI_ARGS string into key-value pairs
pub fn parse_cni_args(args_str: &str) -> HashMap<String, String> {
    args_str
        .split(';')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

/// Install the global subscriber. `RUST_LOG` wins over `logLevel`; output
/// goes to `logFile` when set, stderr otherwise. Stdout is reserved for the
/// CNI result.
pub fn init_logging(conf: &NetConf) -> Result<()> {
    let filter = match env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) if !directives.is_empty() => EnvFilter::new(directives),
        _ => EnvFilter::new(conf.log_level.as_deref().unwrap_or("info")),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let installed = match &conf.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
        }
        None => builder.with_writer(io::stderr).try_init(),
    };
    if installed.is_err() {
        tracing::debug!("global subscriber already installed, keeping it");
    }
    Ok(())
}

fn load(args: &CmdArgs) -> Result<NetConf> {
    let conf = NetConf::parse(&args.stdin_data)?;
    init_logging(&conf)?;
    Ok(conf)
}

/// Execute the add command
pub fn cmd_add(args: CmdArgs) -> Result<()> {
    let conf = load(&args)?;
    let plugin = GenevePlugin::new(conf, args);
    let result = plugin.add_network()?;
    result.print()
}

/// Execute the delete command
pub fn cmd_del(args: CmdArgs) -> Result<()> {
    let conf = load(&args)?;
    GenevePlugin::new(conf, args).del_network()
}

/// Execute the check command
pub fn cmd_check(args: CmdArgs) -> Result<()> {
    let conf = load(&args)?;
    GenevePlugin::new(conf, args).check_network()
}

fn print_version() -> Result<()> {
    let version = serde_json::json!({
        "cniVersion": "1.0.0",
        "supportedVersions": SUPPORTED_VERSIONS,
    });
    println!("{}", version);
    Ok(())
}

/// Main entry point for the CNI plugin
pub fn run_cni() -> Result<()> {
    let cmd = env::var("CNI_COMMAND").context("CNI_COMMAND not found in environment")?;

    match cmd.as_str() {
        "ADD" => cmd_add(parse_args()?),
        "DEL" => cmd_del(parse_args()?),
        "CHECK" => cmd_check(parse_args()?),
        "VERSION" => print_version(),
        _ => anyhow::bail!("Unknown CNI command: {}", cmd),
    }
}

/// Map a failed command to the CNI error result printed on stdout.
pub fn error_result(err: &anyhow::Error) -> CniError {
    let code = match err.downcast_ref::<StoreError>() {
        Some(StoreError::UnknownNetwork(_)) => ERR_UNKNOWN_NETWORK,
        Some(StoreError::PortsExhausted(_)) => ERR_TRY_AGAIN_LATER,
        None if err.downcast_ref::<serde_json::Error>().is_some() => ERR_INVALID_NETCONF,
        None => ERR_GENERIC,
    };
    CniError::new("1.0.0", code, err)
}
