use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{ArgAction, Parser};
use kextmount::modules::alert::LogDispatcher;
use kextmount::modules::channel::OsChannel;
use kextmount::modules::config::LaunchEnv;
use kextmount::modules::constants::{BUNDLE_INFO_PLIST, DISPLAY_NAME, DRIVER_VERSION};
use kextmount::modules::device::DeviceSource;
use kextmount::modules::error::exit;
use kextmount::modules::host::{Host, OsHost};
use kextmount::modules::options::ResolveContext;
use kextmount::modules::personality::PersonalityRegistry;
use kextmount::modules::version::VersionProbe;
use kextmount::{
    DriverLifecycleManager, Facility, MountError, MountRequest, MountSessionExecutor,
    OptionRegistry, SysctlRegistry,
};
use log::{debug, info, LevelFilter};

#[derive(Parser)]
#[command(
    name = "kextmount",
    disable_help_flag = true,
    disable_version_flag = true
)]
struct Cli {
    /// Mount options, comma separated
    #[arg(short = 'o', action = ArgAction::Append, value_name = "OPTIONS")]
    options: Vec<String>,

    /// Do not show alerts on stderr
    #[arg(short = 'q')]
    quiet: bool,

    #[arg(short = 'h', long = "help")]
    help: bool,

    #[arg(short = 'v', long = "version")]
    version: bool,

    /// Directory to mount on
    mount_point: Option<PathBuf>,
}

enum Outcome {
    Mounted,
    Usage,
}

fn main() -> ExitCode {
    match run() {
        Ok(Outcome::Mounted) => ExitCode::from(exit::OK),
        Ok(Outcome::Usage) => ExitCode::from(exit::USAGE),
        Err(e) => {
            eprintln!("kextmount: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

fn version_line() -> String {
    format!("{} mount version {}", DISPLAY_NAME, DRIVER_VERSION)
}

fn show_help(registry: &OptionRegistry, called_by_lib: bool) {
    if !called_by_lib {
        eprintln!("{}", version_line());
        eprintln!(
            "\nThis program is not meant to be called directly. The {} library calls it.",
            DISPLAY_NAME
        );
    }
    eprintln!("\n{}", registry.help_text());
}

fn init_logging(debug: bool) {
    let log_level = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    env_logger::Builder::new()
        .filter_level(log_level)
        .parse_env("RUST_LOG")
        .init();
}

fn run() -> Result<Outcome, MountError> {
    let registry = OptionRegistry::new();
    let env = LaunchEnv::from_env()?;

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("{}", e);
            show_help(&registry, env.called_by_lib);
            return Ok(Outcome::Usage);
        }
    };
    if !env.called_by_lib || cli.help {
        show_help(&registry, env.called_by_lib);
        return Ok(Outcome::Usage);
    }
    if cli.version {
        eprintln!("{}", version_line());
        return Ok(Outcome::Usage);
    }

    // Parsing has no side effects, so a quiet first pass picks the log level
    // and the real pass below runs with logging live.
    let debug_requested = registry
        .parse(&cli.options)
        .map(|parsed| parsed.debug())
        .unwrap_or(false);
    init_logging(debug_requested);
    debug!("{:?}", env);

    let parsed = registry.parse(&cli.options)?;

    // Run as the invoking user unless a step raises privileges itself.
    if let Err(e) = OsHost.restore() {
        debug!("Could not reset effective ids: {}", e);
    }

    let mount_point = cli
        .mount_point
        .ok_or_else(|| MountError::usage("missing mount point"))?;

    let daemon_name = env.daemon_name();
    let personalities = PersonalityRegistry::load_or_empty(Path::new(BUNDLE_INFO_PLIST));
    let options = parsed.finish(&ResolveContext {
        personalities: &personalities,
        daemon_name: daemon_name.as_deref(),
    })?;

    let driver = DriverLifecycleManager::new(
        Box::new(SysctlRegistry),
        Box::new(Facility::detect()),
        VersionProbe::default(),
    );
    let executor = MountSessionExecutor::new(
        driver,
        Box::new(OsChannel::default()),
        Box::new(OsHost),
        Box::new(LogDispatcher::new(cli.quiet)),
    );
    let request = MountRequest {
        mount_point,
        options,
        daemon_name,
        comm_fd: env.comm_fd,
        device: DeviceSource::from_env(&env),
        compat_mode: env.macfuse_mode,
    };

    let mounted = executor.run(&request)?;
    info!("{} mounted", mounted.display());
    Ok(Outcome::Mounted)
}
