use std::ffi::OsString;
use std::sync::Arc;

use anyhow::{self, Context};
use clap::Parser;
use nix::sys::{resource, signal};

use crate::core::configuration::{CliOptions, ConfigFileOptions, ConfigOptions};
use crate::core::detach::DetachedVariant;
use crate::core::logger::mvee_logger;
use crate::core::monitor::MonitorId;
use crate::core::monitor_thread::MonitorSpawner;
use crate::core::registry::MonitorRegistry;
use crate::core::shutdown::{ShutdownCause, ShutdownCoordinator};
use crate::host::launch::Launcher;
use crate::host::ptrace::PtraceTracer;
use crate::host::syscall::AllowAll;
use crate::host::tracer::{Tracer, TracerFactory};
use crate::utility::os;
use crate::utility::special_files::{SpecialFiles, SPECIAL_DIR};

/// Main entry point for the supervisor.
pub fn run_mvee(args: Vec<OsString>) -> anyhow::Result<()> {
    // unblock all signals in the supervisor and its variants, since the parent may have blocked
    // some of them
    signal::sigprocmask(
        signal::SigmaskHow::SIG_SETMASK,
        Some(&signal::SigSet::empty()),
        None,
    )?;

    // parse the options from the command line
    let options = match CliOptions::try_parse_from(args.clone()) {
        Ok(x) => x,
        Err(e) => {
            if e.use_stderr() {
                eprint!("{}", e);
                std::process::exit(1);
            } else {
                print!("{}", e);
                std::process::exit(0);
            }
        }
    };

    // read from stdin if the config filename is given as '-'
    let config_filename: String = match options.config.as_str() {
        "-" => "/dev/stdin",
        x => x,
    }
    .into();

    // load the configuration yaml
    let file = std::fs::File::open(&config_filename)
        .with_context(|| format!("Could not open config file {:?}", &config_filename))?;
    let config_file: ConfigFileOptions = serde_yaml::from_reader(file)
        .with_context(|| format!("Could not parse configuration file {:?}", &config_filename))?;

    // generate the final configuration from the config file and cli options
    let config = ConfigOptions::new(config_file, options.clone());

    if options.show_config {
        eprintln!("{:#?}", config);
        return Ok(());
    }

    init_logger(&config).context("Could not start the logger")?;

    // disable log buffering during startup so that we see every message immediately in the terminal
    mvee_logger::set_buffering_enabled(false);

    let log_level: log::Level = config.log_level().into();
    if log_level > log::STATIC_MAX_LEVEL {
        log::warn!(
            "Log level set to {}, but messages higher than {} have been compiled out",
            log_level,
            log::STATIC_MAX_LEVEL,
        );
    }

    // raise fd soft limit to hard limit
    raise_rlimit(resource::Resource::RLIMIT_NOFILE).context("Could not raise fd limit")?;

    os::check_ptrace_scope();
    log_environment(&args);

    let registry = Arc::new(MonitorRegistry::new());
    start_signal_watcher(Arc::clone(&registry)).context("Could not install signal handlers")?;

    let spawner = MonitorSpawner::new(
        Arc::clone(&registry),
        ptrace_tracer_factory(),
        Arc::new(AllowAll),
        config.poll_interval(),
    );

    log::debug!("Startup checks passed, we are ready to launch the variants");

    if let Err(e) = start_variants(&config, &spawner) {
        // monitors that already started must wind down before we exit
        registry.request_shutdown(ShutdownCause::Internal);
        registry.open_can_run();
        ShutdownCoordinator::new(Arc::clone(&registry)).run_until_terminated();
        return Err(e);
    }

    mvee_logger::set_buffering_enabled(true);

    let report = ShutdownCoordinator::new(registry).run_until_terminated();
    if !report.orphaned.is_empty() {
        log::warn!(
            "{} detached variants were never claimed by a monitor",
            report.orphaned.len()
        );
    }

    Ok(())
}

/// Launch the first variant, queue it for the primary monitor, and let the monitor run.
fn start_variants(config: &ConfigOptions, spawner: &MonitorSpawner) -> anyhow::Result<()> {
    let specs = config.variant_specs();
    let Some(spec) = specs.first() else {
        anyhow::bail!("No variants were configured");
    };
    if specs.len() > 1 {
        log::info!(
            "{} variants configured; only variant '{}' is launched",
            specs.len(),
            spec.id
        );
    }

    let special_files = if config.general.use_special_files.unwrap() {
        let special_files = SpecialFiles::new(SPECIAL_DIR, Arc::clone(spawner.global_locks()))
            .context("Could not create the special files directory")?;
        Some(special_files)
    } else {
        None
    };

    let root_dir = os::get_mvee_root_dir().context("Could not find the root directory")?;
    log::debug!("Root directory is {}", root_dir.display());

    let launcher = Launcher::new(root_dir, special_files);
    let (pid, ctx) = launcher
        .launch_variant(spec)
        .with_context(|| format!("Could not launch variant '{}'", spec.id))?;

    let registry = spawner.registry();
    registry.register_variants(&[pid]);

    let queued = registry
        .add_detached_variant(DetachedVariant::new(pid, MonitorId::MANAGEMENT, ctx))
        .context("Could not queue the variant for its monitor");

    // the monitor waits for the gate, so that it only attaches once startup is complete
    let spawned = queued.and_then(|()| {
        spawner
            .spawn(vec![pid], true)
            .context("Could not start the primary monitor")
    });

    let (monitor, _handle) = match spawned {
        Ok(x) => x,
        Err(e) => {
            // nobody will attach to it
            registry.remove_detached_variant(pid).ok();
            signal::kill(pid, signal::Signal::SIGKILL).ok();
            return Err(e);
        }
    };
    log::info!("Started primary monitor {} for variant {pid}", monitor.id());

    registry.open_can_run();
    Ok(())
}

fn ptrace_tracer_factory() -> TracerFactory {
    Arc::new(|| Box::new(PtraceTracer::new()) as Box<dyn Tracer>)
}

fn init_logger(config: &ConfigOptions) -> anyhow::Result<()> {
    let log_file = if config.general.log_to_file.unwrap() {
        let log_dir = config.general.log_dir.as_ref().unwrap();
        std::fs::create_dir_all(log_dir)
            .with_context(|| format!("Could not create log directory {log_dir:?}"))?;

        let path = std::path::Path::new(log_dir).join(mvee_logger::LOG_FILE_NAME);
        let file = std::fs::File::create(&path)
            .with_context(|| format!("Could not create log file {}", path.display()))?;
        Some(file)
    } else {
        None
    };

    let level: log::Level = config.log_level().into();
    mvee_logger::init(
        level.to_level_filter(),
        config.general.warnings_to_stderr.unwrap(),
        log_file,
    )?;

    Ok(())
}

/// Request a shutdown when the supervisor receives a termination signal.
fn start_signal_watcher(registry: Arc<MonitorRegistry>) -> anyhow::Result<()> {
    let mut signals = signal_hook::iterator::Signals::new([
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGTERM,
        signal_hook::consts::SIGQUIT,
    ])?;

    std::thread::Builder::new()
        .name("signal-watcher".into())
        .spawn(move || {
            for signal in signals.forever() {
                let cause = signal::Signal::try_from(signal)
                    .map_or(ShutdownCause::Internal, ShutdownCause::Signal);
                if !registry.request_shutdown(cause) {
                    log::debug!("Ignoring {cause}; shutdown was already requested");
                }
            }
        })?;

    Ok(())
}

fn raise_rlimit(resource: resource::Resource) -> anyhow::Result<()> {
    let (_soft_limit, hard_limit) = resource::getrlimit(resource)?;
    resource::setrlimit(resource, hard_limit, hard_limit)?;
    Ok(())
}

fn log_environment(args: &[OsString]) {
    for arg in args {
        log::info!("arg: {}", arg.to_string_lossy());
    }

    for (key, value) in std::env::vars_os() {
        let level = match key.to_string_lossy().as_ref() {
            "MVEEROOT" | "LD_PRELOAD" | "LD_LIBRARY_PATH" => log::Level::Info,
            _ => log::Level::Trace,
        };
        log::log!(level, "env: {:?}={:?}", key, value);
    }
}

/// Run the supervisor and return the process exit code.
pub fn main(args: Vec<OsString>) -> i32 {
    let result = run_mvee(args);
    log::logger().flush();

    if let Err(e) = result {
        // log the full error, its context, and its backtrace if enabled
        if log::log_enabled!(log::Level::Error) {
            for line in format!("{:?}", e).split('\n') {
                log::error!("{}", line);
            }
            log::logger().flush();

            // print the short error
            eprintln!("** The supervisor did not complete successfully: {}", e);
            eprintln!("** See the log for details");
        } else {
            eprintln!("{:?}", e);
        }

        return 1;
    }

    eprintln!("** The supervisor completed successfully");
    0
}
