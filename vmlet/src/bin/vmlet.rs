use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use vmlet::{
    EventConsumer, FilesystemLayout, InitSystem, JobMode, LoggingHandler, MonitorConnection,
    Provisioner, StreamEnd, SupervisorScope, SystemctlSupervisor, VmSpec, VmletError,
    VmletOptions, build_unit, init_logging_for,
};

#[derive(Parser, Debug)]
#[command(name = "vmlet", version, about = "Run a QEMU VM as a systemd unit and follow its QMP events")]
struct Cli {
    /// JSON options file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Base directory for VM working directories and logs
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    /// Use the system systemd instance instead of the user one
    #[arg(long, global = true)]
    system: bool,

    /// Directory unit files are written to
    #[arg(long, global = true)]
    unit_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Provision, start and monitor a VM until it stops
    Up(UpArgs),
    /// Print the unit file for a VM without touching the system
    Render(LaunchArgs),
    /// Attach to a running VM's control socket and print its events
    Monitor { name: String },
    /// Show whether the VM's unit is active
    Status { name: String },
    /// Ask systemd to stop the VM's unit
    Stop {
        name: String,
        #[arg(long, default_value = "replace")]
        job_mode: JobMode,
    },
}

#[derive(Args, Debug)]
struct LaunchArgs {
    name: String,

    #[arg(long)]
    cpus: Option<u32>,

    #[arg(long)]
    memory_mb: Option<u32>,

    /// Template for the primary qcow2 disk
    #[arg(long)]
    backing_image: Option<PathBuf>,

    /// Template for the raw seed disk
    #[arg(long)]
    seed_image: Option<PathBuf>,

    #[arg(long)]
    qemu: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct UpArgs {
    #[command(flatten)]
    launch: LaunchArgs,

    #[arg(long, default_value = "replace")]
    job_mode: JobMode,
}

impl LaunchArgs {
    fn apply(&self, options: &mut VmletOptions) {
        if let Some(cpus) = self.cpus {
            options.cpus = cpus;
        }
        if let Some(memory_mb) = self.memory_mb {
            options.memory_mb = memory_mb;
        }
        if let Some(ref path) = self.backing_image {
            options.backing_image = path.clone();
        }
        if let Some(ref path) = self.seed_image {
            options.seed_image = path.clone();
        }
        if let Some(ref path) = self.qemu {
            options.qemu_binary = path.clone();
        }
    }
}

fn load_options(cli: &Cli) -> Result<VmletOptions> {
    let mut options = match cli.config {
        Some(ref path) => VmletOptions::from_file(path)?,
        None => VmletOptions::default(),
    };
    if let Some(ref home) = cli.home {
        options.home_dir = home.clone();
    }
    if cli.system {
        options.scope = SupervisorScope::System;
    }
    if let Some(ref dir) = cli.unit_dir {
        options.unit_dir = Some(dir.clone());
    }
    match cli.command {
        Command::Up(ref args) => args.launch.apply(&mut options),
        Command::Render(ref args) => args.apply(&mut options),
        _ => {}
    }
    options.sanitize()?;
    Ok(options)
}

/// Cancel `token` on Ctrl-C or SIGTERM.
fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        let mut terminate =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    tracing::warn!(error = %e, "Cannot listen for SIGTERM");
                    let _ = tokio::signal::ctrl_c().await;
                    token.cancel();
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
        tracing::info!("Shutdown requested");
        token.cancel();
    });
}

async fn run(cli: Cli) -> Result<()> {
    let options = load_options(&cli)?;

    if let Command::Render(ref args) = cli.command {
        let spec = VmSpec::new(&args.name, &options)?;
        print!("{}", build_unit(&spec).render());
        return Ok(());
    }

    let layout = FilesystemLayout::new(&options.home_dir);
    let _log_guard = init_logging_for(&layout)?;

    let supervisor = Arc::new(SystemctlSupervisor::new(options.unit_dir(), options.scope));
    let cancel = CancellationToken::new();
    cancel_on_signal(cancel.clone());

    match cli.command {
        Command::Up(args) => {
            let spec = VmSpec::new(&args.launch.name, &options)?;
            let mut handler = LoggingHandler::new(spec.name());
            let report = Provisioner::new(supervisor, options.monitor.retry_policy())
                .with_job_mode(args.job_mode)
                .run(spec, cancel, &mut handler)
                .await
                .with_context(|| format!("VM {} did not run to completion", args.launch.name))?;

            tracing::info!(
                run_id = %report.run_id,
                events = report.summary.events,
                decode_errors = report.summary.decode_errors,
                end = ?report.summary.end,
                "Run finished"
            );
        }
        Command::Monitor { name } => {
            let spec = VmSpec::new(&name, &options)?;
            let policy = options.monitor.retry_policy();
            let connection =
                MonitorConnection::connect(&spec.control_socket_path(), &policy, &cancel).await?;
            let mut handler = LoggingHandler::new(spec.name());
            let summary = EventConsumer::consume(
                connection.into_events(cancel.clone()),
                &cancel,
                &mut handler,
            )
            .await?;
            if summary.end == StreamEnd::PeerClosed {
                println!("{}: monitor closed after {} events", name, summary.events);
            }
        }
        Command::Status { name } => {
            let spec = VmSpec::new(&name, &options)?;
            let state = supervisor.unit_state(&spec.unit_name()).await?;
            println!("{}: {}", spec.unit_name(), state);
        }
        Command::Stop { name, job_mode } => {
            let spec = VmSpec::new(&name, &options)?;
            supervisor.stop_unit(&spec.unit_name(), job_mode).await?;
            println!("{}: stop requested", spec.unit_name());
        }
        Command::Render(_) => {}
    }

    Ok(())
}

fn exit_code(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<VmletError>()
        .map(|e| e.exit_code() as u8)
        .unwrap_or(1)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "vmlet failed");
            eprintln!("vmlet: {:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}
