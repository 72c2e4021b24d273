//! runectl - A Docker-compatible container CLI
//!
//! This is the main CLI entry point for runectl.

use clap::error::ErrorKind;
use clap::{Args, Parser, Subcommand};
use runectl::compose::options::{
    BuildOptions, ConfigFormat, ConfigOptions, CopyOptions, CreateOptions, DownOptions,
    ExecOptions, Format, ImagesOptions, KillOptions, LogFormat, LogsOptions, PortOptions,
    PsOptions, PullOptions, PushOptions, RemoveOptions, RunOptions, StopOptions, UpOptions,
};
use runectl::compose::project::PullPolicy;
use runectl::compose::{load, ComposeEngine, ProjectOptions};
use runectl::config::Settings;
use runectl::error::{CtlError, Result, EXIT_FAILURE};
use runectl::runtime::{ContainerStatus, LocalRuntime, Protocol};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// runectl - Docker-compatible container CLI
#[derive(Parser)]
#[command(name = "runectl")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "A Docker-compatible container CLI with a Compose engine", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Docker Compose commands
    Compose(ComposeArgs),

    /// Show version information
    Version(VersionArgs),
}

#[derive(Args)]
struct VersionArgs {
    /// Print the version number only
    #[arg(long)]
    short: bool,
    /// Output format (table or json)
    #[arg(long, default_value = "table")]
    format: String,
}

#[derive(Args)]
struct ComposeArgs {
    /// Compose configuration files
    #[arg(short = 'f', long = "file")]
    files: Vec<PathBuf>,
    /// Alternate working directory
    #[arg(long)]
    project_directory: Option<PathBuf>,
    /// Project name
    #[arg(short = 'p', long)]
    project_name: Option<String>,
    /// Alternate environment files
    #[arg(long)]
    env_file: Vec<PathBuf>,
    /// Profiles to enable
    #[arg(long)]
    profile: Vec<String>,

    #[command(subcommand)]
    command: ComposeCommands,
}

#[derive(Args)]
struct CreateArgs {
    /// Build images before starting containers
    #[arg(long)]
    build: bool,
    /// Don't build an image, even if it's missing
    #[arg(long)]
    no_build: bool,
    /// Pull image before running (always, missing, never, build)
    #[arg(long)]
    pull: Option<String>,
    /// Recreate containers even if their configuration hasn't changed
    #[arg(long)]
    force_recreate: bool,
    /// Don't recreate containers that already exist
    #[arg(long)]
    no_recreate: bool,
    /// Remove containers for services not defined in the Compose file
    #[arg(long)]
    remove_orphans: bool,
    /// Scale SERVICE to NUM instances
    #[arg(long, value_name = "SERVICE=NUM")]
    scale: Vec<String>,
    /// Don't start linked services
    #[arg(long)]
    no_deps: bool,
}

#[derive(Args)]
struct LogFormatArgs {
    /// Produce monochrome output
    #[arg(long)]
    no_color: bool,
    /// Don't print prefix in logs
    #[arg(long)]
    no_log_prefix: bool,
}

#[derive(Args)]
struct RunArgs {
    /// Service to run
    service: String,
    /// Command and arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
    /// Override the entrypoint of the image
    #[arg(long)]
    entrypoint: Option<String>,
    /// Assign a name to the container
    #[arg(long)]
    name: Option<String>,
    /// Run container in background and print container ID
    #[arg(short, long)]
    detach: bool,
    /// Automatically remove the container when it exits
    #[arg(long)]
    rm: bool,
    /// Run with the service's ports enabled and mapped to the host
    #[arg(long)]
    service_ports: bool,
    /// Publish a container's port(s) to the host
    #[arg(short, long)]
    publish: Vec<String>,
    /// Keep STDIN open even if not attached
    #[arg(short, long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    interactive: Option<bool>,
    /// Allocate a pseudo-TTY
    #[arg(short, long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    tty: Option<bool>,
    /// Disable pseudo-TTY allocation
    #[arg(short = 'T', long = "no-TTY")]
    no_tty: bool,
    /// Set environment variables
    #[arg(short, long)]
    env: Vec<String>,
    /// Add or override a label
    #[arg(short, long)]
    label: Vec<String>,
    /// Bind mount a volume
    #[arg(short, long)]
    volume: Vec<String>,
    /// Working directory inside the container
    #[arg(short, long)]
    workdir: Option<String>,
    /// Run as specified username or uid
    #[arg(short, long)]
    user: Option<String>,
    /// Don't start linked services
    #[arg(long)]
    no_deps: bool,
    /// Build image before starting container
    #[arg(long)]
    build: bool,
    /// Pull image before running (always, missing, never)
    #[arg(long)]
    pull: Option<String>,
}

#[derive(Args)]
struct ExecArgs {
    /// Service to run the command in
    service: String,
    /// Command and arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    command: Vec<String>,
    /// Detached mode: run command in the background
    #[arg(short, long)]
    detach: bool,
    /// Keep STDIN open even if not attached
    #[arg(short, long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    interactive: Option<bool>,
    /// Allocate a pseudo-TTY
    #[arg(short, long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    tty: Option<bool>,
    /// Disable pseudo-TTY allocation
    #[arg(short = 'T', long = "no-TTY")]
    no_tty: bool,
    /// Index of the container if service has multiple replicas
    #[arg(long, default_value = "1")]
    index: u32,
    /// Set environment variables
    #[arg(short, long)]
    env: Vec<String>,
    /// Path to workdir directory for this command
    #[arg(short, long)]
    workdir: Option<String>,
    /// Run the command as this user
    #[arg(short, long)]
    user: Option<String>,
    /// Give extended privileges to the process
    #[arg(long)]
    privileged: bool,
}

#[derive(Subcommand)]
enum ComposeCommands {
    /// Create and start containers
    Up {
        /// Services to start
        services: Vec<String>,
        /// Run containers in the background
        #[arg(short, long)]
        detach: bool,
        /// Stop all containers if any container was stopped
        #[arg(long)]
        abort_on_container_exit: bool,
        /// Return the exit code of the selected service container
        #[arg(long, value_name = "SERVICE")]
        exit_code_from: Option<String>,
        /// Shutdown timeout in seconds
        #[arg(short, long)]
        timeout: Option<u64>,
        /// Show timestamps
        #[arg(long)]
        timestamps: bool,
        #[command(flatten)]
        create: CreateArgs,
        #[command(flatten)]
        log: LogFormatArgs,
    },

    /// Stop and remove containers, networks
    Down {
        /// Remove containers for services not defined in the Compose file
        #[arg(long)]
        remove_orphans: bool,
        /// Remove named volumes and anonymous volumes attached to containers
        #[arg(short, long)]
        volumes: bool,
        /// Shutdown timeout in seconds
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Create containers for a service
    Create {
        services: Vec<String>,
        #[command(flatten)]
        create: CreateArgs,
    },

    /// Start services
    Start { services: Vec<String> },

    /// Stop services
    Stop {
        services: Vec<String>,
        /// Shutdown timeout in seconds
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Restart service containers
    Restart {
        services: Vec<String>,
        /// Shutdown timeout in seconds
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Force stop service containers
    Kill {
        services: Vec<String>,
        /// Signal to send to the container
        #[arg(short, long, default_value = "SIGKILL")]
        signal: String,
        /// Remove containers for services not defined in the Compose file
        #[arg(long)]
        remove_orphans: bool,
    },

    /// Pause services
    Pause { services: Vec<String> },

    /// Unpause services
    Unpause { services: Vec<String> },

    /// Remove stopped service containers
    Rm {
        services: Vec<String>,
        /// Don't ask to confirm removal
        #[arg(short, long)]
        force: bool,
        /// Stop the containers, if required, before removing
        #[arg(short, long)]
        stop: bool,
        /// Remove any anonymous volumes attached to containers
        #[arg(short, long)]
        volumes: bool,
    },

    /// Run a one-off command on a service
    Run(RunArgs),

    /// Execute a command in a running container
    Exec(ExecArgs),

    /// List containers
    Ps {
        services: Vec<String>,
        /// Show all stopped containers
        #[arg(short, long)]
        all: bool,
        /// Only display IDs
        #[arg(short, long)]
        quiet: bool,
        /// Display services
        #[arg(long = "services")]
        list_services: bool,
        /// Format the output (table or json)
        #[arg(long, default_value = "table")]
        format: String,
        /// Filter services by status
        #[arg(long)]
        status: Vec<String>,
    },

    /// List images used by the created containers
    Images {
        services: Vec<String>,
        /// Only display IDs
        #[arg(short, long)]
        quiet: bool,
        /// Format the output (table or json)
        #[arg(long, default_value = "table")]
        format: String,
    },

    /// Display the running processes
    Top { services: Vec<String> },

    /// Print the public port for a port binding
    Port {
        service: String,
        private_port: u16,
        /// tcp, udp or sctp
        #[arg(long, default_value = "tcp")]
        protocol: String,
        /// Index of the container if service has multiple replicas
        #[arg(long, default_value = "1")]
        index: u32,
    },

    /// Parse, resolve and render compose file in canonical format
    Config {
        /// Print the service names, one per line
        #[arg(long = "services")]
        list_services: bool,
        /// Print the volume names, one per line
        #[arg(long)]
        volumes: bool,
        /// Print the service config hash, one per line ("*" for all)
        #[arg(long)]
        hash: Option<String>,
        /// Format the output (yaml or json)
        #[arg(long, default_value = "yaml")]
        format: String,
        /// Only validate the configuration, don't print anything
        #[arg(short, long)]
        quiet: bool,
    },

    /// Build or rebuild services
    Build {
        services: Vec<String>,
        /// Do not use cache when building the image
        #[arg(long)]
        no_cache: bool,
        /// Set build-time variables for services
        #[arg(long)]
        build_arg: Vec<String>,
        /// Don't print anything to STDOUT
        #[arg(short, long)]
        quiet: bool,
    },

    /// Pull service images
    Pull {
        services: Vec<String>,
        /// Pull what it can and ignores images with pull failures
        #[arg(long)]
        ignore_pull_failures: bool,
        /// Pull without printing progress information
        #[arg(short, long)]
        quiet: bool,
    },

    /// Push service images
    Push {
        services: Vec<String>,
        /// Push what it can and ignores images with push failures
        #[arg(long)]
        ignore_push_failures: bool,
    },

    /// View output from containers
    Logs {
        services: Vec<String>,
        /// Follow log output
        #[arg(short, long)]
        follow: bool,
        /// Number of lines to show from the end of the logs
        #[arg(short = 'n', long, default_value = "all")]
        tail: String,
        /// Index of the container if service has multiple replicas
        #[arg(long)]
        index: Option<u32>,
        /// Show timestamps
        #[arg(short, long)]
        timestamps: bool,
        #[command(flatten)]
        log: LogFormatArgs,
    },

    /// Show the Docker Compose version information
    Version(VersionArgs),

    /// Copy files/folders between a service container and the local filesystem
    Cp {
        /// SERVICE:SRC_PATH or a local path
        src: String,
        /// SERVICE:DEST_PATH or a local path
        dest: String,
        /// Index of the container if service has multiple replicas
        #[arg(long, default_value = "1")]
        index: u32,
        /// Copy to all the containers of the service
        #[arg(long)]
        all: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => EXIT_FAILURE,
            };
            let _ = err.print();
            std::process::exit(code);
        }
    };

    // Initialize logging; stdout is reserved for command output
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let settings = Settings::from_env().debug(cli.debug);
    match cli.command {
        Commands::Version(args) => {
            print_version(&args)?;
            Ok(0)
        }
        Commands::Compose(args) => compose(args, settings).await,
    }
}

fn print_version(args: &VersionArgs) -> Result<()> {
    let version = env!("CARGO_PKG_VERSION");
    if args.short {
        println!("{}", version);
        return Ok(());
    }
    match args.format.parse::<Format>()? {
        Format::Json => println!("{}", serde_json::json!({ "version": version })),
        Format::Table => println!("runectl version {}", version),
    }
    Ok(())
}

async fn compose(args: ComposeArgs, settings: Settings) -> Result<i32> {
    if let ComposeCommands::Version(version) = &args.command {
        print_version(version)?;
        return Ok(0);
    }

    let mut options = ProjectOptions::from_process()?;
    options.files = args.files;
    options.project_directory = args.project_directory;
    options.project_name = args.project_name;
    options.env_files = args.env_file;
    options.profiles = args.profile;
    let project = load(&options)?;
    tracing::debug!("Loaded project {} from {:?}", project.name, project.config_files);

    let runtime = Arc::new(LocalRuntime::new(settings.runtime_dir())?);
    let engine = ComposeEngine::new(runtime, settings);

    let cancel = engine.cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, cancelling");
            cancel.cancel();
        }
    });

    match args.command {
        ComposeCommands::Up {
            services,
            detach,
            abort_on_container_exit,
            exit_code_from,
            timeout,
            timestamps,
            create,
            log,
        } => {
            let options = UpOptions {
                create: create_options(create, timeout)?,
                detach,
                abort_on_container_exit,
                exit_code_from,
                log: LogFormat {
                    no_color: log.no_color,
                    no_log_prefix: log.no_log_prefix,
                    timestamps,
                },
            };
            engine.up(&project, &services, &options).await
        }
        ComposeCommands::Down {
            remove_orphans,
            volumes,
            timeout,
        } => {
            let options = DownOptions {
                remove_orphans,
                volumes,
                timeout: stop_timeout(timeout),
            };
            engine.down(&project, &options).await.map(|_| 0)
        }
        ComposeCommands::Create { services, create } => {
            let options = create_options(create, None)?;
            engine.create(&project, &services, &options).await.map(|_| 0)
        }
        ComposeCommands::Start { services } => engine.start(&project, &services).await.map(|_| 0),
        ComposeCommands::Stop { services, timeout } => {
            let options = StopOptions {
                timeout: stop_timeout(timeout),
            };
            engine.stop(&project, &services, &options).await.map(|_| 0)
        }
        ComposeCommands::Restart { services, timeout } => {
            let options = StopOptions {
                timeout: stop_timeout(timeout),
            };
            engine.restart(&project, &services, &options).await.map(|_| 0)
        }
        ComposeCommands::Kill {
            services,
            signal,
            remove_orphans,
        } => {
            let options = KillOptions {
                signal,
                remove_orphans,
            };
            engine.kill(&project, &services, &options).await.map(|_| 0)
        }
        ComposeCommands::Pause { services } => engine.pause(&project, &services).await.map(|_| 0),
        ComposeCommands::Unpause { services } => {
            engine.unpause(&project, &services).await.map(|_| 0)
        }
        ComposeCommands::Rm {
            services,
            force,
            stop,
            volumes,
        } => {
            if !force {
                let names = engine.removable(&project, &services, stop).await?;
                if !names.is_empty()
                    && !confirm(&format!("Going to remove {}\nAre you sure? [yN] ", names.join(", ")))?
                {
                    return Ok(0);
                }
            }
            let options = RemoveOptions {
                stop,
                volumes,
                timeout: None,
            };
            engine.rm(&project, &services, &options).await.map(|_| 0)
        }
        ComposeCommands::Run(args) => engine.run(&project, &args.into_options()?).await,
        ComposeCommands::Exec(args) => engine.exec(&project, &args.into_options()).await,
        ComposeCommands::Ps {
            services,
            all,
            quiet,
            list_services,
            format,
            status,
        } => {
            let options = PsOptions {
                all,
                quiet,
                services: list_services,
                format: format.parse()?,
                status: status
                    .iter()
                    .map(|s| s.parse::<ContainerStatus>())
                    .collect::<Result<Vec<_>>>()?,
            };
            print!("{}", engine.ps(&project, &services, &options).await?);
            Ok(0)
        }
        ComposeCommands::Images {
            services,
            quiet,
            format,
        } => {
            let options = ImagesOptions {
                quiet,
                format: format.parse()?,
            };
            print!("{}", engine.images(&project, &services, &options).await?);
            Ok(0)
        }
        ComposeCommands::Top { services } => {
            print!("{}", engine.top(&project, &services).await?);
            Ok(0)
        }
        ComposeCommands::Port {
            service,
            private_port,
            protocol,
            index,
        } => {
            let options = PortOptions {
                service,
                private_port,
                protocol: protocol.parse::<Protocol>()?,
                index,
            };
            print!("{}", engine.port(&project, &options).await?);
            Ok(0)
        }
        ComposeCommands::Config {
            list_services,
            volumes,
            hash,
            format,
            quiet,
        } => {
            let options = ConfigOptions {
                services: list_services,
                volumes,
                hash,
                format: config_format(&format)?,
            };
            let rendered = engine.config(&project, &options)?;
            if !quiet {
                print!("{}", rendered);
            }
            Ok(0)
        }
        ComposeCommands::Build {
            services,
            no_cache,
            build_arg,
            quiet,
        } => {
            let options = BuildOptions {
                no_cache,
                args: build_args(&build_arg),
                quiet,
            };
            engine.build(&project, &services, &options).await.map(|_| 0)
        }
        ComposeCommands::Pull {
            services,
            ignore_pull_failures,
            quiet,
        } => {
            let options = PullOptions {
                ignore_pull_failures,
                quiet,
            };
            engine.pull(&project, &services, &options).await.map(|_| 0)
        }
        ComposeCommands::Push {
            services,
            ignore_push_failures,
        } => {
            let options = PushOptions {
                ignore_push_failures,
            };
            engine.push(&project, &services, &options).await.map(|_| 0)
        }
        ComposeCommands::Logs {
            services,
            follow,
            tail,
            index,
            timestamps,
            log,
        } => {
            let options = LogsOptions {
                follow,
                tail: parse_tail(&tail)?,
                index,
                log: LogFormat {
                    no_color: log.no_color,
                    no_log_prefix: log.no_log_prefix,
                    timestamps,
                },
            };
            engine.logs(&project, &services, &options).await.map(|_| 0)
        }
        ComposeCommands::Cp {
            src,
            dest,
            index,
            all,
        } => {
            let options = CopyOptions::parse(&src, &dest, index, all)?;
            engine.cp(&project, &options).await.map(|_| 0)
        }
        ComposeCommands::Version(_) => Ok(0),
    }
}

impl RunArgs {
    fn into_options(self) -> Result<RunOptions> {
        let (interactive, tty) = stdio(self.interactive, self.tty, self.no_tty);
        Ok(RunOptions {
            service: self.service,
            command: self.command,
            entrypoint: self.entrypoint,
            name: self.name,
            detach: self.detach,
            rm: self.rm,
            service_ports: self.service_ports,
            publish: self.publish,
            interactive,
            tty,
            env: self.env,
            labels: self.label,
            volumes: self.volume,
            workdir: self.workdir,
            user: self.user,
            no_deps: self.no_deps,
            build: CreateOptions::build_policy(self.build, false)?,
            pull: pull_policy(self.pull)?,
        })
    }
}

impl ExecArgs {
    fn into_options(self) -> ExecOptions {
        let (interactive, tty) = stdio(self.interactive, self.tty, self.no_tty);
        ExecOptions {
            service: self.service,
            index: self.index,
            command: self.command,
            detach: self.detach,
            interactive,
            tty,
            env: self.env,
            workdir: self.workdir,
            user: self.user,
            privileged: self.privileged,
        }
    }
}

/// `-i` and `-t` default to true, detached or not; `-T` turns the TTY off
fn stdio(interactive: Option<bool>, tty: Option<bool>, no_tty: bool) -> (bool, bool) {
    (interactive.unwrap_or(true), !no_tty && tty.unwrap_or(true))
}

fn create_options(args: CreateArgs, timeout: Option<u64>) -> Result<CreateOptions> {
    Ok(CreateOptions {
        recreate: CreateOptions::recreate_policy(args.force_recreate, args.no_recreate)?,
        build: CreateOptions::build_policy(args.build, args.no_build)?,
        pull: pull_policy(args.pull)?,
        remove_orphans: args.remove_orphans,
        scale: CreateOptions::parse_scale(&args.scale)?,
        no_deps: args.no_deps,
        timeout: stop_timeout(timeout),
    })
}

fn stop_timeout(seconds: Option<u64>) -> Option<Duration> {
    seconds.map(Duration::from_secs)
}

/// Ask a yes/no question on the terminal; anything but yes declines
fn confirm(question: &str) -> Result<bool> {
    let mut stderr = std::io::stderr();
    write!(stderr, "{}", question)?;
    stderr.flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

fn pull_policy(value: Option<String>) -> Result<Option<PullPolicy>> {
    value.map(|v| v.parse::<PullPolicy>()).transpose()
}

fn config_format(value: &str) -> Result<ConfigFormat> {
    match value {
        "yaml" => Ok(ConfigFormat::Yaml),
        "json" => Ok(ConfigFormat::Json),
        other => Err(CtlError::ConfigInvalid(format!(
            "unsupported format {:?} (expected yaml or json)",
            other
        ))),
    }
}

fn parse_tail(value: &str) -> Result<Option<usize>> {
    if value == "all" {
        return Ok(None);
    }
    value
        .parse::<usize>()
        .map(Some)
        .map_err(|_| CtlError::ConfigInvalid(format!("invalid --tail value {:?}", value)))
}

/// `KEY=VALUE` build args; a bare `KEY` takes its value from the environment
fn build_args(entries: &[String]) -> BTreeMap<String, String> {
    entries
        .iter()
        .filter_map(|entry| match entry.split_once('=') {
            Some((key, value)) => Some((key.to_string(), value.to_string())),
            None => std::env::var(entry).ok().map(|value| (entry.clone(), value)),
        })
        .collect()
}
