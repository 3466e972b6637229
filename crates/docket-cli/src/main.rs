mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::build::BuildArgs;
use docket_core::install_signal_handler;
use docket_schema::DEFAULT_CONFIG_PATH;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "docket",
    version,
    about = "Verified image assembly and privilege-aware supervision for document-management containers"
)]
struct Cli {
    /// Path to the docket manifest and container configuration.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH, global = true)]
    config: PathBuf,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, verify and install every pinned artifact, the overlay and the image layout.
    Build {
        /// Target platform (e.g. linux/arm64, linux/arm/v7); defaults to TARGETARCH or the host.
        #[arg(long)]
        target: Option<String>,
        /// Install into this directory instead of the configured image root.
        #[arg(long)]
        root: Option<PathBuf>,
        /// Serve every download from this local directory.
        #[arg(long)]
        mirror: Option<PathBuf>,
        /// Do not install the supervision overlay.
        #[arg(long, default_value_t = false)]
        skip_overlay: bool,
        /// Do not create the service account and volume directories.
        #[arg(long, default_value_t = false)]
        skip_image: bool,
    },
    /// Show the concrete location and checksum of every artifact for a target.
    Resolve {
        /// Target platform; defaults to TARGETARCH or the host.
        #[arg(long)]
        target: Option<String>,
    },
    /// Check installed artifacts against the build record.
    Verify {
        /// Image root to check instead of the configured one.
        #[arg(long)]
        root: Option<PathBuf>,
    },
    /// Validate unit definitions and print the start order.
    Units {
        /// Units directory instead of the configured one.
        #[arg(long)]
        units: Option<PathBuf>,
    },
    /// Run as the container's first process and hand off to the supervisor.
    Init,
    /// Start, gate and supervise all units until stopped.
    Supervise {
        /// Units directory instead of the configured one.
        #[arg(long)]
        units: Option<PathBuf>,
    },
    /// Run an application management command as the service account.
    Manage {
        /// Print the resolved command instead of running it.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        /// Management subcommand (e.g. migrate, createsuperuser).
        subcommand: String,
        /// Arguments passed through to the subcommand.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("DOCKET_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let json = cli.json;
    let config = cli.config;

    let result = match cli.command {
        Commands::Build {
            target,
            root,
            mirror,
            skip_overlay,
            skip_image,
        } => {
            // init and supervise own their signal handling.
            install_signal_handler();
            commands::build::run(
                &config,
                BuildArgs {
                    target,
                    root,
                    mirror,
                    skip_overlay,
                    skip_image,
                },
                json,
            )
        }
        Commands::Resolve { target } => commands::resolve::run(&config, target.as_deref(), json),
        Commands::Verify { root } => commands::verify::run(&config, root.as_deref(), json),
        Commands::Units { units } => units
            .map_or_else(|| commands::load_config(&config).map(|c| c.paths.units_dir), Ok)
            .and_then(|dir| commands::units::run(&dir, json)),
        Commands::Init => commands::init::run(&config),
        Commands::Supervise { units } => commands::supervise::run(&config, units.as_deref(), json),
        Commands::Manage {
            dry_run,
            subcommand,
            args,
        } => commands::manage::run(&config, &subcommand, &args, dry_run, json),
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(err.code)
        }
    }
}
