//! CLI subcommands: validate, expand, list, inventory, boot, status.

use crate::core::expander::{ProcessEnv, UndefinedEnv};
use crate::core::loader;
use crate::core::model::Cluster;
use crate::{inventory, provision, state};
use clap::Subcommand;
use std::path::{Path, PathBuf};

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Load and check a cluster specification end to end
    Validate {
        /// Path to the cluster specification
        file: PathBuf,
    },

    /// Print the rewritten document after directive expansion
    Expand {
        /// Path to the cluster specification
        file: PathBuf,

        /// Substitute empty strings for unset environment variables
        #[arg(long)]
        allow_unset_env: bool,
    },

    /// List the hostnames a specification expands to
    List {
        /// Path to the cluster specification
        file: PathBuf,
    },

    /// Render the grouped inventory
    Inventory {
        /// Load the cluster from a specification instead of the state store
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        /// Inventory format: ini or json
        #[arg(short = 'F', long, default_value = "ini")]
        format: String,

        /// Output path, `-` for stdout
        #[arg(short, long, default_value = "-")]
        output: String,
    },

    /// Boot the cluster's machines and persist their state
    Boot {
        /// Path to the cluster specification
        file: PathBuf,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        /// Allocate placeholder addresses instead of calling a cloud
        #[arg(long)]
        dry_run: bool,
    },

    /// Show what the state store holds
    Status {
        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,
    },
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<(), String> {
    match cmd {
        Commands::Validate { file } => cmd_validate(&file),
        Commands::Expand {
            file,
            allow_unset_env,
        } => cmd_expand(&file, allow_unset_env),
        Commands::List { file } => cmd_list(&file),
        Commands::Inventory {
            file,
            state_dir,
            format,
            output,
        } => cmd_inventory(file.as_deref(), &state_dir, &format, &output),
        Commands::Boot {
            file,
            state_dir,
            dry_run,
        } => cmd_boot(&file, &state_dir, dry_run),
        Commands::Status { state_dir } => cmd_status(&state_dir),
    }
}

fn read_spec(file: &Path) -> Result<String, String> {
    std::fs::read_to_string(file).map_err(|e| format!("cannot read {}: {}", file.display(), e))
}

fn load_cluster(file: &Path) -> Result<Cluster, String> {
    let text = read_spec(file)?;
    loader::load(&text, &ProcessEnv, UndefinedEnv::Error).map_err(|e| e.to_string())
}

fn cmd_validate(file: &Path) -> Result<(), String> {
    let cluster = load_cluster(file)?;
    println!(
        "OK: {} machines, {} services, cloud: {}",
        cluster.machines.len(),
        cluster.services.len(),
        cluster.cloud.as_deref().unwrap_or("(none)")
    );
    Ok(())
}

fn cmd_expand(file: &Path, allow_unset_env: bool) -> Result<(), String> {
    let text = read_spec(file)?;
    let policy = if allow_unset_env {
        UndefinedEnv::EmptyString
    } else {
        UndefinedEnv::Error
    };
    let provisional = loader::phase1(&text).map_err(|e| e.to_string())?;
    let rewritten =
        loader::rewrite(&text, &provisional, &ProcessEnv, policy).map_err(|e| e.to_string())?;
    print!("{}", rewritten);
    Ok(())
}

fn cmd_list(file: &Path) -> Result<(), String> {
    let cluster = load_cluster(file)?;
    for machine in &cluster.machines {
        println!("{}", machine.name);
    }
    Ok(())
}

fn cmd_inventory(
    file: Option<&Path>,
    state_dir: &Path,
    format: &str,
    output: &str,
) -> Result<(), String> {
    let cluster = match file {
        Some(file) => load_cluster(file)?,
        None => state::load_cluster(state_dir)?
            .ok_or("no cluster stored; boot first or pass --file")?,
    };

    let text = match format {
        "ini" => inventory::ini(&cluster),
        "json" => inventory::json(&cluster)?,
        other => return Err(format!("unsupported inventory format `{}`", other)),
    };

    if output == "-" {
        print!("{}", text);
    } else {
        std::fs::write(output, text).map_err(|e| format!("cannot write {}: {}", output, e))?;
    }
    Ok(())
}

fn cmd_boot(file: &Path, state_dir: &Path, dry_run: bool) -> Result<(), String> {
    if !dry_run {
        return Err("no cloud driver is built in; run with --dry-run".to_string());
    }
    let mut cluster = load_cluster(file)?;
    let mut driver = provision::DryRunDriver::default();
    let booted = provision::boot_cluster(&mut cluster, &mut driver, state_dir)?;
    println!(
        "Booted {} machine(s), {} recovered from state.",
        booted,
        cluster.machines.len() - booted
    );
    Ok(())
}

fn cmd_status(state_dir: &Path) -> Result<(), String> {
    let Some(cluster) = state::load_cluster(state_dir)? else {
        println!("No cluster stored in {}.", state_dir.display());
        return Ok(());
    };
    println!("{} machine(s):", cluster.machines.len());
    for machine in &cluster.machines {
        println!(
            "  {} internal={} external={}",
            machine.name,
            machine.address.internal.as_deref().unwrap_or("-"),
            machine.address.external.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}
