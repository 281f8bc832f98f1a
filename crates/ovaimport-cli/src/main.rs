//! ovaimport CLI - Import OVA appliances into a HyperCore cluster.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use ovaimport_core::{
    inspect_ova, DiskStatus, HyperCoreClient, ImportJob, ImportOptions, ImportPhase,
    ImportProgress, ServerConfig,
};
use secrecy::SecretString;
use tracing_subscriber::EnvFilter;

/// Import OVA appliances into a HyperCore cluster as new virtual machines.
#[derive(Parser)]
#[command(name = "ovaimport")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Only log warnings and errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Log debug output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Import an OVA archive as a new VM.
    Import {
        /// Path to the OVA archive.
        archive: PathBuf,

        #[command(flatten)]
        server: ServerArgs,

        /// Attach disks with the VIRTIO performance driver instead of IDE.
        #[arg(long)]
        performance_drivers: bool,

        #[command(flatten)]
        work: WorkArgs,

        /// Seconds between task status queries.
        #[arg(long, default_value = "1", value_parser = clap::value_parser!(u64).range(1..))]
        poll_interval_secs: u64,

        /// Seconds to wait for each remote task before giving up.
        #[arg(long, default_value = "300")]
        task_timeout_secs: u64,

        /// Seconds to wait after each upload before attaching the disk.
        #[arg(long, default_value = "90")]
        conversion_wait_secs: u64,
    },

    /// Extract an OVA archive and show its firmware and disks.
    Inspect {
        /// Path to the OVA archive.
        archive: PathBuf,

        #[command(flatten)]
        work: WorkArgs,
    },
}

#[derive(clap::Args)]
struct ServerArgs {
    /// Cluster address, either a host name or a full REST base URL.
    #[arg(short, long)]
    server: String,

    /// Account used for HTTP basic authentication.
    #[arg(short, long)]
    username: String,

    /// Account password.
    #[arg(short, long, env = "OVAIMPORT_PASSWORD", hide_env_values = true)]
    password: String,

    /// Accept self-signed or otherwise invalid TLS certificates.
    #[arg(long)]
    insecure: bool,
}

#[derive(clap::Args)]
struct WorkArgs {
    /// Directory in which the archive is extracted.
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Leave the extracted files in place afterwards.
    #[arg(long)]
    keep_work_dir: bool,

    /// Skip checking the archive manifest digests.
    #[arg(long)]
    no_verify_manifest: bool,
}

impl WorkArgs {
    fn apply(&self, mut options: ImportOptions) -> ImportOptions {
        if let Some(root) = &self.work_dir {
            options = options.with_work_root(root);
        }
        options
            .with_keep_work_dir(self.keep_work_dir)
            .with_verify_manifest(!self.no_verify_manifest)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.quiet, cli.verbose);

    match cli.command {
        Commands::Import {
            archive,
            server,
            performance_drivers,
            work,
            poll_interval_secs,
            task_timeout_secs,
            conversion_wait_secs,
        } => {
            let options = work
                .apply(ImportOptions::default())
                .with_performance_drivers(performance_drivers)
                .with_poll_interval(Duration::from_secs(poll_interval_secs))
                .with_task_timeout(Duration::from_secs(task_timeout_secs))
                .with_conversion_grace(Duration::from_secs(conversion_wait_secs));
            run_import(&archive, server, options, cli.quiet)?;
        }
        Commands::Inspect { archive, work } => {
            show_info(&archive, &work.apply(ImportOptions::default()))?;
        }
    }

    Ok(())
}

fn init_logging(quiet: bool, verbose: bool) {
    let level = if quiet {
        "warn"
    } else if verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_import(
    archive: &Path,
    server: ServerArgs,
    options: ImportOptions,
    quiet: bool,
) -> Result<()> {
    let config = ServerConfig::new(
        &server.server,
        server.username,
        SecretString::from(server.password),
    )
    .with_accept_invalid_certs(server.insecure);
    let client = HyperCoreClient::new(config).context("failed to set up the API client")?;

    if !quiet {
        println!("OVA Import");
        println!("----------");
        println!("Archive:   {}", archive.display());
        println!("Server:    {}", client.endpoint());
        println!(
            "Driver:    {}",
            if options.use_performance_drivers {
                "VIRTIO (performance)"
            } else {
                "IDE"
            }
        );
        println!();
    }

    let spinner = if quiet {
        None
    } else {
        let pb = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")?;
        pb.set_style(style);
        pb.enable_steady_tick(Duration::from_millis(120));
        Some(pb)
    };

    let mut job = ImportJob::new(archive, &client, options);
    if let Some(pb) = spinner.clone() {
        job = job.with_progress(Box::new(move |progress: ImportProgress| {
            pb.set_message(describe(&progress));
        }));
    }

    let outcome = job.run();
    if let Some(pb) = &spinner {
        match &outcome {
            Ok(_) => pb.finish_with_message("Complete!"),
            Err(_) => pb.abandon_with_message("Failed"),
        }
    }

    match outcome {
        Ok(report) => {
            if !quiet {
                println!();
                println!("Import completed successfully");
                println!("VM:        {}", report.vm);
                println!("Firmware:  {}", report.firmware);
                for (i, disk) in report.disks.iter().enumerate() {
                    println!(
                        "  {}. {} -> {}",
                        i + 1,
                        disk.source,
                        disk.block_device_id.as_deref().unwrap_or("-")
                    );
                }
            }
            Ok(())
        }
        Err(err) => {
            if let Some(failure) = job.failure() {
                eprintln!();
                eprintln!("Stage:     {}", failure.stage);
                if let Some(disk) = &failure.disk {
                    eprintln!("Disk:      {}", disk);
                }
                eprintln!("Cause:     {}", failure.cause);
            }
            if let Some(vm) = job.vm() {
                eprintln!("VM {} was created and left in place", vm);
            }
            for result in job.results() {
                if result.status == DiskStatus::Failed {
                    if let Some(orphan) = &result.uploaded_disk_id {
                        eprintln!("Uploaded disk {} ({}) was not attached", orphan, result.source);
                    }
                }
            }
            Err(err.into())
        }
    }
}

fn describe(progress: &ImportProgress) -> String {
    match progress.phase {
        ImportPhase::Extracting => "Extracting archive...".to_string(),
        ImportPhase::Parsing => "Parsing descriptor...".to_string(),
        ImportPhase::Provisioning => "Creating VM...".to_string(),
        ImportPhase::Uploading | ImportPhase::Converting | ImportPhase::Attaching => format!(
            "{} disk {}/{} {}",
            progress.phase,
            progress.current_disk,
            progress.total_disks,
            progress.disk_name.as_deref().unwrap_or_default()
        ),
        ImportPhase::Complete => "Complete!".to_string(),
    }
}

fn show_info(archive: &Path, options: &ImportOptions) -> Result<()> {
    let info = inspect_ova(archive, options)?;

    println!("Appliance Information");
    println!("=====================");
    println!();
    println!("Descriptor: {}", info.descriptor);
    println!("Firmware:   {}", info.firmware);
    println!();

    if info.disks.is_empty() {
        println!("Disks:      None");
    } else {
        println!("Disks:");
        for (i, disk) in info.disks.iter().enumerate() {
            println!(
                "  {}. {} - {}",
                i + 1,
                disk.filename,
                format_bytes(disk.size_bytes)
            );
        }
        println!();
        println!("Total disk size: {}", format_bytes(info.total_disk_size));
    }

    Ok(())
}

/// Format bytes as human-readable string.
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
