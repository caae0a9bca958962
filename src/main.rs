use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use selfpatch::download::format_bytes;
use selfpatch::{logging, package, patch, util};
use selfpatch::{Progress, UpdateOrchestrator, UpdateRequest, UpdaterConfig, Verifier};

#[derive(Parser)]
#[command(name = "selfpatch", about = "Self-updating binary patch applier")]
struct Cli {
    /// Debug-level logging (RUST_LOG overrides)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a diff artifact and update an executable in place
    Update {
        /// URL of the diff artifact (http, https or file)
        #[arg(long)]
        url: String,
        /// Version the patch produces
        #[arg(long = "version")]
        target_version: String,
        /// Version currently installed; checked against the manifest
        #[arg(long)]
        current_version: Option<String>,
        /// Executable to update (defaults to this program)
        #[arg(long)]
        exe: Option<PathBuf>,
        /// Do not start the updated executable afterwards
        #[arg(long)]
        no_relaunch: bool,
        /// Connect timeout in seconds
        #[arg(long, default_value_t = 15)]
        connect_timeout: u64,
        /// Read timeout in seconds
        #[arg(long, default_value_t = 300)]
        read_timeout: u64,
        /// Seconds the relauncher waits for this process to exit
        #[arg(long, default_value_t = 2)]
        grace: u64,
    },
    /// Rebuild a binary from a base file and a diff package
    Apply {
        /// Base binary the diff was made against
        #[arg(long)]
        base: PathBuf,
        /// Diff package: a zip archive or an extracted directory
        #[arg(long, short)]
        package: PathBuf,
        /// Output path for the rebuilt binary
        #[arg(long, short)]
        output: PathBuf,
    },
    /// Check a binary against a target version
    Verify {
        /// Binary to check
        #[arg(long)]
        file: PathBuf,
        /// Expected version, e.g. 1.4.0
        #[arg(long = "version")]
        target_version: String,
        /// Expected BLAKE3 hash (hex)
        #[arg(long = "blake3")]
        blake3_hex: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);

    match cli.command {
        Commands::Update {
            url,
            target_version,
            current_version,
            exe,
            no_relaunch,
            connect_timeout,
            read_timeout,
            grace,
        } => {
            let config = UpdaterConfig {
                connect_timeout: Duration::from_secs(connect_timeout),
                read_timeout: Duration::from_secs(read_timeout),
                relaunch: !no_relaunch,
                relaunch_grace: Duration::from_secs(grace),
                ..UpdaterConfig::default()
            };
            let orchestrator = match exe {
                Some(path) => UpdateOrchestrator::new(path, config),
                None => UpdateOrchestrator::for_current_exe(config)?,
            };
            let mut orchestrator = orchestrator.with_progress(Box::new(|p: &Progress| {
                println!("  [{:>3.0}%] {}: {}", p.fraction * 100.0, p.status, p.detail);
            }));

            let cancel = orchestrator.cancel_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            });

            println!("Updating...");
            println!("  Executable: {}", orchestrator.exe_path().display());
            println!("  Source: {}", url);
            println!("  Target version: {}", target_version);

            let request = UpdateRequest {
                url,
                target_version,
                current_version,
            };
            let start = Instant::now();
            let outcome = tokio::task::spawn_blocking(move || orchestrator.run(&request))
                .await
                .context("Update worker panicked")?;
            let elapsed = start.elapsed();

            match outcome {
                Ok(report) if report.success => {
                    println!("\nUpdate applied successfully!");
                    println!("  {}", report.detail);
                    if let Some(script) = &report.relaunch_script {
                        println!("  Relauncher: {}", script.display());
                    }
                    println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
                }
                Ok(report) => {
                    eprintln!("\nUpdate did not happen ({:?}): {}", report.state, report.detail);
                    std::process::exit(1);
                }
                Err(e) if e.is_fatal() => {
                    eprintln!("\nFATAL: {e}");
                    eprintln!("Restore the executable from the backup file manually.");
                    std::process::exit(2);
                }
                Err(e) => {
                    eprintln!("\nUpdate refused: {e}");
                    std::process::exit(1);
                }
            }
        }
        Commands::Apply {
            base,
            package: package_path,
            output,
        } => {
            println!("Applying patch...");
            println!("  Base: {}", base.display());
            println!("  Package: {}", package_path.display());
            println!("  Output: {}", output.display());

            let start = Instant::now();
            let (chunks, bytes) = tokio::task::spawn_blocking(move || -> Result<(usize, usize)> {
                let scratch = tempfile::tempdir().context("Failed to create scratch directory")?;
                let package = package::open_package(&package_path, scratch.path())?;
                let image = {
                    let base_data = util::mmap_file(&base)?;
                    patch::apply(&base_data, &package.manifest, &package.root)?
                };
                std::fs::write(&output, &image)
                    .with_context(|| format!("Failed to write output: {}", output.display()))?;
                Ok((package.manifest.chunks.len(), image.len()))
            })
            .await??;
            let elapsed = start.elapsed();

            println!("\nPatch applied successfully!");
            println!("  Chunks: {}", chunks);
            println!("  Output size: {}", format_bytes(bytes as u64));
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
        Commands::Verify {
            file,
            target_version,
            blake3_hex,
        } => {
            let expected = blake3_hex
                .map(|hex| blake3::Hash::from_hex(hex.trim()).map(|h| *h.as_bytes()))
                .transpose()
                .context("Invalid --blake3 value")?;
            let verifier = Verifier::new(&target_version).with_expected_hash(expected);
            match verifier.check(&file) {
                Ok(()) => println!("OK: {} matches {}", file.display(), target_version),
                Err(e) => {
                    eprintln!("FAILED: {e}");
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}
