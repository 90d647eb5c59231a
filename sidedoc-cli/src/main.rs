use clap::{Parser, Subcommand};
use serde::Serialize;
use sidedoc::{ChangeKind, Container, Package, SyncConfig, SyncReport, Violation, sync, validate};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a package for integrity violations
    Validate {
        package: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Show the manifest and a block summary
    Info { package: PathBuf },
    /// Show what syncing an edited text would change, without writing
    Diff {
        package: PathBuf,
        edited: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Apply an edited text to a package
    Sync {
        package: PathBuf,
        edited: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Serialize)]
struct ValidationOutput<'a> {
    valid: bool,
    violations: &'a [Violation],
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Validate { package, json } => validate_command(package, *json),
        Commands::Info { package } => info_command(package),
        Commands::Diff {
            package,
            edited,
            json,
        } => diff_command(package, edited, *json),
        Commands::Sync {
            package,
            edited,
            json,
        } => sync_command(package, edited, *json),
    }
}

fn fail(err: impl Display) -> ! {
    eprintln!("Error: {err}");
    std::process::exit(1);
}

fn read_package(path: &Path) -> (Package, Container) {
    let package = Package::open(path).unwrap_or_else(|err| fail(err));
    let container = package.read().unwrap_or_else(|err| fail(err));
    (package, container)
}

fn print_json<T: Serialize>(value: &T) {
    let text = serde_json::to_string_pretty(value).unwrap_or_else(|err| fail(err));
    println!("{text}");
}

fn validate_command(path: &Path, json: bool) {
    let (_, container) = read_package(path);
    let violations = validate(&container);

    if json {
        print_json(&ValidationOutput {
            valid: violations.is_empty(),
            violations: &violations,
        });
    } else if violations.is_empty() {
        println!("Package is valid.");
    } else {
        for violation in &violations {
            println!("{violation}");
        }
    }
    if !violations.is_empty() {
        std::process::exit(1);
    }
}

fn info_command(path: &Path) {
    let (_, container) = read_package(path);
    let manifest = &container.manifest;

    let mut kinds: BTreeMap<&str, usize> = BTreeMap::new();
    for block in &container.blocks {
        *kinds.entry(block.kind.type_name()).or_default() += 1;
    }

    println!("Format version: {}", manifest.format_version);
    println!("Source: {}", manifest.source_file);
    println!("Source hash: {}", manifest.source_fingerprint.short(12));
    println!("Content hash: {}", manifest.content_fingerprint.short(12));
    println!("Created: {}", manifest.created_at.to_rfc3339());
    println!("Modified: {}", manifest.modified_at.to_rfc3339());
    println!("Generator: {}", manifest.generator);
    println!("Blocks: {}", container.blocks.len());
    for (kind, count) in kinds {
        println!("  {kind}: {count}");
    }
    println!("Assets: {}", container.assets.len());
}

fn run_sync(path: &Path, edited: &Path) -> (Package, sidedoc::SyncOutcome) {
    let (package, container) = read_package(path);
    let text = fs::read_to_string(edited).unwrap_or_else(|err| fail(err));
    let outcome = sync(&container, &text, &SyncConfig::default()).unwrap_or_else(|err| fail(err));
    (package, outcome)
}

fn change_label(change: ChangeKind) -> &'static str {
    match change {
        ChangeKind::Unchanged => "unchanged",
        ChangeKind::Moved => "moved",
        ChangeKind::Modified => "modified",
        ChangeKind::Restructured => "restructured",
        ChangeKind::Inserted => "inserted",
        ChangeKind::Deleted => "deleted",
        ChangeKind::Split => "split",
        ChangeKind::Merged => "merged",
    }
}

fn print_report(report: &SyncReport) {
    println!(
        "matched {}, modified {}, inserted {}, deleted {}, moved {}, split {}, merged {}",
        report.matched,
        report.modified,
        report.inserted,
        report.deleted,
        report.moved,
        report.split,
        report.merged
    );
    for change in &report.changes {
        if change.change == ChangeKind::Unchanged && change.old_id == change.new_id {
            continue;
        }
        let label = change_label(change.change);
        match (&change.old_id, &change.new_id) {
            (Some(old), Some(new)) if old == new => println!("  {label}: {new}"),
            (Some(old), Some(new)) => println!("  {label}: {old} -> {new}"),
            (Some(old), None) => println!("  {label}: {old}"),
            (None, Some(new)) => println!("  {label}: {new}"),
            (None, None) => {}
        }
    }
    for warning in &report.warnings {
        println!("  warning: {} at byte {}: {}", warning.block_id, warning.offset, warning.detail);
    }
}

fn diff_command(path: &Path, edited: &Path, json: bool) {
    let (_, outcome) = run_sync(path, edited);
    let report = &outcome.report;

    if json {
        print_json(report);
    } else if report.has_changes() {
        print_report(report);
    } else {
        println!("No changes.");
    }
    if report.has_changes() {
        std::process::exit(2);
    }
}

fn sync_command(path: &Path, edited: &Path, json: bool) {
    let (package, outcome) = run_sync(path, edited);
    let report = &outcome.report;

    if report.has_changes() {
        package
            .write(&outcome.container)
            .unwrap_or_else(|err| fail(err));
    }

    if json {
        print_json(report);
    } else if report.has_changes() {
        print_report(report);
        println!("Sync complete: package updated");
    } else {
        println!("Sync complete: no changes");
    }
}
