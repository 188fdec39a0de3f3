use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use layerscan::{
    analyzer,
    cache::DiskCache,
    config::Config,
    imagefmt::{self, ExtractorRegistry, LayerFiles, PrefixMatcher},
    logging,
    matcher::VulnMatcher,
    model::{Component, Severity, Vulnerability},
    nodeinventory::{CachingScanner, HostScanner, NodeInventorizer},
    output::{print_json, table, OutputFormat},
    versionfmt::{self, Parser as _, ParserRegistry},
    vulnmdsrc::{nvd::FeedSynchronizer, AppenderRegistry, NvdAppender},
};
use serde::Serialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Exit codes for CI integration
mod exit_codes {
    pub const SUCCESS: u8 = 0;
    pub const CRITICAL_VULN: u8 = 2;
    pub const HIGH_VULN: u8 = 3;
    pub const MEDIUM_VULN: u8 = 4;
    pub const LOW_VULN: u8 = 5;
    pub const ERROR: u8 = 1;
}

#[derive(Parser)]
#[command(name = "layerscan")]
#[command(
    author,
    version,
    about = "Inventory container layers and hosts, match vulnerabilities, and enrich them with NVD metadata"
)]
struct Cli {
    /// Output format (table, json)
    #[arg(short, long, global = true)]
    format: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inventory the packages installed on this host
    Inventory {
        /// Node name used as the cache key (defaults to the host name)
        #[arg(long)]
        node: Option<String>,

        /// Root of the host filesystem
        #[arg(long)]
        host_root: Option<PathBuf>,

        /// Match the inventory against vulnerability definitions (JSON)
        #[arg(long)]
        definitions: Option<PathBuf>,

        /// Metadata dump directory used to enrich matches
        #[arg(long)]
        dump_dir: Option<PathBuf>,

        /// Exit with error if vulnerabilities at or above this severity are found
        #[arg(long, value_enum)]
        fail_on: Option<FailLevel>,
    },

    /// List the manifest files found in an image layer
    Extract {
        /// Image format of the layer
        #[arg(long, default_value = "docker")]
        image_format: String,

        /// Layer archive (tar or tar.gz)
        #[arg(long)]
        layer: PathBuf,

        /// Extract paths with these prefixes instead of known manifests
        #[arg(long)]
        prefix: Vec<String>,
    },

    /// Match the packages of an image layer against vulnerability definitions
    Match {
        /// Image format of the layer
        #[arg(long, default_value = "docker")]
        image_format: String,

        /// Layer archive (tar or tar.gz)
        #[arg(long)]
        layer: PathBuf,

        /// Vulnerability definitions (JSON)
        #[arg(long)]
        definitions: PathBuf,

        /// Metadata dump directory used to enrich matches
        #[arg(long)]
        dump_dir: Option<PathBuf>,

        /// Exit with error if vulnerabilities at or above this severity are found
        #[arg(long, value_enum)]
        fail_on: Option<FailLevel>,
    },

    /// Show the metadata known for vulnerability identifiers
    Enrich {
        /// Vulnerability identifiers, e.g. CVE-2021-44228
        #[arg(required = true)]
        ids: Vec<String>,

        /// Identifiers aggregated by the vulnerability, used when it has no metadata of its own
        #[arg(long = "sub")]
        sub_ids: Vec<String>,

        /// Metadata dump directory
        #[arg(long)]
        dump_dir: Option<PathBuf>,
    },

    /// Download the NVD feeds into the dump directory
    SyncFeeds {
        /// Metadata dump directory
        #[arg(long)]
        dump_dir: Option<PathBuf>,

        /// Remove the downloaded feeds instead
        #[arg(long)]
        clean: bool,
    },

    /// List the registered image and version formats
    Formats,

    /// Show or create config file
    Config {
        /// Generate default config file
        #[arg(long)]
        init: bool,

        /// Show config file path
        #[arg(long)]
        path: bool,
    },

    /// Clear the persisted inventory
    ClearCache,
}

#[derive(Clone, Copy, ValueEnum)]
enum FailLevel {
    Critical,
    High,
    Medium,
    Low,
}

impl FailLevel {
    fn threshold(self) -> Severity {
        match self {
            FailLevel::Critical => Severity::Critical,
            FailLevel::High => Severity::High,
            FailLevel::Medium => Severity::Medium,
            FailLevel::Low => Severity::Low,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(exit_codes::ERROR)
        }
    }
}

async fn run() -> Result<u8> {
    let cli = Cli::parse();
    let config = Config::load().context("could not load configuration")?;
    logging::init_tracing(&config.log_level, config.log_json)?;

    let format_str = cli.format.unwrap_or_else(|| config.default_format.clone());
    let format = OutputFormat::from_str(&format_str).map_err(|e| anyhow::anyhow!(e))?;

    match cli.command {
        Commands::Inventory {
            node,
            host_root,
            definitions,
            dump_dir,
            fail_on,
        } => {
            let host_root = host_root.unwrap_or_else(|| config.inventory.host_root.clone());
            let node = node.unwrap_or_else(|| host_name(&host_root));
            run_inventory(&config, format, &node, host_root, definitions, dump_dir, fail_on).await
        }
        Commands::Extract {
            image_format,
            layer,
            prefix,
        } => {
            let files = extract_layer(&config, &layer, &image_format, prefix).await?;
            match format {
                OutputFormat::Table => table::print_layer_files(&files),
                OutputFormat::Json => {
                    let paths: Vec<&str> = files.iter().map(|(path, _)| path).collect();
                    print_json(&paths)?;
                }
            }
            Ok(exit_codes::SUCCESS)
        }
        Commands::Match {
            image_format,
            layer,
            definitions,
            dump_dir,
            fail_on,
        } => {
            let files = extract_layer(&config, &layer, &image_format, Vec::new()).await?;
            let analysis = analyzer::analyze(&files);
            let components = filter_components(&config, analysis.components);
            if format == OutputFormat::Table {
                if let Some(namespace) = &analysis.namespace {
                    println!("Operating system: {}", namespace);
                }
                table::print_components(&components);
            }

            let dump_dir = dump_dir.unwrap_or_else(|| config.dump_dir.clone());
            let vulns = match_components(&config, format, &components, &definitions, &dump_dir).await?;
            report_vulnerabilities(format, &components, &vulns)?;
            Ok(determine_exit_code(&vulns, fail_on))
        }
        Commands::Enrich {
            ids,
            sub_ids,
            dump_dir,
        } => {
            let dump_dir = dump_dir.unwrap_or_else(|| config.dump_dir.clone());
            let mut appenders = build_appenders(&config, format, &dump_dir).await?;

            #[derive(Serialize)]
            struct Enriched<'a> {
                id: &'a str,
                enrichments: Vec<layerscan::model::Enrichment>,
            }

            let mut results = Vec::new();
            for id in &ids {
                results.push(Enriched {
                    id,
                    enrichments: appenders.enrich(id, &sub_ids)?,
                });
            }
            appenders.purge_all();

            match format {
                OutputFormat::Table => {
                    for result in &results {
                        table::print_enrichments(result.id, &result.enrichments);
                    }
                }
                OutputFormat::Json => print_json(&results)?,
            }
            Ok(exit_codes::SUCCESS)
        }
        Commands::SyncFeeds { dump_dir, clean } => {
            let dir = dump_dir
                .unwrap_or_else(|| config.dump_dir.clone())
                .join(NvdAppender::DUMP_SUBDIR);
            let synchronizer = config.nvd.synchronizer()?;

            if clean {
                synchronizer.clean(&dir).await?;
                println!("Removed {}.", dir.display());
                return Ok(exit_codes::SUCCESS);
            }

            let progress = spinner(format == OutputFormat::Table, "Synchronizing NVD feeds...");
            let report = synchronizer.sync(&dir).await;
            if let Some(pb) = progress {
                pb.finish_and_clear();
            }
            let report = report?;

            match format {
                OutputFormat::Table => table::print_sync_report(&report),
                OutputFormat::Json => print_json(&report.files)?,
            }
            Ok(exit_codes::SUCCESS)
        }
        Commands::Formats => {
            let extractors = imagefmt::default_registry(config.extract.max_file_size)?;
            let parsers = versionfmt::default_registry()?;
            list_formats(&extractors, &parsers, format)?;
            Ok(exit_codes::SUCCESS)
        }
        Commands::Config { init, path } => {
            handle_config(init, path)?;
            Ok(exit_codes::SUCCESS)
        }
        Commands::ClearCache => {
            let cache = match &config.inventory.cache_path {
                Some(path) => DiskCache::new(path, config.inventory.ttl()),
                None => DiskCache::with_default_path(config.inventory.ttl()),
            };
            cache.clear()?;
            println!("Cache cleared.");
            Ok(exit_codes::SUCCESS)
        }
    }
}

async fn run_inventory(
    config: &Config,
    format: OutputFormat,
    node: &str,
    host_root: PathBuf,
    definitions: Option<PathBuf>,
    dump_dir: Option<PathBuf>,
    fail_on: Option<FailLevel>,
) -> Result<u8> {
    let mut builder = CachingScanner::builder(Arc::new(HostScanner::new(host_root)))
        .ttl(config.inventory.ttl())
        .backoff(config.inventory.backoff_min(), config.inventory.backoff_max());
    if let Some(path) = &config.inventory.cache_path {
        builder = builder.cache_path(path);
    }
    let scanner = builder.build();

    let progress = spinner(format == OutputFormat::Table, "Scanning host packages...");
    let scan = scanner.scan(node).await;
    if let Some(pb) = progress {
        pb.finish_and_clear();
    }
    let mut scan = scan?;
    scan.components = filter_components(config, scan.components);

    let Some(definitions) = definitions else {
        match format {
            OutputFormat::Table => {
                let produced_at = scanner.cached(node).map(|e| e.produced_at);
                table::print_inventory(node, &scan, produced_at);
            }
            OutputFormat::Json => print_json(&scan)?,
        }
        return Ok(exit_codes::SUCCESS);
    };

    let dump_dir = dump_dir.unwrap_or_else(|| config.dump_dir.clone());
    let vulns = match_components(config, format, &scan.components, &definitions, &dump_dir).await?;
    if format == OutputFormat::Table {
        table::print_inventory(node, &scan, scanner.cached(node).map(|e| e.produced_at));
    }
    report_vulnerabilities(format, &scan.components, &vulns)?;
    Ok(determine_exit_code(&vulns, fail_on))
}

/// Reads the files of interest out of a layer archive.
async fn extract_layer(
    config: &Config,
    layer: &Path,
    image_format: &str,
    prefixes: Vec<String>,
) -> Result<LayerFiles> {
    let registry = imagefmt::default_registry(config.extract.max_file_size)?;
    let file = File::open(layer).with_context(|| format!("could not open {}", layer.display()))?;
    let image_format = image_format.to_string();

    let files = tokio::task::spawn_blocking(move || {
        if prefixes.is_empty() {
            registry.extract_from_reader(file, &image_format, &analyzer::manifest_matcher())
        } else {
            registry.extract_from_reader(file, &image_format, &PrefixMatcher::new(prefixes))
        }
    })
    .await??;

    info!(layer = %layer.display(), files = files.len(), "extracted layer");
    Ok(files)
}

fn filter_components(config: &Config, components: Vec<Component>) -> Vec<Component> {
    components
        .into_iter()
        .filter(|c| !config.ignore.should_ignore_package(&c.name))
        .collect()
}

/// Builds every metadata appender over `dump_dir`.
async fn build_appenders(config: &Config, format: OutputFormat, dump_dir: &Path) -> Result<AppenderRegistry> {
    let nvd = if config.nvd.sync_feeds {
        NvdAppender::with_feed(config.nvd.synchronizer()?)
    } else {
        NvdAppender::new()
    };

    let mut appenders = AppenderRegistry::new();
    appenders.register(NvdAppender::NAME, Box::new(nvd))?;

    let progress = spinner(format == OutputFormat::Table, "Loading vulnerability metadata...");
    let built = appenders.build_all(dump_dir).await;
    if let Some(pb) = progress {
        pb.finish_and_clear();
    }
    built.with_context(|| format!("could not load metadata from {}", dump_dir.display()))?;
    Ok(appenders)
}

async fn match_components(
    config: &Config,
    format: OutputFormat,
    components: &[Component],
    definitions: &Path,
    dump_dir: &Path,
) -> Result<Vec<Vulnerability>> {
    let parsers = versionfmt::default_registry()?;
    let mut appenders = build_appenders(config, format, dump_dir).await?;
    let definitions = VulnMatcher::load_definitions(definitions)?;

    let matcher = VulnMatcher::new(&parsers, &appenders, definitions);
    let vulns: Vec<Vulnerability> = matcher
        .match_components(components)?
        .into_iter()
        .filter(|v| !config.ignore.should_ignore_vulnerability(&v.id))
        .collect();

    appenders.purge_all();
    Ok(vulns)
}

fn report_vulnerabilities(format: OutputFormat, components: &[Component], vulns: &[Vulnerability]) -> Result<()> {
    match format {
        OutputFormat::Table => table::print_vulnerabilities(vulns),
        OutputFormat::Json => {
            #[derive(Serialize)]
            struct Report<'a> {
                components: &'a [Component],
                vulnerabilities: &'a [Vulnerability],
            }
            print_json(&Report {
                components,
                vulnerabilities: vulns,
            })?;
        }
    }
    Ok(())
}

fn spinner(interactive: bool, message: &'static str) -> Option<ProgressBar> {
    if !interactive {
        return None;
    }
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        pb.set_style(style);
    }
    pb.enable_steady_tick(Duration::from_millis(100));
    pb.set_message(message);
    Some(pb)
}

/// Reads the host name from the host root, falling back to `localhost`.
fn host_name(host_root: &Path) -> String {
    match std::fs::read_to_string(host_root.join("etc/hostname")) {
        Ok(name) if !name.trim().is_empty() => name.trim().to_string(),
        _ => {
            warn!("could not determine host name, using localhost");
            "localhost".to_string()
        }
    }
}

/// Determine the exit code based on vulnerabilities found and --fail-on setting
fn determine_exit_code(vulns: &[Vulnerability], fail_on: Option<FailLevel>) -> u8 {
    let Some(fail_on) = fail_on else {
        return exit_codes::SUCCESS;
    };

    let worst = vulns.iter().map(|v| v.severity).max().unwrap_or(Severity::Unknown);
    if worst < fail_on.threshold() {
        return exit_codes::SUCCESS;
    }

    match worst {
        Severity::Critical => exit_codes::CRITICAL_VULN,
        Severity::High => exit_codes::HIGH_VULN,
        Severity::Medium => exit_codes::MEDIUM_VULN,
        _ => exit_codes::LOW_VULN,
    }
}

fn list_formats(extractors: &ExtractorRegistry, parsers: &ParserRegistry, format: OutputFormat) -> Result<()> {
    let image_formats = extractors.names();
    let version_formats: Vec<(String, Vec<String>)> = parsers
        .names()
        .into_iter()
        .map(|name| {
            let namespaces = parsers
                .parser(&name)
                .map(|p| p.namespaces())
                .unwrap_or_default();
            (name, namespaces)
        })
        .collect();

    match format {
        OutputFormat::Table => table::print_formats(&image_formats, &version_formats),
        OutputFormat::Json => {
            #[derive(Serialize)]
            struct Formats {
                image: Vec<String>,
                version: Vec<(String, Vec<String>)>,
            }
            print_json(&Formats {
                image: image_formats,
                version: version_formats,
            })?;
        }
    }
    Ok(())
}

fn handle_config(init: bool, show_path: bool) -> Result<()> {
    let config_path = Config::config_path();

    if show_path {
        println!("{}", config_path.display());
        return Ok(());
    }

    if init {
        if config_path.exists() {
            println!("Config file already exists at: {}", config_path.display());
            return Ok(());
        }

        let config = Config::default();
        config.save()?;
        println!("Created config file at: {}", config_path.display());
        println!();
        println!("Default configuration:");
        println!("{}", Config::generate_default_config());
        return Ok(());
    }

    // Show current config
    if config_path.exists() {
        let content = std::fs::read_to_string(&config_path)?;
        println!("Config file: {}", config_path.display());
        println!();
        println!("{}", content);
    } else {
        println!("No config file found.");
        println!("Run 'layerscan config --init' to create one.");
        println!();
        println!("Config path: {}", config_path.display());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vuln(severity: Severity) -> Vulnerability {
        Vulnerability {
            id: "CVE-2024-0001".to_string(),
            package: "bash".to_string(),
            version: "5.2-1".to_string(),
            namespace: None,
            fixed_by: None,
            severity,
            enrichments: Vec::new(),
        }
    }

    #[test]
    fn test_exit_code_without_fail_on() {
        assert_eq!(determine_exit_code(&[vuln(Severity::Critical)], None), exit_codes::SUCCESS);
    }

    #[test]
    fn test_exit_code_thresholds() {
        let vulns = [vuln(Severity::Medium), vuln(Severity::Low)];
        assert_eq!(determine_exit_code(&vulns, Some(FailLevel::High)), exit_codes::SUCCESS);
        assert_eq!(determine_exit_code(&vulns, Some(FailLevel::Medium)), exit_codes::MEDIUM_VULN);
        assert_eq!(determine_exit_code(&vulns, Some(FailLevel::Low)), exit_codes::MEDIUM_VULN);

        let critical = [vuln(Severity::Critical)];
        assert_eq!(determine_exit_code(&critical, Some(FailLevel::Low)), exit_codes::CRITICAL_VULN);
        assert_eq!(determine_exit_code(&[], Some(FailLevel::Low)), exit_codes::SUCCESS);
    }
}
