use crate::imagefmt::LayerFiles;
use crate::model::{Component, Enrichment, Severity, Vulnerability};
use crate::nodeinventory::InventoryScan;
use crate::vulnmdsrc::nvd::SyncReport;
use chrono::{DateTime, Utc};
use tabled::{settings::Style, Table, Tabled};

#[derive(Tabled)]
struct ComponentRow {
    #[tabled(rename = "Source")]
    source: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Version")]
    version: String,
    #[tabled(rename = "Namespace")]
    namespace: String,
}

#[derive(Tabled)]
struct VulnRow {
    #[tabled(rename = "Severity")]
    severity: String,
    #[tabled(rename = "Package")]
    package: String,
    #[tabled(rename = "Version")]
    version: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Fixed In")]
    fixed_in: String,
}

#[derive(Tabled)]
struct EnrichmentRow {
    #[tabled(rename = "Source")]
    source: String,
    #[tabled(rename = "Severity")]
    severity: String,
    #[tabled(rename = "CVSS v3")]
    cvss_v3: String,
    #[tabled(rename = "CVSS v2")]
    cvss_v2: String,
    #[tabled(rename = "Summary")]
    summary: String,
}

#[derive(Tabled)]
struct FileRow {
    #[tabled(rename = "Path")]
    path: String,
    #[tabled(rename = "Size")]
    size: String,
}

#[derive(Tabled)]
struct FormatRow {
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Namespaces")]
    namespaces: String,
}

fn print_table<T: Tabled>(rows: Vec<T>) {
    let table = Table::new(rows).with(Style::rounded()).to_string();
    println!("{}", table);
}

fn component_rows(components: &[Component]) -> Vec<ComponentRow> {
    components
        .iter()
        .map(|c| ComponentRow {
            source: c.source_type.display_name().to_string(),
            name: truncate(&c.name, 40),
            version: format_version(&c.version),
            namespace: c.namespace.clone().unwrap_or_else(|| "-".to_string()),
        })
        .collect()
}

pub fn print_inventory(node: &str, scan: &InventoryScan, produced_at: Option<DateTime<Utc>>) {
    println!();
    match produced_at {
        Some(at) => println!(
            "Inventory of {} (scanned at {})",
            node,
            at.format("%Y-%m-%d %H:%M:%S UTC")
        ),
        None => println!("Inventory of {}", node),
    }
    if let Some(namespace) = &scan.namespace {
        println!("Operating system: {}", namespace);
    }
    println!();

    if scan.components.is_empty() {
        println!("No components found.");
    } else {
        println!("Found {} components:", scan.components.len());
        println!();
        print_table(component_rows(&scan.components));
    }

    for note in &scan.notes {
        println!("\x1b[33mnote:\x1b[0m {}", note);
    }
}

pub fn print_layer_files(files: &LayerFiles) {
    println!();
    if files.is_empty() {
        println!("No matching files in layer.");
        return;
    }
    println!("Extracted {} files:", files.len());
    println!();
    let rows: Vec<FileRow> = files
        .iter()
        .map(|(path, contents)| FileRow {
            path: truncate(path, 80),
            size: format_size(contents.len() as u64),
        })
        .collect();
    print_table(rows);
}

pub fn print_components(components: &[Component]) {
    if components.is_empty() {
        println!("No components found.");
        return;
    }
    println!("Found {} components:", components.len());
    println!();
    print_table(component_rows(components));
}

pub fn print_vulnerabilities(vulnerabilities: &[Vulnerability]) {
    println!();
    if vulnerabilities.is_empty() {
        println!("No vulnerabilities found.");
        return;
    }
    println!("Found {} vulnerabilities:", vulnerabilities.len());
    println!();

    let mut vulns: Vec<&Vulnerability> = vulnerabilities.iter().collect();
    vulns.sort_by(|a, b| b.severity.cmp(&a.severity).then_with(|| a.id.cmp(&b.id)));

    let rows: Vec<VulnRow> = vulns
        .iter()
        .map(|v| VulnRow {
            severity: format_severity(&v.severity),
            package: truncate(&v.package, 30),
            version: v.version.clone(),
            id: v.id.clone(),
            fixed_in: v.fixed_by.clone().unwrap_or_else(|| "-".to_string()),
        })
        .collect();
    print_table(rows);

    print_summary(vulnerabilities);
}

pub fn print_enrichments(id: &str, enrichments: &[Enrichment]) {
    println!();
    if enrichments.is_empty() {
        println!("No metadata for {}.", id);
        return;
    }
    println!("Metadata for {}:", id);
    println!();

    let score = |e: &Enrichment, key: &str| {
        e.metadata
            .get(key)
            .and_then(|c| c.get("score"))
            .and_then(|s| s.as_f64())
            .filter(|s| *s > 0.0)
            .map(|s| format!("{:.1}", s))
            .unwrap_or_else(|| "-".to_string())
    };

    let rows: Vec<EnrichmentRow> = enrichments
        .iter()
        .map(|e| EnrichmentRow {
            source: e.source.clone(),
            severity: format_severity(&e.severity),
            cvss_v3: score(e, "cvssv3"),
            cvss_v2: score(e, "cvssv2"),
            summary: truncate(&e.summary, 60),
        })
        .collect();
    print_table(rows);
}

pub fn print_formats(extractors: &[String], parsers: &[(String, Vec<String>)]) {
    let rows: Vec<FormatRow> = extractors
        .iter()
        .map(|name| FormatRow {
            kind: "image".to_string(),
            name: name.clone(),
            namespaces: "-".to_string(),
        })
        .chain(parsers.iter().map(|(name, namespaces)| FormatRow {
            kind: "version".to_string(),
            name: name.clone(),
            namespaces: namespaces.join(", "),
        }))
        .collect();
    print_table(rows);
}

pub fn print_sync_report(report: &SyncReport) {
    println!();
    println!(
        "Synchronized {} feeds ({} downloaded, {} up to date).",
        report.files.len(),
        report.downloaded,
        report.reused
    );
    for (year, reason) in &report.failures {
        println!("\x1b[31mfailed:\x1b[0m {} - {}", year, reason);
    }
}

fn print_summary(vulnerabilities: &[Vulnerability]) {
    let count = |severity: Severity| vulnerabilities.iter().filter(|v| v.severity == severity).count();

    println!();
    println!(
        "Summary: {} critical, {} high, {} medium, {} low, {} negligible, {} unknown",
        count(Severity::Critical),
        count(Severity::High),
        count(Severity::Medium),
        count(Severity::Low),
        count(Severity::Negligible),
        count(Severity::Unknown)
    );
}

fn format_severity(severity: &Severity) -> String {
    match severity {
        Severity::Critical => "\x1b[31mCRITICAL\x1b[0m".to_string(),
        Severity::High => "\x1b[91mHIGH\x1b[0m".to_string(),
        Severity::Medium => "\x1b[33mMEDIUM\x1b[0m".to_string(),
        Severity::Low => "\x1b[32mLOW\x1b[0m".to_string(),
        Severity::Negligible => "NEGLIGIBLE".to_string(),
        Severity::Unknown => "UNKNOWN".to_string(),
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

fn format_version(version: &str) -> String {
    if version.is_empty() {
        "-".to_string()
    } else {
        version.to_string()
    }
}

fn format_size(bytes: u64) -> String {
    match bytes {
        b if b < 1024 => format!("{} B", b),
        b if b < 1024 * 1024 => format!("{:.1} KiB", b as f64 / 1024.0),
        b => format!("{:.1} MiB", b as f64 / (1024.0 * 1024.0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("openssl", 40), "openssl");
        assert_eq!(truncate("abcdefghij", 8), "abcde...");
        // Multi-byte characters are never split.
        assert_eq!(truncate("ééééééé", 5), "éé...");
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KiB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0 MiB");
    }

    #[test]
    fn test_format_severity_colors_high_bands() {
        assert!(format_severity(&Severity::Critical).contains("CRITICAL"));
        assert_eq!(format_severity(&Severity::Negligible), "NEGLIGIBLE");
        assert_eq!(format_version(""), "-");
    }
}
