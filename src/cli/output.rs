//! Output formatting for CLI

use std::path::Path;

use profile_extraction::{CommittedTable, Diagnostic, DiagnosticLevel, Stage};

/// One line per finished stage
pub fn format_stage(stage: &Stage) -> String {
    format!(
        "  {:<20} {}  {} artifact(s)",
        stage.stage_type.name(),
        stage.stage_id,
        stage.produced_artifacts.len()
    )
}

/// Exported tables with their row counts
pub fn format_outputs(root: &Path, tables: &[CommittedTable]) -> String {
    let mut output = format!("\nExported {} table(s):\n", tables.len());
    for table in tables {
        output.push_str(&format!(
            "  - {} ({} rows): {}\n",
            table.table,
            table.row_count,
            root.join(&table.data).display()
        ));
    }
    output
}

/// Diagnostics grouped by level, most severe first
pub fn format_diagnostics(diagnostics: &[Diagnostic]) -> String {
    if diagnostics.is_empty() {
        return "\nNo diagnostics\n".to_string();
    }
    let mut output = format!("\n{} diagnostic(s):\n", diagnostics.len());
    for level in [
        DiagnosticLevel::Error,
        DiagnosticLevel::Warning,
        DiagnosticLevel::Info,
    ] {
        for diagnostic in diagnostics.iter().filter(|d| d.level == level) {
            let marker = match level {
                DiagnosticLevel::Error => "error",
                DiagnosticLevel::Warning => "warn",
                DiagnosticLevel::Info => "info",
            };
            output.push_str(&format!(
                "  [{marker}] {} {}: {}\n",
                diagnostic.stage_type, diagnostic.subject, diagnostic.message
            ));
        }
    }
    output
}
