//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::apply::ApplyReport;
use crate::graph::{GraphHasher, PropertyValue, ResourceGraph, ResourceKind, ValidationIssue};
use crate::planner::{ChangePlan, DiffResult, FailureCause, Operation, OperationType};
use crate::state::{AppliedState, LockInfo};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Validation issue row for table display.
#[derive(Tabled)]
struct IssueRow {
    #[tabled(rename = "Resource")]
    id: String,
    #[tabled(rename = "Property")]
    property: String,
    #[tabled(rename = "Code")]
    code: String,
    #[tabled(rename = "Message")]
    message: String,
}

/// Graph node row for table display.
#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Resource")]
    id: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Depends on")]
    depends_on: String,
}

/// Plan operation row for table display.
#[derive(Tabled)]
struct OperationRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Operation")]
    operation: String,
    #[tabled(rename = "Resource")]
    id: String,
    #[tabled(rename = "Kind")]
    kind: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats validation issues.
    #[must_use]
    pub fn format_issues(&self, issues: &[ValidationIssue]) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(issues).unwrap_or_default(),
            OutputFormat::Text => {
                if issues.is_empty() {
                    return format!("{} Stack is valid.\n", "✓".green());
                }

                let rows: Vec<IssueRow> = issues
                    .iter()
                    .map(|issue| IssueRow {
                        id: issue.id.clone(),
                        property: issue.property.clone().unwrap_or_default(),
                        code: issue.code.to_string().red().to_string(),
                        message: Self::truncate(&issue.message, 60),
                    })
                    .collect();

                format!(
                    "{} {} issue(s) found:\n\n{}\n",
                    "✗".red(),
                    issues.len(),
                    Table::new(rows)
                )
            }
        }
    }

    /// Formats a resource graph in apply order.
    #[must_use]
    pub fn format_graph(&self, graph: &ResourceGraph) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&GraphJson::from(graph))
                .unwrap_or_default(),
            OutputFormat::Text => {
                if graph.is_empty() {
                    return String::from("   No resources declared.\n");
                }

                let rows: Vec<ResourceRow> = graph
                    .topological_order()
                    .into_iter()
                    .enumerate()
                    .map(|(i, decl)| ResourceRow {
                        index: i + 1,
                        id: decl.id.clone(),
                        kind: decl.kind.to_string(),
                        depends_on: graph.dependencies(&decl.id).join(", "),
                    })
                    .collect();

                let mut output = format!("\nResource graph ({} resources)\n\n", graph.len());
                output.push_str(&Table::new(rows).to_string());

                let counts: Vec<String> = ResourceKind::ALL
                    .into_iter()
                    .filter_map(|kind| {
                        let count = graph.declarations().iter().filter(|d| d.kind == kind).count();
                        (count > 0).then(|| format!("{count} {kind}"))
                    })
                    .collect();
                let _ = write!(output, "\n\n   Kinds: {}", counts.join(", "));
                let _ = write!(
                    output,
                    "\n   Graph hash: {}\n",
                    GraphHasher::short_hash(&GraphHasher::new().hash_graph(graph))
                );
                output
            }
        }
    }

    /// Formats a change plan, with property-level changes if `diff` is given.
    #[must_use]
    pub fn format_plan(&self, plan: &ChangePlan, diff: Option<&DiffResult>) -> String {
        match self.format {
            OutputFormat::Json => {
                serde_json::to_string_pretty(&plan.operations).unwrap_or_default()
            }
            OutputFormat::Text => Self::format_plan_text(plan, diff),
        }
    }

    fn format_plan_text(plan: &ChangePlan, diff: Option<&DiffResult>) -> String {
        if plan.is_empty() {
            return format!(
                "{} No changes required - stack '{}' is up to date.\n",
                "✓".green(),
                plan.stack
            );
        }

        let mut output = format!("\nChange plan for stack '{}'\n", plan.stack);
        let _ = writeln!(
            output,
            "   Graph hash: {}",
            GraphHasher::short_hash(&plan.graph_hash)
        );
        match plan.base_revision {
            Some(revision) => {
                let _ = writeln!(output, "   Against revision: {revision}\n");
            }
            None => output.push_str("   Against: no applied state\n\n"),
        }

        let rows: Vec<OperationRow> = plan
            .operations
            .iter()
            .enumerate()
            .map(|(i, op)| OperationRow {
                index: i + 1,
                operation: Self::format_operation_type(op.operation),
                id: op.id.clone(),
                kind: op.kind.to_string(),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if let Some(diff) = diff {
            let updates: Vec<_> = diff
                .actionable_diffs()
                .into_iter()
                .filter(|d| !d.details.is_empty())
                .collect();
            if !updates.is_empty() {
                output.push_str("\nChanged properties:\n");
                for resource in updates {
                    for detail in &resource.details {
                        let _ = writeln!(
                            output,
                            "   ~ {}.{}: {} -> {}",
                            resource.id,
                            detail.property,
                            Self::format_value(detail.old_value.as_ref()),
                            Self::format_value(detail.new_value.as_ref())
                        );
                    }
                }
            }
        }

        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to delete\n",
            plan.create_count().to_string().green(),
            plan.update_count().to_string().yellow(),
            plan.delete_count().to_string().red()
        );

        output
    }

    /// Formats the outcome of an apply or destroy run.
    #[must_use]
    pub fn format_report(&self, report: &ApplyReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&ReportJson::from(report))
                .unwrap_or_default(),
            OutputFormat::Text => {
                let execution = &report.execution;
                let mut output = if report.plan.is_empty() {
                    format!("{} Nothing to apply.\n", "✓".green())
                } else if execution.is_success() {
                    format!(
                        "{} Applied {} operation(s).\n",
                        "✓".green(),
                        execution.completed.len()
                    )
                } else {
                    format!("{} Apply stopped: {execution}\n", "✗".red())
                };

                for op in &execution.completed {
                    let _ = writeln!(output, "   {} {}", "✓".green(), op.label());
                }
                if let Some(failure) = &execution.failure {
                    let reason = match &failure.cause {
                        FailureCause::Backend(e) => e.to_string(),
                        FailureCause::Cancelled => String::from("cancelled"),
                    };
                    let _ = writeln!(
                        output,
                        "   {} {} ({reason})",
                        "✗".red(),
                        failure.operation.label()
                    );
                }
                for op in &execution.not_attempted {
                    let _ = writeln!(output, "   {} {}", "-".dimmed(), op.label().dimmed());
                }

                if let Some(revision) = report.revision {
                    let _ = writeln!(output, "\n   State revision: {revision}");
                }
                output
            }
        }
    }

    /// Formats applied state.
    #[must_use]
    pub fn format_state(&self, state: &AppliedState, lock: Option<&LockInfo>) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(state).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = format!("\nState: {}\n\n", state.stack);

                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(output, "   Revision: {}", state.revision);
                let _ = writeln!(
                    output,
                    "   Graph hash: {}",
                    GraphHasher::short_hash(&state.graph_hash)
                );
                let _ = writeln!(output, "   Applied at: {}", state.applied_at);
                let _ = writeln!(output, "   Resources: {}", state.resources.len());

                match lock {
                    Some(lock) if !lock.is_expired() => {
                        let _ = writeln!(
                            output,
                            "   Lock: {} held by {} ({}s left)",
                            lock.lock_id,
                            lock.holder,
                            lock.remaining_secs()
                        );
                    }
                    Some(lock) => {
                        let _ = writeln!(output, "   Lock: {} (expired)", lock.lock_id);
                    }
                    None => {}
                }

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓".green() } else { "✗".red() };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} r{} ({})",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.revision,
                            entry.resources.join(", ")
                        );
                    }
                }

                output
            }
        }
    }

    /// Formats an operation type with color.
    fn format_operation_type(operation: OperationType) -> String {
        match operation {
            OperationType::Create => "+create".green().to_string(),
            OperationType::Update => "~update".yellow().to_string(),
            OperationType::Delete => "-delete".red().to_string(),
        }
    }

    fn format_value(value: Option<&PropertyValue>) -> String {
        value.map_or_else(|| "(none)".dimmed().to_string(), ToString::to_string)
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{head}...")
        }
    }
}

// JSON serialization helpers

#[derive(serde::Serialize)]
struct GraphJson<'a> {
    graph_hash: String,
    order: Vec<&'a str>,
    edges: Vec<crate::graph::Edge>,
}

impl<'a> From<&'a ResourceGraph> for GraphJson<'a> {
    fn from(graph: &'a ResourceGraph) -> Self {
        Self {
            graph_hash: GraphHasher::new().hash_graph(graph),
            order: graph
                .topological_order()
                .into_iter()
                .map(|d| d.id.as_str())
                .collect(),
            edges: graph.edges(),
        }
    }
}

#[derive(serde::Serialize)]
struct ReportJson {
    stack: String,
    success: bool,
    revision: Option<u64>,
    completed: Vec<String>,
    failed: Option<FailedJson>,
    not_attempted: Vec<String>,
}

#[derive(serde::Serialize)]
struct FailedJson {
    operation: String,
    attempts: u32,
    error: String,
}

impl From<&ApplyReport> for ReportJson {
    fn from(report: &ApplyReport) -> Self {
        let execution = &report.execution;
        Self {
            stack: report.plan.stack.clone(),
            success: execution.is_success(),
            revision: report.revision,
            completed: execution.completed_labels(),
            failed: execution.failure.as_ref().map(|failure| FailedJson {
                operation: failure.operation.label(),
                attempts: failure.attempts,
                error: match &failure.cause {
                    FailureCause::Backend(e) => e.to_string(),
                    FailureCause::Cancelled => String::from("cancelled"),
                },
            }),
            not_attempted: execution.not_attempted.iter().map(Operation::label).collect(),
        }
    }
}
