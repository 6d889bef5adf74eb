//! Run lifecycle notifications.

pub mod slack;

pub use slack::{SlackMessage, SlackNotifier};

use chrono::{DateTime, Utc};

use crate::error::KruError;
use crate::upgrade::{RunConfig, RunReport};

fn mode(dry_run: bool) -> &'static str {
    if dry_run { "Dry Run" } else { "Live Upgrade" }
}

fn format_duration(start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    let secs = (end - start).num_seconds().unsigned_abs();
    format!("{}m {}s", secs / 60, secs % 60)
}

fn footer(resource_group: &str) -> String {
    format!("Sent by kru for resource group {resource_group}")
}

fn selected_pools(config: &RunConfig) -> String {
    if config.selection.control_plane_only {
        return "control plane only".to_string();
    }
    match &config.selection.pools {
        Some(pools) => {
            let names: Vec<&str> = pools.iter().map(String::as_str).collect();
            format!("master, {}", names.join(", "))
        }
        None => "all".to_string(),
    }
}

pub fn build_started_message(cluster: &str, config: &RunConfig, from_version: &str) -> SlackMessage {
    SlackMessage {
        header: "Cluster Upgrade Started".to_string(),
        fields: vec![
            ("Cluster".to_string(), cluster.to_string()),
            ("Resource Group".to_string(), config.resource_group.clone()),
            (
                "Upgrade Path".to_string(),
                format!("{} → {}", from_version, config.target_version),
            ),
            ("Mode".to_string(), mode(config.dry_run).to_string()),
            ("Pools".to_string(), selected_pools(config)),
            ("Forced".to_string(), config.force.to_string()),
        ],
        context: footer(&config.resource_group),
    }
}

pub fn build_completed_message(cluster: &str, config: &RunConfig, report: &RunReport) -> SlackMessage {
    SlackMessage {
        header: "Cluster Upgrade Completed".to_string(),
        fields: vec![
            ("Cluster".to_string(), cluster.to_string()),
            ("Mode".to_string(), mode(report.dry_run).to_string()),
            (
                "Upgrade Path".to_string(),
                format!("{} → {}", report.from_version, report.target_version),
            ),
            ("Nodes Replaced".to_string(), report.upgraded.to_string()),
            ("Already Current".to_string(), report.skipped.to_string()),
            (
                "Duration".to_string(),
                format_duration(report.started_at, report.finished_at),
            ),
        ],
        context: footer(&config.resource_group),
    }
}

/// Names the failing node and step when the error carries them.
pub fn build_failed_message(
    cluster: &str,
    config: &RunConfig,
    started_at: DateTime<Utc>,
    error: &KruError,
) -> SlackMessage {
    let mut fields = vec![
        ("Cluster".to_string(), cluster.to_string()),
        ("Mode".to_string(), mode(config.dry_run).to_string()),
        ("Target Version".to_string(), config.target_version.clone()),
    ];
    if let Some((node, state)) = error.failed_node() {
        fields.push(("Failed Node".to_string(), node.to_string()));
        fields.push(("Failed Step".to_string(), state.step_name().to_string()));
    }
    let resumes = if error.is_retryable() { "yes" } else { "no" };
    fields.push(("Rerun Resumes".to_string(), resumes.to_string()));
    fields.push(("Duration".to_string(), format_duration(started_at, Utc::now())));
    fields.push(("Error".to_string(), error.to_string()));

    SlackMessage {
        header: "Cluster Upgrade Failed".to_string(),
        fields,
        context: footer(&config.resource_group),
    }
}
