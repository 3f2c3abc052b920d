//! Operator-facing rendering of restart results.

use anyhow::Result;
use itertools::Itertools;

use crate::types::{MultiRestartResult, OutputFormat};

pub fn render(result: &MultiRestartResult, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(result)?),
        OutputFormat::Yaml => Ok(serde_yaml::to_string(result)?),
        OutputFormat::Text => Ok(render_text(result)),
    }
}

fn render_text(result: &MultiRestartResult) -> String {
    let mut out = String::new();

    out.push_str("Restart Summary\n");
    out.push_str("===============\n");
    out.push_str(&format!("Total clusters:      {}\n", result.total_clusters));
    out.push_str(&format!("Successful:          {}\n", result.successful_clusters));
    out.push_str(&format!("Failed:              {}\n", result.failed_clusters));
    out.push_str(&format!("Total duration:      {:.2}s\n", result.total_duration));
    if let Some(started) = result.started_at {
        out.push_str(&format!(
            "Started at:          {}\n",
            started.format("%Y-%m-%d %H:%M:%S UTC")
        ));
    }
    if let Some(completed) = result.completed_at {
        out.push_str(&format!(
            "Completed at:        {}\n",
            completed.format("%Y-%m-%d %H:%M:%S UTC")
        ));
    }

    if result.results.is_empty() {
        return out;
    }

    out.push_str("\nCluster Details\n");
    out.push_str("---------------\n");
    for record in &result.results {
        let status = if record.success {
            "ok"
        } else if record.cancelled {
            "cancelled"
        } else {
            "failed"
        };
        out.push_str(&format!(
            "{} ({}): {status}, {}/{} pods restarted in {:.2}s\n",
            record.cluster.name,
            record.cluster.namespace,
            record.restarted_pods.len(),
            record.total_pods,
            record.duration,
        ));
        if !record.skipped_pods.is_empty() {
            out.push_str(&format!(
                "  skipped: {}\n",
                record.skipped_pods.iter().join(", ")
            ));
        }
        if let Some(error) = &record.error {
            out.push_str(&format!("  error: {error}\n"));
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CrateDBCluster, Health, MinAvailability, RestartResult};
    use chrono::Utc;

    fn sample() -> MultiRestartResult {
        let cluster = CrateDBCluster {
            name: "aqua".to_string(),
            namespace: "prod".to_string(),
            statefulset_name: "crate-data-hot-aqua".to_string(),
            health: Health::Green,
            replicas: 2,
            pods: vec!["aqua-0".to_string(), "aqua-1".to_string()],
            has_prestop_hook: true,
            has_dc_util: true,
            suspended: false,
            crd_name: "aqua".to_string(),
            dc_util_timeout: 720,
            min_availability: MinAvailability::Primaries,
        };
        MultiRestartResult {
            results: vec![RestartResult {
                cluster,
                success: true,
                duration: 42.5,
                restarted_pods: vec!["aqua-0".to_string(), "aqua-1".to_string()],
                skipped_pods: vec![],
                total_pods: 2,
                error: None,
                started_at: Some(Utc::now()),
                completed_at: Some(Utc::now()),
                cancelled: false,
            }],
            total_clusters: 1,
            successful_clusters: 1,
            failed_clusters: 0,
            total_duration: 42.5,
            started_at: Some(Utc::now()),
            completed_at: Some(Utc::now()),
        }
    }

    #[test]
    fn text_report_shows_summary_and_details() {
        let text = render(&sample(), OutputFormat::Text).unwrap();
        assert!(text.contains("Total clusters:      1"));
        assert!(text.contains("aqua (prod): ok, 2/2 pods restarted"));
    }

    #[test]
    fn json_report_round_trips() {
        let json = render(&sample(), OutputFormat::Json).unwrap();
        let back: MultiRestartResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back.total_clusters, 1);
        assert_eq!(back.results[0].restarted_pods.len(), 2);
    }

    #[test]
    fn yaml_report_parses() {
        let yaml = render(&sample(), OutputFormat::Yaml).unwrap();
        let back: MultiRestartResult = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.successful_clusters, 1);
    }

    #[test]
    fn failed_and_cancelled_runs_are_marked() {
        let mut result = sample();
        result.results[0].success = false;
        result.results[0].cancelled = true;
        result.results[0].error = Some("restart cancelled: operator".to_string());
        let text = render(&result, OutputFormat::Text).unwrap();
        assert!(text.contains("cancelled"));
        assert!(text.contains("error: restart cancelled"));
    }
}
