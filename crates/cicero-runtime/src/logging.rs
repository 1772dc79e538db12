//! Job-spec logging augmentation.
//!
//! Every runnable step ships its allocation logs: each task group gets a
//! promtail sidecar that scrapes `/alloc/logs/*.std*.[0-9]*`, tags the
//! entries with the allocation's `nomad_*` environment, and pushes them to
//! the configured endpoint. The sidecar is non-optional.

use serde_json::json;

use cicero_core::runner::{JobSpec, Resources, Task, TaskLifecycle, Template};

const SIDECAR_NAME: &str = "promtail";
const SIDECAR_CPU: u32 = 100;
const SIDECAR_MEMORY_MB: u32 = 100;
const LOG_GLOB: &str = "/alloc/logs/*.std*.[0-9]*";

/// Append the log-shipping sidecar to every task group of a job.
pub fn add_logging(job: &mut JobSpec, loki_url: &str) -> Result<(), serde_yaml::Error> {
    let config = serde_yaml::to_string(&json!({
        "server": {
            "http_listen_port": 0,
            "grpc_listen_port": 0,
        },
        "positions": {"filename": "/local/positions.yaml"},
        "client": {"url": loki_url},
        "scrape_configs": [{
            "job_name": r#"{{ env "NOMAD_JOB_NAME" }}-{{ env "NOMAD_ALLOC_INDEX" }}"#,
            "pipeline_stages": null,
            "static_configs": [{
                "labels": {
                    "nomad_alloc_id": r#"{{ env "NOMAD_ALLOC_ID" }}"#,
                    "nomad_alloc_index": r#"{{ env "NOMAD_ALLOC_INDEX" }}"#,
                    "nomad_alloc_name": r#"{{ env "NOMAD_ALLOC_NAME" }}"#,
                    "nomad_dc": r#"{{ env "NOMAD_DC" }}"#,
                    "nomad_group_name": r#"{{ env "NOMAD_GROUP_NAME" }}"#,
                    "nomad_job_id": r#"{{ env "NOMAD_JOB_ID" }}"#,
                    "nomad_job_name": r#"{{ env "NOMAD_JOB_NAME" }}"#,
                    "nomad_job_parent_id": r#"{{ env "NOMAD_JOB_PARENT_ID" }}"#,
                    "nomad_namespace": r#"{{ env "NOMAD_NAMESPACE" }}"#,
                    "nomad_region": r#"{{ env "NOMAD_REGION" }}"#,
                    "__path__": LOG_GLOB,
                },
            }],
        }],
    }))?;

    for group in &mut job.task_groups {
        group.tasks.push(Task {
            name: SIDECAR_NAME.to_string(),
            driver: "nix".to_string(),
            lifecycle: Some(TaskLifecycle {
                hook: "prestart".to_string(),
                sidecar: true,
            }),
            resources: Some(Resources {
                cpu: SIDECAR_CPU,
                memory_mb: SIDECAR_MEMORY_MB,
            }),
            config: json!({
                "packages": ["github:nixos/nixpkgs/nixos-21.05#grafana-loki"],
                "command": ["/bin/promtail", "-config.file", "local/config.yaml"],
            }),
            templates: vec![Template {
                dest_path: "local/config.yaml".to_string(),
                embedded_tmpl: config.clone(),
            }],
        });
    }

    Ok(())
}
