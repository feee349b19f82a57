// Structural exporters - CSV strings, workbook rows, report sections

//! # Exporters
//!
//! Exports are **structural**: a CSV string, a workbook as named sheets of
//! rows, a report as typed sections. No spreadsheet or PDF library is
//! touched here; any renderer can consume these artifacts.

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};

use crate::analysis::{load_trails, ProcessTrail};
use crate::audit::dashboard::{Bottlenecks, KanbanHealth, ProcessStats};
use crate::registry::KanbanRegistry;
use crate::storage::repository::ProcessRepository;
use crate::{FlowboardError, Result};

/// One sheet of a workbook: a name and rows of cells.
#[derive(Debug, Clone, Serialize)]
pub struct Sheet {
    pub name: String,
    pub rows: Vec<Vec<Value>>,
}

/// A workbook description: `Processes`, `Transitions` and `Summary`.
#[derive(Debug, Clone, Serialize)]
pub struct Workbook {
    pub name: String,
    pub sheets: Vec<Sheet>,
}

/// One section of a report.
#[derive(Debug, Clone, Serialize)]
pub struct ReportSection {
    pub title: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub content: Value,
}

/// A report description for any templating renderer.
#[derive(Debug, Clone, Serialize)]
pub struct PdfReport {
    pub report_title: String,
    pub report_date: String,
    pub kanban_id: String,
    pub kanban_name: String,
    pub sections: Vec<ReportSection>,
    pub template: String,
    pub filename: String,
}

/// CSV exports: one header row plus one row per process or transition.
pub struct CsvExporter {
    repo: Arc<ProcessRepository>,
}

impl CsvExporter {
    pub fn new(repo: Arc<ProcessRepository>) -> Self {
        CsvExporter { repo }
    }

    /// One row per process. `include_fields` appends selected field
    /// values as extra columns.
    pub async fn export_processes(
        &self,
        kanban_id: &str,
        include_fields: &[&str],
    ) -> Result<String> {
        let trails = load_trails(&self.repo, kanban_id).await?;

        let mut writer = csv::Writer::from_writer(Vec::new());

        let mut header = vec![
            "process_id",
            "current_state",
            "created_at",
            "updated_at",
            "transition_count",
        ];
        header.extend_from_slice(include_fields);
        writer.write_record(&header).context("writing CSV header")?;

        for trail in &trails {
            let process = &trail.process;
            let mut row = vec![
                process.process_id.clone(),
                process.current_state.clone(),
                process.created_at.to_rfc3339(),
                process.updated_at.to_rfc3339(),
                trail
                    .entries
                    .iter()
                    .filter(|e| e.is_transition())
                    .count()
                    .to_string(),
            ];
            for field in include_fields {
                let value = process
                    .field_values
                    .get(*field)
                    .map(cell_text)
                    .unwrap_or_default();
                row.push(value);
            }
            writer.write_record(&row).context("writing CSV row")?;
        }

        finish_csv(writer)
    }

    /// One row per recorded transition.
    pub async fn export_transitions(&self, kanban_id: &str) -> Result<String> {
        let trails = load_trails(&self.repo, kanban_id).await?;

        let mut writer = csv::Writer::from_writer(Vec::new());
        writer
            .write_record([
                "process_id",
                "from_state",
                "to_state",
                "timestamp",
                "duration_hours",
            ])
            .context("writing CSV header")?;

        for trail in &trails {
            for entry in trail.entries.iter().filter(|e| e.is_transition()) {
                writer
                    .write_record([
                        entry.process_id.as_str(),
                        entry.from_state.as_deref().unwrap_or(""),
                        entry.to_state.as_deref().unwrap_or(""),
                        &entry.timestamp.to_rfc3339(),
                        &entry
                            .duration_in_previous_state
                            .map(|d| d.to_string())
                            .unwrap_or_default(),
                    ])
                    .context("writing CSV row")?;
            }
        }

        finish_csv(writer)
    }
}

fn finish_csv(writer: csv::Writer<Vec<u8>>) -> Result<String> {
    let bytes = writer
        .into_inner()
        .map_err(|e| FlowboardError::Internal(format!("flushing CSV writer: {e}")))?;
    String::from_utf8(bytes)
        .map_err(|e| FlowboardError::Internal(format!("CSV output was not UTF-8: {e}")))
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Workbook exports with three sheets.
pub struct ExcelExporter {
    repo: Arc<ProcessRepository>,
    registry: Arc<KanbanRegistry>,
}

impl ExcelExporter {
    pub fn new(repo: Arc<ProcessRepository>, registry: Arc<KanbanRegistry>) -> Self {
        ExcelExporter { repo, registry }
    }

    pub async fn export_workbook(&self, kanban_id: &str) -> Result<Workbook> {
        let trails = load_trails(&self.repo, kanban_id).await?;
        let kanban = self.registry.get(kanban_id);
        let now = Utc::now();

        let mut processes_rows: Vec<Vec<Value>> = vec![vec![
            json!("Process ID"),
            json!("Current State"),
            json!("Created At"),
            json!("Updated At"),
            json!("Transitions"),
            json!("Duration (hours)"),
        ]];
        for trail in &trails {
            let process = &trail.process;
            processes_rows.push(vec![
                json!(process.process_id),
                json!(process.current_state),
                json!(process.created_at.to_rfc3339()),
                json!(process.updated_at.to_rfc3339()),
                json!(trail.entries.iter().filter(|e| e.is_transition()).count()),
                json!(trail.total_duration_hours(now)),
            ]);
        }

        let mut transitions_rows: Vec<Vec<Value>> = vec![vec![
            json!("Process ID"),
            json!("From State"),
            json!("To State"),
            json!("Timestamp"),
            json!("Duration (hours)"),
        ]];
        for trail in &trails {
            for entry in trail.entries.iter().filter(|e| e.is_transition()) {
                transitions_rows.push(vec![
                    json!(entry.process_id),
                    json!(entry.from_state),
                    json!(entry.to_state),
                    json!(entry.timestamp.to_rfc3339()),
                    json!(entry.duration_in_previous_state.unwrap_or(0.0)),
                ]);
            }
        }

        let completed = trails
            .iter()
            .filter(|t| self.is_completed(kanban_id, t))
            .count();
        let durations: Vec<f64> = trails
            .iter()
            .map(|t| t.total_duration_hours(now))
            .collect();
        let avg_duration = crate::analysis::mean(&durations);
        let completion_rate = if trails.is_empty() {
            0.0
        } else {
            completed as f64 / trails.len() as f64
        };

        let mut summary_rows: Vec<Vec<Value>> = vec![
            vec![json!("Kanban Summary"), json!("")],
            vec![json!("Kanban ID"), json!(kanban_id)],
            vec![
                json!("Kanban Name"),
                json!(kanban.as_ref().map(|k| k.name.clone()).unwrap_or_default()),
            ],
            vec![json!("Export Date"), json!(now.to_rfc3339())],
            vec![json!(""), json!("")],
            vec![json!("Statistics"), json!("")],
            vec![json!("Total Processes"), json!(trails.len())],
            vec![json!("Completed"), json!(completed)],
            vec![json!("Active"), json!(trails.len() - completed)],
            vec![
                json!("Completion Rate"),
                json!(format!("{:.1}%", completion_rate * 100.0)),
            ],
            vec![json!("Avg Duration (hours)"), json!(avg_duration)],
            vec![json!(""), json!("")],
            vec![json!("State Distribution"), json!("")],
        ];

        let mut state_counts: Vec<(String, usize)> = {
            let mut counts = std::collections::HashMap::new();
            for trail in &trails {
                *counts
                    .entry(trail.process.current_state.clone())
                    .or_insert(0usize) += 1;
            }
            counts.into_iter().collect()
        };
        state_counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        for (state, count) in state_counts {
            summary_rows.push(vec![json!(state), json!(count)]);
        }

        Ok(Workbook {
            name: format!("{kanban_id}_{}.xlsx", now.date_naive()),
            sheets: vec![
                Sheet {
                    name: "Processes".to_string(),
                    rows: processes_rows,
                },
                Sheet {
                    name: "Transitions".to_string(),
                    rows: transitions_rows,
                },
                Sheet {
                    name: "Summary".to_string(),
                    rows: summary_rows,
                },
            ],
        })
    }

    fn is_completed(&self, kanban_id: &str, trail: &ProcessTrail) -> bool {
        self.registry
            .get(kanban_id)
            .and_then(|k| {
                k.state(&trail.process.current_state)
                    .and_then(|s| s.state_type)
            })
            == Some(crate::models::kanban::StateType::Final)
    }
}

/// Report-section exports for PDF templating.
pub struct PdfExporter {
    repo: Arc<ProcessRepository>,
    registry: Arc<KanbanRegistry>,
}

impl PdfExporter {
    pub fn new(repo: Arc<ProcessRepository>, registry: Arc<KanbanRegistry>) -> Self {
        PdfExporter { repo, registry }
    }

    /// Executive report from precomputed dashboard data. Absent inputs
    /// simply omit their section.
    pub fn executive_report(
        &self,
        kanban_id: &str,
        health: Option<&KanbanHealth>,
        stats: Option<&ProcessStats>,
        bottlenecks: Option<&Bottlenecks>,
    ) -> Result<PdfReport> {
        let kanban_name = self
            .registry
            .get(kanban_id)
            .map(|k| k.name)
            .unwrap_or_else(|| kanban_id.to_string());

        let mut sections = Vec::new();
        if let Some(health) = health {
            sections.push(ReportSection {
                title: "Health Summary".to_string(),
                kind: "health".to_string(),
                content: serde_json::to_value(health)?,
            });
        }
        if let Some(stats) = stats {
            sections.push(ReportSection {
                title: "Process Statistics".to_string(),
                kind: "statistics".to_string(),
                content: serde_json::to_value(stats)?,
            });
        }
        if let Some(bottlenecks) = bottlenecks {
            sections.push(ReportSection {
                title: "Bottleneck Analysis".to_string(),
                kind: "bottlenecks".to_string(),
                content: serde_json::to_value(bottlenecks)?,
            });
        }

        let date = Utc::now().date_naive().to_string();
        Ok(PdfReport {
            report_title: format!("Executive Report - {kanban_name}"),
            report_date: date.clone(),
            kanban_id: kanban_id.to_string(),
            kanban_name,
            sections,
            template: "executive_report".to_string(),
            filename: format!("{kanban_id}_report_{date}.pdf"),
        })
    }

    /// Timeline report of one process.
    pub async fn process_report(&self, process_id: &str) -> Result<PdfReport> {
        let process = self
            .repo
            .get_by_id(process_id)
            .await?
            .ok_or_else(|| FlowboardError::ProcessNotFound(process_id.to_string()))?;
        let history = self.repo.history(process_id).await?;

        let kanban_name = self
            .registry
            .get(&process.kanban_id)
            .map(|k| k.name)
            .unwrap_or_else(|| process.kanban_id.clone());

        let timeline: Vec<Value> = history
            .iter()
            .map(|entry| {
                json!({
                    "timestamp": entry.timestamp.to_rfc3339(),
                    "action": entry.action.as_str(),
                    "from_state": entry.from_state,
                    "to_state": entry.to_state,
                    "user": entry.user,
                    "type": entry.actor.as_str(),
                })
            })
            .collect();

        let sections = vec![
            ReportSection {
                title: "Process Details".to_string(),
                kind: "details".to_string(),
                content: json!({
                    "process_id": process.process_id,
                    "kanban_id": process.kanban_id,
                    "current_state": process.current_state,
                    "created_at": process.created_at.to_rfc3339(),
                    "updated_at": process.updated_at.to_rfc3339(),
                    "field_values": process.field_values,
                    "tags": process.tags,
                    "assigned_to": process.assigned_to,
                }),
            },
            ReportSection {
                title: "Timeline".to_string(),
                kind: "timeline".to_string(),
                content: Value::Array(timeline),
            },
        ];

        let date = Utc::now().date_naive().to_string();
        Ok(PdfReport {
            report_title: format!("Process Report - {process_id}"),
            report_date: date.clone(),
            kanban_id: process.kanban_id.clone(),
            kanban_name,
            sections,
            template: "process_report".to_string(),
            filename: format!("{process_id}_report_{date}.pdf"),
        })
    }
}
