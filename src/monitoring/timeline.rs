//! Execution Timeline
//!
//! Rebuilds per-instance timing from a run's transition log for reports
//! and ASCII Gantt charts.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::workflow::{StepStatus, Transition};

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Started,
    Retried,
    Succeeded,
    Failed,
    Skipped,
}

impl EventType {
    fn from_transition(transition: &Transition) -> Self {
        match (transition.from, transition.to) {
            (StepStatus::Running, StepStatus::Running) => Self::Retried,
            (_, StepStatus::Running) => Self::Started,
            (_, StepStatus::Succeeded) => Self::Succeeded,
            (_, StepStatus::Skipped) => Self::Skipped,
            _ => Self::Failed,
        }
    }

    fn is_end(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

/// A single event in the execution timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    /// Display id of the instance, e.g. `restart[1]`
    pub instance: String,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
}

/// Ordered events of one run.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
}

impl ExecutionTimeline {
    /// Builds a timeline from transitions in commit order.
    pub fn from_transitions(start_time: DateTime<Utc>, transitions: &[Transition]) -> Self {
        let events: Vec<TimelineEvent> = transitions
            .iter()
            .map(|t| TimelineEvent {
                instance: t.instance.to_string(),
                event_type: EventType::from_transition(t),
                timestamp: t.at,
            })
            .collect();

        let end_time = events
            .iter()
            .map(|e| e.timestamp)
            .max()
            .unwrap_or(start_time)
            .max(start_time);

        Self {
            events,
            start_time,
            end_time,
        }
    }

    pub fn get_events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Milliseconds from the start of the run to its last event.
    pub fn total_ms(&self) -> i64 {
        (self.end_time - self.start_time).num_milliseconds()
    }

    /// Number of retry attempts per instance.
    pub fn retries(&self) -> HashMap<String, usize> {
        let mut retries = HashMap::new();
        for event in &self.events {
            if event.event_type == EventType::Retried {
                *retries.entry(event.instance.clone()).or_insert(0) += 1;
            }
        }
        retries
    }

    /// Start and end offsets in milliseconds of every instance that ran.
    fn spans(&self) -> Vec<(String, i64, i64)> {
        let mut starts: HashMap<&str, i64> = HashMap::new();
        let mut spans = Vec::new();

        for event in &self.events {
            let offset = (event.timestamp - self.start_time).num_milliseconds();
            match event.event_type {
                EventType::Started => {
                    starts.insert(event.instance.as_str(), offset);
                }
                end if end.is_end() => {
                    if let Some(start) = starts.remove(event.instance.as_str()) {
                        spans.push((event.instance.clone(), start, offset));
                    }
                }
                _ => {}
            }
        }

        spans.sort_by_key(|(_, start, _)| *start);
        spans
    }

    /// Durations in milliseconds of every instance that ran.
    pub fn get_durations(&self) -> HashMap<String, i64> {
        self.spans()
            .into_iter()
            .map(|(instance, start, end)| (instance, end - start))
            .collect()
    }

    /// ASCII Gantt chart, 50 columns wide.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total_time = self.total_ms();
        if total_time <= 0 {
            return output;
        }
        let scale = 50.0 / total_time as f64;

        for (instance, start, end) in self.spans() {
            let start_pos = (start as f64 * scale) as usize;
            let width = ((end - start) as f64 * scale).max(1.0) as usize;

            let mut bar = " ".repeat(start_pos);
            bar.push_str(&"#".repeat(width));

            output.push_str(&format!(
                "{} |{:<50}| ({} ms)\n",
                truncate(&instance, 16),
                bar,
                end - start
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }
}

/// Pads or cuts a label to exactly `max_len` characters.
fn truncate(s: &str, max_len: usize) -> String {
    let count = s.chars().count();
    if count <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
