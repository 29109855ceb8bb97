//! Projectors from raw Kubernetes JSON into the snapshot types.
//!
//! Works on `serde_json::Value` so callers can feed typed objects
//! (after `serde_json::to_value`) or raw watch payloads alike.

use serde_json::Value;

use crate::status::{ControllerInfo, PodPhase, PodSnapshot};

fn str_at<'a>(raw: &'a Value, ptr: &str) -> &'a str { raw.pointer(ptr).and_then(|v| v.as_str()).unwrap_or("") }

fn has_deletion_ts(raw: &Value) -> bool {
    raw.pointer("/metadata/deletionTimestamp").map(|v| !v.is_null()).unwrap_or(false)
}

pub fn project_pod(raw: &Value) -> PodSnapshot {
    let name = str_at(raw, "/metadata/name").to_string();
    let phase = PodPhase::parse(str_at(raw, "/status/phase"));

    let mut total = 0usize;
    let mut ready = 0usize;
    let mut container_reason = String::new();
    if let Some(cs) = raw.pointer("/status/containerStatuses").and_then(|v| v.as_array()) {
        total = cs.len();
        for c in cs {
            if c.get("ready").and_then(|v| v.as_bool()).unwrap_or(false) {
                ready += 1;
            }
            if container_reason.is_empty() {
                container_reason = container_state_reason(c);
            }
        }
    }

    let mut scheduled = false;
    let mut condition_msg = String::new();
    if let Some(conds) = raw.pointer("/status/conditions").and_then(|v| v.as_array()) {
        for c in conds {
            let ty = c.get("type").and_then(|v| v.as_str()).unwrap_or("");
            let status = c.get("status").and_then(|v| v.as_str()).unwrap_or("");
            if ty == "PodScheduled" {
                scheduled = status == "True";
                if !scheduled {
                    condition_msg = c.get("message").and_then(|v| v.as_str()).unwrap_or("").to_string();
                }
            }
        }
    }
    // Older servers omit conditions; a non-Pending phase implies scheduling happened.
    if !scheduled && !matches!(phase, PodPhase::Pending | PodPhase::Unknown) {
        scheduled = true;
    }

    let reason = str_at(raw, "/status/reason");
    let message = str_at(raw, "/status/message");
    let message = if !reason.is_empty() && !message.is_empty() {
        format!("{}: {}", reason, message)
    } else if !reason.is_empty() {
        reason.to_string()
    } else if !message.is_empty() {
        message.to_string()
    } else if !container_reason.is_empty() {
        container_reason
    } else {
        condition_msg
    };

    PodSnapshot { name, phase, ready: total > 0 && ready == total, scheduled, deleting: has_deletion_ts(raw), message }
}

fn container_state_reason(c: &Value) -> String {
    for key in ["waiting", "terminated"] {
        if let Some(st) = c.pointer(&format!("/state/{}", key)) {
            let reason = st.get("reason").and_then(|v| v.as_str()).unwrap_or("");
            let msg = st.get("message").and_then(|v| v.as_str()).unwrap_or("");
            // ContainerCreating is the normal path, not worth surfacing
            if reason.is_empty() || reason == "ContainerCreating" {
                continue;
            }
            return if msg.is_empty() { reason.to_string() } else { format!("{}: {}", reason, msg) };
        }
    }
    String::new()
}

pub fn project_controller(raw: &Value) -> ControllerInfo {
    ControllerInfo {
        name: str_at(raw, "/metadata/name").to_string(),
        deleting: has_deletion_ts(raw),
        ready_replicas: raw.pointer("/status/readyReplicas").and_then(|v| v.as_i64()).unwrap_or(0) as i32,
    }
}
