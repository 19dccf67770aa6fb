//! Per-kind readiness predicates over live cluster state.

use berth_core::Resource;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    NotReady(String),
    /// The resource reports a terminal condition; waiting longer won't help.
    Terminal(String),
}

pub fn check(res: &Resource) -> Readiness {
    match res.kind() {
        "Deployment" => deployment(res),
        "StatefulSet" => stateful_set(res),
        "DaemonSet" => daemon_set(res),
        "Pod" => pod(res),
        "Job" => job(res),
        "Namespace" => namespace(res),
        "CustomResourceDefinition" => crd(res),
        // Kinds without a status contract are ready once they exist.
        _ => Readiness::Ready,
    }
}

fn int_at(res: &Resource, pointer: &str) -> Option<i64> {
    res.as_value().pointer(pointer).and_then(Value::as_i64)
}

fn str_at<'a>(res: &'a Resource, pointer: &str) -> Option<&'a str> {
    res.as_value().pointer(pointer).and_then(Value::as_str)
}

fn condition_status<'a>(res: &'a Resource, cond_type: &str) -> Option<&'a str> {
    res.as_value()
        .pointer("/status/conditions")?
        .as_array()?
        .iter()
        .find(|c| c.get("type").and_then(Value::as_str) == Some(cond_type))?
        .get("status")
        .and_then(Value::as_str)
}

fn observed_up_to_date(res: &Resource) -> bool {
    match (int_at(res, "/metadata/generation"), int_at(res, "/status/observedGeneration")) {
        (Some(gen), Some(obs)) => obs >= gen,
        // No generation bookkeeping means nothing to wait on.
        _ => true,
    }
}

fn deployment(res: &Resource) -> Readiness {
    if condition_status(res, "ReplicaFailure") == Some("True") {
        return Readiness::Terminal("replica failure reported".to_string());
    }
    let progress_dead = res
        .as_value()
        .pointer("/status/conditions")
        .and_then(Value::as_array)
        .map(|cs| {
            cs.iter().any(|c| {
                c.get("type").and_then(Value::as_str) == Some("Progressing")
                    && c.get("reason").and_then(Value::as_str) == Some("ProgressDeadlineExceeded")
            })
        })
        .unwrap_or(false);
    if progress_dead {
        return Readiness::Terminal("progress deadline exceeded".to_string());
    }
    if !observed_up_to_date(res) {
        return Readiness::NotReady("generation not yet observed".to_string());
    }
    let desired = int_at(res, "/spec/replicas").unwrap_or(1);
    let available = int_at(res, "/status/availableReplicas").unwrap_or(0);
    if available >= desired {
        Readiness::Ready
    } else {
        Readiness::NotReady(format!("{}/{} replicas available", available, desired))
    }
}

fn stateful_set(res: &Resource) -> Readiness {
    if !observed_up_to_date(res) {
        return Readiness::NotReady("generation not yet observed".to_string());
    }
    let desired = int_at(res, "/spec/replicas").unwrap_or(1);
    let ready = int_at(res, "/status/readyReplicas").unwrap_or(0);
    if ready >= desired {
        Readiness::Ready
    } else {
        Readiness::NotReady(format!("{}/{} replicas ready", ready, desired))
    }
}

fn daemon_set(res: &Resource) -> Readiness {
    if !observed_up_to_date(res) {
        return Readiness::NotReady("generation not yet observed".to_string());
    }
    let desired = int_at(res, "/status/desiredNumberScheduled").unwrap_or(0);
    let ready = int_at(res, "/status/numberReady").unwrap_or(0);
    if ready >= desired {
        Readiness::Ready
    } else {
        Readiness::NotReady(format!("{}/{} pods ready", ready, desired))
    }
}

fn pod(res: &Resource) -> Readiness {
    match str_at(res, "/status/phase") {
        Some("Running") | Some("Succeeded") => Readiness::Ready,
        Some("Failed") => Readiness::Terminal("pod failed".to_string()),
        phase => Readiness::NotReady(format!("phase {}", phase.unwrap_or("unknown"))),
    }
}

fn job(res: &Resource) -> Readiness {
    if condition_status(res, "Failed") == Some("True") {
        return Readiness::Terminal("job failed".to_string());
    }
    if int_at(res, "/status/succeeded").unwrap_or(0) >= 1 {
        Readiness::Ready
    } else {
        Readiness::NotReady("no successful completions".to_string())
    }
}

fn namespace(res: &Resource) -> Readiness {
    match str_at(res, "/status/phase") {
        Some("Active") | None => Readiness::Ready,
        Some(other) => Readiness::NotReady(format!("phase {}", other)),
    }
}

fn crd(res: &Resource) -> Readiness {
    if condition_status(res, "NamesAccepted") == Some("False") {
        return Readiness::Terminal("names not accepted".to_string());
    }
    match condition_status(res, "Established") {
        Some("True") => Readiness::Ready,
        _ => Readiness::NotReady("not established".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn res(v: serde_json::Value) -> Resource {
        Resource::from_value(v).unwrap()
    }

    #[test]
    fn deployment_waits_for_observed_generation_and_replicas() {
        let base = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "generation": 4},
            "spec": {"replicas": 2}
        });
        let mut stale = base.clone();
        stale["status"] = json!({"observedGeneration": 3, "availableReplicas": 2});
        assert!(matches!(check(&res(stale)), Readiness::NotReady(_)));

        let mut scaling = base.clone();
        scaling["status"] = json!({"observedGeneration": 4, "availableReplicas": 1});
        assert!(matches!(check(&res(scaling)), Readiness::NotReady(_)));

        let mut ready = base;
        ready["status"] = json!({"observedGeneration": 4, "availableReplicas": 2});
        assert_eq!(check(&res(ready)), Readiness::Ready);
    }

    #[test]
    fn deployment_progress_deadline_is_terminal() {
        let v = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "generation": 1},
            "spec": {"replicas": 1},
            "status": {
                "observedGeneration": 1,
                "conditions": [
                    {"type": "Progressing", "status": "False", "reason": "ProgressDeadlineExceeded"}
                ]
            }
        });
        assert!(matches!(check(&res(v)), Readiness::Terminal(_)));
    }

    #[test]
    fn pod_phases() {
        let mk = |phase: &str| {
            res(json!({
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {"name": "p"},
                "status": {"phase": phase}
            }))
        };
        assert_eq!(check(&mk("Running")), Readiness::Ready);
        assert_eq!(check(&mk("Succeeded")), Readiness::Ready);
        assert!(matches!(check(&mk("Pending")), Readiness::NotReady(_)));
        assert!(matches!(check(&mk("Failed")), Readiness::Terminal(_)));
    }

    #[test]
    fn crd_established() {
        let mk = |conds: serde_json::Value| {
            res(json!({
                "apiVersion": "apiextensions.k8s.io/v1",
                "kind": "CustomResourceDefinition",
                "metadata": {"name": "widgets.example.org"},
                "status": {"conditions": conds}
            }))
        };
        assert_eq!(
            check(&mk(json!([{"type": "Established", "status": "True"}]))),
            Readiness::Ready
        );
        assert!(matches!(
            check(&mk(json!([{"type": "NamesAccepted", "status": "False"}]))),
            Readiness::Terminal(_)
        ));
        assert!(matches!(check(&mk(json!([]))), Readiness::NotReady(_)));
    }

    #[test]
    fn kinds_without_status_are_ready() {
        let v = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "c"}
        });
        assert_eq!(check(&res(v)), Readiness::Ready);
    }
}
