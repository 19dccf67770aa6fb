//! Declarative configuration: rebase rules, template rules, diff exclusions,
//! labels, ordering overrides, reference rules and wait timeouts, carried as
//! `kind: Config` documents alongside ordinary resources.

#![forbid(unsafe_code)]

use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

use berth_core::mods::{any_matches, CopySource};
use berth_core::{FieldRemoveMod, Path, Resource, ResourceMatcher};

pub const CONFIG_API_VERSION: &str = "berth.dev/v1alpha1";
pub const CONFIG_KIND: &str = "Config";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config document {name}: {reason}")]
    InvalidConfig { name: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RebaseOp {
    Copy,
    Remove,
}

/// Splices fields from `existing` (or `new`) into a copy of the desired
/// resource before diffing, so server-owned fields don't show up as edits.
#[derive(Debug, Clone)]
pub struct RebaseRule {
    pub paths: Vec<Path>,
    pub op: RebaseOp,
    pub sources: Vec<CopySource>,
    pub matchers: Vec<ResourceMatcher>,
}

impl RebaseRule {
    pub fn matches(&self, res: &Resource) -> bool {
        any_matches(&self.matchers, res)
    }
}

/// Marks fields whose values are generated and must not count as a diff;
/// the existing value is substituted into the desired resource when both
/// sides carry the field.
#[derive(Debug, Clone)]
pub struct TemplateRule {
    pub paths: Vec<Path>,
    pub matchers: Vec<ResourceMatcher>,
}

impl TemplateRule {
    pub fn matches(&self, res: &Resource) -> bool {
        any_matches(&self.matchers, res)
    }
}

/// Declares that a field on `from_kind` resources names a `to_kind` resource
/// it depends on.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceRule {
    pub from_kind: String,
    pub from_path: Path,
    pub to_kind: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KindOrderOverride {
    pub kind: String,
    pub order: i32,
}

#[derive(Debug, Clone)]
pub struct WaitConfig {
    pub change_timeout: Duration,
    pub global_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self {
        WaitConfig {
            change_timeout: Duration::from_secs(600),
            global_timeout: Duration::from_secs(900),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// The compiled bundle of user rules consumed by the diff-and-apply engine.
#[derive(Debug, Clone)]
pub struct ConfigBundle {
    pub rebase_rules: Vec<RebaseRule>,
    pub template_rules: Vec<TemplateRule>,
    pub diff_exclusions: Vec<FieldRemoveMod>,
    pub ownership_label_key: String,
    pub additional_labels: BTreeMap<String, String>,
    pub kind_order_overrides: Vec<KindOrderOverride>,
    pub reference_rules: Vec<ReferenceRule>,
    pub wait: WaitConfig,
}

impl Default for ConfigBundle {
    fn default() -> Self {
        ConfigBundle {
            rebase_rules: default_rebase_rules(),
            template_rules: Vec::new(),
            diff_exclusions: default_diff_exclusions(),
            ownership_label_key: berth_core::OWNERSHIP_LABEL_KEY.to_string(),
            additional_labels: BTreeMap::new(),
            kind_order_overrides: Vec::new(),
            reference_rules: default_reference_rules(),
            wait: WaitConfig::default(),
        }
    }
}

impl ConfigBundle {
    /// Splits `kind: Config` documents out of a parsed document set and
    /// folds them (in order) on top of the built-in defaults.
    pub fn from_resources(
        resources: Vec<Resource>,
    ) -> Result<(Vec<Resource>, ConfigBundle), ConfigError> {
        let mut bundle = ConfigBundle::default();
        let mut plain = Vec::with_capacity(resources.len());
        for res in resources {
            if res.kind() == CONFIG_KIND && res.id().api_version() == CONFIG_API_VERSION {
                bundle.merge_doc(&res)?;
            } else {
                plain.push(res);
            }
        }
        Ok((plain, bundle))
    }

    fn merge_doc(&mut self, res: &Resource) -> Result<(), ConfigError> {
        let doc: ConfigDoc =
            serde_json::from_value(res.as_value().clone()).map_err(|e| ConfigError::InvalidConfig {
                name: res.name().to_string(),
                reason: e.to_string(),
            })?;
        for spec in doc.rebase_rules {
            self.rebase_rules.push(spec.compile(res.name())?);
        }
        for spec in doc.template_rules {
            self.template_rules.push(TemplateRule {
                paths: spec.paths(),
                matchers: spec.resource_matchers,
            });
        }
        for spec in doc.diff_against_last_applied_field_exclusion_rules {
            for path in spec.paths() {
                self.diff_exclusions.push(FieldRemoveMod {
                    matchers: spec.resource_matchers.clone(),
                    path,
                });
            }
        }
        self.additional_labels.extend(doc.additional_labels);
        self.kind_order_overrides.extend(doc.kind_order_overrides);
        self.reference_rules.extend(doc.reference_rules);
        if let Some(w) = doc.wait_rules {
            if let Some(secs) = w.timeout_seconds {
                self.wait.change_timeout = Duration::from_secs(secs);
            }
            if let Some(secs) = w.global_timeout_seconds {
                self.wait.global_timeout = Duration::from_secs(secs);
            }
            if let Some(secs) = w.poll_seconds {
                self.wait.poll_interval = Duration::from_secs(secs);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigDoc {
    #[serde(default)]
    rebase_rules: Vec<RebaseRuleSpec>,
    #[serde(default)]
    template_rules: Vec<PathsRuleSpec>,
    #[serde(default)]
    diff_against_last_applied_field_exclusion_rules: Vec<PathsRuleSpec>,
    #[serde(default)]
    additional_labels: BTreeMap<String, String>,
    #[serde(default)]
    kind_order_overrides: Vec<KindOrderOverride>,
    #[serde(default)]
    reference_rules: Vec<ReferenceRule>,
    #[serde(default)]
    wait_rules: Option<WaitRulesSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WaitRulesSpec {
    timeout_seconds: Option<u64>,
    global_timeout_seconds: Option<u64>,
    poll_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PathsRuleSpec {
    #[serde(default)]
    path: Option<Path>,
    #[serde(default)]
    paths: Vec<Path>,
    #[serde(default)]
    resource_matchers: Vec<ResourceMatcher>,
}

impl PathsRuleSpec {
    fn paths(&self) -> Vec<Path> {
        let mut out = self.paths.clone();
        if let Some(p) = &self.path {
            out.insert(0, p.clone());
        }
        out
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RebaseRuleSpec {
    #[serde(default)]
    path: Option<Path>,
    #[serde(default)]
    paths: Vec<Path>,
    #[serde(rename = "type")]
    op: RebaseOp,
    #[serde(default)]
    sources: Vec<CopySource>,
    #[serde(default)]
    resource_matchers: Vec<ResourceMatcher>,
}

impl RebaseRuleSpec {
    fn compile(self, doc_name: &str) -> Result<RebaseRule, ConfigError> {
        let mut paths = self.paths;
        if let Some(p) = self.path {
            paths.insert(0, p);
        }
        if paths.is_empty() {
            return Err(ConfigError::InvalidConfig {
                name: doc_name.to_string(),
                reason: "rebase rule without path or paths".to_string(),
            });
        }
        if self.op == RebaseOp::Copy && self.sources.is_empty() {
            return Err(ConfigError::InvalidConfig {
                name: doc_name.to_string(),
                reason: "copy rebase rule without sources".to_string(),
            });
        }
        Ok(RebaseRule {
            paths,
            op: self.op,
            sources: self.sources,
            matchers: self.resource_matchers,
        })
    }
}

fn copy_preferring_new(paths: Vec<Path>, matchers: Vec<ResourceMatcher>) -> RebaseRule {
    RebaseRule {
        paths,
        op: RebaseOp::Copy,
        sources: vec![CopySource::New, CopySource::Existing],
        matchers,
    }
}

/// Built-in rules preserving server-defaulted spec fields from the live
/// resource so they never read as user edits. The desired document's own
/// value wins when present.
fn default_rebase_rules() -> Vec<RebaseRule> {
    let service = vec![ResourceMatcher::ApiVersionKind {
        api_version: "v1".into(),
        kind: "Service".into(),
    }];
    let service_account = vec![ResourceMatcher::ApiVersionKind {
        api_version: "v1".into(),
        kind: "ServiceAccount".into(),
    }];
    let deployment = vec![ResourceMatcher::ApiVersionKind {
        api_version: "apps/v1".into(),
        kind: "Deployment".into(),
    }];
    vec![
        copy_preferring_new(
            vec![
                Path::from_keys(&["spec", "clusterIP"]),
                Path::from_keys(&["spec", "clusterIPs"]),
                Path::from_keys(&["spec", "ipFamilies"]),
                Path::from_keys(&["spec", "ipFamilyPolicy"]),
                Path::from_keys(&["spec", "internalTrafficPolicy"]),
                Path::from_keys(&["spec", "sessionAffinity"]),
                Path::from_keys(&["spec", "type"]),
            ],
            service.clone(),
        ),
        {
            let mut node_port = Path::from_keys(&["spec", "ports"]);
            node_port.push(berth_core::PathSegment::AllIndexes);
            node_port.push(berth_core::PathSegment::Key("nodePort".into()));
            copy_preferring_new(vec![node_port], service)
        },
        copy_preferring_new(
            vec![Path::from_keys(&["secrets"]), Path::from_keys(&["imagePullSecrets"])],
            service_account,
        ),
        copy_preferring_new(
            vec![Path::from_keys(&[
                "metadata",
                "annotations",
                "deployment.kubernetes.io/revision",
            ])],
            deployment,
        ),
    ]
}

/// Fields excluded when diffing against the recorded snapshot or the live
/// resource: the server writes them on every pass, so they churn between
/// applies without any operator intent behind them.
fn default_diff_exclusions() -> Vec<FieldRemoveMod> {
    [
        Path::from_keys(&["status"]),
        Path::from_keys(&["metadata", "resourceVersion"]),
        Path::from_keys(&["metadata", "uid"]),
        Path::from_keys(&["metadata", "generation"]),
        Path::from_keys(&["metadata", "creationTimestamp"]),
        Path::from_keys(&["metadata", "managedFields"]),
        Path::from_keys(&["metadata", "selfLink"]),
    ]
    .into_iter()
    .map(FieldRemoveMod::all)
    .collect()
}

fn default_reference_rules() -> Vec<ReferenceRule> {
    vec![
        ReferenceRule {
            from_kind: "Pod".into(),
            from_path: Path::from_keys(&["spec", "serviceAccountName"]),
            to_kind: "ServiceAccount".into(),
        },
        ReferenceRule {
            from_kind: "PersistentVolumeClaim".into(),
            from_path: Path::from_keys(&["spec", "storageClassName"]),
            to_kind: "StorageClass".into(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(yaml: &str) -> Resource {
        let v: serde_json::Value =
            serde_json::to_value(serde_yaml::from_str::<serde_yaml::Value>(yaml).unwrap()).unwrap();
        Resource::from_value(v).unwrap()
    }

    #[test]
    fn splits_config_docs_from_resources() {
        let cfg = parse(
            r#"
apiVersion: berth.dev/v1alpha1
kind: Config
metadata: {name: user-config}
rebaseRules:
- path: [spec, selector]
  type: copy
  sources: [existing]
  resourceMatchers:
  - allResourceMatcher: {}
waitRules: {timeoutSeconds: 120}
"#,
        );
        let svc = parse(
            r#"
apiVersion: v1
kind: Service
metadata: {name: redis-master}
"#,
        );
        let defaults = ConfigBundle::default().rebase_rules.len();
        let (plain, bundle) = ConfigBundle::from_resources(vec![cfg, svc]).unwrap();
        assert_eq!(plain.len(), 1);
        assert_eq!(plain[0].kind(), "Service");
        assert_eq!(bundle.rebase_rules.len(), defaults + 1);
        assert_eq!(bundle.wait.change_timeout, Duration::from_secs(120));
        // Untouched knobs keep defaults.
        assert_eq!(bundle.wait.poll_interval, Duration::from_secs(1));
    }

    #[test]
    fn rejects_copy_rule_without_sources() {
        let cfg = parse(
            r#"
apiVersion: berth.dev/v1alpha1
kind: Config
metadata: {name: bad}
rebaseRules:
- path: [spec]
  type: copy
"#,
        );
        let err = ConfigBundle::from_resources(vec![cfg]).unwrap_err();
        assert!(err.to_string().contains("without sources"));
    }

    #[test]
    fn remove_rule_needs_no_sources() {
        let cfg = parse(
            r#"
apiVersion: berth.dev/v1alpha1
kind: Config
metadata: {name: ok}
rebaseRules:
- paths:
  - [metadata, annotations, kubectl.kubernetes.io/last-applied-configuration]
  type: remove
  resourceMatchers:
  - allResourceMatcher: {}
"#,
        );
        let (_, bundle) = ConfigBundle::from_resources(vec![cfg]).unwrap();
        let rule = bundle.rebase_rules.last().unwrap();
        assert_eq!(rule.op, RebaseOp::Remove);
        assert_eq!(rule.paths.len(), 1);
    }

    #[test]
    fn exclusion_rules_expand_paths() {
        let cfg = parse(
            r#"
apiVersion: berth.dev/v1alpha1
kind: Config
metadata: {name: excl}
diffAgainstLastAppliedFieldExclusionRules:
- paths:
  - [spec, replicas]
  - [spec, paused]
  resourceMatchers:
  - apiVersionKindMatcher: {apiVersion: apps/v1, kind: Deployment}
"#,
        );
        let before = ConfigBundle::default().diff_exclusions.len();
        let (_, bundle) = ConfigBundle::from_resources(vec![cfg]).unwrap();
        assert_eq!(bundle.diff_exclusions.len(), before + 2);
    }

    #[test]
    fn default_rules_cover_service_cluster_ip() {
        let bundle = ConfigBundle::default();
        let svc = Resource::from_value(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": "s"}
        }))
        .unwrap();
        let matching: Vec<_> = bundle.rebase_rules.iter().filter(|r| r.matches(&svc)).collect();
        assert!(matching
            .iter()
            .any(|r| r.paths.iter().any(|p| p.to_string() == "spec.clusterIP")));
    }
}
