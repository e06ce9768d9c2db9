use crate::duration::{DurationError, parse_duration};
use chrono::{DateTime, Utc};
use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub static REQUESTED_AT_ANNOTATION: &str = "image.reflector.dev/requestedAt";
pub static DEFAULT_EXCLUSION: &str = r"^.*\.sig$";
static LATEST_TAGS_LIMIT: usize = 10;

/// Declares an image repository whose tags should be scanned periodically.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "image.reflector.dev",
    version = "v1alpha1",
    kind = "ImageRepository",
    plural = "imagerepositories",
    shortname = "imagerepo",
    namespaced,
    status = "ImageRepositoryStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".status.canonicalImageName"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Tags","type":"integer","jsonPath":".status.lastScanResult.tagCount"}"#,
    printcolumn = r#"{"name":"LastScan","type":"date","jsonPath":".status.lastScanResult.scanTime"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ImageRepositorySpec {
    /// Image reference, e.g. `alpine` or `ghcr.io/org/app`
    pub image: String,
    /// Time between scans, e.g. `1m` or `1h30m`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_interval: Option<String>,
    /// Upper bound for a single scan
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretReference>,
    #[serde(default)]
    pub suspend: bool,
    /// Regular expressions; matching tags are left out of the scan result
    #[serde(default = "default_exclusion_list")]
    pub exclusion_list: Vec<String>,
}

fn default_exclusion_list() -> Vec<String> {
    vec![DEFAULT_EXCLUSION.to_string()]
}

impl ImageRepositorySpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            scan_interval: None,
            timeout: None,
            secret_ref: None,
            suspend: false,
            exclusion_list: default_exclusion_list(),
        }
    }

    pub fn scan_interval_or(&self, default: Duration) -> Result<Duration, DurationError> {
        self.scan_interval
            .as_deref()
            .map_or(Ok(default), parse_duration)
    }

    pub fn timeout(&self) -> Result<Option<Duration>, DurationError> {
        self.timeout.as_deref().map(parse_duration).transpose()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct SecretReference {
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageRepositoryStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub canonical_image_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scan_result: Option<ScanSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scan_error: Option<LastScanError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub consecutive_failures: u32,
    /// When the registry was last queried for this resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_handled_reconcile_at: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScanSummary {
    pub tag_count: usize,
    pub scan_time: DateTime<Utc>,
    /// The last few tags in the order the registry returned them
    #[serde(default)]
    pub latest_tags: Vec<String>,
}

impl ScanSummary {
    pub fn from_tags(tags: &[String], scan_time: DateTime<Utc>) -> Self {
        let skip = tags.len().saturating_sub(LATEST_TAGS_LIMIT);
        Self {
            tag_count: tags.len(),
            scan_time,
            latest_tags: tags[skip..].to_vec(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct LastScanError {
    pub classification: ErrorClass,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    InvalidReference,
    InvalidSpec,
    NotFound,
    Unauthorized,
    RateLimited,
    Unreachable,
    Timeout,
}

impl ErrorClass {
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorClass::RateLimited | ErrorClass::Unreachable | ErrorClass::Timeout
        )
    }

    pub fn reason(self) -> ConditionReason {
        match self {
            ErrorClass::InvalidReference | ErrorClass::InvalidSpec => ConditionReason::InvalidSpec,
            ErrorClass::NotFound => ConditionReason::NotFound,
            ErrorClass::Unauthorized => ConditionReason::Unauthorized,
            ErrorClass::RateLimited => ConditionReason::RateLimited,
            ErrorClass::Unreachable => ConditionReason::Unreachable,
            ErrorClass::Timeout => ConditionReason::Timeout,
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionType {
    Ready,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value { ConditionStatus::True } else { ConditionStatus::False }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionReason {
    Succeeded,
    Suspended,
    InvalidSpec,
    NotFound,
    Unauthorized,
    RateLimited,
    Unreachable,
    Timeout,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    pub reason: ConditionReason,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

impl ImageRepositoryStatus {
    pub fn ready_condition(&self) -> Option<&Condition> {
        self.conditions
            .iter()
            .find(|c| c.type_ == ConditionType::Ready)
    }

    pub fn is_ready(&self) -> bool {
        self.ready_condition()
            .is_some_and(|c| c.status == ConditionStatus::True)
    }

    /// The transition time only moves when the status flips.
    pub fn set_ready(
        &mut self,
        ready: bool,
        reason: ConditionReason,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        let status = ConditionStatus::from(ready);
        let message = message.into();
        match self
            .conditions
            .iter_mut()
            .find(|c| c.type_ == ConditionType::Ready)
        {
            Some(condition) => {
                if condition.status != status {
                    condition.status = status;
                    condition.last_transition_time = now;
                }
                condition.reason = reason;
                condition.message = message;
            }
            None => self.conditions.push(Condition {
                type_: ConditionType::Ready,
                status,
                reason,
                message,
                last_transition_time: now,
            }),
        }
    }
}

/// Namespace-qualified identity of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn of<K: Resource>(resource: &K) -> Option<Self> {
        Some(Self::new(resource.namespace()?, resource.meta().name.clone()?))
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl ImageRepository {
    pub fn requested_at(&self) -> Option<&str> {
        self.annotations()
            .get(REQUESTED_AT_ANNOTATION)
            .map(String::as_str)
    }

    pub fn with_key(key: &ResourceKey, spec: ImageRepositorySpec) -> Self {
        let mut repository = ImageRepository::new(&key.name, spec);
        repository.metadata.namespace = Some(key.namespace.clone());
        repository
    }

    #[cfg(test)]
    pub(crate) fn annotate(&mut self, name: &str, value: &str) {
        self.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(name.to_string(), value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
    }

    #[test]
    fn test_spec_defaults_from_yaml() {
        let spec: ImageRepositorySpec = serde_yaml_ng::from_str("image: alpine").unwrap();
        assert_eq!(spec, ImageRepositorySpec::new("alpine"));
        assert_eq!(spec.exclusion_list, vec![DEFAULT_EXCLUSION.to_string()]);
        assert_eq!(
            spec.scan_interval_or(Duration::from_secs(60)).unwrap(),
            Duration::from_secs(60)
        );
        assert_eq!(spec.timeout().unwrap(), None);
    }

    #[test]
    fn test_spec_intervals() {
        let mut spec = ImageRepositorySpec::new("alpine");
        spec.scan_interval = Some("5m".into());
        spec.timeout = Some("20s".into());
        assert_eq!(
            spec.scan_interval_or(Duration::from_secs(60)).unwrap(),
            Duration::from_secs(300)
        );
        assert_eq!(spec.timeout().unwrap(), Some(Duration::from_secs(20)));

        spec.scan_interval = Some("often".into());
        assert!(spec.scan_interval_or(Duration::from_secs(60)).is_err());
    }

    #[test]
    fn test_set_ready_only_moves_transition_time_on_flip() {
        let mut status = ImageRepositoryStatus::default();
        status.set_ready(false, ConditionReason::RateLimited, "too many requests", at(0));
        status.set_ready(false, ConditionReason::Unreachable, "connection refused", at(10));
        let condition = status.ready_condition().unwrap();
        assert_eq!(condition.last_transition_time, at(0));
        assert_eq!(condition.reason, ConditionReason::Unreachable);

        status.set_ready(true, ConditionReason::Succeeded, "found 3 tags", at(20));
        assert!(status.is_ready());
        assert_eq!(status.ready_condition().unwrap().last_transition_time, at(20));
        assert_eq!(status.conditions.len(), 1);
    }

    #[test]
    fn test_status_serializes_ready_condition_type() {
        let mut status = ImageRepositoryStatus::default();
        status.set_ready(true, ConditionReason::Succeeded, "ok", at(0));
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["conditions"][0]["type"], "Ready");
        assert_eq!(json["conditions"][0]["status"], "True");
        assert!(json.get("canonicalImageName").is_none());
    }

    #[test]
    fn test_scan_summary_keeps_tail_in_received_order() {
        let tags: Vec<String> = (0..15).map(|i| format!("v{}", i)).collect();
        let summary = ScanSummary::from_tags(&tags, at(0));
        assert_eq!(summary.tag_count, 15);
        assert_eq!(summary.latest_tags.first().map(String::as_str), Some("v5"));
        assert_eq!(summary.latest_tags.last().map(String::as_str), Some("v14"));
    }

    #[test]
    fn test_resource_key_and_annotation() {
        let key = ResourceKey::new("default", "alpine-image");
        let mut repository = ImageRepository::with_key(&key, ImageRepositorySpec::new("alpine"));
        assert_eq!(ResourceKey::of(&repository), Some(key.clone()));
        assert_eq!(key.to_string(), "default/alpine-image");
        assert_eq!(repository.requested_at(), None);
        repository.annotate(REQUESTED_AT_ANNOTATION, "now");
        assert_eq!(repository.requested_at(), Some("now"));
    }

    #[test]
    fn test_error_class_transience() {
        assert!(ErrorClass::RateLimited.is_transient());
        assert!(ErrorClass::Timeout.is_transient());
        assert!(!ErrorClass::NotFound.is_transient());
        assert_eq!(ErrorClass::InvalidReference.reason(), ConditionReason::InvalidSpec);
    }
}
