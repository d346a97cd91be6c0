//! JSON request and response shapes for the web API.

use crate::task::TaskInfo;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Response of `/api/list`.
#[derive(Debug, Serialize)]
pub struct APIListResponse {
    pub result: Vec<TaskInfo>,
}

/// Response of `/api/launch` and `/api/terminate`.
#[derive(Debug, Serialize)]
pub struct APICommonResponse {
    pub result: String,
}

impl APICommonResponse {
    pub fn ok() -> Self {
        Self { result: "ok".to_string() }
    }
}

/// Response of `/api/purge`.
#[derive(Debug, Serialize)]
pub struct APIPurgeResponse {
    pub status: String,
}

/// Response of `/api/logs`.
#[derive(Debug, Serialize)]
pub struct APILogsResponse {
    pub result: Vec<String>,
}

/// Response of `/api/access`.
#[derive(Debug, Serialize)]
pub struct APIAccessResponse {
    pub result: String,
    pub duration: i64,
    pub sum: i64,
}

/// Body of `POST /api/launch`.
#[derive(Debug, Default, Deserialize)]
pub struct APILaunchRequest {
    #[serde(default)]
    pub subdomain: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default, deserialize_with = "string_or_seq")]
    pub taskdef: Vec<String>,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

/// Body of `POST /api/terminate`.
#[derive(Debug, Default, Deserialize)]
pub struct APITerminateRequest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub subdomain: Option<String>,
}

/// Body of `POST /api/purge`.
#[derive(Debug, Default, Deserialize)]
pub struct APIPurgeRequest {
    #[serde(default, deserialize_with = "i64_or_string")]
    pub duration: i64,
    #[serde(default)]
    pub excludes: Vec<String>,
    #[serde(default)]
    pub exclude_tags: Vec<String>,
}

/// Accept a single string or an array of strings.
fn string_or_seq<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrSeq {
        One(String),
        Many(Vec<String>),
    }
    Ok(match StringOrSeq::deserialize(deserializer)? {
        StringOrSeq::One(s) => vec![s],
        StringOrSeq::Many(v) => v,
    })
}

/// Accept a JSON number or its string form.
fn i64_or_string<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrString {
        Num(i64),
        Str(String),
    }
    match NumOrString::deserialize(deserializer)? {
        NumOrString::Num(n) => Ok(n),
        NumOrString::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_request_taskdef_forms() {
        let single: APILaunchRequest =
            serde_json::from_str(r#"{"subdomain":"app","taskdef":"review:1"}"#).unwrap();
        assert_eq!(single.taskdef, vec!["review:1"]);

        let many: APILaunchRequest = serde_json::from_str(
            r#"{"subdomain":"app","taskdef":["review:1","worker:2"],"branch":"main","parameters":{"size":"small"}}"#,
        )
        .unwrap();
        assert_eq!(many.taskdef, vec!["review:1", "worker:2"]);
        assert_eq!(many.branch, "main");
        assert_eq!(many.parameters.get("size").map(String::as_str), Some("small"));
    }

    #[test]
    fn test_purge_request_duration_forms() {
        let num: APIPurgeRequest = serde_json::from_str(r#"{"duration":3600}"#).unwrap();
        assert_eq!(num.duration, 3600);

        let s: APIPurgeRequest = serde_json::from_str(
            r#"{"duration":"86400","excludes":["keep"],"exclude_tags":["DontPurge:true"]}"#,
        )
        .unwrap();
        assert_eq!(s.duration, 86400);
        assert_eq!(s.excludes, vec!["keep"]);
        assert_eq!(s.exclude_tags, vec!["DontPurge:true"]);
    }

    #[test]
    fn test_common_response_serializes() {
        let ok = APICommonResponse::ok();
        assert_eq!(serde_json::to_string(&ok).unwrap(), r#"{"result":"ok"}"#);
    }
}
