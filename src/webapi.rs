//! Management endpoints: task listing, launch, terminate, logs, access
//! counts, and purge, with the fixed authorization policy applied per path.

use crate::auth::{Auth, API_METHODS, AUTH_COOKIE_EXPIRE, WEB_METHODS};
use crate::config::{Config, API_CALL_TIMEOUT};
use crate::pool::UpstreamBody;
use crate::proxy::{text_response, ProxyResponse};
use crate::purge::{PurgeEngine, PurgeRequest};
use crate::task::{TaskRunner, STATUS_RUNNING};
use crate::types::{
    APIAccessResponse, APICommonResponse, APILaunchRequest, APIListResponse, APILogsResponse,
    APIPurgeRequest, APIPurgeResponse, APITerminateRequest,
};
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use glob::Pattern;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderValue};
use hyper::{Method, Request, Response, StatusCode};
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use tracing::{debug, error, warn};

/// Default window for `/api/access` queries, in seconds.
const DEFAULT_ACCESS_DURATION: i64 = 86400;

/// Maximum length of a launch parameter value, in unicode code points.
const MAX_PARAMETER_LENGTH: usize = 255;

fn subdomain_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[a-zA-Z*?\[\]][a-zA-Z0-9\-*?\[\]]{0,61}[a-zA-Z0-9*?\[\]]$")
            .expect("subdomain regex compiles")
    })
}

/// Validate a subdomain: DNS-label shaped, glob metacharacters allowed,
/// and usable as a glob pattern.
pub fn validate_subdomain(s: &str) -> Result<()> {
    if !subdomain_regex().is_match(s) {
        bail!("subdomain format is invalid");
    }
    if Pattern::new(s).is_err() {
        bail!("subdomain is not a valid pattern");
    }
    Ok(())
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> ProxyResponse {
    let body = serde_json::to_string(value).unwrap_or_else(|_| r#"{"result":"encoding error"}"#.to_string());
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

fn result_response(status: StatusCode, message: impl Into<String>) -> ProxyResponse {
    json_response(status, &APICommonResponse { result: message.into() })
}

fn redirect_see_other(location: &str) -> ProxyResponse {
    Response::builder()
        .status(StatusCode::SEE_OTHER)
        .header(hyper::header::LOCATION, location)
        .body(Full::new(Bytes::new()).map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

/// Run an orchestrator call under the API timeout.
async fn with_api_timeout<T, F>(fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(API_CALL_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => bail!("api call timed out"),
    }
}

pub struct WebApi {
    cfg: Arc<Config>,
    auth: Option<Arc<Auth>>,
    runner: Arc<dyn TaskRunner>,
    purge: PurgeEngine,
}

impl WebApi {
    pub fn new(cfg: Arc<Config>, auth: Option<Arc<Auth>>, runner: Arc<dyn TaskRunner>) -> Self {
        let purge = PurgeEngine::new(Arc::clone(&runner));
        Self { cfg, auth, runner, purge }
    }

    /// Dispatch one request against the management surface.
    pub async fn handle(&self, req: Request<UpstreamBody>) -> ProxyResponse {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let is_api = path.starts_with("/api/");
        debug!(method = %method, path = %path, "webapi request");

        let mut issue_cookie = false;
        if let Some(auth) = &self.auth {
            let kinds = if is_api { API_METHODS } else { WEB_METHODS };
            match auth.authorize(req.headers(), kinds).await {
                Ok(decision) if decision.allowed => {
                    issue_cookie = !is_api;
                }
                Ok(decision) => {
                    let mut resp = text_response(StatusCode::UNAUTHORIZED, "unauthorized");
                    if decision.challenge_basic {
                        resp.headers_mut().insert(
                            hyper::header::WWW_AUTHENTICATE,
                            HeaderValue::from_static("Basic realm=\"Restricted\""),
                        );
                    }
                    return resp;
                }
                Err(e) => {
                    warn!(error = %e, "authorization failed");
                    return text_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        format!("authorization error: {e}"),
                    );
                }
            }
        }

        // Cookie-based web sessions need a CSRF check on state-changing
        // endpoints: the Origin host must be this web API host.
        if !is_api && (path == "/launch" || path == "/terminate") {
            if let Err(resp) = self.check_origin(req.headers()) {
                return resp;
            }
        }

        let mut resp = match (method, path.as_str()) {
            (Method::GET, "/api/list") => self.api_list().await,
            (Method::POST, "/api/launch") => self.api_launch(req).await,
            (Method::POST, "/api/terminate") => self.api_terminate(req).await,
            (Method::GET, "/api/logs") => self.api_logs(req).await,
            (Method::GET, "/api/access") => self.api_access(req).await,
            (Method::POST, "/api/purge") => self.api_purge(req).await,
            (Method::GET, "/") => self.web_root().await,
            (Method::POST, "/launch") => self.web_launch(req).await,
            (Method::POST, "/terminate") => self.web_terminate(req).await,
            (_, "/api/list" | "/api/logs" | "/api/access" | "/") => {
                text_response(StatusCode::METHOD_NOT_ALLOWED, "you must use GET")
            }
            (_, "/api/launch" | "/api/terminate" | "/api/purge" | "/launch" | "/terminate") => {
                text_response(StatusCode::METHOD_NOT_ALLOWED, "you must use POST")
            }
            _ => text_response(StatusCode::NOT_FOUND, "not found"),
        };

        if issue_cookie {
            if let Some(auth) = &self.auth {
                match auth.new_auth_cookie(AUTH_COOKIE_EXPIRE, &self.cfg.host.reverse_proxy_suffix) {
                    Ok(Some(cookie)) => {
                        if let Ok(value) = HeaderValue::from_str(&cookie) {
                            resp.headers_mut().append(hyper::header::SET_COOKIE, value);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "failed to issue auth cookie"),
                }
            }
        }
        resp
    }

    fn check_origin(&self, headers: &HeaderMap) -> Result<(), ProxyResponse> {
        let origin = headers
            .get(hyper::header::ORIGIN)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if origin.is_empty() {
            return Err(text_response(StatusCode::BAD_REQUEST, "origin header is required"));
        }
        let host = origin
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(origin)
            .split(|c| c == '/' || c == ':')
            .next()
            .unwrap_or_default();
        if !host.eq_ignore_ascii_case(&self.cfg.host.web_api) {
            warn!(origin = %origin, "origin does not match webapi host");
            return Err(text_response(
                StatusCode::BAD_REQUEST,
                format!("origin {origin} is not allowed"),
            ));
        }
        Ok(())
    }

    async fn api_list(&self) -> ProxyResponse {
        match with_api_timeout(self.runner.list(STATUS_RUNNING)).await {
            Ok(result) => json_response(StatusCode::OK, &APIListResponse { result }),
            Err(e) => {
                warn!(error = %e, "failed to list tasks");
                result_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        }
    }

    async fn web_root(&self) -> ProxyResponse {
        match with_api_timeout(self.runner.list(STATUS_RUNNING)).await {
            Ok(tasks) => {
                let mut body = String::from("mirage-ecs running tasks:\n");
                for t in &tasks {
                    body.push_str(&format!(
                        "{}\t{}\t{}\t{}\t{}\t{}\n",
                        t.subdomain,
                        t.branch,
                        t.taskdef,
                        t.ip_address,
                        t.created.to_rfc3339(),
                        t.last_status,
                    ));
                }
                text_response(StatusCode::OK, body)
            }
            Err(e) => {
                warn!(error = %e, "failed to list tasks");
                text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        }
    }

    async fn api_launch(&self, req: Request<UpstreamBody>) -> ProxyResponse {
        let launch_req = match parse_launch_request(req).await {
            Ok(r) => r,
            Err(resp) => return resp,
        };
        match self.do_launch(launch_req).await {
            Ok(()) => json_response(StatusCode::OK, &APICommonResponse::ok()),
            Err((status, message)) => result_response(status, message),
        }
    }

    async fn web_launch(&self, req: Request<UpstreamBody>) -> ProxyResponse {
        let launch_req = match parse_launch_request(req).await {
            Ok(r) => r,
            Err(resp) => return resp,
        };
        match self.do_launch(launch_req).await {
            Ok(()) => redirect_see_other("/"),
            Err((status, message)) => result_response(status, message),
        }
    }

    async fn do_launch(&self, req: APILaunchRequest) -> Result<(), (StatusCode, String)> {
        let subdomain = req.subdomain.to_lowercase();
        let mut taskdefs = req.taskdef;
        if taskdefs.is_empty() {
            taskdefs = self.cfg.launch.default_task_definitions.clone();
        }
        if subdomain.is_empty() || taskdefs.is_empty() {
            return Err((
                StatusCode::BAD_REQUEST,
                format!("parameter required: subdomain={subdomain}, taskdef={taskdefs:?}"),
            ));
        }
        validate_subdomain(&subdomain).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

        let mut values = req.parameters;
        if !req.branch.is_empty() {
            values.entry("branch".to_string()).or_insert(req.branch);
        }
        let params = self
            .load_parameters(&values)
            .map_err(|e| (StatusCode::BAD_REQUEST, e))?;

        match with_api_timeout(self.runner.launch(&subdomain, &params, &taskdefs)).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(subdomain = %subdomain, error = %e, "launch failed");
                Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
            }
        }
    }

    /// Coerce submitted values against the configured parameter schema.
    fn load_parameters(&self, values: &HashMap<String, String>) -> Result<HashMap<String, String>, String> {
        let mut out = HashMap::new();
        for p in &self.cfg.parameters {
            let mut value = values.get(&p.name).cloned().unwrap_or_default();
            if value.is_empty() {
                value = p.default.clone();
            }
            if value.is_empty() {
                if p.required {
                    return Err(format!("parameter {} is required", p.name));
                }
                continue;
            }
            if value.chars().count() > MAX_PARAMETER_LENGTH {
                return Err(format!(
                    "parameter {} value is too long (max {MAX_PARAMETER_LENGTH} characters)",
                    p.name
                ));
            }
            if let Some(re) = &p.regex {
                if !re.is_match(&value) {
                    return Err(format!("parameter {} value is rule error", p.name));
                }
            }
            if !p.options.is_empty() && !p.options.contains(&value) {
                return Err(format!(
                    "parameter {} value must be one of {:?}",
                    p.name, p.options
                ));
            }
            out.insert(p.name.clone(), value);
        }
        Ok(out)
    }

    async fn api_terminate(&self, req: Request<UpstreamBody>) -> ProxyResponse {
        match self.do_terminate(req).await {
            Ok(()) => json_response(StatusCode::OK, &APICommonResponse::ok()),
            Err((status, message)) => result_response(status, message),
        }
    }

    async fn web_terminate(&self, req: Request<UpstreamBody>) -> ProxyResponse {
        match self.do_terminate(req).await {
            Ok(()) => redirect_see_other("/"),
            Err((status, message)) => result_response(status, message),
        }
    }

    async fn do_terminate(&self, req: Request<UpstreamBody>) -> Result<(), (StatusCode, String)> {
        let terminate_req: APITerminateRequest = match parse_body(req).await {
            Ok(r) => r,
            Err(message) => return Err((StatusCode::BAD_REQUEST, message)),
        };
        let id = terminate_req.id.filter(|s| !s.is_empty());
        let subdomain = terminate_req.subdomain.filter(|s| !s.is_empty());
        let result = match (id, subdomain) {
            (Some(id), None) => with_api_timeout(self.runner.terminate(&id)).await,
            (None, Some(subdomain)) => {
                with_api_timeout(self.runner.terminate_by_subdomain(&subdomain.to_lowercase())).await
            }
            _ => {
                return Err((
                    StatusCode::BAD_REQUEST,
                    "parameter required: id or subdomain (exactly one)".to_string(),
                ))
            }
        };
        result.map_err(|e| {
            warn!(error = %e, "terminate failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })
    }

    async fn api_logs(&self, req: Request<UpstreamBody>) -> ProxyResponse {
        let params = query_pairs(&req);
        let subdomain = match single(&params, "subdomain") {
            Some(s) => s,
            None => return result_response(StatusCode::BAD_REQUEST, "parameter required: subdomain"),
        };
        let since: Option<DateTime<Utc>> = match single(&params, "since") {
            Some(raw) => match DateTime::parse_from_rfc3339(&raw) {
                Ok(ts) => Some(ts.with_timezone(&Utc)),
                Err(e) => {
                    return result_response(StatusCode::BAD_REQUEST, format!("cannot parse since: {e}"))
                }
            },
            None => None,
        };
        let tail = match single(&params, "tail") {
            None => None,
            Some(raw) if raw == "all" => None,
            Some(raw) => match raw.parse::<usize>() {
                Ok(n) => Some(n),
                Err(e) => {
                    return result_response(StatusCode::BAD_REQUEST, format!("cannot parse tail: {e}"))
                }
            },
        };

        match with_api_timeout(self.runner.logs(&subdomain, since, tail)).await {
            Ok(result) => json_response(StatusCode::OK, &APILogsResponse { result }),
            Err(e) => {
                warn!(subdomain = %subdomain, error = %e, "failed to get logs");
                result_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        }
    }

    async fn api_access(&self, req: Request<UpstreamBody>) -> ProxyResponse {
        let params = query_pairs(&req);
        let subdomain = match single(&params, "subdomain") {
            Some(s) => s,
            None => return result_response(StatusCode::BAD_REQUEST, "parameter required: subdomain"),
        };
        let duration = match single(&params, "duration") {
            Some(raw) => match raw.parse::<i64>() {
                Ok(n) if n > 0 => n,
                Ok(_) => {
                    return result_response(StatusCode::BAD_REQUEST, "duration must be positive")
                }
                Err(e) => {
                    return result_response(
                        StatusCode::BAD_REQUEST,
                        format!("cannot parse duration: {e}"),
                    )
                }
            },
            None => DEFAULT_ACCESS_DURATION,
        };

        let window = std::time::Duration::from_secs(duration as u64);
        match with_api_timeout(self.runner.get_access_count(&subdomain, window)).await {
            Ok(sum) => json_response(
                StatusCode::OK,
                &APIAccessResponse { result: "ok".to_string(), duration, sum },
            ),
            Err(e) => {
                warn!(subdomain = %subdomain, error = %e, "failed to get access count");
                result_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        }
    }

    async fn api_purge(&self, req: Request<UpstreamBody>) -> ProxyResponse {
        let purge_req = match parse_purge_request(req).await {
            Ok(r) => r,
            Err(message) => return result_response(StatusCode::BAD_REQUEST, message),
        };
        let request = match PurgeRequest::parse(purge_req.duration, purge_req.excludes, purge_req.exclude_tags) {
            Ok(r) => r,
            Err(e) => return result_response(StatusCode::BAD_REQUEST, e.to_string()),
        };
        match self.purge.purge(request).await {
            Ok(()) => json_response(
                StatusCode::ACCEPTED,
                &APIPurgeResponse { status: "accepted".to_string() },
            ),
            Err(e) => {
                error!(error = %e, "failed to start purge");
                result_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        }
    }
}

fn query_pairs(req: &Request<UpstreamBody>) -> Vec<(String, String)> {
    req.uri()
        .query()
        .and_then(|q| serde_urlencoded::from_str::<Vec<(String, String)>>(q).ok())
        .unwrap_or_default()
}

fn single(pairs: &[(String, String)], name: &str) -> Option<String> {
    pairs
        .iter()
        .find(|(k, v)| k == name && !v.is_empty())
        .map(|(_, v)| v.clone())
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(hyper::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("application/json"))
        .unwrap_or(false)
}

async fn read_body(req: Request<UpstreamBody>) -> Result<(HeaderMap, Bytes), String> {
    let (parts, body) = req.into_parts();
    let bytes = body
        .collect()
        .await
        .map_err(|e| format!("cannot read request body: {e}"))?
        .to_bytes();
    Ok((parts.headers, bytes))
}

/// Deserialize a request body from JSON or an urlencoded form.
async fn parse_body<T>(req: Request<UpstreamBody>) -> Result<T, String>
where
    T: serde::de::DeserializeOwned,
{
    let (headers, bytes) = read_body(req).await?;
    if is_json(&headers) {
        serde_json::from_slice(&bytes).map_err(|e| format!("invalid json: {e}"))
    } else {
        serde_urlencoded::from_bytes(&bytes).map_err(|e| format!("invalid form body: {e}"))
    }
}

/// Purge requests accept repeated `excludes`/`exclude_tags` form fields,
/// so the form variant is assembled by hand.
async fn parse_purge_request(req: Request<UpstreamBody>) -> Result<APIPurgeRequest, String> {
    let (headers, bytes) = read_body(req).await?;
    if is_json(&headers) {
        return serde_json::from_slice(&bytes).map_err(|e| format!("invalid json: {e}"));
    }
    let pairs: Vec<(String, String)> =
        serde_urlencoded::from_bytes(&bytes).map_err(|e| format!("invalid form body: {e}"))?;
    let mut purge = APIPurgeRequest::default();
    for (key, value) in pairs {
        match key.as_str() {
            "duration" => {
                purge.duration = value
                    .parse()
                    .map_err(|e| format!("cannot parse duration: {e}"))?;
            }
            "excludes" => purge.excludes.push(value),
            "exclude_tags" => purge.exclude_tags.push(value),
            _ => {}
        }
    }
    Ok(purge)
}

/// Launch requests accept repeated `taskdef` form fields and arbitrary
/// parameter fields, so the form variant is assembled by hand.
async fn parse_launch_request(req: Request<UpstreamBody>) -> Result<APILaunchRequest, ProxyResponse> {
    let (headers, bytes) = read_body(req)
        .await
        .map_err(|message| result_response(StatusCode::BAD_REQUEST, message))?;
    if is_json(&headers) {
        return serde_json::from_slice(&bytes)
            .map_err(|e| result_response(StatusCode::BAD_REQUEST, format!("invalid json: {e}")));
    }
    let pairs: Vec<(String, String)> = serde_urlencoded::from_bytes(&bytes)
        .map_err(|e| result_response(StatusCode::BAD_REQUEST, format!("invalid form body: {e}")))?;
    let mut launch = APILaunchRequest::default();
    for (key, value) in pairs {
        match key.as_str() {
            "subdomain" => launch.subdomain = value,
            "taskdef" => launch.taskdef.push(value),
            "branch" => launch.branch = value,
            _ => {
                launch.parameters.insert(key, value);
            }
        }
    }
    Ok(launch)
}
