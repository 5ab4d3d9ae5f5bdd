//! Remote directory access: transport seam, HTTP transport, pacing and wire decoding.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use memsync_core::{
    parse_listing_date, parse_wire_date, slug, GroupRole, RemoteEntry, RemoteMemberDetail,
};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info_span, trace, warn, Instrument};

pub const CRATE_NAME: &str = "memsync-remote";

/// Fixed delay inserted before every remote call.
pub const DEFAULT_PACING: Duration = Duration::from_millis(250);
pub const DEFAULT_PAGE_SIZE: usize = 100;

const COLUMN_MEMBER_NUMBER: &str = "be.vvksm.groepsadmin.model.column.LidNummerColumn";
const COLUMN_FIRST_NAME: &str = "be.vvksm.groepsadmin.model.column.VoornaamColumn";
const COLUMN_LAST_NAME: &str = "be.vvksm.groepsadmin.model.column.AchternaamColumn";
const COLUMN_BIRTH_DATE: &str = "be.vvksm.groepsadmin.model.column.GeboorteDatumColumn";
const COLUMN_GENDER: &str = "be.vvksm.groepsadmin.model.column.GeslachtColumn";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Patch,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Patch => "PATCH",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<JsonValue>,
}

impl RemoteRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn patch(path: impl Into<String>, body: JsonValue) -> Self {
        Self {
            method: Method::Patch,
            path: path.into(),
            query: Vec::new(),
            body: Some(body),
        }
    }

    pub fn post(path: impl Into<String>, body: JsonValue) -> Self {
        Self {
            method: Method::Post,
            path: path.into(),
            query: Vec::new(),
            body: Some(body),
        }
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMessage {
    pub message: String,
    pub field: Option<String>,
}

/// A request the remote directory refused, with its decoded messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFailure {
    pub status: u16,
    pub code: String,
    pub messages: Vec<RemoteMessage>,
}

impl fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .messages
            .iter()
            .map(|m| match &m.field {
                Some(field) => format!("{} ({field})", m.message),
                None => m.message.clone(),
            })
            .collect::<Vec<_>>()
            .join("; ");
        write!(f, "remote directory refused the request ({}): {joined}", self.status)
    }
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("transient network failure on {path}: {message}")]
    Transient { path: String, message: String },
    #[error("{0}")]
    Rejected(RemoteFailure),
    #[error("unexpected response from {path}: {message}")]
    Decode { path: String, message: String },
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient { .. })
    }

    fn decode(path: &str, message: impl ToString) -> Self {
        RemoteError::Decode {
            path: path.to_string(),
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Decodes the handful of error body shapes the remote directory is known to send.
pub fn decode_failure(status: u16, body: &JsonValue) -> RemoteFailure {
    let code = "remote_error".to_string();

    if let Some(errors) = body.get("fouten").and_then(JsonValue::as_array) {
        let messages: Vec<RemoteMessage> = errors
            .iter()
            .filter_map(|e| {
                let message = e.get("beschrijving").and_then(JsonValue::as_str)?;
                Some(RemoteMessage {
                    message: message.to_string(),
                    field: e.get("veld").and_then(JsonValue::as_str).map(str::to_string),
                })
            })
            .collect();
        if !messages.is_empty() {
            return RemoteFailure {
                status,
                code,
                messages,
            };
        }
    }

    if let Some(msg) = body.get("msg").and_then(JsonValue::as_str) {
        return RemoteFailure {
            status,
            code,
            messages: vec![RemoteMessage {
                message: msg.to_string(),
                field: None,
            }],
        };
    }

    let title = body
        .get("titel")
        .or_else(|| body.get("boodschap"))
        .and_then(JsonValue::as_str);
    let message = match title {
        Some(title) => match body.get("beschrijving").and_then(JsonValue::as_str) {
            Some(description) => format!("{title}: {description}"),
            None => title.to_string(),
        },
        None => format!("unknown error response from the remote directory: {body}"),
    };
    RemoteFailure {
        status,
        code,
        messages: vec![RemoteMessage {
            message,
            field: None,
        }],
    }
}

/// Authenticated request primitive the reconciliation core talks through.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request(&self, request: RemoteRequest) -> Result<JsonValue, RemoteError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn request(&self, request: RemoteRequest) -> Result<JsonValue, RemoteError> {
        (**self).request(request).await
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub base_url: String,
    pub access_token: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://groepsadmin.scoutsengidsenvlaanderen.be/groepsadmin/rest-ga"
                .to_string(),
            access_token: String::new(),
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    access_token: String,
}

impl HttpTransport {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            access_token: config.access_token,
        })
    }

    fn transient(path: &str, message: impl ToString) -> RemoteError {
        RemoteError::Transient {
            path: path.to_string(),
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, request: RemoteRequest) -> Result<JsonValue, RemoteError> {
        let span = info_span!("remote_request", method = %request.method, path = %request.path);
        let path = request.path.clone();

        async move {
            let url = format!("{}{}", self.base_url, request.path);
            let method = match request.method {
                Method::Get => reqwest::Method::GET,
                Method::Post => reqwest::Method::POST,
                Method::Patch => reqwest::Method::PATCH,
            };
            let mut builder = self
                .client
                .request(method, &url)
                .bearer_auth(&self.access_token);
            if !request.query.is_empty() {
                builder = builder.query(&request.query);
            }
            if let Some(body) = &request.body {
                builder = builder.json(body);
            }

            let resp = match builder.send().await {
                Ok(resp) => resp,
                Err(err) => {
                    return Err(match classify_reqwest_error(&err) {
                        RetryDisposition::Retryable => Self::transient(&path, err),
                        RetryDisposition::NonRetryable => RemoteError::decode(&path, err),
                    });
                }
            };

            let status = resp.status();
            let bytes = resp
                .bytes()
                .await
                .map_err(|err| Self::transient(&path, err))?;
            debug!(status = status.as_u16(), bytes = bytes.len(), "remote response");

            if status.is_success() {
                if bytes.iter().all(u8::is_ascii_whitespace) {
                    return Ok(JsonValue::Null);
                }
                return serde_json::from_slice(&bytes).map_err(|err| RemoteError::decode(&path, err));
            }

            if classify_status(status) == RetryDisposition::Retryable {
                return Err(Self::transient(&path, format!("http status {status}")));
            }

            let body = serde_json::from_slice::<JsonValue>(&bytes)
                .unwrap_or_else(|_| JsonValue::String(String::from_utf8_lossy(&bytes).into_owned()));
            Err(RemoteError::Rejected(decode_failure(status.as_u16(), &body)))
        }
        .instrument(span)
        .await
    }
}

/// Fixed-delay pacing; the remote service bans clients that call too fast.
#[derive(Debug, Clone, Copy)]
pub struct Pacer {
    delay: Duration,
}

impl Default for Pacer {
    fn default() -> Self {
        Self::new(DEFAULT_PACING)
    }
}

impl Pacer {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub fn none() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub async fn pause(&self) {
        if self.delay.is_zero() {
            return;
        }
        trace!(delay_ms = self.delay.as_millis() as u64, "pacing remote call");
        tokio::time::sleep(self.delay).await;
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ListingPage {
    #[serde(rename = "aantal")]
    count: usize,
    offset: usize,
    #[serde(rename = "totaal")]
    total: usize,
    #[serde(rename = "leden", default)]
    rows: Vec<ListingRow>,
}

#[derive(Debug, Clone, Deserialize)]
struct ListingRow {
    id: String,
    #[serde(rename = "waarden", default)]
    values: Map<String, JsonValue>,
}

#[derive(Debug, Clone, Deserialize)]
struct SearchResponse {
    #[serde(rename = "leden", default)]
    rows: Vec<SearchRow>,
}

#[derive(Debug, Clone, Deserialize)]
struct SearchRow {
    id: String,
    #[serde(rename = "voornaam", default)]
    first_name: String,
    #[serde(rename = "achternaam", default)]
    last_name: String,
    #[serde(rename = "geboortedatum", default)]
    birth_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupAddress {
    #[serde(rename = "straat", default)]
    pub street: String,
    #[serde(rename = "postcode", default)]
    pub postal_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteGroup {
    pub id: String,
    #[serde(rename = "groepsnummer")]
    pub number: String,
    #[serde(rename = "naam")]
    pub name: String,
    #[serde(rename = "adressen", default)]
    pub addresses: Vec<GroupAddress>,
}

#[derive(Debug, Clone, Deserialize)]
struct GroupsResponse {
    #[serde(rename = "groepen", default)]
    groups: Vec<RemoteGroup>,
}

#[derive(Debug, Clone, Deserialize)]
struct RolesResponse {
    #[serde(rename = "functies", default)]
    roles: Vec<GroupRole>,
}

/// How the local organisation is recognised among the remote groups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrganizationIdentity {
    pub name: String,
    pub street: String,
    pub postal_code: String,
}

pub fn find_group<'a>(groups: &'a [RemoteGroup], org: &OrganizationIdentity) -> Option<&'a RemoteGroup> {
    let name = slug(&org.name);
    let street = slug(&org.street);
    let postal_code = slug(&org.postal_code);

    groups.iter().find(|group| {
        if !name.is_empty() && slug(&group.name) == name {
            return true;
        }
        !street.is_empty()
            && group
                .addresses
                .iter()
                .any(|a| slug(&a.street) == street && slug(&a.postal_code) == postal_code)
    })
}

/// Identity the remote assigns to a freshly created member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedMember {
    pub id: String,
    pub member_number: Option<String>,
}

/// Paced access to the remote directory endpoints used by a reconciliation run.
pub struct DirectoryClient<'a> {
    transport: &'a dyn Transport,
    pacer: Pacer,
}

impl<'a> DirectoryClient<'a> {
    pub fn new(transport: &'a dyn Transport, pacer: Pacer) -> Self {
        Self { transport, pacer }
    }

    pub fn pacer(&self) -> Pacer {
        self.pacer
    }

    async fn call(&self, request: RemoteRequest) -> Result<JsonValue, RemoteError> {
        self.pacer.pause().await;
        self.transport.request(request).await
    }

    /// Downloads every entry matching the current server-side filter.
    pub async fn fetch_all(&self, page_size: usize) -> Result<Vec<RemoteEntry>, RemoteError> {
        let mut entries = Vec::new();
        let mut offset = 0usize;
        let mut total = 1usize;

        while offset < total {
            let value = self
                .call(
                    RemoteRequest::get("/ledenlijst")
                        .query("aantal", page_size.max(1))
                        .query("offset", offset),
                )
                .await?;
            let page: ListingPage = serde_json::from_value(value)
                .map_err(|err| RemoteError::decode("/ledenlijst", err))?;
            debug!(offset = page.offset, count = page.count, total = page.total, "fetched listing page");

            let next = page.offset + page.count;
            if next <= offset {
                if next < page.total {
                    warn!(
                        requested = offset,
                        offset = page.offset,
                        count = page.count,
                        total = page.total,
                        "listing page does not advance past the requested offset; stopping"
                    );
                }
                break;
            }

            for row in &page.rows {
                entries.push(listing_row_to_entry(row)?);
            }
            offset = next;
            total = page.total;
        }

        Ok(entries)
    }

    pub async fn fetch_similar(
        &self,
        first_name: &str,
        last_name: &str,
    ) -> Result<Vec<RemoteEntry>, RemoteError> {
        let value = self
            .call(
                RemoteRequest::get("/zoeken/gelijkaardig")
                    .query("voornaam", first_name)
                    .query("achternaam", last_name),
            )
            .await?;
        let response: SearchResponse = serde_json::from_value(value)
            .map_err(|err| RemoteError::decode("/zoeken/gelijkaardig", err))?;

        Ok(response
            .rows
            .into_iter()
            .map(|row| RemoteEntry {
                id: row.id,
                first_name: row.first_name,
                last_name: row.last_name,
                member_number: None,
                gender: None,
                birth_date: row.birth_date.as_deref().and_then(parse_wire_date),
            })
            .collect())
    }

    pub async fn fetch_detail(&self, id: &str) -> Result<RemoteMemberDetail, RemoteError> {
        let path = format!("/lid/{id}");
        let value = self.call(RemoteRequest::get(path.clone())).await?;
        serde_json::from_value(value).map_err(|err| RemoteError::decode(&path, err))
    }

    pub async fn update_member(&self, id: &str, body: JsonValue) -> Result<JsonValue, RemoteError> {
        self.call(RemoteRequest::patch(format!("/lid/{id}"), body).query("bevestig", "true"))
            .await
    }

    pub async fn create_member(&self, body: JsonValue) -> Result<CreatedMember, RemoteError> {
        let value = self
            .call(RemoteRequest::post("/lid", body).query("bevestig", "true"))
            .await?;
        let id = value
            .get("id")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| RemoteError::decode("/lid", "created member has no id"))?;
        let member_number = value
            .get("verbondsgegevens")
            .and_then(|v| v.get("lidnummer"))
            .and_then(JsonValue::as_str)
            .map(str::to_string);
        Ok(CreatedMember {
            id: id.to_string(),
            member_number,
        })
    }

    pub async fn fetch_groups(&self) -> Result<Vec<RemoteGroup>, RemoteError> {
        let value = self.call(RemoteRequest::get("/groep")).await?;
        let response: GroupsResponse =
            serde_json::from_value(value).map_err(|err| RemoteError::decode("/groep", err))?;
        Ok(response.groups)
    }

    pub async fn fetch_roles(&self, group_number: &str) -> Result<Vec<GroupRole>, RemoteError> {
        let value = self
            .call(RemoteRequest::get("/functie").query("groep", group_number))
            .await?;
        let response: RolesResponse =
            serde_json::from_value(value).map_err(|err| RemoteError::decode("/functie", err))?;
        Ok(response.roles)
    }

    /// Restricts the listing endpoint to the current members of the group.
    pub async fn apply_member_filter(
        &self,
        group_number: &str,
        roles: &[GroupRole],
    ) -> Result<(), RemoteError> {
        let body = json!({
            "criteria": {
                "functies": roles.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
                "groepen": [group_number],
                "oudleden": false,
            },
            "kolommen": [
                COLUMN_MEMBER_NUMBER,
                COLUMN_FIRST_NAME,
                COLUMN_LAST_NAME,
                COLUMN_BIRTH_DATE,
                COLUMN_GENDER,
            ],
            "groepen": [],
            "sortering": [COLUMN_MEMBER_NUMBER],
            "type": "lid",
        });
        self.call(RemoteRequest::patch("/ledenlijst/filter/huidige", body))
            .await?;
        Ok(())
    }
}

fn column<'v>(row: &'v ListingRow, key: &str) -> Option<&'v str> {
    row.values.get(key).and_then(JsonValue::as_str)
}

fn listing_row_to_entry(row: &ListingRow) -> Result<RemoteEntry, RemoteError> {
    let raw_date = column(row, COLUMN_BIRTH_DATE).unwrap_or_default();
    let birth_date = parse_listing_date(raw_date).ok_or_else(|| {
        RemoteError::decode(
            "/ledenlijst",
            format!("member {}: expected DD/MM/YYYY birth date, got {raw_date:?}", row.id),
        )
    })?;

    Ok(RemoteEntry {
        id: row.id.clone(),
        first_name: column(row, COLUMN_FIRST_NAME).unwrap_or_default().to_string(),
        last_name: column(row, COLUMN_LAST_NAME).unwrap_or_default().to_string(),
        member_number: column(row, COLUMN_MEMBER_NUMBER)
            .filter(|n| !n.is_empty())
            .map(str::to_string),
        gender: column(row, COLUMN_GENDER).and_then(memsync_core::Gender::from_wire),
        birth_date: Some(birth_date),
    })
}
