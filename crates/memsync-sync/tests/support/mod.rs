//! In-memory stand-in for the remote directory, recording every request.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use memsync_core::{Address, Gender, LocalMember, Parent, ParentKind};
use memsync_remote::{
    Method, OrganizationIdentity, RemoteError, RemoteFailure, RemoteMessage, RemoteRequest,
    Transport,
};
use memsync_sync::SyncConfig;
use serde_json::{json, Map, Value as JsonValue};
use uuid::Uuid;

pub const GROUP_NUMBER: &str = "O2209G";
pub const GROUP_NAME: &str = "Prins Boudewijn";

const COLUMN_MEMBER_NUMBER: &str = "be.vvksm.groepsadmin.model.column.LidNummerColumn";
const COLUMN_FIRST_NAME: &str = "be.vvksm.groepsadmin.model.column.VoornaamColumn";
const COLUMN_LAST_NAME: &str = "be.vvksm.groepsadmin.model.column.AchternaamColumn";
const COLUMN_BIRTH_DATE: &str = "be.vvksm.groepsadmin.model.column.GeboorteDatumColumn";

/// (id, code, description) of every role the fake group offers.
const GROUP_ROLES: &[(&str, &str, &str)] = &[
    ("r-kap", "KAP", "Kapoen"),
    ("r-kw", "KW", "Kabouter/Welp"),
    ("r-jgjv", "JGJV", "Jonggids/Jongverkenner"),
    ("r-gve", "GVE", "Gids/Verkenner"),
    ("r-akab", "AKAB", "Akabe"),
    ("r-jin", "JIN", "Jin"),
    ("r-vga", "VGA", "Groepsadministratie"),
    ("r-lei", "LEI", "Leiding"),
];

pub fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, 17).unwrap()
}

pub fn test_config() -> SyncConfig {
    SyncConfig {
        organization: OrganizationIdentity {
            name: GROUP_NAME.to_string(),
            ..OrganizationIdentity::default()
        },
        page_size: 2,
        pacing: Duration::ZERO,
        ..SyncConfig::default()
    }
}

pub fn address(street: &str, number: &str) -> Address {
    Address {
        street: street.to_string(),
        number: number.to_string(),
        postal_code: "9000".to_string(),
        city: "Gent".to_string(),
        country: "BE".to_string(),
    }
}

pub fn member(first: &str, last: &str, birth: (i32, u32, u32), section: &str) -> LocalMember {
    let home = address("Teststraat", "11 bus 2");
    LocalMember {
        id: Uuid::new_v4(),
        first_name: first.to_string(),
        last_name: last.to_string(),
        birth_date: NaiveDate::from_ymd_opt(birth.0, birth.1, birth.2),
        gender: Gender::Female,
        phone: Some("0470 12 34 56".to_string()),
        email: None,
        address: Some(home.clone()),
        parents: vec![Parent {
            first_name: "Els".to_string(),
            last_name: last.to_string(),
            kind: ParentKind::Mother,
            phone: Some("0470 65 43 21".to_string()),
            email: Some("els@example.org".to_string()),
            address: Some(home),
        }],
        member_number: None,
        groups: vec![section.to_string()],
        records: Vec::new(),
    }
}

#[derive(Default)]
struct State {
    members: Vec<(String, Map<String, JsonValue>)>,
    requests: Vec<RemoteRequest>,
    rejected: HashSet<String>,
    next_id: usize,
    withhold_permission: bool,
}

#[derive(Default)]
pub struct FakeDirectory {
    state: Mutex<State>,
}

impl FakeDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The group offers none of the roles that grant write access.
    pub fn without_permission() -> Self {
        let fake = Self::default();
        fake.state.lock().unwrap().withhold_permission = true;
        fake
    }

    /// Stores a remote member; `birth` uses the wire format `YYYY-MM-DD`.
    pub fn seed(&self, first: &str, last: &str, birth: &str, open_roles: &[&str]) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("lid-{}", state.next_id);
        let roles: Vec<JsonValue> = open_roles
            .iter()
            .map(|role| json!({"functie": role, "groep": GROUP_NUMBER, "begin": "2024-09-01"}))
            .collect();
        let detail = json!({
            "persoonsgegevens": {"geslacht": "vrouw", "gsm": ""},
            "vgagegevens": {"voornaam": first, "achternaam": last, "geboortedatum": birth},
            "verbondsgegevens": {"lidnummer": format!("N{}", state.next_id)},
            "adressen": [],
            "contacten": [],
            "functies": roles,
        });
        let JsonValue::Object(detail) = detail else {
            unreachable!()
        };
        state.members.push((id.clone(), detail));
        id
    }

    pub fn reject_updates_for(&self, id: &str) {
        self.state.lock().unwrap().rejected.insert(id.to_string());
    }

    pub fn requests(&self) -> Vec<RemoteRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn clear_requests(&self) {
        self.state.lock().unwrap().requests.clear();
    }

    /// PATCH and POST requests against member records.
    pub fn member_writes(&self) -> Vec<RemoteRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method != Method::Get && r.path.starts_with("/lid"))
            .collect()
    }

    pub fn member_count(&self) -> usize {
        self.state.lock().unwrap().members.len()
    }

    pub fn detail(&self, id: &str) -> Option<JsonValue> {
        let state = self.state.lock().unwrap();
        state
            .members
            .iter()
            .find(|(stored, _)| stored == id)
            .map(|(id, detail)| with_id(id, detail))
    }

    fn handle(&self, request: &RemoteRequest) -> Result<JsonValue, RemoteError> {
        let mut state = self.state.lock().unwrap();
        let path = request.path.as_str();
        match (request.method, path) {
            (Method::Get, "/groep") => Ok(json!({"groepen": [{
                "id": "g1",
                "groepsnummer": GROUP_NUMBER,
                "naam": GROUP_NAME,
                "adressen": [{"straat": "Kerkstraat", "postcode": "9000"}],
            }]})),
            (Method::Get, "/functie") => {
                let roles: Vec<JsonValue> = GROUP_ROLES
                    .iter()
                    .filter(|(_, code, _)| !(state.withhold_permission && *code == "VGA"))
                    .map(|(id, code, description)| {
                        json!({"id": id, "code": code, "beschrijving": description})
                    })
                    .collect();
                Ok(json!({ "functies": roles }))
            }
            (Method::Patch, "/ledenlijst/filter/huidige") => Ok(JsonValue::Null),
            (Method::Get, "/ledenlijst") => {
                let size: usize = query(request, "aantal").parse().unwrap_or(100);
                let offset: usize = query(request, "offset").parse().unwrap_or(0);
                let rows: Vec<JsonValue> = state
                    .members
                    .iter()
                    .skip(offset)
                    .take(size)
                    .map(|(id, detail)| listing_row(id, detail))
                    .collect();
                Ok(json!({
                    "aantal": rows.len(),
                    "offset": offset,
                    "totaal": state.members.len(),
                    "leden": rows,
                }))
            }
            (Method::Get, "/zoeken/gelijkaardig") => {
                let last = query(request, "achternaam").to_lowercase();
                let rows: Vec<JsonValue> = state
                    .members
                    .iter()
                    .filter(|(_, detail)| field(detail, "achternaam").to_lowercase() == last)
                    .map(|(id, detail)| {
                        json!({
                            "id": id,
                            "voornaam": field(detail, "voornaam"),
                            "achternaam": field(detail, "achternaam"),
                            "geboortedatum": field(detail, "geboortedatum"),
                        })
                    })
                    .collect();
                Ok(json!({ "leden": rows }))
            }
            (Method::Post, "/lid") => {
                state.next_id += 1;
                let id = format!("lid-{}", state.next_id);
                let mut detail = Map::new();
                detail.insert(
                    "verbondsgegevens".to_string(),
                    json!({"lidnummer": format!("N{}", state.next_id)}),
                );
                apply_body(&mut detail, request.body.as_ref(), &mut state.next_id);
                let response = with_id(&id, &detail);
                state.members.push((id, detail));
                Ok(response)
            }
            (method, _) if path.starts_with("/lid/") => {
                let id = path.trim_start_matches("/lid/").to_string();
                if method == Method::Patch && state.rejected.contains(&id) {
                    return Err(RemoteError::Rejected(RemoteFailure {
                        status: 400,
                        code: "remote_error".to_string(),
                        messages: vec![RemoteMessage {
                            message: "Postcode is ongeldig".to_string(),
                            field: Some("adressen[0].postcode".to_string()),
                        }],
                    }));
                }
                let State {
                    members, next_id, ..
                } = &mut *state;
                let Some((_, detail)) = members.iter_mut().find(|(stored, _)| *stored == id) else {
                    return Err(not_found(path));
                };
                if method == Method::Patch {
                    apply_body(detail, request.body.as_ref(), next_id);
                }
                Ok(with_id(&id, detail))
            }
            _ => Err(not_found(path)),
        }
    }
}

#[async_trait]
impl Transport for FakeDirectory {
    async fn request(&self, request: RemoteRequest) -> Result<JsonValue, RemoteError> {
        let response = self.handle(&request);
        self.state.lock().unwrap().requests.push(request);
        response
    }
}

fn not_found(path: &str) -> RemoteError {
    RemoteError::Rejected(RemoteFailure {
        status: 404,
        code: "not_found".to_string(),
        messages: vec![RemoteMessage {
            message: format!("{path} not found"),
            field: None,
        }],
    })
}

fn query<'r>(request: &'r RemoteRequest, key: &str) -> &'r str {
    request
        .query
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
        .unwrap_or_default()
}

fn field<'d>(detail: &'d Map<String, JsonValue>, key: &str) -> &'d str {
    detail
        .get("vgagegevens")
        .and_then(|v| v.get(key))
        .and_then(JsonValue::as_str)
        .unwrap_or_default()
}

fn with_id(id: &str, detail: &Map<String, JsonValue>) -> JsonValue {
    let mut detail = detail.clone();
    detail.insert("id".to_string(), json!(id));
    JsonValue::Object(detail)
}

fn listing_row(id: &str, detail: &Map<String, JsonValue>) -> JsonValue {
    let birth = NaiveDate::parse_from_str(field(detail, "geboortedatum"), "%Y-%m-%d")
        .map(|d| d.format("%d/%m/%Y").to_string())
        .unwrap_or_default();
    let number = detail
        .get("verbondsgegevens")
        .and_then(|v| v.get("lidnummer"))
        .and_then(JsonValue::as_str)
        .unwrap_or_default();
    json!({
        "id": id,
        "waarden": {
            COLUMN_MEMBER_NUMBER: number,
            COLUMN_FIRST_NAME: field(detail, "voornaam"),
            COLUMN_LAST_NAME: field(detail, "achternaam"),
            COLUMN_BIRTH_DATE: birth,
        }
    })
}

/// Replaces sections present in `body` and swaps temporary address ids for
/// stored ones, updating the contacts that point at them.
fn apply_body(detail: &mut Map<String, JsonValue>, body: Option<&JsonValue>, next_id: &mut usize) {
    let Some(body) = body.and_then(JsonValue::as_object) else {
        return;
    };
    let mut renamed: Vec<(String, String)> = Vec::new();
    for (key, value) in body {
        let mut value = value.clone();
        if key == "adressen" {
            for address in value.as_array_mut().into_iter().flatten() {
                let temp = address["id"].as_str().unwrap_or_default().to_string();
                if temp.starts_with("tempadres") {
                    *next_id += 1;
                    let stored = format!("adres-{next_id}");
                    address["id"] = json!(stored);
                    renamed.push((temp, stored));
                }
            }
        }
        detail.insert(key.clone(), value);
    }
    if let Some(contacts) = detail.get_mut("contacten").and_then(JsonValue::as_array_mut) {
        for contact in contacts {
            let reference = contact
                .get("adres")
                .and_then(JsonValue::as_str)
                .map(str::to_string);
            if let Some((_, stored)) = renamed
                .iter()
                .find(|(temp, _)| Some(temp) == reference.as_ref())
            {
                contact["adres"] = json!(stored);
            }
        }
    }
}
