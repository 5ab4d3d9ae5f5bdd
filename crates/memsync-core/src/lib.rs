//! Core domain model shared by the roster/directory reconciliation crates.

use std::fmt;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use strsim::damerau_levenshtein;
use uuid::Uuid;

pub const CRATE_NAME: &str = "memsync-core";

/// Opaque JSON fields the remote directory sends that we must echo back untouched.
pub type OpaqueFields = Map<String, JsonValue>;

/// Postal address as stored in the local roster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub street: String,
    pub number: String,
    pub postal_code: String,
    pub city: String,
    #[serde(default = "default_country")]
    pub country: String,
}

fn default_country() -> String {
    "BE".to_string()
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}, {} {}, {}",
            self.street, self.number, self.postal_code, self.city, self.country
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Male,
    Female,
    #[default]
    Other,
}

impl Gender {
    pub fn wire_value(self) -> &'static str {
        match self {
            Gender::Male => "man",
            Gender::Female => "vrouw",
            Gender::Other => "andere",
        }
    }

    pub fn from_wire(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "man" => Some(Gender::Male),
            "vrouw" => Some(Gender::Female),
            "andere" => Some(Gender::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParentKind {
    Mother,
    Father,
    #[default]
    Other,
}

impl ParentKind {
    pub fn wire_value(self) -> &'static str {
        match self {
            ParentKind::Father => "vader",
            ParentKind::Mother => "moeder",
            ParentKind::Other => "voogd",
        }
    }
}

/// Parent or guardian attached to a local member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parent {
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub kind: ParentKind,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub address: Option<Address>,
}

/// Free-form record markers kept on a local member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    FinancialSupport,
    #[serde(other)]
    Other,
}

/// A person as known in the local roster. Never mutated by reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalMember {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub birth_date: Option<NaiveDate>,
    #[serde(default)]
    pub gender: Gender,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub address: Option<Address>,
    #[serde(default)]
    pub parents: Vec<Parent>,
    #[serde(default)]
    pub member_number: Option<String>,
    /// Names of the local sections the member is registered in.
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub records: Vec<RecordKind>,
}

impl LocalMember {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }

    pub fn requires_financial_support(&self) -> bool {
        self.records.contains(&RecordKind::FinancialSupport)
    }

    /// Age reached during the scouting year that contains `today`.
    pub fn age_in_scouting_year(&self, today: NaiveDate) -> Option<i32> {
        self.birth_date
            .map(|birth| scouting_year(today) - birth.year())
    }
}

/// The scouting year ends on 31 August; until then we are still in last year's.
pub fn scouting_year(today: NaiveDate) -> i32 {
    if today.month() <= 8 {
        today.year() - 1
    } else {
        today.year()
    }
}

/// Lightweight person shape returned by the remote listing and search endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub member_number: Option<String>,
    #[serde(default)]
    pub gender: Option<Gender>,
    #[serde(default)]
    pub birth_date: Option<NaiveDate>,
}

impl RemoteEntry {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RemoteAddress {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "straat", default)]
    pub street: String,
    #[serde(rename = "nummer", default)]
    pub number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bus: Option<String>,
    #[serde(rename = "postcode", default)]
    pub postal_code: String,
    #[serde(rename = "gemeente", default)]
    pub city: String,
    #[serde(rename = "land", default)]
    pub country: String,
    #[serde(rename = "postadres", default)]
    pub postal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(rename = "omschrijving", default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "telefoon", default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(flatten)]
    pub extra: OpaqueFields,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RemoteContact {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "voornaam", default)]
    pub first_name: String,
    #[serde(rename = "achternaam", default)]
    pub last_name: String,
    #[serde(rename = "adres", default, skip_serializing_if = "Option::is_none")]
    pub address_id: Option<String>,
    #[serde(rename = "gsm", default)]
    pub phone: String,
    #[serde(default)]
    pub email: String,
    #[serde(rename = "rol", default)]
    pub role: String,
    #[serde(flatten)]
    pub extra: OpaqueFields,
}

/// One role (`functie`) held by a remote member, open while `end` is unset.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RoleAssignment {
    #[serde(rename = "functie")]
    pub role_id: String,
    #[serde(rename = "groep", default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub begin: Option<String>,
    #[serde(rename = "einde", default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    #[serde(flatten)]
    pub extra: OpaqueFields,
}

impl RoleAssignment {
    pub fn is_open(&self) -> bool {
        self.end.as_deref().map_or(true, str::is_empty)
    }
}

/// Role definition offered by the remote group (`/functie`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRole {
    pub id: String,
    #[serde(rename = "beschrijving", default)]
    pub description: String,
    #[serde(default)]
    pub code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RemoteLink {
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub sections: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

/// Full remote record of one member, fetched lazily when an update is due.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RemoteMemberDetail {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "gebruikersnaam", default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(rename = "persoonsgegevens", default, skip_serializing_if = "Option::is_none")]
    pub personal: Option<OpaqueFields>,
    #[serde(rename = "vgagegevens", default, skip_serializing_if = "Option::is_none")]
    pub registration: Option<OpaqueFields>,
    #[serde(rename = "verbondsgegevens", default, skip_serializing_if = "Option::is_none")]
    pub federation: Option<OpaqueFields>,
    #[serde(rename = "adressen", default)]
    pub addresses: Vec<RemoteAddress>,
    #[serde(rename = "contacten", default)]
    pub contacts: Vec<RemoteContact>,
    #[serde(rename = "functies", default)]
    pub roles: Vec<RoleAssignment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<RemoteLink>,
    #[serde(flatten)]
    pub extra: OpaqueFields,
}

impl RemoteMemberDetail {
    /// Shell used as the "existing" record when creating a new remote member.
    pub fn empty_shell() -> Self {
        Self::default()
    }

    /// A record without personal data has never been stored remotely.
    pub fn is_new(&self) -> bool {
        self.personal.is_none()
    }

    pub fn member_number(&self) -> Option<&str> {
        self.federation
            .as_ref()
            .and_then(|f| f.get("lidnummer"))
            .and_then(JsonValue::as_str)
    }

    /// Email may only be written when no login username manages it.
    pub fn email_editable(&self) -> bool {
        if let Some(link) = self
            .links
            .iter()
            .find(|l| l.method.eq_ignore_ascii_case("PATCH"))
        {
            return link.sections.iter().any(|s| s == "email");
        }
        self.username.as_deref().map_or(true, str::is_empty)
    }
}

/// Edit-distance primitive used for every fuzzy comparison. Zero means equal.
pub trait StringSimilarity: Send + Sync {
    fn distance(&self, a: &str, b: &str) -> usize;
}

/// Case- and whitespace-insensitive Damerau-Levenshtein distance.
#[derive(Debug, Clone, Copy, Default)]
pub struct TypoDistance;

impl StringSimilarity for TypoDistance {
    fn distance(&self, a: &str, b: &str) -> usize {
        damerau_levenshtein(&normalize_for_compare(a), &normalize_for_compare(b))
    }
}

pub fn normalize_for_compare(input: &str) -> String {
    input
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn slug(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
}

/// Numeric date key (`DD/MM/YYYY`) used when comparing birth dates.
pub fn date_key(date: NaiveDate) -> String {
    date.format("%d/%m/%Y").to_string()
}

/// Birth date as the remote expects it on writes.
pub fn wire_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Parses the listing's `DD/MM/YYYY` birth dates, rejecting implausible values.
pub fn parse_listing_date(raw: &str) -> Option<NaiveDate> {
    plausible(NaiveDate::parse_from_str(raw.trim(), "%d/%m/%Y").ok()?)
}

/// Parses the search endpoint's `YYYY-MM-DD` birth dates.
pub fn parse_wire_date(raw: &str) -> Option<NaiveDate> {
    plausible(NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok()?)
}

fn plausible(date: NaiveDate) -> Option<NaiveDate> {
    (1900..=2200).contains(&date.year()).then_some(date)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn scouting_year_rolls_over_in_september() {
        assert_eq!(scouting_year(ymd(2026, 8, 31)), 2025);
        assert_eq!(scouting_year(ymd(2026, 9, 1)), 2026);
    }

    #[test]
    fn typo_distance_ignores_case_and_spacing() {
        let sim = TypoDistance;
        assert_eq!(sim.distance("Jan  Peeters", "jan peeters"), 0);
        assert_eq!(sim.distance("Jan Peeters", "Jan Peters"), 1);
        assert_eq!(sim.distance("Jan Peetres", "Jan Peeters"), 1);
    }

    #[test]
    fn listing_dates_are_validated() {
        assert_eq!(parse_listing_date("20/08/1995"), Some(ymd(1995, 8, 20)));
        assert_eq!(parse_listing_date("1995-08-20"), None);
        assert_eq!(parse_listing_date("20/13/1995"), None);
        assert_eq!(parse_listing_date("20/08/1850"), None);
        assert_eq!(parse_wire_date("1995-08-20"), Some(ymd(1995, 8, 20)));
        assert_eq!(parse_listing_date(" 20/08/1995 "), Some(ymd(1995, 8, 20)));
        assert_eq!(parse_wire_date("20/08/1995"), None);
        assert_eq!(parse_wire_date("2301-01-01"), None);
        assert_eq!(parse_wire_date("1995-02-30"), None);
        assert_eq!(wire_date(ymd(1995, 8, 20)), "1995-08-20");
        assert_eq!(date_key(ymd(1995, 8, 2)), "02/08/1995");
    }

    #[test]
    fn remote_address_keeps_unknown_fields() {
        let raw = json!({
            "id": "SGVID",
            "straat": "Teststraat",
            "nummer": "11",
            "postcode": "9000",
            "gemeente": "Gent",
            "land": "BE",
            "postadres": true,
            "positie": {"latitude": 51, "longitude": 3.8},
            "unknownSGVProperty": "test"
        });
        let address: RemoteAddress = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(address.id, "SGVID");
        assert!(address.postal);
        assert_eq!(address.extra.get("unknownSGVProperty"), Some(&json!("test")));
        assert_eq!(serde_json::to_value(&address).unwrap(), raw);
    }

    #[test]
    fn email_is_locked_by_username_or_patch_sections() {
        let mut detail = RemoteMemberDetail::empty_shell();
        assert!(detail.email_editable());
        detail.username = Some("jpeeters".into());
        assert!(!detail.email_editable());
        detail.links = vec![RemoteLink {
            method: "PATCH".into(),
            sections: vec!["email".into(), "adressen".into()],
            extra: Map::new(),
        }];
        assert!(detail.email_editable());
    }

    #[test]
    fn slug_collapses_punctuation() {
        assert_eq!(slug("Scouts & Gidsen  Sint-Jan"), "scouts-gidsen-sint-jan");
    }

    #[test]
    fn gender_round_trips_through_wire_values() {
        for gender in [Gender::Male, Gender::Female, Gender::Other] {
            assert_eq!(Gender::from_wire(gender.wire_value()), Some(gender));
        }
    }
}
