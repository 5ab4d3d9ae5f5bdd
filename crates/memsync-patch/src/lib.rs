//! Builds remote-shaped patches from local members: addresses, contacts, roles and demographics.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use memsync_core::{
    wire_date, Address, GroupRole, LocalMember, OpaqueFields, Parent, RemoteAddress,
    RemoteContact, RemoteMemberDetail, RoleAssignment, StringSimilarity,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "memsync-patch";

/// Largest per-name typo count still treated as the same parent.
pub const CONTACT_NAME_BUDGET: usize = 1;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    #[error("at least one address required")]
    NoAddress,
    #[error("{member}: a birth date is required by the remote directory")]
    MissingBirthDate { member: String },
    #[error(
        "{member}: could not determine which role to assign; new members need at least one role in the remote directory"
    )]
    NoRoleForNewMember { member: String },
    #[error("no role with code {0} found in the remote group")]
    MissingRoleCode(String),
    #[error("encoding patch: {0}")]
    Encode(String),
}

impl From<serde_json::Error> for PatchError {
    fn from(err: serde_json::Error) -> Self {
        PatchError::Encode(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HouseNumber {
    pub number: String,
    pub bus: String,
}

/// Normalises a free-form house number into `number` and `bus`.
///
/// `"13 bus 3"`, `"13/3"` and `"13 b3"` all become `13` / `3`; letters stick to
/// the preceding digits so `"13 A 3"` becomes `13A` / `3`.
pub fn split_house_number(raw: &str) -> HouseNumber {
    let cleaned: String = raw
        .to_uppercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect();

    let mut joined = String::new();
    for token in cleaned.split(' ') {
        let mut token = token.replace("BUS", "");
        if token.starts_with('B') {
            token.remove(0);
        }
        let token = token.trim_start_matches('0');

        let starts_digit = token.chars().next().is_some_and(|c| c.is_ascii_digit());
        if !joined.is_empty() && starts_digit {
            joined.push(' ');
        }
        joined.push_str(token);
    }

    match joined.rsplit_once(' ') {
        Some((number, bus)) => HouseNumber {
            number: number.to_string(),
            bus: bus.to_string(),
        },
        None => HouseNumber {
            number: joined,
            bus: String::new(),
        },
    }
}

/// Drops one leading and one trailing non-alphanumeric character.
pub fn trim_edges(value: &str) -> String {
    let mut s = value;
    if let Some(c) = s.chars().next() {
        if !c.is_alphanumeric() {
            s = &s[c.len_utf8()..];
        }
    }
    if let Some(c) = s.chars().next_back() {
        if !c.is_alphanumeric() {
            s = &s[..s.len() - c.len_utf8()];
        }
    }
    s.to_string()
}

/// Zero-distance comparison of a local address against a stored remote one.
pub struct AddressMatcher<'a> {
    sim: &'a dyn StringSimilarity,
}

impl<'a> AddressMatcher<'a> {
    pub fn new(sim: &'a dyn StringSimilarity) -> Self {
        Self { sim }
    }

    fn same(&self, a: &str, b: &str) -> bool {
        self.sim.distance(&trim_edges(a), &trim_edges(b)) == 0
    }

    pub fn matches(&self, local: &Address, remote: &RemoteAddress) -> bool {
        if !self.same(&local.street, &remote.street)
            || !self.same(&local.city, &remote.city)
            || !self.same(&local.postal_code, &remote.postal_code)
        {
            return false;
        }
        let HouseNumber { number, bus } = split_house_number(&local.number);
        self.same(&number, &remote.number) && self.same(&bus, remote.bus.as_deref().unwrap_or(""))
    }
}

/// Remote shape of a local address, without id and not yet postal.
pub fn address_to_remote(address: &Address) -> RemoteAddress {
    let HouseNumber { number, bus } = split_house_number(&address.number);
    RemoteAddress {
        id: String::new(),
        street: trim_edges(&address.street),
        number: trim_edges(&number),
        bus: Some(trim_edges(&bus)),
        postal_code: trim_edges(&address.postal_code),
        city: trim_edges(&address.city),
        country: address.country.clone(),
        postal: false,
        status: Some("normaal".to_string()),
        description: Some(String::new()),
        phone: Some(String::new()),
        extra: OpaqueFields::new(),
    }
}

/// Mints ids for records the remote has not seen yet. One per run.
pub struct IdMinter {
    epoch_millis: i64,
    next_address: u32,
    rng: StdRng,
}

impl IdMinter {
    pub fn new(epoch_millis: i64) -> Self {
        Self {
            epoch_millis,
            next_address: 0,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn seeded(epoch_millis: i64, seed: u64) -> Self {
        Self {
            epoch_millis,
            next_address: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn address_id(&mut self) -> String {
        self.next_address += 1;
        format!("tempadres-{}-{}", self.next_address, self.epoch_millis)
    }

    pub fn contact_id(&mut self) -> String {
        format!("{}-{}", self.epoch_millis, self.rng.gen_range(0..100_000))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AddressPatch {
    /// Local address this patch was derived from.
    pub source: Address,
    pub address: RemoteAddress,
    pub reused: bool,
}

pub struct AddressReconciler<'a> {
    matcher: AddressMatcher<'a>,
}

impl<'a> AddressReconciler<'a> {
    pub fn new(sim: &'a dyn StringSimilarity) -> Self {
        Self {
            matcher: AddressMatcher::new(sim),
        }
    }

    /// Own address first, then each distinct parent address. Exactly one
    /// result is postal whenever the result is non-empty.
    pub fn reconcile(
        &self,
        member: &LocalMember,
        existing: &[RemoteAddress],
        ids: &mut IdMinter,
    ) -> Vec<AddressPatch> {
        let mut patches: Vec<AddressPatch> = Vec::new();
        let mut claimed: HashSet<String> = HashSet::new();
        let mut has_postal = false;

        if let Some(own) = &member.address {
            let mut patch = self.patch_for(own, existing, &mut claimed, ids);
            patch.address.postal = true;
            has_postal = true;
            patches.push(patch);
        }

        for parent in &member.parents {
            let Some(address) = &parent.address else {
                continue;
            };
            if patches.iter().any(|p| &p.source == address) {
                continue;
            }
            let mut patch = self.patch_for(address, existing, &mut claimed, ids);
            if has_postal {
                patch.address.postal = false;
            } else if patch.address.postal {
                has_postal = true;
            }
            patches.push(patch);
        }

        if !has_postal {
            if let Some(first) = patches.first_mut() {
                first.address.postal = true;
            }
        }
        patches
    }

    fn patch_for(
        &self,
        local: &Address,
        existing: &[RemoteAddress],
        claimed: &mut HashSet<String>,
        ids: &mut IdMinter,
    ) -> AddressPatch {
        let fresh = address_to_remote(local);
        let found = existing
            .iter()
            .find(|remote| !claimed.contains(&remote.id) && self.matcher.matches(local, remote));

        match found {
            Some(remote) => {
                claimed.insert(remote.id.clone());
                AddressPatch {
                    source: local.clone(),
                    address: RemoteAddress {
                        id: remote.id.clone(),
                        postal: remote.postal,
                        extra: remote.extra.clone(),
                        ..fresh
                    },
                    reused: true,
                }
            }
            None => AddressPatch {
                source: local.clone(),
                address: RemoteAddress {
                    id: ids.address_id(),
                    ..fresh
                },
                reused: false,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContactPatch {
    pub contact: RemoteContact,
    pub reused: bool,
}

pub struct ContactReconciler<'a> {
    sim: &'a dyn StringSimilarity,
}

impl<'a> ContactReconciler<'a> {
    pub fn new(sim: &'a dyn StringSimilarity) -> Self {
        Self { sim }
    }

    pub fn matches(&self, parent: &Parent, remote: &RemoteContact) -> bool {
        self.sim.distance(&parent.first_name, &remote.first_name) <= CONTACT_NAME_BUDGET
            && self.sim.distance(&parent.last_name, &remote.last_name) <= CONTACT_NAME_BUDGET
    }

    pub fn reconcile(
        &self,
        parents: &[Parent],
        existing: &[RemoteContact],
        addresses: &[AddressPatch],
        ids: &mut IdMinter,
    ) -> Vec<ContactPatch> {
        let mut claimed: HashSet<String> = HashSet::new();
        parents
            .iter()
            .map(|parent| {
                let fresh = parent_to_remote(parent, addresses);
                let found = existing
                    .iter()
                    .find(|c| !claimed.contains(&c.id) && self.matches(parent, c));
                match found {
                    Some(remote) => {
                        claimed.insert(remote.id.clone());
                        ContactPatch {
                            contact: RemoteContact {
                                id: remote.id.clone(),
                                extra: remote.extra.clone(),
                                ..fresh
                            },
                            reused: true,
                        }
                    }
                    None => ContactPatch {
                        contact: RemoteContact {
                            id: ids.contact_id(),
                            ..fresh
                        },
                        reused: false,
                    },
                }
            })
            .collect()
    }
}

fn parent_to_remote(parent: &Parent, addresses: &[AddressPatch]) -> RemoteContact {
    let address_id = parent.address.as_ref().and_then(|wanted| {
        addresses
            .iter()
            .find(|patch| &patch.source == wanted)
            .map(|patch| patch.address.id.clone())
    });
    RemoteContact {
        id: String::new(),
        first_name: parent.first_name.clone(),
        last_name: parent.last_name.clone(),
        address_id,
        phone: parent.phone.clone().unwrap_or_default(),
        email: parent.email.clone().unwrap_or_default(),
        role: parent.kind.wire_value().to_string(),
        extra: OpaqueFields::new(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionRule {
    pub code: String,
    pub names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgeBracket {
    pub code: String,
    pub min_age: i32,
    pub max_age: i32,
}

/// Which remote roles the sync manages and how a member is mapped onto one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleRules {
    #[serde(default)]
    pub version: u32,
    /// Roles of which at least one must be visible to the syncing account.
    #[serde(default)]
    pub permission_codes: Vec<String>,
    pub sections: Vec<SectionRule>,
    pub age_brackets: Vec<AgeBracket>,
}

impl Default for RoleRules {
    fn default() -> Self {
        let section = |code: &str, names: &[&str]| SectionRule {
            code: code.to_string(),
            names: names.iter().map(|n| n.to_string()).collect(),
        };
        let bracket = |code: &str, min_age, max_age| AgeBracket {
            code: code.to_string(),
            min_age,
            max_age,
        };
        Self {
            version: 1,
            permission_codes: vec!["VGA".to_string(), "GRL".to_string()],
            sections: vec![
                section("KAP", &["kapoenen"]),
                section("KW", &["kabouters", "welpen", "wouters"]),
                section(
                    "JGJV",
                    &[
                        "jonggidsen",
                        "jongverkenners",
                        "jonggivers",
                        "jong-verkenners",
                        "jong-givers",
                        "jong-gidsen",
                    ],
                ),
                section("GVE", &["gidsen", "verkenners", "givers"]),
                section("AKAB", &["akabe"]),
                section("JIN", &["jin", "jins"]),
            ],
            age_brackets: vec![
                bracket("KAP", 5, 7),
                bracket("KW", 8, 10),
                bracket("JGJV", 11, 13),
                bracket("GVE", 14, 16),
                bracket("JIN", 17, 17),
            ],
        }
    }
}

impl RoleRules {
    pub fn from_yaml_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Managed codes in first-seen order.
    pub fn managed_codes(&self) -> Vec<&str> {
        let mut codes: Vec<&str> = Vec::new();
        let all = self
            .sections
            .iter()
            .map(|s| s.code.as_str())
            .chain(self.age_brackets.iter().map(|b| b.code.as_str()));
        for code in all {
            if !codes.contains(&code) {
                codes.push(code);
            }
        }
        codes
    }
}

/// Managed codes resolved against the roles the remote group offers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagedRoles {
    by_code: BTreeMap<String, GroupRole>,
}

impl ManagedRoles {
    pub fn resolve(rules: &RoleRules, group_roles: &[GroupRole]) -> Result<Self, PatchError> {
        let mut by_code = BTreeMap::new();
        for code in rules.managed_codes() {
            let role = group_roles
                .iter()
                .find(|r| r.code.as_deref() == Some(code))
                .ok_or_else(|| PatchError::MissingRoleCode(code.to_string()))?;
            by_code.insert(code.to_string(), role.clone());
        }
        Ok(Self { by_code })
    }

    pub fn get(&self, code: &str) -> Option<&GroupRole> {
        self.by_code.get(code)
    }

    pub fn by_id(&self, id: &str) -> Option<&GroupRole> {
        self.by_code.values().find(|r| r.id == id)
    }

    /// Whether any still-open assignment is one of ours.
    pub fn holds_managed_role(&self, roles: &[RoleAssignment]) -> bool {
        roles
            .iter()
            .any(|r| r.is_open() && self.by_id(&r.role_id).is_some())
    }
}

/// Picks the managed role for a member. `None` means the member's roles are
/// left for an operator to manage.
pub fn choose_role<'r>(
    sim: &dyn StringSimilarity,
    rules: &RoleRules,
    managed: &'r ManagedRoles,
    member: &LocalMember,
    today: NaiveDate,
) -> Result<Option<&'r GroupRole>, PatchError> {
    let mut matched: BTreeSet<&str> = BTreeSet::new();
    for section in &rules.sections {
        for name in &section.names {
            if member.groups.iter().any(|g| sim.distance(name, g) == 0) {
                matched.insert(section.code.as_str());
            }
        }
    }

    if matched.len() == 1 {
        if let Some(code) = matched.first() {
            return Ok(managed.get(code));
        }
    }

    let age = member
        .age_in_scouting_year(today)
        .ok_or_else(|| PatchError::MissingBirthDate {
            member: member.full_name(),
        })?;
    Ok(rules
        .age_brackets
        .iter()
        .find(|b| (b.min_age..=b.max_age).contains(&age))
        .and_then(|b| managed.get(&b.code)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchNote {
    Info(String),
    Warning(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RolePlan {
    pub roles: Vec<RoleAssignment>,
    pub notes: Vec<PatchNote>,
}

/// Keeps ended and unmanaged roles, ends other managed roles and opens
/// `chosen` when it is not held yet.
pub fn plan_roles(
    member_name: &str,
    existing: &[RoleAssignment],
    managed: &ManagedRoles,
    chosen: Option<&GroupRole>,
    group_number: &str,
    today: NaiveDate,
) -> RolePlan {
    let mut roles = Vec::with_capacity(existing.len() + 1);
    let mut notes = Vec::new();
    let mut already_held = false;

    for assignment in existing {
        if !assignment.is_open() {
            roles.push(assignment.clone());
            continue;
        }
        let Some(role) = managed.by_id(&assignment.role_id) else {
            roles.push(assignment.clone());
            continue;
        };
        if chosen.is_some_and(|c| c.id == assignment.role_id) {
            already_held = true;
            roles.push(assignment.clone());
            continue;
        }
        roles.push(RoleAssignment {
            end: Some(wire_date(today)),
            ..assignment.clone()
        });
        notes.push(PatchNote::Info(format!(
            "{member_name}: role ended {}",
            role.description
        )));
    }

    if let Some(role) = chosen.filter(|_| !already_held) {
        roles.push(RoleAssignment {
            role_id: role.id.clone(),
            group: Some(group_number.to_string()),
            begin: Some(wire_date(today)),
            end: None,
            extra: OpaqueFields::new(),
        });
        notes.push(PatchNote::Info(format!(
            "{member_name}: role assigned {}",
            role.description
        )));
    }

    RolePlan { roles, notes }
}

/// Ends every open managed role; used when an orphan is deleted.
pub fn end_managed_roles(
    existing: &[RoleAssignment],
    managed: &ManagedRoles,
    today: NaiveDate,
) -> Vec<RoleAssignment> {
    existing
        .iter()
        .map(|assignment| {
            if assignment.is_open() && managed.by_id(&assignment.role_id).is_some() {
                RoleAssignment {
                    end: Some(wire_date(today)),
                    ..assignment.clone()
                }
            } else {
                assignment.clone()
            }
        })
        .collect()
}

/// Wire body that removes a member from the managed sections.
pub fn removal_body(
    existing: &RemoteMemberDetail,
    managed: &ManagedRoles,
    today: NaiveDate,
) -> Result<JsonValue, PatchError> {
    let roles = end_managed_roles(&existing.roles, managed, today);
    let mut body = Map::new();
    body.insert("functies".to_string(), serde_json::to_value(roles)?);
    Ok(JsonValue::Object(body))
}

/// Everything a member patch depends on besides the member and its remote record.
#[derive(Clone, Copy)]
pub struct PatchContext<'a> {
    pub group_number: &'a str,
    pub managed: &'a ManagedRoles,
    pub rules: &'a RoleRules,
    pub today: NaiveDate,
}

/// Desired end state of one remote record.
#[derive(Debug, Clone, PartialEq)]
pub struct RemotePatch {
    pub personal: OpaqueFields,
    pub registration: OpaqueFields,
    pub addresses: Vec<AddressPatch>,
    pub contacts: Vec<ContactPatch>,
    pub roles: Vec<RoleAssignment>,
    pub email: Option<String>,
    /// No managed role applies; the operator keeps the roles up to date.
    pub unmanaged: bool,
    pub notes: Vec<PatchNote>,
}

impl RemotePatch {
    pub fn remote_addresses(&self) -> Vec<RemoteAddress> {
        self.addresses.iter().map(|p| p.address.clone()).collect()
    }

    pub fn remote_contacts(&self) -> Vec<RemoteContact> {
        self.contacts.iter().map(|p| p.contact.clone()).collect()
    }

    /// Serialises the patch, leaving out address, contact and role sections
    /// that already equal what `existing` stores.
    pub fn to_wire_body(&self, existing: &RemoteMemberDetail) -> Result<JsonValue, PatchError> {
        let mut body = Map::new();
        body.insert(
            "persoonsgegevens".to_string(),
            JsonValue::Object(self.personal.clone()),
        );
        body.insert(
            "vgagegevens".to_string(),
            JsonValue::Object(self.registration.clone()),
        );

        let addresses = self.remote_addresses();
        if existing.addresses != addresses {
            body.insert("adressen".to_string(), serde_json::to_value(&addresses)?);
        }
        let contacts = self.remote_contacts();
        if existing.contacts != contacts {
            body.insert("contacten".to_string(), serde_json::to_value(&contacts)?);
        }
        if existing.roles != self.roles {
            body.insert("functies".to_string(), serde_json::to_value(&self.roles)?);
        }
        if let Some(email) = &self.email {
            body.insert("email".to_string(), JsonValue::String(email.clone()));
        }
        Ok(JsonValue::Object(body))
    }

    /// The remote refuses several roles on creation; keep only the first.
    pub fn first_role_only(&self) -> Self {
        Self {
            roles: self.roles.iter().take(1).cloned().collect(),
            ..self.clone()
        }
    }
}

pub struct MemberPatchBuilder<'a> {
    sim: &'a dyn StringSimilarity,
    ctx: PatchContext<'a>,
}

impl<'a> MemberPatchBuilder<'a> {
    pub fn new(sim: &'a dyn StringSimilarity, ctx: PatchContext<'a>) -> Self {
        Self { sim, ctx }
    }

    pub fn build(
        &self,
        member: &LocalMember,
        existing: &RemoteMemberDetail,
        ids: &mut IdMinter,
    ) -> Result<RemotePatch, PatchError> {
        let addresses =
            AddressReconciler::new(self.sim).reconcile(member, &existing.addresses, ids);
        if addresses.is_empty() {
            return Err(PatchError::NoAddress);
        }
        let contacts = ContactReconciler::new(self.sim).reconcile(
            &member.parents,
            &existing.contacts,
            &addresses,
            ids,
        );

        let birth_date = member.birth_date.ok_or_else(|| PatchError::MissingBirthDate {
            member: member.full_name(),
        })?;

        let chosen = choose_role(self.sim, self.ctx.rules, self.ctx.managed, member, self.ctx.today)?;
        let plan = plan_roles(
            &member.full_name(),
            &existing.roles,
            self.ctx.managed,
            chosen,
            self.ctx.group_number,
            self.ctx.today,
        );
        let mut notes = plan.notes;
        if chosen.is_none() {
            if existing.is_new() {
                return Err(PatchError::NoRoleForNewMember {
                    member: member.full_name(),
                });
            }
            notes.push(PatchNote::Warning(format!(
                "{}: roles are managed manually in the remote directory",
                member.full_name()
            )));
        }

        let mut personal = existing.personal.clone().unwrap_or_default();
        personal.insert(
            "geslacht".to_string(),
            JsonValue::String(member.gender.wire_value().to_string()),
        );
        personal.insert(
            "gsm".to_string(),
            JsonValue::String(member.phone.clone().unwrap_or_default()),
        );

        let mut registration = existing.registration.clone().unwrap_or_default();
        registration
            .entry("verhoogdekinderbijslag")
            .or_insert(JsonValue::Bool(false));
        registration
            .entry("beperking")
            .or_insert(JsonValue::Bool(false));
        registration.insert(
            "voornaam".to_string(),
            JsonValue::String(member.first_name.clone()),
        );
        registration.insert(
            "achternaam".to_string(),
            JsonValue::String(member.last_name.clone()),
        );
        registration.insert(
            "geboortedatum".to_string(),
            JsonValue::String(wire_date(birth_date)),
        );
        registration.insert(
            "verminderdlidgeld".to_string(),
            JsonValue::Bool(member.requires_financial_support()),
        );

        let email = match &member.email {
            Some(email) if existing.email_editable() && existing.email.as_ref() != Some(email) => {
                Some(email.clone())
            }
            _ => None,
        };

        debug!(
            member = %member.full_name(),
            addresses = addresses.len(),
            contacts = contacts.len(),
            roles = plan.roles.len(),
            "built member patch"
        );

        Ok(RemotePatch {
            personal,
            registration,
            addresses,
            contacts,
            roles: plan.roles,
            email,
            unmanaged: chosen.is_none(),
            notes,
        })
    }
}
