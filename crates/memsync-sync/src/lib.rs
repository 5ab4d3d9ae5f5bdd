//! Reconciliation run orchestration: configuration, review hand-offs, execution and reports.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDate, Utc};
use memsync_core::{LocalMember, RemoteEntry, RemoteMemberDetail, StringSimilarity, TypoDistance};
use memsync_match::{EntityMatcher, MatchOutcome, MatchTier, SuggestedDecision};
use memsync_patch::{
    removal_body, IdMinter, ManagedRoles, MemberPatchBuilder, PatchContext, PatchError, PatchNote,
    RemotePatch, RoleRules,
};
use memsync_remote::{
    find_group, CreatedMember, DirectoryClient, HttpClientConfig, OrganizationIdentity, Pacer,
    RemoteError, RemoteGroup, Transport, DEFAULT_PAGE_SIZE, DEFAULT_PACING,
};
use memsync_roster::{RosterError, RosterSource};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

pub const CRATE_NAME: &str = "memsync-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_base_url: String,
    pub access_token: String,
    pub roster_path: PathBuf,
    pub organization: OrganizationIdentity,
    pub page_size: usize,
    pub pacing: Duration,
    pub dry_run: bool,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub role_rules_path: Option<PathBuf>,
    pub reports_dir: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_vars(|_| None)
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let text = |key: &str| var(key).unwrap_or_default();
        Self {
            api_base_url: var("MEMSYNC_API_BASE_URL")
                .unwrap_or_else(|| HttpClientConfig::default().base_url),
            access_token: text("MEMSYNC_ACCESS_TOKEN"),
            roster_path: var("MEMSYNC_ROSTER_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./roster.json")),
            organization: OrganizationIdentity {
                name: text("MEMSYNC_ORGANIZATION_NAME"),
                street: text("MEMSYNC_ORGANIZATION_STREET"),
                postal_code: text("MEMSYNC_ORGANIZATION_POSTAL_CODE"),
            },
            page_size: var("MEMSYNC_PAGE_SIZE")
                .and_then(|v| v.parse().ok())
                .filter(|size| *size > 0)
                .unwrap_or(DEFAULT_PAGE_SIZE),
            pacing: var("MEMSYNC_PACING_MS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_PACING),
            dry_run: var("MEMSYNC_DRY_RUN")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            http_timeout_secs: var("MEMSYNC_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            user_agent: var("MEMSYNC_USER_AGENT").unwrap_or_else(|| "memsync/0.1".to_string()),
            role_rules_path: var("MEMSYNC_ROLE_RULES")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            reports_dir: var("MEMSYNC_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./reports")),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            base_url: self.api_base_url.clone(),
            access_token: self.access_token.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }

    pub fn load_role_rules(&self) -> Result<RoleRules> {
        match &self.role_rules_path {
            Some(path) => RoleRules::from_yaml_path(path),
            None => Ok(RoleRules::default()),
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error(transparent)]
    Roster(#[from] RosterError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Validation(#[from] PatchError),
    #[error("synchronisation cancelled by the operator")]
    Cancelled,
}

impl SyncError {
    fn configuration(step: &str) -> impl FnOnce(RemoteError) -> SyncError + '_ {
        move |err| SyncError::Configuration(format!("{step}: {err}"))
    }

    pub fn code(&self) -> &str {
        match self {
            SyncError::Configuration(_) => "configuration",
            SyncError::Roster(_) => "roster",
            SyncError::Remote(RemoteError::Rejected(failure)) => failure.code.as_str(),
            SyncError::Remote(RemoteError::Transient { .. }) => "transient_network",
            SyncError::Remote(RemoteError::Decode { .. }) => "unexpected_response",
            SyncError::Validation(_) => "local_validation",
            SyncError::Cancelled => "cancelled",
        }
    }

    pub fn messages(&self) -> Vec<String> {
        match self {
            SyncError::Remote(RemoteError::Rejected(failure)) => failure
                .messages
                .iter()
                .map(|m| match &m.field {
                    Some(field) => format!("{} ({field})", m.message),
                    None => m.message.clone(),
                })
                .collect(),
            other => vec![other.to_string()],
        }
    }
}

/// Who a report entry is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Subject {
    Member { local_id: Uuid, name: String },
    RemoteEntry { remote_id: String, name: String },
}

impl Subject {
    pub fn member(member: &LocalMember) -> Self {
        Subject::Member {
            local_id: member.id,
            name: member.full_name(),
        }
    }

    pub fn remote(entry: &RemoteEntry) -> Self {
        Subject::RemoteEntry {
            remote_id: entry.id.clone(),
            name: entry.full_name(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Subject::Member { name, .. } | Subject::RemoteEntry { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportError {
    pub subject: Subject,
    pub code: String,
    pub messages: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncedMember {
    pub local_id: Uuid,
    pub name: String,
    pub remote_id: Option<String>,
    pub member_number: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportCounts {
    pub synced: usize,
    pub created: usize,
    pub deleted: usize,
    pub unmanaged: usize,
    pub warnings: usize,
    pub errors: usize,
}

/// Outcome of a single run; the only surface for non-fatal problems.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub dry_run: bool,
    pub warnings: Vec<String>,
    pub info: Vec<String>,
    pub errors: Vec<ReportError>,
    pub synced: Vec<SyncedMember>,
    pub created: Vec<SyncedMember>,
    /// Members whose roles are not managed by the sync.
    pub unmanaged: Vec<SyncedMember>,
    pub deleted: Vec<RemoteEntry>,
}

impl SyncReport {
    pub fn new(run_id: Uuid, started_at: DateTime<Utc>, dry_run: bool) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: None,
            dry_run,
            warnings: Vec::new(),
            info: Vec::new(),
            errors: Vec::new(),
            synced: Vec::new(),
            created: Vec::new(),
            unmanaged: Vec::new(),
            deleted: Vec::new(),
        }
    }

    pub fn add_warning(&mut self, text: impl Into<String>) {
        self.warnings.push(text.into());
    }

    pub fn add_info(&mut self, text: impl Into<String>) {
        self.info.push(text.into());
    }

    pub fn add_error(&mut self, subject: Subject, err: &SyncError) {
        warn!(subject = subject.name(), code = err.code(), error = %err, "item failed");
        self.errors.push(ReportError {
            subject,
            code: err.code().to_string(),
            messages: err.messages(),
        });
    }

    fn add_notes(&mut self, notes: Vec<PatchNote>) {
        for note in notes {
            match note {
                PatchNote::Info(text) => self.add_info(text),
                PatchNote::Warning(text) => self.add_warning(text),
            }
        }
    }

    pub fn errors_for(&self, local_id: Uuid) -> Vec<&ReportError> {
        self.errors
            .iter()
            .filter(|e| matches!(&e.subject, Subject::Member { local_id: id, .. } if *id == local_id))
            .collect()
    }

    pub fn counts(&self) -> ReportCounts {
        ReportCounts {
            synced: self.synced.len(),
            created: self.created.len(),
            deleted: self.deleted.len(),
            unmanaged: self.unmanaged.len(),
            warnings: self.warnings.len(),
            errors: self.errors.len(),
        }
    }

    pub fn to_markdown(&self) -> String {
        let counts = self.counts();
        let mut lines = vec![
            "# Member Sync Report".to_string(),
            String::new(),
            format!("- Run ID: `{}`", self.run_id),
            format!("- Started: {}", self.started_at),
            format!(
                "- Finished: {}",
                self.finished_at
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "unfinished".to_string())
            ),
            format!("- Dry run: {}", self.dry_run),
            format!("- Synced: {}", counts.synced),
            format!("- Created: {}", counts.created),
            format!("- Deleted: {}", counts.deleted),
            format!("- Errors: {}", counts.errors),
        ];

        if !self.errors.is_empty() {
            lines.push(String::new());
            lines.push("## Errors".to_string());
            for error in &self.errors {
                lines.push(format!(
                    "- {} [{}]: {}",
                    error.subject.name(),
                    error.code,
                    error.messages.join("; ")
                ));
            }
        }
        if !self.warnings.is_empty() {
            lines.push(String::new());
            lines.push("## Warnings".to_string());
            lines.extend(self.warnings.iter().map(|w| format!("- {w}")));
        }
        if !self.info.is_empty() {
            lines.push(String::new());
            lines.push("## Changes".to_string());
            lines.extend(self.info.iter().map(|i| format!("- {i}")));
        }
        if !self.created.is_empty() {
            lines.push(String::new());
            lines.push("## Created".to_string());
            for member in &self.created {
                lines.push(format!(
                    "- {} (remote id: {}, member number: {})",
                    member.name,
                    member.remote_id.as_deref().unwrap_or("-"),
                    member.member_number.as_deref().unwrap_or("-")
                ));
            }
        }
        if !self.deleted.is_empty() {
            lines.push(String::new());
            lines.push("## Removed from sections".to_string());
            lines.extend(self.deleted.iter().map(|e| format!("- {}", e.full_name())));
        }
        if !self.unmanaged.is_empty() {
            lines.push(String::new());
            lines.push("## Roles managed manually".to_string());
            lines.extend(self.unmanaged.iter().map(|m| format!("- {}", m.name)));
        }
        lines.push(String::new());
        lines.join("\n")
    }
}

/// Operator answer for one ambiguous candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub local_id: Uuid,
    pub confirmed: bool,
}

pub fn load_decisions(path: impl AsRef<Path>) -> Result<Vec<Decision>> {
    let path = path.as_ref();
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// What happens to remote entries no local member matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanDisposition {
    /// End their managed roles in the remote directory.
    Delete,
    Import,
    Ignore,
}

impl FromStr for OrphanDisposition {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "delete" => Ok(OrphanDisposition::Delete),
            "import" => Ok(OrphanDisposition::Import),
            "ignore" | "nothing" => Ok(OrphanDisposition::Ignore),
            other => Err(format!("unknown orphan disposition {other:?} (delete, import, ignore)")),
        }
    }
}

impl fmt::Display for OrphanDisposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OrphanDisposition::Delete => "delete",
            OrphanDisposition::Import => "import",
            OrphanDisposition::Ignore => "ignore",
        })
    }
}

/// Entry point for one reconciliation run against a remote directory.
pub struct Reconciler<'a> {
    config: SyncConfig,
    transport: &'a dyn Transport,
    roster: &'a dyn RosterSource,
    rules: RoleRules,
    sim: Box<dyn StringSimilarity>,
    today: NaiveDate,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        config: SyncConfig,
        transport: &'a dyn Transport,
        roster: &'a dyn RosterSource,
    ) -> Result<Self> {
        let rules = config.load_role_rules()?;
        Ok(Self {
            config,
            transport,
            roster,
            rules,
            sim: Box::new(TypoDistance),
            today: Local::now().date_naive(),
        })
    }

    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }

    pub fn with_similarity(mut self, sim: Box<dyn StringSimilarity>) -> Self {
        self.sim = sim;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn client(&self) -> DirectoryClient<'a> {
        DirectoryClient::new(self.transport, Pacer::new(self.config.pacing))
    }

    /// Fetching and Matching. Nothing is written remotely before the
    /// returned review has been resolved and executed.
    pub async fn plan(&self) -> Result<MatchReview<'_>, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("reconcile_run", run_id = %run_id);

        async {
            let started_at = Utc::now();
            let members = self.roster.load().await?;
            info!(source = self.roster.source_id(), members = members.len(), "loaded local roster");

            let client = self.client();
            let (group, managed) = self.configure(&client).await?;
            let remotes = client.fetch_all(self.config.page_size).await?;
            info!(group = %group.number, remote_entries = remotes.len(), "fetched remote directory");

            let outcomes = EntityMatcher::new(self.sim.as_ref())
                .match_members(&members, &remotes, &client)
                .await?;

            Ok::<_, SyncError>(MatchReview {
                ctx: RunContext {
                    reconciler: self,
                    run_id,
                    started_at,
                    span: Span::current(),
                    group,
                    managed,
                    remotes,
                },
                members,
                outcomes,
            })
        }
        .instrument(span)
        .await
    }

    async fn configure(
        &self,
        client: &DirectoryClient<'_>,
    ) -> Result<(RemoteGroup, ManagedRoles), SyncError> {
        let groups = client
            .fetch_groups()
            .await
            .map_err(SyncError::configuration("fetching groups"))?;
        let group = find_group(&groups, &self.config.organization)
            .cloned()
            .ok_or_else(|| {
                SyncError::Configuration(format!(
                    "no remote group matches organisation {:?}; check its name and address",
                    self.config.organization.name
                ))
            })?;

        let roles = client
            .fetch_roles(&group.number)
            .await
            .map_err(SyncError::configuration("fetching roles"))?;
        let permitted = roles.iter().any(|role| {
            role.code
                .as_deref()
                .is_some_and(|code| self.rules.permission_codes.iter().any(|p| p == code))
        });
        if !permitted {
            return Err(SyncError::Configuration(format!(
                "the account needs one of the roles {} in group {}",
                self.rules.permission_codes.join(", "),
                group.number
            )));
        }

        let managed = ManagedRoles::resolve(&self.rules, &roles)
            .map_err(|err| SyncError::Configuration(err.to_string()))?;
        client
            .apply_member_filter(&group.number, &roles)
            .await
            .map_err(SyncError::configuration("applying member filter"))?;
        debug!(group = %group.number, roles = roles.len(), "remote configuration resolved");
        Ok((group, managed))
    }
}

struct RunContext<'r> {
    reconciler: &'r Reconciler<'r>,
    run_id: Uuid,
    started_at: DateTime<Utc>,
    span: Span,
    group: RemoteGroup,
    managed: ManagedRoles,
    remotes: Vec<RemoteEntry>,
}

/// A probable or last-resort hit awaiting the operator.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'m> {
    pub member: &'m LocalMember,
    pub remote: &'m RemoteEntry,
    pub tier: MatchTier,
    pub suggested: SuggestedDecision,
}

/// First hand-off. Dropping it cancels the run.
pub struct MatchReview<'r> {
    ctx: RunContext<'r>,
    members: Vec<LocalMember>,
    outcomes: Vec<MatchOutcome>,
}

impl<'r> MatchReview<'r> {
    pub fn run_id(&self) -> Uuid {
        self.ctx.run_id
    }

    pub fn group(&self) -> &RemoteGroup {
        &self.ctx.group
    }

    pub fn remote_entries(&self) -> &[RemoteEntry] {
        &self.ctx.remotes
    }

    pub fn members(&self) -> &[LocalMember] {
        &self.members
    }

    pub fn outcomes(&self) -> &[MatchOutcome] {
        &self.outcomes
    }

    pub fn candidates(&self) -> Vec<Candidate<'_>> {
        self.members
            .iter()
            .zip(&self.outcomes)
            .filter_map(|(member, outcome)| match outcome {
                MatchOutcome::AmbiguousCandidate {
                    remote,
                    tier,
                    suggested,
                    ..
                } => Some(Candidate {
                    member,
                    remote,
                    tier: *tier,
                    suggested: *suggested,
                }),
                _ => None,
            })
            .collect()
    }

    /// Decisions built from each candidate's suggestion.
    pub fn suggested_decisions(&self) -> Vec<Decision> {
        self.candidates()
            .into_iter()
            .map(|c| Decision {
                local_id: c.member.id,
                confirmed: c.suggested == SuggestedDecision::Confirm,
            })
            .collect()
    }

    pub fn cancel(self) -> SyncError {
        info!(run_id = %self.ctx.run_id, "run cancelled during candidate review");
        SyncError::Cancelled
    }

    /// Confirmed candidates become matches; everything else is a new person.
    pub fn resolve(self, decisions: &[Decision]) -> OrphanReview<'r> {
        let known: HashSet<Uuid> = self.members.iter().map(|m| m.id).collect();
        for decision in decisions.iter().filter(|d| !known.contains(&d.local_id)) {
            debug!(local_id = %decision.local_id, "ignoring decision for unknown member");
        }

        let mut matched = Vec::new();
        let mut new_members = Vec::new();
        for (member, outcome) in self.members.into_iter().zip(self.outcomes) {
            match outcome {
                MatchOutcome::Matched { remote_id, .. } => matched.push((member, remote_id)),
                MatchOutcome::NewMember { .. } => new_members.push(member),
                MatchOutcome::AmbiguousCandidate { local_id, remote, .. } => {
                    let confirmed = decisions
                        .iter()
                        .any(|d| d.local_id == local_id && d.confirmed);
                    if confirmed {
                        matched.push((member, remote.id));
                    } else {
                        new_members.push(member);
                    }
                }
            }
        }

        let orphans: Vec<RemoteEntry> = {
            let taken: HashSet<&str> = matched.iter().map(|(_, id)| id.as_str()).collect();
            self.ctx
                .remotes
                .iter()
                .filter(|entry| !taken.contains(entry.id.as_str()))
                .cloned()
                .collect()
        };

        info!(
            matched = matched.len(),
            new = new_members.len(),
            orphans = orphans.len(),
            "candidate review resolved"
        );
        OrphanReview {
            ctx: self.ctx,
            matched,
            new_members,
            orphans,
        }
    }
}

/// Second hand-off. Dropping it cancels the run.
pub struct OrphanReview<'r> {
    ctx: RunContext<'r>,
    matched: Vec<(LocalMember, String)>,
    new_members: Vec<LocalMember>,
    orphans: Vec<RemoteEntry>,
}

impl<'r> OrphanReview<'r> {
    pub fn orphans(&self) -> &[RemoteEntry] {
        &self.orphans
    }

    pub fn cancel(self) -> SyncError {
        info!(run_id = %self.ctx.run_id, "run cancelled during orphan review");
        SyncError::Cancelled
    }

    pub fn resolve(self, disposition: OrphanDisposition) -> ExecutionPlan<'r> {
        ExecutionPlan {
            ctx: self.ctx,
            matched: self.matched,
            new_members: self.new_members,
            orphans: self.orphans,
            disposition,
        }
    }
}

pub struct ExecutionPlan<'r> {
    ctx: RunContext<'r>,
    matched: Vec<(LocalMember, String)>,
    new_members: Vec<LocalMember>,
    orphans: Vec<RemoteEntry>,
    disposition: OrphanDisposition,
}

struct Applied {
    record: SyncedMember,
    notes: Vec<PatchNote>,
    unmanaged: bool,
}

impl<'r> ExecutionPlan<'r> {
    pub fn matched(&self) -> &[(LocalMember, String)] {
        &self.matched
    }

    pub fn new_members(&self) -> &[LocalMember] {
        &self.new_members
    }

    pub fn disposition(&self) -> OrphanDisposition {
        self.disposition
    }

    /// Processes orphans, then matched members, then new members. A failing
    /// item is recorded in the report and never stops the run.
    pub async fn execute(self, mut progress: impl FnMut(&str, f64)) -> SyncReport {
        let span = self.ctx.span.clone();
        async move {
            let reconciler = self.ctx.reconciler;
            let dry_run = reconciler.config.dry_run;
            let client = reconciler.client();
            let mut report = SyncReport::new(self.ctx.run_id, self.ctx.started_at, dry_run);
            let mut ids = IdMinter::new(Utc::now().timestamp_millis());

            let orphan_steps = match self.disposition {
                OrphanDisposition::Ignore => 0,
                _ => self.orphans.len(),
            };
            let total = (orphan_steps + self.matched.len() + self.new_members.len()).max(1) as f64;
            let mut step = 0usize;
            let mut advance = |label: String| {
                progress(&label, step as f64 / total);
                step += 1;
            };

            match self.disposition {
                OrphanDisposition::Delete => {
                    for orphan in &self.orphans {
                        advance(format!("{} removing...", orphan.full_name()));
                        match self.remove_orphan(&client, orphan).await {
                            Ok(true) => report.deleted.push(orphan.clone()),
                            Ok(false) => report.add_info(format!(
                                "{}: no managed role to end, left untouched",
                                orphan.full_name()
                            )),
                            Err(err) => report.add_error(Subject::remote(orphan), &err),
                        }
                    }
                }
                OrphanDisposition::Import => {
                    for orphan in &self.orphans {
                        advance(format!("{} importing...", orphan.full_name()));
                        report.add_warning(format!("not yet imported: {}", orphan.full_name()));
                    }
                }
                OrphanDisposition::Ignore => {}
            }

            for (member, remote_id) in &self.matched {
                advance(format!("{} updating...", member.full_name()));
                match self.update_member(&client, member, remote_id, &mut ids).await {
                    Ok(applied) => {
                        info!(member = %member.full_name(), remote_id = %remote_id, "member synced");
                        report.add_notes(applied.notes);
                        if applied.unmanaged {
                            report.unmanaged.push(applied.record.clone());
                        }
                        report.synced.push(applied.record);
                    }
                    Err(err) => report.add_error(Subject::member(member), &err),
                }
            }

            for member in &self.new_members {
                advance(format!("{} adding...", member.full_name()));
                match self.create_member(&client, member, &mut ids).await {
                    Ok(applied) => {
                        info!(member = %member.full_name(), "member created");
                        report.add_notes(applied.notes);
                        report.created.push(applied.record);
                    }
                    Err(err) => report.add_error(Subject::member(member), &err),
                }
            }

            report.finished_at = Some(Utc::now());
            let counts = report.counts();
            info!(
                synced = counts.synced,
                created = counts.created,
                deleted = counts.deleted,
                errors = counts.errors,
                dry_run,
                "reconciliation finished"
            );
            report
        }
        .instrument(span)
        .await
    }

    fn builder(&self) -> MemberPatchBuilder<'_> {
        let reconciler = self.ctx.reconciler;
        MemberPatchBuilder::new(
            reconciler.sim.as_ref(),
            PatchContext {
                group_number: &self.ctx.group.number,
                managed: &self.ctx.managed,
                rules: &reconciler.rules,
                today: reconciler.today,
            },
        )
    }

    fn dry_run(&self) -> bool {
        self.ctx.reconciler.config.dry_run
    }

    async fn remove_orphan(
        &self,
        client: &DirectoryClient<'_>,
        orphan: &RemoteEntry,
    ) -> Result<bool, SyncError> {
        let detail = client.fetch_detail(&orphan.id).await?;
        if !self.ctx.managed.holds_managed_role(&detail.roles) {
            return Ok(false);
        }
        let body = removal_body(&detail, &self.ctx.managed, self.ctx.reconciler.today)?;
        if !self.dry_run() {
            client.update_member(&orphan.id, body).await?;
        }
        Ok(true)
    }

    async fn update_member(
        &self,
        client: &DirectoryClient<'_>,
        member: &LocalMember,
        remote_id: &str,
        ids: &mut IdMinter,
    ) -> Result<Applied, SyncError> {
        let detail = client.fetch_detail(remote_id).await?;
        let patch = self.builder().build(member, &detail, ids)?;
        let body = patch.to_wire_body(&detail)?;

        let mut member_number = detail.member_number().map(str::to_string);
        if !self.dry_run() {
            let response = client.update_member(remote_id, body).await?;
            if let Some(number) = response_member_number(&response) {
                member_number = Some(number);
            }
        }

        Ok(Applied {
            record: SyncedMember {
                local_id: member.id,
                name: member.full_name(),
                remote_id: Some(remote_id.to_string()),
                member_number,
            },
            notes: patch.notes,
            unmanaged: patch.unmanaged,
        })
    }

    async fn create_member(
        &self,
        client: &DirectoryClient<'_>,
        member: &LocalMember,
        ids: &mut IdMinter,
    ) -> Result<Applied, SyncError> {
        let shell = RemoteMemberDetail::empty_shell();
        let patch = self.builder().build(member, &shell, ids)?;

        let mut record = SyncedMember {
            local_id: member.id,
            name: member.full_name(),
            remote_id: None,
            member_number: None,
        };
        if self.dry_run() {
            return Ok(Applied {
                record,
                notes: patch.notes,
                unmanaged: patch.unmanaged,
            });
        }

        let created = post_new_member(client, &patch).await?;
        record.remote_id = Some(created.id);
        record.member_number = created.member_number;

        Ok(Applied {
            record,
            notes: patch.notes,
            unmanaged: patch.unmanaged,
        })
    }
}

/// Posts a new record. The remote accepts one role on creation, so any
/// further roles follow in a second write against the created id.
async fn post_new_member(
    client: &DirectoryClient<'_>,
    patch: &RemotePatch,
) -> Result<CreatedMember, SyncError> {
    let shell = RemoteMemberDetail::empty_shell();
    let mut created = client
        .create_member(patch.first_role_only().to_wire_body(&shell)?)
        .await?;
    if patch.roles.len() > 1 {
        let roles = serde_json::to_value(&patch.roles).map_err(PatchError::from)?;
        debug!(id = %created.id, roles = patch.roles.len(), "adding remaining roles");
        let response = client
            .update_member(&created.id, serde_json::json!({ "functies": roles }))
            .await?;
        if let Some(number) = response_member_number(&response) {
            created.member_number = Some(number);
        }
    }
    Ok(created)
}

fn response_member_number(response: &JsonValue) -> Option<String> {
    response
        .get("verbondsgegevens")
        .and_then(|v| v.get("lidnummer"))
        .and_then(JsonValue::as_str)
        .map(str::to_string)
}

/// Writes `sync_report.md` and `sync_report.json` under `<reports_dir>/<run_id>/`.
pub async fn write_report(report: &SyncReport, reports_dir: &Path) -> Result<PathBuf> {
    let run_dir = reports_dir.join(report.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    fs::write(run_dir.join("sync_report.md"), report.to_markdown())
        .await
        .context("writing sync_report.md")?;

    let json = serde_json::to_vec_pretty(report).context("serializing sync report")?;
    fs::write(run_dir.join("sync_report.json"), json)
        .await
        .context("writing sync_report.json")?;

    Ok(run_dir)
}

/// Digest of the most recent `runs` reports, newest first.
pub fn report_markdown(runs: usize, reports_dir: &Path) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_dir)
        .with_context(|| format!("reading {}", reports_dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# Member Sync Runs".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs.max(1)) {
        let run_id = dir.file_name().to_string_lossy().to_string();
        let json_path = dir.path().join("sync_report.json");
        if !json_path.exists() {
            continue;
        }
        let report: SyncReport = serde_json::from_str(
            &std::fs::read_to_string(&json_path)
                .with_context(|| format!("reading {}", json_path.display()))?,
        )
        .with_context(|| format!("parsing {}", json_path.display()))?;
        let counts = report.counts();

        lines.push(format!("## Run `{run_id}`"));
        lines.push(format!("- started: {}", report.started_at));
        lines.push(format!("- dry run: {}", report.dry_run));
        lines.push(format!(
            "- synced: {}, created: {}, deleted: {}",
            counts.synced, counts.created, counts.deleted
        ));
        lines.push(format!(
            "- warnings: {}, errors: {}",
            counts.warnings, counts.errors
        ));
        lines.push(format!(
            "- report: `{}`",
            dir.path().join("sync_report.md").display()
        ));
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}
