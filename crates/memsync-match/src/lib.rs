//! Three-tier identity matching between the local roster and the remote directory.

use async_trait::async_trait;
use memsync_core::{date_key, LocalMember, RemoteEntry, StringSimilarity};
use memsync_remote::{DirectoryClient, RemoteError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "memsync-match";

/// Combined name and date distance allowed on the probable tier.
pub const PROBABLE_TOTAL_BUDGET: usize = 3;
pub const PROBABLE_DATE_BUDGET: usize = 1;
pub const LAST_RESORT_NAME_BUDGET: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchTier {
    Exact,
    Probable,
    LastResort,
}

/// Default a reviewer is offered for an ambiguous candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestedDecision {
    Confirm,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MatchOutcome {
    Matched {
        local_id: Uuid,
        remote_id: String,
    },
    AmbiguousCandidate {
        local_id: Uuid,
        remote: RemoteEntry,
        tier: MatchTier,
        suggested: SuggestedDecision,
    },
    NewMember {
        local_id: Uuid,
    },
}

impl MatchOutcome {
    pub fn local_id(&self) -> Uuid {
        match self {
            MatchOutcome::Matched { local_id, .. }
            | MatchOutcome::AmbiguousCandidate { local_id, .. }
            | MatchOutcome::NewMember { local_id } => *local_id,
        }
    }

    fn candidate(local_id: Uuid, remote: &RemoteEntry, tier: MatchTier) -> Self {
        let suggested = match tier {
            MatchTier::LastResort => SuggestedDecision::Reject,
            MatchTier::Exact | MatchTier::Probable => SuggestedDecision::Confirm,
        };
        MatchOutcome::AmbiguousCandidate {
            local_id,
            remote: remote.clone(),
            tier,
            suggested,
        }
    }
}

/// Per-member "similar names" search on the remote side.
#[async_trait]
pub trait SimilarLookup: Send + Sync {
    async fn similar(&self, first_name: &str, last_name: &str)
        -> Result<Vec<RemoteEntry>, RemoteError>;
}

#[async_trait]
impl<'a> SimilarLookup for DirectoryClient<'a> {
    async fn similar(
        &self,
        first_name: &str,
        last_name: &str,
    ) -> Result<Vec<RemoteEntry>, RemoteError> {
        self.fetch_similar(first_name, last_name).await
    }
}

pub struct EntityMatcher<'a> {
    sim: &'a dyn StringSimilarity,
}

fn name_length(first: &str, last: &str) -> usize {
    first.chars().count() + last.chars().count()
}

impl<'a> EntityMatcher<'a> {
    pub fn new(sim: &'a dyn StringSimilarity) -> Self {
        Self { sim }
    }

    fn name_distance(&self, local: &LocalMember, remote: &RemoteEntry) -> usize {
        self.sim.distance(&local.full_name(), &remote.full_name())
    }

    fn date_distance(&self, local: &LocalMember, remote: &RemoteEntry) -> Option<usize> {
        let local = local.birth_date?;
        let remote = remote.birth_date?;
        Some(self.sim.distance(&date_key(local), &date_key(remote)))
    }

    /// Name distance must stay under 40% of the shorter full name.
    fn within_name_ratio(&self, distance: usize, local: &LocalMember, remote: &RemoteEntry) -> bool {
        let shortest = name_length(&local.first_name, &local.last_name)
            .min(name_length(&remote.first_name, &remote.last_name));
        distance * 5 < shortest * 2
    }

    pub fn is_exact(&self, local: &LocalMember, remote: &RemoteEntry) -> bool {
        if local.birth_date.is_none() {
            return false;
        }
        if let (Some(ours), Some(theirs)) = (&local.member_number, &remote.member_number) {
            if ours == theirs {
                return true;
            }
        }
        self.name_distance(local, remote) == 0 && self.date_distance(local, remote) == Some(0)
    }

    pub fn is_probable(&self, local: &LocalMember, remote: &RemoteEntry) -> bool {
        if local.birth_date.is_none() {
            return false;
        }
        if let (Some(ours), Some(theirs)) = (&local.member_number, &remote.member_number) {
            return ours == theirs;
        }
        let Some(date) = self.date_distance(local, remote) else {
            return false;
        };
        let name = self.name_distance(local, remote);
        name + date <= PROBABLE_TOTAL_BUDGET
            && date <= PROBABLE_DATE_BUDGET
            && self.within_name_ratio(name, local, remote)
    }

    pub fn is_last_resort(&self, local: &LocalMember, remote: &RemoteEntry) -> bool {
        let name = self.name_distance(local, remote);
        name <= LAST_RESORT_NAME_BUDGET && self.within_name_ratio(name, local, remote)
    }

    /// Probable hits across `remotes` win over last-resort hits.
    pub fn loose_candidate<'r>(
        &self,
        local: &LocalMember,
        remotes: &'r [RemoteEntry],
    ) -> Option<(&'r RemoteEntry, MatchTier)> {
        remotes
            .iter()
            .find(|r| self.is_probable(local, r))
            .map(|r| (r, MatchTier::Probable))
            .or_else(|| {
                remotes
                    .iter()
                    .find(|r| self.is_last_resort(local, r))
                    .map(|r| (r, MatchTier::LastResort))
            })
    }

    /// Runs the full cascade. The similar-names lookup is only consulted for
    /// members without an exact hit in `remotes`.
    pub async fn match_members(
        &self,
        locals: &[LocalMember],
        remotes: &[RemoteEntry],
        lookup: &dyn SimilarLookup,
    ) -> Result<Vec<MatchOutcome>, RemoteError> {
        let mut outcomes = Vec::with_capacity(locals.len());

        for local in locals {
            if let Some(remote) = remotes.iter().find(|r| self.is_exact(local, r)) {
                outcomes.push(MatchOutcome::Matched {
                    local_id: local.id,
                    remote_id: remote.id.clone(),
                });
                continue;
            }

            let similar = lookup.similar(&local.first_name, &local.last_name).await?;
            debug!(member = %local.full_name(), hits = similar.len(), "similar-names lookup");

            if let Some(remote) = similar.iter().find(|r| self.is_exact(local, r)) {
                outcomes.push(MatchOutcome::Matched {
                    local_id: local.id,
                    remote_id: remote.id.clone(),
                });
                continue;
            }

            let outcome = match self
                .loose_candidate(local, remotes)
                .or_else(|| self.loose_candidate(local, &similar))
            {
                Some((remote, tier)) => MatchOutcome::candidate(local.id, remote, tier),
                None => MatchOutcome::NewMember { local_id: local.id },
            };
            outcomes.push(outcome);
        }

        let matched = outcomes
            .iter()
            .filter(|o| matches!(o, MatchOutcome::Matched { .. }))
            .count();
        let ambiguous = outcomes
            .iter()
            .filter(|o| matches!(o, MatchOutcome::AmbiguousCandidate { .. }))
            .count();
        info!(
            members = locals.len(),
            matched,
            ambiguous,
            new = outcomes.len() - matched - ambiguous,
            "matched local roster against remote directory"
        );
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use memsync_core::TypoDistance;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeLookup {
        entries: Vec<RemoteEntry>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SimilarLookup for FakeLookup {
        async fn similar(&self, _first: &str, _last: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.entries.clone())
        }
    }

    fn local(first: &str, last: &str, birth: Option<(i32, u32, u32)>) -> LocalMember {
        LocalMember {
            id: Uuid::new_v4(),
            first_name: first.to_string(),
            last_name: last.to_string(),
            birth_date: birth.and_then(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d)),
            gender: Default::default(),
            phone: None,
            email: None,
            address: None,
            parents: Vec::new(),
            member_number: None,
            groups: Vec::new(),
            records: Vec::new(),
        }
    }

    fn remote(id: &str, first: &str, last: &str, birth: (i32, u32, u32)) -> RemoteEntry {
        RemoteEntry {
            id: id.to_string(),
            first_name: first.to_string(),
            last_name: last.to_string(),
            member_number: None,
            gender: None,
            birth_date: NaiveDate::from_ymd_opt(birth.0, birth.1, birth.2),
        }
    }

    async fn run(locals: &[LocalMember], remotes: &[RemoteEntry], lookup: &FakeLookup) -> Vec<MatchOutcome> {
        let sim = TypoDistance;
        EntityMatcher::new(&sim)
            .match_members(locals, remotes, lookup)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn exact_hits_skip_the_similar_lookup() {
        let locals = vec![local("Lotte", "Peeters", Some((2015, 3, 14)))];
        let remotes = vec![
            remote("r0", "Warre", "Claes", (2012, 11, 2)),
            remote("r1", "lotte", "peeters", (2015, 3, 14)),
        ];
        let lookup = FakeLookup::default();
        let outcomes = run(&locals, &remotes, &lookup).await;
        assert_eq!(
            outcomes,
            vec![MatchOutcome::Matched {
                local_id: locals[0].id,
                remote_id: "r1".to_string()
            }]
        );
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn equal_member_numbers_match_despite_renames() {
        let mut member = local("Lotte", "Peeters-Claes", Some((2015, 3, 14)));
        member.member_number = Some("1203991".to_string());
        let mut entry = remote("r1", "Lotte", "Peeters", (2015, 3, 14));
        entry.member_number = Some("1203991".to_string());
        let outcomes = run(&[member], &[entry], &FakeLookup::default()).await;
        assert!(matches!(&outcomes[0], MatchOutcome::Matched { remote_id, .. } if remote_id == "r1"));
    }

    #[tokio::test]
    async fn typos_become_probable_candidates() {
        let locals = vec![
            local("Lotte", "Peters", Some((2015, 3, 14))),
            local("Warre", "Claes", Some((2012, 11, 3))),
        ];
        let remotes = vec![
            remote("r1", "Lotte", "Peeters", (2015, 3, 14)),
            remote("r2", "Warre", "Claes", (2012, 11, 2)),
        ];
        let outcomes = run(&locals, &remotes, &FakeLookup::default()).await;
        for (outcome, remote_id) in outcomes.iter().zip(["r1", "r2"]) {
            match outcome {
                MatchOutcome::AmbiguousCandidate {
                    remote,
                    tier,
                    suggested,
                    ..
                } => {
                    assert_eq!(remote.id, remote_id);
                    assert_eq!(*tier, MatchTier::Probable);
                    assert_eq!(*suggested, SuggestedDecision::Confirm);
                }
                other => panic!("expected candidate, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn wrong_birth_date_falls_back_to_last_resort() {
        let locals = vec![local("Lotte", "Peeters", Some((2016, 7, 1)))];
        let remotes = vec![remote("r1", "Lotte", "Peters", (2015, 3, 14))];
        let outcomes = run(&locals, &remotes, &FakeLookup::default()).await;
        assert!(matches!(
            &outcomes[0],
            MatchOutcome::AmbiguousCandidate {
                tier: MatchTier::LastResort,
                suggested: SuggestedDecision::Reject,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn short_names_need_proportionally_small_distances() {
        let locals = vec![local("An", "Li", Some((2015, 3, 14)))];
        let remotes = vec![remote("r1", "En", "Lu", (2001, 1, 1))];
        let outcomes = run(&locals, &remotes, &FakeLookup::default()).await;
        assert!(matches!(outcomes[0], MatchOutcome::NewMember { .. }));
    }

    #[tokio::test]
    async fn similar_lookup_can_confirm_or_suggest() {
        let locals = vec![
            local("Noor", "Janssens", Some((2018, 6, 30))),
            local("Mila", "Wouters", Some((2013, 2, 2))),
        ];
        let lookup = FakeLookup {
            entries: vec![
                remote("s1", "Noor", "Janssens", (2018, 6, 30)),
                remote("s2", "Mila", "Wouter", (2013, 2, 2)),
            ],
            ..Default::default()
        };
        let outcomes = run(&locals, &[], &lookup).await;
        assert!(matches!(&outcomes[0], MatchOutcome::Matched { remote_id, .. } if remote_id == "s1"));
        assert!(matches!(
            &outcomes[1],
            MatchOutcome::AmbiguousCandidate { remote, tier: MatchTier::Probable, .. } if remote.id == "s2"
        ));
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn members_without_birth_date_only_reach_last_resort() {
        let locals = vec![local("Lotte", "Peeters", None)];
        let remotes = vec![remote("r1", "Lotte", "Peeters", (2015, 3, 14))];
        let outcomes = run(&locals, &remotes, &FakeLookup::default()).await;
        assert!(matches!(
            &outcomes[0],
            MatchOutcome::AmbiguousCandidate { tier: MatchTier::LastResort, .. }
        ));
    }

    #[tokio::test]
    async fn disjoint_rosters_are_all_new() {
        let locals = vec![
            local("Lotte", "Peeters", Some((2015, 3, 14))),
            local("Warre", "Claes", Some((2012, 11, 2))),
            local("Noor", "Janssens", Some((2018, 6, 30))),
        ];
        let remotes = vec![
            remote("r1", "Bram", "Vermeulen", (2009, 1, 5)),
            remote("r2", "Ines", "De Smet", (2011, 9, 21)),
        ];
        let outcomes = run(&locals, &remotes, &FakeLookup::default()).await;
        assert_eq!(outcomes.len(), 3);
        for (outcome, member) in outcomes.iter().zip(&locals) {
            assert_eq!(outcome, &MatchOutcome::NewMember { local_id: member.id });
        }
    }
}
