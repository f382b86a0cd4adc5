//! Consensus machine — drives reviewer precheck, author proposal, and
//! reviewer review until agreement, stall, or hand-off.
//!
//! A consensus round counts only when every required reviewer returns
//! `no_blocker` on its final review step. Two stall guards bound the loop:
//! more than `in_round_retry_limit` unresolved retries inside one round,
//! and the same issue signature terminating `cross_round_repeat_limit`
//! consecutive rounds. Either stall persists `consensus_stall.json` and
//! hands the task to manual review.

use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::verdict::{
    issue_signature, normalize_audit_verdict, AuthorReply, ParseSource, ReviewVerdict,
    ReviewerVerdict,
};
use crate::gateway::{InvokeOutcome, InvokeRequest, ParticipantGateway, Phase};
use crate::store::{ArtifactStore, TaskRepository};
use crate::task::{EventKind, GateReason, ParticipantId, Task, TaskEvent};

/// Tunables for the consensus loop.
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// Unresolved retries tolerated within a single round.
    pub in_round_retry_limit: u32,
    /// Consecutive rounds ending with an identical issue signature.
    pub cross_round_repeat_limit: u32,
    /// Fallback per-call deadline when the task sets no phase timeout.
    pub default_phase_timeout: Duration,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            in_round_retry_limit: 10,
            cross_round_repeat_limit: 4,
            default_phase_timeout: Duration::from_secs(600),
        }
    }
}

/// Terminal outcome of the consensus phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusOutcome {
    /// Every required reviewer agreed; hand off for author confirmation.
    Agreed { rounds: u32 },
    StalledInRound {
        round: u32,
        retries: u32,
        signature: String,
    },
    StalledAcrossRounds {
        signature: String,
        repeats: u32,
    },
    PrecheckUnavailable {
        participant: ParticipantId,
        class: String,
    },
    ReviewUnavailable {
        participant: ParticipantId,
        class: String,
    },
    DeadlineReached,
    Canceled,
}

impl ConsensusOutcome {
    pub fn gate_reason(&self) -> GateReason {
        match self {
            Self::Agreed { .. } => GateReason::AuthorConfirmationRequired,
            Self::StalledInRound { .. } => GateReason::ProposalConsensusStalledInRound,
            Self::StalledAcrossRounds { .. } => GateReason::ProposalConsensusStalledAcrossRounds,
            Self::PrecheckUnavailable { .. } => GateReason::ProposalPrecheckUnavailable,
            Self::ReviewUnavailable { .. } => GateReason::ProposalReviewUnavailable,
            Self::DeadlineReached => GateReason::DeadlineReached,
            Self::Canceled => GateReason::ForceFailed,
        }
    }
}

/// One reviewer's verdict plus how it was obtained.
struct CollectedReview {
    participant: ParticipantId,
    verdict: ReviewerVerdict,
    degraded: bool,
}

/// Reviewer fan-out failure: a required reviewer was wholly unavailable.
struct Unavailable {
    participant: ParticipantId,
    class: String,
}

/// The proposal consensus machine.
pub struct ConsensusMachine<'a> {
    gateway: &'a dyn ParticipantGateway,
    repo: &'a dyn TaskRepository,
    artifacts: &'a ArtifactStore,
    config: ConsensusConfig,
}

impl<'a> ConsensusMachine<'a> {
    pub fn new(
        gateway: &'a dyn ParticipantGateway,
        repo: &'a dyn TaskRepository,
        artifacts: &'a ArtifactStore,
        config: ConsensusConfig,
    ) -> Self {
        Self {
            gateway,
            repo,
            artifacts,
            config,
        }
    }

    /// Run the consensus phase for a task. `max_rounds` consensus rounds
    /// are attempted; agreement anywhere hands off immediately.
    pub async fn run(&self, task: &Task, cancel: &CancellationToken) -> ConsensusOutcome {
        let max_rounds = task.options.max_rounds;
        let mut prior_signature: Option<String> = None;
        let mut consecutive_same: u32 = 0;

        for round in 1..=max_rounds {
            if cancel.is_cancelled() {
                return ConsensusOutcome::Canceled;
            }
            if deadline_passed(task) {
                return ConsensusOutcome::DeadlineReached;
            }

            // Reviewer-first precheck surfaces concerns before the author
            // invests in a proposal.
            let mut required_ids: Vec<String> = Vec::new();
            if task.options.debate_mode {
                let prechecks = match self
                    .collect_reviews(task, Phase::Precheck, &self.precheck_prompt(task), cancel)
                    .await
                {
                    Ok(reviews) => reviews,
                    Err(unavailable) => {
                        self.emit(
                            task,
                            EventKind::ProposalPrecheckUnavailable,
                            json!({"participant": unavailable.participant.to_string(), "class": unavailable.class}),
                            Some(unavailable.participant.clone()),
                        );
                        return ConsensusOutcome::PrecheckUnavailable {
                            participant: unavailable.participant,
                            class: unavailable.class,
                        };
                    }
                };
                for review in &prechecks {
                    self.emit(
                        task,
                        EventKind::ProposalPrecheckReview,
                        json!({
                            "round": round,
                            "verdict": review.verdict.verdict.to_string(),
                            "issues": review.verdict.open_issue_ids(),
                        }),
                        Some(review.participant.clone()),
                    );
                }
                required_ids = open_issue_union(&prechecks);
            }

            let is_final_round = round == max_rounds;
            let mut retries: u32 = 0;

            loop {
                if cancel.is_cancelled() {
                    return ConsensusOutcome::Canceled;
                }
                if deadline_passed(task) {
                    return ConsensusOutcome::DeadlineReached;
                }

                // Author proposal against the current issue contract.
                let prompt = self.proposal_prompt(task, round, &required_ids);
                let author_outcome = self
                    .invoke(task, &task.author, Phase::Proposal, &prompt, cancel)
                    .await;
                let reply = match &author_outcome {
                    InvokeOutcome::Ok { text, .. } => AuthorReply::parse(text),
                    outcome if outcome.is_unavailable() => {
                        return ConsensusOutcome::ReviewUnavailable {
                            participant: task.author.clone(),
                            class: outcome.class().to_string(),
                        };
                    }
                    InvokeOutcome::RuntimeError { detail } => {
                        warn!(task_id = %task.id, %detail, "author runtime error during proposal");
                        AuthorReply {
                            summary: String::new(),
                            issue_responses: Vec::new(),
                        }
                    }
                    _ => unreachable!("outcome classes are exhaustive"),
                };

                self.write_pending_proposal(task, round, &required_ids, &reply);

                if let Err(violation) = reply.validate_contract(&required_ids) {
                    retries += 1;
                    self.emit(
                        task,
                        EventKind::ProposalConsensusRetry,
                        json!({
                            "round": round,
                            "retries": retries,
                            "cause": "contract_violation",
                            "detail": violation.to_string(),
                        }),
                        Some(task.author.clone()),
                    );
                    if retries > self.config.in_round_retry_limit {
                        let signature = issue_signature(&required_ids);
                        return self.stall_in_round(task, round, retries, signature, &required_ids);
                    }
                    continue;
                }

                // Reviewer verdicts against the proposal.
                let reviews = match self
                    .collect_reviews(
                        task,
                        Phase::ProposalReview,
                        &self.review_prompt(task, round, &reply, &required_ids),
                        cancel,
                    )
                    .await
                {
                    Ok(reviews) => reviews,
                    Err(unavailable) => {
                        self.emit(
                            task,
                            EventKind::ProposalReviewUnavailable,
                            json!({"participant": unavailable.participant.to_string(), "class": unavailable.class}),
                            Some(unavailable.participant.clone()),
                        );
                        return ConsensusOutcome::ReviewUnavailable {
                            participant: unavailable.participant,
                            class: unavailable.class,
                        };
                    }
                };

                if reviews.iter().any(|r| r.degraded) {
                    self.emit(
                        task,
                        EventKind::ProposalReviewPartial,
                        json!({
                            "round": round,
                            "degraded": reviews
                                .iter()
                                .filter(|r| r.degraded)
                                .map(|r| r.participant.to_string())
                                .collect::<Vec<_>>(),
                        }),
                        None,
                    );
                }
                for review in &reviews {
                    self.emit(
                        task,
                        EventKind::ProposalReview,
                        json!({
                            "round": round,
                            "verdict": review.verdict.verdict.to_string(),
                            "issues": review.verdict.open_issue_ids(),
                            "issue_checks": review.verdict.issue_checks.len(),
                        }),
                        Some(review.participant.clone()),
                    );
                }

                let all_clear = reviews
                    .iter()
                    .all(|r| r.verdict.verdict == ReviewVerdict::NoBlocker);
                if all_clear {
                    info!(task_id = %task.id, round, "consensus reached");
                    self.emit(
                        task,
                        EventKind::ProposalConsensusReached,
                        json!({"round": round}),
                        None,
                    );
                    return ConsensusOutcome::Agreed { rounds: round };
                }

                let open = open_issue_union(&reviews);
                let signature = issue_signature(&open);
                debug!(task_id = %task.id, round, open = open.len(), "review kept blockers open");

                if is_final_round {
                    retries += 1;
                    self.emit(
                        task,
                        EventKind::ProposalConsensusRetry,
                        json!({
                            "round": round,
                            "retries": retries,
                            "cause": "review_blockers",
                            "signature": signature.clone(),
                            "open_issues": open.clone(),
                        }),
                        None,
                    );
                    if retries > self.config.in_round_retry_limit {
                        return self.stall_in_round(task, round, retries, signature, &open);
                    }
                    required_ids = open;
                    continue;
                }

                // Not the final round: close this round unresolved and track
                // the signature across rounds.
                match prior_signature.as_deref() {
                    Some(prev) if prev == signature => consecutive_same += 1,
                    _ => consecutive_same = 1,
                }
                prior_signature = Some(signature.clone());
                self.emit(
                    task,
                    EventKind::ProposalConsensusRetry,
                    json!({
                        "round": round,
                        "cause": "round_unresolved",
                        "signature": signature.clone(),
                        "repeats": consecutive_same,
                        "open_issues": open.clone(),
                    }),
                    None,
                );

                if consecutive_same >= self.config.cross_round_repeat_limit {
                    return self.stall_across_rounds(task, signature, consecutive_same, &open);
                }
                break;
            }
        }

        // max_rounds exhausted with shifting blockers: count a cross-round
        // stall on whatever was open last, so the task never dangles.
        let signature = prior_signature.unwrap_or_default();
        self.stall_across_rounds(task, signature, consecutive_same.max(1), &[])
    }

    fn stall_in_round(
        &self,
        task: &Task,
        round: u32,
        retries: u32,
        signature: String,
        open: &[String],
    ) -> ConsensusOutcome {
        warn!(task_id = %task.id, round, retries, "consensus stalled within round");
        self.write_stall_artifact(task, "in_round", round, retries, &signature, open);
        self.emit(
            task,
            EventKind::ProposalConsensusStalled,
            json!({
                "kind": "in_round",
                "round": round,
                "retries": retries,
                "signature": signature.clone(),
            }),
            None,
        );
        ConsensusOutcome::StalledInRound {
            round,
            retries,
            signature,
        }
    }

    fn stall_across_rounds(
        &self,
        task: &Task,
        signature: String,
        repeats: u32,
        open: &[String],
    ) -> ConsensusOutcome {
        warn!(task_id = %task.id, repeats, "consensus stalled across rounds");
        self.write_stall_artifact(task, "across_rounds", 0, repeats, &signature, open);
        self.emit(
            task,
            EventKind::ProposalConsensusStalled,
            json!({
                "kind": "across_rounds",
                "repeats": repeats,
                "signature": signature.clone(),
            }),
            None,
        );
        ConsensusOutcome::StalledAcrossRounds { signature, repeats }
    }

    fn write_stall_artifact(
        &self,
        task: &Task,
        kind: &str,
        round: u32,
        count: u32,
        signature: &str,
        open: &[String],
    ) {
        let artifact = json!({
            "task_id": task.id,
            "kind": kind,
            "round": round,
            "count": count,
            "signature": signature,
            "open_issues": open,
            "recorded_at": Utc::now(),
        });
        if let Err(e) = self
            .artifacts
            .write_json(&task.id, "artifacts/consensus_stall.json", &artifact)
        {
            warn!(task_id = %task.id, error = %e, "consensus stall artifact write failed");
        }
    }

    fn write_pending_proposal(
        &self,
        task: &Task,
        round: u32,
        required_ids: &[String],
        reply: &AuthorReply,
    ) {
        let artifact = json!({
            "task_id": task.id,
            "round": round,
            "required_issue_ids": required_ids,
            "summary": reply.summary,
            "issue_responses": reply.issue_responses,
            "recorded_at": Utc::now(),
        });
        if let Err(e) = self
            .artifacts
            .write_json(&task.id, "artifacts/pending_proposal.json", &artifact)
        {
            warn!(task_id = %task.id, error = %e, "pending proposal artifact write failed");
        }
    }

    /// Fan out to every reviewer, in declared order, and collect verdicts.
    /// Any wholly unavailable reviewer aborts the phase.
    async fn collect_reviews(
        &self,
        task: &Task,
        phase: Phase,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<CollectedReview>, Unavailable> {
        let calls = task.reviewers.iter().map(|reviewer| {
            let reviewer = reviewer.clone();
            async move {
                let outcome = self.invoke(task, &reviewer, phase, prompt, cancel).await;
                (reviewer, outcome)
            }
        });
        let outcomes = futures::future::join_all(calls).await;

        let mut reviews = Vec::with_capacity(outcomes.len());
        for (participant, outcome) in outcomes {
            match outcome {
                InvokeOutcome::Ok { text, .. } => {
                    let (verdict, degraded) = match ReviewerVerdict::parse(&text) {
                        Some((verdict, source)) => {
                            (verdict, source == ParseSource::Fallback)
                        }
                        None => (ReviewerVerdict::unavailable("unparseable output"), true),
                    };
                    let verdict = normalize_audit_verdict(verdict, &task.description);
                    reviews.push(CollectedReview {
                        participant,
                        verdict,
                        degraded,
                    });
                }
                InvokeOutcome::RuntimeError { detail } => {
                    reviews.push(CollectedReview {
                        participant,
                        verdict: ReviewerVerdict::unavailable(&detail),
                        degraded: true,
                    });
                }
                outcome => {
                    return Err(Unavailable {
                        participant,
                        class: outcome.class().to_string(),
                    });
                }
            }
        }
        Ok(reviews)
    }

    async fn invoke(
        &self,
        task: &Task,
        participant: &ParticipantId,
        phase: Phase,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> InvokeOutcome {
        let timeout_secs = match phase {
            Phase::Proposal | Phase::Discussion => task.options.phase_timeouts.discussion_secs,
            _ => task.options.phase_timeouts.review_secs,
        };
        let deadline = timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.config.default_phase_timeout);

        let request = InvokeRequest {
            participant: participant.clone(),
            phase,
            prompt: prompt.to_string(),
            working_dir: std::path::PathBuf::from(task.execution_root()),
            overrides: task.options.override_for(participant),
            deadline,
            stream: task.options.stream_mode,
        };
        let outcome = self.gateway.invoke(request, cancel).await;

        if let InvokeOutcome::Ok { stream_events, .. } = &outcome {
            for chunk in stream_events {
                self.emit(
                    task,
                    EventKind::ParticipantStream,
                    json!({"phase": phase.to_string(), "chunk": chunk.chunk}),
                    Some(participant.clone()),
                );
            }
        }
        outcome
    }

    fn emit(
        &self,
        task: &Task,
        kind: EventKind,
        payload: serde_json::Value,
        participant: Option<ParticipantId>,
    ) {
        let mut event = TaskEvent::new(&task.id, kind).with_payload(payload);
        if let Some(participant) = participant {
            event = event.with_participant(participant);
        }
        if let Err(e) = self.repo.append_event(event) {
            warn!(task_id = %task.id, kind = %kind, error = %e, "event append failed");
        }
    }

    fn precheck_prompt(&self, task: &Task) -> String {
        let mut prompt = format!(
            "You are a reviewer on task {title:?}.\n{description}\n\nBefore the author proposes a plan, raise any blocking concern.\n{format}",
            title = task.title,
            description = task.description,
            format = verdict_format(task),
        );
        push_language(task, &mut prompt);
        prompt
    }

    fn proposal_prompt(&self, task: &Task, round: u32, required_ids: &[String]) -> String {
        let mut prompt = format!(
            "You are the author on task {title:?} (consensus round {round}).\n{description}\n",
            title = task.title,
            round = round,
            description = task.description,
        );
        if let Some(note) = &task.revise_note {
            prompt.push_str(&format!("\nOperator feedback to incorporate: {}\n", note));
        }
        if !required_ids.is_empty() {
            prompt.push_str(&format!(
                "\nAnswer every raised issue id: {}.",
                required_ids.join(", ")
            ));
        } else {
            prompt.push_str("\nPropose a plan.");
        }
        if !task.options.plain_mode {
            prompt.push_str("\nReply with JSON: {\"summary\": \"...\", \"issue_responses\": [{\"issue_id\": \"...\", \"action\": \"accept\"|\"reject\", \"reason\": \"...\", \"alternative_plan\": \"...\", \"validation_commands\": [...], \"evidence_paths\": [...]}]}");
        }
        push_language(task, &mut prompt);
        prompt
    }

    fn review_prompt(
        &self,
        task: &Task,
        round: u32,
        reply: &AuthorReply,
        required_ids: &[String],
    ) -> String {
        let mut prompt = format!(
            "You are a reviewer on task {title:?} (consensus round {round}).\nThe author proposes: {summary}\nOpen issue ids: {ids}\nVerify each issue id in issue_checks.\n{format}",
            title = task.title,
            round = round,
            summary = reply.summary,
            ids = required_ids.join(", "),
            format = verdict_format(task),
        );
        push_language(task, &mut prompt);
        prompt
    }
}

/// Verdict format instruction: structured JSON normally, the marker-line
/// protocol the fallback parser reads when `plain_mode` is set.
pub(crate) fn verdict_format(task: &Task) -> &'static str {
    if task.options.plain_mode {
        "End your reply with two lines:\nVERDICT: no_blocker|blocker|unknown\nNEXT_ACTION: <what should happen next>\nName blocking issues as ISSUE-<id>."
    } else {
        "Reply with JSON: {\"verdict\": \"no_blocker\"|\"blocker\"|\"unknown\", \"issues\": [{\"issue_id\": \"ISSUE-xxx\", \"detail\": \"...\"}], \"issue_checks\": [{\"issue_id\": \"...\", \"resolved\": true|false, \"note\": \"...\"}], \"reason\": \"...\"}"
    }
}

/// Conversation-language directive appended to every prompt.
pub(crate) fn push_language(task: &Task, prompt: &mut String) {
    if task.options.conversation_language == crate::task::ConversationLanguage::Zh {
        prompt.push_str("\n请使用中文回复。");
    }
}

fn deadline_passed(task: &Task) -> bool {
    task.options
        .evolve_until
        .map(|deadline| Utc::now() >= deadline)
        .unwrap_or(false)
}

fn open_issue_union(reviews: &[CollectedReview]) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for review in reviews {
        for id in review.verdict.open_issue_ids() {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        // A blocking verdict that names no issues still blocks; track it
        // under a synthetic id so signatures reflect it.
        if review.verdict.verdict != ReviewVerdict::NoBlocker && review.verdict.issues.is_empty() {
            let synthetic = format!("ISSUE-UNSPECIFIED-{}", review.participant.alias);
            if !ids.contains(&synthetic) {
                ids.push(synthetic);
            }
        }
    }
    ids
}
