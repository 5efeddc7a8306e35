use crate::agent::{AgentOutcome, AgentRunner};
use crate::checkpoint::store::DEFAULT_TMP_MIN_AGE;
use crate::checkpoint::{
    Checkpoint, CheckpointStore, RunMarker, RunsDir, TransitionRecord, WorkstreamStatus,
    validate_feature_id,
};
use crate::config::Config;
use crate::errors::{CheckpointError, ExternalError, ResilienceError, SdpError, SessionError};
use crate::hooks::{HookContext, HookManager};
use crate::ledger::{Decision, DecisionLog, DecisionType, Session, default_actor};
use crate::orchestrator::hydrate::{self, ContextPacket, WorkstreamBrief};
use crate::phase::{self, Phase, PhaseResult};
use crate::policy::{
    self, OpaEvaluator, PolicyEvaluator, PolicyInput, PolicyResult, build_policy_input,
    read_evidence,
};
use crate::resilience::{
    Breakers, CircuitBreaker, DegradedMode, DegradedStatus, Guard, RetryConfig,
    with_degraded_mode,
};
use crate::resolver::{Action, CiStatus, RepoFacts, compute_next_action};
use crate::tracker::{GitCli, Vcs};
use crate::util::write_atomic;
use crate::workstream::{self, Workstream};
use anyhow::{Context, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Outcome of one successful `advance`.
#[derive(Debug, Clone, Serialize)]
pub struct AdvanceOutcome {
    pub feature_id: String,
    pub transition: TransitionRecord,
    pub policy: PolicyResult,
    pub next_action: Action,
}

/// Resumability report for one feature.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub feature_id: String,
    pub checkpoint_path: PathBuf,
    pub backlog_dir: PathBuf,
    pub resumable: bool,
    pub phase: Option<Phase>,
    pub branch: Option<String>,
    pub workstreams_completed: usize,
    pub workstreams_total: usize,
    pub current_workstream: Option<String>,
    pub pr_number: Option<u64>,
    pub last_transition: Option<TransitionRecord>,
    pub runs: Vec<RunMarker>,
    pub degraded: DegradedStatus,
}

/// Cache a good GitHub answer; a missing `gh` switches to degraded mode.
fn remember<T: Serialize>(degraded: &DegradedMode, key: &str, outcome: &Result<T, ExternalError>) {
    match outcome {
        Ok(value) => match serde_json::to_value(value) {
            Ok(v) => degraded.cache_put(key, v),
            Err(e) => tracing::debug!(error = %e, key, "could not cache value"),
        },
        Err(ExternalError::NotInstalled { tool }) => {
            degraded.enter(format!("{} is not installed", tool));
        }
        Err(_) => {}
    }
}

struct Loaded {
    checkpoint: Checkpoint,
    workstreams: Vec<Workstream>,
}

/// Drives one feature through its phases.
///
/// Each CLI invocation builds one engine, performs one operation and exits.
/// All external calls go through the engine's breakers and retry policy
/// and stop when `cancel` fires.
pub struct Engine {
    config: Config,
    store: CheckpointStore,
    runs: RunsDir,
    decisions: DecisionLog,
    vcs: Arc<dyn Vcs>,
    evaluator: Arc<dyn PolicyEvaluator>,
    hooks: HookManager,
    breakers: Breakers,
    retry: RetryConfig,
    degraded: DegradedMode,
    cancel: CancellationToken,
}

impl Engine {
    /// Engine backed by git, `gh` and `opa`.
    pub fn new(config: Config, cancel: CancellationToken) -> Result<Self> {
        let vcs: Arc<dyn Vcs> = Arc::new(GitCli::new(config.project_dir.clone()));
        let evaluator: Arc<dyn PolicyEvaluator> = Arc::new(
            OpaEvaluator::new(config.opa_bin.clone(), config.policy_package.clone())
                .with_timeout(config.policy_timeout),
        );
        Self::with_adapters(config, vcs, evaluator, cancel)
    }

    pub fn with_adapters(
        config: Config,
        vcs: Arc<dyn Vcs>,
        evaluator: Arc<dyn PolicyEvaluator>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let hooks = HookManager::new(&config.project_dir, config.hooks.clone())?;
        let store = config.checkpoint_store();
        match store.sweep_stale_tmp(DEFAULT_TMP_MIN_AGE) {
            Ok(0) => {}
            Ok(removed) => tracing::info!(removed, "removed stale checkpoint temp files"),
            Err(e) => tracing::warn!(error = %e, "could not sweep checkpoint temp files"),
        }

        Ok(Self {
            runs: config.runs(),
            decisions: DecisionLog::new(config.decisions_file.clone()),
            breakers: Breakers::new(&config.breaker),
            retry: config.retry.clone(),
            degraded: DegradedMode::new(),
            store,
            vcs,
            evaluator,
            hooks,
            cancel,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn vcs(&self) -> &dyn Vcs {
        self.vcs.as_ref()
    }

    fn guard<'a>(&'a self, breaker: &'a CircuitBreaker) -> Guard<'a> {
        Guard::new(breaker, &self.retry, &self.cancel)
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.store.save(checkpoint).map_err(SdpError::from)?;
        Ok(())
    }

    /// Load the checkpoint, or create it unless `resume` is set, and fold
    /// live workstream discovery into it.
    async fn load(&self, feature_id: &str, resume: bool) -> Result<Loaded> {
        validate_feature_id(feature_id).map_err(SdpError::from)?;
        let workstreams = workstream::discover(&self.config.project_dir, feature_id)?;

        let checkpoint = match self.store.load_optional(feature_id).map_err(SdpError::from)? {
            Some(mut checkpoint) => {
                if checkpoint.reconcile(&workstreams) {
                    self.save(&checkpoint)?;
                }
                checkpoint
            }
            None if resume => {
                let path = self.store.path_for(feature_id).map_err(SdpError::from)?;
                return Err(SdpError::from(CheckpointError::NotFound {
                    feature_id: feature_id.to_string(),
                    path,
                })
                .into());
            }
            None => {
                let branch = self.current_branch(None).await;
                let checkpoint = Checkpoint::create_initial(feature_id, &branch, &workstreams);
                self.save(&checkpoint)?;
                tracing::info!(
                    feature = feature_id,
                    branch = %branch,
                    workstreams = workstreams.len(),
                    "created checkpoint"
                );
                checkpoint
            }
        };

        Ok(Loaded {
            checkpoint,
            workstreams,
        })
    }

    /// Live branch name, or `fallback` (then `HEAD`) when git can't say.
    async fn current_branch(&self, fallback: Option<&str>) -> String {
        let vcs = self.vcs.as_ref();
        match self.guard(&self.breakers.git).call(|| vcs.current_branch()).await {
            Ok(branch) => branch,
            Err(e) => {
                let fallback = fallback.filter(|b| !b.is_empty()).unwrap_or("HEAD");
                tracing::warn!(error = %e, fallback, "could not read current branch");
                fallback.to_string()
            }
        }
    }

    /// Open PR for `branch`. A missing `gh` puts the engine into degraded
    /// mode, after which the last cached answer is served.
    async fn open_pr(&self, branch: &str) -> Option<u64> {
        let key = format!("pr:{}", branch);
        let key = key.as_str();
        let vcs = self.vcs.as_ref();
        let degraded = &self.degraded;
        let github = self.guard(&self.breakers.github);

        let result = with_degraded_mode(
            &self.cancel,
            degraded,
            move || async move {
                let pr = github.call(|| vcs.open_pr(branch)).await;
                remember(degraded, key, &pr);
                pr
            },
            move || async move {
                degraded
                    .cache_get(key)
                    .and_then(|v| serde_json::from_value::<Option<u64>>(v).ok())
                    .ok_or_else(|| ExternalError::unavailable("gh", "no cached pull request"))
            },
        )
        .await;

        match result {
            Ok(pr) => pr,
            Err(e) => {
                tracing::warn!(error = %e, branch, "could not look up pull request");
                None
            }
        }
    }

    async fn ci_status(&self, pr_number: u64) -> Option<CiStatus> {
        let key = format!("ci:{}", pr_number);
        let key = key.as_str();
        let vcs = self.vcs.as_ref();
        let degraded = &self.degraded;
        let github = self.guard(&self.breakers.github);

        let result = with_degraded_mode(
            &self.cancel,
            degraded,
            move || async move {
                let ci = github.call(|| vcs.ci_status(pr_number)).await;
                remember(degraded, key, &ci);
                ci
            },
            move || async move {
                degraded
                    .cache_get(key)
                    .and_then(|v| serde_json::from_value::<CiStatus>(v).ok())
                    .ok_or_else(|| ExternalError::unavailable("gh", "no cached CI status"))
            },
        )
        .await;

        match result {
            Ok(ci) => Some(ci),
            Err(e) => {
                tracing::warn!(error = %e, pr = pr_number, "could not read CI status");
                None
            }
        }
    }

    /// Snapshot repository state. GitHub is only asked once the feature
    /// has reached the PR phase.
    async fn repo_facts(&self, checkpoint: &Checkpoint) -> RepoFacts {
        let branch = self.current_branch(Some(&checkpoint.branch)).await;
        let reviews_passed = read_evidence(&self.config.evidence_dir, &checkpoint.feature_id)
            .map(|e| e.review_approved)
            .unwrap_or(false);

        let (open_pr, ci) = match checkpoint.phase {
            Phase::Pr | Phase::CiLoop => {
                let open_pr = self.open_pr(&branch).await;
                let ci = match (checkpoint.phase, open_pr.or(checkpoint.pr_number)) {
                    (Phase::CiLoop, Some(pr)) => self.ci_status(pr).await,
                    _ => None,
                };
                (open_pr, ci)
            }
            _ => (None, None),
        };

        RepoFacts {
            branch,
            open_pr,
            reviews_passed,
            ci,
        }
    }

    async fn changed_files(&self) -> Vec<String> {
        let vcs = self.vcs.as_ref();
        match self.guard(&self.breakers.git).call(|| vcs.changed_files()).await {
            Ok(files) => files,
            Err(e) => {
                tracing::warn!(error = %e, "could not list changed files; assuming none");
                Vec::new()
            }
        }
    }

    /// Run the policy bridge against `input`.
    pub async fn evaluate_input(&self, input: &PolicyInput) -> PolicyResult {
        policy::evaluate_policies(
            &self.config.policy_dir,
            input,
            self.evaluator.as_ref(),
            &self.guard(&self.breakers.policy),
        )
        .await
    }

    async fn evaluate(
        &self,
        checkpoint: &Checkpoint,
        workstream: Option<&Workstream>,
        branch: &str,
    ) -> PolicyResult {
        let changed = self.changed_files().await;
        let input = build_policy_input(
            &self.config.evidence_dir,
            checkpoint.phase,
            &checkpoint.feature_id,
            workstream,
            branch,
            changed,
        );
        self.evaluate_input(&input).await
    }

    /// Build the policy input for `sdp policy eval` without touching the
    /// checkpoint. `changed` replaces the live diff when given.
    pub async fn policy_input(
        &self,
        feature_id: &str,
        phase: Option<Phase>,
        changed: Option<Vec<String>>,
    ) -> Result<PolicyInput> {
        validate_feature_id(feature_id).map_err(SdpError::from)?;
        let checkpoint = self.store.load_optional(feature_id).map_err(SdpError::from)?;
        let phase = phase
            .or(checkpoint.as_ref().map(|c| c.phase))
            .unwrap_or(Phase::Build);
        let workstreams = workstream::discover(&self.config.project_dir, feature_id)?;
        let current = checkpoint
            .as_ref()
            .and_then(|c| c.current_workstream.as_deref())
            .and_then(|id| workstreams.iter().find(|w| w.id == id));
        let branch = self
            .current_branch(checkpoint.as_ref().map(|c| c.branch.as_str()))
            .await;
        let changed = match changed {
            Some(files) => files,
            None => self.changed_files().await,
        };
        Ok(build_policy_input(
            &self.config.evidence_dir,
            phase,
            feature_id,
            current,
            &branch,
            changed,
        ))
    }

    /// A corrupt session or one pinned to another feature is fatal; branch
    /// or remote drift is only reported.
    async fn verify_session(&self, feature_id: &str) -> Result<()> {
        let Some(session) =
            Session::load_optional(&self.config.project_dir).map_err(SdpError::from)?
        else {
            tracing::debug!("no session file; skipping session check");
            return Ok(());
        };
        if session.feature_id != feature_id {
            return Err(SdpError::from(SessionError::FeatureMismatch {
                pinned: session.feature_id,
                requested: feature_id.to_string(),
            })
            .into());
        }
        let git = self.guard(&self.breakers.git);
        match session.check_worktree(self.vcs.as_ref(), git).await {
            Ok(drift) => {
                for d in drift.iter().filter(|d| !d.expected.is_empty()) {
                    tracing::warn!(feature = feature_id, "session drift: {}", d);
                }
            }
            Err(e) => tracing::warn!(error = %e, "could not compare session with worktree"),
        }
        Ok(())
    }

    fn touch_run(&self, feature_id: &str, branch: &str, last_action: &str) {
        if let Err(e) = self.runs.touch(feature_id, branch, last_action) {
            tracing::warn!(error = %e, feature = feature_id, "could not update run marker");
        }
    }

    /// Compute the single next action and record it.
    ///
    /// A `build` action pins the workstream as current so a concurrent or
    /// resumed invocation picks the same one. When the feature is already
    /// past build, a `build` action for a late workstream reopens build
    /// first so the following `--advance` takes a commit.
    pub async fn next_action(&self, feature_id: &str, resume: bool) -> Result<Action> {
        let Loaded {
            mut checkpoint,
            workstreams,
        } = self.load(feature_id, resume).await?;
        let facts = self.repo_facts(&checkpoint).await;
        let action = compute_next_action(&checkpoint, &workstreams, &facts);

        if let Action::Build { ws_id } = &action {
            let reopened = match checkpoint.phase {
                Phase::Review | Phase::Pr | Phase::CiLoop => Some(
                    phase::reopen(&mut checkpoint, ws_id, &workstreams).map_err(SdpError::from)?,
                ),
                _ => None,
            };
            let repin = checkpoint.current_workstream.as_deref() != Some(ws_id.as_str());
            if repin {
                checkpoint
                    .start_workstream(ws_id, &workstreams)
                    .map_err(SdpError::from)?;
            }
            if repin || reopened.is_some() {
                self.save(&checkpoint)?;
            }
            if let Some(transition) = &reopened {
                self.record_transition(feature_id, transition, &PolicyResult::default());
            }
        }

        self.touch_run(feature_id, &facts.branch, action.name());
        tracing::info!(feature = feature_id, action = %action, "next action");
        Ok(action)
    }

    /// Confirm the current phase with `raw_result` and move to the next one.
    ///
    /// Order: session check, result parsing, `pre_phase` hooks, policy,
    /// atomic checkpoint write, `post_phase` hooks, decision log, run
    /// marker. Anything failing before the write leaves the checkpoint
    /// untouched.
    pub async fn advance(
        &self,
        feature_id: &str,
        raw_result: Option<&str>,
        resume: bool,
    ) -> Result<AdvanceOutcome> {
        let Loaded {
            mut checkpoint,
            workstreams,
        } = self.load(feature_id, resume).await?;
        self.verify_session(feature_id).await?;

        let from = checkpoint.phase;
        let result = PhaseResult::parse(from, raw_result).map_err(SdpError::from)?;
        let result_text = result.to_string();

        let target_ws = match from {
            Phase::Build => checkpoint.current_workstream.clone().or_else(|| {
                checkpoint
                    .next_workstream(&workstreams)
                    .map(|ws| ws.id.clone())
            }),
            _ => None,
        };
        if let Some(ws_id) = &target_ws {
            checkpoint
                .check_dependencies(ws_id, &workstreams)
                .map_err(SdpError::from)?;
        }
        let workstream = target_ws
            .as_deref()
            .and_then(|id| workstreams.iter().find(|w| w.id == id));

        let pre = HookContext::pre_phase(feature_id, from, target_ws.as_deref(), &result_text);
        let verdict = self.hooks.run_hooks(&pre, &self.cancel).await?;
        if !verdict.should_continue() {
            return Err(SdpError::HookBlocked {
                event: pre.event.to_string(),
                message: verdict
                    .message
                    .unwrap_or_else(|| "no reason given".to_string()),
            }
            .into());
        }

        let branch = self.current_branch(Some(&checkpoint.branch)).await;
        let policy = self.evaluate(&checkpoint, workstream, &branch).await;
        if policy.blocks() {
            return Err(SdpError::PolicyDenied {
                denials: policy.denials.clone(),
                warnings: policy.warnings.clone(),
            }
            .into());
        }
        for denial in &policy.denials {
            tracing::warn!(feature = feature_id, "advisory policy denial: {}", denial);
        }
        for warning in &policy.warnings {
            tracing::warn!(feature = feature_id, "policy warning: {}", warning);
        }

        if self.cancel.is_cancelled() {
            return Err(SdpError::from(ResilienceError::Cancelled).into());
        }
        let transition =
            phase::advance(&mut checkpoint, result, &workstreams).map_err(SdpError::from)?;
        self.save(&checkpoint)?;
        tracing::info!(
            feature = feature_id,
            from = %transition.from,
            to = %transition.to,
            result = %transition.result,
            "phase advanced"
        );

        let post = HookContext::post_phase(
            feature_id,
            transition.from,
            transition.to,
            transition.workstream.as_deref(),
            &result_text,
        );
        match self.hooks.run_hooks(&post, &self.cancel).await {
            Ok(verdict) if !verdict.should_continue() => tracing::warn!(
                feature = feature_id,
                message = verdict.message.as_deref().unwrap_or(""),
                "post_phase hook blocked after the transition was saved"
            ),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "post_phase hooks failed"),
        }

        self.record_transition(feature_id, &transition, &policy);
        self.touch_run(feature_id, &branch, &format!("advance:{}", transition.to));

        let facts = self.repo_facts(&checkpoint).await;
        let next_action = compute_next_action(&checkpoint, &workstreams, &facts);
        Ok(AdvanceOutcome {
            feature_id: feature_id.to_string(),
            transition,
            policy,
            next_action,
        })
    }

    fn record_transition(&self, feature_id: &str, t: &TransitionRecord, policy: &PolicyResult) {
        let mut decision = Decision::new(
            DecisionType::Explicit,
            format!("Advance {} past {}?", feature_id, t.from),
            format!("{} -> {} ({})", t.from, t.to, t.result),
        );
        decision.feature_id = feature_id.to_string();
        decision.workstream_id = t.workstream.clone().unwrap_or_default();
        decision.decision_maker = default_actor();
        if !policy.warnings.is_empty() {
            decision.rationale = format!("policy warnings: {}", policy.warnings.join("; "));
        }
        if let Err(e) = self.decisions.log(decision) {
            tracing::warn!(error = %e, feature = feature_id, "could not record transition");
        }
    }

    /// Context packet for the next phase, or for workstream `ws_id`.
    pub async fn hydrate(
        &self,
        feature_id: &str,
        ws_id: Option<&str>,
        resume: bool,
    ) -> Result<ContextPacket> {
        let Loaded {
            checkpoint,
            workstreams,
        } = self.load(feature_id, resume).await?;
        let facts = self.repo_facts(&checkpoint).await;
        let next_action = compute_next_action(&checkpoint, &workstreams, &facts);

        let target = ws_id.map(str::to_string).or_else(|| match &next_action {
            Action::Build { ws_id } => Some(ws_id.clone()),
            _ => None,
        });
        let workstream = match target {
            Some(id) => Some(
                workstreams
                    .iter()
                    .find(|w| w.id == id)
                    .with_context(|| format!("Workstream {} not found for {}", id, feature_id))?,
            ),
            None => None,
        };

        let policy = self.evaluate(&checkpoint, workstream, &facts.branch).await;
        let recent_decisions = hydrate::recent(self.decisions.by_feature(feature_id)?);

        Ok(ContextPacket {
            feature_id: feature_id.to_string(),
            phase: checkpoint.phase,
            branch: facts.branch,
            workstream: workstream.map(WorkstreamBrief::from),
            pending_workstreams: checkpoint
                .pending(&workstreams)
                .iter()
                .map(|w| w.id.clone())
                .collect(),
            recent_decisions,
            policy,
            next_action,
        })
    }

    /// Report what is stored for `feature_id` without creating anything.
    pub fn status(&self, feature_id: &str) -> Result<StatusReport> {
        validate_feature_id(feature_id).map_err(SdpError::from)?;
        let checkpoint = self.store.load_optional(feature_id).map_err(SdpError::from)?;
        let runs = self.runs.list_for(feature_id).map_err(SdpError::from)?;
        let checkpoint_path = self.store.path_for(feature_id).map_err(SdpError::from)?;

        let report = match checkpoint {
            Some(cp) => StatusReport {
                feature_id: feature_id.to_string(),
                checkpoint_path,
                backlog_dir: self.config.backlog_dir.clone(),
                resumable: !cp.phase.is_terminal(),
                phase: Some(cp.phase),
                workstreams_completed: cp
                    .workstreams
                    .iter()
                    .filter(|w| w.status == WorkstreamStatus::Completed)
                    .count(),
                workstreams_total: cp.workstreams.len(),
                current_workstream: cp.current_workstream.clone(),
                pr_number: cp.pr_number,
                last_transition: cp.history.last().cloned(),
                branch: Some(cp.branch),
                runs,
                degraded: self.degraded.status(),
            },
            None => StatusReport {
                feature_id: feature_id.to_string(),
                checkpoint_path,
                backlog_dir: self.config.backlog_dir.clone(),
                resumable: false,
                phase: None,
                branch: None,
                workstreams_completed: 0,
                workstreams_total: 0,
                current_workstream: None,
                pr_number: None,
                last_transition: None,
                runs,
                degraded: self.degraded.status(),
            },
        };
        Ok(report)
    }

    /// Hand the next phase to an agent runtime.
    ///
    /// Writes the rendered context packet next to the run markers and runs
    /// the agent through the agent breaker. The checkpoint is not advanced.
    pub async fn run_agent(
        &self,
        feature_id: &str,
        runner: &dyn AgentRunner,
        resume: bool,
    ) -> Result<AgentOutcome> {
        let packet = self.hydrate(feature_id, None, resume).await?;
        if packet.next_action == Action::Done {
            anyhow::bail!("{} is done; nothing to delegate", feature_id);
        }

        let prompt_file = self.config.runs_dir.join(format!(
            "{}-{}.prompt.md",
            feature_id,
            packet.next_action.name()
        ));
        write_atomic(&prompt_file, packet.render_prompt().as_bytes())
            .with_context(|| format!("Failed to write prompt file {}", prompt_file.display()))?;

        let workdir = self.config.project_dir.as_path();
        let outcome = self
            .breakers
            .agent
            .execute(&self.cancel, || runner.run(&prompt_file, workdir))
            .await
            .map_err(SdpError::from)?;

        self.touch_run(
            feature_id,
            &packet.branch,
            &format!("agent:{}", packet.next_action.name()),
        );
        if outcome.success {
            tracing::info!(feature = feature_id, runtime = %outcome.runtime, "agent finished");
        } else {
            tracing::warn!(
                feature = feature_id,
                runtime = %outcome.runtime,
                code = ?outcome.exit_code,
                "agent exited unsuccessfully"
            );
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::FakeAgentRunner;
    use crate::config::CliOverrides;
    use crate::errors::ErrorKind;
    use crate::policy::{FakeEvaluator, PolicyQuery};
    use crate::tracker::FakeVcs;
    use serde_json::json;
    use std::path::Path;
    use std::sync::atomic::Ordering;
    use tempfile::{TempDir, tempdir};

    fn write(root: &Path, rel: &str, body: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    fn project() -> TempDir {
        let dir = tempdir().unwrap();
        write(
            dir.path(),
            "docs/workstreams/backlog/00-016-01.md",
            "---\nws_id: 00-016-01\ntitle: Parser\n---\n# Parser\n\nWrite the parser.\n",
        );
        write(
            dir.path(),
            "docs/workstreams/backlog/00-016-02.md",
            "---\nws_id: 00-016-02\ntitle: Printer\n---\n# Printer\n",
        );
        dir
    }

    struct Harness {
        dir: TempDir,
        vcs: Arc<FakeVcs>,
        engine: Engine,
        cancel: CancellationToken,
    }

    fn harness_with(dir: TempDir, evaluator: FakeEvaluator) -> Harness {
        let config =
            Config::with_env(dir.path(), false, CliOverrides::default(), |_| None).unwrap();
        let vcs = Arc::new(FakeVcs::new(dir.path(), "feature/F016"));
        let cancel = CancellationToken::new();
        let engine =
            Engine::with_adapters(config, vcs.clone(), Arc::new(evaluator), cancel.clone())
                .unwrap();
        Harness {
            dir,
            vcs,
            engine,
            cancel,
        }
    }

    fn harness() -> Harness {
        harness_with(project(), FakeEvaluator::new())
    }

    fn sdp_error(err: &anyhow::Error) -> &SdpError {
        err.downcast_ref::<SdpError>().expect("SdpError")
    }

    fn build(ws: &str) -> Action {
        Action::Build {
            ws_id: ws.to_string(),
        }
    }

    #[tokio::test]
    async fn test_walks_two_workstreams_into_review() {
        let h = harness();
        assert_eq!(h.engine.next_action("F016", false).await.unwrap(), build("00-016-01"));

        let out = h.engine.advance("F016", Some("abc1234"), false).await.unwrap();
        assert_eq!(out.transition.to, Phase::Build);
        assert_eq!(out.transition.workstream.as_deref(), Some("00-016-01"));
        assert_eq!(out.next_action, build("00-016-02"));

        assert_eq!(h.engine.next_action("F016", true).await.unwrap(), build("00-016-02"));
        let out = h.engine.advance("F016", Some("def5678"), true).await.unwrap();
        assert_eq!(out.transition.to, Phase::Review);
        assert_eq!(
            out.next_action,
            Action::Review {
                feature_id: "F016".into()
            }
        );

        let cp = h.engine.store.load("F016").unwrap();
        assert_eq!(cp.phase, Phase::Review);
        assert!(cp.is_completed("00-016-01"));
        assert!(cp.is_completed("00-016-02"));
        assert_eq!(cp.history.len(), 2);

        let decisions = h.engine.decisions.by_feature("F016").unwrap();
        assert_eq!(decisions.len(), 2);
        assert_eq!(decisions[0].decision_type, DecisionType::Explicit);
        assert_eq!(decisions[0].workstream_id, "00-016-01");

        let runs = h.engine.runs.list_for("F016").unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].last_action, "advance:review");
    }

    #[tokio::test]
    async fn test_resume_without_checkpoint_fails() {
        let h = harness();
        let err = h.engine.next_action("F016", true).await.unwrap_err();
        assert!(matches!(
            sdp_error(&err),
            SdpError::Checkpoint(CheckpointError::NotFound { .. })
        ));
        assert!(!h.engine.store.exists("F016").unwrap());
    }

    #[tokio::test]
    async fn test_invalid_feature_id_rejected_before_io() {
        let h = harness();
        let err = h.engine.next_action("../etc", false).await.unwrap_err();
        assert!(matches!(
            sdp_error(&err),
            SdpError::Checkpoint(CheckpointError::InvalidFeatureId(_))
        ));
        assert!(!h.engine.config.checkpoint_dir.exists());
    }

    #[tokio::test]
    async fn test_wrong_result_kind_leaves_checkpoint() {
        let h = harness();
        h.engine.next_action("F016", false).await.unwrap();
        let before = h.engine.store.load("F016").unwrap();
        let err = h.engine.advance("F016", Some("approved"), true).await.unwrap_err();
        assert!(matches!(sdp_error(&err), SdpError::Phase(_)));
        assert_eq!(h.engine.store.load("F016").unwrap(), before);
    }

    #[tokio::test]
    async fn test_pre_phase_hook_blocks_transition() {
        let dir = project();
        let script = dir.path().join("deny.sh");
        std::fs::write(&script, "#!/bin/sh\necho 'tests are red' >&2\nexit 1\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        write(
            dir.path(),
            ".sdp/hooks.toml",
            &format!(
                "[[hooks]]\nevent = \"pre_phase\"\nmatch = \"build\"\ncommand = \"{}\"\n",
                script.display()
            ),
        );
        let h = harness_with(dir, FakeEvaluator::new());
        h.engine.next_action("F016", false).await.unwrap();
        let before = h.engine.store.load("F016").unwrap();

        let err = h.engine.advance("F016", Some("abc1234"), true).await.unwrap_err();
        match sdp_error(&err) {
            SdpError::HookBlocked { event, message } => {
                assert_eq!(event, "pre_phase");
                assert!(message.contains("tests are red"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(h.engine.store.load("F016").unwrap(), before);
        assert!(h.engine.decisions.load_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_blocking_policy_denial_rejects_transition() {
        let dir = project();
        std::fs::create_dir_all(dir.path().join(".sdp/policies")).unwrap();
        let evaluator = FakeEvaluator::new()
            .respond(PolicyQuery::EnforcementLevel, json!("blocking"))
            .respond(PolicyQuery::Deny, json!(["scope violation: src/main.rs"]));
        let h = harness_with(dir, evaluator);
        h.vcs.set_changed(&["src/main.rs"]);
        h.engine.next_action("F016", false).await.unwrap();

        let err = h.engine.advance("F016", Some("abc1234"), true).await.unwrap_err();
        match sdp_error(&err) {
            SdpError::PolicyDenied { denials, .. } => {
                assert_eq!(denials, &vec!["scope violation: src/main.rs".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!h.engine.store.load("F016").unwrap().is_completed("00-016-01"));
    }

    #[tokio::test]
    async fn test_advisory_denial_lets_transition_through() {
        let dir = project();
        std::fs::create_dir_all(dir.path().join(".sdp/policies")).unwrap();
        let evaluator = FakeEvaluator::new()
            .respond(PolicyQuery::EnforcementLevel, json!("advisory"))
            .respond(PolicyQuery::Deny, json!(["missing evidence"]));
        let h = harness_with(dir, evaluator);

        let out = h.engine.advance("F016", Some("abc1234"), false).await.unwrap();
        assert_eq!(out.policy.denials, vec!["missing evidence".to_string()]);
        assert!(h.engine.store.load("F016").unwrap().is_completed("00-016-01"));
    }

    #[tokio::test]
    async fn test_session_pinned_to_other_feature_is_fatal() {
        let h = harness();
        let mut session = Session::init("F017", h.dir.path(), "tester");
        session.save(h.dir.path()).unwrap();

        let err = h.engine.advance("F016", Some("abc1234"), false).await.unwrap_err();
        assert!(matches!(
            sdp_error(&err),
            SdpError::Session(SessionError::FeatureMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_tampered_session_is_fatal() {
        let h = harness();
        let mut session = Session::init("F016", h.dir.path(), "tester");
        session.save(h.dir.path()).unwrap();
        let path = h.dir.path().join(".sdp/session.json");
        let tampered = std::fs::read_to_string(&path)
            .unwrap()
            .replace("tester", "mallory");
        std::fs::write(&path, tampered).unwrap();

        let err = h.engine.advance("F016", Some("abc1234"), false).await.unwrap_err();
        assert!(matches!(
            sdp_error(&err),
            SdpError::Session(SessionError::HashMismatch { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_check_retries_transient_git_failure() {
        let h = harness();
        let mut session = Session::init("F016", h.dir.path(), "tester");
        session.expected_branch = "feature/F016".into();
        session.save(h.dir.path()).unwrap();

        // Two failed branch reads, then branch and remote succeed.
        h.vcs.fail_git(2);
        h.engine.verify_session("F016").await.unwrap();
        assert_eq!(h.vcs.git_failures.load(Ordering::SeqCst), 0);
        assert_eq!(h.engine.breakers.git.snapshot().failure_count, 0);
    }

    #[tokio::test]
    async fn test_cancelled_advance_does_not_write() {
        let h = harness();
        h.engine.next_action("F016", false).await.unwrap();
        let before = h.engine.store.load("F016").unwrap();
        h.cancel.cancel();
        assert!(h.engine.advance("F016", Some("abc1234"), true).await.is_err());
        assert_eq!(h.engine.store.load("F016").unwrap(), before);
    }

    #[tokio::test]
    async fn test_pr_and_ci_loop_reach_done() {
        let h = harness();
        h.engine.advance("F016", Some("abc1234"), false).await.unwrap();
        h.engine.advance("F016", Some("def5678"), true).await.unwrap();
        h.engine.advance("F016", Some("approved"), true).await.unwrap();
        assert_eq!(h.engine.next_action("F016", true).await.unwrap(), Action::Pr);

        h.vcs.set_pr(Some(42));
        assert_eq!(
            h.engine.next_action("F016", true).await.unwrap(),
            Action::CiLoop {
                pr_number: 42,
                feature_id: "F016".into()
            }
        );
        h.engine.advance("F016", Some("pr:42"), true).await.unwrap();
        assert_eq!(h.engine.store.load("F016").unwrap().pr_number, Some(42));

        h.vcs.set_ci(Some(CiStatus::Green));
        assert_eq!(h.engine.next_action("F016", true).await.unwrap(), Action::Done);
        let out = h.engine.advance("F016", Some("pass"), true).await.unwrap();
        assert_eq!(out.transition.to, Phase::Done);
        assert!(!h.engine.status("F016").unwrap().resumable);
    }

    #[tokio::test]
    async fn test_missing_gh_enters_degraded_mode() {
        let dir = project();
        let config =
            Config::with_env(dir.path(), false, CliOverrides::default(), |_| None).unwrap();
        let mut vcs = FakeVcs::new(dir.path(), "feature/F016");
        vcs.gh_missing = true;
        let engine = Engine::with_adapters(
            config,
            Arc::new(vcs),
            Arc::new(FakeEvaluator::new()),
            CancellationToken::new(),
        )
        .unwrap();
        engine.advance("F016", Some("abc1234"), false).await.unwrap();
        engine.advance("F016", Some("def5678"), true).await.unwrap();
        engine.advance("F016", Some("approved"), true).await.unwrap();

        assert_eq!(engine.next_action("F016", true).await.unwrap(), Action::Pr);
        let status = engine.status("F016").unwrap();
        assert!(status.degraded.active);
    }

    #[tokio::test]
    async fn test_reviews_passed_comes_from_evidence() {
        let h = harness();
        h.engine.advance("F016", Some("abc1234"), false).await.unwrap();
        h.engine.advance("F016", Some("def5678"), true).await.unwrap();
        write(
            h.dir.path(),
            ".sdp/evidence/F016.json",
            r#"{"findings":{"p0":0,"p1":0,"p2":1},"review_approved":true}"#,
        );
        assert_eq!(h.engine.next_action("F016", true).await.unwrap(), Action::Pr);
    }

    #[tokio::test]
    async fn test_new_workstream_is_scheduled_after_creation() {
        let h = harness();
        h.engine.advance("F016", Some("abc1234"), false).await.unwrap();
        h.engine.advance("F016", Some("def5678"), true).await.unwrap();
        write(h.dir.path(), "docs/workstreams/backlog/00-016-03.md", "# Late\n");
        write(
            h.dir.path(),
            ".sdp/evidence/F016.json",
            r#"{"review_approved":true}"#,
        );

        assert_eq!(h.engine.next_action("F016", true).await.unwrap(), build("00-016-03"));
        let cp = h.engine.store.load("F016").unwrap();
        assert_eq!(cp.workstreams.len(), 3);
        assert_eq!(cp.phase, Phase::Build);
        assert_eq!(cp.current_workstream.as_deref(), Some("00-016-03"));
        let last = cp.history.last().unwrap();
        assert_eq!((last.from, last.to), (Phase::Review, Phase::Build));
        assert_eq!(last.result, PhaseResult::Reopened);

        let out = h.engine.advance("F016", Some("0a1b2c3"), true).await.unwrap();
        assert_eq!(out.transition.workstream.as_deref(), Some("00-016-03"));
        assert_eq!(out.transition.to, Phase::Review);
        assert_eq!(out.next_action, Action::Pr);
    }

    #[tokio::test]
    async fn test_approval_refused_while_late_workstream_pending() {
        let h = harness();
        h.engine.advance("F016", Some("abc1234"), false).await.unwrap();
        h.engine.advance("F016", Some("def5678"), true).await.unwrap();
        write(h.dir.path(), "docs/workstreams/backlog/00-016-03.md", "# Late\n");

        let err = h.engine.advance("F016", Some("approved"), true).await.unwrap_err();
        let typed = sdp_error(&err);
        assert_eq!(typed.kind(), ErrorKind::Dependency);
        assert!(err.to_string().contains("00-016-03"), "{err}");
        assert_eq!(h.engine.store.load("F016").unwrap().phase, Phase::Review);
    }

    fn project_with_dependency() -> TempDir {
        let dir = tempdir().unwrap();
        write(
            dir.path(),
            "docs/workstreams/backlog/00-016-01.md",
            "---\ntitle: Printer\ndepends_on: [\"00-016-02\"]\n---\n# Printer\n",
        );
        write(
            dir.path(),
            "docs/workstreams/backlog/00-016-02.md",
            "---\ntitle: Parser\n---\n# Parser\n",
        );
        dir
    }

    #[tokio::test]
    async fn test_prerequisite_scheduled_before_dependent() {
        let h = harness_with(project_with_dependency(), FakeEvaluator::new());
        assert_eq!(h.engine.next_action("F016", false).await.unwrap(), build("00-016-02"));

        let out = h.engine.advance("F016", Some("abc1234"), true).await.unwrap();
        assert_eq!(out.transition.workstream.as_deref(), Some("00-016-02"));
        assert_eq!(out.next_action, build("00-016-01"));
    }

    #[tokio::test]
    async fn test_advance_on_blocked_workstream_names_prerequisite() {
        let h = harness_with(project_with_dependency(), FakeEvaluator::new());
        h.engine.next_action("F016", false).await.unwrap();
        let mut cp = h.engine.store.load("F016").unwrap();
        cp.current_workstream = Some("00-016-01".into());
        h.engine.store.save(&cp).unwrap();

        let err = h.engine.advance("F016", Some("abc1234"), true).await.unwrap_err();
        assert_eq!(sdp_error(&err).kind(), ErrorKind::Dependency);
        assert!(err.to_string().contains("depends on 00-016-02"), "{err}");
        assert_eq!(h.engine.store.load("F016").unwrap(), cp);
    }

    #[tokio::test]
    async fn test_hydrate_carries_workstream_and_decisions() {
        let h = harness();
        let mut d = Decision::new(DecisionType::Technical, "Which parser?", "hand-written");
        d.feature_id = "F016".into();
        h.engine.decisions.log(d).unwrap();

        let packet = h.engine.hydrate("F016", None, false).await.unwrap();
        assert_eq!(packet.next_action, build("00-016-01"));
        let ws = packet.workstream.unwrap();
        assert_eq!(ws.title, "Parser");
        assert!(ws.body.contains("Write the parser."));
        assert_eq!(packet.pending_workstreams, vec!["00-016-01", "00-016-02"]);
        assert_eq!(packet.recent_decisions.len(), 1);
        assert_eq!(packet.branch, "feature/F016");

        let explicit = h.engine.hydrate("F016", Some("00-016-02"), true).await.unwrap();
        assert_eq!(explicit.workstream.unwrap().id, "00-016-02");
        assert!(h.engine.hydrate("F016", Some("00-016-09"), true).await.is_err());
    }

    #[tokio::test]
    async fn test_run_agent_writes_prompt_and_does_not_advance() {
        let h = harness();
        let runner = FakeAgentRunner::succeeding();
        let outcome = h.engine.run_agent("F016", &runner, false).await.unwrap();
        assert!(outcome.success);

        let prompts = runner.prompts();
        assert_eq!(prompts.len(), 1);
        let prompt = std::fs::read_to_string(&prompts[0]).unwrap();
        assert!(prompt.contains("## Workstream 00-016-01: Parser"));
        assert_eq!(h.engine.store.load("F016").unwrap().phase, Phase::Build);
        assert!(h.engine.store.load("F016").unwrap().history.is_empty());
    }

    #[tokio::test]
    async fn test_status_without_checkpoint() {
        let h = harness();
        let status = h.engine.status("F016").unwrap();
        assert!(!status.resumable);
        assert!(status.phase.is_none());
        assert!(status.runs.is_empty());
    }

    #[tokio::test]
    async fn test_policy_input_uses_explicit_changes() {
        let h = harness();
        let input = h
            .engine
            .policy_input(
                "F016",
                Some(Phase::Review),
                Some(vec!["src/lib.rs".to_string()]),
            )
            .await
            .unwrap();
        assert_eq!(input.phase, Phase::Review);
        assert_eq!(input.changed_files, vec!["src/lib.rs"]);
        assert!(input.has_feature_changes);
        assert!(!h.engine.store.exists("F016").unwrap());
    }
}
