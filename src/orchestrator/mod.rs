//! Drives the two-phase deployment, the workload lifecycle and account failover.
//!
//! One [`Orchestrator`] exists per process. Every state-changing operation takes the
//! workload lock first, because the platform exposes a single current profile and the
//! deployment record must always agree with it.
mod state;


pub use state::{
    DeployPhase, DeploymentRecord, DeploymentSettings, RecordPhase, WorkloadSnapshot,
    WorkloadState,
};

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tracing::{error, info, warn};

use crate::db::enums::AccountStatus;
use crate::db::services::account_service::{Account, AccountStore};
use crate::error::{Result, RotorError};
use crate::monitor::balance::BalanceMonitor;
use crate::monitor::readiness::{Readiness, ReadinessProbe, wait_until_ready};
use crate::platform::command::PlatformCommand;
use crate::platform::profile::ProfileSwitcher;
use crate::platform::runner::{CommandExit, CommandRunner};
use crate::platform::volume::VolumeBrowser;

#[derive(Debug, Default)]
struct WorkloadSlot {
    state: WorkloadState,
    record: Option<DeploymentRecord>,
}

pub struct Orchestrator {
    store: AccountStore,
    runner: Arc<dyn CommandRunner>,
    profiles: ProfileSwitcher,
    monitor: BalanceMonitor,
    volume: VolumeBrowser,
    probe: Arc<dyn ReadinessProbe>,
    settings: DeploymentSettings,
    slot: Mutex<WorkloadSlot>,
    snapshot_tx: watch::Sender<WorkloadSnapshot>,
}

impl Orchestrator {
    pub fn new(
        store: AccountStore,
        runner: Arc<dyn CommandRunner>,
        profiles: ProfileSwitcher,
        monitor: BalanceMonitor,
        volume: VolumeBrowser,
        probe: Arc<dyn ReadinessProbe>,
        settings: DeploymentSettings,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(WorkloadSnapshot::default());
        Self {
            store,
            runner,
            profiles,
            monitor,
            volume,
            probe,
            settings,
            slot: Mutex::new(WorkloadSlot::default()),
            snapshot_tx,
        }
    }

    fn threshold(&self) -> f64 {
        self.monitor.threshold()
    }

    fn publish(&self, slot: &WorkloadSlot) {
        self.snapshot_tx.send_replace(WorkloadSnapshot {
            state: slot.state,
            record: slot.record.clone(),
        });
    }

    /// Current workload state and record. Never waits for an in-flight operation.
    pub fn snapshot(&self) -> WorkloadSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkloadSnapshot> {
        self.snapshot_tx.subscribe()
    }

    // --- Accounts ---

    pub async fn add_account(
        &self,
        username: &str,
        token_id: &str,
        token_secret: &str,
    ) -> Result<Account> {
        let _slot = self.slot.lock().await;
        self.store
            .create_account(username, token_id, token_secret)
            .await
    }

    pub async fn list_accounts(&self) -> Result<Vec<Account>> {
        self.store.list_all().await
    }

    /// Binds `username` to the platform profile and marks it active.
    ///
    /// A workload running on a different account is stopped first. Credential and
    /// profile failures leave the store untouched.
    pub async fn switch_to_account(&self, username: &str) -> Result<Account> {
        let mut slot = self.slot.lock().await;
        self.switch_locked(&mut slot, username).await
    }

    /// Activates the richest eligible account, skipping candidates that fail.
    pub async fn switch_to_next_available(&self) -> Result<Account> {
        let mut slot = self.slot.lock().await;
        self.switch_next_locked(&mut slot).await
    }

    async fn switch_locked(&self, slot: &mut WorkloadSlot, username: &str) -> Result<Account> {
        let account = self.store.get(username).await?;
        let threshold = self.threshold();
        if account.balance < threshold {
            return Err(RotorError::InsufficientBalance {
                username: account.username,
                balance: account.balance,
                threshold,
            });
        }
        if account.status == AccountStatus::Dead {
            return Err(RotorError::Conflict(format!(
                "account '{username}' is dead until its balance is re-checked"
            )));
        }

        let credentials = self.store.credentials(username).await?;

        let running_elsewhere = slot
            .record
            .as_ref()
            .is_some_and(|record| record.username != username);
        if running_elsewhere {
            self.stop_locked(slot, false).await?;
        }

        let outcome = self.profiles.switch_to(username, &credentials).await?;
        let account = self.store.set_active(username).await?;
        info!(username = %username, outcome = ?outcome, "Switched to account.");
        Ok(account)
    }

    async fn switch_next_locked(&self, slot: &mut WorkloadSlot) -> Result<Account> {
        self.refresh_unchecked_locked(slot).await?;
        let threshold = self.threshold();
        let mut tried = BTreeSet::new();
        loop {
            let Some(candidate) = self.store.next_available(threshold, &tried).await? else {
                warn!(tried = tried.len(), "Account pool exhausted.");
                return Err(RotorError::NoAvailableAccount);
            };
            match self.switch_locked(slot, &candidate.username).await {
                Ok(account) => return Ok(account),
                Err(e) if e.is_account_scoped() => {
                    warn!(username = %candidate.username, error = %e, "Candidate failed; trying the next one.");
                    tried.insert(candidate.username);
                }
                Err(e) => return Err(e),
            }
        }
    }

    // --- Deployment ---

    /// Runs one deployment phase on `username`. Failures revert the account to
    /// `ready`; nothing is retried.
    pub async fn deploy_phase(&self, username: &str, phase: DeployPhase) -> Result<()> {
        let mut slot = self.slot.lock().await;
        self.deploy_phase_locked(&mut slot, username, phase).await
    }

    pub async fn deploy_phase1(&self, username: &str) -> Result<()> {
        self.deploy_phase(username, DeployPhase::Phase1).await
    }

    pub async fn deploy_phase2(&self, username: &str) -> Result<()> {
        self.deploy_phase(username, DeployPhase::Phase2).await
    }

    async fn deploy_phase_locked(
        &self,
        slot: &mut WorkloadSlot,
        username: &str,
        phase: DeployPhase,
    ) -> Result<()> {
        let account = self.switch_locked(slot, username).await?;
        // A redeploy replaces whatever still runs on this account.
        self.stop_locked(slot, false).await?;
        self.store.set_status(username, AccountStatus::Building).await?;

        let gpu = account
            .selected_gpu
            .unwrap_or_else(|| self.settings.default_gpu.clone());
        let (state, record_phase) = match phase {
            DeployPhase::Phase1 => (WorkloadState::Preparing, RecordPhase::Preparing),
            DeployPhase::Phase2 => (WorkloadState::Starting, RecordPhase::Starting),
        };
        slot.state = state;
        slot.record = Some(DeploymentRecord::new(username, &gpu, record_phase));
        self.publish(slot);

        let timeout = self.settings.phase_timeout(phase);
        let command = PlatformCommand::Deploy {
            file: self.settings.phase_file(phase).clone(),
        };
        info!(username = %username, %phase, timeout_secs = timeout.as_secs(), "Starting deployment phase.");

        let output = match self.runner.run(&command, timeout).await {
            Ok(output) => output,
            Err(e) => {
                self.abandon_locked(slot, username).await;
                return Err(e);
            }
        };
        match output.exit {
            CommandExit::Code(0) => {}
            CommandExit::Timeout => {
                self.abandon_locked(slot, username).await;
                return Err(RotorError::Timeout(format!(
                    "{phase} exceeded {}s",
                    timeout.as_secs()
                )));
            }
            CommandExit::Code(code) => {
                let stderr = output.failure_detail();
                error!(username = %username, %phase, code, stderr = %stderr, "Deployment phase failed.");
                self.abandon_locked(slot, username).await;
                return Err(RotorError::DeployFailed {
                    phase,
                    code,
                    stderr,
                });
            }
        }

        match phase {
            DeployPhase::Phase1 => {
                slot.record = None;
                slot.state = WorkloadState::Idle;
            }
            DeployPhase::Phase2 => {
                if let Err(e) = self.store.set_active(username).await {
                    self.abandon_locked(slot, username).await;
                    return Err(e);
                }
                slot.record = Some(DeploymentRecord::new(username, &gpu, RecordPhase::Running));
                slot.state = WorkloadState::Running;
            }
        }
        self.publish(slot);
        info!(username = %username, %phase, "Deployment phase completed.");
        Ok(())
    }

    /// Drops the in-flight record and hands the account back to the pool.
    async fn abandon_locked(&self, slot: &mut WorkloadSlot, username: &str) {
        slot.record = None;
        slot.state = WorkloadState::Idle;
        self.publish(slot);
        if let Err(e) = self.store.release(username).await {
            error!(username = %username, error = %e, "Failed to revert account status.");
        }
    }

    // --- Workload lifecycle ---

    /// Launches the long-running workload on `username` and waits until its endpoint
    /// answers. The deployment record exists only once the workload is ready.
    pub async fn start(&self, username: &str, gpu: Option<&str>) -> Result<DeploymentRecord> {
        let mut slot = self.slot.lock().await;
        self.start_locked(&mut slot, username, gpu).await
    }

    async fn start_locked(
        &self,
        slot: &mut WorkloadSlot,
        username: &str,
        gpu: Option<&str>,
    ) -> Result<DeploymentRecord> {
        if let Some(record) = slot.record.as_ref().filter(|r| r.username == username) {
            if let Some(requested) = gpu.filter(|requested| *requested != record.gpu) {
                return Err(RotorError::Conflict(format!(
                    "workload already runs on '{username}' with {}; stop it before starting on {requested}",
                    record.gpu
                )));
            }
            info!(username = %username, "Workload already running on this account.");
            return Ok(record.clone());
        }

        let account = self.switch_locked(slot, username).await?;
        let gpu = gpu
            .map(str::to_string)
            .or(account.selected_gpu)
            .unwrap_or_else(|| self.settings.default_gpu.clone());
        self.store.set_selected_gpu(username, &gpu).await?;
        self.store.set_status(username, AccountStatus::Building).await?;

        slot.state = WorkloadState::Starting;
        self.publish(slot);
        self.launch_run(&gpu);

        tokio::time::sleep(self.settings.startup_grace).await;
        let readiness = wait_until_ready(
            self.probe.as_ref(),
            self.settings.readiness_max_wait,
            self.settings.readiness_interval,
        )
        .await;

        match readiness {
            Readiness::Ready => {
                if let Err(e) = self.store.set_active(username).await {
                    self.abandon_locked(slot, username).await;
                    return Err(e);
                }
                let record = DeploymentRecord::new(username, &gpu, RecordPhase::Running);
                slot.record = Some(record.clone());
                slot.state = WorkloadState::Running;
                self.publish(slot);
                info!(username = %username, gpu = %gpu, "Workload is running.");
                Ok(record)
            }
            Readiness::Timeout => {
                // The remote process may still be alive; it is out of our hands.
                self.abandon_locked(slot, username).await;
                Err(RotorError::Timeout(format!(
                    "workload on '{username}' not ready within {}s",
                    self.settings.readiness_max_wait.as_secs()
                )))
            }
        }
    }

    /// Fire-and-forget: the run command lives as long as the workload does.
    fn launch_run(&self, gpu: &str) {
        let runner = Arc::clone(&self.runner);
        let command = PlatformCommand::Run {
            file: self.settings.run_file.clone(),
            gpu: Some(gpu.to_string()),
        };
        let timeout = self.settings.run_timeout;
        tokio::spawn(async move {
            match runner.run(&command, timeout).await {
                Ok(output) if output.success() => info!(command = %command, "Run command exited."),
                Ok(output) => {
                    warn!(command = %command, detail = %output.failure_detail(), "Run command ended unsuccessfully.")
                }
                Err(e) => error!(command = %command, error = %e, "Run command could not be executed."),
            }
        });
    }

    /// Stops the workload. The record is cleared even when the remote stop fails.
    pub async fn stop(&self) -> Result<()> {
        let mut slot = self.slot.lock().await;
        self.stop_locked(&mut slot, true).await?;
        Ok(())
    }

    /// Stops whatever the store still has bound, for a process that never started the
    /// workload itself. Returns the username the stop was issued for.
    pub async fn stop_bound_account(&self) -> Result<Option<String>> {
        let mut slot = self.slot.lock().await;
        if let Some(record) = self.stop_locked(&mut slot, true).await? {
            return Ok(Some(record.username));
        }

        let Some(account) = self.store.bound_account().await? else {
            info!("No account is bound; nothing to stop.");
            return Ok(None);
        };
        if self.app_stop_on(&account.username).await {
            self.store.release(&account.username).await?;
        }
        Ok(Some(account.username))
    }

    /// `release` hands the account back to the pool; switching keeps it bound until
    /// the new profile is in place.
    async fn stop_locked(
        &self,
        slot: &mut WorkloadSlot,
        release: bool,
    ) -> Result<Option<DeploymentRecord>> {
        let Some(record) = slot.record.take() else {
            return Ok(None);
        };
        slot.state = WorkloadState::Stopping;
        self.publish(slot);

        let on_profile = self.app_stop_on(&record.username).await;

        slot.state = WorkloadState::Idle;
        self.publish(slot);
        // An account whose profile could not be reached may still be running.
        if release && on_profile {
            self.store.release(&record.username).await?;
        }
        Ok(Some(record))
    }

    /// Issues the app stop under `username`'s profile. Returns false when the profile
    /// could not be made current, in which case nothing was sent.
    async fn app_stop_on(&self, username: &str) -> bool {
        let switched = match self.store.credentials(username).await {
            Ok(credentials) => self.profiles.switch_to(username, &credentials).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = switched {
            error!(username = %username, error = %e, "Cannot reach the workload's profile; stop not sent.");
            return false;
        }

        let command = PlatformCommand::AppStop {
            name: self.settings.app_name.clone(),
        };
        match self.runner.run(&command, self.settings.command_timeout).await {
            Ok(output) if output.success() => info!(username = %username, "Workload stopped."),
            Ok(output) => warn!(
                username = %username,
                detail = %output.failure_detail(),
                "Stop command failed; clearing the deployment anyway."
            ),
            Err(e) => warn!(
                username = %username,
                error = %e,
                "Stop command could not run; clearing the deployment anyway."
            ),
        }
        true
    }

    /// Keeps a workload running somewhere, moving it off an exhausted account.
    pub async fn ensure_running(&self, gpu: Option<&str>) -> Result<DeploymentRecord> {
        let mut slot = self.slot.lock().await;

        if let Some(record) = slot.record.clone() {
            match self.check_locked(&mut slot, &record.username).await {
                Ok(Some(balance)) if balance < self.threshold() => {
                    warn!(username = %record.username, balance, "Running account is exhausted; relocating.");
                }
                Ok(_) => return Ok(record),
                Err(e) if e.is_account_scoped() => {
                    warn!(username = %record.username, error = %e, "Balance check failed; keeping the workload.");
                    return Ok(record);
                }
                Err(e) => return Err(e),
            }
            let gpu = gpu.map(str::to_string).unwrap_or(record.gpu);
            return self.failover_start_locked(&mut slot, Some(&gpu)).await;
        }

        self.failover_start_locked(&mut slot, gpu).await
    }

    async fn failover_start_locked(
        &self,
        slot: &mut WorkloadSlot,
        gpu: Option<&str>,
    ) -> Result<DeploymentRecord> {
        self.refresh_unchecked_locked(slot).await?;
        let threshold = self.threshold();
        let mut tried = BTreeSet::new();
        loop {
            let Some(candidate) = self.store.next_available(threshold, &tried).await? else {
                warn!(tried = tried.len(), "No account could run the workload.");
                return Err(RotorError::NoAvailableAccount);
            };
            match self.start_locked(slot, &candidate.username, gpu).await {
                Ok(record) => return Ok(record),
                Err(e) if e.is_account_scoped() => {
                    warn!(username = %candidate.username, error = %e, "Start failed; trying the next account.");
                    tried.insert(candidate.username);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Re-checks the bound account and moves away from it once it is dead. Returns
    /// the newly bound username when a rotation happened.
    pub async fn rotate_if_exhausted(&self) -> Result<Option<String>> {
        let mut slot = self.slot.lock().await;

        let Some(username) = self.bound_username(&slot).await? else {
            return Ok(None);
        };
        self.check_locked(&mut slot, &username).await?;
        if self.store.get(&username).await?.status != AccountStatus::Dead {
            return Ok(None);
        }

        warn!(username = %username, "Bound account is out of credit; rotating.");
        let next = match slot.record.as_ref().map(|record| record.gpu.clone()) {
            Some(gpu) => {
                self.failover_start_locked(&mut slot, Some(&gpu))
                    .await?
                    .username
            }
            None => self.switch_next_locked(&mut slot).await?.username,
        };
        Ok((next != username).then_some(next))
    }

    // --- Balances ---

    pub async fn check_balance(&self, username: &str) -> Result<Option<f64>> {
        let mut slot = self.slot.lock().await;
        self.check_locked(&mut slot, username).await
    }

    /// Re-checks every account. The bound profile is restored afterwards; failing to
    /// restore it is an error even when every check succeeded.
    pub async fn check_all_balances(&self) -> Result<BTreeMap<String, f64>> {
        let slot = self.slot.lock().await;
        let balances = self.monitor.check_all_balances().await;
        let rebound = self.rebind_locked(&slot, None).await;
        let balances = balances?;
        rebound?;
        Ok(balances)
    }

    async fn check_locked(&self, slot: &mut WorkloadSlot, username: &str) -> Result<Option<f64>> {
        let balance = self.monitor.check_balance(username).await;
        let rebound = self.rebind_locked(slot, Some(username)).await;
        let balance = balance?;
        rebound?;
        Ok(balance)
    }

    /// Accounts added but never checked sit at balance 0; read them before a
    /// candidate is picked.
    async fn refresh_unchecked_locked(&self, slot: &WorkloadSlot) -> Result<()> {
        let unchecked: Vec<String> = self
            .store
            .list_all()
            .await?
            .into_iter()
            .filter(|account| account.last_checked.is_none())
            .map(|account| account.username)
            .collect();
        if unchecked.is_empty() {
            return Ok(());
        }

        info!(count = unchecked.len(), "Checking balances of new accounts.");
        for username in &unchecked {
            if let Err(e) = self.monitor.check_balance(username).await {
                warn!(username = %username, error = %e, "Balance check failed; account stays dead.");
            }
        }
        self.rebind_locked(slot, None).await
    }

    async fn bound_username(&self, slot: &WorkloadSlot) -> Result<Option<String>> {
        if let Some(record) = &slot.record {
            return Ok(Some(record.username.clone()));
        }
        Ok(self.store.bound_account().await?.map(|a| a.username))
    }

    /// Balance checks leave the checked profile current; put the bound one back.
    async fn rebind_locked(&self, slot: &WorkloadSlot, current: Option<&str>) -> Result<()> {
        let Some(bound) = self.bound_username(slot).await? else {
            return Ok(());
        };
        if current == Some(bound.as_str()) {
            return Ok(());
        }

        let credentials = self.store.credentials(&bound).await?;
        if let Err(e) = self.profiles.switch_to(&bound, &credentials).await {
            error!(username = %bound, error = %e, "Failed to restore the bound profile.");
            return Err(e);
        }
        Ok(())
    }

    // --- Volume ---

    pub async fn list_workflows(&self) -> Result<Vec<String>> {
        let _slot = self.slot.lock().await;
        self.volume.list_workflows().await
    }

    pub async fn list_outputs(&self) -> Result<Vec<String>> {
        let _slot = self.slot.lock().await;
        self.volume.list_outputs().await
    }

    pub async fn fetch_workflow(&self, name: &str) -> Result<serde_json::Value> {
        let _slot = self.slot.lock().await;
        self.volume.fetch_workflow(name).await
    }

    pub async fn fetch_output(&self, name: &str) -> Result<PathBuf> {
        let _slot = self.slot.lock().await;
        self.volume.fetch_output(name).await
    }
}
