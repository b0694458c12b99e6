//! In-process doubles for the platform CLI, the readiness endpoint and the database.
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use crate::db;
use crate::db::services::account_service::AccountStore;
use crate::error::Result;
use crate::monitor::balance::BalanceMonitor;
use crate::monitor::readiness::ReadinessProbe;
use crate::orchestrator::{DeploymentSettings, Orchestrator};
use crate::platform::command::PlatformCommand;
use crate::platform::profile::{Credentials, ProfileSwitcher};
use crate::platform::runner::{CommandExit, CommandOutput, CommandRunner};
use crate::platform::volume::{VolumeBrowser, VolumeLayout};
use crate::services::encryption_service::EncryptionService;

pub const TEST_KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";
pub const BALANCE_FILE: &str = "balance.json";
pub const THRESHOLD: f64 = 1.0;

pub async fn memory_store() -> AccountStore {
    let db = db::connect("sqlite::memory:").await.unwrap();
    let vault = Arc::new(EncryptionService::from_secret(TEST_KEY).unwrap());
    AccountStore::new(db, vault)
}

#[derive(Default)]
struct PlatformState {
    profiles: BTreeSet<String>,
    current: Option<String>,
    tokens: HashMap<String, Credentials>,
    artifacts: HashMap<String, String>,
    failures: Vec<(String, i32, String)>,
    timeouts: Vec<String>,
    calls: Vec<String>,
    listings: HashMap<String, Vec<String>>,
    files: HashMap<String, String>,
}

/// Simulates the platform CLI: profiles, the current profile, per-profile balance
/// artifacts and a volume. Commands can be scripted to fail or time out by the prefix
/// of their display form.
#[derive(Default)]
pub struct FakePlatform {
    state: Mutex<PlatformState>,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_profile(&self, name: &str) {
        self.state.lock().unwrap().profiles.insert(name.to_string());
    }

    pub fn set_balance(&self, profile: &str, balance: f64) {
        self.set_artifact(profile, &balance.to_string());
    }

    pub fn set_artifact(&self, profile: &str, contents: &str) {
        self.state
            .lock()
            .unwrap()
            .artifacts
            .insert(profile.to_string(), contents.to_string());
    }

    pub fn fail(&self, prefix: &str, code: i32, stderr: &str) {
        self.state
            .lock()
            .unwrap()
            .failures
            .push((prefix.to_string(), code, stderr.to_string()));
    }

    pub fn time_out(&self, prefix: &str) {
        self.state.lock().unwrap().timeouts.push(prefix.to_string());
    }

    pub fn set_listing(&self, path: &str, entries: &[&str]) {
        self.state.lock().unwrap().listings.insert(
            path.to_string(),
            entries.iter().map(|e| e.to_string()).collect(),
        );
    }

    pub fn set_file(&self, remote: &str, contents: &str) {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(remote.to_string(), contents.to_string());
    }

    pub fn tokens_for(&self, profile: &str) -> Option<Credentials> {
        self.state.lock().unwrap().tokens.get(profile).cloned()
    }

    pub fn current(&self) -> Option<String> {
        self.state.lock().unwrap().current.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    /// Profile names passed to `profile activate`, in order.
    pub fn activations(&self) -> Vec<String> {
        self.calls()
            .iter()
            .filter_map(|c| c.strip_prefix("profile activate "))
            .map(str::to_string)
            .collect()
    }

    fn execute(state: &mut PlatformState, command: &PlatformCommand) -> (i32, String, String) {
        let ok = |stdout: String| (0, stdout, String::new());
        let fail = |stderr: &str| (1, String::new(), stderr.to_string());
        match command {
            PlatformCommand::ProfileCreate { name } => {
                if state.profiles.insert(name.clone()) {
                    ok(String::new())
                } else {
                    fail("profile already exists")
                }
            }
            PlatformCommand::ProfileActivate { name } => {
                if state.profiles.contains(name) {
                    state.current = Some(name.clone());
                    ok(String::new())
                } else {
                    fail("no such profile")
                }
            }
            PlatformCommand::ProfileList => {
                ok(state.profiles.iter().cloned().collect::<Vec<_>>().join("\n"))
            }
            PlatformCommand::ProfileCurrent => ok(state.current.clone().unwrap_or_default()),
            PlatformCommand::TokenSet {
                token_id,
                token_secret,
            } => match state.current.clone() {
                Some(profile) => {
                    state.tokens.insert(
                        profile,
                        Credentials {
                            token_id: token_id.clone(),
                            token_secret: token_secret.clone(),
                        },
                    );
                    ok(String::new())
                }
                None => fail("no current profile"),
            },
            PlatformCommand::AppStop { .. }
            | PlatformCommand::Deploy { .. }
            | PlatformCommand::Run { .. } => ok(String::new()),
            PlatformCommand::VolumeList { path, .. } => match state.listings.get(path) {
                Some(entries) => ok(entries.join("\n")),
                None => fail("path not found"),
            },
            PlatformCommand::VolumeGet { remote, local, .. } => {
                let contents = if remote == BALANCE_FILE {
                    state
                        .current
                        .as_ref()
                        .and_then(|profile| state.artifacts.get(profile))
                        .cloned()
                } else {
                    state.files.get(remote).cloned()
                };
                match contents {
                    Some(contents) if local == "-" => ok(contents),
                    Some(contents) => match std::fs::write(PathBuf::from(local), contents) {
                        Ok(()) => ok(String::new()),
                        Err(e) => fail(&e.to_string()),
                    },
                    None => fail("file not found"),
                }
            }
        }
    }
}

#[async_trait]
impl CommandRunner for FakePlatform {
    async fn run(&self, command: &PlatformCommand, _timeout: Duration) -> Result<CommandOutput> {
        let mut state = self.state.lock().unwrap();
        let shown = command.to_string();
        state.calls.push(shown.clone());

        if state.timeouts.iter().any(|p| shown.starts_with(p.as_str())) {
            return Ok(CommandOutput {
                exit: CommandExit::Timeout,
                stdout: String::new(),
                stderr: String::new(),
            });
        }
        if let Some((_, code, stderr)) = state
            .failures
            .iter()
            .find(|(p, _, _)| shown.starts_with(p.as_str()))
        {
            return Ok(CommandOutput {
                exit: CommandExit::Code(*code),
                stdout: String::new(),
                stderr: stderr.clone(),
            });
        }

        let (code, stdout, stderr) = Self::execute(&mut state, command);
        Ok(CommandOutput {
            exit: CommandExit::Code(code),
            stdout,
            stderr,
        })
    }
}

/// Readiness probe that answers `true` from the n-th poll on.
pub struct ScriptedProbe {
    ready_from: usize,
    polls: AtomicUsize,
}

impl ScriptedProbe {
    pub fn ready_after(polls: usize) -> Self {
        Self {
            ready_from: polls,
            polls: AtomicUsize::new(0),
        }
    }

    pub fn never() -> Self {
        Self::ready_after(usize::MAX)
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReadinessProbe for ScriptedProbe {
    async fn is_ready(&self) -> bool {
        let poll = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        poll >= self.ready_from
    }
}

pub fn fast_settings() -> DeploymentSettings {
    DeploymentSettings {
        app_name: "comfyui".to_string(),
        default_gpu: "H100".to_string(),
        phase1_file: PathBuf::from("deploy/phase1.py"),
        phase2_file: PathBuf::from("deploy/phase2.py"),
        run_file: PathBuf::from("deploy/run.py"),
        phase1_timeout: Duration::from_secs(5),
        phase2_timeout: Duration::from_secs(5),
        run_timeout: Duration::from_secs(5),
        command_timeout: Duration::from_secs(5),
        readiness_max_wait: Duration::from_millis(50),
        readiness_interval: Duration::from_millis(5),
        startup_grace: Duration::ZERO,
    }
}

/// Everything wired against one [`FakePlatform`] and an in-memory store.
pub struct TestRig {
    pub platform: Arc<FakePlatform>,
    pub store: AccountStore,
    pub profiles: ProfileSwitcher,
    pub volume: VolumeBrowser,
    pub monitor: BalanceMonitor,
    _downloads: TempDir,
}

impl TestRig {
    pub async fn new() -> Self {
        let platform = Arc::new(FakePlatform::new());
        let store = memory_store().await;
        let downloads = tempfile::tempdir().unwrap();
        let runner: Arc<dyn CommandRunner> = platform.clone();
        let profiles = ProfileSwitcher::new(runner.clone(), Duration::from_secs(5));
        let volume = VolumeBrowser::new(
            runner,
            VolumeLayout {
                volume: "workspace".to_string(),
                workflows_path: "ComfyUI/user/default/workflows".to_string(),
                outputs_path: "ComfyUI/output".to_string(),
                download_dir: downloads.path().to_path_buf(),
            },
            Duration::from_secs(5),
        );
        let monitor = BalanceMonitor::new(
            store.clone(),
            profiles.clone(),
            volume.clone(),
            BALANCE_FILE,
            THRESHOLD,
        );
        Self {
            platform,
            store,
            profiles,
            volume,
            monitor,
            _downloads: downloads,
        }
    }

    /// Adds an account with `balance` already stored. The platform side has no
    /// balance artifact until one is set.
    pub async fn add_account(&self, username: &str, balance: f64) {
        self.store
            .create_account(username, &format!("ak-{username}"), &format!("as-{username}"))
            .await
            .unwrap();
        self.store
            .set_balance(username, balance, THRESHOLD)
            .await
            .unwrap();
    }

    pub fn orchestrator(&self, probe: ScriptedProbe) -> Orchestrator {
        Orchestrator::new(
            self.store.clone(),
            self.platform.clone(),
            self.profiles.clone(),
            self.monitor.clone(),
            self.volume.clone(),
            Arc::new(probe),
            fast_settings(),
        )
    }
}
