use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use super::command::PlatformCommand;
use super::runner::{CommandExit, CommandOutput, CommandRunner};
use crate::error::{Result, RotorError};

/// Decrypted platform tokens for one account.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token_id: String,
    pub token_secret: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credentials { token_id: ***, token_secret: *** }")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchOutcome {
    /// The profile was already the current one; nothing was run.
    AlreadyCurrent,
    Activated,
    Created,
}

/// Maps accounts onto named authentication profiles of the platform CLI. The
/// username doubles as the profile name.
#[derive(Clone)]
pub struct ProfileSwitcher {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl ProfileSwitcher {
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    async fn run(&self, command: PlatformCommand) -> Result<CommandOutput> {
        let output = self.runner.run(&command, self.timeout).await?;
        match output.exit {
            CommandExit::Code(0) => Ok(output),
            CommandExit::Timeout => Err(RotorError::Timeout(format!("'{command}'"))),
            CommandExit::Code(_) => {
                let detail = output.failure_detail();
                error!(command = %command, stderr = %detail, "Profile command failed.");
                Err(RotorError::Profile(format!("'{command}' failed: {detail}")))
            }
        }
    }

    pub async fn list_profiles(&self) -> Result<BTreeSet<String>> {
        let output = self.run(PlatformCommand::ProfileList).await?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    pub async fn create_profile(&self, name: &str) -> Result<()> {
        self.run(PlatformCommand::ProfileCreate {
            name: name.to_string(),
        })
        .await?;
        info!(profile = %name, "Profile created.");
        Ok(())
    }

    pub async fn activate_profile(&self, name: &str) -> Result<()> {
        self.run(PlatformCommand::ProfileActivate {
            name: name.to_string(),
        })
        .await?;
        info!(profile = %name, "Profile activated.");
        Ok(())
    }

    pub async fn current_profile(&self) -> Result<Option<String>> {
        let output = self.run(PlatformCommand::ProfileCurrent).await?;
        let name = output.stdout.trim();
        Ok((!name.is_empty()).then(|| name.to_string()))
    }

    /// Stores tokens into the currently active profile.
    async fn set_tokens(&self, credentials: &Credentials) -> Result<()> {
        self.run(PlatformCommand::TokenSet {
            token_id: credentials.token_id.clone(),
            token_secret: credentials.token_secret.clone(),
        })
        .await?;
        Ok(())
    }

    /// Makes `username` the current profile, creating it from `credentials` when the
    /// platform does not know it yet. A second call for the same username runs only
    /// the `profile current` check.
    pub async fn switch_to(&self, username: &str, credentials: &Credentials) -> Result<SwitchOutcome> {
        match self.current_profile().await {
            Ok(Some(current)) if current == username => return Ok(SwitchOutcome::AlreadyCurrent),
            Ok(_) => {}
            // A platform without a configured profile fails this check; treat it as unknown.
            Err(e) => debug!(error = %e, "Current profile unknown."),
        }

        if self.list_profiles().await?.contains(username) {
            self.activate_profile(username).await?;
            return Ok(SwitchOutcome::Activated);
        }

        info!(profile = %username, "Profile does not exist yet; creating it.");
        self.create_profile(username).await?;
        self.activate_profile(username).await?;
        self.set_tokens(credentials).await?;
        Ok(SwitchOutcome::Created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakePlatform;

    fn creds() -> Credentials {
        Credentials {
            token_id: "ak-1".to_string(),
            token_secret: "as-1".to_string(),
        }
    }

    fn switcher(platform: &Arc<FakePlatform>) -> ProfileSwitcher {
        ProfileSwitcher::new(platform.clone(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_switch_creates_missing_profile_with_tokens() {
        let platform = Arc::new(FakePlatform::new());
        let profiles = switcher(&platform);

        let outcome = profiles.switch_to("alice", &creds()).await.unwrap();

        assert_eq!(outcome, SwitchOutcome::Created);
        assert_eq!(profiles.current_profile().await.unwrap().as_deref(), Some("alice"));
        assert_eq!(platform.tokens_for("alice"), Some(creds()));
        assert_eq!(platform.count("profile create"), 1);
    }

    #[tokio::test]
    async fn test_switch_is_idempotent() {
        let platform = Arc::new(FakePlatform::new());
        let profiles = switcher(&platform);

        profiles.switch_to("alice", &creds()).await.unwrap();
        let second = profiles.switch_to("alice", &creds()).await.unwrap();

        assert_eq!(second, SwitchOutcome::AlreadyCurrent);
        assert_eq!(platform.count("profile create"), 1);
        assert_eq!(platform.count("profile activate"), 1);
    }

    #[tokio::test]
    async fn test_switch_activates_existing_profile() {
        let platform = Arc::new(FakePlatform::new());
        platform.add_profile("bob");
        let profiles = switcher(&platform);

        let outcome = profiles.switch_to("bob", &creds()).await.unwrap();

        assert_eq!(outcome, SwitchOutcome::Activated);
        assert_eq!(platform.count("profile create"), 0);
        assert_eq!(platform.count("token set"), 0);
    }

    #[tokio::test]
    async fn test_non_zero_exit_surfaces_stderr() {
        let platform = Arc::new(FakePlatform::new());
        platform.fail("profile create", 1, "quota exceeded");
        let profiles = switcher(&platform);

        let err = profiles.switch_to("carol", &creds()).await.unwrap_err();
        match err {
            RotorError::Profile(message) => assert!(message.contains("quota exceeded")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(profiles.current_profile().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failing_current_check_falls_through_to_activate() {
        let platform = Arc::new(FakePlatform::new());
        platform.add_profile("alice");
        platform.fail("profile current", 1, "no profile is configured");
        let profiles = switcher(&platform);

        let outcome = profiles.switch_to("alice", &creds()).await.unwrap();

        assert_eq!(outcome, SwitchOutcome::Activated);
        assert_eq!(platform.current().as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_fresh_platform_without_current_profile_is_bootstrapped() {
        let platform = Arc::new(FakePlatform::new());
        platform.fail("profile current", 1, "no profile is configured");
        let profiles = switcher(&platform);

        let outcome = profiles.switch_to("alice", &creds()).await.unwrap();

        assert_eq!(outcome, SwitchOutcome::Created);
        assert_eq!(platform.tokens_for("alice"), Some(creds()));
    }

    #[tokio::test]
    async fn test_list_profiles_parses_lines() {
        let platform = Arc::new(FakePlatform::new());
        platform.add_profile("alice");
        platform.add_profile("bob");
        let profiles = switcher(&platform);

        let listed = profiles.list_profiles().await.unwrap();
        assert_eq!(
            listed,
            BTreeSet::from(["alice".to_string(), "bob".to_string()])
        );
    }
}
