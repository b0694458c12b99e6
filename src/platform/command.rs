use std::fmt;
use std::path::PathBuf;

/// Environment variable through which the run command receives its GPU class.
pub const GPU_ENV_VAR: &str = "GPU_TYPE";

/// The fixed set of platform CLI invocations the rotor performs.
///
/// Arguments are passed to the process as separate argv entries, never through a shell.
#[derive(Clone, PartialEq, Eq)]
pub enum PlatformCommand {
    ProfileCreate { name: String },
    ProfileActivate { name: String },
    ProfileList,
    ProfileCurrent,
    TokenSet { token_id: String, token_secret: String },
    AppStop { name: String },
    Deploy { file: PathBuf },
    Run { file: PathBuf, gpu: Option<String> },
    VolumeList { volume: String, path: String },
    VolumeGet { volume: String, remote: String, local: String },
}

impl PlatformCommand {
    pub fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        let mut push = |parts: &[&str]| args.extend(parts.iter().map(|p| p.to_string()));
        match self {
            PlatformCommand::ProfileCreate { name } => push(&["profile", "create", name]),
            PlatformCommand::ProfileActivate { name } => push(&["profile", "activate", name]),
            PlatformCommand::ProfileList => push(&["profile", "list"]),
            PlatformCommand::ProfileCurrent => push(&["profile", "current"]),
            PlatformCommand::TokenSet {
                token_id,
                token_secret,
            } => push(&["token", "set", token_id, token_secret]),
            PlatformCommand::AppStop { name } => push(&["app", "stop", name]),
            PlatformCommand::Deploy { file } => push(&["deploy", &file.to_string_lossy()]),
            PlatformCommand::Run { file, .. } => push(&["run", &file.to_string_lossy()]),
            PlatformCommand::VolumeList { volume, path } => push(&["volume", "ls", volume, path]),
            PlatformCommand::VolumeGet {
                volume,
                remote,
                local,
            } => push(&["volume", "get", volume, remote, local]),
        }
        args
    }

    /// Extra environment for the child process.
    pub fn envs(&self) -> Vec<(&'static str, String)> {
        match self {
            PlatformCommand::Run { gpu: Some(gpu), .. } => vec![(GPU_ENV_VAR, gpu.clone())],
            _ => Vec::new(),
        }
    }
}

// Display doubles as the log representation, so token values are masked.
impl fmt::Display for PlatformCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformCommand::TokenSet { .. } => f.write_str("token set *** ***"),
            other => f.write_str(&other.args().join(" ")),
        }
    }
}

impl fmt::Debug for PlatformCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PlatformCommand({self})")
    }
}
