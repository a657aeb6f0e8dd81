//! Local execution engine.
//!
//! Runs one pushed command against its input and returns captured stdout,
//! or handles the `cd` built-in. The engine owns the agent's working
//! directory instead of relying on the process-wide one, so every command
//! it launches sees the directory set by earlier `cd` requests.

mod process;

use std::ffi::OsStr;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use nix::unistd::{AccessFlags, access};
use tokio_util::sync::CancellationToken;

use crate::bridge::MAX_PAYLOAD_LEN;

pub use process::{RunningCommand, ShellSpawner, SpawnError, Spawner, StderrMode};

const CD_PREFIX: &[u8] = b"cd ";

/// Execution failures. All of them are fatal to the agent.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("command output exceeds the {limit} byte frame limit")]
    OutputTooLarge { limit: usize },

    #[error("i/o error while running command: {0}")]
    Io(#[from] io::Error),

    #[error("command cancelled")]
    Cancelled,
}

/// The directory pushed commands run in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingDir(PathBuf);

impl WorkingDir {
    /// Use `path` as-is. Callers are expected to pass an existing directory.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    /// The directory the agent process was launched in.
    pub fn current() -> io::Result<Self> {
        std::env::current_dir().map(Self)
    }

    /// Resolve `path` to an existing directory.
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let resolved = resolve_dir(path.as_ref()).await?;
        Ok(Self(resolved))
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    /// Move to `target`, relative to the current directory unless absolute.
    /// On error the directory is unchanged.
    pub async fn change_to(&mut self, target: &Path) -> io::Result<()> {
        let resolved = resolve_dir(&self.0.join(target)).await?;
        self.0 = resolved;
        Ok(())
    }

    /// Whether commands can still be started here. A directory can vanish
    /// or lose its search permission after it was entered.
    pub fn is_enterable(&self) -> bool {
        self.0.is_dir() && check_enterable(&self.0).is_ok()
    }

    /// Fall back to the closest ancestor that can still be entered.
    fn retreat(&mut self) {
        let fallback = self
            .0
            .ancestors()
            .skip(1)
            .find(|dir| dir.is_dir() && check_enterable(dir).is_ok())
            .map_or_else(|| PathBuf::from("/"), Path::to_path_buf);
        self.0 = fallback;
    }
}

async fn resolve_dir(path: &Path) -> io::Result<PathBuf> {
    let resolved = tokio::fs::canonicalize(path).await?;
    if !tokio::fs::metadata(&resolved).await?.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotADirectory,
            format!("{} is not a directory", resolved.display()),
        ));
    }
    check_enterable(&resolved)?;
    Ok(resolved)
}

/// Search permission is what `chdir` needs.
fn check_enterable(dir: &Path) -> io::Result<()> {
    access(dir, AccessFlags::X_OK).map_err(io::Error::from)
}

/// How a command line is carried out.
#[derive(Debug, PartialEq, Eq)]
enum Invocation<'a> {
    ChangeDir(&'a Path),
    Shell(&'a OsStr),
}

impl<'a> Invocation<'a> {
    /// `cd ` is matched as a literal byte prefix; everything after it is the path.
    fn parse(command: &'a [u8]) -> Self {
        match command.strip_prefix(CD_PREFIX) {
            Some(path) => Self::ChangeDir(Path::new(OsStr::from_bytes(path))),
            None => Self::Shell(OsStr::from_bytes(command)),
        }
    }
}

pub struct ExecutionEngine {
    cwd: WorkingDir,
    spawner: Arc<dyn Spawner>,
    output_limit: usize,
}

impl ExecutionEngine {
    pub fn new(cwd: WorkingDir) -> Self {
        Self {
            cwd,
            spawner: Arc::new(ShellSpawner::default()),
            output_limit: MAX_PAYLOAD_LEN,
        }
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn Spawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn cwd(&self) -> &Path {
        self.cwd.path()
    }

    /// Execute `command` with `input` as its entire stdin.
    ///
    /// Returns captured stdout, or an empty result for `cd`. A failed `cd`
    /// is logged and otherwise ignored. If the working directory became
    /// unusable since it was entered, the command is not run: the engine
    /// falls back to the nearest usable ancestor and returns empty output.
    pub async fn execute(
        &mut self,
        input: Bytes,
        command: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Bytes, ExecError> {
        match Invocation::parse(command) {
            Invocation::ChangeDir(target) => {
                match self.cwd.change_to(target).await {
                    Ok(()) => {
                        tracing::info!(cwd = %self.cwd.path().display(), "Changed directory");
                    }
                    Err(e) => {
                        tracing::warn!(
                            path = %target.display(),
                            error = %e,
                            "Couldn't change directory"
                        );
                    }
                }
                Ok(Bytes::new())
            }
            Invocation::Shell(line) => {
                let child = match self.spawner.spawn(line, self.cwd.path()) {
                    Ok(child) => child,
                    Err(e) if !self.cwd.is_enterable() => {
                        let stale = self.cwd.path().to_path_buf();
                        self.cwd.retreat();
                        tracing::warn!(
                            stale = %stale.display(),
                            cwd = %self.cwd.path().display(),
                            error = %e,
                            "Working directory is no longer usable, falling back"
                        );
                        return Ok(Bytes::new());
                    }
                    Err(e) => return Err(e.into()),
                };
                let running = RunningCommand::new(child);
                tracing::debug!(
                    pid = ?running.id(),
                    command = %line.to_string_lossy(),
                    input_len = input.len(),
                    "Spawned command"
                );
                let output = running.run(input, self.output_limit, cancel).await?;
                tracing::debug!(output_len = output.len(), "Command output collected");
                Ok(output)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use tokio::process::Child;

    async fn engine_in_tempdir() -> (tempfile::TempDir, ExecutionEngine) {
        let dir = tempfile::tempdir().unwrap();
        let cwd = WorkingDir::open(dir.path()).await.unwrap();
        (dir, ExecutionEngine::new(cwd))
    }

    #[test]
    fn parse_recognizes_cd_prefix_only() {
        assert_eq!(
            Invocation::parse(b"cd /tmp"),
            Invocation::ChangeDir(Path::new("/tmp"))
        );
        assert_eq!(Invocation::parse(b"cd"), Invocation::Shell(OsStr::new("cd")));
        assert_eq!(
            Invocation::parse(b"echo cd /tmp"),
            Invocation::Shell(OsStr::new("echo cd /tmp"))
        );
        assert_eq!(
            Invocation::parse(b"cdrecord x"),
            Invocation::Shell(OsStr::new("cdrecord x"))
        );
    }

    #[tokio::test]
    async fn cat_echoes_input() {
        let (_dir, mut engine) = engine_in_tempdir().await;
        let out = engine
            .execute(Bytes::from_static(b"hello\n"), b"cat", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(&out[..], b"hello\n");
    }

    #[tokio::test]
    async fn silent_command_returns_empty_output() {
        let (_dir, mut engine) = engine_in_tempdir().await;
        let out = engine
            .execute(Bytes::new(), b"true", &CancellationToken::new())
            .await
            .unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn stderr_is_not_captured() {
        let (_dir, mut engine) = engine_in_tempdir().await;
        let out = engine
            .execute(
                Bytes::new(),
                b"echo out; echo err >&2",
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(&out[..], b"out\n");
    }

    #[tokio::test]
    async fn cd_to_missing_dir_is_swallowed() {
        let (_dir, mut engine) = engine_in_tempdir().await;
        let before = engine.cwd().to_path_buf();

        let out = engine
            .execute(Bytes::new(), b"cd /does/not/exist", &CancellationToken::new())
            .await
            .unwrap();

        assert!(out.is_empty());
        assert_eq!(engine.cwd(), before);
    }

    #[tokio::test]
    async fn cd_to_a_file_is_swallowed() {
        let (dir, mut engine) = engine_in_tempdir().await;
        std::fs::write(dir.path().join("plain"), "x").unwrap();
        let before = engine.cwd().to_path_buf();

        let out = engine
            .execute(Bytes::new(), b"cd plain", &CancellationToken::new())
            .await
            .unwrap();

        assert!(out.is_empty());
        assert_eq!(engine.cwd(), before);
    }

    #[tokio::test]
    async fn cd_then_pwd_reports_new_dir() {
        let (_dir, mut engine) = engine_in_tempdir().await;
        let target = tempfile::tempdir().unwrap();
        let expected = target.path().canonicalize().unwrap();
        let cancel = CancellationToken::new();

        let cd = format!("cd {}", target.path().display());
        let out = engine
            .execute(Bytes::new(), cd.as_bytes(), &cancel)
            .await
            .unwrap();
        assert!(out.is_empty());

        let out = engine.execute(Bytes::new(), b"pwd", &cancel).await.unwrap();
        assert_eq!(out, format!("{}\n", expected.display()).as_bytes());
    }

    #[tokio::test]
    async fn relative_cd_resolves_against_working_dir() {
        let (dir, mut engine) = engine_in_tempdir().await;
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        let cancel = CancellationToken::new();

        engine
            .execute(Bytes::new(), b"cd nested", &cancel)
            .await
            .unwrap();
        assert_eq!(
            engine.cwd(),
            dir.path().canonicalize().unwrap().join("nested")
        );

        engine.execute(Bytes::new(), b"cd ..", &cancel).await.unwrap();
        assert_eq!(engine.cwd(), dir.path().canonicalize().unwrap());
    }

    #[tokio::test]
    async fn oversized_output_is_fatal() {
        let (_dir, mut engine) = engine_in_tempdir().await;
        let err = engine
            .execute(
                Bytes::new(),
                b"head -c 100000 /dev/zero",
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"command output exceeds the 99999 byte frame limit");
    }

    #[tokio::test]
    async fn cd_without_search_permission_is_swallowed() {
        use std::os::unix::fs::PermissionsExt;

        let (dir, mut engine) = engine_in_tempdir().await;
        let locked = dir.path().join("locked");
        std::fs::create_dir(&locked).unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o600)).unwrap();
        if access(&locked, AccessFlags::X_OK).is_ok() {
            // Running as root: permission bits are not enforced.
            return;
        }
        let before = engine.cwd().to_path_buf();
        let cancel = CancellationToken::new();

        let out = engine
            .execute(Bytes::new(), b"cd locked", &cancel)
            .await
            .unwrap();
        assert!(out.is_empty());
        assert_eq!(engine.cwd(), before);

        let out = engine
            .execute(Bytes::new(), b"echo alive", &cancel)
            .await
            .unwrap();
        assert_eq!(&out[..], b"alive\n");

        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o700)).unwrap();
    }

    #[tokio::test]
    async fn removed_working_dir_falls_back_to_parent() {
        let (dir, mut engine) = engine_in_tempdir().await;
        let parent = dir.path().canonicalize().unwrap();
        std::fs::create_dir(parent.join("doomed")).unwrap();
        let cancel = CancellationToken::new();

        engine
            .execute(Bytes::new(), b"cd doomed", &cancel)
            .await
            .unwrap();
        assert_eq!(engine.cwd(), parent.join("doomed"));
        std::fs::remove_dir(parent.join("doomed")).unwrap();

        let out = engine
            .execute(Bytes::new(), b"echo still-alive", &cancel)
            .await
            .unwrap();
        assert!(out.is_empty());
        assert_eq!(engine.cwd(), parent);

        let out = engine
            .execute(Bytes::new(), b"echo still-alive", &cancel)
            .await
            .unwrap();
        assert_eq!(&out[..], b"still-alive\n");
    }

    struct FailingSpawner;

    impl Spawner for FailingSpawner {
        fn spawn(&self, _command: &OsStr, _cwd: &Path) -> Result<Child, SpawnError> {
            Err(SpawnError::Spawn(io::Error::other("no processes left")))
        }
    }

    #[tokio::test]
    async fn spawn_failure_is_returned() {
        let (_dir, engine) = engine_in_tempdir().await;
        let mut engine = engine.with_spawner(Arc::new(FailingSpawner));
        let err = engine
            .execute(Bytes::new(), b"ls", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Spawn(SpawnError::Spawn(_))));
    }

    /// Records command lines, then runs them through the real shell.
    #[derive(Default)]
    struct RecordingSpawner {
        seen: Mutex<Vec<(String, PathBuf)>>,
    }

    impl Spawner for RecordingSpawner {
        fn spawn(&self, command: &OsStr, cwd: &Path) -> Result<Child, SpawnError> {
            self.seen
                .lock()
                .unwrap()
                .push((command.to_string_lossy().into_owned(), cwd.to_path_buf()));
            ShellSpawner::new().spawn(command, cwd)
        }
    }

    #[tokio::test]
    async fn cd_is_never_spawned() {
        let (dir, engine) = engine_in_tempdir().await;
        let spawner = Arc::new(RecordingSpawner::default());
        let mut engine = engine.with_spawner(spawner.clone());
        let cancel = CancellationToken::new();

        engine.execute(Bytes::new(), b"cd /", &cancel).await.unwrap();
        engine.execute(Bytes::new(), b"true", &cancel).await.unwrap();

        let seen = spawner.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "true");
        assert_eq!(seen[0].1, Path::new("/"));
        drop(dir);
    }
}
