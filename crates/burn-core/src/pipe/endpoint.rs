//! Platform pipe endpoints.
//!
//! On Windows an endpoint is a named pipe `\\.\pipe\<name>` created as the
//! first instance and closed to remote clients. Elsewhere it is a Unix
//! domain socket `<directory>/<name>.sock` readable only by its owner.

use std::path::Path;
use std::time::Duration;

use tracing::{debug, info};

use super::PipeError;
use super::channel::BoxedStream;
use super::process::ProcessWatch;

/// Server end of one pipe endpoint. Accepts a single client.
pub struct PipeListener {
    name: String,
    #[cfg(unix)]
    inner: tokio::net::UnixListener,
    #[cfg(unix)]
    path: std::path::PathBuf,
    #[cfg(windows)]
    server: Option<tokio::net::windows::named_pipe::NamedPipeServer>,
}

impl std::fmt::Debug for PipeListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeListener")
            .field("name", &self.name)
            .finish()
    }
}

#[cfg(windows)]
fn pipe_path(name: &str) -> String {
    format!(r"\\.\pipe\{name}")
}

#[cfg(unix)]
fn socket_path(directory: &Path, name: &str) -> std::path::PathBuf {
    directory.join(format!("{name}.sock"))
}

impl PipeListener {
    /// Create the endpoint. Fails if another endpoint already owns the name.
    pub fn bind(directory: &Path, name: &str) -> Result<Self, PipeError> {
        #[cfg(unix)]
        {
            let path = socket_path(directory, name);
            let inner = bind_owner_only(directory, &path)?;
            debug!(pipe = name, path = %path.display(), "Pipe endpoint created");
            Ok(Self {
                name: name.to_string(),
                inner,
                path,
            })
        }
        #[cfg(windows)]
        {
            use tokio::net::windows::named_pipe::ServerOptions;

            let _ = directory;
            let server = ServerOptions::new()
                .first_pipe_instance(true)
                .reject_remote_clients(true)
                .create(pipe_path(name))?;
            debug!(pipe = name, "Pipe endpoint created");
            Ok(Self {
                name: name.to_string(),
                server: Some(server),
            })
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the client. Cancel-safe.
    pub async fn accept(&mut self) -> Result<BoxedStream, PipeError> {
        #[cfg(unix)]
        {
            let (stream, _) = self.inner.accept().await?;
            Ok(Box::new(stream))
        }
        #[cfg(windows)]
        {
            let server = self.server.as_ref().ok_or(PipeError::Disconnected)?;
            server.connect().await?;
            let server = self.server.take().ok_or(PipeError::Disconnected)?;
            Ok(Box::new(server))
        }
    }
}

/// Bind `path` so that no other user can connect at any point.
///
/// The socket is bound inside a fresh 0700 directory, set to 0600 and only
/// then linked into `directory`. Linking fails when `path` already exists.
#[cfg(unix)]
fn bind_owner_only(
    directory: &Path,
    path: &Path,
) -> Result<tokio::net::UnixListener, PipeError> {
    use std::fs::{DirBuilder, Permissions};
    use std::os::unix::fs::{DirBuilderExt, PermissionsExt};

    if !directory.exists() {
        DirBuilder::new()
            .recursive(true)
            .mode(DIRECTORY_MODE)
            .create(directory)?;
    }
    let staging = directory.join(format!(".burn-{}", uuid::Uuid::new_v4().simple()));
    DirBuilder::new().mode(DIRECTORY_MODE).create(&staging)?;
    let staged = staging.join("endpoint.sock");

    let result = tokio::net::UnixListener::bind(&staged)
        .and_then(|listener| {
            std::fs::set_permissions(&staged, Permissions::from_mode(SOCKET_MODE))?;
            std::fs::hard_link(&staged, path)?;
            Ok(listener)
        })
        .map_err(PipeError::from);

    let _ = std::fs::remove_file(&staged);
    let _ = std::fs::remove_dir(&staging);
    result
}

#[cfg(unix)]
const DIRECTORY_MODE: u32 = 0o700;
#[cfg(unix)]
const SOCKET_MODE: u32 = 0o600;

#[cfg(unix)]
impl Drop for PipeListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Connect to an endpoint created by [`PipeListener::bind`].
pub async fn connect(directory: &Path, name: &str) -> Result<BoxedStream, PipeError> {
    #[cfg(unix)]
    {
        let stream = tokio::net::UnixStream::connect(socket_path(directory, name)).await?;
        Ok(Box::new(stream))
    }
    #[cfg(windows)]
    {
        use tokio::net::windows::named_pipe::ClientOptions;

        const ERROR_PIPE_BUSY: i32 = 231;
        let _ = directory;
        let path = pipe_path(name);
        for _ in 0..50 {
            match ClientOptions::new().open(&path) {
                Ok(client) => return Ok(Box::new(client)),
                Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY) => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(PipeError::ConnectTimeout)
    }
}

/// Wait for a spawned client to connect.
///
/// Polls `retries` times, `wait` apart. Between polls the client process is
/// checked; if it has exited the wait ends early.
pub async fn wait_for_client(
    listener: &mut PipeListener,
    process: &mut dyn ProcessWatch,
    retries: u32,
    wait: Duration,
) -> Result<BoxedStream, PipeError> {
    for attempt in 0..retries {
        match tokio::time::timeout(wait, listener.accept()).await {
            Ok(stream) => {
                info!(pipe = %listener.name(), attempt, "Client connected");
                return stream;
            }
            Err(_) => {
                if !process.is_running() {
                    return Err(PipeError::ClientExited);
                }
            }
        }
    }
    Err(PipeError::ConnectTimeout)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::pipe::process::Unwatched;

    struct Exited;

    impl ProcessWatch for Exited {
        fn is_running(&mut self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_bind_connect_accept() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut listener = PipeListener::bind(dir.path(), "BurnPipe.test").unwrap();
        let client = tokio::spawn({
            let path = dir.path().to_path_buf();
            async move { connect(&path, "BurnPipe.test").await }
        });
        let server = wait_for_client(
            &mut listener,
            &mut Unwatched,
            50,
            Duration::from_millis(100),
        )
        .await;
        assert!(server.is_ok());
        assert!(client.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_second_bind_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let _first = PipeListener::bind(dir.path(), "dup").unwrap();
        assert!(PipeListener::bind(dir.path(), "dup").is_err());
    }

    #[tokio::test]
    async fn test_socket_is_owner_only_from_the_start() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let endpoints = dir.path().join("run").join("burn");
        let _listener = PipeListener::bind(&endpoints, "private").unwrap();

        let mode = |p: &Path| std::fs::metadata(p).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(&endpoints.join("private.sock")), 0o600);
        assert_eq!(mode(&endpoints), 0o700);
        let leftovers: Vec<_> = std::fs::read_dir(&endpoints)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("private.sock")]);
    }

    #[tokio::test]
    async fn test_failed_bind_leaves_the_first_endpoint_alone() {
        let dir = tempfile::TempDir::new().unwrap();
        let _first = PipeListener::bind(dir.path(), "held").unwrap();
        assert!(PipeListener::bind(dir.path(), "held").is_err());
        assert!(connect(dir.path(), "held").await.is_ok());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_socket_removed_on_drop() {
        let dir = tempfile::TempDir::new().unwrap();
        let listener = PipeListener::bind(dir.path(), "gone").unwrap();
        assert!(dir.path().join("gone.sock").exists());
        drop(listener);
        assert!(!dir.path().join("gone.sock").exists());
    }

    #[tokio::test]
    async fn test_wait_stops_when_client_exits() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut listener = PipeListener::bind(dir.path(), "lonely").unwrap();
        let result =
            wait_for_client(&mut listener, &mut Exited, 100, Duration::from_millis(10)).await;
        assert!(matches!(result, Err(PipeError::ClientExited)));
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut listener = PipeListener::bind(dir.path(), "slow").unwrap();
        let result =
            wait_for_client(&mut listener, &mut Unwatched, 2, Duration::from_millis(10)).await;
        assert!(matches!(result, Err(PipeError::ConnectTimeout)));
    }
}
