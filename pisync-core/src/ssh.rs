use std::io::{self, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use filetime::FileTime;
use ssh2::{ErrorCode, FileStat, RenameFlags, Session, Sftp};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::session::{
    Connector, ExecOutput, RemoteEntry, RemoteSession, RemoteStat, SessionConfig, SessionError,
    modified_secs,
};

// libssh2 / SFTP status codes the session cares about.
const FX_NO_SUCH_FILE: i32 = 2;
const FX_NO_SUCH_PATH: i32 = 10;
const ERROR_SOCKET_SEND: i32 = -7;
const ERROR_TIMEOUT: i32 = -9;
const ERROR_SOCKET_DISCONNECT: i32 = -13;
const ERROR_AUTHENTICATION_FAILED: i32 = -18;
const ERROR_PUBLICKEY_UNVERIFIED: i32 = -19;
const ERROR_CHANNEL_CLOSED: i32 = -26;
const ERROR_SOCKET_TIMEOUT: i32 = -30;
const ERROR_SOCKET_RECV: i32 = -43;

const READ_CHUNK: usize = 16 * 1024;
const EXEC_POLL: Duration = Duration::from_millis(10);

/// Opens SSH sessions with an SFTP channel attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct SshConnector;

impl SshConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(
        &self,
        config: &SessionConfig,
    ) -> Result<Arc<dyn RemoteSession>, SessionError> {
        let config = config.clone();
        let session = tokio::task::spawn_blocking(move || open_session(&config))
            .await
            .map_err(|err| SessionError::Worker(err.to_string()))??;
        Ok(Arc::new(session))
    }
}

struct SshInner {
    session: Session,
    sftp: Mutex<Sftp>,
}

impl SshInner {
    fn sftp(&self) -> Result<MutexGuard<'_, Sftp>, SessionError> {
        self.sftp
            .lock()
            .map_err(|_| SessionError::Worker("sftp channel lock poisoned".into()))
    }
}

pub struct SshSession {
    inner: Arc<SshInner>,
}

impl SshSession {
    async fn blocking<T, F>(&self, f: F) -> Result<T, SessionError>
    where
        F: FnOnce(&SshInner) -> Result<T, SessionError> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|err| SessionError::Worker(err.to_string()))?
    }
}

fn open_session(config: &SessionConfig) -> Result<SshSession, SessionError> {
    let address = config.address();
    let socket = address
        .to_socket_addrs()
        .map_err(|err| SessionError::Address(format!("{address}: {err}")))?
        .next()
        .ok_or_else(|| SessionError::Address(format!("{address}: no addresses resolved")))?;
    let tcp = TcpStream::connect_timeout(&socket, config.connect_timeout)?;

    let mut session = Session::new().map_err(|err| map_ssh_error(err, &address))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(u32::try_from(config.operation_timeout.as_millis()).unwrap_or(u32::MAX));
    session
        .handshake()
        .map_err(|err| map_ssh_error(err, &address))?;

    let method = authenticate(&session, config)?;
    info!(
        "ssh session established to {} as {} via {}",
        address, config.username, method
    );

    let sftp = session.sftp().map_err(|err| map_ssh_error(err, &address))?;
    Ok(SshSession {
        inner: Arc::new(SshInner {
            session,
            sftp: Mutex::new(sftp),
        }),
    })
}

struct PasswordPrompt {
    password: String,
}

impl ssh2::KeyboardInteractivePrompt for PasswordPrompt {
    fn prompt(
        &mut self,
        _username: &str,
        _instructions: &str,
        prompts: &[ssh2::Prompt],
    ) -> Vec<String> {
        prompts.iter().map(|_| self.password.clone()).collect()
    }
}

fn authenticate(session: &Session, config: &SessionConfig) -> Result<&'static str, SessionError> {
    if let Some(key) = &config.private_key_path {
        match session.userauth_pubkey_file(&config.username, None, key, None) {
            Ok(()) if session.authenticated() => return Ok("publickey"),
            Ok(()) => {}
            Err(err) => debug!("public key auth with {} failed: {}", key.display(), err),
        }
    }

    if let Some(password) = &config.password {
        if session
            .userauth_password(&config.username, password)
            .is_ok()
            && session.authenticated()
        {
            return Ok("password");
        }
        let mut prompt = PasswordPrompt {
            password: password.clone(),
        };
        if session
            .userauth_keyboard_interactive(&config.username, &mut prompt)
            .is_ok()
            && session.authenticated()
        {
            return Ok("keyboard-interactive");
        }
    }

    Err(SessionError::Auth(format!(
        "no authentication method succeeded for {}@{}",
        config.username, config.host
    )))
}

fn map_ssh_error(err: ssh2::Error, context: &str) -> SessionError {
    match err.code() {
        ErrorCode::SFTP(FX_NO_SUCH_FILE | FX_NO_SUCH_PATH) => {
            SessionError::NotFound(context.to_string())
        }
        ErrorCode::Session(
            ERROR_SOCKET_SEND | ERROR_SOCKET_RECV | ERROR_SOCKET_DISCONNECT | ERROR_CHANNEL_CLOSED,
        ) => SessionError::Disconnected(format!("{context}: {err}")),
        ErrorCode::Session(ERROR_TIMEOUT | ERROR_SOCKET_TIMEOUT) => {
            SessionError::Timeout(format!("{context}: {err}"))
        }
        ErrorCode::Session(ERROR_AUTHENTICATION_FAILED | ERROR_PUBLICKEY_UNVERIFIED) => {
            SessionError::Auth(format!("{context}: {err}"))
        }
        _ => SessionError::Ssh(format!("{context}: {err}")),
    }
}

fn to_remote_stat(stat: &FileStat) -> RemoteStat {
    RemoteStat {
        size: stat.size.unwrap_or(0),
        mtime: stat.mtime.map(|v| v as i64).unwrap_or(0),
        is_dir: stat.is_dir(),
    }
}

fn stat_blocking(sftp: &Sftp, path: &str) -> Result<Option<RemoteStat>, SessionError> {
    match sftp.stat(Path::new(path)) {
        Ok(stat) => Ok(Some(to_remote_stat(&stat))),
        Err(err) => match map_ssh_error(err, path) {
            SessionError::NotFound(_) => Ok(None),
            other => Err(other),
        },
    }
}

/// Forwards stdout and stderr chunks in arrival order from non-blocking
/// readers until the channel reports EOF and both streams are drained.
fn pump_output<O, E, F>(
    mut stdout: O,
    mut stderr: E,
    mut eof: F,
    output: &mpsc::UnboundedSender<ExecOutput>,
) -> io::Result<()>
where
    O: Read,
    E: Read,
    F: FnMut() -> bool,
{
    let mut buf = vec![0u8; READ_CHUNK];
    let mut saw_eof = false;
    loop {
        let mut progressed = false;
        if let Some(read) = read_available(&mut stdout, &mut buf)? {
            progressed = true;
            let _ = output.send(ExecOutput::Stdout(buf[..read].to_vec()));
        }
        if let Some(read) = read_available(&mut stderr, &mut buf)? {
            progressed = true;
            let _ = output.send(ExecOutput::Stderr(buf[..read].to_vec()));
        }
        if progressed {
            continue;
        }
        // One more pass after EOF picks up data buffered alongside it.
        if saw_eof {
            return Ok(());
        }
        saw_eof = eof();
        if !saw_eof {
            std::thread::sleep(EXEC_POLL);
        }
    }
}

fn read_available<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<Option<usize>> {
    match reader.read(buf) {
        Ok(0) => Ok(None),
        Ok(read) => Ok(Some(read)),
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(err) => Err(err),
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn stat(&self, path: &str) -> Result<Option<RemoteStat>, SessionError> {
        let path = path.to_string();
        self.blocking(move |inner| {
            let sftp = inner.sftp()?;
            stat_blocking(&sftp, &path)
        })
        .await
    }

    async fn put(&self, local: &Path, remote: &str) -> Result<(), SessionError> {
        let local = local.to_path_buf();
        let remote = remote.to_string();
        self.blocking(move |inner| {
            let mut source = std::fs::File::open(&local)?;
            let mtime = modified_secs(&source.metadata()?);
            let sftp = inner.sftp()?;
            let mut target = sftp
                .create(Path::new(&remote))
                .map_err(|err| map_ssh_error(err, &remote))?;
            io::copy(&mut source, &mut target)?;
            drop(target);
            let times = FileStat {
                size: None,
                uid: None,
                gid: None,
                perm: None,
                atime: Some(mtime.max(0) as u64),
                mtime: Some(mtime.max(0) as u64),
            };
            sftp.setstat(Path::new(&remote), times)
                .map_err(|err| map_ssh_error(err, &remote))
        })
        .await
    }

    async fn get(&self, remote: &str, local: &Path) -> Result<(), SessionError> {
        let local = local.to_path_buf();
        let remote = remote.to_string();
        self.blocking(move |inner| {
            let sftp = inner.sftp()?;
            let mut source = sftp
                .open(Path::new(&remote))
                .map_err(|err| map_ssh_error(err, &remote))?;
            let mtime = source
                .stat()
                .map(|stat| to_remote_stat(&stat).mtime)
                .map_err(|err| map_ssh_error(err, &remote))?;
            let mut target = std::fs::File::create(&local)?;
            io::copy(&mut source, &mut target)?;
            target.sync_all()?;
            drop(target);
            filetime::set_file_mtime(&local, FileTime::from_unix_time(mtime, 0))?;
            Ok(())
        })
        .await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), SessionError> {
        let from = from.to_string();
        let to = to.to_string();
        self.blocking(move |inner| {
            let sftp = inner.sftp()?;
            let flags = RenameFlags::OVERWRITE | RenameFlags::ATOMIC | RenameFlags::NATIVE;
            match sftp.rename(Path::new(&from), Path::new(&to), Some(flags)) {
                Ok(()) => Ok(()),
                Err(first) => {
                    // SFTPv3 servers refuse to rename over an existing file.
                    if stat_blocking(&sftp, &to)?.is_none() {
                        return Err(map_ssh_error(first, &from));
                    }
                    sftp.unlink(Path::new(&to))
                        .map_err(|err| map_ssh_error(err, &to))?;
                    sftp.rename(Path::new(&from), Path::new(&to), None)
                        .map_err(|err| map_ssh_error(err, &from))
                }
            }
        })
        .await
    }

    async fn unlink(&self, path: &str) -> Result<(), SessionError> {
        let path = path.to_string();
        self.blocking(move |inner| {
            inner
                .sftp()?
                .unlink(Path::new(&path))
                .map_err(|err| map_ssh_error(err, &path))
        })
        .await
    }

    async fn mkdir(&self, path: &str) -> Result<(), SessionError> {
        let path = path.to_string();
        self.blocking(move |inner| {
            let sftp = inner.sftp()?;
            match sftp.mkdir(Path::new(&path), 0o755) {
                Ok(()) => Ok(()),
                Err(err) => match stat_blocking(&sftp, &path)? {
                    Some(stat) if stat.is_dir => Ok(()),
                    _ => Err(map_ssh_error(err, &path)),
                },
            }
        })
        .await
    }

    async fn rmdir(&self, path: &str) -> Result<(), SessionError> {
        let path = path.to_string();
        self.blocking(move |inner| {
            inner
                .sftp()?
                .rmdir(Path::new(&path))
                .map_err(|err| map_ssh_error(err, &path))
        })
        .await
    }

    async fn readdir(&self, path: &str) -> Result<Vec<RemoteEntry>, SessionError> {
        let path = path.to_string();
        self.blocking(move |inner| {
            let entries = inner
                .sftp()?
                .readdir(Path::new(&path))
                .map_err(|err| map_ssh_error(err, &path))?;
            Ok(entries
                .into_iter()
                .filter_map(|(entry_path, stat)| {
                    let name = entry_path.file_name()?.to_string_lossy().to_string();
                    if name == "." || name == ".." {
                        return None;
                    }
                    Some(RemoteEntry {
                        name,
                        is_dir: stat.is_dir(),
                    })
                })
                .collect())
        })
        .await
    }

    async fn exec(
        &self,
        command: &str,
        output: mpsc::UnboundedSender<ExecOutput>,
    ) -> Result<i32, SessionError> {
        let command = command.to_string();
        self.blocking(move |inner| {
            let mut channel = inner
                .session
                .channel_session()
                .map_err(|err| map_ssh_error(err, &command))?;
            channel
                .exec(&command)
                .map_err(|err| map_ssh_error(err, &command))?;

            // Blocking mode is session wide; hold the sftp lock so no file
            // operation runs while the session is non-blocking.
            let _sftp = inner.sftp()?;
            inner.session.set_blocking(false);
            let pumped = pump_output(
                channel.stream(0),
                channel.stderr(),
                || channel.eof(),
                &output,
            );
            inner.session.set_blocking(true);
            pumped?;

            channel
                .wait_close()
                .map_err(|err| map_ssh_error(err, &command))?;
            channel
                .exit_status()
                .map_err(|err| map_ssh_error(err, &command))
        })
        .await
    }

    async fn close(&self) {
        let result = self
            .blocking(|inner| {
                inner
                    .session
                    .disconnect(None, "pisync disconnecting", None)
                    .map_err(|err| map_ssh_error(err, "disconnect"))
            })
            .await;
        if let Err(err) = result {
            debug!("ssh disconnect failed: {err}");
        }
    }
}
