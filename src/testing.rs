//! In-memory doubles shared by the unit tests

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncWrite, DuplexStream};
use tokio::sync::{broadcast, mpsc, Notify};

use crate::assist::{Analysis, AnalysisContext, AnalyzerError, AssistEvent, OutputAnalyzer};
use crate::config::BrokerConfig;
use crate::session::{
    AuthMaterial, DisconnectReason, ObserverId, SessionDescriptor, SessionObserver,
    TransferObserver,
};
use crate::sftp::{
    RemoteAttrs, RemoteEntry, RemoteFs, RemoteReader, RemoteWriter, SftpError, TransferDirection,
    TransferFailure, TransferProgress, TransferSummary,
};
use crate::ssh::{
    HandleCommand, HandleController, PtyRequest, RemoteConnector, SessionCommand, ShellChannel,
    ShellEvent, SshError,
};

/// Let spawned tasks run to quiescence.
pub(crate) async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// Poll until `condition` holds; panics after about five seconds.
pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

pub(crate) fn descriptor(user_id: &str, session_id: &str) -> SessionDescriptor {
    SessionDescriptor {
        session_id: session_id.to_string(),
        user_id: user_id.to_string(),
        hostname: "example.com".to_string(),
        port: 22,
        username: "alice".to_string(),
        auth: AuthMaterial::password("hunter2"),
        display_name: None,
    }
}

pub(crate) fn config() -> BrokerConfig {
    let mut config = BrokerConfig::default();
    config.assist.enabled_by_default = true;
    config
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Behavior {
    Succeed,
    Fail,
    Hang,
}

/// Test side of a shell opened through [`FakeConnector`]
pub(crate) struct FakeShell {
    pub input: mpsc::Receiver<SessionCommand>,
    pub output: mpsc::Sender<ShellEvent>,
}

impl FakeShell {
    pub async fn emit(&self, text: &str) {
        self.output
            .send(ShellEvent::Output(Bytes::copy_from_slice(text.as_bytes())))
            .await
            .unwrap();
    }

    pub async fn send(&self, event: ShellEvent) {
        let _ = self.output.send(event).await;
    }

    /// Everything written to stdin so far
    pub fn written(&mut self) -> String {
        let mut out = String::new();
        while let Ok(command) = self.input.try_recv() {
            if let SessionCommand::Data(data) = command {
                out.push_str(&String::from_utf8_lossy(&data));
            }
        }
        out
    }

    pub fn commands(&mut self) -> Vec<SessionCommand> {
        let mut commands = Vec::new();
        while let Ok(command) = self.input.try_recv() {
            commands.push(command);
        }
        commands
    }
}

/// Connector that never touches the network
pub(crate) struct FakeConnector {
    pub auth: Mutex<Behavior>,
    pub shell: Mutex<Behavior>,
    pub file_channel: Mutex<Behavior>,
    pub authentications: AtomicUsize,
    live: Arc<AtomicUsize>,
    shells: Mutex<VecDeque<FakeShell>>,
    kill: Arc<Notify>,
    pub fs: Arc<MemoryFs>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            auth: Mutex::new(Behavior::Succeed),
            shell: Mutex::new(Behavior::Succeed),
            file_channel: Mutex::new(Behavior::Succeed),
            authentications: AtomicUsize::new(0),
            live: Arc::new(AtomicUsize::new(0)),
            shells: Mutex::new(VecDeque::new()),
            kill: Arc::new(Notify::new()),
            fs: MemoryFs::new(),
        })
    }

    /// Connections authenticated and not yet closed
    pub fn live_connections(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn take_shell(&self) -> FakeShell {
        self.shells.lock().pop_front().expect("no shell was opened")
    }

    /// Drop every open connection as if the network went away.
    pub fn drop_connections(&self) {
        self.kill.notify_waiters();
    }

    fn controller(&self) -> HandleController {
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(16);
        let (disconnect_tx, _) = broadcast::channel::<()>(1);
        let notify_tx = disconnect_tx.clone();
        let live = self.live.clone();
        let kill = self.kill.clone();
        live.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    command = cmd_rx.recv() => match command {
                        Some(HandleCommand::ChannelOpenSession { reply_tx }) => drop(reply_tx),
                        Some(HandleCommand::Disconnect) | None => break,
                    },
                    _ = kill.notified() => break,
                }
            }
            live.fetch_sub(1, Ordering::SeqCst);
            let _ = notify_tx.send(());
        });

        HandleController::from_parts(cmd_tx, disconnect_tx)
    }
}

async fn hang() {
    tokio::time::sleep(Duration::from_secs(3600)).await;
}

#[async_trait]
impl RemoteConnector for FakeConnector {
    async fn authenticate(
        &self,
        _descriptor: &SessionDescriptor,
        _label: &str,
    ) -> Result<HandleController, SshError> {
        let behavior = *self.auth.lock();
        match behavior {
            Behavior::Succeed => {
                self.authentications.fetch_add(1, Ordering::SeqCst);
                Ok(self.controller())
            }
            Behavior::Fail => Err(SshError::AuthenticationFailed(
                "server rejected credentials".into(),
            )),
            Behavior::Hang => {
                hang().await;
                Err(SshError::Timeout("hang".into()))
            }
        }
    }

    async fn open_shell(
        &self,
        _controller: &HandleController,
        _pty: &PtyRequest,
        _label: &str,
    ) -> Result<ShellChannel, SshError> {
        let behavior = *self.shell.lock();
        match behavior {
            Behavior::Succeed => {
                let (cmd_tx, cmd_rx) = mpsc::channel(256);
                let (event_tx, event_rx) = mpsc::channel(256);
                self.shells.lock().push_back(FakeShell {
                    input: cmd_rx,
                    output: event_tx,
                });
                Ok(ShellChannel::new(cmd_tx, event_rx))
            }
            Behavior::Fail => Err(SshError::ChannelError("shell request refused".into())),
            Behavior::Hang => {
                hang().await;
                Err(SshError::Timeout("hang".into()))
            }
        }
    }

    async fn open_file_channel(
        &self,
        _controller: &HandleController,
        _label: &str,
    ) -> Result<Arc<dyn RemoteFs>, SftpError> {
        let behavior = *self.file_channel.lock();
        match behavior {
            Behavior::Succeed => {
                let fs: Arc<dyn RemoteFs> = self.fs.clone();
                Ok(fs)
            }
            Behavior::Fail => Err(SftpError::SubsystemNotAvailable("sftp disabled".into())),
            Behavior::Hang => {
                hang().await;
                Err(SftpError::Timeout("hang".into()))
            }
        }
    }
}

/// Records every callback it receives
pub(crate) struct RecordingObserver {
    id: ObserverId,
    output: Mutex<Vec<u8>>,
    pub chunks: Mutex<Vec<Bytes>>,
    pub disconnects: Mutex<Vec<DisconnectReason>>,
    pub errors: Mutex<Vec<String>>,
    pub assist: Mutex<Vec<AssistEvent>>,
    pub progress: Mutex<Vec<(TransferDirection, TransferProgress)>>,
    pub completed: Mutex<Vec<TransferSummary>>,
    pub failures: Mutex<Vec<TransferFailure>>,
}

impl RecordingObserver {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: ObserverId::from(id),
            output: Mutex::new(Vec::new()),
            chunks: Mutex::new(Vec::new()),
            disconnects: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            assist: Mutex::new(Vec::new()),
            progress: Mutex::new(Vec::new()),
            completed: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
        })
    }

    pub fn output(&self) -> String {
        String::from_utf8_lossy(&self.output.lock()).into_owned()
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.lock().len()
    }

    pub fn transferred(&self) -> Vec<u64> {
        self.progress.lock().iter().map(|(_, p)| p.transferred).collect()
    }

    pub fn assist_events(&self) -> Vec<AssistEvent> {
        self.assist.lock().clone()
    }
}

impl SessionObserver for RecordingObserver {
    fn id(&self) -> &ObserverId {
        &self.id
    }

    fn on_output(&self, data: &Bytes) {
        self.output.lock().extend_from_slice(data);
        self.chunks.lock().push(data.clone());
    }

    fn on_disconnected(&self, reason: &DisconnectReason) {
        self.disconnects.lock().push(reason.clone());
    }

    fn on_error(&self, message: &str) {
        self.errors.lock().push(message.to_string());
    }

    fn on_assist(&self, event: &AssistEvent) {
        self.assist.lock().push(event.clone());
    }
}

impl TransferObserver for RecordingObserver {
    fn on_progress(&self, direction: TransferDirection, progress: &TransferProgress) {
        self.progress.lock().push((direction, progress.clone()));
    }

    fn on_complete(&self, summary: &TransferSummary) {
        self.completed.lock().push(summary.clone());
    }

    fn on_failed(&self, _direction: TransferDirection, failure: &TransferFailure) {
        self.failures.lock().push(failure.clone());
    }

    fn on_disconnected(&self, reason: &DisconnectReason) {
        self.disconnects.lock().push(reason.clone());
    }
}

/// Analyzer that answers from a script and records what it was asked
pub(crate) struct ScriptedAnalyzer {
    pub calls: Mutex<Vec<(String, AnalysisContext)>>,
    reply: Mutex<Result<Analysis, AnalyzerError>>,
    delay: Mutex<Option<Duration>>,
}

impl ScriptedAnalyzer {
    pub fn replying(message: &str, command: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            reply: Mutex::new(Ok(Analysis {
                message: message.to_string(),
                command: command.map(str::to_string),
                requires_approval: None,
            })),
            delay: Mutex::new(None),
        })
    }

    pub fn failing(message: &str) -> Arc<Self> {
        let analyzer = Self::replying("", None);
        *analyzer.reply.lock() = Err(AnalyzerError::Unavailable(message.to_string()));
        analyzer
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn snapshots(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(s, _)| s.clone()).collect()
    }
}

#[async_trait]
impl OutputAnalyzer for ScriptedAnalyzer {
    async fn analyze(
        &self,
        snapshot: &str,
        context: &AnalysisContext,
    ) -> Result<Analysis, AnalyzerError> {
        self.calls
            .lock()
            .push((snapshot.to_string(), context.clone()));
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.reply.lock().clone()
    }
}

#[derive(Clone)]
enum MemNode {
    Dir { mode: u32 },
    File { mode: u32, data: Arc<Mutex<Vec<u8>>> },
}

/// Remote filesystem held in memory
pub(crate) struct MemoryFs {
    home: String,
    nodes: Mutex<BTreeMap<String, MemNode>>,
    streams: Mutex<HashMap<String, DuplexStream>>,
}

fn parent_of(path: &str) -> String {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some(("", _)) | None => "/".to_string(),
        Some((parent, _)) => parent.to_string(),
    }
}

fn not_found(path: &str) -> SftpError {
    SftpError::FileNotFound(path.to_string())
}

impl MemoryFs {
    pub fn new() -> Arc<Self> {
        let fs = Self {
            home: "/home/alice".to_string(),
            nodes: Mutex::new(BTreeMap::new()),
            streams: Mutex::new(HashMap::new()),
        };
        for dir in ["/", "/home", "/home/alice"] {
            fs.add_dir(dir);
        }
        Arc::new(fs)
    }

    pub fn add_dir(&self, path: &str) {
        self.nodes
            .lock()
            .insert(path.to_string(), MemNode::Dir { mode: 0o040755 });
    }

    pub fn add_file(&self, path: &str, data: &[u8]) {
        self.add_node(path, 0o100644, data);
    }

    pub fn add_node(&self, path: &str, mode: u32, data: &[u8]) {
        self.nodes.lock().insert(
            path.to_string(),
            MemNode::File {
                mode,
                data: Arc::new(Mutex::new(data.to_vec())),
            },
        );
    }

    /// Register a file of `size` bytes whose content the test feeds through
    /// the returned stream.
    pub fn stream_file(&self, path: &str, size: usize) -> DuplexStream {
        self.add_file(path, &vec![0u8; size]);
        let (reader, writer) = tokio::io::duplex(64 * 1024);
        self.streams.lock().insert(path.to_string(), reader);
        writer
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.nodes.lock().get(path) {
            Some(MemNode::File { data, .. }) => Some(data.lock().clone()),
            _ => None,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.nodes.lock().contains_key(path)
    }

    fn require_dir(&self, path: &str) -> Result<(), SftpError> {
        match self.nodes.lock().get(path) {
            Some(MemNode::Dir { .. }) => Ok(()),
            Some(_) => Err(SftpError::ProtocolError(format!("{}: not a directory", path))),
            None => Err(not_found(path)),
        }
    }
}

#[async_trait]
impl RemoteFs for MemoryFs {
    fn home(&self) -> &str {
        &self.home
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, SftpError> {
        self.require_dir(path)?;
        let entries: Vec<String> = {
            let nodes = self.nodes.lock();
            nodes
                .keys()
                .filter(|child| child.as_str() != path && parent_of(child) == path)
                .map(|child| child.rsplit('/').next().unwrap_or(child).to_string())
                .collect()
        };
        let mut out = Vec::new();
        for name in entries {
            let full = if path == "/" {
                format!("/{}", name)
            } else {
                format!("{}/{}", path, name)
            };
            out.push(RemoteEntry {
                attrs: self.stat(&full).await?,
                name,
            });
        }
        Ok(out)
    }

    async fn stat(&self, path: &str) -> Result<RemoteAttrs, SftpError> {
        let nodes = self.nodes.lock();
        let (mode, size) = match nodes.get(path) {
            Some(MemNode::Dir { mode }) => (*mode, 4096),
            Some(MemNode::File { mode, data }) => (*mode, data.lock().len() as u64),
            None => return Err(not_found(path)),
        };
        Ok(RemoteAttrs {
            permissions: Some(mode),
            size: Some(size),
            mtime: Some(1_700_000_000),
            uid: Some(1000),
            gid: Some(1000),
        })
    }

    async fn open_read(&self, path: &str) -> Result<RemoteReader, SftpError> {
        if let Some(stream) = self.streams.lock().remove(path) {
            return Ok(Box::new(stream));
        }
        match self.nodes.lock().get(path) {
            Some(MemNode::File { data, .. }) => {
                Ok(Box::new(std::io::Cursor::new(data.lock().clone())))
            }
            Some(MemNode::Dir { .. }) => Err(SftpError::ProtocolError(format!(
                "{}: is a directory",
                path
            ))),
            None => Err(not_found(path)),
        }
    }

    async fn create(&self, path: &str) -> Result<RemoteWriter, SftpError> {
        self.require_dir(&parent_of(path))?;
        let data = Arc::new(Mutex::new(Vec::new()));
        self.nodes.lock().insert(
            path.to_string(),
            MemNode::File {
                mode: 0o100644,
                data: data.clone(),
            },
        );
        Ok(Box::new(MemWriter { data }))
    }

    async fn mkdir(&self, path: &str) -> Result<(), SftpError> {
        self.require_dir(&parent_of(path))?;
        let mut nodes = self.nodes.lock();
        if nodes.contains_key(path) {
            return Err(SftpError::ProtocolError(format!("{}: Failure", path)));
        }
        nodes.insert(path.to_string(), MemNode::Dir { mode: 0o040755 });
        Ok(())
    }

    async fn rmdir(&self, path: &str) -> Result<(), SftpError> {
        self.require_dir(path)?;
        let mut nodes = self.nodes.lock();
        if nodes.keys().any(|k| k != path && parent_of(k) == path) {
            return Err(SftpError::ProtocolError(format!("{}: directory not empty", path)));
        }
        nodes.remove(path);
        Ok(())
    }

    async fn unlink(&self, path: &str) -> Result<(), SftpError> {
        let mut nodes = self.nodes.lock();
        match nodes.get(path) {
            Some(MemNode::File { .. }) => {
                nodes.remove(path);
                Ok(())
            }
            Some(MemNode::Dir { .. }) => Err(SftpError::ProtocolError(format!(
                "{}: is a directory",
                path
            ))),
            None => Err(not_found(path)),
        }
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), SftpError> {
        let mut nodes = self.nodes.lock();
        let node = nodes.remove(from).ok_or_else(|| not_found(from))?;
        nodes.insert(to.to_string(), node);
        Ok(())
    }
}

struct MemWriter {
    data: Arc<Mutex<Vec<u8>>>,
}

impl AsyncWrite for MemWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.data.lock().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
