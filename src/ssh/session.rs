//! Interactive shell channel

use bytes::Bytes;
use russh::ChannelMsg;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::error::SshError;
use super::handle_owner::HandleController;

/// Commands that can be sent to the shell channel task
#[derive(Debug)]
pub enum SessionCommand {
    /// Bytes for the remote stdin
    Data(Vec<u8>),
    /// Resize the PTY (cols, rows)
    Resize(u16, u16),
    /// Send EOF and stop
    Close,
}

/// Events produced by the shell channel task, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum ShellEvent {
    /// stdout or stderr bytes
    Output(Bytes),
    ExitStatus(u32),
    /// Channel closed cleanly (EOF/Close or local Close command)
    Closed,
    /// Channel I/O failed
    Failed(String),
}

/// PTY parameters requested when opening the shell
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PtyRequest {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
}

impl Default for PtyRequest {
    fn default() -> Self {
        Self {
            term: "xterm-256color".to_string(),
            cols: 80,
            rows: 24,
        }
    }
}

/// Both ends of a running shell
pub struct ShellChannel {
    pub cmd_tx: mpsc::Sender<SessionCommand>,
    pub events: mpsc::Receiver<ShellEvent>,
}

impl ShellChannel {
    /// Pair a command sender with an event receiver.
    pub fn new(cmd_tx: mpsc::Sender<SessionCommand>, events: mpsc::Receiver<ShellEvent>) -> Self {
        Self { cmd_tx, events }
    }
}

/// Request a PTY and an interactive shell on a fresh session channel.
///
/// A spawned task forwards [`SessionCommand`]s to the channel and channel
/// messages back as [`ShellEvent`]s. The task ends on EOF/Close, on a write
/// failure, on [`SessionCommand::Close`], or when the event receiver is dropped.
pub async fn open_shell(
    controller: &HandleController,
    pty: &PtyRequest,
    label: String,
) -> Result<ShellChannel, SshError> {
    let mut channel = controller.open_session_channel().await?;

    debug!("Channel opened for {}, requesting PTY", label);

    channel
        .request_pty(false, &pty.term, pty.cols, pty.rows, 0, 0, &[])
        .await
        .map_err(|e| SshError::ChannelError(format!("PTY request failed: {}", e)))?;

    channel
        .request_shell(false)
        .await
        .map_err(|e| SshError::ChannelError(format!("Shell request failed: {}", e)))?;

    info!("Interactive shell started for {}", label);

    let (cmd_tx, mut cmd_rx) = mpsc::channel::<SessionCommand>(1024);
    let (event_tx, event_rx) = mpsc::channel::<ShellEvent>(1024);

    tokio::spawn(async move {
        let terminal = loop {
            tokio::select! {
                Some(cmd) = cmd_rx.recv() => {
                    match cmd {
                        SessionCommand::Data(data) => {
                            if let Err(e) = channel.data(&data[..]).await {
                                error!("Failed to send data to SSH channel for {}: {}", label, e);
                                break ShellEvent::Failed(e.to_string());
                            }
                        }
                        SessionCommand::Resize(cols, rows) => {
                            if let Err(e) = channel.window_change(cols as u32, rows as u32, 0, 0).await {
                                // Resize failures leave the shell usable
                                error!("Failed to resize PTY for {}: {}", label, e);
                            } else {
                                debug!("PTY resized to {}x{} for {}", cols, rows, label);
                            }
                        }
                        SessionCommand::Close => {
                            debug!("Close command received for {}", label);
                            let _ = channel.eof().await;
                            break ShellEvent::Closed;
                        }
                    }
                }

                Some(msg) = channel.wait() => {
                    let event = match msg {
                        ChannelMsg::Data { data } => Some(ShellEvent::Output(Bytes::copy_from_slice(&data))),
                        // ext 1 is stderr
                        ChannelMsg::ExtendedData { data, ext: 1 } => {
                            Some(ShellEvent::Output(Bytes::copy_from_slice(&data)))
                        }
                        ChannelMsg::ExitStatus { exit_status } => {
                            info!("Shell for {} exited with status {}", label, exit_status);
                            Some(ShellEvent::ExitStatus(exit_status))
                        }
                        ChannelMsg::Eof | ChannelMsg::Close => {
                            info!("SSH channel closed for {}", label);
                            break ShellEvent::Closed;
                        }
                        _ => None,
                    };
                    if let Some(event) = event {
                        if event_tx.send(event).await.is_err() {
                            debug!("Shell event receiver dropped for {}", label);
                            let _ = channel.eof().await;
                            return;
                        }
                    }
                }

                else => break ShellEvent::Closed,
            }
        };

        let _ = event_tx.send(terminal).await;
        debug!("Shell channel task terminated for {}", label);
    });

    Ok(ShellChannel::new(cmd_tx, event_rx))
}
