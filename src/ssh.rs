// Copyright (c) Loads Orchestrator Contributors
// SPDX-License-Identifier: Apache-2.0

//! SSH connection handling (C2). Grounded on `SSH`/`EC2Instance.connect` in
//! `original_source/loadsbroker/aws.py` and `extensions.py`, reimplemented
//! with `russh` instead of `paramiko` per the teacher workspace's stack.
//!
//! Sessions are scoped resources: every acquisition guarantees the
//! underlying channel and session are closed on all exit paths, including
//! failure, by virtue of being dropped at the end of the call that opened
//! them (spec section 5).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::ChannelMsg;
use tracing::debug;

use crate::error::{OrchestratorError, Result};

struct SilentHandler;

#[async_trait]
impl client::Handler for SilentHandler {
    type Error = russh::Error;

    // The fleet is ephemeral and keys are never pinned ahead of time, so
    // we accept whatever host key the instance presents -- matching
    // paramiko's `AutoAddPolicy` in the original implementation.
    async fn check_server_key(&mut self, _server_public_key: &russh_keys::key::PublicKey) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Connects to instances over SSH, execs commands, and uploads files.
pub struct SshRunner {
    user: String,
    key_path: String,
    connect_timeout: Duration,
}

impl SshRunner {
    pub fn new(user: impl Into<String>, key_path: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            key_path: key_path.into(),
            connect_timeout: Duration::from_secs(15),
        }
    }

    /// Opens an SSH session to `address` (`ip:22`) as the configured
    /// system user with the configured key file.
    pub async fn connect(&self, address: &str) -> Result<Handle<SilentHandler>> {
        let config = Arc::new(client::Config {
            connection_timeout: Some(self.connect_timeout),
            ..Default::default()
        });
        let mut session = client::connect(config, address, SilentHandler)
            .await
            .map_err(|e| OrchestratorError::Ssh(format!("connect to {address}: {e}")))?;

        let key_pair = russh_keys::load_secret_key(Path::new(&self.key_path), None)
            .map_err(|e| OrchestratorError::Ssh(format!("load key {}: {e}", self.key_path)))?;
        let authenticated = session
            .authenticate_publickey(&self.user, Arc::new(key_pair))
            .await
            .map_err(|e| OrchestratorError::Ssh(format!("authenticate to {address}: {e}")))?;
        if !authenticated {
            return Err(OrchestratorError::Ssh(format!("authentication rejected by {address}")));
        }
        Ok(session)
    }

    /// Runs `cmd` on `address`, returning its combined stdout bytes. The
    /// channel is closed on return regardless of outcome.
    pub async fn exec(&self, address: &str, cmd: &str) -> Result<Vec<u8>> {
        let session = self.connect(address).await?;
        let result = Self::exec_on_session(&session, cmd).await;
        result
    }

    async fn exec_on_session(session: &Handle<SilentHandler>, cmd: &str) -> Result<Vec<u8>> {
        let mut channel = session
            .channel_open_session()
            .await
            .map_err(|e| OrchestratorError::Ssh(format!("open channel: {e}")))?;
        channel
            .exec(true, cmd)
            .await
            .map_err(|e| OrchestratorError::Ssh(format!("exec {cmd:?}: {e}")))?;

        let mut stdout = Vec::new();
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status } if exit_status != 0 => {
                    debug!(cmd, exit_status, "remote command exited non-zero");
                }
                ChannelMsg::Eof | ChannelMsg::Close => break,
                _ => {}
            }
        }
        Ok(stdout)
    }

    /// Uploads `content` to `remote_path` on `address`, ensuring parent
    /// directories exist first. The original implementation used SFTP
    /// (`sftp.putfo` after `makedirs`); the teacher's SSH stack carries no
    /// SFTP subsystem, so this streams the payload through a remote shell
    /// (`mkdir -p ... && cat > ...`) over the exec channel's stdin, which
    /// preserves the same two guarantees: parent directories exist, and
    /// the file is written in full before the channel closes.
    pub async fn upload_file(&self, address: &str, content: &[u8], remote_path: &str) -> Result<()> {
        let parent = Path::new(remote_path)
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let session = self.connect(address).await?;
        let mut channel = session
            .channel_open_session()
            .await
            .map_err(|e| OrchestratorError::Ssh(format!("open channel: {e}")))?;
        let cmd = format!("mkdir -p {parent} && cat > {remote_path}");
        channel
            .exec(true, cmd.as_str())
            .await
            .map_err(|e| OrchestratorError::Ssh(format!("exec upload: {e}")))?;
        channel
            .data(content)
            .await
            .map_err(|e| OrchestratorError::Ssh(format!("write upload data: {e}")))?;
        channel
            .eof()
            .await
            .map_err(|e| OrchestratorError::Ssh(format!("send eof: {e}")))?;
        while let Some(msg) = channel.wait().await {
            if matches!(msg, ChannelMsg::Eof | ChannelMsg::Close) {
                break;
            }
        }
        Ok(())
    }

    /// Applies `/etc/sysctl.conf` on the instance (used by
    /// `RunManager::_initialize`).
    pub async fn reload_sysctl(&self, address: &str) -> Result<Vec<u8>> {
        self.exec(address, "sudo sysctl -p /etc/sysctl.conf").await
    }
}
