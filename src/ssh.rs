use crate::error::{ProviderError, StaleVmError};
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

const SSH_USER: &str = "travis";
const SSH_PORT: u16 = 22;
const BUILD_SCRIPT_PATH: &str = "build.sh";

pub struct ClientHandler;

#[async_trait::async_trait]
impl russh::client::Handler for ClientHandler {
    type Error = russh::Error;

    /// No host-key verification: these are single-use, ephemeral VMs and
    /// the worker has no prior knowledge of their host key.
    async fn check_server_key(&mut self, _server_public_key: &russh::keys::key::PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Opens an authenticated SSH session to `ip:22` as user `travis` using
/// `signer`.
pub async fn dial(ip: std::net::Ipv4Addr, signer: Arc<russh::keys::key::KeyPair>) -> Result<russh::client::Handle<ClientHandler>, ProviderError> {
    let config = Arc::new(russh::client::Config::default());
    let stream = TcpStream::connect((ip, SSH_PORT)).await.map_err(ProviderError::cloud_transport)?;
    let mut session =
        russh::client::connect_stream(config, stream, ClientHandler).await.map_err(ProviderError::cloud_transport)?;

    let authenticated = session.authenticate_publickey(SSH_USER, signer).await.map_err(ProviderError::cloud_transport)?;
    if !authenticated {
        return Err(ProviderError::cloud_transport(anyhow::format_err!("SSH public-key authentication rejected")));
    }
    Ok(session)
}

/// Uploads `script` as `build.sh` in the remote home directory over SFTP.
/// Returns `ProviderError::StaleVm` if the file already exists (the VM has
/// been used before) without writing anything.
pub async fn upload_script(session: &russh::client::Handle<ClientHandler>, script: &[u8]) -> Result<(), ProviderError> {
    let channel = session.channel_open_session().await.map_err(ProviderError::cloud_transport)?;
    channel.request_subsystem(true, "sftp").await.map_err(ProviderError::cloud_transport)?;
    let sftp = russh_sftp::client::SftpSession::new(channel.into_stream()).await.map_err(ProviderError::cloud_transport)?;

    if sftp.symlink_metadata(BUILD_SCRIPT_PATH).await.is_ok() {
        return Err(ProviderError::StaleVm(StaleVmError));
    }

    let mut file = sftp.create(BUILD_SCRIPT_PATH).await.map_err(ProviderError::cloud_transport)?;
    file.write_all(script).await.map_err(ProviderError::cloud_transport)?;
    file.shutdown().await.map_err(ProviderError::cloud_transport)?;
    sftp.close().await.map_err(ProviderError::cloud_transport)?;
    Ok(())
}

pub struct RunResult {
    pub completed: bool,
    pub exit_code: u8,
}

/// Runs `bash ~/build.sh` over a PTY-backed session, streaming combined
/// stdout/stderr to `out`.
pub async fn run_script(
    session: &russh::client::Handle<ClientHandler>,
    mut out: impl AsyncWrite + Unpin + Send,
) -> Result<RunResult, ProviderError> {
    let mut channel: Channel<Msg> = session.channel_open_session().await.map_err(ProviderError::cloud_transport)?;
    channel
        .request_pty(true, "xterm", 80, 40, 0, 0, &[])
        .await
        .map_err(ProviderError::cloud_transport)?;
    channel.exec(true, "bash ~/build.sh").await.map_err(ProviderError::cloud_transport)?;

    let mut exit_code = None;
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } => {
                out.write_all(&data).await.map_err(|e| ProviderError::RemoteUnknown(e.into()))?;
            }
            ChannelMsg::ExtendedData { data, ext: 1 } => {
                out.write_all(&data).await.map_err(|e| ProviderError::RemoteUnknown(e.into()))?;
            }
            ChannelMsg::ExitStatus { exit_status } => {
                exit_code = Some(exit_status);
            }
            _ => {}
        }
    }
    channel.close().await.map_err(ProviderError::cloud_transport)?;

    match exit_code {
        Some(code) => Ok(RunResult { completed: true, exit_code: code as u8 }),
        None => Err(ProviderError::RemoteUnknown(anyhow::format_err!("channel closed without an exit status"))),
    }
}

/// Repeatedly dials and attempts `upload_script` until it succeeds, the
/// retry budget is exhausted, or `ctx` finishes first. The stale-VM sentinel
/// is never retried.
pub async fn upload_with_retry(
    ctx: &crate::context::Context,
    ip: std::net::Ipv4Addr,
    signer: Arc<russh::keys::key::KeyPair>,
    script: &[u8],
    retries: u32,
    retry_sleep: std::time::Duration,
) -> Result<(), ProviderError> {
    retry_loop(ctx, retries, retry_sleep, |_attempt| async {
        let session = dial(ip, signer.clone()).await?;
        upload_script(&session, script).await
    })
    .await
}

/// The attempt-counting, stale-VM-short-circuiting retry policy shared by
/// `upload_with_retry`, pulled out from the actual dial/upload so it can be
/// exercised with a fake attempt closure in tests.
async fn retry_loop<F, Fut>(ctx: &crate::context::Context, retries: u32, retry_sleep: std::time::Duration, mut try_once: F) -> Result<(), ProviderError>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<(), ProviderError>>,
{
    let attempt = async {
        let mut last_err = None;
        for attempt in 0..=retries {
            match try_once(attempt).await {
                Ok(()) => return Ok(()),
                Err(ProviderError::StaleVm(e)) => return Err(ProviderError::StaleVm(e)),
                Err(e) => {
                    log::warn!("upload attempt {attempt} failed: {e}");
                    last_err = Some(e);
                    if attempt < retries {
                        tokio::select! {
                            () = tokio::time::sleep(retry_sleep) => {}
                            () = ctx.done() => return Err(ctx.err()),
                        }
                    }
                }
            }
        }
        Err(ProviderError::Upload { attempts: retries + 1, source: last_err.map(Into::into).unwrap_or_else(|| anyhow::format_err!("no attempts made")) })
    };

    tokio::select! {
        result = attempt => result,
        () = ctx.done() => Err(ctx.err()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn build_script_path_and_user_are_fixed_by_the_guest_contract() {
        assert_eq!(BUILD_SCRIPT_PATH, "build.sh");
        assert_eq!(SSH_USER, "travis");
        assert_eq!(SSH_PORT, 22);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_loop_gives_up_after_retries_plus_one_attempts() {
        let calls = AtomicU32::new(0);
        let ctx = Context::background();
        let result = retry_loop(&ctx, 2, std::time::Duration::from_secs(1), |_attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::cloud_transport(anyhow::format_err!("connection refused"))) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(result, Err(ProviderError::Upload { attempts: 3, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_loop_stops_as_soon_as_an_attempt_succeeds() {
        let calls = AtomicU32::new(0);
        let ctx = Context::background();
        let result = retry_loop(&ctx, 5, std::time::Duration::from_secs(1), |_attempt| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { if n >= 1 { Ok(()) } else { Err(ProviderError::cloud_transport(anyhow::format_err!("not yet"))) } }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_loop_never_retries_a_stale_vm_result() {
        let calls = AtomicU32::new(0);
        let ctx = Context::background();
        let result = retry_loop(&ctx, 5, std::time::Duration::from_secs(1), |_attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::StaleVm(StaleVmError)) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(ProviderError::StaleVm(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_loop_honors_a_context_deadline_over_the_retry_budget() {
        let ctx = Context::with_timeout(std::time::Duration::from_millis(500));
        let result = retry_loop(&ctx, 1000, std::time::Duration::from_secs(1), |_attempt| async {
            Err(ProviderError::cloud_transport(anyhow::format_err!("still down")))
        })
        .await;

        assert!(matches!(result, Err(ProviderError::DeadlineExceeded)));
    }
}
