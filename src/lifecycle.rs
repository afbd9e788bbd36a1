use crate::compute_api::{CloudBackend, InstanceInfo, InstanceSpec, OperationStatus};
use crate::context::Context;
use crate::error::ProviderError;
use crate::metrics::{MetricsSink, METRIC_BOOT_TIMEOUT_COUNTER, METRIC_BOOT_TIMER};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Issues a best-effort `Instances.Delete` on drop unless `disarm()` was
/// called on the success path. The idiomatic stand-in for "clean up unless
/// we got all the way to done".
struct AbandonGuard {
    client: Arc<dyn CloudBackend>,
    zone: String,
    name: String,
    armed: bool,
}

impl AbandonGuard {
    fn new(client: Arc<dyn CloudBackend>, zone: String, name: String) -> Self {
        AbandonGuard { client, zone, name, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let client = self.client.clone();
        let zone = self.zone.clone();
        let name = self.name.clone();
        tokio::spawn(async move {
            log::error!("abandoning instance {name}: issuing best-effort delete");
            if let Err(e) = client.delete_instance(&zone, &name).await {
                log::error!("abandonment delete of {name} failed: {e}");
            }
        });
    }
}

/// Polls a zone operation by name until it reaches `DONE`, sending the
/// terminal outcome over a capacity-1 channel so the poller can always
/// complete its send and exit even if the caller has already returned.
/// Takes its own clone of `ctx` so a deadline expiring (not just an explicit
/// cancel) stops the poller too.
fn spawn_operation_poller(
    client: Arc<dyn CloudBackend>,
    zone: String,
    operation_name: String,
    poll_sleep: Duration,
    ctx: Context,
) -> mpsc::Receiver<Result<(), ProviderError>> {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = ctx.done() => return,
                result = client.get_zone_operation(&zone, &operation_name) => {
                    match result {
                        Ok(op) => {
                            log::debug!("operation {operation_name} status={:?}", op.status);
                            match (op.status, op.error) {
                                (OperationStatus::Done, None) => {
                                    let _ = tx.send(Ok(())).await;
                                    return;
                                }
                                (OperationStatus::Done, Some(err)) => {
                                    log::error!("operation {operation_name} failed: {err}");
                                    let _ = tx.send(Err(ProviderError::CloudOperation(err))).await;
                                    return;
                                }
                                (_, Some(err)) => {
                                    log::error!("operation {operation_name} reported a mid-flight error: {err}");
                                    let _ = tx.send(Err(ProviderError::CloudOperation(err))).await;
                                    return;
                                }
                                (_, None) => {
                                    tokio::select! {
                                        () = ctx.done() => return,
                                        () = tokio::time::sleep(poll_sleep) => {}
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    }
                }
            }
        }
    });
    rx
}

/// Inserts the instance declared by `spec`, waits for it to become ready,
/// optionally joins `instance_group`, and returns the refreshed instance
/// info. Honors `ctx` throughout; any non-success exit after the insert is
/// issued triggers a best-effort delete via `AbandonGuard`.
pub async fn start_instance(
    ctx: &Context,
    client: Arc<dyn CloudBackend>,
    zone: &str,
    spec: &InstanceSpec,
    instance_group: Option<&str>,
    poll_sleep: Duration,
    metrics: &dyn MetricsSink,
) -> Result<InstanceInfo, ProviderError> {
    let started_at = Instant::now();
    let insert_op = client.insert_instance(zone, spec).await?;
    log::info!("instance {} inserted as operation {}", spec.name, insert_op.name);

    let guard = AbandonGuard::new(client.clone(), zone.to_owned(), spec.name.clone());

    let mut insert_rx = spawn_operation_poller(client.clone(), zone.to_owned(), insert_op.name.clone(), poll_sleep, ctx.clone());

    let insert_result = tokio::select! {
        result = insert_rx.recv() => result.unwrap_or_else(|| Err(ProviderError::cloud_transport(anyhow::format_err!("operation poller dropped without a result")))),
        () = ctx.done() => {
            let err = ctx.err();
            if matches!(err, ProviderError::DeadlineExceeded) {
                metrics.increment_counter(METRIC_BOOT_TIMEOUT_COUNTER);
            }
            return Err(err);
        }
    };
    insert_result?;
    log::info!("instance {} ready", spec.name);

    let instance = match instance_group {
        None => client.get_instance(zone, &spec.name).await?,
        Some(group) => {
            let refreshed = client.get_instance(zone, &spec.name).await?;
            let self_link = refreshed
                .self_link
                .clone()
                .ok_or_else(|| ProviderError::cloud_transport(anyhow::format_err!("instance has no self_link to join a group with")))?;

            let join_op = client.add_instance_to_group(zone, group, &self_link).await?;
            log::info!("instance {} joining group {group} via operation {}", spec.name, join_op.name);
            let mut join_rx = spawn_operation_poller(client.clone(), zone.to_owned(), join_op.name.clone(), poll_sleep, ctx.clone());

            let join_result = tokio::select! {
                result = join_rx.recv() => result.unwrap_or_else(|| Err(ProviderError::cloud_transport(anyhow::format_err!("operation poller dropped without a result")))),
                () = ctx.done() => {
                    let err = ctx.err();
                    if matches!(err, ProviderError::DeadlineExceeded) {
                        metrics.increment_counter(METRIC_BOOT_TIMEOUT_COUNTER);
                    }
                    return Err(err);
                }
            };
            join_result?;
            log::info!("instance {} joined group {group}", spec.name);
            refreshed
        }
    };

    metrics.record_duration(METRIC_BOOT_TIMER, started_at.elapsed());
    guard.disarm();
    Ok(instance)
}

/// Extracts the first non-empty NAT IP across every network interface's
/// access configs.
pub fn extract_ip(instance: &InstanceInfo) -> Result<std::net::Ipv4Addr, ProviderError> {
    instance
        .network_interfaces
        .iter()
        .flat_map(|interface| interface.access_configs.iter())
        .filter_map(|ac| ac.nat_ip.as_deref())
        .find(|ip| !ip.is_empty())
        .ok_or_else(|| ProviderError::Setup("no IP address found".into()))?
        .parse()
        .map_err(|e| ProviderError::Setup(format!("invalid IP address: {e}")))
}

/// Deletes the instance and waits for the delete operation to complete.
pub async fn stop_instance(ctx: &Context, client: Arc<dyn CloudBackend>, zone: &str, name: &str, poll_sleep: Duration) -> Result<(), ProviderError> {
    let op = client.delete_instance(zone, name).await?;
    let mut rx = spawn_operation_poller(client, zone.to_owned(), op.name.clone(), poll_sleep, ctx.clone());
    tokio::select! {
        result = rx.recv() => result.unwrap_or_else(|| Err(ProviderError::cloud_transport(anyhow::format_err!("operation poller dropped without a result")))),
        () = ctx.done() => Err(ctx.err()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute_api::{AccessConfigInfo, NetworkInterfaceInfo};

    #[test]
    fn extract_ip_skips_empty_and_missing_access_configs() {
        let instance = InstanceInfo {
            name: "i".into(),
            self_link: None,
            network_interfaces: vec![
                NetworkInterfaceInfo { access_configs: vec![] },
                NetworkInterfaceInfo {
                    access_configs: vec![AccessConfigInfo { nat_ip: Some(String::new()) }, AccessConfigInfo { nat_ip: Some("1.2.3.4".into()) }],
                },
            ],
        };
        assert_eq!(extract_ip(&instance).unwrap().to_string(), "1.2.3.4");
    }

    #[test]
    fn extract_ip_fails_when_nothing_is_assigned() {
        let instance = InstanceInfo { name: "i".into(), self_link: None, network_interfaces: vec![] };
        assert!(matches!(extract_ip(&instance), Err(ProviderError::Setup(_))));
    }
}
