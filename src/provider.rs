use crate::compute_api::{CloudBackend, ComputeClient, InstanceInfo};
use crate::config::{ConfigStore, ProviderOptions};
use crate::context::Context;
use crate::error::ProviderError;
use crate::image_resolver::{ImageResolver, ResolvedImage, StartAttributes};
use crate::instance_builder::{build_instance_spec, InstanceConfig};
use crate::lifecycle;
use crate::metrics::{MetricsSink, NoopMetricsSink};
use crate::ssh::{self, RunResult as SshRunResult};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWrite;

pub struct RunResult {
    pub completed: bool,
    pub exit_code: u8,
}

impl From<SshRunResult> for RunResult {
    fn from(r: SshRunResult) -> Self {
        RunResult { completed: r.completed, exit_code: r.exit_code }
    }
}

#[async_trait]
pub trait VmBuildProvider {
    async fn setup(&mut self) -> Result<(), ProviderError>;
    async fn start(&self, ctx: &Context, attrs: &StartAttributes) -> Result<GceInstance, ProviderError>;
}

#[async_trait]
pub trait BuildInstance {
    async fn upload_script(&self, ctx: &Context, script: &[u8]) -> Result<(), ProviderError>;
    async fn run_script(&self, ctx: &Context, out: Box<dyn AsyncWrite + Unpin + Send>) -> Result<RunResult, ProviderError>;
    async fn stop(&self, ctx: &Context) -> Result<(), ProviderError>;
    fn id(&self) -> String;
}

/// The GCE-backed `VmBuildProvider`. Registry metadata (`NAME`,
/// `DESCRIPTION`, `config_help`) is provided so a worker-side provider
/// registry can list and document this backend without depending on any
/// type from this crate besides the trait above.
pub struct GceProvider {
    store: Arc<dyn ConfigStore>,
    options: ProviderOptions,
    compute: Arc<dyn CloudBackend>,
    image_resolver: ImageResolver,
    ssh_signer: Arc<russh::keys::key::KeyPair>,
    ssh_pub_key: String,
    metrics: Arc<dyn MetricsSink>,
    instance_config: Option<Arc<InstanceConfig>>,
}

impl GceProvider {
    pub const NAME: &'static str = "gce";
    pub const DESCRIPTION: &'static str = "Google Compute Engine";

    pub fn config_help() -> &'static [(&'static str, &'static str)] {
        &[
            ("PROJECT_ID", "cloud project namespace (required)"),
            ("ACCOUNT_JSON", "service-account credentials, inline JSON or path (required)"),
            ("SSH_KEY_PATH", "path to the PEM-encoded private key used to authenticate to guests (required)"),
            ("SSH_PUB_KEY_PATH", "path to the matching public key, installed into each guest (required)"),
            ("SSH_KEY_PASSPHRASE", "passphrase for SSH_KEY_PATH, if encrypted"),
            ("ZONE", "compute zone (default: us-central1-a)"),
            ("MACHINE_TYPE", "machine type (default: n1-standard-2)"),
            ("NETWORK", "network name (default: default)"),
            ("DISK_SIZE", "boot disk size in GiB (default: 20)"),
            ("IMAGE_SELECTOR_TYPE", "legacy | env | api (default: legacy)"),
            ("IMAGE_SELECTOR_URL", "external image-selector base URL (required when IMAGE_SELECTOR_TYPE=api)"),
            ("IMAGE_DEFAULT", "fallback image-name filter (default: travis-ci-mega.+)"),
            ("DEFAULT_LANGUAGE", "legacy-mode fallback language (default: minimal)"),
            ("INSTANCE_GROUP", "instance group new instances join, if set"),
            ("BOOT_POLL_SLEEP", "seconds between cloud-operation polls (default: 3)"),
            ("UPLOAD_RETRIES", "SFTP upload attempts (default: 10)"),
            ("UPLOAD_RETRY_SLEEP", "seconds between SFTP attempts (default: 5)"),
            ("AUTO_IMPLODE", "inject guest-side self-poweroff (default: true)"),
            ("HARD_TIMEOUT_MINUTES", "self-poweroff offset in minutes (default: 130)"),
        ]
    }

    pub fn new(store: Arc<dyn ConfigStore>) -> Result<Self, ProviderError> {
        Self::with_metrics(store, Arc::new(NoopMetricsSink))
    }

    pub fn with_metrics(store: Arc<dyn ConfigStore>, metrics: Arc<dyn MetricsSink>) -> Result<Self, ProviderError> {
        let options = ProviderOptions::from_store(store.as_ref())?;
        let compute: Arc<dyn CloudBackend> = Arc::new(ComputeClient::new(options.project_id.clone(), &options.account_json)?);

        let key_pem = std::fs::read_to_string(&options.ssh.key_path)
            .map_err(|e| ProviderError::Config(format!("reading SSH_KEY_PATH {:?}: {e}", options.ssh.key_path)))?;
        let ssh_signer = Arc::new(
            russh::keys::decode_secret_key(&key_pem, options.ssh.passphrase.as_deref())
                .map_err(|e| ProviderError::Config(format!("decoding SSH private key: {e}")))?,
        );
        let ssh_pub_key = std::fs::read_to_string(&options.ssh.pub_key_path)
            .map_err(|e| ProviderError::Config(format!("reading SSH_PUB_KEY_PATH {:?}: {e}", options.ssh.pub_key_path)))?
            .trim()
            .to_owned();

        let image_resolver = match options.image_selector_type {
            crate::config::ImageSelectorType::Legacy => ImageResolver::legacy(options.default_language.clone()),
            crate::config::ImageSelectorType::Env => ImageResolver::env(options.image_default.clone()),
            crate::config::ImageSelectorType::Api => ImageResolver::api(
                options.image_selector_url.clone().expect("validated present by ProviderOptions::from_store"),
                options.image_default.clone(),
            ),
        };

        Ok(GceProvider { store, options, compute, image_resolver, ssh_signer, ssh_pub_key, metrics, instance_config: None })
    }
}

#[async_trait]
impl VmBuildProvider for GceProvider {
    async fn setup(&mut self) -> Result<(), ProviderError> {
        let zone = self.compute.get_zone(&self.options.zone).await?;
        let machine_type = self.compute.get_machine_type(&self.options.zone, &self.options.machine_type).await?;
        let network = self.compute.get_network(&self.options.network).await?;

        let config = InstanceConfig {
            zone_self_link: zone.self_link,
            zone: self.options.zone.clone(),
            machine_type_self_link: machine_type.self_link,
            network_self_link: network.self_link,
            disk_type_self_link: InstanceConfig::disk_type_self_link_for(&self.options.zone),
            disk_size_gb: self.options.disk_size_gb,
            ssh_pub_key: self.ssh_pub_key.clone(),
            auto_implode: self.options.auto_implode,
        };
        log::info!("setup complete: zone={} machine_type={} network={}", self.options.zone, self.options.machine_type, self.options.network);
        self.instance_config = Some(Arc::new(config));
        Ok(())
    }

    async fn start(&self, ctx: &Context, attrs: &StartAttributes) -> Result<GceInstance, ProviderError> {
        let config = self.instance_config.clone().ok_or_else(|| ProviderError::Setup("start called before setup".into()))?;

        let ResolvedImage { name: image_name, self_link: image_self_link } =
            self.image_resolver.resolve(self.compute.as_ref(), self.store.as_ref(), attrs).await?;

        let language = attrs.language.as_deref().unwrap_or(&self.options.default_language);
        let spec = build_instance_spec(&config, &image_self_link, language);

        let instance = lifecycle::start_instance(
            ctx,
            self.compute.clone(),
            &self.options.zone,
            &spec,
            self.options.instance_group.as_deref(),
            self.options.boot_poll_sleep,
            self.metrics.as_ref(),
        )
        .await?;

        Ok(GceInstance {
            compute: self.compute.clone(),
            config,
            zone: self.options.zone.clone(),
            instance_name: spec.name.clone(),
            image_name,
            ssh_signer: self.ssh_signer.clone(),
            upload_retries: self.options.upload_retries,
            upload_retry_sleep: self.options.upload_retry_sleep,
            boot_poll_sleep: self.options.boot_poll_sleep,
            instance: Mutex::new(instance),
        })
    }
}

/// A live GCE instance returned by `GceProvider::start`. `upload_script`,
/// `run_script`, and `stop` all operate on this handle.
pub struct GceInstance {
    compute: Arc<dyn CloudBackend>,
    config: Arc<InstanceConfig>,
    zone: String,
    instance_name: String,
    image_name: String,
    ssh_signer: Arc<russh::keys::key::KeyPair>,
    upload_retries: u32,
    upload_retry_sleep: std::time::Duration,
    boot_poll_sleep: std::time::Duration,
    instance: Mutex<InstanceInfo>,
}

impl GceInstance {
    async fn refresh_ip(&self) -> Result<std::net::Ipv4Addr, ProviderError> {
        let refreshed = self.compute.get_instance(&self.zone, &self.instance_name).await?;
        let ip = lifecycle::extract_ip(&refreshed);
        *self.instance.lock().unwrap() = refreshed;
        ip
    }
}

#[async_trait]
impl BuildInstance for GceInstance {
    async fn upload_script(&self, ctx: &Context, script: &[u8]) -> Result<(), ProviderError> {
        let ip = self.refresh_ip().await?;
        ssh::upload_with_retry(ctx, ip, self.ssh_signer.clone(), script, self.upload_retries, self.upload_retry_sleep).await
    }

    async fn run_script(&self, ctx: &Context, mut out: Box<dyn AsyncWrite + Unpin + Send>) -> Result<RunResult, ProviderError> {
        let ip = self.refresh_ip().await?;
        let attempt = async {
            let session = ssh::dial(ip, self.ssh_signer.clone()).await?;
            ssh::run_script(&session, &mut out).await
        };
        tokio::select! {
            result = attempt => result.map(RunResult::from),
            () = ctx.done() => Err(ctx.err()),
        }
    }

    async fn stop(&self, ctx: &Context) -> Result<(), ProviderError> {
        lifecycle::stop_instance(ctx, self.compute.clone(), &self.zone, &self.instance_name, self.boot_poll_sleep).await
    }

    fn id(&self) -> String {
        format!("{}:{}", self.instance_name, self.image_name)
    }
}
