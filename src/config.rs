use crate::error::ProviderError;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

/// The worker's configuration store: a keyed string bag with a presence
/// test and set/unset, consumed by this crate but owned by the embedder.
/// `MapConfigStore` is the reference implementation, used by tests and by
/// callers who just want an in-process config bag.
pub trait ConfigStore: Send + Sync {
    fn is_set(&self, key: &str) -> bool;
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: String);
    fn unset(&self, key: &str);
}

/// In-memory `ConfigStore`, backed by a mutex-guarded map so that writes
/// performed during construction (e.g. `ZONE`'s write-back) are visible to
/// every holder of the same store.
#[derive(Default)]
pub struct MapConfigStore {
    inner: Mutex<HashMap<String, String>>,
}

impl MapConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let inner = pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        Self { inner: Mutex::new(inner) }
    }
}

impl ConfigStore for MapConfigStore {
    fn is_set(&self, key: &str) -> bool {
        self.inner.lock().unwrap().contains_key(key)
    }

    fn get(&self, key: &str) -> Option<String> {
        self.inner.lock().unwrap().get(key).cloned()
    }

    fn set(&self, key: &str, value: String) {
        self.inner.lock().unwrap().insert(key.to_owned(), value);
    }

    fn unset(&self, key: &str) {
        self.inner.lock().unwrap().remove(key);
    }
}

pub fn required(store: &dyn ConfigStore, key: &str) -> Result<String, ProviderError> {
    store.get(key).filter(|v| !v.is_empty()).ok_or_else(|| ProviderError::Config(format!("{key} is required")))
}

pub fn get_or(store: &dyn ConfigStore, key: &str, default: &str) -> String {
    store.get(key).filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_owned())
}

/// Parses an option with `FromStr`, fatal on malformed input (the policy for
/// every numeric/bool/duration option except `DISK_SIZE`).
pub fn parse_or<T>(store: &dyn ConfigStore, key: &str, default: T) -> Result<T, ProviderError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match store.get(key) {
        None => Ok(default),
        Some(raw) if raw.is_empty() => Ok(default),
        Some(raw) => raw.parse::<T>().map_err(|e| ProviderError::Config(format!("{key}={raw:?} is invalid: {e}"))),
    }
}

/// `DISK_SIZE` is the one option that silently falls back to its default
/// rather than failing construction, per the original behavior.
pub fn parse_disk_size_gb(store: &dyn ConfigStore, default_gb: u32) -> u32 {
    match store.get("DISK_SIZE") {
        None => default_gb,
        Some(raw) if raw.is_empty() => default_gb,
        Some(raw) => raw.parse::<u32>().unwrap_or_else(|e| {
            log::warn!("DISK_SIZE={raw:?} is invalid ({e}), falling back to default {default_gb}");
            default_gb
        }),
    }
}

pub fn parse_duration_secs_or(store: &dyn ConfigStore, key: &str, default_secs: u64) -> Result<Duration, ProviderError> {
    let secs = parse_or(store, key, default_secs)?;
    Ok(Duration::from_secs(secs))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSelectorType {
    Legacy,
    Env,
    Api,
}

impl FromStr for ImageSelectorType {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "legacy" => Ok(ImageSelectorType::Legacy),
            "env" => Ok(ImageSelectorType::Env),
            "api" => Ok(ImageSelectorType::Api),
            other => Err(ProviderError::Config(format!(
                "IMAGE_SELECTOR_TYPE={other:?} must be one of: legacy, env, api"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SshOptions {
    pub key_path: String,
    pub pub_key_path: String,
    pub passphrase: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct AutoImplode {
    pub enabled: bool,
    pub hard_timeout_minutes: u32,
}

/// Everything `GceProvider::new` resolves out of the `ConfigStore` before
/// `Setup` runs. `zone`/`machine_type`/`network` are plain strings here
/// (not yet looked up against the cloud API) — see `InstanceConfig` for the
/// post-`Setup` resolved form.
#[derive(Debug, Clone)]
pub struct ProviderOptions {
    pub project_id: String,
    pub account_json: String,
    pub ssh: SshOptions,
    pub zone: String,
    pub machine_type: String,
    pub network: String,
    pub disk_size_gb: u32,
    pub image_selector_type: ImageSelectorType,
    pub image_selector_url: Option<String>,
    pub image_default: String,
    pub default_language: String,
    pub instance_group: Option<String>,
    pub boot_poll_sleep: Duration,
    pub upload_retries: u32,
    pub upload_retry_sleep: Duration,
    pub auto_implode: AutoImplode,
}

impl ProviderOptions {
    pub fn from_store(store: &dyn ConfigStore) -> Result<Self, ProviderError> {
        let project_id = required(store, "PROJECT_ID")?;
        let account_json = required(store, "ACCOUNT_JSON")?;
        let ssh = SshOptions {
            key_path: required(store, "SSH_KEY_PATH")?,
            pub_key_path: required(store, "SSH_PUB_KEY_PATH")?,
            passphrase: store.get("SSH_KEY_PASSPHRASE").filter(|v| !v.is_empty()),
        };

        let zone = get_or(store, "ZONE", "us-central1-a");
        let machine_type = get_or(store, "MACHINE_TYPE", "n1-standard-2");
        let network = get_or(store, "NETWORK", "default");

        // Write the resolved values back so later readers of the same
        // store observe what this provider settled on.
        store.set("ZONE", zone.clone());
        store.set("MACHINE_TYPE", machine_type.clone());
        store.set("NETWORK", network.clone());

        let disk_size_gb = parse_disk_size_gb(store, 20);

        let image_selector_type_raw = get_or(store, "IMAGE_SELECTOR_TYPE", "legacy");
        let image_selector_type = image_selector_type_raw.parse()?;
        let image_selector_url = store.get("IMAGE_SELECTOR_URL").filter(|v| !v.is_empty());
        if image_selector_type == ImageSelectorType::Api && image_selector_url.is_none() {
            return Err(ProviderError::Config("IMAGE_SELECTOR_URL is required when IMAGE_SELECTOR_TYPE=api".into()));
        }

        let image_default = get_or(store, "IMAGE_DEFAULT", "travis-ci-mega.+");
        let default_language = get_or(store, "DEFAULT_LANGUAGE", "minimal");
        let instance_group = store.get("INSTANCE_GROUP").filter(|v| !v.is_empty());

        let boot_poll_sleep = parse_duration_secs_or(store, "BOOT_POLL_SLEEP", 3)?;
        let upload_retries = parse_or(store, "UPLOAD_RETRIES", 10u32)?;
        let upload_retry_sleep = parse_duration_secs_or(store, "UPLOAD_RETRY_SLEEP", 5)?;

        let auto_implode = AutoImplode {
            enabled: parse_or(store, "AUTO_IMPLODE", true)?,
            hard_timeout_minutes: parse_or(store, "HARD_TIMEOUT_MINUTES", 130u32)?,
        };

        Ok(ProviderOptions {
            project_id,
            account_json,
            ssh,
            zone,
            machine_type,
            network,
            disk_size_gb,
            image_selector_type,
            image_selector_url,
            image_default,
            default_language,
            instance_group,
            boot_poll_sleep,
            upload_retries,
            upload_retry_sleep,
            auto_implode,
        })
    }
}

/// Looks up `LANGUAGE_MAP_{UPPER(lang)}`, for legacy image selection.
pub fn language_map_lookup(store: &dyn ConfigStore, lang: &str) -> Option<String> {
    let key = format!("LANGUAGE_MAP_{}", lang.to_uppercase());
    store.get(&key).filter(|v| !v.is_empty())
}

/// Looks up an env-mode image alias, trying both `IMAGE_{ALIAS}` and
/// `IMAGE_ALIAS_{ALIAS}` spellings, where `alias` has already been
/// normalized to `[A-Z0-9_]`.
pub fn image_alias_lookup(store: &dyn ConfigStore, alias: &str) -> Option<String> {
    store
        .get(&format!("IMAGE_{alias}"))
        .or_else(|| store.get(&format!("IMAGE_ALIAS_{alias}")))
        .filter(|v| !v.is_empty())
}

/// Upper-cases and replaces every non-alphanumeric byte with `_`, per the
/// env-mode alias normalization rule.
pub fn normalize_alias_key(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}
