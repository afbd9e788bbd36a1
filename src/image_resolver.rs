use crate::compute_api::{CloudBackend, ImageInfo};
use crate::config::{image_alias_lookup, language_map_lookup, normalize_alias_key, ConfigStore};
use crate::error::ProviderError;

/// The subset of a job's attributes the resolver reads.
#[derive(Debug, Clone, Default)]
pub struct StartAttributes {
    pub language: Option<String>,
    pub osx_image: Option<String>,
    pub dist: Option<String>,
    pub group: Option<String>,
    pub os: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedImage {
    pub name: String,
    pub self_link: String,
}

/// Candidate name source for env/api modes: a raw name that may still be the
/// `"default"` sentinel, to be substituted with `image_default` before the
/// final filtered lookup.
struct CandidateName(String);

/// Picks a boot image for a job via one of three strategies. A closed,
/// compile-time-known set of variants, so an enum rather than a trait
/// object.
pub enum ImageResolver {
    Legacy { default_language: String },
    Env { image_default: String },
    Api { url: String, image_default: String },
}

impl ImageResolver {
    pub fn legacy(default_language: String) -> Self {
        ImageResolver::Legacy { default_language }
    }

    pub fn env(image_default: String) -> Self {
        ImageResolver::Env { image_default }
    }

    pub fn api(url: String, image_default: String) -> Self {
        ImageResolver::Api { url, image_default }
    }

    pub async fn resolve(
        &self,
        client: &dyn CloudBackend,
        store: &dyn ConfigStore,
        attrs: &StartAttributes,
    ) -> Result<ResolvedImage, ProviderError> {
        match self {
            ImageResolver::Legacy { default_language } => resolve_legacy(client, store, attrs, default_language).await,
            ImageResolver::Env { image_default } => {
                let name = env_alias_candidates(attrs)
                    .iter()
                    .find_map(|key| image_alias_lookup(store, key))
                    .unwrap_or_else(|| "default".to_owned());
                resolve_named(client, substitute_default(CandidateName(name), image_default)).await
            }
            ImageResolver::Api { url, image_default } => {
                let name = query_image_selector(url, attrs).await?;
                resolve_named(client, substitute_default(CandidateName(name), image_default)).await
            }
        }
    }
}

fn substitute_default(name: CandidateName, image_default: &str) -> String {
    if name.0 == "default" {
        image_default.to_owned()
    } else {
        name.0
    }
}

async fn resolve_legacy(
    client: &dyn CloudBackend,
    store: &dyn ConfigStore,
    attrs: &StartAttributes,
    default_language: &str,
) -> Result<ResolvedImage, ProviderError> {
    let mut candidates = Vec::new();
    if let Some(lang) = &attrs.language {
        match language_map_lookup(store, lang) {
            Some(mapped) => candidates.push(mapped),
            None => candidates.push(lang.clone()),
        }
    }
    candidates.push(default_language.to_owned());

    let mut last_err = None;
    for lang in candidates {
        let filter = format!("name eq ^travis-ci-{lang}.+");
        match pick_greatest(client, &filter).await {
            Ok(image) => return Ok(image),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| ProviderError::Setup("no language candidates to resolve an image for".into())))
}

async fn resolve_named(client: &dyn CloudBackend, name: String) -> Result<ResolvedImage, ProviderError> {
    let filter = format!("name eq ^{name}");
    pick_greatest(client, &filter).await
}

async fn pick_greatest(client: &dyn CloudBackend, filter: &str) -> Result<ResolvedImage, ProviderError> {
    let images = client.list_images(filter).await?;
    let best = images.into_iter().max_by(|a, b| a.name.cmp(&b.name));
    match best {
        Some(ImageInfo { name, self_link }) => Ok(ResolvedImage { name, self_link }),
        None => Err(ProviderError::Setup(format!("no image found with filter {filter}"))),
    }
}

/// Alias key precedence for env mode, most specific first. `resolve()` walks
/// this list in order and takes the first key actually present in the
/// config store, rather than only ever forming the single most-specific one.
fn env_alias_candidates(attrs: &StartAttributes) -> Vec<String> {
    let lang = attrs.language.as_deref();
    [
        attrs.osx_image.as_deref().zip(lang).map(|(osx, l)| format!("osx_image_{osx}_{l}")),
        attrs.osx_image.as_deref().map(|osx| format!("osx_image_{osx}")),
        attrs.dist.as_deref().zip(lang).map(|(dist, l)| format!("dist_{dist}_{l}")),
        attrs.dist.as_deref().map(|dist| format!("dist_{dist}")),
        attrs.group.as_deref().zip(lang).map(|(group, l)| format!("group_{group}_{l}")),
        attrs.group.as_deref().map(|group| format!("group_{group}")),
        lang.map(|l| format!("language_{l}")),
        attrs.os.as_deref().map(|os| format!("default_{os}")),
    ]
    .into_iter()
    .flatten()
    .map(|raw| normalize_alias_key(&raw))
    .collect()
}

#[derive(serde::Serialize)]
struct ImageSelectorRequest<'a> {
    infra: &'a str,
    language: Option<&'a str>,
    osx_image: Option<&'a str>,
    dist: Option<&'a str>,
    group: Option<&'a str>,
    os: Option<&'a str>,
}

#[derive(serde::Deserialize)]
struct ImageSelectorResponse {
    image: String,
}

async fn query_image_selector(url: &str, attrs: &StartAttributes) -> Result<String, ProviderError> {
    let body = ImageSelectorRequest {
        infra: "gce",
        language: attrs.language.as_deref(),
        osx_image: attrs.osx_image.as_deref(),
        dist: attrs.dist.as_deref(),
        group: attrs.group.as_deref(),
        os: attrs.os.as_deref(),
    };
    let response = reqwest::Client::new().get(url).query(&body).send().await.map_err(ProviderError::cloud_transport)?;
    if !response.status().is_success() {
        let status = response.status();
        return Err(ProviderError::cloud_transport(anyhow::format_err!("image selector returned {status}")));
    }
    let parsed: ImageSelectorResponse = response.json().await.map_err(ProviderError::cloud_transport)?;
    Ok(parsed.image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute_api::{InstanceInfo, InstanceSpec, MachineTypeInfo, NetworkInfo, ZoneInfo, ZoneOperation};
    use crate::config::MapConfigStore;

    /// A `CloudBackend` whose `list_images` answers by matching a
    /// substring against the requested filter; every other method is
    /// unreachable from `resolve()`.
    struct FakeImagesBackend {
        responses: Vec<(&'static str, Vec<ImageInfo>)>,
    }

    #[async_trait::async_trait]
    impl CloudBackend for FakeImagesBackend {
        async fn get_zone(&self, _zone: &str) -> Result<ZoneInfo, ProviderError> {
            unreachable!("not used by resolve()")
        }
        async fn get_machine_type(&self, _zone: &str, _machine_type: &str) -> Result<MachineTypeInfo, ProviderError> {
            unreachable!("not used by resolve()")
        }
        async fn get_network(&self, _network: &str) -> Result<NetworkInfo, ProviderError> {
            unreachable!("not used by resolve()")
        }
        async fn list_images(&self, filter: &str) -> Result<Vec<ImageInfo>, ProviderError> {
            Ok(self.responses.iter().find(|(needle, _)| filter.contains(needle)).map(|(_, images)| images.clone()).unwrap_or_default())
        }
        async fn insert_instance(&self, _zone: &str, _spec: &InstanceSpec) -> Result<ZoneOperation, ProviderError> {
            unreachable!("not used by resolve()")
        }
        async fn get_instance(&self, _zone: &str, _name: &str) -> Result<InstanceInfo, ProviderError> {
            unreachable!("not used by resolve()")
        }
        async fn delete_instance(&self, _zone: &str, _name: &str) -> Result<ZoneOperation, ProviderError> {
            unreachable!("not used by resolve()")
        }
        async fn add_instance_to_group(&self, _zone: &str, _group: &str, _instance_self_link: &str) -> Result<ZoneOperation, ProviderError> {
            unreachable!("not used by resolve()")
        }
        async fn get_zone_operation(&self, _zone: &str, _operation_name: &str) -> Result<ZoneOperation, ProviderError> {
            unreachable!("not used by resolve()")
        }
    }

    fn image(name: &str) -> ImageInfo {
        ImageInfo { name: name.to_owned(), self_link: format!("projects/test/global/images/{name}") }
    }

    #[tokio::test]
    async fn pick_greatest_breaks_ties_on_the_lexicographically_greatest_name() {
        let backend =
            FakeImagesBackend { responses: vec![("travis-ci-ruby", vec![image("travis-ci-ruby-2025-12-01"), image("travis-ci-ruby-2026-01-15")])] };
        let resolved = pick_greatest(&backend, "name eq ^travis-ci-ruby.+").await.unwrap();
        assert_eq!(resolved.name, "travis-ci-ruby-2026-01-15");
    }

    #[tokio::test]
    async fn resolve_legacy_falls_back_to_the_default_language_when_the_mapped_one_has_no_image() {
        let backend = FakeImagesBackend { responses: vec![("travis-ci-minimal", vec![image("travis-ci-minimal-2026-01-01")])] };
        let store = MapConfigStore::new();
        let resolver = ImageResolver::legacy("minimal".to_owned());
        let attrs = StartAttributes { language: Some("some-unmapped-language".into()), ..Default::default() };

        let resolved = resolver.resolve(&backend, &store, &attrs).await.unwrap();
        assert_eq!(resolved.name, "travis-ci-minimal-2026-01-01");
    }

    #[tokio::test]
    async fn resolve_env_mode_uses_the_configured_alias_and_substitutes_the_default_sentinel() {
        let backend = FakeImagesBackend { responses: vec![("travis-ci-mega", vec![image("travis-ci-mega-2026-02-01")])] };
        let store = MapConfigStore::from_pairs([("IMAGE_ALIAS_LANGUAGE_RUBY", "default")]);
        let resolver = ImageResolver::env("travis-ci-mega.+".to_owned());
        let attrs = StartAttributes { language: Some("ruby".into()), ..Default::default() };

        let resolved = resolver.resolve(&backend, &store, &attrs).await.unwrap();
        assert_eq!(resolved.name, "travis-ci-mega-2026-02-01");
    }

    #[test]
    fn env_alias_candidates_prefer_osx_image_over_dist() {
        let attrs = StartAttributes {
            language: Some("ruby".into()),
            osx_image: Some("xcode9".into()),
            dist: Some("trusty".into()),
            ..Default::default()
        };
        assert_eq!(
            env_alias_candidates(&attrs),
            vec!["OSX_IMAGE_XCODE9_RUBY", "OSX_IMAGE_XCODE9", "DIST_TRUSTY_RUBY", "DIST_TRUSTY", "LANGUAGE_RUBY"]
        );
    }

    #[test]
    fn env_alias_candidates_fall_back_to_default_os_when_nothing_else_set() {
        let attrs = StartAttributes { os: Some("linux".into()), ..Default::default() };
        assert_eq!(env_alias_candidates(&attrs), vec!["DEFAULT_LINUX"]);
    }

    #[tokio::test]
    async fn resolve_env_mode_falls_back_to_a_less_specific_alias_when_the_most_specific_is_unset() {
        let backend = FakeImagesBackend { responses: vec![("travis-ci-ruby-trusty", vec![image("travis-ci-ruby-trusty-2026-01-01")])] };
        let store = MapConfigStore::from_pairs([("IMAGE_ALIAS_DIST_TRUSTY", "travis-ci-ruby-trusty")]);
        let resolver = ImageResolver::env("travis-ci-mega.+".to_owned());
        let attrs = StartAttributes { language: Some("ruby".into()), dist: Some("trusty".into()), ..Default::default() };

        let resolved = resolver.resolve(&backend, &store, &attrs).await.unwrap();
        assert_eq!(resolved.name, "travis-ci-ruby-trusty-2026-01-01");
    }

    #[tokio::test]
    async fn resolve_env_mode_uses_image_default_when_no_alias_matches_at_all() {
        let backend = FakeImagesBackend { responses: vec![("travis-ci-mega", vec![image("travis-ci-mega-2026-02-01")])] };
        let store = MapConfigStore::new();
        let resolver = ImageResolver::env("travis-ci-mega.+".to_owned());
        let attrs = StartAttributes { language: Some("ruby".into()), ..Default::default() };

        let resolved = resolver.resolve(&backend, &store, &attrs).await.unwrap();
        assert_eq!(resolved.name, "travis-ci-mega-2026-02-01");
    }

    #[test]
    fn substitute_default_only_replaces_the_sentinel() {
        assert_eq!(substitute_default(CandidateName("default".into()), "travis-ci-mega.+"), "travis-ci-mega.+");
        assert_eq!(substitute_default(CandidateName("travis-ci-ruby".into()), "travis-ci-mega.+"), "travis-ci-ruby");
    }

    #[tokio::test]
    async fn query_image_selector_parses_the_selected_image_name() {
        let server = httpmock::MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET).path("/select").query_param("infra", "gce").query_param("language", "ruby");
                then.status(200).json_body(serde_json::json!({"image": "travis-ci-ruby-2026-01-01"}));
            })
            .await;

        let attrs = StartAttributes { language: Some("ruby".into()), ..Default::default() };
        let url = format!("{}/select", server.base_url());
        let image = query_image_selector(&url, &attrs).await.unwrap();

        mock.assert_async().await;
        assert_eq!(image, "travis-ci-ruby-2026-01-01");
    }

    #[tokio::test]
    async fn query_image_selector_surfaces_non_success_status_as_cloud_transport() {
        let server = httpmock::MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET).path("/select");
                then.status(500);
            })
            .await;

        let attrs = StartAttributes::default();
        let url = format!("{}/select", server.base_url());
        let err = query_image_selector(&url, &attrs).await.unwrap_err();
        assert!(matches!(err, ProviderError::CloudTransport(_)));
    }
}
