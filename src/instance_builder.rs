use crate::compute_api::InstanceSpec;
use crate::config::AutoImplode;

/// Everything resolved by `Setup`, immutable for the provider's lifetime.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    pub zone_self_link: String,
    pub zone: String,
    pub machine_type_self_link: String,
    pub network_self_link: String,
    pub disk_type_self_link: String,
    pub disk_size_gb: u32,
    pub ssh_pub_key: String,
    pub auto_implode: AutoImplode,
}

impl InstanceConfig {
    pub fn disk_type_self_link_for(zone: &str) -> String {
        format!("zones/{zone}/diskTypes/pd-ssd")
    }
}

/// Renders the instance's `startup-script` metadata value.
///
/// ```text
/// #!/usr/bin/env bash
/// echo poweroff | at now + {N} minutes   (only if auto-implode is enabled)
/// cat > ~travis/.ssh/authorized_keys <<EOF
/// {pub key}
/// EOF
/// ```
pub fn render_startup_script(auto_implode: AutoImplode, ssh_pub_key: &str) -> String {
    let mut script = String::from("#!/usr/bin/env bash\n");
    if auto_implode.enabled {
        script.push_str(&format!("echo poweroff | at now + {} minutes\n", auto_implode.hard_timeout_minutes));
    }
    script.push_str("cat > ~travis/.ssh/authorized_keys <<EOF\n");
    script.push_str(ssh_pub_key);
    script.push_str("\nEOF\n");
    script
}

/// Produces the declarative instance spec handed to `ComputeClient::insert_instance`.
/// The image's name (as opposed to its self-link) isn't part of the wire
/// spec; callers track it separately for the `Instance` handle's `id()`.
pub fn build_instance_spec(config: &InstanceConfig, image_self_link: &str, language: &str) -> InstanceSpec {
    InstanceSpec {
        name: format!("testing-gce-{}", uuid::Uuid::new_v4()),
        machine_type_self_link: config.machine_type_self_link.clone(),
        source_image_self_link: image_self_link.to_owned(),
        disk_type_self_link: config.disk_type_self_link.clone(),
        disk_size_gb: config.disk_size_gb,
        network_self_link: config.network_self_link.clone(),
        startup_script: render_startup_script(config.auto_implode, &config.ssh_pub_key),
        description: format!("Travis CI {language} test VM"),
    }
}
