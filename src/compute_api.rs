//! Thin anti-corruption layer over the generated GCE REST client
//! (`gcloud_sdk::google_rest_apis::compute_v1`). Every other module in this
//! crate works with the small domain types defined here and the
//! `CloudBackend` trait instead of the generated OpenAPI structs directly,
//! so a single place absorbs the generated client's verbose `Option<Box<_>>`
//! shape, and callers can be driven by a fake in tests.

use crate::cloud_auth::JwtTokenSource;
use crate::error::{CloudOperationError, OperationErrorEntry, ProviderError};
use async_trait::async_trait;
use gcloud_sdk::google_rest_apis::compute_v1::configuration::Configuration;
use gcloud_sdk::google_rest_apis::compute_v1::{
    images_api, instance_groups_api, instances_api, machine_types_api, networks_api, operation, zone_operations_api,
    zones_api, AccessConfig, AttachedDisk, AttachedDiskInitializeParams, Error as ApiError, Instance as ApiInstance,
    InstanceGroupsAddInstancesRequest, InstanceReference, Metadata, MetadataItemsInner, NetworkInterface, Scheduling,
    ServiceAccount, Tags,
};

const BASE_PATH: &str = "https://compute.googleapis.com/compute/v1";

#[derive(Debug, Clone)]
pub struct ZoneInfo {
    pub self_link: String,
}

#[derive(Debug, Clone)]
pub struct MachineTypeInfo {
    pub self_link: String,
}

#[derive(Debug, Clone)]
pub struct NetworkInfo {
    pub self_link: String,
}

#[derive(Debug, Clone)]
pub struct ImageInfo {
    pub name: String,
    pub self_link: String,
}

#[derive(Debug, Clone, Default)]
pub struct AccessConfigInfo {
    pub nat_ip: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NetworkInterfaceInfo {
    pub access_configs: Vec<AccessConfigInfo>,
}

#[derive(Debug, Clone)]
pub struct InstanceInfo {
    pub name: String,
    pub self_link: Option<String>,
    pub network_interfaces: Vec<NetworkInterfaceInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Pending,
    Running,
    Done,
}

#[derive(Debug, Clone)]
pub struct ZoneOperation {
    pub name: String,
    pub status: OperationStatus,
    pub error: Option<CloudOperationError>,
}

/// Everything the instance builder (C4) needs to declare before `Insert`.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub name: String,
    pub machine_type_self_link: String,
    pub source_image_self_link: String,
    pub disk_type_self_link: String,
    pub disk_size_gb: u32,
    pub network_self_link: String,
    pub startup_script: String,
    pub description: String,
}

/// The cloud-control-plane operations this crate needs, abstracted so the
/// rest of the crate can be driven by a fake (see `tests/support`) without
/// caring what the real client's wire format looks like.
#[async_trait]
pub trait CloudBackend: Send + Sync {
    async fn get_zone(&self, zone: &str) -> Result<ZoneInfo, ProviderError>;
    async fn get_machine_type(&self, zone: &str, machine_type: &str) -> Result<MachineTypeInfo, ProviderError>;
    async fn get_network(&self, network: &str) -> Result<NetworkInfo, ProviderError>;
    async fn list_images(&self, filter: &str) -> Result<Vec<ImageInfo>, ProviderError>;
    async fn insert_instance(&self, zone: &str, spec: &InstanceSpec) -> Result<ZoneOperation, ProviderError>;
    async fn get_instance(&self, zone: &str, name: &str) -> Result<InstanceInfo, ProviderError>;
    async fn delete_instance(&self, zone: &str, name: &str) -> Result<ZoneOperation, ProviderError>;
    async fn add_instance_to_group(&self, zone: &str, group: &str, instance_self_link: &str) -> Result<ZoneOperation, ProviderError>;
    async fn get_zone_operation(&self, zone: &str, operation_name: &str) -> Result<ZoneOperation, ProviderError>;
}

pub struct ComputeClient {
    project: String,
    token_source: std::sync::Arc<JwtTokenSource>,
    http: reqwest::Client,
}

fn map_api_err<T>(e: ApiError<T>) -> ProviderError {
    match e {
        ApiError::ResponseError(content) => {
            ProviderError::cloud_transport(anyhow::format_err!("compute API request failed: {} {}", content.status, content.content))
        }
        ApiError::Reqwest(e) => ProviderError::cloud_transport(e),
        ApiError::Serde(e) => ProviderError::cloud_transport(e),
        ApiError::Io(e) => ProviderError::cloud_transport(e),
    }
}

fn to_operation(op: gcloud_sdk::google_rest_apis::compute_v1::Operation) -> ZoneOperation {
    let name = op.name.clone().unwrap_or_default();
    let status = match op.status {
        Some(operation::Status::Pending) => OperationStatus::Pending,
        Some(operation::Status::Running) => OperationStatus::Running,
        Some(operation::Status::Done) => OperationStatus::Done,
        None => OperationStatus::Pending,
    };
    let error = op.error.map(|err| CloudOperationError {
        entries: err
            .errors
            .unwrap_or_default()
            .into_iter()
            .map(|entry| OperationErrorEntry {
                code: entry.code.unwrap_or_default(),
                location: entry.location,
                message: entry.message.unwrap_or_default(),
            })
            .collect(),
    });
    ZoneOperation { name, status, error }
}

impl ComputeClient {
    pub fn new(project: String, account_json: &str) -> Result<Self, ProviderError> {
        let token_source = std::sync::Arc::new(JwtTokenSource::from_account_json(account_json)?);
        let http = token_source.http_client();
        Ok(ComputeClient { project, token_source, http })
    }

    async fn configuration(&self) -> Result<Configuration, ProviderError> {
        let token = self.token_source.access_token().await?;
        Ok(Configuration { base_path: BASE_PATH.to_owned(), client: self.http.clone(), oauth_access_token: Some(token), ..Default::default() })
    }
}

#[async_trait]
impl CloudBackend for ComputeClient {
    async fn get_zone(&self, zone: &str) -> Result<ZoneInfo, ProviderError> {
        let configuration = self.configuration().await?;
        let result = zones_api::compute_zones_get(
            &configuration,
            zones_api::ComputePeriodZonesPeriodGetParams { project: self.project.clone(), zone: zone.to_owned(), ..Default::default() },
        )
        .await
        .map_err(map_api_err)?;
        Ok(ZoneInfo { self_link: result.self_link.ok_or_else(|| ProviderError::Setup(format!("zone {zone} has no self_link")))? })
    }

    async fn get_machine_type(&self, zone: &str, machine_type: &str) -> Result<MachineTypeInfo, ProviderError> {
        let configuration = self.configuration().await?;
        let result = machine_types_api::compute_machine_types_get(
            &configuration,
            machine_types_api::ComputePeriodMachineTypesPeriodGetParams {
                project: self.project.clone(),
                zone: zone.to_owned(),
                machine_type: machine_type.to_owned(),
                ..Default::default()
            },
        )
        .await
        .map_err(map_api_err)?;
        Ok(MachineTypeInfo {
            self_link: result.self_link.ok_or_else(|| ProviderError::Setup(format!("machine type {machine_type} has no self_link")))?,
        })
    }

    async fn get_network(&self, network: &str) -> Result<NetworkInfo, ProviderError> {
        let configuration = self.configuration().await?;
        let result = networks_api::compute_networks_get(
            &configuration,
            networks_api::ComputePeriodNetworksPeriodGetParams { project: self.project.clone(), network: network.to_owned(), ..Default::default() },
        )
        .await
        .map_err(map_api_err)?;
        Ok(NetworkInfo { self_link: result.self_link.ok_or_else(|| ProviderError::Setup(format!("network {network} has no self_link")))? })
    }

    async fn list_images(&self, filter: &str) -> Result<Vec<ImageInfo>, ProviderError> {
        let configuration = self.configuration().await?;
        let result = images_api::compute_images_list(
            &configuration,
            images_api::ComputePeriodImagesPeriodListParams { project: self.project.clone(), filter: Some(filter.to_owned()), ..Default::default() },
        )
        .await
        .map_err(map_api_err)?;
        Ok(result
            .items
            .unwrap_or_default()
            .into_iter()
            .filter_map(|image| Some(ImageInfo { name: image.name?, self_link: image.self_link.unwrap_or_default() }))
            .collect())
    }

    async fn insert_instance(&self, zone: &str, spec: &InstanceSpec) -> Result<ZoneOperation, ProviderError> {
        let configuration = self.configuration().await?;
        let instance = ApiInstance {
            name: Some(spec.name.clone()),
            description: Some(spec.description.clone()),
            machine_type: Some(spec.machine_type_self_link.clone()),
            disks: Some(vec![AttachedDisk {
                boot: Some(true),
                auto_delete: Some(true),
                initialize_params: Some(Box::new(AttachedDiskInitializeParams {
                    source_image: Some(spec.source_image_self_link.clone()),
                    disk_type: Some(spec.disk_type_self_link.clone()),
                    disk_size_gb: Some(spec.disk_size_gb.to_string()),
                    ..Default::default()
                })),
                ..Default::default()
            }]),
            scheduling: Some(Box::new(Scheduling { preemptible: Some(true), ..Default::default() })),
            tags: Some(Box::new(Tags { items: Some(vec!["testing".to_owned()]), ..Default::default() })),
            network_interfaces: Some(vec![NetworkInterface {
                network: Some(spec.network_self_link.clone()),
                access_configs: Some(vec![AccessConfig { ..Default::default() }]),
                ..Default::default()
            }]),
            service_accounts: Some(vec![ServiceAccount {
                email: Some("default".to_owned()),
                scopes: Some(vec![
                    "https://www.googleapis.com/auth/userinfo.email".to_owned(),
                    "https://www.googleapis.com/auth/devstorage.full_control".to_owned(),
                    "https://www.googleapis.com/auth/compute".to_owned(),
                ]),
                ..Default::default()
            }]),
            metadata: Some(Box::new(Metadata {
                items: Some(vec![MetadataItemsInner { key: Some("startup-script".to_owned()), value: Some(spec.startup_script.clone()) }]),
                ..Default::default()
            })),
            ..Default::default()
        };

        let op = instances_api::compute_instances_insert(
            &configuration,
            instances_api::ComputePeriodInstancesPeriodInsertParams {
                project: self.project.clone(),
                zone: zone.to_owned(),
                instance: Some(instance),
                ..Default::default()
            },
        )
        .await
        .map_err(map_api_err)?;
        Ok(to_operation(op))
    }

    async fn get_instance(&self, zone: &str, name: &str) -> Result<InstanceInfo, ProviderError> {
        let configuration = self.configuration().await?;
        let instance = instances_api::compute_instances_get(
            &configuration,
            instances_api::ComputePeriodInstancesPeriodGetParams { project: self.project.clone(), zone: zone.to_owned(), instance: name.to_owned(), ..Default::default() },
        )
        .await
        .map_err(map_api_err)?;
        Ok(InstanceInfo {
            name: instance.name.unwrap_or_else(|| name.to_owned()),
            self_link: instance.self_link,
            network_interfaces: instance
                .network_interfaces
                .unwrap_or_default()
                .into_iter()
                .map(|interface| NetworkInterfaceInfo {
                    access_configs: interface
                        .access_configs
                        .unwrap_or_default()
                        .into_iter()
                        .map(|ac| AccessConfigInfo { nat_ip: ac.nat_ip })
                        .collect(),
                })
                .collect(),
        })
    }

    async fn delete_instance(&self, zone: &str, name: &str) -> Result<ZoneOperation, ProviderError> {
        let configuration = self.configuration().await?;
        let op = instances_api::compute_instances_delete(
            &configuration,
            instances_api::ComputePeriodInstancesPeriodDeleteParams {
                project: self.project.clone(),
                zone: zone.to_owned(),
                instance: name.to_owned(),
                ..Default::default()
            },
        )
        .await
        .map_err(map_api_err)?;
        Ok(to_operation(op))
    }

    async fn add_instance_to_group(&self, zone: &str, group: &str, instance_self_link: &str) -> Result<ZoneOperation, ProviderError> {
        let configuration = self.configuration().await?;
        let op = instance_groups_api::compute_instance_groups_add_instances(
            &configuration,
            instance_groups_api::ComputePeriodInstanceGroupsPeriodAddInstancesParams {
                project: self.project.clone(),
                zone: zone.to_owned(),
                instance_group: group.to_owned(),
                instance_groups_add_instances_request: Some(InstanceGroupsAddInstancesRequest {
                    instances: Some(vec![InstanceReference { instance: Some(instance_self_link.to_owned()) }]),
                }),
                ..Default::default()
            },
        )
        .await
        .map_err(map_api_err)?;
        Ok(to_operation(op))
    }

    async fn get_zone_operation(&self, zone: &str, operation_name: &str) -> Result<ZoneOperation, ProviderError> {
        let configuration = self.configuration().await?;
        let op = zone_operations_api::compute_zone_operations_get(
            &configuration,
            zone_operations_api::ComputePeriodZoneOperationsPeriodGetParams {
                project: self.project.clone(),
                zone: zone.to_owned(),
                operation: operation_name.to_owned(),
                ..Default::default()
            },
        )
        .await
        .map_err(map_api_err)?;
        Ok(to_operation(op))
    }
}
