//! A fake `CloudBackend` driving an in-memory zone-operation state machine,
//! so the lifecycle orchestrator can be exercised end to end without talking
//! to GCE.

use gce_build_provider::compute_api::{
    AccessConfigInfo, CloudBackend, ImageInfo, InstanceInfo, InstanceSpec, MachineTypeInfo, NetworkInfo,
    NetworkInterfaceInfo, OperationStatus, ZoneInfo, ZoneOperation,
};
use gce_build_provider::{CloudOperationError, ProviderError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

pub const TEST_ZONE: &str = "us-central1-a";

/// Best-effort logging setup so `RUST_LOG=debug` surfaces the orchestrator's
/// `log::debug!`/`log::info!` output during a local test run.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// What an operation does when polled.
#[derive(Clone)]
pub enum OpBehavior {
    /// Reports DONE with no error on the very first poll.
    ImmediateSuccess,
    /// Reports DONE with the given error payload on the first poll.
    ImmediateFailure(CloudOperationError),
    /// Reports RUNNING forever; never reaches DONE.
    NeverCompletes,
}

struct FakeOperation {
    behavior: OpBehavior,
}

pub struct FakeCloudBackend {
    operations: Mutex<HashMap<String, FakeOperation>>,
    instances: Mutex<HashMap<String, InstanceInfo>>,
    next_op_id: AtomicU32,
    pending_insert_behavior: Mutex<Option<OpBehavior>>,
    pub nat_ip: String,
}

impl FakeCloudBackend {
    pub fn new() -> Self {
        FakeCloudBackend {
            operations: Mutex::new(HashMap::new()),
            instances: Mutex::new(HashMap::new()),
            next_op_id: AtomicU32::new(0),
            pending_insert_behavior: Mutex::new(None),
            nat_ip: "203.0.113.10".to_owned(),
        }
    }

    fn new_operation(&self, behavior: OpBehavior) -> String {
        let id = self.next_op_id.fetch_add(1, Ordering::SeqCst);
        let name = format!("operation-{id}");
        self.operations.lock().unwrap().insert(name.clone(), FakeOperation { behavior });
        name
    }

    /// Forces the operation created by the next `insert_instance` call to
    /// behave as given, instead of succeeding immediately.
    pub fn with_insert_behavior(self, behavior: OpBehavior) -> Self {
        self.pending_insert_behavior.lock().unwrap().replace(behavior);
        self
    }
}

#[async_trait::async_trait]
impl CloudBackend for FakeCloudBackend {
    async fn get_zone(&self, zone: &str) -> Result<ZoneInfo, ProviderError> {
        Ok(ZoneInfo { self_link: format!("projects/test/zones/{zone}") })
    }

    async fn get_machine_type(&self, zone: &str, machine_type: &str) -> Result<MachineTypeInfo, ProviderError> {
        Ok(MachineTypeInfo { self_link: format!("projects/test/zones/{zone}/machineTypes/{machine_type}") })
    }

    async fn get_network(&self, network: &str) -> Result<NetworkInfo, ProviderError> {
        Ok(NetworkInfo { self_link: format!("projects/test/global/networks/{network}") })
    }

    async fn list_images(&self, _filter: &str) -> Result<Vec<ImageInfo>, ProviderError> {
        Ok(vec![ImageInfo { name: "travis-ci-ruby-2026-01-01".into(), self_link: "projects/test/global/images/travis-ci-ruby-2026-01-01".into() }])
    }

    async fn insert_instance(&self, _zone: &str, spec: &InstanceSpec) -> Result<ZoneOperation, ProviderError> {
        let behavior = self.pending_insert_behavior.lock().unwrap().take().unwrap_or(OpBehavior::ImmediateSuccess);
        let name = self.new_operation(behavior);
        self.instances.lock().unwrap().insert(
            spec.name.clone(),
            InstanceInfo {
                name: spec.name.clone(),
                self_link: Some(format!("projects/test/zones/{TEST_ZONE}/instances/{}", spec.name)),
                network_interfaces: vec![NetworkInterfaceInfo { access_configs: vec![AccessConfigInfo { nat_ip: Some(self.nat_ip.clone()) }] }],
            },
        );
        Ok(ZoneOperation { name, status: OperationStatus::Pending, error: None })
    }

    async fn get_instance(&self, _zone: &str, name: &str) -> Result<InstanceInfo, ProviderError> {
        self.instances.lock().unwrap().get(name).cloned().ok_or_else(|| ProviderError::Setup(format!("no such instance {name}")))
    }

    async fn delete_instance(&self, _zone: &str, name: &str) -> Result<ZoneOperation, ProviderError> {
        self.instances.lock().unwrap().remove(name);
        Ok(ZoneOperation { name: self.new_operation(OpBehavior::ImmediateSuccess), status: OperationStatus::Pending, error: None })
    }

    async fn add_instance_to_group(&self, _zone: &str, _group: &str, _instance_self_link: &str) -> Result<ZoneOperation, ProviderError> {
        Ok(ZoneOperation { name: self.new_operation(OpBehavior::ImmediateSuccess), status: OperationStatus::Pending, error: None })
    }

    async fn get_zone_operation(&self, _zone: &str, operation_name: &str) -> Result<ZoneOperation, ProviderError> {
        let operations = self.operations.lock().unwrap();
        let op = operations.get(operation_name).ok_or_else(|| ProviderError::Setup(format!("no such operation {operation_name}")))?;
        match &op.behavior {
            OpBehavior::ImmediateSuccess => Ok(ZoneOperation { name: operation_name.to_owned(), status: OperationStatus::Done, error: None }),
            OpBehavior::ImmediateFailure(err) => {
                Ok(ZoneOperation { name: operation_name.to_owned(), status: OperationStatus::Done, error: Some(err.clone()) })
            }
            OpBehavior::NeverCompletes => Ok(ZoneOperation { name: operation_name.to_owned(), status: OperationStatus::Running, error: None }),
        }
    }
}
