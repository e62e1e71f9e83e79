use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

use seedling_core::ManagedResource;
use seedling_store::EventRecorder;

/// Publishes Kubernetes Events on the control plane. Failures are logged only.
#[derive(Clone)]
pub struct KubeEventRecorder {
    client: Client,
    reporter: Reporter,
}

impl KubeEventRecorder {
    pub fn new(client: Client, controller: impl Into<String>) -> Self {
        let reporter = Reporter { controller: controller.into(), instance: std::env::var("POD_NAME").ok() };
        Self { client, reporter }
    }
}

fn object_reference(obj: &ManagedResource) -> ObjectReference {
    ObjectReference {
        api_version: Some(obj.kind.api_version()),
        kind: Some(obj.kind.kind_name().to_string()),
        name: Some(obj.name.clone()),
        namespace: obj.namespace.clone(),
        uid: obj.uid.clone(),
        resource_version: obj.resource_version.clone(),
        ..Default::default()
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn warning(&self, obj: &ManagedResource, reason: &str, message: &str) {
        warn!(kind = %obj.kind, key = %obj.key(), reason, message, "event: warning");
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), object_reference(obj));
        let event = Event {
            type_: EventType::Warning,
            reason: reason.to_string(),
            note: Some(message.to_string()),
            action: "Reconciling".to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(event).await {
            warn!(kind = %obj.kind, key = %obj.key(), error = %e, "event: publish failed");
        }
    }
}
