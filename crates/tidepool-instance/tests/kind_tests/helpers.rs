//! Shared setup for live-cluster scenarios

use std::sync::Arc;

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};

use tidepool_common::kube_utils::create_client;
use tidepool_common::telemetry::{init_logging, LogConfig};
use tidepool_instance::{Dependencies, KubeClusterClient, Settings, Testbed};

/// Testbed backed by the current kubeconfig context
pub async fn live_testbed() -> Testbed {
    // several tests share the process-wide subscriber
    let _ = init_logging(LogConfig::default());

    let settings = Settings::from_env().expect("invalid TIDEPOOL_* settings");
    let client = create_client(None).await.expect("no cluster reachable");
    ensure_namespace(&client, &settings.namespace).await;

    let cluster = KubeClusterClient::new(client, settings.namespace.clone());
    Testbed::new(Dependencies::new(Arc::new(cluster), settings))
}

async fn ensure_namespace(client: &kube::Client, name: &str) {
    let api: Api<Namespace> = Api::all(client.clone());
    if api.get_opt(name).await.expect("failed to look up namespace").is_some() {
        return;
    }
    let namespace = Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    api.create(&PostParams::default(), &namespace)
        .await
        .expect("failed to create namespace");
}
