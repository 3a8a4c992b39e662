//! An nginx instance from prebuilt image to stopped pod

use tidepool_instance::{InstanceState, ProbeSpec};

use super::helpers::live_testbed;

#[tokio::test]
#[ignore = "requires a Kubernetes cluster"]
async fn nginx_serves_and_stops() {
    let mut testbed = live_testbed().await;

    let web = testbed.create_instance("web").unwrap();
    testbed.set_image(web, "nginx:1.27").await.unwrap();
    testbed.commit(web).await.unwrap();
    {
        let instance = testbed.instance_mut(web).unwrap();
        instance.add_port_tcp(80).unwrap();
        instance.set_env("NGINX_ENTRYPOINT_QUIET_LOGS", "1").unwrap();
        instance
            .set_readiness_probe(ProbeSpec::http_get("/", 80))
            .unwrap();
    }

    testbed.start(web).await.unwrap();
    assert!(testbed.is_running(web).await.unwrap());

    let address = testbed.address(web).await.unwrap();
    assert!(!address.is_empty());

    let page = testbed
        .read_file(web, "/usr/share/nginx/html/index.html")
        .await
        .unwrap();
    assert!(String::from_utf8_lossy(&page).contains("nginx"));

    let local = testbed.port_forward_tcp(web, 80).await.unwrap();
    assert_ne!(local, 0);

    testbed.stop(web).await.unwrap();
    testbed.wait_stopped(web).await.unwrap();
    assert_eq!(testbed.instance(web).unwrap().state(), InstanceState::Stopped);
}
