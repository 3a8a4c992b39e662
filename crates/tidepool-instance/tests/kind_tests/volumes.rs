//! Volume contents across a stop and restart

use super::helpers::live_testbed;

#[tokio::test]
#[ignore = "requires a Kubernetes cluster"]
async fn volume_survives_restart() {
    let mut testbed = live_testbed().await;

    let store = testbed.create_instance("store").unwrap();
    testbed.set_image(store, "busybox:1.36").await.unwrap();
    testbed.commit(store).await.unwrap();
    {
        let instance = testbed.instance_mut(store).unwrap();
        instance.set_command(["sleep", "infinity"]).unwrap();
        instance.add_volume_with_owner("/data", "100Mi", 1000).unwrap();
    }

    testbed.start(store).await.unwrap();
    testbed
        .execute_command(store, ["echo", "persisted", ">", "/data/marker"])
        .await
        .unwrap();

    // stderr of a failed command reaches the caller
    let err = testbed
        .execute_command(store, ["ls", "/data/missing"])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("No such file"));

    testbed.stop(store).await.unwrap();
    testbed.wait_stopped(store).await.unwrap();
    testbed.start(store).await.unwrap();

    let marker = testbed.read_file(store, "/data/marker").await.unwrap();
    assert_eq!(String::from_utf8_lossy(&marker).trim(), "persisted");
}
