//! Local port forwarding to running instances

use tokio::net::TcpListener;
use tokio::time::Instant;
use tracing::info;

use crate::instance::InstanceId;
use crate::state::Operation;
use crate::testbed::Testbed;
use tidepool_common::retry::{retry_with_backoff, RetryConfig};
use tidepool_common::Error;

impl Testbed {
    /// Forward a free local port to `port` of the instance and return it
    ///
    /// The tunnel is retried with a fixed delay; a freshly probed local port
    /// can be taken by another process before the tunnel binds it.
    pub async fn port_forward_tcp(&self, id: InstanceId, port: u16) -> Result<u16, Error> {
        let idx = self.index(id)?;
        let instance = &self.instances[idx];
        instance.guard(Operation::PortForward)?;
        let name = instance.name();
        let operation = Operation::PortForward.as_str();

        if !instance.ports_tcp().contains(&port) {
            return Err(Error::validation_for(
                name,
                format!("TCP port {} is not registered", port),
            ));
        }

        let local_port = free_local_port()
            .await
            .map_err(|e| Error::collaborator(name, operation, e))?;
        let cluster = &self.deps.cluster;
        let pod = cluster
            .first_pod(&self.pod_owner(idx)?)
            .await
            .map_err(|e| Error::collaborator(name, operation, e))?;

        let settings = &self.deps.settings;
        let attempts = settings.port_forward_attempts;
        let retry = RetryConfig::fixed(attempts, settings.port_forward_retry_delay());
        let started = Instant::now();
        let tunnel = retry_with_backoff(&retry, "port_forward", || {
            cluster.port_forward(&pod, local_port, port)
        });

        tokio::select! {
            result = tunnel => result.map_err(|e| {
                Error::collaborator(
                    name,
                    operation,
                    format!("tunnel not established after {} attempts: {}", attempts, e),
                )
            })?,
            _ = self.cancel.cancelled() => {
                return Err(Error::timeout(name, operation, started.elapsed()));
            }
        }

        info!(instance = %name, pod = %pod, local_port, remote_port = port, "Forwarded port");
        Ok(local_port)
    }
}

/// Ask the OS for an unused port on the loopback interface
async fn free_local_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::test_support::{committed, Fixture};

    async fn started(fixture: Fixture) -> (Testbed, InstanceId) {
        let mut testbed = fixture.testbed();
        let web = committed(&mut testbed, "web", "nginx").await;
        testbed.instance_mut(web).unwrap().add_port_tcp(8080).unwrap();
        testbed.start_without_wait(web).await.unwrap();
        (testbed, web)
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_the_tunnel_opens() {
        let mut fixture = Fixture::new();
        fixture.expect_deploy();
        fixture
            .cluster
            .expect_first_pod()
            .returning(|_| Ok("web-00000000-x1".to_string()));
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        fixture.cluster.expect_port_forward().returning(move |pod, local, remote| {
            assert_eq!(pod, "web-00000000-x1");
            assert_ne!(local, 0);
            assert_eq!(remote, 8080);
            match counter.fetch_add(1, Ordering::SeqCst) {
                0 | 1 => Err(Error::validation("address in use")),
                _ => Ok(()),
            }
        });

        let (testbed, web) = started(fixture).await;
        let local = testbed.port_forward_tcp(web, 8080).await.unwrap();
        assert_ne!(local, 0);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_names_the_attempt_count() {
        let mut fixture = Fixture::new();
        fixture.expect_deploy();
        fixture
            .cluster
            .expect_first_pod()
            .returning(|_| Ok("web-00000000-x1".to_string()));
        fixture
            .cluster
            .expect_port_forward()
            .times(5)
            .returning(|_, _, _| Err(Error::validation("connection refused")));

        let (testbed, web) = started(fixture).await;
        let err = testbed.port_forward_tcp(web, 8080).await.unwrap_err();
        assert!(err.to_string().contains("after 5 attempts"));
    }

    #[tokio::test]
    async fn unregistered_port_is_rejected() {
        let mut fixture = Fixture::new();
        fixture.expect_deploy();
        fixture.cluster.expect_port_forward().never();
        let (testbed, web) = started(fixture).await;
        let err = testbed.port_forward_tcp(web, 9090).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test]
    async fn requires_started() {
        let mut testbed = Fixture::new().testbed();
        let web = committed(&mut testbed, "web", "nginx").await;
        testbed.instance_mut(web).unwrap().add_port_tcp(8080).unwrap();
        assert!(testbed.port_forward_tcp(web, 8080).await.unwrap_err().is_state_violation());
    }
}
