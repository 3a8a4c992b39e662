//! OpenTelemetry collector settings
//!
//! When any receiver or exporter is configured, a collector sidecar is
//! injected at start. Its configuration is generated here and shipped as a
//! file; the collector accepts JSON since it parses its config as YAML.

use serde_json::{json, Map, Value};
use tracing::debug;

use super::Instance;
use crate::state::Operation;
use tidepool_common::Error;

/// Receivers listen on every interface of the pod
fn endpoint(port: u16) -> String {
    format!("0.0.0.0:{}", port)
}

/// Collector version used unless overridden
pub const DEFAULT_OTEL_COLLECTOR_VERSION: &str = "0.83.0";

/// Path of the generated configuration inside the collector container
pub const OTEL_CONFIG_PATH: &str = "/etc/otel-agent.json";

/// Prometheus self-scrape target
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrometheusEndpoint {
    pub port: u16,
    pub job_name: String,
    pub scrape_interval: String,
}

/// Jaeger receiver ports
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JaegerEndpoint {
    pub grpc_port: u16,
    pub thrift_compact_port: u16,
    pub thrift_http_port: u16,
}

/// OTLP exporter with basic auth
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OtlpExporter {
    pub endpoint: String,
    pub username: String,
    pub password: String,
}

/// Receivers and exporters of the collector sidecar
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObservabilityConfig {
    pub collector_version: String,
    pub otlp_port: Option<u16>,
    pub prometheus_endpoint: Option<PrometheusEndpoint>,
    pub jaeger_endpoint: Option<JaegerEndpoint>,
    pub otlp_exporter: Option<OtlpExporter>,
    pub jaeger_exporter: Option<String>,
    pub prometheus_exporter: Option<String>,
    pub prometheus_remote_write_exporter: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            collector_version: DEFAULT_OTEL_COLLECTOR_VERSION.to_string(),
            otlp_port: None,
            prometheus_endpoint: None,
            jaeger_endpoint: None,
            otlp_exporter: None,
            jaeger_exporter: None,
            prometheus_exporter: None,
            prometheus_remote_write_exporter: None,
        }
    }
}

impl ObservabilityConfig {
    /// True if a collector sidecar is needed
    pub fn is_enabled(&self) -> bool {
        self.otlp_port.is_some()
            || self.prometheus_endpoint.is_some()
            || self.jaeger_endpoint.is_some()
            || self.otlp_exporter.is_some()
            || self.jaeger_exporter.is_some()
            || self.prometheus_exporter.is_some()
            || self.prometheus_remote_write_exporter.is_some()
    }

    /// TCP ports the collector listens on
    pub fn receiver_ports_tcp(&self) -> Vec<u16> {
        let mut ports = Vec::new();
        if let Some(port) = self.otlp_port {
            ports.push(port);
        }
        if let Some(jaeger) = &self.jaeger_endpoint {
            ports.extend([jaeger.grpc_port, jaeger.thrift_http_port]);
        }
        ports.retain(|p| *p != 0);
        ports
    }

    /// UDP ports the collector listens on (jaeger thrift compact)
    pub fn receiver_ports_udp(&self) -> Vec<u16> {
        self.jaeger_endpoint
            .iter()
            .map(|j| j.thrift_compact_port)
            .filter(|p| *p != 0)
            .collect()
    }

    /// Generate the collector configuration document
    pub fn collector_config(&self) -> Value {
        let mut receivers = Map::new();
        let mut exporters = Map::new();
        let mut extensions = Map::new();

        if let Some(port) = self.otlp_port {
            receivers.insert(
                "otlp".to_string(),
                json!({ "protocols": { "http": { "endpoint": endpoint(port) } } }),
            );
        }
        if let Some(prom) = &self.prometheus_endpoint {
            receivers.insert(
                "prometheus".to_string(),
                json!({
                    "config": {
                        "scrape_configs": [{
                            "job_name": prom.job_name,
                            "scrape_interval": prom.scrape_interval,
                            "static_configs": [{ "targets": [format!("localhost:{}", prom.port)] }],
                        }]
                    }
                }),
            );
        }
        if let Some(jaeger) = &self.jaeger_endpoint {
            receivers.insert(
                "jaeger".to_string(),
                json!({
                    "protocols": {
                        "grpc": { "endpoint": endpoint(jaeger.grpc_port) },
                        "thrift_compact": { "endpoint": endpoint(jaeger.thrift_compact_port) },
                        "thrift_http": { "endpoint": endpoint(jaeger.thrift_http_port) },
                    }
                }),
            );
        }

        if let Some(otlp) = &self.otlp_exporter {
            extensions.insert(
                "basicauth/otlp".to_string(),
                json!({ "client_auth": { "username": otlp.username, "password": otlp.password } }),
            );
            exporters.insert(
                "otlphttp".to_string(),
                json!({ "endpoint": otlp.endpoint, "auth": { "authenticator": "basicauth/otlp" } }),
            );
        }
        if let Some(endpoint) = &self.jaeger_exporter {
            exporters.insert(
                "jaeger".to_string(),
                json!({ "endpoint": endpoint, "tls": { "insecure": true } }),
            );
        }
        if let Some(endpoint) = &self.prometheus_exporter {
            exporters.insert("prometheus".to_string(), json!({ "endpoint": endpoint }));
        }
        if let Some(endpoint) = &self.prometheus_remote_write_exporter {
            exporters.insert(
                "prometheusremotewrite".to_string(),
                json!({ "endpoint": endpoint, "tls": { "insecure": true } }),
            );
        }

        let mut pipelines = Map::new();
        let metric_receivers: Vec<&str> = ["otlp", "prometheus"]
            .into_iter()
            .filter(|r| receivers.contains_key(*r))
            .collect();
        let metric_exporters: Vec<&str> = ["otlphttp", "prometheus", "prometheusremotewrite"]
            .into_iter()
            .filter(|e| exporters.contains_key(*e))
            .collect();
        if !metric_receivers.is_empty() && !metric_exporters.is_empty() {
            pipelines.insert(
                "metrics".to_string(),
                json!({ "receivers": metric_receivers, "exporters": metric_exporters }),
            );
        }
        let trace_receivers: Vec<&str> = ["otlp", "jaeger"]
            .into_iter()
            .filter(|r| receivers.contains_key(*r))
            .collect();
        let trace_exporters: Vec<&str> = ["otlphttp", "jaeger"]
            .into_iter()
            .filter(|e| exporters.contains_key(*e))
            .collect();
        if !trace_receivers.is_empty() && !trace_exporters.is_empty() {
            pipelines.insert(
                "traces".to_string(),
                json!({ "receivers": trace_receivers, "exporters": trace_exporters }),
            );
        }

        let extension_names: Vec<String> = extensions.keys().cloned().collect();
        json!({
            "extensions": extensions,
            "receivers": receivers,
            "exporters": exporters,
            "service": {
                "extensions": extension_names,
                "pipelines": pipelines,
            },
        })
    }
}

impl Instance {
    fn observability_mut(&mut self) -> Result<&mut ObservabilityConfig, Error> {
        self.guard(Operation::SetObservability)?;
        Ok(&mut self.observability)
    }

    pub fn set_otel_collector_version(&mut self, version: impl Into<String>) -> Result<(), Error> {
        let version = version.into();
        debug!(instance = %self.name(), version = %version, "Set otel collector version");
        self.observability_mut()?.collector_version = version;
        Ok(())
    }

    /// Receive OTLP over HTTP on `port`
    pub fn set_otel_endpoint(&mut self, port: u16) -> Result<(), Error> {
        self.observability_mut()?.otlp_port = Some(port);
        debug!(instance = %self.name(), port, "Set OTLP endpoint");
        Ok(())
    }

    /// Scrape the instance's Prometheus endpoint on `port`
    pub fn set_prometheus_endpoint(
        &mut self,
        port: u16,
        job_name: impl Into<String>,
        scrape_interval: impl Into<String>,
    ) -> Result<(), Error> {
        self.observability_mut()?.prometheus_endpoint = Some(PrometheusEndpoint {
            port,
            job_name: job_name.into(),
            scrape_interval: scrape_interval.into(),
        });
        debug!(instance = %self.name(), port, "Set Prometheus endpoint");
        Ok(())
    }

    pub fn set_jaeger_endpoint(
        &mut self,
        grpc_port: u16,
        thrift_compact_port: u16,
        thrift_http_port: u16,
    ) -> Result<(), Error> {
        self.observability_mut()?.jaeger_endpoint = Some(JaegerEndpoint {
            grpc_port,
            thrift_compact_port,
            thrift_http_port,
        });
        debug!(
            instance = %self.name(),
            grpc_port,
            thrift_compact_port,
            thrift_http_port,
            "Set Jaeger endpoint"
        );
        Ok(())
    }

    pub fn set_otlp_exporter(
        &mut self,
        endpoint: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<(), Error> {
        let exporter = OtlpExporter {
            endpoint: endpoint.into(),
            username: username.into(),
            password: password.into(),
        };
        debug!(instance = %self.name(), endpoint = %exporter.endpoint, "Set OTLP exporter");
        self.observability_mut()?.otlp_exporter = Some(exporter);
        Ok(())
    }

    pub fn set_jaeger_exporter(&mut self, endpoint: impl Into<String>) -> Result<(), Error> {
        self.observability_mut()?.jaeger_exporter = Some(endpoint.into());
        debug!(instance = %self.name(), "Set Jaeger exporter");
        Ok(())
    }

    pub fn set_prometheus_exporter(&mut self, endpoint: impl Into<String>) -> Result<(), Error> {
        self.observability_mut()?.prometheus_exporter = Some(endpoint.into());
        debug!(instance = %self.name(), "Set Prometheus exporter");
        Ok(())
    }

    pub fn set_prometheus_remote_write_exporter(
        &mut self,
        endpoint: impl Into<String>,
    ) -> Result<(), Error> {
        self.observability_mut()?.prometheus_remote_write_exporter = Some(endpoint.into());
        debug!(instance = %self.name(), "Set Prometheus remote write exporter");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::InstanceId;
    use crate::state::InstanceState;

    #[test]
    fn disabled_by_default() {
        let config = ObservabilityConfig::default();
        assert!(!config.is_enabled());
        assert_eq!(config.collector_version, DEFAULT_OTEL_COLLECTOR_VERSION);
    }

    #[test]
    fn otlp_pipeline_is_generated() {
        let config = ObservabilityConfig {
            otlp_port: Some(4318),
            otlp_exporter: Some(OtlpExporter {
                endpoint: "https://otlp.example.com".to_string(),
                username: "user".to_string(),
                password: "secret".to_string(),
            }),
            ..Default::default()
        };
        assert!(config.is_enabled());

        let doc = config.collector_config();
        assert_eq!(doc["receivers"]["otlp"]["protocols"]["http"]["endpoint"], "0.0.0.0:4318");
        assert_eq!(doc["exporters"]["otlphttp"]["auth"]["authenticator"], "basicauth/otlp");
        assert_eq!(doc["service"]["pipelines"]["metrics"]["receivers"][0], "otlp");
        assert_eq!(doc["service"]["pipelines"]["traces"]["exporters"][0], "otlphttp");
        assert_eq!(doc["service"]["extensions"][0], "basicauth/otlp");
    }

    #[test]
    fn prometheus_only_has_no_trace_pipeline() {
        let config = ObservabilityConfig {
            prometheus_endpoint: Some(PrometheusEndpoint {
                port: 9090,
                job_name: "app".to_string(),
                scrape_interval: "15s".to_string(),
            }),
            prometheus_remote_write_exporter: Some("http://prom:9090/api/v1/write".to_string()),
            ..Default::default()
        };
        let doc = config.collector_config();
        assert!(doc["service"]["pipelines"].get("traces").is_none());
        assert_eq!(
            doc["service"]["pipelines"]["metrics"]["exporters"][0],
            "prometheusremotewrite"
        );
        let scrape = &doc["receivers"]["prometheus"]["config"]["scrape_configs"][0];
        assert_eq!(scrape["static_configs"][0]["targets"][0], "localhost:9090");
    }

    #[test]
    fn setters_guarded_by_state() {
        let mut instance = Instance::new(InstanceId(0), "web", "web-00000000");
        instance.state = InstanceState::Committed;
        instance.set_jaeger_endpoint(14250, 6831, 14268).unwrap();
        assert_eq!(instance.observability().receiver_ports_tcp(), vec![14250, 14268]);
        assert_eq!(instance.observability().receiver_ports_udp(), vec![6831]);

        instance.state = InstanceState::Started;
        assert!(instance.set_otel_endpoint(4318).unwrap_err().is_state_violation());
        assert!(instance.observability().otlp_port.is_none());
    }
}
