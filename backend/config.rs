use std::collections::HashMap;

/// Which orchestrator backend talks to the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorBackend {
    Local,
    Cluster,
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub sentry_dsn: Option<String>,
    pub environment: String,

    pub jwt_secret: String,
    pub jwt_algorithm: jsonwebtoken::Algorithm,

    pub metadata_base_url: String,

    pub orchestrator_backend: OrchestratorBackend,
    pub kube_namespace: String,
    pub docker_network: Option<String>,

    pub free_max_containers: u32,
    pub vnc_image: String,
    pub container_env_default: HashMap<String, String>,
    pub internal_novnc_port: u16,
    pub allowed_novnc_ports: Vec<u16>,
    pub workspace: String,

    pub workspace_purge_on_run: bool,
}

impl Config {
    pub fn from_env() -> Self {
        let allowed_ports = std::env::var("ALLOWED_NOVNC_PORTS").ok();
        Self::from_raw_values(
            std::env::var("PORT").ok().as_deref(),
            std::env::var("SENTRY_DSN").ok().as_deref(),
            std::env::var("ENVIRONMENT").ok().as_deref(),
            std::env::var("JWT_SECRET").ok().as_deref(),
            std::env::var("METADATA_BASE_URL").ok().as_deref(),
            std::env::var("ORCHESTRATOR_BACKEND").ok().as_deref(),
            std::env::var("KUBE_NAMESPACE").ok().as_deref(),
            std::env::var("DOCKER_NETWORK").ok().as_deref(),
            std::env::var("FREE_MAX_CONTAINERS").ok().as_deref(),
            std::env::var("VNC_IMAGE").ok().as_deref(),
            std::env::var("INTERNAL_NOVNC_PORT").ok().as_deref(),
            allowed_ports.as_deref(),
            std::env::var("WORKSPACE").ok().as_deref(),
            std::env::var("WORKSPACE_PURGE_ON_RUN").ok().as_deref(),
        )
    }

    /// Build a Config from raw string values (as they would come from env vars).
    /// Used directly in tests to avoid mutating process-global environment.
    #[allow(clippy::too_many_arguments)]
    pub fn from_raw_values(
        port: Option<&str>,
        sentry_dsn: Option<&str>,
        environment: Option<&str>,
        jwt_secret: Option<&str>,
        metadata_base_url: Option<&str>,
        orchestrator_backend: Option<&str>,
        kube_namespace: Option<&str>,
        docker_network: Option<&str>,
        free_max_containers: Option<&str>,
        vnc_image: Option<&str>,
        internal_novnc_port: Option<&str>,
        allowed_novnc_ports: Option<&str>,
        workspace: Option<&str>,
        workspace_purge_on_run: Option<&str>,
    ) -> Self {
        let port = port.and_then(|v| v.parse().ok()).unwrap_or(8080);

        let sentry_dsn = sentry_dsn.filter(|s| !s.is_empty()).map(String::from);

        let environment = environment
            .filter(|s| !s.is_empty())
            .map(String::from)
            .unwrap_or_else(|| "local".to_string());

        let jwt_secret = jwt_secret
            .filter(|s| !s.is_empty())
            .map(String::from)
            .unwrap_or_else(|| "development-only-insecure-secret".to_string());

        let metadata_base_url = metadata_base_url
            .filter(|s| !s.is_empty())
            .map(String::from)
            .unwrap_or_else(|| "http://localhost:9090".to_string());

        let orchestrator_backend = match orchestrator_backend {
            Some("cluster") => OrchestratorBackend::Cluster,
            _ => OrchestratorBackend::Local,
        };

        let kube_namespace = kube_namespace
            .filter(|s| !s.is_empty())
            .map(String::from)
            .unwrap_or_else(|| "webide-net".to_string());

        let docker_network = docker_network.filter(|s| !s.is_empty()).map(String::from);

        let free_max_containers = free_max_containers
            .and_then(|v| v.parse().ok())
            .unwrap_or(3);

        let vnc_image = vnc_image
            .filter(|s| !s.is_empty())
            .map(String::from)
            .unwrap_or_else(|| "jaewoo6257/vnc:1.0.0".to_string());

        let internal_novnc_port = internal_novnc_port
            .and_then(|v| v.parse().ok())
            .unwrap_or(5901);

        let allowed_novnc_ports: Vec<u16> = allowed_novnc_ports
            .map(|v| {
                v.split(',')
                    .filter_map(|p| p.trim().parse().ok())
                    .collect()
            })
            .filter(|v: &Vec<u16>| !v.is_empty())
            .unwrap_or_else(|| (30100..30200).collect());

        let workspace = workspace
            .filter(|s| !s.is_empty())
            .map(String::from)
            .unwrap_or_else(|| "/home/user/workspace".to_string());

        let workspace_purge_on_run = workspace_purge_on_run
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(false);

        Config {
            port,
            sentry_dsn,
            environment,
            jwt_secret,
            jwt_algorithm: jsonwebtoken::Algorithm::HS256,
            metadata_base_url,
            orchestrator_backend,
            kube_namespace,
            docker_network,
            free_max_containers,
            vnc_image,
            container_env_default: HashMap::new(),
            internal_novnc_port,
            allowed_novnc_ports,
            workspace,
            workspace_purge_on_run,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_invalid_port_uses_default() {
        let config = Config::from_raw_values(
            Some("not-a-number"),
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
        );
        assert_eq!(config.port, 8080);
    }

    #[test]
    fn test_config_valid_port() {
        let config = Config::from_raw_values(
            Some("3000"),
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
        );
        assert_eq!(config.port, 3000);
    }

    #[test]
    fn test_config_empty_sentry_dsn_is_none() {
        let config = Config::from_raw_values(
            None,
            Some(""),
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
        );
        assert!(config.sentry_dsn.is_none());
    }

    #[test]
    fn test_config_default_environment() {
        let config = Config::from_raw_values(
            None, None, None, None, None, None, None, None, None, None, None, None, None, None,
        );
        assert_eq!(config.environment, "local");
    }

    #[test]
    fn test_config_orchestrator_backend_defaults_local() {
        let config = Config::from_raw_values(
            None, None, None, None, None, None, None, None, None, None, None, None, None, None,
        );
        assert_eq!(config.orchestrator_backend, OrchestratorBackend::Local);
    }

    #[test]
    fn test_config_orchestrator_backend_cluster() {
        let config = Config::from_raw_values(
            None,
            None,
            None,
            None,
            None,
            Some("cluster"),
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
        );
        assert_eq!(config.orchestrator_backend, OrchestratorBackend::Cluster);
    }

    #[test]
    fn test_config_allowed_ports_parses_csv() {
        let config = Config::from_raw_values(
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            Some("30100,30101,30102"),
            None,
            None,
        );
        assert_eq!(config.allowed_novnc_ports, vec![30100, 30101, 30102]);
    }

    #[test]
    fn test_config_free_max_containers_default() {
        let config = Config::from_raw_values(
            None, None, None, None, None, None, None, None, None, None, None, None, None, None,
        );
        assert_eq!(config.free_max_containers, 3);
    }

    #[test]
    fn test_config_workspace_purge_on_run_parses_bool() {
        let config = Config::from_raw_values(
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            Some("true"),
        );
        assert!(config.workspace_purge_on_run);
    }
}
