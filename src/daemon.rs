//! Member daemon: wiring and serving

use crate::api::{self, AppState};
use crate::cluster::heartbeat::{register_members, run_heartbeat};
use crate::cluster::{ClusterDb, Forwarder, LocationResolver, MemberClient};
use crate::common::auth::{AllowAll, Authorizer, KeyStore, RoleAuthorizer};
use crate::common::auth_middleware::AuthState;
use crate::common::{Config, Error, Result};
use crate::operations::OperationTracker;
use crate::orchestrator::Orchestrator;
use crate::storage::PoolRegistry;
use axum::Router;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct Daemon {
    config: Config,
    db: Arc<ClusterDb>,
    client: MemberClient,
    orch: Arc<Orchestrator>,
    auth: AuthState,
}

fn read_pem(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| Error::InvalidConfig(format!("Cannot read {}: {}", path.display(), e)))
}

impl Daemon {
    /// Open the metadata store under the data dir and wire everything up
    pub fn open(config: Config) -> Result<Self> {
        std::fs::create_dir_all(&config.server.data_dir)?;
        let db = Arc::new(ClusterDb::open(config.server.data_dir.join("database"))?);
        Self::with_db(config, db)
    }

    /// Wire a daemon around an existing metadata store
    pub fn with_db(config: Config, db: Arc<ClusterDb>) -> Result<Self> {
        let member = config.server.member_name.clone();
        seed_projects(&db, &config)?;
        register_members(&db, &config)?;

        let pools = Arc::new(PoolRegistry::new(db.clone(), &member, &config.server.data_dir));
        pools.seed(&config.pools)?;

        // own certificate, handed to peers so they can pin it
        let certificate = match &config.server.tls_cert {
            Some(path) => Some(read_pem(path)?),
            None => None,
        };
        let cluster_certificate = match &config.cluster.certificate {
            Some(path) => Some(read_pem(path)?),
            None => certificate.clone(),
        };

        let tracker = Arc::new(OperationTracker::new(
            &member,
            Duration::from_secs(config.operations.retention_secs),
        ));
        let resolver = Arc::new(LocationResolver::new(db.clone(), pools.clone(), &member));
        let client = MemberClient::new(
            &member,
            cluster_certificate.as_deref(),
            config.migration.connect_timeout(),
        )?;
        let forwarder = Arc::new(Forwarder::new(
            db.clone(),
            client.clone(),
            resolver,
            config.cluster.offline_threshold(),
        ));
        let orch = Orchestrator::new(db.clone(), pools, tracker, forwarder, &config, certificate);

        let authorizer: Arc<dyn Authorizer> = if config.auth.enabled {
            Arc::new(RoleAuthorizer)
        } else {
            Arc::new(AllowAll)
        };
        let auth = AuthState {
            enabled: config.auth.enabled,
            key_store: Arc::new(KeyStore::from_config(&config.auth)),
            authorizer,
        };
        if auth.enabled && auth.key_store.is_empty() {
            tracing::warn!("Authentication is enabled but no API keys are configured");
        }

        Ok(Self {
            config,
            db,
            client,
            orch,
            auth,
        })
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orch
    }

    pub fn router(&self) -> Router {
        api::router(
            AppState {
                orch: self.orch.clone(),
            },
            self.auth.clone(),
            self.config.server.max_upload_bytes,
        )
    }

    /// Bind the configured address and serve until ctrl-c
    pub async fn serve(self) -> Result<()> {
        let listener = std::net::TcpListener::bind(self.config.server.bind_addr)?;
        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown requested");
                signal.cancel();
            }
        });
        self.serve_on(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` fires
    pub async fn serve_on(self, listener: std::net::TcpListener, shutdown: CancellationToken) -> Result<()> {
        let server = &self.config.server;
        tracing::info!("Starting member: {}", server.member_name);
        tracing::info!("  API: {}", server.advertised_url());
        tracing::info!("  Data dir: {}", server.data_dir.display());
        tracing::info!("  Peers: {}", self.config.cluster.members.len());

        tokio::spawn(run_heartbeat(
            self.db.clone(),
            self.client.clone(),
            server.member_name.clone(),
            self.config.cluster.heartbeat_interval(),
            shutdown.clone(),
        ));

        listener.set_nonblocking(true)?;
        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();

        match (&server.tls_cert, &server.tls_key) {
            (Some(cert), Some(key)) => {
                let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key)
                    .await
                    .map_err(|e| Error::Tls(format!("Cannot load server certificate: {}", e)))?;
                let handle = axum_server::Handle::new();
                let stopper = handle.clone();
                tokio::spawn(async move {
                    shutdown.cancelled().await;
                    stopper.graceful_shutdown(Some(Duration::from_secs(10)));
                });
                tracing::info!("✓ Member ready (https)");
                axum_server::from_tcp_rustls(listener, tls)
                    .handle(handle)
                    .serve(app)
                    .await?;
            }
            _ => {
                let listener = tokio::net::TcpListener::from_std(listener)?;
                tracing::info!("✓ Member ready (http)");
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move { shutdown.cancelled().await })
                    .await?;
            }
        }
        Ok(())
    }
}

/// Create the default project and the configured ones if missing
fn seed_projects(db: &ClusterDb, config: &Config) -> Result<()> {
    db.transaction(|tx| {
        if tx.get_project("default").is_err() {
            tx.create_project("default", BTreeMap::new())?;
        }
        for seed in &config.projects {
            if tx.get_project(&seed.name).is_err() {
                let project_config = seed.config.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                tx.create_project(&seed.name, project_config)?;
                tracing::info!("  Project: {}", seed.name);
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::ProjectSeed;
    use std::collections::HashMap;

    #[test]
    fn test_seed_projects_is_idempotent() {
        let db = ClusterDb::in_memory();
        let mut config = Config::default();
        config.projects.push(ProjectSeed {
            name: "tenant".into(),
            config: HashMap::from([("features.storage.volumes".to_string(), "false".to_string())]),
        });
        seed_projects(&db, &config).unwrap();
        seed_projects(&db, &config).unwrap();

        let projects = db.transaction(|tx| Ok(tx.list_projects())).unwrap();
        assert_eq!(projects.len(), 2);
        assert_eq!(
            db.transaction(|tx| tx.effective_project("tenant")).unwrap(),
            "default"
        );
    }
}
