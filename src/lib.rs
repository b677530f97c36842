//! PLC Logger Agent
//!
//! A local data-logging agent for PLC fleets: schemas, device tables and
//! tag mappings live in an embedded catalog; per-job workers poll mapped
//! tags over Modbus-TCP / OPC-UA sessions and write timestamped rows into
//! the user's SQL target; a reconnect supervisor keeps device sessions
//! alive and a metrics registry tracks everything. The HTTP transport and
//! the desktop UI live outside this crate and drive the command surface in
//! [`commands`].

use log::info;
use std::sync::Arc;

// Module declarations
pub mod api;
pub mod catalog;
pub mod commands;
pub mod devices;
pub mod errors;
pub mod jobs;
pub mod mapping;
pub mod metrics;
pub mod middleware;
pub mod migrate;
pub mod models;
pub mod protocols;
pub mod secrets;
pub mod targets;

#[cfg(test)]
pub mod test_fixtures;

use crate::catalog::{app_db_path, app_folder, AppDb, CatalogStore};
use crate::commands::AppState;
use crate::devices::DeviceSessionManager;
use crate::errors::AppResult;
use crate::jobs::JobEngine;
use crate::mapping::MappingResolver;
use crate::metrics::{MetricsRegistry, RollupWriter};
use crate::middleware::auth::AuthManager;
use crate::migrate::MigrationPlanner;
use crate::protocols::probe::TcpProbeFactory;
use crate::protocols::SessionFactory;
use crate::secrets::{rekey_all, KeyfileSecretBox, SecretBox, SecretScope};
use crate::targets::TargetRegistry;

/// A fully wired, running agent
pub struct Agent {
    pub state: AppState,
    rollup: RollupWriter,
}

impl Agent {
    /// Build the object graph, run the startup passes and start the
    /// background threads: reconnect supervisor, system sampler, rollup
    /// writer and the workers of enabled jobs.
    pub fn bootstrap(port: u16, token: String) -> AppResult<Agent> {
        let folder = app_folder();
        let db = Arc::new(AppDb::open(&app_db_path())?);
        let catalog = Arc::new(CatalogStore::new(db.clone())?);

        // align secret scope between service-mode and user-mode deployments
        let scope = SecretScope::from_env();
        let secret_box: Arc<dyn SecretBox> =
            Arc::new(KeyfileSecretBox::load_or_create(scope, &folder)?);
        let alternate_scope = match scope {
            SecretScope::User => SecretScope::Machine,
            SecretScope::Machine => SecretScope::User,
        };
        let alternate = KeyfileSecretBox::load_existing(alternate_scope, &folder);
        rekey_all(
            &catalog,
            secret_box.as_ref(),
            alternate.as_ref().map(|b| b as &dyn SecretBox),
        );

        let targets = Arc::new(TargetRegistry::new(catalog.clone()));
        let factory: Arc<dyn SessionFactory> = Arc::new(TcpProbeFactory);
        let resolver = Arc::new(MappingResolver::new(
            catalog.clone(),
            targets.clone(),
            factory.clone(),
        ));
        let planner = Arc::new(MigrationPlanner::new(catalog.clone(), targets.clone()));
        let metrics = Arc::new(MetricsRegistry::new());
        let devices = Arc::new(DeviceSessionManager::new(catalog.clone(), factory.clone()));
        let engine = Arc::new(JobEngine::new(
            catalog.clone(),
            targets.clone(),
            resolver.clone(),
            factory.clone(),
            metrics.clone(),
        ));

        devices.start();
        metrics.system.start();
        let rollup = RollupWriter::start(metrics.clone(), db);
        engine.start_enabled_jobs();
        info!("agent bootstrapped on port {}", port);

        Ok(Agent {
            state: AppState {
                catalog,
                targets,
                planner,
                resolver,
                devices,
                jobs: engine,
                metrics,
                secret_box,
                auth: Arc::new(AuthManager::new(token)),
                port,
            },
            rollup,
        })
    }

    /// Stop workers and background threads; runs finalize into history
    pub fn shutdown(&self) {
        self.state.jobs.shutdown();
        self.state.devices.stop();
        self.state.metrics.system.stop();
        self.rollup.stop();
        info!("agent shut down");
    }
}
