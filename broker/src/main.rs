mod agent;
mod api;
mod audit;
mod cli;
mod config;
mod poller;
mod schedule;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::info;

use crate::agent::HttpAgentClient;
use crate::api::etcdstore::EtcdStore;
use crate::audit::LogAuditSink;
use crate::cli::{Cli, Commands};
use crate::config::load_config;
use crate::poller::StatusPoller;
use crate::poller::backup::BackupStatusPoller;
use crate::poller::restore::RestoreStatusPoller;
use crate::schedule::HttpScheduleClient;
use common::store::ResourceStore;
use liblock::LockManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Start { config } => {
            let cfg = load_config(config.to_str().context("config path is not valid UTF-8")?)?;

            let store: Arc<dyn ResourceStore> = Arc::new(
                EtcdStore::new(&cfg.etcd)
                    .await
                    .context("failed to connect to etcd")?,
            );
            let locks = Arc::new(LockManager::new(store.clone(), cfg.lock.clone().into()));
            let agent = Arc::new(HttpAgentClient::new(&cfg.agent)?);
            let scheduler = Arc::new(HttpScheduleClient::new(&cfg.scheduler)?);
            let audit = Arc::new(LogAuditSink);

            let backup_poller = StatusPoller::new(
                store.clone(),
                Arc::new(BackupStatusPoller::new(
                    store.clone(),
                    agent.clone(),
                    locks.clone(),
                    scheduler.clone(),
                    audit.clone(),
                    cfg.backup.clone(),
                )),
                cfg.watch.clone(),
            );
            let restore_poller = StatusPoller::new(
                store.clone(),
                Arc::new(RestoreStatusPoller::new(
                    store.clone(),
                    agent,
                    locks,
                    audit,
                    cfg.restore.clone(),
                )),
                cfg.watch.clone(),
            );

            let backup_task = backup_poller.start();
            let restore_task = restore_poller.start();
            info!("[broker] orchestrator started");

            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for shutdown signal")?;
            info!("[broker] shutting down");
            backup_task.abort();
            restore_task.abort();
        }
    }

    Ok(())
}
