//! One bound vault: binding, engine, and scheduling wired to file events.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use sync_core::remote::{BlobTransport, RemoteApi};
use sync_core::{
    AutoBinder, BindingRecord, EventBus, FileIndex, FileSystem, ReindexSink, Scheduler,
    SyncConfig, SyncEngine,
};

use crate::watcher::{FileEvent, FileEventKind};

/// Logs reindex requests; the indexing pipeline itself lives elsewhere.
pub struct LogReindexSink;

#[async_trait]
impl ReindexSink for LogReindexSink {
    async fn reindex(&self, path: &str) {
        info!("Reindex requested for {}", path);
    }
}

pub struct VaultSession<F, R, T> {
    engine: Arc<Mutex<SyncEngine<Arc<F>, Arc<R>, Arc<T>>>>,
    scheduler: Scheduler<dyn ReindexSink>,
    binding: BindingRecord,
}

impl<F, R, T> VaultSession<F, R, T>
where
    F: FileSystem + 'static,
    R: RemoteApi + 'static,
    T: BlobTransport + 'static,
{
    /// Bind the vault (retrying per `config`), open the engine, and start
    /// scheduling. Nothing syncs until the first trigger.
    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        fs: Arc<F>,
        remote: Arc<R>,
        transport: Arc<T>,
        vault_name: &str,
        local_path: &str,
        config: SyncConfig,
        events: Arc<EventBus>,
        sink: Arc<dyn ReindexSink>,
    ) -> Result<Self> {
        let device_id = FileIndex::load(&*fs)
            .await
            .context("Failed to load file index")?
            .device_id();

        let binding = AutoBinder::new(Arc::clone(&fs), Arc::clone(&remote), Arc::clone(&events), device_id)
            .with_device_name(config.device_name.clone())
            .with_retry(config.binding_retry_base, config.binding_max_attempts)
            .ensure_bound(vault_name, local_path)
            .await
            .with_context(|| format!("Failed to bind vault {}", vault_name))?;

        let engine = SyncEngine::open(
            fs,
            remote,
            transport,
            binding.vault_id.clone(),
            config.clone(),
            Arc::clone(&events),
        )
        .await
        .context("Failed to open sync engine")?;
        let engine = Arc::new(Mutex::new(engine));

        let scheduler = Scheduler::spawn(Arc::clone(&engine), sink, events, &config);
        info!("Session started for {} (device {})", binding.vault_name, device_id);

        Ok(Self {
            engine,
            scheduler,
            binding,
        })
    }

    pub fn binding(&self) -> &BindingRecord {
        &self.binding
    }

    pub fn engine(&self) -> &Arc<Mutex<SyncEngine<Arc<F>, Arc<R>, Arc<T>>>> {
        &self.engine
    }

    pub fn sync_soon(&self) {
        self.scheduler.trigger_sync();
    }

    /// Every change triggers a sync; text edits also schedule a reindex.
    pub fn on_file_event(&self, event: &FileEvent) {
        self.scheduler.trigger_sync();
        match event.kind {
            FileEventKind::Modified => {
                self.scheduler.schedule_reindex(&event.path, event.size);
            }
            FileEventKind::Deleted => {
                self.scheduler.cancel_reindex(&event.path);
            }
        }
    }

    pub fn pending_reindex(&self) -> usize {
        self.scheduler.pending_reindex()
    }

    pub async fn shutdown(self) {
        self.scheduler.shutdown().await;
        info!("Session for {} stopped", self.binding.vault_name);
    }
}
