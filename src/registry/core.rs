use super::{BatchReport, ClientRecord, ClientRegistry, ClientView, ListFilter, Selector, Slot};
use crate::control::{Secret, Signal};
use crate::daemon::DaemonState;
use crate::error::{Error, Result};
use crate::identity::Identity;
use futures::future::join_all;
use tracing::{debug, info, warn, Instrument};

impl ClientRegistry {
    /// Resolve a selector to a map slot without touching record locks.
    pub(crate) async fn resolve(&self, selector: &Selector) -> Option<(u16, Slot)> {
        let records = self.records.read().await;
        match selector {
            Selector::Port(port) => records
                .get(port)
                .map(|slot| (*port, slot.clone()))
                .or_else(|| {
                    records
                        .iter()
                        .find(|(_, slot)| slot.control_port == *port)
                        .map(|(p, slot)| (*p, slot.clone()))
                }),
            Selector::Index(index) => records
                .iter()
                .nth(*index)
                .map(|(p, slot)| (*p, slot.clone())),
            Selector::Label(label) => {
                let label = crate::config::normalize_label(label);
                records
                    .iter()
                    .find(|(_, slot)| slot.exit_labels.contains(&label))
                    .map(|(p, slot)| (*p, slot.clone()))
            }
        }
    }

    pub(crate) async fn require_slot(&self, selector: &Selector) -> Result<(u16, Slot)> {
        self.resolve(selector)
            .await
            .ok_or_else(|| Error::NotFound(selector.to_string()))
    }

    /// First client matching `selector`, or `None`.
    pub async fn find(&self, selector: &Selector) -> Option<ClientView> {
        let (_, slot) = self.resolve(selector).await?;
        let record = slot.record.lock().await;
        Some(record.view())
    }

    /// Like [`find`](Self::find), but absence is `Error::NotFound`.
    pub async fn require(&self, selector: &Selector) -> Result<ClientView> {
        self.find(selector)
            .await
            .ok_or_else(|| Error::NotFound(selector.to_string()))
    }

    /// Every record, in socks-port order.
    pub async fn snapshot(&self) -> Vec<ClientView> {
        self.list(ListFilter::All).await
    }

    pub async fn list(&self, filter: ListFilter) -> Vec<ClientView> {
        let slots: Vec<Slot> = self.records.read().await.values().cloned().collect();
        let mut views = Vec::with_capacity(slots.len());
        for slot in slots {
            let view = slot.record.lock().await.view();
            if filter == ListFilter::All || view.is_running() {
                views.push(view);
            }
        }
        views
    }

    /// Start one client and resolve its identity. Starting a running or
    /// externally managed client is a no-op.
    pub async fn start(&self, selector: &Selector) -> Result<ClientView> {
        let (port, slot) = self.require_slot(selector).await?;
        async {
            let mut record = slot.record.lock().await;
            self.start_locked(&mut record).await?;
            Ok::<_, Error>(record.view())
        }
        .instrument(tracing::info_span!("start", client.port = port))
        .await
    }

    /// Start every stopped client this manager owns.
    pub async fn start_all(&self) -> BatchReport {
        let slots = self.owned_slots().await;
        let results = join_all(slots.into_iter().map(|(port, slot)| {
            async move {
                let mut record = slot.record.lock().await;
                if record.state() != DaemonState::Stopped || record.is_orphaned() {
                    return None;
                }
                Some((port, self.start_locked(&mut record).await))
            }
            .instrument(tracing::info_span!("start", client.port = port))
        }))
        .await;

        let mut report = BatchReport::default();
        for (port, result) in results.into_iter().flatten() {
            report.record(port, result);
        }
        report
    }

    pub(crate) async fn start_locked(&self, record: &mut ClientRecord) -> Result<()> {
        let port = record.port();
        if record.is_external() {
            info!("Client {} is managed by the system, not starting it", port);
            return Ok(());
        }
        if record.state().is_running() {
            debug!("Client {} already running", port);
            return Ok(());
        }
        if record.is_orphaned() {
            return Err(Error::InvalidArgument(format!(
                "client {} has no descriptor on disk and cannot be started",
                port
            )));
        }

        if let Some(ref dir) = record.descriptor.data_directory {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| Error::LaunchFailed {
                    port,
                    reason: format!("cannot create data directory {:?}: {}", dir, e),
                })?;
        }

        record.transition(DaemonState::Starting)?;
        info!("Starting client {}", port);

        let descriptor = record.descriptor.clone();
        let deadline = self.launch_timeout;
        let outcome = tokio::select! {
            biased;

            _ = self.cancellation_token.cancelled() => Err(Error::Cancelled { port }),

            result = tokio::time::timeout(deadline, self.launcher.launch(&descriptor)) => {
                match result {
                    Ok(inner) => inner,
                    Err(_elapsed) => Err(Error::LaunchTimeout { port, deadline }),
                }
            }
        };

        match outcome {
            Ok(process) => {
                record.attach(process);
                record.transition(DaemonState::Running)?;
                if let Some(pid) = record.pid() {
                    info!("Client {} running as pid {}", port, pid);
                }
            }
            Err(e) => {
                record.clear_runtime();
                record.transition(DaemonState::Stopped)?;
                return Err(e);
            }
        }

        match self.lookup_identity(port).await {
            Ok(identity) => {
                info!("Client {} identity: {}", port, identity);
                record.identity = Some(identity);
            }
            Err(e) => warn!("Client {} started but identity lookup failed: {}", port, e),
        }
        self.save_record(record);
        Ok(())
    }

    /// Stop one client. Stopping a stopped or externally managed client is a
    /// no-op. On failure the client stays `Running` with its pid.
    pub async fn stop(&self, selector: &Selector) -> Result<ClientView> {
        let (port, slot) = self.require_slot(selector).await?;
        async {
            let mut record = slot.record.lock().await;
            self.stop_locked(&mut record).await?;
            Ok::<_, Error>(record.view())
        }
        .instrument(tracing::info_span!("stop", client.port = port))
        .await
    }

    /// Stop every running client this manager owns.
    pub async fn stop_all(&self) -> BatchReport {
        let slots = self.owned_slots().await;
        let results = join_all(slots.into_iter().map(|(port, slot)| {
            async move {
                let mut record = slot.record.lock().await;
                if !record.state().is_running() {
                    return None;
                }
                Some((port, self.stop_locked(&mut record).await))
            }
            .instrument(tracing::info_span!("stop", client.port = port))
        }))
        .await;

        let mut report = BatchReport::default();
        for (port, result) in results.into_iter().flatten() {
            report.record(port, result);
        }
        report
    }

    pub(crate) async fn stop_locked(&self, record: &mut ClientRecord) -> Result<()> {
        let port = record.port();
        if record.is_external() {
            info!("Client {} is managed by the system, not stopping it", port);
            return Ok(());
        }
        if !record.state().is_running() {
            debug!("Client {} already stopped", port);
            return Ok(());
        }

        record.transition(DaemonState::Stopping)?;
        info!("Stopping client {}", port);

        let result = match record.process.as_mut() {
            Some(process) => process.terminate().await,
            None => match record.pid.and_then(|p| p.pid()) {
                Some(pid) => self.launcher.kill_pid(port, pid).await,
                None => Ok(()),
            },
        };

        match result {
            Ok(()) => {
                record.clear_runtime();
                record.transition(DaemonState::Stopped)?;
                self.save_record(record);
                info!("Client {} stopped", port);
                Ok(())
            }
            Err(e) => {
                record.transition(DaemonState::Running)?;
                Err(e)
            }
        }
    }

    /// Rotate one client's identity, starting it first if needed.
    pub async fn rotate(&self, selector: &Selector) -> Result<ClientView> {
        let (port, slot) = self.require_slot(selector).await?;
        async {
            let mut record = slot.record.lock().await;
            if !record.state().is_running() {
                info!("Client {} is not running, starting it before rotation", port);
                self.start_locked(&mut record).await?;
            }
            self.rotate_locked(&mut record).await?;
            Ok::<_, Error>(record.view())
        }
        .instrument(tracing::info_span!("rotate", client.port = port))
        .await
    }

    /// Rotate every running client this manager owns, concurrently.
    pub async fn rotate_all(&self) -> BatchReport {
        let slots = self.owned_slots().await;
        let results = join_all(slots.into_iter().map(|(port, slot)| {
            async move {
                let mut record = slot.record.lock().await;
                if !record.state().is_running() {
                    return None;
                }
                Some((port, self.rotate_locked(&mut record).await))
            }
            .instrument(tracing::info_span!("rotate", client.port = port))
        }))
        .await;

        let mut report = BatchReport::default();
        for (port, result) in results.into_iter().flatten() {
            report.record(port, result);
        }
        report
    }

    async fn rotate_locked(&self, record: &mut ClientRecord) -> Result<()> {
        let port = record.port();
        let wrap = |source: Error| Error::RotationFailed {
            port,
            source: Box::new(source),
        };

        let secret = self.secret_for(record).await.map_err(wrap)?;
        let control_port = record.control_port();
        let signalled: Result<()> = async {
            let mut channel = self.connector.connect(port, control_port).await?;
            channel.authenticate(&secret).await?;
            channel.signal(Signal::Rotate).await
        }
        .await;

        if let Err(e) = signalled {
            if e.is_auth_failure() {
                self.forget_secret(record);
            }
            return Err(wrap(e));
        }
        info!("Client {} switched to new circuits", port);

        match self.lookup_identity(port).await {
            Ok(identity) => {
                info!("Client {} identity: {}", port, identity);
                record.identity = Some(identity);
                self.save_record(record);
                Ok(())
            }
            Err(e) => {
                record.identity = None;
                Err(wrap(e))
            }
        }
    }

    /// The record's cached secret, one entered for another client with the
    /// same hash, or a fresh one from the secret source.
    async fn secret_for(&self, record: &mut ClientRecord) -> Result<Secret> {
        if let Some(ref secret) = record.secret {
            return Ok(secret.clone());
        }
        let _guard = self.secret_lock.lock().await;
        let hash = record.descriptor.secret_hash.clone();
        if let Some(ref hash) = hash {
            if let Some(secret) = self.known_secrets.lock().get(hash).cloned() {
                record.secret = Some(secret.clone());
                return Ok(secret);
            }
        }
        let secret = self.secrets.obtain(record.port()).await?;
        if let Some(hash) = hash {
            self.known_secrets.lock().insert(hash, secret.clone());
        }
        record.secret = Some(secret.clone());
        Ok(secret)
    }

    fn forget_secret(&self, record: &mut ClientRecord) {
        record.secret = None;
        if let Some(ref hash) = record.descriptor.secret_hash {
            self.known_secrets.lock().remove(hash);
        }
    }

    /// The last resolved identity, without a network round trip.
    pub async fn identity(&self, selector: &Selector) -> Result<Option<Identity>> {
        let (_, slot) = self.require_slot(selector).await?;
        let record = slot.record.lock().await;
        Ok(record.identity().cloned())
    }

    /// Resolve the identity again and store it.
    pub async fn refresh_identity(&self, selector: &Selector) -> Result<Identity> {
        let (port, slot) = self.require_slot(selector).await?;
        let mut record = slot.record.lock().await;
        if !record.state().is_running() {
            return Err(Error::InvalidArgument(format!(
                "client {} is not running",
                port
            )));
        }
        match self.lookup_identity(port).await {
            Ok(identity) => {
                record.identity = Some(identity.clone());
                self.save_record(&record);
                Ok(identity)
            }
            Err(e) => {
                record.identity = None;
                Err(e)
            }
        }
    }

    /// Save every record to the runtime cache.
    pub async fn flush_all(&self) -> Result<()> {
        let slots: Vec<Slot> = self.records.read().await.values().cloned().collect();
        let mut errors = Vec::new();
        for slot in slots {
            let record = slot.record.lock().await;
            if let Err(e) = self.cache.save(&record.to_cache_entry()) {
                errors.push(e);
            }
        }
        debug!("Flushed runtime state to {:?}", self.cache.dir());
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Multiple(errors)),
        }
    }

    /// `lookup_timeout` is per request; a lookup that falls back through
    /// several services gets one deadline per service.
    async fn lookup_identity(&self, port: u16) -> Result<Identity> {
        let budget = self
            .lookup_timeout
            .saturating_mul(self.lookup.attempts().max(1));
        match tokio::time::timeout(budget, self.lookup.lookup(port)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Lookup {
                port,
                reason: format!("no answer within {:?}", budget),
            }),
        }
    }

    /// Persist one record right away. A failed save is logged; the flush at
    /// exit retries it.
    fn save_record(&self, record: &ClientRecord) {
        if let Err(e) = self.cache.save(&record.to_cache_entry()) {
            warn!("Failed to save client {} to cache: {}", record.port(), e);
        }
    }

    async fn owned_slots(&self) -> Vec<(u16, Slot)> {
        self.records
            .read()
            .await
            .iter()
            .filter(|(_, slot)| !slot.external)
            .map(|(port, slot)| (*port, slot.clone()))
            .collect()
    }
}
