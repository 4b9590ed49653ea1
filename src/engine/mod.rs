mod availability;
mod conflict;
mod error;
mod lifecycle;
mod mutations;
mod queries;
mod registry;

pub use availability::{free_windows, merge_overlapping, subtract_intervals};
pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::clock::CondoClock;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedAreaState = Arc<RwLock<AreaState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(ref e) = result {
        tracing::error!(error = %e, events = batch.len(), "WAL flush failed");
    }
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &mut [(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even on append error so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// Reservation engine for one condominium.
pub struct Engine {
    pub state: DashMap<Ulid, SharedAreaState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    clock: CondoClock,
    /// Serializes area creation against itself and against compaction.
    pub(super) registry_lock: Mutex<()>,
    /// Reverse lookup: reservation id → area id
    pub(super) reservation_to_area: DashMap<Ulid, Ulid>,
    /// Owner (unit) → reservation ids, in creation order.
    pub(super) owner_index: DashMap<Ulid, Vec<Ulid>>,
}

/// Indexes maintained alongside area state.
pub(super) struct Indexes<'a> {
    pub reservation_to_area: &'a DashMap<Ulid, Ulid>,
    pub owner_index: &'a DashMap<Ulid, Vec<Ulid>>,
}

impl Indexes<'_> {
    fn record(&self, r: &Reservation) {
        self.reservation_to_area.insert(r.id, r.area_id);
        if let Some(owner) = r.occupant.owner() {
            self.owner_index.entry(owner).or_default().push(r.id);
        }
    }
}

/// Apply an event directly to an AreaState (no locking; caller holds the lock).
///
/// Multi-area events only touch the records belonging to `st`; the caller
/// applies the same event to every area it names.
pub(super) fn apply_to_area(st: &mut AreaState, event: &Event, idx: &Indexes<'_>) {
    match event {
        Event::AreaUpdated { area } => {
            st.area = area.clone();
        }
        Event::ReservationCreated { reservation } => {
            idx.record(reservation);
            st.insert_reservation(reservation.clone());
        }
        Event::BlocksPlaced { blocks } => {
            let area_id = st.area.id;
            for block in blocks.iter().filter(|b| b.area_id == area_id) {
                idx.record(block);
                st.insert_reservation(block.clone());
            }
        }
        Event::StatusChanged { id, status, note, .. } => {
            if let Some(r) = st.get_mut(id) {
                r.status = *status;
                if note.is_some() {
                    r.note = note.clone();
                }
            }
        }
        Event::BlocksLifted { ids, .. } => {
            for id in ids {
                if let Some(r) = st.get_mut(id) {
                    r.status = Status::Cancelled;
                }
            }
        }
        // AreaCreated is handled at the DashMap level
        Event::AreaCreated { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, clock: CondoClock) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            clock,
            registry_lock: Mutex::new(()),
            reservation_to_area: DashMap::new(),
            owner_index: DashMap::new(),
        };

        // Replay: we're the sole owner of these Arcs, so try_write always
        // succeeds. Never block here; this may run inside an async context
        // (lazy condominium creation).
        for event in &events {
            if let Event::AreaCreated { area } = event {
                engine
                    .state
                    .insert(area.id, Arc::new(RwLock::new(AreaState::new(area.clone()))));
                continue;
            }
            let mut area_ids = event.area_ids();
            area_ids.sort();
            area_ids.dedup();
            for area_id in area_ids {
                let Some(st) = engine.get_area_state(&area_id) else {
                    tracing::warn!(%area_id, "replay: event for unknown area skipped");
                    continue;
                };
                let mut guard = st
                    .try_write()
                    .map_err(|_| io::Error::other("replay: area state unexpectedly locked"))?;
                apply_to_area(&mut guard, event, &engine.indexes());
            }
        }

        tracing::debug!(
            path = %wal_path.display(),
            events = events.len(),
            areas = engine.state.len(),
            "WAL replayed"
        );
        Ok(engine)
    }

    pub fn clock(&self) -> &CondoClock {
        &self.clock
    }

    pub(super) fn indexes(&self) -> Indexes<'_> {
        Indexes {
            reservation_to_area: &self.reservation_to_area,
            owner_index: &self.owner_index,
        }
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_area_state(&self, id: &Ulid) -> Option<SharedAreaState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn area_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_to_area.get(reservation_id).map(|e| *e.value())
    }

    /// WAL-append + apply + notify, all under the caller's write lock.
    pub(super) async fn persist_and_apply(
        &self,
        area_id: Ulid,
        st: &mut AreaState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_area(st, event, &self.indexes());
        self.notify.send(area_id, event);
        Ok(())
    }

    /// Lookup reservation → area, acquire the area's write lock.
    pub(super) async fn resolve_reservation_write(
        &self,
        reservation_id: &Ulid,
    ) -> Result<(Ulid, OwnedRwLockWriteGuard<AreaState>), EngineError> {
        let area_id = self
            .area_for_reservation(reservation_id)
            .ok_or(EngineError::NotFound(*reservation_id))?;
        let st = self
            .get_area_state(&area_id)
            .ok_or(EngineError::NotFound(area_id))?;
        let guard = st.write_owned().await;
        Ok((area_id, guard))
    }
}
