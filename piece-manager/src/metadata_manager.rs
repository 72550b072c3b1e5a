use std::collections::HashMap;
use std::io::Read;
use std::sync::{mpsc, Arc};

use tempfile::NamedTempFile;

use crate::error::{err_transition, PieceManagerErr, Result};
use crate::helpers::{self, DealIndex, SnapshotKey};
use crate::identity::SectorIdentitySource;
use crate::kv_store::KeyValueStore;
use crate::metadata::{
    DealInfo, DealLocation, ProvingSectorMetadata, SectorEvent, SectorRecord, SectorState,
    SectorStateKind,
};
use crate::sealer::{SealerError, StageReport, StageTask, UnsealTask};
use crate::state::PieceManagerState;
use crate::store::SectorStore;
use crate::types::{DealId, SectorNumber, UnpaddedBytesAmount};

/// Owns every sector record and applies lifecycle transitions to them.
///
/// Each mutation is made on a copy of the state, persisted as a snapshot and
/// only then swapped in, so a failed write leaves both the in-memory and the
/// persisted state as they were.
pub struct SectorMetadataManager<T: KeyValueStore, S: SectorStore> {
    kv_store: Arc<T>,
    sector_store: Arc<S>,
    ids: Box<dyn SectorIdentitySource>,
    snapshot_key: SnapshotKey,
    state: PieceManagerState,
    deal_index: DealIndex,
    max_stage_retries: u32,
    stage_attempts: HashMap<SectorNumber, u32>,
    // stage results whose transition could not be persisted yet
    unrecorded: Vec<StageReport>,
    subscribers: Vec<mpsc::SyncSender<SectorEvent>>,
}

impl<T: KeyValueStore, S: SectorStore> SectorMetadataManager<T, S> {
    pub fn initialize(
        kv_store: Arc<T>,
        sector_store: Arc<S>,
        ids: Box<dyn SectorIdentitySource>,
        snapshot_key: SnapshotKey,
        max_stage_retries: u32,
    ) -> Result<SectorMetadataManager<T, S>> {
        let state: PieceManagerState = helpers::load_snapshot(&kv_store, &snapshot_key)?
            .map(Into::into)
            .unwrap_or_default();

        let deal_index = helpers::build_deal_index(&state.sectors)?;

        let mut m = SectorMetadataManager {
            kv_store,
            sector_store,
            ids,
            snapshot_key,
            state,
            deal_index,
            max_stage_retries,
            stage_attempts: Default::default(),
            unrecorded: vec![],
            subscribers: vec![],
        };

        m.reconcile_packing_sectors()?;

        info!(
            "loaded {} sectors ({} deals indexed)",
            m.state.sectors.len(),
            m.deal_index.len()
        );

        Ok(m)
    }

    // Brings packing sectors' staged files in line with their recorded
    // pieces. Bytes past the recorded pieces are from an append whose record
    // was never persisted; missing bytes can't be recovered.
    fn reconcile_packing_sectors(&mut self) -> Result<()> {
        let mut next = self.state.clone();
        let mut changed = vec![];

        if let Some(open) = next.open_sector {
            let is_packing = next
                .sectors
                .get(&open)
                .map(|r| r.kind() == SectorStateKind::Packing)
                .unwrap_or(false);

            if !is_packing {
                warn!("open sector {} is not packing, closing it", open);
                next.open_sector = None;
            }
        }

        let packing: Vec<SectorRecord> = next
            .sectors
            .values()
            .filter(|r| r.kind() == SectorStateKind::Packing)
            .cloned()
            .collect();

        for record in packing {
            let n = record.sector_number;
            let expected = u64::from(record.state.used_capacity());
            let actual = self.sector_store.staged_len(n)?.unwrap_or(0);

            if actual > expected {
                warn!(
                    "sector {}: truncating {} unrecorded staged bytes",
                    n,
                    actual - expected
                );
                self.sector_store.truncate_staged(n, expected)?;
            } else if actual < expected {
                error!(
                    "sector {}: staged file holds {} of {} recorded bytes",
                    n, actual, expected
                );
                let failed = record.fail(format!(
                    "staged sector data truncated ({} of {} bytes)",
                    actual, expected
                ))?;
                next.sectors.insert(n, failed);
                if next.open_sector == Some(n) {
                    next.open_sector = None;
                }
                changed.push(n);
            }
        }

        if next != self.state {
            self.commit(next)?;
            self.publish(&changed);
        }

        Ok(())
    }

    fn commit(&mut self, next: PieceManagerState) -> Result<()> {
        helpers::persist_snapshot(
            &self.kv_store,
            &self.snapshot_key,
            &helpers::make_snapshot(&next),
        )?;
        self.state = next;
        Ok(())
    }

    fn publish(&mut self, sector_numbers: &[SectorNumber]) {
        for n in sector_numbers {
            if let Some(record) = self.state.sectors.get(n) {
                let event = SectorEvent::from(record);

                match &event.reason {
                    Some(reason) => error!("sector {} -> {}: {}", n, event.state, reason),
                    None => info!("sector {} -> {}", n, event.state),
                }

                // a subscriber that stops draining misses events rather than
                // growing its queue without bound
                self.subscribers.retain(|tx| match tx.try_send(event.clone()) {
                    Ok(()) => true,
                    Err(mpsc::TrySendError::Full(_)) => {
                        warn!("subscriber lagging, dropped event for sector {}", n);
                        true
                    }
                    Err(mpsc::TrySendError::Disconnected(_)) => false,
                });
            }
        }
    }

    fn stage_tasks(&self, sector_numbers: &[SectorNumber]) -> Vec<StageTask> {
        sector_numbers
            .iter()
            .filter_map(|n| self.state.sectors.get(n))
            .filter_map(|record| helpers::stage_task(self.sector_store.as_ref(), record))
            .collect()
    }

    pub fn subscribe(&mut self, tx: mpsc::SyncSender<SectorEvent>) {
        self.subscribers.push(tx);
    }

    /// Places the piece, returning its location and the stage tasks of any
    /// sectors which were closed to make room for it.
    pub fn add_piece(
        &mut self,
        deal_info: DealInfo,
        piece_size: UnpaddedBytesAmount,
        piece_file: &mut dyn Read,
    ) -> Result<(DealLocation, Vec<StageTask>)> {
        if let Some(existing) = self.deal_index.get(&deal_info.deal_id) {
            return Err(PieceManagerErr::DuplicateDeal {
                deal_id: deal_info.deal_id,
                sector_number: existing.sector_number,
            });
        }

        let mut next = self.state.clone();

        let outcome = helpers::add_piece(
            self.sector_store.as_ref(),
            self.ids.as_ref(),
            &mut next,
            deal_info,
            piece_size,
            piece_file,
        )?;

        if let Err(err) = self.commit(next) {
            let rollback = outcome.rollback;
            if let Err(truncate_err) = self
                .sector_store
                .truncate_staged(rollback.sector_number, rollback.len)
            {
                error!(
                    "sector {}: could not roll back staged file: {}",
                    rollback.sector_number, truncate_err
                );
            }
            return Err(err);
        }

        self.deal_index.insert(deal_info.deal_id, outcome.location);

        debug!(
            "deal {} placed in sector {} at offset {}",
            deal_info.deal_id, outcome.location.sector_number, outcome.location.offset.0
        );

        self.publish(&outcome.closed);

        Ok((outcome.location, self.stage_tasks(&outcome.closed)))
    }

    pub fn pledge_sector(&mut self) -> Result<(SectorNumber, Vec<StageTask>)> {
        let mut next = self.state.clone();

        let sector_number = helpers::pledge_sector(
            self.sector_store.as_ref(),
            self.ids.as_ref(),
            &mut next,
        )?;

        if let Err(err) = self.commit(next) {
            if let Err(truncate_err) = self.sector_store.truncate_staged(sector_number, 0) {
                error!(
                    "sector {}: could not discard filler: {}",
                    sector_number, truncate_err
                );
            }
            return Err(err);
        }

        self.publish(&[sector_number]);

        Ok((sector_number, self.stage_tasks(&[sector_number])))
    }

    /// Closes the open sector, if any, and starts its pipeline.
    pub fn seal_open_sector(&mut self) -> Result<Option<(SectorNumber, Vec<StageTask>)>> {
        let open = match self.state.open_sector {
            Some(open) => open,
            None => return Ok(None),
        };

        let mut next = self.state.clone();
        helpers::close_sector(&mut next, open)?;
        self.commit(next)?;
        self.publish(&[open]);

        Ok(Some((open, self.stage_tasks(&[open]))))
    }

    pub fn locate_piece(&self, deal_id: DealId) -> Result<DealLocation> {
        helpers::locate_piece(&self.deal_index, &self.state.sectors, deal_id)
    }

    pub fn get_sector(&self, sector_number: SectorNumber) -> Result<SectorRecord> {
        self.state
            .sectors
            .get(&sector_number)
            .cloned()
            .ok_or(PieceManagerErr::SectorNotFound(sector_number))
    }

    pub fn get_seal_status(&self, sector_number: SectorNumber) -> Result<SectorStateKind> {
        self.state
            .sectors
            .get(&sector_number)
            .map(SectorRecord::kind)
            .ok_or(PieceManagerErr::SectorNotFound(sector_number))
    }

    pub fn get_sectors(&self) -> Vec<SectorRecord> {
        self.state.sectors.values().cloned().collect()
    }

    /// Proving sectors with the replica recorded when each finished sealing.
    /// Health checks over them run off the scheduler thread.
    pub fn proving_sectors(&self) -> Vec<ProvingSectorMetadata> {
        self.state
            .sectors
            .values()
            .filter(|r| r.kind() == SectorStateKind::Proving)
            .map(|r| ProvingSectorMetadata {
                sector_number: r.sector_number,
                pieces: r.pieces().to_vec(),
                replica: self.state.replicas.get(&r.sector_number).cloned(),
            })
            .collect()
    }

    /// Stage tasks for every sector persisted mid-pipeline, e.g. after a
    /// crash.
    pub fn resumable_tasks(&self) -> Vec<StageTask> {
        self.state
            .sectors
            .values()
            .filter_map(|record| helpers::stage_task(self.sector_store.as_ref(), record))
            .collect()
    }

    /// Applies a stage result reported by the sealer, returning the next task
    /// to dispatch for the sector, if any. A result whose transition can't be
    /// persisted is kept and re-applied by `retry_unrecorded_results`.
    pub fn handle_stage_result(&mut self, report: StageReport) -> Result<Option<StageTask>> {
        match self.apply_stage_report(report.clone()) {
            Err(err) => {
                if is_persistence_failure(&err) {
                    self.unrecorded.push(report);
                }
                Err(err)
            }
            applied => applied,
        }
    }

    pub fn has_unrecorded_results(&self) -> bool {
        !self.unrecorded.is_empty()
    }

    /// Re-applies results that previously failed to persist, returning the
    /// tasks to dispatch for those that went through.
    pub fn retry_unrecorded_results(&mut self) -> Vec<StageTask> {
        let pending = std::mem::replace(&mut self.unrecorded, vec![]);
        let mut tasks = vec![];

        for report in pending {
            let (sector_number, stage) = (report.sector_number, report.stage);

            match self.handle_stage_result(report) {
                Ok(next) => tasks.extend(next),
                Err(err) => warn!(
                    "sector {}: {:?} result still not recorded: {}",
                    sector_number, stage, err
                ),
            }
        }

        tasks
    }

    fn apply_stage_report(&mut self, report: StageReport) -> Result<Option<StageTask>> {
        let StageReport {
            sector_number,
            stage,
            result,
            replica,
        } = report;

        let record = self.get_sector(sector_number)?;

        match &record.state {
            SectorState::Sealing { stage: current, .. } if *current == stage => (),
            _ => {
                warn!(
                    "sector {}: ignoring {:?} result, sector is {}",
                    sector_number,
                    stage,
                    record.kind()
                );
                return Ok(None);
            }
        }

        match result {
            Ok(output) => {
                let advanced = record.advance(stage, output)?;
                let mut next = self.state.clone();

                if advanced.kind() == SectorStateKind::Proving {
                    match replica {
                        Some(replica) => {
                            next.replicas.insert(sector_number, replica);
                        }
                        None => warn!("sector {}: proving without a sealed replica", sector_number),
                    }
                }

                next.sectors.insert(sector_number, advanced);
                self.commit(next)?;
                self.stage_attempts.remove(&sector_number);
                self.publish(&[sector_number]);

                Ok(self.stage_tasks(&[sector_number]).pop())
            }
            Err(SealerError::Transient(msg)) => {
                let attempts = {
                    let attempts = self.stage_attempts.entry(sector_number).or_insert(0);
                    *attempts += 1;
                    *attempts
                };

                if attempts <= self.max_stage_retries {
                    warn!(
                        "sector {}: {:?} failed (attempt {} of {}), retrying: {}",
                        sector_number,
                        stage,
                        attempts,
                        self.max_stage_retries + 1,
                        msg
                    );
                    return Ok(helpers::stage_task(self.sector_store.as_ref(), &record));
                }

                self.fail_sector(
                    sector_number,
                    format!("{:?} failed after {} attempts: {}", stage, attempts, msg),
                )?;
                Ok(None)
            }
            Err(SealerError::Fatal(msg)) => {
                self.fail_sector(sector_number, format!("{:?} failed: {}", stage, msg))?;
                Ok(None)
            }
        }
    }

    fn fail_sector(&mut self, sector_number: SectorNumber, reason: String) -> Result<()> {
        let failed = self.get_sector(sector_number)?.fail(reason)?;

        let mut next = self.state.clone();
        next.sectors.insert(sector_number, failed);
        if next.open_sector == Some(sector_number) {
            next.open_sector = None;
        }

        self.commit(next)?;
        self.stage_attempts.remove(&sector_number);
        self.publish(&[sector_number]);

        Ok(())
    }

    /// Cancels a sector's pipeline. Any result still in flight for it is
    /// ignored when it arrives.
    pub fn abort_sealing(&mut self, sector_number: SectorNumber, reason: &str) -> Result<()> {
        let record = self.get_sector(sector_number)?;

        match record.state {
            SectorState::Sealing { .. } => self.fail_sector(sector_number, reason.to_string()),
            _ => Err(err_transition(
                sector_number,
                record.kind(),
                SectorStateKind::Failed,
            )),
        }
    }

    pub fn create_unseal_task(&self, sector_number: SectorNumber) -> Result<UnsealTask> {
        let record = self.get_sector(sector_number)?;
        helpers::unseal_task(self.sector_store.as_ref(), &record, None)
    }

    pub fn create_unseal_piece_task(&self, deal_id: DealId) -> Result<UnsealTask> {
        let location = self.locate_piece(deal_id)?;
        let record = self.get_sector(location.sector_number)?;

        helpers::unseal_task(
            self.sector_store.as_ref(),
            &record,
            Some((location.offset, location.size)),
        )
    }

    pub fn new_unsealed_file(&self) -> Result<NamedTempFile> {
        self.sector_store.new_unsealed_file()
    }
}

fn is_persistence_failure(err: &PieceManagerErr) -> bool {
    match err {
        PieceManagerErr::Io(_) | PieceManagerErr::Serialization(_) => true,
        _ => false,
    }
}
