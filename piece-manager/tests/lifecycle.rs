mod common;

use std::sync::mpsc::RecvTimeoutError;
use std::thread;
use std::time::Duration;

use piece_manager::{
    GetProvingSectorResult, PieceManager, PieceManagerErr, SealedSectorHealth, SealerError,
    SealingStage, SectorState, SectorStateKind, UnpaddedByteIndex,
};

use common::*;

#[test]
fn test_pledged_sector_walks_every_stage() {
    let h = Harness::new();
    let m = h.start_immediate();
    let rx = m.subscribe().unwrap();

    let sector_number = m.pledge_sector().unwrap();

    let mut seen = vec![];
    loop {
        let event = rx
            .recv_timeout(std::time::Duration::from_secs(30))
            .unwrap();
        if event.sector_number != sector_number {
            continue;
        }
        seen.push(event.state);
        if event.state.is_terminal() {
            break;
        }
    }

    assert_eq!(
        vec![
            SectorStateKind::PreCommit1,
            SectorStateKind::PreCommit2,
            SectorStateKind::PreCommitting,
            SectorStateKind::WaitSeed,
            SectorStateKind::Committing,
            SectorStateKind::CommitWait,
            SectorStateKind::FinalizeSector,
            SectorStateKind::Proving,
        ],
        seen
    );

    let sectors = m.get_sectors().unwrap();
    assert_eq!(1, sectors.len());
    assert_eq!(1, sectors[0].pieces().len());
    assert_eq!(None, sectors[0].pieces()[0].deal_id());
}

#[test]
fn test_deal_not_addressable_until_encoded() {
    let h = Harness::new();
    let (sealer, release) = GatedSealer::new(SealingStage::PreCommit1);
    let m = h.start(sealer);

    let location = add_deal(&m, 1, 1000);
    m.seal_open_sector().unwrap();

    match m.locate_piece_for_deal_within_sector(1) {
        Err(PieceManagerErr::NotYetEncoded { state, .. }) => {
            assert_eq!(SectorStateKind::PreCommit1, state)
        }
        other => panic!("expected NotYetEncoded, got {:?}", other),
    }
    match m.unseal_sector(location.sector_number) {
        Err(PieceManagerErr::NotYetEncoded { .. }) => (),
        other => panic!("expected NotYetEncoded, got {:?}", other.map(|s| s.len())),
    }

    release.send(()).unwrap();
    wait_for_status(&m, location.sector_number, SectorStateKind::Proving);

    assert_eq!(location, m.locate_piece_for_deal_within_sector(1).unwrap());
}

#[test]
fn test_fatal_stage_failure_fails_sector() {
    let h = Harness::new();
    let sealer = ScriptedSealer::new(
        SealingStage::PreCommit2,
        vec![SealerError::Fatal("bad replica".to_string())],
    );
    let m = h.start(sealer.clone());
    let rx = m.subscribe().unwrap();

    let location = add_deal(&m, 1, 1000);
    m.seal_open_sector().unwrap();

    let event = wait_for_event(&rx, location.sector_number, SectorStateKind::Failed);
    assert!(event.reason.unwrap().contains("bad replica"));
    assert_eq!(1, sealer.attempts());

    match m.locate_piece_for_deal_within_sector(1) {
        Err(PieceManagerErr::NotYetEncoded { state, .. }) => {
            assert_eq!(SectorStateKind::Failed, state)
        }
        other => panic!("expected NotYetEncoded, got {:?}", other),
    }
    match m.unseal_sector(location.sector_number) {
        Err(PieceManagerErr::SealingFailed { sector_number, .. }) => {
            assert_eq!(location.sector_number, sector_number)
        }
        other => panic!("expected SealingFailed, got {:?}", other.map(|s| s.len())),
    }

    match &m.get_sectors().unwrap()[0].state {
        SectorState::Failed { failed_in, .. } => {
            assert_eq!(SectorStateKind::PreCommit2, *failed_in)
        }
        other => panic!("expected failed sector, got {:?}", other),
    }
}

#[test]
fn test_transient_failures_are_retried() {
    let h = Harness::new();
    let sealer = ScriptedSealer::new(
        SealingStage::Committing,
        vec![
            SealerError::Transient("message not yet included".to_string()),
            SealerError::Transient("message not yet included".to_string()),
        ],
    );
    let m = h.start(sealer.clone());

    let sector_number = m.pledge_sector().unwrap();

    wait_for_status(&m, sector_number, SectorStateKind::Proving);
    assert_eq!(3, sealer.attempts());
}

#[test]
fn test_retry_budget_exhausted() {
    let h = Harness::new();
    let errors = (0..10)
        .map(|_| SealerError::Transient("chain unreachable".to_string()))
        .collect();
    let sealer = ScriptedSealer::new(SealingStage::WaitSeed, errors);
    let m = h.start(sealer.clone());
    let rx = m.subscribe().unwrap();

    let sector_number = m.pledge_sector().unwrap();

    wait_for_event(&rx, sector_number, SectorStateKind::Failed);
    assert_eq!(h.config.max_stage_retries as usize + 1, sealer.attempts());
}

#[test]
fn test_abort_sealing() {
    let mut h = Harness::new();
    h.config.num_workers = 1;

    let (sealer, release) = GatedSealer::new(SealingStage::PreCommit1);
    let m = h.start(sealer);

    let aborted = m.pledge_sector().unwrap();
    m.abort_sealing(aborted).unwrap();
    assert_eq!(SectorStateKind::Failed, m.get_seal_status(aborted).unwrap());

    let other = m.pledge_sector().unwrap();
    drop(release);

    // with one worker, the aborted sector's stale result lands first
    wait_for_status(&m, other, SectorStateKind::Proving);
    assert_eq!(SectorStateKind::Failed, m.get_seal_status(aborted).unwrap());

    match m.abort_sealing(other) {
        Err(PieceManagerErr::InvalidTransition { from, .. }) => {
            assert_eq!(SectorStateKind::Proving, from)
        }
        other => panic!("expected InvalidTransition, got {:?}", other),
    }
    match m.abort_sealing(9999) {
        Err(PieceManagerErr::SectorNotFound(9999)) => (),
        other => panic!("expected SectorNotFound, got {:?}", other),
    }
}

#[test]
fn test_proving_sector_health() {
    let h = Harness::new();
    let m = h.start_immediate();

    let sector_number = m.pledge_sector().unwrap();
    wait_for_status(&m, sector_number, SectorStateKind::Proving);

    let health = |m: &piece_manager::SectorPieceManager| match &m
        .get_proving_sectors(true)
        .unwrap()[..]
    {
        [GetProvingSectorResult::WithHealth(health, meta)] => {
            assert_eq!(sector_number, meta.sector_number);
            (*health, meta.replica.clone().unwrap().sector_access)
        }
        other => panic!("unexpected proving sectors: {:?}", other),
    };

    let (status, path) = health(&m);
    assert_eq!(SealedSectorHealth::Ok, status);

    let len = std::fs::metadata(&path).unwrap().len() as usize;
    std::fs::write(&path, vec![0xffu8; len]).unwrap();
    assert_eq!(SealedSectorHealth::ErrorInvalidChecksum, health(&m).0);

    std::fs::write(&path, vec![0xffu8; len / 2]).unwrap();
    assert_eq!(SealedSectorHealth::ErrorInvalidLength, health(&m).0);

    std::fs::remove_file(&path).unwrap();
    assert_eq!(SealedSectorHealth::ErrorMissing, health(&m).0);

    match &m.get_proving_sectors(false).unwrap()[..] {
        [GetProvingSectorResult::WithoutHealth(meta)] => {
            assert_eq!(sector_number, meta.sector_number)
        }
        other => panic!("unexpected proving sectors: {:?}", other),
    }
}

#[test]
fn test_state_survives_restart() {
    let h = Harness::new();

    let (pledged, packing) = {
        let m = h.start_immediate();
        let pledged = m.pledge_sector().unwrap();
        wait_for_status(&m, pledged, SectorStateKind::Proving);

        let packing = add_deal(&m, 1, 1000);
        (pledged, packing)
    };

    let m = h.start_immediate();
    assert_eq!(2, m.get_sectors().unwrap().len());
    assert_eq!(SectorStateKind::Proving, m.get_seal_status(pledged).unwrap());

    match m.locate_piece_for_deal_within_sector(1) {
        Err(PieceManagerErr::NotYetEncoded { state, .. }) => {
            assert_eq!(SectorStateKind::Packing, state)
        }
        other => panic!("expected NotYetEncoded, got {:?}", other),
    }

    // the open sector keeps filling where it left off
    let next = add_deal(&m, 2, 500);
    assert_eq!(packing.sector_number, next.sector_number);
    assert_eq!(UnpaddedByteIndex(1000), next.offset);

    // sector numbers are never reissued
    let pledged_again = m.pledge_sector().unwrap();
    assert!(pledged_again > pledged);
    assert!(pledged_again > packing.sector_number);
}

#[test]
fn test_shutdown_leaves_sealing_sectors_resumable() {
    let h = Harness::new();
    let (sealer, release) = GatedSealer::new(SealingStage::WaitSeed);
    let m = h.start(sealer);
    let rx = m.subscribe().unwrap();

    let sector_number = m.pledge_sector().unwrap();
    wait_for_event(&rx, sector_number, SectorStateKind::WaitSeed);

    // dropping blocks until the gated worker returns
    let dropper = thread::spawn(move || drop(m));

    // the event channel closes once the scheduler has exited
    loop {
        match rx.recv_timeout(Duration::from_secs(30)) {
            Ok(event) => assert_ne!(SectorStateKind::Failed, event.state),
            Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => panic!("scheduler did not shut down"),
        }
    }

    drop(release);
    dropper.join().unwrap();

    // the pipeline picks up again from its persisted stage
    let m = h.start_immediate();
    wait_for_status(&m, sector_number, SectorStateKind::Proving);
}
