//! Claim coordinator tests
//!
//! Exercises claiming, release, disconnects and restart recovery against an
//! in-memory device backend, plus the privileged route through a real helper
//! socket.
//!
//! Run with: `cargo test -p server --test claim_coordinator_tests`

mod support;

use common::UsbFailure;
use common::test_utils::{DEFAULT_TEST_TIMEOUT, create_mock_device, with_timeout};
use protocol::{ClaimMethod, ClaimState};
use server::claim::{ClaimCoordinator, ClaimError, ClaimSnapshot};
use server::ipc::{HelperService, IpcClient};
use server::supervisor::{InstallationStatus, Route};
use std::sync::Arc;
use std::time::Duration;
use support::{FakeUsb, client_options, direct_coordinator, server_options, start_server};
use tempfile::tempdir;
use tokio::sync::watch;

// ============================================================================
// Claim and release
// ============================================================================

mod claiming {
    use super::*;

    #[tokio::test]
    async fn test_claim_then_release() {
        let device = create_mock_device(1, 2, 0x1234, 0x5678);
        let usb = FakeUsb::new(vec![device.clone()]);
        let coordinator = direct_coordinator(&usb);

        let claimed = coordinator.claim(&device).await.unwrap();
        assert_eq!(claimed.state, ClaimState::Claimed);
        assert_eq!(claimed.method, ClaimMethod::ExclusiveAccess);
        assert!(!claimed.via_helper());
        assert!(coordinator.is_claimed(device.key()));
        assert!(usb.is_held(device.key()));

        coordinator.release(device.key()).await.unwrap();
        assert!(!coordinator.is_claimed(device.key()));
        assert!(!usb.is_held(device.key()));
        assert!(coordinator.list_claimed().is_empty());
    }

    #[tokio::test]
    async fn test_second_claim_is_rejected() {
        let device = create_mock_device(1, 2, 0x1234, 0x5678);
        let usb = FakeUsb::new(vec![device.clone()]);
        let coordinator = direct_coordinator(&usb);

        coordinator.claim(&device).await.unwrap();
        assert_eq!(
            coordinator.claim(&device).await.unwrap_err(),
            ClaimError::DeviceAlreadyClaimed(device.key())
        );
        // The device was only opened once
        assert_eq!(usb.claim_count(), 1);
    }

    #[tokio::test]
    async fn test_verify_confirms_existing_claim() {
        let device = create_mock_device(1, 2, 0x1234, 0x5678);
        let usb = FakeUsb::new(vec![device.clone()]);
        let coordinator = direct_coordinator(&usb);

        let first = coordinator.claim(&device).await.unwrap();
        let confirmed = coordinator.verify(&device).await.unwrap();
        assert_eq!(first, confirmed);
        assert_eq!(usb.claim_count(), 1);
    }

    #[tokio::test]
    async fn test_release_unclaimed_device() {
        let device = create_mock_device(1, 2, 0x1234, 0x5678);
        let usb = FakeUsb::new(vec![device.clone()]);
        let coordinator = direct_coordinator(&usb);

        assert_eq!(
            coordinator.release(device.key()).await.unwrap_err(),
            ClaimError::DeviceNotClaimed(device.key())
        );
    }

    #[tokio::test]
    async fn test_independent_devices() {
        let a = create_mock_device(1, 2, 0x1234, 0x5678);
        let b = create_mock_device(1, 3, 0x1234, 0x5679);
        let usb = FakeUsb::new(vec![a.clone(), b.clone()]);
        let coordinator = direct_coordinator(&usb);

        coordinator.claim(&a).await.unwrap();
        coordinator.claim(&b).await.unwrap();
        assert_eq!(coordinator.list_claimed().len(), 2);

        coordinator.release_all().await;
        assert!(coordinator.list_claimed().is_empty());
        assert_eq!(usb.release_count(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() {
        let device = create_mock_device(1, 2, 0x1234, 0x5678);
        let usb = FakeUsb::slow(vec![device.clone()], Duration::from_millis(20));
        let coordinator = Arc::new(direct_coordinator(&usb));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let coordinator = coordinator.clone();
            let device = device.clone();
            handles.push(tokio::spawn(async move { coordinator.claim(&device).await }));
        }

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(e) => assert_eq!(e, ClaimError::DeviceAlreadyClaimed(device.key())),
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(usb.claim_count(), 1);
    }

    #[tokio::test]
    async fn test_session_release_only_frees_its_own_claim() {
        let device = create_mock_device(1, 2, 0x1234, 0x5678);
        let usb = FakeUsb::new(vec![device.clone()]);
        let coordinator = direct_coordinator(&usb);

        coordinator.claim_for(&device, 1).await.unwrap();
        assert!(coordinator.is_held_by(device.key(), 1));
        assert!(!coordinator.is_held_by(device.key(), 2));

        assert_eq!(
            coordinator.release_for(device.key(), 2).await.unwrap_err(),
            ClaimError::DeviceNotClaimed(device.key())
        );
        assert!(usb.is_held(device.key()));

        coordinator.release_for(device.key(), 1).await.unwrap();
        assert!(!usb.is_held(device.key()));
    }
}

// ============================================================================
// Release racing a claim
// ============================================================================

mod races {
    use super::*;

    #[tokio::test]
    async fn test_claim_waits_for_disconnect_to_finish() {
        let device = create_mock_device(1, 2, 0x1234, 0x5678);
        let usb = FakeUsb::slow_release(vec![device.clone()], Duration::from_millis(50));
        let coordinator = Arc::new(direct_coordinator(&usb));
        coordinator.claim_for(&device, 1).await.unwrap();

        let key = device.key();
        let disconnect = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.mark_disconnected(key).await })
        };
        // Let the disconnect take the slot and start releasing
        tokio::time::sleep(Duration::from_millis(10)).await;
        let claimed = coordinator.claim_for(&device, 2).await;

        assert!(disconnect.await.unwrap());
        assert!(claimed.is_ok());
        assert!(coordinator.is_held_by(device.key(), 2));
        assert!(usb.is_held(device.key()));
    }

    #[tokio::test]
    async fn test_release_and_claim_agree_with_device() {
        let device = create_mock_device(1, 2, 0x1234, 0x5678);
        let usb = FakeUsb::slow_release(vec![device.clone()], Duration::from_millis(5));
        let coordinator = Arc::new(direct_coordinator(&usb));
        let key = device.key();

        for round in 0..20u64 {
            if !coordinator.is_claimed(device.key()) {
                coordinator.claim_for(&device, round).await.unwrap();
            }
            let release = {
                let coordinator = coordinator.clone();
                tokio::spawn(async move { coordinator.release(key).await })
            };
            let claim = {
                let coordinator = coordinator.clone();
                let device = device.clone();
                tokio::spawn(async move { coordinator.claim_for(&device, round + 100).await })
            };
            let _ = release.await.unwrap();
            let _ = claim.await.unwrap();

            assert_eq!(
                coordinator.is_claimed(device.key()),
                usb.is_held(device.key()),
                "round {}",
                round
            );
        }
    }
}

// ============================================================================
// Failures and history
// ============================================================================

mod failures {
    use super::*;

    #[tokio::test]
    async fn test_failed_claim_can_be_retried() {
        let device = create_mock_device(1, 2, 0x1234, 0x5678);
        let usb = FakeUsb::new(vec![device.clone()]);
        let coordinator = direct_coordinator(&usb);

        usb.fail_claims(
            device.key(),
            UsbFailure::new(UsbFailure::ACCESS, "permission denied"),
        );
        let err = coordinator.claim(&device).await.unwrap_err();
        assert!(matches!(err, ClaimError::AccessDenied(_)));
        assert!(!coordinator.is_claimed(device.key()));

        usb.heal(device.key());
        coordinator.claim(&device).await.unwrap();
        assert!(coordinator.is_claimed(device.key()));

        let states: Vec<(Option<ClaimState>, ClaimState)> = coordinator
            .history()
            .iter()
            .map(|e| (e.from, e.to))
            .collect();
        assert_eq!(
            states,
            vec![
                (None, ClaimState::Pending),
                (Some(ClaimState::Pending), ClaimState::Failed),
                (Some(ClaimState::Failed), ClaimState::Pending),
                (Some(ClaimState::Pending), ClaimState::Claimed),
            ]
        );
    }

    #[tokio::test]
    async fn test_busy_failure_keeps_code() {
        let device = create_mock_device(1, 2, 0x1234, 0x5678);
        let usb = FakeUsb::new(vec![device.clone()]);
        let coordinator = direct_coordinator(&usb);

        usb.fail_claims(device.key(), UsbFailure::new(UsbFailure::BUSY, "busy"));
        let err = coordinator.claim(&device).await.unwrap_err();
        assert_eq!(err.code(), Some(UsbFailure::BUSY));
    }

    #[tokio::test]
    async fn test_disconnect_drops_claim() {
        let device = create_mock_device(1, 2, 0x1234, 0x5678);
        let usb = FakeUsb::new(vec![device.clone()]);
        let coordinator = direct_coordinator(&usb);

        coordinator.claim(&device).await.unwrap();
        assert!(coordinator.mark_disconnected(device.key()).await);
        assert!(!coordinator.is_claimed(device.key()));
        // Nothing left to disconnect
        assert!(!coordinator.mark_disconnected(device.key()).await);

        let last = coordinator.history().pop().unwrap();
        assert_eq!(last.to, ClaimState::Disconnected);

        // Same identity plugged back in starts over
        coordinator.claim(&device).await.unwrap();
        assert!(coordinator.is_claimed(device.key()));
    }
}

// ============================================================================
// Restart recovery
// ============================================================================

mod restart {
    use super::*;

    #[tokio::test]
    async fn test_restore_reverifies_persisted_claims() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("claims.json");

        let kept = create_mock_device(1, 2, 0x1234, 0x5678);
        let unplugged = create_mock_device(1, 3, 0x1234, 0x5679);
        let broken = create_mock_device(1, 4, 0x1234, 0x567a);
        let devices = vec![kept.clone(), unplugged.clone(), broken.clone()];

        {
            let usb = FakeUsb::new(devices.clone());
            let coordinator =
                direct_coordinator(&usb).with_snapshot(ClaimSnapshot::new(&path));
            for device in &devices {
                coordinator.claim(device).await.unwrap();
            }
            // Crash: no release
        }
        assert_eq!(ClaimSnapshot::new(&path).load().await.unwrap().len(), 3);

        let usb = FakeUsb::new(devices.clone());
        usb.unplug(unplugged.key());
        usb.fail_claims(broken.key(), UsbFailure::new(UsbFailure::OTHER, "stale"));
        let coordinator = direct_coordinator(&usb).with_snapshot(ClaimSnapshot::new(&path));

        let restored = coordinator.restore_after_restart().await;
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].key(), kept.key());
        assert!(coordinator.is_claimed(kept.key()));
        assert!(!coordinator.is_claimed(unplugged.key()));
        assert!(!coordinator.is_claimed(broken.key()));

        let persisted = ClaimSnapshot::new(&path).load().await.unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].bus_id, kept.bus_id);
    }

    #[tokio::test]
    async fn test_restored_claim_is_adopted_by_first_session() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("claims.json");
        let adopted = create_mock_device(1, 2, 0x1234, 0x5678);
        let orphaned = create_mock_device(1, 3, 0x1234, 0x5679);
        let devices = vec![adopted.clone(), orphaned.clone()];

        {
            let usb = FakeUsb::new(devices.clone());
            let coordinator =
                direct_coordinator(&usb).with_snapshot(ClaimSnapshot::new(&path));
            for device in &devices {
                coordinator.claim_for(device, 1).await.unwrap();
            }
        }

        let usb = FakeUsb::new(devices.clone());
        let coordinator = direct_coordinator(&usb).with_snapshot(ClaimSnapshot::new(&path));
        assert_eq!(coordinator.restore_after_restart().await.len(), 2);
        assert!(!coordinator.is_held_by(adopted.key(), 7));

        // The reconnecting client takes over the restored claim
        let claimed = coordinator.claim_for(&adopted, 7).await.unwrap();
        assert_eq!(claimed.key(), adopted.key());
        assert!(coordinator.is_held_by(adopted.key(), 7));
        assert_eq!(usb.claim_count(), 2);
        // Only once
        assert_eq!(
            coordinator.claim_for(&adopted, 8).await.unwrap_err(),
            ClaimError::DeviceAlreadyClaimed(adopted.key())
        );

        assert_eq!(coordinator.release_unadopted().await, 1);
        assert!(coordinator.is_held_by(adopted.key(), 7));
        assert!(!coordinator.is_claimed(orphaned.key()));
        assert!(!usb.is_held(orphaned.key()));
        assert_eq!(coordinator.release_unadopted().await, 0);
    }

    #[tokio::test]
    async fn test_graceful_release_empties_snapshot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("claims.json");
        let device = create_mock_device(1, 2, 0x1234, 0x5678);
        let usb = FakeUsb::new(vec![device.clone()]);
        let coordinator = direct_coordinator(&usb).with_snapshot(ClaimSnapshot::new(&path));

        coordinator.claim(&device).await.unwrap();
        coordinator.release_all().await;

        assert!(ClaimSnapshot::new(&path).load().await.unwrap().is_empty());
        assert!(coordinator.restore_after_restart().await.is_empty());
    }

    #[tokio::test]
    async fn test_restore_without_snapshot() {
        let usb = FakeUsb::new(Vec::new());
        let coordinator = direct_coordinator(&usb);
        assert!(coordinator.restore_after_restart().await.is_empty());
    }
}

// ============================================================================
// Privileged route
// ============================================================================

mod privileged {
    use super::*;

    fn helper_method() -> ClaimMethod {
        ClaimMethod::DriverUnbind {
            detached_interfaces: vec![0],
        }
    }

    #[tokio::test]
    async fn test_claim_through_helper() {
        let dir = tempdir().unwrap();
        let socket = dir.path().join("helper.sock");
        let device = create_mock_device(1, 2, 0x1234, 0x5678);

        let helper_usb = FakeUsb::with_method(vec![device.clone()], helper_method());
        let helper = Arc::new(direct_coordinator(&helper_usb));
        let ipc = start_server(
            server_options(&socket),
            Arc::new(HelperService::new(helper.clone())),
        )
        .await;

        let client = IpcClient::connect(&socket, client_options(Duration::from_secs(2)))
            .await
            .unwrap();
        let (_route_tx, routes) = watch::channel(Route::Privileged(client.clone()));
        let (_status_tx, installation) = watch::channel(InstallationStatus::Completed);
        let local = FakeUsb::new(vec![device.clone()]);
        let coordinator = ClaimCoordinator::new(local.clone(), local.clone(), routes, installation);

        let claimed = coordinator.claim(&device).await.unwrap();
        assert_eq!(claimed.method, helper_method());
        assert!(claimed.via_helper());
        assert!(helper.is_claimed(device.key()));
        // Opened locally for transfers as well
        assert!(local.is_held(device.key()));
        assert_eq!(coordinator.status().route, "privileged");

        coordinator.release(device.key()).await.unwrap();
        assert!(!helper.is_claimed(device.key()));
        assert!(!local.is_held(device.key()));

        client.stop().await;
        ipc.stop().await;
    }

    #[tokio::test]
    async fn test_local_open_failure_rolls_back_helper_claim() {
        let dir = tempdir().unwrap();
        let socket = dir.path().join("helper.sock");
        let device = create_mock_device(1, 2, 0x1234, 0x5678);

        let helper_usb = FakeUsb::with_method(vec![device.clone()], helper_method());
        let helper = Arc::new(direct_coordinator(&helper_usb));
        let ipc = start_server(
            server_options(&socket),
            Arc::new(HelperService::new(helper.clone())),
        )
        .await;

        let client = IpcClient::connect(&socket, client_options(Duration::from_secs(2)))
            .await
            .unwrap();
        let (_route_tx, routes) = watch::channel(Route::Privileged(client.clone()));
        let (_status_tx, installation) = watch::channel(InstallationStatus::Completed);
        let local = FakeUsb::new(vec![device.clone()]);
        local.fail_claims(device.key(), UsbFailure::new(UsbFailure::ACCESS, "denied"));
        let coordinator = ClaimCoordinator::new(local.clone(), local.clone(), routes, installation);

        assert!(coordinator.claim(&device).await.is_err());
        assert!(!helper.is_claimed(device.key()));

        client.stop().await;
        ipc.stop().await;
    }

    #[tokio::test]
    async fn test_lost_helper_falls_back_to_direct_claim() {
        let dir = tempdir().unwrap();
        let socket = dir.path().join("helper.sock");
        let device = create_mock_device(1, 2, 0x1234, 0x5678);

        let helper_usb = FakeUsb::with_method(vec![device.clone()], helper_method());
        let ipc = start_server(
            server_options(&socket),
            Arc::new(HelperService::new(Arc::new(direct_coordinator(&helper_usb)))),
        )
        .await;
        let client = IpcClient::connect(&socket, client_options(Duration::from_secs(2)))
            .await
            .unwrap();

        ipc.stop().await;
        with_timeout(DEFAULT_TEST_TIMEOUT, client.closed())
            .await
            .unwrap();

        let (_route_tx, routes) = watch::channel(Route::Privileged(client.clone()));
        let (_status_tx, installation) = watch::channel(InstallationStatus::Completed);
        let local = FakeUsb::new(vec![device.clone()]);
        let coordinator = ClaimCoordinator::new(local.clone(), local.clone(), routes, installation);

        let claimed = coordinator.claim(&device).await.unwrap();
        assert_eq!(claimed.method, ClaimMethod::ExclusiveAccess);
        assert!(local.is_held(device.key()));
        assert_eq!(helper_usb.claim_count(), 0);
    }

    #[tokio::test]
    async fn test_helper_timeout_does_not_leak_claim() {
        let dir = tempdir().unwrap();
        let socket = dir.path().join("helper.sock");
        let device = create_mock_device(1, 2, 0x1234, 0x5678);

        let helper_usb = FakeUsb::slow_with_method(
            vec![device.clone()],
            helper_method(),
            Duration::from_millis(600),
        );
        let helper = Arc::new(direct_coordinator(&helper_usb));
        let ipc = start_server(
            server_options(&socket),
            Arc::new(HelperService::new(helper.clone())),
        )
        .await;

        let client = IpcClient::connect(&socket, client_options(Duration::from_millis(200)))
            .await
            .unwrap();
        let (_route_tx, routes) = watch::channel(Route::Privileged(client.clone()));
        let (_status_tx, installation) = watch::channel(InstallationStatus::Completed);
        let local = FakeUsb::new(vec![device.clone()]);
        let coordinator = ClaimCoordinator::new(local.clone(), local.clone(), routes, installation);

        let err = coordinator.claim(&device).await.unwrap_err();
        assert!(matches!(err, ClaimError::DeviceClaimFailed { .. }), "{:?}", err);
        // No direct claim behind the helper's back
        assert_eq!(local.claim_count(), 0);
        assert!(!coordinator.is_claimed(device.key()));

        // The helper finishes its claim and then the rollback frees it
        with_timeout(DEFAULT_TEST_TIMEOUT, async {
            while helper_usb.release_count() == 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(helper_usb.claim_count(), 1);
        assert!(!helper_usb.is_held(device.key()));
        assert!(!helper.is_claimed(device.key()));

        client.stop().await;
        ipc.stop().await;
    }

    #[tokio::test]
    async fn test_helper_busy_device_is_already_claimed() {
        let dir = tempdir().unwrap();
        let socket = dir.path().join("helper.sock");
        let device = create_mock_device(1, 2, 0x1234, 0x5678);

        let helper_usb = FakeUsb::with_method(vec![device.clone()], helper_method());
        let helper = Arc::new(direct_coordinator(&helper_usb));
        helper.claim(&device).await.unwrap();
        let ipc = start_server(
            server_options(&socket),
            Arc::new(HelperService::new(helper.clone())),
        )
        .await;

        let client = IpcClient::connect(&socket, client_options(Duration::from_secs(2)))
            .await
            .unwrap();
        let (_route_tx, routes) = watch::channel(Route::Privileged(client.clone()));
        let (_status_tx, installation) = watch::channel(InstallationStatus::Completed);
        let local = FakeUsb::new(vec![device.clone()]);
        let coordinator = ClaimCoordinator::new(local.clone(), local.clone(), routes, installation);

        assert_eq!(
            coordinator.claim(&device).await.unwrap_err(),
            ClaimError::DeviceAlreadyClaimed(device.key())
        );
        assert_eq!(local.claim_count(), 0);
        assert!(helper.is_claimed(device.key()));

        client.stop().await;
        ipc.stop().await;
    }
}
