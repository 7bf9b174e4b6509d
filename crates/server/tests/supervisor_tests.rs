//! Helper installation and route supervision tests
//!
//! Uses a scripted installer and, where a privileged route is expected, a
//! real helper socket.
//!
//! Run with: `cargo test -p server --test supervisor_tests`

mod support;

use common::test_utils::{DEFAULT_TEST_TIMEOUT, with_timeout};
use server::ports::InstallOutcome;
use server::supervisor::{
    InstallationStatus, InstallationStore, Route, Supervisor, SupervisorOptions,
};
use std::path::Path;
use std::time::Duration;
use support::{FakeInstaller, SlowHandler, client_options, server_options, start_server};
use tempfile::tempdir;

fn options(dir: &Path) -> SupervisorOptions {
    SupervisorOptions {
        socket_path: dir.join("helper.sock"),
        client: client_options(Duration::from_secs(1)),
        install_timeout: Duration::from_secs(5),
        max_install_attempts: 3,
        reconnect_interval: Duration::from_millis(20),
        max_reconnect_attempts: 2,
        status_path: dir.join("installation.json"),
    }
}

async fn wait_for_status(
    supervisor: &Supervisor,
    done: impl Fn(&InstallationStatus) -> bool,
) -> InstallationStatus {
    let mut rx = supervisor.installation();
    with_timeout(DEFAULT_TEST_TIMEOUT, rx.wait_for(|s| done(s)))
        .await
        .expect("installation should settle")
        .expect("supervisor alive")
        .clone()
}

// ============================================================================
// Installation outcomes
// ============================================================================

mod installation {
    use super::*;

    #[tokio::test]
    async fn test_no_bundle_stays_on_fallback() {
        let dir = tempdir().unwrap();
        let installer = FakeInstaller::new(None, Ok(InstallOutcome::Completed));
        let supervisor = Supervisor::new(options(dir.path()), installer.clone());

        supervisor.start().await;
        assert!(!supervisor.route().is_privileged());
        assert_eq!(supervisor.status(), InstallationStatus::NotAttempted);
        assert_eq!(installer.calls(), 0);

        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_slow_install_times_out_and_is_persisted() {
        let dir = tempdir().unwrap();
        let installer = FakeInstaller::slow(
            Some(dir.path().join("helper.bundle")),
            Ok(InstallOutcome::Completed),
            Duration::from_secs(60),
        );
        let mut options = options(dir.path());
        options.install_timeout = Duration::from_millis(100);
        let supervisor = Supervisor::new(options, installer.clone());

        // start never waits for the installer
        with_timeout(Duration::from_secs(1), supervisor.start())
            .await
            .unwrap();
        assert!(!supervisor.route().is_privileged());

        let status = wait_for_status(&supervisor, |s| {
            matches!(s, InstallationStatus::Failed { .. })
        })
        .await;
        assert_eq!(status.attempts(), 1);
        assert!(!supervisor.route().is_privileged());

        let persisted = InstallationStore::new(dir.path().join("installation.json"))
            .load()
            .await;
        assert_eq!(persisted, status);
        assert_eq!(installer.calls(), 1);

        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_failed_install_counts_attempts_across_restarts() {
        let dir = tempdir().unwrap();
        let bundle = Some(dir.path().join("helper.bundle"));

        for expected in 1..=3 {
            let installer = FakeInstaller::new(bundle.clone(), Err("exit status 1".to_string()));
            let supervisor = Supervisor::new(options(dir.path()), installer);
            supervisor.start().await;
            // The previous run's failure is visible until this attempt settles
            let status = wait_for_status(&supervisor, |s| s.attempts() == expected).await;
            assert!(matches!(status, InstallationStatus::Failed { .. }));
            supervisor.stop().await;
        }

        // Out of attempts: the installer is not run again
        let installer = FakeInstaller::new(bundle, Ok(InstallOutcome::Completed));
        let supervisor = Supervisor::new(options(dir.path()), installer.clone());
        supervisor.start().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(installer.calls(), 0);
        assert_eq!(supervisor.status().attempts(), 3);
        assert!(!supervisor.route().is_privileged());
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_awaiting_approval() {
        let dir = tempdir().unwrap();
        let installer = FakeInstaller::new(
            Some(dir.path().join("helper.bundle")),
            Ok(InstallOutcome::AwaitingApproval),
        );
        let supervisor = Supervisor::new(options(dir.path()), installer);

        supervisor.start().await;
        let status = wait_for_status(&supervisor, |s| {
            *s == InstallationStatus::AwaitingApproval
        })
        .await;
        assert_eq!(status, InstallationStatus::AwaitingApproval);
        assert!(!supervisor.route().is_privileged());

        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_completed_install_without_reachable_helper() {
        let dir = tempdir().unwrap();
        let installer = FakeInstaller::new(
            Some(dir.path().join("helper.bundle")),
            Ok(InstallOutcome::Completed),
        );
        let supervisor = Supervisor::new(options(dir.path()), installer);

        supervisor.start().await;
        let status = wait_for_status(&supervisor, |s| {
            matches!(s, InstallationStatus::Failed { .. })
        })
        .await;
        assert_eq!(status.attempts(), 1);
        assert!(!supervisor.route().is_privileged());

        supervisor.stop().await;
    }
}

// ============================================================================
// Privileged route
// ============================================================================

mod routing {
    use super::*;

    #[tokio::test]
    async fn test_installed_helper_is_adopted_at_start() {
        let dir = tempdir().unwrap();
        let helper = start_server(
            server_options(&dir.path().join("helper.sock")),
            SlowHandler::new(Duration::ZERO),
        )
        .await;
        InstallationStore::new(dir.path().join("installation.json"))
            .save(&InstallationStatus::Completed)
            .await
            .unwrap();

        let installer = FakeInstaller::new(
            Some(dir.path().join("helper.bundle")),
            Ok(InstallOutcome::Completed),
        );
        let supervisor = Supervisor::new(options(dir.path()), installer.clone());
        supervisor.start().await;
        with_timeout(DEFAULT_TEST_TIMEOUT, supervisor.settled())
            .await
            .unwrap();

        assert!(supervisor.route().is_privileged());
        assert_eq!(supervisor.route().name(), "privileged");
        assert_eq!(supervisor.status(), InstallationStatus::Completed);
        assert_eq!(installer.calls(), 0);

        supervisor.stop().await;
        assert!(!supervisor.route().is_privileged());
        helper.stop().await;
    }

    #[tokio::test]
    async fn test_fresh_install_switches_route() {
        let dir = tempdir().unwrap();
        let helper = start_server(
            server_options(&dir.path().join("helper.sock")),
            SlowHandler::new(Duration::ZERO),
        )
        .await;
        let installer = FakeInstaller::new(
            Some(dir.path().join("helper.bundle")),
            Ok(InstallOutcome::Completed),
        );
        let supervisor = Supervisor::new(options(dir.path()), installer);
        let mut routes = supervisor.routes();

        supervisor.start().await;
        with_timeout(DEFAULT_TEST_TIMEOUT, routes.wait_for(|r| r.is_privileged()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(supervisor.status(), InstallationStatus::Completed);

        supervisor.stop().await;
        helper.stop().await;
    }

    #[tokio::test]
    async fn test_helper_loss_falls_back() {
        let dir = tempdir().unwrap();
        let helper = start_server(
            server_options(&dir.path().join("helper.sock")),
            SlowHandler::new(Duration::ZERO),
        )
        .await;
        InstallationStore::new(dir.path().join("installation.json"))
            .save(&InstallationStatus::Completed)
            .await
            .unwrap();
        let installer = FakeInstaller::new(
            Some(dir.path().join("helper.bundle")),
            Ok(InstallOutcome::Completed),
        );
        let supervisor = Supervisor::new(options(dir.path()), installer);
        supervisor.start().await;
        with_timeout(DEFAULT_TEST_TIMEOUT, supervisor.settled())
            .await
            .unwrap();
        assert!(supervisor.route().is_privileged());

        let mut routes = supervisor.routes();
        helper.stop().await;
        with_timeout(DEFAULT_TEST_TIMEOUT, routes.wait_for(|r| !r.is_privileged()))
            .await
            .unwrap()
            .unwrap();

        // Reconnect attempts run out while the helper stays down
        let status = wait_for_status(&supervisor, |s| {
            matches!(s, InstallationStatus::Failed { .. })
        })
        .await;
        assert!(matches!(status, InstallationStatus::Failed { .. }));
        assert!(!supervisor.route().is_privileged());

        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_route_watchers_share_one_channel() {
        let dir = tempdir().unwrap();
        let helper = start_server(
            server_options(&dir.path().join("helper.sock")),
            SlowHandler::new(Duration::ZERO),
        )
        .await;
        InstallationStore::new(dir.path().join("installation.json"))
            .save(&InstallationStatus::Completed)
            .await
            .unwrap();
        let supervisor = Supervisor::new(
            options(dir.path()),
            FakeInstaller::new(
                Some(dir.path().join("helper.bundle")),
                Ok(InstallOutcome::Completed),
            ),
        );
        supervisor.start().await;
        with_timeout(DEFAULT_TEST_TIMEOUT, supervisor.settled())
            .await
            .unwrap();

        let a = supervisor.route();
        let b = supervisor.routes().borrow().clone();
        assert!(a.same_channel(&b));
        assert!(!a.same_channel(&Route::Fallback));

        supervisor.stop().await;
        helper.stop().await;
    }

    #[tokio::test]
    async fn test_start_does_not_wait_for_a_silent_helper() {
        let dir = tempdir().unwrap();
        let listener = tokio::net::UnixListener::bind(dir.path().join("helper.sock")).unwrap();
        // Accepts connections and never answers
        let silent = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        InstallationStore::new(dir.path().join("installation.json"))
            .save(&InstallationStatus::Completed)
            .await
            .unwrap();

        let mut options = options(dir.path());
        options.client = client_options(Duration::from_millis(300));
        let supervisor = Supervisor::new(
            options,
            FakeInstaller::new(
                Some(dir.path().join("helper.bundle")),
                Err("exit status 1".to_string()),
            ),
        );

        let started = tokio::time::Instant::now();
        supervisor.start().await;
        assert!(started.elapsed() < Duration::from_millis(100));
        assert!(!supervisor.route().is_privileged());

        // The health check times out in the background
        with_timeout(DEFAULT_TEST_TIMEOUT, supervisor.settled())
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(!supervisor.route().is_privileged());

        supervisor.stop().await;
        silent.abort();
    }
}
