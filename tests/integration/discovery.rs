#[path = "common/mod.rs"]
mod common;

#[cfg(unix)]
mod unix {
    use std::{
        process::{Child, Command},
        sync::{
            Arc, Mutex,
            atomic::{AtomicBool, Ordering},
        },
        time::Duration,
    };

    use lillia::{
        discovery::{DiscoveryLoop, DiscoverySettings},
        rpc::ControlPlaneClient,
        target::{Identity, TargetMonitor},
    };
    use serde_json::{Value, json};

    use super::common::{FakeControlPlane, wait_until};

    const FAST: DiscoverySettings = DiscoverySettings {
        retry_delay: Duration::from_millis(50),
        identity_max_attempts: 120,
    };

    struct Sleeper(Child);

    impl Sleeper {
        fn spawn() -> Self {
            Self(
                Command::new("sleep")
                    .arg("30")
                    .spawn()
                    .expect("failed to spawn sleep"),
            )
        }

        fn pid(&self) -> u32 {
            self.0.id()
        }
    }

    impl Drop for Sleeper {
        fn drop(&mut self) {
            let _ = self.0.kill();
            let _ = self.0.wait();
        }
    }

    fn client_for(fake: &FakeControlPlane) -> ControlPlaneClient {
        ControlPlaneClient::new(fake.port(), Duration::from_secs(2)).expect("client")
    }

    #[test]
    fn discovers_pid_then_identity_and_finishes() {
        let target_process = Sleeper::spawn();
        let pid = target_process.pid();
        let fake = FakeControlPlane::start(move |func, prior| match func {
            "getProcessInfo" => json!({ "pid": pid }),
            "getSelfInfo" if prior == 0 => json!({ "uin": "10001" }),
            "getSelfInfo" => json!({ "uin": "10001", "nickName": "lily" }),
            _ => Value::Null,
        });

        let target = TargetMonitor::new();
        let seen: Arc<Mutex<Vec<Identity>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        target.set_identity_callback(move |identity| sink.lock().unwrap().push(identity.clone()));

        let mut discovery = DiscoveryLoop::spawn(target.clone(), client_for(&fake), || true, FAST);
        assert!(wait_until(Duration::from_secs(10), || discovery.is_finished()));

        let info = target.snapshot();
        assert_eq!(info.pid, Some(pid));
        assert_eq!(info.account_id.as_deref(), Some("10001"));
        assert_eq!(info.display_name.as_deref(), Some("lily"));
        assert!(info.identity_complete());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1, "callback fires once per account: {seen:?}");
        assert_eq!(seen[0].account_id, "10001");
        assert_eq!(fake.calls("getSelfInfo"), 2);

        assert!(discovery.stop(Duration::from_secs(1)));
    }

    #[test]
    fn ends_when_control_plane_stops_running() {
        let fake = FakeControlPlane::start(|_, _| Value::Null);
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);

        let mut discovery = DiscoveryLoop::spawn(
            TargetMonitor::new(),
            client_for(&fake),
            move || flag.load(Ordering::SeqCst),
            FAST,
        );
        assert!(wait_until(Duration::from_secs(5), || fake.calls("getSelfInfo") >= 2));
        assert!(!discovery.is_finished());

        running.store(false, Ordering::SeqCst);
        assert!(wait_until(Duration::from_secs(5), || discovery.is_finished()));
        assert!(discovery.stop(Duration::from_secs(1)));
    }

    #[test]
    fn identity_attempts_are_capped_while_pid_polling_continues() {
        let fake = FakeControlPlane::start(|func, _| match func {
            "getSelfInfo" => json!({ "uin": "0" }),
            _ => json!({ "pid": 0 }),
        });
        let settings = DiscoverySettings {
            retry_delay: Duration::from_millis(20),
            identity_max_attempts: 3,
        };

        let mut discovery =
            DiscoveryLoop::spawn(TargetMonitor::new(), client_for(&fake), || true, settings);
        assert!(wait_until(Duration::from_secs(5), || fake.calls("getProcessInfo") >= 8));

        assert_eq!(fake.calls("getSelfInfo"), 3);
        assert!(!discovery.is_finished());
        assert!(discovery.stop(Duration::from_secs(2)));
        assert!(discovery.is_finished());
    }

    #[test]
    fn refresh_learns_pid_and_client_version() {
        let target_process = Sleeper::spawn();
        let pid = target_process.pid();
        let fake = FakeControlPlane::start(move |func, _| match func {
            "getProcessInfo" => json!({ "pid": pid }),
            "getDeviceInfo" => json!({ "devType": "Linux", "buildVer": "9.9.19-34740" }),
            _ => Value::Null,
        });

        let target = TargetMonitor::new();
        target.attach_client(client_for(&fake));

        target.refresh();
        let info = target.snapshot();
        assert_eq!(info.pid, Some(pid));
        assert_eq!(info.client_version.as_deref(), Some("9.9.19-34740"));

        // The version is fetched once per session; the next refresh samples the PID.
        target.refresh();
        assert_eq!(fake.calls("getDeviceInfo"), 1);
        assert_eq!(target.pid(), Some(pid));
        assert!(target.snapshot().memory_mb > 0.0);
    }
}
