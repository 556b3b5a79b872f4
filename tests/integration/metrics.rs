#[path = "common/mod.rs"]
mod common;

#[cfg(unix)]
mod unix {
    use std::{
        process::{Child, Command},
        time::Duration,
    };

    use lillia::metrics::{ResourceSample, ResourceSampler, find_pid_by_name, pid_alive, terminate_pid};

    fn spawn_sleeper() -> Child {
        Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("failed to spawn sleep")
    }

    #[test]
    fn live_child_is_sampled_and_dead_child_is_not() {
        let mut child = spawn_sleeper();
        let pid = child.id();
        let mut sampler = ResourceSampler::with_window(Duration::from_millis(20));

        let sample = sampler.sample(pid);
        assert!(sample.alive);
        assert!(sample.memory_mb > 0.0);
        assert!(sample.cpu_percent >= 0.0);
        assert_eq!(sampler.cached_pid(), Some(pid));

        child.kill().expect("failed to kill sleep");
        child.wait().expect("failed to reap sleep");

        assert_eq!(sampler.sample(pid), ResourceSample::default());
        assert_eq!(sampler.cached_pid(), None);
        assert!(!pid_alive(pid));
    }

    #[test]
    fn running_process_is_found_by_name() {
        let mut child = spawn_sleeper();

        let found = find_pid_by_name("SLEEP").expect("sleep should be found");
        assert!(pid_alive(found));
        assert_eq!(find_pid_by_name("lillia-no-such-process-name"), None);
        assert_eq!(find_pid_by_name(""), None);

        let _ = child.kill();
        let _ = child.wait();
    }

    #[test]
    fn terminate_pid_stops_foreign_process() {
        let mut child = spawn_sleeper();
        let pid = child.id();

        assert!(terminate_pid(
            pid,
            Duration::from_millis(500),
            Duration::from_millis(500)
        ));
        child.wait().expect("failed to reap sleep");
        assert!(!pid_alive(pid));

        // Already gone.
        assert!(terminate_pid(pid, Duration::from_millis(50), Duration::from_millis(50)));
    }
}
