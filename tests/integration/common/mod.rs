#![allow(dead_code)]

use std::{
    collections::HashMap,
    io::{BufRead, BufReader, Read, Write},
    net::{Ipv4Addr, TcpListener, TcpStream},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use lillia::{
    config::SupervisorSettings,
    supervisor::{LaunchSpec, ProcessStatus, Supervisor},
    test_utils::write_script,
};
use serde_json::Value;
use sysinfo::{Pid, ProcessStatus as OsProcessStatus, ProcessesToUpdate, System};

/// Settings with shorter stop timeouts so tests finish quickly.
pub fn quick_settings() -> SupervisorSettings {
    SupervisorSettings {
        graceful_stop: Duration::from_millis(500),
        forceful_stop: Duration::from_millis(1000),
        watchdog_interval: Duration::from_millis(200),
        ..SupervisorSettings::default()
    }
}

/// Writes `body` as a shell script and returns a spec running it through `/bin/sh`.
pub fn shell_spec(dir: &Path, name: &str, body: &str) -> LaunchSpec {
    let script = write_script(dir, name, body).expect("failed to write script");
    LaunchSpec::new("/bin/sh").args([script.to_string_lossy().to_string()])
}

pub fn script_path(dir: &Path, name: &str, body: &str) -> PathBuf {
    write_script(dir, name, body).expect("failed to write script")
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(50));
    }
}

pub fn wait_for_status(supervisor: &Supervisor, name: &str, expected: ProcessStatus) {
    let reached = wait_until(Duration::from_secs(5), || {
        supervisor.get_status(name) == expected
    });
    assert!(
        reached,
        "Timed out waiting for '{name}' to become {expected}, still {}",
        supervisor.get_status(name)
    );
}

pub fn is_process_alive(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    system
        .process(Pid::from_u32(pid))
        .is_some_and(|process| process.status() != OsProcessStatus::Zombie)
}

pub fn wait_for_process_exit(pid: u32) {
    assert!(
        wait_until(Duration::from_secs(5), || !is_process_alive(pid)),
        "Timed out waiting for PID {pid} to exit"
    );
}

type Handler = dyn Fn(&str, usize) -> Value + Send + Sync;

/// Minimal HTTP responder standing in for the control plane's RPC endpoint.
///
/// The handler receives the called function name and how many times it has
/// been called before, and returns the `result` value to wrap in an envelope.
pub struct FakeControlPlane {
    port: u16,
    calls: Arc<Mutex<HashMap<String, usize>>>,
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl FakeControlPlane {
    pub fn start<F>(handler: F) -> Self
    where
        F: Fn(&str, usize) -> Value + Send + Sync + 'static,
    {
        let listener =
            TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).expect("failed to bind fake endpoint");
        listener
            .set_nonblocking(true)
            .expect("failed to set nonblocking");
        let port = listener.local_addr().unwrap().port();

        let calls = Arc::new(Mutex::new(HashMap::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let handler: Arc<Handler> = Arc::new(handler);

        let thread_calls = Arc::clone(&calls);
        let thread_stop = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            while !thread_stop.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((stream, _)) => {
                        let _ = serve(stream, handler.as_ref(), &thread_calls);
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(10));
                    }
                    Err(_) => return,
                }
            }
        });

        Self {
            port,
            calls,
            stop,
            handle: Some(handle),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn calls(&self, func: &str) -> usize {
        self.calls.lock().unwrap().get(func).copied().unwrap_or(0)
    }
}

impl Drop for FakeControlPlane {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn serve(
    stream: TcpStream,
    handler: &Handler,
    calls: &Mutex<HashMap<String, usize>>,
) -> std::io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;

    let mut reader = BufReader::new(stream.try_clone()?);
    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':')
            && name.eq_ignore_ascii_case("content-length")
        {
            content_length = value.trim().parse().unwrap_or(0);
        }
    }

    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body)?;
    let request: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let func = request["data"]["func"].as_str().unwrap_or_default().to_string();

    let previous = {
        let mut calls = calls.lock().unwrap();
        let count = calls.entry(func.clone()).or_insert(0);
        let previous = *count;
        *count += 1;
        previous
    };

    let result = handler(&func, previous);
    let response = serde_json::json!({ "type": "call", "data": { "result": result } }).to_string();

    let mut stream = stream;
    write!(
        stream,
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        response.len(),
        response
    )?;
    stream.flush()
}
