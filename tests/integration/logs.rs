#[path = "common/mod.rs"]
mod common;

use std::{io::Cursor, time::Duration};

use lillia::logs::{LogPipeline, StreamKind};

#[test]
fn ring_buffer_keeps_newest_lines_in_order() {
    let logs = LogPipeline::new(1000);
    let text: String = (0..2000).map(|i| format!("line {i}\n")).collect();

    logs.attach_stream("bridge", Cursor::new(text.into_bytes()), StreamKind::Stdout);
    assert!(logs.wait_readers("bridge", Duration::from_secs(5)));

    let entries = logs.get_logs(Some("bridge"));
    assert_eq!(entries.len(), 1000);
    let texts: Vec<String> = entries.iter().map(|entry| entry.text.clone()).collect();
    let expected: Vec<String> = (1000..2000).map(|i| format!("line {i}")).collect();
    assert_eq!(texts, expected);
}

#[test]
fn lossy_decoding_and_line_endings() {
    let logs = LogPipeline::new(10);
    let bytes = b"windows line\r\n\n\xffbroken\nno newline".to_vec();

    logs.attach_stream("bot-runtime", Cursor::new(bytes), StreamKind::Stderr);
    assert!(logs.wait_readers("bot-runtime", Duration::from_secs(5)));

    let texts: Vec<String> = logs
        .get_logs(None)
        .into_iter()
        .map(|entry| entry.text)
        .collect();
    assert_eq!(
        texts,
        vec![
            "windows line".to_string(),
            "\u{fffd}broken".to_string(),
            "no newline".to_string(),
        ]
    );
}

#[cfg(unix)]
mod unix {
    use std::{
        process::{Command, Stdio},
        time::Duration,
    };

    use lillia::logs::{LogPipeline, StreamKind};
    use tempfile::tempdir;

    use super::common::script_path;

    #[test]
    fn captures_both_streams_of_a_child() {
        let temp = tempdir().expect("failed to create tempdir");
        let script = script_path(
            temp.path(),
            "both.sh",
            "for i in 1 2 3; do echo \"out $i\"; echo \"err $i\" >&2; done",
        );

        let mut child = Command::new("/bin/sh")
            .arg(&script)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .expect("failed to spawn child");

        let logs = LogPipeline::new(100);
        logs.attach(
            "bridge",
            child.stdout.take().unwrap(),
            child.stderr.take().unwrap(),
        );
        child.wait().expect("child failed");
        assert!(logs.wait_readers("bridge", Duration::from_secs(5)));

        let entries = logs.get_logs(Some("bridge"));
        let by_stream = |kind: StreamKind| -> Vec<String> {
            entries
                .iter()
                .filter(|entry| entry.stream == kind)
                .map(|entry| entry.text.clone())
                .collect()
        };
        assert_eq!(by_stream(StreamKind::Stdout), vec!["out 1", "out 2", "out 3"]);
        assert_eq!(by_stream(StreamKind::Stderr), vec!["err 1", "err 2", "err 3"]);

        // Every line is handed off exactly once.
        let drained = logs.drain_pending();
        assert_eq!(drained.len(), 6);
        assert!(logs.drain_pending().is_empty());

        logs.clear(Some("bridge"));
        assert!(logs.is_empty());
        assert_eq!(logs.dropped_handoffs(), 0);
    }
}
