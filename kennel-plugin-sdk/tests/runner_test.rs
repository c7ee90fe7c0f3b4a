//! In-process tests for the runner harness.
//!
//! The runner is driven over in-memory pipes; the test plays the host.

use async_trait::async_trait;
use kennel_plugin_sdk::prelude::*;
use kennel_plugin_sdk::{
    CommandEnvelope, InboundFrame, Runner, RunnerConfig, RunnerError, ShutdownCoordinator,
    ShutdownTrigger, MAX_LINE_BYTES,
};
use serde_json::{json, Value};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines,
    ReadBuf,
};
use tokio::task::JoinHandle;

#[derive(Default)]
struct Calls {
    init: AtomicUsize,
    start: AtomicUsize,
    stop: AtomicUsize,
}

struct TestModule {
    calls: Arc<Calls>,
    fail_init: bool,
    greeting: String,
}

impl TestModule {
    fn new(calls: Arc<Calls>) -> Self {
        Self {
            calls,
            fail_init: false,
            greeting: String::new(),
        }
    }
}

#[async_trait]
impl Module for TestModule {
    async fn init(&mut self, config: ModuleConfig) -> Result<(), ModuleError> {
        self.calls.init.fetch_add(1, Ordering::SeqCst);
        if self.fail_init {
            return Err(ModuleError::invalid_config("missing api key"));
        }
        self.greeting = config.get_string("greeting", "Hello from Python!");
        Ok(())
    }

    async fn start(&mut self) -> Result<(), ModuleError> {
        self.calls.start.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), ModuleError> {
        self.calls.stop.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn info(&self) -> ModuleInfo {
        ModuleInfo::new("test-module", "Test Module", "1.0.0").capability("test")
    }

    async fn handle_request(&mut self, request: Request) -> Result<Response, ModuleError> {
        match request.action.as_str() {
            "hello" => {
                let mut data = JsonMap::new();
                data.insert("message".into(), json!(self.greeting));
                Ok(Response::success(request.id, data))
            }
            "slow" => {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(Response::success(request.id, JsonMap::new()))
            }
            "panic" => panic!("handler blew up"),
            "mixed" => {
                let mut response = Response::success(request.id, JsonMap::new());
                response.success = false;
                Ok(response)
            }
            other => Ok(Response::failure(
                request.id,
                "unknown_action",
                format!("unknown action: {}", other),
            )),
        }
    }

    async fn handle_event(&mut self, event: Event) -> Result<bool, ModuleError> {
        Ok(event.event_type == "system.startup")
    }
}

struct Harness {
    input: DuplexStream,
    output: Lines<BufReader<DuplexStream>>,
    shutdown: ShutdownCoordinator,
    task: JoinHandle<Result<ShutdownTrigger, RunnerError>>,
}

impl Harness {
    fn spawn(module: TestModule) -> Self {
        let (input, plugin_stdin) = tokio::io::duplex(64 * 1024);
        let (plugin_stdout, output) = tokio::io::duplex(64 * 1024);

        let runner = Runner::new(module, RunnerConfig::new("plugin-1", ModuleConfig::default()));
        let shutdown = runner.shutdown_handle();
        let task = tokio::spawn(runner.run(BufReader::new(plugin_stdin), plugin_stdout));

        Self {
            input,
            output: BufReader::new(output).lines(),
            shutdown,
            task,
        }
    }

    /// Spawn and consume the readiness frame
    async fn ready(module: TestModule) -> Self {
        let mut harness = Self::spawn(module);
        let line = harness.next_line().await.expect("ready frame");
        assert!(line.starts_with("KENNEL_PLUGIN_READY:"), "got {}", line);
        harness
    }

    async fn send(&mut self, line: &str) {
        let line = format!("{}\n", line);
        self.input.write_all(line.as_bytes()).await.unwrap();
    }

    async fn next_line(&mut self) -> Option<String> {
        tokio::time::timeout(Duration::from_secs(5), self.output.next_line())
            .await
            .expect("timed out waiting for output")
            .unwrap()
    }

    async fn finish(
        self,
    ) -> (
        Result<ShutdownTrigger, RunnerError>,
        Lines<BufReader<DuplexStream>>,
    ) {
        let result = tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("runner did not finish")
            .unwrap();
        (result, self.output)
    }
}

/// Input that fails on every read
struct BrokenInput;

impl AsyncRead for BrokenInput {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "host went away")))
    }
}

fn payload(line: &str, tag: &str) -> Value {
    let json = line
        .strip_prefix(tag)
        .and_then(|rest| rest.strip_prefix(':'))
        .unwrap_or_else(|| panic!("expected {} frame, got {}", tag, line));
    serde_json::from_str(json).unwrap()
}

#[tokio::test]
async fn test_ready_frame_announces_module() {
    let calls = Arc::new(Calls::default());
    let mut harness = Harness::spawn(TestModule::new(calls.clone()));

    let line = harness.next_line().await.unwrap();
    let ready = payload(&line, "KENNEL_PLUGIN_READY");
    assert_eq!(ready["status"], json!("ready"));
    assert_eq!(ready["plugin_id"], json!("plugin-1"));
    assert_eq!(ready["info"]["id"], json!("test-module"));
    assert_eq!(ready["info"]["capabilities"], json!(["test"]));
    assert_eq!(ready["info"]["language"], json!("rust"));

    assert_eq!(calls.init.load(Ordering::SeqCst), 1);
    assert_eq!(calls.start.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_request_produces_exact_response_line() {
    let mut harness = Harness::ready(TestModule::new(Arc::default())).await;

    harness
        .send(r#"KENNEL_COMMAND:{"type":"request","data":{"id":"1","action":"hello"}}"#)
        .await;

    assert_eq!(
        harness.next_line().await.unwrap(),
        r#"KENNEL_RESPONSE:{"id":"1","success":true,"data":{"message":"Hello from Python!"},"metadata":{}}"#
    );
}

#[tokio::test]
async fn test_stop_frame_stops_once_and_ends_output() {
    let calls = Arc::new(Calls::default());
    let mut harness = Harness::ready(TestModule::new(calls.clone())).await;

    harness.send("KENNEL_STOP").await;
    let (result, mut output) = harness.finish().await;

    assert_eq!(result.unwrap(), ShutdownTrigger::StopFrame);
    assert_eq!(calls.stop.load(Ordering::SeqCst), 1);
    assert_eq!(output.next_line().await.unwrap(), None);
}

#[tokio::test]
async fn test_commands_after_stop_are_not_processed() {
    let calls = Arc::new(Calls::default());
    let mut harness = Harness::ready(TestModule::new(calls.clone())).await;

    harness
        .send(concat!(
            "KENNEL_STOP\n",
            r#"KENNEL_COMMAND:{"type":"request","data":{"id":"late","action":"hello"}}"#
        ))
        .await;
    let (result, mut output) = harness.finish().await;

    assert_eq!(result.unwrap(), ShutdownTrigger::StopFrame);
    assert_eq!(output.next_line().await.unwrap(), None);
}

#[tokio::test]
async fn test_health_check_reports_uptime() {
    let mut harness = Harness::ready(TestModule::new(Arc::default())).await;

    harness
        .send(r#"KENNEL_COMMAND:{"type":"health_check","data":{}}"#)
        .await;
    let first = payload(&harness.next_line().await.unwrap(), "KENNEL_HEALTH_RESPONSE");

    tokio::time::sleep(Duration::from_millis(20)).await;
    harness
        .send(r#"KENNEL_COMMAND:{"type":"health_check","data":{}}"#)
        .await;
    let second = payload(&harness.next_line().await.unwrap(), "KENNEL_HEALTH_RESPONSE");

    assert_eq!(first["status"], json!("healthy"));
    assert!(first["timestamp"].as_i64().unwrap() > 0);

    let a = first["details"]["uptime"].as_f64().unwrap();
    let b = second["details"]["uptime"].as_f64().unwrap();
    assert!(a >= 0.0);
    assert!(b > a);
}

#[tokio::test]
async fn test_init_failure_reports_plugin_error() {
    let calls = Arc::new(Calls::default());
    let mut module = TestModule::new(calls.clone());
    module.fail_init = true;
    let mut harness = Harness::spawn(module);

    let line = harness.next_line().await.unwrap();
    let failure = payload(&line, "KENNEL_PLUGIN_ERROR");
    assert_eq!(failure["status"], json!("error"));
    assert_eq!(failure["plugin_id"], json!("plugin-1"));
    assert!(failure["error"].as_str().unwrap().contains("missing api key"));

    let (result, mut output) = harness.finish().await;
    assert!(matches!(result, Err(RunnerError::Startup(_))));
    assert_eq!(output.next_line().await.unwrap(), None);

    assert_eq!(calls.init.load(Ordering::SeqCst), 1);
    assert_eq!(calls.start.load(Ordering::SeqCst), 0);
    assert_eq!(calls.stop.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unknown_command_type_keeps_loop_alive() {
    let mut harness = Harness::ready(TestModule::new(Arc::default())).await;

    harness.send(r#"KENNEL_COMMAND:{"type":"foo","data":{}}"#).await;
    let error = payload(&harness.next_line().await.unwrap(), "KENNEL_ERROR");
    assert!(error["error"].as_str().unwrap().contains("foo"));

    harness
        .send(r#"KENNEL_COMMAND:{"type":"request","data":{"id":"2","action":"hello"}}"#)
        .await;
    let response = payload(&harness.next_line().await.unwrap(), "KENNEL_RESPONSE");
    assert_eq!(response["id"], json!("2"));
}

#[tokio::test]
async fn test_malformed_json_yields_one_error() {
    let mut harness = Harness::ready(TestModule::new(Arc::default())).await;

    harness.send("KENNEL_COMMAND:{not-json}").await;
    harness
        .send(r#"KENNEL_COMMAND:{"type":"request","data":{"id":"3","action":"hello"}}"#)
        .await;

    let first = harness.next_line().await.unwrap();
    assert!(first.starts_with("KENNEL_ERROR:"), "got {}", first);
    let second = harness.next_line().await.unwrap();
    assert!(second.starts_with("KENNEL_RESPONSE:"), "got {}", second);
}

#[tokio::test]
async fn test_blank_and_stray_lines_are_ignored() {
    let mut harness = Harness::ready(TestModule::new(Arc::default())).await;

    harness.send("").await;
    harness.send("some debugging output").await;
    harness
        .send(r#"KENNEL_COMMAND:{"type":"request","data":{"id":"4","action":"hello"}}"#)
        .await;

    let response = payload(&harness.next_line().await.unwrap(), "KENNEL_RESPONSE");
    assert_eq!(response["id"], json!("4"));
}

#[tokio::test]
async fn test_event_ack_carries_id_and_result() {
    let mut harness = Harness::ready(TestModule::new(Arc::default())).await;

    harness
        .send(r#"KENNEL_COMMAND:{"type":"event","data":{"id":"e1","type":"system.startup","source":"host"}}"#)
        .await;
    harness
        .send(r#"KENNEL_COMMAND:{"type":"event","data":{"id":"e2","type":"user.login"}}"#)
        .await;

    assert_eq!(
        harness.next_line().await.unwrap(),
        r#"KENNEL_EVENT_RESPONSE:{"event_id":"e1","success":true}"#
    );
    assert_eq!(
        harness.next_line().await.unwrap(),
        r#"KENNEL_EVENT_RESPONSE:{"event_id":"e2","success":false}"#
    );
}

#[tokio::test]
async fn test_every_request_gets_one_response_with_its_id() {
    let mut harness = Harness::ready(TestModule::new(Arc::default())).await;
    let ids = ["a", "", "42", "with space", "ünïcode"];

    for id in ids {
        let request = Request::new(id, "hello");
        let envelope = CommandEnvelope::request(&request).unwrap();
        harness
            .send(&InboundFrame::Command(envelope).encode().unwrap())
            .await;
    }
    for id in ids {
        let response = payload(&harness.next_line().await.unwrap(), "KENNEL_RESPONSE");
        assert_eq!(response["id"], json!(id));
    }
}

#[tokio::test]
async fn test_handler_failure_is_a_failed_response() {
    let mut harness = Harness::ready(TestModule::new(Arc::default())).await;

    harness
        .send(r#"KENNEL_COMMAND:{"type":"request","data":{"id":"5","action":"dance"}}"#)
        .await;
    let response = payload(&harness.next_line().await.unwrap(), "KENNEL_RESPONSE");

    assert_eq!(response["success"], json!(false));
    assert_eq!(response["error"]["code"], json!("unknown_action"));
    assert!(response.get("data").is_none());
}

#[tokio::test]
async fn test_handler_panic_becomes_error_frame() {
    let calls = Arc::new(Calls::default());
    let mut harness = Harness::ready(TestModule::new(calls.clone())).await;

    harness
        .send(r#"KENNEL_COMMAND:{"type":"request","data":{"id":"6","action":"panic"}}"#)
        .await;
    let error = payload(&harness.next_line().await.unwrap(), "KENNEL_ERROR");
    assert!(error["error"].as_str().unwrap().contains("handler blew up"));

    harness
        .send(r#"KENNEL_COMMAND:{"type":"request","data":{"id":"7","action":"hello"}}"#)
        .await;
    let response = payload(&harness.next_line().await.unwrap(), "KENNEL_RESPONSE");
    assert_eq!(response["id"], json!("7"));

    harness.send("KENNEL_STOP").await;
    let (result, _) = harness.finish().await;
    assert!(result.is_ok());
    assert_eq!(calls.stop.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_end_of_input_stops_gracefully() {
    let calls = Arc::new(Calls::default());
    let mut harness = Harness::ready(TestModule::new(calls.clone())).await;

    harness.input.shutdown().await.unwrap();
    let (result, _) = harness.finish().await;

    assert_eq!(result.unwrap(), ShutdownTrigger::EndOfStream);
    assert_eq!(calls.stop.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_signal_while_idle_stops_gracefully() {
    let calls = Arc::new(Calls::default());
    let harness = Harness::ready(TestModule::new(calls.clone())).await;

    assert!(harness.shutdown.request(ShutdownTrigger::Signal("SIGTERM")));
    let (result, _) = harness.finish().await;

    assert_eq!(result.unwrap(), ShutdownTrigger::Signal("SIGTERM"));
    assert_eq!(calls.stop.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_signal_during_request_drops_its_response() {
    let calls = Arc::new(Calls::default());
    let mut harness = Harness::ready(TestModule::new(calls.clone())).await;

    harness
        .send(r#"KENNEL_COMMAND:{"type":"request","data":{"id":"8","action":"slow"}}"#)
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    harness.shutdown.request(ShutdownTrigger::Signal("SIGTERM"));

    let (result, mut output) = harness.finish().await;
    assert_eq!(result.unwrap(), ShutdownTrigger::Signal("SIGTERM"));
    assert_eq!(output.next_line().await.unwrap(), None);
    assert_eq!(calls.stop.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_stop_frame_and_signal_stop_once() {
    for _ in 0..20 {
        let calls = Arc::new(Calls::default());
        let mut harness = Harness::ready(TestModule::new(calls.clone())).await;

        let shutdown = harness.shutdown.clone();
        let signal = tokio::spawn(async move {
            shutdown.request(ShutdownTrigger::Signal("SIGTERM"));
        });
        // the runner may already be gone and have closed its end
        let _ = harness.input.write_all(b"KENNEL_STOP\n").await;
        signal.await.unwrap();

        let (result, _) = harness.finish().await;
        let trigger = result.unwrap();
        assert!(
            trigger == ShutdownTrigger::StopFrame || trigger == ShutdownTrigger::Signal("SIGTERM"),
            "unexpected trigger {:?}",
            trigger
        );
        assert_eq!(calls.stop.load(Ordering::SeqCst), 1);
    }
}

#[tokio::test]
async fn test_oversized_line_yields_one_error() {
    let mut harness = Harness::ready(TestModule::new(Arc::default())).await;

    let huge = format!("KENNEL_COMMAND:{}", "x".repeat(MAX_LINE_BYTES + 16));
    harness.send(&huge).await;
    harness
        .send(r#"KENNEL_COMMAND:{"type":"request","data":{"id":"big","action":"hello"}}"#)
        .await;

    let error = payload(&harness.next_line().await.unwrap(), "KENNEL_ERROR");
    assert!(error["error"].as_str().unwrap().contains("exceeds"));
    let response = payload(&harness.next_line().await.unwrap(), "KENNEL_RESPONSE");
    assert_eq!(response["id"], json!("big"));
}

#[tokio::test]
async fn test_read_error_stops_gracefully() {
    let calls = Arc::new(Calls::default());
    let runner = Runner::new(
        TestModule::new(calls.clone()),
        RunnerConfig::new("plugin-1", ModuleConfig::default()),
    );

    let input = format!(
        "{}\n",
        r#"KENNEL_COMMAND:{"type":"request","data":{"id":"1","action":"hello"}}"#
    );
    let mut output = Vec::new();
    let reader = BufReader::new(input.as_bytes().chain(BrokenInput));
    let result = runner.run(reader, &mut output).await;

    match result {
        Ok(ShutdownTrigger::StreamError(message)) => assert!(message.contains("host went away")),
        other => panic!("expected stream error, got {:?}", other),
    }
    assert_eq!(calls.stop.load(Ordering::SeqCst), 1);

    let text = String::from_utf8(output).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("KENNEL_PLUGIN_READY:"));
    assert!(lines[1].starts_with("KENNEL_RESPONSE:"));
}

#[tokio::test]
async fn test_invalid_utf8_is_decoded_lossily() {
    let mut harness = Harness::ready(TestModule::new(Arc::default())).await;

    harness.input.write_all(b"\xff\xfe stray bytes\n").await.unwrap();
    harness
        .input
        .write_all(b"KENNEL_COMMAND:{\"type\":\"request\",\"data\":{\"id\":\"u\xff\"}}\n")
        .await
        .unwrap();

    let response = payload(&harness.next_line().await.unwrap(), "KENNEL_RESPONSE");
    assert_eq!(response["id"], json!("u\u{FFFD}"));
}

#[tokio::test]
async fn test_failed_response_never_carries_data() {
    let mut harness = Harness::ready(TestModule::new(Arc::default())).await;

    harness
        .send(r#"KENNEL_COMMAND:{"type":"request","data":{"id":"m","action":"mixed"}}"#)
        .await;
    let response = payload(&harness.next_line().await.unwrap(), "KENNEL_RESPONSE");

    assert_eq!(response["success"], json!(false));
    assert!(response.get("data").is_none());
}
