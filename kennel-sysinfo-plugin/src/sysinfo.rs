//! System information module.

use kennel_plugin_sdk::prelude::*;
use kennel_plugin_sdk::Logger;
use serde_json::json;
use std::time::{Duration, Instant};

pub const DEFAULT_GREETING: &str = "Hello from Rust!";
pub const DEFAULT_ECHO_LIMIT: i64 = 4096;

pub struct SysinfoPlugin {
    greeting: String,
    echo_limit: usize,
    started_at: Instant,
    log: Logger,
}

impl Default for SysinfoPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl SysinfoPlugin {
    pub fn new() -> Self {
        Self {
            greeting: DEFAULT_GREETING.to_string(),
            echo_limit: DEFAULT_ECHO_LIMIT as usize,
            started_at: Instant::now(),
            log: Logger::new("sysinfo"),
        }
    }

    fn hello(&self, request: Request) -> Response {
        let mut data = JsonMap::new();
        data.insert("message".into(), json!(self.greeting));
        Response::success(request.id, data)
    }

    fn echo(&self, request: Request) -> Response {
        let message = request
            .params
            .get("message")
            .and_then(|value| value.as_str())
            .unwrap_or_default();
        let echoed: String = message.chars().take(self.echo_limit).collect();
        let truncated = echoed.len() < message.len();

        let mut data = JsonMap::new();
        data.insert("message".into(), json!(echoed));
        data.insert("truncated".into(), json!(truncated));
        Response::success(request.id, data)
    }

    fn system_info(&self, request: Request) -> Response {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        let mut data = JsonMap::new();
        data.insert("os".into(), json!(std::env::consts::OS));
        data.insert("arch".into(), json!(std::env::consts::ARCH));
        data.insert("family".into(), json!(std::env::consts::FAMILY));
        data.insert("cpus".into(), json!(cpus));
        data.insert("pid".into(), json!(std::process::id()));
        data.insert(
            "uptime_seconds".into(),
            json!(self.started_at.elapsed().as_secs_f64()),
        );
        Response::success(request.id, data)
    }
}

#[async_trait]
impl Module for SysinfoPlugin {
    async fn init(&mut self, config: ModuleConfig) -> Result<(), ModuleError> {
        self.greeting = config.get_string("greeting", DEFAULT_GREETING);
        let limit = config.get_int("echo_limit", DEFAULT_ECHO_LIMIT);
        self.echo_limit = usize::try_from(limit).map_err(|_| {
            ModuleError::invalid_config(format!("echo_limit must not be negative, got {}", limit))
        })?;

        self.log = self.log.with(&[("echo_limit", json!(self.echo_limit))]);
        self.log.info("initialized", &[("greeting", json!(self.greeting))]);
        Ok(())
    }

    async fn start(&mut self) -> Result<(), ModuleError> {
        self.started_at = Instant::now();
        self.log.info("started", &[]);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), ModuleError> {
        let uptime = self.started_at.elapsed().as_secs_f64();
        self.log.info("stopped", &[("uptime_seconds", json!(uptime))]);
        Ok(())
    }

    fn info(&self) -> ModuleInfo {
        ModuleInfo::new("sysinfo", "System Info", env!("CARGO_PKG_VERSION"))
            .description("Reports information about the host system")
            .author("Kennel Team")
            .license("MIT")
            .capability("sysinfo")
            .capability("echo")
            .platform("linux")
            .platform("darwin")
            .platform("windows")
    }

    async fn handle_request(&mut self, request: Request) -> Result<Response, ModuleError> {
        self.log
            .debug("handling request", &[("action", json!(request.action))]);

        let response = match request.action.as_str() {
            "hello" => self.hello(request),
            "echo" => self.echo(request),
            "get_system_info" => self.system_info(request),
            other => {
                let message = format!("unknown action: {}", other);
                Response::failure(request.id, "unknown_action", message)
            }
        };
        Ok(response)
    }

    async fn handle_event(&mut self, event: Event) -> Result<bool, ModuleError> {
        let handled = matches!(event.event_type.as_str(), "system.startup" | "system.shutdown");
        if handled {
            self.log.info(
                "handled event",
                &[("type", json!(event.event_type)), ("source", json!(event.source))],
            );
        } else {
            self.log
                .warn("unhandled event type", &[("type", json!(event.event_type))]);
        }
        Ok(handled)
    }

    async fn check_health(&mut self, uptime: Duration) -> Result<HealthStatus, ModuleError> {
        Ok(HealthStatus::healthy(uptime).detail("pid", std::process::id()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn config(value: Value) -> ModuleConfig {
        match value {
            Value::Object(map) => ModuleConfig::new(map),
            _ => panic!("config must be an object"),
        }
    }

    async fn initialized(settings: Value) -> SysinfoPlugin {
        let mut plugin = SysinfoPlugin::new();
        plugin.init(config(settings)).await.unwrap();
        plugin.start().await.unwrap();
        plugin
    }

    #[tokio::test]
    async fn test_hello_uses_configured_greeting() {
        let mut plugin = initialized(json!({"greeting": "Hi there"})).await;
        let response = plugin.handle_request(Request::new("1", "hello")).await.unwrap();

        assert!(response.success);
        assert_eq!(response.data.unwrap()["message"], json!("Hi there"));
    }

    #[tokio::test]
    async fn test_hello_default_greeting() {
        let mut plugin = initialized(json!({})).await;
        let response = plugin.handle_request(Request::new("1", "hello")).await.unwrap();
        assert_eq!(response.data.unwrap()["message"], json!(DEFAULT_GREETING));
    }

    #[tokio::test]
    async fn test_echo_truncates_by_characters() {
        let mut plugin = initialized(json!({"echo_limit": "3"})).await;
        let request = Request::new("2", "echo").param("message", "héllo");
        let data = plugin.handle_request(request).await.unwrap().data.unwrap();

        assert_eq!(data["message"], json!("hél"));
        assert_eq!(data["truncated"], json!(true));
    }

    #[tokio::test]
    async fn test_echo_without_message() {
        let mut plugin = initialized(json!({})).await;
        let data = plugin
            .handle_request(Request::new("3", "echo"))
            .await
            .unwrap()
            .data
            .unwrap();
        assert_eq!(data["message"], json!(""));
        assert_eq!(data["truncated"], json!(false));
    }

    #[tokio::test]
    async fn test_negative_echo_limit_rejected() {
        let mut plugin = SysinfoPlugin::new();
        let err = plugin.init(config(json!({"echo_limit": -1}))).await.unwrap_err();
        assert_eq!(err.code(), "invalid_config");
    }

    #[tokio::test]
    async fn test_system_info_fields() {
        let mut plugin = initialized(json!({})).await;
        let data = plugin
            .handle_request(Request::new("4", "get_system_info"))
            .await
            .unwrap()
            .data
            .unwrap();

        assert_eq!(data["os"], json!(std::env::consts::OS));
        assert_eq!(data["pid"], json!(std::process::id()));
        assert!(data["cpus"].as_u64().unwrap() >= 1);
        assert!(data["uptime_seconds"].as_f64().unwrap() >= 0.0);
    }

    #[tokio::test]
    async fn test_unknown_action_fails() {
        let mut plugin = initialized(json!({})).await;
        let response = plugin.handle_request(Request::new("5", "dance")).await.unwrap();

        assert!(!response.success);
        assert_eq!(response.id, "5");
        assert_eq!(response.error.unwrap().code, "unknown_action");
    }

    #[tokio::test]
    async fn test_system_events_are_acknowledged() {
        let mut plugin = initialized(json!({})).await;
        assert!(plugin
            .handle_event(Event::new("e1", "system.startup", "host"))
            .await
            .unwrap());
        assert!(plugin
            .handle_event(Event::new("e2", "system.shutdown", "host"))
            .await
            .unwrap());
        assert!(!plugin
            .handle_event(Event::new("e3", "user.login", "host"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_health_includes_pid() {
        let mut plugin = initialized(json!({})).await;
        let status = plugin.check_health(Duration::from_secs(2)).await.unwrap();

        assert_eq!(status.status, HealthState::Healthy);
        assert_eq!(status.details["uptime"], json!(2.0));
        assert_eq!(status.details["pid"], json!(std::process::id()));
    }
}
