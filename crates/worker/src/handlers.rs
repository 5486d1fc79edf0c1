use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use taskflow::worker::{ExecError, ExecutorRegistry, HandlerOptions};

#[derive(Deserialize)]
struct EmailSendParams {
    user_id: i64,
    template: Option<String>,
}

#[derive(Deserialize)]
struct SleepParams {
    #[serde(default)]
    ms: u64,
}

fn parse_params<T: for<'de> Deserialize<'de>>(params: Value) -> Result<T, ExecError> {
    Ok(serde_json::from_value(params)?)
}

pub fn build_registry() -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();

    // Demo executors. Replace these with real ones.
    registry.register_fn_with_options(
        "demo_ok",
        |params: Value| async move {
            let p: SleepParams = parse_params(params)?;
            tokio::time::sleep(Duration::from_millis(p.ms.max(100))).await;
            Ok(json!({ "slept_ms": p.ms.max(100) }))
        },
        HandlerOptions::new().timeout(Duration::from_secs(5)),
    );

    registry.register_fn("fail_me", |_params: Value| async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Err(ExecError::new("simulated failure"))
    });

    registry.register_fn_with_options(
        "email_send",
        |params: Value| async move {
            let p: EmailSendParams = parse_params(params)?;
            let template = p.template.unwrap_or_else(|| "default".to_string());
            Ok(json!({ "user_id": p.user_id, "template": template, "queued": true }))
        },
        HandlerOptions::new()
            .max_concurrency(50)
            .timeout(Duration::from_secs(10)),
    );

    registry
}
